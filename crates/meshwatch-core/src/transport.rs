//! Transport abstraction
//!
//! Every frame source/sink (MQTT broker session, serial link, TCP link)
//! implements [`Transport`]. The [`Coordinator`] owns the registered
//! transports and resolves which one an outbound frame goes through.
//!
//! Connections flap; a publish against a momentarily-disconnected transport
//! waits a bounded interval for the link to come back before giving up.

use crate::ingest::SourceKind;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// How many times to poll a disconnected transport before failing.
const CONNECT_POLLS: u32 = 20;
/// Delay between connection polls.
const CONNECT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Default topic root when a transport does not configure one.
pub const DEFAULT_BASE_TOPIC: &str = "msh";

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("no transport available for publish (requested: {0:?})")]
    NoTransport(Option<String>),

    #[error("transport {0} did not connect in time")]
    NotConnected(String),

    #[error("transport {0} does not permit injection")]
    NotPermitted(String),

    #[error("send failed on {interface}: {reason}")]
    Send { interface: String, reason: String },
}

/// One frame source/sink. Implementations own their connection lifecycle;
/// the engine only asks for state and hands over encoded frames.
pub trait Transport: Send + Sync {
    /// Stable identifier, also recorded on store entities as the
    /// interface reference.
    fn id(&self) -> &str;

    fn kind(&self) -> SourceKind;

    fn is_connected(&self) -> bool;

    /// Hand one encoded frame to the underlying link.
    fn send(&self, topic: &str, frame: &[u8]) -> Result<(), TransportError>;

    /// Topic root for publish topics; `None` uses [`DEFAULT_BASE_TOPIC`].
    fn base_topic(&self) -> Option<&str> {
        None
    }

    /// Whether outbound injection through this transport is allowed.
    /// Listen-only taps return false.
    fn allows_injection(&self) -> bool {
        true
    }
}

/// Publish topic for a frame: `<base>/2/e/<channel>/<gateway>`.
pub fn publish_topic(base: &str, channel_name: &str, gateway_id: &str) -> String {
    format!("{base}/2/e/{channel_name}/{gateway_id}")
}

/// Registry and router for the process's transports.
#[derive(Default)]
pub struct Coordinator {
    transports: Mutex<Vec<Arc<dyn Transport>>>,
}

impl Coordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, transport: Arc<dyn Transport>) {
        debug!(interface = transport.id(), "transport registered");
        self.transports
            .lock()
            .expect("transport registry poisoned")
            .push(transport);
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Transport>> {
        self.transports
            .lock()
            .expect("transport registry poisoned")
            .iter()
            .find(|t| t.id() == id)
            .cloned()
    }

    /// Pick the transport a publish goes through: the named one when given,
    /// otherwise the first connected injectable one.
    fn resolve(&self, preferred: Option<&str>) -> Result<Arc<dyn Transport>, TransportError> {
        if let Some(id) = preferred {
            return self
                .get(id)
                .ok_or_else(|| TransportError::NoTransport(Some(id.to_string())));
        }
        self.transports
            .lock()
            .expect("transport registry poisoned")
            .iter()
            .find(|t| t.allows_injection() && t.is_connected())
            .cloned()
            .ok_or(TransportError::NoTransport(None))
    }

    /// Publish one encoded frame, waiting briefly for a flapping connection.
    pub fn publish_frame(
        &self,
        preferred: Option<&str>,
        channel_name: &str,
        gateway_id: &str,
        frame: &[u8],
    ) -> Result<String, TransportError> {
        let transport = self.resolve(preferred)?;

        if !transport.allows_injection() {
            return Err(TransportError::NotPermitted(transport.id().to_string()));
        }

        let mut polls = 0;
        while !transport.is_connected() {
            polls += 1;
            if polls > CONNECT_POLLS {
                warn!(interface = transport.id(), "publish gave up waiting for connection");
                return Err(TransportError::NotConnected(transport.id().to_string()));
            }
            thread::sleep(CONNECT_POLL_INTERVAL);
        }

        let base = transport.base_topic().unwrap_or(DEFAULT_BASE_TOPIC);
        let topic = publish_topic(base, channel_name, gateway_id);
        transport.send(&topic, frame)?;
        debug!(interface = transport.id(), topic = %topic, bytes = frame.len(), "frame published");
        Ok(transport.id().to_string())
    }
}

/// In-process transport that records published frames. Backs tests and the
/// CLI's dry-run mode.
pub struct MemoryTransport {
    id: String,
    kind: SourceKind,
    connected: Mutex<bool>,
    injectable: bool,
    base_topic: Option<String>,
    sent: Mutex<Vec<(String, Vec<u8>)>>,
}

impl MemoryTransport {
    pub fn new(id: &str, kind: SourceKind) -> Self {
        Self {
            id: id.to_string(),
            kind,
            connected: Mutex::new(true),
            injectable: true,
            base_topic: None,
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn listen_only(id: &str, kind: SourceKind) -> Self {
        Self {
            injectable: false,
            ..Self::new(id, kind)
        }
    }

    pub fn set_connected(&self, connected: bool) {
        *self.connected.lock().expect("state poisoned") = connected;
    }

    pub fn set_base_topic(&mut self, base: &str) {
        self.base_topic = Some(base.to_string());
    }

    /// Frames handed to this transport, in publish order.
    pub fn sent(&self) -> Vec<(String, Vec<u8>)> {
        self.sent.lock().expect("state poisoned").clone()
    }
}

impl Transport for MemoryTransport {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> SourceKind {
        self.kind
    }

    fn is_connected(&self) -> bool {
        *self.connected.lock().expect("state poisoned")
    }

    fn send(&self, topic: &str, frame: &[u8]) -> Result<(), TransportError> {
        self.sent
            .lock()
            .expect("state poisoned")
            .push((topic.to_string(), frame.to_vec()));
        Ok(())
    }

    fn base_topic(&self) -> Option<&str> {
        self.base_topic.as_deref()
    }

    fn allows_injection(&self) -> bool {
        self.injectable
    }
}
