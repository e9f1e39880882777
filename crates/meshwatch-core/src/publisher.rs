//! Outbound publishing
//!
//! Three ways frames leave the process:
//!
//! * direct publish calls, one per payload kind
//! * the reactive engine, which fires a traceroute at newly-heard nodes
//!   under a rolling rate-limit window
//! * periodic jobs claimed from the store's schedule
//!
//! Every outbound packet is recorded in the store the same way an observed
//! one is, so later acks and traceroute responses correlate against it.

use crate::crafter::{self, CraftError, TelemetryValues};
use crate::crypto::{CryptoError, PkiCapability, PkiEncryptInputs};
use crate::handler::ProcessedPacket;
use crate::identity::{canonical_id, is_broadcast, BROADCAST_NUM};
use crate::proto::{port, Data};
use crate::store::{JobKind, PacketKey, RunOutcome, SharedStore};
use crate::transport::{Coordinator, TransportError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum PublishError {
    #[error("invalid publish parameters: {0}")]
    Validation(String),

    #[error("PKI capability unavailable")]
    PkiUnavailable,

    #[error("missing key material: {0}")]
    MissingKey(String),

    #[error(transparent)]
    Craft(#[from] CraftError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Wrapping packet-id allocator, randomly seeded per process so restarts
/// do not collide with ids still circulating on the mesh. Never yields 0.
pub struct MessageIdCounter {
    next: AtomicU32,
}

impl MessageIdCounter {
    pub fn new() -> Self {
        Self { next: AtomicU32::new(rand::random::<u32>()) }
    }

    pub fn next_id(&self) -> u32 {
        loop {
            let id = self.next.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }
}

impl Default for MessageIdCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-target rolling window for reactive injection.
struct RateWindow {
    count: u32,
    window_start: SystemTime,
}

/// Rolling-window rate limiter keyed by target node.
pub struct RateLimiter {
    windows: HashMap<u32, RateWindow>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self { windows: HashMap::new() }
    }

    /// Whether one more attempt at `target` is allowed at `now`. Counts the
    /// attempt when allowed. A window older than `window` resets.
    pub fn allow(&mut self, target: u32, max_tries: u32, window: Duration, now: SystemTime) -> bool {
        let entry = self
            .windows
            .entry(target)
            .or_insert(RateWindow { count: 0, window_start: now });

        let elapsed = now
            .duration_since(entry.window_start)
            .unwrap_or(Duration::ZERO);
        if elapsed >= window {
            entry.count = 0;
            entry.window_start = now;
        }

        if entry.count >= max_tries {
            return false;
        }
        entry.count += 1;
        true
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

/// Addressing for one outbound publish.
#[derive(Debug, Clone)]
pub struct PublishRequest {
    pub from_node: u32,
    pub to_node: u32,
    pub channel_name: String,
    /// Base64 channel key; empty publishes in the clear.
    pub channel_key: String,
    /// Preferred transport; None lets the coordinator pick.
    pub interface: Option<String>,
    /// Gateway identity stamped on the frame; defaults to the sender.
    pub gateway_node: Option<u32>,
    pub hop_limit: u32,
    pub hop_start: u32,
    pub want_ack: bool,
    pub pki: bool,
}

impl PublishRequest {
    pub fn new(from_node: u32, to_node: u32, channel_name: &str, channel_key: &str) -> Self {
        Self {
            from_node,
            to_node,
            channel_name: channel_name.to_string(),
            channel_key: channel_key.to_string(),
            interface: None,
            gateway_node: None,
            hop_limit: 3,
            hop_start: 3,
            want_ack: false,
            pki: false,
        }
    }
}

/// Outbound side of the engine. Shares the store with the handler so sent
/// packets participate in correlation.
pub struct Publisher {
    store: SharedStore,
    coordinator: Arc<Coordinator>,
    pki: Option<Arc<dyn PkiCapability>>,
    message_ids: MessageIdCounter,
    reactive_limiter: Mutex<RateLimiter>,
}

impl Publisher {
    pub fn new(
        store: SharedStore,
        coordinator: Arc<Coordinator>,
        pki: Option<Arc<dyn PkiCapability>>,
    ) -> Self {
        Self {
            store,
            coordinator,
            pki,
            message_ids: MessageIdCounter::new(),
            reactive_limiter: Mutex::new(RateLimiter::new()),
        }
    }

    // ---- direct publishes ----

    pub fn publish_text(&self, req: &PublishRequest, message_text: &str) -> Result<PacketKey, PublishError> {
        self.publish_data(req, crafter::craft_text(message_text), false)
    }

    pub fn publish_position(
        &self,
        req: &PublishRequest,
        lat: f64,
        lon: f64,
        alt: f64,
        want_response: bool,
    ) -> Result<PacketKey, PublishError> {
        self.publish_data(req, crafter::craft_position(lat, lon, alt, want_response), false)
    }

    pub fn publish_node_info(
        &self,
        req: &PublishRequest,
        short_name: &str,
        long_name: &str,
        hw_model: u32,
        public_key_b64: &str,
    ) -> Result<PacketKey, PublishError> {
        let data = crafter::craft_node_info(
            &canonical_id(req.from_node),
            short_name,
            long_name,
            hw_model,
            public_key_b64,
        )?;
        self.publish_data(req, data, false)
    }

    /// Traceroute solicitation. The pending probe entry lets the eventual
    /// response report a latency.
    pub fn publish_traceroute(&self, req: &PublishRequest) -> Result<PacketKey, PublishError> {
        self.publish_data(req, crafter::craft_traceroute(), true)
    }

    /// Reachability probe: a minimal routing payload sent with want_ack so
    /// the target's ack measures round-trip latency.
    pub fn publish_reachability_probe(&self, req: &PublishRequest) -> Result<PacketKey, PublishError> {
        let mut req = req.clone();
        req.want_ack = true;
        self.publish_data(&req, crafter::craft_reachability_probe(), true)
    }

    pub fn publish_telemetry(
        &self,
        req: &PublishRequest,
        values: &TelemetryValues,
        want_response: bool,
    ) -> Result<PacketKey, PublishError> {
        self.publish_data(req, crafter::craft_telemetry(values, want_response), false)
    }

    /// Craft, encrypt, publish, and record one outbound packet.
    fn publish_data(
        &self,
        req: &PublishRequest,
        data: Data,
        record_probe: bool,
    ) -> Result<PacketKey, PublishError> {
        let packet_id = self.message_ids.next_id();
        let portnum = data.portnum;
        let want_response = data.want_response;

        let mut params = crafter::EnvelopeParams {
            from_num: req.from_node,
            to_num: req.to_node,
            channel_name: req.channel_name.clone(),
            channel_key: req.channel_key.clone(),
            packet_id,
            hop_limit: req.hop_limit,
            hop_start: req.hop_start,
            want_ack: req.want_ack,
            pki_mode: req.pki,
            ciphertext: None,
            public_key: None,
        };

        if req.pki {
            let sealed = self.pki_seal(req, packet_id, &data)?;
            params.ciphertext = Some(sealed.0);
            params.public_key = Some(sealed.1);
        }

        let packet = crafter::craft_envelope(&params, data)?;
        let gateway = canonical_id(req.gateway_node.unwrap_or(req.from_node));
        let frame = crafter::wrap_for_transport(packet, &req.channel_name, &gateway);

        let used_interface =
            self.coordinator
                .publish_frame(req.interface.as_deref(), &req.channel_name, &gateway, &frame)?;

        let key = PacketKey {
            packet_id,
            from_num: req.from_node,
            to_num: req.to_node,
        };

        {
            let mut store = self.store.lock().expect("store mutex poisoned");
            let sender = store.get_or_update_node(req.from_node, None, None);
            sender.is_virtual = true;
            store.touch_node(req.from_node, Some(&used_interface));

            let observed = store.upsert_packet(key);
            observed.channel_id = Some(req.channel_name.clone());
            observed.hop_limit = Some(req.hop_limit);
            observed.hop_start = Some(req.hop_start);
            observed.want_ack = Some(req.want_ack);
            observed.ackd = if req.want_ack { Some(false) } else { None };
            observed.pki_encrypted = req.pki;
            observed.interfaces.insert(used_interface.clone());
            observed.data = Some(crate::store::PacketData {
                portnum,
                port_name: port::name(portnum).to_string(),
                source: 0,
                dest: 0,
                request_id: 0,
                reply_id: 0,
                want_response,
                got_response: if want_response { Some(false) } else { None },
                payload: None,
            });

            if record_probe {
                // The node snapshot reflects the latest probe, so a fresh
                // pending one clears any earlier result.
                let target = store.get_or_update_node(req.to_node, None, None);
                target.latency_reachable = Some(false);
                target.latency_ms = None;
                store.record_pending_probe(req.to_node, packet_id);
            }
        }

        info!(
            packet_id,
            from = %canonical_id(req.from_node),
            to = %canonical_id(req.to_node),
            port = port::name(portnum),
            interface = %used_interface,
            "packet published"
        );
        Ok(key)
    }

    /// PKI-seal a payload: the sender's private key and the recipient's
    /// announced public key both come from the store.
    fn pki_seal(
        &self,
        req: &PublishRequest,
        packet_id: u32,
        data: &Data,
    ) -> Result<(Vec<u8>, Vec<u8>), PublishError> {
        use prost::Message;

        let pki = self.pki.as_ref().ok_or(PublishError::PkiUnavailable)?;

        let (sender_private, recipient_public) = {
            let store = self.store.lock().expect("store mutex poisoned");
            let sender_private = store
                .node(req.from_node)
                .and_then(|n| n.private_key.clone())
                .ok_or_else(|| {
                    PublishError::MissingKey(format!(
                        "no private key for sender {}",
                        canonical_id(req.from_node)
                    ))
                })?;
            let recipient_public = store
                .node(req.to_node)
                .and_then(|n| n.public_key.clone())
                .ok_or_else(|| {
                    PublishError::MissingKey(format!(
                        "no public key for recipient {}",
                        canonical_id(req.to_node)
                    ))
                })?;
            (sender_private, recipient_public)
        };

        let inputs = PkiEncryptInputs {
            plaintext: data.encode_to_vec(),
            from_num: req.from_node,
            to_num: req.to_node,
            packet_id,
            recipient_public_key: recipient_public,
        };
        let sealed = pki.encrypt(&inputs, &sender_private)?;
        Ok((sealed.ciphertext, sealed.public_key))
    }

    // ---- reactive injection ----

    /// React to one processed inbound packet: fire a traceroute at its
    /// sender unless a gate or the rate limit says otherwise. Returns the
    /// injected packet's key when one went out.
    pub fn on_packet_received(
        &self,
        processed: &ProcessedPacket,
    ) -> Result<Option<PacketKey>, PublishError> {
        let config = {
            let store = self.store.lock().expect("store mutex poisoned");
            store.reactive_config().clone()
        };

        if !config.enabled {
            return Ok(None);
        }
        let Some(from_node) = config.from_node else {
            warn!("reactive injection enabled but no source node configured");
            return Ok(None);
        };

        let target = processed.packet_key.from_num;
        if target == from_node || is_broadcast(target) {
            return Ok(None);
        }
        {
            let store = self.store.lock().expect("store mutex poisoned");
            if store.node(target).map(|n| n.is_virtual).unwrap_or(false) {
                return Ok(None);
            }
        }
        if !config.listen_interfaces.is_empty()
            && !config.listen_interfaces.contains(&processed.interface_ref)
        {
            return Ok(None);
        }
        if !config.trigger_ports.is_empty() {
            let matches = processed
                .port_name
                .map(|name| config.trigger_ports.iter().any(|p| p == name))
                .unwrap_or(false);
            if !matches {
                return Ok(None);
            }
        }

        // The probe must go out encrypted: the configured key, or the
        // channel's stored PSK. No key, no injection.
        let channel_key = if !config.channel_key.is_empty() {
            config.channel_key.clone()
        } else {
            let store = self.store.lock().expect("store mutex poisoned");
            store
                .channel_by_name(&processed.channel_id)
                .and_then(|c| c.psk.clone())
                .unwrap_or_default()
        };
        if channel_key.is_empty() {
            debug!(
                channel = %processed.channel_id,
                "reactive traceroute skipped: no symmetric key for channel"
            );
            return Ok(None);
        }

        let allowed = self
            .reactive_limiter
            .lock()
            .expect("rate limiter poisoned")
            .allow(
                target,
                config.max_tries,
                Duration::from_secs(config.window_secs),
                SystemTime::now(),
            );
        if !allowed {
            debug!(target = %canonical_id(target), "reactive traceroute suppressed by rate limit");
            return Ok(None);
        }

        let req = PublishRequest {
            from_node,
            to_node: target,
            channel_name: processed.channel_id.clone(),
            channel_key,
            interface: Some(processed.interface_ref.clone()),
            gateway_node: config.gateway_node.or(processed.gateway_num),
            hop_limit: config.hop_limit,
            hop_start: config.hop_start,
            want_ack: config.want_ack,
            pki: false,
        };
        info!(target = %canonical_id(target), "reactive traceroute injected");
        self.publish_traceroute(&req).map(Some)
    }

    // ---- periodic jobs ----

    /// Execute one claimed job and record its outcome. Scheduling stays
    /// with [`crate::store::Store::claim_due_jobs`]; this only runs and
    /// bookkeeps.
    pub fn execute_periodic_job(&self, job_id: u64) -> RunOutcome {
        let job = {
            let store = self.store.lock().expect("store mutex poisoned");
            store.job(job_id).cloned()
        };
        let Some(job) = job else {
            return RunOutcome::Failure(format!("job {job_id} does not exist"));
        };

        let outcome = if !job.enabled {
            RunOutcome::Skipped("job disabled".to_string())
        } else {
            match self.run_job(&job) {
                Ok(()) => RunOutcome::Success,
                Err(e) => RunOutcome::Failure(e.to_string()),
            }
        };

        let mut store = self.store.lock().expect("store mutex poisoned");
        store.record_job_run(job_id, &outcome);
        outcome
    }

    fn run_job(&self, job: &crate::store::PeriodicJob) -> Result<(), PublishError> {
        let from_node = job
            .from_node
            .ok_or_else(|| PublishError::Validation("job has no from_node".to_string()))?;
        let to_node = job.to_node.unwrap_or(BROADCAST_NUM);

        let req = PublishRequest {
            from_node,
            to_node,
            channel_name: job.channel_name.clone(),
            channel_key: job.channel_key.clone(),
            interface: job.interface.clone(),
            gateway_node: None,
            hop_limit: 3,
            hop_start: 3,
            want_ack: false,
            pki: job.pki,
        };

        match job.kind {
            JobKind::Text => {
                let text = job
                    .options
                    .get("message_text")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| PublishError::Validation("text job requires message_text".to_string()))?;
                self.publish_text(&req, text)?;
            }
            JobKind::Position => {
                let lat = require_f64(&job.options, "lat")?;
                let lon = require_f64(&job.options, "lon")?;
                let alt = job.options.get("alt").and_then(|v| v.as_f64()).unwrap_or(0.0);
                let want_response = job
                    .options
                    .get("want_response")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
                self.publish_position(&req, lat, lon, alt, want_response)?;
            }
            JobKind::NodeInfo => {
                let short_name = require_str(&job.options, "short_name")?;
                let long_name = require_str(&job.options, "long_name")?;
                let hw_model = job
                    .options
                    .get("hw_model")
                    .and_then(|v| v.as_u64())
                    .ok_or_else(|| PublishError::Validation("node-info job requires hw_model".to_string()))?
                    as u32;
                let public_key = job
                    .options
                    .get("public_key")
                    .and_then(|v| v.as_str())
                    .unwrap_or("");
                self.publish_node_info(&req, &short_name, &long_name, hw_model, public_key)?;
            }
            JobKind::Traceroute => {
                self.publish_traceroute(&req)?;
            }
            JobKind::Telemetry => {
                let values = telemetry_values(&job.options)?;
                let want_response = job
                    .options
                    .get("want_response")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
                self.publish_telemetry(&req, &values, want_response)?;
            }
        }
        Ok(())
    }

    /// Install a locally-controlled virtual node identity, keys included.
    pub fn register_virtual_node(
        &self,
        node_num: u32,
        short_name: &str,
        long_name: &str,
        public_key_b64: Option<String>,
        private_key_b64: Option<String>,
    ) {
        let mut store = self.store.lock().expect("store mutex poisoned");
        {
            let node = store.get_or_update_node(node_num, None, None);
            node.is_virtual = true;
            node.short_name = Some(short_name.to_string());
            node.long_name = Some(long_name.to_string());
            node.private_key = private_key_b64;
        }
        store.set_node_public_key(node_num, public_key_b64);
    }
}

fn require_f64(options: &serde_json::Value, field: &str) -> Result<f64, PublishError> {
    options
        .get(field)
        .and_then(|v| v.as_f64())
        .ok_or_else(|| PublishError::Validation(format!("job requires numeric {field}")))
}

fn require_str(options: &serde_json::Value, field: &str) -> Result<String, PublishError> {
    options
        .get(field)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| PublishError::Validation(format!("job requires string {field}")))
}

fn telemetry_values(options: &serde_json::Value) -> Result<TelemetryValues, PublishError> {
    let kind = options
        .get("telemetry_type")
        .and_then(|v| v.as_str())
        .ok_or_else(|| PublishError::Validation("telemetry job requires telemetry_type".to_string()))?;
    match kind {
        "device" => {
            let values = serde_json::from_value(options.clone())
                .map_err(|e| PublishError::Validation(format!("bad device telemetry options: {e}")))?;
            Ok(TelemetryValues::Device(values))
        }
        "environment" => {
            let values = serde_json::from_value(options.clone())
                .map_err(|e| PublishError::Validation(format!("bad environment telemetry options: {e}")))?;
            Ok(TelemetryValues::Environment(values))
        }
        other => Err(PublishError::Validation(format!(
            "unknown telemetry_type: {other}"
        ))),
    }
}
