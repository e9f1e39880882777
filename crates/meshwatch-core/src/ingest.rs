//! Ingestion normalization
//!
//! Transport callbacks arrive in transport-specific shapes; this module
//! adapts them into one uniform tuple for the handler. No decoding happens
//! here.

use thiserror::Error;

/// Where a raw frame came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Mqtt,
    Serial,
    Tcp,
}

impl SourceKind {
    /// Parse a transport-kind label. Unknown labels are a caller error.
    pub fn parse(label: &str) -> Result<Self, IngestError> {
        match label {
            "mqtt" => Ok(SourceKind::Mqtt),
            "serial" => Ok(SourceKind::Serial),
            "tcp" => Ok(SourceKind::Tcp),
            other => Err(IngestError::UnsupportedSource(other.to_string())),
        }
    }
}

/// Normalization failures, all caller errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum IngestError {
    #[error("unsupported packet source: {0}")]
    UnsupportedSource(String),

    #[error("missing required metadata for {kind}: {field}")]
    MalformedMeta { kind: &'static str, field: &'static str },
}

/// Transport-specific callback metadata.
#[derive(Debug, Clone, Default)]
pub struct IngestMeta {
    /// MQTT topic the frame arrived on. Required for MQTT.
    pub topic: Option<String>,
    /// Identifier of the transport connection. Required for serial/TCP.
    pub interface_id: Option<String>,
}

/// The uniform shape the handler consumes.
#[derive(Debug, Clone)]
pub struct NormalizedFrame {
    /// Gateway node id (`!xxxxxxxx`) when the transport reveals it.
    pub gateway_id: Option<String>,
    /// Channel name when the transport reveals it; the envelope's own
    /// channel id wins when both are present.
    pub channel_id: String,
    pub raw_envelope: Vec<u8>,
    pub interface_ref: String,
    pub via_mqtt: bool,
}

/// Normalize one raw frame from a transport callback.
pub fn ingest_packet(
    source: &str,
    raw_data: Vec<u8>,
    meta: &IngestMeta,
) -> Result<NormalizedFrame, IngestError> {
    match SourceKind::parse(source)? {
        SourceKind::Mqtt => {
            let topic = meta.topic.as_deref().ok_or(IngestError::MalformedMeta {
                kind: "mqtt",
                field: "topic",
            })?;
            let (channel_id, gateway_id) = split_topic(topic);
            Ok(NormalizedFrame {
                gateway_id,
                channel_id,
                raw_envelope: raw_data,
                interface_ref: meta
                    .interface_id
                    .clone()
                    .unwrap_or_else(|| "mqtt".to_string()),
                via_mqtt: true,
            })
        }
        SourceKind::Serial => from_direct(raw_data, meta, "serial"),
        SourceKind::Tcp => from_direct(raw_data, meta, "tcp"),
    }
}

fn from_direct(
    raw_data: Vec<u8>,
    meta: &IngestMeta,
    kind: &'static str,
) -> Result<NormalizedFrame, IngestError> {
    let interface_ref = meta
        .interface_id
        .clone()
        .ok_or(IngestError::MalformedMeta { kind, field: "interface_id" })?;
    Ok(NormalizedFrame {
        gateway_id: None,
        channel_id: String::new(),
        raw_envelope: raw_data,
        interface_ref,
        via_mqtt: false,
    })
}

/// Pull channel and gateway out of a publish topic of the form
/// `<base>/2/e/<channel>/<!gateway>`. Missing segments stay unknown.
fn split_topic(topic: &str) -> (String, Option<String>) {
    let segments: Vec<&str> = topic.split('/').filter(|s| !s.is_empty()).collect();
    let gateway = segments
        .last()
        .filter(|s| s.starts_with('!'))
        .map(|s| s.to_string());
    let channel = if gateway.is_some() && segments.len() >= 2 {
        segments[segments.len() - 2].to_string()
    } else {
        segments.last().map(|s| s.to_string()).unwrap_or_default()
    };
    (channel, gateway)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mqtt_requires_topic() {
        let err = ingest_packet("mqtt", vec![], &IngestMeta::default()).unwrap_err();
        assert!(matches!(err, IngestError::MalformedMeta { kind: "mqtt", .. }));
        assert_eq!(err.to_string(), "missing required metadata for mqtt: topic");
    }

    #[test]
    fn mqtt_topic_yields_channel_and_gateway() {
        let meta = IngestMeta {
            topic: Some("msh/EU_868/2/e/LongFast/!deadbeef".into()),
            interface_id: Some("mqtt-0".into()),
        };
        let frame = ingest_packet("mqtt", vec![1, 2], &meta).unwrap();
        assert_eq!(frame.channel_id, "LongFast");
        assert_eq!(frame.gateway_id.as_deref(), Some("!deadbeef"));
        assert_eq!(frame.interface_ref, "mqtt-0");
        assert!(frame.via_mqtt);
    }

    #[test]
    fn serial_requires_interface() {
        let err = ingest_packet("serial", vec![], &IngestMeta::default()).unwrap_err();
        assert!(matches!(err, IngestError::MalformedMeta { kind: "serial", .. }));

        let meta = IngestMeta { interface_id: Some("ttyUSB0".into()), ..Default::default() };
        let frame = ingest_packet("serial", vec![9], &meta).unwrap();
        assert_eq!(frame.interface_ref, "ttyUSB0");
        assert!(!frame.via_mqtt);
        assert!(frame.gateway_id.is_none());
    }

    #[test]
    fn unknown_source_rejected() {
        let err = ingest_packet("pigeon", vec![], &IngestMeta::default()).unwrap_err();
        assert_eq!(err, IngestError::UnsupportedSource("pigeon".into()));
    }

    #[test]
    fn topic_without_gateway_still_yields_channel() {
        let (channel, gateway) = split_topic("msh/2/e/LongFast");
        assert_eq!(channel, "LongFast");
        assert!(gateway.is_none());
    }
}
