//! Outbound packet crafting
//!
//! Pure builders, one per payload kind, plus the envelope assembly that
//! applies channel encryption and the transport framing. Builders never
//! touch the store or the transports; the publisher owns those.

use crate::crypto::{self, ChannelKey, CryptoError, PKI_CHANNEL};
use crate::proto::{self, port, Data, MeshPacket, PayloadVariant, ServiceEnvelope};
use base64::Engine;
use prost::Message;
use serde::Deserialize;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Crafting failures, all caller errors.
#[derive(Error, Debug)]
pub enum CraftError {
    /// PKI mode requires the ciphertext to be supplied by the caller.
    #[error("PKI envelope requires a pre-encrypted payload")]
    MissingCiphertext,

    /// Supplied public key material was not valid base64.
    #[error("invalid public key material: {0}")]
    InvalidPublicKey(String),

    /// Channel key material could not be expanded.
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

fn now_secs() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

/// Text message payload.
pub fn craft_text(message_text: &str) -> Data {
    Data {
        portnum: port::TEXT_MESSAGE_APP,
        payload: message_text.as_bytes().to_vec(),
        bitfield: 1,
        ..Default::default()
    }
}

/// Node identity payload. Solicits the peer's identity back.
pub fn craft_node_info(
    from_id: &str,
    short_name: &str,
    long_name: &str,
    hw_model: u32,
    public_key_b64: &str,
) -> Result<Data, CraftError> {
    let public_key = base64::engine::general_purpose::STANDARD
        .decode(public_key_b64)
        .map_err(|e| CraftError::InvalidPublicKey(e.to_string()))?;

    let user = proto::User {
        id: from_id.to_string(),
        long_name: long_name.to_string(),
        short_name: short_name.to_string(),
        hw_model,
        public_key,
        ..Default::default()
    };

    Ok(Data {
        portnum: port::NODEINFO_APP,
        payload: user.encode_to_vec(),
        bitfield: 1,
        want_response: true,
        ..Default::default()
    })
}

/// Position payload. Latitude/longitude go on the wire as integers
/// scaled by 1e7.
pub fn craft_position(lat: f64, lon: f64, alt: f64, want_response: bool) -> Data {
    let position = proto::Position {
        latitude_i: (lat * 1e7) as i32,
        longitude_i: (lon * 1e7) as i32,
        altitude: alt as i32,
        time: now_secs(),
        ..Default::default()
    };

    Data {
        portnum: port::POSITION_APP,
        payload: position.encode_to_vec(),
        bitfield: 1,
        want_response,
        ..Default::default()
    }
}

/// Traceroute solicitation: an empty route-discovery that hops fill in.
pub fn craft_traceroute() -> Data {
    let route_discovery = proto::RouteDiscovery::default();
    Data {
        portnum: port::TRACEROUTE_APP,
        payload: route_discovery.encode_to_vec(),
        bitfield: 1,
        want_response: true,
        ..Default::default()
    }
}

/// Minimal routing payload used purely to elicit an ack for reachability
/// measurement. The envelope's want_ack carries the solicitation, not the
/// payload's want_response.
pub fn craft_reachability_probe() -> Data {
    let routing = proto::Routing::default();
    Data {
        portnum: port::ROUTING_APP,
        payload: routing.encode_to_vec(),
        bitfield: 1,
        want_response: false,
        ..Default::default()
    }
}

/// Device metric values for a telemetry payload. All optional; absent
/// fields stay off the wire.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeviceTelemetry {
    pub battery_level: Option<u32>,
    pub voltage: Option<f32>,
    pub channel_utilization: Option<f32>,
    pub air_util_tx: Option<f32>,
    pub uptime_seconds: Option<u32>,
}

/// Environment metric values for a telemetry payload.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EnvironmentTelemetry {
    pub temperature: Option<f32>,
    pub relative_humidity: Option<f32>,
    pub barometric_pressure: Option<f32>,
    pub gas_resistance: Option<f32>,
    pub iaq: Option<u32>,
}

/// Which metric family a telemetry payload carries.
#[derive(Debug, Clone)]
pub enum TelemetryValues {
    Device(DeviceTelemetry),
    Environment(EnvironmentTelemetry),
}

/// Telemetry payload from provided metric values.
pub fn craft_telemetry(values: &TelemetryValues, want_response: bool) -> Data {
    let variant = match values {
        TelemetryValues::Device(d) => proto::TelemetryVariant::DeviceMetrics(proto::DeviceMetrics {
            battery_level: d.battery_level,
            voltage: d.voltage,
            channel_utilization: d.channel_utilization,
            air_util_tx: d.air_util_tx,
            uptime_seconds: d.uptime_seconds,
        }),
        TelemetryValues::Environment(e) => {
            proto::TelemetryVariant::EnvironmentMetrics(proto::EnvironmentMetrics {
                temperature: e.temperature,
                relative_humidity: e.relative_humidity,
                barometric_pressure: e.barometric_pressure,
                gas_resistance: e.gas_resistance,
                iaq: e.iaq,
            })
        }
    };

    let telemetry = proto::Telemetry {
        time: now_secs(),
        variant: Some(variant),
    };

    Data {
        portnum: port::TELEMETRY_APP,
        payload: telemetry.encode_to_vec(),
        bitfield: 1,
        want_response,
        ..Default::default()
    }
}

/// Addressing and delivery parameters for [`craft_envelope`].
#[derive(Debug, Clone)]
pub struct EnvelopeParams {
    pub from_num: u32,
    pub to_num: u32,
    pub channel_name: String,
    /// Base64 channel key; empty string sends the payload in the clear.
    pub channel_key: String,
    pub packet_id: u32,
    pub hop_limit: u32,
    pub hop_start: u32,
    pub want_ack: bool,
    pub pki_mode: bool,
    /// Pre-encrypted payload, required in PKI mode.
    pub ciphertext: Option<Vec<u8>>,
    /// Sender public key bytes placed on PKI envelopes.
    pub public_key: Option<Vec<u8>>,
}

/// Assemble the outer envelope around an inner payload.
///
/// PKI mode forces channel 0 and attaches the supplied ciphertext. With a
/// channel key, the payload is symmetric-encrypted under the packet-bound
/// keystream. With an empty key the decoded payload is attached directly.
pub fn craft_envelope(params: &EnvelopeParams, data: Data) -> Result<MeshPacket, CraftError> {
    let mut packet = MeshPacket {
        from: params.from_num,
        to: params.to_num,
        id: params.packet_id,
        hop_limit: params.hop_limit,
        hop_start: params.hop_start,
        want_ack: params.want_ack,
        pki_encrypted: params.pki_mode,
        ..Default::default()
    };
    if let Some(key) = &params.public_key {
        packet.public_key = key.clone();
    }

    if params.pki_mode {
        packet.channel = PKI_CHANNEL;
        let ciphertext = params
            .ciphertext
            .clone()
            .ok_or(CraftError::MissingCiphertext)?;
        packet.payload_variant = Some(PayloadVariant::Encrypted(ciphertext));
    } else if params.channel_key.is_empty() {
        packet.channel = crypto::channel_hash(&params.channel_name, crypto::DEFAULT_CHANNEL_KEY)
            .unwrap_or(0);
        packet.payload_variant = Some(PayloadVariant::Decoded(data));
    } else {
        packet.channel = crypto::channel_hash(&params.channel_name, &params.channel_key)?;
        let key = ChannelKey::from_b64(&params.channel_key)?;
        let ciphertext =
            crypto::encrypt_payload(&key, params.packet_id, params.from_num, &data.encode_to_vec());
        packet.payload_variant = Some(PayloadVariant::Encrypted(ciphertext));
    }

    Ok(packet)
}

/// Serialize the final transport frame.
pub fn wrap_for_transport(packet: MeshPacket, channel_name: &str, gateway_id: &str) -> Vec<u8> {
    let envelope = ServiceEnvelope {
        packet: Some(packet),
        channel_id: channel_name.to_string(),
        gateway_id: gateway_id.to_string(),
    };
    envelope.encode_to_vec()
}
