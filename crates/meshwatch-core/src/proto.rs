//! Wire protobuf messages
//!
//! Hand-written `prost` message definitions matching the on-air protobuf
//! schema used by the deployed mesh. Field tags and wire types must not
//! change; gateways on the network expect these frames bit-for-bit.
//!
//! Only the fields this engine reads or writes are declared. Unknown fields
//! in received frames are skipped by prost and do not fail decoding.

use prost::Message;

/// Numeric application ports carried in [`Data::portnum`].
pub mod port {
    pub const UNKNOWN_APP: i32 = 0;
    pub const TEXT_MESSAGE_APP: i32 = 1;
    pub const POSITION_APP: i32 = 3;
    pub const NODEINFO_APP: i32 = 4;
    pub const ROUTING_APP: i32 = 5;
    pub const ADMIN_APP: i32 = 6;
    pub const RANGE_TEST_APP: i32 = 66;
    pub const TELEMETRY_APP: i32 = 67;
    pub const TRACEROUTE_APP: i32 = 70;
    pub const NEIGHBORINFO_APP: i32 = 71;

    /// Human-readable port name, as recorded on decoded packets.
    pub fn name(portnum: i32) -> &'static str {
        match portnum {
            TEXT_MESSAGE_APP => "TEXT_MESSAGE_APP",
            POSITION_APP => "POSITION_APP",
            NODEINFO_APP => "NODEINFO_APP",
            ROUTING_APP => "ROUTING_APP",
            ADMIN_APP => "ADMIN_APP",
            RANGE_TEST_APP => "RANGE_TEST_APP",
            TELEMETRY_APP => "TELEMETRY_APP",
            TRACEROUTE_APP => "TRACEROUTE_APP",
            NEIGHBORINFO_APP => "NEIGHBORINFO_APP",
            _ => "UNKNOWN_APP",
        }
    }
}

/// The outer addressed envelope: sender, recipient, channel, hop counters,
/// and either a decoded [`Data`] payload or an opaque ciphertext.
#[derive(Clone, PartialEq, Message)]
pub struct MeshPacket {
    #[prost(fixed32, tag = "1")]
    pub from: u32,
    #[prost(fixed32, tag = "2")]
    pub to: u32,
    #[prost(uint32, tag = "3")]
    pub channel: u32,
    #[prost(oneof = "PayloadVariant", tags = "4, 5")]
    pub payload_variant: Option<PayloadVariant>,
    #[prost(fixed32, tag = "6")]
    pub id: u32,
    #[prost(fixed32, tag = "7")]
    pub rx_time: u32,
    #[prost(float, tag = "8")]
    pub rx_snr: f32,
    #[prost(uint32, tag = "9")]
    pub hop_limit: u32,
    #[prost(bool, tag = "10")]
    pub want_ack: bool,
    #[prost(int32, tag = "12")]
    pub rx_rssi: i32,
    #[prost(bool, tag = "14")]
    pub via_mqtt: bool,
    #[prost(uint32, tag = "15")]
    pub hop_start: u32,
    #[prost(bytes = "vec", tag = "16")]
    pub public_key: Vec<u8>,
    #[prost(bool, tag = "17")]
    pub pki_encrypted: bool,
}

/// Payload state of a [`MeshPacket`]: already decoded or still ciphertext.
#[derive(Clone, PartialEq, prost::Oneof)]
pub enum PayloadVariant {
    #[prost(message, tag = "4")]
    Decoded(Data),
    #[prost(bytes, tag = "5")]
    Encrypted(Vec<u8>),
}

impl MeshPacket {
    /// The decoded inner payload, if this packet carries one.
    pub fn decoded(&self) -> Option<&Data> {
        match &self.payload_variant {
            Some(PayloadVariant::Decoded(data)) => Some(data),
            _ => None,
        }
    }

    /// The ciphertext, if this packet is still encrypted.
    pub fn encrypted(&self) -> Option<&[u8]> {
        match &self.payload_variant {
            Some(PayloadVariant::Encrypted(bytes)) => Some(bytes.as_slice()),
            _ => None,
        }
    }
}

/// The port-tagged inner payload of an envelope.
#[derive(Clone, PartialEq, Message)]
pub struct Data {
    #[prost(int32, tag = "1")]
    pub portnum: i32,
    #[prost(bytes = "vec", tag = "2")]
    pub payload: Vec<u8>,
    #[prost(bool, tag = "3")]
    pub want_response: bool,
    #[prost(fixed32, tag = "4")]
    pub dest: u32,
    #[prost(fixed32, tag = "5")]
    pub source: u32,
    #[prost(fixed32, tag = "6")]
    pub request_id: u32,
    #[prost(fixed32, tag = "7")]
    pub reply_id: u32,
    #[prost(uint32, tag = "9")]
    pub bitfield: u32,
}

/// Node identity broadcast on the NODEINFO port.
#[derive(Clone, PartialEq, Message)]
pub struct User {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(string, tag = "2")]
    pub long_name: String,
    #[prost(string, tag = "3")]
    pub short_name: String,
    #[prost(uint32, tag = "5")]
    pub hw_model: u32,
    #[prost(bool, tag = "6")]
    pub is_licensed: bool,
    #[prost(int32, tag = "7")]
    pub role: i32,
    #[prost(bytes = "vec", tag = "8")]
    pub public_key: Vec<u8>,
}

/// Position report. Latitude/longitude are integers scaled by 1e7.
#[derive(Clone, PartialEq, Message)]
pub struct Position {
    #[prost(sfixed32, tag = "1")]
    pub latitude_i: i32,
    #[prost(sfixed32, tag = "2")]
    pub longitude_i: i32,
    #[prost(int32, tag = "3")]
    pub altitude: i32,
    #[prost(fixed32, tag = "4")]
    pub time: u32,
    #[prost(uint32, tag = "22")]
    pub precision_bits: u32,
}

/// Telemetry report carrying one metric family.
#[derive(Clone, PartialEq, Message)]
pub struct Telemetry {
    #[prost(fixed32, tag = "1")]
    pub time: u32,
    #[prost(oneof = "TelemetryVariant", tags = "2, 3")]
    pub variant: Option<TelemetryVariant>,
}

#[derive(Clone, PartialEq, prost::Oneof)]
pub enum TelemetryVariant {
    #[prost(message, tag = "2")]
    DeviceMetrics(DeviceMetrics),
    #[prost(message, tag = "3")]
    EnvironmentMetrics(EnvironmentMetrics),
}

#[derive(Clone, PartialEq, Message)]
pub struct DeviceMetrics {
    #[prost(uint32, optional, tag = "1")]
    pub battery_level: Option<u32>,
    #[prost(float, optional, tag = "2")]
    pub voltage: Option<f32>,
    #[prost(float, optional, tag = "3")]
    pub channel_utilization: Option<f32>,
    #[prost(float, optional, tag = "4")]
    pub air_util_tx: Option<f32>,
    #[prost(uint32, optional, tag = "5")]
    pub uptime_seconds: Option<u32>,
}

#[derive(Clone, PartialEq, Message)]
pub struct EnvironmentMetrics {
    #[prost(float, optional, tag = "1")]
    pub temperature: Option<f32>,
    #[prost(float, optional, tag = "2")]
    pub relative_humidity: Option<f32>,
    #[prost(float, optional, tag = "3")]
    pub barometric_pressure: Option<f32>,
    #[prost(float, optional, tag = "4")]
    pub gas_resistance: Option<f32>,
    #[prost(uint32, optional, tag = "7")]
    pub iaq: Option<u32>,
}

/// Traceroute payload: hop-number lists for both directions with parallel
/// SNR lists. SNR values on the wire are quarter-dB (stored x4).
#[derive(Clone, PartialEq, Message)]
pub struct RouteDiscovery {
    #[prost(fixed32, repeated, tag = "1")]
    pub route: Vec<u32>,
    #[prost(int32, repeated, tag = "2")]
    pub snr_towards: Vec<i32>,
    #[prost(fixed32, repeated, tag = "3")]
    pub route_back: Vec<u32>,
    #[prost(int32, repeated, tag = "4")]
    pub snr_back: Vec<i32>,
}

/// Routing control payload (acks/nacks and routing errors).
#[derive(Clone, PartialEq, Message)]
pub struct Routing {
    #[prost(oneof = "RoutingVariant", tags = "1, 2, 3")]
    pub variant: Option<RoutingVariant>,
}

#[derive(Clone, PartialEq, prost::Oneof)]
pub enum RoutingVariant {
    #[prost(message, tag = "1")]
    RouteRequest(RouteDiscovery),
    #[prost(message, tag = "2")]
    RouteReply(RouteDiscovery),
    #[prost(int32, tag = "3")]
    ErrorReason(i32),
}

/// Routing error reasons we care to name; anything else is reported numeric.
pub fn routing_error_name(reason: i32) -> &'static str {
    match reason {
        0 => "NONE",
        1 => "NO_ROUTE",
        2 => "GOT_NAK",
        3 => "TIMEOUT",
        5 => "NO_INTERFACE",
        7 => "MAX_RETRANSMIT",
        8 => "NO_CHANNEL",
        9 => "TOO_LARGE",
        10 => "NO_RESPONSE",
        32 => "PKI_FAILED",
        33 => "PKI_UNKNOWN_PUBKEY",
        _ => "UNKNOWN",
    }
}

/// Neighbor table broadcast on the NEIGHBORINFO port.
#[derive(Clone, PartialEq, Message)]
pub struct NeighborInfo {
    #[prost(uint32, tag = "1")]
    pub node_id: u32,
    #[prost(uint32, tag = "2")]
    pub last_sent_by_id: u32,
    #[prost(uint32, tag = "3")]
    pub node_broadcast_interval_secs: u32,
    #[prost(message, repeated, tag = "4")]
    pub neighbors: Vec<Neighbor>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Neighbor {
    #[prost(uint32, tag = "1")]
    pub node_id: u32,
    #[prost(float, tag = "2")]
    pub snr: f32,
}

/// The transport frame a gateway publishes: one packet plus the channel and
/// gateway that relayed it.
#[derive(Clone, PartialEq, Message)]
pub struct ServiceEnvelope {
    #[prost(message, optional, tag = "1")]
    pub packet: Option<MeshPacket>,
    #[prost(string, tag = "2")]
    pub channel_id: String,
    #[prost(string, tag = "3")]
    pub gateway_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mesh_packet_roundtrip() {
        let packet = MeshPacket {
            from: 0x1234_5678,
            to: 0xFFFF_FFFF,
            channel: 8,
            payload_variant: Some(PayloadVariant::Encrypted(vec![1, 2, 3])),
            id: 42,
            hop_limit: 3,
            hop_start: 3,
            want_ack: true,
            ..Default::default()
        };

        let bytes = packet.encode_to_vec();
        let decoded = MeshPacket::decode(bytes.as_slice()).unwrap();
        assert_eq!(decoded, packet);
        assert_eq!(decoded.encrypted(), Some(&[1u8, 2, 3][..]));
        assert!(decoded.decoded().is_none());
    }

    #[test]
    fn data_roundtrip_preserves_request_id() {
        let data = Data {
            portnum: port::TRACEROUTE_APP,
            payload: vec![0xAA; 8],
            want_response: true,
            request_id: 0xDEAD_BEEF,
            bitfield: 1,
            ..Default::default()
        };

        let decoded = Data::decode(data.encode_to_vec().as_slice()).unwrap();
        assert_eq!(decoded.request_id, 0xDEAD_BEEF);
        assert_eq!(port::name(decoded.portnum), "TRACEROUTE_APP");
    }

    #[test]
    fn service_envelope_roundtrip() {
        let envelope = ServiceEnvelope {
            packet: Some(MeshPacket {
                from: 1,
                to: 2,
                id: 99,
                ..Default::default()
            }),
            channel_id: "LongFast".into(),
            gateway_id: "!deadbeef".into(),
        };

        let decoded = ServiceEnvelope::decode(envelope.encode_to_vec().as_slice()).unwrap();
        assert_eq!(decoded.channel_id, "LongFast");
        assert_eq!(decoded.packet.unwrap().id, 99);
    }

    #[test]
    fn unknown_port_falls_back() {
        assert_eq!(port::name(12345), "UNKNOWN_APP");
    }
}
