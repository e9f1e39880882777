//! End-to-end pipeline tests: raw transport bytes in, store state and
//! injected frames out.

use std::sync::Arc;

use meshwatch_core::crafter::{self, EnvelopeParams};
use meshwatch_core::crypto::{ChannelKey, DEFAULT_CHANNEL_KEY};
use meshwatch_core::handler::PacketHandler;
use meshwatch_core::ingest::{ingest_packet, IngestMeta, SourceKind};
use meshwatch_core::proto::{self, port, Data, ServiceEnvelope};
use meshwatch_core::publisher::{PublishRequest, Publisher};
use meshwatch_core::store::{ReactiveConfig, SharedStore, Store};
use meshwatch_core::transport::{Coordinator, MemoryTransport};
use prost::Message;

const GATEWAY: &str = "!000000aa";
const GATEWAY_NUM: u32 = 0xAA;

struct Rig {
    store: SharedStore,
    handler: PacketHandler,
    publisher: Publisher,
    transport: Arc<MemoryTransport>,
}

fn rig() -> Rig {
    let store = Store::shared();
    let coordinator = Arc::new(Coordinator::new());
    let transport = Arc::new(MemoryTransport::new("mqtt-0", SourceKind::Mqtt));
    coordinator.register(transport.clone());
    Rig {
        handler: PacketHandler::new(store.clone(), None),
        publisher: Publisher::new(store.clone(), coordinator, None),
        store,
        transport,
    }
}

/// Encrypt a payload into the raw bytes an MQTT gateway would publish.
fn gateway_bytes(from: u32, to: u32, packet_id: u32, data: Data) -> Vec<u8> {
    let params = EnvelopeParams {
        from_num: from,
        to_num: to,
        channel_name: "LongFast".into(),
        channel_key: DEFAULT_CHANNEL_KEY.into(),
        packet_id,
        hop_limit: 3,
        hop_start: 3,
        want_ack: false,
        pki_mode: false,
        ciphertext: None,
        public_key: None,
    };
    let packet = crafter::craft_envelope(&params, data).unwrap();
    crafter::wrap_for_transport(packet, "LongFast", GATEWAY)
}

fn mqtt_meta() -> IngestMeta {
    IngestMeta {
        topic: Some("msh/2/e/LongFast/!000000aa".into()),
        interface_id: Some("mqtt-0".into()),
    }
}

#[test]
fn nodeinfo_over_mqtt_materializes_node() {
    let rig = rig();

    let user = proto::User {
        id: "!0000002a".into(),
        short_name: "N42".into(),
        long_name: "Node Forty-Two".into(),
        hw_model: 31,
        role: 0,
        ..Default::default()
    };
    let data = Data {
        portnum: port::NODEINFO_APP,
        payload: user.encode_to_vec(),
        ..Default::default()
    };

    let frame = ingest_packet("mqtt", gateway_bytes(42, 0xFFFF_FFFF, 1, data), &mqtt_meta()).unwrap();
    let processed = rig.handler.handle_frame(&frame).unwrap();
    assert_eq!(processed.port_name, Some("NODEINFO_APP"));

    let store = rig.store.lock().unwrap();
    let node = store.node(42).unwrap();
    assert_eq!(node.short_name.as_deref(), Some("N42"));
    assert_eq!(node.long_name.as_deref(), Some("Node Forty-Two"));
    assert!(node.interfaces.contains("mqtt-0"));

    // The relaying gateway became a node and got a direct edge.
    assert!(store.node(GATEWAY_NUM).is_some());
    assert!(store.edge(42, GATEWAY_NUM).is_some());
}

#[test]
fn traceroute_lifecycle_publish_then_correlate() {
    let rig = rig();

    let req = PublishRequest::new(1, 4, "LongFast", DEFAULT_CHANNEL_KEY);
    let outbound = rig.publisher.publish_traceroute(&req).unwrap();

    // The frame on the wire decrypts back to our traceroute.
    let sent = rig.transport.sent();
    assert_eq!(sent.len(), 1);
    let envelope = ServiceEnvelope::decode(sent[0].1.as_slice()).unwrap();
    let packet = envelope.packet.unwrap();
    let key = ChannelKey::from_b64(DEFAULT_CHANNEL_KEY).unwrap();
    let decoded = meshwatch_core::crypto::decrypt_payload(
        &key,
        packet.id,
        packet.from,
        packet.encrypted().unwrap(),
    )
    .unwrap();
    assert_eq!(decoded.portnum, port::TRACEROUTE_APP);
    assert!(decoded.want_response);

    // The target answers through relay 3.
    let response = Data {
        portnum: port::TRACEROUTE_APP,
        payload: proto::RouteDiscovery {
            route: vec![3],
            snr_towards: vec![8, 12],
            route_back: vec![3, 1],
            snr_back: vec![4, 16],
            ..Default::default()
        }
        .encode_to_vec(),
        request_id: outbound.packet_id,
        ..Default::default()
    };
    let frame = ingest_packet("mqtt", gateway_bytes(4, 1, 9001, response), &mqtt_meta()).unwrap();
    rig.handler.handle_frame(&frame).unwrap();

    let store = rig.store.lock().unwrap();

    // Correlation: the outbound packet is acked and the probe resolved.
    let original = store.packet(&outbound).unwrap();
    assert_eq!(original.ackd, Some(true));
    assert_eq!(original.data.as_ref().unwrap().got_response, Some(true));

    let node = store.node(4).unwrap();
    assert_eq!(node.latency_reachable, Some(true));
    assert!(node.latency_ms.is_some());

    let history = store.latency_history(4);
    assert_eq!(history.len(), 1);
    assert!(history[0].reachable);

    // Reconstructed forward path 1 -> 3 -> 4 and return path 4 -> 3 -> 1.
    assert!(store.edge(1, 3).is_some());
    assert!(store.edge(3, 4).is_some());
    assert!(store.edge(4, 3).is_some());
    assert!(store.edge(3, 1).is_some());
}

#[test]
fn reactive_pipeline_injects_traceroute_at_new_sender() {
    let rig = rig();
    {
        let mut store = rig.store.lock().unwrap();
        store.set_reactive_config(ReactiveConfig {
            enabled: true,
            from_node: Some(1),
            max_tries: 1,
            ..Default::default()
        });
    }

    let data = Data {
        portnum: port::TEXT_MESSAGE_APP,
        payload: b"first contact".to_vec(),
        ..Default::default()
    };
    let frame = ingest_packet("mqtt", gateway_bytes(77, 0xFFFF_FFFF, 5, data), &mqtt_meta()).unwrap();
    let processed = rig.handler.handle_frame(&frame).unwrap();

    let injected = rig.publisher.on_packet_received(&processed).unwrap();
    let key = injected.expect("reactive traceroute should fire");
    assert_eq!(key.to_num, 77);

    // On the wire: an encrypted traceroute addressed at the new sender.
    let sent = rig.transport.sent();
    assert_eq!(sent.len(), 1);
    let envelope = ServiceEnvelope::decode(sent[0].1.as_slice()).unwrap();
    let packet = envelope.packet.unwrap();
    assert_eq!(packet.to, 77);
    assert_eq!(packet.channel, 8); // LongFast under the default key

    // A second observation of the same node is rate-limited away.
    let data = Data {
        portnum: port::TEXT_MESSAGE_APP,
        payload: b"again".to_vec(),
        ..Default::default()
    };
    let frame = ingest_packet("mqtt", gateway_bytes(77, 0xFFFF_FFFF, 6, data), &mqtt_meta()).unwrap();
    let processed = rig.handler.handle_frame(&frame).unwrap();
    assert!(rig.publisher.on_packet_received(&processed).unwrap().is_none());
    assert_eq!(rig.transport.sent().len(), 1);
}

#[test]
fn undecodable_mqtt_frame_is_kept_encrypted() {
    let rig = rig();

    // What the fallback key recovers is not a valid payload (the store has
    // no key for this private channel, so the garbage plaintext stands in
    // for a wrong-key decryption).
    let fallback = ChannelKey::from_b64(DEFAULT_CHANNEL_KEY).unwrap();
    let ciphertext =
        meshwatch_core::crypto::encrypt_payload(&fallback, 11, 9, &[0xFF, 0xFF, 0xFF, 0xFF]);
    let packet = proto::MeshPacket {
        from: 9,
        to: 2,
        id: 11,
        channel: 31,
        payload_variant: Some(proto::PayloadVariant::Encrypted(ciphertext)),
        ..Default::default()
    };
    let raw = crafter::wrap_for_transport(packet, "Private", GATEWAY);

    let meta = IngestMeta {
        topic: Some("msh/2/e/Private/!000000aa".into()),
        interface_id: Some("mqtt-0".into()),
    };
    let frame = ingest_packet("mqtt", raw, &meta).unwrap();
    let processed = rig.handler.handle_frame(&frame).unwrap();
    assert_eq!(processed.portnum, None);

    let store = rig.store.lock().unwrap();
    let observed = store
        .packet(&meshwatch_core::store::PacketKey { packet_id: 11, from_num: 9, to_num: 2 })
        .unwrap();
    assert!(observed.raw_data.is_some());
    assert!(observed.data.is_none());

    // Metadata still flowed: nodes, channel membership, gateway edge.
    assert!(store.node(9).is_some());
    assert!(store.channel("Private", 31).is_some());
    assert!(store.edge(9, GATEWAY_NUM).is_some());
}
