//! Inbound packet handling
//!
//! The protocol state machine. For every normalized frame:
//!
//! ```text
//! frame -> envelope decode -> node/channel/packet upserts -> gateway edge
//!       -> payload branch (decoded | symmetric decrypt | PKI decrypt)
//!       -> port dispatch -> probe correlation -> bookkeeping
//! ```
//!
//! Decode-path failures are recovered locally: a malformed or undecryptable
//! packet is logged and left best-effort-processed, never aborting ingestion
//! of the packets behind it.

use crate::crypto::{self, ChannelKey, PkiCapability};
use crate::identity::{canonical_id, is_broadcast, mac_repr, parse_id};
use crate::ingest::NormalizedFrame;
use crate::proto::{self, port, Data, MeshPacket, RoutingVariant, ServiceEnvelope, TelemetryVariant};
use crate::route::{build_edge_segments, resolve_hops, scale_snr};
use crate::store::{
    NeighborEntry, NeighborInfoPayload, NodeInfoPayload, PacketKey, PayloadRecord,
    PositionPayload, RouteDiscoveryPayload, RouteDiscoveryRoute, RoutingPayload, SharedStore,
    Store, TelemetryPayload, TextPayload,
};
use base64::Engine;
use prost::Message;
use std::sync::Arc;
use std::time::SystemTime;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Frame-level failures. Anything past envelope decode is recovered
/// internally and never surfaces here.
#[derive(Error, Debug)]
pub enum HandleError {
    #[error("invalid transport frame: {0}")]
    Frame(#[from] prost::DecodeError),

    #[error("envelope carried no packet")]
    EmptyEnvelope,
}

/// Summary of one processed frame, consumed by the reactive engine.
#[derive(Debug, Clone)]
pub struct ProcessedPacket {
    pub packet_key: PacketKey,
    /// Port of the decoded payload; None when the packet stayed encrypted.
    pub portnum: Option<i32>,
    pub port_name: Option<&'static str>,
    pub channel_id: String,
    pub channel_num: u32,
    /// Gateway node that relayed the frame, when known.
    pub gateway_num: Option<u32>,
    pub interface_ref: String,
    pub pki_encrypted: bool,
}

/// Device role names as announced in node-info payloads.
fn role_name(role: i32) -> Option<&'static str> {
    match role {
        0 => Some("CLIENT"),
        1 => Some("CLIENT_MUTE"),
        2 => Some("ROUTER"),
        3 => Some("ROUTER_CLIENT"),
        4 => Some("REPEATER"),
        5 => Some("TRACKER"),
        6 => Some("SENSOR"),
        7 => Some("TAK"),
        8 => Some("CLIENT_HIDDEN"),
        9 => Some("LOST_AND_FOUND"),
        10 => Some("TAK_TRACKER"),
        _ => None,
    }
}

fn round2(value: f32) -> f32 {
    (value * 100.0).round() / 100.0
}

/// Mutable view a port handler works against.
struct Ctx<'a> {
    store: &'a mut Store,
    packet_key: PacketKey,
    from_num: u32,
    response_time: SystemTime,
    interface_ref: String,
}

impl Ctx<'_> {
    fn set_payload(&mut self, record: PayloadRecord) {
        if let Some(packet) = self.store.packet_mut(&self.packet_key) {
            if let Some(data) = packet.data.as_mut() {
                data.payload = Some(record);
            }
        }
    }

    fn request_id(&self) -> u32 {
        self.store
            .packet(&self.packet_key)
            .and_then(|p| p.data.as_ref())
            .map(|d| d.request_id)
            .unwrap_or(0)
    }
}

type PortHandler = fn(&mut Ctx, &[u8]);

/// Port dispatch table; unknown ports fall through to [`handle_other_entry`].
const PORT_TABLE: &[(i32, PortHandler)] = &[
    (port::NODEINFO_APP, handle_nodeinfo),
    (port::NEIGHBORINFO_APP, handle_neighborinfo),
    (port::POSITION_APP, handle_position),
    (port::RANGE_TEST_APP, handle_range_test),
    (port::TELEMETRY_APP, handle_telemetry),
    (port::TRACEROUTE_APP, handle_route_discovery),
    (port::ROUTING_APP, handle_routing),
    (port::TEXT_MESSAGE_APP, handle_text_message),
];

fn handler_for(portnum: i32) -> PortHandler {
    PORT_TABLE
        .iter()
        .find(|(p, _)| *p == portnum)
        .map(|(_, h)| *h)
        .unwrap_or(handle_other_entry)
}

fn handle_other_entry(ctx: &mut Ctx, payload: &[u8]) {
    let portnum = ctx
        .store
        .packet(&ctx.packet_key)
        .and_then(|p| p.data.as_ref())
        .map(|d| d.portnum)
        .unwrap_or(port::UNKNOWN_APP);
    info!(portnum, len = payload.len(), "unhandled port");
}

/// Resolve the original outbound packet a reply answers and record the
/// latency outcome on it, its recipient node, and the latency history.
///
/// One routine serves the generic step-7 path, the routing-ack handler, and
/// the traceroute-response handler; re-running it for the same exchange is
/// harmless.
pub(crate) fn correlate_response(
    store: &mut Store,
    request_id: u32,
    replying_node: u32,
    response_time: SystemTime,
) -> Option<PacketKey> {
    let original_key = store.find_request_packet(request_id, replying_node)?;

    let request_time = {
        let original = store.packet_mut(&original_key)?;
        original.ackd = Some(true);
        if let Some(data) = original.data.as_mut() {
            data.got_response = Some(true);
        }
        original.rx_time
    };

    let latency_ms = response_time
        .duration_since(request_time)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0);

    if let Some(node) = store.node_mut(replying_node) {
        node.latency_reachable = Some(true);
        node.latency_ms = Some(latency_ms);
    }
    store.resolve_probe(replying_node, original_key.packet_id, Some(latency_ms), response_time);

    info!(
        request_id,
        node = %canonical_id(replying_node),
        latency_ms,
        "correlated response to outbound packet"
    );
    Some(original_key)
}

fn handle_nodeinfo(ctx: &mut Ctx, payload: &[u8]) {
    let user = match proto::User::decode(payload) {
        Ok(user) => user,
        Err(e) => {
            warn!(error = %e, "node-info payload failed to decode");
            return;
        }
    };

    let node_num = parse_id(&user.id).unwrap_or_else(|_| {
        debug!(id = %user.id, "unparseable user id, falling back to envelope sender");
        ctx.from_num
    });
    let mac = mac_repr(node_num);
    let role = role_name(user.role).unwrap_or("CLIENT").to_string();
    let public_key = if user.public_key.is_empty() {
        None
    } else {
        Some(base64::engine::general_purpose::STANDARD.encode(&user.public_key))
    };
    let hw_model = if user.hw_model == 0 { None } else { Some(user.hw_model) };
    let short_name = if user.short_name.is_empty() { None } else { Some(user.short_name.clone()) };
    let long_name = if user.long_name.is_empty() { None } else { Some(user.long_name.clone()) };

    info!(node = %canonical_id(node_num), role = %role, "node-info received");

    ctx.set_payload(PayloadRecord::NodeInfo(NodeInfoPayload {
        long_name: long_name.clone(),
        short_name: short_name.clone(),
        hw_model,
        role: Some(role.clone()),
        public_key: public_key.clone(),
    }));

    {
        let node = ctx
            .store
            .get_or_update_node(node_num, Some(&canonical_id(node_num)), Some(&mac));
        node.long_name = long_name;
        node.short_name = short_name;
        node.hw_model = hw_model;
        node.role = Some(role);
        node.last_seen = SystemTime::now();
    }
    ctx.store.set_node_public_key(node_num, public_key);
}

fn handle_neighborinfo(ctx: &mut Ctx, payload: &[u8]) {
    let neighbor_info = match proto::NeighborInfo::decode(payload) {
        Ok(info) => info,
        Err(e) => {
            warn!(error = %e, "neighbor-info payload failed to decode");
            return;
        }
    };

    let reporting_num = if neighbor_info.node_id != 0 && !is_broadcast(neighbor_info.node_id) {
        neighbor_info.node_id
    } else {
        ctx.from_num
    };
    ctx.store.touch_node(reporting_num, Some(&ctx.interface_ref));

    if neighbor_info.last_sent_by_id != 0 && !is_broadcast(neighbor_info.last_sent_by_id) {
        ctx.store.touch_node(neighbor_info.last_sent_by_id, None);
    }

    let mut entries = Vec::with_capacity(neighbor_info.neighbors.len());
    for advertised in &neighbor_info.neighbors {
        if advertised.node_id == 0 || is_broadcast(advertised.node_id) {
            debug!(node_id = advertised.node_id, "skipping unresolvable neighbor");
            continue;
        }
        let snr = round2(advertised.snr);
        ctx.store.touch_node(advertised.node_id, None);
        entries.push(NeighborEntry { node_num: advertised.node_id, snr });

        // The advertised neighbor heard the reporter directly.
        let packet_key = ctx.packet_key;
        let iface = ctx.interface_ref.clone();
        let edge = ctx.store.upsert_edge(advertised.node_id, reporting_num);
        edge.last_packet = Some(packet_key);
        edge.last_rx_snr = Some(snr);
        edge.last_hops = 0;
        edge.updated_at = SystemTime::now();
        edge.interfaces.insert(iface);
    }

    info!(
        reporter = %canonical_id(reporting_num),
        neighbors = entries.len(),
        "neighbor table replaced"
    );

    ctx.set_payload(PayloadRecord::NeighborInfo(NeighborInfoPayload {
        reporting_node: reporting_num,
        last_sent_by: neighbor_info.last_sent_by_id,
        broadcast_interval_secs: neighbor_info.node_broadcast_interval_secs,
        neighbors: entries,
    }));
}

fn handle_position(ctx: &mut Ctx, payload: &[u8]) {
    let pos = match proto::Position::decode(payload) {
        Ok(pos) => pos,
        Err(e) => {
            warn!(error = %e, "position payload failed to decode");
            return;
        }
    };

    info!(
        lat = pos.latitude_i as f64 / 1e7,
        lon = pos.longitude_i as f64 / 1e7,
        alt = pos.altitude,
        "position received"
    );

    ctx.set_payload(PayloadRecord::Position(PositionPayload {
        latitude_i: pos.latitude_i,
        longitude_i: pos.longitude_i,
        altitude: pos.altitude,
        time: pos.time,
        precision_bits: pos.precision_bits,
    }));

    // Patch only the fields this report actually carries.
    let from = ctx.from_num;
    if let Some(node) = ctx.store.node_mut(from) {
        if pos.latitude_i != 0 {
            node.latitude = Some(pos.latitude_i as f64 / 1e7);
        }
        if pos.longitude_i != 0 {
            node.longitude = Some(pos.longitude_i as f64 / 1e7);
        }
        if pos.altitude != 0 {
            node.altitude = Some(pos.altitude);
        }
    }
}

fn handle_range_test(_ctx: &mut Ctx, payload: &[u8]) {
    info!(payload = %String::from_utf8_lossy(payload), "range test");
}

fn handle_telemetry(ctx: &mut Ctx, payload: &[u8]) {
    let telemetry = match proto::Telemetry::decode(payload) {
        Ok(t) => t,
        Err(e) => {
            warn!(error = %e, "telemetry payload failed to decode");
            return;
        }
    };

    let mut record = TelemetryPayload { time: telemetry.time, ..Default::default() };
    match &telemetry.variant {
        Some(TelemetryVariant::DeviceMetrics(dev)) => {
            record.battery_level = dev.battery_level;
            record.voltage = dev.voltage.map(round2);
            record.channel_utilization = dev.channel_utilization.map(round2);
            record.air_util_tx = dev.air_util_tx.map(round2);
            record.uptime_seconds = dev.uptime_seconds;

            let from = ctx.from_num;
            if let Some(node) = ctx.store.node_mut(from) {
                node.battery_level = record.battery_level;
                node.voltage = record.voltage;
                node.channel_utilization = record.channel_utilization;
                node.air_util_tx = record.air_util_tx;
                node.uptime_seconds = record.uptime_seconds;
            }
        }
        Some(TelemetryVariant::EnvironmentMetrics(env)) => {
            record.temperature = env.temperature.map(round2);
            record.relative_humidity = env.relative_humidity.map(round2);
            record.barometric_pressure = env.barometric_pressure.map(round2);
            record.gas_resistance = env.gas_resistance.map(round2);
            record.iaq = env.iaq;

            let from = ctx.from_num;
            if let Some(node) = ctx.store.node_mut(from) {
                node.temperature = record.temperature;
                node.relative_humidity = record.relative_humidity;
                node.barometric_pressure = record.barometric_pressure;
            }
        }
        None => debug!("telemetry carried no metric family"),
    }

    ctx.set_payload(PayloadRecord::Telemetry(record));
}

fn handle_route_discovery(ctx: &mut Ctx, payload: &[u8]) {
    let route_discovery = match proto::RouteDiscovery::decode(payload) {
        Ok(rd) => rd,
        Err(e) => {
            warn!(error = %e, "route-discovery payload failed to decode");
            return;
        }
    };

    let request_id = ctx.request_id();

    if request_id == 0 {
        // The original solicitation passing through: record the outward
        // path but derive no edges. Edges only come from responses.
        let mut forward: Vec<u32> = vec![ctx.from_num];
        forward.extend(&route_discovery.route);

        let mut resolved = Vec::with_capacity(forward.len());
        for num in forward {
            if is_broadcast(num) {
                warn!("broadcast sentinel in outbound traceroute, skipping hop");
                continue;
            }
            ctx.store
                .get_or_update_node(num, Some(&canonical_id(num)), Some(&mac_repr(num)));
            ctx.store.touch_node(num, None);
            resolved.push(num);
        }

        let hops = resolved.len() as u32;
        ctx.set_payload(PayloadRecord::RouteDiscovery(RouteDiscoveryPayload {
            route_towards: Some(RouteDiscoveryRoute {
                node_nums: resolved,
                hops,
                snr: scale_snr(&route_discovery.snr_towards),
            }),
            route_back: None,
        }));
        return;
    }

    // A response to an earlier traceroute: correlate, then reconstruct
    // both directions.
    let from_num = ctx.from_num;
    let response_time = ctx.response_time;
    let Some(original_key) = correlate_response(ctx.store, request_id, from_num, response_time)
    else {
        debug!(request_id, "no outbound packet matches traceroute response");
        return;
    };

    let mut forward_nums: Vec<u32> = vec![original_key.from_num];
    forward_nums.extend(&route_discovery.route);
    forward_nums.push(from_num);
    let forward_snr = scale_snr(&route_discovery.snr_towards);

    let mut backward_nums: Vec<u32> = vec![from_num];
    backward_nums.extend(&route_discovery.route_back);
    let backward_snr = scale_snr(&route_discovery.snr_back);

    let forward = resolve_hops(&forward_nums);
    let backward = resolve_hops(&backward_nums);

    for hop in forward.iter().chain(backward.iter()).flatten() {
        ctx.store
            .get_or_update_node(*hop, Some(&canonical_id(*hop)), Some(&mac_repr(*hop)));
        ctx.store.touch_node(*hop, None);
    }

    let response_key = ctx.packet_key;
    for segment in build_edge_segments(&forward, &forward_snr)
        .into_iter()
        .chain(build_edge_segments(&backward, &backward_snr))
    {
        let edge = ctx.store.upsert_edge(segment.source, segment.target);
        edge.last_packet = Some(response_key);
        edge.last_rx_rssi = Some(0);
        edge.last_rx_snr = segment.snr.map(round2);
        edge.last_hops = segment.hop_count;
        edge.updated_at = SystemTime::now();
    }

    let known = |hops: &[Option<u32>]| hops.iter().flatten().copied().collect::<Vec<u32>>();
    let forward_known = known(&forward);
    let backward_known = known(&backward);
    ctx.set_payload(PayloadRecord::RouteDiscovery(RouteDiscoveryPayload {
        route_towards: Some(RouteDiscoveryRoute {
            hops: forward_known.len() as u32,
            node_nums: forward_known,
            snr: forward_snr,
        }),
        route_back: Some(RouteDiscoveryRoute {
            hops: backward_known.len() as u32,
            node_nums: backward_known,
            snr: backward_snr,
        }),
    }));
}

fn handle_routing(ctx: &mut Ctx, payload: &[u8]) {
    let routing = match proto::Routing::decode(payload) {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "routing payload failed to decode");
            return;
        }
    };

    let error_reason = match routing.variant {
        Some(RoutingVariant::ErrorReason(reason)) if reason != 0 => Some(reason),
        _ => None,
    };

    ctx.set_payload(PayloadRecord::Routing(RoutingPayload {
        error_reason,
        error_name: error_reason.map(|r| proto::routing_error_name(r).to_string()),
    }));

    // An errored ack tells us the request failed; only clean acks count as
    // reachability evidence.
    let request_id = ctx.request_id();
    if request_id != 0 && error_reason.is_none() {
        let from_num = ctx.from_num;
        let response_time = ctx.response_time;
        correlate_response(ctx.store, request_id, from_num, response_time);
    } else if let Some(reason) = error_reason {
        info!(reason = proto::routing_error_name(reason), "routing error reported");
    }
}

fn handle_text_message(ctx: &mut Ctx, payload: &[u8]) {
    let text = String::from_utf8_lossy(payload).into_owned();
    info!(text = %text, "text message");
    ctx.set_payload(PayloadRecord::Text(TextPayload {
        text,
        raw_payload: payload.to_vec(),
    }));
}

/// The inbound state machine. Owns nothing but references: the store and
/// the optional PKI capability are injected by the process entry point.
pub struct PacketHandler {
    store: SharedStore,
    pki: Option<Arc<dyn PkiCapability>>,
}

impl PacketHandler {
    pub fn new(store: SharedStore, pki: Option<Arc<dyn PkiCapability>>) -> Self {
        Self { store, pki }
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    /// Process one normalized frame end to end.
    pub fn handle_frame(&self, frame: &NormalizedFrame) -> Result<ProcessedPacket, HandleError> {
        let envelope = ServiceEnvelope::decode(frame.raw_envelope.as_slice())?;
        let packet = envelope.packet.ok_or(HandleError::EmptyEnvelope)?;

        let channel_id = if !envelope.channel_id.is_empty() {
            envelope.channel_id.clone()
        } else {
            frame.channel_id.clone()
        };
        let gateway_id = if !envelope.gateway_id.is_empty() {
            Some(envelope.gateway_id.clone())
        } else {
            frame.gateway_id.clone()
        };

        let pki_encrypted = packet.pki_encrypted || channel_id == "PKI";
        let packet_key = PacketKey {
            packet_id: packet.id,
            from_num: packet.from,
            to_num: packet.to,
        };

        let mut store = self.store.lock().expect("store mutex poisoned");
        let store = &mut *store;

        // Step 1: identity upserts.
        store.get_or_update_node(
            packet.from,
            Some(&canonical_id(packet.from)),
            Some(&mac_repr(packet.from)),
        );
        store.touch_node(packet.from, Some(&frame.interface_ref));
        store.get_or_update_node(
            packet.to,
            Some(&canonical_id(packet.to)),
            Some(&mac_repr(packet.to)),
        );

        let gateway_num = match gateway_id.as_deref().map(parse_id) {
            Some(Ok(num)) => {
                store.get_or_update_node(num, gateway_id.as_deref(), Some(&mac_repr(num)));
                store.touch_node(num, Some(&frame.interface_ref));
                Some(num)
            }
            Some(Err(e)) => {
                warn!(error = %e, "gateway id unparseable, skipping gateway edge");
                None
            }
            None => None,
        };

        // Step 2: channel membership.
        {
            let channel = store.upsert_channel(&channel_id, packet.channel);
            channel.interfaces.insert(frame.interface_ref.clone());
            channel.members.insert(packet.from);
            channel.members.insert(packet.to);
        }

        // Step 3: packet observation.
        let hops = packet.hop_start.saturating_sub(packet.hop_limit);
        let response_time;
        {
            let observed = store.upsert_packet(packet_key);
            observed.channel_id = Some(channel_id.clone());
            observed.rx_rssi = Some(packet.rx_rssi);
            observed.rx_snr = Some(round2(packet.rx_snr));
            observed.hop_limit = Some(packet.hop_limit);
            observed.hop_start = Some(packet.hop_start);
            observed.hops = Some(hops);
            observed.want_ack = Some(packet.want_ack);
            if observed.ackd.is_none() {
                observed.ackd = if packet.want_ack { Some(false) } else { None };
            }
            observed.pki_encrypted = pki_encrypted;
            observed.via_mqtt = frame.via_mqtt || packet.via_mqtt;
            observed.interfaces.insert(frame.interface_ref.clone());
            if let Some(ciphertext) = packet.encrypted() {
                observed.raw_data =
                    Some(base64::engine::general_purpose::STANDARD.encode(ciphertext));
            }
            response_time = observed.rx_time;
        }

        // Step 4: direct edge from the sender to whichever gateway heard it.
        if let Some(gw) = gateway_num {
            let edge = store.upsert_edge(packet.from, gw);
            edge.last_packet = Some(packet_key);
            edge.last_rx_rssi = Some(packet.rx_rssi);
            edge.last_rx_snr = Some(round2(packet.rx_snr));
            edge.last_hops = hops;
            edge.updated_at = SystemTime::now();
            edge.interfaces.insert(frame.interface_ref.clone());
        }

        // Step 5: payload branch.
        let decoded = match &packet.payload_variant {
            Some(proto::PayloadVariant::Decoded(data)) => Some(data.clone()),
            Some(proto::PayloadVariant::Encrypted(ciphertext)) => {
                if pki_encrypted {
                    self.decrypt_pki(store, &packet)
                } else {
                    Self::decrypt_symmetric(store, &channel_id, &packet, ciphertext)
                }
            }
            None => {
                info!(packet_id = packet.id, "packet carried no payload");
                None
            }
        };

        let Some(data) = decoded else {
            return Ok(ProcessedPacket {
                packet_key,
                portnum: None,
                port_name: None,
                channel_id,
                channel_num: packet.channel,
                gateway_num,
                interface_ref: frame.interface_ref.clone(),
                pki_encrypted,
            });
        };

        // Step 6: record decode metadata, then dispatch by port.
        {
            let observed = store.upsert_packet(packet_key);
            observed.data = Some(crate::store::PacketData {
                portnum: data.portnum,
                port_name: port::name(data.portnum).to_string(),
                source: data.source,
                dest: data.dest,
                request_id: data.request_id,
                reply_id: data.reply_id,
                want_response: data.want_response,
                got_response: if data.want_response { Some(false) } else { None },
                payload: None,
            });
        }

        let mut ctx = Ctx {
            store,
            packet_key,
            from_num: packet.from,
            response_time,
            interface_ref: frame.interface_ref.clone(),
        };
        handler_for(data.portnum)(&mut ctx, &data.payload);

        // Step 7: generic correlation, then close out this observation.
        if data.request_id != 0 {
            correlate_response(store, data.request_id, packet.from, response_time);
        }
        if let Some(observed) = store.packet_mut(&packet_key) {
            if let Some(packet_data) = observed.data.as_mut() {
                packet_data.got_response = Some(true);
            }
        }

        Ok(ProcessedPacket {
            packet_key,
            portnum: Some(data.portnum),
            port_name: Some(port::name(data.portnum)),
            channel_id,
            channel_num: packet.channel,
            gateway_num,
            interface_ref: frame.interface_ref.clone(),
            pki_encrypted,
        })
    }

    /// Symmetric branch: the channel's configured key, or the default key
    /// when none is known.
    fn decrypt_symmetric(
        store: &Store,
        channel_id: &str,
        packet: &MeshPacket,
        ciphertext: &[u8],
    ) -> Option<Data> {
        let material = store
            .channel(channel_id, packet.channel)
            .and_then(|c| c.psk.clone())
            .unwrap_or_else(|| crypto::DEFAULT_CHANNEL_KEY.to_string());

        let key = match ChannelKey::from_b64(&material) {
            Ok(key) => key,
            Err(e) => {
                warn!(channel = channel_id, error = %e, "channel key unusable");
                return None;
            }
        };

        match crypto::decrypt_payload(&key, packet.id, packet.from, ciphertext) {
            Ok(data) => Some(data),
            Err(e) => {
                info!(packet_id = packet.id, error = %e, "could not decrypt packet");
                None
            }
        }
    }

    /// PKI branch: delegate to the capability with the recipient's private
    /// key, then parse the plaintext as the inner payload.
    fn decrypt_pki(&self, store: &Store, packet: &MeshPacket) -> Option<Data> {
        let Some(pki) = self.pki.as_ref() else {
            info!("PKI capability unavailable, packet left encrypted");
            return None;
        };
        let Some(private_key) = store.node(packet.to).and_then(|n| n.private_key.clone()) else {
            info!(to = %canonical_id(packet.to), "no private key for recipient, skipping PKI decrypt");
            return None;
        };

        match pki.decrypt(packet, &private_key) {
            Ok(plaintext) => match Data::decode(plaintext.as_slice()) {
                Ok(data) => Some(data),
                Err(e) => {
                    warn!(error = %e, "PKI plaintext did not parse");
                    None
                }
            },
            Err(e) => {
                info!(error = %e, "PKI decryption skipped");
                None
            }
        }
    }
}

/// Build an encrypted test frame the way a gateway would publish it.
#[cfg(test)]
pub(crate) fn test_frame(
    from: u32,
    to: u32,
    packet_id: u32,
    data: Data,
    gateway: &str,
) -> NormalizedFrame {
    use crate::crafter;

    let params = crafter::EnvelopeParams {
        from_num: from,
        to_num: to,
        channel_name: "LongFast".into(),
        channel_key: crypto::DEFAULT_CHANNEL_KEY.into(),
        packet_id,
        hop_limit: 3,
        hop_start: 3,
        want_ack: false,
        pki_mode: false,
        ciphertext: None,
        public_key: None,
    };
    let packet = crafter::craft_envelope(&params, data).unwrap();
    NormalizedFrame {
        gateway_id: Some(gateway.to_string()),
        channel_id: "LongFast".into(),
        raw_envelope: crafter::wrap_for_transport(packet, "LongFast", gateway),
        interface_ref: "mqtt-0".into(),
        via_mqtt: true,
    }
}
