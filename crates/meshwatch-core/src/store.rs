//! Domain store
//!
//! In-memory relational-style state shared by the handler and publisher:
//! nodes, channels, packet observations, edges, latency history, the
//! reactive-injection configuration, and periodic job definitions.
//!
//! Keying mirrors the mesh's identity rules: nodes by numeric address,
//! packets by `(packet_id, from, to)` since protocol packet ids are only
//! scoped per sender/recipient pair, edges by `(source, target)`.
//!
//! Mutations are individually atomic behind the owning mutex; a packet's
//! multi-entity update sequence is deliberately not one critical section
//! (matches the accepted concurrency model).

use crate::identity::{canonical_id, mac_repr, LowEntropyKeySet};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

/// Maximum characters kept from a job error message.
const MAX_JOB_ERROR_LEN: usize = 2048;
/// Shortest allowed job period.
pub const MIN_JOB_PERIOD_SECS: u64 = 30;
/// Upper bound on jobs claimed per scheduler tick.
pub const MAX_JOBS_PER_TICK: usize = 100;

/// One mesh participant, created on first observation and patched on every
/// subsequent one. Never deleted.
#[derive(Debug, Clone)]
pub struct Node {
    pub node_num: u32,
    pub node_id: String,
    pub mac_address: String,
    pub short_name: Option<String>,
    pub long_name: Option<String>,
    pub hw_model: Option<u32>,
    pub role: Option<String>,
    /// Base64 public key, if ever announced.
    pub public_key: Option<String>,
    /// Base64 private key, present only for locally-controlled virtual nodes.
    pub private_key: Option<String>,
    pub is_virtual: bool,
    pub is_low_entropy_public_key: bool,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub altitude: Option<i32>,
    pub battery_level: Option<u32>,
    pub voltage: Option<f32>,
    pub channel_utilization: Option<f32>,
    pub air_util_tx: Option<f32>,
    pub uptime_seconds: Option<u32>,
    pub temperature: Option<f32>,
    pub relative_humidity: Option<f32>,
    pub barometric_pressure: Option<f32>,
    pub latency_reachable: Option<bool>,
    pub latency_ms: Option<i64>,
    pub first_seen: SystemTime,
    pub last_seen: SystemTime,
    /// Transports this node has been observed on.
    pub interfaces: BTreeSet<String>,
}

impl Node {
    fn new(node_num: u32, now: SystemTime) -> Self {
        Self {
            node_num,
            node_id: canonical_id(node_num),
            mac_address: mac_repr(node_num),
            short_name: None,
            long_name: None,
            hw_model: None,
            role: None,
            public_key: None,
            private_key: None,
            is_virtual: false,
            is_low_entropy_public_key: false,
            latitude: None,
            longitude: None,
            altitude: None,
            battery_level: None,
            voltage: None,
            channel_utilization: None,
            air_util_tx: None,
            uptime_seconds: None,
            temperature: None,
            relative_humidity: None,
            barometric_pressure: None,
            latency_reachable: None,
            latency_ms: None,
            first_seen: now,
            last_seen: now,
            interfaces: BTreeSet::new(),
        }
    }
}

/// A named symmetric-key broadcast domain.
#[derive(Debug, Clone)]
pub struct Channel {
    pub channel_id: String,
    pub channel_num: u32,
    /// Base64 key material, if configured.
    pub psk: Option<String>,
    pub members: BTreeSet<u32>,
    pub interfaces: BTreeSet<String>,
}

/// Identity of one packet observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PacketKey {
    pub packet_id: u32,
    pub from_num: u32,
    pub to_num: u32,
}

/// One envelope observation with its transport/radio metadata.
#[derive(Debug, Clone)]
pub struct Packet {
    pub key: PacketKey,
    pub channel_id: Option<String>,
    pub rx_time: SystemTime,
    pub rx_rssi: Option<i32>,
    pub rx_snr: Option<f32>,
    pub hop_limit: Option<u32>,
    pub hop_start: Option<u32>,
    /// `hop_start - hop_limit`, floored at zero.
    pub hops: Option<u32>,
    pub want_ack: Option<bool>,
    /// None when no ack was requested; Some(false) until correlated.
    pub ackd: Option<bool>,
    pub pki_encrypted: bool,
    pub via_mqtt: bool,
    /// Base64 of the undecoded envelope, kept when decryption failed.
    pub raw_data: Option<String>,
    pub interfaces: BTreeSet<String>,
    pub data: Option<PacketData>,
}

/// Decoded payload envelope metadata, one-to-one with a packet.
#[derive(Debug, Clone)]
pub struct PacketData {
    pub portnum: i32,
    pub port_name: String,
    pub source: u32,
    pub dest: u32,
    pub request_id: u32,
    pub reply_id: u32,
    pub want_response: bool,
    /// None when no response was solicited; Some(false) until one arrives.
    pub got_response: Option<bool>,
    pub payload: Option<PayloadRecord>,
}

/// Kind-specific decoded payload, exactly one per packet.
#[derive(Debug, Clone)]
pub enum PayloadRecord {
    NodeInfo(NodeInfoPayload),
    Position(PositionPayload),
    Telemetry(TelemetryPayload),
    Routing(RoutingPayload),
    RouteDiscovery(RouteDiscoveryPayload),
    NeighborInfo(NeighborInfoPayload),
    Text(TextPayload),
}

#[derive(Debug, Clone, Default)]
pub struct NodeInfoPayload {
    pub long_name: Option<String>,
    pub short_name: Option<String>,
    pub hw_model: Option<u32>,
    pub role: Option<String>,
    pub public_key: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct PositionPayload {
    pub latitude_i: i32,
    pub longitude_i: i32,
    pub altitude: i32,
    pub time: u32,
    pub precision_bits: u32,
}

#[derive(Debug, Clone, Default)]
pub struct TelemetryPayload {
    pub time: u32,
    pub battery_level: Option<u32>,
    pub voltage: Option<f32>,
    pub channel_utilization: Option<f32>,
    pub air_util_tx: Option<f32>,
    pub uptime_seconds: Option<u32>,
    pub temperature: Option<f32>,
    pub relative_humidity: Option<f32>,
    pub barometric_pressure: Option<f32>,
    pub gas_resistance: Option<f32>,
    pub iaq: Option<u32>,
}

#[derive(Debug, Clone, Default)]
pub struct RoutingPayload {
    pub error_reason: Option<i32>,
    pub error_name: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct RouteDiscoveryPayload {
    pub route_towards: Option<RouteDiscoveryRoute>,
    pub route_back: Option<RouteDiscoveryRoute>,
}

/// One direction of a discovered route: the resolved node sequence, its
/// length, and per-hop SNR (already divided down from wire units).
#[derive(Debug, Clone, Default)]
pub struct RouteDiscoveryRoute {
    pub node_nums: Vec<u32>,
    pub hops: u32,
    pub snr: Vec<f32>,
}

#[derive(Debug, Clone, Default)]
pub struct NeighborInfoPayload {
    pub reporting_node: u32,
    pub last_sent_by: u32,
    pub broadcast_interval_secs: u32,
    pub neighbors: Vec<NeighborEntry>,
}

#[derive(Debug, Clone)]
pub struct NeighborEntry {
    pub node_num: u32,
    pub snr: f32,
}

#[derive(Debug, Clone, Default)]
pub struct TextPayload {
    pub text: String,
    pub raw_payload: Vec<u8>,
}

/// Directed adjacency between two nodes, upserted by direct observation and
/// by route reconstruction. Never deleted.
#[derive(Debug, Clone)]
pub struct Edge {
    pub source: u32,
    pub target: u32,
    pub last_packet: Option<PacketKey>,
    pub last_rx_rssi: Option<i32>,
    pub last_rx_snr: Option<f32>,
    /// Unresolved hops bridged by this edge; 0 means directly adjacent.
    pub last_hops: u32,
    pub interfaces: BTreeSet<String>,
    pub updated_at: SystemTime,
}

/// One reachability probe outcome (or a pending probe awaiting its reply).
#[derive(Debug, Clone)]
pub struct LatencyEntry {
    pub probe_message_id: Option<u32>,
    pub reachable: bool,
    pub latency_ms: Option<i64>,
    pub responded_at: Option<SystemTime>,
    pub created_at: SystemTime,
}

impl LatencyEntry {
    pub fn is_pending(&self) -> bool {
        !self.reachable && self.latency_ms.is_none() && self.responded_at.is_none()
    }
}

/// Singleton configuration for reactive traceroute injection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReactiveConfig {
    pub enabled: bool,
    pub from_node: Option<u32>,
    pub gateway_node: Option<u32>,
    pub channel_key: String,
    pub hop_limit: u32,
    pub hop_start: u32,
    pub want_ack: bool,
    /// Transports to react to; empty means any.
    pub listen_interfaces: BTreeSet<String>,
    pub max_tries: u32,
    pub window_secs: u64,
    /// Port names that may trigger injection; empty means all ports.
    pub trigger_ports: Vec<String>,
}

impl Default for ReactiveConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            from_node: None,
            gateway_node: None,
            channel_key: crate::crypto::DEFAULT_CHANNEL_KEY.to_string(),
            hop_limit: 3,
            hop_start: 3,
            want_ack: false,
            listen_interfaces: BTreeSet::new(),
            max_tries: 3,
            window_secs: 900,
            trigger_ports: Vec::new(),
        }
    }
}

/// Payload kind a periodic job publishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Text,
    Position,
    NodeInfo,
    Traceroute,
    Telemetry,
}

/// Last recorded run state of a periodic job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Idle,
    Success,
    Error,
    Skipped,
}

/// A schedulable publish definition. The engine executes jobs and records
/// run bookkeeping; scheduling policy (`next_run_at`) belongs to the
/// external scheduler via [`Store::claim_due_jobs`].
#[derive(Debug, Clone)]
pub struct PeriodicJob {
    pub id: u64,
    pub name: String,
    pub enabled: bool,
    pub kind: JobKind,
    /// Kind-specific parameters (message_text, lat/lon, telemetry fields...).
    pub options: serde_json::Value,
    pub from_node: Option<u32>,
    pub to_node: Option<u32>,
    pub channel_name: String,
    pub channel_key: String,
    pub interface: Option<String>,
    pub pki: bool,
    pub period_secs: u64,
    pub next_run_at: SystemTime,
    pub last_run_at: Option<SystemTime>,
    pub last_status: RunStatus,
    pub last_error: Option<String>,
}

/// Outcome of one periodic-job execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Success,
    Failure(String),
    /// Only produced when the job is disabled.
    Skipped(String),
}

/// The engine's shared state. Wrap in [`SharedStore`] for worker-pool use.
pub struct Store {
    nodes: HashMap<u32, Node>,
    channels: HashMap<(String, u32), Channel>,
    packets: HashMap<PacketKey, Packet>,
    edges: HashMap<(u32, u32), Edge>,
    latency_history: HashMap<u32, Vec<LatencyEntry>>,
    reactive_config: ReactiveConfig,
    jobs: HashMap<u64, PeriodicJob>,
    next_job_id: u64,
    key_audit: LowEntropyKeySet,
}

pub type SharedStore = Arc<Mutex<Store>>;

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    pub fn new() -> Self {
        Self {
            nodes: HashMap::new(),
            channels: HashMap::new(),
            packets: HashMap::new(),
            edges: HashMap::new(),
            latency_history: HashMap::new(),
            reactive_config: ReactiveConfig::default(),
            jobs: HashMap::new(),
            next_job_id: 1,
            key_audit: LowEntropyKeySet::builtin(),
        }
    }

    pub fn shared() -> SharedStore {
        Arc::new(Mutex::new(Self::new()))
    }

    // ---- nodes ----

    /// Fetch by number or create with derived identity fields; patch the
    /// identity fields when supplied values differ from stored ones.
    pub fn get_or_update_node(
        &mut self,
        node_num: u32,
        node_id: Option<&str>,
        mac_address: Option<&str>,
    ) -> &mut Node {
        let now = SystemTime::now();
        let node = self
            .nodes
            .entry(node_num)
            .or_insert_with(|| Node::new(node_num, now));

        if let Some(id) = node_id {
            if node.node_id != id {
                node.node_id = id.to_string();
            }
        }
        if let Some(mac) = mac_address {
            let normalized = mac.to_uppercase();
            if node.mac_address != normalized {
                node.mac_address = normalized;
            }
        }
        node
    }

    pub fn node(&self, node_num: u32) -> Option<&Node> {
        self.nodes.get(&node_num)
    }

    pub fn node_mut(&mut self, node_num: u32) -> Option<&mut Node> {
        self.nodes.get_mut(&node_num)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Record that a node was just seen on a transport.
    pub fn touch_node(&mut self, node_num: u32, interface: Option<&str>) {
        let node = self.get_or_update_node(node_num, None, None);
        node.last_seen = SystemTime::now();
        if let Some(iface) = interface {
            node.interfaces.insert(iface.to_string());
        }
    }

    /// Set a node's public key, recomputing the low-entropy flag on every
    /// write. Clearing the key clears the flag.
    pub fn set_node_public_key(&mut self, node_num: u32, public_key: Option<String>) {
        let flagged = public_key
            .as_deref()
            .map(|k| self.key_audit.contains_b64(k))
            .unwrap_or(false);
        let node = self.get_or_update_node(node_num, None, None);
        node.public_key = public_key;
        node.is_low_entropy_public_key = flagged;
    }

    // ---- channels ----

    pub fn upsert_channel(&mut self, channel_id: &str, channel_num: u32) -> &mut Channel {
        self.channels
            .entry((channel_id.to_string(), channel_num))
            .or_insert_with(|| Channel {
                channel_id: channel_id.to_string(),
                channel_num,
                psk: None,
                members: BTreeSet::new(),
                interfaces: BTreeSet::new(),
            })
    }

    pub fn channel(&self, channel_id: &str, channel_num: u32) -> Option<&Channel> {
        self.channels.get(&(channel_id.to_string(), channel_num))
    }

    /// Find any channel with this name, regardless of number. Used by the
    /// reactive engine to look up key material.
    pub fn channel_by_name(&self, channel_id: &str) -> Option<&Channel> {
        self.channels
            .iter()
            .find(|((id, _), _)| id == channel_id)
            .map(|(_, c)| c)
    }

    // ---- packets ----

    pub fn upsert_packet(&mut self, key: PacketKey) -> &mut Packet {
        self.packets.entry(key).or_insert_with(|| Packet {
            key,
            channel_id: None,
            rx_time: SystemTime::now(),
            rx_rssi: None,
            rx_snr: None,
            hop_limit: None,
            hop_start: None,
            hops: None,
            want_ack: None,
            ackd: None,
            pki_encrypted: false,
            via_mqtt: false,
            raw_data: None,
            interfaces: BTreeSet::new(),
            data: None,
        })
    }

    pub fn packet(&self, key: &PacketKey) -> Option<&Packet> {
        self.packets.get(key)
    }

    pub fn packet_mut(&mut self, key: &PacketKey) -> Option<&mut Packet> {
        self.packets.get_mut(key)
    }

    /// Correlation lookup: the original outbound packet whose id matches a
    /// reply's `request_id` and which was addressed to the replying node.
    pub fn find_request_packet(&self, request_id: u32, to_num: u32) -> Option<PacketKey> {
        self.packets
            .values()
            .find(|p| p.key.packet_id == request_id && p.key.to_num == to_num)
            .map(|p| p.key)
    }

    // ---- edges ----

    pub fn upsert_edge(&mut self, source: u32, target: u32) -> &mut Edge {
        self.edges.entry((source, target)).or_insert_with(|| Edge {
            source,
            target,
            last_packet: None,
            last_rx_rssi: None,
            last_rx_snr: None,
            last_hops: 0,
            interfaces: BTreeSet::new(),
            updated_at: SystemTime::now(),
        })
    }

    pub fn edge(&self, source: u32, target: u32) -> Option<&Edge> {
        self.edges.get(&(source, target))
    }

    pub fn edges(&self) -> impl Iterator<Item = &Edge> {
        self.edges.values()
    }

    // ---- latency history ----

    /// Append a pending probe entry for a node.
    pub fn record_pending_probe(&mut self, node_num: u32, probe_message_id: u32) {
        self.latency_history
            .entry(node_num)
            .or_default()
            .push(LatencyEntry {
                probe_message_id: Some(probe_message_id),
                reachable: false,
                latency_ms: None,
                responded_at: None,
                created_at: SystemTime::now(),
            });
    }

    /// Resolve a probe outcome for a node. Prefers the entry matching the
    /// probe id, falls back to the oldest pending entry, creates a fresh
    /// entry when neither exists. Fills in a missing probe id on fallback.
    pub fn resolve_probe(
        &mut self,
        node_num: u32,
        probe_message_id: u32,
        latency_ms: Option<i64>,
        responded_at: SystemTime,
    ) {
        let entries = self.latency_history.entry(node_num).or_default();

        let index = entries
            .iter()
            .position(|e| e.probe_message_id == Some(probe_message_id))
            .or_else(|| {
                entries
                    .iter()
                    .enumerate()
                    .filter(|(_, e)| e.is_pending())
                    .min_by_key(|(_, e)| e.created_at)
                    .map(|(i, _)| i)
            });

        match index {
            Some(i) => {
                let entry = &mut entries[i];
                entry.reachable = true;
                entry.latency_ms = latency_ms;
                entry.responded_at = Some(responded_at);
                if entry.probe_message_id.is_none() {
                    entry.probe_message_id = Some(probe_message_id);
                }
            }
            None => entries.push(LatencyEntry {
                probe_message_id: Some(probe_message_id),
                reachable: true,
                latency_ms,
                responded_at: Some(responded_at),
                created_at: SystemTime::now(),
            }),
        }
    }

    pub fn latency_history(&self, node_num: u32) -> &[LatencyEntry] {
        self.latency_history
            .get(&node_num)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    // ---- reactive config ----

    pub fn reactive_config(&self) -> &ReactiveConfig {
        &self.reactive_config
    }

    pub fn set_reactive_config(&mut self, config: ReactiveConfig) {
        self.reactive_config = config;
    }

    // ---- periodic jobs ----

    /// Register a job. Periods below the minimum are rejected.
    pub fn add_job(&mut self, mut job: PeriodicJob) -> Result<u64, String> {
        if job.period_secs < MIN_JOB_PERIOD_SECS {
            return Err(format!(
                "period must be at least {MIN_JOB_PERIOD_SECS} seconds"
            ));
        }
        let id = self.next_job_id;
        self.next_job_id += 1;
        job.id = id;
        self.jobs.insert(id, job);
        Ok(id)
    }

    pub fn job(&self, id: u64) -> Option<&PeriodicJob> {
        self.jobs.get(&id)
    }

    pub fn job_mut(&mut self, id: u64) -> Option<&mut PeriodicJob> {
        self.jobs.get_mut(&id)
    }

    /// Claim due jobs: select enabled jobs with `next_run_at <= now`,
    /// advance their `next_run_at` before returning them, bounded per tick.
    /// Two schedulers calling this never double-fire the same due instant.
    pub fn claim_due_jobs(&mut self, now: SystemTime) -> Vec<u64> {
        let mut due: Vec<u64> = self
            .jobs
            .values()
            .filter(|j| j.enabled && j.next_run_at <= now)
            .map(|j| j.id)
            .collect();
        due.sort_unstable();
        due.truncate(MAX_JOBS_PER_TICK);

        for id in &due {
            if let Some(job) = self.jobs.get_mut(id) {
                job.next_run_at = now + Duration::from_secs(job.period_secs);
            }
        }
        due
    }

    /// Record a job run. Error text is truncated; `next_run_at` is never
    /// touched here.
    pub fn record_job_run(&mut self, id: u64, outcome: &RunOutcome) {
        if let Some(job) = self.jobs.get_mut(&id) {
            job.last_run_at = Some(SystemTime::now());
            match outcome {
                RunOutcome::Success => {
                    job.last_status = RunStatus::Success;
                    job.last_error = None;
                }
                RunOutcome::Failure(reason) => {
                    job.last_status = RunStatus::Error;
                    let mut msg = reason.clone();
                    msg.truncate(MAX_JOB_ERROR_LEN);
                    job.last_error = Some(msg);
                }
                RunOutcome::Skipped(reason) => {
                    job.last_status = RunStatus::Skipped;
                    let mut msg = reason.clone();
                    msg.truncate(MAX_JOB_ERROR_LEN);
                    job.last_error = Some(msg);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine;

    fn job(enabled: bool, period: u64) -> PeriodicJob {
        PeriodicJob {
            id: 0,
            name: "test".into(),
            enabled,
            kind: JobKind::Text,
            options: serde_json::json!({"message_text": "hi"}),
            from_node: Some(1),
            to_node: Some(2),
            channel_name: "LongFast".into(),
            channel_key: crate::crypto::DEFAULT_CHANNEL_KEY.into(),
            interface: None,
            pki: false,
            period_secs: period,
            next_run_at: SystemTime::now(),
            last_run_at: None,
            last_status: RunStatus::Idle,
            last_error: None,
        }
    }

    #[test]
    fn node_get_or_create_then_patch() {
        let mut store = Store::new();
        let created = store.get_or_update_node(0x1234_5678, None, None);
        assert_eq!(created.node_id, "!12345678");
        assert_eq!(created.mac_address, "FF:FF:12:34:56:78");

        let patched = store.get_or_update_node(0x1234_5678, Some("!12345678"), Some("aa:bb:cc:dd:ee:ff"));
        assert_eq!(patched.mac_address, "AA:BB:CC:DD:EE:FF");
        assert_eq!(store.node_count(), 1);
    }

    #[test]
    fn public_key_writes_recompute_entropy_flag() {
        let mut store = Store::new();
        let weak = base64::engine::general_purpose::STANDARD.encode([0u8; 32]);
        store.set_node_public_key(42, Some(weak));
        assert!(store.node(42).unwrap().is_low_entropy_public_key);

        let strong =
            base64::engine::general_purpose::STANDARD.encode(b"0123456789abcdef0123456789abcdef");
        store.set_node_public_key(42, Some(strong));
        assert!(!store.node(42).unwrap().is_low_entropy_public_key);

        store.set_node_public_key(42, None);
        assert!(!store.node(42).unwrap().is_low_entropy_public_key);
    }

    #[test]
    fn packets_keyed_per_sender_recipient_pair() {
        let mut store = Store::new();
        let a = PacketKey { packet_id: 7, from_num: 1, to_num: 2 };
        let b = PacketKey { packet_id: 7, from_num: 3, to_num: 2 };
        store.upsert_packet(a);
        store.upsert_packet(b);
        assert!(store.packet(&a).is_some());
        assert!(store.packet(&b).is_some());
    }

    #[test]
    fn request_packet_lookup_matches_id_and_recipient() {
        let mut store = Store::new();
        let key = PacketKey { packet_id: 99, from_num: 1, to_num: 2 };
        store.upsert_packet(key);

        assert_eq!(store.find_request_packet(99, 2), Some(key));
        assert_eq!(store.find_request_packet(99, 3), None);
        assert_eq!(store.find_request_packet(98, 2), None);
    }

    #[test]
    fn probe_resolution_prefers_matching_probe_id() {
        let mut store = Store::new();
        store.record_pending_probe(5, 100);
        store.record_pending_probe(5, 200);

        store.resolve_probe(5, 200, Some(42), SystemTime::now());

        let entries = store.latency_history(5);
        assert_eq!(entries.len(), 2);
        let resolved = entries
            .iter()
            .find(|e| e.probe_message_id == Some(200))
            .unwrap();
        assert!(resolved.reachable);
        assert_eq!(resolved.latency_ms, Some(42));
        assert!(entries
            .iter()
            .find(|e| e.probe_message_id == Some(100))
            .unwrap()
            .is_pending());
    }

    #[test]
    fn probe_resolution_falls_back_to_oldest_pending_then_creates() {
        let mut store = Store::new();
        store.record_pending_probe(5, 100);

        // No entry has id 999; the pending one absorbs the result but keeps
        // its original probe id.
        store.resolve_probe(5, 999, Some(10), SystemTime::now());
        let entries = store.latency_history(5);
        assert_eq!(entries.len(), 1);
        assert!(entries[0].reachable);
        assert_eq!(entries[0].probe_message_id, Some(100));

        // Nothing pending left: a fresh resolved entry appears.
        store.resolve_probe(5, 777, Some(11), SystemTime::now());
        assert_eq!(store.latency_history(5).len(), 2);
    }

    #[test]
    fn job_claiming_advances_schedule_exactly_once() {
        let mut store = Store::new();
        let id = store.add_job(job(true, 60)).unwrap();

        let now = SystemTime::now();
        let first = store.claim_due_jobs(now);
        assert_eq!(first, vec![id]);

        // Same instant again: already advanced, nothing due.
        let second = store.claim_due_jobs(now);
        assert!(second.is_empty());
    }

    #[test]
    fn job_period_minimum_enforced() {
        let mut store = Store::new();
        assert!(store.add_job(job(true, 10)).is_err());
        assert!(store.add_job(job(true, MIN_JOB_PERIOD_SECS)).is_ok());
    }

    #[test]
    fn job_run_bookkeeping_truncates_errors() {
        let mut store = Store::new();
        let id = store.add_job(job(true, 60)).unwrap();

        store.record_job_run(id, &RunOutcome::Failure("x".repeat(5000)));
        let job = store.job(id).unwrap();
        assert_eq!(job.last_status, RunStatus::Error);
        assert_eq!(job.last_error.as_ref().unwrap().len(), MAX_JOB_ERROR_LEN);

        store.record_job_run(id, &RunOutcome::Success);
        assert_eq!(store.job(id).unwrap().last_error, None);
    }
}
