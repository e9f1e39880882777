//! Mesh Observer Command-Line Interface
//!
//! This CLI provides offline tools for working with mesh gateway frames:
//! - Decoding and decrypting captured service envelopes
//! - Crafting encrypted frames for injection
//! - Channel hash and node identifier utilities
//! - Replaying captured frames through the ingestion pipeline

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use meshwatch_core::crafter::{self, EnvelopeParams};
use meshwatch_core::crypto::{self, ChannelKey, DEFAULT_CHANNEL_KEY};
use meshwatch_core::handler::PacketHandler;
use meshwatch_core::identity::{canonical_id, parse_id};
use meshwatch_core::ingest::{ingest_packet, IngestMeta};
use meshwatch_core::proto::{port, ServiceEnvelope};
use meshwatch_core::store::Store;
use prost::Message;
use std::fs;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(name = "meshwatch")]
#[command(author, version, about = "Mesh observer CLI", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Decode a captured service envelope
    Decode {
        /// Hex-encoded frame (or @path to read raw bytes from a file)
        frame: String,

        /// Base64 channel key for decryption
        #[arg(short, long, default_value = DEFAULT_CHANNEL_KEY)]
        key: String,
    },

    /// Craft an encrypted text frame
    CraftText {
        /// Message text
        #[arg(short, long)]
        message: String,

        /// Sender node id (!xxxxxxxx)
        #[arg(long)]
        from: String,

        /// Recipient node id (!xxxxxxxx), broadcast by default
        #[arg(long, default_value = "!ffffffff")]
        to: String,

        /// Channel name
        #[arg(long, default_value = "LongFast")]
        channel: String,

        /// Base64 channel key
        #[arg(short, long, default_value = DEFAULT_CHANNEL_KEY)]
        key: String,

        /// Packet id (random when omitted)
        #[arg(long)]
        packet_id: Option<u32>,
    },

    /// Compute the channel hash for a name/key pair
    ChannelHash {
        /// Channel name
        name: String,

        /// Base64 channel key
        #[arg(short, long, default_value = DEFAULT_CHANNEL_KEY)]
        key: String,
    },

    /// Convert a node identifier between numeric and canonical forms
    NodeId {
        /// Node number or !xxxxxxxx id
        node: String,
    },

    /// Replay a file of captured frames through the ingestion pipeline
    /// and print the resulting mesh picture
    Replay {
        /// File with one hex-encoded frame per line
        input: PathBuf,

        /// Base64 channel key used for decryption
        #[arg(short, long, default_value = DEFAULT_CHANNEL_KEY)]
        key: String,

        /// MQTT topic the frames were captured on
        #[arg(long, default_value = "msh/2/e/LongFast/!00000000")]
        topic: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let log_level = match cli.verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .init();

    match cli.command {
        Commands::Decode { frame, key } => cmd_decode(frame, key),
        Commands::CraftText {
            message,
            from,
            to,
            channel,
            key,
            packet_id,
        } => cmd_craft_text(message, from, to, channel, key, packet_id),
        Commands::ChannelHash { name, key } => cmd_channel_hash(name, key),
        Commands::NodeId { node } => cmd_node_id(node),
        Commands::Replay { input, key, topic } => cmd_replay(input, key, topic),
    }
}

/// Read a frame argument: hex inline, or raw bytes from `@path`.
fn read_frame(arg: &str) -> Result<Vec<u8>> {
    if let Some(path) = arg.strip_prefix('@') {
        return fs::read(path).with_context(|| format!("reading frame from {path}"));
    }
    hex::decode(arg.trim()).context("frame argument is not valid hex")
}

fn cmd_decode(frame: String, key: String) -> Result<()> {
    let raw = read_frame(&frame)?;
    let envelope = ServiceEnvelope::decode(raw.as_slice()).context("not a service envelope")?;
    let packet = envelope.packet.context("envelope carries no packet")?;

    println!("channel:  {}", envelope.channel_id);
    println!("gateway:  {}", envelope.gateway_id);
    println!("from:     {}", canonical_id(packet.from));
    println!("to:       {}", canonical_id(packet.to));
    println!("id:       {}", packet.id);
    println!(
        "hops:     {} (start {}, limit {})",
        packet.hop_start.saturating_sub(packet.hop_limit),
        packet.hop_start,
        packet.hop_limit
    );
    if packet.rx_rssi != 0 || packet.rx_snr != 0.0 {
        println!("signal:   rssi {} / snr {}", packet.rx_rssi, packet.rx_snr);
    }

    let data = if let Some(data) = packet.decoded() {
        data.clone()
    } else if let Some(ciphertext) = packet.encrypted() {
        if packet.pki_encrypted || envelope.channel_id == "PKI" {
            bail!("packet is PKI-encrypted; cannot decrypt offline");
        }
        let channel_key = ChannelKey::from_b64(&key)?;
        crypto::decrypt_payload(&channel_key, packet.id, packet.from, ciphertext)
            .context("decryption failed (wrong key?)")?
    } else {
        bail!("packet carries no payload");
    };

    println!("port:     {}", port::name(data.portnum));
    if data.request_id != 0 {
        println!("reply to: {}", data.request_id);
    }
    println!("payload:  {}", hex::encode(&data.payload));
    Ok(())
}

fn cmd_craft_text(
    message: String,
    from: String,
    to: String,
    channel: String,
    key: String,
    packet_id: Option<u32>,
) -> Result<()> {
    let from_num = parse_id(&from)?;
    let to_num = parse_id(&to)?;
    let packet_id = packet_id.unwrap_or_else(rand_packet_id);

    let params = EnvelopeParams {
        from_num,
        to_num,
        channel_name: channel.clone(),
        channel_key: key,
        packet_id,
        hop_limit: 3,
        hop_start: 3,
        want_ack: false,
        pki_mode: false,
        ciphertext: None,
        public_key: None,
    };
    let packet = crafter::craft_envelope(&params, crafter::craft_text(&message))?;
    let frame = crafter::wrap_for_transport(packet, &channel, &from);

    info!(packet_id, "frame crafted");
    println!("{}", hex::encode(frame));
    Ok(())
}

fn rand_packet_id() -> u32 {
    // Crafted ids only need to avoid the reserved zero.
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(1)
        | 1
}

fn cmd_channel_hash(name: String, key: String) -> Result<()> {
    let hash = crypto::channel_hash(&name, &key)?;
    println!("{hash}");
    Ok(())
}

fn cmd_node_id(node: String) -> Result<()> {
    let num = if node.starts_with('!') {
        parse_id(&node)?
    } else {
        node.parse::<u32>().context("not a node number or !xxxxxxxx id")?
    };
    println!("{} {}", num, canonical_id(num));
    Ok(())
}

fn cmd_replay(input: PathBuf, key: String, topic: String) -> Result<()> {
    let store = Store::shared();
    let handler = PacketHandler::new(store.clone(), None);

    // Seed the capture's channel key so the handler can decrypt.
    let channel_name = topic.split('/').rev().nth(1).unwrap_or("LongFast").to_string();
    {
        let mut store = store.lock().expect("store mutex poisoned");
        let hash = crypto::channel_hash(&channel_name, &key).unwrap_or(0);
        store.upsert_channel(&channel_name, hash).psk = Some(key);
    }

    let content = fs::read_to_string(&input)
        .with_context(|| format!("reading {}", input.display()))?;
    let meta = IngestMeta {
        topic: Some(topic),
        interface_id: Some("replay".into()),
    };

    let mut total = 0usize;
    let mut decoded = 0usize;
    for (lineno, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let raw = hex::decode(line)
            .with_context(|| format!("line {} is not valid hex", lineno + 1))?;
        let frame = ingest_packet("mqtt", raw, &meta)?;
        match handler.handle_frame(&frame) {
            Ok(processed) => {
                total += 1;
                if processed.portnum.is_some() {
                    decoded += 1;
                }
            }
            Err(e) => eprintln!("line {}: {e}", lineno + 1),
        }
    }

    let store = store.lock().expect("store mutex poisoned");
    println!("frames:   {total} ({decoded} decoded)");
    println!("nodes:    {}", store.node_count());
    for edge in store.edges() {
        println!(
            "edge:     {} -> {} (bridged hops: {}, snr: {})",
            canonical_id(edge.source),
            canonical_id(edge.target),
            edge.last_hops,
            edge.last_rx_snr.map_or("-".to_string(), |s| s.to_string()),
        );
    }
    Ok(())
}
