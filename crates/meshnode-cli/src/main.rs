//! meshnode command-line interface
//!
//! This CLI provides tools for:
//! - Running one node on the simulated board until Ctrl+C or a deadline
//! - Simulating a multi-node mesh and printing its routing tables
//! - Encoding and decoding mesh frames
//! - Listing the remote parameter table

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use meshnode_core::config::{default_document, STORAGE_PATH, SYSTEM_ID};
use meshnode_core::mesh::params::{decode_param, ParamTarget};
use meshnode_core::mesh::simulation::{MeshSimulation, SimConfig, Topology};
use meshnode_core::mesh::{decode, Command, Control, FrameType, NodeId, Packet, ParameterMap, INITIAL_TTL};
use meshnode_core::{ConfigStore, MonotonicClock, Node, SimBoard};
use serde::Serialize;
use serde_json::Value;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

#[derive(Parser)]
#[command(name = "meshnode")]
#[command(author, version, about = "LoRa mesh sensor node CLI", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a single node on the simulated board
    Run {
        /// Configuration document (JSON); the built-in defaults when omitted
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Persistent override file (defaults to the document's STORAGE_PATH)
        #[arg(short, long)]
        storage: Option<PathBuf>,

        /// Override the node address
        #[arg(long)]
        node_id: Option<NodeId>,

        /// Seconds to run (0 = until Ctrl+C)
        #[arg(short, long, default_value = "0")]
        duration: u64,
    },

    /// Simulate a mesh of nodes sharing one radio medium
    Simulate {
        /// Number of nodes
        #[arg(short, long, default_value = "4")]
        nodes: usize,

        /// Steps of 10 ms to run
        #[arg(short, long, default_value = "6000")]
        steps: u64,

        /// Link layout (line, full)
        #[arg(short, long, default_value = "line")]
        topology: Topology,

        /// Random seed for rssi jitter
        #[arg(long, default_value = "42")]
        seed: u64,

        /// Per-delivery rssi variation
        #[arg(long, default_value = "0")]
        jitter: u8,
    },

    /// Encode a frame to hex
    Encode {
        /// Destination node (255 = broadcast)
        #[arg(long)]
        dest: NodeId,

        /// Source node
        #[arg(long)]
        src: NodeId,

        /// Command name (GET_PARAM) or code (0x50)
        #[arg(short, long)]
        command: String,

        /// Remaining hops
        #[arg(long, default_value_t = INITIAL_TTL)]
        ttl: u8,

        /// Mark as a response instead of a command
        #[arg(long)]
        resp: bool,

        /// Payload as hex
        #[arg(short, long, default_value = "")]
        payload: String,
    },

    /// Decode a hex frame to JSON
    Decode {
        /// Frame bytes as hex
        frame: String,
    },

    /// List the remote parameter table
    Params,
}

fn cmd_run(config: Option<PathBuf>, storage: Option<PathBuf>, node_id: Option<NodeId>, duration: u64) -> Result<()> {
    let mut document = match &config {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config {}", path.display()))?;
            serde_json::from_str::<Value>(&text)
                .with_context(|| format!("Failed to parse config {}", path.display()))?
        }
        None => default_document(),
    };
    if let Some(id) = node_id {
        document[SYSTEM_ID] = Value::from(id);
    }
    let storage = storage.unwrap_or_else(|| {
        PathBuf::from(document[STORAGE_PATH].as_str().unwrap_or("storage.json"))
    });

    let clock = Rc::new(MonotonicClock::new());
    let board = Rc::new(RefCell::new(SimBoard::new(clock.clone())));
    let mut node = Node::new(ConfigStore::load(document, &storage), board, clock)
        .context("Failed to start node")?;

    println!("=== meshnode ===");
    println!("Node:     {} ({})", node.id(), node.config().system_name());
    println!("Storage:  {}", storage.display());
    println!("Modules:  {}", node.scheduler().names().join(", "));
    if let Some(module) = &node.last_init().aborted_at {
        println!("Init aborted at critical module '{}'", module);
    }
    println!();

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .context("Failed to set Ctrl+C handler")?;

    let deadline = (duration > 0).then(|| Instant::now() + Duration::from_secs(duration));
    info!(duration, "node loop starting");
    node.run(|| !running.load(Ordering::SeqCst) || deadline.is_some_and(|d| Instant::now() >= d))
        .context("Node loop failed")?;

    println!("=== Readings ===");
    for (name, reading) in node.state().borrow().readings() {
        println!("  {:<16} {}", name, reading);
    }
    println!();
    print_routes(node.id(), &node.routes().unwrap_or_default());
    Ok(())
}

fn print_routes(node: NodeId, routes: &[(NodeId, meshnode_core::mesh::Route)]) {
    println!("Node {} routes:", node);
    println!("  {:<6} {:<9} {:<6}", "Dest", "Next hop", "Cost");
    for (dest, route) in routes {
        println!("  {:<6} {:<9} {:<6}", dest, route.next_hop, route.cost);
    }
}

fn cmd_simulate(nodes: usize, steps: u64, topology: Topology, seed: u64, jitter: u8) -> Result<()> {
    let config = SimConfig::default()
        .with_node_count(nodes)
        .with_topology(topology)
        .with_seed(seed)
        .with_jitter(jitter);

    println!("=== Mesh Simulation ===");
    println!();
    println!("Nodes:    {}", nodes);
    println!("Topology: {}", topology);
    println!("Steps:    {} ({} ms each)", steps, config.step_ms);
    println!();

    let mut sim = MeshSimulation::new(config).context("Failed to build simulation")?;
    sim.run(steps).context("Simulation failed")?;

    let stats = sim.stats();
    println!("=== Simulation Results ===");
    println!();
    println!("Simulated time:  {:.1} s", stats.elapsed_ms as f64 / 1000.0);
    println!("Frames on air:   {}", stats.frames_on_air);
    println!("Deliveries:      {}", stats.deliveries);
    println!();

    let mut by_kind: BTreeMap<(NodeId, String), usize> = BTreeMap::new();
    for delivery in sim.deliveries() {
        let kind = format!(
            "{} {:?}",
            delivery.packet.command,
            delivery.packet.control.frame_type()
        );
        *by_kind.entry((delivery.node, kind)).or_default() += 1;
    }
    println!("Per-Node Deliveries:");
    println!("{:<8} {:<28} {:<8}", "Node", "Frame", "Count");
    println!("{}", "-".repeat(44));
    for ((node, kind), count) in &by_kind {
        println!("{:<8} {:<28} {:<8}", node, kind, count);
    }
    println!();

    for (node, routes) in sim.routes() {
        print_routes(node, &routes);
    }
    Ok(())
}

fn cmd_encode(dest: NodeId, src: NodeId, command: &str, ttl: u8, resp: bool, payload: &str) -> Result<()> {
    let Some(command) = Command::parse(command) else {
        bail!("Unknown command '{}'", command);
    };
    let payload = hex::decode(payload.trim()).context("Payload is not valid hex")?;
    let control = if resp { Control::RESP } else { Control::CMD };
    let packet = Packet::new(dest, src, control, ttl, command, payload);
    println!("{}", hex::encode(packet.to_bytes()));
    Ok(())
}

/// Decoded frame with the payload interpreted where the command defines it
#[derive(Serialize)]
struct DecodedFrame {
    dest: NodeId,
    src: NodeId,
    frame_type: FrameType,
    ack_required: bool,
    ttl: u8,
    command: String,
    payload: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    param: Option<DecodedParam>,
}

#[derive(Serialize)]
struct DecodedParam {
    id: u8,
    path: Option<String>,
    value: Value,
}

fn cmd_decode(frame: &str) -> Result<()> {
    let bytes = hex::decode(frame.trim()).context("Frame is not valid hex")?;
    let packet = decode(&bytes).context("Not a mesh frame")?;

    let is_param_value = match packet.command {
        Command::SetParam => packet.control.frame_type() == FrameType::Cmd,
        Command::GetParam => packet.control.frame_type() == FrameType::Resp,
        _ => false,
    };
    let param = if is_param_value {
        decode_param(&packet.payload).map(|(id, value)| DecodedParam {
            id,
            path: ParameterMap::default().path(id).map(str::to_string),
            value: value.to_json(),
        })
    } else {
        None
    };

    let decoded = DecodedFrame {
        dest: packet.dest,
        src: packet.src,
        frame_type: packet.control.frame_type(),
        ack_required: packet.control.ack_required(),
        ttl: packet.ttl,
        command: packet.command.to_string(),
        payload: hex::encode(&packet.payload),
        param,
    };
    println!("{}", serde_json::to_string_pretty(&decoded)?);
    Ok(())
}

fn cmd_params() -> Result<()> {
    let params = ParameterMap::default();
    let store = ConfigStore::new(default_document());

    println!("=== Remote Parameters ===");
    println!();
    println!("{:<6} {:<8} {:<56} {}", "Id", "Kind", "Path", "Default");
    println!("{}", "-".repeat(80));
    for (id, path) in params.iter() {
        let (kind, current) = match params.target(id) {
            Some(ParamTarget::Direct { .. }) => ("action", "-".to_string()),
            _ => (
                "config",
                store.get(path).map_or_else(|| "-".to_string(), |v| v.to_string()),
            ),
        };
        println!("0x{:02x}   {:<8} {:<56} {}", id, kind, path, current);
    }
    Ok(())
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
        Commands::Run {
            config,
            storage,
            node_id,
            duration,
        } => cmd_run(config, storage, node_id, duration),
        Commands::Simulate {
            nodes,
            steps,
            topology,
            seed,
            jitter,
        } => cmd_simulate(nodes, steps, topology, seed, jitter),
        Commands::Encode {
            dest,
            src,
            command,
            ttl,
            resp,
            payload,
        } => cmd_encode(dest, src, &command, ttl, resp, &payload),
        Commands::Decode { frame } => cmd_decode(&frame),
        Commands::Params => cmd_params(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_simulate() {
        let cli = Cli::try_parse_from(["meshnode", "-vv", "simulate", "--nodes", "3", "--topology", "full"]).unwrap();
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Commands::Simulate { nodes, topology, steps, .. } => {
                assert_eq!(nodes, 3);
                assert_eq!(topology, Topology::Full);
                assert_eq!(steps, 6000);
            }
            _ => panic!("expected simulate"),
        }
    }

    #[test]
    fn test_encode_rejects_unknown_command() {
        assert!(cmd_encode(1, 2, "TOASTER", 16, false, "").is_err());
        assert!(cmd_encode(1, 2, "GET_PARAM", 16, false, "zz").is_err());
        assert!(cmd_encode(1, 2, "0x50", 16, false, "03").is_ok());
    }

    #[test]
    fn test_decode_rejects_short_frame() {
        assert!(cmd_decode("0102").is_err());
        assert!(cmd_decode("0109005051030440600000").is_ok());
    }
}
