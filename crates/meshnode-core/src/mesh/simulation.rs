//! Multi-node mesh simulation
//!
//! Runs several complete [`Node`]s over one shared [`Ether`], all driven by a
//! single [`ManualClock`], so that multi-hop behavior can be observed without
//! hardware:
//!
//! - line or full topology with a fixed per-link rssi
//! - every node runs the stock module set (reporter, routing, dispatcher, ...)
//! - the first node is the base station the others report to
//! - frames addressed to a node are logged as deliveries
//!
//! ## Example
//!
//! ```rust,no_run
//! use meshnode_core::mesh::simulation::{MeshSimulation, SimConfig, Topology};
//!
//! let mut sim = MeshSimulation::new(SimConfig::default().with_node_count(3)).unwrap();
//! sim.advance(60_000).unwrap();
//! for (node, routes) in sim.routes() {
//!     println!("{node}: {} routes", routes.len());
//! }
//! ```

use super::packet::{NodeId, Packet};
use super::routing::Route;
use crate::config::{default_document, ConfigStore, BASE_STATION_ID, MODULE_CONFIGURATION, SYSTEM_ID, SYSTEM_NAME};
use crate::error::{NodeError, Result};
use crate::event::{topics, Event};
use crate::modules::LinkSettings;
use crate::node::Node;
use crate::sim::{Ether, SharedEther, SimBoard};
use crate::timer::{Clock, ManualClock};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;
use std::str::FromStr;
use tracing::{debug, info};

/// Which stations hear each other
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Topology {
    /// Each node hears only its predecessor and successor
    Line,
    /// Every node hears every other node
    Full,
}

impl FromStr for Topology {
    type Err = NodeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "line" => Ok(Topology::Line),
            "full" => Ok(Topology::Full),
            other => Err(NodeError::Config(format!("unknown topology '{other}'"))),
        }
    }
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topology::Line => write!(f, "line"),
            Topology::Full => write!(f, "full"),
        }
    }
}

/// Simulation configuration
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Number of nodes; ids run from 1
    pub node_count: usize,
    /// Link layout
    pub topology: Topology,
    /// Nominal rssi of every link
    pub rssi: u8,
    /// Per-delivery rssi variation
    pub jitter: u8,
    /// Seed for the rssi jitter
    pub seed: u64,
    /// Clock advance per step
    pub step_ms: u32,
    /// Hello period of every routing module
    pub hello_interval_s: f64,
    /// Route advertisement period of every routing module
    pub route_update_interval_s: f64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            node_count: 4,
            topology: Topology::Line,
            rssi: 200,
            jitter: 0,
            seed: 42,
            step_ms: 10,
            hello_interval_s: 5.0,
            route_update_interval_s: 10.0,
        }
    }
}

impl SimConfig {
    pub fn with_node_count(mut self, count: usize) -> Self {
        self.node_count = count;
        self
    }

    pub fn with_topology(mut self, topology: Topology) -> Self {
        self.topology = topology;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_jitter(mut self, jitter: u8) -> Self {
        self.jitter = jitter;
        self
    }
}

/// A frame that reached the node it was addressed to
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// Simulated ms at reception
    pub at_ms: u32,
    /// Receiving node
    pub node: NodeId,
    /// Received frame
    pub packet: Packet,
    /// Receive signal strength
    pub rssi: u8,
}

/// Simulation statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct SimStats {
    /// Steps run
    pub steps: u64,
    /// Simulated time
    pub elapsed_ms: u64,
    /// Frames put on air by any node
    pub frames_on_air: usize,
    /// Frames received by their destination
    pub deliveries: usize,
}

/// N nodes sharing one clock and one ether
pub struct MeshSimulation {
    config: SimConfig,
    clock: Rc<ManualClock>,
    ether: SharedEther,
    nodes: Vec<(Node, Rc<RefCell<SimBoard>>)>,
    deliveries: Rc<RefCell<Vec<Delivery>>>,
    steps: u64,
}

impl fmt::Debug for MeshSimulation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MeshSimulation")
            .field("nodes", &self.node_ids())
            .field("topology", &self.config.topology)
            .field("steps", &self.steps)
            .finish()
    }
}

impl MeshSimulation {
    /// Build and boot every node
    pub fn new(config: SimConfig) -> Result<Self> {
        if config.node_count == 0 || config.node_count > usize::from(NodeId::MAX - 1) {
            return Err(NodeError::Config(format!(
                "node count {} out of range",
                config.node_count
            )));
        }
        let clock = Rc::new(ManualClock::default());
        let ether: SharedEther = Rc::new(Ether::new(config.seed, config.jitter));
        let ids: Vec<NodeId> = (1..=config.node_count as NodeId).collect();
        let base_station = ids[0];

        for (i, a) in ids.iter().enumerate() {
            for b in &ids[i + 1..] {
                let linked = match config.topology {
                    Topology::Line => *b == *a + 1,
                    Topology::Full => true,
                };
                if linked {
                    ether.connect(*a, *b, config.rssi);
                }
            }
        }

        let deliveries = Rc::new(RefCell::new(Vec::new()));
        let mut nodes = Vec::with_capacity(ids.len());
        for id in &ids {
            let mut document = default_document();
            document[SYSTEM_ID] = json!(id);
            document[BASE_STATION_ID] = json!(base_station);
            document[SYSTEM_NAME] = json!(format!("sim{id:02}"));
            let routing = &mut document[MODULE_CONFIGURATION]["routing"];
            routing["hello_interval_s"] = json!(config.hello_interval_s);
            routing["route_update_interval_s"] = json!(config.route_update_interval_s);

            let board = Rc::new(RefCell::new(SimBoard::new(clock.clone())));
            board.borrow_mut().attach(ether.clone(), *id);
            let node = Node::new(ConfigStore::new(document), board.clone(), clock.clone())?;

            let log = deliveries.clone();
            let node_clock = clock.clone();
            let station = *id;
            node.bus().subscribe(topics::MESSAGE_RECEIVED, move |event| {
                if let Event::MessageReceived { packet, rssi } = event {
                    if packet.dest == station {
                        log.borrow_mut().push(Delivery {
                            at_ms: node_clock.now_ms(),
                            node: station,
                            packet: packet.clone(),
                            rssi: *rssi,
                        });
                    }
                }
                Ok(())
            });
            nodes.push((node, board));
        }

        info!(
            nodes = nodes.len(),
            topology = %config.topology,
            base_station,
            "mesh simulation ready"
        );
        Ok(Self {
            config,
            clock,
            ether,
            nodes,
            deliveries,
            steps: 0,
        })
    }

    /// Advance the clock one step and step every node in id order
    pub fn step(&mut self) -> Result<()> {
        self.clock.advance(self.config.step_ms);
        for (node, _) in &mut self.nodes {
            node.step()?;
        }
        self.steps += 1;
        Ok(())
    }

    /// Run a number of steps
    pub fn run(&mut self, steps: u64) -> Result<()> {
        for _ in 0..steps {
            self.step()?;
        }
        debug!(steps, elapsed_ms = self.elapsed_ms(), "simulation ran");
        Ok(())
    }

    /// Run for at least `ms` of simulated time
    pub fn advance(&mut self, ms: u64) -> Result<()> {
        let step = u64::from(self.config.step_ms.max(1));
        self.run(ms.div_ceil(step))
    }

    /// Step until `condition` holds or `max_steps` ran; returns whether it held
    pub fn run_until<F>(&mut self, max_steps: u64, mut condition: F) -> Result<bool>
    where
        F: FnMut(&Self) -> bool,
    {
        for _ in 0..max_steps {
            if condition(self) {
                return Ok(true);
            }
            self.step()?;
        }
        Ok(condition(self))
    }

    /// Queue a frame on a node's egress queue
    pub fn send(&self, from: NodeId, packet: &Packet) -> bool {
        let Some(node) = self.node(from) else {
            return false;
        };
        let link = LinkSettings::default().key();
        node.state()
            .borrow_mut()
            .link_mut(&link)
            .outbound
            .push_back(packet.to_bytes());
        true
    }

    /// Node by id
    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.iter().map(|(n, _)| n).find(|n| n.id() == id)
    }

    /// Simulated board of a node
    pub fn board(&self, id: NodeId) -> Option<Rc<RefCell<SimBoard>>> {
        self.nodes
            .iter()
            .find(|(n, _)| n.id() == id)
            .map(|(_, b)| b.clone())
    }

    /// Every node id in step order
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.iter().map(|(n, _)| n.id()).collect()
    }

    /// Routing table of every node
    pub fn routes(&self) -> BTreeMap<NodeId, Vec<(NodeId, Route)>> {
        self.nodes
            .iter()
            .map(|(n, _)| (n.id(), n.routes().unwrap_or_default()))
            .collect()
    }

    /// Frames that reached their destination, in reception order
    pub fn deliveries(&self) -> Vec<Delivery> {
        self.deliveries.borrow().clone()
    }

    /// Shared medium
    pub fn ether(&self) -> &SharedEther {
        &self.ether
    }

    /// Simulated time so far
    pub fn elapsed_ms(&self) -> u64 {
        self.steps * u64::from(self.config.step_ms)
    }

    /// Counters so far
    pub fn stats(&self) -> SimStats {
        SimStats {
            steps: self.steps,
            elapsed_ms: self.elapsed_ms(),
            frames_on_air: self.ether.transmissions().len(),
            deliveries: self.deliveries.borrow().len(),
        }
    }

    /// Configuration the simulation was built with
    pub fn config(&self) -> &SimConfig {
        &self.config
    }
}
