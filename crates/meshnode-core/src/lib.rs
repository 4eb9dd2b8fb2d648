//! # meshnode core
//!
//! Cooperative runtime for battery-powered LoRa sensor nodes that report
//! temperature and pressure over a multi-hop mesh to a base station.
//!
//! ## Overview
//!
//! A node is one loop on one thread. Every iteration the board refreshes its
//! device readings and radio ingress, interrupt edges are published on the
//! event bus, and the module scheduler ticks every polling module in
//! ascending priority. All waiting is expressed through [`Timer`]s; nothing
//! below the loop blocks.
//!
//! - **Timer**: pausable, wraparound-safe interval timers
//! - **EventBus**: synchronous topic-based publish/subscribe
//! - **ModuleScheduler**: registry-driven construction, ordering and ticking
//! - **PacketCodec**: `[dest][src][control][ttl][command][payload]` frames
//! - **RoutingEngine**: distance-vector routing with neighbor pruning
//! - **CommandDispatcher**: sensor status, RTC, module control and the remote
//!   parameter protocol
//!
//! ## Signal Flow
//!
//! ```text
//! RX: radio → board.update → inbound queue → CommandDispatcher → handlers / route:forward_request
//! TX: handlers / RoutingModule / Reporter → outbound queue → Transmitter → radio
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use meshnode_core::{default_document, ConfigStore, Node, SimBoard};
//! use meshnode_core::timer::MonotonicClock;
//! use std::cell::RefCell;
//! use std::rc::Rc;
//!
//! let clock = Rc::new(MonotonicClock::new());
//! let board = Rc::new(RefCell::new(SimBoard::new(clock.clone())));
//! let mut node = Node::new(ConfigStore::new(default_document()), board, clock).unwrap();
//! node.run(|| false).unwrap();
//! ```

pub mod config;
pub mod error;
pub mod event;
pub mod hal;
pub mod module;
pub mod modules;
pub mod node;
pub mod scheduler;
pub mod sim;
pub mod state;
pub mod timer;

// Mesh networking support
pub mod mesh;

// Re-export main types
pub use config::{default_document, ConfigStore, SharedConfig};
pub use error::{NodeError, Result};
pub use event::{topics, Event, EventBus, SharedBus};
pub use hal::{Board, HardwareConfig, SharedBoard};
pub use module::{DirectAction, Module, ModuleContext, ModuleCore, SharedModule};
pub use modules::ModuleKind;
pub use node::Node;
pub use scheduler::{InitReport, ModuleIdMap, ModuleScheduler, RegistryEntry};
pub use sim::{Ether, SimBoard};
pub use state::{BoardState, Reading, SharedState};
pub use timer::{Clock, ManualClock, MonotonicClock, Timer};

// Mesh networking re-exports
pub use mesh::{Command, MeshSimulation, NodeId, Packet, ParamValue, ParameterMap, RoutingEngine};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::ConfigStore;
    pub use crate::event::{topics, Event};
    pub use crate::module::{Module, ModuleContext};
    pub use crate::node::Node;
    pub use crate::timer::{Clock, Timer};
    // Mesh networking
    pub use crate::mesh::{Command, NodeId, Packet, ParamValue};
}
