//! Mesh networking
//!
//! Everything that travels over the radio link:
//!
//! - **Packet**: the 5-byte header frame codec
//! - **Neighbor**: who is heard directly, and at what link cost
//! - **Routing**: distance-vector tables, advertisements, forwarding
//! - **Params**: the remote parameter table and its typed values
//! - **Dispatcher**: ingress decode and command handlers
//! - **Simulation**: several nodes over one simulated ether
//!
//! ## Architecture
//!
//! ```text
//!            radio ──▶ inbound queue ──▶ CommandDispatcher
//!                                          │        │
//!                       lora:message:received    dest == self
//!                                          │        ▼
//!                                          │    handlers ──▶ RESP ─┐
//!                                          ▼                       │
//!   route:forward_request ──▶ RoutingModule (RoutingEngine)        │
//!                                          │                       │
//!                      HELLO / ROUTE_AD / relays                   │
//!                                          ▼                       ▼
//!            radio ◀── Transmitter ◀── outbound queue ◀────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust
//! use meshnode_core::mesh::{decode, Command, Packet};
//!
//! let frame = Packet::command(0, 4, Command::GetSensorStatus, vec![0x09, 0x2E, 0x00, 0x57]).to_bytes();
//! let packet = decode(&frame).unwrap();
//! assert_eq!(packet.src, 4);
//! assert_eq!(packet.ttl, 16);
//! ```

pub mod dispatcher;
pub mod neighbor;
pub mod packet;
pub mod params;
pub mod routing;
pub mod simulation;

// Re-export main types
pub use dispatcher::CommandDispatcher;
pub use neighbor::{link_cost, Neighbor, NeighborTable};
pub use packet::{decode, encode, Command, Control, FrameType, NodeId, Packet, BROADCAST_ID, INITIAL_TTL};
pub use params::{decode_param, encode_param, ParamTarget, ParamType, ParamValue, ParameterMap};
pub use routing::{Route, RoutingEngine, RoutingTable};
pub use simulation::{MeshSimulation, SimConfig, Topology};
