//! Distance-vector mesh routing
//!
//! Each node keeps a neighbor table (who it hears directly, and how well)
//! and a routing table (best known cost to every destination). Routes are
//! learned from neighbors' advertisements by classic relaxation:
//!
//! ```text
//!   candidate = link_cost(sender) + advertised_cost
//!   replace route[dest] when absent or candidate < route[dest].cost
//! ```
//!
//! There is no loop prevention beyond the strict cost comparison; stale
//! routes disappear when their next hop is pruned from the neighbor table.
//!
//! Route advertisement payload, repeated per destination:
//!
//! ```text
//! ┌───────────┬───────────────┐
//! │ Dest (1B) │ Cost (2B, BE) │
//! └───────────┴───────────────┘
//! ```

use super::neighbor::NeighborTable;
use super::packet::{decode, Command, NodeId, Packet};
use byteorder::{BigEndian, ByteOrder};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, trace};

/// Bytes per advertised route
pub const ROUTE_AD_ENTRY_SIZE: usize = 3;

/// Neighbors are dropped after this many silent hello periods
pub const NEIGHBOR_TIMEOUT_FACTOR: f64 = 3.5;

/// A route to a destination node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    /// Next hop node ID (same as destination if direct)
    pub next_hop: NodeId,
    /// Total path cost
    pub cost: u32,
    /// Monotonic ms timestamp of the last change
    pub last_updated: u32,
}

/// Routing table for storing known routes
///
/// Always holds a zero-cost route to the local node.
#[derive(Debug, Clone)]
pub struct RoutingTable {
    node_id: NodeId,
    routes: HashMap<NodeId, Route>,
}

impl RoutingTable {
    /// Create a table containing only the self route
    pub fn new(node_id: NodeId, now: u32) -> Self {
        let mut routes = HashMap::new();
        routes.insert(
            node_id,
            Route {
                next_hop: node_id,
                cost: 0,
                last_updated: now,
            },
        );
        Self { node_id, routes }
    }

    /// Offer a path; installed when no route exists or it is strictly cheaper
    pub fn relax(&mut self, dest: NodeId, next_hop: NodeId, cost: u32, now: u32) -> bool {
        if dest == self.node_id {
            return false;
        }
        match self.routes.get(&dest) {
            Some(current) if cost >= current.cost => false,
            _ => {
                self.routes.insert(
                    dest,
                    Route {
                        next_hop,
                        cost,
                        last_updated: now,
                    },
                );
                true
            }
        }
    }

    /// Overwrite the route to a directly heard neighbor if it goes through that neighbor
    fn refresh_direct(&mut self, neighbor: NodeId, cost: u32, now: u32) -> bool {
        match self.routes.get_mut(&neighbor) {
            Some(route) if route.next_hop == neighbor => {
                let changed = route.cost != cost;
                route.cost = cost;
                route.last_updated = now;
                changed
            }
            _ => false,
        }
    }

    /// Get route to destination
    pub fn get(&self, dest: &NodeId) -> Option<&Route> {
        self.routes.get(dest)
    }

    /// Remove every route whose next hop is in `next_hops`
    pub fn remove_via(&mut self, next_hops: &[NodeId]) -> usize {
        let node_id = self.node_id;
        let before = self.routes.len();
        self.routes
            .retain(|dest, r| *dest == node_id || !next_hops.contains(&r.next_hop));
        before - self.routes.len()
    }

    /// `(dest, cost)` for every route except self, ordered by destination
    pub fn advertised(&self) -> Vec<(NodeId, u16)> {
        let mut entries: Vec<_> = self
            .routes
            .iter()
            .filter(|(dest, _)| **dest != self.node_id)
            .map(|(dest, r)| (*dest, u16::try_from(r.cost).unwrap_or(u16::MAX)))
            .collect();
        entries.sort_by_key(|(dest, _)| *dest);
        entries
    }

    /// All routes ordered by destination
    pub fn sorted(&self) -> Vec<(NodeId, Route)> {
        let mut all: Vec<_> = self.routes.iter().map(|(d, r)| (*d, *r)).collect();
        all.sort_by_key(|(dest, _)| *dest);
        all
    }

    /// Number of routes, self included
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Never true; the self route is always present
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// Encode route advertisement entries
pub fn encode_route_ad(entries: &[(NodeId, u16)]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(entries.len() * ROUTE_AD_ENTRY_SIZE);
    for (dest, cost) in entries {
        let mut entry = [*dest, 0, 0];
        BigEndian::write_u16(&mut entry[1..], *cost);
        payload.extend_from_slice(&entry);
    }
    payload
}

/// Decode route advertisement entries; a trailing partial entry is ignored
pub fn decode_route_ad(payload: &[u8]) -> impl Iterator<Item = (NodeId, u16)> + '_ {
    payload
        .chunks_exact(ROUTE_AD_ENTRY_SIZE)
        .map(|entry| (entry[0], BigEndian::read_u16(&entry[1..])))
}

/// Outcome of a pruning pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneReport {
    /// Neighbors that timed out
    pub neighbors: Vec<NodeId>,
    /// Routes removed because their next hop timed out
    pub routes: usize,
}

/// Distance-vector state machine for one radio link
///
/// Pure protocol logic: callers feed it received frames and timestamps and
/// queue the frames it returns.
#[derive(Debug, Clone)]
pub struct RoutingEngine {
    node_id: NodeId,
    neighbors: NeighborTable,
    routes: RoutingTable,
    neighbor_timeout_ms: u32,
}

impl RoutingEngine {
    /// Create an engine whose neighbors time out after 3.5 hello periods
    pub fn new(node_id: NodeId, hello_interval_ms: u32, now: u32) -> Self {
        let timeout = (f64::from(hello_interval_ms) * NEIGHBOR_TIMEOUT_FACTOR) as u32;
        Self {
            node_id,
            neighbors: NeighborTable::new(),
            routes: RoutingTable::new(node_id, now),
            neighbor_timeout_ms: timeout,
        }
    }

    /// Local node id
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Neighbor timeout in ms
    pub fn neighbor_timeout_ms(&self) -> u32 {
        self.neighbor_timeout_ms
    }

    /// Neighbor table
    pub fn neighbors(&self) -> &NeighborTable {
        &self.neighbors
    }

    /// Routing table
    pub fn routes(&self) -> &RoutingTable {
        &self.routes
    }

    /// Neighbor presence announcement
    pub fn hello(&self) -> Packet {
        Packet::link_local(self.node_id, Command::Hello, Vec::new())
    }

    /// Route advertisement, or `None` when there is nothing to advertise
    pub fn advertisement(&self) -> Option<Packet> {
        let entries = self.routes.advertised();
        if entries.is_empty() {
            return None;
        }
        Some(Packet::link_local(
            self.node_id,
            Command::RouteAd,
            encode_route_ad(&entries),
        ))
    }

    /// Learn from a received frame; returns how many routes changed
    pub fn observe(&mut self, packet: &Packet, rssi: u8, now: u32) -> usize {
        let sender = packet.src;
        if sender == self.node_id {
            return 0;
        }
        let link = self.neighbors.update(sender, rssi, now);
        let link = u32::from(link);
        trace!(node = self.node_id, sender, rssi, link, "neighbor heard");

        let mut changed = 0;
        // A relayed frame keeps the originator in `src`; only link-local
        // frames prove that `sender` is one hop away.
        if packet.is_link_local()
            && (self.routes.refresh_direct(sender, link, now) || self.routes.relax(sender, sender, link, now))
        {
            changed += 1;
        }

        if packet.command == Command::RouteAd {
            for (dest, advertised) in decode_route_ad(&packet.payload) {
                if dest == self.node_id {
                    continue;
                }
                let candidate = link + u32::from(advertised);
                if self.routes.relax(dest, sender, candidate, now) {
                    debug!(node = self.node_id, dest, via = sender, cost = candidate, "route updated");
                    changed += 1;
                }
            }
        }
        changed
    }

    /// Next-hop copy of a frame to relay, or `None` when it must be dropped
    pub fn forward(&self, raw: &[u8]) -> Option<Packet> {
        let packet = decode(raw).ok()?;
        let next = packet.forwarded()?;
        if self.routes.get(&next.dest).is_none() {
            trace!(node = self.node_id, dest = next.dest, "no route, dropping");
            return None;
        }
        Some(next)
    }

    /// Drop silent neighbors and every route through them
    pub fn prune(&mut self, now: u32) -> PruneReport {
        let neighbors = self.neighbors.prune_stale(now, self.neighbor_timeout_ms);
        let routes = if neighbors.is_empty() {
            0
        } else {
            self.routes.remove_via(&neighbors)
        };
        if !neighbors.is_empty() {
            debug!(node = self.node_id, ?neighbors, routes, "pruned");
        }
        PruneReport { neighbors, routes }
    }
}
