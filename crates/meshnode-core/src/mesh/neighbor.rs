//! Neighbor discovery and management
//!
//! This module tracks nodes heard directly on the radio link. Every received
//! frame refreshes its sender's entry; the link cost derived from the receive
//! signal strength is the metric the routing table sums over.

use super::packet::NodeId;
use crate::timer::ticks_diff;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Link cost from receive signal strength (lower is better, never zero)
pub fn link_cost(rssi: u8) -> u16 {
    u16::from(255 - rssi).max(1)
}

/// A neighboring node (directly reachable)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Neighbor {
    /// Signal strength of the last frame heard
    pub rssi: u8,
    /// Link cost derived from `rssi`
    pub cost: u16,
    /// Monotonic ms timestamp of the last frame heard
    pub last_seen: u32,
}

impl Neighbor {
    /// Create a neighbor entry from a received frame
    pub fn new(rssi: u8, now: u32) -> Self {
        Self {
            rssi,
            cost: link_cost(rssi),
            last_seen: now,
        }
    }

    /// Time since last seen, wraparound-safe
    pub fn silence_ms(&self, now: u32) -> i64 {
        i64::from(ticks_diff(now, self.last_seen))
    }

    /// Check if neighbor is stale (silent longer than `timeout_ms`)
    pub fn is_stale(&self, now: u32, timeout_ms: u32) -> bool {
        self.silence_ms(now) > i64::from(timeout_ms)
    }
}

/// Neighbor table for tracking known nodes
#[derive(Debug, Clone, Default)]
pub struct NeighborTable {
    neighbors: HashMap<NodeId, Neighbor>,
}

impl NeighborTable {
    /// Create an empty neighbor table
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or refresh a neighbor, returning its link cost
    pub fn update(&mut self, node_id: NodeId, rssi: u8, now: u32) -> u16 {
        let neighbor = Neighbor::new(rssi, now);
        self.neighbors.insert(node_id, neighbor);
        neighbor.cost
    }

    /// Get a neighbor by ID
    pub fn get(&self, node_id: &NodeId) -> Option<&Neighbor> {
        self.neighbors.get(node_id)
    }

    /// All neighbors ordered by node id
    pub fn sorted(&self) -> Vec<(NodeId, Neighbor)> {
        let mut all: Vec<_> = self.neighbors.iter().map(|(id, n)| (*id, *n)).collect();
        all.sort_by_key(|(id, _)| *id);
        all
    }

    /// Remove neighbors silent longer than `timeout_ms`, returning their ids
    pub fn prune_stale(&mut self, now: u32, timeout_ms: u32) -> Vec<NodeId> {
        let mut expired: Vec<NodeId> = self
            .neighbors
            .iter()
            .filter(|(_, n)| n.is_stale(now, timeout_ms))
            .map(|(id, _)| *id)
            .collect();
        expired.sort_unstable();
        for id in &expired {
            self.neighbors.remove(id);
        }
        expired
    }

    /// Get neighbor count
    pub fn len(&self) -> usize {
        self.neighbors.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.neighbors.is_empty()
    }

    /// Clear all neighbors
    pub fn clear(&mut self) {
        self.neighbors.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_cost() {
        assert_eq!(link_cost(200), 55);
        assert_eq!(link_cost(235), 20);
        assert_eq!(link_cost(0), 255);
        // Full-strength links still cost something
        assert_eq!(link_cost(255), 1);
        assert_eq!(link_cost(254), 1);
    }

    #[test]
    fn test_neighbor_table() {
        let mut table = NeighborTable::new();
        assert!(table.is_empty());

        assert_eq!(table.update(4, 200, 1_000), 55);
        assert_eq!(table.update(9, 240, 1_000), 15);
        assert_eq!(table.len(), 2);

        // Refresh replaces rssi and timestamp
        table.update(4, 230, 5_000);
        let n = table.get(&4).unwrap();
        assert_eq!(n.rssi, 230);
        assert_eq!(n.cost, 25);
        assert_eq!(n.last_seen, 5_000);

        let ids: Vec<_> = table.sorted().into_iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec![4, 9]);
    }

    #[test]
    fn test_prune_stale() {
        let mut table = NeighborTable::new();
        table.update(2, 200, 0);
        table.update(3, 200, 50_000);

        // Exactly at the timeout is not stale yet
        assert!(table.prune_stale(105_000, 105_000).is_empty());

        let expired = table.prune_stale(105_001, 105_000);
        assert_eq!(expired, vec![2]);
        assert!(table.get(&2).is_none());
        assert!(table.get(&3).is_some());
    }

    #[test]
    fn test_stale_across_wrap() {
        let seen = u32::MAX - 500;
        let neighbor = Neighbor::new(220, seen);
        assert_eq!(neighbor.silence_ms(499), 1_000);
        assert!(!neighbor.is_stale(499, 1_000));
        assert!(neighbor.is_stale(500, 1_000));
    }
}
