//! Board state shared between the hardware step and module ticks
//!
//! Holds the latest named device readings, the per-link radio queues and the
//! wall clock. The node owns it; modules get a shared handle through their
//! context and keep every borrow scoped to a single statement or block.

use crate::timer::SharedClock;
use serde::{Deserialize, Serialize};
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::rc::Rc;

/// Shared handle to the board state
pub type SharedState = Rc<RefCell<BoardState>>;

/// A named device reading
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Reading {
    /// Digital level or flag
    Bool(bool),
    /// Raw counts or scaled integer value
    Int(i64),
    /// Physical value
    Float(f64),
}

impl Reading {
    /// Numeric view (true = 1.0)
    pub fn as_f64(&self) -> f64 {
        match self {
            Reading::Bool(b) => f64::from(u8::from(*b)),
            Reading::Int(v) => *v as f64,
            Reading::Float(v) => *v,
        }
    }

    /// Integer view, truncating floats
    pub fn as_i64(&self) -> i64 {
        match self {
            Reading::Bool(b) => i64::from(*b),
            Reading::Int(v) => *v,
            Reading::Float(v) => *v as i64,
        }
    }
}

impl From<bool> for Reading {
    fn from(value: bool) -> Self {
        Reading::Bool(value)
    }
}

impl From<i64> for Reading {
    fn from(value: i64) -> Self {
        Reading::Int(value)
    }
}

impl From<f64> for Reading {
    fn from(value: f64) -> Self {
        Reading::Float(value)
    }
}

impl fmt::Display for Reading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reading::Bool(b) => write!(f, "{b}"),
            Reading::Int(v) => write!(f, "{v}"),
            Reading::Float(v) => write!(f, "{v:.2}"),
        }
    }
}

/// A frame taken off the radio
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inbound {
    /// Raw frame bytes
    pub data: Vec<u8>,
    /// Receive signal strength
    pub rssi: u8,
}

/// Ingress and egress FIFOs of one link
#[derive(Debug, Clone, Default)]
pub struct LinkQueues {
    /// Received frames waiting for the message handler
    pub inbound: VecDeque<Inbound>,
    /// Frames waiting for the transmitter
    pub outbound: VecDeque<Vec<u8>>,
}

/// Queue key for a bus, e.g. `uart_1`
pub fn link_key(bus_type: &str, bus_id: &str) -> String {
    format!("{bus_type}_{bus_id}")
}

/// Epoch-seconds clock advanced by the monotonic tick counter
#[derive(Debug)]
pub struct WallClock {
    clock: SharedClock,
    epoch: Cell<i64>,
    anchor_ms: Cell<u32>,
}

impl WallClock {
    /// Start counting from `epoch` now
    pub fn new(clock: SharedClock, epoch: i64) -> Self {
        let anchor = clock.now_ms();
        Self {
            clock,
            epoch: Cell::new(epoch),
            anchor_ms: Cell::new(anchor),
        }
    }

    /// Current epoch seconds
    pub fn now(&self) -> i64 {
        // Re-anchor on whole seconds so the tick counter may wrap between reads.
        let now = self.clock.now_ms();
        let elapsed = now.wrapping_sub(self.anchor_ms.get());
        let secs = elapsed / 1000;
        if secs > 0 {
            self.epoch.set(self.epoch.get() + i64::from(secs));
            self.anchor_ms.set(self.anchor_ms.get().wrapping_add(secs * 1000));
        }
        self.epoch.get()
    }

    /// Jump to `epoch`
    pub fn set(&self, epoch: i64) {
        self.epoch.set(epoch);
        self.anchor_ms.set(self.clock.now_ms());
    }
}

/// Readings, link queues and wall clock of one board
#[derive(Debug)]
pub struct BoardState {
    readings: BTreeMap<String, Reading>,
    links: BTreeMap<String, LinkQueues>,
    /// System wall clock
    pub wall_clock: WallClock,
}

impl BoardState {
    /// Empty state with the wall clock at `epoch`
    pub fn new(clock: SharedClock, epoch: i64) -> Self {
        Self {
            readings: BTreeMap::new(),
            links: BTreeMap::new(),
            wall_clock: WallClock::new(clock, epoch),
        }
    }

    /// Latest reading for a name
    pub fn reading(&self, name: &str) -> Option<Reading> {
        self.readings.get(name).copied()
    }

    /// Store a reading
    pub fn set_reading(&mut self, name: &str, reading: impl Into<Reading>) {
        self.readings.insert(name.to_string(), reading.into());
    }

    /// Forget a reading
    pub fn clear_reading(&mut self, name: &str) {
        self.readings.remove(name);
    }

    /// All readings ordered by name
    pub fn readings(&self) -> impl Iterator<Item = (&str, Reading)> {
        self.readings.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Queues for a link, created on first use
    pub fn link_mut(&mut self, key: &str) -> &mut LinkQueues {
        self.links.entry(key.to_string()).or_default()
    }

    /// Queues for a link, if it exists
    pub fn link(&self, key: &str) -> Option<&LinkQueues> {
        self.links.get(key)
    }

    /// Drop every link queue (hardware reinit)
    pub fn clear_links(&mut self) {
        self.links.clear();
    }

    /// Names of existing links
    pub fn link_keys(&self) -> impl Iterator<Item = &str> {
        self.links.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timer::ManualClock;

    #[test]
    fn test_readings() {
        let clock = Rc::new(ManualClock::default());
        let mut state = BoardState::new(clock, 0);

        state.set_reading("temperature", 21.5);
        state.set_reading("pressure", 87_i64);
        state.set_reading("wake_up_button", true);

        assert_eq!(state.reading("temperature"), Some(Reading::Float(21.5)));
        assert_eq!(state.reading("pressure").map(|r| r.as_i64()), Some(87));
        assert_eq!(state.reading("wake_up_button").map(|r| r.as_f64()), Some(1.0));
        assert_eq!(state.reading("missing"), None);

        let names: Vec<_> = state.readings().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["pressure", "temperature", "wake_up_button"]);
    }

    #[test]
    fn test_link_queues() {
        let clock = Rc::new(ManualClock::default());
        let mut state = BoardState::new(clock, 0);
        let key = link_key("uart", "1");
        assert_eq!(key, "uart_1");
        assert!(state.link(&key).is_none());

        state.link_mut(&key).outbound.push_back(vec![1]);
        state.link_mut(&key).outbound.push_front(vec![0]);
        let link = state.link(&key).unwrap();
        assert_eq!(link.outbound.iter().cloned().collect::<Vec<_>>(), vec![vec![0], vec![1]]);
        assert_eq!(state.link_keys().collect::<Vec<_>>(), vec!["uart_1"]);
    }

    #[test]
    fn test_wall_clock() {
        let clock = Rc::new(ManualClock::starting_at(u32::MAX - 1_500));
        let wall = WallClock::new(clock.clone(), 1_700_000_000);

        clock.advance(999);
        assert_eq!(wall.now(), 1_700_000_000);
        clock.advance(1);
        assert_eq!(wall.now(), 1_700_000_001);

        // Crosses the counter wrap
        clock.advance(2_500);
        assert_eq!(wall.now(), 1_700_000_003);

        wall.set(42);
        clock.advance(1_000);
        assert_eq!(wall.now(), 43);
    }
}
