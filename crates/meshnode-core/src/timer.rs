//! Non-blocking timers over a wrapping millisecond counter
//!
//! Every periodic action in the node is expressed as a [`Timer`] that a module
//! polls from its `update()`; nothing ever sleeps. Time comes from a [`Clock`],
//! a 32-bit millisecond counter that is allowed to wrap. All comparisons go
//! through [`ticks_diff`], so a timer keeps working across the wrap.
//!
//! ```text
//!   start(1000)        pause()            resume()             due
//!   |---- 400 ms ----->|~~~~ 2000 ms ~~~~>|----- 600 ms ------->|
//!   last_fire = t0                        last_fire = t0 + 2000
//! ```

use std::cell::Cell;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::rc::Rc;
use std::time::Instant;

/// Name of the timer every module gets by default
pub const DEFAULT_TIMER: &str = "timer0";

/// Signed difference `end - start` on a wrapping millisecond counter
pub fn ticks_diff(end: u32, start: u32) -> i32 {
    end.wrapping_sub(start) as i32
}

/// Add a signed offset to a wrapping millisecond counter
pub fn ticks_add(ticks: u32, delta: i32) -> u32 {
    ticks.wrapping_add(delta as u32)
}

/// Convert a configuration interval in seconds to milliseconds.
///
/// Zero or negative seconds give a disabled interval.
pub fn interval_from_secs(secs: f64) -> i64 {
    if secs > 0.0 {
        (secs * 1000.0) as i64
    } else {
        -1
    }
}

/// Source of monotonic milliseconds
pub trait Clock: Debug {
    /// Current tick count in milliseconds; wraps at `u32::MAX`
    fn now_ms(&self) -> u32;
}

/// Clock handle shared by every timer of a node
pub type SharedClock = Rc<dyn Clock>;

/// Host clock measuring milliseconds since it was created
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    /// Create a clock starting at zero now
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_ms(&self) -> u32 {
        // Truncation is the wrap.
        self.origin.elapsed().as_millis() as u32
    }
}

/// Clock that only moves when told to (tests and simulation)
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Cell<u32>,
}

impl ManualClock {
    /// Create a clock at the given tick
    pub fn starting_at(ms: u32) -> Self {
        Self { now: Cell::new(ms) }
    }

    /// Set the current tick
    pub fn set(&self, ms: u32) {
        self.now.set(ms);
    }

    /// Move the clock forward, wrapping like the hardware counter
    pub fn advance(&self, ms: u32) {
        self.now.set(self.now.get().wrapping_add(ms));
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u32 {
        self.now.get()
    }
}

/// Non-blocking interval timer with pause/resume and one-shot mode
#[derive(Debug)]
pub struct Timer {
    clock: SharedClock,
    /// `None` when disabled
    interval_ms: Option<u32>,
    last_fire: u32,
    paused: bool,
    paused_at: u32,
    one_shot: bool,
    fired: bool,
    forced: bool,
}

impl Timer {
    /// Create a disabled repeating timer
    pub fn new(clock: SharedClock) -> Self {
        let now = clock.now_ms();
        Self {
            clock,
            interval_ms: None,
            last_fire: now,
            paused: false,
            paused_at: 0,
            one_shot: false,
            fired: false,
            forced: false,
        }
    }

    /// Create a disabled one-shot timer
    pub fn one_shot(clock: SharedClock) -> Self {
        Self {
            one_shot: true,
            ..Self::new(clock)
        }
    }

    /// Set the interval and restart counting from now
    pub fn start(&mut self, interval_ms: i64) {
        self.set_interval(interval_ms);
        self.reset();
    }

    /// Change the interval without restarting.
    ///
    /// Zero or negative disables the timer. Intervals are capped at `i32::MAX`
    /// so that [`ticks_diff`] stays unambiguous.
    pub fn set_interval(&mut self, interval_ms: i64) {
        self.interval_ms = if interval_ms > 0 {
            Some(interval_ms.min(i32::MAX as i64) as u32)
        } else {
            None
        };
    }

    /// Returns true when the timer is due, and re-arms it.
    pub fn check(&mut self) -> bool {
        let Some(interval) = self.interval_ms else {
            return false;
        };
        if self.paused || (self.one_shot && self.fired) {
            return false;
        }

        if self.forced {
            self.forced = false;
            self.fired = self.one_shot;
            return true;
        }

        let now = self.clock.now_ms();
        if ticks_diff(now, self.last_fire) >= interval as i32 {
            self.last_fire = now;
            self.fired = self.one_shot;
            return true;
        }
        false
    }

    /// Stop counting; time spent paused is not charged to the interval
    pub fn pause(&mut self) {
        if !self.paused {
            self.paused = true;
            self.paused_at = self.clock.now_ms();
        }
    }

    /// Continue counting, shifting the last fire by the paused duration
    pub fn resume(&mut self) {
        if self.paused {
            let paused_for = ticks_diff(self.clock.now_ms(), self.paused_at);
            self.last_fire = ticks_add(self.last_fire, paused_for);
            self.paused = false;
        }
    }

    /// Restart from now, clearing pause, trigger and one-shot latch
    pub fn reset(&mut self) {
        self.last_fire = self.clock.now_ms();
        self.paused = false;
        self.paused_at = 0;
        self.forced = false;
        self.fired = false;
    }

    /// Make the next `check()` report due once
    pub fn trigger(&mut self) {
        self.forced = true;
    }

    /// Whether the timer is paused
    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Whether an interval is set
    pub fn is_enabled(&self) -> bool {
        self.interval_ms.is_some()
    }

    /// Current interval in milliseconds
    pub fn interval_ms(&self) -> Option<u32> {
        self.interval_ms
    }
}

/// Named timers owned by one module
#[derive(Debug)]
pub struct TimerSet {
    clock: SharedClock,
    timers: BTreeMap<String, Timer>,
}

impl TimerSet {
    /// Create a set holding the default repeating timer
    pub fn new(clock: SharedClock) -> Self {
        let mut timers = BTreeMap::new();
        timers.insert(DEFAULT_TIMER.to_string(), Timer::new(clock.clone()));
        Self { clock, timers }
    }

    /// Add a repeating timer
    pub fn add(&mut self, name: &str) -> &mut Timer {
        let timer = Timer::new(self.clock.clone());
        self.timers.entry(name.to_string()).or_insert(timer)
    }

    /// Add a one-shot timer
    pub fn add_one_shot(&mut self, name: &str) -> &mut Timer {
        let timer = Timer::one_shot(self.clock.clone());
        self.timers.entry(name.to_string()).or_insert(timer)
    }

    /// Look up a timer
    pub fn get(&self, name: &str) -> Option<&Timer> {
        self.timers.get(name)
    }

    /// Look up a timer mutably
    pub fn get_mut(&mut self, name: &str) -> Option<&mut Timer> {
        self.timers.get_mut(name)
    }

    /// Check a timer; unknown names are never due
    pub fn check(&mut self, name: &str) -> bool {
        self.timers.get_mut(name).is_some_and(Timer::check)
    }

    /// Timer names in order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.timers.keys().map(String::as_str)
    }

    /// Shared clock of this set
    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manual(start: u32) -> (Rc<ManualClock>, SharedClock) {
        let clock = Rc::new(ManualClock::starting_at(start));
        let shared: SharedClock = clock.clone();
        (clock, shared)
    }

    #[test]
    fn test_repeating_timer() {
        let (clock, shared) = manual(0);
        let mut timer = Timer::new(shared);
        timer.start(1000);

        clock.advance(999);
        assert!(!timer.check());
        clock.advance(1);
        assert!(timer.check());
        // Re-armed from the fire time
        assert!(!timer.check());
        clock.advance(1000);
        assert!(timer.check());
    }

    #[test]
    fn test_disabled_timer() {
        let (clock, shared) = manual(0);
        let mut timer = Timer::new(shared);
        timer.start(0);
        clock.advance(10_000);
        assert!(!timer.check());
        timer.trigger();
        assert!(!timer.check());

        timer.start(-5);
        assert!(!timer.is_enabled());
    }

    #[test]
    fn test_pause_resume_preserves_remaining_time() {
        let (clock, shared) = manual(0);
        let mut timer = Timer::new(shared);
        timer.start(1000);

        clock.advance(400);
        timer.pause();
        clock.advance(2000);
        assert!(!timer.check(), "paused timer is never due");
        timer.resume();
        assert!(!timer.check(), "not due immediately on resume");

        clock.advance(599);
        assert!(!timer.check());
        clock.advance(1);
        assert!(timer.check(), "due after 600 ms of further run time");
    }

    #[test]
    fn test_double_pause_keeps_first_timestamp() {
        let (clock, shared) = manual(0);
        let mut timer = Timer::new(shared);
        timer.start(100);
        clock.advance(50);
        timer.pause();
        clock.advance(30);
        timer.pause();
        clock.advance(30);
        timer.resume();
        // 60 ms paused in total
        clock.advance(49);
        assert!(!timer.check());
        clock.advance(1);
        assert!(timer.check());
    }

    #[test]
    fn test_one_shot_latch() {
        let (clock, shared) = manual(0);
        let mut timer = Timer::one_shot(shared);
        timer.start(100);

        clock.advance(100);
        assert!(timer.check());
        for _ in 0..5 {
            clock.advance(1000);
            assert!(!timer.check());
        }

        timer.reset();
        clock.advance(100);
        assert!(timer.check());
        assert!(!timer.check());
    }

    #[test]
    fn test_trigger_is_consumed() {
        let (_clock, shared) = manual(0);
        let mut timer = Timer::new(shared);
        timer.start(60_000);

        timer.trigger();
        assert!(timer.check());
        assert!(!timer.check());
    }

    #[test]
    fn test_trigger_latches_one_shot() {
        let (clock, shared) = manual(0);
        let mut timer = Timer::one_shot(shared);
        timer.start(100);
        timer.trigger();
        assert!(timer.check());
        clock.advance(500);
        assert!(!timer.check());
    }

    #[test]
    fn test_wraparound() {
        let (clock, shared) = manual(u32::MAX - 100);
        let mut timer = Timer::new(shared);
        timer.start(500);

        clock.advance(300); // wraps past zero
        assert!(clock.now_ms() < 1000);
        assert!(!timer.check());
        clock.advance(200);
        assert!(timer.check());
    }

    #[test]
    fn test_pause_across_wraparound() {
        let (clock, shared) = manual(u32::MAX - 10);
        let mut timer = Timer::new(shared);
        timer.start(100);
        clock.advance(40);
        timer.pause();
        clock.advance(1000);
        timer.resume();
        clock.advance(59);
        assert!(!timer.check());
        clock.advance(1);
        assert!(timer.check());
    }

    #[test]
    fn test_ticks_helpers() {
        assert_eq!(ticks_diff(5, u32::MAX - 4), 10);
        assert_eq!(ticks_diff(0, 10), -10);
        assert_eq!(ticks_add(u32::MAX, 2), 1);
        assert_eq!(interval_from_secs(0.05), 50);
        assert_eq!(interval_from_secs(30.0), 30_000);
        assert_eq!(interval_from_secs(0.0), -1);
    }

    #[test]
    fn test_timer_set() {
        let (clock, shared) = manual(0);
        let mut timers = TimerSet::new(shared);
        timers.add("hello").start(10);
        timers.add_one_shot("boot").start(5);

        assert_eq!(timers.names().collect::<Vec<_>>(), vec!["boot", "hello", "timer0"]);
        assert!(!timers.check("missing"));

        clock.advance(10);
        assert!(timers.check("hello"));
        assert!(timers.check("boot"));
        assert!(!timers.check(DEFAULT_TIMER));
    }
}
