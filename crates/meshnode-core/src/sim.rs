//! In-memory board
//!
//! [`SimBoard`] stands in for the real peripherals so a node can run on a
//! host: an RTC that keeps time on the node clock, a character display that
//! records what was drawn, digital and analog inputs driven by the caller,
//! and radios that either keep frames locally or put them on an [`Ether`]
//! shared with other simulated boards.
//!
//! ```text
//!   node 1 ─ SimRadio ─┐                ┌─ SimRadio ─ node 2
//!                      └──► Ether ◄─────┘
//!                    links: (1,2) rssi 200 ± jitter
//! ```

use crate::error::{NodeError, Result};
use crate::hal::{Board, DeviceConfig, DisplayDevice, Driver, HardwareConfig, IrqEvent, PinMode, Pull, RadioDevice, RtcDevice};
use crate::mesh::packet::NodeId;
use crate::state::{BoardState, Inbound, WallClock};
use crate::timer::SharedClock;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;
use tracing::{debug, info, trace, warn};

/// Epoch the simulated RTC starts at (2024-01-01 00:00:00 UTC)
pub const SIM_EPOCH: i64 = 1_704_067_200;

/// DS3231 stand-in
#[derive(Debug)]
pub struct SimRtc {
    time: WallClock,
    temperature: f64,
}

impl SimRtc {
    /// RTC at `epoch`, 25 °C
    pub fn new(clock: SharedClock, epoch: i64) -> Self {
        Self {
            time: WallClock::new(clock, epoch),
            temperature: 25.0,
        }
    }

    /// Set the die temperature
    pub fn set_temperature(&mut self, celsius: f64) {
        self.temperature = celsius;
    }
}

impl RtcDevice for SimRtc {
    fn datetime(&mut self) -> Result<i64> {
        Ok(self.time.now())
    }

    fn set_datetime(&mut self, epoch: i64) -> Result<()> {
        self.time.set(epoch);
        Ok(())
    }

    fn temperature(&mut self) -> Result<f64> {
        Ok(self.temperature)
    }
}

/// Character LCD stand-in
#[derive(Debug, Clone)]
pub struct SimDisplay {
    rows: usize,
    cols: usize,
    lines: Vec<String>,
    cursor: (usize, usize),
    backlight: bool,
    writes: usize,
}

impl SimDisplay {
    /// Blank display with the backlight on
    pub fn new(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            lines: vec![" ".repeat(cols); rows],
            cursor: (0, 0),
            backlight: true,
            writes: 0,
        }
    }

    /// Current contents, one string per row
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// Number of `put_str` calls so far
    pub fn writes(&self) -> usize {
        self.writes
    }
}

impl DisplayDevice for SimDisplay {
    fn clear(&mut self) -> Result<()> {
        for line in &mut self.lines {
            *line = " ".repeat(self.cols);
        }
        self.cursor = (0, 0);
        Ok(())
    }

    fn move_to(&mut self, col: usize, row: usize) -> Result<()> {
        if row >= self.rows || col >= self.cols {
            return Err(NodeError::device("display", format!("cursor ({col}, {row}) out of range")));
        }
        self.cursor = (col, row);
        Ok(())
    }

    fn put_str(&mut self, text: &str) -> Result<()> {
        let (col, row) = self.cursor;
        let Some(line) = self.lines.get_mut(row) else {
            return Ok(());
        };
        let mut chars: Vec<char> = line.chars().collect();
        let mut end = col;
        for (slot, c) in chars.iter_mut().skip(col).zip(text.chars()) {
            *slot = c;
            end += 1;
        }
        *line = chars.into_iter().collect();
        self.cursor = (end.min(self.cols.saturating_sub(1)), row);
        self.writes += 1;
        Ok(())
    }

    fn backlight_on(&mut self) -> Result<()> {
        self.backlight = true;
        Ok(())
    }

    fn backlight_off(&mut self) -> Result<()> {
        self.backlight = false;
        Ok(())
    }

    fn backlight(&self) -> bool {
        self.backlight
    }
}

/// One frame put on air
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transmission {
    /// Sending station
    pub from: NodeId,
    /// Frame bytes
    pub data: Vec<u8>,
    /// Stations that heard it
    pub heard_by: Vec<NodeId>,
}

/// Shared radio medium
#[derive(Debug)]
pub struct Ether {
    links: RefCell<BTreeMap<(NodeId, NodeId), u8>>,
    mailboxes: RefCell<BTreeMap<NodeId, VecDeque<Inbound>>>,
    log: RefCell<Vec<Transmission>>,
    rng: RefCell<StdRng>,
    jitter: u8,
}

/// Ether handle shared by every attached radio
pub type SharedEther = Rc<Ether>;

impl Ether {
    /// Empty medium; rssi varies by up to `jitter` per delivery
    pub fn new(seed: u64, jitter: u8) -> Self {
        Self {
            links: RefCell::new(BTreeMap::new()),
            mailboxes: RefCell::new(BTreeMap::new()),
            log: RefCell::new(Vec::new()),
            rng: RefCell::new(StdRng::seed_from_u64(seed)),
            jitter,
        }
    }

    /// Make two stations hear each other at `rssi`
    pub fn connect(&self, a: NodeId, b: NodeId, rssi: u8) {
        let mut links = self.links.borrow_mut();
        links.insert((a, b), rssi);
        links.insert((b, a), rssi);
    }

    /// Cut the link between two stations
    pub fn disconnect(&self, a: NodeId, b: NodeId) {
        let mut links = self.links.borrow_mut();
        links.remove(&(a, b));
        links.remove(&(b, a));
    }

    /// Nominal rssi from `a` to `b`
    pub fn rssi(&self, a: NodeId, b: NodeId) -> Option<u8> {
        self.links.borrow().get(&(a, b)).copied()
    }

    /// Deliver a frame to every station linked to `from`
    pub fn transmit(&self, from: NodeId, data: &[u8]) -> Vec<NodeId> {
        let receivers: Vec<(NodeId, u8)> = self
            .links
            .borrow()
            .iter()
            .filter(|((a, _), _)| *a == from)
            .map(|((_, b), rssi)| (*b, *rssi))
            .collect();

        let mut mailboxes = self.mailboxes.borrow_mut();
        let mut rng = self.rng.borrow_mut();
        for (to, rssi) in &receivers {
            let rssi = if self.jitter == 0 {
                *rssi
            } else {
                let delta = rng.gen_range(-i16::from(self.jitter)..=i16::from(self.jitter));
                (i16::from(*rssi) + delta).clamp(0, 255) as u8
            };
            mailboxes.entry(*to).or_default().push_back(Inbound {
                data: data.to_vec(),
                rssi,
            });
        }

        let heard_by: Vec<NodeId> = receivers.into_iter().map(|(to, _)| to).collect();
        trace!(from, len = data.len(), ?heard_by, "on air");
        self.log.borrow_mut().push(Transmission {
            from,
            data: data.to_vec(),
            heard_by: heard_by.clone(),
        });
        heard_by
    }

    /// Next frame waiting for a station
    pub fn receive(&self, station: NodeId) -> Option<Inbound> {
        self.mailboxes.borrow_mut().get_mut(&station)?.pop_front()
    }

    /// Every transmission so far
    pub fn transmissions(&self) -> Vec<Transmission> {
        self.log.borrow().clone()
    }
}

/// LoRa transceiver stand-in
#[derive(Debug)]
pub struct SimRadio {
    link: String,
    ether: Option<(SharedEther, NodeId)>,
    inbox: VecDeque<Inbound>,
    sent: Vec<Vec<u8>>,
}

impl SimRadio {
    /// Radio feeding the given link queue
    pub fn new(link: impl Into<String>) -> Self {
        Self {
            link: link.into(),
            ether: None,
            inbox: VecDeque::new(),
            sent: Vec::new(),
        }
    }

    /// Link queue key
    pub fn link(&self) -> &str {
        &self.link
    }

    /// Frames sent so far
    pub fn sent(&self) -> &[Vec<u8>] {
        &self.sent
    }
}

impl RadioDevice for SimRadio {
    fn send(&mut self, frame: &[u8]) -> Result<()> {
        if let Some((ether, station)) = &self.ether {
            ether.transmit(*station, frame);
        }
        self.sent.push(frame.to_vec());
        Ok(())
    }

    fn receive(&mut self) -> Option<Inbound> {
        if let Some(frame) = self.inbox.pop_front() {
            return Some(frame);
        }
        let (ether, station) = self.ether.as_ref()?;
        ether.receive(*station)
    }
}

#[derive(Debug, Clone)]
struct DigitalInput {
    config: DeviceConfig,
    irq: bool,
}

/// Simulated board
#[derive(Debug)]
pub struct SimBoard {
    clock: SharedClock,
    rtc: SimRtc,
    rtc_key: Option<String>,
    displays: BTreeMap<String, SimDisplay>,
    radios: BTreeMap<String, SimRadio>,
    digital: BTreeMap<String, DigitalInput>,
    analog: BTreeMap<String, i64>,
    /// Raw pin levels, kept across reinit
    levels: BTreeMap<String, u8>,
    pending_irqs: Vec<IrqEvent>,
    ether: Option<(SharedEther, NodeId)>,
}

impl SimBoard {
    /// Board whose RTC starts at [`SIM_EPOCH`]
    pub fn new(clock: SharedClock) -> Self {
        Self::with_epoch(clock, SIM_EPOCH)
    }

    /// Board whose RTC starts at `epoch`
    pub fn with_epoch(clock: SharedClock, epoch: i64) -> Self {
        Self {
            rtc: SimRtc::new(clock.clone(), epoch),
            clock,
            rtc_key: None,
            displays: BTreeMap::new(),
            radios: BTreeMap::new(),
            digital: BTreeMap::new(),
            analog: BTreeMap::new(),
            levels: BTreeMap::new(),
            pending_irqs: Vec::new(),
            ether: None,
        }
    }

    /// Put this board's radios on a shared medium as `station`
    pub fn attach(&mut self, ether: SharedEther, station: NodeId) {
        for radio in self.radios.values_mut() {
            radio.ether = Some((ether.clone(), station));
        }
        self.ether = Some((ether, station));
    }

    /// Set the RTC die temperature
    pub fn set_temperature(&mut self, celsius: f64) {
        self.rtc.set_temperature(celsius);
    }

    /// Move the RTC (not the system wall clock)
    pub fn set_rtc_time(&mut self, epoch: i64) {
        self.rtc.time.set(epoch);
    }

    /// Current RTC time
    pub fn rtc_time(&self) -> i64 {
        self.rtc.time.now()
    }

    /// Raw ADC counts for an analog input
    pub fn set_analog(&mut self, device: &str, counts: i64) {
        self.analog.insert(device.to_string(), counts);
    }

    /// Drive a digital pin; an IRQ pin queues an interrupt edge on change
    pub fn set_pin(&mut self, device: &str, pin_value: u8) {
        let pin_value = pin_value.min(1);
        let previous = self.levels.insert(device.to_string(), pin_value);
        let Some(input) = self.digital.get(device) else {
            return;
        };
        if input.irq && previous != Some(pin_value) {
            self.pending_irqs.push(IrqEvent {
                device: device.to_string(),
                state: input.config.logical_state(pin_value),
                pin_value,
            });
        }
    }

    /// Press a pull-up button: the level drops and an edge is queued
    pub fn press(&mut self, device: &str) {
        self.set_pin(device, 0);
    }

    /// Release a pull-up button
    pub fn release(&mut self, device: &str) {
        self.set_pin(device, 1);
    }

    /// Queue a received frame on the first radio
    pub fn inject_frame(&mut self, data: impl Into<Vec<u8>>, rssi: u8) -> bool {
        match self.radios.values_mut().next() {
            Some(radio) => {
                radio.inbox.push_back(Inbound {
                    data: data.into(),
                    rssi,
                });
                true
            }
            None => false,
        }
    }

    /// Frames sent by every radio, in radio-name order
    pub fn sent_frames(&self) -> Vec<Vec<u8>> {
        self.radios.values().flat_map(|r| r.sent().iter().cloned()).collect()
    }

    /// Display by device key
    pub fn sim_display(&self, key: &str) -> Option<&SimDisplay> {
        self.displays.get(key)
    }

    fn default_level(config: &DeviceConfig) -> u8 {
        match config.pull {
            Some(Pull::PullUp) => 1,
            _ => 0,
        }
    }
}

impl Board for SimBoard {
    fn init(&mut self, hardware: &HardwareConfig, state: &mut BoardState) -> Result<()> {
        for link in hardware.uart_links() {
            state.link_mut(&link);
        }

        self.rtc_key = None;
        self.digital.clear();
        self.pending_irqs.clear();
        let mut displays = BTreeMap::new();
        let mut radios = BTreeMap::new();

        for (name, device) in &hardware.devices {
            match device.driver {
                Driver::Ds3231 => {
                    if self.rtc_key.is_none() {
                        self.rtc_key = Some(name.clone());
                        state.wall_clock.set(self.rtc.time.now());
                    }
                }
                Driver::LcdI2c => {
                    let rows = device.rows.unwrap_or(2);
                    let cols = device.cols.unwrap_or(16);
                    let display = match self.displays.remove(name) {
                        Some(d) if d.rows == rows && d.cols == cols => d,
                        _ => SimDisplay::new(rows, cols),
                    };
                    displays.insert(name.clone(), display);
                }
                Driver::IrqPin | Driver::GpioPin if device.mode == PinMode::In => {
                    self.levels
                        .entry(name.clone())
                        .or_insert_with(|| Self::default_level(device));
                    self.digital.insert(
                        name.clone(),
                        DigitalInput {
                            config: device.clone(),
                            irq: device.driver == Driver::IrqPin,
                        },
                    );
                }
                Driver::IrqPin | Driver::GpioPin => {}
                Driver::AdcPin => {
                    self.analog.entry(name.clone()).or_insert(0);
                }
                Driver::LoraE220 => {
                    let Some(link) = device.link() else {
                        warn!(device = %name, "radio without a bus, skipped");
                        continue;
                    };
                    let mut radio = match self.radios.remove(name) {
                        Some(r) if r.link == link => r,
                        _ => SimRadio::new(link.clone()),
                    };
                    radio.ether = self.ether.clone();
                    state.link_mut(&link);
                    radios.insert(name.clone(), radio);
                }
            }
        }

        self.displays = displays;
        self.radios = radios;
        info!(
            devices = hardware.devices.len(),
            radios = self.radios.len(),
            "simulated board up"
        );
        Ok(())
    }

    fn update(&mut self, state: &mut BoardState) -> Result<()> {
        for (name, input) in &self.digital {
            // IRQ pins are refreshed by interrupt processing.
            if input.irq {
                continue;
            }
            let level = self.levels.get(name).copied().unwrap_or(0);
            state.set_reading(name, i64::from(input.config.logical_state(level)));
        }
        for (name, counts) in &self.analog {
            state.set_reading(name, *counts);
        }
        for radio in self.radios.values_mut() {
            while let Some(frame) = radio.receive() {
                debug!(link = %radio.link, len = frame.data.len(), rssi = frame.rssi, "frame received");
                state.link_mut(&radio.link).inbound.push_back(frame);
            }
        }
        Ok(())
    }

    fn take_irqs(&mut self) -> Vec<IrqEvent> {
        std::mem::take(&mut self.pending_irqs)
    }

    fn rtc(&mut self, key: &str) -> Option<&mut dyn RtcDevice> {
        if self.rtc_key.as_deref() == Some(key) {
            Some(&mut self.rtc)
        } else {
            None
        }
    }

    fn display(&mut self, key: &str) -> Option<&mut dyn DisplayDevice> {
        self.displays.get_mut(key).map(|d| d as &mut dyn DisplayDevice)
    }

    fn radio(&mut self, key: &str) -> Option<&mut dyn RadioDevice> {
        self.radios.get_mut(key).map(|r| r as &mut dyn RadioDevice)
    }

    fn default_rtc(&self) -> Option<String> {
        self.rtc_key.clone()
    }
}

impl SimBoard {
    /// Monotonic clock the board runs on
    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{default_document, HARDWARE_CONFIGURATION};
    use crate::timer::ManualClock;

    fn board() -> (Rc<ManualClock>, SimBoard, BoardState) {
        let clock = Rc::new(ManualClock::default());
        let mut board = SimBoard::new(clock.clone());
        let mut state = BoardState::new(clock.clone(), 0);
        let hw = HardwareConfig::from_value(&default_document()[HARDWARE_CONFIGURATION]).unwrap();
        board.init(&hw, &mut state).unwrap();
        (clock, board, state)
    }

    #[test]
    fn test_init_seeds_wall_clock_and_links() {
        let (clock, board, state) = board();
        assert_eq!(state.wall_clock.now(), SIM_EPOCH);
        assert!(state.link("uart_1").is_some());
        assert_eq!(board.default_rtc().as_deref(), Some("rtc"));

        clock.advance(3_000);
        assert_eq!(board.rtc_time(), SIM_EPOCH + 3);
    }

    #[test]
    fn test_irq_edges() {
        let (_clock, mut board, _state) = board();
        board.press("wake_up_button");
        board.press("wake_up_button");
        board.release("wake_up_button");

        let irqs = board.take_irqs();
        assert_eq!(irqs.len(), 2, "repeated level is not an edge");
        assert_eq!((irqs[0].state, irqs[0].pin_value), (1, 0));
        assert_eq!((irqs[1].state, irqs[1].pin_value), (0, 1));
        assert!(board.take_irqs().is_empty());
    }

    #[test]
    fn test_update_moves_readings_and_frames() {
        let (_clock, mut board, mut state) = board();
        board.set_analog("primary_adc", 2048);
        assert!(board.inject_frame(vec![1, 2, 3, 4, 5], 200));

        board.update(&mut state).unwrap();
        assert_eq!(state.reading("primary_adc").map(|r| r.as_i64()), Some(2048));
        let link = state.link("uart_1").unwrap();
        assert_eq!(link.inbound.len(), 1);
        assert_eq!(link.inbound[0].rssi, 200);
    }

    #[test]
    fn test_display_put_str() {
        let mut display = SimDisplay::new(2, 8);
        display.move_to(2, 1).unwrap();
        display.put_str("hello world").unwrap();
        assert_eq!(display.lines()[1], "  hello ");
        assert!(display.move_to(0, 2).is_err());
        display.clear().unwrap();
        assert_eq!(display.lines()[1], "        ");
    }

    #[test]
    fn test_ether_delivery() {
        let ether = Rc::new(Ether::new(7, 0));
        ether.connect(1, 2, 200);
        ether.connect(2, 3, 180);

        assert_eq!(ether.transmit(2, &[9]), vec![1, 3]);
        assert_eq!(ether.receive(1).map(|f| f.rssi), Some(200));
        assert_eq!(ether.receive(3).map(|f| f.rssi), Some(180));
        assert!(ether.receive(2).is_none());

        ether.disconnect(1, 2);
        assert_eq!(ether.transmit(1, &[9]), Vec::<NodeId>::new());
        assert_eq!(ether.transmissions().len(), 2);
    }

    #[test]
    fn test_ether_jitter_stays_in_range() {
        let ether = Ether::new(42, 5);
        ether.connect(1, 2, 253);
        for _ in 0..50 {
            ether.transmit(1, &[0]);
            let rssi = ether.receive(2).unwrap().rssi;
            assert!((248..=255).contains(&rssi));
        }
    }
}
