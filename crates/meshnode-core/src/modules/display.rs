//! Character display state machine
//!
//! ```text
//!  boot ──► idle ──(boot timer)──► read ──► idle_1 ──(refresh)──► read
//!                                    ▲         │
//!                                    │   (backlight timeout)
//!                                    │         ▼
//!                          irq state=1 ◄───── off
//! ```
//!
//! `timer0` paces refreshes, `timer1` is the one-shot boot splash and
//! `timer2` the one-shot backlight timeout. Only rows whose text changed are
//! rewritten.

use crate::error::{NodeError, Result};
use crate::event::{topics, Event};
use crate::hal::{DisplayDevice, SharedBoard};
use crate::module::{settings, DirectAction, Module, ModuleContext, ModuleCore, SharedModule};
use crate::modules::pressure::PRESSURE_KEY;
use crate::state::SharedState;
use crate::timer::{interval_from_secs, DEFAULT_TIMER};
use chrono::DateTime;
use serde::Deserialize;
use serde_json::Value;
use std::cell::RefCell;
use std::rc::{Rc, Weak};
use tracing::{debug, warn};

/// One-shot boot splash timer
pub const BOOT_TIMER: &str = "timer1";
/// One-shot backlight timeout
pub const BACKLIGHT_TIMER: &str = "timer2";

const SPLASH: &str = "Starting ...";
const DATE_FORMAT: &str = "%d/%m/%y %H:%M";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct DisplaySettings {
    device_key: Option<String>,
    refresh_interval_s: f64,
    boot_duration_s: f64,
    backlight_timeout_s: f64,
    rows: usize,
    cols: usize,
    subs: Option<String>,
}

impl Default for DisplaySettings {
    fn default() -> Self {
        Self {
            device_key: None,
            refresh_interval_s: 1.0,
            boot_duration_s: 5.0,
            backlight_timeout_s: 30.0,
            rows: 2,
            cols: 16,
            subs: None,
        }
    }
}

/// Display states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayState {
    /// Splash on screen
    Boot,
    /// Waiting for the splash to expire
    Idle,
    /// Redraw due
    Read,
    /// Waiting for the next refresh or the backlight timeout
    Idle1,
    /// Backlight off, refresh paused
    Off,
}

impl DisplayState {
    /// State name
    pub fn name(&self) -> &'static str {
        match self {
            DisplayState::Boot => "boot",
            DisplayState::Idle => "idle",
            DisplayState::Read => "read",
            DisplayState::Idle1 => "idle_1",
            DisplayState::Off => "off",
        }
    }
}

/// Left-align `text` in exactly `width` characters
pub fn pad(text: &str, width: usize) -> String {
    format!("{:<width$.width$}", text, width = width)
}

/// Date and pressure on a character display
#[derive(Debug)]
pub struct DisplayModule {
    core: ModuleCore,
    device_key: Option<String>,
    rows: usize,
    cols: usize,
    refresh_ms: i64,
    backlight_ms: i64,
    current: DisplayState,
    previous: Vec<String>,
    board: SharedBoard,
    state: SharedState,
}

/// Build a display; without a device it is constructed stopped
pub fn build(name: &str, config: &Value, ctx: &ModuleContext) -> Result<SharedModule> {
    let settings: DisplaySettings = settings(name, config)?;
    let mut core = ctx.core(name);
    core.timers_mut().add_one_shot(BOOT_TIMER);
    core.timers_mut().add_one_shot(BACKLIGHT_TIMER);

    let present = settings
        .device_key
        .as_deref()
        .is_some_and(|key| ctx.board.borrow_mut().display(key).is_some());

    let module = Rc::new(RefCell::new(DisplayModule {
        core,
        device_key: settings.device_key,
        rows: settings.rows,
        cols: settings.cols,
        refresh_ms: interval_from_secs(settings.refresh_interval_s),
        backlight_ms: interval_from_secs(settings.backlight_timeout_s),
        current: DisplayState::Boot,
        previous: vec![String::new(); settings.rows],
        board: ctx.board.clone(),
        state: ctx.state.clone(),
    }));

    if !present {
        warn!(module = %name, "no display device, module stopped");
        module.borrow_mut().stop(DEFAULT_TIMER);
        return Ok(module);
    }

    if let Some(subs) = settings.subs {
        let weak: Weak<RefCell<DisplayModule>> = Rc::downgrade(&module);
        let owner = name.to_string();
        ctx.bus.subscribe_owned(name, topics::irq(&subs), move |event| {
            let Event::Irq { state, .. } = event else {
                return Ok(());
            };
            let module = weak
                .upgrade()
                .ok_or_else(|| NodeError::ModuleUnavailable(owner.clone()))?;
            let mut module = module
                .try_borrow_mut()
                .map_err(|_| NodeError::ModuleUnavailable(owner.clone()))?;
            module.off(Some(*state))
        });
    }

    module
        .borrow_mut()
        .start(interval_from_secs(settings.boot_duration_s), BOOT_TIMER);
    Ok(module)
}

impl DisplayModule {
    /// Current state
    pub fn current(&self) -> DisplayState {
        self.current
    }

    fn with_device<T>(&self, f: impl FnOnce(&mut dyn DisplayDevice) -> Result<T>) -> Result<T> {
        let key = self
            .device_key
            .as_deref()
            .ok_or_else(|| NodeError::device("display", "not configured"))?;
        let mut board = self.board.borrow_mut();
        let device = board
            .display(key)
            .ok_or_else(|| NodeError::device(key, "not present"))?;
        f(device)
    }

    fn boot(&mut self) -> Result<()> {
        self.with_device(|d| {
            d.clear()?;
            d.put_str(SPLASH)
        })?;
        self.current = DisplayState::Idle;
        Ok(())
    }

    fn idle(&mut self) -> Result<()> {
        if self.core.check(BOOT_TIMER) {
            self.start(self.refresh_ms, DEFAULT_TIMER);
            self.start(self.backlight_ms, BACKLIGHT_TIMER);
            self.with_device(|d| d.clear())?;
            self.current = DisplayState::Read;
        }
        Ok(())
    }

    fn render(&self) -> Vec<String> {
        let state = self.state.borrow();
        let pressure = state.reading(PRESSURE_KEY).map_or(-1, |r| r.as_i64());
        let date = DateTime::from_timestamp(state.wall_clock.now(), 0)
            .map(|dt| dt.format(DATE_FORMAT).to_string())
            .unwrap_or_default();

        let mut lines = vec![pad("", self.cols); self.rows];
        if let Some(line) = lines.get_mut(0) {
            *line = pad(&date, self.cols);
        }
        if let Some(line) = lines.get_mut(1) {
            *line = pad(&format!("P: {pressure:4}psi"), self.cols);
        }
        lines
    }

    fn read(&mut self) -> Result<()> {
        let lines = self.render();
        for (row, line) in lines.into_iter().enumerate() {
            if self.previous.get(row) == Some(&line) {
                continue;
            }
            self.with_device(|d| {
                d.move_to(0, row)?;
                d.put_str(&line)
            })?;
            if let Some(prev) = self.previous.get_mut(row) {
                *prev = line;
            }
        }
        self.current = DisplayState::Idle1;
        Ok(())
    }

    fn idle_1(&mut self) {
        if self.core.check(BACKLIGHT_TIMER) {
            self.pause(DEFAULT_TIMER);
            self.current = DisplayState::Off;
        } else if self.core.check(DEFAULT_TIMER) {
            self.current = DisplayState::Read;
        }
    }

    /// Off-state handling.
    ///
    /// With an interrupt state of 1 while off, wakes the display. Without a
    /// state (the tick), blanks the screen once if the backlight is still on.
    pub fn off(&mut self, irq_state: Option<u8>) -> Result<()> {
        match irq_state {
            Some(state) => {
                if state == 1 && self.current == DisplayState::Off {
                    self.with_device(|d| d.backlight_on())?;
                    self.reset(BACKLIGHT_TIMER);
                    self.resume(DEFAULT_TIMER);
                    self.current = DisplayState::Read;
                    self.previous = vec![String::new(); self.rows];
                    debug!(module = %self.core.name(), "display woken");
                }
                Ok(())
            }
            None => self.with_device(|d| {
                if d.backlight() {
                    d.clear()?;
                    d.backlight_off()?;
                }
                Ok(())
            }),
        }
    }

    /// Switch the backlight; turning it on also wakes the display
    pub fn set_backlight(&mut self, on: bool) -> Result<()> {
        if !on {
            return self.with_device(|d| d.backlight_off());
        }
        self.with_device(|d| d.backlight_on())?;
        if self.current == DisplayState::Off {
            self.off(Some(1))
        } else {
            self.reset(BACKLIGHT_TIMER);
            Ok(())
        }
    }
}

impl Module for DisplayModule {
    fn core(&self) -> &ModuleCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ModuleCore {
        &mut self.core
    }

    fn update(&mut self) -> Result<()> {
        match self.current {
            DisplayState::Boot => self.boot(),
            DisplayState::Idle => self.idle(),
            DisplayState::Read => self.read(),
            DisplayState::Idle1 => {
                self.idle_1();
                Ok(())
            }
            DisplayState::Off => self.off(None),
        }
    }

    fn perform(&mut self, action: DirectAction) -> Result<()> {
        match action {
            DirectAction::SetBacklight(on) => self.set_backlight(on),
        }
    }

    fn state(&self) -> Option<&'static str> {
        Some(self.current.name())
    }
}
