//! Wall clock drift correction against the RTC chip

use crate::error::{NodeError, Result};
use crate::hal::SharedBoard;
use crate::module::{settings, Module, ModuleContext, ModuleCore, SharedModule};
use crate::state::SharedState;
use crate::timer::{interval_from_secs, DEFAULT_TIMER};
use serde::Deserialize;
use serde_json::Value;
use std::cell::RefCell;
use std::rc::Rc;
use tracing::info;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct ClockSettings {
    device_key: Option<String>,
    drift_check_interval_s: f64,
    max_drift_s: f64,
}

impl Default for ClockSettings {
    fn default() -> Self {
        Self {
            device_key: None,
            drift_check_interval_s: 60.0,
            max_drift_s: 2.0,
        }
    }
}

/// Keeps the system wall clock within `max_drift_s` of the RTC
#[derive(Debug)]
pub struct ClockModule {
    core: ModuleCore,
    device_key: String,
    max_drift_s: f64,
    board: SharedBoard,
    state: SharedState,
}

/// Build a clock module; the RTC device must exist
pub fn build(name: &str, config: &Value, ctx: &ModuleContext) -> Result<SharedModule> {
    let settings: ClockSettings = settings(name, config)?;
    let device_key = settings
        .device_key
        .or_else(|| ctx.board.borrow().default_rtc())
        .ok_or_else(|| NodeError::module_init(name, "no RTC device configured"))?;
    if ctx.board.borrow_mut().rtc(&device_key).is_none() {
        return Err(NodeError::module_init(name, format!("device '{device_key}' missing")));
    }

    let mut module = ClockModule {
        core: ctx.core(name),
        device_key,
        max_drift_s: settings.max_drift_s,
        board: ctx.board.clone(),
        state: ctx.state.clone(),
    };
    module.start(interval_from_secs(settings.drift_check_interval_s), DEFAULT_TIMER);
    Ok(Rc::new(RefCell::new(module)))
}

impl ClockModule {
    /// Compare RTC and wall clock; returns the drift in seconds
    pub fn check_drift(&mut self) -> Result<i64> {
        let rtc_time = {
            let mut board = self.board.borrow_mut();
            let rtc = board
                .rtc(&self.device_key)
                .ok_or_else(|| NodeError::device(&self.device_key, "not present"))?;
            rtc.datetime()?
        };
        let state = self.state.borrow();
        let drift = rtc_time - state.wall_clock.now();
        if drift.abs() as f64 > self.max_drift_s {
            info!(module = %self.core.name(), drift, "wall clock corrected from RTC");
            state.wall_clock.set(rtc_time);
        }
        Ok(drift)
    }
}

impl Module for ClockModule {
    fn core(&self) -> &ModuleCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ModuleCore {
        &mut self.core
    }

    fn update(&mut self) -> Result<()> {
        if self.core.check(DEFAULT_TIMER) {
            self.check_drift()?;
        }
        Ok(())
    }
}
