//! Temperature sampling from the RTC die sensor

use crate::error::{NodeError, Result};
use crate::hal::SharedBoard;
use crate::module::{settings, Module, ModuleContext, ModuleCore, SharedModule};
use crate::state::SharedState;
use crate::timer::{interval_from_secs, DEFAULT_TIMER};
use serde::Deserialize;
use serde_json::Value;
use std::cell::RefCell;
use std::rc::Rc;
use tracing::trace;

/// State key the reading is stored under
pub const TEMPERATURE_KEY: &str = "temperature";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct TemperatureSettings {
    device_key: Option<String>,
    read_interval_s: f64,
}

impl Default for TemperatureSettings {
    fn default() -> Self {
        Self {
            device_key: None,
            read_interval_s: 5.0,
        }
    }
}

/// Periodic temperature reader
#[derive(Debug)]
pub struct TemperatureModule {
    core: ModuleCore,
    device_key: String,
    board: SharedBoard,
    state: SharedState,
}

/// Build a temperature reader; the RTC device must exist
pub fn build(name: &str, config: &Value, ctx: &ModuleContext) -> Result<SharedModule> {
    let settings: TemperatureSettings = settings(name, config)?;
    let device_key = settings
        .device_key
        .or_else(|| ctx.board.borrow().default_rtc())
        .ok_or_else(|| NodeError::module_init(name, "no RTC device configured"))?;
    if ctx.board.borrow_mut().rtc(&device_key).is_none() {
        return Err(NodeError::module_init(name, format!("device '{device_key}' missing")));
    }

    let mut module = TemperatureModule {
        core: ctx.core(name),
        device_key,
        board: ctx.board.clone(),
        state: ctx.state.clone(),
    };
    module.start(interval_from_secs(settings.read_interval_s), DEFAULT_TIMER);
    Ok(Rc::new(RefCell::new(module)))
}

impl Module for TemperatureModule {
    fn core(&self) -> &ModuleCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ModuleCore {
        &mut self.core
    }

    fn update(&mut self) -> Result<()> {
        if !self.core.check(DEFAULT_TIMER) {
            return Ok(());
        }
        let celsius = {
            let mut board = self.board.borrow_mut();
            let rtc = board
                .rtc(&self.device_key)
                .ok_or_else(|| NodeError::device(&self.device_key, "not present"))?;
            rtc.temperature()?
        };
        trace!(celsius, "temperature sampled");
        self.state.borrow_mut().set_reading(TEMPERATURE_KEY, celsius);
        Ok(())
    }
}
