//! Median-filtered analog input
//!
//! Each due tick reads the raw counts the board stored under `device_key`,
//! normalizes them by `adc_max_value`, pushes the sample through a running
//! median and publishes the filtered voltage on `<name>:ready`.

use super::filter::{adc_to_voltage, RunningMedianFilter};
use crate::error::Result;
use crate::event::{Event, SharedBus};
use crate::module::{settings, Module, ModuleContext, ModuleCore, SharedModule};
use crate::state::SharedState;
use crate::timer::{interval_from_secs, DEFAULT_TIMER};
use serde::Deserialize;
use serde_json::Value;
use std::cell::RefCell;
use std::rc::Rc;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct AnalogSettings {
    device_key: Option<String>,
    read_interval_s: f64,
    median_filter_size: usize,
    adc_max_value: f64,
}

impl Default for AnalogSettings {
    fn default() -> Self {
        Self {
            device_key: None,
            read_interval_s: 0.1,
            median_filter_size: 10,
            adc_max_value: 4095.0,
        }
    }
}

/// Filtered analog input
#[derive(Debug)]
pub struct AnalogInputModule {
    core: ModuleCore,
    device_key: String,
    adc_max_value: f64,
    filter: RunningMedianFilter,
    bus: SharedBus,
    state: SharedState,
}

/// Build an analog input; `device_key` defaults to the module name
pub fn build(name: &str, config: &Value, ctx: &ModuleContext) -> Result<SharedModule> {
    let settings: AnalogSettings = settings(name, config)?;
    let adc_max_value = if settings.adc_max_value > 0.0 {
        settings.adc_max_value
    } else {
        AnalogSettings::default().adc_max_value
    };

    let mut module = AnalogInputModule {
        core: ctx.core(name),
        device_key: settings.device_key.unwrap_or_else(|| name.to_string()),
        adc_max_value,
        filter: RunningMedianFilter::new(settings.median_filter_size),
        bus: ctx.bus.clone(),
        state: ctx.state.clone(),
    };
    module.start(interval_from_secs(settings.read_interval_s), DEFAULT_TIMER);
    Ok(Rc::new(RefCell::new(module)))
}

impl AnalogInputModule {
    /// Latest filtered voltage
    pub fn voltage(&self) -> Option<f32> {
        self.filter.median().map(adc_to_voltage)
    }
}

impl Module for AnalogInputModule {
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
        let raw = self
            .state
            .borrow()
            .reading(&self.device_key)
            .map_or(0.0, |r| r.as_f64());
        self.filter.add((raw / self.adc_max_value) as f32);

        if let Some(value) = self.voltage() {
            self.bus.publish(&Event::Ready {
                module: self.core.name().to_string(),
                value,
            });
        }
        Ok(())
    }
}
