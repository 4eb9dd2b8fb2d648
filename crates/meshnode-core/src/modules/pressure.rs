//! Pressure transducer scaling
//!
//! Event-driven: converts every voltage published on `<subs>:ready` to psi
//! with `round((v × slope + intercept) × PSI_PER_MPA)` and stores the result
//! under `pressure`.

use crate::error::{NodeError, Result};
use crate::event::{topics, Event};
use crate::module::{settings, Module, ModuleContext, ModuleCore, SharedModule};
use crate::state::SharedState;
use serde::Deserialize;
use serde_json::Value;
use std::cell::RefCell;
use std::rc::{Rc, Weak};
use tracing::trace;

/// State key the reading is stored under
pub const PRESSURE_KEY: &str = "pressure";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
#[allow(non_snake_case)]
struct PressureSettings {
    V_TO_MPA_SLOPE: f64,
    V_TO_MPA_INTERCEPT: f64,
    PSI_PER_MPA: f64,
    subs: Option<String>,
}

impl Default for PressureSettings {
    fn default() -> Self {
        Self {
            V_TO_MPA_SLOPE: 12.5,
            V_TO_MPA_INTERCEPT: -1.25,
            PSI_PER_MPA: 145.038,
            subs: None,
        }
    }
}

/// Linear volts → MPa → psi conversion
#[derive(Debug)]
pub struct PressureModule {
    core: ModuleCore,
    slope: f64,
    intercept: f64,
    psi_per_mpa: f64,
    state: SharedState,
}

/// Build a pressure converter subscribed to its analog source
pub fn build(name: &str, config: &Value, ctx: &ModuleContext) -> Result<SharedModule> {
    let settings: PressureSettings = settings(name, config)?;
    let mut core = ctx.core(name);
    core.set_polling(false);

    let module = Rc::new(RefCell::new(PressureModule {
        core,
        slope: settings.V_TO_MPA_SLOPE,
        intercept: settings.V_TO_MPA_INTERCEPT,
        psi_per_mpa: settings.PSI_PER_MPA,
        state: ctx.state.clone(),
    }));

    if let Some(subs) = settings.subs {
        let weak: Weak<RefCell<PressureModule>> = Rc::downgrade(&module);
        let owner = name.to_string();
        ctx.bus.subscribe_owned(name, topics::ready(&subs), move |event| {
            let Event::Ready { value, .. } = event else {
                return Ok(());
            };
            let module = weak
                .upgrade()
                .ok_or_else(|| NodeError::ModuleUnavailable(owner.clone()))?;
            let mut module = module
                .try_borrow_mut()
                .map_err(|_| NodeError::ModuleUnavailable(owner.clone()))?;
            module.on_voltage(*value);
            Ok(())
        });
    }
    Ok(module)
}

impl PressureModule {
    /// psi for a transducer voltage
    pub fn to_psi(&self, volts: f32) -> i64 {
        let mpa = f64::from(volts) * self.slope + self.intercept;
        (mpa * self.psi_per_mpa).round() as i64
    }

    fn on_voltage(&mut self, volts: f32) {
        let psi = self.to_psi(volts);
        trace!(volts, psi, "pressure converted");
        self.state.borrow_mut().set_reading(PRESSURE_KEY, psi);
    }
}

impl Module for PressureModule {
    fn core(&self) -> &ModuleCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ModuleCore {
        &mut self.core
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::fixture::Fixture;
    use serde_json::json;

    #[test]
    fn test_converts_published_voltage() {
        let fx = Fixture::new();
        let module = build("pressure_1", &json!({ "subs": "analog_adc_1" }), &fx.ctx).unwrap();
        assert!(!module.borrow().core().polling());

        let delivered = fx.ctx.bus.publish(&Event::Ready {
            module: "analog_adc_1".into(),
            value: 0.5,
        });
        assert_eq!(delivered, 1);
        // (0.5 * 12.5 - 1.25) * 145.038 = 725.19
        assert_eq!(
            fx.ctx.state.borrow().reading(PRESSURE_KEY).map(|r| r.as_i64()),
            Some(725)
        );
    }

    #[test]
    fn test_without_source_does_not_subscribe() {
        let fx = Fixture::new();
        build("pressure_1", &json!({}), &fx.ctx).unwrap();
        assert_eq!(fx.ctx.bus.subscriber_count(&topics::ready("analog_adc_1")), 0);
    }
}
