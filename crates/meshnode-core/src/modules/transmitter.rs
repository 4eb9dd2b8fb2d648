//! Radio egress: one queued frame per due tick

use super::LinkSettings;
use crate::error::{NodeError, Result};
use crate::hal::SharedBoard;
use crate::mesh::packet::decode;
use crate::module::{settings, Module, ModuleContext, ModuleCore, SharedModule};
use crate::state::SharedState;
use crate::timer::{interval_from_secs, DEFAULT_TIMER};
use serde::Deserialize;
use serde_json::Value;
use std::cell::RefCell;
use std::rc::Rc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct TransmitterSettings {
    device_key: Option<String>,
    check_interval_s: f64,
    #[serde(flatten)]
    link: LinkSettings,
}

impl Default for TransmitterSettings {
    fn default() -> Self {
        Self {
            device_key: None,
            check_interval_s: 0.1,
            link: LinkSettings::default(),
        }
    }
}

/// Drains the egress queue of one link to its radio
#[derive(Debug)]
pub struct TransmitterModule {
    core: ModuleCore,
    device_key: String,
    link: String,
    board: SharedBoard,
    state: SharedState,
}

/// Build a transmitter
pub fn build(name: &str, config: &Value, ctx: &ModuleContext) -> Result<SharedModule> {
    let settings: TransmitterSettings = settings(name, config)?;
    let device_key = settings
        .device_key
        .ok_or_else(|| NodeError::module_init(name, "no radio device configured"))?;
    if ctx.board.borrow_mut().radio(&device_key).is_none() {
        // The queue still drains; frames are dropped until the radio comes back.
        warn!(module = %name, device = %device_key, "radio missing");
    }

    let mut module = TransmitterModule {
        core: ctx.core(name),
        device_key,
        link: settings.link.key(),
        board: ctx.board.clone(),
        state: ctx.state.clone(),
    };
    module.start(interval_from_secs(settings.check_interval_s), DEFAULT_TIMER);
    Ok(Rc::new(RefCell::new(module)))
}

impl Module for TransmitterModule {
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
        let Some(frame) = self.state.borrow_mut().link_mut(&self.link).outbound.pop_front() else {
            return Ok(());
        };

        if let Ok(packet) = decode(&frame) {
            debug!(
                dest = packet.dest,
                src = packet.src,
                ttl = packet.ttl,
                command = %packet.command,
                "sending"
            );
        }
        let mut board = self.board.borrow_mut();
        let radio = board
            .radio(&self.device_key)
            .ok_or_else(|| NodeError::device(&self.device_key, "not present"))?;
        radio.send(&frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::fixture::Fixture;
    use serde_json::json;

    #[test]
    fn test_sends_one_frame_per_tick_in_order() {
        let fx = Fixture::new();
        let module = build(
            "lora_tx",
            &json!({ "device_key": "lora_module", "check_interval_s": 0.1, "bus_type": "uart", "bus_id": "1" }),
            &fx.ctx,
        )
        .unwrap();
        fx.push_outbound(vec![1, 0, 0, 1, 1]);
        fx.push_outbound(vec![2, 0, 0, 1, 1]);

        fx.clock.advance(100);
        module.borrow_mut().update().unwrap();
        assert_eq!(fx.sim.borrow().sent_frames(), vec![vec![1, 0, 0, 1, 1]]);

        // Not due yet
        module.borrow_mut().update().unwrap();
        assert_eq!(fx.sim.borrow().sent_frames().len(), 1);

        fx.clock.advance(100);
        module.borrow_mut().update().unwrap();
        assert_eq!(fx.sim.borrow().sent_frames().len(), 2);
        assert!(fx.outbound().is_empty());
    }

    #[test]
    fn test_requires_device_key() {
        let fx = Fixture::new();
        assert!(build("lora_tx", &json!({}), &fx.ctx).is_err());
    }
}
