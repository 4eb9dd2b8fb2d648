//! Command dispatcher
//!
//! Polls the link's ingress queue, one frame per due tick. Every frame that
//! decodes is announced on `lora:message:received`; frames addressed to this
//! node go to the handler table, frames for another unicast destination are
//! handed to routing on `route:forward_request`.
//!
//! ## Handlers
//!
//! | Command           | Request payload            | Response payload            |
//! |-------------------|----------------------------|-----------------------------|
//! | GET_SENSOR_STATUS | -                          | `temp×100: i16, psi: u16`   |
//! | UPDATE_RTC        | `epoch: u32`               | -                           |
//! | MODULE_CTRL       | `module_id: u8, action: u8`| -                           |
//! | GET_PARAM         | `param_id: u8`             | `param_id, dtype, value`    |
//! | SET_PARAM         | `param_id, dtype, value`   | -                           |
//!
//! Malformed requests, unknown ids and unknown commands are dropped without a
//! reply. Responses use the initial TTL and go to the back of the egress queue.

use crate::config::SharedConfig;
use crate::error::{NodeError, Result};
use crate::event::{Event, SharedBus};
use crate::hal::SharedBoard;
use crate::mesh::packet::{decode, Command, NodeId, Packet};
use crate::mesh::params::{decode_param, encode_param, ParamTarget, ParamValue, ParameterMap};
use crate::module::{halt, revive, settings, DirectAction, Module, ModuleContext, ModuleCore, ModuleDirectory, SharedModule};
use crate::modules::pressure::PRESSURE_KEY;
use crate::modules::temperature::TEMPERATURE_KEY;
use crate::modules::LinkSettings;
use crate::scheduler::ModuleIdMap;
use crate::state::{Inbound, SharedState};
use crate::timer::{interval_from_secs, DEFAULT_TIMER};
use byteorder::{BigEndian, ByteOrder};
use serde::Deserialize;
use serde_json::Value;
use std::cell::RefCell;
use std::rc::Rc;
use tracing::{debug, info, trace, warn};

/// MODULE_CTRL action codes
const ACTION_STOP: u8 = 0;
const ACTION_RESUME: u8 = 1;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct DispatcherSettings {
    read_interval_s: f64,
    #[serde(flatten)]
    link: LinkSettings,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            read_interval_s: 0.1,
            link: LinkSettings::default(),
        }
    }
}

/// Ingress decode and command handling for one link
#[derive(Debug)]
pub struct CommandDispatcher {
    core: ModuleCore,
    node_id: NodeId,
    link: String,
    bus: SharedBus,
    state: SharedState,
    config: SharedConfig,
    board: SharedBoard,
    directory: ModuleDirectory,
    module_ids: Rc<ModuleIdMap>,
    params: Rc<ParameterMap>,
}

/// Build the dispatcher
pub fn build(name: &str, config: &Value, ctx: &ModuleContext) -> Result<SharedModule> {
    let settings: DispatcherSettings = settings(name, config)?;
    let mut module = CommandDispatcher {
        core: ctx.core(name),
        node_id: ctx.node_id,
        link: settings.link.key(),
        bus: ctx.bus.clone(),
        state: ctx.state.clone(),
        config: ctx.config.clone(),
        board: ctx.board.clone(),
        directory: ctx.directory.clone(),
        module_ids: ctx.module_ids.clone(),
        params: ctx.params.clone(),
    };
    module.start(interval_from_secs(settings.read_interval_s), DEFAULT_TIMER);
    Ok(Rc::new(RefCell::new(module)))
}

fn malformed(command: Command, reason: &str) -> NodeError {
    NodeError::MalformedPayload {
        command: command.as_byte(),
        reason: reason.to_string(),
    }
}

/// `{temperature×100: i16, pressure: u16}` big-endian
pub fn sensor_status(temperature: f64, pressure: i64) -> [u8; 4] {
    let mut payload = [0u8; 4];
    BigEndian::write_i16(&mut payload[..2], (temperature * 100.0) as i16);
    BigEndian::write_u16(&mut payload[2..], pressure.clamp(0, i64::from(u16::MAX)) as u16);
    payload
}

impl CommandDispatcher {
    /// Handle one received frame
    pub fn process(&mut self, frame: Inbound) -> Result<()> {
        let packet = match decode(&frame.data) {
            Ok(packet) => packet,
            Err(e) => {
                debug!("dropping frame: {}", e);
                return Ok(());
            }
        };
        trace!(
            dest = packet.dest,
            src = packet.src,
            command = %packet.command,
            rssi = frame.rssi,
            "frame in"
        );
        self.bus.publish(&Event::MessageReceived {
            packet: packet.clone(),
            rssi: frame.rssi,
        });

        if packet.dest == self.node_id {
            match self.dispatch(&packet) {
                Err(e @ NodeError::MalformedPayload { .. }) => debug!(src = packet.src, "request dropped: {}", e),
                Err(e) => warn!(src = packet.src, command = %packet.command, "request failed: {}", e),
                Ok(()) => {}
            }
            Ok(())
        } else if !packet.is_broadcast() {
            self.bus.publish(&Event::ForwardRequest { raw: frame.data });
            Ok(())
        } else {
            Ok(())
        }
    }

    fn dispatch(&mut self, packet: &Packet) -> Result<()> {
        let payload = packet.payload.as_slice();
        match packet.command {
            Command::GetSensorStatus => self.get_status(packet.src),
            Command::UpdateRtc => self.update_rtc(payload),
            Command::ModuleCtrl => self.module_ctrl(payload),
            Command::GetParam => self.get_param(packet.src, payload),
            Command::SetParam => self.set_param(payload),
            other => {
                trace!(command = %other, "no handler");
                Ok(())
            }
        }
    }

    fn respond(&self, dest: NodeId, command: Command, payload: impl Into<Vec<u8>>) {
        let packet = Packet::response(dest, self.node_id, command, payload);
        debug!(dest, command = %command, "response queued");
        self.state
            .borrow_mut()
            .link_mut(&self.link)
            .outbound
            .push_back(packet.to_bytes());
    }

    fn get_status(&self, src: NodeId) -> Result<()> {
        let payload = {
            let state = self.state.borrow();
            let temperature = state.reading(TEMPERATURE_KEY).map_or(0.0, |r| r.as_f64());
            let pressure = state.reading(PRESSURE_KEY).map_or(0, |r| r.as_i64());
            sensor_status(temperature, pressure)
        };
        self.respond(src, Command::GetSensorStatus, payload);
        Ok(())
    }

    fn update_rtc(&self, payload: &[u8]) -> Result<()> {
        if payload.len() < 4 {
            return Err(malformed(Command::UpdateRtc, "epoch needs 4 bytes"));
        }
        let epoch = i64::from(BigEndian::read_u32(&payload[..4]));
        self.state.borrow().wall_clock.set(epoch);

        let mut board = self.board.borrow_mut();
        let Some(key) = board.default_rtc() else {
            info!(epoch, "wall clock set (no RTC device)");
            return Ok(());
        };
        if let Some(rtc) = board.rtc(&key) {
            if let Err(e) = rtc.set_datetime(epoch) {
                warn!(device = %key, "failed to set RTC: {}", e);
            }
        }
        info!(epoch, "clock updated");
        Ok(())
    }

    fn module_ctrl(&mut self, payload: &[u8]) -> Result<()> {
        let [module_id, action, ..] = *payload else {
            return Err(malformed(Command::ModuleCtrl, "needs module id and action"));
        };
        let Some(name) = self.module_ids.name(module_id).map(str::to_string) else {
            debug!(module_id, "unknown module id");
            return Ok(());
        };
        if !matches!(action, ACTION_STOP | ACTION_RESUME) {
            debug!(module = %name, action, "unknown module action");
            return Ok(());
        }

        let apply = |module: &mut dyn Module| match action {
            ACTION_STOP => halt(module),
            _ => revive(module),
        };
        if name == self.core.name() {
            apply(self);
        } else {
            let Some(module) = self.directory.get(&name) else {
                debug!(module = %name, "module not running");
                return Ok(());
            };
            let mut module = module
                .try_borrow_mut()
                .map_err(|_| NodeError::ModuleUnavailable(name.clone()))?;
            apply(&mut *module);
        }
        info!(module = %name, action, "module control applied");
        Ok(())
    }

    fn get_param(&self, src: NodeId, payload: &[u8]) -> Result<()> {
        let Some(&param_id) = payload.first() else {
            return Err(malformed(Command::GetParam, "no parameter id"));
        };
        let Some(ParamTarget::Config(path)) = self.params.target(param_id) else {
            debug!(param_id, "parameter not readable");
            return Ok(());
        };
        let Some(value) = self.config.get(path).as_ref().and_then(ParamValue::from_json) else {
            debug!(param_id, %path, "parameter has no wire representation");
            return Ok(());
        };
        self.respond(src, Command::GetParam, encode_param(param_id, &value));
        Ok(())
    }

    fn set_param(&mut self, payload: &[u8]) -> Result<()> {
        let Some((param_id, value)) = decode_param(payload) else {
            return Err(malformed(Command::SetParam, "bad id, dtype or value width"));
        };
        let params = self.params.clone();
        match params.target(param_id) {
            None => {
                debug!(param_id, "unknown parameter");
            }
            Some(ParamTarget::Direct { module, method }) => {
                let Some(action) = DirectAction::resolve(method, &value) else {
                    warn!(%module, %method, "unknown direct action");
                    return Ok(());
                };
                if let Err(e) = self.perform_on(module, action) {
                    warn!(%module, "direct action failed: {}", e);
                }
            }
            Some(ParamTarget::Config(path)) => {
                info!(%path, %value, "parameter set");
                if let Err(e) = self.config.set(path, value.to_json(), true) {
                    warn!(%path, "parameter not persisted: {}", e);
                }
            }
        }
        Ok(())
    }

    fn perform_on(&mut self, name: &str, action: DirectAction) -> Result<()> {
        if name == self.core.name() {
            return self.perform(action);
        }
        let module = self
            .directory
            .get(name)
            .ok_or_else(|| NodeError::ModuleUnavailable(name.to_string()))?;
        let mut module = module
            .try_borrow_mut()
            .map_err(|_| NodeError::ModuleUnavailable(name.to_string()))?;
        module.perform(action)
    }
}

impl Module for CommandDispatcher {
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
        let Some(frame) = self.state.borrow_mut().link_mut(&self.link).inbound.pop_front() else {
            return Ok(());
        };
        self.process(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::topics;
    use crate::mesh::packet::{FrameType, INITIAL_TTL};
    use crate::modules::fixture::Fixture;
    use crate::modules::{display, reporter};
    use serde_json::json;

    fn dispatcher(fx: &Fixture) -> SharedModule {
        let module = build("message", &json!({ "read_interval_s": 0.1 }), &fx.ctx).unwrap();
        fx.ctx.directory.insert("message", module.clone());
        module
    }

    fn deliver(fx: &Fixture, module: &SharedModule, packet: Packet) {
        fx.push_inbound(packet.to_bytes(), 200);
        fx.clock.advance(100);
        module.borrow_mut().update().unwrap();
    }

    fn record(fx: &Fixture, topic: &str) -> Rc<RefCell<Vec<Event>>> {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let s = seen.clone();
        fx.ctx.bus.subscribe(topic, move |event| {
            s.borrow_mut().push(event.clone());
            Ok(())
        });
        seen
    }

    #[test]
    fn test_get_sensor_status() {
        let fx = Fixture::new();
        let module = dispatcher(&fx);
        {
            let mut state = fx.ctx.state.borrow_mut();
            state.set_reading(TEMPERATURE_KEY, 23.5);
            state.set_reading(PRESSURE_KEY, 87_i64);
        }
        deliver(&fx, &module, Packet::command(1, 9, Command::GetSensorStatus, Vec::new()));

        let out = fx.outbound();
        assert_eq!(out.len(), 1);
        let resp = decode(&out[0]).unwrap();
        assert_eq!((resp.dest, resp.src, resp.ttl), (9, 1, INITIAL_TTL));
        assert_eq!(resp.control.frame_type(), FrameType::Resp);
        assert_eq!(resp.payload, vec![0x09, 0x2E, 0x00, 0x57]);
    }

    #[test]
    fn test_one_frame_per_tick() {
        let fx = Fixture::new();
        let module = dispatcher(&fx);
        fx.push_inbound(Packet::command(1, 9, Command::GetSensorStatus, Vec::new()).to_bytes(), 200);
        fx.push_inbound(Packet::command(1, 8, Command::GetSensorStatus, Vec::new()).to_bytes(), 200);

        fx.clock.advance(100);
        module.borrow_mut().update().unwrap();
        module.borrow_mut().update().unwrap();
        assert_eq!(fx.outbound().len(), 1);

        fx.clock.advance(100);
        module.borrow_mut().update().unwrap();
        assert_eq!(fx.outbound().len(), 2);
    }

    #[test]
    fn test_forwarding_and_broadcast() {
        let fx = Fixture::new();
        let module = dispatcher(&fx);
        let received = record(&fx, topics::MESSAGE_RECEIVED);
        let forwarded = record(&fx, topics::FORWARD_REQUEST);

        let transit = Packet::command(5, 9, Command::GetSensorStatus, Vec::new());
        deliver(&fx, &module, transit.clone());
        deliver(&fx, &module, Packet::link_local(9, Command::Hello, Vec::new()));

        assert_eq!(received.borrow().len(), 2);
        assert_eq!(
            *forwarded.borrow(),
            vec![Event::ForwardRequest { raw: transit.to_bytes() }]
        );
        assert!(fx.outbound().is_empty(), "nothing addressed to this node");
    }

    #[test]
    fn test_short_frame_dropped() {
        let fx = Fixture::new();
        let module = dispatcher(&fx);
        let received = record(&fx, topics::MESSAGE_RECEIVED);
        fx.push_inbound(vec![1, 2, 3], 200);
        fx.clock.advance(100);
        module.borrow_mut().update().unwrap();
        assert!(received.borrow().is_empty());
    }

    #[test]
    fn test_get_param() {
        let fx = Fixture::new();
        let module = dispatcher(&fx);

        deliver(&fx, &module, Packet::command(1, 9, Command::GetParam, vec![0x03]));
        deliver(&fx, &module, Packet::command(1, 9, Command::GetParam, vec![0x01]));
        // Direct paths and unknown ids get no reply
        deliver(&fx, &module, Packet::command(1, 9, Command::GetParam, vec![0xA1]));
        deliver(&fx, &module, Packet::command(1, 9, Command::GetParam, vec![0x7F]));

        let out = fx.outbound();
        assert_eq!(out.len(), 2);
        assert_eq!(decode(&out[0]).unwrap().payload, vec![0x03, 0x04, 0x41, 0x48, 0x00, 0x00]);
        assert_eq!(decode(&out[1]).unwrap().payload, vec![0x01, 0x02, 0x00, 0x00, 0x00, 30]);
    }

    #[test]
    fn test_set_param_writes_config() {
        let fx = Fixture::new();
        let module = dispatcher(&fx);
        let updates = record(&fx, topics::CONFIG_UPDATED);

        deliver(
            &fx,
            &module,
            Packet::command(1, 9, Command::SetParam, encode_param(0x03, &ParamValue::Float32(3.5))),
        );
        let path = "MODULE_CONFIGURATION.pressure_1.V_TO_MPA_SLOPE";
        assert_eq!(fx.ctx.config.get(path), Some(json!(3.5)));
        assert_eq!(updates.borrow().len(), 1);
        assert_eq!(fx.ctx.config.persistent_keys(), vec![path.to_string()]);

        // Float with a short value is ignored
        deliver(&fx, &module, Packet::command(1, 9, Command::SetParam, vec![0x03, 0x04, 0x40, 0x60]));
        assert_eq!(updates.borrow().len(), 1);
    }

    #[test]
    fn test_module_ctrl() {
        let fx = Fixture::new();
        let module = dispatcher(&fx);
        let reporter = reporter::build("data_reporter", &json!({}), &fx.ctx).unwrap();
        fx.ctx.directory.insert("data_reporter", reporter.clone());
        let id = fx.ctx.module_ids.id("data_reporter").unwrap();

        deliver(&fx, &module, Packet::command(1, 9, Command::ModuleCtrl, vec![id, 0]));
        assert!(!reporter.borrow().core().autostart());
        assert!(reporter.borrow().core().timers().get(DEFAULT_TIMER).unwrap().is_paused());

        deliver(&fx, &module, Packet::command(1, 9, Command::ModuleCtrl, vec![id, 1]));
        assert!(reporter.borrow().core().autostart());
        assert!(!reporter.borrow().core().timers().get(DEFAULT_TIMER).unwrap().is_paused());

        // Unknown action and unknown id are ignored
        deliver(&fx, &module, Packet::command(1, 9, Command::ModuleCtrl, vec![id, 7]));
        deliver(&fx, &module, Packet::command(1, 9, Command::ModuleCtrl, vec![200, 0]));
        assert!(reporter.borrow().core().autostart());
    }

    #[test]
    fn test_module_ctrl_on_itself() {
        let fx = Fixture::new();
        let module = dispatcher(&fx);
        let id = fx.ctx.module_ids.id("message").unwrap();
        deliver(&fx, &module, Packet::command(1, 9, Command::ModuleCtrl, vec![id, 0]));
        assert!(!module.borrow().core().autostart());
    }

    #[test]
    fn test_update_rtc() {
        let fx = Fixture::new();
        let module = dispatcher(&fx);
        let epoch: u32 = 1_800_000_000;
        let mut payload = [0u8; 4];
        BigEndian::write_u32(&mut payload, epoch);

        deliver(&fx, &module, Packet::command(1, 9, Command::UpdateRtc, payload.to_vec()));
        assert_eq!(fx.ctx.state.borrow().wall_clock.now(), i64::from(epoch));
        assert_eq!(fx.sim.borrow().rtc_time(), i64::from(epoch));

        // Short payload leaves the clock alone
        deliver(&fx, &module, Packet::command(1, 9, Command::UpdateRtc, vec![0, 0, 1]));
        assert_eq!(fx.ctx.state.borrow().wall_clock.now(), i64::from(epoch));
    }

    #[test]
    fn test_direct_backlight_action() {
        let fx = Fixture::new();
        let module = dispatcher(&fx);
        let settings = fx.ctx.config.module_config("display");
        let display = display::build("display", &settings, &fx.ctx).unwrap();
        fx.ctx.directory.insert("display", display);
        let backlight = || {
            use crate::hal::DisplayDevice;
            fx.sim.borrow().sim_display("display").unwrap().backlight()
        };
        let updates = record(&fx, topics::CONFIG_UPDATED);

        deliver(
            &fx,
            &module,
            Packet::command(1, 9, Command::SetParam, encode_param(0xA1, &ParamValue::Bool(false))),
        );
        assert!(!backlight());
        deliver(
            &fx,
            &module,
            Packet::command(1, 9, Command::SetParam, encode_param(0xA1, &ParamValue::Uint32(1))),
        );
        assert!(backlight());
        assert!(updates.borrow().is_empty(), "direct actions bypass the configuration");
    }

    #[test]
    fn test_sensor_status_clamps_pressure() {
        assert_eq!(sensor_status(0.0, -3), [0, 0, 0, 0]);
        assert_eq!(sensor_status(-1.5, 70_000), [0xFF, 0x6A, 0xFF, 0xFF]);
    }
}
