//! Periodic sensor report to the base station

use super::pressure::PRESSURE_KEY;
use super::temperature::TEMPERATURE_KEY;
use super::LinkSettings;
use crate::error::Result;
use crate::mesh::packet::{Command, NodeId, Packet};
use crate::module::{settings, Module, ModuleContext, ModuleCore, SharedModule};
use crate::state::{BoardState, SharedState};
use crate::timer::{interval_from_secs, DEFAULT_TIMER};
use byteorder::{BigEndian, ByteOrder};
use serde::Deserialize;
use serde_json::Value;
use std::cell::RefCell;
use std::rc::Rc;
use tracing::{debug, info};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct ReporterSettings {
    report_interval_s: f64,
    #[serde(flatten)]
    link: LinkSettings,
}

impl Default for ReporterSettings {
    fn default() -> Self {
        Self {
            report_interval_s: 300.0,
            link: LinkSettings::default(),
        }
    }
}

/// Latest readings as `{temperature×100: i16, pressure: i16}` big-endian
pub fn status_payload(state: &BoardState) -> [u8; 4] {
    let temperature = state.reading(TEMPERATURE_KEY).map_or(0.0, |r| r.as_f64());
    let pressure = state.reading(PRESSURE_KEY).map_or(0, |r| r.as_i64());
    let mut payload = [0u8; 4];
    BigEndian::write_i16(&mut payload[..2], (temperature * 100.0) as i16);
    BigEndian::write_i16(&mut payload[2..], pressure.clamp(i64::from(i16::MIN), i64::from(i16::MAX)) as i16);
    payload
}

/// Queues a GET_SENSOR_STATUS command for the base station
#[derive(Debug)]
pub struct ReporterModule {
    core: ModuleCore,
    node_id: NodeId,
    base_station_id: NodeId,
    link: String,
    state: SharedState,
}

/// Build a reporter; stopped on the base station itself
pub fn build(name: &str, config: &Value, ctx: &ModuleContext) -> Result<SharedModule> {
    let settings: ReporterSettings = settings(name, config)?;
    let mut module = ReporterModule {
        core: ctx.core(name),
        node_id: ctx.node_id,
        base_station_id: ctx.base_station_id,
        link: settings.link.key(),
        state: ctx.state.clone(),
    };
    if ctx.node_id == ctx.base_station_id {
        info!(module = %name, "base station does not report to itself");
        module.stop(DEFAULT_TIMER);
    } else {
        module.start(interval_from_secs(settings.report_interval_s), DEFAULT_TIMER);
    }
    Ok(Rc::new(RefCell::new(module)))
}

impl Module for ReporterModule {
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
        let mut state = self.state.borrow_mut();
        let payload = status_payload(&state);
        let packet = Packet::command(self.base_station_id, self.node_id, Command::GetSensorStatus, payload);
        debug!(dest = self.base_station_id, "sensor report queued");
        state.link_mut(&self.link).outbound.push_back(packet.to_bytes());
        Ok(())
    }
}
