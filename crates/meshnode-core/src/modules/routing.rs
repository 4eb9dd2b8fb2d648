//! Routing module: drives a [`RoutingEngine`] from timers and bus events
//!
//! - `hello` timer: queue a HELLO at the front of the egress queue
//! - `route_update` timer: queue a ROUTE_AD at the front, then prune
//! - `lora:message:received`: learn neighbors and routes
//! - `route:forward_request`: relay with one less hop, at the back

use super::LinkSettings;
use crate::error::{NodeError, Result};
use crate::event::{topics, Event};
use crate::mesh::packet::Packet;
use crate::mesh::routing::RoutingEngine;
use crate::module::{settings, Module, ModuleContext, ModuleCore, SharedModule};
use crate::state::SharedState;
use crate::timer::{interval_from_secs, SharedClock};
use serde::Deserialize;
use serde_json::Value;
use std::cell::RefCell;
use std::rc::{Rc, Weak};
use tracing::debug;

/// Neighbor announcement timer
pub const HELLO_TIMER: &str = "hello";
/// Advertisement and pruning timer
pub const ROUTE_UPDATE_TIMER: &str = "route_update";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct RoutingSettings {
    hello_interval_s: f64,
    route_update_interval_s: f64,
    #[serde(flatten)]
    link: LinkSettings,
}

impl Default for RoutingSettings {
    fn default() -> Self {
        Self {
            hello_interval_s: 30.0,
            route_update_interval_s: 60.0,
            link: LinkSettings::default(),
        }
    }
}

/// Mesh routing on one link
#[derive(Debug)]
pub struct RoutingModule {
    core: ModuleCore,
    engine: RoutingEngine,
    link: String,
    state: SharedState,
    clock: SharedClock,
}

/// Build the routing module and subscribe it to received and relayed frames
pub fn build(name: &str, config: &Value, ctx: &ModuleContext) -> Result<SharedModule> {
    let settings: RoutingSettings = settings(name, config)?;
    let hello_ms = interval_from_secs(settings.hello_interval_s);
    let route_ms = interval_from_secs(settings.route_update_interval_s);

    let mut core = ctx.core(name);
    core.timers_mut().add(HELLO_TIMER);
    core.timers_mut().add(ROUTE_UPDATE_TIMER);
    let engine = RoutingEngine::new(
        ctx.node_id,
        u32::try_from(hello_ms.max(0)).unwrap_or(u32::MAX),
        ctx.clock.now_ms(),
    );

    let module = Rc::new(RefCell::new(RoutingModule {
        core,
        engine,
        link: settings.link.key(),
        state: ctx.state.clone(),
        clock: ctx.clock.clone(),
    }));

    let weak = Rc::downgrade(&module);
    let owner = name.to_string();
    ctx.bus.subscribe_owned(name, topics::MESSAGE_RECEIVED, move |event| {
        let Event::MessageReceived { packet, rssi } = event else {
            return Ok(());
        };
        with_module(&weak, &owner, |m| m.observe(packet, *rssi))
    });

    let weak = Rc::downgrade(&module);
    let owner = name.to_string();
    ctx.bus.subscribe_owned(name, topics::FORWARD_REQUEST, move |event| {
        let Event::ForwardRequest { raw } = event else {
            return Ok(());
        };
        with_module(&weak, &owner, |m| m.forward(raw))
    });

    {
        let mut m = module.borrow_mut();
        m.start(hello_ms, HELLO_TIMER);
        m.start(route_ms, ROUTE_UPDATE_TIMER);
    }
    Ok(module)
}

fn with_module(
    weak: &Weak<RefCell<RoutingModule>>,
    owner: &str,
    f: impl FnOnce(&mut RoutingModule),
) -> Result<()> {
    let module = weak
        .upgrade()
        .ok_or_else(|| NodeError::ModuleUnavailable(owner.to_string()))?;
    let mut module = module
        .try_borrow_mut()
        .map_err(|_| NodeError::ModuleUnavailable(owner.to_string()))?;
    f(&mut module);
    Ok(())
}

impl RoutingModule {
    fn observe(&mut self, packet: &Packet, rssi: u8) {
        let now = self.clock.now_ms();
        self.engine.observe(packet, rssi, now);
    }

    fn forward(&mut self, raw: &[u8]) {
        if let Some(next) = self.engine.forward(raw) {
            debug!(dest = next.dest, src = next.src, ttl = next.ttl, "forwarding");
            self.state
                .borrow_mut()
                .link_mut(&self.link)
                .outbound
                .push_back(next.to_bytes());
        }
    }

    fn queue_front(&self, packet: Packet) {
        self.state
            .borrow_mut()
            .link_mut(&self.link)
            .outbound
            .push_front(packet.to_bytes());
    }
}

impl Module for RoutingModule {
    fn core(&self) -> &ModuleCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ModuleCore {
        &mut self.core
    }

    fn update(&mut self) -> Result<()> {
        if self.core.check(HELLO_TIMER) {
            self.queue_front(self.engine.hello());
        }
        if self.core.check(ROUTE_UPDATE_TIMER) {
            if let Some(ad) = self.engine.advertisement() {
                self.queue_front(ad);
            }
            self.engine.prune(self.clock.now_ms());
        }
        Ok(())
    }

    fn routing(&self) -> Option<&RoutingEngine> {
        Some(&self.engine)
    }
}
