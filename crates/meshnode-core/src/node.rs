//! Node runtime
//!
//! One cooperative loop per node:
//!
//! ```text
//! board.update ─▶ IRQ edges ─▶ scheduler.update ─▶ deferred reinit ─▶ sleep 10 ms
//! ```
//!
//! Configuration changes usually arrive from inside a module tick (a
//! SET_PARAM handled by the dispatcher), so the rebuild they call for is
//! only recorded by the `config:updated` subscriber and carried out once the
//! tick pass is over.

use crate::config::{ConfigStore, SharedConfig, HARDWARE_CONFIGURATION, MODULE_CONFIGURATION, MODULE_REGISTRY};
use crate::error::Result;
use crate::event::{topics, Event, EventBus, SharedBus};
use crate::hal::{HardwareConfig, SharedBoard};
use crate::mesh::packet::NodeId;
use crate::mesh::routing::Route;
use crate::module::{ModuleContext, SharedModule};
use crate::scheduler::{InitReport, ModuleScheduler};
use crate::state::SharedState;
use crate::timer::SharedClock;
use std::cell::Cell;
use std::rc::Rc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Delay between loop iterations
pub const LOOP_DELAY: Duration = Duration::from_millis(10);

/// What a configuration change asked to rebuild
#[derive(Debug, Default)]
struct PendingReinit {
    board: Cell<bool>,
    modules: Cell<bool>,
}

impl PendingReinit {
    fn note(&self, key: &str) {
        let section = key.split('.').next().unwrap_or_default();
        match section {
            HARDWARE_CONFIGURATION => {
                self.board.set(true);
                self.modules.set(true);
            }
            MODULE_CONFIGURATION | MODULE_REGISTRY => self.modules.set(true),
            _ => {}
        }
    }
}

/// A sensor node: board, bus, configuration and modules
#[derive(Debug)]
pub struct Node {
    scheduler: ModuleScheduler,
    pending: Rc<PendingReinit>,
    last_init: InitReport,
}

impl Node {
    /// Bring up the board and every registered module.
    ///
    /// The store is wired to a fresh bus so that writes publish
    /// `config:updated`.
    pub fn new(config: ConfigStore, board: SharedBoard, clock: SharedClock) -> Result<Self> {
        let bus: SharedBus = Rc::new(EventBus::new());
        let config: SharedConfig = Rc::new(config.with_bus(bus.clone()));
        let ctx = ModuleContext::new(config, bus, board, clock)?;
        Self::with_context(ctx)
    }

    /// Bring up a node from a prepared context
    pub fn with_context(ctx: ModuleContext) -> Result<Self> {
        let hardware = HardwareConfig::from_value(&ctx.config.hardware())?;
        ctx.board.borrow_mut().init(&hardware, &mut ctx.state.borrow_mut())?;

        let pending = Rc::new(PendingReinit::default());
        let flags = pending.clone();
        ctx.bus.subscribe(topics::CONFIG_UPDATED, move |event| {
            if let Event::ConfigUpdated { key, .. } = event {
                flags.note(key);
            }
            Ok(())
        });

        let mut scheduler = ModuleScheduler::new(ctx);
        let last_init = scheduler.init();
        info!(
            node = scheduler.context().node_id,
            name = %scheduler.context().config.system_name(),
            modules = last_init.started.len(),
            "node up"
        );
        Ok(Self {
            scheduler,
            pending,
            last_init,
        })
    }

    /// One loop iteration without the delay
    pub fn step(&mut self) -> Result<()> {
        let ctx = self.scheduler.context().clone();

        let irqs = {
            let mut board = ctx.board.borrow_mut();
            board.update(&mut ctx.state.borrow_mut())?;
            board.take_irqs()
        };
        for irq in irqs {
            debug!(device = %irq.device, state = irq.state, pin = irq.pin_value, "irq");
            ctx.state.borrow_mut().set_reading(&irq.device, i64::from(irq.state));
            ctx.bus.publish(&Event::Irq {
                device: irq.device,
                state: irq.state,
                pin_value: irq.pin_value,
            });
        }

        self.scheduler.update();
        self.apply_pending()
    }

    fn apply_pending(&mut self) -> Result<()> {
        let board = self.pending.board.replace(false);
        let modules = self.pending.modules.replace(false);
        if board {
            let ctx = self.scheduler.context();
            let hardware = HardwareConfig::from_value(&ctx.config.hardware())?;
            ctx.board.borrow_mut().reinit(&hardware, &mut ctx.state.borrow_mut())?;
            info!("board reinitialized");
        }
        if modules {
            self.last_init = self.scheduler.reinit();
        }
        Ok(())
    }

    /// Step until `should_stop` returns true; a step error ends the loop
    pub fn run(&mut self, should_stop: impl Fn() -> bool) -> Result<()> {
        while !should_stop() {
            if let Err(e) = self.step() {
                warn!("node loop stopped: {}", e);
                return Err(e);
            }
            thread::sleep(LOOP_DELAY);
        }
        info!(node = self.id(), "node stopped");
        Ok(())
    }

    /// Local node address
    pub fn id(&self) -> NodeId {
        self.scheduler.context().node_id
    }

    /// Context shared with the modules
    pub fn context(&self) -> &ModuleContext {
        self.scheduler.context()
    }

    /// Module scheduler
    pub fn scheduler(&self) -> &ModuleScheduler {
        &self.scheduler
    }

    /// Module scheduler, mutable
    pub fn scheduler_mut(&mut self) -> &mut ModuleScheduler {
        &mut self.scheduler
    }

    /// Outcome of the most recent module init pass
    pub fn last_init(&self) -> &InitReport {
        &self.last_init
    }

    /// Event bus
    pub fn bus(&self) -> &SharedBus {
        &self.context().bus
    }

    /// Configuration store
    pub fn config(&self) -> &SharedConfig {
        &self.context().config
    }

    /// Board state
    pub fn state(&self) -> &SharedState {
        &self.context().state
    }

    /// Board
    pub fn board(&self) -> &SharedBoard {
        &self.context().board
    }

    /// Constructed module by name
    pub fn module(&self, name: &str) -> Option<SharedModule> {
        self.scheduler.get(name)
    }

    /// Routing table of the first module that keeps one, ordered by destination
    pub fn routes(&self) -> Option<Vec<(NodeId, Route)>> {
        self.context().directory.snapshot().into_iter().find_map(|(_, module)| {
            let module = module.try_borrow().ok()?;
            module.routing().map(|engine| engine.routes().sorted())
        })
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        // Modules hold the directory and the bus holds module handlers.
        self.scheduler.shutdown();
    }
}
