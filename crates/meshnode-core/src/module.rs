//! Module contract
//!
//! Every unit of node behavior (sensor readers, the display, routing, the
//! command handler, the transmitter) is a [`Module`]. The scheduler ticks
//! polling modules in priority order; event-driven modules only react to bus
//! subscriptions. All modules share the same capability set through an
//! embedded [`ModuleCore`]: named timers, the `autostart` flag and the
//! `polling` flag.
//!
//! ```text
//!   registry entry ──► Constructor(name, settings, ctx) ──► SharedModule
//!                                                            │
//!             scheduler tick (autostart && polling) ◄────────┤
//!             bus subscriptions (Weak handle)       ◄────────┘
//! ```

use crate::config::SharedConfig;
use crate::error::{NodeError, Result};
use crate::event::SharedBus;
use crate::hal::SharedBoard;
use crate::mesh::packet::NodeId;
use crate::mesh::params::{ParamValue, ParameterMap};
use crate::mesh::routing::RoutingEngine;
use crate::scheduler::ModuleIdMap;
use crate::state::{BoardState, SharedState};
use crate::timer::{SharedClock, TimerSet, DEFAULT_TIMER};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use tracing::debug;

/// Module handle held by the scheduler and the directory
pub type SharedModule = Rc<RefCell<dyn Module>>;

/// Builds a module from its registry name, settings record and context
pub type Constructor = fn(&str, &Value, &ModuleContext) -> Result<SharedModule>;

/// Actions a module can be asked to perform directly, bypassing configuration
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DirectAction {
    /// Switch the display backlight
    SetBacklight(bool),
}

impl DirectAction {
    /// Resolve a `direct.<module>.<method>` method name with its argument
    pub fn resolve(method: &str, value: &ParamValue) -> Option<Self> {
        match method {
            "set_backlight" => Some(DirectAction::SetBacklight(value.is_truthy())),
            _ => None,
        }
    }

    /// Method name on the wire
    pub fn name(&self) -> &'static str {
        match self {
            DirectAction::SetBacklight(_) => "set_backlight",
        }
    }
}

/// State shared by every module kind
#[derive(Debug)]
pub struct ModuleCore {
    name: String,
    timers: TimerSet,
    autostart: bool,
    polling: bool,
}

impl ModuleCore {
    /// Core with the default timer, autostart and polling enabled
    pub fn new(name: &str, clock: SharedClock) -> Self {
        Self {
            name: name.to_string(),
            timers: TimerSet::new(clock),
            autostart: true,
            polling: true,
        }
    }

    /// Registry name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Named timers
    pub fn timers(&self) -> &TimerSet {
        &self.timers
    }

    /// Named timers, mutable
    pub fn timers_mut(&mut self) -> &mut TimerSet {
        &mut self.timers
    }

    /// Check a timer; unknown names are never due
    pub fn check(&mut self, timer: &str) -> bool {
        self.timers.check(timer)
    }

    /// Whether the scheduler ticks this module
    pub fn autostart(&self) -> bool {
        self.autostart
    }

    /// Set the autostart flag
    pub fn set_autostart(&mut self, value: bool) {
        self.autostart = value;
    }

    /// `false` for modules driven only by events
    pub fn polling(&self) -> bool {
        self.polling
    }

    /// Mark the module event-driven (or polling again)
    pub fn set_polling(&mut self, value: bool) {
        self.polling = value;
    }

    fn with_timer(&mut self, timer: &str, f: impl FnOnce(&mut crate::timer::Timer)) {
        match self.timers.get_mut(timer) {
            Some(t) => f(t),
            None => debug!(module = %self.name, timer, "no such timer"),
        }
    }
}

/// Behavior every module kind provides
pub trait Module: fmt::Debug {
    /// Shared state
    fn core(&self) -> &ModuleCore;

    /// Shared state, mutable
    fn core_mut(&mut self) -> &mut ModuleCore;

    /// One scheduler tick; must not block
    fn update(&mut self) -> Result<()> {
        Ok(())
    }

    /// Registry name
    fn name(&self) -> &str {
        self.core().name()
    }

    /// Enable autostart and (re)start a timer with a new interval
    fn start(&mut self, interval_ms: i64, timer: &str) {
        let core = self.core_mut();
        core.autostart = true;
        core.with_timer(timer, |t| t.start(interval_ms));
    }

    /// Disable autostart and pause a timer
    fn stop(&mut self, timer: &str) {
        let core = self.core_mut();
        core.autostart = false;
        core.with_timer(timer, |t| t.pause());
    }

    /// Pause a timer
    fn pause(&mut self, timer: &str) {
        self.core_mut().with_timer(timer, |t| t.pause());
    }

    /// Resume a timer, compensating for the pause
    fn resume(&mut self, timer: &str) {
        self.core_mut().with_timer(timer, |t| t.resume());
    }

    /// Restart a timer from now
    fn reset(&mut self, timer: &str) {
        self.core_mut().with_timer(timer, |t| t.reset());
    }

    /// Perform a direct action
    fn perform(&mut self, action: DirectAction) -> Result<()> {
        Err(NodeError::UnsupportedAction {
            module: self.name().to_string(),
            action: action.name().to_string(),
        })
    }

    /// Current state-machine state, for modules that have one
    fn state(&self) -> Option<&'static str> {
        None
    }

    /// Routing tables, for the module that owns them
    fn routing(&self) -> Option<&RoutingEngine> {
        None
    }
}

/// Stop a module the way MODULE_CTRL action 0 does
pub fn halt(module: &mut dyn Module) {
    module.stop(DEFAULT_TIMER);
}

/// Resume a module the way MODULE_CTRL action 1 does
pub fn revive(module: &mut dyn Module) {
    module.resume(DEFAULT_TIMER);
    module.core_mut().set_autostart(true);
}

/// Constructed modules by name, in init order
#[derive(Clone, Default)]
pub struct ModuleDirectory {
    modules: Rc<RefCell<Vec<(String, SharedModule)>>>,
}

impl fmt::Debug for ModuleDirectory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

impl ModuleDirectory {
    /// Create an empty directory
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a module, replacing one with the same name
    pub fn insert(&self, name: &str, module: SharedModule) {
        let mut modules = self.modules.borrow_mut();
        match modules.iter_mut().find(|(n, _)| n == name) {
            Some(slot) => slot.1 = module,
            None => modules.push((name.to_string(), module)),
        }
    }

    /// Module by name
    pub fn get(&self, name: &str) -> Option<SharedModule> {
        self.modules
            .borrow()
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, m)| m.clone())
    }

    /// Names in init order
    pub fn names(&self) -> Vec<String> {
        self.modules.borrow().iter().map(|(n, _)| n.clone()).collect()
    }

    /// Handles in init order
    pub fn snapshot(&self) -> Vec<(String, SharedModule)> {
        self.modules.borrow().clone()
    }

    /// Drop every module
    pub fn clear(&self) {
        self.modules.borrow_mut().clear();
    }

    /// Number of modules
    pub fn len(&self) -> usize {
        self.modules.borrow().len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.modules.borrow().is_empty()
    }
}

/// Everything a module may use, handed to its constructor
#[derive(Debug, Clone)]
pub struct ModuleContext {
    /// Local node address
    pub node_id: NodeId,
    /// Address that collects sensor reports
    pub base_station_id: NodeId,
    /// Event bus
    pub bus: SharedBus,
    /// Readings, link queues, wall clock
    pub state: SharedState,
    /// Configuration store
    pub config: SharedConfig,
    /// Hardware
    pub board: SharedBoard,
    /// Monotonic clock for timers
    pub clock: SharedClock,
    /// Constructed modules
    pub directory: ModuleDirectory,
    /// Registry-order module ids, fixed when the context is built
    pub module_ids: Rc<ModuleIdMap>,
    /// Remote parameter table
    pub params: Rc<ParameterMap>,
}

impl ModuleContext {
    /// Context for a node whose identity and registry come from `config`.
    ///
    /// The board state starts empty with the wall clock at zero; board
    /// bring-up seeds it.
    pub fn new(config: SharedConfig, bus: SharedBus, board: SharedBoard, clock: SharedClock) -> Result<Self> {
        let node_id = config.node_id()?;
        let base_station_id = config.base_station_id()?;
        let module_ids = ModuleIdMap::from_registry(&config.registry()?);
        let state = Rc::new(RefCell::new(BoardState::new(clock.clone(), 0)));
        Ok(Self {
            node_id,
            base_station_id,
            bus,
            state,
            config,
            board,
            clock,
            directory: ModuleDirectory::new(),
            module_ids: Rc::new(module_ids),
            params: Rc::new(ParameterMap::default()),
        })
    }

    /// Fresh core for a module of this node
    pub fn core(&self, name: &str) -> ModuleCore {
        ModuleCore::new(name, self.clock.clone())
    }
}

/// Deserialize a module's settings record
pub fn settings<T: DeserializeOwned>(name: &str, config: &Value) -> Result<T> {
    serde_json::from_value(config.clone())
        .map_err(|e| NodeError::module_init(name, format!("bad settings: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timer::{interval_from_secs, ManualClock};

    #[derive(Debug)]
    struct Stub {
        core: ModuleCore,
        ticks: u32,
    }

    impl Module for Stub {
        fn core(&self) -> &ModuleCore {
            &self.core
        }

        fn core_mut(&mut self) -> &mut ModuleCore {
            &mut self.core
        }

        fn update(&mut self) -> Result<()> {
            if self.core.check(DEFAULT_TIMER) {
                self.ticks += 1;
            }
            Ok(())
        }
    }

    fn stub(clock: &Rc<ManualClock>) -> Stub {
        let mut stub = Stub {
            core: ModuleCore::new("stub", clock.clone()),
            ticks: 0,
        };
        stub.start(interval_from_secs(1.0), DEFAULT_TIMER);
        stub
    }

    #[test]
    fn test_stop_and_revive() {
        let clock = Rc::new(ManualClock::default());
        let mut module = stub(&clock);
        assert!(module.core().autostart());

        halt(&mut module);
        assert!(!module.core().autostart());
        clock.advance(5_000);
        module.update().unwrap();
        assert_eq!(module.ticks, 0, "paused timer never fires");

        revive(&mut module);
        assert!(module.core().autostart());
        clock.advance(999);
        module.update().unwrap();
        assert_eq!(module.ticks, 0);
        clock.advance(1);
        module.update().unwrap();
        assert_eq!(module.ticks, 1);
    }

    #[test]
    fn test_unknown_timer_is_ignored() {
        let clock = Rc::new(ManualClock::default());
        let mut module = stub(&clock);
        module.pause("nope");
        module.reset("nope");
        assert!(!module.core_mut().check("nope"));
    }

    #[test]
    fn test_default_perform_is_unsupported() {
        let clock = Rc::new(ManualClock::default());
        let mut module = stub(&clock);
        let err = module.perform(DirectAction::SetBacklight(true)).unwrap_err();
        assert!(matches!(err, NodeError::UnsupportedAction { .. }));
    }

    #[test]
    fn test_direct_action_resolve() {
        assert_eq!(
            DirectAction::resolve("set_backlight", &ParamValue::Uint32(1)),
            Some(DirectAction::SetBacklight(true))
        );
        assert_eq!(
            DirectAction::resolve("set_backlight", &ParamValue::Bool(false)),
            Some(DirectAction::SetBacklight(false))
        );
        assert_eq!(DirectAction::resolve("self_destruct", &ParamValue::Bool(true)), None);
    }

    #[test]
    fn test_directory() {
        let clock = Rc::new(ManualClock::default());
        let directory = ModuleDirectory::new();
        let a: SharedModule = Rc::new(RefCell::new(stub(&clock)));
        let b: SharedModule = Rc::new(RefCell::new(stub(&clock)));

        directory.insert("b", b);
        directory.insert("a", a.clone());
        directory.insert("a", a);
        assert_eq!(directory.names(), vec!["b", "a"]);
        assert!(directory.get("a").is_some());
        assert!(directory.get("c").is_none());
        assert_eq!(format!("{directory:?}"), r#"["b", "a"]"#);

        directory.clear();
        assert!(directory.is_empty());
    }
}
