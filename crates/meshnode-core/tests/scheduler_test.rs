//! Integration tests for registry-driven module construction and ticking.
//!
//! Stub modules stand in for the stock kinds so that construction order,
//! tick order and failure handling can be observed through the event bus.

use meshnode_core::config::{default_document, MODULE_CONFIGURATION, MODULE_REGISTRY};
use meshnode_core::module::settings;
use meshnode_core::timer::DEFAULT_TIMER;
use meshnode_core::{
    topics, ConfigStore, Event, EventBus, ManualClock, Module, ModuleContext, ModuleCore,
    ModuleKind, ModuleScheduler, NodeError, Result, SharedBus, SharedModule, SimBoard,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::cell::RefCell;
use std::rc::Rc;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct StubSettings {
    fail: bool,
}

#[derive(Debug)]
struct Stub {
    core: ModuleCore,
    bus: SharedBus,
}

impl Module for Stub {
    fn core(&self) -> &ModuleCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ModuleCore {
        &mut self.core
    }

    fn update(&mut self) -> Result<()> {
        self.bus.publish(&Event::Ready {
            module: self.core.name().to_string(),
            value: 0.0,
        });
        Ok(())
    }
}

fn stub(name: &str, config: &Value, ctx: &ModuleContext) -> Result<SharedModule> {
    let settings: StubSettings = settings(name, config)?;
    if settings.fail {
        return Err(NodeError::module_init(name, "stub told to fail"));
    }
    // Leaves a subscription behind so failed construction can be checked for leaks.
    ctx.bus.subscribe_owned(name, topics::CONFIG_UPDATED, |_| Ok(()));
    Ok(Rc::new(RefCell::new(Stub {
        core: ctx.core(name),
        bus: ctx.bus.clone(),
    })))
}

fn failing_stub(name: &str, _config: &Value, ctx: &ModuleContext) -> Result<SharedModule> {
    ctx.bus.subscribe_owned(name, topics::CONFIG_UPDATED, |_| Ok(()));
    Err(NodeError::module_init(name, "device missing"))
}

/// Scheduler over `registry`, with every entry built by the stub constructor
fn scheduler(registry: Value, modules: Value) -> (ModuleScheduler, Rc<RefCell<Vec<String>>>) {
    let mut document = default_document();
    document[MODULE_REGISTRY] = registry;
    document[MODULE_CONFIGURATION] = modules;

    let clock = Rc::new(ManualClock::default());
    let bus: SharedBus = Rc::new(EventBus::new());
    let config = Rc::new(ConfigStore::new(document).with_bus(bus.clone()));
    let board = Rc::new(RefCell::new(SimBoard::new(clock.clone())));
    let ctx = ModuleContext::new(config, bus.clone(), board, clock).expect("context");

    let ticks = Rc::new(RefCell::new(Vec::new()));
    for name in ["a", "b", "c", "d"] {
        let ticks = ticks.clone();
        bus.subscribe(topics::ready(name), move |event| {
            if let Event::Ready { module, .. } = event {
                ticks.borrow_mut().push(module.clone());
            }
            Ok(())
        });
    }

    let mut scheduler = ModuleScheduler::new(ctx);
    scheduler.register(ModuleKind::Temperature, stub);
    scheduler.register(ModuleKind::Display, failing_stub);
    (scheduler, ticks)
}

fn entry(order: i64) -> Value {
    json!({ "kind": "Temperature", "order": order })
}

#[test]
fn test_init_and_tick_in_priority_order() {
    let (mut scheduler, ticks) = scheduler(
        json!({ "c": entry(30), "a": entry(10), "b": entry(20) }),
        json!({}),
    );
    let report = scheduler.init();
    assert_eq!(report.started, vec!["a", "b", "c"]);
    assert_eq!(scheduler.names(), vec!["a", "b", "c"]);

    scheduler.update();
    scheduler.update();
    assert_eq!(*ticks.borrow(), vec!["a", "b", "c", "a", "b", "c"]);
}

#[test]
fn test_equal_order_keeps_registry_order() {
    let (mut scheduler, _) = scheduler(
        json!({ "b": entry(10), "a": entry(10), "c": entry(5) }),
        json!({}),
    );
    scheduler.init();
    assert_eq!(scheduler.names(), vec!["c", "b", "a"]);
}

#[test]
fn test_module_ids_follow_registry_order() {
    let (mut scheduler, _) = scheduler(
        json!({ "c": entry(30), "a": entry(10), "b": entry(20) }),
        json!({}),
    );
    scheduler.init();
    let ids = &scheduler.context().module_ids;
    assert_eq!(ids.id("c"), Some(0));
    assert_eq!(ids.id("a"), Some(1));
    assert_eq!(ids.name(2), Some("b"));
}

#[test]
fn test_module_ids_survive_registry_edit() {
    let (mut scheduler, _) = scheduler(
        json!({ "c": entry(30), "a": entry(10), "b": entry(20) }),
        json!({}),
    );
    scheduler.init();
    let config = scheduler.context().config.clone();
    config
        .set(
            MODULE_REGISTRY,
            json!({ "d": entry(5), "b": entry(20), "a": entry(10) }),
            false,
        )
        .expect("registry replaced");

    let report = scheduler.reinit();
    assert_eq!(report.started, vec!["d", "a", "b"]);
    let ids = &scheduler.context().module_ids;
    assert_eq!(ids.id("c"), Some(0));
    assert_eq!(ids.id("a"), Some(1));
    assert_eq!(ids.id("b"), Some(2));
    assert_eq!(ids.id("d"), None);
}

#[test]
fn test_critical_failure_aborts_init() {
    let (mut scheduler, _) = scheduler(
        json!({
            "a": entry(10),
            "b": { "kind": "Display", "order": 20, "critical": true },
            "c": entry(30)
        }),
        json!({}),
    );
    let report = scheduler.init();
    assert_eq!(report.started, vec!["a"]);
    assert_eq!(report.failed, vec!["b"]);
    assert_eq!(report.aborted_at.as_deref(), Some("b"));
    assert!(scheduler.get("c").is_none());
    // Only the surviving stub's subscription remains
    assert_eq!(scheduler.context().bus.subscriber_count(topics::CONFIG_UPDATED), 1);
}

#[test]
fn test_non_critical_failure_continues() {
    let (mut scheduler, _) = scheduler(
        json!({ "a": entry(10), "b": entry(20), "c": entry(30) }),
        json!({ "b": { "fail": true } }),
    );
    let report = scheduler.init();
    assert_eq!(report.started, vec!["a", "c"]);
    assert_eq!(report.failed, vec!["b"]);
    assert!(report.aborted_at.is_none());
}

#[test]
fn test_autostart_false_is_constructed_but_idle() {
    let (mut scheduler, ticks) = scheduler(
        json!({
            "a": entry(10),
            "b": { "kind": "Temperature", "order": 20, "autostart": false }
        }),
        json!({}),
    );
    scheduler.init();
    let b = scheduler.get("b").expect("b constructed");
    assert!(!b.borrow().core().autostart());

    scheduler.update();
    assert_eq!(*ticks.borrow(), vec!["a"]);

    b.borrow_mut().start(1000, DEFAULT_TIMER);
    scheduler.update();
    assert_eq!(*ticks.borrow(), vec!["a", "a", "b"]);
}

#[test]
fn test_reinit_rebuilds_and_releases_subscriptions() {
    let (mut scheduler, _) = scheduler(json!({ "a": entry(10), "b": entry(20) }), json!({}));
    scheduler.init();
    let before = scheduler.get("a").expect("a");
    let bus = scheduler.context().bus.clone();
    assert_eq!(bus.subscriber_count(topics::CONFIG_UPDATED), 2);

    let report = scheduler.reinit();
    assert_eq!(report.started, vec!["a", "b"]);
    assert!(!Rc::ptr_eq(&before, &scheduler.get("a").expect("a")));
    assert_eq!(bus.subscriber_count(topics::CONFIG_UPDATED), 2);

    scheduler.shutdown();
    assert!(scheduler.names().is_empty());
    assert_eq!(bus.subscriber_count(topics::CONFIG_UPDATED), 0);
}
