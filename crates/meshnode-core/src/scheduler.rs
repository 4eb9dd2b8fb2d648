//! Registry-driven module lifecycle
//!
//! The scheduler reads `MODULE_REGISTRY`, builds every entry in ascending
//! `order` (ties keep registry order), and ticks the polling modules once per
//! loop iteration in that same order.
//!
//! A construction failure is logged and the module is left out for this
//! session. If the failing entry is `critical`, the remaining entries of the
//! pass are not built at all.

use crate::error::Result;
use crate::module::{Constructor, ModuleContext, SharedModule};
use crate::modules::ModuleKind;
use crate::timer::DEFAULT_TIMER;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, error, info, warn};

fn default_true() -> bool {
    true
}

/// One `MODULE_REGISTRY` entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntry {
    /// Module kind to construct
    #[serde(alias = "class")]
    pub kind: ModuleKind,
    /// Init and tick priority, ascending
    pub order: i64,
    /// Tick immediately after construction
    #[serde(default = "default_true")]
    pub autostart: bool,
    /// A construction failure aborts the rest of the init pass
    #[serde(default)]
    pub critical: bool,
}

/// Registry-order mapping between module names and one-byte wire ids
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModuleIdMap {
    names: Vec<String>,
}

impl ModuleIdMap {
    /// Ids are positions in registry order; at most 256 modules get one
    pub fn from_registry(registry: &[(String, RegistryEntry)]) -> Self {
        Self {
            names: registry
                .iter()
                .take(usize::from(u8::MAX) + 1)
                .map(|(name, _)| name.clone())
                .collect(),
        }
    }

    /// Id of a module
    pub fn id(&self, name: &str) -> Option<u8> {
        self.names
            .iter()
            .position(|n| n == name)
            .and_then(|i| u8::try_from(i).ok())
    }

    /// Module with an id
    pub fn name(&self, id: u8) -> Option<&str> {
        self.names.get(usize::from(id)).map(String::as_str)
    }

    /// `(id, name)` pairs
    pub fn iter(&self) -> impl Iterator<Item = (u8, &str)> {
        self.names
            .iter()
            .enumerate()
            .map(|(i, n)| (i as u8, n.as_str()))
    }

    /// Number of ids
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// Outcome of an init pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InitReport {
    /// Constructed, in init order
    pub started: Vec<String>,
    /// Failed to construct
    pub failed: Vec<String>,
    /// Set when a critical failure stopped the pass
    pub aborted_at: Option<String>,
}

/// Builds, orders, ticks and rebuilds modules
#[derive(Debug)]
pub struct ModuleScheduler {
    ctx: ModuleContext,
    constructors: HashMap<ModuleKind, Constructor>,
}

impl ModuleScheduler {
    /// Scheduler using the stock constructor for every kind
    pub fn new(ctx: ModuleContext) -> Self {
        let constructors = ModuleKind::ALL
            .iter()
            .map(|kind| (*kind, kind.constructor()))
            .collect();
        Self { ctx, constructors }
    }

    /// Replace the constructor used for a kind
    pub fn register(&mut self, kind: ModuleKind, constructor: Constructor) {
        self.constructors.insert(kind, constructor);
    }

    /// Context handed to constructors
    pub fn context(&self) -> &ModuleContext {
        &self.ctx
    }

    /// Build every registry entry against the current configuration
    pub fn init(&mut self) -> InitReport {
        let mut report = InitReport::default();
        let mut registry = match self.ctx.config.registry() {
            Ok(registry) => registry,
            Err(e) => {
                error!("cannot read module registry: {}", e);
                return report;
            }
        };
        registry.sort_by_key(|(_, entry)| entry.order);

        for (name, entry) in registry {
            match self.build(&name, &entry) {
                Ok(module) => {
                    if !entry.autostart {
                        module.borrow_mut().stop(DEFAULT_TIMER);
                    }
                    debug!(module = %name, kind = ?entry.kind, order = entry.order, "module constructed");
                    self.ctx.directory.insert(&name, module);
                    report.started.push(name);
                }
                Err(e) => {
                    error!(module = %name, "construction failed: {}", e);
                    // Drop whatever the half-built module subscribed.
                    self.ctx.bus.release(&name);
                    report.failed.push(name.clone());
                    if entry.critical {
                        error!(module = %name, "critical module failed, aborting init");
                        report.aborted_at = Some(name);
                        break;
                    }
                }
            }
        }

        info!(
            started = report.started.len(),
            failed = report.failed.len(),
            "modules initialized"
        );
        report
    }

    fn build(&self, name: &str, entry: &RegistryEntry) -> Result<SharedModule> {
        let constructor = self.constructors.get(&entry.kind).copied().unwrap_or_else(|| entry.kind.constructor());
        let settings = self.ctx.config.module_config(name);
        constructor(name, &settings, &self.ctx)
    }

    /// Tick every module with autostart and polling set, in init order
    pub fn update(&mut self) {
        for (name, module) in self.ctx.directory.snapshot() {
            let Ok(mut module) = module.try_borrow_mut() else {
                warn!(module = %name, "module busy, tick skipped");
                continue;
            };
            let core = module.core();
            if !(core.autostart() && core.polling()) {
                continue;
            }
            if let Err(e) = module.update() {
                warn!(module = %name, "update failed: {}", e);
            }
        }
    }

    /// Drop every module and its subscriptions, then init again
    pub fn reinit(&mut self) -> InitReport {
        let released = self.ctx.bus.release_owned();
        self.ctx.directory.clear();
        debug!(released, "modules torn down");
        let report = self.init();
        info!("modules reinitialized");
        report
    }

    /// Drop every module and its subscriptions
    pub fn shutdown(&mut self) {
        self.ctx.bus.release_owned();
        self.ctx.directory.clear();
    }

    /// Module by name
    pub fn get(&self, name: &str) -> Option<SharedModule> {
        self.ctx.directory.get(name)
    }

    /// Constructed module names in init order
    pub fn names(&self) -> Vec<String> {
        self.ctx.directory.names()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(kind: ModuleKind, order: i64) -> RegistryEntry {
        RegistryEntry {
            kind,
            order,
            autostart: true,
            critical: false,
        }
    }

    #[test]
    fn test_registry_entry_serde() {
        let parsed: RegistryEntry =
            serde_json::from_value(serde_json::json!({ "class": "MessageLora", "order": 45 })).unwrap();
        assert_eq!(parsed.kind, ModuleKind::MessageHandler);
        assert!(parsed.autostart);
        assert!(!parsed.critical);
    }

    #[test]
    fn test_module_id_map() {
        let registry = vec![
            ("clock".to_string(), entry(ModuleKind::Clock, 10)),
            ("lora_tx".to_string(), entry(ModuleKind::Transmitter, 40)),
            ("display".to_string(), entry(ModuleKind::Display, 15)),
        ];
        let ids = ModuleIdMap::from_registry(&registry);
        // Registry order, not priority order
        assert_eq!(ids.id("lora_tx"), Some(1));
        assert_eq!(ids.name(2), Some("display"));
        assert_eq!(ids.name(3), None);
        assert_eq!(ids.id("ghost"), None);
        assert_eq!(ids.iter().map(|(i, _)| i).collect::<Vec<_>>(), vec![0, 1, 2]);
    }
}
