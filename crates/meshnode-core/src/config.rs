//! Layered node configuration
//!
//! A single JSON document holds everything a node needs: hardware layout,
//! per-module settings, the module registry and node identity. The built-in
//! defaults are overlaid with persisted overrides from a storage file whose
//! keys are dotted paths:
//!
//! ```json
//! {
//!   "MODULE_CONFIGURATION.data_reporter.report_interval_s": 120,
//!   "HARDWARE_CONFIGURATION.uart.1.baudrate": 19200
//! }
//! ```
//!
//! Every [`ConfigStore::set`] publishes `config:updated` so the runtime can
//! decide what to rebuild.

use crate::error::{NodeError, Result};
use crate::event::{Event, SharedBus};
use crate::mesh::packet::NodeId;
use crate::scheduler::RegistryEntry;
use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};
use std::cell::RefCell;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use tracing::{debug, info, warn};

/// Hardware layout and devices
pub const HARDWARE_CONFIGURATION: &str = "HARDWARE_CONFIGURATION";
/// Per-module settings
pub const MODULE_CONFIGURATION: &str = "MODULE_CONFIGURATION";
/// Which modules exist and how they start
pub const MODULE_REGISTRY: &str = "MODULE_REGISTRY";
/// Persisted override file
pub const STORAGE_PATH: &str = "STORAGE_PATH";
/// Log level used when the CLI gets no `-v`
pub const DEFAULT_LOG_LEVEL: &str = "DEFAULT_LOG_LEVEL";
/// Human-readable node name
pub const SYSTEM_NAME: &str = "SYSTEM_NAME";
/// Node address on the mesh
pub const SYSTEM_ID: &str = "SYSTEM_ID";
/// Address that collects sensor reports
pub const BASE_STATION_ID: &str = "BASE_STATION_ID";

/// Configuration handle shared by the runtime and modules
pub type SharedConfig = Rc<ConfigStore>;

/// Layered configuration store
#[derive(Debug)]
pub struct ConfigStore {
    document: RefCell<Value>,
    storage_path: Option<PathBuf>,
    persistent_keys: RefCell<BTreeSet<String>>,
    bus: Option<SharedBus>,
}

impl ConfigStore {
    /// In-memory store; persistent writes are only tracked, never written
    pub fn new(document: Value) -> Self {
        Self {
            document: RefCell::new(document),
            storage_path: None,
            persistent_keys: RefCell::new(BTreeSet::new()),
            bus: None,
        }
    }

    /// Start from `defaults` and overlay the dotted keys stored at `storage_path`.
    ///
    /// A missing or unreadable file leaves the defaults in place.
    pub fn load(defaults: Value, storage_path: impl Into<PathBuf>) -> Self {
        let storage_path = storage_path.into();
        let mut store = Self::new(defaults);

        match read_storage(&storage_path) {
            Ok(overrides) => {
                let count = overrides.len();
                {
                    let mut document = store.document.borrow_mut();
                    let mut keys = store.persistent_keys.borrow_mut();
                    for (path, value) in overrides {
                        set_nested(&mut document, &path, value);
                        keys.insert(path);
                    }
                }
                info!(count, path = %storage_path.display(), "loaded persistent configuration");
            }
            Err(e) => {
                info!(path = %storage_path.display(), "no persistent configuration ({}), using defaults", e);
            }
        }

        store.storage_path = Some(storage_path);
        store
    }

    /// Publish `config:updated` on this bus from now on
    pub fn with_bus(mut self, bus: SharedBus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// File persistent keys are written to
    pub fn storage_path(&self) -> Option<&Path> {
        self.storage_path.as_deref()
    }

    /// Keys that came from, or were written to, storage
    pub fn persistent_keys(&self) -> Vec<String> {
        self.persistent_keys.borrow().iter().cloned().collect()
    }

    /// Value at a dotted path
    pub fn get(&self, path: &str) -> Option<Value> {
        get_nested(&self.document.borrow(), path).cloned()
    }

    /// Value at a dotted path, deserialized
    pub fn get_as<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        match self.get(path) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|e| NodeError::Config(format!("{path}: {e}"))),
        }
    }

    /// Snapshot of the whole document
    pub fn document(&self) -> Value {
        self.document.borrow().clone()
    }

    /// Set a value, optionally persisting it, then publish `config:updated`.
    ///
    /// The in-memory value and the event happen even when the storage
    /// write fails; the write error is returned afterwards.
    pub fn set(&self, path: &str, value: Value, persistent: bool) -> Result<()> {
        debug!(%path, %value, persistent, "config set");
        set_nested(&mut self.document.borrow_mut(), path, value.clone());

        let mut outcome = Ok(());
        if persistent {
            self.persistent_keys.borrow_mut().insert(path.to_string());
            if let Some(storage) = &self.storage_path {
                outcome = write_storage(storage, path, &value);
                if let Err(e) = &outcome {
                    warn!(path = %storage.display(), "failed to persist '{}': {}", path, e);
                }
            }
        }

        if let Some(bus) = &self.bus {
            bus.publish(&Event::ConfigUpdated {
                key: path.to_string(),
                value,
            });
        }
        outcome
    }

    /// Local node address
    pub fn node_id(&self) -> Result<NodeId> {
        self.get_as(SYSTEM_ID)?
            .ok_or_else(|| NodeError::Config(format!("{SYSTEM_ID} missing")))
    }

    /// Base station address
    pub fn base_station_id(&self) -> Result<NodeId> {
        Ok(self.get_as(BASE_STATION_ID)?.unwrap_or(0))
    }

    /// Node name
    pub fn system_name(&self) -> String {
        self.get_as(SYSTEM_NAME).ok().flatten().unwrap_or_default()
    }

    /// Registry entries in document order
    pub fn registry(&self) -> Result<Vec<(String, RegistryEntry)>> {
        let registry = match self.get(MODULE_REGISTRY) {
            Some(Value::Object(map)) => map,
            Some(_) => return Err(NodeError::Config(format!("{MODULE_REGISTRY} is not an object"))),
            None => return Ok(Vec::new()),
        };
        registry
            .into_iter()
            .map(|(name, entry)| {
                serde_json::from_value(entry)
                    .map(|entry| (name.clone(), entry))
                    .map_err(|e| NodeError::Config(format!("{MODULE_REGISTRY}.{name}: {e}")))
            })
            .collect()
    }

    /// Settings record for one module (empty object when absent)
    pub fn module_config(&self, name: &str) -> Value {
        match self.get(&format!("{MODULE_CONFIGURATION}.{name}")) {
            Some(value @ Value::Object(_)) => value,
            _ => Value::Object(Map::new()),
        }
    }

    /// Hardware section (empty object when absent)
    pub fn hardware(&self) -> Value {
        match self.get(HARDWARE_CONFIGURATION) {
            Some(value @ Value::Object(_)) => value,
            _ => Value::Object(Map::new()),
        }
    }
}

fn get_nested<'a>(document: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(document, |node, key| node.as_object()?.get(key))
}

fn set_nested(document: &mut Value, path: &str, value: Value) {
    let mut node = document;
    let mut keys = path.split('.').peekable();
    while let Some(key) = keys.next() {
        if !node.is_object() {
            *node = Value::Object(Map::new());
        }
        let Value::Object(map) = node else {
            return;
        };
        if keys.peek().is_none() {
            map.insert(key.to_string(), value);
            return;
        }
        node = map
            .entry(key.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
}

fn read_storage(path: &Path) -> Result<Map<String, Value>> {
    let text = fs::read_to_string(path)?;
    match serde_json::from_str(&text)? {
        Value::Object(map) => Ok(map),
        _ => Err(NodeError::Config("storage root is not an object".into())),
    }
}

fn write_storage(path: &Path, key: &str, value: &Value) -> Result<()> {
    // Re-read so keys written by other stores are kept.
    let mut stored = read_storage(path).unwrap_or_default();
    stored.insert(key.to_string(), value.clone());
    let text = serde_json::to_string_pretty(&Value::Object(stored))?;
    fs::write(path, text)?;
    Ok(())
}

/// Stock node configuration
pub fn default_document() -> Value {
    json!({
        HARDWARE_CONFIGURATION: {
            "i2c": {
                "1": { "sda": 21, "scl": 22, "freq": 400000 }
            },
            "uart": {
                "1": { "tx": 17, "rx": 16, "baudrate": 9600 }
            },
            "devices": {
                "rtc": { "driver": "DS3231", "bus_type": "i2c", "bus_id": "1", "address": 0x68 },
                "display": { "driver": "LCD_I2C", "bus_type": "i2c", "bus_id": "1", "address": 0x27, "rows": 2, "cols": 16 },
                "wake_up_button": { "driver": "IRQ_Pin", "pin": 32, "mode": "IN", "pull": "PULL_UP" },
                "primary_adc": { "driver": "ADC_Pin", "pin": 34, "attenuation": "ATTN_11DB" },
                "lora_module": { "driver": "LoRa_E220", "model": "900T30D", "bus_type": "uart", "bus_id": "1" }
            }
        },
        MODULE_CONFIGURATION: {
            "clock": { "device_key": "rtc", "drift_check_interval_s": 60, "max_drift_s": 10 },
            "display": {
                "device_key": "display", "refresh_interval_s": 0.1, "boot_duration_s": 5,
                "backlight_timeout_s": 60, "rows": 2, "cols": 16, "subs": "wake_up_button"
            },
            "temperature": { "device_key": "rtc", "read_interval_s": 5 },
            "analog_adc_1": {
                "device_key": "primary_adc", "read_interval_s": 0.05,
                "median_filter_size": 11, "adc_max_value": 4095.0
            },
            "pressure_1": {
                "V_TO_MPA_SLOPE": 12.5, "V_TO_MPA_INTERCEPT": -1.25,
                "PSI_PER_MPA": 145.038, "subs": "analog_adc_1"
            },
            "routing": { "hello_interval_s": 30, "route_update_interval_s": 600, "bus_type": "uart", "bus_id": "1" },
            "message": { "read_interval_s": 0.1, "bus_type": "uart", "bus_id": "1" },
            "data_reporter": { "report_interval_s": 30, "bus_type": "uart", "bus_id": "1" },
            "lora_tx": { "device_key": "lora_module", "check_interval_s": 0.1, "bus_type": "uart", "bus_id": "1" }
        },
        MODULE_REGISTRY: {
            "clock": { "kind": "Clock", "order": 10, "autostart": true, "critical": true },
            "display": { "kind": "Display", "order": 15, "autostart": true, "critical": false },
            "temperature": { "kind": "Temperature", "order": 20, "autostart": true, "critical": false },
            "analog_adc_1": { "kind": "AnalogInput", "order": 25, "autostart": true, "critical": false },
            "pressure_1": { "kind": "Pressure", "order": 30, "autostart": true, "critical": false },
            "routing": { "kind": "Routing", "order": 35, "autostart": true, "critical": true },
            "message": { "kind": "MessageHandler", "order": 45, "autostart": true, "critical": true },
            "data_reporter": { "kind": "Reporter", "order": 50, "autostart": true, "critical": false },
            "lora_tx": { "kind": "Transmitter", "order": 40, "autostart": true, "critical": false }
        },
        STORAGE_PATH: "storage.json",
        DEFAULT_LOG_LEVEL: "INFO",
        SYSTEM_NAME: "Nodo01",
        SYSTEM_ID: 1,
        BASE_STATION_ID: 0
    })
}
