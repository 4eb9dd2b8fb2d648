//! Hardware collaborator boundary
//!
//! The core never touches pins or buses. A [`Board`] brings devices up from
//! the `HARDWARE_CONFIGURATION` section, refreshes named readings and radio
//! ingress into [`BoardState`], reports interrupt edges, and lends out the
//! few devices modules drive directly (RTC, display, radio).
//!
//! ## Device drivers
//!
//! | Driver      | Role                         | Reading            |
//! |-------------|------------------------------|--------------------|
//! | `DS3231`    | real-time clock + thermometer| -                  |
//! | `LCD_I2C`   | character display            | -                  |
//! | `IRQ_Pin`   | digital input with interrupt | logical level      |
//! | `GPIO_Pin`  | digital input or output      | logical level (IN) |
//! | `ADC_Pin`   | analog input                 | raw counts         |
//! | `LoRa_E220` | radio transceiver            | -                  |

use crate::error::{NodeError, Result};
use crate::state::{link_key, BoardState, Inbound};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::rc::Rc;
use tracing::warn;

/// Real-time clock chip
pub trait RtcDevice: Debug {
    /// Current time as epoch seconds
    fn datetime(&mut self) -> Result<i64>;

    /// Set the time
    fn set_datetime(&mut self, epoch: i64) -> Result<()>;

    /// Die temperature in °C
    fn temperature(&mut self) -> Result<f64>;
}

/// Character display
pub trait DisplayDevice: Debug {
    /// Blank every row and home the cursor
    fn clear(&mut self) -> Result<()>;

    /// Move the cursor
    fn move_to(&mut self, col: usize, row: usize) -> Result<()>;

    /// Write text at the cursor
    fn put_str(&mut self, text: &str) -> Result<()>;

    /// Turn the backlight on
    fn backlight_on(&mut self) -> Result<()>;

    /// Turn the backlight off
    fn backlight_off(&mut self) -> Result<()>;

    /// Backlight state
    fn backlight(&self) -> bool;
}

/// Radio transceiver in transparent mode
pub trait RadioDevice: Debug {
    /// Put a frame on air
    fn send(&mut self, frame: &[u8]) -> Result<()>;

    /// Next received frame, if any
    fn receive(&mut self) -> Option<Inbound>;
}

/// An interrupt edge waiting to be published
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IrqEvent {
    /// Device key of the pin
    pub device: String,
    /// Logical state (inverted for pull-up pins)
    pub state: u8,
    /// Raw pin level
    pub pin_value: u8,
}

/// Board bring-up and device access
pub trait Board: Debug {
    /// Bring up buses and devices; missing or failing devices are skipped
    fn init(&mut self, hardware: &HardwareConfig, state: &mut BoardState) -> Result<()>;

    /// Tear everything down and bring it up again
    fn reinit(&mut self, hardware: &HardwareConfig, state: &mut BoardState) -> Result<()> {
        state.clear_links();
        self.init(hardware, state)
    }

    /// Refresh input readings and move received frames into link queues
    fn update(&mut self, state: &mut BoardState) -> Result<()>;

    /// Interrupt edges since the last call
    fn take_irqs(&mut self) -> Vec<IrqEvent>;

    /// RTC device by key
    fn rtc(&mut self, key: &str) -> Option<&mut dyn RtcDevice>;

    /// Display device by key
    fn display(&mut self, key: &str) -> Option<&mut dyn DisplayDevice>;

    /// Radio device by key
    fn radio(&mut self, key: &str) -> Option<&mut dyn RadioDevice>;

    /// Key of the first RTC, if any
    fn default_rtc(&self) -> Option<String>;
}

/// Board handle shared by the runtime and modules
pub type SharedBoard = Rc<RefCell<dyn Board>>;

/// Driver identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Driver {
    /// DS3231 real-time clock
    #[serde(rename = "DS3231")]
    Ds3231,
    /// HD44780 over an I2C backpack
    #[serde(rename = "LCD_I2C")]
    LcdI2c,
    /// Digital input with interrupt
    #[serde(rename = "IRQ_Pin")]
    IrqPin,
    /// Plain digital pin
    #[serde(rename = "GPIO_Pin")]
    GpioPin,
    /// Analog input
    #[serde(rename = "ADC_Pin")]
    AdcPin,
    /// E220 LoRa transceiver
    #[serde(rename = "LoRa_E220")]
    LoraE220,
}

/// Pin direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PinMode {
    /// Input
    In,
    /// Output
    #[default]
    Out,
}

/// Pin bias
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Pull {
    /// Pulled high, active low
    PullUp,
    /// Pulled low, active high
    PullDown,
}

/// One entry of `HARDWARE_CONFIGURATION.devices`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Driver to bind
    pub driver: Driver,
    /// `i2c` or `uart`
    #[serde(default)]
    pub bus_type: Option<String>,
    /// Bus number as a string key
    #[serde(default)]
    pub bus_id: Option<String>,
    /// GPIO number
    #[serde(default)]
    pub pin: Option<u32>,
    /// Pin direction
    #[serde(default)]
    pub mode: PinMode,
    /// Pin bias
    #[serde(default)]
    pub pull: Option<Pull>,
    /// Display rows
    #[serde(default)]
    pub rows: Option<usize>,
    /// Display columns
    #[serde(default)]
    pub cols: Option<usize>,
}

impl DeviceConfig {
    /// Link queue key of the bus this device sits on
    pub fn link(&self) -> Option<String> {
        Some(link_key(self.bus_type.as_deref()?, self.bus_id.as_deref()?))
    }

    /// Logical state for a raw level
    pub fn logical_state(&self, pin_value: u8) -> u8 {
        match self.pull {
            Some(Pull::PullUp) => 1 - pin_value.min(1),
            _ => pin_value.min(1),
        }
    }
}

/// Typed view of `HARDWARE_CONFIGURATION`
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HardwareConfig {
    /// I2C buses by id
    pub i2c: BTreeMap<String, Value>,
    /// UART buses by id
    pub uart: BTreeMap<String, Value>,
    /// Devices by key
    pub devices: BTreeMap<String, DeviceConfig>,
}

#[derive(Deserialize)]
struct RawHardware {
    #[serde(default)]
    i2c: BTreeMap<String, Value>,
    #[serde(default)]
    uart: BTreeMap<String, Value>,
    #[serde(default)]
    devices: BTreeMap<String, Value>,
}

impl HardwareConfig {
    /// Parse the hardware section of the configuration document.
    ///
    /// A device with an unknown driver or a bad record is skipped.
    pub fn from_value(value: &Value) -> Result<Self> {
        let raw: RawHardware = serde_json::from_value(value.clone())
            .map_err(|e| NodeError::Config(format!("HARDWARE_CONFIGURATION: {e}")))?;

        let mut devices = BTreeMap::new();
        for (name, record) in raw.devices {
            match serde_json::from_value::<DeviceConfig>(record) {
                Ok(device) => {
                    devices.insert(name, device);
                }
                Err(e) => warn!(device = %name, "skipping device: {}", e),
            }
        }
        Ok(Self {
            i2c: raw.i2c,
            uart: raw.uart,
            devices,
        })
    }

    /// Link keys of every UART bus
    pub fn uart_links(&self) -> Vec<String> {
        self.uart.keys().map(|id| link_key("uart", id)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{default_document, HARDWARE_CONFIGURATION};

    #[test]
    fn test_parse_default_hardware() {
        let doc = default_document();
        let hw = HardwareConfig::from_value(&doc[HARDWARE_CONFIGURATION]).unwrap();

        assert_eq!(hw.uart_links(), vec!["uart_1".to_string()]);
        assert_eq!(hw.devices.len(), 5);

        let button = &hw.devices["wake_up_button"];
        assert_eq!(button.driver, Driver::IrqPin);
        assert_eq!(button.mode, PinMode::In);
        assert_eq!(button.pull, Some(Pull::PullUp));

        let lora = &hw.devices["lora_module"];
        assert_eq!(lora.driver, Driver::LoraE220);
        assert_eq!(lora.link().as_deref(), Some("uart_1"));
        assert_eq!(hw.devices["primary_adc"].link(), None);
    }

    #[test]
    fn test_logical_state() {
        let mut pin = DeviceConfig {
            driver: Driver::IrqPin,
            bus_type: None,
            bus_id: None,
            pin: Some(32),
            mode: PinMode::In,
            pull: Some(Pull::PullUp),
            rows: None,
            cols: None,
        };
        assert_eq!(pin.logical_state(0), 1);
        assert_eq!(pin.logical_state(1), 0);

        pin.pull = None;
        assert_eq!(pin.logical_state(1), 1);
    }

    #[test]
    fn test_unknown_driver_skipped() {
        let value = serde_json::json!({
            "devices": {
                "x": { "driver": "Flux" },
                "adc": { "driver": "ADC_Pin", "pin": 34 }
            }
        });
        let hw = HardwareConfig::from_value(&value).unwrap();
        assert_eq!(hw.devices.keys().collect::<Vec<_>>(), vec!["adc"]);
        assert!(hw.uart.is_empty());

        assert!(HardwareConfig::from_value(&serde_json::json!([1, 2])).is_err());
    }
}
