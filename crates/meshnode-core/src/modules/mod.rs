//! Stock module kinds
//!
//! | Kind             | Polls | Does                                             |
//! |------------------|-------|--------------------------------------------------|
//! | `Clock`          | yes   | corrects the wall clock from the RTC chip        |
//! | `Display`        | yes   | date and pressure on a character LCD             |
//! | `Temperature`    | yes   | RTC die temperature into `temperature`           |
//! | `AnalogInput`    | yes   | median-filtered volts, published on `<name>:ready` |
//! | `Pressure`       | no    | volts to psi into `pressure`                     |
//! | `Routing`        | yes   | HELLO / ROUTE_AD, forwarding, pruning            |
//! | `MessageHandler` | yes   | ingress decode and command dispatch              |
//! | `Transmitter`    | yes   | drains the egress queue to the radio             |
//! | `Reporter`       | yes   | periodic sensor report to the base station       |

pub mod analog;
pub mod clock;
pub mod display;
pub mod filter;
pub mod pressure;
pub mod reporter;
pub mod routing;
pub mod temperature;
pub mod transmitter;

use crate::module::Constructor;
use crate::state::link_key;
use serde::{Deserialize, Serialize};

/// Module kinds a registry entry can name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModuleKind {
    /// Wall clock drift correction
    Clock,
    /// Character display
    Display,
    /// Temperature sampling
    Temperature,
    /// Filtered analog input
    AnalogInput,
    /// Pressure transducer scaling
    Pressure,
    /// Mesh routing
    Routing,
    /// Command dispatcher
    #[serde(alias = "MessageLora")]
    MessageHandler,
    /// Radio egress
    #[serde(alias = "LoraTX")]
    Transmitter,
    /// Sensor reports
    #[serde(alias = "DataReporter")]
    Reporter,
}

impl ModuleKind {
    /// Every kind
    pub const ALL: [ModuleKind; 9] = [
        ModuleKind::Clock,
        ModuleKind::Display,
        ModuleKind::Temperature,
        ModuleKind::AnalogInput,
        ModuleKind::Pressure,
        ModuleKind::Routing,
        ModuleKind::MessageHandler,
        ModuleKind::Transmitter,
        ModuleKind::Reporter,
    ];

    /// Stock constructor
    pub fn constructor(&self) -> Constructor {
        match self {
            ModuleKind::Clock => clock::build,
            ModuleKind::Display => display::build,
            ModuleKind::Temperature => temperature::build,
            ModuleKind::AnalogInput => analog::build,
            ModuleKind::Pressure => pressure::build,
            ModuleKind::Routing => routing::build,
            ModuleKind::MessageHandler => crate::mesh::dispatcher::build,
            ModuleKind::Transmitter => transmitter::build,
            ModuleKind::Reporter => reporter::build,
        }
    }
}

fn default_bus_type() -> String {
    "uart".to_string()
}

fn default_bus_id() -> String {
    "1".to_string()
}

/// Radio link a networking module works on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkSettings {
    /// Bus type of the radio
    #[serde(default = "default_bus_type")]
    pub bus_type: String,
    /// Bus number of the radio
    #[serde(default = "default_bus_id")]
    pub bus_id: String,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            bus_type: default_bus_type(),
            bus_id: default_bus_id(),
        }
    }
}

impl LinkSettings {
    /// Queue key in the board state
    pub fn key(&self) -> String {
        link_key(&self.bus_type, &self.bus_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_kind_aliases() {
        for (name, kind) in [
            ("MessageLora", ModuleKind::MessageHandler),
            ("LoraTX", ModuleKind::Transmitter),
            ("DataReporter", ModuleKind::Reporter),
            ("AnalogInput", ModuleKind::AnalogInput),
        ] {
            let parsed: ModuleKind = serde_json::from_value(json!(name)).unwrap();
            assert_eq!(parsed, kind);
        }
        assert!(serde_json::from_value::<ModuleKind>(json!("Toaster")).is_err());
    }

    #[test]
    fn test_link_settings_defaults() {
        let link: LinkSettings = serde_json::from_value(json!({})).unwrap();
        assert_eq!(link.key(), "uart_1");
        let link: LinkSettings = serde_json::from_value(json!({ "bus_type": "uart", "bus_id": "2" })).unwrap();
        assert_eq!(link.key(), "uart_2");
    }
}

#[cfg(test)]
pub(crate) mod fixture {
    use crate::config::{default_document, ConfigStore};
    use crate::event::EventBus;
    use crate::hal::{Board, HardwareConfig, SharedBoard};
    use crate::module::ModuleContext;
    use crate::sim::SimBoard;
    use crate::state::Inbound;
    use crate::timer::ManualClock;
    use serde_json::Value;
    use std::cell::RefCell;
    use std::rc::Rc;

    /// Stock link of the default document
    pub const LINK: &str = "uart_1";

    /// A module context over a simulated board with a manual clock
    pub struct Fixture {
        pub clock: Rc<ManualClock>,
        pub sim: Rc<RefCell<SimBoard>>,
        pub ctx: ModuleContext,
    }

    impl Fixture {
        pub fn new() -> Self {
            Self::with_document(default_document())
        }

        pub fn with_document(document: Value) -> Self {
            let clock = Rc::new(ManualClock::default());
            let bus = Rc::new(EventBus::new());
            let config = Rc::new(ConfigStore::new(document).with_bus(bus.clone()));
            let sim = Rc::new(RefCell::new(SimBoard::new(clock.clone())));
            let board: SharedBoard = sim.clone();
            let ctx = ModuleContext::new(config, bus, board, clock.clone()).unwrap();
            let hardware = HardwareConfig::from_value(&ctx.config.hardware()).unwrap();
            sim.borrow_mut()
                .init(&hardware, &mut ctx.state.borrow_mut())
                .unwrap();
            Self { clock, sim, ctx }
        }

        pub fn push_inbound(&self, data: Vec<u8>, rssi: u8) {
            self.ctx
                .state
                .borrow_mut()
                .link_mut(LINK)
                .inbound
                .push_back(Inbound { data, rssi });
        }

        pub fn push_outbound(&self, frame: Vec<u8>) {
            self.ctx.state.borrow_mut().link_mut(LINK).outbound.push_back(frame);
        }

        pub fn outbound(&self) -> Vec<Vec<u8>> {
            self.ctx
                .state
                .borrow()
                .link(LINK)
                .map(|l| l.outbound.iter().cloned().collect())
                .unwrap_or_default()
        }
    }
}
