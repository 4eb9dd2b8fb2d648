//! Synchronous topic-based event bus
//!
//! Modules never hold references to each other; they talk through topics.
//! [`EventBus::publish`] runs every subscriber of the event's topic, in the
//! order they subscribed, before it returns. A subscriber that fails is logged
//! and skipped; the remaining subscribers still run and the publisher never
//! sees the failure.
//!
//! Subscriptions made by modules carry the module name as owner so the
//! scheduler can drop them all when it rebuilds the module set.

use crate::error::{NodeError, Result};
use crate::mesh::packet::Packet;
use serde_json::Value;
use std::borrow::Cow;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use tracing::{trace, warn};

/// Well-known topics
pub mod topics {
    /// A configuration key changed
    pub const CONFIG_UPDATED: &str = "config:updated";
    /// A frame was received and decoded
    pub const MESSAGE_RECEIVED: &str = "lora:message:received";
    /// A frame for another node needs forwarding
    pub const FORWARD_REQUEST: &str = "route:forward_request";

    /// Topic raised when an interrupt pin changes
    pub fn irq(device: &str) -> String {
        format!("irq:{device}:triggered")
    }

    /// Topic raised when a module has a fresh value
    pub fn ready(module: &str) -> String {
        format!("{module}:ready")
    }
}

/// Event payloads carried on the bus
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// `config:updated`
    ConfigUpdated {
        /// Dotted configuration path
        key: String,
        /// New value
        value: Value,
    },
    /// `lora:message:received`
    MessageReceived {
        /// Decoded frame
        packet: Packet,
        /// Receive signal strength reported by the radio
        rssi: u8,
    },
    /// `route:forward_request`
    ForwardRequest {
        /// Frame exactly as received
        raw: Vec<u8>,
    },
    /// `irq:<device>:triggered`
    Irq {
        /// Device key of the interrupt pin
        device: String,
        /// Logical state (pull-up inverted)
        state: u8,
        /// Raw pin level
        pin_value: u8,
    },
    /// `<module>:ready`
    Ready {
        /// Module that produced the value
        module: String,
        /// Normalized value (volts for analog inputs)
        value: f32,
    },
}

impl Event {
    /// Topic this event is delivered on
    pub fn topic(&self) -> Cow<'static, str> {
        match self {
            Event::ConfigUpdated { .. } => Cow::Borrowed(topics::CONFIG_UPDATED),
            Event::MessageReceived { .. } => Cow::Borrowed(topics::MESSAGE_RECEIVED),
            Event::ForwardRequest { .. } => Cow::Borrowed(topics::FORWARD_REQUEST),
            Event::Irq { device, .. } => Cow::Owned(topics::irq(device)),
            Event::Ready { module, .. } => Cow::Owned(topics::ready(module)),
        }
    }
}

/// Subscriber callback
pub type Handler = Rc<dyn Fn(&Event) -> Result<()>>;

struct Subscription {
    owner: Option<String>,
    handler: Handler,
}

/// Topic-keyed publish/subscribe
#[derive(Default)]
pub struct EventBus {
    subscribers: RefCell<HashMap<String, Vec<Subscription>>>,
}

/// Bus handle passed to modules
pub type SharedBus = Rc<EventBus>;

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let subscribers = self.subscribers.borrow();
        let mut topics: Vec<_> = subscribers.iter().map(|(t, s)| (t.clone(), s.len())).collect();
        topics.sort();
        f.debug_struct("EventBus").field("topics", &topics).finish()
    }
}

impl EventBus {
    /// Create an empty bus
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe for the lifetime of the bus
    pub fn subscribe<F>(&self, topic: impl Into<String>, handler: F)
    where
        F: Fn(&Event) -> Result<()> + 'static,
    {
        self.insert(None, topic.into(), Rc::new(handler));
    }

    /// Subscribe on behalf of a module; dropped by [`EventBus::release`]
    pub fn subscribe_owned<F>(&self, owner: &str, topic: impl Into<String>, handler: F)
    where
        F: Fn(&Event) -> Result<()> + 'static,
    {
        self.insert(Some(owner.to_string()), topic.into(), Rc::new(handler));
    }

    fn insert(&self, owner: Option<String>, topic: String, handler: Handler) {
        trace!(%topic, owner = owner.as_deref().unwrap_or("-"), "subscribe");
        self.subscribers
            .borrow_mut()
            .entry(topic)
            .or_default()
            .push(Subscription { owner, handler });
    }

    /// Drop every subscription made by `owner`
    pub fn release(&self, owner: &str) -> usize {
        self.retain(|s| s.owner.as_deref() != Some(owner))
    }

    /// Drop every owned subscription, keeping the owner-less ones
    pub fn release_owned(&self) -> usize {
        self.retain(|s| s.owner.is_none())
    }

    fn retain(&self, keep: impl Fn(&Subscription) -> bool) -> usize {
        let mut subscribers = self.subscribers.borrow_mut();
        let mut removed = 0;
        for subs in subscribers.values_mut() {
            let before = subs.len();
            subs.retain(&keep);
            removed += before - subs.len();
        }
        subscribers.retain(|_, subs| !subs.is_empty());
        removed
    }

    /// Number of subscribers on a topic
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.subscribers.borrow().get(topic).map_or(0, Vec::len)
    }

    /// Deliver an event to every subscriber of its topic.
    ///
    /// Returns how many subscribers completed without error.
    pub fn publish(&self, event: &Event) -> usize {
        let topic = event.topic();
        // Snapshot so subscribers may publish or subscribe re-entrantly.
        let handlers: Vec<Handler> = match self.subscribers.borrow().get(topic.as_ref()) {
            Some(subs) => subs.iter().map(|s| s.handler.clone()).collect(),
            None => return 0,
        };

        let mut delivered = 0;
        for handler in handlers {
            match handler(event) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    let err = NodeError::Subscriber {
                        topic: topic.to_string(),
                        reason: e.to_string(),
                    };
                    warn!("{}", err);
                }
            }
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    fn ready(value: f32) -> Event {
        Event::Ready {
            module: "adc".into(),
            value,
        }
    }

    #[test]
    fn test_topics() {
        assert_eq!(ready(0.0).topic(), "adc:ready");
        let irq = Event::Irq {
            device: "wake_up_button".into(),
            state: 1,
            pin_value: 0,
        };
        assert_eq!(irq.topic(), "irq:wake_up_button:triggered");
        assert_eq!(Event::ForwardRequest { raw: vec![] }.topic(), topics::FORWARD_REQUEST);
    }

    #[test]
    fn test_delivery_order() {
        let bus = EventBus::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        for id in 0..3 {
            let log = log.clone();
            bus.subscribe("adc:ready", move |event| {
                if let Event::Ready { value, .. } = event {
                    log.borrow_mut().push((id, *value));
                }
                Ok(())
            });
        }

        assert_eq!(bus.publish(&ready(1.5)), 3);
        assert_eq!(*log.borrow(), vec![(0, 1.5), (1, 1.5), (2, 1.5)]);
    }

    #[test]
    fn test_failing_subscriber_is_isolated() {
        let bus = EventBus::new();
        let hits = Rc::new(RefCell::new(0));

        bus.subscribe("adc:ready", |_| Err(NodeError::Config("boom".into())));
        let h = hits.clone();
        bus.subscribe("adc:ready", move |_| {
            *h.borrow_mut() += 1;
            Ok(())
        });

        assert_eq!(bus.publish(&ready(0.1)), 1);
        assert_eq!(*hits.borrow(), 1);
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new();
        assert_eq!(bus.publish(&ready(0.0)), 0);
    }

    #[test]
    fn test_release_owned() {
        let bus = EventBus::new();
        bus.subscribe(topics::CONFIG_UPDATED, |_| Ok(()));
        bus.subscribe_owned("routing", topics::MESSAGE_RECEIVED, |_| Ok(()));
        bus.subscribe_owned("routing", topics::FORWARD_REQUEST, |_| Ok(()));
        bus.subscribe_owned("pressure_1", "adc:ready", |_| Ok(()));

        assert_eq!(bus.release("routing"), 2);
        assert_eq!(bus.subscriber_count(topics::FORWARD_REQUEST), 0);
        assert_eq!(bus.subscriber_count("adc:ready"), 1);

        assert_eq!(bus.release_owned(), 1);
        assert_eq!(bus.subscriber_count(topics::CONFIG_UPDATED), 1);
    }

    #[test]
    fn test_reentrant_publish() {
        let bus = Rc::new(EventBus::new());
        let seen = Rc::new(RefCell::new(Vec::new()));

        let inner = bus.clone();
        bus.subscribe("adc:ready", move |_| {
            inner.publish(&Event::ForwardRequest { raw: vec![1, 2, 3] });
            Ok(())
        });
        let s = seen.clone();
        bus.subscribe(topics::FORWARD_REQUEST, move |event| {
            s.borrow_mut().push(event.clone());
            Ok(())
        });

        bus.publish(&ready(2.0));
        assert_eq!(seen.borrow().len(), 1, "nested publish completes before outer returns");
    }
}
