//! Session module trait and utilities.
//!
//! A [`SessionModule`] is one concern riding on the shared session: the RPC
//! client, the attribute client, telemetry, or application logic that issues
//! requests from its tick. The trait is dyn-compatible, so a runtime can be
//! handed `&mut dyn SessionModule` without carrying the module's type.
//!
//! # Publishing Pattern
//!
//! Modules never perform async I/O directly. They queue publishes into a
//! [`PublishOutbox`] and the runtime sends them after the module returns.

use embassy_time::{Duration, Instant};

use crate::packet::{Publish, QoS};

/// Object-safe sink for outgoing publishes.
///
/// ```ignore
/// fn on_tick(&mut self, now: Instant, outbox: &mut dyn PublishOutbox) -> Duration {
///     outbox.publish("v1/devices/me/telemetry", br#"{"uptime":12}"#, QoS::AtMostOnce);
///     Duration::from_secs(30)
/// }
/// ```
pub trait PublishOutbox {
    /// Queues a message. Returns `false` if it was not accepted (outbox full,
    /// topic or payload too long); nothing is queued in that case.
    fn publish(&mut self, topic: &str, payload: &[u8], qos: QoS) -> bool;
}

/// Object-safe trait for collecting topic filters during registration.
pub trait TopicCollector {
    /// Adds a filter. The string is copied, so it only needs to live for the
    /// duration of the call.
    ///
    /// Returns `false` if the collector is full or the filter too long.
    fn add(&mut self, topic: &str) -> bool;
}

/// One concern driven by the session runtime.
///
/// Hooks run in this order over a connection's life: `register` once at
/// startup, `on_start` after every successful (re)connect, then per loop
/// iteration `on_message` for each inbound message, `on_expire`, and
/// `on_tick` when due. `on_stop` runs when the link is lost.
pub trait SessionModule {
    /// Adds the topic filters this module needs. Called once; the filters are
    /// re-subscribed after every reconnect.
    fn register(&self, collector: &mut dyn TopicCollector);

    /// Handles an inbound message. Every module sees every message and
    /// ignores topics that are not its own.
    ///
    /// The message borrows the session's receive buffer, so replies that need
    /// publishing are queued in `on_tick` (see `needs_immediate_publish`).
    fn on_message(&mut self, msg: &Publish<'_>);

    /// Expires outstanding requests whose deadline is at or before `now`.
    fn on_expire(&mut self, _now: Instant) {}

    /// Periodic work. Returns the delay until the next tick.
    fn on_tick(&mut self, _now: Instant, _outbox: &mut dyn PublishOutbox) -> Duration {
        Duration::from_secs(60)
    }

    /// Called after each successful connect, once subscriptions are in place.
    fn on_start(&mut self, _now: Instant, _outbox: &mut dyn PublishOutbox) {}

    /// Called when the link is lost. Outstanding requests are kept.
    fn on_stop(&mut self) {}

    /// If `true`, the runtime ticks the module without waiting for the
    /// interval to elapse.
    fn needs_immediate_publish(&self) -> bool {
        false
    }
}

/// A module that does nothing.
pub struct NoopModule;

impl SessionModule for NoopModule {
    fn register(&self, _collector: &mut dyn TopicCollector) {}

    fn on_message(&mut self, _msg: &Publish<'_>) {}
}

/// Two modules driven as one.
///
/// ```ignore
/// let module = ModulePair::new(rpc, ModulePair::new(attributes, telemetry));
/// ```
pub struct ModulePair<M1, M2> {
    pub first: M1,
    pub second: M2,
}

impl<M1, M2> ModulePair<M1, M2> {
    pub fn new(first: M1, second: M2) -> Self {
        Self { first, second }
    }
}

impl<M1, M2> SessionModule for ModulePair<M1, M2>
where
    M1: SessionModule,
    M2: SessionModule,
{
    fn register(&self, collector: &mut dyn TopicCollector) {
        self.first.register(collector);
        self.second.register(collector);
    }

    fn on_message(&mut self, msg: &Publish<'_>) {
        self.first.on_message(msg);
        self.second.on_message(msg);
    }

    fn on_expire(&mut self, now: Instant) {
        self.first.on_expire(now);
        self.second.on_expire(now);
    }

    fn on_tick(&mut self, now: Instant, outbox: &mut dyn PublishOutbox) -> Duration {
        let d1 = self.first.on_tick(now, outbox);
        let d2 = self.second.on_tick(now, outbox);
        d1.min(d2)
    }

    fn on_start(&mut self, now: Instant, outbox: &mut dyn PublishOutbox) {
        self.first.on_start(now, outbox);
        self.second.on_start(now, outbox);
    }

    fn on_stop(&mut self) {
        self.first.on_stop();
        self.second.on_stop();
    }

    fn needs_immediate_publish(&self) -> bool {
        self.first.needs_immediate_publish() || self.second.needs_immediate_publish()
    }
}

/// Lets `&mut dyn SessionModule` stand in for a module.
impl<M: SessionModule + ?Sized> SessionModule for &mut M {
    fn register(&self, collector: &mut dyn TopicCollector) {
        (**self).register(collector)
    }

    fn on_message(&mut self, msg: &Publish<'_>) {
        (**self).on_message(msg)
    }

    fn on_expire(&mut self, now: Instant) {
        (**self).on_expire(now)
    }

    fn on_tick(&mut self, now: Instant, outbox: &mut dyn PublishOutbox) -> Duration {
        (**self).on_tick(now, outbox)
    }

    fn on_start(&mut self, now: Instant, outbox: &mut dyn PublishOutbox) {
        (**self).on_start(now, outbox)
    }

    fn on_stop(&mut self) {
        (**self).on_stop()
    }

    fn needs_immediate_publish(&self) -> bool {
        (**self).needs_immediate_publish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{BufferedOutbox, TopicRegistry};

    #[derive(Default)]
    struct Recorder {
        filter: &'static str,
        interval: u64,
        messages: usize,
        expired_at: Option<Instant>,
        running: bool,
    }

    impl SessionModule for Recorder {
        fn register(&self, collector: &mut dyn TopicCollector) {
            collector.add(self.filter);
        }

        fn on_message(&mut self, _msg: &Publish<'_>) {
            self.messages += 1;
        }

        fn on_expire(&mut self, now: Instant) {
            self.expired_at = Some(now);
        }

        fn on_tick(&mut self, _now: Instant, outbox: &mut dyn PublishOutbox) -> Duration {
            outbox.publish(self.filter, b"tick", QoS::AtMostOnce);
            Duration::from_secs(self.interval)
        }

        fn on_start(&mut self, _now: Instant, _outbox: &mut dyn PublishOutbox) {
            self.running = true;
        }

        fn on_stop(&mut self) {
            self.running = false;
        }
    }

    fn pair() -> ModulePair<Recorder, Recorder> {
        ModulePair::new(
            Recorder {
                filter: "a",
                interval: 30,
                ..Default::default()
            },
            Recorder {
                filter: "b",
                interval: 5,
                ..Default::default()
            },
        )
    }

    #[test]
    fn pair_forwards_every_hook_to_both() {
        let mut modules = pair();
        let mut outbox: BufferedOutbox<4, 16, 16> = BufferedOutbox::new();
        let now = Instant::from_secs(3);

        let mut registry = TopicRegistry::<4>::new();
        modules.register(&mut registry);
        assert_eq!(registry.len(), 2);

        modules.on_start(now, &mut outbox);
        modules.on_message(&Publish::new("a", b""));
        modules.on_expire(now);
        assert_eq!(modules.on_tick(now, &mut outbox), Duration::from_secs(5));
        assert_eq!(outbox.len(), 2);

        for module in [&modules.first, &modules.second] {
            assert!(module.running);
            assert_eq!(module.messages, 1);
            assert_eq!(module.expired_at, Some(now));
        }

        modules.on_stop();
        assert!(!modules.first.running && !modules.second.running);
    }

    #[test]
    fn trait_object_reference_is_a_module() {
        fn deliver<M: SessionModule>(mut module: M) -> bool {
            module.on_message(&Publish::new("b", b""));
            module.needs_immediate_publish()
        }

        let mut modules = pair();
        let module: &mut dyn SessionModule = &mut modules;
        assert!(!deliver(module));
        assert_eq!(modules.second.messages, 1);
    }
}
