//! The session driver.
//!
//! [`MqttRuntime`] owns the session and the module tree and walks them
//! through the connection life cycle:
//!
//! ```text
//! Disconnected ──▶ Connecting ──(connect + subscribe ok)──▶ Connected
//!       ▲              │  ▲                                    │
//!       │              └──┘ connect failed, retry after backoff │
//!       └────────────────────── link lost ──────────────────────┘
//! ```
//!
//! Each [`step`](MqttRuntime::step) does one bounded amount of work, so
//! outstanding requests keep expiring on time even while the broker is
//! unreachable.

use embassy_futures::yield_now;
use embassy_time::{Duration, Instant, Timer};

use super::publisher::{BufferedOutbox, MAX_PAYLOAD_LEN, OUTBOX_DEPTH, PublishSource};
use super::registry::{MAX_TOPIC_LEN, TopicRegistry};
use super::traits::{PublishOutbox, SessionModule};
use crate::error::ConfigError;
use crate::session::PubSubSession;

/// Where the driver is in the connection life cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Driver timing.
#[derive(Debug, Clone, Copy)]
pub struct DriverConfig {
    /// Wait between failed connect attempts.
    pub reconnect_delay: Duration,
    /// Floor on the interval a module's `on_tick` may ask for.
    pub min_tick_interval: Duration,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_secs(5),
            min_tick_interval: Duration::from_millis(10),
        }
    }
}

impl DriverConfig {
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn with_min_tick_interval(mut self, interval: Duration) -> Self {
        self.min_tick_interval = interval;
        self
    }
}

type Outbox = BufferedOutbox<OUTBOX_DEPTH, MAX_TOPIC_LEN, MAX_PAYLOAD_LEN>;

/// Drives one [`PubSubSession`] and a tree of [`SessionModule`]s.
///
/// `MAX_TOPICS` bounds the number of filters the modules may register.
pub struct MqttRuntime<'a, S, M, const MAX_TOPICS: usize> {
    session: S,
    module: M,
    config: DriverConfig,
    topics: TopicRegistry<MAX_TOPICS>,
    outbox: Outbox,
    source: Option<&'a dyn PublishSource>,
    state: SessionState,
    retry_at: Instant,
    next_tick: Instant,
}

impl<'a, S, M, const MAX_TOPICS: usize> MqttRuntime<'a, S, M, MAX_TOPICS>
where
    S: PubSubSession,
    M: SessionModule,
{
    /// Collects the modules' topic filters. Nothing touches the network until
    /// the first [`step`](Self::step).
    ///
    /// Fails if a filter does not fit `MAX_TOPICS` or [`MAX_TOPIC_LEN`]: a
    /// module left unsubscribed would never see its replies.
    pub fn new(session: S, module: M, config: DriverConfig) -> Result<Self, ConfigError> {
        let mut topics = TopicRegistry::new();
        module.register(&mut topics);
        if let Some(e) = topics.rejected() {
            return Err(e);
        }
        debug!("runtime created with {} topic filters", topics.len());
        Ok(Self {
            session,
            module,
            config,
            topics,
            outbox: Outbox::new(),
            source: None,
            state: SessionState::Disconnected,
            retry_at: Instant::from_ticks(0),
            next_tick: Instant::from_ticks(0),
        })
    }

    /// Also forwards publishes other tasks queue into `source`.
    pub fn with_publish_source(mut self, source: &'a dyn PublishSource) -> Self {
        self.source = Some(source);
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    pub fn topics(&self) -> &TopicRegistry<MAX_TOPICS> {
        &self.topics
    }

    pub fn session(&self) -> &S {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut S {
        &mut self.session
    }

    pub fn module(&self) -> &M {
        &self.module
    }

    pub fn module_mut(&mut self) -> &mut M {
        &mut self.module
    }

    /// Runs `f` with the module and the runtime's outbox, for issuing requests
    /// from outside a hook. Queued publishes go out on the next step.
    pub fn with_module<R>(&mut self, f: impl FnOnce(&mut M, &mut dyn PublishOutbox) -> R) -> R {
        f(&mut self.module, &mut self.outbox)
    }

    /// Advances the state machine by one iteration at time `now`.
    pub async fn step(&mut self, now: Instant) -> SessionState {
        match self.state {
            SessionState::Disconnected => {
                info!("connecting to broker");
                self.state = SessionState::Connecting;
                self.retry_at = now;
            }
            SessionState::Connecting => {
                if now >= self.retry_at {
                    self.try_connect(now).await;
                }
            }
            SessionState::Connected => self.serve(now).await,
        }
        // Expiry runs in every state: a request must time out even if the
        // link never comes back.
        self.module.on_expire(now);
        self.state
    }

    /// Steps forever, sleeping through connect backoff.
    pub async fn run(&mut self) -> ! {
        loop {
            let state = self.step(Instant::now()).await;
            if state == SessionState::Connecting && Instant::now() < self.retry_at {
                Timer::at(self.retry_at).await;
            } else {
                yield_now().await;
            }
        }
    }

    async fn try_connect(&mut self, now: Instant) {
        if self.session.connect().await.is_err() {
            warn!("connect failed, retrying in {} ms", self.config.reconnect_delay.as_millis());
            self.retry_at = now + self.config.reconnect_delay;
            return;
        }
        let mut subscribed = true;
        for filter in self.topics.iter() {
            if self.session.subscribe(filter).await.is_err() {
                warn!("subscribe to {} failed", filter);
                subscribed = false;
                break;
            }
            debug!("subscribed to {}", filter);
        }
        if !subscribed {
            self.drop_link().await;
            return;
        }

        info!("session up");
        self.state = SessionState::Connected;
        self.module.on_start(now, &mut self.outbox);
        self.next_tick = now;
        self.flush().await;
    }

    async fn serve(&mut self, now: Instant) {
        if !self.session.is_connected() {
            self.drop_link().await;
            return;
        }

        let failed = match self.session.poll().await {
            Ok(Some(msg)) if self.topics.matches(msg.topic) => {
                trace!("message on {}", msg.topic);
                self.module.on_message(&msg);
                false
            }
            Ok(Some(msg)) => {
                debug!("ignoring message on unsubscribed topic {}", msg.topic);
                false
            }
            Ok(None) => false,
            Err(_) => true,
        };
        if failed {
            if !self.session.is_connected() {
                warn!("link lost while polling");
                self.drop_link().await;
                return;
            }
            debug!("poll failed, link still up");
        }

        if now >= self.next_tick || self.module.needs_immediate_publish() {
            let interval = self.module.on_tick(now, &mut self.outbox);
            self.next_tick = now + interval.max(self.config.min_tick_interval);
        }
        self.flush().await;
    }

    /// Sends everything queued in the outbox, then whatever other tasks
    /// queued in the publish source.
    async fn flush(&mut self) {
        for request in self.outbox.drain() {
            if self
                .session
                .publish(&request.topic, &request.payload, request.qos)
                .await
                .is_err()
            {
                warn!("publish to {} failed", request.topic.as_str());
                if !self.session.is_connected() {
                    self.drop_link().await;
                    return;
                }
            }
        }

        let Some(source) = self.source else {
            return;
        };
        for _ in 0..OUTBOX_DEPTH {
            let Some(request) = source.try_next() else {
                break;
            };
            if self
                .session
                .publish(&request.topic, &request.payload, request.qos)
                .await
                .is_err()
            {
                warn!("publish to {} failed", request.topic.as_str());
                if !self.session.is_connected() {
                    self.drop_link().await;
                    return;
                }
            }
        }
    }

    /// Tears the session down. Outstanding requests stay in their tables.
    async fn drop_link(&mut self) {
        info!("session down");
        self.module.on_stop();
        self.outbox.clear();
        self.session.disconnect().await;
        self.state = SessionState::Disconnected;
    }
}
