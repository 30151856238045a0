//! Session runtime.
//!
//! The runtime owns one [`PubSubSession`](crate::session::PubSubSession) and a
//! tree of [`SessionModule`]s. It connects, subscribes every filter the
//! modules registered, dispatches inbound messages, expires requests, ticks
//! the modules and flushes what they queued.
//!
//! # Object-Safe Design
//!
//! `SessionModule` is dyn-compatible, so the runtime can be handed
//! `&mut dyn SessionModule` from a `StaticCell` without generic task
//! functions.
//!
//! # Publishing Pattern
//!
//! Modules never perform async I/O directly. They queue into a
//! [`PublishOutbox`]; the runtime publishes after the module returns.

pub(crate) mod event_loop;
pub(crate) mod publisher;
pub(crate) mod registry;
pub(crate) mod traits;

pub use event_loop::{DriverConfig, MqttRuntime, SessionState};
pub use publisher::{
    BufferedOutbox, MAX_PAYLOAD_LEN, OUTBOX_DEPTH, OwnedPublishRequest, PublishRequest,
    PublishRequestChannel, PublishRequestSender, PublishSource, PublisherHandle,
};
pub use registry::{MAX_TOPIC_LEN, TopicRegistry, topic_matches};
pub use traits::{ModulePair, NoopModule, PublishOutbox, SessionModule, TopicCollector};

pub use crate::packet::Publish;
