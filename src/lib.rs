//! # Request/Response over MQTT for Embedded Systems
//!
//! `myrtio-rpc` layers request/response correlation on top of a `no_std`
//! MQTT 3.1.1 client built on the [Embassy](https://embassy.dev/) async
//! ecosystem. A device can call server-side RPC methods and query shared
//! attributes, and get exactly one outcome per request: the reply callback or
//! the timeout callback.
//!
//! ## Core Features
//!
//! - **`no_std` & `no_alloc`:** Requests, topics and payloads live in
//!   fixed-capacity `heapless` storage; the number of outstanding requests is a
//!   const generic.
//! - **Fully Async:** One cooperative loop pumps the session and expires
//!   requests; callbacks run inside it, never concurrently.
//! - **Survives reconnects:** Outstanding requests are kept across a lost
//!   link, and a reply that arrives after the reconnect is still delivered.
//! - **Transport Agnostic:** [`MqttTransport`](transport::MqttTransport) for
//!   the byte stream, [`PubSubSession`](session::PubSubSession) for the
//!   pub/sub session.
//!
//! ## Architecture
//!
//! ```ignore
//! type OnReply = fn(Value<'_>);
//! type OnTimeout = fn();
//!
//! let rpc = RpcClient::<OnReply, OnTimeout, 5>::new(RpcTopics::default());
//! let attributes = AttributeClient::<fn(AttributeReply<'_>), OnTimeout, 2>::new(AttributeTopics::default());
//! let module = ModulePair::new(rpc, ModulePair::new(attributes, TelemetryPublisher::default()));
//!
//! let client = MqttClient::<_, 512>::new(transport, MqttOptions::new("dev-1", "192.168.1.10", 1883)
//!     .with_access_token(TOKEN));
//! let mut runtime = MqttRuntime::<_, _, 4>::new(client, module, DriverConfig::default())?;
//! runtime.run().await;
//! ```
//!
//! Requests are issued from a module's `on_tick` or through
//! [`MqttRuntime::with_module`](runtime::MqttRuntime::with_module); both hand
//! out the outbox the request is queued into.

#![cfg_attr(not(test), no_std)]

mod fmt;

pub mod client;
pub mod error;
pub mod input;
pub mod packet;
pub mod payload;
pub mod rpc;
pub mod runtime;
pub mod session;
pub mod transport;
pub mod util;

// Re-export key types for easier access at the crate root.
pub use client::{MqttClient, MqttEvent, MqttOptions};
pub use error::{ConfigError, MqttError, PayloadError, RequestError};
pub use packet::{Publish, QoS};
pub use payload::{Document, Value};
pub use rpc::{
    AttributeClient, AttributeReply, AttributeTopics, RequestId, RequestTable, RpcClient, RpcTopics,
    TelemetryHandle, TelemetryPublisher, TelemetryTopics,
};
pub use runtime::{DriverConfig, MqttRuntime, SessionState};
pub use session::PubSubSession;
pub use transport::TcpTransport;
