//! Request/response correlation over publish/subscribe.
//!
//! MQTT has no notion of a reply. A request is published to
//! `<request prefix>/<id>` and the server answers on `<response prefix>/<id>`;
//! the clients in this module remember what each id was for, run the reply
//! callback when the answer shows up and the timeout callback when it does
//! not.
//!
//! All three clients are [`SessionModule`](crate::runtime::SessionModule)s
//! and are meant to be driven by [`MqttRuntime`](crate::runtime::MqttRuntime).

use embassy_time::Duration;

use crate::packet::Publish;
use crate::payload::{Document, Value};

pub mod attributes;
pub mod client;
pub mod table;
pub mod telemetry;
mod wire;

pub use attributes::{AttributeClient, AttributeKeys, AttributeReply, AttributeTopics};
pub use client::{RpcClient, RpcTopics};
pub use table::{PendingRequest, RequestId, RequestKind, RequestTable};
pub use telemetry::{TelemetryHandle, TelemetryPublisher, TelemetryTopics};

/// Most keys one attribute query may name.
pub const MAX_ATTRIBUTE_KEYS: usize = 8;

/// Longest attribute key, in bytes.
pub const MAX_KEY_LEN: usize = 32;

/// Timeout used by the `*_default` request helpers.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// The correlation part of an inbound reply.
pub(crate) struct ReplyEnvelope<'a> {
    pub id: RequestId,
    /// The whole reply document.
    pub body: Document<'a>,
}

impl<'a> ReplyEnvelope<'a> {
    /// Recognises a reply published under `response_prefix`.
    ///
    /// The id is the last topic level. Only when that level is not a number
    /// does the payload's `id` field count; a bare reply body may carry an
    /// unrelated `id` of its own.
    pub fn parse(msg: &Publish<'a>, response_prefix: &str) -> Option<Self> {
        let suffix = msg
            .topic
            .strip_prefix(response_prefix)
            .and_then(|rest| rest.strip_prefix('/'))?;
        let body = match Document::parse(msg.payload) {
            Ok(body) => body,
            Err(_e) => {
                warn!("unparseable reply on {}: {}", msg.topic, _e);
                return None;
            }
        };
        let id = suffix
            .parse()
            .ok()
            .or_else(|| wire::payload_id(msg.payload));
        match id {
            Some(id) => Some(Self { id, body }),
            None => {
                debug!("reply on {} carries no usable id", msg.topic);
                None
            }
        }
    }

    /// The `result` field, or the whole body when there is none.
    pub fn result(&self) -> Value<'a> {
        self.body
            .get("result")
            .unwrap_or(Value::Object(self.body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PREFIX: &str = "v1/devices/me/rpc/response";

    #[test]
    fn topic_id_wins_over_body_id() {
        let msg = Publish::new("v1/devices/me/rpc/response/9", br#"{"id":4,"result":true}"#);
        let envelope = ReplyEnvelope::parse(&msg, PREFIX).unwrap();
        assert_eq!(envelope.id, 9);
        assert_eq!(envelope.result(), Value::Bool(true));
    }

    #[test]
    fn non_numeric_body_id_is_application_data() {
        let msg = Publish::new("v1/devices/me/rpc/response/1", br#"{"id":"dev-A","fw":"1.0"}"#);
        let envelope = ReplyEnvelope::parse(&msg, PREFIX).unwrap();
        assert_eq!(envelope.id, 1);
        assert_eq!(
            envelope.result().as_object().and_then(|doc| doc.get("id")),
            Some(Value::Str("dev-A"))
        );
    }

    #[test]
    fn body_id_used_when_topic_has_none() {
        let msg = Publish::new("v1/devices/me/rpc/response/reply", br#"{"id":"5","result":0}"#);
        assert_eq!(ReplyEnvelope::parse(&msg, PREFIX).unwrap().id, 5);

        let msg = Publish::new("v1/devices/me/rpc/response/reply", br#"{"id":6}"#);
        assert_eq!(ReplyEnvelope::parse(&msg, PREFIX).unwrap().id, 6);
    }

    #[test]
    fn bare_body_is_the_result() {
        let msg = Publish::new("v1/devices/me/rpc/response/9", br#"{"time":1700000000}"#);
        let envelope = ReplyEnvelope::parse(&msg, PREFIX).unwrap();
        assert_eq!(envelope.id, 9);
        assert_eq!(
            envelope.result().as_object().and_then(|doc| doc.get("time")),
            Some(Value::Int(1_700_000_000))
        );
    }

    #[test]
    fn foreign_and_broken_messages_are_ignored() {
        let other = Publish::new("v1/devices/me/rpc/request/9", br#"{"id":9}"#);
        assert!(ReplyEnvelope::parse(&other, PREFIX).is_none());

        let lookalike = Publish::new("v1/devices/me/rpc/responses/9", br#"{"id":9}"#);
        assert!(ReplyEnvelope::parse(&lookalike, PREFIX).is_none());

        let garbage = Publish::new("v1/devices/me/rpc/response/9", b"{\"id\":");
        assert!(ReplyEnvelope::parse(&garbage, PREFIX).is_none());

        let negative = Publish::new("v1/devices/me/rpc/response/x", br#"{"id":-1}"#);
        assert!(ReplyEnvelope::parse(&negative, PREFIX).is_none());
    }
}
