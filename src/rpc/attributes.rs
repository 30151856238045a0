//! Bulk attribute queries.
//!
//! One query names a set of attribute keys; the server answers once with the
//! values it knows. Keys the server does not know are simply absent from the
//! reply and are reported to the callback as missing.

use embassy_time::{Duration, Instant};
use heapless::{String, Vec};

use super::table::{RequestId, RequestKind, RequestTable};
use super::wire::{self, AttributeQuery};
use super::{DEFAULT_TIMEOUT, MAX_ATTRIBUTE_KEYS, MAX_KEY_LEN, ReplyEnvelope};
use crate::error::{PayloadError, RequestError};
use crate::packet::{Publish, QoS};
use crate::payload::{Document, Value};
use crate::runtime::{MAX_PAYLOAD_LEN, MAX_TOPIC_LEN, PublishOutbox, SessionModule, TopicCollector};
use crate::util::push_u32;

/// The de-duplicated keys of one attribute query.
pub type AttributeKeys = Vec<String<MAX_KEY_LEN>, MAX_ATTRIBUTE_KEYS>;

/// Topic prefixes for attribute queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttributeTopics {
    /// Requests go to `<request>/<id>`.
    pub request: &'static str,
    /// Replies arrive on `<response>/<id>`.
    pub response: &'static str,
    /// Filter subscribed for replies.
    pub response_filter: &'static str,
    /// Payload field carrying the comma-separated key list.
    pub keys_field: &'static str,
}

impl Default for AttributeTopics {
    fn default() -> Self {
        Self {
            request: "v1/devices/me/attributes/request",
            response: "v1/devices/me/attributes/response",
            response_filter: "v1/devices/me/attributes/response/+",
            keys_field: "sharedKeys",
        }
    }
}

/// The answer to one attribute query.
#[derive(Debug, Clone, Copy)]
pub struct AttributeReply<'a> {
    values: Document<'a>,
    requested: &'a [String<MAX_KEY_LEN>],
}

impl<'a> AttributeReply<'a> {
    pub fn new(values: Document<'a>, requested: &'a [String<MAX_KEY_LEN>]) -> Self {
        Self { values, requested }
    }

    /// Every value the server sent, requested or not.
    pub fn values(&self) -> Document<'a> {
        self.values
    }

    pub fn requested(&self) -> impl Iterator<Item = &'a str> + use<'a> {
        let requested = self.requested;
        requested.iter().map(|key| key.as_str())
    }

    /// The value of `key`, or `None` if the server did not report it.
    pub fn get(&self, key: &str) -> Option<Value<'a>> {
        self.values.get(key)
    }

    pub fn is_missing(&self, key: &str) -> bool {
        !self.values.contains_key(key)
    }

    /// Requested keys absent from the reply.
    pub fn missing(&self) -> impl Iterator<Item = &'a str> + use<'a> {
        let values = self.values;
        self.requested().filter(move |key| !values.contains_key(key))
    }
}

/// Issues attribute queries and routes their replies.
///
/// `S` runs with the [`AttributeReply`]; `T` runs when the query expires
/// unanswered. At most `N` queries are outstanding.
pub struct AttributeClient<S, T, const N: usize> {
    table: RequestTable<S, T, N>,
    topics: AttributeTopics,
    connected: bool,
}

impl<S, T, const N: usize> AttributeClient<S, T, N>
where
    S: FnOnce(AttributeReply<'_>),
    T: FnOnce(),
{
    pub fn new(topics: AttributeTopics) -> Self {
        Self {
            table: RequestTable::new(),
            topics,
            connected: false,
        }
    }

    pub fn topics(&self) -> &AttributeTopics {
        &self.topics
    }

    pub fn pending(&self) -> &RequestTable<S, T, N> {
        &self.table
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn set_connected(&mut self, connected: bool) {
        self.connected = connected;
    }

    /// Queries `keys`, expiring after `timeout`.
    ///
    /// Key validation happens before anything else, so a bad key list is
    /// reported even while disconnected.
    pub fn request_attributes(
        &mut self,
        outbox: &mut dyn PublishOutbox,
        now: Instant,
        keys: &[&str],
        on_reply: S,
        on_timeout: Option<T>,
        timeout: Duration,
    ) -> Result<RequestId, RequestError> {
        let keys = collect_keys(keys)?;
        if !self.connected {
            return Err(RequestError::NotConnected);
        }
        if self.table.is_full() {
            return Err(RequestError::CapacityExceeded);
        }

        let mut topic: String<MAX_TOPIC_LEN> = String::new();
        let mut payload = [0u8; MAX_PAYLOAD_LEN];
        let id = self.table.insert(
            RequestKind::AttributeBatch(keys.clone()),
            on_reply,
            on_timeout,
            now,
            timeout,
        )?;
        let topic_ok = encode_topic(&mut topic, self.topics.request, id);
        let len = match encode_query(&mut payload, id, self.topics.keys_field, &keys) {
            Ok(len) if topic_ok => len,
            _ => {
                self.table.cancel(id);
                return Err(RequestError::Encode);
            }
        };
        if !outbox.publish(&topic, &payload[..len], QoS::AtMostOnce) {
            self.table.cancel(id);
            return Err(RequestError::OutboxFull);
        }
        debug!("attribute query {} issued for {} keys", id, keys.len());
        Ok(id)
    }

    /// [`request_attributes`](Self::request_attributes) with the default timeout.
    pub fn request_attributes_default(
        &mut self,
        outbox: &mut dyn PublishOutbox,
        now: Instant,
        keys: &[&str],
        on_reply: S,
        on_timeout: Option<T>,
    ) -> Result<RequestId, RequestError> {
        self.request_attributes(outbox, now, keys, on_reply, on_timeout, DEFAULT_TIMEOUT)
    }

    /// Matches an inbound message against outstanding queries.
    ///
    /// Returns whether a callback ran. Messages on other topics, replies that
    /// cannot be parsed and replies to unknown or expired ids are dropped.
    pub fn handle_reply(&mut self, msg: &Publish<'_>) -> bool {
        let Some(envelope) = ReplyEnvelope::parse(msg, self.topics.response) else {
            return false;
        };
        let Some(entry) = self.table.take_by_id(envelope.id) else {
            debug!("dropping stale attribute reply {}", envelope.id);
            return false;
        };
        let (kind, on_reply, _) = entry.into_parts();
        let requested: &[String<MAX_KEY_LEN>] = match &kind {
            RequestKind::AttributeBatch(keys) => keys,
            RequestKind::SingleRpc => &[],
        };
        let values = attribute_values(envelope.body);
        on_reply(AttributeReply::new(values, requested));
        true
    }

    /// Fires the timeout callback of every query expired at `now`.
    pub fn expire(&mut self, now: Instant) -> usize {
        let mut fired = 0;
        for entry in self.table.scan_expired(now) {
            info!("attribute query {} timed out", entry.id());
            if entry.fire_timeout() {
                fired += 1;
            }
        }
        fired
    }
}

impl<S, T, const N: usize> SessionModule for AttributeClient<S, T, N>
where
    S: FnOnce(AttributeReply<'_>),
    T: FnOnce(),
{
    fn register(&self, collector: &mut dyn TopicCollector) {
        collector.add(self.topics.response_filter);
    }

    fn on_message(&mut self, msg: &Publish<'_>) {
        self.handle_reply(msg);
    }

    fn on_expire(&mut self, now: Instant) {
        self.expire(now);
    }

    fn on_start(&mut self, _now: Instant, _outbox: &mut dyn PublishOutbox) {
        self.connected = true;
    }

    fn on_stop(&mut self) {
        self.connected = false;
    }
}

fn collect_keys(keys: &[&str]) -> Result<AttributeKeys, RequestError> {
    if keys.is_empty() {
        return Err(RequestError::EmptyKeys);
    }
    let mut collected = AttributeKeys::new();
    for key in keys {
        if key.is_empty() || key.contains(',') {
            return Err(RequestError::InvalidKey);
        }
        if collected.iter().any(|k| k.as_str() == *key) {
            continue;
        }
        let owned = String::try_from(*key).map_err(|_| RequestError::InvalidKey)?;
        collected
            .push(owned)
            .map_err(|_| RequestError::TooManyKeys)?;
    }
    Ok(collected)
}

fn encode_topic(topic: &mut String<MAX_TOPIC_LEN>, prefix: &str, id: RequestId) -> bool {
    topic.push_str(prefix).is_ok() && topic.push('/').is_ok() && push_u32(topic, id)
}

fn encode_query(
    out: &mut [u8],
    id: RequestId,
    keys_field: &str,
    keys: &AttributeKeys,
) -> Result<usize, PayloadError> {
    let mut joined: String<MAX_PAYLOAD_LEN> = String::new();
    for (i, key) in keys.iter().enumerate() {
        if i > 0 {
            joined.push(',').map_err(|_| PayloadError::BufferTooSmall)?;
        }
        joined.push_str(key).map_err(|_| PayloadError::BufferTooSmall)?;
    }
    let query = AttributeQuery {
        id,
        keys_field,
        keys: &joined,
    };
    wire::encode(&query, out)
}

/// Picks the key/value mapping out of an attribute reply body.
///
/// Accepts `{"result": {..}}`, ThingsBoard's `{"shared": {..}}` /
/// `{"client": {..}}`, or a bare mapping.
fn attribute_values(body: Document<'_>) -> Document<'_> {
    ["result", "shared", "client"]
        .iter()
        .find_map(|field| body.get(field).and_then(|v| v.as_object()))
        .unwrap_or(body)
}
