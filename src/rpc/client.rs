//! Device-initiated RPC.
//!
//! ```ignore
//! let id = rpc.request(
//!     outbox,
//!     now,
//!     "getCurrentTime",
//!     &[],
//!     |time| info!("server time: {:?}", time.as_i64()),
//!     Some(|| warn!("server did not answer")),
//!     Duration::from_secs(10),
//! )?;
//! ```

use embassy_time::{Duration, Instant};
use heapless::String;

use super::table::{RequestId, RequestKind, RequestTable};
use super::wire::{self, Params, RpcCall};
use super::{DEFAULT_TIMEOUT, ReplyEnvelope};
use crate::error::RequestError;
use crate::packet::{Publish, QoS};
use crate::payload::Value;
use crate::runtime::{MAX_PAYLOAD_LEN, MAX_TOPIC_LEN, PublishOutbox, SessionModule, TopicCollector};
use crate::util::push_u32;

/// Topic prefixes for RPC calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RpcTopics {
    pub request: &'static str,
    pub response: &'static str,
    pub response_filter: &'static str,
}

impl Default for RpcTopics {
    fn default() -> Self {
        Self {
            request: "v1/devices/me/rpc/request",
            response: "v1/devices/me/rpc/response",
            response_filter: "v1/devices/me/rpc/response/+",
        }
    }
}

/// Issues RPC calls and routes their results.
///
/// `S` receives the call's result; `T` runs when the call expires
/// unanswered. At most `N` calls are outstanding.
pub struct RpcClient<S, T, const N: usize> {
    table: RequestTable<S, T, N>,
    topics: RpcTopics,
    connected: bool,
}

impl<S, T, const N: usize> RpcClient<S, T, N>
where
    S: FnOnce(Value<'_>),
    T: FnOnce(),
{
    pub fn new(topics: RpcTopics) -> Self {
        Self {
            table: RequestTable::new(),
            topics,
            connected: false,
        }
    }

    pub fn topics(&self) -> &RpcTopics {
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

    /// Calls `method` with `params`, expiring after `timeout`.
    ///
    /// Nothing is stored or queued unless the call succeeds.
    pub fn request(
        &mut self,
        outbox: &mut dyn PublishOutbox,
        now: Instant,
        method: &str,
        params: &[(&str, Value<'_>)],
        on_reply: S,
        on_timeout: Option<T>,
        timeout: Duration,
    ) -> Result<RequestId, RequestError> {
        if !self.connected {
            return Err(RequestError::NotConnected);
        }
        if self.table.is_full() {
            return Err(RequestError::CapacityExceeded);
        }

        let id = self
            .table
            .insert(RequestKind::SingleRpc, on_reply, on_timeout, now, timeout)?;
        let mut topic: String<MAX_TOPIC_LEN> = String::new();
        let mut payload = [0u8; MAX_PAYLOAD_LEN];
        let call = RpcCall {
            id,
            method,
            params: Params(params),
        };
        let topic_ok = topic.push_str(self.topics.request).is_ok()
            && topic.push('/').is_ok()
            && push_u32(&mut topic, id);
        let len = match wire::encode(&call, &mut payload) {
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
        debug!("rpc {} issued: {}", id, method);
        Ok(id)
    }

    /// [`request`](Self::request) with the default timeout.
    pub fn request_default(
        &mut self,
        outbox: &mut dyn PublishOutbox,
        now: Instant,
        method: &str,
        params: &[(&str, Value<'_>)],
        on_reply: S,
        on_timeout: Option<T>,
    ) -> Result<RequestId, RequestError> {
        self.request(outbox, now, method, params, on_reply, on_timeout, DEFAULT_TIMEOUT)
    }

    /// Runs the reply callback of the call `msg` answers, if it is still
    /// outstanding. Returns whether a callback ran.
    pub fn handle_reply(&mut self, msg: &Publish<'_>) -> bool {
        let Some(envelope) = ReplyEnvelope::parse(msg, self.topics.response) else {
            return false;
        };
        match self.table.take_by_id(envelope.id) {
            Some(entry) => {
                trace!("rpc {} answered", envelope.id);
                let (_, on_reply, _) = entry.into_parts();
                on_reply(envelope.result());
                true
            }
            None => {
                debug!("dropping stale rpc reply {}", envelope.id);
                false
            }
        }
    }

    /// Fires the timeout callback of every call expired at `now`.
    pub fn expire(&mut self, now: Instant) -> usize {
        let mut fired = 0;
        for entry in self.table.scan_expired(now) {
            info!("rpc {} timed out", entry.id());
            fired += usize::from(entry.fire_timeout());
        }
        fired
    }
}

impl<S, T, const N: usize> SessionModule for RpcClient<S, T, N>
where
    S: FnOnce(Value<'_>),
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::BufferedOutbox;
    use std::boxed::Box;
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;
    use std::vec::Vec as StdVec;

    type OnReply = Box<dyn FnOnce(Value<'_>)>;
    type OnTimeout = Box<dyn FnOnce()>;
    type Outbox = BufferedOutbox<8, MAX_TOPIC_LEN, MAX_PAYLOAD_LEN>;

    fn connected<const N: usize>() -> RpcClient<OnReply, OnTimeout, N> {
        let mut client = RpcClient::new(RpcTopics::default());
        client.set_connected(true);
        client
    }

    fn ignore() -> OnReply {
        Box::new(|_: Value<'_>| {})
    }

    #[test]
    fn request_is_published_with_id_in_topic_and_payload() {
        let mut client = connected::<2>();
        let mut outbox = Outbox::new();
        let id = client
            .request(
                &mut outbox,
                Instant::from_secs(0),
                "setGpio",
                &[("pin", Value::Int(4)), ("enabled", Value::Bool(true))],
                ignore(),
                None,
                Duration::from_secs(10),
            )
            .unwrap();

        let sent: StdVec<_> = outbox.drain().collect();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].topic.as_str(), std::format!("v1/devices/me/rpc/request/{}", id));
        assert_eq!(
            core::str::from_utf8(&sent[0].payload).unwrap(),
            std::format!(r#"{{"id":{},"method":"setGpio","params":{{"pin":4,"enabled":true}}}}"#, id)
        );
        assert!(client.pending().contains(id));
    }

    #[test]
    fn sixth_call_exceeds_capacity_of_five() {
        let mut client = connected::<5>();
        let mut outbox = Outbox::new();
        let now = Instant::from_secs(0);
        let mut ids = StdVec::new();
        for _ in 0..5 {
            ids.push(
                client
                    .request(&mut outbox, now, "getCurrentTime", &[], ignore(), None, Duration::from_secs(10))
                    .unwrap(),
            );
        }
        let sixth = client.request(&mut outbox, now, "getCurrentTime", &[], ignore(), None, Duration::from_secs(10));
        assert_eq!(sixth, Err(RequestError::CapacityExceeded));
        assert_eq!(outbox.len(), 5);
        for id in ids {
            assert!(client.pending().contains(id));
        }
    }

    #[test]
    fn disconnected_client_queues_nothing() {
        let mut client: RpcClient<OnReply, OnTimeout, 2> = RpcClient::new(RpcTopics::default());
        let mut outbox = Outbox::new();
        let result = client.request_default(&mut outbox, Instant::from_secs(0), "ping", &[], ignore(), None);
        assert_eq!(result, Err(RequestError::NotConnected));
        assert!(outbox.is_empty());
        assert!(client.pending().is_empty());
    }

    #[test]
    fn full_outbox_rolls_back_the_entry() {
        let mut client = connected::<4>();
        let mut outbox: BufferedOutbox<1, MAX_TOPIC_LEN, MAX_PAYLOAD_LEN> = BufferedOutbox::new();
        let now = Instant::from_secs(0);
        client
            .request(&mut outbox, now, "a", &[], ignore(), None, Duration::from_secs(1))
            .unwrap();
        let second = client.request(&mut outbox, now, "b", &[], ignore(), None, Duration::from_secs(1));
        assert_eq!(second, Err(RequestError::OutboxFull));
        assert_eq!(client.pending().len(), 1);
    }

    #[test]
    fn reply_runs_callback_with_result() {
        let mut client = connected::<2>();
        let mut outbox = Outbox::new();
        let time = Rc::new(Cell::new(None));
        let slot = time.clone();
        let id = client
            .request(
                &mut outbox,
                Instant::from_secs(0),
                "getCurrentTime",
                &[],
                Box::new(move |result: Value<'_>| slot.set(result.as_i64())),
                None,
                Duration::from_secs(10),
            )
            .unwrap();

        let topic = std::format!("v1/devices/me/rpc/response/{}", id);
        let reply = Publish::new(&topic, br#"{"result":1700000000}"#);
        assert!(client.handle_reply(&reply));
        assert_eq!(time.get(), Some(1_700_000_000));

        assert!(!client.handle_reply(&reply));
        assert!(client.pending().is_empty());
    }

    #[test]
    fn body_id_cannot_redirect_a_reply() {
        let mut client = connected::<2>();
        let mut outbox = Outbox::new();
        let hits = Rc::new(RefCell::new(StdVec::new()));
        let mut issue = |tag: &'static str| {
            let hits = hits.clone();
            client
                .request_default(
                    &mut outbox,
                    Instant::from_secs(0),
                    "getDeviceInfo",
                    &[],
                    Box::new(move |_: Value<'_>| hits.borrow_mut().push(tag)),
                    None,
                )
                .unwrap()
        };
        let first = issue("first");
        let second = issue("second");

        let topic = std::format!("v1/devices/me/rpc/response/{}", first);
        let body = std::format!(r#"{{"id":{},"fw":"1.0"}}"#, second);
        assert!(client.handle_reply(&Publish::new(&topic, body.as_bytes())));
        assert_eq!(*hits.borrow(), ["first"]);
        assert!(client.pending().contains(second));

        let topic = std::format!("v1/devices/me/rpc/response/{}", second);
        assert!(client.handle_reply(&Publish::new(&topic, br#"{"id":"dev-A"}"#)));
        assert_eq!(*hits.borrow(), ["first", "second"]);
    }

    #[test]
    fn late_reply_after_timeout_is_dropped() {
        let mut client = connected::<2>();
        let mut outbox = Outbox::new();
        let replies = Rc::new(Cell::new(0));
        let timeouts = Rc::new(RefCell::new(StdVec::new()));
        let (r, t) = (replies.clone(), timeouts.clone());
        let id = client
            .request(
                &mut outbox,
                Instant::from_secs(0),
                "getCurrentTime",
                &[],
                Box::new(move |_: Value<'_>| r.set(r.get() + 1)),
                Some(Box::new(move || t.borrow_mut().push("timeout"))),
                Duration::from_secs(10),
            )
            .unwrap();

        assert_eq!(client.expire(Instant::from_secs(11)), 1);
        assert_eq!(*timeouts.borrow(), ["timeout"]);
        assert!(!client.pending().contains(id));

        let topic = std::format!("v1/devices/me/rpc/response/{}", id);
        assert!(!client.handle_reply(&Publish::new(&topic, br#"{"result":1}"#)));
        assert_eq!(replies.get(), 0);
        assert_eq!(client.expire(Instant::from_secs(30)), 0);
    }

    #[test]
    fn module_hooks_track_connection() {
        let mut client: RpcClient<OnReply, OnTimeout, 1> = RpcClient::new(RpcTopics::default());
        let mut outbox = Outbox::new();
        client.on_start(Instant::from_secs(0), &mut outbox);
        assert!(client.is_connected());
        client.on_stop();
        assert!(!client.is_connected());

        let mut registry = crate::runtime::TopicRegistry::<2>::new();
        client.register(&mut registry);
        assert_eq!(registry.iter().collect::<StdVec<_>>(), ["v1/devices/me/rpc/response/+"]);
    }
}
