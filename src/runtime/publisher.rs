//! Publish queues.
//!
//! Two ways to get a message out: modules queue into a [`BufferedOutbox`]
//! during their hooks, and other tasks send through a [`PublisherHandle`] to a
//! channel the runtime drains. Either way the runtime is the only writer to the
//! session.

use embassy_sync::blocking_mutex::raw::{CriticalSectionRawMutex, RawMutex};
use embassy_sync::channel::{Channel, Sender};
use heapless::{String, Vec};

use super::registry::MAX_TOPIC_LEN;
use super::traits::PublishOutbox;
use crate::packet::QoS;

/// Largest payload the runtime queues, in bytes.
pub const MAX_PAYLOAD_LEN: usize = 256;

/// Depth of the runtime's own outbox and of the default publish channel.
pub const OUTBOX_DEPTH: usize = 8;

/// A publish with inline storage for topic and payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnedPublishRequest<const TOPIC_SIZE: usize, const PAYLOAD_SIZE: usize> {
    pub topic: String<TOPIC_SIZE>,
    pub payload: Vec<u8, PAYLOAD_SIZE>,
    pub qos: QoS,
}

impl<const TOPIC_SIZE: usize, const PAYLOAD_SIZE: usize> OwnedPublishRequest<TOPIC_SIZE, PAYLOAD_SIZE> {
    /// Copies `topic` and `payload`. `None` if either does not fit.
    pub fn new(topic: &str, payload: &[u8], qos: QoS) -> Option<Self> {
        let topic = String::try_from(topic).ok()?;
        let payload = Vec::from_slice(payload).ok()?;
        Some(Self { topic, payload, qos })
    }
}

/// The request type carried by publish channels.
pub type PublishRequest = OwnedPublishRequest<MAX_TOPIC_LEN, MAX_PAYLOAD_LEN>;

pub type PublishRequestChannel<const DEPTH: usize> = Channel<CriticalSectionRawMutex, PublishRequest, DEPTH>;

pub type PublishRequestSender<'a, const DEPTH: usize> = Sender<'a, CriticalSectionRawMutex, PublishRequest, DEPTH>;

/// Where the runtime picks up publishes queued by other tasks.
pub trait PublishSource {
    /// The next queued request, without waiting.
    fn try_next(&self) -> Option<PublishRequest>;
}

impl<M: RawMutex, const DEPTH: usize> PublishSource for Channel<M, PublishRequest, DEPTH> {
    fn try_next(&self) -> Option<PublishRequest> {
        self.try_receive().ok()
    }
}

/// Lets tasks that do not own the session publish through the runtime.
///
/// Copyable; hand one to every task that needs it.
#[derive(Clone, Copy)]
pub struct PublisherHandle<'a, const DEPTH: usize> {
    tx: PublishRequestSender<'a, DEPTH>,
}

impl<'a, const DEPTH: usize> PublisherHandle<'a, DEPTH> {
    pub fn new(tx: PublishRequestSender<'a, DEPTH>) -> Self {
        Self { tx }
    }

    /// Queues a message, waiting while the channel is full.
    ///
    /// Returns `false` without queueing if the message does not fit a
    /// [`PublishRequest`].
    pub async fn publish(&self, topic: &str, payload: &[u8], qos: QoS) -> bool {
        match PublishRequest::new(topic, payload, qos) {
            Some(request) => {
                self.tx.send(request).await;
                true
            }
            None => false,
        }
    }

    /// Queues a message without waiting. Returns `false` if the channel is
    /// full or the message does not fit.
    pub fn try_publish(&self, topic: &str, payload: &[u8], qos: QoS) -> bool {
        PublishRequest::new(topic, payload, qos).is_some_and(|request| self.tx.try_send(request).is_ok())
    }
}

/// Collects publishes queued during module hooks.
///
/// # Type Parameters
///
/// - `CAPACITY`: Maximum number of queued publishes
/// - `TOPIC_SIZE`: Maximum topic length
/// - `PAYLOAD_SIZE`: Maximum payload size
pub struct BufferedOutbox<const CAPACITY: usize, const TOPIC_SIZE: usize, const PAYLOAD_SIZE: usize> {
    requests: Vec<OwnedPublishRequest<TOPIC_SIZE, PAYLOAD_SIZE>, CAPACITY>,
}

impl<const CAPACITY: usize, const TOPIC_SIZE: usize, const PAYLOAD_SIZE: usize>
    BufferedOutbox<CAPACITY, TOPIC_SIZE, PAYLOAD_SIZE>
{
    pub fn new() -> Self {
        Self { requests: Vec::new() }
    }

    /// Empties the outbox, yielding the requests in the order they were
    /// queued.
    pub fn drain(
        &mut self,
    ) -> impl Iterator<Item = OwnedPublishRequest<TOPIC_SIZE, PAYLOAD_SIZE>> + use<CAPACITY, TOPIC_SIZE, PAYLOAD_SIZE>
    {
        core::mem::take(&mut self.requests).into_iter()
    }

    pub fn clear(&mut self) {
        self.requests.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }
}

impl<const CAPACITY: usize, const TOPIC_SIZE: usize, const PAYLOAD_SIZE: usize> Default
    for BufferedOutbox<CAPACITY, TOPIC_SIZE, PAYLOAD_SIZE>
{
    fn default() -> Self {
        Self::new()
    }
}

impl<const CAPACITY: usize, const TOPIC_SIZE: usize, const PAYLOAD_SIZE: usize> PublishOutbox
    for BufferedOutbox<CAPACITY, TOPIC_SIZE, PAYLOAD_SIZE>
{
    fn publish(&mut self, topic: &str, payload: &[u8], qos: QoS) -> bool {
        let Some(request) = OwnedPublishRequest::new(topic, payload, qos) else {
            warn!("publish to {} does not fit the outbox ({} bytes)", topic, payload.len());
            return false;
        };
        if self.requests.push(request).is_err() {
            warn!("outbox full, dropping publish to {}", topic);
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_empties_in_order() {
        let mut outbox: BufferedOutbox<2, 16, 8> = BufferedOutbox::new();
        assert!(outbox.publish("a", b"1", QoS::AtMostOnce));
        assert!(outbox.publish("b", b"2", QoS::AtLeastOnce));
        assert!(!outbox.publish("c", b"3", QoS::AtMostOnce));

        let topics: std::vec::Vec<_> = outbox.drain().map(|r| r.topic).collect();
        assert_eq!(topics, ["a", "b"]);
        assert!(outbox.is_empty());
        assert!(outbox.publish("c", b"3", QoS::AtMostOnce));
    }

    #[test]
    fn oversized_publish_is_refused() {
        let mut outbox: BufferedOutbox<2, 4, 4> = BufferedOutbox::new();
        assert!(!outbox.publish("too/long", b"1", QoS::AtMostOnce));
        assert!(!outbox.publish("ok", b"12345", QoS::AtMostOnce));
        assert_eq!(outbox.len(), 0);
    }

    #[test]
    fn handle_feeds_channel_source() {
        let channel: PublishRequestChannel<1> = Channel::new();
        let handle = PublisherHandle::new(channel.sender());
        assert!(handle.try_publish("v1/devices/me/telemetry", b"{}", QoS::AtMostOnce));
        assert!(!handle.try_publish("v1/devices/me/telemetry", b"{}", QoS::AtMostOnce));

        let source: &dyn PublishSource = &channel;
        let request = source.try_next().unwrap();
        assert_eq!(request.topic.as_str(), "v1/devices/me/telemetry");
        assert!(source.try_next().is_none());

        assert!(embassy_futures::block_on(handle.publish("t", b"x", QoS::AtMostOnce)));
        assert_eq!(source.try_next().map(|r| r.payload), Vec::from_slice(b"x").ok());
    }
}
