//! Fire-and-forget uploads: telemetry and client-side attributes.
//!
//! Neither gets a reply, so nothing is tracked; these only encode a flat JSON
//! object and queue it.

use heapless::String;

use crate::error::{PayloadError, RequestError};
use crate::packet::{Publish, QoS};
use crate::payload::{Value, write_object};
use crate::runtime::{MAX_PAYLOAD_LEN, PublishOutbox, PublisherHandle, SessionModule, TopicCollector};

/// Upload topics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TelemetryTopics {
    pub telemetry: &'static str,
    pub attributes: &'static str,
}

impl Default for TelemetryTopics {
    fn default() -> Self {
        Self {
            telemetry: "v1/devices/me/telemetry",
            attributes: "v1/devices/me/attributes",
        }
    }
}

fn encode(fields: &[(&str, Value<'_>)]) -> Result<String<MAX_PAYLOAD_LEN>, RequestError> {
    if fields.is_empty() {
        return Err(RequestError::EmptyKeys);
    }
    let mut payload = String::new();
    write_object(&mut payload, fields).map_err(|_: PayloadError| RequestError::Encode)?;
    Ok(payload)
}

/// Uploads from inside the runtime's module tree.
///
/// Refuses while the session is down instead of queueing stale readings.
pub struct TelemetryPublisher {
    topics: TelemetryTopics,
    connected: bool,
}

impl TelemetryPublisher {
    pub fn new(topics: TelemetryTopics) -> Self {
        Self {
            topics,
            connected: false,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn set_connected(&mut self, connected: bool) {
        self.connected = connected;
    }

    /// Publishes `fields` as one telemetry sample.
    pub fn send_telemetry(
        &self,
        outbox: &mut dyn PublishOutbox,
        fields: &[(&str, Value<'_>)],
    ) -> Result<(), RequestError> {
        self.send(outbox, self.topics.telemetry, fields)
    }

    /// Publishes `fields` as client-side attributes.
    pub fn send_attributes(
        &self,
        outbox: &mut dyn PublishOutbox,
        fields: &[(&str, Value<'_>)],
    ) -> Result<(), RequestError> {
        self.send(outbox, self.topics.attributes, fields)
    }

    fn send(
        &self,
        outbox: &mut dyn PublishOutbox,
        topic: &str,
        fields: &[(&str, Value<'_>)],
    ) -> Result<(), RequestError> {
        if !self.connected {
            warn!("not connected, dropping upload to {}", topic);
            return Err(RequestError::NotConnected);
        }
        let payload = encode(fields)?;
        if !outbox.publish(topic, payload.as_bytes(), QoS::AtMostOnce) {
            return Err(RequestError::OutboxFull);
        }
        debug!("queued {} fields for {}", fields.len(), topic);
        Ok(())
    }
}

impl Default for TelemetryPublisher {
    fn default() -> Self {
        Self::new(TelemetryTopics::default())
    }
}

impl SessionModule for TelemetryPublisher {
    fn register(&self, _collector: &mut dyn TopicCollector) {}

    fn on_message(&mut self, _msg: &Publish<'_>) {}

    fn on_start(&mut self, _now: embassy_time::Instant, _outbox: &mut dyn PublishOutbox) {
        self.connected = true;
    }

    fn on_stop(&mut self) {
        self.connected = false;
    }
}

/// Uploads from tasks outside the runtime, through its publish channel.
///
/// Connection state is not known here; uploads queued while the link is down
/// wait in the channel and go out after the reconnect.
#[derive(Clone, Copy)]
pub struct TelemetryHandle<'a, const DEPTH: usize> {
    publisher: PublisherHandle<'a, DEPTH>,
    topics: TelemetryTopics,
}

impl<'a, const DEPTH: usize> TelemetryHandle<'a, DEPTH> {
    pub fn new(publisher: PublisherHandle<'a, DEPTH>, topics: TelemetryTopics) -> Self {
        Self { publisher, topics }
    }

    pub async fn send_telemetry(&self, fields: &[(&str, Value<'_>)]) -> Result<(), RequestError> {
        let payload = encode(fields)?;
        self.publisher
            .publish(self.topics.telemetry, payload.as_bytes(), QoS::AtMostOnce)
            .await
            .then_some(())
            .ok_or(RequestError::Encode)
    }

    /// Queues client attributes without waiting. Fails with `OutboxFull` if
    /// the channel is full.
    pub fn try_send_attributes(&self, fields: &[(&str, Value<'_>)]) -> Result<(), RequestError> {
        let payload = encode(fields)?;
        self.publisher
            .try_publish(self.topics.attributes, payload.as_bytes(), QoS::AtMostOnce)
            .then_some(())
            .ok_or(RequestError::OutboxFull)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{BufferedOutbox, MAX_TOPIC_LEN, PublishRequestChannel, PublishSource};
    use embassy_sync::channel::Channel;
    use embassy_time::Instant;

    type Outbox = BufferedOutbox<2, MAX_TOPIC_LEN, MAX_PAYLOAD_LEN>;

    #[test]
    fn refuses_while_disconnected() {
        let publisher = TelemetryPublisher::default();
        let mut outbox = Outbox::new();
        assert_eq!(
            publisher.send_telemetry(&mut outbox, &[("temperature", Value::Float(21.5))]),
            Err(RequestError::NotConnected)
        );
        assert!(outbox.is_empty());
    }

    #[test]
    fn telemetry_and_attributes_use_their_topics() {
        let mut publisher = TelemetryPublisher::default();
        let mut outbox = Outbox::new();
        publisher.on_start(Instant::from_secs(0), &mut outbox);

        publisher
            .send_telemetry(&mut outbox, &[("temperature", Value::Float(21.5))])
            .unwrap();
        publisher
            .send_attributes(&mut outbox, &[("batteryLevel", Value::Int(87))])
            .unwrap();

        let sent: std::vec::Vec<_> = outbox.drain().collect();
        assert_eq!(sent[0].topic.as_str(), "v1/devices/me/telemetry");
        assert_eq!(&sent[0].payload[..], br#"{"temperature":21.5}"#);
        assert_eq!(sent[1].topic.as_str(), "v1/devices/me/attributes");
        assert_eq!(&sent[1].payload[..], br#"{"batteryLevel":87}"#);

        publisher.on_stop();
        assert_eq!(
            publisher.send_attributes(&mut outbox, &[("batteryLevel", Value::Int(86))]),
            Err(RequestError::NotConnected)
        );
    }

    #[test]
    fn handle_queues_into_channel() {
        let channel: PublishRequestChannel<1> = Channel::new();
        let handle = TelemetryHandle::new(PublisherHandle::new(channel.sender()), TelemetryTopics::default());

        assert_eq!(handle.try_send_attributes(&[]), Err(RequestError::EmptyKeys));
        handle.try_send_attributes(&[("fw", Value::Str("1.2.0"))]).unwrap();
        assert_eq!(
            handle.try_send_attributes(&[("fw", Value::Str("1.2.0"))]),
            Err(RequestError::OutboxFull)
        );

        let request = channel.try_next().unwrap();
        assert_eq!(request.topic.as_str(), "v1/devices/me/attributes");
        assert_eq!(&request.payload[..], br#"{"fw":"1.2.0"}"#);

        embassy_futures::block_on(handle.send_telemetry(&[("uptime", Value::Int(5))])).unwrap();
        assert_eq!(&channel.try_next().unwrap().payload[..], br#"{"uptime":5}"#);
    }
}
