//! The pub/sub boundary the runtime drives.
//!
//! [`PubSubSession`] is narrower than [`MqttClient`]: connect,
//! publish, subscribe and a pump that yields application messages only.
//! Acknowledgements and pings stay inside the client.

use crate::client::{MqttClient, MqttEvent};
use crate::error::MqttError;
use crate::packet::{Publish, QoS};
use crate::transport::MqttTransport;

/// A connection to a publish/subscribe broker.
#[allow(async_fn_in_trait)]
pub trait PubSubSession {
    type Error: core::fmt::Debug;

    /// Whether the link is believed to be up.
    fn is_connected(&self) -> bool;

    /// (Re-)establishes the session.
    async fn connect(&mut self) -> Result<(), Self::Error>;

    /// Tears the session down. Never fails.
    async fn disconnect(&mut self);

    async fn publish(&mut self, topic: &str, payload: &[u8], qos: QoS) -> Result<(), Self::Error>;

    async fn subscribe(&mut self, filter: &str) -> Result<(), Self::Error>;

    /// Delivers at most one inbound application message.
    ///
    /// Must return promptly (`Ok(None)`) when nothing arrived, so that the
    /// caller can keep scanning for expired requests.
    async fn poll(&mut self) -> Result<Option<Publish<'_>>, Self::Error>;
}

impl<T, const BUF_SIZE: usize> PubSubSession for MqttClient<'_, T, BUF_SIZE>
where
    T: MqttTransport,
{
    type Error = MqttError<T::Error>;

    fn is_connected(&self) -> bool {
        MqttClient::is_connected(self)
    }

    async fn connect(&mut self) -> Result<(), Self::Error> {
        MqttClient::connect(self).await
    }

    async fn disconnect(&mut self) {
        MqttClient::disconnect(self).await
    }

    async fn publish(&mut self, topic: &str, payload: &[u8], qos: QoS) -> Result<(), Self::Error> {
        MqttClient::publish(self, topic, payload, qos).await
    }

    async fn subscribe(&mut self, filter: &str) -> Result<(), Self::Error> {
        MqttClient::subscribe(self, filter, QoS::AtMostOnce)
            .await
            .map(|_| ())
    }

    async fn poll(&mut self) -> Result<Option<Publish<'_>>, Self::Error> {
        match MqttClient::poll(self).await? {
            Some(MqttEvent::Publish(publish)) => Ok(Some(publish)),
            Some(MqttEvent::SubAck {
                packet_id,
                accepted: false,
            }) => {
                warn!("subscription {} rejected by broker", packet_id);
                Ok(None)
            }
            Some(_) | None => Ok(None),
        }
    }
}
