#![allow(dead_code)]

use std::collections::VecDeque;

use embassy_time::Instant;
use myrtio_rpc::{PubSubSession, Publish, QoS};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockError {
    Down,
    Refused,
}

/// An in-memory broker session.
///
/// Tests push inbound messages, read back what was published, and cut the
/// link by clearing `connected`.
#[derive(Default)]
pub struct MockSession {
    pub inbound: VecDeque<(String, Vec<u8>)>,
    pub published: Vec<(String, Vec<u8>)>,
    pub subscriptions: Vec<String>,
    pub connected: bool,
    /// Connect attempts to refuse before accepting one.
    pub refuse_connects: usize,
    pub connects: usize,
    current: Option<(String, Vec<u8>)>,
}

impl MockSession {
    pub fn deliver(&mut self, topic: &str, payload: &str) {
        self.inbound.push_back((topic.to_owned(), payload.as_bytes().to_vec()));
    }

    pub fn published_to(&self, prefix: &str) -> Vec<&str> {
        self.published
            .iter()
            .filter(|(topic, _)| topic.starts_with(prefix))
            .map(|(topic, _)| topic.as_str())
            .collect()
    }
}

impl PubSubSession for MockSession {
    type Error = MockError;

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn connect(&mut self) -> Result<(), MockError> {
        self.connects += 1;
        if self.refuse_connects > 0 {
            self.refuse_connects -= 1;
            return Err(MockError::Refused);
        }
        self.connected = true;
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.connected = false;
    }

    async fn publish(&mut self, topic: &str, payload: &[u8], _qos: QoS) -> Result<(), MockError> {
        if !self.connected {
            return Err(MockError::Down);
        }
        self.published.push((topic.to_owned(), payload.to_vec()));
        Ok(())
    }

    async fn subscribe(&mut self, filter: &str) -> Result<(), MockError> {
        if !self.connected {
            return Err(MockError::Down);
        }
        self.subscriptions.push(filter.to_owned());
        Ok(())
    }

    async fn poll(&mut self) -> Result<Option<Publish<'_>>, MockError> {
        if !self.connected {
            return Err(MockError::Down);
        }
        self.current = self.inbound.pop_front();
        Ok(self
            .current
            .as_ref()
            .map(|(topic, payload)| Publish::new(topic, payload)))
    }
}

pub fn secs(s: u64) -> Instant {
    Instant::from_secs(s)
}
