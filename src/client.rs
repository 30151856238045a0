//! # MQTT Client
//!
//! A minimal MQTT 3.1.1 client that owns one connection to a broker. It is the
//! transport session underneath the correlation layer: connect, publish,
//! subscribe, keep-alive, and a `poll` that hands out inbound messages one at a
//! time.
//!
//! Inbound frames are reassembled in a fixed receive buffer. A message returned
//! by [`MqttClient::poll`] borrows from that buffer and stays valid until the
//! next call that needs `&mut self`.

use embassy_time::{Duration, Instant};

use crate::error::{ConnectReasonCode, MqttError, ProtocolError};
use crate::packet::{
    self, Connect, DecodePacket, Disconnect, EncodePacket, MqttPacket, PingReq, PubAck, Publish,
    QoS, Subscribe,
};
use crate::transport::{MqttTransport, TransportError};

/// Connection settings for an [`MqttClient`].
#[derive(Debug, Clone)]
pub struct MqttOptions<'a> {
    pub client_id: &'a str,
    pub host: &'a str,
    pub port: u16,
    pub username: Option<&'a str>,
    pub password: Option<&'a [u8]>,
    pub keep_alive: Duration,
    pub clean_session: bool,
    /// How long to wait for `CONNACK` after sending `CONNECT`.
    pub connect_timeout: Duration,
}

impl<'a> MqttOptions<'a> {
    /// Options with a 60 second keep-alive and a clean session.
    pub fn new(client_id: &'a str, host: &'a str, port: u16) -> Self {
        Self {
            client_id,
            host,
            port,
            username: None,
            password: None,
            keep_alive: Duration::from_secs(60),
            clean_session: true,
            connect_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_credentials(mut self, username: &'a str, password: &'a [u8]) -> Self {
        self.username = Some(username);
        self.password = Some(password);
        self
    }

    /// Authenticates with a device access token, passed as the username.
    pub fn with_access_token(mut self, token: &'a str) -> Self {
        self.username = Some(token);
        self.password = None;
        self
    }

    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn with_clean_session(mut self, clean_session: bool) -> Self {
        self.clean_session = clean_session;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

/// Something the broker sent.
#[derive(Debug)]
pub enum MqttEvent<'a> {
    /// An application message on a subscribed topic.
    Publish(Publish<'a>),
    /// The broker acknowledged a subscription.
    SubAck { packet_id: u16, accepted: bool },
    /// The broker acknowledged a QoS 1 publish.
    PubAck { packet_id: u16 },
    /// The broker answered a keep-alive ping.
    PingResp,
}

/// An MQTT 3.1.1 client over any [`MqttTransport`].
///
/// `BUF_SIZE` bounds both the largest packet that can be sent and the largest
/// packet that can be received.
pub struct MqttClient<'a, T, const BUF_SIZE: usize> {
    transport: T,
    options: MqttOptions<'a>,
    connected: bool,
    next_packet_id: u16,
    tx_buf: [u8; BUF_SIZE],
    rx_buf: [u8; BUF_SIZE],
    rx_len: usize,
    rx_consumed: usize,
    /// Bytes of an oversized packet still to be discarded.
    rx_skip: usize,
    last_sent: Instant,
    ping_sent: Option<Instant>,
}

impl<'a, T, const BUF_SIZE: usize> MqttClient<'a, T, BUF_SIZE>
where
    T: MqttTransport,
{
    pub fn new(transport: T, options: MqttOptions<'a>) -> Self {
        Self {
            transport,
            options,
            connected: false,
            next_packet_id: 1,
            tx_buf: [0; BUF_SIZE],
            rx_buf: [0; BUF_SIZE],
            rx_len: 0,
            rx_consumed: 0,
            rx_skip: 0,
            last_sent: Instant::from_ticks(0),
            ping_sent: None,
        }
    }

    pub fn options(&self) -> &MqttOptions<'a> {
        &self.options
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Opens the transport, sends `CONNECT` and waits for `CONNACK`.
    pub async fn connect(&mut self) -> Result<(), MqttError<T::Error>> {
        self.connected = false;
        self.reset_rx();
        self.ping_sent = None;

        self.transport
            .connect(self.options.host, self.options.port)
            .await
            .map_err(MqttError::Transport)?;

        let keep_alive = u16::try_from(self.options.keep_alive.as_secs()).unwrap_or(u16::MAX);
        let len = Connect::new(self.options.client_id, keep_alive, self.options.clean_session)
            .with_credentials(self.options.username, self.options.password)
            .encode(&mut self.tx_buf)?;
        self.transport
            .send(&self.tx_buf[..len])
            .await
            .map_err(MqttError::Transport)?;
        self.last_sent = Instant::now();

        let deadline = Instant::now() + self.options.connect_timeout;
        loop {
            match self.next_frame().await? {
                Some(len) => {
                    if let MqttPacket::ConnAck(ack) = packet::decode(&self.rx_buf[..len])? {
                        return match ConnectReasonCode::from(ack.reason_code) {
                            ConnectReasonCode::Success => {
                                debug!("CONNACK received, session present: {}", ack.session_present);
                                self.connected = true;
                                Ok(())
                            }
                            code => Err(MqttError::ConnectionRefused(code)),
                        };
                    }
                }
                None if Instant::now() >= deadline => return Err(MqttError::Timeout),
                None => {}
            }
        }
    }

    /// Sends `DISCONNECT` (best effort) and closes the transport.
    pub async fn disconnect(&mut self) {
        if self.connected {
            if let Ok(len) = Disconnect.encode(&mut self.tx_buf) {
                let _ = self.transport.send(&self.tx_buf[..len]).await;
            }
        }
        self.transport.close().await;
        self.connected = false;
    }

    /// Publishes a message. QoS 1 messages get a packet id; their `PUBACK`
    /// shows up later as an [`MqttEvent::PubAck`].
    pub async fn publish(&mut self, topic: &str, payload: &[u8], qos: QoS) -> Result<(), MqttError<T::Error>> {
        if !self.connected {
            return Err(MqttError::NotConnected);
        }
        let packet_id = (qos != QoS::AtMostOnce).then(|| self.allocate_packet_id());
        let len = Publish {
            topic,
            qos,
            retain: false,
            payload,
            packet_id,
        }
        .encode(&mut self.tx_buf)?;
        self.send_frame(len).await
    }

    /// Sends `SUBSCRIBE` for one filter. The `SUBACK` is reported by `poll`.
    pub async fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<u16, MqttError<T::Error>> {
        if !self.connected {
            return Err(MqttError::NotConnected);
        }
        let packet_id = self.allocate_packet_id();
        let len = Subscribe::new(packet_id, topic, qos).encode(&mut self.tx_buf)?;
        self.send_frame(len).await?;
        Ok(packet_id)
    }

    /// Waits (up to the transport's read timeout) for the next packet.
    ///
    /// Also sends keep-alive pings and detects a broker that stopped
    /// answering them. Any error other than a protocol hiccup marks the
    /// client disconnected.
    pub async fn poll(&mut self) -> Result<Option<MqttEvent<'_>>, MqttError<T::Error>> {
        if !self.connected {
            return Err(MqttError::NotConnected);
        }
        if let Err(e) = self.keep_alive().await {
            self.connected = false;
            return Err(e);
        }
        let len = match self.next_frame().await {
            Ok(Some(len)) => len,
            Ok(None) => return Ok(None),
            Err(e) => {
                if e.is_link_lost() {
                    self.connected = false;
                }
                return Err(e);
            }
        };

        let event = match packet::decode(&self.rx_buf[..len])? {
            MqttPacket::Publish(publish) => MqttEvent::Publish(publish),
            MqttPacket::SubAck(ack) => MqttEvent::SubAck {
                packet_id: ack.packet_id,
                accepted: !ack.has_failure(),
            },
            MqttPacket::PubAck(ack) => MqttEvent::PubAck {
                packet_id: ack.packet_id,
            },
            MqttPacket::PingResp => MqttEvent::PingResp,
            MqttPacket::ConnAck(_) => return Err(MqttError::Protocol(ProtocolError::InvalidResponse)),
        };
        Ok(Some(event))
    }

    fn allocate_packet_id(&mut self) -> u16 {
        let id = self.next_packet_id;
        // Packet id 0 is reserved.
        self.next_packet_id = self.next_packet_id.checked_add(1).unwrap_or(1);
        id
    }

    async fn send_frame(&mut self, len: usize) -> Result<(), MqttError<T::Error>> {
        match self.transport.send(&self.tx_buf[..len]).await {
            Ok(()) => {
                self.last_sent = Instant::now();
                Ok(())
            }
            Err(e) => {
                self.connected = false;
                Err(MqttError::Transport(e))
            }
        }
    }

    async fn keep_alive(&mut self) -> Result<(), MqttError<T::Error>> {
        let keep_alive = self.options.keep_alive;
        if keep_alive == Duration::from_ticks(0) {
            return Ok(());
        }
        let now = Instant::now();
        if let Some(sent) = self.ping_sent {
            if now.saturating_duration_since(sent) > keep_alive {
                warn!("broker stopped answering pings");
                return Err(MqttError::Timeout);
            }
            return Ok(());
        }
        if now.saturating_duration_since(self.last_sent) >= keep_alive {
            let len = PingReq.encode(&mut self.tx_buf)?;
            self.send_frame(len).await?;
            self.ping_sent = Some(now);
        }
        Ok(())
    }

    /// Reads until one complete frame sits at the start of `rx_buf`.
    ///
    /// Returns the frame length, or `None` if the transport timed out first.
    /// Packets that need an immediate answer (`PUBACK` for inbound QoS 1,
    /// clearing the ping timer) are handled here, before the frame is handed
    /// to the caller.
    ///
    /// A packet larger than `BUF_SIZE` is read off the stream and dropped. A
    /// corrupt length header leaves no way to find the next packet, so the
    /// client marks itself disconnected.
    async fn next_frame(&mut self) -> Result<Option<usize>, MqttError<T::Error>> {
        if self.rx_consumed > 0 {
            self.rx_buf.copy_within(self.rx_consumed..self.rx_len, 0);
            self.rx_len -= self.rx_consumed;
            self.rx_consumed = 0;
        }

        loop {
            if self.rx_skip > 0 {
                let dropped = self.rx_skip.min(self.rx_len);
                self.rx_buf.copy_within(dropped..self.rx_len, 0);
                self.rx_len -= dropped;
                self.rx_skip -= dropped;
            }
            if self.rx_skip == 0 {
                match packet::frame_len(&self.rx_buf[..self.rx_len]) {
                    Ok(Some(len)) if len > BUF_SIZE => {
                        warn!("dropping {} byte packet, receive buffer holds {}", len, BUF_SIZE);
                        self.rx_skip = len;
                        continue;
                    }
                    Ok(Some(len)) if len <= self.rx_len => {
                        self.rx_consumed = len;
                        self.acknowledge(len).await?;
                        return Ok(Some(len));
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("corrupt packet header, dropping the link");
                        self.reset_rx();
                        self.connected = false;
                        return Err(e.into());
                    }
                }
            }
            if self.rx_len == BUF_SIZE {
                self.reset_rx();
                self.connected = false;
                return Err(MqttError::BufferTooSmall);
            }
            match self.transport.recv(&mut self.rx_buf[self.rx_len..]).await {
                Ok(0) => return Err(MqttError::Protocol(ProtocolError::ConnectionClosed)),
                Ok(n) => self.rx_len += n,
                Err(e) if e.is_timeout() => return Ok(None),
                Err(e) => return Err(MqttError::Transport(e)),
            }
        }
    }

    fn reset_rx(&mut self) {
        self.rx_len = 0;
        self.rx_consumed = 0;
        self.rx_skip = 0;
    }

    async fn acknowledge(&mut self, len: usize) -> Result<(), MqttError<T::Error>> {
        let first = self.rx_buf[0];
        match first >> 4 {
            13 => self.ping_sent = None,
            3 if (first >> 1) & 0x03 == 1 => {
                let publish = Publish::decode(&self.rx_buf[..len])?;
                if let Some(packet_id) = publish.packet_id {
                    let ack_len = PubAck { packet_id }.encode(&mut self.tx_buf)?;
                    self.send_frame(ack_len).await?;
                }
            }
            _ => {}
        }
        Ok(())
    }
}
