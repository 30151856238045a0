//! # MQTT Transport Abstraction
//!
//! This module defines the `MqttTransport` trait, which abstracts the underlying
//! communication channel (like TCP, UART, etc.), allowing the MQTT session to be
//! hardware and network-stack agnostic.
//!
//! With the Rust 2024 Edition, this trait uses native `async fn`, removing the
//! need for the `#[async_trait]` macro.

use core::net::Ipv4Addr;

use embassy_net::tcp::{ConnectError, Error as TcpError, TcpSocket};
use embassy_net::{IpAddress, IpEndpoint};
use embassy_time::{Duration, Timer};
use embedded_io_async::Write;

/// A marker trait for transport-related errors.
pub trait TransportError: core::fmt::Debug {
    /// Whether the error only means "no data arrived in time".
    ///
    /// The session treats such errors as an empty poll rather than a lost link.
    fn is_timeout(&self) -> bool {
        false
    }
}

/// A trait representing a transport for MQTT packets.
#[allow(async_fn_in_trait)]
pub trait MqttTransport {
    /// The error type returned by the transport.
    type Error: TransportError;

    /// Opens the link to the broker.
    ///
    /// Transports that are connected out of band (UART bridges, test doubles)
    /// keep the default no-op.
    async fn connect(&mut self, _host: &str, _port: u16) -> Result<(), Self::Error> {
        Ok(())
    }

    /// Closes the link. Errors are ignored: the link is gone either way.
    async fn close(&mut self) {}

    /// Sends a buffer of data over the transport.
    async fn send(&mut self, buf: &[u8]) -> Result<(), Self::Error>;

    /// Receives data from the transport into a buffer.
    ///
    /// Returns the number of bytes read. Implementations should give up after
    /// a short timeout so the caller's loop keeps turning.
    async fn recv(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error>;
}

/// Errors raised by [`TcpTransport`].
#[derive(Debug)]
pub enum TcpTransportError {
    /// The socket reported an error.
    Tcp(TcpError),
    /// The TCP handshake failed.
    Connect(ConnectError),
    /// The broker host is not an IPv4 literal.
    InvalidAddress,
    /// The peer closed the connection.
    Closed,
    /// Nothing arrived before the read timeout.
    Timeout,
}

impl TransportError for TcpTransportError {
    fn is_timeout(&self) -> bool {
        matches!(self, TcpTransportError::Timeout)
    }
}

/// TCP transport implementation using `embassy-net`.
pub struct TcpTransport<'a> {
    socket: TcpSocket<'a>,
    timeout: Duration,
}

impl<'a> TcpTransport<'a> {
    /// Creates a new `TcpTransport` with the given socket and read timeout.
    ///
    /// The timeout bounds every `recv`, so it also bounds how long one
    /// iteration of the session loop may wait for inbound data.
    pub fn new(socket: TcpSocket<'a>, timeout: Duration) -> Self {
        Self { socket, timeout }
    }

    /// A helper function to perform a read with a timeout.
    async fn read_with_timeout(&mut self, buf: &mut [u8]) -> Result<usize, TcpTransportError> {
        // Use `select` to race the read operation against a timer.
        let read_fut = self.socket.read(buf);
        let timer = Timer::after(self.timeout);

        match futures::future::select(core::pin::pin!(read_fut), core::pin::pin!(timer)).await {
            futures::future::Either::Left((Ok(0), _)) => {
                // If the peer closes the connection, read returns 0.
                warn!("TCP connection closed by peer");
                Err(TcpTransportError::Closed)
            }
            futures::future::Either::Left((Ok(n), _)) => {
                trace!("TCP read: {} bytes", n);
                Ok(n)
            }
            futures::future::Either::Left((Err(e), _)) => Err(TcpTransportError::Tcp(e)),
            futures::future::Either::Right(((), _)) => Err(TcpTransportError::Timeout),
        }
    }
}

impl MqttTransport for TcpTransport<'_> {
    type Error = TcpTransportError;

    async fn connect(&mut self, host: &str, port: u16) -> Result<(), Self::Error> {
        let addr: Ipv4Addr = host.parse().map_err(|_| TcpTransportError::InvalidAddress)?;
        // A socket left over from a dropped link must be reset first.
        self.socket.abort();
        let _ = self.socket.flush().await;
        self.socket
            .connect(IpEndpoint::new(IpAddress::Ipv4(addr), port))
            .await
            .map_err(TcpTransportError::Connect)
    }

    async fn close(&mut self) {
        self.socket.close();
        let _ = self.socket.flush().await;
    }

    async fn send(&mut self, buf: &[u8]) -> Result<(), Self::Error> {
        trace!("TCP TX: {} bytes", buf.len());

        self.socket
            .write_all(buf)
            .await
            .map_err(TcpTransportError::Tcp)?;

        // Flush to ensure data is actually sent to the network
        self.socket.flush().await.map_err(TcpTransportError::Tcp)
    }

    async fn recv(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        self.read_with_timeout(buf).await
    }
}
