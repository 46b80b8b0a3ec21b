//! # MQTT Transport Abstraction
//!
//! Two seams live here:
//!
//! - [`MqttTransport`]: the async byte stream (TCP, UART, ...) packets are read
//!   from and flushed to, with [`TcpTransport`] over `embassy-net`.
//! - [`PacketSender`]: the synchronous capability the publication engine drives.
//!   `send` only reports whether a packet was accepted into a send buffer; it never
//!   blocks. [`TxBuffer`] implements it on top of an [`MqttTransport`].
//!
//! With the Rust 2024 Edition, the async trait uses native `async fn`, removing the
//! need for the `#[async_trait]` macro.

use crate::codec::Packet;
use crate::error::{MqttError, ProtocolError};
use crate::packet::ControlPacket;
use embassy_net::tcp::{Error as TcpError, TcpSocket};
use embassy_time::{Duration, Timer};
use embedded_io_async::Write;
use futures::future::{Either, select};
use heapless::Vec;

/// A trait representing a byte-stream transport for MQTT packets.
#[allow(async_fn_in_trait)]
pub trait MqttTransport {
    /// The error type returned by the transport.
    type Error: core::fmt::Debug;

    /// Sends a buffer of data over the transport.
    async fn send(&mut self, buf: &[u8]) -> Result<(), Self::Error>;

    /// Receives data from the transport into a buffer.
    ///
    /// Returns the number of bytes read.
    async fn recv(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error>;
}

/// Non-blocking packet output used by the publication engine.
pub trait PacketSender {
    /// Offers a packet for sending. `true` means it was accepted whole; `false`
    /// means nothing was taken and the caller should retry later.
    fn send(&mut self, packet: &impl ControlPacket) -> bool;

    /// Asks for the connection to be torn down and rebuilt. The session must run
    /// its redelivery procedure once the new connection is up.
    fn reconnect(&mut self);
}

impl<S: PacketSender + ?Sized> PacketSender for &mut S {
    fn send(&mut self, packet: &impl ControlPacket) -> bool {
        (**self).send(packet)
    }

    fn reconnect(&mut self) {
        (**self).reconnect()
    }
}

/// A bounded send buffer of `SIZE` bytes.
///
/// Packets are accepted only if they fit completely. The owning connection task
/// drains it with [`TxBuffer::flush`] and polls
/// [`TxBuffer::take_reconnect_request`] to learn when to rebuild the connection.
#[derive(Debug, Default)]
pub struct TxBuffer<const SIZE: usize> {
    buf: Vec<u8, SIZE>,
    reconnect_requested: bool,
}

impl<const SIZE: usize> TxBuffer<SIZE> {
    pub fn new() -> Self {
        Self {
            buf: Vec::new(),
            reconnect_requested: false,
        }
    }

    /// Bytes accepted but not yet flushed.
    pub fn pending(&self) -> &[u8] {
        &self.buf
    }

    pub fn free_space(&self) -> usize {
        SIZE - self.buf.len()
    }

    /// Drops everything still queued, as when the connection goes down.
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Returns and resets the reconnect request flag.
    pub fn take_reconnect_request(&mut self) -> bool {
        core::mem::take(&mut self.reconnect_requested)
    }

    /// Writes all pending bytes to `transport`.
    ///
    /// On error the bytes stay queued; the caller is expected to reconnect,
    /// which clears them.
    pub async fn flush<T: MqttTransport>(&mut self, transport: &mut T) -> Result<(), T::Error> {
        if self.buf.is_empty() {
            return Ok(());
        }
        trace!("flushing {} bytes", self.buf.len());
        transport.send(&self.buf).await?;
        self.buf.clear();
        Ok(())
    }
}

impl<const SIZE: usize> PacketSender for TxBuffer<SIZE> {
    fn send(&mut self, packet: &impl ControlPacket) -> bool {
        let bytes = packet.as_bytes();
        if self.buf.extend_from_slice(bytes).is_err() {
            debug!(
                "tx buffer full, deferring {} ({} bytes, {} free)",
                packet.packet_type().as_str(),
                bytes.len(),
                self.free_space()
            );
            return false;
        }
        true
    }

    fn reconnect(&mut self) {
        self.reconnect_requested = true;
    }
}

/// Assembles one packet from `transport`, reading exactly as many bytes as the
/// codec asks for on each call.
///
/// A malformed or oversize packet is a connection fault; the stream position is
/// undefined afterwards and the connection must be rebuilt.
pub async fn read_packet<T: MqttTransport, const N: usize>(
    transport: &mut T,
) -> Result<Packet<N>, MqttError<T::Error>> {
    let mut packet = Packet::<N>::new();
    while !packet.is_complete() {
        if packet.is_too_big() {
            return Err(ProtocolError::PacketTooBig.into());
        }
        if packet.is_error() {
            return Err(ProtocolError::MalformedRemainingLength.into());
        }
        let n = transport
            .recv(packet.write_slot())
            .await
            .map_err(MqttError::Transport)?;
        if n == 0 {
            return Err(ProtocolError::ConnectionClosed.into());
        }
        packet.bytes_received(n);
    }
    packet.dump();
    Ok(packet)
}

/// Errors from [`TcpTransport`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpTransportError {
    Tcp(TcpError),
    /// No data arrived within the receive timeout.
    Timeout,
    /// The peer closed the connection.
    ConnectionClosed,
}

impl TcpTransportError {
    /// A receive timeout only means the broker was quiet; the stream is intact
    /// as long as no packet was half read.
    pub fn is_timeout(&self) -> bool {
        matches!(self, TcpTransportError::Timeout)
    }
}

/// Result of racing one socket read against the receive timer.
type ReadRace = Either<Result<usize, TcpError>, ()>;

/// Maps a finished read race onto what [`read_packet`] expects: a positive byte
/// count, or an error. A zero-length read becomes `ConnectionClosed`.
fn settle_read(race: ReadRace) -> Result<usize, TcpTransportError> {
    match race {
        Either::Left(Ok(0)) => {
            warn!("TCP connection closed by peer");
            Err(TcpTransportError::ConnectionClosed)
        }
        Either::Left(Ok(n)) => {
            trace!("TCP read: {} bytes", n);
            Ok(n)
        }
        Either::Left(Err(e)) => {
            warn!("TCP read error");
            Err(TcpTransportError::Tcp(e))
        }
        Either::Right(()) => {
            debug!("TCP read timeout");
            Err(TcpTransportError::Timeout)
        }
    }
}

/// [`MqttTransport`] over an `embassy-net` TCP socket.
///
/// Each `recv` gives up after the receive timeout. Pick a timeout above the
/// broker's keep-alive reply latency; a timeout inside [`read_packet`] leaves a
/// partial packet behind and the connection must then be rebuilt.
pub struct TcpTransport<'a> {
    socket: TcpSocket<'a>,
    timeout: Duration,
}

impl<'a> TcpTransport<'a> {
    /// Wraps an already connected socket.
    pub fn new(socket: TcpSocket<'a>, timeout: Duration) -> Self {
        Self { socket, timeout }
    }

    /// The underlying socket, for reconnecting or closing it.
    pub fn socket_mut(&mut self) -> &mut TcpSocket<'a> {
        &mut self.socket
    }

    pub fn into_socket(self) -> TcpSocket<'a> {
        self.socket
    }

    async fn read_with_timeout(&mut self, buf: &mut [u8]) -> Result<usize, TcpTransportError> {
        let read = self.socket.read(buf);
        let timer = Timer::after(self.timeout);

        let race = match select(core::pin::pin!(read), core::pin::pin!(timer)).await {
            Either::Left((result, _)) => Either::Left(result),
            Either::Right(((), _)) => Either::Right(()),
        };
        settle_read(race)
    }
}

impl<'a> MqttTransport for TcpTransport<'a> {
    type Error = TcpTransportError;

    async fn send(&mut self, buf: &[u8]) -> Result<(), Self::Error> {
        trace!("TCP TX ({} bytes)", buf.len());

        self.socket.write_all(buf).await.map_err(|e| {
            warn!("TCP write error");
            TcpTransportError::Tcp(e)
        })?;

        // Flush to ensure data is actually sent to the network
        self.socket.flush().await.map_err(TcpTransportError::Tcp)
    }

    async fn recv(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        self.read_with_timeout(buf).await
    }
}
