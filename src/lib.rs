//! # MQTT Client Engine for Embedded Systems
//!
//! `smolmqtt-client` is a `no_std`, allocation-free MQTT 3.1.1 client engine: an
//! incremental packet codec plus an outbound publication engine that enforces the
//! QoS 0, 1 and 2 delivery handshakes, including redelivery after a reconnect.
//!
//! ## Core Features
//!
//! - **`no_std` & `no_alloc`:** All buffers are `heapless`, sized by const generics.
//! - **Incremental decoding:** [`codec::Packet`] asks for exactly the bytes it needs
//!   next, so a stream is never over-read into the following packet.
//! - **Ordered delivery:** only the head of the publish queue is ever in flight;
//!   publishes complete strictly in the order they were queued.
//! - **Reconnect recovery:** an ack timeout forces a reconnect, after which the head
//!   publish (or its PUBREL) is redelivered with its original identifier.
//! - **Transport Agnostic:** the async [`transport::MqttTransport`] trait runs over
//!   any reliable stream; [`transport::TcpTransport`] covers `embassy-net`.
//!
//! ## Architecture
//!
//! The engine itself is synchronous. The connection task reads packets with
//! [`transport::read_packet`], hands them to [`session::Session::handle`], calls
//! [`session::Session::poll`] periodically and flushes the [`transport::TxBuffer`]
//! the session writes into.
//!
//! ```ignore
//! use smolmqtt_client::{QoS, Session, SystemClock, TxBuffer};
//!
//! let mut session = Session::<_, _, _, 4, 256>::new(TxBuffer::<512>::new(), SystemClock, handler);
//! session.publish("device/state", b"on", QoS::ExactlyOnce, true);
//! session.poll();
//! session.sender_mut().flush(&mut transport).await?;
//! ```
//!
//! ## Logging
//!
//! Enable exactly one of the `log`, `defmt` or `esp32-log` features to route the
//! crate's diagnostics. Without any of them logging compiles away.

#![cfg_attr(not(test), no_std)]

#[macro_use]
mod fmt;

pub mod codec;
pub mod error;
pub mod inflight;
pub mod packet;
pub mod packet_id;
pub mod publication;
pub mod session;
pub mod timer;
pub mod transport;
pub mod util;

// Re-export key types for easier access at the crate root.
pub use codec::{Packet, PacketType};
pub use error::{MqttError, ProtocolError};
pub use packet::{MqttPacket, Publish, QoS};
pub use packet_id::PacketIdAllocator;
pub use publication::{Publication, PublicationOptions};
pub use session::{InboundHandler, Session};
pub use timer::{Clock, SystemClock};
pub use transport::{MqttTransport, PacketSender, TcpTransport, TxBuffer, read_packet};
