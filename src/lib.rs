// Copyright (c) 2019 Parity Technologies (UK) Ltd.
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! A sans-I/O implementation of the [RFC 6455][rfc6455] websocket protocol,
//! including the permessage-deflate extension ([RFC 7692][rfc7692]).
//!
//! The crate contains no I/O, no timers and no threads. A [`Connection`] is a
//! pure state machine driven from the outside:
//!
//! - bytes read from the peer are handed over with
//!   [`Connection::receive_data`],
//! - protocol activity triggered by those bytes is drained as [`Event`]s via
//!   [`Connection::events`],
//! - commands (handshake answers, messages, pings, close) are issued with
//!   [`Connection::send`], which returns the bytes to write to the peer.
//!
//! The opening HTTP upgrade handshake, the frame protocol (masking,
//! fragmentation, UTF-8 validation, close semantics) and the extension
//! pipeline all live behind this byte-in/byte-out interface, so the engine
//! works identically on blocking sockets, async runtimes or in-memory pipes.
//!
//! The engine never replies to anything on its own. Received PINGs and CLOSEs
//! are surfaced as events and answered by the embedder, e.g. via
//! [`events::Ping::response`] and [`events::CloseConnection::response`].
//!
//! [rfc6455]: https://tools.ietf.org/html/rfc6455
//! [rfc7692]: https://tools.ietf.org/html/rfc7692

#![forbid(unsafe_code)]

pub mod base;
pub mod close;
pub mod connection;
pub mod error;
pub mod events;
pub mod extension;

mod buffer;
mod frame;
mod handshake;
mod utf8;

pub use connection::{Builder, Connection, ConnectionState, Events, Mode};
pub use error::{Error, LocalProtocolError, RemoteProtocolError};
pub use events::Event;

/// A boxed error produced by an [`extension::Extension`].
pub type BoxedError = Box<dyn std::error::Error + Send + 'static>;
