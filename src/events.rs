// Copyright (c) 2019 Parity Technologies (UK) Ltd.
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! The event and command surface of a connection.
//!
//! The same types describe both directions: events produced by
//! [`Connection::events`](crate::Connection::events) report what the peer
//! did, and the identical values passed to
//! [`Connection::send`](crate::Connection::send) are commands serialized for
//! the peer.

use crate::close::CloseReason;
use bytes::BytesMut;

/// HTTP headers as name/value pairs.
pub type Headers = Vec<(String, String)>;

/// Events produced by, and commands accepted by, a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A websocket upgrade request.
    Request(Request),
    /// The acceptance of an upgrade request.
    AcceptConnection(AcceptConnection),
    /// The rejection of an upgrade request.
    RejectConnection(RejectConnection),
    /// A chunk of the rejection response body.
    RejectData(RejectData),
    /// A text message frame.
    TextMessage(TextMessage),
    /// A binary message frame.
    BytesMessage(BytesMessage),
    /// A PING control frame.
    Ping(Ping),
    /// A PONG control frame.
    Pong(Pong),
    /// A CLOSE control frame.
    CloseConnection(CloseConnection)
}

/// The HTTP upgrade request beginning a websocket connection.
///
/// Emitted by a server connection when the client's handshake request has
/// been received; sent by a client connection to initiate the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Request {
    /// The hostname (HTTP `Host` header value).
    ///
    /// Sent verbatim; internationalized hostnames must be punycoded by
    /// the embedder.
    pub host: String,
    /// The request target (path and query string).
    pub target: String,
    /// The proposed subprotocols, in order of preference.
    pub subprotocols: Vec<String>,
    /// The proposed extensions as raw offer strings.
    ///
    /// Populated when the request was received from a peer. When sending,
    /// offers are generated from the extensions configured on the
    /// [`Builder`](crate::Builder) instead and this field is ignored.
    pub extensions: Vec<String>,
    /// Additional request headers (excluding the websocket-specific ones).
    pub extra_headers: Headers
}

impl Request {
    /// Create a new upgrade request for some host and target.
    pub fn new(host: impl Into<String>, target: impl Into<String>) -> Self {
        Request {
            host: host.into(),
            target: target.into(),
            .. Request::default()
        }
    }
}

/// The acceptance of a websocket upgrade request.
///
/// Emitted by a client connection when the server answered with `101
/// Switching Protocols`; sent by a server connection to accept a request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AcceptConnection {
    /// The agreed subprotocol, if any. When sending, it must be one the
    /// client proposed.
    pub subprotocol: Option<String>,
    /// The names of the extensions in use after negotiation.
    pub extensions: Vec<String>,
    /// Additional response headers.
    pub extra_headers: Headers
}

/// The rejection of a websocket upgrade request.
///
/// A rejection with `has_body` set is followed by one or more
/// [`RejectData`] events/commands, the last of which has `body_finished`
/// set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectConnection {
    /// The HTTP response status code.
    pub status_code: u16,
    /// The response headers.
    pub headers: Headers,
    /// Whether a response body follows.
    pub has_body: bool
}

impl Default for RejectConnection {
    fn default() -> Self {
        RejectConnection { status_code: 400, headers: Vec::new(), has_body: false }
    }
}

/// A chunk of a rejection response body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectData {
    /// The raw body bytes.
    pub data: BytesMut,
    /// True on the final chunk.
    pub body_finished: bool
}

/// A text message frame.
///
/// `data` holds one frame's worth of payload, not necessarily a complete
/// message; a fragmented message arrives as several events, the last of
/// which has `message_finished` set. Fragment boundaries may fall inside a
/// codepoint, in which case the dangling bytes are carried over into the
/// next event's `data`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextMessage {
    /// The decoded payload chunk.
    pub data: String,
    /// True when this chunk ends a wire frame.
    pub frame_finished: bool,
    /// True when this chunk ends the message.
    pub message_finished: bool
}

impl TextMessage {
    /// A self-contained, single-frame text message.
    pub fn new(data: impl Into<String>) -> Self {
        TextMessage { data: data.into(), frame_finished: true, message_finished: true }
    }
}

/// A binary message frame. See [`TextMessage`] for the fragmentation
/// semantics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BytesMessage {
    /// The payload chunk.
    pub data: BytesMut,
    /// True when this chunk ends a wire frame.
    pub frame_finished: bool,
    /// True when this chunk ends the message.
    pub message_finished: bool
}

impl BytesMessage {
    /// A self-contained, single-frame binary message.
    pub fn new(data: impl Into<BytesMut>) -> Self {
        BytesMessage { data: data.into(), frame_finished: true, message_finished: true }
    }
}

/// A PING control frame.
///
/// The engine does not answer pings by itself; embedders wanting the usual
/// behaviour send [`Ping::response`] back.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Ping {
    /// The application payload (at most 125 bytes on the wire).
    pub payload: BytesMut
}

impl Ping {
    /// The PONG answering this ping.
    pub fn response(&self) -> Pong {
        Pong { payload: self.payload.clone() }
    }
}

/// A PONG control frame, solicited or not.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Pong {
    /// The application payload (at most 125 bytes on the wire).
    pub payload: BytesMut
}

/// A CLOSE control frame.
///
/// Emitted when the peer initiates the closing handshake (or when parsing
/// fails terminally); sent to initiate or complete it. The engine does not
/// reply to a CLOSE by itself; embedders send [`CloseConnection::response`]
/// to complete the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseConnection {
    /// The close status code.
    pub code: CloseReason,
    /// An optional textual reason.
    pub reason: Option<String>
}

impl CloseConnection {
    /// The CLOSE completing the closing handshake.
    pub fn response(&self) -> CloseConnection {
        self.clone()
    }
}
