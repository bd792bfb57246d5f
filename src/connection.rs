// Copyright (c) 2019 Parity Technologies (UK) Ltd.
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! The connection façade unifying the handshake and frame phases behind a
//! single byte-in / event-out / command-in / byte-out interface.

use crate::close::CloseReason;
use crate::error::{Error, LocalProtocolError};
use crate::events::{BytesMessage, CloseConnection, Event, Headers, Ping, Pong, TextMessage};
use crate::extension::Extension;
use crate::frame::{Frame, FrameCodec, Payload};
use crate::handshake::Handshake;
use bytes::BytesMut;
use log::debug;
use rand::rngs::OsRng;
use rand::RngCore;
use smallvec::SmallVec;
use std::fmt;

/// Is the connection used by a client or server?
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Mode {
    /// Client-side of a connection (implies masking of payload data).
    Client,
    /// Server-side of a connection.
    Server
}

impl Mode {
    /// Is this the client side?
    pub fn is_client(self) -> bool {
        matches!(self, Mode::Client)
    }

    /// Is this the server side?
    pub fn is_server(self) -> bool {
        !self.is_client()
    }
}

/// The lifecycle state of a connection.
///
/// States move monotonically towards `Closed`, except for the handshake
/// edges `Connecting` → `Open` and `Connecting` → `Rejecting` → `Closed`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// The opening handshake is in progress.
    Connecting,
    /// The connection is established.
    Open,
    /// The peer sent a CLOSE frame; ours is outstanding.
    RemoteClosing,
    /// We sent a CLOSE frame; the peer's is outstanding.
    LocalClosing,
    /// The connection is closed.
    Closed,
    /// The upgrade request was rejected; the rejection body is in transit.
    Rejecting
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConnectionState::Connecting => f.write_str("CONNECTING"),
            ConnectionState::Open => f.write_str("OPEN"),
            ConnectionState::RemoteClosing => f.write_str("REMOTE_CLOSING"),
            ConnectionState::LocalClosing => f.write_str("LOCAL_CLOSING"),
            ConnectionState::Closed => f.write_str("CLOSED"),
            ConnectionState::Rejecting => f.write_str("REJECTING")
        }
    }
}

/// A connection builder.
///
/// Allows configuring extensions and the entropy source before creating the
/// [`Connection`].
pub struct Builder {
    mode: Mode,
    extensions: SmallVec<[Box<dyn Extension + Send>; 4]>,
    rng: Box<dyn RngCore + Send>
}

impl Builder {
    /// Create a new builder for the given mode.
    pub fn new(mode: Mode) -> Self {
        Builder {
            mode,
            extensions: SmallVec::new(),
            rng: Box::new(OsRng)
        }
    }

    /// Add an extension to negotiate during the handshake.
    pub fn add_extension(&mut self, extension: Box<dyn Extension + Send>) -> &mut Self {
        self.extensions.push(extension);
        self
    }

    /// Override the source of randomness used for masking keys and the
    /// handshake nonce.
    ///
    /// The default is the operating system's entropy source. Anything other
    /// than a cryptographically secure generator compromises the masking
    /// required by RFC 6455, section 5.3; this is meant for deterministic
    /// tests.
    pub fn set_rng(&mut self, rng: Box<dyn RngCore + Send>) -> &mut Self {
        self.rng = rng;
        self
    }

    /// Create the configured [`Connection`].
    pub fn finish(self) -> Connection {
        Connection {
            mode: self.mode,
            state: ConnectionState::Connecting,
            handshake: Handshake::new(self.mode, self.extensions),
            codec: None,
            events: std::collections::VecDeque::new(),
            rng: self.rng
        }
    }
}

impl fmt::Debug for Builder {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Builder")
            .field("mode", &self.mode)
            .field("extensions", &self.extensions)
            .finish()
    }
}

/// A sans-I/O websocket connection.
///
/// The connection owns the handshake and, once established, the frame
/// codec. Bytes received from the peer go into
/// [`receive_data`](Connection::receive_data), resulting protocol activity
/// is drained with [`events`](Connection::events), and commands passed to
/// [`send`](Connection::send) come back as bytes to write to the peer.
pub struct Connection {
    mode: Mode,
    state: ConnectionState,
    handshake: Handshake,
    codec: Option<FrameCodec>,
    /// Events synthesized by the connection itself (e.g. an abnormal
    /// closure when the transport drops).
    events: std::collections::VecDeque<Event>,
    rng: Box<dyn RngCore + Send>
}

impl Connection {
    /// Create a connection with default configuration.
    pub fn new(mode: Mode) -> Self {
        Builder::new(mode).finish()
    }

    /// A [`Builder`] for a connection with extensions or a custom entropy
    /// source.
    pub fn builder(mode: Mode) -> Builder {
        Builder::new(mode)
    }

    /// The connection mode.
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// The current connection state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Feed an upgrade request the embedder has already read by other means
    /// (server only). The resulting [`Request`](crate::events::Request)
    /// event is available via [`events`](Connection::events).
    pub fn initiate_upgrade_connection(&mut self, headers: &Headers, target: &str) -> Result<(), Error> {
        if self.mode.is_client() {
            return Err(LocalProtocolError::new("cannot initiate an upgrade connection as the client").into())
        }
        if self.state != ConnectionState::Connecting {
            return Err(LocalProtocolError::new(format!("cannot initiate an upgrade in state {}", self.state)).into())
        }
        self.handshake.initiate_upgrade(headers, target).map_err(Error::Remote)
    }

    /// Apply an event to the connection, producing the bytes to transmit.
    ///
    /// The bytes reflect the connection state after the event; an error
    /// leaves the state unchanged and produces no bytes.
    pub fn send(&mut self, event: Event) -> Result<BytesMut, Error> {
        match event {
            Event::Request(request) => {
                self.expect_state(ConnectionState::Connecting, "a handshake request")?;
                let bytes = self.handshake.send_request(&request, &mut *self.rng)?;
                Ok(bytes)
            }
            Event::AcceptConnection(accept) => {
                self.expect_state(ConnectionState::Connecting, "a handshake acceptance")?;
                let bytes = self.handshake.accept(&accept)?;
                self.sync_handshake_state();
                Ok(bytes)
            }
            Event::RejectConnection(reject) => {
                self.expect_state(ConnectionState::Connecting, "a handshake rejection")?;
                let bytes = self.handshake.reject(&reject)?;
                self.sync_handshake_state();
                Ok(bytes)
            }
            Event::RejectData(data) => {
                self.expect_state(ConnectionState::Rejecting, "a rejection body")?;
                let bytes = self.handshake.reject_data(&data)?;
                self.sync_handshake_state();
                Ok(bytes)
            }
            Event::TextMessage(m) => {
                let payload = BytesMut::from(m.data.as_bytes());
                self.send_message(crate::base::OpCode::Text, payload, m.message_finished)
            }
            Event::BytesMessage(m) => self.send_message(crate::base::OpCode::Binary, m.data, m.message_finished),
            Event::Ping(Ping { payload }) => {
                self.expect_state(ConnectionState::Open, "a PING")?;
                let (codec, rng) = self.frame_parts()?;
                Ok(codec.ping(payload, rng)?)
            }
            Event::Pong(Pong { payload }) => {
                self.expect_state(ConnectionState::Open, "a PONG")?;
                let (codec, rng) = self.frame_parts()?;
                Ok(codec.pong(payload, rng)?)
            }
            Event::CloseConnection(close) => self.send_close(close)
        }
    }

    /// Pass bytes received from the peer to the connection; protocol
    /// activity they trigger is available via [`events`](Connection::events).
    ///
    /// `None` signals that the transport was closed by the peer. If that
    /// happens before the closing handshake completed, a
    /// [`CloseConnection`] event with code 1006 is synthesized.
    pub fn receive_data(&mut self, data: Option<&[u8]>) -> Result<(), Error> {
        match self.state {
            ConnectionState::Closed => match data {
                Some(_) => Err(LocalProtocolError::new("data received after the connection closed").into()),
                None => Ok(())
            },
            ConnectionState::Connecting | ConnectionState::Rejecting => {
                let result = self.handshake.receive_data(data);
                self.sync_handshake_state();
                result.map_err(Error::Remote)
            }
            ConnectionState::Open | ConnectionState::LocalClosing | ConnectionState::RemoteClosing => match data {
                Some(bytes) => {
                    if let Some(codec) = &mut self.codec {
                        codec.receive_bytes(bytes)
                    }
                    Ok(())
                }
                None => {
                    // "If _The WebSocket Connection is Closed_ and no Close
                    // control frame was received by the endpoint [...] _The
                    // WebSocket Connection Close Code_ is considered to be
                    // 1006."
                    self.events.push_back(Event::CloseConnection(CloseConnection {
                        code: CloseReason::AbnormalClosure,
                        reason: None
                    }));
                    self.state = ConnectionState::Closed;
                    Ok(())
                }
            }
        }
    }

    /// An iterator draining the events triggered by peer activity, in the
    /// order the peer sent them. Iteration drives parsing forward and ends
    /// when more bytes are needed.
    ///
    /// A frame-level protocol violation by the peer surfaces as a terminal
    /// [`CloseConnection`] event carrying the violation's close code; the
    /// embedder is expected to answer it with a CLOSE command.
    pub fn events(&mut self) -> Events<'_> {
        Events { connection: self }
    }

    fn send_message(&mut self, opcode: crate::base::OpCode, payload: BytesMut, fin: bool) -> Result<BytesMut, Error> {
        self.expect_state(ConnectionState::Open, "message data")?;
        let (codec, rng) = self.frame_parts()?;
        Ok(codec.send_data(opcode, payload, fin, rng)?)
    }

    fn send_close(&mut self, close: CloseConnection) -> Result<BytesMut, Error> {
        match self.state {
            ConnectionState::Open | ConnectionState::RemoteClosing => {
                let (codec, rng) = self.frame_parts()?;
                let bytes = codec.close(Some(close.code), close.reason.as_deref(), rng)?;
                self.state = if self.state == ConnectionState::Open {
                    ConnectionState::LocalClosing
                } else {
                    ConnectionState::Closed
                };
                Ok(bytes)
            }
            state => Err(LocalProtocolError::new(format!("cannot send a CLOSE in state {}", state)).into())
        }
    }

    fn frame_parts(&mut self) -> Result<(&mut FrameCodec, &mut dyn RngCore), LocalProtocolError> {
        match &mut self.codec {
            Some(codec) => Ok((codec, &mut *self.rng)),
            None => Err(LocalProtocolError::new("the connection is not open"))
        }
    }

    fn expect_state(&self, expected: ConnectionState, what: &str) -> Result<(), LocalProtocolError> {
        if self.state != expected {
            return Err(LocalProtocolError::new(format!("cannot send {} in state {}", what, self.state)))
        }
        Ok(())
    }

    /// Mirror the handshake's state and enter the frame phase when it
    /// reports the connection open.
    fn sync_handshake_state(&mut self) {
        if self.codec.is_some() {
            return
        }
        let state = self.handshake.state();
        if state == ConnectionState::Open {
            let mut codec = FrameCodec::new(self.mode, self.handshake.take_extensions());
            let trailing = self.handshake.take_trailing();
            if !trailing.is_empty() {
                codec.receive_bytes(&trailing)
            }
            self.codec = Some(codec)
        }
        self.state = state
    }

    fn frame_to_event(&mut self, frame: Frame) -> Event {
        match frame.payload {
            Payload::Text(data) => Event::TextMessage(TextMessage {
                data,
                frame_finished: frame.frame_finished,
                message_finished: frame.message_finished
            }),
            Payload::Bytes(data) => match frame.opcode {
                crate::base::OpCode::Ping => Event::Ping(Ping { payload: data }),
                crate::base::OpCode::Pong => Event::Pong(Pong { payload: data }),
                _ => Event::BytesMessage(BytesMessage {
                    data,
                    frame_finished: frame.frame_finished,
                    message_finished: frame.message_finished
                })
            },
            Payload::Close(code, reason) => {
                self.state = match self.state {
                    ConnectionState::LocalClosing => ConnectionState::Closed,
                    _ => ConnectionState::RemoteClosing
                };
                Event::CloseConnection(CloseConnection { code, reason })
            }
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Connection")
            .field("mode", &self.mode)
            .field("state", &self.state)
            .field("handshake", &self.handshake)
            .field("codec", &self.codec)
            .finish()
    }
}

/// Iterator over the events of a [`Connection`]. See
/// [`Connection::events`].
#[derive(Debug)]
pub struct Events<'a> {
    connection: &'a mut Connection
}

impl Iterator for Events<'_> {
    type Item = Event;

    fn next(&mut self) -> Option<Event> {
        let connection = &mut *self.connection;
        if let Some(event) = connection.events.pop_front() {
            return Some(event)
        }
        if let Some(event) = connection.handshake.next_event() {
            return Some(event)
        }
        let parsed = connection.codec.as_mut()?.next_frame();
        match parsed {
            Ok(Some(frame)) => Some(connection.frame_to_event(frame)),
            Ok(None) => None,
            Err(e) => {
                debug!("parse failure: {}", e);
                // Let the embedder answer with the CLOSE this event asks
                // for; its `send` completes the transition to CLOSED.
                connection.state = match connection.state {
                    ConnectionState::LocalClosing => ConnectionState::Closed,
                    _ => ConnectionState::RemoteClosing
                };
                Some(Event::CloseConnection(CloseConnection {
                    code: e.code,
                    reason: Some(e.message)
                }))
            }
        }
    }
}
