// Copyright (c) 2019 Parity Technologies (UK) Ltd.
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! Websocket server [handshake].
//!
//! [handshake]: https://tools.ietf.org/html/rfc6455#section-4.2

use super::{
    extension_name, generate_accept_token, header_contains_token, split_comma_header, trim_ascii, MAX_NUM_HEADERS,
    SEC_WEBSOCKET_EXTENSIONS, SEC_WEBSOCKET_KEY, SEC_WEBSOCKET_PROTOCOL, SEC_WEBSOCKET_VERSION, WEBSOCKET_VERSION
};
use crate::connection::ConnectionState;
use crate::error::{LocalProtocolError, RemoteProtocolError};
use crate::events::{AcceptConnection, Event, Headers, RejectConnection, RejectData, Request};
use crate::extension::Extension;
use bytes::{Buf, BytesMut};
use http::StatusCode;
use log::debug;
use smallvec::SmallVec;
use std::collections::VecDeque;
use std::mem;

/// Server side of the opening handshake.
#[derive(Debug)]
pub(crate) struct ServerHandshake {
    state: ConnectionState,
    /// Bytes received from the client.
    buffer: BytesMut,
    /// The extensions this server supports.
    extensions: SmallVec<[Box<dyn Extension + Send>; 4]>,
    /// The parsed upgrade request, kept for validating the acceptance.
    request: Option<Request>,
    /// The client's `Sec-WebSocket-Key` value.
    ws_key: Option<Vec<u8>>,
    events: VecDeque<Event>
}

impl ServerHandshake {
    pub(crate) fn new(extensions: SmallVec<[Box<dyn Extension + Send>; 4]>) -> Self {
        ServerHandshake {
            state: ConnectionState::Connecting,
            buffer: BytesMut::new(),
            extensions,
            request: None,
            ws_key: None,
            events: VecDeque::new()
        }
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.state
    }

    pub(crate) fn next_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    pub(crate) fn take_extensions(&mut self) -> SmallVec<[Box<dyn Extension + Send>; 4]> {
        mem::take(&mut self.extensions)
    }

    pub(crate) fn take_trailing(&mut self) -> BytesMut {
        mem::take(&mut self.buffer)
    }

    pub(crate) fn receive_data(&mut self, data: Option<&[u8]>) -> Result<(), RemoteProtocolError> {
        match self.state {
            ConnectionState::Connecting => {
                let data = match data {
                    Some(d) => d,
                    None => {
                        self.state = ConnectionState::Closed;
                        return Err(RemoteProtocolError::new("connection closed during handshake", None))
                    }
                };
                self.buffer.extend_from_slice(data);
                self.parse_request()
            }
            _ => Ok(())
        }
    }

    /// Feed an upgrade request the embedder has already read by other means
    /// through the regular parsing path.
    pub(crate) fn initiate_upgrade(&mut self, headers: &Headers, target: &str) -> Result<(), RemoteProtocolError> {
        let mut bytes = BytesMut::new();
        bytes.extend_from_slice(b"GET ");
        bytes.extend_from_slice(target.as_bytes());
        bytes.extend_from_slice(b" HTTP/1.1\r\n");
        for (name, value) in headers {
            bytes.extend_from_slice(name.as_bytes());
            bytes.extend_from_slice(b": ");
            bytes.extend_from_slice(value.as_bytes());
            bytes.extend_from_slice(b"\r\n")
        }
        bytes.extend_from_slice(b"\r\n");
        self.receive_data(Some(&bytes))
    }

    /// Parse the client's upgrade request once it is complete.
    ///
    /// Note that a violation here leaves the state at CONNECTING so the
    /// embedder can still answer with the rejection the error hints at.
    fn parse_request(&mut self) -> Result<(), RemoteProtocolError> {
        if self.request.is_some() {
            // The request is already parsed; anything further is the start
            // of the frame stream.
            return Ok(())
        }

        let mut header_buf = [httparse::EMPTY_HEADER; MAX_NUM_HEADERS];
        let mut request = httparse::Request::new(&mut header_buf);

        let offset = match request.parse(&self.buffer) {
            Ok(httparse::Status::Complete(offset)) => offset,
            Ok(httparse::Status::Partial) => return Ok(()),
            Err(e) => return Err(reject_hint(format!("bad http request: {}", e)))
        };

        if request.method != Some("GET") {
            return Err(reject_hint("request method must be GET"))
        }
        if request.version != Some(1) {
            return Err(reject_hint("http version was not 1.1"))
        }
        let target = request.path.unwrap_or("/").to_string();

        let mut connection_ok = false;
        let mut upgrade_ok = false;
        let mut host: Option<String> = None;
        let mut key: Option<Vec<u8>> = None;
        let mut version: Option<Vec<u8>> = None;
        let mut subprotocols: Vec<String> = Vec::new();
        let mut extension_offers: Vec<String> = Vec::new();
        let mut extra_headers: Headers = Vec::new();

        for h in request.headers.iter() {
            if h.name.eq_ignore_ascii_case("Host") {
                host = Some(String::from_utf8_lossy(h.value).into_owned());
                continue
            }
            if h.name.eq_ignore_ascii_case(SEC_WEBSOCKET_EXTENSIONS) {
                extension_offers.extend(split_comma_header(h.value));
                continue
            }
            if h.name.eq_ignore_ascii_case(SEC_WEBSOCKET_PROTOCOL) {
                subprotocols.extend(split_comma_header(h.value));
                continue
            }
            if h.name.eq_ignore_ascii_case("Connection") {
                connection_ok = connection_ok || header_contains_token(h.value, "upgrade")
            } else if h.name.eq_ignore_ascii_case("Upgrade") {
                upgrade_ok = upgrade_ok || trim_ascii(h.value).eq_ignore_ascii_case(b"websocket")
            } else if h.name.eq_ignore_ascii_case(SEC_WEBSOCKET_KEY) {
                key = Some(h.value.to_vec())
            } else if h.name.eq_ignore_ascii_case(SEC_WEBSOCKET_VERSION) {
                version = Some(h.value.to_vec())
            }
            extra_headers.push((h.name.to_ascii_lowercase(), String::from_utf8_lossy(h.value).into_owned()))
        }

        if !connection_ok {
            return Err(reject_hint("missing header, 'Connection: Upgrade'"))
        }
        if version.as_deref() != Some(WEBSOCKET_VERSION.as_bytes()) {
            // A version mismatch gets the 426 + supported-version hint of
            // RFC 6455, section 4.2.2; a missing header is a plain 400.
            let status_code = if version.is_some() { 426 } else { 400 };
            return Err(RemoteProtocolError::new(
                format!("missing header, '{}: {}'", SEC_WEBSOCKET_VERSION, WEBSOCKET_VERSION),
                Some(Event::RejectConnection(RejectConnection {
                    status_code,
                    headers: vec![(SEC_WEBSOCKET_VERSION.into(), WEBSOCKET_VERSION.into())],
                    has_body: false
                }))
            ))
        }
        let key = match key {
            Some(k) => k,
            None => return Err(reject_hint(format!("missing header, '{}'", SEC_WEBSOCKET_KEY)))
        };
        if !upgrade_ok {
            return Err(reject_hint("missing header, 'Upgrade: websocket'"))
        }
        let host = match host {
            Some(h) => h,
            None => return Err(reject_hint("missing header, 'Host'"))
        };

        let event = Request { host, target, subprotocols, extensions: extension_offers, extra_headers };
        self.ws_key = Some(key);
        self.request = Some(event.clone());
        self.buffer.advance(offset);
        self.events.push_back(Event::Request(event));
        Ok(())
    }

    /// Serialize the `101 Switching Protocols` response accepting the
    /// stored request.
    pub(crate) fn accept(&mut self, event: &AcceptConnection) -> Result<BytesMut, LocalProtocolError> {
        if self.state != ConnectionState::Connecting {
            return Err(LocalProtocolError::new(format!("connection cannot be accepted in state {}", self.state)))
        }
        let (request, key) = match (&self.request, &self.ws_key) {
            (Some(r), Some(k)) => (r, k),
            _ => return Err(LocalProtocolError::new("no handshake request received yet"))
        };

        if let Some(sp) = &event.subprotocol {
            if !request.subprotocols.iter().any(|p| p == sp) {
                return Err(LocalProtocolError::new(format!("unexpected subprotocol {}", sp)))
            }
        }

        let mut accepts = Vec::new();
        for offer in &request.extensions {
            // A client may send fallback offers for the same extension;
            // the first accepted one wins.
            let name = extension_name(offer);
            if let Some(ext) = self.extensions.iter_mut().find(|e| e.name() == name && !e.is_enabled()) {
                if let Some(params) = ext.accept(offer) {
                    debug!("using extension: {}", name);
                    if params.is_empty() {
                        accepts.push(name.to_string())
                    } else {
                        accepts.push(format!("{}; {}", name, params))
                    }
                }
            }
        }

        let token = generate_accept_token(key);

        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"HTTP/1.1 101 Switching Protocols\r\n");
        buf.extend_from_slice(b"Upgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: ");
        buf.extend_from_slice(token.as_bytes());
        buf.extend_from_slice(b"\r\n");
        if let Some(sp) = &event.subprotocol {
            buf.extend_from_slice(b"Sec-WebSocket-Protocol: ");
            buf.extend_from_slice(sp.as_bytes());
            buf.extend_from_slice(b"\r\n")
        }
        if !accepts.is_empty() {
            buf.extend_from_slice(b"Sec-WebSocket-Extensions: ");
            buf.extend_from_slice(accepts.join(", ").as_bytes());
            buf.extend_from_slice(b"\r\n")
        }
        for (name, value) in &event.extra_headers {
            buf.extend_from_slice(name.as_bytes());
            buf.extend_from_slice(b": ");
            buf.extend_from_slice(value.as_bytes());
            buf.extend_from_slice(b"\r\n")
        }
        buf.extend_from_slice(b"\r\n");

        self.state = ConnectionState::Open;
        Ok(buf)
    }

    /// Serialize a rejection response.
    pub(crate) fn reject(&mut self, event: &RejectConnection) -> Result<BytesMut, LocalProtocolError> {
        if self.state != ConnectionState::Connecting {
            return Err(LocalProtocolError::new(format!("connection cannot be rejected in state {}", self.state)))
        }
        let status = StatusCode::from_u16(event.status_code)
            .map_err(|_| LocalProtocolError::new(format!("invalid status code {}", event.status_code)))?;

        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"HTTP/1.1 ");
        buf.extend_from_slice(status.as_str().as_bytes());
        buf.extend_from_slice(b" ");
        buf.extend_from_slice(status.canonical_reason().unwrap_or("Unknown").as_bytes());
        buf.extend_from_slice(b"\r\n");
        for (name, value) in &event.headers {
            buf.extend_from_slice(name.as_bytes());
            buf.extend_from_slice(b": ");
            buf.extend_from_slice(value.as_bytes());
            buf.extend_from_slice(b"\r\n")
        }
        if !event.has_body {
            buf.extend_from_slice(b"Content-Length: 0\r\n")
        }
        buf.extend_from_slice(b"\r\n");

        self.state = if event.has_body { ConnectionState::Rejecting } else { ConnectionState::Closed };
        Ok(buf)
    }

    /// Serialize a chunk of the rejection response body.
    pub(crate) fn reject_data(&mut self, event: &RejectData) -> Result<BytesMut, LocalProtocolError> {
        if self.state != ConnectionState::Rejecting {
            return Err(LocalProtocolError::new(format!("cannot send rejection data in state {}", self.state)))
        }
        if event.body_finished {
            self.state = ConnectionState::Closed
        }
        Ok(event.data.clone())
    }
}

/// A remote protocol error suggesting a plain 400 rejection.
fn reject_hint(message: impl Into<String>) -> RemoteProtocolError {
    RemoteProtocolError::new(message, Some(Event::RejectConnection(RejectConnection::default())))
}
