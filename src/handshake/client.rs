// Copyright (c) 2019 Parity Technologies (UK) Ltd.
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! Websocket client [handshake].
//!
//! [handshake]: https://tools.ietf.org/html/rfc6455#section-4.1

use super::{
    append_extension_offers, extension_name, generate_accept_token, header_contains_token, split_comma_header,
    trim_ascii, MAX_NUM_HEADERS, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_EXTENSIONS, SEC_WEBSOCKET_PROTOCOL
};
use crate::connection::ConnectionState;
use crate::error::{LocalProtocolError, RemoteProtocolError};
use crate::events::{AcceptConnection, Event, Headers, RejectConnection, RejectData, Request};
use crate::extension::Extension;
use base64::prelude::*;
use bytes::{Buf, BytesMut};
use log::debug;
use rand::RngCore;
use smallvec::SmallVec;
use std::collections::VecDeque;
use std::mem;

/// Client side of the opening handshake.
#[derive(Debug)]
pub(crate) struct ClientHandshake {
    state: ConnectionState,
    /// Bytes received from the server.
    buffer: BytesMut,
    /// The base64 encoded nonce sent as `Sec-WebSocket-Key`.
    nonce: String,
    /// The request we sent, for validating the server's choices.
    request: Option<Request>,
    /// The extensions whose offers were included in the request.
    extensions: SmallVec<[Box<dyn Extension + Send>; 4]>,
    events: VecDeque<Event>,
    /// Body bytes of a rejection response still outstanding.
    /// `None` means the body runs until end of stream.
    reject_remaining: Option<u64>
}

impl ClientHandshake {
    pub(crate) fn new(extensions: SmallVec<[Box<dyn Extension + Send>; 4]>) -> Self {
        ClientHandshake {
            state: ConnectionState::Connecting,
            buffer: BytesMut::new(),
            nonce: String::new(),
            request: None,
            extensions,
            events: VecDeque::new(),
            reject_remaining: None
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

    /// Serialize the upgrade request.
    pub(crate) fn send_request(
        &mut self,
        request: &Request,
        rng: &mut dyn RngCore
    ) -> Result<BytesMut, LocalProtocolError> {
        if self.request.is_some() {
            return Err(LocalProtocolError::new("handshake request already sent"))
        }

        let mut nonce = [0_u8; 16];
        rng.fill_bytes(&mut nonce);
        self.nonce = BASE64_STANDARD.encode(nonce);

        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"GET ");
        buf.extend_from_slice(request.target.as_bytes());
        buf.extend_from_slice(b" HTTP/1.1");
        buf.extend_from_slice(b"\r\nHost: ");
        buf.extend_from_slice(request.host.as_bytes());
        buf.extend_from_slice(b"\r\nUpgrade: websocket\r\nConnection: Upgrade");
        buf.extend_from_slice(b"\r\nSec-WebSocket-Key: ");
        buf.extend_from_slice(self.nonce.as_bytes());
        buf.extend_from_slice(b"\r\nSec-WebSocket-Version: 13");
        if !request.subprotocols.is_empty() {
            buf.extend_from_slice(b"\r\nSec-WebSocket-Protocol: ");
            buf.extend_from_slice(request.subprotocols.join(", ").as_bytes())
        }
        append_extension_offers(&self.extensions, &mut buf);
        for (name, value) in &request.extra_headers {
            buf.extend_from_slice(b"\r\n");
            buf.extend_from_slice(name.as_bytes());
            buf.extend_from_slice(b": ");
            buf.extend_from_slice(value.as_bytes())
        }
        buf.extend_from_slice(b"\r\n\r\n");

        self.request = Some(request.clone());
        Ok(buf)
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
                self.parse_response()
            }
            ConnectionState::Rejecting => {
                self.feed_reject_body(data);
                Ok(())
            }
            _ => Ok(())
        }
    }

    /// Parse the server's handshake response once it is complete.
    fn parse_response(&mut self) -> Result<(), RemoteProtocolError> {
        let mut header_buf = [httparse::EMPTY_HEADER; MAX_NUM_HEADERS];
        let mut response = httparse::Response::new(&mut header_buf);

        let offset = match response.parse(&self.buffer) {
            Ok(httparse::Status::Complete(offset)) => offset,
            Ok(httparse::Status::Partial) => return Ok(()),
            Err(e) => {
                self.state = ConnectionState::Closed;
                return Err(RemoteProtocolError::new(format!("bad http response: {}", e), None))
            }
        };

        if response.version != Some(1) {
            self.state = ConnectionState::Closed;
            return Err(RemoteProtocolError::new("http version was not 1.1", None))
        }

        let status_code = response.code.unwrap_or(0);
        if status_code != 101 {
            // The server rejected the upgrade; surface the response and then
            // its body as events.
            let headers: Headers = response
                .headers
                .iter()
                .map(|h| (h.name.to_ascii_lowercase(), String::from_utf8_lossy(h.value).into_owned()))
                .collect();
            self.reject_remaining = headers
                .iter()
                .find(|(name, _)| name == "content-length")
                .and_then(|(_, value)| value.parse().ok());
            debug!("handshake rejected with status {}", status_code);
            self.events.push_back(Event::RejectConnection(RejectConnection {
                status_code,
                headers,
                has_body: true
            }));
            self.state = ConnectionState::Rejecting;
            self.buffer.advance(offset);
            self.feed_reject_body(Some(&[]));
            return Ok(())
        }

        let mut connection_ok = false;
        let mut upgrade_ok = false;
        let mut accept: Option<Vec<u8>> = None;
        let mut subprotocol: Option<String> = None;
        let mut accepted_extensions: Vec<String> = Vec::new();
        let mut extra_headers: Headers = Vec::new();

        for h in response.headers.iter() {
            if h.name.eq_ignore_ascii_case("Connection") {
                connection_ok = connection_ok || header_contains_token(h.value, "upgrade")
            } else if h.name.eq_ignore_ascii_case("Upgrade") {
                upgrade_ok = upgrade_ok || trim_ascii(h.value).eq_ignore_ascii_case(b"websocket")
            } else if h.name.eq_ignore_ascii_case(SEC_WEBSOCKET_ACCEPT) {
                accept = Some(h.value.to_vec())
            } else if h.name.eq_ignore_ascii_case(SEC_WEBSOCKET_PROTOCOL) {
                subprotocol = Some(String::from_utf8_lossy(h.value).into_owned())
            } else if h.name.eq_ignore_ascii_case(SEC_WEBSOCKET_EXTENSIONS) {
                accepted_extensions.extend(split_comma_header(h.value))
            } else {
                extra_headers.push((h.name.to_ascii_lowercase(), String::from_utf8_lossy(h.value).into_owned()))
            }
        }

        if !connection_ok {
            self.state = ConnectionState::Closed;
            return Err(RemoteProtocolError::new("missing header, 'Connection: Upgrade'", None))
        }
        if !upgrade_ok {
            self.state = ConnectionState::Closed;
            return Err(RemoteProtocolError::new("missing header, 'Upgrade: websocket'", None))
        }
        let expected = generate_accept_token(self.nonce.as_bytes());
        if accept.as_deref() != Some(expected.as_bytes()) {
            self.state = ConnectionState::Closed;
            return Err(RemoteProtocolError::new("bad accept token", None))
        }
        if let Some(sp) = &subprotocol {
            let offered = self.request.as_ref().map_or(false, |r| r.subprotocols.iter().any(|p| p == sp));
            if !offered {
                self.state = ConnectionState::Closed;
                return Err(RemoteProtocolError::new(format!("unrecognized subprotocol {}", sp), None))
            }
        }
        for accepted in &accepted_extensions {
            let name = extension_name(accepted);
            match self.extensions.iter_mut().find(|e| e.name() == name) {
                Some(ext) => {
                    debug!("using extension: {}", name);
                    ext.finalize(accepted)
                }
                None => {
                    self.state = ConnectionState::Closed;
                    return Err(RemoteProtocolError::new(format!("unrecognized extension {}", name), None))
                }
            }
        }

        let extensions = self.extensions.iter().filter(|e| e.is_enabled()).map(|e| e.name().to_string()).collect();

        self.buffer.advance(offset);
        self.state = ConnectionState::Open;
        self.events.push_back(Event::AcceptConnection(AcceptConnection {
            subprotocol,
            extensions,
            extra_headers
        }));
        Ok(())
    }

    /// Turn buffered bytes into rejection body chunks. `None` marks the end
    /// of the stream.
    fn feed_reject_body(&mut self, data: Option<&[u8]>) {
        if let Some(data) = data {
            self.buffer.extend_from_slice(data)
        }
        if !self.buffer.is_empty() {
            let take = match self.reject_remaining {
                Some(n) => (n as usize).min(self.buffer.len()),
                None => self.buffer.len()
            };
            if take > 0 {
                let chunk = self.buffer.split_to(take);
                if let Some(n) = &mut self.reject_remaining {
                    *n -= chunk.len() as u64
                }
                self.events.push_back(Event::RejectData(RejectData { data: chunk, body_finished: false }))
            }
        }
        let finished = match self.reject_remaining {
            Some(0) => true,
            _ => data.is_none()
        };
        if finished {
            self.events.push_back(Event::RejectData(RejectData { data: BytesMut::new(), body_finished: true }));
            self.state = ConnectionState::Closed
        }
    }
}
