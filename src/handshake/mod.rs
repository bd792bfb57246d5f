// Copyright (c) 2019 Parity Technologies (UK) Ltd.
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! Websocket [handshake] state machines.
//!
//! The handshake is an HTTP/1.1 upgrade exchange. The [`Handshake`] type
//! dispatches to the client or server side machine depending on the
//! connection mode; both consume received bytes, produce handshake events
//! and serialize the commands valid for their role.
//!
//! [handshake]: https://tools.ietf.org/html/rfc6455#section-4

pub(crate) mod client;
pub(crate) mod server;

use crate::connection::{ConnectionState, Mode};
use crate::error::{LocalProtocolError, RemoteProtocolError};
use crate::events::{AcceptConnection, Event, Headers, RejectConnection, RejectData, Request};
use crate::extension::Extension;
use base64::prelude::*;
use bytes::BytesMut;
use sha1::{Digest, Sha1};
use smallvec::SmallVec;

// Defined in RFC 6455 and used to generate the `Sec-WebSocket-Accept`
// header value in the server handshake response.
const ACCEPT_GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

// How many HTTP headers do we support during parsing?
const MAX_NUM_HEADERS: usize = 32;

// The only websocket version we speak.
const WEBSOCKET_VERSION: &str = "13";

const SEC_WEBSOCKET_ACCEPT: &str = "Sec-WebSocket-Accept";
const SEC_WEBSOCKET_EXTENSIONS: &str = "Sec-WebSocket-Extensions";
const SEC_WEBSOCKET_KEY: &str = "Sec-WebSocket-Key";
const SEC_WEBSOCKET_PROTOCOL: &str = "Sec-WebSocket-Protocol";
const SEC_WEBSOCKET_VERSION: &str = "Sec-WebSocket-Version";

/// Compute the accept token proving possession of the handshake key
/// (RFC 6455, section 1.3).
pub(crate) fn generate_accept_token(key: &[u8]) -> String {
    let mut digest = Sha1::new();
    digest.update(key);
    digest.update(ACCEPT_GUID);
    BASE64_STANDARD.encode(digest.finalize())
}

fn trim_ascii(x: &[u8]) -> &[u8] {
    let from = match x.iter().position(|b| !b.is_ascii_whitespace()) {
        Some(i) => i,
        None => return &[]
    };
    let to = x.iter().rposition(|b| !b.is_ascii_whitespace()).unwrap_or(from);
    &x[from ..= to]
}

/// Does a comma separated header value contain the given token
/// (case-insensitively)?
fn header_contains_token(value: &[u8], token: &str) -> bool {
    value
        .split(|&b| b == b',')
        .any(|part| trim_ascii(part).eq_ignore_ascii_case(token.as_bytes()))
}

/// Split a comma separated header value into trimmed strings.
fn split_comma_header(value: &[u8]) -> Vec<String> {
    value
        .split(|&b| b == b',')
        .map(|part| String::from_utf8_lossy(trim_ascii(part)).into_owned())
        .filter(|part| !part.is_empty())
        .collect()
}

/// The extension an offer or accept string belongs to.
fn extension_name(value: &str) -> &str {
    value.split(';').next().unwrap_or("").trim()
}

/// Append the `Sec-WebSocket-Extensions` header carrying every extension's
/// offer.
fn append_extension_offers(extensions: &[Box<dyn Extension + Send>], buf: &mut BytesMut) {
    let mut offers = Vec::new();
    for ext in extensions {
        match ext.offer() {
            Some(params) if !params.is_empty() => offers.push(format!("{}; {}", ext.name(), params)),
            Some(_) => offers.push(ext.name().to_string()),
            None => {}
        }
    }
    if !offers.is_empty() {
        buf.extend_from_slice(b"\r\nSec-WebSocket-Extensions: ");
        buf.extend_from_slice(offers.join(", ").as_bytes())
    }
}

/// The handshake phase of a connection, client or server side.
#[derive(Debug)]
pub(crate) enum Handshake {
    Client(client::ClientHandshake),
    Server(server::ServerHandshake)
}

impl Handshake {
    pub(crate) fn new(mode: Mode, extensions: SmallVec<[Box<dyn Extension + Send>; 4]>) -> Self {
        match mode {
            Mode::Client => Handshake::Client(client::ClientHandshake::new(extensions)),
            Mode::Server => Handshake::Server(server::ServerHandshake::new(extensions))
        }
    }

    pub(crate) fn state(&self) -> ConnectionState {
        match self {
            Handshake::Client(c) => c.state(),
            Handshake::Server(s) => s.state()
        }
    }

    pub(crate) fn receive_data(&mut self, data: Option<&[u8]>) -> Result<(), RemoteProtocolError> {
        match self {
            Handshake::Client(c) => c.receive_data(data),
            Handshake::Server(s) => s.receive_data(data)
        }
    }

    pub(crate) fn next_event(&mut self) -> Option<Event> {
        match self {
            Handshake::Client(c) => c.next_event(),
            Handshake::Server(s) => s.next_event()
        }
    }

    /// Move the configured extensions out, e.g. into the frame pipeline.
    pub(crate) fn take_extensions(&mut self) -> SmallVec<[Box<dyn Extension + Send>; 4]> {
        match self {
            Handshake::Client(c) => c.take_extensions(),
            Handshake::Server(s) => s.take_extensions()
        }
    }

    /// Bytes that arrived glued to the handshake, i.e. the first bytes of
    /// the frame stream.
    pub(crate) fn take_trailing(&mut self) -> BytesMut {
        match self {
            Handshake::Client(c) => c.take_trailing(),
            Handshake::Server(s) => s.take_trailing()
        }
    }

    pub(crate) fn send_request(
        &mut self,
        request: &Request,
        rng: &mut dyn rand::RngCore
    ) -> Result<BytesMut, LocalProtocolError> {
        match self {
            Handshake::Client(c) => c.send_request(request, rng),
            Handshake::Server(_) => Err(LocalProtocolError::new("only client connections send handshake requests"))
        }
    }

    pub(crate) fn accept(&mut self, event: &AcceptConnection) -> Result<BytesMut, LocalProtocolError> {
        match self {
            Handshake::Server(s) => s.accept(event),
            Handshake::Client(_) => Err(LocalProtocolError::new("only server connections accept handshake requests"))
        }
    }

    pub(crate) fn reject(&mut self, event: &RejectConnection) -> Result<BytesMut, LocalProtocolError> {
        match self {
            Handshake::Server(s) => s.reject(event),
            Handshake::Client(_) => Err(LocalProtocolError::new("only server connections reject handshake requests"))
        }
    }

    pub(crate) fn reject_data(&mut self, event: &RejectData) -> Result<BytesMut, LocalProtocolError> {
        match self {
            Handshake::Server(s) => s.reject_data(event),
            Handshake::Client(_) => Err(LocalProtocolError::new("only server connections send rejection bodies"))
        }
    }

    pub(crate) fn initiate_upgrade(&mut self, headers: &Headers, target: &str) -> Result<(), RemoteProtocolError> {
        match self {
            Handshake::Server(s) => s.initiate_upgrade(headers, target),
            // The role check lives in `Connection::initiate_upgrade_connection`.
            Handshake::Client(_) => Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{generate_accept_token, header_contains_token, split_comma_header};

    #[test]
    fn accept_token_matches_the_rfc_example() {
        // The worked example of RFC 6455, section 1.3.
        assert_eq!(
            generate_accept_token(b"dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        )
    }

    #[test]
    fn token_matching_is_case_insensitive_and_comma_aware() {
        assert!(header_contains_token(b"keep-alive, Upgrade", "upgrade"));
        assert!(header_contains_token(b"UPGRADE", "upgrade"));
        assert!(!header_contains_token(b"keep-alive", "upgrade"));
        assert!(!header_contains_token(b"upgrades", "upgrade"))
    }

    #[test]
    fn comma_header_splitting() {
        assert_eq!(split_comma_header(b" a , b,c "), vec!["a", "b", "c"]);
        assert!(split_comma_header(b" , ").is_empty())
    }
}
