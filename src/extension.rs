// Copyright (c) 2019 Parity Technologies (UK) Ltd.
// Copyright (c) 2016 twist developers
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! Websocket extensions as per RFC 6455, section 9.
//!
//! An [`Extension`] takes part in the handshake negotiation
//! ([`offer`](Extension::offer) / [`accept`](Extension::accept) /
//! [`finalize`](Extension::finalize)) and, once enabled, is threaded into
//! the frame pipeline: inbound frames pass through the `frame_inbound_*`
//! hooks in configuration order, outbound frames through
//! [`frame_outbound`](Extension::frame_outbound) in reverse order, so the
//! first configured extension sees the outermost payload on receive and the
//! innermost on send.

use crate::base::{OpCode, RsvBits};
use crate::close::CloseReason;
use crate::BoxedError;
use bytes::BytesMut;
use std::borrow::Cow;

#[cfg(feature = "deflate")]
pub mod deflate;

/// A websocket extension as per RFC 6455, section 9.
pub trait Extension: std::fmt::Debug {
    /// The registered name of this extension.
    fn name(&self) -> &str;

    /// Is this extension enabled (i.e. successfully negotiated)?
    fn is_enabled(&self) -> bool;

    /// The parameter string to include in the client's offer, without the
    /// leading extension name. `None` if the extension has nothing to offer.
    fn offer(&self) -> Option<String>;

    /// Answer a client's offer (server side).
    ///
    /// On success the extension is enabled and the returned parameter
    /// string (possibly empty) is echoed in the response header. `None`
    /// declines the offer.
    fn accept(&mut self, offer: &str) -> Option<String>;

    /// Apply the parameters the server accepted (client side). The
    /// extension is enabled afterwards.
    fn finalize(&mut self, accept: &str);

    /// Inspect an inbound frame header.
    ///
    /// Returns the reserved bits this extension lays claim to, or a close
    /// reason to fail the connection with.
    fn frame_inbound_header(
        &mut self,
        opcode: OpCode,
        rsv: RsvBits,
        payload_len: u64
    ) -> Result<RsvBits, CloseReason> {
        let _ = (opcode, rsv, payload_len);
        Ok(RsvBits::default())
    }

    /// Transform a chunk of inbound payload data.
    fn frame_inbound_payload_data(&mut self, data: BytesMut) -> Result<BytesMut, CloseReason> {
        Ok(data)
    }

    /// The inbound frame payload is complete; `fin` tells whether it was
    /// the final frame of its message. Returned bytes are appended to the
    /// frame's final chunk.
    fn frame_inbound_complete(&mut self, fin: bool) -> Result<Option<BytesMut>, CloseReason> {
        let _ = fin;
        Ok(None)
    }

    /// Transform an outbound frame, possibly claiming reserved bits.
    fn frame_outbound(
        &mut self,
        opcode: OpCode,
        rsv: RsvBits,
        data: BytesMut,
        fin: bool
    ) -> Result<(RsvBits, BytesMut), BoxedError> {
        let _ = (opcode, fin);
        Ok((rsv, data))
    }
}

impl<E: Extension + ?Sized> Extension for Box<E> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn is_enabled(&self) -> bool {
        (**self).is_enabled()
    }

    fn offer(&self) -> Option<String> {
        (**self).offer()
    }

    fn accept(&mut self, offer: &str) -> Option<String> {
        (**self).accept(offer)
    }

    fn finalize(&mut self, accept: &str) {
        (**self).finalize(accept)
    }

    fn frame_inbound_header(
        &mut self,
        opcode: OpCode,
        rsv: RsvBits,
        payload_len: u64
    ) -> Result<RsvBits, CloseReason> {
        (**self).frame_inbound_header(opcode, rsv, payload_len)
    }

    fn frame_inbound_payload_data(&mut self, data: BytesMut) -> Result<BytesMut, CloseReason> {
        (**self).frame_inbound_payload_data(data)
    }

    fn frame_inbound_complete(&mut self, fin: bool) -> Result<Option<BytesMut>, CloseReason> {
        (**self).frame_inbound_complete(fin)
    }

    fn frame_outbound(
        &mut self,
        opcode: OpCode,
        rsv: RsvBits,
        data: BytesMut,
        fin: bool
    ) -> Result<(RsvBits, BytesMut), BoxedError> {
        (**self).frame_outbound(opcode, rsv, data, fin)
    }
}

/// Extension parameter (used for negotiation).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Param<'a> {
    name: Cow<'a, str>,
    value: Option<Cow<'a, str>>
}

impl<'a> Param<'a> {
    /// Create a new parameter with the given name and no value.
    pub fn new(name: impl Into<Cow<'a, str>>) -> Self {
        Param { name: name.into(), value: None }
    }

    /// The parameter name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The parameter value, if any.
    pub fn value(&self) -> Option<&str> {
        self.value.as_deref()
    }

    /// Set the parameter value.
    pub fn set_value(&mut self, value: Option<impl Into<Cow<'a, str>>>) -> &mut Self {
        self.value = value.map(Into::into);
        self
    }
}

/// Split a `; `-separated extension string into its parameters.
///
/// The first element is the extension name itself (a parameter without
/// value).
pub fn params(s: &str) -> impl Iterator<Item = Param<'_>> {
    s.split(';').filter_map(|p| {
        let p = p.trim();
        if p.is_empty() {
            return None
        }
        Some(match p.split_once('=') {
            None => Param::new(p),
            Some((name, value)) => {
                let mut param = Param::new(name.trim());
                param.set_value(Some(value.trim().trim_matches('"')));
                param
            }
        })
    })
}
