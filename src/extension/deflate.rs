// Copyright (c) 2019 Parity Technologies (UK) Ltd.
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! The permessage-deflate compression extension of [RFC 7692][rfc7692].
//!
//! Messages are compressed as one raw DEFLATE stream per message, flagged
//! with RSV1 on the first frame. With context takeover (the default) the
//! LZ77 window survives across messages; either side can be asked to reset
//! it per message via the `*_no_context_takeover` parameters.
//!
//! [rfc7692]: https://tools.ietf.org/html/rfc7692

use crate::base::{OpCode, RsvBits};
use crate::close::CloseReason;
use crate::connection::Mode;
use crate::extension::{params, Extension};
use crate::BoxedError;
use bytes::BytesMut;
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use log::debug;
use std::fmt;

const CLIENT_NO_CONTEXT_TAKEOVER: &str = "client_no_context_takeover";
const CLIENT_MAX_WINDOW_BITS: &str = "client_max_window_bits";
const SERVER_NO_CONTEXT_TAKEOVER: &str = "server_no_context_takeover";
const SERVER_MAX_WINDOW_BITS: &str = "server_max_window_bits";

/// Every DEFLATE block flushed with Z_SYNC_FLUSH ends in this marker. It is
/// stripped from outbound messages and re-synthesised on the inbound side
/// (RFC 7692, sections 7.2.1 and 7.2.2).
const DEFLATE_TRAILER: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

/// The permessage-deflate extension.
pub struct PerMessageDeflate {
    mode: Mode,
    enabled: bool,
    client_no_context_takeover: bool,
    client_max_window_bits: u8,
    server_no_context_takeover: bool,
    server_max_window_bits: u8,
    compressor: Option<Compress>,
    decompressor: Option<Decompress>,
    /// Does the frame currently being decoded carry message data?
    inbound_is_compressible: Option<bool>,
    /// Is the message currently being decoded compressed? Only the first
    /// frame of a fragmented message carries the RSV1 flag, so this carries
    /// the bit forward.
    inbound_compressed: Option<bool>
}

impl PerMessageDeflate {
    /// Create a new permessage-deflate extension, for the client or server
    /// side of a connection. Window bits default to 15 and both context
    /// takeovers are allowed.
    pub fn new(mode: Mode) -> Self {
        PerMessageDeflate {
            mode,
            enabled: false,
            client_no_context_takeover: false,
            client_max_window_bits: 15,
            server_no_context_takeover: false,
            server_max_window_bits: 15,
            compressor: None,
            decompressor: None,
            inbound_is_compressible: None,
            inbound_compressed: None
        }
    }

    /// Request that the client resets its compression context after each
    /// message.
    pub fn set_client_no_context_takeover(&mut self, no_takeover: bool) -> &mut Self {
        self.client_no_context_takeover = no_takeover;
        self
    }

    /// Request that the server resets its compression context after each
    /// message.
    pub fn set_server_no_context_takeover(&mut self, no_takeover: bool) -> &mut Self {
        self.server_no_context_takeover = no_takeover;
        self
    }

    /// Set the max. size of the client's LZ77 sliding window.
    ///
    /// The value must be within 8 ..= 15.
    pub fn set_client_max_window_bits(&mut self, max: u8) -> &mut Self {
        assert!((8 ..= 15).contains(&max), "max. client window bits must be within 8 ..= 15");
        self.client_max_window_bits = max;
        self
    }

    /// Set the max. size of the server's LZ77 sliding window.
    ///
    /// The value must be within 8 ..= 15.
    pub fn set_server_max_window_bits(&mut self, max: u8) -> &mut Self {
        assert!((8 ..= 15).contains(&max), "max. server window bits must be within 8 ..= 15");
        self.server_max_window_bits = max;
        self
    }

    fn is_compressible(opcode: OpCode) -> bool {
        matches!(opcode, OpCode::Text | OpCode::Binary | OpCode::Continue)
    }

    /// The window bits our own compressor uses.
    fn our_window_bits(&self) -> u8 {
        let bits = match self.mode {
            Mode::Client => self.client_max_window_bits,
            Mode::Server => self.server_max_window_bits
        };
        // The RFC allows 8 bits but zlib does not; 9 is the lower bound.
        bits.max(9)
    }

    /// The window bits the peer's compressor uses.
    fn their_window_bits(&self) -> u8 {
        let bits = match self.mode {
            Mode::Client => self.server_max_window_bits,
            Mode::Server => self.client_max_window_bits
        };
        bits.max(9)
    }

    /// The no-context-takeover flag governing our outbound direction.
    fn our_no_context_takeover(&self) -> bool {
        match self.mode {
            Mode::Client => self.client_no_context_takeover,
            Mode::Server => self.server_no_context_takeover
        }
    }

    /// The no-context-takeover flag governing the peer's direction.
    fn their_no_context_takeover(&self) -> bool {
        match self.mode {
            Mode::Client => self.server_no_context_takeover,
            Mode::Server => self.client_no_context_takeover
        }
    }

    /// Parse a window bits parameter value; `None` declines the offer.
    fn parse_window_bits(p: &crate::extension::Param, default: u8) -> Option<u8> {
        match p.value() {
            None => Some(default),
            Some(v) => match v.parse::<u8>() {
                Ok(bits) if (8 ..= 15).contains(&bits) => Some(bits),
                _ => {
                    debug!("unacceptable {}: {:?}", p.name(), p.value());
                    None
                }
            }
        }
    }
}

impl Extension for PerMessageDeflate {
    fn name(&self) -> &str {
        "permessage-deflate"
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn offer(&self) -> Option<String> {
        let mut parts = vec![
            format!("{}={}", CLIENT_MAX_WINDOW_BITS, self.client_max_window_bits),
            format!("{}={}", SERVER_MAX_WINDOW_BITS, self.server_max_window_bits)
        ];
        if self.client_no_context_takeover {
            parts.push(CLIENT_NO_CONTEXT_TAKEOVER.into())
        }
        if self.server_no_context_takeover {
            parts.push(SERVER_NO_CONTEXT_TAKEOVER.into())
        }
        Some(parts.join("; "))
    }

    fn accept(&mut self, offer: &str) -> Option<String> {
        let mut client_bits = None;
        let mut server_bits = None;

        for p in params(offer).skip(1) {
            match p.name() {
                CLIENT_NO_CONTEXT_TAKEOVER => self.client_no_context_takeover = true,
                SERVER_NO_CONTEXT_TAKEOVER => self.server_no_context_takeover = true,
                CLIENT_MAX_WINDOW_BITS => {
                    client_bits = Some(Self::parse_window_bits(&p, self.client_max_window_bits)?)
                }
                SERVER_MAX_WINDOW_BITS => {
                    server_bits = Some(Self::parse_window_bits(&p, self.server_max_window_bits)?)
                }
                other => debug!("{}: ignoring unknown parameter {}", self.name(), other)
            }
        }

        self.enabled = true;

        let mut parts = Vec::new();
        if self.client_no_context_takeover {
            parts.push(CLIENT_NO_CONTEXT_TAKEOVER.to_string())
        }
        if let Some(bits) = client_bits {
            self.client_max_window_bits = bits;
            parts.push(format!("{}={}", CLIENT_MAX_WINDOW_BITS, bits))
        }
        if self.server_no_context_takeover {
            parts.push(SERVER_NO_CONTEXT_TAKEOVER.to_string())
        }
        if let Some(bits) = server_bits {
            self.server_max_window_bits = bits;
            parts.push(format!("{}={}", SERVER_MAX_WINDOW_BITS, bits))
        }
        Some(parts.join("; "))
    }

    fn finalize(&mut self, accept: &str) {
        for p in params(accept).skip(1) {
            match p.name() {
                CLIENT_NO_CONTEXT_TAKEOVER => self.client_no_context_takeover = true,
                SERVER_NO_CONTEXT_TAKEOVER => self.server_no_context_takeover = true,
                CLIENT_MAX_WINDOW_BITS => {
                    if let Some(bits) = Self::parse_window_bits(&p, self.client_max_window_bits) {
                        self.client_max_window_bits = bits
                    }
                }
                SERVER_MAX_WINDOW_BITS => {
                    if let Some(bits) = Self::parse_window_bits(&p, self.server_max_window_bits) {
                        self.server_max_window_bits = bits
                    }
                }
                other => debug!("{}: ignoring unknown parameter {}", self.name(), other)
            }
        }
        self.enabled = true
    }

    fn frame_inbound_header(
        &mut self,
        opcode: OpCode,
        rsv: RsvBits,
        _payload_len: u64
    ) -> Result<RsvBits, CloseReason> {
        if rsv.rsv1 && opcode.is_control() {
            debug!("{}: compressed control frame", self.name());
            return Err(CloseReason::ProtocolError)
        }
        if rsv.rsv1 && opcode == OpCode::Continue {
            debug!("{}: compression flag on a continuation frame", self.name());
            return Err(CloseReason::ProtocolError)
        }

        self.inbound_is_compressible = Some(Self::is_compressible(opcode));

        // Only the first frame of a message carries the compression flag;
        // control frames interleaved into a fragmented message must not
        // disturb it.
        if !opcode.is_control() && self.inbound_compressed.is_none() {
            self.inbound_compressed = Some(rsv.rsv1);
            if rsv.rsv1 && self.decompressor.is_none() {
                let bits = self.their_window_bits();
                self.decompressor = Some(Decompress::new_with_window_bits(false, bits))
            }
        }

        Ok(RsvBits { rsv1: true, .. RsvBits::default() })
    }

    fn frame_inbound_payload_data(&mut self, data: BytesMut) -> Result<BytesMut, CloseReason> {
        if self.inbound_compressed != Some(true) || self.inbound_is_compressible != Some(true) {
            return Ok(data)
        }
        let decompressor = match &mut self.decompressor {
            Some(d) => d,
            None => return Ok(data)
        };
        let mut out = Vec::new();
        decompress_into(decompressor, &data, &mut out, FlushDecompress::None)
            .map_err(|_| CloseReason::InvalidFramePayloadData)?;
        Ok(BytesMut::from(&out[..]))
    }

    fn frame_inbound_complete(&mut self, fin: bool) -> Result<Option<BytesMut>, CloseReason> {
        if !fin {
            return Ok(None)
        }
        if self.inbound_is_compressible.take() != Some(true) {
            // A control frame; leave the per-message state alone.
            return Ok(None)
        }
        if self.inbound_compressed.take() != Some(true) {
            return Ok(None)
        }
        let decompressor = match &mut self.decompressor {
            Some(d) => d,
            None => return Ok(None)
        };
        let mut out = Vec::new();
        decompress_into(decompressor, &DEFLATE_TRAILER, &mut out, FlushDecompress::Sync)
            .map_err(|_| CloseReason::InvalidFramePayloadData)?;
        if self.their_no_context_takeover() {
            self.decompressor = None
        }
        Ok(Some(BytesMut::from(&out[..])))
    }

    fn frame_outbound(
        &mut self,
        opcode: OpCode,
        rsv: RsvBits,
        data: BytesMut,
        fin: bool
    ) -> Result<(RsvBits, BytesMut), BoxedError> {
        if !Self::is_compressible(opcode) {
            return Ok((rsv, data))
        }

        let mut rsv = rsv;
        if opcode != OpCode::Continue {
            rsv.rsv1 = true
        }

        let bits = self.our_window_bits();
        let compressor = self
            .compressor
            .get_or_insert_with(|| Compress::new_with_window_bits(Compression::default(), false, bits));

        let mut out = Vec::new();
        compress_into(compressor, &data, &mut out, FlushCompress::None).map_err(|e| Box::new(e) as BoxedError)?;

        if fin {
            compress_into(compressor, &[], &mut out, FlushCompress::Sync).map_err(|e| Box::new(e) as BoxedError)?;
            debug_assert!(out.ends_with(&DEFLATE_TRAILER));
            out.truncate(out.len().saturating_sub(DEFLATE_TRAILER.len()));
            if self.our_no_context_takeover() {
                self.compressor = None
            }
        }

        Ok((rsv, BytesMut::from(&out[..])))
    }
}

impl fmt::Debug for PerMessageDeflate {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("PerMessageDeflate")
            .field("mode", &self.mode)
            .field("enabled", &self.enabled)
            .field("client_no_context_takeover", &self.client_no_context_takeover)
            .field("client_max_window_bits", &self.client_max_window_bits)
            .field("server_no_context_takeover", &self.server_no_context_takeover)
            .field("server_max_window_bits", &self.server_max_window_bits)
            .finish()
    }
}

/// Run `input` through the decompressor, appending all output to `out`.
fn decompress_into(
    decompressor: &mut Decompress,
    mut input: &[u8],
    out: &mut Vec<u8>,
    flush: FlushDecompress
) -> Result<(), flate2::DecompressError> {
    loop {
        out.reserve((input.len() * 2).max(256));
        let spare = out.capacity() - out.len();
        let before_in = decompressor.total_in();
        let before_out = decompressor.total_out();
        let status = decompressor.decompress_vec(input, out, flush)?;
        input = &input[(decompressor.total_in() - before_in) as usize ..];
        let produced = (decompressor.total_out() - before_out) as usize;
        if status == Status::StreamEnd || (input.is_empty() && produced < spare) {
            return Ok(())
        }
    }
}

/// Run `input` through the compressor, appending all output to `out`.
fn compress_into(
    compressor: &mut Compress,
    mut input: &[u8],
    out: &mut Vec<u8>,
    flush: FlushCompress
) -> Result<(), flate2::CompressError> {
    loop {
        out.reserve(input.len().max(256));
        let spare = out.capacity() - out.len();
        let before_in = compressor.total_in();
        let before_out = compressor.total_out();
        compressor.compress_vec(input, out, flush)?;
        input = &input[(compressor.total_in() - before_in) as usize ..];
        let produced = (compressor.total_out() - before_out) as usize;
        if input.is_empty() && produced < spare {
            return Ok(())
        }
    }
}
