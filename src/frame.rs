// Copyright (c) 2019 Parity Technologies (UK) Ltd.
// Copyright (c) 2016 twist developers
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! The websocket frame protocol.
//!
//! [`FrameDecoder`] parses one wire frame at a time out of buffered bytes,
//! enforcing the structural rules of RFC 6455, section 5.2 (canonical length
//! encoding, masking roles, control frame limits, reserved bits) and
//! threading payload data through the extension hooks. Large frames are
//! handed out in chunks as their bytes arrive.
//!
//! [`MessageDecoder`] groups data frames into messages, enforcing the
//! fragmentation rules and streaming TEXT payloads through the incremental
//! UTF-8 decoder.
//!
//! [`FrameCodec`] drives both and owns the outbound side: fragmentation
//! bookkeeping, the extension pipeline in reverse order, length encoding and
//! client-side masking with fresh keys.

use crate::base::{Header, Masker, OpCode, RsvBits, EIGHT_BYTE_EXT, MAX_CONTROL_PAYLOAD, TWO_BYTE_EXT};
use crate::buffer::Buffer;
use crate::close::{self, CloseReason};
use crate::connection::Mode;
use crate::error::LocalProtocolError;
use crate::extension::Extension;
use crate::utf8::Utf8Decoder;
use bytes::{BufMut, BytesMut};
use log::trace;
use rand::RngCore;
use smallvec::SmallVec;
use std::convert::TryFrom;

/// The peer violated the frame protocol. Carries the close code the
/// connection should be failed with.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub(crate) struct ParseFailed {
    pub(crate) code: CloseReason,
    pub(crate) message: String
}

impl ParseFailed {
    pub(crate) fn new(code: CloseReason, message: impl Into<String>) -> Self {
        ParseFailed { code, message: message.into() }
    }

    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        ParseFailed::new(CloseReason::ProtocolError, message)
    }
}

fn extension_error(code: CloseReason) -> ParseFailed {
    ParseFailed::new(code, "error in extension")
}

/// A decoded frame payload.
#[derive(Debug)]
pub(crate) enum Payload {
    /// Binary data, or the payload of a PING or PONG frame.
    Bytes(BytesMut),
    /// A chunk of a text message.
    Text(String),
    /// A decoded CLOSE payload.
    Close(CloseReason, Option<String>)
}

/// A decoded frame, or a chunk of one.
#[derive(Debug)]
pub(crate) struct Frame {
    pub(crate) opcode: OpCode,
    pub(crate) payload: Payload,
    pub(crate) frame_finished: bool,
    pub(crate) message_finished: bool
}

/// A frame as it comes out of the [`FrameDecoder`], payload still raw.
#[derive(Debug)]
struct RawFrame {
    opcode: OpCode,
    payload: BytesMut,
    frame_finished: bool,
    message_finished: bool
}

// Frame decoder //////////////////////////////////////////////////////////////////////////////////

#[derive(Debug)]
struct FrameDecoder {
    client: bool,
    buffer: Buffer,
    header: Option<Header>,
    /// The opcode chunks of the current frame are reported with. The first
    /// chunk carries the header's opcode, further chunks of the same wire
    /// frame are continuations.
    effective_opcode: Option<OpCode>,
    masker: Option<Masker>,
    /// Bytes that must be buffered before the next chunk is produced.
    /// Control frame payloads are handed out in one piece.
    payload_required: u64,
    payload_consumed: u64
}

impl FrameDecoder {
    fn new(mode: Mode) -> Self {
        FrameDecoder {
            client: mode.is_client(),
            buffer: Buffer::new(),
            header: None,
            effective_opcode: None,
            masker: None,
            payload_required: 0,
            payload_consumed: 0
        }
    }

    fn receive_bytes(&mut self, data: &[u8]) {
        self.buffer.feed(data)
    }

    /// Attempt to parse the next frame or frame chunk.
    fn process_buffer(
        &mut self,
        extensions: &mut [Box<dyn Extension + Send>]
    ) -> Result<Option<RawFrame>, ParseFailed> {
        if self.header.is_none() && !self.parse_header(extensions)? {
            return Ok(None)
        }
        let header = match self.header {
            Some(h) => h,
            None => return Ok(None)
        };

        if (self.buffer.len() as u64) < self.payload_required {
            return Ok(None)
        }

        let remaining = header.payload_len - self.payload_consumed;
        let chunk_len = remaining.min(self.buffer.len() as u64) as usize;
        let mut payload = self.buffer.consume_at_most(chunk_len);
        if payload.is_empty() && header.payload_len > 0 {
            self.buffer.rollback();
            return Ok(None)
        }
        self.buffer.commit();

        self.payload_consumed += payload.len() as u64;
        let frame_finished = self.payload_consumed == header.payload_len;

        if let Some(masker) = &mut self.masker {
            masker.process(&mut payload)
        }

        for ext in extensions.iter_mut() {
            payload = ext.frame_inbound_payload_data(payload).map_err(extension_error)?
        }

        if frame_finished {
            for ext in extensions.iter_mut() {
                if let Some(extra) = ext.frame_inbound_complete(header.fin).map_err(extension_error)? {
                    payload.extend_from_slice(&extra)
                }
            }
        }

        let opcode = self.effective_opcode.unwrap_or(header.opcode);
        let frame = RawFrame {
            opcode,
            payload,
            frame_finished,
            message_finished: frame_finished && header.fin
        };

        if frame_finished {
            self.header = None;
            self.effective_opcode = None;
            self.masker = None;
            self.payload_consumed = 0
        } else {
            self.effective_opcode = Some(OpCode::Continue)
        }

        Ok(Some(frame))
    }

    /// Parse a frame header, returning `false` if more bytes are needed.
    fn parse_header(&mut self, extensions: &mut [Box<dyn Extension + Send>]) -> Result<bool, ParseFailed> {
        let data = match self.buffer.consume_exactly(2) {
            Some(d) => d,
            None => {
                self.buffer.rollback();
                return Ok(false)
            }
        };

        let fin = data[0] & 0x80 != 0;
        let rsv = RsvBits {
            rsv1: data[0] & 0x40 != 0,
            rsv2: data[0] & 0x20 != 0,
            rsv3: data[0] & 0x10 != 0
        };
        let opcode = OpCode::try_from(data[0] & 0x0F)
            .map_err(|_| ParseFailed::protocol(format!("invalid opcode {:#x}", data[0] & 0x0F)))?;
        if opcode.is_control() && !fin {
            return Err(ParseFailed::protocol("fragmented control frame"))
        }

        let has_mask = data[1] & 0x80 != 0;
        let payload_len = match self.parse_extended_payload_length(opcode, data[1] & 0x7F)? {
            Some(n) => n,
            None => {
                self.buffer.rollback();
                return Ok(false)
            }
        };

        extension_processing(extensions, opcode, rsv, payload_len)?;

        if has_mask && self.client {
            return Err(ParseFailed::protocol("client received unexpected masked frame"))
        }
        if !has_mask && !self.client {
            return Err(ParseFailed::protocol("server received unexpected unmasked frame"))
        }

        let masking_key = if has_mask {
            match self.buffer.consume_exactly(4) {
                Some(k) => Some([k[0], k[1], k[2], k[3]]),
                None => {
                    self.buffer.rollback();
                    return Ok(false)
                }
            }
        } else {
            None
        };

        self.buffer.commit();
        self.masker = masking_key.map(Masker::new);
        self.header = Some(Header { fin, rsv, opcode, payload_len, masking_key });
        self.effective_opcode = Some(opcode);
        self.payload_required = if opcode.is_control() { payload_len } else { 0 };
        self.payload_consumed = 0;
        Ok(true)
    }

    /// Read the extended payload length, if any, enforcing canonical
    /// encoding. `None` means more bytes are needed.
    fn parse_extended_payload_length(&mut self, opcode: OpCode, len7: u8) -> Result<Option<u64>, ParseFailed> {
        if opcode.is_control() && u64::from(len7) > MAX_CONTROL_PAYLOAD {
            return Err(ParseFailed::protocol("control frame with payload length > 125"))
        }
        match len7 {
            TWO_BYTE_EXT => {
                let data = match self.buffer.consume_exactly(2) {
                    Some(d) => d,
                    None => return Ok(None)
                };
                let len = u64::from(u16::from_be_bytes([data[0], data[1]]));
                if len <= MAX_CONTROL_PAYLOAD {
                    return Err(ParseFailed::protocol("payload length used 2 bytes when 1 would have sufficed"))
                }
                Ok(Some(len))
            }
            EIGHT_BYTE_EXT => {
                let data = match self.buffer.consume_exactly(8) {
                    Some(d) => d,
                    None => return Ok(None)
                };
                let len =
                    u64::from_be_bytes([data[0], data[1], data[2], data[3], data[4], data[5], data[6], data[7]]);
                if len <= u64::from(u16::MAX) {
                    return Err(ParseFailed::protocol("payload length used 8 bytes when 2 would have sufficed"))
                }
                if len >> 63 != 0 {
                    return Err(ParseFailed::protocol("8-byte payload length with non-zero MSB"))
                }
                Ok(Some(len))
            }
            n => Ok(Some(u64::from(n)))
        }
    }
}

/// Offer the header to every extension and verify each reserved bit that is
/// set has been claimed by one of them.
fn extension_processing(
    extensions: &mut [Box<dyn Extension + Send>],
    opcode: OpCode,
    rsv: RsvBits,
    payload_len: u64
) -> Result<(), ParseFailed> {
    let mut claimed = RsvBits::default();
    for ext in extensions.iter_mut() {
        let used = ext.frame_inbound_header(opcode, rsv, payload_len).map_err(extension_error)?;
        claimed = claimed.union(used)
    }
    if (rsv.rsv1 && !claimed.rsv1) || (rsv.rsv2 && !claimed.rsv2) || (rsv.rsv3 && !claimed.rsv3) {
        return Err(ParseFailed::protocol("reserved bit set unexpectedly"))
    }
    Ok(())
}

// Message decoder ////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Default)]
struct MessageDecoder {
    /// Opcode of the message in progress.
    opcode: Option<OpCode>,
    /// UTF-8 decoder for the TEXT message in progress.
    decoder: Option<Utf8Decoder>
}

impl MessageDecoder {
    fn process_frame(&mut self, frame: RawFrame) -> Result<Frame, ParseFailed> {
        debug_assert!(!frame.opcode.is_control());

        let message_opcode = match self.opcode {
            None => {
                if frame.opcode == OpCode::Continue {
                    return Err(ParseFailed::protocol("unexpected CONTINUATION"))
                }
                self.opcode = Some(frame.opcode);
                frame.opcode
            }
            Some(current) => {
                if frame.opcode != OpCode::Continue {
                    return Err(ParseFailed::protocol(format!("expected CONTINUATION, got {}", frame.opcode)))
                }
                current
            }
        };

        if message_opcode == OpCode::Text && self.decoder.is_none() {
            self.decoder = Some(Utf8Decoder::new())
        }

        let finished = frame.frame_finished && frame.message_finished;

        let payload = match &mut self.decoder {
            Some(decoder) => {
                let text = decoder.decode(&frame.payload, finished).map_err(|_| {
                    ParseFailed::new(CloseReason::InvalidFramePayloadData, "invalid utf-8 in text message")
                })?;
                Payload::Text(text)
            }
            None => Payload::Bytes(frame.payload)
        };

        if finished {
            self.opcode = None;
            self.decoder = None
        }

        Ok(Frame {
            opcode: message_opcode,
            payload,
            frame_finished: frame.frame_finished,
            message_finished: finished
        })
    }
}

// Frame codec ////////////////////////////////////////////////////////////////////////////////////

/// The frame-phase protocol driver: decodes inbound frames into messages and
/// serializes outbound commands.
#[derive(Debug)]
pub(crate) struct FrameCodec {
    client: bool,
    extensions: SmallVec<[Box<dyn Extension + Send>; 4]>,
    decoder: FrameDecoder,
    message_decoder: MessageDecoder,
    /// Opcode of the outbound message in progress.
    outbound_opcode: Option<OpCode>,
    /// Set once a CLOSE frame has been received; no more frames follow.
    closed: bool,
    /// Set once parsing has failed terminally.
    failed: bool
}

impl FrameCodec {
    /// Create a codec for the given role. Only enabled extensions take part
    /// in the frame pipeline.
    pub(crate) fn new(mode: Mode, extensions: SmallVec<[Box<dyn Extension + Send>; 4]>) -> Self {
        FrameCodec {
            client: mode.is_client(),
            extensions: extensions.into_iter().filter(|e| e.is_enabled()).collect(),
            decoder: FrameDecoder::new(mode),
            message_decoder: MessageDecoder::default(),
            outbound_opcode: None,
            closed: false,
            failed: false
        }
    }

    pub(crate) fn receive_bytes(&mut self, data: &[u8]) {
        self.decoder.receive_bytes(data)
    }

    /// Parse the next frame (or chunk of one) out of the buffered bytes.
    ///
    /// Returns `None` when more bytes are needed, and unconditionally after
    /// a CLOSE frame or a parse failure.
    pub(crate) fn next_frame(&mut self) -> Result<Option<Frame>, ParseFailed> {
        if self.closed || self.failed {
            return Ok(None)
        }
        match self.parse_next() {
            Err(e) => {
                self.failed = true;
                Err(e)
            }
            ok => ok
        }
    }

    fn parse_next(&mut self) -> Result<Option<Frame>, ParseFailed> {
        let raw = match self.decoder.process_buffer(&mut self.extensions)? {
            Some(f) => f,
            None => return Ok(None)
        };
        trace!("recv: {} (fin {}, {} bytes)", raw.opcode, raw.message_finished, raw.payload.len());

        if !raw.opcode.is_control() {
            return Ok(Some(self.message_decoder.process_frame(raw)?))
        }
        if raw.opcode == OpCode::Close {
            self.closed = true;
            let (code, reason) = close::parse_close_payload(&raw.payload)?;
            return Ok(Some(Frame {
                opcode: OpCode::Close,
                payload: Payload::Close(code, reason),
                frame_finished: true,
                message_finished: true
            }))
        }
        Ok(Some(Frame {
            opcode: raw.opcode,
            payload: Payload::Bytes(raw.payload),
            frame_finished: raw.frame_finished,
            message_finished: raw.message_finished
        }))
    }

    /// Serialize a message frame. `opcode` selects the payload type (TEXT or
    /// BINARY) and must not change within a fragmented message.
    pub(crate) fn send_data(
        &mut self,
        opcode: OpCode,
        payload: BytesMut,
        fin: bool,
        rng: &mut dyn RngCore
    ) -> Result<BytesMut, LocalProtocolError> {
        debug_assert!(matches!(opcode, OpCode::Text | OpCode::Binary));
        let wire_opcode = match self.outbound_opcode {
            None => {
                self.outbound_opcode = Some(opcode);
                opcode
            }
            Some(current) if current == opcode => OpCode::Continue,
            Some(_) => return Err(LocalProtocolError::new("data type mismatch inside message"))
        };
        if fin {
            self.outbound_opcode = None
        }
        self.serialize_frame(wire_opcode, payload, fin, rng)
    }

    /// Serialize a PING frame.
    pub(crate) fn ping(&mut self, payload: BytesMut, rng: &mut dyn RngCore) -> Result<BytesMut, LocalProtocolError> {
        self.serialize_frame(OpCode::Ping, payload, true, rng)
    }

    /// Serialize a PONG frame.
    pub(crate) fn pong(&mut self, payload: BytesMut, rng: &mut dyn RngCore) -> Result<BytesMut, LocalProtocolError> {
        self.serialize_frame(OpCode::Pong, payload, true, rng)
    }

    /// Serialize a CLOSE frame.
    pub(crate) fn close(
        &mut self,
        code: Option<CloseReason>,
        reason: Option<&str>,
        rng: &mut dyn RngCore
    ) -> Result<BytesMut, LocalProtocolError> {
        let payload = close::build_close_payload(code, reason)?;
        self.serialize_frame(OpCode::Close, payload, true, rng)
    }

    fn serialize_frame(
        &mut self,
        opcode: OpCode,
        mut payload: BytesMut,
        fin: bool,
        rng: &mut dyn RngCore
    ) -> Result<BytesMut, LocalProtocolError> {
        let mut rsv = RsvBits::default();
        // Extensions run in reverse order on the outbound path, so the first
        // configured one applies last and its transform is the outermost.
        for ext in self.extensions.iter_mut().rev() {
            let (r, p) = ext
                .frame_outbound(opcode, rsv, payload, fin)
                .map_err(|e| LocalProtocolError::new(format!("extension failed to encode frame: {}", e)))?;
            rsv = r;
            payload = p
        }

        let mut first = u8::from(opcode);
        if fin {
            first |= 0x80
        }
        if rsv.rsv1 {
            first |= 0x40
        }
        if rsv.rsv2 {
            first |= 0x20
        }
        if rsv.rsv3 {
            first |= 0x10
        }

        let mut out = BytesMut::with_capacity(payload.len() + 14);
        out.put_u8(first);

        let mask_bit = if self.client { 0x80 } else { 0x00 };
        if payload.len() as u64 <= MAX_CONTROL_PAYLOAD {
            out.put_u8(mask_bit | payload.len() as u8)
        } else if opcode.is_control() {
            return Err(LocalProtocolError::new("payload too long for control frame"))
        } else if payload.len() <= usize::from(u16::MAX) {
            out.put_u8(mask_bit | TWO_BYTE_EXT);
            out.put_u16(payload.len() as u16)
        } else {
            out.put_u8(mask_bit | EIGHT_BYTE_EXT);
            out.put_u64(payload.len() as u64)
        }

        if self.client {
            // A fresh key from a cryptographic source for every frame
            // (RFC 6455, section 5.3).
            let mut key = [0_u8; 4];
            rng.fill_bytes(&mut key);
            out.extend_from_slice(&key);
            let mut masker = Masker::new(key);
            masker.process(&mut payload)
        }

        out.extend_from_slice(&payload);
        trace!("send: {} (fin {}, {} bytes)", opcode, fin, out.len());
        Ok(out)
    }
}

// Tests //////////////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::{Frame, FrameCodec, Payload};
    use crate::base::OpCode;
    use crate::close::CloseReason;
    use crate::connection::Mode;
    use assert_matches::assert_matches;
    use bytes::BytesMut;
    use quickcheck::quickcheck;
    use rand::{rngs::StdRng, SeedableRng};
    use smallvec::SmallVec;

    fn client() -> FrameCodec {
        FrameCodec::new(Mode::Client, SmallVec::new())
    }

    fn server() -> FrameCodec {
        FrameCodec::new(Mode::Server, SmallVec::new())
    }

    fn rng() -> StdRng {
        StdRng::seed_from_u64(0x5eed)
    }

    /// Build a masked client frame by hand.
    fn masked(first: u8, key: [u8; 4], payload: &[u8]) -> Vec<u8> {
        assert!(payload.len() <= 125);
        let mut out = vec![first, 0x80 | payload.len() as u8];
        out.extend_from_slice(&key);
        out.extend(payload.iter().enumerate().map(|(i, b)| b ^ key[i % 4]));
        out
    }

    fn decode(codec: &mut FrameCodec, bytes: &[u8]) -> Result<Option<Frame>, super::ParseFailed> {
        codec.receive_bytes(bytes);
        codec.next_frame()
    }

    // Truncated frames must yield `None` until the missing bytes arrive.

    #[test]
    fn partial_header() {
        assert_matches!(decode(&mut server(), &[0x82]), Ok(None))
    }

    #[test]
    fn partial_two_byte_length() {
        assert_matches!(decode(&mut server(), &[0x82, 0xFE, 0x01]), Ok(None))
    }

    #[test]
    fn partial_eight_byte_length() {
        assert_matches!(decode(&mut server(), &[0x82, 0xFF, 0x01, 0x02, 0x03, 0x04]), Ok(None))
    }

    #[test]
    fn partial_mask() {
        assert_matches!(decode(&mut server(), &[0x82, 0x85, 0x01, 0x02]), Ok(None))
    }

    #[test]
    fn partial_header_completes_after_more_bytes() {
        let mut codec = server();
        assert_matches!(decode(&mut codec, &[0x82]), Ok(None));
        let frame = decode(&mut codec, &masked(0x82, [1, 2, 3, 4], b"ok")[1 ..]).unwrap().unwrap();
        assert_eq!(frame.opcode, OpCode::Binary);
        assert_matches!(frame.payload, Payload::Bytes(b) if &b[..] == b"ok")
    }

    // Structural violations.

    #[test]
    fn unknown_opcode() {
        let e = decode(&mut server(), &[0x83, 0x80, 0, 0, 0, 0]).unwrap_err();
        assert_eq!(e.code, CloseReason::ProtocolError)
    }

    #[test]
    fn fragmented_control_frame() {
        for first in [0x08, 0x09, 0x0A] {
            let e = decode(&mut server(), &[first, 0x80]).unwrap_err();
            assert_eq!(e.code, CloseReason::ProtocolError)
        }
    }

    #[test]
    fn control_frame_with_long_payload() {
        let e = decode(&mut server(), &[0x89, 0xFE, 0x10, 0x00]).unwrap_err();
        assert_eq!(e.code, CloseReason::ProtocolError);
        assert!(e.message.contains("control frame"))
    }

    #[test]
    fn reserved_bits_without_extension() {
        for first in [0xC1, 0xA1, 0x91] {
            let e = decode(&mut server(), &[first, 0x80, 0, 0, 0, 0]).unwrap_err();
            assert_eq!(e.code, CloseReason::ProtocolError)
        }
    }

    #[test]
    fn non_canonical_two_byte_length() {
        let e = decode(&mut client(), &[0x81, 0x7E, 0x00, 0x7C]).unwrap_err();
        assert_eq!(e.code, CloseReason::ProtocolError);
        assert!(e.message.contains("used 2 bytes when 1 would have sufficed"))
    }

    #[test]
    fn non_canonical_eight_byte_length() {
        let e = decode(&mut client(), &[0x81, 0x7F, 0, 0, 0, 0, 0, 0, 0xFF, 0xFF]).unwrap_err();
        assert!(e.message.contains("used 8 bytes when 2 would have sufficed"))
    }

    #[test]
    fn eight_byte_length_with_msb_set() {
        let e = decode(&mut client(), &[0x81, 0x7F, 0x80, 0, 0, 0, 0, 0, 0, 0]).unwrap_err();
        assert!(e.message.contains("non-zero MSB"))
    }

    #[test]
    fn server_rejects_unmasked_frames() {
        let e = decode(&mut server(), &[0x81, 0x02, b'h', b'i']).unwrap_err();
        assert_eq!(e.code, CloseReason::ProtocolError)
    }

    #[test]
    fn client_rejects_masked_frames() {
        let e = decode(&mut client(), &masked(0x81, [1, 2, 3, 4], b"hi")).unwrap_err();
        assert_eq!(e.code, CloseReason::ProtocolError)
    }

    // Data frames.

    #[test]
    fn masked_text_frame_decodes() {
        let frame = decode(&mut server(), &masked(0x81, [0x11, 0x22, 0x33, 0x44], "hi".as_bytes()))
            .unwrap()
            .unwrap();
        assert_eq!(frame.opcode, OpCode::Text);
        assert!(frame.frame_finished);
        assert!(frame.message_finished);
        assert_matches!(frame.payload, Payload::Text(t) if t == "hi")
    }

    #[test]
    fn streamed_payload_is_chunked() {
        let bytes = masked(0x82, [9, 9, 9, 9], b"chunked payload");
        let mut codec = server();
        codec.receive_bytes(&bytes[.. 10]);
        let first = codec.next_frame().unwrap().unwrap();
        assert_eq!(first.opcode, OpCode::Binary);
        assert!(!first.frame_finished);
        assert!(!first.message_finished);
        codec.receive_bytes(&bytes[10 ..]);
        let second = codec.next_frame().unwrap().unwrap();
        assert_eq!(second.opcode, OpCode::Binary);
        assert!(second.frame_finished);
        assert!(second.message_finished);
        let mut payload = BytesMut::new();
        for p in [first.payload, second.payload] {
            match p {
                Payload::Bytes(b) => payload.extend_from_slice(&b),
                _ => panic!("binary payload expected")
            }
        }
        assert_eq!(&payload[..], b"chunked payload")
    }

    #[test]
    fn fragmented_message_reassembly() {
        let mut codec = server();
        let mut text = String::new();
        for (bytes, last) in [
            (masked(0x01, [1, 2, 3, 4], b"frag"), false),
            (masked(0x80, [5, 6, 7, 8], b"mented"), true)
        ] {
            let frame = decode(&mut codec, &bytes).unwrap().unwrap();
            assert_eq!(frame.opcode, OpCode::Text);
            assert_eq!(frame.message_finished, last);
            match frame.payload {
                Payload::Text(t) => text += &t,
                _ => panic!("text payload expected")
            }
        }
        assert_eq!(text, "fragmented")
    }

    #[test]
    fn unexpected_continuation() {
        let e = decode(&mut server(), &masked(0x80, [1, 2, 3, 4], b"x")).unwrap_err();
        assert!(e.message.contains("unexpected CONTINUATION"))
    }

    #[test]
    fn missing_continuation() {
        let mut codec = server();
        decode(&mut codec, &masked(0x01, [1, 2, 3, 4], b"a")).unwrap();
        let e = decode(&mut codec, &masked(0x01, [1, 2, 3, 4], b"b")).unwrap_err();
        assert!(e.message.contains("expected CONTINUATION"))
    }

    #[test]
    fn control_frames_interleave_with_fragments() {
        let mut codec = server();
        let first = decode(&mut codec, &masked(0x01, [1, 2, 3, 4], b"he")).unwrap().unwrap();
        assert_eq!(first.opcode, OpCode::Text);
        let ping = decode(&mut codec, &masked(0x89, [1, 2, 3, 4], b"now")).unwrap().unwrap();
        assert_eq!(ping.opcode, OpCode::Ping);
        assert_matches!(ping.payload, Payload::Bytes(b) if &b[..] == b"now");
        let last = decode(&mut codec, &masked(0x80, [1, 2, 3, 4], b"llo")).unwrap().unwrap();
        assert_eq!(last.opcode, OpCode::Text);
        assert!(last.message_finished)
    }

    #[test]
    fn text_split_mid_codepoint_across_frames() {
        let mut codec = server();
        let bytes = "£".as_bytes();
        let first = decode(&mut codec, &masked(0x01, [1, 2, 3, 4], &bytes[.. 1])).unwrap().unwrap();
        assert_matches!(first.payload, Payload::Text(t) if t.is_empty());
        let second = decode(&mut codec, &masked(0x80, [1, 2, 3, 4], &bytes[1 ..])).unwrap().unwrap();
        assert_matches!(second.payload, Payload::Text(t) if t == "£")
    }

    #[test]
    fn truncated_codepoint_at_message_end() {
        let bytes = "£".as_bytes();
        let e = decode(&mut server(), &masked(0x81, [1, 2, 3, 4], &bytes[.. 1])).unwrap_err();
        assert_eq!(e.code, CloseReason::InvalidFramePayloadData)
    }

    #[test]
    fn invalid_utf8_in_text_message() {
        let e = decode(&mut server(), &masked(0x81, [1, 2, 3, 4], &[0xc0, 0x80])).unwrap_err();
        assert_eq!(e.code, CloseReason::InvalidFramePayloadData)
    }

    // Control frames.

    #[test]
    fn ping_with_empty_payload() {
        let frame = decode(&mut server(), &masked(0x89, [0, 1, 2, 3], b"")).unwrap().unwrap();
        assert_eq!(frame.opcode, OpCode::Ping);
        assert_matches!(frame.payload, Payload::Bytes(b) if b.is_empty())
    }

    #[test]
    fn close_with_code_and_reason() {
        let mut payload = 1000_u16.to_be_bytes().to_vec();
        payload.extend_from_slice(b"bye");
        let frame = decode(&mut server(), &masked(0x88, [1, 2, 3, 4], &payload)).unwrap().unwrap();
        assert_matches!(
            frame.payload,
            Payload::Close(CloseReason::NormalClosure, Some(reason)) if reason == "bye"
        )
    }

    #[test]
    fn nothing_is_parsed_after_a_close() {
        let mut codec = server();
        decode(&mut codec, &masked(0x88, [1, 2, 3, 4], &1000_u16.to_be_bytes())).unwrap();
        assert_matches!(decode(&mut codec, &masked(0x89, [1, 2, 3, 4], b"late")), Ok(None))
    }

    // Outbound side.

    #[test]
    fn server_frames_are_unmasked() {
        let bytes = server().send_data(OpCode::Text, BytesMut::from("hi"), true, &mut rng()).unwrap();
        assert_eq!(&bytes[..], &[0x81, 0x02, b'h', b'i'])
    }

    #[test]
    fn client_frames_are_masked() {
        let bytes = client().send_data(OpCode::Text, BytesMut::from("hi"), true, &mut rng()).unwrap();
        assert_eq!(bytes[0], 0x81);
        assert_eq!(bytes[1], 0x82);
        let key = [bytes[2], bytes[3], bytes[4], bytes[5]];
        assert_eq!(bytes[6], b'h' ^ key[0]);
        assert_eq!(bytes[7], b'i' ^ key[1])
    }

    #[test]
    fn masking_keys_are_fresh_per_frame() {
        let mut codec = client();
        let mut rng = rng();
        let a = codec.send_data(OpCode::Text, BytesMut::from("same"), true, &mut rng).unwrap();
        let b = codec.send_data(OpCode::Text, BytesMut::from("same"), true, &mut rng).unwrap();
        assert_ne!(a, b)
    }

    #[test]
    fn outbound_fragmentation_uses_continuations() {
        let mut codec = server();
        let mut rng = rng();
        let first = codec.send_data(OpCode::Binary, BytesMut::from(&b"aa"[..]), false, &mut rng).unwrap();
        assert_eq!(first[0], 0x02);
        let middle = codec.send_data(OpCode::Binary, BytesMut::from(&b"bb"[..]), false, &mut rng).unwrap();
        assert_eq!(middle[0], 0x00);
        let last = codec.send_data(OpCode::Binary, BytesMut::from(&b"cc"[..]), true, &mut rng).unwrap();
        assert_eq!(last[0], 0x80);
        // The next message starts over.
        let next = codec.send_data(OpCode::Binary, BytesMut::from(&b"dd"[..]), true, &mut rng).unwrap();
        assert_eq!(next[0], 0x82)
    }

    #[test]
    fn payload_type_cannot_change_mid_message() {
        let mut codec = server();
        let mut rng = rng();
        codec.send_data(OpCode::Text, BytesMut::from("a"), false, &mut rng).unwrap();
        assert!(codec.send_data(OpCode::Binary, BytesMut::from(&b"b"[..]), true, &mut rng).is_err())
    }

    #[test]
    fn two_byte_length_encoding() {
        let bytes = server()
            .send_data(OpCode::Binary, BytesMut::from(&[0_u8; 126][..]), true, &mut rng())
            .unwrap();
        assert_eq!(&bytes[.. 4], &[0x82, 0x7E, 0x00, 0x7E])
    }

    #[test]
    fn eight_byte_length_encoding() {
        let bytes = server()
            .send_data(OpCode::Binary, BytesMut::from(&vec![0_u8; 65536][..]), true, &mut rng())
            .unwrap();
        assert_eq!(&bytes[.. 10], &[0x82, 0x7F, 0, 0, 0, 0, 0, 1, 0, 0])
    }

    #[test]
    fn control_payloads_are_limited() {
        assert!(server().ping(BytesMut::from(&[0_u8; 126][..]), &mut rng()).is_err());
        assert!(server().pong(BytesMut::from(&[0_u8; 126][..]), &mut rng()).is_err())
    }

    #[test]
    fn pong_starts_with_8a() {
        let bytes = server().pong(BytesMut::from(&[b'x'; 23][..]), &mut rng()).unwrap();
        assert_eq!(bytes[0], 0x8A);
        assert_eq!(bytes[1], 23)
    }

    #[test]
    fn long_close_reasons_are_truncated_on_the_wire() {
        let reason = "£".repeat(100);
        let bytes = server()
            .close(Some(CloseReason::NormalClosure), Some(&reason), &mut rng())
            .unwrap();
        assert_eq!(&bytes[.. 4], &[0x88, 0x7C, 0x03, 0xE8]);
        assert_eq!(bytes.len(), 2 + 124);
        assert_eq!(std::str::from_utf8(&bytes[4 ..]).unwrap(), "£".repeat(61))
    }

    // Round trips.

    fn round_trip(sender: Mode, payload: Vec<u8>, chunks: usize) -> Vec<u8> {
        let mut tx = FrameCodec::new(sender, SmallVec::new());
        let mut rx = FrameCodec::new(
            if sender.is_client() { Mode::Server } else { Mode::Client },
            SmallVec::new()
        );
        let mut rng = rng();
        let split = (payload.len() / chunks.max(1)).max(1);
        let mut sent = BytesMut::new();
        if payload.is_empty() {
            sent.extend_from_slice(&tx.send_data(OpCode::Binary, BytesMut::new(), true, &mut rng).unwrap())
        } else {
            let last = (payload.len() + split - 1) / split - 1;
            for (i, chunk) in payload.chunks(split).enumerate() {
                let frame = tx.send_data(OpCode::Binary, BytesMut::from(chunk), i == last, &mut rng).unwrap();
                sent.extend_from_slice(&frame)
            }
        }
        rx.receive_bytes(&sent);
        let mut out = Vec::new();
        let mut finished = false;
        while let Some(frame) = rx.next_frame().unwrap() {
            assert_eq!(frame.opcode, OpCode::Binary);
            match frame.payload {
                Payload::Bytes(b) => out.extend_from_slice(&b),
                _ => panic!("binary payload expected")
            }
            if frame.message_finished {
                assert!(!finished);
                finished = true
            }
        }
        assert!(finished);
        out
    }

    quickcheck! {
        fn client_to_server_round_trip(payload: Vec<u8>) -> bool {
            round_trip(Mode::Client, payload.clone(), 1) == payload
        }

        fn server_to_client_round_trip(payload: Vec<u8>) -> bool {
            round_trip(Mode::Server, payload.clone(), 1) == payload
        }

        fn fragmented_round_trip(payload: Vec<u8>, chunks: u8) -> bool {
            let chunks = usize::from(chunks % 7) + 1;
            round_trip(Mode::Client, payload.clone(), chunks) == payload
        }
    }

    #[test]
    fn length_encoding_classes_round_trip() {
        for len in [0_usize, 125, 126, 65535, 65536] {
            let payload = vec![0x5A_u8; len];
            assert_eq!(round_trip(Mode::Server, payload.clone(), 1), payload)
        }
    }
}
