// Copyright (c) 2019 Parity Technologies (UK) Ltd.
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! CLOSE frame status codes and payload codec.
//!
//! A CLOSE payload is either empty or a big-endian `u16` status code followed
//! by a UTF-8 encoded reason. Status codes come in ranges defined by
//! [RFC 6455, section 7.4][codes]; a small set of them is local-only and must
//! never appear on the wire.
//!
//! [codes]: https://tools.ietf.org/html/rfc6455#section-7.4

use crate::error::LocalProtocolError;
use crate::frame::ParseFailed;
use bytes::{BufMut, BytesMut};
use std::fmt;

/// Close status codes as defined in RFC 6455, section 7.4.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// 1000; the purpose for which the connection was established has been
    /// fulfilled.
    NormalClosure,
    /// 1001; an endpoint is going away, e.g. a server shutting down.
    GoingAway,
    /// 1002; the peer violated the protocol.
    ProtocolError,
    /// 1003; a type of data was received that cannot be accepted.
    UnsupportedData,
    /// 1005; no status code was present. Local-only, never on the wire.
    NoStatusRcvd,
    /// 1006; the connection closed without a CLOSE frame. Local-only,
    /// never on the wire.
    AbnormalClosure,
    /// 1007; message data was inconsistent with its type, e.g. non-UTF-8
    /// bytes in a text message.
    InvalidFramePayloadData,
    /// 1008; a message violated the endpoint's policy.
    PolicyViolation,
    /// 1009; a message was too big to process.
    MessageTooBig,
    /// 1010; the server did not negotiate a required extension.
    MandatoryExtension,
    /// 1011; the server encountered an unexpected condition.
    InternalError,
    /// 1012; the server or service is restarting.
    ServiceRestart,
    /// 1013; a temporary server condition forced blocking the request.
    TryAgainLater,
    /// 1015; the TLS handshake failed. Local-only, never on the wire.
    TlsHandshakeFailed,
    /// An IANA-registered library code (3000 - 3999).
    Library(u16),
    /// A private application code (4000 - 4999).
    Private(u16)
}

impl CloseReason {
    /// The numeric status code.
    pub fn code(self) -> u16 {
        match self {
            CloseReason::NormalClosure => 1000,
            CloseReason::GoingAway => 1001,
            CloseReason::ProtocolError => 1002,
            CloseReason::UnsupportedData => 1003,
            CloseReason::NoStatusRcvd => 1005,
            CloseReason::AbnormalClosure => 1006,
            CloseReason::InvalidFramePayloadData => 1007,
            CloseReason::PolicyViolation => 1008,
            CloseReason::MessageTooBig => 1009,
            CloseReason::MandatoryExtension => 1010,
            CloseReason::InternalError => 1011,
            CloseReason::ServiceRestart => 1012,
            CloseReason::TryAgainLater => 1013,
            CloseReason::TlsHandshakeFailed => 1015,
            CloseReason::Library(n) => n,
            CloseReason::Private(n) => n
        }
    }

    /// Map a numeric status code to a close reason.
    ///
    /// Returns `None` for codes outside 1000 - 4999 and for codes in the
    /// protocol range (1000 - 2999) that RFC 6455 does not define.
    pub fn from_code(code: u16) -> Option<CloseReason> {
        match code {
            1000 => Some(CloseReason::NormalClosure),
            1001 => Some(CloseReason::GoingAway),
            1002 => Some(CloseReason::ProtocolError),
            1003 => Some(CloseReason::UnsupportedData),
            1005 => Some(CloseReason::NoStatusRcvd),
            1006 => Some(CloseReason::AbnormalClosure),
            1007 => Some(CloseReason::InvalidFramePayloadData),
            1008 => Some(CloseReason::PolicyViolation),
            1009 => Some(CloseReason::MessageTooBig),
            1010 => Some(CloseReason::MandatoryExtension),
            1011 => Some(CloseReason::InternalError),
            1012 => Some(CloseReason::ServiceRestart),
            1013 => Some(CloseReason::TryAgainLater),
            1015 => Some(CloseReason::TlsHandshakeFailed),
            3000 ..= 3999 => Some(CloseReason::Library(code)),
            4000 ..= 4999 => Some(CloseReason::Private(code)),
            _ => None
        }
    }

    /// Is this one of the reserved codes that must never be sent or
    /// accepted on the wire (1005, 1006, 1015)?
    pub fn is_local_only(self) -> bool {
        matches!(
            self,
            CloseReason::NoStatusRcvd | CloseReason::AbnormalClosure | CloseReason::TlsHandshakeFailed
        )
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Parse a complete inbound CLOSE frame payload.
///
/// Returns the close reason and, if the payload carried one, the textual
/// reason string.
pub(crate) fn parse_close_payload(data: &[u8]) -> Result<(CloseReason, Option<String>), ParseFailed> {
    if data.is_empty() {
        // "If this Close control frame contains no status code, _The
        // WebSocket Connection Close Code_ is considered to be 1005."
        return Ok((CloseReason::NoStatusRcvd, None))
    }
    if data.len() == 1 {
        return Err(ParseFailed::protocol("CLOSE frame with a 1 byte payload"))
    }
    let code = u16::from_be_bytes([data[0], data[1]]);
    if !(1000 ..= 4999).contains(&code) {
        return Err(ParseFailed::protocol(format!("CLOSE frame with invalid code {}", code)))
    }
    let reason = match CloseReason::from_code(code) {
        Some(r) if r.is_local_only() => {
            return Err(ParseFailed::protocol(format!("CLOSE frame with local-only code {}", code)))
        }
        Some(r) => r,
        None => return Err(ParseFailed::protocol(format!("CLOSE frame with unknown reserved code {}", code)))
    };
    match std::str::from_utf8(&data[2 ..]) {
        Ok(text) => Ok((reason, Some(text.to_owned()))),
        Err(_) => Err(ParseFailed::new(
            CloseReason::InvalidFramePayloadData,
            "invalid utf-8 in CLOSE reason"
        ))
    }
}

/// Build an outbound CLOSE frame payload.
///
/// Local-only codes are substituted with 1000 and the reason is truncated on
/// a codepoint boundary so the payload never exceeds the 125 byte control
/// frame limit.
pub(crate) fn build_close_payload(
    code: Option<CloseReason>,
    reason: Option<&str>
) -> Result<BytesMut, LocalProtocolError> {
    let code = match code {
        Some(CloseReason::NoStatusRcvd) | None => None,
        Some(c) if c.is_local_only() => Some(CloseReason::NormalClosure),
        Some(c) => Some(c)
    };
    let mut payload = BytesMut::new();
    match code {
        None => {
            if reason.map_or(false, |r| !r.is_empty()) {
                return Err(LocalProtocolError::new("cannot send a CLOSE reason without a code"))
            }
        }
        Some(c) => {
            payload.put_u16(c.code());
            if let Some(r) = reason {
                payload.extend_from_slice(truncate_on_char_boundary(r, 123).as_bytes())
            }
        }
    }
    Ok(payload)
}

/// Cut `s` to at most `max` bytes without splitting a codepoint.
fn truncate_on_char_boundary(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1
    }
    &s[.. end]
}

#[cfg(test)]
mod tests {
    use super::{build_close_payload, parse_close_payload, truncate_on_char_boundary, CloseReason};
    use assert_matches::assert_matches;
    use quickcheck::quickcheck;

    #[test]
    fn empty_payload_means_no_status() {
        assert_eq!(parse_close_payload(b"").unwrap(), (CloseReason::NoStatusRcvd, None))
    }

    #[test]
    fn one_byte_payload_is_rejected() {
        assert!(parse_close_payload(&[0x03]).is_err())
    }

    #[test]
    fn out_of_range_codes_are_rejected() {
        for code in [0_u16, 999, 5000, 65535] {
            assert!(parse_close_payload(&code.to_be_bytes()).is_err())
        }
    }

    #[test]
    fn local_only_codes_are_rejected_on_the_wire() {
        for code in [1005_u16, 1006, 1015] {
            assert!(parse_close_payload(&code.to_be_bytes()).is_err())
        }
    }

    #[test]
    fn unknown_reserved_codes_are_rejected() {
        for code in [1004_u16, 1014, 1016, 1100, 2999] {
            assert!(parse_close_payload(&code.to_be_bytes()).is_err())
        }
    }

    #[test]
    fn library_and_private_codes_are_accepted() {
        assert_eq!(
            parse_close_payload(&3333_u16.to_be_bytes()).unwrap(),
            (CloseReason::Library(3333), Some(String::new()))
        );
        assert_eq!(
            parse_close_payload(&4444_u16.to_be_bytes()).unwrap(),
            (CloseReason::Private(4444), Some(String::new()))
        )
    }

    #[test]
    fn code_with_reason() {
        let mut payload = 1000_u16.to_be_bytes().to_vec();
        payload.extend_from_slice("bye".as_bytes());
        assert_eq!(
            parse_close_payload(&payload).unwrap(),
            (CloseReason::NormalClosure, Some("bye".into()))
        )
    }

    #[test]
    fn invalid_utf8_reason() {
        let mut payload = 1000_u16.to_be_bytes().to_vec();
        payload.extend_from_slice(&[0xc0, 0x80]);
        let e = parse_close_payload(&payload).unwrap_err();
        assert_eq!(e.code, CloseReason::InvalidFramePayloadData)
    }

    #[test]
    fn building_without_code_or_reason_is_empty() {
        assert!(build_close_payload(None, None).unwrap().is_empty())
    }

    #[test]
    fn reason_without_code_is_a_local_error() {
        assert!(build_close_payload(None, Some("why")).is_err())
    }

    #[test]
    fn no_status_behaves_like_no_code() {
        assert!(build_close_payload(Some(CloseReason::NoStatusRcvd), None).unwrap().is_empty())
    }

    #[test]
    fn local_only_codes_become_normal_closure() {
        let payload = build_close_payload(Some(CloseReason::AbnormalClosure), None).unwrap();
        assert_eq!(&payload[..], &1000_u16.to_be_bytes()[..])
    }

    #[test]
    fn long_reasons_are_truncated_on_codepoint_boundaries() {
        let reason = "£".repeat(100); // two bytes per codepoint
        let payload = build_close_payload(Some(CloseReason::NormalClosure), Some(&reason)).unwrap();
        assert_eq!(payload.len(), 124); // 2 byte code + 61 complete pound signs
        assert_matches!(std::str::from_utf8(&payload[2 ..]), Ok(s) if s == "£".repeat(61))
    }

    quickcheck! {
        fn truncation_is_bounded_and_valid(s: String) -> bool {
            let t = truncate_on_char_boundary(&s, 123);
            t.len() <= 123 && s.starts_with(t)
        }

        fn built_close_payloads_fit_control_frames(reason: String) -> bool {
            let payload = build_close_payload(Some(CloseReason::NormalClosure), Some(&reason)).unwrap();
            payload.len() <= 125 && std::str::from_utf8(&payload[2 ..]).is_ok()
        }
    }
}
