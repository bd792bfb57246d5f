// Copyright (c) 2019 Parity Technologies (UK) Ltd.
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! An append-only parse buffer with commit/rollback semantics.
//!
//! Frame headers arrive in up to four variable-length pieces. The parser
//! consumes pieces tentatively and either `commit`s the consumed prefix once
//! the header is complete, or `rollback`s the read cursor and retries the
//! whole header when more bytes have arrived. This avoids copying bytes out
//! for parse attempts that turn out to be short.

use bytes::{Buf, BytesMut};

#[derive(Debug, Default)]
pub(crate) struct Buffer {
    data: BytesMut,
    consumed: usize
}

impl Buffer {
    pub(crate) fn new() -> Self {
        Buffer::default()
    }

    /// Append bytes received from the peer.
    pub(crate) fn feed(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes)
    }

    /// Consume up to `n` bytes past the read cursor without committing.
    pub(crate) fn consume_at_most(&mut self, n: usize) -> BytesMut {
        let end = self.data.len().min(self.consumed + n);
        let out = BytesMut::from(&self.data[self.consumed .. end]);
        self.consumed = end;
        out
    }

    /// Consume exactly `n` bytes, or `None` if fewer are buffered.
    pub(crate) fn consume_exactly(&mut self, n: usize) -> Option<BytesMut> {
        if self.data.len() - self.consumed < n {
            return None
        }
        Some(self.consume_at_most(n))
    }

    /// Discard everything consumed since the last commit.
    pub(crate) fn commit(&mut self) {
        let n = self.consumed;
        self.data.advance(n);
        self.consumed = 0
    }

    /// Return the read cursor to the last commit.
    pub(crate) fn rollback(&mut self) {
        self.consumed = 0
    }

    /// Total number of buffered bytes, including consumed ones.
    pub(crate) fn len(&self) -> usize {
        self.data.len()
    }
}
