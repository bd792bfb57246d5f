// Copyright (c) 2019 Parity Technologies (UK) Ltd.
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! Error types distinguishing caller mistakes from peer misbehaviour.

use crate::events::Event;

/// The embedder used the engine incorrectly, e.g. sent an event that is not
/// valid in the current connection state. The engine state is unchanged.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct LocalProtocolError {
    message: String
}

impl LocalProtocolError {
    pub(crate) fn new(message: impl Into<String>) -> Self {
        LocalProtocolError { message: message.into() }
    }
}

/// The peer sent malformed or disallowed bytes. The connection is closed.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct RemoteProtocolError {
    message: String,
    /// A suggested response the embedder may send to the peer, e.g. a
    /// [`RejectConnection`](crate::events::RejectConnection) during the
    /// handshake.
    pub event_hint: Option<Event>
}

impl RemoteProtocolError {
    pub(crate) fn new(message: impl Into<String>, event_hint: Option<Event>) -> Self {
        RemoteProtocolError { message: message.into(), event_hint }
    }
}

/// Enumeration of protocol errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The embedder called the engine incorrectly.
    #[error("local protocol error: {0}")]
    Local(#[from] LocalProtocolError),

    /// The peer violated the protocol.
    #[error("remote protocol error: {0}")]
    Remote(#[from] RemoteProtocolError)
}
