// Copyright 2021 Parity Technologies (UK) Ltd.
//
// Permission is hereby granted, free of charge, to any person obtaining a
// copy of this software and associated documentation files (the "Software"),
// to deal in the Software without restriction, including without limitation
// the rights to use, copy, modify, merge, publish, distribute, sublicense,
// and/or sell copies of the Software, and to permit persons to whom the
// Software is furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS
// OR IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
// FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
// DEALINGS IN THE SOFTWARE.

//! Errors raised by the switch and its connection state machines.

use crate::connection::state::{Event, State};
use std::io;

/// Sentinel produced by some muxer implementations when they are shut
/// down while a graceful close is already in flight. Treated as success.
pub const SHUTDOWN_SENTINEL: &str = "Fatal error: OK";

/// Error type shared by the switch, the dial scheduler and the
/// connection state machines.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A node attempted to dial its own peer id.
    #[error("A node cannot dial itself")]
    DialSelf,

    /// A dial was requested but no (non-circuit) transport is registered.
    #[error("No transports registered, dial not possible")]
    NoTransports,

    /// Every available transport failed to reach the peer.
    #[error("Could not dial peer {0} over any transport")]
    ConnectionFailed(String),

    /// The dial was aborted before completion.
    #[error("Dial was aborted")]
    DialAborted,

    /// The remote closed the stream in the middle of a negotiation or
    /// handshake.
    #[error("Connection ended unexpectedly")]
    UnexpectedEnd,

    /// Protocol negotiation did not settle on a protocol.
    #[error("Protocol negotiation failed: {0}")]
    Negotiation(String),

    /// The remote identity learned during the crypto handshake did not
    /// match the identity the dial was addressed to.
    #[error("Remote peer identity does not match the dialed peer")]
    PeerIdMismatch,

    /// An event was fed to a state machine that has no edge for it.
    /// The machine stays on its current state.
    #[error("Invalid state transition: {from:?} on {event:?}")]
    InvalidTransition { from: State, event: Event },

    /// The switch was asked to change lifecycle state along an edge
    /// that does not exist (e.g. `stop` while starting).
    #[error("Invalid switch transition: {0}")]
    InvalidSwitchTransition(&'static str),

    /// The switch is not started.
    #[error("The switch is not started")]
    NotStarted,

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// A structurally equal copy, for surfacing the same failure both
    /// on an event channel and on a request callback. `Io` payloads
    /// are rebuilt from kind and message.
    pub(crate) fn duplicate(&self) -> Error {
        match self {
            Error::DialSelf => Error::DialSelf,
            Error::NoTransports => Error::NoTransports,
            Error::ConnectionFailed(peer) => Error::ConnectionFailed(peer.clone()),
            Error::DialAborted => Error::DialAborted,
            Error::UnexpectedEnd => Error::UnexpectedEnd,
            Error::Negotiation(msg) => Error::Negotiation(msg.clone()),
            Error::PeerIdMismatch => Error::PeerIdMismatch,
            Error::InvalidTransition { from, event } => Error::InvalidTransition {
                from: *from,
                event: *event,
            },
            Error::InvalidSwitchTransition(msg) => Error::InvalidSwitchTransition(msg),
            Error::NotStarted => Error::NotStarted,
            Error::Io(err) => Error::Io(io::Error::new(err.kind(), err.to_string())),
        }
    }

    /// Stable identifier for the error kind, aligned with the error
    /// codes of the wider ecosystem.
    pub fn code(&self) -> &'static str {
        match self {
            Error::DialSelf => "DIAL_SELF",
            Error::NoTransports => "NO_TRANSPORTS_REGISTERED",
            Error::ConnectionFailed(_) => "CONNECTION_FAILED",
            Error::DialAborted => "DIAL_ABORTED",
            Error::UnexpectedEnd => "UNEXPECTED_END",
            Error::Negotiation(_) => "NEGOTIATION_FAILED",
            Error::PeerIdMismatch => "PEER_ID_MISMATCH",
            Error::InvalidTransition { .. } => "INVALID_STATE_TRANSITION",
            Error::InvalidSwitchTransition(_) => "INVALID_STATE_TRANSITION",
            Error::NotStarted => "NOT_STARTED",
            Error::Io(_) => "IO",
        }
    }
}

/// Classifies a lower-layer I/O error, mapping an end-of-stream into
/// the dedicated [`Error::UnexpectedEnd`] kind.
pub fn maybe_unexpected_end(err: io::Error) -> Error {
    match err.kind() {
        io::ErrorKind::UnexpectedEof
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::ConnectionReset => Error::UnexpectedEnd,
        _ => Error::Io(err),
    }
}

/// `true` if closing a muxer failed with the benign shutdown sentinel.
pub fn is_shutdown_sentinel(err: &io::Error) -> bool {
    err.to_string().contains(SHUTDOWN_SENTINEL)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unexpected_end_is_classified() {
        let err = maybe_unexpected_end(io::Error::from(io::ErrorKind::UnexpectedEof));
        assert!(matches!(err, Error::UnexpectedEnd));
        assert_eq!(err.code(), "UNEXPECTED_END");

        let err = maybe_unexpected_end(io::Error::from(io::ErrorKind::PermissionDenied));
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn shutdown_sentinel_is_tolerated() {
        let err = io::Error::new(io::ErrorKind::Other, SHUTDOWN_SENTINEL);
        assert!(is_shutdown_sentinel(&err));
        let err = io::Error::new(io::ErrorKind::Other, "some real failure");
        assert!(!is_shutdown_sentinel(&err));
    }
}
