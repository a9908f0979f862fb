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

//! Connections and the state machines that upgrade them.
//!
//! A [`Connection`] is the byte stream the upgrade pipeline operates
//! on: a raw transport socket at first, the protected then encrypted
//! stream later, and finally the substreams a muxer hands out. Every
//! layer wrapped over the same socket shares a single peer-info slot,
//! so an identity learned late (e.g. by a listener-side crypto
//! handshake) is visible to observers attached earlier.

use crate::{error::Error, PeerInfo};
use futures::io::{AsyncRead, AsyncWrite};
use parking_lot::Mutex;
use std::{
    fmt, io,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

pub mod inbound;
pub mod outbound;
pub mod state;

pub use inbound::InboundConnection;
pub use outbound::OutboundConnection;
pub use state::{Event, State};

/// Object-safe bound for the raw I/O a connection is built over.
pub trait RawIo: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> RawIo for T {}

/// Shared slot holding the remote identity of a connection once known.
pub(crate) type PeerSlot = Arc<Mutex<Option<PeerInfo>>>;

/// A bidirectional byte stream with an attached, lazily-known remote
/// peer identity.
pub struct Connection {
    io: Box<dyn RawIo>,
    info: PeerSlot,
}

impl Connection {
    /// Wraps a raw duplex with no remote identity attached yet.
    pub fn new(io: impl RawIo + 'static) -> Connection {
        Connection {
            io: Box::new(io),
            info: Arc::new(Mutex::new(None)),
        }
    }

    /// Wraps a raw duplex whose remote identity is already known.
    pub fn with_peer_info(io: impl RawIo + 'static, info: PeerInfo) -> Connection {
        let conn = Connection::new(io);
        conn.set_peer_info(info);
        conn
    }

    /// Attaches the remote identity. Visible to every layer sharing
    /// this connection's slot.
    pub fn set_peer_info(&self, info: PeerInfo) {
        *self.info.lock() = Some(info);
    }

    pub fn peer_info(&self) -> Option<PeerInfo> {
        self.info.lock().clone()
    }

    pub(crate) fn peer_slot(&self) -> PeerSlot {
        self.info.clone()
    }

    pub(crate) fn into_parts(self) -> (Box<dyn RawIo>, PeerSlot) {
        (self.io, self.info)
    }

    pub(crate) fn from_parts(io: Box<dyn RawIo>, info: PeerSlot) -> Connection {
        Connection { io, info }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer_info().map(|p| p.id().to_base58()))
            .finish()
    }
}

impl AsyncRead for Connection {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for Connection {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.io).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_close(cx)
    }
}

/// Events surfaced by a connection state machine to its subscribers.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// A transport dial succeeded; the raw connection is up.
    Connected,
    /// The private-network protector wrapped the connection.
    Private,
    /// The crypto handshake completed.
    Encrypted,
    /// A muxer was negotiated; substreams can be opened.
    Muxed,
    /// No muxer could be negotiated; the connection stays plain.
    Unmuxed,
    /// The connection reached DISCONNECTED.
    Close,
    /// A terminal error for this connection.
    Error(Arc<Error>),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PeerId;
    use futures::io::Cursor;

    #[test]
    fn peer_info_slot_is_shared_across_wraps() {
        let conn = Connection::new(Cursor::new(Vec::new()));
        let (io, slot) = conn.into_parts();
        let rewrapped = Connection::from_parts(io, slot.clone());
        let info = PeerInfo::new(PeerId::random());
        rewrapped.set_peer_info(info.clone());
        assert_eq!(
            slot.lock().as_ref().map(|p| p.id().clone()),
            Some(info.id().clone())
        );
    }
}
