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

//! In-process memory transport.
//!
//! Connections are pairs of unbounded byte channels, addressed as
//! `/memory/<id>`. Two switches reach each other by sharing a clone of
//! the same `MemoryTransport` (the hub of bound listeners lives behind
//! the clone). Primarily used by tests and examples.

use super::{AcceptHandler, Listener, Transport};
use crate::connection::Connection;
use fnv::FnvHashMap;
use futures::{
    channel::mpsc,
    future::BoxFuture,
    io::{AsyncRead, AsyncWrite},
    prelude::*,
};
use multiaddr::{Multiaddr, Protocol};
use parking_lot::Mutex;
use std::{
    io,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

/// Creates a connected pair of in-memory duplex streams.
pub fn duplex_pair() -> (MemoryStream, MemoryStream) {
    let (a_tx, a_rx) = mpsc::unbounded();
    let (b_tx, b_rx) = mpsc::unbounded();
    (
        MemoryStream {
            incoming: a_rx,
            outgoing: b_tx,
            pending: Vec::new(),
        },
        MemoryStream {
            incoming: b_rx,
            outgoing: a_tx,
            pending: Vec::new(),
        },
    )
}

/// One half of an in-memory duplex byte stream.
pub struct MemoryStream {
    incoming: mpsc::UnboundedReceiver<Vec<u8>>,
    outgoing: mpsc::UnboundedSender<Vec<u8>>,
    /// Bytes received but not yet read out.
    pending: Vec<u8>,
}

impl AsyncRead for MemoryStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        loop {
            if !this.pending.is_empty() {
                let n = this.pending.len().min(buf.len());
                buf[..n].copy_from_slice(&this.pending[..n]);
                this.pending.drain(..n);
                return Poll::Ready(Ok(n));
            }
            match Pin::new(&mut this.incoming).poll_next(cx) {
                Poll::Ready(Some(chunk)) => this.pending = chunk,
                Poll::Ready(None) => return Poll::Ready(Ok(0)),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl AsyncWrite for MemoryStream {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        this.outgoing
            .unbounded_send(buf.to_vec())
            .map_err(|_| io::Error::from(io::ErrorKind::ConnectionReset))?;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().outgoing.close_channel();
        Poll::Ready(Ok(()))
    }
}

type Hub = Arc<Mutex<FnvHashMap<u64, AcceptHandler>>>;

/// The memory transport. Clones share a hub of bound listeners.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    hub: Hub,
}

impl MemoryTransport {
    pub fn new() -> MemoryTransport {
        MemoryTransport::default()
    }
}

fn memory_port(addr: &Multiaddr) -> Option<u64> {
    match addr.iter().next() {
        Some(Protocol::Memory(port)) => Some(port),
        _ => None,
    }
}

impl Transport for MemoryTransport {
    fn dial(&self, peer: crate::PeerInfo) -> BoxFuture<'static, io::Result<(Connection, Multiaddr)>> {
        let hub = self.hub.clone();
        async move {
            for addr in peer.addrs() {
                let port = match memory_port(&addr) {
                    Some(port) => port,
                    None => continue,
                };
                let handler = hub.lock().get(&port).cloned();
                if let Some(handler) = handler {
                    let (ours, theirs) = duplex_pair();
                    handler(Connection::new(theirs));
                    return Ok((Connection::new(ours), addr));
                }
            }
            Err(io::ErrorKind::ConnectionRefused.into())
        }
        .boxed()
    }

    fn create_listener(&self, handler: AcceptHandler) -> Box<dyn Listener> {
        Box::new(MemoryListener {
            hub: self.hub.clone(),
            handler,
            bound: Vec::new(),
        })
    }

    fn filter(&self, addrs: &[Multiaddr]) -> Vec<Multiaddr> {
        addrs
            .iter()
            .filter(|a| memory_port(a).is_some())
            .cloned()
            .collect()
    }
}

struct MemoryListener {
    hub: Hub,
    handler: AcceptHandler,
    bound: Vec<Multiaddr>,
}

impl Listener for MemoryListener {
    fn listen(&mut self, addrs: Vec<Multiaddr>) -> BoxFuture<'_, io::Result<()>> {
        async move {
            let mut hub = self.hub.lock();
            for addr in addrs {
                let port = memory_port(&addr)
                    .ok_or_else(|| io::Error::from(io::ErrorKind::AddrNotAvailable))?;
                if hub.contains_key(&port) {
                    return Err(io::ErrorKind::AddrInUse.into());
                }
                hub.insert(port, self.handler.clone());
                self.bound.push(addr);
            }
            Ok(())
        }
        .boxed()
    }

    fn close(&mut self) -> BoxFuture<'_, io::Result<()>> {
        async move {
            let mut hub = self.hub.lock();
            for addr in self.bound.drain(..) {
                if let Some(port) = memory_port(&addr) {
                    hub.remove(&port);
                }
            }
            Ok(())
        }
        .boxed()
    }

    fn addrs(&self) -> Vec<Multiaddr> {
        self.bound.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{PeerId, PeerInfo};
    use futures::io::{AsyncReadExt, AsyncWriteExt};

    #[async_std::test]
    async fn duplex_round_trip() {
        let (mut a, mut b) = duplex_pair();
        a.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        b.write_all(b"world").await.unwrap();
        a.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"world");
    }

    #[async_std::test]
    async fn close_yields_eof() {
        let (mut a, mut b) = duplex_pair();
        a.close().await.unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(b.read(&mut buf).await.unwrap(), 0);
    }

    #[async_std::test]
    async fn dial_reaches_bound_listener() {
        let transport = MemoryTransport::new();
        let accepted: Arc<Mutex<Vec<Connection>>> = Arc::default();
        let sink = accepted.clone();
        let handler: AcceptHandler = Arc::new(move |conn| sink.lock().push(conn));

        let mut listener = transport.create_listener(handler);
        listener.listen(vec!["/memory/42".parse().unwrap()]).await.unwrap();

        let peer = PeerInfo::new(PeerId::random());
        peer.add_addr("/memory/42".parse().unwrap());
        let (mut conn, addr) = transport.dial(peer).await.unwrap();
        assert_eq!(addr, "/memory/42".parse().unwrap());
        assert_eq!(accepted.lock().len(), 1);

        let mut inbound = accepted.lock().pop().unwrap();
        conn.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        inbound.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[async_std::test]
    async fn dialing_unbound_port_is_refused() {
        let transport = MemoryTransport::new();
        let peer = PeerInfo::new(PeerId::random());
        peer.add_addr("/memory/9".parse().unwrap());
        assert!(transport.dial(peer).await.is_err());
    }

    #[async_std::test]
    async fn closed_listener_no_longer_accepts() {
        let transport = MemoryTransport::new();
        let handler: AcceptHandler = Arc::new(|_conn| ());
        let mut listener = transport.create_listener(handler);
        listener.listen(vec!["/memory/43".parse().unwrap()]).await.unwrap();
        listener.close().await.unwrap();

        let peer = PeerInfo::new(PeerId::random());
        peer.add_addr("/memory/43".parse().unwrap());
        assert!(transport.dial(peer).await.is_err());
    }
}
