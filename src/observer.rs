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

//! Traffic metering.
//!
//! [`observe`] splices both halves of a connection through a tap that
//! reports every transferred byte to an [`Observer`], tagged with the
//! transport, the protocol and the remote peer. The peer may be
//! unknown when the tap is constructed; it is read from the
//! connection's shared peer-info slot at sample time, so an identity
//! learned later is picked up automatically. The tap adds no
//! backpressure of its own.

use crate::{
    connection::{Connection, PeerSlot, RawIo},
    PeerId,
};
use futures::io::{AsyncRead, AsyncWrite};
use std::{
    io,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

/// Direction of a metered transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Sink for per-transfer samples.
pub trait Observer: Send + Sync {
    fn on_transfer(
        &self,
        direction: Direction,
        bytes: usize,
        transport: Option<&str>,
        protocol: Option<&str>,
        peer: Option<&PeerId>,
    );
}

/// Observer that discards every sample.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullObserver;

impl Observer for NullObserver {
    fn on_transfer(
        &self,
        _: Direction,
        _: usize,
        _: Option<&str>,
        _: Option<&str>,
        _: Option<&PeerId>,
    ) {
    }
}

/// Wraps `conn` so that all traffic is reported to `observer` under
/// the given transport/protocol tags.
pub fn observe(
    conn: Connection,
    transport: Option<&str>,
    protocol: Option<&str>,
    observer: Arc<dyn Observer>,
) -> Connection {
    let (io, slot) = conn.into_parts();
    let tapped = Tap {
        io,
        slot: slot.clone(),
        transport: transport.map(str::to_owned),
        protocol: protocol.map(str::to_owned),
        observer,
    };
    Connection::from_parts(Box::new(tapped), slot)
}

struct Tap {
    io: Box<dyn RawIo>,
    slot: PeerSlot,
    transport: Option<String>,
    protocol: Option<String>,
    observer: Arc<dyn Observer>,
}

impl Tap {
    fn report(&self, direction: Direction, bytes: usize) {
        let peer = self.slot.lock().as_ref().map(|p| p.id().clone());
        self.observer.on_transfer(
            direction,
            bytes,
            self.transport.as_deref(),
            self.protocol.as_deref(),
            peer.as_ref(),
        );
    }
}

impl AsyncRead for Tap {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match Pin::new(&mut this.io).poll_read(cx, buf) {
            Poll::Ready(Ok(n)) => {
                if n > 0 {
                    this.report(Direction::Inbound, n);
                }
                Poll::Ready(Ok(n))
            }
            other => other,
        }
    }
}

impl AsyncWrite for Tap {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match Pin::new(&mut this.io).poll_write(cx, buf) {
            Poll::Ready(Ok(n)) => {
                if n > 0 {
                    this.report(Direction::Outbound, n);
                }
                Poll::Ready(Ok(n))
            }
            other => other,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_flush(cx)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_close(cx)
    }
}
