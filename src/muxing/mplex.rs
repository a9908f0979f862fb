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

//! Minimal mplex stream muxer.
//!
//! Frames are `varint((id << 3) | flag)`, `varint(len)`, payload.
//! Substream writes go through an internal channel serialized by the
//! driver, so they never contend on the underlying connection. This
//! implementation covers open/message/close; it is not a hardened
//! mplex (no per-stream flow control, resets are treated as closes).

use super::{MuxerEvent, MuxerFactory, StreamMuxer};
use crate::connection::Connection;
use bytes::{BufMut, BytesMut};
use fnv::FnvHashMap;
use futures::{
    channel::{mpsc, oneshot},
    future::BoxFuture,
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf},
    lock::Mutex as AsyncMutex,
    prelude::*,
};
use log::{debug, trace};
use parking_lot::Mutex;
use std::{
    io,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    task::{Context, Poll},
};

pub const MULTICODEC: &str = "/mplex/6.7.0";

const NEW_STREAM: u64 = 0;
const MESSAGE_RECEIVER: u64 = 1;
const MESSAGE_INITIATOR: u64 = 2;
const CLOSE_RECEIVER: u64 = 3;
const CLOSE_INITIATOR: u64 = 4;
const RESET_RECEIVER: u64 = 5;
const RESET_INITIATOR: u64 = 6;

/// Maximum accepted frame payload.
const MAX_FRAME_LEN: usize = 1024 * 1024;

/// The mplex muxer factory.
#[derive(Debug, Default, Clone, Copy)]
pub struct Mplex;

impl MuxerFactory for Mplex {
    fn multicodec(&self) -> &str {
        MULTICODEC
    }

    fn dialer(&self, conn: Connection) -> Arc<dyn StreamMuxer> {
        Arc::new(MplexMuxer::new(conn, true))
    }

    fn listener(&self, conn: Connection) -> Arc<dyn StreamMuxer> {
        Arc::new(MplexMuxer::new(conn, false))
    }
}

/// A stream key: the wire id plus whether we opened it. The initiator
/// bit disambiguates ids allocated independently by both ends.
type StreamKey = (u64, bool);

enum Command {
    Open(u64),
    Data(StreamKey, Vec<u8>),
    Close(StreamKey),
    Shutdown(oneshot::Sender<()>),
}

struct Shared {
    /// Inbound routing: data for live substreams.
    streams: Mutex<FnvHashMap<StreamKey, mpsc::UnboundedSender<Vec<u8>>>>,
    commands: mpsc::UnboundedSender<Command>,
    events: mpsc::UnboundedSender<MuxerEvent>,
    event_rx: AsyncMutex<mpsc::UnboundedReceiver<MuxerEvent>>,
    next_id: Mutex<u64>,
    closed: AtomicBool,
}

impl Shared {
    fn emit_closed(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.streams.lock().clear();
            let _ = self.events.unbounded_send(MuxerEvent::Closed);
        }
    }
}

pub struct MplexMuxer {
    shared: Arc<Shared>,
    driver: Mutex<Option<BoxFuture<'static, ()>>>,
}

impl MplexMuxer {
    fn new(conn: Connection, initiator: bool) -> MplexMuxer {
        let (command_tx, command_rx) = mpsc::unbounded();
        let (event_tx, event_rx) = mpsc::unbounded();
        let shared = Arc::new(Shared {
            streams: Mutex::new(FnvHashMap::default()),
            commands: command_tx,
            events: event_tx,
            event_rx: AsyncMutex::new(event_rx),
            // Both ends allocate ids independently; the initiator bit
            // in the stream key keeps them apart.
            next_id: Mutex::new(if initiator { 0 } else { 1 }),
            closed: AtomicBool::new(false),
        });

        let (read_half, write_half) = conn.split();
        let driver = drive(shared.clone(), read_half, write_half, command_rx).boxed();

        MplexMuxer {
            shared,
            driver: Mutex::new(Some(driver)),
        }
    }
}

impl StreamMuxer for MplexMuxer {
    fn open_stream(&self) -> BoxFuture<'static, io::Result<Connection>> {
        let shared = self.shared.clone();
        async move {
            if shared.closed.load(Ordering::SeqCst) {
                return Err(io::ErrorKind::NotConnected.into());
            }
            let id = {
                let mut next = shared.next_id.lock();
                let id = *next;
                *next += 2;
                id
            };
            let key = (id, true);
            let (data_tx, data_rx) = mpsc::unbounded();
            shared.streams.lock().insert(key, data_tx);
            shared
                .commands
                .unbounded_send(Command::Open(id))
                .map_err(|_| io::Error::from(io::ErrorKind::NotConnected))?;
            trace!("opened substream {}", id);
            Ok(Connection::new(Substream {
                key,
                incoming: data_rx,
                pending: Vec::new(),
                commands: shared.commands.clone(),
                write_closed: false,
            }))
        }
        .boxed()
    }

    fn next_event(&self) -> BoxFuture<'static, MuxerEvent> {
        let shared = self.shared.clone();
        async move {
            let mut rx = shared.event_rx.lock().await;
            match rx.next().await {
                Some(event) => event,
                None => MuxerEvent::Closed,
            }
        }
        .boxed()
    }

    fn close(&self) -> BoxFuture<'static, io::Result<()>> {
        let shared = self.shared.clone();
        async move {
            let (ack_tx, ack_rx) = oneshot::channel();
            if shared
                .commands
                .unbounded_send(Command::Shutdown(ack_tx))
                .is_ok()
            {
                let _ = ack_rx.await;
            }
            shared.emit_closed();
            Ok(())
        }
        .boxed()
    }

    fn take_driver(&self) -> Option<BoxFuture<'static, ()>> {
        self.driver.lock().take()
    }
}

/// The muxer's I/O loop: routes inbound frames and serializes
/// outbound commands onto the connection.
async fn drive(
    shared: Arc<Shared>,
    read_half: ReadHalf<Connection>,
    write_half: WriteHalf<Connection>,
    command_rx: mpsc::UnboundedReceiver<Command>,
) {
    let reader = read_loop(shared.clone(), read_half);
    let writer = write_loop(write_half, command_rx);
    futures::join!(reader, writer);
    shared.emit_closed();
}

async fn read_varint(io: &mut (impl AsyncRead + Unpin)) -> io::Result<u64> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        let mut byte = [0u8; 1];
        io.read_exact(&mut byte).await?;
        value |= ((byte[0] & 0x7f) as u64) << shift;
        if byte[0] & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
        if shift > 63 {
            return Err(io::ErrorKind::InvalidData.into());
        }
    }
}

async fn read_loop(shared: Arc<Shared>, mut io: ReadHalf<Connection>) {
    loop {
        let header = match read_varint(&mut io).await {
            Ok(header) => header,
            Err(err) => {
                debug!("mplex read loop ended: {}", err);
                break;
            }
        };
        let len = match read_varint(&mut io).await {
            Ok(len) if (len as usize) <= MAX_FRAME_LEN => len as usize,
            _ => break,
        };
        let mut payload = vec![0u8; len];
        if io.read_exact(&mut payload).await.is_err() {
            break;
        }

        let id = header >> 3;
        match header & 7 {
            NEW_STREAM => {
                let key = (id, false);
                let (data_tx, data_rx) = mpsc::unbounded();
                shared.streams.lock().insert(key, data_tx);
                let substream = Connection::new(Substream {
                    key,
                    incoming: data_rx,
                    pending: Vec::new(),
                    commands: shared.commands.clone(),
                    write_closed: false,
                });
                let _ = shared
                    .events
                    .unbounded_send(MuxerEvent::InboundStream(substream));
            }
            MESSAGE_INITIATOR => route(&shared, (id, false), payload),
            MESSAGE_RECEIVER => route(&shared, (id, true), payload),
            CLOSE_INITIATOR | RESET_INITIATOR => drop_stream(&shared, (id, false)),
            CLOSE_RECEIVER | RESET_RECEIVER => drop_stream(&shared, (id, true)),
            other => {
                debug!("unknown mplex flag {}", other);
                break;
            }
        }
    }
    shared.emit_closed();
}

fn route(shared: &Shared, key: StreamKey, payload: Vec<u8>) {
    let streams = shared.streams.lock();
    if let Some(tx) = streams.get(&key) {
        let _ = tx.unbounded_send(payload);
    }
}

fn drop_stream(shared: &Shared, key: StreamKey) {
    shared.streams.lock().remove(&key);
}

fn encode_frame(out: &mut BytesMut, header: u64, payload: &[u8]) {
    let mut header_buf = unsigned_varint::encode::u64_buffer();
    out.put_slice(unsigned_varint::encode::u64(header, &mut header_buf));
    let mut len_buf = unsigned_varint::encode::usize_buffer();
    out.put_slice(unsigned_varint::encode::usize(payload.len(), &mut len_buf));
    out.put_slice(payload);
}

async fn write_loop(
    mut io: WriteHalf<Connection>,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    while let Some(command) = commands.next().await {
        let mut out = BytesMut::new();
        match command {
            Command::Open(id) => encode_frame(&mut out, id << 3 | NEW_STREAM, &[]),
            Command::Data((id, initiator), data) => {
                let flag = if initiator { MESSAGE_INITIATOR } else { MESSAGE_RECEIVER };
                encode_frame(&mut out, id << 3 | flag, &data)
            }
            Command::Close((id, initiator)) => {
                let flag = if initiator { CLOSE_INITIATOR } else { CLOSE_RECEIVER };
                encode_frame(&mut out, id << 3 | flag, &[])
            }
            Command::Shutdown(ack) => {
                let _ = io.close().await;
                let _ = ack.send(());
                return;
            }
        }
        if io.write_all(&out).await.is_err() || io.flush().await.is_err() {
            return;
        }
    }
    let _ = io.close().await;
}

/// One logical stream over the muxed connection.
struct Substream {
    key: StreamKey,
    incoming: mpsc::UnboundedReceiver<Vec<u8>>,
    pending: Vec<u8>,
    commands: mpsc::UnboundedSender<Command>,
    write_closed: bool,
}

impl AsyncRead for Substream {
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

impl AsyncWrite for Substream {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.write_closed {
            return Poll::Ready(Err(io::ErrorKind::NotConnected.into()));
        }
        this.commands
            .unbounded_send(Command::Data(this.key, buf.to_vec()))
            .map_err(|_| io::Error::from(io::ErrorKind::NotConnected))?;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.write_closed {
            this.write_closed = true;
            let _ = this.commands.unbounded_send(Command::Close(this.key));
        }
        Poll::Ready(Ok(()))
    }
}

impl Drop for Substream {
    fn drop(&mut self) {
        if !self.write_closed {
            let _ = self.commands.unbounded_send(Command::Close(self.key));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::duplex_pair;
    use futures::io::{AsyncReadExt, AsyncWriteExt};

    fn muxer_pair() -> (Arc<dyn StreamMuxer>, Arc<dyn StreamMuxer>) {
        let (a, b) = duplex_pair();
        let dialer = Mplex.dialer(Connection::new(a));
        let listener = Mplex.listener(Connection::new(b));
        async_std::task::spawn(dialer.take_driver().unwrap());
        async_std::task::spawn(listener.take_driver().unwrap());
        (dialer, listener)
    }

    #[async_std::test]
    async fn substream_round_trip() {
        let (dialer, listener) = muxer_pair();

        let mut outbound = dialer.open_stream().await.unwrap();
        outbound.write_all(b"hello").await.unwrap();

        let mut inbound = match listener.next_event().await {
            MuxerEvent::InboundStream(stream) => stream,
            other => panic!("unexpected event: {:?}", other),
        };
        let mut buf = [0u8; 5];
        inbound.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        inbound.write_all(b"world").await.unwrap();
        outbound.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"world");
    }

    #[async_std::test]
    async fn streams_are_independent() {
        let (dialer, listener) = muxer_pair();

        let mut s1 = dialer.open_stream().await.unwrap();
        let mut s2 = dialer.open_stream().await.unwrap();
        s2.write_all(b"two").await.unwrap();
        s1.write_all(b"one").await.unwrap();

        let mut in1 = match listener.next_event().await {
            MuxerEvent::InboundStream(stream) => stream,
            other => panic!("unexpected event: {:?}", other),
        };
        let mut in2 = match listener.next_event().await {
            MuxerEvent::InboundStream(stream) => stream,
            other => panic!("unexpected event: {:?}", other),
        };

        let mut buf = [0u8; 3];
        in1.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"one");
        in2.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"two");
    }

    #[async_std::test]
    async fn close_surfaces_on_both_ends() {
        let (dialer, listener) = muxer_pair();
        dialer.close().await.unwrap();
        assert!(matches!(dialer.next_event().await, MuxerEvent::Closed));
        assert!(matches!(listener.next_event().await, MuxerEvent::Closed));
    }
}
