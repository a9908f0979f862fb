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

//! Stream multiplexing over a single encrypted connection.

use crate::connection::Connection;
use futures::future::BoxFuture;
use std::{io, sync::Arc};

pub mod mplex;

/// Something a muxer tells its installer about.
#[derive(Debug)]
pub enum MuxerEvent {
    /// The remote opened a substream.
    InboundStream(Connection),
    /// The muxer shut down, either locally or because the underlying
    /// connection went away. No further events follow.
    Closed,
}

/// A live muxer over one connection.
pub trait StreamMuxer: Send + Sync {
    /// Opens a new outbound substream.
    fn open_stream(&self) -> BoxFuture<'static, io::Result<Connection>>;

    /// Waits for the next muxer event. Yields [`MuxerEvent::Closed`]
    /// once (and then forever) after shutdown.
    fn next_event(&self) -> BoxFuture<'static, MuxerEvent>;

    /// Shuts the muxer down, closing the underlying connection.
    fn close(&self) -> BoxFuture<'static, io::Result<()>>;

    /// The muxer's internal I/O loop, handed out exactly once. The
    /// installer must run it on its executor; a muxer without a
    /// driver makes no progress.
    fn take_driver(&self) -> Option<BoxFuture<'static, ()>>;
}

/// Factory for one muxing protocol, registered in the switch under
/// its multicodec.
pub trait MuxerFactory: Send + Sync {
    fn multicodec(&self) -> &str;
    fn dialer(&self, conn: Connection) -> Arc<dyn StreamMuxer>;
    fn listener(&self, conn: Connection) -> Arc<dyn StreamMuxer>;
}
