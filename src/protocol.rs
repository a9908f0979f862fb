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

//! Dispatching inbound streams to registered protocol handlers.

use crate::{
    connection::Connection,
    error::Error,
    negotiation::{self, Matcher},
    observer::{observe, Observer},
};
use fnv::FnvHashMap;
use futures::io::{AsyncRead, AsyncWrite};
use log::{debug, warn};
use parking_lot::Mutex;
use std::sync::Arc;

/// Invoked with the negotiated protocol string and the stream it was
/// negotiated on.
pub type ProtocolHandler = Arc<dyn Fn(String, Connection) + Send + Sync>;

pub(crate) struct ProtocolEntry {
    pub handler: ProtocolHandler,
    pub matcher: Option<Matcher>,
}

pub(crate) type ProtocolTable = Arc<Mutex<FnvHashMap<String, ProtocolEntry>>>;

/// Negotiates one of the registered protocols over a stream and
/// dispatches it to the protocol's handler.
///
/// Shares the protocol table with the switch, so `handle`/`unhandle`
/// calls are picked up by negotiations that start afterwards.
#[derive(Clone)]
pub struct ProtocolMuxer {
    protocols: ProtocolTable,
    observer: Arc<dyn Observer>,
}

impl ProtocolMuxer {
    pub(crate) fn new(protocols: ProtocolTable, observer: Arc<dyn Observer>) -> ProtocolMuxer {
        ProtocolMuxer {
            protocols,
            observer,
        }
    }

    /// Registers every protocol of the table with a negotiation
    /// listener. Used both for fresh listeners (muxed substreams) and
    /// for the listener an inbound connection already holds.
    pub(crate) fn register_on<S>(&self, listener: &mut negotiation::Listener<S>)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        for (name, entry) in self.protocols.lock().iter() {
            listener.add_handler(name.clone(), entry.matcher.clone());
        }
    }

    /// Wraps the selected stream with an observer tap and invokes the
    /// handler registered under `key`. `protocol` is the string the
    /// remote proposed, which the matcher may have accepted on the
    /// registered protocol's behalf.
    pub(crate) fn dispatch(&self, key: &str, protocol: String, conn: Connection) {
        let handler = match self.protocols.lock().get(key) {
            Some(entry) => entry.handler.clone(),
            None => {
                // Unregistered between negotiation and dispatch.
                warn!("no handler for negotiated protocol {}", protocol);
                return;
            }
        };
        let tapped = observe(conn, None, Some(&protocol), self.observer.clone());
        handler(protocol, tapped);
    }

    /// Full inbound flow for one stream: negotiate a registered
    /// protocol, tap it, hand it to its handler.
    pub(crate) async fn handle(&self, conn: Connection) -> Result<(), Error> {
        let mut listener = negotiation::Listener::new(conn);
        self.register_on(&mut listener);
        let selected = listener.negotiate().await?;
        debug!("negotiated protocol {}", selected.protocol);
        self.dispatch(&selected.key, selected.protocol, selected.io);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{negotiation::Dialer, observer::NullObserver, transport::memory::duplex_pair};
    use futures::io::{AsyncReadExt, AsyncWriteExt};

    fn muxer_with(
        entries: Vec<(&str, Option<Matcher>)>,
    ) -> (ProtocolMuxer, Arc<Mutex<Vec<String>>>) {
        let seen: Arc<Mutex<Vec<String>>> = Arc::default();
        let table: ProtocolTable = Arc::default();
        {
            let mut protocols = table.lock();
            for (name, matcher) in entries {
                let sink = seen.clone();
                let handler: ProtocolHandler = Arc::new(move |protocol, mut conn| {
                    sink.lock().push(protocol);
                    async_std::task::spawn(async move {
                        let mut buf = Vec::new();
                        let _ = conn.read_to_end(&mut buf).await;
                    });
                });
                protocols.insert(
                    name.to_string(),
                    ProtocolEntry { handler, matcher },
                );
            }
        }
        (ProtocolMuxer::new(table, Arc::new(NullObserver)), seen)
    }

    #[async_std::test]
    async fn dispatches_to_exact_handler() {
        let (muxer, seen) = muxer_with(vec![("/echo/1.0.0", None)]);
        let (a, b) = duplex_pair();

        let dialer = async {
            let mut dialer = Dialer::handshake(a).await.unwrap();
            assert!(dialer.select("/echo/1.0.0").await.unwrap());
            let mut io = dialer.into_inner();
            io.close().await.unwrap();
        };
        let listener = muxer.handle(Connection::new(b));
        let (_, handled) = futures::join!(dialer, listener);
        handled.unwrap();

        assert_eq!(seen.lock().as_slice(), ["/echo/1.0.0".to_string()]);
    }

    #[async_std::test]
    async fn matcher_routes_variant_proposals() {
        let matcher: Matcher = Arc::new(|_, proposal| proposal.starts_with("/kad/1."));
        let (muxer, seen) = muxer_with(vec![("/kad/1.0.0", Some(matcher))]);
        let (a, b) = duplex_pair();

        let dialer = async {
            let mut dialer = Dialer::handshake(a).await.unwrap();
            assert!(dialer.select("/kad/1.1.0").await.unwrap());
            let mut io = dialer.into_inner();
            io.close().await.unwrap();
        };
        let listener = muxer.handle(Connection::new(b));
        let (_, handled) = futures::join!(dialer, listener);
        handled.unwrap();

        // The handler sees the proposed string, not the registered key.
        assert_eq!(seen.lock().as_slice(), ["/kad/1.1.0".to_string()]);
    }
}
