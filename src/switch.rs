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

//! The switch: top-level lifecycle, registries and connection tables.

use crate::{
    connection::{
        inbound::handle_incoming, Connection, ConnectionEvent, OutboundConnection,
    },
    crypto::{Crypto, PlainText},
    dialer::{ConnectionHandle, DialRequest, DialScheduler, Reply},
    error::{is_shutdown_sentinel, Error},
    muxing::{MuxerEvent, MuxerFactory, StreamMuxer},
    negotiation::Matcher,
    observer::{NullObserver, Observer},
    protector::Protector,
    protocol::{ProtocolEntry, ProtocolHandler, ProtocolMuxer, ProtocolTable},
    transport::{AcceptHandler, Listener, Transport, TransportRegistry},
    PeerId, PeerInfo,
};
use fnv::FnvHashMap;
use futures::{
    channel::{mpsc, oneshot},
    executor::{ThreadPool, ThreadPoolBuilder},
    future::Future,
};
use log::{debug, info, warn};
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::{io, pin::Pin, sync::Arc};

/// Spawns background tasks: inbound pipelines, muxer drivers and
/// per-peer dial queues.
pub trait Executor: Send + Sync {
    fn exec(&self, future: Pin<Box<dyn Future<Output = ()> + Send>>);
}

struct ThreadPoolExecutor(ThreadPool);

impl Executor for ThreadPoolExecutor {
    fn exec(&self, future: Pin<Box<dyn Future<Output = ()> + Send>>) {
        self.0.spawn_ok(future)
    }
}

/// Events a switch reports to its subscribers.
#[derive(Debug, Clone)]
pub enum SwitchEvent {
    Started,
    Stopped,
    Error(Arc<Error>),
    PeerMuxEstablished(PeerInfo),
    PeerMuxClosed(PeerInfo),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SwitchState {
    Stopped,
    Starting,
    Started,
    Stopping,
}

/// A fully muxed connection registered for a peer.
pub(crate) struct MuxedConn {
    pub(crate) muxer: Arc<dyn StreamMuxer>,
    pub(crate) them: PeerInfo,
    pub(crate) subscribers: SmallVec<[mpsc::UnboundedSender<ConnectionEvent>; 2]>,
}

pub(crate) struct SwitchInner {
    pub(crate) us: PeerInfo,
    pub(crate) transports: Mutex<TransportRegistry>,
    /// Muxer factories in insertion order; negotiation proposes them
    /// in this order.
    muxers: Mutex<Vec<(String, Arc<dyn MuxerFactory>)>>,
    pub(crate) protocols: ProtocolTable,
    /// Encrypted-but-unmuxed connections kept for a later attempt.
    pub(crate) conns: Mutex<FnvHashMap<String, OutboundConnection>>,
    pub(crate) muxed_conns: Mutex<FnvHashMap<String, MuxedConn>>,
    pub(crate) crypto: Arc<dyn Crypto>,
    pub(crate) protector: Option<Arc<dyn Protector>>,
    pub(crate) observer: Arc<dyn Observer>,
    pub(crate) incoming_handler: Option<AcceptHandler>,
    pub(crate) dialer: DialScheduler,
    state: Mutex<SwitchState>,
    subscribers: Mutex<SmallVec<[mpsc::UnboundedSender<SwitchEvent>; 4]>>,
    listeners: Mutex<Vec<Box<dyn Listener>>>,
    executor: Box<dyn Executor>,
}

impl SwitchInner {
    pub(crate) fn spawn(&self, future: impl Future<Output = ()> + Send + 'static) {
        self.executor.exec(Box::pin(future));
    }

    pub(crate) fn emit(&self, event: SwitchEvent) {
        self.subscribers
            .lock()
            .retain(|tx| tx.unbounded_send(event.clone()).is_ok());
    }

    pub(crate) fn emit_error(&self, err: Arc<Error>) {
        self.emit(SwitchEvent::Error(err));
    }

    pub(crate) fn muxer_snapshot(&self) -> Vec<(String, Arc<dyn MuxerFactory>)> {
        self.muxers.lock().clone()
    }

    pub(crate) fn protocol_muxer(&self) -> ProtocolMuxer {
        ProtocolMuxer::new(self.protocols.clone(), self.observer.clone())
    }

    pub(crate) fn remove_muxed(&self, b58: &str) -> Option<MuxedConn> {
        self.muxed_conns.lock().remove(b58)
    }

    fn check_started(&self) -> Result<(), Error> {
        if *self.state.lock() == SwitchState::Started {
            Ok(())
        } else {
            Err(Error::NotStarted)
        }
    }

    /// Tears an unregistered muxed entry down: ends the muxer
    /// (tolerating the benign shutdown sentinel), disconnects the
    /// remote peer info, and notifies everyone.
    pub(crate) async fn close_muxed_entry(&self, entry: MuxedConn) {
        if let Err(err) = entry.muxer.close().await {
            if !is_shutdown_sentinel(&err) {
                warn!("closing muxer for {} failed: {}", entry.them.id(), err);
            }
        }
        entry.them.disconnect();
        for tx in &entry.subscribers {
            let _ = tx.unbounded_send(ConnectionEvent::Close);
        }
        self.emit(SwitchEvent::PeerMuxClosed(entry.them.clone()));
    }

    /// Registers a freshly negotiated muxer for a peer (either
    /// direction), runs its driver, and watches it for inbound
    /// substreams and closure. At most one muxer per peer pair: a
    /// newer one replaces and closes an older one.
    pub(crate) fn install_muxer(
        self: &Arc<Self>,
        them: PeerInfo,
        muxer: Arc<dyn StreamMuxer>,
        subscribers: SmallVec<[mpsc::UnboundedSender<ConnectionEvent>; 2]>,
    ) {
        let b58 = them.id().to_base58();
        let replaced = self.muxed_conns.lock().insert(
            b58.clone(),
            MuxedConn {
                muxer: muxer.clone(),
                them: them.clone(),
                subscribers,
            },
        );
        if let Some(old) = replaced {
            warn!("replacing existing muxer for {}", b58);
            let inner = self.clone();
            self.spawn(async move { inner.close_muxed_entry(old).await });
        }

        if let Some(driver) = muxer.take_driver() {
            self.spawn(driver);
        }

        info!("muxed connection established with {}", b58);
        self.emit(SwitchEvent::PeerMuxEstablished(them.clone()));

        let weak = Arc::downgrade(self);
        let protocol_muxer = self.protocol_muxer();
        self.spawn(async move {
            loop {
                match muxer.next_event().await {
                    MuxerEvent::InboundStream(stream) => {
                        stream.set_peer_info(them.clone());
                        let inner = match weak.upgrade() {
                            Some(inner) => inner,
                            None => break,
                        };
                        let protocol_muxer = protocol_muxer.clone();
                        inner.spawn(async move {
                            if let Err(err) = protocol_muxer.handle(stream).await {
                                debug!("inbound substream dropped: {}", err);
                            }
                        });
                    }
                    MuxerEvent::Closed => {
                        if let Some(inner) = weak.upgrade() {
                            if let Some(entry) = inner.remove_muxed(&b58) {
                                inner.close_muxed_entry(entry).await;
                            }
                        }
                        break;
                    }
                }
            }
        });
    }
}

/// Configures and creates a [`Switch`].
pub struct SwitchBuilder {
    us: PeerInfo,
    crypto: Arc<dyn Crypto>,
    protector: Option<Arc<dyn Protector>>,
    observer: Arc<dyn Observer>,
    executor: Option<Box<dyn Executor>>,
    incoming_handler: Option<AcceptHandler>,
}

impl SwitchBuilder {
    pub fn new(us: PeerInfo) -> SwitchBuilder {
        SwitchBuilder {
            us,
            crypto: Arc::new(PlainText),
            protector: None,
            observer: Arc::new(NullObserver),
            executor: None,
            incoming_handler: None,
        }
    }

    /// Replaces the default plaintext crypto.
    pub fn crypto(mut self, crypto: impl Crypto + 'static) -> SwitchBuilder {
        self.crypto = Arc::new(crypto);
        self
    }

    /// Enables private-network protection for every connection.
    pub fn protector(mut self, protector: impl Protector + 'static) -> SwitchBuilder {
        self.protector = Some(Arc::new(protector));
        self
    }

    pub fn observer(mut self, observer: impl Observer + 'static) -> SwitchBuilder {
        self.observer = Arc::new(observer);
        self
    }

    /// Sets the executor to use to spawn background tasks. By default,
    /// a thread pool.
    pub fn executor(mut self, executor: impl Executor + 'static) -> SwitchBuilder {
        self.executor = Some(Box::new(executor));
        self
    }

    /// Takes over accepted connections right after protection,
    /// bypassing the crypto and muxer upgrade.
    pub fn incoming_handler(
        mut self,
        handler: impl Fn(Connection) + Send + Sync + 'static,
    ) -> SwitchBuilder {
        self.incoming_handler = Some(Arc::new(handler));
        self
    }

    pub fn build(self) -> io::Result<Switch> {
        let executor = match self.executor {
            Some(executor) => executor,
            None => Box::new(ThreadPoolExecutor(
                ThreadPoolBuilder::new().name_prefix("switch-task-").create()?,
            )),
        };
        Ok(Switch {
            inner: Arc::new(SwitchInner {
                us: self.us,
                transports: Mutex::new(TransportRegistry::new()),
                muxers: Mutex::new(Vec::new()),
                protocols: ProtocolTable::default(),
                conns: Mutex::new(FnvHashMap::default()),
                muxed_conns: Mutex::new(FnvHashMap::default()),
                crypto: self.crypto,
                protector: self.protector,
                observer: self.observer,
                incoming_handler: self.incoming_handler,
                dialer: DialScheduler::new(),
                state: Mutex::new(SwitchState::Stopped),
                subscribers: Mutex::new(SmallVec::new()),
                listeners: Mutex::new(Vec::new()),
                executor,
            }),
        })
    }
}

/// The connection switch: dials, upgrades and multiplexes connections
/// between peers across pluggable transports, crypto layers and
/// stream muxers.
pub struct Switch {
    inner: Arc<SwitchInner>,
}

impl Switch {
    pub fn builder(us: PeerInfo) -> SwitchBuilder {
        SwitchBuilder::new(us)
    }

    pub fn local_peer(&self) -> &PeerInfo {
        &self.inner.us
    }

    /// Registers a transport under `tag`.
    pub fn add_transport(&self, tag: impl Into<String>, transport: Arc<dyn Transport>) {
        self.inner.transports.lock().add(tag, transport);
    }

    /// Registers a muxer factory. Negotiation proposes muxers in
    /// registration order.
    pub fn add_muxer(&self, factory: Arc<dyn MuxerFactory>) {
        let codec = factory.multicodec().to_string();
        let mut muxers = self.inner.muxers.lock();
        if muxers.iter().any(|(c, _)| *c == codec) {
            return;
        }
        muxers.push((codec, factory));
    }

    /// Registers a handler for `protocol`. With a matcher, the
    /// matcher decides which proposals the handler accepts; otherwise
    /// only the exact protocol string does.
    pub fn handle(
        &self,
        protocol: impl Into<String>,
        handler: ProtocolHandler,
        matcher: Option<Matcher>,
    ) {
        self.inner
            .protocols
            .lock()
            .insert(protocol.into(), ProtocolEntry { handler, matcher });
    }

    /// Removes the handler for `protocol`.
    pub fn unhandle(&self, protocol: &str) {
        self.inner.protocols.lock().remove(protocol);
    }

    /// Subscribes to switch events.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<SwitchEvent> {
        let (tx, rx) = mpsc::unbounded();
        self.inner.subscribers.lock().push(tx);
        rx
    }

    /// `true` if a muxed connection to `peer` is registered.
    pub fn is_connected(&self, peer: &PeerId) -> bool {
        self.inner.muxed_conns.lock().contains_key(&peer.to_base58())
    }

    /// `true` if an encrypted-but-unmuxed connection to `peer` is
    /// registered.
    pub fn has_unmuxed(&self, peer: &PeerId) -> bool {
        self.inner.conns.lock().contains_key(&peer.to_base58())
    }

    /// Starts the switch: binds a listener for every transport whose
    /// filter accepts one of the local addresses. A no-op when
    /// already started.
    pub async fn start(&self) -> Result<(), Error> {
        {
            let mut state = self.inner.state.lock();
            match *state {
                SwitchState::Stopped => *state = SwitchState::Starting,
                SwitchState::Started | SwitchState::Starting => return Ok(()),
                SwitchState::Stopping => {
                    return Err(Error::InvalidSwitchTransition("start while stopping"))
                }
            }
        }

        self.inner.dialer.reset();

        let weak = Arc::downgrade(&self.inner);
        let handler: AcceptHandler = Arc::new(move |conn| {
            if let Some(inner) = weak.upgrade() {
                let task_inner = inner.clone();
                inner.spawn(handle_incoming(task_inner, conn));
            }
        });

        let transports = self.inner.transports.lock().snapshot();
        let local_addrs = self.inner.us.addrs();
        let mut bound: Vec<Box<dyn Listener>> = Vec::new();
        for (tag, transport) in transports {
            let filtered = transport.filter(&local_addrs);
            if filtered.is_empty() {
                continue;
            }
            let mut listener = transport.create_listener(handler.clone());
            if let Err(err) = listener.listen(filtered).await {
                for mut listener in bound {
                    let _ = listener.close().await;
                }
                *self.inner.state.lock() = SwitchState::Stopped;
                return Err(Error::Io(err));
            }
            debug!("listening via {} on {:?}", tag, listener.addrs());
            bound.push(listener);
        }
        *self.inner.listeners.lock() = bound;

        *self.inner.state.lock() = SwitchState::Started;
        self.inner.emit(SwitchEvent::Started);
        Ok(())
    }

    /// Stops the switch: aborts pending dials, ends every muxer and
    /// closes every listener. A no-op when already stopped.
    pub async fn stop(&self) -> Result<(), Error> {
        {
            let mut state = self.inner.state.lock();
            match *state {
                SwitchState::Started => *state = SwitchState::Stopping,
                SwitchState::Stopped | SwitchState::Stopping => return Ok(()),
                SwitchState::Starting => {
                    return Err(Error::InvalidSwitchTransition("stop while starting"))
                }
            }
        }

        self.inner.dialer.abort();

        let muxed: Vec<MuxedConn> = {
            let mut muxed_conns = self.inner.muxed_conns.lock();
            muxed_conns.drain().map(|(_, entry)| entry).collect()
        };
        for entry in muxed {
            self.inner.close_muxed_entry(entry).await;
        }

        let unmuxed: Vec<OutboundConnection> = {
            let mut conns = self.inner.conns.lock();
            conns.drain().map(|(_, fsm)| fsm).collect()
        };
        for mut fsm in unmuxed {
            fsm.disconnect(&self.inner).await;
        }

        let listeners = std::mem::take(&mut *self.inner.listeners.lock());
        for mut listener in listeners {
            if let Err(err) = listener.close().await {
                warn!("closing listener failed: {}", err);
            }
        }

        *self.inner.state.lock() = SwitchState::Stopped;
        self.inner.emit(SwitchEvent::Stopped);
        Ok(())
    }

    /// Dials `peer` and, if `protocol` is given, opens a substream
    /// handshaked to that protocol. Concurrent dials to one peer are
    /// coalesced onto a single transport dial and muxer.
    pub async fn dial(
        &self,
        peer: PeerInfo,
        protocol: Option<&str>,
    ) -> Result<Option<Connection>, Error> {
        self.inner.check_started()?;
        self.check_dial_self(&peer)?;
        let (tx, rx) = oneshot::channel();
        self.inner.dialer.enqueue(
            &self.inner,
            DialRequest {
                peer,
                protocol: protocol.map(str::to_owned),
                reply: Reply::Stream(tx),
            },
        );
        rx.await.map_err(|_| Error::DialAborted)?
    }

    /// Dials `peer` and surfaces the connection handle as soon as the
    /// state machine exists. A protocol named here is still
    /// handshaked; the stream arrives on the handle.
    pub async fn dial_fsm(
        &self,
        peer: PeerInfo,
        protocol: Option<&str>,
    ) -> Result<ConnectionHandle, Error> {
        self.inner.check_started()?;
        self.check_dial_self(&peer)?;
        let (tx, rx) = oneshot::channel();
        self.inner.dialer.enqueue(
            &self.inner,
            DialRequest {
                peer,
                protocol: protocol.map(str::to_owned),
                reply: Reply::Fsm(tx),
            },
        );
        rx.await.map_err(|_| Error::DialAborted)?
    }

    fn check_dial_self(&self, peer: &PeerInfo) -> Result<(), Error> {
        if peer.id() == self.inner.us.id() {
            let err = Error::DialSelf;
            self.inner.emit_error(Arc::new(err.duplicate()));
            return Err(err);
        }
        Ok(())
    }

    /// Closes whatever connection exists to `peer`. Completes after
    /// the muxer's closure has been observed.
    pub async fn hang_up(&self, peer: &PeerId) -> Result<(), Error> {
        let b58 = peer.to_base58();
        if let Some(entry) = self.inner.remove_muxed(&b58) {
            self.inner.close_muxed_entry(entry).await;
            return Ok(());
        }
        let stored = self.inner.conns.lock().remove(&b58);
        if let Some(mut fsm) = stored {
            fsm.disconnect(&self.inner).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults() {
        let switch = Switch::builder(PeerInfo::new(PeerId::random()))
            .build()
            .unwrap();
        assert!(!switch.is_connected(&PeerId::random()));
        assert_eq!(switch.inner.crypto.tag(), PlainText::TAG);
    }

    #[async_std::test]
    async fn lifecycle_edges() {
        let us = PeerInfo::new(PeerId::random());
        let switch = Switch::builder(us).build().unwrap();

        // stop while stopped is a no-op
        switch.stop().await.unwrap();
        switch.start().await.unwrap();
        // re-entrant start is a no-op
        switch.start().await.unwrap();
        switch.stop().await.unwrap();
    }

    #[async_std::test]
    async fn dial_requires_started() {
        let switch = Switch::builder(PeerInfo::new(PeerId::random()))
            .build()
            .unwrap();
        let peer = PeerInfo::new(PeerId::random());
        let err = switch.dial(peer, None).await.unwrap_err();
        assert_eq!(err.code(), "NOT_STARTED");
    }

    #[async_std::test]
    async fn dial_self_is_rejected() {
        let us = PeerInfo::new(PeerId::random());
        let switch = Switch::builder(us.clone()).build().unwrap();
        switch.start().await.unwrap();

        let mut events = switch.subscribe();
        let err = switch.dial(us, None).await.unwrap_err();
        assert_eq!(err.code(), "DIAL_SELF");

        use futures::StreamExt;
        match events.next().await {
            Some(SwitchEvent::Error(err)) => assert_eq!(err.code(), "DIAL_SELF"),
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
