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

//! The outbound connection state machine.
//!
//! One `OutboundConnection` owns exactly one raw → secure → muxed
//! progression. Its driver (the per-peer dial queue) calls the stage
//! methods in order; each stage performs the transition, runs the
//! entry action and reports failure by taking the disconnect edge.

use super::{
    state::{outbound_transition, Event, State},
    Connection, ConnectionEvent,
};
use crate::{
    error::{maybe_unexpected_end, Error},
    muxing::StreamMuxer,
    negotiation,
    observer::observe,
    switch::SwitchInner,
    transport::CIRCUIT_TAG,
    PeerInfo,
};
use crate::MuxerFactory;
use futures::channel::mpsc;
use log::{debug, error, trace, warn};
use multiaddr::{Multiaddr, Protocol};
use smallvec::SmallVec;
use std::sync::Arc;

/// How a fully driven upgrade pipeline ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DriveOutcome {
    /// A muxer was negotiated and registered.
    Muxed,
    /// The connection is encrypted but carries no muxer.
    Unmuxed,
}

pub struct OutboundConnection {
    them: PeerInfo,
    state: State,
    conn: Option<Connection>,
    /// A multistream session on `conn` whose header exchange already
    /// ran (left over from a muxer negotiation that ended in `na`).
    /// The next protocol handshake must resume it, not restart it.
    session_open: bool,
    muxer: Option<Arc<dyn StreamMuxer>>,
    subscribers: SmallVec<[mpsc::UnboundedSender<ConnectionEvent>; 2]>,
    /// The circuit fallback address is appended at most once.
    circuit_tried: bool,
}

impl OutboundConnection {
    pub(crate) fn new(them: PeerInfo) -> OutboundConnection {
        OutboundConnection {
            them,
            state: State::Disconnected,
            conn: None,
            session_open: false,
            muxer: None,
            subscribers: SmallVec::new(),
            circuit_tried: false,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn peer(&self) -> &PeerInfo {
        &self.them
    }

    pub(crate) fn has_conn(&self) -> bool {
        self.conn.is_some()
    }

    pub(crate) fn subscribe(&mut self, tx: mpsc::UnboundedSender<ConnectionEvent>) {
        self.subscribers.push(tx);
    }

    fn emit(&mut self, event: ConnectionEvent) {
        self.subscribers
            .retain(|tx| tx.unbounded_send(event.clone()).is_ok());
    }

    /// Performs one transition. An event with no edge from the current
    /// state is logged and leaves the machine in place.
    fn step(&mut self, event: Event) -> Result<State, Error> {
        match outbound_transition(self.state, event) {
            Some(next) => {
                trace!(
                    "connection to {}: {:?} -{:?}-> {:?}",
                    self.them.id(),
                    self.state,
                    event,
                    next
                );
                self.state = next;
                Ok(next)
            }
            None => {
                let err = Error::InvalidTransition {
                    from: self.state,
                    event,
                };
                error!("{}", err);
                Err(err)
            }
        }
    }

    /// Runs the whole upgrade pipeline. `aborted` is polled between
    /// stages; once it reports `true` the machine aborts if its state
    /// allows, and otherwise disconnects.
    pub(crate) async fn drive(
        &mut self,
        inner: &Arc<SwitchInner>,
        aborted: impl Fn() -> bool,
    ) -> Result<DriveOutcome, Error> {
        self.dial(inner).await?;
        if self.check_aborted(inner, &aborted).await? {
            return Err(Error::DialAborted);
        }
        if inner.protector.is_some() {
            self.privatize(inner).await?;
            if self.check_aborted(inner, &aborted).await? {
                return Err(Error::DialAborted);
            }
        }
        self.encrypt(inner).await?;
        if self.check_aborted(inner, &aborted).await? {
            return Err(Error::DialAborted);
        }
        self.upgrade(inner).await
    }

    async fn check_aborted(
        &mut self,
        inner: &Arc<SwitchInner>,
        aborted: &impl Fn() -> bool,
    ) -> Result<bool, Error> {
        if !aborted() {
            return Ok(false);
        }
        if outbound_transition(self.state, Event::Abort).is_some() {
            let _ = self.step(Event::Abort);
            if let Some(mut conn) = self.conn.take() {
                let _ = futures::io::AsyncWriteExt::close(&mut conn).await;
            }
        } else {
            self.disconnect(inner).await;
        }
        Ok(true)
    }

    /// DIALING: iterate the available transports in order, falling
    /// back to the circuit relay as a last resort.
    async fn dial(&mut self, inner: &Arc<SwitchInner>) -> Result<(), Error> {
        self.step(Event::Dial)?;

        let (tags, has_non_circuit, circuit_registered) = {
            let transports = inner.transports.lock();
            (
                transports.available_transports(&self.them),
                transports.has_non_circuit(),
                transports.is_registered(CIRCUIT_TAG),
            )
        };

        if !has_non_circuit {
            return Err(self.fail(inner, Error::NoTransports, true).await);
        }

        for tag in &tags {
            if self.try_transport(inner, tag).await {
                self.step(Event::Done)?;
                self.emit(ConnectionEvent::Connected);
                return Ok(());
            }
        }

        // Every direct transport failed. If a circuit relay is
        // registered and its filter never matched, give the peer a
        // circuit address and try exactly once more.
        if circuit_registered
            && !tags.iter().any(|t| t.as_str() == CIRCUIT_TAG)
            && !self.circuit_tried
        {
            self.circuit_tried = true;
            self.them.add_addr(circuit_addr(&self.them));
            if self.try_transport(inner, CIRCUIT_TAG).await {
                self.step(Event::Done)?;
                self.emit(ConnectionEvent::Connected);
                return Ok(());
            }
        }

        let err = Error::ConnectionFailed(self.them.id().to_base58());
        Err(self.fail(inner, err, false).await)
    }

    /// One transport attempt. Failures are absorbed; they only drive
    /// the fallback iteration.
    async fn try_transport(&mut self, inner: &Arc<SwitchInner>, tag: &str) -> bool {
        let dial = match inner.transports.lock().dial(tag, self.them.clone()) {
            Ok(dial) => dial,
            Err(_) => return false,
        };
        match dial.await {
            Ok((conn, addr)) => {
                debug!("dialed {} over {}", self.them.id(), tag);
                self.them.connect(addr);
                conn.set_peer_info(self.them.clone());
                self.conn = Some(observe(conn, Some(tag), None, inner.observer.clone()));
                true
            }
            Err(err) => {
                debug!("transport {} failed for {}: {}", tag, self.them.id(), err);
                false
            }
        }
    }

    /// PRIVATIZING: wrap the raw connection with the protector.
    async fn privatize(&mut self, inner: &Arc<SwitchInner>) -> Result<(), Error> {
        let protector = match &inner.protector {
            Some(protector) => protector.clone(),
            None => return Ok(()),
        };
        self.step(Event::Privatize)?;
        let conn = self.take_conn()?;
        match protector.protect(conn).await {
            Ok(conn) => {
                self.conn = Some(conn);
                self.step(Event::Done)?;
                self.emit(ConnectionEvent::Private);
                Ok(())
            }
            Err(err) => {
                // Protection failures take the disconnect edge without
                // passing through ERRORED.
                warn!("protector failed for {}: {}", self.them.id(), err);
                self.emit(ConnectionEvent::Error(Arc::new(Error::Io(err))));
                self.disconnect(inner).await;
                Err(Error::ConnectionFailed(self.them.id().to_base58()))
            }
        }
    }

    /// ENCRYPTING: negotiate the crypto protocol as dialer, tap the
    /// stream, run the handshake, pin the remote identity.
    async fn encrypt(&mut self, inner: &Arc<SwitchInner>) -> Result<(), Error> {
        self.step(Event::Encrypt)?;
        let conn = self.take_conn()?;
        let tag = inner.crypto.tag().to_string();

        let negotiated: Result<Connection, Error> = async {
            let mut dialer = negotiation::Dialer::handshake(conn).await.map_err(Error::from)?;
            if !dialer.select(&tag).await.map_err(Error::from)? {
                return Err(Error::Negotiation(format!("{} rejected by remote", tag)));
            }
            Ok(dialer.into_inner())
        }
        .await;

        let conn = match negotiated {
            Ok(conn) => conn,
            Err(err) => return Err(self.fail(inner, err, false).await),
        };

        let tapped = observe(conn, None, Some(&tag), inner.observer.clone());
        let secure = inner
            .crypto
            .encrypt(
                inner.us.id().clone(),
                tapped,
                Some(self.them.id().clone()),
            )
            .await;
        match secure {
            Ok(conn) => {
                conn.set_peer_info(self.them.clone());
                self.conn = Some(conn);
                self.step(Event::Done)?;
                self.emit(ConnectionEvent::Encrypted);
                Ok(())
            }
            Err(err) => Err(self.fail(inner, err, false).await),
        }
    }

    /// UPGRADING: try every registered muxer in insertion order over
    /// one negotiation session; register the first that sticks.
    async fn upgrade(&mut self, inner: &Arc<SwitchInner>) -> Result<DriveOutcome, Error> {
        self.step(Event::Upgrade)?;

        let muxers = inner.muxer_snapshot();
        if muxers.is_empty() {
            self.step(Event::Stop)?;
            self.emit(ConnectionEvent::Unmuxed);
            return Ok(DriveOutcome::Unmuxed);
        }

        let conn = self.take_conn()?;
        let session: Result<(Option<(String, Arc<dyn MuxerFactory>)>, Connection), negotiation::NegotiationError> = async {
            let mut dialer = negotiation::Dialer::handshake(conn).await?;
            for (codec, factory) in &muxers {
                if dialer.select(codec).await? {
                    return Ok((Some((codec.clone(), factory.clone())), dialer.into_inner()));
                }
            }
            Ok((None, dialer.into_inner()))
        }
        .await;

        match session {
            Ok((Some((codec, factory)), conn)) => {
                let tapped = observe(conn, None, Some(&codec), inner.observer.clone());
                let muxer = factory.dialer(tapped);
                self.muxer = Some(muxer.clone());
                inner.install_muxer(self.them.clone(), muxer, self.subscribers.clone());
                self.step(Event::Done)?;
                self.emit(ConnectionEvent::Muxed);
                Ok(DriveOutcome::Muxed)
            }
            Ok((None, conn)) => {
                // No common muxer: keep the encrypted connection. The
                // remote listener is still mid-negotiation, so the
                // session stays open for the protocol handshake. Not
                // an error from the caller's perspective.
                debug!("no common muxer with {}", self.them.id());
                self.conn = Some(conn);
                self.session_open = true;
                self.step(Event::Stop)?;
                self.emit(ConnectionEvent::Unmuxed);
                Ok(DriveOutcome::Unmuxed)
            }
            Err(err) => Err(self.fail(inner, err.into(), false).await),
        }
    }

    /// Protocol handshake over the raw encrypted connection, for
    /// peers without a muxer. One protocol per connection: the stream
    /// moves out to the caller.
    pub(crate) async fn shake_unmuxed(
        &mut self,
        inner: &Arc<SwitchInner>,
        protocol: &str,
    ) -> Result<Connection, Error> {
        let conn = self.take_conn()?;
        conn.set_peer_info(self.them.clone());
        let mut dialer = if self.session_open {
            self.session_open = false;
            negotiation::Dialer::resume(conn)
        } else {
            negotiation::Dialer::handshake(conn)
                .await
                .map_err(Error::from)?
        };
        if !dialer.select(protocol).await.map_err(Error::from)? {
            return Err(Error::Negotiation(format!(
                "{} not supported by {}",
                protocol,
                self.them.id()
            )));
        }
        let conn = dialer.into_inner();
        Ok(observe(conn, None, Some(protocol), inner.observer.clone()))
    }

    /// DISCONNECTING: tear everything down. Only the remote peer info
    /// is disconnected; the local one is process-global.
    pub(crate) async fn disconnect(&mut self, inner: &Arc<SwitchInner>) {
        if self.step(Event::Disconnect).is_err() {
            return;
        }
        self.them.disconnect();
        let b58 = self.them.id().to_base58();
        inner.conns.lock().remove(&b58);
        let had_muxer = self.muxer.is_some();
        if let Some(entry) = inner.remove_muxed(&b58) {
            inner.close_muxed_entry(entry).await;
        } else if let Some(muxer) = self.muxer.take() {
            let _ = muxer.close().await;
        }
        self.muxer = None;
        if let Some(mut conn) = self.conn.take() {
            let _ = futures::io::AsyncWriteExt::close(&mut conn).await;
        }
        let _ = self.step(Event::Done);
        // Subscribers observe the closure only after the state exit.
        self.emit(ConnectionEvent::Close);
        if had_muxer {
            debug!("muxed connection to {} torn down", self.them.id());
        }
    }

    /// Emits the error, walks the machine over the error edge where
    /// one exists and disconnects. Returns the error for the caller's
    /// pending request.
    async fn fail(&mut self, inner: &Arc<SwitchInner>, err: Error, surface_on_switch: bool) -> Error {
        let shared = Arc::new(err.duplicate());
        self.emit(ConnectionEvent::Error(shared.clone()));
        if surface_on_switch {
            inner.emit_error(shared);
        }
        if outbound_transition(self.state, Event::Error).is_some() {
            let _ = self.step(Event::Error);
        }
        self.disconnect(inner).await;
        err
    }

    fn take_conn(&mut self) -> Result<Connection, Error> {
        self.conn
            .take()
            .ok_or_else(|| Error::ConnectionFailed(self.them.id().to_base58()))
    }
}

/// The `/p2p-circuit/p2p/<b58>` fallback address for a peer.
fn circuit_addr(peer: &PeerInfo) -> Multiaddr {
    let mut addr = Multiaddr::empty();
    addr.push(Protocol::P2pCircuit);
    addr.push(Protocol::P2p(peer.id().as_multihash().clone()));
    addr
}

/// Protocol handshake over an established muxer: open a substream,
/// negotiate, tap.
pub(crate) async fn shake_over_muxer(
    inner: &Arc<SwitchInner>,
    muxer: &Arc<dyn StreamMuxer>,
    them: &PeerInfo,
    protocol: &str,
) -> Result<Connection, Error> {
    let stream = muxer.open_stream().await.map_err(maybe_unexpected_end)?;
    stream.set_peer_info(them.clone());
    let mut dialer = negotiation::Dialer::handshake(stream)
        .await
        .map_err(Error::from)?;
    if !dialer.select(protocol).await.map_err(Error::from)? {
        return Err(Error::Negotiation(format!(
            "{} not supported by {}",
            protocol,
            them.id()
        )));
    }
    let conn = dialer.into_inner();
    Ok(observe(conn, None, Some(protocol), inner.observer.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PeerId;

    #[test]
    fn circuit_addr_embeds_the_peer() {
        let peer = PeerInfo::new(PeerId::random());
        let addr = circuit_addr(&peer);
        let mut iter = addr.iter();
        assert!(matches!(iter.next(), Some(Protocol::P2pCircuit)));
        assert!(matches!(iter.next(), Some(Protocol::P2p(_))));
        assert!(iter.next().is_none());
    }

    #[test]
    fn invalid_step_leaves_state_in_place() {
        let mut conn = OutboundConnection::new(PeerInfo::new(PeerId::random()));
        assert_eq!(conn.state(), State::Disconnected);
        assert!(conn.step(Event::Encrypt).is_err());
        assert_eq!(conn.state(), State::Disconnected);
        assert!(conn.step(Event::Dial).is_ok());
        assert_eq!(conn.state(), State::Dialing);
    }
}
