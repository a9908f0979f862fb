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

//! The inbound connection state machine.
//!
//! Mirrors the outbound pipeline for accepted sockets: optional
//! protection, a listener-side crypto handshake with no expected
//! remote identity, then a single listener negotiation offering both
//! the registered muxer codecs and the registered protocols. Whatever
//! the remote settles on decides whether the connection becomes muxed
//! or stays a one-protocol plain connection. Failures anywhere take
//! the disconnect edge.

use super::{
    state::{inbound_transition, Event, State},
    Connection,
};
use crate::{error::Error, negotiation, observer::observe, switch::SwitchInner, PeerInfo};
use futures::io::AsyncWriteExt;
use log::{debug, error, trace, warn};
use smallvec::SmallVec;
use std::sync::Arc;

pub struct InboundConnection {
    state: State,
    conn: Option<Connection>,
    them: Option<PeerInfo>,
}

impl InboundConnection {
    pub(crate) fn new(conn: Connection) -> InboundConnection {
        InboundConnection {
            state: State::Dialed,
            conn: Some(conn),
            them: None,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    fn step(&mut self, event: Event) -> Result<State, Error> {
        match inbound_transition(self.state, event) {
            Some(next) => {
                trace!("inbound connection: {:?} -{:?}-> {:?}", self.state, event, next);
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
                Ok(())
            }
            Err(err) => {
                warn!("inbound protector failed: {}", err);
                Err(Error::Io(err))
            }
        }
    }

    /// Listener-side crypto: register the crypto tag with a
    /// negotiation listener, run the handshake, learn the remote
    /// identity from it.
    async fn encrypt(&mut self, inner: &Arc<SwitchInner>) -> Result<(), Error> {
        self.step(Event::Encrypt)?;
        let conn = self.take_conn()?;
        let tag = inner.crypto.tag().to_string();

        let mut listener = negotiation::Listener::new(conn);
        listener.add_handler(tag.clone(), None);
        let selected = listener.negotiate().await.map_err(Error::from)?;

        let tapped = observe(selected.io, None, Some(&tag), inner.observer.clone());
        let secure = inner
            .crypto
            .encrypt(inner.us.id().clone(), tapped, None)
            .await?;
        let them = secure
            .peer_info()
            .ok_or_else(|| Error::Negotiation("crypto yielded no remote identity".into()))?;
        debug!("accepted encrypted connection from {}", them.id());
        self.them = Some(them);
        self.conn = Some(secure);
        self.step(Event::Done)?;
        Ok(())
    }

    /// One listener negotiation over the registered muxer codecs plus
    /// the protocol table.
    async fn upgrade(&mut self, inner: &Arc<SwitchInner>) -> Result<(), Error> {
        self.step(Event::Upgrade)?;
        let conn = self.take_conn()?;
        let them = self
            .them
            .clone()
            .ok_or_else(|| Error::Negotiation("upgrade before identity".into()))?;

        let muxers = inner.muxer_snapshot();
        let protocol_muxer = inner.protocol_muxer();

        let mut listener = negotiation::Listener::new(conn);
        for (codec, _) in &muxers {
            listener.add_handler(codec.clone(), None);
        }
        protocol_muxer.register_on(&mut listener);

        let selected = listener.negotiate().await.map_err(Error::from)?;

        if let Some((codec, factory)) = muxers.into_iter().find(|(codec, _)| *codec == selected.key)
        {
            let tapped = observe(selected.io, None, Some(&codec), inner.observer.clone());
            let muxer = factory.listener(tapped);
            inner.install_muxer(them, muxer, SmallVec::new());
            self.step(Event::Done)?;
            return Ok(());
        }

        // A protocol was selected directly: unmuxed inbound mode.
        self.step(Event::Done)?;
        protocol_muxer.dispatch(&selected.key, selected.protocol, selected.io);
        Ok(())
    }

    async fn disconnect(&mut self) {
        if self.step(Event::Disconnect).is_err() {
            return;
        }
        if let Some(them) = &self.them {
            them.disconnect();
        }
        if let Some(mut conn) = self.conn.take() {
            let _ = conn.close().await;
        }
        let _ = self.step(Event::Done);
    }

    fn take_conn(&mut self) -> Result<Connection, Error> {
        self.conn
            .take()
            .ok_or_else(|| Error::Negotiation("inbound connection already consumed".into()))
    }
}

/// Full pipeline for one accepted socket. Spawned by the switch for
/// every connection a listener hands over.
pub(crate) async fn handle_incoming(inner: Arc<SwitchInner>, conn: Connection) {
    let mut fsm = InboundConnection::new(conn);

    if let Err(err) = fsm.privatize(&inner).await {
        debug!("inbound connection dropped: {}", err);
        fsm.disconnect().await;
        return;
    }

    // A caller-supplied handler takes the (possibly protected) socket
    // and bypasses the rest of the pipeline.
    if let Some(handler) = &inner.incoming_handler {
        if let Ok(conn) = fsm.take_conn() {
            handler(conn);
        }
        return;
    }

    if let Err(err) = fsm.encrypt(&inner).await {
        debug!("inbound crypto failed: {}", err);
        fsm.disconnect().await;
        return;
    }

    if let Err(err) = fsm.upgrade(&inner).await {
        debug!("inbound upgrade failed: {}", err);
        fsm.disconnect().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::duplex_pair;

    #[test]
    fn starts_in_dialed() {
        let (a, _b) = duplex_pair();
        let fsm = InboundConnection::new(Connection::new(a));
        assert_eq!(fsm.state(), State::Dialed);
    }

    #[async_std::test]
    async fn disconnect_from_dialed_is_clean() {
        let (a, _b) = duplex_pair();
        let mut fsm = InboundConnection::new(Connection::new(a));
        fsm.disconnect().await;
        assert_eq!(fsm.state(), State::Disconnected);
    }
}
