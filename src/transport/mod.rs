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

//! Transports and the registry the switch dials through.

use crate::{connection::Connection, error::Error, PeerInfo};
use futures::future::BoxFuture;
use multiaddr::Multiaddr;
use std::{io, sync::Arc};

pub mod memory;

/// Tag under which the circuit-relay transport is registered. The
/// registry orders it last and the dialing machine uses it as the
/// fallback of last resort.
pub const CIRCUIT_TAG: &str = "p2p-circuit";

/// Invoked by a listener for every accepted connection.
pub type AcceptHandler = Arc<dyn Fn(Connection) + Send + Sync>;

/// A way of reaching peers, registered in the switch under a tag.
pub trait Transport: Send + Sync {
    /// Attempts to reach `peer` over one of its addresses this
    /// transport supports. Resolves with the connection and the
    /// address that was reached.
    fn dial(&self, peer: PeerInfo) -> BoxFuture<'static, io::Result<(Connection, Multiaddr)>>;

    /// Creates a listener that will invoke `handler` per accepted
    /// connection once `listen` is called.
    fn create_listener(&self, handler: AcceptHandler) -> Box<dyn Listener>;

    /// The subset of `addrs` this transport can act on.
    fn filter(&self, addrs: &[Multiaddr]) -> Vec<Multiaddr>;
}

/// A bound (or bindable) listener of a transport.
pub trait Listener: Send {
    /// Binds to the given addresses and starts accepting.
    fn listen(&mut self, addrs: Vec<Multiaddr>) -> BoxFuture<'_, io::Result<()>>;

    /// Stops accepting and releases the binding.
    fn close(&mut self) -> BoxFuture<'_, io::Result<()>>;

    /// The addresses currently bound.
    fn addrs(&self) -> Vec<Multiaddr>;
}

/// Lookup and dial via named transports.
///
/// Tags keep registration order; [`TransportRegistry::available_transports`]
/// partitions so the circuit tag always comes last.
#[derive(Default)]
pub struct TransportRegistry {
    transports: Vec<(String, Arc<dyn Transport>)>,
}

impl TransportRegistry {
    pub fn new() -> TransportRegistry {
        TransportRegistry::default()
    }

    /// Registers `transport` under `tag`. A tag can only be registered
    /// once; a duplicate replaces the earlier entry in place.
    pub fn add(&mut self, tag: impl Into<String>, transport: Arc<dyn Transport>) {
        let tag = tag.into();
        if let Some(entry) = self.transports.iter_mut().find(|(t, _)| *t == tag) {
            entry.1 = transport;
        } else {
            self.transports.push((tag, transport));
        }
    }

    pub fn get(&self, tag: &str) -> Option<Arc<dyn Transport>> {
        self.transports
            .iter()
            .find(|(t, _)| t.as_str() == tag)
            .map(|(_, transport)| transport.clone())
    }

    pub fn is_registered(&self, tag: &str) -> bool {
        self.transports.iter().any(|(t, _)| t.as_str() == tag)
    }

    /// `true` if any transport other than the circuit relay is
    /// registered. A switch with only a relay cannot originate dials.
    pub fn has_non_circuit(&self) -> bool {
        self.transports.iter().any(|(t, _)| t.as_str() != CIRCUIT_TAG)
    }

    /// Snapshot of all registered `(tag, transport)` pairs in
    /// registration order.
    pub fn snapshot(&self) -> Vec<(String, Arc<dyn Transport>)> {
        self.transports.clone()
    }

    /// Returns a dial future for `tag`, or an error if the tag is
    /// unknown. The future is `'static`; no registry borrow is held
    /// while it runs.
    pub fn dial(
        &self,
        tag: &str,
        peer: PeerInfo,
    ) -> Result<BoxFuture<'static, io::Result<(Connection, Multiaddr)>>, Error> {
        let transport = self
            .get(tag)
            .ok_or_else(|| Error::ConnectionFailed(peer.id().to_base58()))?;
        Ok(transport.dial(peer))
    }

    /// The tags whose transport accepts at least one of the peer's
    /// addresses. Registration order, except the circuit tag is moved
    /// to the end.
    pub fn available_transports(&self, peer: &PeerInfo) -> Vec<String> {
        let addrs = peer.addrs();
        let mut direct = Vec::new();
        let mut circuit = Vec::new();
        for (tag, transport) in &self.transports {
            if transport.filter(&addrs).is_empty() {
                continue;
            }
            if tag.as_str() == CIRCUIT_TAG {
                circuit.push(tag.clone());
            } else {
                direct.push(tag.clone());
            }
        }
        direct.extend(circuit);
        direct
    }
}

#[cfg(test)]
mod tests {
    use super::{memory::MemoryTransport, *};
    use crate::PeerId;

    struct AnyAddr;

    impl Transport for AnyAddr {
        fn dial(
            &self,
            _peer: PeerInfo,
        ) -> BoxFuture<'static, io::Result<(Connection, Multiaddr)>> {
            Box::pin(async { Err(io::ErrorKind::ConnectionRefused.into()) })
        }

        fn create_listener(&self, _handler: AcceptHandler) -> Box<dyn Listener> {
            unimplemented!("not used by this test")
        }

        fn filter(&self, addrs: &[Multiaddr]) -> Vec<Multiaddr> {
            addrs.to_vec()
        }
    }

    #[test]
    fn circuit_is_partitioned_last() {
        let mut registry = TransportRegistry::new();
        registry.add(CIRCUIT_TAG, Arc::new(AnyAddr));
        registry.add("tcp", Arc::new(AnyAddr));
        registry.add("ws", Arc::new(AnyAddr));

        let peer = PeerInfo::new(PeerId::random());
        peer.add_addr("/memory/7".parse().unwrap());

        let tags = registry.available_transports(&peer);
        assert_eq!(tags, vec!["tcp".to_string(), "ws".into(), CIRCUIT_TAG.into()]);
    }

    #[test]
    fn filter_excludes_unsupported_peers() {
        let mut registry = TransportRegistry::new();
        registry.add("memory", Arc::new(MemoryTransport::new()));

        // No addresses at all: nothing available.
        let peer = PeerInfo::new(PeerId::random());
        assert!(registry.available_transports(&peer).is_empty());

        peer.add_addr("/memory/1".parse().unwrap());
        assert_eq!(registry.available_transports(&peer), vec!["memory".to_string()]);
    }

    #[test]
    fn has_non_circuit() {
        let mut registry = TransportRegistry::new();
        assert!(!registry.has_non_circuit());
        registry.add(CIRCUIT_TAG, Arc::new(AnyAddr));
        assert!(!registry.has_non_circuit());
        registry.add("memory", Arc::new(MemoryTransport::new()));
        assert!(registry.has_non_circuit());
    }
}
