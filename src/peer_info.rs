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

use crate::PeerId;
use multiaddr::Multiaddr;
use parking_lot::Mutex;
use std::{fmt, sync::Arc};

/// Identity plus known addresses of a peer.
///
/// `PeerInfo` is a cheap clonable handle over shared state: the switch
/// owns one for the local node, and every connection holds one for its
/// remote. Address additions made by one holder (e.g. the circuit-relay
/// fallback) are visible to all holders.
#[derive(Clone)]
pub struct PeerInfo {
    inner: Arc<Inner>,
}

struct Inner {
    id: PeerId,
    /// Insertion-ordered, deduplicated.
    addrs: Mutex<Vec<Multiaddr>>,
    /// The address a live connection is currently using, if any.
    connected: Mutex<Option<Multiaddr>>,
}

impl PeerInfo {
    pub fn new(id: PeerId) -> PeerInfo {
        PeerInfo {
            inner: Arc::new(Inner {
                id,
                addrs: Mutex::new(Vec::new()),
                connected: Mutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> &PeerId {
        &self.inner.id
    }

    /// Snapshot of the known addresses, in insertion order.
    pub fn addrs(&self) -> Vec<Multiaddr> {
        self.inner.addrs.lock().clone()
    }

    /// Adds an address if it is not already known. Returns `true` if
    /// the address was new.
    pub fn add_addr(&self, addr: Multiaddr) -> bool {
        let mut addrs = self.inner.addrs.lock();
        if addrs.contains(&addr) {
            false
        } else {
            addrs.push(addr);
            true
        }
    }

    /// Records `addr` as the address in active use.
    pub fn connect(&self, addr: Multiaddr) {
        *self.inner.connected.lock() = Some(addr);
    }

    /// Clears the address in active use.
    pub fn disconnect(&self) {
        *self.inner.connected.lock() = None;
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.lock().is_some()
    }

    pub fn connected_addr(&self) -> Option<Multiaddr> {
        self.inner.connected.lock().clone()
    }
}

impl fmt::Debug for PeerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerInfo")
            .field("id", &self.inner.id)
            .field("addrs", &self.inner.addrs.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addresses_are_deduplicated() {
        let info = PeerInfo::new(PeerId::random());
        let addr: Multiaddr = "/memory/1".parse().unwrap();
        assert!(info.add_addr(addr.clone()));
        assert!(!info.add_addr(addr));
        assert_eq!(info.addrs().len(), 1);
    }

    #[test]
    fn additions_are_visible_through_clones() {
        let info = PeerInfo::new(PeerId::random());
        let other = info.clone();
        info.add_addr("/memory/2".parse().unwrap());
        assert_eq!(other.addrs().len(), 1);
    }

    #[test]
    fn connect_disconnect() {
        let info = PeerInfo::new(PeerId::random());
        let addr: Multiaddr = "/memory/3".parse().unwrap();
        info.connect(addr.clone());
        assert!(info.is_connected());
        assert_eq!(info.connected_addr(), Some(addr));
        info.disconnect();
        assert!(!info.is_connected());
    }
}
