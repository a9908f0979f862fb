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

//! End-to-end tests: two switches over the memory transport with
//! plaintext crypto and the mplex muxer.

use futures::{
    future::BoxFuture,
    io::{AsyncReadExt, AsyncWriteExt},
    StreamExt,
};
use libp2p_switch::{
    connection::ConnectionEvent,
    muxing::mplex::Mplex,
    transport::{memory::MemoryTransport, AcceptHandler, Listener, Transport, CIRCUIT_TAG},
    Connection, Multiaddr, PeerId, PeerInfo, ProtocolHandler, Switch, SwitchEvent,
};
use std::{
    io,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

const TIMEOUT: Duration = Duration::from_secs(10);

async fn expect<T>(fut: impl std::future::Future<Output = T>) -> T {
    async_std::future::timeout(TIMEOUT, fut)
        .await
        .expect("timed out")
}

fn make_switch(transport: &MemoryTransport, port: u64) -> (Switch, PeerInfo) {
    let _ = env_logger::try_init();
    let info = PeerInfo::new(PeerId::random());
    info.add_addr(format!("/memory/{}", port).parse().unwrap());
    let switch = Switch::builder(info.clone()).build().unwrap();
    switch.add_transport("memory", Arc::new(transport.clone()));
    switch.add_muxer(Arc::new(Mplex));
    (switch, info)
}

/// Address-only view of a remote switch, as a dialer would know it.
fn remote(info: &PeerInfo) -> PeerInfo {
    let peer = PeerInfo::new(info.id().clone());
    for addr in info.addrs() {
        peer.add_addr(addr);
    }
    peer
}

fn echo_handler() -> ProtocolHandler {
    Arc::new(|_protocol, conn: Connection| {
        async_std::task::spawn(async move {
            let (mut reader, mut writer) = conn.split();
            let _ = futures::io::copy(&mut reader, &mut writer).await;
            let _ = writer.close().await;
        });
    })
}

async fn assert_echo(stream: &mut Connection, payload: &[u8]) {
    stream.write_all(payload).await.unwrap();
    let mut buf = vec![0u8; payload.len()];
    expect(stream.read_exact(&mut buf)).await.unwrap();
    assert_eq!(buf, payload);
}

/// A transport whose dials always fail, counting the attempts.
#[derive(Clone, Default)]
struct RefusingTransport {
    dials: Arc<AtomicUsize>,
}

impl Transport for RefusingTransport {
    fn dial(&self, _peer: PeerInfo) -> BoxFuture<'static, io::Result<(Connection, Multiaddr)>> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        Box::pin(async { Err(io::ErrorKind::ConnectionRefused.into()) })
    }

    fn create_listener(&self, _handler: AcceptHandler) -> Box<dyn Listener> {
        Box::new(NoopListener)
    }

    fn filter(&self, addrs: &[Multiaddr]) -> Vec<Multiaddr> {
        addrs.to_vec()
    }
}

struct NoopListener;

impl Listener for NoopListener {
    fn listen(&mut self, _addrs: Vec<Multiaddr>) -> BoxFuture<'_, io::Result<()>> {
        Box::pin(async { Ok(()) })
    }

    fn close(&mut self) -> BoxFuture<'_, io::Result<()>> {
        Box::pin(async { Ok(()) })
    }

    fn addrs(&self) -> Vec<Multiaddr> {
        Vec::new()
    }
}

/// Counts dials before delegating to the memory transport.
#[derive(Clone)]
struct CountingTransport {
    inner: MemoryTransport,
    dials: Arc<AtomicUsize>,
}

impl Transport for CountingTransport {
    fn dial(&self, peer: PeerInfo) -> BoxFuture<'static, io::Result<(Connection, Multiaddr)>> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        self.inner.dial(peer)
    }

    fn create_listener(&self, handler: AcceptHandler) -> Box<dyn Listener> {
        self.inner.create_listener(handler)
    }

    fn filter(&self, addrs: &[Multiaddr]) -> Vec<Multiaddr> {
        self.inner.filter(addrs)
    }
}

/// A stand-in relay: reaches the target through the shared memory hub
/// whenever the peer carries a `/p2p-circuit` address.
#[derive(Clone)]
struct CircuitTransport {
    hub: MemoryTransport,
    relay_target: Multiaddr,
    dials: Arc<AtomicUsize>,
}

impl Transport for CircuitTransport {
    fn dial(&self, peer: PeerInfo) -> BoxFuture<'static, io::Result<(Connection, Multiaddr)>> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        let circuit_addr = match self.filter(&peer.addrs()).into_iter().next() {
            Some(addr) => addr,
            None => return Box::pin(async { Err(io::ErrorKind::AddrNotAvailable.into()) }),
        };
        let via = PeerInfo::new(peer.id().clone());
        via.add_addr(self.relay_target.clone());
        let dial = self.hub.dial(via);
        Box::pin(async move {
            let (conn, _) = dial.await?;
            Ok((conn, circuit_addr))
        })
    }

    fn create_listener(&self, _handler: AcceptHandler) -> Box<dyn Listener> {
        Box::new(NoopListener)
    }

    fn filter(&self, addrs: &[Multiaddr]) -> Vec<Multiaddr> {
        addrs
            .iter()
            .filter(|a| a.to_string().contains("p2p-circuit"))
            .cloned()
            .collect()
    }
}

async fn next_matching(
    events: &mut futures::channel::mpsc::UnboundedReceiver<SwitchEvent>,
    mut pred: impl FnMut(&SwitchEvent) -> bool,
) -> SwitchEvent {
    loop {
        match expect(events.next()).await {
            Some(event) => {
                if pred(&event) {
                    return event;
                }
            }
            None => panic!("event channel ended"),
        }
    }
}

// Scenario: happy path dial over one transport, one crypto, one muxer.
#[async_std::test]
async fn happy_path_dial() {
    let transport = MemoryTransport::new();
    let (a, _a_info) = make_switch(&transport, 10);
    let (b, b_info) = make_switch(&transport, 11);
    b.handle("/echo/1.0.0", echo_handler(), None);

    a.start().await.unwrap();
    b.start().await.unwrap();

    let mut a_events = a.subscribe();
    let mut stream = expect(a.dial(remote(&b_info), Some("/echo/1.0.0")))
        .await
        .unwrap()
        .expect("protocol dial yields a stream");

    assert_eq!(stream.peer_info().unwrap().id(), b_info.id());
    assert!(a.is_connected(b_info.id()));
    assert!(!a.has_unmuxed(b_info.id()));

    next_matching(&mut a_events, |e| {
        matches!(e, SwitchEvent::PeerMuxEstablished(info) if info.id() == b_info.id())
    })
    .await;

    assert_echo(&mut stream, b"hello switch").await;
}

// Scenario: the first transport fails, the second one carries the dial.
#[async_std::test]
async fn transport_fallback() {
    let transport = MemoryTransport::new();
    let refusing = RefusingTransport::default();
    let (b, b_info) = make_switch(&transport, 21);
    b.handle("/echo/1.0.0", echo_handler(), None);

    let a_info = PeerInfo::new(PeerId::random());
    a_info.add_addr("/memory/20".parse().unwrap());
    let a = Switch::builder(a_info).build().unwrap();
    // Registration order is dial order: the refusing transport is
    // attempted (and fails) before the memory transport.
    a.add_transport("refusing", Arc::new(refusing.clone()));
    a.add_transport("memory", Arc::new(transport.clone()));
    a.add_muxer(Arc::new(Mplex));

    a.start().await.unwrap();
    b.start().await.unwrap();

    let mut stream = expect(a.dial(remote(&b_info), Some("/echo/1.0.0")))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(refusing.dials.load(Ordering::SeqCst), 1);
    assert!(a.is_connected(b_info.id()));
    assert_echo(&mut stream, b"fallback").await;
}

// Scenario: every direct transport fails; the peer's address set
// gains a circuit address exactly once and the dial succeeds through
// the relay.
#[async_std::test]
async fn circuit_fallback() {
    let transport = MemoryTransport::new();
    let (a, _a_info) = make_switch(&transport, 30);
    let (b, b_info) = make_switch(&transport, 31);
    b.handle("/echo/1.0.0", echo_handler(), None);

    let circuit = CircuitTransport {
        hub: transport.clone(),
        relay_target: "/memory/31".parse().unwrap(),
        dials: Arc::default(),
    };
    a.add_transport(CIRCUIT_TAG, Arc::new(circuit.clone()));

    a.start().await.unwrap();
    b.start().await.unwrap();

    // The dialer only knows an address nobody listens on.
    let peer = PeerInfo::new(b_info.id().clone());
    peer.add_addr("/memory/999".parse().unwrap());

    let mut stream = expect(a.dial(peer.clone(), Some("/echo/1.0.0")))
        .await
        .unwrap()
        .unwrap();

    let circuit_addrs: Vec<_> = peer
        .addrs()
        .into_iter()
        .filter(|a| a.to_string().contains("p2p-circuit"))
        .collect();
    assert_eq!(circuit_addrs.len(), 1);
    assert_eq!(circuit.dials.load(Ordering::SeqCst), 1);
    assert!(a.is_connected(b_info.id()));
    assert_echo(&mut stream, b"relayed").await;
}

// Scenario: five concurrent dials to one peer coalesce onto a single
// transport dial and a single muxer; every callback fires.
#[async_std::test]
async fn dial_coalescing() {
    let transport = MemoryTransport::new();
    let counting = CountingTransport {
        inner: transport.clone(),
        dials: Arc::default(),
    };
    let (b, b_info) = make_switch(&transport, 41);

    let a_info = PeerInfo::new(PeerId::random());
    a_info.add_addr("/memory/40".parse().unwrap());
    let a = Switch::builder(a_info).build().unwrap();
    a.add_transport("memory", Arc::new(counting.clone()));
    a.add_muxer(Arc::new(Mplex));

    let protocols: Vec<String> = (0..5).map(|i| format!("/proto/{}/1.0.0", i)).collect();
    for protocol in &protocols {
        b.handle(protocol.clone(), echo_handler(), None);
    }

    a.start().await.unwrap();
    b.start().await.unwrap();

    let peer = remote(&b_info);
    let dials = protocols
        .iter()
        .map(|protocol| a.dial(peer.clone(), Some(protocol.as_str())));
    let results = expect(futures::future::join_all(dials)).await;

    assert_eq!(counting.dials.load(Ordering::SeqCst), 1);
    assert!(a.is_connected(b_info.id()));
    for result in results {
        let mut stream = result.unwrap().unwrap();
        assert_echo(&mut stream, b"coalesced").await;
    }
}

// Scenario: a dialer with no muxers ends up with an encrypted,
// unmuxed connection carrying exactly one protocol.
#[async_std::test]
async fn unmuxable_peer() {
    let transport = MemoryTransport::new();
    let (b, b_info) = make_switch(&transport, 51);
    b.handle("/echo/1.0.0", echo_handler(), None);

    let a_info = PeerInfo::new(PeerId::random());
    a_info.add_addr("/memory/50".parse().unwrap());
    let a = Switch::builder(a_info).build().unwrap();
    a.add_transport("memory", Arc::new(transport.clone()));
    // No muxer registered on the dialer.

    a.start().await.unwrap();
    b.start().await.unwrap();

    let mut stream = expect(a.dial(remote(&b_info), Some("/echo/1.0.0")))
        .await
        .unwrap()
        .unwrap();

    assert!(!a.is_connected(b_info.id()));
    assert!(a.has_unmuxed(b_info.id()));
    assert_echo(&mut stream, b"plain").await;
}

// Scenario: the dialer proposes its muxer, the listener rejects it,
// and the encrypted connection survives for the protocol handshake.
#[async_std::test]
async fn no_common_muxer_falls_back_to_plain() {
    let transport = MemoryTransport::new();
    let (a, _a_info) = make_switch(&transport, 90);

    let b_info = PeerInfo::new(PeerId::random());
    b_info.add_addr("/memory/91".parse().unwrap());
    let b = Switch::builder(b_info.clone()).build().unwrap();
    b.add_transport("memory", Arc::new(transport.clone()));
    // No muxer registered on the listener.
    b.handle("/echo/1.0.0", echo_handler(), None);

    a.start().await.unwrap();
    b.start().await.unwrap();

    let mut stream = expect(a.dial(remote(&b_info), Some("/echo/1.0.0")))
        .await
        .unwrap()
        .unwrap();

    assert!(!a.is_connected(b_info.id()));
    assert!(a.has_unmuxed(b_info.id()));
    assert_echo(&mut stream, b"no common muxer").await;
}

// dial_fsm surfaces the machine's progress and delivers the
// handshaked stream on the handle.
#[async_std::test]
async fn dial_fsm_reports_progress() {
    let transport = MemoryTransport::new();
    let (a, _a_info) = make_switch(&transport, 60);
    let (b, b_info) = make_switch(&transport, 61);
    b.handle("/echo/1.0.0", echo_handler(), None);

    a.start().await.unwrap();
    b.start().await.unwrap();

    let mut handle = expect(a.dial_fsm(remote(&b_info), Some("/echo/1.0.0")))
        .await
        .unwrap();
    assert_eq!(handle.peer().id(), b_info.id());

    let mut saw_connected = false;
    let mut saw_encrypted = false;
    loop {
        match expect(handle.next_event()).await {
            Some(ConnectionEvent::Connected) => saw_connected = true,
            Some(ConnectionEvent::Encrypted) => saw_encrypted = true,
            Some(ConnectionEvent::Muxed) => break,
            Some(ConnectionEvent::Error(err)) => panic!("dial failed: {}", err),
            Some(_) => {}
            None => panic!("events ended early"),
        }
    }
    assert!(saw_connected && saw_encrypted);

    let mut stream = expect(handle.next_stream()).await.unwrap();
    assert_echo(&mut stream, b"via handle").await;
}

// Invariant: after hang_up the muxed table entry is gone and both
// sides observe the closure.
#[async_std::test]
async fn hang_up_closes_both_sides() {
    let transport = MemoryTransport::new();
    let (a, _a_info) = make_switch(&transport, 70);
    let (b, b_info) = make_switch(&transport, 71);
    b.handle("/echo/1.0.0", echo_handler(), None);

    a.start().await.unwrap();
    b.start().await.unwrap();

    let mut a_events = a.subscribe();
    let mut b_events = b.subscribe();

    expect(a.dial(remote(&b_info), Some("/echo/1.0.0")))
        .await
        .unwrap();
    assert!(a.is_connected(b_info.id()));

    expect(a.hang_up(b_info.id())).await.unwrap();
    assert!(!a.is_connected(b_info.id()));

    next_matching(&mut a_events, |e| matches!(e, SwitchEvent::PeerMuxClosed(_))).await;
    next_matching(&mut b_events, |e| matches!(e, SwitchEvent::PeerMuxClosed(_))).await;
    assert!(!b.is_connected(a.local_peer().id()));
}

// Invariant: stop ends every muxer and closes every listener.
#[async_std::test]
async fn stop_tears_everything_down() {
    let transport = MemoryTransport::new();
    let (a, a_info) = make_switch(&transport, 80);
    let (b, b_info) = make_switch(&transport, 81);
    b.handle("/echo/1.0.0", echo_handler(), None);

    a.start().await.unwrap();
    b.start().await.unwrap();

    let mut b_events = b.subscribe();
    expect(a.dial(remote(&b_info), Some("/echo/1.0.0")))
        .await
        .unwrap();
    assert!(a.is_connected(b_info.id()));

    expect(a.stop()).await.unwrap();
    assert!(!a.is_connected(b_info.id()));

    // Wait until b has noticed the closure, so the dial below cannot
    // ride the stale muxed connection.
    next_matching(&mut b_events, |e| matches!(e, SwitchEvent::PeerMuxClosed(_))).await;

    // Listener released: nobody accepts on a's address any more.
    let err = expect(b.dial(remote(&a_info), None)).await;
    assert!(err.is_err());

    // Dialing from a stopped switch is rejected outright.
    assert!(a.dial(remote(&b_info), None).await.is_err());
}
