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

//! The per-peer dial queue.

use super::{ConnectionHandle, DialRequest, Reply};
use crate::{
    connection::{
        outbound::{shake_over_muxer, DriveOutcome},
        Connection, ConnectionEvent, OutboundConnection,
    },
    error::Error,
    switch::SwitchInner,
    PeerInfo,
};
use futures::channel::{mpsc, oneshot};
use log::debug;
use parking_lot::Mutex;
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

struct QueueState {
    requests: VecDeque<DialRequest>,
    running: bool,
}

/// FIFO of pending dial requests for one remote peer. Owns at most
/// one outbound state machine at a time.
pub(crate) struct PeerQueue {
    peer: PeerInfo,
    state: Mutex<QueueState>,
    aborted: AtomicBool,
}

impl PeerQueue {
    pub(crate) fn new(peer: PeerInfo) -> PeerQueue {
        PeerQueue {
            peer,
            state: Mutex::new(QueueState {
                requests: VecDeque::new(),
                running: false,
            }),
            aborted: AtomicBool::new(false),
        }
    }

    /// Enqueues a request. Returns `true` if the queue was idle and
    /// the caller must start its run loop.
    pub(crate) fn push(&self, request: DialRequest) -> bool {
        let mut state = self.state.lock();
        state.requests.push_back(request);
        if state.running {
            false
        } else {
            state.running = true;
            true
        }
    }

    fn pop(&self) -> Option<DialRequest> {
        let mut state = self.state.lock();
        match state.requests.pop_front() {
            Some(request) => Some(request),
            None => {
                state.running = false;
                None
            }
        }
    }

    pub(crate) fn is_idle(&self) -> bool {
        !self.state.lock().running
    }

    pub(crate) fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// Fails every pending request and stops further progress. An
    /// in-flight upgrade notices the flag between stages.
    pub(crate) fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
        let drained: Vec<_> = {
            let mut state = self.state.lock();
            state.requests.drain(..).collect()
        };
        for request in drained {
            request.fail(Error::DialAborted);
        }
    }

    /// Serves requests until the queue drains, then hands the slot
    /// back to the scheduler.
    pub(crate) async fn run_loop(self: Arc<Self>, inner: Arc<SwitchInner>) {
        let b58 = self.peer.id().to_base58();
        while let Some(request) = self.pop() {
            if self.is_aborted() {
                request.fail(Error::DialAborted);
                continue;
            }
            self.serve(&inner, request).await;
        }
        inner.dialer.on_stop(&inner, &b58);
    }

    async fn serve(&self, inner: &Arc<SwitchInner>, request: DialRequest) {
        let b58 = request.peer.id().to_base58();

        // Reuse an established muxer: no state machine, just a
        // substream per handshake.
        let existing = {
            let muxed = inner.muxed_conns.lock();
            muxed.get(&b58).map(|e| (e.muxer.clone(), e.them.clone()))
        };
        if let Some((muxer, them)) = existing {
            let (protocol, prepared) = Prepared::from_request(request, |events| {
                if let Some(entry) = inner.muxed_conns.lock().get_mut(&b58) {
                    entry.subscribers.push(events);
                }
            });
            let result = match &protocol {
                Some(protocol) => shake_over_muxer(inner, &muxer, &them, protocol)
                    .await
                    .map(Some),
                None => Ok(None),
            };
            prepared.deliver(result);
            return;
        }

        // Retry a stored encrypted-but-unmuxed connection.
        let stored = inner.conns.lock().remove(&b58);
        if let Some(mut fsm) = stored {
            if fsm.has_conn() {
                debug!("reusing unmuxed connection to {}", b58);
                let (protocol, prepared) =
                    Prepared::from_request(request, |events| fsm.subscribe(events));
                let result = match &protocol {
                    Some(protocol) => fsm.shake_unmuxed(inner, protocol).await.map(Some),
                    None => Ok(None),
                };
                prepared.deliver(result);
                inner.conns.lock().insert(b58, fsm);
                return;
            }
            // The stored connection was already consumed: dial anew.
        }

        // Fresh pipeline.
        let mut fsm = OutboundConnection::new(request.peer.clone());
        let (protocol, prepared) =
            Prepared::from_request(request, |events| fsm.subscribe(events));
        match fsm.drive(inner, || self.is_aborted()).await {
            Ok(DriveOutcome::Muxed) => {
                let entry = {
                    let muxed = inner.muxed_conns.lock();
                    muxed.get(&b58).map(|e| (e.muxer.clone(), e.them.clone()))
                };
                let result = match (&protocol, entry) {
                    (Some(protocol), Some((muxer, them))) => {
                        shake_over_muxer(inner, &muxer, &them, protocol)
                            .await
                            .map(Some)
                    }
                    (Some(_), None) => Err(Error::ConnectionFailed(b58.clone())),
                    (None, _) => Ok(None),
                };
                prepared.deliver(result);
            }
            Ok(DriveOutcome::Unmuxed) => {
                let result = match &protocol {
                    Some(protocol) => fsm.shake_unmuxed(inner, protocol).await.map(Some),
                    None => Ok(None),
                };
                prepared.deliver(result);
                inner.conns.lock().insert(b58, fsm);
            }
            Err(err) => prepared.deliver(Err(err)),
        }
    }
}

/// A request whose reply path has been set up: `dial_fsm` handles are
/// delivered before the pipeline runs, `dial` callers wait for the
/// final result. Each fires at most once.
enum Prepared {
    Stream(oneshot::Sender<Result<Option<Connection>, Error>>),
    /// Handle already sent; only the handshaked stream is pending.
    FsmStreams(mpsc::UnboundedSender<Connection>),
}

impl Prepared {
    fn from_request(
        request: DialRequest,
        attach: impl FnOnce(mpsc::UnboundedSender<ConnectionEvent>),
    ) -> (Option<String>, Prepared) {
        let DialRequest {
            peer,
            protocol,
            reply,
        } = request;
        match reply {
            Reply::Stream(tx) => (protocol, Prepared::Stream(tx)),
            Reply::Fsm(tx) => {
                let (events_tx, events_rx) = mpsc::unbounded();
                let (streams_tx, streams_rx) = mpsc::unbounded();
                attach(events_tx);
                let _ = tx.send(Ok(ConnectionHandle::new(peer, events_rx, streams_rx)));
                (protocol, Prepared::FsmStreams(streams_tx))
            }
        }
    }

    fn deliver(self, result: Result<Option<Connection>, Error>) {
        match self {
            Prepared::Stream(tx) => {
                let _ = tx.send(result);
            }
            Prepared::FsmStreams(tx) => {
                // Failures already reached the handle as events.
                if let Ok(Some(conn)) = result {
                    let _ = tx.unbounded_send(conn);
                }
            }
        }
    }
}
