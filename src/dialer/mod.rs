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

//! The dial scheduler.
//!
//! Requests enter a global FIFO and are routed to per-peer queues; at
//! most [`MAX_PARALLEL_DIALS`] queues run at once. A per-peer queue
//! owns at most one outbound state machine and replays pending
//! protocol handshakes over the muxer it establishes, so N concurrent
//! dials to one peer cost one transport dial and one muxer.

use crate::{
    connection::{Connection, ConnectionEvent},
    error::Error,
    switch::SwitchInner,
    PeerInfo,
};
use fnv::FnvHashMap;
use futures::channel::{mpsc, oneshot};
use log::debug;
use parking_lot::Mutex;
use std::{collections::VecDeque, sync::Arc};

pub(crate) mod queue;

use queue::PeerQueue;

/// Hard cap on concurrently active per-peer queues.
pub const MAX_PARALLEL_DIALS: usize = 10;

/// How a dial request wants its result delivered.
pub(crate) enum Reply {
    /// `dial`: a protocol-handshaked substream (or nothing when no
    /// protocol was named).
    Stream(oneshot::Sender<Result<Option<Connection>, Error>>),
    /// `dial_fsm`: the connection handle, surfaced as soon as the
    /// machine exists.
    Fsm(oneshot::Sender<Result<ConnectionHandle, Error>>),
}

pub(crate) struct DialRequest {
    pub peer: PeerInfo,
    pub protocol: Option<String>,
    pub reply: Reply,
}

impl DialRequest {
    pub(crate) fn fail(self, err: Error) {
        match self.reply {
            Reply::Stream(tx) => {
                let _ = tx.send(Err(err));
            }
            Reply::Fsm(tx) => {
                let _ = tx.send(Err(err));
            }
        }
    }
}

/// Caller-side view of a live outbound connection, as returned by
/// `Switch::dial_fsm`.
///
/// Events report the machine's progress; protocol handshakes requested
/// through the same dial arrive on the stream channel.
pub struct ConnectionHandle {
    peer: PeerInfo,
    events: mpsc::UnboundedReceiver<ConnectionEvent>,
    streams: mpsc::UnboundedReceiver<Connection>,
}

impl ConnectionHandle {
    pub(crate) fn new(
        peer: PeerInfo,
        events: mpsc::UnboundedReceiver<ConnectionEvent>,
        streams: mpsc::UnboundedReceiver<Connection>,
    ) -> ConnectionHandle {
        ConnectionHandle {
            peer,
            events,
            streams,
        }
    }

    pub fn peer(&self) -> &PeerInfo {
        &self.peer
    }

    /// The next lifecycle event, or `None` once the connection is gone
    /// and the channel drained.
    pub async fn next_event(&mut self) -> Option<ConnectionEvent> {
        use futures::StreamExt;
        self.events.next().await
    }

    /// The next protocol-handshaked substream produced for this
    /// handle.
    pub async fn next_stream(&mut self) -> Option<Connection> {
        use futures::StreamExt;
        self.streams.next().await
    }
}

struct SchedulerState {
    queue: VecDeque<DialRequest>,
    queues: FnvHashMap<String, Arc<PeerQueue>>,
    /// Number of currently running per-peer queues.
    dials: usize,
    aborted: bool,
}

/// Global dial manager: FIFO intake, bounded fan-out to per-peer
/// queues.
pub(crate) struct DialScheduler {
    state: Mutex<SchedulerState>,
}

impl DialScheduler {
    pub(crate) fn new() -> DialScheduler {
        DialScheduler {
            state: Mutex::new(SchedulerState {
                queue: VecDeque::new(),
                queues: FnvHashMap::default(),
                dials: 0,
                aborted: false,
            }),
        }
    }

    pub(crate) fn enqueue(&self, inner: &Arc<SwitchInner>, request: DialRequest) {
        {
            let mut state = self.state.lock();
            if state.aborted {
                drop(state);
                request.fail(Error::DialAborted);
                return;
            }
            state.queue.push_back(request);
        }
        self.run(inner);
    }

    /// Dequeues while below the parallelism cap, routing each request
    /// to its peer's queue and starting the queue if it was idle.
    pub(crate) fn run(&self, inner: &Arc<SwitchInner>) {
        loop {
            let started = {
                let mut state = self.state.lock();
                if state.aborted || state.dials >= MAX_PARALLEL_DIALS {
                    return;
                }
                let request = match state.queue.pop_front() {
                    Some(request) => request,
                    None => return,
                };
                let b58 = request.peer.id().to_base58();
                let queue = state
                    .queues
                    .entry(b58)
                    .or_insert_with(|| Arc::new(PeerQueue::new(request.peer.clone())))
                    .clone();
                if queue.push(request) {
                    state.dials += 1;
                    Some(queue)
                } else {
                    None
                }
            };
            if let Some(queue) = started {
                let task_inner = inner.clone();
                inner.spawn(async move {
                    queue.run_loop(task_inner).await;
                });
            }
        }
    }

    /// Called by a queue that drained and went idle.
    pub(crate) fn on_stop(&self, inner: &Arc<SwitchInner>, b58: &str) {
        {
            let mut state = self.state.lock();
            state.dials = state.dials.saturating_sub(1);
            if let Some(queue) = state.queues.get(b58) {
                if queue.is_idle() {
                    state.queues.remove(b58);
                }
            }
        }
        self.run(inner);
    }

    /// Cancels everything: queued requests fail with an abort error
    /// and running queues stop making progress.
    pub(crate) fn abort(&self) {
        let (requests, queues) = {
            let mut state = self.state.lock();
            state.aborted = true;
            let requests: Vec<_> = state.queue.drain(..).collect();
            let queues: Vec<_> = state.queues.values().cloned().collect();
            (requests, queues)
        };
        debug!("aborting {} queued dials", requests.len());
        for request in requests {
            request.fail(Error::DialAborted);
        }
        for queue in queues {
            queue.abort();
        }
    }

    /// Lifts a previous abort, for a restarted switch.
    pub(crate) fn reset(&self) {
        self.state.lock().aborted = false;
    }
}
