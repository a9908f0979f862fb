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

//! Lifecycle graphs of the connection state machines.
//!
//! The state variable is the single source of truth for a connection's
//! lifecycle. Transitions happen only through the named events below;
//! feeding an event with no edge from the current state is reported as
//! an invalid transition and leaves the machine where it is.

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    Disconnected,
    Dialing,
    Dialed,
    Privatizing,
    Privatized,
    Encrypting,
    Encrypted,
    Upgrading,
    Muxed,
    /// Encrypted but unmuxed: one protocol per connection.
    Connected,
    Disconnecting,
    Aborted,
    Errored,
}

/// Named events that drive connection state transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    Dial,
    Done,
    Error,
    Abort,
    Disconnect,
    Privatize,
    Encrypt,
    Upgrade,
    Stop,
}

/// Transition table of the outbound machine. Returns the successor
/// state, or `None` if the graph has no such edge.
pub fn outbound_transition(state: State, event: Event) -> Option<State> {
    use self::{Event::*, State::*};
    match (state, event) {
        (Disconnected, Dial) => Some(Dialing),

        (Dialing, Done) => Some(Dialed),
        (Dialing, Error) => Some(Errored),
        (Dialing, Abort) => Some(Aborted),
        (Dialing, Disconnect) => Some(Disconnecting),

        (Dialed, Privatize) => Some(Privatizing),
        (Dialed, Encrypt) => Some(Encrypting),

        (Privatizing, Done) => Some(Privatized),
        (Privatizing, Abort) => Some(Aborted),
        (Privatizing, Disconnect) => Some(Disconnecting),

        (Privatized, Encrypt) => Some(Encrypting),

        (Encrypting, Done) => Some(Encrypted),
        (Encrypting, Error) => Some(Errored),
        (Encrypting, Disconnect) => Some(Disconnecting),

        (Encrypted, Upgrade) => Some(Upgrading),
        (Encrypted, Disconnect) => Some(Disconnecting),

        (Upgrading, Done) => Some(Muxed),
        (Upgrading, Stop) => Some(Connected),
        (Upgrading, Error) => Some(Errored),

        (Muxed, Disconnect) => Some(Disconnecting),
        (Connected, Disconnect) => Some(Disconnecting),

        (Disconnecting, Done) => Some(Disconnected),

        (Errored, Disconnect) => Some(Disconnecting),

        _ => None,
    }
}

/// Transition table of the inbound machine: the outbound graph minus
/// DIALING, CONNECTED, ABORTED and ERRORED. Failures along the upgrade
/// path take the `Disconnect` edge.
pub fn inbound_transition(state: State, event: Event) -> Option<State> {
    use self::{Event::*, State::*};
    match (state, event) {
        (Dialed, Privatize) => Some(Privatizing),
        (Dialed, Encrypt) => Some(Encrypting),
        (Dialed, Disconnect) => Some(Disconnecting),

        (Privatizing, Done) => Some(Privatized),
        (Privatizing, Disconnect) => Some(Disconnecting),

        (Privatized, Encrypt) => Some(Encrypting),

        (Encrypting, Done) => Some(Encrypted),
        (Encrypting, Disconnect) => Some(Disconnecting),

        (Encrypted, Upgrade) => Some(Upgrading),
        (Encrypted, Disconnect) => Some(Disconnecting),

        (Upgrading, Done) => Some(Muxed),
        (Upgrading, Disconnect) => Some(Disconnecting),

        (Muxed, Disconnect) => Some(Disconnecting),

        (Disconnecting, Done) => Some(Disconnected),

        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck::{quickcheck, Arbitrary, Gen};
    use rand::Rng;

    const ALL_EVENTS: [Event; 9] = [
        Event::Dial,
        Event::Done,
        Event::Error,
        Event::Abort,
        Event::Disconnect,
        Event::Privatize,
        Event::Encrypt,
        Event::Upgrade,
        Event::Stop,
    ];

    impl Arbitrary for Event {
        fn arbitrary<G: Gen>(g: &mut G) -> Event {
            ALL_EVENTS[g.gen_range(0, ALL_EVENTS.len())]
        }
    }

    #[test]
    fn happy_path_outbound() {
        let path = [
            (Event::Dial, State::Dialing),
            (Event::Done, State::Dialed),
            (Event::Encrypt, State::Encrypting),
            (Event::Done, State::Encrypted),
            (Event::Upgrade, State::Upgrading),
            (Event::Done, State::Muxed),
            (Event::Disconnect, State::Disconnecting),
            (Event::Done, State::Disconnected),
        ];
        let mut state = State::Disconnected;
        for (event, next) in path.iter() {
            state = outbound_transition(state, *event).unwrap();
            assert_eq!(state, *next);
        }
    }

    #[test]
    fn privatized_path_outbound() {
        let mut state = State::Dialed;
        state = outbound_transition(state, Event::Privatize).unwrap();
        assert_eq!(state, State::Privatizing);
        state = outbound_transition(state, Event::Done).unwrap();
        assert_eq!(state, State::Privatized);
        state = outbound_transition(state, Event::Encrypt).unwrap();
        assert_eq!(state, State::Encrypting);
    }

    #[test]
    fn aborted_is_terminal() {
        for event in ALL_EVENTS.iter() {
            assert_eq!(outbound_transition(State::Aborted, *event), None);
        }
    }

    #[test]
    fn errored_only_accepts_disconnect() {
        for event in ALL_EVENTS.iter() {
            let next = outbound_transition(State::Errored, *event);
            if *event == Event::Disconnect {
                assert_eq!(next, Some(State::Disconnecting));
            } else {
                assert_eq!(next, None);
            }
        }
    }

    #[test]
    fn inbound_has_no_dial_edge() {
        assert_eq!(inbound_transition(State::Disconnected, Event::Dial), None);
        assert_eq!(inbound_transition(State::Dialed, Event::Encrypt), Some(State::Encrypting));
    }

    #[test]
    fn inbound_upgrade_failure_can_disconnect() {
        assert_eq!(
            inbound_transition(State::Upgrading, Event::Disconnect),
            Some(State::Disconnecting)
        );
    }

    quickcheck! {
        // Whatever sequence of events is fed in, the machine only ever
        // occupies states of the graph and rejected events leave it in
        // place.
        fn outbound_stays_on_graph(events: Vec<Event>) -> bool {
            let mut state = State::Disconnected;
            for event in events {
                if let Some(next) = outbound_transition(state, event) {
                    state = next;
                }
            }
            true
        }

        fn inbound_stays_on_graph(events: Vec<Event>) -> bool {
            let mut state = State::Dialed;
            for event in events {
                if let Some(next) = inbound_transition(state, event) {
                    state = next;
                }
            }
            true
        }
    }
}
