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

//! Connection switch for peer-to-peer networking.
//!
//! A [`Switch`] establishes, upgrades and multiplexes bidirectional
//! connections between peers across pluggable transports, encryption
//! layers and stream muxers.
//!
//! An outbound connection is driven through a fixed pipeline: the
//! transport dial (with fallback across every registered transport and
//! the circuit relay as a last resort), optional private-network
//! protection, a negotiated crypto handshake, and muxer negotiation.
//! Accepted sockets traverse the mirror pipeline. Established muxed
//! connections are registered per peer and shared: concurrent dials to
//! one peer coalesce onto a single transport dial and a single muxer,
//! and every protocol handshake becomes a substream of it.
//!
//! # Example
//!
//! ```no_run
//! use libp2p_switch::{
//!     muxing::mplex::Mplex, transport::memory::MemoryTransport, PeerId, PeerInfo, Switch,
//! };
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let us = PeerInfo::new(PeerId::random());
//! us.add_addr("/memory/1".parse()?);
//!
//! let switch = Switch::builder(us).build()?;
//! switch.add_transport("memory", Arc::new(MemoryTransport::new()));
//! switch.add_muxer(Arc::new(Mplex));
//! switch.handle(
//!     "/echo/1.0.0",
//!     Arc::new(|_protocol, _stream| { /* serve the stream */ }),
//!     None,
//! );
//! switch.start().await?;
//!
//! let peer = PeerInfo::new(PeerId::random());
//! peer.add_addr("/memory/2".parse()?);
//! let _stream = switch.dial(peer, Some("/echo/1.0.0")).await?;
//! # Ok(())
//! # }
//! ```

pub mod connection;
pub mod crypto;
pub mod error;
pub mod muxing;
pub mod negotiation;
pub mod observer;
pub mod protector;
pub mod protocol;
pub mod transport;

mod dialer;
mod peer_id;
mod peer_info;
mod switch;

pub use crate::connection::{Connection, ConnectionEvent, InboundConnection, OutboundConnection};
pub use crate::crypto::{Crypto, PlainText};
pub use crate::dialer::{ConnectionHandle, MAX_PARALLEL_DIALS};
pub use crate::error::Error;
pub use crate::muxing::{MuxerFactory, StreamMuxer};
pub use crate::observer::Observer;
pub use crate::peer_id::PeerId;
pub use crate::peer_info::PeerInfo;
pub use crate::protector::Protector;
pub use crate::protocol::ProtocolHandler;
pub use crate::switch::{Executor, Switch, SwitchBuilder, SwitchEvent};
pub use crate::transport::Transport;

pub use multiaddr::Multiaddr;
