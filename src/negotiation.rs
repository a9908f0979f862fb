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

//! Multistream-select 1.0 protocol negotiation.
//!
//! Messages are unsigned-varint length-prefixed, `\n`-terminated
//! lines; the session opens with a `/multistream/1.0.0` header
//! exchange; a listener answers an unsupported proposal with `na` and
//! an `ls` request with the list of registered protocols. The wire
//! format is bit-compatible with the existing ecosystem.

use futures::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use log::trace;
use std::{io, sync::Arc};

const MSS_HEADER: &str = "/multistream/1.0.0";
const NA: &str = "na";
const LS: &str = "ls";

/// Negotiation messages are short protocol names; anything beyond this
/// is a protocol violation.
const MAX_MESSAGE_LEN: usize = 1024;

/// Decides whether a registered protocol accepts a proposed one. The
/// first argument is the registered name, the second the proposal.
pub type Matcher = Arc<dyn Fn(&str, &str) -> bool + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum NegotiationError {
    #[error("unexpected multistream header")]
    BadHeader,
    #[error("unexpected response to proposal: {0}")]
    UnexpectedResponse(String),
    #[error("negotiation message too large")]
    TooLarge,
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<NegotiationError> for crate::Error {
    fn from(err: NegotiationError) -> crate::Error {
        match err {
            NegotiationError::Io(e) => crate::error::maybe_unexpected_end(e),
            other => crate::Error::Negotiation(other.to_string()),
        }
    }
}

async fn read_varint<S: AsyncRead + Unpin>(io: &mut S) -> Result<usize, NegotiationError> {
    let mut buf = unsigned_varint::encode::usize_buffer();
    for i in 0..buf.len() {
        let mut byte = [0u8; 1];
        io.read_exact(&mut byte).await?;
        buf[i] = byte[0];
        if byte[0] & 0x80 == 0 {
            let (len, _) = unsigned_varint::decode::usize(&buf[..=i])
                .map_err(|_| NegotiationError::TooLarge)?;
            return Ok(len);
        }
    }
    Err(NegotiationError::TooLarge)
}

/// Reads one length-prefixed, newline-terminated message.
async fn read_message<S: AsyncRead + Unpin>(io: &mut S) -> Result<String, NegotiationError> {
    let len = read_varint(io).await?;
    if len == 0 || len > MAX_MESSAGE_LEN {
        return Err(NegotiationError::TooLarge);
    }
    let mut buf = vec![0u8; len];
    io.read_exact(&mut buf).await?;
    if buf.pop() != Some(b'\n') {
        return Err(NegotiationError::UnexpectedResponse(
            String::from_utf8_lossy(&buf).into_owned(),
        ));
    }
    String::from_utf8(buf)
        .map_err(|e| NegotiationError::UnexpectedResponse(e.to_string()))
}

/// Writes one length-prefixed, newline-terminated message and flushes.
async fn write_message<S: AsyncWrite + Unpin>(
    io: &mut S,
    msg: &str,
) -> Result<(), NegotiationError> {
    let mut out = Vec::with_capacity(msg.len() + 4);
    let mut len_buf = unsigned_varint::encode::usize_buffer();
    out.extend_from_slice(unsigned_varint::encode::usize(msg.len() + 1, &mut len_buf));
    out.extend_from_slice(msg.as_bytes());
    out.push(b'\n');
    io.write_all(&out).await?;
    io.flush().await?;
    Ok(())
}

/// Dialer half of a negotiation session: performs the header exchange
/// once, then proposes protocols one at a time.
pub struct Dialer<S> {
    io: S,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Dialer<S> {
    /// Opens a session over `io` by exchanging the multistream header.
    pub async fn handshake(mut io: S) -> Result<Dialer<S>, NegotiationError> {
        write_message(&mut io, MSS_HEADER).await?;
        let header = read_message(&mut io).await?;
        if header != MSS_HEADER {
            return Err(NegotiationError::BadHeader);
        }
        Ok(Dialer { io })
    }

    /// Resumes a session whose header exchange has already happened,
    /// e.g. on a stream recovered with [`Dialer::into_inner`] after a
    /// rejected proposal. Further proposals continue the same session.
    pub fn resume(io: S) -> Dialer<S> {
        Dialer { io }
    }

    /// Proposes `protocol`. Returns `true` if the listener accepted it,
    /// `false` if it answered `na`; the session stays usable for
    /// further proposals either way.
    pub async fn select(&mut self, protocol: &str) -> Result<bool, NegotiationError> {
        trace!("proposing protocol {}", protocol);
        write_message(&mut self.io, protocol).await?;
        let response = read_message(&mut self.io).await?;
        if response == protocol {
            Ok(true)
        } else if response == NA {
            Ok(false)
        } else {
            Err(NegotiationError::UnexpectedResponse(response))
        }
    }

    /// Recovers the stream once a protocol has been settled on.
    pub fn into_inner(self) -> S {
        self.io
    }
}

/// Outcome of a listener-side negotiation.
pub struct Selected<S> {
    /// The name the matching handler was registered under.
    pub key: String,
    /// The protocol string the remote proposed.
    pub protocol: String,
    pub io: S,
}

/// Listener half of a negotiation session: answers proposals from a
/// table of registered protocols, with optional matchers for
/// non-exact acceptance.
pub struct Listener<S> {
    io: S,
    entries: Vec<(String, Option<Matcher>)>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Listener<S> {
    pub fn new(io: S) -> Listener<S> {
        Listener {
            io,
            entries: Vec::new(),
        }
    }

    /// Registers a protocol. With a matcher, the matcher decides
    /// acceptance; otherwise proposals must equal the name exactly.
    pub fn add_handler(&mut self, name: impl Into<String>, matcher: Option<Matcher>) {
        self.entries.push((name.into(), matcher));
    }

    fn matching_key(&self, proposal: &str) -> Option<String> {
        self.entries
            .iter()
            .find(|(name, matcher)| match matcher {
                Some(m) => m(name, proposal),
                None => name == proposal,
            })
            .map(|(name, _)| name.clone())
    }

    /// Drives the session until the remote settles on a protocol.
    pub async fn negotiate(mut self) -> Result<Selected<S>, NegotiationError> {
        let header = read_message(&mut self.io).await?;
        if header != MSS_HEADER {
            return Err(NegotiationError::BadHeader);
        }
        write_message(&mut self.io, MSS_HEADER).await?;

        loop {
            let proposal = read_message(&mut self.io).await?;
            if proposal == LS {
                self.send_ls().await?;
                continue;
            }
            match self.matching_key(&proposal) {
                Some(key) => {
                    trace!("accepting protocol {}", proposal);
                    write_message(&mut self.io, &proposal).await?;
                    return Ok(Selected {
                        key,
                        protocol: proposal,
                        io: self.io,
                    });
                }
                None => {
                    trace!("rejecting protocol {}", proposal);
                    write_message(&mut self.io, NA).await?;
                }
            }
        }
    }

    /// Answers `ls`: one outer message containing each registered name
    /// as its own length-prefixed line.
    async fn send_ls(&mut self) -> Result<(), NegotiationError> {
        let mut payload = Vec::new();
        for (name, _) in &self.entries {
            let mut len_buf = unsigned_varint::encode::usize_buffer();
            payload
                .extend_from_slice(unsigned_varint::encode::usize(name.len() + 1, &mut len_buf));
            payload.extend_from_slice(name.as_bytes());
            payload.push(b'\n');
        }
        let mut out = Vec::with_capacity(payload.len() + 4);
        let mut len_buf = unsigned_varint::encode::usize_buffer();
        out.extend_from_slice(unsigned_varint::encode::usize(payload.len(), &mut len_buf));
        out.extend_from_slice(&payload);
        self.io.write_all(&out).await?;
        self.io.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::duplex_pair;

    #[async_std::test]
    async fn select_accepted() {
        let (a, b) = duplex_pair();
        let dialer = async {
            let mut dialer = Dialer::handshake(a).await.unwrap();
            assert!(dialer.select("/echo/1.0.0").await.unwrap());
        };
        let listener = async {
            let mut listener = Listener::new(b);
            listener.add_handler("/echo/1.0.0", None);
            let selected = listener.negotiate().await.unwrap();
            assert_eq!(selected.key, "/echo/1.0.0");
            assert_eq!(selected.protocol, "/echo/1.0.0");
        };
        futures::join!(dialer, listener);
    }

    #[async_std::test]
    async fn select_falls_through_na() {
        let (a, b) = duplex_pair();
        let dialer = async {
            let mut dialer = Dialer::handshake(a).await.unwrap();
            assert!(!dialer.select("/mplex/6.7.0").await.unwrap());
            assert!(dialer.select("/echo/1.0.0").await.unwrap());
        };
        let listener = async {
            let mut listener = Listener::new(b);
            listener.add_handler("/echo/1.0.0", None);
            let selected = listener.negotiate().await.unwrap();
            assert_eq!(selected.protocol, "/echo/1.0.0");
        };
        futures::join!(dialer, listener);
    }

    #[async_std::test]
    async fn resumed_session_continues_negotiation() {
        let (a, b) = duplex_pair();
        let dialer = async {
            let mut dialer = Dialer::handshake(a).await.unwrap();
            assert!(!dialer.select("/mplex/6.7.0").await.unwrap());
            // Stash the stream and pick the session back up later.
            let io = dialer.into_inner();
            let mut dialer = Dialer::resume(io);
            assert!(dialer.select("/echo/1.0.0").await.unwrap());
        };
        let listener = async {
            let mut listener = Listener::new(b);
            listener.add_handler("/echo/1.0.0", None);
            let selected = listener.negotiate().await.unwrap();
            assert_eq!(selected.protocol, "/echo/1.0.0");
        };
        futures::join!(dialer, listener);
    }

    #[async_std::test]
    async fn matcher_decides_acceptance() {
        let (a, b) = duplex_pair();
        let dialer = async {
            let mut dialer = Dialer::handshake(a).await.unwrap();
            assert!(dialer.select("/kad/1.0.5").await.unwrap());
        };
        let listener = async {
            let mut listener = Listener::new(b);
            let matcher: Matcher = Arc::new(|_, proposal| proposal.starts_with("/kad/1.0."));
            listener.add_handler("/kad/1.0.0", Some(matcher));
            let selected = listener.negotiate().await.unwrap();
            assert_eq!(selected.key, "/kad/1.0.0");
            assert_eq!(selected.protocol, "/kad/1.0.5");
        };
        futures::join!(dialer, listener);
    }
}
