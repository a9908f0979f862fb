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

use multihash::{Code, Multihash, MultihashDigest};
use std::{fmt, str::FromStr};

/// Identifier of a peer of the network.
///
/// The data is a multihash of the public key of the peer. The canonical
/// string rendering is base58 and is used as the key of every per-peer
/// table in the switch.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId {
    multihash: Multihash,
}

impl PeerId {
    /// Builds a `PeerId` by hashing the given public-key bytes.
    pub fn from_public_key(key: &[u8]) -> PeerId {
        PeerId {
            multihash: Code::Sha2_256.digest(key),
        }
    }

    /// Parses a `PeerId` from its canonical multihash byte encoding.
    pub fn from_bytes(data: &[u8]) -> Result<PeerId, multihash::Error> {
        Ok(PeerId {
            multihash: Multihash::from_bytes(data)?,
        })
    }

    /// Parses a `PeerId` from its base58 rendering.
    pub fn from_base58(s: &str) -> Result<PeerId, ParseError> {
        let bytes = bs58::decode(s).into_vec().map_err(|_| ParseError)?;
        PeerId::from_bytes(&bytes).map_err(|_| ParseError)
    }

    /// Generates a random `PeerId`, for tests and examples.
    pub fn random() -> PeerId {
        let key: [u8; 32] = rand::random();
        PeerId::from_public_key(&key)
    }

    /// The canonical byte encoding.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.multihash.to_bytes()
    }

    /// The canonical base58 rendering, used as a table key.
    pub fn to_base58(&self) -> String {
        bs58::encode(self.to_bytes()).into_string()
    }

    /// The underlying multihash, e.g. for embedding into a multiaddr.
    pub fn as_multihash(&self) -> &Multihash {
        &self.multihash
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PeerId").field(&self.to_base58()).finish()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base58())
    }
}

impl FromStr for PeerId {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PeerId::from_base58(s)
    }
}

/// Error when parsing a `PeerId` from text or bytes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("base58 decode error")]
pub struct ParseError;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base58_round_trip() {
        let id = PeerId::random();
        let parsed: PeerId = id.to_base58().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn bytes_round_trip() {
        let id = PeerId::random();
        assert_eq!(id, PeerId::from_bytes(&id.to_bytes()).unwrap());
    }

    #[test]
    fn distinct_keys_yield_distinct_ids() {
        assert_ne!(PeerId::random(), PeerId::random());
    }
}
