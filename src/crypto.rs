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

//! The crypto contract the upgrade pipeline consumes, and the
//! plaintext default.

use crate::{connection::Connection, error::Error, PeerId, PeerInfo};
use futures::{
    future::BoxFuture,
    io::{AsyncReadExt, AsyncWriteExt},
    prelude::*,
};
use std::io;

/// An encryption layer negotiated over a raw connection.
///
/// The stream returned by `encrypt` must carry the authenticated
/// remote identity in its peer-info slot. In listener mode `remote` is
/// `None` and the identity is learned from the handshake.
pub trait Crypto: Send + Sync {
    /// The protocol tag negotiated before the handshake.
    fn tag(&self) -> &str;

    fn encrypt(
        &self,
        local: PeerId,
        conn: Connection,
        remote: Option<PeerId>,
    ) -> BoxFuture<'static, Result<Connection, Error>>;
}

/// No encryption: an identity exchange and nothing else.
///
/// The default crypto of the switch. Each side sends its
/// length-prefixed peer id and reads the remote's; a dialer checks the
/// received identity against the peer it addressed.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainText;

impl PlainText {
    pub const TAG: &'static str = "/plaintext/1.0.0";
}

async fn write_id(conn: &mut Connection, id: &PeerId) -> io::Result<()> {
    let bytes = id.to_bytes();
    let mut len_buf = unsigned_varint::encode::usize_buffer();
    conn.write_all(unsigned_varint::encode::usize(bytes.len(), &mut len_buf))
        .await?;
    conn.write_all(&bytes).await?;
    conn.flush().await
}

async fn read_id(conn: &mut Connection) -> io::Result<PeerId> {
    let mut len = 0usize;
    let mut shift = 0u32;
    loop {
        let mut byte = [0u8; 1];
        conn.read_exact(&mut byte).await?;
        len |= ((byte[0] & 0x7f) as usize) << shift;
        if byte[0] & 0x80 == 0 {
            break;
        }
        shift += 7;
        if shift > 63 {
            return Err(io::ErrorKind::InvalidData.into());
        }
    }
    if len == 0 || len > 128 {
        return Err(io::ErrorKind::InvalidData.into());
    }
    let mut bytes = vec![0u8; len];
    conn.read_exact(&mut bytes).await?;
    PeerId::from_bytes(&bytes).map_err(|_| io::ErrorKind::InvalidData.into())
}

impl Crypto for PlainText {
    fn tag(&self) -> &str {
        PlainText::TAG
    }

    fn encrypt(
        &self,
        local: PeerId,
        mut conn: Connection,
        remote: Option<PeerId>,
    ) -> BoxFuture<'static, Result<Connection, Error>> {
        async move {
            write_id(&mut conn, &local)
                .await
                .map_err(crate::error::maybe_unexpected_end)?;
            let their_id = read_id(&mut conn)
                .await
                .map_err(crate::error::maybe_unexpected_end)?;
            if let Some(expected) = remote {
                if expected != their_id {
                    return Err(Error::PeerIdMismatch);
                }
            }
            conn.set_peer_info(PeerInfo::new(their_id));
            Ok(conn)
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::duplex_pair;

    #[async_std::test]
    async fn identities_are_exchanged() {
        let (a, b) = duplex_pair();
        let id_a = PeerId::random();
        let id_b = PeerId::random();

        let dialer = PlainText.encrypt(id_a.clone(), Connection::new(a), Some(id_b.clone()));
        let listener = PlainText.encrypt(id_b.clone(), Connection::new(b), None);
        let (dialed, accepted) = futures::join!(dialer, listener);

        let dialed = dialed.unwrap();
        let accepted = accepted.unwrap();
        assert_eq!(dialed.peer_info().unwrap().id(), &id_b);
        assert_eq!(accepted.peer_info().unwrap().id(), &id_a);
    }

    #[async_std::test]
    async fn identity_mismatch_is_rejected() {
        let (a, b) = duplex_pair();
        let dialer = PlainText.encrypt(
            PeerId::random(),
            Connection::new(a),
            Some(PeerId::random()),
        );
        let listener = PlainText.encrypt(PeerId::random(), Connection::new(b), None);
        let (dialed, _) = futures::join!(dialer, listener);
        assert!(matches!(dialed, Err(Error::PeerIdMismatch)));
    }
}
