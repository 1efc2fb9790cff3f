use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::timeout;
use tokio_util::codec::Framed;

use super::{Cipher, Established, OutgoingResult};
use crate::conf::EncryptionPolicy;
use crate::error::peer::{PeerError, Result};
use crate::peer::codec::{Extensions, Handshake, HandshakeCodec};
use crate::peer::PeerSource;
use crate::{PeerId, Sha1Hash};

/// Runs one outgoing handshake and reports the outcome to the torrent.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn run(
    addr: SocketAddr,
    source: PeerSource,
    local_id: PeerId,
    info_hash: Sha1Hash,
    extensions: Extensions,
    encryption: EncryptionPolicy,
    connect_timeout: Duration,
    handshake_timeout: Duration,
    result_tx: UnboundedSender<OutgoingResult>,
) {
    let result = handshake(
        addr,
        local_id,
        info_hash,
        extensions,
        encryption,
        connect_timeout,
        handshake_timeout,
    )
    .await;
    if let Err(e) = &result {
        log::debug!("outgoing handshake with {} failed: {}", addr, e);
    }
    let _ = result_tx.send(OutgoingResult {
        addr,
        source,
        result,
    });
}

async fn handshake(
    addr: SocketAddr,
    local_id: PeerId,
    info_hash: Sha1Hash,
    extensions: Extensions,
    encryption: EncryptionPolicy,
    connect_timeout: Duration,
    handshake_timeout: Duration,
) -> Result<Established> {
    // only the plaintext handshake is built in; a policy demanding
    // obfuscation cannot be met here
    if encryption == EncryptionPolicy::Force {
        return Err(PeerError::EncryptionRequired);
    }

    let stream = timeout(connect_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| PeerError::ConnectTimeout)??;

    timeout(handshake_timeout, async move {
        let mut socket = Framed::new(stream, HandshakeCodec);

        // as the dialing side we send the first handshake
        socket
            .send(Handshake::new(info_hash, local_id, extensions))
            .await?;

        let peer_handshake = socket
            .next()
            .await
            .ok_or_else(|| io::Error::from(io::ErrorKind::UnexpectedEof))??;

        if peer_handshake.info_hash != info_hash {
            return Err(PeerError::InvalidInfoHash);
        }

        Ok(Established {
            extensions: extensions.intersect(peer_handshake.extensions()),
            peer_id: peer_handshake.peer_id,
            cipher: Cipher::Plaintext,
            socket,
        })
    })
    .await
    .map_err(|_| PeerError::HandshakeTimeout)?
}
