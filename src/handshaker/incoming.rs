use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::timeout;
use tokio_util::codec::Framed;

use super::{Cipher, Established, IncomingResult, TorrentKeys};
use crate::error::peer::{PeerError, Result};
use crate::peer::codec::{Extensions, Handshake, HandshakeCodec};
use crate::PeerId;

/// Runs one incoming handshake and reports the outcome to the torrent.
pub(crate) async fn run(
    stream: TcpStream,
    addr: SocketAddr,
    keys: Arc<dyn TorrentKeys>,
    local_id: PeerId,
    extensions: Extensions,
    handshake_timeout: Duration,
    result_tx: UnboundedSender<IncomingResult>,
) {
    let result =
        handshake(stream, keys, local_id, extensions, handshake_timeout).await;
    if let Err(e) = &result {
        log::debug!("incoming handshake from {} failed: {}", addr, e);
    }
    let _ = result_tx.send(IncomingResult { addr, result });
}

async fn handshake(
    stream: TcpStream,
    keys: Arc<dyn TorrentKeys>,
    local_id: PeerId,
    extensions: Extensions,
    handshake_timeout: Duration,
) -> Result<Established> {
    timeout(handshake_timeout, async move {
        let mut socket = Framed::new(stream, HandshakeCodec);

        // the dialing side speaks first
        let peer_handshake = socket
            .next()
            .await
            .ok_or_else(|| io::Error::from(io::ErrorKind::UnexpectedEof))??;

        if !keys.check_info_hash(&peer_handshake.info_hash) {
            return Err(PeerError::InvalidInfoHash);
        }

        socket
            .send(Handshake::new(
                peer_handshake.info_hash,
                local_id,
                extensions,
            ))
            .await?;

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

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    use super::*;
    use crate::conf::EncryptionPolicy;
    use crate::handshaker::{outgoing, SingleTorrentKeys};
    use crate::peer::PeerSource;

    const INFO_HASH: [u8; 20] = [0xaa; 20];

    /// Handshakes the outgoing and incoming tasks against each other over
    /// a real socket and checks both outcomes.
    #[tokio::test]
    async fn test_handshake_both_sides() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (in_tx, mut in_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let (stream, peer_addr) = listener.accept().await.unwrap();
            run(
                stream,
                peer_addr,
                Arc::new(SingleTorrentKeys::new(INFO_HASH)),
                *b"-RT0010-incoming0000",
                Extensions::ours(),
                Duration::from_secs(5),
                in_tx,
            )
            .await;
        });

        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        outgoing::run(
            addr,
            PeerSource::Manual,
            *b"-RT0010-outgoing0000",
            INFO_HASH,
            Extensions::ours(),
            EncryptionPolicy::Auto,
            Duration::from_secs(5),
            Duration::from_secs(5),
            out_tx,
        )
        .await;

        let outgoing_result = out_rx.recv().await.unwrap();
        let established = outgoing_result.result.unwrap();
        assert_eq!(&established.peer_id, b"-RT0010-incoming0000");
        assert_eq!(established.extensions, Extensions::ours());
        assert_eq!(established.cipher, Cipher::Plaintext);

        let incoming_result = in_rx.recv().await.unwrap();
        let established = incoming_result.result.unwrap();
        assert_eq!(&established.peer_id, b"-RT0010-outgoing0000");
        assert_eq!(established.extensions, Extensions::ours());
    }

    /// An incoming handshake for a torrent we don't serve is refused.
    #[tokio::test]
    async fn test_incoming_rejects_unknown_info_hash() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (in_tx, mut in_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let (stream, peer_addr) = listener.accept().await.unwrap();
            run(
                stream,
                peer_addr,
                Arc::new(SingleTorrentKeys::new(INFO_HASH)),
                *b"-RT0010-incoming0000",
                Extensions::ours(),
                Duration::from_secs(5),
                in_tx,
            )
            .await;
        });

        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        outgoing::run(
            addr,
            PeerSource::Manual,
            *b"-RT0010-outgoing0000",
            [0xbb; 20],
            Extensions::ours(),
            EncryptionPolicy::Auto,
            Duration::from_secs(5),
            Duration::from_secs(5),
            out_tx,
        )
        .await;

        let incoming_result = in_rx.recv().await.unwrap();
        assert!(matches!(
            incoming_result.result,
            Err(PeerError::InvalidInfoHash)
        ));

        // the dialer sees the connection die rather than a reply
        let outgoing_result = out_rx.recv().await.unwrap();
        assert!(outgoing_result.result.is_err());
    }

    /// Forced obfuscation cannot be satisfied by the plaintext handshaker.
    #[tokio::test]
    async fn test_forced_encryption_fails_fast() {
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        outgoing::run(
            "127.0.0.1:1".parse().unwrap(),
            PeerSource::Manual,
            *b"-RT0010-outgoing0000",
            INFO_HASH,
            Extensions::ours(),
            EncryptionPolicy::Force,
            Duration::from_secs(5),
            Duration::from_secs(5),
            out_tx,
        )
        .await;

        let result = out_rx.recv().await.unwrap();
        assert!(matches!(
            result.result,
            Err(PeerError::EncryptionRequired)
        ));
    }
}
