//! UDP tracker client per [BEP-15](http://bittorrent.org/beps/bep_0015.html).

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use bytes::{Buf, BufMut, BytesMut};
use rand::Rng;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use url::Url;

use super::{Announce, Response};
use crate::error::tracker::{Result, TrackerError};

/// The magic constant of the connect request.
const PROTOCOL_ID: u64 = 0x0417_2710_1980;

/// How long we wait for a tracker datagram.
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(15);

const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;

/// A UDP tracker for a torrent.
///
/// Every announce performs the full BEP-15 round trip: a connect request
/// establishing a connection id, then the announce itself. Connection ids
/// are valid for a minute on the tracker side, but announces are minutes
/// apart anyway, so nothing is cached between calls.
pub struct UdpTracker {
    url: Url,
    /// `host:port` of the tracker, resolved per announce.
    authority: String,
}

impl UdpTracker {
    pub fn new(url: Url) -> Result<Self> {
        let host = url
            .host_str()
            .ok_or(TrackerError::UdpProtocol("tracker url has no host"))?;
        let port = url
            .port()
            .ok_or(TrackerError::UdpProtocol("tracker url has no port"))?;
        let authority = format!("{}:{}", host, port);
        Ok(UdpTracker { url, authority })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub async fn announce(&self, params: Announce) -> Result<Response> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(self.authority.as_str()).await?;

        let connection_id = self.connect(&socket).await?;
        self.announce_with(&socket, connection_id, params).await
    }

    /// The connect round trip: yields the connection id to be used by the
    /// announce.
    async fn connect(&self, socket: &UdpSocket) -> Result<u64> {
        let transaction_id: u32 = rand::thread_rng().gen();

        let mut req = BytesMut::with_capacity(16);
        req.put_u64(PROTOCOL_ID);
        req.put_u32(ACTION_CONNECT);
        req.put_u32(transaction_id);
        socket.send(&req).await?;

        let mut buf = [0u8; 16];
        let n = timeout(RESPONSE_TIMEOUT, socket.recv(&mut buf))
            .await
            .map_err(|_| TrackerError::UdpTimeout)??;
        if n < 16 {
            return Err(TrackerError::UdpProtocol("short connect response"));
        }

        let mut resp = &buf[..];
        if resp.get_u32() != ACTION_CONNECT {
            return Err(TrackerError::UdpProtocol("connect action mismatch"));
        }
        if resp.get_u32() != transaction_id {
            return Err(TrackerError::UdpProtocol("transaction id mismatch"));
        }
        Ok(resp.get_u64())
    }

    async fn announce_with(
        &self,
        socket: &UdpSocket,
        connection_id: u64,
        params: Announce,
    ) -> Result<Response> {
        let (transaction_id, req) = {
            let mut rng = rand::thread_rng();
            let transaction_id: u32 = rng.gen();

            let mut req = BytesMut::with_capacity(98);
            req.put_u64(connection_id);
            req.put_u32(ACTION_ANNOUNCE);
            req.put_u32(transaction_id);
            req.put_slice(&params.info_hash);
            req.put_slice(&params.peer_id);
            req.put_u64(params.downloaded);
            req.put_u64(params.left);
            req.put_u64(params.uploaded);
            req.put_u32(params.event.map(|e| e.code()).unwrap_or(0));
            // 0 means "use the sender's address"
            req.put_u32(0);
            req.put_u32(rng.gen());
            req.put_i32(params.peer_count.map(|c| c as i32).unwrap_or(-1));
            req.put_u16(params.port);
            (transaction_id, req)
        };
        socket.send(&req).await?;

        // an announce response is 20 bytes of header plus 6 bytes per peer
        let mut buf = [0u8; 1500];
        let n = timeout(RESPONSE_TIMEOUT, socket.recv(&mut buf))
            .await
            .map_err(|_| TrackerError::UdpTimeout)??;
        if n < 20 {
            return Err(TrackerError::UdpProtocol("short announce response"));
        }

        let mut resp = &buf[..n];
        if resp.get_u32() != ACTION_ANNOUNCE {
            return Err(TrackerError::UdpProtocol("announce action mismatch"));
        }
        if resp.get_u32() != transaction_id {
            return Err(TrackerError::UdpProtocol("transaction id mismatch"));
        }
        let interval = resp.get_u32();
        let leechers = resp.get_u32();
        let seeders = resp.get_u32();

        let mut peers = Vec::with_capacity(resp.remaining() / 6);
        while resp.remaining() >= 6 {
            let ip = Ipv4Addr::from(resp.get_u32());
            let port = resp.get_u16();
            peers.push(SocketAddr::new(IpAddr::V4(ip), port));
        }

        Ok(Response {
            interval: Some(Duration::from_secs(interval as u64)),
            seeder_count: Some(seeders as usize),
            leecher_count: Some(leechers as usize),
            peers,
            ..Default::default()
        })
    }
}
