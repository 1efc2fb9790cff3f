//! The two tasks of a connected peer session.
//!
//! The reader decodes wire frames and forwards them to the torrent's
//! event loop; the writer serializes outbound messages. The writer drains
//! two channels: an unbounded one for control messages and a bounded one
//! for block payloads, so a slow peer's piece traffic cannot delay our
//! chokes, interests or requests. The snub timer also lives in the writer,
//! where the request commands that arm it already flow.

use std::net::SocketAddr;
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::watch;
use tokio::time::{self, timeout, Instant};
use tokio_util::codec::Framed;

use super::codec::{Message, PeerCodec};
use super::PeerKey;

pub(crate) type Sender = UnboundedSender<Command>;
pub(crate) type Receiver = UnboundedReceiver<Command>;

/// What the torrent can tell a session's writer task.
#[derive(Debug)]
pub(crate) enum Command {
    /// Serialize and send a control message.
    Send(Message),
    /// (Re)arm the snub timer; sent whenever block requests go out.
    ResetSnubTimer,
    /// Disarm the snub timer; sent when a requested block arrives.
    StopSnubTimer,
    /// Wind the session down.
    Shutdown,
}

/// The torrent-side channels a session reports into.
#[derive(Clone)]
pub(crate) struct EventChannels {
    pub msg_tx: UnboundedSender<(PeerKey, Message)>,
    pub snub_tx: UnboundedSender<PeerKey>,
    pub disconnect_tx: UnboundedSender<PeerKey>,
}

/// The session timers, drawn from the torrent configuration.
#[derive(Clone, Copy)]
pub(crate) struct SessionConf {
    pub read_timeout: Duration,
    pub snub_timeout: Duration,
    pub keep_alive_interval: Duration,
}

/// Spawns the reader and writer tasks of a freshly handshaken peer.
///
/// Either task reports on the disconnect channel when it winds down; the
/// torrent treats the first report as the peer's death and ignores the
/// second.
pub(crate) fn spawn(
    key: PeerKey,
    addr: SocketAddr,
    socket: Framed<TcpStream, PeerCodec>,
    cmd_rx: Receiver,
    block_rx: mpsc::Receiver<Message>,
    shutdown_rx: watch::Receiver<bool>,
    channels: EventChannels,
    conf: SessionConf,
) {
    let (sink, stream) = socket.split();
    tokio::spawn(read_loop(
        key,
        addr,
        stream,
        shutdown_rx.clone(),
        channels.clone(),
        conf,
    ));
    tokio::spawn(write_loop(
        key, addr, sink, cmd_rx, block_rx, shutdown_rx, channels, conf,
    ));
}

async fn read_loop(
    key: PeerKey,
    addr: SocketAddr,
    mut stream: SplitStream<Framed<TcpStream, PeerCodec>>,
    mut shutdown_rx: watch::Receiver<bool>,
    channels: EventChannels,
    conf: SessionConf,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            frame = timeout(conf.read_timeout, stream.next()) => match frame {
                Err(_) => {
                    log::warn!("peer {} read timeout", addr);
                    break;
                }
                Ok(None) => {
                    log::debug!("peer {} closed the connection", addr);
                    break;
                }
                Ok(Some(Err(e))) => {
                    log::warn!("peer {} read error: {}", addr, e);
                    break;
                }
                Ok(Some(Ok(msg))) => {
                    if channels.msg_tx.send((key, msg)).is_err() {
                        break;
                    }
                }
            }
        }
    }
    let _ = channels.disconnect_tx.send(key);
}

#[allow(clippy::too_many_arguments)]
async fn write_loop(
    key: PeerKey,
    addr: SocketAddr,
    mut sink: SplitSink<Framed<TcpStream, PeerCodec>, Message>,
    mut cmd_rx: Receiver,
    mut block_rx: mpsc::Receiver<Message>,
    mut shutdown_rx: watch::Receiver<bool>,
    channels: EventChannels,
    conf: SessionConf,
) {
    let snub_timer = time::sleep(conf.snub_timeout);
    tokio::pin!(snub_timer);
    let mut snub_armed = false;

    // the first tick must come one interval in, not immediately
    let mut keep_alive = time::interval_at(
        Instant::now() + conf.keep_alive_interval,
        conf.keep_alive_interval,
    );

    loop {
        tokio::select! {
            // control messages outrank block payloads
            biased;

            _ = shutdown_rx.changed() => break,

            cmd = cmd_rx.recv() => match cmd {
                Some(Command::Send(msg)) => {
                    if let Err(e) = sink.send(msg).await {
                        log::warn!("peer {} write error: {}", addr, e);
                        break;
                    }
                }
                Some(Command::ResetSnubTimer) => {
                    snub_timer
                        .as_mut()
                        .reset(Instant::now() + conf.snub_timeout);
                    snub_armed = true;
                }
                Some(Command::StopSnubTimer) => {
                    snub_armed = false;
                }
                Some(Command::Shutdown) | None => break,
            },

            block = block_rx.recv() => match block {
                Some(msg) => {
                    if let Err(e) = sink.send(msg).await {
                        log::warn!("peer {} write error: {}", addr, e);
                        break;
                    }
                }
                None => break,
            },

            _ = snub_timer.as_mut(), if snub_armed => {
                snub_armed = false;
                let _ = channels.snub_tx.send(key);
            }

            _ = keep_alive.tick() => {
                if sink.send(Message::KeepAlive).await.is_err() {
                    break;
                }
            }
        }
    }

    // closing the write half tears the socket down for the reader too
    let _ = sink.close().await;
    let _ = channels.disconnect_tx.send(key);
}
