//! The per-torrent orchestration core.
//!
//! One [`Torrent`] runs per active transfer. Its event loop is the sole
//! mutator of torrent-wide state: peer records, the piece table, the
//! picker and the downloader maps. Peer sessions, handshakes and
//! announcers run as their own tasks and talk to the loop over the typed
//! channels built in [`Torrent::new`].

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, FramedParts};
use url::Url;

use crate::addrpool::AddressPool;
use crate::announcer::{Announcer, StopAnnouncer};
use crate::bufferpool::BufferPool;
use crate::conf::TorrentConf;
use crate::download::{InfoDownloader, PieceDownloader};
use crate::error::torrent::Result;
use crate::handshaker::{
    self, Established, IncomingResult, OutgoingResult, SingleTorrentKeys,
};
use crate::metainfo::{Info, Metainfo};
use crate::peer::codec::{
    ExtendedHandshake, Extensions, Message, PeerCodec,
};
use crate::peer::session::{self, EventChannels, SessionConf};
use crate::peer::{Peer, PeerKey, PeerSource};
use crate::storage::{PieceStore, StoreFactory};
use crate::tracker::{Tracker, Transfer};
use crate::{Bitfield, PeerId, Sha1Hash};

mod dispatch;
mod picker;
mod piece;

use picker::PiecePicker;

/// How many undialed addresses the pool holds before aging out the
/// oldest.
const ADDRESS_POOL_LIMIT: usize = 1000;

/// Everything needed to start a torrent's core.
pub struct TorrentParams {
    pub conf: TorrentConf,
    /// The torrent's identity. Must match the metainfo when one is given.
    pub info_hash: Sha1Hash,
    pub client_id: PeerId,
    /// The port announced to trackers for incoming connections.
    pub listen_port: u16,
    /// The parsed `.torrent`, when starting from one. `None` starts a
    /// metadata download instead (the magnet flow).
    pub metainfo: Option<Metainfo>,
    /// Tracker URLs to announce to, on top of any carried by the
    /// metainfo.
    pub trackers: Vec<Url>,
}

/// The caller's side of a running torrent.
pub struct TorrentHandle {
    /// Feeds peer addresses from outside sources (DHT, PEX, the user).
    pub peer_list_tx: UnboundedSender<(Vec<SocketAddr>, PeerSource)>,
    /// Hands freshly accepted TCP connections to the torrent.
    pub incoming_tx: UnboundedSender<TcpStream>,
    /// Set to true to stop the torrent. Dropping the handle stops it too.
    pub stop_tx: watch::Sender<bool>,
    /// Becomes true once every piece is verified.
    pub completed_rx: watch::Receiver<bool>,
}

/// The event-channel senders handed to spawned tasks.
struct Senders {
    peer_msg_tx: UnboundedSender<(PeerKey, Message)>,
    snub_tx: UnboundedSender<PeerKey>,
    disconnect_tx: UnboundedSender<PeerKey>,
    out_hs_tx: UnboundedSender<OutgoingResult>,
    in_hs_tx: UnboundedSender<IncomingResult>,
    peer_list_tx: UnboundedSender<(Vec<SocketAddr>, PeerSource)>,
}

impl Senders {
    fn session_channels(&self) -> EventChannels {
        EventChannels {
            msg_tx: self.peer_msg_tx.clone(),
            snub_tx: self.snub_tx.clone(),
            disconnect_tx: self.disconnect_tx.clone(),
        }
    }
}

/// The event-channel receivers, drained only by the event loop.
struct Channels {
    peer_msg_rx: UnboundedReceiver<(PeerKey, Message)>,
    snub_rx: UnboundedReceiver<PeerKey>,
    disconnect_rx: UnboundedReceiver<PeerKey>,
    out_hs_rx: UnboundedReceiver<OutgoingResult>,
    in_hs_rx: UnboundedReceiver<IncomingResult>,
    peer_list_rx: UnboundedReceiver<(Vec<SocketAddr>, PeerSource)>,
    incoming_rx: UnboundedReceiver<TcpStream>,
}

pub struct Torrent {
    conf: TorrentConf,
    info_hash: Sha1Hash,
    client_id: PeerId,
    /// The parsed metadata; `None` until downloaded for magnet starts.
    info: Option<Info>,
    /// The raw info dictionary, served to peers through the metadata
    /// exchange.
    info_bytes: Option<Vec<u8>>,
    tracker_urls: Vec<Url>,

    store: Option<Box<dyn PieceStore>>,
    store_factory: Option<StoreFactory>,
    picker: Option<PiecePicker>,
    pool: BufferPool,
    addrs: AddressPool,
    keys: Arc<SingleTorrentKeys>,
    transfer: Arc<Transfer>,

    next_peer_key: PeerKey,
    peers: HashMap<PeerKey, Peer>,
    peer_ids: HashSet<PeerId>,
    /// One connection per IP: an IP lives here from dial (or accept)
    /// until its peer is gone.
    connected_peer_ips: HashSet<IpAddr>,
    /// IPs that served corrupt data. Append-only for the torrent's
    /// lifetime.
    banned_peer_ips: HashSet<IpAddr>,
    outgoing_handshakers: HashSet<SocketAddr>,
    incoming_handshakers: HashSet<SocketAddr>,
    outgoing_peer_count: usize,

    piece_downloaders: HashMap<PeerKey, PieceDownloader>,
    snubbed_downloaders: HashSet<PeerKey>,
    info_downloaders: HashMap<PeerKey, InfoDownloader>,

    completed: bool,
    completed_tx: watch::Sender<bool>,
    need_peers_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,

    senders: Senders,
    chans: Option<Channels>,
    trackers: Vec<Arc<Tracker>>,
    announcer_handles: Vec<JoinHandle<()>>,
}

impl Torrent {
    /// Builds a torrent core and the handle its owner drives it with.
    ///
    /// The store factory runs as soon as metadata is available: right away
    /// when `params.metainfo` is given, after the metadata download
    /// otherwise.
    pub fn new(
        params: TorrentParams,
        store_factory: StoreFactory,
    ) -> (Self, TorrentHandle) {
        let (peer_msg_tx, peer_msg_rx) = mpsc::unbounded_channel();
        let (snub_tx, snub_rx) = mpsc::unbounded_channel();
        let (disconnect_tx, disconnect_rx) = mpsc::unbounded_channel();
        let (out_hs_tx, out_hs_rx) = mpsc::unbounded_channel();
        let (in_hs_tx, in_hs_rx) = mpsc::unbounded_channel();
        let (peer_list_tx, peer_list_rx) = mpsc::unbounded_channel();
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = watch::channel(false);
        let (completed_tx, completed_rx) = watch::channel(false);
        let (need_peers_tx, _) = watch::channel(false);

        let mut tracker_urls = params.trackers;
        let (info, info_bytes) = match params.metainfo {
            Some(metainfo) => {
                debug_assert_eq!(metainfo.info_hash(), params.info_hash);
                for url in &metainfo.trackers {
                    if !tracker_urls.contains(url) {
                        tracker_urls.push(url.clone());
                    }
                }
                (Some(metainfo.info), Some(metainfo.info_bytes))
            }
            None => (None, None),
        };

        let left = info.as_ref().map(|i| i.total_len).unwrap_or(0);
        let transfer = Arc::new(Transfer::new(
            params.info_hash,
            params.client_id,
            params.listen_port,
            left,
        ));

        let torrent = Self {
            pool: BufferPool::new(params.conf.buffer_pool_len),
            addrs: AddressPool::new(ADDRESS_POOL_LIMIT),
            keys: Arc::new(SingleTorrentKeys::new(params.info_hash)),
            conf: params.conf,
            info_hash: params.info_hash,
            client_id: params.client_id,
            info,
            info_bytes,
            tracker_urls,
            store: None,
            store_factory: Some(store_factory),
            picker: None,
            transfer,
            next_peer_key: 0,
            peers: HashMap::new(),
            peer_ids: HashSet::new(),
            connected_peer_ips: HashSet::new(),
            banned_peer_ips: HashSet::new(),
            outgoing_handshakers: HashSet::new(),
            incoming_handshakers: HashSet::new(),
            outgoing_peer_count: 0,
            piece_downloaders: HashMap::new(),
            snubbed_downloaders: HashSet::new(),
            info_downloaders: HashMap::new(),
            completed: false,
            completed_tx,
            need_peers_tx,
            stop_rx,
            senders: Senders {
                peer_msg_tx,
                snub_tx,
                disconnect_tx,
                out_hs_tx,
                in_hs_tx,
                peer_list_tx: peer_list_tx.clone(),
            },
            chans: Some(Channels {
                peer_msg_rx,
                snub_rx,
                disconnect_rx,
                out_hs_rx,
                in_hs_rx,
                peer_list_rx,
                incoming_rx,
            }),
            trackers: Vec::new(),
            announcer_handles: Vec::new(),
        };

        let handle = TorrentHandle {
            peer_list_tx,
            incoming_tx,
            stop_tx,
            completed_rx,
        };

        (torrent, handle)
    }

    /// Runs the torrent until it is stopped (or its handle is dropped).
    ///
    /// Completion does not end the run: a finished torrent keeps serving
    /// its pieces.
    pub async fn run(mut self) -> Result<()> {
        log::info!("torrent {} starting", hex::encode(self.info_hash));

        if self.info.is_some() {
            self.open_store()?;
        }
        self.start_announcers();

        let mut chans = self.chans.take().expect("torrent ran twice");
        let mut stop_rx = self.stop_rx.clone();

        loop {
            tokio::select! {
                res = stop_rx.changed() => {
                    // a dropped handle counts as a stop request
                    if res.is_err() || *stop_rx.borrow() {
                        break;
                    }
                }
                Some((key, msg)) = chans.peer_msg_rx.recv() => {
                    self.handle_peer_message(key, msg).await?;
                }
                Some(key) = chans.snub_rx.recv() => {
                    self.handle_peer_snubbed(key);
                }
                Some(key) = chans.disconnect_rx.recv() => {
                    self.handle_peer_disconnected(key);
                }
                Some(result) = chans.out_hs_rx.recv() => {
                    self.handle_outgoing_handshake(result);
                }
                Some(result) = chans.in_hs_rx.recv() => {
                    self.handle_incoming_handshake(result);
                }
                Some((addrs, source)) = chans.peer_list_rx.recv() => {
                    self.handle_peer_list(addrs, source);
                }
                Some(conn) = chans.incoming_rx.recv() => {
                    self.handle_incoming_conn(conn);
                }
            }
        }

        self.shutdown(&mut chans).await;
        Ok(())
    }

    /// Opens the piece store and builds the picker; runs as soon as the
    /// torrent metadata is known.
    fn open_store(&mut self) -> Result<()> {
        let info = self.info.as_ref().expect("metadata known");
        let factory =
            self.store_factory.take().expect("store opened exactly once");
        let store = factory(info)?;

        let own = store.verified_bitfield();
        assert_eq!(
            own.len(),
            info.piece_count(),
            "store bitfield does not match the torrent"
        );

        let held: u64 =
            own.iter_ones().map(|i| info.piece_len(i) as u64).sum();
        self.transfer
            .left
            .store(info.total_len - held, Ordering::Relaxed);

        let picker = PiecePicker::new(info, own);
        if picker.is_complete() {
            log::info!("torrent starts out complete");
            self.completed = true;
            let _ = self.completed_tx.send(true);
        }
        self.picker = Some(picker);
        self.store = Some(store);
        Ok(())
    }

    /// Spawns one announcer per usable tracker URL. Unusable URLs only
    /// disable that tracker.
    fn start_announcers(&mut self) {
        for url in &self.tracker_urls {
            match Tracker::from_url(url.clone()) {
                Ok(tracker) => {
                    let tracker = Arc::new(tracker);
                    self.trackers.push(Arc::clone(&tracker));
                    let announcer = Announcer::new(
                        tracker,
                        Arc::clone(&self.transfer),
                        self.conf.announce_interval,
                        self.senders.peer_list_tx.clone(),
                        self.completed_tx.subscribe(),
                        self.need_peers_tx.subscribe(),
                        self.stop_rx.clone(),
                    );
                    self.announcer_handles.push(tokio::spawn(announcer.run()));
                }
                Err(e) => {
                    log::error!("disabling tracker {}: {}", url, e);
                }
            }
        }
    }

    /// New addresses from an announcer, DHT, PEX or the user.
    fn handle_peer_list(
        &mut self,
        addrs: Vec<SocketAddr>,
        source: PeerSource,
    ) {
        log::debug!("received {} peers from {}", addrs.len(), source);
        let _ = self.need_peers_tx.send(false);
        if *self.stop_rx.borrow() || self.completed {
            return;
        }
        let addrs = addrs
            .into_iter()
            .filter(|addr| !self.banned_peer_ips.contains(&addr.ip()))
            .collect();
        self.addrs.push(addrs, source);
        self.dial_addresses();
    }

    /// Keeps dialing while there are free outgoing slots. An empty pool
    /// raises the need-more-peers flag the announcers react to.
    fn dial_addresses(&mut self) {
        if self.completed || *self.stop_rx.borrow() {
            return;
        }
        while self.outgoing_peer_count + self.outgoing_handshakers.len()
            < self.conf.max_peer_dial
        {
            let (addr, source) = match self.addrs.pop() {
                Some(popped) => popped,
                None => {
                    let _ = self.need_peers_tx.send(true);
                    return;
                }
            };
            if self.banned_peer_ips.contains(&addr.ip())
                || self.connected_peer_ips.contains(&addr.ip())
            {
                continue;
            }
            self.connected_peer_ips.insert(addr.ip());
            self.outgoing_handshakers.insert(addr);
            tokio::spawn(handshaker::outgoing::run(
                addr,
                source,
                self.client_id,
                self.info_hash,
                Extensions::ours(),
                self.conf.encryption,
                self.conf.peer_connect_timeout,
                self.conf.peer_handshake_timeout,
                self.senders.out_hs_tx.clone(),
            ));
        }
    }

    fn handle_outgoing_handshake(&mut self, result: OutgoingResult) {
        self.outgoing_handshakers.remove(&result.addr);
        match result.result {
            Ok(established) => {
                self.start_peer(result.addr, result.source, established)
            }
            Err(_) => {
                // release the dial reservation and refill the slot
                self.connected_peer_ips.remove(&result.addr.ip());
                self.dial_addresses();
            }
        }
    }

    /// A connection accepted by the caller's listener.
    fn handle_incoming_conn(&mut self, conn: TcpStream) {
        if *self.stop_rx.borrow() {
            return;
        }
        let addr = match conn.peer_addr() {
            Ok(addr) => addr,
            Err(_) => return,
        };
        if self.banned_peer_ips.contains(&addr.ip())
            || self.connected_peer_ips.contains(&addr.ip())
        {
            log::debug!("refusing incoming connection from {}", addr);
            return;
        }
        self.connected_peer_ips.insert(addr.ip());
        self.incoming_handshakers.insert(addr);
        tokio::spawn(handshaker::incoming::run(
            conn,
            addr,
            self.keys.clone(),
            self.client_id,
            Extensions::ours(),
            self.conf.peer_handshake_timeout,
            self.senders.in_hs_tx.clone(),
        ));
    }

    fn handle_incoming_handshake(&mut self, result: IncomingResult) {
        self.incoming_handshakers.remove(&result.addr);
        match result.result {
            Ok(established) => {
                self.start_peer(result.addr, PeerSource::Incoming, established)
            }
            Err(_) => {
                self.connected_peer_ips.remove(&result.addr.ip());
            }
        }
    }

    /// Turns a handshaken connection into a running peer session.
    fn start_peer(
        &mut self,
        addr: SocketAddr,
        source: PeerSource,
        established: Established,
    ) {
        if self.peer_ids.contains(&established.peer_id) {
            log::debug!("peer {} duplicates a connected peer id", addr);
            // dropping the socket closes the connection
            self.connected_peer_ips.remove(&addr.ip());
            self.dial_addresses();
            return;
        }
        self.peer_ids.insert(established.peer_id);

        let key = self.next_peer_key;
        self.next_peer_key += 1;

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (block_tx, block_rx) = mpsc::channel(self.conf.piece_channel_len);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        // switch from the handshake codec to the message codec, keeping
        // whatever the peer sent right after its handshake
        let parts = established.socket.into_parts();
        let mut new_parts = FramedParts::new::<Message>(parts.io, PeerCodec);
        new_parts.read_buf = parts.read_buf;
        new_parts.write_buf = parts.write_buf;
        let socket = Framed::from_parts(new_parts);

        let mut peer = Peer::new(
            addr,
            established.peer_id,
            source,
            established.cipher,
            established.extensions,
            cmd_tx,
            block_tx,
            shutdown_tx,
        );
        if let Some(picker) = &self.picker {
            peer.bitfield =
                Some(Bitfield::repeat(false, picker.piece_count()));
        }

        session::spawn(
            key,
            addr,
            socket,
            cmd_rx,
            block_rx,
            shutdown_rx,
            self.senders.session_channels(),
            SessionConf {
                read_timeout: self.conf.piece_read_timeout,
                snub_timeout: self.conf.snub_timeout,
                keep_alive_interval: self.conf.keep_alive_interval,
            },
        );

        if source != PeerSource::Incoming {
            self.outgoing_peer_count += 1;
        }
        log::info!(
            "peer {} connected (source: {}, cipher: {})",
            addr,
            source,
            established.cipher
        );
        self.send_first_messages(&peer);
        self.peers.insert(key, peer);
    }

    /// The opening messages of a fresh session: piece availability first,
    /// then the extension handshake.
    fn send_first_messages(&self, peer: &Peer) {
        let own = self.picker.as_ref().map(PiecePicker::own_bitfield);
        if peer.extensions.fast && own.map(|b| b.all()).unwrap_or(false) {
            peer.send(Message::HaveAll);
        } else if peer.extensions.fast
            && own.map(|b| b.not_any()).unwrap_or(true)
        {
            peer.send(Message::HaveNone);
        } else if let Some(own) = own {
            peer.send(Message::Bitfield(own.clone()));
        }

        if peer.extensions.extension_protocol {
            let metadata_size =
                self.info_bytes.as_ref().map(|bytes| bytes.len() as u32);
            let handshake = ExtendedHandshake::ours(
                metadata_size,
                self.conf.advertised_request_queue_len,
            );
            peer.send(Message::Extended {
                id: crate::peer::codec::EXTENSION_HANDSHAKE_ID,
                payload: handshake.to_bytes(),
            });
        }
    }

    /// A session task wound down, or `close_peer` was called; the first
    /// of the two reports wins and the second finds nothing to do.
    fn handle_peer_disconnected(&mut self, key: PeerKey) {
        self.close_peer(key);
    }

    /// Purges a peer from every set and map, cancels its downloads and
    /// refills the dial slots.
    fn close_peer(&mut self, key: PeerKey) {
        let peer = match self.peers.remove(&key) {
            Some(peer) => peer,
            None => return,
        };
        log::info!("peer {} disconnected", peer.addr);
        let _ = peer.shutdown_tx.send(true);

        self.peer_ids.remove(&peer.id);
        self.connected_peer_ips.remove(&peer.ip());
        if peer.source != PeerSource::Incoming {
            self.outgoing_peer_count -= 1;
        }

        if let Some(downloader) = self.piece_downloaders.remove(&key) {
            if let Some(picker) = &mut self.picker {
                picker.end_download(downloader.piece_index(), key);
            }
            self.pool.release(downloader.into_buffer());
        }
        self.snubbed_downloaders.remove(&key);
        self.info_downloaders.remove(&key);
        if let Some(picker) = &mut self.picker {
            picker.remove_peer(key);
        }

        self.dial_addresses();
        self.start_piece_downloaders();
        self.start_info_downloaders();
    }

    /// Bans the peer's IP for the rest of the torrent's lifetime and
    /// disconnects it.
    fn ban_peer(&mut self, key: PeerKey) {
        if let Some(peer) = self.peers.get(&key) {
            log::warn!("banning peer {}", peer.addr);
            self.banned_peer_ips.insert(peer.ip());
        }
        self.close_peer(key);
    }

    /// The snub timer of a peer fired: it accepted a request but has not
    /// delivered within the snub window.
    fn handle_peer_snubbed(&mut self, key: PeerKey) {
        let peer = match self.peers.get_mut(&key) {
            Some(peer) => peer,
            None => return,
        };
        // the timer races the choke that stops it; a choked peer is
        // already not being waited on
        if peer.peer_choking {
            return;
        }
        if self.piece_downloaders.contains_key(&key) {
            log::debug!("peer {} snubbed", peer.addr);
            peer.snubbed = true;
            self.snubbed_downloaders.insert(key);
            self.start_piece_downloaders();
        } else if self.info_downloaders.contains_key(&key) {
            log::debug!("peer {} snubbed on metadata", peer.addr);
            peer.snubbed = true;
            self.start_info_downloaders();
        }
    }

    /// The picker pass: assigns a piece to every idle, willing peer.
    ///
    /// Invoked on every event that could make a new assignment possible:
    /// unchoke, fresh availability, piece completion, peer loss,
    /// allowed-fast grants and snubs.
    fn start_piece_downloaders(&mut self) {
        if self.picker.is_none() || self.completed {
            return;
        }
        let keys: Vec<PeerKey> = self.peers.keys().copied().collect();
        for key in keys {
            // pool exhaustion blocks new downloads until a retirement
            // frees a buffer
            if self.pool.is_exhausted() {
                return;
            }
            if self.piece_downloaders.contains_key(&key) {
                continue;
            }
            let peer = &self.peers[&key];
            if peer.snubbed {
                continue;
            }
            let picker = self.picker.as_ref().expect("checked above");
            let (index, allowed_fast) = match picker.pick(
                key,
                peer.peer_choking,
                self.conf.endgame_duplication,
            ) {
                Some(picked) => picked,
                None => continue,
            };
            let piece = picker.piece(index);
            let buffer = match self.pool.take(piece.len as usize) {
                Some(buffer) => buffer,
                None => return,
            };
            log::debug!(
                "assigning piece {} to peer {} (allowed fast: {})",
                index,
                peer.addr,
                allowed_fast
            );
            let mut downloader = PieceDownloader::new(
                index,
                piece.len,
                piece.hash,
                allowed_fast,
                buffer,
            );
            let requests = downloader
                .next_requests(peer.request_queue_len(self.conf.request_queue_len));
            for request in &requests {
                peer.send(Message::Request(*request));
            }
            if !requests.is_empty() {
                peer.reset_snub_timer();
            }
            self.picker
                .as_mut()
                .expect("checked above")
                .start_download(index, key);
            self.piece_downloaders.insert(key, downloader);
        }
    }

    /// Tops up the request pipeline of a peer's running download.
    fn request_more(&mut self, key: PeerKey) {
        let downloader = match self.piece_downloaders.get_mut(&key) {
            Some(downloader) => downloader,
            None => return,
        };
        let peer = match self.peers.get(&key) {
            Some(peer) => peer,
            None => return,
        };
        if peer.peer_choking && !downloader.allowed_fast() {
            return;
        }
        let requests = downloader
            .next_requests(peer.request_queue_len(self.conf.request_queue_len));
        if !requests.is_empty() {
            for request in &requests {
                peer.send(Message::Request(*request));
            }
            peer.reset_snub_timer();
        }
    }

    /// Starts metadata downloads while the torrent has no info yet.
    fn start_info_downloaders(&mut self) {
        if self.info.is_some() {
            return;
        }
        let keys: Vec<PeerKey> = self.peers.keys().copied().collect();
        for key in keys {
            if self.info_downloaders.len()
                >= self.conf.parallel_metadata_downloads
            {
                return;
            }
            if self.info_downloaders.contains_key(&key) {
                continue;
            }
            let peer = &self.peers[&key];
            if peer.snubbed {
                continue;
            }
            let ut_id = match peer.ut_metadata_id() {
                Some(id) => id,
                None => continue,
            };
            let total_size = match peer
                .ext_handshake
                .as_ref()
                .and_then(|hs| hs.metadata_size)
                .filter(|&size| size > 0)
            {
                Some(size) => size,
                None => continue,
            };

            log::debug!(
                "downloading metadata ({} bytes) from peer {}",
                total_size,
                peer.addr
            );
            let mut downloader = InfoDownloader::new(total_size);
            for piece in downloader.next_requests() {
                peer.send(Message::Extended {
                    id: ut_id,
                    payload: crate::peer::codec::MetadataMessage::Request {
                        piece,
                    }
                    .to_bytes(),
                });
            }
            peer.reset_snub_timer();
            self.info_downloaders.insert(key, downloader);
        }
    }

    /// The full metadata arrived and matched the info hash: open the
    /// store, arm the picker and replay what peers told us in the
    /// meantime.
    fn metadata_acquired(&mut self, bytes: Vec<u8>) -> Result<()> {
        log::info!("metadata acquired ({} bytes)", bytes.len());
        self.info = Some(Info::from_bytes(&bytes)?);
        self.info_bytes = Some(bytes);
        self.info_downloaders.clear();
        self.open_store()?;

        let piece_count =
            self.picker.as_ref().expect("store just opened").piece_count();
        for peer in self.peers.values_mut() {
            peer.bitfield = Some(Bitfield::repeat(false, piece_count));
        }

        // replay the availability messages queued per peer, in arrival
        // order; replay may well disconnect a misbehaving peer
        let keys: Vec<PeerKey> = self.peers.keys().copied().collect();
        for key in keys {
            let queued = match self.peers.get_mut(&key) {
                Some(peer) => std::mem::take(&mut peer.queued_messages),
                None => continue,
            };
            for msg in queued {
                if !self.peers.contains_key(&key) {
                    break;
                }
                self.handle_availability_msg(key, msg);
            }
        }

        self.start_piece_downloaders();
        Ok(())
    }

    /// Stops every task, then fans the `stopped` announces out under the
    /// configured deadline.
    async fn shutdown(&mut self, chans: &mut Channels) {
        log::info!("torrent {} stopping", hex::encode(self.info_hash));

        let keys: Vec<PeerKey> = self.peers.keys().copied().collect();
        for key in keys {
            self.close_peer(key);
        }

        // the periodic announcers observe the stop signal; the stopped
        // announces go out only after they have wound down
        for handle in self.announcer_handles.drain(..) {
            let _ = handle.await;
        }

        if !self.trackers.is_empty() {
            let (result_tx, result_rx) = oneshot::channel();
            let stop_announcer = StopAnnouncer::new(
                std::mem::take(&mut self.trackers),
                Arc::clone(&self.transfer),
                self.conf.stop_announce_timeout,
                result_tx,
            );
            tokio::spawn(stop_announcer.run());
            let _ = result_rx.await;
        }

        // drain the disconnection events of the sessions we just closed
        while let Ok(key) = chans.disconnect_rx.try_recv() {
            self.handle_peer_disconnected(key);
        }

        log::info!("torrent {} stopped", hex::encode(self.info_hash));
    }
}
