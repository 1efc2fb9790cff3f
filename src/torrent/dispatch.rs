//! The message dispatcher: the single point where every inbound peer
//! message becomes a state update.
//!
//! The match over [`Message`] is total; validation failures disconnect
//! the offending peer and never escape further. Availability messages
//! that arrive before the torrent metadata is known are queued on the
//! peer and replayed in arrival order once it is.

use std::cmp;
use std::sync::atomic::Ordering;

use super::{Result, Torrent};
use crate::blockinfo::BlockInfo;
use crate::define::bitfield_byte_count;
use crate::peer::codec::{
    ExtendedHandshake, Message, MetadataMessage, EXTENSION_HANDSHAKE_ID,
    METADATA_PIECE_LEN, OUR_UT_METADATA_ID,
};
use crate::peer::PeerKey;
use crate::PieceIndex;

impl Torrent {
    /// Dispatches one message received from a peer's reader task.
    pub(crate) async fn handle_peer_message(
        &mut self,
        key: PeerKey,
        msg: Message,
    ) -> Result<()> {
        // the session may still be flushing messages after the peer was
        // closed out of the torrent's books
        if !self.peers.contains_key(&key) {
            return Ok(());
        }
        log::debug!("peer message: {:?}", msg.id());

        match msg {
            Message::KeepAlive => {}

            msg @ (Message::Have { .. }
            | Message::Bitfield(_)
            | Message::HaveAll
            | Message::AllowedFast { .. }) => {
                if self.picker.is_none() {
                    // remembered for replay once the metadata arrives
                    self.peers
                        .get_mut(&key)
                        .expect("peer checked at dispatch")
                        .queued_messages
                        .push(msg);
                } else {
                    self.handle_availability_msg(key, msg);
                }
            }

            // the peer starts out empty, which is what we assume anyway
            Message::HaveNone => {}

            // a hint only; the picker stays in charge
            Message::Suggest { piece_index } => {
                log::debug!("peer suggests piece {}", piece_index);
            }

            Message::Choke => self.handle_choke_msg(key),
            Message::Unchoke => self.handle_unchoke_msg(key),
            Message::Interested => self.handle_interested_msg(key),
            Message::NotInterested => self.handle_not_interested_msg(key),

            Message::Piece {
                piece_index,
                offset,
                data,
            } => self.handle_block_msg(key, piece_index, offset, data)?,

            Message::Request(block) => {
                self.handle_request_msg(key, block).await
            }

            // blocks already handed to the writer are not recalled
            Message::Cancel(block) => {
                log::debug!("peer cancelled request {}", block);
            }

            Message::Reject(block) => self.handle_reject_msg(key, block),

            Message::Extended { id, payload } => {
                self.handle_extended_msg(key, id, payload)?
            }
        }
        Ok(())
    }

    /// Have, bitfield, have-all and allowed-fast, with the metadata
    /// known. Every path ends with an interest update and a picker pass.
    pub(crate) fn handle_availability_msg(&mut self, key: PeerKey, msg: Message) {
        let piece_count = self
            .picker
            .as_ref()
            .expect("availability handled with metadata")
            .piece_count();

        match msg {
            Message::Have { piece_index } => {
                if piece_index >= piece_count {
                    log::error!("have with invalid index {}", piece_index);
                    self.close_peer(key);
                    return;
                }
                self.record_peer_has(key, piece_index);
            }
            Message::Bitfield(bits) => {
                // the wire length must be exactly the pieces rounded up to
                // a byte
                if bits.len() != bitfield_byte_count(piece_count) * 8 {
                    log::error!(
                        "bitfield of invalid length: {} bytes",
                        bits.len() / 8
                    );
                    self.close_peer(key);
                    return;
                }
                for index in bits.iter_ones() {
                    // spare bits round the length up; nothing to record
                    if index >= piece_count {
                        break;
                    }
                    self.record_peer_has(key, index);
                }
            }
            Message::HaveAll => {
                for index in 0..piece_count {
                    self.record_peer_has(key, index);
                }
            }
            Message::AllowedFast { piece_index } => {
                if piece_index >= piece_count {
                    log::error!(
                        "allowed fast with invalid index {}",
                        piece_index
                    );
                    self.close_peer(key);
                    return;
                }
                self.picker
                    .as_mut()
                    .expect("availability handled with metadata")
                    .allow_fast(key, piece_index);
            }
            _ => unreachable!("only availability messages are queued"),
        }

        self.update_interest(key);
        self.start_piece_downloaders();
    }

    /// Keeps the picker's having set and the peer's bitfield mirror in
    /// lockstep.
    fn record_peer_has(&mut self, key: PeerKey, index: PieceIndex) {
        self.picker
            .as_mut()
            .expect("availability handled with metadata")
            .peer_has_piece(key, index);
        if let Some(peer) = self.peers.get_mut(&key) {
            if let Some(bitfield) = &mut peer.bitfield {
                bitfield.set(index, true);
            }
        }
    }

    /// Sends interested/not-interested on transitions of whether the peer
    /// has pieces we lack.
    pub(crate) fn update_interest(&mut self, key: PeerKey) {
        let interesting = match &self.picker {
            Some(picker) => picker.is_peer_interesting(key),
            None => return,
        };
        let peer = match self.peers.get_mut(&key) {
            Some(peer) => peer,
            None => return,
        };
        if interesting && !peer.am_interested {
            peer.am_interested = true;
            peer.send(Message::Interested);
        } else if !interesting && peer.am_interested {
            peer.am_interested = false;
            peer.send(Message::NotInterested);
        }
    }

    fn handle_choke_msg(&mut self, key: PeerKey) {
        let peer = match self.peers.get_mut(&key) {
            Some(peer) => peer,
            None => return,
        };
        if peer.peer_choking {
            return;
        }
        peer.peer_choking = true;
        log::debug!("peer {} choked us", peer.addr);

        if let Some(downloader) = self.piece_downloaders.get_mut(&key) {
            if !peer.extensions.fast {
                // nothing outstanding will be served now
                downloader.choked();
                peer.stop_snub_timer();
            }
            // under the fast extension the peer explicitly rejects
            // whatever it drops, so outstanding requests stay
        }
    }

    fn handle_unchoke_msg(&mut self, key: PeerKey) {
        let peer = match self.peers.get_mut(&key) {
            Some(peer) => peer,
            None => return,
        };
        if !peer.peer_choking {
            return;
        }
        peer.peer_choking = false;
        log::debug!("peer {} unchoked us", peer.addr);

        // resume a download paused by the choke, then look for new work
        self.request_more(key);
        self.start_piece_downloaders();
    }

    fn handle_interested_msg(&mut self, key: PeerKey) {
        let peer = match self.peers.get_mut(&key) {
            Some(peer) => peer,
            None => return,
        };
        peer.peer_interested = true;
        // no upload-slot policy in the core: whoever asks gets unchoked
        if peer.am_choking {
            peer.am_choking = false;
            peer.send(Message::Unchoke);
        }
    }

    fn handle_not_interested_msg(&mut self, key: PeerKey) {
        let peer = match self.peers.get_mut(&key) {
            Some(peer) => peer,
            None => return,
        };
        peer.peer_interested = false;
        if !peer.am_choking {
            peer.am_choking = true;
            peer.send(Message::Choke);
        }
    }

    /// An arriving block of piece data.
    fn handle_block_msg(
        &mut self,
        key: PeerKey,
        piece_index: PieceIndex,
        offset: u32,
        data: Vec<u8>,
    ) -> Result<()> {
        let picker = match &self.picker {
            Some(picker) => picker,
            None => {
                log::error!("block received but we have no metadata");
                self.close_peer(key);
                return Ok(());
            }
        };
        if piece_index >= picker.piece_count() {
            log::error!("block with invalid piece index {}", piece_index);
            self.close_peer(key);
            return Ok(());
        }
        let block = BlockInfo {
            piece_index,
            offset,
            len: data.len() as u32,
        };
        if !block.is_canonical(picker.piece(piece_index).len) {
            log::error!("block with invalid geometry {}", block);
            self.close_peer(key);
            return Ok(());
        }

        self.transfer
            .downloaded
            .fetch_add(data.len() as u64, Ordering::Relaxed);

        let downloader = match self.piece_downloaders.get_mut(&key) {
            Some(downloader) => downloader,
            None => {
                log::debug!("dropping block {} with no download", block);
                return Ok(());
            }
        };
        if downloader.piece_index() != piece_index {
            log::debug!("dropping block {} of a reassigned piece", block);
            return Ok(());
        }
        if !downloader.got_block(&block, &data) {
            log::warn!("received duplicate block: {}", block);
            return Ok(());
        }

        // the peer delivered: disarm the snub timer and forgive a snub
        let peer = self.peers.get_mut(&key).expect("peer checked at dispatch");
        peer.stop_snub_timer();
        if peer.snubbed {
            peer.snubbed = false;
            self.snubbed_downloaders.remove(&key);
        }

        // endgame duplicates of this piece no longer need this block
        let block_index = block.index_in_piece();
        let duplicates: Vec<PeerKey> = self
            .picker
            .as_ref()
            .expect("checked above")
            .piece(piece_index)
            .downloading
            .iter()
            .copied()
            .filter(|&other| other != key)
            .collect();
        for other in duplicates {
            let other_downloader =
                match self.piece_downloaders.get_mut(&other) {
                    Some(downloader) => downloader,
                    None => continue,
                };
            if other_downloader.has_requested(block_index) {
                other_downloader.rejected(&block);
                if let Some(other_peer) = self.peers.get(&other) {
                    other_peer.send(Message::Cancel(block));
                }
            }
        }

        let done = self
            .piece_downloaders
            .get(&key)
            .map(|downloader| downloader.is_done())
            .unwrap_or(false);
        if done {
            self.finish_piece(key)?;
        } else {
            self.request_more(key);
        }
        Ok(())
    }

    /// The last block of a piece arrived: verify, retire and fan out.
    fn finish_piece(&mut self, key: PeerKey) -> Result<()> {
        let downloader = self
            .piece_downloaders
            .remove(&key)
            .expect("finishing an active download");
        let index = downloader.piece_index();
        let picker = self.picker.as_mut().expect("downloading with metadata");
        picker.end_download(index, key);

        // endgame duplicates of a finished piece are torn down outright
        let duplicates: Vec<PeerKey> = picker.piece(index).downloading.clone();
        for other in duplicates {
            if let Some(other_downloader) =
                self.piece_downloaders.remove(&other)
            {
                if let Some(other_peer) = self.peers.get(&other) {
                    for block in other_downloader.outstanding_requests() {
                        other_peer.send(Message::Cancel(block));
                    }
                    other_peer.stop_snub_timer();
                }
                picker.end_download(index, other);
                self.pool.release(other_downloader.into_buffer());
            }
        }

        if !downloader.verify() {
            log::warn!("piece {} failed hash verification", index);
            self.pool.release(downloader.into_buffer());
            // the piece returns to the picker pool; the peer is done here
            self.ban_peer(key);
            self.start_piece_downloaders();
            return Ok(());
        }
        log::debug!("piece {} verified", index);

        let piece_len = picker.piece(index).len;
        let store = self.store.as_mut().expect("metadata implies store");
        store.write(index, downloader.buffer())?;
        picker.mark_verified(index);
        self.transfer
            .left
            .fetch_sub(piece_len as u64, Ordering::Relaxed);
        self.pool.release(downloader.into_buffer());

        for peer in self.peers.values() {
            peer.send(Message::Have { piece_index: index });
        }
        // holding this piece may have ended our interest in some peers
        let keys: Vec<PeerKey> = self.peers.keys().copied().collect();
        for peer_key in keys {
            self.update_interest(peer_key);
        }

        if self.picker.as_ref().expect("checked above").is_complete() {
            log::info!("torrent {} complete", hex::encode(self.info_hash));
            self.completed = true;
            let _ = self.completed_tx.send(true);
        }
        self.start_piece_downloaders();
        Ok(())
    }

    /// A peer asks for a block of ours.
    async fn handle_request_msg(&mut self, key: PeerKey, block: BlockInfo) {
        let picker = match &self.picker {
            Some(picker) => picker,
            None => {
                log::error!("request received but we have no metadata");
                self.close_peer(key);
                return;
            }
        };
        if block.piece_index >= picker.piece_count() {
            log::error!("request with invalid index {}", block.piece_index);
            self.close_peer(key);
            return;
        }
        let piece_len = picker.piece(block.piece_index).len;
        if block.offset as u64 + block.len as u64 > piece_len as u64 {
            log::error!("request past the end of the piece: {}", block);
            self.close_peer(key);
            return;
        }

        let peer = self.peers.get(&key).expect("peer checked at dispatch");
        if peer.am_choking {
            // only the fast extension has a way to say no
            if peer.extensions.fast {
                peer.send(Message::Reject(block));
            }
            return;
        }

        let data = match self
            .store
            .as_mut()
            .expect("metadata implies store")
            .read(block.piece_index, block.offset, block.len)
        {
            Ok(data) => data,
            Err(e) => {
                log::warn!("cannot serve {}: {}", block, e);
                if peer.extensions.fast {
                    peer.send(Message::Reject(block));
                }
                return;
            }
        };

        self.transfer
            .uploaded
            .fetch_add(block.len as u64, Ordering::Relaxed);

        // block payloads ride the bounded piece channel; when it is full
        // we wait here, yielding until the peer's writer drains it
        let msg = Message::Piece {
            piece_index: block.piece_index,
            offset: block.offset,
            data,
        };
        if peer.block_tx.send(msg).await.is_err() {
            log::debug!("peer {} session gone, dropping block", peer.addr);
        }
    }

    /// A fast-extension refusal of one of our requests.
    fn handle_reject_msg(&mut self, key: PeerKey, block: BlockInfo) {
        let picker = match &self.picker {
            Some(picker) => picker,
            None => {
                log::error!("reject received but we have no metadata");
                self.close_peer(key);
                return;
            }
        };
        if block.piece_index >= picker.piece_count() {
            log::error!("reject with invalid index {}", block.piece_index);
            self.close_peer(key);
            return;
        }
        if !block.is_canonical(picker.piece(block.piece_index).len) {
            log::error!("reject with invalid geometry {}", block);
            self.close_peer(key);
            return;
        }
        let downloader = match self.piece_downloaders.get_mut(&key) {
            Some(downloader) => downloader,
            None => {
                log::error!("reject received with no active download");
                self.close_peer(key);
                return;
            }
        };
        if downloader.piece_index() != block.piece_index {
            log::debug!("reject {} of a reassigned piece", block);
            return;
        }
        downloader.rejected(&block);
    }

    /// An extension-protocol frame.
    fn handle_extended_msg(
        &mut self,
        key: PeerKey,
        id: u8,
        payload: Vec<u8>,
    ) -> Result<()> {
        match id {
            EXTENSION_HANDSHAKE_ID => {
                let handshake = match ExtendedHandshake::from_bytes(&payload) {
                    Ok(handshake) => handshake,
                    Err(_) => {
                        log::error!("undecodable extension handshake");
                        self.close_peer(key);
                        return Ok(());
                    }
                };
                log::debug!("peer extension handshake: {:?}", handshake);
                self.peers
                    .get_mut(&key)
                    .expect("peer checked at dispatch")
                    .ext_handshake = Some(handshake);
                self.start_info_downloaders();
            }
            OUR_UT_METADATA_ID => {
                let msg = match MetadataMessage::from_bytes(&payload) {
                    Ok(msg) => msg,
                    Err(_) => {
                        log::error!("undecodable metadata message");
                        self.close_peer(key);
                        return Ok(());
                    }
                };
                match msg {
                    MetadataMessage::Request { piece } => {
                        self.handle_metadata_request(key, piece);
                    }
                    MetadataMessage::Data { piece, data, .. } => {
                        self.handle_metadata_data(key, piece, data)?;
                    }
                    MetadataMessage::Reject { piece } => {
                        if let Some(downloader) =
                            self.info_downloaders.get_mut(&key)
                        {
                            downloader.rejected(piece);
                        }
                    }
                }
            }
            other => {
                log::debug!("message for unnegotiated extension id {}", other);
            }
        }
        Ok(())
    }

    /// A peer asks for a slice of the info dictionary.
    fn handle_metadata_request(&mut self, key: PeerKey, piece: u32) {
        let peer = self.peers.get(&key).expect("peer checked at dispatch");
        // without a negotiated metadata id there is no way to even
        // address a reject at the peer, so the request is dropped
        let ut_id = match peer.ut_metadata_id() {
            Some(id) => id,
            None => {
                log::debug!(
                    "metadata request from {} without negotiation",
                    peer.addr
                );
                return;
            }
        };

        let reply = match &self.info_bytes {
            Some(bytes) => {
                let total_size = bytes.len() as u32;
                let start = piece as u64 * METADATA_PIECE_LEN as u64;
                if start >= bytes.len() as u64 {
                    MetadataMessage::Reject { piece }
                } else {
                    let end = cmp::min(
                        start + METADATA_PIECE_LEN as u64,
                        bytes.len() as u64,
                    );
                    MetadataMessage::Data {
                        piece,
                        total_size,
                        data: bytes[start as usize..end as usize].to_vec(),
                    }
                }
            }
            // nothing to serve yet: an explicit reject beats leaving the
            // peer hanging
            None => MetadataMessage::Reject { piece },
        };
        peer.send(Message::Extended {
            id: ut_id,
            payload: reply.to_bytes(),
        });
    }

    /// A metadata slice arrived for our info download.
    fn handle_metadata_data(
        &mut self,
        key: PeerKey,
        piece: u32,
        data: Vec<u8>,
    ) -> Result<()> {
        let downloader = match self.info_downloaders.get_mut(&key) {
            Some(downloader) => downloader,
            None => {
                log::error!("unexpected metadata piece {}", piece);
                self.close_peer(key);
                return Ok(());
            }
        };
        if !downloader.got_piece(piece, &data) {
            log::error!("invalid metadata piece {}", piece);
            self.close_peer(key);
            return Ok(());
        }

        let peer = self.peers.get(&key).expect("peer checked at dispatch");
        peer.stop_snub_timer();

        if downloader.is_done() {
            let downloader = self
                .info_downloaders
                .remove(&key)
                .expect("checked above");
            if !downloader.verify(&self.info_hash) {
                log::warn!("metadata failed hash verification");
                self.ban_peer(key);
                self.start_info_downloaders();
                return Ok(());
            }
            self.metadata_acquired(downloader.into_bytes())?;
        } else {
            let requests = downloader.next_requests();
            if let Some(ut_id) = peer.ut_metadata_id() {
                for piece in requests {
                    peer.send(Message::Extended {
                        id: ut_id,
                        payload: MetadataMessage::Request { piece }.to_bytes(),
                    });
                }
                peer.reset_snub_timer();
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use sha1::{Digest, Sha1};
    use tokio::sync::{mpsc, watch};

    use super::super::{TorrentHandle, TorrentParams};
    use super::*;
    use crate::conf::TorrentConf;
    use crate::handshaker::Cipher;
    use crate::metainfo::{Info, Metainfo};
    use crate::peer::codec::Extensions;
    use crate::peer::{session, Peer, PeerSource};
    use crate::storage::{InMemoryStore, PieceStore};
    use crate::{Bitfield, BLOCK_LEN};

    const PIECE_LEN: u32 = 2 * BLOCK_LEN;
    const PIECE_COUNT: usize = 2;

    /// Deterministic content of the whole test torrent: two pieces of two
    /// blocks each.
    fn make_content() -> Vec<u8> {
        (0..PIECE_COUNT as u32 * PIECE_LEN)
            .map(|i| (i % 251) as u8)
            .collect()
    }

    fn piece_of(content: &[u8], index: usize) -> &[u8] {
        &content[index * PIECE_LEN as usize..(index + 1) * PIECE_LEN as usize]
    }

    fn make_metainfo() -> Metainfo {
        let content = make_content();
        let mut torrent = Vec::new();
        torrent.extend_from_slice(b"d4:info");
        torrent.extend_from_slice(
            format!(
                "d6:lengthi{}e4:name8:test.bin12:piece lengthi{}e6:pieces{}:",
                content.len(),
                PIECE_LEN,
                PIECE_COUNT * 20
            )
            .as_bytes(),
        );
        for index in 0..PIECE_COUNT {
            let hash: [u8; 20] = Sha1::digest(piece_of(&content, index)).into();
            torrent.extend_from_slice(&hash);
        }
        torrent.extend_from_slice(b"ee");
        Metainfo::from_bytes(&torrent).unwrap()
    }

    fn make_params(metainfo: Option<Metainfo>) -> TorrentParams {
        let info_hash = make_metainfo().info_hash();
        TorrentParams {
            conf: TorrentConf::default(),
            info_hash,
            client_id: [1; 20],
            listen_port: 6881,
            metainfo,
            trackers: Vec::new(),
        }
    }

    /// A torrent with known metadata and an open in-memory store holding
    /// the given pieces.
    fn make_torrent_with(pieces: &'static [usize]) -> (Torrent, TorrentHandle) {
        let (mut torrent, handle) = Torrent::new(
            make_params(Some(make_metainfo())),
            Box::new(move |info: &Info| {
                let mut store = InMemoryStore::new(info);
                let content = make_content();
                for &index in pieces {
                    store.write(index, piece_of(&content, index)).unwrap();
                }
                Ok(Box::new(store) as Box<dyn PieceStore>)
            }),
        );
        torrent.open_store().unwrap();
        (torrent, handle)
    }

    fn make_torrent() -> (Torrent, TorrentHandle) {
        make_torrent_with(&[])
    }

    /// A torrent started from an info hash only, as from a magnet link.
    fn make_magnet_torrent() -> (Torrent, TorrentHandle) {
        Torrent::new(
            make_params(None),
            Box::new(|info: &Info| {
                Ok(Box::new(InMemoryStore::new(info)) as Box<dyn PieceStore>)
            }),
        )
    }

    struct TestPeer {
        key: crate::peer::PeerKey,
        cmd_rx: session::Receiver,
        block_rx: mpsc::Receiver<Message>,
    }

    /// Wires a fake peer record straight into the torrent's books, with
    /// the session channels held by the test.
    fn add_peer(torrent: &mut Torrent, extensions: Extensions) -> TestPeer {
        let key = torrent.next_peer_key;
        torrent.next_peer_key += 1;

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (block_tx, block_rx) = mpsc::channel(4);
        let (shutdown_tx, _shutdown_rx) = watch::channel(false);

        let addr: SocketAddr =
            format!("10.0.0.{}:6881", key + 1).parse().unwrap();
        let mut id = [0u8; 20];
        id[0] = key as u8;

        let mut peer = Peer::new(
            addr,
            id,
            PeerSource::Tracker,
            Cipher::Plaintext,
            extensions,
            cmd_tx,
            block_tx,
            shutdown_tx,
        );
        if let Some(picker) = &torrent.picker {
            peer.bitfield =
                Some(Bitfield::repeat(false, picker.piece_count()));
        }

        torrent.peer_ids.insert(id);
        torrent.connected_peer_ips.insert(addr.ip());
        torrent.outgoing_peer_count += 1;
        torrent.peers.insert(key, peer);

        TestPeer {
            key,
            cmd_rx,
            block_rx,
        }
    }

    fn drain_commands(rx: &mut session::Receiver) -> Vec<session::Command> {
        let mut commands = Vec::new();
        while let Ok(cmd) = rx.try_recv() {
            commands.push(cmd);
        }
        commands
    }

    fn sent_messages(rx: &mut session::Receiver) -> Vec<Message> {
        drain_commands(rx)
            .into_iter()
            .filter_map(|cmd| match cmd {
                session::Command::Send(msg) => Some(msg),
                _ => None,
            })
            .collect()
    }

    fn requests_of(msgs: &[Message]) -> Vec<BlockInfo> {
        msgs.iter()
            .filter_map(|msg| match msg {
                Message::Request(block) => Some(*block),
                _ => None,
            })
            .collect()
    }

    /// The full single-peer, no-fast-extension download: bitfield,
    /// interest, unchoke, block exchange, piece retirement and
    /// completion.
    #[tokio::test]
    async fn test_single_peer_download() {
        let (mut torrent, handle) = make_torrent();
        let content = make_content();
        let mut peer = add_peer(&mut torrent, Extensions::default());

        // the peer is a seed: 0b11000000
        torrent
            .handle_peer_message(
                peer.key,
                Message::Bitfield(Bitfield::from_vec(vec![0b1100_0000])),
            )
            .await
            .unwrap();
        let msgs = sent_messages(&mut peer.cmd_rx);
        assert!(msgs.contains(&Message::Interested));
        // we are still choked, so nothing was requested yet
        assert!(requests_of(&msgs).is_empty());

        torrent
            .handle_peer_message(peer.key, Message::Unchoke)
            .await
            .unwrap();
        let first_requests = requests_of(&sent_messages(&mut peer.cmd_rx));
        assert_eq!(first_requests.len(), 2);
        let first_piece = first_requests[0].piece_index;
        assert_eq!(first_requests[0].offset, 0);
        assert_eq!(first_requests[1].offset, BLOCK_LEN);

        // serve the blocks of the first assigned piece
        for request in &first_requests {
            let piece = piece_of(&content, request.piece_index);
            let offset = request.offset as usize;
            torrent
                .handle_peer_message(
                    peer.key,
                    Message::Piece {
                        piece_index: request.piece_index,
                        offset: request.offset,
                        data: piece[offset..offset + request.len as usize]
                            .to_vec(),
                    },
                )
                .await
                .unwrap();
        }

        // the finished piece was announced and the second piece assigned
        let msgs = sent_messages(&mut peer.cmd_rx);
        assert!(msgs.contains(&Message::Have {
            piece_index: first_piece
        }));
        let second_requests = requests_of(&msgs);
        assert_eq!(second_requests.len(), 2);
        let second_piece = second_requests[0].piece_index;
        assert_ne!(second_piece, first_piece);

        for request in &second_requests {
            let piece = piece_of(&content, request.piece_index);
            let offset = request.offset as usize;
            torrent
                .handle_peer_message(
                    peer.key,
                    Message::Piece {
                        piece_index: request.piece_index,
                        offset: request.offset,
                        data: piece[offset..offset + request.len as usize]
                            .to_vec(),
                    },
                )
                .await
                .unwrap();
        }

        // the torrent completed and we lost interest in the seed
        let msgs = sent_messages(&mut peer.cmd_rx);
        assert!(msgs.contains(&Message::Have {
            piece_index: second_piece
        }));
        assert!(msgs.contains(&Message::NotInterested));
        assert!(torrent.completed);
        assert!(*handle.completed_rx.borrow());

        // the store holds the verified content
        let store = torrent.store.as_mut().unwrap();
        for index in 0..PIECE_COUNT {
            assert_eq!(
                store.read(index, 0, PIECE_LEN).unwrap(),
                piece_of(&content, index)
            );
        }
        assert_eq!(
            torrent.transfer.downloaded.load(Ordering::Relaxed),
            content.len() as u64
        );
        assert_eq!(torrent.transfer.left.load(Ordering::Relaxed), 0);
    }

    /// A bitfield and an equivalent have storm produce identical state.
    #[tokio::test]
    async fn test_bitfield_equals_have_storm() {
        let (mut torrent_a, _h) = make_torrent();
        let peer_a = add_peer(&mut torrent_a, Extensions::default());
        torrent_a
            .handle_peer_message(
                peer_a.key,
                Message::Bitfield(Bitfield::from_vec(vec![0b1100_0000])),
            )
            .await
            .unwrap();

        let (mut torrent_b, _h) = make_torrent();
        let peer_b = add_peer(&mut torrent_b, Extensions::default());
        for piece_index in 0..PIECE_COUNT {
            torrent_b
                .handle_peer_message(peer_b.key, Message::Have { piece_index })
                .await
                .unwrap();
        }

        for index in 0..PIECE_COUNT {
            let having_a: Vec<_> = torrent_a
                .picker
                .as_ref()
                .unwrap()
                .piece(index)
                .having_peers
                .iter()
                .copied()
                .collect();
            let having_b: Vec<_> = torrent_b
                .picker
                .as_ref()
                .unwrap()
                .piece(index)
                .having_peers
                .iter()
                .copied()
                .collect();
            assert_eq!(having_a, vec![peer_a.key]);
            assert_eq!(having_b, vec![peer_b.key]);
        }
        // the peers' bitfield mirrors agree too
        assert_eq!(
            torrent_a.peers[&peer_a.key].bitfield,
            torrent_b.peers[&peer_b.key].bitfield
        );
    }

    /// Index boundaries: `num_pieces - 1` is accepted, `num_pieces`
    /// disconnects.
    #[tokio::test]
    async fn test_have_index_boundaries() {
        let (mut torrent, _h) = make_torrent();
        let peer = add_peer(&mut torrent, Extensions::default());

        torrent
            .handle_peer_message(
                peer.key,
                Message::Have {
                    piece_index: PIECE_COUNT - 1,
                },
            )
            .await
            .unwrap();
        assert!(torrent.peers.contains_key(&peer.key));

        torrent
            .handle_peer_message(
                peer.key,
                Message::Have {
                    piece_index: PIECE_COUNT,
                },
            )
            .await
            .unwrap();
        assert!(!torrent.peers.contains_key(&peer.key));
    }

    /// A bitfield one byte off disconnects the peer.
    #[tokio::test]
    async fn test_bitfield_length_must_be_exact() {
        let (mut torrent, _h) = make_torrent();
        let peer = add_peer(&mut torrent, Extensions::default());

        torrent
            .handle_peer_message(
                peer.key,
                Message::Bitfield(Bitfield::from_vec(vec![0b1100_0000, 0])),
            )
            .await
            .unwrap();
        assert!(!torrent.peers.contains_key(&peer.key));
    }

    /// Scenario: choke mid-piece. Outstanding requests requeue, the snub
    /// timer stops, and an unchoke re-requests the same blocks in order.
    #[tokio::test]
    async fn test_choke_mid_piece_requeues() {
        let (mut torrent, _h) = make_torrent();
        let mut peer = add_peer(&mut torrent, Extensions::default());

        torrent
            .handle_peer_message(
                peer.key,
                Message::Bitfield(Bitfield::from_vec(vec![0b1100_0000])),
            )
            .await
            .unwrap();
        torrent
            .handle_peer_message(peer.key, Message::Unchoke)
            .await
            .unwrap();
        let first_requests = requests_of(&sent_messages(&mut peer.cmd_rx));
        assert_eq!(first_requests.len(), 2);

        torrent
            .handle_peer_message(peer.key, Message::Choke)
            .await
            .unwrap();
        let downloader = &torrent.piece_downloaders[&peer.key];
        assert!(downloader.outstanding_requests().is_empty());
        assert!(drain_commands(&mut peer.cmd_rx)
            .iter()
            .any(|cmd| matches!(cmd, session::Command::StopSnubTimer)));

        torrent
            .handle_peer_message(peer.key, Message::Unchoke)
            .await
            .unwrap();
        let requeued = requests_of(&sent_messages(&mut peer.cmd_rx));
        assert_eq!(requeued, first_requests);
    }

    /// Scenario: hash mismatch. The peer is banned and disconnected, the
    /// piece requeued, and the address is not redialed.
    #[tokio::test]
    async fn test_hash_mismatch_bans_peer() {
        let (mut torrent, _h) = make_torrent();
        let mut peer = add_peer(&mut torrent, Extensions::default());
        let peer_addr = torrent.peers[&peer.key].addr;

        torrent
            .handle_peer_message(
                peer.key,
                Message::Bitfield(Bitfield::from_vec(vec![0b1100_0000])),
            )
            .await
            .unwrap();
        torrent
            .handle_peer_message(peer.key, Message::Unchoke)
            .await
            .unwrap();
        let requests = requests_of(&sent_messages(&mut peer.cmd_rx));
        let piece_index = requests[0].piece_index;

        // deliver garbage of the right shape
        for request in &requests {
            torrent
                .handle_peer_message(
                    peer.key,
                    Message::Piece {
                        piece_index: request.piece_index,
                        offset: request.offset,
                        data: vec![0xee; request.len as usize],
                    },
                )
                .await
                .unwrap();
        }

        assert!(!torrent.peers.contains_key(&peer.key));
        assert!(torrent.banned_peer_ips.contains(&peer_addr.ip()));
        // the piece went back to the pool
        let piece = torrent.picker.as_ref().unwrap().piece(piece_index);
        assert!(piece.downloading.is_empty());
        assert!(!torrent.picker.as_ref().unwrap().own_bitfield()[piece_index]);

        // the banned address is filtered on ingest
        torrent.handle_peer_list(vec![peer_addr], PeerSource::Tracker);
        assert!(torrent.addrs.is_empty());
    }

    /// Scenario: allowed-fast download while choked, with a reject
    /// returning the block to the queue.
    #[tokio::test]
    async fn test_allowed_fast_download_while_choked() {
        let (mut torrent, _h) = make_torrent();
        let mut peer = add_peer(&mut torrent, Extensions::ours());

        torrent
            .handle_peer_message(peer.key, Message::HaveAll)
            .await
            .unwrap();
        // choked and no grants: nothing requested
        assert!(requests_of(&sent_messages(&mut peer.cmd_rx)).is_empty());

        torrent
            .handle_peer_message(
                peer.key,
                Message::AllowedFast { piece_index: 1 },
            )
            .await
            .unwrap();
        let requests = requests_of(&sent_messages(&mut peer.cmd_rx));
        assert_eq!(requests.len(), 2);
        assert!(requests.iter().all(|block| block.piece_index == 1));
        assert!(torrent.peers[&peer.key].peer_choking);

        // a reject puts the block back in the queue
        torrent
            .handle_peer_message(peer.key, Message::Reject(requests[0]))
            .await
            .unwrap();
        let downloader = &torrent.piece_downloaders[&peer.key];
        assert_eq!(
            downloader.outstanding_requests(),
            vec![requests[1]]
        );
        assert!(torrent.peers.contains_key(&peer.key));
    }

    /// A piece message before we have metadata is a protocol violation.
    #[tokio::test]
    async fn test_block_before_metadata_disconnects() {
        let (mut torrent, _h) = make_magnet_torrent();
        let peer = add_peer(&mut torrent, Extensions::default());

        torrent
            .handle_peer_message(
                peer.key,
                Message::Piece {
                    piece_index: 0,
                    offset: 0,
                    data: vec![0; BLOCK_LEN as usize],
                },
            )
            .await
            .unwrap();
        assert!(!torrent.peers.contains_key(&peer.key));
    }

    /// Availability queued before metadata replays to the same state as
    /// if it had arrived after.
    #[tokio::test]
    async fn test_pre_metadata_queue_and_replay() {
        let (mut torrent, _h) = make_magnet_torrent();
        let mut peer = add_peer(&mut torrent, Extensions::ours());

        torrent
            .handle_peer_message(peer.key, Message::HaveAll)
            .await
            .unwrap();
        assert_eq!(torrent.peers[&peer.key].queued_messages.len(), 1);
        // nothing sent yet: no metadata means no interest to compute
        assert!(sent_messages(&mut peer.cmd_rx).is_empty());

        let metainfo = make_metainfo();
        torrent.metadata_acquired(metainfo.info_bytes).unwrap();

        let picker = torrent.picker.as_ref().unwrap();
        for index in 0..PIECE_COUNT {
            assert!(picker.piece(index).having_peers.contains(&peer.key));
        }
        let bitfield = torrent.peers[&peer.key].bitfield.as_ref().unwrap();
        assert!(bitfield.all());
        assert!(torrent.peers[&peer.key].queued_messages.is_empty());
        assert!(sent_messages(&mut peer.cmd_rx)
            .contains(&Message::Interested));
    }

    /// Serving requests: exact piece end is served, one byte past
    /// disconnects, and chokes gate everything.
    #[tokio::test]
    async fn test_request_serving_boundaries() {
        let (mut torrent, _h) = make_torrent_with(&[0]);
        let content = make_content();
        let mut peer = add_peer(&mut torrent, Extensions::default());

        // the peer asks to be served
        torrent
            .handle_peer_message(peer.key, Message::Interested)
            .await
            .unwrap();
        assert!(sent_messages(&mut peer.cmd_rx).contains(&Message::Unchoke));

        // a request ending exactly at the piece end is served
        let block = BlockInfo {
            piece_index: 0,
            offset: PIECE_LEN - BLOCK_LEN,
            len: BLOCK_LEN,
        };
        torrent
            .handle_peer_message(peer.key, Message::Request(block))
            .await
            .unwrap();
        match peer.block_rx.try_recv().unwrap() {
            Message::Piece {
                piece_index,
                offset,
                data,
            } => {
                assert_eq!(piece_index, 0);
                assert_eq!(offset, block.offset);
                assert_eq!(
                    data,
                    piece_of(&content, 0)[block.offset as usize..]
                );
            }
            other => panic!("expected a block, got {:?}", other),
        }
        assert_eq!(
            torrent.transfer.uploaded.load(Ordering::Relaxed),
            BLOCK_LEN as u64
        );

        // one byte past the end disconnects
        let overlong = BlockInfo {
            piece_index: 0,
            offset: PIECE_LEN - BLOCK_LEN,
            len: BLOCK_LEN + 1,
        };
        torrent
            .handle_peer_message(peer.key, Message::Request(overlong))
            .await
            .unwrap();
        assert!(!torrent.peers.contains_key(&peer.key));
    }

    /// While we choke a peer, only fast-extension peers get a reject.
    #[tokio::test]
    async fn test_request_while_choked() {
        let (mut torrent, _h) = make_torrent_with(&[0]);

        let mut fast_peer = add_peer(&mut torrent, Extensions::ours());
        let block = BlockInfo {
            piece_index: 0,
            offset: 0,
            len: BLOCK_LEN,
        };
        torrent
            .handle_peer_message(fast_peer.key, Message::Request(block))
            .await
            .unwrap();
        assert_eq!(
            sent_messages(&mut fast_peer.cmd_rx),
            vec![Message::Reject(block)]
        );
        assert!(torrent.peers.contains_key(&fast_peer.key));

        let mut plain_peer = add_peer(&mut torrent, Extensions::default());
        torrent
            .handle_peer_message(plain_peer.key, Message::Request(block))
            .await
            .unwrap();
        assert!(sent_messages(&mut plain_peer.cmd_rx).is_empty());
        assert!(torrent.peers.contains_key(&plain_peer.key));
    }

    /// A duplicate block is logged and dropped without touching the
    /// buffer: the piece still verifies.
    #[tokio::test]
    async fn test_duplicate_block_keeps_first_data() {
        let (mut torrent, _h) = make_torrent();
        let content = make_content();
        let mut peer = add_peer(&mut torrent, Extensions::default());

        torrent
            .handle_peer_message(
                peer.key,
                Message::Bitfield(Bitfield::from_vec(vec![0b1100_0000])),
            )
            .await
            .unwrap();
        torrent
            .handle_peer_message(peer.key, Message::Unchoke)
            .await
            .unwrap();
        let requests = requests_of(&sent_messages(&mut peer.cmd_rx));
        let piece = piece_of(&content, requests[0].piece_index);

        // the first block arrives twice, the second time as garbage
        let good =
            piece[..requests[0].len as usize].to_vec();
        torrent
            .handle_peer_message(
                peer.key,
                Message::Piece {
                    piece_index: requests[0].piece_index,
                    offset: requests[0].offset,
                    data: good,
                },
            )
            .await
            .unwrap();
        torrent
            .handle_peer_message(
                peer.key,
                Message::Piece {
                    piece_index: requests[0].piece_index,
                    offset: requests[0].offset,
                    data: vec![0xee; requests[0].len as usize],
                },
            )
            .await
            .unwrap();
        assert!(torrent.peers.contains_key(&peer.key));

        // completing the piece with the real second block verifies, so
        // the garbage cannot have overwritten anything
        torrent
            .handle_peer_message(
                peer.key,
                Message::Piece {
                    piece_index: requests[1].piece_index,
                    offset: requests[1].offset,
                    data: piece[requests[1].offset as usize..].to_vec(),
                },
            )
            .await
            .unwrap();
        assert!(torrent.picker.as_ref().unwrap().own_bitfield()
            [requests[0].piece_index]);
    }

    /// A snubbed peer keeps its download but gets no new assignment, and
    /// a snub while choked is ignored.
    #[tokio::test]
    async fn test_snub_handling() {
        let (mut torrent, _h) = make_torrent();
        let mut peer = add_peer(&mut torrent, Extensions::default());

        torrent
            .handle_peer_message(
                peer.key,
                Message::Bitfield(Bitfield::from_vec(vec![0b1100_0000])),
            )
            .await
            .unwrap();
        torrent
            .handle_peer_message(peer.key, Message::Unchoke)
            .await
            .unwrap();
        assert!(!requests_of(&sent_messages(&mut peer.cmd_rx)).is_empty());

        torrent.handle_peer_snubbed(peer.key);
        assert!(torrent.peers[&peer.key].snubbed);
        assert!(torrent.snubbed_downloaders.contains(&peer.key));
        // the running download survives
        assert!(torrent.piece_downloaders.contains_key(&peer.key));

        // a block delivery forgives the snub
        let downloader = &torrent.piece_downloaders[&peer.key];
        let block = downloader.block(0);
        let content = make_content();
        let piece = piece_of(&content, block.piece_index);
        torrent
            .handle_peer_message(
                peer.key,
                Message::Piece {
                    piece_index: block.piece_index,
                    offset: block.offset,
                    data: piece[..block.len as usize].to_vec(),
                },
            )
            .await
            .unwrap();
        assert!(!torrent.peers[&peer.key].snubbed);
        assert!(!torrent.snubbed_downloaders.contains(&peer.key));
    }

    /// The snub timer firing while the peer chokes us is stale news.
    #[tokio::test]
    async fn test_snub_while_choked_is_ignored() {
        let (mut torrent, _h) = make_torrent();
        let peer = add_peer(&mut torrent, Extensions::default());
        torrent.handle_peer_snubbed(peer.key);
        assert!(!torrent.peers[&peer.key].snubbed);
    }

    /// The magnet flow: extension handshake, metadata download, store
    /// opening and availability replay.
    #[tokio::test]
    async fn test_metadata_download_flow() {
        let (mut torrent, _h) = make_magnet_torrent();
        let metainfo = make_metainfo();
        let mut peer = add_peer(&mut torrent, Extensions::ours());

        torrent
            .handle_peer_message(peer.key, Message::HaveAll)
            .await
            .unwrap();

        // the peer advertises metadata under its id 7
        let mut theirs = ExtendedHandshake::default();
        theirs.m.insert("ut_metadata".into(), 7);
        theirs.metadata_size = Some(metainfo.info_bytes.len() as u32);
        torrent
            .handle_peer_message(
                peer.key,
                Message::Extended {
                    id: EXTENSION_HANDSHAKE_ID,
                    payload: theirs.to_bytes(),
                },
            )
            .await
            .unwrap();
        assert!(torrent.info_downloaders.contains_key(&peer.key));

        // we asked for the single metadata slice, addressed to their id
        let msgs = sent_messages(&mut peer.cmd_rx);
        let request = msgs
            .iter()
            .find_map(|msg| match msg {
                Message::Extended { id: 7, payload } => {
                    Some(MetadataMessage::from_bytes(payload).unwrap())
                }
                _ => None,
            })
            .expect("a metadata request went out");
        assert_eq!(request, MetadataMessage::Request { piece: 0 });

        // serve it; the metadata hash matches, so the torrent arms itself
        torrent
            .handle_peer_message(
                peer.key,
                Message::Extended {
                    id: OUR_UT_METADATA_ID,
                    payload: MetadataMessage::Data {
                        piece: 0,
                        total_size: metainfo.info_bytes.len() as u32,
                        data: metainfo.info_bytes.clone(),
                    }
                    .to_bytes(),
                },
            )
            .await
            .unwrap();

        assert!(torrent.info.is_some());
        assert!(torrent.store.is_some());
        assert!(torrent.info_downloaders.is_empty());
        // the queued have-all replayed into availability and interest
        assert!(torrent
            .picker
            .as_ref()
            .unwrap()
            .piece(0)
            .having_peers
            .contains(&peer.key));
        assert!(sent_messages(&mut peer.cmd_rx)
            .contains(&Message::Interested));
        assert_eq!(
            torrent.transfer.left.load(Ordering::Relaxed),
            make_content().len() as u64
        );
    }

    /// Metadata whose hash does not match the torrent gets the serving
    /// peer banned.
    #[tokio::test]
    async fn test_metadata_hash_mismatch_bans() {
        let (mut torrent, _h) = make_magnet_torrent();
        let peer = add_peer(&mut torrent, Extensions::ours());
        let peer_ip = torrent.peers[&peer.key].ip();

        let mut theirs = ExtendedHandshake::default();
        theirs.m.insert("ut_metadata".into(), 7);
        theirs.metadata_size = Some(16);
        torrent
            .handle_peer_message(
                peer.key,
                Message::Extended {
                    id: EXTENSION_HANDSHAKE_ID,
                    payload: theirs.to_bytes(),
                },
            )
            .await
            .unwrap();

        torrent
            .handle_peer_message(
                peer.key,
                Message::Extended {
                    id: OUR_UT_METADATA_ID,
                    payload: MetadataMessage::Data {
                        piece: 0,
                        total_size: 16,
                        data: vec![0xab; 16],
                    }
                    .to_bytes(),
                },
            )
            .await
            .unwrap();

        assert!(!torrent.peers.contains_key(&peer.key));
        assert!(torrent.banned_peer_ips.contains(&peer_ip));
        assert!(torrent.info.is_none());
    }

    /// Serving metadata: a request is answered from the raw info bytes,
    /// an out-of-range slice and a metadata-less torrent with a reject.
    #[tokio::test]
    async fn test_metadata_request_serving() {
        let (mut torrent, _h) = make_torrent();
        let metainfo = make_metainfo();
        let mut peer = add_peer(&mut torrent, Extensions::ours());

        let mut theirs = ExtendedHandshake::default();
        theirs.m.insert("ut_metadata".into(), 7);
        torrent
            .handle_peer_message(
                peer.key,
                Message::Extended {
                    id: EXTENSION_HANDSHAKE_ID,
                    payload: theirs.to_bytes(),
                },
            )
            .await
            .unwrap();

        torrent
            .handle_peer_message(
                peer.key,
                Message::Extended {
                    id: OUR_UT_METADATA_ID,
                    payload: MetadataMessage::Request { piece: 0 }.to_bytes(),
                },
            )
            .await
            .unwrap();
        let reply = sent_messages(&mut peer.cmd_rx)
            .into_iter()
            .find_map(|msg| match msg {
                Message::Extended { id: 7, payload } => {
                    Some(MetadataMessage::from_bytes(&payload).unwrap())
                }
                _ => None,
            })
            .expect("a metadata reply went out");
        assert_eq!(
            reply,
            MetadataMessage::Data {
                piece: 0,
                total_size: metainfo.info_bytes.len() as u32,
                data: metainfo.info_bytes.clone(),
            }
        );

        // a slice past the end is refused
        torrent
            .handle_peer_message(
                peer.key,
                Message::Extended {
                    id: OUR_UT_METADATA_ID,
                    payload: MetadataMessage::Request { piece: 9 }.to_bytes(),
                },
            )
            .await
            .unwrap();
        let reply = sent_messages(&mut peer.cmd_rx)
            .into_iter()
            .find_map(|msg| match msg {
                Message::Extended { id: 7, payload } => {
                    Some(MetadataMessage::from_bytes(&payload).unwrap())
                }
                _ => None,
            })
            .unwrap();
        assert_eq!(reply, MetadataMessage::Reject { piece: 9 });
    }

    /// Before we hold metadata, requests for it are rejected, not
    /// ignored.
    #[tokio::test]
    async fn test_metadata_request_without_info_rejected() {
        let (mut torrent, _h) = make_magnet_torrent();
        let mut peer = add_peer(&mut torrent, Extensions::ours());

        let mut theirs = ExtendedHandshake::default();
        theirs.m.insert("ut_metadata".into(), 7);
        torrent
            .handle_peer_message(
                peer.key,
                Message::Extended {
                    id: EXTENSION_HANDSHAKE_ID,
                    payload: theirs.to_bytes(),
                },
            )
            .await
            .unwrap();

        torrent
            .handle_peer_message(
                peer.key,
                Message::Extended {
                    id: OUR_UT_METADATA_ID,
                    payload: MetadataMessage::Request { piece: 0 }.to_bytes(),
                },
            )
            .await
            .unwrap();
        let reply = sent_messages(&mut peer.cmd_rx)
            .into_iter()
            .find_map(|msg| match msg {
                Message::Extended { id: 7, payload } => {
                    Some(MetadataMessage::from_bytes(&payload).unwrap())
                }
                _ => None,
            })
            .unwrap();
        assert_eq!(reply, MetadataMessage::Reject { piece: 0 });
    }

    /// Metadata data arriving with no active download disconnects.
    #[tokio::test]
    async fn test_unexpected_metadata_data_disconnects() {
        let (mut torrent, _h) = make_torrent();
        let peer = add_peer(&mut torrent, Extensions::ours());

        torrent
            .handle_peer_message(
                peer.key,
                Message::Extended {
                    id: OUR_UT_METADATA_ID,
                    payload: MetadataMessage::Data {
                        piece: 0,
                        total_size: 16,
                        data: vec![0; 16],
                    }
                    .to_bytes(),
                },
            )
            .await
            .unwrap();
        assert!(!torrent.peers.contains_key(&peer.key));
    }

    /// Disconnecting a peer purges it from every set and map.
    #[tokio::test]
    async fn test_disconnect_purges_peer() {
        let (mut torrent, _h) = make_torrent();
        let mut peer = add_peer(&mut torrent, Extensions::default());
        let peer_addr = torrent.peers[&peer.key].addr;
        let peer_id = torrent.peers[&peer.key].id;

        torrent
            .handle_peer_message(
                peer.key,
                Message::Bitfield(Bitfield::from_vec(vec![0b1100_0000])),
            )
            .await
            .unwrap();
        torrent
            .handle_peer_message(peer.key, Message::Unchoke)
            .await
            .unwrap();
        assert!(!requests_of(&sent_messages(&mut peer.cmd_rx)).is_empty());
        assert!(torrent.piece_downloaders.contains_key(&peer.key));

        torrent.handle_peer_disconnected(peer.key);

        assert!(!torrent.peers.contains_key(&peer.key));
        assert!(!torrent.peer_ids.contains(&peer_id));
        assert!(!torrent.connected_peer_ips.contains(&peer_addr.ip()));
        assert!(!torrent.piece_downloaders.contains_key(&peer.key));
        for index in 0..PIECE_COUNT {
            let piece = torrent.picker.as_ref().unwrap().piece(index);
            assert!(!piece.having_peers.contains(&peer.key));
            assert!(piece.downloading.is_empty());
        }
        // a second report of the same disconnect is a no-op
        torrent.handle_peer_disconnected(peer.key);
    }
}
