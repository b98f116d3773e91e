use std::{
    collections::{HashMap, HashSet, VecDeque},
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Instant,
};
use tokio::{sync::mpsc, net::TcpStream, time};
use tokio_util::codec::Framed;
use futures::{SinkExt, StreamExt, stream::SplitSink};
use crate::{
    bandwidth::{BandwidthConsumer, BandwidthRequest, GLOBAL_UPLOAD_CHANNEL},
    block::{Block, BlockRequest},
    disk::DiskCommand,
    torrent::{CommandToTorrent, TorrentContext},
    Bitfield,
};
use super::{*, message::*, handshake::*, state::*};

type MessageSink = SplitSink<Framed<TcpStream, MessageCodec>, Message>;

/// Every upload request competes equally; per-peer weighting would need a
/// reciprocation signal this crate doesn't track yet.
const UPLOAD_REQUEST_PRIORITY: u8 = 1;

/// Forwards bandwidth grants back into this peer's own command loop, since
/// `PeerSession` isn't itself `Arc`-owned the way `BandwidthConsumer` needs.
struct BandwidthRelay {
    tx: PeerTx,
    disconnecting: Arc<AtomicBool>,
}

impl BandwidthConsumer for BandwidthRelay {
    fn assign_bandwidth(&self, channel: usize, amount: u32) {
        self.tx.send(PeerCommand::BandwidthGranted { channel, amount }).ok();
    }

    fn is_disconnecting(&self) -> bool {
        self.disconnecting.load(Ordering::Relaxed)
    }
}

pub struct PeerSession {

    // The peer's IP address.
    address: SocketAddr,

    // Context is a read only state accessible by all peers.
    torrent_ctx: Arc<TorrentContext>,

    // Commands to the peer.
    peer_rx: PeerRx,

    // Internal send channel for disk reads.
    peer_tx: PeerTx,

    // Peer-id negotiated via the handshake.
    peer_id: Option<[u8; 20]>,

    // Pending block requests from peer to the client.
    requests_in: HashSet<BlockRequest>,

    // Pending block requests from client to peer, with the time each was sent
    // so `tick` can detect a snub (spec.md §4.F request_timeout).
    requests_out: HashMap<BlockRequest, Instant>,

    // Pieces the peer marked ALLOWED_FAST: requestable even while choked.
    allowed_fast: HashSet<usize>,

    // Set while `state.on_parole` is true: the single piece we're restricted to.
    parole_piece: Option<usize>,

    // Bitfield of pieces the peer currently has.
    bitfield: Bitfield,

    state: SessionState,

    // Blocks read off disk, waiting on an upload bandwidth grant.
    pending_sends: VecDeque<Block>,

    // Granted bytes not yet spent sending a block.
    upload_budget: u32,

    // Bytes still owed by an outstanding bandwidth request; zero means none
    // is in flight and a new one can be submitted.
    requested_outstanding: u32,

    // Relays grants from the shared bandwidth manager back into peer_rx.
    bandwidth_relay: Arc<dyn BandwidthConsumer + Send + Sync>,

    // Flipped just before the session ends so a late grant isn't wasted on a
    // dead consumer (checked by the manager via `BandwidthConsumer::is_disconnecting`).
    disconnecting: Arc<AtomicBool>,

}

impl PeerSession {

    pub fn new(address: SocketAddr, torrent_ctx: Arc<TorrentContext>) -> (PeerSession, PeerTx) {

        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let bitfield = Bitfield::repeat(false, torrent_ctx.info.num_pieces as usize);
        let disconnecting = Arc::new(AtomicBool::new(false));
        let bandwidth_relay: Arc<dyn BandwidthConsumer + Send + Sync> =
            Arc::new(BandwidthRelay { tx: peer_tx.clone(), disconnecting: disconnecting.clone() });

        (
            PeerSession {
                address,
                torrent_ctx,
                peer_rx,
                peer_tx: peer_tx.clone(),
                peer_id: None,
                bitfield,
                state: SessionState::default(),
                requests_in: HashSet::new(),
                requests_out: HashMap::new(),
                allowed_fast: HashSet::new(),
                parole_piece: None,
                pending_sends: VecDeque::new(),
                upload_budget: 0,
                requested_outstanding: 0,
                bandwidth_relay,
                disconnecting,
            },
            peer_tx,
        )
    }

    #[tracing::instrument(name = "peer", skip(self, inbound_stream), fields(address = %self.address))]
    pub async fn start_session(&mut self, inbound_stream: Option<TcpStream>) -> Result<()> {

        self.state.update(|state| state.conn_state = ConnState::Connecting);
        let inbound = inbound_stream.is_some();
        let handshake_timeout = self.torrent_ctx.peer_config.handshake_timeout;
        let mut socket = if let Some(stream) = inbound_stream {
            Framed::new(stream, HandshakeCodec)
        } else {
            let stream = time::timeout(handshake_timeout, TcpStream::connect(self.address))
                .await
                .map_err(|_| PeerError::HandshakeTimeout)??;
            tracing::trace!("outbound connection successful");
            Framed::new(stream, HandshakeCodec)
        };

        self.exchange_handshake(&mut socket, inbound).await?;

        let fast_extension_enabled = self.state.fast_extension;
        let socket = Framed::new(socket.into_inner(), MessageCodec { fast_extension_enabled });
        self.run(socket).await
    }

    pub async fn disconnect(&mut self) {
        self.disconnecting.store(true, Ordering::Relaxed);
        self.state.update(|state| *state = SessionState::default());
        self.torrent_ctx.picker.piece_picker.write().await.forget_bitfield(&self.bitfield);
        self.torrent_ctx.torrent_tx.send(CommandToTorrent::PeerDisconnected {
            address: self.address,
        }).ok();
    }

    async fn exchange_handshake(&mut self, socket: &mut Framed<TcpStream, HandshakeCodec>, inbound: bool) -> Result<()> {

        self.state.update(|state| state.conn_state = ConnState::Handshaking);
        let handshake = Handshake::new(self.torrent_ctx.info_hash, self.torrent_ctx.client_id);
        let timeout = self.torrent_ctx.peer_config.handshake_timeout;

        if !inbound {
            tracing::info!("send handshake");
            socket.send(handshake).await?;
        }

        tracing::trace!("waiting for handshake");
        let handshake = match time::timeout(timeout, socket.next()).await {
            Ok(Some(Ok(handshake))) => handshake,
            Ok(Some(Err(e))) => return Err(e),
            Ok(None) => return Err(PeerError::NoHandshake),
            Err(_) => return Err(PeerError::HandshakeTimeout),
        };

        tracing::info!("read: handshake");

        if handshake.protocol != PROTOCOL {
            return Err(PeerError::IncorrectProtocol);
        }
        if handshake.info_hash != self.torrent_ctx.info_hash {
            return Err(PeerError::IncorrectInfoHash);
        }
        if handshake.peer_id == self.torrent_ctx.client_id {
            return Err(PeerError::SelfConnection);
        }

        if inbound {
            tracing::info!("send handshake");
            socket.send(Handshake::new(self.torrent_ctx.info_hash, self.torrent_ctx.client_id)).await?;
        }

        self.peer_id = Some(handshake.peer_id);
        self.state.fast_extension = handshake.supports_fast_extension();
        self.torrent_ctx.torrent_tx.send(CommandToTorrent::PeerConnected {
            address: self.address,
            id: handshake.peer_id,
        })?;

        tracing::info!("handshake successful, peer connected");
        Ok(())
    }

    async fn run(&mut self, socket: Framed<TcpStream, MessageCodec>) -> Result<()> {

        self.state.connect_time = Some(Instant::now());
        self.state.last_active = Some(Instant::now());
        self.state.update(|state| state.conn_state = ConnState::Introducing);
        let (mut sink, mut stream) = socket.split();
        self.send_own_bitfield(&mut sink).await?;
        let mut ticker = time::interval(time::Duration::from_secs(1));

        loop { tokio::select! {

            // Message from peer.
            Some(Ok(msg)) = stream.next() => self.handle_msg(&mut sink, msg).await?,

            // Command from elsewhere in application.
            Some(cmd) = self.peer_rx.recv() => {
                match cmd {

                    // From disk.
                    PeerCommand::BlockRead(block) => {
                        self.pending_sends.push_back(block);
                        self.request_upload_bandwidth().await;
                        self.flush_sends(&mut sink).await?;
                    }

                    PeerCommand::BandwidthGranted { amount, .. } => {
                        self.upload_budget += amount;
                        self.requested_outstanding = self.requested_outstanding.saturating_sub(amount);
                        self.flush_sends(&mut sink).await?;
                        self.request_upload_bandwidth().await;
                    }

                    PeerCommand::PieceWritten(idx) => self.handle_written_piece(&mut sink, idx).await?,

                    PeerCommand::Parole(idx) => {
                        self.state.update(|state| state.on_parole = true);
                        self.parole_piece = Some(idx);
                    }

                    // From torrent's choker.
                    PeerCommand::Choke => {
                        if !self.state.choked {
                            self.state.update(|state| state.choked = true);
                            self.send_message(&mut sink, Message::Choke).await?;
                        }
                    }
                    PeerCommand::Unchoke => {
                        if self.state.choked {
                            self.state.update(|state| state.choked = false);
                            self.send_message(&mut sink, Message::Unchoke).await?;
                        }
                    }

                    PeerCommand::RevealPiece(idx) => {
                        self.send_message(&mut sink, Message::Have { idx: idx as u32 }).await?;
                    }

                    // From torrent.
                    PeerCommand::Shutdown => {
                        tracing::info!("session shutdown");
                        self.disconnecting.store(true, Ordering::Relaxed);
                        break;
                    },

                }
            }

            t = ticker.tick() => self.tick(t.into_std()).await?,

        }}

        Ok(())
    }

    /// Announces our own pieces right after the handshake. Super-seeding
    /// (spec.md §4.H) withholds this entirely; the torrent coordinator
    /// reveals pieces one at a time via `PeerCommand::RevealPiece` instead.
    async fn send_own_bitfield(&mut self, sink: &mut MessageSink) -> Result<()> {
        if self.torrent_ctx.super_seed_mode != crate::config::SuperSeedMode::Off {
            return Ok(());
        }

        let own = self.torrent_ctx.picker.piece_picker.read().await.own_bitfield().clone();
        if self.state.fast_extension {
            if own.all() {
                return self.send_message(sink, Message::HaveAll).await;
            }
            if own.not_any() {
                return self.send_message(sink, Message::HaveNone).await;
            }
        }
        self.send_message(sink, Message::Bitfield(own)).await
    }

    // TODO: send multiple messages in one go, rather than flushing after each one?, particularly for requests.
    // Logs a message and sends to peer.
    #[inline(always)]
    async fn send_message(&mut self, sink: &mut MessageSink, msg: Message) -> Result<()> {
        tracing::info!("send: {}", msg);
        sink.send(msg).await
    }

    async fn handle_msg(&mut self, sink: &mut MessageSink, msg: Message) -> Result<()> {
        tracing::info!("read: {}", msg);
        self.state.last_active = Some(Instant::now());

        match msg {

            // Bitfield can only be sent directly after handshake.
            Message::Bitfield(bitfiled) => {
                if self.state.conn_state == ConnState::Introducing {
                    self.handle_bitfield(sink, bitfiled).await?;
                } else {
                    tracing::error!("unexpected bitfield");
                    return Err(PeerError::UnexpectedBitfield);
                }
            },

            Message::KeepAlive => {},

            Message::Choke => {
                if !self.state.peer_choking {
                    self.state.peer_choking = true;
                    // Free pending requests for other peers.
                    self.free_requests_out().await;
                }
            },

            Message::Unchoke => {
                if self.state.peer_choking {
                    self.state.peer_choking = false;
                    // Start to make requests if interested.
                    if self.state.interested {
                        self.make_requests(sink).await?;
                    }
                }
            },

            Message::Interested => {
                // TODO: Only send unchoke reciprocally.
                // TODO: limit upload slots.
                if !self.state.peer_interested {
                    self.state.peer_interested = true;
                    self.send_message(sink, Message::Unchoke).await?;
                    self.state.choked = false;
                }
            },

            Message::NotInterested => self.state.peer_interested = false,

            Message::Block(block) => {
                self.handle_block(block).await?;
                self.make_requests(sink).await?;
            },

            Message::Request(request) => self.handle_request(sink, request).await?,

            Message::Have { idx } => self.handle_have(sink, idx).await?,

            Message::Port { port: _ } => {},

            Message::Cancel(block_info) => self.handle_cancel(block_info).await?,

            Message::SuggestPiece { idx } => {
                if self.state.fast_extension {
                    self.torrent_ctx.picker.piece_picker.write().await.suggest(idx as usize);
                }
            },

            Message::HaveAll => {
                if self.state.conn_state == ConnState::Introducing {
                    self.handle_have_all(sink).await?;
                } else {
                    tracing::error!("unexpected have-all");
                    return Err(PeerError::UnexpectedBitfield);
                }
            },

            Message::HaveNone => {
                if self.state.conn_state == ConnState::Introducing {
                    tracing::info!("peer has no pieces");
                } else {
                    tracing::error!("unexpected have-none");
                    return Err(PeerError::UnexpectedBitfield);
                }
            },

            Message::Reject(request) => self.handle_reject(request).await,

            Message::AllowedFast { idx } => {
                if self.state.fast_extension {
                    self.allowed_fast.insert(idx as usize);
                }
            },

            Message::Extended { id, payload } => {
                tracing::trace!("extended message id {} ({} bytes), ignoring", id, payload.len());
            },

        }

        // After bitfiled
        if self.state.conn_state == ConnState::Introducing {

            // Check if either us or peer has any pieces.
            if self.torrent_ctx.picker.piece_picker.read().await.own_bitfield().not_any()
            && self.bitfield.not_any()
            {
                tracing::warn!("no pieces in connection");
                self.peer_tx.send(PeerCommand::Shutdown)?;
                return Ok(())
            }

            self.state.update(|state| state.conn_state = ConnState::Connected);
        }

        Ok(())
    }

    async fn handle_bitfield(&mut self, sink: &mut MessageSink, mut bitfield: Bitfield) -> Result<()> {
        tracing::info!("peer has {}/{} pieces", bitfield.count_ones(), self.torrent_ctx.info.num_pieces);
        // Remove trailing bits.
        bitfield.resize(self.torrent_ctx.info.num_pieces as usize, false);
        // Interested if peer has pieces we don't.
        let interested = self.torrent_ctx.picker.piece_picker.write().await.bitfield_update(&bitfield);
        self.state.update(|state| state.num_pieces = bitfield.count_ones());
        self.bitfield = bitfield;
        self.update_interest(sink, interested).await
    }

    async fn handle_have_all(&mut self, sink: &mut MessageSink) -> Result<()> {
        tracing::info!("peer has all pieces");
        let bitfield = Bitfield::repeat(true, self.torrent_ctx.info.num_pieces as usize);
        let interested = self.torrent_ctx.picker.piece_picker.write().await.bitfield_update(&bitfield);
        self.state.update(|state| state.num_pieces = bitfield.count_ones());
        self.bitfield = bitfield;
        self.update_interest(sink, interested).await
    }

    async fn handle_have(&mut self, sink: &mut MessageSink, idx: u32) -> Result<()> {
        // If idx is not valid, disconnect.
        if idx >= self.torrent_ctx.info.num_pieces {
            tracing::error!("have msg with invalid idx: {}", idx);
            return Err(PeerError::InvalidHave);
        }
        // Peer already has piece.
        if self.bitfield[idx as usize] {
            return Ok(());
        }
        self.bitfield.set(idx as usize, true);
        self.state.update(|state| state.num_pieces += 1);

        let interested = self
            .torrent_ctx
            .picker
            .piece_picker
            .write()
            .await
            .increment_piece(idx as usize);

        self.update_interest(sink, interested).await
    }

    async fn handle_block(&mut self, block: Block) -> Result<()> {

        let request = BlockRequest::from_block(&block);
        if self.requests_out.remove(&request).is_none() {
            // TODO: penalise peer.
            // TODO: add defence against random block spamming.
            tracing::warn!("unexpected block: {:?}", &request);
            return Ok(());
        }
        self.state.snubbed = false;

        let is_duplicate = if let Some(partial_piece) = self
            .torrent_ctx
            .picker
            .partial_pieces
            .read()
            .await
            .get(&request.piece_idx)
        {
            partial_piece.write().await.received_block(&request)
        } else {
            // This should'nt be possible.
            // Maybe it would in end game mode, if piece completed and already written.
            // Block is being checked for in requests_out, so it should be in partial_pieces.
            tracing::warn!("received block for non-existent piece: {:?}", &request);
            return Ok(());
        };

        if !is_duplicate {
            self.state.update(|state| state.throughput.down += block.data.len() as u64);
            self.torrent_ctx.disk_tx
                .send(DiskCommand::WriteBlock {
                    id: self.torrent_ctx.info_hash,
                    block,
                })?;
            self.torrent_ctx.torrent_tx.send(CommandToTorrent::BlockContributed {
                address: self.address,
                piece_idx: request.piece_idx,
            })?;
            Ok(())
        } else {
            // Again, do we need to check for spamming?
            // Should allow when in end game mode.
            tracing::warn!("duplicate block: {:?}", &request);
            Ok(())
        }
    }

    async fn handle_request(&mut self, sink: &mut MessageSink, request: BlockRequest) -> Result<()> {

        if self.state.choked {
            if self.state.fast_extension {
                return self.send_message(sink, Message::Reject(request)).await;
            }
            tracing::error!("sending requests whilst choked");
            return Err(PeerError::RequestWhileChoking);
        }
        if !request.is_valid(&self.torrent_ctx.info) {
            tracing::error!("invalid request: {:?}", request);
            if self.state.fast_extension {
                return self.send_message(sink, Message::Reject(request)).await;
            }
            return Err(PeerError::InvalidRequest);
        }
        if self.requests_in.contains(&request) {
            tracing::warn!("duplicate request: {:?}", request);
            return Ok(());
        }
        if self.requests_in.len() >= self.torrent_ctx.peer_config.max_incoming_request_queue {
            tracing::warn!("incoming request queue exceeded, rejecting: {:?}", request);
            if self.state.fast_extension {
                return self.send_message(sink, Message::Reject(request)).await;
            }
            return Ok(());
        }

        self.requests_in.insert(request);
        self.torrent_ctx.disk_tx.send(DiskCommand::ReadBlock {
            id: self.torrent_ctx.info_hash,
            block: request,
            tx: self.peer_tx.clone(),
        })?;

        Ok(())
    }

    async fn handle_cancel(&mut self, block_info: BlockRequest) -> Result<()> {
        if !block_info.is_valid(&self.torrent_ctx.info) {
            tracing::warn!("invalid cancel: {:?}", block_info);
            return Err(PeerError::InvalidRequest);
        }
        self.requests_in.remove(&block_info);
        Ok(())
    }

    /// Peer refused a request of ours (fast extension REJECT); free the block
    /// so another peer can pick it up.
    async fn handle_reject(&mut self, request: BlockRequest) {
        if self.requests_out.remove(&request).is_some() {
            if let Some(partial_piece) = self.torrent_ctx.picker.partial_pieces.read().await.get(&request.piece_idx) {
                partial_piece.write().await.free_block(&request);
            }
        }
    }

    // When a piece is written to disk:
    // - Send a have message if the peer doesn't have it.
    // - Cancel any requests for the piece.
    async fn handle_written_piece(&mut self, sink: &mut MessageSink, idx: usize) -> Result<()> {

        if self.parole_piece == Some(idx) {
            self.state.update(|state| state.on_parole = false);
            self.parole_piece = None;
        }

        if !self.bitfield[idx] {
            sink.send(Message::Have { idx: idx as u32 }).await?;
        } else {
            let stale: Vec<BlockRequest> =
                self.requests_out.keys().copied().filter(|r| r.piece_idx == idx).collect();
            for block in stale {
                sink.send(Message::Cancel(block)).await?;
                self.requests_out.remove(&block);
            }
        }

        Ok(())
    }

    // Queue requests up to a certain target queue length.
    async fn make_requests(&mut self, sink: &mut MessageSink) -> Result<()> {

        if !self.state.interested {
            tracing::warn!("attempted to make requests whilst not interested");
            return Ok(())
        }

        let target = if self.state.snubbed { 1 } else { self.torrent_ctx.peer_config.max_request_queue };
        let current: HashSet<BlockRequest> = self.requests_out.keys().copied().collect();

        let requests = if self.state.peer_choking {
            if self.state.fast_extension && !self.allowed_fast.is_empty() {
                self.torrent_ctx.picker.pick_allowed_fast_blocks(&self.allowed_fast, &current, target, &self.bitfield).await
            } else {
                tracing::warn!("attempted to make requests whilst choked by peer");
                return Ok(());
            }
        } else {
            let parole = if self.state.on_parole { self.parole_piece } else { None };
            self.torrent_ctx.picker.pick_blocks(&current, target, &self.bitfield, parole).await
        };

        for block in requests {
            tracing::info!("send request: {:?}", block);
            self.requests_out.insert(block, Instant::now());
            sink.send(Message::Request(block)).await?;
        }

        Ok(())
    }

    // Submits a request against the shared upload channel for whatever
    // `pending_sends` bytes the last grant didn't cover, unless one is
    // already outstanding (spec.md §4.C).
    async fn request_upload_bandwidth(&mut self) {
        if self.requested_outstanding > 0 {
            return;
        }
        let pending_bytes: u32 = self.pending_sends.iter().map(|b| b.data.len() as u32).sum();
        let needed = pending_bytes.saturating_sub(self.upload_budget);
        if needed == 0 {
            return;
        }
        self.requested_outstanding = needed;
        self.torrent_ctx.bandwidth.lock().await.submit(BandwidthRequest {
            consumer: Arc::downgrade(&self.bandwidth_relay),
            channels: vec![GLOBAL_UPLOAD_CHANNEL],
            requested: needed,
            priority: UPLOAD_REQUEST_PRIORITY,
        });
    }

    // Sends as many queued blocks as the current budget covers, in order.
    async fn flush_sends(&mut self, sink: &mut MessageSink) -> Result<()> {
        while let Some(front) = self.pending_sends.front() {
            let len = front.data.len() as u32;
            if self.upload_budget < len {
                break;
            }
            let block = self.pending_sends.pop_front().expect("front just checked");
            self.upload_budget -= len;
            self.send_block(sink, block).await?;
        }
        Ok(())
    }

    // Remove the request and send peer block.
    async fn send_block(&mut self, sink: &mut MessageSink, block: Block) -> Result<()> {
        let request: BlockRequest = BlockRequest::from_block(&block);
        if !self.requests_in.remove(&request) {
            // TODO: think about under what circumstances this would occur.
            tracing::warn!("block read but no request: {:?}", request);
            return Ok(());
        }
        sink.send(Message::Block(block)).await?;
        self.state.update(|state| state.throughput.up += request.len as u64);
        Ok(())
    }

    // Free all requested blocks, making them available for other peers. Blocks
    // on ALLOWED_FAST pieces survive a choke (spec.md §4.F).
    async fn free_requests_out(&mut self) {
        tracing::info!("freeing requested blocks");
        let partial_pieces = self.torrent_ctx.picker.partial_pieces.read().await;
        let keep_allowed = self.state.fast_extension;
        let to_free: Vec<BlockRequest> = self
            .requests_out
            .keys()
            .copied()
            .filter(|r| !(keep_allowed && self.allowed_fast.contains(&r.piece_idx)))
            .collect();

        for request in to_free {
            self.requests_out.remove(&request);
            if let Some(partial_piece) = partial_pieces.get(&request.piece_idx) {
                partial_piece.write().await.free_block(&request);
                tracing::trace!("freed block request: {:?}", request);
            }
        }
    }

    // If we have BECOME interested, send a message to indicate this.
    async fn update_interest(&mut self, sink: &mut MessageSink, interested: bool) -> Result<()> {
        if !self.state.interested && interested {
            self.state.interested = true;
            self.send_message(sink, Message::Interested).await?;
        } else if self.state.interested && !interested {
            self.state.interested = false;
        }
        Ok(())
    }

    async fn tick(&mut self, now: Instant) -> Result<()> {

        let cfg = self.torrent_ctx.peer_config;

        // A request that's gone unanswered too long snubs the peer: clamp its
        // queue depth to 1 until it proves responsive again.
        let timed_out: Vec<BlockRequest> = self
            .requests_out
            .iter()
            .filter(|(_, &sent_at)| now.saturating_duration_since(sent_at) >= cfg.request_timeout)
            .map(|(&r, _)| r)
            .collect();

        if !timed_out.is_empty() {
            tracing::warn!("{} request(s) timed out, snubbing peer", timed_out.len());
            self.state.update(|state| state.snubbed = true);
            let partial_pieces = self.torrent_ctx.picker.partial_pieces.read().await;
            for request in timed_out {
                self.requests_out.remove(&request);
                if let Some(partial_piece) = partial_pieces.get(&request.piece_idx) {
                    partial_piece.write().await.free_block(&request);
                }
            }
        }

        if !self.state.interested
        && !self.state.peer_interested
        && now.saturating_duration_since(self.state.connect_time.unwrap()) >= cfg.inactivity_timeout
        {
            tracing::warn!("disconnecting idle peer");
            return Err(PeerError::InactivityTimeout)
        }

        if let Some(last_active) = self.state.last_active {
            if now.saturating_duration_since(last_active) >= cfg.peer_timeout {
                tracing::warn!("disconnecting unresponsive peer");
                return Err(PeerError::InactivityTimeout)
            }
        }

        // Send stats if there is a state change.
        if self.state.changed {
            self.torrent_ctx.torrent_tx.send(CommandToTorrent::PeerState {
                address: self.address,
                state: self.state,
            })?;
        }
        self.state.tick();

        Ok(())
    }
}
