use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
    sync::Arc,
    time::Instant,
};

use rand::Rng;
use tokio::sync::{mpsc, Mutex};

use crate::{
    alert::{Alert, AlertSink, NullSink},
    bandwidth::BandwidthManager,
    collaborators::{AnnounceEvent, AnnounceStats, Tracker},
    config::{ChokingAlgorithm, PeerConfig, SessionConfig, SuperSeedMode, TorrentConfig},
    connect::HalfOpenQueue,
    disk::{self, DiskCommand, DiskTx},
    peer::{state::SessionState, PeerCommand, PeerError, PeerHandle},
    picker::Picker,
    stats::{PeerStats, PieceStats, ThroughputStats, TorrentStats},
    store::StoreInfo,
    TorrentId,
};

#[derive(Debug, thiserror::Error)]
pub enum TorrentError {
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("disk error: {0}")]
    DiskError(#[from] disk::DiskError),

    #[error("allocation error: {0}")]
    AllocationError(#[from] disk::AllocationError),

    #[error("channel error: {0}")]
    Channel(String),
}

impl<T> From<mpsc::error::SendError<T>> for TorrentError {
    fn from(e: mpsc::error::SendError<T>) -> Self {
        TorrentError::Channel(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, TorrentError>;
pub type TorrentTx = mpsc::UnboundedSender<CommandToTorrent>;
pub type TorrentRx = mpsc::UnboundedReceiver<CommandToTorrent>;

/// Lifecycle of a torrent, mirrored into `TorrentStats::state` for clients to
/// render (spec.md §5 observability). Closely follows the mainline
/// checking/downloading/seeding progression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TorrentState {
    QueuedForChecking,
    CheckingFiles,
    DownloadingMetadata,
    Downloading,
    Finished,
    Seeding,
    Allocating,
    Error(String),
}

impl Default for TorrentState {
    fn default() -> Self {
        TorrentState::QueuedForChecking
    }
}

/// Commands that can be sent to a torrent from other tasks.
pub enum CommandToTorrent {
    /// Sent by a peer task once its handshake succeeds.
    PeerConnected { address: SocketAddr, id: [u8; 20] },

    /// Sent by a peer task whenever its session state changes.
    PeerState { address: SocketAddr, state: SessionState },

    /// Sent by a peer task right before its session task exits, so the
    /// coordinator can drop its handle instead of accumulating dead entries.
    PeerDisconnected { address: SocketAddr },

    /// Sent by a peer task when it hands a freshly-received block to disk;
    /// tracked so a later hash failure can be blamed on its contributors.
    BlockContributed { address: SocketAddr, piece_idx: usize },

    /// Sent by the disk task once a piece finishes writing.
    PieceWritten { idx: usize, valid: bool },

    /// Sent by itself to shut down.
    Shutdown,
}

/// Read-only state shared by every peer session of one torrent. Holds
/// trait-object fields (`alert_sink`, `bandwidth`'s consumers) that can't
/// derive `Debug`.
pub struct TorrentContext {
    pub info_hash: TorrentId,
    pub client_id: [u8; 20],
    pub picker: Picker,
    pub torrent_tx: TorrentTx,
    pub disk_tx: DiskTx,
    pub info: StoreInfo,
    pub peer_config: PeerConfig,
    pub super_seed_mode: SuperSeedMode,
    pub alert_sink: Arc<dyn AlertSink>,

    /// Shared outbound connection admission limiter (spec.md §4.D), owned by
    /// the session coordinator.
    pub half_open: Arc<HalfOpenQueue>,

    /// Shared bandwidth budget (spec.md §4.C), owned by the session
    /// coordinator. Peer sessions submit requests against it directly.
    pub bandwidth: Arc<Mutex<BandwidthManager>>,
}

pub struct Torrent {
    ctx: Arc<TorrentContext>,

    config: TorrentConfig,

    /// Peers we have active sessions with.
    peers: HashMap<SocketAddr, PeerHandle>,

    /// Tracker collaborators, in announce order.
    trackers: Vec<Arc<dyn Tracker>>,

    /// Peers we know about but don't have a session with.
    available: Vec<SocketAddr>,

    torrent_rx: TorrentRx,
    torrent_tx: TorrentTx,

    start_time: Option<Instant>,
    listen_address: SocketAddr,

    disk_handle: Option<tokio::task::JoinHandle<disk::Result<()>>>,

    state: TorrentState,

    /// Peers that contributed a block to a piece still in flight, indexed by
    /// piece index; consulted on hash failure to decide who goes on parole.
    contributors: HashMap<usize, HashSet<SocketAddr>>,

    optimistic_unchoke_multiplier: u32,
    choke_tick: u32,

    /// Super-seeding's single reveal cursor (spec.md §4.H); see DESIGN.md for
    /// the simplification this makes versus per-peer staggered revelation.
    super_seed_cursor: usize,

    uploaded: u64,
    downloaded: u64,
}

impl Torrent {
    pub async fn new(
        info_hash: TorrentId,
        info: StoreInfo,
        piece_hashes: Vec<[u8; 20]>,
        config: TorrentConfig,
        peer_config: PeerConfig,
        session_config: &SessionConfig,
        trackers: Vec<Arc<dyn Tracker>>,
        alert_sink: Option<Arc<dyn AlertSink>>,
        half_open: Arc<HalfOpenQueue>,
        bandwidth: Arc<Mutex<BandwidthManager>>,
    ) -> Result<Self> {
        let (torrent_tx, torrent_rx) = mpsc::unbounded_channel();
        let (disk_handle, disk_tx) = disk::spawn_disk(64, session_config.disk_cache_blocks);

        let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
        disk_tx.send(DiskCommand::NewTorrent {
            id: info_hash,
            info: info.clone(),
            piece_hashes,
            torrent_tx: torrent_tx.clone(),
            reply: reply_tx,
        })?;
        let own_bitfield = reply_rx.await.map_err(|e| TorrentError::Channel(e.to_string()))?.map_err(TorrentError::from)?;

        let picker = Picker::with_config(
            info.num_pieces,
            info.piece_len,
            info.last_piece_len,
            config.sequential,
            config.end_game_threshold,
        );
        picker.piece_picker.write().await.set_own_bitfield(own_bitfield);

        let ctx = Arc::new(TorrentContext {
            info_hash,
            client_id: session_config.client_id,
            picker,
            torrent_tx: torrent_tx.clone(),
            disk_tx,
            info,
            peer_config,
            super_seed_mode: config.super_seed_mode,
            alert_sink: alert_sink.unwrap_or_else(|| Arc::new(NullSink)),
            half_open,
            bandwidth,
        });

        Ok(Torrent {
            ctx,
            config,
            trackers,
            peers: HashMap::new(),
            available: Vec::new(),
            torrent_rx,
            torrent_tx,
            start_time: None,
            listen_address: session_config.listen_address,
            disk_handle: Some(disk_handle),
            state: TorrentState::QueuedForChecking,
            contributors: HashMap::new(),
            optimistic_unchoke_multiplier: session_config.optimistic_unchoke_multiplier,
            choke_tick: 0,
            super_seed_cursor: 0,
            uploaded: 0,
            downloaded: 0,
        })
    }

    /// Channel other tasks (e.g. the session coordinator) use to send this
    /// torrent commands, such as `Shutdown`.
    pub fn command_tx(&self) -> TorrentTx {
        self.torrent_tx.clone()
    }

    pub async fn start(&mut self) -> Result<()> {
        tracing::info!("starting torrent");
        self.start_time = Some(Instant::now());
        self.state = if self.ctx.picker.piece_picker.read().await.all() {
            TorrentState::Seeding
        } else {
            TorrentState::Downloading
        };
        self.announce(Some(AnnounceEvent::Started)).await;
        self.run().await?;
        Ok(())
    }

    /// Consults every tracker collaborator for fresh peers (spec.md §5
    /// Announce coordination). Tracker errors are logged, not propagated: one
    /// bad tracker shouldn't take the torrent down.
    #[tracing::instrument(skip(self), fields(num_peers = self.peers.len() + self.available.len()))]
    async fn announce(&mut self, event: Option<AnnounceEvent>) {
        let num_peers = self.peers.len() + self.available.len();
        let want = (self.config.min_max_peers.1 as usize).saturating_sub(num_peers);
        if want == 0 && event.is_none() {
            return;
        }

        let stats = AnnounceStats {
            uploaded: self.uploaded,
            downloaded: self.downloaded,
            left: self.ctx.info.total_len.saturating_sub(self.downloaded),
        };

        for tracker in &self.trackers {
            match tracker.announce(self.ctx.info_hash, self.listen_address.port(), event, stats).await {
                Ok(resp) => self.available.extend(resp.peers),
                Err(e) => tracing::warn!("tracker announce error: {}", e),
            }
        }

        tracing::trace!("new number of peers: {}", self.peers.len() + self.available.len());
    }

    /// Dials known addresses up to the configured peer cap, gating each
    /// attempt through the shared half-open queue (spec.md §4.D). An address
    /// refused a slot stays in `available` for the next call instead of being
    /// dropped.
    fn connect_to_peers(&mut self) {
        let want = (self.config.min_max_peers.1 as usize).saturating_sub(self.peers.len());
        if want == 0 || self.available.is_empty() {
            return;
        }

        let timeout = self.ctx.peer_config.handshake_timeout;
        let now = Instant::now();
        let mut connected = 0;

        let candidates: Vec<SocketAddr> = self.available.drain(..).collect();
        for address in candidates {
            if connected >= want {
                self.available.push(address);
                continue;
            }
            if self.ctx.half_open.try_reserve(address, timeout, now) {
                let handle = PeerHandle::start_session(address, self.ctx.clone(), None);
                self.peers.insert(address, handle);
                connected += 1;
            } else {
                self.available.push(address);
            }
        }

        if connected > 0 {
            tracing::info!("connecting to {} peers", connected);
        }
    }

    #[tracing::instrument(skip_all, name = "torrent")]
    async fn run(&mut self) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(&self.listen_address).await?;
        self.listen_address = listener.local_addr()?;
        tracing::info!("listening on {}", self.listen_address);

        self.connect_to_peers();

        let mut choke_ticker = tokio::time::interval(std::time::Duration::from_secs(1));

        loop { tokio::select! {

            new_peer_conn = listener.accept() => {
                let (stream, address) = match new_peer_conn {
                    Ok((stream, address)) => (stream, address),
                    Err(e) => {
                        tracing::warn!("inbound peer connection error: {}", e);
                        continue;
                    },
                };
                let handle = PeerHandle::start_session(address, self.ctx.clone(), Some(stream));
                self.peers.insert(address, handle);
            }

            Some(cmd) = self.torrent_rx.recv() => {
                match cmd {

                    CommandToTorrent::PeerConnected { address, id } => {
                        // The attempt is no longer half-open once the
                        // handshake succeeds, whichever side dialled.
                        self.ctx.half_open.complete(address, self.ctx.peer_config.handshake_timeout, Instant::now());

                        // Reject a second connection to a peer-id we already
                        // host under a different address.
                        let duplicate = self.peers.iter().any(|(&a, p)| a != address && p.id == Some(id));

                        if duplicate {
                            tracing::warn!("duplicate peer-id from {}, disconnecting", address);
                            if let Some(peer) = self.peers.get(&address) {
                                if let Some(tx) = &peer.peer_tx {
                                    tx.send(PeerCommand::Shutdown).ok();
                                }
                            }
                        } else {
                            if let Some(peer) = self.peers.get_mut(&address) {
                                peer.id = Some(id);
                            }
                            self.ctx.alert_sink.post(Alert::PeerConnected { torrent: self.ctx.info_hash, address });
                            if self.config.super_seed_mode != SuperSeedMode::Off && self.state == TorrentState::Seeding {
                                if let Some(peer) = self.peers.get(&address) {
                                    if let Some(tx) = &peer.peer_tx {
                                        tx.send(PeerCommand::RevealPiece(self.super_seed_cursor)).ok();
                                    }
                                }
                            }
                        }
                    },

                    CommandToTorrent::PeerState { address, state } => {
                        if let Some(peer) = self.peers.get_mut(&address) {
                            self.downloaded += state.throughput.down.round();
                            self.uploaded += state.throughput.up.round();
                            peer.state = state;
                        }
                    },

                    CommandToTorrent::PeerDisconnected { address } => {
                        self.peers.remove(&address);
                        // No-op if `PeerConnected` already released this slot;
                        // frees it here for a dial that never completed.
                        self.ctx.half_open.complete(address, self.ctx.peer_config.handshake_timeout, Instant::now());
                        self.ctx.alert_sink.post(Alert::PeerDisconnected { torrent: self.ctx.info_hash, address });
                    },

                    CommandToTorrent::BlockContributed { address, piece_idx } => {
                        self.contributors.entry(piece_idx).or_default().insert(address);
                        self.advance_super_seed_cursor(piece_idx);
                    },

                    CommandToTorrent::PieceWritten { idx, valid } => {
                        self.handle_piece_write(idx, valid).await?;
                    },

                    CommandToTorrent::Shutdown => {
                        break;
                    },
                }
            }

            _ = choke_ticker.tick() => {
                self.run_choker();
                self.connect_to_peers();
            }
        }}

        self.shutdown().await?;
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {
        tracing::info!("disconnecting from {} peers", self.peers.len());
        for peer in self.peers.values() {
            if let Some(tx) = &peer.peer_tx {
                let _ = tx.send(PeerCommand::Shutdown);
            }
        }

        for peer in self.peers.values_mut() {
            if let Some(handle) = peer.session_handle.take() {
                if let Err(e) = handle.await.expect("peer task panicked") {
                    tracing::warn!("session shutdown: {}", e);
                }
            }
        }

        self.ctx.disk_tx.send(DiskCommand::Shutdown)?;
        if let Some(handle) = self.disk_handle.take() {
            handle.await.expect("disk task panicked")?;
        }

        self.announce(Some(AnnounceEvent::Stopped)).await;
        Ok(())
    }

    async fn handle_piece_write(&mut self, idx: usize, valid: bool) -> Result<()> {
        if valid {
            self.ctx.picker.piece_picker.write().await.received_piece(idx);
            self.contributors.remove(&idx);

            let num_pieces_missing = self.ctx.picker.piece_picker.read().await.own_bitfield().count_zeros();
            tracing::info!("piece {} downloaded, {} pieces remain", idx, num_pieces_missing);
            self.ctx.alert_sink.post(Alert::PieceFinished { torrent: self.ctx.info_hash, idx });

            for peer in self.peers.values() {
                if let Some(tx) = &peer.peer_tx {
                    tx.send(PeerCommand::PieceWritten(idx)).ok();
                }
            }

            if num_pieces_missing == 0 {
                tracing::info!("torrent download complete");
                self.state = TorrentState::Seeding;
                self.ctx.alert_sink.post(Alert::TorrentFinished { torrent: self.ctx.info_hash });
            }

            // Strict super-seeding holds the cursor until the piece it covers
            // is confirmed written, then advances (spec.md §4.H).
            if self.config.super_seed_mode == SuperSeedMode::Strict && idx == self.super_seed_cursor {
                self.reveal_next_super_seed_piece();
            }
        } else {
            // Blame whoever contributed a block to the failed piece; if a
            // single peer contributed every block, `restore_piece` still
            // frees its state, but here every contributor goes on parole
            // (spec.md §4.E.4, §4.F hash failure).
            let contributors = self.contributors.remove(&idx).unwrap_or_default();
            for &address in &contributors {
                if let Some(peer) = self.peers.get(&address) {
                    if let Some(tx) = &peer.peer_tx {
                        tx.send(PeerCommand::Parole(idx)).ok();
                    }
                }
            }
            self.ctx.alert_sink.post(Alert::HashFailed {
                torrent: self.ctx.info_hash,
                idx,
                contributors: contributors.into_iter().collect(),
            });
            self.ctx.picker.restore_piece(idx).await;
        }

        Ok(())
    }

    /// Normal-mode super-seeding reveal: once any peer has requested a block
    /// of the current cursor piece, move on to the next one. Strict mode
    /// instead waits for `handle_piece_write` to confirm the cursor piece
    /// actually finished writing before advancing.
    fn advance_super_seed_cursor(&mut self, piece_idx: usize) {
        if self.config.super_seed_mode != SuperSeedMode::Normal {
            return;
        }
        if piece_idx != self.super_seed_cursor {
            return;
        }
        self.reveal_next_super_seed_piece();
    }

    fn reveal_next_super_seed_piece(&mut self) {
        self.super_seed_cursor = (self.super_seed_cursor + 1) % self.ctx.info.num_pieces.max(1) as usize;
        for peer in self.peers.values() {
            if let Some(tx) = &peer.peer_tx {
                tx.send(PeerCommand::RevealPiece(self.super_seed_cursor)).ok();
            }
        }
    }

    /// Runs one tick of the choker (spec.md §4.H): ranks interested peers by
    /// the configured algorithm, unchokes the top `unchoke_slots`, and forces
    /// an optimistic unchoke every `optimistic_unchoke_multiplier`-th tick.
    fn run_choker(&mut self) {
        self.choke_tick = self.choke_tick.wrapping_add(1);

        let mut ranked: Vec<(SocketAddr, f64)> = self
            .peers
            .iter()
            .filter(|(_, p)| p.state.peer_interested)
            .map(|(&addr, p)| (addr, Self::choke_score(self.config.choking_algorithm, &p.state)))
            .collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        let mut unchoked: HashSet<SocketAddr> =
            ranked.iter().take(self.config.unchoke_slots).map(|(addr, _)| *addr).collect();

        if self.optimistic_unchoke_multiplier > 0 && self.choke_tick % self.optimistic_unchoke_multiplier == 0 {
            let choked: Vec<SocketAddr> = self
                .peers
                .iter()
                .filter(|(addr, p)| p.state.peer_interested && !unchoked.contains(addr))
                .map(|(&addr, _)| addr)
                .collect();
            if !choked.is_empty() {
                let pick = choked[rand::thread_rng().gen_range(0..choked.len())];
                unchoked.insert(pick);
            }
        }

        for (addr, peer) in self.peers.iter() {
            let Some(tx) = &peer.peer_tx else { continue };
            if unchoked.contains(addr) {
                tx.send(PeerCommand::Unchoke).ok();
            } else {
                tx.send(PeerCommand::Choke).ok();
            }
        }
    }

    fn choke_score(algorithm: ChokingAlgorithm, state: &SessionState) -> f64 {
        match algorithm {
            ChokingAlgorithm::RoundRobin => state.throughput.up.round() as f64,
            ChokingAlgorithm::RateBased => state.throughput.down.round() as f64,
            ChokingAlgorithm::BitTyrant => {
                let up = (state.throughput.up.round() as f64).max(1.0);
                state.throughput.down.round() as f64 / up
            }
        }
    }

    pub async fn stats(&self) -> TorrentStats {
        let piece_picker = self.ctx.picker.piece_picker.read().await;
        TorrentStats {
            start_time: self.start_time,
            time_elapsed: self.start_time.map(|t| t.elapsed()).unwrap_or_default(),
            state: self.state.clone(),
            piece_stats: PieceStats {
                num_pieces: self.ctx.info.num_pieces as usize,
                num_pending: self.ctx.picker.partial_pieces.read().await.len(),
                num_downloaded: piece_picker.own_bitfield().count_ones(),
            },
            peer_stats: self.peers.iter().map(|(&address, p)| PeerStats { address, state: p.state }).collect(),
            throughput: self.peers.values().fold(ThroughputStats::default(), |mut acc, p| {
                acc += &p.state.throughput;
                acc
            }),
        }
    }
}

impl From<PeerError> for TorrentError {
    fn from(e: PeerError) -> Self {
        TorrentError::Channel(e.to_string())
    }
}
