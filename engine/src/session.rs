use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::{
    alert::AlertSink,
    bandwidth::{BandwidthChannel, BandwidthManager, ChannelLimit},
    collaborators::Tracker,
    config::{PeerConfig, SessionConfig, TorrentConfig},
    connect::HalfOpenQueue,
    store::StoreInfo,
    torrent::{self, Torrent},
    TorrentId,
};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("torrent error: {0}")]
    Torrent(#[from] torrent::TorrentError),

    #[error("torrent {0:?} already added")]
    DuplicateTorrent(TorrentId),

    #[error("torrent {0:?} not found")]
    TorrentNotFound(TorrentId),
}

pub type Result<T> = std::result::Result<T, SessionError>;
pub type SessionTx = mpsc::UnboundedSender<SessionCommand>;
type SessionRx = mpsc::UnboundedReceiver<SessionCommand>;

/// Commands accepted by the session loop from the embedder.
pub enum SessionCommand {
    AddTorrent {
        info_hash: TorrentId,
        info: StoreInfo,
        piece_hashes: Vec<[u8; 20]>,
        config: TorrentConfig,
        trackers: Vec<Arc<dyn Tracker>>,
        alert_sink: Option<Arc<dyn AlertSink>>,
    },
    RemoveTorrent(TorrentId),
    Shutdown,
}

struct TorrentHandle {
    join_handle: JoinHandle<torrent::Result<()>>,
    torrent_tx: torrent::TorrentTx,
}

/// Process-wide coordinator (component I): owns the global bandwidth budget
/// and half-open connection limiter shared by every torrent, and multiplexes
/// the embedder's add/remove commands onto per-torrent tasks.
pub struct Session {
    config: SessionConfig,
    peer_config: PeerConfig,
    torrents: HashMap<TorrentId, TorrentHandle>,
    bandwidth: Arc<Mutex<BandwidthManager>>,
    half_open: Arc<HalfOpenQueue>,
    command_rx: SessionRx,
    command_tx: SessionTx,
}

impl Session {
    pub fn new(config: SessionConfig, peer_config: PeerConfig) -> (Self, SessionTx) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        let bandwidth = Arc::new(Mutex::new(BandwidthManager::new(vec![
            BandwidthChannel::new(ChannelLimit::unlimited()),
            BandwidthChannel::new(ChannelLimit::unlimited()),
        ])));
        let half_open = Arc::new(HalfOpenQueue::new(config.half_open_limit.max(1)));

        let session = Session {
            config,
            peer_config,
            torrents: HashMap::new(),
            bandwidth,
            half_open,
            command_rx,
            command_tx: command_tx.clone(),
        };

        (session, command_tx)
    }

    async fn add_torrent(
        &mut self,
        info_hash: TorrentId,
        info: StoreInfo,
        piece_hashes: Vec<[u8; 20]>,
        config: TorrentConfig,
        trackers: Vec<Arc<dyn Tracker>>,
        alert_sink: Option<Arc<dyn AlertSink>>,
    ) -> Result<()> {
        if self.torrents.contains_key(&info_hash) {
            return Err(SessionError::DuplicateTorrent(info_hash));
        }

        let mut torrent = Torrent::new(
            info_hash,
            info,
            piece_hashes,
            config,
            self.peer_config,
            &self.config,
            trackers,
            alert_sink,
            self.half_open.clone(),
            self.bandwidth.clone(),
        )
        .await?;
        let torrent_tx = torrent.command_tx();

        let join_handle = tokio::spawn(async move {
            let result = torrent.start().await;
            if let Err(e) = &result {
                tracing::error!("torrent error: {}", e);
            }
            result
        });

        self.torrents.insert(info_hash, TorrentHandle { join_handle, torrent_tx });
        Ok(())
    }

    async fn remove_torrent(&mut self, info_hash: TorrentId) -> Result<()> {
        let handle = self.torrents.remove(&info_hash).ok_or(SessionError::TorrentNotFound(info_hash))?;
        handle.torrent_tx.send(torrent::CommandToTorrent::Shutdown).ok();
        handle.join_handle.await.expect("torrent task panicked")?;
        Ok(())
    }

    async fn shutdown(&mut self) {
        tracing::info!("shutting down {} torrents", self.torrents.len());
        for handle in self.torrents.values() {
            handle.torrent_tx.send(torrent::CommandToTorrent::Shutdown).ok();
        }
        for (_, handle) in self.torrents.drain() {
            if let Err(e) = handle.join_handle.await.expect("torrent task panicked") {
                tracing::warn!("torrent shutdown: {}", e);
            }
        }
    }

    /// Drives the bandwidth manager and half-open connection reaper, and
    /// dispatches embedder commands, until told to shut down.
    pub async fn run(mut self) -> Result<()> {
        let mut tick = tokio::time::interval(self.config.bandwidth_tick_interval);

        loop {
            tokio::select! {
                Some(cmd) = self.command_rx.recv() => {
                    match cmd {
                        SessionCommand::AddTorrent { info_hash, info, piece_hashes, config, trackers, alert_sink } => {
                            if let Err(e) = self.add_torrent(info_hash, info, piece_hashes, config, trackers, alert_sink).await {
                                tracing::error!("failed to add torrent: {}", e);
                            }
                        }
                        SessionCommand::RemoveTorrent(info_hash) => {
                            if let Err(e) = self.remove_torrent(info_hash).await {
                                tracing::warn!("failed to remove torrent: {}", e);
                            }
                        }
                        SessionCommand::Shutdown => break,
                    }
                }

                _ = tick.tick() => {
                    self.bandwidth.lock().await.tick(self.config.bandwidth_tick_interval);

                    let now = Instant::now();
                    let timed_out = self.half_open.reap_timeouts(now);
                    if !timed_out.is_empty() {
                        tracing::debug!("{} half-open connection(s) timed out", timed_out.len());
                    }
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }
}
