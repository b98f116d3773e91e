use std::{net::SocketAddr, sync::Arc};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::Instrument;

use crate::{block::Block, torrent::TorrentContext};

mod handshake;
mod message;
mod session;
pub mod state;

pub use handshake::{Handshake, HandshakeCodec};
pub use message::{Message, MessageCodec};
pub use session::PeerSession;

use state::SessionState;

type Result<T> = std::result::Result<T, PeerError>;
type PeerRx = mpsc::UnboundedReceiver<PeerCommand>;
pub type PeerTx = mpsc::UnboundedSender<PeerCommand>;

/// Error taxonomy per spec.md §7. Protocol violations close the connection;
/// transport errors close it silently.
#[derive(thiserror::Error, Debug)]
pub enum PeerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("handshake provided incorrect protocol")]
    IncorrectProtocol,

    #[error("handshake provided incorrect info-hash")]
    IncorrectInfoHash,

    #[error("self-connection rejected")]
    SelfConnection,

    #[error("duplicate peer-id on torrent")]
    DuplicatePeerId,

    #[error("info-hash does not map to an active torrent")]
    UnknownTorrent,

    #[error("no handshake received")]
    NoHandshake,

    #[error("invalid message ID: {0}")]
    InvalidMessageId(u8),

    #[error("bitfield sent outside of introduction phase")]
    UnexpectedBitfield,

    #[error("have message with out-of-range piece index")]
    InvalidHave,

    #[error("request while choking outside of fast extension")]
    RequestWhileChoking,

    #[error("oversize or out-of-range request")]
    InvalidRequest,

    #[error("piece we did not request")]
    UnrequestedPiece,

    #[error("invalid message payload")]
    InvalidMessage,

    #[error("handshake timed out")]
    HandshakeTimeout,

    #[error("request timed out")]
    RequestTimeout,

    #[error("no activity on the connection")]
    InactivityTimeout,

    #[error("channel error: {0}")]
    Channel(String),
}

impl<T> From<mpsc::error::SendError<T>> for PeerError {
    fn from(e: mpsc::error::SendError<T>) -> Self {
        PeerError::Channel(e.to_string())
    }
}

/// Commands dispatched to a peer session from elsewhere in the process.
pub enum PeerCommand {
    /// A piece finished writing and passed its hash check.
    PieceWritten(usize),

    /// A block read off disk, ready to send to the peer once bandwidth
    /// allows (spec.md §4.C).
    BlockRead(Block),

    /// The bandwidth manager granted `amount` bytes on `channel` toward this
    /// peer's outstanding upload request.
    BandwidthGranted { channel: usize, amount: u32 },

    /// This peer contributed to a piece that failed its hash check; restrict
    /// its requests to that piece until it passes (spec.md §4.E.4).
    Parole(usize),

    /// Choker decision (spec.md §4.H): stop/resume serving this peer's requests.
    Choke,
    Unchoke,

    /// Super-seeding (spec.md §4.H): advertise exactly one more piece via HAVE,
    /// bypassing the ordinary whole-bitfield announcement.
    RevealPiece(usize),

    Shutdown,
}

#[derive(Debug)]
pub struct PeerHandle {
    /// Sends commands into the peer's session task.
    pub peer_tx: Option<PeerTx>,

    /// Peer-id, populated once the handshake completes.
    pub id: Option<[u8; 20]>,

    /// Handle to the peer session task; taken on shutdown to await it.
    pub session_handle: Option<JoinHandle<Result<()>>>,

    /// Last known session state, updated by `PeerState` reports.
    pub state: SessionState,
}

impl PeerHandle {
    pub fn start_session(
        address: SocketAddr,
        ctx: Arc<TorrentContext>,
        socket: Option<tokio::net::TcpStream>,
    ) -> Self {
        let (mut session, peer_tx) = PeerSession::new(address, ctx);
        let session_handle = tokio::spawn(
            async move {
                let result = session.start_session(socket).await;
                if let Err(e) = &result {
                    tracing::error!("session error: {}", e);
                }
                session.disconnect().await;
                result
            }
            .instrument(tracing::info_span!("peer", addr = %address)),
        );

        PeerHandle {
            peer_tx: Some(peer_tx),
            id: None,
            session_handle: Some(session_handle),
            state: SessionState::default(),
        }
    }
}
