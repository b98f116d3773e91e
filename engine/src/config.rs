use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Choking algorithm a torrent's coordinator runs on tick, see spec.md §4.H.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChokingAlgorithm {
    /// Sort by recent rate, unchoke the top `k` while the `k`-th still clears
    /// a falling threshold. Mainline behaviour; the default.
    RateBased,
    /// Estimate reciprocation rate per peer and unchoke for ROI within budget.
    BitTyrant,
    /// Pure upload-rate sort, no reciprocation estimate.
    RoundRobin,
}

impl Default for ChokingAlgorithm {
    fn default() -> Self {
        ChokingAlgorithm::RateBased
    }
}

/// Strictness of a seeding torrent's super-seed mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuperSeedMode {
    Off,
    /// Reveal the next piece once the current one starts propagating.
    Normal,
    /// Refuse to reveal a new piece until the current one is confirmed.
    Strict,
}

impl Default for SuperSeedMode {
    fn default() -> Self {
        SuperSeedMode::Off
    }
}

/// Tri-state policy for one side of the obfuscated transport negotiation
/// (spec.md §4.G).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Msepolicy {
    Disabled,
    Enabled,
    Forced,
}

/// Which payload encodings an obfuscated handshake will accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MseAllowedLevel {
    Plaintext,
    Rc4,
    Both,
}

/// Process/session-wide caps, owned by the session scheduler (component I).
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Unique 20-byte identifier used by this client on the wire.
    pub client_id: [u8; 20],

    /// Address the session listens for incoming peers on.
    pub listen_address: SocketAddr,

    /// Maximum simultaneous outbound connection attempts (0 = unlimited).
    pub half_open_limit: usize,

    /// Total unchoke slots across all torrents.
    pub global_unchoke_slots: usize,

    /// Total open connections across all torrents.
    pub max_connections: usize,

    /// Disk cache size, in blocks, split between read and write caches.
    pub disk_cache_blocks: usize,

    /// Maximum bytes queued on disk per peer before socket reads pause.
    pub max_queued_disk_bytes_per_peer: usize,

    /// How often the session drives the bandwidth manager's tick.
    pub bandwidth_tick_interval: Duration,

    /// How often each torrent's choker re-evaluates.
    pub choke_interval: Duration,

    /// Every Nth choke tick, force an optimistic unchoke.
    pub optimistic_unchoke_multiplier: u32,

    pub mse_policy: Msepolicy,

    pub mse_allowed_level: MseAllowedLevel,
}

const DEFAULT_CLIENT_ID: [u8; 20] = *b"-RS0133-73b3b0b0b0b0";

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            client_id: DEFAULT_CLIENT_ID,
            listen_address: SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 6881),
            half_open_limit: 8,
            global_unchoke_slots: 40,
            max_connections: 200,
            disk_cache_blocks: 2048,
            max_queued_disk_bytes_per_peer: 2 * 1024 * 1024,
            bandwidth_tick_interval: Duration::from_millis(100),
            choke_interval: Duration::from_secs(1),
            optimistic_unchoke_multiplier: 3,
            mse_policy: Msepolicy::Enabled,
            mse_allowed_level: MseAllowedLevel::Both,
        }
    }
}

/// Per-torrent policy, owned by the torrent coordinator (component H).
#[derive(Debug, Clone)]
pub struct TorrentConfig {
    /// Directory files are written under.
    pub output_dir: PathBuf,

    /// Minimum interval between unsolicited tracker announces.
    pub announce_interval: Duration,

    /// Desired (min, max) peer count for this torrent.
    pub min_max_peers: (u32, u32),

    /// Unchoke slots reserved for this torrent out of the global budget.
    pub unchoke_slots: usize,

    pub choking_algorithm: ChokingAlgorithm,

    pub super_seed_mode: SuperSeedMode,

    /// Prefer allocating a whole rarest piece instead of topping up partials.
    pub prefer_whole_pieces: bool,

    /// Iterate pieces by ascending index instead of rarity/randomised order.
    pub sequential: bool,

    /// Blocks outstanding across the torrent below which end-game re-requesting
    /// kicks in (spec.md §4.E.6).
    pub end_game_threshold: usize,
}

impl Default for TorrentConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("downloads"),
            announce_interval: Duration::from_secs(1800),
            min_max_peers: (5, 100),
            unchoke_slots: 4,
            choking_algorithm: ChokingAlgorithm::default(),
            super_seed_mode: SuperSeedMode::default(),
            prefer_whole_pieces: false,
            sequential: false,
            end_game_threshold: 20,
        }
    }
}

/// Per-peer request pipelining knobs (spec.md §4.F).
#[derive(Debug, Clone, Copy)]
pub struct PeerConfig {
    pub min_request_queue: usize,
    pub max_request_queue: usize,
    pub handshake_timeout: Duration,
    pub request_timeout: Duration,
    pub piece_timeout: Duration,
    pub inactivity_timeout: Duration,
    pub peer_timeout: Duration,
    /// Incoming requests queued before the peer is considered abusive.
    pub max_incoming_request_queue: usize,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            min_request_queue: 2,
            max_request_queue: 500,
            handshake_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(60),
            piece_timeout: Duration::from_secs(90),
            inactivity_timeout: Duration::from_secs(120),
            peer_timeout: Duration::from_secs(150),
            max_incoming_request_queue: 250,
        }
    }
}
