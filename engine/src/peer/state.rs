use std::time::Instant;

use crate::stats::ThroughputStats;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ConnState {
    Connecting,
    Handshaking,
    /// Waiting for the first BITFIELD/HAVE_ALL/HAVE_NONE.
    Introducing,
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, Copy)]
pub struct SessionState {
    pub conn_state: ConnState,

    /// Whether we are answering the peer's requests (`am_choking`).
    pub choked: bool,

    /// Whether we are interested in the peer's pieces (`am_interested`).
    pub interested: bool,

    /// Whether the peer is answering our requests.
    pub peer_choking: bool,

    /// Whether the peer is interested in our pieces.
    pub peer_interested: bool,

    pub throughput: ThroughputStats,

    pub num_pieces: usize,

    pub changed: bool,

    pub connect_time: Option<Instant>,

    /// Negotiated via the handshake reserved bits (spec.md §4.F).
    pub fast_extension: bool,

    /// Set after a hash failure this peer contributed to; restricts picks to
    /// the paroled piece until it passes (spec.md §4.E.4).
    pub on_parole: bool,

    /// Set after a request timeout; the peer's queue depth is clamped to 1
    /// until it proves responsive again.
    pub snubbed: bool,

    /// True once this peer was chosen as the optimistic-unchoke target.
    pub optimistic_unchoke: bool,

    pub last_active: Option<Instant>,
}

impl Default for SessionState {
    fn default() -> SessionState {
        SessionState {
            conn_state: ConnState::Disconnected,
            choked: true,
            interested: false,
            peer_choking: true,
            peer_interested: false,
            throughput: ThroughputStats::default(),
            changed: false,
            num_pieces: 0,
            connect_time: None,
            fast_extension: false,
            on_parole: false,
            snubbed: false,
            optimistic_unchoke: false,
            last_active: None,
        }
    }
}

impl SessionState {
    pub fn tick(&mut self) {
        self.throughput.reset();
    }

    #[inline(always)]
    pub fn update(&mut self, f: impl FnOnce(&mut SessionState)) {
        f(self);
        self.changed = true;
    }
}
