//! Non-blocking observability surface (spec.md §6). The teacher has no
//! alert/event system of its own; this one is added since an embedder needs
//! some way to observe what a running torrent is doing without polling
//! `Torrent::stats()`. The engine only posts: queuing, draining, and
//! retention policy are left to the `AlertSink` implementation, which is why
//! consuming the alert stream is listed as a Non-goal rather than built here.

use std::net::SocketAddr;

use crate::TorrentId;

/// One observable event raised by a running torrent.
#[derive(Debug, Clone)]
pub enum Alert {
    PeerConnected { torrent: TorrentId, address: SocketAddr },
    PeerDisconnected { torrent: TorrentId, address: SocketAddr },
    PieceFinished { torrent: TorrentId, idx: usize },
    HashFailed { torrent: TorrentId, idx: usize, contributors: Vec<SocketAddr> },
    TorrentFinished { torrent: TorrentId },
    TorrentError { torrent: TorrentId, message: String },
}

/// Receives alerts as they happen. Implementations must not block: `post`
/// runs inline on the torrent's own task, so anything expensive should be
/// handed off (e.g. to a channel) rather than done in place.
pub trait AlertSink: Send + Sync {
    fn post(&self, alert: Alert);
}

/// Discards every alert. The default when nothing is listening.
#[derive(Debug, Default)]
pub struct NullSink;

impl AlertSink for NullSink {
    fn post(&self, _alert: Alert) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct CollectingSink(Mutex<Vec<Alert>>);

    impl AlertSink for CollectingSink {
        fn post(&self, alert: Alert) {
            self.0.lock().unwrap().push(alert);
        }
    }

    #[test]
    fn collecting_sink_records_posted_alerts() {
        let sink = CollectingSink::default();
        sink.post(Alert::TorrentFinished { torrent: [0u8; 20] });
        assert_eq!(sink.0.lock().unwrap().len(), 1);
    }

    #[test]
    fn null_sink_discards() {
        let sink = NullSink;
        sink.post(Alert::TorrentFinished { torrent: [0u8; 20] });
    }
}
