#![allow(dead_code)]

pub mod alert;
pub mod bandwidth;
pub mod block;
pub mod collaborators;
pub mod config;
pub mod connect;
pub mod disk;
pub mod fastresume;
pub mod mse;
pub mod peer;
pub mod picker;
pub mod session;
pub mod stats;
pub mod storage;
pub mod store;
pub mod torrent;

/// Canonical request granule. 16 KiB, per BEP 3 convention.
pub const BLOCK_SIZE: usize = 0x4000;

/// A torrent's 20-byte SHA-1 info-hash, also used as its session-wide identity.
pub type TorrentId = [u8; 20];

pub type Bitfield = bitvec::vec::BitVec<u8, bitvec::order::Msb0>;

pub use config::{PeerConfig, SessionConfig, TorrentConfig};
pub use torrent::Torrent;
