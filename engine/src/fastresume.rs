//! Resume data (spec.md §6 supplement): a bencoded snapshot of a torrent's
//! download progress, so a restart can skip rehashing pieces it already has.
//! The teacher has no equivalent; grounded on mainline's `.fastresume` file
//! and expressed with this crate's own bencode crate, the same way `disk/`
//! already round-trips piece data through it.

use std::path::PathBuf;

use serde_derive::{Deserialize, Serialize};

use bencode::{decode_bytes, encode_to_raw};

use crate::TorrentId;

#[derive(Debug, thiserror::Error)]
pub enum FastResumeError {
    #[error("bencode error: {0}")]
    Bencode(#[from] bencode::Error),

    #[error("info-hash field must be 20 bytes, got {0}")]
    InvalidInfoHash(usize),
}

pub type Result<T> = std::result::Result<T, FastResumeError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawFastResume {
    info_hash: serde_bytes::ByteBuf,
    bitfield: serde_bytes::ByteBuf,
    output_dir: String,
    uploaded: u64,
    downloaded: u64,
    super_seed_cursor: u64,
}

/// Everything needed to resume a torrent without re-checking its files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FastResumeData {
    pub info_hash: TorrentId,

    /// Own bitfield, packed the same way `Bitfield`'s backing storage is.
    pub bitfield: Vec<u8>,

    pub output_dir: PathBuf,
    pub uploaded: u64,
    pub downloaded: u64,

    /// Super-seeding's reveal cursor, so seeding resumes where it left off.
    pub super_seed_cursor: usize,
}

impl FastResumeData {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let raw = RawFastResume {
            info_hash: serde_bytes::ByteBuf::from(self.info_hash.to_vec()),
            bitfield: serde_bytes::ByteBuf::from(self.bitfield.clone()),
            output_dir: self.output_dir.to_string_lossy().into_owned(),
            uploaded: self.uploaded,
            downloaded: self.downloaded,
            super_seed_cursor: self.super_seed_cursor as u64,
        };
        Ok(encode_to_raw(&raw)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let raw: RawFastResume = decode_bytes(bytes)?;
        let info_hash: TorrentId =
            raw.info_hash.as_slice().try_into().map_err(|_| FastResumeError::InvalidInfoHash(raw.info_hash.len()))?;

        Ok(FastResumeData {
            info_hash,
            bitfield: raw.bitfield.into_vec(),
            output_dir: PathBuf::from(raw.output_dir),
            uploaded: raw.uploaded,
            downloaded: raw.downloaded,
            super_seed_cursor: raw.super_seed_cursor as usize,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> FastResumeData {
        FastResumeData {
            info_hash: [7u8; 20],
            bitfield: vec![0xff, 0x00, 0x3c],
            output_dir: PathBuf::from("/tmp/downloads"),
            uploaded: 1 << 20,
            downloaded: 1 << 24,
            super_seed_cursor: 3,
        }
    }

    #[test]
    fn round_trips_through_bencode() {
        let data = sample();
        let encoded = data.encode().unwrap();
        let decoded = FastResumeData::decode(&encoded).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn rejects_a_malformed_info_hash() {
        let mut raw = RawFastResume {
            info_hash: serde_bytes::ByteBuf::from(vec![1, 2, 3]),
            bitfield: serde_bytes::ByteBuf::from(Vec::new()),
            output_dir: "/tmp".to_string(),
            uploaded: 0,
            downloaded: 0,
            super_seed_cursor: 0,
        };
        raw.info_hash = serde_bytes::ByteBuf::from(vec![1, 2, 3]);
        let encoded = encode_to_raw(&raw).unwrap();
        assert!(matches!(FastResumeData::decode(&encoded), Err(FastResumeError::InvalidInfoHash(3))));
    }
}
