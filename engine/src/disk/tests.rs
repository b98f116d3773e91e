use tokio::sync::{mpsc, oneshot};

use crate::block::{block_len, num_blocks, Block, BlockData, BlockRequest};
use crate::peer::PeerCommand;
use crate::store::{FileInfo, StoreInfo};
use crate::torrent::CommandToTorrent;
use crate::BLOCK_SIZE;

use super::{spawn_disk, DiskCommand};

fn test_info(dir: &std::path::Path, piece_len: usize, num_pieces: usize) -> StoreInfo {
    StoreInfo::new(
        (piece_len * num_pieces) as u64,
        piece_len,
        num_pieces as u32,
        vec![FileInfo { path: "test_file".into(), length: piece_len * num_pieces, offset: 0, md5sum: None }],
        dir.to_path_buf(),
    )
}

fn hash(data: &[u8]) -> [u8; 20] {
    use sha1::Digest;
    let mut hasher = sha1::Sha1::new();
    hasher.update(data);
    let out = hasher.finalize();
    let mut h = [0u8; 20];
    h.copy_from_slice(&out);
    h
}

// Fresh files are all zero, so their hashes won't match real piece content:
// a new allocation should come back with an all-false bitfield.
#[tokio::test]
async fn test_disk_new_torrent_fresh_allocation() {
    let dir = tempfile::tempdir().unwrap();
    let info = test_info(dir.path(), BLOCK_SIZE, 2);
    let piece_hashes = vec![hash(&[1u8; BLOCK_SIZE]), hash(&[2u8; BLOCK_SIZE])];

    let (_handle, disk_tx) = spawn_disk(8, 64);
    let (torrent_tx, _torrent_rx) = mpsc::unbounded_channel();
    let (reply_tx, reply_rx) = oneshot::channel();

    disk_tx
        .send(DiskCommand::NewTorrent { id: [1; 20], info, piece_hashes, torrent_tx, reply: reply_tx })
        .unwrap();
    let bf = reply_rx.await.unwrap().unwrap();
    assert!(bf.not_any());

    disk_tx.send(DiskCommand::Shutdown).unwrap();
}

// Writes every block of a single-block piece and checks it round-trips
// through a subsequent read, served either from disk or the cache.
#[tokio::test]
async fn test_disk_write_then_read() {
    let dir = tempfile::tempdir().unwrap();
    let info = test_info(dir.path(), BLOCK_SIZE, 1);
    let piece_hashes = vec![hash(&[9u8; BLOCK_SIZE])];

    let (_handle, disk_tx) = spawn_disk(8, 64);
    let (torrent_tx, mut torrent_rx) = mpsc::unbounded_channel();
    let (reply_tx, reply_rx) = oneshot::channel();
    disk_tx
        .send(DiskCommand::NewTorrent { id: [2; 20], info, piece_hashes, torrent_tx, reply: reply_tx })
        .unwrap();
    reply_rx.await.unwrap().unwrap();

    let block = Block { piece_idx: 0, offset: 0, data: BlockData::Owned(vec![9u8; BLOCK_SIZE]) };
    disk_tx.send(DiskCommand::WriteBlock { id: [2; 20], block }).unwrap();

    match torrent_rx.recv().await.expect("missing PieceWritten") {
        CommandToTorrent::PieceWritten { idx, valid } => {
            assert_eq!(idx, 0);
            assert!(valid);
        }
        _ => panic!("unexpected command"),
    }

    let (peer_tx, mut peer_rx) = mpsc::unbounded_channel();
    disk_tx
        .send(DiskCommand::ReadBlock {
            id: [2; 20],
            block: BlockRequest { piece_idx: 0, offset: 0, len: BLOCK_SIZE },
            tx: peer_tx,
        })
        .unwrap();

    match peer_rx.recv().await.expect("missing BlockRead") {
        PeerCommand::BlockRead(block) => assert_eq!(block.data.as_ref(), vec![9u8; BLOCK_SIZE].as_slice()),
        _ => panic!("expected BlockRead"),
    }

    disk_tx.send(DiskCommand::Shutdown).unwrap();
}

// A piece whose hash doesn't match its data must be reported invalid and must
// not leave dirty blocks promoted into the read cache.
#[tokio::test]
async fn test_disk_write_hash_mismatch_reported_invalid() {
    let dir = tempfile::tempdir().unwrap();
    let info = test_info(dir.path(), BLOCK_SIZE, 1);
    let piece_hashes = vec![hash(&[0u8; BLOCK_SIZE])]; // does not match the data written below

    let (_handle, disk_tx) = spawn_disk(8, 64);
    let (torrent_tx, mut torrent_rx) = mpsc::unbounded_channel();
    let (reply_tx, reply_rx) = oneshot::channel();
    disk_tx
        .send(DiskCommand::NewTorrent { id: [3; 20], info, piece_hashes, torrent_tx, reply: reply_tx })
        .unwrap();
    reply_rx.await.unwrap().unwrap();

    let block = Block { piece_idx: 0, offset: 0, data: BlockData::Owned(vec![5u8; BLOCK_SIZE]) };
    disk_tx.send(DiskCommand::WriteBlock { id: [3; 20], block }).unwrap();

    match torrent_rx.recv().await.expect("missing PieceWritten") {
        CommandToTorrent::PieceWritten { idx, valid } => {
            assert_eq!(idx, 0);
            assert!(!valid);
        }
        _ => panic!("unexpected command"),
    }

    disk_tx.send(DiskCommand::Shutdown).unwrap();
}

// Writes a multi-block piece spanning the whole file and checks the file's
// final size and byte content match what was written.
#[tokio::test]
async fn test_disk_write_multi_block_piece() {
    let dir = tempfile::tempdir().unwrap();
    let piece_len = BLOCK_SIZE * 2 + 10;
    let data = vec![3u8; piece_len];
    let info = test_info(dir.path(), piece_len, 1);
    let piece_hashes = vec![hash(&data)];

    let (_handle, disk_tx) = spawn_disk(8, 64);
    let (torrent_tx, mut torrent_rx) = mpsc::unbounded_channel();
    let (reply_tx, reply_rx) = oneshot::channel();
    disk_tx
        .send(DiskCommand::NewTorrent { id: [4; 20], info, piece_hashes, torrent_tx, reply: reply_tx })
        .unwrap();
    reply_rx.await.unwrap().unwrap();

    for i in 0..num_blocks(piece_len) as usize {
        let block = Block {
            piece_idx: 0,
            offset: i * BLOCK_SIZE,
            data: BlockData::Owned(vec![3u8; block_len(piece_len, i)]),
        };
        disk_tx.send(DiskCommand::WriteBlock { id: [4; 20], block }).unwrap();
    }

    match torrent_rx.recv().await.expect("missing PieceWritten") {
        CommandToTorrent::PieceWritten { idx, valid } => {
            assert_eq!(idx, 0);
            assert!(valid);
        }
        _ => panic!("unexpected command"),
    }

    let on_disk = std::fs::read(dir.path().join("test_file")).unwrap();
    assert_eq!(on_disk, data);

    disk_tx.send(DiskCommand::Shutdown).unwrap();
}

#[tokio::test]
async fn test_disk_duplicate_torrent_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let info = test_info(dir.path(), BLOCK_SIZE, 1);
    let piece_hashes = vec![hash(&[0u8; BLOCK_SIZE])];

    let (_handle, disk_tx) = spawn_disk(8, 64);
    let (torrent_tx, _rx) = mpsc::unbounded_channel();

    let (reply1, rx1) = oneshot::channel();
    disk_tx
        .send(DiskCommand::NewTorrent {
            id: [5; 20],
            info: info.clone(),
            piece_hashes: piece_hashes.clone(),
            torrent_tx: torrent_tx.clone(),
            reply: reply1,
        })
        .unwrap();
    assert!(rx1.await.unwrap().is_ok());

    let (reply2, rx2) = oneshot::channel();
    disk_tx.send(DiskCommand::NewTorrent { id: [5; 20], info, piece_hashes, torrent_tx, reply: reply2 }).unwrap();
    assert!(rx2.await.unwrap().is_err());

    disk_tx.send(DiskCommand::Shutdown).unwrap();
}

// move_storage should relocate every file and subsequent reads should still
// resolve against the new directory.
#[tokio::test]
async fn test_disk_move_storage() {
    let src = tempfile::tempdir().unwrap();
    let dest = tempfile::tempdir().unwrap();
    let info = test_info(src.path(), BLOCK_SIZE, 1);
    let piece_hashes = vec![hash(&[6u8; BLOCK_SIZE])];

    let (_handle, disk_tx) = spawn_disk(8, 64);
    let (torrent_tx, mut torrent_rx) = mpsc::unbounded_channel();
    let (reply_tx, reply_rx) = oneshot::channel();
    disk_tx
        .send(DiskCommand::NewTorrent { id: [6; 20], info, piece_hashes, torrent_tx, reply: reply_tx })
        .unwrap();
    reply_rx.await.unwrap().unwrap();

    let block = Block { piece_idx: 0, offset: 0, data: BlockData::Owned(vec![6u8; BLOCK_SIZE]) };
    disk_tx.send(DiskCommand::WriteBlock { id: [6; 20], block }).unwrap();
    torrent_rx.recv().await.unwrap();

    let (move_reply, move_rx) = oneshot::channel();
    disk_tx
        .send(DiskCommand::MoveStorage { id: [6; 20], dest: dest.path().to_path_buf(), reply: move_reply })
        .unwrap();
    move_rx.await.unwrap().unwrap();

    assert!(dest.path().join("test_file").exists());
    assert!(!src.path().join("test_file").exists());

    disk_tx.send(DiskCommand::Shutdown).unwrap();
}
