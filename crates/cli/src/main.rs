//! `enginectl`: loads a .torrent file, opens (or creates) its files under an
//! output directory, and verifies every piece already on disk. This is
//! intentionally thin — argument parsing, peer acquisition and the download
//! loop itself are driven by callers embedding the `engine` crate, not by
//! this binary.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use buffers::ByteString;
use engine::{ChunkList, FilesystemStorage, HashOutcome, HashTorrent, MemoryQuota, PieceLayout};
use torrent_core::lengths::Lengths;
use torrent_core::torrent_metainfo::torrent_from_bytes;

#[derive(Parser)]
#[command(name = "enginectl", about = "Verify a torrent's on-disk pieces")]
struct Args {
    /// Path to the .torrent file.
    torrent: PathBuf,
    /// Directory the torrent's files are (or will be) stored under.
    output: PathBuf,
}

fn build_piece_layouts(lengths: &Lengths, files: &[(u64, u64)]) -> Vec<PieceLayout> {
    let mut layouts: Vec<PieceLayout> = lengths
        .iter_piece_infos()
        .map(|p| PieceLayout {
            index: p.piece_index.get(),
            piece_length: p.len as u64,
            segments: Vec::new(),
        })
        .collect();

    for (file_id, &(file_offset, file_len)) in files.iter().enumerate() {
        let file_end = file_offset + file_len;
        for piece_index in lengths.iter_pieces_within_offset(file_offset, file_len) {
            let valid = lengths
                .validate_piece_index(piece_index)
                .expect("iter_pieces_within_offset yields only valid indices");
            let piece_start = lengths.piece_offset(valid);
            let piece_end = piece_start + lengths.piece_length(valid) as u64;
            let seg_start = piece_start.max(file_offset);
            let seg_end = piece_end.min(file_end);
            if seg_end <= seg_start {
                continue;
            }
            layouts[piece_index as usize].segments.push((
                file_id,
                seg_start - file_offset,
                seg_end - seg_start,
            ));
        }
    }
    layouts
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let bytes = std::fs::read(&args.torrent)
        .with_context(|| format!("reading {:?}", args.torrent))?;
    let meta = torrent_from_bytes::<ByteString>(&bytes).context("parsing torrent metainfo")?;

    let lengths = Lengths::from_torrent(&meta.info)?;
    let mut relative_paths = Vec::new();
    let mut files = Vec::new();
    for detail in meta.info.iter_file_details(&lengths)? {
        relative_paths.push(detail.filename.to_pathbuf()?);
        files.push((detail.offset, detail.len));
    }

    let storage = FilesystemStorage::open(&args.output, &relative_paths)?;
    for (file_id, &(_, len)) in files.iter().enumerate() {
        engine::TorrentStorage::ensure_file_length(&storage, file_id, len)?;
    }

    let layouts = build_piece_layouts(&lengths, &files);
    let mut chunk_list = ChunkList::new(Box::new(storage), MemoryQuota::unlimited());
    chunk_list.resize(layouts)?;
    let chunk_list = Arc::new(chunk_list);

    let piece_hashes: Vec<[u8; 20]> = (0..lengths.total_pieces())
        .map(|i| {
            meta.info
                .get_hash(i)
                .and_then(|h| h.try_into().ok())
                .context("torrent pieces field is truncated")
        })
        .collect::<anyhow::Result<_>>()?;

    let hash_torrent = HashTorrent::new(chunk_list, piece_hashes);

    let mut verified = 0u32;
    let mut mismatched = 0u32;
    hash_torrent
        .verify_all(|index, outcome| match outcome {
            HashOutcome::Verified => verified += 1,
            HashOutcome::Mismatch => {
                mismatched += 1;
                tracing::debug!(piece = index, "hash mismatch");
            }
        })
        .await?;

    tracing::info!(
        total = hash_torrent.total_pieces(),
        verified,
        mismatched,
        "verification complete"
    );
    Ok(())
}
