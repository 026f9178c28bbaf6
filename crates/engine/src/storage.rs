//! File-backed storage that `Chunk`/`ChunkList` mmap on top of. On-disk
//! file-layout resizing is out of scope for this engine; this module just
//! owns already-created, already-sized files and hands out mmap'd regions
//! or read/write access to them.

use std::{
    collections::HashMap,
    fs::{File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    ops::Range,
    path::{Path, PathBuf},
};

use parking_lot::Mutex;

use crate::chunk::{Chunk, ChunkPart, MmapPart};
use crate::error::{Error, Result};

/// One piece's position within the files it spans.
#[derive(Debug, Clone)]
pub struct PieceLayout {
    pub index: u32,
    pub piece_length: u64,
    /// `(file_id, file_offset, len)` for each file segment this piece touches, in order.
    pub segments: Vec<(usize, u64, u64)>,
}

/// The narrow collaborator interface named in the external interfaces
/// section: builds a `Chunk` for a piece index, optionally writable.
pub trait ChunkFactory: Send + Sync {
    fn create(&self, layout: &PieceLayout, writable: bool) -> Result<Chunk>;
}

pub trait TorrentStorage: ChunkFactory {
    fn pread_exact(&self, file_id: usize, offset: u64, buf: &mut [u8]) -> Result<()>;
    fn pwrite_all(&self, file_id: usize, offset: u64, buf: &[u8]) -> Result<()>;
    fn ensure_file_length(&self, file_id: usize, length: u64) -> Result<()>;
}

struct OpenedFile {
    path: PathBuf,
    file: Mutex<File>,
}

pub struct FilesystemStorage {
    output_folder: PathBuf,
    files: Vec<OpenedFile>,
}

impl FilesystemStorage {
    pub fn open(output_folder: impl Into<PathBuf>, relative_paths: &[PathBuf]) -> Result<Self> {
        let output_folder = output_folder.into();
        let mut files = Vec::with_capacity(relative_paths.len());
        for rel in relative_paths {
            let full = output_folder.join(rel);
            if let Some(parent) = full.parent() {
                std::fs::create_dir_all(parent).map_err(|e| Error::Storage(e.into()))?;
            }
            let file = OpenOptions::new()
                .create(true)
                .truncate(false)
                .read(true)
                .write(true)
                .open(&full)
                .map_err(|e| Error::Storage(e.into()))?;
            files.push(OpenedFile {
                path: full,
                file: Mutex::new(file),
            });
        }
        Ok(Self {
            output_folder,
            files,
        })
    }

    pub fn output_folder(&self) -> &Path {
        &self.output_folder
    }

    fn file_at(&self, file_id: usize) -> Result<&OpenedFile> {
        self.files
            .get(file_id)
            .ok_or_else(|| Error::internal(format!("no such file id {file_id}")))
    }
}

impl TorrentStorage for FilesystemStorage {
    fn pread_exact(&self, file_id: usize, offset: u64, buf: &mut [u8]) -> Result<()> {
        let of = self.file_at(file_id)?;
        let mut g = of.file.lock();
        g.seek(SeekFrom::Start(offset))
            .and_then(|_| g.read_exact(buf))
            .map_err(|e| Error::Storage(e.into()))
    }

    fn pwrite_all(&self, file_id: usize, offset: u64, buf: &[u8]) -> Result<()> {
        let of = self.file_at(file_id)?;
        let mut g = of.file.lock();
        g.seek(SeekFrom::Start(offset))
            .and_then(|_| g.write_all(buf))
            .map_err(|e| Error::Storage(e.into()))
    }

    fn ensure_file_length(&self, file_id: usize, length: u64) -> Result<()> {
        let of = self.file_at(file_id)?;
        of.file
            .lock()
            .set_len(length)
            .map_err(|e| Error::Storage(e.into()))
    }
}

impl ChunkFactory for FilesystemStorage {
    fn create(&self, layout: &PieceLayout, writable: bool) -> Result<Chunk> {
        let mut parts = Vec::with_capacity(layout.segments.len());
        let mut piece_off = 0u64;
        for &(file_id, file_offset, len) in &layout.segments {
            let of = self.file_at(file_id)?;
            let g = of.file.lock();
            let part = MmapPart::from_file_range(
                &g,
                file_offset,
                len,
                piece_off..piece_off + len,
                writable,
            )?;
            parts.push(ChunkPart::Mmap(part));
            piece_off += len;
        }
        if parts.is_empty() {
            return Err(Error::internal(format!(
                "piece {} has no file segments",
                layout.index
            )));
        }
        Ok(Chunk::new(layout.index, parts))
    }
}

/// In-memory storage used by tests and by callers that don't want a real
/// filesystem backing (no file-layout resizing either way — out of scope).
#[derive(Default)]
pub struct InMemoryStorage {
    piece_bytes: Mutex<HashMap<u32, Vec<u8>>>,
    file_lengths: Mutex<HashMap<usize, u64>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ChunkFactory for InMemoryStorage {
    fn create(&self, layout: &PieceLayout, _writable: bool) -> Result<Chunk> {
        let mut g = self.piece_bytes.lock();
        let bytes = g
            .entry(layout.index)
            .or_insert_with(|| vec![0u8; layout.piece_length as usize]);
        Ok(Chunk::new(
            layout.index,
            vec![ChunkPart::Memory(bytes.clone())],
        ))
    }
}

impl TorrentStorage for InMemoryStorage {
    fn pread_exact(&self, file_id: usize, offset: u64, buf: &mut [u8]) -> Result<()> {
        let lengths = self.file_lengths.lock();
        let len = *lengths.get(&file_id).unwrap_or(&0);
        if offset + buf.len() as u64 > len {
            return Err(Error::internal("read past in-memory file length"));
        }
        buf.fill(0);
        Ok(())
    }

    fn pwrite_all(&self, _file_id: usize, _offset: u64, _buf: &[u8]) -> Result<()> {
        Ok(())
    }

    fn ensure_file_length(&self, file_id: usize, length: u64) -> Result<()> {
        self.file_lengths.lock().insert(file_id, length);
        Ok(())
    }
}

/// Drops a leftover segment range, used when building `PieceLayout`s from a
/// torrent's file table. Kept here rather than in `torrent-core` since it
/// only matters for mmap'able storage, not for pure geometry.
pub fn clamp_segment(range: Range<u64>, file_len: u64) -> Range<u64> {
    range.start.min(file_len)..range.end.min(file_len)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filesystem_storage_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let storage =
            FilesystemStorage::open(dir.path(), &[PathBuf::from("a.bin")]).unwrap();
        storage.ensure_file_length(0, 32).unwrap();
        storage.pwrite_all(0, 0, &[1, 2, 3, 4]).unwrap();
        let mut buf = [0u8; 4];
        storage.pread_exact(0, 0, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);
    }

    #[test]
    fn test_filesystem_storage_mmap_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let storage =
            FilesystemStorage::open(dir.path(), &[PathBuf::from("b.bin")]).unwrap();
        storage.ensure_file_length(0, 16).unwrap();
        let layout = PieceLayout {
            index: 0,
            piece_length: 16,
            segments: vec![(0, 0, 16)],
        };
        let mut chunk = storage.create(&layout, true).unwrap();
        chunk.from_buffer(&[9u8; 16], 0, 16).unwrap();
        chunk.sync(true).unwrap();

        let mut buf = [0u8; 16];
        storage.pread_exact(0, 0, &mut buf).unwrap();
        assert_eq!(buf, [9u8; 16]);
    }
}
