//! Chunk / MemoryChunk (C1): the in-memory representation of a single piece,
//! backed by one or more memory-mapped file regions (it may cross file
//! boundaries within a multi-file torrent).

use std::ops::Range;

use crate::error::{Error, Result};

/// One contiguous mmap'd region of a single backing file, covering part of a
/// piece. Most pieces have exactly one part; a piece that straddles a file
/// boundary in a multi-file torrent has one part per file it touches.
pub enum ChunkPart {
    Mmap(MmapPart),
    /// Used by in-memory-backed storage (tests, `InMemoryGarbageCollectingStorage`'s
    /// role): no real file underneath, just an owned buffer.
    Memory(Vec<u8>),
}

pub struct MmapPart {
    mmap: MmapKind,
    /// Byte range within the *piece* this part covers.
    piece_range: Range<u64>,
}

enum MmapKind {
    ReadOnly(memmap2::Mmap),
    ReadWrite(memmap2::MmapMut),
}

impl ChunkPart {
    pub fn len(&self) -> usize {
        match self {
            ChunkPart::Mmap(p) => match &p.mmap {
                MmapKind::ReadOnly(m) => m.len(),
                MmapKind::ReadWrite(m) => m.len(),
            },
            ChunkPart::Memory(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        match self {
            ChunkPart::Mmap(p) => match &p.mmap {
                MmapKind::ReadOnly(m) => m,
                MmapKind::ReadWrite(m) => m,
            },
            ChunkPart::Memory(v) => v,
        }
    }

    pub fn as_mut_slice(&mut self) -> Result<&mut [u8]> {
        match self {
            ChunkPart::Mmap(p) => match &mut p.mmap {
                MmapKind::ReadWrite(m) => Ok(m),
                MmapKind::ReadOnly(_) => Err(Error::internal("write into a read-only chunk part")),
            },
            ChunkPart::Memory(v) => Ok(v),
        }
    }

    pub fn is_writable(&self) -> bool {
        match self {
            ChunkPart::Mmap(p) => matches!(p.mmap, MmapKind::ReadWrite(_)),
            ChunkPart::Memory(_) => true,
        }
    }

    fn flush(&self, index: u32, sync: bool) -> Result<()> {
        if let ChunkPart::Mmap(p) = self {
            if let MmapKind::ReadWrite(m) = &p.mmap {
                let r = if sync { m.flush() } else { m.flush_async() };
                return r.map_err(|source| Error::Sync { index, source });
            }
        }
        Ok(())
    }
}

/// A memory-mapped region covering one full piece, possibly made of several
/// `ChunkPart`s (one per backing file it spans).
pub struct Chunk {
    index: u32,
    parts: Vec<ChunkPart>,
    size: u64,
}

impl Chunk {
    pub fn new(index: u32, parts: Vec<ChunkPart>) -> Self {
        let size = parts.iter().map(|p| p.len() as u64).sum();
        Chunk { index, parts, size }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_writable(&self) -> bool {
        self.parts.iter().all(|p| p.is_writable())
    }

    /// Flags controlling `sync`: mirrors the bitset used by `ChunkList::sync_chunks`.
    pub fn sync(&self, safe: bool) -> Result<()> {
        for p in &self.parts {
            p.flush(self.index, safe)?;
        }
        Ok(())
    }

    /// Iterates `(offset_within_chunk, slice)` spans in order. Standing in
    /// for the original's raw `(ptr, len)` iterator: in safe Rust a borrowed
    /// slice carries both without needing unsafe code at call sites.
    pub fn iter_spans(&self) -> impl Iterator<Item = (u64, &[u8])> {
        let mut offset = 0u64;
        self.parts.iter().map(move |p| {
            let span = (offset, p.as_slice());
            offset += p.len() as u64;
            span
        })
    }

    fn locate(&self, off: u64, len: usize) -> Result<Vec<(usize, Range<usize>)>> {
        if off + len as u64 > self.size {
            return Err(Error::ProtocolBadRequestRange {
                end: off + len as u64,
                chunk_size: self.size,
            });
        }
        let mut spans = Vec::new();
        let mut remaining = len;
        let mut cursor = off;
        let mut part_base = 0u64;
        for (idx, part) in self.parts.iter().enumerate() {
            let part_len = part.len() as u64;
            let part_end = part_base + part_len;
            if cursor < part_end && remaining > 0 {
                let local_off = (cursor - part_base) as usize;
                let take = remaining.min((part_len - (cursor - part_base)) as usize);
                spans.push((idx, local_off..local_off + take));
                cursor += take as u64;
                remaining -= take;
            }
            part_base = part_end;
            if remaining == 0 {
                break;
            }
        }
        if remaining != 0 {
            return Err(Error::internal("chunk span computation left a remainder"));
        }
        Ok(spans)
    }

    pub fn from_buffer(&mut self, buf: &[u8], off: u64, len: usize) -> Result<()> {
        let spans = self.locate(off, len)?;
        let mut consumed = 0usize;
        for (idx, range) in spans {
            let take = range.len();
            self.parts[idx].as_mut_slice()?[range].copy_from_slice(&buf[consumed..consumed + take]);
            consumed += take;
        }
        Ok(())
    }

    pub fn to_buffer(&self, buf: &mut [u8], off: u64, len: usize) -> Result<()> {
        let spans = self.locate(off, len)?;
        let mut written = 0usize;
        for (idx, range) in spans {
            let take = range.len();
            buf[written..written + take].copy_from_slice(&self.parts[idx].as_slice()[range]);
            written += take;
        }
        Ok(())
    }

    pub fn compare_buffer(&self, buf: &[u8], off: u64, len: usize) -> Result<bool> {
        let spans = self.locate(off, len)?;
        let mut consumed = 0usize;
        for (idx, range) in spans {
            let take = range.len();
            if self.parts[idx].as_slice()[range] != buf[consumed..consumed + take] {
                return Ok(false);
            }
            consumed += take;
        }
        Ok(true)
    }
}

impl MmapPart {
    pub fn from_file_range(
        file: &std::fs::File,
        file_offset: u64,
        len: u64,
        piece_range: Range<u64>,
        writable: bool,
    ) -> Result<Self> {
        let mmap = if writable {
            let m = unsafe {
                memmap2::MmapOptions::new()
                    .offset(file_offset)
                    .len(len as usize)
                    .map_mut(file)
            }
            .map_err(|e| Error::Storage(e.into()))?;
            MmapKind::ReadWrite(m)
        } else {
            let m = unsafe {
                memmap2::MmapOptions::new()
                    .offset(file_offset)
                    .len(len as usize)
                    .map(file)
            }
            .map_err(|e| Error::Storage(e.into()))?;
            MmapKind::ReadOnly(m)
        };
        Ok(MmapPart { mmap, piece_range })
    }

    pub fn piece_range(&self) -> Range<u64> {
        self.piece_range.clone()
    }
}
