// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

//! Compressed segment files.
//!
//! ```plain
//! | header (HEADER_SIZE bytes) | chunk | chunk | ... |
//! header: | magic | width (u32) | chunk_size (u64) | raw_capacity (u64) | chunk_count (u32) | ptr | ptr | ... |
//! ptr:    | offset (u64) | len (u32) | raw_len (u32) | crc32 (u32) |
//! chunk:  | run (u16) | value (width bytes) | run | value | ... |
//! ```
//!
//! Each chunk covers `chunk_size` raw bytes. A chunk with `len == 0` has never
//! been written and holds empty values only. A rewritten chunk is appended at
//! the end of the file and its pointer is updated, so a chunk never grows in
//! place.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut, BytesMut};

use super::{fill_pattern, SegmentFileBackend};
use crate::bulk::{BulkLoadResult, TracedBulkLoadError};

const MAGIC: &[u8; 4] = b"RLCF";
pub const HEADER_SIZE: u64 = 8192;
const HEADER_FIXED_SIZE: usize = 4 + 4 + 8 + 8 + 4;
const CHUNK_PTR_SIZE: usize = 8 + 4 + 4 + 4;
const MAX_CHUNKS: usize = (HEADER_SIZE as usize - HEADER_FIXED_SIZE) / CHUNK_PTR_SIZE;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct ChunkPtr {
    offset: u64,
    len: u32,
    raw_len: u32,
    crc32: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Header {
    width: u32,
    chunk_size: u64,
    raw_capacity: u64,
    chunks: Vec<ChunkPtr>,
}

impl Header {
    fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE as usize);
        buf.put_slice(MAGIC);
        buf.put_u32_le(self.width);
        buf.put_u64_le(self.chunk_size);
        buf.put_u64_le(self.raw_capacity);
        buf.put_u32_le(self.chunks.len() as u32);
        for ptr in &self.chunks {
            buf.put_u64_le(ptr.offset);
            buf.put_u32_le(ptr.len);
            buf.put_u32_le(ptr.raw_len);
            buf.put_u32_le(ptr.crc32);
        }
        buf.resize(HEADER_SIZE as usize, 0);
        buf
    }

    fn decode(mut buf: &[u8]) -> BulkLoadResult<Self> {
        if buf.len() < HEADER_FIXED_SIZE || &buf[..4] != MAGIC {
            return Err(TracedBulkLoadError::decode("bad compressed file header"));
        }
        buf.advance(4);
        let width = buf.get_u32_le();
        let chunk_size = buf.get_u64_le();
        let raw_capacity = buf.get_u64_le();
        let count = buf.get_u32_le() as usize;
        if count > MAX_CHUNKS || buf.remaining() < count * CHUNK_PTR_SIZE {
            return Err(TracedBulkLoadError::decode(format!(
                "invalid chunk count {count}"
            )));
        }
        let chunks = (0..count)
            .map(|_| ChunkPtr {
                offset: buf.get_u64_le(),
                len: buf.get_u32_le(),
                raw_len: buf.get_u32_le(),
                crc32: buf.get_u32_le(),
            })
            .collect();
        Ok(Self {
            width,
            chunk_size,
            raw_capacity,
            chunks,
        })
    }

    fn chunk_count(&self) -> usize {
        self.raw_capacity.div_ceil(self.chunk_size) as usize
    }

    /// Raw bytes covered by chunk `idx` at the current capacity.
    fn chunk_raw_len(&self, idx: usize) -> usize {
        let start = idx as u64 * self.chunk_size;
        (self.raw_capacity - start).min(self.chunk_size) as usize
    }
}

/// Run-length encodes `data`, one run per repeated `width`-byte value.
fn rle_encode(data: &[u8], width: usize) -> Vec<u8> {
    let mut out = Vec::new();
    let mut values = data.chunks_exact(width).peekable();
    while let Some(value) = values.next() {
        let mut run: u16 = 1;
        while run < u16::MAX && values.peek() == Some(&value) {
            values.next();
            run += 1;
        }
        out.put_u16_le(run);
        out.put_slice(value);
    }
    out
}

fn rle_decode(mut buf: &[u8], width: usize) -> BulkLoadResult<Vec<u8>> {
    let mut out = Vec::new();
    while buf.has_remaining() {
        if buf.remaining() < 2 + width {
            return Err(TracedBulkLoadError::decode("truncated run"));
        }
        let run = buf.get_u16_le() as usize;
        for _ in 0..run {
            out.put_slice(&buf[..width]);
        }
        buf.advance(width);
    }
    Ok(out)
}

struct CachedChunk {
    idx: usize,
    data: Vec<u8>,
    dirty: bool,
}

struct CompressedFile {
    path: PathBuf,
    file: File,
    header: Header,
    position: u64,
    /// Physical offset where the next chunk is appended.
    data_end: u64,
    cache: Option<CachedChunk>,
    header_dirty: bool,
}

impl CompressedFile {
    fn io(&self, op: &'static str) -> impl FnOnce(std::io::Error) -> TracedBulkLoadError + '_ {
        move |e| TracedBulkLoadError::io(op, &self.path, e)
    }

    fn write_header(&mut self) -> BulkLoadResult<()> {
        let header = self.header.encode();
        self.file
            .seek(SeekFrom::Start(0))
            .and_then(|_| self.file.write_all(&header))
            .map_err(|e| TracedBulkLoadError::io("write header", &self.path, e))?;
        self.header_dirty = false;
        Ok(())
    }

    fn store_cached(&mut self) -> BulkLoadResult<()> {
        let Some(cached) = self.cache.as_mut() else {
            return Ok(());
        };
        if !cached.dirty {
            return Ok(());
        }
        let encoded = rle_encode(&cached.data, self.header.width as usize);
        let ptr = ChunkPtr {
            offset: self.data_end,
            len: encoded.len() as u32,
            raw_len: cached.data.len() as u32,
            crc32: crc32fast::hash(&encoded),
        };
        cached.dirty = false;
        let idx = cached.idx;
        self.file
            .seek(SeekFrom::Start(ptr.offset))
            .and_then(|_| self.file.write_all(&encoded))
            .map_err(|e| TracedBulkLoadError::io("write chunk", &self.path, e))?;
        self.data_end += encoded.len() as u64;
        self.header.chunks[idx] = ptr;
        self.header_dirty = true;
        Ok(())
    }

    fn load(&mut self, idx: usize, empty: &[u8]) -> BulkLoadResult<&mut CachedChunk> {
        if self.cache.as_ref().map(|c| c.idx) != Some(idx) {
            self.store_cached()?;
            let data = self.read_chunk(idx, empty)?;
            self.cache = Some(CachedChunk {
                idx,
                data,
                dirty: false,
            });
        }
        self.cache
            .as_mut()
            .ok_or_else(|| TracedBulkLoadError::logic("chunk cache is empty"))
    }

    fn read_chunk(&mut self, idx: usize, empty: &[u8]) -> BulkLoadResult<Vec<u8>> {
        let raw_len = self.header.chunk_raw_len(idx);
        let ptr = self.header.chunks[idx];
        if ptr.len == 0 {
            return Ok(fill_pattern(empty, raw_len));
        }
        let mut encoded = vec![0; ptr.len as usize];
        self.file
            .seek(SeekFrom::Start(ptr.offset))
            .and_then(|_| self.file.read_exact(&mut encoded))
            .map_err(self.io("read chunk"))?;
        let crc = crc32fast::hash(&encoded);
        if crc != ptr.crc32 {
            return Err(TracedBulkLoadError::checksum(crc as u64, ptr.crc32 as u64));
        }
        let mut data = rle_decode(&encoded, self.header.width as usize)?;
        if data.len() != ptr.raw_len as usize {
            return Err(TracedBulkLoadError::decode(format!(
                "chunk {idx} decoded to {} bytes, expected {}",
                data.len(),
                ptr.raw_len
            )));
        }
        // capacity may have grown since the chunk was written
        let tail = raw_len.saturating_sub(data.len());
        data.extend(fill_pattern(empty, tail));
        Ok(data)
    }
}

/// Segment file stored as crc-checked, run-length encoded chunks. Sizes and
/// offsets are in raw bytes; only [`physical_len`](SegmentFileBackend::physical_len)
/// reports the size on disk.
pub struct CompressedBackend {
    empty: Vec<u8>,
    chunk_size: u64,
    sync_on_close: bool,
    file: Option<CompressedFile>,
}

impl CompressedBackend {
    pub fn new(empty: Vec<u8>, chunk_size: usize, sync_on_close: bool) -> Self {
        let width = empty.len().max(1);
        let chunk_size = (chunk_size / width).max(1) * width;
        Self {
            empty,
            chunk_size: chunk_size as u64,
            sync_on_close,
            file: None,
        }
    }

    fn file(&mut self) -> BulkLoadResult<&mut CompressedFile> {
        self.file
            .as_mut()
            .ok_or_else(|| TracedBulkLoadError::logic("segment file is not open"))
    }

    fn set_capacity(header: &mut Header, raw_capacity: u64) -> BulkLoadResult<()> {
        header.raw_capacity = raw_capacity;
        let count = header.chunk_count();
        if count > MAX_CHUNKS {
            return Err(TracedBulkLoadError::logic(format!(
                "{raw_capacity} bytes need {count} chunks, at most {MAX_CHUNKS} are supported"
            )));
        }
        header.chunks.resize(count, ChunkPtr::default());
        Ok(())
    }
}

impl SegmentFileBackend for CompressedBackend {
    fn kind(&self) -> &'static str {
        "compressed"
    }

    fn create(&mut self, path: &Path, raw_bytes: u64) -> BulkLoadResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| TracedBulkLoadError::io("create directory", parent, e))?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| TracedBulkLoadError::io("create", path, e))?;
        let mut header = Header {
            width: self.empty.len() as u32,
            chunk_size: self.chunk_size,
            raw_capacity: 0,
            chunks: vec![],
        };
        Self::set_capacity(&mut header, raw_bytes)?;
        let mut file = CompressedFile {
            path: path.to_path_buf(),
            file,
            header,
            position: 0,
            data_end: HEADER_SIZE,
            cache: None,
            header_dirty: true,
        };
        file.write_header()?;
        self.file = Some(file);
        Ok(())
    }

    fn open(&mut self, path: &Path) -> BulkLoadResult<()> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| TracedBulkLoadError::io("open", path, e))?;
        let mut buf = vec![0; HEADER_SIZE as usize];
        file.read_exact(&mut buf)
            .map_err(|e| TracedBulkLoadError::io("read header", path, e))?;
        let header = Header::decode(&buf)?;
        if header.width as usize != self.empty.len() {
            return Err(TracedBulkLoadError::decode(format!(
                "{path:?} stores {}-byte values, expected {}",
                header.width,
                self.empty.len()
            )));
        }
        let data_end = file
            .metadata()
            .map_err(|e| TracedBulkLoadError::io("stat", path, e))?
            .len()
            .max(HEADER_SIZE);
        self.file = Some(CompressedFile {
            path: path.to_path_buf(),
            file,
            header,
            position: 0,
            data_end,
            cache: None,
            header_dirty: false,
        });
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.file.is_some()
    }

    fn path(&self) -> Option<&Path> {
        self.file.as_ref().map(|f| f.path.as_path())
    }

    fn raw_len(&self) -> u64 {
        self.file.as_ref().map_or(0, |f| f.header.raw_capacity)
    }

    fn physical_len(&self) -> BulkLoadResult<u64> {
        match &self.file {
            Some(f) => Ok(f.data_end),
            None => Ok(0),
        }
    }

    fn position(&self) -> u64 {
        self.file.as_ref().map_or(0, |f| f.position)
    }

    fn seek(&mut self, raw_offset: u64) -> BulkLoadResult<()> {
        let file = self.file()?;
        if raw_offset > file.header.raw_capacity {
            return Err(TracedBulkLoadError::logic(format!(
                "seek to {raw_offset} past end of {:?} ({} bytes)",
                file.path, file.header.raw_capacity
            )));
        }
        file.position = raw_offset;
        Ok(())
    }

    fn write(&mut self, mut data: &[u8]) -> BulkLoadResult<()> {
        let empty = self.empty.clone();
        let chunk_size = self.chunk_size;
        let file = self.file()?;
        if file.position + data.len() as u64 > file.header.raw_capacity {
            return Err(TracedBulkLoadError::logic(format!(
                "write of {} bytes at {} past end of {:?}",
                data.len(),
                file.position,
                file.path
            )));
        }
        while !data.is_empty() {
            let idx = (file.position / chunk_size) as usize;
            let offset = (file.position % chunk_size) as usize;
            let chunk = file.load(idx, &empty)?;
            let n = (chunk.data.len() - offset).min(data.len());
            chunk.data[offset..offset + n].copy_from_slice(&data[..n]);
            chunk.dirty = true;
            data = &data[n..];
            file.position += n as u64;
        }
        Ok(())
    }

    fn read_at(&mut self, raw_offset: u64, len: usize) -> BulkLoadResult<Vec<u8>> {
        let empty = self.empty.clone();
        let chunk_size = self.chunk_size;
        let file = self.file()?;
        if raw_offset + len as u64 > file.header.raw_capacity {
            return Err(TracedBulkLoadError::logic(format!(
                "read of {len} bytes at {raw_offset} past end of {:?}",
                file.path
            )));
        }
        let mut out = Vec::with_capacity(len);
        let mut pos = raw_offset;
        while out.len() < len {
            let idx = (pos / chunk_size) as usize;
            let offset = (pos % chunk_size) as usize;
            let chunk = file.load(idx, &empty)?;
            let n = (chunk.data.len() - offset).min(len - out.len());
            out.extend_from_slice(&chunk.data[offset..offset + n]);
            pos += n as u64;
        }
        Ok(out)
    }

    fn extend(&mut self, raw_bytes: u64) -> BulkLoadResult<()> {
        let empty = self.empty.clone();
        let file = self.file()?;
        let capacity = file.header.raw_capacity + raw_bytes;
        Self::set_capacity(&mut file.header, capacity)?;
        if let Some(cached) = file.cache.as_mut() {
            let raw_len = file.header.chunk_raw_len(cached.idx);
            if cached.data.len() < raw_len {
                let tail = raw_len - cached.data.len();
                cached.data.extend(fill_pattern(&empty, tail));
                cached.dirty = true;
            }
        }
        file.header_dirty = true;
        Ok(())
    }

    fn flush(&mut self) -> BulkLoadResult<()> {
        let file = self.file()?;
        file.store_cached()?;
        if file.header_dirty {
            file.write_header()?;
        }
        file.file.flush().map_err(file.io("flush"))
    }

    fn close(&mut self, flush: bool) -> BulkLoadResult<()> {
        if !flush {
            self.file = None;
            return Ok(());
        }
        if self.file.is_none() {
            return Ok(());
        }
        self.flush()?;
        if let Some(file) = self.file.take() {
            if self.sync_on_close {
                file.file.sync_data().map_err(file.io("sync"))?;
            }
        }
        Ok(())
    }
}
