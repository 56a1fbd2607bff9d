// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use super::{fill_pattern, SegmentFileBackend};
use crate::bulk::{BulkLoadResult, TracedBulkLoadError};

const FILL_CHUNK: usize = 64 * (1 << 10);

struct OpenFile {
    path: PathBuf,
    writer: BufWriter<File>,
    len: u64,
    position: u64,
}

/// Uncompressed segment file: raw bytes are physical bytes.
pub struct RawBackend {
    empty: Vec<u8>,
    sync_on_close: bool,
    file: Option<OpenFile>,
}

impl RawBackend {
    pub fn new(empty: Vec<u8>, sync_on_close: bool) -> Self {
        Self {
            empty,
            sync_on_close,
            file: None,
        }
    }

    fn file(&mut self) -> BulkLoadResult<&mut OpenFile> {
        self.file
            .as_mut()
            .ok_or_else(|| TracedBulkLoadError::logic("segment file is not open"))
    }

    /// Writes `len` empty values at the end of the file.
    fn append_empty(&mut self, len: u64) -> BulkLoadResult<()> {
        let fill = fill_pattern(&self.empty, FILL_CHUNK.min(len as usize));
        let file = self.file()?;
        let path = file.path.clone();
        file.writer
            .seek(SeekFrom::Start(file.len))
            .map_err(|e| TracedBulkLoadError::io("seek", &path, e))?;
        let mut remaining = len;
        while remaining > 0 {
            let n = remaining.min(fill.len() as u64) as usize;
            file.writer
                .write_all(&fill[..n])
                .map_err(|e| TracedBulkLoadError::io("extend", &path, e))?;
            remaining -= n as u64;
        }
        file.len += len;
        file.writer
            .seek(SeekFrom::Start(file.position))
            .map_err(|e| TracedBulkLoadError::io("seek", &path, e))?;
        Ok(())
    }
}

impl SegmentFileBackend for RawBackend {
    fn kind(&self) -> &'static str {
        "raw"
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
        self.file = Some(OpenFile {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
            len: 0,
            position: 0,
        });
        self.append_empty(raw_bytes)
    }

    fn open(&mut self, path: &Path) -> BulkLoadResult<()> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| TracedBulkLoadError::io("open", path, e))?;
        let len = file
            .metadata()
            .map_err(|e| TracedBulkLoadError::io("stat", path, e))?
            .len();
        self.file = Some(OpenFile {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
            len,
            position: 0,
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
        self.file.as_ref().map_or(0, |f| f.len)
    }

    fn physical_len(&self) -> BulkLoadResult<u64> {
        Ok(self.raw_len())
    }

    fn position(&self) -> u64 {
        self.file.as_ref().map_or(0, |f| f.position)
    }

    fn seek(&mut self, raw_offset: u64) -> BulkLoadResult<()> {
        let file = self.file()?;
        if raw_offset > file.len {
            return Err(TracedBulkLoadError::logic(format!(
                "seek to {raw_offset} past end of {:?} ({} bytes)",
                file.path, file.len
            )));
        }
        file.writer
            .seek(SeekFrom::Start(raw_offset))
            .map_err(|e| TracedBulkLoadError::io("seek", &file.path, e))?;
        file.position = raw_offset;
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> BulkLoadResult<()> {
        let file = self.file()?;
        if file.position + data.len() as u64 > file.len {
            return Err(TracedBulkLoadError::logic(format!(
                "write of {} bytes at {} past end of {:?}",
                data.len(),
                file.position,
                file.path
            )));
        }
        file.writer
            .write_all(data)
            .map_err(|e| TracedBulkLoadError::io("write", &file.path, e))?;
        file.position += data.len() as u64;
        Ok(())
    }

    fn read_at(&mut self, raw_offset: u64, len: usize) -> BulkLoadResult<Vec<u8>> {
        let file = self.file()?;
        let path = file.path.clone();
        let position = file.position;
        file.writer
            .flush()
            .map_err(|e| TracedBulkLoadError::io("flush", &path, e))?;
        let inner = file.writer.get_mut();
        let mut buf = vec![0; len];
        inner
            .seek(SeekFrom::Start(raw_offset))
            .and_then(|_| inner.read_exact(&mut buf))
            .and_then(|_| inner.seek(SeekFrom::Start(position)))
            .map_err(|e| TracedBulkLoadError::io("read", &path, e))?;
        Ok(buf)
    }

    fn extend(&mut self, raw_bytes: u64) -> BulkLoadResult<()> {
        self.append_empty(raw_bytes)
    }

    fn flush(&mut self) -> BulkLoadResult<()> {
        let file = self.file()?;
        file.writer
            .flush()
            .map_err(|e| TracedBulkLoadError::io("flush", &file.path, e))
    }

    fn close(&mut self, flush: bool) -> BulkLoadResult<()> {
        let Some(mut file) = self.file.take() else {
            return Ok(());
        };
        if !flush {
            // drop buffered bytes without writing them
            let _ = file.writer.into_parts();
            return Ok(());
        }
        file.writer
            .flush()
            .map_err(|e| TracedBulkLoadError::io("flush", &file.path, e))?;
        if self.sync_on_close {
            file.writer
                .get_ref()
                .sync_data()
                .map_err(|e| TracedBulkLoadError::io("sync", &file.path, e))?;
        }
        Ok(())
    }
}
