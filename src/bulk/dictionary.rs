// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

//! Dictionary stores of wide character columns. The column file only holds
//! 8-byte tokens; the strings themselves live in a store file that rotates
//! together with the column's segment file.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut};
use serde::Serialize;
use tracing::debug;

use super::{BulkLoadOptions, BulkLoadResult, TracedBulkLoadError};
use crate::types::{Hwm, Oid, PartitionId, SegmentId, VolumeId, NULL_TOKEN};

/// Identifies the store file paired with one column segment file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct DictionaryFileKey {
    pub oid: Oid,
    pub volume: VolumeId,
    pub partition: PartitionId,
    pub segment: SegmentId,
}

/// Blocks of one store file written by a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DictionaryBlocks {
    pub key: DictionaryFileKey,
    pub first_block: u64,
    pub last_block: u64,
}

pub trait DictionaryStore: Send {
    fn create(&mut self, key: DictionaryFileKey) -> BulkLoadResult<()>;

    fn open(&mut self, key: DictionaryFileKey) -> BulkLoadResult<()>;

    /// Key of the open store file.
    fn key(&self) -> Option<DictionaryFileKey>;

    /// Stores `values` and returns one token per value. Equal values share a
    /// token; `None` maps to [`NULL_TOKEN`].
    fn insert(&mut self, values: &[Option<&[u8]>]) -> BulkLoadResult<Vec<u64>>;

    /// HWM of the open store file.
    fn hwm(&self) -> Hwm;

    /// Blocks of the open store file written since it was opened, if any.
    fn written_blocks(&self) -> Option<DictionaryBlocks>;

    /// Closes the open store file and cuts it back to its length when it was
    /// opened.
    fn truncate(&mut self) -> BulkLoadResult<()>;

    fn flush(&mut self) -> BulkLoadResult<()>;

    /// Closes the store. With `flush == false` buffered values are dropped.
    fn close(&mut self, flush: bool) -> BulkLoadResult<()>;
}

pub fn path_of_dictionary_file(options: &BulkLoadOptions, key: &DictionaryFileKey) -> PathBuf {
    options
        .volume_path(key.volume)
        .join(key.oid.to_string())
        .join(key.partition.to_string())
        .join(format!("FILE{:03}.dct", key.segment))
}

struct OpenStore {
    key: DictionaryFileKey,
    path: PathBuf,
    writer: BufWriter<File>,
    /// Length of the file when it was opened.
    opened_len: u64,
    len: u64,
    tokens: HashMap<Vec<u8>, u64>,
}

/// Append-only store file of length-prefixed strings. A token is the offset
/// of the string's entry in the file.
///
/// ```plain
/// | len (u32) | bytes | len (u32) | bytes | ... |
/// ```
pub struct FileDictionaryStore {
    options: BulkLoadOptions,
    store: Option<OpenStore>,
}

impl FileDictionaryStore {
    pub fn new(options: BulkLoadOptions) -> Self {
        Self {
            options,
            store: None,
        }
    }

    fn store(&mut self) -> BulkLoadResult<&mut OpenStore> {
        self.store
            .as_mut()
            .ok_or_else(|| TracedBulkLoadError::logic("dictionary store is not open"))
    }

    fn load_tokens(path: &Path, file: &mut File) -> BulkLoadResult<HashMap<Vec<u8>, u64>> {
        let mut data = vec![];
        file.read_to_end(&mut data)
            .map_err(|e| TracedBulkLoadError::io("read", path, e))?;
        let mut tokens = HashMap::new();
        let mut buf = &data[..];
        let mut offset = 0u64;
        while buf.has_remaining() {
            if buf.remaining() < 4 {
                return Err(TracedBulkLoadError::decode("truncated dictionary entry"));
            }
            let len = buf.get_u32_le() as usize;
            if buf.remaining() < len {
                return Err(TracedBulkLoadError::decode("truncated dictionary entry"));
            }
            tokens.entry(buf[..len].to_vec()).or_insert(offset);
            buf.advance(len);
            offset += 4 + len as u64;
        }
        Ok(tokens)
    }
}

impl DictionaryStore for FileDictionaryStore {
    fn create(&mut self, key: DictionaryFileKey) -> BulkLoadResult<()> {
        let path = path_of_dictionary_file(&self.options, &key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| TracedBulkLoadError::io("create directory", parent, e))?;
        }
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| TracedBulkLoadError::io("create", &path, e))?;
        debug!(?key, "created dictionary store");
        self.store = Some(OpenStore {
            key,
            path,
            writer: BufWriter::new(file),
            opened_len: 0,
            len: 0,
            tokens: HashMap::new(),
        });
        Ok(())
    }

    fn open(&mut self, key: DictionaryFileKey) -> BulkLoadResult<()> {
        let path = path_of_dictionary_file(&self.options, &key);
        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .open(&path)
            .map_err(|e| TracedBulkLoadError::io("open", &path, e))?;
        let tokens = Self::load_tokens(&path, &mut file)?;
        let len = file
            .metadata()
            .map_err(|e| TracedBulkLoadError::io("stat", &path, e))?
            .len();
        self.store = Some(OpenStore {
            key,
            path,
            writer: BufWriter::new(file),
            opened_len: len,
            len,
            tokens,
        });
        Ok(())
    }

    fn key(&self) -> Option<DictionaryFileKey> {
        self.store.as_ref().map(|s| s.key)
    }

    fn insert(&mut self, values: &[Option<&[u8]>]) -> BulkLoadResult<Vec<u64>> {
        let store = self.store()?;
        let mut tokens = Vec::with_capacity(values.len());
        let mut entry = vec![];
        for value in values {
            let Some(value) = value else {
                tokens.push(NULL_TOKEN);
                continue;
            };
            if let Some(token) = store.tokens.get(*value) {
                tokens.push(*token);
                continue;
            }
            let token = store.len;
            entry.clear();
            entry.put_u32_le(value.len() as u32);
            entry.put_slice(value);
            store
                .writer
                .write_all(&entry)
                .map_err(|e| TracedBulkLoadError::io("write", &store.path, e))?;
            store.len += entry.len() as u64;
            store.tokens.insert(value.to_vec(), token);
            tokens.push(token);
        }
        Ok(tokens)
    }

    fn hwm(&self) -> Hwm {
        let block_size = self.options.block_size as u64;
        self.store
            .as_ref()
            .map_or(0, |s| s.len.saturating_sub(1) / block_size)
    }

    fn written_blocks(&self) -> Option<DictionaryBlocks> {
        let block_size = self.options.block_size as u64;
        let store = self.store.as_ref()?;
        (store.len > store.opened_len).then(|| DictionaryBlocks {
            key: store.key,
            first_block: store.opened_len / block_size,
            last_block: (store.len - 1) / block_size,
        })
    }

    fn truncate(&mut self) -> BulkLoadResult<()> {
        let Some(store) = self.store.take() else {
            return Ok(());
        };
        let (file, _) = store.writer.into_parts();
        file.set_len(store.opened_len)
            .map_err(|e| TracedBulkLoadError::io("truncate", &store.path, e))?;
        debug!(key = ?store.key, len = store.opened_len, "truncated dictionary store");
        Ok(())
    }

    fn flush(&mut self) -> BulkLoadResult<()> {
        let store = self.store()?;
        store
            .writer
            .flush()
            .map_err(|e| TracedBulkLoadError::io("flush", &store.path, e))
    }

    fn close(&mut self, flush: bool) -> BulkLoadResult<()> {
        let Some(mut store) = self.store.take() else {
            return Ok(());
        };
        if !flush {
            let _ = store.writer.into_parts();
            return Ok(());
        }
        store
            .writer
            .flush()
            .map_err(|e| TracedBulkLoadError::io("flush", &store.path, e))?;
        if self.options.sync_on_close {
            store
                .writer
                .get_ref()
                .sync_data()
                .map_err(|e| TracedBulkLoadError::io("sync", &store.path, e))?;
        }
        Ok(())
    }
}
