// This file is part of Vigil NVR, a security camera network video recorder.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The Metadata Store: parallel storage for JSON blobs keyed by stream tag
//! and timestamp, co-located with a camera's Storage File.
//!
//! Unlike the Storage File, entries here are immutable and unbounded by a
//! block ring; the store is an append-only log plus an in-memory index,
//! persisted the same way the Storage Catalog is (whole-index JSON sidecar,
//! rewritten after every mutation).

use base::Error;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Mutex;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
struct IndexEntry {
    stream_tag: String,
    timestamp_ms: i64,
    offset: u64,
    len: u32,
}

pub struct MetadataEntry {
    pub stream_tag: String,
    pub timestamp_ms: i64,
    pub blob: Vec<u8>,
}

struct Inner {
    file: File,
    log_len: u64,
    index: BTreeMap<(String, i64), IndexEntry>,
}

/// Appends JSON blobs to a log file and indexes them in memory by
/// `(stream_tag, timestamp_ms)` for range queries.
pub struct MetadataStore {
    inner: Mutex<Inner>,
    index_path: std::path::PathBuf,
}

impl MetadataStore {
    pub fn create(log_path: &Path, index_path: &Path) -> Result<Self, Error> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(log_path)?;
        Ok(MetadataStore {
            inner: Mutex::new(Inner { file, log_len: 0, index: BTreeMap::new() }),
            index_path: index_path.to_path_buf(),
        })
    }

    pub fn open(log_path: &Path, index_path: &Path) -> Result<Self, Error> {
        let file = OpenOptions::new().read(true).write(true).open(log_path)?;
        let log_len = file.metadata()?.len();
        let index = if index_path.exists() {
            let mut buf = Vec::new();
            File::open(index_path)?.read_to_end(&mut buf)?;
            if buf.is_empty() {
                BTreeMap::new()
            } else {
                let entries: Vec<IndexEntry> =
                    serde_json::from_slice(&buf).map_err(|e| Error::wrap(base::ErrorKind::Internal, e))?;
                entries
                    .into_iter()
                    .map(|e| ((e.stream_tag.clone(), e.timestamp_ms), e))
                    .collect()
            }
        } else {
            BTreeMap::new()
        };
        Ok(MetadataStore {
            inner: Mutex::new(Inner { file, log_len, index }),
            index_path: index_path.to_path_buf(),
        })
    }

    pub fn append(&self, stream_tag: &str, timestamp_ms: i64, blob: &[u8]) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        let offset = inner.log_len;
        inner.file.seek(SeekFrom::Start(offset))?;
        inner.file.write_all(blob)?;
        inner.file.sync_data()?;
        inner.log_len += blob.len() as u64;

        let entry = IndexEntry {
            stream_tag: stream_tag.to_string(),
            timestamp_ms,
            offset,
            len: blob.len() as u32,
        };
        inner.index.insert((stream_tag.to_string(), timestamp_ms), entry);
        self.persist_index(&mut inner)?;
        Ok(())
    }

    pub fn query(&self, stream_tag: &str, start_ms: i64, end_ms: i64) -> Result<Vec<MetadataEntry>, Error> {
        let mut inner = self.inner.lock().unwrap();
        let matches: Vec<IndexEntry> = inner
            .index
            .range((stream_tag.to_string(), start_ms)..(stream_tag.to_string(), end_ms))
            .map(|(_, e)| e.clone())
            .collect();

        let mut out = Vec::with_capacity(matches.len());
        for e in matches {
            let mut buf = vec![0u8; e.len as usize];
            inner.file.seek(SeekFrom::Start(e.offset))?;
            inner.file.read_exact(&mut buf)?;
            out.push(MetadataEntry {
                stream_tag: e.stream_tag,
                timestamp_ms: e.timestamp_ms,
                blob: buf,
            });
        }
        Ok(out)
    }

    fn persist_index(&self, inner: &mut Inner) -> Result<(), Error> {
        let all: Vec<&IndexEntry> = inner.index.values().collect();
        let bytes = serde_json::to_vec(&all).map_err(|e| Error::wrap(base::ErrorKind::Internal, e))?;
        let tmp_path = self.index_path.with_extension("tmp");
        {
            let mut tmp = File::create(&tmp_path)?;
            tmp.write_all(&bytes)?;
            tmp.sync_all()?;
        }
        std::fs::rename(&tmp_path, &self.index_path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn appends_and_queries_by_range() {
        let dir = tempdir().unwrap();
        let log_path = dir.path().join("meta.log");
        let index_path = dir.path().join("meta.idx");
        let store = MetadataStore::create(&log_path, &index_path).unwrap();

        store.append("video", 1_000, br#"{"label":"a"}"#).unwrap();
        store.append("video", 2_000, br#"{"label":"b"}"#).unwrap();
        store.append("audio", 1_500, br#"{"label":"c"}"#).unwrap();

        let hits = store.query("video", 0, 3_000).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].blob, br#"{"label":"a"}"#);

        let reopened = MetadataStore::open(&log_path, &index_path).unwrap();
        let hits2 = reopened.query("video", 0, 3_000).unwrap();
        assert_eq!(hits2.len(), 2);
    }
}
