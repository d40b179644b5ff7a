// This file is part of Vigil NVR, a security camera network video recorder.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The Storage Catalog: an in-memory index from `(stream_tag, time range)`
//! to block id, persisted as a JSON sidecar inside the storage file.

use base::Error;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CatalogEntry {
    pub stream_tag: String,
    pub t_start: i64,
    pub t_end: i64,
    pub block_id: u32,
}

/// Keyed by `(stream_tag, t_start)` so a stream's blocks iterate in time
/// order and range queries can seek directly to the first plausible entry.
#[derive(Default)]
pub struct Catalog {
    entries: BTreeMap<(String, i64), CatalogEntry>,
    by_block: BTreeMap<u32, (String, i64)>,
}

impl Catalog {
    pub fn new() -> Self {
        Catalog::default()
    }

    pub fn insert(&mut self, e: CatalogEntry) {
        self.remove_block(e.block_id);
        self.by_block.insert(e.block_id, (e.stream_tag.clone(), e.t_start));
        self.entries.insert((e.stream_tag.clone(), e.t_start), e);
    }

    pub fn remove_block(&mut self, block_id: u32) {
        if let Some(key) = self.by_block.remove(&block_id) {
            self.entries.remove(&key);
        }
    }

    pub fn entry_for_block(&self, block_id: u32) -> Option<&CatalogEntry> {
        self.by_block.get(&block_id).and_then(|k| self.entries.get(k))
    }

    /// Entries for a stream tag whose range overlaps `[start_ms, end_ms]`, in
    /// time order.
    pub fn overlapping(&self, stream_tag: &str, start_ms: i64, end_ms: i64) -> Vec<&CatalogEntry> {
        self.entries
            .range((stream_tag.to_string(), i64::MIN)..(stream_tag.to_string(), i64::MAX))
            .map(|(_, e)| e)
            .filter(|e| e.t_start <= end_ms && e.t_end >= start_ms)
            .collect()
    }

    pub fn all_for(&self, stream_tag: &str) -> Vec<&CatalogEntry> {
        self.entries
            .range((stream_tag.to_string(), i64::MIN)..(stream_tag.to_string(), i64::MAX))
            .map(|(_, e)| e)
            .collect()
    }

    pub fn first_ts(&self, stream_tag: &str) -> Option<i64> {
        self.entries
            .range((stream_tag.to_string(), i64::MIN)..(stream_tag.to_string(), i64::MAX))
            .next()
            .map(|(_, e)| e.t_start)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        let all: Vec<&CatalogEntry> = self.entries.values().collect();
        serde_json::to_vec(&all).map_err(|e| Error::wrap(base::ErrorKind::Internal, e))
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, Error> {
        if buf.is_empty() {
            return Ok(Catalog::new());
        }
        let entries: Vec<CatalogEntry> =
            serde_json::from_slice(buf).map_err(|e| Error::wrap(base::ErrorKind::Internal, e))?;
        let mut cat = Catalog::new();
        for e in entries {
            cat.insert(e);
        }
        Ok(cat)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlap_query_and_round_trip() {
        let mut cat = Catalog::new();
        cat.insert(CatalogEntry { stream_tag: "video".into(), t_start: 0, t_end: 100, block_id: 0 });
        cat.insert(CatalogEntry { stream_tag: "video".into(), t_start: 100, t_end: 200, block_id: 1 });
        cat.insert(CatalogEntry { stream_tag: "audio".into(), t_start: 0, t_end: 200, block_id: 2 });

        let hits = cat.overlapping("video", 50, 150);
        assert_eq!(hits.len(), 2);
        assert_eq!(cat.first_ts("video"), Some(0));

        let bytes = cat.to_bytes().unwrap();
        let cat2 = Catalog::from_bytes(&bytes).unwrap();
        assert_eq!(cat2.overlapping("video", 50, 150).len(), 2);

        cat.remove_block(0);
        assert_eq!(cat.overlapping("video", 0, 200).len(), 1);
        assert_eq!(cat.first_ts("video"), Some(100));
    }
}
