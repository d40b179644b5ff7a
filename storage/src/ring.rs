// This file is part of Vigil NVR, a security camera network video recorder.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The Ring File: a fixed-capacity circular byte file for time-indexed
//! fixed-width records (motion flags, motion events).
//!
//! Slot `idx(t) = ((t - created_at) seconds) mod element_count`. A record's
//! slot is derived purely from its timestamp, so writes and queries never
//! need a separate position index.

use base::{bail_t, Error};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fs::{File, OpenOptions};
use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Mutex;

const MAGIC: &[u8; 4] = b"VGLR";
const VERSION: u32 = 1;
const HEADER_LEN: u64 = 32;

struct Inner {
    file: File,
    element_size: u32,
    element_count: u32,
    created_at_s: i64,
    last_write_idx: i64,
}

/// A fixed-size circular file of `element_count` records of `element_size`
/// bytes each, addressed by wall-clock second.
pub struct RingFile {
    inner: Mutex<Inner>,
}

/// One-byte motion flag record: non-zero means motion was present during
/// that second.
pub const MOTION_FLAG_SIZE: u32 = 1;

/// 11-byte motion event record: 8-byte ts (unused; the slot already encodes
/// time, this is kept for direct-dump diagnostics) + motion + avg_motion +
/// stddev, each one byte, quantized to `0..=255`.
pub const MOTION_EVENT_SIZE: u32 = 11;

impl RingFile {
    pub fn allocate(path: &Path, element_size: u32, element_count: u32, created_at_s: i64) -> Result<Self, Error> {
        if element_size == 0 || element_count == 0 {
            bail_t!(InvalidArgument, "element_size/element_count out of range");
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        let total_len = HEADER_LEN + u64::from(element_size) * u64::from(element_count);
        file.set_len(total_len)?;
        write_header(&mut file, element_size, element_count, created_at_s, -1)?;
        file.sync_all()?;
        Ok(RingFile {
            inner: Mutex::new(Inner {
                file,
                element_size,
                element_count,
                created_at_s,
                last_write_idx: -1,
            }),
        })
    }

    pub fn open(path: &Path) -> Result<Self, Error> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        let (element_size, element_count, created_at_s, last_write_idx) = read_header(&mut file)?;
        Ok(RingFile {
            inner: Mutex::new(Inner {
                file,
                element_size,
                element_count,
                created_at_s,
                last_write_idx,
            }),
        })
    }

    fn idx(&self, created_at_s: i64, element_count: u32, tp_s: i64) -> i64 {
        (tp_s - created_at_s).rem_euclid(i64::from(element_count))
    }

    /// Writes `bytes` (must be exactly `element_size` long) at the slot for
    /// wall-clock second `tp_s`.
    pub fn write(&self, tp_s: i64, bytes: &[u8]) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        if bytes.len() as u32 != inner.element_size {
            bail_t!(InvalidArgument, "record length {} != element_size {}", bytes.len(), inner.element_size);
        }
        let idx = self.idx(inner.created_at_s, inner.element_count, tp_s);
        let offset = HEADER_LEN + idx as u64 * u64::from(inner.element_size);
        inner.file.seek(SeekFrom::Start(offset))?;
        inner.file.write_all(bytes)?;
        inner.last_write_idx = idx;
        let (es, ec, ca) = (inner.element_size, inner.element_count, inner.created_at_s);
        write_header(&mut inner.file, es, ec, ca, idx)?;
        Ok(())
    }

    /// Iterates records whose slot falls in `[qs_s, qe_s)` in wall-time
    /// order, honoring wrap-around, invoking `cb(slot_time_s, bytes)`.
    /// Rejects `qs_s` older than the retained window or `qe_s` in the
    /// future relative to the last write.
    pub fn query(&self, qs_s: i64, qe_s: i64, now_s: i64, mut cb: impl FnMut(i64, &[u8])) -> Result<(), Error> {
        let raw = self.query_raw(qs_s, qe_s, now_s)?;
        for (i, chunk) in raw.chunks(self.element_size_unlocked()).enumerate() {
            cb(qs_s + i as i64, chunk);
        }
        Ok(())
    }

    fn element_size_unlocked(&self) -> usize {
        self.inner.lock().unwrap().element_size as usize
    }

    /// Returns the raw bytes for `[qs_s, qe_s)`, concatenated in wall-time
    /// order (i.e. de-wrapped), one `element_size` chunk per second.
    pub fn query_raw(&self, qs_s: i64, qe_s: i64, now_s: i64) -> Result<Vec<u8>, Error> {
        if qe_s <= qs_s {
            bail_t!(InvalidArgument, "qe_s must be greater than qs_s");
        }
        if qe_s > now_s {
            bail_t!(InvalidArgument, "query end is in the future");
        }
        let mut inner = self.inner.lock().unwrap();
        let window_start = now_s - i64::from(inner.element_count);
        if qs_s < window_start {
            bail_t!(OutOfRange, "query start is older than the retained window");
        }

        let mut out = Vec::with_capacity(((qe_s - qs_s) * i64::from(inner.element_size)) as usize);
        let mut buf = vec![0u8; inner.element_size as usize];
        for t in qs_s..qe_s {
            let idx = self.idx(inner.created_at_s, inner.element_count, t);
            let offset = HEADER_LEN + idx as u64 * u64::from(inner.element_size);
            inner.file.seek(SeekFrom::Start(offset))?;
            inner.file.read_exact(&mut buf)?;
            out.extend_from_slice(&buf);
        }
        Ok(out)
    }

    pub fn created_at_s(&self) -> i64 {
        self.inner.lock().unwrap().created_at_s
    }

    pub fn element_count(&self) -> u32 {
        self.inner.lock().unwrap().element_count
    }
}

fn write_header(file: &mut File, element_size: u32, element_count: u32, created_at_s: i64, last_write_idx: i64) -> Result<(), Error> {
    let mut buf = [0u8; HEADER_LEN as usize];
    {
        let mut c = Cursor::new(&mut buf[..]);
        c.write_all(MAGIC)?;
        c.write_u32::<LittleEndian>(VERSION)?;
        c.write_u32::<LittleEndian>(element_size)?;
        c.write_u32::<LittleEndian>(element_count)?;
        c.write_i64::<LittleEndian>(created_at_s)?;
        c.write_i64::<LittleEndian>(last_write_idx)?;
    }
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&buf)?;
    Ok(())
}

fn read_header(file: &mut File) -> Result<(u32, u32, i64, i64), Error> {
    let mut buf = [0u8; HEADER_LEN as usize];
    file.seek(SeekFrom::Start(0))?;
    file.read_exact(&mut buf)?;
    let mut c = Cursor::new(&buf[..]);
    let mut magic = [0u8; 4];
    c.read_exact(&mut magic)?;
    if &magic != MAGIC {
        bail_t!(InvalidArgument, "not a ring file (bad magic)");
    }
    let version = c.read_u32::<LittleEndian>()?;
    if version != VERSION {
        bail_t!(InvalidArgument, "unsupported ring file version {}", version);
    }
    let element_size = c.read_u32::<LittleEndian>()?;
    let element_count = c.read_u32::<LittleEndian>()?;
    let created_at_s = c.read_i64::<LittleEndian>()?;
    let last_write_idx = c.read_i64::<LittleEndian>()?;
    Ok((element_size, element_count, created_at_s, last_write_idx))
}

/// Packs a motion event record's three quantized byte fields (motion
/// present, average motion, standard deviation) with a leading 8-byte
/// timestamp, matching the Ring Record layout in the data model.
pub fn encode_motion_event(ts_ms: i64, motion: u8, avg_motion: u8, stddev: u8) -> [u8; MOTION_EVENT_SIZE as usize] {
    let mut buf = [0u8; MOTION_EVENT_SIZE as usize];
    buf[0..8].copy_from_slice(&ts_ms.to_le_bytes());
    buf[8] = motion;
    buf[9] = avg_motion;
    buf[10] = stddev;
    buf
}

pub fn decode_motion_event(buf: &[u8]) -> (i64, u8, u8, u8) {
    let mut ts_bytes = [0u8; 8];
    ts_bytes.copy_from_slice(&buf[0..8]);
    (i64::from_le_bytes(ts_bytes), buf[8], buf[9], buf[10])
}

/// Coalesces a set of per-second significant timestamps into contiguous
/// `[start_s, end_s]` segments, tolerating gaps of up to `max_gap_s`
/// seconds within one segment. Shared by the motion-event and
/// content-segment endpoints, both of which reduce a set of "interesting"
/// per-second timestamps to a small list of ranges.
pub fn coalesce_segments(mut significant_s: Vec<i64>, max_gap_s: i64) -> Vec<(i64, i64)> {
    significant_s.sort_unstable();
    significant_s.dedup();
    let mut out = Vec::new();
    let mut iter = significant_s.into_iter();
    let first = match iter.next() {
        Some(t) => t,
        None => return out,
    };
    let mut start = first;
    let mut end = first;
    for t in iter {
        if t - end > max_gap_s {
            out.push((start, end));
            start = t;
        }
        end = t;
    }
    out.push((start, end));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn writes_and_queries_in_order() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("motion.ring");
        let ring = RingFile::allocate(&path, MOTION_FLAG_SIZE, 3600, 1_000_000).unwrap();

        for t in 1_000_000..1_000_010 {
            let motion = if t % 2 == 0 { 1u8 } else { 0u8 };
            ring.write(t, &[motion]).unwrap();
        }

        let raw = ring.query_raw(1_000_000, 1_000_010, 1_000_020).unwrap();
        assert_eq!(raw.len(), 10);
        assert_eq!(raw[0], 1);
        assert_eq!(raw[1], 0);
    }

    #[test]
    fn rejects_out_of_window_and_future_queries() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("motion.ring");
        let ring = RingFile::allocate(&path, MOTION_FLAG_SIZE, 100, 0).unwrap();

        assert!(ring.query_raw(-50, 10, 200).is_err());
        assert!(ring.query_raw(0, 300, 200).is_err());
    }

    #[test]
    fn wraps_around_the_ring() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("motion.ring");
        let ring = RingFile::allocate(&path, MOTION_FLAG_SIZE, 10, 0).unwrap();
        for t in 0..25 {
            ring.write(t, &[(t % 256) as u8]).unwrap();
        }
        // Only the last 10 seconds are still resident; slot 15..25 maps
        // onto the same 10 physical slots as slot 5..15 did.
        let raw = ring.query_raw(15, 25, 25).unwrap();
        for (i, b) in raw.iter().enumerate() {
            assert_eq!(*b, ((15 + i) % 256) as u8);
        }
    }

    #[test]
    fn motion_event_round_trips() {
        let buf = encode_motion_event(1_700_000_000_000, 1, 42, 7);
        assert_eq!(decode_motion_event(&buf), (1_700_000_000_000, 1, 42, 7));
    }

    #[test]
    fn coalesces_adjacent_and_near_adjacent_timestamps() {
        let segs = coalesce_segments(vec![10, 11, 12, 20, 21, 40], 1);
        assert_eq!(segs, vec![(10, 12), (20, 21), (40, 40)]);
    }

    #[test]
    fn coalesce_handles_empty_input() {
        assert_eq!(coalesce_segments(vec![], 1), vec![]);
    }
}
