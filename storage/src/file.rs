// This file is part of Vigil NVR, a security camera network video recorder.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The Storage File: a block-structured, bounded-retention archive of
//! variable-size media frames for one camera, with a catalog sidecar for
//! segment/block queries.

use base::{bail_t, Error, ErrorKind};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::collections::{HashMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Mutex;
use tracing::debug;

use crate::block::{
    index_offset, read_codec_info, read_index, write_codec_info, write_index_bytes, BlockHeader,
    BlockState, CodecInfo, StreamTag, BLOCK_HEADER_LEN,
};
use crate::catalog::{Catalog, CatalogEntry};
use crate::coding::{FrameEntry, FrameIndexEncoder};

pub use crate::block::MediaType;

const MAGIC: &[u8; 4] = b"VGLS";
const VERSION: u32 = 1;
const FILE_HEADER_LEN: u64 = 64;

/// How long a block may remain active before it is sealed regardless of
/// fill level, to keep catalog query granularity reasonable.
const DEFAULT_MAX_BLOCK_SPAN_MS: i64 = 3_600_000;

/// Floor for the inter-frame gap threshold used by `query_segments`, so a
/// single frame (no deltas to measure a median from) doesn't produce a
/// degenerate threshold of 0.
const MIN_GAP_THRESHOLD_MS: i64 = 2_000;

#[derive(Clone, Copy)]
pub struct MediaTypeMask {
    pub video: bool,
    pub audio: bool,
}

impl MediaTypeMask {
    pub const VIDEO_ONLY: MediaTypeMask = MediaTypeMask { video: true, audio: false };
    pub const BOTH: MediaTypeMask = MediaTypeMask { video: true, audio: true };
}

struct WriteCtxState {
    media_type: MediaType,
    codec: CodecInfo,
    active_block: Option<u32>,
    frames: FrameIndexEncoder,
    payload_cursor: u32,
    /// The last `pts_ms` accepted by `write_frame`, tracked independently of
    /// `frames` (which resets its own delta baseline on every block
    /// rotation) so monotonicity is enforced across the whole stream's
    /// lifetime, not just within one block.
    last_pts_ms: Option<i64>,
}

struct Inner {
    file: File,
    block_size: u32,
    block_count: u32,
    catalog_offset: u64,
    catalog_capacity: u64,
    headers: Vec<BlockHeader>,
    catalog: Catalog,
    /// Sealed block ids, oldest-sealed-first; the LRU eviction candidate is
    /// the front.
    sealed_lru: VecDeque<u32>,
    free_list: VecDeque<u32>,
    write_contexts: HashMap<StreamTag, WriteCtxState>,
    max_block_span_ms: i64,
}

/// A block-addressed media archive for one camera's `video`/`audio` streams.
pub struct StorageFile {
    inner: Mutex<Inner>,
}

impl StorageFile {
    /// Creates and pre-sizes a new storage file. Fails if `path` exists.
    pub fn allocate(path: &Path, block_size: u32, block_count: u32) -> Result<Self, Error> {
        if block_size < 4096 || block_count == 0 {
            bail_t!(InvalidArgument, "block_size/block_count out of range");
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;

        let catalog_offset = FILE_HEADER_LEN + u64::from(block_size) * u64::from(block_count);
        let catalog_capacity = (u64::from(block_count) * 256).max(64 * 1024);
        let total_len = catalog_offset + catalog_capacity;
        file.set_len(total_len)?;

        write_file_header(&mut file, block_size, block_count, catalog_offset, 0)?;
        file.sync_all()?;

        let mut headers = Vec::with_capacity(block_count as usize);
        let mut free_list = VecDeque::with_capacity(block_count as usize);
        for i in 0..block_count {
            headers.push(BlockHeader::free());
            free_list.push_back(i);
        }

        Ok(StorageFile {
            inner: Mutex::new(Inner {
                file,
                block_size,
                block_count,
                catalog_offset,
                catalog_capacity,
                headers,
                catalog: Catalog::new(),
                sealed_lru: VecDeque::new(),
                free_list,
                write_contexts: HashMap::new(),
                max_block_span_ms: DEFAULT_MAX_BLOCK_SPAN_MS,
            }),
        })
    }

    /// Opens a previously-allocated storage file, rebuilding in-memory state
    /// from block headers and the catalog sidecar. A block found `Active`
    /// (a crash mid-block) is discarded back to the free list: its frame
    /// index was never persisted, so its payload cannot be recovered.
    pub fn open(path: &Path) -> Result<Self, Error> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        let (block_size, block_count, catalog_offset, catalog_len) = read_file_header(&mut file)?;

        let mut headers = Vec::with_capacity(block_count as usize);
        let mut free_list = VecDeque::new();
        let mut sealed: Vec<u32> = Vec::new();
        for i in 0..block_count {
            let offset = FILE_HEADER_LEN + u64::from(i) * u64::from(block_size);
            file.seek(SeekFrom::Start(offset))?;
            let mut hdr = BlockHeader::read_from(&mut file)?;
            match hdr.state {
                BlockState::Free => free_list.push_back(i),
                BlockState::Active => {
                    hdr = BlockHeader::free();
                    free_list.push_back(i);
                }
                BlockState::Sealed => sealed.push(i),
            }
            headers.push(hdr);
        }
        sealed.sort_by_key(|&id| headers[id as usize].t_start);

        let mut catalog_buf = vec![0u8; catalog_len as usize];
        file.seek(SeekFrom::Start(catalog_offset))?;
        file.read_exact(&mut catalog_buf)?;
        let catalog = Catalog::from_bytes(&catalog_buf)?;

        let catalog_capacity = {
            let total = file.metadata()?.len();
            total.saturating_sub(catalog_offset)
        };

        Ok(StorageFile {
            inner: Mutex::new(Inner {
                file,
                block_size,
                block_count,
                catalog_offset,
                catalog_capacity,
                headers,
                catalog,
                sealed_lru: sealed.into(),
                free_list,
                write_contexts: HashMap::new(),
                max_block_span_ms: DEFAULT_MAX_BLOCK_SPAN_MS,
            }),
        })
    }

    pub fn create_write_context(
        &self,
        stream_tag: &str,
        codec: CodecInfo,
        media_type: MediaType,
    ) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        let tag = StreamTag::new(stream_tag);
        if inner.write_contexts.contains_key(&tag) {
            bail_t!(FailedPrecondition, "stream tag {} already has a write context", stream_tag);
        }
        inner.write_contexts.insert(
            tag,
            WriteCtxState {
                media_type,
                codec,
                active_block: None,
                frames: FrameIndexEncoder::new(),
                payload_cursor: 0,
                last_pts_ms: None,
            },
        );
        Ok(())
    }

    /// Drops a write context, releasing the stream tag (without sealing any
    /// in-progress block; a fresh context reclaims it as Active again).
    pub fn close_write_context(&self, stream_tag: &str) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        let tag = StreamTag::new(stream_tag);
        if let Some(ctx) = inner.write_contexts.remove(&tag) {
            if let Some(block_id) = ctx.active_block {
                Self::seal_block(&mut inner, block_id)?;
            }
        }
        Ok(())
    }

    pub fn write_frame(
        &self,
        stream_tag: &str,
        bytes: &[u8],
        key: bool,
        pts_ms: i64,
    ) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        let tag = StreamTag::new(stream_tag);
        let index_off = index_offset(inner.block_size);

        // Reject a non-monotone write at the contract boundary, before any
        // state is touched: a write context must exist, and pts_ms must not
        // regress behind the last frame this context accepted.
        match inner.write_contexts.get(&tag) {
            None => bail_t!(FailedPrecondition, "no write context for stream tag {}", stream_tag),
            Some(ctx) => {
                if let Some(last) = ctx.last_pts_ms {
                    if pts_ms < last {
                        bail_t!(
                            InvalidArgument,
                            "pts_ms {} is less than last written pts_ms {} for stream tag {}",
                            pts_ms,
                            last,
                            stream_tag
                        );
                    }
                }
            }
        }

        // Seal for policy (b): the active block's oldest frame is too old
        // relative to this new frame.
        if let Some(ctx) = inner.write_contexts.get(&tag) {
            if let Some(block_id) = ctx.active_block {
                let t_start = inner.headers[block_id as usize].t_start;
                if pts_ms - t_start > inner.max_block_span_ms {
                    Self::seal_block(&mut inner, block_id)?;
                    inner.write_contexts.get_mut(&tag).unwrap().active_block = None;
                }
            }
        }

        if inner.write_contexts[&tag].active_block.is_none() {
            Self::activate_block(&mut inner, &tag)?;
        }

        // Seal for policy (a): this frame would overflow the active block.
        let needs_seal = {
            let ctx = &inner.write_contexts[&tag];
            ctx.payload_cursor as u64 + bytes.len() as u64 > u64::from(index_off)
        };
        if needs_seal {
            let block_id = inner.write_contexts[&tag].active_block.unwrap();
            Self::seal_block(&mut inner, block_id)?;
            inner.write_contexts.get_mut(&tag).unwrap().active_block = None;
            Self::activate_block(&mut inner, &tag)?;
        }

        let block_id = inner.write_contexts[&tag].active_block.unwrap();
        let block_offset = FILE_HEADER_LEN + u64::from(block_id) * u64::from(inner.block_size);
        let payload_cursor = inner.write_contexts[&tag].payload_cursor;

        inner
            .file
            .seek(SeekFrom::Start(block_offset + u64::from(payload_cursor)))?;
        inner.file.write_all(bytes)?;

        {
            let hdr = &mut inner.headers[block_id as usize];
            if hdr.frame_count == 0 {
                hdr.t_start = pts_ms;
            }
            hdr.t_end = pts_ms;
            hdr.frame_count += 1;
        }

        let ctx = inner.write_contexts.get_mut(&tag).unwrap();
        ctx.frames.add(FrameEntry {
            ts_ms: pts_ms,
            offset: payload_cursor,
            size: bytes.len() as u32,
            key,
        });
        ctx.payload_cursor += bytes.len() as u32;
        ctx.last_pts_ms = Some(pts_ms);

        Ok(())
    }

    fn activate_block(inner: &mut Inner, tag: &StreamTag) -> Result<(), Error> {
        let block_id = if let Some(id) = inner.free_list.pop_front() {
            id
        } else if let Some(id) = inner.sealed_lru.pop_front() {
            debug!(block_id = id, stream_tag = tag.as_str(), "reclaiming oldest sealed block");
            inner.catalog.remove_block(id);
            id
        } else {
            bail_t!(ResourceExhausted, "storage file has no blocks to allocate");
        };

        let codec = inner.write_contexts[tag].codec.clone();

        let hdr = BlockHeader {
            state: BlockState::Active,
            stream_tag: *tag,
            t_start: 0,
            t_end: 0,
            frame_count: 0,
            next_free: -1,
        };
        let block_offset = FILE_HEADER_LEN + u64::from(block_id) * u64::from(inner.block_size);
        let mut block_buf = vec![0u8; inner.block_size as usize];
        hdr.write_to(&mut Cursor::new(&mut block_buf[..BLOCK_HEADER_LEN]))?;
        let payload_start = write_codec_info(&mut block_buf, &codec)?;

        inner.file.seek(SeekFrom::Start(block_offset))?;
        inner.file.write_all(&block_buf[..payload_start as usize])?;

        inner.headers[block_id as usize] = hdr;
        let ctx = inner.write_contexts.get_mut(tag).unwrap();
        ctx.active_block = Some(block_id);
        ctx.frames = FrameIndexEncoder::new();
        ctx.payload_cursor = payload_start;
        Ok(())
    }

    fn seal_block(inner: &mut Inner, block_id: u32) -> Result<(), Error> {
        let tag = inner.headers[block_id as usize].stream_tag;
        let ctx = inner
            .write_contexts
            .get_mut(&tag)
            .expect("sealing a block always has an owning write context");
        let count = ctx.frames.count();
        let encoded = std::mem::replace(&mut ctx.frames, FrameIndexEncoder::new()).into_bytes();
        debug!(block_id, stream_tag = tag.as_str(), frame_count = count, "sealing block");

        let block_offset = FILE_HEADER_LEN + u64::from(block_id) * u64::from(inner.block_size);
        let idx_off = index_offset(inner.block_size);
        let mut tail = vec![0u8; (inner.block_size - idx_off) as usize];
        write_index_bytes(&mut tail, 0, count, &encoded)?;
        inner.file.seek(SeekFrom::Start(block_offset + u64::from(idx_off)))?;
        inner.file.write_all(&tail)?;

        let hdr = &mut inner.headers[block_id as usize];
        hdr.state = BlockState::Sealed;
        inner.file.seek(SeekFrom::Start(block_offset))?;
        hdr.write_to(&mut inner.file)?;

        inner.catalog.insert(CatalogEntry {
            stream_tag: tag.as_str().to_string(),
            t_start: hdr.t_start,
            t_end: hdr.t_end,
            block_id,
        });
        inner.sealed_lru.push_back(block_id);
        persist_catalog(inner)?;
        Ok(())
    }

    fn read_block_frames(inner: &mut Inner, block_id: u32) -> Result<(CodecInfo, Vec<FrameEntry>), Error> {
        let block_offset = FILE_HEADER_LEN + u64::from(block_id) * u64::from(inner.block_size);
        let mut buf = vec![0u8; inner.block_size as usize];
        inner.file.seek(SeekFrom::Start(block_offset))?;
        inner.file.read_exact(&mut buf)?;
        let (codec, _payload_start) = read_codec_info(&buf)?;
        let idx_off = index_offset(inner.block_size);
        // FrameIndexEncoder always delta-codes from a baseline of 0 (see
        // its `last_ts` initializer), regardless of the block's actual
        // t_start, so decoding must use the same baseline.
        let frames = read_index(&buf, idx_off, 0)?;
        Ok((codec, frames))
    }

    pub fn first_ts(&self, stream_tag: &str) -> Option<i64> {
        let inner = self.inner.lock().unwrap();
        inner.catalog.first_ts(stream_tag)
    }

    pub fn query_blocks(&self, stream_tag: &str, start_ms: i64, end_ms: i64) -> Vec<(i64, i64, u32)> {
        let inner = self.inner.lock().unwrap();
        inner
            .catalog
            .overlapping(stream_tag, start_ms, end_ms)
            .into_iter()
            .map(|e| (e.t_start, e.t_end, e.block_id))
            .collect()
    }

    pub fn query_segments(&self, start_ms: i64, end_ms: i64) -> Result<Vec<(i64, i64)>, Error> {
        if end_ms <= start_ms {
            bail_t!(InvalidArgument, "end_ms must be greater than start_ms");
        }
        let mut inner = self.inner.lock().unwrap();
        let mut blocks = inner.catalog.overlapping(StreamTag::VIDEO, start_ms, end_ms);
        blocks.sort_by_key(|e| e.t_start);
        let block_ids: Vec<u32> = blocks.iter().map(|e| e.block_id).collect();
        drop(blocks);

        let mut frames: Vec<i64> = Vec::new();
        for id in block_ids {
            let (_codec, fs) = Self::read_block_frames(&mut inner, id)?;
            frames.extend(fs.into_iter().map(|f| f.ts_ms));
        }
        frames.sort_unstable();
        if frames.is_empty() {
            return Ok(Vec::new());
        }

        let mut deltas: Vec<i64> = frames.windows(2).map(|w| w[1] - w[0]).filter(|&d| d > 0).collect();
        let threshold = if deltas.is_empty() {
            MIN_GAP_THRESHOLD_MS
        } else {
            deltas.sort_unstable();
            let median = deltas[deltas.len() / 2];
            ((median as f64) * 1.25) as i64
        }
        .max(MIN_GAP_THRESHOLD_MS);

        let mut segments = Vec::new();
        let mut seg_start = frames[0];
        let mut seg_end = frames[0];
        for &ts in &frames[1..] {
            if ts - seg_end > threshold {
                segments.push((seg_start, seg_end));
                seg_start = ts;
            }
            seg_end = ts;
        }
        segments.push((seg_start, seg_end));

        Ok(segments
            .into_iter()
            .filter(|&(a, b)| a <= end_ms && b >= start_ms)
            .map(|(a, b)| (a.max(start_ms), b.min(end_ms)))
            .collect())
    }

    /// Returns decoded frames for `stream_tag` overlapping `[start_ms,
    /// end_ms]`, walking back one extra block so a caller that needs a
    /// leading key frame can find one even if it falls just outside range.
    fn frames_in_range(
        inner: &mut Inner,
        stream_tag: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<(Option<CodecInfo>, Vec<(u32, FrameEntry)>), Error> {
        let mut entries = inner.catalog.all_for(stream_tag);
        entries.sort_by_key(|e| e.t_start);
        let mut block_ids: Vec<u32> = Vec::new();
        let mut last_codec = None;
        for (i, e) in entries.iter().enumerate() {
            if e.t_end >= start_ms && e.t_start <= end_ms {
                if block_ids.is_empty() && i > 0 {
                    block_ids.push(entries[i - 1].block_id);
                }
                block_ids.push(e.block_id);
            }
        }
        let mut out = Vec::new();
        for id in block_ids {
            let (codec, frames) = Self::read_block_frames(inner, id)?;
            last_codec = Some(codec);
            for f in frames {
                out.push((id, f));
            }
        }
        out.sort_by_key(|(_, f)| f.ts_ms);
        Ok((last_codec, out))
    }

    pub fn query(
        &self,
        mask: MediaTypeMask,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<crate::blobtree::Node, Error> {
        if end_ms <= start_ms {
            bail_t!(InvalidArgument, "end_ms must be greater than start_ms");
        }
        let mut inner = self.inner.lock().unwrap();

        let (video_codec, video_frames) = if mask.video {
            Self::frames_in_range(&mut inner, StreamTag::VIDEO, start_ms, end_ms)?
        } else {
            (None, Vec::new())
        };
        let (audio_codec, audio_frames) = if mask.audio {
            Self::frames_in_range(&mut inner, StreamTag::AUDIO, start_ms, end_ms)?
        } else {
            (None, Vec::new())
        };

        // Walk back to the most recent key frame at or before start_ms.
        let mut video_frames = video_frames;
        if let Some(key_idx) = video_frames
            .iter()
            .position(|(_, f)| f.ts_ms >= start_ms)
        {
            let mut start_idx = key_idx;
            while start_idx > 0 && !video_frames[start_idx].1.key {
                start_idx -= 1;
            }
            if !video_frames.is_empty() && !video_frames[start_idx].1.key {
                // No key frame found walking back; fall back to the first
                // key frame at or after the range, if any.
                if let Some(k) = video_frames.iter().position(|(_, f)| f.key) {
                    start_idx = k;
                }
            }
            video_frames.drain(..start_idx);
        }

        if video_frames.is_empty() && audio_frames.is_empty() {
            bail_t!(NotFound, "no frames in [{}, {})", start_ms, end_ms);
        }

        let mut root = crate::blobtree::Node::map().field(
            "has_audio",
            crate::blobtree::Node::Str(if mask.audio && audio_codec.is_some() { "true" } else { "false" }.to_string()),
        );
        if let Some(c) = &video_codec {
            root = root
                .field("video_codec_name", crate::blobtree::Node::Str(c.name.clone()))
                .field("video_codec_parameters", crate::blobtree::Node::Blob(c.params.clone()));
        }
        if let Some(c) = &audio_codec {
            root = root
                .field("audio_codec_name", crate::blobtree::Node::Str(c.name.clone()))
                .field("audio_codec_parameters", crate::blobtree::Node::Blob(c.params.clone()));
        }

        let mut all: Vec<(&'static str, FrameEntry)> = Vec::new();
        for (_id, f) in &video_frames {
            all.push((StreamTag::VIDEO, *f));
        }
        for (_id, f) in &audio_frames {
            all.push((StreamTag::AUDIO, *f));
        }
        all.sort_by_key(|(_, f)| f.ts_ms);

        let mut frame_nodes = Vec::with_capacity(all.len());
        for (tag, f) in &all {
            let bytes = Self::read_frame_bytes(&mut inner, tag, *f)?;
            frame_nodes.push(
                crate::blobtree::Node::map()
                    .field("stream_id", crate::blobtree::Node::Str((*tag).to_string()))
                    .field("key", crate::blobtree::Node::Str(if f.key { "true" } else { "false" }.to_string()))
                    .field("ts", crate::blobtree::Node::Int(f.ts_ms))
                    .field("data", crate::blobtree::Node::Blob(bytes))
                    .build(),
            );
        }
        root = root.field("frames", crate::blobtree::Node::Array(frame_nodes));
        Ok(root.build())
    }

    pub fn query_key(&self, media_type: MediaType, ts_ms: i64) -> Result<crate::blobtree::Node, Error> {
        let stream_tag = match media_type {
            MediaType::Video => StreamTag::VIDEO,
            MediaType::Audio => StreamTag::AUDIO,
        };
        let mut inner = self.inner.lock().unwrap();
        let (codec, frames) = Self::frames_in_range(&mut inner, stream_tag, i64::MIN, ts_ms)?;
        let key = frames
            .into_iter()
            .rev()
            .find(|(_, f)| f.key && f.ts_ms <= ts_ms)
            .ok_or_else(|| Error::new(ErrorKind::NotFound, "no key frame at or before ts"))?;
        let bytes = Self::read_frame_bytes(&mut inner, stream_tag, key.1)?;
        let codec = codec.ok_or_else(|| Error::new(ErrorKind::Internal, "missing codec info"))?;
        Ok(crate::blobtree::Node::map()
            .field(
                if media_type == MediaType::Video { "video_codec_name" } else { "audio_codec_name" },
                crate::blobtree::Node::Str(codec.name),
            )
            .field(
                if media_type == MediaType::Video {
                    "video_codec_parameters"
                } else {
                    "audio_codec_parameters"
                },
                crate::blobtree::Node::Blob(codec.params),
            )
            .field(
                "frames",
                crate::blobtree::Node::Array(vec![crate::blobtree::Node::map()
                    .field("stream_id", crate::blobtree::Node::Str(stream_tag.to_string()))
                    .field("key", crate::blobtree::Node::Str("true".to_string()))
                    .field("ts", crate::blobtree::Node::Int(key.1.ts_ms))
                    .field("data", crate::blobtree::Node::Blob(bytes))
                    .build()]),
            )
            .build())
    }

    fn read_frame_bytes(inner: &mut Inner, stream_tag: &str, f: FrameEntry) -> Result<Vec<u8>, Error> {
        let block_id = inner
            .catalog
            .overlapping(stream_tag, f.ts_ms, f.ts_ms)
            .into_iter()
            .map(|e| e.block_id)
            .next()
            .or_else(|| {
                inner
                    .catalog
                    .all_for(stream_tag)
                    .into_iter()
                    .find(|e| e.t_start <= f.ts_ms && e.t_end >= f.ts_ms)
                    .map(|e| e.block_id)
            })
            .ok_or_else(|| Error::new(ErrorKind::NotFound, "frame's owning block no longer retained"))?;
        let block_offset = FILE_HEADER_LEN + u64::from(block_id) * u64::from(inner.block_size);
        let mut buf = vec![0u8; f.size as usize];
        inner
            .file
            .seek(SeekFrom::Start(block_offset + u64::from(f.offset)))?;
        inner.file.read_exact(&mut buf)?;
        Ok(buf)
    }

    pub fn remove_blocks(&self, stream_tag: &str, start_ms: i64, end_ms: i64) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        let to_remove: Vec<u32> = inner
            .catalog
            .all_for(stream_tag)
            .into_iter()
            .filter(|e| e.t_start >= start_ms && e.t_end <= end_ms)
            .map(|e| e.block_id)
            .collect();
        for id in to_remove {
            inner.catalog.remove_block(id);
            inner.headers[id as usize] = BlockHeader::free();
            inner.sealed_lru.retain(|&x| x != id);
            inner.free_list.push_back(id);
            let block_offset = FILE_HEADER_LEN + u64::from(id) * u64::from(inner.block_size);
            inner.file.seek(SeekFrom::Start(block_offset))?;
            BlockHeader::free().write_to(&mut inner.file)?;
        }
        persist_catalog(&mut inner)?;
        Ok(())
    }
}

fn write_file_header(
    file: &mut File,
    block_size: u32,
    block_count: u32,
    catalog_offset: u64,
    catalog_len: u64,
) -> Result<(), Error> {
    let mut buf = [0u8; FILE_HEADER_LEN as usize];
    {
        let mut c = Cursor::new(&mut buf[..]);
        c.write_all(MAGIC)?;
        c.write_u32::<LittleEndian>(VERSION)?;
        c.write_u32::<LittleEndian>(block_size)?;
        c.write_u32::<LittleEndian>(block_count)?;
        c.write_u64::<LittleEndian>(catalog_offset)?;
        c.write_u64::<LittleEndian>(catalog_len)?;
    }
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&buf)?;
    Ok(())
}

fn read_file_header(file: &mut File) -> Result<(u32, u32, u64, u64), Error> {
    let mut buf = [0u8; FILE_HEADER_LEN as usize];
    file.seek(SeekFrom::Start(0))?;
    file.read_exact(&mut buf)?;
    let mut c = Cursor::new(&buf[..]);
    let mut magic = [0u8; 4];
    c.read_exact(&mut magic)?;
    if &magic != MAGIC {
        bail_t!(InvalidArgument, "not a storage file (bad magic)");
    }
    let version = c.read_u32::<LittleEndian>()?;
    if version != VERSION {
        bail_t!(InvalidArgument, "unsupported storage file version {}", version);
    }
    let block_size = c.read_u32::<LittleEndian>()?;
    let block_count = c.read_u32::<LittleEndian>()?;
    let catalog_offset = c.read_u64::<LittleEndian>()?;
    let catalog_len = c.read_u64::<LittleEndian>()?;
    Ok((block_size, block_count, catalog_offset, catalog_len))
}

fn persist_catalog(inner: &mut Inner) -> Result<(), Error> {
    let bytes = inner.catalog.to_bytes()?;
    if bytes.len() as u64 > inner.catalog_capacity {
        bail_t!(ResourceExhausted, "catalog outgrew its reserved region");
    }
    inner.file.seek(SeekFrom::Start(inner.catalog_offset))?;
    inner.file.write_all(&bytes)?;
    inner.file.sync_data()?;
    write_file_header(
        &mut inner.file,
        inner.block_size,
        inner.block_count,
        inner.catalog_offset,
        bytes.len() as u64,
    )?;
    inner.file.sync_data()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{fake_video_codec, new_video_file, write_synthetic_gop};
    use tempfile::tempdir;

    #[test]
    fn write_query_and_reopen_round_trip_frames() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.vgl");
        let frame = vec![0xABu8; 100];

        {
            let file = new_video_file(&path, 4096, 4);
            write_synthetic_gop(&file, 0, 100, 10, 5, &frame);
            file.close_write_context("video").unwrap();

            let segments = file.query_segments(0, 10_000).unwrap();
            assert_eq!(segments, vec![(0, 900)]);

            let node = file.query(MediaTypeMask::VIDEO_ONLY, 0, 10_000).unwrap();
            assert_eq!(node.get("frames").unwrap().as_array().unwrap().len(), 10);
        }

        // Reopening rebuilds state entirely from the on-disk catalog.
        let reopened = StorageFile::open(&path).unwrap();
        let segments = reopened.query_segments(0, 10_000).unwrap();
        assert_eq!(segments, vec![(0, 900)]);
        assert_eq!(reopened.first_ts(StreamTag::VIDEO), Some(0));
    }

    #[test]
    fn write_frame_rejects_non_monotone_pts_without_mutating_state() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.vgl");
        let file = new_video_file(&path, 4096, 4);
        let frame = vec![0u8; 16];

        file.write_frame("video", &frame, true, 1000).unwrap();
        let err = file.write_frame("video", &frame, false, 500).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);

        // The rejected call must not have touched payload_cursor/frames: a
        // second, valid write at the same timestamp should succeed and the
        // block should end up with exactly two frames, not three.
        file.write_frame("video", &frame, false, 1000).unwrap();
        file.close_write_context("video").unwrap();

        let node = file.query(MediaTypeMask::VIDEO_ONLY, 0, 2000).unwrap();
        assert_eq!(node.get("frames").unwrap().as_array().unwrap().len(), 2);
    }

    #[test]
    fn query_segments_splits_on_large_gaps() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.vgl");
        let file = new_video_file(&path, 4096, 4);
        let frame = vec![0u8; 16];

        write_synthetic_gop(&file, 0, 100, 3, 1, &frame);
        write_synthetic_gop(&file, 50_000, 100, 3, 1, &frame);
        file.close_write_context("video").unwrap();

        let segments = file.query_segments(0, 60_000).unwrap();
        assert_eq!(segments, vec![(0, 200), (50_000, 50_200)]);
    }

    #[test]
    fn remove_blocks_clears_the_range() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.vgl");
        let file = new_video_file(&path, 4096, 4);
        let frame = vec![0u8; 16];

        write_synthetic_gop(&file, 0, 100, 5, 1, &frame);
        file.close_write_context("video").unwrap();
        assert!(!file.query_segments(0, 10_000).unwrap().is_empty());

        file.remove_blocks(StreamTag::VIDEO, 0, 10_000).unwrap();
        assert!(file.query_segments(0, 10_000).unwrap().is_empty());
        assert_eq!(file.first_ts(StreamTag::VIDEO), None);
    }

    #[test]
    fn reopen_discards_an_unsealed_active_block() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.vgl");
        let frame = vec![0u8; 16];

        {
            // Never sealed: simulates a crash mid-block.
            let file = new_video_file(&path, 4096, 1);
            file.write_frame("video", &frame, true, 0).unwrap();
        }

        let reopened = StorageFile::open(&path).unwrap();
        assert_eq!(reopened.first_ts(StreamTag::VIDEO), None);
        assert!(reopened.query_segments(0, 1000).unwrap().is_empty());

        // The block is back on the free list and reusable.
        reopened
            .create_write_context("video", fake_video_codec(), MediaType::Video)
            .unwrap();
        reopened.write_frame("video", &frame, true, 0).unwrap();
        reopened.close_write_context("video").unwrap();
        assert_eq!(reopened.first_ts(StreamTag::VIDEO), Some(0));
    }

    #[test]
    fn activate_block_reclaims_oldest_sealed_block_when_full() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.vgl");
        // One block's worth of headroom: the second GOP's block can only
        // come from reclaiming the first's once it's sealed.
        let file = new_video_file(&path, 4096, 1);
        let frame = vec![0u8; 16];

        write_synthetic_gop(&file, 0, 100, 3, 1, &frame);
        file.close_write_context("video").unwrap();
        assert_eq!(file.first_ts(StreamTag::VIDEO), Some(0));

        file.create_write_context("video", fake_video_codec(), MediaType::Video).unwrap();
        write_synthetic_gop(&file, 100_000, 100, 3, 1, &frame);
        file.close_write_context("video").unwrap();

        // The only block was reclaimed, so the first GOP is gone and only
        // the second is retained.
        assert_eq!(file.first_ts(StreamTag::VIDEO), Some(100_000));
    }
}

