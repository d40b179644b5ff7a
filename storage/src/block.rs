// This file is part of Vigil NVR, a security camera network video recorder.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Layout and (de)serialization of a single Storage File block.
//!
//! A block is `block_size` contiguous bytes: a fixed header, a codec-info
//! record, a payload region holding frame bytes back to back, and a frame
//! index reserved at the tail of the block (a fixed offset from the start,
//! computed once at allocation time from `block_size`).

use base::{bail_t, Error};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Cursor, Read, Write};

use crate::coding::{FrameEntry, FrameIndexIterator};

pub const STREAM_TAG_LEN: usize = 16;
pub const BLOCK_HEADER_LEN: usize = 64;

/// Fraction of each block reserved at the tail for the frame index.
/// Conservative: at ~3 bytes/entry in the common case this bounds the
/// index to comfortably more frames than a block of this size could ever
/// hold payload for.
pub const INDEX_RESERVED_NUM: u64 = 1;
pub const INDEX_RESERVED_DEN: u64 = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamTag([u8; STREAM_TAG_LEN]);

impl StreamTag {
    pub fn new(s: &str) -> Self {
        let mut buf = [0u8; STREAM_TAG_LEN];
        let bytes = s.as_bytes();
        let n = bytes.len().min(STREAM_TAG_LEN);
        buf[..n].copy_from_slice(&bytes[..n]);
        StreamTag(buf)
    }

    pub fn as_str(&self) -> &str {
        let n = self.0.iter().position(|&b| b == 0).unwrap_or(STREAM_TAG_LEN);
        std::str::from_utf8(&self.0[..n]).unwrap_or("")
    }

    pub const VIDEO: &'static str = "video";
    pub const AUDIO: &'static str = "audio";
}

impl std::fmt::Display for StreamTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MediaType {
    Video,
    Audio,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum BlockState {
    Free = 0,
    Active = 1,
    Sealed = 2,
}

impl BlockState {
    fn from_u8(v: u8) -> Result<Self, Error> {
        Ok(match v {
            0 => BlockState::Free,
            1 => BlockState::Active,
            2 => BlockState::Sealed,
            _ => bail_t!(Internal, "bad block state byte {}", v),
        })
    }
}

/// Codec name and opaque out-of-band parameters (SPS/PPS/VPS, sample rate,
/// channel count, etc., already packed by the caller).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CodecInfo {
    pub name: String,
    pub params: Vec<u8>,
}

/// The fixed-size portion of a block, always at offset 0 within the block.
#[derive(Clone, Debug)]
pub struct BlockHeader {
    pub state: BlockState,
    pub stream_tag: StreamTag,
    pub t_start: i64,
    pub t_end: i64,
    pub frame_count: u32,
    /// Index of the next free block in the LRU free list, or -1.
    pub next_free: i64,
}

impl BlockHeader {
    pub fn free() -> Self {
        BlockHeader {
            state: BlockState::Free,
            stream_tag: StreamTag::new(""),
            t_start: 0,
            t_end: 0,
            frame_count: 0,
            next_free: -1,
        }
    }

    pub fn write_to(&self, w: &mut impl Write) -> io::Result<()> {
        let mut buf = [0u8; BLOCK_HEADER_LEN];
        {
            let mut c = Cursor::new(&mut buf[..]);
            c.write_u8(self.state as u8)?;
            c.write_all(&[0u8; 7])?; // padding / alignment
            c.write_all(&self.stream_tag.0)?;
            c.write_i64::<LittleEndian>(self.t_start)?;
            c.write_i64::<LittleEndian>(self.t_end)?;
            c.write_u32::<LittleEndian>(self.frame_count)?;
            c.write_i64::<LittleEndian>(self.next_free)?;
        }
        w.write_all(&buf)
    }

    pub fn read_from(r: &mut impl Read) -> Result<Self, Error> {
        let mut buf = [0u8; BLOCK_HEADER_LEN];
        r.read_exact(&mut buf)?;
        let mut c = Cursor::new(&buf[..]);
        let state = BlockState::from_u8(c.read_u8()?)?;
        let mut pad = [0u8; 7];
        c.read_exact(&mut pad)?;
        let mut tag = [0u8; STREAM_TAG_LEN];
        c.read_exact(&mut tag)?;
        let t_start = c.read_i64::<LittleEndian>()?;
        let t_end = c.read_i64::<LittleEndian>()?;
        let frame_count = c.read_u32::<LittleEndian>()?;
        let next_free = c.read_i64::<LittleEndian>()?;
        Ok(BlockHeader {
            state,
            stream_tag: StreamTag(tag),
            t_start,
            t_end,
            frame_count,
            next_free,
        })
    }
}

/// Computes the byte offset, within a block, where the frame index begins.
pub fn index_offset(block_size: u32) -> u32 {
    let reserved = (u64::from(block_size) * INDEX_RESERVED_NUM / INDEX_RESERVED_DEN) as u32;
    block_size.saturating_sub(reserved)
}

/// Writes a codec-info record (length-prefixed name, length-prefixed params)
/// right after the fixed header, returning the offset the payload region
/// begins at.
pub fn write_codec_info(buf: &mut [u8], codec: &CodecInfo) -> Result<u32, Error> {
    let mut c = Cursor::new(&mut buf[BLOCK_HEADER_LEN..]);
    let name_bytes = codec.name.as_bytes();
    c.write_u16::<LittleEndian>(name_bytes.len() as u16)?;
    c.write_all(name_bytes)?;
    c.write_u32::<LittleEndian>(codec.params.len() as u32)?;
    c.write_all(&codec.params)?;
    Ok(BLOCK_HEADER_LEN as u32 + c.position() as u32)
}

pub fn read_codec_info(buf: &[u8]) -> Result<(CodecInfo, u32), Error> {
    let mut c = Cursor::new(&buf[BLOCK_HEADER_LEN..]);
    let name_len = c.read_u16::<LittleEndian>()? as usize;
    let mut name = vec![0u8; name_len];
    c.read_exact(&mut name)?;
    let params_len = c.read_u32::<LittleEndian>()? as usize;
    let mut params = vec![0u8; params_len];
    c.read_exact(&mut params)?;
    let name = String::from_utf8(name).map_err(|e| Error::wrap(base::ErrorKind::Internal, e))?;
    Ok((
        CodecInfo { name, params },
        BLOCK_HEADER_LEN as u32 + c.position() as u32,
    ))
}

/// Writes a sealed block's frame index (as produced by
/// [`crate::coding::FrameIndexEncoder::into_bytes`]) at the block's reserved
/// tail offset, preceded by the entry count.
pub fn write_index_bytes(buf: &mut [u8], offset: u32, count: u32, payload: &[u8]) -> Result<(), Error> {
    let start = offset as usize;
    if start + 4 + payload.len() > buf.len() {
        bail_t!(Internal, "frame index overflowed its reserved region");
    }
    let mut c = Cursor::new(&mut buf[start..]);
    c.write_u32::<LittleEndian>(count)?;
    c.write_all(payload)?;
    Ok(())
}

pub fn read_index(buf: &[u8], offset: u32, first_ts: i64) -> Result<Vec<FrameEntry>, Error> {
    let start = offset as usize;
    let mut c = Cursor::new(&buf[start..]);
    let count = c.read_u32::<LittleEndian>()?;
    let pos = start + 4;
    Ok(FrameIndexIterator::new(&buf[pos..], count, first_ts).collect())
}
