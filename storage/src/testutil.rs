// This file is part of Vigil NVR, a security camera network video recorder.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Shared test helpers: synthetic frame generators and scratch storage
//! files, used by this crate's and by `vss`'s test suites.

use crate::block::{CodecInfo, MediaType};
use crate::file::StorageFile;
use std::path::Path;

/// A minimal, fake H.264-ish codec (not a real SPS/PPS) for tests that only
/// care about frame accounting, not decodability.
pub fn fake_video_codec() -> CodecInfo {
    CodecInfo { name: "h264".to_string(), params: vec![0x01, 0x02, 0x03] }
}

pub fn fake_audio_codec() -> CodecInfo {
    CodecInfo { name: "aac".to_string(), params: vec![0x11, 0x90] }
}

/// Allocates a fresh storage file at `path` with a "video" write context
/// already registered.
pub fn new_video_file(path: &Path, block_size: u32, block_count: u32) -> StorageFile {
    let f = StorageFile::allocate(path, block_size, block_count).expect("allocate");
    f.create_write_context("video", fake_video_codec(), MediaType::Video)
        .expect("create_write_context");
    f
}

/// Writes `count` synthetic video frames spaced `step_ms` apart, starting at
/// `start_ms`, with every `gop_size`-th frame marked as a key frame.
pub fn write_synthetic_gop(
    file: &StorageFile,
    start_ms: i64,
    step_ms: i64,
    count: u32,
    gop_size: u32,
    frame_bytes: &[u8],
) {
    for i in 0..count {
        let ts = start_ms + i64::from(i) * step_ms;
        let key = gop_size == 0 || i % gop_size == 0;
        file.write_frame("video", frame_bytes, key, ts).expect("write_frame");
    }
}
