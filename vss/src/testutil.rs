// This file is part of Vigil NVR, a security camera network video recorder.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Shared test helpers for this crate's test suites: camera fixtures and a
//! synthetic [`crate::motion::FrameDecoder`] for exercising the Motion
//! Engine without a real H.264/H.265 decoder.

use std::path::PathBuf;

use crate::camera::{AssignmentState, Camera};

pub fn fake_camera(id: &str) -> Camera {
    Camera {
        id: id.to_string(),
        display_name: id.to_string(),
        network_address: "192.0.2.1".to_string(),
        rtsp_url: format!("rtsp://192.0.2.1/{}", id),
        credentials: None,
        assignment_state: AssignmentState::Assigned,
        storage_path: PathBuf::from(format!("/tmp/{}.vgl", id)),
        block_size: 1 << 20,
        block_count: 64,
        motion_enabled: true,
        motion_storage_path: PathBuf::from(format!("/tmp/{}.ring", id)),
        motion_pruning_enabled: true,
        min_continuous_recording_hours: 24,
    }
}

/// A decoder that returns a fixed sequence of motion intensities,
/// cycling once exhausted, for tests that don't care about exact event
/// counts but need a stable, deterministic signal.
pub struct CyclingDecoder {
    values: Vec<f64>,
    next: usize,
}

impl CyclingDecoder {
    pub fn new(values: Vec<f64>) -> Self {
        CyclingDecoder { values, next: 0 }
    }
}

impl crate::motion::FrameDecoder for CyclingDecoder {
    fn motion_intensity(&mut self, _buf: &[u8], _is_key: bool) -> Option<(f64, crate::motion::BBox)> {
        if self.values.is_empty() {
            return None;
        }
        let v = self.values[self.next % self.values.len()];
        self.next += 1;
        Some((v, crate::motion::BBox { x: 0, y: 0, w: 640, h: 360 }))
    }

    fn last_frame(&self) -> Option<crate::motion::DecodedFrame> {
        None
    }
}
