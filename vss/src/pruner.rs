// This file is part of Vigil NVR, a security camera network video recorder.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The Pruner: a background ~1 Hz loop reclaiming sealed video blocks that
//! carry no motion activity and are older than a per-camera minimum
//! continuous-recording window. Runs on its own `std::thread`, like the
//! Motion Engine worker, since block scans and Ring queries are
//! synchronous I/O the reconciliation `tokio` task shouldn't block on.

use std::sync::Arc;
use std::time::Duration;

use crate::camera::Camera;

const TICK: Duration = Duration::from_secs(1);
const CAMERA_LIST_REFRESH: Duration = Duration::from_secs(30);
const MOTION_WINDOW_MS: i64 = 30_000;

/// One camera's storage, motion ring, and retention policy, as the Pruner
/// needs them. Intentionally narrower than [`Camera`] plus
/// [`storage::StorageFile`] so a caller can assemble it without handing
/// the Pruner write access to either.
pub struct PrunerTarget {
    pub camera_id: String,
    pub storage: Arc<storage::StorageFile>,
    pub ring: Arc<storage::RingFile>,
    pub min_continuous_recording_hours: u32,
}

struct Cursor {
    camera_id: String,
    blocks: Vec<(i64, i64, u32)>,
    index: usize,
}

/// Walks each eligible camera's sealed blocks in turn, removing those with
/// no motion activity in `[b_start - 30s, b_end + 30s]` once `b_start` is
/// older than the camera's retention horizon.
pub struct Pruner<F> {
    targets: F,
    cursor: Option<Cursor>,
    last_refresh: Option<i64>,
    eligible: Vec<PrunerTarget>,
    eligible_index: usize,
}

impl<F> Pruner<F>
where
    F: Fn() -> Vec<(Camera, PrunerTarget)>,
{
    pub fn new(targets: F) -> Self {
        Pruner {
            targets,
            cursor: None,
            last_refresh: None,
            eligible: Vec::new(),
            eligible_index: 0,
        }
    }

    fn refresh_if_due(&mut self, now_ms: i64) {
        let due = match self.last_refresh {
            None => true,
            Some(last) => now_ms - last >= CAMERA_LIST_REFRESH.as_millis() as i64,
        };
        if !due {
            return;
        }
        self.last_refresh = Some(now_ms);
        self.eligible = (self.targets)()
            .into_iter()
            .filter(|(camera, _)| camera.is_assigned() && camera.motion_pruning_enabled)
            .map(|(_, target)| target)
            .collect();
        if self.eligible_index >= self.eligible.len() {
            self.eligible_index = 0;
        }
    }

    /// Advances the rotating cursor by one block (or one camera, at the
    /// end of a camera's block list), removing a block when it's eligible
    /// for reclamation. Returns the id of any removed block.
    pub fn tick(&mut self, now_ms: i64) -> Option<(String, u32)> {
        self.refresh_if_due(now_ms);
        if self.eligible.is_empty() {
            return None;
        }

        if self.cursor.is_none() {
            let target = &self.eligible[self.eligible_index];
            let blocks = target.storage.query_blocks(storage::StreamTag::VIDEO, i64::MIN, i64::MAX);
            self.cursor = Some(Cursor {
                camera_id: target.camera_id.clone(),
                blocks,
                index: 0,
            });
        }

        let target = self
            .eligible
            .iter()
            .find(|t| t.camera_id == self.cursor.as_ref().unwrap().camera_id)?;
        let retention_horizon_ms = now_ms - target.min_continuous_recording_hours as i64 * 3_600_000;

        let removed = {
            let cursor = self.cursor.as_mut().unwrap();
            match cursor.blocks.get(cursor.index).copied() {
                None => None,
                Some((b_start, b_end, block_id)) => {
                    cursor.index += 1;
                    if b_start >= retention_horizon_ms {
                        // Reached the retention horizon; rotate to the
                        // next camera rather than scanning further (blocks
                        // are sorted by t_start).
                        cursor.index = cursor.blocks.len();
                        None
                    } else {
                        let has_motion = has_motion_in_window(&target.ring, b_start, b_end, now_ms);
                        if has_motion {
                            None
                        } else {
                            target.storage.remove_blocks(storage::StreamTag::VIDEO, b_start, b_end).ok()?;
                            Some((target.camera_id.clone(), block_id))
                        }
                    }
                }
            }
        };

        let exhausted = self.cursor.as_ref().map(|c| c.index >= c.blocks.len()).unwrap_or(true);
        if exhausted {
            self.cursor = None;
            self.eligible_index = (self.eligible_index + 1) % self.eligible.len();
        }

        removed
    }
}

fn has_motion_in_window(ring: &storage::RingFile, b_start: i64, b_end: i64, now_ms: i64) -> bool {
    let qs = (b_start - MOTION_WINDOW_MS) / 1000;
    let qe = (b_end + MOTION_WINDOW_MS) / 1000;
    let now_s = now_ms / 1000;
    let mut found = false;
    let _ = ring.query(qs, qe, now_s, |_ts_s, flags| {
        if flags.iter().any(|&f| f != 0) {
            found = true;
        }
    });
    found
}

/// Runs [`Pruner::tick`] at ~1 Hz until told to stop, via the same
/// `base::shutdown` machinery the Media Source and Motion Engine use.
pub fn run<F>(mut pruner: Pruner<F>, clocks: Arc<dyn base::clock::Clocks>, shutdown: base::shutdown::Receiver)
where
    F: Fn() -> Vec<(Camera, PrunerTarget)>,
{
    loop {
        if shutdown.check().is_err() {
            return;
        }
        let now_ms = base::clock::unix_time_ms(clocks.as_ref());
        if let Some((camera_id, block_id)) = pruner.tick(now_ms) {
            tracing::info!(camera_id = %camera_id, block_id, "pruned block with no motion activity");
        }
        clocks.sleep(TICK);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::tempdir;

    fn camera(id: &str, min_hours: u32) -> Camera {
        Camera {
            id: id.to_string(),
            display_name: id.to_string(),
            network_address: String::new(),
            rtsp_url: String::new(),
            credentials: None,
            assignment_state: crate::camera::AssignmentState::Assigned,
            storage_path: PathBuf::new(),
            block_size: 1 << 16,
            block_count: 64,
            motion_enabled: true,
            motion_storage_path: PathBuf::new(),
            motion_pruning_enabled: true,
            min_continuous_recording_hours: min_hours,
        }
    }

    #[test]
    fn respects_minimum_continuous_recording_window() {
        let dir = tempdir().unwrap();
        let storage = Arc::new(storage::StorageFile::allocate(&dir.path().join("cam.vgl"), 1 << 16, 64).unwrap());
        let ring = Arc::new(storage::RingFile::allocate(&dir.path().join("cam.ring"), storage::ring::MOTION_FLAG_SIZE, 7200 * 48, 0).unwrap());

        // 48 one-hour blocks, none with motion, starting at ts=0.
        let hour_ms = 3_600_000i64;
        for h in 0..48 {
            let t0 = h * hour_ms;
            storage.create_write_context(storage::StreamTag::VIDEO, storage::CodecInfo { name: "h264".to_string(), params: vec![] }, storage::MediaType::Video).ok();
            storage.write_frame(storage::StreamTag::VIDEO, b"frame", true, t0).unwrap();
            storage.close_write_context(storage::StreamTag::VIDEO).unwrap();
        }

        let now_ms = 48 * hour_ms;
        let target = PrunerTarget {
            camera_id: "cam-1".to_string(),
            storage: storage.clone(),
            ring,
            min_continuous_recording_hours: 24,
        };
        let cam = camera("cam-1", 24);
        let targets_snapshot = vec![(cam, target)];
        let mut pruner = Pruner::new(move || {
            targets_snapshot
                .iter()
                .map(|(c, t)| {
                    (
                        c.clone(),
                        PrunerTarget {
                            camera_id: t.camera_id.clone(),
                            storage: t.storage.clone(),
                            ring: t.ring.clone(),
                            min_continuous_recording_hours: t.min_continuous_recording_hours,
                        },
                    )
                })
                .collect()
        });

        for _ in 0..200 {
            pruner.tick(now_ms);
        }

        let remaining = storage.query_blocks(storage::StreamTag::VIDEO, i64::MIN, i64::MAX);
        assert_eq!(remaining.len(), 24);
    }
}
