// This file is part of Vigil NVR, a security camera network video recorder.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The Camera data model: identity and operational configuration for one
//! assigned or discovered device, plus the stream-configuration digest used
//! to detect drift requiring a recording restart.

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::path::PathBuf;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentState {
    Discovered,
    Assigned,
}

/// Optional RTSP credentials. Never serialized back out in full; `/cameras`
/// responses redact the password (see `web::json`).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Identity and operational config for one camera.
///
/// Created by the discovery collaborator, mutated by the assignment UI,
/// destroyed only on explicit removal. The Stream Keeper never constructs
/// or deletes a `Camera`; it only observes the assigned set.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Camera {
    pub id: String,
    pub display_name: String,
    pub network_address: String,
    pub rtsp_url: String,
    pub credentials: Option<Credentials>,
    pub assignment_state: AssignmentState,
    pub storage_path: PathBuf,
    pub block_size: u32,
    pub block_count: u32,
    pub motion_enabled: bool,
    pub motion_storage_path: PathBuf,
    pub motion_pruning_enabled: bool,
    pub min_continuous_recording_hours: u32,
}

impl Camera {
    pub fn friendly_name(&self) -> String {
        self.display_name.replace(' ', "_")
    }

    pub fn is_assigned(&self) -> bool {
        self.assignment_state == AssignmentState::Assigned
    }
}

/// Content-addressed digest of the observable camera parameters (codec,
/// resolution, rates). Two sessions with the same hash are interchangeable
/// for recording purposes; a changed hash means the Recording Context must
/// be rebuilt so newly-sealed blocks carry the right codec descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StreamConfigHash([u8; 20]);

impl StreamConfigHash {
    pub fn compute(codec_name: &str, width: u32, height: u32, sample_rate: u32, channels: u16) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(codec_name.as_bytes());
        hasher.update(width.to_le_bytes());
        hasher.update(height.to_le_bytes());
        hasher.update(sample_rate.to_le_bytes());
        hasher.update(channels.to_le_bytes());
        let digest = hasher.finalize();
        let mut out = [0u8; 20];
        out.copy_from_slice(&digest);
        StreamConfigHash(out)
    }
}

impl std::fmt::Display for StreamConfigHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_camera() -> Camera {
        Camera {
            id: "cam-1".to_string(),
            display_name: "Front Door".to_string(),
            network_address: "192.0.2.5".to_string(),
            rtsp_url: "rtsp://192.0.2.5/live".to_string(),
            credentials: None,
            assignment_state: AssignmentState::Assigned,
            storage_path: PathBuf::from("/var/lib/vigil/video/front_door.vgl"),
            block_size: 1 << 20,
            block_count: 256,
            motion_enabled: true,
            motion_storage_path: PathBuf::from("/var/lib/vigil/video/front_door.ring"),
            motion_pruning_enabled: true,
            min_continuous_recording_hours: 24,
        }
    }

    #[test]
    fn friendly_name_replaces_spaces() {
        assert_eq!(sample_camera().friendly_name(), "Front_Door");
    }

    #[test]
    fn hash_changes_with_resolution() {
        let a = StreamConfigHash::compute("h264", 1920, 1080, 0, 0);
        let b = StreamConfigHash::compute("h264", 1280, 720, 0, 0);
        assert_ne!(a, b);
        let c = StreamConfigHash::compute("h264", 1920, 1080, 0, 0);
        assert_eq!(a, c);
    }
}
