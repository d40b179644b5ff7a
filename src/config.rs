// This file is part of Vigil NVR, a security camera network video recorder.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! On-disk JSON configuration: the global settings file and the
//! per-camera files under `config/cameras/`, per the application root
//! layout (`video/`, `config/`, `logs/`).

use base::{bail_t, Error};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use vss::{AssignmentState, Camera, Credentials};

pub const DEFAULT_HTTP_PORT: u16 = 10080;
pub const DEFAULT_RTSP_PORT: u16 = 10554;

fn default_http_port() -> u16 {
    DEFAULT_HTTP_PORT
}

fn default_rtsp_port() -> u16 {
    DEFAULT_RTSP_PORT
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GlobalConfig {
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    #[serde(default = "default_rtsp_port")]
    pub rtsp_port: u16,
    /// Directory scanned for motion plugins at startup; relative to the
    /// application root unless absolute.
    #[serde(default)]
    pub plugin_dir: PathBuf,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        GlobalConfig {
            http_port: DEFAULT_HTTP_PORT,
            rtsp_port: DEFAULT_RTSP_PORT,
            plugin_dir: PathBuf::from("plugins"),
        }
    }
}

/// On-disk shape of `config/cameras/<id>.json`: everything a [`Camera`]
/// needs except the derived storage paths, which are always
/// `video/<friendly_name>.{vgl,ring,meta}` under the application root.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CameraConfig {
    pub id: String,
    pub display_name: String,
    pub network_address: String,
    pub rtsp_url: String,
    #[serde(default)]
    pub credentials: Option<Credentials>,
    #[serde(default = "default_assigned")]
    pub assignment_state: AssignmentState,
    #[serde(default = "default_block_size")]
    pub block_size: u32,
    #[serde(default = "default_block_count")]
    pub block_count: u32,
    #[serde(default = "default_true")]
    pub motion_enabled: bool,
    #[serde(default = "default_true")]
    pub motion_pruning_enabled: bool,
    #[serde(default = "default_retention_hours")]
    pub min_continuous_recording_hours: u32,
}

fn default_assigned() -> AssignmentState {
    AssignmentState::Assigned
}

fn default_block_size() -> u32 {
    1 << 24
}

fn default_block_count() -> u32 {
    256
}

fn default_true() -> bool {
    true
}

fn default_retention_hours() -> u32 {
    24 * 14
}

pub fn app_video_dir(app_root: &Path) -> PathBuf {
    app_root.join("video")
}

pub fn app_config_dir(app_root: &Path) -> PathBuf {
    app_root.join("config")
}

pub fn app_cameras_config_dir(app_root: &Path) -> PathBuf {
    app_config_dir(app_root).join("cameras")
}

pub fn app_logs_dir(app_root: &Path) -> PathBuf {
    app_root.join("logs")
}

pub fn app_exports_dir(app_root: &Path) -> PathBuf {
    app_root.join("exports")
}

fn global_config_path(app_root: &Path) -> PathBuf {
    app_config_dir(app_root).join("global.json")
}

pub fn load_global(app_root: &Path) -> Result<GlobalConfig, Error> {
    let path = global_config_path(app_root);
    if !path.exists() {
        return Ok(GlobalConfig::default());
    }
    let bytes = std::fs::read(&path)?;
    serde_json::from_slice(&bytes).map_err(|e| Error::wrap(base::ErrorKind::Internal, e))
}

pub fn write_default_global(app_root: &Path) -> Result<(), Error> {
    let path = global_config_path(app_root);
    if path.exists() {
        return Ok(());
    }
    let bytes = serde_json::to_vec_pretty(&GlobalConfig::default())
        .map_err(|e| Error::wrap(base::ErrorKind::Internal, e))?;
    std::fs::write(&path, bytes)?;
    Ok(())
}

impl CameraConfig {
    /// Converts this on-disk record into a [`Camera`], filling in the
    /// storage paths the spec derives from the friendly name rather than
    /// storing explicitly.
    pub fn into_camera(self, app_root: &Path) -> Camera {
        let friendly = self.display_name.replace(' ', "_");
        let video_dir = app_video_dir(app_root);
        Camera {
            id: self.id,
            display_name: self.display_name,
            network_address: self.network_address,
            rtsp_url: self.rtsp_url,
            credentials: self.credentials,
            assignment_state: self.assignment_state,
            storage_path: video_dir.join(format!("{friendly}.vgl")),
            block_size: self.block_size,
            block_count: self.block_count,
            motion_enabled: self.motion_enabled,
            motion_storage_path: video_dir.join(format!("{friendly}.ring")),
            motion_pruning_enabled: self.motion_pruning_enabled,
            min_continuous_recording_hours: self.min_continuous_recording_hours,
        }
    }
}

/// The metadata Storage File path derived from a camera's friendly name,
/// per spec §6 ("the Query Layer derives the motion/metadata paths from
/// the record path by substituting suffixes").
pub fn metadata_log_path(camera: &Camera) -> PathBuf {
    camera.storage_path.with_extension("meta")
}

pub fn metadata_index_path(camera: &Camera) -> PathBuf {
    camera.storage_path.with_extension("meta.idx")
}

pub fn load_cameras(app_root: &Path) -> Result<Vec<Camera>, Error> {
    let dir = app_cameras_config_dir(app_root);
    let mut cameras = Vec::new();
    if !dir.exists() {
        return Ok(cameras);
    }
    let mut entries: Vec<PathBuf> = std::fs::read_dir(&dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().map(|ext| ext == "json").unwrap_or(false))
        .collect();
    entries.sort();
    for path in entries {
        let bytes = std::fs::read(&path)?;
        let cfg: CameraConfig =
            serde_json::from_slice(&bytes).map_err(|e| Error::wrap(base::ErrorKind::Internal, e))?;
        cameras.push(cfg.into_camera(app_root));
    }
    Ok(cameras)
}

pub fn save_camera(app_root: &Path, cfg: &CameraConfig) -> Result<(), Error> {
    if cfg.id.is_empty() {
        bail_t!(InvalidArgument, "camera id must not be empty");
    }
    let dir = app_cameras_config_dir(app_root);
    std::fs::create_dir_all(&dir)?;
    let path = dir.join(format!("{}.json", cfg.id));
    let bytes =
        serde_json::to_vec_pretty(cfg).map_err(|e| Error::wrap(base::ErrorKind::Internal, e))?;
    std::fs::write(&path, bytes)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_global_config_falls_back_to_defaults() {
        let dir = tempdir().unwrap();
        let cfg = load_global(dir.path()).unwrap();
        assert_eq!(cfg.http_port, DEFAULT_HTTP_PORT);
        assert_eq!(cfg.rtsp_port, DEFAULT_RTSP_PORT);
    }

    #[test]
    fn camera_config_round_trips_through_disk() {
        let dir = tempdir().unwrap();
        let cfg = CameraConfig {
            id: "cam-1".to_string(),
            display_name: "Front Door".to_string(),
            network_address: "192.0.2.5".to_string(),
            rtsp_url: "rtsp://192.0.2.5/live".to_string(),
            credentials: None,
            assignment_state: AssignmentState::Assigned,
            block_size: 1 << 20,
            block_count: 64,
            motion_enabled: true,
            motion_pruning_enabled: true,
            min_continuous_recording_hours: 24,
        };
        save_camera(dir.path(), &cfg).unwrap();
        let cameras = load_cameras(dir.path()).unwrap();
        assert_eq!(cameras.len(), 1);
        assert_eq!(cameras[0].id, "cam-1");
        assert_eq!(cameras[0].storage_path, dir.path().join("video/Front_Door.vgl"));
    }
}
