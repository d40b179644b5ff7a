// This file is part of Vigil NVR, a security camera network video recorder.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! `vigild init`: lays out a fresh application root.

use base::Error;
use std::path::Path;

use crate::config;

pub fn run(app_root: &Path) -> Result<(), Error> {
    std::fs::create_dir_all(config::app_video_dir(app_root))?;
    std::fs::create_dir_all(config::app_cameras_config_dir(app_root))?;
    std::fs::create_dir_all(config::app_logs_dir(app_root))?;
    config::write_default_global(app_root)?;
    tracing::info!(app_root = %app_root.display(), "initialized application root");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn creates_expected_directory_layout() {
        let dir = tempdir().unwrap();
        run(dir.path()).unwrap();
        assert!(dir.path().join("video").is_dir());
        assert!(dir.path().join("config/cameras").is_dir());
        assert!(dir.path().join("logs").is_dir());
        assert!(dir.path().join("config/global.json").is_file());
    }

    #[test]
    fn is_idempotent() {
        let dir = tempdir().unwrap();
        run(dir.path()).unwrap();
        run(dir.path()).unwrap();
        assert!(dir.path().join("config/global.json").is_file());
    }
}
