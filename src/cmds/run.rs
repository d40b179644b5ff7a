// This file is part of Vigil NVR, a security camera network video recorder.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! `vigild run`: the long-running daemon. Opens every configured camera's
//! storage, spawns a Recording Context per assigned camera, the Motion
//! Engine worker, the Plugin Host, the Pruner, the Stream Keeper's
//! reconciliation loop, and the HTTP query server, then waits for a
//! shutdown signal and tears them down in dependency order.

use base::{shutdown, Error};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};

use storage::{MetadataStore, RingFile, StorageFile};
use vss::{
    keeper, motion, pruner, source::RetinaMediaSource, Camera, MotionStateFactory, PluginHost, RecordingContext,
    StreamKeeper,
};

use crate::config;
use crate::web::{AppState, CameraFiles};

/// Stands in for the embedded RTSP re-streaming server this engine
/// doesn't itself implement: logs the mount-registry bookkeeping a real
/// server adapter would act on. Wiring an actual RTSP server here is a
/// concrete server adapter's job, not this crate's.
struct LoggingTransport;

impl keeper::RtspTransport for LoggingTransport {
    fn add_live_mount(&self, path: &str) {
        tracing::info!(path, "live mount requested");
    }
    fn add_playback_mount(&self, path: &str) {
        tracing::info!(path, "playback mount requested");
    }
    fn remove_mount(&self, path: &str) {
        tracing::info!(path, "mount removed");
    }
    fn quit(&self) {
        tracing::info!("RTSP transport quit");
    }
}

/// Opens (or lazily allocates) a camera's Storage File, motion Ring File,
/// and metadata log, and constructs its [`CameraFiles`] entry.
fn open_camera_files(camera: &Camera) -> Result<CameraFiles, Error> {
    let storage = match StorageFile::open(&camera.storage_path) {
        Ok(f) => f,
        Err(e) if e.kind() == base::ErrorKind::NotFound => {
            StorageFile::allocate(&camera.storage_path, camera.block_size, camera.block_count)?
        }
        Err(e) => return Err(e),
    };
    let ring = match RingFile::open(&camera.motion_storage_path) {
        Ok(f) => f,
        Err(e) if e.kind() == base::ErrorKind::NotFound => {
            let now_s = base::clock::unix_time_ms(&base::clock::RealClocks {}) / 1000;
            RingFile::allocate(&camera.motion_storage_path, storage::ring::MOTION_FLAG_SIZE, 7 * 24 * 3600, now_s)?
        }
        Err(e) => return Err(e),
    };
    let metadata_log = config::metadata_log_path(camera);
    let metadata_index = config::metadata_index_path(camera);
    let metadata = if metadata_log.exists() {
        MetadataStore::open(&metadata_log, &metadata_index)?
    } else {
        MetadataStore::create(&metadata_log, &metadata_index)?
    };
    Ok(CameraFiles {
        camera: camera.clone(),
        storage: Arc::new(storage),
        ring: Arc::new(ring),
        metadata: Arc::new(metadata),
    })
}

/// Builds per-camera decoders and opens the already-allocated Ring File
/// for the Motion Engine, without the engine needing to know how either
/// is constructed.
struct RingFactory {
    rings: HashMap<String, Arc<RingFile>>,
}

impl MotionStateFactory for RingFactory {
    fn create_decoder(&self, _camera_id: &str, _codec_name: &str, _codec_params: &[u8]) -> Box<dyn motion::FrameDecoder> {
        Box::new(motion::ByteDiffDecoder::new(640, 360))
    }

    fn open_ring(&self, camera_id: &str) -> Result<Arc<RingFile>, Error> {
        self.rings
            .get(camera_id)
            .cloned()
            .ok_or_else(|| base::format_err_t!(NotFound, "no motion ring configured for camera {camera_id}"))
    }
}

pub fn run(app_root: &Path) -> Result<i32, Error> {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| Error::wrap(base::ErrorKind::Internal, e))?;
    rt.block_on(run_async(app_root))
}

async fn run_async(app_root: &Path) -> Result<i32, Error> {
    let global = config::load_global(app_root)?;
    let cameras = config::load_cameras(app_root)?;

    let mut files_by_id = HashMap::new();
    let mut rings = HashMap::new();
    for camera in &cameras {
        let files = open_camera_files(camera)?;
        rings.insert(camera.id.clone(), files.ring.clone());
        files_by_id.insert(camera.id.clone(), files);
    }

    let (shutdown_tx, shutdown_rx) = shutdown::channel();
    let clocks: Arc<dyn base::clock::Clocks> = Arc::new(base::clock::RealClocks {});

    let plugin_host = PluginHost::load_dir(&global.plugin_dir, std::ptr::null())?;
    let plugin_host = Arc::new(Mutex::new(plugin_host));

    let ring_factory = Arc::new(RingFactory { rings: rings.clone() });
    let (motion_handle, motion_join) = motion::spawn(ring_factory, plugin_host.clone(), shutdown_rx.clone());

    let transport = Arc::new(LoggingTransport);
    let keeper = StreamKeeper::new(transport.clone());

    let storage_by_id: HashMap<String, Arc<StorageFile>> =
        files_by_id.iter().map(|(id, f)| (id.clone(), f.storage.clone())).collect();
    for camera in &cameras {
        if let Some(storage) = storage_by_id.get(&camera.id) {
            keeper.register_storage(&camera.friendly_name(), storage.clone());
        }
    }
    let assigned_cameras = cameras.clone();
    let motion_handle_for_context = motion_handle.clone();
    let make_context = {
        let storage_by_id = storage_by_id.clone();
        move |camera: &Camera| -> Option<(RecordingContext, vss::StreamConfigHash)> {
            let storage = storage_by_id.get(&camera.id)?.clone();
            let Ok(url) = camera.rtsp_url.parse() else {
                tracing::warn!(camera_id = %camera.id, "unparseable RTSP URL, skipping");
                return None;
            };
            let source = Box::new(RetinaMediaSource::new(
                camera.friendly_name(),
                url,
                retina::client::SessionOptions::default(),
                retina::client::SetupOptions::default(),
            ));
            // The real stream-config hash depends on SDP negotiated only
            // after the source thread connects; this placeholder keys on
            // the camera's URL alone, adequate since a modified RTSP URL
            // is itself grounds for a context rebuild. See DESIGN.md.
            let hash = vss::StreamConfigHash::compute(&camera.rtsp_url, 0, 0, 0, 0);
            let ctx = RecordingContext::spawn(
                camera.id.clone(),
                camera.friendly_name(),
                storage,
                source,
                camera.motion_enabled,
                Some(motion_handle_for_context.clone()),
                None,
            );
            Some((ctx, hash))
        }
    };

    let (commands, command_rx) = keeper::command_channel();
    let reconcile_join = tokio::spawn(keeper::run_reconciliation(
        keeper.clone(),
        clocks.clone(),
        command_rx,
        shutdown_rx.clone(),
        move || assigned_cameras.clone(),
        make_context,
    ));

    // PrunerTarget doesn't implement Clone (it holds Arcs the Pruner
    // expects fresh each refresh), so the closure rebuilds it per call
    // from these cheaply-cloned pieces rather than cloning a cached Vec.
    let pruner_sources: Vec<(Camera, Arc<StorageFile>, Arc<RingFile>)> = cameras
        .iter()
        .filter_map(|c| {
            let files = files_by_id.get(&c.id)?;
            Some((c.clone(), files.storage.clone(), files.ring.clone()))
        })
        .collect();
    let pruner = pruner::Pruner::new(move || {
        pruner_sources
            .iter()
            .map(|(camera, storage, ring)| {
                (
                    camera.clone(),
                    pruner::PrunerTarget {
                        camera_id: camera.id.clone(),
                        storage: storage.clone(),
                        ring: ring.clone(),
                        min_continuous_recording_hours: camera.min_continuous_recording_hours,
                    },
                )
            })
            .collect()
    });
    let pruner_clocks = clocks.clone();
    let pruner_shutdown = shutdown_rx.clone();
    let pruner_join = std::thread::Builder::new()
        .name("pruner".to_string())
        .spawn(move || pruner::run(pruner, pruner_clocks, pruner_shutdown))
        .map_err(Error::from)?;

    let app_state = Arc::new(AppState { cameras: files_by_id, commands, clocks: clocks.clone() });
    let addr = SocketAddr::from(([0, 0, 0, 0], global.http_port));
    let web_shutdown = shutdown_rx.clone();
    let web_join = tokio::spawn(crate::web::serve(addr, app_state, Arc::new(app_root.to_path_buf()), web_shutdown));

    wait_for_shutdown_signal().await;
    tracing::info!("shutdown requested, stopping services in order");
    drop(shutdown_tx);

    match web_join.await {
        Ok(Err(e)) => tracing::warn!(error = %e.chain(), "HTTP server exited with error"),
        Err(e) => tracing::warn!(error = %e, "HTTP server task panicked"),
        Ok(Ok(())) => {}
    }
    if let Err(e) = motion_join.join() {
        tracing::warn!(error = ?e, "motion engine thread panicked");
    }
    {
        let mut host = plugin_host.lock().unwrap();
        host.stop_all();
        host.destroy_all();
    }
    transport.quit();
    if let Err(e) = reconcile_join.await {
        tracing::warn!(error = %e, "reconciliation task panicked");
    }
    if let Err(e) = pruner_join.join() {
        tracing::warn!(error = ?e, "pruner thread panicked");
    }

    Ok(0)
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logging_transport_accepts_all_mount_operations() {
        let t = LoggingTransport;
        t.add_live_mount("/cam-1/live");
        t.add_playback_mount("/cam-1/playback");
        t.remove_mount("/cam-1/live");
        t.quit();
    }

    #[test]
    fn ring_factory_opens_known_camera_and_rejects_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let ring_path = dir.path().join("cam-1.ring");
        let ring = Arc::new(
            RingFile::allocate(&ring_path, storage::ring::MOTION_FLAG_SIZE, 60, 0).unwrap(),
        );
        let mut rings = HashMap::new();
        rings.insert("cam-1".to_string(), ring);
        let factory = RingFactory { rings };

        assert!(factory.open_ring("cam-1").is_ok());
        let err = factory.open_ring("cam-2").unwrap_err();
        assert_eq!(err.kind(), base::ErrorKind::NotFound);
    }
}
