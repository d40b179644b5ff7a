// This file is part of Vigil NVR, a security camera network video recorder.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The Plugin Host: loads motion-event plugins as shared libraries behind a
//! stable C ABI and fans out events to them in insertion order. Only
//! C-POD types cross the boundary; no Rust types are shared across the
//! library edge.

use base::Error;
use libloading::{Library, Symbol};
use std::ffi::c_void;
use std::os::raw::{c_char, c_int};
use std::path::Path;

use crate::motion::{MotionEvent, MotionEventKind, MotionEventSink};

#[cfg(target_os = "linux")]
const PLATFORM_EXTENSION: &str = "so";
#[cfg(target_os = "macos")]
const PLATFORM_EXTENSION: &str = "dylib";
#[cfg(target_os = "windows")]
const PLATFORM_EXTENSION: &str = "dll";

type HostHandle = *const c_void;
type PluginHandle = *mut c_void;

type LoadPluginFn = unsafe extern "C" fn(host_handle: HostHandle) -> PluginHandle;
type StopPluginFn = unsafe extern "C" fn(plugin_handle: PluginHandle);
type DestroyPluginFn = unsafe extern "C" fn(plugin_handle: PluginHandle);
#[allow(clippy::too_many_arguments)]
type PostMotionEventFn = unsafe extern "C" fn(
    plugin_handle: PluginHandle,
    evt: c_int,
    camera_id_utf8: *const c_char,
    ts: i64,
    frame_bytes: *const u8,
    frame_len: usize,
    width: u32,
    height: u32,
    mx: u32,
    my: u32,
    mw: u32,
    mh: u32,
    has_motion: c_int,
);

/// A loaded plugin: the library it came from (kept alive for the process
/// lifetime of the symbols), its resolved entry points, and its opaque
/// handle.
struct LoadedPlugin {
    name: String,
    // Order matters: `handle` must drop before `_library`, and Rust drops
    // struct fields in declaration order, so `_library` is declared last.
    handle: PluginHandle,
    stop: StopPluginFn,
    destroy: DestroyPluginFn,
    post: PostMotionEventFn,
    stopped: bool,
    _library: Library,
}

// SAFETY: plugins are documented as making no threading assumptions about
// the host; `post_motion_event` may be called from any thread. The plugin
// is responsible for its own internal synchronization, matching the ABI's
// contract.
unsafe impl Send for LoadedPlugin {}

fn event_kind_code(kind: MotionEventKind) -> c_int {
    match kind {
        MotionEventKind::Start => 0,
        MotionEventKind::Update => 1,
        MotionEventKind::End => 2,
    }
}

/// Loads every shared library with the platform-native extension found in
/// `dir` at construction time, disqualifying (with a warning, not an
/// error) any that is missing a required symbol.
pub struct PluginHost {
    plugins: Vec<LoadedPlugin>,
}

impl PluginHost {
    pub fn load_dir(dir: &Path, host_handle: HostHandle) -> Result<Self, Error> {
        let mut plugins = Vec::new();
        let entries = match std::fs::read_dir(dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(dir = %dir.display(), "plugin directory does not exist, no plugins loaded");
                return Ok(PluginHost { plugins });
            }
            Err(e) => return Err(Error::from(e)),
        };
        for entry in entries {
            let entry = entry.map_err(Error::from)?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(PLATFORM_EXTENSION) {
                continue;
            }
            match unsafe { Self::load_one(&path, host_handle) } {
                Ok(p) => {
                    tracing::info!(plugin = %p.name, "loaded motion plugin");
                    plugins.push(p);
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "disqualifying plugin");
                }
            }
        }
        Ok(PluginHost { plugins })
    }

    unsafe fn load_one(path: &Path, host_handle: HostHandle) -> Result<LoadedPlugin, libloading::Error> {
        let library = Library::new(path)?;
        let load_plugin: Symbol<LoadPluginFn> = library.get(b"load_plugin\0")?;
        let stop: Symbol<StopPluginFn> = library.get(b"stop_plugin\0")?;
        let destroy: Symbol<DestroyPluginFn> = library.get(b"destroy_plugin\0")?;
        let post: Symbol<PostMotionEventFn> = library.get(b"post_motion_event\0")?;
        let stop = *stop;
        let destroy = *destroy;
        let post = *post;
        let handle = load_plugin(host_handle);
        Ok(LoadedPlugin {
            name: path.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default(),
            handle,
            stop,
            destroy,
            post,
            stopped: false,
            _library: library,
        })
    }

    /// Calls `stop_plugin` on every plugin in insertion order. Safe to call
    /// before [`destroy`](Self::destroy); idempotent per plugin.
    pub fn stop_all(&mut self) {
        for plugin in &mut self.plugins {
            if !plugin.stopped {
                unsafe { (plugin.stop)(plugin.handle) };
                plugin.stopped = true;
            }
        }
    }

    /// Calls `destroy_plugin` on every plugin in insertion order. Plugins
    /// must already be stopped; this also drops their libraries.
    pub fn destroy_all(&mut self) {
        for plugin in self.plugins.drain(..) {
            if !plugin.stopped {
                unsafe { (plugin.stop)(plugin.handle) };
            }
            unsafe { (plugin.destroy)(plugin.handle) };
        }
    }
}

impl MotionEventSink for std::sync::Mutex<PluginHost> {
    /// Dispatches in insertion order; plugins stopped after this call
    /// returns never receive it (enforced by the caller's shutdown
    /// ordering, not by a lock held here).
    fn on_event(&self, event: MotionEvent) {
        let host = self.lock().unwrap();
        let camera_id = match std::ffi::CString::new(event.camera_id.as_str()) {
            Ok(c) => c,
            Err(_) => return,
        };
        let (frame_ptr, frame_len, width, height) = match &event.frame {
            Some(f) => (f.rgb.as_ptr(), f.rgb.len(), f.width, f.height),
            None => (std::ptr::null(), 0, 0, 0),
        };
        let (mx, my, mw, mh) = match event.bbox {
            Some(b) => (b.x, b.y, b.w, b.h),
            None => (0, 0, 0, 0),
        };
        let has_motion = if event.bbox.is_some() { 1 } else { 0 };
        for plugin in &host.plugins {
            if plugin.stopped {
                continue;
            }
            unsafe {
                (plugin.post)(
                    plugin.handle,
                    event_kind_code(event.kind),
                    camera_id.as_ptr(),
                    event.ts_ms,
                    frame_ptr,
                    frame_len,
                    width,
                    height,
                    mx,
                    my,
                    mw,
                    mh,
                    has_motion,
                );
            }
        }
    }
}

impl Drop for PluginHost {
    fn drop(&mut self) {
        if !self.plugins.is_empty() {
            self.destroy_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_dir_loads_no_plugins() {
        let dir = tempfile::tempdir().unwrap();
        let host = PluginHost::load_dir(dir.path(), std::ptr::null()).unwrap();
        assert_eq!(host.plugins.len(), 0);
    }

    #[test]
    fn missing_dir_loads_no_plugins() {
        let host = PluginHost::load_dir(Path::new("/nonexistent/plugins/dir"), std::ptr::null()).unwrap();
        assert_eq!(host.plugins.len(), 0);
    }

    #[test]
    fn event_kind_codes_are_ordered() {
        assert_eq!(event_kind_code(MotionEventKind::Start), 0);
        assert_eq!(event_kind_code(MotionEventKind::Update), 1);
        assert_eq!(event_kind_code(MotionEventKind::End), 2);
    }
}
