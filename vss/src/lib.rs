// This file is part of Vigil NVR, a security camera network video recorder.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Video Surveillance Service: RTSP ingest, motion detection, plugin
//! dispatch, and RTSP/HTTP re-streaming over the `storage` crate's
//! block-structured archive.

pub mod camera;
pub mod keeper;
pub mod motion;
pub mod plugin;
pub mod pruner;
pub mod recording;
pub mod sdp;
pub mod source;

#[cfg(any(test, feature = "testutil"))]
pub mod testutil;

pub use camera::{AssignmentState, Camera, Credentials, StreamConfigHash};
pub use keeper::{Command, CommandHandle, RtspTransport, StreamKeeper};
pub use motion::{ByteDiffDecoder, MotionEngineHandle, MotionEvent, MotionEventKind, MotionEventSink, MotionStateFactory, MotionWorkItem};
pub use plugin::PluginHost;
pub use pruner::{Pruner, PrunerTarget};
pub use recording::{RecordingContext, RestreamSink, SubscriberFrame};
pub use sdp::{CodecParams, SdpMedia};
pub use source::{MediaKind, MediaSink, MediaSource, SampleContext};
