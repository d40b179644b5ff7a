// This file is part of Vigil NVR, a security camera network video recorder.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The Media Source: an abstraction over an RTSP ingest pipeline, grounded
//! on the teacher's `stream::Opener`/`stream::Stream` split but reshaped
//! from a pull-based `next()` iterator into the push/callback contract the
//! spec calls for (an SDP callback, a ready callback, and per-media sample
//! callbacks for both video and audio).

use base::{bail_t, Error, ErrorKind};
use bytes::Bytes;
use std::sync::{Arc, Mutex};
use url::Url;

use crate::sdp::{CodecParams, SdpMedia};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Video,
    Audio,
}

/// Per-sample context handed to [`MediaSink::on_sample`]. Everything a
/// caller would need to interpret the frame without tracking its own
/// running state.
#[derive(Clone, Debug)]
pub struct SampleContext {
    /// Wall-clock time the stream's zero source PTS maps to; fixed once per
    /// source session.
    pub stream_start_ms: i64,
    /// The sample's PTS as reported by the source, in its own clock units
    /// converted to milliseconds (after missing-PTS recovery).
    pub source_pts_ms: i64,
    /// `stream_start_ms + source_pts_ms`: the timestamp frames are written
    /// to Storage with.
    pub derived_pts_ms: i64,
    pub audio_channels: Option<u16>,
    pub audio_sample_rate: Option<u32>,
    /// Current codec caps, serialized to a small text form (base64'd
    /// parameter sets, joined), for callers that want a self-contained
    /// description without reaching back into the SDP.
    pub codec_caps: String,
    pub sdp_attributes: Vec<String>,
}

/// Receives the callbacks a [`MediaSource`] delivers. Implementations must
/// tolerate being called from any internal source thread; invocation is
/// serialized per media kind but not across kinds.
pub trait MediaSink: Send + Sync {
    /// Delivered once per media, before any sample of that media kind.
    fn on_sdp(&self, kind: MediaKind, media: &SdpMedia);

    /// Delivered once, after the pipeline is prerolled (SDP known for every
    /// media the camera advertises and about to deliver samples).
    fn on_ready(&self);

    fn on_sample(&self, kind: MediaKind, ctx: &SampleContext, data: Bytes, key: bool) -> Result<(), Error>;
}

/// Abstraction over an RTSP ingest pipeline. Implementations run their own
/// internal pipeline and invoke `sink`'s callbacks from whatever thread
/// that pipeline drives.
pub trait MediaSource: Send {
    /// Runs until `shutdown` fires or an unrecoverable error occurs. Errors
    /// after the first sample propagate to the caller, which tears down and
    /// rebuilds the owning Recording Context; errors before the first
    /// sample have already gone through one compat-flag retry internally.
    fn run(self: Box<Self>, sink: Arc<dyn MediaSink>, shutdown: base::shutdown::Receiver) -> Result<(), Error>;
}

/// Tracks the single wall-clock anchor shared by every media kind in a
/// source session: set once from whichever sample (video or audio) arrives
/// first, never shifted afterward.
#[derive(Default)]
struct StreamStartAnchor(Option<i64>);

impl StreamStartAnchor {
    fn derive(&mut self, now_ms: i64, source_pts_ms: i64) -> i64 {
        let start = *self.0.get_or_insert_with(|| now_ms - source_pts_ms);
        start + source_pts_ms
    }
}

/// Per-media-kind PTS bookkeeping: missing-PTS recovery and the SEI/IDR
/// split-timestamp-reuse buffer.
#[derive(Default)]
struct PtsTracker {
    last_valid_pts: Option<i64>,
    /// A PTS seen on a preceding non-picture unit, held for reuse by the
    /// next picture that arrives with no PTS of its own.
    buffered_pts: Option<i64>,
}

impl PtsTracker {
    /// Records a PTS-bearing sample that doesn't itself carry a displayable
    /// picture (e.g. an SEI NAL demuxed ahead of its IDR). Overwrites any
    /// previously buffered value, since the spec only promises reuse for
    /// the most recent such sample.
    fn note_non_picture_pts(&mut self, pts_ms: i64) {
        self.buffered_pts = Some(pts_ms);
    }

    /// Resolves the PTS to use for an incoming sample, applying missing-PTS
    /// recovery and, for pictures with no PTS of their own, SEI/IDR split
    /// timestamp reuse.
    fn resolve(&mut self, source_pts_ms: Option<i64>, is_picture: bool) -> i64 {
        let resolved = match source_pts_ms {
            Some(p) => {
                self.buffered_pts = None;
                p
            }
            None if is_picture => self
                .buffered_pts
                .take()
                .unwrap_or_else(|| self.last_valid_pts.map(|p| p + 1).unwrap_or(0)),
            None => self.last_valid_pts.map(|p| p + 1).unwrap_or(0),
        };
        self.last_valid_pts = Some(resolved);
        resolved
    }
}

/// Shared bookkeeping a `MediaSource` implementation drives through to
/// build each sample's [`SampleContext`] per the spec's algorithmic
/// choices. Not itself part of the public contract; implementations own
/// one per source session.
#[derive(Default)]
pub(crate) struct AnchorState {
    start: Mutex<StreamStartAnchor>,
    video_pts: Mutex<PtsTracker>,
    audio_pts: Mutex<PtsTracker>,
}

impl AnchorState {
    pub(crate) fn resolve(&self, kind: MediaKind, now_ms: i64, source_pts_ms: Option<i64>, is_picture: bool) -> (i64, i64) {
        let tracker = match kind {
            MediaKind::Video => &self.video_pts,
            MediaKind::Audio => &self.audio_pts,
        };
        let source_pts_ms = tracker.lock().unwrap().resolve(source_pts_ms, is_picture);
        let derived = self.start.lock().unwrap().derive(now_ms, source_pts_ms);
        (source_pts_ms, derived)
    }

    pub(crate) fn note_non_picture_pts(&self, kind: MediaKind, pts_ms: i64) {
        let tracker = match kind {
            MediaKind::Video => &self.video_pts,
            MediaKind::Audio => &self.audio_pts,
        };
        tracker.lock().unwrap().note_non_picture_pts(pts_ms);
    }
}

/// Wall-clock milliseconds since the Unix epoch. Ingest is inherently
/// real-time (it's pacing a live RTSP stream), so unlike the reconciliation
/// and pruning loops this doesn't go through `base::clock::Clocks` for
/// simulated-clock testability.
fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Extracts the codec params this crate persists from retina's parsed
/// video parameters: the decoder's extra-data blob (an AvcDecoderConfig for
/// H.264, carrying SPS/PPS) as the sole parameter set, and retina's own
/// rfc6381 codec string verbatim for export muxing and the `/cameras`
/// codec summary.
fn params_to_codec_params(params: &retina::codec::VideoParameters) -> CodecParams {
    CodecParams {
        parameter_sets: vec![params.extra_data().to_vec()],
        raw_fmtp: Some(params.rfc6381_codec().to_owned()),
    }
}

/// The real implementation: an RTSP ingest pipeline backed by the `retina`
/// crate, exactly as the teacher's stream handling does for its own
/// single-track ingest, generalized to both video and audio sub-streams.
pub struct RetinaMediaSource {
    url: Url,
    session_options: retina::client::SessionOptions,
    setup_options: retina::client::SetupOptions,
    label: String,
}

impl RetinaMediaSource {
    pub fn new(label: String, url: Url, session_options: retina::client::SessionOptions, setup_options: retina::client::SetupOptions) -> Self {
        RetinaMediaSource {
            url,
            session_options,
            setup_options,
            label,
        }
    }

    async fn connect(&self, compat: bool) -> Result<(retina::client::Demuxed, Option<usize>, Option<usize>), Error> {
        let mut options = self.session_options.clone();
        if compat {
            options = options.user_agent(format!("{} (compat)", Self::user_agent()));
        } else {
            options = options.user_agent(Self::user_agent());
        }
        let mut session = retina::client::Session::describe(self.url.clone(), options)
            .await
            .map_err(|e| Error::wrap(ErrorKind::Unknown, e))?;
        tracing::debug!(label = %self.label, tool = ?session.tool(), "connected");

        let video_i = session
            .streams()
            .iter()
            .position(|s| s.media() == "video" && matches!(s.encoding_name(), "h264" | "h265"));
        let audio_i = session
            .streams()
            .iter()
            .position(|s| s.media() == "audio");

        if video_i.is_none() && audio_i.is_none() {
            bail_t!(FailedPrecondition, "{}: no usable video or audio stream", self.label);
        }
        for i in [video_i, audio_i].into_iter().flatten() {
            session
                .setup(i, self.setup_options.clone())
                .await
                .map_err(|e| Error::wrap(ErrorKind::Unknown, e))?;
        }
        let played = session
            .play(retina::client::PlayOptions::default())
            .await
            .map_err(|e| Error::wrap(ErrorKind::Unknown, e))?;
        let demuxed = played.demuxed().map_err(|e| Error::wrap(ErrorKind::Unknown, e))?;
        Ok((demuxed, video_i, audio_i))
    }

    fn user_agent() -> String {
        format!("Vigil NVR {}", env!("CARGO_PKG_VERSION"))
    }

    async fn run_async(self: Box<Self>, sink: Arc<dyn MediaSink>, shutdown: base::shutdown::Receiver) -> Result<(), Error> {
        use futures::StreamExt;

        let (mut session, video_i, audio_i) = match self.connect(false).await {
            Ok(s) => s,
            Err(_) => self.connect(true).await?,
        };

        let anchors = AnchorState::default();
        let mut video_sdp_sent = video_i.is_none();
        let mut audio_sdp_sent = audio_i.is_none();
        let mut ready_sent = false;
        let mut video_codec_caps = String::new();

        loop {
            let item = tokio::select! {
                item = std::pin::Pin::new(&mut session).next() => item,
                _ = shutdown.future() => return Ok(()),
            };
            let item = match item {
                None => bail_t!(Unavailable, "{}: stream closed", self.label),
                Some(r) => r.map_err(|e| Error::wrap(ErrorKind::Unknown, e))?,
            };

            match item {
                retina::codec::CodecItem::VideoFrame(v) => {
                    if !video_sdp_sent {
                        if let Some(i) = video_i {
                            if let Some(retina::codec::ParametersRef::Video(p)) = session.streams()[i].parameters() {
                                let media = SdpMedia {
                                    kind: MediaKind::Video,
                                    payload_type: 0,
                                    clock_rate: 90_000,
                                    encoding_name: session.streams()[i].encoding_name().to_string(),
                                    params: params_to_codec_params(p),
                                    framerate: None,
                                    channels: None,
                                    raw_attributes: Vec::new(),
                                };
                                video_codec_caps = media.params.to_caps_string();
                                sink.on_sdp(MediaKind::Video, &media);
                                video_sdp_sent = true;
                            }
                        }
                    }
                    if !ready_sent && video_sdp_sent && audio_sdp_sent {
                        sink.on_ready();
                        ready_sent = true;
                    }
                    let now_ms = now_ms();
                    let is_key = v.is_random_access_point();
                    let (source_pts_ms, derived_pts_ms) = anchors.resolve(MediaKind::Video, now_ms, Some(v.timestamp().elapsed()), true);
                    let ctx = SampleContext {
                        stream_start_ms: now_ms - source_pts_ms,
                        source_pts_ms,
                        derived_pts_ms,
                        audio_channels: None,
                        audio_sample_rate: None,
                        codec_caps: video_codec_caps.clone(),
                        sdp_attributes: Vec::new(),
                    };
                    sink.on_sample(MediaKind::Video, &ctx, v.into_data(), is_key)?;
                }
                retina::codec::CodecItem::AudioFrame(a) => {
                    if !audio_sdp_sent {
                        if let Some(i) = audio_i {
                            let media = SdpMedia {
                                kind: MediaKind::Audio,
                                payload_type: 0,
                                clock_rate: 0,
                                encoding_name: session.streams()[i].encoding_name().to_string(),
                                params: CodecParams::default(),
                                framerate: None,
                                channels: None,
                                raw_attributes: Vec::new(),
                            };
                            sink.on_sdp(MediaKind::Audio, &media);
                            audio_sdp_sent = true;
                        }
                    }
                    if !ready_sent && video_sdp_sent && audio_sdp_sent {
                        sink.on_ready();
                        ready_sent = true;
                    }
                    let now_ms = now_ms();
                    let (source_pts_ms, derived_pts_ms) = anchors.resolve(MediaKind::Audio, now_ms, Some(a.timestamp().elapsed()), true);
                    let ctx = SampleContext {
                        stream_start_ms: now_ms - source_pts_ms,
                        source_pts_ms,
                        derived_pts_ms,
                        audio_channels: None,
                        audio_sample_rate: None,
                        codec_caps: String::new(),
                        sdp_attributes: Vec::new(),
                    };
                    sink.on_sample(MediaKind::Audio, &ctx, a.into_data(), false)?;
                }
                _ => {}
            }
        }
    }
}

impl MediaSource for RetinaMediaSource {
    fn run(self: Box<Self>, sink: Arc<dyn MediaSink>, shutdown: base::shutdown::Receiver) -> Result<(), Error> {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| Error::wrap(ErrorKind::Internal, e))?;
        rt.block_on(self.run_async(sink, shutdown))
    }
}

/// A pre-scripted sample, for [`MockMediaSource`].
pub struct ScriptedSample {
    pub kind: MediaKind,
    pub source_pts_ms: Option<i64>,
    pub data: Bytes,
    pub key: bool,
}

/// An in-memory test double that replays a fixed sequence of samples,
/// grounded on the teacher's `testutil::Mp4Stream` mock stream.
pub struct MockMediaSource {
    video_sdp: Option<SdpMedia>,
    audio_sdp: Option<SdpMedia>,
    samples: Vec<ScriptedSample>,
    now_ms: i64,
}

impl MockMediaSource {
    pub fn new(video_sdp: Option<SdpMedia>, audio_sdp: Option<SdpMedia>, samples: Vec<ScriptedSample>, now_ms: i64) -> Self {
        MockMediaSource {
            video_sdp,
            audio_sdp,
            samples,
            now_ms,
        }
    }
}

impl MediaSource for MockMediaSource {
    fn run(self: Box<Self>, sink: Arc<dyn MediaSink>, shutdown: base::shutdown::Receiver) -> Result<(), Error> {
        if let Some(m) = &self.video_sdp {
            sink.on_sdp(MediaKind::Video, m);
        }
        if let Some(m) = &self.audio_sdp {
            sink.on_sdp(MediaKind::Audio, m);
        }
        sink.on_ready();

        let video_caps = self.video_sdp.as_ref().map(|m| m.params.to_caps_string()).unwrap_or_default();
        let audio_caps = self.audio_sdp.as_ref().map(|m| m.params.to_caps_string()).unwrap_or_default();

        let anchors = AnchorState::default();
        for sample in self.samples {
            shutdown.check().map_err(|_| Error::from(ErrorKind::Cancelled))?;
            let (source_pts_ms, derived_pts_ms) = anchors.resolve(sample.kind, self.now_ms, sample.source_pts_ms, true);
            let codec_caps = match sample.kind {
                MediaKind::Video => video_caps.clone(),
                MediaKind::Audio => audio_caps.clone(),
            };
            let ctx = SampleContext {
                stream_start_ms: self.now_ms - source_pts_ms,
                source_pts_ms,
                derived_pts_ms,
                audio_channels: None,
                audio_sample_rate: None,
                codec_caps,
                sdp_attributes: Vec::new(),
            };
            sink.on_sample(sample.kind, &ctx, sample.data, sample.key)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct RecordingSink {
        samples: Mutex<Vec<(MediaKind, i64, bool)>>,
        ready_count: AtomicUsize,
    }

    impl MediaSink for RecordingSink {
        fn on_sdp(&self, _kind: MediaKind, _media: &SdpMedia) {}
        fn on_ready(&self) {
            self.ready_count.fetch_add(1, Ordering::SeqCst);
        }
        fn on_sample(&self, kind: MediaKind, ctx: &SampleContext, _data: Bytes, key: bool) -> Result<(), Error> {
            self.samples.lock().unwrap().push((kind, ctx.derived_pts_ms, key));
            Ok(())
        }
    }

    #[test]
    fn stream_start_anchors_once() {
        let anchors = AnchorState::default();
        let (_, d1) = anchors.resolve(MediaKind::Video, 10_000, Some(500), true);
        let (_, d2) = anchors.resolve(MediaKind::Video, 10_100, Some(600), true);
        assert_eq!(d1, 10_000);
        assert_eq!(d2 - d1, 100);
    }

    #[test]
    fn missing_pts_preserves_monotonicity() {
        let anchors = AnchorState::default();
        let (p1, _) = anchors.resolve(MediaKind::Video, 0, Some(100), true);
        let (p2, _) = anchors.resolve(MediaKind::Video, 0, None, true);
        let (p3, _) = anchors.resolve(MediaKind::Video, 0, Some(250), true);
        assert_eq!(p1, 100);
        assert_eq!(p2, 101);
        assert_eq!(p3, 250);
    }

    #[test]
    fn sei_buffered_pts_reused_by_next_picture() {
        let anchors = AnchorState::default();
        anchors.note_non_picture_pts(MediaKind::Video, 777);
        let (pts, _) = anchors.resolve(MediaKind::Video, 0, None, true);
        assert_eq!(pts, 777);
    }

    #[test]
    fn mock_source_replays_in_order() {
        let sink = Arc::new(RecordingSink {
            samples: Mutex::new(Vec::new()),
            ready_count: AtomicUsize::new(0),
        });
        let source = Box::new(MockMediaSource::new(
            None,
            None,
            vec![
                ScriptedSample { kind: MediaKind::Video, source_pts_ms: Some(0), data: Bytes::new(), key: true },
                ScriptedSample { kind: MediaKind::Video, source_pts_ms: Some(33), data: Bytes::new(), key: false },
            ],
            1_000_000,
        ));
        let (_tx, rx) = base::shutdown::channel();
        source.run(sink.clone(), rx).unwrap();
        assert_eq!(sink.ready_count.load(Ordering::SeqCst), 1);
        let samples = sink.samples.lock().unwrap();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].1, 1_000_000);
        assert_eq!(samples[1].1, 1_000_033);
    }

    struct CapsSink {
        caps: Mutex<Vec<(MediaKind, String)>>,
    }

    impl MediaSink for CapsSink {
        fn on_sdp(&self, _kind: MediaKind, _media: &SdpMedia) {}
        fn on_ready(&self) {}
        fn on_sample(&self, kind: MediaKind, ctx: &SampleContext, _data: Bytes, _key: bool) -> Result<(), Error> {
            self.caps.lock().unwrap().push((kind, ctx.codec_caps.clone()));
            Ok(())
        }
    }

    #[test]
    fn mock_source_propagates_codec_caps_from_sdp() {
        let video_sdp = SdpMedia {
            kind: MediaKind::Video,
            payload_type: 96,
            clock_rate: 90_000,
            encoding_name: "H264".to_string(),
            params: CodecParams {
                parameter_sets: vec![vec![1, 2, 3]],
                raw_fmtp: Some("avc1.4d001e".to_string()),
            },
            framerate: None,
            channels: None,
            raw_attributes: vec![],
        };
        let sink = Arc::new(CapsSink { caps: Mutex::new(Vec::new()) });
        let source = Box::new(MockMediaSource::new(
            Some(video_sdp),
            None,
            vec![ScriptedSample { kind: MediaKind::Video, source_pts_ms: Some(0), data: Bytes::new(), key: true }],
            0,
        ));
        let (_tx, rx) = base::shutdown::channel();
        source.run(sink.clone(), rx).unwrap();
        let caps = sink.caps.lock().unwrap();
        assert_eq!(caps.len(), 1);
        assert_eq!(caps[0].1, "avc1.4d001e|AQID");
    }
}
