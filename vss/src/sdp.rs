// This file is part of Vigil NVR, a security camera network video recorder.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Parsed per-media SDP description, as delivered once by a Media Source's
//! SDP callback before any samples arrive. Immutable for the life of a
//! source session.

use crate::source::MediaKind;

/// Codec-specific out-of-band parameters carried in the SDP `fmtp` line.
/// For H.264/H.265 this is the decoder's config record (carrying SPS/PPS);
/// for audio codecs it's typically just a clock rate and channel count,
/// already reflected in the surrounding [`SdpMedia`] fields.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CodecParams {
    /// Codec-specific decoder config blobs (e.g. an AvcDecoderConfigurationRecord
    /// for H.264), opaque to this type.
    pub parameter_sets: Vec<Vec<u8>>,
    /// The `fmtp` attribute value verbatim, for parameters this type
    /// doesn't otherwise break out.
    pub raw_fmtp: Option<String>,
}

impl CodecParams {
    /// Serializes to the small text form [`crate::source::SampleContext::codec_caps`]
    /// carries: the `fmtp` string (if any) followed by each parameter set
    /// base64'd and comma-joined, so a caller has a self-contained
    /// description without reaching back into the SDP.
    pub fn to_caps_string(&self) -> String {
        let sets = self
            .parameter_sets
            .iter()
            .map(|ps| data_encoding::BASE64.encode(ps))
            .collect::<Vec<_>>()
            .join(",");
        match &self.raw_fmtp {
            Some(fmtp) => format!("{fmtp}|{sets}"),
            None => sets,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SdpMedia {
    pub kind: MediaKind,
    pub payload_type: u8,
    pub clock_rate: u32,
    pub encoding_name: String,
    pub params: CodecParams,
    /// Frame rate from the `framerate` attribute, if the camera sent one.
    pub framerate: Option<f64>,
    /// Channel count, audio only.
    pub channels: Option<u16>,
    /// The raw `a=` attribute lines for this media, verbatim, for callers
    /// that need something this struct doesn't break out.
    pub raw_attributes: Vec<String>,
}

impl SdpMedia {
    pub fn is_h264(&self) -> bool {
        self.encoding_name.eq_ignore_ascii_case("h264")
    }

    pub fn is_h265(&self) -> bool {
        self.encoding_name.eq_ignore_ascii_case("h265")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caps_string_joins_fmtp_and_base64_parameter_sets() {
        let params = CodecParams {
            parameter_sets: vec![vec![0x01, 0x4d, 0x00, 0x1e], vec![0x68, 0xee]],
            raw_fmtp: Some("avc1.4d001e".to_string()),
        };
        assert_eq!(params.to_caps_string(), "avc1.4d001e|AU0AHg==,aO4=");
    }

    #[test]
    fn caps_string_with_no_fmtp_omits_prefix() {
        let params = CodecParams { parameter_sets: vec![vec![1, 2, 3]], raw_fmtp: None };
        assert_eq!(params.to_caps_string(), "AQID");
    }

    #[test]
    fn is_h264_matches_case_insensitively() {
        let media = SdpMedia {
            kind: MediaKind::Video,
            payload_type: 96,
            clock_rate: 90_000,
            encoding_name: "H264".to_string(),
            params: CodecParams::default(),
            framerate: Some(30.0),
            channels: None,
            raw_attributes: vec![],
        };
        assert!(media.is_h264());
        assert!(!media.is_h265());
    }
}
