// This file is part of Vigil NVR, a security camera network video recorder.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! JSON response bodies for the metadata endpoints.

use serde_json::{json, Value};
use vss::Camera;

/// `GET /cameras`: the camera inventory. Credentials are never echoed
/// back in full, matching the blob tree's treatment of codec payloads as
/// opaque but metadata as plain JSON.
pub(super) fn cameras(cameras: &[Camera], is_recording: impl Fn(&str) -> bool) -> Value {
    let entries: Vec<Value> = cameras
        .iter()
        .map(|c| {
            json!({
                "id": c.id,
                "display_name": c.display_name,
                "network_address": c.network_address,
                "assignment_state": c.assignment_state,
                "motion_enabled": c.motion_enabled,
                "has_credentials": c.credentials.is_some(),
                "recording": is_recording(&c.id),
            })
        })
        .collect();
    json!({ "cameras": entries })
}

/// `GET /contents`: list of content segments.
pub(super) fn segments(segments: &[(i64, i64)]) -> Value {
    let entries: Vec<Value> = segments.iter().map(|(s, e)| json!({ "start_ms": s, "end_ms": e })).collect();
    json!({ "segments": entries })
}

/// `GET /motions`: raw per-second samples.
pub(super) fn motion_samples(samples: &[(i64, bool)]) -> Value {
    let entries: Vec<Value> = samples.iter().map(|(ts_s, significant)| json!({ "ts_s": ts_s, "motion": significant })).collect();
    json!({ "samples": entries })
}

/// `GET /motion_events`: coalesced motion segments.
pub(super) fn motion_events(events: &[(i64, i64)]) -> Value {
    let entries: Vec<Value> = events.iter().map(|(s, e)| json!({ "start_s": s, "end_s": e })).collect();
    json!({ "events": entries })
}

/// `GET /analytics`: metadata blobs, each decoded as JSON if possible and
/// otherwise passed through base64-encoded.
pub(super) fn analytics(entries: &[storage::MetadataEntry]) -> Value {
    let out: Vec<Value> = entries
        .iter()
        .map(|e| {
            let blob = serde_json::from_slice::<Value>(&e.blob)
                .unwrap_or_else(|_| json!(data_encoding::BASE64.encode(&e.blob)));
            json!({ "stream_tag": e.stream_tag, "timestamp_ms": e.timestamp_ms, "blob": blob })
        })
        .collect();
    json!({ "entries": out })
}

#[cfg(test)]
mod tests {
    use super::*;
    use vss::{AssignmentState, Camera};

    fn sample_camera() -> Camera {
        Camera {
            id: "cam-1".to_string(),
            display_name: "Front Door".to_string(),
            network_address: "192.0.2.5".to_string(),
            rtsp_url: String::new(),
            credentials: None,
            assignment_state: AssignmentState::Assigned,
            storage_path: Default::default(),
            block_size: 1,
            block_count: 1,
            motion_enabled: true,
            motion_storage_path: Default::default(),
            motion_pruning_enabled: true,
            min_continuous_recording_hours: 24,
        }
    }

    #[test]
    fn cameras_json_redacts_credentials_to_a_flag() {
        let v = cameras(&[sample_camera()], |_| true);
        assert_eq!(v["cameras"][0]["has_credentials"], false);
        assert_eq!(v["cameras"][0]["recording"], true);
        assert!(v["cameras"][0].get("credentials").is_none());
    }

    #[test]
    fn motion_events_json_shape() {
        let v = motion_events(&[(10, 20), (30, 30)]);
        assert_eq!(v["events"][0]["start_s"], 10);
        assert_eq!(v["events"][1]["end_s"], 30);
    }
}
