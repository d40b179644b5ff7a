// This file is part of Vigil NVR, a security camera network video recorder.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Decodes request paths.

/// A decoded request path. Every endpoint here takes its arguments from
/// the query string, not the path itself, so this only needs to
/// distinguish the fixed route names.
#[derive(Debug, Eq, PartialEq)]
pub(super) enum Path {
    Cameras,       // "/cameras"
    Contents,      // "/contents"
    KeyFrame,      // "/key_frame"
    Jpg,           // "/jpg"
    Video,         // "/video"
    Export,        // "/export"
    Motions,       // "/motions"
    MotionEvents,  // "/motion_events"
    Analytics,     // "/analytics"
    NotFound,
}

impl Path {
    /// Decodes a request path, not including any query parameters.
    pub(super) fn decode(path: &str) -> Self {
        let path = path.strip_prefix('/').unwrap_or(path);
        match path {
            "cameras" => Path::Cameras,
            "contents" => Path::Contents,
            "key_frame" => Path::KeyFrame,
            "jpg" => Path::Jpg,
            "video" => Path::Video,
            "export" => Path::Export,
            "motions" => Path::Motions,
            "motion_events" => Path::MotionEvents,
            "analytics" => Path::Analytics,
            _ => Path::NotFound,
        }
    }
}

#[cfg(test)]
mod tests {
    #[test]
    fn paths() {
        use super::Path;
        assert_eq!(Path::decode("/cameras"), Path::Cameras);
        assert_eq!(Path::decode("/contents"), Path::Contents);
        assert_eq!(Path::decode("/key_frame"), Path::KeyFrame);
        assert_eq!(Path::decode("/jpg"), Path::Jpg);
        assert_eq!(Path::decode("/video"), Path::Video);
        assert_eq!(Path::decode("/export"), Path::Export);
        assert_eq!(Path::decode("/motions"), Path::Motions);
        assert_eq!(Path::decode("/motion_events"), Path::MotionEvents);
        assert_eq!(Path::decode("/analytics"), Path::Analytics);
        assert_eq!(Path::decode("/junk"), Path::NotFound);
        assert_eq!(Path::decode("/"), Path::NotFound);
    }
}
