// This file is part of Vigil NVR, a security camera network video recorder.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Bespoke on-disk storage for camera recordings: a block-structured,
//! bounded-retention archive of video/audio frames (the Storage File), a
//! fixed-capacity circular file for motion records (the Ring File), and a
//! co-located JSON metadata log.

pub mod blobtree;
pub mod block;
pub mod catalog;
pub mod coding;
pub mod file;
pub mod metadata;
pub mod ring;

#[cfg(any(test, feature = "testutil"))]
pub mod testutil;

pub use block::{CodecInfo, MediaType, StreamTag};
pub use catalog::{Catalog, CatalogEntry};
pub use file::{MediaTypeMask, StorageFile};
pub use metadata::{MetadataEntry, MetadataStore};
pub use ring::{coalesce_segments, RingFile};
