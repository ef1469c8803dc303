// This file is part of Osprey DVR, a security camera recording aggregator.
// Copyright (C) 2021 The Osprey DVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! JSON-compatible serde types for the web API, the peer protocol, and the
//! persisted camera state.

use serde::de::{self, SeqAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// The `/check` reply of a feed peer: just enough to decide whether a full
/// `/status` fetch is worthwhile.
#[derive(Debug, Deserialize)]
pub struct CheckResponse {
    pub host: String,

    /// Opaque change stamp. Zero means the peer doesn't report one.
    #[serde(default)]
    pub updated: i64,
}

/// The `/status` reply of a feed peer.
#[derive(Debug, Deserialize)]
pub struct StatusResponse {
    pub host: String,

    #[serde(default)]
    pub updated: i64,

    pub cctv: CctvStatus,
}

#[derive(Debug, Deserialize)]
pub struct CctvStatus {
    /// Operator-facing console URL on the peer.
    pub console: String,

    /// Free space in the peer's own units, e.g. `"12G"` or `"500M"`.
    #[serde(default)]
    pub available: String,

    /// Live cameras by device name. `None` when the peer omits the key
    /// entirely, which is distinct from an empty map.
    pub feeds: Option<BTreeMap<String, String>>,

    #[serde(default)]
    pub recordings: Vec<RecordingEntry>,
}

/// One `recordings` tuple: `[<epoch>, "<path>", <size>]` with an optional
/// fourth boolean "stable" element. Extra elements are ignored.
#[derive(Debug, PartialEq, Eq)]
pub struct RecordingEntry {
    pub modified: i64,
    pub path: String,
    pub size: u64,
    pub stable: Option<bool>,
}

impl<'de> Deserialize<'de> for RecordingEntry {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct V;

        impl<'de> Visitor<'de> for V {
            type Value = RecordingEntry;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a [modified, path, size, stable?] array")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
                let modified = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(0, &self))?;
                let path = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(1, &self))?;
                let size = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(2, &self))?;

                // Only a boolean fourth element is a stability marker; legacy
                // peers put other things there.
                let stable = match seq.next_element::<serde_json::Value>()? {
                    Some(serde_json::Value::Bool(b)) => Some(b),
                    _ => None,
                };
                while seq.next_element::<de::IgnoredAny>()?.is_some() {}
                Ok(RecordingEntry {
                    modified,
                    path,
                    size,
                    stable,
                })
            }
        }

        deserializer.deserialize_seq(V)
    }
}

/// The `providers` list returned by the service portal for one service tag.
#[derive(Debug, Deserialize)]
pub struct PortalList {
    #[serde(default)]
    pub providers: Vec<String>,
}

/// Toplevel status document served at `/dvr/status`.
#[derive(Debug, Serialize)]
pub struct TopLevel<'a> {
    pub host: &'a str,
    pub proxy: &'a str,
    pub timestamp: i64,
    pub dvr: DvrStatus,
}

#[derive(Debug, Serialize)]
pub struct DvrStatus {
    pub servers: Vec<ServerStatus>,
    pub feed: Vec<FeedStatus>,
    pub storage: StorageStatus,
    pub queue: Vec<QueueEntry>,
}

#[derive(Debug, Serialize)]
pub struct ServerStatus {
    pub name: String,
    pub url: String,

    /// Normalized free space, e.g. `"12288 MB"`.
    pub space: String,
    pub timestamp: i64,
}

#[derive(Debug, Serialize)]
pub struct FeedStatus {
    pub name: String,
    pub url: String,
    pub timestamp: i64,
}

#[derive(Debug, Serialize)]
pub struct StorageStatus {
    pub path: String,
    pub size: u64,
    pub free: u64,
}

#[derive(Debug, Serialize)]
pub struct QueueEntry {
    pub feed: String,
    pub path: String,
    pub size: u64,
    pub state: &'static str,
}

/// One row of the `/dvr/storage/daily` listing.
#[derive(Debug, PartialEq, Eq, Serialize)]
pub struct DayRecording {
    pub src: String,
    pub time: String,
    pub size: u64,
    pub video: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

/// The state blob persisted across restarts: every camera name ever seen,
/// so the UI can keep offering archived footage of retired cameras.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct SavedState {
    #[serde(default)]
    pub cameras: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_entry_forms() {
        let three: RecordingEntry =
            serde_json::from_str(r#"[1714571100, "2024/05/01/14-00-00-a.mkv", 1048576]"#).unwrap();
        assert_eq!(
            three,
            RecordingEntry {
                modified: 1714571100,
                path: "2024/05/01/14-00-00-a.mkv".to_owned(),
                size: 1048576,
                stable: None,
            }
        );

        let four: RecordingEntry =
            serde_json::from_str(r#"[1714571100, "2024/05/01/14-00-00-a.mkv", 1048576, true]"#)
                .unwrap();
        assert_eq!(four.stable, Some(true));

        // A non-boolean fourth element is not a stability marker.
        let odd: RecordingEntry =
            serde_json::from_str(r#"[1714571100, "2024/05/01/14-00-00-a.mkv", 1048576, "x", 5]"#)
                .unwrap();
        assert_eq!(odd.stable, None);

        serde_json::from_str::<RecordingEntry>(r#"[1714571100, "p"]"#).unwrap_err();
    }

    #[test]
    fn status_response() {
        let s: StatusResponse = serde_json::from_str(
            r#"{
                "host": "p1",
                "updated": 42,
                "cctv": {
                    "console": "http://p1/ui",
                    "available": "12G",
                    "feeds": {"a": "http://p1/a/stream"},
                    "recordings": [[1714571100, "2024/05/01/14-00-00-a.mkv", 1048576]]
                }
            }"#,
        )
        .unwrap();
        assert_eq!(s.host, "p1");
        assert_eq!(s.updated, 42);
        assert_eq!(s.cctv.console, "http://p1/ui");
        assert_eq!(s.cctv.available, "12G");
        assert_eq!(
            s.cctv.feeds.as_ref().unwrap().get("a").map(String::as_str),
            Some("http://p1/a/stream")
        );
        assert_eq!(s.cctv.recordings.len(), 1);
    }

    #[test]
    fn status_response_legacy() {
        // Minimal legacy peer: no updated, no available, no recordings.
        let s: StatusResponse = serde_json::from_str(
            r#"{"host": "p2", "cctv": {"console": "http://p2/ui", "feeds": {}}}"#,
        )
        .unwrap();
        assert_eq!(s.updated, 0);
        assert_eq!(s.cctv.available, "");
        assert!(s.cctv.feeds.as_ref().unwrap().is_empty());
        assert!(s.cctv.recordings.is_empty());
    }

    #[test]
    fn saved_state_round_trip() {
        let s = SavedState {
            cameras: vec!["p1:a".to_owned(), "p1:b".to_owned()],
        };
        let encoded = serde_json::to_string(&s).unwrap();
        assert_eq!(encoded, r#"{"cameras":["p1:a","p1:b"]}"#);
        let decoded: SavedState = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.cameras, s.cameras);
    }
}
