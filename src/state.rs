// This file is part of Osprey DVR, a security camera recording aggregator.
// Copyright (C) 2021 The Osprey DVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Persistence of the small JSON state blob that must survive restarts.

use crate::json;
use base::{ErrorKind, ResultExt};
use log::info;
use std::io::Write;
use std::path::PathBuf;

/// Saves and restores [`json::SavedState`] at a fixed path.
///
/// Writes go through a temporary file in the same directory followed by a
/// rename, so a crash mid-write never clobbers the previous snapshot.
pub struct StateFile {
    path: PathBuf,
}

impl StateFile {
    pub fn new(path: PathBuf) -> Self {
        StateFile { path }
    }

    /// Loads the saved state. A missing file is a fresh install, not an error.
    pub fn load(&self) -> Result<json::SavedState, base::Error> {
        let data = match std::fs::read(&self.path) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(json::SavedState::default())
            }
            Err(e) => {
                return Err(e).err_kind(ErrorKind::Internal);
            }
        };
        let state: json::SavedState =
            serde_json::from_slice(&data).err_kind(ErrorKind::DataLoss)?;
        info!(
            "restored {} camera name(s) from {}",
            state.cameras.len(),
            self.path.display()
        );
        Ok(state)
    }

    pub fn save(&self, state: &json::SavedState) -> Result<(), base::Error> {
        let dir = self.path.parent().unwrap_or_else(|| std::path::Path::new("."));
        let mut f = tempfile::NamedTempFile::new_in(dir).err_kind(ErrorKind::Internal)?;
        serde_json::to_writer(&mut f, state).err_kind(ErrorKind::Internal)?;
        f.write_all(b"\n").err_kind(ErrorKind::Internal)?;
        f.persist(&self.path)
            .map_err(|e| e.error)
            .err_kind(ErrorKind::Internal)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::StateFile;
    use crate::json;

    #[test]
    fn missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let f = StateFile::new(dir.path().join("state.json"));
        assert!(f.load().unwrap().cameras.is_empty());
    }

    #[test]
    fn round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let f = StateFile::new(dir.path().join("state.json"));
        f.save(&json::SavedState {
            cameras: vec!["p1:a".to_owned()],
        })
        .unwrap();
        assert_eq!(f.load().unwrap().cameras, vec!["p1:a".to_owned()]);

        // A second save replaces, not appends.
        f.save(&json::SavedState {
            cameras: vec!["p1:a".to_owned(), "p2:b".to_owned()],
        })
        .unwrap();
        assert_eq!(f.load().unwrap().cameras.len(), 2);
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, b"{not json").unwrap();
        let f = StateFile::new(path);
        assert_eq!(f.load().unwrap_err().kind(), base::ErrorKind::DataLoss);
    }
}
