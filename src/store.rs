// This file is part of Osprey DVR, a security camera recording aggregator.
// Copyright (C) 2021 The Osprey DVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The date-partitioned archive: browse queries, download bundles, disk
//! budget enforcement, and the Today/Yesterday convenience links.
//!
//! The tree is `root/YYYY/MM/DD/` with flat day directories of
//! `<HH-MM-SS>-<camera>[:<seq>].<ext>` recordings plus optional `.jpg`
//! thumbnail siblings. Filenames are the sole index; there is no database.

use crate::events;
use crate::json;
use base::{bail_t, format_err_t, ErrorKind, ResultExt};
use base::Mutex;
use chrono::{Datelike, NaiveDate, TimeZone};
use log::{debug, warn};
use std::io::Seek;
use std::path::{Path, PathBuf};

/// URI prefix under which the archive tree is mirrored for raw access.
pub const VIDEOS_URI: &str = "/dvr/storage/videos";

/// Bound on cleanup work per tick, to avoid a livelock when deleting doesn't
/// actually lower the usage (e.g. a wedged filesystem).
const MAX_CLEANUP_CYCLES: usize = 10;

const VIDEO_EXTENSIONS: [&str; 3] = ["mkv", "mp4", "avi"];

/// A parsed recording filename.
#[derive(Debug, Eq, PartialEq)]
pub(crate) struct RecordingName<'a> {
    /// `HH-MM-SS`.
    pub time: &'a str,

    /// Camera with any `:<seq>` suffix stripped.
    pub src: &'a str,

    /// Camera as spelled in the filename, sequence suffix included.
    pub src_full: &'a str,

    pub ext: &'a str,
}

/// Parses `<HH-MM-SS>-<camera>[:<seq>].<ext>`. Returns `None` for anything
/// else, including extensions this service doesn't produce.
pub(crate) fn parse_recording_name(name: &str) -> Option<RecordingName> {
    let (stem, ext) = name.rsplit_once('.')?;
    if !VIDEO_EXTENSIONS.contains(&ext) && ext != "jpg" {
        return None;
    }
    let b = stem.as_bytes();
    if b.len() < 10 || b[2] != b'-' || b[5] != b'-' || b[8] != b'-' {
        return None;
    }
    if ![0usize, 1, 3, 4, 6, 7].iter().all(|&i| b[i].is_ascii_digit()) {
        return None;
    }
    let src_full = &stem[9..];
    let src = match src_full.rsplit_once(':') {
        Some((head, seq)) if !seq.is_empty() && seq.bytes().all(|c| c.is_ascii_digit()) => head,
        _ => src_full,
    };
    Some(RecordingName {
        time: &stem[..8],
        src,
        src_full,
        ext,
    })
}

struct StoreState {
    last_check: i64,
    last_day: Option<NaiveDate>,
}

pub struct Store {
    root: PathBuf,

    /// Used-percent threshold that triggers cleanup; 0 disables it.
    max_percent: i64,

    state: Mutex<StoreState>,
}

impl Store {
    pub fn new(root: PathBuf, max_percent: i64) -> Result<Self, base::Error> {
        std::fs::create_dir_all(&root).err_kind(ErrorKind::Internal)?;
        Ok(Store {
            root,
            max_percent,
            state: Mutex::new(StoreState {
                last_check: 0,
                last_day: None,
            }),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The `"storage"` status section.
    pub fn status(&self) -> Result<json::StorageStatus, base::Error> {
        let s = nix::sys::statvfs::statvfs(&self.root).err_kind(ErrorKind::Internal)?;
        Ok(json::StorageStatus {
            path: self.root.display().to_string(),
            size: s.fragment_size() as u64 * s.blocks(),
            free: s.fragment_size() as u64 * s.blocks_available(),
        })
    }

    /// Lists the year directories, numerically sorted.
    pub fn top(&self) -> Result<Vec<String>, base::Error> {
        let mut years = Vec::new();
        for entry in std::fs::read_dir(&self.root).err_kind(ErrorKind::Internal)? {
            let entry = entry.err_kind(ErrorKind::Internal)?;
            if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            if let Some(name) = numeric_name(&entry.file_name()) {
                years.push(name);
            }
        }
        years.sort_by_key(|y| y.parse::<u32>().unwrap_or(u32::MAX));
        Ok(years)
    }

    /// One boolean per month, with a leading `false` placeholder so the UI
    /// can index by month number.
    pub fn yearly(&self, year: i32) -> Vec<bool> {
        let ydir = self.root.join(format!("{}", year));
        let mut out = Vec::with_capacity(13);
        out.push(false);
        for month in 1..=12 {
            out.push(ydir.join(format!("{:02}", month)).is_dir());
        }
        out
    }

    /// One boolean per real day of the given month.
    pub fn monthly(&self, year: i32, month: u32) -> Result<Vec<bool>, base::Error> {
        if NaiveDate::from_ymd_opt(year, month, 1).is_none() {
            bail_t!(InvalidArgument, "bad month {}-{}", year, month);
        }
        let mdir = self.root.join(format!("{}/{:02}", year, month));
        let mut out = Vec::with_capacity(31);
        for day in 1..=31 {
            match NaiveDate::from_ymd_opt(year, month, day) {
                Some(_) => out.push(mdir.join(format!("{:02}", day)).is_dir()),
                None => break, // the month rolled over.
            }
        }
        Ok(out)
    }

    /// Lists one day's recordings. `.jpg` siblings are folded into the
    /// matching video's `image` URL rather than listed on their own.
    pub fn daily(
        &self,
        year: i32,
        month: u32,
        day: u32,
    ) -> Result<Vec<json::DayRecording>, base::Error> {
        let rel = format!("{}/{:02}/{:02}", year, month, day);
        let dir = self.root.join(&rel);
        let entries = std::fs::read_dir(&dir)
            .map_err(|_| format_err_t!(NotFound, "no recordings for {}", rel))?;

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.err_kind(ErrorKind::Internal)?;
            if let Ok(name) = entry.file_name().into_string() {
                names.push(name);
            }
        }
        names.sort();

        let mut out = Vec::new();
        for name in &names {
            let parsed = match parse_recording_name(name) {
                Some(p) if p.ext != "jpg" => p,
                _ => continue,
            };
            let size = std::fs::metadata(dir.join(name)).map(|m| m.len()).unwrap_or(0);
            let stem = name.rsplit_once('.').map(|(s, _)| s).unwrap_or(name);
            let thumbnail = format!("{}.jpg", stem);
            let image = if dir.join(&thumbnail).exists() {
                Some(format!("{}/{}/{}", VIDEOS_URI, rel, thumbnail))
            } else {
                None
            };
            out.push(json::DayRecording {
                src: parsed.src.to_owned(),
                time: parsed.time.to_owned(),
                size,
                video: format!("{}/{}/{}", VIDEOS_URI, rel, name),
                image,
            });
        }
        Ok(out)
    }

    /// Builds a stored (uncompressed) ZIP of one day's matching recordings in
    /// an already-unlinked temporary file, rewound and ready to stream.
    ///
    /// `hours` is a `[start, end)` filter on the hour field; `cams` filters on
    /// the filename portion after the time, where a trailing `+` in a token
    /// matches every sequence suffix of that camera.
    pub fn bundle(
        &self,
        year: i32,
        month: u32,
        day: u32,
        hours: Option<(u32, u32)>,
        cams: &[String],
    ) -> Result<std::fs::File, base::Error> {
        let rel = format!("{}/{:02}/{:02}", year, month, day);
        let dir = self.root.join(&rel);
        let entries = std::fs::read_dir(&dir)
            .map_err(|_| format_err_t!(NotFound, "no recordings for {}", rel))?;

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.err_kind(ErrorKind::Internal)?;
            let name = match entry.file_name().into_string() {
                Ok(n) => n,
                Err(_) => continue,
            };
            let parsed = match parse_recording_name(&name) {
                Some(p) => p,
                None => continue,
            };
            if let Some((start, end)) = hours {
                let hour: u32 = parsed.time[..2].parse().unwrap_or(u32::MAX);
                if hour < start || hour >= end {
                    continue;
                }
            }
            if !cams.is_empty() && !cams.iter().any(|t| cam_token_matches(t, parsed.src_full)) {
                continue;
            }
            names.push(name);
        }
        if names.is_empty() {
            bail_t!(Internal, "no recording matches in {}", rel);
        }
        names.sort();

        let f = tempfile::tempfile().err_kind(ErrorKind::Internal)?;
        let mut zip = zip::ZipWriter::new(f);
        let options = zip::write::FileOptions::default()
            .compression_method(zip::CompressionMethod::Stored)
            .large_file(true);
        for name in &names {
            zip.start_file(name.clone(), options)
                .err_kind(ErrorKind::Internal)?;
            let mut src = std::fs::File::open(dir.join(name)).err_kind(ErrorKind::Internal)?;
            std::io::copy(&mut src, &mut zip).err_kind(ErrorKind::Internal)?;
        }
        let mut f = zip.finish().err_kind(ErrorKind::Internal)?;
        f.rewind().err_kind(ErrorKind::Internal)?;
        Ok(f)
    }

    /// The periodic maintenance pass: budget enforcement once a minute and
    /// the daily links when the local day rolls over.
    pub fn tick(&self, now: i64) {
        let mut state = self.state.lock();
        if now < state.last_check + 60 {
            return;
        }
        state.last_check = now;

        if self.max_percent > 0 {
            for _ in 0..MAX_CLEANUP_CYCLES {
                match self.used_percent() {
                    Ok(p) if p > self.max_percent => {
                        debug!("disk {}% full, cleaning up", p);
                        if !self.cleanup_cycle() {
                            break;
                        }
                    }
                    Ok(_) => break,
                    Err(e) => {
                        events::trace("statvfs", &e.to_string());
                        break;
                    }
                }
            }
        }

        let local = match chrono::Local.timestamp_opt(now, 0).single() {
            Some(t) => t,
            None => return,
        };
        let today = local.date_naive();
        if state.last_day != Some(today) {
            self.relink("Today", today);
            self.relink("Yesterday", (local - chrono::Duration::days(1)).date_naive());
            state.last_day = Some(today);
        }
    }

    fn used_percent(&self) -> Result<i64, base::Error> {
        let s = nix::sys::statvfs::statvfs(&self.root).err_kind(ErrorKind::Internal)?;

        // Fragments and blocks deliberately use their distinct unit fields.
        let total = s.blocks() as u128 * s.fragment_size() as u128;
        let free = s.blocks_available() as u128 * s.block_size() as u128;
        if total == 0 {
            return Ok(0);
        }
        Ok((total.saturating_sub(free) * 100 / total) as i64)
    }

    /// Deletes the oldest day directory (or an empty parent found on the way
    /// there). Returns whether anything was deleted.
    fn cleanup_cycle(&self) -> bool {
        let year = match oldest_dir(&self.root) {
            Some(y) => y,
            None => return false, // no video at all.
        };
        let ypath = self.root.join(&year);
        let month = match oldest_dir(&ypath) {
            Some(m) => m,
            None => return self.remove_tree(&ypath, "EMPTY"),
        };
        let mpath = ypath.join(&month);
        let day = match oldest_dir(&mpath) {
            Some(d) => d,
            None => return self.remove_tree(&mpath, "EMPTY"),
        };
        self.remove_tree(&mpath.join(&day), "TO FREE DISK SPACE")
    }

    fn remove_tree(&self, path: &Path, why: &str) -> bool {
        match std::fs::remove_dir_all(path) {
            Ok(()) => {
                events::event("DIRECTORY", &path.display().to_string(), "DELETED", why);
                true
            }
            Err(e) => {
                events::trace(&path.display().to_string(), &format!("can't delete: {}", e));
                false
            }
        }
    }

    fn relink(&self, name: &str, date: NaiveDate) {
        let link = self.root.join(name);
        let target = self.root.join(format!(
            "{}/{:02}/{:02}",
            date.year(),
            date.month(),
            date.day()
        ));
        let _ = std::fs::remove_file(&link);
        match std::os::unix::fs::symlink(&target, &link) {
            Ok(()) => events::event("LINK", name, "TARGET", &target.display().to_string()),
            Err(e) => warn!("can't link {} -> {}: {}", link.display(), target.display(), e),
        }
    }
}

fn cam_token_matches(token: &str, src_full: &str) -> bool {
    match token.strip_suffix('+') {
        Some(prefix) => {
            src_full == prefix
                || (src_full.len() > prefix.len()
                    && src_full.starts_with(prefix)
                    && src_full.as_bytes()[prefix.len()] == b':')
        }
        None => src_full == token,
    }
}

/// The numerically smallest all-digit directory name under `parent`, if any.
fn oldest_dir(parent: &Path) -> Option<String> {
    let entries = std::fs::read_dir(parent).ok()?;
    let mut oldest: Option<(u32, String)> = None;
    for entry in entries.flatten() {
        if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            continue;
        }
        let name = match numeric_name(&entry.file_name()) {
            Some(n) => n,
            None => continue,
        };
        let value: u32 = match name.parse() {
            Ok(v) => v,
            Err(_) => continue,
        };
        if oldest.as_ref().map(|(v, _)| value < *v).unwrap_or(true) {
            oldest = Some((value, name));
        }
    }
    oldest.map(|(_, name)| name)
}

fn numeric_name(name: &std::ffi::OsStr) -> Option<String> {
    let name = name.to_str()?;
    if name.is_empty() || !name.bytes().all(|c| c.is_ascii_digit()) {
        return None;
    }
    Some(name.to_owned())
}
