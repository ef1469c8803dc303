// This file is part of Osprey DVR, a security camera recording aggregator.
// Copyright (C) 2021 The Osprey DVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Subcommand to check the archive tree for files that don't belong.

use crate::store::parse_recording_name;
use failure::Error;
use log::{info, warn};
use std::path::{Path, PathBuf};
use structopt::StructOpt;

#[derive(StructOpt)]
pub struct Args {
    /// Root of the recording archive.
    #[structopt(
        long = "dvr-store",
        default_value = "/var/lib/osprey-dvr/archive",
        value_name = "path",
        parse(from_os_str)
    )]
    dvr_store: PathBuf,

    /// Delete thumbnails that have no matching video.
    /// This addresses "orphan thumbnail" findings.
    #[structopt(long)]
    delete_orphan_thumbnails: bool,
}

const VIDEO_EXTENSIONS: [&str; 3] = ["mkv", "mp4", "avi"];

pub fn run(args: &Args) -> Result<i32, Error> {
    let mut problems = 0;
    for day in day_dirs(&args.dvr_store)? {
        problems += check_day(&day, args.delete_orphan_thumbnails)?;
    }
    if problems == 0 {
        info!("archive is clean");
        Ok(0)
    } else {
        info!("found {} problem(s)", problems);
        Ok(1)
    }
}

fn numeric_dirs(parent: &Path) -> Result<Vec<PathBuf>, Error> {
    let mut out = Vec::new();
    for entry in std::fs::read_dir(parent)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name();
        let is_numeric = name
            .to_str()
            .map(|n| !n.is_empty() && n.bytes().all(|c| c.is_ascii_digit()))
            .unwrap_or(false);
        if is_numeric {
            out.push(entry.path());
        }
    }
    out.sort();
    Ok(out)
}

fn day_dirs(root: &Path) -> Result<Vec<PathBuf>, Error> {
    let mut out = Vec::new();
    for year in numeric_dirs(root)? {
        for month in numeric_dirs(&year)? {
            out.append(&mut numeric_dirs(&month)?);
        }
    }
    Ok(out)
}

fn check_day(day: &Path, delete_orphan_thumbnails: bool) -> Result<usize, Error> {
    let mut problems = 0;
    for entry in std::fs::read_dir(day)? {
        let entry = entry?;
        let name = match entry.file_name().into_string() {
            Ok(n) => n,
            Err(n) => {
                warn!("{}: non-UTF-8 name {:?}", day.display(), n);
                problems += 1;
                continue;
            }
        };
        let parsed = match parse_recording_name(&name) {
            Some(p) => p,
            None => {
                warn!("{}: unrecognized file {}", day.display(), name);
                problems += 1;
                continue;
            }
        };
        if parsed.ext != "jpg" {
            continue;
        }
        let stem = name.rsplit_once('.').map(|(s, _)| s).unwrap_or(&name);
        let has_video = VIDEO_EXTENSIONS
            .iter()
            .any(|ext| day.join(format!("{}.{}", stem, ext)).exists());
        if !has_video {
            problems += 1;
            if delete_orphan_thumbnails {
                warn!("{}: deleting orphan thumbnail {}", day.display(), name);
                std::fs::remove_file(entry.path())?;
            } else {
                warn!("{}: orphan thumbnail {}", day.display(), name);
            }
        }
    }
    Ok(problems)
}

#[cfg(test)]
mod tests {
    use super::{run, Args};
    use crate::testutil;

    fn add_file(root: &std::path::Path, rel: &str) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, b"x").unwrap();
    }

    #[test]
    fn clean_archive() {
        testutil::init();
        let dir = tempfile::tempdir().unwrap();
        add_file(dir.path(), "2024/05/01/14-00-00-a.mkv");
        add_file(dir.path(), "2024/05/01/14-00-00-a.jpg");
        let args = Args {
            dvr_store: dir.path().to_owned(),
            delete_orphan_thumbnails: false,
        };
        assert_eq!(run(&args).unwrap(), 0);
    }

    #[test]
    fn orphans_and_junk() {
        testutil::init();
        let dir = tempfile::tempdir().unwrap();
        add_file(dir.path(), "2024/05/01/14-00-00-a.mkv");
        add_file(dir.path(), "2024/05/01/15-00-00-b.jpg"); // orphan.
        add_file(dir.path(), "2024/05/01/notes.txt"); // junk.
        let args = Args {
            dvr_store: dir.path().to_owned(),
            delete_orphan_thumbnails: false,
        };
        assert_eq!(run(&args).unwrap(), 1);
        assert!(dir.path().join("2024/05/01/15-00-00-b.jpg").exists());

        let args = Args {
            dvr_store: dir.path().to_owned(),
            delete_orphan_thumbnails: true,
        };
        assert_eq!(run(&args).unwrap(), 1);
        assert!(!dir.path().join("2024/05/01/15-00-00-b.jpg").exists());
    }
}
