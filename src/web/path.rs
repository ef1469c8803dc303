// This file is part of Osprey DVR, a security camera recording aggregator.
// Copyright (C) 2021 The Osprey DVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Decodes request paths.

/// A decoded request path.
#[derive(Debug, Eq, PartialEq)]
pub(super) enum Path {
    Status,          // "/dvr/status"
    StorageTop,      // "/dvr/storage/top"
    StorageYearly,   // "/dvr/storage/yearly?year=YYYY"
    StorageMonthly,  // "/dvr/storage/monthly?year=YYYY&month=MM"
    StorageDaily,    // "/dvr/storage/daily?year=YYYY&month=MM&day=DD"
    StorageDownload, // "/dvr/storage/download?year&month&day[&hour][&cam]"
    Video,           // "/dvr/storage/videos/..." (raw archive access)
    Declare,         // "/dvr/source/declare" (legacy peer push-registration)
    Static,          // (anything that doesn't start with "/dvr/")
    NotFound,
}

impl Path {
    /// Decodes a request path, notably not including any request parameters.
    pub(super) fn decode(path: &str) -> Self {
        let path = match path.strip_prefix("/dvr/") {
            Some(p) => p,
            None => return Path::Static,
        };
        match path {
            "status" => return Path::Status,
            "source/declare" => return Path::Declare,
            _ => {}
        };
        if let Some(path) = path.strip_prefix("storage/") {
            match path {
                "top" => Path::StorageTop,
                "yearly" => Path::StorageYearly,
                "monthly" => Path::StorageMonthly,
                "daily" => Path::StorageDaily,
                "download" => Path::StorageDownload,
                _ => {
                    if path.strip_prefix("videos/").is_some() {
                        Path::Video
                    } else {
                        Path::NotFound
                    }
                }
            }
        } else {
            Path::NotFound
        }
    }
}

#[cfg(test)]
mod tests {
    #[test]
    fn paths() {
        use super::Path;
        assert_eq!(Path::decode("/"), Path::Static);
        assert_eq!(Path::decode("/index.html"), Path::Static);
        assert_eq!(Path::decode("/dvr/status"), Path::Status);
        assert_eq!(Path::decode("/dvr/storage/top"), Path::StorageTop);
        assert_eq!(Path::decode("/dvr/storage/yearly"), Path::StorageYearly);
        assert_eq!(Path::decode("/dvr/storage/monthly"), Path::StorageMonthly);
        assert_eq!(Path::decode("/dvr/storage/daily"), Path::StorageDaily);
        assert_eq!(Path::decode("/dvr/storage/download"), Path::StorageDownload);
        assert_eq!(
            Path::decode("/dvr/storage/videos/2024/05/01/14-00-00-a.mkv"),
            Path::Video
        );
        assert_eq!(Path::decode("/dvr/storage/videos"), Path::NotFound);
        assert_eq!(Path::decode("/dvr/source/declare"), Path::Declare);
        assert_eq!(Path::decode("/dvr/junk"), Path::NotFound);
        assert_eq!(Path::decode("/dvr/storage/junk"), Path::NotFound);
    }
}
