// This file is part of Osprey DVR, a security camera recording aggregator.
// Copyright (C) 2021 The Osprey DVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Enumeration of feed peers for a named service tag.
//!
//! The registry doesn't care where base URLs come from; production uses the
//! service portal, small installs pin peers on the command line, and tests
//! substitute their own lists.

use crate::json;
use base::{bail_t, ErrorKind, ResultExt};
use futures::future::BoxFuture;
use futures::FutureExt;
use log::debug;
use url::Url;

/// Source of peer base URLs for one service tag.
pub trait Directory: Send + Sync {
    fn peers<'a>(&'a self, service: &'a str) -> BoxFuture<'a, Result<Vec<Url>, base::Error>>;
}

/// A fixed peer list, typically from repeated `--dvr-peer` flags.
pub struct StaticDirectory {
    peers: Vec<Url>,
}

impl StaticDirectory {
    pub fn new(peers: Vec<Url>) -> Self {
        StaticDirectory { peers }
    }
}

impl Directory for StaticDirectory {
    fn peers<'a>(&'a self, _service: &'a str) -> BoxFuture<'a, Result<Vec<Url>, base::Error>> {
        futures::future::ok(self.peers.clone()).boxed()
    }
}

/// Asks a service portal which peers currently provide the service tag.
pub struct PortalDirectory {
    client: reqwest::Client,
    portal: Url,
}

impl PortalDirectory {
    pub fn new(client: reqwest::Client, portal: Url) -> Self {
        PortalDirectory { client, portal }
    }
}

impl Directory for PortalDirectory {
    fn peers<'a>(&'a self, service: &'a str) -> BoxFuture<'a, Result<Vec<Url>, base::Error>> {
        async move {
            let url = self
                .portal
                .join("portal/list")
                .err_kind(ErrorKind::InvalidArgument)?;
            let resp = self
                .client
                .get(url)
                .query(&[("service", service)])
                .send()
                .await
                .err_kind(ErrorKind::Unavailable)?;
            if !resp.status().is_success() {
                bail_t!(Unavailable, "portal returned HTTP {}", resp.status());
            }
            let body = resp.bytes().await.err_kind(ErrorKind::Unavailable)?;
            let list: json::PortalList =
                serde_json::from_slice(&body).err_kind(ErrorKind::DataLoss)?;
            let mut peers = Vec::with_capacity(list.providers.len());
            for p in &list.providers {
                match Url::parse(p) {
                    Ok(u) => peers.push(u),
                    Err(e) => debug!("portal listed unparseable provider {:?}: {}", p, e),
                }
            }
            Ok(peers)
        }
        .boxed()
    }
}
