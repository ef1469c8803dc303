// This file is part of Osprey DVR, a security camera recording aggregator.
// Copyright (C) 2021 The Osprey DVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The registry of feed servers and their cameras, kept fresh by periodic
//! discovery rounds against unreliable peers.
//!
//! The registry itself never performs I/O. `tick` does bookkeeping and
//! decides when a scan round is due; [`sweep`] executes the round over HTTP
//! and feeds the results back in. Camera names are retained forever (and
//! persisted) because archived recordings keep referencing cameras long
//! after they stop registering.

use crate::discovery::Directory;
use crate::dvr::Dvr;
use crate::events;
use crate::json;
use base::{bail_t, ErrorKind, ResultExt};
use fnv::FnvHashMap;
use log::{debug, error, info};
use std::sync::Arc;
use url::Url;

/// A peer unheard from for this long is dropped from the registry.
const PRUNE_SECS: i64 = 180;

/// How often the prune pass runs.
const CLEANUP_PERIOD: i64 = 10;

/// Forced full-status period, and the rushed delay after a new enqueue.
const FULL_SCAN_SECS: i64 = 300;
const RUSH_SECS: i64 = 10;

/// For this long after start, rounds run every 10 s rather than every
/// `check_period`, so the fleet reassembles quickly after a power cycle
/// regardless of start order.
const STARTUP_FAST_SECS: i64 = 60;
const STARTUP_PERIOD: i64 = 10;

/// A recording with no explicit stability marker is stable once its mtime is
/// this old.
const STABLE_AGE_SECS: i64 = 60;

/// No successful peer contact for this long, while entries exist, means the
/// discovery path is wedged; die so the supervisor restarts us.
const WATCHDOG_SECS: i64 = 300;

pub struct FeedServer {
    pub name: String,
    pub base_url: String,
    pub admin_url: String,
    pub updated: i64,
    pub last_seen: i64,
    pub available_mb: i64,
}

pub struct Camera {
    pub name: String,

    /// Owning server name; empty once the registration lapses.
    pub server: String,
    pub stream_url: String,
    pub last_seen: i64,
}

/// 60 minute-slots of one server's reported free space; -1 is "no data".
struct MetricsRing {
    samples: [i64; 60],
    last_slot: usize,
}

impl Default for MetricsRing {
    fn default() -> Self {
        MetricsRing {
            samples: [-1; 60],
            last_slot: 0,
        }
    }
}

impl MetricsRing {
    fn record(&mut self, minute: i64, mb: i64) {
        let slot = (minute.rem_euclid(60)) as usize;
        if slot != self.last_slot {
            // Erase the slots skipped since the last write so they read as
            // "no data" rather than hour-old samples.
            let mut i = (self.last_slot + 1) % 60;
            while i != slot {
                self.samples[i] = -1;
                i = (i + 1) % 60;
            }
            self.last_slot = slot;
        }
        self.samples[slot] = mb;
    }

    fn take_min(&mut self) -> Option<i64> {
        let min = self.samples.iter().filter(|&&v| v >= 0).min().copied();
        self.samples = [-1; 60];
        min
    }
}

/// What the caller should do after a tick.
#[derive(Default)]
pub struct TickActions {
    /// Run a discovery round; the bool requests a full status scan.
    pub scan: Option<bool>,

    /// Persist this state snapshot.
    pub save: Option<json::SavedState>,
}

pub struct FeedRegistry {
    service: String,
    check_period: i64,
    servers: Vec<FeedServer>,
    cameras: Vec<Camera>,
    metrics: FnvHashMap<String, MetricsRing>,
    started: i64,
    last_cleanup: i64,
    last_discovery: i64,
    next_full_scan: i64,
    last_metrics_emit: i64,
    last_server_ok: i64,
    last_camera_ok: i64,
    state_dirty: bool,
}

impl FeedRegistry {
    pub fn new(service: String, check_period: i64) -> Self {
        FeedRegistry {
            service,
            check_period: check_period.max(1),
            servers: Vec::new(),
            cameras: Vec::new(),
            metrics: FnvHashMap::default(),
            started: 0,
            last_cleanup: 0,
            last_discovery: 0,
            next_full_scan: 0,
            last_metrics_emit: 0,
            last_server_ok: 0,
            last_camera_ok: 0,
            state_dirty: false,
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Re-seeds the camera name set from a persisted snapshot.
    pub fn restore(&mut self, state: &json::SavedState) {
        for name in &state.cameras {
            if self.cameras.iter().any(|c| &c.name == name) {
                continue;
            }
            self.cameras.push(Camera {
                name: name.clone(),
                server: String::new(),
                stream_url: String::new(),
                last_seen: 0,
            });
        }
    }

    /// The ~1 Hz bookkeeping pass: prune, metrics, watchdog, scheduling.
    pub fn tick(&mut self, now: i64) -> TickActions {
        if self.started == 0 {
            self.started = now;
            self.last_server_ok = now;
            self.last_camera_ok = now;
            self.next_full_scan = now + FULL_SCAN_SECS;
        }
        if now >= self.last_cleanup + CLEANUP_PERIOD {
            self.last_cleanup = now;
            self.prune(now);
        }
        self.sample_metrics(now);
        if let Some(which) = self.watchdog_expired(now) {
            error!(
                "no successful {} contact in {} s; aborting for supervisor restart",
                which, WATCHDOG_SECS
            );
            std::process::abort();
        }

        let mut actions = TickActions::default();
        let period = if now < self.started + STARTUP_FAST_SECS {
            STARTUP_PERIOD
        } else {
            self.check_period
        };
        if now >= self.last_discovery + period {
            self.last_discovery = now;
            let full = now >= self.next_full_scan;
            if full {
                self.next_full_scan = now + FULL_SCAN_SECS;
            }
            actions.scan = Some(full);
        }

        // Snapshot at most once per tick, and never during the startup grace
        // period: a snapshot taken while peers are still reappearing would
        // shrink the persisted camera set.
        if self.state_dirty && now >= self.started + STARTUP_FAST_SECS {
            self.state_dirty = false;
            actions.save = Some(self.saved_state());
        }
        actions
    }

    /// Makes the next round a full scan soon, so a freshly-enqueued transfer
    /// gets its confirmation quickly.
    pub fn rush_full_scan(&mut self, now: i64) {
        self.next_full_scan = self.next_full_scan.min(now + RUSH_SECS);
    }

    fn prune(&mut self, now: i64) {
        let deadline = now - PRUNE_SECS;
        for c in &mut self.cameras {
            if c.server.is_empty() || c.last_seen > deadline {
                continue;
            }
            events::event("FEED", &c.name, "PRUNED", &format!("AT {}", c.stream_url));
            c.server.clear();
            c.stream_url.clear();
            c.last_seen = 0;
        }
        self.servers.retain(|s| {
            if s.last_seen > deadline {
                return true;
            }
            events::event("SERVER", &s.name, "PRUNED", &format!("AT {}", s.admin_url));
            false
        });
    }

    fn sample_metrics(&mut self, now: i64) {
        let minute = now / 60;
        for s in &self.servers {
            self.metrics
                .entry(s.name.clone())
                .or_default()
                .record(minute, s.available_mb);
        }
        if self.last_metrics_emit == 0 {
            self.last_metrics_emit = now;
        } else if now >= self.last_metrics_emit + 3600 {
            self.last_metrics_emit = now;
            for (name, ring) in &mut self.metrics {
                if let Some(min) = ring.take_min() {
                    events::sensor(name, "available", min, "MB");
                }
            }
        }
    }

    fn watchdog_expired(&self, now: i64) -> Option<&'static str> {
        if !self.servers.is_empty() && now - self.last_server_ok > WATCHDOG_SECS {
            return Some("server");
        }
        if !self.cameras.is_empty() && now - self.last_camera_ok > WATCHDOG_SECS {
            return Some("camera");
        }
        None
    }

    /// Applies a `/check` reply. Returns true iff the peer's `updated` stamp
    /// matches what we have, in which case only liveness was refreshed and
    /// the full status fetch can be skipped this round.
    pub fn check_matches(&mut self, host: &str, updated: i64, now: i64) -> bool {
        if updated == 0 {
            return false;
        }
        let server = match self.servers.iter_mut().find(|s| s.name == host) {
            Some(s) if s.updated == updated => s,
            _ => return false,
        };
        server.last_seen = now;
        self.last_server_ok = now;
        for c in &mut self.cameras {
            if c.server == host {
                c.last_seen = now;
                self.last_camera_ok = now;
            }
        }
        true
    }

    /// Applies a full `/status` reply and returns the stable recordings to
    /// hand to the transfer queue.
    pub fn apply_status(
        &mut self,
        base_url: &str,
        status: &json::StatusResponse,
        now: i64,
    ) -> Vec<(String, u64)> {
        if status.host.is_empty() {
            events::trace(base_url, "no hostname");
            return Vec::new();
        }
        let mb = decode_available(&status.cctv.available);
        if self.upsert_server(status, base_url, mb, now) {
            events::event(
                "SERVER",
                &status.host,
                "ADDED",
                &format!("URL {}", status.cctv.console),
            );
        }

        let feeds = match &status.cctv.feeds {
            None => {
                events::trace(base_url, "no feed data");
                return Vec::new();
            }
            Some(f) if f.is_empty() => {
                events::trace(base_url, "empty feed data");
                return Vec::new();
            }
            Some(f) => f,
        };
        for (device, stream_url) in feeds {
            let name = format!("{}:{}", status.host, device);
            self.register_camera(&name, &status.host, stream_url, now);
        }

        // The peer just positively confirmed its camera list: anything still
        // attributed to it that wasn't mentioned is gone. Cameras belonging
        // to other peers are none of this status's business.
        let prefix = format!("{}:", status.host);
        let cutoff = now - (self.check_period - 1);
        for c in &mut self.cameras {
            if c.server != status.host || c.last_seen == 0 {
                continue;
            }
            let device = match c.name.strip_prefix(&prefix) {
                Some(d) => d,
                None => continue,
            };
            if feeds.contains_key(device) || c.last_seen >= cutoff {
                continue;
            }
            events::event("FEED", &c.name, "PRUNED", &format!("AT {}", c.stream_url));
            c.server.clear();
            c.stream_url.clear();
            c.last_seen = 0;
        }

        let mut stable = Vec::new();
        for r in &status.cctv.recordings {
            let ok = match r.stable {
                Some(b) => b,
                None => r.modified < now - STABLE_AGE_SECS,
            };
            if ok {
                stable.push((r.path.clone(), r.size));
            }
        }
        stable
    }

    fn upsert_server(
        &mut self,
        status: &json::StatusResponse,
        base_url: &str,
        mb: i64,
        now: i64,
    ) -> bool {
        self.last_server_ok = now;
        match self.servers.iter_mut().find(|s| s.name == status.host) {
            Some(s) => {
                s.base_url = base_url.to_owned();
                s.admin_url = status.cctv.console.clone();
                if status.updated != 0 {
                    // Zero means "not reported"; don't forget a known stamp
                    // just because a legacy peer answered this round.
                    s.updated = status.updated;
                }
                s.available_mb = mb;
                s.last_seen = now;
                false
            }
            None => {
                self.servers.push(FeedServer {
                    name: status.host.clone(),
                    base_url: base_url.to_owned(),
                    admin_url: status.cctv.console.clone(),
                    updated: status.updated,
                    last_seen: now,
                    available_mb: mb,
                });
                true
            }
        }
    }

    fn register_camera(&mut self, name: &str, server: &str, stream_url: &str, now: i64) {
        self.last_camera_ok = now;
        match self.cameras.iter_mut().find(|c| c.name == name) {
            Some(c) => {
                let reattached = c.server.is_empty();
                c.server = server.to_owned();
                c.stream_url = stream_url.to_owned();
                c.last_seen = now;
                if reattached {
                    info!("camera {} re-registered at {}", name, stream_url);
                    events::event("FEED", name, "ADDED", &format!("URL {}", stream_url));
                }
            }
            None => {
                self.cameras.push(Camera {
                    name: name.to_owned(),
                    server: server.to_owned(),
                    stream_url: stream_url.to_owned(),
                    last_seen: now,
                });
                events::event("FEED", name, "ADDED", &format!("URL {}", stream_url));
                if now >= self.started + STARTUP_FAST_SECS {
                    self.state_dirty = true;
                }
            }
        }
    }

    /// Handles a legacy `/dvr/source/declare` push registration.
    pub fn declare(
        &mut self,
        name: &str,
        admin: &str,
        url: &str,
        available: &str,
        devices: &str,
        now: i64,
    ) {
        let status = json::StatusResponse {
            host: name.to_owned(),
            updated: 0,
            cctv: json::CctvStatus {
                console: admin.to_owned(),
                available: available.to_owned(),
                feeds: None,
                recordings: Vec::new(),
            },
        };
        let mb = decode_available(available);
        if self.upsert_server(&status, &format!("http://{}", url), mb, now) {
            events::event("SERVER", name, "ADDED", &format!("URL {}", admin));
        }
        for device in devices.split('+').filter(|d| !d.is_empty()) {
            let feed = format!("{}:{}", name, device);
            let stream = format!("http://{}/{}/stream", url, device);
            self.register_camera(&feed, name, &stream, now);
        }
    }

    /// The `"servers"` and `"feed"` status sections.
    pub fn status(&self) -> (Vec<json::ServerStatus>, Vec<json::FeedStatus>) {
        let servers = self
            .servers
            .iter()
            .map(|s| json::ServerStatus {
                name: s.name.clone(),
                url: s.admin_url.clone(),
                space: format!("{} MB", s.available_mb),
                timestamp: s.last_seen,
            })
            .collect();
        let feed = self
            .cameras
            .iter()
            .filter(|c| c.last_seen != 0)
            .map(|c| json::FeedStatus {
                name: c.name.clone(),
                url: c.stream_url.clone(),
                timestamp: c.last_seen,
            })
            .collect();
        (servers, feed)
    }

    pub fn saved_state(&self) -> json::SavedState {
        let mut cameras: Vec<String> = self.cameras.iter().map(|c| c.name.clone()).collect();
        cameras.sort();
        json::SavedState { cameras }
    }

    #[cfg(test)]
    fn camera(&self, name: &str) -> Option<&Camera> {
        self.cameras.iter().find(|c| c.name == name)
    }
}

/// Normalizes the peer's free-space string to megabytes. Only `M` and `G`
/// suffixes count; anything else (including bare numbers) reads as zero,
/// which intentionally hides peers with pathological reports.
fn decode_available(s: &str) -> i64 {
    let s = s.trim();
    if let Some(n) = s.strip_suffix('G') {
        n.parse::<i64>().map(|v| v * 1024).unwrap_or(0)
    } else if let Some(n) = s.strip_suffix('M') {
        n.parse::<i64>().unwrap_or(0)
    } else {
        0
    }
}

/// Runs one discovery round: asks the directory for the current peer list
/// and polls each peer, applying results to the registry and queue.
pub async fn sweep(
    dvr: &Arc<Dvr>,
    client: &reqwest::Client,
    directory: &dyn Directory,
    service: &str,
    full: bool,
    now: i64,
) {
    let peers = match directory.peers(service).await {
        Ok(p) => p,
        Err(e) => {
            events::trace(service, &format!("discovery failed: {}", e));
            return;
        }
    };
    debug!("scanning {} peer(s) for {:?} (full={})", peers.len(), service, full);
    for peer in &peers {
        poll_peer(dvr, client, peer, full, now).await;
    }
}

enum CheckOutcome {
    /// The stored stamp matches; liveness was refreshed, nothing else to do.
    Match,

    /// Unknown host or changed stamp: fetch the full status.
    Mismatch,

    /// The peer answered 401: it predates `/check`. Not an error.
    Unimplemented,
}

/// Polls one peer: a cheap `/check` first unless a full scan was ordered,
/// then `/status` if anything changed. Errors are traced against the peer
/// URL and affect this peer this round only.
pub async fn poll_peer(
    dvr: &Arc<Dvr>,
    client: &reqwest::Client,
    base: &Url,
    full: bool,
    now: i64,
) {
    if !full {
        match check_peer(dvr, client, base, now).await {
            Ok(CheckOutcome::Match) => return,
            Ok(CheckOutcome::Mismatch) | Ok(CheckOutcome::Unimplemented) => {}
            Err(e) => {
                events::trace(base.as_str(), &e.to_string());
                return;
            }
        }
    }
    let status = match fetch_status(client, base).await {
        Ok(s) => s,
        Err(e) => {
            events::trace(base.as_str(), &e.to_string());
            return;
        }
    };
    let stable = dvr.feeds.lock().apply_status(base.as_str(), &status, now);
    let mut newly_enqueued = false;
    for (path, size) in &stable {
        if dvr.queue.lock().notify(base.as_str(), path, *size) {
            newly_enqueued = true;
        }
    }
    if newly_enqueued {
        dvr.feeds.lock().rush_full_scan(now);
    }
}

fn peer_url(base: &Url, leaf: &str) -> String {
    format!("{}/{}", base.as_str().trim_end_matches('/'), leaf)
}

async fn check_peer(
    dvr: &Arc<Dvr>,
    client: &reqwest::Client,
    base: &Url,
    now: i64,
) -> Result<CheckOutcome, base::Error> {
    let resp = client
        .get(peer_url(base, "check"))
        .send()
        .await
        .err_kind(ErrorKind::Unavailable)?;
    if resp.status() == reqwest::StatusCode::UNAUTHORIZED {
        return Ok(CheckOutcome::Unimplemented);
    }
    if !resp.status().is_success() {
        bail_t!(Unavailable, "check: HTTP {}", resp.status());
    }
    let body = resp.bytes().await.err_kind(ErrorKind::Unavailable)?;
    let check: json::CheckResponse =
        serde_json::from_slice(&body).err_kind(ErrorKind::DataLoss)?;
    if dvr.feeds.lock().check_matches(&check.host, check.updated, now) {
        Ok(CheckOutcome::Match)
    } else {
        Ok(CheckOutcome::Mismatch)
    }
}

async fn fetch_status(
    client: &reqwest::Client,
    base: &Url,
) -> Result<json::StatusResponse, base::Error> {
    let resp = client
        .get(peer_url(base, "status"))
        .send()
        .await
        .err_kind(ErrorKind::Unavailable)?;
    if !resp.status().is_success() {
        bail_t!(Unavailable, "status: HTTP {}", resp.status());
    }
    let body = resp.bytes().await.err_kind(ErrorKind::Unavailable)?;
    serde_json::from_slice(&body).err_kind(ErrorKind::DataLoss)
}

#[cfg(test)]
mod tests {
    use super::{decode_available, FeedRegistry};
    use crate::json;
    use crate::testutil;
    use url::Url;

    fn status_doc(host: &str, updated: i64, feeds: &[(&str, &str)]) -> json::StatusResponse {
        json::StatusResponse {
            host: host.to_owned(),
            updated,
            cctv: json::CctvStatus {
                console: format!("http://{}/ui", host),
                available: "12G".to_owned(),
                feeds: Some(
                    feeds
                        .iter()
                        .map(|(d, u)| (d.to_string(), u.to_string()))
                        .collect(),
                ),
                recordings: Vec::new(),
            },
        }
    }

    #[test]
    fn available_normalization() {
        assert_eq!(decode_available("12G"), 12288);
        assert_eq!(decode_available("500M"), 500);
        assert_eq!(decode_available(" 1G "), 1024);
        assert_eq!(decode_available("123"), 0);
        assert_eq!(decode_available("5K"), 0);
        assert_eq!(decode_available("nonsense"), 0);
        assert_eq!(decode_available(""), 0);
    }

    #[test]
    fn status_upsert_and_prune() {
        testutil::init();
        let mut r = FeedRegistry::new("cctv".to_owned(), 30);
        r.tick(1000);
        let doc = status_doc("p1", 42, &[("a", "http://p1/a/stream")]);
        assert!(r.apply_status("http://p1:8080/", &doc, 1000).is_empty());

        let (servers, feed) = r.status();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].name, "p1");
        assert_eq!(servers[0].url, "http://p1/ui");
        assert_eq!(servers[0].space, "12288 MB");
        assert_eq!(feed.len(), 1);
        assert_eq!(feed[0].name, "p1:a");
        assert_eq!(feed[0].url, "http://p1/a/stream");

        // 180 s without contact: the server goes away; the camera's name
        // slot survives with its registration cleared.
        r.tick(1000 + 200);
        let (servers, feed) = r.status();
        assert!(servers.is_empty());
        assert!(feed.is_empty());
        let cam = r.camera("p1:a").unwrap();
        assert!(cam.server.is_empty());
        assert_eq!(r.saved_state().cameras, vec!["p1:a".to_owned()]);
    }

    #[test]
    fn zero_updated_does_not_overwrite() {
        testutil::init();
        let mut r = FeedRegistry::new("cctv".to_owned(), 30);
        r.tick(1000);
        r.apply_status("http://p1:8080/", &status_doc("p1", 42, &[("a", "u")]), 1000);

        // A legacy reply without a stamp must not forget the known one.
        r.apply_status("http://p1:8080/", &status_doc("p1", 0, &[("a", "u")]), 1010);
        assert!(r.check_matches("p1", 42, 1020));
    }

    #[test]
    fn check_semantics() {
        testutil::init();
        let mut r = FeedRegistry::new("cctv".to_owned(), 30);
        r.tick(1000);
        r.apply_status("http://p1:8080/", &status_doc("p1", 42, &[("a", "u")]), 1000);

        assert!(!r.check_matches("p1", 43, 1030)); // stamp changed.
        assert!(!r.check_matches("p2", 42, 1030)); // unknown host.
        assert!(!r.check_matches("p1", 0, 1030)); // no stamp reported.

        // A match refreshes both the server and its cameras, so neither hits
        // the prune deadline while checks keep succeeding.
        assert!(r.check_matches("p1", 42, 1170));
        r.tick(1180);
        let (servers, feed) = r.status();
        assert_eq!(servers.len(), 1);
        assert_eq!(feed.len(), 1);
        assert_eq!(feed[0].timestamp, 1170);
    }

    #[test]
    fn confirmed_absence_prunes_immediately() {
        testutil::init();
        let mut r = FeedRegistry::new("cctv".to_owned(), 30);
        r.tick(1000);
        r.apply_status(
            "http://p1:8080/",
            &status_doc("p1", 1, &[("a", "ua"), ("b", "ub")]),
            1000,
        );
        // Another peer's camera must stay untouched throughout.
        r.apply_status("http://p2:8080/", &status_doc("p2", 1, &[("c", "uc")]), 1000);

        // "a" is missing from p1's next status, but it was touched too
        // recently to be pruned.
        r.apply_status("http://p1:8080/", &status_doc("p1", 2, &[("b", "ub")]), 1010);
        assert!(!r.camera("p1:a").unwrap().server.is_empty());

        // Once it's been untouched longer than the check period, a status
        // without it prunes it on the spot.
        r.apply_status("http://p1:8080/", &status_doc("p1", 3, &[("b", "ub")]), 1040);
        assert!(r.camera("p1:a").unwrap().server.is_empty());
        assert!(!r.camera("p1:b").unwrap().server.is_empty());
        assert!(!r.camera("p2:c").unwrap().server.is_empty());
    }

    #[test]
    fn stability_rules() {
        testutil::init();
        let mut r = FeedRegistry::new("cctv".to_owned(), 30);
        r.tick(1000);
        let now = 10_000;
        let mut doc = status_doc("p1", 1, &[("a", "u")]);
        doc.cctv.recordings = vec![
            json::RecordingEntry {
                modified: now - 120,
                path: "2024/05/01/14-00-00-a.mkv".to_owned(),
                size: 1,
                stable: None,
            },
            json::RecordingEntry {
                modified: now - 10,
                path: "2024/05/01/14-05-00-a.mkv".to_owned(),
                size: 2,
                stable: None,
            },
            json::RecordingEntry {
                modified: now - 10,
                path: "2024/05/01/14-06-00-a.mkv".to_owned(),
                size: 3,
                stable: Some(true),
            },
            json::RecordingEntry {
                modified: now - 600,
                path: "2024/05/01/14-07-00-a.mkv".to_owned(),
                size: 4,
                stable: Some(false),
            },
        ];
        let stable = r.apply_status("http://p1:8080/", &doc, now);
        let paths: Vec<&str> = stable.iter().map(|(p, _)| p.as_str()).collect();
        assert_eq!(
            paths,
            vec!["2024/05/01/14-00-00-a.mkv", "2024/05/01/14-06-00-a.mkv"]
        );
    }

    #[test]
    fn scan_scheduling() {
        testutil::init();
        let mut r = FeedRegistry::new("cctv".to_owned(), 30);

        // Fast rounds during the startup window.
        let a = r.tick(1000);
        assert_eq!(a.scan, Some(false));
        assert_eq!(r.tick(1005).scan, None);
        assert_eq!(r.tick(1010).scan, Some(false));

        // Steady state: every check_period.
        assert_eq!(r.tick(1070).scan, Some(false));
        assert_eq!(r.tick(1080).scan, None);
        assert_eq!(r.tick(1100).scan, Some(false));

        // The five-minute mark forces a full scan.
        assert_eq!(r.tick(1300).scan, Some(true));
        assert_eq!(r.tick(1330).scan, Some(false));

        // A rushed full scan happens on the next round after +10 s.
        r.rush_full_scan(1330);
        assert_eq!(r.tick(1360).scan, Some(true));
    }

    #[test]
    fn persistence_debounce() {
        testutil::init();
        let mut r = FeedRegistry::new("cctv".to_owned(), 30);
        r.tick(1000);

        // A camera discovered during the grace period isn't snapshotted...
        r.apply_status("http://p1:8080/", &status_doc("p1", 1, &[("a", "u")]), 1005);
        assert!(r.tick(1010).save.is_none());

        // ...but one discovered later is, exactly once.
        r.apply_status(
            "http://p1:8080/",
            &status_doc("p1", 2, &[("a", "u"), ("b", "u")]),
            1070,
        );
        let save = r.tick(1071).save.unwrap();
        assert_eq!(save.cameras, vec!["p1:a".to_owned(), "p1:b".to_owned()]);
        assert!(r.tick(1072).save.is_none());
    }

    #[test]
    fn restore_retains_names() {
        testutil::init();
        let mut r = FeedRegistry::new("cctv".to_owned(), 30);
        r.restore(&json::SavedState {
            cameras: vec!["p1:a".to_owned()],
        });
        r.tick(1000);
        let (_, feed) = r.status();
        assert!(feed.is_empty()); // restored cameras aren't live.
        assert_eq!(r.saved_state().cameras, vec!["p1:a".to_owned()]);

        // Re-registration is not a new name, so no snapshot is requested.
        r.apply_status("http://p1:8080/", &status_doc("p1", 1, &[("a", "u")]), 1070);
        assert!(r.tick(1071).save.is_none());
    }

    #[test]
    fn watchdog() {
        testutil::init();
        let mut r = FeedRegistry::new("cctv".to_owned(), 30);
        r.tick(1000);
        assert!(r.watchdog_expired(2000).is_none()); // empty registry: no arming.

        r.apply_status("http://p1:8080/", &status_doc("p1", 1, &[("a", "u")]), 1000);
        assert!(r.watchdog_expired(1300).is_none());
        assert_eq!(r.watchdog_expired(1301), Some("server"));

        // Fresh contact clears it.
        r.apply_status("http://p1:8080/", &status_doc("p1", 2, &[("a", "u")]), 1290);
        assert!(r.watchdog_expired(1400).is_none());
    }

    #[test]
    fn declare_translates_devices() {
        testutil::init();
        let mut r = FeedRegistry::new("cctv".to_owned(), 30);
        r.tick(1000);
        r.declare("p9", "http://p9/admin", "p9:8100", "2G", "front+back", 1000);

        let (servers, feed) = r.status();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].url, "http://p9/admin");
        assert_eq!(servers[0].space, "2048 MB");
        assert_eq!(feed.len(), 2);
        assert_eq!(feed[0].name, "p9:front");
        assert_eq!(feed[0].url, "http://p9:8100/front/stream");
        assert_eq!(feed[1].name, "p9:back");
        assert_eq!(feed[1].url, "http://p9:8100/back/stream");
    }

    #[test]
    fn metrics_ring() {
        let mut ring = super::MetricsRing::default();
        assert_eq!(ring.take_min(), None);

        ring.record(100, 500);
        ring.record(101, 300);
        ring.record(102, 400);
        assert_eq!(ring.take_min(), Some(300));
        assert_eq!(ring.take_min(), None); // cleared by the emit.

        // A gap erases only the skipped slots; a sample still within the
        // hour window is retained.
        ring.record(100, 100);
        ring.record(130, 900);
        assert_eq!(ring.take_min(), Some(100));
    }

    #[tokio::test]
    async fn cold_start_one_peer() {
        testutil::init();
        let peer = testutil::MockPeer::start().await;
        peer.set_status(serde_json::json!({
            "host": "p1",
            "updated": 42,
            "cctv": {
                "console": "http://p1/ui",
                "available": "12G",
                "feeds": {"a": "http://p1/a/stream"},
                "recordings": [],
            },
        }));
        let (dvr, _tmp) = testutil::test_dvr();
        let client = reqwest::Client::new();
        let base = Url::parse(&peer.base_url()).unwrap();

        // /check answers 401 (unimplemented) and is transparently upgraded.
        dvr.feeds.lock().tick(1000);
        super::poll_peer(&dvr, &client, &base, false, 1000).await;

        let (servers, feed) = dvr.feeds.lock().status();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].name, "p1");
        assert_eq!(servers[0].space, "12288 MB");
        assert_eq!(feed.len(), 1);
        assert_eq!(feed[0].name, "p1:a");
        assert!(dvr.queue.lock().status().is_empty());
    }

    #[tokio::test]
    async fn stable_recording_is_enqueued_and_rushes_scan() {
        testutil::init();
        let peer = testutil::MockPeer::start().await;
        let now = 10_000;
        peer.set_status(serde_json::json!({
            "host": "p1",
            "updated": 42,
            "cctv": {
                "console": "http://p1/ui",
                "available": "12G",
                "feeds": {"a": "http://p1/a/stream"},
                "recordings": [[now - 120, "2024/05/01/14-00-00-a.mkv", 1048576]],
            },
        }));
        let (dvr, _tmp) = testutil::test_dvr();
        let client = reqwest::Client::new();
        let base = Url::parse(&peer.base_url()).unwrap();

        dvr.feeds.lock().tick(now);
        super::poll_peer(&dvr, &client, &base, true, now).await;

        let queue = dvr.queue.lock().status();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].path, "2024/05/01/14-00-00-a.mkv");
        assert_eq!(queue[0].state, "idle");

        // The enqueue rushed the next full scan to ~now+10.
        let mut feeds = dvr.feeds.lock();
        assert_eq!(feeds.tick(now + 30).scan, Some(true));
    }

    #[tokio::test]
    async fn matching_check_skips_status() {
        testutil::init();
        let peer = testutil::MockPeer::start().await;
        peer.set_check(serde_json::json!({"host": "p1", "updated": 42}));
        peer.set_status(serde_json::json!({
            "host": "p1",
            "updated": 42,
            "cctv": {
                "console": "http://p1/ui",
                "available": "12G",
                "feeds": {"a": "http://p1/a/stream"},
                "recordings": [],
            },
        }));
        let (dvr, _tmp) = testutil::test_dvr();
        let client = reqwest::Client::new();
        let base = Url::parse(&peer.base_url()).unwrap();

        dvr.feeds.lock().tick(1000);
        super::poll_peer(&dvr, &client, &base, false, 1000).await;
        assert_eq!(peer.status_hits(), 1);

        // Second round: the stamp still matches, so zero status fetches.
        super::poll_peer(&dvr, &client, &base, false, 1030).await;
        assert_eq!(peer.status_hits(), 1);
        assert_eq!(dvr.feeds.lock().status().0[0].timestamp, 1030);

        // The stamp changed: a status fetch follows.
        peer.set_check(serde_json::json!({"host": "p1", "updated": 43}));
        super::poll_peer(&dvr, &client, &base, false, 1060).await;
        assert_eq!(peer.status_hits(), 2);
    }

    #[tokio::test]
    async fn peer_errors_are_contained() {
        testutil::init();
        let peer = testutil::MockPeer::start().await;
        peer.set_raw_status("this is not json".to_owned());
        let (dvr, _tmp) = testutil::test_dvr();
        let client = reqwest::Client::new();
        let base = Url::parse(&peer.base_url()).unwrap();

        dvr.feeds.lock().tick(1000);
        super::poll_peer(&dvr, &client, &base, true, 1000).await;
        assert!(dvr.feeds.lock().status().0.is_empty());

        // An unreachable peer doesn't panic either.
        let dead = Url::parse("http://127.0.0.1:9/").unwrap();
        super::poll_peer(&dvr, &client, &dead, true, 1000).await;
    }
}
