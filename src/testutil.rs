// This file is part of Osprey DVR, a security camera recording aggregator.
// Copyright (C) 2021 The Osprey DVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

use crate::dvr::Dvr;
use crate::feeds::FeedRegistry;
use crate::state::StateFile;
use crate::store::Store;
use crate::transfer;
use base::Mutex;
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;

static INIT: std::sync::Once = std::sync::Once::new();

/// Performs global initialization for tests:
///
/// *   set up logging. (Note the output can be confusing unless `RUST_TEST_THREADS=1` is set in
///     the environment.)
pub fn init() {
    INIT.call_once(base::tracing_setup::install_for_tests);
}

/// A `Dvr` with a tempdir-backed archive, a small queue, and no peers.
pub fn test_dvr() -> (Arc<Dvr>, tempfile::TempDir) {
    let tmp = tempfile::tempdir().unwrap();
    let store = Store::new(tmp.path().join("archive"), 0).unwrap();
    let queue = transfer::Queue::new(store.root().to_owned(), 16);
    let state = StateFile::new(tmp.path().join("state.json"));
    let dvr = Arc::new(Dvr {
        feeds: Mutex::new(FeedRegistry::new("cctv".to_owned(), 30)),
        queue: Mutex::new(queue),
        store,
        state,
        host: "testhost".to_owned(),
        proxy: String::new(),
    });
    (dvr, tmp)
}

#[derive(Default)]
struct PeerState {
    check: Option<String>,
    status: Option<String>,
    status_hits: usize,
    recordings: HashMap<String, Vec<u8>>,
}

/// An in-process feed peer speaking the `/check`, `/status`,
/// `/recording/<path>` protocol, with a Range-aware recording handler.
///
/// `/check` answers 401 (endpoint unimplemented) until `set_check` is
/// called, matching peers that predate the check optimization.
pub struct MockPeer {
    addr: std::net::SocketAddr,
    state: Arc<Mutex<PeerState>>,
}

impl MockPeer {
    pub async fn start() -> Self {
        let state = Arc::new(Mutex::new(PeerState::default()));
        let svc_state = state.clone();
        let make_svc = hyper::service::make_service_fn(move |_conn| {
            let state = svc_state.clone();
            futures::future::ok::<_, Infallible>(hyper::service::service_fn(move |req| {
                serve(state.clone(), req)
            }))
        });
        let server = hyper::Server::bind(&([127, 0, 0, 1], 0).into()).serve(make_svc);
        let addr = server.local_addr();
        tokio::spawn(server);
        MockPeer { addr, state }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn set_check(&self, body: serde_json::Value) {
        self.state.lock().check = Some(body.to_string());
    }

    pub fn set_status(&self, body: serde_json::Value) {
        self.state.lock().status = Some(body.to_string());
    }

    pub fn set_raw_status(&self, body: String) {
        self.state.lock().status = Some(body);
    }

    pub fn put_recording(&self, path: &str, data: Vec<u8>) {
        self.state.lock().recordings.insert(path.to_owned(), data);
    }

    pub fn status_hits(&self) -> usize {
        self.state.lock().status_hits
    }
}

async fn serve(
    state: Arc<Mutex<PeerState>>,
    req: hyper::Request<hyper::Body>,
) -> Result<hyper::Response<hyper::Body>, Infallible> {
    let path = req.uri().path().to_owned();
    let mut s = state.lock();
    let resp = if path == "/check" {
        match &s.check {
            Some(body) => json_response(body.clone()),
            None => plain_response(hyper::StatusCode::UNAUTHORIZED, "check unimplemented"),
        }
    } else if path == "/status" {
        s.status_hits += 1;
        match &s.status {
            Some(body) => json_response(body.clone()),
            None => plain_response(hyper::StatusCode::NOT_FOUND, "no status configured"),
        }
    } else if let Some(p) = path.strip_prefix("/recording/") {
        match s.recordings.get(p) {
            Some(data) => match range_start(&req) {
                Some(offset) if (offset as usize) <= data.len() => hyper::Response::builder()
                    .status(hyper::StatusCode::PARTIAL_CONTENT)
                    .body(hyper::Body::from(data[offset as usize..].to_vec()))
                    .unwrap(),
                _ => hyper::Response::new(hyper::Body::from(data.clone())),
            },
            None => plain_response(hyper::StatusCode::NOT_FOUND, "no such recording"),
        }
    } else {
        plain_response(hyper::StatusCode::NOT_FOUND, "")
    };
    Ok(resp)
}

fn range_start(req: &hyper::Request<hyper::Body>) -> Option<u64> {
    req.headers()
        .get(http::header::RANGE)?
        .to_str()
        .ok()?
        .strip_prefix("bytes=")?
        .strip_suffix('-')?
        .parse()
        .ok()
}

fn json_response(body: String) -> hyper::Response<hyper::Body> {
    hyper::Response::builder()
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(hyper::Body::from(body))
        .unwrap()
}

fn plain_response(status: hyper::StatusCode, body: &'static str) -> hyper::Response<hyper::Body> {
    hyper::Response::builder()
        .status(status)
        .body(hyper::Body::from(body))
        .unwrap()
}
