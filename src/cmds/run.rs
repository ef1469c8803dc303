// This file is part of Osprey DVR, a security camera recording aggregator.
// Copyright (C) 2021 The Osprey DVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

use crate::discovery::{Directory, PortalDirectory, StaticDirectory};
use crate::dvr::Dvr;
use crate::feeds::{self, FeedRegistry};
use crate::state::StateFile;
use crate::store::Store;
use crate::transfer;
use crate::web;
use base::clock::{Clocks, RealClocks};
use base::Mutex;
use failure::{Error, ResultExt};
use hyper::service::{make_service_fn, service_fn};
use log::{info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use structopt::StructOpt;
use tokio::signal::unix::{signal, SignalKind};
use url::Url;

#[derive(StructOpt)]
pub struct Args {
    /// Bind address for the unencrypted HTTP server.
    #[structopt(long, default_value = "0.0.0.0:8080", parse(try_from_str))]
    http_addr: std::net::SocketAddr,

    /// Directory holding user interface files (.html, .js, etc).
    #[structopt(
        long,
        default_value = "/usr/local/lib/osprey-dvr/ui",
        value_name = "path",
        parse(from_os_str)
    )]
    ui_dir: PathBuf,

    /// Service tag to discover feed servers under.
    #[structopt(long = "dvr-feed", default_value = "cctv", value_name = "tag")]
    dvr_feed: String,

    /// Poll period for discovery rounds, in seconds.
    #[structopt(long = "dvr-check", default_value = "30", value_name = "sec")]
    dvr_check: i64,

    /// Root of the recording archive.
    #[structopt(
        long = "dvr-store",
        default_value = "/var/lib/osprey-dvr/archive",
        value_name = "path",
        parse(from_os_str)
    )]
    dvr_store: PathBuf,

    /// Disk-usage percentage above which the oldest recordings are deleted.
    /// Zero disables cleanup.
    #[structopt(long = "dvr-clean", default_value = "0", value_name = "pct")]
    dvr_clean: i64,

    /// Number of transfer queue slots.
    #[structopt(long = "dvr-queue", default_value = "128", value_name = "n")]
    dvr_queue: usize,

    /// Service portal to ask for feed servers. Without it, only peers pinned
    /// with --dvr-peer are scanned.
    #[structopt(long = "dvr-portal", value_name = "url")]
    dvr_portal: Option<Url>,

    /// A feed server base URL to scan. May be given several times.
    #[structopt(long = "dvr-peer", value_name = "url")]
    dvr_peer: Vec<Url>,

    /// Path of the persisted camera-name snapshot. Defaults to a dotfile
    /// under the archive root.
    #[structopt(long = "dvr-state", value_name = "path", parse(from_os_str))]
    dvr_state: Option<PathBuf>,
}

pub fn run(args: &Args) -> Result<i32, Error> {
    // The whole service is one cooperative event loop; a current-thread
    // runtime matches that and keeps component state free of real contention.
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(async_run(args))
}

fn hostname() -> Result<String, Error> {
    let mut buf = [0u8; 256];
    let name = nix::unistd::gethostname(&mut buf).context("gethostname failed")?;
    Ok(name.to_string_lossy().into_owned())
}

async fn async_run(args: &Args) -> Result<i32, Error> {
    let clocks = RealClocks {};
    let store = Store::new(args.dvr_store.clone(), args.dvr_clean)
        .with_context(|_| format!("unable to open archive root {}", args.dvr_store.display()))?;
    let state = StateFile::new(
        args.dvr_state
            .clone()
            .unwrap_or_else(|| args.dvr_store.join(".osprey-state.json")),
    );
    let mut registry = FeedRegistry::new(args.dvr_feed.clone(), args.dvr_check);
    match state.load() {
        Ok(s) => registry.restore(&s),
        Err(e) => warn!("ignoring unreadable camera state: {}", e),
    }
    let queue = transfer::Queue::new(store.root().to_owned(), args.dvr_queue);
    let host = hostname()?;
    let proxy = args
        .dvr_portal
        .as_ref()
        .and_then(|u| u.host_str())
        .unwrap_or("")
        .to_owned();
    let dvr = Arc::new(Dvr {
        feeds: Mutex::new(registry),
        queue: Mutex::new(queue),
        store,
        state,
        host,
        proxy,
    });

    let client = reqwest::Client::new();
    let directory: Box<dyn Directory> = match &args.dvr_portal {
        Some(portal) => Box::new(PortalDirectory::new(client.clone(), portal.clone())),
        None => {
            if args.dvr_peer.is_empty() {
                warn!("neither --dvr-portal nor --dvr-peer given; no peers will be discovered");
            }
            Box::new(StaticDirectory::new(args.dvr_peer.clone()))
        }
    };

    let svc = Arc::new(web::Service::new(web::Config {
        dvr: dvr.clone(),
        ui_dir: Some(&args.ui_dir),
    })?);
    let make_svc = make_service_fn(move |_conn| {
        futures::future::ok::<_, std::convert::Infallible>(service_fn({
            let svc = Arc::clone(&svc);
            move |req| Arc::clone(&svc).serve(req)
        }))
    });
    let server = ::hyper::Server::try_bind(&args.http_addr)
        .with_context(|_| format!("unable to bind --http-addr={}", &args.http_addr))?
        .tcp_nodelay(true)
        .serve(make_svc);

    let (shutdown_tx, shutdown_rx) = futures::channel::oneshot::channel();
    use futures::future::FutureExt;
    let server_handle = tokio::spawn(server.with_graceful_shutdown(shutdown_rx.map(|_| ())));

    let mut int = signal(SignalKind::interrupt())?;
    let mut term = signal(SignalKind::terminate())?;
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(1));

    info!("Ready to serve HTTP requests");
    crate::events::event("SERVICE", "dvr", "START", &format!("ON {}", dvr.host));
    loop {
        tokio::select! {
            _ = interval.tick() => tick(&dvr, &client, &*directory, &clocks).await,
            _ = int.recv() => break,
            _ = term.recv() => break,
        }
    }

    info!("Shutting down.");
    let _ = shutdown_tx.send(());
    server_handle.await??;
    info!("Exiting.");
    Ok(0)
}

/// One pass of the periodic work: storage maintenance, registry bookkeeping
/// plus any due discovery round, then promotion of the next transfer.
async fn tick(
    dvr: &Arc<Dvr>,
    client: &reqwest::Client,
    directory: &dyn Directory,
    clocks: &RealClocks,
) {
    let now = clocks.realtime().sec;
    dvr.store.tick(now);

    let (actions, service) = {
        let mut feeds = dvr.feeds.lock();
        (feeds.tick(now), feeds.service().to_owned())
    };
    if let Some(snapshot) = actions.save {
        if let Err(e) = dvr.state.save(&snapshot) {
            warn!("unable to save camera state: {}", e);
        }
    }
    if let Some(full) = actions.scan {
        let _t = base::clock::TimerGuard::new(clocks, || format!("discovery round for {}", service));
        feeds::sweep(dvr, client, directory, &service, full, now).await;
    }

    let job = dvr.queue.lock().start(now);
    if let Some(job) = job {
        let dvr = dvr.clone();
        let client = client.clone();
        let clocks = *clocks;
        tokio::spawn(async move {
            let root = dvr.store.root().to_owned();
            let status = transfer::fetch(&client, &root, &job).await;
            dvr.queue.lock().finish(&job, status, clocks.realtime().sec);
        });
    }
}
