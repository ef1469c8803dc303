// This file is part of Osprey DVR, a security camera recording aggregator.
// Copyright (C) 2021 The Osprey DVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Serialized transfer of recordings from feed peers into the archive.
//!
//! The queue is a fixed ring of slots. Slots between `consumer` and
//! `producer` are pending work (oldest first); the remainder is a bounded
//! history of recent outcomes, consulted to deduplicate repeated
//! notifications without hitting the filesystem. At most one transfer is in
//! flight, always the slot at `consumer`.

use crate::events;
use crate::json;
use base::{ErrorKind, ResultExt};
use log::{debug, info, warn};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};

/// Queue sizes below this are pointless; the history region would be too
/// small to absorb one discovery round.
const MIN_SLOTS: usize = 16;

/// A transfer that took longer than this is called out in the log.
const SLOW_SECS: i64 = 120;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum State {
    Empty,
    Idle,
    Active,
    Done,
    Failed,
}

impl State {
    fn as_str(self) -> &'static str {
        match self {
            State::Empty => "empty",
            State::Idle => "idle",
            State::Active => "active",
            State::Done => "done",
            State::Failed => "failed",
        }
    }
}

#[derive(Clone, Debug)]
struct Slot {
    state: State,
    feed: String,
    path: String,
    size: u64,
    offset: u64,
    initiated: i64,
}

impl Default for Slot {
    fn default() -> Self {
        Slot {
            state: State::Empty,
            feed: String::new(),
            path: String::new(),
            size: 0,
            offset: 0,
            initiated: 0,
        }
    }
}

/// A promoted transfer, handed to the async fetch and back to [`Queue::finish`].
///
/// Carries the slot index so a completion can never be applied to a reused
/// slot: `finish` asserts the index still is the consumer.
#[derive(Debug)]
pub struct Job {
    index: usize,
    pub feed: String,
    pub path: String,
    pub size: u64,
    pub offset: u64,
}

pub struct Queue {
    slots: Box<[Slot]>,
    producer: usize,
    consumer: usize,
    root: PathBuf,
}

impl Queue {
    pub fn new(root: PathBuf, capacity: usize) -> Self {
        let capacity = capacity.max(MIN_SLOTS);
        Queue {
            slots: vec![Slot::default(); capacity].into_boxed_slice(),
            producer: 0,
            consumer: 0,
            root,
        }
    }

    fn next(&self, i: usize) -> usize {
        (i + 1) % self.slots.len()
    }

    fn is_full(&self) -> bool {
        self.next(self.producer) == self.consumer
    }

    /// Pending slot indices, oldest (consumer) first.
    fn pending(&self) -> impl Iterator<Item = usize> + '_ {
        let mut i = self.consumer;
        std::iter::from_fn(move || {
            if i == self.producer {
                return None;
            }
            let cur = i;
            i = self.next(i);
            Some(cur)
        })
    }

    /// History slot indices, oldest first. Includes never-used `Empty` slots.
    fn history(&self) -> impl Iterator<Item = usize> + '_ {
        let mut i = self.producer;
        std::iter::from_fn(move || {
            if i == self.consumer {
                return None;
            }
            let cur = i;
            i = self.next(i);
            Some(cur)
        })
    }

    /// Idempotent enqueue of one peer-reported recording. Returns true iff a
    /// new slot was appended, which callers use to rush the next scan.
    pub fn notify(&mut self, feed: &str, path: &str, size: u64) -> bool {
        let mut offset = 0u64;
        let mut cached = false;

        // Recently transferred?
        for i in self.history().collect::<Vec<_>>() {
            let s = &self.slots[i];
            if s.state == State::Empty || s.path != path {
                continue;
            }
            match s.state {
                State::Done => {
                    if s.size == size {
                        return false; // already transferred.
                    }
                    if size > s.size {
                        offset = s.size; // transfer the additional data.
                    }
                }
                State::Failed => {} // redo it from scratch.
                _ => unreachable!(),
            }
            cached = true;
            break;
        }

        // Queued for transfer?
        for i in self.pending().collect::<Vec<_>>() {
            let s = &mut self.slots[i];
            if s.path != path {
                continue;
            }
            if s.size == size {
                return false; // already queued.
            }
            if s.state == State::Idle {
                s.size = size; // update before the transfer starts.
                return false;
            }
            // Active with a different size: queue again to pick up the
            // difference (or redo entirely if the file shrank).
            offset = if size > s.size { s.size } else { 0 };
            cached = true;
            break;
        }

        // Security check: no arbitrary access.
        if path.contains("..") {
            warn!("rejecting traversal in notified path {:?}", path);
            return false;
        }

        let full = self.root.join(path);
        if let Some(parent) = full.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                events::trace(path, &format!("can't create directory tree: {}", e));
                return false;
            }
        }

        if !cached {
            // Not in our recent transfers; the (more expensive) next step is
            // to check the local filesystem.
            if let Ok(m) = std::fs::metadata(&full) {
                let len = m.len();
                if len == size {
                    return false; // already local and whole.
                }
                if size > len {
                    offset = len; // resume a partial transfer.
                }
            }
        }

        // The file must be new. Append it, unless the ring is full; a full
        // ring drops silently and the next discovery round retries.
        if self.is_full() {
            debug!("transfer queue full, dropping {}", path);
            return false;
        }
        let p = self.producer;
        self.slots[p] = Slot {
            state: State::Idle,
            feed: feed.to_owned(),
            path: path.to_owned(),
            size,
            offset,
            initiated: 0,
        };
        self.producer = self.next(p);
        self.check_invariants();
        true
    }

    /// Promotes the head idle slot to active, if nothing is in flight.
    pub fn start(&mut self, now: i64) -> Option<Job> {
        self.check_invariants();
        if self.producer == self.consumer {
            return None;
        }
        let c = self.consumer;
        let s = &mut self.slots[c];
        match s.state {
            State::Active => None, // a transfer is already in flight.
            State::Idle => {
                s.state = State::Active;
                s.initiated = now;
                Some(Job {
                    index: c,
                    feed: s.feed.clone(),
                    path: s.path.clone(),
                    size: s.size,
                    offset: s.offset,
                })
            }
            other => panic!("head slot {} in state {:?}", c, other),
        }
    }

    /// Retires the active transfer with the final HTTP status (or a synthetic
    /// 500 for local failures) and advances the ring.
    pub fn finish(&mut self, job: &Job, status: u16, now: i64) {
        let c = self.consumer;
        assert_eq!(job.index, c, "completion for a reused slot");
        let s = &mut self.slots[c];
        assert_eq!(s.state, State::Active);
        assert_eq!(s.path, job.path);
        if (200..300).contains(&status) {
            s.state = State::Done;
            let secs = now - s.initiated;
            let mut took = human_duration(secs);
            if secs > SLOW_SECS {
                took.push_str(" (slow)");
            }
            info!(
                "retrieved {} ({}) from {} in {}",
                s.path,
                base::strutil::encode_size(s.size as i64),
                s.feed,
                took
            );
            events::event(
                "TRANSFER",
                "dvr",
                "COMPLETE",
                &format!("FOR FILE {} AT {}", s.path, s.feed),
            );
        } else {
            s.state = State::Failed;
            events::event(
                "TRANSFER",
                "dvr",
                "FAILED",
                &format!("CODE {} FOR FILE {} AT {}", status, s.path, s.feed),
            );
        }
        self.consumer = self.next(c);
        self.check_invariants();
    }

    /// The `"queue"` status section, in FIFO order: history first, then
    /// pending with the active transfer at the front.
    pub fn status(&self) -> Vec<json::QueueEntry> {
        let mut out = Vec::new();
        for i in self.history() {
            let s = &self.slots[i];
            if s.state == State::Empty {
                continue;
            }
            out.push(json::QueueEntry {
                feed: s.feed.clone(),
                path: s.path.clone(),
                size: s.size,
                state: s.state.as_str(),
            });
        }
        for i in self.pending() {
            let s = &self.slots[i];
            out.push(json::QueueEntry {
                feed: s.feed.clone(),
                path: s.path.clone(),
                size: s.size,
                state: s.state.as_str(),
            });
        }
        out
    }

    /// Queue-state mismatches are programming errors; die loudly so the
    /// supervisor restarts us with a core dump.
    fn check_invariants(&self) {
        let mut active = 0;
        for i in self.pending() {
            match self.slots[i].state {
                State::Idle => {}
                State::Active => {
                    assert_eq!(i, self.consumer, "active slot {} not at consumer", i);
                    active += 1;
                }
                other => panic!("pending slot {} in state {:?}", i, other),
            }
        }
        assert!(active <= 1);
        for i in self.history() {
            match self.slots[i].state {
                State::Empty | State::Done | State::Failed => {}
                other => panic!("history slot {} in state {:?}", i, other),
            }
        }
    }
}

fn human_duration(secs: i64) -> String {
    if secs >= 60 {
        format!("{}m{:02}s", secs / 60, secs % 60)
    } else {
        format!("{}s", secs)
    }
}

/// Runs one transfer to completion, streaming the body straight to the
/// archive file. Returns the HTTP status to hand to [`Queue::finish`]; local
/// failures come back as a synthetic 500.
pub async fn fetch(client: &reqwest::Client, root: &Path, job: &Job) -> u16 {
    match fetch_inner(client, root, job).await {
        Ok(status) => status,
        Err(e) => {
            events::trace(&job.path, &format!("transfer failed: {}", e));
            500
        }
    }
}

async fn fetch_inner(
    client: &reqwest::Client,
    root: &Path,
    job: &Job,
) -> Result<u16, base::Error> {
    let url = format!(
        "{}/recording/{}",
        job.feed.trim_end_matches('/'),
        job.path
    );
    let mut req = client.get(&url);
    if job.offset > 0 {
        req = req.header(http::header::RANGE, format!("bytes={}-", job.offset));
    }
    let mut resp = req.send().await.err_kind(ErrorKind::Unavailable)?;
    let status = resp.status().as_u16();

    // 200 rewrites from scratch; 206 appends the missing suffix; anything
    // else is the peer's problem and becomes the slot's failure code.
    let mut f = match status {
        200 => tokio::fs::File::create(root.join(&job.path))
            .await
            .err_kind(ErrorKind::Internal)?,
        206 => {
            let mut f = tokio::fs::OpenOptions::new()
                .write(true)
                .open(root.join(&job.path))
                .await
                .err_kind(ErrorKind::Internal)?;
            f.seek(SeekFrom::Start(job.offset))
                .await
                .err_kind(ErrorKind::Internal)?;
            f
        }
        _ => return Ok(status),
    };
    while let Some(chunk) = resp.chunk().await.err_kind(ErrorKind::Unavailable)? {
        f.write_all(&chunk).await.err_kind(ErrorKind::Internal)?;
    }
    f.flush().await.err_kind(ErrorKind::Internal)?;
    Ok(status)
}
