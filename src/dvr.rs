// This file is part of Osprey DVR, a security camera recording aggregator.
// Copyright (C) 2021 The Osprey DVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The service's components, owned in one place.
//!
//! Everything runs on one cooperative event loop; the mutexes only arbitrate
//! between the tick task and request handlers, never between parallel
//! workers, and are never held across an await point.

use crate::feeds::FeedRegistry;
use crate::state::StateFile;
use crate::store::Store;
use crate::transfer;
use base::Mutex;

pub struct Dvr {
    pub feeds: Mutex<FeedRegistry>,
    pub queue: Mutex<transfer::Queue>,
    pub store: Store,
    pub state: StateFile,

    /// Our own hostname, reported in the status document.
    pub host: String,

    /// The portal host fronting us, if any.
    pub proxy: String,
}
