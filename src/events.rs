// This file is part of Osprey DVR, a security camera recording aggregator.
// Copyright (C) 2021 The Osprey DVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The operational event log consumed by the rest of the service.
//!
//! Events are the operator-visible history (a camera appeared, a directory
//! was deleted); traces are scoped failure records that never surface to the
//! user; sensor samples feed long-term metrics. All three land in the
//! process log under distinct targets so a collector can route them.

use log::{info, warn};

/// Records an operator-visible event in CATEGORY/OBJECT/ACTION form.
pub fn event(category: &str, object: &str, action: &str, details: &str) {
    info!(target: "osprey_dvr::event", "{} {} {}: {}", category, object, action, details);
}

/// Records a failure scoped to one object (typically a peer URL). The next
/// cycle retries; nothing surfaces to the user.
pub fn trace(scope: &str, details: &str) {
    warn!(target: "osprey_dvr::trace", "{}: {}", scope, details);
}

/// Records one metric sample for the sensor sink.
pub fn sensor(object: &str, name: &str, value: i64, unit: &str) {
    info!(target: "osprey_dvr::sensor", "{} {}: {} {}", object, name, value, unit);
}
