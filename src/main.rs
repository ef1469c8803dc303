// This file is part of Osprey DVR, a security camera recording aggregator.
// Copyright (C) 2021 The Osprey DVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

use log::{debug, error};
use structopt::StructOpt;

mod body;
mod cmds;
mod discovery;
mod dvr;
mod events;
mod feeds;
mod json;
mod state;
mod store;
#[cfg(test)]
mod testutil;
mod transfer;
mod web;

#[derive(StructOpt)]
#[structopt(
    name = "osprey-dvr",
    about = "Aggregates recordings from CCTV feed servers into one archive."
)]
enum Args {
    /// Checks the archive tree for files that don't belong.
    Check(cmds::check::Args),

    /// Runs the aggregation service: discover feed servers, pull their
    /// recordings, and serve the archive over HTTP.
    Run(cmds::run::Args),
}

impl Args {
    fn run(self) -> Result<i32, failure::Error> {
        match self {
            Args::Check(a) => cmds::check::run(&a),
            Args::Run(a) => cmds::run::run(&a),
        }
    }
}

fn main() {
    base::tracing_setup::install();
    let args = Args::from_args();
    match args.run() {
        Err(e) => {
            error!("exiting due to error: {}", base::prettify_failure(&e));
            ::std::process::exit(1);
        }
        Ok(rv) => {
            debug!("exiting with status {}", rv);
            std::process::exit(rv);
        }
    }
}
