// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

use clap::Parser;

use dubbo_probe::args;
use dubbo_probe::runner;

fn main() -> anyhow::Result<()> {
    let args = args::Args::parse();

    runner::run(args)
}
