// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "switchboard",
    about = "Protocol-translating chat-completion proxy with a pooled upstream account dispatcher",
    version
)]
pub struct Cli {
    /// Explicit config file (JSON); merged over the default search paths.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Listen address override (e.g. 0.0.0.0:8421).
    #[arg(short, long)]
    pub listen: Option<String>,

    /// State directory override (accounts.json, signature-cache.json, ...).
    #[arg(long)]
    pub state_dir: Option<PathBuf>,

    /// Verbose logging to stderr (equivalent to RUST_LOG=debug).
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the proxy server (the default when no subcommand is given).
    Serve,
    /// Print the effective merged configuration and exit.
    ShowConfig,
}
