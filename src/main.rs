// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod api;
mod cli;
mod server;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::{Cli, Commands};
use switchboard_core::{Dispatcher, FallbackChain};
use switchboard_pool::{
    build_policy, AccountPool, PoolTuning, SessionTracker, SignatureCache, UsageHistory,
};
use switchboard_upstream::{HeaderMode, TokenProvider, UpstreamClient};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut config = switchboard_config::load(cli.config.as_deref())?;
    if let Some(listen) = &cli.listen {
        config.listen = listen.clone();
    }
    if let Some(state_dir) = &cli.state_dir {
        config.state_dir = Some(state_dir.clone());
    }
    let config = Arc::new(config);

    match cli.command {
        Some(Commands::ShowConfig) => {
            println!("{}", serde_json::to_string_pretty(&*config).unwrap_or_default());
            Ok(())
        }
        Some(Commands::Serve) | None => serve(config).await,
    }
}

async fn serve(config: Arc<switchboard_config::Config>) -> anyhow::Result<()> {
    let state_dir = config.state_dir();
    std::fs::create_dir_all(&state_dir)
        .with_context(|| format!("creating state dir {}", state_dir.display()))?;

    let tuning = PoolTuning {
        max_concurrent_requests: config.max_concurrent_requests,
        default_cooldown: Duration::from_millis(config.default_cooldown_ms),
        max_cooldown: Duration::from_millis(config.max_cooldown_ms),
        min_quota_fraction: config.account_selection.quota.low_threshold,
    };
    let pool = Arc::new(
        AccountPool::with_persistence(state_dir.join("accounts.json"), tuning)
            .context("loading account pool")?,
    );
    let signatures = Arc::new(
        SignatureCache::with_persistence(state_dir.join("signature-cache.json"))
            .context("loading signature cache")?,
    );
    let usage = Arc::new(
        UsageHistory::with_persistence(state_dir.join("usage-history.json"))
            .context("loading usage history")?,
    );
    let sessions = Arc::new(SessionTracker::new());
    let policy = build_policy(&config.account_selection);

    let header_mode = match config.gemini_header_mode {
        switchboard_config::HeaderMode::Cli => HeaderMode::Cli,
        switchboard_config::HeaderMode::Antigravity => HeaderMode::Antigravity,
    };
    let upstream = Arc::new(UpstreamClient::new(
        header_mode,
        Duration::from_millis(config.request_timeout_ms),
    ));
    let tokens = Arc::new(TokenProvider::new(reqwest::Client::new()));

    let dispatcher = Arc::new(Dispatcher {
        config: Arc::clone(&config),
        pool: Arc::clone(&pool),
        sessions: Arc::clone(&sessions),
        signatures: Arc::clone(&signatures),
        usage: Arc::clone(&usage),
        policy,
        tokens,
        upstream,
        fallback: FallbackChain::new()?,
    });

    spawn_maintenance(Arc::clone(&dispatcher));

    tracing::info!(
        listen = %config.listen,
        accounts = pool.len(),
        strategy = ?config.account_selection.strategy,
        "starting switchboard"
    );
    server::serve(config, dispatcher).await
}

/// Periodic upkeep: expired-entry sweeps and quota snapshot refreshes.
fn spawn_maintenance(dispatcher: Arc<Dispatcher>) {
    let sweeper = Arc::clone(&dispatcher);
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(switchboard_pool::SWEEP_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tick.tick().await;
            sweeper.signatures.sweep();
            sweeper.sessions.sweep();
            sweeper.pool.clear_expired();
        }
    });

    tokio::spawn(async move {
        let stale = Duration::from_millis(
            dispatcher.config.account_selection.quota.stale_ms.max(60_000),
        );
        let mut tick = tokio::time::interval(stale);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; skip it so startup does not
        // hammer the metadata endpoint before any request needs it.
        tick.tick().await;
        loop {
            tick.tick().await;
            dispatcher.refresh_quota_snapshots().await;
        }
    });
}

fn init_logging(verbose: bool) {
    let default_filter = if verbose { "switchboard=debug,info" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .init();
}
