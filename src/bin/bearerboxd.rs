//! `bearerboxd`: the gateway routing core's process entry point.
//!
//! Parses the CLI/config (§10), wires a [`Core`], spawns the background
//! fibers and accept loops, and waits for either a ctrl-c or a `shutdown()`
//! admin command before draining and exiting. `anyhow` is used at this
//! boundary only, following the lib/bin split other repos in the example
//! pack use it for.

use std::time::Duration;

use anyhow::Context;
use clap::Parser;

use bearerbox_core::config::{Cli, Config};
use bearerbox_core::core::Core;
use bearerbox_core::listener;

const STORE_COMPACTOR_TICK: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();

    let cli = Cli::parse();
    let mut config = Config::load(&cli.config).context("loading configuration")?;
    config.apply_cli_overrides(&cli);

    let core = Core::init(config).await.context("initializing gateway core")?;
    tracing::info!("bearerbox core initialized");

    core.store.spawn_compactor(STORE_COMPACTOR_TICK);
    core.pool.clone().spawn_router();
    core.routing.clone().spawn_dispatcher();

    let smsbox_listener = tokio::spawn(listener::run_box_listener(core.clone(), core.config.core.smsbox_port, false));
    let wapbox_listener = core.config.core.wapbox_port.map(|port| tokio::spawn(listener::run_box_listener(core.clone(), port, true)));
    let admin_listener = tokio::spawn(listener::run_admin_listener(core.clone(), core.config.core.admin_port));

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("waiting for ctrl-c")?;
            tracing::info!("ctrl-c received, shutting down");
            core.shutdown();
        }
        result = admin_listener => {
            result.context("admin listener task panicked")?.context("admin listener exited")?;
        }
    }

    smsbox_listener.abort();
    if let Some(handle) = wapbox_listener {
        handle.abort();
    }

    core.drain_and_finalize().await.context("draining gateway core")?;
    tracing::info!("bearerbox core shut down cleanly");
    Ok(())
}
