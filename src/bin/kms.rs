//! CometBFT Remote Signer
//!
//! Holds the validator consensus key and signs on behalf of one consensus
//! node, or a primary/standby pair in HA mode.
//!
//! ## Startup Order
//!
//! 1. Settings are validated
//! 2. Key material is loaded (the process exits on any key error)
//! 3. The signing watermark is opened or bootstrapped
//! 4. Only then are endpoints dialed
//!
//! ## Security
//!
//! - The consensus key never leaves process memory
//! - Every signature is persisted to the watermark before it is returned
//! - A watermark that cannot be read or written stops the process

use anyhow::Context;
use comet_kms::{Settings, ShutdownHandle, Signer, keystore::KeyRing, storage::SigningStateStore, telemetry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing first
    telemetry::init_tracing();

    let result = run().await;
    if let Err(e) = &result {
        tracing::error!("{e:#}");
    }

    telemetry::shutdown_tracing();
    result
}

async fn run() -> anyhow::Result<()> {
    // Load and validate settings
    let settings = Settings::from_env();
    if let Err(message) = settings.validate() {
        tracing::error!("{message}");
        std::process::exit(1);
    }

    tracing::info!(
        git_sha = env!("GIT_SHA"),
        build_time = env!("BUILD_TIME"),
        primary = %settings.primary_addr(),
        standby = settings.standby_addr().unwrap_or("-"),
        pubkey_policy = %settings.pubkey_policy(),
        "Starting CometBFT KMS"
    );

    // Keys before state, state before network
    let keys = KeyRing::load(
        settings.key_file(),
        settings.standby_key_file().map(|p| p.as_path()),
        settings.ha_enabled(),
    )
    .context("Failed to load signing keys")?;

    let store =
        SigningStateStore::open(settings.state_file()).context("Failed to open signing state")?;

    let signer = Signer::from_settings(&settings, keys, store).context("Invalid endpoint")?;

    let shutdown = ShutdownHandle::new();
    tokio::spawn(wait_for_signal(shutdown.clone()));

    signer.run(shutdown).await.context("Signer stopped on fatal error")?;
    Ok(())
}

/// Trigger shutdown on Ctrl-C or SIGTERM.
async fn wait_for_signal(shutdown: ShutdownHandle) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    tracing::info!("Shutdown signal received");
    shutdown.trigger();
}
