use anyhow::Context;
use tokio_util::sync::CancellationToken;

use card_request_worker::app;
use card_request_worker::config::Settings;
use card_request_worker::logging;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    // Optional .env next to the binary's working directory
    let _ = dotenvy::dotenv();

    let settings = Settings::from_env().context("failed to load configuration")?;
    let _log_guard = logging::init(&settings).context("failed to set up logging")?;

    tracing::info!("card-request-worker v{}", env!("CARGO_PKG_VERSION"));
    tracing::debug!(?settings, "Config values");

    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_signal(shutdown.clone()));

    let stats = app::run(settings, shutdown)
        .await
        .context("card request worker failed")?;

    tracing::info!(
        acknowledged = stats.acknowledged,
        requeued = stats.requeued,
        discarded = stats.discarded,
        settle_failed = stats.settle_failed,
        "Worker exited cleanly"
    );
    Ok(())
}

/// Cancel `shutdown` on SIGINT or SIGTERM.
async fn wait_for_signal(shutdown: CancellationToken) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => match result {
            Ok(()) => tracing::info!("Received SIGINT"),
            Err(e) => {
                tracing::error!(error = %e, "Error setting up Ctrl-C handler");
                return;
            }
        },
        () = terminate() => tracing::info!("Received SIGTERM"),
    }

    shutdown.cancel();
}

/// Resolves on SIGTERM. Never resolves where SIGTERM is unavailable.
async fn terminate() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                return;
            }
            Err(e) => tracing::warn!(error = %e, "Error setting up SIGTERM handler"),
        }
    }

    std::future::pending::<()>().await
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn listener_waits_until_a_signal_arrives() {
        let shutdown = CancellationToken::new();
        let listener = tokio::spawn(wait_for_signal(shutdown.clone()));

        let stopped = tokio::time::timeout(Duration::from_millis(100), shutdown.cancelled()).await;
        assert!(stopped.is_err());
        assert!(!listener.is_finished());

        listener.abort();
    }

    #[tokio::test]
    async fn terminate_stays_pending_without_sigterm() {
        let fired = tokio::time::timeout(Duration::from_millis(50), terminate()).await;
        assert!(fired.is_err());
    }
}
