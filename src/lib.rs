pub mod archive;
pub mod config;
pub mod db;
pub mod model;
pub mod parser;
pub mod replication;
pub mod retry;
pub mod scheduler;
pub mod upsert;

use tokio_util::sync::CancellationToken;

/// Spawn a listener that trips `cancel` on SIGINT or SIGTERM.
///
/// The first signal requests a graceful drain; in-flight sequences finish
/// their current transaction before workers exit.
pub fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            let mut sigterm =
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                    Ok(s) => s,
                    Err(err) => {
                        tracing::error!(error = %err, "failed to install SIGTERM handler");
                        let _ = ctrl_c.await;
                        tracing::info!("shutdown requested; draining in-flight work");
                        cancel.cancel();
                        return;
                    }
                };

            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }

        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }

        tracing::info!("shutdown requested; draining in-flight work");
        cancel.cancel();
    });
}
