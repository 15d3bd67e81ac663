use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Cancel the returned token on SIGTERM or SIGINT.
///
/// Every long-running task of the agent (consensus loop, replication,
/// blocked queries, HTTP server) watches this token and winds down.
pub fn install_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();

    tokio::spawn(async move {
        let (mut sigterm, mut sigint) = match (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) {
            (Ok(term), Ok(int)) => (term, int),
            (Err(e), _) | (_, Err(e)) => {
                tracing::error!(error = %e, "Failed to install signal handlers, falling back to ctrl-c");
                let _ = tokio::signal::ctrl_c().await;
                trigger.cancel();
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, shutting down agent");
            }
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT, shutting down agent");
            }
        }

        trigger.cancel();
    });

    token
}
