use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Install a shutdown handler that listens for SIGTERM and SIGINT.
///
/// Returns the root `CancellationToken`, cancelled when either signal is
/// received. Every subsystem runs under a child of this token. If a signal
/// handler cannot be installed the token is cancelled right away so the
/// node never runs without a way to stop it.
pub fn install_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let token_clone = token.clone();

    tokio::spawn(async move {
        let signals = signal(SignalKind::terminate())
            .and_then(|sigterm| signal(SignalKind::interrupt()).map(|sigint| (sigterm, sigint)));
        let (mut sigterm, mut sigint) = match signals {
            Ok(signals) => signals,
            Err(e) => {
                tracing::error!(error = %e, "Failed to install signal handlers, shutting down");
                token_clone.cancel();
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, initiating graceful shutdown");
            }
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT, initiating graceful shutdown");
            }
        }

        token_clone.cancel();
    });

    token
}
