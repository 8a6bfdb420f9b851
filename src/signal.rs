//! Signal handling for graceful shutdown.

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Wait for a shutdown signal (SIGINT, SIGTERM, or SIGQUIT on Unix).
///
/// A handler that cannot be installed is logged and ignored; Ctrl-C is
/// still honoured as long as one handler is available.
#[cfg(unix)]
pub async fn shutdown_signal() {
    use tokio::signal::unix::{Signal, SignalKind, signal};

    async fn recv(handler: &mut Option<Signal>) {
        match handler {
            Some(signal) => {
                signal.recv().await;
            }
            None => std::future::pending::<()>().await,
        }
    }

    let install = |kind: SignalKind, name: &'static str| match signal(kind) {
        Ok(handler) => Some(handler),
        Err(e) => {
            warn!(signal = name, error = %e, "Failed to install signal handler");
            None
        }
    };

    let mut sigint = install(SignalKind::interrupt(), "SIGINT");
    let mut sigterm = install(SignalKind::terminate(), "SIGTERM");
    let mut sigquit = install(SignalKind::quit(), "SIGQUIT");

    if sigint.is_none() && sigterm.is_none() && sigquit.is_none() {
        ctrl_c().await;
        return;
    }

    tokio::select! {
        _ = recv(&mut sigint) => {
            info!(message = "Signal received.", signal = "SIGINT");
        }
        _ = recv(&mut sigterm) => {
            info!(message = "Signal received.", signal = "SIGTERM");
        }
        _ = recv(&mut sigquit) => {
            info!(message = "Signal received.", signal = "SIGQUIT");
        }
    }
}

/// Wait for Ctrl-C on platforms without Unix signals.
#[cfg(not(unix))]
pub async fn shutdown_signal() {
    ctrl_c().await;
}

async fn ctrl_c() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!(message = "Signal received.", signal = "Ctrl-C"),
        Err(e) => {
            warn!(error = %e, "Failed to listen for Ctrl-C, waiting forever");
            std::future::pending::<()>().await;
        }
    }
}

/// Token cancelled once a shutdown signal arrives.
pub fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        trigger.cancel();
    });
    token
}
