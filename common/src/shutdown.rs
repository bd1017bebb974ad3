use std::sync::atomic::{AtomicBool, Ordering};

/// Set when the shutdown signal that fired was SIGINT, so the process can
/// exit with the conventional 130 instead of 0.
static SIGINT_RECEIVED: AtomicBool = AtomicBool::new(false);

pub fn was_interrupted() -> bool {
    SIGINT_RECEIVED.load(Ordering::Relaxed)
}

pub async fn shutdown_signal() {
    // Listen for both SIGINT (Ctrl+C) and SIGTERM (K8s / ECS)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigint = signal(SignalKind::interrupt()).expect("install SIGINT handler");
        let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");

        tokio::select! {
            _ = sigint.recv() => {
                SIGINT_RECEIVED.store(true, Ordering::Relaxed);
                tracing::warn!("received SIGINT, draining in-flight work");
            }
            _ = sigterm.recv() => {
                tracing::warn!("received SIGTERM, draining in-flight work");
            }
        }
    }

    #[cfg(not(unix))]
    {
        // Fallback: only Ctrl+C on non-Unix
        tokio::signal::ctrl_c().await.expect("install Ctrl+C handler");
        SIGINT_RECEIVED.store(true, Ordering::Relaxed);
    }
}
