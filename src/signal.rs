//! Termination signals of the controller process.

/// Returns a `Future` that completes when the controller should start to shut down.
pub async fn shutdown() {
    imp::shutdown().await
}

#[cfg(unix)]
mod imp {
    use tokio::signal::unix::{signal, SignalKind};

    pub(super) async fn shutdown() {
        tokio::select! {
            // SIGINT - Ctrl-C in a terminal.
            () = sig(SignalKind::interrupt(), "SIGINT") => {}
            // SIGTERM - service managers ask for a graceful stop with this.
            () = sig(SignalKind::terminate(), "SIGTERM") => {}
        };
    }

    async fn sig(kind: SignalKind, name: &'static str) {
        match signal(kind) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                error!(target: "fl_link::signal", "failed to register {} handler: {}", name, err);
                // never resolve, the other signal can still end the process
                std::future::pending::<()>().await;
            }
        }
        info!(
            // use target to remove 'imp' from output
            target: "fl_link::signal",
            "received {}, starting shutdown",
            name,
        );
    }
}

#[cfg(not(unix))]
mod imp {
    pub(super) async fn shutdown() {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(target: "fl_link::signal", "failed to listen for Ctrl-C: {}", err);
            std::future::pending::<()>().await;
        }
        info!(
            // use target to remove 'imp' from output
            target: "fl_link::signal",
            "received Ctrl-C, starting shutdown",
        );
    }
}
