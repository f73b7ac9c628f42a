//! Process signals: SIGINT and SIGTERM request shutdown, SIGHUP requests a
//! policy reload.

use anyhow::Result;
use tokio::sync::{broadcast, mpsc};
use tracing::info;

pub struct Signals {
    pub shutdown: broadcast::Receiver<()>,
    /// Closed when reloads are not supported on this platform.
    pub reload: mpsc::Receiver<()>,
}

pub fn install() -> Result<Signals> {
    let (shutdown_tx, shutdown) = broadcast::channel::<()>(1);
    let (reload_tx, reload) = mpsc::channel::<()>(1);

    #[cfg(unix)]
    {
        use anyhow::Context;
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm =
            signal(SignalKind::terminate()).context("failed to register SIGTERM handler")?;
        let mut sighup =
            signal(SignalKind::hangup()).context("failed to register SIGHUP handler")?;

        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("received SIGINT (ctrl-c)");
                }
                _ = sigterm.recv() => {
                    info!("received SIGTERM");
                }
            }
            let _ = shutdown_tx.send(());
        });

        tokio::spawn(async move {
            while sighup.recv().await.is_some() {
                info!("received SIGHUP");
                // A reload that is already queued covers this one.
                let _ = reload_tx.try_send(());
            }
        });
    }

    #[cfg(not(unix))]
    {
        drop(reload_tx);
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("received SIGINT (ctrl-c)");
            let _ = shutdown_tx.send(());
        });
    }

    Ok(Signals { shutdown, reload })
}
