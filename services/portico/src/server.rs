//! Process lifecycle: initial apply, control API, SIGHUP reload and
//! graceful shutdown.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::api::{self, AppState};
use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::hub::{Hub, Overrides};
use crate::listener::{resolve_bind_addr, Ingress, DEFAULT_INGRESS_CAPACITY};
use crate::log::LogHandle;
use crate::manager::ListenerManager;
use crate::statistic::StatisticManager;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// A running proxy: listeners, dispatcher, traffic ticker and control API.
pub struct Server {
    hub: Arc<Hub>,
    overrides: Overrides,
    shutdown: CancellationToken,
    workers: Vec<(&'static str, JoinHandle<()>)>,
}

impl Server {
    /// Wire the ingress channels to the dispatcher and start the traffic
    /// ticker. Must be called from within a tokio runtime.
    pub fn new(config_path: PathBuf, overrides: Overrides, log: LogHandle) -> Self {
        let shutdown = CancellationToken::new();
        let (ingress, receivers) = Ingress::channel(DEFAULT_INGRESS_CAPACITY);

        let stats = StatisticManager::new();
        let ticker = stats.spawn_ticker(shutdown.clone());
        let dispatcher = Dispatcher::new(stats.clone()).spawn(receivers, shutdown.clone());

        let manager = Arc::new(ListenerManager::new(ingress));
        let hub = Arc::new(Hub::new(manager, stats, log, config_path, overrides.clone()));

        Self {
            hub,
            overrides,
            shutdown,
            workers: vec![("dispatcher", dispatcher), ("traffic ticker", ticker)],
        }
    }

    pub fn hub(&self) -> Arc<Hub> {
        Arc::clone(&self.hub)
    }

    /// Cancelling this token stops [`serve`](Self::serve).
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Bind the control API, apply `config` and run until SIGINT/SIGTERM or
    /// the shutdown token fires.
    pub async fn serve(self, config: Config) -> anyhow::Result<()> {
        let Server {
            hub,
            overrides,
            shutdown,
            workers,
        } = self;

        let controller = overrides
            .external_controller
            .clone()
            .or_else(|| config.general.external_controller.clone());
        let api_listener = match controller {
            Some(addr) => {
                let bind = resolve_bind_addr(&addr)
                    .await
                    .with_context(|| format!("Invalid API address {addr}"))?;
                let listener = TcpListener::bind(bind)
                    .await
                    .with_context(|| format!("Failed to bind API address {addr}"))?;
                info!(address = %listener.local_addr()?, "API server listening");
                Some(listener)
            }
            None => {
                info!("No API address specified");
                None
            }
        };

        hub.apply_config(config).await;

        let api = api_listener.map(|listener| {
            let app = api::create_router(AppState::new(Arc::clone(&hub)));
            let token = shutdown.clone();
            tokio::spawn(async move {
                axum::serve(listener, app)
                    .with_graceful_shutdown(async move { token.cancelled().await })
                    .await
            })
        });

        let reloader = tokio::spawn(reload_on_hangup(Arc::clone(&hub), shutdown.clone()));

        tokio::select! {
            _ = termination() => info!("Received shutdown signal"),
            _ = shutdown.cancelled() => {}
        }
        shutdown.cancel();

        if let Some(api) = api {
            match tokio::time::timeout(SHUTDOWN_TIMEOUT, api).await {
                Ok(Ok(Ok(()))) => info!("API server stopped"),
                Ok(Ok(Err(e))) => error!(error = %e, "API server error"),
                Ok(Err(e)) => error!(error = %e, "API server task panicked"),
                Err(_) => warn!("API server did not shut down in time"),
            }
        }

        hub.shutdown().await;

        if let Err(e) = reloader.await {
            warn!(error = %e, "Reload task panicked");
        }
        for (name, handle) in workers {
            if tokio::time::timeout(SHUTDOWN_TIMEOUT, handle).await.is_err() {
                warn!(worker = name, "Worker did not shut down in time");
            }
        }

        info!("Server stopped");
        Ok(())
    }
}

#[cfg(unix)]
async fn reload_on_hangup(hub: Arc<Hub>, shutdown: CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(hangup) => hangup,
        Err(e) => {
            warn!(error = %e, "SIGHUP handler not installed, reload disabled");
            return;
        }
    };

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            received = hangup.recv() => {
                if received.is_none() {
                    return;
                }
                let config = hub.config_path().display().to_string();
                info!(config = %config, "Reload config file");
                match hub.reload().await {
                    Ok(()) => info!(config = %config, "Reload config file succeeded"),
                    Err(e) => error!(config = %config, error = %e, "Reload config file failed"),
                }
            }
        }
    }
}

#[cfg(not(unix))]
async fn reload_on_hangup(_hub: Arc<Hub>, shutdown: CancellationToken) {
    shutdown.cancelled().await;
}

async fn termination() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler not installed");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
