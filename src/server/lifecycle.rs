//! Process lifecycle: `Running -> Draining -> Stopped`.
//!
//! The lifecycle owns the recurring rate-limit sweep and sequences shutdown:
//! once a termination signal arrives the server stops accepting work, the
//! in-flight requests finish, external resources are released, and the
//! whole sequence races a hard deadline.

use crate::core::cache::KeyValueCollection;
use crate::core::config::AppConfig;
use crate::rate_limit::RateLimitStore;
use anyhow::{Context, Result};
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Running,
    Draining,
    Stopped,
}

impl Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                LifecycleState::Running => "running",
                LifecycleState::Draining => "draining",
                LifecycleState::Stopped => "stopped",
            }
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Drain and resource release finished before the deadline.
    Clean,
    /// The deadline fired first.
    Forced,
}

impl ShutdownOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            ShutdownOutcome::Clean => 0,
            ShutdownOutcome::Forced => 1,
        }
    }
}

/// The graceful shutdown sequence did not finish within its deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownForced {
    pub deadline: Duration,
}

impl Display for ShutdownForced {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "graceful shutdown did not complete within {:?}",
            self.deadline
        )
    }
}

impl std::error::Error for ShutdownForced {}

/// Runs `drain` against a deadline. Whichever side loses is dropped, so
/// neither the drain nor the timer outlives this call.
pub async fn drain_within<F: Future>(
    drain: F,
    deadline: Duration,
) -> Result<F::Output, ShutdownForced> {
    tokio::time::timeout(deadline, drain)
        .await
        .map_err(|_| ShutdownForced { deadline })
}

/// Background task that periodically sweeps stale rate-limit entries and,
/// when given a cache, purges its expired entries on the same tick.
pub struct SweepHandle {
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl SweepHandle {
    pub fn spawn(
        store: Arc<RateLimitStore>,
        cache: Option<Arc<dyn KeyValueCollection>>,
        interval: Duration,
    ) -> Self {
        let (stop_tx, mut stop_rx) = oneshot::channel();
        let period = interval.max(Duration::from_millis(1));

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {
                        let removed = store.sweep(store.clock().now());
                        debug!(removed, remaining = store.len(), "Rate limit sweep");
                        if let Some(cache) = &cache {
                            let purged = cache.purge_expired().await;
                            debug!(purged, "Cache purge");
                        }
                    }
                }
            }
        });

        Self {
            stop: Some(stop_tx),
            task,
        }
    }

    /// Stops the sweep and waits for the task to exit.
    pub async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Err(e) = (&mut self.task).await {
            warn!("Sweep task ended abnormally: {}", e);
        }
    }
}

impl Drop for SweepHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub struct ServerLifecycle {
    state: watch::Sender<LifecycleState>,
    limiter: Arc<RateLimitStore>,
    cache: Option<Arc<dyn KeyValueCollection>>,
    sweep_interval: Duration,
    shutdown_timeout: Duration,
}

impl ServerLifecycle {
    pub fn new(
        limiter: Arc<RateLimitStore>,
        sweep_interval: Duration,
        shutdown_timeout: Duration,
    ) -> Self {
        let (state, _) = watch::channel(LifecycleState::Running);
        Self {
            state,
            limiter,
            cache: None,
            sweep_interval,
            shutdown_timeout,
        }
    }

    pub fn from_config(config: &AppConfig, limiter: Arc<RateLimitStore>) -> Self {
        Self::new(
            limiter,
            config.rate_limit.sweep_interval(),
            config.server.shutdown_timeout(),
        )
    }

    /// Also purges expired entries from `cache` on every sweep.
    pub fn with_cache(mut self, cache: Arc<dyn KeyValueCollection>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    /// Resolves once the lifecycle has left `Running`. Hand this to the
    /// listener as its graceful-shutdown trigger.
    pub fn draining(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut rx = self.state.subscribe();
        async move {
            let _ = rx.wait_for(|s| *s != LifecycleState::Running).await;
        }
    }

    /// Moves `Running -> Draining`. Returns false if already past `Running`.
    pub fn begin_drain(&self) -> bool {
        let moved = self.state.send_if_modified(|s| {
            if *s == LifecycleState::Running {
                *s = LifecycleState::Draining;
                true
            } else {
                false
            }
        });
        if moved {
            info!("Draining: no longer accepting new work");
        }
        moved
    }

    /// Drives the process lifecycle.
    ///
    /// `server` should stop accepting connections once [`Self::draining`]
    /// resolves and return after in-flight requests complete. `signal`
    /// resolves on a termination request. `release` frees external
    /// resources and only starts after the server has drained.
    pub async fn run<Srv, Sig, Rel>(
        &self,
        server: Srv,
        signal: Sig,
        release: Rel,
    ) -> Result<ShutdownOutcome>
    where
        Srv: Future<Output = Result<()>> + Send + 'static,
        Sig: Future<Output = ()>,
        Rel: Future<Output = ()>,
    {
        let sweep = SweepHandle::spawn(
            Arc::clone(&self.limiter),
            self.cache.clone(),
            self.sweep_interval,
        );
        info!("Running");

        let mut server = tokio::spawn(server);
        let abort = server.abort_handle();
        let early = tokio::select! {
            _ = signal => None,
            joined = &mut server => {
                warn!("Server stopped before a termination signal");
                Some(joined)
            }
        };

        self.begin_drain();

        let graceful = async move {
            let joined = match early {
                Some(joined) => joined,
                None => server.await,
            };
            debug!("Server drained, releasing resources");
            release.await;
            joined.context("Server task panicked")?
        };

        let outcome = match drain_within(graceful, self.shutdown_timeout).await {
            Ok(served) => served.map(|_| ShutdownOutcome::Clean),
            Err(forced) => {
                error!("{}; forcing exit", forced);
                abort.abort();
                Ok(ShutdownOutcome::Forced)
            }
        };

        sweep.stop().await;
        self.state.send_replace(LifecycleState::Stopped);
        info!("Stopped");
        outcome
    }
}

/// Resolves on SIGINT or SIGTERM, logging which one arrived.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!(signal = "SIGINT", "Received termination signal"),
            Err(e) => {
                error!("Failed to listen for SIGINT: {}", e);
                std::future::pending::<()>().await
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                info!(signal = "SIGTERM", "Received termination signal");
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
