//! Entry point tying role detection, the lifecycle and the pool together.
//!
//! The same binary runs on both sides. [`Cluster::run`] detects the role:
//!
//! - coordinator: forks the pool, supervises it, and disconnects it on shutdown
//! - worker: runs the application payload until a trigger arrives, then runs
//!   the application's teardown
//!
//! # Example
//!
//! ```no_run
//! use clusterd::{AppContext, Cluster};
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let code = Cluster::load(None)?
//!     .run(
//!         |ctx: AppContext| async move {
//!             tracing::info!(worker = ctx.worker, "serving");
//!             Ok(())
//!         },
//!         || async { Ok(()) },
//!     )
//!     .await?;
//! std::process::exit(code);
//! # }
//! ```

use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use crate::config::{ClusterConfig, LogFormat};
use crate::error::Result;
use crate::lifecycle::{Fault, Lifecycle, Outcome, Trigger};
use crate::log::{Sink, TracingSink, init_coordinator_logging, init_worker_logging};
use crate::pool::{Pool, WorkerChannel, WorkerCommand, WorkerExit};
use crate::role::{Role, WorkerId};

/// What the application payload receives in a worker.
#[derive(Clone)]
pub struct AppContext {
    /// Index of this worker within the pool.
    pub worker: WorkerId,
    /// Sink relaying records to the coordinator.
    pub sink: Arc<dyn Sink>,
}

impl std::fmt::Debug for AppContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppContext")
            .field("worker", &self.worker)
            .finish_non_exhaustive()
    }
}

/// Resolved settings plus any warnings produced while resolving them.
#[derive(Debug, Clone, Default)]
pub struct Cluster {
    config: ClusterConfig,
    warnings: Vec<String>,
}

enum Event {
    Trigger(Trigger),
    Exit(Option<WorkerExit>),
}

impl Cluster {
    pub fn new(config: ClusterConfig) -> Self {
        Self {
            config,
            warnings: Vec::new(),
        }
    }

    /// Load settings from an optional TOML file, then apply environment
    /// overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if `path` is given but cannot be read or parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => ClusterConfig::load_from(path)?,
            None => ClusterConfig::default(),
        };
        let validation = config.apply_env();

        Ok(Self {
            config,
            warnings: validation.warnings,
        })
    }

    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.config.max_workers = Some(workers);
        self
    }

    #[must_use]
    pub fn with_log_format(mut self, format: LogFormat) -> Self {
        self.config.log_format = format;
        self
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    /// Run this process in its detected role and return its exit code.
    ///
    /// `start_app` and `shutdown_app` only run in workers. An error from
    /// `start_app` is treated as an uncaught fault.
    ///
    /// # Errors
    ///
    /// Returns an error if the process cannot be set up: signal handlers,
    /// the coordinator channel, or the worker executable.
    pub async fn run<S, SF, T, TF>(self, start_app: S, shutdown_app: T) -> Result<i32>
    where
        S: FnOnce(AppContext) -> SF + Send + 'static,
        SF: Future<Output = anyhow::Result<()>> + Send + 'static,
        T: FnOnce() -> TF,
        TF: Future<Output = anyhow::Result<()>>,
    {
        match Role::detect() {
            (Role::Worker, Some(worker)) => self.serve(worker, start_app, shutdown_app).await,
            _ => self.coordinate().await,
        }
    }

    async fn coordinate(self) -> Result<i32> {
        init_coordinator_logging(self.config.log_format);
        for warning in &self.warnings {
            tracing::warn!("{warning}");
        }

        let sink: Arc<dyn Sink> = Arc::new(TracingSink);
        let mut lifecycle = Lifecycle::new(Role::Coordinator, sink.clone());
        lifecycle.install(self.config.env_name())?;

        let mut pool = Pool::new(sink);
        let requested = self.config.pool().effective_workers();
        let forked = pool.start(requested, &WorkerCommand::current()?);
        tracing::debug!(requested, forked, "worker pool started");

        loop {
            let event = tokio::select! {
                trigger = lifecycle.next_trigger() => Event::Trigger(trigger),
                exit = pool.next_exit() => Event::Exit(exit),
            };

            match event {
                Event::Trigger(trigger) => {
                    if lifecycle.begin(&trigger) {
                        break;
                    }
                },
                Event::Exit(Some(exit)) => {
                    pool.record_exit(exit);
                },
                // Every worker is gone and nothing asked us to stop.
                Event::Exit(None) => return Ok(lifecycle.finish(Outcome::Completed)),
            }
        }

        let outcome = lifecycle
            .shutdown(async {
                pool.disconnect();
                anyhow::Ok(())
            })
            .await;
        let outcome = match outcome {
            Outcome::Completed => lifecycle.settle(pool.drain()).await,
            Outcome::TimedOut => Outcome::TimedOut,
        };

        Ok(lifecycle.finish(outcome))
    }

    async fn serve<S, SF, T, TF>(
        self,
        worker: WorkerId,
        start_app: S,
        shutdown_app: T,
    ) -> Result<i32>
    where
        S: FnOnce(AppContext) -> SF + Send + 'static,
        SF: Future<Output = anyhow::Result<()>> + Send + 'static,
        T: FnOnce() -> TF,
        TF: Future<Output = anyhow::Result<()>>,
    {
        let channel = WorkerChannel::from_stdin()?;
        let relay = Arc::new(channel.relay()?);
        init_worker_logging(relay.clone());
        let sink: Arc<dyn Sink> = relay;

        let mut lifecycle = Lifecycle::new(Role::Worker, sink.clone());
        lifecycle.install(self.config.env_name())?;
        channel.watch_disconnect(lifecycle.trigger_sender())?;

        let faults = lifecycle.trigger_sender();
        let context = AppContext { worker, sink };
        tokio::spawn(async move {
            if let Err(e) = start_app(context).await {
                let _ = faults.send(Trigger::Fault(Fault::from_error("start", &e)));
            }
        });

        lifecycle.wait_for_shutdown().await;
        let outcome = lifecycle.shutdown(shutdown_app()).await;

        Ok(lifecycle.finish(outcome))
    }
}
