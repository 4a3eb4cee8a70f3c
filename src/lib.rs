//! clusterd - multi-process supervision with a graceful, bounded shutdown.
//!
//! One coordinator forks a pool of workers (the same binary, re-executed)
//! and supervises them. Every process, coordinator or worker, owns a
//! lifecycle manager that turns signals, panics and channel loss into a
//! single shutdown sequence bounded by [`SHUTDOWN_TIMEOUT`].
//!
//! # Architecture
//!
//! ```text
//!                 ┌──────────────── coordinator ────────────────┐
//!  SIGINT/SIGTERM │  Lifecycle ──► Pool ──► WorkerHandle × N     │
//!  fatal signals ─┤                  ▲                           │
//!  panics         │        relay ────┘   (records, one per line) │
//!                 └──────────┬───────────────────────────────────┘
//!                            │ socket pair as stdin
//!                 ┌──────────▼──────── worker ───────────────────┐
//!                 │  Lifecycle ──► app start / app shutdown      │
//!                 │  RelaySink ◄── tracing events                │
//!                 └──────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`cluster`]: role dispatch and the coordinator/worker event loops
//! - [`config`]: TOML + environment configuration
//! - [`lifecycle`]: shutdown state machine, signal and panic hooks
//! - [`log`]: record sinks and the worker log relay
//! - [`pool`]: worker forking, exit classification
//! - [`role`]: coordinator/worker detection

pub mod cluster;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod log;
pub mod pool;
pub mod role;

pub use cluster::{AppContext, Cluster};
pub use config::{ClusterConfig, LogFormat, PoolConfiguration};
pub use error::{Error, Result};
pub use lifecycle::{
    Fault, FatalSignal, Lifecycle, Outcome, SHUTDOWN_TIMEOUT, ShutdownState, Trigger,
};
pub use log::{Level, MemorySink, Record, RelaySink, Sink, TracingSink};
pub use pool::{ExitClass, Pool, WorkerChannel, WorkerCommand, WorkerHandle};
pub use role::{Role, WorkerId};
