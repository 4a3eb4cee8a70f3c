//! Process role detection.
//!
//! The coordinator re-executes itself for every worker and marks the child
//! with [`WORKER_ID_ENV`]. Everything else in the crate receives the
//! [`Role`] explicitly instead of querying the environment again.

use std::fmt;

/// Environment variable carrying the worker index in forked workers.
pub const WORKER_ID_ENV: &str = "CLUSTER_WORKER_ID";

/// Index of a worker within the pool, assigned at fork time.
pub type WorkerId = usize;

/// Which side of the pool this process is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The single process that forks and supervises the pool.
    Coordinator,
    /// A forked process running the application payload.
    Worker,
}

impl Role {
    /// Detect the role of the current process.
    ///
    /// Returns the worker index alongside [`Role::Worker`].
    pub fn detect() -> (Self, Option<WorkerId>) {
        Self::from_env_value(std::env::var(WORKER_ID_ENV).ok().as_deref())
    }

    fn from_env_value(value: Option<&str>) -> (Self, Option<WorkerId>) {
        match value.and_then(|v| v.trim().parse::<WorkerId>().ok()) {
            Some(id) => (Self::Worker, Some(id)),
            None => (Self::Coordinator, None),
        }
    }

    /// Human readable process name used in lifecycle records.
    pub fn process_name(self) -> &'static str {
        match self {
            Self::Coordinator => "process",
            Self::Worker => "worker process",
        }
    }

    pub fn is_coordinator(self) -> bool {
        self == Self::Coordinator
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Coordinator => f.write_str("coordinator"),
            Self::Worker => f.write_str("worker"),
        }
    }
}
