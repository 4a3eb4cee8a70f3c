//! Error types for cluster supervision.
//!
//! Library operations return [`Result`]; the binary wraps these in
//! `anyhow` at the edge.

/// Result type for cluster operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Cluster errors with structured context.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration could not be loaded or is invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error with context.
    #[error("IO error in {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// A worker process could not be forked.
    #[error("failed to spawn worker {worker}: {source}")]
    Spawn {
        worker: usize,
        #[source]
        source: std::io::Error,
    },

    /// The pool was asked to fork after teardown began.
    #[error("worker {worker} not forked: pool is disconnecting")]
    Disconnecting { worker: usize },

    /// The coordinator channel is missing or unusable.
    #[error("coordinator channel unavailable: {0}")]
    Channel(String),

    /// An OS signal handler could not be installed.
    #[error("failed to install handler for {signal}: {reason}")]
    Signal { signal: &'static str, reason: String },
}

impl Error {
    /// Create an IO error with context.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a signal installation error.
    pub fn signal(signal: &'static str, reason: impl ToString) -> Self {
        Self::Signal {
            signal,
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spawn_error_display() {
        let err = Error::Spawn {
            worker: 3,
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
        };
        assert_eq!(err.to_string(), "failed to spawn worker 3: no such file");
    }

    #[test]
    fn test_io_error_keeps_source() {
        use std::error::Error as _;

        let err = Error::io(
            "reading config",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        assert!(err.to_string().starts_with("IO error in reading config"));
        assert!(err.source().is_some());
    }

    #[test]
    fn test_signal_error_display() {
        let err = Error::signal("SIGTERM", "registry closed");
        assert_eq!(
            err.to_string(),
            "failed to install handler for SIGTERM: registry closed"
        );
    }
}
