//! Coordinator ↔ worker channel.
//!
//! Each worker gets one end of a Unix socket pair as its stdin. Frames flow
//! worker → coordinator only, one JSON record per line. The coordinator
//! disconnects a worker by half-closing its write side; the worker sees EOF.

use std::io::Read;
use std::os::fd::{AsFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc::UnboundedSender;

use crate::error::{Error, Result};
use crate::lifecycle::Trigger;
use crate::log::{RelaySink, Sink, decode_frame, emit};

/// Coordinator side of a fresh channel, plus the descriptor handed to the worker.
pub(crate) struct Pair {
    pub reader: OwnedReadHalf,
    pub writer: OwnedWriteHalf,
    pub worker_end: OwnedFd,
}

/// Create a channel for one worker. Must be called from within a tokio runtime.
pub(crate) fn pair() -> Result<Pair> {
    let (coordinator_end, worker_end) =
        UnixStream::pair().map_err(|e| Error::io("creating worker channel", e))?;
    coordinator_end
        .set_nonblocking(true)
        .map_err(|e| Error::io("configuring worker channel", e))?;
    let stream = tokio::net::UnixStream::from_std(coordinator_end)
        .map_err(|e| Error::io("registering worker channel", e))?;
    let (reader, writer) = stream.into_split();

    Ok(Pair {
        reader,
        writer,
        worker_end: worker_end.into(),
    })
}

/// Re-emit every record a worker sends until its side closes.
///
/// Unrecognised levels are dropped without a sink call.
pub(crate) async fn relay_records(reader: OwnedReadHalf, sink: Arc<dyn Sink>) {
    let mut lines = BufReader::new(reader).lines();

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match decode_frame(&line) {
                Ok(Some((level, record))) => emit(&*sink, level, record),
                Ok(None) => {},
                Err(e) => tracing::debug!(error = %e, "dropping malformed worker frame"),
            },
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(error = %e, "worker channel read failed");
                break;
            },
        }
    }
}

/// Worker side of the channel, inherited as stdin.
#[derive(Debug)]
pub struct WorkerChannel {
    stream: UnixStream,
}

impl WorkerChannel {
    /// Adopt stdin as the coordinator channel.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Channel`] if stdin is not a socket, which means the
    /// process was not forked by a coordinator.
    pub fn from_stdin() -> Result<Self> {
        let fd = std::io::stdin()
            .as_fd()
            .try_clone_to_owned()
            .map_err(|e| Error::io("duplicating stdin", e))?;
        let stream = UnixStream::from(fd);
        stream
            .local_addr()
            .map_err(|e| Error::Channel(format!("stdin is not a coordinator socket: {e}")))?;

        Ok(Self { stream })
    }

    /// Sink that relays records to the coordinator.
    pub fn relay(&self) -> Result<RelaySink> {
        let writer = self
            .stream
            .try_clone()
            .map_err(|e| Error::io("cloning coordinator channel", e))?;
        Ok(RelaySink::new(writer))
    }

    /// Report [`Trigger::Disconnect`] once the coordinator closes its side.
    ///
    /// Reads block, so this runs on a dedicated thread.
    pub fn watch_disconnect(self, triggers: UnboundedSender<Trigger>) -> Result<()> {
        let mut stream = self.stream;

        std::thread::Builder::new()
            .name("coordinator-channel".to_string())
            .spawn(move || {
                let mut buf = [0u8; 64];
                loop {
                    match stream.read(&mut buf) {
                        Ok(0) => break,
                        Ok(_) => {},
                        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {},
                        Err(_) => break,
                    }
                }
                let _ = triggers.send(Trigger::Disconnect);
            })
            .map_err(|e| Error::io("spawning channel watcher", e))?;

        Ok(())
    }

    #[cfg(test)]
    fn from_stream(stream: UnixStream) -> Self {
        Self { stream }
    }
}
