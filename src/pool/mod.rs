//! Worker pool supervision (coordinator only).
//!
//! The [`Pool`] forks workers, relays their log records to the real sink and
//! classifies every exit:
//!
//! - exit after a coordinator-initiated disconnect: intentional, logged at `silly`
//! - any other exit: crash, logged at `error`
//!
//! Crashed workers are not replaced. The pool only ever shrinks.
//!
//! All mutation happens through `&mut Pool` on the coordinator's event loop.

use std::collections::HashMap;
use std::ffi::OsString;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::process::{Child, Command};
use tokio::task::{JoinHandle, JoinSet};
use tracing::Instrument;

mod channel;

pub use channel::WorkerChannel;

use crate::error::{Error, Result};
use crate::log::{Record, Sink};
use crate::role::{WORKER_ID_ENV, WorkerId};

/// How long relayed records may trail a worker's exit.
const RELAY_DRAIN_GRACE: Duration = Duration::from_secs(1);

/// Exit classification of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitClass {
    Alive,
    DisconnectedIntentionally,
    CrashedOrKilled,
}

/// A live worker, owned by the pool.
#[derive(Debug)]
pub struct WorkerHandle {
    id: WorkerId,
    pid: Option<u32>,
    channel: Option<OwnedWriteHalf>,
    disconnect_requested: bool,
    class: ExitClass,
}

impl WorkerHandle {
    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn class(&self) -> ExitClass {
        self.class
    }

    /// Half-close the channel so the worker starts its own shutdown.
    fn disconnect(&mut self) {
        self.disconnect_requested = true;
        self.channel = None;
    }

    /// Set the exit classification. Only the first call has any effect.
    fn classify(&mut self) -> ExitClass {
        if self.class == ExitClass::Alive {
            self.class = if self.disconnect_requested {
                ExitClass::DisconnectedIntentionally
            } else {
                ExitClass::CrashedOrKilled
            };
        }
        self.class
    }
}

/// OS-level exit notification for one worker.
#[derive(Debug)]
pub struct WorkerExit {
    pub id: WorkerId,
    pub status: std::io::Result<ExitStatus>,
}

impl WorkerExit {
    fn describe(&self, record: Record) -> Record {
        match &self.status {
            Ok(status) => {
                let record = record.with("code", status.code());
                match status.signal().and_then(signal_name) {
                    Some(name) => record.with("signal", name),
                    None => record,
                }
            },
            Err(e) => record
                .with("code", serde_json::Value::Null)
                .with("error", e.to_string()),
        }
    }
}

fn signal_name(signum: i32) -> Option<&'static str> {
    nix::sys::signal::Signal::try_from(signum)
        .ok()
        .map(|signal| signal.as_str())
}

/// How to launch a worker: the program and its arguments.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    program: PathBuf,
    args: Vec<OsString>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Re-execute the current binary with the current arguments.
    pub fn current() -> Result<Self> {
        let exe = std::env::current_exe()
            .map_err(|e| Error::io("resolving current executable", e))?;
        Ok(Self::new(exe).args(std::env::args_os().skip(1)))
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd
    }
}

/// The set of worker processes and their exit accounting.
pub struct Pool {
    sink: Arc<dyn Sink>,
    workers: HashMap<WorkerId, WorkerHandle>,
    exits: JoinSet<WorkerExit>,
    accepting: bool,
}

impl Pool {
    pub fn new(sink: Arc<dyn Sink>) -> Self {
        Self {
            sink,
            workers: HashMap::new(),
            exits: JoinSet::new(),
            accepting: true,
        }
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn worker(&self, id: WorkerId) -> Option<&WorkerHandle> {
        self.workers.get(&id)
    }

    /// Fork `count` workers. Every fork is attempted; failures are logged.
    ///
    /// Returns the number of workers forked.
    pub fn start(&mut self, count: usize, launcher: &WorkerCommand) -> usize {
        let mut forked = 0;
        for id in 0..count {
            match self.fork(id, launcher.command()) {
                Ok(()) => forked += 1,
                Err(e) => self.sink.error(
                    Record::new("cluster worker fork failed")
                        .with("worker", id)
                        .with("error", e.to_string()),
                ),
            }
        }
        forked
    }

    /// Fork one worker from a prepared command.
    ///
    /// # Errors
    ///
    /// Returns an error after [`Pool::disconnect`] or if the process cannot
    /// be spawned.
    pub fn fork(&mut self, id: WorkerId, mut command: Command) -> Result<()> {
        if !self.accepting {
            return Err(Error::Disconnecting { worker: id });
        }

        let channel = channel::pair()?;
        command
            .stdin(Stdio::from(channel.worker_end))
            .env(WORKER_ID_ENV, id.to_string());
        let child = command
            .spawn()
            .map_err(|source| Error::Spawn { worker: id, source })?;
        // Drops the parent's copy of the worker end.
        drop(command);

        let pid = child.id();
        self.workers.insert(
            id,
            WorkerHandle {
                id,
                pid,
                channel: Some(channel.writer),
                disconnect_requested: false,
                class: ExitClass::Alive,
            },
        );

        let span = tracing::info_span!("worker", id, pid);
        self.exits.spawn(
            observe(id, child, channel.reader, self.sink.clone()).instrument(span),
        );
        Ok(())
    }

    /// Next worker exit, or `None` once no worker is left.
    pub async fn next_exit(&mut self) -> Option<WorkerExit> {
        loop {
            match self.exits.join_next().await? {
                Ok(exit) => return Some(exit),
                Err(e) => tracing::debug!(error = %e, "worker observer aborted"),
            }
        }
    }

    /// Classify and log an exit, then forget the worker.
    pub fn record_exit(&mut self, exit: WorkerExit) -> ExitClass {
        let Some(mut handle) = self.workers.remove(&exit.id) else {
            return ExitClass::CrashedOrKilled;
        };

        let class = handle.classify();
        let record = exit.describe(
            Record::new(match class {
                ExitClass::DisconnectedIntentionally => "cluster worker exit",
                _ => "cluster worker crash",
            })
            .with("worker", handle.id)
            .with("pid", handle.pid),
        );
        match class {
            ExitClass::DisconnectedIntentionally => self.sink.silly(record),
            _ => self.sink.error(record),
        }
        class
    }

    /// Ask every worker to shut down and stop forking.
    pub fn disconnect(&mut self) {
        self.accepting = false;
        for handle in self.workers.values_mut() {
            handle.disconnect();
        }
        self.sink
            .silly(Record::new("cluster disconnect").with("workers", self.workers.len()));
    }

    /// Resolve once every worker's exit has been recorded.
    pub async fn drain(&mut self) {
        while let Some(exit) = self.next_exit().await {
            self.record_exit(exit);
        }
    }
}

/// Relay a worker's records and wait for its exit.
async fn observe(
    id: WorkerId,
    mut child: Child,
    reader: OwnedReadHalf,
    sink: Arc<dyn Sink>,
) -> WorkerExit {
    let relay = tokio::spawn(channel::relay_records(reader, sink).in_current_span());
    let status = child.wait().await;
    settle_relay(relay, RELAY_DRAIN_GRACE).await;
    WorkerExit { id, status }
}

/// Let records still in flight when the process died arrive, then cancel
/// the relay. A grandchild may hold the worker's socket open indefinitely.
///
/// Returns `false` if the relay had to be cancelled.
async fn settle_relay(mut relay: JoinHandle<()>, grace: Duration) -> bool {
    if tokio::time::timeout(grace, &mut relay).await.is_ok() {
        return true;
    }
    relay.abort();
    let _ = relay.await;
    false
}
