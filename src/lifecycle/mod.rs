//! Per-process lifecycle state machine.
//!
//! Every process, coordinator and worker alike, owns one [`Lifecycle`]. It
//! has two states:
//!
//! ```text
//! Running ──(first trigger)──► ShuttingDown ──► exit
//!    │                              │
//!    │  SIGINT / SIGTERM            ├─ teardown resolves first ─► natural exit (0)
//!    │  SIGILL / SIGBUS / SIGFPE /  └─ deadline fires first ───► forced exit (1)
//!    │  SIGSEGV / panic / app error
//!    │  channel disconnect (worker)
//! ```
//!
//! Triggers are funnelled through one queue and consumed on the event loop.
//! The Running → ShuttingDown transition is guarded by [`ShutdownState`], so
//! any further trigger is a no-op apart from its log record.
//!
//! ## Module Structure
//!
//! - [`trigger`]: trigger taxonomy
//! - [`host`]: host facts for the coordinator's start record
//! - `signals`: signal and panic hooks

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::Instant;

pub mod host;
mod signals;
pub mod trigger;

pub use host::HostInfo;
pub use trigger::{Fault, FatalSignal, Trigger};

use crate::error::Result;
use crate::log::{Record, Sink};
use crate::role::Role;

/// Upper bound on teardown before the process is forcibly terminated.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(20);

/// Exit code after a clean shutdown.
pub const EXIT_OK: i32 = 0;
/// Exit code after the shutdown deadline elapsed.
pub const EXIT_TIMEOUT: i32 = 1;

/// Process-wide shutdown flag and deadline.
#[derive(Debug, Default)]
pub struct ShutdownState {
    started: AtomicBool,
    deadline: OnceLock<Instant>,
}

impl ShutdownState {
    pub fn has_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Deadline armed when shutdown began.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline.get().copied()
    }

    /// Flip to started and arm the deadline.
    ///
    /// Returns `None` if shutdown had already begun.
    pub fn begin(&self, timeout: Duration) -> Option<Instant> {
        if self
            .started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }

        let deadline = Instant::now() + timeout;
        let _ = self.deadline.set(deadline);
        Some(deadline)
    }
}

/// How the shutdown sequence ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Teardown (and any natural exit work) finished before the deadline.
    Completed,
    /// The deadline fired first.
    TimedOut,
}

impl Outcome {
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Completed => EXIT_OK,
            Self::TimedOut => EXIT_TIMEOUT,
        }
    }
}

/// Logging and the transition guard, split from the trigger queue so the
/// queue can be polled while the guard is in use.
struct Guard {
    role: Role,
    sink: Arc<dyn Sink>,
    state: ShutdownState,
    timeout: Duration,
}

impl Guard {
    /// Role-appropriate informational severity.
    fn notice(&self, record: Record) {
        match self.role {
            Role::Coordinator => self.sink.info(record),
            Role::Worker => self.sink.silly(record),
        }
    }

    fn record(&self, what: impl std::fmt::Display) -> Record {
        Record::new(format!("{} {what}", self.role.process_name()))
    }

    fn begin(&self, trigger: &Trigger) -> bool {
        match trigger {
            Trigger::Interrupt | Trigger::Terminate => {
                if self.state.has_started() {
                    return false;
                }
                self.notice(self.record(trigger));
            },
            Trigger::Disconnect => {
                self.sink.silly(Record::new("cluster worker disconnect"));
            },
            Trigger::FatalSignal(_) => {
                self.sink.error(self.record(trigger));
            },
            Trigger::Fault(fault) => {
                let mut record = self
                    .record(trigger)
                    .with("errorName", fault.origin)
                    .with("error", fault.message.as_str());
                if let Some(location) = &fault.location {
                    record = record.with("location", location.as_str());
                }
                self.sink.error(record);
            },
        }

        self.state.begin(self.timeout).is_some()
    }
}

/// The lifecycle manager of one process.
pub struct Lifecycle {
    guard: Guard,
    sender: UnboundedSender<Trigger>,
    triggers: UnboundedReceiver<Trigger>,
}

impl Lifecycle {
    pub fn new(role: Role, sink: Arc<dyn Sink>) -> Self {
        let (sender, triggers) = mpsc::unbounded_channel();
        Self {
            guard: Guard {
                role,
                sink,
                state: ShutdownState::default(),
                timeout: SHUTDOWN_TIMEOUT,
            },
            sender,
            triggers,
        }
    }

    pub fn role(&self) -> Role {
        self.guard.role
    }

    pub fn state(&self) -> &ShutdownState {
        &self.guard.state
    }

    /// Queue handle for trigger sources outside this module.
    pub fn trigger_sender(&self) -> UnboundedSender<Trigger> {
        self.sender.clone()
    }

    /// Emit the start record and install signal and panic hooks.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if a signal handler cannot be registered.
    pub fn install(&self, env_name: &str) -> Result<()> {
        self.log_start(env_name);

        signals::watch_termination(self.sender.clone())?;
        signals::watch_fatal(self.sender.clone())?;
        signals::install_panic_hook(self.sender.clone());

        Ok(())
    }

    /// Emit the start record. Only the coordinator describes the host.
    pub fn log_start(&self, env_name: &str) {
        let record = self.guard.record("start");
        match self.guard.role {
            Role::Coordinator => self.guard.notice(HostInfo::collect(env_name).describe(record)),
            Role::Worker => self.guard.notice(record),
        }
    }

    /// Next trigger from any source.
    pub async fn next_trigger(&mut self) -> Trigger {
        match self.triggers.recv().await {
            Some(trigger) => trigger,
            // `self.sender` keeps the queue open.
            None => std::future::pending().await,
        }
    }

    /// Log `trigger` and attempt the Running → ShuttingDown transition.
    ///
    /// Returns `true` only for the trigger that started shutdown.
    pub fn begin(&self, trigger: &Trigger) -> bool {
        self.guard.begin(trigger)
    }

    /// Consume triggers until one starts shutdown.
    pub async fn wait_for_shutdown(&mut self) -> Trigger {
        loop {
            let trigger = self.next_trigger().await;
            if self.begin(&trigger) {
                return trigger;
            }
        }
    }

    /// Run the teardown callback against the shutdown deadline.
    ///
    /// A teardown error or panic is reported as an uncaught fault; the
    /// transition guard keeps it from re-running anything.
    pub async fn shutdown<F>(&mut self, teardown: F) -> Outcome
    where
        F: Future<Output = anyhow::Result<()>>,
    {
        match self.race(AssertUnwindSafe(teardown).catch_unwind()).await {
            Some(Ok(Ok(()))) => Outcome::Completed,
            Some(Ok(Err(error))) => {
                self.begin(&Trigger::Fault(Fault::from_error("teardown", &error)));
                Outcome::Completed
            },
            Some(Err(payload)) => {
                self.begin(&Trigger::Fault(Fault::from_payload("teardown", &*payload)));
                Outcome::Completed
            },
            None => Outcome::TimedOut,
        }
    }

    /// Bound natural-exit work by the same deadline as teardown.
    pub async fn settle<F>(&mut self, work: F) -> Outcome
    where
        F: Future<Output = ()>,
    {
        match self.race(work).await {
            Some(()) => Outcome::Completed,
            None => Outcome::TimedOut,
        }
    }

    /// Log the end of the process and return its exit code.
    ///
    /// The forced path only reports the timeout.
    pub fn finish(&self, outcome: Outcome) -> i32 {
        let code = outcome.exit_code();
        match outcome {
            Outcome::Completed => self.log_exit(code),
            Outcome::TimedOut => self.guard.sink.error(Record::new("shutdown timeout")),
        }
        code
    }

    /// Exit record: error severity for non-zero codes.
    pub fn log_exit(&self, code: i32) {
        let record = self.guard.record("exit").with("code", code);
        if code == EXIT_OK {
            self.guard.notice(record);
        } else {
            self.guard.sink.error(record);
        }
    }

    /// First to finish wins: `work` or the deadline. Triggers arriving in
    /// the meantime are logged and otherwise ignored.
    async fn race<F>(&mut self, work: F) -> Option<F::Output>
    where
        F: Future,
    {
        let deadline = self
            .guard
            .state
            .deadline()
            .unwrap_or_else(|| Instant::now() + self.guard.timeout);

        let expired = tokio::time::sleep_until(deadline);
        tokio::pin!(work);
        tokio::pin!(expired);

        loop {
            tokio::select! {
                biased;
                output = &mut work => return Some(output),
                () = &mut expired => return None,
                Some(trigger) = self.triggers.recv() => {
                    self.guard.begin(&trigger);
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use serde_json::json;

    use super::*;
    use crate::log::{Level, MemorySink};

    fn lifecycle(role: Role) -> (Lifecycle, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new());
        (Lifecycle::new(role, sink.clone()), sink)
    }

    // =========================================================================
    // ShutdownState
    // =========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_state_begins_once() {
        let state = ShutdownState::default();
        assert!(!state.has_started());
        assert_eq!(state.deadline(), None);

        let deadline = state.begin(SHUTDOWN_TIMEOUT).expect("first begin");
        assert!(state.has_started());
        assert_eq!(state.deadline(), Some(deadline));
        assert_eq!(deadline - Instant::now(), SHUTDOWN_TIMEOUT);

        assert_eq!(state.begin(SHUTDOWN_TIMEOUT), None);
        assert_eq!(state.deadline(), Some(deadline));
    }

    // =========================================================================
    // Transition guard
    // =========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_repeated_sigint_runs_teardown_once() {
        let (mut lifecycle, sink) = lifecycle(Role::Coordinator);
        let runs = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            if lifecycle.begin(&Trigger::Interrupt) {
                let runs = runs.clone();
                let outcome = lifecycle
                    .shutdown(async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .await;
                assert_eq!(outcome, Outcome::Completed);
            }
        }

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        // The second SIGINT is not even logged.
        let logged = sink.with_message("process SIGINT");
        assert_eq!(logged.len(), 1);
        assert_eq!(logged[0].0, Level::Info);
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_logs_signals_at_silly() {
        let (lifecycle, sink) = lifecycle(Role::Worker);
        assert!(lifecycle.begin(&Trigger::Terminate));

        let logged = sink.with_message("worker process SIGTERM");
        assert_eq!(logged.len(), 1);
        assert_eq!(logged[0].0, Level::Silly);
    }

    #[tokio::test(start_paused = true)]
    async fn test_faults_are_logged_even_after_shutdown_began() {
        let (lifecycle, sink) = lifecycle(Role::Coordinator);
        assert!(lifecycle.begin(&Trigger::Terminate));
        assert!(!lifecycle.begin(&Trigger::FatalSignal(FatalSignal::SegmentationViolation)));
        assert!(!lifecycle.begin(&Trigger::Fault(Fault::new("panic", "boom"))));

        let segv = sink.with_message("process SIGSEGV");
        assert_eq!(segv.len(), 1);
        assert_eq!(segv[0].0, Level::Error);

        let fault = sink.with_message("process uncaughtException");
        assert_eq!(fault.len(), 1);
        assert_eq!(fault[0].0, Level::Error);
        assert_eq!(fault[0].1.field("error"), Some(&json!("boom")));
        assert_eq!(fault[0].1.field("errorName"), Some(&json!("panic")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_starts_worker_shutdown() {
        let (mut lifecycle, sink) = lifecycle(Role::Worker);
        lifecycle.trigger_sender().send(Trigger::Disconnect).unwrap();

        let trigger = lifecycle.wait_for_shutdown().await;
        assert_eq!(trigger, Trigger::Disconnect);
        assert!(lifecycle.state().has_started());
        assert_eq!(sink.with_message("cluster worker disconnect")[0].0, Level::Silly);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_shutdown_skips_late_triggers() {
        let (mut lifecycle, _sink) = lifecycle(Role::Coordinator);
        let sender = lifecycle.trigger_sender();
        sender.send(Trigger::Interrupt).unwrap();
        sender.send(Trigger::Interrupt).unwrap();

        assert_eq!(lifecycle.wait_for_shutdown().await, Trigger::Interrupt);

        // The queued duplicate is absorbed while teardown runs.
        let outcome = lifecycle.shutdown(async { Ok(()) }).await;
        assert_eq!(outcome, Outcome::Completed);
    }

    // =========================================================================
    // Timeout race
    // =========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_teardown_before_deadline_completes() {
        let (mut lifecycle, sink) = lifecycle(Role::Coordinator);
        assert!(lifecycle.begin(&Trigger::Terminate));

        let outcome = lifecycle
            .shutdown(async {
                tokio::time::sleep(Duration::from_secs(19)).await;
                Ok(())
            })
            .await;

        assert_eq!(outcome, Outcome::Completed);
        assert_eq!(lifecycle.finish(outcome), EXIT_OK);
        assert!(sink.with_message("shutdown timeout").is_empty());

        let exit = sink.with_message("process exit");
        assert_eq!(exit.len(), 1);
        assert_eq!(exit[0].0, Level::Info);
        assert_eq!(exit[0].1.field("code"), Some(&json!(0)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_teardown_times_out_at_deadline() {
        let (mut lifecycle, sink) = lifecycle(Role::Worker);
        let started = Instant::now();
        assert!(lifecycle.begin(&Trigger::Terminate));

        let outcome = lifecycle.shutdown(std::future::pending()).await;

        assert_eq!(outcome, Outcome::TimedOut);
        assert_eq!(started.elapsed(), SHUTDOWN_TIMEOUT);
        assert_eq!(lifecycle.finish(outcome), EXIT_TIMEOUT);

        let timeout = sink.with_message("shutdown timeout");
        assert_eq!(timeout.len(), 1);
        assert_eq!(timeout[0].0, Level::Error);
        // Forced exit does not produce a regular exit record.
        assert!(sink.with_message("worker process exit").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_error_is_reported_as_fault() {
        let (mut lifecycle, sink) = lifecycle(Role::Coordinator);
        assert!(lifecycle.begin(&Trigger::Terminate));

        let outcome = lifecycle
            .shutdown(async { Err(anyhow::anyhow!("listener stuck")) })
            .await;

        assert_eq!(outcome, Outcome::Completed);
        let fault = sink.with_message("process uncaughtException");
        assert_eq!(fault.len(), 1);
        assert_eq!(fault[0].1.field("errorName"), Some(&json!("teardown")));
        assert_eq!(fault[0].1.field("error"), Some(&json!("listener stuck")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_panic_is_reported_as_fault() {
        let (mut lifecycle, sink) = lifecycle(Role::Worker);
        assert!(lifecycle.begin(&Trigger::Terminate));

        let outcome = lifecycle
            .shutdown(async { panic!("teardown blew up") })
            .await;

        assert_eq!(outcome, Outcome::Completed);
        assert_eq!(lifecycle.finish(outcome), EXIT_OK);

        let fault = sink.with_message("worker process uncaughtException");
        assert_eq!(fault.len(), 1);
        assert_eq!(fault[0].0, Level::Error);
        assert_eq!(fault[0].1.field("errorName"), Some(&json!("teardown")));
        assert_eq!(fault[0].1.field("error"), Some(&json!("teardown blew up")));
        assert_eq!(sink.with_message("worker process exit").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_settle_shares_the_teardown_deadline() {
        let (mut lifecycle, _sink) = lifecycle(Role::Coordinator);
        let started = Instant::now();
        assert!(lifecycle.begin(&Trigger::Interrupt));

        let outcome = lifecycle
            .shutdown(async {
                tokio::time::sleep(Duration::from_secs(15)).await;
                Ok(())
            })
            .await;
        assert_eq!(outcome, Outcome::Completed);

        let outcome = lifecycle
            .settle(tokio::time::sleep(Duration::from_secs(10)))
            .await;
        assert_eq!(outcome, Outcome::TimedOut);
        assert_eq!(started.elapsed(), SHUTDOWN_TIMEOUT);
    }

    // =========================================================================
    // Start and exit records
    // =========================================================================

    #[tokio::test]
    async fn test_coordinator_start_describes_host() {
        let (lifecycle, sink) = lifecycle(Role::Coordinator);
        lifecycle.log_start("staging");

        let start = sink.with_message("process start");
        assert_eq!(start.len(), 1);
        assert_eq!(start[0].0, Level::Info);
        assert_eq!(start[0].1.field("env"), Some(&json!("staging")));
        assert!(start[0].1.field("cpus").is_some());
        assert!(start[0].1.field("mem").is_some());
        assert!(start[0].1.field("version").is_some());
    }

    #[tokio::test]
    async fn test_worker_start_is_bare() {
        let (lifecycle, sink) = lifecycle(Role::Worker);
        lifecycle.log_start("staging");

        let start = sink.with_message("worker process start");
        assert_eq!(start.len(), 1);
        assert_eq!(start[0].0, Level::Silly);
        assert!(start[0].1.fields.is_empty());
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_an_error() {
        let (lifecycle, sink) = lifecycle(Role::Worker);
        lifecycle.log_exit(3);

        let exit = sink.with_message("worker process exit");
        assert_eq!(exit[0].0, Level::Error);
        assert_eq!(exit[0].1.field("code"), Some(&json!(3)));
    }
}
