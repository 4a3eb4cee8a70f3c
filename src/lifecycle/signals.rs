//! OS signal and panic hooks.
//!
//! Every hook only forwards a [`Trigger`] into the lifecycle's queue; the
//! shutdown decision is made on the event loop.
//!
//! ## Signals
//! - `SIGINT`, `SIGTERM`: watched with [`tokio::signal::unix`]
//! - `SIGILL`, `SIGBUS`, `SIGFPE`, `SIGSEGV`: the signal registry behind
//!   tokio refuses some of these, so they get a one-shot `sigaction` handler
//!   that writes the signal number into a self-pipe. The handler resets to
//!   the default disposition on delivery, so a genuine hardware fault still
//!   terminates the process when the faulting instruction re-executes.

use std::io::Read;
use std::os::fd::IntoRawFd;
use std::sync::atomic::{AtomicI32, Ordering};

use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc::UnboundedSender;

use super::trigger::{Fault, FatalSignal, Trigger};
use crate::error::{Error, Result};

/// Write end of the fatal-signal self-pipe, `-1` until installed.
static FATAL_PIPE: AtomicI32 = AtomicI32::new(-1);

/// Forward SIGINT and SIGTERM. Must be called from within a tokio runtime.
pub(crate) fn watch_termination(triggers: UnboundedSender<Trigger>) -> Result<()> {
    let mut sigint = signal(SignalKind::interrupt()).map_err(|e| Error::signal("SIGINT", e))?;
    let mut sigterm =
        signal(SignalKind::terminate()).map_err(|e| Error::signal("SIGTERM", e))?;

    tokio::spawn(async move {
        loop {
            let trigger = tokio::select! {
                Some(()) = sigint.recv() => Trigger::Interrupt,
                Some(()) = sigterm.recv() => Trigger::Terminate,
                else => break,
            };
            if triggers.send(trigger).is_err() {
                break;
            }
        }
    });

    Ok(())
}

extern "C" fn on_fatal_signal(signum: nix::libc::c_int) {
    let fd = FATAL_PIPE.load(Ordering::Acquire);
    if fd < 0 {
        return;
    }
    let byte = signum as u8;
    // SAFETY: write(2) is async-signal-safe and `byte` lives across the call.
    unsafe {
        nix::libc::write(fd, std::ptr::addr_of!(byte).cast(), 1);
    }
}

/// Forward SIGILL, SIGBUS, SIGFPE and SIGSEGV.
///
/// The handlers are process-wide; installing twice keeps the first queue.
pub(crate) fn watch_fatal(triggers: UnboundedSender<Trigger>) -> Result<()> {
    use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, sigaction};

    if FATAL_PIPE.load(Ordering::Acquire) >= 0 {
        tracing::debug!("fatal signal handlers already installed");
        return Ok(());
    }

    let (mut reader, writer) =
        std::io::pipe().map_err(|e| Error::io("creating fatal signal pipe", e))?;
    FATAL_PIPE.store(writer.into_raw_fd(), Ordering::Release);

    std::thread::Builder::new()
        .name("fatal-signals".to_string())
        .spawn(move || {
            let mut buf = [0u8; 1];
            while let Ok(1) = reader.read(&mut buf) {
                let Some(fatal) = FatalSignal::from_raw(i32::from(buf[0])) else {
                    continue;
                };
                if triggers.send(Trigger::FatalSignal(fatal)).is_err() {
                    break;
                }
            }
        })
        .map_err(|e| Error::io("spawning fatal signal reader", e))?;

    let action = SigAction::new(
        SigHandler::Handler(on_fatal_signal),
        SaFlags::SA_RESETHAND | SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    for fatal in FatalSignal::ALL {
        // SAFETY: the handler only performs an atomic load and write(2).
        unsafe { sigaction(fatal.signal(), &action) }
            .map_err(|e| Error::signal(fatal.name(), e))?;
    }

    Ok(())
}

/// Report panics as uncaught faults. The previous hook still runs first.
pub(crate) fn install_panic_hook(triggers: UnboundedSender<Trigger>) {
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        previous(info);
        let _ = triggers.send(Trigger::Fault(Fault::from_panic(info)));
    }));
}
