//! Events that move a process from running to shutting down.

use std::any::Any;
use std::fmt;

/// Fault-class signals. Delivery is always fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalSignal {
    IllegalInstruction,
    BusError,
    FloatingPoint,
    SegmentationViolation,
}

impl FatalSignal {
    pub const ALL: [Self; 4] = [
        Self::IllegalInstruction,
        Self::BusError,
        Self::FloatingPoint,
        Self::SegmentationViolation,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::IllegalInstruction => "SIGILL",
            Self::BusError => "SIGBUS",
            Self::FloatingPoint => "SIGFPE",
            Self::SegmentationViolation => "SIGSEGV",
        }
    }

    #[cfg(unix)]
    pub fn signal(self) -> nix::sys::signal::Signal {
        use nix::sys::signal::Signal;

        match self {
            Self::IllegalInstruction => Signal::SIGILL,
            Self::BusError => Signal::SIGBUS,
            Self::FloatingPoint => Signal::SIGFPE,
            Self::SegmentationViolation => Signal::SIGSEGV,
        }
    }

    #[cfg(unix)]
    pub fn from_raw(signum: i32) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|fatal| fatal.signal() as i32 == signum)
    }
}

/// An uncaught application-level fault.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    /// Where the fault surfaced: `panic`, `start` or `teardown`.
    pub origin: &'static str,
    pub message: String,
    pub location: Option<String>,
}

impl Fault {
    pub fn new(origin: &'static str, message: impl Into<String>) -> Self {
        Self {
            origin,
            message: message.into(),
            location: None,
        }
    }

    /// Build a fault from an application error, keeping its context chain.
    pub fn from_error(origin: &'static str, error: &anyhow::Error) -> Self {
        Self::new(origin, format!("{error:#}"))
    }

    pub fn from_panic(info: &std::panic::PanicHookInfo<'_>) -> Self {
        Self {
            location: info.location().map(ToString::to_string),
            ..Self::from_payload("panic", info.payload())
        }
    }

    /// Build a fault from a panic payload caught while unwinding.
    pub fn from_payload(origin: &'static str, payload: &(dyn Any + Send)) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "Box<dyn Any>".to_string());

        Self::new(origin, message)
    }
}

/// Why shutdown was requested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    /// SIGINT.
    Interrupt,
    /// SIGTERM.
    Terminate,
    FatalSignal(FatalSignal),
    Fault(Fault),
    /// The coordinator closed the worker's channel.
    Disconnect,
}

impl Trigger {
    /// Fault-class triggers are logged at error severity.
    pub fn is_fault(&self) -> bool {
        matches!(self, Self::FatalSignal(_) | Self::Fault(_))
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Interrupt => f.write_str("SIGINT"),
            Self::Terminate => f.write_str("SIGTERM"),
            Self::FatalSignal(signal) => f.write_str(signal.name()),
            Self::Fault(_) => f.write_str("uncaughtException"),
            Self::Disconnect => f.write_str("disconnect"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_classification() {
        assert!(!Trigger::Interrupt.is_fault());
        assert!(!Trigger::Terminate.is_fault());
        assert!(!Trigger::Disconnect.is_fault());
        assert!(Trigger::FatalSignal(FatalSignal::BusError).is_fault());
        assert!(Trigger::Fault(Fault::new("start", "boom")).is_fault());
    }

    #[test]
    fn test_display_names() {
        assert_eq!(Trigger::Interrupt.to_string(), "SIGINT");
        assert_eq!(
            Trigger::FatalSignal(FatalSignal::SegmentationViolation).to_string(),
            "SIGSEGV"
        );
        assert_eq!(
            Trigger::Fault(Fault::new("panic", "x")).to_string(),
            "uncaughtException"
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_fatal_signal_from_raw() {
        for fatal in FatalSignal::ALL {
            assert_eq!(FatalSignal::from_raw(fatal.signal() as i32), Some(fatal));
        }
        assert_eq!(FatalSignal::from_raw(nix::sys::signal::Signal::SIGTERM as i32), None);
    }

    #[test]
    fn test_fault_from_payload_reads_messages() {
        let fault = Fault::from_payload("teardown", &"static message");
        assert_eq!(fault.message, "static message");

        let fault = Fault::from_payload("teardown", &String::from("owned message"));
        assert_eq!(fault.message, "owned message");
        assert_eq!(fault.location, None);

        let fault = Fault::from_payload("teardown", &42_u8);
        assert_eq!(fault.message, "Box<dyn Any>");
    }

    #[test]
    fn test_fault_from_error_keeps_context() {
        let error = anyhow::anyhow!("socket closed").context("stopping server");
        let fault = Fault::from_error("teardown", &error);
        assert_eq!(fault.origin, "teardown");
        assert_eq!(fault.message, "stopping server: socket closed");
    }
}
