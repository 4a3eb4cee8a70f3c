//! Host description for the coordinator's start record.

use sysinfo::System;

use crate::log::Record;

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Descriptive facts about the host. Has no effect on control flow.
#[derive(Debug, Clone, PartialEq)]
pub struct HostInfo {
    pub env: String,
    pub cpus: usize,
    pub mem_gib: f64,
    /// Compiler the binary was built with.
    pub version: &'static str,
}

impl HostInfo {
    pub fn collect(env: &str) -> Self {
        let mut system = System::new();
        system.refresh_memory();

        Self {
            env: env.to_string(),
            cpus: num_cpus::get(),
            mem_gib: system.total_memory() as f64 / GIB,
            version: env!("CLUSTERD_RUSTC_VERSION"),
        }
    }

    /// Attach the host facts to a record.
    pub fn describe(&self, record: Record) -> Record {
        record
            .with("env", self.env.as_str())
            .with("cpus", self.cpus)
            .with("mem", format!("{:.2}GB", self.mem_gib))
            .with("version", self.version)
    }
}
