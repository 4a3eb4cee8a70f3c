//! clusterd - run a supervised worker pool.
//!
//! The bundled payload is a heartbeat: every worker logs a tick at a fixed
//! interval until it is asked to stop. Flags can make workers crash or hang
//! during teardown, which exercises the supervision paths end to end.
//!
//! ```text
//! clusterd --workers 4
//! clusterd --workers 2 --crash-after-ms 500
//! CLUSTER_LOG_FORMAT=json RUST_LOG=clusterd=trace clusterd
//! ```

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;

use clusterd::{AppContext, Cluster, LogFormat, Record, Sink};

#[derive(Parser, Debug)]
#[command(name = "clusterd")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Requested worker count, capped by the number of CPUs
    #[arg(short, long)]
    workers: Option<usize>,

    /// TOML file with a [cluster] table
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Coordinator log output format
    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,

    /// Interval between worker heartbeats
    #[arg(long, default_value_t = 1000, value_parser = clap::value_parser!(u64).range(1..))]
    heartbeat_ms: u64,

    /// Make every worker panic after this many milliseconds
    #[arg(long)]
    crash_after_ms: Option<u64>,

    /// Make worker teardown never finish
    #[arg(long)]
    hang_on_shutdown: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut cluster =
        Cluster::load(cli.config.as_deref()).context("failed to load configuration")?;
    if let Some(workers) = cli.workers {
        cluster = cluster.with_workers(workers);
    }
    if let Some(format) = cli.log_format {
        cluster = cluster.with_log_format(format);
    }

    let every = Duration::from_millis(cli.heartbeat_ms);
    let crash_after = cli.crash_after_ms.map(Duration::from_millis);
    let hang = cli.hang_on_shutdown;
    let (stop, stopped) = watch::channel(false);

    let code = cluster
        .run(
            move |ctx| heartbeat(ctx, every, crash_after, stopped),
            move || async move {
                let _ = stop.send(true);
                if hang {
                    tracing::warn!("teardown hanging on request");
                    std::future::pending::<()>().await;
                }
                anyhow::Ok(())
            },
        )
        .await?;

    std::process::exit(code);
}

async fn heartbeat(
    ctx: AppContext,
    every: Duration,
    crash_after: Option<Duration>,
    mut stop: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let worker = ctx.worker;
    ctx.sink.debug(Record::new("payload started").with("worker", worker));

    if let Some(delay) = crash_after {
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            panic!("worker {worker} crashed on request");
        });
    }

    let mut ticker = tokio::time::interval(every);
    let mut beat: u64 = 0;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                beat += 1;
                tracing::info!(worker, beat, "heartbeat");
            },
            _ = stop.changed() => break,
        }
    }

    tracing::debug!(worker, beats = beat, "heartbeat stopped");
    Ok(())
}
