use std::{process::ExitCode, time::Duration};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use tno_observe::{LoggerConfig, logger_init};
use tno_sync::{DrainOutcome, SyncConfig, global};

const HEARTBEAT: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    // 1) Logger
    logger_init(&LoggerConfig::from_env()?)?;

    // 2) Config
    let cfg = SyncConfig::from_env()?;
    cfg.validate()?;
    info!(
        concurrency = cfg.concurrency,
        drain_timeout_ms = cfg.drain_timeout_ms,
        "agent configured"
    );

    // 3) Background jobs, each registered with the global drain lock
    let stop = CancellationToken::new();
    for id in 0..3u32 {
        global().spawn(heartbeat(id, stop.clone()));
    }

    // 4) Startup batch
    let squares = cfg
        .runner()
        .run(1..=20u64, |n| async move {
            tokio::time::sleep(Duration::from_millis(10 * n)).await;
            n * n
        })
        .await?;
    info!(tasks = squares.len(), sum = squares.iter().sum::<u64>(), "startup batch finished");

    // 5) Ctrl+C, stop producers, drain
    info!("press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;
    stop.cancel();

    match global().wait_for_drain(cfg.drain_timeout()).await {
        DrainOutcome::Drained => {
            info!("shutdown complete");
            Ok(ExitCode::SUCCESS)
        }
        DrainOutcome::TimedOut { remaining } => {
            error!(remaining, "in-flight work did not finish in time, forcing exit");
            Ok(ExitCode::FAILURE)
        }
    }
}

async fn heartbeat(id: u32, stop: CancellationToken) {
    let mut beats = 0u64;
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = tokio::time::sleep(HEARTBEAT) => {
                beats += 1;
                debug!(id, beats, "heartbeat");
            }
        }
    }
    // Simulated cleanup before the unit is released.
    tokio::time::sleep(Duration::from_millis(100 * u64::from(id))).await;
    info!(id, beats, "heartbeat job stopped");
}
