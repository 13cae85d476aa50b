//! Waiting for buffered writes to reach the remote before unmounting

use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::DrainConfig;
use crate::daemon::ControlApi;

/// How a drain ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Nothing transferring or queued
    Idle,
    /// The ceiling passed with work still pending
    TimedOut,
    Cancelled,
    /// Stats could not be read
    StatsFailed,
}

/// Poll daemon stats until idle, the ceiling passes, or `cancel` fires.
///
/// Never fails: every outcome lets the caller proceed to unmount.
pub async fn drain(
    api: &dyn ControlApi,
    fs: Option<&str>,
    config: &DrainConfig,
    cancel: &CancellationToken,
) -> DrainOutcome {
    let started = Instant::now();
    let deadline = started + config.max_wait;

    loop {
        if cancel.is_cancelled() {
            info!("Drain of {:?} cancelled", fs);
            return DrainOutcome::Cancelled;
        }

        match api.stats(fs).await {
            Ok(stats) if stats.is_idle() => {
                debug!("Drain of {:?} finished after {:?}", fs, started.elapsed());
                return DrainOutcome::Idle;
            }
            Ok(stats) => debug!(
                "Waiting on {:?}: {} transferring, {} queued, {} uploading",
                fs, stats.transferring, stats.uploads_queued, stats.uploads_in_progress
            ),
            Err(e) => {
                warn!("Cannot read daemon stats, unmounting without drain: {}", e);
                return DrainOutcome::StatsFailed;
            }
        }

        let now = Instant::now();
        if now >= deadline {
            warn!(
                "Writes to {:?} still pending after {:?}, unmounting anyway",
                fs, config.max_wait
            );
            return DrainOutcome::TimedOut;
        }

        let wait = config.poll_interval.min(deadline - now);
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Drain of {:?} cancelled", fs);
                return DrainOutcome::Cancelled;
            }
            _ = sleep(wait) => {}
        }
    }
}
