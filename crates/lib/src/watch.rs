//! Removal confirmation watching.
//!
//! External reconcilers finalize an instance only after its removal has been
//! confirmed, or after a bounded wait. [`wait_for_removal`] samples the
//! persisted summary until it reports a fully successful removal, giving up
//! after the timeout. The timeout outcome is deliberately not an error: the
//! transport guarantees at-least-once delivery, so an unconfirmed removal job
//! remains available for a provider to pick up later, and callers proceed
//! with best-effort finalization.

use std::time::Duration;

use tracing::{debug, info};

use crate::manager::SolutionManager;
use crate::model::SummaryResult;

/// How long to wait for a removal to be confirmed.
pub const DEFAULT_REMOVAL_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// How often to sample the summary while waiting.
pub const DEFAULT_REMOVAL_INTERVAL: Duration = Duration::from_secs(10);

/// Sampling parameters for [`wait_for_removal`].
#[derive(Debug, Clone)]
pub struct WatchOptions {
    pub timeout: Duration,
    pub interval: Duration,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_REMOVAL_TIMEOUT,
            interval: DEFAULT_REMOVAL_INTERVAL,
        }
    }
}

/// Outcome of a removal wait.
#[derive(Debug, Clone, PartialEq)]
pub enum RemovalConfirmation {
    /// The summary reported a removal with every target succeeded.
    Confirmed(SummaryResult),
    /// The wait elapsed; callers proceed with best-effort finalization.
    TimedOut,
}

/// Waits for an instance's removal to be confirmed by its persisted summary.
///
/// A summary confirms removal when `is_removal` is set and every target
/// succeeded. Summary read failures (including a missing summary) are
/// treated as "not yet" and sampled again.
pub async fn wait_for_removal(manager: &SolutionManager, instance: &str, options: &WatchOptions) -> RemovalConfirmation {
    let deadline = tokio::time::Instant::now() + options.timeout;
    let mut ticker = tokio::time::interval(options.interval);
    // Skip the interval's immediate first tick; the first sample happens one
    // period in.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => {
                info!(instance, "removal not confirmed within the wait budget, proceeding");
                return RemovalConfirmation::TimedOut;
            }
            _ = ticker.tick() => {
                match manager.get_summary(instance).await {
                    Ok(result) if result.summary.is_removal && result.summary.success_count == result.summary.target_count => {
                        info!(instance, "removal confirmed");
                        return RemovalConfirmation::Confirmed(result);
                    }
                    Ok(_) => debug!(instance, "summary present but removal not confirmed yet"),
                    Err(err) => debug!(instance, error = %err, "summary not readable yet"),
                }
            }
        }
    }
}

/// Whether a persisted summary corresponds to the observed object
/// generation.
///
/// The persisted generation is a string; it is parsed as a signed integer
/// for the comparison, and a stale, missing, or unparseable value counts as
/// a match. A parse failure therefore never blocks finalization.
pub fn generation_matches(summary: &SummaryResult, observed: i64) -> bool {
    match summary.generation.parse::<i64>() {
        Ok(generation) => generation == observed,
        Err(_) => true,
    }
}
