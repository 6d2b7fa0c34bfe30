use crate::model::PassReport;
use anyhow::Result;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;
use tracing::{error, info, warn};

/// Shared stop flag, flipped by the interrupt handler.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Smallest positive countdown, or the default when no page announced one.
pub fn next_delay(countdowns: &[i64], default: Duration) -> Duration {
    countdowns
        .iter()
        .copied()
        .filter(|minutes| *minutes > 0)
        .min()
        .map(|minutes| Duration::from_secs(minutes.unsigned_abs() * 60))
        .unwrap_or(default)
}

/// Runs one pass and turns its outcome into the delay before the next.
/// Errors and panics are logged and fall back to the default delay.
pub fn run_cycle<F>(pass: F, default: Duration) -> Duration
where
    F: FnOnce() -> Result<PassReport>,
{
    match catch_unwind(AssertUnwindSafe(pass)) {
        Ok(Ok(report)) => {
            let delay = next_delay(&report.countdowns(), default);
            info!(
                inserted = report.total_inserted(),
                failed_jobs = report.failed_jobs.len(),
                next_run_minutes = delay.as_secs() / 60,
                "cycle finished"
            );
            delay
        }
        Ok(Err(err)) => {
            error!(error = %format!("{err:#}"), "cycle failed");
            default
        }
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!(%message, "cycle panicked");
            default
        }
    }
}

/// Sleeps in one second slices so cancellation is noticed promptly.
/// Returns false when cancelled.
pub fn sleep_until_next(delay: Duration, cancel: &CancelToken) -> bool {
    let slice = Duration::from_secs(1);
    let mut remaining = delay;
    while !remaining.is_zero() {
        if cancel.is_cancelled() {
            return false;
        }
        let step = remaining.min(slice);
        thread::sleep(step);
        remaining -= step;
    }
    !cancel.is_cancelled()
}

/// Cancels `token` on Ctrl-C. The listener runs on its own thread with a
/// single-threaded runtime.
pub fn install_interrupt_handler(token: &CancelToken) -> Result<()> {
    let token = token.clone();
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    thread::Builder::new()
        .name("interrupt".to_string())
        .spawn(move || {
            runtime.block_on(async {
                match tokio::signal::ctrl_c().await {
                    Ok(()) => {
                        warn!("interrupt received; stopping after the current pass");
                        token.cancel();
                    }
                    Err(err) => error!(error = %err, "failed to listen for interrupt"),
                }
            });
        })?;
    Ok(())
}

/// Repeats passes until cancelled.
pub fn run_forever<F>(mut pass: F, default: Duration, cancel: &CancelToken)
where
    F: FnMut() -> Result<PassReport>,
{
    let mut cycle = 0u64;
    while !cancel.is_cancelled() {
        cycle += 1;
        info!(cycle, "starting cycle");
        let delay = run_cycle(&mut pass, default);
        if !sleep_until_next(delay, cancel) {
            break;
        }
    }
    info!(cycles = cycle, "scheduler stopped");
}
