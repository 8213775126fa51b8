//! Cooperative session control: cancel and skip signals plus the timeout
//! and polling wrappers every suspending engine step goes through.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{StepError, SurfaceError};

/// Signals shared between a running session and whoever controls it.
/// Clone is cheap and shares state.
#[derive(Debug, Clone, Default)]
pub struct SessionControl {
    cancelled: Arc<AtomicBool>,
    skip_current: Arc<AtomicBool>,
}

impl SessionControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Requests that the source currently being processed is skipped.
    pub fn skip_current_source(&self) {
        self.skip_current.store(true, Ordering::SeqCst);
    }

    /// Consumes a pending skip request.
    pub fn take_skip(&self) -> bool {
        self.skip_current.swap(false, Ordering::SeqCst)
    }

    pub fn is_skip_requested(&self) -> bool {
        self.skip_current.load(Ordering::SeqCst)
    }

    pub fn checkpoint(&self, step: &str) -> Result<(), StepError> {
        if self.is_cancelled() {
            return Err(StepError::Cancelled {
                step: step.to_string(),
            });
        }
        Ok(())
    }

    /// Resolves once cancellation is observed, polling every `poll_interval`.
    pub async fn cancelled(&self, poll_interval: Duration) {
        while !self.is_cancelled() {
            tokio::time::sleep(poll_interval).await;
        }
    }

    /// Resolves once a skip is requested. Does not consume the request.
    pub async fn skip_requested(&self, poll_interval: Duration) {
        while !self.is_skip_requested() {
            tokio::time::sleep(poll_interval).await;
        }
    }
}

/// Bounds `future` by `timeout`, mapping expiry to [`StepError::Timeout`].
pub async fn with_step_timeout<T, F>(step: &str, timeout: Duration, future: F) -> Result<T, StepError>
where
    F: Future<Output = Result<T, SurfaceError>>,
{
    match tokio::time::timeout(timeout, future).await {
        Ok(result) => result.map_err(StepError::from),
        Err(_) => Err(StepError::Timeout {
            step: step.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        }),
    }
}

/// Runs one step under its timeout while watching for cancellation, so a
/// stalled step never delays a cancel by more than `poll_interval`.
pub async fn run_step<T, F>(
    control: &SessionControl,
    step: &str,
    timeout: Duration,
    poll_interval: Duration,
    future: F,
) -> Result<T, StepError>
where
    F: Future<Output = Result<T, SurfaceError>>,
{
    control.checkpoint(step)?;
    tokio::select! {
        result = with_step_timeout(step, timeout, future) => result,
        _ = control.cancelled(poll_interval) => Err(StepError::Cancelled {
            step: step.to_string(),
        }),
    }
}

/// Like [`run_step`], but a skip request also ends the step. The request
/// is consumed and reported as [`StepError::Skipped`].
pub async fn run_source_step<T, F>(
    control: &SessionControl,
    step: &str,
    timeout: Duration,
    poll_interval: Duration,
    future: F,
) -> Result<T, StepError>
where
    F: Future<Output = Result<T, SurfaceError>>,
{
    control.checkpoint(step)?;
    if control.take_skip() {
        return Err(StepError::Skipped {
            step: step.to_string(),
        });
    }
    tokio::select! {
        result = with_step_timeout(step, timeout, future) => result,
        _ = control.cancelled(poll_interval) => Err(StepError::Cancelled {
            step: step.to_string(),
        }),
        _ = control.skip_requested(poll_interval) => {
            control.take_skip();
            Err(StepError::Skipped {
                step: step.to_string(),
            })
        }
    }
}

/// Polls `condition` until it holds. Gives up on cancellation or once
/// `timeout` elapses.
pub async fn wait_until<F, Fut>(
    control: &SessionControl,
    step: &str,
    timeout: Duration,
    poll_interval: Duration,
    mut condition: F,
) -> Result<(), StepError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, SurfaceError>>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        control.checkpoint(step)?;
        if condition().await? {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(StepError::Timeout {
                step: step.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            });
        }
        tokio::time::sleep(poll_interval).await;
    }
}
