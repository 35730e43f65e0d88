//! Retry policies for handling `FLOOD_WAIT` and transient I/O errors.

use std::num::NonZeroU32;
use std::ops::ControlFlow;
use std::time::Duration;

use crate::errors::InvocationError;

/// Controls how the client reacts when an RPC call fails.
pub trait RetryPolicy: Send + Sync + 'static {
    fn should_retry(&self, ctx: &RetryContext) -> ControlFlow<(), Duration>;
}

/// Context passed to [`RetryPolicy::should_retry`] on each failure.
pub struct RetryContext {
    pub fail_count:   NonZeroU32,
    pub slept_so_far: Duration,
    pub error:        InvocationError,
}

/// Never retry.
pub struct NoRetries;
impl RetryPolicy for NoRetries {
    fn should_retry(&self, _: &RetryContext) -> ControlFlow<(), Duration> {
        ControlFlow::Break(())
    }
}

/// Sleep on FLOOD_WAIT up to `threshold` and retry once on I/O errors.
///
/// Flood waits longer than the threshold are returned to the caller, which is
/// what gap recovery and the watchdog expect: they would rather give up on a
/// page than stall the whole update pipeline.
pub struct AutoSleep {
    pub threshold:             Duration,
    pub io_errors_as_flood_of: Option<Duration>,
}

impl Default for AutoSleep {
    fn default() -> Self {
        Self {
            threshold:             Duration::from_secs(10),
            io_errors_as_flood_of: Some(Duration::from_secs(1)),
        }
    }
}

impl RetryPolicy for AutoSleep {
    fn should_retry(&self, ctx: &RetryContext) -> ControlFlow<(), Duration> {
        if let Some(secs) = ctx.error.flood_wait_seconds() {
            if secs <= self.threshold.as_secs() {
                tracing::info!("[layer] FLOOD_WAIT_{secs} — sleeping before retry");
                return ControlFlow::Continue(Duration::from_secs(secs));
            }
        }
        if matches!(ctx.error, InvocationError::Io(_)) && ctx.fail_count.get() == 1 {
            if let Some(d) = self.io_errors_as_flood_of {
                tracing::info!("[layer] I/O error — sleeping {d:?} before retry");
                return ControlFlow::Continue(d);
            }
        }
        ControlFlow::Break(())
    }
}
