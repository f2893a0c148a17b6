use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{GeoStoreError, Result, ResultCode};

/// Shared flag polled by long-running operations.
#[derive(Clone, Default)]
pub struct CancellationToken {
    pub id: String,
    is_cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            is_cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cancel(&self) {
        self.is_cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.is_cancelled.load(Ordering::SeqCst)
    }

    pub fn throw_if_cancelled(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(GeoStoreError::Canceled)
        } else {
            Ok(())
        }
    }
}

type ProgressFn = dyn Fn(ResultCode, f64, &str) -> bool + Send + Sync;

/// Progress sink for copy, paste and overview generation.
///
/// The callback returns `false` to request cancellation. A progress split
/// into steps scales each step's fraction into its slice of the whole.
#[derive(Clone)]
pub struct Progress {
    callback: Option<Arc<ProgressFn>>,
    token: Option<CancellationToken>,
    total_steps: u32,
    step: u32,
}

impl Default for Progress {
    fn default() -> Self {
        Self {
            callback: None,
            token: None,
            total_steps: 1,
            step: 0,
        }
    }
}

impl fmt::Debug for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Progress")
            .field("has_callback", &self.callback.is_some())
            .field("total_steps", &self.total_steps)
            .field("step", &self.step)
            .finish()
    }
}

impl Progress {
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(ResultCode, f64, &str) -> bool + Send + Sync + 'static,
    {
        Self {
            callback: Some(Arc::new(callback)),
            ..Self::default()
        }
    }

    pub fn with_token(mut self, token: CancellationToken) -> Self {
        self.token = Some(token);
        self
    }

    pub fn set_total_steps(&mut self, total_steps: u32) {
        self.total_steps = total_steps.max(1);
    }

    pub fn set_step(&mut self, step: u32) {
        self.step = step.min(self.total_steps - 1);
    }

    /// Report progress. Returns `false` if the operation should stop.
    pub fn on_progress(&self, code: ResultCode, complete: f64, message: &str) -> bool {
        if let Some(token) = &self.token {
            if token.is_cancelled() {
                return false;
            }
        }
        let Some(callback) = &self.callback else {
            return true;
        };
        let complete = if complete.is_finite() {
            complete.clamp(0.0, 1.0)
        } else {
            0.0
        };
        let scaled = (self.step as f64 + complete) / self.total_steps as f64;
        callback(code, scaled, message)
    }
}
