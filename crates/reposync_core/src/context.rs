//! Explicit per-run context shared by the exporter, importer and transformer.

use crate::error::{TransformError, TransformResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, info_span, Span};
use uuid::Uuid;

/// Handle that cancels a running transformation from another thread.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    /// Requests cancellation. The run stops at the next top-level entity.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Returns true if cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Context of one transformer instance.
///
/// Carries the run identifier, the tracing span every log line of the run
/// is recorded under, the cancellation flag and progress reporting.
#[derive(Debug, Clone)]
pub struct TransformContext {
    run_id: Uuid,
    span: Span,
    cancel: CancelHandle,
    progress_interval: u64,
}

impl TransformContext {
    /// Creates a context with a fresh run identifier.
    pub fn new(progress_interval: u64) -> Self {
        let run_id = Uuid::new_v4();
        Self {
            run_id,
            span: info_span!("transform", run_id = %run_id),
            cancel: CancelHandle::default(),
            progress_interval,
        }
    }

    /// Identifier of the run.
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Span the run logs under.
    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Returns a handle that cancels this run.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Fails with `Cancelled` if cancellation was requested.
    pub fn check_cancelled(&self) -> TransformResult<()> {
        if self.cancel.is_cancelled() {
            Err(TransformError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Clears a previous cancellation request.
    pub fn reset_cancel(&self) {
        self.cancel.reset();
    }

    /// Logs progress when `processed` crosses the progress interval.
    pub fn report_progress(&self, processed: u64) {
        if self.progress_interval > 0 && processed > 0 && processed % self.progress_interval == 0 {
            info!(entities = processed, "progress");
        }
    }
}

impl Default for TransformContext {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_PROGRESS_INTERVAL)
    }
}
