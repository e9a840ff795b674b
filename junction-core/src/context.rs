//! Per-pass context handed to every reconciler

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::config::{ReconcilerConfig, WaitConfig};
use crate::error::ReconcileError;
use crate::provider::BoxFuture;

/// Time source used by waits
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;

    fn sleep(&self, duration: Duration) -> BoxFuture<'_, ()>;
}

/// Wall clock backed by the tokio timer
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) -> BoxFuture<'_, ()> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Cooperative cancellation flag, cheap to clone and share
#[derive(Debug, Default, Clone)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct ReconcileContext {
    pub config: ReconcilerConfig,
    clock: Arc<dyn Clock>,
    deadline: Option<Instant>,
    cancel: CancelToken,
    span: tracing::Span,
}

impl ReconcileContext {
    pub fn new(config: ReconcilerConfig) -> Self {
        Self {
            config,
            clock: Arc::new(TokioClock),
            deadline: None,
            cancel: CancelToken::new(),
            span: tracing::info_span!("reconcile"),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Bound the whole pass to `budget` from now
    pub fn with_deadline(mut self, budget: Duration) -> Self {
        self.deadline = Some(self.clock.now() + budget);
        self
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_span(mut self, span: tracing::Span) -> Self {
        self.span = span;
        self
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    pub fn span(&self) -> &tracing::Span {
        &self.span
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn wait(&self) -> &WaitConfig {
        &self.config.wait
    }

    /// Fails once the pass has been cancelled or has run past its deadline
    pub fn check_live(&self) -> Result<(), ReconcileError> {
        if self.cancel.is_cancelled() {
            return Err(ReconcileError::Cancelled);
        }
        if let Some(deadline) = self.deadline
            && self.clock.now() >= deadline
        {
            return Err(ReconcileError::DeadlineExceeded);
        }
        Ok(())
    }
}
