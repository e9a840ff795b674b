//! Wait - Poll a remote resource until it settles
//!
//! Every create/modify/delete against the provider is followed by one of
//! these waits. They are the only suspension points of a pass, and each one
//! is bounded by a timeout and honours cancellation and the pass deadline.

use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::context::{Clock, ReconcileContext};
use crate::error::ReconcileError;
use crate::provider::{BoxFuture, ProviderResult};

/// What a wait is watching, for logs and errors
pub struct WaitTarget<'a> {
    pub resource: &'a str,
    pub expected: &'a str,
    pub timeout: Duration,
}

impl<'a> WaitTarget<'a> {
    pub fn new(resource: &'a str, expected: &'a str, timeout: Duration) -> Self {
        Self {
            resource,
            expected,
            timeout,
        }
    }
}

struct Poller<'c, 'a> {
    ctx: &'c ReconcileContext,
    target: &'c WaitTarget<'a>,
    started: Instant,
}

impl<'c, 'a> Poller<'c, 'a> {
    fn start(ctx: &'c ReconcileContext, target: &'c WaitTarget<'a>) -> Self {
        tracing::debug!(
            resource = target.resource,
            expected = target.expected,
            "waiting"
        );
        Self {
            ctx,
            target,
            started: ctx.clock().now(),
        }
    }

    /// Sleep one poll interval, or fail if the wait is over
    async fn pause(&self) -> Result<(), ReconcileError> {
        let waited = self.ctx.clock().now().saturating_duration_since(self.started);
        if waited >= self.target.timeout {
            return Err(ReconcileError::WaitTimeout {
                resource: self.target.resource.to_string(),
                expected: self.target.expected.to_string(),
                waited,
            });
        }
        self.ctx.clock().sleep(self.ctx.wait().poll_interval()).await;
        self.ctx.check_live()
    }

    fn unexpected(&self, status: &impl fmt::Display) -> ReconcileError {
        ReconcileError::UnexpectedStatus {
            resource: self.target.resource.to_string(),
            status: status.to_string(),
        }
    }
}

/// Poll until the status is one of `terminal`.
///
/// A missing resource (or a not-found error) keeps the wait going, as does a
/// status in `transitional`. An empty `transitional` list tolerates any
/// non-terminal status; otherwise an unlisted status fails immediately.
pub async fn await_status<'a, S, F>(
    ctx: &ReconcileContext,
    target: &WaitTarget<'_>,
    terminal: &[S],
    transitional: &[S],
    mut poll: F,
) -> Result<S, ReconcileError>
where
    S: PartialEq + fmt::Display,
    F: FnMut() -> BoxFuture<'a, ProviderResult<Option<S>>>,
{
    ctx.check_live()?;
    let poller = Poller::start(ctx, target);
    loop {
        match poll().await {
            Ok(Some(status)) if terminal.contains(&status) => return Ok(status),
            Ok(Some(status)) if transitional.is_empty() || transitional.contains(&status) => {}
            Ok(Some(status)) => return Err(poller.unexpected(&status)),
            Ok(None) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }
        poller.pause().await?;
    }
}

/// Poll until the resource is gone or reports one of `deleted`.
pub async fn await_deleted<'a, S, F>(
    ctx: &ReconcileContext,
    target: &WaitTarget<'_>,
    deleted: &[S],
    transitional: &[S],
    mut poll: F,
) -> Result<(), ReconcileError>
where
    S: PartialEq + fmt::Display,
    F: FnMut() -> BoxFuture<'a, ProviderResult<Option<S>>>,
{
    ctx.check_live()?;
    let poller = Poller::start(ctx, target);
    loop {
        match poll().await {
            Ok(None) => return Ok(()),
            Err(e) if e.is_not_found() => return Ok(()),
            Ok(Some(status)) if deleted.contains(&status) => return Ok(()),
            Ok(Some(status)) if transitional.is_empty() || transitional.contains(&status) => {}
            Ok(Some(status)) => return Err(poller.unexpected(&status)),
            Err(e) => return Err(e.into()),
        }
        poller.pause().await?;
    }
}

/// Poll until `poll` reports true
pub async fn await_condition<'a, F>(
    ctx: &ReconcileContext,
    target: &WaitTarget<'_>,
    mut poll: F,
) -> Result<(), ReconcileError>
where
    F: FnMut() -> BoxFuture<'a, ProviderResult<bool>>,
{
    ctx.check_live()?;
    let poller = Poller::start(ctx, target);
    loop {
        if poll().await? {
            return Ok(());
        }
        poller.pause().await?;
    }
}

/// Virtual clock: `sleep` advances time instantly
#[derive(Debug)]
pub struct ManualClock {
    base: Instant,
    elapsed: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            elapsed: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut elapsed = self.elapsed.lock().unwrap_or_else(|e| e.into_inner());
        *elapsed += by;
    }

    pub fn elapsed(&self) -> Duration {
        *self.elapsed.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + self.elapsed()
    }

    fn sleep(&self, duration: Duration) -> BoxFuture<'_, ()> {
        self.advance(duration);
        Box::pin(std::future::ready(()))
    }
}
