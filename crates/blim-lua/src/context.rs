//! Cancellation context for script execution.

use crate::error::{Interrupted, ScriptError};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Carries a cancellation token and an optional deadline into
/// [`ScriptEngine::execute_script`](crate::ScriptEngine::execute_script).
///
/// Clones share the same token: cancelling one cancels all of them.
///
/// # Example
///
/// ```
/// use blim_lua::ExecContext;
/// use std::time::Duration;
///
/// let ctx = ExecContext::with_timeout(Duration::from_secs(5));
/// assert!(!ctx.is_done());
/// ctx.cancel();
/// assert!(ctx.is_done());
/// ```
#[derive(Debug, Clone, Default)]
pub struct ExecContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl ExecContext {
    /// A context that is only done when explicitly cancelled.
    #[must_use]
    pub fn background() -> Self {
        Self::default()
    }

    /// A context that expires `timeout` from now.
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::background().timeout(timeout)
    }

    /// A context driven by an existing token.
    #[must_use]
    pub fn with_token(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    /// Adds (or tightens) a deadline `timeout` from now.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        let at = Instant::now() + timeout;
        self.deadline = Some(self.deadline.map_or(at, |d| d.min(at)));
        self
    }

    /// A child context: cancelled with its parent, cancellable on its own.
    #[must_use]
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    #[must_use]
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Why the context is done, if it is.
    #[must_use]
    pub fn interruption(&self) -> Option<Interrupted> {
        if self.token.is_cancelled() {
            return Some(Interrupted::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(Interrupted::DeadlineExceeded),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.interruption().is_some()
    }

    /// Fails with the cancellation error once the context is done.
    pub fn check(&self) -> Result<(), ScriptError> {
        match self.interruption() {
            Some(reason) => Err(ScriptError::interrupted(reason)),
            None => Ok(()),
        }
    }

    /// Sleeps for `duration` in steps of at most `slice`, returning early
    /// with the cancellation error if the context finishes first.
    pub fn sleep(&self, duration: Duration, slice: Duration) -> Result<(), ScriptError> {
        let until = Instant::now() + duration;
        loop {
            self.check()?;
            let now = Instant::now();
            if now >= until {
                return Ok(());
            }
            let mut step = (until - now).min(slice);
            if let Some(deadline) = self.deadline {
                step = step.min(deadline.saturating_duration_since(now));
            }
            std::thread::sleep(step);
        }
    }
}
