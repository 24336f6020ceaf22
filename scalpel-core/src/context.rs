//! Per-call cancellation and deadlines.
//!
//! A [`CallContext`] travels with one logical call. Every blocking read or
//! write in the framer and marshalers is raced against it, so a cancelled or
//! expired call unwinds promptly with [`Code::Canceled`] or
//! [`Code::DeadlineExceeded`] instead of a generic transport error.
//!
//! [`Code::Canceled`]: crate::Code::Canceled
//! [`Code::DeadlineExceeded`]: crate::Code::DeadlineExceeded

use std::future::Future;
use std::time::Duration;

use futures::future;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why a call context is done.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ContextError {
    /// The call was cancelled.
    #[error("context canceled")]
    Canceled,
    /// The call's deadline passed.
    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

/// Cancellation and deadline state for a single call.
///
/// Contexts are cheap to clone. Derived contexts keep observing every
/// cancellation signal of their parent and can only shorten its deadline.
#[derive(Clone, Debug, Default)]
pub struct CallContext {
    deadline: Option<Instant>,
    token: Option<CancellationToken>,
}

/// Cancels the [`CallContext`] it was created with.
///
/// Dropping the handle without calling [`cancel`](CancelHandle::cancel)
/// leaves the context running.
#[derive(Debug)]
pub struct CancelHandle(CancellationToken);

impl CancelHandle {
    /// Cancel the associated context and every context derived from it.
    pub fn cancel(&self) {
        self.0.cancel();
    }
}

impl CallContext {
    /// A context that is never cancelled and has no deadline.
    pub fn background() -> Self {
        Self::default()
    }

    /// Derive a context whose deadline is at most `timeout` from now.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Derive a context whose deadline is at most `deadline`.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        });
        self
    }

    /// Derive a context that can be cancelled through the returned handle.
    pub fn with_cancel(mut self) -> (Self, CancelHandle) {
        let token = match &self.token {
            Some(parent) => parent.child_token(),
            None => CancellationToken::new(),
        };
        self.token = Some(token.clone());
        (self, CancelHandle(token))
    }

    /// The deadline, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left until the deadline, if any. Zero once it has passed.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Non-blocking check of whether the context is already done.
    pub fn err(&self) -> Option<ContextError> {
        if self.token.as_ref().is_some_and(CancellationToken::is_cancelled) {
            return Some(ContextError::Canceled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(ContextError::DeadlineExceeded),
            _ => None,
        }
    }

    /// Resolves once the context is cancelled or its deadline passes.
    pub async fn done(&self) -> ContextError {
        let cancelled = async {
            match &self.token {
                Some(token) => token.cancelled().await,
                None => future::pending::<()>().await,
            }
        };
        let expired = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => future::pending::<()>().await,
            }
        };
        tokio::select! {
            _ = cancelled => ContextError::Canceled,
            _ = expired => ContextError::DeadlineExceeded,
        }
    }

    /// Drive `fut` to completion unless the context finishes first.
    pub async fn run<F>(&self, fut: F) -> Result<F::Output, ContextError>
    where
        F: Future,
    {
        if let Some(err) = self.err() {
            return Err(err);
        }
        tokio::select! {
            biased;
            err = self.done() => Err(err),
            output = fut => Ok(output),
        }
    }
}
