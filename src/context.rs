use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum ContextError {
    #[error("operation cancelled")]
    Cancelled,

    #[error("deadline exceeded")]
    DeadlineExceeded,
}

/// Cancellation and deadline carried into every pool checkout and statement.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::new().limited(timeout)
    }

    /// A context cancelled together with `self`. The deadline is inherited.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    /// Caps the deadline at `timeout` from now. An earlier deadline is kept.
    pub fn limited(mut self, timeout: Duration) -> Self {
        let cap = Instant::now() + timeout;
        self.deadline = Some(self.deadline.map_or(cap, |d| d.min(cap)));
        self
    }

    /// Cancels this context and every child derived from it.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Drives `fut` until it completes, the token is cancelled or the
    /// deadline passes, whichever happens first.
    pub async fn run<F>(&self, fut: F) -> Result<F::Output, ContextError>
    where
        F: Future,
    {
        if self.token.is_cancelled() {
            return Err(ContextError::Cancelled);
        }
        if matches!(self.deadline, Some(d) if d <= Instant::now()) {
            return Err(ContextError::DeadlineExceeded);
        }

        let expiry = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(ContextError::Cancelled),
            _ = expiry => Err(ContextError::DeadlineExceeded),
            out = fut => Ok(out),
        }
    }
}
