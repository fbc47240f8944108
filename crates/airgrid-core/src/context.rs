//! Cancellation and deadline context threaded through every fetch.
//!
//! A [`FetchContext`] pairs a [`CancellationToken`] with an optional deadline.
//! Child contexts inherit both: cancelling a parent cancels its children, and a
//! child deadline can only be tighter than its parent's.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::FetchError;

#[derive(Debug, Clone, Default)]
pub struct FetchContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl FetchContext {
    /// Root context with no deadline.
    pub fn new() -> Self {
        Self::default()
    }

    /// Root context that expires `timeout` from now.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: Some(Instant::now() + timeout),
        }
    }

    /// Child context sharing this context's deadline and cancellation.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    /// Child context whose deadline is the earlier of the parent's and `timeout` from now.
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(parent) if parent < candidate => parent,
            _ => candidate,
        };
        Self {
            token: self.token.child_token(),
            deadline: Some(deadline),
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Fails if the context is cancelled or its deadline has passed.
    pub fn check(&self) -> Result<(), FetchError> {
        if self.token.is_cancelled() {
            return Err(FetchError::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(FetchError::DeadlineExceeded),
            _ => Ok(()),
        }
    }

    /// Resolves once the context is cancelled or expires, yielding the matching error.
    pub async fn done(&self) -> FetchError {
        match self.deadline {
            Some(deadline) => tokio::select! {
                _ = self.token.cancelled() => FetchError::Cancelled,
                _ = tokio::time::sleep_until(deadline) => FetchError::DeadlineExceeded,
            },
            None => {
                self.token.cancelled().await;
                FetchError::Cancelled
            }
        }
    }

    /// Drives `future` to completion unless the context ends first.
    pub async fn run<F>(&self, future: F) -> Result<F::Output, FetchError>
    where
        F: Future,
    {
        tokio::select! {
            biased;
            error = self.done() => Err(error),
            output = future => Ok(output),
        }
    }

    /// Sleeps for `duration`, waking early with an error if the context ends.
    pub async fn sleep(&self, duration: Duration) -> Result<(), FetchError> {
        self.run(tokio::time::sleep(duration)).await
    }
}
