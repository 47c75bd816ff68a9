//! Per-call execution context.
//!
//! Every execution operation takes a [`Context`]. It carries an optional
//! deadline that backend implementations apply to their network round trips.
//! sqlz itself never retries and never imposes a timeout of its own; dropping
//! the returned future is the other way to cancel a call.
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use sqlz::{Context, stmt};
//!
//! let ctx = Context::with_timeout(Duration::from_secs(2));
//! stmt("delete from sessions where expires_at < now()")
//!     .execute(&ctx, &client)
//!     .await?;
//! ```

use crate::error::BoxError;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

/// The error reported when a call outlives its context deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("context deadline exceeded")]
pub struct DeadlineExceeded;

/// Cancellation scope for a single execution call.
#[derive(Debug, Clone, Copy, Default)]
pub struct Context {
    deadline: Option<Instant>,
}

impl Context {
    /// A context without a deadline.
    pub fn background() -> Self {
        Self::default()
    }

    /// A context that expires `timeout` from now.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    /// A context that expires at `deadline`.
    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline. `None` means no deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    pub fn is_expired(&self) -> bool {
        self.remaining().is_some_and(|left| left.is_zero())
    }

    /// Await `future`, giving up with [`DeadlineExceeded`] once the deadline passes.
    pub async fn bound<F>(&self, future: F) -> Result<F::Output, DeadlineExceeded>
    where
        F: Future,
    {
        match self.deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, future)
                .await
                .map_err(|_| DeadlineExceeded),
            None => Ok(future.await),
        }
    }

    /// Like [`Context::bound`] for fallible backend futures, flattening both
    /// failure kinds into a [`BoxError`].
    pub async fn run<T, E, F>(&self, future: F) -> Result<T, BoxError>
    where
        F: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
    {
        self.bound(future).await?.map_err(Into::into)
    }
}
