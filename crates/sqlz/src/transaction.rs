//! Transaction guard: commit on success, roll back on error or panic.
//!
//! [`begin`] opens a transaction and returns a [`TxGuard`]. Run statements on
//! the guard (it derefs to the transaction), then hand the body's outcome to
//! [`TxGuard::close`]:
//!
//! - `Err(e)`: the transaction is rolled back and `e` is returned. A rollback
//!   failure is discarded, `e` already explains what went wrong.
//! - `Ok(v)`: the transaction is committed. If the commit fails, the result
//!   becomes [`Error::Commit`] even though the body succeeded.
//!
//! A guard dropped without `close` (early return, cancellation, panic) drops
//! the transaction, which rolls it back. [`with_transaction`] wraps the whole
//! protocol and also rolls back explicitly before resuming a panic.
//!
//! # Example
//!
//! ```ignore
//! use sqlz::{Context, Error, TxOptions, stmt, with_transaction};
//!
//! let ctx = Context::background();
//! with_transaction(&ctx, &mut client, &TxOptions::new(), async |tx| {
//!     stmt("update accounts set balance = balance - $1 where id = $2")
//!         .bind(100_i64)
//!         .bind(1_i64)
//!         .execute(&ctx, tx)
//!         .await?;
//!     Ok::<_, Error>(())
//! })
//! .await?;
//! ```

use crate::client::{Connection, Transaction};
use crate::context::Context;
use crate::error::Error;
use futures_util::FutureExt;
use std::ops::{Deref, DerefMut};
use std::panic::AssertUnwindSafe;


/// Transaction isolation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

/// Options for opening a transaction.
///
/// Unset options fall back to the server defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxOptions {
    isolation: Option<IsolationLevel>,
    read_only: Option<bool>,
    deferrable: Option<bool>,
}

impl TxOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn isolation_level(mut self, level: IsolationLevel) -> Self {
        self.isolation = Some(level);
        self
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = Some(read_only);
        self
    }

    /// Only meaningful for serializable read-only transactions.
    pub fn deferrable(mut self, deferrable: bool) -> Self {
        self.deferrable = Some(deferrable);
        self
    }

    pub fn isolation(&self) -> Option<IsolationLevel> {
        self.isolation
    }

    pub fn is_read_only(&self) -> Option<bool> {
        self.read_only
    }

    pub fn is_deferrable(&self) -> Option<bool> {
        self.deferrable
    }
}

/// Open a transaction on `conn` and guard it.
pub async fn begin<'c, C>(
    ctx: &Context,
    conn: &'c mut C,
    opts: &TxOptions,
) -> Result<TxGuard<C::Tx<'c>>, Error>
where
    C: Connection,
{
    let tx = conn
        .begin(ctx, opts)
        .await
        .map_err(|source| Error::Begin { source })?;
    #[cfg(feature = "tracing")]
    tracing::debug!(?opts, "transaction started");
    Ok(TxGuard::new(tx))
}

/// Owns an open transaction until it is committed or rolled back.
///
/// Exactly one of commit or rollback is attempted per guard.
pub struct TxGuard<T: Transaction> {
    tx: Option<T>,
}

impl<T: Transaction> TxGuard<T> {
    /// Guard a transaction that is already open.
    pub fn new(tx: T) -> Self {
        Self { tx: Some(tx) }
    }

    /// Finish the transaction according to `outcome` and return the final result.
    pub async fn close<V, E>(mut self, outcome: Result<V, E>) -> Result<V, E>
    where
        E: From<Error>,
    {
        let Some(tx) = self.tx.take() else {
            return outcome;
        };
        match outcome {
            Ok(value) => match tx.commit().await {
                Ok(()) => Ok(value),
                Err(source) => Err(Error::Commit { source }.into()),
            },
            Err(err) => {
                discard_rollback(tx).await;
                Err(err)
            }
        }
    }

    /// Roll the transaction back, ignoring failures.
    pub async fn rollback(mut self) {
        if let Some(tx) = self.tx.take() {
            discard_rollback(tx).await;
        }
    }
}

impl<T: Transaction> Deref for TxGuard<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.tx
            .as_ref()
            .expect("transaction is present until the guard is consumed")
    }
}

impl<T: Transaction> DerefMut for TxGuard<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.tx
            .as_mut()
            .expect("transaction is present until the guard is consumed")
    }
}

impl<T: Transaction> Drop for TxGuard<T> {
    fn drop(&mut self) {
        // Dropping the transaction rolls it back.
        if let Some(tx) = self.tx.take() {
            #[cfg(feature = "tracing")]
            tracing::warn!(
                panicking = std::thread::panicking(),
                "transaction guard dropped without close; rolling back"
            );
            drop(tx);
        }
    }
}

async fn discard_rollback<T: Transaction>(tx: T) {
    if let Err(_err) = tx.rollback().await {
        #[cfg(feature = "tracing")]
        tracing::warn!(error = %_err, "rollback failed");
    }
}

/// Run `body` in a transaction.
///
/// Commits when `body` returns `Ok`, rolls back when it returns `Err`. If
/// `body` panics, the transaction is rolled back and the panic resumes.
pub async fn with_transaction<'c, C, V, E, F>(
    ctx: &Context,
    conn: &'c mut C,
    opts: &TxOptions,
    body: F,
) -> Result<V, E>
where
    C: Connection,
    F: AsyncFnOnce(&C::Tx<'c>) -> Result<V, E>,
    E: From<Error>,
{
    let guard = begin(ctx, conn, opts).await?;
    let outcome = AssertUnwindSafe(body(&*guard)).catch_unwind().await;
    match outcome {
        Ok(outcome) => guard.close(outcome).await,
        Err(panic) => {
            guard.rollback().await;
            std::panic::resume_unwind(panic)
        }
    }
}
