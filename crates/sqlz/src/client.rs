//! Capability traits sqlz executes against.
//!
//! The statement builder and the transaction guard never talk to a driver
//! directly. They consume these traits, which are implemented for
//! `tokio_postgres` in [`crate::postgres`] and for the scripted backend in
//! `sqlz::testing`.

use crate::context::Context;
use crate::error::BoxError;
use crate::scan::RawColumn;
use crate::transaction::TxOptions;
use std::future::Future;
use tokio_postgres::types::ToSql;

/// What an executed statement reports back, as exposed by the backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecResult {
    rows_affected: u64,
    last_insert_id: Option<i64>,
}

impl ExecResult {
    pub fn new(rows_affected: u64) -> Self {
        Self {
            rows_affected,
            last_insert_id: None,
        }
    }

    /// Attach the last generated id (for backends that expose one).
    pub fn with_last_insert_id(mut self, id: i64) -> Self {
        self.last_insert_id = Some(id);
        self
    }

    pub fn rows_affected(&self) -> u64 {
        self.rows_affected
    }

    /// `None` when the backend does not report generated ids (Postgres never does;
    /// use `RETURNING` instead).
    pub fn last_insert_id(&self) -> Option<i64> {
        self.last_insert_id
    }
}

/// A fetched row whose columns can be handed to scan targets.
pub trait ScanRow: Send {
    fn column_count(&self) -> usize;

    /// The raw value of column `index` together with its type.
    fn column(&self, index: usize) -> Result<RawColumn, BoxError>;
}

/// Runs statements that return no rows.
pub trait Executor: Send + Sync {
    fn exec(
        &self,
        ctx: &Context,
        sql: &str,
        args: &[&(dyn ToSql + Sync)],
    ) -> impl Future<Output = Result<ExecResult, BoxError>> + Send;
}

/// Runs statements that return rows.
pub trait Queryer: Send + Sync {
    type Row: ScanRow;
    type Rows: Cursor<Row = Self::Row>;

    /// Run a query and return its first row, if any.
    fn query_row(
        &self,
        ctx: &Context,
        sql: &str,
        args: &[&(dyn ToSql + Sync)],
    ) -> impl Future<Output = Result<Option<Self::Row>, BoxError>> + Send;

    /// Run a query and return a cursor over its rows.
    fn query(
        &self,
        ctx: &Context,
        sql: &str,
        args: &[&(dyn ToSql + Sync)],
    ) -> impl Future<Output = Result<Self::Rows, BoxError>> + Send;
}

/// Incremental access to a multi-row result.
///
/// A row-level fault is delivered as `Some(Err(_))`; callers stop reading
/// after it. [`Cursor::close`] consumes the cursor, so it runs at most once.
/// Dropping a cursor that was not closed (a cancelled fetch) must still
/// release it; `tokio_postgres::RowStream` does so on drop.
pub trait Cursor: Send {
    type Row: ScanRow;

    fn next_row(&mut self) -> impl Future<Output = Option<Result<Self::Row, BoxError>>> + Send;

    /// Release the cursor.
    fn close(self) -> impl Future<Output = Result<(), BoxError>> + Send;
}

/// An open transaction.
///
/// Dropping a transaction that was neither committed nor rolled back must roll
/// it back (`tokio_postgres::Transaction` does so on drop).
pub trait Transaction: Executor + Queryer {
    fn commit(self) -> impl Future<Output = Result<(), BoxError>> + Send;

    fn rollback(self) -> impl Future<Output = Result<(), BoxError>> + Send;
}

/// Something that can open transactions.
pub trait Connection: Send {
    type Tx<'c>: Transaction
    where
        Self: 'c;

    fn begin(
        &mut self,
        ctx: &Context,
        opts: &TxOptions,
    ) -> impl Future<Output = Result<Self::Tx<'_>, BoxError>> + Send;
}
