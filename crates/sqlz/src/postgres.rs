//! `tokio_postgres` backend.
//!
//! `Client` and `Transaction` run statements, `Client` opens transactions, and
//! a `RowStream` is the cursor for multi-row queries. Placeholders are
//! Postgres-style (`$1`, `$2`, ...).

use crate::client::{Connection, Cursor, ExecResult, Executor, Queryer, Transaction};
use crate::context::Context;
use crate::error::BoxError;
use crate::transaction::{IsolationLevel, TxOptions};
use futures_core::Stream;
use std::future::Future;
use std::pin::Pin;
use tokio_postgres::types::ToSql;
use tokio_postgres::Row;

/// Cursor over a `tokio_postgres::RowStream`.
///
/// Each fetch honours the deadline of the context the query was issued with.
pub struct PgRows {
    inner: Pin<Box<tokio_postgres::RowStream>>,
    ctx: Context,
}

impl PgRows {
    fn new(inner: tokio_postgres::RowStream, ctx: &Context) -> Self {
        Self {
            inner: Box::pin(inner),
            ctx: *ctx,
        }
    }
}

impl Cursor for PgRows {
    type Row = Row;

    async fn next_row(&mut self) -> Option<Result<Row, BoxError>> {
        let inner = &mut self.inner;
        let next = std::future::poll_fn(|cx| inner.as_mut().poll_next(cx));
        match self.ctx.bound(next).await {
            Ok(next) => next.map(|row| row.map_err(Into::into)),
            Err(deadline) => Some(Err(Box::new(deadline))),
        }
    }

    async fn close(self) -> Result<(), BoxError> {
        // Dropping the stream releases the portal.
        drop(self.inner);
        Ok(())
    }
}

/// Read the first row of a query and drop the rest of the stream unread.
async fn first_row<F>(ctx: &Context, stream: F) -> Result<Option<Row>, BoxError>
where
    F: Future<Output = Result<tokio_postgres::RowStream, tokio_postgres::Error>>,
{
    let mut rows = PgRows::new(ctx.run(stream).await?, ctx);
    rows.next_row().await.transpose()
}

impl From<IsolationLevel> for tokio_postgres::IsolationLevel {
    fn from(level: IsolationLevel) -> Self {
        match level {
            IsolationLevel::ReadUncommitted => Self::ReadUncommitted,
            IsolationLevel::ReadCommitted => Self::ReadCommitted,
            IsolationLevel::RepeatableRead => Self::RepeatableRead,
            IsolationLevel::Serializable => Self::Serializable,
        }
    }
}

impl Executor for tokio_postgres::Client {
    async fn exec(
        &self,
        ctx: &Context,
        sql: &str,
        args: &[&(dyn ToSql + Sync)],
    ) -> Result<ExecResult, BoxError> {
        let rows = ctx.run(tokio_postgres::Client::execute(self, sql, args)).await?;
        Ok(ExecResult::new(rows))
    }
}

impl Queryer for tokio_postgres::Client {
    type Row = Row;
    type Rows = PgRows;

    async fn query_row(
        &self,
        ctx: &Context,
        sql: &str,
        args: &[&(dyn ToSql + Sync)],
    ) -> Result<Option<Row>, BoxError> {
        let stream = tokio_postgres::Client::query_raw(self, sql, args.iter().copied());
        first_row(ctx, stream).await
    }

    async fn query(
        &self,
        ctx: &Context,
        sql: &str,
        args: &[&(dyn ToSql + Sync)],
    ) -> Result<PgRows, BoxError> {
        let stream = ctx
            .run(tokio_postgres::Client::query_raw(self, sql, args.iter().copied()))
            .await?;
        Ok(PgRows::new(stream, ctx))
    }
}

impl Connection for tokio_postgres::Client {
    type Tx<'c> = tokio_postgres::Transaction<'c>;

    async fn begin(
        &mut self,
        ctx: &Context,
        opts: &TxOptions,
    ) -> Result<tokio_postgres::Transaction<'_>, BoxError> {
        let mut builder = self.build_transaction();
        if let Some(level) = opts.isolation() {
            builder = builder.isolation_level(level.into());
        }
        if let Some(read_only) = opts.is_read_only() {
            builder = builder.read_only(read_only);
        }
        if let Some(deferrable) = opts.is_deferrable() {
            builder = builder.deferrable(deferrable);
        }
        ctx.run(builder.start()).await
    }
}

impl Executor for tokio_postgres::Transaction<'_> {
    async fn exec(
        &self,
        ctx: &Context,
        sql: &str,
        args: &[&(dyn ToSql + Sync)],
    ) -> Result<ExecResult, BoxError> {
        let rows = ctx
            .run(tokio_postgres::Transaction::execute(self, sql, args))
            .await?;
        Ok(ExecResult::new(rows))
    }
}

impl Queryer for tokio_postgres::Transaction<'_> {
    type Row = Row;
    type Rows = PgRows;

    async fn query_row(
        &self,
        ctx: &Context,
        sql: &str,
        args: &[&(dyn ToSql + Sync)],
    ) -> Result<Option<Row>, BoxError> {
        let stream = tokio_postgres::Transaction::query_raw(self, sql, args.iter().copied());
        first_row(ctx, stream).await
    }

    async fn query(
        &self,
        ctx: &Context,
        sql: &str,
        args: &[&(dyn ToSql + Sync)],
    ) -> Result<PgRows, BoxError> {
        let stream = ctx
            .run(tokio_postgres::Transaction::query_raw(
                self,
                sql,
                args.iter().copied(),
            ))
            .await?;
        Ok(PgRows::new(stream, ctx))
    }
}

impl Transaction for tokio_postgres::Transaction<'_> {
    async fn commit(self) -> Result<(), BoxError> {
        tokio_postgres::Transaction::commit(self)
            .await
            .map_err(Into::into)
    }

    async fn rollback(self) -> Result<(), BoxError> {
        tokio_postgres::Transaction::rollback(self)
            .await
            .map_err(Into::into)
    }
}
