//! Scripted in-memory backend for tests.
//!
//! [`MockDb`] plays back a queue of [`Expectation`]s in order. Each call must
//! match the next expectation (kind, SQL text, and argument `Debug` output when
//! given), otherwise it fails and is reported by
//! [`MockDb::expectations_were_met`]. Row values are encoded with the driver's
//! own `ToSql`, so scanning goes through real `FromSql` conversions.
//!
//! ```ignore
//! let db = MockDb::new();
//! db.expect(
//!     Expectation::query("select a, b from foo")
//!         .returns_rows(MockRows::new(&[Type::INT4, Type::TEXT]).row(&[&1, &"x"])),
//! );
//! ```

use crate::client::{Connection, Cursor, ExecResult, Executor, Queryer, ScanRow, Transaction};
use crate::context::Context;
use crate::error::BoxError;
use crate::scan::RawColumn;
use crate::transaction::TxOptions;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio_postgres::types::{ToSql, Type};

/// Error produced by scripted calls.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct MockError(String);

impl MockError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// A call observed by the mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Exec(String),
    QueryRow(String),
    Query(String),
    /// A row handed out by a cursor.
    NextRow,
    /// A row-level error handed out by a cursor.
    RowError,
    CloseRows,
    /// A cursor dropped without being closed.
    DropRows,
    Begin(TxOptions),
    Commit,
    Rollback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Exec,
    Query,
    Begin,
    Commit,
    Rollback,
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Kind::Exec => "exec",
            Kind::Query => "query",
            Kind::Begin => "begin",
            Kind::Commit => "commit",
            Kind::Rollback => "rollback",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
enum Outcome {
    Done,
    Exec(ExecResult),
    Rows(MockRows),
    Fail(MockError),
}

/// One scripted call.
#[derive(Debug, Clone)]
pub struct Expectation {
    kind: Kind,
    sql: Option<String>,
    args: Option<Vec<String>>,
    outcome: Outcome,
    delay: Option<Duration>,
}

impl Expectation {
    fn new(kind: Kind, sql: Option<String>) -> Self {
        Self {
            kind,
            sql,
            args: None,
            outcome: Outcome::Done,
            delay: None,
        }
    }

    /// Expect `Executor::exec` with exactly `sql`.
    pub fn exec(sql: impl Into<String>) -> Self {
        Self::new(Kind::Exec, Some(sql.into()))
    }

    /// Expect `Queryer::query_row` or `Queryer::query` with exactly `sql`.
    pub fn query(sql: impl Into<String>) -> Self {
        Self::new(Kind::Query, Some(sql.into()))
    }

    pub fn begin() -> Self {
        Self::new(Kind::Begin, None)
    }

    pub fn commit() -> Self {
        Self::new(Kind::Commit, None)
    }

    pub fn rollback() -> Self {
        Self::new(Kind::Rollback, None)
    }

    /// Require these arguments, compared by their `Debug` output.
    pub fn with_args(mut self, args: &[&(dyn ToSql + Sync)]) -> Self {
        self.args = Some(args.iter().map(|arg| format!("{arg:?}")).collect());
        self
    }

    pub fn returns(mut self, result: ExecResult) -> Self {
        self.outcome = Outcome::Exec(result);
        self
    }

    pub fn returns_rows(mut self, rows: MockRows) -> Self {
        self.outcome = Outcome::Rows(rows);
        self
    }

    pub fn fails(mut self, err: MockError) -> Self {
        self.outcome = Outcome::Fail(err);
        self
    }

    /// Hold the call for `delay` before answering.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// Scripted result rows.
#[derive(Debug, Clone)]
pub struct MockRows {
    types: Vec<Type>,
    rows: VecDeque<Result<MockRow, MockError>>,
    close_error: Option<MockError>,
}

impl MockRows {
    /// Rows whose columns have the given types.
    pub fn new(types: &[Type]) -> Self {
        Self {
            types: types.to_vec(),
            rows: VecDeque::new(),
            close_error: None,
        }
    }

    /// Add a row.
    ///
    /// # Panics
    ///
    /// Panics if the row width differs from the column count or a value
    /// cannot be encoded as its column type.
    pub fn row(mut self, values: &[&(dyn ToSql + Sync)]) -> Self {
        assert_eq!(
            values.len(),
            self.types.len(),
            "mock row has {} values for {} columns",
            values.len(),
            self.types.len()
        );
        let columns = values
            .iter()
            .zip(&self.types)
            .map(|(value, ty)| {
                RawColumn::encode(*value, ty.clone())
                    .unwrap_or_else(|e| panic!("cannot encode {value:?} as {ty}: {e}"))
            })
            .collect();
        self.rows.push_back(Ok(MockRow { columns }));
        self
    }

    /// Deliver `err` from the cursor at this position instead of a row.
    pub fn row_error(mut self, err: MockError) -> Self {
        self.rows.push_back(Err(err));
        self
    }

    /// Fail the cursor's close with `err`.
    pub fn close_error(mut self, err: MockError) -> Self {
        self.close_error = Some(err);
        self
    }
}

/// A scripted row.
#[derive(Debug, Clone)]
pub struct MockRow {
    columns: Vec<RawColumn>,
}

impl ScanRow for MockRow {
    fn column_count(&self) -> usize {
        self.columns.len()
    }

    fn column(&self, index: usize) -> Result<RawColumn, BoxError> {
        self.columns
            .get(index)
            .cloned()
            .ok_or_else(|| MockError::new(format!("column index {index} out of range")).into())
    }
}

#[derive(Default)]
struct State {
    expected: VecDeque<Expectation>,
    events: Vec<Event>,
    failures: Vec<String>,
    open_cursors: usize,
}

/// In-memory backend: executor, queryer, and connection in one.
///
/// Clones share the same script and event log.
#[derive(Clone, Default)]
pub struct MockDb {
    state: Arc<Mutex<State>>,
}

impl MockDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an expectation.
    pub fn expect(&self, expectation: Expectation) -> &Self {
        self.lock().expected.push_back(expectation);
        self
    }

    /// Every call observed so far, in order.
    pub fn events(&self) -> Vec<Event> {
        self.lock().events.clone()
    }

    fn count(&self, event: &Event) -> usize {
        self.lock().events.iter().filter(|e| *e == event).count()
    }

    /// Rows handed out by cursors (each one was scanned or failed to scan).
    pub fn rows_delivered(&self) -> usize {
        self.count(&Event::NextRow)
    }

    pub fn cursor_closes(&self) -> usize {
        self.count(&Event::CloseRows)
    }

    pub fn commits(&self) -> usize {
        self.count(&Event::Commit)
    }

    pub fn rollbacks(&self) -> usize {
        self.count(&Event::Rollback)
    }

    /// Fails if an expectation is left over, a call did not match, or a
    /// cursor is still open.
    pub fn expectations_were_met(&self) -> Result<(), MockError> {
        let state = self.lock();
        let mut problems = state.failures.clone();
        problems.extend(
            state
                .expected
                .iter()
                .map(|e| format!("{} expectation not met: {:?}", e.kind, e.sql)),
        );
        if state.open_cursors > 0 {
            problems.push(format!("{} cursor(s) left open", state.open_cursors));
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(MockError::new(problems.join("; ")))
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, event: Event) {
        self.lock().events.push(event);
    }

    fn take(
        &self,
        kind: Kind,
        sql: Option<&str>,
        args: &[&(dyn ToSql + Sync)],
        event: Event,
    ) -> Result<Expectation, MockError> {
        let mut state = self.lock();
        state.events.push(event);
        let Some(next) = state.expected.pop_front() else {
            let problem = format!("unexpected {kind} call {sql:?}: no expectations left");
            state.failures.push(problem.clone());
            return Err(MockError::new(problem));
        };
        let problem = if next.kind != kind {
            Some(format!("unexpected {kind} call {sql:?}: next expectation is {}", next.kind))
        } else if next.sql.is_some() && next.sql.as_deref() != sql {
            Some(format!("{kind} call {sql:?} does not match expected {:?}", next.sql))
        } else {
            let got: Vec<String> = args.iter().map(|arg| format!("{arg:?}")).collect();
            match &next.args {
                Some(expected) if *expected != got => Some(format!(
                    "{kind} call {sql:?} has args {got:?}, expected {expected:?}"
                )),
                _ => None,
            }
        };
        match problem {
            Some(problem) => {
                state.expected.push_front(next);
                state.failures.push(problem.clone());
                Err(MockError::new(problem))
            }
            None => Ok(next),
        }
    }

    /// A dropped, unfinished transaction rolls back; consume a matching
    /// rollback expectation if one is next.
    fn implicit_rollback(&self) {
        let mut state = self.lock();
        state.events.push(Event::Rollback);
        if state
            .expected
            .front()
            .is_some_and(|e| e.kind == Kind::Rollback)
        {
            state.expected.pop_front();
        }
    }

    fn open_cursor(&self, rows: MockRows) -> MockCursor {
        self.lock().open_cursors += 1;
        MockCursor {
            rows: rows.rows,
            close_error: rows.close_error,
            db: self.clone(),
            closed: false,
        }
    }

    fn release_cursor(&self, event: Event) {
        let mut state = self.lock();
        state.events.push(event);
        state.open_cursors = state.open_cursors.saturating_sub(1);
    }
}

impl fmt::Debug for MockDb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("MockDb")
            .field("expected", &state.expected.len())
            .field("events", &state.events)
            .finish()
    }
}

async fn answer<T>(
    ctx: &Context,
    delay: Option<Duration>,
    reply: Result<T, MockError>,
) -> Result<T, BoxError> {
    ctx.run(async move {
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        reply
    })
    .await
}

impl Executor for MockDb {
    async fn exec(
        &self,
        ctx: &Context,
        sql: &str,
        args: &[&(dyn ToSql + Sync)],
    ) -> Result<ExecResult, BoxError> {
        let expectation = self.take(Kind::Exec, Some(sql), args, Event::Exec(sql.to_owned()))?;
        let reply = match expectation.outcome {
            Outcome::Exec(result) => Ok(result),
            Outcome::Fail(err) => Err(err),
            Outcome::Done | Outcome::Rows(_) => Ok(ExecResult::default()),
        };
        answer(ctx, expectation.delay, reply).await
    }
}

impl Queryer for MockDb {
    type Row = MockRow;
    type Rows = MockCursor;

    async fn query_row(
        &self,
        ctx: &Context,
        sql: &str,
        args: &[&(dyn ToSql + Sync)],
    ) -> Result<Option<MockRow>, BoxError> {
        let expectation =
            self.take(Kind::Query, Some(sql), args, Event::QueryRow(sql.to_owned()))?;
        let reply = match expectation.outcome {
            Outcome::Rows(rows) => rows.rows.into_iter().next().transpose(),
            Outcome::Fail(err) => Err(err),
            Outcome::Done | Outcome::Exec(_) => Ok(None),
        };
        answer(ctx, expectation.delay, reply).await
    }

    async fn query(
        &self,
        ctx: &Context,
        sql: &str,
        args: &[&(dyn ToSql + Sync)],
    ) -> Result<MockCursor, BoxError> {
        let expectation = self.take(Kind::Query, Some(sql), args, Event::Query(sql.to_owned()))?;
        let reply = match expectation.outcome {
            Outcome::Rows(rows) => Ok(rows),
            Outcome::Fail(err) => Err(err),
            Outcome::Done | Outcome::Exec(_) => Ok(MockRows::new(&[])),
        };
        let rows = answer(ctx, expectation.delay, reply).await?;
        Ok(self.open_cursor(rows))
    }
}

impl Connection for MockDb {
    type Tx<'c> = MockTx;

    async fn begin(&mut self, ctx: &Context, opts: &TxOptions) -> Result<MockTx, BoxError> {
        let expectation = self.take(Kind::Begin, None, &[], Event::Begin(*opts))?;
        let reply = match expectation.outcome {
            Outcome::Fail(err) => Err(err),
            _ => Ok(()),
        };
        answer(ctx, expectation.delay, reply).await?;
        Ok(MockTx {
            db: self.clone(),
            done: false,
        })
    }
}

/// Cursor over scripted rows.
#[derive(Debug)]
pub struct MockCursor {
    rows: VecDeque<Result<MockRow, MockError>>,
    close_error: Option<MockError>,
    db: MockDb,
    closed: bool,
}

impl Cursor for MockCursor {
    type Row = MockRow;

    async fn next_row(&mut self) -> Option<Result<MockRow, BoxError>> {
        let next = self.rows.pop_front()?;
        match next {
            Ok(row) => {
                self.db.record(Event::NextRow);
                Some(Ok(row))
            }
            Err(err) => {
                self.db.record(Event::RowError);
                Some(Err(err.into()))
            }
        }
    }

    async fn close(mut self) -> Result<(), BoxError> {
        self.closed = true;
        self.db.release_cursor(Event::CloseRows);
        match self.close_error.take() {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }
}

impl Drop for MockCursor {
    fn drop(&mut self) {
        if !self.closed {
            self.db.release_cursor(Event::DropRows);
        }
    }
}

/// Transaction on a [`MockDb`]. Dropping it unfinished records a rollback.
#[derive(Debug)]
pub struct MockTx {
    db: MockDb,
    done: bool,
}

impl MockTx {
    fn finish(&mut self, kind: Kind, event: Event) -> Result<Expectation, MockError> {
        self.done = true;
        self.db.take(kind, None, &[], event)
    }
}

impl Executor for MockTx {
    async fn exec(
        &self,
        ctx: &Context,
        sql: &str,
        args: &[&(dyn ToSql + Sync)],
    ) -> Result<ExecResult, BoxError> {
        self.db.exec(ctx, sql, args).await
    }
}

impl Queryer for MockTx {
    type Row = MockRow;
    type Rows = MockCursor;

    async fn query_row(
        &self,
        ctx: &Context,
        sql: &str,
        args: &[&(dyn ToSql + Sync)],
    ) -> Result<Option<MockRow>, BoxError> {
        self.db.query_row(ctx, sql, args).await
    }

    async fn query(
        &self,
        ctx: &Context,
        sql: &str,
        args: &[&(dyn ToSql + Sync)],
    ) -> Result<MockCursor, BoxError> {
        Queryer::query(&self.db, ctx, sql, args).await
    }
}

impl Transaction for MockTx {
    async fn commit(mut self) -> Result<(), BoxError> {
        match self.finish(Kind::Commit, Event::Commit)?.outcome {
            Outcome::Fail(err) => Err(err.into()),
            _ => Ok(()),
        }
    }

    async fn rollback(mut self) -> Result<(), BoxError> {
        match self.finish(Kind::Rollback, Event::Rollback)?.outcome {
            Outcome::Fail(err) => Err(err.into()),
            _ => Ok(()),
        }
    }
}

impl Drop for MockTx {
    fn drop(&mut self) {
        if !self.done {
            self.db.implicit_rollback();
        }
    }
}
