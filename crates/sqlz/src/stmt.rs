//! Fluent SQL statement builder.
//!
//! A [`Stmt`] accumulates SQL text from fragments and keeps two ordered lists
//! next to it: bind arguments for the placeholders and scan targets for the
//! result columns. Appending a fragment and its argument (or target) in the
//! same step keeps the three in lockstep without a template language.
//!
//! # Example
//!
//! ```ignore
//! use sqlz::{Context, stmt};
//!
//! let mut s = stmt("insert into foo ( a, b, c ) values (");
//! for v in [1, 2, 3] {
//!     s = s.append("?,").bind(v);
//! }
//! let result = s.trim(",").append(")").execute(&Context::background(), &db).await?;
//! ```
//!
//! Fragments are joined with a single space unless the previous fragment
//! already ends in one. Placeholder syntax is whatever the backend expects;
//! sqlz does not look inside the text.

use crate::client::{Cursor, ExecResult, Executor, Queryer};
use crate::context::Context;
use crate::error::{BoxError, Error, Result, ScanFault};
use crate::scan::{ScanTarget, Slot, scan_row};
use futures_util::FutureExt;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio_postgres::types::{FromSqlOwned, ToSql};

#[cfg(test)]
mod tests;

/// A SQL statement under construction.
///
/// Every builder method takes and returns the statement, so a statement is
/// usually built and run in one chain. Running it (`execute`, `fetch_one`,
/// `fetch_each`) consumes it.
#[must_use]
pub struct Stmt {
    sql: String,
    last_char: char,
    args: Vec<Arc<dyn ToSql + Sync + Send>>,
    targets: Vec<Box<dyn ScanTarget>>,
    tag: Option<String>,
}

/// Start building a SQL statement.
///
/// # Panics
///
/// Panics if `fragment` is empty.
pub fn stmt(fragment: impl Into<String>) -> Stmt {
    Stmt::new(fragment)
}

impl Stmt {
    /// Create a statement from its first fragment.
    ///
    /// # Panics
    ///
    /// Panics if `fragment` is empty.
    pub fn new(fragment: impl Into<String>) -> Self {
        let sql = fragment.into();
        let last_char = last_char(&sql);
        Self {
            sql,
            last_char,
            args: Vec::new(),
            targets: Vec::new(),
            tag: None,
        }
    }

    /// Append a fragment, separated from the text so far by one space unless
    /// the text already ends with a space.
    ///
    /// # Panics
    ///
    /// Panics if `fragment` is empty.
    pub fn append(mut self, fragment: &str) -> Self {
        let next_last = last_char(fragment);
        if self.last_char != ' ' {
            self.sql.push(' ');
        }
        self.sql.push_str(fragment);
        self.last_char = next_last;
        self
    }

    /// Remove `fragment` from the end of the text if the text ends with it.
    ///
    /// Typical use is dropping the separator left behind by a loop:
    /// `.append("a,").append("b,").trim(",")`.
    pub fn trim(mut self, fragment: &str) -> Self {
        if !fragment.is_empty() && self.sql.ends_with(fragment) {
            self.sql.truncate(self.sql.len() - fragment.len());
            // An emptied buffer takes the next fragment without a separator.
            self.last_char = self.sql.chars().next_back().unwrap_or(' ');
        }
        self
    }

    /// Bind a value to the next placeholder.
    pub fn bind<T>(mut self, value: T) -> Self
    where
        T: ToSql + Sync + Send + 'static,
    {
        self.args.push(Arc::new(value));
        self
    }

    /// Bind an already type-erased value to the next placeholder.
    pub fn bind_value(mut self, value: Arc<dyn ToSql + Sync + Send>) -> Self {
        self.args.push(value);
        self
    }

    /// Bind several values, in iteration order.
    pub fn bind_all<I, T>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: ToSql + Sync + Send + 'static,
    {
        self.args.extend(
            values
                .into_iter()
                .map(|v| Arc::new(v) as Arc<dyn ToSql + Sync + Send>),
        );
        self
    }

    /// Scan the next result column into `slot`.
    ///
    /// The statement keeps its own handle to the slot; read the value through
    /// yours.
    pub fn scan<T>(mut self, slot: &Slot<T>) -> Self
    where
        T: FromSqlOwned + Send + 'static,
    {
        self.targets.push(Box::new(slot.clone()));
        self
    }

    /// Scan the next result column into a custom target.
    pub fn scan_target(mut self, target: Box<dyn ScanTarget>) -> Self {
        self.targets.push(target);
        self
    }

    /// Add several scan targets, in iteration order.
    pub fn scan_all<I>(mut self, targets: I) -> Self
    where
        I: IntoIterator<Item = Box<dyn ScanTarget>>,
    {
        self.targets.extend(targets);
        self
    }

    /// Label the statement in log events.
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    /// The SQL text accumulated so far.
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Number of bound arguments.
    pub fn arg_count(&self) -> usize {
        self.args.len()
    }

    /// Number of scan targets.
    pub fn target_count(&self) -> usize {
        self.targets.len()
    }

    /// Get bound arguments as references (for passing to a backend).
    pub fn params_ref(&self) -> Vec<&(dyn ToSql + Sync)> {
        self.args
            .iter()
            .map(|p| p.as_ref() as &(dyn ToSql + Sync))
            .collect()
    }

    /// Run the statement as a command.
    ///
    /// The backend's result is returned as is.
    pub async fn execute<E>(self, ctx: &Context, executor: &E) -> Result<ExecResult>
    where
        E: Executor,
    {
        self.trace("execute");
        let params = self.params_ref();
        executor
            .exec(ctx, &self.sql, &params)
            .await
            .map_err(|source| Error::exec(&self.sql, source))
    }

    /// Run the statement as a query and scan its first row into the targets.
    ///
    /// Fails with [`Error::Scan`] if there is no row (see [`Error::is_no_rows`]).
    pub async fn fetch_one<Q>(self, ctx: &Context, queryer: &Q) -> Result<()>
    where
        Q: Queryer,
    {
        self.trace("fetch_one");
        let params = self.params_ref();
        let row = queryer
            .query_row(ctx, &self.sql, &params)
            .await
            .map_err(|source| Error::query(&self.sql, source))?
            .ok_or_else(|| Error::scan(&self.sql, Box::new(ScanFault::NoRows)))?;
        scan_row(&row, &self.targets).map_err(|source| Error::scan(&self.sql, source))
    }

    /// Run the statement as a query, scanning each row into the targets and
    /// then calling `on_row`.
    ///
    /// Iteration stops at the first `false` from `on_row`. The cursor is
    /// closed exactly once, however the loop ends, including when `on_row`
    /// panics (the panic resumes after the close). When several things fail,
    /// the reported error is the first of: scan error, close error, row-level
    /// error from the cursor.
    pub async fn fetch_each<Q, F>(self, ctx: &Context, queryer: &Q, mut on_row: F) -> Result<()>
    where
        Q: Queryer,
        F: FnMut() -> bool,
    {
        self.trace("fetch_each");
        let params = self.params_ref();
        let mut rows = queryer
            .query(ctx, &self.sql, &params)
            .await
            .map_err(|source| Error::query(&self.sql, source))?;

        let targets = &self.targets;
        let looped = AssertUnwindSafe(async {
            while let Some(next) = rows.next_row().await {
                let row = match next {
                    Ok(row) => row,
                    Err(e) => return Stop::Iterate(e),
                };
                if let Err(e) = scan_row(&row, targets) {
                    return Stop::Scan(e);
                }
                if !on_row() {
                    break;
                }
            }
            Stop::Done
        })
        .catch_unwind()
        .await;

        let closed = rows.close().await;
        let stop = match looped {
            Ok(stop) => stop,
            Err(panic) => {
                if let Err(_close_err) = closed {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(sql = %self.sql, error = %_close_err, "discarding close error after callback panic");
                }
                std::panic::resume_unwind(panic)
            }
        };
        match stop {
            Stop::Scan(source) => {
                if let Err(_close_err) = closed {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(sql = %self.sql, error = %_close_err, "discarding close error after scan failure");
                }
                Err(Error::scan(&self.sql, source))
            }
            Stop::Iterate(source) => {
                closed.map_err(|source| Error::close(&self.sql, source))?;
                Err(Error::iterate(&self.sql, source))
            }
            Stop::Done => closed.map_err(|source| Error::close(&self.sql, source)),
        }
    }

    fn trace(&self, _op: &'static str) {
        #[cfg(feature = "tracing")]
        tracing::debug!(
            op = _op,
            sql = %self.sql,
            args = self.args.len(),
            targets = self.targets.len(),
            tag = self.tag.as_deref(),
            "sending statement"
        );
    }
}

impl fmt::Debug for Stmt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stmt")
            .field("sql", &self.sql)
            .field("args", &self.args)
            .field("targets", &self.targets.len())
            .field("tag", &self.tag)
            .finish()
    }
}

/// How the row loop of `fetch_each` ended.
enum Stop {
    Done,
    Scan(BoxError),
    Iterate(BoxError),
}

fn last_char(fragment: &str) -> char {
    match fragment.chars().next_back() {
        Some(c) => c,
        None => panic!("sql fragment must not be empty"),
    }
}
