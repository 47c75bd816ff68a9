//! # sqlz
//!
//! A small fluent builder for SQL statements, plus a transaction guard.
//!
//! ## Features
//!
//! - **Fragments, not templates**: build SQL text piece by piece; fragments are
//!   joined with single spaces and a trailing separator can be trimmed once.
//! - **Lockstep bindings**: bind arguments and scan targets are appended next
//!   to the fragment they belong to and matched by position.
//! - **Careful iteration**: multi-row fetches stop early on request and always
//!   close the cursor exactly once.
//! - **Commit or roll back**: the transaction guard commits on success, rolls
//!   back on error or panic, and reports commit failures.
//!
//! ## Statements
//!
//! ```ignore
//! use sqlz::{Context, Slot, stmt};
//!
//! let ctx = Context::background();
//! let (a, b) = (Slot::<i32>::new(), Slot::<i32>::new());
//!
//! stmt("select")
//!     .append("a,").scan(&a)
//!     .append("b,").scan(&b)
//!     .trim(",")
//!     .append("from foo where id = $1").bind(7_i32)
//!     .fetch_one(&ctx, &client)
//!     .await?;
//! ```
//!
//! ## Transactions
//!
//! ```ignore
//! use sqlz::{Context, Error, TxOptions, begin, stmt};
//!
//! async fn transfer(client: &mut tokio_postgres::Client) -> Result<(), Error> {
//!     let ctx = Context::background();
//!     let tx = begin(&ctx, client, &TxOptions::new()).await?;
//!     let outcome = async {
//!         stmt("update accounts set balance = balance - 100 where id = 1")
//!             .execute(&ctx, &*tx)
//!             .await?;
//!         Ok::<_, Error>(())
//!     }
//!     .await;
//!     tx.close(outcome).await
//! }
//! ```

pub mod client;
pub mod context;
pub mod error;
pub mod postgres;
pub mod scan;
pub mod stmt;
pub mod transaction;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use client::{Connection, Cursor, ExecResult, Executor, Queryer, ScanRow, Transaction};
pub use context::{Context, DeadlineExceeded};
pub use error::{BoxError, Error, Result, ScanFault};
pub use postgres::PgRows;
pub use scan::{RawColumn, ScanTarget, Slot};
pub use stmt::{Stmt, stmt};
pub use transaction::{IsolationLevel, TxGuard, TxOptions, begin, with_transaction};
