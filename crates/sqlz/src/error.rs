//! Error types for sqlz

use thiserror::Error;

/// Boxed error produced by a backend capability (driver, cursor, transaction).
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result type alias for sqlz operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by statement execution and the transaction guard.
///
/// Statement errors carry the full SQL text so a failing call site can be
/// identified from the message alone. The backend error is always kept as the
/// `source` and can be recovered with [`std::error::Error::source`] and
/// `downcast_ref`.
#[derive(Debug, Error)]
pub enum Error {
    /// The executor rejected the statement.
    #[error("execute statement; sql={sql:?}: {source}")]
    Exec {
        sql: String,
        #[source]
        source: BoxError,
    },

    /// The query could not be issued; no row was read.
    #[error("execute query; sql={sql:?}: {source}")]
    Query {
        sql: String,
        #[source]
        source: BoxError,
    },

    /// A row could not be converted into the bound scan targets.
    ///
    /// Also raised by single-row fetches that produce no row.
    #[error("scan row; sql={sql:?}: {source}")]
    Scan {
        sql: String,
        #[source]
        source: BoxError,
    },

    /// Releasing the result cursor failed.
    #[error("close rows; sql={sql:?}: {source}")]
    Close {
        sql: String,
        #[source]
        source: BoxError,
    },

    /// The cursor reported a row-level fault while delivering rows.
    #[error("iterate rows; sql={sql:?}: {source}")]
    Iterate {
        sql: String,
        #[source]
        source: BoxError,
    },

    /// Opening a transaction failed.
    #[error("begin tx: {source}")]
    Begin {
        #[source]
        source: BoxError,
    },

    /// Committing a transaction failed.
    #[error("commit tx: {source}")]
    Commit {
        #[source]
        source: BoxError,
    },
}

impl Error {
    pub(crate) fn exec(sql: &str, source: BoxError) -> Self {
        Self::Exec {
            sql: sql.to_owned(),
            source,
        }
    }

    pub(crate) fn query(sql: &str, source: BoxError) -> Self {
        Self::Query {
            sql: sql.to_owned(),
            source,
        }
    }

    pub(crate) fn scan(sql: &str, source: BoxError) -> Self {
        Self::Scan {
            sql: sql.to_owned(),
            source,
        }
    }

    pub(crate) fn close(sql: &str, source: BoxError) -> Self {
        Self::Close {
            sql: sql.to_owned(),
            source,
        }
    }

    pub(crate) fn iterate(sql: &str, source: BoxError) -> Self {
        Self::Iterate {
            sql: sql.to_owned(),
            source,
        }
    }

    /// The SQL text of the failing statement, if this is a statement error.
    pub fn sql(&self) -> Option<&str> {
        match self {
            Self::Exec { sql, .. }
            | Self::Query { sql, .. }
            | Self::Scan { sql, .. }
            | Self::Close { sql, .. }
            | Self::Iterate { sql, .. } => Some(sql),
            Self::Begin { .. } | Self::Commit { .. } => None,
        }
    }

    /// The backend error this error wraps.
    pub fn backend(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
        match self {
            Self::Exec { source, .. }
            | Self::Query { source, .. }
            | Self::Scan { source, .. }
            | Self::Close { source, .. }
            | Self::Iterate { source, .. }
            | Self::Begin { source }
            | Self::Commit { source } => source.as_ref(),
        }
    }

    /// Check if a single-row fetch found no row
    pub fn is_no_rows(&self) -> bool {
        matches!(
            self,
            Self::Scan { source, .. }
                if matches!(source.downcast_ref::<ScanFault>(), Some(ScanFault::NoRows))
        )
    }

    /// Check if the wrapped backend call ran past its context deadline
    pub fn is_deadline_exceeded(&self) -> bool {
        self.backend()
            .downcast_ref::<crate::context::DeadlineExceeded>()
            .is_some()
    }
}

/// Scan failures detected by sqlz itself rather than by the driver.
#[derive(Debug, Error)]
pub enum ScanFault {
    /// A single-row fetch returned nothing.
    #[error("no rows in result set")]
    NoRows,

    /// The row width does not match the number of scan targets.
    #[error("expected {expected} destination arguments in scan, not {got}")]
    ColumnCount { expected: usize, got: usize },

    /// The driver could not convert a column into its target.
    #[error("converting column {index} of type {ty}: {source}")]
    Convert {
        index: usize,
        ty: String,
        #[source]
        source: BoxError,
    },
}
