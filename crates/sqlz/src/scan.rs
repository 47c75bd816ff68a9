//! Scan targets: where fetched column values land.
//!
//! A [`Slot`] is a shared cell. Bind a slot to a statement with
//! [`Stmt::scan`](crate::Stmt::scan) and keep your own handle to read the value
//! after each row is scanned:
//!
//! ```ignore
//! let id = Slot::<i64>::new();
//! let name = Slot::<String>::new();
//! let mut users = Vec::new();
//!
//! stmt("select")
//!     .append("id,").scan(&id)
//!     .append("name,").scan(&name)
//!     .trim(",")
//!     .append("from users")
//!     .fetch_each(&ctx, &client, || {
//!         users.push((id.get().unwrap_or_default(), name.take().unwrap_or_default()));
//!         true
//!     })
//!     .await?;
//! ```
//!
//! Value conversion is the driver's: a slot of `T` accepts exactly the column
//! types `T: FromSql` accepts. Use `Slot<Option<T>>` for nullable columns.

use crate::client::ScanRow;
use crate::error::{BoxError, ScanFault};
use bytes::BytesMut;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio_postgres::types::{FromSql, FromSqlOwned, IsNull, ToSql, Type, WrongType};

/// A column value as delivered by the backend, before conversion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawColumn {
    ty: Type,
    raw: Option<Vec<u8>>,
}

impl RawColumn {
    /// A column holding `raw` bytes in the binary wire format of `ty`.
    pub fn new(ty: Type, raw: Option<Vec<u8>>) -> Self {
        Self { ty, raw }
    }

    /// Encode `value` as a column of type `ty` with the driver's own `ToSql`.
    pub fn encode(value: &(dyn ToSql + Sync), ty: Type) -> Result<Self, BoxError> {
        let mut buf = BytesMut::new();
        let raw = match value.to_sql_checked(&ty, &mut buf)? {
            IsNull::Yes => None,
            IsNull::No => Some(buf.to_vec()),
        };
        Ok(Self { ty, raw })
    }

    pub fn type_(&self) -> &Type {
        &self.ty
    }

    pub fn is_null(&self) -> bool {
        self.raw.is_none()
    }

    /// Convert the column with the driver's `FromSql`.
    pub fn decode<T: FromSqlOwned>(&self) -> Result<T, BoxError> {
        if !T::accepts(&self.ty) {
            return Err(Box::new(WrongType::new::<T>(self.ty.clone())));
        }
        T::from_sql_nullable(&self.ty, self.raw.as_deref())
    }
}

impl<'a> FromSql<'a> for RawColumn {
    fn from_sql(ty: &Type, raw: &'a [u8]) -> Result<Self, BoxError> {
        Ok(Self::new(ty.clone(), Some(raw.to_vec())))
    }

    fn from_sql_null(ty: &Type) -> Result<Self, BoxError> {
        Ok(Self::new(ty.clone(), None))
    }

    fn accepts(_: &Type) -> bool {
        true
    }
}

/// An output binding: receives one column of each scanned row.
pub trait ScanTarget: Send + Sync {
    fn scan(&self, column: &RawColumn) -> Result<(), BoxError>;
}

/// Shared storage for one scanned column.
///
/// Clones share the same cell.
pub struct Slot<T> {
    cell: Arc<Mutex<Option<T>>>,
}

impl<T> Slot<T> {
    /// An empty slot.
    pub fn new() -> Self {
        Self {
            cell: Arc::new(Mutex::new(None)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<T>> {
        self.cell.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A copy of the current value.
    pub fn get(&self) -> Option<T>
    where
        T: Clone,
    {
        self.lock().as_ref().cloned()
    }

    pub fn take(&self) -> Option<T> {
        self.lock().take()
    }

    /// Store `value`, returning the previous one.
    pub fn replace(&self, value: T) -> Option<T> {
        self.lock().replace(value)
    }

    pub fn is_set(&self) -> bool {
        self.lock().is_some()
    }
}

impl<T> Clone for Slot<T> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<T> Default for Slot<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: fmt::Debug> fmt::Debug for Slot<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Slot").field(&*self.lock()).finish()
    }
}

impl<T> ScanTarget for Slot<T>
where
    T: FromSqlOwned + Send + 'static,
{
    fn scan(&self, column: &RawColumn) -> Result<(), BoxError> {
        let value = column.decode::<T>()?;
        self.replace(value);
        Ok(())
    }
}

/// Scan `row` into `targets`, column `i` into target `i`.
pub(crate) fn scan_row<R>(row: &R, targets: &[Box<dyn ScanTarget>]) -> Result<(), BoxError>
where
    R: ScanRow,
{
    let columns = row.column_count();
    if columns != targets.len() {
        return Err(Box::new(ScanFault::ColumnCount {
            expected: columns,
            got: targets.len(),
        }));
    }
    for (index, target) in targets.iter().enumerate() {
        let column = row.column(index)?;
        target.scan(&column).map_err(|source| ScanFault::Convert {
            index,
            ty: column.type_().to_string(),
            source,
        })?;
    }
    Ok(())
}

impl ScanRow for tokio_postgres::Row {
    fn column_count(&self) -> usize {
        self.len()
    }

    fn column(&self, index: usize) -> Result<RawColumn, BoxError> {
        let column: RawColumn = self.try_get(index)?;
        Ok(column)
    }
}
