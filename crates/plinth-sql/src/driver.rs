//! Driver seam: the transactional relational backend the engine talks to.

use crate::error::Result;
use crate::statement::{Delete, Insert, Select, TableDef, Update};
use crate::value::Row;

/// A relational backend.
///
/// The engine issues structured statements; the driver owns connections,
/// transactions, and physical storage. Auto-commit convenience methods wrap
/// a statement in its own transaction.
pub trait Driver: Send + Sync {
    /// Create a table if it does not exist yet.
    fn create_table(&self, table: &TableDef) -> Result<()>;

    /// Begin a transaction.
    fn begin(&self) -> Result<Box<dyn DriverTransaction + '_>>;

    /// Run a select outside any transaction.
    fn select(&self, stmt: &Select) -> Result<Vec<Row>> {
        let mut tx = self.begin()?;
        let rows = tx.select(stmt)?;
        tx.commit()?;
        Ok(rows)
    }

    /// Run an insert in its own transaction.
    fn insert(&self, stmt: &Insert) -> Result<u64> {
        let mut tx = self.begin()?;
        let n = tx.insert(stmt)?;
        tx.commit()?;
        Ok(n)
    }

    /// Run an update in its own transaction.
    fn update(&self, stmt: &Update) -> Result<u64> {
        let mut tx = self.begin()?;
        let n = tx.update(stmt)?;
        tx.commit()?;
        Ok(n)
    }

    /// Run a delete in its own transaction.
    fn delete(&self, stmt: &Delete) -> Result<u64> {
        let mut tx = self.begin()?;
        let n = tx.delete(stmt)?;
        tx.commit()?;
        Ok(n)
    }
}

/// An open transaction.
///
/// Dropping without `commit` discards all changes.
pub trait DriverTransaction {
    /// Run a select inside the transaction.
    fn select(&mut self, stmt: &Select) -> Result<Vec<Row>>;

    /// Insert rows; returns the number of rows written.
    fn insert(&mut self, stmt: &Insert) -> Result<u64>;

    /// Update rows; returns the number of rows affected.
    fn update(&mut self, stmt: &Update) -> Result<u64>;

    /// Delete rows; returns the number of rows removed.
    fn delete(&mut self, stmt: &Delete) -> Result<u64>;

    /// Commit the transaction.
    fn commit(self: Box<Self>) -> Result<()>;

    /// Roll the transaction back explicitly.
    fn rollback(self: Box<Self>) -> Result<()>;
}
