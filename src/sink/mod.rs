//! Pipeline endpoints: enrichment readers and sink writers.

use async_trait::async_trait;

use crate::postgres::{Column, Lsn, Operation, Row, TableName};
use crate::Result;

#[cfg(test)]
pub(crate) mod memory;
pub mod postgres;
pub mod rows;

pub use self::postgres::{IdentityReader, PostgresWriter, QueryReader};

/// Rows with the column layout they share.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RowSet {
    pub columns: Vec<Column>,
    pub rows: Vec<Row>,
}

impl RowSet {
    pub fn new(columns: Vec<Column>, rows: Vec<Row>) -> Self {
        Self { columns, rows }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Turns decoded rows into the rows a pipeline writes.
#[async_trait]
pub trait EnrichmentReader: Send {
    async fn read(
        &mut self,
        operation: Operation,
        table: &TableName,
        columns: &[Column],
        rows: &[Row],
    ) -> Result<RowSet>;

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Destination of a pipeline. Holds the pipeline's checkpoint so rows and
/// checkpoint commit together.
#[async_trait]
pub trait Writer: Send {
    /// Creates checkpoint storage if needed.
    async fn setup_checkpoint_storage(&mut self) -> Result<()>;

    /// Stored checkpoint, zero when none was ever written.
    async fn checkpoint(&mut self) -> Result<Lsn>;

    /// Raises the checkpoint; never lowers it.
    async fn set_checkpoint(&mut self, lsn: Lsn) -> Result<()>;

    /// Writes rows that originate from `table`, returning the affected row
    /// count.
    async fn write(&mut self, operation: Operation, table: &TableName, rows: &RowSet)
        -> Result<u64>;

    async fn truncate(&mut self, table: &TableName) -> Result<()>;

    async fn begin(&mut self) -> Result<()>;

    async fn commit(&mut self) -> Result<()>;

    async fn rollback(&mut self) -> Result<()>;

    async fn close(&mut self) -> Result<()>;
}
