use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_postgres::Client;
use tracing::{debug, info, warn};

use super::types::{
    backfill_row_cap, quote_ident, quote_literal, BackfillBatch, ColumnKind, Row, TableName,
    TableSchema, Value,
};
use crate::{Error, Result};

const CURSOR: &str = "truck_backfill";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Reading,
    Finished,
    Failed,
}

/// Reads one table inside an exported snapshot, batch by batch.
///
/// The stream owns a dedicated session. It opens a repeatable-read,
/// read-only transaction, imports the snapshot and walks a server-side
/// cursor. Once the table is exhausted the transaction is rolled back and
/// `next_batch` keeps returning `None`. A failed read abandons the stream.
pub struct BackfillStream {
    client: Client,
    connection: JoinHandle<()>,
    table: TableName,
    schema: TableSchema,
    batch_size: usize,
    state: State,
    rows_read: u64,
}

impl BackfillStream {
    pub async fn open(
        url: &str,
        connect_timeout: Duration,
        table: TableName,
        schema: TableSchema,
        snapshot: &str,
        batch_size: usize,
    ) -> Result<Self> {
        let (client, connection) = super::connect(url, connect_timeout)
            .await
            .map_err(|e| backfill_error(&table, e))?;

        let batch_size = batch_size.min(backfill_row_cap(schema.len())).max(1);
        let stream = Self {
            client,
            connection,
            table,
            schema,
            batch_size,
            state: State::Reading,
            rows_read: 0,
        };

        let begin = format!(
            "BEGIN ISOLATION LEVEL REPEATABLE READ READ ONLY;\n\
             SET TRANSACTION SNAPSHOT {};\n\
             DECLARE {} NO SCROLL CURSOR FOR {}",
            quote_literal(snapshot),
            CURSOR,
            select_statement(&stream.table, &stream.schema)
        );
        if let Err(e) = stream.client.batch_execute(&begin).await {
            stream.connection.abort();
            return Err(backfill_error(&stream.table, e));
        }

        info!(
            "Backfilling {} from snapshot {} in batches of {}",
            stream.table, snapshot, stream.batch_size
        );
        Ok(stream)
    }

    pub fn table(&self) -> &TableName {
        &self.table
    }

    pub fn rows_read(&self) -> u64 {
        self.rows_read
    }

    /// Next batch of at most `batch_size` rows, or `None` at the end.
    pub async fn next_batch(&mut self) -> Result<Option<BackfillBatch>> {
        match self.state {
            State::Finished => return Ok(None),
            State::Failed => {
                return Err(backfill_error(&self.table, "stream abandoned after an earlier failure"))
            }
            State::Reading => {}
        }

        let rows = match self.fetch().await {
            Ok(rows) => rows,
            Err(e) => {
                self.state = State::Failed;
                self.connection.abort();
                return Err(backfill_error(&self.table, e));
            }
        };

        if rows.len() < self.batch_size {
            self.finish().await;
        }
        if rows.is_empty() {
            return Ok(None);
        }

        self.rows_read += rows.len() as u64;
        debug!("Read {} rows from {} ({} total)", rows.len(), self.table, self.rows_read);
        Ok(Some(BackfillBatch {
            table: self.table.clone(),
            columns: self.schema.clone(),
            rows,
        }))
    }

    async fn fetch(&self) -> std::result::Result<Vec<Row>, tokio_postgres::Error> {
        let query = format!("FETCH FORWARD {} FROM {}", self.batch_size, CURSOR);
        let rows = self.client.query(query.as_str(), &[]).await?;
        rows.iter()
            .map(|row| {
                (0..row.len())
                    .map(|i| row.try_get::<_, Value>(i))
                    .collect::<std::result::Result<Row, _>>()
            })
            .collect()
    }

    async fn finish(&mut self) {
        self.state = State::Finished;
        if let Err(e) = self.client.batch_execute("ROLLBACK").await {
            warn!("Failed to end snapshot transaction for {}: {}", self.table, e);
        }
        self.connection.abort();
        info!("Backfill of {} read {} rows", self.table, self.rows_read);
    }
}

impl Drop for BackfillStream {
    fn drop(&mut self) {
        self.connection.abort();
    }
}

fn backfill_error(table: &TableName, e: impl ToString) -> Error {
    Error::Backfill {
        table: table.to_string(),
        message: e.to_string(),
    }
}

/// `SELECT` over every column, casting types without a native mapping to
/// text.
fn select_statement(table: &TableName, schema: &TableSchema) -> String {
    let columns: Vec<_> = schema
        .iter()
        .map(|column| match column.kind {
            ColumnKind::Other => format!("{}::text", quote_ident(&column.name)),
            _ => quote_ident(&column.name),
        })
        .collect();
    format!("SELECT {} FROM {}", columns.join(", "), table.quoted())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::postgres::Column;

    #[test]
    fn test_select_statement_casts_unmapped_types() {
        let schema = vec![
            Column::new("id", "integer"),
            Column::new("price", "numeric(10,2)"),
            Column::new("tags", "text[]"),
            Column::new("name", "text"),
        ];
        let sql = select_statement(&TableName::new("public", "whiskies"), &schema);
        assert_eq!(
            sql,
            "SELECT \"id\", \"price\"::text, \"tags\"::text, \"name\" FROM \"public\".\"whiskies\""
        );
    }
}
