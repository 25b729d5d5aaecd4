use async_trait::async_trait;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_postgres::Client;
use tracing::{debug, info};

use super::rows::{params, render, rows_per_statement, text_projection};
use super::{EnrichmentReader, RowSet, Writer};
use crate::checkpoint::CheckpointStore;
use crate::config::{ReadConfig, WriteConfig};
use crate::postgres::{self as pg, Column, Lsn, Operation, Row, TableName, Value};
use crate::Result;

/// Passes decoded rows through unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityReader;

#[async_trait]
impl EnrichmentReader for IdentityReader {
    async fn read(
        &mut self,
        _operation: Operation,
        _table: &TableName,
        columns: &[Column],
        rows: &[Row],
    ) -> Result<RowSet> {
        Ok(RowSet::new(columns.to_vec(), rows.to_vec()))
    }
}

/// Runs the pipeline's read template against the source database. An
/// operation without a template passes rows through.
pub struct QueryReader {
    client: Client,
    connection: JoinHandle<()>,
    templates: ReadConfig,
}

impl QueryReader {
    pub async fn connect(url: &str, connect_timeout: Duration, templates: ReadConfig) -> Result<Self> {
        let (client, connection) = pg::connect(url, connect_timeout).await?;
        Ok(Self {
            client,
            connection,
            templates,
        })
    }

    fn template(&self, operation: Operation) -> Option<&str> {
        match operation {
            Operation::Insert => self.templates.insert.as_deref(),
            Operation::Update => self.templates.update.as_deref(),
            Operation::Delete => self.templates.delete.as_deref(),
        }
    }
}

#[async_trait]
impl EnrichmentReader for QueryReader {
    async fn read(
        &mut self,
        operation: Operation,
        table: &TableName,
        columns: &[Column],
        rows: &[Row],
    ) -> Result<RowSet> {
        let template = match self.template(operation) {
            Some(template) if !rows.is_empty() => template.to_string(),
            _ => return Ok(RowSet::new(columns.to_vec(), rows.to_vec())),
        };

        let mut output = RowSet::default();
        for chunk in rows.chunks(rows_per_statement(columns.len())) {
            let sql = render(&template, table, columns, chunk.len());
            let mut statement = self.client.prepare(&sql).await?;
            let described: Vec<_> = statement
                .columns()
                .iter()
                .map(|column| Column::from_type(column.name(), column.type_()))
                .collect();
            // native values of other types are read back as text and cast
            // again by the writer
            if let Some(projected) = text_projection(&sql, &described) {
                statement = self.client.prepare(&projected).await?;
            }
            if output.columns.is_empty() {
                output.columns = described;
            }
            for row in self.client.query(&statement, &params(chunk)).await? {
                let values = (0..row.len())
                    .map(|i| row.try_get::<_, Value>(i))
                    .collect::<std::result::Result<Row, _>>()?;
                output.rows.push(values);
            }
        }
        debug!(
            "Enriched {} {} rows of {} into {}",
            rows.len(),
            operation,
            table,
            output.rows.len()
        );
        Ok(output)
    }

    async fn close(&mut self) -> Result<()> {
        self.connection.abort();
        Ok(())
    }
}

/// Writes rows to PostgreSQL with the pipeline's write templates and keeps
/// the pipeline checkpoint in the same database.
pub struct PostgresWriter {
    client: Client,
    connection: JoinHandle<()>,
    templates: WriteConfig,
    checkpoints: CheckpointStore,
    in_transaction: bool,
}

impl PostgresWriter {
    pub async fn connect(
        url: &str,
        connect_timeout: Duration,
        templates: WriteConfig,
        checkpoints: CheckpointStore,
    ) -> Result<Self> {
        let (client, connection) = pg::connect(url, connect_timeout).await?;
        info!("Connected writer for {}", checkpoints.table());
        Ok(Self {
            client,
            connection,
            templates,
            checkpoints,
            in_transaction: false,
        })
    }

    fn template(&self, operation: Operation) -> &str {
        match operation {
            Operation::Insert => &self.templates.insert,
            Operation::Update => &self.templates.update,
            Operation::Delete => &self.templates.delete,
        }
    }
}

#[async_trait]
impl Writer for PostgresWriter {
    async fn setup_checkpoint_storage(&mut self) -> Result<()> {
        self.checkpoints.ensure(&self.client).await
    }

    async fn checkpoint(&mut self) -> Result<Lsn> {
        Ok(self.checkpoints.load(&self.client).await?.lsn)
    }

    async fn set_checkpoint(&mut self, lsn: Lsn) -> Result<()> {
        self.checkpoints.save(&self.client, lsn).await
    }

    async fn write(
        &mut self,
        operation: Operation,
        table: &TableName,
        rows: &RowSet,
    ) -> Result<u64> {
        if rows.is_empty() || rows.columns.is_empty() {
            return Ok(0);
        }

        let template = self.template(operation).to_string();
        let mut affected = 0;
        for chunk in rows.rows.chunks(rows_per_statement(rows.columns.len())) {
            let sql = render(&template, table, &rows.columns, chunk.len());
            affected += self.client.execute(sql.as_str(), &params(chunk)).await?;
        }
        debug!(
            "Wrote {} {} rows from {} ({} affected)",
            rows.rows.len(),
            operation,
            table,
            affected
        );
        Ok(affected)
    }

    async fn truncate(&mut self, table: &TableName) -> Result<()> {
        self.client
            .batch_execute(&format!("TRUNCATE {}", table.quoted()))
            .await?;
        info!("Truncated {}", table);
        Ok(())
    }

    async fn begin(&mut self) -> Result<()> {
        self.client.batch_execute("BEGIN").await?;
        self.in_transaction = true;
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        self.client.batch_execute("COMMIT").await?;
        self.in_transaction = false;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        self.in_transaction = false;
        self.client.batch_execute("ROLLBACK").await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if self.in_transaction {
            self.rollback().await?;
        }
        self.connection.abort();
        Ok(())
    }
}
