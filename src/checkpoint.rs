//! Per-pipeline checkpoints stored next to the pipeline's output.
//!
//! A pipeline's checkpoint is the highest source position whose effects are
//! durably written to its sink. It lives in a one-row table inside the sink
//! database and is updated in the same transaction as the rows it covers,
//! so a restart never sees data without its checkpoint or the reverse.
//!
//! The stored value only moves forward: the upsert keeps the greater of the
//! stored and the offered position.
//!
//! # Example
//!
//! ```rust
//! use pg_truck::checkpoint::{checkpoint_table, CheckpointStore};
//!
//! let table = checkpoint_table("public", "countries", "source");
//! assert_eq!(table.to_string(), "public.truck_checkpoint_countries_source");
//!
//! let store = CheckpointStore::new(table);
//! assert!(store.upsert_sql().contains("GREATEST"));
//! ```

use chrono::{DateTime, Utc};
use tokio_postgres::Client;
use tracing::{debug, info};

use crate::config::sanitize_identifier;
use crate::postgres::{Lsn, TableName};
use crate::Result;

pub const CHECKPOINT_TABLE_PREFIX: &str = "truck_checkpoint_";

/// Last durable position of a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Checkpoint {
    pub lsn: Lsn,
    /// When the sink last advanced the checkpoint, if ever.
    pub updated_at: Option<DateTime<Utc>>,
}

impl Checkpoint {
    pub fn is_seeded(&self) -> bool {
        !self.lsn.is_zero()
    }
}

/// Name of the table holding the checkpoint of `pipeline` reading from
/// `connection`. Deterministic so restarts find the same row.
pub fn checkpoint_table(schema: &str, pipeline: &str, connection: &str) -> TableName {
    TableName::new(
        schema,
        format!(
            "{}{}_{}",
            CHECKPOINT_TABLE_PREFIX,
            sanitize_identifier(pipeline),
            sanitize_identifier(connection)
        ),
    )
}

/// SQL access to one checkpoint table.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    table: TableName,
}

impl CheckpointStore {
    pub fn new(table: TableName) -> Self {
        Self { table }
    }

    pub fn table(&self) -> &TableName {
        &self.table
    }

    pub fn create_sql(&self) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\
             id boolean PRIMARY KEY DEFAULT true CHECK (id), \
             lsn pg_lsn NOT NULL, \
             updated_at timestamptz NOT NULL DEFAULT now())",
            self.table.quoted()
        )
    }

    pub fn select_sql(&self) -> String {
        format!("SELECT lsn::text, updated_at FROM {}", self.table.quoted())
    }

    pub fn upsert_sql(&self) -> String {
        format!(
            "INSERT INTO {table} AS c (id, lsn) VALUES (true, $1::text::pg_lsn) \
             ON CONFLICT (id) DO UPDATE \
             SET lsn = GREATEST(c.lsn, EXCLUDED.lsn), updated_at = now()",
            table = self.table.quoted()
        )
    }

    /// Creates the checkpoint table if it does not exist yet.
    pub async fn ensure(&self, client: &Client) -> Result<()> {
        client.batch_execute(&self.create_sql()).await?;
        debug!("Checkpoint table {} ready", self.table);
        Ok(())
    }

    /// Reads the stored checkpoint; a missing row reads as position zero.
    pub async fn load(&self, client: &Client) -> Result<Checkpoint> {
        let row = client.query_opt(self.select_sql().as_str(), &[]).await?;
        let checkpoint = match row {
            Some(row) => Checkpoint {
                lsn: row.get::<_, String>(0).parse()?,
                updated_at: Some(row.get(1)),
            },
            None => Checkpoint::default(),
        };
        info!("Loaded checkpoint {} from {}", checkpoint.lsn, self.table);
        Ok(checkpoint)
    }

    /// Raises the stored checkpoint to `lsn`. Run it inside the write
    /// transaction it belongs to.
    pub async fn save(&self, client: &Client, lsn: Lsn) -> Result<()> {
        client
            .execute(self.upsert_sql().as_str(), &[&lsn.to_string()])
            .await?;
        debug!("Checkpoint {} staged in {}", lsn, self.table);
        Ok(())
    }
}
