use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use crate::postgres::TableName;
use crate::{Error, Result};

pub const ROWS_PLACEHOLDER: &str = "{{rows}}";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub connections: BTreeMap<String, ConnectionConfig>,
    pub pipelines: Vec<PipelineConfig>,
    #[serde(default)]
    pub replication: ReplicationConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConnectionConfig {
    pub url: String,
    /// Replication slot used when this connection is a pipeline input.
    pub slot: Option<String>,
    /// Publication used when this connection is a pipeline input.
    pub publication: Option<String>,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PipelineConfig {
    pub name: String,
    /// Name of the source connection.
    pub input: String,
    pub tables: Vec<String>,
    #[serde(default)]
    pub read: ReadConfig,
    pub write: WriteConfig,
}

/// Enrichment query templates, one per operation. A missing template
/// passes the decoded rows through unchanged.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ReadConfig {
    pub insert: Option<String>,
    pub update: Option<String>,
    pub delete: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WriteConfig {
    /// Name of the output connection.
    pub output: String,
    /// Target table emptied before a pipeline's full backfill.
    pub truncate: Option<String>,
    pub insert: String,
    pub update: String,
    pub delete: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReplicationConfig {
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_backfill_batch_size")]
    pub backfill_batch_size: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_checkpoint_schema")]
    pub checkpoint_schema: String,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            backfill_batch_size: default_backfill_batch_size(),
            queue_capacity: default_queue_capacity(),
            checkpoint_schema: default_checkpoint_schema(),
        }
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix("PG_TRUCK")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;

        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.pipelines.is_empty() {
            return Err(Error::Config("no pipelines configured".to_string()));
        }
        if self.replication.backfill_batch_size == 0 {
            return Err(Error::Config("backfill_batch_size must be positive".to_string()));
        }
        if self.replication.queue_capacity == 0 {
            return Err(Error::Config("queue_capacity must be positive".to_string()));
        }
        if self.replication.heartbeat_interval_secs == 0 {
            return Err(Error::Config(
                "heartbeat_interval_secs must be positive".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for pipeline in &self.pipelines {
            if !names.insert(pipeline.name.as_str()) {
                return Err(Error::Config(format!(
                    "duplicate pipeline name '{}'",
                    pipeline.name
                )));
            }
            for connection in [&pipeline.input, &pipeline.write.output] {
                if !self.connections.contains_key(connection) {
                    return Err(Error::Config(format!(
                        "pipeline '{}' references unknown connection '{}'",
                        pipeline.name, connection
                    )));
                }
            }
            if pipeline.tables.is_empty() {
                return Err(Error::Config(format!(
                    "pipeline '{}' has no input tables",
                    pipeline.name
                )));
            }
            pipeline.table_names()?;

            let write = &pipeline.write;
            for (operation, template) in [
                ("insert", &write.insert),
                ("update", &write.update),
                ("delete", &write.delete),
            ] {
                if !template.contains(ROWS_PLACEHOLDER) {
                    return Err(Error::Config(format!(
                        "pipeline '{}': {} statement does not reference {}",
                        pipeline.name, operation, ROWS_PLACEHOLDER
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn connection(&self, name: &str) -> Result<&ConnectionConfig> {
        self.connections
            .get(name)
            .ok_or_else(|| Error::Config(format!("unknown connection '{}'", name)))
    }

    /// Slot name for a source connection.
    pub fn slot_name(&self, connection: &str) -> Result<String> {
        Ok(self
            .connection(connection)?
            .slot
            .clone()
            .unwrap_or_else(|| format!("truck_{}", sanitize_identifier(connection))))
    }

    /// Publication name for a source connection.
    pub fn publication_name(&self, connection: &str) -> Result<String> {
        Ok(self
            .connection(connection)?
            .publication
            .clone()
            .unwrap_or_else(|| format!("truck_{}", sanitize_identifier(connection))))
    }
}

impl PipelineConfig {
    pub fn table_names(&self) -> Result<Vec<TableName>> {
        self.tables
            .iter()
            .map(|table| {
                table.parse::<TableName>().map_err(|e| {
                    Error::Config(format!("pipeline '{}': {}", self.name, e))
                })
            })
            .collect()
    }
}

/// Lowercases and replaces anything outside `[a-z0-9_]` so the result can
/// be used in slot and table names.
pub fn sanitize_identifier(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_heartbeat_interval_secs() -> u64 {
    10
}

fn default_backfill_batch_size() -> usize {
    1000
}

fn default_queue_capacity() -> usize {
    16
}

fn default_checkpoint_schema() -> String {
    "public".to_string()
}
