//! A pipeline moves changes of its input tables through an enrichment
//! reader into a writer, one source transaction per sink transaction.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::checkpoint::{checkpoint_table, CheckpointStore};
use crate::config::{Config, PipelineConfig};
use crate::postgres::{BackfillBatch, Changeset, Lsn, Operation, TableName, Value};
use crate::sink::{EnrichmentReader, IdentityReader, PostgresWriter, QueryReader, Writer};
use crate::{Error, Result};

pub struct Pipeline {
    name: String,
    connection: String,
    tables: BTreeSet<TableName>,
    truncate: Option<TableName>,
    reader: Box<dyn EnrichmentReader>,
    writer: Box<dyn Writer>,
    checkpoint: Lsn,
}

impl Pipeline {
    pub fn new(
        name: impl Into<String>,
        connection: impl Into<String>,
        tables: BTreeSet<TableName>,
        truncate: Option<TableName>,
        reader: Box<dyn EnrichmentReader>,
        writer: Box<dyn Writer>,
    ) -> Self {
        Self {
            name: name.into(),
            connection: connection.into(),
            tables,
            truncate,
            reader,
            writer,
            checkpoint: Lsn::ZERO,
        }
    }

    /// Connects the reader and writer a pipeline definition asks for.
    pub async fn connect(config: &Config, pipeline: &PipelineConfig) -> Result<Self> {
        let input = config.connection(&pipeline.input)?;
        let output = config.connection(&pipeline.write.output)?;

        let read = &pipeline.read;
        let reader: Box<dyn EnrichmentReader> =
            if read.insert.is_none() && read.update.is_none() && read.delete.is_none() {
                Box::new(IdentityReader)
            } else {
                Box::new(
                    QueryReader::connect(
                        &input.url,
                        Duration::from_secs(input.connect_timeout_secs),
                        read.clone(),
                    )
                    .await?,
                )
            };

        let store = CheckpointStore::new(checkpoint_table(
            &config.replication.checkpoint_schema,
            &pipeline.name,
            &pipeline.input,
        ));
        let writer = PostgresWriter::connect(
            &output.url,
            Duration::from_secs(output.connect_timeout_secs),
            pipeline.write.clone(),
            store,
        )
        .await?;

        let truncate = pipeline
            .write
            .truncate
            .as_deref()
            .map(str::parse::<TableName>)
            .transpose()?;

        Ok(Self::new(
            pipeline.name.clone(),
            pipeline.input.clone(),
            pipeline.table_names()?.into_iter().collect(),
            truncate,
            reader,
            Box::new(writer),
        ))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the source connection.
    pub fn connection(&self) -> &str {
        &self.connection
    }

    pub fn tables(&self) -> &BTreeSet<TableName> {
        &self.tables
    }

    pub fn checkpoint(&self) -> Lsn {
        self.checkpoint
    }

    fn fail(&self, e: Error) -> Error {
        match e {
            Error::Pipeline { .. } | Error::Shutdown => e,
            other => Error::Pipeline {
                pipeline: self.name.clone(),
                message: other.to_string(),
            },
        }
    }

    /// Prepares checkpoint storage and loads the stored checkpoint.
    pub async fn open(&mut self) -> Result<Lsn> {
        let result = async {
            self.writer.setup_checkpoint_storage().await?;
            self.writer.checkpoint().await
        }
        .await;
        self.checkpoint = result.map_err(|e| self.fail(e))?;
        info!(
            pipeline = %self.name,
            checkpoint = %self.checkpoint,
            tables = self.tables.len(),
            "Pipeline opened"
        );
        Ok(self.checkpoint)
    }

    /// Applies one source transaction's changesets and moves the checkpoint
    /// to `position` in the same sink transaction. Returns `false` when the
    /// transaction is at or below the checkpoint and was skipped.
    pub async fn apply(&mut self, changesets: &[Arc<Changeset>], position: Lsn) -> Result<bool> {
        if !position.is_zero() && position <= self.checkpoint {
            debug!(
                pipeline = %self.name,
                lsn = %position,
                checkpoint = %self.checkpoint,
                "Skipping transaction at or below checkpoint"
            );
            return Ok(false);
        }

        self.writer.begin().await.map_err(|e| self.fail(e))?;
        let result = self.write_changesets(changesets, position).await;
        match result {
            Ok(()) => {
                self.writer.commit().await.map_err(|e| self.fail(e))?;
                self.checkpoint = self.checkpoint.max(position);
                debug!(
                    pipeline = %self.name,
                    lsn = %position,
                    changesets = changesets.len(),
                    "Applied transaction"
                );
                Ok(true)
            }
            Err(e) => {
                if let Err(rollback) = self.writer.rollback().await {
                    warn!(pipeline = %self.name, "Rollback failed: {}", rollback);
                }
                Err(self.fail(e))
            }
        }
    }

    async fn write_changesets(&mut self, changesets: &[Arc<Changeset>], position: Lsn) -> Result<()> {
        for changeset in changesets {
            self.write_rows(changeset).await?;
        }
        if !position.is_zero() {
            self.writer.set_checkpoint(position).await?;
        }
        Ok(())
    }

    async fn write_rows(&mut self, changeset: &Changeset) -> Result<()> {
        let rows = self
            .reader
            .read(
                changeset.operation,
                &changeset.table,
                &changeset.columns,
                &changeset.rows,
            )
            .await?;
        self.writer
            .write(changeset.operation, &changeset.table, &rows)
            .await?;
        Ok(())
    }

    /// Writes snapshot rows as inserts in their own sink transaction. The
    /// checkpoint does not move.
    pub async fn load(&mut self, batch: BackfillBatch) -> Result<()> {
        let width = batch.columns.len();
        let mut changeset = Changeset::new(batch.table, Operation::Insert, &batch.columns);
        changeset.rows = batch
            .rows
            .into_iter()
            .map(|mut row| {
                row.resize(width * 2, Value::Null);
                row
            })
            .collect();

        self.writer.begin().await.map_err(|e| self.fail(e))?;
        match self.write_rows(&changeset).await {
            Ok(()) => {
                self.writer.commit().await.map_err(|e| self.fail(e))?;
                debug!(
                    pipeline = %self.name,
                    table = %changeset.table,
                    rows = changeset.len(),
                    "Loaded backfill batch"
                );
                Ok(())
            }
            Err(e) => {
                if let Err(rollback) = self.writer.rollback().await {
                    warn!(pipeline = %self.name, "Rollback failed: {}", rollback);
                }
                Err(self.fail(e))
            }
        }
    }

    /// Empties the configured target ahead of a full backfill.
    pub async fn truncate_target(&mut self) -> Result<()> {
        if let Some(table) = self.truncate.clone() {
            self.writer.truncate(&table).await.map_err(|e| self.fail(e))?;
        }
        Ok(())
    }

    /// Raises the checkpoint to `lsn` if it is behind.
    pub async fn advance(&mut self, lsn: Lsn) -> Result<()> {
        if lsn <= self.checkpoint {
            return Ok(());
        }
        self.writer.set_checkpoint(lsn).await.map_err(|e| self.fail(e))?;
        self.checkpoint = lsn;
        debug!(pipeline = %self.name, checkpoint = %lsn, "Checkpoint advanced");
        Ok(())
    }

    pub async fn close(&mut self) {
        if let Err(e) = self.reader.close().await {
            warn!(pipeline = %self.name, "Closing reader failed: {}", e);
        }
        if let Err(e) = self.writer.close().await {
            warn!(pipeline = %self.name, "Closing writer failed: {}", e);
        }
    }
}

/// Work for a running pipeline: one transaction's relevant changesets.
pub struct Dispatch {
    pub changesets: Vec<Arc<Changeset>>,
    pub position: Lsn,
    pub done: oneshot::Sender<Result<()>>,
}

/// A pipeline running on its own task behind a bounded queue.
pub struct PipelineHandle {
    name: String,
    tables: BTreeSet<TableName>,
    checkpoint: Lsn,
    queue: mpsc::Sender<Dispatch>,
    task: JoinHandle<()>,
}

impl PipelineHandle {
    /// Starts the pipeline's task. A failed transaction cancels `shutdown`.
    pub fn spawn(pipeline: Pipeline, capacity: usize, shutdown: CancellationToken) -> Self {
        let (queue, receiver) = mpsc::channel(capacity.max(1));
        let name = pipeline.name.clone();
        let tables = pipeline.tables.clone();
        let checkpoint = pipeline.checkpoint;
        let task = tokio::spawn(run_pipeline(pipeline, receiver, shutdown));
        Self {
            name,
            tables,
            checkpoint,
            queue,
            task,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tables(&self) -> &BTreeSet<TableName> {
        &self.tables
    }

    /// Checkpoint at the time the task started.
    pub fn initial_checkpoint(&self) -> Lsn {
        self.checkpoint
    }

    /// Queues work and returns the receiver that reports its outcome.
    pub async fn dispatch(
        &self,
        changesets: Vec<Arc<Changeset>>,
        position: Lsn,
    ) -> Result<oneshot::Receiver<Result<()>>> {
        let (done, receiver) = oneshot::channel();
        self.queue
            .send(Dispatch {
                changesets,
                position,
                done,
            })
            .await
            .map_err(|_| Error::Shutdown)?;
        Ok(receiver)
    }

    /// Closes the queue and waits for queued work to drain.
    pub async fn shutdown(self) {
        drop(self.queue);
        if let Err(e) = self.task.await {
            error!(pipeline = %self.name, "Pipeline task ended abnormally: {}", e);
        }
    }
}

async fn run_pipeline(
    mut pipeline: Pipeline,
    mut queue: mpsc::Receiver<Dispatch>,
    shutdown: CancellationToken,
) {
    loop {
        let dispatch = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            dispatch = queue.recv() => match dispatch {
                Some(dispatch) => dispatch,
                None => break,
            },
        };

        let result = pipeline
            .apply(&dispatch.changesets, dispatch.position)
            .await
            .map(|_| ());
        let failed = result.is_err();
        if let Err(e) = &result {
            error!(pipeline = %pipeline.name, lsn = %dispatch.position, "{}", e);
        }
        let _ = dispatch.done.send(result);
        if failed {
            shutdown.cancel();
            break;
        }
    }

    pipeline.close().await;
    info!(pipeline = %pipeline.name, checkpoint = %pipeline.checkpoint, "Pipeline stopped");
}
