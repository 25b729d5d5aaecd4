use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, Interval, MissedTickBehavior};
use tokio_postgres::Client;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, warn};

use super::connection::{
    wal2json_options, CopyBothMessage, ReplicationConnection, StatusSender, WalReader,
};
use super::decoder::Wal2JsonDecoder;
use super::schema;
use super::types::{quote_ident, Lsn, TableName, Transaction};
use crate::{Error, Result};

const OUTPUT_PLUGIN: &str = "wal2json";
const STREAM_BUFFER: usize = 64;
const SLOT_RELEASE_ATTEMPTS: u32 = 20;

/// Ordered transactions from one `start` call. The last item is an error
/// if the stream died.
pub type TransactionStream = ReceiverStream<Result<Transaction>>;

#[derive(Debug, Clone)]
pub struct ReplicationSettings {
    pub url: String,
    pub slot_name: String,
    pub publication_name: String,
    pub heartbeat_interval: Duration,
    pub connect_timeout: Duration,
}

/// What `setup` found and prepared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetupOutcome {
    /// Tables that were not part of the stream before this run.
    pub newly_published: BTreeSet<TableName>,
    /// Position the backfill snapshot corresponds to.
    pub backfill_lsn: Lsn,
    /// Exported snapshot, present when something has to be backfilled.
    pub snapshot: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SlotPlan {
    /// No slot yet: create it and backfill from its snapshot.
    Create,
    /// Slot exists and nothing needs a snapshot.
    Resume,
    /// Slot exists but some tables need a snapshot; take it from a
    /// temporary slot so the durable one keeps its position.
    TemporarySnapshot,
}

pub(crate) fn plan_slot(slot_exists: bool, needs_backfill: bool) -> SlotPlan {
    match (slot_exists, needs_backfill) {
        (false, _) => SlotPlan::Create,
        (true, false) => SlotPlan::Resume,
        (true, true) => SlotPlan::TemporarySnapshot,
    }
}

/// Tables to add to and drop from a publication so it carries `wanted`.
pub(crate) fn publication_changes(
    current: &BTreeSet<TableName>,
    wanted: &BTreeSet<TableName>,
) -> (BTreeSet<TableName>, BTreeSet<TableName>) {
    (
        wanted.difference(current).cloned().collect(),
        current.difference(wanted).cloned().collect(),
    )
}

#[derive(Debug)]
enum StreamCommand {
    Acknowledge(Lsn),
    Stop,
}

/// Logical replication from one source database.
///
/// `setup` reconciles the publication and slot, `start` opens a stream
/// between two positions, and `acknowledge`/`stop` steer the running
/// stream from any task holding the client.
pub struct ReplicationClient {
    settings: ReplicationSettings,
    tables: BTreeSet<TableName>,
    control: Option<(Client, JoinHandle<()>)>,
    decoder: Arc<Wal2JsonDecoder>,
    snapshot_holder: Option<ReplicationConnection>,
    commands: Option<mpsc::UnboundedSender<StreamCommand>>,
    task: Option<JoinHandle<()>>,
}

impl ReplicationClient {
    pub fn new(settings: ReplicationSettings, tables: BTreeSet<TableName>) -> Self {
        Self {
            settings,
            tables,
            control: None,
            decoder: Arc::new(Wal2JsonDecoder::default()),
            snapshot_holder: None,
            commands: None,
            task: None,
        }
    }

    pub fn tables(&self) -> &BTreeSet<TableName> {
        &self.tables
    }

    pub fn decoder(&self) -> &Wal2JsonDecoder {
        &self.decoder
    }

    pub fn settings(&self) -> &ReplicationSettings {
        &self.settings
    }

    async fn control(&mut self) -> Result<&Client> {
        if self.control.is_none() {
            let connection =
                super::connect(&self.settings.url, self.settings.connect_timeout).await?;
            self.control = Some(connection);
        }
        match &self.control {
            Some((client, _)) => Ok(client),
            None => Err(Error::Connection("control connection unavailable".to_string())),
        }
    }

    /// Prepares the publication and slot. `unseeded` lists tables whose
    /// pipelines have never been checkpointed; they need a snapshot even if
    /// the publication already carried them.
    ///
    /// Running setup twice with the same tables reports no newly published
    /// tables the second time.
    pub async fn setup(&mut self, unseeded: &BTreeSet<TableName>) -> Result<SetupOutcome> {
        let tables = self.tables.clone();
        let client = self.control().await?;
        let schemas = schema::discover(client, &tables).await?;
        self.decoder = Arc::new(Wal2JsonDecoder::new(schemas));

        let mut newly_published = self.reconcile_publication().await?;
        let slot = self.slot_position().await?;
        let needs_backfill = !newly_published.is_empty() || !unseeded.is_empty();

        let outcome = match plan_slot(slot.is_some(), needs_backfill) {
            SlotPlan::Create => {
                if newly_published.len() < self.tables.len() {
                    warn!(
                        "Slot '{}' is missing; all tables will be backfilled again",
                        self.settings.slot_name
                    );
                }
                newly_published = self.tables.clone();
                let slot_name = self.settings.slot_name.clone();
                let info = self.hold_snapshot(&slot_name, false).await?;
                SetupOutcome {
                    newly_published,
                    backfill_lsn: info.0,
                    snapshot: Some(info.1),
                }
            }
            SlotPlan::Resume => SetupOutcome {
                newly_published,
                backfill_lsn: slot.unwrap_or_default(),
                snapshot: None,
            },
            SlotPlan::TemporarySnapshot => {
                let slot_name = format!("{}_backfill", self.settings.slot_name);
                self.release_stale_slot(&slot_name).await?;
                let info = self.hold_snapshot(&slot_name, true).await?;
                SetupOutcome {
                    newly_published,
                    backfill_lsn: info.0,
                    snapshot: Some(info.1),
                }
            }
        };

        info!(
            slot = %self.settings.slot_name,
            publication = %self.settings.publication_name,
            backfill_lsn = %outcome.backfill_lsn,
            newly_published = outcome.newly_published.len(),
            snapshot = outcome.snapshot.is_some(),
            "Replication setup complete"
        );
        Ok(outcome)
    }

    async fn reconcile_publication(&mut self) -> Result<BTreeSet<TableName>> {
        let name = self.settings.publication_name.clone();
        let wanted = self.tables.clone();
        let client = self.control().await?;

        let exists = client
            .query_opt(
                "SELECT 1 FROM pg_catalog.pg_publication WHERE pubname = $1",
                &[&name],
            )
            .await?
            .is_some();

        if !exists {
            let sql = format!(
                "CREATE PUBLICATION {} FOR TABLE {}",
                quote_ident(&name),
                table_list(&wanted)
            );
            client
                .batch_execute(&sql)
                .await
                .map_err(|e| Error::setup(format!("cannot create publication {}: {}", name, e)))?;
            info!("Created publication '{}' for {} tables", name, wanted.len());
            return Ok(wanted);
        }

        let current: BTreeSet<TableName> = client
            .query(
                "SELECT schemaname::text, tablename::text \
                 FROM pg_catalog.pg_publication_tables WHERE pubname = $1",
                &[&name],
            )
            .await?
            .iter()
            .map(|row| TableName::new(row.get::<_, String>(0), row.get::<_, String>(1)))
            .collect();

        let (added, dropped) = publication_changes(&current, &wanted);
        if !added.is_empty() {
            let sql = format!(
                "ALTER PUBLICATION {} ADD TABLE {}",
                quote_ident(&name),
                table_list(&added)
            );
            client
                .batch_execute(&sql)
                .await
                .map_err(|e| Error::setup(format!("cannot extend publication {}: {}", name, e)))?;
            info!("Added {} tables to publication '{}'", added.len(), name);
        }
        if !dropped.is_empty() {
            let sql = format!(
                "ALTER PUBLICATION {} DROP TABLE {}",
                quote_ident(&name),
                table_list(&dropped)
            );
            client
                .batch_execute(&sql)
                .await
                .map_err(|e| Error::setup(format!("cannot shrink publication {}: {}", name, e)))?;
            info!("Dropped {} tables from publication '{}'", dropped.len(), name);
        }
        Ok(added)
    }

    /// Confirmed position of the durable slot, if it exists.
    async fn slot_position(&mut self) -> Result<Option<Lsn>> {
        let slot_name = self.settings.slot_name.clone();
        let client = self.control().await?;
        let row = client
            .query_opt(
                "SELECT plugin::text, confirmed_flush_lsn::text \
                 FROM pg_catalog.pg_replication_slots \
                 WHERE slot_name = $1 AND database = current_database()",
                &[&slot_name],
            )
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let plugin: Option<String> = row.get(0);
        if plugin.as_deref() != Some(OUTPUT_PLUGIN) {
            return Err(Error::setup(format!(
                "slot '{}' uses plugin {:?}, expected {}",
                slot_name, plugin, OUTPUT_PLUGIN
            )));
        }
        let confirmed: Option<String> = row.get(1);
        let lsn = confirmed
            .ok_or_else(|| Error::setup(format!("slot '{}' has no confirmed position", slot_name)))?
            .parse()?;
        debug!("Slot '{}' confirmed at {}", slot_name, lsn);
        Ok(Some(lsn))
    }

    /// Terminates whoever still holds a temporary slot from an earlier run
    /// and waits for the server to drop it.
    async fn release_stale_slot(&mut self, slot_name: &str) -> Result<()> {
        let slot_name = slot_name.to_string();
        let client = self.control().await?;
        let terminated = client
            .query(
                "SELECT pg_terminate_backend(active_pid) FROM pg_catalog.pg_replication_slots \
                 WHERE slot_name = $1 AND active_pid IS NOT NULL",
                &[&slot_name],
            )
            .await?;
        if !terminated.is_empty() {
            warn!("Terminated stale holder of temporary slot '{}'", slot_name);
        }

        for _ in 0..SLOT_RELEASE_ATTEMPTS {
            let exists = client
                .query_opt(
                    "SELECT 1 FROM pg_catalog.pg_replication_slots WHERE slot_name = $1",
                    &[&slot_name],
                )
                .await?
                .is_some();
            if !exists {
                return Ok(());
            }
            sleep(Duration::from_millis(250)).await;
        }
        Err(Error::setup(format!(
            "temporary slot '{}' is still held by another session",
            slot_name
        )))
    }

    async fn hold_snapshot(&mut self, slot_name: &str, temporary: bool) -> Result<(Lsn, String)> {
        let mut connection =
            ReplicationConnection::connect(&self.settings.url, self.settings.connect_timeout)
                .await?;
        let info = connection.create_replication_slot(slot_name, temporary).await?;
        let snapshot = info.snapshot_name.ok_or_else(|| {
            Error::setup(format!("slot '{}' did not export a snapshot", slot_name))
        })?;
        self.snapshot_holder = Some(connection);
        Ok((info.consistent_point, snapshot))
    }

    /// Gives up the exported snapshot. A temporary slot goes with it.
    pub async fn release_snapshot(&mut self) -> Result<()> {
        if let Some(connection) = self.snapshot_holder.take() {
            connection.close().await?;
            debug!("Released backfill snapshot");
        }
        Ok(())
    }

    /// Streams transactions committed after `start`. With a non-zero `end`
    /// the stream closes once a position at or past `end` is reached and
    /// nothing beyond `end` is delivered.
    pub async fn start(&mut self, start: Lsn, end: Lsn) -> Result<TransactionStream> {
        if self.task.as_ref().is_some_and(|task| !task.is_finished()) {
            return Err(Error::Replication {
                message: "a replication stream is already running".to_string(),
            });
        }

        let mut connection =
            ReplicationConnection::connect(&self.settings.url, self.settings.connect_timeout)
                .await?;
        let system = connection.identify_system().await?;
        info!(
            slot = %self.settings.slot_name,
            timeline = system.timeline,
            server_lsn = %system.xlogpos,
            from = %start,
            until = %end,
            "Starting replication"
        );
        let options = wal2json_options(&self.tables);
        let stream = connection
            .start_replication(&self.settings.slot_name, start, &options)
            .await?;
        let (reader, sender) = stream.into_split();

        let (output, receiver) = mpsc::channel(STREAM_BUFFER);
        let (commands, command_rx) = mpsc::unbounded_channel();
        let task = StreamTask {
            sender,
            commands: command_rx,
            output,
            decoder: self.decoder.clone(),
            heartbeat: self.settings.heartbeat_interval,
            end,
            acknowledged: Lsn::ZERO,
        };

        self.commands = Some(commands);
        self.task = Some(tokio::spawn(task.run(reader)));
        Ok(ReceiverStream::new(receiver))
    }

    /// Records `lsn` as durably processed; reported with the next status
    /// update.
    pub fn acknowledge(&self, lsn: Lsn) {
        self.acknowledger().acknowledge(lsn);
    }

    /// Owned handle acknowledging positions on the current stream.
    pub fn acknowledger(&self) -> Acknowledger {
        Acknowledger {
            commands: self.commands.clone(),
        }
    }

    /// Asks the running stream to end. Safe to call repeatedly.
    pub fn stop(&self) {
        if let Some(commands) = &self.commands {
            let _ = commands.send(StreamCommand::Stop);
        }
    }

    /// Waits for the streaming task to exit.
    pub async fn join(&mut self) {
        self.commands = None;
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("Replication stream task ended abnormally: {}", e);
            }
        }
    }

    pub async fn close(&mut self) -> Result<()> {
        self.stop();
        self.join().await;
        self.release_snapshot().await?;
        if let Some((_, connection)) = self.control.take() {
            connection.abort();
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct Acknowledger {
    commands: Option<mpsc::UnboundedSender<StreamCommand>>,
}

impl Acknowledger {
    pub fn acknowledge(&self, lsn: Lsn) {
        if let Some(commands) = &self.commands {
            let _ = commands.send(StreamCommand::Acknowledge(lsn));
        }
    }
}

fn table_list(tables: &BTreeSet<TableName>) -> String {
    tables
        .iter()
        .map(TableName::quoted)
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

struct StreamTask {
    sender: StatusSender,
    commands: mpsc::UnboundedReceiver<StreamCommand>,
    output: mpsc::Sender<Result<Transaction>>,
    decoder: Arc<Wal2JsonDecoder>,
    heartbeat: Duration,
    end: Lsn,
    acknowledged: Lsn,
}

impl StreamTask {
    async fn run(mut self, reader: WalReader) {
        let (frames_tx, mut frames) = mpsc::channel(STREAM_BUFFER);
        let reader_task = tokio::spawn(read_messages(reader, frames_tx));

        let result = self.pump(&mut frames).await;
        reader_task.abort();

        if let Err(e) = result {
            error!("Replication stream failed: {}", e);
            let _ = self.output.send(Err(e)).await;
        }
        if !self.acknowledged.is_zero() {
            if let Err(e) = self.sender.send_status(self.acknowledged, false).await {
                debug!("Final status update not sent: {}", e);
            }
        }
        if let Err(e) = self.sender.finish().await {
            debug!("Replication connection not closed cleanly: {}", e);
        }
        info!("Replication stream stopped at {}", self.acknowledged);
    }

    async fn pump(&mut self, frames: &mut mpsc::Receiver<Result<CopyBothMessage>>) -> Result<()> {
        let mut ticker = interval(self.heartbeat);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    if apply_command(&mut self.acknowledged, command) == Flow::Stop {
                        return Ok(());
                    }
                }
                _ = ticker.tick() => {
                    self.sender.send_status(self.acknowledged, false).await?;
                }
                message = frames.recv() => match message {
                    Some(Ok(message)) => {
                        if self.handle(message, &mut ticker).await? == Flow::Stop {
                            return Ok(());
                        }
                    }
                    Some(Err(e)) => return Err(e),
                    None => {
                        return Err(Error::Replication {
                            message: "server ended the replication stream".to_string(),
                        })
                    }
                },
            }
        }
    }

    fn past_end(&self, position: Lsn) -> bool {
        !self.end.is_zero() && position > self.end
    }

    fn reached_end(&self, position: Lsn) -> bool {
        !self.end.is_zero() && position >= self.end
    }

    async fn handle(&mut self, message: CopyBothMessage, ticker: &mut Interval) -> Result<Flow> {
        match message {
            CopyBothMessage::XLogData { data, .. } => {
                let transaction = self.decoder.decode_transaction(&data)?;
                let position = transaction.flush_position;
                if self.past_end(position) {
                    return Ok(Flow::Stop);
                }
                if self.emit(transaction, ticker).await? == Flow::Stop {
                    return Ok(Flow::Stop);
                }
                if self.reached_end(position) {
                    return Ok(Flow::Stop);
                }
            }
            CopyBothMessage::Keepalive { wal_end, reply, .. } => {
                if reply {
                    self.sender.send_status(self.acknowledged, false).await?;
                }
                if !wal_end.is_zero() && !self.past_end(wal_end) {
                    if self.emit(Transaction::boundary(wal_end), ticker).await? == Flow::Stop {
                        return Ok(Flow::Stop);
                    }
                }
                if self.reached_end(wal_end) {
                    return Ok(Flow::Stop);
                }
            }
        }
        Ok(Flow::Continue)
    }

    /// Hands a transaction to the consumer, keeping the server informed
    /// while the consumer applies backpressure.
    async fn emit(&mut self, transaction: Transaction, ticker: &mut Interval) -> Result<Flow> {
        loop {
            tokio::select! {
                permit = self.output.reserve() => {
                    return match permit {
                        Ok(permit) => {
                            permit.send(Ok(transaction));
                            Ok(Flow::Continue)
                        }
                        Err(_) => Ok(Flow::Stop),
                    };
                }
                _ = ticker.tick() => {
                    self.sender.send_status(self.acknowledged, false).await?;
                }
                command = self.commands.recv() => {
                    if apply_command(&mut self.acknowledged, command) == Flow::Stop {
                        return Ok(Flow::Stop);
                    }
                }
            }
        }
    }
}

/// Applies a stream command to the acknowledged position.
fn apply_command(acknowledged: &mut Lsn, command: Option<StreamCommand>) -> Flow {
    match command {
        Some(StreamCommand::Acknowledge(lsn)) => {
            *acknowledged = (*acknowledged).max(lsn);
            Flow::Continue
        }
        Some(StreamCommand::Stop) | None => {
            debug!("Replication stream stop requested");
            Flow::Stop
        }
    }
}

async fn read_messages(mut reader: WalReader, frames: mpsc::Sender<Result<CopyBothMessage>>) {
    loop {
        match reader.next_message().await {
            Ok(Some(message)) => {
                if frames.send(Ok(message)).await.is_err() {
                    return;
                }
            }
            Ok(None) => return,
            Err(e) => {
                let _ = frames.send(Err(e)).await;
                return;
            }
        }
    }
}
