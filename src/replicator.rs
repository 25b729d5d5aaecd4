//! Drives every pipeline through backfill, catch-up and streaming.
//!
//! Pipelines are grouped by source connection; each group shares one
//! replication client. Setup and the first two phases run group by group
//! on the calling task. Streaming then runs one task per group, fanning
//! each transaction out to pipeline tasks and acknowledging it once every
//! interested pipeline has committed it.

use futures::{Stream, StreamExt};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::pipeline::{Pipeline, PipelineHandle};
use crate::postgres::replication::ReplicationSettings;
use crate::postgres::{
    BackfillStream, Changeset, Lsn, ReplicationClient, SetupOutcome, TableName, Transaction,
};
use crate::{Config, Error, Result};

/// What one pipeline does before streaming.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub(crate) struct PipelinePlan {
    /// Tables to copy from the snapshot.
    pub backfill: BTreeSet<TableName>,
    /// Tables to replay from the slot up to the snapshot position.
    pub catch_up: BTreeSet<TableName>,
}

impl PipelinePlan {
    pub fn is_full_backfill(&self, tables: &BTreeSet<TableName>) -> bool {
        !self.backfill.is_empty() && self.backfill == *tables
    }
}

/// Plans one pipeline. A pipeline that never checkpointed backfills all of
/// its tables; otherwise only tables new to the stream are backfilled and
/// the rest are replayed if the pipeline is behind the snapshot.
pub(crate) fn plan_pipeline(
    tables: &BTreeSet<TableName>,
    checkpoint: Lsn,
    outcome: &SetupOutcome,
) -> PipelinePlan {
    if outcome.snapshot.is_none() {
        return PipelinePlan::default();
    }
    if checkpoint.is_zero() {
        return PipelinePlan {
            backfill: tables.clone(),
            catch_up: BTreeSet::new(),
        };
    }

    let backfill: BTreeSet<_> = tables
        .intersection(&outcome.newly_published)
        .cloned()
        .collect();
    let catch_up = if checkpoint < outcome.backfill_lsn {
        tables.difference(&backfill).cloned().collect()
    } else {
        BTreeSet::new()
    };
    PipelinePlan { backfill, catch_up }
}

/// Splits a transaction's changesets per subscriber, keeping source order.
pub(crate) fn fan_out(
    changesets: &[Arc<Changeset>],
    subscriptions: &[&BTreeSet<TableName>],
) -> Vec<Vec<Arc<Changeset>>> {
    subscriptions
        .iter()
        .map(|tables| {
            changesets
                .iter()
                .filter(|changeset| tables.contains(&changeset.table))
                .cloned()
                .collect()
        })
        .collect()
}

/// Position streaming resumes from: the lowest checkpoint in the group.
pub(crate) fn resume_position(checkpoints: impl IntoIterator<Item = Lsn>) -> Lsn {
    checkpoints.into_iter().min().unwrap_or(Lsn::ZERO)
}

/// Pipelines reading from one source connection.
struct SourceGroup {
    connection: String,
    url: String,
    connect_timeout: Duration,
    client: ReplicationClient,
    pipelines: Vec<Pipeline>,
}

pub struct Replicator {
    config: Config,
    shutdown: CancellationToken,
}

impl Replicator {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            shutdown: CancellationToken::new(),
        }
    }

    /// Token that stops the replicator when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub async fn run(&self) -> Result<()> {
        info!("Replicator starting");

        match self.replicate().await {
            Err(Error::Shutdown) | Ok(()) => {
                info!("Replicator stopped");
                Ok(())
            }
            Err(e) => {
                error!("Replicator failed: {}", e);
                Err(e)
            }
        }
    }

    async fn replicate(&self) -> Result<()> {
        let mut groups = self.connect_groups().await?;

        let mut prepared = Ok(());
        for group in &mut groups {
            prepared = self.prepare(group).await;
            if prepared.is_err() {
                break;
            }
        }
        if let Err(e) = prepared {
            for group in &mut groups {
                if let Err(close) = group.client.close().await {
                    warn!(connection = %group.connection, "Closing replication client failed: {}", close);
                }
                for pipeline in &mut group.pipelines {
                    pipeline.close().await;
                }
            }
            return Err(e);
        }

        let capacity = self.config.replication.queue_capacity;
        let tasks: Vec<_> = groups
            .into_iter()
            .map(|group| tokio::spawn(stream_group(group, capacity, self.shutdown.clone())))
            .collect();

        let mut result = Ok(());
        for task in futures::future::join_all(tasks).await {
            let outcome = task.unwrap_or_else(|e| {
                Err(Error::Replication {
                    message: format!("streaming task panicked: {}", e),
                })
            });
            result = first_failure(result, outcome);
        }
        result
    }

    async fn connect_groups(&self) -> Result<Vec<SourceGroup>> {
        let mut pipelines: BTreeMap<String, Vec<Pipeline>> = BTreeMap::new();
        for definition in &self.config.pipelines {
            let mut pipeline = Pipeline::connect(&self.config, definition).await?;
            pipeline.open().await?;
            pipelines
                .entry(definition.input.clone())
                .or_default()
                .push(pipeline);
        }

        let mut groups = Vec::with_capacity(pipelines.len());
        for (connection, pipelines) in pipelines {
            let source = self.config.connection(&connection)?;
            let connect_timeout = Duration::from_secs(source.connect_timeout_secs);
            let settings = ReplicationSettings {
                url: source.url.clone(),
                slot_name: self.config.slot_name(&connection)?,
                publication_name: self.config.publication_name(&connection)?,
                heartbeat_interval: Duration::from_secs(
                    self.config.replication.heartbeat_interval_secs,
                ),
                connect_timeout,
            };
            let tables = pipelines
                .iter()
                .flat_map(|p| p.tables().iter().cloned())
                .collect();
            groups.push(SourceGroup {
                connection,
                url: source.url.clone(),
                connect_timeout,
                client: ReplicationClient::new(settings, tables),
                pipelines,
            });
        }
        Ok(groups)
    }

    /// Setup, backfill and catch-up for one group.
    async fn prepare(&self, group: &mut SourceGroup) -> Result<()> {
        let unseeded: BTreeSet<TableName> = group
            .pipelines
            .iter()
            .filter(|p| p.checkpoint().is_zero())
            .flat_map(|p| p.tables().iter().cloned())
            .collect();

        let outcome = group.client.setup(&unseeded).await?;
        let plans: Vec<PipelinePlan> = group
            .pipelines
            .iter()
            .map(|p| plan_pipeline(p.tables(), p.checkpoint(), &outcome))
            .collect();

        if let Some(snapshot) = &outcome.snapshot {
            self.backfill(group, &plans, snapshot, outcome.backfill_lsn)
                .await?;
        }
        group.client.release_snapshot().await?;

        if outcome.snapshot.is_some() {
            self.catch_up(group, &plans, outcome.backfill_lsn).await?;
            raise_checkpoints(&mut group.pipelines, &plans, outcome.backfill_lsn).await?;
        }
        Ok(())
    }

    async fn backfill(
        &self,
        group: &mut SourceGroup,
        plans: &[PipelinePlan],
        snapshot: &str,
        backfill_lsn: Lsn,
    ) -> Result<()> {
        let batch_size = self.config.replication.backfill_batch_size;
        for (pipeline, plan) in group.pipelines.iter_mut().zip(plans) {
            if plan.backfill.is_empty() {
                continue;
            }
            info!(
                pipeline = %pipeline.name(),
                tables = plan.backfill.len(),
                lsn = %backfill_lsn,
                "Backfilling"
            );
            if plan.is_full_backfill(pipeline.tables()) {
                pipeline.truncate_target().await?;
            }

            for table in &plan.backfill {
                let schema = group
                    .client
                    .decoder()
                    .schemas()
                    .get(table)
                    .cloned()
                    .ok_or_else(|| Error::Backfill {
                        table: table.to_string(),
                        message: "no schema discovered".to_string(),
                    })?;
                let mut stream = BackfillStream::open(
                    &group.url,
                    group.connect_timeout,
                    table.clone(),
                    schema,
                    snapshot,
                    batch_size,
                )
                .await?;
                while let Some(batch) = stream.next_batch().await? {
                    if self.shutdown.is_cancelled() {
                        return Err(Error::Shutdown);
                    }
                    pipeline.load(batch).await?;
                }
            }

            if pipeline.checkpoint().is_zero() {
                pipeline.advance(backfill_lsn).await?;
            }
        }
        Ok(())
    }

    /// Replays the slot up to the snapshot position for pipelines that
    /// were behind it, skipping tables they just backfilled.
    async fn catch_up(
        &self,
        group: &mut SourceGroup,
        plans: &[PipelinePlan],
        backfill_lsn: Lsn,
    ) -> Result<()> {
        let behind: Vec<Lsn> = group
            .pipelines
            .iter()
            .zip(plans)
            .filter(|(_, plan)| !plan.catch_up.is_empty())
            .map(|(pipeline, _)| pipeline.checkpoint())
            .collect();
        if behind.is_empty() {
            return Ok(());
        }

        let start = resume_position(behind);
        info!(
            connection = %group.connection,
            from = %start,
            to = %backfill_lsn,
            "Catching up"
        );
        let mut stream = group.client.start(start, backfill_lsn).await?;
        let subscriptions: Vec<&BTreeSet<TableName>> =
            plans.iter().map(|plan| &plan.catch_up).collect();

        let result = replay(
            &mut stream,
            &mut group.pipelines,
            &subscriptions,
            &self.shutdown,
        )
        .await;

        group.client.stop();
        group.client.join().await;
        result
    }
}

/// Applies a bounded stream to the pipelines in place, each receiving the
/// changesets of its subscription.
async fn replay<S>(
    stream: &mut S,
    pipelines: &mut [Pipeline],
    subscriptions: &[&BTreeSet<TableName>],
    shutdown: &CancellationToken,
) -> Result<()>
where
    S: Stream<Item = Result<Transaction>> + Unpin,
{
    while let Some(transaction) = next_transaction(stream, shutdown).await? {
        let position = transaction.flush_position;
        let changesets = share(transaction);
        let routed = fan_out(&changesets, subscriptions);
        for (pipeline, changesets) in pipelines.iter_mut().zip(routed) {
            if !changesets.is_empty() {
                pipeline.apply(&changesets, position).await?;
            }
        }
    }
    Ok(())
}

/// Pipelines that backfilled or caught up now stand at the snapshot.
async fn raise_checkpoints(
    pipelines: &mut [Pipeline],
    plans: &[PipelinePlan],
    backfill_lsn: Lsn,
) -> Result<()> {
    for (pipeline, plan) in pipelines.iter_mut().zip(plans) {
        if !plan.backfill.is_empty() || !plan.catch_up.is_empty() {
            pipeline.advance(backfill_lsn).await?;
        }
    }
    Ok(())
}

fn share(transaction: Transaction) -> Vec<Arc<Changeset>> {
    transaction.changesets.into_iter().map(Arc::new).collect()
}

/// Next transaction, `None` at the end of the stream. Shutdown surfaces as
/// `Error::Shutdown`.
async fn next_transaction<S>(
    stream: &mut S,
    shutdown: &CancellationToken,
) -> Result<Option<Transaction>>
where
    S: Stream<Item = Result<Transaction>> + Unpin,
{
    tokio::select! {
        _ = shutdown.cancelled() => Err(Error::Shutdown),
        item = stream.next() => item.transpose(),
    }
}

/// Keeps the more telling of two outcomes: an actual failure wins over a
/// shutdown, and an earlier failure wins over a later one.
fn first_failure(current: Result<()>, next: Result<()>) -> Result<()> {
    match (&current, &next) {
        (Ok(()), _) | (Err(Error::Shutdown), Err(_)) => next,
        _ => current,
    }
}

/// A dispatched transaction awaiting its pipelines.
struct PendingAck {
    position: Lsn,
    done: Vec<oneshot::Receiver<Result<()>>>,
    outcome: Result<()>,
}

impl PendingAck {
    fn new(position: Lsn, done: Vec<oneshot::Receiver<Result<()>>>) -> Self {
        Self {
            position,
            done,
            outcome: Ok(()),
        }
    }

    /// A pipeline dropping the work without an answer counts as shutdown.
    fn record(&mut self, answer: std::result::Result<Result<()>, oneshot::error::RecvError>) {
        let answer = answer.unwrap_or(Err(Error::Shutdown));
        let current = std::mem::replace(&mut self.outcome, Ok(()));
        self.outcome = first_failure(current, answer);
    }

    /// Collects answers without waiting; true once every pipeline answered.
    fn poll(&mut self) -> bool {
        let mut remaining = Vec::with_capacity(self.done.len());
        for mut done in std::mem::take(&mut self.done) {
            match done.try_recv() {
                Ok(answer) => self.record(Ok(answer)),
                Err(oneshot::error::TryRecvError::Empty) => remaining.push(done),
                Err(oneshot::error::TryRecvError::Closed) => self.record(Ok(Err(Error::Shutdown))),
            }
        }
        self.done = remaining;
        self.done.is_empty()
    }

    /// Resolves once every pipeline answered. Cancel safe.
    async fn ready(&mut self) {
        while let Some(done) = self.done.last_mut() {
            let answer = done.await;
            self.done.pop();
            self.record(answer);
        }
    }

    fn finish(self) -> Result<Lsn> {
        self.outcome.map(|()| self.position)
    }

    async fn wait(mut self) -> Result<Lsn> {
        self.ready().await;
        self.finish()
    }
}

/// Dispatched transactions in commit order. A position is acknowledged only
/// once it and everything before it committed in every interested pipeline.
struct AckWindow {
    pending: VecDeque<PendingAck>,
    capacity: usize,
}

impl AckWindow {
    fn new(capacity: usize) -> Self {
        Self {
            pending: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    fn push(&mut self, pending: PendingAck) {
        self.pending.push_back(pending);
    }

    /// Acknowledges finished transactions from the front without waiting.
    /// Stops at the first failure and returns it.
    fn settle_ready(&mut self, acknowledge: &mut impl FnMut(Lsn)) -> Result<()> {
        let mut last = None;
        while let Some(front) = self.pending.front_mut() {
            if !front.poll() {
                break;
            }
            if let Some(pending) = self.pending.pop_front() {
                let position = pending.finish()?;
                acknowledge(position);
                last = Some(position);
            }
        }
        if let Some(lsn) = last {
            debug!(lsn = %lsn, "Acknowledged");
        }
        Ok(())
    }

    /// Like `settle_ready`, then blocks while more than `capacity`
    /// transactions are outstanding.
    async fn settle(&mut self, acknowledge: &mut impl FnMut(Lsn)) -> Result<()> {
        self.settle_ready(acknowledge)?;
        while self.pending.len() > self.capacity {
            if let Some(pending) = self.pending.pop_front() {
                acknowledge(pending.wait().await?);
            }
        }
        Ok(())
    }

    /// Resolves when the oldest transaction has every answer. Never
    /// resolves while the window is empty.
    async fn front_ready(&mut self) {
        match self.pending.front_mut() {
            Some(front) => front.ready().await,
            None => std::future::pending().await,
        }
    }

    /// Waits out every in-flight transaction. Positions are acknowledged
    /// while `acknowledging` holds and up to the first failure.
    async fn drain(&mut self, acknowledge: &mut impl FnMut(Lsn), mut acknowledging: bool) -> Result<()> {
        let mut result = Ok(());
        while let Some(pending) = self.pending.pop_front() {
            match pending.wait().await {
                Ok(position) if acknowledging => acknowledge(position),
                Ok(_) => {}
                Err(e) => {
                    acknowledging = false;
                    result = first_failure(result, Err(e));
                }
            }
        }
        result
    }
}

/// Streams one group until shutdown or failure.
async fn stream_group(
    mut group: SourceGroup,
    capacity: usize,
    shutdown: CancellationToken,
) -> Result<()> {
    let handles: Vec<PipelineHandle> = group
        .pipelines
        .drain(..)
        .map(|pipeline| PipelineHandle::spawn(pipeline, capacity, shutdown.clone()))
        .collect();
    let start = resume_position(handles.iter().map(|h| h.initial_checkpoint()));
    info!(connection = %group.connection, from = %start, "Streaming");

    let stream = group.client.start(start, Lsn::ZERO).await;
    let acknowledger = group.client.acknowledger();
    let mut acknowledge = |lsn: Lsn| acknowledger.acknowledge(lsn);
    let result = match stream {
        Ok(mut stream) => {
            stream_transactions(&mut stream, &handles, capacity, &mut acknowledge, &shutdown).await
        }
        Err(e) => Err(e),
    };

    if !matches!(result, Err(Error::Shutdown)) {
        shutdown.cancel();
    }
    if let Err(e) = group.client.close().await {
        warn!(connection = %group.connection, "Closing replication client failed: {}", e);
    }
    for handle in handles {
        handle.shutdown().await;
    }
    result
}

/// Pumps `stream` until it stops, then waits out the work in flight.
async fn stream_transactions<S>(
    stream: &mut S,
    handles: &[PipelineHandle],
    capacity: usize,
    acknowledge: &mut impl FnMut(Lsn),
    shutdown: &CancellationToken,
) -> Result<()>
where
    S: Stream<Item = Result<Transaction>> + Unpin,
{
    let mut window = AckWindow::new(capacity);
    let outcome = pump(stream, handles, &mut window, acknowledge, shutdown).await;

    // after a pipeline failure nothing more may be acknowledged
    let acknowledging = matches!(outcome, Err(Error::Shutdown));
    let drained = window.drain(acknowledge, acknowledging).await;
    first_failure(outcome, drained)
}

/// Feeds `stream` into the pipelines and acknowledges what they committed.
/// Only returns on failure, shutdown or the end of the stream.
async fn pump<S>(
    stream: &mut S,
    handles: &[PipelineHandle],
    window: &mut AckWindow,
    acknowledge: &mut impl FnMut(Lsn),
    shutdown: &CancellationToken,
) -> Result<()>
where
    S: Stream<Item = Result<Transaction>> + Unpin,
{
    let subscriptions: Vec<&BTreeSet<TableName>> = handles.iter().map(|h| h.tables()).collect();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Err(Error::Shutdown),
            _ = window.front_ready() => window.settle_ready(acknowledge)?,
            item = stream.next() => {
                let transaction = item.transpose()?.ok_or_else(|| Error::Replication {
                    message: "replication stream ended".to_string(),
                })?;

                let position = transaction.flush_position;
                let changesets = share(transaction);
                let mut done = Vec::new();
                for (handle, changesets) in handles.iter().zip(fan_out(&changesets, &subscriptions)) {
                    if !changesets.is_empty() {
                        done.push(handle.dispatch(changesets, position).await?);
                    }
                }
                window.push(PendingAck::new(position, done));
                window.settle(acknowledge).await?;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::postgres::{Column, Operation, Value};
    use crate::sink::memory::MemoryWriter;
    use crate::sink::IdentityReader;
    use tokio::sync::mpsc;
    use tokio_stream::wrappers::ReceiverStream;

    fn table(name: &str) -> TableName {
        TableName::new("public", name)
    }

    fn tables(names: &[&str]) -> BTreeSet<TableName> {
        names.iter().map(|name| table(name)).collect()
    }

    fn changeset(name: &str, id: i64) -> Arc<Changeset> {
        let schema = vec![Column::new("id", "integer")];
        let mut changeset = Changeset::new(table(name), Operation::Insert, &schema);
        changeset.rows.push(vec![Value::Int(id), Value::Null]);
        Arc::new(changeset)
    }

    fn outcome(newly: &[&str], lsn: u64, snapshot: bool) -> SetupOutcome {
        SetupOutcome {
            newly_published: tables(newly),
            backfill_lsn: Lsn(lsn),
            snapshot: snapshot.then(|| "00000003-00000002-1".to_string()),
        }
    }

    #[test]
    fn test_unseeded_pipeline_backfills_everything() {
        let plan = plan_pipeline(&tables(&["countries", "whiskies"]), Lsn::ZERO, &outcome(&[], 100, true));
        assert_eq!(plan.backfill, tables(&["countries", "whiskies"]));
        assert!(plan.catch_up.is_empty());
        assert!(plan.is_full_backfill(&tables(&["countries", "whiskies"])));
    }

    #[test]
    fn test_new_table_is_backfilled_and_rest_caught_up() {
        let plan = plan_pipeline(
            &tables(&["countries", "whiskies"]),
            Lsn(50),
            &outcome(&["whiskies"], 100, true),
        );
        assert_eq!(plan.backfill, tables(&["whiskies"]));
        assert_eq!(plan.catch_up, tables(&["countries"]));
        assert!(!plan.is_full_backfill(&tables(&["countries", "whiskies"])));
    }

    #[test]
    fn test_pipeline_at_snapshot_needs_no_catch_up() {
        let plan = plan_pipeline(&tables(&["countries"]), Lsn(100), &outcome(&["whiskies"], 100, true));
        assert_eq!(plan, PipelinePlan::default());
    }

    #[test]
    fn test_resume_without_snapshot_plans_nothing() {
        let plan = plan_pipeline(&tables(&["countries"]), Lsn(10), &outcome(&[], 100, false));
        assert_eq!(plan, PipelinePlan::default());
    }

    #[test]
    fn test_fan_out_routes_every_changeset_in_order() {
        let changesets = vec![
            changeset("countries", 1),
            changeset("whiskies", 2),
            changeset("countries", 3),
            changeset("regions", 4),
        ];
        let countries = tables(&["countries"]);
        let both = tables(&["countries", "whiskies"]);
        let none = tables(&[]);

        let routed = fan_out(&changesets, &[&countries, &both, &none]);
        assert_eq!(routed.len(), 3);

        let ids = |list: &Vec<Arc<Changeset>>| -> Vec<Value> {
            list.iter().map(|c| c.rows[0][0].clone()).collect()
        };
        assert_eq!(ids(&routed[0]), vec![Value::Int(1), Value::Int(3)]);
        assert_eq!(ids(&routed[1]), vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
        assert!(routed[2].is_empty());

        for (list, subscription) in routed.iter().zip([&countries, &both, &none]) {
            let expected = changesets
                .iter()
                .filter(|c| subscription.contains(&c.table))
                .count();
            assert_eq!(list.len(), expected);
        }
    }

    #[test]
    fn test_resume_position_is_minimum_checkpoint() {
        assert_eq!(resume_position([Lsn(300), Lsn(120), Lsn(450)]), Lsn(120));
        assert_eq!(resume_position(Vec::new()), Lsn::ZERO);
    }

    #[test]
    fn test_failure_outranks_shutdown() {
        let failed = || {
            Err(Error::Pipeline {
                pipeline: "whiskies".to_string(),
                message: "write refused".to_string(),
            })
        };
        assert!(matches!(first_failure(Ok(()), Err(Error::Shutdown)), Err(Error::Shutdown)));
        assert!(matches!(first_failure(Err(Error::Shutdown), failed()), Err(Error::Pipeline { .. })));
        assert!(matches!(first_failure(failed(), Err(Error::Shutdown)), Err(Error::Pipeline { .. })));
        assert!(first_failure(Ok(()), Ok(())).is_ok());
    }

    #[tokio::test]
    async fn test_pending_ack_waits_for_all_pipelines() {
        let (first_tx, first_rx) = oneshot::channel();
        let (second_tx, second_rx) = oneshot::channel();
        let mut pending = PendingAck::new(Lsn(42), vec![first_rx, second_rx]);

        assert!(!pending.poll());
        first_tx.send(Ok(())).unwrap();
        assert!(!pending.poll());
        second_tx.send(Ok(())).unwrap();
        assert!(pending.poll());
        assert_eq!(pending.wait().await.unwrap(), Lsn(42));
    }

    #[tokio::test]
    async fn test_pending_ack_surfaces_pipeline_failure() {
        let (failed_tx, failed_rx) = oneshot::channel();
        let (dropped_tx, dropped_rx) = oneshot::channel::<Result<()>>();
        let pending = PendingAck::new(Lsn(42), vec![failed_rx, dropped_rx]);
        drop(dropped_tx);
        failed_tx
            .send(Err(Error::Pipeline {
                pipeline: "countries".to_string(),
                message: "boom".to_string(),
            }))
            .unwrap();
        assert!(matches!(pending.wait().await, Err(Error::Pipeline { .. })));

        let (tx, rx) = oneshot::channel::<Result<()>>();
        drop(tx);
        let mut pending = PendingAck::new(Lsn(43), vec![rx]);
        assert!(pending.poll());
        assert!(matches!(pending.finish(), Err(Error::Shutdown)));
    }

    #[tokio::test]
    async fn test_acknowledgements_follow_commit_order() {
        let mut window = AckWindow::new(4);
        let (first_tx, first_rx) = oneshot::channel();
        let (second_tx, second_rx) = oneshot::channel();
        window.push(PendingAck::new(Lsn(100), vec![first_rx]));
        window.push(PendingAck::new(Lsn(200), vec![second_rx]));
        window.push(PendingAck::new(Lsn(250), Vec::new()));

        let mut acked = Vec::new();
        let mut acknowledge = |lsn: Lsn| acked.push(lsn);

        second_tx.send(Ok(())).unwrap();
        window.settle(&mut acknowledge).await.unwrap();
        first_tx.send(Ok(())).unwrap();
        window.settle(&mut acknowledge).await.unwrap();

        assert_eq!(acked, vec![Lsn(100), Lsn(200), Lsn(250)]);
    }

    #[tokio::test]
    async fn test_failed_transaction_blocks_later_acknowledgements() {
        let mut window = AckWindow::new(4);
        let mut senders = Vec::new();
        for lsn in [100, 200, 300] {
            let (tx, rx) = oneshot::channel();
            senders.push(tx);
            window.push(PendingAck::new(Lsn(lsn), vec![rx]));
        }
        let mut answers = vec![
            Ok(()),
            Err(Error::Pipeline {
                pipeline: "whiskies".to_string(),
                message: "write refused".to_string(),
            }),
            Ok(()),
        ];
        for tx in senders {
            tx.send(answers.remove(0)).unwrap();
        }

        let mut acked = Vec::new();
        let mut acknowledge = |lsn: Lsn| acked.push(lsn);
        let err = window.settle(&mut acknowledge).await.unwrap_err();
        assert!(matches!(err, Error::Pipeline { .. }));
        window.drain(&mut acknowledge, false).await.unwrap();

        assert_eq!(acked, vec![Lsn(100)]);
    }

    #[tokio::test]
    async fn test_drain_stops_acknowledging_at_failure() {
        let mut window = AckWindow::new(4);
        let (failed_tx, failed_rx) = oneshot::channel();
        window.push(PendingAck::new(Lsn(100), vec![failed_rx]));
        window.push(PendingAck::new(Lsn(200), Vec::new()));
        failed_tx
            .send(Err(Error::Pipeline {
                pipeline: "whiskies".to_string(),
                message: "write refused".to_string(),
            }))
            .unwrap();

        let mut acked = Vec::new();
        let result = window.drain(&mut |lsn: Lsn| acked.push(lsn), true).await;
        assert!(matches!(result, Err(Error::Pipeline { .. })));
        assert!(acked.is_empty());
    }

    #[tokio::test]
    async fn test_full_window_waits_for_oldest() {
        let mut window = AckWindow::new(1);
        let (first_tx, first_rx) = oneshot::channel();
        let (_second_tx, second_rx) = oneshot::channel();
        window.push(PendingAck::new(Lsn(10), vec![first_rx]));
        window.push(PendingAck::new(Lsn(20), vec![second_rx]));

        let mut acked = Vec::new();
        {
            let mut acknowledge = |lsn: Lsn| acked.push(lsn);
            let settle = window.settle(&mut acknowledge);
            tokio::pin!(settle);
            assert!(tokio::time::timeout(Duration::from_millis(50), &mut settle)
                .await
                .is_err());
            first_tx.send(Ok(())).unwrap();
            settle.await.unwrap();
        }

        assert_eq!(acked, vec![Lsn(10)]);
        assert_eq!(window.pending.len(), 1);
    }

    fn transaction(lsn: u64, changes: &[(&str, i64)]) -> Result<Transaction> {
        Ok(Transaction {
            changesets: changes
                .iter()
                .map(|(name, id)| (*changeset(name, *id)).clone())
                .collect(),
            flush_position: Lsn(lsn),
        })
    }

    async fn memory_pipeline(name: &str, subscribed: &[&str], writer: MemoryWriter) -> Pipeline {
        let mut pipeline = Pipeline::new(
            name,
            "source",
            tables(subscribed),
            None,
            Box::new(IdentityReader),
            Box::new(writer),
        );
        pipeline.open().await.unwrap();
        pipeline
    }

    #[tokio::test]
    async fn test_streaming_resumes_each_pipeline_from_its_checkpoint() {
        let behind = MemoryWriter::with_checkpoint(Lsn(50));
        let ahead = MemoryWriter::with_checkpoint(Lsn(100));
        let shutdown = CancellationToken::new();
        let handles = vec![
            PipelineHandle::spawn(
                memory_pipeline("behind", &["countries"], behind.clone()).await,
                4,
                shutdown.clone(),
            ),
            PipelineHandle::spawn(
                memory_pipeline("ahead", &["countries"], ahead.clone()).await,
                4,
                shutdown.clone(),
            ),
        ];
        assert_eq!(
            resume_position(handles.iter().map(|h| h.initial_checkpoint())),
            Lsn(50)
        );

        let (tx, rx) = mpsc::channel(8);
        tx.send(transaction(80, &[("countries", 1)])).await.unwrap();
        tx.send(transaction(150, &[("countries", 2)])).await.unwrap();
        tx.send(Ok(Transaction::boundary(Lsn(160)))).await.unwrap();
        let mut stream = ReceiverStream::new(rx);

        // the source goes quiet after the boundary; acknowledgements still
        // arrive as the pipelines commit
        let (acks_tx, mut acks) = mpsc::unbounded_channel();
        let mut acknowledge = |lsn: Lsn| {
            let _ = acks_tx.send(lsn);
        };
        let streaming = stream_transactions(&mut stream, &handles, 4, &mut acknowledge, &shutdown);
        let observed = async {
            let mut seen = Vec::new();
            while seen.len() < 3 {
                match tokio::time::timeout(Duration::from_secs(5), acks.recv()).await {
                    Ok(Some(lsn)) => seen.push(lsn),
                    _ => break,
                }
            }
            shutdown.cancel();
            seen
        };
        let (outcome, seen) = tokio::join!(streaming, observed);

        assert!(matches!(outcome, Err(Error::Shutdown)));
        assert_eq!(seen, vec![Lsn(80), Lsn(150), Lsn(160)]);
        assert_eq!(behind.state().rows.len(), 2);
        assert_eq!(behind.state().checkpoint, Lsn(150));
        assert_eq!(ahead.state().rows.len(), 1);
        assert_eq!(ahead.state().checkpoint, Lsn(150));

        drop(tx);
        for handle in handles {
            handle.shutdown().await;
        }
    }

    #[tokio::test]
    async fn test_streaming_failure_is_never_acknowledged() {
        let healthy = MemoryWriter::default();
        let failing = MemoryWriter::default();
        failing.fail_on(table("whiskies"));
        let shutdown = CancellationToken::new();
        let handles = vec![
            PipelineHandle::spawn(
                memory_pipeline("countries", &["countries"], healthy.clone()).await,
                4,
                shutdown.clone(),
            ),
            PipelineHandle::spawn(
                memory_pipeline("whiskies", &["whiskies"], failing.clone()).await,
                4,
                shutdown.clone(),
            ),
        ];

        let (tx, rx) = mpsc::channel(8);
        tx.send(transaction(10, &[("countries", 1)])).await.unwrap();
        tx.send(transaction(20, &[("whiskies", 2)])).await.unwrap();
        tx.send(transaction(30, &[("countries", 3)])).await.unwrap();
        let mut stream = ReceiverStream::new(rx);

        let mut acked = Vec::new();
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            stream_transactions(
                &mut stream,
                &handles,
                4,
                &mut |lsn: Lsn| acked.push(lsn),
                &shutdown,
            ),
        )
        .await
        .unwrap();

        assert!(matches!(result, Err(Error::Pipeline { ref pipeline, .. }) if pipeline == "whiskies"));
        assert!(shutdown.is_cancelled());
        assert!(!acked.contains(&Lsn(20)));
        assert!(!acked.contains(&Lsn(30)));
        assert_eq!(failing.state().checkpoint, Lsn::ZERO);

        drop(tx);
        for handle in handles {
            handle.shutdown().await;
        }
    }

    #[tokio::test]
    async fn test_catch_up_replays_from_each_checkpoint_then_raises() {
        let behind = MemoryWriter::with_checkpoint(Lsn(50));
        let ahead = MemoryWriter::with_checkpoint(Lsn(100));
        let mut pipelines = vec![
            memory_pipeline("behind", &["countries", "whiskies"], behind.clone()).await,
            memory_pipeline("ahead", &["countries"], ahead.clone()).await,
        ];

        let setup = outcome(&["whiskies"], 120, true);
        let plans: Vec<PipelinePlan> = pipelines
            .iter()
            .map(|p| plan_pipeline(p.tables(), p.checkpoint(), &setup))
            .collect();
        assert_eq!(plans[0].backfill, tables(&["whiskies"]));
        assert_eq!(plans[0].catch_up, tables(&["countries"]));
        assert_eq!(plans[1].catch_up, tables(&["countries"]));

        let subscriptions: Vec<&BTreeSet<TableName>> =
            plans.iter().map(|plan| &plan.catch_up).collect();
        let mut stream = futures::stream::iter(vec![
            transaction(80, &[("countries", 1), ("whiskies", 7)]),
            transaction(110, &[("countries", 2)]),
        ]);
        replay(&mut stream, &mut pipelines, &subscriptions, &CancellationToken::new())
            .await
            .unwrap();
        raise_checkpoints(&mut pipelines, &plans, Lsn(120)).await.unwrap();

        let state = behind.state();
        assert_eq!(state.rows.len(), 2);
        assert!(state.rows.iter().all(|(_, t, _)| *t == table("countries")));
        assert_eq!(state.checkpoint, Lsn(120));
        drop(state);

        assert_eq!(ahead.state().rows.len(), 1);
        assert_eq!(ahead.state().checkpoint, Lsn(120));
        assert!(pipelines.iter().all(|p| p.checkpoint() == Lsn(120)));
    }
}
