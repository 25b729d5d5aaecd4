use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard};

use super::{RowSet, Writer};
use crate::postgres::{Lsn, Operation, TableName};
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Event {
    Begin,
    Write(Operation, TableName, usize),
    SetCheckpoint(Lsn),
    Truncate(TableName),
    Commit,
    Rollback,
    Close,
}

#[derive(Debug, Default)]
pub(crate) struct MemoryState {
    pub events: Vec<Event>,
    pub checkpoint: Lsn,
    pub rows: Vec<(Operation, TableName, RowSet)>,
    pub fail_on: Option<TableName>,
    staged_checkpoint: Option<Lsn>,
    staged_rows: Vec<(Operation, TableName, RowSet)>,
    in_transaction: bool,
}

/// Writer keeping everything in memory with transactional visibility.
#[derive(Debug, Clone, Default)]
pub(crate) struct MemoryWriter {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryWriter {
    pub fn with_checkpoint(lsn: Lsn) -> Self {
        let writer = Self::default();
        writer.state().checkpoint = lsn;
        writer
    }

    pub fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap()
    }

    pub fn fail_on(&self, table: TableName) {
        self.state().fail_on = Some(table);
    }
}

#[async_trait]
impl Writer for MemoryWriter {
    async fn setup_checkpoint_storage(&mut self) -> Result<()> {
        Ok(())
    }

    async fn checkpoint(&mut self) -> Result<Lsn> {
        Ok(self.state().checkpoint)
    }

    async fn set_checkpoint(&mut self, lsn: Lsn) -> Result<()> {
        let mut state = self.state();
        state.events.push(Event::SetCheckpoint(lsn));
        if state.in_transaction {
            let staged = state.staged_checkpoint.unwrap_or(state.checkpoint).max(lsn);
            state.staged_checkpoint = Some(staged);
        } else {
            state.checkpoint = state.checkpoint.max(lsn);
        }
        Ok(())
    }

    async fn write(&mut self, operation: Operation, table: &TableName, rows: &RowSet) -> Result<u64> {
        let mut state = self.state();
        if state.fail_on.as_ref() == Some(table) {
            return Err(Error::Connection(format!("write to {} refused", table)));
        }
        state
            .events
            .push(Event::Write(operation, table.clone(), rows.rows.len()));
        let entry = (operation, table.clone(), rows.clone());
        if state.in_transaction {
            state.staged_rows.push(entry);
        } else {
            state.rows.push(entry);
        }
        Ok(rows.rows.len() as u64)
    }

    async fn truncate(&mut self, table: &TableName) -> Result<()> {
        let mut state = self.state();
        state.events.push(Event::Truncate(table.clone()));
        state.rows.clear();
        Ok(())
    }

    async fn begin(&mut self) -> Result<()> {
        let mut state = self.state();
        state.events.push(Event::Begin);
        state.in_transaction = true;
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        let mut state = self.state();
        state.events.push(Event::Commit);
        state.in_transaction = false;
        let staged = std::mem::take(&mut state.staged_rows);
        state.rows.extend(staged);
        if let Some(lsn) = state.staged_checkpoint.take() {
            state.checkpoint = state.checkpoint.max(lsn);
        }
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        let mut state = self.state();
        state.events.push(Event::Rollback);
        state.in_transaction = false;
        state.staged_rows.clear();
        state.staged_checkpoint = None;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.state().events.push(Event::Close);
        Ok(())
    }
}
