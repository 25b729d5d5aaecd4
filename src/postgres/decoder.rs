use serde::Deserialize;
use std::collections::HashMap;
use std::iter::Peekable;
use std::vec::IntoIter;
use tracing::trace;

use super::types::{Changeset, Lsn, Operation, Row, TableName, TableSchema, Transaction, Value};
use crate::{Error, Result};

/// One wal2json (format 1) document; the server emits one per transaction.
#[derive(Debug, Clone, Deserialize)]
pub struct Wal2JsonMessage {
    /// End of the commit record, present with `include-lsn`. Unlike the
    /// XLogData start, it grows in commit order.
    #[serde(default)]
    pub nextlsn: Option<String>,
    #[serde(default)]
    pub change: Vec<ChangeRecord>,
}

/// A single row change as emitted by wal2json.
#[derive(Debug, Clone, Deserialize)]
pub struct ChangeRecord {
    pub kind: String,
    #[serde(default)]
    pub schema: String,
    #[serde(default)]
    pub table: String,
    #[serde(default)]
    pub columnnames: Vec<String>,
    #[serde(default)]
    pub columnvalues: Vec<serde_json::Value>,
    #[serde(default)]
    pub oldkeys: Option<OldKeys>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OldKeys {
    #[serde(default)]
    pub keynames: Vec<String>,
    #[serde(default)]
    pub keyvalues: Vec<serde_json::Value>,
}

impl ChangeRecord {
    pub fn operation(&self) -> Result<Operation> {
        match self.kind.as_str() {
            "insert" => Ok(Operation::Insert),
            "update" => Ok(Operation::Update),
            "delete" => Ok(Operation::Delete),
            other => Err(Error::decode(format!("unknown operation kind '{}'", other))),
        }
    }

    pub fn table_name(&self) -> TableName {
        TableName::new(self.schema.clone(), self.table.clone())
    }
}

/// Turns wal2json payloads into changesets using the column layout
/// discovered for each published table.
#[derive(Debug, Clone, Default)]
pub struct Wal2JsonDecoder {
    schemas: HashMap<TableName, TableSchema>,
}

impl Wal2JsonDecoder {
    pub fn new(schemas: HashMap<TableName, TableSchema>) -> Self {
        Self { schemas }
    }

    pub fn schemas(&self) -> &HashMap<TableName, TableSchema> {
        &self.schemas
    }

    pub fn parse(data: &[u8]) -> Result<Vec<ChangeRecord>> {
        let message: Wal2JsonMessage = serde_json::from_slice(data)?;
        Ok(message.change)
    }

    /// Decodes one XLogData payload. The transaction is positioned at its
    /// commit end (`nextlsn`).
    pub fn decode_transaction(&self, data: &[u8]) -> Result<Transaction> {
        let message: Wal2JsonMessage = serde_json::from_slice(data)?;
        let position: Lsn = message
            .nextlsn
            .as_deref()
            .ok_or_else(|| Error::decode("transaction carries no nextlsn"))?
            .parse()?;
        trace!("Decoding {} change records at {}", message.change.len(), position);
        let changesets = self.changesets(message.change).collect::<Result<Vec<_>>>()?;
        Ok(Transaction {
            changesets,
            flush_position: position,
        })
    }

    /// Lazily groups records into changesets of contiguous same-table,
    /// same-operation runs.
    pub fn changesets(&self, records: Vec<ChangeRecord>) -> Changesets<'_> {
        Changesets {
            records: records.into_iter().peekable(),
            schemas: &self.schemas,
            failed: false,
        }
    }
}

pub struct Changesets<'a> {
    records: Peekable<IntoIter<ChangeRecord>>,
    schemas: &'a HashMap<TableName, TableSchema>,
    failed: bool,
}

impl<'a> Changesets<'a> {
    fn next_changeset(&mut self, first: ChangeRecord) -> Result<Changeset> {
        let operation = first.operation()?;
        let table = first.table_name();
        let schemas = self.schemas;
        let schema = schemas
            .get(&table)
            .ok_or_else(|| Error::decode(format!("no schema for table {}", table)))?;

        let mut changeset = Changeset::new(table, operation, schema);
        changeset.rows.push(decode_row(&first, operation, schema)?);

        while let Some(next) = self.records.peek() {
            if next.schema != changeset.table.schema
                || next.table != changeset.table.name
                || next.operation()? != operation
            {
                break;
            }
            if let Some(record) = self.records.next() {
                changeset.rows.push(decode_row(&record, operation, schema)?);
            }
        }

        Ok(changeset)
    }
}

impl<'a> Iterator for Changesets<'a> {
    type Item = Result<Changeset>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let first = self.records.next()?;
        let result = self.next_changeset(first);
        if result.is_err() {
            self.failed = true;
        }
        Some(result)
    }
}

fn decode_row(record: &ChangeRecord, operation: Operation, schema: &TableSchema) -> Result<Row> {
    let width = schema.len();
    let mut row = vec![Value::Null; width * 2];

    if operation != Operation::Delete {
        if record.columnnames.len() != record.columnvalues.len() {
            return Err(Error::decode(format!(
                "{} {}.{}: {} column names but {} values",
                record.kind,
                record.schema,
                record.table,
                record.columnnames.len(),
                record.columnvalues.len()
            )));
        }
        fill(&mut row, 0, schema, &record.columnnames, &record.columnvalues, record)?;
    }

    if operation != Operation::Insert {
        let oldkeys = record.oldkeys.as_ref().ok_or_else(|| {
            Error::decode(format!(
                "{} on {}.{} carries no old keys",
                record.kind, record.schema, record.table
            ))
        })?;
        if oldkeys.keynames.len() != oldkeys.keyvalues.len() {
            return Err(Error::decode(format!(
                "{} {}.{}: {} key names but {} values",
                record.kind,
                record.schema,
                record.table,
                oldkeys.keynames.len(),
                oldkeys.keyvalues.len()
            )));
        }
        fill(&mut row, width, schema, &oldkeys.keynames, &oldkeys.keyvalues, record)?;
    }

    Ok(row)
}

fn fill(
    row: &mut Row,
    offset: usize,
    schema: &TableSchema,
    names: &[String],
    values: &[serde_json::Value],
    record: &ChangeRecord,
) -> Result<()> {
    for (name, value) in names.iter().zip(values) {
        let index = schema
            .iter()
            .position(|column| &column.name == name)
            .ok_or_else(|| {
                Error::decode(format!(
                    "unknown column '{}' in {}.{}",
                    name, record.schema, record.table
                ))
            })?;
        row[offset + index] = Value::from_json(schema[index].kind, value)?;
    }
    Ok(())
}
