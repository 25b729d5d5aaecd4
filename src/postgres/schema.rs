use std::collections::HashMap;
use tokio_postgres::Client;
use tracing::debug;

use super::types::{Column, TableName, TableSchema};
use crate::{Error, Result};

const COLUMNS_QUERY: &str = "\
SELECT a.attname::text, format_type(a.atttypid, a.atttypmod)
FROM pg_catalog.pg_attribute a
WHERE a.attrelid = $1::text::regclass
  AND a.attnum > 0
  AND NOT a.attisdropped
  AND a.attgenerated = ''
ORDER BY a.attnum";

/// Reads the ordered column list of `table` from the catalog.
pub async fn table_schema(client: &Client, table: &TableName) -> Result<TableSchema> {
    let rows = client
        .query(COLUMNS_QUERY, &[&table.quoted()])
        .await
        .map_err(|e| Error::setup(format!("cannot read columns of {}: {}", table, e)))?;

    let columns: TableSchema = rows
        .iter()
        .map(|row| Column::new(row.get::<_, String>(0), row.get::<_, String>(1)))
        .collect();
    if columns.is_empty() {
        return Err(Error::setup(format!("table {} has no columns", table)));
    }
    debug!("Discovered {} columns for {}", columns.len(), table);
    Ok(columns)
}

pub async fn discover<'a>(
    client: &Client,
    tables: impl IntoIterator<Item = &'a TableName>,
) -> Result<HashMap<TableName, TableSchema>> {
    let mut schemas = HashMap::new();
    for table in tables {
        schemas.insert(table.clone(), table_schema(client, table).await?);
    }
    Ok(schemas)
}
