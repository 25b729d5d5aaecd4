use bytes::BytesMut;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::error::Error as StdError;
use std::fmt;
use std::str::FromStr;
use tokio_postgres::types::{to_sql_checked, FromSql, IsNull, ToSql, Type};

use crate::{Error, Result};

/// Prefix of the shadow columns carrying pre-change values.
pub const OLD_PREFIX: &str = "old__";

/// Highest number of bind parameters PostgreSQL accepts in one statement.
pub const MAX_BIND_PARAMS: usize = 65535;

/// Position in the source write-ahead log. `Lsn(0)` means unset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Lsn(pub u64);

impl Lsn {
    pub const ZERO: Lsn = Lsn(0);

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 & 0xFFFF_FFFF)
    }
}

impl FromStr for Lsn {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::invalid_message(format!("invalid LSN '{}'", s));
        let (hi, lo) = s.split_once('/').ok_or_else(invalid)?;
        let hi = u64::from_str_radix(hi, 16).map_err(|_| invalid())?;
        let lo = u64::from_str_radix(lo, 16).map_err(|_| invalid())?;
        if hi > u32::MAX as u64 || lo > u32::MAX as u64 {
            return Err(invalid());
        }
        Ok(Lsn((hi << 32) | lo))
    }
}

impl From<u64> for Lsn {
    fn from(val: u64) -> Self {
        Lsn(val)
    }
}

impl From<Lsn> for u64 {
    fn from(lsn: Lsn) -> Self {
        lsn.0
    }
}

/// Schema-qualified table name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TableName {
    pub schema: String,
    pub name: String,
}

impl TableName {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
        }
    }

    /// Quoted form for use in SQL text.
    pub fn quoted(&self) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(&self.name))
    }
}

impl FromStr for TableName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (schema, name) = match s.split_once('.') {
            Some((schema, name)) => (schema, name),
            None => ("public", s),
        };
        if schema.is_empty() || name.is_empty() || name.contains('.') {
            return Err(Error::Config(format!("invalid table name '{}'", s)));
        }
        Ok(TableName::new(schema, name))
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

/// Double-quotes an SQL identifier.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Single-quotes an SQL string literal.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Insert => "insert",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Semantic type of a column, resolved once from the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnKind {
    Bool,
    Int,
    Float,
    Text,
    Json,
    Timestamp,
    TimestampTz,
    Date,
    /// Anything else; carried as text and cast back on the way in.
    Other,
}

impl ColumnKind {
    /// Maps a `pg_catalog.format_type` name to a kind.
    pub fn from_sql_type(sql_type: &str) -> Self {
        let base = sql_type
            .split('(')
            .next()
            .unwrap_or(sql_type)
            .trim();
        if base.ends_with("[]") {
            return ColumnKind::Other;
        }
        match base {
            "boolean" => ColumnKind::Bool,
            "smallint" | "integer" | "bigint" => ColumnKind::Int,
            "real" | "double precision" => ColumnKind::Float,
            "text" | "character varying" | "character" | "name" => ColumnKind::Text,
            "json" | "jsonb" => ColumnKind::Json,
            "timestamp without time zone" => ColumnKind::Timestamp,
            "timestamp with time zone" => ColumnKind::TimestampTz,
            "date" => ColumnKind::Date,
            _ => ColumnKind::Other,
        }
    }

    /// Type the bind parameter is declared as before casting to the
    /// column's own type.
    pub fn wire_type(&self) -> &'static str {
        match self {
            ColumnKind::Bool => "bool",
            ColumnKind::Int => "int8",
            ColumnKind::Float => "float8",
            ColumnKind::Text | ColumnKind::Other => "text",
            ColumnKind::Json => "jsonb",
            ColumnKind::Timestamp => "timestamp",
            ColumnKind::TimestampTz => "timestamptz",
            ColumnKind::Date => "date",
        }
    }

    /// Resolves the kind of a column returned by a query.
    pub fn from_type(ty: &Type) -> Self {
        match *ty {
            Type::BOOL => ColumnKind::Bool,
            Type::INT2 | Type::INT4 | Type::INT8 | Type::OID => ColumnKind::Int,
            Type::FLOAT4 | Type::FLOAT8 => ColumnKind::Float,
            Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME | Type::UNKNOWN => {
                ColumnKind::Text
            }
            Type::JSON | Type::JSONB => ColumnKind::Json,
            Type::TIMESTAMP => ColumnKind::Timestamp,
            Type::TIMESTAMPTZ => ColumnKind::TimestampTz,
            Type::DATE => ColumnKind::Date,
            _ => ColumnKind::Other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Column {
    pub name: String,
    pub kind: ColumnKind,
    /// Type as reported by the catalog, e.g. `character varying(64)`.
    pub sql_type: String,
}

impl Column {
    pub fn new(name: impl Into<String>, sql_type: impl Into<String>) -> Self {
        let sql_type = sql_type.into();
        Self {
            name: name.into(),
            kind: ColumnKind::from_sql_type(&sql_type),
            sql_type,
        }
    }

    /// Column produced by a query, typed from the statement description.
    pub fn from_type(name: impl Into<String>, ty: &Type) -> Self {
        let kind = ColumnKind::from_type(ty);
        let sql_type = match kind {
            ColumnKind::Other => ty.name().to_string(),
            _ => kind.wire_type().to_string(),
        };
        Self {
            name: name.into(),
            kind,
            sql_type,
        }
    }

    /// Shadow column holding the value before the change.
    pub fn old(&self) -> Column {
        Column {
            name: format!("{}{}", OLD_PREFIX, self.name),
            kind: self.kind,
            sql_type: self.sql_type.clone(),
        }
    }

    /// SQL expression binding parameter `$index` as this column's type.
    pub fn param_expr(&self, index: usize) -> String {
        let wire = self.kind.wire_type();
        match self.kind {
            ColumnKind::Other | ColumnKind::Text | ColumnKind::Int | ColumnKind::Float
            | ColumnKind::Json => format!("${}::{}::{}", index, wire, self.sql_type),
            _ => format!("${}::{}", index, wire),
        }
    }
}

pub type TableSchema = Vec<Column>;

/// A single column value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Json(serde_json::Value),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
    Date(NaiveDate),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Converts a wal2json value into the representation of `kind`.
    pub fn from_json(kind: ColumnKind, json: &serde_json::Value) -> Result<Value> {
        use serde_json::Value as Json;

        let mismatch = || Error::decode(format!("cannot convert {} to {:?}", json, kind));
        if json.is_null() {
            return Ok(Value::Null);
        }
        let value = match kind {
            ColumnKind::Bool => Value::Bool(json.as_bool().ok_or_else(mismatch)?),
            ColumnKind::Int => Value::Int(json.as_i64().ok_or_else(mismatch)?),
            ColumnKind::Float => match json {
                Json::Number(n) => Value::Float(n.as_f64().ok_or_else(mismatch)?),
                // NaN and Infinity arrive quoted
                Json::String(s) => Value::Float(s.parse().map_err(|_| mismatch())?),
                _ => return Err(mismatch()),
            },
            ColumnKind::Text | ColumnKind::Other => match json {
                Json::String(s) => Value::Text(s.clone()),
                Json::Number(n) => Value::Text(n.to_string()),
                Json::Bool(b) => Value::Text(b.to_string()),
                other => Value::Text(other.to_string()),
            },
            ColumnKind::Json => match json {
                Json::String(s) => Value::Json(serde_json::from_str(s)?),
                other => Value::Json(other.clone()),
            },
            ColumnKind::Timestamp => {
                let s = json.as_str().ok_or_else(mismatch)?;
                Value::Timestamp(
                    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f")
                        .map_err(|_| mismatch())?,
                )
            }
            ColumnKind::TimestampTz => {
                let s = json.as_str().ok_or_else(mismatch)?;
                Value::TimestampTz(parse_timestamptz(s).ok_or_else(mismatch)?)
            }
            ColumnKind::Date => {
                let s = json.as_str().ok_or_else(mismatch)?;
                Value::Date(NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|_| mismatch())?)
            }
        };
        Ok(value)
    }
}

fn parse_timestamptz(s: &str) -> Option<DateTime<Utc>> {
    // PostgreSQL abbreviates whole-hour offsets to "+00"
    let normalized = match s.rfind(['+', '-']) {
        Some(idx) if s.len() - idx == 3 && s[..idx].contains(' ') => format!("{}:00", s),
        _ => s.to_string(),
    };
    DateTime::parse_from_str(&normalized, "%Y-%m-%d %H:%M:%S%.f%:z")
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

impl ToSql for Value {
    fn to_sql(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> std::result::Result<IsNull, Box<dyn StdError + Sync + Send>> {
        match self {
            Value::Null => Ok(IsNull::Yes),
            Value::Bool(v) => v.to_sql(ty, out),
            Value::Int(v) => match *ty {
                Type::INT2 => i16::try_from(*v)?.to_sql(ty, out),
                Type::INT4 => i32::try_from(*v)?.to_sql(ty, out),
                _ => v.to_sql(ty, out),
            },
            Value::Float(v) => match *ty {
                Type::FLOAT4 => (*v as f32).to_sql(ty, out),
                _ => v.to_sql(ty, out),
            },
            Value::Text(v) => v.as_str().to_sql(ty, out),
            Value::Json(v) => v.to_sql(ty, out),
            Value::Timestamp(v) => v.to_sql(ty, out),
            Value::TimestampTz(v) => v.to_sql(ty, out),
            Value::Date(v) => v.to_sql(ty, out),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

impl<'a> FromSql<'a> for Value {
    fn from_sql(
        ty: &Type,
        raw: &'a [u8],
    ) -> std::result::Result<Self, Box<dyn StdError + Sync + Send>> {
        let value = match *ty {
            Type::BOOL => Value::Bool(bool::from_sql(ty, raw)?),
            Type::INT2 => Value::Int(i16::from_sql(ty, raw)? as i64),
            Type::INT4 => Value::Int(i32::from_sql(ty, raw)? as i64),
            Type::INT8 => Value::Int(i64::from_sql(ty, raw)?),
            Type::OID => Value::Int(u32::from_sql(ty, raw)? as i64),
            Type::FLOAT4 => Value::Float(f32::from_sql(ty, raw)? as f64),
            Type::FLOAT8 => Value::Float(f64::from_sql(ty, raw)?),
            Type::JSON | Type::JSONB => Value::Json(serde_json::Value::from_sql(ty, raw)?),
            Type::TIMESTAMP => Value::Timestamp(NaiveDateTime::from_sql(ty, raw)?),
            Type::TIMESTAMPTZ => Value::TimestampTz(DateTime::<Utc>::from_sql(ty, raw)?),
            Type::DATE => Value::Date(NaiveDate::from_sql(ty, raw)?),
            _ if <&str as FromSql>::accepts(ty) => Value::Text(<&str>::from_sql(ty, raw)?.to_string()),
            _ => {
                return Err(format!(
                    "unsupported column type {}; cast it to text in the query",
                    ty
                )
                .into())
            }
        };
        Ok(value)
    }

    fn from_sql_null(_ty: &Type) -> std::result::Result<Self, Box<dyn StdError + Sync + Send>> {
        Ok(Value::Null)
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }
}

pub type Row = Vec<Value>;

/// Rows of one table sharing one operation, in source order.
///
/// `columns` holds the table schema followed by its `old__` shadow columns,
/// so every row is twice as wide as the schema.
#[derive(Debug, Clone, PartialEq)]
pub struct Changeset {
    pub table: TableName,
    pub operation: Operation,
    pub columns: Vec<Column>,
    pub rows: Vec<Row>,
}

impl Changeset {
    pub fn new(table: TableName, operation: Operation, schema: &[Column]) -> Self {
        let mut columns = Vec::with_capacity(schema.len() * 2);
        columns.extend(schema.iter().cloned());
        columns.extend(schema.iter().map(Column::old));
        Self {
            table,
            operation,
            columns,
            rows: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// One committed source transaction, or an empty keepalive boundary.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Transaction {
    pub changesets: Vec<Changeset>,
    /// Non-zero only where acknowledging receipt is safe.
    pub flush_position: Lsn,
}

impl Transaction {
    pub fn boundary(flush_position: Lsn) -> Self {
        Self {
            changesets: Vec::new(),
            flush_position,
        }
    }
}

/// Rows read from a snapshot, capped by the bind-parameter limit.
#[derive(Debug, Clone, PartialEq)]
pub struct BackfillBatch {
    pub table: TableName,
    pub columns: Vec<Column>,
    pub rows: Vec<Row>,
}

/// Largest number of rows a batch of `num_columns` columns may carry.
pub fn backfill_row_cap(num_columns: usize) -> usize {
    (MAX_BIND_PARAMS / (num_columns + 1)).max(1)
}
