//! Rendering of statement templates around a bound row-set.

use tokio_postgres::types::ToSql;

use crate::config::ROWS_PLACEHOLDER;
use crate::postgres::{quote_ident, Column, ColumnKind, Row, TableName, MAX_BIND_PARAMS};

pub const TABLE_PLACEHOLDER: &str = "{{table}}";

/// Rows of `width` values that fit in one statement.
pub fn rows_per_statement(width: usize) -> usize {
    (MAX_BIND_PARAMS / width.max(1)).max(1)
}

/// Derived table binding `num_rows` rows of `columns` as parameters.
pub fn values_table(columns: &[Column], num_rows: usize) -> String {
    let width = columns.len();
    let mut sql = String::from("(SELECT * FROM (VALUES ");
    for row in 0..num_rows {
        if row > 0 {
            sql.push_str(", ");
        }
        sql.push('(');
        for (i, column) in columns.iter().enumerate() {
            if i > 0 {
                sql.push_str(", ");
            }
            sql.push_str(&column.param_expr(row * width + i + 1));
        }
        sql.push(')');
    }
    let names: Vec<_> = columns.iter().map(|c| quote_ident(&c.name)).collect();
    sql.push_str(") AS v(");
    sql.push_str(&names.join(", "));
    sql.push_str("))");
    sql
}

/// Expands `{{rows}}` and `{{table}}` in `template`.
pub fn render(template: &str, table: &TableName, columns: &[Column], num_rows: usize) -> String {
    template
        .replace(ROWS_PLACEHOLDER, &values_table(columns, num_rows))
        .replace(TABLE_PLACEHOLDER, &table.quoted())
}

/// Wraps a read query so columns of types rows carry as text come back as
/// text. `None` when every column is already readable.
pub fn text_projection(sql: &str, columns: &[Column]) -> Option<String> {
    if columns.iter().all(|c| c.kind != ColumnKind::Other) {
        return None;
    }
    let outputs: Vec<_> = columns
        .iter()
        .enumerate()
        .map(|(i, column)| {
            let cast = if column.kind == ColumnKind::Other { "::text" } else { "" };
            format!("e.\"c{}\"{} AS {}", i + 1, cast, quote_ident(&column.name))
        })
        .collect();
    let aliases: Vec<_> = (1..=columns.len()).map(|i| format!("\"c{}\"", i)).collect();
    Some(format!(
        "SELECT {} FROM ({}) AS e({})",
        outputs.join(", "),
        sql,
        aliases.join(", ")
    ))
}

/// Row-major parameter list for `rows`.
pub fn params(rows: &[Row]) -> Vec<&(dyn ToSql + Sync)> {
    rows.iter()
        .flat_map(|row| row.iter().map(|value| value as &(dyn ToSql + Sync)))
        .collect()
}
