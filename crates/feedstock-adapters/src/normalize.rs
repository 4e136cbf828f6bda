//! Settlement rows to typed tables.

use std::sync::OnceLock;

use feedstock_core::{
    ExtractedRow, Table, TableError, Value, DATA_SET_COLUMN, IDENTIFIER_COLUMNS,
    SETTLEMENT_COLUMNS,
};
use regex::Regex;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error, PartialEq)]
pub enum NormalizeError {
    #[error("column {column} holds no number: {raw:?}")]
    MalformedValue { column: String, raw: String },
    #[error(transparent)]
    Table(#[from] TableError),
}

fn number_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\d+\.?\d*").expect("valid number regex"))
}

/// Strips quote decoration (`A`/`B` suffixes, signs, stray text) from a price.
/// A bare leading `.` reads as `0.`.
pub fn coerce_numeric(raw: &str) -> Option<f64> {
    let trimmed = raw.trim();
    let prefixed;
    let text = if trimmed.starts_with('.') {
        prefixed = format!("0{trimmed}");
        prefixed.as_str()
    } else {
        trimmed
    };
    number_pattern()
        .find(text)
        .and_then(|m| m.as_str().parse::<f64>().ok())
}

/// Labels rows with the settlement schema, plus `DATA_SET` when given.
/// Tokens beyond the schema width are dropped.
pub fn rows_to_table(rows: &[ExtractedRow], data_set: Option<&str>) -> Result<Table, TableError> {
    let mut columns: Vec<&str> = SETTLEMENT_COLUMNS.to_vec();
    if data_set.is_some() {
        columns.push(DATA_SET_COLUMN);
    }
    let mut table = Table::new(columns);

    for row in rows {
        if row.len() > SETTLEMENT_COLUMNS.len() {
            debug!(extra = row.len() - SETTLEMENT_COLUMNS.len(), "dropping surplus tokens");
        }
        let mut values: Vec<Value> = row
            .fields
            .iter()
            .take(SETTLEMENT_COLUMNS.len())
            .map(|f| Value::Text(f.clone()))
            .collect();
        if let Some(name) = data_set {
            values.resize(SETTLEMENT_COLUMNS.len(), Value::Null);
            values.push(Value::text(name));
        }
        table.push_row(values)?;
    }
    Ok(table)
}

/// Projects to `keep_columns` and coerces every non-identifier column.
pub fn normalize(
    rows: &[ExtractedRow],
    data_set: Option<&str>,
    keep_columns: &[&str],
) -> Result<Table, NormalizeError> {
    let table = rows_to_table(rows, data_set)?.project(keep_columns)?;
    coerce_columns(table)
}

fn coerce_columns(mut table: Table) -> Result<Table, NormalizeError> {
    let numeric: Vec<String> = table
        .columns()
        .iter()
        .filter(|c| !IDENTIFIER_COLUMNS.contains(&c.as_str()))
        .cloned()
        .collect();

    for row in 0..table.len() {
        for column in &numeric {
            let raw = match table.value(row, column) {
                Some(Value::Text(s)) => s.clone(),
                Some(Value::Number(_)) => continue,
                _ => String::new(),
            };
            let number = coerce_numeric(&raw).ok_or_else(|| NormalizeError::MalformedValue {
                column: column.clone(),
                raw: raw.clone(),
            })?;
            table.set_value(row, column, Value::Number(number))?;
        }
    }
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(fields: &[&str]) -> ExtractedRow {
        ExtractedRow::new(fields.iter().map(|f| f.to_string()).collect())
    }

    #[test]
    fn decorated_prices_are_coerced() {
        assert_eq!(coerce_numeric(".771A"), Some(0.771));
        assert_eq!(coerce_numeric("123.45XYZ"), Some(123.45));
        assert_eq!(coerce_numeric("68.87B"), Some(68.87));
        assert_eq!(coerce_numeric("12345"), Some(12345.0));
        assert_eq!(coerce_numeric("----"), None);
        assert_eq!(coerce_numeric(""), None);
    }

    #[test]
    fn normalize_keeps_identifiers_as_text() {
        let rows = vec![row(&[
            "JAN25", "1.0550", "1.0590", "1.0540", "1.0567", "1.0561", "+.0012", "180211",
            "1.0549", "175002", "640110",
        ])];
        let table = normalize(
            &rows,
            Some("EC Euro/U.S. Dollar (EUR/USD) Futures"),
            &["DATA_SET", "MTH_STRIKE", "SETT", "DAILY_LAST"],
        )
        .expect("normalize");

        assert_eq!(table.value(0, "MTH_STRIKE"), Some(&Value::text("JAN25")));
        assert_eq!(
            table.value(0, "DATA_SET"),
            Some(&Value::text("EC Euro/U.S. Dollar (EUR/USD) Futures"))
        );
        assert_eq!(table.value(0, "SETT"), Some(&Value::Number(1.0561)));
        assert_eq!(table.value(0, "DAILY_LAST"), Some(&Value::Number(1.0567)));
    }

    #[test]
    fn missing_digits_fail_loudly() {
        let rows = vec![row(&[
            "FEB25", "----", "----", "----", "----", "72.81", "+.27", "", "72.54", "", "9810",
        ])];
        let err = normalize(&rows, None, &["MTH_STRIKE", "DAILY_LAST"]).unwrap_err();
        assert_eq!(
            err,
            NormalizeError::MalformedValue {
                column: "DAILY_LAST".into(),
                raw: "----".into()
            }
        );
    }

    #[test]
    fn unknown_keep_column_is_a_table_error() {
        let rows = vec![row(&["JAN25"])];
        let err = normalize(&rows, None, &["SETTLE"]).unwrap_err();
        assert_eq!(err, NormalizeError::Table(TableError::UnknownColumn("SETTLE".into())));
    }
}
