use async_trait::async_trait;
use chrono::NaiveDate;
use feedstock_core::{quote_ident, TableRef, Value};
use sqlx::postgres::{PgArguments, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::{PgPool, Postgres, Row};
use tracing::debug;

use crate::upsert::{SinkError, SqlStatement, TableSink};

/// Warehouse sink over a Postgres pool.
#[derive(Debug, Clone)]
pub struct PgTableSink {
    pool: PgPool,
}

impl PgTableSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Pool that connects on first use, so a missing database only fails the
    /// jobs that write to it.
    pub fn connect_lazy(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect_lazy(database_url)?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn bind_value<'q>(
    query: Query<'q, Postgres, PgArguments>,
    value: &'q Value,
) -> Query<'q, Postgres, PgArguments> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Text(s) => query.bind(s.as_str()),
        Value::Number(n) => query.bind(*n),
        Value::Date(d) => query.bind(*d),
    }
}

/// SQL type the stored key is cast to so it decodes as the incoming variant.
/// A `timestamp` key read as `DATE` compares equal to the incoming day.
fn key_cast(sample: &Value) -> &'static str {
    match sample {
        Value::Date(_) => "DATE",
        Value::Number(_) => "DOUBLE PRECISION",
        Value::Null | Value::Text(_) => "TEXT",
    }
}

fn select_keys_sql(table: &TableRef, key_column: &str, sample: &Value, count: usize) -> String {
    let placeholders = (1..=count)
        .map(|i| format!("${i}"))
        .collect::<Vec<_>>()
        .join(", ");
    let column = quote_ident(key_column);
    format!(
        "SELECT CAST({column} AS {}) AS stored_key FROM {} WHERE {column} IN ({placeholders})",
        key_cast(sample),
        table.qualified()
    )
}

fn decode_key(row: &PgRow, sample: &Value) -> Result<Value, sqlx::Error> {
    Ok(match sample {
        Value::Date(_) => row
            .try_get::<Option<NaiveDate>, _>("stored_key")?
            .map_or(Value::Null, Value::Date),
        Value::Number(_) => row
            .try_get::<Option<f64>, _>("stored_key")?
            .map_or(Value::Null, Value::Number),
        Value::Null | Value::Text(_) => row
            .try_get::<Option<String>, _>("stored_key")?
            .map_or(Value::Null, Value::Text),
    })
}

#[async_trait]
impl TableSink for PgTableSink {
    async fn select_by_key(
        &self,
        table: &TableRef,
        key_column: &str,
        keys: &[Value],
    ) -> Result<Vec<Value>, SinkError> {
        let keys = keys.iter().filter(|k| !k.is_null()).collect::<Vec<_>>();
        let Some(sample) = keys.first().copied() else {
            return Ok(Vec::new());
        };
        let sql = select_keys_sql(table, key_column, sample, keys.len());
        let query = keys
            .iter()
            .fold(sqlx::query(&sql), |query, key| bind_value(query, *key));
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| decode_key(row, sample))
            .collect::<Result<Vec<_>, _>>()
            .map_err(SinkError::from)
    }

    async fn apply(&self, statements: &[SqlStatement]) -> Result<(), SinkError> {
        let mut tx = self.pool.begin().await?;
        for statement in statements {
            let sql = statement.sql();
            debug!(table = %statement.table(), %sql, "executing");
            let query = statement
                .params()
                .into_iter()
                .fold(sqlx::query(&sql), bind_value);
            query.execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stored_keys_are_cast_to_the_incoming_type() {
        let table = TableRef::new("stg", "RTiPetchem");
        let day = Value::Date(NaiveDate::from_ymd_opt(2024, 11, 20).unwrap());
        assert_eq!(
            select_keys_sql(&table, "Date", &day, 2),
            r#"SELECT CAST("Date" AS DATE) AS stored_key FROM "stg"."RTiPetchem" WHERE "Date" IN ($1, $2)"#
        );
        assert!(select_keys_sql(&table, "id", &Value::Number(1.5), 1)
            .starts_with(r#"SELECT CAST("id" AS DOUBLE PRECISION)"#));
        assert!(select_keys_sql(&table, "pdfName", &Value::text("a.pdf"), 1)
            .starts_with(r#"SELECT CAST("pdfName" AS TEXT)"#));
    }
}
