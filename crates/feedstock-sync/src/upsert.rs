//! Diff-based upsert: delete the rows being replaced, insert every incoming
//! row, all inside one sink transaction.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use feedstock_core::{quote_ident, Table, TableRef, Value};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Rows per compiled INSERT; keeps bind counts well under the Postgres limit.
pub const INSERT_CHUNK_ROWS: usize = 500;

/// Keys per key lookup or DELETE. Postgres caps a statement at 65535 binds.
pub const KEY_CHUNK_LEN: usize = 10_000;

/// A write compiled against one table. Nulls are inlined as `NULL`; every
/// other value becomes a `$n` parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlStatement {
    Delete {
        table: TableRef,
        key_column: String,
        keys: Vec<Value>,
    },
    Insert {
        table: TableRef,
        columns: Vec<String>,
        rows: Vec<Vec<Value>>,
    },
}

impl SqlStatement {
    pub fn table(&self) -> &TableRef {
        match self {
            SqlStatement::Delete { table, .. } | SqlStatement::Insert { table, .. } => table,
        }
    }

    pub fn sql(&self) -> String {
        let mut next = 0usize;
        let mut placeholder = |value: &Value| {
            if value.is_null() {
                "NULL".to_string()
            } else {
                next += 1;
                format!("${next}")
            }
        };
        match self {
            SqlStatement::Delete {
                table,
                key_column,
                keys,
            } => {
                let list = keys.iter().map(&mut placeholder).collect::<Vec<_>>();
                format!(
                    "DELETE FROM {} WHERE {} IN ({})",
                    table.qualified(),
                    quote_ident(key_column),
                    list.join(", ")
                )
            }
            SqlStatement::Insert {
                table,
                columns,
                rows,
            } => {
                let cols = columns.iter().map(|c| quote_ident(c)).collect::<Vec<_>>();
                let tuples = rows
                    .iter()
                    .map(|row| {
                        let cells = row.iter().map(&mut placeholder).collect::<Vec<_>>();
                        format!("({})", cells.join(", "))
                    })
                    .collect::<Vec<_>>();
                format!(
                    "INSERT INTO {} ({}) VALUES {}",
                    table.qualified(),
                    cols.join(", "),
                    tuples.join(", ")
                )
            }
        }
    }

    /// Bind values, in placeholder order.
    pub fn params(&self) -> Vec<&Value> {
        match self {
            SqlStatement::Delete { keys, .. } => keys.iter().filter(|v| !v.is_null()).collect(),
            SqlStatement::Insert { rows, .. } => rows
                .iter()
                .flat_map(|row| row.iter())
                .filter(|v| !v.is_null())
                .collect(),
        }
    }
}

/// Deletes must name one of the allowed schemas in their compiled form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteGuard {
    allowed_schemas: Vec<String>,
}

impl Default for DeleteGuard {
    fn default() -> Self {
        Self::new(["stg"])
    }
}

impl DeleteGuard {
    pub fn new<I, S>(allowed_schemas: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed_schemas: allowed_schemas
                .into_iter()
                .map(Into::into)
                .filter(|s: &String| !s.trim().is_empty())
                .collect(),
        }
    }

    pub fn allowed_schemas(&self) -> &[String] {
        &self.allowed_schemas
    }

    pub fn check(&self, statement: &SqlStatement) -> Result<(), UpsertError> {
        if !matches!(statement, SqlStatement::Delete { .. }) {
            return Ok(());
        }
        let sql = statement.sql();
        let qualified = self
            .allowed_schemas
            .iter()
            .any(|schema| sql.starts_with(&format!("DELETE FROM {}.", quote_ident(schema))));
        if qualified {
            Ok(())
        } else {
            Err(UpsertError::UnsafeDeleteRejected { sql })
        }
    }
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("sink failure: {0}")]
    Failed(String),
}

#[derive(Debug, Error)]
pub enum UpsertError {
    #[error("incoming rows have no {0} column")]
    MissingKeyColumn(String),
    #[error("incoming row {row} has a null {column}")]
    NullKey { row: usize, column: String },
    #[error("refusing delete without an allowed schema qualifier: {sql}")]
    UnsafeDeleteRejected { sql: String },
    #[error(transparent)]
    Sink(#[from] SinkError),
}

/// Destination table store.
#[async_trait]
pub trait TableSink: Send + Sync {
    /// Stored keys that are among `keys`, read back as the same `Value`
    /// variant as the incoming keys.
    async fn select_by_key(
        &self,
        table: &TableRef,
        key_column: &str,
        keys: &[Value],
    ) -> Result<Vec<Value>, SinkError>;

    /// Executes every statement in one transaction.
    async fn apply(&self, statements: &[SqlStatement]) -> Result<(), SinkError>;
}

/// `updated` and `inserted` count incoming rows; a key shared by several rows
/// (one row per page, say) replaces every stored row with that key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UpsertReport {
    pub table: String,
    pub updated: usize,
    pub inserted: usize,
    pub statements: usize,
}

pub async fn upsert(
    sink: &dyn TableSink,
    guard: &DeleteGuard,
    table: &TableRef,
    primary_key: &str,
    incoming: &Table,
) -> Result<UpsertReport, UpsertError> {
    let mut report = UpsertReport {
        table: table.to_string(),
        ..UpsertReport::default()
    };
    if incoming.is_empty() {
        debug!(table = %table, "nothing to upsert");
        return Ok(report);
    }

    let key_idx = incoming
        .column_index(primary_key)
        .ok_or_else(|| UpsertError::MissingKeyColumn(primary_key.to_string()))?;

    let mut row_keys = Vec::with_capacity(incoming.len());
    let mut distinct = Vec::new();
    let mut seen = HashSet::new();
    for (row, values) in incoming.rows().iter().enumerate() {
        let value = &values[key_idx];
        let repr = value.key_repr().ok_or_else(|| UpsertError::NullKey {
            row,
            column: primary_key.to_string(),
        })?;
        if seen.insert(repr.clone()) {
            distinct.push(value.clone());
        }
        row_keys.push(repr);
    }

    let mut stored = HashSet::new();
    for chunk in distinct.chunks(KEY_CHUNK_LEN) {
        let found = sink.select_by_key(table, primary_key, chunk).await?;
        stored.extend(found.iter().filter_map(Value::key_repr));
    }

    report.updated = row_keys.iter().filter(|k| stored.contains(*k)).count();
    report.inserted = row_keys.len() - report.updated;

    let to_delete = distinct
        .into_iter()
        .filter(|v| v.key_repr().is_some_and(|k| stored.contains(&k)))
        .collect::<Vec<_>>();

    let mut statements = Vec::new();
    for chunk in to_delete.chunks(KEY_CHUNK_LEN) {
        let delete = SqlStatement::Delete {
            table: table.clone(),
            key_column: primary_key.to_string(),
            keys: chunk.to_vec(),
        };
        guard.check(&delete)?;
        statements.push(delete);
    }
    for chunk in incoming.rows().chunks(INSERT_CHUNK_ROWS) {
        statements.push(SqlStatement::Insert {
            table: table.clone(),
            columns: incoming.columns().to_vec(),
            rows: chunk.to_vec(),
        });
    }
    report.statements = statements.len();

    sink.apply(&statements).await?;
    info!(
        table = %table,
        updated = report.updated,
        inserted = report.inserted,
        "upsert committed"
    );
    Ok(report)
}

type MemoryRow = BTreeMap<String, Value>;

/// In-process sink; a whole `apply` call is all-or-nothing.
#[derive(Debug, Default)]
pub struct MemoryTableSink {
    tables: Mutex<HashMap<TableRef, Vec<MemoryRow>>>,
    applied: Mutex<Vec<SqlStatement>>,
    fail_at: AtomicUsize,
}

impl MemoryTableSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails the `n`th statement (1-based) of every later `apply`; 0 disables.
    pub fn fail_at_statement(&self, n: usize) {
        self.fail_at.store(n, Ordering::SeqCst);
    }

    pub async fn seed(&self, table: &TableRef, rows: &Table) {
        let mut tables = self.tables.lock().await;
        let stored = tables.entry(table.clone()).or_default();
        for row in rows.rows() {
            stored.push(
                rows.columns()
                    .iter()
                    .cloned()
                    .zip(row.iter().cloned())
                    .collect(),
            );
        }
    }

    pub async fn rows(&self, table: &TableRef) -> Vec<MemoryRow> {
        self.tables
            .lock()
            .await
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    /// Statements from committed `apply` calls, in order.
    pub async fn applied(&self) -> Vec<SqlStatement> {
        self.applied.lock().await.clone()
    }
}

fn row_key(row: &MemoryRow, key_column: &str) -> Option<String> {
    row.get(key_column).and_then(Value::key_repr)
}

#[async_trait]
impl TableSink for MemoryTableSink {
    async fn select_by_key(
        &self,
        table: &TableRef,
        key_column: &str,
        keys: &[Value],
    ) -> Result<Vec<Value>, SinkError> {
        let wanted: HashSet<String> = keys.iter().filter_map(Value::key_repr).collect();
        let tables = self.tables.lock().await;
        Ok(tables
            .get(table)
            .map(|rows| {
                rows.iter()
                    .filter_map(|row| row.get(key_column))
                    .filter(|v| v.key_repr().is_some_and(|k| wanted.contains(&k)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn apply(&self, statements: &[SqlStatement]) -> Result<(), SinkError> {
        let mut tables = self.tables.lock().await;
        let mut staged = tables.clone();
        let fail_at = self.fail_at.load(Ordering::SeqCst);

        for (i, statement) in statements.iter().enumerate() {
            if fail_at == i + 1 {
                return Err(SinkError::Failed(format!(
                    "injected failure at statement {fail_at}"
                )));
            }
            match statement {
                SqlStatement::Delete {
                    table,
                    key_column,
                    keys,
                } => {
                    let doomed: HashSet<String> = keys.iter().filter_map(Value::key_repr).collect();
                    if let Some(rows) = staged.get_mut(table) {
                        rows.retain(|row| {
                            row_key(row, key_column).map_or(true, |k| !doomed.contains(&k))
                        });
                    }
                }
                SqlStatement::Insert {
                    table,
                    columns,
                    rows,
                } => {
                    let stored = staged.entry(table.clone()).or_default();
                    for row in rows {
                        stored.push(columns.iter().cloned().zip(row.iter().cloned()).collect());
                    }
                }
            }
        }

        *tables = staged;
        self.applied.lock().await.extend(statements.iter().cloned());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn stg(name: &str) -> TableRef {
        TableRef::new("stg", name)
    }

    fn date(d: u32) -> Value {
        Value::Date(NaiveDate::from_ymd_opt(2024, 11, d).unwrap())
    }

    fn prices(rows: &[(u32, f64)]) -> Table {
        let mut table = Table::new(["Date", "Propane"]);
        for (d, price) in rows {
            table.push_row(vec![date(*d), Value::Number(*price)]).unwrap();
        }
        table
    }

    #[test]
    fn statements_compile_with_numbered_placeholders() {
        let delete = SqlStatement::Delete {
            table: stg("RTiPetchem"),
            key_column: "Date".into(),
            keys: vec![date(18), date(19)],
        };
        assert_eq!(
            delete.sql(),
            r#"DELETE FROM "stg"."RTiPetchem" WHERE "Date" IN ($1, $2)"#
        );

        let insert = SqlStatement::Insert {
            table: stg("RTiPetchem"),
            columns: vec!["Date".into(), "Propane".into(), "Ethane".into()],
            rows: vec![
                vec![date(18), Value::Number(0.7), Value::Null],
                vec![date(19), Value::Number(0.71), Value::Number(0.19)],
            ],
        };
        assert_eq!(
            insert.sql(),
            r#"INSERT INTO "stg"."RTiPetchem" ("Date", "Propane", "Ethane") VALUES ($1, $2, NULL), ($3, $4, $5)"#
        );
        assert_eq!(insert.params().len(), 5);
    }

    #[test]
    fn guard_requires_allowed_schema() {
        let guard = DeleteGuard::default();
        let delete = |table: TableRef| SqlStatement::Delete {
            table,
            key_column: "Date".into(),
            keys: vec![date(19)],
        };
        assert!(guard.check(&delete(stg("RTiPetchem"))).is_ok());
        assert!(matches!(
            guard.check(&delete(TableRef::unqualified("RTiPetchem"))),
            Err(UpsertError::UnsafeDeleteRejected { .. })
        ));
        assert!(matches!(
            guard.check(&delete(TableRef::new("dbo", "RTiPetchem"))),
            Err(UpsertError::UnsafeDeleteRejected { .. })
        ));
    }

    #[tokio::test]
    async fn stored_keys_are_replaced_and_new_keys_inserted() {
        let sink = MemoryTableSink::new();
        sink.seed(&stg("RTiPetchem"), &prices(&[(18, 0.69)])).await;

        let report = upsert(
            &sink,
            &DeleteGuard::default(),
            &stg("RTiPetchem"),
            "Date",
            &prices(&[(18, 0.70), (19, 0.71)]),
        )
        .await
        .unwrap();
        assert_eq!(report.updated, 1);
        assert_eq!(report.inserted, 1);

        let applied = sink.applied().await;
        assert_eq!(applied.len(), 2);
        assert!(matches!(&applied[0], SqlStatement::Delete { keys, .. } if keys == &vec![date(18)]));
        assert!(matches!(&applied[1], SqlStatement::Insert { rows, .. } if rows.len() == 2));

        let rows = sink.rows(&stg("RTiPetchem")).await;
        assert_eq!(rows.len(), 2);
        let nov18 = rows.iter().find(|r| r["Date"] == date(18)).unwrap();
        assert_eq!(nov18["Propane"], Value::Number(0.70));
    }

    #[tokio::test]
    async fn unqualified_delete_writes_nothing() {
        let table = TableRef::unqualified("RTiPetchem");
        let sink = MemoryTableSink::new();
        sink.seed(&table, &prices(&[(18, 0.69)])).await;

        let err = upsert(&sink, &DeleteGuard::default(), &table, "Date", &prices(&[(18, 0.7), (19, 0.71)]))
            .await
            .unwrap_err();
        assert!(matches!(err, UpsertError::UnsafeDeleteRejected { .. }));
        assert!(sink.applied().await.is_empty());
        assert_eq!(sink.rows(&table).await.len(), 1);
    }

    #[tokio::test]
    async fn failed_statement_rolls_back_the_batch() {
        let sink = MemoryTableSink::new();
        sink.seed(&stg("RTiPetchem"), &prices(&[(18, 0.69)])).await;
        sink.fail_at_statement(2);

        let err = upsert(
            &sink,
            &DeleteGuard::default(),
            &stg("RTiPetchem"),
            "Date",
            &prices(&[(18, 0.70)]),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, UpsertError::Sink(SinkError::Failed(_))));

        let rows = sink.rows(&stg("RTiPetchem")).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["Propane"], Value::Number(0.69));
    }

    #[tokio::test]
    async fn empty_incoming_issues_no_statements() {
        let sink = MemoryTableSink::new();
        let report = upsert(&sink, &DeleteGuard::default(), &stg("RTiPetchem"), "Date", &prices(&[]))
            .await
            .unwrap();
        assert_eq!(report.statements, 0);
        assert!(sink.applied().await.is_empty());
    }

    #[tokio::test]
    async fn key_problems_are_rejected_before_any_write() {
        let sink = MemoryTableSink::new();
        let guard = DeleteGuard::default();
        let table = stg("RTiPetchem");

        let err = upsert(&sink, &guard, &table, "pdfName", &prices(&[(18, 0.7)]))
            .await
            .unwrap_err();
        assert!(matches!(err, UpsertError::MissingKeyColumn(c) if c == "pdfName"));

        let mut nulls = Table::new(["Date", "Propane"]);
        nulls.push_row(vec![Value::Null, Value::Number(0.7)]).unwrap();
        let err = upsert(&sink, &guard, &table, "Date", &nulls).await.unwrap_err();
        assert!(matches!(err, UpsertError::NullKey { row: 0, .. }));

        assert!(sink.applied().await.is_empty());
    }

    fn page_rows(pdf: &str, headers: &[&str]) -> Table {
        let mut table = Table::new(["pdfName", "page", "header"]);
        for (i, header) in headers.iter().enumerate() {
            table
                .push_row(vec![
                    Value::text(pdf),
                    Value::Number((i + 1) as f64),
                    Value::text(*header),
                ])
                .unwrap();
        }
        table
    }

    #[tokio::test]
    async fn rows_sharing_a_key_replace_the_stored_group() {
        let sink = MemoryTableSink::new();
        let guard = DeleteGuard::default();
        let table = stg("DriversMetadata");
        sink.seed(&table, &page_rows("r.pdf", &["PE DRIVERS", "PP DRIVERS", "Error2"]))
            .await;
        sink.seed(&table, &page_rows("other.pdf", &["PS DRIVERS"])).await;

        let report = upsert(&sink, &guard, &table, "pdfName", &page_rows("r.pdf", &["PE DRIVERS", "PVC DRIVERS"]))
            .await
            .unwrap();
        assert_eq!(report.updated, 2);
        assert_eq!(report.inserted, 0);

        let applied = sink.applied().await;
        assert!(matches!(&applied[0], SqlStatement::Delete { keys, .. } if keys == &vec![Value::text("r.pdf")]));

        let rows = sink.rows(&table).await;
        let pages = rows
            .iter()
            .filter(|r| r["pdfName"] == Value::text("r.pdf"))
            .map(|r| r["header"].clone())
            .collect::<Vec<_>>();
        assert_eq!(pages, vec![Value::text("PE DRIVERS"), Value::text("PVC DRIVERS")]);
        assert_eq!(rows.len(), 3);
    }

    #[tokio::test]
    async fn new_key_group_is_inserted_whole() {
        let sink = MemoryTableSink::new();
        let table = stg("DriversMetadata");
        let report = upsert(
            &sink,
            &DeleteGuard::default(),
            &table,
            "pdfName",
            &page_rows("r.pdf", &["PE DRIVERS", "PP DRIVERS"]),
        )
        .await
        .unwrap();
        assert_eq!(report.inserted, 2);
        assert_eq!(report.statements, 1);
        assert_eq!(sink.rows(&table).await.len(), 2);
    }

    #[tokio::test]
    async fn long_key_lists_are_split_across_deletes() {
        let sink = MemoryTableSink::new();
        let table = stg("Ticks");
        let mut ticks = Table::new(["id", "px"]);
        for i in 0..(KEY_CHUNK_LEN + 5) {
            ticks
                .push_row(vec![Value::Number(i as f64), Value::Number(1.0)])
                .unwrap();
        }
        sink.seed(&table, &ticks).await;

        let report = upsert(&sink, &DeleteGuard::default(), &table, "id", &ticks)
            .await
            .unwrap();
        assert_eq!(report.updated, KEY_CHUNK_LEN + 5);

        let applied = sink.applied().await;
        let delete_sizes = applied
            .iter()
            .filter_map(|s| match s {
                SqlStatement::Delete { keys, .. } => Some(keys.len()),
                SqlStatement::Insert { .. } => None,
            })
            .collect::<Vec<_>>();
        assert_eq!(delete_sizes, vec![KEY_CHUNK_LEN, 5]);
        assert_eq!(sink.rows(&table).await.len(), KEY_CHUNK_LEN + 5);
    }
}
