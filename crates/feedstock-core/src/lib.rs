//! Core domain model for the feedstock ingestion jobs.

use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "feedstock-core";

/// Number of whitespace-separated columns in a complete settlement row.
pub const FULL_COLUMN_COUNT: usize = 11;

/// Fixed column schema of a CME settlement section.
pub const SETTLEMENT_COLUMNS: [&str; FULL_COLUMN_COUNT] = [
    "MTH_STRIKE",
    "DAILY_OPEN",
    "DAILY_HIGH",
    "DAILY_LOW",
    "DAILY_LAST",
    "SETT",
    "PNT_CHGE",
    "ACT_EST_VOL",
    "PREV_DAY_SETT",
    "PREV_DAY_VOL",
    "PREV_DAY_INT",
];

pub const DATA_SET_COLUMN: &str = "DATA_SET";
pub const MTH_STRIKE_COLUMN: &str = "MTH_STRIKE";

/// Columns that carry labels rather than numbers and are never coerced.
pub const IDENTIFIER_COLUMNS: [&str; 2] = [MTH_STRIKE_COLUMN, DATA_SET_COLUMN];

/// Which settlement column a dataset publishes to the warehouse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceBasis {
    Settlement,
    Last,
}

impl PriceBasis {
    pub fn column(self) -> &'static str {
        match self {
            PriceBasis::Settlement => "SETT",
            PriceBasis::Last => "DAILY_LAST",
        }
    }
}

/// Closed set of CME settlement series the jobs know how to extract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DatasetKey {
    WtiCrudeOil,
    MontBelvieuPropane,
    BrentCrudeOil,
    MontBelvieuEthane,
    CadUsd,
    EurUsd,
    HenryHubNaturalGas,
}

impl DatasetKey {
    pub const ALL: [DatasetKey; 7] = [
        DatasetKey::WtiCrudeOil,
        DatasetKey::MontBelvieuPropane,
        DatasetKey::BrentCrudeOil,
        DatasetKey::MontBelvieuEthane,
        DatasetKey::CadUsd,
        DatasetKey::EurUsd,
        DatasetKey::HenryHubNaturalGas,
    ];

    /// Section title as printed in the settlement report; used as the header anchor.
    pub fn report_title(self) -> &'static str {
        match self {
            DatasetKey::WtiCrudeOil => "26 Crude Oil Last Day Financial Futures",
            DatasetKey::MontBelvieuPropane => "B0 Mont Belvieu LDH Propane (OPIS) Futures",
            DatasetKey::BrentCrudeOil => "BZ Brent Crude Oil Last Day Financial Futures",
            DatasetKey::MontBelvieuEthane => "C0 Mont Belvieu Ethane (OPIS) Futures",
            DatasetKey::CadUsd => "C1 Canadian Dollar/U.S. Dollar (CAD/USD) Futures",
            DatasetKey::EurUsd => "EC Euro/U.S. Dollar (EUR/USD) Futures",
            DatasetKey::HenryHubNaturalGas => "NG Henry Hub Natural Gas Futures",
        }
    }

    /// Warehouse column the dataset's price lands in.
    pub fn warehouse_column(self) -> &'static str {
        match self {
            DatasetKey::WtiCrudeOil => "WTI Crude Oil",
            DatasetKey::MontBelvieuPropane => "Propane",
            DatasetKey::BrentCrudeOil => "Brent Crude Oil",
            DatasetKey::MontBelvieuEthane => "Ethane",
            DatasetKey::CadUsd => "US to CA$",
            DatasetKey::EurUsd => "Euro to $US",
            DatasetKey::HenryHubNaturalGas => "Nat. Gas",
        }
    }

    pub fn price_basis(self) -> PriceBasis {
        match self {
            DatasetKey::CadUsd | DatasetKey::EurUsd => PriceBasis::Last,
            _ => PriceBasis::Settlement,
        }
    }

    /// CAD/USD is quoted the other way round from the warehouse column.
    pub fn publishes_inverse(self) -> bool {
        matches!(self, DatasetKey::CadUsd)
    }

    pub fn from_report_title(title: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|key| key.report_title() == title.trim())
    }
}

impl fmt::Display for DatasetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.report_title())
    }
}

/// Product families that own a section of the driver reports.
///
/// `ALL` is the detection priority order: PE is checked first (and refuses
/// anything mentioning PET) and PA66 comes before PA6 so the longer code wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProductCategory {
    #[serde(rename = "PE")]
    Pe,
    #[serde(rename = "PP")]
    Pp,
    #[serde(rename = "PS")]
    Ps,
    #[serde(rename = "ABS")]
    Abs,
    #[serde(rename = "PVC")]
    Pvc,
    #[serde(rename = "PC")]
    Pc,
    #[serde(rename = "PA66")]
    Pa66,
    #[serde(rename = "PA6")]
    Pa6,
    #[serde(rename = "PET")]
    Pet,
}

impl ProductCategory {
    pub const ALL: [ProductCategory; 9] = [
        ProductCategory::Pe,
        ProductCategory::Pp,
        ProductCategory::Ps,
        ProductCategory::Abs,
        ProductCategory::Pvc,
        ProductCategory::Pc,
        ProductCategory::Pa66,
        ProductCategory::Pa6,
        ProductCategory::Pet,
    ];

    pub fn code(self) -> &'static str {
        match self {
            ProductCategory::Pe => "PE",
            ProductCategory::Pp => "PP",
            ProductCategory::Ps => "PS",
            ProductCategory::Abs => "ABS",
            ProductCategory::Pvc => "PVC",
            ProductCategory::Pc => "PC",
            ProductCategory::Pa66 => "PA66",
            ProductCategory::Pa6 => "PA6",
            ProductCategory::Pet => "PET",
        }
    }

    /// Header label written to the page metadata, e.g. `PE DRIVERS`.
    pub fn drivers_label(self) -> String {
        format!("{} DRIVERS", self.code())
    }

    /// Tokens looked for in a space-stripped, upper-cased heading.
    pub fn heading_keywords(self) -> &'static [&'static str] {
        match self {
            ProductCategory::Pe => &["PE", "POLYETHYLENE"],
            ProductCategory::Pp => &["PP", "POLYPROPYLENE"],
            ProductCategory::Ps => &["PS", "POLYSTYRENE"],
            ProductCategory::Abs => &["ABS"],
            ProductCategory::Pvc => &["PVC"],
            ProductCategory::Pc => &["PC", "POLYCARBONATE"],
            ProductCategory::Pa66 => &["PA66"],
            ProductCategory::Pa6 => &["PA6"],
            ProductCategory::Pet => &["PET"],
        }
    }

    pub fn heading_exclusions(self) -> &'static [&'static str] {
        match self {
            ProductCategory::Pe => &["PET"],
            _ => &[],
        }
    }

    /// Names the product goes by in "For additional <X> information" lines.
    pub fn contact_names(self) -> &'static [&'static str] {
        match self {
            ProductCategory::Pe => &["PE"],
            ProductCategory::Pp => &["PP"],
            ProductCategory::Ps => &["PS"],
            ProductCategory::Abs => &["ABS"],
            ProductCategory::Pvc => &["PVC"],
            ProductCategory::Pc => &["PC"],
            ProductCategory::Pa66 => &["PA66", "Nylon PA66"],
            ProductCategory::Pa6 => &["PA6", "Nylon PA6", "Nylon"],
            ProductCategory::Pet => &["PET"],
        }
    }

    /// First category, in priority order, whose keywords appear in `compact`.
    pub fn detect_in_heading(compact: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|category| {
            category.heading_keywords().iter().any(|k| compact.contains(k))
                && !category.heading_exclusions().iter().any(|k| compact.contains(k))
        })
    }
}

/// Half-open section of a report blob: `start_line` is the header line and
/// `end_line` the footer line, both zero-based.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionBounds {
    pub start_line: usize,
    pub end_line: usize,
    pub section_key: String,
}

impl SectionBounds {
    /// Number of lines strictly between header and footer.
    pub fn body_len(&self) -> usize {
        self.end_line.saturating_sub(self.start_line + 1)
    }
}

/// One tokenised settlement row, positionally aligned to [`SETTLEMENT_COLUMNS`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedRow {
    pub fields: Vec<String>,
}

impl ExtractedRow {
    pub fn new(fields: Vec<String>) -> Self {
        Self { fields }
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn is_complete(&self) -> bool {
        self.fields.len() >= FULL_COLUMN_COUNT
    }

    pub fn field(&self, column: &str) -> Option<&str> {
        let idx = SETTLEMENT_COLUMNS.iter().position(|c| *c == column)?;
        self.fields.get(idx).map(String::as_str)
    }
}

/// One page of a scanned driver report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NarrativePageRecord {
    pub page: u32,
    pub header: String,
    pub date: Option<NaiveDate>,
    #[serde(rename = "pdfName")]
    pub pdf_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    Null,
    Text(String),
    Number(f64),
    Date(NaiveDate),
}

impl Value {
    pub fn text(s: impl Into<String>) -> Self {
        Value::Text(s.into())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            Value::Date(d) => Some(*d),
            _ => None,
        }
    }

    /// Canonical text form used for primary-key identity. `None` for nulls.
    pub fn key_repr(&self) -> Option<String> {
        match self {
            Value::Null => None,
            Value::Text(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Date(d) => Some(d.format("%Y-%m-%d").to_string()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("NULL"),
            Value::Text(s) => f.write_str(s),
            Value::Number(n) => write!(f, "{n}"),
            Value::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TableError {
    #[error("unknown column {0}")]
    UnknownColumn(String),
    #[error("row has {got} values but table has {expected} columns")]
    RowTooWide { expected: usize, got: usize },
    #[error("column sets differ: {left:?} vs {right:?}")]
    ColumnMismatch { left: Vec<String>, right: Vec<String> },
}

/// Column-named row set; the dataframe equivalent handed between stages.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Table {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
}

impl Table {
    pub fn new<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            rows: Vec::new(),
        }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Appends a row; short rows are padded with nulls.
    pub fn push_row(&mut self, mut row: Vec<Value>) -> Result<(), TableError> {
        if row.len() > self.columns.len() {
            return Err(TableError::RowTooWide {
                expected: self.columns.len(),
                got: row.len(),
            });
        }
        row.resize(self.columns.len(), Value::Null);
        self.rows.push(row);
        Ok(())
    }

    pub fn value(&self, row: usize, column: &str) -> Option<&Value> {
        let idx = self.column_index(column)?;
        self.rows.get(row).and_then(|r| r.get(idx))
    }

    pub fn set_value(&mut self, row: usize, column: &str, value: Value) -> Result<(), TableError> {
        let idx = self
            .column_index(column)
            .ok_or_else(|| TableError::UnknownColumn(column.to_string()))?;
        if let Some(cell) = self.rows.get_mut(row).and_then(|r| r.get_mut(idx)) {
            *cell = value;
        }
        Ok(())
    }

    pub fn column_values(&self, column: &str) -> Result<Vec<&Value>, TableError> {
        let idx = self
            .column_index(column)
            .ok_or_else(|| TableError::UnknownColumn(column.to_string()))?;
        Ok(self.rows.iter().map(|r| &r[idx]).collect())
    }

    /// New table holding only `columns`, in the order given.
    pub fn project(&self, columns: &[&str]) -> Result<Table, TableError> {
        let indices = columns
            .iter()
            .map(|c| {
                self.column_index(c)
                    .ok_or_else(|| TableError::UnknownColumn((*c).to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Table {
            columns: columns.iter().map(|c| (*c).to_string()).collect(),
            rows: self
                .rows
                .iter()
                .map(|r| indices.iter().map(|&i| r[i].clone()).collect())
                .collect(),
        })
    }

    /// New table holding the rows at `indices`, in the order given.
    pub fn select_rows(&self, indices: &[usize]) -> Table {
        Table {
            columns: self.columns.clone(),
            rows: indices
                .iter()
                .filter_map(|&i| self.rows.get(i).cloned())
                .collect(),
        }
    }

    pub fn head(&self, n: usize) -> Table {
        Table {
            columns: self.columns.clone(),
            rows: self.rows.iter().take(n).cloned().collect(),
        }
    }

    /// Concatenates rows of a table with the identical column list.
    pub fn append(&mut self, other: Table) -> Result<(), TableError> {
        if other.columns != self.columns {
            return Err(TableError::ColumnMismatch {
                left: self.columns.clone(),
                right: other.columns,
            });
        }
        self.rows.extend(other.rows);
        Ok(())
    }

    /// Drops every column for which `predicate` holds on all of its values.
    pub fn drop_columns_where(&mut self, predicate: impl Fn(&str, &Value) -> bool) {
        let keep = (0..self.columns.len())
            .filter(|&i| {
                let name = &self.columns[i];
                self.rows.is_empty() || !self.rows.iter().all(|r| predicate(name, &r[i]))
            })
            .collect::<Vec<_>>();
        self.columns = keep.iter().map(|&i| self.columns[i].clone()).collect();
        for row in &mut self.rows {
            *row = keep.iter().map(|&i| row[i].clone()).collect();
        }
    }
}

/// Warehouse table identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableRef {
    #[serde(default)]
    pub schema: String,
    pub name: String,
}

impl TableRef {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
        }
    }

    /// Table without a schema; compiled statements against it are unqualified.
    pub fn unqualified(name: impl Into<String>) -> Self {
        Self {
            schema: String::new(),
            name: name.into(),
        }
    }

    /// Parses `schema.name` or a bare `name`.
    pub fn parse(text: &str) -> Self {
        match text.trim().split_once('.') {
            Some((schema, name)) => Self::new(schema.trim(), name.trim()),
            None => Self::unqualified(text.trim()),
        }
    }

    pub fn is_qualified(&self) -> bool {
        !self.schema.trim().is_empty()
    }

    /// Quoted SQL identifier, e.g. `"stg"."RTiPetchem"`.
    pub fn qualified(&self) -> String {
        if self.is_qualified() {
            format!("{}.{}", quote_ident(&self.schema), quote_ident(&self.name))
        } else {
            quote_ident(&self.name)
        }
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_qualified() {
            write!(f, "{}.{}", self.schema, self.name)
        } else {
            f.write_str(&self.name)
        }
    }
}

/// Double-quotes an SQL identifier, escaping embedded quotes.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}
