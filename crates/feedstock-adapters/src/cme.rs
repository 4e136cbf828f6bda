//! CME Datamine settlement files -> one wide price row per business day.

use async_trait::async_trait;
use chrono::{Datelike, Duration, NaiveDate, Weekday};
use feedstock_core::{
    DatasetKey, Table, TableRef, Value, DATA_SET_COLUMN, MTH_STRIKE_COLUMN,
};
use feedstock_storage::{FetchError, HttpRequest};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::normalize::{normalize, NormalizeError};
use crate::settlement::extract_dataset;
use crate::{AdapterContext, AdapterError, AdapterServices, ParsedBatch, RawArtifact, SourceAdapter};

pub const CME_SOURCE_ID: &str = "cme";
pub const DATE_COLUMN: &str = "Date";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FidGroup {
    pub fid: String,
    pub datasets: Vec<DatasetKey>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CmeConfig {
    pub base_url: String,
    pub username_secret: String,
    pub password_secret: String,
    pub lookback_days: u32,
    pub target: TableRef,
    pub primary_key: String,
    pub fid_groups: Vec<FidGroup>,
}

impl Default for CmeConfig {
    fn default() -> Self {
        Self {
            base_url: "https://datamine.cmegroup.com/cme/api/v1/download".to_string(),
            username_secret: "CME-DATAMINE-USERNAME".to_string(),
            password_secret: "CME-DATAMINE-PASSWORD".to_string(),
            lookback_days: 7,
            target: TableRef::new("stg", "RTiPetchem"),
            primary_key: DATE_COLUMN.to_string(),
            fid_groups: vec![
                FidGroup {
                    fid: "STLBASIC_NYMEX_STLCPC_EOM_0".to_string(),
                    datasets: vec![
                        DatasetKey::WtiCrudeOil,
                        DatasetKey::MontBelvieuPropane,
                        DatasetKey::BrentCrudeOil,
                        DatasetKey::MontBelvieuEthane,
                    ],
                },
                FidGroup {
                    fid: "STLBASIC_SETLCUR_EOM_SUM_0".to_string(),
                    datasets: vec![DatasetKey::CadUsd, DatasetKey::EurUsd],
                },
                FidGroup {
                    fid: "STLBASIC_NYMEX_EOM_SUM_0".to_string(),
                    datasets: vec![DatasetKey::HenryHubNaturalGas],
                },
            ],
        }
    }
}

/// Candidate report day `offset` steps back from `today`. A Monday check
/// day skips back over the weekend.
pub fn last_business_day(today: NaiveDate, offset: u32) -> NaiveDate {
    let offset = i64::from(offset);
    let check = today - Duration::days(offset);
    if check.weekday() == Weekday::Mon {
        today - Duration::days(offset + 3)
    } else {
        today - Duration::days(offset + 1)
    }
}

/// Distinct candidate days, newest first.
pub fn candidate_dates(today: NaiveDate, lookback_days: u32) -> Vec<NaiveDate> {
    let mut dates = Vec::new();
    for offset in 0..lookback_days {
        let date = last_business_day(today, offset);
        if !dates.contains(&date) {
            dates.push(date);
        }
    }
    dates
}

pub fn download_request(
    base_url: &str,
    date: NaiveDate,
    fid: &str,
    username: &str,
    password: SecretString,
) -> HttpRequest {
    HttpRequest::get(base_url)
        .with_query("fid", format!("{}-{fid}", date.format("%Y%m%d")))
        .with_basic_auth(username, password)
}

/// Front-month price for one dataset. An empty section or an unreadable
/// price yields `Null`, which the caller drops before insert.
pub fn front_month_price(report: &str, key: DatasetKey) -> Result<Value, AdapterError> {
    let rows = extract_dataset(report, key)?;
    let Some(front) = rows.first() else {
        warn!(dataset = %key, "settlement section has no rows");
        return Ok(Value::Null);
    };

    let basis = key.price_basis().column();
    let table = match normalize(
        std::slice::from_ref(front),
        Some(key.report_title()),
        &[DATA_SET_COLUMN, MTH_STRIKE_COLUMN, basis],
    ) {
        Ok(table) => table,
        Err(NormalizeError::MalformedValue { column, raw }) => {
            warn!(dataset = %key, column = %column, raw = %raw, "front-month price unreadable");
            return Ok(Value::Null);
        }
        Err(err) => return Err(err.into()),
    };

    let Some(price) = table.value(0, basis).and_then(Value::as_f64) else {
        return Ok(Value::Null);
    };
    if key.publishes_inverse() {
        Ok(Value::Number(if price == 0.0 { 0.0 } else { 1.0 / price }))
    } else {
        Ok(Value::Number(price))
    }
}

fn is_blank_price(column: &str, value: &Value) -> bool {
    column != DATE_COLUMN
        && match value {
            Value::Null => true,
            Value::Number(n) => *n == 0.0 || n.is_nan(),
            _ => false,
        }
}

#[derive(Debug, Clone, Default)]
pub struct CmeSettlementAdapter {
    config: CmeConfig,
}

impl CmeSettlementAdapter {
    pub fn new(config: CmeConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CmeConfig {
        &self.config
    }

    fn group_for(&self, fid: &str) -> Option<&FidGroup> {
        self.config.fid_groups.iter().find(|g| g.fid == fid)
    }

    /// Wide row: `Date` plus one column per dataset, zero/null prices dropped.
    /// `Date` is the run day; the settlement file dates stay on the artifacts.
    pub fn price_row(
        &self,
        ctx: &AdapterContext,
        artifacts: &[RawArtifact],
    ) -> Result<Table, AdapterError> {
        let mut columns = vec![DATE_COLUMN.to_string()];
        if artifacts.is_empty() {
            return Ok(Table::new(columns));
        }

        if let Some(latest) = artifacts.iter().filter_map(|a| a.report_date).max() {
            if latest != ctx.as_of {
                debug!(run_day = %ctx.as_of, report_date = %latest, "pricing run day from an earlier settlement file");
            }
        }
        let mut values = vec![Value::Date(ctx.as_of)];

        for artifact in artifacts {
            let group = self
                .group_for(&artifact.source_key)
                .ok_or_else(|| AdapterError::Payload {
                    source_id: CME_SOURCE_ID,
                    detail: format!("no dataset group for fid {}", artifact.source_key),
                })?;
            let text = artifact.text();
            for key in &group.datasets {
                columns.push(key.warehouse_column().to_string());
                values.push(front_month_price(&text, *key)?);
            }
        }

        let mut table = Table::new(columns);
        table.push_row(values)?;
        table.drop_columns_where(is_blank_price);
        Ok(table)
    }
}

#[async_trait]
impl SourceAdapter for CmeSettlementAdapter {
    fn source_id(&self) -> &'static str {
        CME_SOURCE_ID
    }

    async fn fetch(
        &self,
        services: &AdapterServices,
        ctx: &AdapterContext,
    ) -> Result<Vec<RawArtifact>, AdapterError> {
        let username = services
            .secrets
            .get_secret(&self.config.username_secret)
            .await?;
        let password = services
            .secrets
            .get_secret(&self.config.password_secret)
            .await?;

        let mut artifacts = Vec::with_capacity(self.config.fid_groups.len());
        for group in &self.config.fid_groups {
            let mut found = None;
            for date in candidate_dates(ctx.as_of, self.config.lookback_days) {
                let request = download_request(
                    &self.config.base_url,
                    date,
                    &group.fid,
                    username.expose_secret(),
                    password.clone(),
                );
                match services.http.send(ctx.run_id, CME_SOURCE_ID, &request).await {
                    Ok(resp) => {
                        found = Some((date, resp.body));
                        break;
                    }
                    Err(FetchError::HttpStatus {
                        status: status @ (401 | 403),
                        ..
                    }) => {
                        return Err(AdapterError::AuthFailure {
                            source_id: CME_SOURCE_ID,
                            status,
                        });
                    }
                    Err(err) => {
                        info!(fid = %group.fid, %date, error = %err, "settlement file not available");
                    }
                }
            }

            let Some((date, body)) = found else {
                return Err(AdapterError::NoReport {
                    source_id: CME_SOURCE_ID,
                    detail: format!(
                        "{} within {} business days of {}",
                        group.fid, self.config.lookback_days, ctx.as_of
                    ),
                });
            };

            let archived = services
                .store
                .archive(
                    ctx.fetched_at,
                    &format!("{CME_SOURCE_ID}/{}", group.fid),
                    "txt",
                    &body,
                )
                .await?;
            info!(fid = %group.fid, %date, key = %archived.key, "settlement file archived");
            artifacts.push(RawArtifact {
                label: group.fid.clone(),
                source_key: group.fid.clone(),
                report_date: Some(date),
                archived,
                body,
                converted_text: None,
            });
        }
        Ok(artifacts)
    }

    fn parse(
        &self,
        ctx: &AdapterContext,
        artifacts: &[RawArtifact],
    ) -> Result<Vec<ParsedBatch>, AdapterError> {
        Ok(vec![ParsedBatch {
            target: self.config.target.clone(),
            primary_key: self.config.primary_key.clone(),
            table: self.price_row(ctx, artifacts)?,
        }])
    }
}
