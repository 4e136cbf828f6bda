//! EIA weekly refinery utilisation for the U.S. total and PADD 3.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{Datelike, Duration, NaiveDate};
use feedstock_core::{Table, TableRef, Value};
use feedstock_storage::{FetchError, HttpRequest};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{info, warn};

use crate::{AdapterContext, AdapterError, AdapterServices, ParsedBatch, RawArtifact, SourceAdapter};

pub const EIA_SOURCE_ID: &str = "eia";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeriesRole {
    /// Published utilisation percentage; archived for reference.
    ReportedUtilization,
    OperableCapacity,
    GrossInput,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EiaSeries {
    pub role: SeriesRole,
    /// Facet name: `process` or `product`.
    pub facet: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AreaColumn {
    pub area_name: String,
    pub column: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EiaConfig {
    pub base_url: String,
    pub api_key_secret: String,
    pub page_length: u32,
    pub target: TableRef,
    pub primary_key: String,
    pub series: Vec<EiaSeries>,
    pub areas: Vec<AreaColumn>,
}

impl Default for EiaConfig {
    fn default() -> Self {
        let series = |role, facet: &str, value: &str| EiaSeries {
            role,
            facet: facet.to_string(),
            value: value.to_string(),
        };
        Self {
            base_url: "https://api.eia.gov/v2/petroleum/pnp/wiup/data/".to_string(),
            api_key_secret: "EIA-API-KEY".to_string(),
            page_length: 12,
            target: TableRef::new("stg", "RefineryRates"),
            primary_key: "Date".to_string(),
            series: vec![
                series(SeriesRole::ReportedUtilization, "process", "YUP"),
                series(SeriesRole::OperableCapacity, "process", "YRL"),
                series(SeriesRole::GrossInput, "product", "EPXXX2"),
            ],
            areas: vec![
                AreaColumn {
                    area_name: "U.S.".to_string(),
                    column: "U.S.".to_string(),
                },
                AreaColumn {
                    area_name: "PADD 3".to_string(),
                    column: "PADD3".to_string(),
                },
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EiaRow {
    pub period: String,
    pub duoarea: String,
    #[serde(rename = "area-name")]
    pub area_name: String,
    #[serde(default)]
    pub value: JsonValue,
}

impl EiaRow {
    /// EIA returns values as numbers or numeric strings.
    pub fn number(&self) -> Option<f64> {
        match &self.value {
            JsonValue::Number(n) => n.as_f64(),
            JsonValue::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    response: ResponseBody,
}

#[derive(Debug, Deserialize)]
struct ResponseBody {
    #[serde(default)]
    data: Vec<EiaRow>,
}

pub fn parse_rows(body: &str) -> Result<Vec<EiaRow>, AdapterError> {
    serde_json::from_str::<Envelope>(body)
        .map(|env| env.response.data)
        .map_err(|err| AdapterError::Payload {
            source_id: EIA_SOURCE_ID,
            detail: err.to_string(),
        })
}

/// Most recent Friday on or before `day`.
pub fn most_recent_friday(day: NaiveDate) -> NaiveDate {
    let weekday = i64::from(day.weekday().num_days_from_monday());
    match weekday {
        0..=3 => day - Duration::days(weekday + 3),
        4 => day,
        _ => day - Duration::days(weekday - 4),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UtilizationPoint {
    pub period: NaiveDate,
    pub area_name: String,
    pub utilization: f64,
}

/// Joins capacity and gross input on period/duoarea/area-name;
/// utilisation = input / capacity * 100, two decimals.
pub fn utilization_points(capacity: &[EiaRow], gross_input: &[EiaRow]) -> Vec<UtilizationPoint> {
    let inputs: HashMap<(&str, &str, &str), f64> = gross_input
        .iter()
        .filter_map(|r| {
            r.number()
                .map(|v| ((r.period.as_str(), r.duoarea.as_str(), r.area_name.as_str()), v))
        })
        .collect();

    capacity
        .iter()
        .filter_map(|cap| {
            let denominator = cap.number().filter(|v| *v != 0.0)?;
            let input = inputs.get(&(cap.period.as_str(), cap.duoarea.as_str(), cap.area_name.as_str()))?;
            let period = match NaiveDate::parse_from_str(&cap.period, "%Y-%m-%d") {
                Ok(p) => p,
                Err(err) => {
                    warn!(period = %cap.period, error = %err, "skipping undated EIA row");
                    return None;
                }
            };
            Some(UtilizationPoint {
                period,
                area_name: cap.area_name.clone(),
                utilization: (input / denominator * 10_000.0).round() / 100.0,
            })
        })
        .collect()
}

#[derive(Debug, Clone, Default)]
pub struct RefineryRatesAdapter {
    config: EiaConfig,
}

impl RefineryRatesAdapter {
    pub fn new(config: EiaConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EiaConfig {
        &self.config
    }

    fn request_for(&self, series: &EiaSeries, api_key: &str) -> HttpRequest {
        HttpRequest::get(&self.config.base_url)
            .with_query("api_key", api_key)
            .with_query("frequency", "weekly")
            .with_query("data[0]", "value")
            .with_query(format!("facets[{}][]", series.facet), series.value.clone())
            .with_query("sort[0][column]", "period")
            .with_query("sort[0][direction]", "desc")
            .with_query("offset", "0")
            .with_query("length", self.config.page_length.to_string())
    }

    fn rows_for(&self, role: SeriesRole, artifacts: &[RawArtifact]) -> Result<Vec<EiaRow>, AdapterError> {
        let series = self
            .config
            .series
            .iter()
            .find(|s| s.role == role)
            .ok_or_else(|| AdapterError::Payload {
                source_id: EIA_SOURCE_ID,
                detail: format!("no series configured for {role:?}"),
            })?;
        let artifact = artifacts
            .iter()
            .find(|a| a.source_key == series.value)
            .ok_or_else(|| AdapterError::NoReport {
                source_id: EIA_SOURCE_ID,
                detail: format!("series {} was not fetched", series.value),
            })?;
        parse_rows(&artifact.text())
    }

    /// Single output row for the most recent Friday with data, falling back
    /// one week.
    pub fn rates_row(&self, as_of: NaiveDate, points: &[UtilizationPoint]) -> Result<Table, AdapterError> {
        let friday = most_recent_friday(as_of);
        let wanted = |p: &&UtilizationPoint| self.config.areas.iter().any(|a| a.area_name == p.area_name);
        let period = [friday, friday - Duration::days(7)]
            .into_iter()
            .find(|day| points.iter().filter(wanted).any(|p| p.period == *day))
            .ok_or_else(|| AdapterError::NoReport {
                source_id: EIA_SOURCE_ID,
                detail: format!("no utilisation for the weeks ending {friday} or the Friday before"),
            })?;

        let mut columns = vec![self.config.primary_key.clone()];
        let mut values = vec![Value::Date(period)];
        for area in &self.config.areas {
            columns.push(area.column.clone());
            values.push(
                points
                    .iter()
                    .find(|p| p.period == period && p.area_name == area.area_name)
                    .map(|p| Value::Number(p.utilization))
                    .unwrap_or(Value::Null),
            );
        }

        let mut table = Table::new(columns);
        table.push_row(values)?;
        Ok(table)
    }
}

#[async_trait]
impl SourceAdapter for RefineryRatesAdapter {
    fn source_id(&self) -> &'static str {
        EIA_SOURCE_ID
    }

    async fn fetch(
        &self,
        services: &AdapterServices,
        ctx: &AdapterContext,
    ) -> Result<Vec<RawArtifact>, AdapterError> {
        let api_key = services
            .secrets
            .get_secret(&self.config.api_key_secret)
            .await?;

        let mut artifacts = Vec::with_capacity(self.config.series.len());
        for series in &self.config.series {
            let request = self.request_for(series, api_key.expose_secret());
            let resp = match services.http.send(ctx.run_id, EIA_SOURCE_ID, &request).await {
                Ok(resp) => resp,
                Err(FetchError::HttpStatus {
                    status: status @ (401 | 403),
                    ..
                }) => {
                    return Err(AdapterError::AuthFailure {
                        source_id: EIA_SOURCE_ID,
                        status,
                    })
                }
                Err(err) => return Err(err.into()),
            };
            let archived = services
                .store
                .archive(
                    ctx.fetched_at,
                    &format!("{EIA_SOURCE_ID}/{}", series.value),
                    "json",
                    &resp.body,
                )
                .await?;
            info!(series = %series.value, key = %archived.key, "series archived");
            artifacts.push(RawArtifact {
                label: format!("{:?}", series.role),
                source_key: series.value.clone(),
                report_date: None,
                archived,
                body: resp.body,
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
        let capacity = self.rows_for(SeriesRole::OperableCapacity, artifacts)?;
        let gross_input = self.rows_for(SeriesRole::GrossInput, artifacts)?;
        let points = utilization_points(&capacity, &gross_input);
        Ok(vec![ParsedBatch {
            target: self.config.target.clone(),
            primary_key: self.config.primary_key.clone(),
            table: self.rates_row(ctx.as_of, &points)?,
        }])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
    }

    #[test]
    fn friday_lookup_covers_every_weekday() {
        // 2024-11-22 is a Friday.
        assert_eq!(most_recent_friday(ymd(2024, 11, 22)), ymd(2024, 11, 22));
        assert_eq!(most_recent_friday(ymd(2024, 11, 23)), ymd(2024, 11, 22));
        assert_eq!(most_recent_friday(ymd(2024, 11, 24)), ymd(2024, 11, 22));
        assert_eq!(most_recent_friday(ymd(2024, 11, 25)), ymd(2024, 11, 22));
        assert_eq!(most_recent_friday(ymd(2024, 11, 28)), ymd(2024, 11, 22));
    }

    fn row(period: &str, duoarea: &str, area: &str, value: JsonValue) -> EiaRow {
        EiaRow {
            period: period.into(),
            duoarea: duoarea.into(),
            area_name: area.into(),
            value,
        }
    }

    #[test]
    fn utilisation_joins_on_period_and_area() {
        let capacity = vec![
            row("2024-11-15", "R30", "PADD 3", JsonValue::from(10_050.0)),
            row("2024-11-15", "NUS", "U.S.", JsonValue::from("18420")),
            row("2024-11-08", "R30", "PADD 3", JsonValue::Null),
        ];
        let input = vec![
            row("2024-11-15", "R30", "PADD 3", JsonValue::from(9_321.0)),
            row("2024-11-15", "NUS", "U.S.", JsonValue::from(16_402.0)),
            row("2024-11-08", "R30", "PADD 3", JsonValue::from(9_100.0)),
        ];
        let points = utilization_points(&capacity, &input);
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].utilization, 92.75);
        assert_eq!(points[1].utilization, 89.04);
    }

    #[test]
    fn falls_back_to_previous_friday() {
        let adapter = RefineryRatesAdapter::default();
        let points = vec![UtilizationPoint {
            period: ymd(2024, 11, 15),
            area_name: "PADD 3".into(),
            utilization: 92.75,
        }];
        let table = adapter.rates_row(ymd(2024, 11, 25), &points).expect("row");
        assert_eq!(table.columns(), ["Date".to_string(), "U.S.".to_string(), "PADD3".to_string()]);
        assert_eq!(table.value(0, "Date"), Some(&Value::Date(ymd(2024, 11, 15))));
        assert_eq!(table.value(0, "U.S."), Some(&Value::Null));
        assert_eq!(table.value(0, "PADD3"), Some(&Value::Number(92.75)));

        let err = adapter.rates_row(ymd(2024, 12, 9), &points).unwrap_err();
        assert!(matches!(err, AdapterError::NoReport { .. }));
    }

    #[test]
    fn request_keeps_key_out_of_url() {
        let adapter = RefineryRatesAdapter::default();
        let series = &adapter.config().series[1];
        let req = adapter.request_for(series, "secret-key");
        assert!(!req.url.contains("secret-key"));
        assert!(req.rendered().contains("facets[process][]=YRL"));
        assert!(req.rendered().contains("length=12"));
    }
}
