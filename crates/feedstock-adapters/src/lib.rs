//! Source adapter contracts plus the report parsers behind them.

pub mod cme;
pub mod dates;
pub mod drivers;
pub mod eia;
pub mod narrative;
pub mod normalize;
pub mod settlement;

use std::borrow::Cow;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use feedstock_core::{Table, TableError, TableRef};
use feedstock_storage::{
    CredentialProvider, FetchError, HttpTransport, ObjectStore, SecretError, StoreError,
    StoredObject,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub use cme::{CmeConfig, CmeSettlementAdapter};
pub use drivers::{CommandConverter, DriversAdapter, DriversConfig, PdfConverter};
pub use eia::{EiaConfig, RefineryRatesAdapter};
pub use normalize::NormalizeError;
pub use settlement::ExtractError;

pub const CRATE_NAME: &str = "feedstock-adapters";

/// Outbound collaborators an adapter talks to.
#[derive(Clone)]
pub struct AdapterServices {
    pub http: Arc<dyn HttpTransport>,
    pub store: Arc<dyn ObjectStore>,
    pub secrets: Arc<dyn CredentialProvider>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub fetched_at: DateTime<Utc>,
    /// Calendar day the run reports for; business-day lookbacks start here.
    pub as_of: NaiveDate,
}

impl AdapterContext {
    pub fn new(fetched_at: DateTime<Utc>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            fetched_at,
            as_of: fetched_at.date_naive(),
        }
    }
}

/// One fetched payload plus its archival copy.
#[derive(Debug, Clone)]
pub struct RawArtifact {
    pub label: String,
    /// Upstream identity: fid, EIA series code or staged object key.
    pub source_key: String,
    pub report_date: Option<NaiveDate>,
    pub archived: StoredObject,
    pub body: Vec<u8>,
    /// Text form when the body needed conversion first.
    pub converted_text: Option<String>,
}

impl RawArtifact {
    pub fn text(&self) -> Cow<'_, str> {
        match &self.converted_text {
            Some(text) => Cow::Borrowed(text.as_str()),
            None => String::from_utf8_lossy(&self.body),
        }
    }
}

/// Rows bound for one warehouse table.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedBatch {
    pub target: TableRef,
    pub primary_key: String,
    pub table: Table,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Extract(#[from] ExtractError),
    #[error(transparent)]
    Normalize(#[from] NormalizeError),
    #[error(transparent)]
    Table(#[from] TableError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Secret(#[from] SecretError),
    #[error("{source_id} rejected the credentials (http {status})")]
    AuthFailure { source_id: &'static str, status: u16 },
    #[error("no {source_id} data available: {detail}")]
    NoReport {
        source_id: &'static str,
        detail: String,
    },
    #[error("malformed {source_id} payload: {detail}")]
    Payload {
        source_id: &'static str,
        detail: String,
    },
    #[error("pdf conversion failed: {0}")]
    Converter(String),
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &'static str;

    /// Pulls raw payloads and archives each one before returning it.
    async fn fetch(
        &self,
        services: &AdapterServices,
        ctx: &AdapterContext,
    ) -> Result<Vec<RawArtifact>, AdapterError>;

    fn parse(
        &self,
        ctx: &AdapterContext,
        artifacts: &[RawArtifact],
    ) -> Result<Vec<ParsedBatch>, AdapterError>;

    /// Runs after every batch has been written.
    async fn finalize(
        &self,
        _services: &AdapterServices,
        _ctx: &AdapterContext,
        _artifacts: &[RawArtifact],
    ) -> Result<(), AdapterError> {
        Ok(())
    }
}
