//! Staged driver-report PDFs -> document and page-metadata tables.

use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use feedstock_core::{NarrativePageRecord, Table, TableRef, Value};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{info, warn};

use crate::narrative::{scan_document, DatePolicy};
use crate::{AdapterContext, AdapterError, AdapterServices, ParsedBatch, RawArtifact, SourceAdapter};

pub const DRIVERS_SOURCE_ID: &str = "drivers";
pub const PDF_NAME_COLUMN: &str = "pdfName";

#[async_trait]
pub trait PdfConverter: Send + Sync {
    async fn to_markdown(&self, pdf: &[u8]) -> Result<String, AdapterError>;
}

/// External converter reading the PDF on stdin and writing markdown to stdout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandConverter {
    program: String,
    args: Vec<String>,
}

impl CommandConverter {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Splits a whitespace-separated command line; `None` when empty.
    pub fn from_command_line(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self::new(program, parts.collect()))
    }
}

#[async_trait]
impl PdfConverter for CommandConverter {
    async fn to_markdown(&self, pdf: &[u8]) -> Result<String, AdapterError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AdapterError::Converter(format!("spawning {}: {e}", self.program)))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| AdapterError::Converter("converter stdin unavailable".to_string()))?;
        let input = pdf.to_vec();
        let feed = async move {
            let written = stdin.write_all(&input).await;
            drop(stdin);
            written
        };

        let (written, output) = tokio::join!(feed, child.wait_with_output());
        let output = output
            .map_err(|e| AdapterError::Converter(format!("waiting on {}: {e}", self.program)))?;
        if !output.status.success() {
            return Err(AdapterError::Converter(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        if let Err(err) = written {
            // A converter may stop reading once it has what it needs.
            warn!(program = %self.program, error = %err, "converter closed stdin early");
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriversConfig {
    pub staging_prefix: String,
    pub historical_prefix: String,
    pub document_table: TableRef,
    pub metadata_table: TableRef,
    pub date_policy: DatePolicy,
}

impl Default for DriversConfig {
    fn default() -> Self {
        Self {
            staging_prefix: "drivers-current-pdfs/".to_string(),
            historical_prefix: "drivers-historical-pdfs/".to_string(),
            document_table: TableRef::new("stg", "DriversDocuments"),
            metadata_table: TableRef::new("stg", "DriversMetadata"),
            date_policy: DatePolicy::default(),
        }
    }
}

pub struct DriversAdapter {
    config: DriversConfig,
    converter: Arc<dyn PdfConverter>,
}

impl DriversAdapter {
    pub fn new(config: DriversConfig, converter: Arc<dyn PdfConverter>) -> Self {
        Self { config, converter }
    }

    pub fn config(&self) -> &DriversConfig {
        &self.config
    }

    /// Where a staged key lands once processed; sub-folders under the
    /// staging prefix are kept.
    pub fn historical_key(&self, staged_key: &str) -> String {
        let rest = staged_key
            .strip_prefix(&self.config.staging_prefix)
            .or_else(|| staged_key.split_once('/').map(|(_, rest)| rest))
            .unwrap_or(staged_key);
        format!("{}{}", self.config.historical_prefix, rest)
    }

    fn document_row(artifact: &RawArtifact) -> Vec<Value> {
        vec![
            Value::text(artifact.label.clone()),
            Value::Number(artifact.body.len() as f64),
            Value::text(artifact.archived.content_hash.clone()),
            Value::text(artifact.archived.key.clone()),
        ]
    }

    /// One row per page; `documentId` is the content hash of the PDF row.
    fn page_row(document_id: &str, record: &NarrativePageRecord) -> Vec<Value> {
        vec![
            Value::text(record.pdf_name.clone()),
            Value::text(document_id),
            Value::Number(f64::from(record.page)),
            Value::text(record.header.clone()),
            record.date.map_or(Value::Null, Value::Date),
        ]
    }
}

#[async_trait]
impl SourceAdapter for DriversAdapter {
    fn source_id(&self) -> &'static str {
        DRIVERS_SOURCE_ID
    }

    async fn fetch(
        &self,
        services: &AdapterServices,
        ctx: &AdapterContext,
    ) -> Result<Vec<RawArtifact>, AdapterError> {
        let staged = services.store.list(&self.config.staging_prefix).await?;
        let mut artifacts = Vec::new();

        for key in staged {
            if !key.to_ascii_lowercase().ends_with(".pdf") {
                continue;
            }
            let body = services.store.get(&key).await?;
            let archived = services
                .store
                .archive(ctx.fetched_at, DRIVERS_SOURCE_ID, "pdf", &body)
                .await?;
            let markdown = self.converter.to_markdown(&body).await?;
            info!(key = %key, bytes = body.len(), "driver report converted");
            artifacts.push(RawArtifact {
                label: key.clone(),
                source_key: key,
                report_date: None,
                archived,
                body,
                converted_text: Some(markdown),
            });
        }
        Ok(artifacts)
    }

    fn parse(
        &self,
        _ctx: &AdapterContext,
        artifacts: &[RawArtifact],
    ) -> Result<Vec<ParsedBatch>, AdapterError> {
        let mut documents = Table::new([PDF_NAME_COLUMN, "length", "sha256", "archiveKey"]);
        let mut metadata = Table::new([PDF_NAME_COLUMN, "documentId", "page", "header", "date"]);

        for artifact in artifacts {
            let scan = scan_document(&artifact.text(), &artifact.label, self.config.date_policy);
            if !scan.diagnostics.is_empty() {
                warn!(
                    pdf_name = %artifact.label,
                    diagnostics = scan.diagnostics.len(),
                    "driver report had unreadable lines"
                );
            }
            documents.push_row(Self::document_row(artifact))?;
            for record in &scan.records {
                metadata.push_row(Self::page_row(&artifact.archived.content_hash, record))?;
            }
        }

        Ok(vec![
            ParsedBatch {
                target: self.config.document_table.clone(),
                primary_key: PDF_NAME_COLUMN.to_string(),
                table: documents,
            },
            ParsedBatch {
                target: self.config.metadata_table.clone(),
                primary_key: PDF_NAME_COLUMN.to_string(),
                table: metadata,
            },
        ])
    }

    /// Moves each processed PDF from staging to the historical prefix.
    async fn finalize(
        &self,
        services: &AdapterServices,
        _ctx: &AdapterContext,
        artifacts: &[RawArtifact],
    ) -> Result<(), AdapterError> {
        for artifact in artifacts {
            let target = self.historical_key(&artifact.source_key);
            services.store.rename(&artifact.source_key, &target).await?;
            info!(from = %artifact.source_key, to = %target, "staged report moved");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use feedstock_storage::StoredObject;

    #[test]
    fn command_line_splits_program_and_args() {
        let conv = CommandConverter::from_command_line("pdf2md --stdin --format gfm").expect("cmd");
        assert_eq!(
            conv,
            CommandConverter::new("pdf2md", vec!["--stdin".into(), "--format".into(), "gfm".into()])
        );
        assert!(CommandConverter::from_command_line("   ").is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_converter_pipes_through_stdin() {
        let conv = CommandConverter::new("cat", Vec::new());
        let text = conv.to_markdown(b"# PE DRIVERS\n").await.expect("cat");
        assert_eq!(text, "# PE DRIVERS\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_converter_is_reported() {
        let conv = CommandConverter::new("false", Vec::new());
        let err = conv.to_markdown(b"%PDF").await.unwrap_err();
        assert!(matches!(err, AdapterError::Converter(_)));
    }

    #[test]
    fn each_page_becomes_its_own_row() {
        let record = |page, header: &str, date| NarrativePageRecord {
            page,
            header: header.into(),
            date,
            pdf_name: "drivers-current-pdfs/PE.pdf".into(),
        };
        let march = chrono::NaiveDate::from_ymd_opt(2024, 3, 1);
        assert_eq!(
            DriversAdapter::page_row("ab12", &record(1, "PE DRIVERS", march)),
            vec![
                Value::text("drivers-current-pdfs/PE.pdf"),
                Value::text("ab12"),
                Value::Number(1.0),
                Value::text("PE DRIVERS"),
                Value::Date(march.expect("date")),
            ]
        );
        assert_eq!(
            DriversAdapter::page_row("ab12", &record(2, "Error1", None))[4],
            Value::Null
        );
    }

    struct Never;

    #[async_trait]
    impl PdfConverter for Never {
        async fn to_markdown(&self, _pdf: &[u8]) -> Result<String, AdapterError> {
            Err(AdapterError::Converter("unused".into()))
        }
    }

    #[test]
    fn historical_key_keeps_sub_folders() {
        let adapter = DriversAdapter::new(DriversConfig::default(), Arc::new(Never));
        assert_eq!(
            adapter.historical_key("drivers-current-pdfs/2024/PE March.pdf"),
            "drivers-historical-pdfs/2024/PE March.pdf"
        );
        assert_eq!(
            adapter.historical_key("drivers-current-pdfs/PE.pdf"),
            "drivers-historical-pdfs/PE.pdf"
        );
    }

    #[test]
    fn document_row_carries_hash_and_archive_key() {
        let artifact = RawArtifact {
            label: "drivers-current-pdfs/2024/PE March.pdf".into(),
            source_key: "drivers-current-pdfs/2024/PE March.pdf".into(),
            report_date: None,
            archived: StoredObject {
                key: "raw/20240301_000000/drivers/ab.pdf".into(),
                content_type: "application/pdf".into(),
                content_hash: "ab".into(),
                byte_size: 4,
                deduplicated: false,
            },
            body: b"%PDF".to_vec(),
            converted_text: None,
        };
        assert_eq!(
            DriversAdapter::document_row(&artifact),
            vec![
                Value::text("drivers-current-pdfs/2024/PE March.pdf"),
                Value::Number(4.0),
                Value::text("ab"),
                Value::text("raw/20240301_000000/drivers/ab.pdf"),
            ]
        );
    }
}
