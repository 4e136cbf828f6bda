use chrono::{DateTime, NaiveDate, Utc};
use feedstock_storage::{ObjectStore, StoreError, StoredObject};
use tracing::Level;

/// Levelled text log of one job run, mirrored to tracing as it is written and
/// appended to the job's daily log blob at the end.
#[derive(Debug, Clone)]
pub struct RunJournal {
    job: String,
    lines: Vec<String>,
}

impl RunJournal {
    pub fn new(job: impl Into<String>) -> Self {
        Self {
            job: job.into(),
            lines: Vec::new(),
        }
    }

    /// `logs/{job}_{YYYY-MM-DD}.txt`
    pub fn blob_key(job: &str, day: NaiveDate) -> String {
        format!("logs/{job}_{}.txt", day.format("%Y-%m-%d"))
    }

    pub fn info(&mut self, message: impl AsRef<str>) {
        self.record(Utc::now(), Level::INFO, message.as_ref());
    }

    pub fn warn(&mut self, message: impl AsRef<str>) {
        self.record(Utc::now(), Level::WARN, message.as_ref());
    }

    pub fn error(&mut self, message: impl AsRef<str>) {
        self.record(Utc::now(), Level::ERROR, message.as_ref());
    }

    pub fn record(&mut self, at: DateTime<Utc>, level: Level, message: &str) {
        if level == Level::ERROR {
            tracing::error!(job = %self.job, "{message}");
        } else if level == Level::WARN {
            tracing::warn!(job = %self.job, "{message}");
        } else {
            tracing::info!(job = %self.job, "{message}");
        }
        self.lines.push(format!(
            "{} - {} - {} - {}",
            at.format("%Y-%m-%d %H:%M:%S,%3f"),
            self.job,
            level,
            message
        ));
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn text(&self) -> String {
        let mut text = self.lines.join("\n");
        if !text.is_empty() {
            text.push('\n');
        }
        text
    }

    /// Appends the journal to the day's log blob, creating it when missing.
    pub async fn flush(
        &self,
        store: &dyn ObjectStore,
        day: NaiveDate,
    ) -> Result<StoredObject, StoreError> {
        store
            .append(&Self::blob_key(&self.job, day), self.text().as_bytes())
            .await
    }
}
