use std::path::{Path, PathBuf};

use grid_client::domain::Reading;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::{fs::OpenOptions, io::AsyncWriteExt, sync::Mutex};

use crate::pipeline::{payload_digest, PipelineError};

/// A reading the store could not accept after all retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub reading: Reading,
    pub origin: String,
    pub error: String,
    pub attempts: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub failed_at: OffsetDateTime,
    pub digest: String,
}

impl DeadLetter {
    pub fn new(reading: Reading, origin: String, error: String, attempts: u32) -> Self {
        let digest = serde_json::to_vec(&reading)
            .map(|bytes| payload_digest(&bytes))
            .unwrap_or_default();
        Self {
            reading,
            origin,
            error,
            attempts,
            failed_at: OffsetDateTime::now_utc(),
            digest,
        }
    }
}

/// Overflow destination for readings that exhausted their write retries.
#[async_trait::async_trait]
pub trait DeadLetterSink: Send + Sync {
    /// Persist every record or fail as a whole.
    async fn record(&self, letters: &[DeadLetter]) -> Result<(), PipelineError>;
}

/// Appends dead letters as newline-delimited JSON.
pub struct FileDeadLetterSink {
    path: PathBuf,
    file: Mutex<Option<tokio::fs::File>>,
}

impl FileDeadLetterSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait::async_trait]
impl DeadLetterSink for FileDeadLetterSink {
    async fn record(&self, letters: &[DeadLetter]) -> Result<(), PipelineError> {
        let mut buf = Vec::with_capacity(letters.len() * 256);
        for letter in letters {
            serde_json::to_writer(&mut buf, letter)
                .map_err(|e| PipelineError::Sink(format!("failed to encode dead letter: {e}")))?;
            buf.push(b'\n');
        }

        let mut guard = self.file.lock().await;
        if guard.is_none() {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await
                .map_err(|e| PipelineError::Sink(format!("failed to open {}: {e}", self.path.display())))?;
            *guard = Some(file);
        }

        let Some(file) = guard.as_mut() else {
            return Err(PipelineError::Sink("dead-letter file unavailable".to_string()));
        };

        let res = async {
            file.write_all(&buf).await?;
            file.flush().await
        }
        .await;

        if let Err(e) = res {
            // Reopen on the next attempt.
            *guard = None;
            return Err(PipelineError::Sink(format!(
                "failed to write {}: {e}",
                self.path.display()
            )));
        }

        Ok(())
    }
}

/// Keeps dead letters in memory; optionally refuses every write.
#[derive(Default)]
pub struct MemoryDeadLetterSink {
    letters: Mutex<Vec<DeadLetter>>,
    failing: bool,
}

impl MemoryDeadLetterSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            letters: Mutex::new(Vec::new()),
            failing: true,
        }
    }

    pub async fn letters(&self) -> Vec<DeadLetter> {
        self.letters.lock().await.clone()
    }
}

#[async_trait::async_trait]
impl DeadLetterSink for MemoryDeadLetterSink {
    async fn record(&self, letters: &[DeadLetter]) -> Result<(), PipelineError> {
        if self.failing {
            return Err(PipelineError::Sink("dead-letter sink unavailable".to_string()));
        }
        self.letters.lock().await.extend_from_slice(letters);
        Ok(())
    }
}
