// src/orchestrator/job.rs
use crate::extractors::classifier::DocumentType;
use crate::extractors::naming::NamedArtifact;
use crate::source::models::Section;
use crate::utils::error::{FetchError, StorageError};
use crate::utils::AppError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Lowest accepted spacing between requests to the source site.
pub const MIN_DELAY_SECONDS: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Idle,
    Running,
    Completed,
    Stopped,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Stopped | JobState::Failed)
    }

    /// `Idle -> Running -> {Running, Completed, Stopped, Failed}`.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        matches!(
            (self, next),
            (JobState::Idle, JobState::Running)
                | (JobState::Running, JobState::Running)
                | (JobState::Running, JobState::Completed)
                | (JobState::Running, JobState::Stopped)
                | (JobState::Running, JobState::Failed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Idle => "idle",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Stopped => "stopped",
            JobState::Failed => "failed",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One run over an ordered list of symbols. Single use: a finished job is
/// never restarted.
#[derive(Debug, Clone)]
pub struct ScrapeJob {
    pub id: String,
    pub symbols: Vec<String>,
    pub requested_types: BTreeSet<DocumentType>,
    pub download_enabled: bool,
    pub output_dir: PathBuf,
    /// Newest N entries kept per listing section.
    pub recent_limit: Option<usize>,
    delay: Duration,
    state: JobState,
}

impl ScrapeJob {
    /// An empty `requested_types` means every type.
    pub fn new(
        symbols: Vec<String>,
        requested_types: BTreeSet<DocumentType>,
        delay_seconds: f64,
        download_enabled: bool,
        output_dir: impl Into<PathBuf>,
    ) -> Result<Self, AppError> {
        let symbols: Vec<String> = symbols
            .into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if symbols.is_empty() {
            return Err(AppError::Config("at least one symbol is required".to_string()));
        }
        if !delay_seconds.is_finite() || delay_seconds < MIN_DELAY_SECONDS {
            return Err(AppError::Config(format!(
                "delay must be at least {} second(s), got {}",
                MIN_DELAY_SECONDS, delay_seconds
            )));
        }

        let requested_types = if requested_types.is_empty() {
            DocumentType::ALL.into_iter().collect()
        } else {
            requested_types
        };

        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            symbols,
            requested_types,
            download_enabled,
            output_dir: output_dir.into(),
            recent_limit: None,
            delay: Duration::from_secs_f64(delay_seconds),
            state: JobState::Idle,
        })
    }

    pub fn with_recent_limit(mut self, limit: Option<usize>) -> Self {
        self.recent_limit = limit;
        self
    }

    /// Bypasses the one-second floor so tests can run against a local server.
    #[cfg(test)]
    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn transition(&mut self, next: JobState) -> Result<(), AppError> {
        if !self.state.can_transition_to(next) {
            return Err(AppError::InvalidState(format!("{} -> {}", self.state, next)));
        }
        self.state = next;
        Ok(())
    }

    pub fn wants(&self, doc_type: DocumentType) -> bool {
        self.requested_types.contains(&doc_type)
    }

    /// Listing sections that can contain a requested type. Unclassified
    /// documents only come from concall listings.
    pub fn sections(&self) -> BTreeSet<Section> {
        self.requested_types.iter().map(DocumentType::section).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    AlreadyPresent,
    TypeNotRequested,
    DownloadDisabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Timeouts, connection failures and 5xx after every retry.
    Transient,
    /// 4xx, never retried.
    Request,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadOutcome {
    Success,
    Skipped(SkipReason),
    Failed { kind: FailureKind, message: String },
}

impl DownloadOutcome {
    pub fn from_fetch_error(error: &FetchError) -> Self {
        let kind = match error {
            e if e.is_transient() => FailureKind::Transient,
            FetchError::Client(_) => FailureKind::Request,
            _ => FailureKind::Other,
        };
        DownloadOutcome::Failed {
            kind,
            message: error.to_string(),
        }
    }

    /// Machine-readable outcome code carried by progress events.
    pub fn code(&self) -> &'static str {
        match self {
            DownloadOutcome::Success => "success",
            DownloadOutcome::Skipped(SkipReason::AlreadyPresent) => "skipped_existing",
            DownloadOutcome::Skipped(SkipReason::TypeNotRequested) => "skipped_type",
            DownloadOutcome::Skipped(SkipReason::DownloadDisabled) => "skipped_download_disabled",
            DownloadOutcome::Failed { kind: FailureKind::Transient, .. } => "failed_transient",
            DownloadOutcome::Failed { kind: FailureKind::Request, .. } => "failed_request",
            DownloadOutcome::Failed { kind: FailureKind::Other, .. } => "failed_other",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadResult {
    pub artifact: NamedArtifact,
    pub outcome: DownloadOutcome,
    pub bytes_written: u64,
}

impl DownloadResult {
    pub fn skipped(artifact: NamedArtifact, reason: SkipReason) -> Self {
        Self {
            artifact,
            outcome: DownloadOutcome::Skipped(reason),
            bytes_written: 0,
        }
    }

    pub fn failed(artifact: NamedArtifact, error: &FetchError) -> Self {
        Self {
            artifact,
            outcome: DownloadOutcome::from_fetch_error(error),
            bytes_written: 0,
        }
    }

    /// The artifact could not be stored under its name.
    pub fn rejected(artifact: NamedArtifact, error: &StorageError) -> Self {
        Self {
            artifact,
            outcome: DownloadOutcome::Failed {
                kind: FailureKind::Other,
                message: error.to_string(),
            },
            bytes_written: 0,
        }
    }

    pub fn message(&self) -> String {
        let name = &self.artifact.filename;
        match &self.outcome {
            DownloadOutcome::Success => format!("Downloaded {} ({} bytes)", name, self.bytes_written),
            DownloadOutcome::Skipped(SkipReason::AlreadyPresent) => format!("Skipped {}: already present", name),
            DownloadOutcome::Skipped(SkipReason::TypeNotRequested) => {
                format!("Skipped {}: {} not requested", name, self.artifact.classified.doc_type)
            }
            DownloadOutcome::Skipped(SkipReason::DownloadDisabled) => format!("Found {}", name),
            DownloadOutcome::Failed { message, .. } => format!("Failed {}: {}", name, message),
        }
    }
}

/// Running totals for one job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobStats {
    pub total_companies: usize,
    pub companies_processed: usize,
    pub downloaded: usize,
    pub skipped: usize,
    pub failed: usize,
    pub bytes_written: u64,
}

impl JobStats {
    pub fn record(&mut self, result: &DownloadResult) {
        match result.outcome {
            DownloadOutcome::Success => {
                self.downloaded += 1;
                self.bytes_written += result.bytes_written;
            }
            DownloadOutcome::Skipped(_) => self.skipped += 1,
            DownloadOutcome::Failed { .. } => self.failed += 1,
        }
    }

    /// Percentage of attempted fetches that succeeded, one decimal.
    pub fn success_rate(&self) -> f64 {
        let attempted = self.downloaded + self.failed;
        if attempted == 0 {
            return 0.0;
        }
        let rate = self.downloaded as f64 / attempted as f64 * 100.0;
        (rate * 10.0).round() / 10.0
    }
}
