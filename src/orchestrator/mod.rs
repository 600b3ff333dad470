// src/orchestrator/mod.rs
pub mod job;
pub mod progress;
pub mod runner;

pub use job::{DownloadOutcome, DownloadResult, JobState, JobStats, ScrapeJob, SkipReason};
pub use progress::{JobEvent, JobSubscription, ProgressChannel};
pub use runner::{JobRun, Orchestrator};
