// src/lib.rs
//! Discovers, classifies and downloads investor-relations documents
//! (concall transcripts, presentations, annual reports) for listed companies.

pub mod config;
pub mod extractors;
pub mod orchestrator;
pub mod service;
pub mod source;
pub mod storage;
pub mod utils;

pub use config::ScraperConfig;
pub use extractors::{classify, parse_filename, ClassifiedDocument, DocumentType, NamedArtifact, NormalizedPeriod};
pub use orchestrator::{DownloadOutcome, DownloadResult, JobEvent, JobState, JobStats, ScrapeJob};
pub use service::{ArtifactScope, CancelAck, ConcallService, JobRequest};
pub use source::{CompanyIdentity, RawDocumentEntry, Section};
pub use storage::{ArtifactInfo, StorageManager};
pub use utils::AppError;
