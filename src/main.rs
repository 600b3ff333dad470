// src/main.rs
use clap::{Parser, Subcommand};
use concall_fetcher::utils::{self, AppError};
use concall_fetcher::{ArtifactScope, ConcallService, DocumentType, JobEvent, JobRequest, JobState, ScraperConfig};
use std::collections::BTreeSet;
use std::path::PathBuf;

/// Command Line Interface for fetching investor-relations documents
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Download documents for one or more companies
    Fetch {
        /// Symbols or company names, comma separated or repeated
        #[arg(required = true, value_delimiter = ',')]
        symbols: Vec<String>,

        /// Document types to download (transcript, presentation, annual-report, unclassified).
        /// Defaults to everything except unclassified links.
        #[arg(short, long, value_delimiter = ',')]
        types: Vec<DocumentType>,

        /// Seconds between requests to the site (minimum 1)
        #[arg(short, long, default_value_t = concall_fetcher::service::DEFAULT_DELAY_SECONDS)]
        delay: f64,

        /// Output directory for downloaded files
        #[arg(short, long, default_value = "./downloads")]
        output_dir: PathBuf,

        /// List what would be downloaded without fetching anything
        #[arg(long)]
        no_download: bool,

        /// Concurrent fetches per job
        #[arg(short, long)]
        workers: Option<usize>,

        /// Keep only the newest N documents per section
        #[arg(short, long)]
        limit: Option<usize>,
    },
    /// Resolve a symbol or company name and print it as JSON
    Resolve { query: String },
    /// List files in an output directory as JSON
    List {
        #[arg(short, long, default_value = "./downloads")]
        output_dir: PathBuf,
    },
    /// Delete every file in an output directory
    Clear {
        #[arg(short, long, default_value = "./downloads")]
        output_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), AppError> {
    // 1. Setup Logging (reads RUST_LOG env var)
    utils::logging::setup_logging();

    // 2. Parse CLI Arguments
    let args = Args::parse();
    tracing::debug!("Parsed args: {:?}", args);

    // 3. Configuration from SCREENER_* variables
    let mut config = ScraperConfig::from_env()?;

    match args.command {
        Command::Fetch {
            symbols,
            types,
            delay,
            output_dir,
            no_download,
            workers,
            limit,
        } => {
            if let Some(workers) = workers {
                config.workers = workers;
            }
            config.validate()?;
            let service = ConcallService::new(config);
            let request = JobRequest {
                symbols,
                doc_types: requested_types(types),
                delay_seconds: delay,
                download_enabled: !no_download,
                output_dir,
                recent_limit: limit,
            };
            run_job(&service, request).await?;
        }
        Command::Resolve { query } => {
            let service = ConcallService::new(config);
            let identity = service.resolve_company(&query).await?;
            println!("{}", serde_json::to_string_pretty(&identity)?);
        }
        Command::List { output_dir } => {
            let service = ConcallService::new(config);
            let artifacts = service.list_artifacts(ArtifactScope::Directory(output_dir))?;
            println!("{}", serde_json::to_string_pretty(&artifacts)?);
        }
        Command::Clear { output_dir } => {
            let service = ConcallService::new(config);
            let removed = service.clear_artifacts(&output_dir)?;
            tracing::info!("Removed {} files from {}", removed, output_dir.display());
        }
    }

    Ok(())
}

/// Recordings and other unrecognised links are only fetched when asked for.
const DEFAULT_TYPES: [DocumentType; 3] = [
    DocumentType::Transcript,
    DocumentType::Presentation,
    DocumentType::AnnualReport,
];

fn requested_types(types: Vec<DocumentType>) -> BTreeSet<DocumentType> {
    if types.is_empty() {
        DEFAULT_TYPES.into_iter().collect()
    } else {
        types.into_iter().collect()
    }
}

fn job_outcome(job_id: &str, state: JobState) -> Result<JobState, AppError> {
    match state {
        JobState::Failed => Err(AppError::JobFailed(job_id.to_string())),
        state => Ok(state),
    }
}

/// Starts the job and follows its events until it ends; Ctrl-C cancels it.
async fn run_job(service: &ConcallService, request: JobRequest) -> Result<JobState, AppError> {
    let job_id = service.start_job(request)?;
    let mut events = service.subscribe(&job_id)?;

    loop {
        tokio::select! {
            event = events.next() => match event {
                Some(JobEvent::Complete { state, stats, .. }) => {
                    tracing::info!(
                        "Finished ({}): {} downloaded, {} skipped, {} failed, {:.1}% success",
                        state, stats.downloaded, stats.skipped, stats.failed, stats.success_rate()
                    );
                    return job_outcome(&job_id, state);
                }
                Some(event) => tracing::debug!("[{}] {}", event.code(), event.message()),
                None => return job_outcome(&job_id, service.wait(&job_id).await?),
            },
            _ = tokio::signal::ctrl_c() => {
                let ack = service.cancel_job(&job_id)?;
                tracing::warn!("Interrupted, stopping job {} (was {})", ack.job_id, ack.state);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unclassified_links_are_opt_in() {
        let defaults = requested_types(Vec::new());
        assert_eq!(defaults.len(), 3);
        assert!(!defaults.contains(&DocumentType::Unclassified));

        let explicit = requested_types(vec![DocumentType::Unclassified]);
        assert_eq!(explicit, BTreeSet::from([DocumentType::Unclassified]));
    }

    #[test]
    fn failed_jobs_are_reported_as_job_failures() {
        let err = job_outcome("job-1", JobState::Failed).unwrap_err();
        assert!(matches!(err, AppError::JobFailed(ref id) if id == "job-1"));
        assert_eq!(err.to_string(), "Job job-1 failed");
        assert_eq!(job_outcome("job-1", JobState::Stopped).unwrap(), JobState::Stopped);
    }
}
