// src/orchestrator/runner.rs
use crate::config::ScraperConfig;
use crate::extractors::classifier::{classify, ClassifiedDocument};
use crate::extractors::naming::{NameRegistry, NamedArtifact};
use crate::orchestrator::job::{DownloadOutcome, DownloadResult, JobState, JobStats, ScrapeJob, SkipReason};
use crate::orchestrator::progress::{JobEvent, ProgressChannel};
use crate::source::client::SiteClient;
use crate::source::collector::DocumentCollector;
use crate::source::models::{RawDocumentEntry, Section};
use crate::source::resolver::CompanyResolver;
use crate::storage::StorageManager;
use crate::utils::error::{FetchError, ResolveError, StorageError};
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;

/// Handle to a job running on the tokio runtime.
pub struct JobRun {
    pub job_id: String,
    /// Every [`DownloadResult`], in symbol order and `source_index` order
    /// within a symbol. Ends when the job does.
    pub results: UnboundedReceiverStream<DownloadResult>,
    pub state: watch::Receiver<JobState>,
    /// Resolves to the terminal state.
    pub handle: JoinHandle<JobState>,
}

/// Drives resolve, collect, classify, name and fetch for each symbol of a job.
#[derive(Debug, Clone)]
pub struct Orchestrator {
    config: ScraperConfig,
    resolver: Arc<CompanyResolver>,
    collector: DocumentCollector,
}

impl Orchestrator {
    pub fn new(config: ScraperConfig) -> Self {
        Self::with_resolver(config, Arc::new(CompanyResolver::new()))
    }

    /// Shares a resolver (and its cache) with other callers.
    pub fn with_resolver(config: ScraperConfig, resolver: Arc<CompanyResolver>) -> Self {
        let collector = DocumentCollector::new(config.max_archive_pages);
        Self {
            config,
            resolver,
            collector,
        }
    }

    /// Spawns `job`. Cancelling `cancel` stops new fetches; fetches already
    /// in flight finish and are reported before the job ends `Stopped`.
    pub fn run(&self, job: ScrapeJob, cancel: CancellationToken, progress: ProgressChannel) -> JobRun {
        let job_id = job.id.clone();
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(job.state());

        let driver = JobDriver {
            reporter: Reporter {
                job_id: job_id.clone(),
                progress,
                results: results_tx,
                stats: JobStats {
                    total_companies: job.symbols.len(),
                    ..JobStats::default()
                },
            },
            config: self.config.clone(),
            resolver: Arc::clone(&self.resolver),
            collector: self.collector.clone(),
            halt: cancel.child_token(),
            cancel,
            state_tx,
            job,
        };

        JobRun {
            job_id,
            results: UnboundedReceiverStream::new(results_rx),
            state: state_rx,
            handle: tokio::spawn(driver.drive()),
        }
    }
}

/// What happens to one named document.
#[derive(Debug, Clone, PartialEq)]
enum Planned {
    Fetch(NamedArtifact),
    Skip(NamedArtifact, SkipReason),
}

impl Planned {
    fn source_index(&self) -> usize {
        match self {
            Planned::Fetch(a) | Planned::Skip(a, _) => a.classified.source_index,
        }
    }
}

/// Keeps the first `limit` entries of each section, in listing order.
fn apply_recent_limit(entries: Vec<RawDocumentEntry>, limit: Option<usize>) -> Vec<RawDocumentEntry> {
    let Some(limit) = limit else {
        return entries;
    };
    let mut seen: HashMap<Section, usize> = HashMap::new();
    entries
        .into_iter()
        .filter(|entry| {
            let count = seen.entry(entry.section).or_insert(0);
            *count += 1;
            *count <= limit
        })
        .collect()
}

/// Classifies and names every entry. Excluded documents are named in a
/// separate namespace so they never push a suffix onto a requested one.
fn plan_documents(job: &ScrapeJob, symbol: &str, entries: &[RawDocumentEntry]) -> Vec<Planned> {
    let mut requested = NameRegistry::new();
    let mut excluded = NameRegistry::new();

    let mut classified: Vec<ClassifiedDocument> = entries.iter().map(|e| classify(symbol, e)).collect();
    classified.sort_by_key(|doc| doc.source_index);

    classified
        .into_iter()
        .map(|doc| {
            if !job.wants(doc.doc_type) {
                Planned::Skip(excluded.assign(symbol, doc), SkipReason::TypeNotRequested)
            } else if !job.download_enabled {
                Planned::Skip(requested.assign(symbol, doc), SkipReason::DownloadDisabled)
            } else {
                Planned::Fetch(requested.assign(symbol, doc))
            }
        })
        .collect()
}

/// Publishes events and keeps the stats for one job.
struct Reporter {
    job_id: String,
    progress: ProgressChannel,
    results: mpsc::UnboundedSender<DownloadResult>,
    stats: JobStats,
}

impl Reporter {
    fn progress(&self, symbol: &str, code: &str, message: String) {
        tracing::info!("[{}] {}", symbol, message);
        self.progress.publish(JobEvent::Progress {
            job_id: self.job_id.clone(),
            code: code.to_string(),
            message,
            symbol: Some(symbol.to_string()),
            result: None,
        });
    }

    fn error(&self, symbol: Option<&str>, code: &str, message: String) {
        tracing::error!("[{}] {}", symbol.unwrap_or("job"), message);
        self.progress.publish(JobEvent::Error {
            job_id: self.job_id.clone(),
            code: code.to_string(),
            message,
            symbol: symbol.map(str::to_string),
        });
    }

    fn result(&mut self, symbol: &str, result: DownloadResult) {
        self.stats.record(&result);
        let message = result.message();
        match &result.outcome {
            DownloadOutcome::Failed { .. } => tracing::warn!("[{}] {}", symbol, message),
            _ => tracing::info!("[{}] {}", symbol, message),
        }
        self.progress.publish(JobEvent::Progress {
            job_id: self.job_id.clone(),
            code: result.outcome.code().to_string(),
            message,
            symbol: Some(symbol.to_string()),
            result: Some(result.clone()),
        });
        // The caller may have dropped the result stream and only watch events.
        let _ = self.results.send(result);
    }

    fn stats(&self) {
        let stats = &self.stats;
        self.progress.publish(JobEvent::Stats {
            job_id: self.job_id.clone(),
            code: "stats".to_string(),
            message: format!(
                "{}/{} companies, {} downloaded, {} skipped, {} failed ({}% success)",
                stats.companies_processed,
                stats.total_companies,
                stats.downloaded,
                stats.skipped,
                stats.failed,
                stats.success_rate()
            ),
            stats: stats.clone(),
        });
    }

    fn complete(&self, state: JobState) {
        let message = format!(
            "Job {} {}: {} downloaded, {} skipped, {} failed, {} bytes",
            self.job_id, state, self.stats.downloaded, self.stats.skipped, self.stats.failed, self.stats.bytes_written
        );
        tracing::info!("{}", message);
        self.progress.publish(JobEvent::Complete {
            job_id: self.job_id.clone(),
            code: state.as_str().to_string(),
            message,
            state,
            stats: self.stats.clone(),
        });
    }
}

/// Fetch side of a job: the shared client and the output directory.
struct Fetcher {
    client: SiteClient,
    storage: StorageManager,
}

impl Fetcher {
    /// `Ok(None)` when cancellation overtook the fetch before it was sent.
    async fn execute(&self, planned: Planned) -> Result<Option<DownloadResult>, StorageError> {
        let artifact = match planned {
            Planned::Skip(artifact, reason) => return Ok(Some(DownloadResult::skipped(artifact, reason))),
            Planned::Fetch(artifact) => artifact,
        };

        match self.storage.contains(&artifact.filename).await {
            Ok(true) => return Ok(Some(DownloadResult::skipped(artifact, SkipReason::AlreadyPresent))),
            Ok(false) => {}
            Err(e) => return reject_or_halt(artifact, e),
        }
        if self.client.cancel_token().is_cancelled() {
            return Ok(None);
        }

        match self.client.get_bytes_with_retry(&artifact.classified.source_url).await {
            Ok(bytes) => match self.storage.write_artifact(&artifact.filename, &bytes).await {
                Ok(bytes_written) => Ok(Some(DownloadResult {
                    artifact,
                    outcome: DownloadOutcome::Success,
                    bytes_written,
                })),
                Err(e) => reject_or_halt(artifact, e),
            },
            Err(FetchError::Cancelled) => Ok(None),
            Err(e) => Ok(Some(DownloadResult::failed(artifact, &e))),
        }
    }
}

/// A bad name fails its own document; any other storage error stops the job.
fn reject_or_halt(artifact: NamedArtifact, error: StorageError) -> Result<Option<DownloadResult>, StorageError> {
    match error {
        StorageError::InvalidName(_) => {
            tracing::warn!("Not storing {}: {}", artifact.classified.source_url, error);
            Ok(Some(DownloadResult::rejected(artifact, &error)))
        }
        other => Err(other),
    }
}

enum SymbolOutcome {
    Resolved,
    Unresolved,
    Halted,
}

struct JobDriver {
    job: ScrapeJob,
    config: ScraperConfig,
    resolver: Arc<CompanyResolver>,
    collector: DocumentCollector,
    /// User cancellation.
    cancel: CancellationToken,
    /// Child of `cancel`, also fired on a fatal error; handed to the client.
    halt: CancellationToken,
    state_tx: watch::Sender<JobState>,
    reporter: Reporter,
}

impl JobDriver {
    async fn drive(mut self) -> JobState {
        self.set_state(JobState::Running);
        tracing::info!(
            "Job {} started: {} symbols, types {:?}, delay {:?}",
            self.job.id,
            self.job.symbols.len(),
            self.job.requested_types,
            self.job.delay()
        );

        let fetcher = match self.fetcher() {
            Ok(fetcher) => fetcher,
            Err((code, message)) => {
                self.reporter.error(None, code, message);
                return self.finish(JobState::Failed);
            }
        };

        let mut resolved_any = false;
        let symbols = self.job.symbols.clone();
        for symbol in &symbols {
            if self.cancel.is_cancelled() {
                tracing::info!("Job {} cancelled before {}", self.job.id, symbol);
                break;
            }
            self.set_state(JobState::Running);

            match self.process_symbol(&fetcher, symbol).await {
                Ok(SymbolOutcome::Resolved) => resolved_any = true,
                Ok(SymbolOutcome::Unresolved) => {}
                Ok(SymbolOutcome::Halted) => break,
                Err(e) => {
                    self.halt.cancel();
                    self.reporter.error(Some(symbol), "filesystem", format!("Storage failure: {}", e));
                    return self.finish(JobState::Failed);
                }
            }

            self.reporter.stats.companies_processed += 1;
            self.reporter.stats();
        }

        let state = if self.cancel.is_cancelled() {
            JobState::Stopped
        } else if !resolved_any {
            self.reporter.error(None, "resolve_failed", "No symbol could be resolved".to_string());
            JobState::Failed
        } else {
            JobState::Completed
        };
        self.finish(state)
    }

    fn fetcher(&self) -> Result<Fetcher, (&'static str, String)> {
        let storage = StorageManager::new(&self.job.output_dir).map_err(|e| {
            (
                "filesystem",
                format!("Cannot use output directory {}: {}", self.job.output_dir.display(), e),
            )
        })?;
        let client = SiteClient::new(&self.config, self.job.delay(), self.halt.clone())
            .map_err(|e| ("invalid_config", format!("Cannot create HTTP client: {}", e)))?;
        Ok(Fetcher { client, storage })
    }

    async fn process_symbol(&mut self, fetcher: &Fetcher, symbol: &str) -> Result<SymbolOutcome, StorageError> {
        self.reporter.progress(symbol, "symbol_started", format!("Processing {}", symbol));

        let company = match self.resolver.resolve(&fetcher.client, symbol).await {
            Ok(company) => company,
            Err(_) if self.halt.is_cancelled() => return Ok(SymbolOutcome::Halted),
            Err(e) => {
                let code = match e {
                    ResolveError::NotFound(_) => "not_found",
                    _ => "resolve_failed",
                };
                self.reporter.error(Some(symbol), code, e.to_string());
                return Ok(SymbolOutcome::Unresolved);
            }
        };
        self.reporter.progress(
            symbol,
            "resolved",
            format!("Resolved {} to {} ({})", symbol, company.canonical_name, company.symbol),
        );

        let collection = match self
            .collector
            .collect(&fetcher.client, &company, &self.job.sections())
            .await
        {
            Ok(collection) => collection,
            Err(_) if self.halt.is_cancelled() => return Ok(SymbolOutcome::Halted),
            Err(e) => {
                self.reporter.error(
                    Some(symbol),
                    "collect_failed",
                    format!("Could not load documents for {}: {}", company.symbol, e),
                );
                return Ok(SymbolOutcome::Resolved);
            }
        };

        if let Some(gap) = &collection.gap {
            self.reporter.progress(
                symbol,
                "partial_collection",
                format!(
                    "Archive page {} ({}) failed: {}; keeping {} documents from earlier pages",
                    gap.page,
                    gap.url,
                    gap.error,
                    collection.entries.len()
                ),
            );
        }

        let entries = apply_recent_limit(collection.entries, self.job.recent_limit);
        let plan = plan_documents(&self.job, &company.symbol, &entries);
        self.reporter.progress(
            symbol,
            "collected",
            format!("Found {} documents for {}", plan.len(), company.symbol),
        );
        debug_assert!(plan.windows(2).all(|w| w[0].source_index() < w[1].source_index()));

        let workers = self.config.workers.max(1);
        let mut pending = std::pin::pin!(stream::iter(plan)
            .map(|planned| fetcher.execute(planned))
            .buffered(workers));

        while let Some(outcome) = pending.next().await {
            match outcome {
                Ok(Some(result)) => self.reporter.result(&company.symbol, result),
                Ok(None) => {}
                Err(e) => return Err(e),
            }
        }

        Ok(SymbolOutcome::Resolved)
    }

    fn set_state(&mut self, next: JobState) {
        if let Err(e) = self.job.transition(next) {
            tracing::error!("Job {}: {}", self.job.id, e);
            return;
        }
        // Nobody watching is fine.
        let _ = self.state_tx.send(next);
    }

    /// `Complete` is retained before the watch turns terminal.
    fn finish(mut self, state: JobState) -> JobState {
        self.reporter.complete(state);
        self.set_state(state);
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extractors::classifier::DocumentType;
    use std::collections::BTreeSet;
    use std::time::Duration;
    use tempfile::tempdir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const IDEA_PROFILE: &str = r#"
        <html><body>
        <h1>Vodafone Idea Ltd</h1>
        <div class="documents concalls">
          <ul class="list-links">
            <li>
              <div class="nowrap">Jun 2025</div>
              <a class="concall-link" href="/docs/idea-jun25-transcript.pdf">Transcript</a>
              <a class="concall-link" href="/docs/idea-jun25-ppt.pdf">PPT</a>
            </li>
            <li>
              <div class="nowrap">Feb 2025</div>
              <a class="concall-link" href="/docs/idea-feb25-transcript.pdf">Transcript</a>
            </li>
          </ul>
        </div>
        <div class="documents annual-reports">
          <ul class="list-links">
            <li><a href="/docs/idea-ar-2024.pdf">Financial Year 2024<div>from bse</div></a></li>
          </ul>
        </div>
        </body></html>
    "#;

    const ALL_FILES: [&str; 4] = [
        "IDEA_Jun-2025_transcript.pdf",
        "IDEA_Jun-2025_presentation.pdf",
        "IDEA_Feb-2025_transcript.pdf",
        "IDEA_FY2024_annual_report.pdf",
    ];

    async fn mount_get(server: &MockServer, at: &str, response: ResponseTemplate) {
        Mock::given(method("GET"))
            .and(path(at))
            .respond_with(response)
            .mount(server)
            .await;
    }

    async fn idea_server() -> MockServer {
        let server = MockServer::start().await;
        mount_get(&server, "/company/IDEA/", ResponseTemplate::new(200).set_body_string(IDEA_PROFILE)).await;
        for doc in ["idea-jun25-transcript", "idea-jun25-ppt", "idea-feb25-transcript", "idea-ar-2024"] {
            mount_get(
                &server,
                &format!("/docs/{}.pdf", doc),
                ResponseTemplate::new(200).set_body_bytes(format!("%PDF {}", doc).into_bytes()),
            )
            .await;
        }
        server
    }

    fn orchestrator(server: &MockServer) -> Orchestrator {
        Orchestrator::new(ScraperConfig {
            base_url: server.uri(),
            ..ScraperConfig::default()
        })
    }

    fn job(symbols: &[&str], types: &[DocumentType], dir: &std::path::Path) -> ScrapeJob {
        ScrapeJob::new(
            symbols.iter().map(|s| s.to_string()).collect(),
            types.iter().copied().collect(),
            1.0,
            true,
            dir,
        )
        .unwrap()
        .with_delay(Duration::from_millis(5))
    }

    async fn run_to_end(
        orchestrator: &Orchestrator,
        job: ScrapeJob,
        cancel: CancellationToken,
    ) -> (JobState, Vec<DownloadResult>, Vec<JobEvent>) {
        let progress = ProgressChannel::default();
        let subscription = progress.subscribe();
        let run = orchestrator.run(job, cancel, progress);
        let results: Vec<DownloadResult> = run.results.collect().await;
        let state = run.handle.await.unwrap();
        let events: Vec<JobEvent> = subscription.into_stream().collect().await;
        (state, results, events)
    }

    fn filenames(results: &[DownloadResult]) -> Vec<&str> {
        results.iter().map(|r| r.artifact.filename.as_str()).collect()
    }

    #[tokio::test]
    async fn downloads_in_listing_order() {
        let server = idea_server().await;
        let dir = tempdir().unwrap();

        let (state, results, events) =
            run_to_end(&orchestrator(&server), job(&["IDEA"], &[], dir.path()), CancellationToken::new()).await;

        assert_eq!(state, JobState::Completed);
        assert_eq!(filenames(&results), ALL_FILES.to_vec());
        assert!(results.iter().all(|r| r.outcome == DownloadOutcome::Success));
        for name in ALL_FILES {
            assert!(dir.path().join(name).is_file(), "{name} missing");
        }
        let bytes = std::fs::read(dir.path().join("IDEA_FY2024_annual_report.pdf")).unwrap();
        assert_eq!(bytes, b"%PDF idea-ar-2024");

        let terminal: Vec<&JobEvent> = events.iter().filter(|e| e.is_terminal()).collect();
        assert_eq!(terminal.len(), 1);
        match terminal[0] {
            JobEvent::Complete { state, stats, .. } => {
                assert_eq!(*state, JobState::Completed);
                assert_eq!(stats.downloaded, 4);
                assert_eq!(stats.companies_processed, 1);
            }
            other => panic!("unexpected terminal event {:?}", other),
        }
        assert!(events.iter().any(|e| matches!(e, JobEvent::Stats { .. })));
    }

    #[tokio::test]
    async fn second_run_skips_everything() {
        let server = idea_server().await;
        let dir = tempdir().unwrap();
        let orchestrator = orchestrator(&server);

        run_to_end(&orchestrator, job(&["IDEA"], &[], dir.path()), CancellationToken::new()).await;
        let (state, results, _) =
            run_to_end(&orchestrator, job(&["IDEA"], &[], dir.path()), CancellationToken::new()).await;

        assert_eq!(state, JobState::Completed);
        assert_eq!(results.len(), 4);
        assert!(results
            .iter()
            .all(|r| r.outcome == DownloadOutcome::Skipped(SkipReason::AlreadyPresent)));
    }

    #[tokio::test]
    async fn excluded_types_are_skipped_without_fetching() {
        let server = MockServer::start().await;
        mount_get(&server, "/company/IDEA/", ResponseTemplate::new(200).set_body_string(IDEA_PROFILE)).await;
        Mock::given(method("GET"))
            .and(path("/docs/idea-jun25-transcript.pdf"))
            .respond_with(ResponseTemplate::new(200).set_body_string("t1"))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/docs/idea-feb25-transcript.pdf"))
            .respond_with(ResponseTemplate::new(200).set_body_string("t2"))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/docs/idea-jun25-ppt.pdf"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ppt"))
            .expect(0)
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let (state, results, _) = run_to_end(
            &orchestrator(&server),
            job(&["IDEA"], &[DocumentType::Transcript], dir.path()),
            CancellationToken::new(),
        )
        .await;

        assert_eq!(state, JobState::Completed);
        // The annual-report section is never crawled for a transcript-only job.
        let codes: Vec<&str> = results.iter().map(|r| r.outcome.code()).collect();
        assert_eq!(codes, vec!["success", "skipped_type", "success"]);
        assert!(!dir.path().join("IDEA_Jun-2025_presentation.pdf").exists());
    }

    #[tokio::test]
    async fn client_errors_fail_once_server_errors_retry() {
        let server = MockServer::start().await;
        mount_get(&server, "/company/IDEA/", ResponseTemplate::new(200).set_body_string(IDEA_PROFILE)).await;
        Mock::given(method("GET"))
            .and(path("/docs/idea-jun25-transcript.pdf"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/docs/idea-jun25-ppt.pdf"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;
        mount_get(&server, "/docs/idea-feb25-transcript.pdf", ResponseTemplate::new(200).set_body_string("ok")).await;
        mount_get(&server, "/docs/idea-ar-2024.pdf", ResponseTemplate::new(200).set_body_string("ok")).await;

        let dir = tempdir().unwrap();
        let (state, results, _) =
            run_to_end(&orchestrator(&server), job(&["IDEA"], &[], dir.path()), CancellationToken::new()).await;

        assert_eq!(state, JobState::Completed);
        let codes: Vec<&str> = results.iter().map(|r| r.outcome.code()).collect();
        assert_eq!(codes, vec!["failed_request", "failed_transient", "success", "success"]);
        assert!(!dir.path().join("IDEA_Jun-2025_transcript.pdf").exists());
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".part"))
            .collect();
        assert!(leftovers.is_empty());
    }

    const ARCHIVED_PROFILE: &str = r#"
        <html><body>
        <h1>Vodafone Idea Ltd</h1>
        <div class="documents annual-reports">
          <ul class="list-links">
            <li><a href="/docs/idea-ar-2024.pdf">Financial Year 2024<div>from bse</div></a></li>
            <li><a href="/docs/idea-ar-2023.pdf">Financial Year 2023<div>from bse</div></a></li>
          </ul>
          <a rel="next" href="/company/IDEA/annual-reports/2/">Older</a>
        </div>
        </body></html>
    "#;

    async fn archived_server(archive_page: ResponseTemplate) -> MockServer {
        let server = MockServer::start().await;
        mount_get(&server, "/company/IDEA/", ResponseTemplate::new(200).set_body_string(ARCHIVED_PROFILE)).await;
        mount_get(&server, "/company/IDEA/annual-reports/2/", archive_page).await;
        for doc in ["idea-ar-2024", "idea-ar-2023"] {
            mount_get(
                &server,
                &format!("/docs/{}.pdf", doc),
                ResponseTemplate::new(200).set_body_string(doc),
            )
            .await;
        }
        server
    }

    #[tokio::test]
    async fn failed_archive_page_is_reported_and_earlier_documents_kept() {
        let server = archived_server(ResponseTemplate::new(500)).await;
        let dir = tempdir().unwrap();

        let (state, results, events) = run_to_end(
            &orchestrator(&server),
            job(&["IDEA"], &[DocumentType::AnnualReport], dir.path()),
            CancellationToken::new(),
        )
        .await;

        assert_eq!(state, JobState::Completed);
        assert_eq!(
            filenames(&results),
            vec!["IDEA_FY2024_annual_report.pdf", "IDEA_FY2023_annual_report.pdf"]
        );
        assert!(results.iter().all(|r| r.outcome == DownloadOutcome::Success));

        let codes: Vec<&str> = events.iter().map(|e| e.code()).collect();
        let partial = codes.iter().position(|c| *c == "partial_collection").expect("partial_collection event");
        let collected = codes.iter().position(|c| *c == "collected").unwrap();
        assert!(partial < collected);
        match &events[partial] {
            JobEvent::Progress { symbol, message, .. } => {
                assert_eq!(symbol.as_deref(), Some("IDEA"));
                assert!(message.contains("annual-reports/2/"), "{message}");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn storage_failure_fails_the_whole_job() {
        let server = archived_server(ResponseTemplate::new(500)).await;
        Mock::given(method("GET"))
            .and(path("/company/LATER/"))
            .respond_with(ResponseTemplate::new(200).set_body_string(ARCHIVED_PROFILE))
            .expect(0)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/company/search/"))
            .respond_with(ResponseTemplate::new(200).set_body_string("[]"))
            .expect(0)
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        // A directory squatting on the target name makes the final rename fail.
        std::fs::create_dir(dir.path().join("IDEA_FY2023_annual_report.pdf")).unwrap();

        let (state, results, events) = run_to_end(
            &orchestrator(&server),
            job(&["IDEA", "LATER"], &[DocumentType::AnnualReport], dir.path()),
            CancellationToken::new(),
        )
        .await;

        assert_eq!(state, JobState::Failed);
        assert_eq!(filenames(&results), vec!["IDEA_FY2024_annual_report.pdf"]);
        assert!(events.iter().any(
            |e| matches!(e, JobEvent::Error { code, symbol, .. } if code == "filesystem" && symbol.as_deref() == Some("IDEA"))
        ));
        let terminal: Vec<&JobEvent> = events.iter().filter(|e| e.is_terminal()).collect();
        assert_eq!(terminal.len(), 1);
        assert!(matches!(terminal[0], JobEvent::Complete { state: JobState::Failed, .. }));
        assert!(dir.path().join("IDEA_FY2023_annual_report.pdf").is_dir());
    }

    #[tokio::test]
    async fn invalid_artifact_name_fails_only_that_document() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("pdf"))
            .expect(0)
            .mount(&server)
            .await;
        let dir = tempdir().unwrap();
        let config = ScraperConfig {
            base_url: server.uri(),
            ..ScraperConfig::default()
        };
        let fetcher = Fetcher {
            client: SiteClient::new(&config, Duration::from_millis(5), CancellationToken::new()).unwrap(),
            storage: StorageManager::new(dir.path()).unwrap(),
        };
        let entry = RawDocumentEntry {
            title: "Transcript".to_string(),
            source_url: format!("{}/docs/t.pdf", server.uri()),
            section: Section::Concall,
            raw_date_text: "Jun 2025".to_string(),
            source_index: 0,
        };
        let artifact = NamedArtifact {
            filename: ".IDEA_Jun-2025_transcript.pdf".to_string(),
            classified: classify("IDEA", &entry),
        };

        let result = fetcher.execute(Planned::Fetch(artifact)).await.unwrap().unwrap();
        assert_eq!(result.outcome.code(), "failed_other");
        assert_eq!(result.bytes_written, 0);
    }

    #[tokio::test]
    async fn unknown_symbol_is_skipped_and_job_continues() {
        let server = idea_server().await;
        Mock::given(method("GET"))
            .and(path("/api/company/search/"))
            .respond_with(ResponseTemplate::new(200).set_body_string("[]"))
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let (state, results, events) = run_to_end(
            &orchestrator(&server),
            job(&["NOPE", "IDEA"], &[DocumentType::AnnualReport], dir.path()),
            CancellationToken::new(),
        )
        .await;

        assert_eq!(state, JobState::Completed);
        assert_eq!(filenames(&results), vec!["IDEA_FY2024_annual_report.pdf"]);
        assert!(events
            .iter()
            .any(|e| matches!(e, JobEvent::Error { code, symbol, .. } if code == "not_found" && symbol.as_deref() == Some("NOPE"))));
    }

    #[tokio::test]
    async fn job_fails_when_no_symbol_resolves() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/company/search/"))
            .respond_with(ResponseTemplate::new(200).set_body_string("[]"))
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let (state, results, events) = run_to_end(
            &orchestrator(&server),
            job(&["NOPE", "NADA"], &[], dir.path()),
            CancellationToken::new(),
        )
        .await;

        assert_eq!(state, JobState::Failed);
        assert!(results.is_empty());
        assert!(matches!(events.last(), Some(JobEvent::Complete { state: JobState::Failed, .. })));
    }

    #[tokio::test]
    async fn download_disabled_lists_without_fetching() {
        let server = MockServer::start().await;
        mount_get(&server, "/company/IDEA/", ResponseTemplate::new(200).set_body_string(IDEA_PROFILE)).await;
        Mock::given(method("GET"))
            .and(path("/docs/idea-ar-2024.pdf"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let mut listing = job(&["IDEA"], &[], dir.path());
        listing.download_enabled = false;
        let (state, results, _) = run_to_end(&orchestrator(&server), listing, CancellationToken::new()).await;

        assert_eq!(state, JobState::Completed);
        assert_eq!(filenames(&results), ALL_FILES.to_vec());
        assert!(results
            .iter()
            .all(|r| r.outcome == DownloadOutcome::Skipped(SkipReason::DownloadDisabled)));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn cancelled_job_stops_without_new_fetches() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let (state, results, events) =
            run_to_end(&orchestrator(&server), job(&["IDEA"], &[], dir.path()), cancel).await;

        assert_eq!(state, JobState::Stopped);
        assert!(results.is_empty());
        assert!(matches!(events.last(), Some(JobEvent::Complete { state: JobState::Stopped, .. })));
    }

    #[tokio::test]
    async fn cancellation_mid_symbol_reports_in_flight_fetch() {
        let server = MockServer::start().await;
        mount_get(&server, "/company/IDEA/", ResponseTemplate::new(200).set_body_string(IDEA_PROFILE)).await;
        mount_get(
            &server,
            "/docs/idea-jun25-transcript.pdf",
            ResponseTemplate::new(200)
                .set_body_string("slow")
                .set_delay(Duration::from_millis(300)),
        )
        .await;
        Mock::given(method("GET"))
            .and(path("/docs/idea-feb25-transcript.pdf"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let cancel = CancellationToken::new();
        let progress = ProgressChannel::default();
        let mut events = progress.subscribe();
        let mut single = ScraperConfig {
            base_url: server.uri(),
            ..ScraperConfig::default()
        };
        single.workers = 1;
        let run = Orchestrator::new(single).run(job(&["IDEA"], &[], dir.path()), cancel.clone(), progress);

        // Cancel once the first document fetch is under way.
        while let Some(event) = events.next().await {
            if event.code() == "collected" {
                tokio::time::sleep(Duration::from_millis(100)).await;
                cancel.cancel();
                break;
            }
        }

        let results: Vec<DownloadResult> = run.results.collect().await;
        assert_eq!(run.handle.await.unwrap(), JobState::Stopped);
        assert_eq!(filenames(&results), vec!["IDEA_Jun-2025_transcript.pdf"]);
        assert_eq!(results[0].outcome, DownloadOutcome::Success);
        assert!(dir.path().join("IDEA_Jun-2025_transcript.pdf").is_file());
    }

    #[test]
    fn recent_limit_applies_per_section() {
        let entry = |i: usize, section| RawDocumentEntry {
            title: format!("doc {}", i),
            source_url: format!("https://x.test/{}.pdf", i),
            section,
            raw_date_text: String::new(),
            source_index: i,
        };
        let entries = vec![
            entry(0, Section::Concall),
            entry(1, Section::Concall),
            entry(2, Section::Concall),
            entry(3, Section::AnnualReport),
            entry(4, Section::AnnualReport),
        ];
        let kept: Vec<usize> = apply_recent_limit(entries.clone(), Some(2))
            .iter()
            .map(|e| e.source_index)
            .collect();
        assert_eq!(kept, vec![0, 1, 3, 4]);
        assert_eq!(apply_recent_limit(entries, None).len(), 5);
    }

    #[test]
    fn excluded_documents_do_not_force_suffixes() {
        let entry = |i: usize, title: &str| RawDocumentEntry {
            title: title.to_string(),
            source_url: format!("https://x.test/{}.pdf", i),
            section: Section::Concall,
            raw_date_text: "Jun 2025".to_string(),
            source_index: i,
        };
        let entries = vec![
            entry(0, "Jun 2025 - REC"),
            entry(1, "Jun 2025 - Notes"),
            entry(2, "Jun 2025 - Transcript"),
            entry(3, "Jun 2025 - Transcript"),
        ];
        let job = job(&["IDEA"], &[DocumentType::Transcript], std::path::Path::new("out"));
        let plan = plan_documents(&job, "IDEA", &entries);

        let names: Vec<&str> = plan
            .iter()
            .map(|p| match p {
                Planned::Fetch(a) | Planned::Skip(a, _) => a.filename.as_str(),
            })
            .collect();
        assert_eq!(
            names,
            vec![
                "IDEA_Jun-2025_unclassified.pdf",
                "IDEA_Jun-2025_unclassified_1.pdf",
                "IDEA_Jun-2025_transcript.pdf",
                "IDEA_Jun-2025_transcript_3.pdf",
            ]
        );
        assert!(matches!(plan[0], Planned::Skip(_, SkipReason::TypeNotRequested)));
        assert!(matches!(plan[2], Planned::Fetch(_)));

        let unique: BTreeSet<&str> = names.iter().copied().collect();
        assert_eq!(unique.len(), names.len());
    }
}
