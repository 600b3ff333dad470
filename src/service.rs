// src/service.rs
//! The call contract shared by every front end: resolve a company, start and
//! watch jobs, and manage the artifacts they leave behind.

use crate::config::ScraperConfig;
use crate::extractors::classifier::DocumentType;
use crate::orchestrator::job::{DownloadOutcome, JobState, ScrapeJob, SkipReason};
use crate::orchestrator::progress::{JobSubscription, ProgressChannel};
use crate::orchestrator::runner::Orchestrator;
use crate::source::client::SiteClient;
use crate::source::models::CompanyIdentity;
use crate::source::resolver::CompanyResolver;
use crate::storage::{ArtifactInfo, StorageManager};
use crate::utils::AppError;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_DELAY_SECONDS: f64 = 2.0;
/// Finished jobs kept for status and listing queries; older ones are dropped.
pub const RETAINED_FINISHED_JOBS: usize = 32;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRequest {
    pub symbols: Vec<String>,
    /// Empty means every type.
    #[serde(default)]
    pub doc_types: BTreeSet<DocumentType>,
    #[serde(default = "default_delay")]
    pub delay_seconds: f64,
    #[serde(default = "default_true")]
    pub download_enabled: bool,
    pub output_dir: PathBuf,
    #[serde(default)]
    pub recent_limit: Option<usize>,
}

fn default_delay() -> f64 {
    DEFAULT_DELAY_SECONDS
}

fn default_true() -> bool {
    true
}

impl JobRequest {
    pub fn new(symbols: Vec<String>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            symbols,
            doc_types: BTreeSet::new(),
            delay_seconds: DEFAULT_DELAY_SECONDS,
            download_enabled: true,
            output_dir: output_dir.into(),
            recent_limit: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CancelAck {
    pub job_id: String,
    /// False when the job had already finished.
    pub accepted: bool,
    pub state: JobState,
}

#[derive(Debug, Clone)]
pub enum ArtifactScope {
    /// Files a job wrote or found already present.
    Job(String),
    Directory(PathBuf),
}

struct JobRecord {
    started: Instant,
    output_dir: PathBuf,
    cancel: CancellationToken,
    progress: ProgressChannel,
    state: watch::Receiver<JobState>,
    artifacts: Arc<Mutex<BTreeSet<String>>>,
    compacted: bool,
}

impl JobRecord {
    fn is_active(&self) -> bool {
        !self.state.borrow().is_terminal()
    }

    /// Swaps the event buffer of a finished job for one holding only `Complete`.
    fn compact(&mut self) {
        if self.is_active() || self.compacted {
            return;
        }
        if let Some(event) = self.progress.terminal_event() {
            self.progress = ProgressChannel::finished(event);
            self.compacted = true;
        }
    }
}

/// Compacts finished records and drops all but the `retain` newest of them.
fn prune_finished(jobs: &mut HashMap<String, JobRecord>, retain: usize) {
    let mut finished: Vec<(Instant, String)> = Vec::new();
    for (id, record) in jobs.iter_mut() {
        record.compact();
        if !record.is_active() {
            finished.push((record.started, id.clone()));
        }
    }
    if finished.len() <= retain {
        return;
    }
    finished.sort();
    let excess = finished.len() - retain;
    for (_, id) in finished.into_iter().take(excess) {
        tracing::debug!("Dropping finished job {}", id);
        jobs.remove(&id);
    }
}

pub struct ConcallService {
    config: ScraperConfig,
    resolver: Arc<CompanyResolver>,
    orchestrator: Orchestrator,
    jobs: Mutex<HashMap<String, JobRecord>>,
    retained_jobs: usize,
    request_spacing: Option<Duration>,
}

impl ConcallService {
    pub fn new(config: ScraperConfig) -> Self {
        let resolver = Arc::new(CompanyResolver::new());
        let orchestrator = Orchestrator::with_resolver(config.clone(), Arc::clone(&resolver));
        Self {
            config,
            resolver,
            orchestrator,
            jobs: Mutex::new(HashMap::new()),
            retained_jobs: RETAINED_FINISHED_JOBS,
            request_spacing: None,
        }
    }

    /// Overrides the per-job request spacing; tests run against a local server.
    #[cfg(test)]
    fn with_request_spacing(mut self, spacing: Duration) -> Self {
        self.request_spacing = Some(spacing);
        self
    }

    pub fn with_retained_jobs(mut self, retain: usize) -> Self {
        self.retained_jobs = retain;
        self
    }

    pub fn config(&self) -> &ScraperConfig {
        &self.config
    }

    pub async fn resolve_company(&self, query: &str) -> Result<CompanyIdentity, AppError> {
        let spacing = self
            .request_spacing
            .unwrap_or_else(|| Duration::from_secs_f64(DEFAULT_DELAY_SECONDS));
        let client = SiteClient::new(&self.config, spacing, CancellationToken::new())?;
        Ok(self.resolver.resolve(&client, query).await?)
    }

    /// Validates and spawns a job; must be called inside a tokio runtime.
    /// Returns the job id.
    pub fn start_job(&self, request: JobRequest) -> Result<String, AppError> {
        let mut jobs = self.jobs.lock().unwrap_or_else(|p| p.into_inner());
        prune_finished(&mut jobs, self.retained_jobs);

        if jobs
            .values()
            .any(|record| record.is_active() && same_dir(&record.output_dir, &request.output_dir))
        {
            return Err(AppError::DirectoryBusy(request.output_dir.display().to_string()));
        }

        let job = ScrapeJob::new(
            request.symbols,
            request.doc_types,
            request.delay_seconds,
            request.download_enabled,
            request.output_dir.clone(),
        )?
        .with_recent_limit(request.recent_limit);
        #[cfg(test)]
        let job = match self.request_spacing {
            Some(spacing) => job.with_delay(spacing),
            None => job,
        };

        let job_id = job.id.clone();
        let cancel = CancellationToken::new();
        let progress = ProgressChannel::default();
        let run = self.orchestrator.run(job, cancel.clone(), progress.clone());

        // Remember which files this job produced or found, for job-scoped listings.
        let artifacts = Arc::new(Mutex::new(BTreeSet::new()));
        let sink = Arc::clone(&artifacts);
        let mut results = run.results;
        tokio::spawn(async move {
            while let Some(result) = results.next().await {
                let keep = matches!(
                    result.outcome,
                    DownloadOutcome::Success | DownloadOutcome::Skipped(SkipReason::AlreadyPresent)
                );
                if keep {
                    sink.lock()
                        .unwrap_or_else(|p| p.into_inner())
                        .insert(result.artifact.filename);
                }
            }
        });

        tracing::info!("Started job {} writing to {}", job_id, request.output_dir.display());
        jobs.insert(
            job_id.clone(),
            JobRecord {
                started: Instant::now(),
                output_dir: request.output_dir,
                cancel,
                progress,
                state: run.state,
                artifacts,
                compacted: false,
            },
        );
        Ok(job_id)
    }

    pub fn subscribe(&self, job_id: &str) -> Result<JobSubscription, AppError> {
        self.with_job(job_id, |record| record.progress.subscribe())
    }

    pub fn cancel_job(&self, job_id: &str) -> Result<CancelAck, AppError> {
        self.with_job(job_id, |record| {
            let state = *record.state.borrow();
            let accepted = !state.is_terminal();
            if accepted {
                tracing::info!("Cancelling job {}", job_id);
                record.cancel.cancel();
            }
            CancelAck {
                job_id: job_id.to_string(),
                accepted,
                state,
            }
        })
    }

    pub fn job_state(&self, job_id: &str) -> Result<JobState, AppError> {
        self.with_job(job_id, |record| *record.state.borrow())
    }

    /// Waits for the job to reach a terminal state.
    pub async fn wait(&self, job_id: &str) -> Result<JobState, AppError> {
        let mut state = self.with_job(job_id, |record| record.state.clone())?;
        let result = state.wait_for(JobState::is_terminal).await.map(|s| *s);
        // A closed channel means the runner is gone; report what it last set.
        Ok(result.unwrap_or_else(|_| *state.borrow()))
    }

    pub fn list_artifacts(&self, scope: ArtifactScope) -> Result<Vec<ArtifactInfo>, AppError> {
        match scope {
            ArtifactScope::Directory(dir) => list_dir(&dir),
            ArtifactScope::Job(job_id) => {
                let (dir, names) = self.with_job(&job_id, |record| {
                    let names = record.artifacts.lock().unwrap_or_else(|p| p.into_inner()).clone();
                    (record.output_dir.clone(), names)
                })?;
                Ok(list_dir(&dir)?
                    .into_iter()
                    .filter(|info| names.contains(&info.filename))
                    .collect())
            }
        }
    }

    /// Removes every file in `dir`, refusing while a job is writing there.
    pub fn clear_artifacts(&self, dir: &Path) -> Result<usize, AppError> {
        let busy = self
            .jobs
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .any(|record| record.is_active() && same_dir(&record.output_dir, dir));
        if busy {
            return Err(AppError::DirectoryBusy(dir.display().to_string()));
        }
        if !dir.exists() {
            return Ok(0);
        }
        Ok(StorageManager::open(dir).clear()?)
    }

    fn with_job<T>(&self, job_id: &str, f: impl FnOnce(&JobRecord) -> T) -> Result<T, AppError> {
        let jobs = self.jobs.lock().unwrap_or_else(|p| p.into_inner());
        jobs.get(job_id)
            .map(f)
            .ok_or_else(|| AppError::JobNotFound(job_id.to_string()))
    }
}

fn list_dir(dir: &Path) -> Result<Vec<ArtifactInfo>, AppError> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    Ok(StorageManager::open(dir).list()?)
}

fn same_dir(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a.components().eq(b.components()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::progress::JobEvent;
    use tempfile::tempdir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const PROFILE: &str = r#"<html><body><h1>Vodafone Idea Ltd</h1>
        <div class="documents annual-reports"><ul class="list-links">
          <li><a href="/docs/ar-2024.pdf">Financial Year 2024<div>from bse</div></a></li>
          <li><a href="/docs/ar-2023.pdf">Financial Year 2023<div>from bse</div></a></li>
        </ul></div></body></html>"#;

    async fn server(profile_delay: Duration) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/company/IDEA/"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(PROFILE)
                    .set_delay(profile_delay),
            )
            .mount(&server)
            .await;
        for name in ["ar-2024", "ar-2023"] {
            Mock::given(method("GET"))
                .and(path(format!("/docs/{}.pdf", name)))
                .respond_with(ResponseTemplate::new(200).set_body_string(name))
                .mount(&server)
                .await;
        }
        server
    }

    fn service(server: &MockServer) -> ConcallService {
        ConcallService::new(ScraperConfig {
            base_url: server.uri(),
            ..ScraperConfig::default()
        })
        .with_request_spacing(Duration::from_millis(5))
    }

    fn request(dir: &Path) -> JobRequest {
        let mut request = JobRequest::new(vec!["IDEA".to_string()], dir);
        request.doc_types = BTreeSet::from([DocumentType::AnnualReport]);
        request
    }

    #[tokio::test]
    async fn resolves_company() {
        let server = server(Duration::ZERO).await;
        let identity = service(&server).resolve_company("idea").await.unwrap();
        assert_eq!(identity.symbol, "IDEA");
        assert_eq!(identity.canonical_name, "Vodafone Idea Ltd");
    }

    #[tokio::test]
    async fn job_runs_to_completion_and_lists_its_files() {
        let server = server(Duration::ZERO).await;
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("unrelated.txt"), b"x").unwrap();
        let service = service(&server);

        let job_id = service.start_job(request(dir.path())).unwrap();
        let subscription = service.subscribe(&job_id).unwrap();
        assert_eq!(service.wait(&job_id).await.unwrap(), JobState::Completed);
        assert_eq!(service.job_state(&job_id).unwrap(), JobState::Completed);

        let events: Vec<JobEvent> = subscription.into_stream().collect().await;
        assert!(matches!(events.last(), Some(JobEvent::Complete { state: JobState::Completed, .. })));

        // The result sink may trail the terminal state by a moment.
        let mut listed = Vec::new();
        for _ in 0..50 {
            listed = service.list_artifacts(ArtifactScope::Job(job_id.clone())).unwrap();
            if listed.len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let names: Vec<&str> = listed.iter().map(|a| a.filename.as_str()).collect();
        assert_eq!(names, vec!["IDEA_FY2023_annual_report.pdf", "IDEA_FY2024_annual_report.pdf"]);

        let everything = service
            .list_artifacts(ArtifactScope::Directory(dir.path().to_path_buf()))
            .unwrap();
        assert_eq!(everything.len(), 3);

        let ack = service.cancel_job(&job_id).unwrap();
        assert!(!ack.accepted);
        assert_eq!(ack.state, JobState::Completed);

        assert_eq!(service.clear_artifacts(dir.path()).unwrap(), 3);
    }

    #[tokio::test]
    async fn finished_jobs_are_compacted_then_dropped() {
        let server = server(Duration::ZERO).await;
        let service = service(&server).with_retained_jobs(1);
        let dirs = [tempdir().unwrap(), tempdir().unwrap(), tempdir().unwrap()];

        let first = service.start_job(request(dirs[0].path())).unwrap();
        assert_eq!(service.wait(&first).await.unwrap(), JobState::Completed);
        let second = service.start_job(request(dirs[1].path())).unwrap();
        assert_eq!(service.wait(&second).await.unwrap(), JobState::Completed);

        {
            let jobs = service.jobs.lock().unwrap();
            let record = jobs.get(&first).unwrap();
            assert!(record.compacted);
            assert!(record.progress.is_finished());
        }

        let third = service.start_job(request(dirs[2].path())).unwrap();
        assert!(matches!(service.job_state(&first), Err(AppError::JobNotFound(_))));
        assert!(service.jobs.lock().unwrap().get(&second).unwrap().compacted);

        let events: Vec<JobEvent> = service.subscribe(&second).unwrap().into_stream().collect().await;
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], JobEvent::Complete { state: JobState::Completed, .. }));

        assert_eq!(service.wait(&third).await.unwrap(), JobState::Completed);
        assert_eq!(service.jobs.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn one_running_job_per_directory() {
        let server = server(Duration::from_millis(300)).await;
        let dir = tempdir().unwrap();
        let other = tempdir().unwrap();
        let service = service(&server);

        let first = service.start_job(request(dir.path())).unwrap();
        let err = service.start_job(request(dir.path())).unwrap_err();
        assert!(matches!(err, AppError::DirectoryBusy(_)));
        assert!(matches!(service.clear_artifacts(dir.path()), Err(AppError::DirectoryBusy(_))));

        let second = service.start_job(request(other.path())).unwrap();
        assert_ne!(first, second);

        let ack = service.cancel_job(&first).unwrap();
        assert!(ack.accepted);
        assert_eq!(service.wait(&first).await.unwrap(), JobState::Stopped);
        assert_eq!(service.wait(&second).await.unwrap(), JobState::Completed);

        // Finished jobs release the directory.
        let third = service.start_job(request(dir.path())).unwrap();
        service.cancel_job(&third).unwrap();
        service.wait(&third).await.unwrap();
    }

    #[tokio::test]
    async fn invalid_requests_are_rejected() {
        let server = server(Duration::ZERO).await;
        let dir = tempdir().unwrap();
        let service = service(&server);

        let mut too_fast = request(dir.path());
        too_fast.delay_seconds = 0.2;
        assert!(matches!(service.start_job(too_fast), Err(AppError::Config(_))));

        let empty = JobRequest::new(vec![], dir.path());
        assert!(matches!(service.start_job(empty), Err(AppError::Config(_))));
    }

    #[tokio::test]
    async fn unknown_jobs_are_reported() {
        let server = server(Duration::ZERO).await;
        let service = service(&server);
        assert!(matches!(service.job_state("nope"), Err(AppError::JobNotFound(_))));
        assert!(matches!(service.cancel_job("nope"), Err(AppError::JobNotFound(_))));
        assert!(service.subscribe("nope").is_err());
    }

    #[test]
    fn job_requests_fill_defaults_from_json() {
        let request: JobRequest =
            serde_json::from_str(r#"{"symbols": ["IDEA"], "output_dir": "downloads"}"#).unwrap();
        assert_eq!(request.delay_seconds, DEFAULT_DELAY_SECONDS);
        assert!(request.download_enabled);
        assert!(request.doc_types.is_empty());
        assert_eq!(request.recent_limit, None);
    }
}
