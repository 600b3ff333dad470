// src/orchestrator/progress.rs
//! In-process publish/subscribe for job events.
//!
//! The runner publishes; any number of front ends subscribe. The terminal
//! `Complete` event is retained so a subscriber that arrives after the job
//! has finished still sees exactly one `Complete` before its stream ends.

use crate::orchestrator::job::{DownloadResult, JobState, JobStats};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

pub const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEvent {
    Progress {
        job_id: String,
        code: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        symbol: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<DownloadResult>,
    },
    Stats {
        job_id: String,
        code: String,
        message: String,
        stats: JobStats,
    },
    Error {
        job_id: String,
        code: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        symbol: Option<String>,
    },
    Complete {
        job_id: String,
        code: String,
        message: String,
        state: JobState,
        stats: JobStats,
    },
}

impl JobEvent {
    pub fn job_id(&self) -> &str {
        match self {
            JobEvent::Progress { job_id, .. }
            | JobEvent::Stats { job_id, .. }
            | JobEvent::Error { job_id, .. }
            | JobEvent::Complete { job_id, .. } => job_id,
        }
    }

    pub fn code(&self) -> &str {
        match self {
            JobEvent::Progress { code, .. }
            | JobEvent::Stats { code, .. }
            | JobEvent::Error { code, .. }
            | JobEvent::Complete { code, .. } => code,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            JobEvent::Progress { message, .. }
            | JobEvent::Stats { message, .. }
            | JobEvent::Error { message, .. }
            | JobEvent::Complete { message, .. } => message,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobEvent::Complete { .. })
    }
}

/// Cloneable handle; all clones share the same subscribers.
#[derive(Debug, Clone)]
pub struct ProgressChannel {
    sender: broadcast::Sender<JobEvent>,
    terminal: Arc<Mutex<Option<JobEvent>>>,
}

impl Default for ProgressChannel {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl ProgressChannel {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            terminal: Arc::new(Mutex::new(None)),
        }
    }

    /// Delivers `event` to current subscribers. Nothing is delivered after
    /// the first `Complete`.
    pub fn publish(&self, event: JobEvent) {
        let mut terminal = self.terminal.lock().unwrap_or_else(|p| p.into_inner());
        if terminal.is_some() {
            tracing::warn!("Dropping {} event published after completion", event.code());
            return;
        }
        if event.is_terminal() {
            *terminal = Some(event.clone());
        }
        // No receivers is fine; late subscribers only need the terminal event.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> JobSubscription {
        // Holding the lock orders this against a concurrent terminal publish.
        let terminal = self.terminal.lock().unwrap_or_else(|p| p.into_inner());
        JobSubscription {
            receiver: self.sender.subscribe(),
            pending_terminal: terminal.clone(),
            finished: false,
        }
    }

    /// A one-slot channel that only replays `event`, for jobs that are over.
    pub fn finished(event: JobEvent) -> Self {
        let (sender, _) = broadcast::channel(1);
        Self {
            sender,
            terminal: Arc::new(Mutex::new(Some(event))),
        }
    }

    pub fn terminal_event(&self) -> Option<JobEvent> {
        self.terminal.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn is_finished(&self) -> bool {
        self.terminal_event().is_some()
    }
}

pub struct JobSubscription {
    receiver: broadcast::Receiver<JobEvent>,
    pending_terminal: Option<JobEvent>,
    finished: bool,
}

impl JobSubscription {
    /// Next event, or `None` once the terminal event has been yielded.
    pub async fn next(&mut self) -> Option<JobEvent> {
        if self.finished {
            return None;
        }
        if let Some(event) = self.pending_terminal.take() {
            self.finished = true;
            return Some(event);
        }

        loop {
            match self.receiver.recv().await {
                Ok(event) => {
                    if event.is_terminal() {
                        self.finished = true;
                    }
                    return Some(event);
                }
                Err(RecvError::Lagged(missed)) => {
                    tracing::warn!("Subscriber lagged, skipped {} events", missed);
                }
                Err(RecvError::Closed) => {
                    self.finished = true;
                    return None;
                }
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = JobEvent> {
        futures::stream::unfold(self, |mut subscription| async move {
            subscription.next().await.map(|event| (event, subscription))
        })
    }
}
