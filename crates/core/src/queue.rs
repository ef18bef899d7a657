//! Job queue and the sequential worker that drains it.
//! Jobs run one at a time and chunks within a job run in order; the only
//! shared state is the throttle and the cancellation token.

use crate::config::Settings;
use crate::error::{Result, TranslateError};
use crate::events::{BannerKind, EventSink, QueueEvent};
use crate::subtitle::validate::{count_units, validate_document};
use crate::subtitle::{self, CUE_SEPARATOR};
use crate::translate::retry::{RetryEngine, RetryPolicy, Throttle};
use crate::translate::{ChatBackend, PromptContext, Session, SessionClient};
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job {}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Error,
}

/// Where a job's subtitle text comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobSource {
    File(PathBuf),
    Text { name: String, content: String },
}

impl JobSource {
    pub fn name(&self) -> String {
        match self {
            JobSource::File(path) => path.display().to_string(),
            JobSource::Text { name, .. } => name.clone(),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        match self {
            JobSource::File(path) => Some(path),
            JobSource::Text { .. } => None,
        }
    }

    /// Read the source as text, replacing invalid UTF-8.
    pub fn read(&self) -> Result<String> {
        match self {
            JobSource::File(path) => {
                let bytes = std::fs::read(path)?;
                Ok(String::from_utf8_lossy(&bytes).into_owned())
            }
            JobSource::Text { content, .. } => Ok(content.clone()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub current: usize,
    pub total: usize,
}

#[derive(Debug)]
pub struct Job {
    pub id: JobId,
    pub source: JobSource,
    pub status: JobStatus,
    /// Translated text accumulated so far; kept after a failure for inspection.
    pub output: String,
    pub last_error: Option<String>,
    pub progress: Progress,
    session: Option<Session>,
}

impl Job {
    fn new(id: JobId, source: JobSource) -> Self {
        Self {
            id,
            source,
            status: JobStatus::Queued,
            output: String::new(),
            last_error: None,
            progress: Progress::default(),
            session: None,
        }
    }

    pub fn has_session(&self) -> bool {
        self.session.is_some()
    }

    fn reset(&mut self) {
        self.status = JobStatus::Queued;
        self.output.clear();
        self.last_error = None;
        self.progress = Progress::default();
        self.session = None;
    }
}

/// Ordered list of jobs.
#[derive(Debug, Default)]
pub struct Queue {
    jobs: Vec<Job>,
    next_id: u64,
}

impl Queue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, source: JobSource) -> JobId {
        self.next_id += 1;
        let id = JobId(self.next_id);
        self.jobs.push(Job::new(id, source));
        id
    }

    pub fn jobs(&self) -> &[Job] {
        &self.jobs
    }

    pub fn get(&self, id: JobId) -> Option<&Job> {
        self.jobs.iter().find(|j| j.id == id)
    }

    fn get_mut(&mut self, id: JobId) -> Option<&mut Job> {
        self.jobs.iter_mut().find(|j| j.id == id)
    }

    /// Put a finished or failed job back in the queue. Returns whether it
    /// was reset.
    pub fn retry(&mut self, id: JobId) -> bool {
        match self.get_mut(id) {
            Some(job) if matches!(job.status, JobStatus::Completed | JobStatus::Error) => {
                job.reset();
                true
            }
            _ => false,
        }
    }

    /// Requeue every failed job and return how many were reset.
    pub fn retry_failed(&mut self) -> usize {
        let mut count = 0;
        for job in self.jobs.iter_mut().filter(|j| j.status == JobStatus::Error) {
            job.reset();
            count += 1;
        }
        count
    }

    pub fn clear(&mut self) {
        self.jobs.clear();
    }

    pub fn pending_count(&self) -> usize {
        self.jobs
            .iter()
            .filter(|j| j.status == JobStatus::Queued)
            .count()
    }
}

/// Cooperative stop flag checked between chunks and during waits.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Sleep for `duration` unless cancelled first. Returns `false` when the
    /// wait was cut short by cancellation.
    pub async fn sleep(&self, duration: Duration) -> bool {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_cancelled() {
            return false;
        }
        if duration.is_zero() {
            return true;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => !self.is_cancelled(),
            _ = notified => false,
        }
    }
}

/// How a whole run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunOutcome {
    Success,
    Error,
    Stopped,
}

/// Drives queued jobs through the retry engine one after another.
pub struct Orchestrator<B> {
    engine: RetryEngine<B>,
    chunk_size: usize,
    file_delay: Duration,
    context: PromptContext,
    throttle: Throttle,
    events: EventSink,
}

impl<B: ChatBackend> Orchestrator<B> {
    /// Build an orchestrator; fails when the settings carry a bad chunk size.
    pub fn new(backend: B, settings: &Settings, events: EventSink) -> Result<Self> {
        let chunk_size = settings.chunk_size()?;
        let throttle = Throttle::new(Duration::from_millis(settings.chunk_delay_ms));
        let engine = RetryEngine::new(
            SessionClient::new(backend),
            RetryPolicy::from_settings(settings),
            throttle.clone(),
            events.clone(),
        );
        Ok(Self {
            engine,
            chunk_size,
            file_delay: settings.file_delay(),
            context: PromptContext {
                target_language: settings.target_language.clone(),
                glossary: settings.glossary.clone(),
            },
            throttle,
            events,
        })
    }

    /// Shared inter-chunk delay, possibly raised during a run.
    pub fn throttle(&self) -> &Throttle {
        &self.throttle
    }

    pub fn backend(&self) -> &B {
        self.engine.client().backend()
    }

    /// Process every queued job in order until done or cancelled.
    pub async fn run(&self, queue: &mut Queue, cancel: &CancelToken) -> RunOutcome {
        let ids: Vec<JobId> = queue
            .jobs
            .iter()
            .filter(|j| j.status == JobStatus::Queued)
            .map(|j| j.id)
            .collect();
        trace!("run queued={}", ids.len());
        let mut completed = 0;
        let mut failed = 0;
        let mut stopped = false;
        for id in ids {
            if cancel.is_cancelled() {
                stopped = true;
                break;
            }
            let Some(job) = queue.get_mut(id) else {
                continue;
            };
            if job.status != JobStatus::Queued {
                continue;
            }
            match self.process_job(job, cancel).await {
                JobStatus::Completed => completed += 1,
                JobStatus::Error => failed += 1,
                _ => {
                    stopped = true;
                    break;
                }
            }
            if queue.pending_count() > 0 && !cancel.sleep(self.file_delay).await {
                stopped = true;
                break;
            }
        }

        let outcome = if stopped {
            RunOutcome::Stopped
        } else if failed > 0 {
            RunOutcome::Error
        } else {
            RunOutcome::Success
        };
        match outcome {
            RunOutcome::Stopped => self.events.banner(
                BannerKind::Info,
                "Translation stopped. Unfinished files are back in the queue.",
            ),
            RunOutcome::Error => self.events.banner(
                BannerKind::Error,
                format!("{failed} file(s) failed, {completed} completed."),
            ),
            RunOutcome::Success => self.events.banner(
                BannerKind::Success,
                format!("All {completed} file(s) translated."),
            ),
        }
        outcome
    }

    /// Run one job and leave it in its resulting state.
    async fn process_job(&self, job: &mut Job, cancel: &CancelToken) -> JobStatus {
        let name = job.source.name();
        self.set_status(job, JobStatus::Processing);
        self.events.info(format!("Translating {name}"));
        match self.translate_job(job, cancel).await {
            Ok(()) => {
                job.session = None;
                self.set_status(job, JobStatus::Completed);
                self.events.info(format!("Finished {name}"));
            }
            Err(TranslateError::Cancelled) => {
                job.reset();
                self.events.emit(QueueEvent::Status {
                    job: job.id,
                    status: JobStatus::Queued,
                });
                self.events
                    .warn(format!("Stopped {name}; it was returned to the queue"));
            }
            Err(err) => {
                job.session = None;
                job.last_error = Some(err.to_string());
                self.set_status(job, JobStatus::Error);
                self.events.error(format!("{name} failed: {err}"));
            }
        }
        job.status
    }

    async fn translate_job(&self, job: &mut Job, cancel: &CancelToken) -> Result<()> {
        let raw = job.source.read()?;
        if raw.trim().is_empty() {
            return Err(TranslateError::EmptyInput);
        }
        let doc = subtitle::split(&raw);
        if doc.cues.is_empty() {
            debug!("{}: no cues, keeping header only", job.id);
            job.output = subtitle::join(&doc);
            return Ok(());
        }
        let original_units = count_units(&raw);
        let chunks = subtitle::chunk_cues(&doc.cues, self.chunk_size)?;
        let total = chunks.len();
        self.set_progress(job, 0, total);
        if !doc.header.is_empty() {
            job.output.push_str(&doc.header);
            job.output.push_str(CUE_SEPARATOR);
        }
        for chunk in &chunks {
            if cancel.is_cancelled() {
                return Err(TranslateError::Cancelled);
            }
            let text = self
                .engine
                .run_chunk(&mut job.session, job.id, chunk, total, &self.context, cancel)
                .await?;
            job.output.push_str(&text);
            job.output.push_str(CUE_SEPARATOR);
            self.set_progress(job, chunk.index + 1, total);
            if chunk.index + 1 < total && !cancel.sleep(self.throttle.current()).await {
                return Err(TranslateError::Cancelled);
            }
        }
        validate_document(original_units, &job.output)?;
        let trimmed_len = job.output.trim_end().len();
        job.output.truncate(trimmed_len);
        job.output.push('\n');
        Ok(())
    }

    fn set_status(&self, job: &mut Job, status: JobStatus) {
        job.status = status;
        self.events.emit(QueueEvent::Status {
            job: job.id,
            status,
        });
    }

    fn set_progress(&self, job: &mut Job, current: usize, total: usize) {
        job.progress = Progress { current, total };
        self.events.emit(QueueEvent::Progress {
            job: job.id,
            current,
            total,
        });
    }
}
