//! Registry of fire-and-forget download jobs

use std::collections::HashMap;
use std::fmt;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Instant;

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tokio::process::Child;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use super::output::{drain_lines, LineTail, READER_GRACE, STDERR_TAIL_LINES};
use super::progress::{parse_progress_line, Progress};
use crate::protocol::{JobState, JobStatus};

/// Opaque job identifier (UUID v4)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobId(Uuid);

impl JobId {
    pub fn generate() -> Self {
        JobId(Uuid::new_v4())
    }

    /// `None` for anything that is not a UUID; such ids can never be registered
    pub fn parse(raw: &str) -> Option<Self> {
        Uuid::parse_str(raw.trim()).ok().map(JobId)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Process control a job needs from its subprocess
pub trait JobProcess: Send + 'static {
    fn id(&self) -> Option<u32>;
    fn try_wait(&mut self) -> std::io::Result<Option<ExitStatus>>;
    fn start_kill(&mut self) -> std::io::Result<()>;
    fn wait(&mut self) -> BoxFuture<'_, std::io::Result<ExitStatus>>;
}

impl JobProcess for Child {
    fn id(&self) -> Option<u32> {
        Child::id(self)
    }

    fn try_wait(&mut self) -> std::io::Result<Option<ExitStatus>> {
        Child::try_wait(self)
    }

    fn start_kill(&mut self) -> std::io::Result<()> {
        Child::start_kill(self)
    }

    fn wait(&mut self) -> BoxFuture<'_, std::io::Result<ExitStatus>> {
        Box::pin(Child::wait(self))
    }
}

/// One detached yt-dlp subprocess and what has been observed of it
pub struct Job {
    id: JobId,
    video_id: String,
    process: tokio::sync::Mutex<Box<dyn JobProcess>>,
    last_progress: Arc<Mutex<Option<Progress>>>,
    stderr_tail: LineTail,
    readers: Mutex<Vec<JoinHandle<()>>>,
    started: Instant,
}

impl Job {
    /// Take ownership of a spawned child and start draining its output.
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(id: JobId, video_id: impl Into<String>, mut child: Child) -> Self {
        let last_progress = Arc::new(Mutex::new(None));
        let stderr_tail = LineTail::new(STDERR_TAIL_LINES);
        let mut readers = Vec::with_capacity(2);

        if let Some(stdout) = child.stdout.take() {
            let slot = last_progress.clone();
            readers.push(tokio::spawn(drain_lines(stdout, id.to_string(), move |line| {
                debug!("[{}] {}", id, line);
                if let Some(progress) = parse_progress_line(line) {
                    *slot.lock() = Some(progress);
                }
            })));
        }

        if let Some(stderr) = child.stderr.take() {
            let tail = stderr_tail.clone();
            readers.push(tokio::spawn(drain_lines(stderr, id.to_string(), move |line| {
                if line.starts_with("ERROR") {
                    warn!("[{}] {}", id, line);
                } else {
                    debug!("[{}] {}", id, line);
                }
                tail.push(line);
            })));
        }

        Self {
            id,
            video_id: video_id.into(),
            process: tokio::sync::Mutex::new(Box::new(child)),
            last_progress,
            stderr_tail,
            readers: Mutex::new(readers),
            started: Instant::now(),
        }
    }

    /// A job around an arbitrary process handle whose output is not read
    pub fn with_process(id: JobId, video_id: impl Into<String>, process: impl JobProcess) -> Self {
        Self {
            id,
            video_id: video_id.into(),
            process: tokio::sync::Mutex::new(Box::new(process)),
            last_progress: Arc::new(Mutex::new(None)),
            stderr_tail: LineTail::new(STDERR_TAIL_LINES),
            readers: Mutex::new(Vec::new()),
            started: Instant::now(),
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn video_id(&self) -> &str {
        &self.video_id
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.try_lock().ok().and_then(|p| p.id())
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    pub fn last_progress(&self) -> Option<Progress> {
        self.last_progress.lock().clone()
    }

    pub fn stderr_tail(&self) -> String {
        self.stderr_tail.joined()
    }

    /// Non-blocking exit check
    pub async fn try_exit(&self) -> std::io::Result<Option<ExitStatus>> {
        self.process.lock().await.try_wait()
    }

    /// Kill the subprocess and wait until it has fully exited.
    ///
    /// Already-exited subprocesses are not signalled again.
    pub async fn terminate(&self) -> std::io::Result<ExitStatus> {
        let mut process = self.process.lock().await;
        if let Some(status) = process.try_wait()? {
            return Ok(status);
        }
        process.start_kill()?;
        process.wait().await
    }

    /// Let the output readers catch up after exit
    pub async fn settle_output(&self) {
        let readers: Vec<_> = self.readers.lock().drain(..).collect();
        for reader in readers {
            if tokio::time::timeout(READER_GRACE, reader).await.is_err() {
                debug!("[{}] output reader still busy after exit", self.id);
            }
        }
    }

    /// Snapshot for a status poll
    pub fn status(&self, state: JobState, exit: Option<ExitStatus>) -> JobStatus {
        let progress = self.last_progress();
        let message = match state {
            JobState::Running => None,
            JobState::Finished => Some("Download complete".to_string()),
            JobState::Failed => {
                let tail = self.stderr_tail();
                Some(if tail.is_empty() {
                    "Download failed".to_string()
                } else {
                    format!("Download failed: {}", tail)
                })
            }
        };

        JobStatus {
            job_id: self.id.to_string(),
            video_id: self.video_id.clone(),
            state,
            percent: progress.as_ref().map(|p| p.percent),
            size_str: progress.map(|p| p.size_str),
            exit_code: exit.and_then(|s| s.code()),
            message,
            elapsed_ms: self.elapsed_ms(),
        }
    }
}

/// Process-wide map from job id to its subprocess.
///
/// The lock is only held for map operations, never across an await.
#[derive(Default)]
pub struct JobRegistry {
    jobs: Mutex<HashMap<JobId, Arc<Job>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a job. An id that is already present keeps its existing job and
    /// the insert is reported as rejected.
    pub fn register(&self, id: JobId, job: Arc<Job>) -> bool {
        let mut jobs = self.jobs.lock();
        if jobs.contains_key(&id) {
            warn!("Job id collision for {}, keeping the registered job", id);
            return false;
        }
        jobs.insert(id, job);
        true
    }

    pub fn lookup(&self, id: &JobId) -> Option<Arc<Job>> {
        self.jobs.lock().get(id).cloned()
    }

    pub fn remove(&self, id: &JobId) -> Option<Arc<Job>> {
        self.jobs.lock().remove(id)
    }

    pub fn contains(&self, id: &JobId) -> bool {
        self.jobs.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.lock().is_empty()
    }

    /// Remove and return every job (used on shutdown)
    pub fn drain(&self) -> Vec<Arc<Job>> {
        self.jobs.lock().drain().map(|(_, job)| job).collect()
    }
}
