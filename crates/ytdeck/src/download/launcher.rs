//! Starting downloads: detached jobs and request-scoped progress streams

use std::path::Path;
use std::pin::Pin;
use std::process::ExitStatus;
use std::str::FromStr;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::Stream;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Child;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::engine::{watch_url, Engine};
use super::output::{drain_lines, LineTail, READER_GRACE, STDERR_TAIL_LINES};
use super::progress::parse_progress_line;
use super::registry::{Job, JobId, JobRegistry};
use crate::error::{AppError, AppResult};
use crate::protocol::ProgressEvent;

/// Progress events buffered between the engine reader and the response
const EVENT_BUFFER: usize = 32;

/// Quality selector accepted by the streaming endpoint
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Quality {
    P1080,
    P720,
    /// Audio only, transcoded to mp3
    Mp3,
    #[default]
    Best,
}

impl Quality {
    /// yt-dlp `-f` expression
    pub fn format_selector(self) -> &'static str {
        match self {
            Quality::P1080 => "bestvideo[height<=1080][ext=mp4]+bestaudio[ext=m4a]/best[ext=mp4]/best",
            Quality::P720 => "bestvideo[height<=720][ext=mp4]+bestaudio[ext=m4a]/best[ext=mp4]/best",
            Quality::Mp3 => "bestaudio/best",
            Quality::Best => "best",
        }
    }

    /// Post-processing arguments
    pub fn extra_args(self) -> &'static [&'static str] {
        match self {
            Quality::Mp3 => &["-x", "--audio-format", "mp3"],
            _ => &[],
        }
    }

    /// Absent means [`Quality::Best`]
    pub fn parse_optional(raw: Option<&str>) -> AppResult<Self> {
        match raw.map(str::trim).filter(|s| !s.is_empty()) {
            Some(s) => s.parse(),
            None => Ok(Quality::Best),
        }
    }
}

impl FromStr for Quality {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "1080p" => Ok(Quality::P1080),
            "720p" => Ok(Quality::P720),
            "mp3" => Ok(Quality::Mp3),
            "best" => Ok(Quality::Best),
            other => Err(AppError::input(format!(
                "Unsupported quality '{}' (expected 1080p, 720p, mp3 or best)",
                other
            ))),
        }
    }
}

/// Check a video identifier from a request body or query string
pub fn validate_video_id(raw: Option<&str>) -> AppResult<&str> {
    let id = raw
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| AppError::input("Video ID is required."))?;

    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(AppError::input(format!("Invalid video ID: {}", id)));
    }
    Ok(id)
}

/// `<dir>/%(title)s - %(id)s.%(ext)s`
pub fn output_template(download_dir: &Path) -> String {
    download_dir
        .join("%(title)s - %(id)s.%(ext)s")
        .to_string_lossy()
        .to_string()
}

/// Arguments for a detached best-quality download merged into mp4
pub fn detached_args(download_dir: &Path, video_id: &str) -> Vec<String> {
    vec![
        "-f".to_string(),
        "bestvideo+bestaudio/best".to_string(),
        "--merge-output-format".to_string(),
        "mp4".to_string(),
        "--newline".to_string(),
        "-o".to_string(),
        output_template(download_dir),
        watch_url(video_id),
    ]
}

/// Arguments for a streamed download at the given quality
pub fn stream_args(download_dir: &Path, video_id: &str, quality: Quality) -> Vec<String> {
    let mut args = vec![
        "--progress".to_string(),
        "--newline".to_string(),
        "-f".to_string(),
        quality.format_selector().to_string(),
        "-o".to_string(),
        output_template(download_dir),
    ];
    args.extend(quality.extra_args().iter().map(|a| a.to_string()));
    args.push(watch_url(video_id));
    args
}

async fn ensure_dir(download_dir: &Path) -> AppResult<()> {
    tokio::fs::create_dir_all(download_dir).await.map_err(|e| {
        AppError::engine(format!(
            "Cannot create directory {}: {}",
            download_dir.display(),
            e
        ))
    })
}

/// Start a download without waiting for it and register it under a new job id
pub async fn launch_detached(
    engine: &Engine,
    registry: &JobRegistry,
    download_dir: &Path,
    video_id: &str,
) -> AppResult<JobId> {
    ensure_dir(download_dir).await?;

    let id = JobId::generate();
    let child = engine
        .command()
        .args(detached_args(download_dir, video_id))
        .spawn()
        .map_err(AppError::from_spawn)?;

    let job = Arc::new(Job::new(id, video_id, child));
    let pid = job.pid();
    if !registry.register(id, job) {
        // The rejected job is dropped here, which kills its subprocess
        return Err(AppError::engine("Job identifier collision, please retry"));
    }

    info!("Started download for {} (pid {:?}). Job ID: {}", video_id, pid, id);
    Ok(id)
}

/// Live progress of one streamed download.
///
/// The engine subprocess lives exactly as long as something is reading this
/// stream: dropping it kills the subprocess.
pub struct DownloadStream {
    rx: mpsc::Receiver<ProgressEvent>,
    pid: Option<u32>,
}

impl DownloadStream {
    fn failed(err: AppError) -> Self {
        let (tx, rx) = mpsc::channel(1);
        let _ = tx.try_send(ProgressEvent::error(err.to_string()));
        Self { rx, pid: None }
    }

    /// OS process id of the engine, if it was started
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }
}

impl Stream for DownloadStream {
    type Item = ProgressEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Start a download whose progress is delivered through the returned stream.
///
/// Failures to start become a single error event.
pub async fn stream_download(
    engine: &Engine,
    download_dir: &Path,
    video_id: &str,
    quality: Quality,
) -> DownloadStream {
    if let Err(e) = ensure_dir(download_dir).await {
        return DownloadStream::failed(e);
    }

    let child = match engine
        .command()
        .args(stream_args(download_dir, video_id, quality))
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            warn!("Failed to start yt-dlp for {}: {}", video_id, e);
            return DownloadStream::failed(AppError::from_spawn(e));
        }
    };

    info!("Streaming download for {} ({:?})", video_id, quality);

    let pid = child.id();
    let (tx, rx) = mpsc::channel(EVENT_BUFFER);
    tokio::spawn(pump(child, tx, video_id.to_string()));

    DownloadStream { rx, pid }
}

enum PumpEnd {
    Exited,
    Abandoned,
    ReadFailed(std::io::Error),
}

/// Read engine stdout line by line into `tx`, then emit the terminal event.
async fn pump(mut child: Child, tx: mpsc::Sender<ProgressEvent>, video_id: String) {
    let stderr_tail = LineTail::new(STDERR_TAIL_LINES);
    let stderr_task = child.stderr.take().map(|stderr| {
        let tail = stderr_tail.clone();
        let context = video_id.clone();
        tokio::spawn(drain_lines(stderr, video_id.clone(), move |line| {
            debug!("[{}] {}", context, line);
            tail.push(line);
        }))
    });

    let end = match child.stdout.take() {
        Some(stdout) => forward_progress(stdout, &tx, &video_id).await,
        None => PumpEnd::Exited,
    };

    match end {
        PumpEnd::Abandoned => {
            info!("Client left download of {}, stopping yt-dlp", video_id);
            kill_and_reap(&mut child, &video_id).await;
        }
        PumpEnd::ReadFailed(e) => {
            warn!("Lost yt-dlp output for {}: {}", video_id, e);
            kill_and_reap(&mut child, &video_id).await;
            let _ = tx
                .send(ProgressEvent::error(format!("Download failed: {}", e)))
                .await;
        }
        PumpEnd::Exited => {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = tx.closed() => {
                    info!("Client left download of {} during post-processing", video_id);
                    kill_and_reap(&mut child, &video_id).await;
                    return;
                }
            };
            if let Some(task) = stderr_task {
                match tokio::time::timeout(READER_GRACE, task).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!("stderr reader for {} failed: {}", video_id, e),
                    Err(_) => debug!("stderr of {} still open after exit", video_id),
                }
            }
            let _ = tx
                .send(terminal_event(status, stderr_tail.joined(), &video_id))
                .await;
        }
    }
}

async fn forward_progress<R>(stdout: R, tx: &mpsc::Sender<ProgressEvent>, video_id: &str) -> PumpEnd
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut segments = BufReader::new(stdout).split(b'\n');
    loop {
        let segment = tokio::select! {
            _ = tx.closed() => return PumpEnd::Abandoned,
            segment = segments.next_segment() => segment,
        };

        let segment = match segment {
            Ok(Some(segment)) => segment,
            Ok(None) => return PumpEnd::Exited,
            Err(e) => return PumpEnd::ReadFailed(e),
        };

        let line = String::from_utf8_lossy(&segment);
        let line = line.trim_end_matches('\r');
        debug!("[{}] {}", video_id, line);

        if let Some(progress) = parse_progress_line(line) {
            if tx.send(progress.into()).await.is_err() {
                return PumpEnd::Abandoned;
            }
        }
    }
}

fn terminal_event(
    status: std::io::Result<ExitStatus>,
    stderr: String,
    video_id: &str,
) -> ProgressEvent {
    match status {
        Ok(status) if status.success() => {
            info!("Download complete: {}", video_id);
            ProgressEvent::finished()
        }
        Ok(status) => {
            warn!("yt-dlp failed for {} ({}): {}", video_id, status, stderr);
            if stderr.is_empty() {
                ProgressEvent::error(format!("Download failed: yt-dlp exited with {}", status))
            } else {
                ProgressEvent::error(format!("Download failed: {}", stderr))
            }
        }
        Err(e) => ProgressEvent::error(format!("Download failed: {}", e)),
    }
}

async fn kill_and_reap(child: &mut Child, video_id: &str) {
    if let Err(e) = child.start_kill() {
        debug!("kill for {} skipped: {}", video_id, e);
    }
    if let Err(e) = child.wait().await {
        warn!("Failed to reap yt-dlp for {}: {}", video_id, e);
    }
}
