//! Request and response bodies for the HTTP API

mod events;

pub use events::ProgressEvent;

use serde::{Deserialize, Serialize};

use crate::download::{ChannelSummary, VideoSummary};

/// `POST /api/fetch`
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchRequest {
    #[serde(default)]
    pub url: Option<String>,
}

/// `POST /api/download`
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadRequest {
    #[serde(default)]
    pub video_id: Option<String>,
}

/// Query string of `GET /api/download/stream`
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamQuery {
    #[serde(default)]
    pub video_id: Option<String>,
    #[serde(default)]
    pub quality: Option<String>,
}

/// `POST /api/cancel`
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelRequest {
    /// Older clients send `taskId`
    #[serde(default, alias = "taskId")]
    pub job_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct FetchResponse {
    pub channel: ChannelSummary,
    pub videos: Vec<VideoSummary>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadStarted {
    pub message: String,
    pub job_id: String,
}

#[derive(Debug, Serialize)]
pub struct MessageBody {
    pub message: String,
}

impl MessageBody {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub code: &'static str,
}

/// Job lifecycle as seen by a poller
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Running,
    Finished,
    Failed,
}

/// `GET /api/download/<jobId>`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    pub job_id: String,
    pub video_id: String,
    pub state: JobState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub percent: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_str: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub elapsed_ms: u64,
}

/// `GET /api/info`
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InfoResponse {
    pub version: &'static str,
    pub engine: String,
    pub engine_available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub engine_version: Option<String>,
    pub download_dir: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cookies: Option<String>,
    pub active_jobs: usize,
}

/// Error codes
pub mod error_codes {
    pub const INVALID_INPUT: &str = "INVALID_INPUT";
    pub const JOB_NOT_FOUND: &str = "JOB_NOT_FOUND";
    pub const YTDLP_NOT_FOUND: &str = "YTDLP_NOT_FOUND";
    pub const ENGINE_FAILED: &str = "ENGINE_FAILED";
    pub const TERMINATION_FAILED: &str = "TERMINATION_FAILED";
    pub const NOT_FOUND: &str = "NOT_FOUND";
    pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
}
