//! Error taxonomy shared by the download layer and the HTTP routes

use thiserror::Error;
use warp::http::StatusCode;

use crate::protocol::error_codes;

/// Errors surfaced to the browser.
///
/// Engine failures are caught where the engine was invoked and folded into a
/// single message; they are never retried.
#[derive(Debug, Error)]
pub enum AppError {
    /// A required request field is missing or malformed
    #[error("{0}")]
    Input(String),

    /// No job is registered under the requested identifier
    #[error("{0}")]
    NotFound(String),

    /// The engine could not be found on this machine
    #[error("yt-dlp not found. Install with: pip install yt-dlp")]
    EngineMissing,

    /// The engine exited non-zero, produced unreadable output, or failed to spawn
    #[error("{0}")]
    Engine(String),

    /// The job's subprocess could not be killed; the job stays registered
    #[error("Failed to terminate process: {0}")]
    Termination(String),
}

pub type AppResult<T> = std::result::Result<T, AppError>;

impl AppError {
    pub fn input(message: impl Into<String>) -> Self {
        AppError::Input(message.into())
    }

    pub fn engine(message: impl Into<String>) -> Self {
        AppError::Engine(message.into())
    }

    pub fn job_not_found() -> Self {
        AppError::NotFound("Task not found or already completed.".to_string())
    }

    /// Map a spawn failure, distinguishing a missing executable
    pub fn from_spawn(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            AppError::EngineMissing
        } else {
            AppError::Engine(format!("Failed to start yt-dlp: {}", err))
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Input(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::EngineMissing | AppError::Engine(_) | AppError::Termination(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            AppError::Input(_) => error_codes::INVALID_INPUT,
            AppError::NotFound(_) => error_codes::JOB_NOT_FOUND,
            AppError::EngineMissing => error_codes::YTDLP_NOT_FOUND,
            AppError::Engine(_) => error_codes::ENGINE_FAILED,
            AppError::Termination(_) => error_codes::TERMINATION_FAILED,
        }
    }
}

impl warp::Reply for AppError {
    fn into_response(self) -> warp::reply::Response {
        let body = crate::protocol::ErrorBody {
            error: self.to_string(),
            code: self.code(),
        };
        warp::reply::with_status(warp::reply::json(&body), self.status()).into_response()
    }
}
