//! Cancelling and polling fire-and-forget jobs

use tracing::{info, warn};

use super::registry::{JobId, JobRegistry};
use crate::error::{AppError, AppResult};
use crate::protocol::{JobState, JobStatus};

/// Kill a registered job and forget it.
///
/// Unknown ids are reported as not found without touching any process. If the
/// kill itself fails the job stays registered so the caller can retry.
pub async fn cancel_job(registry: &JobRegistry, raw_id: &str) -> AppResult<()> {
    let id = JobId::parse(raw_id).ok_or_else(AppError::job_not_found)?;
    let job = registry.lookup(&id).ok_or_else(AppError::job_not_found)?;

    match job.terminate().await {
        Ok(status) => {
            registry.remove(&id);
            info!("Canceled and removed job {} ({})", id, status);
            Ok(())
        }
        Err(e) => {
            warn!("Failed to terminate job {}: {}", id, e);
            Err(AppError::Termination(e.to_string()))
        }
    }
}

/// Report a job's progress; once it has exited, report the outcome and
/// remove it from the registry. The outcome is reported to one caller only.
pub async fn poll_job(registry: &JobRegistry, raw_id: &str) -> AppResult<JobStatus> {
    let id = JobId::parse(raw_id).ok_or_else(AppError::job_not_found)?;
    let job = registry.lookup(&id).ok_or_else(AppError::job_not_found)?;

    let exit = job
        .try_exit()
        .await
        .map_err(|e| AppError::engine(format!("Failed to query job {}: {}", id, e)))?;

    let Some(status) = exit else {
        return Ok(job.status(JobState::Running, None));
    };

    job.settle_output().await;
    // A concurrent poll may have collected the job first
    if registry.remove(&id).is_none() {
        return Err(AppError::job_not_found());
    }

    let state = if status.success() {
        info!("Job {} finished ({})", id, job.video_id());
        JobState::Finished
    } else {
        warn!("Job {} failed: {}", id, status);
        JobState::Failed
    };
    Ok(job.status(state, Some(status)))
}
