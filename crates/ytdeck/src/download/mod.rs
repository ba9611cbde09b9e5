//! Everything that talks to yt-dlp

mod cancel;
mod engine;
mod launcher;
mod metadata;
mod output;
mod progress;
mod registry;

pub use cancel::{cancel_job, poll_job};
pub use engine::{find_deno, find_ytdlp, watch_url, Engine};
pub use launcher::{
    launch_detached, stream_download, validate_video_id, DownloadStream, Quality,
};
pub use metadata::{fetch_listing, parse_listing, ChannelSummary, VideoSummary};
pub use progress::{parse_progress_line, Progress};
pub use registry::{Job, JobId, JobProcess, JobRegistry};
