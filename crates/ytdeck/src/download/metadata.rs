//! Channel and playlist listing via `yt-dlp --flat-playlist --dump-single-json`

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::engine::Engine;
use crate::error::{AppError, AppResult};

const NOT_AVAILABLE: &str = "N/A";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelSummary {
    pub name: String,
    pub url: String,
    pub avatar: Option<String>,
    pub video_count: u64,
    pub subscriber_count: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoSummary {
    pub id: String,
    pub title: String,
    pub thumbnail: String,
    pub view_count: Option<u64>,
    pub upload_date: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct Thumbnail {
    url: Option<String>,
}

/// The subset of yt-dlp's info dict this server reads.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct InfoDict {
    id: Option<String>,
    title: Option<String>,
    uploader: Option<String>,
    channel: Option<String>,
    uploader_url: Option<String>,
    channel_url: Option<String>,
    thumbnails: Option<Vec<Thumbnail>>,
    channel_thumbnail_url: Option<String>,
    playlist_count: Option<u64>,
    channel_follower_count: Option<u64>,
    view_count: Option<u64>,
    upload_date: Option<String>,
    /// Unavailable videos show up as `null`
    entries: Option<Vec<Option<InfoDict>>>,
}

impl InfoDict {
    fn last_thumbnail(&self) -> Option<String> {
        self.thumbnails
            .as_deref()
            .unwrap_or_default()
            .iter()
            .rev()
            .find_map(|t| t.url.clone())
    }

    fn to_video(&self) -> Option<VideoSummary> {
        let id = self.id.clone().filter(|id| !id.is_empty())?;
        let thumbnail = self
            .last_thumbnail()
            .unwrap_or_else(|| format!("https://i.ytimg.com/vi/{}/mqdefault.jpg", id));

        Some(VideoSummary {
            title: self.title.clone().unwrap_or_else(|| NOT_AVAILABLE.to_string()),
            thumbnail,
            view_count: self.view_count,
            upload_date: self.upload_date.clone(),
            id,
        })
    }
}

/// Build the channel summary and video list from a flat info dict.
///
/// A single video (no `entries`) is reported as a one-video listing.
pub fn parse_listing(json: &str) -> AppResult<(ChannelSummary, Vec<VideoSummary>)> {
    let info: InfoDict = serde_json::from_str(json)
        .map_err(|e| AppError::engine(format!("Failed to parse yt-dlp output: {}", e)))?;

    let videos: Vec<VideoSummary> = match &info.entries {
        Some(entries) => entries
            .iter()
            .flatten()
            .filter_map(InfoDict::to_video)
            .collect(),
        None => info.to_video().into_iter().collect(),
    };

    let entry_count = info.entries.as_ref().map_or(videos.len(), Vec::len) as u64;

    let channel = ChannelSummary {
        name: info
            .uploader
            .clone()
            .or_else(|| info.channel.clone())
            .unwrap_or_else(|| NOT_AVAILABLE.to_string()),
        url: info
            .uploader_url
            .clone()
            .or_else(|| info.channel_url.clone())
            .unwrap_or_else(|| "#".to_string()),
        avatar: info
            .last_thumbnail()
            .or_else(|| info.channel_thumbnail_url.clone()),
        video_count: info.playlist_count.unwrap_or(entry_count),
        subscriber_count: info
            .channel_follower_count
            .map(|n| n.to_string())
            .unwrap_or_else(|| NOT_AVAILABLE.to_string()),
    };

    Ok((channel, videos))
}

/// List a channel, playlist or single video without downloading anything
pub async fn fetch_listing(
    engine: &Engine,
    url: &str,
) -> AppResult<(ChannelSummary, Vec<VideoSummary>)> {
    if !url.starts_with("http://") && !url.starts_with("https://") {
        return Err(AppError::input("URL must start with http:// or https://"));
    }

    info!("Fetching listing: {}", url);

    let output = engine
        .command()
        .args(["--flat-playlist", "--dump-single-json", url])
        .output()
        .await
        .map_err(AppError::from_spawn)?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let reason = stderr
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .unwrap_or("yt-dlp exited with an error");
        warn!("yt-dlp listing failed ({}): {}", output.status, stderr.trim());
        return Err(AppError::engine(format!(
            "Failed to fetch video data: {}",
            reason.trim()
        )));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let (channel, videos) = parse_listing(&stdout)?;
    info!("Listed {} videos from {}", videos.len(), channel.name);
    Ok((channel, videos))
}
