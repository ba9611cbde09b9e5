//! Progress parsing for yt-dlp `--newline` output.

use std::sync::LazyLock;

use regex::Regex;

use crate::protocol::ProgressEvent;

/// `[download]  42.0% of ~ 10.50MiB at 1.2MiB/s ETA 00:05`
static PROGRESS_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[download\]\s+(\d+(?:\.\d+)?)%\s+of\s+~?\s*(\d+(?:\.\d+)?(?:[KMGTP]i?)?B)\b")
        .expect("progress pattern is valid")
});

/// Percent and total size parsed from one progress line
#[derive(Debug, Clone, PartialEq)]
pub struct Progress {
    pub percent: f64,
    pub size_str: String,
}

impl From<Progress> for ProgressEvent {
    fn from(p: Progress) -> Self {
        ProgressEvent::Progress {
            percent: p.percent,
            size_str: p.size_str,
        }
    }
}

/// Parse a single line of engine output.
///
/// Returns `None` for anything that is not a download progress line:
/// banners, warnings, destinations, merger and post-processing messages.
pub fn parse_progress_line(line: &str) -> Option<Progress> {
    let caps = PROGRESS_LINE.captures(line)?;
    let percent = caps.get(1)?.as_str().parse::<f64>().ok()?;
    let size_str = caps.get(2)?.as_str().to_string();

    Some(Progress {
        percent: percent.clamp(0.0, 100.0),
        size_str,
    })
}
