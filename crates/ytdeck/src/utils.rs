//! Default locations for downloads and the cookies file

use std::path::{Path, PathBuf};

use tracing::warn;

/// Looked up in the working directory when no cookies file is configured
pub const DEFAULT_COOKIES_FILE: &str = "cookies.txt";

/// Get the default download directory for videos
pub fn get_download_dir() -> PathBuf {
    dirs::download_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("ytdeck")
}

/// Pick the cookies file handed to yt-dlp.
///
/// An explicit path is used even if it does not exist yet (yt-dlp reports the
/// problem per request); otherwise `cookies.txt` is used only when present.
pub fn resolve_cookies(explicit: Option<PathBuf>, fallback: &Path) -> Option<PathBuf> {
    match explicit {
        Some(path) => {
            if !path.is_file() {
                warn!("Cookies file {} does not exist", path.display());
            }
            Some(path)
        }
        None => fallback.is_file().then(|| fallback.to_path_buf()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_download_dir_is_namespaced() {
        assert!(get_download_dir().ends_with("ytdeck"));
    }

    #[test]
    fn test_resolve_cookies() {
        let missing = Path::new("/nonexistent/ytdeck/cookies.txt");
        assert_eq!(resolve_cookies(None, missing), None);
        assert_eq!(
            resolve_cookies(Some(missing.to_path_buf()), missing).as_deref(),
            Some(missing)
        );

        let present = std::env::temp_dir().join(format!("ytdeck-cookies-{}.txt", std::process::id()));
        std::fs::write(&present, "# Netscape HTTP Cookie File\n").unwrap();
        assert_eq!(resolve_cookies(None, &present).as_deref(), Some(present.as_path()));
        std::fs::remove_file(&present).unwrap();
    }
}
