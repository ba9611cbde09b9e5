//! yt-dlp discovery and invocation
//!
//! Every subprocess this server starts is built from [`Engine::command`], so
//! the executable, the optional JavaScript runtime and the cookies file are
//! applied uniformly to metadata fetches and downloads.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;
use tracing::debug;

/// Base URL used to turn a video identifier back into something yt-dlp accepts
pub const WATCH_URL_PREFIX: &str = "https://www.youtube.com/watch?v=";

/// How to run the external extraction/download tool
#[derive(Debug, Clone)]
pub struct Engine {
    program: PathBuf,
    leading_args: Vec<String>,
    cookies: Option<PathBuf>,
}

impl Engine {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            leading_args: Vec::new(),
            cookies: None,
        }
    }

    /// Resolve yt-dlp (explicit path first, then auto-detection) and attach
    /// the deno runtime when one is installed.
    pub fn detect(explicit: Option<PathBuf>, cookies: Option<PathBuf>) -> Self {
        let program = explicit
            .or_else(find_ytdlp)
            .unwrap_or_else(|| PathBuf::from("yt-dlp"));

        Self {
            program,
            leading_args: deno_args(),
            cookies,
        }
    }

    pub fn with_leading_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.leading_args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_cookies(mut self, cookies: Option<PathBuf>) -> Self {
        self.cookies = cookies;
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn cookies(&self) -> Option<&Path> {
        self.cookies.as_deref()
    }

    /// Whether yt-dlp is pointed at a JavaScript runtime
    pub fn has_js_runtime(&self) -> bool {
        self.leading_args.iter().any(|a| a == "--js-runtimes")
    }

    /// A fresh command with the shared prefix applied and both output
    /// streams piped. The child is killed if its handle is dropped.
    pub fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.leading_args);
        if let Some(cookies) = &self.cookies {
            cmd.arg("--cookies").arg(cookies);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        debug!("engine command: {:?}", cmd.as_std());
        cmd
    }

    /// `yt-dlp --version`, or `None` if it cannot be run
    pub async fn version(&self) -> Option<String> {
        let output = Command::new(&self.program)
            .arg("--version")
            .stdin(Stdio::null())
            .output()
            .await
            .ok()?;

        if !output.status.success() {
            return None;
        }
        let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
        (!version.is_empty()).then_some(version)
    }

    /// A stand-in engine that runs `script` under `sh`; the real yt-dlp
    /// arguments arrive as `$1..`.
    #[cfg(all(test, unix))]
    pub(crate) fn scripted(script: &str) -> Self {
        Engine::new("sh").with_leading_args(["-c", script, "ytdeck-engine"])
    }
}

/// Turn a video identifier into a watch URL
pub fn watch_url(video_id: &str) -> String {
    format!("{}{}", WATCH_URL_PREFIX, video_id)
}

fn runs_ok(program: &Path) -> bool {
    std::process::Command::new(program)
        .arg("--version")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Find yt-dlp executable, checking common install locations
pub fn find_ytdlp() -> Option<PathBuf> {
    let in_path = PathBuf::from("yt-dlp");
    if runs_ok(&in_path) {
        return Some(in_path);
    }

    // pip --user installs land in ~/.local/bin, which is often not on PATH
    #[cfg(unix)]
    {
        if let Some(home) = dirs::home_dir() {
            let local = home.join(".local").join("bin").join("yt-dlp");
            if local.exists() && runs_ok(&local) {
                return Some(local);
            }
        }
    }

    #[cfg(windows)]
    {
        if let Some(data) = dirs::data_dir() {
            if let Ok(entries) = std::fs::read_dir(data.join("Python")) {
                for entry in entries.flatten() {
                    let exe = entry.path().join("Scripts").join("yt-dlp.exe");
                    if exe.exists() {
                        return Some(exe);
                    }
                }
            }
        }
    }

    None
}

/// Find deno executable for yt-dlp JavaScript runtime
pub fn find_deno() -> Option<PathBuf> {
    let in_path = PathBuf::from("deno");
    if runs_ok(&in_path) {
        return Some(in_path);
    }

    #[cfg(unix)]
    {
        if let Some(home) = dirs::home_dir() {
            let local = home.join(".deno").join("bin").join("deno");
            if local.exists() {
                return Some(local);
            }
        }
    }

    None
}

fn deno_args() -> Vec<String> {
    match find_deno() {
        Some(deno) => vec![
            "--js-runtimes".to_string(),
            format!("deno:{}", deno.to_string_lossy()),
        ],
        None => Vec::new(),
    }
}
