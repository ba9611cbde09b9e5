//! Line-oriented draining of subprocess output

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing::warn;

/// Lines of stderr kept per download for failure messages
pub const STDERR_TAIL_LINES: usize = 20;

/// How long to wait for output readers once the subprocess has exited
pub const READER_GRACE: Duration = Duration::from_secs(1);

/// The most recent lines of a stream, shared between the reader and its owner
#[derive(Debug, Clone)]
pub struct LineTail {
    lines: Arc<Mutex<VecDeque<String>>>,
    cap: usize,
}

impl LineTail {
    pub fn new(cap: usize) -> Self {
        Self {
            lines: Arc::new(Mutex::new(VecDeque::with_capacity(cap))),
            cap,
        }
    }

    pub fn push(&self, line: &str) {
        if self.cap == 0 {
            return;
        }
        let mut lines = self.lines.lock();
        if lines.len() == self.cap {
            lines.pop_front();
        }
        lines.push_back(line.to_string());
    }

    /// Kept lines, oldest first, joined with newlines
    pub fn joined(&self) -> String {
        self.lines
            .lock()
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Feed every non-empty line of `stream` to `on_line` until EOF.
///
/// Bytes that are not UTF-8 are replaced. A read error ends the drain and is
/// logged under `context`.
pub async fn drain_lines<R, F>(stream: R, context: String, mut on_line: F)
where
    R: AsyncRead + Unpin,
    F: FnMut(&str),
{
    let mut segments = BufReader::new(stream).split(b'\n');
    loop {
        match segments.next_segment().await {
            Ok(Some(segment)) => {
                let line = String::from_utf8_lossy(&segment);
                let line = line.trim_end_matches('\r');
                if !line.is_empty() {
                    on_line(line);
                }
            }
            Ok(None) => return,
            Err(e) => {
                warn!("[{}] output read failed: {}", context, e);
                return;
            }
        }
    }
}
