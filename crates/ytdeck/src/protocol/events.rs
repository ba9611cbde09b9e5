//! Progress events pushed to the browser over server-sent events

use serde::Serialize;

/// One event on a streaming download.
///
/// `Finished` and `Error` are terminal; a stream carries exactly one of them,
/// as its last event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ProgressEvent {
    Progress { percent: f64, size_str: String },
    Finished { message: String },
    Error { message: String },
}

impl ProgressEvent {
    pub fn finished() -> Self {
        ProgressEvent::Finished {
            message: "Download complete".to_string(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ProgressEvent::Error {
            message: message.into(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ProgressEvent::Progress { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_shape() {
        let ev = ProgressEvent::Progress {
            percent: 42.0,
            size_str: "10.5MiB".into(),
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["status"], "progress");
        assert_eq!(json["percent"], 42.0);
        assert_eq!(json["size_str"], "10.5MiB");

        let json = serde_json::to_value(ProgressEvent::finished()).unwrap();
        assert_eq!(json["status"], "finished");
        assert_eq!(json["message"], "Download complete");

        let json = serde_json::to_value(ProgressEvent::error("nope")).unwrap();
        assert_eq!(json["status"], "error");
    }

    #[test]
    fn test_terminal_variants() {
        assert!(ProgressEvent::finished().is_terminal());
        assert!(ProgressEvent::error("x").is_terminal());
        assert!(!ProgressEvent::Progress { percent: 1.0, size_str: "1B".into() }.is_terminal());
    }
}
