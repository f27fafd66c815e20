use std::path::PathBuf;

use chrono::{DateTime, Utc};

#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("history file I/O failed for {}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("history file {} is malformed: {source}", .path.display())]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to serialize event history")]
    Serialize(#[from] serde_json::Error),
    #[error("event {id} has timestamp {timestamp} outside years 0000-9999")]
    TimestampOutOfRange { id: String, timestamp: DateTime<Utc> },
    #[error("history file {} is already owned by a live store", .0.display())]
    PathInUse(PathBuf),
}

impl HistoryError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn malformed(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        Self::Malformed {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, HistoryError>;
