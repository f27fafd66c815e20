use std::{env, error::Error, path::PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryConfig {
    pub path: PathBuf,
    pub pretty: bool,
    pub sync_on_write: bool,
}

const DEFAULT_HISTORY_FILE: &str = "history.json";

impl HistoryConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            pretty: false,
            sync_on_write: true,
        }
    }

    #[must_use]
    pub fn with_pretty(mut self, pretty: bool) -> Self {
        self.pretty = pretty;
        self
    }

    #[must_use]
    pub fn with_sync_on_write(mut self, sync_on_write: bool) -> Self {
        self.sync_on_write = sync_on_write;
        self
    }

    pub fn from_env() -> Result<Self, Box<dyn Error>> {
        let path = match env::var("EVENT_HISTORY_FILE") {
            Ok(raw) if !raw.trim().is_empty() => PathBuf::from(raw.trim()),
            Ok(_) | Err(env::VarError::NotPresent) => PathBuf::from(DEFAULT_HISTORY_FILE),
            Err(err) => return Err(Box::new(err)),
        };
        let pretty = match env::var("EVENT_HISTORY_PRETTY") {
            Ok(raw) => parse_flag("EVENT_HISTORY_PRETTY", &raw)?,
            Err(env::VarError::NotPresent) => false,
            Err(err) => return Err(Box::new(err)),
        };
        let sync_on_write = match env::var("EVENT_HISTORY_SYNC") {
            Ok(raw) => parse_flag("EVENT_HISTORY_SYNC", &raw)?,
            Err(env::VarError::NotPresent) => true,
            Err(err) => return Err(Box::new(err)),
        };

        Ok(Self {
            path,
            pretty,
            sync_on_write,
        })
    }
}

fn parse_flag(name: &str, raw: &str) -> Result<bool, Box<dyn Error>> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(format!("{name} must be a boolean, got {other:?}").into()),
    }
}
