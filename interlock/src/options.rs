use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Connection configuration used when opening a [`crate::Connection`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Options {
    /// How long `step` keeps retrying while the engine reports Busy.
    /// Zero surfaces Busy immediately.
    pub busy_timeout_ms: u64,
    /// Upper bound of the random pause between busy retries.
    pub max_busy_sleep_ms: u64,
    /// Force-close the connection when it is dropped while still open.
    pub close_on_drop: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            busy_timeout_ms: 0,
            max_busy_sleep_ms: 150,
            close_on_drop: true,
        }
    }
}

impl Options {
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_close_on_drop(mut self, close_on_drop: bool) -> Self {
        self.close_on_drop = close_on_drop;
        self
    }

    #[inline]
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    #[inline]
    pub(crate) fn max_busy_sleep(&self) -> u64 {
        self.max_busy_sleep_ms.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use std::io::Write;

    #[test]
    fn partial_json_keeps_defaults() {
        let options = Options::from_json(r#"{"busy_timeout_ms": 250}"#).unwrap();
        assert_eq!(options.busy_timeout(), Duration::from_millis(250));
        assert_eq!(options.max_busy_sleep_ms, 150);
        assert!(options.close_on_drop);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = Options::from_json(r#"{"busy_timeout": 250}"#).unwrap_err();
        assert!(matches!(err, Error::Options(_)));
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"close_on_drop": false, "max_busy_sleep_ms": 0}}"#).unwrap();

        let options = Options::from_file(file.path()).unwrap();
        assert!(!options.close_on_drop);
        assert_eq!(options.max_busy_sleep(), 1);
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = Options::from_file(dir.path().join("absent.json")).unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }
}
