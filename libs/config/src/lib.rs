use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub mod wire;

/// environment tag that disables topology sources entirely
pub const ENVIRONMENT_NONE: &str = "";
/// environment tag for the source that always reports an empty topology
pub const ENVIRONMENT_NULL: &str = "null";
/// environment tag for the cloud metadata source
pub const ENVIRONMENT_CLOUD: &str = "cloud";
/// environment tag for the static file source
pub const ENVIRONMENT_FILE: &str = "file";

/// Selects and tunes the topology source started by the address manager
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize, Serialize)]
pub struct SourceOptions {
    /// which source to start, see the `ENVIRONMENT_*` tags. Validated when
    /// the address manager is initialized, not here.
    #[serde(default)]
    pub environment: String,
    /// overrides the metadata endpoint queried by the cloud source
    #[serde(default)]
    pub query_url: Option<String>,
    /// minimum time between two topology queries
    #[serde(default)]
    pub query_interval_secs: Option<u64>,
    /// overrides the document read by the file source
    #[serde(default)]
    pub file_path: Option<PathBuf>,
}

impl SourceOptions {
    pub fn new<S: Into<String>>(environment: S) -> Self {
        Self {
            environment: environment.into(),
            ..Self::default()
        }
    }

    pub fn query_interval(&self) -> Option<Duration> {
        self.query_interval_secs.map(Duration::from_secs)
    }

    /// attempts to decode the options first as JSON, then YAML, finally erroring if neither work
    pub fn parse<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let input = std::fs::read_to_string(path)
            .with_context(|| format!("failed to find source options at {}", path.display()))?;
        Self::parse_str(input)
    }

    /// attempts to decode the options first as JSON, then YAML, finally erroring if neither work
    pub fn parse_str<S: AsRef<str>>(s: S) -> Result<Self> {
        let s = s.as_ref();
        let opts = match serde_json::from_str::<Self>(s) {
            Ok(opts) => opts,
            Err(_err) => serde_yaml::from_str(s).context("source options are neither JSON nor YAML")?,
        };
        debug!(?opts);
        Ok(opts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_json() -> Result<()> {
        let opts = SourceOptions::parse_str(
            r#"{"environment": "cloud", "query_url": "http://127.0.0.1:4242/", "query_interval_secs": 7}"#,
        )?;
        assert_eq!(opts.environment, ENVIRONMENT_CLOUD);
        assert_eq!(opts.query_url.as_deref(), Some("http://127.0.0.1:4242/"));
        assert_eq!(opts.query_interval(), Some(Duration::from_secs(7)));
        assert_eq!(opts.file_path, None);
        Ok(())
    }

    #[test]
    fn test_parse_yaml() -> Result<()> {
        let opts = SourceOptions::parse_str("environment: file\nfile_path: /tmp/interfaces.json\n")?;
        assert_eq!(opts.environment, ENVIRONMENT_FILE);
        assert_eq!(opts.file_path, Some(PathBuf::from("/tmp/interfaces.json")));
        assert_eq!(opts.query_interval(), None);
        Ok(())
    }

    #[test]
    fn test_parse_empty_defaults() -> Result<()> {
        let opts = SourceOptions::parse_str("{}")?;
        assert_eq!(opts, SourceOptions::default());
        assert_eq!(opts.environment, ENVIRONMENT_NONE);
        Ok(())
    }

    #[test]
    fn test_parse_garbage() {
        assert!(SourceOptions::parse_str("environment: [unclosed").is_err());
        assert!(SourceOptions::parse("/definitely/not/here.yaml").is_err());
    }
}
