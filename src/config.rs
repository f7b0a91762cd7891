//! YAML configuration loader
//!
//! Loads the database path, control-socket path, subject filters and
//! extractor rules from a YAML file. Parsing is eager: a malformed regex or
//! an unrecognized capture shape fails config load, never extraction.

use std::path::Path;

use regex::Regex;
use serde::Deserialize;

use crate::errors::ConfigError;
use crate::extractor::{Capture, ExtractorRule};

/// Default path for the control socket, matching the original implementation.
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/mailwatcher.sock";

/// Fully parsed and validated configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the SQLite mailbox registry.
    pub database: String,
    /// Path to the control Unix-domain socket.
    pub socket_path: String,
    /// Subject substrings used to filter `SEARCH`. Empty means no filter.
    pub subjects: Vec<String>,
    /// Ordered, compiled extraction rules.
    pub extractors: Vec<ExtractorRule>,
}

/// Raw, pre-validation shape of the YAML document.
#[derive(Debug, Deserialize)]
struct RawConfig {
    database: String,
    #[serde(default)]
    socket_path: Option<String>,
    #[serde(default)]
    subjects: Vec<String>,
    #[serde(default)]
    extractors: Vec<RawExtractor>,
}

#[derive(Debug, Deserialize)]
struct RawExtractor {
    regex: String,
    capture: CaptureValue,
}

/// `capture` may be a YAML integer (submatch index) or string (named group).
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CaptureValue {
    Index(i64),
    Name(String),
}

impl Config {
    /// Load and validate configuration from `path`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read, the YAML is
    /// malformed, or any extractor's regex/capture is invalid.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw_text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;

        let raw: RawConfig =
            serde_yaml::from_str(&raw_text).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?;

        let extractors = raw
            .extractors
            .into_iter()
            .map(compile_extractor)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            database: raw.database,
            socket_path: raw
                .socket_path
                .unwrap_or_else(|| DEFAULT_SOCKET_PATH.to_owned()),
            subjects: raw.subjects,
            extractors,
        })
    }
}

fn compile_extractor(raw: RawExtractor) -> Result<ExtractorRule, ConfigError> {
    let pattern = Regex::new(&raw.regex).map_err(|source| ConfigError::InvalidRegex {
        pattern: raw.regex.clone(),
        source,
    })?;

    let capture = match raw.capture {
        CaptureValue::Name(name) => Capture::Named(name),
        CaptureValue::Index(index) if index >= 0 => Capture::Indexed(index as usize),
        CaptureValue::Index(index) => {
            return Err(ConfigError::InvalidCapture {
                pattern: raw.regex,
                capture: index.to_string(),
            });
        }
    };

    Ok(ExtractorRule::new(pattern, capture))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().expect("create temp config file");
        file.write_all(contents.as_bytes()).expect("write config");
        file
    }

    #[test]
    fn loads_minimal_config_with_defaults() {
        let file = write_config("database: /tmp/mailboxes.db\n");
        let config = Config::load(file.path()).expect("config should load");
        assert_eq!(config.database, "/tmp/mailboxes.db");
        assert_eq!(config.socket_path, DEFAULT_SOCKET_PATH);
        assert!(config.subjects.is_empty());
        assert!(config.extractors.is_empty());
    }

    #[test]
    fn loads_full_config() {
        let file = write_config(
            r#"
database: /tmp/mailboxes.db
socket_path: /tmp/custom.sock
subjects:
  - "Your code"
  - "Verification"
extractors:
  - regex: 'code:\s*(\d{6})'
    capture: 1
  - regex: '(?P<c>[A-Z0-9]{8})'
    capture: c
"#,
        );
        let config = Config::load(file.path()).expect("config should load");
        assert_eq!(config.socket_path, "/tmp/custom.sock");
        assert_eq!(config.subjects, vec!["Your code", "Verification"]);
        assert_eq!(config.extractors.len(), 2);
    }

    #[test]
    fn rejects_invalid_regex() {
        let file = write_config(
            r#"
database: /tmp/mailboxes.db
extractors:
  - regex: '('
    capture: 0
"#,
        );
        let err = Config::load(file.path()).expect_err("invalid regex must fail");
        assert!(matches!(err, ConfigError::InvalidRegex { .. }));
    }

    #[test]
    fn rejects_negative_capture_index() {
        let file = write_config(
            r#"
database: /tmp/mailboxes.db
extractors:
  - regex: '(\d+)'
    capture: -1
"#,
        );
        let err = Config::load(file.path()).expect_err("negative index must fail");
        assert!(matches!(err, ConfigError::InvalidCapture { .. }));
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let err = Config::load(Path::new("/nonexistent/path/config.yaml"))
            .expect_err("missing file must fail");
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
