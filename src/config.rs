//! Database configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{DatabaseError, DbResult};
use crate::version::SchemaVersion;

const MIN_LARGE_ATTR_THRESHOLD: usize = 1;

fn default_sync_on_write() -> bool {
    true
}

fn default_large_attr_threshold() -> usize {
    1024
}

fn default_case_title() -> String {
    "unnamed".to_string()
}

/// Settings for opening and writing a [`Database`](crate::Database).
///
/// Every field has a default, so a partial JSON object deserializes.
///
/// # Example
///
/// ```
/// use reactordb::DatabaseConfig;
///
/// let config = DatabaseConfig::from_json_str(r#"{"case_title": "c5g7", "sync_on_write": false}"#)?;
/// assert_eq!(config.case_title, "c5g7");
/// assert_eq!(config.large_attr_threshold, 1024);
/// # Ok::<(), reactordb::DatabaseError>(())
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Whether to fsync after every committed write (slower but safer).
    #[serde(default = "default_sync_on_write")]
    pub sync_on_write: bool,
    /// Fast local directory to write into while the run is live; the file
    /// is moved to its permanent path on close.
    #[serde(default)]
    pub scratch_dir: Option<PathBuf>,
    /// Database the run restarts from. Opening it for writing is refused.
    #[serde(default)]
    pub restart_source: Option<PathBuf>,
    /// Case title stamped into the root attributes.
    #[serde(default = "default_case_title")]
    pub case_title: String,
    /// Metadata arrays longer than this are stored as sibling datasets
    /// (schema 3.2 and newer).
    #[serde(default = "default_large_attr_threshold")]
    pub large_attr_threshold: usize,
    /// Schema version written into new files.
    #[serde(default)]
    pub schema_version: SchemaVersion,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            sync_on_write: default_sync_on_write(),
            scratch_dir: None,
            restart_source: None,
            case_title: default_case_title(),
            large_attr_threshold: default_large_attr_threshold(),
            schema_version: SchemaVersion::CURRENT,
        }
    }
}

impl DatabaseConfig {
    /// Parses and validates a JSON configuration object.
    ///
    /// # Errors
    /// Returns an invalid-argument error on malformed JSON or out-of-range
    /// values.
    pub fn from_json_str(json: &str) -> DbResult<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| DatabaseError::invalid_argument(format!("database config: {e}")))?;
        config.validate()
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    /// Returns an invalid-argument error if the threshold is zero or the
    /// schema version is not a writable 3.x version.
    pub fn validate(self) -> DbResult<Self> {
        if self.large_attr_threshold < MIN_LARGE_ATTR_THRESHOLD {
            return Err(DatabaseError::invalid_argument(format!(
                "large_attr_threshold must be at least {MIN_LARGE_ATTR_THRESHOLD} (got {})",
                self.large_attr_threshold
            )));
        }

        if !self.schema_version.is_readable() || self.schema_version > SchemaVersion::CURRENT {
            return Err(DatabaseError::invalid_argument(format!(
                "cannot write schema version {} (supported: 3.0 to {})",
                self.schema_version,
                SchemaVersion::CURRENT
            )));
        }

        Ok(self)
    }

    /// Disables fsync; for tests and throwaway files.
    #[must_use]
    pub fn without_sync(mut self) -> Self {
        self.sync_on_write = false;
        self
    }
}
