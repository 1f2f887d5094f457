//! Database schema versions.
//!
//! Every decode path that depends on how a file was written takes a
//! [`SchemaVersion`] explicitly; there is no ambient "current file version".
//!
//! | Version | Change |
//! |---------|--------|
//! | 1       | external relational store (unreadable, migrate first) |
//! | 2       | flat parameter store (unreadable, migrate first) |
//! | 3.0     | full composite model |
//! | 3.1     | grid read/write improvements |
//! | 3.2     | reference-style large attribute storage, single-letter location tags |
//! | 3.3     | compressed multi-index location storage, named location tags |
//! | 3.4     | complete-index storage for composed grids |

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::SchemaError;

/// A `major.minor` database schema version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SchemaVersion {
    pub major: u16,
    pub minor: u16,
}

impl SchemaVersion {
    /// The version written by this crate unless configured otherwise.
    pub const CURRENT: Self = Self::new(3, 4);

    /// Oldest version that stores large attributes as `@` references.
    pub const ATTRIBUTE_REFERENCES: Self = Self::new(3, 2);

    /// Oldest version whose layouts support location-keyed history queries.
    pub const LOCATION_HISTORY: Self = Self::new(3, 4);

    #[must_use]
    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }

    /// Returns true if files of this version can be read by this crate.
    #[must_use]
    pub const fn is_readable(self) -> bool {
        self.major == 3
    }

    /// Returns true if large metadata attributes are stored as references.
    #[must_use]
    pub fn uses_attribute_references(self) -> bool {
        self >= Self::ATTRIBUTE_REFERENCES
    }

    /// Fails with [`SchemaError::Unsupported`] for anything but version 3.
    pub fn ensure_readable(self) -> Result<Self, SchemaError> {
        if self.is_readable() {
            Ok(self)
        } else {
            Err(SchemaError::Unsupported {
                found: self.to_string(),
            })
        }
    }

    /// Fails with [`SchemaError::VersionTooOld`] if `self < required`.
    pub fn require(self, required: Self, operation: &str) -> Result<(), SchemaError> {
        if self < required {
            return Err(SchemaError::VersionTooOld {
                operation: operation.to_string(),
                required,
                found: self,
            });
        }
        Ok(())
    }
}

impl Default for SchemaVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl FromStr for SchemaVersion {
    type Err = SchemaError;

    /// Parses `"3.4"`; a bare major such as `"2"` means minor 0.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let unreadable = || SchemaError::Unreadable {
            reason: format!("malformed version string {s:?}"),
        };
        let mut parts = s.trim().splitn(2, '.');
        let major = parts
            .next()
            .and_then(|p| p.parse::<u16>().ok())
            .ok_or_else(unreadable)?;
        let minor = match parts.next() {
            Some(p) => p.parse::<u16>().map_err(|_| unreadable())?,
            None => 0,
        };
        Ok(Self::new(major, minor))
    }
}

impl TryFrom<String> for SchemaVersion {
    type Error = SchemaError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SchemaVersion> for String {
    fn from(v: SchemaVersion) -> Self {
        v.to_string()
    }
}
