//! Time-step keys and their group names.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{DatabaseError, DbResult};

/// A (cycle, node, label) key identifying one stored snapshot.
///
/// Ordered by cycle, then node, then label. Stored as the group
/// `c<cycle:02>n<node:02><label>`.
///
/// # Example
///
/// ```
/// use reactordb::TimeStep;
///
/// let ts = TimeStep::with_label(3, 1, "EOL").unwrap();
/// assert_eq!(ts.group_name(), "c03n01EOL");
/// assert_eq!(TimeStep::from_group_name("c03n01EOL"), Some(ts));
/// assert!(TimeStep::new(0, 9) < TimeStep::new(1, 0));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TimeStep {
    pub cycle: u32,
    pub node: u32,
    pub label: String,
}

impl TimeStep {
    #[must_use]
    pub const fn new(cycle: u32, node: u32) -> Self {
        Self {
            cycle,
            node,
            label: String::new(),
        }
    }

    /// Creates a labelled time step.
    ///
    /// # Errors
    /// Returns an invalid-argument error unless the label consists of ASCII
    /// letters, digits, `_` and `-` and does not start with a digit.
    pub fn with_label(cycle: u32, node: u32, label: impl Into<String>) -> DbResult<Self> {
        let label = label.into();
        validate_label(&label)?;
        Ok(Self { cycle, node, label })
    }

    /// Name of the group holding this time step.
    #[must_use]
    pub fn group_name(&self) -> String {
        format!("c{:02}n{:02}{}", self.cycle, self.node, self.label)
    }

    /// Parses a group name; returns `None` for non-time-step groups.
    #[must_use]
    pub fn from_group_name(name: &str) -> Option<Self> {
        let rest = name.strip_prefix('c')?;
        let (cycle, rest) = split_digits(rest)?;
        let rest = rest.strip_prefix('n')?;
        let (node, label) = split_digits(rest)?;
        validate_label(label).ok()?;
        Some(Self {
            cycle,
            node,
            label: label.to_string(),
        })
    }

    /// True if this step comes strictly before `(cycle, node)`.
    #[must_use]
    pub fn is_before(&self, cycle: u32, node: u32) -> bool {
        (self.cycle, self.node) < (cycle, node)
    }
}

impl fmt::Display for TimeStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.group_name())
    }
}

fn split_digits(s: &str) -> Option<(u32, &str)> {
    let end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    if end == 0 {
        return None;
    }
    let value = s[..end].parse().ok()?;
    Some((value, &s[end..]))
}

fn validate_label(label: &str) -> DbResult<()> {
    let valid_chars = label
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    let leading_digit = label.starts_with(|c: char| c.is_ascii_digit());
    if valid_chars && !leading_digit {
        Ok(())
    } else {
        Err(DatabaseError::invalid_argument(format!(
            "invalid time step label {label:?}"
        )))
    }
}
