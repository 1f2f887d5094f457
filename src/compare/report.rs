//! Accumulated comparison results.

use std::fmt;
use std::path::PathBuf;

use serde::Serialize;

use crate::database::TimeStep;

/// Which file a structural mismatch was found in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    /// Present in the reference file only.
    Reference,
    /// Present in the source file only.
    Source,
    /// Present in both, as a group in one and a dataset in the other.
    Both,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Reference => "ref only",
            Self::Source => "src only",
            Self::Both => "kind differs",
        })
    }
}

/// A group or dataset present on one side only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StructuralDiff {
    pub time_step: TimeStep,
    /// Path relative to the time-step group.
    pub key: String,
    pub side: Side,
}

/// Relative differences of one dataset that exceeded the tolerance.
///
/// Relative differences are `(src - ref) / mean(src, ref)`. Cells that
/// cannot be compared (shape or metadata mismatch, a value on one side only)
/// count as infinite.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatasetDiff {
    pub time_step: TimeStep,
    /// Path relative to the time-step group, e.g. `Block/power`.
    pub key: String,
    pub mean: f64,
    pub mean_abs: f64,
    pub max_abs: f64,
    /// Number of cells whose absolute relative difference exceeds the
    /// tolerance.
    pub cells: usize,
}

/// Outcome of comparing two databases with identical time steps.
#[derive(Debug, Clone, Serialize)]
pub struct DiffReport {
    pub reference: PathBuf,
    pub source: PathBuf,
    pub tolerance: f64,
    pub time_steps: Vec<TimeStep>,
    pub datasets: Vec<DatasetDiff>,
    pub structural: Vec<StructuralDiff>,
}

impl DiffReport {
    pub(crate) fn new(reference: PathBuf, source: PathBuf, tolerance: f64, time_steps: Vec<TimeStep>) -> Self {
        Self {
            reference,
            source,
            tolerance,
            time_steps,
            datasets: Vec::new(),
            structural: Vec::new(),
        }
    }

    /// Tolerance-exceeding cells plus structural mismatches.
    ///
    /// Zero means the outputs are equivalent under the tolerance.
    #[must_use]
    pub fn count_differences(&self) -> usize {
        self.datasets.iter().map(|d| d.cells).sum::<usize>() + self.structural.len()
    }

    #[must_use]
    pub fn is_equivalent(&self) -> bool {
        self.count_differences() == 0
    }

    /// Keys of every differing dataset or structural mismatch at `ts`.
    #[must_use]
    pub fn differing_keys(&self, ts: &TimeStep) -> Vec<&str> {
        let mut keys: Vec<&str> = self
            .datasets
            .iter()
            .filter(|d| &d.time_step == ts)
            .map(|d| d.key.as_str())
            .chain(
                self.structural
                    .iter()
                    .filter(|s| &s.time_step == ts)
                    .map(|s| s.key.as_str()),
            )
            .collect();
        keys.sort_unstable();
        keys.dedup();
        keys
    }
}

impl fmt::Display for DiffReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "ref: {}", self.reference.display())?;
        writeln!(f, "src: {}", self.source.display())?;
        writeln!(
            f,
            "{} time steps compared, tolerance {}, {} differences",
            self.time_steps.len(),
            self.tolerance,
            self.count_differences()
        )?;

        if !self.datasets.is_empty() {
            writeln!(f)?;
            writeln!(
                f,
                "{:<10} {:<40} {:>12} {:>12} {:>12} {:>8}",
                "step", "dataset", "mean", "mean abs", "max abs", "cells"
            )?;
            for d in &self.datasets {
                writeln!(
                    f,
                    "{:<10} {:<40} {:>12.4e} {:>12.4e} {:>12.4e} {:>8}",
                    d.time_step.to_string(),
                    d.key,
                    d.mean,
                    d.mean_abs,
                    d.max_abs,
                    d.cells
                )?;
            }
        }

        if !self.structural.is_empty() {
            writeln!(f)?;
            writeln!(f, "{:<10} {:<40} {}", "step", "structure", "")?;
            for s in &self.structural {
                writeln!(f, "{:<10} {:<40} {}", s.time_step.to_string(), s.key, s.side)?;
            }
        }
        Ok(())
    }
}
