//! Regression comparison of two databases.
//!
//! Two runs are comparable only if they stored exactly the same time steps.
//! Within each step the group structure is aligned first; names present on
//! one side only are structural differences. Matching datasets are then
//! diffed numerically with the relative difference
//! `(src - ref) / mean(src, ref)`, which stays finite where the reference
//! is zero. Specially formatted datasets compare their packing metadata
//! first and only diff values when it agrees.

mod report;

use std::collections::BTreeSet;
use std::path::Path;

use regex::Regex;

use crate::config::DatabaseConfig;
use crate::database::{resolved_attrs, Database, OpenMode, TimeStep};
use crate::error::{DatabaseError, DbResult};
use crate::layout::{IDENTITY_DATASETS, LAYOUT_GROUP};
use crate::registry::ParamRegistry;
use crate::special::{self, SpecialMeta};
use crate::storage::{join, Container, Dataset, NodeKind};
use crate::value::{ArrayData, ParamValue};

pub use report::{DatasetDiff, DiffReport, Side, StructuralDiff};

/// Separator of attribute sibling datasets; those are compared through
/// the attributes that reference them.
const SIBLING_MARKER: char = '@';

/// Options for [`compare_databases`].
#[derive(Debug, Clone)]
pub struct CompareOptions {
    /// Dataset keys (paths relative to the time-step group, such as
    /// `Block/power`) matching any of these are skipped.
    pub exclusions: Vec<Regex>,
    /// Largest absolute relative difference still considered equal.
    pub tolerance: f64,
}

impl Default for CompareOptions {
    fn default() -> Self {
        Self {
            exclusions: Vec::new(),
            tolerance: 0.01,
        }
    }
}

impl CompareOptions {
    #[must_use]
    pub fn with_tolerance(tolerance: f64) -> Self {
        Self {
            tolerance,
            ..Self::default()
        }
    }

    /// Adds an exclusion pattern.
    ///
    /// # Errors
    /// Returns an invalid-argument error if `pattern` is not a valid regex.
    pub fn exclude(mut self, pattern: &str) -> DbResult<Self> {
        let regex = Regex::new(pattern)
            .map_err(|e| DatabaseError::invalid_argument(format!("exclusion pattern {pattern:?}: {e}")))?;
        self.exclusions.push(regex);
        Ok(self)
    }

    fn is_excluded(&self, key: &str) -> bool {
        self.exclusions.iter().any(|r| r.is_match(key))
    }
}

/// Compares the source database against the reference.
///
/// Returns `None` when the two files do not store the same time steps.
///
/// # Example
///
/// ```no_run
/// use reactordb::compare::{compare_databases, CompareOptions};
///
/// let options = CompareOptions::with_tolerance(1e-6).exclude("^layout/")?;
/// match compare_databases("ref.rxdb", "src.rxdb", &options)? {
///     Some(report) if report.is_equivalent() => println!("pass"),
///     Some(report) => println!("{report}"),
///     None => println!("runs stored different time steps"),
/// }
/// # Ok::<(), reactordb::DatabaseError>(())
/// ```
///
/// # Errors
/// Returns errors from opening either file, or
/// [`IntegrityError::Corrupted`](crate::IntegrityError::Corrupted) if a
/// dataset fails to decode.
pub fn compare_databases(
    reference: impl AsRef<Path>,
    source: impl AsRef<Path>,
    options: &CompareOptions,
) -> DbResult<Option<DiffReport>> {
    let ref_db = open_read(reference.as_ref())?;
    let src_db = open_read(source.as_ref())?;

    let ref_steps = ref_db.time_steps()?;
    let src_steps = src_db.time_steps()?;
    if ref_steps != src_steps {
        tracing::warn!(
            reference = %reference.as_ref().display(),
            source = %source.as_ref().display(),
            ref_steps = ref_steps.len(),
            src_steps = src_steps.len(),
            "time steps differ; databases are not comparable"
        );
        return Ok(None);
    }

    let mut report = DiffReport::new(
        reference.as_ref().to_path_buf(),
        source.as_ref().to_path_buf(),
        options.tolerance,
        ref_steps.clone(),
    );
    let comparer = Comparer {
        reference: ref_db.container()?,
        source: src_db.container()?,
        options,
    };
    for ts in &ref_steps {
        comparer.compare_step(ts, &mut report)?;
        tracing::debug!(time_step = %ts, differences = report.count_differences(), "compared time step");
    }

    tracing::info!(
        time_steps = ref_steps.len(),
        differences = report.count_differences(),
        "compared databases"
    );
    Ok(Some(report))
}

fn open_read(path: &Path) -> DbResult<Database> {
    let mut db = Database::new(path, OpenMode::Read, ParamRegistry::new(), DatabaseConfig::default())?;
    db.open()?;
    Ok(db)
}

struct Comparer<'a> {
    reference: &'a Container,
    source: &'a Container,
    options: &'a CompareOptions,
}

impl Comparer<'_> {
    fn compare_step(&self, ts: &TimeStep, report: &mut DiffReport) -> DbResult<()> {
        let group = ts.group_name();
        self.compare_children(ts, &group, "", report)
    }

    /// Aligns the children of `<group>/<key>` and recurses into the common ones.
    fn compare_children(&self, ts: &TimeStep, group: &str, key: &str, report: &mut DiffReport) -> DbResult<()> {
        let path = if key.is_empty() { group.to_string() } else { join(group, key) };
        let names = |c: &Container| -> BTreeSet<String> {
            c.children(&path)
                .into_iter()
                .filter(|n| !n.contains(SIBLING_MARKER))
                .map(str::to_string)
                .collect()
        };
        let ref_names = names(self.reference);
        let src_names = names(self.source);

        for name in ref_names.symmetric_difference(&src_names) {
            let child = join(key, name);
            if self.options.is_excluded(&child) {
                continue;
            }
            let side = if ref_names.contains(name) { Side::Reference } else { Side::Source };
            report.structural.push(StructuralDiff {
                time_step: ts.clone(),
                key: child,
                side,
            });
        }

        for name in ref_names.intersection(&src_names) {
            let child = join(key, name);
            if self.options.is_excluded(&child) || is_identity(&child) {
                continue;
            }
            let child_path = join(group, &child);
            match (self.reference.kind(&child_path), self.source.kind(&child_path)) {
                (Some(NodeKind::Group), Some(NodeKind::Group)) => {
                    self.compare_children(ts, group, &child, report)?;
                }
                (Some(NodeKind::Dataset), Some(NodeKind::Dataset)) => {
                    if let Some(diff) = self.compare_dataset(ts, &child_path, child)? {
                        report.datasets.push(diff);
                    }
                }
                _ => report.structural.push(StructuralDiff {
                    time_step: ts.clone(),
                    key: child,
                    side: Side::Both,
                }),
            }
        }
        Ok(())
    }

    fn compare_dataset(&self, ts: &TimeStep, path: &str, key: String) -> DbResult<Option<DatasetDiff>> {
        let ref_meta = SpecialMeta::from_attrs(path, &resolved_attrs(self.reference, path)?)?;
        let src_meta = SpecialMeta::from_attrs(path, &resolved_attrs(self.source, path)?)?;
        let ref_ds = read(self.reference, path)?;
        let src_ds = read(self.source, path)?;

        let diffs = match (ref_meta, src_meta) {
            (None, None) => simple_diffs(&ref_ds, &src_ds),
            (Some(a), Some(b)) if a == b => special_diffs(path, ref_ds, src_ds, &a)?,
            _ => vec![f64::INFINITY],
        };
        Ok(summarize(ts, key, &diffs, self.options.tolerance))
    }
}

fn is_identity(key: &str) -> bool {
    key.strip_prefix(LAYOUT_GROUP)
        .and_then(|rest| rest.strip_prefix('/'))
        .is_some_and(|name| IDENTITY_DATASETS.contains(&name))
}

fn read(container: &Container, path: &str) -> DbResult<Dataset> {
    container
        .read(path)
        .map_err(|e| DatabaseError::from_read(path, e))
}

/// Relative difference of one cell.
///
/// Cells that agree, including two NaNs, give zero. A NaN on one side,
/// unequal infinities and a zero mean all give `+inf`, so the result is
/// never NaN.
#[allow(clippy::float_cmp)]
fn relative_diff(reference: f64, source: f64) -> f64 {
    if reference == source || (reference.is_nan() && source.is_nan()) {
        return 0.0;
    }
    let diff = (source - reference) / ((source + reference) / 2.0);
    if diff.is_finite() {
        diff
    } else {
        f64::INFINITY
    }
}

fn elementwise(reference: &ArrayData, source: &ArrayData) -> Vec<f64> {
    if reference.len() != source.len() {
        return vec![f64::INFINITY];
    }
    match (reference.to_f64(), source.to_f64()) {
        (Some(r), Some(s)) => r.iter().zip(&s).map(|(&a, &b)| relative_diff(a, b)).collect(),
        _ => (0..reference.len())
            .map(|i| {
                if reference.scalar_at(i) == source.scalar_at(i) {
                    0.0
                } else {
                    f64::INFINITY
                }
            })
            .collect(),
    }
}

fn simple_diffs(reference: &Dataset, source: &Dataset) -> Vec<f64> {
    if reference.shape != source.shape {
        return vec![f64::INFINITY];
    }
    elementwise(&reference.data, &source.data)
}

fn special_diffs(path: &str, reference: Dataset, source: Dataset, meta: &SpecialMeta) -> DbResult<Vec<f64>> {
    let count = object_count(&reference, meta);
    if count != object_count(&source, meta) {
        return Ok(vec![f64::INFINITY]);
    }
    let ref_values = special::unpack(path, reference.data, &reference.shape, Some(meta), count)?;
    let src_values = special::unpack(path, source.data, &source.shape, Some(meta), count)?;

    let mut diffs = Vec::new();
    for (r, s) in ref_values.iter().zip(&src_values) {
        match (r, s) {
            (None, None) => {}
            (Some(r), Some(s)) => diffs.extend(value_diffs(r, s)),
            _ => diffs.push(f64::INFINITY),
        }
    }
    Ok(diffs)
}

fn value_diffs(reference: &ParamValue, source: &ParamValue) -> Vec<f64> {
    if reference.shape() != source.shape() {
        return vec![f64::INFINITY];
    }
    if let (Some(r), Some(s)) = (reference.as_mapping(), source.as_mapping()) {
        if !r.keys().eq(s.keys()) {
            return vec![f64::INFINITY];
        }
    }
    elementwise(&reference.flatten(), &source.flatten())
}

/// Number of objects a special dataset describes.
fn object_count(dataset: &Dataset, meta: &SpecialMeta) -> usize {
    let present = match &meta.jagged {
        Some(jagged) => jagged.offsets.len(),
        None => dataset.shape.first().copied().unwrap_or(0),
    };
    present + meta.none_locations.len()
}

#[allow(clippy::cast_precision_loss)]
fn summarize(ts: &TimeStep, key: String, diffs: &[f64], tolerance: f64) -> Option<DatasetDiff> {
    if diffs.is_empty() {
        return None;
    }
    // NaN cells count as exceeding any tolerance.
    let exceeds = |d: f64| d.is_nan() || d.abs() > tolerance;
    let max_abs = diffs
        .iter()
        .map(|d| if d.is_nan() { f64::INFINITY } else { d.abs() })
        .fold(0.0_f64, f64::max);
    if max_abs <= tolerance {
        return None;
    }
    let n = diffs.len() as f64;
    Some(DatasetDiff {
        time_step: ts.clone(),
        key,
        mean: diffs.iter().sum::<f64>() / n,
        mean_abs: diffs.iter().map(|d| d.abs()).sum::<f64>() / n,
        max_abs,
        cells: diffs.iter().filter(|&&d| exceeds(d)).count(),
    })
}
