//! Regression comparison between database files.

mod common;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use reactordb::compare::Side;
use reactordb::storage::Dataset;
use reactordb::{compare_databases, ArrayData, CompareOptions, CompositeTree, NdArray, ParamValue, TimeStep};
use tempfile::{tempdir, TempDir};

use common::{create, reactor};

const TOLERANCE: f64 = 0.01;

fn steps() -> [TimeStep; 2] {
    [TimeStep::new(0, 0), TimeStep::new(0, 1)]
}

/// Writes one file storing `tree_for(step index)` at every step.
fn write_db(dir: &TempDir, name: &str, tree_for: impl Fn(usize) -> CompositeTree) -> PathBuf {
    let path = dir.path().join(name);
    let mut db = create(&path);
    for (i, ts) in steps().iter().enumerate() {
        db.write_time_step(ts, &tree_for(i)).unwrap();
    }
    db.close(Some(true)).unwrap();
    path
}

fn seeded(i: usize) -> CompositeTree {
    reactor(if i == 0 { 1.0 } else { 2.0 })
}

fn scale_power(mut tree: CompositeTree, factor: f64) -> CompositeTree {
    for id in tree.of_type("Assembly") {
        let node = tree.get_mut(id);
        let power = node.param("power").and_then(ParamValue::as_f64).unwrap();
        node.set_param("power", power * factor);
    }
    tree
}

fn compare(reference: &Path, source: &Path, options: &CompareOptions) -> reactordb::DiffReport {
    compare_databases(reference, source, options)
        .unwrap()
        .expect("same time steps")
}

#[test]
fn test_self_comparison_is_clean() {
    let dir = tempdir().unwrap();
    let path = write_db(&dir, "ref.rxdb", seeded);

    let report = compare(&path, &path, &CompareOptions::with_tolerance(0.0));
    assert_eq!(report.count_differences(), 0, "{report}");
    assert_eq!(report.time_steps, steps().to_vec());
}

#[test]
fn test_rebuilt_run_is_equivalent() {
    // Serial numbers differ between the runs; identity datasets are skipped.
    let dir = tempdir().unwrap();
    let reference = write_db(&dir, "ref.rxdb", seeded);
    let source = write_db(&dir, "src.rxdb", seeded);

    let report = compare(&reference, &source, &CompareOptions::with_tolerance(0.0));
    assert!(report.is_equivalent(), "{report}");
}

#[test]
fn test_tolerance_boundary() {
    let dir = tempdir().unwrap();
    let reference = write_db(&dir, "ref.rxdb", seeded);
    let over = write_db(&dir, "over.rxdb", |i| scale_power(seeded(i), 1.0 + 2.0 * TOLERANCE));
    let under = write_db(&dir, "under.rxdb", |i| scale_power(seeded(i), 1.0 + TOLERANCE / 2.0));
    let options = CompareOptions::with_tolerance(TOLERANCE);

    let report = compare(&reference, &over, &options);
    assert!(report.count_differences() > 0);
    for ts in steps() {
        assert_eq!(report.differing_keys(&ts), vec!["Assembly/power"]);
    }
    let diff = &report.datasets[0];
    assert_eq!(diff.cells, common::ASSEMBLIES as usize);
    assert!(diff.max_abs > TOLERANCE && diff.max_abs < 2.0 * TOLERANCE);

    let report = compare(&reference, &under, &options);
    assert!(report.is_equivalent(), "{report}");
}

#[test]
fn test_different_steps_are_not_comparable() {
    let dir = tempdir().unwrap();
    let reference = write_db(&dir, "ref.rxdb", seeded);

    let source = dir.path().join("short.rxdb");
    let mut db = create(&source);
    db.write_time_step(&TimeStep::new(0, 0), &seeded(0)).unwrap();
    db.close(Some(true)).unwrap();

    let result = compare_databases(&reference, &source, &CompareOptions::default()).unwrap();
    assert!(result.is_none());
}

#[test]
fn test_auxiliary_group_on_one_side_is_structural() {
    let dir = tempdir().unwrap();
    let reference = write_db(&dir, "ref.rxdb", seeded);
    let source = write_db(&dir, "src.rxdb", seeded);
    {
        let mut db = common::open(&source, reactordb::OpenMode::ReadWrite);
        let mut datasets = BTreeMap::new();
        datasets.insert(
            "peakTemperature".to_string(),
            Dataset::vector(ArrayData::Float(vec![910.0, 905.5])),
        );
        db.write_auxiliary(&TimeStep::new(0, 1), "thermal", &datasets).unwrap();
        db.close(Some(true)).unwrap();
    }

    let report = compare(&reference, &source, &CompareOptions::default());
    assert_eq!(report.count_differences(), 1, "{report}");
    assert_eq!(report.structural[0].key, "thermal");
    assert_eq!(report.structural[0].side, Side::Source);
    assert!(report.differing_keys(&TimeStep::new(0, 0)).is_empty());

    // Reversed, the group is on the reference side.
    let report = compare(&source, &reference, &CompareOptions::default());
    assert_eq!(report.structural[0].side, Side::Reference);
}

#[test]
fn test_exclusions_suppress_differences() {
    let dir = tempdir().unwrap();
    let reference = write_db(&dir, "ref.rxdb", seeded);
    let source = write_db(&dir, "src.rxdb", |i| scale_power(seeded(i), 1.5));

    let options = CompareOptions::with_tolerance(TOLERANCE)
        .exclude("^Assembly/power$")
        .unwrap();
    let report = compare(&reference, &source, &options);
    assert!(report.is_equivalent(), "{report}");
}

#[test]
fn test_jagged_value_change_is_detected() {
    let dir = tempdir().unwrap();
    let reference = write_db(&dir, "ref.rxdb", seeded);
    let source = write_db(&dir, "src.rxdb", |i| {
        let mut tree = seeded(i);
        let last = *tree.of_type("Block").last().unwrap();
        let node = tree.get_mut(last);
        let mut pins = node
            .param("pinPowers")
            .and_then(ParamValue::as_array)
            .and_then(|a| a.data().to_f64())
            .unwrap();
        pins[0] *= 1.1;
        node.set_param("pinPowers", NdArray::from_floats(pins));
        tree
    });

    let report = compare(&reference, &source, &CompareOptions::with_tolerance(TOLERANCE));
    for ts in steps() {
        assert_eq!(report.differing_keys(&ts), vec!["Block/pinPowers"]);
    }
    assert!(report.datasets.iter().all(|d| d.cells == 1 && d.max_abs.is_finite()));
}

#[test]
fn test_missing_values_on_one_side_are_infinite() {
    let dir = tempdir().unwrap();
    let reference = write_db(&dir, "ref.rxdb", seeded);
    let source = write_db(&dir, "src.rxdb", |i| {
        let mut tree = seeded(i);
        let second = tree.of_type("Block")[1];
        tree.get_mut(second).set_param("burnup", 1.0);
        tree
    });

    let report = compare(&reference, &source, &CompareOptions::with_tolerance(TOLERANCE));
    for ts in steps() {
        assert_eq!(report.differing_keys(&ts), vec!["Block/burnup"]);
    }
    assert!(report.datasets.iter().all(|d| d.max_abs.is_infinite()));
}

#[test]
fn test_non_finite_source_values_are_reported() {
    let dir = tempdir().unwrap();
    let reference = write_db(&dir, "ref.rxdb", seeded);
    let source = write_db(&dir, "src.rxdb", |i| {
        let mut tree = seeded(i);
        let assemblies = tree.of_type("Assembly");
        tree.get_mut(assemblies[0]).set_param("power", f64::NAN);
        tree.get_mut(assemblies[1]).set_param("power", f64::INFINITY);
        tree
    });

    let report = compare(&reference, &source, &CompareOptions::with_tolerance(TOLERANCE));
    assert_eq!(report.count_differences(), 2 * steps().len(), "{report}");
    for ts in steps() {
        assert_eq!(report.differing_keys(&ts), vec!["Assembly/power"]);
    }
    assert!(report.datasets.iter().all(|d| d.cells == 2 && d.max_abs.is_infinite()));
}
