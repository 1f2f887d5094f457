//! Moving time steps between files: merging history, copying and splitting.

mod common;

use std::path::Path;

use reactordb::{Database, Inputs, LoadOptions, OpenMode, SchemaVersion, TimeStep};
use tempfile::tempdir;

use common::{assert_trees_equal, open, reactor};

/// A file storing cycles 0 and 1 with two nodes each; attributes of two
/// or more elements live in sibling datasets.
fn write_source(path: &Path) {
    let mut config = common::config();
    config.large_attr_threshold = 1;
    let mut db = Database::new(path, OpenMode::Create, common::registry(), config).unwrap();
    db.open().unwrap();
    db.write_inputs(&Inputs {
        settings: b"cycles: 2".to_vec(),
        blueprints: b"{}".to_vec(),
        geometry: None,
    })
    .unwrap();
    for cycle in 0..2_u32 {
        for node in 0..2_u32 {
            let seed = f64::from(cycle * 2 + node + 1);
            db.write_time_step(&TimeStep::new(cycle, node), &reactor(seed)).unwrap();
        }
    }
    db.close(Some(true)).unwrap();
}

fn load(db: &Database, ts: &TimeStep) -> reactordb::CompositeTree {
    db.load(ts, LoadOptions::default()).unwrap()
}

#[test]
fn test_merge_history_before_restart_point() {
    let dir = tempdir().unwrap();
    let source_path = dir.path().join("source.rxdb");
    write_source(&source_path);
    let source = open(&source_path, OpenMode::Read);

    let mut target = common::create(&dir.path().join("restart.rxdb"));
    let copied = target.merge_history(&source, 1, 0).unwrap();
    assert_eq!(copied, 2);
    assert_eq!(
        target.time_steps().unwrap(),
        vec![TimeStep::new(0, 0), TimeStep::new(0, 1)]
    );
    for ts in target.time_steps().unwrap() {
        assert_trees_equal(&load(&source, &ts), &load(&target, &ts));
    }
    assert_eq!(target.read_inputs().unwrap(), source.read_inputs().unwrap());
}

#[test]
fn test_merge_keeps_existing_inputs() {
    let dir = tempdir().unwrap();
    let source_path = dir.path().join("source.rxdb");
    write_source(&source_path);
    let source = open(&source_path, OpenMode::Read);

    let mut target = common::create(&dir.path().join("restart.rxdb"));
    let own = Inputs {
        settings: b"restart".to_vec(),
        blueprints: b"{}".to_vec(),
        geometry: None,
    };
    target.write_inputs(&own).unwrap();
    target.merge_history(&source, 0, 1).unwrap();
    assert_eq!(target.read_inputs().unwrap(), Some(own));
    assert_eq!(target.time_steps().unwrap(), vec![TimeStep::new(0, 0)]);
}

#[test]
fn test_copy_time_step_keeps_attribute_references() {
    let dir = tempdir().unwrap();
    let source_path = dir.path().join("source.rxdb");
    write_source(&source_path);
    let source = open(&source_path, OpenMode::Read);

    let mut target = common::create(&dir.path().join("target.rxdb"));
    let from = TimeStep::new(1, 1);
    let to = TimeStep::with_label(5, 0, "copy").unwrap();
    target.copy_time_step_from(&source, &from, &to).unwrap();

    assert_eq!(target.time_steps().unwrap(), vec![to.clone()]);
    assert_trees_equal(&load(&source, &from), &load(&target, &to));

    let err = target
        .copy_time_step_from(&source, &TimeStep::new(9, 9), &to)
        .unwrap_err();
    assert!(err.is_usage());
}

#[test]
fn test_split_database() {
    let dir = tempdir().unwrap();
    let source_path = dir.path().join("source.rxdb");
    write_source(&source_path);
    let source = open(&source_path, OpenMode::Read);

    let wanted = [TimeStep::new(0, 1), TimeStep::new(1, 1)];
    let split_path = source.split_database(&wanted, "eoc").unwrap();
    assert_eq!(split_path, dir.path().join("source-eoc.rxdb"));

    let split = open(&split_path, OpenMode::Read);
    assert_eq!(split.version(), SchemaVersion::CURRENT);
    assert_eq!(split.time_steps().unwrap(), wanted.to_vec());
    assert_eq!(split.read_inputs().unwrap(), source.read_inputs().unwrap());
    for ts in &wanted {
        assert_trees_equal(&load(&source, ts), &load(&split, ts));
    }

    assert!(source.split_database(&wanted, "").unwrap_err().is_invalid_argument());
    assert!(source
        .split_database(&[TimeStep::new(3, 0)], "late")
        .unwrap_err()
        .is_usage());
}
