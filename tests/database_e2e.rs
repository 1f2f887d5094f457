//! End-to-end tests of writing, reopening and loading databases.

mod common;

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;

use reactordb::storage::{AttrValue, Attributes, Dataset};
use reactordb::{
    ArrayData, DatabaseError, Inputs, IntegrityError, LoadOptions, OpenMode, ParamValue, SchemaVersion,
    TimeStep, UsageError,
};
use tempfile::tempdir;

use common::{assert_trees_equal, create, open, param, persisted_view, reactor};

#[test]
fn test_write_close_reopen_load() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("case.rxdb");
    let first = reactor(1.0);
    let second = reactor(2.0);
    let inputs = Inputs {
        settings: b"settings: {cycles: 2}".to_vec(),
        blueprints: b"blueprints: {}".to_vec(),
        geometry: Some(b"<reactor/>".to_vec()),
    };

    {
        let mut db = create(&path);
        db.write_inputs(&inputs).unwrap();
        db.write_time_step(&TimeStep::new(0, 0), &first).unwrap();
        db.write_time_step(&TimeStep::new(1, 0), &second).unwrap();
        db.close(Some(true)).unwrap();
    }

    let db = open(&path, OpenMode::Read);
    assert_eq!(db.time_steps().unwrap(), vec![TimeStep::new(0, 0), TimeStep::new(1, 0)]);
    assert_eq!(db.read_inputs().unwrap(), Some(inputs));

    let loaded = db.load_time_step(0, 0, "", LoadOptions::default()).unwrap();
    assert_trees_equal(&persisted_view(&first), &loaded);
    let loaded = db.load_time_step(1, 0, "", LoadOptions::default()).unwrap();
    assert_trees_equal(&persisted_view(&second), &loaded);

    // Enumeration is re-iterable from the same handle.
    assert_eq!(db.time_steps().unwrap(), db.time_steps().unwrap());
}

#[test]
fn test_duplicate_write_keeps_only_second() {
    let dir = tempdir().unwrap();
    let mut db = create(&dir.path().join("case.rxdb"));
    let ts = TimeStep::new(0, 0);

    db.write_time_step(&ts, &reactor(1.0)).unwrap();

    let mut rewrite = reactor(3.0);
    for id in rewrite.of_type("Block") {
        rewrite.get_mut(id).clear_param("burnup");
    }
    db.write_time_step(&ts, &rewrite).unwrap();

    assert_eq!(db.time_steps().unwrap(), vec![ts.clone()]);
    let loaded = db.load(&ts, LoadOptions::default()).unwrap();
    assert_trees_equal(&persisted_view(&rewrite), &loaded);
    assert!(param(&loaded, "Block", 0, "burnup").is_none());
}

#[test]
fn test_negative_node_matches_last_node() {
    let dir = tempdir().unwrap();
    let mut db = create(&dir.path().join("case.rxdb"));
    for node in 0..3 {
        db.write_time_step(&TimeStep::new(0, node), &reactor(f64::from(node) + 1.0))
            .unwrap();
    }

    let last = db.load_time_step(0, 2, "", LoadOptions::default()).unwrap();
    let from_end = db.load_time_step(0, -1, "", LoadOptions::default()).unwrap();
    assert_trees_equal(&last, &from_end);

    let err = db.load_time_step(0, -4, "", LoadOptions::default()).unwrap_err();
    assert!(err.is_invalid_argument(), "{err}");
}

#[test]
fn test_labelled_steps_enumerate_in_order() {
    let dir = tempdir().unwrap();
    let mut db = create(&dir.path().join("case.rxdb"));
    let eoc = TimeStep::with_label(0, 1, "EOC").unwrap();
    db.write_time_step(&TimeStep::new(1, 0), &reactor(1.0)).unwrap();
    db.write_time_step(&eoc, &reactor(1.0)).unwrap();
    db.write_time_step(&TimeStep::new(0, 1), &reactor(1.0)).unwrap();

    assert_eq!(
        db.time_steps().unwrap(),
        vec![TimeStep::new(0, 1), eoc.clone(), TimeStep::new(1, 0)]
    );
    assert_eq!(db.resolve_time_step(0, -1, "EOC").unwrap(), eoc);
}

#[test]
fn test_torn_tail_is_discarded_on_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("case.rxdb");
    let tree = reactor(1.0);
    {
        let mut db = create(&path);
        db.write_time_step(&TimeStep::new(0, 0), &tree).unwrap();
        db.close(Some(true)).unwrap();
    }
    let intact = fs::metadata(&path).unwrap().len();

    // Simulate a crash mid-append.
    {
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[0x2a, 0, 0, 0, 0xde, 0xad, 0xbe]).unwrap();
    }

    let reader = open(&path, OpenMode::Read);
    let loaded = reader.load_time_step(0, 0, "", LoadOptions::default()).unwrap();
    assert_trees_equal(&persisted_view(&tree), &loaded);
    drop(reader);

    let mut writer = open(&path, OpenMode::ReadWrite);
    assert_eq!(fs::metadata(&path).unwrap().len(), intact);
    writer.write_time_step(&TimeStep::new(0, 1), &tree).unwrap();
    assert_eq!(writer.time_steps().unwrap().len(), 2);
}

#[test]
fn test_damaged_body_is_reported() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("case.rxdb");
    {
        let mut db = create(&path);
        db.write_time_step(&TimeStep::new(0, 0), &reactor(1.0)).unwrap();
        db.close(Some(true)).unwrap();
    }

    // Flip one byte in the middle of a copy; the time-step transaction
    // spans most of the file.
    let bytes = fs::read(&path).unwrap();
    let mut damaged = bytes.clone();
    let middle = bytes.len() / 2;
    damaged[middle] ^= 0xff;
    let copy = dir.path().join("damaged.rxdb");
    fs::write(&copy, damaged).unwrap();

    let result = reactordb::Database::new(&copy, OpenMode::Read, common::registry(), common::config())
        .and_then(|mut db| {
            db.open()?;
            db.load_time_step(0, 0, "", LoadOptions::default()).map(|_| ())
        });
    // Either the damaged record is dropped during replay (and the step with
    // it), or the damaged payload is reported when read.
    match result {
        Ok(()) => panic!("damaged file loaded cleanly"),
        Err(err) => assert!(
            err.is_integrity()
                || matches!(err, DatabaseError::Usage(UsageError::TimeStepNotFound { .. }))
                || err.is_schema(),
            "{err}"
        ),
    }
}

#[test]
fn test_non_finite_attributes_keep_later_steps() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("case.rxdb");
    let tree = reactor(1.0);
    let first = TimeStep::new(0, 0);

    let mut attrs = Attributes::new();
    attrs.insert("keff".to_string(), AttrValue::Float(f64::NAN));
    attrs.insert("peak".to_string(), AttrValue::Float(f64::INFINITY));
    attrs.insert("bounds".to_string(), AttrValue::FloatArray(vec![f64::NEG_INFINITY, 1.0]));
    let mut datasets = BTreeMap::new();
    datasets.insert(
        "search".to_string(),
        Dataset::vector(ArrayData::Float(vec![f64::NAN, 2.0])).with_attrs(attrs),
    );

    {
        let mut db = create(&path);
        db.write_time_step(&first, &tree).unwrap();
        db.write_auxiliary(&first, "criticality", &datasets).unwrap();
        db.write_time_step(&TimeStep::new(0, 1), &tree).unwrap();
        db.write_time_step(&TimeStep::new(0, 2), &tree).unwrap();
        db.close(Some(true)).unwrap();
    }
    let written = fs::metadata(&path).unwrap().len();

    let db = open(&path, OpenMode::ReadWrite);
    assert_eq!(fs::metadata(&path).unwrap().len(), written);
    assert_eq!(
        db.time_steps().unwrap(),
        vec![first.clone(), TimeStep::new(0, 1), TimeStep::new(0, 2)]
    );

    let stored = db.read_auxiliary(&first, "criticality").unwrap().unwrap();
    let search = &stored["search"];
    assert!(matches!(search.attrs["keff"], AttrValue::Float(v) if v.is_nan()));
    assert_eq!(search.attrs["peak"], AttrValue::Float(f64::INFINITY));
    assert_eq!(search.attrs["bounds"], AttrValue::FloatArray(vec![f64::NEG_INFINITY, 1.0]));
}

#[test]
fn test_damage_ahead_of_committed_steps_is_fatal() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("case.rxdb");
    {
        let mut db = create(&path);
        db.write_time_step(&TimeStep::new(0, 0), &reactor(1.0)).unwrap();
        db.write_time_step(&TimeStep::new(0, 1), &reactor(2.0)).unwrap();
        db.close(Some(true)).unwrap();
    }

    // The first record after the file header starts at byte 5; its JSON
    // body starts at byte 10.
    let mut bytes = fs::read(&path).unwrap();
    bytes[12] ^= 0x20;
    fs::write(&path, &bytes).unwrap();

    let err = reactordb::Database::new(&path, OpenMode::ReadWrite, common::registry(), common::config())
        .and_then(|mut db| db.open())
        .unwrap_err();
    assert!(
        matches!(err, DatabaseError::Integrity(IntegrityError::Corrupted { .. })),
        "{err}"
    );
    assert_eq!(fs::read(&path).unwrap(), bytes);
}

#[test]
fn test_unknown_parameter_requires_allow_missing() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("case.rxdb");
    create(&path).write_time_step(&TimeStep::new(0, 0), &reactor(1.0)).unwrap();

    let full = common::registry();
    let mut narrow = reactordb::ParamRegistry::new();
    for type_name in ["Reactor", "Core", "Assembly", "Block", "Component"] {
        for def in full.params(type_name).filter(|d| d.name != "xs") {
            narrow.define(type_name, def.clone());
        }
    }
    let mut db = reactordb::Database::new(&path, OpenMode::Read, narrow, common::config()).unwrap();
    db.open().unwrap();

    let err = db.load_time_step(0, 0, "", LoadOptions::default()).unwrap_err();
    assert!(matches!(
        err,
        DatabaseError::Integrity(IntegrityError::UnknownParameter { ref param, .. }) if param == "xs"
    ));

    let tree = db
        .load_time_step(
            0,
            0,
            "",
            LoadOptions {
                allow_missing: true,
                update_identity_counters: false,
            },
        )
        .unwrap();
    assert!(param(&tree, "Block", 0, "xs").is_none());
    assert!(param(&tree, "Block", 0, "temp").is_some());
}

#[test]
fn test_older_schema_minor_roundtrip() {
    let dir = tempdir().unwrap();
    for version in [SchemaVersion::new(3, 0), SchemaVersion::new(3, 2), SchemaVersion::CURRENT] {
        let path = dir.path().join(format!("v{version}.rxdb"));
        let mut config = common::config();
        config.schema_version = version;
        config.large_attr_threshold = 1;
        let tree = reactor(1.5);
        {
            let mut db = reactordb::Database::new(&path, OpenMode::Create, common::registry(), config).unwrap();
            db.open().unwrap();
            db.write_time_step(&TimeStep::new(0, 0), &tree).unwrap();
        }

        let db = open(&path, OpenMode::Read);
        assert_eq!(db.version(), version);
        let loaded = db.load_time_step(0, 0, "", LoadOptions::default()).unwrap();
        assert_trees_equal(&persisted_view(&tree), &loaded);
    }
}

#[test]
fn test_load_snapshot_helper() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("case.rxdb");
    {
        let mut db = create(&path);
        db.write_inputs(&Inputs {
            settings: b"s".to_vec(),
            blueprints: b"b".to_vec(),
            geometry: None,
        })
        .unwrap();
        db.write_time_step(&TimeStep::new(0, 0), &reactor(1.0)).unwrap();
        db.write_time_step(&TimeStep::new(0, 1), &reactor(2.0)).unwrap();
    }

    let snapshot = reactordb::load_snapshot(&path, common::registry(), 0, -1).unwrap();
    assert_eq!(snapshot.time_step, TimeStep::new(0, 1));
    assert_eq!(snapshot.inputs.unwrap().settings, b"s".to_vec());
    assert_eq!(
        param(&snapshot.tree, "Assembly", 0, "power"),
        Some(&ParamValue::Float(2.0e6))
    );
}

#[test]
fn test_compact_preserves_contents() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("case.rxdb");
    let mut db = create(&path);
    let ts = TimeStep::new(0, 0);
    for seed in 1..=4 {
        db.write_time_step(&ts, &reactor(f64::from(seed))).unwrap();
    }

    let reclaimed = db.compact().unwrap();
    assert!(reclaimed > 0);
    let loaded = db.load(&ts, LoadOptions::default()).unwrap();
    assert_trees_equal(&persisted_view(&reactor(4.0)), &loaded);
}
