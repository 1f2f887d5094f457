//! Parameter histories read back from a closed and reopened file.

mod common;

use reactordb::{LiveState, Location, OpenMode, ParamValue, TimeStep};
use tempfile::tempdir;

use common::{create, open, reactor};

fn float(value: &ParamValue) -> f64 {
    value.as_f64().unwrap()
}

#[test]
fn test_history_follows_object_through_shuffle() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("case.rxdb");
    let mut tree = reactor(1.0);
    let assemblies = tree.of_type("Assembly");
    let (first, last) = (assemblies[0], assemblies[2]);
    let first_serial = tree.get(first).serial();

    {
        let mut db = create(&path);
        db.write_time_step(&TimeStep::new(0, 0), &tree).unwrap();

        // Swap the first and last assembly between cycles.
        let a = tree.get(first).location.clone();
        let b = tree.get(last).location.clone();
        tree.get_mut(first).location = b;
        tree.get_mut(last).location = a;
        tree.get_mut(first).set_param("power", 7.0);
        tree.get_mut(last).set_param("power", 9.0);
        db.write_time_step(&TimeStep::new(1, 0), &tree).unwrap();
        db.close(Some(true)).unwrap();
    }

    let db = open(&path, OpenMode::Read);

    let history = db.get_history(first_serial, &["power", "flags"], None, None).unwrap();
    let powers: Vec<f64> = history["power"].values().map(float).collect();
    assert_eq!(powers, vec![1.0e6, 7.0]);
    assert_eq!(history["flags"].len(), 2);

    // The first position is occupied by the other assembly after the swap.
    let by_location = db
        .get_histories_by_location(&tree, &[last], &["power"], None, None)
        .unwrap();
    let powers: Vec<f64> = by_location[&last]["power"].values().map(float).collect();
    assert_eq!(powers, vec![1.0e6, 9.0]);
}

#[test]
fn test_history_includes_live_step() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("case.rxdb");
    let mut tree = reactor(1.0);
    let block = tree.of_type("Block")[0];
    let serial = tree.get(block).serial();

    let mut db = create(&path);
    db.write_time_step(&TimeStep::new(0, 0), &tree).unwrap();
    tree.get_mut(block).set_param("temp", 650.0);

    let live_step = TimeStep::new(0, 1);
    let live = LiveState {
        tree: &tree,
        time_step: &live_step,
    };
    let history = db.get_history(serial, &["temp"], None, Some(live)).unwrap();
    let temps: Vec<(TimeStep, f64)> = history["temp"]
        .iter()
        .map(|(ts, v)| (ts.clone(), float(v)))
        .collect();
    assert_eq!(temps, vec![(TimeStep::new(0, 0), 600.0), (live_step, 650.0)]);
}

#[test]
fn test_history_for_selected_steps_only() {
    let dir = tempdir().unwrap();
    let mut db = create(&dir.path().join("case.rxdb"));
    let mut tree = reactor(1.0);
    let root = tree.root();
    let serial = tree.get(root).serial();
    for node in 0..3_u32 {
        tree.get_mut(root).set_param("cycleLength", f64::from(node));
        db.write_time_step(&TimeStep::new(0, node), &tree).unwrap();
    }

    let wanted = [TimeStep::new(0, 2)];
    let history = db.get_history(serial, &["cycleLength"], Some(&wanted), None).unwrap();
    assert_eq!(history["cycleLength"].len(), 1);
    assert_eq!(history["cycleLength"][&wanted[0]], ParamValue::Float(2.0));

    let err = db
        .get_history(serial, &["cycleLength"], Some(&[TimeStep::new(4, 0)]), None)
        .unwrap_err();
    assert!(err.is_usage());
}

#[test]
fn test_location_history_of_blocks() {
    let dir = tempdir().unwrap();
    let mut db = create(&dir.path().join("case.rxdb"));
    let tree = reactor(1.0);
    db.write_time_step(&TimeStep::new(0, 0), &tree).unwrap();

    let blocks = tree.of_type("Block");
    let histories = db
        .get_histories_by_location(&tree, &blocks, &["temp"], None, None)
        .unwrap();
    assert_eq!(histories.len(), blocks.len());
    for &block in &blocks {
        let stored = &histories[&block]["temp"][&TimeStep::new(0, 0)];
        assert_eq!(Some(stored), tree.get(block).param("temp"));
    }

    // An address nobody occupies yields an empty history.
    let mut moved = tree.clone();
    moved.get_mut(blocks[0]).location = Some(Location::index(0, 0, 99));
    let histories = db
        .get_histories_by_location(&moved, &[blocks[0]], &["temp"], None, None)
        .unwrap();
    assert!(histories[&blocks[0]]["temp"].is_empty());
}
