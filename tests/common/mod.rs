//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::Path;

use reactordb::{
    CompositeTree, Database, DatabaseConfig, Location, NdArray, OpenMode, ParamDef, ParamRegistry,
    ParamValue,
};

pub const ASSEMBLIES: i64 = 3;
pub const BLOCKS_PER_ASSEMBLY: i64 = 2;

/// Parameter definitions for the fixture reactor.
pub fn registry() -> ParamRegistry {
    let mut registry = ParamRegistry::new();
    registry
        .define("Reactor", ParamDef::new("cycleLength").with_units("days"))
        .define("Core", ParamDef::new("keff"))
        .define("Assembly", ParamDef::new("power").with_units("W"))
        .define("Assembly", ParamDef::new("flags").with_default(0_i64))
        .define("Assembly", ParamDef::new("scratch").transient())
        .define("Block", ParamDef::new("temp").with_units("K"))
        .define("Block", ParamDef::new("pinPowers"))
        .define("Block", ParamDef::new("xs"))
        .define("Block", ParamDef::new("burnup"))
        .define("Component", ParamDef::new("mass"));
    registry
}

pub fn config() -> DatabaseConfig {
    DatabaseConfig::default().without_sync()
}

/// Builds the fixture reactor; every value is derived from `seed`.
///
/// ```text
/// Reactor ── Core ─┬─ Assembly (0,0,0) ─┬─ Block (0,0,0) ── Component
///                  │                    └─ Block (0,0,1)
///                  ├─ Assembly (1,0,0) ── ...
///                  └─ Assembly (2,0,0) ── ...
/// ```
///
/// Pin power arrays differ in length between assemblies (jagged), only
/// even blocks carry burnup (missing values), and cross sections are
/// mappings.
pub fn reactor(seed: f64) -> CompositeTree {
    let mut tree = CompositeTree::new("Reactor", "reactor");
    let root = tree.root();
    tree.get_mut(root).set_param("cycleLength", 365.0 * seed);
    let core = tree.add_child(root, "Core", "core", None);
    tree.get_mut(core).set_param("keff", 1.0 + seed * 1e-3);

    let mut block_count = 0_i64;
    for a in 0..ASSEMBLIES {
        let assembly = tree.add_child(core, "Assembly", format!("A{a:04}"), Some(Location::index(a, 0, 0)));
        #[allow(clippy::cast_precision_loss)]
        let af = a as f64;
        let node = tree.get_mut(assembly);
        node.set_param("power", seed * 1.0e6 * (1.0 + af));
        node.set_param("flags", a);
        node.set_param("scratch", -1.0);

        for k in 0..BLOCKS_PER_ASSEMBLY {
            let block = tree.add_child(assembly, "Block", format!("A{a:04}B{k}"), Some(Location::index(0, 0, k)));
            #[allow(clippy::cast_precision_loss)]
            let kf = k as f64;
            let pins = (0..3 + a).map(|p| {
                #[allow(clippy::cast_precision_loss)]
                let pf = p as f64;
                seed * (1.0 + 0.1 * pf + af + 0.01 * kf)
            });
            let mut xs = BTreeMap::new();
            xs.insert("fast".to_string(), seed * (2.0 + kf));
            xs.insert("thermal".to_string(), seed * (10.0 + af));

            let node = tree.get_mut(block);
            node.set_param("temp", 600.0 + seed * (af + kf));
            node.set_param("pinPowers", NdArray::from_floats(pins.collect()));
            node.set_param("xs", xs);
            if block_count % 2 == 0 {
                node.set_param("burnup", seed * 10.0);
            }
            block_count += 1;

            if a == 0 && k == 0 {
                let component = tree.add_child(block, "Component", "fuel", Some(Location::coord(0.5, 0.5, 0.0)));
                tree.get_mut(component).set_param("mass", seed * 3.5);
            }
        }
    }
    tree
}

pub fn create(path: &Path) -> Database {
    open(path, OpenMode::Create)
}

pub fn open(path: &Path, mode: OpenMode) -> Database {
    let mut db = Database::new(path, mode, registry(), config()).unwrap();
    db.open().unwrap();
    db
}

/// The tree as the database is expected to return it: transient
/// parameters are not persisted.
pub fn persisted_view(tree: &CompositeTree) -> CompositeTree {
    let mut tree = tree.clone();
    for id in tree.of_type("Assembly") {
        tree.get_mut(id).clear_param("scratch");
    }
    tree
}

/// Asserts both trees have the same structure, identities and values.
pub fn assert_trees_equal(expected: &CompositeTree, actual: &CompositeTree) {
    let e = expected.pre_order();
    let a = actual.pre_order();
    assert_eq!(e.len(), a.len(), "object count");
    for (&ei, &ai) in e.iter().zip(&a) {
        let (en, an) = (expected.get(ei), actual.get(ai));
        assert_eq!(en.type_name, an.type_name);
        assert_eq!(en.name, an.name);
        assert_eq!(en.serial(), an.serial(), "serial of {}", en.name);
        assert_eq!(en.location, an.location, "location of {}", en.name);
        assert_eq!(en.params(), an.params(), "params of {}", en.name);
        assert_eq!(en.children().len(), an.children().len(), "children of {}", en.name);
    }
}

/// Value of `param` on the `index`-th object of `type_name`.
pub fn param<'t>(tree: &'t CompositeTree, type_name: &str, index: usize, param: &str) -> Option<&'t ParamValue> {
    tree.get(tree.of_type(type_name)[index]).param(param)
}
