use std::collections::BTreeMap;

use criterion::{criterion_group, criterion_main, BatchSize, Criterion, Throughput};

use reactordb::special::{pack, unpack};
use reactordb::{
    CompositeTree, Database, DatabaseConfig, LoadOptions, Location, NdArray, OpenMode, ParamDef,
    ParamRegistry, ParamValue, TimeStep,
};

const OBJECTS: usize = 4096;

/// Pin power arrays of varying length with every seventh value missing.
fn jagged_values() -> Vec<Option<ParamValue>> {
    (0..OBJECTS)
        .map(|i| {
            if i % 7 == 0 {
                return None;
            }
            let len = 200 + i % 17;
            let pins = (0..len).map(|p| f64::from(u32::try_from(p + i).unwrap_or(0))).collect();
            Some(ParamValue::Array(NdArray::from_floats(pins)))
        })
        .collect()
}

fn mapping_values() -> Vec<Option<ParamValue>> {
    (0..OBJECTS)
        .map(|i| {
            let mut xs = BTreeMap::new();
            xs.insert("fast".to_string(), f64::from(u32::try_from(i).unwrap_or(0)));
            xs.insert("thermal".to_string(), 2.0);
            Some(ParamValue::Mapping(xs))
        })
        .collect()
}

fn bench_special(c: &mut Criterion) {
    let mut group = c.benchmark_group("special");
    group.throughput(Throughput::Elements(OBJECTS as u64));

    for (name, values) in [("jagged", jagged_values()), ("mapping", mapping_values())] {
        group.bench_function(format!("pack/{name}"), |b| {
            b.iter(|| pack(name, &values).unwrap());
        });

        let packed = pack(name, &values).unwrap().unwrap();
        group.bench_function(format!("unpack/{name}"), |b| {
            b.iter_batched(
                || packed.data.clone(),
                |data| unpack(name, data, &packed.shape, packed.meta.as_ref(), OBJECTS).unwrap(),
                BatchSize::LargeInput,
            );
        });
    }
    group.finish();
}

fn registry() -> ParamRegistry {
    let mut registry = ParamRegistry::new();
    registry
        .define("Assembly", ParamDef::new("power"))
        .define("Block", ParamDef::new("temp"))
        .define("Block", ParamDef::new("pinPowers"));
    registry
}

/// A core of 256 assemblies with 16 blocks each.
fn core() -> CompositeTree {
    let mut tree = CompositeTree::new("Core", "core");
    let root = tree.root();
    for a in 0..256_i64 {
        let assembly = tree.add_child(root, "Assembly", format!("A{a:04}"), Some(Location::index(a % 16, a / 16, 0)));
        tree.get_mut(assembly).set_param("power", 1.0e6);
        for k in 0..16_i64 {
            let block = tree.add_child(assembly, "Block", format!("A{a:04}B{k:02}"), Some(Location::index(0, 0, k)));
            let node = tree.get_mut(block);
            node.set_param("temp", 600.0);
            node.set_param("pinPowers", NdArray::from_floats(vec![1.0; 217]));
        }
    }
    tree
}

fn bench_database(c: &mut Criterion) {
    let tree = core();
    let mut group = c.benchmark_group("database");
    group.sample_size(20);
    group.throughput(Throughput::Elements(tree.len() as u64));

    group.bench_function("write_time_step", |b| {
        b.iter_batched(
            || {
                let dir = tempfile::tempdir().unwrap();
                let mut db = Database::new(
                    dir.path().join("bench.rxdb"),
                    OpenMode::Create,
                    registry(),
                    DatabaseConfig::default().without_sync(),
                )
                .unwrap();
                db.open().unwrap();
                (dir, db)
            },
            |(_dir, mut db)| db.write_time_step(&TimeStep::new(0, 0), &tree).unwrap(),
            BatchSize::PerIteration,
        );
    });

    let dir = tempfile::tempdir().unwrap();
    let mut db = Database::new(
        dir.path().join("bench.rxdb"),
        OpenMode::Create,
        registry(),
        DatabaseConfig::default().without_sync(),
    )
    .unwrap();
    db.open().unwrap();
    db.write_time_step(&TimeStep::new(0, 0), &tree).unwrap();

    group.bench_function("load_time_step", |b| {
        b.iter(|| {
            db.load_time_step(
                0,
                0,
                "",
                LoadOptions {
                    update_identity_counters: false,
                    ..LoadOptions::default()
                },
            )
            .unwrap()
        });
    });
    group.finish();
}

criterion_group!(benches, bench_special, bench_database);
criterion_main!(benches);
