//! # ReactorDB - Versioned State Database for Reactor Simulations
//!
//! ReactorDB persists the composite object tree of a reactor simulation
//! (reactor → core → assemblies → blocks → components) at discrete time
//! steps into one file, reconstructs it exactly, answers parameter
//! time-series queries, and compares two files for regression testing.
//!
//! ## Core Concepts
//!
//! - **CompositeTree**: the live object tree; parameters are tagged
//!   [`ParamValue`]s
//! - **TimeStep**: a (cycle, node, label) key; each one is a group in the file
//! - **Layout**: the pre-order structural index from which parentage is rebuilt
//! - **Special data**: ragged, partially missing or mapping-valued parameters,
//!   packed with a side-car metadata envelope
//! - **SchemaVersion**: threaded through every version-dependent decode
//!
//! ## Usage
//!
//! ```no_run
//! use reactordb::{
//!     CompositeTree, Database, DatabaseConfig, LoadOptions, Location, OpenMode, ParamDef,
//!     ParamRegistry, TimeStep,
//! };
//!
//! let mut registry = ParamRegistry::new();
//! registry.define("Assembly", ParamDef::new("power").with_units("W"));
//!
//! let mut tree = CompositeTree::new("Core", "core");
//! let assembly = tree.add_child(tree.root(), "Assembly", "A0001", Some(Location::index(0, 0, 0)));
//! tree.get_mut(assembly).set_param("power", 1.2e6);
//!
//! let mut db = Database::new("case.rxdb", OpenMode::Create, registry, DatabaseConfig::default())?;
//! db.open()?;
//! db.write_time_step(&TimeStep::new(0, 0), &tree)?;
//! let loaded = db.load_time_step(0, -1, "", LoadOptions::default())?;
//! db.close(Some(true))?;
//! # Ok::<(), reactordb::DatabaseError>(())
//! ```

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Core types
pub mod composite;
pub mod config;
pub mod error;
pub mod location;
pub mod registry;
pub mod value;
pub mod version;

// Codecs and storage
pub mod layout;
pub mod special;
pub mod storage;

// Database operations
pub mod compare;
pub mod database;
pub mod history;

// Re-export primary types at crate root for convenience
pub use composite::{Composite, CompositeTree, NodeId};
pub use config::DatabaseConfig;
pub use error::{DatabaseError, DbResult, IntegrityError, SchemaError, UsageError};
pub use location::{Location, LocationKey};
pub use registry::{ParamDef, ParamRegistry};
pub use value::{ArrayData, DataType, NdArray, ParamValue};
pub use version::SchemaVersion;

pub use compare::{compare_databases, CompareOptions, DiffReport};
pub use database::{load_snapshot, Database, Inputs, LoadOptions, OpenMode, Snapshot, TimeStep};
pub use history::{History, LiveState};
pub use layout::Layout;
