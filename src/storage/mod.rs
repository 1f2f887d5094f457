//! On-disk hierarchical container.
//!
//! The database core stores everything (run metadata, inputs, one group
//! per time step) in a single [`Container`] file. This module knows only
//! about groups, datasets and attributes; it has no notion of reactors.

pub mod codec;
mod container;
mod dataset;
mod file_lock;

pub use container::{base_name, join, Container, DamagedLog, NodeKind, Transaction};
pub use dataset::{
    decode_payload, encode_payload, AttrValue, Attributes, Dataset, DatasetMeta, REFERENCE_PREFIX,
};
pub use file_lock::FileLock;
