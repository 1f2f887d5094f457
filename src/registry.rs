//! Parameter definitions per object type.
//!
//! Which parameters exist is decided outside this crate. The registry
//! tells the database which of them to persist and what value to assume
//! when a stored file predates a parameter.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::value::ParamValue;

/// Definition of one parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamDef {
    pub name: String,
    /// Whether the parameter is written to the database.
    #[serde(default = "default_persist")]
    pub persist: bool,
    /// Value used when an object has no value of its own, and for files
    /// that do not store this parameter.
    #[serde(default)]
    pub default: Option<ParamValue>,
    #[serde(default)]
    pub units: Option<String>,
}

fn default_persist() -> bool {
    true
}

impl ParamDef {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            persist: true,
            default: None,
            units: None,
        }
    }

    #[must_use]
    pub fn with_default(mut self, value: impl Into<ParamValue>) -> Self {
        self.default = Some(value.into());
        self
    }

    #[must_use]
    pub fn with_units(mut self, units: impl Into<String>) -> Self {
        self.units = Some(units.into());
        self
    }

    /// Marks the parameter as in-memory only.
    #[must_use]
    pub fn transient(mut self) -> Self {
        self.persist = false;
        self
    }
}

/// Parameter definitions keyed by object type name.
///
/// # Example
///
/// ```
/// use reactordb::{ParamDef, ParamRegistry};
///
/// let mut registry = ParamRegistry::new();
/// registry
///     .define("Block", ParamDef::new("power").with_units("W"))
///     .define("Block", ParamDef::new("flags").with_default(0_i64))
///     .define("Block", ParamDef::new("scratch").transient());
///
/// assert_eq!(registry.persisted("Block").count(), 2);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParamRegistry {
    types: BTreeMap<String, BTreeMap<String, ParamDef>>,
}

impl ParamRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds (or replaces) a parameter definition for `type_name`.
    pub fn define(&mut self, type_name: impl Into<String>, def: ParamDef) -> &mut Self {
        self.types
            .entry(type_name.into())
            .or_default()
            .insert(def.name.clone(), def);
        self
    }

    #[must_use]
    pub fn param(&self, type_name: &str, name: &str) -> Option<&ParamDef> {
        self.types.get(type_name).and_then(|params| params.get(name))
    }

    /// All definitions for a type, by name.
    pub fn params(&self, type_name: &str) -> impl Iterator<Item = &ParamDef> {
        self.types.get(type_name).into_iter().flat_map(BTreeMap::values)
    }

    /// Definitions for a type that are written to disk.
    pub fn persisted(&self, type_name: &str) -> impl Iterator<Item = &ParamDef> {
        self.params(type_name).filter(|def| def.persist)
    }

    #[must_use]
    pub fn knows_type(&self, type_name: &str) -> bool {
        self.types.contains_key(type_name)
    }
}
