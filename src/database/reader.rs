//! Loading time steps back into composite trees.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use crate::composite::{reserve_serials_through, CompositeTree};
use crate::config::DatabaseConfig;
use crate::error::{DatabaseError, DbResult, IntegrityError, UsageError};
use crate::layout::{Layout, LAYOUT_GROUP};
use crate::registry::ParamRegistry;
use crate::special::{self, SpecialMeta};
use crate::storage::{join, Attributes, Container, Dataset, NodeKind};
use crate::value::ParamValue;

use super::writer::ATTR_DATASET_SEPARATOR;
use super::{Database, Inputs, OpenMode, TimeStep};

/// Options for [`Database::load_time_step`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadOptions {
    /// Log and skip stored parameters the registry does not define instead
    /// of failing.
    pub allow_missing: bool,
    /// Advance the global serial counter past every loaded serial.
    pub update_identity_counters: bool,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            allow_missing: false,
            update_identity_counters: true,
        }
    }
}

/// One time step loaded together with the run inputs.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub time_step: TimeStep,
    pub tree: CompositeTree,
    pub inputs: Option<Inputs>,
}

impl Database {
    /// Resolves `(cycle, node, label)` to a stored time step.
    ///
    /// A negative `node` counts back from the last stored node of `cycle`
    /// (among steps with the same label): `-1` is the last one.
    ///
    /// # Errors
    /// - [`UsageError::InvalidArgument`] for a negative index past the first
    ///   stored node, or an invalid label
    /// - [`UsageError::TimeStepNotFound`] if a non-negative node is not stored
    pub fn resolve_time_step(&self, cycle: u32, node: i64, label: &str) -> DbResult<TimeStep> {
        if node >= 0 {
            let node = u32::try_from(node)
                .map_err(|_| DatabaseError::invalid_argument(format!("node {node} out of range")))?;
            let ts = TimeStep::with_label(cycle, node, label)?;
            if !self.has_time_step(&ts)? {
                return Err(UsageError::TimeStepNotFound {
                    group: ts.group_name(),
                }
                .into());
            }
            return Ok(ts);
        }

        let nodes: Vec<TimeStep> = self
            .time_steps()?
            .into_iter()
            .filter(|ts| ts.cycle == cycle && ts.label == label)
            .collect();
        let back = usize::try_from(node.unsigned_abs()).unwrap_or(usize::MAX);
        nodes
            .len()
            .checked_sub(back)
            .and_then(|i| nodes.get(i).cloned())
            .ok_or_else(|| {
                DatabaseError::invalid_argument(format!(
                    "node index {node} out of range: cycle {cycle} has {} stored nodes",
                    nodes.len()
                ))
            })
    }

    /// Loads a stored time step into a new composite tree.
    ///
    /// See [`resolve_time_step`](Self::resolve_time_step) for how `node` is
    /// interpreted.
    ///
    /// # Errors
    /// - errors from [`resolve_time_step`](Self::resolve_time_step)
    /// - [`IntegrityError::UnknownParameter`] for a stored parameter the
    ///   registry does not define, unless `allow_missing`
    /// - [`IntegrityError::Corrupted`] naming the dataset if the layout or a
    ///   parameter cannot be decoded
    pub fn load_time_step(
        &self,
        cycle: u32,
        node: i64,
        label: &str,
        options: LoadOptions,
    ) -> DbResult<CompositeTree> {
        let ts = self.resolve_time_step(cycle, node, label)?;
        self.load(&ts, options)
    }

    /// Loads exactly `ts`.
    ///
    /// # Errors
    /// See [`load_time_step`](Self::load_time_step).
    pub fn load(&self, ts: &TimeStep, options: LoadOptions) -> DbResult<CompositeTree> {
        let container = self.container()?;
        let group = ts.group_name();
        if !container.is_group(&group) {
            return Err(UsageError::TimeStepNotFound { group }.into());
        }

        let layout = Layout::read(container, &group)?;
        let mut tree = layout.to_tree()?;
        let ids = tree.pre_order();
        let mut skipped = 0usize;

        for (type_name, positions) in layout.by_type() {
            let type_group = join(&group, type_name);
            let stored = stored_params(container, &type_group);

            for name in &stored {
                if self.registry.param(type_name, name).is_none() {
                    if options.allow_missing {
                        tracing::warn!(
                            time_step = %ts,
                            type_name,
                            param = %name,
                            "skipping parameter not defined in registry"
                        );
                        skipped += 1;
                        continue;
                    }
                    return Err(IntegrityError::UnknownParameter {
                        type_name: type_name.to_string(),
                        param: name.clone(),
                    }
                    .into());
                }

                let path = join(&type_group, name);
                let values = read_param(container, &path, positions.len())?;
                for &pos in &positions {
                    let rank = layout.index_in_data[pos];
                    let value = values.get(rank).ok_or_else(|| {
                        IntegrityError::corrupted(
                            path.clone(),
                            format!("index {rank} beyond {} stored values", values.len()),
                        )
                    })?;
                    if let Some(value) = value {
                        tree.get_mut(ids[pos]).set_param(name.clone(), value.clone());
                    }
                }
            }

            for def in self.registry.persisted(type_name) {
                if stored.contains(&def.name) {
                    continue;
                }
                if let Some(default) = &def.default {
                    for &pos in &positions {
                        tree.get_mut(ids[pos]).set_param(def.name.clone(), default.clone());
                    }
                }
            }
        }

        if options.update_identity_counters {
            reserve_serials_through(tree.max_serial());
        }
        tracing::info!(time_step = %ts, objects = layout.len(), skipped, "loaded time step");
        Ok(tree)
    }

    /// Names of the auxiliary groups attached to `ts`.
    ///
    /// # Errors
    /// Returns [`UsageError::TimeStepNotFound`] if `ts` is not stored.
    pub fn auxiliary_groups(&self, ts: &TimeStep) -> DbResult<Vec<String>> {
        let container = self.container()?;
        let group = ts.group_name();
        let objects = object_groups(container, &group)?;
        Ok(container
            .children(&group)
            .into_iter()
            .filter(|name| *name != LAYOUT_GROUP && !objects.contains(*name))
            .map(str::to_string)
            .collect())
    }

    /// Reads an auxiliary group as datasets keyed by their relative path.
    ///
    /// Returns `None` if the time step has no such group.
    ///
    /// # Errors
    /// - [`UsageError::TimeStepNotFound`] if `ts` is not stored
    /// - [`IntegrityError::Corrupted`] if a dataset fails to decode
    pub fn read_auxiliary(
        &self,
        ts: &TimeStep,
        name: &str,
    ) -> DbResult<Option<BTreeMap<String, Dataset>>> {
        let container = self.container()?;
        let group = ts.group_name();
        if !container.is_group(&group) {
            return Err(UsageError::TimeStepNotFound { group }.into());
        }
        let base = join(&group, name);
        if !container.is_group(&base) {
            return Ok(None);
        }

        let skip = base.len() + 1;
        let mut datasets = BTreeMap::new();
        for path in container.subtree(&base) {
            if container.kind(path) != Some(NodeKind::Dataset) {
                continue;
            }
            let dataset = container
                .read(path)
                .map_err(|e| DatabaseError::from_read(path, e))?;
            datasets.insert(path[skip..].to_string(), dataset);
        }
        Ok(Some(datasets))
    }
}

/// Parameter datasets stored in a type group, excluding attribute siblings.
pub(crate) fn stored_params(container: &Container, type_group: &str) -> BTreeSet<String> {
    container
        .children(type_group)
        .into_iter()
        .filter(|name| !name.contains(ATTR_DATASET_SEPARATOR))
        .filter(|name| container.kind(&join(type_group, name)) == Some(NodeKind::Dataset))
        .map(str::to_string)
        .collect()
}

/// Object type groups of a stored time step, as listed by its layout.
pub(crate) fn object_groups(container: &Container, group: &str) -> DbResult<BTreeSet<String>> {
    if !container.is_group(group) {
        return Err(UsageError::TimeStepNotFound {
            group: group.to_string(),
        }
        .into());
    }
    let layout = Layout::read(container, group)?;
    Ok(layout.types.into_iter().collect())
}

/// Attributes of a dataset with every `@`-reference resolved.
pub(crate) fn resolved_attrs(container: &Container, path: &str) -> DbResult<Attributes> {
    let Some(attrs) = container.attrs(path) else {
        return Ok(Attributes::new());
    };
    let mut resolved = Attributes::new();
    for (name, value) in attrs {
        let value = if value.reference().is_some() {
            container
                .read_attr(path, name)
                .map_err(|e| DatabaseError::from_read(path, e))?
                .unwrap_or_else(|| value.clone())
        } else {
            value.clone()
        };
        resolved.insert(name.clone(), value);
    }
    Ok(resolved)
}

/// Reads and unpacks one parameter dataset holding `count` objects' values.
pub(crate) fn read_param(
    container: &Container,
    path: &str,
    count: usize,
) -> DbResult<Vec<Option<ParamValue>>> {
    let dataset = container
        .read(path)
        .map_err(|e| DatabaseError::from_read(path, e))?;
    let attrs = resolved_attrs(container, path)?;
    let meta = SpecialMeta::from_attrs(path, &attrs)?;
    Ok(special::unpack(
        path,
        dataset.data,
        &dataset.shape,
        meta.as_ref(),
        count,
    )?)
}

/// Opens `path` read-only, reads its inputs and loads one time step.
///
/// `node` may be negative to count back from the last node of `cycle`.
///
/// # Errors
/// Any error from opening the file or loading the step.
pub fn load_snapshot(
    path: impl AsRef<Path>,
    registry: ParamRegistry,
    cycle: u32,
    node: i64,
) -> DbResult<Snapshot> {
    let mut db = Database::new(
        path.as_ref(),
        OpenMode::Read,
        registry,
        DatabaseConfig::default(),
    )?;
    db.open()?;
    let inputs = db.read_inputs()?;
    let time_step = db.resolve_time_step(cycle, node, "")?;
    let tree = db.load(&time_step, LoadOptions::default())?;
    db.close(None)?;
    Ok(Snapshot {
        time_step,
        tree,
        inputs,
    })
}
