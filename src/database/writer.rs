//! Writing time steps and auxiliary data.

use std::collections::BTreeMap;

use crate::composite::CompositeTree;
use crate::error::{DatabaseError, DbResult};
use crate::layout::{Layout, LAYOUT_GROUP};
use crate::registry::ParamRegistry;
use crate::special;
use crate::storage::{join, AttrValue, Attributes, Dataset, REFERENCE_PREFIX};
use crate::value::ParamValue;
use crate::version::SchemaVersion;

use super::{Database, TimeStep};

const ATTR_CYCLE: &str = "cycle";
const ATTR_NODE: &str = "node";
const ATTR_LABEL: &str = "label";

/// Separator between a parameter dataset and the attribute it holds.
pub(crate) const ATTR_DATASET_SEPARATOR: char = '@';

/// Everything one parameter contributes to a time-step group.
struct StagedParam {
    path: String,
    dataset: Dataset,
    /// Sibling datasets holding large attributes.
    siblings: Vec<(String, Dataset)>,
}

impl Database {
    /// Writes the tree as time step `ts`, replacing any group of that name.
    ///
    /// Every registry-persisted parameter of every object is written, one
    /// dataset per (type, parameter). Objects without their own value take
    /// the registry default; a parameter no object has a value for is not
    /// written. The whole group becomes visible in one commit.
    ///
    /// # Errors
    /// - `UsageError::ReadOnly` / `UsageError::NotOpen`
    /// - `IntegrityError::JaggedShape` or
    ///   `IntegrityError::IncompatibleValues` for values that cannot be
    ///   packed together
    pub fn write_time_step(&mut self, ts: &TimeStep, tree: &CompositeTree) -> DbResult<()> {
        let group = ts.group_name();
        let layout = Layout::build(tree);
        let staged = stage_params(
            &group,
            tree,
            &layout,
            &self.registry,
            self.version,
            self.config.large_attr_threshold,
        )?;
        let version = self.version;

        let container = self.container_mut()?;
        let mut txn = container.begin()?;
        if txn.container().exists(&group) {
            txn.remove(&group)?;
        }

        txn.create_group(&group, step_attrs(ts))?;

        layout.write(&mut txn, &group, version)?;
        for type_name in layout.by_type().keys() {
            txn.create_group(&join(&group, type_name), Attributes::new())?;
        }

        let mut datasets = 0usize;
        for param in &staged {
            for (path, sibling) in &param.siblings {
                txn.write_dataset(path, sibling)?;
                datasets += 1;
            }
            txn.write_dataset(&param.path, &param.dataset)?;
            datasets += 1;
        }
        let sequence = txn.commit()?;

        tracing::info!(
            time_step = %ts,
            objects = layout.len(),
            datasets,
            sequence,
            "wrote time step"
        );
        Ok(())
    }

    /// Attaches an auxiliary group of datasets to a stored time step.
    ///
    /// Replaces any auxiliary group of the same name. Dataset names are
    /// relative to the group and may contain `/` to nest.
    ///
    /// # Errors
    /// - `UsageError::TimeStepNotFound` if `ts` is not stored
    /// - `UsageError::InvalidArgument` if `name` collides with the layout
    ///   or an object type group
    pub fn write_auxiliary(
        &mut self,
        ts: &TimeStep,
        name: &str,
        datasets: &BTreeMap<String, Dataset>,
    ) -> DbResult<()> {
        let group = ts.group_name();
        let object_groups = super::reader::object_groups(self.container()?, &group)?;
        if name.is_empty() || name.contains('/') || name == LAYOUT_GROUP || object_groups.contains(name) {
            return Err(DatabaseError::invalid_argument(format!(
                "'{name}' cannot be used as an auxiliary group name in {group}"
            )));
        }

        let base = join(&group, name);
        let container = self.container_mut()?;
        let mut txn = container.begin()?;
        if txn.container().exists(&base) {
            txn.remove(&base)?;
        }
        txn.create_group(&base, Attributes::new())?;
        for (relative, dataset) in datasets {
            txn.write_dataset(&join(&base, relative), dataset)?;
        }
        txn.commit()?;
        tracing::debug!(time_step = %ts, group = name, datasets = datasets.len(), "wrote auxiliary data");
        Ok(())
    }
}

/// Attributes identifying the time step on its group.
pub(super) fn step_attrs(ts: &TimeStep) -> Attributes {
    let mut attrs = Attributes::new();
    attrs.insert(ATTR_CYCLE.to_string(), i64::from(ts.cycle).into());
    attrs.insert(ATTR_NODE.to_string(), i64::from(ts.node).into());
    attrs.insert(ATTR_LABEL.to_string(), ts.label.clone().into());
    attrs
}

fn stage_params(
    group: &str,
    tree: &CompositeTree,
    layout: &Layout,
    registry: &ParamRegistry,
    version: SchemaVersion,
    threshold: usize,
) -> DbResult<Vec<StagedParam>> {
    let order = tree.pre_order();
    let mut staged = Vec::new();

    for (type_name, positions) in layout.by_type() {
        if !registry.knows_type(type_name) {
            tracing::debug!(type_name, objects = positions.len(), "type has no registered parameters");
            continue;
        }
        let type_group = join(group, type_name);

        for def in registry.persisted(type_name) {
            let values: Vec<Option<ParamValue>> = positions
                .iter()
                .map(|&pos| {
                    tree.get(order[pos])
                        .param(&def.name)
                        .cloned()
                        .or_else(|| def.default.clone())
                })
                .collect();

            let Some(packed) = special::pack(&def.name, &values)? else {
                continue;
            };
            let path = join(&type_group, &def.name);
            let mut attrs = packed.meta.map(|m| m.to_attrs()).unwrap_or_default();
            let siblings = if version.uses_attribute_references() {
                externalize_large_attrs(&path, &mut attrs, threshold)
            } else {
                Vec::new()
            };
            let dataset = Dataset {
                data: packed.data,
                shape: packed.shape,
                attrs,
            };
            staged.push(StagedParam {
                path,
                dataset,
                siblings,
            });
        }
    }
    Ok(staged)
}

/// Moves array attributes longer than `threshold` into sibling datasets
/// named `<path>@<attr>`, leaving `"@<sibling path>"` in their place.
fn externalize_large_attrs(
    path: &str,
    attrs: &mut Attributes,
    threshold: usize,
) -> Vec<(String, Dataset)> {
    let mut siblings = Vec::new();
    for (name, value) in attrs.iter_mut() {
        if value.len() <= threshold {
            continue;
        }
        let Some(data) = value.to_array_data() else {
            continue;
        };
        let sibling = format!("{path}{ATTR_DATASET_SEPARATOR}{name}");
        *value = AttrValue::Str(format!("{REFERENCE_PREFIX}{sibling}"));
        siblings.push((sibling, Dataset::vector(data)));
    }
    siblings
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_externalize_only_large_arrays() {
        let mut attrs = Attributes::new();
        attrs.insert("small".to_string(), AttrValue::IntArray(vec![1, 2]));
        attrs.insert("large".to_string(), AttrValue::IntArray((0..10).collect()));
        attrs.insert("flag".to_string(), AttrValue::Bool(true));

        let siblings = externalize_large_attrs("c00n00/Block/power", &mut attrs, 4);
        assert_eq!(siblings.len(), 1);
        assert_eq!(siblings[0].0, "c00n00/Block/power@large");
        assert_eq!(
            attrs["large"].reference(),
            Some("c00n00/Block/power@large")
        );
        assert_eq!(attrs["small"], AttrValue::IntArray(vec![1, 2]));
    }
}
