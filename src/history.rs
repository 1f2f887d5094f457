//! Parameter time series across stored time steps.
//!
//! Two ways to follow an object through time:
//!
//! - by identity: the object with a given serial number, wherever it sits;
//! - by location: whatever object occupies a given complete address (the
//!   chain of locations from the first level below the root down to the
//!   object), which may be a different object at each step.
//!
//! Either query can include the live, not yet written state as one extra
//! time step, taken straight from the in-memory tree.

use std::collections::{BTreeMap, HashMap};

use crate::composite::{CompositeTree, NodeId};
use crate::database::{read_param, Database, TimeStep};
use crate::error::{DatabaseError, DbResult, UsageError};
use crate::layout::Layout;
use crate::location::LocationKey;
use crate::storage::{join, Container, NodeKind};
use crate::value::ParamValue;
use crate::version::SchemaVersion;

/// Values of each parameter keyed by time step.
pub type History = BTreeMap<String, BTreeMap<TimeStep, ParamValue>>;

/// The in-memory state of the step being computed.
#[derive(Debug, Clone, Copy)]
pub struct LiveState<'a> {
    pub tree: &'a CompositeTree,
    pub time_step: &'a TimeStep,
}

type Address = Vec<Option<LocationKey>>;

/// One stored step's layout with lazily read parameter datasets.
struct StepData<'c> {
    container: &'c Container,
    group: String,
    layout: Layout,
    counts: BTreeMap<String, usize>,
    cache: HashMap<(String, String), Option<Vec<Option<ParamValue>>>>,
}

impl<'c> StepData<'c> {
    fn load(container: &'c Container, ts: &TimeStep) -> DbResult<Self> {
        let group = ts.group_name();
        if !container.is_group(&group) {
            return Err(UsageError::TimeStepNotFound { group }.into());
        }
        let layout = Layout::read(container, &group)?;
        let counts = layout
            .by_type()
            .into_iter()
            .map(|(t, positions)| (t.to_string(), positions.len()))
            .collect();
        Ok(Self {
            container,
            group,
            layout,
            counts,
            cache: HashMap::new(),
        })
    }

    /// Value of `param` on the object at layout position `pos`.
    fn value(&mut self, pos: usize, param: &str) -> DbResult<Option<ParamValue>> {
        let type_name = self.layout.types[pos].clone();
        let rank = self.layout.index_in_data[pos];
        let key = (type_name, param.to_string());

        if !self.cache.contains_key(&key) {
            let path = join(&join(&self.group, &key.0), param);
            let values = if self.container.kind(&path) == Some(NodeKind::Dataset) {
                let count = self.counts.get(&key.0).copied().unwrap_or(0);
                Some(read_param(self.container, &path, count)?)
            } else {
                None
            };
            self.cache.insert(key.clone(), values);
        }

        Ok(self
            .cache
            .get(&key)
            .and_then(Option::as_ref)
            .and_then(|values| values.get(rank).cloned().flatten()))
    }

    /// Layout positions keyed by complete address, for objects `depth`
    /// levels below the root. Addresses shared by several objects are
    /// left out.
    fn addresses(&self, depth: usize) -> DbResult<HashMap<Address, usize>> {
        let parents = self.layout.parent_indices()?;
        let mut out = Vec::new();
        for pos in 0..self.layout.len() {
            let mut chain = Vec::new();
            let mut current = pos;
            while let Some(parent) = parents[current] {
                chain.push(current);
                current = parent;
            }
            if chain.len() != depth {
                continue;
            }
            let address = chain
                .iter()
                .rev()
                .map(|&p| self.layout.locations[p].as_ref().map(|l| l.key()))
                .collect();
            out.push((address, pos));
        }
        Ok(unambiguous(out, &self.group))
    }
}

/// Indexes occupants by address, dropping every address that more than
/// one occupant claims.
fn unambiguous<T>(occupants: Vec<(Address, T)>, context: &str) -> HashMap<Address, T> {
    let mut index: HashMap<Address, Option<T>> = HashMap::with_capacity(occupants.len());
    for (address, occupant) in occupants {
        index
            .entry(address)
            .and_modify(|slot| *slot = None)
            .or_insert(Some(occupant));
    }
    let shared = index.values().filter(|slot| slot.is_none()).count();
    if shared > 0 {
        tracing::warn!(context, addresses = shared, "skipping locations shared by several objects");
    }
    index
        .into_iter()
        .filter_map(|(address, slot)| slot.map(|occupant| (address, occupant)))
        .collect()
}

impl Database {
    /// History of one object, followed by serial number.
    ///
    /// `time_steps` defaults to every stored step. Steps where the object
    /// or the parameter does not exist have no entry.
    ///
    /// # Errors
    /// - [`UsageError::TimeStepNotFound`] for a requested step that is not
    ///   stored
    /// - [`IntegrityError::Corrupted`](crate::IntegrityError::Corrupted) if
    ///   a dataset fails to decode
    pub fn get_history(
        &self,
        serial: u64,
        params: &[&str],
        time_steps: Option<&[TimeStep]>,
        live: Option<LiveState<'_>>,
    ) -> DbResult<History> {
        let mut histories = self.get_histories(&[serial], params, time_steps, live)?;
        Ok(histories.remove(&serial).unwrap_or_default())
    }

    /// Histories of several objects, followed by serial number.
    ///
    /// # Errors
    /// See [`get_history`](Self::get_history).
    pub fn get_histories(
        &self,
        serials: &[u64],
        params: &[&str],
        time_steps: Option<&[TimeStep]>,
        live: Option<LiveState<'_>>,
    ) -> DbResult<BTreeMap<u64, History>> {
        let mut out: BTreeMap<u64, History> = serials
            .iter()
            .map(|&s| (s, empty_history(params)))
            .collect();
        let container = self.container()?;

        for ts in self.stored_steps(time_steps, live)? {
            let mut step = StepData::load(container, &ts)?;
            for &serial in serials {
                let Some(pos) = step.layout.position_of(serial) else {
                    continue;
                };
                let history = out.entry(serial).or_default();
                for &param in params {
                    if let Some(value) = step.value(pos, param)? {
                        history.entry(param.to_string()).or_default().insert(ts.clone(), value);
                    }
                }
            }
        }

        if let Some(live) = live {
            let index = live.tree.serial_index();
            for &serial in serials {
                if let Some(&id) = index.get(&serial) {
                    merge_live(out.entry(serial).or_default(), live, id, params);
                }
            }
        }
        Ok(out)
    }

    /// Histories of whatever occupies each node's complete address.
    ///
    /// `nodes` belong to `tree`, usually the live model. Every node must sit
    /// at the same depth below the root.
    ///
    /// # Errors
    /// - [`SchemaError::VersionTooOld`](crate::SchemaError::VersionTooOld)
    ///   for files older than schema 3.4
    /// - [`UsageError::InvalidArgument`] if the nodes' depths differ
    /// - the errors of [`get_history`](Self::get_history)
    pub fn get_histories_by_location(
        &self,
        tree: &CompositeTree,
        nodes: &[NodeId],
        params: &[&str],
        time_steps: Option<&[TimeStep]>,
        live: Option<LiveState<'_>>,
    ) -> DbResult<BTreeMap<NodeId, History>> {
        self.version()
            .require(SchemaVersion::LOCATION_HISTORY, "location-based history")?;

        let addresses: Vec<(NodeId, Address)> = nodes
            .iter()
            .map(|&id| {
                let address = tree
                    .lineage(id)
                    .into_iter()
                    .map(|n| tree.get(n).location.as_ref().map(|l| l.key()))
                    .collect();
                (id, address)
            })
            .collect();
        let depth = addresses.first().map_or(0, |(_, a)| a.len());
        if let Some((id, address)) = addresses.iter().find(|(_, a)| a.len() != depth) {
            return Err(DatabaseError::invalid_argument(format!(
                "location history needs objects at one depth: node {id} is at depth {}, expected {depth}",
                address.len()
            )));
        }

        let mut out: BTreeMap<NodeId, History> = nodes
            .iter()
            .map(|&id| (id, empty_history(params)))
            .collect();
        let container = self.container()?;

        for ts in self.stored_steps(time_steps, live)? {
            let mut step = StepData::load(container, &ts)?;
            let occupants = step.addresses(depth)?;
            for (id, address) in &addresses {
                let Some(&pos) = occupants.get(address) else {
                    continue;
                };
                let history = out.entry(*id).or_default();
                for &param in params {
                    if let Some(value) = step.value(pos, param)? {
                        history.entry(param.to_string()).or_default().insert(ts.clone(), value);
                    }
                }
            }
        }

        if let Some(live) = live {
            let occupants = live
                .tree
                .pre_order()
                .into_iter()
                .filter(|&n| live.tree.depth(n) == depth)
                .map(|n| {
                    let address = live
                        .tree
                        .lineage(n)
                        .into_iter()
                        .map(|m| live.tree.get(m).location.as_ref().map(|l| l.key()))
                        .collect();
                    (address, n)
                })
                .collect();
            let index = unambiguous(occupants, "live");
            for (id, address) in &addresses {
                if let Some(&occupant) = index.get(address) {
                    merge_live(out.entry(*id).or_default(), live, occupant, params);
                }
            }
        }

        tracing::debug!(nodes = nodes.len(), depth, "read location histories");
        Ok(out)
    }

    /// Steps to read from disk; the live step is served from memory.
    fn stored_steps(
        &self,
        time_steps: Option<&[TimeStep]>,
        live: Option<LiveState<'_>>,
    ) -> DbResult<Vec<TimeStep>> {
        let steps = match time_steps {
            Some(steps) => steps.to_vec(),
            None => self.time_steps()?,
        };
        Ok(steps
            .into_iter()
            .filter(|ts| live.map_or(true, |l| l.time_step != ts))
            .collect())
    }
}

fn empty_history(params: &[&str]) -> History {
    params
        .iter()
        .map(|&p| (p.to_string(), BTreeMap::new()))
        .collect()
}

fn merge_live(history: &mut History, live: LiveState<'_>, id: NodeId, params: &[&str]) {
    let node = live.tree.get(id);
    for &param in params {
        if let Some(value) = node.param(param) {
            history
                .entry(param.to_string())
                .or_default()
                .insert(live.time_step.clone(), value.clone());
        }
    }
}
