//! In-memory composite object tree.
//!
//! The live reactor model (reactor → core → assemblies → blocks →
//! components) is held in an arena. Parent and child links are arena
//! indices, so there are no back-pointers to serialize; the database
//! persists only the pre-order layout and rebuilds parentage on load.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::location::Location;
use crate::value::ParamValue;

static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

/// Allocates a new process-wide unique serial number.
#[must_use]
pub fn next_serial() -> u64 {
    NEXT_SERIAL.fetch_add(1, Ordering::Relaxed)
}

/// Ensures future serial numbers are greater than `serial`.
///
/// Called after loading a snapshot so objects created afterwards never
/// collide with loaded ones.
pub fn reserve_serials_through(serial: u64) {
    NEXT_SERIAL.fetch_max(serial.saturating_add(1), Ordering::Relaxed);
}

/// Index of a node within a [`CompositeTree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    #[must_use]
    pub const fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One node of the reactor tree.
#[derive(Debug, Clone)]
pub struct Composite {
    /// Type name, also used as the storage group name.
    pub type_name: String,
    /// Display name (e.g. `"A0001"`).
    pub name: String,
    serial: u64,
    /// Spatial locator within the parent, if any.
    pub location: Option<Location>,
    params: BTreeMap<String, ParamValue>,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

impl Composite {
    #[must_use]
    pub const fn serial(&self) -> u64 {
        self.serial
    }

    #[must_use]
    pub const fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    #[must_use]
    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    #[must_use]
    pub fn param(&self, name: &str) -> Option<&ParamValue> {
        self.params.get(name)
    }

    pub fn set_param(&mut self, name: impl Into<String>, value: impl Into<ParamValue>) {
        self.params.insert(name.into(), value.into());
    }

    pub fn clear_param(&mut self, name: &str) -> Option<ParamValue> {
        self.params.remove(name)
    }

    /// All set parameters, by name.
    #[must_use]
    pub const fn params(&self) -> &BTreeMap<String, ParamValue> {
        &self.params
    }
}

/// Arena-backed composite tree with a single root.
///
/// # Examples
///
/// ```
/// use reactordb::{CompositeTree, Location};
///
/// let mut tree = CompositeTree::new("Reactor", "R1");
/// let core = tree.add_child(tree.root(), "Core", "core", None);
/// let assembly = tree.add_child(core, "Assembly", "A0001", Some(Location::index(0, 0, 0)));
/// tree.get_mut(assembly).set_param("power", 1.2e6);
///
/// assert_eq!(tree.depth(assembly), 2);
/// assert_eq!(tree.pre_order().len(), 3);
/// ```
#[derive(Debug, Clone)]
pub struct CompositeTree {
    nodes: Vec<Composite>,
}

impl CompositeTree {
    /// Creates a tree with a root node and a freshly allocated serial.
    #[must_use]
    pub fn new(type_name: impl Into<String>, name: impl Into<String>) -> Self {
        Self::with_root_serial(type_name, name, next_serial())
    }

    /// Creates a tree whose root carries an explicit serial number.
    #[must_use]
    pub fn with_root_serial(
        type_name: impl Into<String>,
        name: impl Into<String>,
        serial: u64,
    ) -> Self {
        Self {
            nodes: vec![Composite {
                type_name: type_name.into(),
                name: name.into(),
                serial,
                location: None,
                params: BTreeMap::new(),
                parent: None,
                children: Vec::new(),
            }],
        }
    }

    #[must_use]
    pub const fn root(&self) -> NodeId {
        NodeId(0)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Adds a child with a freshly allocated serial number.
    pub fn add_child(
        &mut self,
        parent: NodeId,
        type_name: impl Into<String>,
        name: impl Into<String>,
        location: Option<Location>,
    ) -> NodeId {
        self.add_child_with_serial(parent, type_name, name, location, next_serial())
    }

    /// Adds a child carrying an explicit serial number (used when loading).
    ///
    /// # Panics
    ///
    /// Panics if `parent` does not belong to this tree.
    pub fn add_child_with_serial(
        &mut self,
        parent: NodeId,
        type_name: impl Into<String>,
        name: impl Into<String>,
        location: Option<Location>,
        serial: u64,
    ) -> NodeId {
        assert!(parent.0 < self.nodes.len(), "parent {parent} not in tree");
        let id = NodeId(self.nodes.len());
        self.nodes.push(Composite {
            type_name: type_name.into(),
            name: name.into(),
            serial,
            location,
            params: BTreeMap::new(),
            parent: Some(parent),
            children: Vec::new(),
        });
        self.nodes[parent.0].children.push(id);
        id
    }

    /// # Panics
    ///
    /// Panics if `id` does not belong to this tree.
    #[must_use]
    pub fn get(&self, id: NodeId) -> &Composite {
        &self.nodes[id.0]
    }

    /// # Panics
    ///
    /// Panics if `id` does not belong to this tree.
    pub fn get_mut(&mut self, id: NodeId) -> &mut Composite {
        &mut self.nodes[id.0]
    }

    /// Nodes in pre-order (parent before children, children in insertion order).
    #[must_use]
    pub fn pre_order(&self) -> Vec<NodeId> {
        let mut out = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![self.root()];
        while let Some(id) = stack.pop() {
            out.push(id);
            stack.extend(self.nodes[id.0].children.iter().rev().copied());
        }
        out
    }

    /// Number of edges between `id` and the root.
    #[must_use]
    pub fn depth(&self, id: NodeId) -> usize {
        let mut depth = 0;
        let mut current = self.nodes[id.0].parent;
        while let Some(p) = current {
            depth += 1;
            current = self.nodes[p.0].parent;
        }
        depth
    }

    /// Ancestors from the root's first-level child down to `id` itself.
    ///
    /// The root is excluded; for the root the result is empty.
    #[must_use]
    pub fn lineage(&self, id: NodeId) -> Vec<NodeId> {
        let mut chain = Vec::new();
        let mut current = Some(id);
        while let Some(c) = current {
            let node = &self.nodes[c.0];
            if node.parent.is_none() {
                break;
            }
            chain.push(c);
            current = node.parent;
        }
        chain.reverse();
        chain
    }

    /// Finds a node by serial number.
    #[must_use]
    pub fn find_by_serial(&self, serial: u64) -> Option<NodeId> {
        self.nodes
            .iter()
            .position(|n| n.serial == serial)
            .map(NodeId)
    }

    /// Builds a serial → node map for repeated lookups.
    #[must_use]
    pub fn serial_index(&self) -> HashMap<u64, NodeId> {
        self.nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.serial, NodeId(i)))
            .collect()
    }

    /// Nodes of the given type, in pre-order.
    #[must_use]
    pub fn of_type(&self, type_name: &str) -> Vec<NodeId> {
        self.pre_order()
            .into_iter()
            .filter(|&id| self.nodes[id.0].type_name == type_name)
            .collect()
    }

    /// Largest serial number in the tree.
    #[must_use]
    pub fn max_serial(&self) -> u64 {
        self.nodes.iter().map(|n| n.serial).max().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> (CompositeTree, Vec<NodeId>) {
        let mut tree = CompositeTree::new("Reactor", "r");
        let core = tree.add_child(tree.root(), "Core", "core", None);
        let a1 = tree.add_child(core, "Assembly", "A1", Some(Location::index(0, 0, 0)));
        let b1 = tree.add_child(a1, "Block", "B1", Some(Location::index(0, 0, 0)));
        let b2 = tree.add_child(a1, "Block", "B2", Some(Location::index(0, 0, 1)));
        let a2 = tree.add_child(core, "Assembly", "A2", Some(Location::index(1, 0, 0)));
        (tree, vec![core, a1, b1, b2, a2])
    }

    #[test]
    fn test_pre_order_visits_parents_first() {
        let (tree, ids) = sample();
        let order = tree.pre_order();
        let names: Vec<_> = order.iter().map(|&id| tree.get(id).name.as_str()).collect();
        assert_eq!(names, vec!["r", "core", "A1", "B1", "B2", "A2"]);
        assert_eq!(order[1], ids[0]);
    }

    #[test]
    fn test_depth_and_lineage() {
        let (tree, ids) = sample();
        assert_eq!(tree.depth(tree.root()), 0);
        assert_eq!(tree.depth(ids[2]), 3);
        assert_eq!(tree.lineage(ids[2]), vec![ids[0], ids[1], ids[2]]);
        assert!(tree.lineage(tree.root()).is_empty());
    }

    #[test]
    fn test_serials_unique_and_findable() {
        let (tree, ids) = sample();
        let serial = tree.get(ids[3]).serial();
        assert_eq!(tree.find_by_serial(serial), Some(ids[3]));
        let index = tree.serial_index();
        assert_eq!(index.len(), tree.len());
    }

    #[test]
    fn test_reserve_serials_through() {
        reserve_serials_through(1_000_000);
        assert!(next_serial() > 1_000_000);
    }

    #[test]
    fn test_params() {
        let (mut tree, ids) = sample();
        tree.get_mut(ids[2]).set_param("power", 10.0);
        assert_eq!(tree.get(ids[2]).param("power"), Some(&ParamValue::Float(10.0)));
        assert_eq!(tree.get_mut(ids[2]).clear_param("power"), Some(ParamValue::Float(10.0)));
        assert!(tree.get(ids[2]).param("power").is_none());
    }

    #[test]
    fn test_of_type() {
        let (tree, _) = sample();
        assert_eq!(tree.of_type("Block").len(), 2);
        assert_eq!(tree.of_type("Assembly").len(), 2);
    }
}
