//! Structural layout of a stored time step.
//!
//! A composite tree is flattened by a pre-order traversal into parallel
//! arrays (serial, type, name, child count, index within the type's
//! parameter datasets, location). Parentage is never stored: a node's
//! children immediately follow it in pre-order, so the child counts alone
//! rebuild the tree.

use std::collections::BTreeMap;

use crate::composite::CompositeTree;
use crate::error::{DatabaseError, DbResult, IntegrityError};
use crate::location::{pack_locations, unpack_locations, Location};
use crate::storage::{join, Container, Dataset, Transaction};
use crate::value::ArrayData;
use crate::version::SchemaVersion;

/// Name of the layout subgroup inside a time-step group.
pub const LAYOUT_GROUP: &str = "layout";

const DS_TYPE: &str = "type";
const DS_NAME: &str = "name";
const DS_SERIAL: &str = "serialNum";
const DS_NUM_CHILDREN: &str = "numChildren";
const DS_INDEX_IN_DATA: &str = "indexInData";
const DS_LOCATION_TYPE: &str = "locationType";
const DS_LOCATION: &str = "location";

/// Layout datasets that describe object identity rather than structure.
pub const IDENTITY_DATASETS: [&str; 1] = [DS_SERIAL];

/// Pre-order snapshot of a composite tree.
#[derive(Debug, Clone, PartialEq)]
pub struct Layout {
    pub serials: Vec<u64>,
    pub types: Vec<String>,
    pub names: Vec<String>,
    pub num_children: Vec<usize>,
    /// Position of each object among the objects of its type.
    pub index_in_data: Vec<usize>,
    pub locations: Vec<Option<Location>>,
}

impl Layout {
    /// Flattens `tree` in pre-order.
    ///
    /// Entry `i` describes the `i`-th node of [`CompositeTree::pre_order`].
    #[must_use]
    pub fn build(tree: &CompositeTree) -> Self {
        let order = tree.pre_order();
        let mut layout = Self::with_capacity(order.len());
        let mut per_type: BTreeMap<&str, usize> = BTreeMap::new();

        for id in order {
            let node = tree.get(id);
            let counter = per_type.entry(node.type_name.as_str()).or_insert(0);
            layout.index_in_data.push(*counter);
            *counter += 1;

            layout.serials.push(node.serial());
            layout.types.push(node.type_name.clone());
            layout.names.push(node.name.clone());
            layout.num_children.push(node.children().len());
            layout.locations.push(node.location.clone());
        }
        layout
    }

    fn with_capacity(n: usize) -> Self {
        Self {
            serials: Vec::with_capacity(n),
            types: Vec::with_capacity(n),
            names: Vec::with_capacity(n),
            num_children: Vec::with_capacity(n),
            index_in_data: Vec::with_capacity(n),
            locations: Vec::with_capacity(n),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.serials.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.serials.is_empty()
    }

    /// Layout positions of every object, grouped by type in pre-order.
    #[must_use]
    pub fn by_type(&self) -> BTreeMap<&str, Vec<usize>> {
        let mut groups: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
        for (i, type_name) in self.types.iter().enumerate() {
            groups.entry(type_name.as_str()).or_default().push(i);
        }
        groups
    }

    /// Layout position of the object with `serial`.
    #[must_use]
    pub fn position_of(&self, serial: u64) -> Option<usize> {
        self.serials.iter().position(|&s| s == serial)
    }

    /// Immediate parent position of each entry (`None` for the root).
    ///
    /// # Errors
    /// Returns [`IntegrityError::Corrupted`] if the child counts do not
    /// describe a single tree.
    pub fn parent_indices(&self) -> Result<Vec<Option<usize>>, IntegrityError> {
        parent_table(&self.num_children)
    }

    /// Serial of each entry's ancestor `depth` levels up.
    ///
    /// # Errors
    /// Returns [`IntegrityError::Corrupted`] for malformed child counts.
    pub fn ancestors(&self, depth: usize) -> Result<Vec<Option<u64>>, IntegrityError> {
        compute_ancestors(&self.serials, &self.num_children, depth)
    }

    /// Rebuilds the composite tree; node `i` of the result is layout entry `i`.
    ///
    /// # Errors
    /// Returns [`IntegrityError::Corrupted`] for an empty layout or
    /// malformed child counts.
    pub fn to_tree(&self) -> Result<CompositeTree, IntegrityError> {
        if self.is_empty() {
            return Err(IntegrityError::corrupted(LAYOUT_GROUP, "layout has no objects"));
        }
        let parents = self.parent_indices()?;
        let mut tree = CompositeTree::with_root_serial(
            self.types[0].clone(),
            self.names[0].clone(),
            self.serials[0],
        );
        tree.get_mut(tree.root()).location = self.locations[0].clone();

        let mut ids = Vec::with_capacity(self.len());
        ids.push(tree.root());
        for i in 1..self.len() {
            let parent = parents[i].map(|p| ids[p]).ok_or_else(|| {
                IntegrityError::corrupted(LAYOUT_GROUP, format!("object {i} has no parent"))
            })?;
            let id = tree.add_child_with_serial(
                parent,
                self.types[i].clone(),
                self.names[i].clone(),
                self.locations[i].clone(),
                self.serials[i],
            );
            ids.push(id);
        }
        Ok(tree)
    }

    /// Writes the layout datasets under `<group>/layout`.
    ///
    /// # Errors
    /// Propagates container write failures.
    #[allow(clippy::cast_possible_wrap)]
    pub fn write(&self, txn: &mut Transaction<'_>, group: &str, version: SchemaVersion) -> DbResult<()> {
        let base = join(group, LAYOUT_GROUP);
        let (tags, payload) = pack_locations(&self.locations, version);
        let ints = |values: &[usize]| values.iter().map(|&v| v as i64).collect::<Vec<_>>();

        let datasets = [
            (DS_TYPE, ArrayData::Str(self.types.clone())),
            (DS_NAME, ArrayData::Str(self.names.clone())),
            (
                DS_SERIAL,
                ArrayData::Int(self.serials.iter().map(|&s| s as i64).collect()),
            ),
            (DS_NUM_CHILDREN, ArrayData::Int(ints(&self.num_children))),
            (DS_INDEX_IN_DATA, ArrayData::Int(ints(&self.index_in_data))),
            (DS_LOCATION_TYPE, ArrayData::Str(tags)),
            (DS_LOCATION, ArrayData::Float(payload)),
        ];

        txn.create_group(&base, Default::default())?;
        for (name, data) in datasets {
            txn.write_dataset(&join(&base, name), &Dataset::vector(data))?;
        }
        Ok(())
    }

    /// Reads the layout stored under `<group>/layout`.
    ///
    /// # Errors
    /// Returns [`IntegrityError::Corrupted`] if a dataset is missing, has
    /// the wrong type, or the arrays disagree in length.
    #[allow(clippy::cast_sign_loss)]
    pub fn read(container: &Container, group: &str) -> DbResult<Self> {
        let base = join(group, LAYOUT_GROUP);

        let types = read_strings(container, &base, DS_TYPE)?;
        let names = read_strings(container, &base, DS_NAME)?;
        let serials = read_ints(container, &base, DS_SERIAL)?
            .into_iter()
            .map(|s| s as u64)
            .collect::<Vec<_>>();
        let num_children = read_counts(container, &base, DS_NUM_CHILDREN)?;
        let index_in_data = read_counts(container, &base, DS_INDEX_IN_DATA)?;
        let tags = read_strings(container, &base, DS_LOCATION_TYPE)?;
        let payload = match read_vector(container, &base, DS_LOCATION)? {
            ArrayData::Float(v) => v,
            other => {
                return Err(wrong_type(&base, DS_LOCATION, "float", &other));
            }
        };
        let locations = unpack_locations(&tags, &payload)?;

        let n = serials.len();
        let lengths = [
            types.len(),
            names.len(),
            num_children.len(),
            index_in_data.len(),
            locations.len(),
        ];
        if lengths.iter().any(|&len| len != n) {
            return Err(IntegrityError::corrupted(
                base,
                format!("layout arrays disagree in length: {n} serials vs {lengths:?}"),
            )
            .into());
        }

        Ok(Self {
            serials,
            types,
            names,
            num_children,
            index_in_data,
            locations,
        })
    }
}

fn read_vector(container: &Container, base: &str, name: &str) -> DbResult<ArrayData> {
    let path = join(base, name);
    container
        .read(&path)
        .map(|ds| ds.data)
        .map_err(|e| DatabaseError::from_read(&path, e))
}

fn wrong_type(base: &str, name: &str, expected: &str, found: &ArrayData) -> DatabaseError {
    IntegrityError::corrupted(
        join(base, name),
        format!("expected {expected} data, found {}", found.dtype().name()),
    )
    .into()
}

fn read_strings(container: &Container, base: &str, name: &str) -> DbResult<Vec<String>> {
    match read_vector(container, base, name)? {
        ArrayData::Str(v) => Ok(v),
        other => Err(wrong_type(base, name, "string", &other)),
    }
}

fn read_ints(container: &Container, base: &str, name: &str) -> DbResult<Vec<i64>> {
    match read_vector(container, base, name)? {
        ArrayData::Int(v) => Ok(v),
        other => Err(wrong_type(base, name, "integer", &other)),
    }
}

fn read_counts(container: &Container, base: &str, name: &str) -> DbResult<Vec<usize>> {
    read_ints(container, base, name)?
        .into_iter()
        .map(|v| {
            usize::try_from(v).map_err(|_| {
                IntegrityError::corrupted(join(base, name), format!("negative count {v}")).into()
            })
        })
        .collect()
}

fn parent_table(num_children: &[usize]) -> Result<Vec<Option<usize>>, IntegrityError> {
    let mut parents = vec![None; num_children.len()];
    // Open ancestors with the number of children still to be seen.
    let mut stack: Vec<(usize, usize)> = Vec::new();

    for (i, &count) in num_children.iter().enumerate() {
        if i > 0 {
            let Some(top) = stack.last_mut() else {
                return Err(IntegrityError::corrupted(
                    LAYOUT_GROUP,
                    format!("object {i} follows a complete tree"),
                ));
            };
            parents[i] = Some(top.0);
            top.1 -= 1;
            if top.1 == 0 {
                stack.pop();
            }
        }
        if count > 0 {
            stack.push((i, count));
        }
    }

    if let Some(&(open, missing)) = stack.last() {
        return Err(IntegrityError::corrupted(
            LAYOUT_GROUP,
            format!("object {open} is missing {missing} children"),
        ));
    }
    Ok(parents)
}

/// Serial of each object's ancestor `depth` levels up, from pre-order
/// serials and child counts.
///
/// Depth 0 is the object itself; a depth beyond the root gives `None`.
///
/// # Errors
/// Returns [`IntegrityError::Corrupted`] if the arrays differ in length or
/// the child counts do not describe a single tree.
///
/// # Example
///
/// ```
/// use reactordb::layout::compute_ancestors;
///
/// // 1 ─┬─ 2 ── 3
/// //    └─ 4
/// let parents = compute_ancestors(&[1, 2, 3, 4], &[2, 1, 0, 0], 1).unwrap();
/// assert_eq!(parents, vec![None, Some(1), Some(2), Some(1)]);
/// ```
pub fn compute_ancestors(
    serials: &[u64],
    num_children: &[usize],
    depth: usize,
) -> Result<Vec<Option<u64>>, IntegrityError> {
    if serials.len() != num_children.len() {
        return Err(IntegrityError::corrupted(
            LAYOUT_GROUP,
            format!(
                "{} serials but {} child counts",
                serials.len(),
                num_children.len()
            ),
        ));
    }
    let parents = parent_table(num_children)?;
    Ok((0..serials.len())
        .map(|i| {
            let mut current = Some(i);
            for _ in 0..depth {
                current = current.and_then(|c| parents[c]);
            }
            current.map(|c| serials[c])
        })
        .collect())
}
