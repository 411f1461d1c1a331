//! GPU mapping tags and the mapping-filter layer.
//!
//! A mapping filter is a [`Filter`] carrying a [`MappingTag`]. Its set
//! binds, per statement, the tag's coordinate to a schedule expression
//! modulo the kernel extent, or fixes it to a constant. Reading the mapping
//! of a node means intersecting the filters on its root path.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::affine::{Constraint, InstanceSet};
use crate::kernel;
use crate::schedule_tree::{Filter, MarkKind, NodeKind, NodeType, ScheduleNode};

/// Coordinates `[bx, by, bz, tx, ty, tz]`, indexed by [`MappingTag::index`].
pub type GpuCoordinate = [i64; 6];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Thread {
    X,
    Y,
    Z,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Block {
    X,
    Y,
    Z,
}

impl Thread {
    pub const ALL: [Thread; 3] = [Thread::X, Thread::Y, Thread::Z];

    pub fn index(self) -> usize {
        match self {
            Thread::X => 0,
            Thread::Y => 1,
            Thread::Z => 2,
        }
    }
}

impl Block {
    pub const ALL: [Block; 3] = [Block::X, Block::Y, Block::Z];

    pub fn index(self) -> usize {
        match self {
            Block::X => 0,
            Block::Y => 1,
            Block::Z => 2,
        }
    }
}

/// One GPU coordinate dimension.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MappingTag {
    Block(Block),
    Thread(Thread),
}

impl MappingTag {
    pub const ALL: [MappingTag; 6] = [
        MappingTag::Block(Block::X),
        MappingTag::Block(Block::Y),
        MappingTag::Block(Block::Z),
        MappingTag::Thread(Thread::X),
        MappingTag::Thread(Thread::Y),
        MappingTag::Thread(Thread::Z),
    ];

    /// Position in a [`GpuCoordinate`].
    pub fn index(self) -> usize {
        match self {
            MappingTag::Block(b) => b.index(),
            MappingTag::Thread(t) => 3 + t.index(),
        }
    }

    pub fn is_thread(self) -> bool {
        matches!(self, MappingTag::Thread(_))
    }
}

impl From<Thread> for MappingTag {
    fn from(t: Thread) -> Self {
        MappingTag::Thread(t)
    }
}

impl From<Block> for MappingTag {
    fn from(b: Block) -> Self {
        MappingTag::Block(b)
    }
}

impl fmt::Display for MappingTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (kind, dim) = match self {
            MappingTag::Block(b) => ("Block", b.index()),
            MappingTag::Thread(t) => ("Thread", t.index()),
        };
        write!(f, "{}.{}", kind, ["x", "y", "z"][dim])
    }
}

// ============================================================================
// Filter-layer queries
// ============================================================================

/// Mapping filters on the path from the root down to `node`, inclusive,
/// outermost first.
pub fn path_mapping_filters(node: &ScheduleNode) -> Vec<(MappingTag, Filter)> {
    node.path_kinds()
        .into_iter()
        .filter_map(|kind| match kind {
            NodeKind::Filter(filter) => filter.tag.map(|tag| (tag, filter.clone())),
            _ => None,
        })
        .collect()
}

/// Tags mapped on the path from the root down to `node`, with multiplicity.
pub fn path_tags(node: &ScheduleNode) -> Vec<MappingTag> {
    path_mapping_filters(node).into_iter().map(|(tag, _)| tag).collect()
}

/// Tags of mapping filters strictly below `node`.
pub fn subtree_tags(node: &ScheduleNode) -> BTreeSet<MappingTag> {
    node.descendants()
        .into_iter()
        .skip(1)
        .filter_map(|n| n.filter().and_then(|f| f.tag))
        .collect()
}

/// Instances reaching `node` with the GPU coordinate constraints of every
/// filter from the root down to `node`. Filters below `node` are ignored.
///
/// Statements introduced by an extension ancestor start unconstrained at
/// that extension; filters above it do not apply to them.
pub fn mapping(node: &ScheduleNode) -> InstanceSet {
    let schedule = node.get_schedule();
    let mut set = InstanceSet::from_statements(schedule.domain().ids());
    let kinds = node.path_kinds();
    let last = kinds.len() - 1;
    for (depth, kind) in kinds.into_iter().enumerate() {
        match kind {
            NodeKind::Filter(filter) => set = set.intersect(&filter.set),
            NodeKind::Extension(extension) if depth < last => {
                for stmt in &extension.statements {
                    set.insert_statement(&stmt.id);
                }
            }
            _ => {}
        }
    }
    set
}

/// True when a filter tagged `tag` is on the path from the root down to
/// `node`, inclusive.
pub fn is_mapped(node: &ScheduleNode, tag: impl Into<MappingTag>) -> bool {
    let tag = tag.into();
    path_tags(node).contains(&tag)
}

pub(crate) fn is_barrier(node: &ScheduleNode) -> bool {
    matches!(node.mark(), Some(m) if m.kind == MarkKind::Barrier)
}

/// Leaves under `node` that execute statement instances, i.e. not the
/// leaves of barrier marks.
pub(crate) fn instance_leaves(node: &ScheduleNode) -> Vec<ScheduleNode> {
    node.leaves()
        .into_iter()
        .filter(|leaf| !leaf.parent().is_some_and(|p| is_barrier(&p)))
        .collect()
}

/// Every GPU coordinate that runs at least one instance under `node`,
/// using the extents of the enclosing kernel. Empty outside kernels.
pub fn reachable_coordinates(node: &ScheduleNode) -> BTreeSet<GpuCoordinate> {
    let Some(context) = kernel::enclosing_kernel(node).and_then(|m| kernel::kernel_context(&m).ok())
    else {
        return BTreeSet::new();
    };
    let extents = context.extents();
    let mut out = BTreeSet::new();
    for leaf in instance_leaves(node) {
        let domain = leaf.domain_at();
        out.extend(mapping(&leaf).coordinates(&domain, &extents));
    }
    out
}

/// Build the filter set binding `tag` for every statement reaching `node`.
pub(crate) fn mapping_filter_for(
    node: &ScheduleNode,
    tag: MappingTag,
    constraint_for: impl Fn(&crate::scop::Id) -> Option<Constraint>,
) -> Filter {
    let domain = node.domain_at();
    let mut set = InstanceSet::from_statements(domain.ids());
    for id in domain.ids() {
        if let Some(constraint) = constraint_for(id) {
            set.add_constraint(id, constraint);
        }
    }
    Filter { set, tag: Some(tag) }
}

/// Thread-level mapping filters inside `node`'s subtree, in pre-order,
/// as the distinct constraints each one imposes. Equal signatures mean two
/// subtrees assign iterations to threads the same way, whatever the
/// statements are named.
pub(crate) fn thread_signature(node: &ScheduleNode) -> Vec<(MappingTag, Vec<Constraint>)> {
    node.descendants()
        .into_iter()
        .filter(|n| n.get_type() == NodeType::Filter)
        .filter_map(|n| {
            let filter = n.filter()?;
            let tag = filter.tag.filter(|t| t.is_thread())?;
            let mut constraints: Vec<Constraint> = Vec::new();
            for (_, list) in filter.set.iter() {
                for c in list {
                    if !constraints.contains(c) {
                        constraints.push(c.clone());
                    }
                }
            }
            Some((tag, constraints))
        })
        .collect()
}
