//! Persistent schedule trees.
//!
//! A [`Schedule`] owns an immutable tree of [`TreeNode`]s shared through
//! `Arc`. Every edit copies the spine from the root to the edited position
//! and yields a new `Schedule`; untouched subtrees are shared between the
//! old and new values.
//!
//! A [`ScheduleNode`] is a position in one schedule value: the schedule plus
//! the child-index path from the root. Handles are values; after an edit
//! only the handle returned by that edit refers to the new tree. Code that
//! needs to find a node again after unrelated edits resolves it by mark id
//! with [`Schedule::find_mark`].
//!
//! # Structural invariants
//! - Children of `Sequence` and `Set` nodes are `Filter` nodes.
//! - `Band`, `Filter`, `Mark`, `Extension`, `Context` and `Guard` nodes have
//!   exactly one child; `Leaf` has none.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::affine::{InstanceSet, Interval, ScheduleExpr, StatementDomain, UnionDomain};
use crate::error::{MappingError, Result};
use crate::mapping::{GpuCoordinate, MappingTag};
use crate::scop::{CopyDirection, Id};

// ============================================================================
// Node payloads
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NodeType {
    Band,
    Filter,
    Mark,
    Sequence,
    Set,
    Extension,
    Context,
    Guard,
    Leaf,
}

/// One band member: a schedule expression per statement.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BandMember {
    pub schedule: BTreeMap<Id, ScheduleExpr>,
    pub coincident: bool,
    pub unroll: bool,
}

impl BandMember {
    pub fn new(schedule: BTreeMap<Id, ScheduleExpr>) -> Self {
        BandMember {
            schedule,
            coincident: false,
            unroll: false,
        }
    }

    pub fn expr(&self, statement: &Id) -> Option<&ScheduleExpr> {
        self.schedule.get(statement)
    }

    /// Hull of the member's values over the statements of `domain`.
    pub fn range(&self, domain: &UnionDomain) -> Interval {
        domain
            .iter()
            .filter(|(_, d)| !d.is_empty())
            .filter_map(|(id, d)| self.schedule.get(id).map(|e| e.range(d)))
            .fold(Interval::new(0, -1), Interval::hull)
    }

    /// Apply `f` to every statement's expression.
    pub fn map_exprs(&self, f: impl Fn(&ScheduleExpr) -> ScheduleExpr) -> BandMember {
        BandMember {
            schedule: self.schedule.iter().map(|(id, e)| (id.clone(), f(e))).collect(),
            coincident: self.coincident,
            unroll: self.unroll,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Band {
    pub members: Vec<BandMember>,
    pub permutable: bool,
}

impl Band {
    pub fn new(members: Vec<BandMember>) -> Self {
        Band {
            members,
            permutable: false,
        }
    }

    pub fn n_member(&self) -> usize {
        self.members.len()
    }

    pub fn with_permutable(mut self, permutable: bool) -> Self {
        self.permutable = permutable;
        self
    }

    /// Set the coincidence flag of the leading members.
    pub fn with_coincident(mut self, flags: &[bool]) -> Self {
        for (member, &flag) in self.members.iter_mut().zip(flags) {
            member.coincident = flag;
        }
        self
    }

    /// Mark every member coincident and the band permutable.
    pub fn parallel(self) -> Self {
        let n = self.members.len();
        self.with_coincident(&vec![true; n]).with_permutable(true)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    pub set: InstanceSet,
    /// Mapping tag when this is a mapping filter.
    pub tag: Option<MappingTag>,
}

impl Filter {
    pub fn statements(set: InstanceSet) -> Self {
        Filter { set, tag: None }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarkKind {
    Kernel,
    PromotionScope,
    Barrier,
    User(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mark {
    pub id: Id,
    pub kind: MarkKind,
}

/// Launch configuration of a kernel. Unused dimensions hold 1.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelContext {
    pub grid: [i64; 3],
    pub block: [i64; 3],
}

impl KernelContext {
    pub fn extent(&self, tag: MappingTag) -> i64 {
        match tag {
            MappingTag::Block(b) => self.grid[b.index()],
            MappingTag::Thread(t) => self.block[t.index()],
        }
    }

    pub fn extents(&self) -> GpuCoordinate {
        let mut out = [1; 6];
        for tag in MappingTag::ALL {
            out[tag.index()] = self.extent(tag);
        }
        out
    }
}

/// The kernel body runs only when `condition` has instances.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Guard {
    pub condition: InstanceSet,
}

/// `constant + Σ factor · (value of outer band member at position)`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Origin {
    pub constant: i64,
    pub terms: Vec<(usize, i64)>,
}

impl Origin {
    /// Evaluate for concrete outer member values.
    pub fn eval(&self, members: &[i64]) -> i64 {
        self.terms.iter().fold(self.constant, |acc, &(pos, factor)| {
            acc + factor * members.get(pos).copied().unwrap_or(0)
        })
    }
}

/// Statement moving a promoted footprint between global memory and its
/// buffer. Its domain ranges over buffer elements.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopyStatement {
    pub id: Id,
    pub direction: CopyDirection,
    pub array: Id,
    pub buffer: Id,
    pub domain: StatementDomain,
    /// Array index of buffer element 0, per array dimension.
    pub origin: Vec<Origin>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extension {
    pub statements: Vec<CopyStatement>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeKind {
    Band(Band),
    Filter(Filter),
    Mark(Mark),
    Sequence,
    Set,
    Extension(Extension),
    Context(KernelContext),
    Guard(Guard),
    Leaf,
}

impl NodeKind {
    pub fn node_type(&self) -> NodeType {
        match self {
            NodeKind::Band(_) => NodeType::Band,
            NodeKind::Filter(_) => NodeType::Filter,
            NodeKind::Mark(_) => NodeType::Mark,
            NodeKind::Sequence => NodeType::Sequence,
            NodeKind::Set => NodeType::Set,
            NodeKind::Extension(_) => NodeType::Extension,
            NodeKind::Context(_) => NodeType::Context,
            NodeKind::Guard(_) => NodeType::Guard,
            NodeKind::Leaf => NodeType::Leaf,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeNode {
    pub kind: NodeKind,
    pub children: Vec<Arc<TreeNode>>,
}

impl TreeNode {
    pub fn leaf() -> Arc<TreeNode> {
        Arc::new(TreeNode {
            kind: NodeKind::Leaf,
            children: Vec::new(),
        })
    }

    pub fn new(kind: NodeKind, children: Vec<Arc<TreeNode>>) -> Arc<TreeNode> {
        Arc::new(TreeNode { kind, children })
    }

    pub fn wrap(kind: NodeKind, child: Arc<TreeNode>) -> Arc<TreeNode> {
        TreeNode::new(kind, vec![child])
    }
}

// ============================================================================
// Schedule
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    domain: Arc<UnionDomain>,
    root: Arc<TreeNode>,
}

impl Schedule {
    /// Schedule executing `domain` in unspecified order: a single leaf.
    pub fn from_domain(domain: UnionDomain) -> Self {
        Schedule {
            domain: Arc::new(domain),
            root: TreeNode::leaf(),
        }
    }

    pub fn domain(&self) -> &UnionDomain {
        &self.domain
    }

    pub fn root_tree(&self) -> &Arc<TreeNode> {
        &self.root
    }

    pub fn root(&self) -> ScheduleNode {
        ScheduleNode {
            schedule: self.clone(),
            path: Vec::new(),
        }
    }

    pub fn node_at(&self, path: &[usize]) -> Option<ScheduleNode> {
        let mut node = &self.root;
        for &i in path {
            node = node.children.get(i)?;
        }
        Some(ScheduleNode {
            schedule: self.clone(),
            path: path.to_vec(),
        })
    }

    /// All nodes in pre-order.
    pub fn nodes(&self) -> Vec<ScheduleNode> {
        self.root().descendants()
    }

    pub fn find_mark(&self, id: &Id) -> Option<ScheduleNode> {
        self.nodes()
            .into_iter()
            .find(|n| n.mark().is_some_and(|m| &m.id == id))
    }

    pub fn find_marks(&self, pred: impl Fn(&Mark) -> bool) -> Vec<ScheduleNode> {
        self.nodes()
            .into_iter()
            .filter(|n| n.mark().is_some_and(&pred))
            .collect()
    }

    fn with_subtree(&self, path: &[usize], subtree: Arc<TreeNode>) -> Schedule {
        Schedule {
            domain: self.domain.clone(),
            root: replace_at(&self.root, path, subtree),
        }
    }
}

fn replace_at(node: &Arc<TreeNode>, path: &[usize], subtree: Arc<TreeNode>) -> Arc<TreeNode> {
    match path.split_first() {
        None => subtree,
        Some((&i, rest)) => {
            let mut copy = (**node).clone();
            copy.children[i] = replace_at(&node.children[i], rest, subtree);
            Arc::new(copy)
        }
    }
}

// ============================================================================
// Node handles
// ============================================================================

/// Position of a node within one schedule value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScheduleNode {
    schedule: Schedule,
    path: Vec<usize>,
}

impl ScheduleNode {
    pub fn path(&self) -> &[usize] {
        &self.path
    }

    pub fn get_schedule(&self) -> Schedule {
        self.schedule.clone()
    }

    pub fn into_schedule(self) -> Schedule {
        self.schedule
    }

    /// Subtree at this position. Paths are only created by navigation from
    /// existing nodes, so they are always valid for their schedule.
    pub fn tree(&self) -> &Arc<TreeNode> {
        let mut node = &self.schedule.root;
        for &i in &self.path {
            node = &node.children[i];
        }
        node
    }

    pub fn kind(&self) -> &NodeKind {
        &self.tree().kind
    }

    pub fn get_type(&self) -> NodeType {
        self.kind().node_type()
    }

    pub fn n_children(&self) -> usize {
        self.tree().children.len()
    }

    pub fn has_children(&self) -> bool {
        self.n_children() > 0
    }

    pub fn child(&self, pos: usize) -> Option<ScheduleNode> {
        if pos >= self.n_children() {
            return None;
        }
        let mut path = self.path.clone();
        path.push(pos);
        Some(ScheduleNode {
            schedule: self.schedule.clone(),
            path,
        })
    }

    /// Like [`child`](Self::child) for positions the caller's own edits
    /// guarantee exist.
    pub(crate) fn descend(&self, pos: usize) -> Result<ScheduleNode> {
        self.child(pos).ok_or_else(|| {
            MappingError::InvalidNode(format!("{:?} node has no child {}", self.get_type(), pos))
        })
    }

    pub fn parent(&self) -> Option<ScheduleNode> {
        let (_, prefix) = self.path.split_last()?;
        Some(ScheduleNode {
            schedule: self.schedule.clone(),
            path: prefix.to_vec(),
        })
    }

    /// Index of this node among its parent's children.
    pub fn child_position(&self) -> Option<usize> {
        self.path.last().copied()
    }

    /// Strict ancestors, nearest first.
    pub fn ancestors(&self) -> Vec<ScheduleNode> {
        (0..self.path.len())
            .rev()
            .map(|len| ScheduleNode {
                schedule: self.schedule.clone(),
                path: self.path[..len].to_vec(),
            })
            .collect()
    }

    /// Node kinds from the root down to this node, inclusive.
    pub fn path_kinds(&self) -> Vec<&NodeKind> {
        let mut node = &self.schedule.root;
        let mut kinds = vec![&node.kind];
        for &i in &self.path {
            node = &node.children[i];
            kinds.push(&node.kind);
        }
        kinds
    }

    /// This node and every node below it, in pre-order.
    pub fn descendants(&self) -> Vec<ScheduleNode> {
        let mut out = Vec::new();
        let mut stack = vec![self.clone()];
        while let Some(node) = stack.pop() {
            for pos in (0..node.n_children()).rev() {
                stack.extend(node.child(pos));
            }
            out.push(node);
        }
        out
    }

    pub fn leaves(&self) -> Vec<ScheduleNode> {
        self.descendants()
            .into_iter()
            .filter(|n| n.get_type() == NodeType::Leaf)
            .collect()
    }

    /// Statement domains reaching this node: the schedule domain restricted
    /// by filters among the strict ancestors and extended by ancestor
    /// extension nodes.
    pub fn domain_at(&self) -> UnionDomain {
        let mut domain = (*self.schedule.domain).clone();
        let mut node = &self.schedule.root;
        for &i in &self.path {
            match &node.kind {
                NodeKind::Filter(filter) => domain.retain(|id| filter.set.contains_statement(id)),
                NodeKind::Extension(extension) => {
                    for stmt in &extension.statements {
                        domain.insert(stmt.id.clone(), stmt.domain.clone());
                    }
                }
                _ => {}
            }
            node = &node.children[i];
        }
        domain
    }

    pub fn band(&self) -> Option<&Band> {
        match self.kind() {
            NodeKind::Band(band) => Some(band),
            _ => None,
        }
    }

    pub fn filter(&self) -> Option<&Filter> {
        match self.kind() {
            NodeKind::Filter(filter) => Some(filter),
            _ => None,
        }
    }

    pub fn mark(&self) -> Option<&Mark> {
        match self.kind() {
            NodeKind::Mark(mark) => Some(mark),
            _ => None,
        }
    }

    pub fn band_n_member(&self) -> usize {
        self.band().map_or(0, Band::n_member)
    }

    pub fn band_member_get_coincident(&self, pos: usize) -> bool {
        self.band()
            .and_then(|b| b.members.get(pos))
            .is_some_and(|m| m.coincident)
    }

    /// Range of member `pos` over the instances reaching this band.
    pub fn band_member_range(&self, pos: usize) -> Interval {
        match self.band().and_then(|b| b.members.get(pos)) {
            Some(member) => member.range(&self.domain_at()),
            None => Interval::new(0, -1),
        }
    }

    // ------------------------------------------------------------------------
    // Edits
    // ------------------------------------------------------------------------

    /// Replace the subtree at this position; returns the grafted node.
    pub fn graft(self, subtree: Arc<TreeNode>) -> ScheduleNode {
        let schedule = self.schedule.with_subtree(&self.path, subtree);
        ScheduleNode {
            schedule,
            path: self.path,
        }
    }

    /// Replace this node's payload, keeping its children.
    pub fn replace_kind(self, kind: NodeKind) -> ScheduleNode {
        let children = self.tree().children.clone();
        self.graft(TreeNode::new(kind, children))
    }

    /// Insert a single-child node above this one; returns the new node.
    pub fn insert_above(self, kind: NodeKind) -> ScheduleNode {
        let subtree = TreeNode::wrap(kind, self.tree().clone());
        self.graft(subtree)
    }

    pub fn insert_partial_schedule(self, band: Band) -> ScheduleNode {
        self.insert_above(NodeKind::Band(band))
    }

    pub fn insert_filter(self, filter: Filter) -> ScheduleNode {
        self.insert_above(NodeKind::Filter(filter))
    }

    pub fn insert_mark(self, id: Id, kind: MarkKind) -> ScheduleNode {
        self.insert_above(NodeKind::Mark(Mark { id, kind }))
    }

    pub fn insert_context(self, context: KernelContext) -> ScheduleNode {
        self.insert_above(NodeKind::Context(context))
    }

    pub fn insert_guard(self, condition: InstanceSet) -> ScheduleNode {
        self.insert_above(NodeKind::Guard(Guard { condition }))
    }

    pub fn insert_extension(self, statements: Vec<CopyStatement>) -> ScheduleNode {
        self.insert_above(NodeKind::Extension(Extension { statements }))
    }

    /// Replace the subtree `T` here by `Sequence[Filter(f) -> T, ...]`;
    /// returns the sequence.
    pub fn insert_sequence(self, filters: Vec<InstanceSet>) -> ScheduleNode {
        self.insert_branching(NodeKind::Sequence, filters)
    }

    pub fn insert_set(self, filters: Vec<InstanceSet>) -> ScheduleNode {
        self.insert_branching(NodeKind::Set, filters)
    }

    fn insert_branching(self, kind: NodeKind, filters: Vec<InstanceSet>) -> ScheduleNode {
        let body = self.tree().clone();
        let children = filters
            .into_iter()
            .map(|set| TreeNode::wrap(NodeKind::Filter(Filter::statements(set)), body.clone()))
            .collect();
        self.graft(TreeNode::new(kind, children))
    }

    /// Split a band before member `pos`; returns the outer band.
    pub fn band_split(self, pos: usize) -> Result<ScheduleNode> {
        let band = self
            .band()
            .cloned()
            .ok_or_else(|| MappingError::InvalidNode(format!("band_split on {:?}", self.get_type())))?;
        if pos == 0 || pos >= band.n_member() {
            return Err(MappingError::InvalidNode(format!(
                "cannot split a {}-member band at {}",
                band.n_member(),
                pos
            )));
        }
        let mut outer = band.clone();
        let inner_members = outer.members.split_off(pos);
        let inner = Band {
            members: inner_members,
            permutable: band.permutable,
        };
        let children = self.tree().children.clone();
        let subtree = TreeNode::wrap(NodeKind::Band(outer), TreeNode::new(NodeKind::Band(inner), children));
        Ok(self.graft(subtree))
    }

    /// Group the selected children of a sequence or set under a new
    /// `Filter -> Sequence|Set` child, preserving execution order.
    ///
    /// A sequence only accepts a contiguous range of children, which takes
    /// the place of the first selected child. Selecting every child returns
    /// this node unchanged. On success, returns the nested sequence or set.
    ///
    /// # Errors
    /// `ScopeSplitFailure` for an empty or out-of-range selection, a
    /// non-contiguous selection under a sequence, or a node that is neither
    /// a sequence nor a set.
    pub fn split_children(self, indices: &[usize]) -> Result<ScheduleNode> {
        let kind = self.kind().clone();
        if !matches!(kind, NodeKind::Sequence | NodeKind::Set) {
            return Err(MappingError::ScopeSplitFailure(format!(
                "{:?} node has no splittable children",
                self.get_type()
            )));
        }
        let mut selected = indices.to_vec();
        selected.sort_unstable();
        selected.dedup();
        let n = self.n_children();
        let (first, last) = match (selected.first(), selected.last()) {
            (Some(&f), Some(&l)) if l < n => (f, l),
            _ => {
                return Err(MappingError::ScopeSplitFailure(format!(
                    "selection {:?} is empty or out of range for {} children",
                    indices, n
                )))
            }
        };
        if kind == NodeKind::Sequence && last - first + 1 != selected.len() {
            return Err(MappingError::ScopeSplitFailure(format!(
                "selection {:?} is not contiguous in a sequence",
                indices
            )));
        }
        if selected.len() == n {
            return Ok(self);
        }

        let children = &self.tree().children;
        let mut covered = InstanceSet::empty();
        let mut grouped = Vec::new();
        for &i in &selected {
            let child = self.descend(i)?;
            let set = match child.filter() {
                Some(filter) => filter.set.clone(),
                None => InstanceSet::from_statements(child.domain_at().ids()),
            };
            covered = if grouped.is_empty() { set } else { covered.union(&set) };
            grouped.push(children[i].clone());
        }
        let nested = TreeNode::wrap(
            NodeKind::Filter(Filter::statements(covered)),
            TreeNode::new(kind.clone(), grouped),
        );
        let mut rebuilt = Vec::new();
        for (i, child) in children.iter().enumerate() {
            if i == first {
                rebuilt.push(nested.clone());
            } else if !selected.contains(&i) {
                rebuilt.push(child.clone());
            }
        }
        let parent = self.graft(TreeNode::new(kind, rebuilt));
        parent.descend(first)?.descend(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scop::ScopBuilder;

    fn three_statement_sequence() -> Schedule {
        ScopBuilder::new()
            .domain("{ S0[i] : 0 <= i <= 3; S1[i] : 0 <= i <= 3; S2[i] : 0 <= i <= 3 }")
            .unwrap()
            .sequence(&["S0", "S1", "S2"])
            .unwrap()
            .build()
            .schedule
    }

    #[test]
    fn test_edits_do_not_change_previous_values() {
        let schedule = three_statement_sequence();
        let leaf = schedule.root().child(0).unwrap().child(0).unwrap();
        let marked = leaf.insert_mark(Id::new("m"), MarkKind::User("note".into()));
        assert!(schedule.find_mark(&Id::new("m")).is_none());
        assert!(marked.get_schedule().find_mark(&Id::new("m")).is_some());
    }

    #[test]
    fn test_domain_at_applies_filters() {
        let schedule = three_statement_sequence();
        let leaf = schedule.root().child(1).unwrap().child(0).unwrap();
        let domain = leaf.domain_at();
        assert_eq!(domain.ids().collect::<Vec<_>>(), vec![&Id::new("S1")]);
        // a filter does not restrict its own position
        assert_eq!(schedule.root().child(1).unwrap().domain_at().n_statements(), 3);
    }

    #[test]
    fn test_split_children_of_sequence() {
        let schedule = three_statement_sequence();
        let nested = schedule.root().split_children(&[1, 2]).unwrap();
        assert_eq!(nested.get_type(), NodeType::Sequence);
        assert_eq!(nested.n_children(), 2);
        let root = nested.get_schedule().root();
        assert_eq!(root.n_children(), 2);
        let cover = root.child(1).unwrap();
        let filter = cover.filter().unwrap();
        assert!(filter.set.contains_statement(&Id::new("S1")));
        assert!(filter.set.contains_statement(&Id::new("S2")));
        assert!(!filter.set.contains_statement(&Id::new("S0")));
    }

    #[test]
    fn test_split_children_rejects_gaps_in_sequence() {
        let schedule = three_statement_sequence();
        let err = schedule.root().split_children(&[0, 2]).unwrap_err();
        assert!(matches!(err, MappingError::ScopeSplitFailure(_)));
        assert!(schedule.root().split_children(&[]).is_err());
        assert!(schedule.root().split_children(&[5]).is_err());
    }

    #[test]
    fn test_split_children_of_set_accepts_any_subset() {
        let schedule = ScopBuilder::new()
            .domain("{ S0[i] : 0 <= i <= 3; S1[i] : 0 <= i <= 3; S2[i] : 0 <= i <= 3 }")
            .unwrap()
            .set(&["S0", "S1", "S2"])
            .unwrap()
            .build()
            .schedule;
        let nested = schedule.root().split_children(&[0, 2]).unwrap();
        assert_eq!(nested.get_type(), NodeType::Set);
        assert_eq!(nested.parent().unwrap().parent().unwrap().n_children(), 2);
    }

    #[test]
    fn test_band_split() {
        let scop = ScopBuilder::new()
            .domain("{ S0[i, j] : 0 <= i, j <= 7 }")
            .unwrap()
            .band("[{ S0[i, j] -> [(i)] }, { S0[i, j] -> [(j)] }]")
            .unwrap()
            .build();
        let band = scop.root();
        let outer = band.band_split(1).unwrap();
        assert_eq!(outer.band_n_member(), 1);
        assert_eq!(outer.child(0).unwrap().band_n_member(), 1);
        assert_eq!(outer.band_member_range(0), Interval::new(0, 7));
    }
}
