//! Promotion scopes and reference groups.

use log::debug;
use std::collections::{BTreeMap, BTreeSet};

use super::ScopedReferenceGroup;
use crate::error::{MappingError, Result};
use crate::mapping::instance_leaves;
use crate::schedule_tree::{MarkKind, NodeType, ScheduleNode};
use crate::scop::{Id, Scop};

fn is_branching(node: &ScheduleNode) -> bool {
    matches!(node.get_type(), NodeType::Sequence | NodeType::Set)
}

fn commit_scope(scop: &mut Scop, node: ScheduleNode) -> ScheduleNode {
    let id = scop.fresh_id("promotion_scope");
    let mark = node.insert_mark(id.clone(), MarkKind::PromotionScope);
    debug!("defined promotion scope {} at {:?}", id, mark.path());
    scop.schedule = mark.get_schedule();
    mark
}

/// Mark the subtree at `node` as a promotion scope.
///
/// When `node` is a child of a sequence or set, the parent is first split
/// so that the mark covers exactly `node` and the children of the parent
/// stay filters.
///
/// # Returns
/// The new scope mark.
pub fn define_promotion_scope(scop: &mut Scop, node: ScheduleNode) -> Result<ScheduleNode> {
    match (node.parent(), node.child_position()) {
        (Some(parent), Some(pos)) if is_branching(&parent) => {
            define_promotion_scope_over(scop, parent, &[pos])
        }
        _ => Ok(commit_scope(scop, node)),
    }
}

/// Mark a subset of the children of a sequence or set as one scope.
///
/// # Errors
/// `ScopeSplitFailure` when `parent` is not a sequence or set, or when the
/// selection cannot be grouped without reordering (see
/// [`ScheduleNode::split_children`]).
pub fn define_promotion_scope_over(
    scop: &mut Scop,
    parent: ScheduleNode,
    indices: &[usize],
) -> Result<ScheduleNode> {
    if !is_branching(&parent) {
        return Err(MappingError::ScopeSplitFailure(format!(
            "cannot scope children of a {:?} node",
            parent.get_type()
        )));
    }
    let nested = parent.split_children(indices)?;
    Ok(commit_scope(scop, nested))
}

/// Computation statements executed under `node`.
pub(crate) fn scope_statements(scop: &Scop, node: &ScheduleNode) -> BTreeSet<Id> {
    instance_leaves(node)
        .iter()
        .flat_map(|leaf| leaf.domain_at().ids().cloned().collect::<Vec<_>>())
        .filter(|id| scop.is_computation(id))
        .collect()
}

/// Copy statements executed under `node`, by the array they copy.
pub(crate) fn scope_copies(scop: &Scop, node: &ScheduleNode) -> BTreeMap<Id, BTreeSet<Id>> {
    let mut copies: BTreeMap<Id, BTreeSet<Id>> = BTreeMap::new();
    for leaf in instance_leaves(node) {
        for id in leaf.domain_at().ids() {
            if let Some(array) = scop.copied_array(id) {
                copies.entry(array.clone()).or_default().insert(id.clone());
            }
        }
    }
    copies
}

/// One group per array accessed under the scope mark, buffers excluded.
/// Copy statements of earlier promotions count as accesses to the array
/// they copy, so such an array gets a group even when no computation
/// reference to it is left; that group is never promotable.
///
/// # Errors
/// `UnknownScope` if `mark` is not a promotion scope mark.
pub fn reference_groups(scop: &Scop, mark: &ScheduleNode) -> Result<Vec<ScopedReferenceGroup>> {
    let mark_id = match mark.mark() {
        Some(m) if m.kind == MarkKind::PromotionScope => m.id.clone(),
        Some(m) => return Err(MappingError::UnknownScope(m.id.clone())),
        None => {
            return Err(MappingError::InvalidNode(format!(
                "expected a promotion scope mark, found {:?}",
                mark.get_type()
            )))
        }
    };
    let statements = scope_statements(scop, mark);
    let mut by_array: BTreeMap<Id, BTreeSet<Id>> = BTreeMap::new();
    for (_, access) in scop.accesses() {
        if statements.contains(&access.statement) && !scop.is_buffer(&access.array) {
            by_array
                .entry(access.array.clone())
                .or_default()
                .insert(access.reference.clone());
        }
    }
    for array in scope_copies(scop, mark).into_keys() {
        by_array.entry(array).or_default();
    }
    Ok(by_array
        .into_iter()
        .map(|(array_id, ref_ids)| ScopedReferenceGroup {
            mark_id: mark_id.clone(),
            array_id,
            ref_ids,
        })
        .collect())
}
