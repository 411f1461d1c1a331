//! Promotion rewriting.
//!
//! Promoting a group turns the scope mark's subtree `T` into
//!
//! ```text
//! Mark(scope) -> Extension{copy_in, copy_out}
//!   -> Sequence
//!        Filter{copy_in}  -> Leaf
//!        (barrier)                       shared memory only
//!        Filter{body}     -> T
//!        (barrier)                       shared memory only
//!        Filter{copy_out} -> Leaf
//! ```
//!
//! and retargets every reference of the group to the new buffer.

use log::info;
use std::sync::Arc;

use super::legality::analyze_group;
use super::ScopedReferenceGroup;
use crate::affine::{InstanceSet, Interval, StatementDomain};
use crate::band_mapper::map_fixed;
use crate::config::MappingConfig;
use crate::error::{MappingError, Result};
use crate::kernel::barrier_branch;
use crate::mapping::{path_tags, subtree_tags, MappingTag};
use crate::schedule_tree::{CopyStatement, Extension, Filter, NodeKind, Origin, TreeNode};
use crate::scop::{CopyDirection, Declaration, Id, MemorySpace, Scop, StatementInfo};

/// Place `group` in shared memory.
///
/// # Returns
/// The id of the new buffer.
///
/// # Errors
/// The reason the group is not in
/// [`promotable_to_shared`](super::promotable_to_shared).
pub fn promote_to_shared(scop: &mut Scop, group: &ScopedReferenceGroup, config: &MappingConfig) -> Result<Id> {
    promote(scop, group, MemorySpace::Shared, config)
}

/// Place `group` in private memory.
pub fn promote_to_private(scop: &mut Scop, group: &ScopedReferenceGroup, config: &MappingConfig) -> Result<Id> {
    promote(scop, group, MemorySpace::Private, config)
}

fn copy_statement(
    scop: &mut Scop,
    direction: CopyDirection,
    group: &ScopedReferenceGroup,
    buffer: &Id,
    domain: &StatementDomain,
    origin: &[Origin],
) -> CopyStatement {
    let prefix = match direction {
        CopyDirection::In => "copy_in",
        CopyDirection::Out => "copy_out",
    };
    let id = scop.fresh_id(prefix);
    scop.statements.insert(
        id.clone(),
        StatementInfo::copy(direction, group.array_id.clone(), buffer.clone()),
    );
    CopyStatement {
        id,
        direction,
        array: group.array_id.clone(),
        buffer: buffer.clone(),
        domain: domain.clone(),
        origin: origin.to_vec(),
    }
}

fn copy_branch(copy: &CopyStatement) -> Arc<TreeNode> {
    let set = InstanceSet::from_statements([&copy.id]);
    TreeNode::wrap(NodeKind::Filter(Filter::statements(set)), TreeNode::leaf())
}

fn promote(
    scop: &mut Scop,
    group: &ScopedReferenceGroup,
    space: MemorySpace,
    config: &MappingConfig,
) -> Result<Id> {
    let analysis = analyze_group(scop, group, space, config)?;
    let footprint = &analysis.footprint.footprint;
    let buffer = scop.fresh_id(&format!("{}_{}", space.prefix(), group.array_id));

    for access in scop.accesses_mut() {
        if let Some(index) = analysis.footprint.redirected.get(&access.reference) {
            access.array = buffer.clone();
            access.index = index.clone();
        }
    }

    let domain = StatementDomain::new(
        (0..footprint.sizes.len()).map(|d| format!("b{}", d)).collect(),
        footprint.sizes.iter().map(|&s| Interval::new(0, s - 1)).collect(),
    );
    let copy_in = analysis
        .needs_copy_in
        .then(|| copy_statement(scop, CopyDirection::In, group, &buffer, &domain, &footprint.origin));
    let copy_out = analysis
        .writes
        .then(|| copy_statement(scop, CopyDirection::Out, group, &buffer, &domain, &footprint.origin));

    let body = analysis.mark.descend(0)?;
    let body_set = InstanceSet::from_statements(body.domain_at().ids());
    let mut branches = Vec::new();
    let mut copy_positions = Vec::new();
    if let Some(copy) = &copy_in {
        copy_positions.push(branches.len());
        branches.push(copy_branch(copy));
        if space == MemorySpace::Shared {
            branches.push(barrier_branch(scop.fresh_id("sync")));
        }
    }
    branches.push(TreeNode::wrap(
        NodeKind::Filter(Filter::statements(body_set)),
        body.tree().clone(),
    ));
    if let Some(copy) = &copy_out {
        if space == MemorySpace::Shared {
            branches.push(barrier_branch(scop.fresh_id("sync")));
        }
        copy_positions.push(branches.len());
        branches.push(copy_branch(copy));
    }

    // copies run once per owner: fix the coordinates the body maps below
    // the scope
    let above: Vec<MappingTag> = path_tags(&analysis.mark);
    let missing: Vec<MappingTag> = subtree_tags(&analysis.mark)
        .into_iter()
        .filter(|t| !above.contains(t))
        .collect();

    let statements = copy_in.into_iter().chain(copy_out).collect();
    let extension = TreeNode::wrap(
        NodeKind::Extension(Extension { statements }),
        TreeNode::new(NodeKind::Sequence, branches),
    );
    let grafted = body.graft(extension);
    let base = grafted.path().to_vec();
    let mut schedule = grafted.into_schedule();
    for pos in copy_positions {
        let mut path = base.clone();
        path.extend([0, pos, 0]);
        let mut leaf = schedule
            .node_at(&path)
            .ok_or_else(|| MappingError::InvalidNode(format!("lost copy leaf {:?}", path)))?;
        for &tag in &missing {
            leaf = map_fixed(leaf, tag)?;
        }
        schedule = leaf.into_schedule();
    }
    scop.schedule = schedule;

    scop.declarations.push(Declaration {
        kernel: analysis.kernel.clone(),
        buffer: buffer.clone(),
        array: group.array_id.clone(),
        memory: space,
        sizes: footprint.sizes.clone(),
        bytes: analysis.bytes,
    });
    info!(
        "promoted {} in {} to {} buffer {} of size {:?}",
        group.array_id,
        group.mark_id,
        space.prefix(),
        buffer,
        footprint.sizes
    );
    Ok(buffer)
}
