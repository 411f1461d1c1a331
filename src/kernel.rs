//! Kernel boundaries.
//!
//! A kernel is the subtree below a `Mark(kernel_N)` node, laid out as
//!
//! ```text
//! Mark(kernel_N) -> [Guard] -> Context{grid, block} -> body
//! ```
//!
//! Queries locate the nearest kernel mark among a node's ancestors (or the
//! node itself). Finalization pads every leaf to the same mapped depth,
//! inserts barriers between sequence children with different thread
//! mappings and shrinks the launch bounds to the coordinates in use.

use log::{debug, info};
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::affine::InstanceSet;
use crate::band_mapper::map_fixed;
use crate::config::MappingConfig;
use crate::error::{MappingError, Result};
use crate::mapping::{instance_leaves, is_barrier, mapping, path_tags, thread_signature, MappingTag};
use crate::schedule_tree::{
    Filter, KernelContext, Mark, MarkKind, NodeKind, NodeType, Schedule, ScheduleNode, TreeNode,
};
use crate::scop::{Id, Scop};

// ============================================================================
// Queries
// ============================================================================

/// Nearest kernel mark among `node` and its ancestors.
pub fn enclosing_kernel(node: &ScheduleNode) -> Option<ScheduleNode> {
    std::iter::once(node.clone())
        .chain(node.ancestors())
        .find(|n| matches!(n.mark(), Some(m) if m.kind == MarkKind::Kernel))
}

pub fn is_in_kernel(node: &ScheduleNode) -> bool {
    enclosing_kernel(node).is_some()
}

pub fn kernel_id(node: &ScheduleNode) -> Result<Id> {
    enclosing_kernel(node)
        .and_then(|m| m.mark().map(|mark| mark.id.clone()))
        .ok_or(MappingError::NoEnclosingKernel)
}

/// Context node of the kernel whose mark is `mark`.
fn context_node(mark: &ScheduleNode) -> Result<ScheduleNode> {
    let mut node = mark.descend(0)?;
    if node.get_type() == NodeType::Guard {
        node = node.descend(0)?;
    }
    match node.get_type() {
        NodeType::Context => Ok(node),
        other => Err(MappingError::InvalidNode(format!(
            "kernel mark is followed by {:?} instead of a context",
            other
        ))),
    }
}

/// Launch configuration of the kernel enclosing `node`.
pub fn kernel_context(node: &ScheduleNode) -> Result<KernelContext> {
    let mark = enclosing_kernel(node).ok_or(MappingError::NoEnclosingKernel)?;
    match context_node(&mark)?.kind() {
        NodeKind::Context(context) => Ok(*context),
        _ => Err(MappingError::InvalidNode("kernel without context".to_string())),
    }
}

pub fn kernel_grid(node: &ScheduleNode) -> Result<[i64; 3]> {
    Ok(kernel_context(node)?.grid)
}

pub fn kernel_block(node: &ScheduleNode) -> Result<[i64; 3]> {
    Ok(kernel_context(node)?.block)
}

pub(crate) fn kernel_extent(node: &ScheduleNode, tag: MappingTag) -> Result<i64> {
    Ok(kernel_context(node)?.extent(tag))
}

/// First node below the kernel's context.
pub fn kernel_body(mark: &ScheduleNode) -> Result<ScheduleNode> {
    context_node(mark)?.descend(0)
}

fn require_kernel_mark(node: &ScheduleNode) -> Result<Id> {
    match node.mark() {
        Some(mark) if mark.kind == MarkKind::Kernel => Ok(mark.id.clone()),
        _ => Err(MappingError::NoEnclosingKernel),
    }
}

fn resolve(schedule: &Schedule, id: &Id) -> Result<ScheduleNode> {
    schedule
        .find_mark(id)
        .ok_or_else(|| MappingError::InvalidNode(format!("mark {} disappeared", id)))
}

// ============================================================================
// Kernel creation
// ============================================================================

/// Open a kernel above `node` and commit the new schedule to `scop`.
///
/// When `node` is the filter child of a sequence or set, the kernel is
/// placed below that filter.
///
/// # Returns
/// The new kernel mark.
///
/// # Errors
/// `MappingInfeasible` for non-positive sizes, an empty instance set at
/// `node`, or a node already inside a kernel.
pub fn init_kernel(
    scop: &mut Scop,
    node: ScheduleNode,
    block: [i64; 3],
    grid: [i64; 3],
    config: &MappingConfig,
) -> Result<ScheduleNode> {
    if block.iter().chain(grid.iter()).any(|&s| s <= 0) {
        return Err(MappingError::MappingInfeasible(format!(
            "launch sizes must be positive, got grid {:?} block {:?}",
            grid, block
        )));
    }
    if is_in_kernel(&node) {
        return Err(MappingError::MappingInfeasible(
            "kernels cannot be nested".to_string(),
        ));
    }
    let in_branch = node
        .parent()
        .is_some_and(|p| matches!(p.get_type(), NodeType::Sequence | NodeType::Set));
    let node = if in_branch { node.descend(0)? } else { node };

    let domain = node.domain_at();
    if domain.is_empty() {
        return Err(MappingError::MappingInfeasible(
            "no statement instance reaches the kernel".to_string(),
        ));
    }
    let id = scop.fresh_id("kernel");
    let mut top = node.insert_context(KernelContext { grid, block });
    if config.insert_guard {
        let live = domain.iter().filter(|(_, d)| !d.is_empty()).map(|(id, _)| id);
        top = top.insert_guard(InstanceSet::from_statements(live));
    }
    let mark = top.insert_mark(id.clone(), MarkKind::Kernel);
    info!("opened {} with grid {:?} and block {:?}", id, grid, block);
    scop.schedule = mark.get_schedule();
    Ok(mark)
}

// ============================================================================
// Finalization
// ============================================================================

/// Pad each leaf of the kernel with fixed mappings for the tags other
/// leaves map, so every leaf ends at the same mapped depth.
///
/// # Errors
/// `DepthReconciliationFailure` when a tag is mapped twice on one path.
pub fn pad_kernel_mapping(mark: ScheduleNode) -> Result<ScheduleNode> {
    let id = require_kernel_mark(&mark)?;
    let leaves = instance_leaves(&mark);
    let mut required = BTreeSet::new();
    let mut per_leaf = Vec::with_capacity(leaves.len());
    for leaf in &leaves {
        let tags = path_tags(leaf);
        let unique: BTreeSet<MappingTag> = tags.iter().copied().collect();
        if unique.len() != tags.len() {
            return Err(MappingError::DepthReconciliationFailure(format!(
                "leaf at {:?} maps a tag more than once: {:?}",
                leaf.path(),
                tags
            )));
        }
        required.extend(unique.iter().copied());
        per_leaf.push(unique);
    }

    let mut schedule = mark.into_schedule();
    for (leaf, tags) in leaves.iter().zip(per_leaf) {
        let missing: Vec<MappingTag> = required.difference(&tags).copied().collect();
        if missing.is_empty() {
            continue;
        }
        let mut node = schedule
            .node_at(leaf.path())
            .ok_or_else(|| MappingError::InvalidNode(format!("lost leaf {:?}", leaf.path())))?;
        debug!("padding leaf {:?} with {:?}", leaf.path(), missing);
        for tag in missing {
            node = map_fixed(node, tag)?;
        }
        schedule = node.into_schedule();
    }
    resolve(&schedule, &id)
}

fn thread_depths(node: &ScheduleNode) -> BTreeSet<Vec<MappingTag>> {
    instance_leaves(node)
        .iter()
        .map(|leaf| {
            let mut tags: Vec<MappingTag> = path_tags(leaf).into_iter().filter(|t| t.is_thread()).collect();
            tags.sort();
            tags
        })
        .collect()
}

fn is_barrier_branch(child: &ScheduleNode) -> bool {
    child.child(0).is_some_and(|c| is_barrier(&c))
}

/// `Filter({}) -> Mark(barrier) -> Leaf`, the sequence child used for
/// synchronization.
pub(crate) fn barrier_branch(id: Id) -> Arc<TreeNode> {
    let mark = TreeNode::wrap(
        NodeKind::Mark(Mark {
            id,
            kind: MarkKind::Barrier,
        }),
        TreeNode::leaf(),
    );
    TreeNode::wrap(NodeKind::Filter(Filter::statements(InstanceSet::empty())), mark)
}

fn insert_barriers(mark: ScheduleNode) -> Result<ScheduleNode> {
    let id = require_kernel_mark(&mark)?;
    let branching: Vec<ScheduleNode> = mark
        .descendants()
        .into_iter()
        .filter(|n| matches!(n.get_type(), NodeType::Sequence | NodeType::Set))
        .collect();
    for node in &branching {
        if thread_depths(node).len() > 1 {
            return Err(MappingError::DepthReconciliationFailure(format!(
                "children of {:?} at {:?} reach different thread depths",
                node.get_type(),
                node.path()
            )));
        }
    }
    let threads: i64 = kernel_context(&mark)?.block.iter().product();
    if threads == 1 {
        return Ok(mark);
    }

    let mut counter = mark.descendants().iter().filter(|n| is_barrier(n)).count();
    let mut schedule = mark.get_schedule();
    // later sequences first, so earlier paths stay valid
    for seq in branching.iter().rev().filter(|n| n.get_type() == NodeType::Sequence) {
        let seq = schedule
            .node_at(seq.path())
            .ok_or_else(|| MappingError::InvalidNode(format!("lost sequence {:?}", seq.path())))?;
        let mut gaps = Vec::new();
        for i in 1..seq.n_children() {
            let (a, b) = (seq.descend(i - 1)?, seq.descend(i)?);
            if is_barrier_branch(&a) || is_barrier_branch(&b) {
                continue;
            }
            if thread_signature(&a) != thread_signature(&b) {
                gaps.push(i);
            }
        }
        if gaps.is_empty() {
            continue;
        }
        let mut children = seq.tree().children.clone();
        for &gap in gaps.iter().rev() {
            let sync = Id::new(format!("{}_sync_{}", id, counter));
            counter += 1;
            children.insert(gap, barrier_branch(sync));
        }
        debug!("inserting {} barrier(s) into sequence {:?}", gaps.len(), seq.path());
        schedule = seq.graft(TreeNode::new(NodeKind::Sequence, children)).into_schedule();
    }
    resolve(&schedule, &id)
}

fn shrink_launch_bounds(mark: ScheduleNode) -> Result<ScheduleNode> {
    let id = require_kernel_mark(&mark)?;
    let context = kernel_context(&mark)?;
    let mut max_coordinate: [Option<i64>; 6] = [None; 6];
    for leaf in instance_leaves(&mark) {
        let domain = leaf.domain_at();
        for (stmt, constraints) in mapping(&leaf).iter() {
            let Some(stmt_domain) = domain.get(stmt).filter(|d| !d.is_empty()) else {
                continue;
            };
            for constraint in constraints {
                let range = constraint.coordinate_range(stmt_domain);
                if range.is_empty() {
                    continue;
                }
                let slot = &mut max_coordinate[constraint.tag().index()];
                *slot = Some(slot.map_or(range.hi, |m| m.max(range.hi)));
            }
        }
    }
    let mut shrunk = context;
    for tag in MappingTag::ALL {
        let Some(max) = max_coordinate[tag.index()] else {
            continue;
        };
        let extent = context.extent(tag).min(max + 1).max(1);
        match tag {
            MappingTag::Block(b) => shrunk.grid[b.index()] = extent,
            MappingTag::Thread(t) => shrunk.block[t.index()] = extent,
        }
    }
    if shrunk == context {
        return Ok(mark);
    }
    debug!(
        "shrinking {} from grid {:?} block {:?} to grid {:?} block {:?}",
        id, context.grid, context.block, shrunk.grid, shrunk.block
    );
    let schedule = context_node(&mark)?
        .replace_kind(NodeKind::Context(shrunk))
        .into_schedule();
    resolve(&schedule, &id)
}

/// Complete a kernel: pad, synchronize and, when configured, shrink the
/// launch bounds.
///
/// # Errors
/// `NoEnclosingKernel` if `mark` is not a kernel mark;
/// `DepthReconciliationFailure` when padding cannot equalize mapped depths.
pub fn finalize_kernel(mark: ScheduleNode, config: &MappingConfig) -> Result<ScheduleNode> {
    let id = require_kernel_mark(&mark)?;
    let mark = pad_kernel_mapping(mark)?;
    let mark = insert_barriers(mark)?;
    let mark = if config.shrink_launch_bounds {
        shrink_launch_bounds(mark)?
    } else {
        mark
    };
    let context = kernel_context(&mark)?;
    info!(
        "finalized {} with grid {:?} and block {:?}",
        id, context.grid, context.block
    );
    Ok(mark)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::band_mapper::map_band_dim;
    use crate::mapping::{is_mapped, Thread};
    use crate::scop::{band_from_str, ScopBuilder};

    /// `S0` and `S1` in sequence, each under its own parallel band.
    fn two_statement_sequence() -> Scop {
        let mut scop = ScopBuilder::new()
            .domain("{ S0[i] : 0 <= i < 32; S1[i] : 0 <= i < 32 }")
            .unwrap()
            .write("{ S0[i] -> A[i] }")
            .unwrap()
            .read("{ S1[i] -> A[i] }")
            .unwrap()
            .sequence(&["S0", "S1"])
            .unwrap()
            .build();
        for (pos, text) in [(0, "[{ S0[i] -> [(i)] }]"), (1, "[{ S1[i] -> [(i)] }]")] {
            let band = band_from_str(&scop, text).unwrap().parallel();
            let leaf = scop.schedule.node_at(&[pos, 0]).unwrap();
            scop.schedule = leaf.insert_partial_schedule(band).into_schedule();
        }
        scop
    }

    #[test]
    fn test_init_kernel_layout() {
        let mut scop = two_statement_sequence();
        let root = scop.root();
        let mark = init_kernel(&mut scop, root, [32, 1, 1], [1, 1, 1], &MappingConfig::default()).unwrap();
        assert_eq!(mark.get_type(), NodeType::Mark);
        assert_eq!(mark.child(0).unwrap().get_type(), NodeType::Guard);
        assert_eq!(kernel_body(&mark).unwrap().get_type(), NodeType::Sequence);
        assert_eq!(kernel_block(&mark).unwrap(), [32, 1, 1]);
        assert_eq!(kernel_grid(&kernel_body(&mark).unwrap()).unwrap(), [1, 1, 1]);
        assert!(kernel_id(&mark).unwrap().name().starts_with("kernel_"));
        assert_eq!(scop.schedule, mark.get_schedule());
    }

    #[test]
    fn test_init_kernel_rejects_bad_input() {
        let mut scop = two_statement_sequence();
        let config = MappingConfig::default();
        let root = scop.root();
        assert!(matches!(
            init_kernel(&mut scop, root, [0, 1, 1], [1, 1, 1], &config),
            Err(MappingError::MappingInfeasible(_))
        ));
        let root = scop.root();
        let mark = init_kernel(&mut scop, root, [32, 1, 1], [1, 1, 1], &config).unwrap();
        let body = kernel_body(&mark).unwrap();
        assert!(matches!(
            init_kernel(&mut scop, body, [32, 1, 1], [1, 1, 1], &config),
            Err(MappingError::MappingInfeasible(_))
        ));
        assert_eq!(kernel_id(&scop.root().child(0).unwrap()).unwrap(), kernel_id(&mark).unwrap());
        let outside = two_statement_sequence();
        assert_eq!(kernel_grid(&outside.root()), Err(MappingError::NoEnclosingKernel));
    }

    fn map_first_branch(scop: &mut Scop, block: [i64; 3]) -> ScheduleNode {
        let root = scop.root();
        let mark = init_kernel(scop, root, block, [1, 1, 1], &MappingConfig::default()).unwrap();
        let id = mark.mark().unwrap().id.clone();
        let band = kernel_body(&mark).unwrap().descend(0).unwrap().descend(0).unwrap();
        let mapped = map_band_dim(band, 0, Thread::X).unwrap();
        mapped.get_schedule().find_mark(&id).unwrap()
    }

    #[test]
    fn test_pad_kernel_mapping_fixes_other_branch() {
        let mut scop = two_statement_sequence();
        let mark = map_first_branch(&mut scop, [32, 1, 1]);
        let padded = pad_kernel_mapping(mark).unwrap();
        let leaves = instance_leaves(&padded);
        assert_eq!(leaves.len(), 2);
        assert!(leaves.iter().all(|leaf| is_mapped(leaf, Thread::X)));
    }

    #[test]
    fn test_finalize_inserts_barrier_between_differently_mapped_children() {
        let mut scop = two_statement_sequence();
        let mark = map_first_branch(&mut scop, [32, 1, 1]);
        let done = finalize_kernel(mark, &MappingConfig::default()).unwrap();
        let body = kernel_body(&done).unwrap();
        assert_eq!(body.n_children(), 3);
        assert!(is_barrier_branch(&body.child(1).unwrap()));
        // barrier leaves are not instance leaves
        assert_eq!(instance_leaves(&done).len(), 2);
    }

    #[test]
    fn test_barriers_require_uniform_thread_depth() {
        // without padding only the first branch maps Thread.x
        let mut scop = two_statement_sequence();
        let mark = map_first_branch(&mut scop, [32, 1, 1]);
        assert!(matches!(
            insert_barriers(mark.clone()),
            Err(MappingError::DepthReconciliationFailure(_))
        ));
        let padded = pad_kernel_mapping(mark).unwrap();
        assert!(insert_barriers(padded).is_ok());
    }

    #[test]
    fn test_single_thread_kernel_needs_no_barrier() {
        let mut scop = two_statement_sequence();
        let mark = map_first_branch(&mut scop, [1, 1, 1]);
        let done = finalize_kernel(mark, &MappingConfig::default()).unwrap();
        assert_eq!(kernel_body(&done).unwrap().n_children(), 2);
    }

    #[test]
    fn test_shrink_launch_bounds() {
        let mut scop = two_statement_sequence();
        let mark = map_first_branch(&mut scop, [64, 1, 1]);
        let done = finalize_kernel(mark.clone(), &MappingConfig::default()).unwrap();
        // i spans 32 values; the grid has no block mapping and keeps its extent
        assert_eq!(kernel_block(&done).unwrap(), [32, 1, 1]);
        assert_eq!(kernel_grid(&done).unwrap(), [1, 1, 1]);

        let config = MappingConfig {
            shrink_launch_bounds: false,
            ..MappingConfig::default()
        };
        let kept = finalize_kernel(mark, &config).unwrap();
        assert_eq!(kernel_block(&kept).unwrap(), [64, 1, 1]);
    }
}
