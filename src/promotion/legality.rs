//! Legality of promoting a reference group.
//!
//! A group is promotable to a memory space when:
//! 1. it holds every reference to its array inside the scope, and no copy
//!    statement of an earlier promotion inside the scope reads or writes
//!    that array;
//! 2. its footprint is a bounded box;
//! 3. the buffer fits the space's capacity;
//! 4. no access hazard appears.
//!
//! Hazards are found by enumerating the scope's instances together with
//! the GPU coordinates that execute them. An *owner* is the coordinate that
//! can see a buffer: the block for shared memory, the (block, thread) pair
//! for private memory. A tag the mapping leaves unconstrained counts as
//! every coordinate along it. The rules:
//!
//! - shared: the scope lies above every thread mapping with more than one
//!   thread, every written element has a single owner, and no element of a
//!   writing scope execution's buffer window is touched by another owner;
//! - private: every element touched has a single owner, with the same
//!   window rule for writes.
//!
//! Enumeration is capped by `MappingConfig::max_enumerated_instances`; a
//! scope beyond the cap is rejected.

use log::debug;
use std::collections::{BTreeMap, BTreeSet};

use super::footprint::{compute_footprint, outer_members, GroupFootprint};
use super::scope::{reference_groups, scope_copies, scope_statements};
use super::ScopedReferenceGroup;
use crate::affine::{Interval, StatementDomain};
use crate::backend::default_backend;
use crate::config::MappingConfig;
use crate::error::{MappingError, Result};
use crate::kernel::{is_in_kernel, kernel_context, kernel_id};
use crate::mapping::{instance_leaves, mapping, path_tags, subtree_tags, Block, MappingTag};
use crate::schedule_tree::{MarkKind, ScheduleNode};
use crate::scop::{Id, MemorySpace, Scop, TaggedAccess};

/// Result of a successful legality check, consumed by the rewriter.
#[derive(Debug, Clone)]
pub(crate) struct GroupAnalysis {
    pub mark: ScheduleNode,
    pub kernel: Id,
    pub footprint: GroupFootprint,
    pub needs_copy_in: bool,
    pub writes: bool,
    pub bytes: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum Coord {
    At(i64),
    Any,
}

type Owner = Vec<Coord>;

const BLOCK_TAGS: [MappingTag; 3] = [
    MappingTag::Block(Block::X),
    MappingTag::Block(Block::Y),
    MappingTag::Block(Block::Z),
];

fn owner_tags(space: MemorySpace) -> &'static [MappingTag] {
    match space {
        MemorySpace::Shared => &BLOCK_TAGS,
        MemorySpace::Private => &MappingTag::ALL,
    }
}

pub(crate) fn resolve_scope(scop: &Scop, mark_id: &Id) -> Result<ScheduleNode> {
    scop.schedule
        .find_mark(mark_id)
        .filter(|n| matches!(n.mark(), Some(m) if m.kind == MarkKind::PromotionScope))
        .ok_or_else(|| MappingError::UnknownScope(mark_id.clone()))
}

/// Check every acceptance rule for `group` in `space`.
pub(crate) fn analyze_group(
    scop: &Scop,
    group: &ScopedReferenceGroup,
    space: MemorySpace,
    config: &MappingConfig,
) -> Result<GroupAnalysis> {
    let mark = resolve_scope(scop, &group.mark_id)?;
    let kernel = kernel_id(&mark)?;

    let statements = scope_statements(scop, &mark);
    let in_scope: BTreeSet<Id> = scop
        .accesses()
        .filter(|(_, a)| a.array == group.array_id && statements.contains(&a.statement))
        .map(|(_, a)| a.reference.clone())
        .collect();
    if group.ref_ids.is_empty() || in_scope != group.ref_ids {
        return Err(MappingError::PartialGroupPromotion(group.array_id.clone()));
    }
    // an inner copy still moves the array between global memory and its
    // own buffer
    if let Some(copy) = scope_copies(scop, &mark).get(&group.array_id) {
        debug!(
            "{} is also accessed by {:?} inside {}",
            group.array_id, copy, group.mark_id
        );
        return Err(MappingError::PartialGroupPromotion(group.array_id.clone()));
    }
    if space == MemorySpace::Shared {
        let context = kernel_context(&mark)?;
        if let Some(tag) = path_tags(&mark)
            .into_iter()
            .find(|t| t.is_thread() && context.extent(*t) > 1)
        {
            return Err(MappingError::PromotionAliasHazard(format!(
                "scope lies below {}, so the threads of a block would share one buffer window",
                tag
            )));
        }
    }

    let footprint = compute_footprint(scop, &mark, group).ok_or_else(|| {
        MappingError::PromotionCapacityExceeded(format!("footprint of {} is unbounded", group.array_id))
    })?;
    let volume = footprint.footprint.volume().ok_or_else(|| {
        MappingError::PromotionCapacityExceeded(format!("footprint of {} overflows", group.array_id))
    })?;
    let element_bytes = scop.element_bytes(&group.array_id, config.default_element_bytes);
    let bytes = (volume.max(0) as u64).saturating_mul(element_bytes);
    match space {
        MemorySpace::Shared => {
            let used: u64 = scop
                .declarations
                .iter()
                .filter(|d| d.kernel == kernel && d.memory == MemorySpace::Shared)
                .map(|d| d.bytes)
                .sum();
            if used + bytes > config.shared_memory_bytes {
                return Err(MappingError::PromotionCapacityExceeded(format!(
                    "{} needs {} bytes of shared memory, {} of {} already used",
                    group.array_id, bytes, used, config.shared_memory_bytes
                )));
            }
        }
        MemorySpace::Private => {
            if volume > config.private_memory_elements {
                return Err(MappingError::PromotionCapacityExceeded(format!(
                    "{} needs {} private elements, limit is {}",
                    group.array_id, volume, config.private_memory_elements
                )));
            }
        }
    }

    // Copies run once per owner, so the owner must already be known at the
    // scope mark.
    let above: BTreeSet<MappingTag> = path_tags(&mark).into_iter().collect();
    let owners = owner_tags(space);
    if let Some(tag) = subtree_tags(&mark)
        .into_iter()
        .find(|t| owners.contains(t) && !above.contains(t))
    {
        return Err(MappingError::PromotionAliasHazard(format!(
            "{} is mapped inside the scope, so one {} buffer would serve several owners",
            tag,
            space.prefix()
        )));
    }

    let writes = group.ref_ids.iter().any(|r| scop.is_written(r));
    let reads = group.ref_ids.iter().any(|r| scop.is_read(r));
    let windows_covered = check_hazards(scop, &mark, group, space, &footprint, config)?;
    Ok(GroupAnalysis {
        mark,
        kernel,
        footprint,
        needs_copy_in: reads || !windows_covered,
        writes,
        bytes,
    })
}

/// Enumerate the scope and apply the ownership rules.
///
/// # Returns
/// Whether every writing scope execution writes its whole buffer window,
/// which lets write-only groups skip the copy-in.
fn check_hazards(
    scop: &Scop,
    mark: &ScheduleNode,
    group: &ScopedReferenceGroup,
    space: MemorySpace,
    footprint: &GroupFootprint,
    config: &MappingConfig,
) -> Result<bool> {
    let extents = kernel_context(mark)?.extents();
    let outer = outer_members(mark);
    let owner_indices: Vec<usize> = owner_tags(space).iter().map(|t| t.index()).collect();

    let mut refs: BTreeMap<&Id, Vec<(&TaggedAccess, bool)>> = BTreeMap::new();
    for id in &group.ref_ids {
        if let Some(access) = scop.reference(id) {
            refs.entry(&access.statement)
                .or_default()
                .push((access, scop.is_written(id)));
        }
    }

    let backend = default_backend();
    let instances = refs
        .keys()
        .filter_map(|stmt| scop.domain.get(*stmt).map(|d| backend.cardinality(stmt, d)))
        .fold(0u64, u64::saturating_add);
    if instances > config.max_enumerated_instances {
        return Err(MappingError::PromotionAliasHazard(format!(
            "{} has {} instances in scope, more than the analysis budget of {}",
            group.array_id, instances, config.max_enumerated_instances
        )));
    }

    let mut budget = config.max_enumerated_instances;
    let mut spend = |what: &str| -> Result<()> {
        if budget == 0 {
            return Err(MappingError::PromotionAliasHazard(format!(
                "{} exceeds the analysis budget while enumerating {}",
                group.array_id, what
            )));
        }
        budget -= 1;
        Ok(())
    };

    let mut touched: BTreeMap<Vec<i64>, BTreeSet<Owner>> = BTreeMap::new();
    let mut written: BTreeMap<(Vec<i64>, Owner), BTreeSet<Vec<i64>>> = BTreeMap::new();
    for leaf in instance_leaves(mark) {
        let set = mapping(&leaf);
        let domain = leaf.domain_at();
        for (stmt, stmt_refs) in &refs {
            if !set.contains_statement(stmt) {
                continue;
            }
            let Some(stmt_domain) = domain.get(stmt) else {
                continue;
            };
            for point in stmt_domain.points() {
                spend("instances")?;
                let Some(coordinate) = set.coordinate_of(stmt, &point) else {
                    continue;
                };
                let owner: Owner = owner_indices
                    .iter()
                    .map(|&k| match coordinate[k] {
                        Some(v) => Coord::At(v),
                        None if extents[k] == 1 => Coord::At(0),
                        None => Coord::Any,
                    })
                    .collect();
                let outer_values: Vec<i64> = outer
                    .iter()
                    .map(|m| m.expr(stmt).map_or(0, |e| e.eval(&point)))
                    .collect();
                for (access, is_write) in stmt_refs {
                    let element: Vec<i64> = access.index.iter().map(|e| e.eval(&point)).collect();
                    touched.entry(element.clone()).or_default().insert(owner.clone());
                    if *is_write {
                        written
                            .entry((outer_values.clone(), owner.clone()))
                            .or_default()
                            .insert(element);
                    }
                }
            }
        }
    }

    let shared_by_many = |owners: &BTreeSet<Owner>| {
        owners.len() > 1 || owners.iter().any(|o| o.contains(&Coord::Any))
    };
    for elements in written.values() {
        for element in elements {
            if touched.get(element).is_some_and(shared_by_many) {
                return Err(MappingError::PromotionAliasHazard(format!(
                    "element {:?} of {} is written and accessed by several owners",
                    element, group.array_id
                )));
            }
        }
    }
    if space == MemorySpace::Private {
        if let Some((element, _)) = touched.iter().find(|(_, owners)| shared_by_many(*owners)) {
            return Err(MappingError::PromotionAliasHazard(format!(
                "element {:?} of {} is accessed by several threads",
                element, group.array_id
            )));
        }
    }

    // copy-out writes the whole window of each writing execution
    let sizes = &footprint.footprint.sizes;
    let mut covered = true;
    for ((outer_values, owner), elements) in &written {
        let bounds: Vec<Interval> = footprint
            .footprint
            .origin
            .iter()
            .zip(sizes)
            .map(|(origin, &size)| {
                let base = origin.eval(outer_values);
                Interval::new(base, base + size - 1)
            })
            .collect();
        let window = StatementDomain::new(Vec::new(), bounds);
        for element in window.points() {
            spend("copy-out windows")?;
            if let Some(owners) = touched.get(&element) {
                if owners.iter().any(|o| o != owner) {
                    return Err(MappingError::PromotionAliasHazard(format!(
                        "copy-out of {} would overwrite element {:?} used by another owner",
                        group.array_id, element
                    )));
                }
            }
            if !elements.contains(&element) {
                covered = false;
            }
        }
    }
    Ok(covered)
}

fn promotable(scop: &Scop, space: MemorySpace, config: &MappingConfig) -> BTreeSet<ScopedReferenceGroup> {
    let mut out = BTreeSet::new();
    for mark in scop.schedule.find_marks(|m| m.kind == MarkKind::PromotionScope) {
        if !is_in_kernel(&mark) {
            continue;
        }
        let Ok(groups) = reference_groups(scop, &mark) else {
            continue;
        };
        for group in groups {
            match analyze_group(scop, &group, space, config) {
                Ok(_) => {
                    out.insert(group);
                }
                Err(err) => debug!(
                    "{} in {} is not promotable to {} memory: {}",
                    group.array_id,
                    group.mark_id,
                    space.prefix(),
                    err
                ),
            }
        }
    }
    out
}

/// Groups that may be placed in shared memory.
pub fn promotable_to_shared(scop: &Scop, config: &MappingConfig) -> BTreeSet<ScopedReferenceGroup> {
    promotable(scop, MemorySpace::Shared, config)
}

/// Groups that may be placed in private memory.
pub fn promotable_to_private(scop: &Scop, config: &MappingConfig) -> BTreeSet<ScopedReferenceGroup> {
    promotable(scop, MemorySpace::Private, config)
}
