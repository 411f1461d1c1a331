//! End-to-end mapping of a band to a GPU kernel.
//!
//! `map_to_gpu` tiles the band, opens a kernel above it, maps coincident
//! tile members to blocks and coincident point members to threads, and
//! finalizes the kernel. Work happens on a clone of the Scop, so a failing
//! step leaves the caller's Scop untouched.

use log::{debug, info, warn};

use crate::band_mapper::{map_band_dim, tile};
use crate::block_printer::schedule_to_block_str;
use crate::config::MappingConfig;
use crate::error::{MappingError, Result};
use crate::kernel::{finalize_kernel, init_kernel, kernel_body, kernel_context};
use crate::mapping::{Block, MappingTag, Thread};
use crate::schedule_tree::{NodeType, ScheduleNode};
use crate::scop::Scop;

/// Map the first band at or below `node` to a GPU kernel with the default
/// configuration.
///
/// `block` and `grid` hold the requested launch sizes on entry. On success
/// they hold the sizes of the finalized kernel and `scop.schedule` is
/// replaced; on failure both are left as they were.
///
/// # Example
/// ```
/// use polygpu::scop::ScopBuilder;
/// use polygpu::strategy::map_to_gpu;
///
/// let mut scop = ScopBuilder::new()
///     .domain("{ S0[i] : 0 <= i <= 255 }")?
///     .write("{ S0[i] -> A[i] }")?
///     .parallel_band("[{ S0[i] -> [(i)] }]")?
///     .build();
/// let mut block = [32, 1, 1];
/// let mut grid = [8, 1, 1];
/// let root = scop.root();
/// assert!(map_to_gpu(&mut scop, root, &[32], &mut block, &mut grid));
/// assert_eq!(block, [32, 1, 1]);
/// assert_eq!(grid, [8, 1, 1]);
/// # Ok::<(), polygpu::parse::ParseError>(())
/// ```
pub fn map_to_gpu(
    scop: &mut Scop,
    node: ScheduleNode,
    tiles: &[i64],
    block: &mut [i64; 3],
    grid: &mut [i64; 3],
) -> bool {
    map_to_gpu_with_config(scop, node, tiles, block, grid, &MappingConfig::default())
}

/// [`map_to_gpu`] with an explicit configuration.
pub fn map_to_gpu_with_config(
    scop: &mut Scop,
    node: ScheduleNode,
    tiles: &[i64],
    block: &mut [i64; 3],
    grid: &mut [i64; 3],
    config: &MappingConfig,
) -> bool {
    let mut work = scop.clone();
    match try_map_to_gpu(&mut work, node, tiles, *block, *grid, config) {
        Ok((new_block, new_grid)) => {
            *block = new_block;
            *grid = new_grid;
            *scop = work;
            true
        }
        Err(err) => {
            warn!("mapping to GPU failed: {}", err);
            false
        }
    }
}

/// First band reached from `node` through single-child nodes.
fn find_band(node: ScheduleNode) -> Result<ScheduleNode> {
    let mut current = node;
    loop {
        if current.get_type() == NodeType::Band {
            return Ok(current);
        }
        if current.n_children() != 1 {
            return Err(MappingError::MappingInfeasible(format!(
                "no band below {:?} node at {:?}",
                current.get_type(),
                current.path()
            )));
        }
        current = current.descend(0)?;
    }
}

/// Members to map, in band order, with their tags.
struct Plan {
    assignments: Vec<(usize, MappingTag)>,
    block: [i64; 3],
    grid: [i64; 3],
}

/// Assign coincident tile members `0..k` to blocks and coincident point
/// members `k..2k` to threads, shrinking each extent to the member's trip
/// count. Coordinates without a member get extent 1.
fn plan(band: &ScheduleNode, k: usize, block: [i64; 3], grid: [i64; 3]) -> Plan {
    let mut assignments = Vec::new();
    let mut planned_grid = [1; 3];
    let mut planned_block = [1; 3];

    let coincident_members = |range: std::ops::Range<usize>| -> Vec<usize> {
        range
            .filter(|&m| band.band_member_get_coincident(m))
            .take(3)
            .collect()
    };
    for (slot, m) in coincident_members(0..k).into_iter().enumerate() {
        let trip = band.band_member_range(m).len();
        planned_grid[slot] = grid[slot].min(trip).max(1);
        assignments.push((m, MappingTag::Block(Block::ALL[slot])));
    }
    for (slot, m) in coincident_members(k..2 * k).into_iter().enumerate() {
        let trip = band.band_member_range(m).len();
        planned_block[slot] = block[slot].min(trip).max(1);
        assignments.push((m, MappingTag::Thread(Thread::ALL[slot])));
    }
    assignments.sort_by_key(|&(m, _)| m);
    Plan {
        assignments,
        block: planned_block,
        grid: planned_grid,
    }
}

fn try_map_to_gpu(
    scop: &mut Scop,
    node: ScheduleNode,
    tiles: &[i64],
    block: [i64; 3],
    grid: [i64; 3],
    config: &MappingConfig,
) -> Result<([i64; 3], [i64; 3])> {
    if tiles.is_empty() {
        return Err(MappingError::MappingInfeasible("no tile sizes given".to_string()));
    }
    if block.iter().chain(grid.iter()).any(|&s| s <= 0) {
        return Err(MappingError::MappingInfeasible(format!(
            "launch sizes must be positive, got grid {:?} block {:?}",
            grid, block
        )));
    }
    let band = find_band(node)?;
    if band.domain_at().is_empty() {
        return Err(MappingError::MappingInfeasible(
            "no statement instance reaches the band".to_string(),
        ));
    }
    let tiled = tile(band, tiles)?;
    let plan = plan(&tiled, tiles.len(), block, grid);
    if plan.assignments.is_empty() {
        return Err(MappingError::MappingInfeasible(
            "band has no parallel member to map".to_string(),
        ));
    }
    debug!(
        "planned grid {:?} block {:?} for members {:?}",
        plan.grid, plan.block, plan.assignments
    );

    let mark = init_kernel(scop, tiled, plan.block, plan.grid, config)?;
    let kernel = mark
        .mark()
        .map(|m| m.id.clone())
        .ok_or(MappingError::NoEnclosingKernel)?;
    let mut current = kernel_body(&mark)?;
    let mut base = 0;
    for &(member, tag) in &plan.assignments {
        current = map_band_dim(current, member - base, tag)?;
        base = member;
    }

    let mark = current
        .get_schedule()
        .find_mark(&kernel)
        .ok_or_else(|| MappingError::InvalidNode(format!("mark {} disappeared", kernel)))?;
    let mark = finalize_kernel(mark, config)?;
    let context = kernel_context(&mark)?;
    scop.schedule = mark.into_schedule();
    debug!("mapped schedule:\n{}", schedule_to_block_str(&scop.schedule));
    info!(
        "mapped {} with grid {:?} and block {:?}",
        kernel, context.grid, context.block
    );
    Ok((context.block, context.grid))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scop::ScopBuilder;

    fn scop_2d() -> Scop {
        ScopBuilder::new()
            .domain("{ S0[i, j] : 0 <= i <= 63 and 0 <= j <= 15 }")
            .unwrap()
            .write("{ S0[i, j] -> C[i, j] }")
            .unwrap()
            .parallel_band("[{ S0[i, j] -> [(i)] }, { S0[i, j] -> [(j)] }]")
            .unwrap()
            .build()
    }

    #[test]
    fn test_plan_assigns_tiles_to_blocks_and_points_to_threads() {
        let scop = scop_2d();
        let band = find_band(scop.root()).unwrap();
        let tiled = tile(band, &[16, 16]).unwrap();
        let plan = plan(&tiled, 2, [16, 16, 1], [8, 8, 1]);
        assert_eq!(
            plan.assignments,
            vec![
                (0, MappingTag::Block(Block::X)),
                (1, MappingTag::Block(Block::Y)),
                (2, MappingTag::Thread(Thread::X)),
                (3, MappingTag::Thread(Thread::Y)),
            ]
        );
        // 64 / 16 = 4 tiles along i, a single tile along j
        assert_eq!(plan.grid, [4, 1, 1]);
        assert_eq!(plan.block, [16, 16, 1]);
    }

    #[test]
    fn test_non_coincident_members_are_skipped() {
        let scop = ScopBuilder::new()
            .domain("{ S0[i, j] : 0 <= i <= 63 and 0 <= j <= 63 }")
            .unwrap()
            .band_with_flags("[{ S0[i, j] -> [(i)] }, { S0[i, j] -> [(j)] }]", &[true, false], true)
            .unwrap()
            .build();
        let band = find_band(scop.root()).unwrap();
        let tiled = tile(band, &[8, 8]).unwrap();
        let plan = plan(&tiled, 2, [8, 8, 1], [8, 8, 1]);
        assert_eq!(
            plan.assignments,
            vec![
                (0, MappingTag::Block(Block::X)),
                (2, MappingTag::Thread(Thread::X)),
            ]
        );
        assert_eq!(plan.grid, [8, 1, 1]);
        assert_eq!(plan.block, [8, 1, 1]);
    }

    #[test]
    fn test_find_band_skips_single_child_nodes() {
        let scop = scop_2d();
        let band = find_band(scop.root()).unwrap();
        assert_eq!(band.band_n_member(), 2);
    }
}
