//! Band-level mapping primitives: mapping members to GPU coordinates,
//! fixing coordinates, tiling and unrolling.
//!
//! Every mutating primitive consumes a node handle and returns the handle
//! of the corresponding node in the new schedule.

use log::debug;

use crate::affine::Constraint;
use crate::error::{MappingError, Result};
use crate::kernel;
use crate::mapping::{is_mapped, mapping_filter_for, subtree_tags, MappingTag};
use crate::schedule_tree::{Band, BandMember, NodeKind, ScheduleNode};

fn require_band(node: &ScheduleNode) -> Result<&Band> {
    node.band()
        .ok_or_else(|| MappingError::InvalidNode(format!("expected a band, found {:?}", node.get_type())))
}

/// Check that member `dim` of the band at `node` can be mapped to `tag`.
fn check_band_dim(node: &ScheduleNode, dim: usize, tag: MappingTag) -> Result<()> {
    let band = require_band(node)?;
    let member = band.members.get(dim).ok_or_else(|| {
        MappingError::MappingInfeasible(format!(
            "band has {} members, cannot map member {}",
            band.n_member(),
            dim
        ))
    })?;
    if !member.coincident {
        return Err(MappingError::MappingInfeasible(format!(
            "band member {} is not parallel",
            dim
        )));
    }
    check_tag_free(node, tag)
}

fn check_tag_free(node: &ScheduleNode, tag: MappingTag) -> Result<()> {
    if !kernel::is_in_kernel(node) {
        return Err(MappingError::NoEnclosingKernel);
    }
    if is_mapped(node, tag) || subtree_tags(node).contains(&tag) {
        return Err(MappingError::DimensionAlreadyMapped(tag));
    }
    Ok(())
}

/// Whether member `dim` of the band at `node` may be mapped to `tag`.
///
/// Requires a parallel member, an enclosing kernel and no other filter
/// for `tag` above or below `node`.
pub fn can_map_band_dim(node: &ScheduleNode, dim: usize, tag: impl Into<MappingTag>) -> bool {
    check_band_dim(node, dim, tag.into()).is_ok()
}

/// Map member `dim` of the band at `node` to `tag`.
///
/// The band is split before `dim` when needed, and the filter
/// `member mod extent == coordinate(tag)` is inserted directly above the
/// band that starts with member `dim`. The extent comes from the enclosing
/// kernel's context.
///
/// # Returns
/// The band whose first member is the mapped one.
///
/// # Errors
/// Any reason [`can_map_band_dim`] would return false.
pub fn map_band_dim(node: ScheduleNode, dim: usize, tag: impl Into<MappingTag>) -> Result<ScheduleNode> {
    let tag = tag.into();
    check_band_dim(&node, dim, tag)?;
    let extent = kernel::kernel_extent(&node, tag)?;
    let target = if dim > 0 {
        node.band_split(dim)?.descend(0)?
    } else {
        node
    };
    let member = require_band(&target)?.members[0].clone();
    debug!("mapping band member {} to {} with extent {}", dim, tag, extent);
    let filter = mapping_filter_for(&target, tag, |id| {
        member.expr(id).map(|expr| Constraint::Coordinate {
            tag,
            expr: expr.clone(),
            modulus: extent,
        })
    });
    target.insert_filter(filter).descend(0)
}

/// Execute the subtree at `node` only at coordinate 0 of `tag`.
pub fn map_fixed(node: ScheduleNode, tag: impl Into<MappingTag>) -> Result<ScheduleNode> {
    map_fixed_to(node, tag, 0)
}

/// Execute the subtree at `node` only at coordinate `value` of `tag`.
///
/// # Returns
/// The handle of the original subtree, now below the new filter.
pub fn map_fixed_to(node: ScheduleNode, tag: impl Into<MappingTag>, value: i64) -> Result<ScheduleNode> {
    let tag = tag.into();
    check_tag_free(&node, tag)?;
    let extent = kernel::kernel_extent(&node, tag)?;
    if value < 0 || value >= extent {
        return Err(MappingError::MappingInfeasible(format!(
            "coordinate {} is outside {} extent {}",
            value, tag, extent
        )));
    }
    let filter = mapping_filter_for(&node, tag, |_| Some(Constraint::Fixed { tag, value }));
    node.insert_filter(filter).descend(0)
}

/// Tile the leading `sizes.len()` members of a band.
///
/// The band becomes `[floor(m_0/s_0), ..., m_0 mod s_0, ..., rest]`. Tile
/// members keep the coincidence of the member they came from.
///
/// # Errors
/// `MappingInfeasible` for non-positive sizes, for more sizes than
/// members, or for a non-permutable band with several members.
pub fn tile(band: ScheduleNode, sizes: &[i64]) -> Result<ScheduleNode> {
    let current = require_band(&band)?.clone();
    if sizes.is_empty() || sizes.iter().any(|&s| s <= 0) {
        return Err(MappingError::MappingInfeasible(format!(
            "tile sizes must be positive, got {:?}",
            sizes
        )));
    }
    if sizes.len() > current.n_member() {
        return Err(MappingError::MappingInfeasible(format!(
            "{} tile sizes for a {}-member band",
            sizes.len(),
            current.n_member()
        )));
    }
    if current.n_member() > 1 && !current.permutable {
        return Err(MappingError::MappingInfeasible(
            "cannot tile a non-permutable band".to_string(),
        ));
    }

    let outer = current
        .members
        .iter()
        .zip(sizes)
        .map(|(m, &s)| m.map_exprs(|e| e.clone().floor_div(s)));
    let point = current
        .members
        .iter()
        .zip(sizes)
        .map(|(m, &s)| m.map_exprs(|e| e.clone().modulo(s)));
    let rest = current.members.iter().skip(sizes.len()).cloned();
    let tiled = Band {
        members: outer.chain(point).chain(rest).collect(),
        permutable: current.permutable,
    };
    debug!("tiled {}-member band with sizes {:?}", current.n_member(), sizes);
    Ok(band.replace_kind(NodeKind::Band(tiled)))
}

/// Strip-mine members whose trip count exceeds `limit` and flag the point
/// member for unrolling.
///
/// A member with trip count at most `limit` is left untouched; when every
/// member qualifies the band is returned unchanged.
pub fn unroll(band: ScheduleNode, limit: i64) -> Result<ScheduleNode> {
    if limit <= 0 {
        return Err(MappingError::MappingInfeasible(format!(
            "unroll limit must be positive, got {}",
            limit
        )));
    }
    let current = require_band(&band)?.clone();
    let domain = band.domain_at();
    let mut members: Vec<BandMember> = Vec::with_capacity(current.n_member());
    let mut changed = false;
    for member in &current.members {
        let trip = member.range(&domain).len();
        if trip <= limit {
            members.push(member.clone());
            continue;
        }
        changed = true;
        let mut outer = member.map_exprs(|e| e.clone().floor_div(limit));
        outer.unroll = false;
        let mut inner = member.map_exprs(|e| e.clone().modulo(limit));
        inner.unroll = true;
        members.push(outer);
        members.push(inner);
    }
    if !changed {
        return Ok(band);
    }
    Ok(band.replace_kind(NodeKind::Band(Band {
        members,
        permutable: current.permutable,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MappingConfig;
    use crate::kernel::{init_kernel, kernel_body};
    use crate::mapping::{Block, Thread};
    use crate::scop::{Scop, ScopBuilder};

    fn scop_1d(n: i64) -> Scop {
        ScopBuilder::new()
            .domain(&format!("{{ S0[i] : 0 <= i < {} }}", n))
            .unwrap()
            .write("{ S0[i] -> A[i] }")
            .unwrap()
            .parallel_band("[{ S0[i] -> [(i)] }]")
            .unwrap()
            .build()
    }

    fn kernel_band(scop: &mut Scop, block: [i64; 3], grid: [i64; 3]) -> ScheduleNode {
        let root = scop.root();
        let mark = init_kernel(scop, root, block, grid, &MappingConfig::default()).unwrap();
        kernel_body(&mark).unwrap()
    }

    #[test]
    fn test_map_band_dim_marks_path() {
        let mut scop = scop_1d(64);
        let band = kernel_band(&mut scop, [32, 1, 1], [2, 1, 1]);
        let band = tile(band, &[32]).unwrap();
        assert!(can_map_band_dim(&band, 0, Block::X));

        let band = map_band_dim(band, 0, Block::X).unwrap();
        assert!(is_mapped(&band, Block::X));
        assert!(!can_map_band_dim(&band, 0, Block::X));
        assert_eq!(band.band_n_member(), 2);

        let point = map_band_dim(band, 1, Thread::X).unwrap();
        assert_eq!(point.band_n_member(), 1);
        assert!(is_mapped(&point, Thread::X));
        assert!(is_mapped(&point, Block::X));
    }

    #[test]
    fn test_map_band_dim_rejects_sequential_member() {
        let mut scop = ScopBuilder::new()
            .domain("{ S0[i] : 0 <= i < 64 }")
            .unwrap()
            .band("[{ S0[i] -> [(i)] }]")
            .unwrap()
            .build();
        let band = kernel_band(&mut scop, [32, 1, 1], [2, 1, 1]);
        assert!(!can_map_band_dim(&band, 0, Thread::X));
        assert!(matches!(
            map_band_dim(band, 0, Thread::X),
            Err(MappingError::MappingInfeasible(_))
        ));
    }

    #[test]
    fn test_mapping_outside_kernel_fails() {
        let scop = scop_1d(64);
        let band = scop.root();
        assert!(!can_map_band_dim(&band, 0, Thread::X));
        assert_eq!(map_fixed(band, Thread::X), Err(MappingError::NoEnclosingKernel));
    }

    #[test]
    fn test_map_fixed_to_checks_extent() {
        let mut scop = scop_1d(64);
        let band = kernel_band(&mut scop, [4, 1, 1], [1, 1, 1]);
        assert!(matches!(
            map_fixed_to(band.clone(), Thread::X, 4),
            Err(MappingError::MappingInfeasible(_))
        ));
        let below = map_fixed_to(band, Thread::X, 3).unwrap();
        assert_eq!(below.get_type(), crate::schedule_tree::NodeType::Band);
        assert!(is_mapped(&below, Thread::X));
        assert_eq!(
            map_fixed(below, Thread::X),
            Err(MappingError::DimensionAlreadyMapped(MappingTag::Thread(Thread::X)))
        );
    }

    #[test]
    fn test_tile_adds_point_members() {
        let scop = ScopBuilder::new()
            .domain("{ S0[i, j] : 0 <= i, j < 64 }")
            .unwrap()
            .parallel_band("[{ S0[i, j] -> [(i)] }, { S0[i, j] -> [(j)] }]")
            .unwrap()
            .build();
        let tiled = tile(scop.root(), &[16, 8]).unwrap();
        assert_eq!(tiled.band_n_member(), 4);
        assert_eq!(tiled.band_member_range(0), crate::affine::Interval::new(0, 3));
        assert_eq!(tiled.band_member_range(1), crate::affine::Interval::new(0, 7));
        assert_eq!(tiled.band_member_range(3), crate::affine::Interval::new(0, 7));
        assert!(tiled.band_member_get_coincident(2));

        let partial = tile(scop.root(), &[16]).unwrap();
        assert_eq!(partial.band_n_member(), 3);
        assert!(tile(scop.root(), &[16, 16, 16]).is_err());
        assert!(tile(scop.root(), &[0]).is_err());
    }

    #[test]
    fn test_tile_rejects_non_permutable_band() {
        let scop = ScopBuilder::new()
            .domain("{ S0[i, j] : 0 <= i, j < 64 }")
            .unwrap()
            .band_with_flags("[{ S0[i, j] -> [(i)] }, { S0[i, j] -> [(j)] }]", &[true, true], false)
            .unwrap()
            .build();
        assert!(matches!(
            tile(scop.root(), &[16, 16]),
            Err(MappingError::MappingInfeasible(_))
        ));
    }

    #[test]
    fn test_unroll() {
        let scop = scop_1d(64);
        let same = unroll(scop.root(), 64).unwrap();
        assert_eq!(same, scop.root());

        let unrolled = unroll(scop.root(), 16).unwrap();
        let band = unrolled.band().unwrap();
        assert_eq!(band.n_member(), 2);
        assert!(!band.members[0].unroll);
        assert!(band.members[1].unroll);
        assert_eq!(unrolled.band_member_range(0).len(), 4);
    }
}
