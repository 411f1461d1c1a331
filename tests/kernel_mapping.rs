//! Kernel construction with the low-level primitives: opening kernels,
//! mapping bands and fixed coordinates, and finalization over sequences
//! and sets.

use std::collections::BTreeSet;

use polygpu::kernel::kernel_body;
use polygpu::mapping::{path_tags, reachable_coordinates};
use polygpu::schedule_tree::NodeType;
use polygpu::scop::band_from_str;
use polygpu::{
    finalize_kernel, init_kernel, is_mapped, map_band_dim, map_fixed_to, pad_kernel_mapping,
    schedule_to_block_str, Block, MappingConfig, MappingError, MappingTag, Scop, ScopBuilder,
    ScheduleNode, Thread,
};

// ============================================================================
// Helpers
// ============================================================================

/// Two statements under a sequence or set, each below its own parallel
/// band.
fn two_branches(set: bool) -> Scop {
    let builder = ScopBuilder::new()
        .domain("{ S0[i] : 0 <= i < 32; S1[i] : 0 <= i < 32 }")
        .unwrap()
        .write("{ S0[i] -> A[i] }")
        .unwrap()
        .read("{ S1[i] -> A[i] }")
        .unwrap()
        .write("{ S1[i] -> B[i] }")
        .unwrap();
    let builder = if set {
        builder.set(&["S0", "S1"]).unwrap()
    } else {
        builder.sequence(&["S0", "S1"]).unwrap()
    };
    let mut scop = builder.build();
    for (pos, text) in [(0, "[{ S0[i] -> [(i)] }]"), (1, "[{ S1[i] -> [(i)] }]")] {
        let band = band_from_str(&scop, text).unwrap().parallel();
        let leaf = scop.schedule.node_at(&[pos, 0]).unwrap();
        scop.schedule = leaf.insert_partial_schedule(band).into_schedule();
    }
    scop
}

fn open_kernel(scop: &mut Scop, block: [i64; 3], grid: [i64; 3]) -> ScheduleNode {
    let root = scop.root();
    init_kernel(scop, root, block, grid, &MappingConfig::default()).unwrap()
}

fn branch(mark: &ScheduleNode, pos: usize) -> ScheduleNode {
    kernel_body(mark).unwrap().child(pos).unwrap().child(0).unwrap()
}

fn kernel_of(node: &ScheduleNode) -> ScheduleNode {
    node.get_schedule()
        .root()
        .descendants()
        .into_iter()
        .find(|n| n.get_type() == NodeType::Mark)
        .unwrap()
}

// ============================================================================
// Set siblings
// ============================================================================

#[test]
fn test_fixed_coordinates_split_set_siblings() {
    let mut scop = two_branches(true);
    let mark = open_kernel(&mut scop, [2, 1, 1], [1, 1, 1]);

    let first = map_fixed_to(branch(&mark, 0), Thread::X, 0).unwrap();
    let mark = kernel_of(&first);
    let second = map_fixed_to(branch(&mark, 1), Thread::X, 1).unwrap();
    let mark = kernel_of(&second);

    let a = reachable_coordinates(&branch(&mark, 0));
    let b = reachable_coordinates(&branch(&mark, 1));
    assert!(a.is_disjoint(&b));
    let all: BTreeSet<_> = a.union(&b).copied().collect();
    assert_eq!(all, reachable_coordinates(&mark));
    assert_eq!(
        all,
        [[0, 0, 0, 0, 0, 0], [0, 0, 0, 1, 0, 0]].into_iter().collect::<BTreeSet<_>>()
    );
}

#[test]
fn test_tag_mapped_in_one_sibling_is_free_in_another() {
    let mut scop = two_branches(true);
    let mark = open_kernel(&mut scop, [32, 1, 1], [1, 1, 1]);
    let mapped = map_band_dim(branch(&mark, 0), 0, Thread::X).unwrap();
    let mark = kernel_of(&mapped);
    assert!(polygpu::can_map_band_dim(&branch(&mark, 1), 0, Thread::X));
    // the kernel mark itself sees the tag below it
    assert!(matches!(
        map_fixed_to(mark, Thread::X, 0),
        Err(MappingError::DimensionAlreadyMapped(MappingTag::Thread(Thread::X)))
    ));
}

// ============================================================================
// Finalization
// ============================================================================

#[test]
fn test_padding_gives_every_leaf_the_same_tags() {
    let mut scop = two_branches(false);
    let mark = open_kernel(&mut scop, [32, 1, 1], [2, 1, 1]);
    let mapped = map_band_dim(branch(&mark, 0), 0, Thread::X).unwrap();
    let mapped = map_fixed_to(mapped, Block::X, 1).unwrap();
    let padded = pad_kernel_mapping(kernel_of(&mapped)).unwrap();

    let tag_sets: BTreeSet<BTreeSet<MappingTag>> = padded
        .leaves()
        .iter()
        .map(|leaf| path_tags(leaf).into_iter().collect())
        .collect();
    assert_eq!(tag_sets.len(), 1);
    let leaf = branch(&padded, 1).leaves().remove(0);
    assert!(is_mapped(&leaf, Block::X));
    assert!(is_mapped(&leaf, Thread::X));
}

#[test]
fn test_finalize_sequence_with_barrier() {
    let mut scop = two_branches(false);
    let mark = open_kernel(&mut scop, [32, 1, 1], [1, 1, 1]);
    let mapped = map_band_dim(branch(&mark, 0), 0, Thread::X).unwrap();
    let done = finalize_kernel(kernel_of(&mapped), &MappingConfig::default()).unwrap();

    let body = kernel_body(&done).unwrap();
    assert_eq!(body.get_type(), NodeType::Sequence);
    assert_eq!(body.n_children(), 3);
    let barrier = body.child(1).unwrap();
    assert!(barrier.filter().unwrap().set.is_empty());
    assert_eq!(barrier.child(0).unwrap().get_type(), NodeType::Mark);
    assert!(schedule_to_block_str(&done.get_schedule()).contains("# barrier"));
}

#[test]
fn test_finalize_matching_branches_needs_no_barrier() {
    let mut scop = two_branches(false);
    let mark = open_kernel(&mut scop, [32, 1, 1], [1, 1, 1]);
    let mapped = map_band_dim(branch(&mark, 0), 0, Thread::X).unwrap();
    let mark = kernel_of(&mapped);
    let mapped = map_band_dim(branch(&mark, 1), 0, Thread::X).unwrap();
    let done = finalize_kernel(kernel_of(&mapped), &MappingConfig::default()).unwrap();
    assert_eq!(kernel_body(&done).unwrap().n_children(), 2);
}
