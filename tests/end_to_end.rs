//! End-to-end GPU mapping tests.
//!
//! Each test builds a Scop from ISL-style strings, runs `map_to_gpu` and
//! checks the resulting kernel: launch sizes, mapped tags and the
//! coordinates every statement instance runs at.

use polygpu::kernel::{kernel_block, kernel_grid};
use polygpu::mapping::reachable_coordinates;
use polygpu::schedule_tree::NodeType;
use polygpu::{
    can_map_band_dim, is_in_kernel, is_mapped, map_to_gpu, map_to_gpu_with_config, Block,
    MappingConfig, Scop, ScopBuilder, Thread,
};

// ============================================================================
// Helpers
// ============================================================================

fn copy_1d(n: i64) -> Scop {
    ScopBuilder::new()
        .domain(&format!("{{ S0[i] : 0 <= i < {} }}", n))
        .unwrap()
        .read("{ S0[i] -> A[i] }")
        .unwrap()
        .write("{ S0[i] -> B[i] }")
        .unwrap()
        .parallel_band("[{ S0[i] -> [(i)] }]")
        .unwrap()
        .build()
}

fn matmul(n: i64) -> Scop {
    ScopBuilder::new()
        .parameter("N", n)
        .domain("[N] -> { S0[i, j] : 0 <= i, j < N }")
        .unwrap()
        .read("[N] -> { S0[i, j] -> A[i, j] }")
        .unwrap()
        .write("[N] -> { S0[i, j] -> C[i, j] }")
        .unwrap()
        .parallel_band("[N] -> [{ S0[i, j] -> [(i)] }, { S0[i, j] -> [(j)] }]")
        .unwrap()
        .build()
}

fn band_below_kernel(scop: &Scop) -> polygpu::ScheduleNode {
    scop.root()
        .descendants()
        .into_iter()
        .find(|n| n.get_type() == NodeType::Band)
        .expect("mapped schedule has a band")
}

// ============================================================================
// Launch sizes
// ============================================================================

#[test]
fn test_map_256_iterations_to_8_blocks_of_32() {
    let mut scop = copy_1d(256);
    let mut block = [32, 1, 1];
    let mut grid = [8, 1, 1];
    let root = scop.root();
    assert!(map_to_gpu(&mut scop, root, &[32], &mut block, &mut grid));
    assert_eq!(block, [32, 1, 1]);
    assert_eq!(grid, [8, 1, 1]);

    let band = band_below_kernel(&scop);
    assert!(is_in_kernel(&band));
    assert!(is_mapped(&band, Block::X));
    assert_eq!(kernel_block(&band).unwrap(), [32, 1, 1]);
    assert_eq!(kernel_grid(&band).unwrap(), [8, 1, 1]);
}

#[test]
fn test_launch_sizes_shrink_to_small_domain() {
    let mut scop = copy_1d(20);
    let mut block = [32, 1, 1];
    let mut grid = [8, 1, 1];
    let root = scop.root();
    assert!(map_to_gpu(&mut scop, root, &[32], &mut block, &mut grid));
    assert_eq!(block, [20, 1, 1]);
    assert_eq!(grid, [1, 1, 1]);
}

#[test]
fn test_2d_mapping_uses_x_and_y() {
    let mut scop = matmul(64);
    let mut block = [16, 16, 1];
    let mut grid = [4, 4, 1];
    let root = scop.root();
    assert!(map_to_gpu(&mut scop, root, &[16, 16], &mut block, &mut grid));
    assert_eq!(block, [16, 16, 1]);
    assert_eq!(grid, [4, 4, 1]);

    let leaf = scop.root().leaves().remove(0);
    for tag in [Block::X, Block::Y] {
        assert!(is_mapped(&leaf, tag));
    }
    for tag in [Thread::X, Thread::Y] {
        assert!(is_mapped(&leaf, tag));
    }
    assert!(!is_mapped(&leaf, Thread::Z));
}

// ============================================================================
// Coverage: every instance runs at exactly the coordinates of its tile
// ============================================================================

#[test]
fn test_every_coordinate_is_reachable() {
    let mut scop = copy_1d(256);
    let mut block = [32, 1, 1];
    let mut grid = [8, 1, 1];
    let root = scop.root();
    assert!(map_to_gpu(&mut scop, root, &[32], &mut block, &mut grid));
    let coordinates = reachable_coordinates(&scop.root());
    assert_eq!(coordinates.len(), 256);
    assert!(coordinates.contains(&[7, 0, 0, 31, 0, 0]));
}

#[test]
fn test_triangular_nest_maps_each_instance_once() {
    let mut scop = ScopBuilder::new()
        .domain("{ S0[i, j] : 0 <= i < 8 and 0 <= j <= i }")
        .unwrap()
        .write("{ S0[i, j] -> L[i, j] }")
        .unwrap()
        .parallel_band("[{ S0[i, j] -> [(i)] }, { S0[i, j] -> [(j)] }]")
        .unwrap()
        .build();
    let mut block = [4, 4, 1];
    let mut grid = [2, 2, 1];
    let root = scop.root();
    assert!(map_to_gpu(&mut scop, root, &[4, 4], &mut block, &mut grid));
    let coordinates = reachable_coordinates(&scop.root());
    assert_eq!(coordinates.len(), 36);
}

#[test]
fn test_instance_coordinates_follow_tiles() {
    let mut scop = copy_1d(256);
    let mut block = [32, 1, 1];
    let mut grid = [8, 1, 1];
    let root = scop.root();
    assert!(map_to_gpu(&mut scop, root, &[32], &mut block, &mut grid));

    let leaf = scop.root().leaves().remove(0);
    let set = polygpu::mapping(&leaf);
    let s0 = polygpu::Id::new("S0");
    let coordinate = set.coordinate_of(&s0, &[70]).unwrap();
    // i = 70 lies in tile 2 at offset 6
    assert_eq!(coordinate[0], Some(2));
    assert_eq!(coordinate[3], Some(6));
    assert_eq!(coordinate[1], None);
}

// ============================================================================
// Failures leave the Scop untouched
// ============================================================================

#[test]
fn test_failure_leaves_scop_unchanged() {
    let mut scop = copy_1d(256);
    let before = scop.clone();
    let mut block = [32, 1, 1];
    let mut grid = [8, 1, 1];
    let root = scop.root();
    assert!(!map_to_gpu(&mut scop, root, &[0], &mut block, &mut grid));
    assert_eq!(scop, before);
    assert_eq!(block, [32, 1, 1]);
    assert_eq!(grid, [8, 1, 1]);

    let root = scop.root();
    assert!(!map_to_gpu(&mut scop, root, &[32], &mut [0, 1, 1], &mut grid));
    assert_eq!(scop, before);
}

#[test]
fn test_sequential_band_cannot_be_mapped() {
    let mut scop = ScopBuilder::new()
        .domain("{ S0[i] : 0 <= i < 256 }")
        .unwrap()
        .write("{ S0[i] -> A[0] }")
        .unwrap()
        .band("[{ S0[i] -> [(i)] }]")
        .unwrap()
        .build();
    let root = scop.root();
    assert!(!can_map_band_dim(&root, 0, Thread::X));
    assert!(!map_to_gpu(&mut scop, root, &[32], &mut [32, 1, 1], &mut [8, 1, 1]));
    assert!(!is_in_kernel(&scop.root()));
}

#[test]
fn test_kernels_do_not_nest() {
    let mut scop = copy_1d(256);
    let root = scop.root();
    assert!(map_to_gpu(&mut scop, root, &[32], &mut [32, 1, 1], &mut [8, 1, 1]));
    let mapped = scop.clone();
    let root = scop.root();
    assert!(!map_to_gpu(&mut scop, root, &[8], &mut [8, 1, 1], &mut [4, 1, 1]));
    assert_eq!(scop, mapped);
}

#[test]
fn test_config_without_guard_and_shrinking() {
    let mut scop = copy_1d(20);
    let config = MappingConfig {
        insert_guard: false,
        shrink_launch_bounds: false,
        ..MappingConfig::default()
    };
    let mut block = [32, 1, 1];
    let mut grid = [8, 1, 1];
    let root = scop.root();
    assert!(map_to_gpu_with_config(&mut scop, root, &[32], &mut block, &mut grid, &config));
    // sizes are still clamped to the trip counts when the kernel is opened
    assert_eq!(block, [20, 1, 1]);
    assert_eq!(grid, [1, 1, 1]);
    assert_eq!(scop.root().child(0).unwrap().get_type(), NodeType::Context);
}
