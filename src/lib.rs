//! PolyGPU: GPU Mapping of Polyhedral Schedule Trees
//!
//! This library turns a band of a polyhedral schedule tree into a GPU kernel:
//! 1. Open a kernel boundary with grid and block sizes
//! 2. Map band members to block and thread coordinates
//! 3. Pad and synchronize the kernel so every branch is mapped uniformly
//! 4. Promote array tiles to shared or private memory inside marked scopes
//!
//! # Core Flow
//! ```text
//! Scop (domain, accesses, schedule tree)
//!   → tile → init_kernel → map_band_dim ... → finalize_kernel
//!   → define_promotion_scope → promotable_to_* → promote_to_*
//! ```
//!
//! # Module Organization
//!
//! ## Model
//! - [`affine`]: Statement domains, quasi-affine expressions, instance sets
//! - [`backend`]: Set algebra behind parsing and extents, optionally isl
//! - [`scop`]: Statements, accesses, arrays and declarations
//! - [`schedule_tree`]: Persistent schedule tree and node handles
//! - [`parse`]: ISL-style textual notation and JSON persistence
//! - [`block_printer`]: Block-style schedule printing
//!
//! ## Mapping
//! - [`mapping`]: Thread/block tags and mapping filters
//! - [`band_mapper`]: Member mapping, fixed coordinates, tiling, unrolling
//! - [`kernel`]: Kernel boundaries and finalization
//! - [`strategy`]: End-to-end `map_to_gpu`
//!
//! ## Memory Promotion
//! - [`promotion`]: Scopes, footprints, legality and rewriting

// ============================================================================
// Model
// ============================================================================

pub mod affine; // Domains and quasi-affine expressions
pub mod backend; // Set algebra behind parsing and extents
pub mod block_printer; // Block-style printing
pub mod config; // Mapping configuration
pub mod error;
pub mod parse; // Textual notation and JSON I/O
pub mod schedule_tree;
pub mod scop;

// ============================================================================
// Mapping
// ============================================================================

pub mod band_mapper;
pub mod kernel;
pub mod mapping;
pub mod strategy;

// ============================================================================
// Memory Promotion
// ============================================================================

pub mod promotion;

pub use affine::{Aff, InstanceSet, Interval, ScheduleExpr, StatementDomain, UnionDomain};
pub use band_mapper::{can_map_band_dim, map_band_dim, map_fixed, map_fixed_to, tile, unroll};
pub use backend::{default_backend, AffineBackend, SetBackend};
pub use block_printer::schedule_to_block_str;
pub use config::MappingConfig;
pub use error::{MappingError, Result};
pub use kernel::{
    finalize_kernel, init_kernel, is_in_kernel, kernel_block, kernel_grid, kernel_id,
    pad_kernel_mapping,
};
pub use mapping::{is_mapped, mapping, Block, GpuCoordinate, MappingTag, Thread};
pub use parse::{load_scop_json, save_scop_json, ParseError};
pub use promotion::{
    define_promotion_scope, define_promotion_scope_over, promotable_to_private,
    promotable_to_shared, promote_to_private, promote_to_shared, reference_groups,
    ScopedReferenceGroup,
};
pub use schedule_tree::{NodeType, Schedule, ScheduleNode};
pub use scop::{Id, Scop, ScopBuilder};
pub use strategy::{map_to_gpu, map_to_gpu_with_config};
