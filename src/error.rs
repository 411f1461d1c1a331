//! Error taxonomy of the mapping and promotion passes.

use thiserror::Error;

use crate::mapping::MappingTag;
use crate::scop::Id;

/// Errors raised by the mutating primitives.
///
/// Precondition violations are fatal for the transformation that hit them:
/// callers propagate with `?`, and only [`crate::strategy::map_to_gpu`]
/// turns them into a boolean outcome.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MappingError {
    #[error("mapping is infeasible: {0}")]
    MappingInfeasible(String),

    #[error("{0} is already mapped on this path")]
    DimensionAlreadyMapped(MappingTag),

    #[error("node is not inside a kernel")]
    NoEnclosingKernel,

    #[error("cannot reconcile mapped depth: {0}")]
    DepthReconciliationFailure(String),

    #[error("promotion exceeds memory capacity: {0}")]
    PromotionCapacityExceeded(String),

    #[error("promotion would introduce an access hazard: {0}")]
    PromotionAliasHazard(String),

    #[error("reference group does not cover every reference to {0} in its scope")]
    PartialGroupPromotion(Id),

    #[error("cannot split children: {0}")]
    ScopeSplitFailure(String),

    #[error("no promotion scope named {0}")]
    UnknownScope(Id),

    #[error("unexpected schedule node: {0}")]
    InvalidNode(String),
}

pub type Result<T> = std::result::Result<T, MappingError>;
