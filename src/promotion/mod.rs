//! Promotion of array references to on-chip memory.
//!
//! Promotion works on explicitly marked scopes. A scope mark delimits the
//! subtree within which a buffer lives; [`scope::reference_groups`] groups
//! the references of that subtree by array, [`legality`] decides whether a
//! group fits and is race-free in shared or private memory, and [`rewrite`]
//! redirects the group to a fresh buffer with copy statements around the
//! scope.
//!
//! The usual flow:
//!
//! ```text
//! define_promotion_scope -> promotable_to_shared / promotable_to_private
//!                        -> promote_to_shared / promote_to_private
//! ```

pub mod footprint;
pub mod legality;
pub mod rewrite;
pub mod scope;

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::scop::Id;

pub use legality::{promotable_to_private, promotable_to_shared};
pub use rewrite::{promote_to_private, promote_to_shared};
pub use scope::{define_promotion_scope, define_promotion_scope_over, reference_groups};

/// All references to one array within one promotion scope.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ScopedReferenceGroup {
    pub mark_id: Id,
    pub array_id: Id,
    pub ref_ids: BTreeSet<Id>,
}
