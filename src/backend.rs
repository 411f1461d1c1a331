//! Set algebra behind domain parsing, access parsing and footprint extents.
//!
//! [`AffineBackend`] evaluates everything on the in-crate affine model.
//! With the `isl` feature, [`IslBackend`] reads the same notation through
//! `isl_rs` and answers counting and extent queries exactly; it needs the
//! native isl library at link time.

use crate::affine::{Aff, Interval, StatementDomain, UnionDomain};
use crate::parse::{self, ParseError};
use crate::scop::{Id, ParamContext};

/// Queries the mapper asks of a polyhedral library.
pub trait SetBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Parse a union set such as `"[N] -> { S0[i, j] : 0 <= i < N and 0 <= j <= i }"`.
    fn union_set(&self, text: &str, context: &ParamContext) -> Result<UnionDomain, ParseError>;

    /// Parse a single-statement access relation into the statement, the
    /// array and one affine index per array dimension.
    fn access(
        &self,
        text: &str,
        domain: &UnionDomain,
        context: &ParamContext,
    ) -> Result<(Id, Id, Vec<Aff>), ParseError> {
        parse::parse_access(text, domain, context)
    }

    /// Number of points of a statement domain.
    fn cardinality(&self, id: &Id, domain: &StatementDomain) -> u64;

    /// Range of `index` over a statement domain. May over-approximate.
    fn extent(&self, id: &Id, domain: &StatementDomain, index: &Aff) -> Interval;
}

/// Box-and-inequalities evaluation on the in-crate model.
#[derive(Debug, Default, Clone, Copy)]
pub struct AffineBackend;

impl SetBackend for AffineBackend {
    fn name(&self) -> &'static str {
        "affine"
    }

    fn union_set(&self, text: &str, context: &ParamContext) -> Result<UnionDomain, ParseError> {
        parse::parse_domain(text, context)
    }

    fn cardinality(&self, _id: &Id, domain: &StatementDomain) -> u64 {
        domain.cardinality()
    }

    fn extent(&self, _id: &Id, domain: &StatementDomain, index: &Aff) -> Interval {
        index.range(domain)
    }
}

#[cfg(feature = "isl")]
pub use isl_backend::IslBackend;

#[cfg(feature = "isl")]
mod isl_backend {
    use isl_rs::{Context, UnionMap, UnionSet};
    use lazy_static::lazy_static;
    use log::{debug, warn};
    use regex::Regex;

    use super::{AffineBackend, SetBackend};
    use crate::affine::{Aff, Interval, StatementDomain, UnionDomain};
    use crate::parse::ParseError;
    use crate::scop::{Id, ParamContext};

    lazy_static! {
        static ref INTEGER: Regex = Regex::new(r"-?\d+").unwrap();
    }

    /// First integer printed in an isl object such as `{ 36 }` or `{ [5] }`.
    pub(super) fn first_integer(printed: &str) -> Option<i64> {
        INTEGER.find(printed)?.as_str().parse().ok()
    }

    /// Rewrite `text` with every parameter replaced by its value, so the isl
    /// reading agrees with the affine one.
    pub(super) fn bind_parameters(text: &str, context: &ParamContext) -> String {
        let mut bound = text.to_string();
        for (name, value) in context {
            let word = Regex::new(&format!(r"\b{}\b", regex::escape(name)));
            if let Ok(word) = word {
                bound = word.replace_all(&bound, value.to_string().as_str()).into_owned();
            }
        }
        match bound.find("->") {
            // `[8] -> { .. }` after substitution: drop the parameter tuple
            Some(arrow) if bound.trim_start().starts_with('[') && bound[..arrow].find('{').is_none() => {
                bound[arrow + 2..].trim().to_string()
            }
            _ => bound,
        }
    }

    /// isl-backed queries. Each call allocates its own context; isl
    /// objects never escape a call.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct IslBackend;

    impl SetBackend for IslBackend {
        fn name(&self) -> &'static str {
            "isl"
        }

        fn union_set(&self, text: &str, context: &ParamContext) -> Result<UnionDomain, ParseError> {
            if text.trim().is_empty() {
                return Err(ParseError::EmptyInput);
            }
            let ctx = Context::alloc();
            let set = UnionSet::read_from_str(&ctx, &bind_parameters(text, context));
            // isl prints the coalesced set in the notation the affine reader accepts
            let printed = set.coalesce().to_str().to_string();
            debug!("isl read '{}' as '{}'", text, printed);
            AffineBackend.union_set(&printed, context)
        }

        fn cardinality(&self, id: &Id, domain: &StatementDomain) -> u64 {
            let ctx = Context::alloc();
            let set = UnionSet::read_from_str(&ctx, &format!("{{ {} }}", domain.to_isl_str(id)));
            let printed = set.card().to_str().to_string();
            match first_integer(&printed) {
                Some(n) if n >= 0 => n as u64,
                _ => {
                    warn!("isl count '{}' is not a constant, counting points", printed);
                    domain.cardinality()
                }
            }
        }

        fn extent(&self, id: &Id, domain: &StatementDomain, index: &Aff) -> Interval {
            let ctx = Context::alloc();
            let set = UnionSet::read_from_str(&ctx, &format!("{{ {} }}", domain.to_isl_str(id)));
            let map = UnionMap::read_from_str(
                &ctx,
                &format!(
                    "{{ {}[{}] -> [{}] }}",
                    id,
                    domain.dims.join(", "),
                    index.fmt_with(&domain.dims)
                ),
            );
            let image = set.apply(map);
            let lo = first_integer(&image.copy().lexmin().to_str().to_string());
            let hi = first_integer(&image.lexmax().to_str().to_string());
            match (lo, hi) {
                (Some(lo), Some(hi)) => Interval::new(lo, hi),
                _ => index.range(domain),
            }
        }
    }
}

/// The backend the parser and the promotion passes use.
pub fn default_backend() -> &'static dyn SetBackend {
    #[cfg(feature = "isl")]
    {
        static ISL: IslBackend = IslBackend;
        &ISL
    }
    #[cfg(not(feature = "isl"))]
    {
        static AFFINE: AffineBackend = AffineBackend;
        &AFFINE
    }
}
