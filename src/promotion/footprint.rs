//! Footprints of reference groups.
//!
//! The footprint of a group is the box of array elements one execution of
//! the promotion scope touches. One execution is identified by the values
//! of the band members above the scope mark, so each statement iterator is
//! classified by what those members pin down:
//!
//! - **fixed**: an outer member is `±i + k`, or a tile/point pair
//!   `floor(i/s)`, `i mod s` fixes `i` completely;
//! - **tiled**: an outer member is `floor(i/s)`, leaving `i mod s` free;
//! - **free**: nothing above the scope constrains `i`.
//!
//! An array index `Σ c_d·i_d + k` then splits into an *anchored* part that
//! only depends on outer member values and a *relative* part bounded by
//! the tile sizes and domain extents. References whose anchored parts
//! agree share one buffer window per scope execution; otherwise the window
//! falls back to the whole range of the array dimension.

use std::collections::BTreeMap;

use crate::affine::{Aff, Interval, ScheduleExpr, StatementDomain};
use crate::backend::default_backend;
use crate::schedule_tree::{BandMember, NodeKind, Origin, ScheduleNode};
use crate::scop::{Id, Scop};

use super::ScopedReferenceGroup;

/// Buffer shape and placement of a promoted group.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Footprint {
    pub sizes: Vec<i64>,
    /// Array index of buffer element 0, per dimension.
    pub origin: Vec<Origin>,
}

impl Footprint {
    /// Number of elements, `None` on overflow.
    pub fn volume(&self) -> Option<i64> {
        self.sizes.iter().try_fold(1i64, |acc, &s| acc.checked_mul(s))
    }
}

#[derive(Clone, Debug)]
pub(crate) struct GroupFootprint {
    pub footprint: Footprint,
    /// Buffer index expressions, per reference.
    pub redirected: BTreeMap<Id, Vec<ScheduleExpr>>,
}

/// Band members on the path above `node`, outermost first.
pub fn outer_members(node: &ScheduleNode) -> Vec<BandMember> {
    let kinds = node.path_kinds();
    let above = &kinds[..kinds.len().saturating_sub(1)];
    above
        .iter()
        .filter_map(|kind| match kind {
            NodeKind::Band(band) => Some(band.members.clone()),
            _ => None,
        })
        .flatten()
        .collect()
}

#[derive(Clone, Debug, PartialEq)]
enum DimClass {
    Fixed(Origin),
    Tiled { size: i64, origin: Origin },
    Free,
}

fn classify(statement: &Id, n_dims: usize, outer: &[BandMember]) -> Vec<DimClass> {
    let mut classes = vec![DimClass::Free; n_dims];
    for (pos, member) in outer.iter().enumerate() {
        let Some(expr) = member.expr(statement) else {
            continue;
        };
        match expr {
            ScheduleExpr::Aff(aff) => {
                if let Some((d, sign)) = aff.unit_dim() {
                    if !matches!(classes[d], DimClass::Fixed(_)) {
                        classes[d] = DimClass::Fixed(Origin {
                            constant: -sign * aff.constant,
                            terms: vec![(pos, sign)],
                        });
                    }
                }
            }
            ScheduleExpr::FloorDiv(inner, size) => {
                if let Some(d) = inner.as_aff().and_then(Aff::is_plain_var) {
                    if classes[d] == DimClass::Free {
                        classes[d] = DimClass::Tiled {
                            size: *size,
                            origin: Origin {
                                constant: 0,
                                terms: vec![(pos, *size)],
                            },
                        };
                    }
                }
            }
            ScheduleExpr::Mod(inner, size) => {
                if let Some(d) = inner.as_aff().and_then(Aff::is_plain_var) {
                    if let DimClass::Tiled { size: tile, origin } = &classes[d] {
                        if tile == size {
                            let mut fixed = origin.clone();
                            fixed.terms.push((pos, 1));
                            classes[d] = DimClass::Fixed(fixed);
                        }
                    }
                }
            }
            _ => {}
        }
    }
    classes
}

/// One array dimension of one reference, split into anchored and relative
/// parts: `index = anchor·v + constant + relative`.
struct RefDim {
    anchor: Vec<(usize, i64)>,
    constant: i64,
    relative: ScheduleExpr,
    range: Interval,
}

fn add_terms(acc: &mut BTreeMap<usize, i64>, terms: &[(usize, i64)], factor: i64) {
    for &(pos, c) in terms {
        *acc.entry(pos).or_insert(0) += factor * c;
    }
}

fn decompose(aff: &Aff, classes: &[DimClass], domain: &StatementDomain) -> RefDim {
    let n = aff.n_dims();
    let mut anchor = BTreeMap::new();
    let mut constant = aff.constant;
    let mut relative = ScheduleExpr::constant(n, 0);
    let mut range = Interval::point(0);
    for (d, &c) in aff.coeffs.iter().enumerate() {
        if c == 0 {
            continue;
        }
        match classes.get(d).unwrap_or(&DimClass::Free) {
            DimClass::Fixed(origin) => {
                constant += c * origin.constant;
                add_terms(&mut anchor, &origin.terms, c);
            }
            DimClass::Tiled { size, origin } => {
                add_terms(&mut anchor, &origin.terms, c);
                let r = ScheduleExpr::var(n, d).modulo(*size);
                range = range.add(r.range(domain).scale(c));
                relative = relative.plus(r.scaled(c));
            }
            DimClass::Free => {
                let bounds = domain.bounds[d];
                constant += c * bounds.lo;
                let mut r = Aff::var(n, d);
                r.constant = -bounds.lo;
                range = range.add(bounds.shift(-bounds.lo).scale(c));
                relative = relative.plus(ScheduleExpr::Aff(r.scaled(c)));
            }
        }
    }
    RefDim {
        anchor: anchor.into_iter().filter(|&(_, c)| c != 0).collect(),
        constant,
        relative,
        range,
    }
}

/// Footprint of `group` within the scope at `mark`, `None` when it is not
/// bounded or the references are not affine.
pub(crate) fn compute_footprint(
    scop: &Scop,
    mark: &ScheduleNode,
    group: &ScopedReferenceGroup,
) -> Option<GroupFootprint> {
    let outer = outer_members(mark);
    let backend = default_backend();
    let mut refs = Vec::new();
    for id in &group.ref_ids {
        let access = scop.reference(id)?;
        let domain = scop.domain.get(&access.statement)?;
        if domain.is_empty() {
            continue;
        }
        let index: Vec<&Aff> = access.index.iter().map(|e| e.as_aff()).collect::<Option<_>>()?;
        let classes = classify(&access.statement, domain.n_dims(), &outer);
        refs.push((id, index, classes, domain, &access.statement));
    }
    let rank = refs.first()?.1.len();
    if refs.iter().any(|(_, index, ..)| index.len() != rank) {
        return None;
    }

    let mut sizes = Vec::with_capacity(rank);
    let mut origin = Vec::with_capacity(rank);
    let mut redirected: BTreeMap<Id, Vec<ScheduleExpr>> =
        refs.iter().map(|(id, ..)| ((*id).clone(), Vec::new())).collect();
    for j in 0..rank {
        let parts: Vec<RefDim> = refs
            .iter()
            .map(|(_, index, classes, domain, _)| decompose(index[j], classes, domain))
            .collect();
        let anchored = parts.iter().all(|p| p.anchor == parts[0].anchor);
        if anchored {
            let lo = parts.iter().map(|p| p.constant + p.range.lo).min()?;
            let hi = parts.iter().map(|p| p.constant + p.range.hi).max()?;
            sizes.push(hi - lo + 1);
            origin.push(Origin {
                constant: lo,
                terms: parts[0].anchor.clone(),
            });
            for ((id, _, _, domain, _), part) in refs.iter().zip(parts) {
                let shift = ScheduleExpr::constant(domain.n_dims(), part.constant - lo);
                let expr = part.relative.plus(shift);
                redirected.entry((*id).clone()).or_default().push(expr);
            }
        } else {
            let ranges: Vec<Interval> = refs
                .iter()
                .map(|(_, index, _, domain, statement)| backend.extent(statement, domain, index[j]))
                .collect();
            let hull = ranges.iter().copied().fold(Interval::new(0, -1), Interval::hull);
            sizes.push(hull.len());
            origin.push(Origin {
                constant: hull.lo,
                terms: Vec::new(),
            });
            for (id, index, ..) in &refs {
                let aff = index[j].with_constant(index[j].constant - hull.lo);
                redirected
                    .entry((*id).clone())
                    .or_default()
                    .push(ScheduleExpr::Aff(aff));
            }
        }
    }
    Some(GroupFootprint {
        footprint: Footprint { sizes, origin },
        redirected,
    })
}
