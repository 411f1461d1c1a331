//! Affine model used by the mapper.
//!
//! The mapping and promotion passes only need a small slice of a polyhedral
//! library: statement domains given by a bounding box plus affine
//! inequalities, quasi-affine expressions over statement iterators (`floor`
//! and `mod` by constants), conservative interval ranges of those
//! expressions, and per-statement instance sets constrained by GPU
//! coordinates. Parsing and counting of domains go through a
//! [`SetBackend`](crate::backend::SetBackend).
//!
//! # Conventions
//!
//! - Intervals are inclusive on both ends; `lo > hi` is the empty interval.
//! - `floor` and `mod` follow Euclidean semantics, so `(-1) mod 4 == 3`.
//! - Ranges are hulls: they may over-approximate, never under-approximate.
//! - Evaluation saturates at the `i64` bounds, like `Interval`.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::mapping::{GpuCoordinate, MappingTag};
use crate::scop::Id;

// ============================================================================
// Intervals
// ============================================================================

/// Inclusive integer interval `[lo, hi]`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Interval {
    pub lo: i64,
    pub hi: i64,
}

impl Interval {
    pub fn new(lo: i64, hi: i64) -> Self {
        Interval { lo, hi }
    }

    pub fn point(value: i64) -> Self {
        Interval { lo: value, hi: value }
    }

    pub fn is_empty(&self) -> bool {
        self.lo > self.hi
    }

    /// Number of integers in the interval.
    pub fn len(&self) -> i64 {
        if self.is_empty() {
            0
        } else {
            self.hi.saturating_sub(self.lo).saturating_add(1)
        }
    }

    pub fn contains(&self, value: i64) -> bool {
        self.lo <= value && value <= self.hi
    }

    /// Smallest interval containing both operands.
    pub fn hull(self, other: Interval) -> Interval {
        if self.is_empty() {
            return other;
        }
        if other.is_empty() {
            return self;
        }
        Interval::new(self.lo.min(other.lo), self.hi.max(other.hi))
    }

    pub fn add(self, other: Interval) -> Interval {
        Interval::new(
            self.lo.saturating_add(other.lo),
            self.hi.saturating_add(other.hi),
        )
    }

    pub fn shift(self, offset: i64) -> Interval {
        self.add(Interval::point(offset))
    }

    pub fn scale(self, factor: i64) -> Interval {
        let a = self.lo.saturating_mul(factor);
        let b = self.hi.saturating_mul(factor);
        Interval::new(a.min(b), a.max(b))
    }

    pub fn floor_div(self, divisor: i64) -> Interval {
        Interval::new(self.lo.div_euclid(divisor), self.hi.div_euclid(divisor))
    }

    /// Range of `x mod divisor` for `x` in the interval. Exact when the
    /// interval does not wrap around a multiple of `divisor`.
    pub fn modulo(self, divisor: i64) -> Interval {
        if self.lo.div_euclid(divisor) == self.hi.div_euclid(divisor) {
            Interval::new(self.lo.rem_euclid(divisor), self.hi.rem_euclid(divisor))
        } else {
            Interval::new(0, divisor - 1)
        }
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.lo, self.hi)
    }
}

// ============================================================================
// Affine and quasi-affine expressions
// ============================================================================

/// Affine function `Σ coeffs[d] · i_d + constant` of one statement's
/// iterators.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Aff {
    pub coeffs: Vec<i64>,
    pub constant: i64,
}

impl Aff {
    pub fn constant(n_dims: usize, value: i64) -> Self {
        Aff {
            coeffs: vec![0; n_dims],
            constant: value,
        }
    }

    /// The iterator `i_dim` itself.
    pub fn var(n_dims: usize, dim: usize) -> Self {
        let mut coeffs = vec![0; n_dims];
        if dim < n_dims {
            coeffs[dim] = 1;
        }
        Aff { coeffs, constant: 0 }
    }

    pub fn n_dims(&self) -> usize {
        self.coeffs.len()
    }

    pub fn is_constant(&self) -> bool {
        self.coeffs.iter().all(|&c| c == 0)
    }

    pub fn eval(&self, point: &[i64]) -> i64 {
        self.coeffs
            .iter()
            .zip(point)
            .fold(self.constant, |acc, (&c, &v)| acc.saturating_add(c.saturating_mul(v)))
    }

    pub fn range(&self, domain: &StatementDomain) -> Interval {
        let mut range = Interval::point(self.constant);
        for (&c, bounds) in self.coeffs.iter().zip(&domain.bounds) {
            if c != 0 {
                range = range.add(bounds.scale(c));
            }
        }
        range
    }

    /// If the function is `±i_d + k`, return `(d, ±1)`.
    pub fn unit_dim(&self) -> Option<(usize, i64)> {
        let mut found = None;
        for (d, &c) in self.coeffs.iter().enumerate() {
            match c {
                0 => {}
                1 | -1 if found.is_none() => found = Some((d, c)),
                _ => return None,
            }
        }
        found
    }

    /// True for exactly `i_d` (unit coefficient, no constant).
    pub fn is_plain_var(&self) -> Option<usize> {
        match self.unit_dim() {
            Some((d, 1)) if self.constant == 0 => Some(d),
            _ => None,
        }
    }

    pub fn plus(&self, other: &Aff) -> Aff {
        let n = self.n_dims().max(other.n_dims());
        let coeffs = (0..n)
            .map(|d| {
                let a = self.coeffs.get(d).copied().unwrap_or(0);
                a.saturating_add(other.coeffs.get(d).copied().unwrap_or(0))
            })
            .collect();
        Aff {
            coeffs,
            constant: self.constant.saturating_add(other.constant),
        }
    }

    pub fn scaled(&self, factor: i64) -> Aff {
        Aff {
            coeffs: self.coeffs.iter().map(|c| c.saturating_mul(factor)).collect(),
            constant: self.constant.saturating_mul(factor),
        }
    }

    pub fn with_constant(&self, constant: i64) -> Aff {
        Aff {
            coeffs: self.coeffs.clone(),
            constant,
        }
    }

    pub fn fmt_with(&self, names: &[String]) -> String {
        let mut out = String::new();
        for (d, &c) in self.coeffs.iter().enumerate() {
            if c == 0 {
                continue;
            }
            let name = dim_name(names, d);
            let sign = if c < 0 { "-" } else { "+" };
            if out.is_empty() {
                if c < 0 {
                    out.push('-');
                }
            } else {
                out.push_str(&format!(" {} ", sign));
            }
            if c.abs() != 1 {
                out.push_str(&c.abs().to_string());
            }
            out.push_str(&name);
        }
        if out.is_empty() {
            return self.constant.to_string();
        }
        if self.constant > 0 {
            out.push_str(&format!(" + {}", self.constant));
        } else if self.constant < 0 {
            out.push_str(&format!(" - {}", -self.constant));
        }
        out
    }
}

fn dim_name(names: &[String], dim: usize) -> String {
    names
        .get(dim)
        .cloned()
        .unwrap_or_else(|| format!("i{}", dim))
}

/// Quasi-affine schedule expression over one statement's iterators.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScheduleExpr {
    Aff(Aff),
    FloorDiv(Box<ScheduleExpr>, i64),
    Mod(Box<ScheduleExpr>, i64),
    Add(Box<ScheduleExpr>, Box<ScheduleExpr>),
    Scale(Box<ScheduleExpr>, i64),
}

impl ScheduleExpr {
    pub fn var(n_dims: usize, dim: usize) -> Self {
        ScheduleExpr::Aff(Aff::var(n_dims, dim))
    }

    pub fn constant(n_dims: usize, value: i64) -> Self {
        ScheduleExpr::Aff(Aff::constant(n_dims, value))
    }

    pub fn floor_div(self, divisor: i64) -> Self {
        ScheduleExpr::FloorDiv(Box::new(self), divisor)
    }

    pub fn modulo(self, divisor: i64) -> Self {
        ScheduleExpr::Mod(Box::new(self), divisor)
    }

    pub fn plus(self, other: ScheduleExpr) -> Self {
        match (self, other) {
            (ScheduleExpr::Aff(a), ScheduleExpr::Aff(b)) => ScheduleExpr::Aff(a.plus(&b)),
            (a, b) => ScheduleExpr::Add(Box::new(a), Box::new(b)),
        }
    }

    pub fn scaled(self, factor: i64) -> Self {
        match self {
            ScheduleExpr::Aff(a) => ScheduleExpr::Aff(a.scaled(factor)),
            e if factor == 1 => e,
            e => ScheduleExpr::Scale(Box::new(e), factor),
        }
    }

    pub fn as_aff(&self) -> Option<&Aff> {
        match self {
            ScheduleExpr::Aff(a) => Some(a),
            _ => None,
        }
    }

    pub fn eval(&self, point: &[i64]) -> i64 {
        match self {
            ScheduleExpr::Aff(a) => a.eval(point),
            ScheduleExpr::FloorDiv(e, d) => e.eval(point).div_euclid(*d),
            ScheduleExpr::Mod(e, d) => e.eval(point).rem_euclid(*d),
            ScheduleExpr::Add(a, b) => a.eval(point).saturating_add(b.eval(point)),
            ScheduleExpr::Scale(e, c) => e.eval(point).saturating_mul(*c),
        }
    }

    pub fn range(&self, domain: &StatementDomain) -> Interval {
        match self {
            ScheduleExpr::Aff(a) => a.range(domain),
            ScheduleExpr::FloorDiv(e, d) => e.range(domain).floor_div(*d),
            ScheduleExpr::Mod(e, d) => e.range(domain).modulo(*d),
            ScheduleExpr::Add(a, b) => a.range(domain).add(b.range(domain)),
            ScheduleExpr::Scale(e, c) => e.range(domain).scale(*c),
        }
    }

    pub fn fmt_with(&self, names: &[String]) -> String {
        match self {
            ScheduleExpr::Aff(a) => a.fmt_with(names),
            ScheduleExpr::FloorDiv(e, d) => format!("floor(({})/{})", e.fmt_with(names), d),
            ScheduleExpr::Mod(e, d) => format!("({}) mod {}", e.fmt_with(names), d),
            ScheduleExpr::Add(a, b) => format!("{} + {}", a.fmt_with(names), b.fmt_with(names)),
            ScheduleExpr::Scale(e, c) => format!("{}*({})", c, e.fmt_with(names)),
        }
    }
}

impl fmt::Display for ScheduleExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.fmt_with(&[]))
    }
}

// ============================================================================
// Domains
// ============================================================================

/// Iteration domain of a single statement: a bounding box intersected with
/// affine inequalities `aff >= 0`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatementDomain {
    pub dims: Vec<String>,
    pub bounds: Vec<Interval>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub constraints: Vec<Aff>,
}

impl StatementDomain {
    pub fn new(dims: Vec<String>, bounds: Vec<Interval>) -> Self {
        StatementDomain {
            dims,
            bounds,
            constraints: Vec::new(),
        }
    }

    /// Build a domain from a box and inequalities, then shrink the box to
    /// what the inequalities allow.
    pub fn with_constraints(dims: Vec<String>, bounds: Vec<Interval>, constraints: Vec<Aff>) -> Self {
        let mut domain = StatementDomain {
            dims,
            bounds,
            constraints,
        };
        domain.tighten();
        domain
    }

    pub fn n_dims(&self) -> usize {
        self.bounds.len()
    }

    pub fn is_rectangular(&self) -> bool {
        self.constraints.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        if self.bounds.iter().any(Interval::is_empty) {
            return true;
        }
        !self.is_rectangular() && self.points().next().is_none()
    }

    /// Number of points, saturating at `u64::MAX`.
    pub fn cardinality(&self) -> u64 {
        if self.is_rectangular() {
            return self
                .bounds
                .iter()
                .fold(1u64, |acc, b| acc.saturating_mul(b.len().max(0) as u64));
        }
        self.points().count() as u64
    }

    pub fn contains(&self, point: &[i64]) -> bool {
        point.len() == self.bounds.len()
            && self.bounds.iter().zip(point).all(|(b, &v)| b.contains(v))
            && self.satisfies(point)
    }

    /// isl notation of the domain of statement `id`.
    pub fn to_isl_str(&self, id: &Id) -> String {
        if self.dims.is_empty() {
            return format!("{}[]", id);
        }
        let mut constraints: Vec<String> = self
            .dims
            .iter()
            .zip(&self.bounds)
            .map(|(name, b)| format!("{} <= {} <= {}", b.lo, name, b.hi))
            .collect();
        constraints.extend(
            self.constraints
                .iter()
                .map(|c| format!("{} >= 0", c.fmt_with(&self.dims))),
        );
        format!("{}[{}] : {}", id, self.dims.join(", "), constraints.join(" and "))
    }

    fn satisfies(&self, point: &[i64]) -> bool {
        self.constraints.iter().all(|c| c.eval(point) >= 0)
    }

    /// Iterate over every point in lexicographic order.
    pub fn points(&self) -> PointIter<'_> {
        PointIter {
            bounds: &self.bounds,
            constraints: &self.constraints,
            next: if self.bounds.iter().any(Interval::is_empty) {
                None
            } else {
                Some(self.bounds.iter().map(|b| b.lo).collect())
            },
        }
    }

    /// Interval propagation of the inequalities into the box. Each pass
    /// bounds `c * i_d` by the range of the remaining terms; the loop stops
    /// at a fixpoint.
    fn tighten(&mut self) {
        for _ in 0..=self.n_dims() {
            let mut changed = false;
            for constraint in &self.constraints {
                for (d, &c) in constraint.coeffs.iter().enumerate() {
                    if c == 0 || d >= self.bounds.len() {
                        continue;
                    }
                    // c * i_d >= -(rest), rest <= rest_hi
                    let mut rest = Interval::point(constraint.constant);
                    for (e, (&ce, b)) in constraint.coeffs.iter().zip(&self.bounds).enumerate() {
                        if e != d && ce != 0 {
                            rest = rest.add(b.scale(ce));
                        }
                    }
                    let need = rest.hi.saturating_neg();
                    let slot = &mut self.bounds[d];
                    if c > 0 {
                        let lo = div_ceil(need, c);
                        if lo > slot.lo {
                            slot.lo = lo;
                            changed = true;
                        }
                    } else {
                        let hi = need.saturating_neg().div_euclid(-c);
                        if hi < slot.hi {
                            slot.hi = hi;
                            changed = true;
                        }
                    }
                }
            }
            if !changed {
                break;
            }
        }
    }
}

fn div_ceil(a: i64, b: i64) -> i64 {
    let q = a.div_euclid(b);
    if q.saturating_mul(b) < a {
        q + 1
    } else {
        q
    }
}

/// Odometer over the points of a box, skipping those that violate the
/// domain inequalities.
pub struct PointIter<'a> {
    bounds: &'a [Interval],
    constraints: &'a [Aff],
    next: Option<Vec<i64>>,
}

impl<'a> PointIter<'a> {
    fn advance(&self, current: &[i64]) -> Option<Vec<i64>> {
        let mut successor = current.to_vec();
        let mut d = successor.len();
        while d > 0 {
            d -= 1;
            if successor[d] < self.bounds[d].hi {
                successor[d] += 1;
                return Some(successor);
            }
            successor[d] = self.bounds[d].lo;
        }
        None
    }
}

impl<'a> Iterator for PointIter<'a> {
    type Item = Vec<i64>;

    fn next(&mut self) -> Option<Vec<i64>> {
        loop {
            let current = self.next.take()?;
            self.next = self.advance(&current);
            if self.constraints.iter().all(|c| c.eval(&current) >= 0) {
                return Some(current);
            }
        }
    }
}

/// Union of statement domains, keyed by statement id.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnionDomain {
    statements: BTreeMap<Id, StatementDomain>,
}

impl UnionDomain {
    pub fn new() -> Self {
        UnionDomain::default()
    }

    pub fn insert(&mut self, id: Id, domain: StatementDomain) {
        self.statements.insert(id, domain);
    }

    pub fn get(&self, id: &Id) -> Option<&StatementDomain> {
        self.statements.get(id)
    }

    pub fn contains(&self, id: &Id) -> bool {
        self.statements.contains_key(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &Id> {
        self.statements.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Id, &StatementDomain)> {
        self.statements.iter()
    }

    pub fn retain(&mut self, mut keep: impl FnMut(&Id) -> bool) {
        self.statements.retain(|id, _| keep(id));
    }

    /// isl notation of the whole union, e.g. `{ S0[i] : 0 <= i <= 7 }`.
    pub fn to_isl_str(&self) -> String {
        let parts: Vec<String> = self
            .statements
            .iter()
            .map(|(id, d)| d.to_isl_str(id))
            .collect();
        format!("{{ {} }}", parts.join("; "))
    }

    /// True when no statement has an instance.
    pub fn is_empty(&self) -> bool {
        self.statements.values().all(StatementDomain::is_empty)
    }

    pub fn n_statements(&self) -> usize {
        self.statements.len()
    }
}

// ============================================================================
// Instance sets
// ============================================================================

/// Mapping constraint attached to the instances of one statement.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Constraint {
    /// `expr mod modulus == coordinate(tag)`
    Coordinate {
        tag: MappingTag,
        expr: ScheduleExpr,
        modulus: i64,
    },
    /// `coordinate(tag) == value`
    Fixed { tag: MappingTag, value: i64 },
}

impl Constraint {
    pub fn tag(&self) -> MappingTag {
        match self {
            Constraint::Coordinate { tag, .. } | Constraint::Fixed { tag, .. } => *tag,
        }
    }

    /// Coordinate value this constraint forces at `point`.
    pub fn coordinate_at(&self, point: &[i64]) -> i64 {
        match self {
            Constraint::Coordinate { expr, modulus, .. } => expr.eval(point).rem_euclid(*modulus),
            Constraint::Fixed { value, .. } => *value,
        }
    }

    /// Range of coordinate values over the whole domain.
    pub fn coordinate_range(&self, domain: &StatementDomain) -> Interval {
        match self {
            Constraint::Coordinate { expr, modulus, .. } => expr.range(domain).modulo(*modulus),
            Constraint::Fixed { value, .. } => Interval::point(*value),
        }
    }
}

/// Set of statement instances: for each statement, the conjunction of its
/// mapping constraints. Statements absent from the map have no instance.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceSet {
    pieces: BTreeMap<Id, Vec<Constraint>>,
}

impl InstanceSet {
    pub fn empty() -> Self {
        InstanceSet::default()
    }

    /// All instances of the given statements.
    pub fn from_statements<'a>(ids: impl IntoIterator<Item = &'a Id>) -> Self {
        InstanceSet {
            pieces: ids.into_iter().map(|id| (id.clone(), Vec::new())).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pieces.is_empty()
    }

    pub fn statements(&self) -> impl Iterator<Item = &Id> {
        self.pieces.keys()
    }

    pub fn statement_set(&self) -> BTreeSet<Id> {
        self.pieces.keys().cloned().collect()
    }

    pub fn contains_statement(&self, id: &Id) -> bool {
        self.pieces.contains_key(id)
    }

    pub fn constraints(&self, id: &Id) -> &[Constraint] {
        self.pieces.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Add every instance of `id`, keeping existing constraints on it.
    pub fn insert_statement(&mut self, id: &Id) {
        self.pieces.entry(id.clone()).or_default();
    }

    pub fn add_constraint(&mut self, id: &Id, constraint: Constraint) {
        self.pieces.entry(id.clone()).or_default().push(constraint);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Id, &[Constraint])> {
        self.pieces.iter().map(|(id, c)| (id, c.as_slice()))
    }

    pub fn intersect(&self, other: &InstanceSet) -> InstanceSet {
        let mut pieces = BTreeMap::new();
        for (id, mine) in &self.pieces {
            if let Some(theirs) = other.pieces.get(id) {
                let mut merged = mine.clone();
                for c in theirs {
                    if !merged.contains(c) {
                        merged.push(c.clone());
                    }
                }
                pieces.insert(id.clone(), merged);
            }
        }
        InstanceSet { pieces }
    }

    /// Statement-wise union. A statement present in both operands keeps only
    /// the constraints the operands share, which over-approximates.
    pub fn union(&self, other: &InstanceSet) -> InstanceSet {
        let mut pieces = self.pieces.clone();
        for (id, theirs) in &other.pieces {
            pieces
                .entry(id.clone())
                .and_modify(|mine| mine.retain(|c| theirs.contains(c)))
                .or_insert_with(|| theirs.clone());
        }
        InstanceSet { pieces }
    }

    /// Coordinate tuple of the instance `point` of `id`, `None` for tags the
    /// set leaves unconstrained. Returns `None` overall when two constraints
    /// on the same tag disagree, i.e. the instance is not in the set.
    pub fn coordinate_of(&self, id: &Id, point: &[i64]) -> Option<[Option<i64>; 6]> {
        let mut coordinate = [None; 6];
        for constraint in self.constraints(id) {
            let slot = &mut coordinate[constraint.tag().index()];
            let value = constraint.coordinate_at(point);
            match *slot {
                Some(existing) if existing != value => return None,
                _ => *slot = Some(value),
            }
        }
        Some(coordinate)
    }

    /// Every GPU coordinate executing at least one instance of the set, with
    /// unconstrained tags ranging over their full extent.
    pub fn coordinates(&self, domain: &UnionDomain, extents: &GpuCoordinate) -> BTreeSet<GpuCoordinate> {
        let mut seen = BTreeSet::new();
        let mut out = BTreeSet::new();
        for id in self.statements() {
            let Some(stmt_domain) = domain.get(id) else {
                continue;
            };
            for point in stmt_domain.points() {
                if let Some(partial) = self.coordinate_of(id, &point) {
                    if seen.insert(partial) {
                        expand_coordinate(&partial, extents, &mut out);
                    }
                }
            }
        }
        out
    }
}

/// Expand a partially constrained coordinate over the free tags.
fn expand_coordinate(
    partial: &[Option<i64>; 6],
    extents: &GpuCoordinate,
    out: &mut BTreeSet<GpuCoordinate>,
) {
    let bounds: Vec<Interval> = partial
        .iter()
        .zip(extents)
        .map(|(value, &extent)| match value {
            Some(v) => Interval::point(*v),
            None => Interval::new(0, extent - 1),
        })
        .collect();
    let full = StatementDomain::new(Vec::new(), bounds);
    for point in full.points() {
        let mut coordinate = [0; 6];
        coordinate.copy_from_slice(&point);
        out.insert(coordinate);
    }
}

impl fmt::Display for InstanceSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pieces: Vec<String> = self
            .pieces
            .iter()
            .map(|(id, constraints)| {
                if constraints.is_empty() {
                    return id.to_string();
                }
                let conds: Vec<String> = constraints
                    .iter()
                    .map(|c| match c {
                        Constraint::Coordinate { tag, expr, modulus } => {
                            format!("({}) mod {} = {}", expr, modulus, tag)
                        }
                        Constraint::Fixed { tag, value } => format!("{} = {}", tag, value),
                    })
                    .collect();
                format!("{} : {}", id, conds.join(" and "))
            })
            .collect();
        write!(f, "{{ {} }}", pieces.join("; "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::{Block, Thread};

    fn dom(bounds: &[(i64, i64)]) -> StatementDomain {
        StatementDomain::new(
            (0..bounds.len()).map(|d| format!("i{}", d)).collect(),
            bounds.iter().map(|&(lo, hi)| Interval::new(lo, hi)).collect(),
        )
    }

    #[test]
    fn test_modulo_range_is_exact_within_one_period() {
        assert_eq!(Interval::new(0, 19).modulo(32), Interval::new(0, 19));
        assert_eq!(Interval::new(32, 40).modulo(32), Interval::new(0, 8));
        assert_eq!(Interval::new(0, 255).modulo(32), Interval::new(0, 31));
    }

    #[test]
    fn test_floor_div_uses_euclidean_rounding() {
        assert_eq!(Interval::new(-1, 63).floor_div(32), Interval::new(-1, 1));
        let e = ScheduleExpr::var(1, 0).modulo(4);
        assert_eq!(e.eval(&[-1]), 3);
    }

    #[test]
    fn test_aff_range_and_unit_dim() {
        let d = dom(&[(0, 9), (0, 4)]);
        let aff = Aff {
            coeffs: vec![2, -1],
            constant: 3,
        };
        assert_eq!(aff.range(&d), Interval::new(-1, 21));
        assert_eq!(aff.unit_dim(), None);
        let shifted = Aff {
            coeffs: vec![0, 1],
            constant: 1,
        };
        assert_eq!(shifted.unit_dim(), Some((1, 1)));
        assert_eq!(shifted.is_plain_var(), None);
    }

    #[test]
    fn test_points_enumerates_box_lexicographically() {
        let d = dom(&[(0, 1), (5, 6)]);
        let pts: Vec<Vec<i64>> = d.points().collect();
        assert_eq!(pts, vec![vec![0, 5], vec![0, 6], vec![1, 5], vec![1, 6]]);
        assert_eq!(d.cardinality(), 4);
        assert_eq!(dom(&[(3, 2)]).points().count(), 0);
    }

    #[test]
    fn test_coordinates_expand_unconstrained_tags() {
        let s = Id::new("S0");
        let mut domain = UnionDomain::new();
        domain.insert(s.clone(), dom(&[(0, 3)]));
        let mut set = InstanceSet::from_statements([&s]);
        set.add_constraint(
            &s,
            Constraint::Coordinate {
                tag: Thread::X.into(),
                expr: ScheduleExpr::var(1, 0),
                modulus: 2,
            },
        );
        let extents = [2, 1, 1, 2, 1, 1];
        let coords = set.coordinates(&domain, &extents);
        // tx in {0,1}, bx free over 2 values
        assert_eq!(coords.len(), 4);
        let fixed = set.intersect(&{
            let mut f = InstanceSet::from_statements([&s]);
            f.add_constraint(
                &s,
                Constraint::Fixed {
                    tag: Block::X.into(),
                    value: 1,
                },
            );
            f
        });
        assert!(fixed.coordinates(&domain, &extents).iter().all(|c| c[0] == 1));
    }

    #[test]
    fn test_triangular_domain_tightens_box_and_filters_points() {
        // 0 <= i <= 3, 0 <= j, j <= i
        let d = StatementDomain::with_constraints(
            vec!["i".into(), "j".into()],
            vec![Interval::new(0, 3), Interval::new(0, i64::MAX)],
            vec![Aff {
                coeffs: vec![1, -1],
                constant: 0,
            }],
        );
        assert_eq!(d.bounds[1], Interval::new(0, 3));
        assert_eq!(d.cardinality(), 10);
        assert!(d.contains(&[2, 2]));
        assert!(!d.contains(&[1, 2]));
        let pts: Vec<Vec<i64>> = d.points().take(3).collect();
        assert_eq!(pts, vec![vec![0, 0], vec![1, 0], vec![1, 1]]);
    }

    #[test]
    fn test_eval_saturates_on_large_constants() {
        let aff = Aff {
            coeffs: vec![i64::MAX / 2],
            constant: i64::MAX - 1,
        };
        assert_eq!(aff.eval(&[4]), i64::MAX);
        let e = ScheduleExpr::Aff(aff.clone()).scaled(3).plus(ScheduleExpr::var(1, 0));
        assert_eq!(e.eval(&[1]), i64::MAX);
        let wrapped = ScheduleExpr::Scale(Box::new(ScheduleExpr::var(1, 0).modulo(7)), i64::MAX);
        assert_eq!(wrapped.eval(&[-1]), i64::MAX);
        let c = Constraint::Coordinate {
            tag: Thread::X.into(),
            expr: ScheduleExpr::Aff(aff),
            modulus: 32,
        };
        assert_eq!(c.coordinate_at(&[4]), i64::MAX.rem_euclid(32));
    }

    #[test]
    fn test_expand_coordinate_fills_free_tags() {
        let partial = [Some(1), None, None, Some(0), None, None];
        let extents = [2, 3, 1, 4, 1, 1];
        let mut coords = BTreeSet::new();
        expand_coordinate(&partial, &extents, &mut coords);
        assert_eq!(coords.len(), 3);
        assert!(coords.iter().all(|c| c[0] == 1 && c[3] == 0));
    }

    #[test]
    fn test_conflicting_constraints_exclude_instance() {
        let s = Id::new("S0");
        let mut set = InstanceSet::from_statements([&s]);
        set.add_constraint(&s, Constraint::Fixed { tag: Thread::X.into(), value: 0 });
        set.add_constraint(&s, Constraint::Fixed { tag: Thread::X.into(), value: 1 });
        assert_eq!(set.coordinate_of(&s, &[]), None);
    }
}
