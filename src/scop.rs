//! Static Control Part: domain, tagged accesses, schedule and side tables.

use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::affine::{ScheduleExpr, UnionDomain};
use crate::backend::default_backend;
use crate::parse::{self, ParseError};
use crate::schedule_tree::{Band, Schedule, ScheduleNode};

/// Identifier of a statement, reference, array, buffer or mark.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Id(String);

impl Id {
    pub fn new(name: impl Into<String>) -> Self {
        Id(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Id {
    fn from(name: &str) -> Self {
        Id::new(name)
    }
}

/// Fixed parameter values.
pub type ParamContext = BTreeMap<String, i64>;

/// One array reference `[S[i] -> ref[]] -> A[index]`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaggedAccess {
    pub statement: Id,
    pub reference: Id,
    pub array: Id,
    pub index: Vec<ScheduleExpr>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CopyDirection {
    In,
    Out,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MemorySpace {
    Shared,
    Private,
}

impl MemorySpace {
    pub fn prefix(self) -> &'static str {
        match self {
            MemorySpace::Shared => "shared",
            MemorySpace::Private => "private",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatementKind {
    Computation,
    Copy {
        direction: CopyDirection,
        array: Id,
        buffer: Id,
    },
}

/// Per-statement metadata. The kind distinguishes user statements from the
/// copy statements promotion introduces; `annotations` carries arbitrary
/// driver data.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StatementInfo {
    pub kind: StatementKind,
    #[serde(default)]
    pub annotations: BTreeMap<String, serde_json::Value>,
}

impl StatementInfo {
    pub fn computation() -> Self {
        StatementInfo {
            kind: StatementKind::Computation,
            annotations: BTreeMap::new(),
        }
    }

    pub fn copy(direction: CopyDirection, array: Id, buffer: Id) -> Self {
        StatementInfo {
            kind: StatementKind::Copy {
                direction,
                array,
                buffer,
            },
            annotations: BTreeMap::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArrayInfo {
    pub element_bytes: u64,
    #[serde(default)]
    pub extents: Vec<i64>,
}

/// A buffer allocated by promotion.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Declaration {
    pub kernel: Id,
    pub buffer: Id,
    pub array: Id,
    pub memory: MemorySpace,
    pub sizes: Vec<i64>,
    pub bytes: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    MayWrite,
    MustWrite,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Scop {
    pub context: ParamContext,
    pub domain: UnionDomain,
    pub may_reads: Vec<TaggedAccess>,
    pub may_writes: Vec<TaggedAccess>,
    pub must_writes: Vec<TaggedAccess>,
    pub schedule: Schedule,
    pub statements: BTreeMap<Id, StatementInfo>,
    pub arrays: BTreeMap<Id, ArrayInfo>,
    pub declarations: Vec<Declaration>,
    next_id: u64,
}

impl Scop {
    /// Generate an identifier unique within this Scop.
    pub fn fresh_id(&mut self, prefix: &str) -> Id {
        let id = Id::new(format!("{}_{}", prefix, self.next_id));
        self.next_id += 1;
        id
    }

    pub fn root(&self) -> ScheduleNode {
        self.schedule.root()
    }

    /// Every access with the relation it belongs to. A must-write also
    /// appears as a may-write.
    pub fn accesses(&self) -> impl Iterator<Item = (AccessKind, &TaggedAccess)> {
        self.may_reads
            .iter()
            .map(|a| (AccessKind::Read, a))
            .chain(self.may_writes.iter().map(|a| (AccessKind::MayWrite, a)))
            .chain(self.must_writes.iter().map(|a| (AccessKind::MustWrite, a)))
    }

    pub fn accesses_mut(&mut self) -> impl Iterator<Item = &mut TaggedAccess> {
        self.may_reads
            .iter_mut()
            .chain(self.may_writes.iter_mut())
            .chain(self.must_writes.iter_mut())
    }

    pub fn is_written(&self, reference: &Id) -> bool {
        self.may_writes.iter().any(|a| &a.reference == reference)
    }

    pub fn is_read(&self, reference: &Id) -> bool {
        self.may_reads.iter().any(|a| &a.reference == reference)
    }

    /// Access entry of a reference, preferring the read relation.
    pub fn reference(&self, reference: &Id) -> Option<&TaggedAccess> {
        self.accesses()
            .map(|(_, a)| a)
            .find(|a| &a.reference == reference)
    }

    pub fn is_computation(&self, statement: &Id) -> bool {
        match self.statements.get(statement) {
            Some(info) => info.kind == StatementKind::Computation,
            None => self.domain.contains(statement),
        }
    }

    /// Original array moved by a copy statement.
    pub fn copied_array(&self, statement: &Id) -> Option<&Id> {
        match &self.statements.get(statement)?.kind {
            StatementKind::Copy { array, .. } => Some(array),
            StatementKind::Computation => None,
        }
    }

    pub fn is_buffer(&self, array: &Id) -> bool {
        self.declarations.iter().any(|d| &d.buffer == array)
    }

    pub fn element_bytes(&self, array: &Id, default: u64) -> u64 {
        self.arrays
            .get(array)
            .map(|a| a.element_bytes)
            .unwrap_or(default)
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Assemble a Scop from ISL-style strings.
///
/// # Example
/// ```
/// use polygpu::scop::ScopBuilder;
///
/// let scop = ScopBuilder::new()
///     .domain("{ S0[i] : 0 <= i <= 255 }")?
///     .read("{ S0[i] -> A[i] }")?
///     .write("{ S0[i] -> B[i] }")?
///     .band("[{ S0[i] -> [(i)] }]")?
///     .build();
/// assert_eq!(scop.may_reads.len(), 1);
/// # Ok::<(), polygpu::parse::ParseError>(())
/// ```
#[derive(Debug, Default)]
pub struct ScopBuilder {
    context: ParamContext,
    domain: UnionDomain,
    may_reads: Vec<TaggedAccess>,
    may_writes: Vec<TaggedAccess>,
    must_writes: Vec<TaggedAccess>,
    arrays: BTreeMap<Id, ArrayInfo>,
    schedule: Option<Schedule>,
    next_id: u64,
}

impl ScopBuilder {
    pub fn new() -> Self {
        ScopBuilder::default()
    }

    pub fn parameter(mut self, name: &str, value: i64) -> Self {
        self.context.insert(name.to_string(), value);
        self
    }

    /// Add the statements of a union set such as
    /// `"[N] -> { S0[i] : 0 <= i < N; S1[j] : 0 <= j <= 7 }"`.
    pub fn domain(mut self, text: &str) -> Result<Self, ParseError> {
        if self.schedule.is_some() {
            return Err(ParseError::ParseFailed(
                "statements must be declared before the schedule".to_string(),
            ));
        }
        let backend = default_backend();
        debug!("reading statements with the {} backend", backend.name());
        for (id, stmt) in backend.union_set(text, &self.context)?.iter() {
            self.domain.insert(id.clone(), stmt.clone());
        }
        Ok(self)
    }

    pub fn read(mut self, text: &str) -> Result<Self, ParseError> {
        let access = self.access(text)?;
        self.may_reads.push(access);
        Ok(self)
    }

    /// Add a definite write; it is recorded as both must- and may-write.
    pub fn write(mut self, text: &str) -> Result<Self, ParseError> {
        let access = self.access(text)?;
        self.may_writes.push(access.clone());
        self.must_writes.push(access);
        Ok(self)
    }

    pub fn may_write(mut self, text: &str) -> Result<Self, ParseError> {
        let access = self.access(text)?;
        self.may_writes.push(access);
        Ok(self)
    }

    pub fn array(mut self, name: &str, element_bytes: u64, extents: &[i64]) -> Self {
        self.arrays.insert(
            Id::new(name),
            ArrayInfo {
                element_bytes,
                extents: extents.to_vec(),
            },
        );
        self
    }

    /// Append a band below the current (single) leaf of the schedule.
    pub fn band(mut self, text: &str) -> Result<Self, ParseError> {
        let band = parse::parse_band(text, &self.domain, &self.context)?;
        self.schedule = Some(self.extend_leaf(|leaf| leaf.insert_partial_schedule(band))?);
        Ok(self)
    }

    /// Append a permutable band whose members are all coincident.
    pub fn parallel_band(self, text: &str) -> Result<Self, ParseError> {
        let n = parse::parse_band(text, &self.domain, &self.context)?.n_member();
        self.band_with_flags(text, &vec![true; n], true)
    }

    /// Append a band with explicit coincidence flags.
    pub fn band_with_flags(mut self, text: &str, coincident: &[bool], permutable: bool) -> Result<Self, ParseError> {
        let band = parse::parse_band(text, &self.domain, &self.context)?
            .with_coincident(coincident)
            .with_permutable(permutable);
        self.schedule = Some(self.extend_leaf(|leaf| leaf.insert_partial_schedule(band))?);
        Ok(self)
    }

    /// Split the current leaf into a sequence with one statement filter per
    /// entry, e.g. `&["S0", "S1 S2"]`.
    pub fn sequence(mut self, filters: &[&str]) -> Result<Self, ParseError> {
        let sets = self.filter_sets(filters)?;
        self.schedule = Some(self.extend_leaf(|leaf| leaf.insert_sequence(sets))?);
        Ok(self)
    }

    pub fn set(mut self, filters: &[&str]) -> Result<Self, ParseError> {
        let sets = self.filter_sets(filters)?;
        self.schedule = Some(self.extend_leaf(|leaf| leaf.insert_set(sets))?);
        Ok(self)
    }

    pub fn build(self) -> Scop {
        let schedule = self
            .schedule
            .unwrap_or_else(|| Schedule::from_domain(self.domain.clone()));
        let statements = self
            .domain
            .ids()
            .map(|id| (id.clone(), StatementInfo::computation()))
            .collect();
        Scop {
            context: self.context,
            domain: self.domain,
            may_reads: self.may_reads,
            may_writes: self.may_writes,
            must_writes: self.must_writes,
            schedule,
            statements,
            arrays: self.arrays,
            declarations: Vec::new(),
            next_id: self.next_id,
        }
    }

    fn access(&mut self, text: &str) -> Result<TaggedAccess, ParseError> {
        let (statement, array, index) = default_backend().access(text, &self.domain, &self.context)?;
        let reference = Id::new(format!("__ref_{}", self.next_id));
        self.next_id += 1;
        Ok(TaggedAccess {
            statement,
            reference,
            array,
            index: index.into_iter().map(ScheduleExpr::Aff).collect(),
        })
    }

    fn filter_sets(&self, filters: &[&str]) -> Result<Vec<crate::affine::InstanceSet>, ParseError> {
        filters
            .iter()
            .map(|text| {
                let ids: Vec<Id> = text.split_whitespace().map(Id::new).collect();
                if let Some(unknown) = ids.iter().find(|id| !self.domain.contains(id)) {
                    return Err(ParseError::ParseFailed(format!(
                        "unknown statement {} in filter",
                        unknown
                    )));
                }
                Ok(crate::affine::InstanceSet::from_statements(&ids))
            })
            .collect()
    }

    fn extend_leaf(
        &self,
        insert: impl FnOnce(ScheduleNode) -> ScheduleNode,
    ) -> Result<Schedule, ParseError> {
        let schedule = self
            .schedule
            .clone()
            .unwrap_or_else(|| Schedule::from_domain(self.domain.clone()));
        let mut leaves = schedule.root().leaves();
        if leaves.len() != 1 {
            return Err(ParseError::ParseFailed(
                "builder can only extend a schedule with a single leaf".to_string(),
            ));
        }
        let leaf = leaves.remove(0);
        Ok(insert(leaf).into_schedule())
    }
}

/// Convenience for callers building bands by hand.
pub fn band_from_str(scop: &Scop, text: &str) -> Result<Band, ParseError> {
    parse::parse_band(text, &scop.domain, &scop.context)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_ids_are_unique() {
        let mut scop = ScopBuilder::new()
            .domain("{ S0[i] : 0 <= i <= 3 }")
            .unwrap()
            .build();
        let a = scop.fresh_id("kernel");
        let b = scop.fresh_id("kernel");
        assert_ne!(a, b);
        assert!(a.name().starts_with("kernel_"));
    }

    #[test]
    fn test_references_are_tagged_uniquely() {
        let scop = ScopBuilder::new()
            .domain("{ S0[i] : 0 <= i <= 3 }")
            .unwrap()
            .read("{ S0[i] -> A[i] }")
            .unwrap()
            .read("{ S0[i] -> A[i + 1] }")
            .unwrap()
            .write("{ S0[i] -> B[i] }")
            .unwrap()
            .build();
        let refs: Vec<&Id> = scop.accesses().map(|(_, a)| &a.reference).collect();
        assert_eq!(refs[0].name(), "__ref_0");
        assert_ne!(refs[0], refs[1]);
        assert!(scop.is_written(refs[2]));
        assert_eq!(scop.must_writes.len(), 1);
        assert!(scop.is_computation(&Id::new("S0")));
    }

    #[test]
    fn test_access_to_unknown_statement_fails() {
        let result = ScopBuilder::new()
            .domain("{ S0[i] : 0 <= i <= 3 }")
            .unwrap()
            .read("{ S9[i] -> A[i] }");
        assert!(result.is_err());
    }
}
