//! ISL-style textual notation and Scop persistence.
//!
//! Accepted forms:
//! - union sets: `"[N] -> { S0[i, j] : 0 <= i < N and 0 <= j <= 63; S1[k] : 0 <= k <= 7 }"`
//! - tagged accesses: `"{ S0[i, j] -> A[i, j + 1] }"`
//! - bands: `"[{ S0[i, j] -> [(i)]; S1[k] -> [(k)] }, { S0[i, j] -> [(j)]; S1[k] -> [(0)] }]"`
//!
//! Parameters are replaced by their value in the Scop context, and every
//! iterator must be bounded by the domain constraints. Schedule expressions
//! may use `floor(e/d)` and `e mod d`.

use lazy_static::lazy_static;
use log::debug;
use regex::Regex;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use thiserror::Error;

use crate::affine::{Aff, Interval, ScheduleExpr, StatementDomain, UnionDomain};
use crate::schedule_tree::{Band, BandMember};
use crate::scop::{Id, ParamContext, Scop};

/// Errors that can occur while reading textual or JSON input
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Failed to parse: {0}")]
    ParseFailed(String),

    #[error("Input is empty")]
    EmptyInput,

    /// I/O error when reading/writing files
    #[error("I/O error: {0}")]
    IOError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

lazy_static! {
    static ref PARAMS: Regex = Regex::new(r"^\s*\[([^\]\{]*)\]\s*->\s*").unwrap();
    static ref TUPLE: Regex =
        Regex::new(r"^\s*([A-Za-z_][A-Za-z0-9_]*)\s*\[([^\]]*)\]\s*(?::\s*(.*))?$").unwrap();
    static ref ACCESS: Regex = Regex::new(
        r"^\s*\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\[([^\]]*)\]\s*->\s*([A-Za-z_][A-Za-z0-9_]*)\s*\[([^\]]*)\]\s*\}\s*$"
    )
    .unwrap();
    static ref MEMBER: Regex = Regex::new(r"\{([^{}]*)\}").unwrap();
    static ref MEMBER_PIECE: Regex =
        Regex::new(r"^\s*([A-Za-z_][A-Za-z0-9_]*)\s*\[([^\]]*)\]\s*->\s*\[(.*)\]\s*$").unwrap();
    static ref COMPARISON: Regex = Regex::new(r"<=|>=|<|>|=").unwrap();
    static ref CONJUNCTION: Regex = Regex::new(r"\s+and\s+").unwrap();
    static ref TOKEN: Regex =
        Regex::new(r"^\s*(?:(\d+)|([A-Za-z_][A-Za-z0-9_']*)|(\S))").unwrap();
}

fn strip_params(text: &str) -> &str {
    match PARAMS.find(text) {
        Some(m) => &text[m.end()..],
        None => text,
    }
}

fn strip_braces(text: &str) -> Result<&str, ParseError> {
    let trimmed = text.trim();
    trimmed
        .strip_prefix('{')
        .and_then(|t| t.strip_suffix('}'))
        .ok_or_else(|| ParseError::ParseFailed(format!("expected braces around '{}'", trimmed)))
}

fn split_names(list: &str) -> Vec<String> {
    list.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

// ============================================================================
// Expressions
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(i64),
    Ident(String),
    Sym(char),
}

fn tokenize(text: &str) -> Result<Vec<Token>, ParseError> {
    let mut tokens = Vec::new();
    let mut rest = text;
    while !rest.trim().is_empty() {
        let caps = TOKEN
            .captures(rest)
            .ok_or_else(|| ParseError::ParseFailed(format!("unexpected input '{}'", rest)))?;
        if let Some(num) = caps.get(1) {
            let value = num
                .as_str()
                .parse()
                .map_err(|_| ParseError::ParseFailed(format!("integer overflow in '{}'", text)))?;
            tokens.push(Token::Num(value));
        } else if let Some(ident) = caps.get(2) {
            tokens.push(Token::Ident(ident.as_str().to_string()));
        } else if let Some(sym) = caps.get(3) {
            tokens.extend(sym.as_str().chars().next().map(Token::Sym));
        }
        rest = &rest[caps.get(0).map_or(rest.len(), |m| m.end())..];
    }
    Ok(tokens)
}

struct ExprParser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    dims: &'a [String],
    context: &'a ParamContext,
}

impl<'a> ExprParser<'a> {
    fn new(text: &str, dims: &'a [String], context: &'a ParamContext) -> Result<Self, ParseError> {
        Ok(ExprParser {
            tokens: tokenize(text)?,
            pos: 0,
            dims,
            context,
        })
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn expect_sym(&mut self, c: char) -> Result<(), ParseError> {
        match self.bump() {
            Some(Token::Sym(s)) if s == c => Ok(()),
            other => Err(ParseError::ParseFailed(format!(
                "expected '{}', found {:?}",
                c, other
            ))),
        }
    }

    fn expect_num(&mut self) -> Result<i64, ParseError> {
        match self.bump() {
            Some(Token::Num(n)) if n > 0 => Ok(n),
            other => Err(ParseError::ParseFailed(format!(
                "expected a positive integer, found {:?}",
                other
            ))),
        }
    }

    fn parse_complete(mut self) -> Result<ScheduleExpr, ParseError> {
        if self.tokens.is_empty() {
            return Err(ParseError::EmptyInput);
        }
        let expr = self.parse_sum()?;
        match self.peek() {
            None => Ok(expr),
            Some(token) => Err(ParseError::ParseFailed(format!(
                "trailing token {:?}",
                token
            ))),
        }
    }

    fn parse_sum(&mut self) -> Result<ScheduleExpr, ParseError> {
        let mut acc = self.parse_term()?;
        loop {
            match self.peek() {
                Some(Token::Sym('+')) => {
                    self.pos += 1;
                    acc = acc.plus(self.parse_term()?);
                }
                Some(Token::Sym('-')) => {
                    self.pos += 1;
                    acc = acc.plus(self.parse_term()?.scaled(-1));
                }
                _ => return Ok(acc),
            }
        }
    }

    fn parse_term(&mut self) -> Result<ScheduleExpr, ParseError> {
        let mut acc = self.parse_factor()?;
        loop {
            match self.peek() {
                Some(Token::Sym('*')) => {
                    self.pos += 1;
                    let rhs = self.parse_factor()?;
                    acc = self.multiply(acc, rhs)?;
                }
                Some(Token::Ident(word)) if word == "mod" => {
                    self.pos += 1;
                    let divisor = self.expect_num()?;
                    acc = acc.modulo(divisor);
                }
                // isl prints `2i` for `2 * i`
                Some(Token::Ident(_)) | Some(Token::Sym('(')) if is_constant(&acc) => {
                    let rhs = self.parse_factor()?;
                    acc = self.multiply(acc, rhs)?;
                }
                _ => return Ok(acc),
            }
        }
    }

    fn parse_factor(&mut self) -> Result<ScheduleExpr, ParseError> {
        let n = self.dims.len();
        match self.bump() {
            Some(Token::Num(value)) => Ok(ScheduleExpr::constant(n, value)),
            Some(Token::Sym('-')) => Ok(self.parse_factor()?.scaled(-1)),
            Some(Token::Sym('(')) => {
                let inner = self.parse_sum()?;
                self.expect_sym(')')?;
                Ok(inner)
            }
            Some(Token::Ident(word)) if word == "floor" => {
                self.expect_sym('(')?;
                let inner = self.parse_sum()?;
                self.expect_sym('/')?;
                let divisor = self.expect_num()?;
                self.expect_sym(')')?;
                Ok(inner.floor_div(divisor))
            }
            Some(Token::Ident(name)) => {
                if let Some(dim) = self.dims.iter().position(|d| *d == name) {
                    Ok(ScheduleExpr::var(n, dim))
                } else if let Some(&value) = self.context.get(&name) {
                    Ok(ScheduleExpr::constant(n, value))
                } else {
                    Err(ParseError::ParseFailed(format!("unknown name '{}'", name)))
                }
            }
            other => Err(ParseError::ParseFailed(format!(
                "unexpected token {:?}",
                other
            ))),
        }
    }

    fn multiply(&self, lhs: ScheduleExpr, rhs: ScheduleExpr) -> Result<ScheduleExpr, ParseError> {
        match (constant_value(&lhs), constant_value(&rhs)) {
            (Some(c), _) => Ok(rhs.scaled(c)),
            (_, Some(c)) => Ok(lhs.scaled(c)),
            _ => Err(ParseError::ParseFailed(
                "product of two non-constant expressions".to_string(),
            )),
        }
    }
}

fn constant_value(expr: &ScheduleExpr) -> Option<i64> {
    expr.as_aff().filter(|a| a.is_constant()).map(|a| a.constant)
}

fn is_constant(expr: &ScheduleExpr) -> bool {
    constant_value(expr).is_some()
}

/// Parse a quasi-affine expression over `dims`.
pub fn parse_expr(
    text: &str,
    dims: &[String],
    context: &ParamContext,
) -> Result<ScheduleExpr, ParseError> {
    ExprParser::new(text, dims, context)?.parse_complete()
}

/// Parse an affine expression over `dims`.
pub fn parse_aff(text: &str, dims: &[String], context: &ParamContext) -> Result<Aff, ParseError> {
    match parse_expr(text, dims, context)? {
        ScheduleExpr::Aff(aff) => Ok(aff),
        other => Err(ParseError::ParseFailed(format!(
            "'{}' is not affine ({})",
            text, other
        ))),
    }
}

// ============================================================================
// Domains
// ============================================================================

/// Parse a union set with the in-crate affine model.
///
/// Constraints bounding one iterator by constants shape the box; any other
/// affine constraint is kept as an inequality of the statement domain, so
/// `{ S0[i, j] : 0 <= i < 8 and 0 <= j <= i }` is a triangle.
///
/// # Errors
/// Returns `ParseError::ParseFailed` for iterators the constraints leave
/// unbounded and for unknown parameters.
pub fn parse_domain(text: &str, context: &ParamContext) -> Result<UnionDomain, ParseError> {
    if text.trim().is_empty() {
        return Err(ParseError::EmptyInput);
    }
    let body = strip_braces(strip_params(text))?;
    let mut domain = UnionDomain::new();
    for piece in body.split(';').map(str::trim).filter(|p| !p.is_empty()) {
        let caps = TUPLE
            .captures(piece)
            .ok_or_else(|| ParseError::ParseFailed(format!("malformed statement '{}'", piece)))?;
        let id = Id::new(&caps[1]);
        let dims = split_names(&caps[2]);
        let mut bounds = vec![UNBOUNDED; dims.len()];
        let mut inequalities = Vec::new();
        if let Some(constraints) = caps.get(3) {
            for conjunct in CONJUNCTION.split(constraints.as_str()) {
                apply_chain(conjunct, &dims, context, &mut bounds, &mut inequalities)?;
            }
        }
        let stmt = StatementDomain::with_constraints(dims, bounds, inequalities);
        if let Some(d) = stmt
            .bounds
            .iter()
            .position(|b| b.lo == i64::MIN || b.hi == i64::MAX)
        {
            return Err(ParseError::ParseFailed(format!(
                "iterator {} of {} is unbounded",
                stmt.dims[d], id
            )));
        }
        debug!(
            "parsed statement {} with bounds {:?} and {} inequalities",
            id,
            stmt.bounds,
            stmt.constraints.len()
        );
        domain.insert(id, stmt);
    }
    Ok(domain)
}

const UNBOUNDED: Interval = Interval {
    lo: i64::MIN,
    hi: i64::MAX,
};

/// Apply a comparison chain such as `0 <= i, j < 64` to the bounds.
fn apply_chain(
    chain: &str,
    dims: &[String],
    context: &ParamContext,
    bounds: &mut [Interval],
    inequalities: &mut Vec<Aff>,
) -> Result<(), ParseError> {
    let mut operands = Vec::new();
    let mut ops = Vec::new();
    let mut last = 0;
    for m in COMPARISON.find_iter(chain) {
        operands.push(&chain[last..m.start()]);
        ops.push(m.as_str());
        last = m.end();
    }
    operands.push(&chain[last..]);
    if ops.is_empty() {
        return Err(ParseError::ParseFailed(format!("not a constraint: '{}'", chain)));
    }
    for (i, op) in ops.iter().enumerate() {
        for lhs in operands[i].split(',') {
            for rhs in operands[i + 1].split(',') {
                let l = parse_aff(lhs, dims, context)?;
                let r = parse_aff(rhs, dims, context)?;
                for g in nonnegative_forms(&l, op, &r) {
                    bound_one(g, bounds, inequalities);
                }
            }
        }
    }
    Ok(())
}

/// Rewrite `l op r` as affine forms that must be `>= 0`.
fn nonnegative_forms(l: &Aff, op: &str, r: &Aff) -> Vec<Aff> {
    let diff = r.plus(&l.scaled(-1));
    let minus_one = |a: Aff| {
        let c = a.constant.saturating_sub(1);
        a.with_constant(c)
    };
    match op {
        "<=" => vec![diff],
        "<" => vec![minus_one(diff)],
        ">=" => vec![diff.scaled(-1)],
        ">" => vec![minus_one(diff.scaled(-1))],
        _ => vec![diff.scaled(-1), diff],
    }
}

/// `g >= 0` with a single iterator narrows the box; anything else becomes
/// an inequality of the domain.
fn bound_one(g: Aff, bounds: &mut [Interval], inequalities: &mut Vec<Aff>) {
    let mut vars = g.coeffs.iter().enumerate().filter(|(_, c)| **c != 0);
    match (vars.next(), vars.next()) {
        (Some((d, &c)), None) if d < bounds.len() => {
            let slot = &mut bounds[d];
            // c * i_d >= -k
            let k = g.constant;
            if c > 0 {
                let nk = k.saturating_neg();
                let lo = nk.div_euclid(c) + i64::from(nk.rem_euclid(c) != 0);
                slot.lo = slot.lo.max(lo);
            } else {
                slot.hi = slot.hi.min(k.div_euclid(-c));
            }
        }
        _ => {
            if !inequalities.contains(&g) {
                inequalities.push(g);
            }
        }
    }
}

// ============================================================================
// Accesses and bands
// ============================================================================

/// Parse a single-statement access relation; returns the statement, the
/// array and one affine index per array dimension.
pub fn parse_access(
    text: &str,
    domain: &UnionDomain,
    context: &ParamContext,
) -> Result<(Id, Id, Vec<Aff>), ParseError> {
    let text = strip_params(text);
    let caps = ACCESS
        .captures(text)
        .ok_or_else(|| ParseError::ParseFailed(format!("malformed access '{}'", text)))?;
    let statement = Id::new(&caps[1]);
    let dims = split_names(&caps[2]);
    check_arity(&statement, &dims, domain)?;
    let index = caps[4]
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| parse_aff(s, &dims, context))
        .collect::<Result<Vec<_>, _>>()?;
    Ok((statement, Id::new(&caps[3]), index))
}

fn check_arity(statement: &Id, dims: &[String], domain: &UnionDomain) -> Result<(), ParseError> {
    match domain.get(statement) {
        None => Err(ParseError::ParseFailed(format!(
            "unknown statement {}",
            statement
        ))),
        Some(d) if d.n_dims() != dims.len() => Err(ParseError::ParseFailed(format!(
            "{} has {} iterators, found {}",
            statement,
            d.n_dims(),
            dims.len()
        ))),
        Some(_) => Ok(()),
    }
}

/// Parse a multi-member band. Members are neither coincident nor
/// permutable until marked so.
pub fn parse_band(text: &str, domain: &UnionDomain, context: &ParamContext) -> Result<Band, ParseError> {
    let text = strip_params(text).trim();
    if text.is_empty() {
        return Err(ParseError::EmptyInput);
    }
    let mut members = Vec::new();
    for group in MEMBER.captures_iter(text) {
        let mut schedule = BTreeMap::new();
        for piece in group[1].split(';').map(str::trim).filter(|p| !p.is_empty()) {
            let caps = MEMBER_PIECE
                .captures(piece)
                .ok_or_else(|| ParseError::ParseFailed(format!("malformed member '{}'", piece)))?;
            let statement = Id::new(&caps[1]);
            let dims = split_names(&caps[2]);
            check_arity(&statement, &dims, domain)?;
            schedule.insert(statement, parse_expr(&caps[3], &dims, context)?);
        }
        members.push(BandMember::new(schedule));
    }
    if members.is_empty() {
        return Err(ParseError::ParseFailed(format!("no band members in '{}'", text)));
    }
    Ok(Band::new(members))
}

// ============================================================================
// Persistence
// ============================================================================

/// Save a Scop, schedule and side tables included, as pretty JSON.
pub fn save_scop_json<P: AsRef<Path>>(scop: &Scop, path: P) -> Result<(), ParseError> {
    let json = serde_json::to_string_pretty(scop)?;
    fs::write(path.as_ref(), json)?;
    debug!("saved scop to {}", path.as_ref().display());
    Ok(())
}

pub fn load_scop_json<P: AsRef<Path>>(path: P) -> Result<Scop, ParseError> {
    let content = fs::read_to_string(path.as_ref())?;
    if content.trim().is_empty() {
        return Err(ParseError::EmptyInput);
    }
    Ok(serde_json::from_str(&content)?)
}
