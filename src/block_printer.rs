// Block-style (YAML-like) rendering of schedule trees.
// Keeps the full tree structure, so it is what debug logs print.

use std::fmt::Write;

use crate::affine::UnionDomain;
use crate::schedule_tree::{MarkKind, NodeKind, Schedule, TreeNode};

/// Get the schedule as a block-style string that preserves tree structure.
///
/// ```text
/// domain: "{ S0[i] : 0 <= i <= 255 }"
/// child:
///   band: "[{ S0[i] -> [(floor((i)/32))] }, { S0[i] -> [((i) mod 32)] }]"
///   coincident: [ 1, 1 ]
/// ```
pub fn schedule_to_block_str(schedule: &Schedule) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "domain: \"{}\"", schedule.domain().to_isl_str());
    write_children(&mut out, schedule.domain(), schedule.root_tree(), 0);
    out
}

fn write_children(out: &mut String, domain: &UnionDomain, node: &TreeNode, depth: usize) {
    match node.children.len() {
        0 => {}
        1 => {
            let pad = "  ".repeat(depth);
            let _ = writeln!(out, "{}child:", pad);
            write_node(out, domain, &node.children[0], depth + 1);
        }
        _ => {
            // sequence and set children are listed under the node itself
            for child in &node.children {
                let pad = "  ".repeat(depth + 1);
                let _ = writeln!(out, "{}- ", pad);
                write_node(out, domain, child, depth + 2);
            }
        }
    }
}

fn write_node(out: &mut String, domain: &UnionDomain, node: &TreeNode, depth: usize) {
    let pad = "  ".repeat(depth);
    match &node.kind {
        NodeKind::Leaf => {
            let _ = writeln!(out, "{}leaf", pad);
        }
        NodeKind::Band(band) => {
            let members: Vec<String> = band
                .members
                .iter()
                .map(|m| {
                    let pieces: Vec<String> = m
                        .schedule
                        .iter()
                        .map(|(id, expr)| {
                            let names = domain.get(id).map(|d| d.dims.clone()).unwrap_or_default();
                            format!("{}[{}] -> [({})]", id, names.join(", "), expr.fmt_with(&names))
                        })
                        .collect();
                    format!("{{ {} }}", pieces.join("; "))
                })
                .collect();
            let flags = |f: &dyn Fn(usize) -> bool| -> String {
                (0..band.members.len())
                    .map(|i| if f(i) { "1" } else { "0" })
                    .collect::<Vec<_>>()
                    .join(", ")
            };
            let _ = writeln!(out, "{}band: \"[{}]\"", pad, members.join(", "));
            if band.permutable {
                let _ = writeln!(out, "{}permutable: 1", pad);
            }
            let _ = writeln!(out, "{}coincident: [ {} ]", pad, flags(&|i| band.members[i].coincident));
            if band.members.iter().any(|m| m.unroll) {
                let _ = writeln!(out, "{}unroll: [ {} ]", pad, flags(&|i| band.members[i].unroll));
            }
        }
        NodeKind::Filter(filter) => {
            match filter.tag {
                Some(tag) => {
                    let _ = writeln!(out, "{}filter: \"{}\"  # {}", pad, filter.set, tag);
                }
                None => {
                    let _ = writeln!(out, "{}filter: \"{}\"", pad, filter.set);
                }
            }
        }
        NodeKind::Mark(mark) => {
            let kind = match &mark.kind {
                MarkKind::Kernel => "kernel".to_string(),
                MarkKind::PromotionScope => "promotion scope".to_string(),
                MarkKind::Barrier => "barrier".to_string(),
                MarkKind::User(name) => name.clone(),
            };
            let _ = writeln!(out, "{}mark: \"{}\"  # {}", pad, mark.id, kind);
        }
        NodeKind::Sequence => {
            let _ = writeln!(out, "{}sequence:", pad);
        }
        NodeKind::Set => {
            let _ = writeln!(out, "{}set:", pad);
        }
        NodeKind::Context(context) => {
            let _ = writeln!(
                out,
                "{}context: \"grid [{}] block [{}]\"",
                pad,
                join(&context.grid),
                join(&context.block)
            );
        }
        NodeKind::Guard(guard) => {
            let _ = writeln!(out, "{}guard: \"{}\"", pad, guard.condition);
        }
        NodeKind::Extension(extension) => {
            let copies: Vec<String> = extension
                .statements
                .iter()
                .map(|c| format!("{}[{}] -> {:?} {} <-> {}", c.id, c.domain.n_dims(), c.direction, c.array, c.buffer))
                .collect();
            let _ = writeln!(out, "{}extension: \"{{ {} }}\"", pad, copies.join("; "));
        }
    }
    write_children(out, domain, node, depth);
}

fn join(values: &[i64]) -> String {
    values.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(", ")
}
