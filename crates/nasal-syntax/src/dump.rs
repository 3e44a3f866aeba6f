//! Tree dumper: renders an AST as an indented outline, one node per line.
//!
//! Used by tests and for debugging linker rewrites. The output is stable
//! and line-oriented so tests can assert on fragments of it.

use crate::ast::{
    Block, CallPart, DefTarget, Expr, FoldedConst, ForeiKind, IterBinding, ParamKind,
};

/// Render `block` as an indented outline.
pub fn dump(block: &Block) -> String {
    let mut out = String::new();
    write_block(block, 0, &mut out);
    out
}

fn line(out: &mut String, depth: usize, text: &str) {
    for _ in 0..depth {
        out.push_str("  ");
    }
    out.push_str(text);
    out.push('\n');
}

fn write_block(block: &Block, depth: usize, out: &mut String) {
    line(out, depth, "block");
    for stmt in &block.stmts {
        write_expr(stmt, depth + 1, out);
    }
}

fn write_expr(expr: &Expr, depth: usize, out: &mut String) {
    match expr {
        Expr::Null(_) => line(out, depth, "null"),
        Expr::Nil(_) => line(out, depth, "nil"),
        Expr::Block(block) => write_block(block, depth, out),
        Expr::Num(n) => line(out, depth, &format!("num {}", n.value)),
        Expr::Str(s) => line(out, depth, &format!("str {:?}", s.value)),
        Expr::Bool(b) => line(out, depth, &format!("bool {}", b.value)),
        Expr::Id(id) => line(out, depth, &format!("id {}", id.name)),
        Expr::Vector(vec) => {
            line(out, depth, "vector");
            for element in &vec.elements {
                write_expr(element, depth + 1, out);
            }
        }
        Expr::Hash(hash) => {
            line(out, depth, "hash");
            for member in &hash.members {
                line(out, depth + 1, &format!("pair {}", member.name));
                write_expr(&member.value, depth + 2, out);
            }
        }
        Expr::Func(func) => {
            line(out, depth, "func");
            for param in &func.params {
                match &param.kind {
                    ParamKind::Normal => line(out, depth + 1, &format!("param {}", param.name)),
                    ParamKind::Default(default) => {
                        line(out, depth + 1, &format!("param {} =", param.name));
                        write_expr(default, depth + 2, out);
                    }
                    ParamKind::Dynamic => {
                        line(out, depth + 1, &format!("param {}...", param.name))
                    }
                }
            }
            write_block(&func.body, depth + 1, out);
        }
        Expr::Call(call) => {
            line(out, depth, "call");
            write_expr(&call.first, depth + 1, out);
            for part in &call.calls {
                match part {
                    CallPart::Field(field) => {
                        line(out, depth + 1, &format!("field {}", field.field))
                    }
                    CallPart::Index(index) => {
                        line(out, depth + 1, "index");
                        for slice in &index.slices {
                            write_expr(&slice.begin, depth + 2, out);
                            if let Some(end) = &slice.end {
                                line(out, depth + 2, ":");
                                write_expr(end, depth + 2, out);
                            }
                        }
                    }
                    CallPart::Invoke(invoke) => {
                        line(out, depth + 1, "invoke");
                        for arg in &invoke.args {
                            write_expr(arg, depth + 2, out);
                        }
                    }
                }
            }
        }
        Expr::Ternary(ternary) => {
            line(out, depth, "ternary");
            write_expr(&ternary.condition, depth + 1, out);
            write_expr(&ternary.left, depth + 1, out);
            write_expr(&ternary.right, depth + 1, out);
        }
        Expr::Binary(binary) => {
            match &binary.folded {
                Some(FoldedConst::Num(value)) => {
                    line(out, depth, &format!("binary {} [folded {}]", binary.op, value))
                }
                Some(FoldedConst::Str(value)) => line(
                    out,
                    depth,
                    &format!("binary {} [folded {:?}]", binary.op, value),
                ),
                None => line(out, depth, &format!("binary {}", binary.op)),
            }
            write_expr(&binary.left, depth + 1, out);
            write_expr(&binary.right, depth + 1, out);
        }
        Expr::Unary(unary) => {
            line(out, depth, &format!("unary {}", unary.op));
            write_expr(&unary.operand, depth + 1, out);
        }
        Expr::Def(def) => {
            match &def.target {
                DefTarget::Single(id) => line(out, depth, &format!("def {}", id.name)),
                DefTarget::Multi(multi) => {
                    let names: Vec<&str> =
                        multi.names.iter().map(|id| id.name.as_str()).collect();
                    line(out, depth, &format!("def ({})", names.join(", ")));
                }
            }
            write_expr(&def.value, depth + 1, out);
        }
        Expr::Assign(assign) => {
            line(out, depth, &format!("assign {}", assign.op));
            write_expr(&assign.left, depth + 1, out);
            write_expr(&assign.right, depth + 1, out);
        }
        Expr::MultiAssign(multi) => {
            line(out, depth, "multi-assign");
            for target in &multi.targets.elements {
                write_expr(target, depth + 1, out);
            }
            write_expr(&multi.value, depth + 1, out);
        }
        Expr::Tuple(tuple) => {
            line(out, depth, "tuple");
            for element in &tuple.elements {
                write_expr(element, depth + 1, out);
            }
        }
        Expr::Cond(cond) => {
            line(out, depth, "cond");
            for (index, arm) in cond.arms.iter().enumerate() {
                line(out, depth + 1, if index == 0 { "if" } else { "elsif" });
                write_expr(&arm.condition, depth + 2, out);
                write_block(&arm.body, depth + 2, out);
            }
            if let Some(else_block) = &cond.else_block {
                line(out, depth + 1, "else");
                write_block(else_block, depth + 2, out);
            }
        }
        Expr::While(while_loop) => {
            line(out, depth, "while");
            write_expr(&while_loop.condition, depth + 1, out);
            write_block(&while_loop.body, depth + 1, out);
        }
        Expr::For(for_loop) => {
            line(out, depth, "for");
            write_expr(&for_loop.initial, depth + 1, out);
            write_expr(&for_loop.condition, depth + 1, out);
            write_expr(&for_loop.step, depth + 1, out);
            write_block(&for_loop.body, depth + 1, out);
        }
        Expr::Forei(forei) => {
            line(
                out,
                depth,
                match forei.kind {
                    ForeiKind::ForEach => "foreach",
                    ForeiKind::ForIndex => "forindex",
                },
            );
            match &forei.iterator.binding {
                IterBinding::Define(id) => line(out, depth + 1, &format!("iter var {}", id.name)),
                IterBinding::Existing(place) => {
                    line(out, depth + 1, "iter");
                    write_expr(&place.first, depth + 2, out);
                }
            }
            write_expr(&forei.vector, depth + 1, out);
            write_block(&forei.body, depth + 1, out);
        }
        Expr::Continue(_) => line(out, depth, "continue"),
        Expr::Break(_) => line(out, depth, "break"),
        Expr::Return(ret) => {
            line(out, depth, "return");
            if let Some(value) = &ret.value {
                write_expr(value, depth + 1, out);
            }
        }
    }
}
