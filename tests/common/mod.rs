//! Shared test harness: a scripted front end standing in for the external
//! lexer/parser, plus tree builders.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::mem;

use nasal::prelude::*;
use nasal::syntax::ast::{
    Block, CallExpr, CallField, CallInvoke, CallPart, DefTarget, DefinitionExpr, Expr,
    ForeiExpr, ForeiKind, FunctionExpr, Identifier, IterBinding, IterExpr, NumberLiteral,
    Param, ParamKind, ReturnExpr, StringLiteral, VectorExpr, WhileExpr,
};

/// A front end scripted per file path: `compile` looks the path up instead
/// of parsing, and the tree/swap contract behaves like the real one.
#[derive(Default)]
pub struct ScriptedParser {
    trees: HashMap<String, Block>,
    fail: HashSet<String>,
    current: Block,
}

impl ScriptedParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the tree returned when `path` is compiled.
    pub fn provide(&mut self, path: impl Into<String>, tree: Block) {
        self.trees.insert(path.into(), tree);
    }

    /// Make compiling `path` report a parse-phase fatal.
    pub fn fail_on(&mut self, path: impl Into<String>) {
        self.fail.insert(path.into());
    }
}

impl ParseService for ScriptedParser {
    fn compile(&mut self, _source: &str, filename: &str, diags: &mut Diagnostics) {
        if self.fail.contains(filename) {
            diags.fatal(Phase::Parse, None, format!("syntax error in <{filename}>"));
            self.current = Block::default();
            return;
        }
        self.current = self.trees.get(filename).cloned().unwrap_or_default();
    }

    fn tree(&self) -> &Block {
        &self.current
    }

    fn swap(&mut self, replacement: Block) -> Block {
        mem::replace(&mut self.current, replacement)
    }
}

pub fn sp() -> Span {
    Span::new(1, 1, 1, 2, "test.nas")
}

pub fn num(value: f64) -> Expr {
    Expr::Num(NumberLiteral { value, span: sp() })
}

pub fn str_lit(value: &str) -> Expr {
    Expr::Str(StringLiteral {
        value: value.into(),
        span: sp(),
    })
}

pub fn ident(name: &str) -> Identifier {
    Identifier {
        name: name.into(),
        span: sp(),
    }
}

pub fn id(name: &str) -> Expr {
    Expr::Id(ident(name))
}

pub fn def(name: &str, value: Expr) -> Expr {
    Expr::Def(DefinitionExpr {
        target: DefTarget::Single(ident(name)),
        value: Box::new(value),
        span: sp(),
    })
}

pub fn block(stmts: Vec<Expr>) -> Block {
    Block {
        stmts,
        span: sp(),
    }
}

pub fn func(params: &[&str], body: Block) -> Expr {
    Expr::Func(FunctionExpr {
        params: params
            .iter()
            .map(|name| Param {
                name: (*name).into(),
                kind: ParamKind::Normal,
                span: sp(),
            })
            .collect(),
        body,
        span: sp(),
    })
}

pub fn vector(elements: Vec<Expr>) -> Expr {
    Expr::Vector(VectorExpr {
        elements,
        span: sp(),
    })
}

pub fn foreach_var(name: &str, over: Expr, body: Block) -> Expr {
    Expr::Forei(ForeiExpr {
        kind: ForeiKind::ForEach,
        iterator: IterExpr {
            binding: IterBinding::Define(ident(name)),
            span: sp(),
        },
        vector: Box::new(over),
        body,
        span: sp(),
    })
}

pub fn while_loop(condition: Expr, body: Block) -> Expr {
    Expr::While(WhileExpr {
        condition: Box::new(condition),
        body,
        span: sp(),
    })
}

pub fn ret(value: Option<Expr>) -> Expr {
    Expr::Return(ReturnExpr {
        value: value.map(Box::new),
        span: sp(),
    })
}

/// `import("<path>");`
pub fn import_call(path: &str) -> Expr {
    Expr::Call(CallExpr {
        first: Box::new(id("import")),
        calls: vec![CallPart::Invoke(CallInvoke {
            args: vec![str_lit(path)],
            span: sp(),
        })],
        span: sp(),
    })
}

/// `import.seg1.seg2;`
pub fn import_dotted(segments: &[&str]) -> Expr {
    Expr::Call(CallExpr {
        first: Box::new(id("import")),
        calls: segments
            .iter()
            .map(|seg| {
                CallPart::Field(CallField {
                    field: (*seg).into(),
                    span: sp(),
                })
            })
            .collect(),
        span: sp(),
    })
}

/// Names bound by single definitions at the top level of `tree`, in order.
pub fn def_names(tree: &Block) -> Vec<String> {
    tree.stmts
        .iter()
        .filter_map(|stmt| match stmt {
            Expr::Def(def) => match &def.target {
                DefTarget::Single(id) => Some(id.name.clone()),
                DefTarget::Multi(_) => None,
            },
            _ => None,
        })
        .collect()
}
