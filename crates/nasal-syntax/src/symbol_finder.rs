//! Top-level symbol scanner.
//!
//! Enumerates the names bound by the direct statements of a block, in
//! source order. The linker uses this to build a module's export record;
//! the code generator uses it to pre-register a block's symbols so sibling
//! definitions can refer to each other regardless of order.
//!
//! The scan is deliberately shallow: nested blocks and function bodies open
//! their own scopes and are not this scanner's business.

use nasal_core::Span;

use crate::ast::{Block, DefTarget, Expr};

/// A name bound at the top level of a block.
#[derive(Debug, Clone, PartialEq)]
pub struct Symbol {
    pub name: String,
    pub span: Span,
}

/// Collect every name bound by the direct statements of `block`.
///
/// Single definitions contribute one name; tuple-destructuring definitions
/// contribute one per identifier. Duplicates are kept; slot allocation
/// downstream is idempotent per name.
pub fn find_symbols(block: &Block) -> Vec<Symbol> {
    let mut symbols = Vec::new();
    for stmt in &block.stmts {
        if let Expr::Def(def) = stmt {
            match &def.target {
                DefTarget::Single(id) => symbols.push(Symbol {
                    name: id.name.clone(),
                    span: id.span.clone(),
                }),
                DefTarget::Multi(multi) => {
                    for id in &multi.names {
                        symbols.push(Symbol {
                            name: id.name.clone(),
                            span: id.span.clone(),
                        });
                    }
                }
            }
        }
    }
    symbols
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{
        BoolLiteral, DefinitionExpr, FunctionExpr, Identifier, MultiIdentifier, NumberLiteral,
    };

    fn span() -> Span {
        Span::new(1, 1, 1, 2, "test.nas")
    }

    fn def(name: &str, value: Expr) -> Expr {
        Expr::Def(DefinitionExpr {
            target: DefTarget::Single(Identifier {
                name: name.into(),
                span: span(),
            }),
            value: Box::new(value),
            span: span(),
        })
    }

    fn num(value: f64) -> Expr {
        Expr::Num(NumberLiteral {
            value,
            span: span(),
        })
    }

    #[test]
    fn collects_single_and_multi_definitions() {
        let mut block = Block::empty(span());
        block.push(def("a", num(1.0)));
        block.push(Expr::Def(DefinitionExpr {
            target: DefTarget::Multi(MultiIdentifier {
                names: vec![
                    Identifier {
                        name: "b".into(),
                        span: span(),
                    },
                    Identifier {
                        name: "c".into(),
                        span: span(),
                    },
                ],
                span: span(),
            }),
            value: Box::new(num(2.0)),
            span: span(),
        }));

        let names: Vec<_> = find_symbols(&block).into_iter().map(|s| s.name).collect();
        assert_eq!(names, ["a", "b", "c"]);
    }

    #[test]
    fn ignores_non_definitions_and_nested_bodies() {
        let mut body = Block::empty(span());
        body.push(def("inner", num(1.0)));

        let mut block = Block::empty(span());
        block.push(Expr::Bool(BoolLiteral {
            value: true,
            span: span(),
        }));
        block.push(def(
            "f",
            Expr::Func(FunctionExpr {
                params: Vec::new(),
                body,
                span: span(),
            }),
        ));

        let names: Vec<_> = find_symbols(&block).into_iter().map(|s| s.name).collect();
        assert_eq!(names, ["f"]);
    }
}
