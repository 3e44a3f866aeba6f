//! Facade crate for the nasal middle end.
//!
//! Re-exports the workspace members so embedders depend on one crate:
//! `nasal-core` (spans, diagnostics), `nasal-syntax` (AST, dumper, symbol
//! scanner, front-end seam), and `nasal-compiler` (linker, code
//! generator, bytecode).

pub use nasal_compiler as compiler;
pub use nasal_core as core;
pub use nasal_syntax as syntax;

// Re-export the main types
pub mod prelude {
    pub use nasal_compiler::{
        CodeGen, CodeUnit, Instruction, Linker, NativeFunction, NativeRegistry, NoNatives,
        OpCode,
    };
    pub use nasal_core::{Diagnostic, Diagnostics, Phase, Severity, Span};
    pub use nasal_syntax::ParseService;
    pub use nasal_syntax::ast::{Block, Expr};
}
