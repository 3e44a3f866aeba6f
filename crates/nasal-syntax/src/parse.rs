//! The front-end seam.
//!
//! Lexing and parsing live outside this workspace. The linker only needs
//! three capabilities from a front end, captured by [`ParseService`]: turn
//! source text into a tree while reporting onto the shared diagnostics
//! channel, expose the current tree, and swap the current root for a
//! replacement. The swap is how ownership of spliced trees transfers
//! between the front end and the linker without either side holding a
//! dangling root.

use nasal_core::Diagnostics;

use crate::ast::Block;

/// A lexer/parser pair able to analyse one source file at a time.
pub trait ParseService {
    /// Lex and parse `source` as the contents of `filename`.
    ///
    /// Problems are appended to `diags` with the `Lex`/`Parse` phase tags;
    /// the caller decides how to react. After a failed compile the current
    /// tree's content is unspecified but must still be a valid block.
    fn compile(&mut self, source: &str, filename: &str, diags: &mut Diagnostics);

    /// The most recently produced tree.
    fn tree(&self) -> &Block;

    /// Exchange the current root for `replacement`, returning the previous
    /// root. The returned tree is exclusively owned by the caller.
    fn swap(&mut self, replacement: Block) -> Block;
}
