//! Source location tracking for error reporting.
//!
//! Provides [`Span`] to track where AST nodes, diagnostics, and emitted
//! instructions originate in source code.

use std::fmt;
use std::sync::Arc;

/// A span of source code: a begin/end position plus the originating file.
///
/// The linker splices trees parsed from many files into one, so every node
/// carries its own file name. The name is a shared `Arc<str>` because spans
/// are cloned into each emitted instruction.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Span {
    /// Line the span begins on (1-indexed).
    pub begin_line: u32,
    /// Column the span begins at (1-indexed, byte-based).
    pub begin_col: u32,
    /// Line the span ends on.
    pub end_line: u32,
    /// Column the span ends at.
    pub end_col: u32,
    /// Name of the originating file.
    pub file: Arc<str>,
}

impl Span {
    /// Create a new span covering a begin and end position.
    pub fn new(
        begin_line: u32,
        begin_col: u32,
        end_line: u32,
        end_col: u32,
        file: impl Into<Arc<str>>,
    ) -> Self {
        Self {
            begin_line,
            begin_col,
            end_line,
            end_col,
            file: file.into(),
        }
    }

    /// Create a zero-length span at a position.
    pub fn point(line: u32, col: u32, file: impl Into<Arc<str>>) -> Self {
        let file = file.into();
        Self {
            begin_line: line,
            begin_col: col,
            end_line: line,
            end_col: col,
            file,
        }
    }

    /// A span with no position, used for synthesized nodes that have no
    /// direct source counterpart.
    pub fn synthesized(file: impl Into<Arc<str>>) -> Self {
        Self::new(0, 0, 0, 0, file)
    }

    /// Extend this span so it ends where `other` ends.
    pub fn extend_to(&mut self, other: &Span) {
        self.end_line = other.end_line;
        self.end_col = other.end_col;
    }

    /// Merge two spans into one covering both, keeping `self`'s file.
    pub fn merge(&self, other: &Span) -> Span {
        let mut merged = self.clone();
        merged.extend_to(other);
        merged
    }
}

impl Default for Span {
    fn default() -> Self {
        Self::synthesized("")
    }
}

impl fmt::Debug for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.begin_line, self.begin_col)
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.begin_line, self.begin_col)
    }
}
