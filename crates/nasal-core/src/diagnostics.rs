//! The shared diagnostics channel.
//!
//! Every phase of the toolchain (lexer, parser, linker, code generator)
//! appends to one [`Diagnostics`] collection passed down by `&mut`
//! reference, so messages accumulate across phase boundaries without loss.
//! Phases do not abort on a fatal condition; they keep processing to batch
//! diagnostics, and the driver must check [`Diagnostics::has_fatal`] at
//! each phase boundary before trusting the tree it hands to the next phase.

use std::fmt;

use crate::Span;

/// The phase a diagnostic originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Lexical analysis (external front end).
    Lex,
    /// Parsing (external front end).
    Parse,
    /// Module linking.
    Link,
    /// Code generation.
    Code,
}

impl Phase {
    /// Short tag used when rendering a diagnostic.
    pub fn tag(&self) -> &'static str {
        match self {
            Phase::Lex => "lex",
            Phase::Parse => "parse",
            Phase::Link => "link",
            Phase::Code => "code",
        }
    }
}

/// How severe a diagnostic is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Severity {
    /// A problem that does not invalidate the compilation.
    Warning,
    /// A problem that makes the compilation unusable. The reporting phase
    /// keeps going, but downstream phases must not run.
    Fatal,
}

/// A single diagnostic record.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    /// The phase that reported this diagnostic.
    pub phase: Phase,
    /// Severity level.
    pub severity: Severity,
    /// Source location, if one applies.
    pub location: Option<Span>,
    /// The message text.
    pub message: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let severity = match self.severity {
            Severity::Warning => "warning",
            Severity::Fatal => "error",
        };
        match &self.location {
            Some(loc) => write!(
                f,
                "{}:{}:{}: {} {}: {}",
                loc.file,
                loc.begin_line,
                loc.begin_col,
                self.phase.tag(),
                severity,
                self.message
            ),
            None => write!(f, "{} {}: {}", self.phase.tag(), severity, self.message),
        }
    }
}

/// Append-only collection of diagnostics shared across all phases.
#[derive(Debug, Default)]
pub struct Diagnostics {
    records: Vec<Diagnostic>,
    has_fatal: bool,
}

impl Diagnostics {
    /// Create a new, empty collection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record.
    pub fn push(&mut self, record: Diagnostic) {
        if record.severity == Severity::Fatal {
            self.has_fatal = true;
        }
        self.records.push(record);
    }

    /// Append a fatal diagnostic.
    pub fn fatal(&mut self, phase: Phase, location: Option<Span>, message: impl ToString) {
        self.push(Diagnostic {
            phase,
            severity: Severity::Fatal,
            location,
            message: message.to_string(),
        });
    }

    /// Append a warning.
    pub fn warning(&mut self, phase: Phase, location: Option<Span>, message: impl ToString) {
        self.push(Diagnostic {
            phase,
            severity: Severity::Warning,
            location,
            message: message.to_string(),
        });
    }

    /// Whether any fatal diagnostic has been recorded.
    ///
    /// Tracked as a flag, so this does not scan the records.
    pub fn has_fatal(&self) -> bool {
        self.has_fatal
    }

    /// Whether any warning has been recorded.
    pub fn has_warnings(&self) -> bool {
        self.records.iter().any(|d| d.severity == Severity::Warning)
    }

    /// Whether the collection is empty.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Total number of records.
    pub fn count(&self) -> usize {
        self.records.len()
    }

    /// Iterate over all records in the order they were reported.
    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.records.iter()
    }

    /// Iterate over only the fatal records.
    pub fn fatals(&self) -> impl Iterator<Item = &Diagnostic> {
        self.records
            .iter()
            .filter(|d| d.severity == Severity::Fatal)
    }

    /// Iterate over only the warnings.
    pub fn warnings(&self) -> impl Iterator<Item = &Diagnostic> {
        self.records
            .iter()
            .filter(|d| d.severity == Severity::Warning)
    }

    /// Write all records to `writer`, one per line.
    pub fn emit<W: std::io::Write>(&self, writer: &mut W) -> std::io::Result<()> {
        for record in &self.records {
            writeln!(writer, "{}", record)?;
        }
        Ok(())
    }
}

impl fmt::Display for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for record in &self.records {
            writeln!(f, "{}", record)?;
        }
        Ok(())
    }
}
