//! Shared foundation for the nasal middle end.
//!
//! Provides source spans, the append-only diagnostics channel shared by
//! every phase, and the typed error catalog rendered onto that channel.

mod diagnostics;
mod error;
mod span;

pub use diagnostics::{Diagnostic, Diagnostics, Phase, Severity};
pub use error::{CodegenError, LinkError};
pub use span::Span;
