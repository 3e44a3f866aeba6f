//! Typed errors for the linking and code-generation phases.
//!
//! These enums are the catalog of everything the middle end can complain
//! about. They are not propagated as `Result`s across phase boundaries:
//! each is rendered through its `Display` implementation and recorded on
//! the shared [`Diagnostics`](crate::Diagnostics) channel, with the phase
//! tag and severity chosen at the report site.

use thiserror::Error;

/// Problems reported by the module linker.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LinkError {
    /// A requested module could not be found on any search path.
    #[error("in <{file}>: cannot find file <{name}>, enable search-path output for details")]
    FileNotFound { file: String, name: String },

    /// Verbose form of [`LinkError::FileNotFound`], listing every path tried.
    #[error("in <{file}>: cannot find file <{name}> in these paths:\n{paths}")]
    FileNotFoundDetail {
        file: String,
        name: String,
        paths: String,
    },

    /// A module file exists but could not be read.
    #[error("failed to read <{name}>: {detail}")]
    UnreadableFile { name: String, detail: String },

    /// A module, directly or transitively, imports a file that is still on
    /// the active import chain.
    #[error("self-referenced module <{name}>:\n    reference path: {chain}")]
    SelfImport { name: String, chain: String },

    /// The front end reported problems while analysing a module file.
    #[error("error occurred when analysing <{name}>")]
    ModuleAnalysis { name: String },

    /// The front end reported problems while analysing the standard library.
    #[error("error occurred when analysing library <{name}>")]
    LibraryAnalysis { name: String },

    /// The module path does not end in the required extension.
    #[error("invalid module name from <{path}>, will not be easily accessed: the \".nas\" extension is required")]
    ModuleNameBadExtension { path: String },

    /// The derived module name is empty.
    #[error("empty module name from <{path}>, will not be easily accessed")]
    ModuleNameEmpty { path: String },

    /// The derived module name begins with a digit.
    #[error("module <{name}> from <{path}> will not be easily accessed: name begins with a digit")]
    ModuleNameLeadingDigit { name: String, path: String },

    /// The derived module name contains an internal separator.
    #[error("module <{name}> from <{path}> will not be easily accessed: name contains '.'")]
    ModuleNameInnerSeparator { name: String, path: String },
}

/// Problems reported by the code generator.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CodegenError {
    /// An identifier resolved to no local, upvalue, global, or native slot.
    #[error("undefined symbol \"{name}\"")]
    UndefinedSymbol { name: String },

    /// A definition collides with a native function name.
    #[error("\"{name}\" conflicts with a native function")]
    NativeConflict { name: String },

    /// A native function was referenced at global scope.
    #[error("native function \"{name}\" must be used inside a function")]
    NativeOutsideFunction { name: String },

    /// The left side of an assignment is not an assignable expression.
    #[error("bad assignment left value")]
    BadAssignTarget,

    /// `break` appeared outside any loop construct.
    #[error("\"break\" must be used inside a loop")]
    BreakOutsideLoop,

    /// `continue` appeared outside any loop construct.
    #[error("\"continue\" must be used inside a loop")]
    ContinueOutsideLoop,

    /// `return` appeared outside any function body.
    #[error("\"return\" must be used inside a function")]
    ReturnOutsideFunction,

    /// Both sides of a tuple destructuring are tuples of different length.
    #[error("incorrect number of values in tuple destructuring")]
    DestructureMismatch,

    /// The global symbol table is full.
    #[error("too many global variables, the limit is {limit}")]
    TooManyGlobals { limit: u32 },
}
