//! Middle end of the nasal toolchain: module linker and bytecode
//! generator.
//!
//! ## Pipeline
//!
//! ```text
//! source text -> [external lexer/parser] -> raw tree
//!             -> Linker (splices library + imports, in place)
//!             -> CodeGen (one pass, jump-patched bytecode)
//!             -> CodeUnit -> [external VM]
//! ```
//!
//! Every phase appends to one shared [`nasal_core::Diagnostics`] channel
//! and keeps going on fatal conditions; the driver must check the channel
//! at each phase boundary and stop before running a phase over a broken
//! tree.
//!
//! ## Modules
//!
//! - [`bytecode`]: opcodes, instructions, constant pools, [`CodeUnit`]
//! - [`link`]: the module linker session
//! - [`codegen`]: the single-pass code generator
//! - [`native`]: the native-function registry seam

pub mod bytecode;
pub mod codegen;
pub mod link;
pub mod native;

pub use bytecode::{CodeUnit, Instruction, NumberPool, OpCode, StringPool};
pub use codegen::{CodeGen, GLOBAL_LIMIT};
pub use link::{LIBRARY_FILE, Linker, REQUIRED_EXTENSION};
pub use native::{NativeFunction, NativeRegistry, NoNatives};
