//! Bytecode model: opcodes, instructions, constant pools, and the compiled
//! unit handed to the VM.

mod opcode;
mod pool;

use std::fmt;

use nasal_core::Span;
use rustc_hash::FxHashMap;

pub use opcode::OpCode;
pub use pool::{NumberPool, StringPool};

/// One emitted instruction.
#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    /// The operation.
    pub op: OpCode,
    /// The 32-bit operand; zero when the opcode takes none.
    pub operand: u32,
    /// Where in the source this instruction came from.
    pub span: Span,
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:<14} {:#010x}", self.op.name(), self.operand)
    }
}

/// The output of code generation: everything the VM needs to run one
/// compiled program.
#[derive(Debug, Default)]
pub struct CodeUnit {
    /// The instruction stream.
    pub code: Vec<Instruction>,
    /// Number constants, indexed by `PushNum` operands.
    pub numbers: Vec<f64>,
    /// String constants, indexed by `PushStr` and the name-carrying ops.
    pub strings: Vec<String>,
    /// Native-function names in registry order, indexed by `CallNative`.
    pub natives: Vec<String>,
    /// Global symbol name to slot mapping.
    pub globals: FxHashMap<String, u32>,
    /// Every file that went into this unit, in import order.
    pub files: Vec<String>,
}

impl CodeUnit {
    /// Render a plain-text disassembly of the instruction stream.
    pub fn disassemble(&self) -> String {
        use std::fmt::Write;

        let mut out = String::new();
        for (offset, ins) in self.code.iter().enumerate() {
            let _ = writeln!(
                out,
                "{:#06x}: {}  ; {}:{}",
                offset, ins, ins.span.file, ins.span.begin_line
            );
        }
        out
    }
}
