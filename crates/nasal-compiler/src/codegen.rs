//! The code generator.
//!
//! Walks the linked tree exactly once in tree order, resolving every
//! identifier to a local slot, an upvalue, or a global slot, folding
//! constant operators, and emitting the instruction stream with all jumps
//! patched per construct as each construct closes. There is no second pass
//! over the program.
//!
//! The generator never aborts on a bad construct: it records a fatal
//! diagnostic and keeps walking so one compilation reports as much as
//! possible. Callers must check the channel before using the [`CodeUnit`].

use nasal_core::{CodegenError, Diagnostics, Phase, Span};
use nasal_syntax::ast::{
    AssignExpr, AssignOp, BinaryExpr, BinaryOp, Block, CallExpr, CallIndex, CallInvoke,
    CallPart, CondExpr, DefTarget, DefinitionExpr, Expr, FoldedConst, ForExpr, ForeiExpr,
    ForeiKind, FunctionExpr, IterBinding, IterExpr, MultiAssignExpr, ParamKind, ReturnExpr,
    TernaryExpr, UnaryExpr, UnaryOp, WhileExpr,
};
use nasal_syntax::symbol_finder::find_symbols;
use rustc_hash::FxHashMap;

use crate::bytecode::{CodeUnit, Instruction, NumberPool, OpCode, StringPool};
use crate::link::Linker;
use crate::native::NativeRegistry;

/// Capacity of the global slot space. Exceeding it is a fatal compile
/// error; the VM reserves one stack cell beyond this for bookkeeping.
pub const GLOBAL_LIMIT: u32 = 4095;

/// Per-function compilation state: one map per nested block scope, plus
/// the next free slot. Slots are never reused within a function; the final
/// `next_slot` is the frame size patched into the `Locals` instruction.
#[derive(Debug, Default)]
struct Frame {
    scopes: Vec<FxHashMap<String, u32>>,
    next_slot: u32,
}

/// Single-pass bytecode generator.
pub struct CodeGen<'d> {
    diags: &'d mut Diagnostics,
    repl_output: bool,

    natives: Vec<String>,
    native_index: FxHashMap<String, u32>,

    code: Vec<Instruction>,
    numbers: NumberPool,
    strings: StringPool,

    globals: FxHashMap<String, u32>,
    frames: Vec<Frame>,

    /// Pending jump sites per open loop, innermost last.
    break_sites: Vec<Vec<usize>>,
    continue_sites: Vec<Vec<usize>>,
    /// Active foreach/forindex nesting, one counter per function level.
    foreach_depth: Vec<u32>,
}

impl<'d> CodeGen<'d> {
    /// Create a generator. `repl_output` makes top-level expression
    /// statements print their value before it is popped.
    pub fn new(
        registry: &dyn NativeRegistry,
        diags: &'d mut Diagnostics,
        repl_output: bool,
    ) -> Self {
        let mut natives = Vec::new();
        let mut native_index = FxHashMap::default();
        for (idx, function) in registry.functions().iter().enumerate() {
            native_index.insert(function.name.to_string(), idx as u32);
            natives.push(function.name.to_string());
        }
        Self {
            diags,
            repl_output,
            natives,
            native_index,
            code: Vec::new(),
            numbers: NumberPool::new(),
            strings: StringPool::new(),
            globals: FxHashMap::default(),
            frames: Vec::new(),
            break_sites: Vec::new(),
            continue_sites: Vec::new(),
            foreach_depth: vec![0],
        }
    }

    /// Compile a linked tree into a [`CodeUnit`]. Diagnostics land on the
    /// shared channel; a unit produced alongside fatal diagnostics must
    /// not be executed.
    pub fn compile(mut self, tree: &mut Block, linker: &Linker) -> CodeUnit {
        let span = tree.span.clone();
        let globals_site = self.emit(OpCode::Globals, 0, &span);
        self.block_gen(tree);
        let global_count = self.globals.len() as u32;
        self.code[globals_site].operand = global_count;
        self.emit(OpCode::Exit, 0, &span);

        CodeUnit {
            code: self.code,
            numbers: self.numbers.into_values(),
            strings: self.strings.into_values(),
            natives: self.natives,
            globals: self.globals,
            files: linker.files().to_vec(),
        }
    }

    // ==========================================================================
    // Emission
    // ==========================================================================

    fn emit(&mut self, op: OpCode, operand: u32, span: &Span) -> usize {
        self.code.push(Instruction {
            op,
            operand,
            span: span.clone(),
        });
        self.code.len() - 1
    }

    /// Offset of the next instruction to be emitted.
    fn here(&self) -> u32 {
        self.code.len() as u32
    }

    /// Patch a recorded jump site to target the current offset.
    fn patch(&mut self, site: usize) {
        self.code[site].operand = self.here();
    }

    fn die(&mut self, span: &Span, err: CodegenError) {
        self.diags.fatal(Phase::Code, Some(span.clone()), err);
    }

    fn emit_const(&mut self, folded: FoldedConst, span: &Span) {
        match folded {
            FoldedConst::Num(value) => {
                let idx = self.numbers.intern(value);
                self.emit(OpCode::PushNum, idx, span);
            }
            FoldedConst::Str(value) => {
                let idx = self.strings.intern(&value);
                self.emit(OpCode::PushStr, idx, span);
            }
        }
    }

    // ==========================================================================
    // Symbol tables
    // ==========================================================================

    fn in_function(&self) -> bool {
        !self.frames.is_empty()
    }

    /// Resolve a name in the current function, innermost block first.
    fn local_find(&self, name: &str) -> Option<u32> {
        let frame = self.frames.last()?;
        frame
            .scopes
            .iter()
            .rev()
            .find_map(|scope| scope.get(name).copied())
    }

    /// Resolve a name in enclosing function frames. The returned operand
    /// encodes `(frame_distance << 16) | slot`; the capture is by slot,
    /// fixed here at closure-creation time, never by name at run time.
    fn upvalue_find(&self, name: &str) -> Option<u32> {
        for (distance, frame) in self.frames.iter().rev().skip(1).enumerate() {
            let found = frame
                .scopes
                .iter()
                .rev()
                .find_map(|scope| scope.get(name).copied());
            if let Some(slot) = found {
                return Some(((distance as u32 + 1) << 16) | slot);
            }
        }
        None
    }

    /// Bind `name` in the innermost scope: the current block when inside a
    /// function, the global table otherwise. Idempotent per scope; global
    /// slots are created on first use up to [`GLOBAL_LIMIT`].
    fn add_symbol(&mut self, name: &str, span: &Span) {
        if self.native_index.contains_key(name) {
            self.die(span, CodegenError::NativeConflict { name: name.into() });
            return;
        }
        if let Some(frame) = self.frames.last_mut() {
            if let Some(scope) = frame.scopes.last_mut() {
                if !scope.contains_key(name) {
                    scope.insert(name.to_string(), frame.next_slot);
                    frame.next_slot += 1;
                }
            }
        } else {
            if self.globals.contains_key(name) {
                return;
            }
            if self.globals.len() as u32 >= GLOBAL_LIMIT {
                self.die(span, CodegenError::TooManyGlobals {
                    limit: GLOBAL_LIMIT,
                });
                return;
            }
            let slot = self.globals.len() as u32;
            self.globals.insert(name.to_string(), slot);
        }
    }

    /// Pop the value on top of the stack into the slot bound for `name`.
    /// A name whose binding failed was already reported; emit nothing.
    fn store_symbol(&mut self, name: &str, span: &Span) {
        if let Some(slot) = self.local_find(name) {
            self.emit(OpCode::SetLocal, slot, span);
        } else if let Some(&slot) = self.globals.get(name) {
            self.emit(OpCode::SetGlobal, slot, span);
        }
    }

    /// Push the value bound to `name`. Resolution order: native table,
    /// then locals innermost-out, then enclosing frames as upvalues, then
    /// globals.
    fn load_id(&mut self, name: &str, span: &Span) {
        if let Some(&idx) = self.native_index.get(name) {
            if !self.in_function() {
                self.die(span, CodegenError::NativeOutsideFunction { name: name.into() });
                return;
            }
            self.emit(OpCode::CallNative, idx, span);
            return;
        }
        if let Some(slot) = self.local_find(name) {
            self.emit(OpCode::GetLocal, slot, span);
        } else if let Some(encoded) = self.upvalue_find(name) {
            self.emit(OpCode::GetUpvalue, encoded, span);
        } else if let Some(&slot) = self.globals.get(name) {
            self.emit(OpCode::GetGlobal, slot, span);
        } else {
            self.die(span, CodegenError::UndefinedSymbol { name: name.into() });
        }
    }

    // ==========================================================================
    // Statements
    // ==========================================================================

    /// Generate one block: open a scope (inside a function), pre-register
    /// its top-level names so sibling definitions see each other, generate
    /// each statement, close the scope.
    fn block_gen(&mut self, block: &mut Block) {
        let scoped = self.in_function();
        if scoped {
            if let Some(frame) = self.frames.last_mut() {
                frame.scopes.push(FxHashMap::default());
            }
        }
        for symbol in find_symbols(block) {
            self.add_symbol(&symbol.name, &symbol.span);
        }
        for stmt in &mut block.stmts {
            self.stmt_gen(stmt);
        }
        if scoped {
            if let Some(frame) = self.frames.last_mut() {
                frame.scopes.pop();
            }
        }
    }

    fn stmt_gen(&mut self, stmt: &mut Expr) {
        match stmt {
            Expr::Null(_) => {}
            Expr::Block(block) => self.block_gen(block),
            Expr::Def(def) => self.def_gen(def),
            Expr::Assign(assign) => self.assign_gen(assign, false),
            Expr::MultiAssign(multi) => self.multi_assign_gen(multi),
            Expr::Cond(cond) => self.cond_gen(cond),
            Expr::While(while_loop) => self.while_gen(while_loop),
            Expr::For(for_loop) => self.for_gen(for_loop),
            Expr::Forei(forei) => self.forei_gen(forei),
            Expr::Continue(node) => {
                let span = node.span.clone();
                self.continue_gen(&span);
            }
            Expr::Break(node) => {
                let span = node.span.clone();
                self.break_gen(&span);
            }
            Expr::Return(ret) => self.return_gen(ret),
            _ => {
                let span = stmt.span().clone();
                self.calc(stmt);
                if self.repl_output && !self.in_function() {
                    self.emit(OpCode::ReplOut, 0, &span);
                }
                self.emit(OpCode::Pop, 0, &span);
            }
        }
    }

    /// A for-loop clause: like a statement, but never REPL-printed.
    fn clause_gen(&mut self, clause: &mut Expr) {
        match clause {
            Expr::Null(_) => {}
            Expr::Def(def) => self.def_gen(def),
            Expr::Assign(assign) => self.assign_gen(assign, false),
            Expr::MultiAssign(multi) => self.multi_assign_gen(multi),
            _ => {
                let span = clause.span().clone();
                self.calc(clause);
                self.emit(OpCode::Pop, 0, &span);
            }
        }
    }

    fn def_gen(&mut self, def: &mut DefinitionExpr) {
        match &mut def.target {
            DefTarget::Single(id) => {
                let name = id.name.clone();
                let span = id.span.clone();
                self.add_symbol(&name, &span);
                self.calc(&mut def.value);
                self.store_symbol(&name, &span);
            }
            DefTarget::Multi(multi) => {
                let names: Vec<(String, Span)> = multi
                    .names
                    .iter()
                    .map(|id| (id.name.clone(), id.span.clone()))
                    .collect();
                for (name, span) in &names {
                    self.add_symbol(name, span);
                }
                if let Expr::Tuple(tuple) = def.value.as_mut() {
                    if tuple.elements.len() != names.len() {
                        let span = def.span.clone();
                        self.die(&span, CodegenError::DestructureMismatch);
                        return;
                    }
                    for element in &mut tuple.elements {
                        self.calc(element);
                    }
                    for (name, span) in names.iter().rev() {
                        self.store_symbol(name, span);
                    }
                } else {
                    self.calc(&mut def.value);
                    for (index, (name, span)) in names.iter().enumerate() {
                        self.emit(OpCode::GetElem, index as u32, span);
                        self.store_symbol(name, span);
                    }
                    let span = def.span.clone();
                    self.emit(OpCode::Pop, 0, &span);
                }
            }
        }
    }

    fn assign_gen(&mut self, assign: &mut AssignExpr, keep_value: bool) {
        self.calc(&mut assign.right);
        self.mem_gen(&mut assign.left);
        let op = match assign.op {
            AssignOp::Assign => OpCode::Store,
            AssignOp::AddAssign => OpCode::AddStore,
            AssignOp::SubAssign => OpCode::SubStore,
            AssignOp::MulAssign => OpCode::MulStore,
            AssignOp::DivAssign => OpCode::DivStore,
            AssignOp::ConcatAssign => OpCode::ConcatStore,
            AssignOp::BitwiseAndAssign => OpCode::BitAndStore,
            AssignOp::BitwiseOrAssign => OpCode::BitOrStore,
            AssignOp::BitwiseXorAssign => OpCode::BitXorStore,
        };
        let span = assign.span.clone();
        self.emit(op, if keep_value { 0 } else { 1 }, &span);
    }

    fn multi_assign_gen(&mut self, multi: &mut MultiAssignExpr) {
        let span = multi.span.clone();
        if let Expr::Tuple(tuple) = multi.value.as_mut() {
            if tuple.elements.len() != multi.targets.elements.len() {
                self.die(&span, CodegenError::DestructureMismatch);
                return;
            }
            for element in &mut tuple.elements {
                self.calc(element);
            }
            for target in multi.targets.elements.iter_mut().rev() {
                let tspan = target.span().clone();
                self.mem_gen(target);
                self.emit(OpCode::Store, 1, &tspan);
            }
        } else {
            self.calc(&mut multi.value);
            for (index, target) in multi.targets.elements.iter_mut().enumerate() {
                let tspan = target.span().clone();
                self.emit(OpCode::GetElem, index as u32, &tspan);
                self.mem_gen(target);
                self.emit(OpCode::Store, 1, &tspan);
            }
            self.emit(OpCode::Pop, 0, &span);
        }
    }

    // ==========================================================================
    // Assignment targets
    // ==========================================================================

    /// Push a mutable reference to the place named by `target`.
    fn mem_gen(&mut self, target: &mut Expr) {
        match target {
            Expr::Id(id) => {
                let name = id.name.clone();
                let span = id.span.clone();
                self.mem_id(&name, &span);
            }
            Expr::Call(call) => self.mem_call(call),
            _ => {
                let span = target.span().clone();
                self.die(&span, CodegenError::BadAssignTarget);
            }
        }
    }

    fn mem_id(&mut self, name: &str, span: &Span) {
        if self.native_index.contains_key(name) {
            self.die(span, CodegenError::NativeConflict { name: name.into() });
            return;
        }
        if let Some(slot) = self.local_find(name) {
            self.emit(OpCode::MemLocal, slot, span);
        } else if let Some(encoded) = self.upvalue_find(name) {
            self.emit(OpCode::MemUpvalue, encoded, span);
        } else if let Some(&slot) = self.globals.get(name) {
            self.emit(OpCode::MemGlobal, slot, span);
        } else {
            self.die(span, CodegenError::UndefinedSymbol { name: name.into() });
        }
    }

    fn mem_call(&mut self, call: &mut CallExpr) {
        if call.calls.is_empty() {
            self.mem_gen(&mut call.first);
            return;
        }
        let last = call.calls.len() - 1;
        self.calc(&mut call.first);
        for part in &mut call.calls[..last] {
            self.call_part_gen(part);
        }
        match &mut call.calls[last] {
            CallPart::Field(field) => {
                let idx = self.strings.intern(&field.field);
                let span = field.span.clone();
                self.emit(OpCode::MemField, idx, &span);
            }
            CallPart::Index(index) => {
                if index.slices.len() == 1 && index.slices[0].end.is_none() {
                    self.calc(&mut index.slices[0].begin);
                    let span = index.span.clone();
                    self.emit(OpCode::MemIndex, 0, &span);
                } else {
                    let span = index.span.clone();
                    self.die(&span, CodegenError::BadAssignTarget);
                }
            }
            CallPart::Invoke(invoke) => {
                let span = invoke.span.clone();
                self.die(&span, CodegenError::BadAssignTarget);
            }
        }
    }

    // ==========================================================================
    // Expressions
    // ==========================================================================

    /// Generate code leaving exactly one value on the stack.
    fn calc(&mut self, expr: &mut Expr) {
        match expr {
            Expr::Null(node) => {
                let span = node.span.clone();
                self.emit(OpCode::PushNil, 0, &span);
            }
            Expr::Nil(node) => {
                let span = node.span.clone();
                self.emit(OpCode::PushNil, 0, &span);
            }
            Expr::Num(node) => {
                let idx = self.numbers.intern(node.value);
                let span = node.span.clone();
                self.emit(OpCode::PushNum, idx, &span);
            }
            Expr::Str(node) => {
                let idx = self.strings.intern(&node.value);
                let span = node.span.clone();
                self.emit(OpCode::PushStr, idx, &span);
            }
            Expr::Bool(node) => {
                let idx = self.numbers.intern(if node.value { 1.0 } else { 0.0 });
                let span = node.span.clone();
                self.emit(OpCode::PushNum, idx, &span);
            }
            Expr::Id(node) => {
                let name = node.name.clone();
                let span = node.span.clone();
                self.load_id(&name, &span);
            }
            Expr::Vector(node) => {
                let count = node.elements.len() as u32;
                for element in &mut node.elements {
                    self.calc(element);
                }
                let span = node.span.clone();
                self.emit(OpCode::NewVec, count, &span);
            }
            Expr::Tuple(node) => {
                // A tuple outside a destructuring context builds a vector.
                let count = node.elements.len() as u32;
                for element in &mut node.elements {
                    self.calc(element);
                }
                let span = node.span.clone();
                self.emit(OpCode::NewVec, count, &span);
            }
            Expr::Hash(node) => {
                let span = node.span.clone();
                self.emit(OpCode::NewHash, 0, &span);
                for member in &mut node.members {
                    self.calc(&mut member.value);
                    let idx = self.strings.intern(&member.name);
                    let mspan = member.span.clone();
                    self.emit(OpCode::HashAppend, idx, &mspan);
                }
            }
            Expr::Func(func) => self.func_gen(func),
            Expr::Call(call) => self.call_gen(call),
            Expr::Ternary(ternary) => self.ternary_gen(ternary),
            Expr::Binary(binary) => self.binary_gen(binary),
            Expr::Unary(unary) => self.unary_gen(unary),
            Expr::Assign(assign) => self.assign_gen(assign, true),
            // Statement-only constructs in value position run for their
            // effect and yield nil.
            Expr::Def(_)
            | Expr::MultiAssign(_)
            | Expr::Cond(_)
            | Expr::While(_)
            | Expr::For(_)
            | Expr::Forei(_)
            | Expr::Continue(_)
            | Expr::Break(_)
            | Expr::Return(_)
            | Expr::Block(_) => {
                let span = expr.span().clone();
                self.stmt_gen(expr);
                self.emit(OpCode::PushNil, 0, &span);
            }
        }
    }

    fn call_gen(&mut self, call: &mut CallExpr) {
        self.calc(&mut call.first);
        for part in &mut call.calls {
            self.call_part_gen(part);
        }
    }

    fn call_part_gen(&mut self, part: &mut CallPart) {
        match part {
            CallPart::Field(field) => {
                let idx = self.strings.intern(&field.field);
                let span = field.span.clone();
                self.emit(OpCode::GetField, idx, &span);
            }
            CallPart::Index(index) => self.index_gen(index),
            CallPart::Invoke(invoke) => self.invoke_gen(invoke),
        }
    }

    fn index_gen(&mut self, index: &mut CallIndex) {
        let span = index.span.clone();
        if index.slices.len() == 1 && index.slices[0].end.is_none() {
            self.calc(&mut index.slices[0].begin);
            self.emit(OpCode::GetIndex, 0, &span);
            return;
        }
        self.emit(OpCode::SliceBegin, 0, &span);
        for slice in &mut index.slices {
            let sspan = slice.span.clone();
            self.calc(&mut slice.begin);
            match &mut slice.end {
                Some(end) => {
                    self.calc(end);
                    self.emit(OpCode::Slice2, 0, &sspan);
                }
                None => {
                    self.emit(OpCode::Slice, 0, &sspan);
                }
            }
        }
        self.emit(OpCode::SliceEnd, 0, &span);
    }

    fn invoke_gen(&mut self, invoke: &mut CallInvoke) {
        let span = invoke.span.clone();
        if invoke.args.len() == 1 && matches!(invoke.args[0], Expr::Hash(_)) {
            self.calc(&mut invoke.args[0]);
            self.emit(OpCode::CallFuncHash, 0, &span);
            return;
        }
        let argc = invoke.args.len() as u32;
        for arg in &mut invoke.args {
            self.calc(arg);
        }
        self.emit(OpCode::CallFunc, argc, &span);
    }

    fn ternary_gen(&mut self, ternary: &mut TernaryExpr) {
        let span = ternary.span.clone();
        self.calc(&mut ternary.condition);
        let skip_left = self.emit(OpCode::JumpIfFalse, 0, &span);
        self.calc(&mut ternary.left);
        let exit = self.emit(OpCode::Jump, 0, &span);
        self.patch(skip_left);
        self.calc(&mut ternary.right);
        self.patch(exit);
    }

    fn binary_gen(&mut self, binary: &mut BinaryExpr) {
        if let Some(folded) = const_eval_binary(binary) {
            let span = binary.span.clone();
            self.emit_const(folded, &span);
            return;
        }
        match binary.op {
            BinaryOp::And => self.and_gen(binary),
            BinaryOp::Or => self.or_gen(binary),
            _ => {
                self.calc(&mut binary.left);
                self.calc(&mut binary.right);
                let span = binary.span.clone();
                self.emit(binary_opcode(binary.op), 0, &span);
            }
        }
    }

    /// Short-circuit `and`: keep the left value when falsy, otherwise
    /// evaluate to the right value.
    fn and_gen(&mut self, binary: &mut BinaryExpr) {
        let span = binary.span.clone();
        self.calc(&mut binary.left);
        self.emit(OpCode::Dup, 0, &span);
        let exit = self.emit(OpCode::JumpIfFalse, 0, &span);
        self.emit(OpCode::Pop, 0, &span);
        self.calc(&mut binary.right);
        self.patch(exit);
    }

    /// Short-circuit `or`: keep the left value when truthy.
    fn or_gen(&mut self, binary: &mut BinaryExpr) {
        let span = binary.span.clone();
        self.calc(&mut binary.left);
        self.emit(OpCode::Dup, 0, &span);
        let exit = self.emit(OpCode::JumpIfTrue, 0, &span);
        self.emit(OpCode::Pop, 0, &span);
        self.calc(&mut binary.right);
        self.patch(exit);
    }

    fn unary_gen(&mut self, unary: &mut UnaryExpr) {
        if let Some(folded) = const_eval_unary(unary) {
            let span = unary.span.clone();
            self.emit_const(folded, &span);
            return;
        }
        self.calc(&mut unary.operand);
        let op = match unary.op {
            UnaryOp::Negate => OpCode::Negate,
            UnaryOp::Not => OpCode::Not,
            UnaryOp::BitwiseNot => OpCode::BitNot,
        };
        let span = unary.span.clone();
        self.emit(op, 0, &span);
    }

    // ==========================================================================
    // Functions
    // ==========================================================================

    fn func_gen(&mut self, func: &mut FunctionExpr) {
        let span = func.span.clone();
        let newf_site = self.emit(OpCode::NewFunc, 0, &span);
        let locals_site = self.emit(OpCode::Locals, 0, &span);

        // Slot 0 is the implicit `me` binding of every frame.
        let mut scope = FxHashMap::default();
        scope.insert("me".to_string(), 0);
        self.frames.push(Frame {
            scopes: vec![scope],
            next_slot: 1,
        });
        self.foreach_depth.push(0);

        for param in &mut func.params {
            let pspan = param.span.clone();
            let idx = self.strings.intern(&param.name);
            match &mut param.kind {
                ParamKind::Normal => {
                    self.emit(OpCode::Param, idx, &pspan);
                }
                ParamKind::Default(default) => {
                    self.calc(default);
                    self.emit(OpCode::DefParam, idx, &pspan);
                }
                ParamKind::Dynamic => {
                    self.emit(OpCode::DynParam, idx, &pspan);
                }
            }
            let name = param.name.clone();
            self.add_symbol(&name, &pspan);
        }

        // The body entry sits right after the jump that skips it at
        // function-creation time.
        let entry = self.here() + 1;
        self.code[newf_site].operand = entry;
        let skip_body = self.emit(OpCode::Jump, 0, &span);

        self.block_gen(&mut func.body);

        if !matches!(func.body.stmts.last(), Some(Expr::Return(_))) {
            self.emit(OpCode::PushNil, 0, &span);
            self.emit(OpCode::Return, 0, &span);
        }

        let frame_size = self.frames.last().map(|f| f.next_slot).unwrap_or(1);
        self.code[locals_site].operand = frame_size;
        self.patch(skip_body);
        self.frames.pop();
        self.foreach_depth.pop();
    }

    fn return_gen(&mut self, ret: &mut ReturnExpr) {
        let span = ret.span.clone();
        if !self.in_function() {
            self.die(&span, CodegenError::ReturnOutsideFunction);
            return;
        }
        // Unwind every foreach/forindex iterator active at this lexical
        // position before leaving the frame.
        let depth = self.foreach_depth.last().copied().unwrap_or(0);
        for _ in 0..depth {
            self.emit(OpCode::IterEnd, 0, &span);
        }
        match &mut ret.value {
            Some(value) => self.calc(value),
            None => {
                self.emit(OpCode::PushNil, 0, &span);
            }
        }
        self.emit(OpCode::Return, 0, &span);
    }

    // ==========================================================================
    // Control flow
    // ==========================================================================

    fn cond_gen(&mut self, cond: &mut CondExpr) {
        let mut exits = Vec::new();
        let arm_count = cond.arms.len();
        for (index, arm) in cond.arms.iter_mut().enumerate() {
            let span = arm.span.clone();
            self.calc(&mut arm.condition);
            let skip_arm = self.emit(OpCode::JumpIfFalse, 0, &span);
            self.block_gen(&mut arm.body);
            let is_last = index + 1 == arm_count && cond.else_block.is_none();
            if !is_last {
                exits.push(self.emit(OpCode::Jump, 0, &span));
            }
            self.patch(skip_arm);
        }
        if let Some(else_block) = &mut cond.else_block {
            self.block_gen(else_block);
        }
        for site in exits {
            self.patch(site);
        }
    }

    fn enter_loop(&mut self) {
        self.break_sites.push(Vec::new());
        self.continue_sites.push(Vec::new());
    }

    /// Close the innermost loop: point every recorded break/continue site
    /// at its target and pop the lists.
    fn exit_loop(&mut self, continue_target: u32, break_target: u32) {
        if let Some(sites) = self.break_sites.pop() {
            for site in sites {
                self.code[site].operand = break_target;
            }
        }
        if let Some(sites) = self.continue_sites.pop() {
            for site in sites {
                self.code[site].operand = continue_target;
            }
        }
    }

    fn while_gen(&mut self, while_loop: &mut WhileExpr) {
        let span = while_loop.span.clone();
        let start = self.here();
        self.calc(&mut while_loop.condition);
        let exit_jump = self.emit(OpCode::JumpIfFalse, 0, &span);
        self.enter_loop();
        self.block_gen(&mut while_loop.body);
        self.emit(OpCode::Jump, start, &span);
        self.patch(exit_jump);
        let exit = self.here();
        self.exit_loop(start, exit);
    }

    fn for_gen(&mut self, for_loop: &mut ForExpr) {
        let span = for_loop.span.clone();
        self.clause_gen(&mut for_loop.initial);
        let start = self.here();
        let exit_jump = if matches!(for_loop.condition.as_ref(), Expr::Null(_)) {
            None
        } else {
            self.calc(&mut for_loop.condition);
            Some(self.emit(OpCode::JumpIfFalse, 0, &span))
        };
        self.enter_loop();
        self.block_gen(&mut for_loop.body);
        // continue re-enters at the step clause, not the condition.
        let continue_target = self.here();
        self.clause_gen(&mut for_loop.step);
        self.emit(OpCode::Jump, start, &span);
        if let Some(site) = exit_jump {
            self.patch(site);
        }
        let exit = self.here();
        self.exit_loop(continue_target, exit);
    }

    fn forei_gen(&mut self, forei: &mut ForeiExpr) {
        let span = forei.span.clone();
        self.calc(&mut forei.vector);
        self.emit(OpCode::IterBegin, 0, &span);
        let start = self.here();
        let advance_op = match forei.kind {
            ForeiKind::ForEach => OpCode::ForEach,
            ForeiKind::ForIndex => OpCode::ForIndex,
        };
        let advance = self.emit(advance_op, 0, &span);
        self.iter_bind(&mut forei.iterator);

        self.enter_loop();
        if let Some(depth) = self.foreach_depth.last_mut() {
            *depth += 1;
        }
        self.block_gen(&mut forei.body);
        self.emit(OpCode::Jump, start, &span);

        let exit = self.here();
        self.code[advance].operand = exit;
        if let Some(depth) = self.foreach_depth.last_mut() {
            *depth -= 1;
        }
        self.exit_loop(start, exit);
        self.emit(OpCode::IterEnd, 0, &span);
    }

    /// Store the element/index pushed by the advance instruction into the
    /// loop's iterator binding.
    fn iter_bind(&mut self, iter: &mut IterExpr) {
        let span = iter.span.clone();
        match &mut iter.binding {
            IterBinding::Define(id) => {
                let name = id.name.clone();
                let ispan = id.span.clone();
                self.add_symbol(&name, &ispan);
                self.store_symbol(&name, &ispan);
            }
            IterBinding::Existing(place) => {
                self.mem_call(place);
                self.emit(OpCode::Store, 1, &span);
            }
        }
    }

    fn break_gen(&mut self, span: &Span) {
        if self.break_sites.is_empty() {
            self.die(span, CodegenError::BreakOutsideLoop);
            return;
        }
        let site = self.emit(OpCode::Jump, 0, span);
        if let Some(sites) = self.break_sites.last_mut() {
            sites.push(site);
        }
    }

    fn continue_gen(&mut self, span: &Span) {
        if self.continue_sites.is_empty() {
            self.die(span, CodegenError::ContinueOutsideLoop);
            return;
        }
        let site = self.emit(OpCode::Jump, 0, span);
        if let Some(sites) = self.continue_sites.last_mut() {
            sites.push(site);
        }
    }
}

// ==========================================================================
// Constant folding
// ==========================================================================

/// Evaluate `expr` to a compile-time constant if possible, caching the
/// result on every operator node along the way.
fn const_eval(expr: &mut Expr) -> Option<FoldedConst> {
    match expr {
        Expr::Num(node) => Some(FoldedConst::Num(node.value)),
        Expr::Str(node) => Some(FoldedConst::Str(node.value.clone())),
        Expr::Binary(binary) => const_eval_binary(binary),
        Expr::Unary(unary) => const_eval_unary(unary),
        _ => None,
    }
}

fn const_eval_binary(binary: &mut BinaryExpr) -> Option<FoldedConst> {
    if binary.folded.is_none() {
        let left = const_eval(&mut binary.left)?;
        let right = const_eval(&mut binary.right)?;
        binary.folded = fold_binary_op(binary.op, &left, &right);
    }
    binary.folded.clone()
}

fn const_eval_unary(unary: &mut UnaryExpr) -> Option<FoldedConst> {
    if unary.folded.is_none() {
        let operand = const_eval(&mut unary.operand)?;
        unary.folded = fold_unary_op(unary.op, &operand);
    }
    unary.folded.clone()
}

fn fold_binary_op(
    op: BinaryOp,
    left: &FoldedConst,
    right: &FoldedConst,
) -> Option<FoldedConst> {
    use FoldedConst::{Num, Str};
    match (op, left, right) {
        (BinaryOp::Add, Num(a), Num(b)) => Some(Num(a + b)),
        (BinaryOp::Sub, Num(a), Num(b)) => Some(Num(a - b)),
        (BinaryOp::Mul, Num(a), Num(b)) => Some(Num(a * b)),
        // IEEE semantics on purpose: the VM divides f64s the same way.
        (BinaryOp::Div, Num(a), Num(b)) => Some(Num(a / b)),
        (BinaryOp::Concat, Str(a), Str(b)) => Some(Str(format!("{a}{b}"))),
        _ => None,
    }
}

fn fold_unary_op(op: UnaryOp, operand: &FoldedConst) -> Option<FoldedConst> {
    let FoldedConst::Num(value) = operand else {
        return None;
    };
    match op {
        UnaryOp::Negate => Some(FoldedConst::Num(-value)),
        UnaryOp::Not => Some(FoldedConst::Num(if *value == 0.0 { 1.0 } else { 0.0 })),
        UnaryOp::BitwiseNot => Some(FoldedConst::Num(!(*value as i64 as i32) as f64)),
    }
}

fn binary_opcode(op: BinaryOp) -> OpCode {
    match op {
        BinaryOp::Add => OpCode::Add,
        BinaryOp::Sub => OpCode::Sub,
        BinaryOp::Mul => OpCode::Mul,
        BinaryOp::Div => OpCode::Div,
        BinaryOp::Concat => OpCode::Concat,
        BinaryOp::Equal => OpCode::Equal,
        BinaryOp::NotEqual => OpCode::NotEqual,
        BinaryOp::Less => OpCode::Less,
        BinaryOp::LessEqual => OpCode::LessEqual,
        BinaryOp::Greater => OpCode::Greater,
        BinaryOp::GreaterEqual => OpCode::GreaterEqual,
        BinaryOp::BitwiseOr => OpCode::BitOr,
        BinaryOp::BitwiseXor => OpCode::BitXor,
        BinaryOp::BitwiseAnd => OpCode::BitAnd,
        // Short-circuit forms lower to control flow, never to one opcode.
        BinaryOp::And | BinaryOp::Or => OpCode::Pop,
    }
}
