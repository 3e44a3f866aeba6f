//! Code-generator integration tests over hand-built and linked trees.

mod common;

use std::fs;

use common::*;
use nasal::prelude::*;
use nasal::syntax::ast::{Block, BreakExpr, ContinueExpr, Expr};
use tempfile::TempDir;

fn compile(tree: &mut Block, repl: bool) -> (CodeUnit, Diagnostics) {
    let mut diags = Diagnostics::new();
    let linker = Linker::with_search_paths(Vec::new());
    let unit = CodeGen::new(&NoNatives, &mut diags, repl).compile(tree, &linker);
    (unit, diags)
}

fn ops(unit: &CodeUnit) -> Vec<OpCode> {
    unit.code.iter().map(|ins| ins.op).collect()
}

/// Whether `needle` appears as a contiguous run inside `haystack`.
fn has_run(haystack: &[OpCode], needle: &[OpCode]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

fn assert_jumps_in_range(unit: &CodeUnit) {
    for (offset, ins) in unit.code.iter().enumerate() {
        let is_jump = matches!(
            ins.op,
            OpCode::Jump
                | OpCode::JumpIfTrue
                | OpCode::JumpIfFalse
                | OpCode::ForEach
                | OpCode::ForIndex
        );
        if is_jump {
            assert!(
                (ins.operand as usize) < unit.code.len(),
                "instruction {offset} jumps to {} but the stream ends at {}",
                ins.operand,
                unit.code.len()
            );
        }
    }
}

#[test]
fn innermost_local_binding_wins_over_enclosing_scopes() {
    // var a = 1; var f = func(a) { var a = 2; a; };
    let mut tree = block(vec![
        def("a", num(1.0)),
        def(
            "f",
            func(&["a"], block(vec![def("a", num(2.0)), id("a")])),
        ),
    ]);
    let (unit, diags) = compile(&mut tree, false);
    assert!(!diags.has_fatal(), "{diags}");

    // Slot 0 is `me`, slot 1 the parameter, slot 2 the block-local `a`;
    // the load must resolve to the innermost binding.
    assert!(
        unit.code
            .iter()
            .any(|ins| ins.op == OpCode::GetLocal && ins.operand == 2),
        "no load of the innermost binding:\n{}",
        unit.disassemble()
    );
    assert!(!ops(&unit).contains(&OpCode::GetUpvalue));
    assert!(!ops(&unit).contains(&OpCode::GetGlobal));
}

#[test]
fn enclosing_function_variable_is_captured_by_slot() {
    // var outer = func() { var x = 1; var inner = func() { x; }; };
    let inner = func(&[], block(vec![id("x")]));
    let mut tree = block(vec![def(
        "outer",
        func(&[], block(vec![def("x", num(1.0)), def("inner", inner)])),
    )]);
    let (unit, diags) = compile(&mut tree, false);
    assert!(!diags.has_fatal(), "{diags}");

    // `x` sits in slot 1 of the frame one function up: (1 << 16) | 1.
    assert!(
        unit.code
            .iter()
            .any(|ins| ins.op == OpCode::GetUpvalue && ins.operand == ((1 << 16) | 1)),
        "no slot-encoded capture:\n{}",
        unit.disassemble()
    );
}

#[test]
fn return_inside_nested_foreach_releases_every_iterator() {
    // var f = func(v) { foreach (var i; v) foreach (var j; v) return 1; };
    let innermost = block(vec![ret(Some(num(1.0)))]);
    let inner_loop = foreach_var("j", id("v"), innermost);
    let outer_loop = foreach_var("i", id("v"), block(vec![inner_loop]));
    let mut tree = block(vec![def("f", func(&["v"], block(vec![outer_loop])))]);

    let (unit, diags) = compile(&mut tree, false);
    assert!(!diags.has_fatal(), "{diags}");

    let ops = ops(&unit);
    // The return releases both active iterators before leaving the frame.
    assert!(
        has_run(&ops, &[
            OpCode::IterEnd,
            OpCode::IterEnd,
            OpCode::PushNum,
            OpCode::Return,
        ]),
        "return does not unwind both iterators:\n{}",
        unit.disassemble()
    );
    // Two more releases close the loops themselves.
    let releases = ops.iter().filter(|op| **op == OpCode::IterEnd).count();
    assert_eq!(releases, 4);
}

#[test]
fn every_jump_site_is_patched_to_an_in_range_offset() {
    // Mix of constructs that all require per-construct patching.
    let loop_body = block(vec![
        Expr::Break(BreakExpr { span: sp() }),
        Expr::Continue(ContinueExpr { span: sp() }),
    ]);
    let mut tree = block(vec![
        def("v", vector(vec![num(1.0), num(2.0)])),
        while_loop(num(1.0), loop_body),
        foreach_var("i", id("v"), block(vec![id("i")])),
    ]);

    let (unit, diags) = compile(&mut tree, false);
    assert!(!diags.has_fatal(), "{diags}");
    assert_jumps_in_range(&unit);
}

#[test]
fn repl_mode_prints_top_level_expression_values() {
    let mut tree = block(vec![num(7.0)]);
    let (unit, diags) = compile(&mut tree, true);
    assert!(!diags.has_fatal(), "{diags}");
    assert!(has_run(&ops(&unit), &[
        OpCode::PushNum,
        OpCode::ReplOut,
        OpCode::Pop,
    ]));

    let mut tree = block(vec![num(7.0)]);
    let (unit, _) = compile(&mut tree, false);
    assert!(!ops(&unit).contains(&OpCode::ReplOut));
}

#[test]
fn break_outside_a_loop_is_rejected_without_stopping_compilation() {
    let mut tree = block(vec![
        Expr::Break(BreakExpr { span: sp() }),
        def("after", num(1.0)),
    ]);
    let (unit, diags) = compile(&mut tree, false);

    assert!(diags.has_fatal());
    assert!(
        diags
            .fatals()
            .any(|d| d.message.contains("\"break\" must be used inside a loop"))
    );
    // The rest of the file still compiled.
    assert!(unit.globals.contains_key("after"));
}

#[test]
fn continue_outside_a_loop_is_rejected() {
    let mut tree = block(vec![Expr::Continue(ContinueExpr { span: sp() })]);
    let (_, diags) = compile(&mut tree, false);
    assert!(
        diags
            .fatals()
            .any(|d| d.message.contains("\"continue\" must be used inside a loop"))
    );
}

#[test]
fn return_outside_a_function_is_rejected() {
    let mut tree = block(vec![ret(None)]);
    let (_, diags) = compile(&mut tree, false);
    assert!(
        diags
            .fatals()
            .any(|d| d.message.contains("\"return\" must be used inside a function"))
    );
}

#[test]
fn literals_share_pool_slots_across_function_boundaries() {
    let mut tree = block(vec![
        def("a", num(42.0)),
        def("f", func(&[], block(vec![ret(Some(num(42.0)))]))),
        def("s", str_lit("shared")),
        def("g", func(&[], block(vec![ret(Some(str_lit("shared")))]))),
    ]);
    let (unit, diags) = compile(&mut tree, false);

    assert!(!diags.has_fatal(), "{diags}");
    assert_eq!(unit.numbers, [42.0]);
    assert_eq!(unit.strings, ["shared"]);
}

#[test]
fn linked_tree_compiles_end_to_end() {
    let dir = TempDir::new().unwrap();
    let lib = dir.path().join("lib.nas");
    let b = dir.path().join("b.nas");
    fs::write(&lib, "").unwrap();
    fs::write(&b, "").unwrap();
    let lib = lib.to_string_lossy().into_owned();
    let b = b.to_string_lossy().into_owned();

    let mut parser = ScriptedParser::new();
    parser.provide(&lib, block(vec![def("baselib", num(0.0))]));
    parser.provide(&b, block(vec![def("y", num(2.0))]));
    parser.swap(block(vec![import_call(&b), def("x", num(1.0))]));

    let mut linker = Linker::with_search_paths(vec![dir.path().to_path_buf()]);
    let mut diags = Diagnostics::new();
    linker.link(&mut parser, "a.nas", false, &mut diags);
    assert!(!diags.has_fatal(), "{diags}");

    let mut linked = parser.swap(Block::default());
    let unit = CodeGen::new(&NoNatives, &mut diags, false).compile(&mut linked, &linker);
    assert!(!diags.has_fatal(), "{diags}");

    // The module wrapper, the entry's own binding, and the library binding
    // all landed in the global slot space.
    assert!(unit.globals.contains_key("baselib"));
    assert!(unit.globals.contains_key("b"));
    assert!(unit.globals.contains_key("x"));
    assert_eq!(
        unit.code.first().map(|ins| ins.operand),
        Some(unit.globals.len() as u32)
    );
    assert_jumps_in_range(&unit);
    assert_eq!(unit.files, vec!["a.nas".to_string(), lib, b]);
}
