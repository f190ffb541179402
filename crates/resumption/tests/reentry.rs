/// Tests for re-entering scoped resources when resuming.
///
/// Covers the three re-entry strategies on every era and the redirection of the
/// root's exception regions to the synthesized guards.
use std::rc::Rc;

use pretty_assertions::assert_eq;
use resumption::{
    CodeUnit, CodeUnitBuilder, Constant, ContinuationCache, Era, ExceptionTableEntry, Opcode, Operand, ReenterWith,
    ResumeError, ResumeKey,
};

/// `def g(cm, x): with cm(): x; y = x; return y` on a structural era.
fn with_block(era: Era) -> Rc<CodeUnit> {
    let caps = era.capabilities();
    let mut b = CodeUnitBuilder::new("g", era);
    b.param("cm").param("x");
    let handler = b.new_label();
    let swallow = b.new_label();
    let cleanup = b.new_label();

    b.set_line(1);
    b.emit(Opcode::Resume);
    b.set_line(2);
    b.emit_load_fast("cm");
    for inst in caps.call_with_constants(&[]) {
        b.emit_instruction(inst);
    }
    b.emit(Opcode::BeforeWith);
    b.emit(Opcode::PopTop);
    b.begin_region(handler, 1, true);
    b.set_line(3);
    b.emit_load_fast("x");
    b.emit(Opcode::PopTop);
    b.set_line(4);
    b.emit_load_fast("x");
    b.emit_store_fast("y");
    b.end_region();
    b.set_line(5);
    for _ in 0..3 {
        b.emit_const(Constant::None);
    }
    b.emit_arg(Opcode::Call, 2);
    b.emit(Opcode::PopTop);
    b.emit_load_fast("y");
    b.emit(Opcode::ReturnValue);

    b.bind(handler);
    b.begin_region(cleanup, 3, true);
    b.emit(Opcode::PushExcInfo);
    b.emit(Opcode::WithExceptStart);
    b.emit_jump(Opcode::PopJumpIfTrue, swallow);
    b.emit_arg(Opcode::Reraise, 2);
    b.bind(swallow);
    b.emit(Opcode::PopTop);
    b.emit(Opcode::PopExcept);
    b.end_region();
    b.emit(Opcode::PopTop);
    b.emit(Opcode::PopTop);
    b.emit_const(Constant::None);
    b.emit(Opcode::ReturnValue);

    b.bind(cleanup);
    b.emit_arg(Opcode::Copy, 3);
    b.emit(Opcode::PopExcept);
    b.emit_arg(Opcode::Reraise, 1);
    Rc::new(b.build().unwrap())
}

/// `def h(x): try: x; y = x finally: ...; return y` on a structural era. The
/// resource slot is consumed before the body runs.
fn try_block(era: Era) -> Rc<CodeUnit> {
    let mut b = CodeUnitBuilder::new("h", era);
    b.param("x");
    let handler = b.new_label();
    let cleanup = b.new_label();

    b.set_line(1);
    b.emit(Opcode::Resume);
    b.begin_region(handler, 0, false);
    b.set_line(3);
    b.emit_load_fast("x");
    b.emit(Opcode::PopTop);
    b.set_line(4);
    b.emit_load_fast("x");
    b.emit_store_fast("y");
    b.end_region();
    b.set_line(5);
    b.emit_load_fast("y");
    b.emit(Opcode::ReturnValue);

    b.bind(handler);
    b.begin_region(cleanup, 1, true);
    b.emit(Opcode::PushExcInfo);
    b.emit_arg(Opcode::Reraise, 0);
    b.end_region();

    b.bind(cleanup);
    b.emit_arg(Opcode::Copy, 3);
    b.emit(Opcode::PopExcept);
    b.emit_arg(Opcode::Reraise, 1);
    Rc::new(b.build().unwrap())
}

/// `def f(cm, x): <suspend with cm(), x on the stack>; return x` on the block era.
fn block_root() -> Rc<CodeUnit> {
    let mut b = CodeUnitBuilder::new("f", Era::BlockStack);
    b.param("cm").param("x");
    b.set_line(1);
    b.emit_load_fast("cm");
    b.emit_load_fast("x");
    b.set_line(2);
    b.emit(Opcode::ReturnValue);
    Rc::new(b.build().unwrap())
}

fn offset_of(code: &CodeUnit, op: Opcode) -> u32 {
    code.instructions()
        .iter()
        .find(|inst| inst.opcode == op)
        .and_then(|inst| inst.offset)
        .unwrap()
}

fn line_start(code: &CodeUnit, line: u32) -> u32 {
    code.instructions()
        .iter()
        .find(|inst| inst.starts_line == Some(line))
        .and_then(|inst| inst.offset)
        .unwrap()
}

fn prologue_len(generated: &CodeUnit, root: &CodeUnit) -> usize {
    generated.instructions().len() - root.instructions().len()
}

fn count_op(code: &CodeUnit, len: usize, op: Opcode) -> usize {
    code.instructions()
        .iter()
        .take(len)
        .filter(|inst| inst.opcode == op)
        .count()
}

const STRUCTURAL: [Era; 3] = [Era::RegionTable, Era::RegionTableNullStore, Era::RegionTableCallableFirst];

fn strategies() -> [ReenterWith; 3] {
    [
        ReenterWith::new(0),
        ReenterWith::try_finally(0),
        ReenterWith::mode_stack_guard(0, "saved_modes"),
    ]
}

/// Each strategy paired with a root whose stack matches what the strategy leaves.
fn cases(era: Era) -> Vec<(ReenterWith, Rc<CodeUnit>)> {
    let [direct, try_finally, guard] = strategies();
    vec![
        (direct, with_block(era)),
        (try_finally, try_block(era)),
        (guard, with_block(era)),
    ]
}

fn covering(code: &CodeUnit, offset: u32) -> ExceptionTableEntry {
    code.exception_table()
        .iter()
        .copied()
        .find(|entry| entry.start <= offset && offset < entry.end)
        .unwrap()
}

// =============================================================================
// Strategies on structural eras
// =============================================================================

/// Every strategy assembles on every structural era and contributes exactly one
/// guard, followed by the always-raise tail.
#[test]
fn every_strategy_has_one_guard() {
    for era in STRUCTURAL {
        for (reentry, g) in cases(era) {
            let handler = offset_of(&g, Opcode::PushExcInfo);
            let line3 = line_start(&g, 3);
            let mut cache = ContinuationCache::new(era);
            let key = ResumeKey::new(line3, 1)
                .with_live_locals(["x"])
                .with_reentry(reentry.clone(), handler);
            let resumed = cache.lookup(&g, 3, &key).unwrap();
            let len = prologue_len(&resumed, &g);
            assert_eq!(count_op(&resumed, len, Opcode::PushExcInfo), 1, "{era} {reentry:?}");
            let insts = resumed.instructions().as_slice();
            assert_eq!(insts[len - 1].opcode, Opcode::RaiseVarargs);
            assert_eq!(insts[len - 2].operand, Operand::Const(Constant::None));
        }
    }
}

/// Regions that pointed at the root's `with` handler now point at the guard, and
/// nothing targets the old handler any more.
#[test]
fn root_regions_are_redirected_to_the_guard() {
    for (reentry, g) in cases(Era::RegionTable) {
        let handler = offset_of(&g, Opcode::PushExcInfo);
        let line3 = line_start(&g, 3);
        let mut cache = ContinuationCache::new(Era::RegionTable);
        let key = ResumeKey::new(line3, 1)
            .with_live_locals(["x"])
            .with_reentry(reentry, handler);
        let resumed = cache.lookup(&g, 3, &key).unwrap();

        let len = prologue_len(&resumed, &g);
        let guard = offset_of(&resumed, Opcode::PushExcInfo);
        let old_index = g.instructions().iter().position(|i| i.offset == Some(handler)).unwrap();
        let old_handler = resumed.instructions().as_slice()[len + old_index].offset.unwrap();
        assert!(resumed.exception_table().iter().all(|entry| entry.target != old_handler));

        let body_index = g.instructions().iter().position(|i| i.offset == Some(line3)).unwrap();
        let body = resumed.instructions().as_slice()[len + body_index].offset.unwrap();
        let before = covering(&g, line3);
        assert_eq!(before.target, handler);
        let after = covering(&resumed, body);
        assert_eq!(after.target, guard);
        assert_eq!((after.depth, after.lasti), (before.depth, before.lasti));
    }
}

/// Direct re-entry constructs the resource from literal arguments and enters it
/// with the era's `with` lowering.
#[test]
fn direct_reentry_builds_and_enters() {
    let g = with_block(Era::RegionTableCallableFirst);
    let handler = offset_of(&g, Opcode::PushExcInfo);
    let key = ResumeKey::new(line_start(&g, 3), 1).with_reentry(
        ReenterWith::new(0).target_values([Constant::Bool(true), Constant::Int(2)]),
        handler,
    );
    let mut cache = ContinuationCache::new(Era::RegionTableCallableFirst);
    let resumed = cache.lookup(&g, 3, &key).unwrap();

    let ops: Vec<Opcode> = resumed.instructions().iter().take(12).map(|i| i.opcode).collect();
    assert_eq!(
        ops,
        vec![
            Opcode::Resume,
            Opcode::LoadFast,
            Opcode::PushNull,
            Opcode::LoadConst,
            Opcode::LoadConst,
            Opcode::Call,
            Opcode::Nop,
            Opcode::BeforeWith,
            Opcode::PopTop,
            Opcode::Nop,
            Opcode::Nop,
            Opcode::Jump,
        ]
    );
    assert_eq!(resumed.instructions().as_slice()[5].operand, Operand::Count(2));
}

/// Try/finally re-entry parks the resource in a fresh local and calls its hooks by
/// name.
#[test]
fn try_finally_uses_a_fresh_local() {
    let g = try_block(Era::RegionTable);
    let handler = offset_of(&g, Opcode::PushExcInfo);
    let key = ResumeKey::new(line_start(&g, 3), 1).with_reentry(ReenterWith::try_finally(0), handler);
    let mut cache = ContinuationCache::new(Era::RegionTable);
    let resumed = cache.lookup(&g, 3, &key).unwrap();

    assert!(resumed.varnames().contains("___context_manager_0_0"));
    assert!(!resumed.params().any(|p| p.starts_with("___context_manager_")));
    assert!(resumed.names().contains("__enter__"));
    assert!(resumed.names().contains("__exit__"));
    let jump = resumed
        .instructions()
        .iter()
        .position(|i| i.opcode == Opcode::Jump)
        .unwrap();
    let stores: Vec<Option<&str>> = resumed.instructions().as_slice()[..jump]
        .iter()
        .filter(|i| i.opcode == Opcode::StoreFast)
        .map(|i| i.operand.local())
        .collect();
    assert_eq!(stores, vec![Some("___context_manager_0_0")]);
}

/// The mode-stack guard leaves the slot alone and restores the saved stack through
/// the configured helper before re-raising.
#[test]
fn mode_stack_guard_restores_and_reraises() {
    let g = with_block(Era::RegionTableNullStore);
    let handler = offset_of(&g, Opcode::PushExcInfo);
    let key = ResumeKey::new(line_start(&g, 3), 1)
        .with_reentry(ReenterWith::mode_stack_guard(0, "saved_modes"), handler);
    let mut cache = ContinuationCache::new(Era::RegionTableNullStore);
    let resumed = cache.lookup(&g, 3, &key).unwrap();

    let ops: Vec<Opcode> = resumed.instructions().iter().take(5).map(|i| i.opcode).collect();
    assert_eq!(
        ops,
        vec![Opcode::Resume, Opcode::LoadFast, Opcode::Nop, Opcode::Nop, Opcode::Jump]
    );
    assert!(resumed.varnames().contains("saved_modes"));
    assert!(resumed.names().contains("__import_runtime_utils"));
    assert!(resumed.names().contains("set_mode_stack"));
}

/// Each new epilogue goes in front of the ones already accumulated, so guards
/// appear innermost first.
#[test]
fn nested_resources_tear_down_innermost_first() {
    let g = with_block(Era::RegionTable);
    let handler = offset_of(&g, Opcode::PushExcInfo);
    let key = ResumeKey::new(line_start(&g, 3), 2)
        .with_reentry(ReenterWith::mode_stack_guard(0, "saved_modes"), handler)
        .with_reentry(ReenterWith::try_finally(1), handler);
    let mut cache = ContinuationCache::new(Era::RegionTable);
    let resumed = cache.lookup(&g, 3, &key).unwrap();

    let len = prologue_len(&resumed, &g);
    let insts = &resumed.instructions().as_slice()[..len];
    let jump = insts.iter().position(|i| i.opcode == Opcode::Jump).unwrap();
    let exit_call = insts
        .iter()
        .position(|i| i.operand == Operand::Name("__exit__".to_owned()))
        .unwrap();
    let restore = insts
        .iter()
        .position(|i| i.operand == Operand::Name("set_mode_stack".to_owned()))
        .unwrap();
    assert!(jump < exit_call);
    assert!(exit_call < restore);
    assert_eq!(count_op(&resumed, len, Opcode::PushExcInfo), 2);
}

/// Structural eras need one handler offset per re-entry.
#[test]
fn missing_resource_target_is_inconsistent() {
    let g = with_block(Era::RegionTable);
    let key = ResumeKey::new(line_start(&g, 3), 1).with_block_reentry(ReenterWith::new(0));
    let mut cache = ContinuationCache::new(Era::RegionTable);
    let err = cache.lookup(&g, 3, &key).unwrap_err();
    assert!(matches!(err, ResumeError::StructuralInconsistency { .. }));
}

/// A handler offset that is not an instruction of the root is inconsistent.
#[test]
fn unknown_resource_target_is_inconsistent() {
    let g = with_block(Era::RegionTable);
    let key = ResumeKey::new(line_start(&g, 3), 1).with_reentry(ReenterWith::new(0), 1);
    let mut cache = ContinuationCache::new(Era::RegionTable);
    let err = cache.lookup(&g, 3, &key).unwrap_err();
    assert_eq!(err.kind(), "StructuralInconsistency");
}

// =============================================================================
// Strategies on the block era
// =============================================================================

/// Block-era re-entry uses block setup instructions, has no exception table and no
/// guard marker.
#[test]
fn block_era_strategies_use_blocks() {
    let f = block_root();
    let target = offset_of(&f, Opcode::ReturnValue);
    for (reentry, setup) in strategies().into_iter().zip([
        Opcode::SetupWith,
        Opcode::SetupFinally,
        Opcode::SetupFinally,
    ]) {
        let mut cache = ContinuationCache::new(Era::BlockStack);
        let key = ResumeKey::new(target, 2).with_block_reentry(reentry.clone());
        let resumed = cache.lookup(&f, 2, &key).unwrap();
        let len = prologue_len(&resumed, &f);
        assert!(resumed.exception_table().is_empty());
        assert_eq!(count_op(&resumed, len, Opcode::PushExcInfo), 0, "{reentry:?}");
        let jump = resumed
            .instructions()
            .iter()
            .position(|i| i.opcode == Opcode::Jump)
            .unwrap();
        assert!(
            resumed.instructions().iter().take(jump).any(|i| i.opcode == setup),
            "{reentry:?}"
        );
        assert_eq!(resumed.instructions().as_slice()[len - 1].opcode, Opcode::RaiseVarargs);
    }
}

/// Block-era calls use the plain call opcodes.
#[test]
fn block_era_direct_reentry_calls_the_class() {
    let f = block_root();
    let target = offset_of(&f, Opcode::ReturnValue);
    let key = ResumeKey::new(target, 2).with_block_reentry(ReenterWith::new(0).target_values([Constant::Int(7)]));
    let mut cache = ContinuationCache::new(Era::BlockStack);
    let resumed = cache.lookup(&f, 2, &key).unwrap();
    let ops: Vec<Opcode> = resumed.instructions().iter().take(4).map(|i| i.opcode).collect();
    assert_eq!(
        ops,
        vec![Opcode::LoadFast, Opcode::LoadConst, Opcode::CallFunction, Opcode::Nop]
    );
}
