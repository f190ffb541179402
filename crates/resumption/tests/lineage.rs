/// Tests for memoization and lineage redirection.
///
/// Requests against a generated unit must be answered from its root, so chains of
/// continuations never grow and converging resume points share one unit.
use std::rc::Rc;

use pretty_assertions::assert_eq;
use resumption::{
    CodeUnit, CodeUnitBuilder, Constant, ContinuationCache, CountingTracer, Era, Opcode, RecordingTracer,
    ReenterWith, ReferenceCompiler, ResumeConfig, ResumeEvent, ResumeKey,
};

/// `def f(a): x = a; <suspend>; return x + a`
fn straight(era: Era) -> Rc<CodeUnit> {
    let mut b = CodeUnitBuilder::new("f", era);
    b.param("a");
    b.set_line(1);
    if era.capabilities().frame_setup() {
        b.emit(Opcode::Resume);
    }
    b.emit_load_fast("a");
    b.emit_store_fast("x");
    b.set_line(2);
    b.emit_load_fast("x");
    b.emit_load_fast("a");
    b.set_line(3);
    b.emit_arg(Opcode::BinaryOp, 0);
    b.emit(Opcode::ReturnValue);
    Rc::new(b.build().unwrap())
}

/// `def g(cm, x): with cm(): x; y = x; return y`, lowered with a structural
/// exception table. The two statements in the body are on lines 3 and 4.
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

/// Offset in `generated` of the root instruction at `root_offset`.
fn moved(generated: &CodeUnit, root: &CodeUnit, root_offset: u32) -> u32 {
    let prologue = generated.instructions().len() - root.instructions().len();
    let index = root
        .instructions()
        .iter()
        .position(|inst| inst.offset == Some(root_offset))
        .unwrap();
    generated.instructions().as_slice()[prologue + index].offset.unwrap()
}

// =============================================================================
// Memoization
// =============================================================================

/// Identical requests return the very same unit.
#[test]
fn identical_requests_share_one_unit() {
    let f = straight(Era::RegionTableCallableFirst);
    let key = ResumeKey::new(offset_of(&f, Opcode::BinaryOp), 2).with_live_locals(["x"]);
    let mut cache = ContinuationCache::new(Era::RegionTableCallableFirst);

    let first = cache.lookup(&f, 3, &key).unwrap();
    let second = cache.lookup(&f, 3, &key.clone()).unwrap();
    assert!(Rc::ptr_eq(&first, &second));
    assert_eq!(cache.len(), 1);

    let other_line = cache.lookup(&f, 30, &key).unwrap();
    assert!(!Rc::ptr_eq(&first, &other_line));
    assert_eq!(other_line.name(), "__resume_in_f_at_30");
}

/// Structurally equal roots are still different units.
#[test]
fn roots_are_keyed_by_identity() {
    let f1 = straight(Era::BlockStack);
    let f2 = straight(Era::BlockStack);
    let key = ResumeKey::new(offset_of(&f1, Opcode::BinaryOp), 2);
    let mut cache = ContinuationCache::new(Era::BlockStack);
    let r1 = cache.lookup(&f1, 3, &key).unwrap();
    let r2 = cache.lookup(&f2, 3, &key).unwrap();
    assert!(!Rc::ptr_eq(&r1, &r2));
    assert!(Rc::ptr_eq(&cache.root_of(&r1).unwrap(), &f1));
    assert!(Rc::ptr_eq(&cache.root_of(&r2).unwrap(), &f2));
}

/// The cache never keeps a root alive.
#[test]
fn cache_does_not_own_roots() {
    let f = straight(Era::BlockStack);
    let weak = Rc::downgrade(&f);
    let mut cache = ContinuationCache::new(Era::BlockStack);
    cache
        .lookup(&f, 3, &ResumeKey::new(offset_of(&f, Opcode::BinaryOp), 2))
        .unwrap();
    drop(f);
    assert!(weak.upgrade().is_none());
    cache.prune();
    assert!(cache.is_empty());
}

/// A continuation asked for the very point it was generated for answers with
/// itself, and that answer does not keep it alive.
#[test]
fn continuation_does_not_own_itself() {
    let f = straight(Era::RegionTable);
    let target = offset_of(&f, Opcode::BinaryOp);
    let mut cache = ContinuationCache::new(Era::RegionTable);
    let r1 = cache.lookup(&f, 3, &ResumeKey::new(target, 2)).unwrap();
    let again = cache
        .lookup(&r1, 3, &ResumeKey::new(moved(&r1, &f, target), 2))
        .unwrap();
    assert!(Rc::ptr_eq(&again, &r1));

    let weak = Rc::downgrade(&r1);
    drop(again);
    drop(r1);
    drop(f);
    cache.prune();
    assert!(weak.upgrade().is_none());
    assert!(cache.is_empty());
}

/// Continuations that answer each other's requests do not form an ownership
/// cycle.
#[test]
fn continuations_do_not_own_each_other() {
    let f = straight(Era::RegionTable);
    let load_a = line_start(&f, 2) + 2;
    let target = offset_of(&f, Opcode::BinaryOp);
    let mut cache = ContinuationCache::new(Era::RegionTable);
    let early = cache
        .lookup(&f, 2, &ResumeKey::new(load_a, 1).with_live_locals(["a"]))
        .unwrap();
    let late = cache.lookup(&f, 3, &ResumeKey::new(target, 2)).unwrap();

    let forward = cache
        .lookup(&early, 3, &ResumeKey::new(moved(&early, &f, target), 2))
        .unwrap();
    let backward = cache
        .lookup(
            &late,
            2,
            &ResumeKey::new(moved(&late, &f, load_a), 1).with_live_locals(["a"]),
        )
        .unwrap();
    assert!(Rc::ptr_eq(&forward, &late));
    assert!(Rc::ptr_eq(&backward, &early));

    let weaks = [Rc::downgrade(&early), Rc::downgrade(&late)];
    drop((forward, backward, early, late, f));
    cache.prune();
    assert!(weaks.iter().all(|weak| weak.upgrade().is_none()));
    assert!(cache.is_empty());
}

/// The cache holds roots weakly, so resuming from a continuation whose root is
/// gone is refused.
#[test]
fn continuation_of_dropped_root_is_refused() {
    let f = straight(Era::RegionTable);
    let target = offset_of(&f, Opcode::BinaryOp);
    let mut cache = ContinuationCache::new(Era::RegionTable);
    let r1 = cache.lookup(&f, 3, &ResumeKey::new(target, 2)).unwrap();
    let moved_target = moved(&r1, &f, target);
    drop(f);
    let err = cache.lookup(&r1, 3, &ResumeKey::new(moved_target, 2)).unwrap_err();
    assert_eq!(err.kind(), "StructuralInconsistency");
}

// =============================================================================
// Lineage
// =============================================================================

/// Resuming inside a continuation is answered from the root: the result is the
/// unit the root itself produces for the translated key, and its name does not
/// nest.
#[test]
fn redirect_resolves_to_root_in_one_hop() {
    let f = straight(Era::RegionTable);
    let mut cache = ContinuationCache::new(Era::RegionTable);
    let load_a = f
        .instructions()
        .iter()
        .filter(|inst| inst.operand.local() == Some("a"))
        .nth(1)
        .and_then(|inst| inst.offset)
        .unwrap();

    let r1 = cache
        .lookup(&f, 2, &ResumeKey::new(load_a, 1).with_live_locals(["a"]))
        .unwrap();
    assert!(cache.is_generated(&r1));

    let target = offset_of(&f, Opcode::BinaryOp);
    let r2 = cache
        .lookup(&r1, 3, &ResumeKey::new(moved(&r1, &f, target), 2))
        .unwrap();
    let direct = cache.lookup(&f, 3, &ResumeKey::new(target, 2)).unwrap();

    assert!(Rc::ptr_eq(&r2, &direct));
    assert!(Rc::ptr_eq(&cache.root_of(&r2).unwrap(), &f));
    assert!(Rc::ptr_eq(&cache.root_of(&r1).unwrap(), &f));
    assert_eq!(r2.name(), "__resume_in_f_at_3");
    assert_eq!(r2.instructions().len() - f.instructions().len(), 4);
    assert!(cache.root_of(&f).is_none());
}

/// Two resume points that later continue to the same offset share one unit.
#[test]
fn converging_paths_share_one_unit() {
    let f = straight(Era::BlockStack);
    let mut cache = ContinuationCache::with_parts(
        Era::BlockStack,
        ResumeConfig::default(),
        ReferenceCompiler,
        CountingTracer::new(),
    );
    let load_x = line_start(&f, 2);
    let load_a = load_x + 2;
    let target = offset_of(&f, Opcode::BinaryOp);

    let r1 = cache
        .lookup(&f, 2, &ResumeKey::new(load_x, 0).with_live_locals(["a", "x"]))
        .unwrap();
    let r2 = cache
        .lookup(&f, 2, &ResumeKey::new(load_a, 1).with_live_locals(["a"]))
        .unwrap();
    assert!(!Rc::ptr_eq(&r1, &r2));

    let q1 = cache
        .lookup(&r1, 3, &ResumeKey::new(moved(&r1, &f, target), 2))
        .unwrap();
    let q2 = cache
        .lookup(&r2, 3, &ResumeKey::new(moved(&r2, &f, target), 2))
        .unwrap();
    assert!(Rc::ptr_eq(&q1, &q2));

    let stats = *cache.tracer();
    assert_eq!(stats.generated, 3);
    assert_eq!(stats.redirects, 2);
    assert_eq!(stats.hits, 1);
}

/// Resource handler offsets are translated too: a guard synthesized by the first
/// continuation maps back to the root's own handler.
#[test]
fn resource_targets_follow_the_redirect() {
    let g = with_block(Era::RegionTable);
    let handler = offset_of(&g, Opcode::PushExcInfo);
    let line3 = line_start(&g, 3);
    let line4 = line_start(&g, 4);
    let mut cache = ContinuationCache::new(Era::RegionTable);

    let r1 = cache
        .lookup(
            &g,
            3,
            &ResumeKey::new(line3, 1)
                .with_live_locals(["x"])
                .with_reentry(ReenterWith::new(0), handler),
        )
        .unwrap();
    let guard = offset_of(&r1, Opcode::PushExcInfo);
    assert!(guard < moved(&r1, &g, 0));

    let r2 = cache
        .lookup(
            &r1,
            4,
            &ResumeKey::new(moved(&r1, &g, line4), 1)
                .with_live_locals(["x"])
                .with_reentry(ReenterWith::new(0), guard),
        )
        .unwrap();
    let direct = cache
        .lookup(
            &g,
            4,
            &ResumeKey::new(line4, 1)
                .with_live_locals(["x"])
                .with_reentry(ReenterWith::new(0), handler),
        )
        .unwrap();
    assert!(Rc::ptr_eq(&r2, &direct));
}

/// With two re-entered resources, each guard of the continuation maps back to
/// its own resource's handler: guards appear innermost first, so the outer
/// resource owns the second one.
#[test]
fn nested_guards_map_to_their_own_handlers() {
    let g = with_block(Era::RegionTable);
    let outer_handler = offset_of(&g, Opcode::PushExcInfo);
    let inner_handler = offset_of(&g, Opcode::Copy);
    let line3 = line_start(&g, 3);
    let line4 = line_start(&g, 4);
    let key = |offset: u32, outer: u32, inner: u32| {
        ResumeKey::new(offset, 2)
            .with_live_locals(["x"])
            .with_reentry(ReenterWith::mode_stack_guard(0, "saved_modes"), outer)
            .with_reentry(ReenterWith::try_finally(1), inner)
    };
    let mut cache = ContinuationCache::new(Era::RegionTable);

    let r1 = cache.lookup(&g, 3, &key(line3, outer_handler, inner_handler)).unwrap();
    let guards: Vec<u32> = r1
        .instructions()
        .iter()
        .filter(|inst| inst.opcode == Opcode::PushExcInfo)
        .filter_map(|inst| inst.offset)
        .take(2)
        .collect();
    assert!(guards[1] < moved(&r1, &g, 0));

    let r2 = cache
        .lookup(&r1, 4, &key(moved(&r1, &g, line4), guards[1], guards[0]))
        .unwrap();
    let direct = cache.lookup(&g, 4, &key(line4, outer_handler, inner_handler)).unwrap();
    assert!(Rc::ptr_eq(&r2, &direct));
    assert!(Rc::ptr_eq(&cache.root_of(&r2).unwrap(), &g));
}

/// A point inside a continuation's own prologue has no root counterpart.
#[test]
fn prologue_offsets_cannot_be_redirected() {
    let f = straight(Era::RegionTable);
    let target = offset_of(&f, Opcode::BinaryOp);
    let mut cache = ContinuationCache::new(Era::RegionTable);
    let r1 = cache.lookup(&f, 3, &ResumeKey::new(target, 2)).unwrap();
    let err = cache.lookup(&r1, 3, &ResumeKey::new(0, 0)).unwrap_err();
    assert_eq!(err.kind(), "StructuralInconsistency");
}

// =============================================================================
// Tracing
// =============================================================================

/// Recorded events show the miss, the redirect hop and the generation, and dump
/// cleanly as JSON.
#[test]
fn recorded_events_describe_the_redirect() {
    let f = straight(Era::RegionTable);
    let target = offset_of(&f, Opcode::BinaryOp);
    let load_a = target - 2;
    let mut cache = ContinuationCache::new(Era::RegionTable).with_tracer(RecordingTracer::new());

    let r1 = cache.lookup(&f, 2, &ResumeKey::new(load_a, 1)).unwrap();
    let moved_target = moved(&r1, &f, target);
    cache.lookup(&r1, 3, &ResumeKey::new(moved_target, 2)).unwrap();
    cache.lookup(&f, 3, &ResumeKey::new(target, 2)).unwrap();

    let events = cache.tracer().events();
    assert_eq!(
        events,
        &[
            ResumeEvent::Miss {
                unit: "f".to_owned(),
                line: 2,
                offset: load_a,
            },
            ResumeEvent::Generated {
                root: "f".to_owned(),
                unit: "__resume_in_f_at_2".to_owned(),
                line: 2,
                offset: load_a,
            },
            ResumeEvent::Miss {
                unit: "__resume_in_f_at_2".to_owned(),
                line: 3,
                offset: moved_target,
            },
            ResumeEvent::Redirect {
                from: "__resume_in_f_at_2".to_owned(),
                root: "f".to_owned(),
                from_offset: moved_target,
                root_offset: target,
            },
            ResumeEvent::Miss {
                unit: "f".to_owned(),
                line: 3,
                offset: target,
            },
            ResumeEvent::Generated {
                root: "f".to_owned(),
                unit: "__resume_in_f_at_3".to_owned(),
                line: 3,
                offset: target,
            },
            ResumeEvent::Hit {
                unit: "f".to_owned(),
                line: 3,
                offset: target,
            },
        ]
    );

    let json = serde_json::to_value(&events[3]).unwrap();
    assert_eq!(json["event"], "redirect");
    assert_eq!(json["root"], "f");
}

/// Failures are reported to the tracer with their kind.
#[test]
fn faults_are_traced() {
    let f = straight(Era::BlockStack);
    let mut cache = ContinuationCache::new(Era::BlockStack).with_tracer(RecordingTracer::new());
    assert!(cache.lookup(&f, 1, &ResumeKey::new(1, 0)).is_err());
    let last = cache.tracer().events().last().unwrap().clone();
    match last {
        ResumeEvent::Fault { unit, kind, .. } => {
            assert_eq!(unit, "f");
            assert_eq!(kind, "StructuralInconsistency");
        }
        other => panic!("expected a fault, got {other:?}"),
    }
}
