//! Reference snippets and the template expander.
//!
//! Each re-entry strategy is described by a tiny snippet containing one placeholder
//! statement (`LOAD_FAST placeholder; POP_TOP`). The expander compiles the snippet,
//! replaces the placeholder pair with two `NOP` markers and splits the fragment
//! between them: everything up to the first marker is the setup, the rest is the
//! epilogue. The continuation body is later spliced into the gap.

use crate::{
    bytecode::{CodeUnitBuilder, Constant, InstId, InstructionStream, Label, Opcode},
    era::EraCapabilities,
    error::{ResumeError, ResumeResult},
    transform::Draft,
};

/// Local loaded by the placeholder statement of every snippet.
pub const PLACEHOLDER: &str = "___placeholder";

/// Local holding the resource in the `with` snippet.
pub const CONTEXT: &str = "___ctx";

/// A reference snippet to compile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Snippet<'a> {
    /// `with ctx: placeholder`
    With,
    /// `ctx.__enter__(); try: placeholder finally: ctx.__exit__(None, None, None)`
    EnterTryFinally { ctx: &'a str },
    /// `try: placeholder except: helper.restore(saved); raise`
    RestoreModeStack {
        helper: &'a str,
        restore: &'a str,
        saved: &'a str,
    },
}

impl Snippet<'_> {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::With => "with",
            Self::EnterTryFinally { .. } => "enter_try_finally",
            Self::RestoreModeStack { .. } => "restore_mode_stack",
        }
    }
}

/// Compiler primitive turning a snippet into an instruction fragment for an era.
///
/// Fragments are not assembled: they carry handles and symbolic operands only, and
/// their exception regions are relative to an empty stack.
pub trait SnippetCompiler {
    fn compile(&self, snippet: &Snippet<'_>, caps: &EraCapabilities) -> ResumeResult<InstructionStream>;
}

/// Built-in compiler producing the conventional lowering of each snippet.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReferenceCompiler;

impl SnippetCompiler for ReferenceCompiler {
    fn compile(&self, snippet: &Snippet<'_>, caps: &EraCapabilities) -> ResumeResult<InstructionStream> {
        let mut b = CodeUnitBuilder::new(snippet.name(), caps.era());
        match (snippet, caps.structural_regions()) {
            (Snippet::With, true) => with_regions(&mut b),
            (Snippet::With, false) => with_blocks(&mut b),
            (Snippet::EnterTryFinally { ctx }, structural) => {
                b.emit_load_fast(*ctx);
                b.emit_name(Opcode::LoadMethod, "__enter__");
                b.emit_instruction(caps.call_method(0));
                b.emit(Opcode::PopTop);
                guarded(&mut b, structural, |b| call_exit(b, caps, ctx));
            }
            (Snippet::RestoreModeStack { helper, restore, saved }, structural) => {
                guarded_except(&mut b, structural, |b| {
                    b.emit_name(Opcode::LoadGlobal, *helper);
                    b.emit_name(Opcode::LoadMethod, *restore);
                    b.emit_load_fast(*saved);
                    b.emit_instruction(caps.call_method(1));
                    b.emit(Opcode::PopTop);
                });
            }
        }
        b.build_stream().map(|(_, stream)| stream)
    }
}

fn placeholder(b: &mut CodeUnitBuilder) {
    b.emit(Opcode::Nop);
    b.emit_load_fast(PLACEHOLDER);
    b.emit(Opcode::PopTop);
}

fn call_exit(b: &mut CodeUnitBuilder, caps: &EraCapabilities, ctx: &str) {
    b.emit_load_fast(ctx);
    b.emit_name(Opcode::LoadMethod, "__exit__");
    for _ in 0..3 {
        b.emit_const(Constant::None);
    }
    b.emit_instruction(caps.call_method(3));
    b.emit(Opcode::PopTop);
}

/// Handler tail shared by structural handlers: restore the previous exception and
/// re-raise, keeping the raising offset.
fn cleanup_handler(b: &mut CodeUnitBuilder, cleanup: Label) {
    b.bind(cleanup);
    b.emit_arg(Opcode::Copy, 3);
    b.emit(Opcode::PopExcept);
    b.emit_arg(Opcode::Reraise, 1);
}

fn with_regions(b: &mut CodeUnitBuilder) {
    let handler = b.new_label();
    let swallow = b.new_label();
    let cleanup = b.new_label();
    let end = b.new_label();

    b.emit_load_fast(CONTEXT);
    b.emit(Opcode::BeforeWith);
    b.emit(Opcode::PopTop);
    b.begin_region(handler, 1, true);
    placeholder(b);
    b.end_region();
    for _ in 0..3 {
        b.emit_const(Constant::None);
    }
    b.emit_arg(Opcode::Call, 2);
    b.emit(Opcode::PopTop);
    b.emit_jump(Opcode::Jump, end);

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
    b.emit_jump(Opcode::Jump, end);

    cleanup_handler(b, cleanup);
    b.bind(end);
    b.emit(Opcode::Nop);
}

fn with_blocks(b: &mut CodeUnitBuilder) {
    let handler = b.new_label();
    let swallow = b.new_label();
    let end = b.new_label();

    b.emit_load_fast(CONTEXT);
    b.emit_jump(Opcode::SetupWith, handler);
    b.emit(Opcode::PopTop);
    placeholder(b);
    b.emit(Opcode::PopBlock);
    for _ in 0..3 {
        b.emit_const(Constant::None);
    }
    b.emit_arg(Opcode::CallFunction, 3);
    b.emit(Opcode::PopTop);
    b.emit_jump(Opcode::Jump, end);

    b.bind(handler);
    b.emit(Opcode::WithExceptStart);
    b.emit_jump(Opcode::PopJumpIfTrue, swallow);
    b.emit_arg(Opcode::Reraise, 0);
    b.bind(swallow);
    for _ in 0..4 {
        b.emit(Opcode::PopTop);
    }
    b.emit_jump(Opcode::Jump, end);

    b.bind(end);
    b.emit(Opcode::Nop);
}

/// `try: placeholder finally: <finally_body>`
fn guarded(b: &mut CodeUnitBuilder, structural: bool, mut finally_body: impl FnMut(&mut CodeUnitBuilder)) {
    let handler = b.new_label();
    let end = b.new_label();
    if structural {
        let cleanup = b.new_label();
        b.begin_region(handler, 0, false);
        placeholder(b);
        b.end_region();
        finally_body(b);
        b.emit_jump(Opcode::Jump, end);

        b.bind(handler);
        b.begin_region(cleanup, 1, true);
        b.emit(Opcode::PushExcInfo);
        finally_body(b);
        b.emit_arg(Opcode::Reraise, 0);
        b.end_region();
        cleanup_handler(b, cleanup);
    } else {
        b.emit_jump(Opcode::SetupFinally, handler);
        placeholder(b);
        b.emit(Opcode::PopBlock);
        finally_body(b);
        b.emit_jump(Opcode::Jump, end);

        b.bind(handler);
        finally_body(b);
        b.emit_arg(Opcode::Reraise, 0);
    }
    b.bind(end);
    b.emit(Opcode::Nop);
}

/// `try: placeholder except: <handler_body>; raise`
fn guarded_except(b: &mut CodeUnitBuilder, structural: bool, handler_body: impl FnOnce(&mut CodeUnitBuilder)) {
    let handler = b.new_label();
    let end = b.new_label();
    if structural {
        let cleanup = b.new_label();
        b.begin_region(handler, 0, false);
        placeholder(b);
        b.end_region();
        b.emit_jump(Opcode::Jump, end);

        b.bind(handler);
        b.begin_region(cleanup, 1, true);
        b.emit(Opcode::PushExcInfo);
        handler_body(b);
        b.emit_arg(Opcode::Reraise, 0);
        b.end_region();
        cleanup_handler(b, cleanup);
    } else {
        b.emit_jump(Opcode::SetupFinally, handler);
        placeholder(b);
        b.emit(Opcode::PopBlock);
        b.emit_jump(Opcode::Jump, end);

        b.bind(handler);
        handler_body(b);
        b.emit_arg(Opcode::Reraise, 0);
    }
    b.bind(end);
    b.emit(Opcode::Nop);
}

/// A snippet split around its placeholder, allocated in a draft's arena.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expansion {
    /// Runs before the continuation; ends with the first marker.
    pub setup: Vec<InstId>,
    /// Runs after the continuation; starts with the second marker.
    pub epilogue: Vec<InstId>,
}

/// Compiles `snippet`, moves it into `draft` and splits it at the placeholder.
///
/// Every exception region of the fragment is raised by `depth`, the number of
/// stack items that sit below the fragment once it is spliced in.
pub fn expand_template<C: SnippetCompiler + ?Sized>(
    draft: &mut Draft,
    compiler: &C,
    snippet: &Snippet<'_>,
    caps: &EraCapabilities,
    depth: u16,
) -> ResumeResult<Expansion> {
    let stream = compiler.compile(snippet, caps)?;
    let unit = draft.unit().to_owned();
    let ids = draft.adopt(stream);

    for id in &ids {
        if let Some(region) = &mut draft.inst_mut(*id).region {
            region.depth = region.depth.checked_add(depth).ok_or_else(|| {
                ResumeError::inconsistent(&unit, format!("{} region depth overflows at {depth}", snippet.name()))
            })?;
        }
    }

    let marker = ids
        .iter()
        .position(|id| {
            let inst = draft.inst(*id);
            inst.opcode == Opcode::LoadFast && inst.operand.local() == Some(PLACEHOLDER)
        })
        .ok_or_else(|| ResumeError::marker_not_found(snippet.name(), PLACEHOLDER))?;
    let discard = ids
        .get(marker + 1)
        .copied()
        .filter(|id| draft.inst(*id).opcode == Opcode::PopTop)
        .ok_or_else(|| ResumeError::marker_not_found(snippet.name(), format!("{PLACEHOLDER} discard")))?;

    draft.inst_mut(ids[marker]).overwrite(Opcode::Nop);
    draft.inst_mut(discard).overwrite(Opcode::Nop);
    let (setup, epilogue) = ids.split_at(marker + 1);
    Ok(Expansion {
        setup: setup.to_vec(),
        epilogue: epilogue.to_vec(),
    })
}
