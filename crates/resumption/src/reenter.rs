//! Re-entry of scoped resources that were active at the suspension point.
//!
//! A resource sits on the evaluation stack at a known slot when the continuation
//! starts. Re-entering it produces two fragments: a setup that runs before the jump
//! into the continuation, and an epilogue that tears the resource down when the
//! continuation raises. Epilogues are accumulated by the caller, innermost first.

use serde::{Deserialize, Serialize};

use crate::{
    bytecode::{CodeOptions, ConstArgs, Constant, InstId, Instruction, Opcode},
    config::ResumeConfig,
    era::EraCapabilities,
    error::{ResumeError, ResumeResult},
    template::{CONTEXT, Expansion, Snippet, SnippetCompiler, expand_template},
    transform::Draft,
};

/// How a resource is re-entered.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ReentryStrategy {
    /// `with resource(args): <continuation>`
    #[default]
    Direct,
    /// Stores the resource in a fresh local, enters it, and exits it in a finally
    /// region, leaving nothing pushed by the entry hook.
    TryFinally,
    /// Wraps the continuation in a handler that restores the mode stack saved in
    /// `saved_stack_var` and re-raises. The stack slot is left untouched.
    ModeStackGuard { saved_stack_var: String },
}

/// Descriptor of one resource to re-enter.
///
/// The slot at `stack_index` holds the resource's class; it is called with
/// `target_values` (or no arguments) to obtain a fresh instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReenterWith {
    pub stack_index: usize,
    pub target_values: Option<ConstArgs>,
    pub strategy: ReentryStrategy,
}

impl ReenterWith {
    /// Direct re-entry of the resource at `stack_index`.
    #[must_use]
    pub fn new(stack_index: usize) -> Self {
        Self {
            stack_index,
            target_values: None,
            strategy: ReentryStrategy::Direct,
        }
    }

    #[must_use]
    pub fn try_finally(stack_index: usize) -> Self {
        Self {
            strategy: ReentryStrategy::TryFinally,
            ..Self::new(stack_index)
        }
    }

    #[must_use]
    pub fn mode_stack_guard(stack_index: usize, saved_stack_var: impl Into<String>) -> Self {
        Self {
            strategy: ReentryStrategy::ModeStackGuard {
                saved_stack_var: saved_stack_var.into(),
            },
            ..Self::new(stack_index)
        }
    }

    /// Sets the literal constructor arguments.
    #[must_use]
    pub fn target_values(mut self, values: impl IntoIterator<Item = Constant>) -> Self {
        self.target_values = Some(values.into_iter().collect());
        self
    }

    /// Emits the setup fragment and prepends the epilogue to `cleanup`.
    ///
    /// `depth` is the stack depth when the setup starts, the resource slot included.
    pub fn emit<C: SnippetCompiler + ?Sized>(
        &self,
        ctx: &mut ReentryContext<'_, C>,
        depth: u16,
        cleanup: &mut Vec<InstId>,
    ) -> ResumeResult<Reentry> {
        let (caps, compiler, config) = (ctx.caps, ctx.compiler, ctx.config);
        let below = depth.saturating_sub(1);
        let (mut setup, expansion, snippet) = match &self.strategy {
            ReentryStrategy::Direct => {
                let setup = ctx.draft.extend(self.construct(caps));
                let expansion = expand_template(ctx.draft, compiler, &Snippet::With, caps, below)?;
                let load = expansion
                    .setup
                    .iter()
                    .copied()
                    .find(|id| {
                        let inst = ctx.draft.inst(*id);
                        inst.opcode == Opcode::LoadFast && inst.operand.local() == Some(CONTEXT)
                    })
                    .ok_or_else(|| ResumeError::marker_not_found(Snippet::With.name(), CONTEXT))?;
                // the fresh instance is already on the stack
                ctx.draft.inst_mut(load).overwrite(Opcode::Nop);
                (setup, expansion, Snippet::With.name())
            }
            ReentryStrategy::TryFinally => {
                let local = self.fresh_local(ctx.options, config);
                let mut insts = self.construct(caps);
                insts.push(Instruction::store_fast(local.clone()));
                let setup = ctx.draft.extend(insts);
                let snippet = Snippet::EnterTryFinally { ctx: &local };
                let expansion = expand_template(ctx.draft, compiler, &snippet, caps, below)?;
                (setup, expansion, snippet.name())
            }
            ReentryStrategy::ModeStackGuard { saved_stack_var } => {
                if !ctx.options.varnames.contains(saved_stack_var) {
                    ctx.options.varnames.insert(saved_stack_var.clone());
                }
                let snippet = Snippet::RestoreModeStack {
                    helper: &config.mode_stack_helper,
                    restore: &config.mode_stack_restore,
                    saved: saved_stack_var,
                };
                let expansion = expand_template(ctx.draft, compiler, &snippet, caps, depth)?;
                (Vec::new(), expansion, snippet.name())
            }
        };

        let Expansion { setup: body, epilogue } = expansion;
        let guard = guard_marker(ctx.draft, caps, &epilogue, snippet)?;
        setup.extend(body);
        cleanup.splice(0..0, epilogue);
        Ok(Reentry { setup, guard })
    }

    /// Calls the class on top of the stack with the literal constructor arguments.
    fn construct(&self, caps: &EraCapabilities) -> Vec<Instruction> {
        caps.call_with_constants(self.target_values.as_deref().unwrap_or_default())
    }

    fn fresh_local(&self, options: &mut CodeOptions, config: &ResumeConfig) -> String {
        let mut serial = 0;
        loop {
            let name = config.context_local(self.stack_index, serial);
            if options.varnames.insert(name.clone()) {
                return name;
            }
            serial += 1;
        }
    }
}

/// Everything a strategy needs while emitting.
pub struct ReentryContext<'a, C: ?Sized> {
    pub draft: &'a mut Draft,
    pub options: &'a mut CodeOptions,
    pub caps: &'a EraCapabilities,
    pub compiler: &'a C,
    pub config: &'a ResumeConfig,
}

/// Result of re-entering one resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reentry {
    /// Runs before the jump into the continuation.
    pub setup: Vec<InstId>,
    /// The exception-info capture point of the epilogue, on eras with structural
    /// regions. Regions of the continuation that targeted the original resource's
    /// handler are redirected here.
    pub guard: Option<InstId>,
}

/// Finds the single `PUSH_EXC_INFO` of a structural epilogue.
fn guard_marker(
    draft: &Draft,
    caps: &EraCapabilities,
    epilogue: &[InstId],
    snippet: &'static str,
) -> ResumeResult<Option<InstId>> {
    if !caps.structural_regions() {
        return Ok(None);
    }
    let mut markers = epilogue
        .iter()
        .copied()
        .filter(|id| draft.inst(*id).opcode == Opcode::PushExcInfo);
    match (markers.next(), markers.next()) {
        (Some(marker), None) => Ok(Some(marker)),
        _ => Err(ResumeError::marker_not_found(snippet, Opcode::PushExcInfo.to_string())),
    }
}
