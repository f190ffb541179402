//! Root-case synthesis of a resume unit.
//!
//! The generated unit is the root's own body with a prologue spliced in front:
//!
//! ```text
//! [COPY_FREE_VARS n] [RESUME 0]          frame setup, structural eras only
//! PUSH_NULL / LOAD_FAST ___stack<i>      rehydrated stack, null sentinels included
//!   <re-entry setup> <rebuild call>      per stack slot, when requested
//! LOAD_FAST x; <rebuild call>; STORE_FAST x
//! PUSH_NULL; STORE_FAST y                explicitly unbound locals
//! JUMP target
//! <re-entry epilogues>; LOAD_CONST None; RAISE_VARARGS 1
//! <root body>
//! ```
//!
//! Regions of the root body whose handler was the handler of a re-entered resource
//! are redirected to the matching epilogue's `PUSH_EXC_INFO`.

use std::collections::BTreeMap;

use indexmap::IndexSet;

use crate::{
    bytecode::{CodeFlags, CodeOptions, CodeUnit, Constant, InstId, Instruction, InstructionStream, Opcode},
    config::ResumeConfig,
    era::EraCapabilities,
    error::{ResumeError, ResumeResult},
    key::ResumeKey,
    reenter::{ReenterWith, Reentry, ReentryContext},
    template::SnippetCompiler,
    transform::{Draft, transform_with_snapshot},
};

/// A freshly synthesized unit together with what its lineage record needs.
#[derive(Debug)]
pub(crate) struct Synthesis {
    pub unit: CodeUnit,
    /// Final stream before assembly; copied root instructions keep root offsets.
    pub instructions: InstructionStream,
    /// Root handler offsets of the re-entered resources, in the order their guard
    /// markers appear in the generated unit.
    pub prefix_guard_targets: Vec<u32>,
}

/// Rejects units that cannot be resumed by a synthesized function.
pub(crate) fn check_supported(code: &CodeUnit, caps: &EraCapabilities) -> ResumeResult<()> {
    if code.era() != caps.era() {
        return Err(ResumeError::unsupported(
            code.qualname(),
            format!("unit targets the {} era, cache serves {}", code.era(), caps.era()),
        ));
    }
    if code.flags().intersects(CodeFlags::GENERATOR_LIKE) {
        return Err(ResumeError::unsupported(code.qualname(), "generator-like units cannot be resumed"));
    }
    if !code.flags().contains(CodeFlags::OPTIMIZED) {
        return Err(ResumeError::unsupported(code.qualname(), "unit is not in the optimized calling convention"));
    }
    Ok(())
}

/// Builds the continuation of `code` described by `key`.
pub(crate) fn synthesize<C: SnippetCompiler + ?Sized>(
    code: &CodeUnit,
    line: u32,
    key: &ResumeKey,
    caps: &EraCapabilities,
    compiler: &C,
    config: &ResumeConfig,
) -> ResumeResult<Synthesis> {
    let unit = code.qualname();
    check_key(unit, key, caps)?;
    let mut prefix_guard_targets = Vec::new();

    let (generated, instructions) = transform_with_snapshot(code, |draft, options| {
        let target = draft
            .find_offset(key.offset())
            .ok_or_else(|| ResumeError::inconsistent(unit, format!("no instruction at offset {}", key.offset())))?;

        rewrite_signature(options, code, line, key, config);

        let mut prologue = Prologue {
            draft,
            options,
            caps,
            compiler,
            config,
            ids: Vec::new(),
            cleanup: Vec::new(),
            guards: Vec::new(),
        };
        prologue.frame_setup();
        prologue.rehydrate_stack(unit, key, &mut prefix_guard_targets)?;
        prologue.rebuild_locals(key);
        prologue.unbind_locals(key);
        let Prologue {
            draft,
            mut ids,
            cleanup,
            guards,
            ..
        } = prologue;
        ids.push(draft.push(Instruction::jump_to(target)));

        strip_lines_before(draft, target);

        if !cleanup.is_empty() {
            ids.extend(cleanup);
            ids.extend(draft.extend([
                Instruction::load_const(Constant::None),
                Instruction::count(Opcode::RaiseVarargs, 1),
            ]));
        }

        redirect_handlers(draft, &guards);

        ids.extend(draft.body().iter().copied());
        *draft.body_mut() = ids;
        Ok(())
    })?;

    Ok(Synthesis {
        unit: generated,
        instructions,
        prefix_guard_targets,
    })
}

/// Cross-field checks that need nothing but the key and the era.
fn check_key(unit: &str, key: &ResumeKey, caps: &EraCapabilities) -> ResumeResult<()> {
    if !key.unbound_locals().is_empty() && !caps.null_store() {
        return Err(ResumeError::inconsistent(
            unit,
            format!("the {} era cannot store a local as unbound", caps.era()),
        ));
    }
    if caps.structural_regions() && key.resource_targets().len() != key.reentries().len() {
        return Err(ResumeError::inconsistent(
            unit,
            format!(
                "{} re-entries but {} resource target offsets",
                key.reentries().len(),
                key.resource_targets().len()
            ),
        ));
    }
    Ok(())
}

/// Renames the unit and turns the rehydrated stack and live locals into parameters.
fn rewrite_signature(options: &mut CodeOptions, code: &CodeUnit, line: u32, key: &ResumeKey, config: &ResumeConfig) {
    options.name = config.resume_name(code.name(), line);
    options.qualname = config.resume_qualname(code.qualname(), line);
    options.first_line = line;

    let mut params: IndexSet<String> = (0..key.nstack()).map(|i| config.stack_slot(i)).collect();
    params.extend(
        key.live_locals()
            .iter()
            .filter(|name| !key.unbound_locals().contains(*name))
            .cloned(),
    );
    options.arg_count = params.len();
    options.posonly_count = 0;
    options.kwonly_count = 0;

    let mut varnames = params;
    varnames.extend(key.unbound_locals().iter().cloned());
    varnames.extend(options.varnames.iter().cloned());
    options.varnames = varnames;

    options.flags.remove(CodeFlags::VARARGS.union(CodeFlags::VARKEYWORDS));

    // cells of the root arrive through the closure
    let mut freevars: Vec<String> = options.cellvars.drain(..).chain(options.freevars.drain(..)).collect();
    freevars.sort();
    freevars.dedup();
    options.freevars = freevars;
}

/// Prologue under construction.
struct Prologue<'a, C: ?Sized> {
    draft: &'a mut Draft,
    options: &'a mut CodeOptions,
    caps: &'a EraCapabilities,
    compiler: &'a C,
    config: &'a ResumeConfig,
    ids: Vec<InstId>,
    /// Accumulated epilogues, innermost resource first.
    cleanup: Vec<InstId>,
    /// `(old handler, guard marker)` pairs for region redirection.
    guards: Vec<(InstId, InstId)>,
}

impl<C: SnippetCompiler + ?Sized> Prologue<'_, C> {
    fn emit(&mut self, insts: impl IntoIterator<Item = Instruction>) {
        let ids = self.draft.extend(insts);
        self.ids.extend(ids);
    }

    fn frame_setup(&mut self) {
        if !self.caps.frame_setup() {
            return;
        }
        if !self.options.freevars.is_empty() {
            let count = u32::try_from(self.options.freevars.len()).unwrap_or(u32::MAX);
            self.emit([Instruction::count(Opcode::CopyFreeVars, count)]);
        }
        self.emit([Instruction::count(Opcode::Resume, 0)]);
    }

    /// Loads every stack slot back, interleaving null sentinels and running the
    /// re-entry and rebuild hooks attached to each slot.
    fn rehydrate_stack(&mut self, unit: &str, key: &ResumeKey, prefix_guard_targets: &mut Vec<u32>) -> ResumeResult<()> {
        let mut hooks: BTreeMap<usize, (&ReenterWith, Option<u32>)> = BTreeMap::new();
        for (k, reentry) in key.reentries().iter().enumerate() {
            let target = key.resource_targets().get(k).copied();
            if hooks.insert(reentry.stack_index, (reentry, target)).is_some() {
                return Err(ResumeError::inconsistent(
                    unit,
                    format!("two re-entries at stack slot {}", reentry.stack_index),
                ));
            }
        }

        let nulls: Vec<usize> = key.null_slots().iter().copied().collect();
        let mut null_idx = 0;
        for i in 0..key.nstack() {
            while nulls.get(null_idx) == Some(&(i + null_idx)) {
                self.emit([Instruction::new(Opcode::PushNull)]);
                null_idx += 1;
            }
            self.emit([Instruction::load_fast(self.config.stack_slot(i))]);

            if let Some((reentry, target_offset)) = hooks.remove(&i) {
                let depth = u16::try_from(i + 1 + null_idx)
                    .map_err(|_| ResumeError::inconsistent(unit, format!("stack slot {i} is too deep")))?;
                self.reenter(unit, reentry, target_offset, depth, prefix_guard_targets)?;
            }

            if let Some(args) = key.stack_rebuilds().get(&(i + null_idx)) {
                let insts = self.caps.call_with_constants(args);
                self.emit(insts);
            }
        }
        // sentinels sitting on top of the last slot
        while nulls.get(null_idx) == Some(&(key.nstack() + null_idx)) {
            self.emit([Instruction::new(Opcode::PushNull)]);
            null_idx += 1;
        }

        if let Some(&extra) = nulls.get(null_idx) {
            return Err(ResumeError::inconsistent(
                unit,
                format!("null slot {extra} lies outside the rehydrated stack"),
            ));
        }
        if let Some(&slot) = hooks.keys().next() {
            return Err(ResumeError::inconsistent(
                unit,
                format!("re-entry at stack slot {slot} but only {} slots are rehydrated", key.nstack()),
            ));
        }
        prefix_guard_targets.reverse();
        Ok(())
    }

    fn reenter(
        &mut self,
        unit: &str,
        reentry: &ReenterWith,
        target_offset: Option<u32>,
        depth: u16,
        prefix_guard_targets: &mut Vec<u32>,
    ) -> ResumeResult<()> {
        let mut ctx = ReentryContext {
            draft: &mut *self.draft,
            options: &mut *self.options,
            caps: self.caps,
            compiler: self.compiler,
            config: self.config,
        };
        let Reentry { setup, guard } = reentry.emit(&mut ctx, depth, &mut self.cleanup)?;
        self.ids.extend(setup);

        if !self.caps.structural_regions() {
            return Ok(());
        }
        let (Some(target_offset), Some(guard)) = (target_offset, guard) else {
            return Err(ResumeError::inconsistent(
                unit,
                format!("re-entry at stack slot {} has no handler to redirect", reentry.stack_index),
            ));
        };
        let old = self.draft.find_offset(target_offset).ok_or_else(|| {
            ResumeError::inconsistent(unit, format!("no instruction at resource target offset {target_offset}"))
        })?;
        self.guards.push((old, guard));
        prefix_guard_targets.push(target_offset);
        Ok(())
    }

    fn rebuild_locals(&mut self, key: &ResumeKey) {
        for (name, args) in key.local_rebuilds() {
            let mut insts = vec![Instruction::load_fast(name.clone())];
            insts.extend(self.caps.call_with_constants(args));
            insts.push(Instruction::store_fast(name.clone()));
            self.emit(insts);
        }
    }

    fn unbind_locals(&mut self, key: &ResumeKey) {
        for name in key.unbound_locals() {
            self.emit([Instruction::new(Opcode::PushNull), Instruction::store_fast(name.clone())]);
        }
    }
}

/// Drops line and position data from the root instructions before `target`.
fn strip_lines_before(draft: &mut Draft, target: InstId) {
    let before: Vec<InstId> = draft.body().iter().copied().take_while(|id| *id != target).collect();
    for id in before {
        let inst = draft.inst_mut(id);
        inst.starts_line = None;
        inst.span = None;
    }
}

/// Points root regions that targeted a re-entered resource's handler at its guard.
fn redirect_handlers(draft: &mut Draft, guards: &[(InstId, InstId)]) {
    if guards.is_empty() {
        return;
    }
    let body = draft.body().to_vec();
    for id in body {
        if let Some(region) = &mut draft.inst_mut(id).region
            && let Some((_, guard)) = guards.iter().find(|(old, _)| *old == region.handler)
        {
            region.handler = *guard;
        }
    }
}
