//! Assembler: turns a symbolic instruction stream into a [`CodeUnit`].
//!
//! Assembly resolves operands against the unit's name tables, assigns byte offsets,
//! rebuilds the exception and line tables and runs a flow analysis that computes the
//! maximum stack depth. Any handle or name that does not resolve is reported as a
//! structural inconsistency rather than silently encoded.

use indexmap::IndexSet;

use super::{
    code::{CodeOptions, CodeUnit, ExceptionTableEntry, LineEntry},
    instruction::{ExceptionRegion, InstId, Instruction},
    op::{Constant, Operand},
    stream::InstructionStream,
};
use crate::error::{ResumeError, ResumeResult};

/// Number of `EXTENDED_ARG` prefixes needed to encode `arg`.
pub(crate) fn extended_arg_count(arg: u32) -> u32 {
    match arg {
        0..=0xff => 0,
        0x100..=0xffff => 1,
        0x1_0000..=0xff_ffff => 2,
        _ => 3,
    }
}

/// Assembles `stream` under `options` into a new unit.
pub(crate) fn assemble(mut options: CodeOptions, stream: InstructionStream) -> ResumeResult<CodeUnit> {
    let unit = options.qualname.clone();
    stream.validate(&unit)?;
    let caps = options.era.capabilities();
    let mut insts = stream.into_vec();

    let mut consts: IndexSet<Constant> = IndexSet::new();
    for inst in &mut insts {
        if !caps.fine_positions() {
            inst.span = None;
        }
        inst.arg = resolve_operand(&mut options, &mut consts, inst, &unit)?;
    }

    let words = assign_offsets(&mut insts, &unit)?;
    let exception_table = build_exception_table(&insts, &words, caps.structural_regions(), &unit)?;
    let line_table = build_line_table(&insts);
    let max_stack_depth = analyze_flow(&insts, caps.structural_regions(), &unit)?;

    Ok(CodeUnit {
        options,
        consts: consts.into_iter().collect(),
        instructions: InstructionStream::from_vec(insts),
        exception_table,
        line_table,
        max_stack_depth,
    })
}

fn to_arg(index: usize, unit: &str) -> ResumeResult<u32> {
    u32::try_from(index).map_err(|_| ResumeError::inconsistent(unit, format!("table index {index} exceeds u32")))
}

fn resolve_operand(
    options: &mut CodeOptions,
    consts: &mut IndexSet<Constant>,
    inst: &Instruction,
    unit: &str,
) -> ResumeResult<Option<u32>> {
    let index = match &inst.operand {
        Operand::None => return Ok(None),
        Operand::Count(n) => return Ok(Some(*n)),
        Operand::Const(value) => consts.insert_full(value.clone()).0,
        Operand::Local(name) => options.varnames.get_index_of(name.as_str()).ok_or_else(|| {
            ResumeError::inconsistent(unit, format!("{} of undeclared local `{name}`", inst.opcode))
        })?,
        Operand::Name(name) => options.names.insert_full(name.clone()).0,
        Operand::Deref(name) => options
            .cellvars
            .iter()
            .chain(&options.freevars)
            .position(|n| n == name)
            .ok_or_else(|| {
                ResumeError::inconsistent(unit, format!("{} of undeclared cell or free variable `{name}`", inst.opcode))
            })?,
    };
    to_arg(index, unit).map(Some)
}

/// Assigns byte offsets and jump arguments, returning each instruction's size in
/// words.
///
/// Jump arguments depend on offsets and offsets depend on argument widths, so sizes
/// are grown until nothing changes. Sizes only ever grow, which bounds the loop.
fn assign_offsets(insts: &mut [Instruction], unit: &str) -> ResumeResult<Vec<u32>> {
    let mut words: Vec<u32> = insts
        .iter()
        .map(|inst| 1 + inst.arg.map_or(0, extended_arg_count))
        .collect();
    loop {
        let mut starts = Vec::with_capacity(insts.len());
        let mut word = 0u32;
        for size in &words {
            starts.push(word);
            word = word
                .checked_add(*size)
                .ok_or_else(|| ResumeError::inconsistent(unit, "instruction stream too long"))?;
        }

        let mut changed = false;
        for (pos, inst) in insts.iter_mut().enumerate() {
            inst.offset = Some(starts[pos] * 2);
            if let Some(target) = inst.target {
                let arg = starts[target.index()];
                inst.arg = Some(arg);
                let needed = 1 + extended_arg_count(arg);
                if needed > words[pos] {
                    words[pos] = needed;
                    changed = true;
                }
            }
        }
        if !changed {
            return Ok(words);
        }
    }
}

fn offset_of(insts: &[Instruction], id: InstId) -> u32 {
    insts[id.index()].offset.unwrap_or_default()
}

fn build_exception_table(
    insts: &[Instruction],
    words: &[u32],
    structural: bool,
    unit: &str,
) -> ResumeResult<Vec<ExceptionTableEntry>> {
    let mut table: Vec<ExceptionTableEntry> = Vec::new();
    let mut current: Option<ExceptionRegion> = None;
    for (pos, inst) in insts.iter().enumerate() {
        let Some(region) = inst.region else {
            current = None;
            continue;
        };
        if !structural {
            return Err(ResumeError::inconsistent(
                unit,
                format!("{} carries an exception region in a block-stack era", inst.opcode),
            ));
        }
        let start = inst.offset.unwrap_or_default();
        let end = start + words[pos] * 2;
        match table.last_mut() {
            Some(entry) if current == Some(region) => entry.end = end,
            _ => table.push(ExceptionTableEntry {
                start,
                end,
                target: offset_of(insts, region.handler),
                depth: region.depth,
                lasti: region.lasti,
            }),
        }
        current = Some(region);
    }
    Ok(table)
}

fn build_line_table(insts: &[Instruction]) -> Vec<LineEntry> {
    let mut table: Vec<LineEntry> = Vec::new();
    for inst in insts {
        let Some(line) = inst.starts_line else { continue };
        if table.last().is_some_and(|entry| entry.line == line) {
            continue;
        }
        table.push(LineEntry {
            offset: inst.offset.unwrap_or_default(),
            line,
        });
    }
    table
}

/// Walks every reachable path from the entry point, returning the maximum stack
/// depth. A reachable path that runs past the last instruction is rejected.
fn analyze_flow(insts: &[Instruction], structural: bool, unit: &str) -> ResumeResult<u32> {
    if insts.is_empty() {
        return Err(ResumeError::inconsistent(unit, "empty instruction stream"));
    }
    let mut depths: Vec<Option<i64>> = vec![None; insts.len()];
    let mut worklist: Vec<(usize, i64)> = vec![(0, 0)];
    let mut max_depth = 0i64;

    while let Some((pos, depth)) = worklist.pop() {
        if depths[pos].is_some() {
            continue;
        }
        depths[pos] = Some(depth);
        max_depth = max_depth.max(depth);
        let inst = &insts[pos];
        let arg = inst.arg.unwrap_or(0);

        if structural && let Some(region) = inst.region {
            let entry = i64::from(region.depth) + 1 + i64::from(region.lasti);
            worklist.push((region.handler.index(), entry));
        }

        let mut follow = |to: usize, effect: i64| -> ResumeResult<()> {
            let next = depth + effect;
            if next < 0 {
                return Err(ResumeError::inconsistent(
                    unit,
                    format!("stack underflow at {} (instruction #{pos})", inst.opcode),
                ));
            }
            max_depth = max_depth.max(next);
            worklist.push((to, next));
            Ok(())
        };

        if let Some(target) = inst.target {
            follow(target.index(), inst.opcode.stack_effect(arg, true))?;
        }
        if !inst.opcode.is_terminal() {
            if pos + 1 == insts.len() {
                return Err(ResumeError::inconsistent(
                    unit,
                    format!("execution falls off the end after {}", inst.opcode),
                ));
            }
            follow(pos + 1, inst.opcode.stack_effect(arg, false))?;
        }
    }
    u32::try_from(max_depth).map_err(|_| ResumeError::inconsistent(unit, "stack depth exceeds u32"))
}
