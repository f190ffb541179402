//! Symbolic instructions and the handles that link them.

use std::fmt;

use super::op::{Constant, Opcode, Operand};

/// Stable handle to an instruction.
///
/// Inside an [`InstructionStream`](super::InstructionStream) the handle is the
/// instruction's position; inside an [`Arena`](super::Arena) it is the arena slot.
/// Handles are plain values: copying an instruction never aliases another one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstId(u32);

impl InstId {
    pub(crate) fn new(index: usize) -> Self {
        Self(u32::try_from(index).expect("instruction index exceeds u32"))
    }

    /// Returns the raw index value.
    #[inline]
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }

    #[must_use]
    pub(crate) fn shifted(self, base: usize) -> Self {
        Self::new(self.index() + base)
    }
}

/// Exception region an instruction belongs to.
///
/// Structural eras turn runs of instructions sharing a region into exception-table
/// entries. `depth` is the evaluation stack depth the handler unwinds to, `lasti`
/// marks handlers that also receive the offset of the raising instruction (one
/// extra stack slot).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExceptionRegion {
    pub start: InstId,
    pub end: InstId,
    pub handler: InstId,
    pub depth: u16,
    pub lasti: bool,
}

impl ExceptionRegion {
    fn map_handles(&mut self, mut f: impl FnMut(InstId) -> InstId) {
        self.start = f(self.start);
        self.end = f(self.end);
        self.handler = f(self.handler);
    }
}

/// Column-level source position, tracked by eras with fine positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceSpan {
    pub line: u32,
    pub end_line: u32,
    pub col: u16,
    pub end_col: u16,
}

/// One symbolic instruction.
///
/// `offset` and `arg` are assigned by the assembler; instructions synthesized
/// during a transform carry `None` until the new unit is assembled.
#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    pub opcode: Opcode,
    pub operand: Operand,
    pub arg: Option<u32>,
    pub offset: Option<u32>,
    pub target: Option<InstId>,
    pub starts_line: Option<u32>,
    pub span: Option<SourceSpan>,
    pub region: Option<ExceptionRegion>,
}

impl Instruction {
    /// Creates an instruction without operand.
    #[must_use]
    pub fn new(opcode: Opcode) -> Self {
        Self::with_operand(opcode, Operand::None)
    }

    #[must_use]
    pub fn with_operand(opcode: Opcode, operand: Operand) -> Self {
        Self {
            opcode,
            operand,
            arg: None,
            offset: None,
            target: None,
            starts_line: None,
            span: None,
            region: None,
        }
    }

    #[must_use]
    pub fn count(opcode: Opcode, n: u32) -> Self {
        Self::with_operand(opcode, Operand::Count(n))
    }

    #[must_use]
    pub fn load_const(value: Constant) -> Self {
        Self::with_operand(Opcode::LoadConst, Operand::Const(value))
    }

    #[must_use]
    pub fn load_fast(name: impl Into<String>) -> Self {
        Self::with_operand(Opcode::LoadFast, Operand::Local(name.into()))
    }

    #[must_use]
    pub fn store_fast(name: impl Into<String>) -> Self {
        Self::with_operand(Opcode::StoreFast, Operand::Local(name.into()))
    }

    /// Unconditional jump to `target`.
    #[must_use]
    pub fn jump_to(target: InstId) -> Self {
        Self {
            target: Some(target),
            ..Self::new(Opcode::Jump)
        }
    }

    /// Replaces the operation in place, keeping position, line and region data so
    /// handles pointing at this instruction stay valid.
    pub fn overwrite(&mut self, opcode: Opcode) {
        self.opcode = opcode;
        self.operand = Operand::None;
        self.arg = None;
        self.target = None;
    }

    /// Applies `f` to every handle this instruction holds.
    pub(crate) fn map_handles(&mut self, mut f: impl FnMut(InstId) -> InstId) {
        if let Some(target) = self.target {
            self.target = Some(f(target));
        }
        if let Some(region) = &mut self.region {
            region.map_handles(&mut f);
        }
    }

    /// Applies a fallible `f` to every handle this instruction holds.
    pub(crate) fn try_map_handles<E>(&mut self, mut f: impl FnMut(InstId) -> Result<InstId, E>) -> Result<(), E> {
        if let Some(target) = self.target {
            self.target = Some(f(target)?);
        }
        if let Some(region) = &mut self.region {
            region.start = f(region.start)?;
            region.end = f(region.end)?;
            region.handler = f(region.handler)?;
        }
        Ok(())
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.offset {
            Some(offset) => write!(f, "{offset:>5} ")?,
            None => f.write_str("    - ")?,
        }
        let name: &'static str = self.opcode.into();
        write!(f, "{name:<18} {}", self.operand)?;
        if let Some(target) = self.target {
            write!(f, " -> #{}", target.index())?;
        }
        Ok(())
    }
}
