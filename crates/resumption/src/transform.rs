//! Compile-and-transform primitive.
//!
//! A transform copies a unit's instructions into a private [`Draft`], lets an update
//! procedure rewrite the draft and the attribute table, and assembles the result into
//! a brand-new [`CodeUnit`]. The input unit is never touched.

use crate::{
    bytecode::{Arena, CodeOptions, CodeUnit, InstId, Instruction, InstructionStream, assemble},
    error::ResumeResult,
};

/// Exclusive, editable copy of a unit's instructions.
///
/// New fragments are allocated in the arena and spliced into `body` by handle, so
/// jump and region handles stay valid while the body is reordered.
#[derive(Debug, Clone)]
pub struct Draft {
    unit: String,
    arena: Arena,
    body: Vec<InstId>,
}

impl Draft {
    /// Starts a draft from a finished stream.
    #[must_use]
    pub fn new(unit: impl Into<String>, stream: InstructionStream) -> Self {
        let mut arena = Arena::new();
        let body = arena.adopt(stream);
        Self {
            unit: unit.into(),
            arena,
            body,
        }
    }

    /// Qualified name of the unit being transformed, for error reporting.
    #[must_use]
    pub fn unit(&self) -> &str {
        &self.unit
    }

    /// Handles of the body, in program order.
    #[must_use]
    pub fn body(&self) -> &[InstId] {
        &self.body
    }

    pub fn body_mut(&mut self) -> &mut Vec<InstId> {
        &mut self.body
    }

    /// Allocates an instruction without placing it in the body.
    pub fn push(&mut self, inst: Instruction) -> InstId {
        self.arena.push(inst)
    }

    /// Allocates a run of instructions without placing them in the body.
    pub fn extend(&mut self, insts: impl IntoIterator<Item = Instruction>) -> Vec<InstId> {
        self.arena.extend(insts)
    }

    /// Moves a compiled fragment into the arena without placing it in the body.
    pub fn adopt(&mut self, stream: InstructionStream) -> Vec<InstId> {
        self.arena.adopt(stream)
    }

    #[must_use]
    pub fn inst(&self, id: InstId) -> &Instruction {
        self.arena.get(id)
    }

    pub fn inst_mut(&mut self, id: InstId) -> &mut Instruction {
        self.arena.get_mut(id)
    }

    /// Body instruction that was assembled at `offset` in the unit being transformed.
    #[must_use]
    pub fn find_offset(&self, offset: u32) -> Option<InstId> {
        self.body
            .iter()
            .copied()
            .find(|id| self.arena.get(*id).offset == Some(offset))
    }

    /// Linearizes the body into a stream, checking that every handle resolves.
    pub fn snapshot(&self) -> ResumeResult<InstructionStream> {
        self.arena.linearize(&self.body, &self.unit)
    }
}

/// Transforms `code` through `update`, returning the new unit.
pub fn transform_code_unit<F>(code: &CodeUnit, update: F) -> ResumeResult<CodeUnit>
where
    F: FnOnce(&mut Draft, &mut CodeOptions) -> ResumeResult<()>,
{
    transform_with_snapshot(code, update).map(|(unit, _)| unit)
}

/// As [`transform_code_unit`], also returning the final stream as it was before
/// assembly: copied instructions still carry their offsets in `code`, new ones none.
pub(crate) fn transform_with_snapshot<F>(code: &CodeUnit, update: F) -> ResumeResult<(CodeUnit, InstructionStream)>
where
    F: FnOnce(&mut Draft, &mut CodeOptions) -> ResumeResult<()>,
{
    let mut options = code.options().clone();
    let mut draft = Draft::new(code.qualname(), code.instructions().clone());
    update(&mut draft, &mut options)?;
    let snapshot = draft.snapshot()?;
    let unit = assemble(options, snapshot.clone())?;
    Ok((unit, snapshot))
}
