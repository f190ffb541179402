//! Instruction containers.
//!
//! An [`InstructionStream`] is a finished, program-ordered sequence in which every
//! handle is a position. An [`Arena`] is the editing area used while a stream is
//! being rewritten: fragments are spliced by handle lists and only turned back into
//! a stream (with handles renumbered to positions) once the final order is known.

use std::fmt;

use super::instruction::{InstId, Instruction};
use crate::error::{ResumeError, ResumeResult};

/// Ordered instruction sequence whose handles are positions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InstructionStream {
    insts: Vec<Instruction>,
}

impl InstructionStream {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps a program-ordered vector whose handles already index into it.
    #[must_use]
    pub fn from_vec(insts: Vec<Instruction>) -> Self {
        Self { insts }
    }

    /// Appends an instruction, returning its handle.
    pub fn push(&mut self, inst: Instruction) -> InstId {
        let id = InstId::new(self.insts.len());
        self.insts.push(inst);
        id
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.insts.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.insts.is_empty()
    }

    #[must_use]
    pub fn get(&self, id: InstId) -> Option<&Instruction> {
        self.insts.get(id.index())
    }

    pub fn get_mut(&mut self, id: InstId) -> Option<&mut Instruction> {
        self.insts.get_mut(id.index())
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Instruction> {
        self.insts.iter()
    }

    #[must_use]
    pub fn as_slice(&self) -> &[Instruction] {
        &self.insts
    }

    #[must_use]
    pub fn into_vec(self) -> Vec<Instruction> {
        self.insts
    }

    /// Handle of the instruction assembled at byte `offset`, if any.
    #[must_use]
    pub fn find_offset(&self, offset: u32) -> Option<InstId> {
        self.insts
            .iter()
            .position(|inst| inst.offset == Some(offset))
            .map(InstId::new)
    }

    /// Checks that every jump target and region handle points inside the stream.
    pub fn validate(&self, unit: &str) -> ResumeResult<()> {
        let len = self.insts.len();
        for (pos, inst) in self.insts.iter().enumerate() {
            let mut handles = inst.target.into_iter().collect::<Vec<_>>();
            if let Some(region) = inst.region {
                handles.extend([region.start, region.end, region.handler]);
            }
            if let Some(bad) = handles.into_iter().find(|h| h.index() >= len) {
                return Err(ResumeError::inconsistent(
                    unit,
                    format!("instruction #{pos} references #{} outside the stream", bad.index()),
                ));
            }
        }
        Ok(())
    }
}

impl<'a> IntoIterator for &'a InstructionStream {
    type Item = &'a Instruction;
    type IntoIter = std::slice::Iter<'a, Instruction>;

    fn into_iter(self) -> Self::IntoIter {
        self.insts.iter()
    }
}

impl fmt::Display for InstructionStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (pos, inst) in self.insts.iter().enumerate() {
            let line = inst.starts_line.map(|l| l.to_string()).unwrap_or_default();
            writeln!(f, "{line:>4} #{pos:<4}{inst}")?;
        }
        Ok(())
    }
}

/// Editing area for instruction rewriting.
///
/// Instructions are never removed from an arena, so a handle stays valid for the
/// arena's whole life no matter how fragments are later ordered.
#[derive(Debug, Clone, Default)]
pub struct Arena {
    insts: Vec<Instruction>,
}

impl Arena {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a new instruction.
    pub fn push(&mut self, inst: Instruction) -> InstId {
        let id = InstId::new(self.insts.len());
        self.insts.push(inst);
        id
    }

    /// Allocates a run of instructions, returning their handles in order.
    pub fn extend(&mut self, insts: impl IntoIterator<Item = Instruction>) -> Vec<InstId> {
        insts.into_iter().map(|inst| self.push(inst)).collect()
    }

    /// Moves a finished stream into the arena, rebasing its internal handles.
    ///
    /// Returns the adopted instructions' handles in program order.
    pub fn adopt(&mut self, stream: InstructionStream) -> Vec<InstId> {
        let base = self.insts.len();
        stream
            .into_vec()
            .into_iter()
            .map(|mut inst| {
                inst.map_handles(|id| id.shifted(base));
                self.push(inst)
            })
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.insts.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.insts.is_empty()
    }

    /// # Panics
    ///
    /// Panics if `id` was not allocated by this arena.
    #[must_use]
    pub fn get(&self, id: InstId) -> &Instruction {
        &self.insts[id.index()]
    }

    /// # Panics
    ///
    /// Panics if `id` was not allocated by this arena.
    pub fn get_mut(&mut self, id: InstId) -> &mut Instruction {
        &mut self.insts[id.index()]
    }

    /// Produces a stream holding the instructions of `order`, in that order.
    ///
    /// Every handle must point at an instruction that is part of `order`, and no
    /// instruction may appear twice; otherwise the splice is inconsistent.
    pub fn linearize(&self, order: &[InstId], unit: &str) -> ResumeResult<InstructionStream> {
        let mut position: Vec<Option<InstId>> = vec![None; self.insts.len()];
        for (pos, id) in order.iter().enumerate() {
            let slot = position
                .get_mut(id.index())
                .ok_or_else(|| ResumeError::inconsistent(unit, format!("unknown handle #{}", id.index())))?;
            if slot.is_some() {
                return Err(ResumeError::inconsistent(
                    unit,
                    format!("handle #{} spliced twice", id.index()),
                ));
            }
            *slot = Some(InstId::new(pos));
        }

        let mut out = Vec::with_capacity(order.len());
        for id in order {
            let mut inst = self.get(*id).clone();
            inst.try_map_handles(|h| {
                position.get(h.index()).copied().flatten().ok_or_else(|| {
                    ResumeError::inconsistent(
                        unit,
                        format!("{} references an instruction outside the stream", self.get(*id).opcode),
                    )
                })
            })?;
            out.push(inst);
        }
        Ok(InstructionStream::from_vec(out))
    }
}
