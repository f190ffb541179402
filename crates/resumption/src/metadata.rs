//! Lineage records of generated units.
//!
//! Every generated unit remembers its root and the stream it was assembled from.
//! Copied root instructions in that stream still carry their root offsets, so a
//! request against the generated unit can be moved back into root offsets without
//! ever building on the generated unit itself.

use std::{
    cell::OnceCell,
    rc::{Rc, Weak},
};

use ahash::AHashMap;

use crate::{
    bytecode::{CodeUnit, InstructionStream, Opcode},
    error::{ResumeError, ResumeResult},
};

/// Lineage record of one generated unit.
#[derive(Debug)]
pub(crate) struct ResumeMetadata {
    root: Weak<CodeUnit>,
    instructions: InstructionStream,
    prefix_guard_targets: Vec<u32>,
    remap: OnceCell<OffsetRemap>,
}

/// Offset tables from a generated unit into its root, built on first use.
#[derive(Debug, Default)]
struct OffsetRemap {
    /// Generated offset of a copied root instruction to its root offset.
    offsets: AHashMap<u32, u32>,
    /// Generated offset of a guard marker to the root handler it replaced.
    guards: AHashMap<u32, u32>,
}

impl ResumeMetadata {
    pub(crate) fn new(root: &Rc<CodeUnit>, instructions: InstructionStream, prefix_guard_targets: Vec<u32>) -> Self {
        Self {
            root: Rc::downgrade(root),
            instructions,
            prefix_guard_targets,
            remap: OnceCell::new(),
        }
    }

    /// The root unit, if it is still alive.
    pub(crate) fn root(&self) -> Option<Rc<CodeUnit>> {
        self.root.upgrade()
    }

    /// Root offset of the instruction at `offset` in `generated`.
    pub(crate) fn root_offset(&self, generated: &CodeUnit, offset: u32) -> ResumeResult<u32> {
        self.remap(generated).offsets.get(&offset).copied().ok_or_else(|| {
            ResumeError::inconsistent(
                generated.qualname(),
                format!("offset {offset} has no counterpart in the root unit"),
            )
        })
    }

    /// Root handler offset of a resource whose handler sits at `offset` in
    /// `generated`: either one of the guards the prologue synthesized, or a handler
    /// copied from the root.
    pub(crate) fn root_resource_target(&self, generated: &CodeUnit, offset: u32) -> ResumeResult<u32> {
        let remap = self.remap(generated);
        remap
            .guards
            .get(&offset)
            .or_else(|| remap.offsets.get(&offset))
            .copied()
            .ok_or_else(|| {
                ResumeError::inconsistent(
                    generated.qualname(),
                    format!("resource target offset {offset} has no counterpart in the root unit"),
                )
            })
    }

    fn remap(&self, generated: &CodeUnit) -> &OffsetRemap {
        self.remap.get_or_init(|| {
            let mut remap = OffsetRemap::default();

            // a generation only prepends, so the two streams agree from the end
            for (new, old) in generated.instructions().iter().rev().zip(self.instructions.iter().rev()) {
                if let (Some(new_offset), Some(old_offset)) = (new.offset, old.offset)
                    && new.opcode == old.opcode
                {
                    remap.offsets.insert(new_offset, old_offset);
                }
            }

            let guards = generated
                .instructions()
                .iter()
                .filter(|inst| inst.opcode == Opcode::PushExcInfo)
                .filter_map(|inst| inst.offset);
            for (guard, target) in guards.zip(&self.prefix_guard_targets) {
                remap.guards.insert(guard, *target);
            }
            remap
        })
    }
}
