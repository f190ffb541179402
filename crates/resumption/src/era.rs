//! Instruction-format eras and the capability set derived from them.
//!
//! Successive generations of the host VM differ in a handful of ways that matter when
//! synthesizing a prologue: whether frames need an explicit setup marker, whether
//! exception handling is a table of structural regions or a runtime block stack,
//! whether a local can be explicitly stored as unbound, and where the null sentinel
//! of the call convention sits. The era is resolved once into an [`EraCapabilities`]
//! value and synthesis only ever asks the capability set, never the era itself.
//!
//! # Usage
//!
//! ```
//! use resumption::{CallNull, Era};
//!
//! let caps = Era::RegionTable.capabilities();
//! assert!(caps.structural_regions());
//! assert!(!caps.null_store());
//! assert_eq!(caps.call_null(), CallNull::BeforeCallable);
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::bytecode::{Constant, Instruction, Opcode};

/// Generation of the host VM instruction format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Era {
    /// Runtime block stack (`SETUP_*`/`POP_BLOCK`), no frame-setup marker.
    BlockStack,
    /// Structural exception table, frame-setup marker, `(null, callable)` calls.
    RegionTable,
    /// As `RegionTable`, plus explicit unbound-sentinel stores.
    RegionTableNullStore,
    /// As `RegionTableNullStore`, with `(callable, null)` calls.
    #[default]
    RegionTableCallableFirst,
}

impl Era {
    /// Resolves the capability set of this era.
    #[must_use]
    pub const fn capabilities(self) -> EraCapabilities {
        match self {
            Self::BlockStack => EraCapabilities {
                era: self,
                frame_setup: false,
                structural_regions: false,
                null_store: false,
                call_null: CallNull::Absent,
                fine_positions: false,
            },
            Self::RegionTable => EraCapabilities {
                era: self,
                frame_setup: true,
                structural_regions: true,
                null_store: false,
                call_null: CallNull::BeforeCallable,
                fine_positions: true,
            },
            Self::RegionTableNullStore => EraCapabilities {
                era: self,
                frame_setup: true,
                structural_regions: true,
                null_store: true,
                call_null: CallNull::BeforeCallable,
                fine_positions: true,
            },
            Self::RegionTableCallableFirst => EraCapabilities {
                era: self,
                frame_setup: true,
                structural_regions: true,
                null_store: true,
                call_null: CallNull::AfterCallable,
                fine_positions: true,
            },
        }
    }
}

impl fmt::Display for Era {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BlockStack => f.write_str("block-stack"),
            Self::RegionTable => f.write_str("region-table"),
            Self::RegionTableNullStore => f.write_str("region-table+null-store"),
            Self::RegionTableCallableFirst => f.write_str("region-table+callable-first"),
        }
    }
}

/// Where the null sentinel of the call convention goes relative to the callable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallNull {
    /// Plain `callable, args...` calls.
    Absent,
    /// `null, callable, args...`
    BeforeCallable,
    /// `callable, null, args...`
    AfterCallable,
}

/// Version-conditional behaviors of one era, resolved once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EraCapabilities {
    era: Era,
    frame_setup: bool,
    structural_regions: bool,
    null_store: bool,
    call_null: CallNull,
    fine_positions: bool,
}

impl EraCapabilities {
    #[must_use]
    pub fn era(&self) -> Era {
        self.era
    }

    /// Frames start with `RESUME`, preceded by `COPY_FREE_VARS` for closures.
    #[must_use]
    pub fn frame_setup(&self) -> bool {
        self.frame_setup
    }

    /// Exception handling is described by structural regions rather than blocks.
    #[must_use]
    pub fn structural_regions(&self) -> bool {
        self.structural_regions
    }

    /// A local can be explicitly stored as unbound with `PUSH_NULL; STORE_FAST`.
    #[must_use]
    pub fn null_store(&self) -> bool {
        self.null_store
    }

    #[must_use]
    pub fn call_null(&self) -> CallNull {
        self.call_null
    }

    /// Instructions carry column-level positions in addition to line markers.
    #[must_use]
    pub fn fine_positions(&self) -> bool {
        self.fine_positions
    }

    /// Instructions that turn the callable on TOS into a callable ready to receive
    /// positional arguments.
    #[must_use]
    pub fn prepare_call(&self) -> Vec<Instruction> {
        match self.call_null {
            CallNull::Absent => Vec::new(),
            CallNull::BeforeCallable => vec![
                Instruction::new(Opcode::PushNull),
                Instruction::count(Opcode::Swap, 2),
            ],
            CallNull::AfterCallable => vec![Instruction::new(Opcode::PushNull)],
        }
    }

    /// Call of a prepared callable with `argc` positional arguments.
    #[must_use]
    pub fn call(&self, argc: u32) -> Instruction {
        match self.call_null {
            CallNull::Absent => Instruction::count(Opcode::CallFunction, argc),
            CallNull::BeforeCallable | CallNull::AfterCallable => Instruction::count(Opcode::Call, argc),
        }
    }

    /// Call of a `(method, self)` pair pushed by `LOAD_METHOD`.
    #[must_use]
    pub fn call_method(&self, argc: u32) -> Instruction {
        match self.call_null {
            CallNull::Absent => Instruction::count(Opcode::CallMethod, argc),
            CallNull::BeforeCallable | CallNull::AfterCallable => Instruction::count(Opcode::Call, argc),
        }
    }

    /// Calls the callable on TOS with literal arguments.
    #[must_use]
    pub fn call_with_constants(&self, args: &[Constant]) -> Vec<Instruction> {
        let mut insts = self.prepare_call();
        insts.extend(args.iter().cloned().map(Instruction::load_const));
        insts.push(self.call(argument_count(args.len())));
        insts
    }
}

/// Call argument count, saturated to the operand width.
fn argument_count(len: usize) -> u32 {
    u32::try_from(len).unwrap_or(u32::MAX)
}
