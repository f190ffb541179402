//! Host instruction format: symbolic instructions, streams, code units and the
//! assembler that ties them together.

mod assemble;
mod builder;
mod code;
mod instruction;
mod op;
mod stream;

pub(crate) use assemble::assemble;
pub use builder::{CodeUnitBuilder, Label};
pub use code::{CodeFlags, CodeOptions, CodeUnit, ExceptionTableEntry, LineEntry};
pub use instruction::{ExceptionRegion, InstId, Instruction, SourceSpan};
pub use op::{ConstArgs, Constant, Opcode, Operand};
pub use stream::{Arena, InstructionStream};
