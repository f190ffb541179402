//! Code units: assembled, immutable executable units.

use std::fmt;

use indexmap::IndexSet;
use serde::{Deserialize, Serialize};

use super::{Constant, InstructionStream, Opcode};
use crate::era::Era;

/// Code flag word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct CodeFlags(u32);

impl CodeFlags {
    pub const OPTIMIZED: Self = Self(0x0001);
    pub const NEW_LOCALS: Self = Self(0x0002);
    pub const VARARGS: Self = Self(0x0004);
    pub const VARKEYWORDS: Self = Self(0x0008);
    pub const NESTED: Self = Self(0x0010);
    pub const GENERATOR: Self = Self(0x0020);
    pub const NOFREE: Self = Self(0x0040);
    pub const COROUTINE: Self = Self(0x0080);
    pub const ITERABLE_COROUTINE: Self = Self(0x0100);
    pub const ASYNC_GENERATOR: Self = Self(0x0200);

    /// Any flag marking a unit whose frames can suspend.
    pub const GENERATOR_LIKE: Self =
        Self(Self::GENERATOR.0 | Self::COROUTINE.0 | Self::ITERABLE_COROUTINE.0 | Self::ASYNC_GENERATOR.0);

    /// Flags of an ordinary optimized function.
    #[must_use]
    pub const fn function() -> Self {
        Self(Self::OPTIMIZED.0 | Self::NEW_LOCALS.0)
    }

    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Whether every flag in `other` is set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether any flag in `other` is set.
    #[must_use]
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }

    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

/// Mutable attribute table of a unit, edited by transforms.
///
/// Parameters are the first `arg_count` entries of `varnames`.
#[derive(Debug, Clone, PartialEq)]
pub struct CodeOptions {
    pub name: String,
    pub qualname: String,
    pub first_line: u32,
    pub arg_count: usize,
    pub posonly_count: usize,
    pub kwonly_count: usize,
    pub varnames: IndexSet<String>,
    pub cellvars: Vec<String>,
    pub freevars: Vec<String>,
    pub names: IndexSet<String>,
    pub flags: CodeFlags,
    pub era: Era,
}

impl CodeOptions {
    /// Options of an empty optimized function called `name`.
    #[must_use]
    pub fn new(name: impl Into<String>, era: Era) -> Self {
        let name = name.into();
        Self {
            qualname: name.clone(),
            name,
            first_line: 1,
            arg_count: 0,
            posonly_count: 0,
            kwonly_count: 0,
            varnames: IndexSet::new(),
            cellvars: Vec::new(),
            freevars: Vec::new(),
            names: IndexSet::new(),
            flags: CodeFlags::function(),
            era,
        }
    }
}

/// One entry of a structural exception table. Offsets are in bytes; `end` is
/// exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExceptionTableEntry {
    pub start: u32,
    pub end: u32,
    pub target: u32,
    pub depth: u16,
    pub lasti: bool,
}

impl fmt::Display for ExceptionTableEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} to {} -> {} [{}]", self.start, self.end, self.target, self.depth)?;
        if self.lasti {
            f.write_str(" lasti")?;
        }
        Ok(())
    }
}

/// Maps the instruction at `offset` (and those after it) to source `line`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LineEntry {
    pub offset: u32,
    pub line: u32,
}

/// Immutable compiled executable unit.
///
/// Created only by the assembler, through [`CodeUnitBuilder`](super::CodeUnitBuilder)
/// or [`transform_code_unit`](crate::transform_code_unit); a transform always produces
/// a new unit. Units are shared as `Rc<CodeUnit>` and their identity is the
/// allocation.
#[derive(Debug, Clone, PartialEq)]
pub struct CodeUnit {
    pub(crate) options: CodeOptions,
    pub(crate) consts: Vec<Constant>,
    pub(crate) instructions: InstructionStream,
    pub(crate) exception_table: Vec<ExceptionTableEntry>,
    pub(crate) line_table: Vec<LineEntry>,
    pub(crate) max_stack_depth: u32,
}

impl CodeUnit {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.options.name
    }

    #[must_use]
    pub fn qualname(&self) -> &str {
        &self.options.qualname
    }

    #[must_use]
    pub fn first_line(&self) -> u32 {
        self.options.first_line
    }

    #[must_use]
    pub fn arg_count(&self) -> usize {
        self.options.arg_count
    }

    /// Declared parameter names, in call order.
    pub fn params(&self) -> impl Iterator<Item = &str> {
        self.options.varnames.iter().take(self.options.arg_count).map(String::as_str)
    }

    #[must_use]
    pub fn varnames(&self) -> &IndexSet<String> {
        &self.options.varnames
    }

    #[must_use]
    pub fn cellvars(&self) -> &[String] {
        &self.options.cellvars
    }

    #[must_use]
    pub fn freevars(&self) -> &[String] {
        &self.options.freevars
    }

    #[must_use]
    pub fn names(&self) -> &IndexSet<String> {
        &self.options.names
    }

    #[must_use]
    pub fn consts(&self) -> &[Constant] {
        &self.consts
    }

    #[must_use]
    pub fn flags(&self) -> CodeFlags {
        self.options.flags
    }

    #[must_use]
    pub fn era(&self) -> Era {
        self.options.era
    }

    /// The attribute table, as a transform would start from.
    #[must_use]
    pub fn options(&self) -> &CodeOptions {
        &self.options
    }

    /// Assembled instructions; every instruction carries its byte offset.
    #[must_use]
    pub fn instructions(&self) -> &InstructionStream {
        &self.instructions
    }

    #[must_use]
    pub fn exception_table(&self) -> &[ExceptionTableEntry] {
        &self.exception_table
    }

    #[must_use]
    pub fn line_table(&self) -> &[LineEntry] {
        &self.line_table
    }

    #[must_use]
    pub fn max_stack_depth(&self) -> u32 {
        self.max_stack_depth
    }

    /// Source line of the instruction at `offset`, from the line table.
    #[must_use]
    pub fn line_for_offset(&self, offset: u32) -> Option<u32> {
        self.line_table
            .iter()
            .take_while(|entry| entry.offset <= offset)
            .last()
            .map(|entry| entry.line)
    }

    /// Encodes the unit as wordcode: one `(opcode, arg byte)` pair per word, with
    /// `EXTENDED_ARG` prefixes carrying the high bytes of wide arguments.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.instructions.len() * 2);
        for inst in &self.instructions {
            let arg = inst.arg.unwrap_or(0);
            let prefixes = super::assemble::extended_arg_count(arg);
            for shift in (1..=prefixes).rev() {
                bytes.push(Opcode::ExtendedArg as u8);
                bytes.push(((arg >> (8 * shift)) & 0xff) as u8);
            }
            bytes.push(inst.opcode as u8);
            bytes.push((arg & 0xff) as u8);
        }
        bytes
    }
}

impl fmt::Display for CodeUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "code {} (line {}, params: {})",
            self.qualname(),
            self.first_line(),
            self.params().collect::<Vec<_>>().join(", ")
        )?;
        write!(f, "{}", self.instructions)?;
        if !self.exception_table.is_empty() {
            writeln!(f, "exception table:")?;
            for entry in &self.exception_table {
                writeln!(f, "  {entry}")?;
            }
        }
        Ok(())
    }
}
