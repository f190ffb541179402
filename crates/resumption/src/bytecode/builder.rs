//! Builder for emitting symbolic instructions.
//!
//! `CodeUnitBuilder` provides methods for emitting opcodes with operands, resolving
//! forward and backward jumps through labels, scoping exception regions and tracking
//! source lines. Offsets, tables and stack depth are left to the assembler.

use super::{
    assemble::assemble,
    code::{CodeFlags, CodeOptions, CodeUnit},
    instruction::{ExceptionRegion, InstId, Instruction, SourceSpan},
    op::{Constant, Opcode, Operand},
    stream::InstructionStream,
};
use crate::{
    era::Era,
    error::{ResumeError, ResumeResult},
};

/// A jump destination that may be bound before or after the jumps using it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(usize);

/// An exception region scope opened by [`CodeUnitBuilder::begin_region`].
#[derive(Debug)]
struct RegionScope {
    handler: Label,
    depth: u16,
    lasti: bool,
    start: Option<usize>,
    end: Option<usize>,
}

/// Builder for code units and snippet streams.
///
/// # Usage
///
/// ```
/// use resumption::{CodeUnitBuilder, Era, Opcode};
///
/// let mut builder = CodeUnitBuilder::new("f", Era::BlockStack);
/// builder.param("x");
/// builder.set_line(1);
/// let done = builder.new_label();
/// builder.emit_load_fast("x");
/// builder.emit_jump(Opcode::PopJumpIfFalse, done);
/// builder.emit_load_fast("x");
/// builder.emit(Opcode::ReturnValue);
/// builder.bind(done);
/// builder.emit_const(resumption::Constant::None);
/// builder.emit(Opcode::ReturnValue);
/// let code = builder.build().unwrap();
/// assert_eq!(code.params().collect::<Vec<_>>(), vec!["x"]);
/// ```
#[derive(Debug)]
pub struct CodeUnitBuilder {
    options: CodeOptions,

    /// Instructions in emission order.
    insts: Vec<Instruction>,

    /// Jump label of each instruction that has one, resolved at build time.
    jump_labels: Vec<Option<Label>>,

    /// Region scope index of each instruction (innermost open scope at emission).
    region_scopes: Vec<Option<usize>>,

    /// Bound position of each label.
    labels: Vec<Option<usize>>,

    /// Labels bound to the next emitted instruction.
    pending_labels: Vec<Label>,

    regions: Vec<RegionScope>,

    /// Currently open region scopes, innermost last.
    open_regions: Vec<usize>,

    current_line: Option<u32>,
    last_marked_line: Option<u32>,
    current_span: Option<SourceSpan>,
}

impl CodeUnitBuilder {
    /// Creates a builder for an optimized function called `name`.
    #[must_use]
    pub fn new(name: impl Into<String>, era: Era) -> Self {
        Self {
            options: CodeOptions::new(name, era),
            insts: Vec::new(),
            jump_labels: Vec::new(),
            region_scopes: Vec::new(),
            labels: Vec::new(),
            pending_labels: Vec::new(),
            regions: Vec::new(),
            open_regions: Vec::new(),
            current_line: None,
            last_marked_line: None,
            current_span: None,
        }
    }

    // ========================================================================
    // Declarations
    // ========================================================================

    /// Declares a positional parameter.
    ///
    /// Parameters always precede other locals in the local-name table, whatever the
    /// declaration order.
    pub fn param(&mut self, name: impl Into<String>) -> &mut Self {
        let (index, _) = self.options.varnames.insert_full(name.into());
        if index >= self.options.arg_count {
            self.options.varnames.move_index(index, self.options.arg_count);
            self.options.arg_count += 1;
        }
        self
    }

    /// Declares a local variable.
    pub fn local(&mut self, name: impl Into<String>) -> &mut Self {
        self.options.varnames.insert(name.into());
        self
    }

    pub fn cellvar(&mut self, name: impl Into<String>) -> &mut Self {
        self.options.cellvars.push(name.into());
        self
    }

    pub fn freevar(&mut self, name: impl Into<String>) -> &mut Self {
        self.options.freevars.push(name.into());
        self
    }

    /// Replaces the flag word.
    pub fn flags(&mut self, flags: CodeFlags) -> &mut Self {
        self.options.flags = flags;
        self
    }

    pub fn first_line(&mut self, line: u32) -> &mut Self {
        self.options.first_line = line;
        self
    }

    pub fn qualname(&mut self, qualname: impl Into<String>) -> &mut Self {
        self.options.qualname = qualname.into();
        self
    }

    // ========================================================================
    // Source positions
    // ========================================================================

    /// Sets the source line of subsequent instructions.
    ///
    /// Only the first instruction emitted on a new line carries the line marker.
    pub fn set_line(&mut self, line: u32) {
        self.current_line = Some(line);
    }

    /// Sets the column-level span of subsequent instructions.
    pub fn set_span(&mut self, span: SourceSpan) {
        self.current_line = Some(span.line);
        self.current_span = Some(span);
    }

    // ========================================================================
    // Emission
    // ========================================================================

    /// Emits an instruction without operand.
    pub fn emit(&mut self, op: Opcode) -> InstId {
        self.push(Instruction::new(op), None)
    }

    /// Emits an instruction with a literal numeric argument.
    pub fn emit_arg(&mut self, op: Opcode, arg: u32) -> InstId {
        self.push(Instruction::count(op, arg), None)
    }

    pub fn emit_const(&mut self, value: Constant) -> InstId {
        self.push(Instruction::load_const(value), None)
    }

    /// Emits `LOAD_FAST`, declaring the local if needed.
    pub fn emit_load_fast(&mut self, name: impl Into<String>) -> InstId {
        let name = name.into();
        self.options.varnames.insert(name.clone());
        self.push(Instruction::load_fast(name), None)
    }

    /// Emits `STORE_FAST`, declaring the local if needed.
    pub fn emit_store_fast(&mut self, name: impl Into<String>) -> InstId {
        let name = name.into();
        self.options.varnames.insert(name.clone());
        self.push(Instruction::store_fast(name), None)
    }

    /// Emits an instruction addressing the global/attribute name table.
    pub fn emit_name(&mut self, op: Opcode, name: impl Into<String>) -> InstId {
        self.push(Instruction::with_operand(op, Operand::Name(name.into())), None)
    }

    /// Emits an instruction addressing a cell or free variable.
    pub fn emit_deref(&mut self, op: Opcode, name: impl Into<String>) -> InstId {
        self.push(Instruction::with_operand(op, Operand::Deref(name.into())), None)
    }

    /// Emits a jump (or block setup) instruction targeting `label`.
    pub fn emit_jump(&mut self, op: Opcode, label: Label) -> InstId {
        debug_assert!(op.has_target(), "{op} does not take a jump target");
        self.push(Instruction::new(op), Some(label))
    }

    /// Emits a pre-built instruction. Its handles are ignored; use labels for jumps.
    pub fn emit_instruction(&mut self, mut inst: Instruction) -> InstId {
        inst.target = None;
        inst.region = None;
        self.push(inst, None)
    }

    /// Creates a new, unbound label.
    #[must_use]
    pub fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    /// Binds `label` to the next emitted instruction.
    pub fn bind(&mut self, label: Label) {
        self.pending_labels.push(label);
    }

    /// Opens an exception region scope whose handler is `handler`.
    ///
    /// Scopes nest; an instruction belongs to the innermost open scope only.
    pub fn begin_region(&mut self, handler: Label, depth: u16, lasti: bool) {
        self.regions.push(RegionScope {
            handler,
            depth,
            lasti,
            start: None,
            end: None,
        });
        self.open_regions.push(self.regions.len() - 1);
    }

    /// Closes the innermost open region scope.
    ///
    /// # Panics
    ///
    /// Panics if no scope is open.
    pub fn end_region(&mut self) {
        self.open_regions.pop().expect("end_region without begin_region");
    }

    /// Number of instructions emitted so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.insts.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.insts.is_empty()
    }

    fn push(&mut self, mut inst: Instruction, jump: Option<Label>) -> InstId {
        let pos = self.insts.len();
        for label in self.pending_labels.drain(..) {
            self.labels[label.0] = Some(pos);
        }
        if self.current_line != self.last_marked_line {
            inst.starts_line = self.current_line;
            self.last_marked_line = self.current_line;
        }
        inst.span = self.current_span;
        let scope = self.open_regions.last().copied();
        if let Some(index) = scope {
            let region = &mut self.regions[index];
            region.start.get_or_insert(pos);
            region.end = Some(pos);
        }
        self.insts.push(inst);
        self.jump_labels.push(jump);
        self.region_scopes.push(scope);
        InstId::new(pos)
    }

    // ========================================================================
    // Finishing
    // ========================================================================

    fn resolve(&self, label: Label) -> ResumeResult<InstId> {
        self.labels[label.0]
            .map(InstId::new)
            .ok_or_else(|| ResumeError::inconsistent(&self.options.qualname, format!("label {} is never bound", label.0)))
    }

    /// Resolves labels and regions, returning the attribute table and the finished
    /// stream without assembling it.
    pub fn build_stream(mut self) -> ResumeResult<(CodeOptions, InstructionStream)> {
        let mut insts = std::mem::take(&mut self.insts);
        for (pos, inst) in insts.iter_mut().enumerate() {
            if let Some(label) = self.jump_labels[pos] {
                inst.target = Some(self.resolve(label)?);
            }
            if let Some(index) = self.region_scopes[pos] {
                let scope = &self.regions[index];
                inst.region = Some(ExceptionRegion {
                    start: InstId::new(scope.start.unwrap_or(pos)),
                    end: InstId::new(scope.end.unwrap_or(pos)),
                    handler: self.resolve(scope.handler)?,
                    depth: scope.depth,
                    lasti: scope.lasti,
                });
            }
        }
        Ok((self.options, InstructionStream::from_vec(insts)))
    }

    /// Builds and assembles the unit.
    pub fn build(self) -> ResumeResult<CodeUnit> {
        let (options, stream) = self.build_stream()?;
        assemble(options, stream)
    }
}
