#![doc = include_str!("../../../README.md")]
#![expect(clippy::cast_possible_truncation, reason = "wordcode bytes are masked before narrowing")]

mod bytecode;
mod cache;
mod config;
mod era;
mod error;
mod key;
mod metadata;
mod reenter;
mod synthesis;
pub mod template;
pub mod tracer;
mod transform;

pub use crate::{
    bytecode::{
        Arena, CodeFlags, CodeOptions, CodeUnit, CodeUnitBuilder, ConstArgs, Constant, ExceptionRegion,
        ExceptionTableEntry, InstId, Instruction, InstructionStream, Label, LineEntry, Opcode, Operand, SourceSpan,
    },
    cache::ContinuationCache,
    config::{
        DEFAULT_CONTEXT_PREFIX, DEFAULT_MODE_STACK_HELPER, DEFAULT_MODE_STACK_RESTORE, DEFAULT_NAME_PREFIX,
        DEFAULT_STACK_PREFIX, ResumeConfig,
    },
    era::{CallNull, Era, EraCapabilities},
    error::{ResumeError, ResumeResult},
    key::ResumeKey,
    reenter::{ReenterWith, Reentry, ReentryContext, ReentryStrategy},
    template::{Expansion, PLACEHOLDER, ReferenceCompiler, Snippet, SnippetCompiler, expand_template},
    tracer::{CountingTracer, NoopTracer, RecordingTracer, ResumeEvent, ResumeTracer, StderrTracer},
    transform::{Draft, transform_code_unit},
};
