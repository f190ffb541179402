//! Opcode, operand and constant definitions for the host instruction format.
//!
//! Instructions are encoded as 2-byte words (opcode, argument byte); arguments wider
//! than a byte are carried by `EXTENDED_ARG` prefixes, so an instruction occupies
//! `2 * (1 + prefixes)` bytes. Jump arguments are absolute word indices.

use std::{
    fmt,
    hash::{Hash, Hasher},
};

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use strum::{Display, EnumString, FromRepr, IntoStaticStr};

/// Host VM opcodes.
///
/// Display names use the conventional SCREAMING_SNAKE_CASE spelling
/// (`Opcode::LoadFast` -> `LOAD_FAST`).
#[repr(u8)]
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, IntoStaticStr, FromRepr, Serialize, Deserialize,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum Opcode {
    Nop,
    PopTop,
    /// Swaps TOS with the n-th item (1-based).
    Swap,
    /// Pushes a copy of the n-th item (1-based).
    Copy,
    /// Pushes the null sentinel (unbound slot / absent `self`).
    PushNull,
    LoadConst,
    LoadFast,
    StoreFast,
    DeleteFast,
    LoadGlobal,
    LoadAttr,
    /// Replaces the object on TOS with `(method, self)`.
    LoadMethod,
    LoadDeref,
    StoreDeref,
    MakeCell,
    /// Copies the closure cells into the frame; must precede `RESUME`.
    CopyFreeVars,
    /// Frame-setup marker of the eras that require one.
    Resume,
    /// Call with the `(callable, self_or_null)` pair convention.
    Call,
    /// Block-era call of a plain callable.
    CallFunction,
    /// Block-era call of a `(method, self)` pair pushed by `LOAD_METHOD`.
    CallMethod,
    BinaryOp,
    CompareOp,
    Jump,
    PopJumpIfTrue,
    PopJumpIfFalse,
    RaiseVarargs,
    Reraise,
    ReturnValue,
    /// Structural-era `with` entry: replaces the manager with `(exit, enter_result)`.
    BeforeWith,
    /// Block-era `with` entry; pushes a handler block targeting the jump target.
    SetupWith,
    /// Block-era try entry; pushes a handler block targeting the jump target.
    SetupFinally,
    PopBlock,
    /// Exception-info capture point at the head of a structural handler.
    PushExcInfo,
    PopExcept,
    WithExceptStart,
    /// Argument prefix; only ever produced by the encoder.
    ExtendedArg,
}

impl Opcode {
    /// Whether the instruction carries a jump-target handle.
    #[must_use]
    pub fn has_target(self) -> bool {
        matches!(
            self,
            Self::Jump | Self::PopJumpIfTrue | Self::PopJumpIfFalse | Self::SetupWith | Self::SetupFinally
        )
    }

    /// Whether execution never continues to the next instruction.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Jump | Self::RaiseVarargs | Self::Reraise | Self::ReturnValue)
    }

    /// Block-era setup instructions, whose target is an exception handler rather
    /// than an ordinary branch.
    #[must_use]
    pub fn is_block_setup(self) -> bool {
        matches!(self, Self::SetupWith | Self::SetupFinally)
    }

    /// Net stack effect of executing the instruction with argument `arg`.
    ///
    /// `jump` selects the effect along the branch edge for instructions that have one.
    #[must_use]
    pub fn stack_effect(self, arg: u32, jump: bool) -> i64 {
        let arg = i64::from(arg);
        match self {
            Self::Nop
            | Self::Swap
            | Self::DeleteFast
            | Self::LoadAttr
            | Self::MakeCell
            | Self::CopyFreeVars
            | Self::Resume
            | Self::Jump
            | Self::PopBlock
            | Self::ExtendedArg => 0,
            Self::Copy
            | Self::PushNull
            | Self::LoadConst
            | Self::LoadFast
            | Self::LoadGlobal
            | Self::LoadMethod
            | Self::LoadDeref
            | Self::BeforeWith
            | Self::PushExcInfo
            | Self::WithExceptStart => 1,
            Self::PopTop
            | Self::StoreFast
            | Self::StoreDeref
            | Self::BinaryOp
            | Self::CompareOp
            | Self::PopJumpIfTrue
            | Self::PopJumpIfFalse
            | Self::Reraise
            | Self::ReturnValue
            | Self::PopExcept => -1,
            // pops (callable, self_or_null) + args, pushes the result
            Self::Call | Self::CallMethod => -(arg + 1),
            // pops callable + args, pushes the result
            Self::CallFunction => -arg,
            Self::RaiseVarargs => -arg,
            // the manager is replaced by its exit hook; the handler edge sees the
            // exception triple on top of it
            Self::SetupWith => {
                if jump {
                    3
                } else {
                    1
                }
            }
            Self::SetupFinally => {
                if jump {
                    3
                } else {
                    0
                }
            }
        }
    }
}

/// Literal value that can live in a unit's constant pool.
///
/// Floats compare and hash by bit pattern so constants can be used in cache keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Constant {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Tuple(Vec<Constant>),
}

/// Constructor arguments for an in-place rebuild of a scoped resource.
pub type ConstArgs = SmallVec<[Constant; 4]>;

impl PartialEq for Constant {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::None, Self::None) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a.to_bits() == b.to_bits(),
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::Tuple(a), Self::Tuple(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Constant {}

impl Hash for Constant {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Self::None => {}
            Self::Bool(b) => b.hash(state),
            Self::Int(i) => i.hash(state),
            Self::Float(f) => f.to_bits().hash(state),
            Self::Str(s) => s.hash(state),
            Self::Tuple(items) => items.hash(state),
        }
    }
}

impl fmt::Display for Constant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Bool(true) => f.write_str("True"),
            Self::Bool(false) => f.write_str("False"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x:?}"),
            Self::Str(s) => write!(f, "{s:?}"),
            Self::Tuple(items) => {
                f.write_str("(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                if items.len() == 1 {
                    f.write_str(",")?;
                }
                f.write_str(")")
            }
        }
    }
}

/// Symbolic instruction operand, resolved to a numeric argument at assembly time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Operand {
    #[default]
    None,
    /// Literal numeric argument (argument counts, copy/swap depths, raise forms).
    Count(u32),
    /// Constant-pool entry.
    Const(Constant),
    /// Local variable slot, by name.
    Local(String),
    /// Global or attribute name-table entry.
    Name(String),
    /// Cell or free variable, by name.
    Deref(String),
}

impl Operand {
    /// Returns the local name if this operand addresses a local slot.
    #[must_use]
    pub fn local(&self) -> Option<&str> {
        match self {
            Self::Local(name) => Some(name),
            _ => None,
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => Ok(()),
            Self::Count(n) => write!(f, "{n}"),
            Self::Const(c) => write!(f, "{c}"),
            Self::Local(name) | Self::Name(name) | Self::Deref(name) => f.write_str(name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_display_uses_conventional_spelling() {
        assert_eq!(Opcode::LoadFast.to_string(), "LOAD_FAST");
        assert_eq!(Opcode::RaiseVarargs.to_string(), "RAISE_VARARGS");
        assert_eq!(Opcode::PushExcInfo.to_string(), "PUSH_EXC_INFO");
        assert_eq!("COPY_FREE_VARS".parse::<Opcode>(), Ok(Opcode::CopyFreeVars));
    }

    #[test]
    fn float_constants_compare_by_bits() {
        assert_eq!(Constant::Float(f64::NAN), Constant::Float(f64::NAN));
        assert_ne!(Constant::Float(0.0), Constant::Float(-0.0));
        assert_ne!(Constant::Int(1), Constant::Bool(true));
    }

    #[test]
    fn constant_repr() {
        let tuple = Constant::Tuple(vec![Constant::Int(1)]);
        assert_eq!(tuple.to_string(), "(1,)");
        assert_eq!(Constant::Str("a".to_owned()).to_string(), "\"a\"");
    }

    #[test]
    fn call_effects_follow_convention() {
        assert_eq!(Opcode::Call.stack_effect(2, false), -3);
        assert_eq!(Opcode::CallFunction.stack_effect(2, false), -2);
        assert_eq!(Opcode::SetupFinally.stack_effect(0, true), 3);
    }
}
