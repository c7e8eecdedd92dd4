//! Module for the APIs modeling the code of a method.

mod instruction;
mod method_body;

pub use instruction::{ConstantValue, Instruction};
pub use method_body::{
    ExceptionRouting, ExceptionTableEntry, InstructionList, LineNumberTableEntry,
    LocalVariableTableEntry, MethodBody, StackMapFrame, VerificationTypeInfo,
};

use std::fmt::Display;

/// The index of an instruction in the code array of a method.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Copy, Default)]
pub struct ProgramCounter(pub u16);

impl ProgramCounter {
    /// The entry point of a method.
    pub const ZERO: Self = Self(0);
}

impl From<u16> for ProgramCounter {
    fn from(value: u16) -> Self {
        Self(value)
    }
}

impl From<ProgramCounter> for u16 {
    fn from(value: ProgramCounter) -> Self {
        value.0
    }
}

impl Display for ProgramCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}
