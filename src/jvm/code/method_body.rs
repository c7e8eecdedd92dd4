use std::collections::BTreeMap;
use std::ops::{Bound, Range, RangeInclusive};

use crate::jvm::references::ClassRef;
use crate::types::field_type::FieldType;

use super::{Instruction, ProgramCounter};

/// The body of a method.
/// See the [JVM Specification §4.7.3](https://docs.oracle.com/javase/specs/jvms/se21/html/jvms-4.html#jvms-4.7.3) for more information.
#[derive(Debug, Clone, Default)]
pub struct MethodBody {
    /// The maximum number of values on the operand stack of the method.
    pub max_stack: u16,
    /// The maximum number of local variables in the method.
    pub max_locals: u16,
    /// The executable instructions.
    pub instructions: InstructionList,
    /// The exception handlers table.
    pub exception_table: Vec<ExceptionTableEntry>,
    /// The line number table.
    pub line_number_table: Option<Vec<LineNumberTableEntry>>,
    /// The local variable table.
    pub local_variable_table: Option<Vec<LocalVariableTableEntry>>,
    /// The stack map table.
    pub stack_map_table: Option<Vec<StackMapFrame>>,
}

impl MethodBody {
    /// Returns the instruction at the given program counter.
    pub fn instruction_at(&self, pc: ProgramCounter) -> Option<&Instruction> {
        self.instructions.get(&pc)
    }

    /// Returns the exception handlers covering the given program counter,
    /// in declaration order.
    pub fn handlers_covering(
        &self,
        pc: ProgramCounter,
    ) -> impl Iterator<Item = &ExceptionTableEntry> {
        self.exception_table.iter().filter(move |it| it.covers(pc))
    }

    /// Routes an exception of type `thrown` raised at `pc` through the
    /// exception table.
    ///
    /// Handlers are consulted in declaration order. A catch-all handler or
    /// one whose catch type provably covers `thrown` ends the search; a
    /// handler that may apply (the subtype question is undecided, or a
    /// subtype of `thrown` is caught) is recorded and the search goes on.
    pub fn route_exception(
        &self,
        pc: ProgramCounter,
        thrown: &crate::jvm::references::ClassRef,
        class_hierarchy: &crate::types::hierarchy::ClassHierarchy,
    ) -> ExceptionRouting {
        let mut handlers = Vec::new();
        for (index, entry) in self.exception_table.iter().enumerate() {
            if !entry.covers(pc) {
                continue;
            }
            let Some(catch_type) = &entry.catch_type else {
                handlers.push((index, entry.handler_pc));
                return ExceptionRouting {
                    handlers,
                    definitely_caught: true,
                };
            };
            match class_hierarchy.is_object_subtype_of(thrown, catch_type) {
                crate::types::Answer::Yes => {
                    handlers.push((index, entry.handler_pc));
                    return ExceptionRouting {
                        handlers,
                        definitely_caught: true,
                    };
                }
                crate::types::Answer::Unknown => handlers.push((index, entry.handler_pc)),
                crate::types::Answer::No => {
                    // A strict subtype of `thrown` may still be caught here.
                    if !class_hierarchy
                        .is_object_subtype_of(catch_type, thrown)
                        .is_no()
                    {
                        handlers.push((index, entry.handler_pc));
                    }
                }
            }
        }
        ExceptionRouting {
            handlers,
            definitely_caught: false,
        }
    }
}

/// The outcome of routing a thrown exception through the exception table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionRouting {
    /// The handlers that may receive the exception, in table order, as
    /// pairs of the exception table index and the handler entry point.
    pub handlers: Vec<(usize, ProgramCounter)>,
    /// Whether one of the handlers provably catches the exception, so the
    /// exception cannot escape the method from `pc`.
    pub definitely_caught: bool,
}

/// A list of instructions keyed by program counter.
///
/// Multi-byte instructions leave their intermediate program counters
/// unmapped, so the distance between adjacent keys is the byte length of
/// the earlier instruction.
#[derive(Debug, Clone, Default)]
pub struct InstructionList(BTreeMap<ProgramCounter, Instruction>);

impl From<BTreeMap<ProgramCounter, Instruction>> for InstructionList {
    fn from(map: BTreeMap<ProgramCounter, Instruction>) -> Self {
        Self(map)
    }
}

impl<const N: usize> From<[(ProgramCounter, Instruction); N]> for InstructionList {
    fn from(value: [(ProgramCounter, Instruction); N]) -> Self {
        Self::from(BTreeMap::from(value))
    }
}

impl IntoIterator for InstructionList {
    type Item = (ProgramCounter, Instruction);
    type IntoIter = <BTreeMap<ProgramCounter, Instruction> as IntoIterator>::IntoIter;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'i> IntoIterator for &'i InstructionList {
    type Item = (&'i ProgramCounter, &'i Instruction);
    type IntoIter = <&'i BTreeMap<ProgramCounter, Instruction> as IntoIterator>::IntoIter;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl InstructionList {
    /// Returns the instruction at the given program counter.
    pub fn get(&self, pc: &ProgramCounter) -> Option<&Instruction> {
        self.0.get(pc)
    }

    /// Returns the first instruction in the list.
    pub fn entry_point(&self) -> Option<(&ProgramCounter, &Instruction)> {
        self.0.first_key_value()
    }

    /// Returns an iterator over the instructions in program counter order.
    pub fn iter(&self) -> impl Iterator<Item = (&ProgramCounter, &Instruction)> {
        self.0.iter()
    }

    /// Returns the number of instructions in the list.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Checks whether the list contains no instructions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the program counter of the next instruction after the given one.
    pub fn next_pc_of(&self, pc: &ProgramCounter) -> Option<ProgramCounter> {
        self.0
            .range((Bound::Excluded(pc), Bound::Unbounded))
            .next()
            .map(|(k, _)| *k)
    }

    /// Returns the program counter of the instruction preceding the given one.
    pub fn prev_pc_of(&self, pc: &ProgramCounter) -> Option<ProgramCounter> {
        self.0
            .range((Bound::Unbounded, Bound::Excluded(pc)))
            .next_back()
            .map(|(k, _)| *k)
    }

    /// Returns the instructions whose program counters fall into the range.
    pub fn range(
        &self,
        range: impl std::ops::RangeBounds<ProgramCounter>,
    ) -> impl Iterator<Item = (&ProgramCounter, &Instruction)> {
        self.0.range(range)
    }

    /// Checks whether an instruction starts at the given program counter.
    #[must_use]
    pub fn contains_pc(&self, pc: &ProgramCounter) -> bool {
        self.0.contains_key(pc)
    }

    /// Replaces the instruction at the given program counter.
    /// The replacement must not occupy more bytes than the distance to
    /// the next instruction.
    pub(crate) fn replace(&mut self, pc: ProgramCounter, instruction: Instruction) {
        self.0.insert(pc, instruction);
    }

    /// Inserts an instruction into a gap left by a multi-byte instruction.
    pub(crate) fn insert_in_gap(&mut self, pc: ProgramCounter, instruction: Instruction) {
        debug_assert!(!self.0.contains_key(&pc));
        self.0.insert(pc, instruction);
    }
}

/// An entry in the exception table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionTableEntry {
    /// The locations where the exception handler is active.
    pub covered_pc: RangeInclusive<ProgramCounter>,
    /// The location of the exception handler.
    pub handler_pc: ProgramCounter,
    /// The type of the exception to be handled, or `None` for a handler
    /// catching everything (a `finally` block).
    pub catch_type: Option<ClassRef>,
}

impl ExceptionTableEntry {
    /// Checks whether the given program counter is covered by this exception handler.
    pub fn covers(&self, pc: ProgramCounter) -> bool {
        self.covered_pc.contains(&pc)
    }
}

/// An entry in the line number table.
#[derive(Debug, Clone)]
pub struct LineNumberTableEntry {
    /// The program counter of the first instruction in the line.
    pub start_pc: ProgramCounter,
    /// The corresponding line number in the source file.
    pub line_number: u16,
}

/// An entry in the local variable table.
#[derive(Debug, Clone)]
pub struct LocalVariableTableEntry {
    /// The locations where the variable is valid.
    pub effective_range: Range<ProgramCounter>,
    /// The index of the variable in the local variable array.
    pub index: u16,
    /// The name of the variable.
    pub name: String,
    /// The type of the variable.
    pub var_type: FieldType,
}

/// The type of a value in the stack map table for verification.
/// See the [JVM Specification §4.7.4](https://docs.oracle.com/javase/specs/jvms/se21/html/jvms-4.html#jvms-4.7.4) for more information.
#[derive(Debug, Clone)]
pub enum VerificationTypeInfo {
    /// The verification type `top`.
    TopVariable,
    /// The verification type `int`.
    IntegerVariable,
    /// The verification type `float`.
    FloatVariable,
    /// The verification type `null`.
    NullVariable,
    /// The verification type `uninitializedThis`.
    UninitializedThisVariable,
    /// The verification type `object` with the given type.
    ObjectVariable(ClassRef),
    /// The verification type `uninitialized` with the given offset.
    UninitializedVariable {
        /// The location of the `new` that created the object.
        offset: ProgramCounter,
    },
    /// The verification type `long`.
    LongVariable,
    /// The verification type `double`.
    DoubleVariable,
}

/// A stack map frame for verification.
/// See the [JVM Specification §4.7.4](https://docs.oracle.com/javase/specs/jvms/se21/html/jvms-4.html#jvms-4.7.4) for more information.
#[derive(Debug, Clone)]
pub enum StackMapFrame {
    /// The same locals as the previous frame, an empty operand stack.
    /// Corresponds to `same_frame` and `same_frame_extended`.
    SameFrame {
        /// The offset where the frame applies.
        offset_delta: u16,
    },
    /// The same locals as the previous frame, one operand stack entry.
    /// Corresponds to `same_locals_1_stack_item_frame` and
    /// `same_locals_1_stack_item_frame_extended`.
    SameLocals1StackItemFrame {
        /// The offset where the frame applies.
        offset_delta: u16,
        /// The type of the one entry in the operand stack.
        stack: VerificationTypeInfo,
    },
    /// The previous frame with the last locals absent, an empty stack.
    /// Corresponds to `chop_frame`.
    ChopFrame {
        /// The offset where the frame applies.
        offset_delta: u16,
        /// The number of local variables that are absent.
        chop_count: u8,
    },
    /// The previous frame with additional locals, an empty stack.
    /// Corresponds to `append_frame`.
    AppendFrame {
        /// The offset where the frame applies.
        offset_delta: u16,
        /// The verification information of the additional locals.
        locals: Vec<VerificationTypeInfo>,
    },
    /// A frame spelled out in full. Corresponds to `full_frame`.
    FullFrame {
        /// The offset where the frame applies.
        offset_delta: u16,
        /// The verification information of the local variables.
        locals: Vec<VerificationTypeInfo>,
        /// The verification information of the operand stack.
        stack: Vec<VerificationTypeInfo>,
    },
}

#[cfg(test)]
mod test {
    use crate::jvm::code::{Instruction, InstructionList};

    use super::MethodBody;
    use Instruction::*;

    #[test]
    fn instruction_at() {
        let body = MethodBody {
            instructions: InstructionList::from([
                (0.into(), Nop),
                (1.into(), IConst0),
                (2.into(), IConst1),
            ]),
            ..Default::default()
        };
        assert_eq!(Some(&IConst0), body.instruction_at(1.into()));
    }

    #[test]
    fn next_pc_skips_gaps() {
        let instructions = InstructionList::from([
            (0.into(), BiPush(42)),
            (2.into(), IConst0),
            (3.into(), Goto(0.into())),
        ]);
        assert_eq!(instructions.next_pc_of(&0.into()), Some(2.into()));
        assert_eq!(instructions.next_pc_of(&2.into()), Some(3.into()));
        assert_eq!(instructions.next_pc_of(&3.into()), None);
    }

    #[test]
    fn handler_coverage() {
        use crate::jvm::code::ExceptionTableEntry;
        let entry = ExceptionTableEntry {
            covered_pc: 4.into()..=8.into(),
            handler_pc: 12.into(),
            catch_type: None,
        };
        assert!(!entry.covers(3.into()));
        assert!(entry.covers(4.into()));
        assert!(entry.covers(8.into()));
        assert!(!entry.covers(9.into()));
    }
}
