//! The abstract operand stack and local variable registers.
//!
//! A frame is slot accurate: a `long` or `double` occupies a value slot
//! followed by a [`Entry::Top`] filler, exactly as in the JVM. Merging is
//! element-wise; refinements propagate through every slot of the frame.

use std::collections::BTreeSet;
use std::fmt::Display;

use itertools::Itertools;

use crate::analysis::fixed_point::Update;
use crate::jvm::code::ProgramCounter;
use crate::jvm::method::MethodDescriptor;
use crate::jvm::references::ClassRef;
use crate::types::field_type::FieldType;
use crate::types::Answer;

use super::domain::integer::{IntValue, LongValue};
use super::domain::reference::{replace_member, ReferenceValue};
use super::domain::{AbstractValue, Domain, ImpossibleRefinement, Origin, Timestamp};

/// An error that occurs when executing bytecode on an abstract frame.
/// Every variant signals code the verifier would have rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecutionError {
    /// More values were popped than the stack holds.
    #[error("the operand stack underflows")]
    StackUnderflow,
    /// The stack grew beyond the advertised maximum.
    #[error("the operand stack exceeds its maximum depth {0}")]
    StackOverflow(u16),
    /// A value of an unexpected sort was found on the stack.
    #[error("expected {expected} on the operand stack, found {found}")]
    UnexpectedOperand {
        /// The sort the instruction needs.
        expected: &'static str,
        /// What was found instead.
        found: String,
    },
    /// A local variable index is outside the register file.
    #[error("local variable {0} is out of range")]
    LocalIndexOutOfRange(u16),
    /// A local variable holds no readable value.
    #[error("local variable {0} holds no usable value")]
    UnusableLocal(u16),
    /// Operand stacks of different depths meet at one program counter.
    #[error("operand stacks of depths {0} and {1} cannot be merged")]
    StackDepthMismatch(usize, usize),
    /// Operands of incompatible sorts meet on the stack.
    #[error("operands of incompatible sorts cannot be merged: {0} and {1}")]
    OperandSortMismatch(String, String),
}

/// One slot of the operand stack or the register file.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Entry {
    /// A usable value.
    Value(AbstractValue),
    /// The second slot of a `long` or `double`.
    Top,
    /// A slot that holds no usable value: either never written, the
    /// victim of an overwritten wide pair, or the meet of incompatible
    /// sorts.
    Unusable,
}

impl Display for Entry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Entry::Value(v) => v.fmt(f),
            Entry::Top => write!(f, "<top>"),
            Entry::Unusable => write!(f, "<unusable>"),
        }
    }
}

/// The abstract state between two instructions: operand stack, local
/// variables, and the return addresses collected on the way into a
/// subroutine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    max_stack: u16,
    operands: Vec<Entry>,
    locals: Vec<Entry>,
    /// The addresses a `ret` inside the current subroutine may return to.
    pub possible_ret_addresses: BTreeSet<ProgramCounter>,
}

impl Frame {
    /// Creates the entry frame of a method: an empty stack and the
    /// parameters laid out in the first local slots. Parameter values get
    /// synthetic origins and timestamps below the session band.
    pub fn new(
        is_static: bool,
        owner: &ClassRef,
        descriptor: &MethodDescriptor,
        max_locals: u16,
        max_stack: u16,
        domain: &mut Domain,
    ) -> Result<Self, ExecutionError> {
        let mut locals = vec![Entry::Unusable; usize::from(max_locals)];
        let mut slot: usize = 0;
        let mut parameter: u16 = 0;
        let place = |value: AbstractValue,
                         locals: &mut Vec<Entry>,
                         slot: &mut usize|
         -> Result<(), ExecutionError> {
            let wide = value.is_wide();
            let needed = *slot + usize::from(wide);
            if needed >= locals.len() {
                return Err(ExecutionError::LocalIndexOutOfRange(*slot as u16));
            }
            locals[*slot] = Entry::Value(value);
            if wide {
                locals[*slot + 1] = Entry::Top;
            }
            *slot += 1 + usize::from(wide);
            Ok(())
        };
        if !is_static {
            let this = domain
                .non_null_object_value(Origin::parameter(parameter), owner.clone())
                .with_parameter_timestamp(parameter);
            place(AbstractValue::Reference(this), &mut locals, &mut slot)?;
            parameter += 1;
        }
        for parameter_type in &descriptor.parameters_types {
            let value = domain.value_of_type(Origin::parameter(parameter), parameter_type);
            let value = match value {
                AbstractValue::Reference(reference) => {
                    AbstractValue::Reference(reference.with_parameter_timestamp(parameter))
                }
                other => other,
            };
            place(value, &mut locals, &mut slot)?;
            parameter += 1;
        }
        domain.reserve_synthetic_band(u32::from(parameter));
        Ok(Self {
            max_stack,
            operands: Vec::with_capacity(usize::from(max_stack)),
            locals,
            possible_ret_addresses: BTreeSet::new(),
        })
    }

    /// A copy of this frame.
    #[must_use]
    pub fn same_frame(&self) -> Self {
        self.clone()
    }

    /// A frame with the same locals and exactly one stack entry; used at
    /// the entry of exception handlers.
    #[must_use]
    pub fn same_locals_1_stack_item_frame(&self, entry: Entry) -> Self {
        Self {
            max_stack: self.max_stack,
            operands: vec![entry],
            locals: self.locals.clone(),
            possible_ret_addresses: self.possible_ret_addresses.clone(),
        }
    }

    /// The operand stack, bottom first.
    #[must_use]
    pub fn operands(&self) -> &[Entry] {
        &self.operands
    }

    /// The local variables.
    #[must_use]
    pub fn locals(&self) -> &[Entry] {
        &self.locals
    }

    /// The current stack depth in slots.
    #[must_use]
    pub fn stack_depth(&self) -> usize {
        self.operands.len()
    }

    pub(crate) fn push_entry(&mut self, entry: Entry) -> Result<(), ExecutionError> {
        if self.operands.len() >= usize::from(self.max_stack) {
            return Err(ExecutionError::StackOverflow(self.max_stack));
        }
        self.operands.push(entry);
        Ok(())
    }

    /// Pushes a value, adding the filler slot for wide values.
    pub(crate) fn push_value(&mut self, value: AbstractValue) -> Result<(), ExecutionError> {
        let wide = value.is_wide();
        self.push_entry(Entry::Value(value))?;
        if wide {
            self.push_entry(Entry::Top)?;
        }
        Ok(())
    }

    pub(crate) fn pop_entry(&mut self) -> Result<Entry, ExecutionError> {
        self.operands.pop().ok_or(ExecutionError::StackUnderflow)
    }

    /// Pops a value, consuming the filler slot of wide values.
    pub(crate) fn pop_value(&mut self) -> Result<AbstractValue, ExecutionError> {
        match self.pop_entry()? {
            Entry::Value(value) => Ok(value),
            Entry::Top => match self.pop_entry()? {
                Entry::Value(value) if value.is_wide() => Ok(value),
                found => Err(ExecutionError::UnexpectedOperand {
                    expected: "a wide value below its filler slot",
                    found: format!("{found}"),
                }),
            },
            Entry::Unusable => Err(ExecutionError::UnexpectedOperand {
                expected: "a usable value",
                found: "<unusable>".into(),
            }),
        }
    }

    /// Pops `count` raw slots (for `pop` and `pop2`).
    pub(crate) fn pop_slots(&mut self, count: usize) -> Result<(), ExecutionError> {
        for _ in 0..count {
            self.pop_entry()?;
        }
        Ok(())
    }

    /// Copies the top `count` slots and inserts the copy `depth` slots
    /// below them; the whole `dup` family reduces to this.
    pub(crate) fn duplicate_slots(
        &mut self,
        count: usize,
        depth: usize,
    ) -> Result<(), ExecutionError> {
        if self.operands.len() < count + depth {
            return Err(ExecutionError::StackUnderflow);
        }
        if self.operands.len() + count > usize::from(self.max_stack) {
            return Err(ExecutionError::StackOverflow(self.max_stack));
        }
        let top: Vec<Entry> = self.operands[self.operands.len() - count..].to_vec();
        let at = self.operands.len() - count - depth;
        self.operands.splice(at..at, top);
        Ok(())
    }

    /// Swaps the two topmost slots.
    pub(crate) fn swap_top(&mut self) -> Result<(), ExecutionError> {
        let depth = self.operands.len();
        if depth < 2 {
            return Err(ExecutionError::StackUnderflow);
        }
        self.operands.swap(depth - 1, depth - 2);
        Ok(())
    }

    pub(crate) fn pop_int(&mut self) -> Result<IntValue, ExecutionError> {
        match self.pop_value()? {
            AbstractValue::Int(value) => Ok(value),
            found => Err(ExecutionError::UnexpectedOperand {
                expected: "an int",
                found: format!("{found}"),
            }),
        }
    }

    pub(crate) fn pop_long(&mut self) -> Result<LongValue, ExecutionError> {
        match self.pop_value()? {
            AbstractValue::Long(value) => Ok(value),
            found => Err(ExecutionError::UnexpectedOperand {
                expected: "a long",
                found: format!("{found}"),
            }),
        }
    }

    pub(crate) fn pop_float(&mut self) -> Result<(), ExecutionError> {
        match self.pop_value()? {
            AbstractValue::Float => Ok(()),
            found => Err(ExecutionError::UnexpectedOperand {
                expected: "a float",
                found: format!("{found}"),
            }),
        }
    }

    pub(crate) fn pop_double(&mut self) -> Result<(), ExecutionError> {
        match self.pop_value()? {
            AbstractValue::Double => Ok(()),
            found => Err(ExecutionError::UnexpectedOperand {
                expected: "a double",
                found: format!("{found}"),
            }),
        }
    }

    pub(crate) fn pop_reference(&mut self) -> Result<ReferenceValue, ExecutionError> {
        match self.pop_value()? {
            AbstractValue::Reference(value) => Ok(value),
            found => Err(ExecutionError::UnexpectedOperand {
                expected: "a reference",
                found: format!("{found}"),
            }),
        }
    }

    /// Reads a local variable.
    pub(crate) fn load_local(&self, index: u16) -> Result<AbstractValue, ExecutionError> {
        match self.locals.get(usize::from(index)) {
            None => Err(ExecutionError::LocalIndexOutOfRange(index)),
            Some(Entry::Value(value)) => Ok(value.clone()),
            Some(Entry::Top | Entry::Unusable) => Err(ExecutionError::UnusableLocal(index)),
        }
    }

    /// Writes a local variable, breaking any wide pair it overlaps.
    pub(crate) fn store_local(
        &mut self,
        index: u16,
        value: AbstractValue,
    ) -> Result<(), ExecutionError> {
        let index = usize::from(index);
        let wide = value.is_wide();
        if index + usize::from(wide) >= self.locals.len() {
            return Err(ExecutionError::LocalIndexOutOfRange(index as u16));
        }
        // Overwriting the filler of a preceding wide value kills it.
        if index > 0 && matches!(self.locals[index], Entry::Top) {
            self.locals[index - 1] = Entry::Unusable;
        }
        // Overwriting a wide value orphans its filler.
        if matches!(&self.locals[index], Entry::Value(v) if v.is_wide()) {
            self.locals[index + 1] = Entry::Unusable;
        }
        self.locals[index] = Entry::Value(value);
        if wide {
            if matches!(&self.locals[index + 1], Entry::Value(v) if v.is_wide()) {
                // The filler overwrites another wide value's first slot.
                if index + 2 < self.locals.len() {
                    self.locals[index + 2] = Entry::Unusable;
                }
            }
            self.locals[index + 1] = Entry::Top;
        }
        Ok(())
    }

    /// Clears every local the liveness analysis proves dead at `pc`.
    pub(crate) fn clear_dead_locals(
        &mut self,
        liveness: &crate::analysis::liveness::Liveness,
        pc: ProgramCounter,
    ) {
        for (index, slot) in self.locals.iter_mut().enumerate() {
            if matches!(slot, Entry::Value(_) | Entry::Top)
                && !liveness.is_live_before(pc, index as u16)
            {
                *slot = Entry::Unusable;
            }
        }
    }

    /// Merges an incoming frame into this one. The operand stacks must
    /// have the same depth and element-wise compatible sorts; locals of
    /// incompatible sorts degrade to [`Entry::Unusable`].
    pub fn merge(
        &self,
        incoming: &Frame,
        domain: &mut Domain,
    ) -> Result<Update<Frame>, ExecutionError> {
        if self.operands.len() != incoming.operands.len() {
            return Err(ExecutionError::StackDepthMismatch(
                self.operands.len(),
                incoming.operands.len(),
            ));
        }
        let mut structural = false;
        let mut timestamp_only = false;
        let mut operands = Vec::with_capacity(self.operands.len());
        for (current, other) in self.operands.iter().zip(&incoming.operands) {
            let merged = merge_entries(current, other, domain, &mut structural, &mut timestamp_only);
            match merged {
                Some(entry) => operands.push(entry),
                None => {
                    return Err(ExecutionError::OperandSortMismatch(
                        format!("{current}"),
                        format!("{other}"),
                    ))
                }
            }
        }
        let mut locals = Vec::with_capacity(self.locals.len());
        for (current, other) in self.locals.iter().zip(&incoming.locals) {
            let merged = merge_entries(current, other, domain, &mut structural, &mut timestamp_only)
                .unwrap_or_else(|| {
                    structural = true;
                    Entry::Unusable
                });
            locals.push(merged);
        }
        let mut possible_ret_addresses = self.possible_ret_addresses.clone();
        for address in &incoming.possible_ret_addresses {
            if possible_ret_addresses.insert(*address) {
                structural = true;
            }
        }
        if structural {
            Ok(Update::StructuralUpdate(Frame {
                max_stack: self.max_stack,
                operands,
                locals,
                possible_ret_addresses,
            }))
        } else if timestamp_only {
            Ok(Update::TimestampUpdate(Frame {
                max_stack: self.max_stack,
                operands,
                locals,
                possible_ret_addresses,
            }))
        } else {
            Ok(Update::NoUpdate)
        }
    }

    /// Narrows the nullness of `value` and replaces every occurrence of
    /// it throughout the stack and the registers.
    pub fn refine_is_null(
        &mut self,
        value: &ReferenceValue,
        answer: Answer,
        domain: &Domain,
    ) -> Result<ReferenceValue, ImpossibleRefinement> {
        let refined = value.refine_is_null(answer)?;
        self.propagate_refinement(value, &refined, domain);
        Ok(refined)
    }

    /// Sharpens the upper type bound of `value` and replaces every
    /// occurrence of it throughout the stack and the registers.
    pub fn refine_upper_type_bound(
        &mut self,
        value: &ReferenceValue,
        target: &FieldType,
        domain: &Domain,
    ) -> Result<ReferenceValue, ImpossibleRefinement> {
        let refined = value.refine_upper_type_bound(target, domain.class_hierarchy())?;
        self.propagate_refinement(value, &refined, domain);
        Ok(refined)
    }

    /// Replaces every occurrence of `old` with `new`. Multi-origin values
    /// containing the refined value are rebuilt, and the replacement runs
    /// to a fixed point over the induced rewrites.
    pub(crate) fn propagate_refinement(
        &mut self,
        old: &ReferenceValue,
        new: &ReferenceValue,
        domain: &Domain,
    ) {
        let mut pending: Vec<(ReferenceValue, ReferenceValue)> =
            vec![(old.clone(), new.clone())];
        while let Some((old, new)) = pending.pop() {
            if old == new {
                continue;
            }
            for slot in self.operands.iter_mut().chain(self.locals.iter_mut()) {
                let Entry::Value(AbstractValue::Reference(reference)) = slot else {
                    continue;
                };
                if *reference == old {
                    *reference = new.clone();
                    continue;
                }
                if let (ReferenceValue::Single(old_single), ReferenceValue::Multiple(multiple)) =
                    (&old, &*reference)
                {
                    if let ReferenceValue::Single(new_single) = &new {
                        if multiple.values.contains(old_single) {
                            let rebuilt = replace_member(
                                multiple,
                                old_single,
                                new_single,
                                domain.class_hierarchy(),
                            );
                            let prior = reference.clone();
                            *reference = rebuilt.clone();
                            pending.push((prior, rebuilt));
                        }
                    }
                }
            }
        }
    }
}

fn merge_entries(
    current: &Entry,
    incoming: &Entry,
    domain: &mut Domain,
    structural: &mut bool,
    timestamp_only: &mut bool,
) -> Option<Entry> {
    match (current, incoming) {
        (Entry::Top, Entry::Top) => Some(Entry::Top),
        (Entry::Unusable, _) => Some(Entry::Unusable),
        (_, Entry::Unusable) => {
            *structural = true;
            Some(Entry::Unusable)
        }
        (Entry::Value(a), Entry::Value(b)) => match domain.join_values(a, b) {
            Some(Update::NoUpdate) => Some(Entry::Value(a.clone())),
            Some(Update::TimestampUpdate(joined)) => {
                *timestamp_only = true;
                Some(Entry::Value(joined))
            }
            Some(Update::StructuralUpdate(joined)) => {
                *structural = true;
                Some(Entry::Value(joined))
            }
            None => None,
        },
        (Entry::Top, Entry::Value(_)) | (Entry::Value(_), Entry::Top) => None,
    }
}

/// Rewrites the timestamp of a single-origin parameter value into the
/// synthetic band below the session counter.
trait WithParameterTimestamp {
    fn with_parameter_timestamp(self, parameter: u16) -> Self;
}

impl WithParameterTimestamp for ReferenceValue {
    fn with_parameter_timestamp(self, parameter: u16) -> Self {
        match self {
            ReferenceValue::Single(single) => ReferenceValue::Single(
                single.with_timestamp(Timestamp(u32::from(parameter))),
            ),
            multiple => multiple,
        }
    }
}

impl Display for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "stack: [{}], locals: [{}]",
            self.operands.iter().join(", "),
            self.locals.iter().join(", ")
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::types::hierarchy::ClassHierarchy;
    use std::str::FromStr;
    use std::sync::Arc;

    fn domain() -> Domain {
        Domain::new(Arc::new(ClassHierarchy::with_java_lang_types([])))
    }

    fn entry_frame(descriptor: &str, is_static: bool, domain: &mut Domain) -> Frame {
        Frame::new(
            is_static,
            &ClassRef::new("com/example/Widget"),
            &MethodDescriptor::from_str(descriptor).unwrap(),
            8,
            8,
            domain,
        )
        .unwrap()
    }

    #[test]
    fn parameters_are_laid_out_in_slots() {
        let mut domain = domain();
        let frame = entry_frame("(IJLjava/lang/String;)V", false, &mut domain);
        // this, int, long (2 slots), String
        assert!(matches!(frame.locals()[0], Entry::Value(AbstractValue::Reference(_))));
        assert!(matches!(frame.locals()[1], Entry::Value(AbstractValue::Int(_))));
        assert!(matches!(frame.locals()[2], Entry::Value(AbstractValue::Long(_))));
        assert!(matches!(frame.locals()[3], Entry::Top));
        assert!(matches!(frame.locals()[4], Entry::Value(AbstractValue::Reference(_))));
        assert!(matches!(frame.locals()[5], Entry::Unusable));
    }

    #[test]
    fn receiver_is_non_null() {
        let mut domain = domain();
        let frame = entry_frame("()V", false, &mut domain);
        let Entry::Value(AbstractValue::Reference(this)) = &frame.locals()[0] else {
            panic!("the receiver must be a reference");
        };
        assert_eq!(this.is_null(), Answer::No);
        assert_eq!(this.single_origin(), Some(Origin::parameter(0)));
        assert!(this.timestamp().0 < crate::interp::domain::TimestampCounter::FIRST);
    }

    #[test]
    fn wide_values_round_trip_through_the_stack() {
        let mut domain = domain();
        let mut frame = entry_frame("()V", true, &mut domain);
        frame.push_value(AbstractValue::Long(LongValue::Exact(42))).unwrap();
        assert_eq!(frame.stack_depth(), 2);
        assert_eq!(frame.pop_long().unwrap(), LongValue::Exact(42));
        assert_eq!(frame.stack_depth(), 0);
    }

    #[test]
    fn storing_a_narrow_value_kills_an_overlapped_wide_pair() {
        let mut domain = domain();
        let mut frame = entry_frame("()V", true, &mut domain);
        frame
            .store_local(0, AbstractValue::Long(LongValue::Exact(1)))
            .unwrap();
        frame
            .store_local(1, AbstractValue::Int(IntValue::Exact(2)))
            .unwrap();
        assert!(frame.load_local(0).is_err());
        assert_eq!(frame.load_local(1).unwrap(), AbstractValue::Int(IntValue::Exact(2)));
    }

    #[test]
    fn stack_depth_mismatch_is_fatal() {
        let mut domain = domain();
        let a = entry_frame("()V", true, &mut domain);
        let mut b = a.same_frame();
        b.push_value(AbstractValue::Int(IntValue::Any)).unwrap();
        assert!(matches!(
            a.merge(&b, &mut domain),
            Err(ExecutionError::StackDepthMismatch(0, 1))
        ));
    }

    #[test]
    fn incompatible_local_sorts_become_unusable() {
        let mut domain = domain();
        let mut a = entry_frame("()V", true, &mut domain);
        let mut b = a.same_frame();
        a.store_local(0, AbstractValue::Int(IntValue::Any)).unwrap();
        b.store_local(
            0,
            AbstractValue::Reference(domain.null_value(ProgramCounter(0))),
        )
        .unwrap();
        let Update::StructuralUpdate(merged) = a.merge(&b, &mut domain).unwrap() else {
            panic!("the merge must widen");
        };
        assert_eq!(merged.locals()[0], Entry::Unusable);
    }

    #[test]
    fn merging_equal_frames_changes_nothing() {
        let mut domain = domain();
        let frame = entry_frame("(I)I", true, &mut domain);
        assert!(frame.merge(&frame.same_frame(), &mut domain).unwrap().is_no_update());
    }

    #[test]
    fn refinement_reaches_stack_and_locals() {
        let mut domain = domain();
        let mut frame = entry_frame("(Ljava/lang/Object;)V", true, &mut domain);
        let value = match frame.load_local(0).unwrap() {
            AbstractValue::Reference(it) => it,
            _ => unreachable!(),
        };
        frame
            .push_value(AbstractValue::Reference(value.clone()))
            .unwrap();
        let refined = frame
            .refine_is_null(&value, Answer::No, &domain)
            .unwrap();
        assert_eq!(refined.is_null(), Answer::No);
        assert_eq!(
            frame.load_local(0).unwrap(),
            AbstractValue::Reference(refined.clone())
        );
        let Entry::Value(AbstractValue::Reference(on_stack)) = &frame.operands()[0] else {
            panic!("a reference must sit on the stack");
        };
        assert_eq!(on_stack, &refined);
    }

    #[test]
    fn refining_a_member_rebuilds_the_joined_value() {
        let mut domain = domain();
        let mut frame = entry_frame("()V", true, &mut domain);
        let a = domain.initialized_object_value(ProgramCounter(1), ClassRef::object());
        let b = domain.initialized_object_value(ProgramCounter(2), ClassRef::object());
        let joined = domain.join_reference(&a, &b).into_value().unwrap();
        frame.store_local(0, AbstractValue::Reference(joined.clone())).unwrap();
        frame.store_local(1, AbstractValue::Reference(a.clone())).unwrap();

        frame.refine_is_null(&a, Answer::No, &domain).unwrap();

        let AbstractValue::Reference(ReferenceValue::Multiple(rebuilt)) =
            frame.load_local(0).unwrap()
        else {
            panic!("the joined value must stay multi-origin");
        };
        assert!(rebuilt
            .values
            .iter()
            .any(|member| member.is_null() == Answer::No));
    }
}
