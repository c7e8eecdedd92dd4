//! The abstract value domain.
//!
//! A [`Domain`] is the mutable state of one interpretation session: it
//! owns the timestamp counter, memoizes expensive joins, and is the only
//! place where values are created. The values themselves are immutable
//! and live in [`integer`] and [`reference`].

pub mod integer;
pub mod reference;

use std::collections::HashMap;
use std::fmt::Display;
use std::sync::Arc;

use crate::analysis::fixed_point::Update;
use crate::jvm::code::ProgramCounter;
use crate::jvm::references::{ClassRef, JAVA_LANG_CLASS, JAVA_LANG_STRING};
use crate::types::field_type::{FieldType, PrimitiveType};
use crate::types::hierarchy::ClassHierarchy;
use crate::types::Answer;

use self::integer::{IntValue, LongValue};
use self::reference::{
    join_references, single_from_bound, ArrayRef, NullRef, ObjectRef, ReferenceValue,
    SingleReference, TypeBound,
};

/// The place where a value was first materialized: an instruction for
/// computed values, or a synthetic negative index for parameters.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Copy)]
pub struct Origin(pub i32);

impl Origin {
    /// The origin of the parameter with the given index (the receiver of
    /// an instance method is parameter 0).
    #[must_use]
    pub const fn parameter(index: u16) -> Self {
        Self(-(index as i32) - 1)
    }

    /// Checks whether the value entered the method as a parameter.
    #[must_use]
    pub const fn is_parameter(self) -> bool {
        self.0 < 0
    }
}

impl From<ProgramCounter> for Origin {
    fn from(pc: ProgramCounter) -> Self {
        Self(i32::from(pc.0))
    }
}

/// The aliasing tag of a reference value. Two values carrying the same
/// timestamp are guaranteed to reference the same runtime object; values
/// with different timestamps may or may not alias. Timestamps are only
/// ever compared for equality.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Copy)]
pub struct Timestamp(pub u32);

/// The session-scoped timestamp allocator. Values below
/// [`TimestampCounter::FIRST`] are reserved for synthetic values such as
/// parameters.
#[derive(Debug, Clone)]
pub struct TimestampCounter {
    next: u32,
}

impl TimestampCounter {
    /// The first timestamp handed out for computed values.
    pub const FIRST: u32 = 100;

    fn new() -> Self {
        Self { next: Self::FIRST }
    }

    /// Allocates a fresh timestamp.
    pub(crate) fn fresh(&mut self) -> Timestamp {
        let t = Timestamp(self.next);
        self.next += 1;
        t
    }

    /// Makes sure the counter stays clear of the synthetic band
    /// `0..bound`.
    fn reserve_synthetic_band(&mut self, bound: u32) {
        if self.next < bound {
            self.next = bound;
        }
    }
}

/// An error raised when a requested refinement contradicts what is
/// already known about a value. This always signals a broken invariant in
/// the caller, never an analysis limitation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("impossible refinement: {0}")]
pub struct ImpossibleRefinement(pub String);

/// An abstract value of any sort.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Clone)]
pub enum AbstractValue {
    /// An `int` (or `byte`, `short`, `char`, `boolean`).
    Int(IntValue),
    /// A `long`.
    Long(LongValue),
    /// A `float`; tracked at the type level only.
    Float,
    /// A `double`; tracked at the type level only.
    Double,
    /// A reference.
    Reference(ReferenceValue),
    /// A return address pushed by `jsr`. Merging the frames of several
    /// call sites unions the possible addresses, which keeps `ret`
    /// polyvariant.
    ReturnAddress(std::collections::BTreeSet<ProgramCounter>),
}

impl AbstractValue {
    /// Checks whether the value occupies two operand stack slots.
    #[must_use]
    pub const fn is_wide(&self) -> bool {
        matches!(self, Self::Long(_) | Self::Double)
    }

    /// The contained reference value, if this is a reference.
    #[must_use]
    pub const fn as_reference(&self) -> Option<&ReferenceValue> {
        match self {
            Self::Reference(v) => Some(v),
            _ => None,
        }
    }
}

impl Display for AbstractValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Int(v) => v.fmt(f),
            Self::Long(v) => v.fmt(f),
            Self::Float => write!(f, "float"),
            Self::Double => write!(f, "double"),
            Self::Reference(v) => v.fmt(f),
            Self::ReturnAddress(addresses) => {
                use itertools::Itertools;
                write!(f, "return-address {}", addresses.iter().join("|"))
            }
        }
    }
}

/// The mutable state of one interpretation session.
///
/// A domain must not be shared between sessions; the class hierarchy it
/// holds is immutable and freely shared.
#[derive(Debug, Clone)]
pub struct Domain {
    class_hierarchy: Arc<ClassHierarchy>,
    timestamps: TimestampCounter,
    join_cache: HashMap<(ReferenceValue, ReferenceValue), ReferenceValue>,
}

impl Domain {
    /// Creates a fresh session over the given class hierarchy.
    #[must_use]
    pub fn new(class_hierarchy: Arc<ClassHierarchy>) -> Self {
        Self {
            class_hierarchy,
            timestamps: TimestampCounter::new(),
            join_cache: HashMap::new(),
        }
    }

    /// The class hierarchy backing this session.
    #[must_use]
    pub fn class_hierarchy(&self) -> &ClassHierarchy {
        &self.class_hierarchy
    }

    /// A clone of the shared class hierarchy handle.
    #[must_use]
    pub fn class_hierarchy_handle(&self) -> Arc<ClassHierarchy> {
        Arc::clone(&self.class_hierarchy)
    }

    /// A definitely-`null` value.
    pub fn null_value(&mut self, origin: impl Into<Origin>) -> ReferenceValue {
        ReferenceValue::Single(SingleReference::Null(NullRef {
            origin: origin.into(),
            timestamp: self.timestamps.fresh(),
        }))
    }

    /// The value produced by `new` once the constructor finished: known
    /// type, definitely not `null`.
    pub fn new_object(&mut self, origin: impl Into<Origin>, class: ClassRef) -> ReferenceValue {
        self.object_value(origin, Answer::No, true, class)
    }

    /// A non-`null` object whose bound is not known to be exact.
    pub fn non_null_object_value(
        &mut self,
        origin: impl Into<Origin>,
        class: ClassRef,
    ) -> ReferenceValue {
        self.object_value(origin, Answer::No, false, class)
    }

    /// An initialized object of unknown nullness.
    pub fn initialized_object_value(
        &mut self,
        origin: impl Into<Origin>,
        class: ClassRef,
    ) -> ReferenceValue {
        self.object_value(origin, Answer::Unknown, false, class)
    }

    /// A `java/lang/String` constant.
    pub fn string_value(&mut self, origin: impl Into<Origin>) -> ReferenceValue {
        self.object_value(origin, Answer::No, true, ClassRef::new(JAVA_LANG_STRING))
    }

    /// A `java/lang/Class` constant.
    pub fn class_value(&mut self, origin: impl Into<Origin>) -> ReferenceValue {
        self.object_value(origin, Answer::No, true, ClassRef::new(JAVA_LANG_CLASS))
    }

    /// An object value with explicit nullness and precision. Finality
    /// recorded in the class hierarchy forces precision.
    pub fn object_value(
        &mut self,
        origin: impl Into<Origin>,
        is_null: Answer,
        is_precise: bool,
        class: ClassRef,
    ) -> ReferenceValue {
        let is_precise = is_precise || self.class_hierarchy.is_known_to_be_final(&class);
        ReferenceValue::Single(SingleReference::Object(ObjectRef {
            origin: origin.into(),
            is_null,
            is_precise,
            class,
            timestamp: self.timestamps.fresh(),
        }))
    }

    /// The value produced by `newarray`, `anewarray`, or
    /// `multianewarray`: exact type, definitely not `null`.
    pub fn new_array(&mut self, origin: impl Into<Origin>, array_type: FieldType) -> ReferenceValue {
        self.array_value(origin, Answer::No, true, array_type)
    }

    /// An initialized, non-`null` array of not necessarily exact type.
    pub fn initialized_array_value(
        &mut self,
        origin: impl Into<Origin>,
        array_type: FieldType,
    ) -> ReferenceValue {
        self.array_value(origin, Answer::No, false, array_type)
    }

    /// An array value with explicit nullness and precision.
    pub fn array_value(
        &mut self,
        origin: impl Into<Origin>,
        is_null: Answer,
        is_precise: bool,
        array_type: FieldType,
    ) -> ReferenceValue {
        debug_assert!(matches!(array_type, FieldType::Array(_)));
        ReferenceValue::Single(SingleReference::Array(ArrayRef {
            origin: origin.into(),
            is_null,
            is_precise,
            array_type,
            timestamp: self.timestamps.fresh(),
        }))
    }

    /// The non-`null`, precise exception value the VM materializes when
    /// an instruction raises an implicit exception.
    pub fn vm_thrown_exception(
        &mut self,
        origin: impl Into<Origin>,
        class_name: &str,
    ) -> ReferenceValue {
        self.object_value(origin, Answer::No, true, ClassRef::new(class_name))
    }

    /// An `int` value; `None` is the top of the sort.
    #[must_use]
    pub fn integer_value(&mut self, value: Option<i32>) -> AbstractValue {
        AbstractValue::Int(value.map_or(IntValue::Any, IntValue::Exact))
    }

    /// A `long` value; `None` is the top of the sort.
    #[must_use]
    pub fn long_value(&mut self, value: Option<i64>) -> AbstractValue {
        AbstractValue::Long(value.map_or(LongValue::Any, LongValue::Exact))
    }

    /// The top value of an arbitrary field type, used for parameters and
    /// for results the session cannot see into.
    pub fn value_of_type(&mut self, origin: impl Into<Origin>, t: &FieldType) -> AbstractValue {
        match t {
            FieldType::Base(PrimitiveType::Long) => AbstractValue::Long(LongValue::Any),
            FieldType::Base(PrimitiveType::Float) => AbstractValue::Float,
            FieldType::Base(PrimitiveType::Double) => AbstractValue::Double,
            FieldType::Base(_) => AbstractValue::Int(IntValue::Any),
            FieldType::Object(class) => AbstractValue::Reference(self.initialized_object_value(
                origin,
                class.clone(),
            )),
            FieldType::Array(_) => AbstractValue::Reference(self.array_value(
                origin,
                Answer::Unknown,
                false,
                t.clone(),
            )),
        }
    }

    /// Reserves the timestamp band `0..count` for synthetic values.
    pub(crate) fn reserve_synthetic_band(&mut self, count: u32) {
        self.timestamps.reserve_synthetic_band(count);
    }

    /// Joins two reference values.
    ///
    /// The join is memoized per value pair: re-joining the same pair
    /// yields the identical result including timestamps, which lets the
    /// fixed point settle.
    pub fn join_reference(
        &mut self,
        current: &ReferenceValue,
        incoming: &ReferenceValue,
    ) -> Update<ReferenceValue> {
        if current == incoming {
            return Update::NoUpdate;
        }
        let key = (current.clone(), incoming.clone());
        let joined = match self.join_cache.get(&key) {
            Some(cached) => cached.clone(),
            None => {
                let joined = join_references(
                    current,
                    incoming,
                    &self.class_hierarchy,
                    &mut self.timestamps,
                );
                self.join_cache.insert(key, joined.clone());
                joined
            }
        };
        if joined == *current {
            Update::NoUpdate
        } else if joined.equal_ignoring_timestamp(current) {
            Update::TimestampUpdate(joined)
        } else {
            Update::StructuralUpdate(joined)
        }
    }

    /// Joins two values of any sort. Returns `None` when the sorts are
    /// incompatible (e.g. an `int` meets a reference), which the caller
    /// resolves per storage location.
    pub fn join_values(
        &mut self,
        current: &AbstractValue,
        incoming: &AbstractValue,
    ) -> Option<Update<AbstractValue>> {
        use AbstractValue::{Double, Float, Int, Long, Reference, ReturnAddress};
        let update = match (current, incoming) {
            (Int(a), Int(b)) => {
                let joined = a.join(*b);
                if joined == *a {
                    Update::NoUpdate
                } else {
                    Update::StructuralUpdate(Int(joined))
                }
            }
            (Long(a), Long(b)) => {
                let joined = a.join(*b);
                if joined == *a {
                    Update::NoUpdate
                } else {
                    Update::StructuralUpdate(Long(joined))
                }
            }
            (Float, Float) | (Double, Double) => Update::NoUpdate,
            (Reference(a), Reference(b)) => self.join_reference(a, b).map(Reference),
            (ReturnAddress(a), ReturnAddress(b)) => {
                if b.is_subset(a) {
                    Update::NoUpdate
                } else {
                    let mut union = a.clone();
                    union.extend(b.iter().copied());
                    Update::StructuralUpdate(ReturnAddress(union))
                }
            }
            _ => return None,
        };
        Some(update)
    }

    /// Collapses a reference value to a single-origin value at `pc`.
    pub fn summarize(&mut self, pc: ProgramCounter, value: &ReferenceValue) -> ReferenceValue {
        value.summarize(
            Origin::from(pc),
            &mut self.timestamps,
            &self.class_hierarchy,
        )
    }

    /// Rebuilds a value of another session in this session, materialized
    /// at `origin`. Used when a callee's results flow back to a caller.
    pub fn adapt_value(&mut self, value: &AbstractValue, origin: impl Into<Origin>) -> AbstractValue {
        match value {
            AbstractValue::Reference(reference) => {
                let origin = origin.into();
                let (is_null, is_precise, bound) =
                    (reference.is_null(), reference.is_precise(), reference.bound());
                let adapted = match bound {
                    TypeBound::None => ReferenceValue::Single(SingleReference::Null(NullRef {
                        origin,
                        timestamp: self.timestamps.fresh(),
                    })),
                    bound => ReferenceValue::Single(single_from_bound(
                        origin,
                        is_null,
                        is_precise,
                        bound,
                        self.timestamps.fresh(),
                        &self.class_hierarchy,
                    )),
                };
                AbstractValue::Reference(adapted)
            }
            other => other.clone(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn domain() -> Domain {
        Domain::new(Arc::new(ClassHierarchy::with_java_lang_types([])))
    }

    #[test]
    fn factories_allocate_fresh_timestamps() {
        let mut domain = domain();
        let a = domain.null_value(ProgramCounter(0));
        let b = domain.null_value(ProgramCounter(0));
        assert_ne!(a.timestamp(), b.timestamp());
        assert!(a.timestamp().0 >= TimestampCounter::FIRST);
    }

    #[test]
    fn new_object_is_precise_and_non_null() {
        let mut domain = domain();
        let value = domain.new_object(ProgramCounter(4), ClassRef::new("java/lang/Object"));
        assert_eq!(value.is_null(), Answer::No);
        assert!(value.is_precise());
    }

    #[test]
    fn final_classes_force_precision() {
        let mut domain = domain();
        let value = domain
            .initialized_object_value(ProgramCounter(0), ClassRef::new("java/lang/String"));
        assert!(value.is_precise());
    }

    #[test]
    fn string_and_class_constants() {
        let mut domain = domain();
        let string = domain.string_value(ProgramCounter(0));
        assert_eq!(
            string.bound(),
            TypeBound::Class(ClassRef::new("java/lang/String"))
        );
        let class = domain.class_value(ProgramCounter(1));
        assert_eq!(
            class.bound(),
            TypeBound::Class(ClassRef::new("java/lang/Class"))
        );
        assert_eq!(class.is_null(), Answer::No);
    }

    #[test]
    fn join_is_memoized() {
        let mut domain = domain();
        let a = domain.initialized_object_value(ProgramCounter(1), ClassRef::object());
        let b = domain.initialized_object_value(ProgramCounter(2), ClassRef::object());
        let first = domain.join_reference(&a, &b).into_value().unwrap();
        let second = domain.join_reference(&a, &b).into_value().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn incompatible_sorts_do_not_join() {
        let mut domain = domain();
        let int = domain.integer_value(Some(1));
        let null = AbstractValue::Reference(domain.null_value(ProgramCounter(0)));
        assert!(domain.join_values(&int, &null).is_none());
    }
}
