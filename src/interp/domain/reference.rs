//! The reference value lattice.
//!
//! A reference value is either a single-origin value (`null`, an object
//! with a single upper bound, an object with an intersection bound, or an
//! array) or the join of several single-origin values with distinct
//! origins. Values are immutable; every operation returns a new value.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt::Display;

use itertools::Itertools;

use crate::jvm::references::{ClassRef, JAVA_IO_SERIALIZABLE, JAVA_LANG_CLONEABLE};
use crate::types::field_type::FieldType;
use crate::types::hierarchy::{ClassHierarchy, TypeBoundJoin};
use crate::types::Answer;

use super::{ImpossibleRefinement, Origin, Timestamp, TimestampCounter};

/// A value that is definitely `null`.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Clone)]
pub struct NullRef {
    /// Where the value was materialized.
    pub origin: Origin,
    /// The aliasing tag of the value.
    pub timestamp: Timestamp,
}

/// A reference bounded by a single class or interface type.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Clone)]
pub struct ObjectRef {
    /// Where the value was materialized.
    pub origin: Origin,
    /// Whether the value is `null`; never [`Answer::Yes`].
    pub is_null: Answer,
    /// Whether the upper bound is the exact runtime type.
    pub is_precise: bool,
    /// The upper bound.
    pub class: ClassRef,
    /// The aliasing tag of the value.
    pub timestamp: Timestamp,
}

/// A reference bounded by an intersection of at least two object types.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Clone)]
pub struct MultiTypedRef {
    /// Where the value was materialized.
    pub origin: Origin,
    /// Whether the value is `null`; never [`Answer::Yes`].
    pub is_null: Answer,
    /// The bounding types; minimal, at least two, never array types.
    pub bounds: BTreeSet<ClassRef>,
    /// The aliasing tag of the value.
    pub timestamp: Timestamp,
}

/// A reference to an array.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Clone)]
pub struct ArrayRef {
    /// Where the value was materialized.
    pub origin: Origin,
    /// Whether the value is `null`; never [`Answer::Yes`].
    pub is_null: Answer,
    /// Whether the bound is the exact runtime type.
    pub is_precise: bool,
    /// The upper bound; always a [`FieldType::Array`].
    pub array_type: FieldType,
    /// The aliasing tag of the value.
    pub timestamp: Timestamp,
}

/// A reference value with a single origin.
#[derive(Debug, PartialEq, Eq, Hash, Clone)]
pub enum SingleReference {
    /// Definitely `null`.
    Null(NullRef),
    /// Bounded by a single object type.
    Object(ObjectRef),
    /// Bounded by an intersection of object types.
    MultiTyped(MultiTypedRef),
    /// An array.
    Array(ArrayRef),
}

/// The join of several single-origin values with pairwise distinct
/// origins.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Clone)]
pub struct MultipleReference {
    /// The joined values, ordered by origin.
    pub values: BTreeSet<SingleReference>,
    /// The aggregated nullness of the members.
    pub is_null: Answer,
    /// Whether every member is precise with one common bound.
    pub is_precise: bool,
    /// The aggregated upper bound of the members.
    pub bound: TypeBound,
    /// The aliasing tag of the value.
    pub timestamp: Timestamp,
}

/// An abstract reference value.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Clone)]
pub enum ReferenceValue {
    /// A value with a single origin.
    Single(SingleReference),
    /// A join of values with distinct origins.
    Multiple(MultipleReference),
}

/// An upper type bound.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Clone)]
pub enum TypeBound {
    /// No type information: the value is `null`.
    None,
    /// A single class or interface type.
    Class(ClassRef),
    /// An intersection of at least two object types.
    Intersection(BTreeSet<ClassRef>),
    /// An array type.
    Array(FieldType),
}

impl TypeBound {
    /// Builds a bound from a set of object types.
    #[must_use]
    pub fn from_classes(classes: BTreeSet<ClassRef>) -> Self {
        match classes.len() {
            0 => TypeBound::None,
            1 => TypeBound::Class(classes.into_iter().next().expect("one element")),
            _ => TypeBound::Intersection(classes),
        }
    }
}

/// Values inside a [`MultipleReference`] are ordered by origin; the
/// remaining fields only keep the order total.
impl Ord for SingleReference {
    fn cmp(&self, other: &Self) -> Ordering {
        fn rank(value: &SingleReference) -> u8 {
            match value {
                SingleReference::Null(_) => 0,
                SingleReference::Object(_) => 1,
                SingleReference::MultiTyped(_) => 2,
                SingleReference::Array(_) => 3,
            }
        }
        self.origin()
            .cmp(&other.origin())
            .then_with(|| rank(self).cmp(&rank(other)))
            .then_with(|| match (self, other) {
                (SingleReference::Null(a), SingleReference::Null(b)) => {
                    a.timestamp.cmp(&b.timestamp)
                }
                (SingleReference::Object(a), SingleReference::Object(b)) => {
                    (&a.is_null, a.is_precise, &a.class, a.timestamp).cmp(&(
                        &b.is_null,
                        b.is_precise,
                        &b.class,
                        b.timestamp,
                    ))
                }
                (SingleReference::MultiTyped(a), SingleReference::MultiTyped(b)) => {
                    (&a.is_null, &a.bounds, a.timestamp).cmp(&(&b.is_null, &b.bounds, b.timestamp))
                }
                (SingleReference::Array(a), SingleReference::Array(b)) => {
                    (&a.is_null, a.is_precise, &a.array_type, a.timestamp).cmp(&(
                        &b.is_null,
                        b.is_precise,
                        &b.array_type,
                        b.timestamp,
                    ))
                }
                _ => Ordering::Equal,
            })
    }
}

impl PartialOrd for SingleReference {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl SingleReference {
    /// Where the value was materialized.
    #[must_use]
    pub fn origin(&self) -> Origin {
        match self {
            Self::Null(v) => v.origin,
            Self::Object(v) => v.origin,
            Self::MultiTyped(v) => v.origin,
            Self::Array(v) => v.origin,
        }
    }

    /// The aliasing tag of the value.
    #[must_use]
    pub fn timestamp(&self) -> Timestamp {
        match self {
            Self::Null(v) => v.timestamp,
            Self::Object(v) => v.timestamp,
            Self::MultiTyped(v) => v.timestamp,
            Self::Array(v) => v.timestamp,
        }
    }

    /// Whether the value is `null`.
    #[must_use]
    pub fn is_null(&self) -> Answer {
        match self {
            Self::Null(_) => Answer::Yes,
            Self::Object(v) => v.is_null,
            Self::MultiTyped(v) => v.is_null,
            Self::Array(v) => v.is_null,
        }
    }

    /// Whether the bound is the exact runtime type. A `null` value is
    /// vacuously precise.
    #[must_use]
    pub fn is_precise(&self) -> bool {
        match self {
            Self::Null(_) => true,
            Self::Object(v) => v.is_precise,
            Self::MultiTyped(_) => false,
            Self::Array(v) => v.is_precise,
        }
    }

    /// The upper type bound of the value.
    #[must_use]
    pub fn bound(&self) -> TypeBound {
        match self {
            Self::Null(_) => TypeBound::None,
            Self::Object(v) => TypeBound::Class(v.class.clone()),
            Self::MultiTyped(v) => TypeBound::Intersection(v.bounds.clone()),
            Self::Array(v) => TypeBound::Array(v.array_type.clone()),
        }
    }

    /// The same value carrying another timestamp.
    #[must_use]
    pub fn with_timestamp(&self, timestamp: Timestamp) -> Self {
        let mut result = self.clone();
        match &mut result {
            Self::Null(v) => v.timestamp = timestamp,
            Self::Object(v) => v.timestamp = timestamp,
            Self::MultiTyped(v) => v.timestamp = timestamp,
            Self::Array(v) => v.timestamp = timestamp,
        }
        result
    }
}

impl ReferenceValue {
    /// Where the value was materialized. For a [`MultipleReference`] this
    /// is the origin of no particular member, so the members must be
    /// consulted instead; `None` marks that case.
    #[must_use]
    pub fn single_origin(&self) -> Option<Origin> {
        match self {
            Self::Single(v) => Some(v.origin()),
            Self::Multiple(_) => None,
        }
    }

    /// The aliasing tag of the value.
    #[must_use]
    pub fn timestamp(&self) -> Timestamp {
        match self {
            Self::Single(v) => v.timestamp(),
            Self::Multiple(v) => v.timestamp,
        }
    }

    /// Whether the value is `null`.
    #[must_use]
    pub fn is_null(&self) -> Answer {
        match self {
            Self::Single(v) => v.is_null(),
            Self::Multiple(v) => v.is_null,
        }
    }

    /// Whether the bound is the exact runtime type.
    #[must_use]
    pub fn is_precise(&self) -> bool {
        match self {
            Self::Single(v) => v.is_precise(),
            Self::Multiple(v) => v.is_precise,
        }
    }

    /// The upper type bound of the value.
    #[must_use]
    pub fn bound(&self) -> TypeBound {
        match self {
            Self::Single(v) => v.bound(),
            Self::Multiple(v) => v.bound.clone(),
        }
    }

    /// Compares two values while ignoring every timestamp.
    #[must_use]
    pub fn equal_ignoring_timestamp(&self, other: &ReferenceValue) -> bool {
        strip_timestamps(self) == strip_timestamps(other)
    }

    /// Checks whether this value over-approximates every runtime state
    /// `other` admits. Timestamps are not part of the abstraction.
    #[must_use]
    pub fn abstracts_over(&self, other: &ReferenceValue, class_hierarchy: &ClassHierarchy) -> bool {
        match (self, other) {
            (Self::Single(a), Self::Single(b)) => single_abstracts_over(a, b, class_hierarchy),
            (Self::Multiple(a), Self::Single(b)) => a
                .values
                .iter()
                .any(|member| member.origin() == b.origin())
                && a.values
                    .iter()
                    .filter(|member| member.origin() == b.origin())
                    .all(|member| single_abstracts_over(member, b, class_hierarchy)),
            (Self::Multiple(a), Self::Multiple(b)) => b.values.iter().all(|bv| {
                a.values.iter().any(|av| {
                    av.origin() == bv.origin() && single_abstracts_over(av, bv, class_hierarchy)
                })
            }),
            (Self::Single(_), Self::Multiple(_)) => false,
        }
    }

    /// Whether the runtime value is an instance of `target`.
    /// A `null` value is a member of every reference type.
    #[must_use]
    pub fn is_value_subtype_of(
        &self,
        target: &FieldType,
        class_hierarchy: &ClassHierarchy,
    ) -> Answer {
        match self {
            Self::Single(v) => single_is_subtype_of(v, target, class_hierarchy),
            Self::Multiple(m) => {
                let answers: Vec<Answer> = m
                    .values
                    .iter()
                    .map(|member| single_is_subtype_of(member, target, class_hierarchy))
                    .collect();
                answers
                    .into_iter()
                    .reduce(Answer::join)
                    .unwrap_or(Answer::Unknown)
            }
        }
    }

    /// Narrows the nullness of the value. The nullness must still be
    /// undecided; refining a value that is already definitely `null` or
    /// definitely not `null` breaks an upstream invariant.
    pub fn refine_is_null(&self, answer: Answer) -> Result<ReferenceValue, ImpossibleRefinement> {
        debug_assert!(!answer.is_unknown());
        match self {
            Self::Single(v) => refine_single_is_null(v, answer).map(ReferenceValue::Single),
            Self::Multiple(m) => {
                if !m.is_null.is_unknown() {
                    return Err(ImpossibleRefinement(format!(
                        "cannot refine nullness to {answer}: it is already {}",
                        m.is_null
                    )));
                }
                let refined: Vec<SingleReference> = if answer.is_yes() {
                    m.values
                        .iter()
                        .filter(|member| !member.is_null().is_no())
                        .map(|member| {
                            SingleReference::Null(NullRef {
                                origin: member.origin(),
                                timestamp: member.timestamp(),
                            })
                        })
                        .collect()
                } else {
                    m.values
                        .iter()
                        .filter(|member| !member.is_null().is_yes())
                        .map(|member| {
                            if member.is_null().is_unknown() {
                                refine_single_is_null(member, Answer::No)
                                    .expect("nullness is undecided")
                            } else {
                                member.clone()
                            }
                        })
                        .collect()
                };
                rebuild_multiple(refined, m.timestamp).ok_or_else(|| {
                    ImpossibleRefinement(format!(
                        "no member of the joined value can satisfy null = {answer}"
                    ))
                })
            }
        }
    }

    /// Sharpens the upper type bound of the value towards `target`.
    /// The new bound is never above the old one; an impossible transition
    /// (e.g. a precise type unrelated to `target`) is an error.
    pub fn refine_upper_type_bound(
        &self,
        target: &FieldType,
        class_hierarchy: &ClassHierarchy,
    ) -> Result<ReferenceValue, ImpossibleRefinement> {
        match self {
            Self::Single(v) => {
                refine_single_bound(v, target, class_hierarchy).map(ReferenceValue::Single)
            }
            Self::Multiple(m) => {
                let mut refined = Vec::new();
                for member in &m.values {
                    if matches!(member, SingleReference::Null(_)) {
                        // null passes every type test unchanged.
                        refined.push(member.clone());
                        continue;
                    }
                    // A member that cannot satisfy the bound is infeasible
                    // on this path and is dropped.
                    if let Ok(member) = refine_single_bound(member, target, class_hierarchy) {
                        refined.push(member);
                    }
                }
                rebuild_multiple(refined, m.timestamp).ok_or_else(|| {
                    ImpossibleRefinement(format!(
                        "no member of the joined value can be a {target}"
                    ))
                })
            }
        }
    }

    /// Collapses the value to a single-origin value materialized at `pc`.
    #[must_use]
    pub fn summarize(
        &self,
        origin: Origin,
        timestamps: &mut TimestampCounter,
        class_hierarchy: &ClassHierarchy,
    ) -> ReferenceValue {
        match self {
            Self::Single(_) => self.clone(),
            Self::Multiple(m) => ReferenceValue::Single(single_from_bound(
                origin,
                m.is_null,
                m.is_precise,
                m.bound.clone(),
                timestamps.fresh(),
                class_hierarchy,
            )),
        }
    }
}

fn single_abstracts_over(
    a: &SingleReference,
    b: &SingleReference,
    class_hierarchy: &ClassHierarchy,
) -> bool {
    if a.origin() != b.origin() {
        return false;
    }
    // Nullness must not be narrower.
    let nullness_covers = a.is_null().is_unknown() || a.is_null() == b.is_null();
    if !nullness_covers {
        return false;
    }
    // A `null` is covered by compatible nullness alone; its bound is
    // empty.
    if matches!(b, SingleReference::Null(_)) {
        return true;
    }
    // Precision constrains the non-null runtime states.
    if a.is_precise() && !matches!(a, SingleReference::Null(_)) {
        return b.is_precise() && a.bound() == b.bound();
    }
    bound_covers(&a.bound(), &b.bound(), class_hierarchy)
}

/// Checks whether `outer` is an upper bound of everything `inner` admits.
fn bound_covers(outer: &TypeBound, inner: &TypeBound, class_hierarchy: &ClassHierarchy) -> bool {
    match (outer, inner) {
        (_, TypeBound::None) => true,
        (TypeBound::None, _) => false,
        (TypeBound::Class(o), TypeBound::Class(i)) => {
            class_hierarchy.is_object_subtype_of(i, o).is_yes()
        }
        (TypeBound::Class(o), TypeBound::Intersection(is)) => is
            .iter()
            .any(|i| class_hierarchy.is_object_subtype_of(i, o).is_yes()),
        (TypeBound::Intersection(os), TypeBound::Class(i)) => os
            .iter()
            .all(|o| class_hierarchy.is_object_subtype_of(i, o).is_yes()),
        (TypeBound::Intersection(os), TypeBound::Intersection(is)) => os.iter().all(|o| {
            is.iter()
                .any(|i| class_hierarchy.is_object_subtype_of(i, o).is_yes())
        }),
        (TypeBound::Array(o), TypeBound::Array(i)) => {
            class_hierarchy.is_subtype_of(i, o).is_yes()
        }
        (TypeBound::Class(o), TypeBound::Array(_)) => {
            o.is_object()
                || o.binary_name == JAVA_IO_SERIALIZABLE
                || o.binary_name == JAVA_LANG_CLONEABLE
        }
        (TypeBound::Intersection(os), TypeBound::Array(_)) => os.iter().all(|o| {
            o.is_object()
                || o.binary_name == JAVA_IO_SERIALIZABLE
                || o.binary_name == JAVA_LANG_CLONEABLE
        }),
        (TypeBound::Array(_), TypeBound::Class(_) | TypeBound::Intersection(_)) => false,
    }
}

fn single_is_subtype_of(
    value: &SingleReference,
    target: &FieldType,
    class_hierarchy: &ClassHierarchy,
) -> Answer {
    match value {
        SingleReference::Null(_) => Answer::Yes,
        SingleReference::Object(v) => {
            let as_type = FieldType::Object(v.class.clone());
            let upward = class_hierarchy.is_subtype_of(&as_type, target);
            if upward.is_yes() {
                return Answer::Yes;
            }
            if v.is_precise {
                return upward;
            }
            if class_hierarchy.is_subtype_of(target, &as_type).is_no() && upward.is_no() {
                Answer::No
            } else {
                Answer::Unknown
            }
        }
        SingleReference::MultiTyped(v) => {
            let definite = v.bounds.iter().any(|bound| {
                class_hierarchy
                    .is_subtype_of(&FieldType::Object(bound.clone()), target)
                    .is_yes()
            });
            if definite {
                Answer::Yes
            } else {
                Answer::Unknown
            }
        }
        SingleReference::Array(v) => {
            let upward = class_hierarchy.is_subtype_of(&v.array_type, target);
            if upward.is_yes() {
                return Answer::Yes;
            }
            if v.is_precise {
                return upward;
            }
            if class_hierarchy.is_subtype_of(target, &v.array_type).is_no() && upward.is_no() {
                Answer::No
            } else {
                Answer::Unknown
            }
        }
    }
}

fn refine_single_is_null(
    value: &SingleReference,
    answer: Answer,
) -> Result<SingleReference, ImpossibleRefinement> {
    if !value.is_null().is_unknown() {
        return Err(ImpossibleRefinement(format!(
            "cannot refine nullness to {answer}: it is already {}",
            value.is_null()
        )));
    }
    if answer.is_yes() {
        return Ok(SingleReference::Null(NullRef {
            origin: value.origin(),
            timestamp: value.timestamp(),
        }));
    }
    let mut refined = value.clone();
    match &mut refined {
        SingleReference::Object(v) => v.is_null = Answer::No,
        SingleReference::MultiTyped(v) => v.is_null = Answer::No,
        SingleReference::Array(v) => v.is_null = Answer::No,
        SingleReference::Null(_) => unreachable!("nullness of null is decided"),
    }
    Ok(refined)
}

fn refine_single_bound(
    value: &SingleReference,
    target: &FieldType,
    class_hierarchy: &ClassHierarchy,
) -> Result<SingleReference, ImpossibleRefinement> {
    let array_compatible = |class: &ClassRef| {
        class.is_object()
            || class.binary_name == JAVA_IO_SERIALIZABLE
            || class.binary_name == JAVA_LANG_CLONEABLE
    };
    match (value, target) {
        (SingleReference::Null(_), _) => Err(ImpossibleRefinement(
            "cannot refine the type bound of null".into(),
        )),
        (SingleReference::Object(v), FieldType::Object(target_class)) => {
            let downward = class_hierarchy.is_object_subtype_of(target_class, &v.class);
            let upward = class_hierarchy.is_object_subtype_of(&v.class, target_class);
            if upward.is_yes() {
                // Already at or below the requested bound.
                return Ok(value.clone());
            }
            if downward.is_yes() {
                let mut refined = v.clone();
                refined.class = target_class.clone();
                refined.is_precise =
                    refined.is_precise || class_hierarchy.is_known_to_be_final(target_class);
                return Ok(SingleReference::Object(refined));
            }
            if v.is_precise {
                return if downward.is_no() && upward.is_no() {
                    Err(ImpossibleRefinement(format!(
                        "the precise type {} cannot be a {target_class}",
                        v.class
                    )))
                } else {
                    Ok(value.clone())
                };
            }
            if downward.is_no() && upward.is_no() {
                // Incomparable types intersect.
                let bounds = class_hierarchy.minimize_type_set(BTreeSet::from([
                    v.class.clone(),
                    target_class.clone(),
                ]));
                return Ok(match TypeBound::from_classes(bounds) {
                    TypeBound::Class(class) => SingleReference::Object(ObjectRef {
                        origin: v.origin,
                        is_null: v.is_null,
                        is_precise: class_hierarchy.is_known_to_be_final(&class),
                        class,
                        timestamp: v.timestamp,
                    }),
                    TypeBound::Intersection(bounds) => SingleReference::MultiTyped(MultiTypedRef {
                        origin: v.origin,
                        is_null: v.is_null,
                        bounds,
                        timestamp: v.timestamp,
                    }),
                    _ => value.clone(),
                });
            }
            // The relation is unknown; the current bound stays sound.
            Ok(value.clone())
        }
        (SingleReference::Object(v), FieldType::Array(_)) => {
            if v.is_precise {
                return Err(ImpossibleRefinement(format!(
                    "the precise type {} cannot be an array",
                    v.class
                )));
            }
            if array_compatible(&v.class) {
                Ok(SingleReference::Array(ArrayRef {
                    origin: v.origin,
                    is_null: v.is_null,
                    is_precise: false,
                    array_type: target.clone(),
                    timestamp: v.timestamp,
                }))
            } else {
                Err(ImpossibleRefinement(format!(
                    "a value bounded by {} cannot be an array",
                    v.class
                )))
            }
        }
        (SingleReference::MultiTyped(v), FieldType::Object(target_class)) => {
            let mut bounds = v.bounds.clone();
            bounds.insert(target_class.clone());
            let bounds = class_hierarchy.minimize_type_set(bounds);
            Ok(match TypeBound::from_classes(bounds) {
                TypeBound::Class(class) => SingleReference::Object(ObjectRef {
                    origin: v.origin,
                    is_null: v.is_null,
                    is_precise: class_hierarchy.is_known_to_be_final(&class),
                    class,
                    timestamp: v.timestamp,
                }),
                TypeBound::Intersection(bounds) => SingleReference::MultiTyped(MultiTypedRef {
                    origin: v.origin,
                    is_null: v.is_null,
                    bounds,
                    timestamp: v.timestamp,
                }),
                _ => value.clone(),
            })
        }
        (SingleReference::MultiTyped(v), FieldType::Array(_)) => {
            if v.bounds.iter().all(array_compatible) {
                Ok(SingleReference::Array(ArrayRef {
                    origin: v.origin,
                    is_null: v.is_null,
                    is_precise: false,
                    array_type: target.clone(),
                    timestamp: v.timestamp,
                }))
            } else {
                Err(ImpossibleRefinement(format!(
                    "a value bounded by {} cannot be an array",
                    v.bounds.iter().join(" & ")
                )))
            }
        }
        (SingleReference::Array(v), FieldType::Array(_)) => {
            let downward = class_hierarchy.is_subtype_of(target, &v.array_type);
            let upward = class_hierarchy.is_subtype_of(&v.array_type, target);
            if upward.is_yes() {
                return Ok(value.clone());
            }
            if downward.is_yes() {
                let mut refined = v.clone();
                refined.array_type = target.clone();
                return Ok(SingleReference::Array(refined));
            }
            if downward.is_no() && upward.is_no() {
                return Err(ImpossibleRefinement(format!(
                    "the array type {} cannot be a {target}",
                    v.array_type
                )));
            }
            Ok(value.clone())
        }
        (SingleReference::Array(v), FieldType::Object(target_class)) => {
            if array_compatible(target_class) {
                Ok(value.clone())
            } else {
                Err(ImpossibleRefinement(format!(
                    "the array type {} cannot be a {target_class}",
                    v.array_type
                )))
            }
        }
        (_, FieldType::Base(_)) => Err(ImpossibleRefinement(format!(
            "{target} is not a reference type"
        ))),
    }
}

/// Builds a single-origin value matching an aggregated bound.
pub(crate) fn single_from_bound(
    origin: Origin,
    is_null: Answer,
    is_precise: bool,
    bound: TypeBound,
    timestamp: Timestamp,
    class_hierarchy: &ClassHierarchy,
) -> SingleReference {
    match bound {
        TypeBound::None => SingleReference::Null(NullRef { origin, timestamp }),
        TypeBound::Class(class) => {
            let is_precise = is_precise || class_hierarchy.is_known_to_be_final(&class);
            SingleReference::Object(ObjectRef {
                origin,
                is_null,
                is_precise,
                class,
                timestamp,
            })
        }
        TypeBound::Intersection(bounds) => SingleReference::MultiTyped(MultiTypedRef {
            origin,
            is_null,
            bounds,
            timestamp,
        }),
        TypeBound::Array(array_type) => SingleReference::Array(ArrayRef {
            origin,
            is_null,
            is_precise,
            array_type,
            timestamp,
        }),
    }
}

/// Joins two upper type bounds.
pub(crate) fn join_type_bounds(
    a: &TypeBound,
    b: &TypeBound,
    class_hierarchy: &ClassHierarchy,
) -> TypeBound {
    match (a, b) {
        (TypeBound::None, other) | (other, TypeBound::None) => other.clone(),
        (TypeBound::Class(x), TypeBound::Class(y)) => TypeBound::from_classes(
            class_hierarchy.join_object_types(x, &BTreeSet::from([y.clone()]), true),
        ),
        (TypeBound::Class(x), TypeBound::Intersection(ys))
        | (TypeBound::Intersection(ys), TypeBound::Class(x)) => TypeBound::from_classes(
            class_hierarchy.join_object_type_bounds(&BTreeSet::from([x.clone()]), ys),
        ),
        (TypeBound::Intersection(xs), TypeBound::Intersection(ys)) => {
            TypeBound::from_classes(class_hierarchy.join_object_type_bounds(xs, ys))
        }
        (TypeBound::Array(x), TypeBound::Array(y)) => {
            match class_hierarchy.join_array_types(x, y) {
                TypeBoundJoin::ArrayType(t) => TypeBound::Array(t),
                TypeBoundJoin::ObjectTypes(classes) => TypeBound::from_classes(classes),
            }
        }
        (TypeBound::Array(_), TypeBound::Class(c)) | (TypeBound::Class(c), TypeBound::Array(_)) => {
            TypeBound::from_classes(class_hierarchy.join_any_array_type_with_object_type(c))
        }
        (TypeBound::Array(_), TypeBound::Intersection(cs))
        | (TypeBound::Intersection(cs), TypeBound::Array(_)) => TypeBound::from_classes(
            class_hierarchy
                .join_object_type_bounds(&ClassHierarchy::serializable_and_cloneable(), cs),
        ),
    }
}

/// Joins two single-origin values sharing the same origin.
fn join_same_origin(
    a: &SingleReference,
    b: &SingleReference,
    class_hierarchy: &ClassHierarchy,
    timestamps: &mut TimestampCounter,
) -> SingleReference {
    if a == b {
        return a.clone();
    }
    debug_assert_eq!(a.origin(), b.origin());
    let timestamp = if a.timestamp() == b.timestamp() {
        a.timestamp()
    } else {
        timestamps.fresh()
    };
    let is_null = a.is_null().join(b.is_null());
    let bound = join_type_bounds(&a.bound(), &b.bound(), class_hierarchy);
    let is_precise = a.is_precise() && b.is_precise() && {
        // Null is vacuously precise; a shared concrete bound is required
        // otherwise.
        let (ab, bb) = (a.bound(), b.bound());
        ab == bb || matches!(ab, TypeBound::None) || matches!(bb, TypeBound::None)
    };
    single_from_bound(
        a.origin(),
        is_null,
        is_precise,
        bound,
        timestamp,
        class_hierarchy,
    )
}

/// Rebuilds a reference value from refined members. Returns `None` when
/// no member is left.
fn rebuild_multiple(
    members: Vec<SingleReference>,
    timestamp: Timestamp,
) -> Option<ReferenceValue> {
    match members.len() {
        0 => None,
        1 => Some(ReferenceValue::Single(
            members.into_iter().next().expect("one member"),
        )),
        _ => Some(make_multiple(members.into_iter().collect(), timestamp)),
    }
}

/// Aggregates the member facts of a multi-origin value. The timestamp is
/// kept when every member agrees on it.
pub(crate) fn make_multiple(values: BTreeSet<SingleReference>, fallback: Timestamp) -> ReferenceValue {
    debug_assert!(values.len() >= 2);
    let is_null = values
        .iter()
        .map(SingleReference::is_null)
        .reduce(Answer::join)
        .unwrap_or(Answer::Unknown);
    let bounds: Vec<TypeBound> = values
        .iter()
        .map(SingleReference::bound)
        .filter(|bound| !matches!(bound, TypeBound::None))
        .collect();
    let is_precise = values.iter().all(SingleReference::is_precise)
        && bounds.iter().unique().count() <= 1;
    let bound = bounds
        .first()
        .map(|first| {
            if bounds.iter().all(|it| it == first) {
                first.clone()
            } else {
                TypeBound::None
            }
        })
        .unwrap_or(TypeBound::None);
    let timestamp = values
        .iter()
        .map(SingleReference::timestamp)
        .all_equal_value()
        .unwrap_or(fallback);
    ReferenceValue::Multiple(MultipleReference {
        values,
        is_null,
        is_precise,
        bound,
        timestamp,
    })
}

/// Joins two reference values structurally. The aggregated bound of a
/// multi-origin result is computed with the class hierarchy.
pub(crate) fn join_references(
    a: &ReferenceValue,
    b: &ReferenceValue,
    class_hierarchy: &ClassHierarchy,
    timestamps: &mut TimestampCounter,
) -> ReferenceValue {
    use std::collections::BTreeMap;
    let joined = match (a, b) {
        (ReferenceValue::Single(x), ReferenceValue::Single(y)) if x.origin() == y.origin() => {
            ReferenceValue::Single(join_same_origin(x, y, class_hierarchy, timestamps))
        }
        _ => {
            // Keep the current timestamp when the member set ends up
            // unchanged, so an absorbed join reports no update.
            let fallback = match a {
                ReferenceValue::Multiple(m) => m.timestamp,
                ReferenceValue::Single(_) => timestamps.fresh(),
            };
            let mut by_origin: BTreeMap<Origin, SingleReference> = BTreeMap::new();
            let mut insert = |member: &SingleReference,
                              by_origin: &mut BTreeMap<Origin, SingleReference>| {
                match by_origin.remove(&member.origin()) {
                    None => {
                        by_origin.insert(member.origin(), member.clone());
                    }
                    Some(existing) => {
                        let joined =
                            join_same_origin(&existing, member, class_hierarchy, timestamps);
                        by_origin.insert(member.origin(), joined);
                    }
                }
            };
            for side in [a, b] {
                match side {
                    ReferenceValue::Single(v) => insert(v, &mut by_origin),
                    ReferenceValue::Multiple(m) => {
                        for member in &m.values {
                            insert(member, &mut by_origin);
                        }
                    }
                }
            }
            let values: BTreeSet<SingleReference> = by_origin.into_values().collect();
            if values.len() == 1 {
                ReferenceValue::Single(values.into_iter().next().expect("one member"))
            } else {
                make_multiple(values, fallback)
            }
        }
    };
    normalize_multiple_bound(joined, class_hierarchy)
}

/// Replaces one member of a multi-origin value by its refined version and
/// re-derives the aggregated facts.
pub(crate) fn replace_member(
    multiple: &MultipleReference,
    old: &SingleReference,
    new: &SingleReference,
    class_hierarchy: &ClassHierarchy,
) -> ReferenceValue {
    debug_assert_eq!(old.origin(), new.origin());
    let mut values = multiple.values.clone();
    values.remove(old);
    values.insert(new.clone());
    normalize_multiple_bound(
        make_multiple(values, multiple.timestamp),
        class_hierarchy,
    )
}

/// Recomputes the aggregated bound of a multi-origin value through the
/// class hierarchy (the member-agnostic aggregation in [`make_multiple`]
/// only recognizes identical bounds).
fn normalize_multiple_bound(
    value: ReferenceValue,
    class_hierarchy: &ClassHierarchy,
) -> ReferenceValue {
    match value {
        ReferenceValue::Multiple(mut m) => {
            let bound = m
                .values
                .iter()
                .map(SingleReference::bound)
                .reduce(|acc, bound| join_type_bounds(&acc, &bound, class_hierarchy))
                .unwrap_or(TypeBound::None);
            m.bound = bound;
            ReferenceValue::Multiple(m)
        }
        single => single,
    }
}

fn strip_timestamps(value: &ReferenceValue) -> ReferenceValue {
    const STRIPPED: Timestamp = Timestamp(0);
    match value {
        ReferenceValue::Single(v) => ReferenceValue::Single(v.with_timestamp(STRIPPED)),
        ReferenceValue::Multiple(m) => {
            let values = m
                .values
                .iter()
                .map(|member| member.with_timestamp(STRIPPED))
                .collect();
            ReferenceValue::Multiple(MultipleReference {
                values,
                is_null: m.is_null,
                is_precise: m.is_precise,
                bound: m.bound.clone(),
                timestamp: STRIPPED,
            })
        }
    }
}

impl Display for TypeBound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TypeBound::None => write!(f, "null"),
            TypeBound::Class(class) => class.fmt(f),
            TypeBound::Intersection(bounds) => {
                write!(f, "{}", bounds.iter().join(" & "))
            }
            TypeBound::Array(array_type) => array_type.fmt(f),
        }
    }
}

impl Display for SingleReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Null(v) => write!(f, "null[{}]", v.origin),
            Self::Object(v) => {
                let nullness = match v.is_null {
                    Answer::No => "non-null ",
                    _ => "",
                };
                let precision = if v.is_precise { "exactly " } else { "" };
                write!(f, "{nullness}{precision}{}[{}]", v.class, v.origin)
            }
            Self::MultiTyped(v) => {
                let nullness = match v.is_null {
                    Answer::No => "non-null ",
                    _ => "",
                };
                write!(f, "{nullness}{}[{}]", v.bounds.iter().join(" & "), v.origin)
            }
            Self::Array(v) => {
                let nullness = match v.is_null {
                    Answer::No => "non-null ",
                    _ => "",
                };
                let precision = if v.is_precise { "exactly " } else { "" };
                write!(f, "{nullness}{precision}{}[{}]", v.array_type, v.origin)
            }
        }
    }
}

impl Display for ReferenceValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Single(v) => v.fmt(f),
            Self::Multiple(m) => {
                write!(f, "{{{}}}", m.values.iter().join(" | "))
            }
        }
    }
}

impl Display for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0 < 0 {
            write!(f, "param{}", -(self.0 + 1))
        } else {
            write!(f, "#{}", self.0)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::types::hierarchy::TypeDeclaration;

    fn hierarchy() -> ClassHierarchy {
        ClassHierarchy::with_java_lang_types([
            TypeDeclaration::interface("java/util/Collection"),
            TypeDeclaration::interface("java/util/List").implements("java/util/Collection"),
            TypeDeclaration::interface("java/util/Set").implements("java/util/Collection"),
            TypeDeclaration::class("java/util/ArrayList").implements("java/util/List"),
        ])
    }

    fn object(origin: i32, class: &str, timestamp: u32) -> ReferenceValue {
        ReferenceValue::Single(SingleReference::Object(ObjectRef {
            origin: Origin(origin),
            is_null: Answer::Unknown,
            is_precise: false,
            class: ClassRef::new(class),
            timestamp: Timestamp(timestamp),
        }))
    }

    fn null(origin: i32, timestamp: u32) -> ReferenceValue {
        ReferenceValue::Single(SingleReference::Null(NullRef {
            origin: Origin(origin),
            timestamp: Timestamp(timestamp),
        }))
    }

    #[test]
    fn same_origin_join_widens_the_bound() {
        let hierarchy = hierarchy();
        let mut timestamps = TimestampCounter::new();
        let a = object(4, "java/util/List", 100);
        let b = object(4, "java/util/Set", 101);
        let joined = join_references(&a, &b, &hierarchy, &mut timestamps);
        assert_eq!(
            joined.bound(),
            TypeBound::Class(ClassRef::new("java/util/Collection"))
        );
        assert_eq!(joined.single_origin(), Some(Origin(4)));
        // The inputs disagree on timestamps, so the join gets a new one.
        assert_ne!(joined.timestamp(), a.timestamp());
        assert_ne!(joined.timestamp(), b.timestamp());
    }

    #[test]
    fn same_origin_join_of_null_and_object_widens_nullness() {
        let hierarchy = hierarchy();
        let mut timestamps = TimestampCounter::new();
        let a = null(4, 100);
        let mut b = object(4, "java/util/List", 101);
        if let ReferenceValue::Single(SingleReference::Object(v)) = &mut b {
            v.is_null = Answer::No;
        }
        let joined = join_references(&a, &b, &hierarchy, &mut timestamps);
        assert_eq!(joined.is_null(), Answer::Unknown);
        assert_eq!(
            joined.bound(),
            TypeBound::Class(ClassRef::new("java/util/List"))
        );
    }

    #[test]
    fn distinct_origins_join_into_a_multiple() {
        // Joining a List and a Set of different origins keeps both
        // members and aggregates the bound to their common supertype.
        let hierarchy = hierarchy();
        let mut timestamps = TimestampCounter::new();
        let a = object(4, "java/util/List", 100);
        let b = object(9, "java/util/Set", 101);
        let joined = join_references(&a, &b, &hierarchy, &mut timestamps);
        let ReferenceValue::Multiple(multiple) = &joined else {
            panic!("distinct origins must produce a multi-origin value");
        };
        assert_eq!(multiple.values.len(), 2);
        assert!(!multiple.is_precise);
        assert_eq!(
            multiple.bound,
            TypeBound::Class(ClassRef::new("java/util/Collection"))
        );
        // The member set iterates in origin order.
        let origins: Vec<Origin> = multiple.values.iter().map(SingleReference::origin).collect();
        assert_eq!(origins, vec![Origin(4), Origin(9)]);
    }

    #[test]
    fn join_absorbs_its_inputs() {
        let hierarchy = hierarchy();
        let mut timestamps = TimestampCounter::new();
        let a = object(4, "java/util/List", 100);
        let b = object(9, "java/util/Set", 101);
        let joined = join_references(&a, &b, &hierarchy, &mut timestamps);
        assert!(joined.abstracts_over(&a, &hierarchy));
        assert!(joined.abstracts_over(&b, &hierarchy));
        // Reflexivity.
        assert!(a.abstracts_over(&a, &hierarchy));
    }

    #[test]
    fn join_is_commutative_up_to_timestamps() {
        let hierarchy = hierarchy();
        let mut timestamps = TimestampCounter::new();
        let a = object(4, "java/util/List", 100);
        let b = object(9, "java/util/Set", 101);
        let ab = join_references(&a, &b, &hierarchy, &mut timestamps);
        let ba = join_references(&b, &a, &hierarchy, &mut timestamps);
        assert!(ab.equal_ignoring_timestamp(&ba));
    }

    #[test]
    fn joining_a_value_with_itself_changes_nothing() {
        let hierarchy = hierarchy();
        let mut timestamps = TimestampCounter::new();
        let a = object(4, "java/util/List", 100);
        assert_eq!(join_references(&a, &a, &hierarchy, &mut timestamps), a);
    }

    #[test]
    fn multiple_absorbs_a_rejoined_member() {
        let hierarchy = hierarchy();
        let mut timestamps = TimestampCounter::new();
        let a = object(4, "java/util/List", 100);
        let b = object(9, "java/util/Set", 101);
        let joined = join_references(&a, &b, &hierarchy, &mut timestamps);
        let rejoined = join_references(&joined, &a, &hierarchy, &mut timestamps);
        assert_eq!(rejoined, joined);
    }

    #[test]
    fn refining_nullness_to_yes_produces_null_with_the_same_origin() {
        let value = object(4, "java/util/List", 123);
        let refined = value.refine_is_null(Answer::Yes).unwrap();
        assert_eq!(
            refined,
            ReferenceValue::Single(SingleReference::Null(NullRef {
                origin: Origin(4),
                timestamp: Timestamp(123),
            }))
        );
    }

    #[test]
    fn refining_decided_nullness_is_impossible() {
        let value = null(4, 100);
        assert!(value.refine_is_null(Answer::Yes).is_err());
        assert!(value.refine_is_null(Answer::No).is_err());
        let mut object = object(4, "java/util/List", 100);
        if let ReferenceValue::Single(SingleReference::Object(v)) = &mut object {
            v.is_null = Answer::No;
        }
        assert!(object.refine_is_null(Answer::No).is_err());
    }

    #[test]
    fn refinement_is_idempotent() {
        let hierarchy = hierarchy();
        let value = object(4, "java/lang/Object", 100);
        let target = FieldType::Object(ClassRef::new("java/util/List"));
        let once = value.refine_upper_type_bound(&target, &hierarchy).unwrap();
        let twice = once.refine_upper_type_bound(&target, &hierarchy).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn refining_the_bound_of_null_is_impossible() {
        let hierarchy = hierarchy();
        let value = null(4, 100);
        let target = FieldType::Object(ClassRef::new("java/util/List"));
        assert!(value.refine_upper_type_bound(&target, &hierarchy).is_err());
    }

    #[test]
    fn refining_towards_a_subtype_replaces_the_bound() {
        let hierarchy = hierarchy();
        let value = object(4, "java/lang/Object", 100);
        let target = FieldType::Object(ClassRef::new("java/util/List"));
        let refined = value.refine_upper_type_bound(&target, &hierarchy).unwrap();
        assert_eq!(
            refined.bound(),
            TypeBound::Class(ClassRef::new("java/util/List"))
        );
        // The refined value sits below the original.
        assert!(value.abstracts_over(&refined, &hierarchy));
    }

    #[test]
    fn refining_towards_an_incomparable_type_intersects() {
        let hierarchy = hierarchy();
        let value = object(4, "java/util/List", 100);
        let target = FieldType::Object(ClassRef::new("java/util/Set"));
        let refined = value.refine_upper_type_bound(&target, &hierarchy).unwrap();
        assert_eq!(
            refined.bound(),
            TypeBound::Intersection(BTreeSet::from([
                ClassRef::new("java/util/List"),
                ClassRef::new("java/util/Set"),
            ]))
        );
    }

    #[test]
    fn marker_interfaces_refine_to_an_array() {
        // {Serializable, Cloneable} is how joined arrays look; learning
        // an array type again is a legal transition.
        let hierarchy = hierarchy();
        let value = ReferenceValue::Single(SingleReference::MultiTyped(MultiTypedRef {
            origin: Origin(4),
            is_null: Answer::Unknown,
            bounds: ClassHierarchy::serializable_and_cloneable(),
            timestamp: Timestamp(100),
        }));
        let int_array =
            FieldType::Base(crate::types::field_type::PrimitiveType::Int).make_array_type();
        let refined = value.refine_upper_type_bound(&int_array, &hierarchy).unwrap();
        assert!(matches!(
            refined,
            ReferenceValue::Single(SingleReference::Array(_))
        ));
        assert_eq!(refined.bound(), TypeBound::Array(int_array));
    }

    #[test]
    fn a_precise_value_cannot_become_something_unrelated() {
        let hierarchy = hierarchy();
        let value = ReferenceValue::Single(SingleReference::Object(ObjectRef {
            origin: Origin(4),
            is_null: Answer::Unknown,
            is_precise: true,
            class: ClassRef::new("java/lang/String"),
            timestamp: Timestamp(100),
        }));
        let target = FieldType::Object(ClassRef::new("java/util/List"));
        assert!(value.refine_upper_type_bound(&target, &hierarchy).is_err());
    }

    #[test]
    fn null_is_a_member_of_every_reference_type() {
        let hierarchy = hierarchy();
        let value = null(4, 100);
        for target in [
            FieldType::Object(ClassRef::new("java/util/List")),
            FieldType::Object(ClassRef::object()),
            FieldType::Object(ClassRef::new("java/lang/String")).make_array_type(),
        ] {
            assert_eq!(
                value.is_value_subtype_of(&target, &hierarchy),
                Answer::Yes
            );
        }
    }

    #[test]
    fn refining_a_multiple_drops_infeasible_members() {
        let hierarchy = hierarchy();
        let mut timestamps = TimestampCounter::new();
        let precise_string = ReferenceValue::Single(SingleReference::Object(ObjectRef {
            origin: Origin(4),
            is_null: Answer::Unknown,
            is_precise: true,
            class: ClassRef::new("java/lang/String"),
            timestamp: Timestamp(100),
        }));
        let list = object(9, "java/util/List", 101);
        let joined = join_references(&precise_string, &list, &hierarchy, &mut timestamps);
        let target = FieldType::Object(ClassRef::new("java/util/Collection"));
        let refined = joined.refine_upper_type_bound(&target, &hierarchy).unwrap();
        // The string member cannot be a Collection and disappears.
        assert_eq!(refined, list);
    }

    #[test]
    fn refining_nullness_of_a_multiple_to_yes_collapses_members_to_null() {
        let hierarchy = hierarchy();
        let mut timestamps = TimestampCounter::new();
        let a = object(4, "java/util/List", 100);
        let b = object(9, "java/util/Set", 101);
        let joined = join_references(&a, &b, &hierarchy, &mut timestamps);
        let refined = joined.refine_is_null(Answer::Yes).unwrap();
        assert_eq!(refined.is_null(), Answer::Yes);
        let ReferenceValue::Multiple(multiple) = &refined else {
            panic!("both members can be null, so both survive");
        };
        assert!(multiple
            .values
            .iter()
            .all(|member| matches!(member, SingleReference::Null(_))));
        assert_eq!(multiple.bound, TypeBound::None);
    }

    #[test]
    fn summarizing_a_multiple_collapses_it_at_the_given_origin() {
        let hierarchy = hierarchy();
        let mut timestamps = TimestampCounter::new();
        let a = object(4, "java/util/List", 100);
        let b = object(9, "java/util/Set", 101);
        let joined = join_references(&a, &b, &hierarchy, &mut timestamps);
        let summarized = joined.summarize(Origin(42), &mut timestamps, &hierarchy);
        assert_eq!(summarized.single_origin(), Some(Origin(42)));
        assert_eq!(
            summarized.bound(),
            TypeBound::Class(ClassRef::new("java/util/Collection"))
        );
        assert_eq!(summarized.is_null(), joined.is_null());
    }

    #[test]
    fn final_component_joins_stay_precise_only_with_equal_bounds() {
        let hierarchy = hierarchy();
        let mut timestamps = TimestampCounter::new();
        let a = ReferenceValue::Single(SingleReference::Object(ObjectRef {
            origin: Origin(4),
            is_null: Answer::No,
            is_precise: true,
            class: ClassRef::new("java/lang/String"),
            timestamp: Timestamp(100),
        }));
        let b = ReferenceValue::Single(SingleReference::Object(ObjectRef {
            origin: Origin(4),
            is_null: Answer::No,
            is_precise: true,
            class: ClassRef::new("java/util/ArrayList"),
            timestamp: Timestamp(101),
        }));
        let joined = join_references(&a, &b, &hierarchy, &mut timestamps);
        assert!(!joined.is_precise());
    }
}
