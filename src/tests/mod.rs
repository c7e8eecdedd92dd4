//! Shared proptest strategies and lattice law tests.

use proptest::prelude::*;
use std::sync::Arc;

use crate::interp::domain::reference::ReferenceValue;
use crate::interp::domain::Domain;
use crate::jvm::code::ProgramCounter;
use crate::jvm::references::ClassRef;
use crate::types::field_type::{FieldType, PrimitiveType};
use crate::types::hierarchy::{ClassHierarchy, TypeDeclaration};
use crate::types::Answer;

prop_compose! {
    pub(crate) fn arb_class_name()(
        package in r"[a-zA-Z_][a-zA-Z0-9_]*/",
        class in r"[a-zA-Z_][a-zA-Z0-9_]*"
    ) -> String {
        format!("{package}{class}")
    }
}

fn arb_non_array_field_type() -> impl Strategy<Value = FieldType> {
    prop_oneof![
        prop_oneof![
            Just(PrimitiveType::Boolean),
            Just(PrimitiveType::Char),
            Just(PrimitiveType::Float),
            Just(PrimitiveType::Double),
            Just(PrimitiveType::Byte),
            Just(PrimitiveType::Short),
            Just(PrimitiveType::Int),
            Just(PrimitiveType::Long),
        ]
        .prop_map(FieldType::Base),
        arb_class_name()
            .prop_map(ClassRef::new)
            .prop_map(FieldType::Object),
    ]
}

prop_compose! {
    fn arb_array_field_type()(
        t in arb_non_array_field_type(),
        dim in 1..=4u8
    ) -> FieldType {
        let mut result = t;
        for _ in 0..dim {
            result = FieldType::Array(Box::new(result));
        }
        result
    }
}

pub(crate) fn arb_field_type() -> impl Strategy<Value = FieldType> {
    prop_oneof![arb_non_array_field_type(), arb_array_field_type()]
}

/// The classes reference-value plans draw their bounds from.
const CLASSES: [&str; 6] = [
    "java/lang/Object",
    "java/lang/String",
    "java/util/Collection",
    "java/util/List",
    "java/util/Set",
    "java/util/ArrayList",
];

fn test_hierarchy() -> Arc<ClassHierarchy> {
    Arc::new(ClassHierarchy::with_java_lang_types([
        TypeDeclaration::interface("java/util/Collection"),
        TypeDeclaration::interface("java/util/List").implements("java/util/Collection"),
        TypeDeclaration::interface("java/util/Set").implements("java/util/Collection"),
        TypeDeclaration::class("java/util/ArrayList").implements("java/util/List"),
    ]))
}

/// A serializable recipe for a single-origin reference value; the tests
/// materialize it through the domain factories, so every generated value
/// satisfies the construction invariants.
#[derive(Debug, Clone)]
pub(crate) struct ValuePlan {
    origin: u16,
    class: usize,
    nullness: u8,
}

prop_compose! {
    pub(crate) fn arb_value_plan()(
        origin in 0..24u16,
        class in 0..CLASSES.len(),
        nullness in 0..3u8
    ) -> ValuePlan {
        ValuePlan { origin, class, nullness }
    }
}

fn materialize(plan: &ValuePlan, domain: &mut Domain) -> ReferenceValue {
    let origin = ProgramCounter(plan.origin);
    match plan.nullness {
        0 => domain.null_value(origin),
        1 => domain.non_null_object_value(origin, ClassRef::new(CLASSES[plan.class])),
        _ => domain.initialized_object_value(origin, ClassRef::new(CLASSES[plan.class])),
    }
}

fn join_all(plans: &[ValuePlan], domain: &mut Domain) -> ReferenceValue {
    let mut values = plans.iter().map(|plan| materialize(plan, domain));
    let first = values.next().expect("at least one plan");
    let rest: Vec<ReferenceValue> = values.collect();
    rest.into_iter().fold(first, |acc, value| {
        domain
            .join_reference(&acc, &value)
            .into_value()
            .unwrap_or(acc)
    })
}

proptest! {
    #[test]
    fn join_is_idempotent(plans in proptest::collection::vec(arb_value_plan(), 1..4)) {
        let mut domain = Domain::new(test_hierarchy());
        let value = join_all(&plans, &mut domain);
        let rejoined = domain.join_reference(&value, &value);
        prop_assert!(rejoined.is_no_update());
    }

    #[test]
    fn join_abstracts_over_both_inputs(
        a in proptest::collection::vec(arb_value_plan(), 1..3),
        b in proptest::collection::vec(arb_value_plan(), 1..3),
    ) {
        let mut domain = Domain::new(test_hierarchy());
        let left = join_all(&a, &mut domain);
        let right = join_all(&b, &mut domain);
        let joined = domain
            .join_reference(&left, &right)
            .into_value()
            .unwrap_or_else(|| left.clone());
        let hierarchy = test_hierarchy();
        prop_assert!(joined.abstracts_over(&left, &hierarchy));
        prop_assert!(joined.abstracts_over(&right, &hierarchy));
    }

    #[test]
    fn join_is_commutative_up_to_timestamps(
        a in arb_value_plan(),
        b in arb_value_plan(),
    ) {
        let mut domain = Domain::new(test_hierarchy());
        let left = materialize(&a, &mut domain);
        let right = materialize(&b, &mut domain);
        let ab = domain
            .join_reference(&left, &right)
            .into_value()
            .unwrap_or_else(|| left.clone());
        let ba = domain
            .join_reference(&right, &left)
            .into_value()
            .unwrap_or_else(|| right.clone());
        prop_assert!(ab.equal_ignoring_timestamp(&ba));
    }

    #[test]
    fn abstraction_is_reflexive(plans in proptest::collection::vec(arb_value_plan(), 1..4)) {
        let mut domain = Domain::new(test_hierarchy());
        let value = join_all(&plans, &mut domain);
        prop_assert!(value.abstracts_over(&value, &test_hierarchy()));
    }

    #[test]
    fn bound_refinement_is_idempotent(plan in arb_value_plan(), class in 0..CLASSES.len()) {
        let mut domain = Domain::new(test_hierarchy());
        let value = materialize(&plan, &mut domain);
        let target = FieldType::Object(ClassRef::new(CLASSES[class]));
        let hierarchy = test_hierarchy();
        if let Ok(once) = value.refine_upper_type_bound(&target, &hierarchy) {
            let twice = once.refine_upper_type_bound(&target, &hierarchy);
            prop_assert_eq!(twice.as_ref(), Ok(&once));
        }
    }

    #[test]
    fn nullness_refinement_never_leaves_unknown(plan in arb_value_plan()) {
        let mut domain = Domain::new(test_hierarchy());
        let value = materialize(&plan, &mut domain);
        if value.is_null().is_unknown() {
            let as_null = value.refine_is_null(Answer::Yes).unwrap();
            prop_assert_eq!(as_null.is_null(), Answer::Yes);
            let as_non_null = value.refine_is_null(Answer::No).unwrap();
            prop_assert_eq!(as_non_null.is_null(), Answer::No);
        } else {
            prop_assert!(value.refine_is_null(Answer::Yes).is_err());
            prop_assert!(value.refine_is_null(Answer::No).is_err());
        }
    }

    #[test]
    fn answer_join_is_commutative_and_absorbing(a in 0..3u8, b in 0..3u8) {
        let answers = [Answer::Yes, Answer::No, Answer::Unknown];
        let (a, b) = (answers[a as usize], answers[b as usize]);
        prop_assert_eq!(a.join(b), b.join(a));
        prop_assert_eq!(a.join(a), a);
        prop_assert_eq!(a.join(Answer::Unknown), Answer::Unknown);
    }

    #[test]
    fn field_type_descriptors_round_trip(t in arb_field_type()) {
        use std::str::FromStr;
        let descriptor = t.descriptor_string();
        prop_assert_eq!(FieldType::from_str(&descriptor).unwrap(), t);
    }
}
