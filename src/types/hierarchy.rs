//! Module for class hierarchy queries.
//!
//! The hierarchy is immutable after construction and may be incomplete:
//! queries involving classes that were never declared answer
//! [`Answer::Unknown`] instead of failing.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fmt::Display;

use itertools::Itertools;

use crate::jvm::references::{
    ClassRef, JAVA_IO_SERIALIZABLE, JAVA_LANG_CLONEABLE, JAVA_LANG_OBJECT, JAVA_LANG_THROWABLE,
};
use crate::types::field_type::FieldType;
use crate::types::Answer;

/// Whether a declared type is a class or an interface.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum TypeKind {
    /// A class.
    Class,
    /// An interface.
    Interface,
}

/// The declaration of a single type, as handed in by the loader.
#[derive(Debug, Clone)]
pub struct TypeDeclaration {
    /// The declared type.
    pub name: ClassRef,
    /// The declared superclass. `None` only for `java/lang/Object`.
    pub super_class: Option<ClassRef>,
    /// The directly implemented (or extended, for interfaces) interfaces.
    pub interfaces: Vec<ClassRef>,
    /// Whether the type is a class or an interface.
    pub kind: TypeKind,
    /// Whether the type is declared `final`.
    pub is_final: bool,
    /// Whether the type is declared `abstract`.
    pub is_abstract: bool,
}

impl TypeDeclaration {
    /// Declares a class extending `java/lang/Object`.
    pub fn class<S: Into<String>>(name: S) -> Self {
        Self {
            name: ClassRef::new(name),
            super_class: Some(ClassRef::object()),
            interfaces: Vec::new(),
            kind: TypeKind::Class,
            is_final: false,
            is_abstract: false,
        }
    }

    /// Declares an interface.
    pub fn interface<S: Into<String>>(name: S) -> Self {
        Self {
            name: ClassRef::new(name),
            super_class: Some(ClassRef::object()),
            interfaces: Vec::new(),
            kind: TypeKind::Interface,
            is_final: false,
            is_abstract: true,
        }
    }

    /// Sets the superclass.
    #[must_use]
    pub fn extends<S: Into<String>>(mut self, super_class: S) -> Self {
        self.super_class = Some(ClassRef::new(super_class));
        self
    }

    /// Adds a directly implemented interface.
    #[must_use]
    pub fn implements<S: Into<String>>(mut self, interface: S) -> Self {
        self.interfaces.push(ClassRef::new(interface));
        self
    }

    /// Marks the type as `final`.
    #[must_use]
    pub fn final_type(mut self) -> Self {
        self.is_final = true;
        self
    }

    /// Marks the type as `abstract`.
    #[must_use]
    pub fn abstract_type(mut self) -> Self {
        self.is_abstract = true;
        self
    }
}

#[derive(Debug, Clone)]
struct TypeInfo {
    super_class: Option<ClassRef>,
    interfaces: Vec<ClassRef>,
    kind: TypeKind,
    is_final: bool,
    is_abstract: bool,
}

/// The class hierarchy of a project.
#[derive(Debug, Clone, Default)]
pub struct ClassHierarchy {
    types: HashMap<ClassRef, TypeInfo>,
}

impl ClassHierarchy {
    /// Builds a hierarchy from a set of type declarations.
    pub fn from_declarations<I>(declarations: I) -> Self
    where
        I: IntoIterator<Item = TypeDeclaration>,
    {
        let mut types = HashMap::new();
        for decl in declarations {
            let super_class = if decl.name.is_object() {
                None
            } else {
                decl.super_class
            };
            types.insert(
                decl.name,
                TypeInfo {
                    super_class,
                    interfaces: decl.interfaces,
                    kind: decl.kind,
                    is_final: decl.is_final,
                    is_abstract: decl.is_abstract,
                },
            );
        }
        Self { types }
    }

    /// Builds a hierarchy pre-populated with the `java/lang` types the
    /// interpreter itself relies on (`Object`, `String`, `Class`, the
    /// array marker interfaces, and the implicit exception classes).
    #[must_use]
    pub fn with_java_lang_types<I>(declarations: I) -> Self
    where
        I: IntoIterator<Item = TypeDeclaration>,
    {
        use crate::jvm::references::{
            ARITHMETIC_EXCEPTION, ARRAY_INDEX_OUT_OF_BOUNDS_EXCEPTION, ARRAY_STORE_EXCEPTION,
            CLASS_CAST_EXCEPTION, JAVA_LANG_CLASS, JAVA_LANG_STRING, NEGATIVE_ARRAY_SIZE_EXCEPTION,
            NULL_POINTER_EXCEPTION,
        };
        let base = [
            TypeDeclaration::class(JAVA_LANG_OBJECT),
            TypeDeclaration::interface(JAVA_IO_SERIALIZABLE),
            TypeDeclaration::interface(JAVA_LANG_CLONEABLE),
            TypeDeclaration::class(JAVA_LANG_STRING)
                .implements(JAVA_IO_SERIALIZABLE)
                .final_type(),
            TypeDeclaration::class(JAVA_LANG_CLASS)
                .implements(JAVA_IO_SERIALIZABLE)
                .final_type(),
            TypeDeclaration::class(JAVA_LANG_THROWABLE).implements(JAVA_IO_SERIALIZABLE),
            TypeDeclaration::class("java/lang/Exception").extends(JAVA_LANG_THROWABLE),
            TypeDeclaration::class("java/lang/RuntimeException").extends("java/lang/Exception"),
            TypeDeclaration::class(NULL_POINTER_EXCEPTION).extends("java/lang/RuntimeException"),
            TypeDeclaration::class(ARITHMETIC_EXCEPTION).extends("java/lang/RuntimeException"),
            TypeDeclaration::class("java/lang/IndexOutOfBoundsException")
                .extends("java/lang/RuntimeException"),
            TypeDeclaration::class(ARRAY_INDEX_OUT_OF_BOUNDS_EXCEPTION)
                .extends("java/lang/IndexOutOfBoundsException"),
            TypeDeclaration::class(ARRAY_STORE_EXCEPTION).extends("java/lang/RuntimeException"),
            TypeDeclaration::class(CLASS_CAST_EXCEPTION).extends("java/lang/RuntimeException"),
            TypeDeclaration::class(NEGATIVE_ARRAY_SIZE_EXCEPTION)
                .extends("java/lang/RuntimeException"),
        ];
        Self::from_declarations(base.into_iter().chain(declarations))
    }

    /// Checks whether the given type was declared to this hierarchy.
    #[must_use]
    pub fn is_known(&self, class: &ClassRef) -> bool {
        self.types.contains_key(class)
    }

    /// Checks whether the given class is known to be `final`.
    /// Unknown classes answer `false`.
    #[must_use]
    pub fn is_known_to_be_final(&self, class: &ClassRef) -> bool {
        self.types.get(class).is_some_and(|it| it.is_final)
    }

    /// Checks whether the given class is known to be `abstract`.
    /// Unknown classes answer `false`.
    #[must_use]
    pub fn is_known_to_be_abstract(&self, class: &ClassRef) -> bool {
        self.types.get(class).is_some_and(|it| it.is_abstract)
    }

    /// Checks whether the given type is an interface.
    #[must_use]
    pub fn is_interface(&self, class: &ClassRef) -> Answer {
        match self.types.get(class) {
            Some(info) => Answer::from(info.kind == TypeKind::Interface),
            None => Answer::Unknown,
        }
    }

    /// Checks whether `sub` is a subtype of `sup`, both being class or
    /// interface types.
    #[must_use]
    pub fn is_object_subtype_of(&self, sub: &ClassRef, sup: &ClassRef) -> Answer {
        if sub == sup || sup.is_object() {
            return Answer::Yes;
        }
        let mut complete = true;
        let mut worklist = VecDeque::from([sub.clone()]);
        let mut seen = BTreeSet::new();
        while let Some(current) = worklist.pop_front() {
            if !seen.insert(current.clone()) {
                continue;
            }
            if &current == sup {
                return Answer::Yes;
            }
            match self.types.get(&current) {
                Some(info) => {
                    if let Some(super_class) = &info.super_class {
                        worklist.push_back(super_class.clone());
                    }
                    worklist.extend(info.interfaces.iter().cloned());
                }
                None => complete = false,
            }
        }
        if complete {
            Answer::No
        } else {
            Answer::Unknown
        }
    }

    /// Checks whether `sub` is a subtype of `sup` for arbitrary field
    /// types. Primitive types relate only to themselves.
    #[must_use]
    pub fn is_subtype_of(&self, sub: &FieldType, sup: &FieldType) -> Answer {
        use FieldType::{Array, Base, Object};
        match (sub, sup) {
            (Base(a), Base(b)) => Answer::from(a == b),
            (Base(_), _) | (_, Base(_)) => Answer::No,
            (Object(a), Object(b)) => self.is_object_subtype_of(a, b),
            (Array(_), Object(b)) => Answer::from(
                b.is_object()
                    || b.binary_name == JAVA_LANG_CLONEABLE
                    || b.binary_name == JAVA_IO_SERIALIZABLE,
            ),
            (Object(_), Array(_)) => Answer::No,
            (Array(a), Array(b)) => match (a.as_ref(), b.as_ref()) {
                (Base(x), Base(y)) => Answer::from(x == y),
                // Arrays of reference types are covariant.
                (x, y) if x.is_reference() && y.is_reference() => self.is_subtype_of(x, y),
                _ => Answer::No,
            },
        }
    }

    /// Collects all supertypes of `class` reachable through declared
    /// superclasses and interfaces. The second component is `false` when
    /// the walk hit a type absent from the hierarchy.
    fn supertypes_of(&self, class: &ClassRef, reflexive: bool) -> (BTreeSet<ClassRef>, bool) {
        let mut result = BTreeSet::new();
        let mut complete = true;
        let mut worklist = VecDeque::from([class.clone()]);
        let mut seen = BTreeSet::new();
        while let Some(current) = worklist.pop_front() {
            if !seen.insert(current.clone()) {
                continue;
            }
            if &current != class || reflexive {
                result.insert(current.clone());
            }
            match self.types.get(&current) {
                Some(info) => {
                    if let Some(super_class) = &info.super_class {
                        worklist.push_back(super_class.clone());
                    }
                    worklist.extend(info.interfaces.iter().cloned());
                }
                None => complete = false,
            }
        }
        (result, complete)
    }

    /// Removes every member that is a proper supertype of another member,
    /// leaving a minimal set.
    pub fn minimize_type_set(&self, mut candidates: BTreeSet<ClassRef>) -> BTreeSet<ClassRef> {
        let snapshot: Vec<_> = candidates.iter().cloned().collect();
        candidates.retain(|t| {
            !snapshot
                .iter()
                .any(|s| s != t && self.is_object_subtype_of(s, t).is_yes())
        });
        candidates
    }

    /// Computes the minimal set of common supertypes of `class` and every
    /// member of `others`. The result is never empty; when the hierarchy
    /// is too incomplete to do better it degrades to `java/lang/Object`.
    #[must_use]
    pub fn join_object_types(
        &self,
        class: &ClassRef,
        others: &BTreeSet<ClassRef>,
        reflexive: bool,
    ) -> BTreeSet<ClassRef> {
        if others.iter().all(|o| o == class) && reflexive {
            return BTreeSet::from([class.clone()]);
        }
        let (mut common, mut complete) = self.supertypes_of(class, reflexive);
        for other in others {
            let (supertypes, other_complete) = self.supertypes_of(other, reflexive);
            complete &= other_complete;
            common.retain(|t| supertypes.contains(t));
        }
        if !complete || common.is_empty() {
            common.insert(ClassRef::object());
        }
        let minimal = self.minimize_type_set(common);
        if minimal.is_empty() {
            BTreeSet::from([ClassRef::object()])
        } else {
            minimal
        }
    }

    /// Joins two upper type bounds over object types.
    #[must_use]
    pub fn join_object_type_bounds(
        &self,
        a: &BTreeSet<ClassRef>,
        b: &BTreeSet<ClassRef>,
    ) -> BTreeSet<ClassRef> {
        // Every common supertype of all of `a` must also bound all of `b`.
        let mut result: Option<BTreeSet<ClassRef>> = None;
        for class in a {
            let joined = self.join_object_types(class, b, true);
            result = Some(match result {
                None => joined,
                Some(previous) => {
                    let mut merged = previous;
                    merged.extend(joined);
                    self.minimize_type_set(merged)
                }
            });
        }
        result.unwrap_or_else(|| BTreeSet::from([ClassRef::object()]))
    }

    /// The upper type bound shared by all array types: the JVM-mandated
    /// marker interfaces of arrays.
    #[must_use]
    pub fn serializable_and_cloneable() -> BTreeSet<ClassRef> {
        BTreeSet::from([
            ClassRef::new(JAVA_IO_SERIALIZABLE),
            ClassRef::new(JAVA_LANG_CLONEABLE),
        ])
    }

    /// Joins two array types. If the component types have a least upper
    /// bound that is itself a single type, the result is the
    /// corresponding array type; otherwise it falls back to
    /// `{java/io/Serializable, java/lang/Cloneable}`.
    #[must_use]
    pub fn join_array_types(&self, a: &FieldType, b: &FieldType) -> TypeBoundJoin {
        debug_assert!(matches!(a, FieldType::Array(_)) && matches!(b, FieldType::Array(_)));
        if a == b {
            return TypeBoundJoin::ArrayType(a.clone());
        }
        match (a.component_type(), b.component_type()) {
            (Some(ca), Some(cb)) if ca.is_reference() && cb.is_reference() => {
                match self.join_component_types(ca, cb) {
                    Some(component) => TypeBoundJoin::ArrayType(component.make_array_type()),
                    None => TypeBoundJoin::ObjectTypes(Self::serializable_and_cloneable()),
                }
            }
            _ => TypeBoundJoin::ObjectTypes(Self::serializable_and_cloneable()),
        }
    }

    /// The least upper bound of two reference component types, when it is
    /// a single type.
    fn join_component_types(&self, a: &FieldType, b: &FieldType) -> Option<FieldType> {
        use FieldType::{Array, Object};
        match (a, b) {
            (Object(x), Object(y)) => {
                let joined = self.join_object_types(x, &BTreeSet::from([y.clone()]), true);
                if joined.len() == 1 {
                    joined.into_iter().next().map(FieldType::Object)
                } else {
                    None
                }
            }
            (Array(_), Array(_)) => match self.join_array_types(a, b) {
                TypeBoundJoin::ArrayType(t) => Some(t),
                TypeBoundJoin::ObjectTypes(_) => None,
            },
            (Array(_), Object(o)) | (Object(o), Array(_)) => {
                if o.is_object() {
                    Some(FieldType::Object(ClassRef::object()))
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    /// Joins an arbitrary (unknown) array type with an object type.
    /// Returns `java/lang/Object` when `class` is `Object`; otherwise the
    /// array marker interfaces that are also supertypes of `class`, or
    /// `Object` when there is none.
    #[must_use]
    pub fn join_any_array_type_with_object_type(&self, class: &ClassRef) -> BTreeSet<ClassRef> {
        if class.is_object() {
            return BTreeSet::from([ClassRef::object()]);
        }
        let result: BTreeSet<_> = Self::serializable_and_cloneable()
            .into_iter()
            .filter(|marker| self.is_object_subtype_of(class, marker).is_yes())
            .collect();
        if result.is_empty() {
            BTreeSet::from([ClassRef::object()])
        } else {
            result
        }
    }
}

/// The result of joining two array-capable upper type bounds.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum TypeBoundJoin {
    /// The join is a single array type.
    ArrayType(FieldType),
    /// The join is an intersection of object types.
    ObjectTypes(BTreeSet<ClassRef>),
}

impl Display for TypeBoundJoin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ArrayType(t) => t.fmt(f),
            Self::ObjectTypes(types) => {
                write!(f, "{}", types.iter().map(ToString::to_string).join(" & "))
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::types::Answer;

    fn collections_hierarchy() -> ClassHierarchy {
        ClassHierarchy::with_java_lang_types([
            TypeDeclaration::interface("java/util/Collection"),
            TypeDeclaration::interface("java/util/List").implements("java/util/Collection"),
            TypeDeclaration::interface("java/util/Set").implements("java/util/Collection"),
            TypeDeclaration::class("java/util/AbstractList")
                .implements("java/util/List")
                .abstract_type(),
            TypeDeclaration::class("java/util/ArrayList").extends("java/util/AbstractList"),
        ])
    }

    #[test]
    fn reflexive_subtyping() {
        let hierarchy = collections_hierarchy();
        let list = ClassRef::new("java/util/List");
        assert_eq!(hierarchy.is_object_subtype_of(&list, &list), Answer::Yes);
    }

    #[test]
    fn everything_is_an_object() {
        let hierarchy = collections_hierarchy();
        let list = ClassRef::new("java/util/List");
        let unknown = ClassRef::new("com/example/Unknown");
        assert_eq!(
            hierarchy.is_object_subtype_of(&list, &ClassRef::object()),
            Answer::Yes
        );
        assert_eq!(
            hierarchy.is_object_subtype_of(&unknown, &ClassRef::object()),
            Answer::Yes
        );
    }

    #[test]
    fn transitive_subtyping() {
        let hierarchy = collections_hierarchy();
        let array_list = ClassRef::new("java/util/ArrayList");
        let collection = ClassRef::new("java/util/Collection");
        assert_eq!(
            hierarchy.is_object_subtype_of(&array_list, &collection),
            Answer::Yes
        );
        assert_eq!(
            hierarchy.is_object_subtype_of(&collection, &array_list),
            Answer::No
        );
    }

    #[test]
    fn unknown_types_answer_unknown() {
        let hierarchy = collections_hierarchy();
        let unknown = ClassRef::new("com/example/Unknown");
        let list = ClassRef::new("java/util/List");
        assert_eq!(
            hierarchy.is_object_subtype_of(&unknown, &list),
            Answer::Unknown
        );
    }

    #[test]
    fn join_siblings() {
        let hierarchy = collections_hierarchy();
        let list = ClassRef::new("java/util/List");
        let set = BTreeSet::from([ClassRef::new("java/util/Set")]);
        let joined = hierarchy.join_object_types(&list, &set, true);
        assert_eq!(joined, BTreeSet::from([ClassRef::new("java/util/Collection")]));
    }

    #[test]
    fn join_with_subtype_is_absorbing() {
        let hierarchy = collections_hierarchy();
        let list = ClassRef::new("java/util/List");
        let array_list = BTreeSet::from([ClassRef::new("java/util/ArrayList")]);
        let joined = hierarchy.join_object_types(&list, &array_list, true);
        assert_eq!(joined, BTreeSet::from([list]));
    }

    #[test]
    fn join_result_is_minimal() {
        let hierarchy = collections_hierarchy();
        let array_list = ClassRef::new("java/util/ArrayList");
        let others = BTreeSet::from([ClassRef::new("java/util/AbstractList")]);
        let joined = hierarchy.join_object_types(&array_list, &others, true);
        // AbstractList subsumes List and Collection.
        assert_eq!(
            joined,
            BTreeSet::from([ClassRef::new("java/util/AbstractList")])
        );
    }

    #[test]
    fn join_with_object_is_object() {
        let hierarchy = collections_hierarchy();
        let list = ClassRef::new("java/util/List");
        let top = BTreeSet::from([ClassRef::object()]);
        assert_eq!(hierarchy.join_object_types(&list, &top, true), top);
    }

    #[test]
    fn arrays_are_serializable_and_cloneable() {
        let hierarchy = collections_hierarchy();
        let int_array = FieldType::Base(crate::types::field_type::PrimitiveType::Int)
            .make_array_type();
        for marker in [JAVA_IO_SERIALIZABLE, JAVA_LANG_CLONEABLE, JAVA_LANG_OBJECT] {
            assert_eq!(
                hierarchy
                    .is_subtype_of(&int_array, &FieldType::Object(ClassRef::new(marker))),
                Answer::Yes
            );
        }
    }

    #[test]
    fn reference_arrays_are_covariant() {
        let hierarchy = collections_hierarchy();
        let array_list_array =
            FieldType::Object(ClassRef::new("java/util/ArrayList")).make_array_type();
        let list_array = FieldType::Object(ClassRef::new("java/util/List")).make_array_type();
        assert_eq!(
            hierarchy.is_subtype_of(&array_list_array, &list_array),
            Answer::Yes
        );
        assert_eq!(
            hierarchy.is_subtype_of(&list_array, &array_list_array),
            Answer::No
        );
    }

    #[test]
    fn join_incompatible_arrays_falls_back_to_markers() {
        let hierarchy = collections_hierarchy();
        use crate::types::field_type::PrimitiveType;
        let int_array = FieldType::Base(PrimitiveType::Int).make_array_type();
        let long_array = FieldType::Base(PrimitiveType::Long).make_array_type();
        assert_eq!(
            hierarchy.join_array_types(&int_array, &long_array),
            TypeBoundJoin::ObjectTypes(ClassHierarchy::serializable_and_cloneable())
        );
    }

    #[test]
    fn join_covariant_arrays() {
        let hierarchy = collections_hierarchy();
        let a = FieldType::Object(ClassRef::new("java/util/List")).make_array_type();
        let b = FieldType::Object(ClassRef::new("java/util/Set")).make_array_type();
        assert_eq!(
            hierarchy.join_array_types(&a, &b),
            TypeBoundJoin::ArrayType(
                FieldType::Object(ClassRef::new("java/util/Collection")).make_array_type()
            )
        );
    }

    #[test]
    fn final_classes() {
        let hierarchy = collections_hierarchy();
        assert!(hierarchy.is_known_to_be_final(&ClassRef::new("java/lang/String")));
        assert!(!hierarchy.is_known_to_be_final(&ClassRef::new("java/util/ArrayList")));
        assert!(!hierarchy.is_known_to_be_final(&ClassRef::new("com/example/Unknown")));
    }
}
