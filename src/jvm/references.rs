//! References to classes, fields, and methods by name.

use std::fmt::Display;

use crate::jvm::method::MethodDescriptor;
use crate::types::field_type::FieldType;

/// The binary name of `java/lang/Object`.
pub const JAVA_LANG_OBJECT: &str = "java/lang/Object";
/// The binary name of `java/lang/Cloneable`.
pub const JAVA_LANG_CLONEABLE: &str = "java/lang/Cloneable";
/// The binary name of `java/io/Serializable`.
pub const JAVA_IO_SERIALIZABLE: &str = "java/io/Serializable";
/// The binary name of `java/lang/Throwable`.
pub const JAVA_LANG_THROWABLE: &str = "java/lang/Throwable";
/// The binary name of `java/lang/String`.
pub const JAVA_LANG_STRING: &str = "java/lang/String";
/// The binary name of `java/lang/Class`.
pub const JAVA_LANG_CLASS: &str = "java/lang/Class";
/// The binary name of `java/lang/NullPointerException`.
pub const NULL_POINTER_EXCEPTION: &str = "java/lang/NullPointerException";
/// The binary name of `java/lang/ArithmeticException`.
pub const ARITHMETIC_EXCEPTION: &str = "java/lang/ArithmeticException";
/// The binary name of `java/lang/ArrayIndexOutOfBoundsException`.
pub const ARRAY_INDEX_OUT_OF_BOUNDS_EXCEPTION: &str = "java/lang/ArrayIndexOutOfBoundsException";
/// The binary name of `java/lang/ArrayStoreException`.
pub const ARRAY_STORE_EXCEPTION: &str = "java/lang/ArrayStoreException";
/// The binary name of `java/lang/ClassCastException`.
pub const CLASS_CAST_EXCEPTION: &str = "java/lang/ClassCastException";
/// The binary name of `java/lang/NegativeArraySizeException`.
pub const NEGATIVE_ARRAY_SIZE_EXCEPTION: &str = "java/lang/NegativeArraySizeException";

/// A reference to a class by its binary name (e.g. `java/lang/String`).
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Clone)]
pub struct ClassRef {
    /// The binary name of the class.
    pub binary_name: String,
}

impl ClassRef {
    /// Creates a reference to the class with the given binary name.
    pub fn new<S: Into<String>>(binary_name: S) -> Self {
        Self {
            binary_name: binary_name.into(),
        }
    }

    /// A reference to `java/lang/Object`.
    #[must_use]
    pub fn object() -> Self {
        Self::new(JAVA_LANG_OBJECT)
    }

    /// Checks whether this reference denotes `java/lang/Object`.
    #[must_use]
    pub fn is_object(&self) -> bool {
        self.binary_name == JAVA_LANG_OBJECT
    }
}

impl Display for ClassRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.binary_name)
    }
}

/// A reference to a field.
#[derive(Debug, PartialEq, Eq, Hash, Clone)]
pub struct FieldRef {
    /// The class declaring the field.
    pub owner: ClassRef,
    /// The name of the field.
    pub name: String,
    /// The type of the field.
    pub field_type: FieldType,
}

impl Display for FieldRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.owner, self.name)
    }
}

/// A reference to a method.
#[derive(Debug, PartialEq, Eq, Hash, Clone)]
pub struct MethodRef {
    /// The reference to the class containing the method.
    pub owner: ClassRef,
    /// The name of the method.
    pub name: String,
    /// The descriptor of the method.
    pub descriptor: MethodDescriptor,
}

impl Display for MethodRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}::{}", self.owner, self.name)
    }
}
