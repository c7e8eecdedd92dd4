//! Module for the APIs modeling the types of fields, locals, and operands.

use std::fmt::Display;
use std::str::FromStr;

use crate::jvm::references::ClassRef;

/// A primitive type in the JVM.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Copy)]
pub enum PrimitiveType {
    /// The `boolean` type.
    Boolean,
    /// The `char` type.
    Char,
    /// The `float` type.
    Float,
    /// The `double` type.
    Double,
    /// The `byte` type.
    Byte,
    /// The `short` type.
    Short,
    /// The `int` type.
    Int,
    /// The `long` type.
    Long,
}

impl PrimitiveType {
    /// The descriptor character of the type.
    #[must_use]
    pub const fn descriptor_char(self) -> char {
        match self {
            Self::Boolean => 'Z',
            Self::Char => 'C',
            Self::Float => 'F',
            Self::Double => 'D',
            Self::Byte => 'B',
            Self::Short => 'S',
            Self::Int => 'I',
            Self::Long => 'J',
        }
    }

    /// The number of operand stack slots a value of this type occupies.
    #[must_use]
    pub const fn slot_count(self) -> u16 {
        match self {
            Self::Long | Self::Double => 2,
            _ => 1,
        }
    }
}

impl TryFrom<char> for PrimitiveType {
    type Error = char;

    fn try_from(value: char) -> Result<Self, Self::Error> {
        match value {
            'Z' => Ok(Self::Boolean),
            'C' => Ok(Self::Char),
            'F' => Ok(Self::Float),
            'D' => Ok(Self::Double),
            'B' => Ok(Self::Byte),
            'S' => Ok(Self::Short),
            'I' => Ok(Self::Int),
            'J' => Ok(Self::Long),
            unexpected => Err(unexpected),
        }
    }
}

impl Display for PrimitiveType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Boolean => write!(f, "boolean"),
            Self::Char => write!(f, "char"),
            Self::Float => write!(f, "float"),
            Self::Double => write!(f, "double"),
            Self::Byte => write!(f, "byte"),
            Self::Short => write!(f, "short"),
            Self::Int => write!(f, "int"),
            Self::Long => write!(f, "long"),
        }
    }
}

/// A type of a field, a local variable, or an operand stack entry.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Clone)]
pub enum FieldType {
    /// A primitive type.
    Base(PrimitiveType),
    /// A reference to a class or an interface.
    Object(ClassRef),
    /// An array type, holding its component type.
    Array(Box<FieldType>),
}

impl FieldType {
    /// Creates the array type whose components are of this type.
    #[must_use]
    pub fn make_array_type(&self) -> Self {
        Self::Array(Box::new(self.clone()))
    }

    /// Checks whether the type is a reference type (an object or an array).
    #[must_use]
    pub const fn is_reference(&self) -> bool {
        matches!(self, Self::Object(_) | Self::Array(_))
    }

    /// The number of operand stack slots a value of this type occupies.
    #[must_use]
    pub const fn slot_count(&self) -> u16 {
        match self {
            Self::Base(p) => p.slot_count(),
            Self::Object(_) | Self::Array(_) => 1,
        }
    }

    /// The component type, if this is an array type.
    #[must_use]
    pub fn component_type(&self) -> Option<&FieldType> {
        match self {
            Self::Array(component) => Some(component),
            _ => None,
        }
    }

    /// The innermost component type and the dimensionality of the array.
    /// For non-array types the dimensionality is zero.
    #[must_use]
    pub fn element_type(&self) -> (&FieldType, u8) {
        let mut current = self;
        let mut dims = 0u8;
        while let Self::Array(component) = current {
            current = component;
            dims += 1;
        }
        (current, dims)
    }

    /// The descriptor string of the type (e.g. `Ljava/lang/String;`).
    #[must_use]
    pub fn descriptor_string(&self) -> String {
        match self {
            Self::Base(p) => p.descriptor_char().to_string(),
            Self::Object(class) => format!("L{};", class.binary_name),
            Self::Array(component) => format!("[{}", component.descriptor_string()),
        }
    }
}

impl Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Base(p) => p.fmt(f),
            Self::Object(class) => class.fmt(f),
            Self::Array(component) => write!(f, "{component}[]"),
        }
    }
}

/// An error indicating that a descriptor string is invalid.
#[derive(Debug, thiserror::Error)]
#[error("Invalid descriptor: {0}")]
pub struct InvalidDescriptor(pub String);

impl FromStr for FieldType {
    type Err = InvalidDescriptor;

    fn from_str(descriptor: &str) -> Result<Self, Self::Err> {
        let mut chars = descriptor.chars();
        let prefix = chars
            .next()
            .ok_or_else(|| InvalidDescriptor(descriptor.into()))?;
        let result = parse_prefixed(prefix, &mut chars)
            .map_err(|()| InvalidDescriptor(descriptor.into()))?;
        if chars.next().is_some() {
            return Err(InvalidDescriptor(descriptor.into()));
        }
        Ok(result)
    }
}

/// Parses a single type whose first character has already been consumed.
/// The iterator is advanced past the parsed type.
pub(crate) fn parse_prefixed(prefix: char, remaining: &mut std::str::Chars<'_>) -> Result<FieldType, ()> {
    if let Ok(p) = PrimitiveType::try_from(prefix) {
        return Ok(FieldType::Base(p));
    }
    match prefix {
        'L' => {
            let mut binary_name = String::new();
            loop {
                match remaining.next() {
                    Some(';') => break,
                    Some(c) => binary_name.push(c),
                    None => return Err(()),
                }
            }
            if binary_name.is_empty() {
                return Err(());
            }
            Ok(FieldType::Object(ClassRef::new(binary_name)))
        }
        '[' => {
            let next_prefix = remaining.next().ok_or(())?;
            parse_prefixed(next_prefix, remaining).map(|it| it.make_array_type())
        }
        _ => Err(()),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn parse_primitive() {
        assert_eq!(
            FieldType::from_str("I").unwrap(),
            FieldType::Base(PrimitiveType::Int)
        );
    }

    #[test]
    fn parse_object() {
        assert_eq!(
            FieldType::from_str("Ljava/lang/String;").unwrap(),
            FieldType::Object(ClassRef::new("java/lang/String"))
        );
    }

    #[test]
    fn parse_array() {
        assert_eq!(
            FieldType::from_str("[[J").unwrap(),
            FieldType::Base(PrimitiveType::Long)
                .make_array_type()
                .make_array_type()
        );
    }

    #[test]
    fn parse_garbage() {
        assert!(FieldType::from_str("").is_err());
        assert!(FieldType::from_str("Ljava/lang/String").is_err());
        assert!(FieldType::from_str("X").is_err());
        assert!(FieldType::from_str("II").is_err());
        assert!(FieldType::from_str("L;").is_err());
    }

    #[test]
    fn element_type_and_dimensions() {
        let t = FieldType::Object(ClassRef::new("java/lang/String"))
            .make_array_type()
            .make_array_type();
        let (element, dims) = t.element_type();
        assert_eq!(
            element,
            &FieldType::Object(ClassRef::new("java/lang/String"))
        );
        assert_eq!(dims, 2);
    }

    #[test]
    fn descriptor_round_trip() {
        for desc in ["I", "[Z", "Ljava/util/List;", "[[Ljava/lang/Object;"] {
            assert_eq!(
                FieldType::from_str(desc).unwrap().descriptor_string(),
                desc
            );
        }
    }
}
