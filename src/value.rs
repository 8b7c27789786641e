//! The tree of typed values.
//!
//! One variant per wire type. A value always knows its own
//! [`Type`]: scalars map to a fixed type, variants cache the
//! signature of their payload, and arrays carry their element type
//! so that an empty array still serializes correctly. Values are
//! immutable once constructed; the constructors enforce the
//! invariants that the wire format relies on.

use std::rc::Rc;

use crate::error::InvariantError;
use crate::signature::Signature;
use crate::types::Type;

/// A typed D-Bus value.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Byte(u8),
    Boolean(bool),
    Uint16(u16),
    Int16(i16),
    Uint32(u32),
    Int32(i32),
    Uint64(u64),
    Int64(i64),
    Double(f64),
    /// An index into the out-of-band file-descriptor array, not a
    /// file descriptor itself.
    UnixFd(u32),
    String(String),
    Path(String),
    Signature(Signature),
    /// A type-erased value together with the signature of its
    /// payload, cached at construction.
    Variant {
        signature: Signature,
        value: Box<Value>,
    },
    /// Homogeneous elements plus the element type, which is
    /// authoritative when the array is empty.
    Array {
        elem: Type,
        items: Vec<Value>,
    },
    Struct(Vec<Value>),
    /// Only meaningful as an array element; decoders accept it
    /// anywhere.
    DictEntry {
        key: Box<Value>,
        value: Box<Value>,
    },
}

fn check_text(s: &str) -> Result<(), InvariantError> {
    if s.as_bytes().contains(&0) {
        return Err(InvariantError::EmbeddedNul);
    }
    if u32::try_from(s.len()).is_err() {
        return Err(InvariantError::StringTooLong(s.len()));
    }
    Ok(())
}

impl Value {
    /// Build a string value. The payload must not contain NUL bytes
    /// and its length must fit in the 32-bit length prefix.
    pub fn string(s: impl Into<String>) -> Result<Value, InvariantError> {
        let s = s.into();
        check_text(&s)?;
        Ok(Value::String(s))
    }

    /// Build an object-path value. Same wire constraints as
    /// [`Value::string`]; path syntax is not validated here.
    pub fn path(s: impl Into<String>) -> Result<Value, InvariantError> {
        let s = s.into();
        check_text(&s)?;
        Ok(Value::Path(s))
    }

    /// Build a signature value from signature text.
    pub fn signature(s: impl Into<String>) -> Result<Value, InvariantError> {
        Ok(Value::Signature(Signature::new(s)?))
    }

    /// Wrap a value in a variant, caching its signature.
    pub fn variant(value: Value) -> Result<Value, InvariantError> {
        let signature = value.ty().signature()?;
        Ok(Value::Variant {
            signature,
            value: Box::new(value),
        })
    }

    /// Build a dict entry. The key must be of a basic type.
    pub fn dict_entry(key: Value, value: Value) -> Result<Value, InvariantError> {
        let key_ty = key.ty();
        if !key_ty.is_basic() {
            return Err(InvariantError::DictKeyNotBasic(key_ty.name()));
        }
        Ok(Value::DictEntry {
            key: Box::new(key),
            value: Box::new(value),
        })
    }

    /// Build an array of `elem`-typed values. Every element must
    /// have exactly the type `elem`.
    pub fn array(elem: Type, items: Vec<Value>) -> Result<Value, InvariantError> {
        for item in &items {
            let found = item.ty();
            if found != elem {
                return Err(InvariantError::ElementTypeMismatch {
                    expected: elem.name(),
                    found: found.name(),
                });
            }
        }
        Ok(Value::Array { elem, items })
    }

    /// Build a struct value from its fields, in order. Empty
    /// structs are not a valid wire type.
    pub fn struct_of(items: Vec<Value>) -> Result<Value, InvariantError> {
        if items.is_empty() {
            return Err(InvariantError::EmptyStruct);
        }
        Ok(Value::Struct(items))
    }

    /// The type of this value. Its serialization is exactly what the
    /// wire parser would reproduce for this node.
    pub fn ty(&self) -> Type {
        match self {
            Value::Byte(_) => Type::Byte,
            Value::Boolean(_) => Type::Boolean,
            Value::Uint16(_) => Type::Uint16,
            Value::Int16(_) => Type::Int16,
            Value::Uint32(_) => Type::Uint32,
            Value::Int32(_) => Type::Int32,
            Value::Uint64(_) => Type::Uint64,
            Value::Int64(_) => Type::Int64,
            Value::Double(_) => Type::Double,
            Value::UnixFd(_) => Type::UnixFd,
            Value::String(_) => Type::String,
            Value::Path(_) => Type::Path,
            Value::Signature(_) => Type::Signature,
            Value::Variant { .. } => Type::Variant,
            Value::Array { elem, .. } => Type::Array(Rc::new(elem.clone())),
            Value::Struct(items) => {
                Type::Struct(Rc::from(items.iter().map(Value::ty).collect::<Vec<_>>()))
            }
            Value::DictEntry { key, value } => {
                Type::DictEntry(Rc::new(key.ty()), Rc::new(value.ty()))
            }
        }
    }

    pub fn as_byte(&self) -> Option<u8> {
        match self {
            Value::Byte(x) => Some(*x),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(x) => Some(*x),
            _ => None,
        }
    }

    pub fn as_u16(&self) -> Option<u16> {
        match self {
            Value::Uint16(x) => Some(*x),
            _ => None,
        }
    }

    pub fn as_i16(&self) -> Option<i16> {
        match self {
            Value::Int16(x) => Some(*x),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Value::Uint32(x) => Some(*x),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Value::Int32(x) => Some(*x),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::Uint64(x) => Some(*x),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int64(x) => Some(*x),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Double(x) => Some(*x),
            _ => None,
        }
    }

    pub fn as_unix_fd(&self) -> Option<u32> {
        match self {
            Value::UnixFd(x) => Some(*x),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_path(&self) -> Option<&str> {
        match self {
            Value::Path(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_signature(&self) -> Option<&Signature> {
        match self {
            Value::Signature(s) => Some(s),
            _ => None,
        }
    }

    /// The payload of a variant.
    pub fn as_variant(&self) -> Option<&Value> {
        match self {
            Value::Variant { value, .. } => Some(value),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<(&Type, &[Value])> {
        match self {
            Value::Array { elem, items } => Some((elem, items)),
            _ => None,
        }
    }

    pub fn as_struct(&self) -> Option<&[Value]> {
        match self {
            Value::Struct(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_dict_entry(&self) -> Option<(&Value, &Value)> {
        match self {
            Value::DictEntry { key, value } => Some((key, value)),
            _ => None,
        }
    }
}

macro_rules! value_from {
    ($ty:ty, $variant:ident) => {
        impl From<$ty> for Value {
            fn from(x: $ty) -> Value {
                Value::$variant(x)
            }
        }
    };
}

value_from!(u8, Byte);
value_from!(bool, Boolean);
value_from!(u16, Uint16);
value_from!(i16, Int16);
value_from!(u32, Uint32);
value_from!(i32, Int32);
value_from!(u64, Uint64);
value_from!(i64, Int64);
value_from!(f64, Double);
