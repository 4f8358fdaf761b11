//! Decoder - Tagged union decoding of polymorphic API payloads
//!
//! Many API responses come in several shapes, told apart by a discriminant
//! field (e.g., a security group rule's `protocol`). A [`VariantTable`] maps
//! each known discriminant value to the function decoding that shape.
//! Unknown discriminants are always an error; there is no fallback variant.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

/// Pseudo field name used when the payload itself has the wrong shape
pub const ROOT_FIELD: &str = "<root>";

/// Error type for tagged union decoding
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DecodeError {
    #[error("Required discriminant '{field}' is missing")]
    MissingDiscriminant { field: String },

    #[error("Unrecognized value '{value}' for discriminant '{field}'")]
    UnknownVariant { field: String, value: String },

    #[error("Field '{field}' has the wrong type: expected {expected}, got {found}")]
    FieldTypeMismatch {
        field: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("Required field '{field}' is missing")]
    MissingField { field: String },

    #[error("Variant '{value}' is already registered")]
    DuplicateVariant { value: String },
}

impl DecodeError {
    fn mismatch(field: &str, expected: &'static str, found: &Value) -> Self {
        Self::FieldTypeMismatch {
            field: field.to_string(),
            expected,
            found: json_type_name(found),
        }
    }
}

/// Function decoding one concrete variant from the full payload object
pub type DecodeFn<T> = fn(&Map<String, Value>) -> Result<T, DecodeError>;

/// Table of known variants keyed by discriminant value
#[derive(Debug, Clone)]
pub struct VariantTable<T> {
    field: String,
    variants: BTreeMap<String, DecodeFn<T>>,
}

impl<T> VariantTable<T> {
    /// Create an empty table dispatching on `field`
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            variants: BTreeMap::new(),
        }
    }

    /// Register a variant
    ///
    /// # Panics
    ///
    /// Panics if `value` is already registered. Tables are built once from
    /// static definitions, so a duplicate is a bug in the table itself.
    pub fn variant(self, value: impl Into<String>, decode: DecodeFn<T>) -> Self {
        match self.try_variant(value, decode) {
            Ok(table) => table,
            Err(e) => panic!("{}", e),
        }
    }

    /// Register a variant, rejecting duplicate discriminant values
    pub fn try_variant(
        mut self,
        value: impl Into<String>,
        decode: DecodeFn<T>,
    ) -> Result<Self, DecodeError> {
        let value = value.into();
        if self.variants.contains_key(&value) {
            return Err(DecodeError::DuplicateVariant { value });
        }
        self.variants.insert(value, decode);
        Ok(self)
    }

    /// Name of the discriminant field
    pub fn field(&self) -> &str {
        &self.field
    }

    /// Registered discriminant values, sorted
    pub fn values(&self) -> impl Iterator<Item = &str> {
        self.variants.keys().map(String::as_str)
    }

    pub fn contains(&self, value: &str) -> bool {
        self.variants.contains_key(value)
    }

    pub fn len(&self) -> usize {
        self.variants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variants.is_empty()
    }
}

/// Decode `payload` into the variant selected by its discriminant
///
/// The decode function receives the whole object, discriminant included, so
/// variants can keep it as a regular field.
pub fn decode<T>(payload: &Value, table: &VariantTable<T>) -> Result<T, DecodeError> {
    let object = payload
        .as_object()
        .ok_or_else(|| DecodeError::mismatch(ROOT_FIELD, "object", payload))?;

    let discriminant = match object.get(&table.field) {
        None | Some(Value::Null) => {
            return Err(DecodeError::MissingDiscriminant {
                field: table.field.clone(),
            });
        }
        Some(Value::String(s)) if s.is_empty() => {
            return Err(DecodeError::MissingDiscriminant {
                field: table.field.clone(),
            });
        }
        Some(Value::String(s)) => s,
        Some(other) => return Err(DecodeError::mismatch(&table.field, "string", other)),
    };

    let decode_fn = table
        .variants
        .get(discriminant)
        .ok_or_else(|| DecodeError::UnknownVariant {
            field: table.field.clone(),
            value: discriminant.clone(),
        })?;

    decode_fn(object)
}

/// Closed sum types decodable from a tagged payload
pub trait TaggedUnion: Sized {
    /// Variant table for this type
    fn variant_table() -> VariantTable<Self>;

    fn decode_from(payload: &Value) -> Result<Self, DecodeError> {
        decode(payload, &Self::variant_table())
    }
}

// =============================================================================
// Field helpers for variant decode functions
// =============================================================================

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn required<'a>(object: &'a Map<String, Value>, field: &str) -> Result<&'a Value, DecodeError> {
    match object.get(field) {
        None | Some(Value::Null) => Err(DecodeError::MissingField {
            field: field.to_string(),
        }),
        Some(v) => Ok(v),
    }
}

pub fn required_str<'a>(object: &'a Map<String, Value>, field: &str) -> Result<&'a str, DecodeError> {
    let value = required(object, field)?;
    value
        .as_str()
        .ok_or_else(|| DecodeError::mismatch(field, "string", value))
}

pub fn optional_str<'a>(
    object: &'a Map<String, Value>,
    field: &str,
) -> Result<Option<&'a str>, DecodeError> {
    match object.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(other) => Err(DecodeError::mismatch(field, "string", other)),
    }
}

pub fn required_i64(object: &Map<String, Value>, field: &str) -> Result<i64, DecodeError> {
    let value = required(object, field)?;
    value
        .as_i64()
        .ok_or_else(|| DecodeError::mismatch(field, "integer", value))
}

pub fn optional_i64(object: &Map<String, Value>, field: &str) -> Result<Option<i64>, DecodeError> {
    match object.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value
            .as_i64()
            .map(Some)
            .ok_or_else(|| DecodeError::mismatch(field, "integer", value)),
    }
}

pub fn required_bool(object: &Map<String, Value>, field: &str) -> Result<bool, DecodeError> {
    let value = required(object, field)?;
    value
        .as_bool()
        .ok_or_else(|| DecodeError::mismatch(field, "bool", value))
}

pub fn required_object<'a>(
    object: &'a Map<String, Value>,
    field: &str,
) -> Result<&'a Map<String, Value>, DecodeError> {
    let value = required(object, field)?;
    value
        .as_object()
        .ok_or_else(|| DecodeError::mismatch(field, "object", value))
}

pub fn required_array<'a>(
    object: &'a Map<String, Value>,
    field: &str,
) -> Result<&'a Vec<Value>, DecodeError> {
    let value = required(object, field)?;
    value
        .as_array()
        .ok_or_else(|| DecodeError::mismatch(field, "array", value))
}
