use serde::{Deserialize, Serialize};

/// Declares a string-backed identifier value object
macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug,
            Clone,
            PartialEq,
            Eq,
            Hash,
            PartialOrd,
            Ord,
            serde::Serialize,
            serde::Deserialize,
        )]
        pub struct $name(pub String);

        impl $name {
            /// Borrow the raw identifier
            #[inline]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

pub(crate) use string_id;

/// Declared type of a process variable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueType {
    /// JSON null
    Null,
    /// Boolean value
    Boolean,
    /// Integer value
    Integer,
    /// Floating point value
    Double,
    /// String value
    String,
    /// Structured JSON object or array
    Json,
}

impl ValueType {
    /// Infer the type of a raw JSON value
    pub fn of(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => ValueType::Null,
            serde_json::Value::Bool(_) => ValueType::Boolean,
            serde_json::Value::Number(n) if n.is_i64() || n.is_u64() => ValueType::Integer,
            serde_json::Value::Number(_) => ValueType::Double,
            serde_json::Value::String(_) => ValueType::String,
            serde_json::Value::Array(_) | serde_json::Value::Object(_) => ValueType::Json,
        }
    }
}

/// A variable value together with its type and persistence flag
///
/// Transient values are visible while the owning operation runs but are
/// never written to the instance snapshot.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TypedValue {
    /// The inner JSON value
    pub value: serde_json::Value,

    /// Declared type
    pub value_type: ValueType,

    /// Whether the value must not be persisted
    #[serde(default)]
    pub transient: bool,
}

impl TypedValue {
    /// Create a persistent value, inferring its type
    #[inline]
    pub fn new(value: serde_json::Value) -> Self {
        Self {
            value_type: ValueType::of(&value),
            value,
            transient: false,
        }
    }

    /// Create a transient value, inferring its type
    #[inline]
    pub fn transient(value: serde_json::Value) -> Self {
        Self {
            transient: true,
            ..Self::new(value)
        }
    }

    /// Create a value with an explicit type
    #[inline]
    pub fn typed(value: serde_json::Value, value_type: ValueType) -> Self {
        Self {
            value,
            value_type,
            transient: false,
        }
    }

    /// Get the inner JSON value
    #[inline]
    pub fn as_value(&self) -> &serde_json::Value {
        &self.value
    }

    /// Try to read the value as an integer
    #[inline]
    pub fn as_i64(&self) -> Option<i64> {
        self.value.as_i64()
    }

    /// Try to read the value as a string
    #[inline]
    pub fn as_str(&self) -> Option<&str> {
        self.value.as_str()
    }
}

impl From<serde_json::Value> for TypedValue {
    fn from(value: serde_json::Value) -> Self {
        TypedValue::new(value)
    }
}

impl From<i64> for TypedValue {
    fn from(value: i64) -> Self {
        TypedValue::new(serde_json::Value::from(value))
    }
}

impl From<&str> for TypedValue {
    fn from(value: &str) -> Self {
        TypedValue::new(serde_json::Value::from(value))
    }
}
