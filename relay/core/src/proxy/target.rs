//! Remote Objects
//!
//! A target exposes a fixed, declared surface: named methods with typed
//! parameters, and named read-only properties. The declaration
//! ([`Interface`]) is made once when the target is defined. The server
//! binds and checks arguments against it before the target sees them, and
//! clients fetch it to know which names are methods and which are values.

use std::collections::BTreeMap;
use std::fmt;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Shape of a parameter value
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    /// Anything, including null
    Any,
    /// `true` / `false`
    Bool,
    /// Whole number
    Integer,
    /// Any number
    Number,
    /// Text
    String,
    /// JSON array
    Array,
    /// JSON object
    Object,
}

impl ValueKind {
    /// Whether `value` has this shape
    #[must_use]
    pub fn accepts(self, value: &Value) -> bool {
        match self {
            Self::Any => true,
            Self::Bool => value.is_boolean(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Number => value.is_number(),
            Self::String => value.is_string(),
            Self::Array => value.is_array(),
            Self::Object => value.is_object(),
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Any => "any",
            Self::Bool => "bool",
            Self::Integer => "integer",
            Self::Number => "number",
            Self::String => "string",
            Self::Array => "array",
            Self::Object => "object",
        };
        f.write_str(name)
    }
}

/// One declared method parameter
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Param {
    /// Parameter name, used for keyword binding
    pub name: String,
    /// Accepted value shape
    pub kind: ValueKind,
    /// Whether the caller must supply it
    pub required: bool,
    /// Value used when an optional parameter is omitted
    #[serde(default)]
    pub default: Value,
}

impl Param {
    /// A parameter the caller must supply
    #[must_use]
    pub fn required(name: impl Into<String>, kind: ValueKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: true,
            default: Value::Null,
        }
    }

    /// A parameter that falls back to `default`
    #[must_use]
    pub fn optional(name: impl Into<String>, kind: ValueKind, default: Value) -> Self {
        Self {
            name: name.into(),
            kind,
            required: false,
            default,
        }
    }
}

/// A declared method
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MethodSpec {
    /// Method name
    pub name: String,
    /// Parameters in positional order
    #[serde(default)]
    pub params: Vec<Param>,
}

impl MethodSpec {
    /// A method with no parameters yet
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
        }
    }

    /// Append a parameter
    #[must_use]
    pub fn with_param(mut self, param: Param) -> Self {
        self.params.push(param);
        self
    }
}

/// Whether a name refers to a method or a property
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemberKind {
    /// Invoked with arguments
    Method,
    /// Read as a value
    Property,
}

/// Declared surface of a remote object
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Interface {
    /// Type name, for diagnostics
    pub name: String,
    /// Callable members
    #[serde(default)]
    pub methods: Vec<MethodSpec>,
    /// Readable members
    #[serde(default)]
    pub properties: Vec<String>,
}

impl Interface {
    /// An empty interface
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: Vec::new(),
            properties: Vec::new(),
        }
    }

    /// Declare a method
    #[must_use]
    pub fn with_method(mut self, method: MethodSpec) -> Self {
        self.methods.push(method);
        self
    }

    /// Declare a property
    #[must_use]
    pub fn with_property(mut self, name: impl Into<String>) -> Self {
        self.properties.push(name.into());
        self
    }

    /// Look up a method by name
    #[must_use]
    pub fn find_method(&self, name: &str) -> Option<&MethodSpec> {
        self.methods.iter().find(|m| m.name == name)
    }

    /// Whether `name` is a declared property
    #[must_use]
    pub fn has_property(&self, name: &str) -> bool {
        self.properties.iter().any(|p| p == name)
    }

    /// Classify `name`, or `None` if it is not declared
    ///
    /// A name declared as both resolves to the method.
    #[must_use]
    pub fn member_kind(&self, name: &str) -> Option<MemberKind> {
        if self.find_method(name).is_some() {
            Some(MemberKind::Method)
        } else if self.has_property(name) {
            Some(MemberKind::Property)
        } else {
            None
        }
    }
}

/// Arguments bound to parameter names
///
/// Every declared parameter is present: supplied values, or defaults for
/// omitted optional ones.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Arguments {
    values: BTreeMap<String, Value>,
}

impl Arguments {
    /// Wrap already-bound values
    #[must_use]
    pub fn from_map(values: BTreeMap<String, Value>) -> Self {
        Self { values }
    }

    /// Raw value of a parameter
    #[must_use]
    pub fn value(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    /// Typed value of a parameter
    ///
    /// # Errors
    ///
    /// Returns a `TypeError` [`TargetError`] if the parameter is missing or
    /// does not convert to `T`.
    pub fn get<T: DeserializeOwned>(&self, name: &str) -> Result<T, TargetError> {
        let value = self
            .values
            .get(name)
            .ok_or_else(|| TargetError::type_error(format!("missing argument '{name}'")))?;

        serde_json::from_value(value.clone())
            .map_err(|e| TargetError::type_error(format!("argument '{name}': {e}")))
    }

    /// Typed value of a parameter that may be null
    ///
    /// # Errors
    ///
    /// Same as [`Arguments::get`], except that null or missing is `Ok(None)`.
    pub fn get_opt<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, TargetError> {
        match self.values.get(name) {
            None | Some(Value::Null) => Ok(None),
            Some(_) => self.get(name).map(Some),
        }
    }

    /// Number of bound parameters
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether no parameters are bound
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Failure raised by a target's own logic
///
/// `kind` travels to the caller unchanged, so pick names callers can match
/// on (`ValueError`, `StateError`, ...).
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct TargetError {
    /// Failure kind
    pub kind: String,
    /// Human-readable message
    pub message: String,
}

impl TargetError {
    /// Error of an arbitrary kind
    #[must_use]
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// An argument had the wrong shape
    #[must_use]
    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new("TypeError", message)
    }

    /// An argument had an unacceptable value
    #[must_use]
    pub fn value_error(message: impl Into<String>) -> Self {
        Self::new("ValueError", message)
    }

    /// The target is not in a state that allows the operation
    #[must_use]
    pub fn state_error(message: impl Into<String>) -> Self {
        Self::new("StateError", message)
    }
}

/// An object whose declared surface can be invoked remotely
///
/// The server calls these from its single worker, one request at a time,
/// so implementations need no internal locking.
pub trait RemoteObject: Send + 'static {
    /// Declared methods and properties
    fn interface(&self) -> Interface;

    /// Invoke a declared method with bound arguments
    ///
    /// # Errors
    ///
    /// Any [`TargetError`]; it is reported to the caller as-is.
    fn call(&mut self, method: &str, args: &Arguments) -> Result<Value, TargetError>;

    /// Read a declared property
    ///
    /// # Errors
    ///
    /// Any [`TargetError`]; it is reported to the caller as-is.
    fn get(&self, property: &str) -> Result<Value, TargetError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Interface {
        Interface::new("Sample")
            .with_method(
                MethodSpec::new("add")
                    .with_param(Param::required("a", ValueKind::Number))
                    .with_param(Param::optional("b", ValueKind::Number, json!(1))),
            )
            .with_property("count")
    }

    #[test]
    fn test_value_kind_accepts() {
        assert!(ValueKind::Integer.accepts(&json!(3)));
        assert!(!ValueKind::Integer.accepts(&json!(3.5)));
        assert!(ValueKind::Number.accepts(&json!(3.5)));
        assert!(ValueKind::String.accepts(&json!("x")));
        assert!(!ValueKind::String.accepts(&json!(null)));
        assert!(ValueKind::Any.accepts(&json!(null)));
        assert!(ValueKind::Object.accepts(&json!({})));
        assert!(ValueKind::Array.accepts(&json!([])));
        assert!(ValueKind::Bool.accepts(&json!(false)));
    }

    #[test]
    fn test_member_kind() {
        let iface = sample();
        assert_eq!(iface.member_kind("add"), Some(MemberKind::Method));
        assert_eq!(iface.member_kind("count"), Some(MemberKind::Property));
        assert_eq!(iface.member_kind("nope"), None);
        assert_eq!(iface.find_method("add").unwrap().params.len(), 2);
    }

    #[test]
    fn test_interface_serializes_as_plain_data() {
        let value = serde_json::to_value(sample()).unwrap();
        assert_eq!(value["methods"][0]["params"][0]["kind"], json!("number"));

        let back: Interface = serde_json::from_value(value).unwrap();
        assert_eq!(back, sample());
    }

    #[test]
    fn test_arguments_typed_access() {
        let mut values = BTreeMap::new();
        values.insert("n".to_string(), json!(4));
        values.insert("label".to_string(), Value::Null);
        let args = Arguments::from_map(values);

        assert_eq!(args.get::<i64>("n").unwrap(), 4);
        assert_eq!(args.get_opt::<String>("label").unwrap(), None);
        assert_eq!(args.get_opt::<String>("absent").unwrap(), None);

        let err = args.get::<String>("n").unwrap_err();
        assert_eq!(err.kind, "TypeError");
        assert!(args.get::<i64>("absent").is_err());
        assert_eq!(args.len(), 2);
    }
}
