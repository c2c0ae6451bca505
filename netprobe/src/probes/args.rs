//! Binding of untyped probe configuration to typed probe arguments.
//!
//! A probe declares its configuration as a plain struct and describes it
//! once with an [`ArgSchema`]: one entry per field, holding the field name,
//! the converter for its declared type and the setter. Binding then looks up
//! each field in the raw mapping case-insensitively and converts the value.
//! Keys that are absent leave the field at its default.
//!
//! ```
//! use netprobe::probes::args::{ArgSchema, ProbeArgs, RawArgs};
//!
//! #[derive(Debug, Default, PartialEq)]
//! struct ProbeConfig {
//!     arg_a: String,
//!     arg_b: i64,
//!     arg_c: Vec<String>,
//! }
//!
//! impl ProbeArgs for ProbeConfig {
//!     fn schema() -> ArgSchema<Self> {
//!         ArgSchema::<Self>::new()
//!             .field("ArgA", |a, v| a.arg_a = v)
//!             .field("ArgB", |a, v| a.arg_b = v)
//!             .field("ArgC", |a, v| a.arg_c = v)
//!     }
//! }
//!
//! let raw: RawArgs = serde_json::from_str(r#"{"arga": "x", "ARGB": 20}"#).unwrap();
//! let config = ProbeConfig::schema().bind(&raw).unwrap();
//! assert_eq!(config.arg_b, 20);
//! ```

use std::collections::{BTreeMap, HashMap};

use serde_json::Value;

use crate::error::ArgBindingError;

/// Untyped per-probe configuration as produced by the settings loader.
pub type RawArgs = HashMap<String, Value>;

/// Conversion failure below the field level, before the field name is known.
#[derive(Debug)]
pub struct Mismatch {
    /// Position inside the field value, e.g. `[2]` or `.key`.
    path: String,
    expected: String,
    actual: String,
}

impl Mismatch {
    pub fn new<T: FromArg>(value: &Value) -> Self {
        Self {
            path: String::new(),
            expected: T::type_name(),
            actual: value_kind(value).to_string(),
        }
    }

    fn nested(mut self, segment: String) -> Self {
        self.path.insert_str(0, &segment);
        self
    }

    fn into_binding_error(self, field: &str) -> ArgBindingError {
        ArgBindingError {
            field: format!("{}{}", field, self.path),
            expected: self.expected,
            actual: self.actual,
        }
    }
}

/// Dynamic type name of a raw configuration value.
pub fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_i64() || n.is_u64() => "int",
        Value::Number(_) => "float",
        Value::String(_) => "string",
        Value::Array(_) => "sequence",
        Value::Object(_) => "mapping",
    }
}

/// A type a raw configuration value can be converted to.
pub trait FromArg: Sized {
    /// Human readable type name used in diagnostics.
    fn type_name() -> String;

    fn from_arg(value: &Value) -> Result<Self, Mismatch>;
}

impl FromArg for String {
    fn type_name() -> String {
        "string".to_string()
    }

    fn from_arg(value: &Value) -> Result<Self, Mismatch> {
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| Mismatch::new::<Self>(value))
    }
}

impl FromArg for bool {
    fn type_name() -> String {
        "bool".to_string()
    }

    fn from_arg(value: &Value) -> Result<Self, Mismatch> {
        value.as_bool().ok_or_else(|| Mismatch::new::<Self>(value))
    }
}

macro_rules! impl_from_arg_int {
    ($($t:ty),* $(,)?) => {
        $(
            impl FromArg for $t {
                fn type_name() -> String {
                    stringify!($t).to_string()
                }

                fn from_arg(value: &Value) -> Result<Self, Mismatch> {
                    let converted = match value {
                        Value::Number(n) => n
                            .as_i64()
                            .and_then(|v| <$t>::try_from(v).ok())
                            .or_else(|| n.as_u64().and_then(|v| <$t>::try_from(v).ok())),
                        _ => None,
                    };
                    converted.ok_or_else(|| Mismatch::new::<Self>(value))
                }
            }
        )*
    };
}

impl_from_arg_int!(i8, i16, i32, i64, isize, u8, u16, u32, u64, usize);

impl FromArg for f64 {
    fn type_name() -> String {
        "f64".to_string()
    }

    fn from_arg(value: &Value) -> Result<Self, Mismatch> {
        value.as_f64().ok_or_else(|| Mismatch::new::<Self>(value))
    }
}

impl FromArg for f32 {
    fn type_name() -> String {
        "f32".to_string()
    }

    fn from_arg(value: &Value) -> Result<Self, Mismatch> {
        value
            .as_f64()
            .map(|v| v as f32)
            .filter(|v| v.is_finite())
            .ok_or_else(|| Mismatch::new::<Self>(value))
    }
}

impl FromArg for Value {
    fn type_name() -> String {
        "any".to_string()
    }

    fn from_arg(value: &Value) -> Result<Self, Mismatch> {
        Ok(value.clone())
    }
}

impl<T: FromArg> FromArg for Option<T> {
    fn type_name() -> String {
        format!("optional {}", T::type_name())
    }

    fn from_arg(value: &Value) -> Result<Self, Mismatch> {
        match value {
            Value::Null => Ok(None),
            v => T::from_arg(v).map(Some),
        }
    }
}

impl<T: FromArg> FromArg for Vec<T> {
    fn type_name() -> String {
        format!("[]{}", T::type_name())
    }

    fn from_arg(value: &Value) -> Result<Self, Mismatch> {
        let items = value.as_array().ok_or_else(|| Mismatch::new::<Self>(value))?;
        items
            .iter()
            .enumerate()
            .map(|(i, item)| T::from_arg(item).map_err(|e| e.nested(format!("[{}]", i))))
            .collect()
    }
}

impl<T: FromArg> FromArg for HashMap<String, T> {
    fn type_name() -> String {
        format!("map[string]{}", T::type_name())
    }

    fn from_arg(value: &Value) -> Result<Self, Mismatch> {
        let entries = value.as_object().ok_or_else(|| Mismatch::new::<Self>(value))?;
        entries
            .iter()
            .map(|(k, v)| {
                T::from_arg(v)
                    .map(|v| (k.clone(), v))
                    .map_err(|e| e.nested(format!(".{}", k)))
            })
            .collect()
    }
}

impl<T: FromArg> FromArg for BTreeMap<String, T> {
    fn type_name() -> String {
        format!("map[string]{}", T::type_name())
    }

    fn from_arg(value: &Value) -> Result<Self, Mismatch> {
        HashMap::<String, T>::from_arg(value).map(|m| m.into_iter().collect())
    }
}

/// Bind a mapping-shaped argument: every key is kept, every value converted.
pub fn bind_mapping<V: FromArg>(raw: &RawArgs) -> Result<HashMap<String, V>, ArgBindingError> {
    raw.iter()
        .map(|(key, value)| {
            V::from_arg(value)
                .map(|v| (key.clone(), v))
                .map_err(|e| e.into_binding_error(key))
        })
        .collect()
}

/// Name and declared type of one record field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub type_name: String,
}

type Setter<T> = Box<dyn Fn(&mut T, &Value) -> Result<(), Mismatch> + Send + Sync>;

struct FieldBinding<T> {
    spec: FieldSpec,
    key: String,
    apply: Setter<T>,
}

/// Declarative binding table for a record-shaped probe configuration.
pub struct ArgSchema<T> {
    fields: Vec<FieldBinding<T>>,
}

impl<T: Default + 'static> Default for ArgSchema<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Default + 'static> ArgSchema<T> {
    pub fn new() -> Self {
        Self { fields: Vec::new() }
    }

    /// Declare a field. `name` is matched against configuration keys
    /// ignoring case; `set` stores the converted value.
    pub fn field<V, F>(mut self, name: &'static str, set: F) -> Self
    where
        V: FromArg + 'static,
        F: Fn(&mut T, V) + Send + Sync + 'static,
    {
        self.fields.push(FieldBinding {
            spec: FieldSpec {
                name,
                type_name: V::type_name(),
            },
            key: name.to_lowercase(),
            apply: Box::new(move |target: &mut T, raw: &Value| -> Result<(), Mismatch> {
                set(target, V::from_arg(raw)?);
                Ok(())
            }),
        });
        self
    }

    pub fn fields(&self) -> Vec<FieldSpec> {
        self.fields.iter().map(|f| f.spec.clone()).collect()
    }

    /// Check the table itself: names must be non-empty and unique ignoring case.
    pub fn validate(&self) -> Result<(), String> {
        for (i, field) in self.fields.iter().enumerate() {
            if field.key.is_empty() {
                return Err(format!("field #{} has an empty name", i));
            }
            if let Some(other) = self.fields[..i].iter().find(|f| f.key == field.key) {
                return Err(format!(
                    "fields {} and {} differ only in case",
                    other.spec.name, field.spec.name
                ));
            }
        }
        Ok(())
    }

    /// Produce a fresh `T` from `raw`.
    ///
    /// Null values are treated like absent keys. Unknown keys are ignored.
    pub fn bind(&self, raw: &RawArgs) -> Result<T, ArgBindingError> {
        let mut target = T::default();
        for field in &self.fields {
            let Some(value) = lookup(raw, field.spec.name, &field.key) else {
                continue;
            };
            if value.is_null() {
                continue;
            }
            (field.apply)(&mut target, value).map_err(|e| e.into_binding_error(field.spec.name))?;
        }
        Ok(target)
    }
}

/// Find the raw value for a field. An exact key wins; among keys that only
/// match ignoring case, the lexicographically smallest one is taken so the
/// result does not depend on map iteration order.
fn lookup<'a>(raw: &'a RawArgs, name: &str, key: &str) -> Option<&'a Value> {
    if let Some(value) = raw.get(name) {
        return Some(value);
    }
    raw.iter()
        .filter(|(k, _)| k.to_lowercase() == key)
        .min_by(|(a, _), (b, _)| a.cmp(b))
        .map(|(_, v)| v)
}

/// A probe configuration struct bindable from [`RawArgs`].
pub trait ProbeArgs: Default + Send + 'static {
    fn schema() -> ArgSchema<Self>;
}
