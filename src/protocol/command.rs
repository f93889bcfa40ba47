//! Command descriptors and typed field encoding.
//!
//! A [`Command`] is a named RPC operation with ordered, typed argument and
//! response fields. Descriptors are static: both sides of the wire agree on
//! the schema at compile time, and every field has a stable text encoding
//! (decimal integers, `true`/`false` booleans, JSON text for structured
//! values) so the box format stays strings-only.

use std::collections::BTreeMap;

use crate::error::{CorralError, Result};
use crate::protocol::boxes::BoxFields;

/// Wire key carrying the command name of a request box.
pub const KEY_COMMAND: &str = "_command";
/// Wire key carrying the correlation id of a request that wants an answer.
pub const KEY_ASK: &str = "_ask";
/// Wire key carrying the correlation id of a successful response.
pub const KEY_ANSWER: &str = "_answer";
/// Wire key carrying the correlation id of a failed response.
pub const KEY_ERROR: &str = "_error";
/// Wire key carrying the error type name of a failed response.
pub const KEY_ERROR_KIND: &str = "_error_kind";
/// Wire key carrying the error message of a failed response.
pub const KEY_ERROR_MSG: &str = "_error_msg";

/// Error kind reported when the dispatcher has no handler for a command.
pub const ERROR_KIND_UNKNOWN_COMMAND: &str = "UNKNOWN_COMMAND";
/// Error kind reported when a handler fails.
pub const ERROR_KIND_COMMAND_FAILED: &str = "COMMAND_FAILED";
/// Error kind reported when request arguments do not decode.
pub const ERROR_KIND_BAD_ARGUMENTS: &str = "BAD_ARGUMENTS";

/// The type of one command field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Str,
    Int,
    Bool,
    /// Arbitrary structured value, carried as JSON text.
    Json,
}

/// One named, typed field of a command's argument or response schema.
#[derive(Debug, Clone, Copy)]
pub struct Field {
    pub name: &'static str,
    pub kind: FieldKind,
}

/// A named RPC operation.
///
/// `requires_answer = false` makes the command fire-and-forget: no
/// correlation id is allocated, no response is awaited, and the submitter's
/// future resolves (with empty fields) as soon as the request is written.
#[derive(Debug, Clone, Copy)]
pub struct Command {
    pub name: &'static str,
    pub args: &'static [Field],
    pub response: &'static [Field],
    pub requires_answer: bool,
}

/// A typed field value.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Str(String),
    Int(i64),
    Bool(bool),
    Json(serde_json::Value),
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Str(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Str(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Int(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Bool(value)
    }
}

impl From<serde_json::Value> for FieldValue {
    fn from(value: serde_json::Value) -> Self {
        FieldValue::Json(value)
    }
}

impl FieldKind {
    fn name(self) -> &'static str {
        match self {
            FieldKind::Str => "str",
            FieldKind::Int => "int",
            FieldKind::Bool => "bool",
            FieldKind::Json => "json",
        }
    }

    fn matches(self, value: &FieldValue) -> bool {
        matches!(
            (self, value),
            (FieldKind::Str, FieldValue::Str(_))
                | (FieldKind::Int, FieldValue::Int(_))
                | (FieldKind::Bool, FieldValue::Bool(_))
                | (FieldKind::Json, FieldValue::Json(_))
        )
    }

    /// Encode a value of this kind to its wire text.
    fn encode(self, name: &str, value: &FieldValue) -> Result<String> {
        if !self.matches(value) {
            return Err(CorralError::InvalidArgument(format!(
                "field '{name}' expects a {} value",
                self.name()
            )));
        }
        Ok(match value {
            FieldValue::Str(s) => s.clone(),
            FieldValue::Int(n) => n.to_string(),
            FieldValue::Bool(b) => b.to_string(),
            FieldValue::Json(v) => serde_json::to_string(v)?,
        })
    }

    /// Decode wire text into a value of this kind.
    fn decode(self, name: &str, text: &str) -> Result<FieldValue> {
        match self {
            FieldKind::Str => Ok(FieldValue::Str(text.to_string())),
            FieldKind::Int => text.parse::<i64>().map(FieldValue::Int).map_err(|_| {
                CorralError::Protocol(format!("field '{name}' is not a decimal integer: {text:?}"))
            }),
            FieldKind::Bool => match text {
                "true" => Ok(FieldValue::Bool(true)),
                "false" => Ok(FieldValue::Bool(false)),
                _ => Err(CorralError::Protocol(format!(
                    "field '{name}' is not a boolean: {text:?}"
                ))),
            },
            FieldKind::Json => serde_json::from_str(text).map(FieldValue::Json).map_err(|e| {
                CorralError::Protocol(format!("field '{name}' is not valid JSON: {e}"))
            }),
        }
    }
}

/// An ordered map of field names to typed values.
///
/// Used both for the arguments passed to `submit` and for the decoded
/// response payload handed back to the caller.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldValues {
    inner: BTreeMap<String, FieldValue>,
}

impl FieldValues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<FieldValue>) {
        self.inner.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.inner.get(name)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        match self.inner.get(name) {
            Some(FieldValue::Str(s)) => Some(s),
            _ => None,
        }
    }

    pub fn get_int(&self, name: &str) -> Option<i64> {
        match self.inner.get(name) {
            Some(FieldValue::Int(n)) => Some(*n),
            _ => None,
        }
    }

    pub fn get_bool(&self, name: &str) -> Option<bool> {
        match self.inner.get(name) {
            Some(FieldValue::Bool(b)) => Some(*b),
            _ => None,
        }
    }

    pub fn get_json(&self, name: &str) -> Option<&serde_json::Value> {
        match self.inner.get(name) {
            Some(FieldValue::Json(v)) => Some(v),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.inner.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// Validate a caller's arguments against a command's schema without
/// encoding anything.
///
/// # Errors
///
/// Returns `InvalidArgument` if a declared field is missing, a value has
/// the wrong type, or an undeclared field is present.
pub fn check_args(command: &Command, values: &FieldValues) -> Result<()> {
    for field in command.args {
        match values.get(field.name) {
            None => {
                return Err(CorralError::InvalidArgument(format!(
                    "command '{}' requires field '{}'",
                    command.name, field.name
                )));
            }
            Some(value) => {
                if !field.kind.matches(value) {
                    return Err(CorralError::InvalidArgument(format!(
                        "command '{}' field '{}' expects a {} value",
                        command.name,
                        field.name,
                        field.kind.name()
                    )));
                }
            }
        }
    }
    for (name, _) in values.iter() {
        if !command.args.iter().any(|f| f.name == name) {
            return Err(CorralError::InvalidArgument(format!(
                "command '{}' has no field '{}'",
                command.name, name
            )));
        }
    }
    Ok(())
}

/// Build a request box: `_command`, optional `_ask`, then the declared
/// argument fields in schema order.
pub fn request_box(command: &Command, values: &FieldValues, ask: Option<u64>) -> Result<BoxFields> {
    check_args(command, values)?;
    let mut fields = BoxFields::with_capacity(command.args.len() + 2);
    fields.push((KEY_COMMAND.to_string(), command.name.to_string()));
    if let Some(id) = ask {
        fields.push((KEY_ASK.to_string(), id.to_string()));
    }
    for field in command.args {
        // presence checked above
        let value = values.get(field.name).expect("checked argument");
        fields.push((field.name.to_string(), field.kind.encode(field.name, value)?));
    }
    Ok(fields)
}

/// Build a successful response box for correlation id `ask`.
pub fn answer_box(ask: &str, command: &Command, values: &FieldValues) -> Result<BoxFields> {
    let mut fields = BoxFields::with_capacity(command.response.len() + 1);
    fields.push((KEY_ANSWER.to_string(), ask.to_string()));
    for field in command.response {
        let value = values.get(field.name).ok_or_else(|| {
            CorralError::InvalidArgument(format!(
                "response for '{}' is missing field '{}'",
                command.name, field.name
            ))
        })?;
        fields.push((field.name.to_string(), field.kind.encode(field.name, value)?));
    }
    Ok(fields)
}

/// Build a failed response box for correlation id `ask`.
pub fn error_box(ask: &str, kind: &str, message: &str) -> BoxFields {
    vec![
        (KEY_ERROR.to_string(), ask.to_string()),
        (KEY_ERROR_KIND.to_string(), kind.to_string()),
        (KEY_ERROR_MSG.to_string(), message.to_string()),
    ]
}

/// Decode the declared fields out of a box, ignoring reserved (`_`-prefixed)
/// and undeclared keys.
///
/// # Errors
///
/// Returns `Protocol` if a declared field is absent or its value does not
/// decode as the declared kind.
pub fn decode_fields(declared: &[Field], raw: &BoxFields) -> Result<FieldValues> {
    let mut values = FieldValues::new();
    for field in declared {
        let text = lookup(raw, field.name).ok_or_else(|| {
            CorralError::Protocol(format!("box is missing field '{}'", field.name))
        })?;
        values.insert(field.name, field.kind.decode(field.name, text)?);
    }
    Ok(values)
}

/// Find the first value for `key` in a decoded box.
pub fn lookup<'a>(fields: &'a BoxFields, key: &str) -> Option<&'a str> {
    fields
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}
