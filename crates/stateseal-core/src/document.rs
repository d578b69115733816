//! Walking state documents and converting scalar leaves.
//!
//! A leaf is any string, number or boolean. `null` and empty containers are
//! not leaves and pass through untouched. Each leaf is addressed by the
//! object keys leading to it (array indices are skipped); that path is bound
//! into the leaf ciphertext as additional data.

use serde_json::{Map, Number, Value};

use crate::crypto::ValueType;
use crate::error::TransformError;

/// Top-level key holding the envelope metadata.
pub const METADATA_KEY: &str = "sops";

/// Keys Terraform reads without decrypting the state.
pub const STATE_EXEMPT_FIELDS: [&str; 4] = ["version", "terraform_version", "serial", "lineage"];

/// Object keys whose subtrees are stored in plaintext.
///
/// The set is persisted in the envelope as an anchored alternation
/// (`^(a|b)$`) and parsed back from that form on decryption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExemptFields {
    names: Vec<String>,
}

impl ExemptFields {
    /// The fields exempted for Terraform state documents.
    #[must_use]
    pub fn state_defaults() -> Self {
        Self::new(STATE_EXEMPT_FIELDS)
    }

    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
        }
    }

    /// Whether `key` names an exempt subtree.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.names.iter().any(|n| n == key)
    }

    /// Render as the pattern stored in the envelope.
    #[must_use]
    pub fn to_pattern(&self) -> String {
        format!("^({})$", self.names.join("|"))
    }

    /// Parse a pattern produced by [`to_pattern`](Self::to_pattern).
    ///
    /// Only anchored alternations of literal key names are accepted; this is
    /// the only form ever written.
    ///
    /// # Errors
    ///
    /// Returns [`TransformError::MalformedEnvelope`] for any other pattern.
    pub fn from_pattern(pattern: &str) -> Result<Self, TransformError> {
        let malformed = || TransformError::MalformedEnvelope {
            reason: format!("unsupported unencrypted field pattern '{pattern}'"),
        };

        let body = pattern
            .strip_prefix('^')
            .and_then(|p| p.strip_suffix('$'))
            .ok_or_else(malformed)?;
        let body = body
            .strip_prefix('(')
            .and_then(|p| p.strip_suffix(')'))
            .unwrap_or(body);

        let names: Vec<&str> = body.split('|').collect();
        let literal = |name: &&str| {
            !name.is_empty()
                && name
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        };
        if !names.iter().all(literal) {
            return Err(malformed());
        }
        Ok(Self::new(names))
    }
}

/// Additional data binding a leaf to its position: path segments joined and
/// terminated by `:`.
#[must_use]
pub fn additional_data(path: &[String]) -> String {
    let mut aad = String::new();
    for segment in path {
        aad.push_str(segment);
        aad.push(':');
    }
    aad
}

/// Plaintext form and type of a scalar leaf, or `None` for non-leaves.
///
/// Booleans render as `True`/`False`. Integers that fit `i64`/`u64` are
/// `int`; every other number is `float`.
#[must_use]
pub fn leaf_plaintext(value: &Value) -> Option<(String, ValueType)> {
    match value {
        Value::String(s) => Some((s.clone(), ValueType::Str)),
        Value::Bool(true) => Some(("True".to_owned(), ValueType::Bool)),
        Value::Bool(false) => Some(("False".to_owned(), ValueType::Bool)),
        Value::Number(n) if n.is_i64() || n.is_u64() => Some((n.to_string(), ValueType::Int)),
        Value::Number(n) => Some((n.to_string(), ValueType::Float)),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

/// Restore a leaf from its plaintext form.
///
/// # Errors
///
/// Returns a description of the problem if `text` does not parse as `kind`.
pub fn leaf_from_plaintext(text: &str, kind: ValueType) -> Result<Value, String> {
    match kind {
        ValueType::Str => Ok(Value::String(text.to_owned())),
        ValueType::Bool => match text {
            "True" => Ok(Value::Bool(true)),
            "False" => Ok(Value::Bool(false)),
            other => Err(format!("'{other}' is not a boolean")),
        },
        ValueType::Int => text
            .parse::<i64>()
            .map(Value::from)
            .or_else(|_| text.parse::<u64>().map(Value::from))
            .map_err(|e| format!("'{text}' is not an integer: {e}")),
        ValueType::Float => text
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number)
            .ok_or_else(|| format!("'{text}' is not a finite number")),
    }
}

/// Visit every leaf below `map` in document order.
///
/// The callback receives the leaf, its key path, and whether an exempt key
/// appears anywhere on that path.
///
/// # Errors
///
/// Stops at and returns the first error from `visit`.
pub fn visit_leaves<F>(
    map: &mut Map<String, Value>,
    exempt: &ExemptFields,
    visit: &mut F,
) -> Result<(), TransformError>
where
    F: FnMut(&mut Value, &[String], bool) -> Result<(), TransformError>,
{
    let mut path = Vec::new();
    walk_object(map, exempt, &mut path, false, visit)
}

fn walk_object<F>(
    map: &mut Map<String, Value>,
    exempt: &ExemptFields,
    path: &mut Vec<String>,
    inside_exempt: bool,
    visit: &mut F,
) -> Result<(), TransformError>
where
    F: FnMut(&mut Value, &[String], bool) -> Result<(), TransformError>,
{
    for (key, value) in map.iter_mut() {
        let skip = inside_exempt || exempt.contains(key);
        path.push(key.clone());
        walk_value(value, exempt, path, skip, visit)?;
        path.pop();
    }
    Ok(())
}

fn walk_value<F>(
    value: &mut Value,
    exempt: &ExemptFields,
    path: &mut Vec<String>,
    inside_exempt: bool,
    visit: &mut F,
) -> Result<(), TransformError>
where
    F: FnMut(&mut Value, &[String], bool) -> Result<(), TransformError>,
{
    match value {
        Value::Object(map) => walk_object(map, exempt, path, inside_exempt, visit),
        Value::Array(items) => {
            for item in items {
                walk_value(item, exempt, path, inside_exempt, visit)?;
            }
            Ok(())
        }
        Value::Null => Ok(()),
        leaf => visit(leaf, path.as_slice(), inside_exempt),
    }
}
