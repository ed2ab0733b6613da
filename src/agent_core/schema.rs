//! Minimal JSON-Schema validation.
//!
//! Covers the subset tool providers use to describe parameters and the
//! decision schema uses to constrain the model: `type` (single or list),
//! `enum`, `const`, `properties`, `required`, `additionalProperties: false`,
//! `items`, `minLength`, `minimum` and `maximum`.
//!
//! [`ConstrainedChoice`] is the generic "value must be one of a live set"
//! check, used for the decision's action and its dynamic tool-name enum.

use std::borrow::Borrow;
use std::fmt;

use serde::Serialize;
use serde_json::Value;

// ─── Violations ──────────────────────────────────────────────────────────────

/// A single failed constraint, with the JSON path where it failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaViolation {
    /// Dotted path, e.g. `arguments.url`. Empty for the document root.
    pub path: String,
    pub message: String,
}

impl SchemaViolation {
    pub fn new(path: &str, message: impl Into<String>) -> Self {
        Self {
            path: path.to_string(),
            message: message.into(),
        }
    }
}

impl fmt::Display for SchemaViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path.is_empty() {
            write!(f, "{}", self.message)
        } else {
            write!(f, "`{}`: {}", self.path, self.message)
        }
    }
}

fn join(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{path}.{key}")
    }
}

// ─── Validation ──────────────────────────────────────────────────────────────

/// JSON type name of a value, as JSON-Schema spells it.
pub fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn matches_type(value: &Value, ty: &str) -> bool {
    match ty {
        "null" => value.is_null(),
        "boolean" => value.is_boolean(),
        "integer" => value.is_i64() || value.is_u64() || value.as_f64().is_some_and(|f| f.fract() == 0.0),
        "number" => value.is_number(),
        "string" => value.is_string(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        // Unknown type keywords are not ours to reject.
        _ => true,
    }
}

/// Validate `value` against `schema`, returning the first violation.
pub fn validate(value: &Value, schema: &Value) -> Result<(), SchemaViolation> {
    validate_at(value, schema, "")
}

fn validate_at(value: &Value, schema: &Value, path: &str) -> Result<(), SchemaViolation> {
    let Some(schema) = schema.as_object() else {
        // `true` / `{}` / anything non-object accepts everything.
        return Ok(());
    };

    if let Some(ty) = schema.get("type") {
        let allowed: Vec<&str> = match ty {
            Value::String(s) => vec![s.as_str()],
            Value::Array(list) => list.iter().filter_map(|t| t.as_str()).collect(),
            _ => Vec::new(),
        };
        if !allowed.is_empty() && !allowed.iter().any(|t| matches_type(value, t)) {
            return Err(SchemaViolation::new(
                path,
                format!(
                    "expected {}, got {}",
                    allowed.join(" or "),
                    json_type_name(value)
                ),
            ));
        }
    }

    if let Some(expected) = schema.get("const") {
        if value != expected {
            return Err(SchemaViolation::new(path, format!("must equal {expected}")));
        }
    }

    if let Some(options) = schema.get("enum").and_then(|e| e.as_array()) {
        if !options.contains(value) {
            let listed: Vec<String> = options.iter().map(|o| o.to_string()).collect();
            return Err(SchemaViolation::new(
                path,
                format!("{value} is not one of [{}]", listed.join(", ")),
            ));
        }
    }

    if let (Some(min), Some(s)) = (schema.get("minLength").and_then(|m| m.as_u64()), value.as_str()) {
        if (s.chars().count() as u64) < min {
            return Err(SchemaViolation::new(
                path,
                format!("must be at least {min} characters"),
            ));
        }
    }

    if let Some(n) = value.as_f64() {
        if let Some(min) = schema.get("minimum").and_then(|m| m.as_f64()) {
            if n < min {
                return Err(SchemaViolation::new(path, format!("must be >= {min}")));
            }
        }
        if let Some(max) = schema.get("maximum").and_then(|m| m.as_f64()) {
            if n > max {
                return Err(SchemaViolation::new(path, format!("must be <= {max}")));
            }
        }
    }

    if let Some(obj) = value.as_object() {
        let properties = schema.get("properties").and_then(|p| p.as_object());

        if let Some(required) = schema.get("required").and_then(|r| r.as_array()) {
            for name in required.iter().filter_map(|r| r.as_str()) {
                if !obj.contains_key(name) {
                    return Err(SchemaViolation::new(
                        path,
                        format!("missing required field `{name}`"),
                    ));
                }
            }
        }

        for (key, field) in obj {
            match properties.and_then(|p| p.get(key)) {
                Some(field_schema) => validate_at(field, field_schema, &join(path, key))?,
                None => {
                    if schema.get("additionalProperties") == Some(&Value::Bool(false)) {
                        return Err(SchemaViolation::new(
                            path,
                            format!("unexpected field `{key}`"),
                        ));
                    }
                }
            }
        }
    }

    if let (Some(items), Some(arr)) = (schema.get("items"), value.as_array()) {
        for (i, item) in arr.iter().enumerate() {
            validate_at(item, items, &join(path, &i.to_string()))?;
        }
    }

    Ok(())
}

// ─── ConstrainedChoice ───────────────────────────────────────────────────────

/// A value outside the allowed set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChoiceViolation {
    pub value: String,
    pub allowed: Vec<String>,
}

impl fmt::Display for ChoiceViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.allowed.is_empty() {
            write!(f, "'{}' is not allowed: no choices are available", self.value)
        } else {
            write!(
                f,
                "'{}' is not one of: {}",
                self.value,
                self.allowed.join(", ")
            )
        }
    }
}

/// A value constrained to a set fixed at construction time.
///
/// The set is built per request (e.g. from the live tool registry), not
/// compiled in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConstrainedChoice<T> {
    choices: Vec<T>,
}

impl<T> ConstrainedChoice<T>
where
    T: PartialEq + fmt::Display,
{
    pub fn new(choices: impl IntoIterator<Item = T>) -> Self {
        let mut unique: Vec<T> = Vec::new();
        for choice in choices {
            if !unique.contains(&choice) {
                unique.push(choice);
            }
        }
        Self { choices: unique }
    }

    pub fn choices(&self) -> &[T] {
        &self.choices
    }

    pub fn is_empty(&self) -> bool {
        self.choices.is_empty()
    }

    /// Return the matching choice, or a violation listing the allowed set.
    pub fn check<Q>(&self, value: &Q) -> Result<&T, ChoiceViolation>
    where
        T: Borrow<Q>,
        Q: PartialEq + fmt::Display + ?Sized,
    {
        self.choices
            .iter()
            .find(|c| <T as Borrow<Q>>::borrow(*c) == value)
            .ok_or_else(|| ChoiceViolation {
                value: value.to_string(),
                allowed: self.choices.iter().map(|c| c.to_string()).collect(),
            })
    }

    /// Whether `value` is in the set.
    pub fn contains<Q>(&self, value: &Q) -> bool
    where
        T: Borrow<Q>,
        Q: PartialEq + fmt::Display + ?Sized,
    {
        self.check(value).is_ok()
    }
}

impl<T> ConstrainedChoice<T>
where
    T: PartialEq + fmt::Display + Serialize,
{
    /// JSON-Schema fragment: `{"type": "string", "enum": [...]}`.
    pub fn to_schema(&self) -> Value {
        serde_json::json!({
            "type": "string",
            "enum": self.choices,
        })
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
