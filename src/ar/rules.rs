//! Declarative field validation.
//!
//! Models attach a rule table ([`FieldRule`]) at definition time; [`validate`]
//! evaluates it over the serialized field map. Every rule except `Required`
//! skips missing and null values.

use crate::error::{DbError, DbResult};
use regex::Regex;
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::sync::LazyLock;

static EMAIL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("email pattern is valid")
});

/// JSON shape a field must have.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Int,
    /// Any number, integers included
    Float,
    String,
    Bool,
    Array,
    Object,
}

impl Kind {
    fn matches(self, value: &JsonValue) -> bool {
        match self {
            Self::Int => value.is_i64() || value.is_u64(),
            Self::Float => value.is_number(),
            Self::String => value.is_string(),
            Self::Bool => value.is_boolean(),
            Self::Array => value.is_array(),
            Self::Object => value.is_object(),
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Int => "an integer",
            Self::Float => "a number",
            Self::String => "a string",
            Self::Bool => "a boolean",
            Self::Array => "an array",
            Self::Object => "an object",
        }
    }
}

#[derive(Debug, Clone)]
pub enum Rule {
    /// Present, not null, and not an empty string.
    Required,
    Type(Kind),
    /// Maximum length in characters (strings) or elements (arrays).
    MaxLength(usize),
    MinLength(usize),
    /// Inclusive numeric range.
    Range { min: f64, max: f64 },
    Pattern(Regex),
    Email,
    /// Value must equal one of these.
    In(Vec<JsonValue>),
}

/// One rule attached to one field, with an optional custom message.
#[derive(Debug, Clone)]
pub struct FieldRule {
    pub field: String,
    pub rule: Rule,
    pub message: Option<String>,
}

impl FieldRule {
    pub fn new(field: impl Into<String>, rule: Rule) -> Self {
        Self {
            field: field.into(),
            rule,
            message: None,
        }
    }

    pub fn required(field: impl Into<String>) -> Self {
        Self::new(field, Rule::Required)
    }

    pub fn kind(field: impl Into<String>, kind: Kind) -> Self {
        Self::new(field, Rule::Type(kind))
    }

    pub fn max_length(field: impl Into<String>, max: usize) -> Self {
        Self::new(field, Rule::MaxLength(max))
    }

    pub fn min_length(field: impl Into<String>, min: usize) -> Self {
        Self::new(field, Rule::MinLength(min))
    }

    pub fn range(field: impl Into<String>, min: f64, max: f64) -> Self {
        Self::new(field, Rule::Range { min, max })
    }

    pub fn email(field: impl Into<String>) -> Self {
        Self::new(field, Rule::Email)
    }

    pub fn one_of<V: Into<JsonValue>>(
        field: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        Self::new(field, Rule::In(values.into_iter().map(Into::into).collect()))
    }

    /// Regex rule; an invalid pattern is an error at definition time.
    pub fn pattern(field: impl Into<String>, pattern: &str) -> DbResult<Self> {
        let regex = Regex::new(pattern)
            .map_err(|e| DbError::invalid_input(format!("Invalid pattern '{}': {}", pattern, e)))?;
        Ok(Self::new(field, Rule::Pattern(regex)))
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// `None` when the value passes.
    fn check(&self, value: Option<&JsonValue>) -> Option<String> {
        let value = match (&self.rule, value) {
            (Rule::Required, None | Some(JsonValue::Null)) => {
                return Some(self.fail(format!("{} is required", self.field)));
            }
            (Rule::Required, Some(JsonValue::String(s))) if s.trim().is_empty() => {
                return Some(self.fail(format!("{} is required", self.field)));
            }
            (_, None | Some(JsonValue::Null)) => return None,
            (_, Some(value)) => value,
        };

        let passed = match &self.rule {
            Rule::Required => true,
            Rule::Type(kind) => kind.matches(value),
            Rule::MaxLength(max) => length(value).is_none_or(|len| len <= *max),
            Rule::MinLength(min) => length(value).is_none_or(|len| len >= *min),
            Rule::Range { min, max } => numeric(value).is_some_and(|n| n >= *min && n <= *max),
            Rule::Pattern(regex) => value.as_str().is_some_and(|s| regex.is_match(s)),
            Rule::Email => value.as_str().is_some_and(|s| EMAIL.is_match(s)),
            Rule::In(allowed) => allowed.contains(value),
        };
        if passed {
            return None;
        }

        let default = match &self.rule {
            Rule::Required => format!("{} is required", self.field),
            Rule::Type(kind) => format!("{} must be {}", self.field, kind.as_str()),
            Rule::MaxLength(max) => format!("{} must be at most {} long", self.field, max),
            Rule::MinLength(min) => format!("{} must be at least {} long", self.field, min),
            Rule::Range { min, max } => {
                format!("{} must be between {} and {}", self.field, min, max)
            }
            Rule::Pattern(regex) => format!("{} must match {}", self.field, regex.as_str()),
            Rule::Email => format!("{} must be a valid email address", self.field),
            Rule::In(_) => format!("{} has an unsupported value", self.field),
        };
        Some(self.fail(default))
    }

    fn fail(&self, default: String) -> String {
        self.message.clone().unwrap_or(default)
    }
}

fn length(value: &JsonValue) -> Option<usize> {
    match value {
        JsonValue::String(s) => Some(s.chars().count()),
        JsonValue::Array(items) => Some(items.len()),
        _ => None,
    }
}

fn numeric(value: &JsonValue) -> Option<f64> {
    match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// A validation or save failure recorded on a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    /// `None` for failures not tied to one field, such as a failed write.
    pub field: Option<String>,
    pub message: String,
}

impl FieldError {
    pub fn field(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: Some(field.into()),
            message: message.into(),
        }
    }

    pub fn general(message: impl Into<String>) -> Self {
        Self {
            field: None,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for FieldError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.field {
            Some(field) => write!(f, "{}: {}", field, self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// Run every rule; all failures are returned, in rule order.
pub fn validate(rules: &[FieldRule], fields: &serde_json::Map<String, JsonValue>) -> Vec<FieldError> {
    rules
        .iter()
        .filter_map(|rule| {
            rule.check(fields.get(&rule.field))
                .map(|message| FieldError::field(rule.field.clone(), message))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(value: JsonValue) -> serde_json::Map<String, JsonValue> {
        match value {
            JsonValue::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_required() {
        let rules = vec![FieldRule::required("name")];
        assert_eq!(validate(&rules, &fields(json!({"name": "a"}))), vec![]);
        assert_eq!(validate(&rules, &fields(json!({"name": "  "}))).len(), 1);
        assert_eq!(validate(&rules, &fields(json!({"name": null}))).len(), 1);
        assert_eq!(validate(&rules, &fields(json!({}))).len(), 1);
    }

    #[test]
    fn test_optional_rules_skip_null() {
        let rules = vec![
            FieldRule::max_length("name", 3),
            FieldRule::email("email"),
            FieldRule::range("age", 0.0, 150.0),
        ];
        assert!(validate(&rules, &fields(json!({"name": null}))).is_empty());
    }

    #[test]
    fn test_length_counts_characters() {
        let rules = vec![FieldRule::max_length("name", 3), FieldRule::min_length("name", 2)];
        assert!(validate(&rules, &fields(json!({"name": "äöü"}))).is_empty());
        assert_eq!(validate(&rules, &fields(json!({"name": "abcd"}))).len(), 1);
        assert_eq!(validate(&rules, &fields(json!({"name": "a"}))).len(), 1);
    }

    #[test]
    fn test_type_range_and_in() {
        let rules = vec![
            FieldRule::kind("age", Kind::Int),
            FieldRule::range("age", 0.0, 150.0),
            FieldRule::one_of("status", [0, 1, 2]),
        ];
        assert!(validate(&rules, &fields(json!({"age": 30, "status": 1}))).is_empty());

        let errors = validate(&rules, &fields(json!({"age": 200.5, "status": 9})));
        assert_eq!(errors.len(), 3);
        assert_eq!(errors[0].field.as_deref(), Some("age"));
    }

    #[test]
    fn test_email_and_pattern() {
        let rules = vec![
            FieldRule::email("email"),
            FieldRule::pattern("code", r"^[A-Z]{3}$").unwrap(),
        ];
        assert!(validate(&rules, &fields(json!({"email": "a@b.io", "code": "ABC"}))).is_empty());
        assert_eq!(
            validate(&rules, &fields(json!({"email": "nope", "code": "abc"}))).len(),
            2
        );
        assert!(FieldRule::pattern("code", "(").is_err());
    }

    #[test]
    fn test_custom_message() {
        let rules = vec![FieldRule::required("name").message("Please enter a name")];
        let errors = validate(&rules, &fields(json!({})));
        assert_eq!(errors[0].message, "Please enter a name");
        assert_eq!(errors[0].to_string(), "name: Please enter a name");
    }
}
