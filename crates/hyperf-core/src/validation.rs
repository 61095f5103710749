//! Schema-driven payload validation.
//!
//! A [`Schema`] is plain data: an ordered list of [`FieldSpec`]s. [`validate`]
//! checks a raw JSON payload against it and either returns a [`Payload`] holding
//! only the declared, coerced fields, or a [`FieldErrors`] mapping with every
//! violation found. All fields are checked; nothing short-circuits.

use std::sync::LazyLock;

use regex::Regex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::errors::{FieldErrors, PAYLOAD_KEY};

static EMAIL_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").ok());

/// How a raw value is coerced before constraints run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    String,
    Integer,
    Email,
}

impl FieldKind {
    fn is_textual(self) -> bool {
        matches!(self, Self::String | Self::Email)
    }
}

/// Constraints applied after a value has been coerced successfully.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Constraints {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_length: Option<usize>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub not_empty: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<i64>,
}

/// One field of a schema.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FieldSpec {
    pub name: String,
    pub required: bool,
    pub kind: FieldKind,
    pub constraints: Constraints,
}

impl FieldSpec {
    fn of(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            required: false,
            kind,
            constraints: Constraints::default(),
        }
    }

    pub fn string(name: impl Into<String>) -> Self {
        Self::of(name, FieldKind::String)
    }

    pub fn integer(name: impl Into<String>) -> Self {
        Self::of(name, FieldKind::Integer)
    }

    pub fn email(name: impl Into<String>) -> Self {
        Self::of(name, FieldKind::Email)
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn min_length(mut self, n: usize) -> Self {
        self.constraints.min_length = Some(n);
        self
    }

    pub fn not_empty(mut self) -> Self {
        self.constraints.not_empty = true;
        self
    }

    pub fn min(mut self, n: i64) -> Self {
        self.constraints.min = Some(n);
        self
    }

    pub fn max(mut self, n: i64) -> Self {
        self.constraints.max = Some(n);
        self
    }

    /// Inclusive bounds.
    pub fn range(self, min: i64, max: i64) -> Self {
        self.min(min).max(max)
    }
}

/// Problems with a schema definition itself, caught at registration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchemaError {
    #[error("field `{0}` is declared more than once")]
    DuplicateField(String),
    #[error("field `{field}` has min {min} greater than max {max}")]
    InvertedRange { field: String, min: i64, max: i64 },
    #[error("field `{field}` uses `{constraint}`, which does not apply to {kind:?} fields")]
    ConstraintMismatch {
        field: String,
        constraint: &'static str,
        kind: FieldKind,
    },
}

/// Ordered description of the fields an event payload carries.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Schema {
    fields: Vec<FieldSpec>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, spec: FieldSpec) -> Self {
        self.fields.push(spec);
        self
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Reject schemas that could never be satisfied or are ambiguous.
    pub fn check(&self) -> Result<(), SchemaError> {
        for (i, spec) in self.fields.iter().enumerate() {
            if self.fields[..i].iter().any(|f| f.name == spec.name) {
                return Err(SchemaError::DuplicateField(spec.name.clone()));
            }
            let c = &spec.constraints;
            if let (Some(min), Some(max)) = (c.min, c.max) {
                if min > max {
                    return Err(SchemaError::InvertedRange {
                        field: spec.name.clone(),
                        min,
                        max,
                    });
                }
            }
            let mismatch = if spec.kind.is_textual() {
                (c.min.is_some() || c.max.is_some()).then_some("min/max")
            } else if c.min_length.is_some() {
                Some("minLength")
            } else if c.not_empty {
                Some("notEmpty")
            } else {
                None
            };
            if let Some(constraint) = mismatch {
                return Err(SchemaError::ConstraintMismatch {
                    field: spec.name.clone(),
                    constraint,
                    kind: spec.kind,
                });
            }
        }
        Ok(())
    }
}

/// A validated payload: only schema fields, already coerced to their kinds.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Payload(Map<String, Value>);

impl Payload {
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.0.get(field).and_then(Value::as_str)
    }

    pub fn get_i64(&self, field: &str) -> Option<i64> {
        self.0.get(field).and_then(Value::as_i64)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    /// Deserialize into a typed DTO.
    ///
    /// The payload already matches its schema, so a failure here means the
    /// DTO type and the schema disagree; it is reported under `_payload`.
    pub fn into_dto<T: DeserializeOwned>(self) -> Result<T, FieldErrors> {
        serde_json::from_value(Value::Object(self.0))
            .map_err(|e| FieldErrors::single(PAYLOAD_KEY, format!("payload does not match DTO: {e}")))
    }
}

/// Validate `raw` against `schema`.
///
/// `null` is read as an empty object. Keys the schema does not declare are
/// dropped.
pub fn validate(schema: &Schema, raw: &Value) -> Result<Payload, FieldErrors> {
    let empty = Map::new();
    let input = match raw {
        Value::Object(map) => map,
        Value::Null => &empty,
        _ => return Err(FieldErrors::single(PAYLOAD_KEY, "payload must be an object")),
    };

    let mut errors = FieldErrors::new();
    let mut output = Map::new();

    for spec in &schema.fields {
        let value = match input.get(&spec.name) {
            None | Some(Value::Null) => {
                if spec.required {
                    errors.push(&spec.name, format!("{} is required", spec.name));
                }
                continue;
            }
            Some(v) => v,
        };

        let Some(coerced) = coerce(spec, value, &mut errors) else {
            continue;
        };
        if check_constraints(spec, &coerced, &mut errors) {
            output.insert(spec.name.clone(), coerced);
        }
    }

    if errors.is_empty() {
        Ok(Payload(output))
    } else {
        Err(errors)
    }
}

fn coerce(spec: &FieldSpec, value: &Value, errors: &mut FieldErrors) -> Option<Value> {
    let name = &spec.name;
    match spec.kind {
        FieldKind::String => match value.as_str() {
            Some(s) => Some(Value::String(s.to_owned())),
            None => {
                errors.push(name, format!("{name} must be a string"));
                None
            }
        },
        FieldKind::Integer => match parse_integer(value) {
            Some(n) => Some(Value::from(n)),
            None => {
                errors.push(name, format!("{name} must be an integer"));
                None
            }
        },
        FieldKind::Email => match value.as_str().filter(|s| is_email(s)) {
            Some(s) => Some(Value::String(s.to_owned())),
            None => {
                errors.push(name, format!("{name} must be a valid email"));
                None
            }
        },
    }
}

/// Returns true when every constraint holds.
fn check_constraints(spec: &FieldSpec, value: &Value, errors: &mut FieldErrors) -> bool {
    let name = &spec.name;
    let c = &spec.constraints;
    let before = errors.get(name).map_or(0, <[String]>::len);

    if let Some(s) = value.as_str() {
        if c.not_empty && s.trim().is_empty() {
            errors.push(name, format!("{name} should not be empty"));
        }
        if let Some(min_len) = c.min_length {
            if s.chars().count() < min_len {
                errors.push(name, format!("{name} must be at least {min_len} characters"));
            }
        }
    }

    if let Some(n) = value.as_i64() {
        match (c.min, c.max) {
            (Some(min), Some(max)) if n < min || n > max => {
                errors.push(name, format!("{name} must be between {min} and {max}"));
            }
            (Some(min), None) if n < min => {
                errors.push(name, format!("{name} must not be less than {min}"));
            }
            (None, Some(max)) if n > max => {
                errors.push(name, format!("{name} must not be greater than {max}"));
            }
            _ => {}
        }
    }

    errors.get(name).map_or(0, <[String]>::len) == before
}

fn parse_integer(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| {
            let f = n.as_f64()?;
            // i64::MAX as f64 rounds up to 2^63, so the upper bound is exclusive.
            (f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64).then(|| f as i64)
        }),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

fn is_email(s: &str) -> bool {
    EMAIL_RE.as_ref().is_some_and(|re| re.is_match(s))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn user_schema() -> Schema {
        Schema::new()
            .field(FieldSpec::string("username").required().min_length(3))
            .field(FieldSpec::email("email").required())
            .field(FieldSpec::integer("age").range(13, 120))
    }

    #[test]
    fn valid_payload_passes_and_drops_unknown_keys() {
        let payload = validate(
            &user_schema(),
            &json!({"username": "alice", "email": "a@b.io", "age": 30, "admin": true}),
        )
        .unwrap();

        assert_eq!(payload.get_str("username"), Some("alice"));
        assert_eq!(payload.get_str("email"), Some("a@b.io"));
        assert_eq!(payload.get_i64("age"), Some(30));
        assert!(payload.get("admin").is_none());
    }

    #[test]
    fn missing_required_fields_are_all_reported() {
        let errors = validate(&user_schema(), &json!({})).unwrap_err();
        assert_eq!(errors.get("username").unwrap(), &["username is required"]);
        assert_eq!(errors.get("email").unwrap(), &["email is required"]);
        assert!(!errors.contains("age"));
    }

    #[test]
    fn null_counts_as_absent() {
        let errors = validate(&user_schema(), &json!({"username": null, "email": "a@b.io", "age": null}))
            .unwrap_err();
        assert_eq!(errors.fields().collect::<Vec<_>>(), vec!["username"]);
    }

    #[test]
    fn errors_follow_schema_order() {
        let errors = validate(&user_schema(), &json!({"age": 500, "email": "nope", "username": "x"}))
            .unwrap_err();
        assert_eq!(
            errors.fields().collect::<Vec<_>>(),
            vec!["username", "email", "age"]
        );
    }

    #[test]
    fn short_username_rejected() {
        let errors = validate(&user_schema(), &json!({"username": "ab", "email": "a@b.io"})).unwrap_err();
        assert_eq!(
            errors.get("username").unwrap(),
            &["username must be at least 3 characters"]
        );
    }

    #[test]
    fn min_length_counts_characters_not_bytes() {
        let ok = validate(&user_schema(), &json!({"username": "äöü", "email": "a@b.io"}));
        assert!(ok.is_ok());
    }

    #[test]
    fn invalid_email_rejected() {
        for bad in ["plain", "a@b", "a b@c.d", "@c.d", ""] {
            let errors = validate(&user_schema(), &json!({"username": "alice", "email": bad})).unwrap_err();
            assert_eq!(
                errors.get("email").unwrap(),
                &["email must be a valid email"],
                "input: {bad:?}"
            );
        }
    }

    #[test]
    fn non_string_email_rejected_as_email() {
        let errors = validate(&user_schema(), &json!({"username": "alice", "email": 42})).unwrap_err();
        assert_eq!(errors.get("email").unwrap(), &["email must be a valid email"]);
    }

    #[test]
    fn age_bounds_are_inclusive() {
        for (age, ok) in [(12, false), (13, true), (120, true), (121, false)] {
            let result = validate(
                &user_schema(),
                &json!({"username": "alice", "email": "a@b.io", "age": age}),
            );
            assert_eq!(result.is_ok(), ok, "age {age}");
            if let Err(errors) = result {
                assert_eq!(errors.get("age").unwrap(), &["age must be between 13 and 120"]);
            }
        }
    }

    #[test]
    fn integer_coercion_from_numeric_strings_and_whole_floats() {
        let schema = Schema::new().field(FieldSpec::integer("n").required());
        assert_eq!(validate(&schema, &json!({"n": " 42 "})).unwrap().get_i64("n"), Some(42));
        assert_eq!(validate(&schema, &json!({"n": 7.0})).unwrap().get_i64("n"), Some(7));
        assert_eq!(validate(&schema, &json!({"n": "-3"})).unwrap().get_i64("n"), Some(-3));
    }

    #[test]
    fn non_integers_rejected() {
        let schema = Schema::new().field(FieldSpec::integer("n").required().range(0, 10));
        for bad in [json!("abc"), json!(1.5), json!(true), json!([1]), json!({"x": 1})] {
            let errors = validate(&schema, &json!({ "n": bad })).unwrap_err();
            assert_eq!(errors.get("n").unwrap(), &["n must be an integer"], "input: {bad}");
        }
    }

    #[test]
    fn range_not_checked_when_coercion_fails() {
        let schema = Schema::new().field(FieldSpec::integer("n").range(0, 10));
        let errors = validate(&schema, &json!({"n": "big"})).unwrap_err();
        assert_eq!(errors.get("n").unwrap().len(), 1);
    }

    #[test]
    fn one_sided_bounds() {
        let schema = Schema::new()
            .field(FieldSpec::integer("lo").min(5))
            .field(FieldSpec::integer("hi").max(5));
        let errors = validate(&schema, &json!({"lo": 4, "hi": 6})).unwrap_err();
        assert_eq!(errors.get("lo").unwrap(), &["lo must not be less than 5"]);
        assert_eq!(errors.get("hi").unwrap(), &["hi must not be greater than 5"]);
    }

    #[test]
    fn field_accumulates_multiple_messages() {
        let schema = Schema::new().field(FieldSpec::string("message").required().not_empty().min_length(2));
        let errors = validate(&schema, &json!({"message": ""})).unwrap_err();
        assert_eq!(
            errors.get("message").unwrap(),
            &["message should not be empty", "message must be at least 2 characters"]
        );
    }

    #[test]
    fn whitespace_only_is_empty() {
        let schema = Schema::new().field(FieldSpec::string("message").required().not_empty());
        assert!(validate(&schema, &json!({"message": "   "})).is_err());
        assert!(validate(&schema, &json!({"message": " hi "})).is_ok());
    }

    #[test]
    fn string_kind_rejects_numbers() {
        let schema = Schema::new().field(FieldSpec::string("s").required());
        let errors = validate(&schema, &json!({"s": 5})).unwrap_err();
        assert_eq!(errors.get("s").unwrap(), &["s must be a string"]);
    }

    #[test]
    fn null_payload_is_empty_object() {
        assert!(validate(&Schema::new(), &Value::Null).unwrap().as_map().is_empty());
        let errors = validate(&user_schema(), &Value::Null).unwrap_err();
        assert!(errors.contains("username"));
    }

    #[test]
    fn non_object_payload_rejected() {
        let errors = validate(&Schema::new(), &json!([1, 2])).unwrap_err();
        assert_eq!(errors.get(PAYLOAD_KEY).unwrap(), &["payload must be an object"]);
    }

    #[test]
    fn optional_field_absent_is_not_written() {
        let payload = validate(&user_schema(), &json!({"username": "alice", "email": "a@b.io"})).unwrap();
        assert!(payload.get("age").is_none());
    }

    #[test]
    fn into_dto_deserializes_typed_struct() {
        #[derive(serde::Deserialize)]
        struct Dto {
            username: String,
            age: Option<i64>,
        }
        let payload = validate(&user_schema(), &json!({"username": "alice", "email": "a@b.io", "age": "44"}))
            .unwrap();
        let dto: Dto = payload.into_dto().unwrap();
        assert_eq!(dto.username, "alice");
        assert_eq!(dto.age, Some(44));
    }

    #[test]
    fn into_dto_mismatch_reports_payload_error() {
        #[derive(Debug, serde::Deserialize)]
        #[allow(dead_code)]
        struct Dto {
            missing: String,
        }
        let errors = Payload::default().into_dto::<Dto>().unwrap_err();
        assert!(errors.contains(PAYLOAD_KEY));
    }

    #[test]
    fn check_rejects_duplicate_fields() {
        let schema = Schema::new()
            .field(FieldSpec::string("a"))
            .field(FieldSpec::integer("a"));
        assert_eq!(schema.check(), Err(SchemaError::DuplicateField("a".into())));
    }

    #[test]
    fn check_rejects_inverted_range() {
        let schema = Schema::new().field(FieldSpec::integer("n").range(10, 1));
        assert!(matches!(schema.check(), Err(SchemaError::InvertedRange { .. })));
    }

    #[test]
    fn check_rejects_mismatched_constraints() {
        let s = Schema::new().field(FieldSpec::string("s").min(1));
        assert!(matches!(s.check(), Err(SchemaError::ConstraintMismatch { .. })));
        let n = Schema::new().field(FieldSpec::integer("n").min_length(1));
        assert!(matches!(n.check(), Err(SchemaError::ConstraintMismatch { .. })));
        assert!(user_schema().check().is_ok());
    }

    #[test]
    fn validate_is_pure() {
        let schema = user_schema();
        let raw = json!({"username": "al", "email": "x"});
        assert_eq!(validate(&schema, &raw), validate(&schema, &raw));
    }
}
