// Aglogen Assistant — Tool argument validation
//
// JSON Schema validation of LLM-supplied arguments. Every violation is
// reported, each rewritten into a message a user (or the model) can act on.

use jsonschema::error::ValidationErrorKind;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use super::Arguments;

#[derive(Error, Debug, Clone, PartialEq)]
#[error("{message}")]
pub struct ValidationError {
    pub message: String,
    pub errors: Vec<FieldError>,
}

/// One violation as reported to callers: `{"message": "..."}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldError {
    pub message: String,
}

/// Validate `arguments` against `schema`. Returns `(is_valid, messages)`.
/// A schema that does not compile is logged and treated as permissive.
pub fn validate_arguments(schema: &Value, arguments: &Arguments) -> (bool, Vec<String>) {
    let validator = match jsonschema::validator_for(schema) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(error = %e, "Invalid tool schema, skipping validation");
            return (true, Vec::new());
        }
    };

    let instance = Value::Object(arguments.clone());
    let errors: Vec<String> = validator
        .iter_errors(&instance)
        .map(|e| {
            let field = field_path(&e.instance_path.to_string());
            let keyword_value = schema.pointer(&e.schema_path.to_string());
            match &e.kind {
                ValidationErrorKind::Required { property } => {
                    let name = property.as_str().map(str::to_string).unwrap_or_else(|| property.to_string());
                    format!("Missing required parameter: {}", name)
                }
                ValidationErrorKind::Type { .. } => format!(
                    "Invalid type for '{}': expected {}",
                    field,
                    keyword_value.map(describe_type).unwrap_or_else(|| "a different type".into())
                ),
                ValidationErrorKind::Enum { .. } => format!(
                    "Invalid value for '{}': must be one of {}",
                    field,
                    keyword_value.map(Value::to_string).unwrap_or_default()
                ),
                ValidationErrorKind::Minimum { .. }
                | ValidationErrorKind::Maximum { .. }
                | ValidationErrorKind::ExclusiveMinimum { .. }
                | ValidationErrorKind::ExclusiveMaximum { .. } => {
                    format!("Value out of range for '{}': {}", field, e)
                }
                ValidationErrorKind::MinLength { .. } | ValidationErrorKind::MaxLength { .. } => {
                    format!("Invalid length for '{}': {}", field, e)
                }
                ValidationErrorKind::MinItems { .. } | ValidationErrorKind::MaxItems { .. } => {
                    format!("Invalid array length for '{}': {}", field, e)
                }
                _ => e.to_string(),
            }
        })
        .collect();

    (errors.is_empty(), errors)
}

/// Like [`validate_arguments`], but as a `Result`. The message joins all
/// violations with `"; "`.
pub fn validate_and_raise(schema: &Value, arguments: &Arguments) -> Result<(), ValidationError> {
    let (valid, errors) = validate_arguments(schema, arguments);
    if valid {
        return Ok(());
    }
    Err(ValidationError {
        message: errors.join("; "),
        errors: errors.into_iter().map(|message| FieldError { message }).collect(),
    })
}

pub fn format_validation_error(errors: &[String]) -> String {
    match errors {
        [single] => single.clone(),
        many => {
            let bullets: Vec<String> = many.iter().map(|e| format!("  - {}", e)).collect();
            format!("Multiple validation errors:\n{}", bullets.join("\n"))
        }
    }
}

/// `/a/0/b` becomes `a.0.b`; the root becomes `input`.
fn field_path(pointer: &str) -> String {
    let parts: Vec<String> = pointer
        .split('/')
        .filter(|p| !p.is_empty())
        .map(|p| p.replace("~1", "/").replace("~0", "~"))
        .collect();
    if parts.is_empty() {
        "input".to_string()
    } else {
        parts.join(".")
    }
}

fn describe_type(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(types) => types
            .iter()
            .map(|t| t.as_str().map(str::to_string).unwrap_or_else(|| t.to_string()))
            .collect::<Vec<_>>()
            .join(" or "),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn args(v: Value) -> Arguments {
        v.as_object().cloned().unwrap()
    }

    fn schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "name": {"type": "string", "minLength": 2},
                "count": {"type": "integer", "minimum": 1, "maximum": 10},
                "mode": {"type": "string", "enum": ["fast", "slow"]},
                "ids": {"type": "array", "items": {"type": "string"}, "minItems": 2}
            },
            "required": ["name"]
        })
    }

    #[test]
    fn test_valid() {
        let (ok, errors) = validate_arguments(&schema(), &args(json!({"name": "ab", "count": 3})));
        assert!(ok);
        assert!(errors.is_empty());
    }

    #[test]
    fn test_missing_required() {
        let (ok, errors) = validate_arguments(&schema(), &args(json!({})));
        assert!(!ok);
        assert_eq!(errors, vec!["Missing required parameter: name"]);
    }

    #[test]
    fn test_type_enum_and_range() {
        let (_, errors) = validate_arguments(&schema(), &args(json!({"name": 5})));
        assert_eq!(errors, vec!["Invalid type for 'name': expected string"]);

        let (_, errors) = validate_arguments(&schema(), &args(json!({"name": "ab", "mode": "warp"})));
        assert_eq!(errors.len(), 1);
        assert!(errors[0].starts_with("Invalid value for 'mode': must be one of"));
        assert!(errors[0].contains("fast"));

        let (_, errors) = validate_arguments(&schema(), &args(json!({"name": "ab", "count": 50})));
        assert!(errors[0].starts_with("Value out of range for 'count':"));

        let (_, errors) = validate_arguments(&schema(), &args(json!({"name": "a"})));
        assert!(errors[0].starts_with("Invalid length for 'name':"));

        let (_, errors) = validate_arguments(&schema(), &args(json!({"name": "ab", "ids": ["x"]})));
        assert!(errors[0].starts_with("Invalid array length for 'ids':"));
    }

    #[test]
    fn test_nested_path() {
        let (_, errors) = validate_arguments(&schema(), &args(json!({"name": "ab", "ids": ["x", 3]})));
        assert_eq!(errors, vec!["Invalid type for 'ids.1': expected string"]);
    }

    #[test]
    fn test_collects_every_violation() {
        let (ok, errors) = validate_arguments(&schema(), &args(json!({"count": 0, "mode": "warp"})));
        assert!(!ok);
        assert_eq!(errors.len(), 3);

        let err = validate_and_raise(&schema(), &args(json!({"count": 0, "mode": "warp"}))).unwrap_err();
        assert_eq!(err.errors.len(), 3);
        assert_eq!(err.message.matches("; ").count(), 2);
        assert_eq!(err.message.split("; ").next(), Some(err.errors[0].message.as_str()));
        assert!(serde_json::to_value(&err.errors[0]).unwrap()["message"].is_string());
    }

    #[test]
    fn test_format() {
        assert_eq!(format_validation_error(&["one".into()]), "one");
        assert_eq!(
            format_validation_error(&["a".into(), "b".into()]),
            "Multiple validation errors:\n  - a\n  - b"
        );
    }

    #[test]
    fn test_field_path() {
        assert_eq!(field_path(""), "input");
        assert_eq!(field_path("/a/0"), "a.0");
        assert_eq!(field_path("/a~1b"), "a/b");
    }
}
