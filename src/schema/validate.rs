//! Schema validation.
//!
//! The validator consumes `(schema, value)` and returns findings as plain
//! data. Callers decide what to do with them; nothing here panics or raises.
//! For nested schemas, each `item` element is validated independently and
//! findings carry the element's row index.

use chrono::{DateTime, NaiveDate};

use super::{FieldKind, FieldSpec, OutputShape, Schema};
use crate::prelude::*;

/// One step in the path to a finding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSeg {
    Field(String),
    Index(usize),
}

/// What a finding is about.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldErrorKind {
    MissingRequired,
    ExpectedString,
    ExpectedInteger,
    ExpectedNumber,
    ExpectedBoolean,
    ExpectedList,
    ExpectedObject,
    InvalidEnum { allowed: Vec<String> },
    InvalidDate,
    InvalidDateTime,
    UnexpectedField,
}

/// One validation finding.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldError {
    /// Where in the value tree the problem is.
    pub path: Vec<PathSeg>,

    /// For nested schemas, the 0-based index of the offending row.
    pub row: Option<usize>,

    /// What kind of problem.
    pub kind: FieldErrorKind,

    /// The offending value (null when missing).
    pub found: Value,
}

impl FieldError {
    /// The innermost field name, skipping the `item` wrapper.
    pub fn field_name(&self) -> Option<&str> {
        self.path.iter().rev().find_map(|seg| match seg {
            PathSeg::Field(name) if name != "item" => Some(name.as_str()),
            _ => None,
        })
    }

    /// Dotted path like `item[0].amount`.
    pub fn path_string(&self) -> String {
        let mut out = String::new();
        for seg in &self.path {
            match seg {
                PathSeg::Field(name) => {
                    if !out.is_empty() {
                        out.push('.');
                    }
                    out.push_str(name);
                }
                PathSeg::Index(idx) => {
                    out.push_str(&format!("[{idx}]"));
                }
            }
        }
        out
    }
}

/// Validate `value` against `schema`. An empty result means the value
/// conforms.
pub fn validate(schema: &Schema, value: &Value) -> Vec<FieldError> {
    let mut errors = Vec::new();
    match schema.output_shape() {
        OutputShape::Flat => {
            validate_record(schema.record_fields(), value, &mut Vec::new(), None, &mut errors);
        }
        OutputShape::Nested => {
            let path = vec![PathSeg::Field("item".to_string())];
            match value.get("item") {
                Some(Value::Array(rows)) => {
                    for (row_idx, row) in rows.iter().enumerate() {
                        let mut row_path = path.clone();
                        row_path.push(PathSeg::Index(row_idx));
                        validate_record(
                            schema.record_fields(),
                            row,
                            &mut row_path,
                            Some(row_idx),
                            &mut errors,
                        );
                    }
                }
                Some(other) => errors.push(FieldError {
                    path,
                    row: None,
                    kind: FieldErrorKind::ExpectedList,
                    found: other.clone(),
                }),
                None => errors.push(FieldError {
                    path,
                    row: None,
                    kind: FieldErrorKind::MissingRequired,
                    found: Value::Null,
                }),
            }
        }
    }
    errors
}

fn validate_record(
    fields: &[FieldSpec],
    value: &Value,
    path: &mut Vec<PathSeg>,
    row: Option<usize>,
    errors: &mut Vec<FieldError>,
) {
    let object = match value.as_object() {
        Some(object) => object,
        None => {
            errors.push(FieldError {
                path: path.clone(),
                row,
                kind: FieldErrorKind::ExpectedObject,
                found: value.clone(),
            });
            return;
        }
    };

    for field in fields {
        path.push(PathSeg::Field(field.name.clone()));
        match object.get(&field.name) {
            Some(field_value) => {
                validate_kind(&field.kind, field_value, path, row, errors);
            }
            None => {
                if field.required && !matches!(field.kind, FieldKind::Optional { .. }) {
                    errors.push(FieldError {
                        path: path.clone(),
                        row,
                        kind: FieldErrorKind::MissingRequired,
                        found: Value::Null,
                    });
                }
            }
        }
        path.pop();
    }

    // Anything outside the schema is a finding too; the provider was told
    // `additionalProperties: false`.
    for key in object.keys() {
        if !fields.iter().any(|f| &f.name == key) {
            let mut field_path = path.clone();
            field_path.push(PathSeg::Field(key.clone()));
            errors.push(FieldError {
                path: field_path,
                row,
                kind: FieldErrorKind::UnexpectedField,
                found: object[key].clone(),
            });
        }
    }
}

fn validate_kind(
    kind: &FieldKind,
    value: &Value,
    path: &mut Vec<PathSeg>,
    row: Option<usize>,
    errors: &mut Vec<FieldError>,
) {
    let fail = |kind: FieldErrorKind, errors: &mut Vec<FieldError>| {
        errors.push(FieldError {
            path: path.clone(),
            row,
            kind,
            found: value.clone(),
        });
    };

    match kind {
        FieldKind::String => {
            if !value.is_string() {
                fail(FieldErrorKind::ExpectedString, errors);
            }
        }
        FieldKind::Integer => {
            if !value.is_i64() && !value.is_u64() {
                fail(FieldErrorKind::ExpectedInteger, errors);
            }
        }
        FieldKind::Number => {
            if !value.is_number() {
                fail(FieldErrorKind::ExpectedNumber, errors);
            }
        }
        FieldKind::Boolean => {
            if !value.is_boolean() {
                fail(FieldErrorKind::ExpectedBoolean, errors);
            }
        }
        FieldKind::Date => match value.as_str() {
            Some(text) if NaiveDate::parse_from_str(text, "%Y-%m-%d").is_ok() => {}
            _ => fail(FieldErrorKind::InvalidDate, errors),
        },
        FieldKind::Datetime => match value.as_str() {
            Some(text) if DateTime::parse_from_rfc3339(text).is_ok() => {}
            _ => fail(FieldErrorKind::InvalidDateTime, errors),
        },
        FieldKind::Enum { values } => match value.as_str() {
            Some(text) if values.iter().any(|v| v == text) => {}
            _ => fail(
                FieldErrorKind::InvalidEnum {
                    allowed: values.clone(),
                },
                errors,
            ),
        },
        FieldKind::List { fields } => match value.as_array() {
            Some(rows) => {
                for (idx, row_value) in rows.iter().enumerate() {
                    path.push(PathSeg::Index(idx));
                    // Inside a top-level nested schema the caller already
                    // pinned the row; keep the outermost index otherwise.
                    let row = row.or(Some(idx));
                    validate_record(fields, row_value, path, row, errors);
                    path.pop();
                }
            }
            None => fail(FieldErrorKind::ExpectedList, errors),
        },
        FieldKind::Optional { inner } => {
            if !value.is_null() {
                validate_kind(inner, value, path, row, errors);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SchemaRegistry;

    fn registry() -> SchemaRegistry {
        SchemaRegistry::builtin()
    }

    #[test]
    fn conforming_flat_value_has_no_findings() {
        let schema = registry().get("invoice").unwrap();
        let value = json!({
            "vendor": "Acme",
            "number": "42",
            "amount": 100.0,
            "issued_on": "2025-03-01",
        });
        assert!(validate(&schema, &value).is_empty());
    }

    #[test]
    fn optional_fields_accept_null_and_absence() {
        let schema = registry().get("invoice").unwrap();
        let with_null = json!({"vendor": "Acme", "number": "42", "amount": 1, "issued_on": null});
        assert!(validate(&schema, &with_null).is_empty());
        let absent = json!({"vendor": "Acme", "number": "42", "amount": 1});
        assert!(validate(&schema, &absent).is_empty());
    }

    #[test]
    fn type_mismatches_are_reported_with_paths() {
        let schema = registry().get("invoice").unwrap();
        let value = json!({"vendor": 7, "amount": "ten"});
        let errors = validate(&schema, &value);
        let paths: Vec<String> = errors.iter().map(|e| e.path_string()).collect();
        assert!(paths.contains(&"vendor".to_string()));
        assert!(paths.contains(&"number".to_string())); // missing required
        assert!(paths.contains(&"amount".to_string()));
        assert!(errors
            .iter()
            .any(|e| e.kind == FieldErrorKind::MissingRequired));
    }

    #[test]
    fn nested_errors_carry_row_indexes() {
        let schema = registry().get("invoices").unwrap();
        let value = json!({
            "item": [
                {"vendor": "A", "number": "1", "amount": 10},
                {"vendor": "B", "number": "2", "amount": "bad"},
            ]
        });
        let errors = validate(&schema, &value);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].row, Some(1));
        assert_eq!(errors[0].path_string(), "item[1].amount");
        assert_eq!(errors[0].field_name(), Some("amount"));
    }

    #[test]
    fn nested_wrapper_must_hold_a_list() {
        let schema = registry().get("invoices").unwrap();
        let errors = validate(&schema, &json!({"item": "nope"}));
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].kind, FieldErrorKind::ExpectedList);
    }

    #[test]
    fn enum_and_unexpected_fields_are_flagged() {
        let schema = registry().get("meeting_notes").unwrap();
        let value = json!({
            "title": "Standup",
            "attendees": [{"name": "Ada"}],
            "sentiment": "grumpy",
            "extra": true,
        });
        let errors = validate(&schema, &value);
        assert!(errors
            .iter()
            .any(|e| matches!(e.kind, FieldErrorKind::InvalidEnum { .. })));
        assert!(errors
            .iter()
            .any(|e| e.kind == FieldErrorKind::UnexpectedField));
    }
}
