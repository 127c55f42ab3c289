//! The failure vocabulary shared by every stage of the pipeline, plus the
//! "humanizer" that turns raw validator output into something a reviewer can
//! act on without reading a stack trace.

use std::fmt;

use crate::{
    prelude::*,
    schema::validate::{FieldError, FieldErrorKind},
};

/// What went wrong, in terms a client can dispatch on.
///
/// Components never raise across their boundaries; they return a result
/// carrying one of these kinds and a displayable message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// No converter adapter accepts the file extension.
    Unsupported,
    /// The PDF is encrypted and we have no password.
    PasswordRequired,
    /// The routing decision was OCR, but OCR is disabled or unconfigured.
    OcrUnavailable,
    /// The provider answered, but the final payload failed schema validation.
    ExtractionFailed,
    /// A per-file or per-extraction deadline expired.
    Timeout,
    /// The client referenced a schema key we don't know.
    InvalidSchemaKey,
    /// Anything uncaught, coerced at a component boundary.
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Unsupported => "unsupported",
            ErrorKind::PasswordRequired => "password_required",
            ErrorKind::OcrUnavailable => "ocr_unavailable",
            ErrorKind::ExtractionFailed => "extraction_failed",
            ErrorKind::Timeout => "timeout",
            ErrorKind::InvalidSchemaKey => "invalid_schema_key",
            ErrorKind::Internal => "internal",
        };
        f.write_str(name)
    }
}

/// A single validator finding, reworded for display.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HumanizedFieldError {
    /// Title-cased field name, e.g. `Fair Value`.
    pub field: String,

    /// Simplified message, chosen by error kind.
    pub message: String,

    /// 1-based row number, for nested-schema errors.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row: Option<usize>,

    /// The raw finding, for anyone who wants the details.
    pub technical_details: Value,
}

/// A full validation failure, ready to put in a `result` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HumanizedError {
    /// One-line summary, e.g. "3 validation issue(s) found across 2 row(s)".
    pub summary: String,

    /// Per-field findings, truncated to the first [`MAX_DISPLAYED_ERRORS`].
    pub errors: Vec<HumanizedFieldError>,

    /// Total findings before truncation.
    pub total_count: usize,

    /// One tip per distinct kind of problem we saw.
    pub tips: Vec<String>,
}

/// How many findings we show before truncating.
const MAX_DISPLAYED_ERRORS: usize = 10;

/// Convert `snake_case` field names to Title Case.
pub fn humanize_field_name(field_name: &str) -> String {
    field_name
        .split('_')
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Reword a validator finding by kind. The technical message stays available
/// in `technical_details`.
fn simplify_message(error: &FieldError) -> String {
    match &error.kind {
        FieldErrorKind::MissingRequired => "This required field is missing".to_string(),
        FieldErrorKind::ExpectedString => match &error.found {
            Value::Null => "Expected text, but got no value".to_string(),
            other => format!("Expected text, but got: {}", type_name(other)),
        },
        FieldErrorKind::ExpectedNumber | FieldErrorKind::ExpectedInteger => {
            match &error.found {
                Value::Null => "Expected a number, but got no value".to_string(),
                other => format!("Expected a number, but got: {other}"),
            }
        }
        FieldErrorKind::ExpectedBoolean => {
            format!("Expected true/false, but got: {}", error.found)
        }
        FieldErrorKind::ExpectedList => {
            format!("Expected a list, but got: {}", type_name(&error.found))
        }
        FieldErrorKind::ExpectedObject => {
            format!("Expected a record, but got: {}", type_name(&error.found))
        }
        FieldErrorKind::InvalidEnum { allowed } => {
            format!("Invalid value. Allowed values: {}", allowed.join(", "))
        }
        FieldErrorKind::InvalidDate => {
            format!("Invalid date format: {} (expected YYYY-MM-DD)", error.found)
        }
        FieldErrorKind::InvalidDateTime => {
            format!("Invalid date/time format: {}", error.found)
        }
        FieldErrorKind::UnexpectedField => {
            "This field is not part of the schema".to_string()
        }
    }
}

/// Name a JSON value's type the way a user would say it.
fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "nothing",
        Value::Bool(_) => "a true/false value",
        Value::Number(_) => "a number",
        Value::String(_) => "text",
        Value::Array(_) => "a list",
        Value::Object(_) => "a record",
    }
}

/// One tip per distinct kind of problem.
fn helpful_tips(errors: &[FieldError]) -> Vec<String> {
    let mut tips = Vec::new();
    let has = |pred: fn(&FieldErrorKind) -> bool| errors.iter().any(|e| pred(&e.kind));

    if has(|k| {
        matches!(
            k,
            FieldErrorKind::ExpectedNumber
                | FieldErrorKind::ExpectedInteger
                | FieldErrorKind::ExpectedString
                | FieldErrorKind::ExpectedBoolean
        )
    }) {
        tips.push(
            "Ensure numeric fields contain valid numbers, not text or empty values"
                .to_string(),
        );
    }
    if has(|k| matches!(k, FieldErrorKind::MissingRequired)) {
        tips.push("Some required fields are missing from the document".to_string());
    }
    if has(|k| {
        matches!(k, FieldErrorKind::InvalidDate | FieldErrorKind::InvalidDateTime)
    }) {
        tips.push("Check that dates are in the correct format (YYYY-MM-DD)".to_string());
    }
    if has(|k| matches!(k, FieldErrorKind::InvalidEnum { .. })) {
        tips.push(
            "Some fields have invalid values - check they match the expected options"
                .to_string(),
        );
    }
    if tips.is_empty() {
        tips.push(
            "Review the document to ensure it matches the expected schema structure"
                .to_string(),
        );
    }
    tips
}

/// Turn raw validator findings into a displayable failure.
pub fn humanize_validation_errors(errors: &[FieldError]) -> HumanizedError {
    let total_count = errors.len();
    let formatted: Vec<HumanizedFieldError> = errors
        .iter()
        .take(MAX_DISPLAYED_ERRORS)
        .map(|error| HumanizedFieldError {
            field: match error.field_name() {
                Some(name) => humanize_field_name(name),
                None => "Unknown Field".to_string(),
            },
            message: simplify_message(error),
            row: error.row.map(|row| row + 1),
            technical_details: json!({
                "path": error.path_string(),
                "kind": format!("{:?}", error.kind),
                "found": error.found,
            }),
        })
        .collect();

    let rows: std::collections::BTreeSet<usize> =
        formatted.iter().filter_map(|e| e.row).collect();
    let summary = if rows.is_empty() {
        format!("{total_count} validation issue(s) found")
    } else {
        format!(
            "{total_count} validation issue(s) found across {} row(s)",
            rows.len()
        )
    };

    HumanizedError {
        summary,
        errors: formatted,
        total_count,
        tips: helpful_tips(errors),
    }
}

/// Render a compact multi-line message for logs and error events.
pub fn validation_failure_message(schema_name: &str, errors: &[FieldError]) -> String {
    let humanized = humanize_validation_errors(errors);
    let mut lines = Vec::new();
    lines.push(format!("Schema validation failed for {schema_name}:"));
    lines.push(humanized.summary.clone());
    for err in humanized.errors.iter().take(3) {
        match err.row {
            Some(row) => {
                lines.push(format!("  - Row {}, {}: {}", row, err.field, err.message))
            }
            None => lines.push(format!("  - {}: {}", err.field, err.message)),
        }
    }
    if humanized.total_count > 3 {
        lines.push(format!("  ... and {} more errors", humanized.total_count - 3));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::validate::PathSeg;

    #[test]
    fn field_names_are_title_cased() {
        assert_eq!(
            humanize_field_name("income_capitalisation_method"),
            "Income Capitalisation Method"
        );
        assert_eq!(humanize_field_name("vendor"), "Vendor");
    }

    #[test]
    fn humanizer_reports_rows_one_based() {
        let errors = vec![FieldError {
            path: vec![
                PathSeg::Field("item".to_string()),
                PathSeg::Index(1),
                PathSeg::Field("amount".to_string()),
            ],
            row: Some(1),
            kind: FieldErrorKind::ExpectedNumber,
            found: Value::String("ten".to_string()),
        }];
        let humanized = humanize_validation_errors(&errors);
        assert_eq!(humanized.errors[0].row, Some(2));
        assert_eq!(humanized.errors[0].field, "Amount");
        assert!(humanized.summary.contains("1 row(s)"));
        assert!(!humanized.tips.is_empty());
    }
}
