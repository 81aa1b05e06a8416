use std::fmt::{Display, Formatter};

use itertools::Itertools;
use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use serde_json::{Number, Value};
use url::Url;

use super::{ColumnDefinition, ColumnType, SchemaError};
use crate::data_types::{format_timestamp, is_system_field, parse_datetime_input, Document};

lazy_static! {
    static ref EMAIL_RE: Regex = Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").unwrap();
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Required,
    InvalidType,
    InvalidInteger,
    InvalidBoolean,
    InvalidDatetime,
    TooShort,
    TooLong,
    PatternMismatch,
    InvalidEmail,
    InvalidUrl,
    NotInEnum,
    TooSmall,
    TooLarge,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Required => "required",
            ErrorCode::InvalidType => "invalid_type",
            ErrorCode::InvalidInteger => "invalid_integer",
            ErrorCode::InvalidBoolean => "invalid_boolean",
            ErrorCode::InvalidDatetime => "invalid_datetime",
            ErrorCode::TooShort => "too_short",
            ErrorCode::TooLong => "too_long",
            ErrorCode::PatternMismatch => "pattern_mismatch",
            ErrorCode::InvalidEmail => "invalid_email",
            ErrorCode::InvalidUrl => "invalid_url",
            ErrorCode::NotInEnum => "not_in_enum",
            ErrorCode::TooSmall => "too_small",
            ErrorCode::TooLarge => "too_large",
        }
    }
}

/// One problem with one field. `field` is the path into the payload, e.g.
/// `tags[2]` for the third element of an array column.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub field: String,
    pub message: String,
    pub code: ErrorCode,
}

impl FieldError {
    pub fn new(field: &str, message: impl Into<String>, code: ErrorCode) -> Self {
        Self {
            field: field.to_string(),
            message: message.into(),
            code,
        }
    }
}

impl Display for FieldError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {} ({})", self.field, self.message, self.code.as_str())
    }
}

/// All problems found in a payload. Never empty when returned as an error.
#[derive(Serialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(transparent)]
pub struct ValidationErrors(pub Vec<FieldError>);

impl ValidationErrors {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn errors(&self) -> &[FieldError] {
        &self.0
    }

    pub fn for_field<'a>(&'a self, field: &'a str) -> impl Iterator<Item = &'a FieldError> {
        self.0.iter().filter(move |e| e.field == field)
    }

    fn push(&mut self, error: FieldError) {
        self.0.push(error)
    }
}

impl Display for ValidationErrors {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.iter().join("; "))
    }
}

impl std::error::Error for ValidationErrors {}

#[derive(Debug)]
struct CompiledRules {
    min_length: Option<usize>,
    max_length: Option<usize>,
    pattern: Option<Regex>,
    email: bool,
    url: bool,
    allowed: Vec<String>,
    min: Option<f64>,
    max: Option<f64>,
    message: Option<String>,
}

impl CompiledRules {
    fn message_or(&self, default: String) -> String {
        self.message.clone().unwrap_or(default)
    }
}

#[derive(Debug)]
struct CompiledColumn {
    key: String,
    column_type: ColumnType,
    required: bool,
    array: bool,
    default: Option<Value>,
    rules: CompiledRules,
}

/// Per-document validator for one schema. Build with [`compile`].
#[derive(Debug)]
pub struct Validator {
    columns: Vec<CompiledColumn>,
}

/// Compile a column list into a validator. System columns are skipped:
/// their values are owned by the repository, not by the caller.
pub fn compile(schema: &[ColumnDefinition]) -> Result<Validator, SchemaError> {
    let columns = schema
        .iter()
        .filter(|column| !column.is_system())
        .map(compile_column)
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Validator { columns })
}

fn compile_column(column: &ColumnDefinition) -> Result<CompiledColumn, SchemaError> {
    let rules = column.validation.clone().unwrap_or_default();
    let pattern = rules
        .pattern
        .as_deref()
        .map(Regex::new)
        .transpose()
        .map_err(|e| SchemaError::InvalidPattern {
            key: column.key.clone(),
            reason: e.to_string(),
        })?;

    Ok(CompiledColumn {
        key: column.key.clone(),
        column_type: column.column_type,
        required: column.required,
        array: column.array,
        default: column.default.clone(),
        rules: CompiledRules {
            min_length: rules.min_length,
            max_length: rules.max_length,
            pattern,
            email: rules.email,
            url: rules.url,
            allowed: rules.allowed,
            min: rules.min,
            max: rules.max,
            message: rules.message,
        },
    })
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

fn format_bound(bound: f64) -> String {
    if bound.fract() == 0.0 && bound.abs() < 1e15 {
        format!("{}", bound as i64)
    } else {
        bound.to_string()
    }
}

impl Validator {
    pub fn knows(&self, key: &str) -> bool {
        self.columns.iter().any(|c| c.key == key)
    }

    /// Validate and normalize a payload.
    ///
    /// `$`-prefixed keys are dropped, fields outside the schema pass through
    /// untouched, and every column is checked independently so the caller
    /// gets all problems at once.
    pub fn validate(&self, payload: &Document) -> Result<Document, ValidationErrors> {
        let mut output = Document::new();
        let mut errors = ValidationErrors::default();

        for (key, value) in payload {
            if !is_system_field(key) && !self.knows(key) {
                output.insert(key.clone(), value.clone());
            }
        }

        for column in &self.columns {
            let value = match payload.get(&column.key) {
                Some(value) if !is_empty(value) => value.clone(),
                _ => match (&column.default, column.required) {
                    (Some(default), true) => default.clone(),
                    (None, true) => {
                        errors.push(FieldError::new(
                            &column.key,
                            "is required",
                            ErrorCode::Required,
                        ));
                        continue;
                    }
                    (_, false) => continue,
                },
            };

            if let Some(value) = column.coerce(&value, &mut errors) {
                output.insert(column.key.clone(), value);
            }
        }

        if errors.is_empty() {
            Ok(output)
        } else {
            Err(errors)
        }
    }
}

impl CompiledColumn {
    fn coerce(&self, value: &Value, errors: &mut ValidationErrors) -> Option<Value> {
        if !self.array {
            return self.coerce_element(value, &self.key, errors);
        }

        let Value::Array(items) = value else {
            errors.push(FieldError::new(
                &self.key,
                "must be a list",
                ErrorCode::InvalidType,
            ));
            return None;
        };

        let before = errors.len();
        let coerced: Vec<Value> = items
            .iter()
            .enumerate()
            .filter_map(|(i, item)| {
                self.coerce_element(item, &format!("{}[{}]", self.key, i), errors)
            })
            .collect();

        (errors.len() == before).then_some(Value::Array(coerced))
    }

    fn coerce_element(
        &self,
        value: &Value,
        path: &str,
        errors: &mut ValidationErrors,
    ) -> Option<Value> {
        let before = errors.len();
        let coerced = match self.column_type {
            ColumnType::String => self.coerce_string(value, path, errors),
            ColumnType::Integer => self.coerce_integer(value, path, errors),
            ColumnType::Boolean => coerce_boolean(value, path, errors),
            ColumnType::Datetime => coerce_datetime(value, path, errors),
            ColumnType::Relation | ColumnType::Storage => coerce_identifier(value, path, errors),
        };

        if errors.len() == before {
            coerced
        } else {
            None
        }
    }

    fn coerce_string(
        &self,
        value: &Value,
        path: &str,
        errors: &mut ValidationErrors,
    ) -> Option<Value> {
        let text = match value {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            _ => {
                errors.push(FieldError::new(path, "must be text", ErrorCode::InvalidType));
                return None;
            }
        };
        let rules = &self.rules;

        // An enum is a closed set: membership is the only rule that applies
        if !rules.allowed.is_empty() {
            if !rules.allowed.contains(&text) {
                errors.push(FieldError::new(
                    path,
                    rules.message_or(format!("must be one of: {}", rules.allowed.join(", "))),
                    ErrorCode::NotInEnum,
                ));
            }
            return Some(Value::String(text));
        }

        let length = text.chars().count();
        if let Some(min) = rules.min_length {
            if length < min {
                errors.push(FieldError::new(
                    path,
                    rules.message_or(format!("must be at least {min} characters")),
                    ErrorCode::TooShort,
                ));
            }
        }
        if let Some(max) = rules.max_length {
            if length > max {
                errors.push(FieldError::new(
                    path,
                    rules.message_or(format!("must be at most {max} characters")),
                    ErrorCode::TooLong,
                ));
            }
        }
        if let Some(pattern) = &rules.pattern {
            if !pattern.is_match(&text) {
                errors.push(FieldError::new(
                    path,
                    rules.message_or("does not match the required format".to_string()),
                    ErrorCode::PatternMismatch,
                ));
            }
        }
        if rules.email && !EMAIL_RE.is_match(&text) {
            errors.push(FieldError::new(
                path,
                rules.message_or("must be a valid email address".to_string()),
                ErrorCode::InvalidEmail,
            ));
        }
        if rules.url && !is_web_url(&text) {
            errors.push(FieldError::new(
                path,
                rules.message_or("must be a valid URL".to_string()),
                ErrorCode::InvalidUrl,
            ));
        }

        Some(Value::String(text))
    }

    fn coerce_integer(
        &self,
        value: &Value,
        path: &str,
        errors: &mut ValidationErrors,
    ) -> Option<Value> {
        let Some(number) = parse_integer(value) else {
            errors.push(FieldError::new(
                path,
                "must be a whole number",
                ErrorCode::InvalidInteger,
            ));
            return None;
        };
        let rules = &self.rules;

        if let Some(min) = rules.min {
            if (number as f64) < min {
                errors.push(FieldError::new(
                    path,
                    rules.message_or(format!("must be at least {}", format_bound(min))),
                    ErrorCode::TooSmall,
                ));
            }
        }
        if let Some(max) = rules.max {
            if (number as f64) > max {
                errors.push(FieldError::new(
                    path,
                    rules.message_or(format!("must be at most {}", format_bound(max))),
                    ErrorCode::TooLarge,
                ));
            }
        }

        Some(Value::Number(Number::from(number)))
    }
}

fn is_web_url(text: &str) -> bool {
    Url::parse(text)
        .map(|url| matches!(url.scheme(), "http" | "https") && url.host().is_some())
        .unwrap_or(false)
}

/// Whole numbers only: `3`, `3.0` and `"3"` are fine, `3.5` and `"three"`
/// are not.
pub(crate) fn parse_integer(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().and_then(integral_f64)),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().and_then(integral_f64))
        }
        _ => None,
    }
}

fn integral_f64(f: f64) -> Option<i64> {
    (f.is_finite() && f.fract() == 0.0 && f.abs() < i64::MAX as f64).then_some(f as i64)
}

pub(crate) fn parse_boolean(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => match n.as_i64() {
            Some(1) => Some(true),
            Some(0) => Some(false),
            _ => None,
        },
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "y" | "on" => Some(true),
            "false" | "0" | "no" | "n" | "off" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn coerce_boolean(value: &Value, path: &str, errors: &mut ValidationErrors) -> Option<Value> {
    match parse_boolean(value) {
        Some(b) => Some(Value::Bool(b)),
        None => {
            errors.push(FieldError::new(
                path,
                "must be true or false",
                ErrorCode::InvalidBoolean,
            ));
            None
        }
    }
}

fn coerce_datetime(value: &Value, path: &str, errors: &mut ValidationErrors) -> Option<Value> {
    match value.as_str().and_then(parse_datetime_input) {
        Some(ts) => Some(Value::String(format_timestamp(ts))),
        None => {
            errors.push(FieldError::new(
                path,
                "must be a valid date and time",
                ErrorCode::InvalidDatetime,
            ));
            None
        }
    }
}

/// Relations and storage references are opaque ids; whether the row or file
/// they point at exists is not checked here.
fn coerce_identifier(value: &Value, path: &str, errors: &mut ValidationErrors) -> Option<Value> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(Value::String(s.trim().to_string())),
        Value::Number(n) => Some(Value::String(n.to_string())),
        _ => {
            errors.push(FieldError::new(
                path,
                "must be an identifier",
                ErrorCode::InvalidType,
            ));
            None
        }
    }
}
