//! Outbound message schema validation.
//!
//! Validation is pure and runs before enrichment. A message rejected here
//! never reaches the retry loop.

use crate::error::{MessagingError, ValidationError};
use crate::message::DomainMessage;
use serde_json::{Map, Value};

/// Top-level fields the schema knows about
pub const KNOWN_FIELDS: &[&str] = &[
    "body",
    "subject",
    "type",
    "source",
    "correlationId",
    "sessionId",
    "metadata",
];

const OPTIONAL_STRING_FIELDS: &[&str] = &["subject", "correlationId", "sessionId"];

/// How unknown top-level fields are treated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ValidationMode {
    /// Reject any field outside [`KNOWN_FIELDS`]
    #[default]
    Strict,
    /// Accept and carry extra fields; used by the batch path
    AllowUnknown,
}

/// Enforces the envelope schema on outbound messages
#[derive(Debug, Clone, Copy, Default)]
pub struct MessageValidator;

impl MessageValidator {
    /// Validate an already-typed message.
    ///
    /// `type` and `source` must be non-empty, `body` must be absent, `null`
    /// or an object. In [`ValidationMode::Strict`] no extra fields may be set.
    pub fn validate(message: &DomainMessage, mode: ValidationMode) -> Result<(), ValidationError> {
        require_non_empty("type", &message.message_type)?;
        require_non_empty("source", &message.source)?;

        if let Some(body) = &message.body {
            check_body(body)?;
        }

        if mode == ValidationMode::Strict {
            if let Some(field) = message.extra.keys().next() {
                return Err(ValidationError::UnknownField {
                    field: field.clone(),
                });
            }
        }

        Ok(())
    }

    /// Validate raw JSON and convert it into a [`DomainMessage`].
    pub fn validate_value(
        value: &Value,
        mode: ValidationMode,
    ) -> Result<DomainMessage, MessagingError> {
        let object = value.as_object().ok_or_else(|| ValidationError::InvalidType {
            field: "message".to_string(),
            expected: "object".to_string(),
        })?;

        for field in ["type", "source"] {
            match object.get(field) {
                None | Some(Value::Null) => {
                    return Err(ValidationError::Required {
                        field: field.to_string(),
                    }
                    .into())
                }
                Some(Value::String(text)) => require_non_empty(field, text)?,
                Some(_) => return Err(invalid_type(field, "string").into()),
            }
        }

        for field in OPTIONAL_STRING_FIELDS {
            if let Some(found) = object.get(*field) {
                if !found.is_string() {
                    return Err(invalid_type(field, "string").into());
                }
            }
        }

        if let Some(body) = object.get("body") {
            check_body(body)?;
        }

        if let Some(metadata) = object.get("metadata") {
            check_metadata(metadata)?;
        }

        if mode == ValidationMode::Strict {
            check_known_fields(object)?;
        }

        Ok(serde_json::from_value(value.clone())?)
    }
}

fn require_non_empty(field: &str, value: &str) -> Result<(), ValidationError> {
    if value.is_empty() {
        return Err(ValidationError::Empty {
            field: field.to_string(),
        });
    }
    Ok(())
}

fn check_body(body: &Value) -> Result<(), ValidationError> {
    match body {
        Value::Null | Value::Object(_) => Ok(()),
        _ => Err(invalid_type("body", "object or null")),
    }
}

fn check_metadata(metadata: &Value) -> Result<(), ValidationError> {
    let entries = metadata
        .as_object()
        .ok_or_else(|| invalid_type("metadata", "object"))?;

    for (key, value) in entries {
        if !value.is_string() {
            return Err(invalid_type(&format!("metadata.{}", key), "string"));
        }
    }
    Ok(())
}

fn check_known_fields(object: &Map<String, Value>) -> Result<(), ValidationError> {
    match object
        .keys()
        .find(|key| !KNOWN_FIELDS.contains(&key.as_str()))
    {
        Some(field) => Err(ValidationError::UnknownField {
            field: field.clone(),
        }),
        None => Ok(()),
    }
}

fn invalid_type(field: &str, expected: &str) -> ValidationError {
    ValidationError::InvalidType {
        field: field.to_string(),
        expected: expected.to_string(),
    }
}

#[cfg(test)]
#[path = "schema_tests.rs"]
mod tests;
