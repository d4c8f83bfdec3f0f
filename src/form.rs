use serde::Serialize;

use crate::hints::{ClientHint, HintError};
use crate::limits::*;
use crate::model::{Actor, Custodian, Ms, Span};

pub const DEFAULT_DRAFT_NAME: &str = "Draft booking";

/// A field-level validation message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub field: &'static str,
    pub message: String,
}

impl FieldError {
    pub fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for FieldError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Booking form exactly as submitted: local date-times, not yet resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingForm {
    pub name: String,
    pub start: String,
    pub end: String,
    pub custodian: Option<Custodian>,
}

/// A form that passed validation, with its window resolved to instants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidBooking {
    pub name: String,
    pub span: Span,
    pub custodian: Custodian,
}

pub(crate) fn validate_name(name: &str) -> Result<String, FieldError> {
    let name = name.trim();
    if name.chars().count() < MIN_NAME_LEN {
        return Err(FieldError::new("name", "Name is required"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(FieldError::new("name", "Name is too long"));
    }
    Ok(name.to_string())
}

fn resolve(field: &'static str, label: &str, value: &str, hint: &ClientHint) -> Result<Ms, FieldError> {
    hint.resolve_local(value).map_err(|e| match e {
        HintError::NonexistentLocalTime(_) => {
            FieldError::new(field, format!("{label} does not exist in your time zone"))
        }
        _ => FieldError::new(field, format!("{label} is required")),
    })
}

impl BookingForm {
    /// Validate every field, collecting all messages rather than stopping at the first.
    pub fn validate(&self, actor: &Actor, hint: &ClientHint, now: Ms) -> Result<ValidBooking, Vec<FieldError>> {
        let mut errors = Vec::new();

        let name = validate_name(&self.name).map_err(|e| errors.push(e)).ok();

        let start = resolve("startDate", "Start date", &self.start, hint)
            .map_err(|e| errors.push(e))
            .ok();
        let end = resolve("endDate", "End date", &self.end, hint)
            .map_err(|e| errors.push(e))
            .ok();

        if let Some(start) = start {
            if start <= now {
                errors.push(FieldError::new("startDate", "Start date must be in the future"));
            } else if start < MIN_VALID_TIMESTAMP_MS || start >= MAX_VALID_TIMESTAMP_MS {
                errors.push(FieldError::new("startDate", "Start date is out of range"));
            }
        }
        let span = match (start, end) {
            (Some(start), Some(end)) => match Span::try_new(start, end) {
                Some(span) if span.end >= MAX_VALID_TIMESTAMP_MS => {
                    errors.push(FieldError::new("endDate", "End date is out of range"));
                    None
                }
                Some(span) if span.duration_ms() > MAX_WINDOW_DURATION_MS => {
                    errors.push(FieldError::new("endDate", "Booking period is too long"));
                    None
                }
                Some(span) => Some(span),
                None => {
                    errors.push(FieldError::new("endDate", "End date cannot be earlier than start date."));
                    None
                }
            },
            _ => None,
        };

        let custodian = match self.custodian {
            None => {
                errors.push(FieldError::new("custodian", "Please select a custodian"));
                None
            }
            Some(c) if actor.role.is_self_service() && c != Custodian::User(actor.user_id) => {
                errors.push(FieldError::new("custodian", "Self service users can only book for themselves"));
                None
            }
            Some(c) => Some(c),
        };

        match (name, span, custodian) {
            (Some(name), Some(span), Some(custodian)) if errors.is_empty() => Ok(ValidBooking { name, span, custodian }),
            _ => Err(errors),
        }
    }
}
