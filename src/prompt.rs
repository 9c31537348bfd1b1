use serde::Serialize;

/// System and user messages sent to the completion endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PromptPayload {
    pub system: String,
    pub user: String,
}

impl PromptPayload {
    pub fn new(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            user: user.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseFormat {
    Text,
    Json,
}

/// Fixed sampling parameters for one completion call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingOptions {
    pub temperature: f32,
    pub max_tokens: u32,
    pub top_p: Option<f32>,
    pub response_format: ResponseFormat,
}

impl SamplingOptions {
    pub fn new(temperature: f32, max_tokens: u32, response_format: ResponseFormat) -> Self {
        Self {
            temperature: temperature.clamp(0.0, 1.0),
            max_tokens,
            top_p: None,
            response_format,
        }
    }

    pub fn text(temperature: f32, max_tokens: u32) -> Self {
        Self::new(temperature, max_tokens, ResponseFormat::Text)
    }

    pub fn json(temperature: f32, max_tokens: u32) -> Self {
        Self::new(temperature, max_tokens, ResponseFormat::Json)
    }

    pub fn with_top_p(mut self, top_p: f32) -> Self {
        self.top_p = Some(top_p.clamp(0.0, 1.0));
        self
    }

    pub fn is_json(&self) -> bool {
        self.response_format == ResponseFormat::Json
    }
}

/// Input rejected before any network call.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("{0} is required")]
    EmptyField(&'static str),

    #[error("{field} must be between {min} and {max} (got {value})")]
    OutOfRange {
        field: &'static str,
        min: i64,
        max: i64,
        value: i64,
    },
}

/// Trim a required field and reject it when empty.
pub fn require<'a>(field: &'static str, value: &'a str) -> Result<&'a str, ValidationError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::EmptyField(field));
    }
    Ok(trimmed)
}

/// Check an integer field against an inclusive range.
pub fn in_range(field: &'static str, value: i64, min: i64, max: i64) -> Result<(), ValidationError> {
    if value < min || value > max {
        return Err(ValidationError::OutOfRange {
            field,
            min,
            max,
            value,
        });
    }
    Ok(())
}

/// Trimmed optional field, `None` when absent or blank.
pub fn optional(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}
