//! Job contract shared with the serverless runtime.
//!
//! A job arrives as `{id?, input: {...}}` and always produces either
//! `{image_base64}` or `{error}`. Image payloads travel as base64,
//! optionally wrapped in a data-URL header.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CoreError;

/// Envelope delivered by the runtime.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Job {
    #[serde(default)]
    pub id: Option<String>,
    /// Raw input object. Kept untyped so that a malformed payload becomes
    /// a job error instead of a rejected request.
    #[serde(default)]
    pub input: Value,
}

/// Typed view of [`Job::input`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobInput {
    pub image: Option<String>,
    pub workflow: Option<Value>,
    pub lora_bg_url: Option<String>,
    pub lora_car_url: Option<String>,
}

impl JobInput {
    /// Parse the raw input value. `null` is treated as an empty input.
    pub fn from_value(value: &Value) -> Result<Self, CoreError> {
        if value.is_null() {
            return Ok(Self::default());
        }
        Self::deserialize(value).map_err(|e| CoreError::Validation(format!("Invalid job input: {e}")))
    }
}

/// Result payload handed back to the runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JobOutput {
    Success { image_base64: String },
    Failure { error: String },
}

impl JobOutput {
    pub fn is_success(&self) -> bool {
        matches!(self, JobOutput::Success { .. })
    }
}

/// Decode a base64 image, stripping a `data:...;base64,` header if present.
///
/// Everything up to and including the first comma is discarded. ASCII
/// whitespace (line wrapping) is ignored.
pub fn decode_image(payload: &str) -> Result<Vec<u8>, CoreError> {
    let data = match payload.split_once(',') {
        Some((_, rest)) => rest,
        None => payload,
    };
    let compact: String = data.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    if compact.is_empty() {
        return Err(CoreError::Validation("Image payload is empty".to_string()));
    }
    STANDARD
        .decode(compact.as_bytes())
        .map_err(|e| CoreError::Validation(format!("Image is not valid base64: {e}")))
}

pub fn encode_image(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}
