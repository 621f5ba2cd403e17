use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::geometry::{ASPECT_RATIO_NAMES, MATCH_INPUT_IMAGE};
use crate::schema::{validate, Constraint, FieldRule, FieldType, Schema, ValidationErrors};

pub const DEFAULT_NUM_INFERENCE_STEPS: u32 = 28;
pub const DEFAULT_GUIDANCE_SCALE: f64 = 2.5;

/// The job input contract.
pub fn input_schema() -> Schema {
    Schema::new()
        .field(
            "prompt",
            FieldRule::required(FieldType::String).with(Constraint::NonEmpty),
        )
        .field(
            "image",
            FieldRule::required(FieldType::String).with(Constraint::NonEmpty),
        )
        .field(
            "aspect_ratio",
            FieldRule::optional(FieldType::String, json!(MATCH_INPUT_IMAGE))
                .with(Constraint::OneOf(&ASPECT_RATIO_NAMES)),
        )
        .field(
            "seed",
            FieldRule::optional(FieldType::Integer, Value::Null).with(Constraint::NonNegative),
        )
        .field(
            "num_inference_steps",
            FieldRule::optional(FieldType::Integer, json!(DEFAULT_NUM_INFERENCE_STEPS))
                .with(Constraint::Positive)
                .with(Constraint::AtMost(u64::from(u32::MAX))),
        )
        .field(
            "guidance_scale",
            FieldRule::optional(FieldType::Float, json!(DEFAULT_GUIDANCE_SCALE))
                .with(Constraint::Positive),
        )
}

/// Job input after validation; every optional field carries its value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobInput {
    pub prompt: String,
    pub image: String,
    pub aspect_ratio: String,
    pub seed: Option<u64>,
    pub num_inference_steps: u32,
    pub guidance_scale: f64,
}

impl JobInput {
    pub fn from_raw(raw: &Value) -> Result<Self, ValidationErrors> {
        let validated = validate(raw, &input_schema())?;
        serde_json::from_value(Value::Object(validated))
            .map_err(|err| ValidationErrors(vec![err.to_string()]))
    }
}

/// One unit of work as delivered by the host runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub input: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Bad job input or an unusable source image.
    Input,
    /// The compute backend ran out of resources or faulted.
    Resource,
    /// Anything else that went wrong while generating.
    Unexpected,
    /// The job directory, the saved result, or its upload failed.
    Storage,
}

impl FailureKind {
    /// Whether the worker process should be recycled after this failure.
    pub fn refresh_worker(self) -> bool {
        matches!(self, Self::Resource | Self::Unexpected)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ErrorDetail {
    Message(String),
    Fields(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JobResponse {
    Success {
        image_url: String,
        seed: u64,
    },
    Failure {
        error: ErrorDetail,
        #[serde(default, skip_serializing_if = "is_false")]
        refresh_worker: bool,
    },
}

impl JobResponse {
    pub fn success(image_url: String, seed: u64) -> Self {
        Self::Success { image_url, seed }
    }

    pub fn failure(kind: FailureKind, message: impl Into<String>) -> Self {
        Self::Failure {
            error: ErrorDetail::Message(message.into()),
            refresh_worker: kind.refresh_worker(),
        }
    }

    pub fn invalid_input(errors: ValidationErrors) -> Self {
        Self::Failure {
            error: ErrorDetail::Fields(errors.0),
            refresh_worker: false,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn refresh_worker(&self) -> bool {
        matches!(
            self,
            Self::Failure {
                refresh_worker: true,
                ..
            }
        )
    }
}

fn is_false(value: &bool) -> bool {
    !*value
}
