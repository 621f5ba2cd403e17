use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use image::RgbImage;
use kontext_contracts::job::FailureKind;

use crate::model::{GenerationRequest, ImageEditModel, ModelFault};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct InvocationFailure {
    pub kind: FailureKind,
    pub message: String,
}

/// A [`ModelFault`] anywhere in the chain means the device is exhausted or
/// faulted. Everything else is unexpected; both leave the process suspect.
pub fn classify(err: &anyhow::Error) -> FailureKind {
    if err
        .chain()
        .any(|cause| cause.downcast_ref::<ModelFault>().is_some())
    {
        FailureKind::Resource
    } else {
        FailureKind::Unexpected
    }
}

/// Owns the process-wide model and makes exactly one attempt per job.
#[derive(Clone)]
pub struct ModelInvoker {
    model: Arc<dyn ImageEditModel>,
}

impl ModelInvoker {
    pub fn new(model: Arc<dyn ImageEditModel>) -> Self {
        Self { model }
    }

    pub fn model_name(&self) -> &str {
        self.model.name()
    }

    pub fn invoke(&self, request: &GenerationRequest) -> Result<RgbImage, InvocationFailure> {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.model.generate(request)));
        let failure = match outcome {
            Ok(Ok(image)) => {
                let produced = (image.width(), image.height());
                if produced == (request.width, request.height) {
                    return Ok(image);
                }
                InvocationFailure {
                    kind: FailureKind::Unexpected,
                    message: format!(
                        "Unexpected error: model returned {}x{}, expected {}",
                        produced.0,
                        produced.1,
                        request.dimensions()
                    ),
                }
            }
            Ok(Err(err)) => {
                let kind = classify(&err);
                let message = match kind {
                    FailureKind::Resource => format!("Runtime error: {err:#}"),
                    _ => format!("Unexpected error: {err:#}"),
                };
                InvocationFailure { kind, message }
            }
            Err(payload) => InvocationFailure {
                kind: FailureKind::Unexpected,
                message: format!(
                    "Unexpected error: model panicked: {}",
                    panic_text(payload.as_ref())
                ),
            },
        };
        tracing::error!(
            model = self.model.name(),
            kind = ?failure.kind,
            "generation failed: {}",
            failure.message
        );
        Err(failure)
    }
}

fn panic_text(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        return (*text).to_string();
    }
    if let Some(text) = payload.downcast_ref::<String>() {
        return text.clone();
    }
    "unknown panic".to_string()
}
