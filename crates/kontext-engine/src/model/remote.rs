use std::io::Cursor;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::{ImageFormat, RgbImage};
use reqwest::blocking::Client as HttpClient;
use serde_json::{json, Value};

use super::{GenerationRequest, ImageEditModel, ModelFault};

/// Backend that forwards each request to an inference server holding the
/// pipeline on an accelerator.
pub struct RemoteModel {
    endpoint: String,
    timeout_s: f64,
    http: HttpClient,
}

impl RemoteModel {
    pub fn new(endpoint: impl Into<String>, timeout_s: f64) -> Self {
        Self {
            endpoint: endpoint.into(),
            timeout_s,
            http: HttpClient::new(),
        }
    }

    fn payload(request: &GenerationRequest) -> Result<Value> {
        let mut png = Vec::new();
        request
            .image
            .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
            .context("failed to encode source image")?;
        Ok(json!({
            "prompt": request.prompt,
            "image": BASE64.encode(png),
            "width": request.width,
            "height": request.height,
            "num_inference_steps": request.num_inference_steps,
            "guidance_scale": request.guidance_scale,
            "seed": request.seed,
        }))
    }
}

impl ImageEditModel for RemoteModel {
    fn name(&self) -> &str {
        "remote"
    }

    fn generate(&self, request: &GenerationRequest) -> Result<RgbImage> {
        let payload = Self::payload(request)?;
        let response = self
            .http
            .post(&self.endpoint)
            .header("accept", "application/json")
            .json(&payload)
            .timeout(Duration::from_secs_f64(self.timeout_s))
            .send()
            .with_context(|| format!("inference request failed ({})", self.endpoint))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .context("inference response body read failed")?;
        if !(200..300).contains(&status) {
            return Err(response_error(status, &body));
        }
        let parsed: Value =
            serde_json::from_str(&body).context("inference server returned invalid JSON")?;
        decode_image(&parsed)
    }
}

/// Maps a failed inference response onto an error, marking device
/// exhaustion and server-side faults as [`ModelFault`].
fn response_error(status: u16, body: &str) -> anyhow::Error {
    let message = truncate_text(body.trim(), 512);
    let lowered = message.to_ascii_lowercase();
    if status == 507 || lowered.contains("out of memory") {
        return ModelFault::OutOfMemory(format!("inference server ({status}): {message}")).into();
    }
    if status == 503 {
        return ModelFault::Backend(format!("inference server ({status}): {message}")).into();
    }
    anyhow!("inference request failed ({status}): {message}")
}

fn decode_image(payload: &Value) -> Result<RgbImage> {
    if let Some(error) = payload.get("error").and_then(Value::as_str) {
        bail!("inference server error: {error}");
    }
    let encoded = payload
        .get("image")
        .or_else(|| payload.get("images").and_then(|images| images.get(0)))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| anyhow!("inference response missing image"))?;
    let encoded = encoded
        .split_once(";base64,")
        .map(|(_, data)| data)
        .unwrap_or(encoded);
    let bytes = BASE64
        .decode(encoded)
        .context("inference image has invalid base64")?;
    let image = image::load_from_memory(&bytes).context("inference image could not be decoded")?;
    Ok(image.to_rgb8())
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}
