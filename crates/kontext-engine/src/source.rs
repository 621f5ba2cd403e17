use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::imageops::FilterType;
use image::{ImageReader, RgbImage};
use kontext_contracts::geometry::Dimensions;
use reqwest::blocking::Client as HttpClient;

const SOURCE_FILE_NAME: &str = "input";

/// Where a job's `image` field points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Url,
    DataUrl,
    Path,
}

pub fn source_kind(reference: &str) -> Option<SourceKind> {
    let value = reference.trim();
    let lowered = value.to_ascii_lowercase();
    if lowered.starts_with("http://") || lowered.starts_with("https://") {
        return Some(SourceKind::Url);
    }
    if lowered.starts_with("data:image/") {
        return Some(SourceKind::DataUrl);
    }
    let path = Path::new(value);
    if path.is_file() {
        return Some(SourceKind::Path);
    }
    None
}

/// Copies the referenced image into `dest_dir` and returns the local path.
pub fn fetch_source(
    http: &HttpClient,
    reference: &str,
    dest_dir: &Path,
    timeout_s: f64,
) -> Result<PathBuf> {
    let value = reference.trim();
    let dest = dest_dir.join(SOURCE_FILE_NAME);
    match source_kind(value) {
        Some(SourceKind::Url) => {
            let bytes = download(http, value, timeout_s)?;
            fs::write(&dest, bytes)
                .with_context(|| format!("failed to write {}", dest.display()))?;
        }
        Some(SourceKind::DataUrl) => {
            let Some((_, payload)) = value.split_once(";base64,") else {
                bail!("image data URI is not base64 encoded");
            };
            let bytes = BASE64
                .decode(payload.trim())
                .context("image data URI has invalid base64")?;
            fs::write(&dest, bytes)
                .with_context(|| format!("failed to write {}", dest.display()))?;
        }
        Some(SourceKind::Path) => {
            fs::copy(value, &dest).with_context(|| format!("failed reading {value}"))?;
        }
        None => bail!("image reference is not a URL, data URI, or readable file: {value}"),
    }
    Ok(dest)
}

fn download(http: &HttpClient, url: &str, timeout_s: f64) -> Result<Vec<u8>> {
    let response = http
        .get(url)
        .timeout(Duration::from_secs_f64(timeout_s))
        .send()
        .with_context(|| format!("image download failed ({url})"))?;
    let status = response.status();
    if !status.is_success() {
        bail!("image download failed ({}): {url}", status.as_u16());
    }
    let bytes = response
        .bytes()
        .context("image download body read failed")?
        .to_vec();
    Ok(bytes)
}

/// Decodes any supported format and converts it to 8-bit RGB.
pub fn load_rgb(path: &Path) -> Result<RgbImage> {
    let image = ImageReader::open(path)
        .with_context(|| format!("failed to open {}", path.display()))?
        .with_guessed_format()
        .with_context(|| format!("failed to read {}", path.display()))?
        .decode()
        .context("source image could not be decoded")?;
    Ok(image.to_rgb8())
}

pub fn dimensions(image: &RgbImage) -> Dimensions {
    Dimensions::new(image.width(), image.height())
}

/// Lanczos resample to exactly `size`.
pub fn resample(image: &RgbImage, size: Dimensions) -> RgbImage {
    if dimensions(image) == size {
        return image.clone();
    }
    image::imageops::resize(image, size.width, size.height, FilterType::Lanczos3)
}
