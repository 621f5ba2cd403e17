use anyhow::Result;
use image::{Rgb, RgbImage};
use sha2::{Digest, Sha256};

use super::{GenerationRequest, ImageEditModel};

/// Deterministic local backend: blends the source with a tint derived from
/// the prompt, seed and sampling parameters.
#[derive(Debug, Clone, Copy, Default)]
pub struct DryrunModel;

impl ImageEditModel for DryrunModel {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn generate(&self, request: &GenerationRequest) -> Result<RgbImage> {
        let tint = tint_for(request);
        let mut image = request.image.clone();
        for pixel in image.pixels_mut() {
            *pixel = blend(*pixel, tint);
        }
        Ok(image)
    }
}

fn tint_for(request: &GenerationRequest) -> Rgb<u8> {
    let mut hasher = Sha256::new();
    hasher.update(request.prompt.as_bytes());
    hasher.update(request.seed.to_be_bytes());
    hasher.update(request.num_inference_steps.to_be_bytes());
    hasher.update(request.guidance_scale.to_bits().to_be_bytes());
    let digest = hasher.finalize();
    Rgb([digest[0], digest[1], digest[2]])
}

fn blend(source: Rgb<u8>, tint: Rgb<u8>) -> Rgb<u8> {
    let mix = |a: u8, b: u8| ((u16::from(a) + u16::from(b)) / 2) as u8;
    Rgb([
        mix(source[0], tint[0]),
        mix(source[1], tint[1]),
        mix(source[2], tint[2]),
    ])
}
