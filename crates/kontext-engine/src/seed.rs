use rand::rngs::OsRng;
use rand::RngCore;

/// Returns `requested` verbatim, or a fresh seed in `0..=65535` drawn from
/// the operating system's random source.
///
/// The 16-bit range keeps seeds short enough to share by hand; callers that
/// want the model's full seed space pass one explicitly.
pub fn resolve_seed(requested: Option<u64>) -> u64 {
    resolve_seed_with(requested, &mut OsRng)
}

pub fn resolve_seed_with<R: RngCore + ?Sized>(requested: Option<u64>, rng: &mut R) -> u64 {
    if let Some(seed) = requested {
        return seed;
    }
    let mut bytes = [0u8; 2];
    rng.fill_bytes(&mut bytes);
    u64::from(u16::from_be_bytes(bytes))
}
