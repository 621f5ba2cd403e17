use std::fmt;
use std::str::FromStr;

pub const MATCH_INPUT_IMAGE: &str = "match_input_image";

/// Named ratios and their pixel sizes. Every side is a multiple of 16 and
/// each area is close to one megapixel.
pub const ASPECT_RATIOS: [(&str, u32, u32); 11] = [
    ("1:1", 1024, 1024),
    ("16:9", 1344, 768),
    ("21:9", 1536, 640),
    ("3:2", 1216, 832),
    ("2:3", 832, 1216),
    ("4:5", 944, 1104),
    ("5:4", 1104, 944),
    ("3:4", 896, 1152),
    ("4:3", 1152, 896),
    ("9:16", 768, 1344),
    ("9:21", 640, 1536),
];

/// Every accepted `aspect_ratio` value, table entries first.
pub const ASPECT_RATIO_NAMES: [&str; 12] = [
    "1:1",
    "16:9",
    "21:9",
    "3:2",
    "2:3",
    "4:5",
    "5:4",
    "3:4",
    "4:3",
    "9:16",
    "9:21",
    MATCH_INPUT_IMAGE,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

impl Dimensions {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl fmt::Display for Dimensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AspectRatio {
    MatchInput,
    Fixed {
        name: &'static str,
        size: Dimensions,
    },
}

impl AspectRatio {
    pub fn name(&self) -> &'static str {
        match self {
            Self::MatchInput => MATCH_INPUT_IMAGE,
            Self::Fixed { name, .. } => *name,
        }
    }

    /// Target size for a source image of `input` dimensions.
    pub fn resolve(&self, input: Dimensions) -> Dimensions {
        match self {
            Self::MatchInput => input,
            Self::Fixed { size, .. } => *size,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid aspect ratio: {0}")]
pub struct InvalidAspectRatio(pub String);

impl FromStr for AspectRatio {
    type Err = InvalidAspectRatio;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        if raw == MATCH_INPUT_IMAGE {
            return Ok(Self::MatchInput);
        }
        ASPECT_RATIOS
            .iter()
            .find(|(name, _, _)| *name == raw)
            .map(|(name, width, height)| Self::Fixed {
                name: *name,
                size: Dimensions::new(*width, *height),
            })
            .ok_or_else(|| InvalidAspectRatio(raw.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn match_input_keeps_native_dimensions() {
        let ratio: AspectRatio = MATCH_INPUT_IMAGE.parse().unwrap();
        assert_eq!(
            ratio.resolve(Dimensions::new(733, 411)),
            Dimensions::new(733, 411)
        );
    }

    #[test]
    fn fixed_ratio_ignores_input_dimensions() {
        let ratio: AspectRatio = "1:1".parse().unwrap();
        assert_eq!(
            ratio.resolve(Dimensions::new(640, 480)),
            Dimensions::new(1024, 1024)
        );
        let ratio: AspectRatio = "9:21".parse().unwrap();
        assert_eq!(ratio.name(), "9:21");
        assert_eq!(
            ratio.resolve(Dimensions::new(1, 1)),
            Dimensions::new(640, 1536)
        );
    }

    #[test]
    fn unknown_ratio_is_rejected() {
        let err = "7:5".parse::<AspectRatio>().unwrap_err();
        assert_eq!(err.to_string(), "Invalid aspect ratio: 7:5");
        assert!("".parse::<AspectRatio>().is_err());
        assert!("1:1 ".parse::<AspectRatio>().is_err());
    }

    #[test]
    fn table_sizes_fit_the_model_stride() {
        for (name, width, height) in ASPECT_RATIOS {
            assert_eq!(width % 16, 0, "{name} width");
            assert_eq!(height % 16, 0, "{name} height");
            let area = u64::from(width) * u64::from(height);
            assert!((950_000..=1_100_000).contains(&area), "{name} area {area}");
        }
    }

    #[test]
    fn every_accepted_name_parses() {
        for name in ASPECT_RATIO_NAMES {
            assert_eq!(name.parse::<AspectRatio>().unwrap().name(), name);
        }
    }
}
