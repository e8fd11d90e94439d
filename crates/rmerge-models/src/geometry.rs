//! Frame geometry buckets used for target resolution voting.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Short-edge length at or above which an asset counts as "large".
pub const LARGE_SHORT_EDGE_THRESHOLD: u32 = 1080;

/// Frame orientation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Orientation {
    Portrait,
    Landscape,
}

impl Orientation {
    /// Portrait iff height exceeds width; square frames are landscape.
    pub fn of(width: u32, height: u32) -> Self {
        if height > width {
            Orientation::Portrait
        } else {
            Orientation::Landscape
        }
    }
}

/// Target frame geometry for a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub struct TargetResolution {
    pub width: u32,
    pub height: u32,
}

impl TargetResolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Fallback when no asset in a batch can be probed.
    pub const fn default_portrait() -> Self {
        GeometryBucket::PortraitLarge.canonical()
    }

    pub fn orientation(&self) -> Orientation {
        Orientation::of(self.width, self.height)
    }
}

impl fmt::Display for TargetResolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// The four canonical geometries a batch can be normalized to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum GeometryBucket {
    PortraitLarge,
    PortraitSmall,
    LandscapeLarge,
    LandscapeSmall,
}

impl GeometryBucket {
    /// Classify a native frame size.
    ///
    /// The short edge (width for portrait, height for landscape) is compared
    /// against [`LARGE_SHORT_EDGE_THRESHOLD`].
    pub fn classify(width: u32, height: u32) -> Self {
        let short_edge = width.min(height);
        let large = short_edge >= LARGE_SHORT_EDGE_THRESHOLD;
        match (Orientation::of(width, height), large) {
            (Orientation::Portrait, true) => GeometryBucket::PortraitLarge,
            (Orientation::Portrait, false) => GeometryBucket::PortraitSmall,
            (Orientation::Landscape, true) => GeometryBucket::LandscapeLarge,
            (Orientation::Landscape, false) => GeometryBucket::LandscapeSmall,
        }
    }

    /// Canonical output geometry for the bucket.
    pub const fn canonical(&self) -> TargetResolution {
        match self {
            GeometryBucket::PortraitLarge => TargetResolution::new(1080, 1920),
            GeometryBucket::PortraitSmall => TargetResolution::new(720, 1280),
            GeometryBucket::LandscapeLarge => TargetResolution::new(1920, 1080),
            GeometryBucket::LandscapeSmall => TargetResolution::new(1280, 720),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_orientation() {
        assert_eq!(Orientation::of(1080, 1920), Orientation::Portrait);
        assert_eq!(Orientation::of(1920, 1080), Orientation::Landscape);
        assert_eq!(Orientation::of(1080, 1080), Orientation::Landscape);
    }

    #[test]
    fn test_classify() {
        assert_eq!(GeometryBucket::classify(1080, 1920), GeometryBucket::PortraitLarge);
        assert_eq!(GeometryBucket::classify(1440, 2560), GeometryBucket::PortraitLarge);
        assert_eq!(GeometryBucket::classify(720, 1280), GeometryBucket::PortraitSmall);
        assert_eq!(GeometryBucket::classify(1920, 1080), GeometryBucket::LandscapeLarge);
        assert_eq!(GeometryBucket::classify(640, 360), GeometryBucket::LandscapeSmall);
    }

    #[test]
    fn test_default_portrait() {
        let target = TargetResolution::default_portrait();
        assert_eq!(target, TargetResolution::new(1080, 1920));
        assert_eq!(target.to_string(), "1080x1920");
    }
}
