//! 64-bit difference-hash fingerprints.
//!
//! Each bit records whether a cell of the 9x8 grayscale thumbnail is darker than
//! its right neighbour.
//!
//! The top band of the frame (status bar, clock) is excluded before hashing so that
//! the clock ticking over does not make an otherwise identical screen look new.

use std::fmt;

use image::imageops::{self, FilterType};
use serde::{Deserialize, Serialize};

use super::Frame;

/// Share of the frame height masked off the top before hashing.
pub const DEFAULT_MASK_TOP_RATIO: f32 = 0.08;

const HASH_WIDTH: u32 = 9;
const HASH_HEIGHT: u32 = 8;

/// Perceptual fingerprint of a frame. Similar frames have a small Hamming distance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Fingerprint(pub u64);

impl Fingerprint {
    /// Number of differing bits.
    pub fn distance(self, other: Fingerprint) -> u32 {
        (self.0 ^ other.0).count_ones()
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl From<Fingerprint> for String {
    fn from(fp: Fingerprint) -> Self {
        fp.to_string()
    }
}

impl TryFrom<String> for Fingerprint {
    type Error = std::num::ParseIntError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        u64::from_str_radix(&value, 16).map(Fingerprint)
    }
}

/// Computes fingerprints with a fixed top mask.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Fingerprinter {
    mask_top_ratio: f32,
}

impl Default for Fingerprinter {
    fn default() -> Self {
        Self::new(DEFAULT_MASK_TOP_RATIO)
    }
}

impl Fingerprinter {
    pub fn new(mask_top_ratio: f32) -> Self {
        Self {
            mask_top_ratio: mask_top_ratio.clamp(0.0, 0.9),
        }
    }

    pub fn mask_top_ratio(&self) -> f32 {
        self.mask_top_ratio
    }

    pub fn fingerprint(&self, frame: &Frame) -> Fingerprint {
        let (width, height) = (frame.width(), frame.height());
        if width == 0 || height == 0 {
            return Fingerprint(0);
        }
        let masked = ((height as f32 * self.mask_top_ratio).floor() as u32).min(height - 1);
        let visible =
            imageops::crop_imm(frame.image(), 0, masked, width, height - masked).to_image();
        let gray = imageops::grayscale(&visible);
        let small = imageops::resize(&gray, HASH_WIDTH, HASH_HEIGHT, FilterType::Triangle);

        let mut bits = 0u64;
        for y in 0..HASH_HEIGHT {
            for x in 0..HASH_WIDTH - 1 {
                let left = small.get_pixel(x, y)[0];
                let right = small.get_pixel(x + 1, y)[0];
                if left < right {
                    bits |= 1 << (y * (HASH_WIDTH - 1) + x);
                }
            }
        }
        Fingerprint(bits)
    }
}
