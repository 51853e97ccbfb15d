//! Match Scorer Module
//!
//! Judges whether a candidate video frame shows a reference image, using one
//! of three independent protocols: template search, SSIM and perceptual hash.

use std::fmt;
use std::path::{Path, PathBuf};

use image::imageops::{self, FilterType};
use image::{DynamicImage, GrayImage, RgbImage};
use imagehash::{Hash, PerceptualHash};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// pHash is computed on a 32x32 DCT input and keeps the top-left 8x8 block.
const PHASH_IMAGE_SIZE: (usize, usize) = (32, 32);
const PHASH_HASH_SIZE: (usize, usize) = (8, 8);
pub const PHASH_BITS: u32 = (PHASH_HASH_SIZE.0 * PHASH_HASH_SIZE.1) as u32;

// SSIM window and stabilizing constants for 8-bit images.
const SSIM_WINDOW: u32 = 7;
const SSIM_K1: f64 = 0.01;
const SSIM_K2: f64 = 0.03;
const SSIM_DATA_RANGE: f64 = 255.0;

/// The similarity protocols a frame can be judged with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    Template,
    Ssim,
    Phash,
}

impl Protocol {
    pub const ALL: [Protocol; 3] = [Protocol::Template, Protocol::Ssim, Protocol::Phash];

    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Template => "TEMPLATE",
            Protocol::Ssim => "SSIM",
            Protocol::Phash => "PHASH",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An enabled protocol bound to its own similarity threshold.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProtocolCheck {
    pub protocol: Protocol,
    pub threshold: f64,
}

/// The fixed list of enabled protocols, decided once at startup.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProtocolSet {
    checks: Vec<ProtocolCheck>,
}

impl ProtocolSet {
    pub fn new(checks: Vec<ProtocolCheck>) -> Self {
        ProtocolSet { checks }
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProtocolCheck> {
        self.checks.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.checks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.checks.len()
    }
}

/// The outcome of one comparison.
///
/// For PHASH `score` is the normalized similarity `1 - distance / 64`,
/// not the raw Hamming distance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Judgment {
    pub is_match: bool,
    pub score: f64,
}

/// A reference still, decoded once and kept for as long as it is searched for.
pub struct ReferenceImage {
    pub path: PathBuf,
    pub pixels: RgbImage,
    gray: GrayImage,
    hash: Hash,
}

/// Scores candidate frames against prepared reference images.
pub struct MatchScorer {
    hasher: PerceptualHash,
}

impl Default for MatchScorer {
    fn default() -> Self {
        Self::new()
    }
}

impl MatchScorer {
    pub fn new() -> Self {
        let hasher = PerceptualHash::new()
            .with_image_size(PHASH_IMAGE_SIZE.0, PHASH_IMAGE_SIZE.1)
            .with_hash_size(PHASH_HASH_SIZE.0, PHASH_HASH_SIZE.1);
        MatchScorer { hasher }
    }

    /// Decodes a reference image from disk.
    pub fn load_reference(&self, path: &Path) -> Result<ReferenceImage> {
        if !path.exists() {
            return Err(Error::MissingFile(path.to_path_buf()));
        }
        let pixels = image::open(path)?.to_rgb8();
        Ok(self.prepare_reference(path, pixels))
    }

    /// Wraps already decoded pixels as a reference.
    pub fn prepare_reference(&self, path: &Path, pixels: RgbImage) -> ReferenceImage {
        let gray = imageops::grayscale(&pixels);
        let hash = self.hasher.hash(&DynamicImage::ImageRgb8(pixels.clone()));
        ReferenceImage {
            path: path.to_path_buf(),
            pixels,
            gray,
            hash,
        }
    }

    /// Compares a candidate frame to a reference with a single protocol.
    pub fn compare(
        &self,
        reference: &ReferenceImage,
        candidate: &RgbImage,
        protocol: Protocol,
        threshold: f64,
    ) -> Result<Judgment> {
        let judgment = match protocol {
            Protocol::Template => {
                let frame = imageops::grayscale(candidate);
                let score = template_score(&frame, &reference.gray)?;
                Judgment { is_match: score >= threshold, score }
            }
            Protocol::Ssim => {
                // The reference is the invariant shape.
                let (width, height) = reference.gray.dimensions();
                let resized = imageops::resize(candidate, width, height, FilterType::Triangle);
                let score = ssim_score(&reference.gray, &imageops::grayscale(&resized))?;
                Judgment { is_match: score >= threshold, score }
            }
            Protocol::Phash => {
                let hash = self.hasher.hash(&DynamicImage::ImageRgb8(candidate.clone()));
                let distance = hamming_distance(&reference.hash, &hash)?;
                Judgment {
                    is_match: phash_matches(distance, threshold),
                    score: 1.0 - f64::from(distance) / f64::from(PHASH_BITS),
                }
            }
        };

        debug!(
            target: "match_scorer",
            "{} score for {:?}: {:.3} (threshold {:.3})",
            protocol,
            reference.path.file_name().unwrap_or_default(),
            judgment.score,
            threshold
        );
        Ok(judgment)
    }

    /// Runs every check in the set, keeping one outcome per protocol.
    ///
    /// A protocol that fails yields its error in place; the others still run.
    pub fn compare_all(
        &self,
        reference: &ReferenceImage,
        candidate: &RgbImage,
        protocols: &ProtocolSet,
    ) -> Vec<(Protocol, Result<Judgment>)> {
        protocols
            .iter()
            .map(|check| {
                let outcome = self.compare(reference, candidate, check.protocol, check.threshold);
                (check.protocol, outcome)
            })
            .collect()
    }
}

/// The largest Hamming distance still accepted for a similarity threshold.
pub fn phash_max_distance(similarity: f64) -> f64 {
    f64::from(PHASH_BITS) * (1.0 - similarity)
}

pub fn phash_matches(distance: u32, similarity: f64) -> bool {
    f64::from(distance) <= phash_max_distance(similarity)
}

/// Calculates the Hamming distance between two perceptual hashes.
fn hamming_distance(a: &Hash, b: &Hash) -> Result<u32> {
    let a_bits = &a.bits;
    let b_bits = &b.bits;
    if a_bits.len() != b_bits.len() {
        return Err(Error::Scoring {
            protocol: Protocol::Phash,
            reason: "cannot compare hashes of different lengths".to_string(),
        });
    }

    let distance = a_bits
        .iter()
        .zip(b_bits.iter())
        .filter(|(x, y)| x != y)
        .count() as u32;

    Ok(distance)
}

/// Summed-area table over a per-pixel value, used for O(1) window sums.
struct Integral {
    stride: usize,
    sums: Vec<f64>,
}

impl Integral {
    fn new(width: usize, height: usize, value: impl Fn(usize, usize) -> f64) -> Self {
        let stride = width + 1;
        let mut sums = vec![0.0; stride * (height + 1)];
        for y in 0..height {
            let mut row = 0.0;
            for x in 0..width {
                row += value(x, y);
                sums[(y + 1) * stride + x + 1] = sums[y * stride + x + 1] + row;
            }
        }
        Integral { stride, sums }
    }

    fn window(&self, x: usize, y: usize, w: usize, h: usize) -> f64 {
        let s = self.stride;
        self.sums[(y + h) * s + x + w] - self.sums[y * s + x + w] - self.sums[(y + h) * s + x]
            + self.sums[y * s + x]
    }
}

/// Best zero-mean normalized cross-correlation of `template` over every
/// position inside `frame`. Lies in [-1, 1].
pub fn template_score(frame: &GrayImage, template: &GrayImage) -> Result<f64> {
    let (fw, fh) = (frame.width() as usize, frame.height() as usize);
    let (tw, th) = (template.width() as usize, template.height() as usize);
    if tw == 0 || th == 0 || tw > fw || th > fh {
        return Err(Error::Scoring {
            protocol: Protocol::Template,
            reason: format!("template {}x{} does not fit in frame {}x{}", tw, th, fw, fh),
        });
    }

    let n = (tw * th) as f64;
    let template_mean = template.pixels().map(|p| f64::from(p[0])).sum::<f64>() / n;
    let centered: Vec<f64> = template.pixels().map(|p| f64::from(p[0]) - template_mean).collect();
    let template_norm = centered.iter().map(|v| v * v).sum::<f64>().sqrt();

    let image: Vec<f64> = frame.pixels().map(|p| f64::from(p[0])).collect();
    let sum = Integral::new(fw, fh, |x, y| image[y * fw + x]);
    let sum_sq = Integral::new(fw, fh, |x, y| image[y * fw + x].powi(2));

    let mut best = f64::NEG_INFINITY;
    for y in 0..=(fh - th) {
        for x in 0..=(fw - tw) {
            let window_sum = sum.window(x, y, tw, th);
            let window_var = (sum_sq.window(x, y, tw, th) - window_sum * window_sum / n).max(0.0);
            let denominator = window_var.sqrt() * template_norm;

            let score = if denominator <= f64::EPSILON {
                0.0
            } else {
                // The template is centered, so the window mean drops out.
                let mut numerator = 0.0;
                for ty in 0..th {
                    let row = &image[(y + ty) * fw + x..(y + ty) * fw + x + tw];
                    let trow = &centered[ty * tw..(ty + 1) * tw];
                    numerator += row.iter().zip(trow).map(|(a, b)| a * b).sum::<f64>();
                }
                (numerator / denominator).clamp(-1.0, 1.0)
            };
            best = best.max(score);
        }
    }
    Ok(best)
}

/// Mean structural similarity of two equally sized grayscale images over
/// every full 7x7 window, using sample covariance.
pub fn ssim_score(a: &GrayImage, b: &GrayImage) -> Result<f64> {
    if a.dimensions() != b.dimensions() {
        return Err(Error::Scoring {
            protocol: Protocol::Ssim,
            reason: format!("dimension mismatch {:?} vs {:?}", a.dimensions(), b.dimensions()),
        });
    }
    let (width, height) = (a.width() as usize, a.height() as usize);
    let win = SSIM_WINDOW as usize;
    if width < win || height < win {
        return Err(Error::Scoring {
            protocol: Protocol::Ssim,
            reason: format!("image {}x{} is smaller than the {}x{} window", width, height, win, win),
        });
    }

    let pa = |x: usize, y: usize| f64::from(a.get_pixel(x as u32, y as u32)[0]);
    let pb = |x: usize, y: usize| f64::from(b.get_pixel(x as u32, y as u32)[0]);
    let sa = Integral::new(width, height, pa);
    let sb = Integral::new(width, height, pb);
    let saa = Integral::new(width, height, |x, y| pa(x, y).powi(2));
    let sbb = Integral::new(width, height, |x, y| pb(x, y).powi(2));
    let sab = Integral::new(width, height, |x, y| pa(x, y) * pb(x, y));

    let np = (win * win) as f64;
    let cov_norm = np / (np - 1.0);
    let c1 = (SSIM_K1 * SSIM_DATA_RANGE).powi(2);
    let c2 = (SSIM_K2 * SSIM_DATA_RANGE).powi(2);

    let mut total = 0.0;
    let mut count = 0usize;
    for y in 0..=(height - win) {
        for x in 0..=(width - win) {
            let ux = sa.window(x, y, win, win) / np;
            let uy = sb.window(x, y, win, win) / np;
            let vx = cov_norm * (saa.window(x, y, win, win) / np - ux * ux);
            let vy = cov_norm * (sbb.window(x, y, win, win) / np - uy * uy);
            let vxy = cov_norm * (sab.window(x, y, win, win) / np - ux * uy);

            let numerator = (2.0 * ux * uy + c1) * (2.0 * vxy + c2);
            let denominator = (ux * ux + uy * uy + c1) * (vx + vy + c2);
            total += numerator / denominator;
            count += 1;
        }
    }
    Ok(total / count as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Luma, Rgb};

    fn pattern(width: u32, height: u32) -> RgbImage {
        ImageBuffer::from_fn(width, height, |x, y| {
            let v = ((x * 37 + y * 91 + (x * y) % 17) % 256) as u8;
            Rgb([v, v.wrapping_mul(3), 255 - v])
        })
    }

    fn gray_pattern(width: u32, height: u32, offset: u32) -> GrayImage {
        ImageBuffer::from_fn(width, height, |x, y| {
            Luma([(((x + offset) * 29 + y * 53 + ((x + offset) ^ y)) % 256) as u8])
        })
    }

    #[test]
    fn phash_threshold_conversion() {
        assert!((phash_max_distance(0.95) - 3.2).abs() < 1e-9);
        assert!(phash_matches(3, 0.95));
        assert!(!phash_matches(4, 0.95));
        assert!(phash_matches(0, 1.0));
        assert!(phash_matches(64, 0.0));
    }

    #[test]
    fn template_finds_embedded_patch() {
        let frame = gray_pattern(40, 30, 0);
        let template = imageops::crop_imm(&frame, 11, 7, 9, 8).to_image();
        let score = template_score(&frame, &template).unwrap();
        assert!((score - 1.0).abs() < 1e-9, "score was {score}");
    }

    #[test]
    fn template_scores_stay_in_range() {
        let frame = gray_pattern(30, 20, 0);
        let template = gray_pattern(6, 5, 13);
        let score = template_score(&frame, &template).unwrap();
        assert!((-1.0..=1.0).contains(&score));
    }

    #[test]
    fn template_larger_than_frame_is_a_scoring_error() {
        let frame = gray_pattern(10, 10, 0);
        let template = gray_pattern(12, 4, 0);
        assert!(matches!(
            template_score(&frame, &template),
            Err(Error::Scoring { protocol: Protocol::Template, .. })
        ));
    }

    #[test]
    fn ssim_of_identical_images_is_one() {
        let img = gray_pattern(32, 24, 0);
        let score = ssim_score(&img, &img).unwrap();
        assert!((score - 1.0).abs() < 1e-9);
    }

    #[test]
    fn ssim_drops_for_different_images() {
        let a = gray_pattern(32, 24, 0);
        let mut b = a.clone();
        imageops::invert(&mut b);
        let score = ssim_score(&a, &b).unwrap();
        assert!(score < 0.9);
        assert!((-1.0..=1.0).contains(&score));
    }

    #[test]
    fn ssim_rejects_tiny_images() {
        let img = gray_pattern(5, 5, 0);
        assert!(ssim_score(&img, &img).is_err());
    }

    #[test]
    fn every_protocol_matches_an_identical_frame() {
        let scorer = MatchScorer::new();
        let pixels = pattern(48, 36);
        let reference = scorer.prepare_reference(Path::new("ref.png"), pixels.clone());
        let protocols = ProtocolSet::new(
            Protocol::ALL
                .iter()
                .map(|&protocol| ProtocolCheck { protocol, threshold: 0.95 })
                .collect(),
        );

        let outcomes = scorer.compare_all(&reference, &pixels, &protocols);
        assert_eq!(outcomes.len(), 3);
        for (protocol, outcome) in outcomes {
            let judgment = outcome.unwrap();
            assert!(judgment.is_match, "{protocol} did not match");
            assert!((judgment.score - 1.0).abs() < 1e-6, "{protocol} scored {}", judgment.score);
        }
    }

    #[test]
    fn ssim_resizes_candidate_to_reference_shape() {
        let scorer = MatchScorer::new();
        let reference = scorer.prepare_reference(Path::new("ref.png"), pattern(20, 16));
        let candidate = pattern(64, 48);
        let judgment = scorer.compare(&reference, &candidate, Protocol::Ssim, 0.5).unwrap();
        assert!((-1.0..=1.0).contains(&judgment.score));
    }

    #[test]
    fn protocol_names_round_trip_through_json() {
        assert_eq!(serde_json::to_string(&Protocol::Phash).unwrap(), "\"PHASH\"");
        let parsed: Protocol = serde_json::from_str("\"TEMPLATE\"").unwrap();
        assert_eq!(parsed, Protocol::Template);
    }
}
