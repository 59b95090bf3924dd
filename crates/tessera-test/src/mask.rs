//! Per-pixel error masks for comparing rendered images.
//!
//! A mask stores, for every pixel, the largest difference allowed in any
//! 8-bit channel. Solid fills and exact-coverage checks use a zero mask;
//! interpolated gradients allow one step of rounding.

use image::{ImageBuffer, Rgba, RgbaImage};
use tessera_core::Rect2D;

use crate::{Result, TestError};

/// Tolerance value that accepts any difference.
pub const IGNORE: u8 = u8::MAX;

/// Allowed per-channel error for each pixel of an image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorMask {
    width: u32,
    height: u32,
    tolerance: Vec<u8>,
}

impl ErrorMask {
    /// Mask with the same tolerance everywhere.
    pub fn uniform(width: u32, height: u32, tolerance: u8) -> Self {
        Self {
            width,
            height,
            tolerance: vec![tolerance; (width * height) as usize],
        }
    }

    /// Mask that requires every pixel to match exactly.
    pub fn exact(width: u32, height: u32) -> Self {
        Self::uniform(width, height, 0)
    }

    /// Set the tolerance of every pixel inside `rect`.
    #[must_use]
    pub fn with_region(mut self, rect: Rect2D, tolerance: u8) -> Self {
        let rect = rect.intersect(Rect2D::new(0, 0, self.width, self.height));
        for y in 0..rect.extent.height {
            for x in 0..rect.extent.width {
                let px = rect.offset.x as u32 + x;
                let py = rect.offset.y as u32 + y;
                self.tolerance[(py * self.width + px) as usize] = tolerance;
            }
        }
        self
    }

    /// Exclude `rect` from comparison.
    #[must_use]
    pub fn ignore(self, rect: Rect2D) -> Self {
        self.with_region(rect, IGNORE)
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn tolerance(&self, x: u32, y: u32) -> u8 {
        self.tolerance[(y * self.width + x) as usize]
    }
}

/// Result of a masked comparison.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaskReport {
    /// Pixels whose error exceeded their tolerance.
    pub failed_pixels: u64,
    /// Largest channel error seen outside ignored pixels.
    pub max_error: u8,
    /// First failing pixel in row-major order.
    pub first_failure: Option<(u32, u32)>,
}

impl MaskReport {
    pub fn passed(&self) -> bool {
        self.failed_pixels == 0
    }
}

fn channel_error(a: &Rgba<u8>, b: &Rgba<u8>) -> u8 {
    a.0.iter()
        .zip(b.0.iter())
        .map(|(&ca, &cb)| ca.abs_diff(cb))
        .max()
        .unwrap_or(0)
}

/// Compare `actual` against `expected` under `mask`.
///
/// Fails only when the dimensions disagree; pixel mismatches are counted
/// in the report.
pub fn compare_with_mask(
    expected: &RgbaImage,
    actual: &RgbaImage,
    mask: &ErrorMask,
) -> Result<MaskReport> {
    if expected.dimensions() != actual.dimensions() || expected.dimensions() != mask.dimensions() {
        return Err(TestError::ImageComparison(format!(
            "Image dimensions don't match: expected {:?}, actual {:?}, mask {:?}",
            expected.dimensions(),
            actual.dimensions(),
            mask.dimensions()
        )));
    }

    let mut report = MaskReport::default();
    for (x, y, pe) in expected.enumerate_pixels() {
        let tolerance = mask.tolerance(x, y);
        if tolerance == IGNORE {
            continue;
        }
        let error = channel_error(pe, actual.get_pixel(x, y));
        report.max_error = report.max_error.max(error);
        if error > tolerance {
            report.failed_pixels += 1;
            report.first_failure.get_or_insert((x, y));
        }
    }
    Ok(report)
}

/// Visual diff: failing pixels in red, the rest dimmed.
pub fn diff_image(expected: &RgbaImage, actual: &RgbaImage, mask: &ErrorMask) -> RgbaImage {
    let (width, height) = expected.dimensions();
    ImageBuffer::from_fn(width, height, |x, y| {
        let pe = expected.get_pixel(x, y);
        let tolerance = mask.tolerance(x, y);
        if tolerance != IGNORE && channel_error(pe, actual.get_pixel(x, y)) > tolerance {
            Rgba([255, 0, 0, 255])
        } else {
            Rgba([pe[0] / 2, pe[1] / 2, pe[2] / 2, 255])
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid(width: u32, height: u32, color: [u8; 4]) -> RgbaImage {
        ImageBuffer::from_pixel(width, height, Rgba(color))
    }

    #[test]
    fn exact_mask_counts_every_difference() {
        let expected = solid(4, 4, [255, 0, 0, 255]);
        let mut actual = expected.clone();
        actual.put_pixel(1, 2, Rgba([254, 0, 0, 255]));
        actual.put_pixel(3, 3, Rgba([0, 0, 0, 255]));

        let report = compare_with_mask(&expected, &actual, &ErrorMask::exact(4, 4)).unwrap();
        assert_eq!(report.failed_pixels, 2);
        assert_eq!(report.max_error, 255);
        assert_eq!(report.first_failure, Some((1, 2)));
        assert!(!report.passed());
    }

    #[test]
    fn tolerance_accepts_rounding() {
        let expected = solid(2, 2, [128, 64, 0, 255]);
        let actual = solid(2, 2, [127, 65, 0, 255]);
        let report = compare_with_mask(&expected, &actual, &ErrorMask::uniform(2, 2, 1)).unwrap();
        assert!(report.passed());
        assert_eq!(report.max_error, 1);
    }

    #[test]
    fn ignored_region_is_skipped() {
        let expected = solid(4, 4, [0, 0, 0, 255]);
        let mut actual = expected.clone();
        actual.put_pixel(0, 0, Rgba([200, 200, 200, 255]));
        let mask = ErrorMask::exact(4, 4).ignore(Rect2D::new(0, 0, 1, 1));

        let report = compare_with_mask(&expected, &actual, &mask).unwrap();
        assert!(report.passed());
        assert_eq!(report.max_error, 0);
    }

    #[test]
    fn dimension_mismatch_fails() {
        let result = compare_with_mask(
            &solid(2, 2, [0; 4]),
            &solid(3, 2, [0; 4]),
            &ErrorMask::exact(2, 2),
        );
        assert!(matches!(result, Err(TestError::ImageComparison(_))));
    }

    #[test]
    fn diff_marks_failures() {
        let expected = solid(2, 1, [100, 100, 100, 255]);
        let mut actual = expected.clone();
        actual.put_pixel(1, 0, Rgba([0, 0, 0, 255]));
        let diff = diff_image(&expected, &actual, &ErrorMask::exact(2, 1));
        assert_eq!(diff.get_pixel(0, 0), &Rgba([50, 50, 50, 255]));
        assert_eq!(diff.get_pixel(1, 0), &Rgba([255, 0, 0, 255]));
    }
}
