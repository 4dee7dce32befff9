//! Frame validation utilities for delivered streams.
//!
//! Sequence checks work on the [`FrameMetadata`] a session hands to its
//! callback. Pattern checks sample luma from a frame buffer; luma is the
//! first byte of each pixel for 8-bit mono and packed YUYV alike, so the
//! same helpers serve the mock cameras and vivid.

use thiserror::Error;

use crate::mock::BAR_LEVELS;
use crate::traits::{FrameMetadata, FrameSize};

/// Tolerance for luma matching (accounts for driver rounding).
const LUMA_TOLERANCE: u8 = 15;

/// Minimum luma change across a frame for it to count as a gradient.
const MIN_GRADIENT_SPAN: u8 = 50;

/// Reasons a delivered stream fails validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// Nothing to validate.
    #[error("cannot validate an empty frame sequence")]
    Empty,
    /// A frame was delivered after a later one.
    #[error("frame {index} out of order: sequence {current} after {previous}")]
    OutOfOrder {
        /// Position in the delivered list.
        index: usize,
        /// Sequence number of the preceding frame.
        previous: u64,
        /// Sequence number of this frame.
        current: u64,
    },
    /// Frames are missing between two deliveries.
    #[error("frame sequence gap at index {index}: expected {expected}, got {actual}")]
    Gap {
        /// Position in the delivered list.
        index: usize,
        /// Sequence number that should have followed.
        expected: u64,
        /// Sequence number that did.
        actual: u64,
    },
    /// The buffer does not hold a full frame of the stamped geometry.
    #[error("frame holds {actual} bytes, expected {expected}")]
    Truncated {
        /// Bytes a full frame needs.
        expected: usize,
        /// Bytes delivered.
        actual: usize,
    },
    /// A sampled pixel lies outside the buffer.
    #[error("no pixel at ({x}, {y})")]
    OutOfBounds {
        /// Column.
        x: u32,
        /// Row.
        y: u32,
    },
    /// The frame content does not match the expected pattern.
    #[error("pattern mismatch: {0}")]
    Pattern(String),
}

/// Result type for validation helpers.
pub type Result<T> = std::result::Result<T, ValidationError>;

/// Check that sequence numbers strictly increase. Gaps (drops) are allowed.
pub fn validate_fifo_order(frames: &[FrameMetadata]) -> Result<()> {
    if frames.is_empty() {
        return Err(ValidationError::Empty);
    }

    for (index, pair) in frames.windows(2).enumerate() {
        if let [prev, curr] = pair {
            if curr.sequence <= prev.sequence {
                return Err(ValidationError::OutOfOrder {
                    index: index + 1,
                    previous: prev.sequence,
                    current: curr.sequence,
                });
            }
        }
    }
    Ok(())
}

/// Check that sequence numbers increment by exactly one.
pub fn validate_frame_sequence(frames: &[FrameMetadata]) -> Result<()> {
    validate_fifo_order(frames)?;

    for (index, pair) in frames.windows(2).enumerate() {
        if let [prev, curr] = pair {
            if curr.sequence != prev.sequence + 1 {
                return Err(ValidationError::Gap {
                    index: index + 1,
                    expected: prev.sequence + 1,
                    actual: curr.sequence,
                });
            }
        }
    }
    Ok(())
}

/// Number of sequence numbers skipped between the first and last frame.
///
/// Dropped frames consume a sequence number, so this equals the number of
/// frames dropped while the list was being delivered.
pub fn count_missing(frames: &[FrameMetadata]) -> u64 {
    frames
        .windows(2)
        .filter_map(|pair| match pair {
            [prev, curr] => Some(curr.sequence.saturating_sub(prev.sequence + 1)),
            _ => None,
        })
        .sum()
}

/// Check that `data` holds a complete frame of the stamped geometry.
pub fn validate_frame_len(
    data: &[u8],
    metadata: &FrameMetadata,
    bytes_per_pixel: usize,
) -> Result<()> {
    let expected = metadata.size.frame_len(bytes_per_pixel);
    if data.len() != metadata.bytes_used || data.len() < expected {
        return Err(ValidationError::Truncated {
            expected,
            actual: data.len(),
        });
    }
    Ok(())
}

/// Luma of the pixel at `(x, y)`.
pub fn luma_at(data: &[u8], size: FrameSize, bytes_per_pixel: usize, x: u32, y: u32) -> Option<u8> {
    if x >= size.width || y >= size.height {
        return None;
    }
    let offset = (y as usize * size.width as usize + x as usize) * bytes_per_pixel;
    data.get(offset).copied()
}

/// Check that a frame shows the eight luma bars of the test pattern.
///
/// The center of each bar on the middle row is sampled and compared with
/// [`LUMA_TOLERANCE`].
pub fn validate_color_bars(data: &[u8], size: FrameSize, bytes_per_pixel: usize) -> Result<()> {
    #[allow(clippy::cast_possible_truncation)]
    let bars = BAR_LEVELS.len() as u32;
    let bar_width = size.width / bars;
    let center_y = size.height / 2;

    for (bar, expected) in (0..bars).zip(BAR_LEVELS) {
        let x = bar * bar_width + bar_width / 2;
        let actual = luma_at(data, size, bytes_per_pixel, x, center_y)
            .ok_or(ValidationError::OutOfBounds { x, y: center_y })?;

        if actual.abs_diff(expected) > LUMA_TOLERANCE {
            return Err(ValidationError::Pattern(format!(
                "bar {bar} at ({x}, {center_y}): expected luma {expected}, got {actual}"
            )));
        }
    }
    Ok(())
}

/// Check that luma rises from left to right along the middle row.
pub fn validate_gradient(data: &[u8], size: FrameSize, bytes_per_pixel: usize) -> Result<()> {
    let center_y = size.height / 2;
    let mut first = None;
    let mut prev: Option<u8> = None;

    for x in (0..size.width).step_by(10) {
        let luma = luma_at(data, size, bytes_per_pixel, x, center_y)
            .ok_or(ValidationError::OutOfBounds { x, y: center_y })?;

        // Allow small decreases due to rounding
        if prev.is_some_and(|prev| luma.saturating_add(1) < prev) {
            return Err(ValidationError::Pattern(format!(
                "gradient not increasing at x={x}: luma {luma}"
            )));
        }
        first.get_or_insert(luma);
        prev = Some(luma);
    }

    let span = match (first, prev) {
        (Some(first), Some(last)) => last.saturating_sub(first),
        _ => 0,
    };
    if span < MIN_GRADIENT_SPAN {
        return Err(ValidationError::Pattern(format!(
            "luma changes by {span} across the frame, expected at least {MIN_GRADIENT_SPAN}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{render_pattern, TestPattern};
    use std::time::Duration;

    fn meta(sequence: u64) -> FrameMetadata {
        FrameMetadata {
            sequence,
            timestamp: Duration::ZERO,
            bytes_used: 0,
            size: FrameSize::new(0, 0),
        }
    }

    fn render(pattern: TestPattern, size: FrameSize) -> Vec<u8> {
        let mut data = vec![0u8; size.frame_len(1)];
        render_pattern(pattern, size, 0, &mut data);
        data
    }

    #[test]
    fn test_validate_color_bars_success() {
        let size = FrameSize::new(640, 480);
        let data = render(TestPattern::ColorBars, size);
        let result = validate_color_bars(&data, size, 1);
        assert!(result.is_ok(), "Color bars validation should succeed: {result:?}");
    }

    #[test]
    fn test_validate_color_bars_wrong_pattern() {
        let size = FrameSize::new(640, 480);
        let data = render(TestPattern::Gradient, size);
        assert!(matches!(
            validate_color_bars(&data, size, 1),
            Err(ValidationError::Pattern(_))
        ));
    }

    #[test]
    fn test_validate_gradient_success() {
        let size = FrameSize::new(640, 480);
        let data = render(TestPattern::Gradient, size);
        let result = validate_gradient(&data, size, 1);
        assert!(result.is_ok(), "Gradient validation should succeed: {result:?}");
    }

    #[test]
    fn test_validate_gradient_wrong_pattern() {
        let size = FrameSize::new(640, 480);
        let data = render(TestPattern::Solid(128), size);
        assert!(validate_gradient(&data, size, 1).is_err());
    }

    #[test]
    fn test_luma_at_packed_pixels() {
        // Two YUYV pixels: Y0 U Y1 V
        let data = [10, 128, 20, 128];
        let size = FrameSize::new(2, 1);
        assert_eq!(luma_at(&data, size, 2, 0, 0), Some(10));
        assert_eq!(luma_at(&data, size, 2, 1, 0), Some(20));
        assert_eq!(luma_at(&data, size, 2, 2, 0), None);
    }

    #[test]
    fn test_validate_frame_sequence() {
        let frames: Vec<_> = (3..8).map(meta).collect();
        assert!(validate_frame_sequence(&frames).is_ok());
        assert_eq!(validate_frame_sequence(&[]), Err(ValidationError::Empty));

        let gapped = [meta(0), meta(1), meta(3)];
        assert_eq!(
            validate_frame_sequence(&gapped),
            Err(ValidationError::Gap {
                index: 2,
                expected: 2,
                actual: 3
            })
        );
    }

    #[test]
    fn test_fifo_order_allows_gaps_but_not_reordering() {
        let gapped = [meta(0), meta(4), meta(9)];
        assert!(validate_fifo_order(&gapped).is_ok());
        assert_eq!(count_missing(&gapped), 7);

        let reordered = [meta(0), meta(2), meta(1)];
        assert_eq!(
            validate_fifo_order(&reordered),
            Err(ValidationError::OutOfOrder {
                index: 2,
                previous: 2,
                current: 1
            })
        );
    }

    #[test]
    fn test_validate_frame_len() {
        let mut metadata = meta(0);
        metadata.size = FrameSize::new(4, 2);
        metadata.bytes_used = 8;
        assert!(validate_frame_len(&[0; 8], &metadata, 1).is_ok());

        metadata.bytes_used = 6;
        assert!(matches!(
            validate_frame_len(&[0; 6], &metadata, 1),
            Err(ValidationError::Truncated { expected: 8, actual: 6 })
        ));
    }
}
