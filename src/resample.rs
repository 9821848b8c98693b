// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2021,2025 lacklustr@protonmail.com https://github.com/eadf

//! Resampling of a frame through a displacement field.
//!
//! Every sample that falls outside of the source frame reads as black (zero),
//! for both interpolation modes.

use super::StabilizerError;
use crate::frame::{DisplacementField, Frame};
use rayon::prelude::*;

/// Pixel interpolation used when looking up the source color
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum InterpolationMode {
    /// Blend the four pixels surrounding the lookup position
    #[default]
    Bilinear,
    /// Take the pixel closest to the lookup position
    Nearest,
}

/// Warps a frame with a displacement field: destination pixel (`x`,`y`) takes
/// the color found at (`x`,`y`) + `field[y][x]` in the source frame.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameResampler {
    pub mode: InterpolationMode,
}

impl FrameResampler {
    pub fn new(mode: InterpolationMode) -> Self {
        Self { mode }
    }

    /// Produce the warped copy of `source`, same size and channel count.
    /// ```
    /// # use libstabilizer::{prelude::*, frame::{DisplacementField, Frame, FrameSize, Point2D}};
    /// # fn main() -> Result<(), StabilizerError> {
    /// let size = FrameSize::new(3, 1);
    /// let source = Frame::new(size, 1, vec![10.0, 20.0, 30.0])?;
    /// let field = DisplacementField::new(size, vec![Point2D::new(1.0, 0.0); 3])?;
    /// let warped = FrameResampler::new(InterpolationMode::Nearest).resample(&source, &field)?;
    /// assert_eq!(warped.as_slice(), &[20.0, 30.0, 0.0]);
    /// # Ok(())}
    /// ```
    pub fn resample(
        &self,
        source: &Frame,
        field: &DisplacementField,
    ) -> Result<Frame, StabilizerError> {
        if source.size() != field.size() {
            return Err(StabilizerError::DimensionMismatch(format!(
                "frame {}x{} vs displacement field {}x{}",
                source.width(),
                source.height(),
                field.size().width,
                field.size().height
            )));
        }
        let mut dst = Frame::zeros(source.size(), source.channels());
        let stride = dst.row_stride();
        if stride == 0 {
            return Ok(dst);
        }
        let channels = source.channels();
        let width = source.width();

        // parallelize by rows, every destination pixel is written exactly once
        dst.as_slice_mut()
            .par_chunks_exact_mut(stride)
            .zip(field.as_slice().par_chunks_exact(width))
            .enumerate()
            .for_each(|(i, (dst_row, field_row))| {
                dst_row
                    .chunks_exact_mut(channels)
                    .zip(field_row.iter())
                    .enumerate()
                    .for_each(|(j, (dst_pixel, d))| {
                        let x = j as f32 + d.x;
                        let y = i as f32 + d.y;
                        match self.mode {
                            InterpolationMode::Bilinear => bilinear(source, x, y, dst_pixel),
                            InterpolationMode::Nearest => nearest(source, x, y, dst_pixel),
                        }
                    });
            });
        Ok(dst)
    }
}

/// Four neighbour blend around (`x`,`y`). The whole pixel is black when the
/// top-left neighbour lies outside of the frame, any other missing neighbour
/// contributes black.
#[inline]
fn bilinear(source: &Frame, x: f32, y: f32, out: &mut [f32]) {
    if !(x.is_finite() && y.is_finite()) {
        return;
    }
    let (fx, fy) = (x.floor(), y.floor());
    let (ix, iy) = (fx as i64, fy as i64);
    let Some(p00) = source.pixel(ix, iy) else {
        return;
    };
    let tail_x = x - fx;
    let tail_y = y - fy;
    let p10 = source.pixel(ix + 1, iy);
    let p01 = source.pixel(ix, iy + 1);
    let p11 = source.pixel(ix + 1, iy + 1);

    let sample = |p: Option<&[f32]>, c: usize| p.map_or(0.0, |p| p[c]);
    for (c, v) in out.iter_mut().enumerate() {
        *v = (1.0 - tail_y) * ((1.0 - tail_x) * p00[c] + tail_x * sample(p10, c))
            + tail_y * ((1.0 - tail_x) * sample(p01, c) + tail_x * sample(p11, c));
    }
}

#[inline]
fn nearest(source: &Frame, x: f32, y: f32, out: &mut [f32]) {
    if !(x.is_finite() && y.is_finite()) {
        return;
    }
    if let Some(p) = source.pixel(x.round() as i64, y.round() as i64) {
        out.copy_from_slice(p);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{FrameSize, Point2D};
    use approx::assert_abs_diff_eq;

    fn gradient(size: FrameSize, channels: usize) -> Frame {
        let data = (0..size.area() * channels).map(|v| (v % 251) as f32).collect();
        Frame::new(size, channels, data).unwrap()
    }

    #[test]
    fn zero_field_is_identity() {
        let size = FrameSize::new(17, 11);
        let source = gradient(size, 3);
        let field = DisplacementField::zeros(size);
        for mode in [InterpolationMode::Bilinear, InterpolationMode::Nearest] {
            let warped = FrameResampler::new(mode).resample(&source, &field).unwrap();
            assert_eq!(warped, source, "{mode:?}");
        }
    }

    #[test]
    fn integer_shift_moves_pixels() {
        let size = FrameSize::new(5, 4);
        let source = gradient(size, 1);
        let field =
            DisplacementField::new(size, vec![Point2D::new(-1.0, 2.0); size.area()]).unwrap();
        let warped = FrameResampler::default().resample(&source, &field).unwrap();
        for y in 0..4_i64 {
            for x in 0..5_i64 {
                let expected = source.pixel(x - 1, y + 2).map_or(0.0, |p| p[0]);
                assert_eq!(warped.pixel(x, y).unwrap()[0], expected, "({x},{y})");
            }
        }
    }

    #[test]
    fn half_pixel_shift_blends_neighbours() {
        let size = FrameSize::new(2, 2);
        let source = Frame::new(size, 1, vec![0.0, 10.0, 20.0, 30.0]).unwrap();
        let field = DisplacementField::new(size, vec![Point2D::new(0.5, 0.5); 4]).unwrap();
        let warped = FrameResampler::default().resample(&source, &field).unwrap();
        assert_abs_diff_eq!(warped.as_slice()[0], 15.0, epsilon = 1e-5);
        // the right and bottom neighbours are outside, they count as black
        // 0.5 * (0.5 * 10 + 0.5 * 0) + 0.5 * (0.5 * 30 + 0.5 * 0)
        assert_abs_diff_eq!(warped.as_slice()[1], 10.0, epsilon = 1e-5);
    }

    #[test]
    fn out_of_frame_lookups_are_black() {
        let size = FrameSize::new(4, 4);
        let source = Frame::new(size, 1, vec![100.0; 16]).unwrap();
        for shift in [
            Point2D::new(10.0, 0.0),
            Point2D::new(-10.0, 0.0),
            Point2D::new(0.0, 4.0),
            Point2D::new(0.0, -4.5),
            Point2D::new(f32::NAN, 0.0),
        ] {
            let field = DisplacementField::new(size, vec![shift; 16]).unwrap();
            for mode in [InterpolationMode::Bilinear, InterpolationMode::Nearest] {
                let warped = FrameResampler::new(mode).resample(&source, &field).unwrap();
                assert!(warped.as_slice().iter().all(|v| *v == 0.0), "{shift:?} {mode:?}");
            }
        }
    }

    #[test]
    fn nearest_rounds_lookup_position() {
        let size = FrameSize::new(3, 1);
        let source = Frame::new(size, 1, vec![1.0, 2.0, 3.0]).unwrap();
        let field = DisplacementField::new(size, vec![Point2D::new(0.6, 0.2); 3]).unwrap();
        let warped = FrameResampler::new(InterpolationMode::Nearest)
            .resample(&source, &field)
            .unwrap();
        assert_eq!(warped.as_slice(), &[2.0, 3.0, 0.0]);
    }

    #[test]
    fn mismatched_field_is_rejected() {
        let source = Frame::zeros(FrameSize::new(4, 4), 3);
        let field = DisplacementField::zeros(FrameSize::new(4, 3));
        assert!(matches!(
            FrameResampler::default().resample(&source, &field),
            Err(StabilizerError::DimensionMismatch(_))
        ));
    }
}
