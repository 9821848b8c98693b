// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2021,2025 lacklustr@protonmail.com https://github.com/eadf

//! Pixel containers shared by every stage of the pipeline.
//!
//! All images are stored row-major with interleaved channels, the same memory
//! layout as a continuous OpenCV `Mat`.

use super::StabilizerError;
use std::ops::{Add, AddAssign, Mul, Sub};

/// A floating point planar coordinate, `x` to the right and `y` down.
#[derive(Debug, Default, Copy, Clone, PartialEq)]
pub struct Point2D {
    pub x: f32,
    pub y: f32,
}

impl Point2D {
    pub const ZERO: Point2D = Point2D { x: 0.0, y: 0.0 };

    #[inline]
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    /// Euclidean length of this point seen as a vector
    #[inline]
    pub fn norm(&self) -> f32 {
        (self.x * self.x + self.y * self.y).sqrt()
    }

    #[inline]
    pub fn distance(&self, other: Point2D) -> f32 {
        (*self - other).norm()
    }

    /// L1 distance, used when comparing motion vectors
    #[inline]
    pub fn manhattan(&self, other: Point2D) -> f32 {
        (self.x - other.x).abs() + (self.y - other.y).abs()
    }
}

impl Add for Point2D {
    type Output = Point2D;
    #[inline]
    fn add(self, rhs: Point2D) -> Point2D {
        Point2D::new(self.x + rhs.x, self.y + rhs.y)
    }
}

impl AddAssign for Point2D {
    #[inline]
    fn add_assign(&mut self, rhs: Point2D) {
        self.x += rhs.x;
        self.y += rhs.y;
    }
}

impl Sub for Point2D {
    type Output = Point2D;
    #[inline]
    fn sub(self, rhs: Point2D) -> Point2D {
        Point2D::new(self.x - rhs.x, self.y - rhs.y)
    }
}

impl Mul<f32> for Point2D {
    type Output = Point2D;
    #[inline]
    fn mul(self, rhs: f32) -> Point2D {
        Point2D::new(self.x * rhs, self.y * rhs)
    }
}

/// Width and height of a frame in pixels
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct FrameSize {
    pub width: usize,
    pub height: usize,
}

impl FrameSize {
    pub const fn new(width: usize, height: usize) -> Self {
        Self { width, height }
    }

    #[inline]
    pub fn area(&self) -> usize {
        self.width * self.height
    }

    /// The larger of width and height
    #[inline]
    pub fn max_dimension(&self) -> f32 {
        self.width.max(self.height) as f32
    }

    /// Length of the frame diagonal, the largest possible distance between two pixels
    #[inline]
    pub fn diagonal(&self) -> f32 {
        let w = self.width as f32;
        let h = self.height as f32;
        (w * w + h * h).sqrt()
    }

    #[inline]
    pub fn contains(&self, x: i64, y: i64) -> bool {
        x >= 0 && y >= 0 && (x as usize) < self.width && (y as usize) < self.height
    }
}

/// An axis aligned rectangle, in pixels
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct Roi {
    pub x: usize,
    pub y: usize,
    pub width: usize,
    pub height: usize,
}

impl Roi {
    pub const fn new(x: usize, y: usize, width: usize, height: usize) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// The rectangle covering the whole frame
    pub fn full(size: FrameSize) -> Self {
        Self::new(0, 0, size.width, size.height)
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Clip the rectangle so that it lies inside `size`
    pub fn clamp_to(&self, size: FrameSize) -> Self {
        let x = self.x.min(size.width);
        let y = self.y.min(size.height);
        let width = self.width.min(size.width - x);
        let height = self.height.min(size.height - y);
        Self::new(x, y, width, height)
    }

    pub fn contains(&self, p: Point2D) -> bool {
        p.x >= self.x as f32
            && p.y >= self.y as f32
            && p.x < (self.x + self.width) as f32
            && p.y < (self.y + self.height) as f32
    }

    /// A single channel mask of `size` with 255 inside the rectangle and 0 elsewhere.
    /// ```
    /// # use libstabilizer::frame::{FrameSize, Roi};
    /// let mask = Roi::new(1, 1, 2, 1).mask(FrameSize::new(4, 3));
    /// assert_eq!(mask.data(), &[0, 0, 0, 0, 0, 255, 255, 0, 0, 0, 0, 0]);
    /// ```
    pub fn mask(&self, size: FrameSize) -> GreyImage {
        let roi = self.clamp_to(size);
        let mut data = vec![0_u8; size.area()];
        for row in data
            .chunks_exact_mut(size.width.max(1))
            .skip(roi.y)
            .take(roi.height)
        {
            row[roi.x..roi.x + roi.width].fill(255);
        }
        GreyImage { size, data }
    }
}

/// A single channel byte image, the input format of the detection and tracking collaborators
#[derive(Debug, Clone, PartialEq)]
pub struct GreyImage {
    size: FrameSize,
    data: Vec<u8>,
}

impl GreyImage {
    pub fn new(size: FrameSize, data: Vec<u8>) -> Result<Self, StabilizerError> {
        if data.len() != size.area() {
            return Err(StabilizerError::DimensionMismatch(format!(
                "grey image {}x{} needs {} samples, got {}",
                size.width,
                size.height,
                size.area(),
                data.len()
            )));
        }
        Ok(Self { size, data })
    }

    pub fn size(&self) -> FrameSize {
        self.size
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

/// A decoded video frame in byte precision, as delivered by a video source.
/// Three channel frames are expected in BGR order.
#[derive(Debug, Clone, PartialEq)]
pub struct RawFrame {
    size: FrameSize,
    channels: usize,
    data: Vec<u8>,
}

impl RawFrame {
    pub fn new(size: FrameSize, channels: usize, data: Vec<u8>) -> Result<Self, StabilizerError> {
        if channels == 0 || data.len() != size.area() * channels {
            return Err(StabilizerError::DimensionMismatch(format!(
                "raw frame {}x{}x{} does not match {} samples",
                size.width,
                size.height,
                channels,
                data.len()
            )));
        }
        Ok(Self {
            size,
            channels,
            data,
        })
    }

    pub fn size(&self) -> FrameSize {
        self.size
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Luma conversion (BT.601 weights, BGR order for three or more channels)
    /// ```
    /// # use libstabilizer::frame::{FrameSize, RawFrame};
    /// let raw = RawFrame::new(FrameSize::new(2, 1), 3, vec![255, 255, 255, 0, 0, 255]).unwrap();
    /// assert_eq!(raw.to_grey().data(), &[255, 76]);
    /// ```
    pub fn to_grey(&self) -> GreyImage {
        let data = if self.channels < 3 {
            self.data.iter().step_by(self.channels).copied().collect()
        } else {
            self.data
                .chunks_exact(self.channels)
                .map(|px| {
                    let luma = 0.114 * px[0] as f32 + 0.587 * px[1] as f32 + 0.299 * px[2] as f32;
                    luma.round().clamp(0.0, 255.0) as u8
                })
                .collect()
        };
        GreyImage {
            size: self.size,
            data,
        }
    }
}

/// A floating point image. Sample values keep the 0..255 range of the source bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    size: FrameSize,
    channels: usize,
    data: Vec<f32>,
}

impl Frame {
    pub fn new(size: FrameSize, channels: usize, data: Vec<f32>) -> Result<Self, StabilizerError> {
        if channels == 0 || data.len() != size.area() * channels {
            return Err(StabilizerError::DimensionMismatch(format!(
                "frame {}x{}x{} does not match {} samples",
                size.width,
                size.height,
                channels,
                data.len()
            )));
        }
        Ok(Self {
            size,
            channels,
            data,
        })
    }

    /// An all black frame
    pub fn zeros(size: FrameSize, channels: usize) -> Self {
        Self {
            size,
            channels,
            data: vec![0.0; size.area() * channels],
        }
    }

    pub fn from_raw(raw: &RawFrame) -> Self {
        Self {
            size: raw.size,
            channels: raw.channels,
            data: raw.data.iter().map(|&v| v as f32).collect(),
        }
    }

    /// Round and saturate back to byte precision
    pub fn to_raw(&self) -> RawFrame {
        RawFrame {
            size: self.size,
            channels: self.channels,
            data: self
                .data
                .iter()
                .map(|v| v.round().clamp(0.0, 255.0) as u8)
                .collect(),
        }
    }

    pub fn size(&self) -> FrameSize {
        self.size
    }

    pub fn width(&self) -> usize {
        self.size.width
    }

    pub fn height(&self) -> usize {
        self.size.height
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    pub fn as_slice_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// Number of samples in one row
    #[inline]
    pub fn row_stride(&self) -> usize {
        self.size.width * self.channels
    }

    /// The samples of the pixel at (`x`,`y`), `None` when outside of the frame
    #[inline]
    pub fn pixel(&self, x: i64, y: i64) -> Option<&[f32]> {
        if self.size.contains(x, y) {
            let base = (y as usize * self.size.width + x as usize) * self.channels;
            Some(&self.data[base..base + self.channels])
        } else {
            None
        }
    }

    /// Overwrite the pixel at (`x`,`y`), silently ignored when outside of the frame
    pub fn put_pixel(&mut self, x: i64, y: i64, value: &[f32]) {
        if self.size.contains(x, y) {
            let base = (y as usize * self.size.width + x as usize) * self.channels;
            for (c, v) in self.data[base..base + self.channels].iter_mut().enumerate() {
                *v = value.get(c).copied().unwrap_or(0.0);
            }
        }
    }

    /// Returns an error unless `other` has the same size and channel count
    pub fn check_same_shape(&self, other: &Frame) -> Result<(), StabilizerError> {
        if self.size != other.size || self.channels != other.channels {
            return Err(StabilizerError::DimensionMismatch(format!(
                "{}x{}x{} vs {}x{}x{}",
                self.size.width,
                self.size.height,
                self.channels,
                other.size.width,
                other.size.height,
                other.channels
            )));
        }
        Ok(())
    }
}

/// One displacement vector per pixel: the offset to add to a destination pixel
/// coordinate to find where its color is sampled from.
#[derive(Debug, Clone, PartialEq)]
pub struct DisplacementField {
    size: FrameSize,
    vectors: Vec<Point2D>,
}

impl DisplacementField {
    /// A field that leaves every pixel in place
    pub fn zeros(size: FrameSize) -> Self {
        Self {
            size,
            vectors: vec![Point2D::ZERO; size.area()],
        }
    }

    pub fn new(size: FrameSize, vectors: Vec<Point2D>) -> Result<Self, StabilizerError> {
        if vectors.len() != size.area() {
            return Err(StabilizerError::DimensionMismatch(format!(
                "displacement field {}x{} needs {} vectors, got {}",
                size.width,
                size.height,
                size.area(),
                vectors.len()
            )));
        }
        Ok(Self { size, vectors })
    }

    pub fn size(&self) -> FrameSize {
        self.size
    }

    pub fn as_slice(&self) -> &[Point2D] {
        &self.vectors
    }

    /// Displacement at column `x`, row `y`
    #[inline]
    pub fn get(&self, x: usize, y: usize) -> Point2D {
        self.vectors[y * self.size.width + x]
    }
}
