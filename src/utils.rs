// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2021,2025 lacklustr@protonmail.com https://github.com/eadf

//! OpenCV implementations of the pipeline collaborators, and conversions between
//! `opencv::core::Mat` and the pixel containers of this crate.

use super::{DetectionParameters, StabilizerError};
use crate::diagnostics::ImageSink;
use crate::frame::{Frame, FrameSize, GreyImage, Point2D, RawFrame, Roi};
use crate::tracking::{FeatureDetector, FlowResult, SparseTracker, VideoSource};
use opencv::core::{AlgorithmHint, Mat, MatTrait, MatTraitConst, Point2f, Scalar, Size, Vector};
use opencv::prelude::VideoCaptureTrait;
use opencv::prelude::VideoCaptureTraitConst;
use opencv::{imgcodecs, imgproc, video, videoio};
use std::path::{Path, PathBuf};

/// Extension trait for more ergonomic Mat conversions
pub trait MatExt {
    /// Convert matrix to specified type with default scaling
    ///
    /// # Arguments
    /// * `target_type` - OpenCV type constant (e.g., CV_8U, CV_32F)
    fn convert(&self, rtype: i32, alpha: f64, beta: f64) -> Result<Mat, StabilizerError>;
}

impl MatExt for Mat {
    fn convert(&self, rtype: i32, alpha: f64, beta: f64) -> Result<Mat, StabilizerError> {
        let mut dst = Mat::default();
        self.convert_to(&mut dst, rtype, alpha, beta)?;
        Ok(dst)
    }
}

/// OpenCV wants a `&str` path, paths that are not valid Unicode are rejected
/// with `StabilizerError::InvalidPathEncoding`.
#[inline(always)]
fn path_str(path: &Path) -> Result<&str, StabilizerError> {
    path.to_str()
        .ok_or_else(|| StabilizerError::InvalidPathEncoding(path.to_path_buf()))
}

fn mat_size(mat: &Mat) -> Result<FrameSize, StabilizerError> {
    let size = mat.size()?;
    Ok(FrameSize::new(
        size.width.max(0) as usize,
        size.height.max(0) as usize,
    ))
}

fn bytes_to_mat(size: FrameSize, typ: i32, data: &[u8]) -> Result<Mat, StabilizerError> {
    let mut mat = Mat::new_rows_cols_with_default(
        size.height as i32,
        size.width as i32,
        typ,
        Scalar::all(0.0),
    )?;
    let dst = mat.data_bytes_mut()?;
    if dst.len() != data.len() {
        return Err(StabilizerError::DimensionMismatch(format!(
            "Mat holds {} bytes, image has {}",
            dst.len(),
            data.len()
        )));
    }
    dst.copy_from_slice(data);
    Ok(mat)
}

/// Copies a decoded `Mat` into a `RawFrame`.
///
/// Deeper than 8 bit images are scaled down to 8 bit, BGRA is converted to BGR.
pub fn mat_to_raw_frame(mat: &Mat) -> Result<RawFrame, StabilizerError> {
    let mut mat = if mat.depth() != opencv::core::CV_8U {
        let alpha = match mat.depth() {
            opencv::core::CV_16U => 1.0 / 257.0,
            opencv::core::CV_32F | opencv::core::CV_64F => 255.0,
            _ => 1.0,
        };
        mat.convert(opencv::core::CV_8U, alpha, 0.0)?
    } else {
        mat.try_clone()?
    };
    if mat.channels() == 4 {
        let mut bgr = Mat::default();
        imgproc::cvt_color(
            &mat,
            &mut bgr,
            imgproc::COLOR_BGRA2BGR,
            0,
            AlgorithmHint::ALGO_HINT_DEFAULT,
        )?;
        mat = bgr;
    }
    if !mat.is_continuous() {
        mat = mat.try_clone()?;
    }
    RawFrame::new(
        mat_size(&mat)?,
        mat.channels().max(0) as usize,
        mat.data_bytes()?.to_vec(),
    )
}

/// A `CV_8UC1` copy of `grey`
pub fn grey_to_mat(grey: &GreyImage) -> Result<Mat, StabilizerError> {
    bytes_to_mat(grey.size(), opencv::core::CV_8UC1, grey.data())
}

/// An 8 bit copy of `raw`, one, three or four channels
pub fn raw_frame_to_mat(raw: &RawFrame) -> Result<Mat, StabilizerError> {
    let typ = match raw.channels() {
        1 => opencv::core::CV_8UC1,
        3 => opencv::core::CV_8UC3,
        4 => opencv::core::CV_8UC4,
        n => {
            return Err(StabilizerError::InvalidParams(format!(
                "{n} channel images can not be converted to Mat"
            )));
        }
    };
    bytes_to_mat(raw.size(), typ, raw.data())
}

/// A rounded and saturated 8 bit copy of `frame`
pub fn frame_to_mat(frame: &Frame) -> Result<Mat, StabilizerError> {
    raw_frame_to_mat(&frame.to_raw())
}

/// Write `frame` to an image file, the format is deduced from the file extension.
///
/// # Errors
/// `InvalidPathEncoding` for non Unicode paths, `SinkWriteFailure` if OpenCV
/// refuses to write the file.
pub fn imwrite<P: AsRef<Path>>(path: P, frame: &Frame) -> Result<(), StabilizerError> {
    let path_str = path_str(path.as_ref())?;
    let mat = frame_to_mat(frame)?;
    if !imgcodecs::imwrite(path_str, &mat, &Vector::new())? {
        return Err(StabilizerError::SinkWriteFailure(path_str.to_string()));
    }
    Ok(())
}

/// A video file decoded by `opencv::videoio::VideoCapture`
pub struct OpenCvVideoSource {
    capture: videoio::VideoCapture,
    frame_count: usize,
}

impl OpenCvVideoSource {
    /// Open a video file
    /// ```no_run
    /// # use libstabilizer::{prelude::*, tracking::VideoSource, utils::OpenCvVideoSource};
    /// # fn main() -> Result<(), StabilizerError> {
    /// let source = OpenCvVideoSource::open("mini_waterfall.avi")?;
    /// println!("{} frames", source.frame_count()?);
    /// # Ok(())}
    /// ```
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StabilizerError> {
        let capture =
            videoio::VideoCapture::from_file(path_str(path.as_ref())?, videoio::CAP_ANY)?;
        if !capture.is_opened()? {
            return Err(StabilizerError::IoError(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("could not open video {}", path.as_ref().display()),
            )));
        }
        let frame_count = capture.get(videoio::CAP_PROP_FRAME_COUNT)?.max(0.0) as usize;
        Ok(Self {
            capture,
            frame_count,
        })
    }
}

impl VideoSource for OpenCvVideoSource {
    fn frame_count(&self) -> Result<usize, StabilizerError> {
        Ok(self.frame_count)
    }

    fn read_frame(&mut self) -> Result<Option<RawFrame>, StabilizerError> {
        let mut mat = Mat::default();
        if !self.capture.read(&mut mat)? || mat.empty() {
            return Ok(None);
        }
        mat_to_raw_frame(&mat).map(Some)
    }

    /// Skips frames with `grab()`, without decoding them
    fn skip_frames(&mut self, n: usize) -> Result<(), StabilizerError> {
        for skipped in 0..n {
            if !self.capture.grab()? {
                return Err(StabilizerError::SourceExhausted {
                    requested: n,
                    available: skipped,
                });
            }
        }
        Ok(())
    }
}

/// Shi-Tomasi (or Harris) corners by `opencv::imgproc::good_features_to_track()`
#[derive(Debug, Default, Clone, Copy)]
pub struct GoodFeaturesDetector {
    pub params: DetectionParameters,
}

impl GoodFeaturesDetector {
    pub fn new(params: DetectionParameters) -> Self {
        Self { params }
    }
}

impl FeatureDetector for GoodFeaturesDetector {
    fn detect(
        &mut self,
        grey: &GreyImage,
        roi: Roi,
        max_features: usize,
    ) -> Result<Vec<Point2D>, StabilizerError> {
        let image = grey_to_mat(grey)?;
        let mask = grey_to_mat(&roi.mask(grey.size()))?;
        let mut corners = Vector::<Point2f>::new();
        imgproc::good_features_to_track(
            &image,
            &mut corners,
            max_features.min(i32::MAX as usize) as i32,
            self.params.quality_level,
            self.params.min_distance,
            &mask,
            self.params.block_size,
            self.params.use_harris_detector,
            self.params.harris_k,
        )?;
        Ok(corners.iter().map(|p| Point2D::new(p.x, p.y)).collect())
    }
}

/// Pyramidal Lucas-Kanade sparse optical flow by `opencv::video::calc_optical_flow_pyr_lk()`
#[derive(Debug, Clone, Copy)]
pub struct PyrLkTracker {
    /// Search window size at each pyramid level
    pub window_size: i32,
    /// Number of pyramid levels above the full resolution image
    pub max_level: i32,
    /// parameter used as `opencv::core::TermCriteria::max_count`
    pub max_count: Option<i32>,
    /// parameter used as `opencv::core::TermCriteria::epsilon`
    pub epsilon: Option<f64>,
}

impl Default for PyrLkTracker {
    fn default() -> Self {
        Self {
            window_size: 21,
            max_level: 3,
            max_count: Some(30),
            epsilon: Some(0.01),
        }
    }
}

impl From<PyrLkTracker> for Result<opencv::core::TermCriteria, StabilizerError> {
    /// Converts from a `PyrLkTracker` to TermCriteria
    /// ```
    /// # use libstabilizer::{prelude::*, utils::PyrLkTracker, opencv::core::TermCriteria_Type};
    /// let t: Result<opencv::core::TermCriteria, StabilizerError> = PyrLkTracker {
    ///     max_count: None,
    ///     epsilon: Some(0.1),
    ///     ..Default::default()
    /// }
    /// .into();
    /// let t = t.unwrap();
    /// assert_eq!(t.epsilon, 0.1);
    /// assert_eq!(t.typ, TermCriteria_Type::EPS as i32);
    /// ```
    fn from(r: PyrLkTracker) -> Result<opencv::core::TermCriteria, StabilizerError> {
        let mut rv = opencv::core::TermCriteria::default()?;
        if let Some(max_count) = r.max_count {
            rv.typ |= opencv::core::TermCriteria_Type::COUNT as i32;
            rv.max_count = max_count;
        }
        if let Some(epsilon) = r.epsilon {
            rv.typ |= opencv::core::TermCriteria_Type::EPS as i32;
            rv.epsilon = epsilon;
        }
        Ok(rv)
    }
}

impl SparseTracker for PyrLkTracker {
    fn track(
        &mut self,
        prev: &GreyImage,
        next: &GreyImage,
        points: &[Point2D],
    ) -> Result<Vec<FlowResult>, StabilizerError> {
        if points.is_empty() {
            return Ok(Vec::new());
        }
        let prev = grey_to_mat(prev)?;
        let next = grey_to_mat(next)?;
        let prev_pts: Vector<Point2f> = points.iter().map(|p| Point2f::new(p.x, p.y)).collect();
        let mut next_pts = Vector::<Point2f>::new();
        let mut status = Vector::<u8>::new();
        let mut err = Vector::<f32>::new();
        let criteria: Result<opencv::core::TermCriteria, StabilizerError> = (*self).into();
        video::calc_optical_flow_pyr_lk(
            &prev,
            &next,
            &prev_pts,
            &mut next_pts,
            &mut status,
            &mut err,
            Size::new(self.window_size, self.window_size),
            self.max_level,
            criteria?,
            0,
            1e-4,
        )?;
        if next_pts.len() != points.len() || status.len() != points.len() {
            return Err(StabilizerError::ProcessingError(format!(
                "optical flow returned {} points for {} features",
                next_pts.len(),
                points.len()
            )));
        }
        Ok(next_pts
            .iter()
            .zip(status.iter())
            .zip(err.iter().chain(std::iter::repeat(0.0)))
            .map(|((p, s), e)| FlowResult {
                position: Point2D::new(p.x, p.y),
                found: s != 0,
                error: e,
            })
            .collect())
    }
}

/// Writes every image as `<dir>/<prefix>_<name>.jpg`
#[derive(Debug, Clone)]
pub struct ImwriteSink {
    pub dir: PathBuf,
    pub prefix: String,
}

impl ImwriteSink {
    pub fn new<P: Into<PathBuf>, S: Into<String>>(dir: P, prefix: S) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.into(),
        }
    }

    pub fn path_of(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}_{}.jpg", self.prefix, name))
    }
}

impl ImageSink for ImwriteSink {
    fn save(&mut self, name: &str, image: &Frame) -> Result<(), StabilizerError> {
        let path = self.path_of(name);
        log::debug!("writing {}", path.display());
        imwrite(&path, image).map_err(|e| match e {
            StabilizerError::SinkWriteFailure(_) | StabilizerError::InvalidPathEncoding(_) => e,
            e => StabilizerError::SinkWriteFailure(format!("{}: {e}", path.display())),
        })
    }
}
