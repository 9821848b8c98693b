// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2021,2025 lacklustr@protonmail.com https://github.com/eadf

//! This library contains multi-threaded video stabilization by morphing,
//! based on Rayon <https://crates.io/crates/rayon> and, optionally,
//! OpenCV <https://crates.io/crates/opencv>.
//!
//! Copyright (c) 2021, 2025 Eadf <lacklustr@protonmail.com>.
//! License: MIT/Apache 2.0
//!
//! A short span of video frames is averaged into one still image. Sparse features are
//! tracked through the span, the features sharing a consistent motion are selected, and
//! their motion is interpolated into a dense displacement field per frame. Every frame is
//! warped back onto the reference frame with its field before it is added to the average.
//!
//! Decoding, corner detection and optical flow are injected collaborators, see
//! [`tracking`]. The `opencv` feature (enabled by default) provides implementations in [`utils`].

pub mod accumulate;
pub mod diagnostics;
pub mod feature;
pub mod frame;
pub mod morph;
pub mod resample;
pub mod tracking;
#[cfg(feature = "opencv")]
pub mod utils;
pub mod weight;

#[cfg(feature = "opencv")]
pub use opencv;
pub use resample::InterpolationMode;

use accumulate::FrameAccumulator;
use diagnostics::{ImageSink, draw_features, draw_motion_vectors, save_or_warn};
use feature::{FeatureSelector, SelectedFeatureSet};
use frame::{Frame, GreyImage, Point2D};
use morph::MotionFieldInterpolator;
use resample::FrameResampler;
use std::path::PathBuf;
use thiserror::Error;
use tracking::{
    FeatureDetector, FeatureTracks, SparseTracker, VideoSource, detect_features, feature_bounds,
    refine_features, track_features,
};
use weight::Weight;

#[derive(Error, Debug)]
pub enum StabilizerError {
    #[cfg(feature = "opencv")]
    #[error(transparent)]
    OpenCvError(#[from] opencv::Error),
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error("Invalid path encoding {0}")]
    InvalidPathEncoding(PathBuf),
    #[error("Invalid parameter(s) {0}")]
    InvalidParams(String),
    #[error("Video source exhausted, {requested} frames requested but only {available} available")]
    SourceExhausted { requested: usize, available: usize },
    #[error("No feature survived the selection")]
    EmptySelection,
    #[error("Degenerate weight sum at pixel ({x},{y})")]
    DegenerateWeight { x: usize, y: usize },
    #[error("Dimension mismatch {0}")]
    DimensionMismatch(String),
    #[error("Could not write image {0}")]
    SinkWriteFailure(String),
    #[error("Internal error {0}")]
    ProcessingError(String),
}

/// Parameters of the corner detection on the reference frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectionParameters {
    /// Maximum number of features over the whole frame, or inside the refinement region.
    pub max_features: usize,

    /// Minimal accepted corner quality, relative to the best corner of the region.
    /// Used as `qualityLevel` in `opencv::imgproc::good_features_to_track()`.
    pub quality_level: f64,

    /// Minimum Euclidean distance between two returned features, in pixels.
    pub min_distance: f64,

    /// Size of the neighbourhood used for the corner response.
    pub block_size: i32,

    /// Use the Harris response instead of the minimal eigenvalue.
    pub use_harris_detector: bool,

    /// Free parameter of the Harris detector.
    pub harris_k: f64,

    /// (columns, rows) the frame is split into. Every segment receives
    /// `max_features / (columns * rows)` features, spreading them over the frame.
    pub sub_domains: (usize, usize),
}

impl Default for DetectionParameters {
    fn default() -> Self {
        Self {
            max_features: 240,
            quality_level: 0.01,
            min_distance: 1.0,
            block_size: 3,
            use_harris_detector: false,
            harris_k: 0.04,
            sub_domains: (4, 3),
        }
    }
}

impl DetectionParameters {
    pub fn validate(&self) -> Result<(), StabilizerError> {
        let (cols, rows) = self.sub_domains;
        if cols == 0 || rows == 0 {
            return Err(StabilizerError::InvalidParams(format!(
                "sub_domains must be non zero, got {cols}x{rows}"
            )));
        }
        if self.max_features < cols * rows {
            return Err(StabilizerError::InvalidParams(format!(
                "max_features ({}) must be at least one per sub domain ({})",
                self.max_features,
                cols * rows
            )));
        }
        if !(self.quality_level > 0.0) || !(self.min_distance >= 0.0) || self.block_size <= 0 {
            return Err(StabilizerError::InvalidParams(format!(
                "quality_level:{} min_distance:{} block_size:{}",
                self.quality_level, self.min_distance, self.block_size
            )));
        }
        Ok(())
    }
}

/// Parameters of the `FeatureSelector`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SelectionParameters {
    /// Share of the matched features kept when sorted by cumulative tracking error, in (0,1].
    pub error_keep_ratio: f64,

    /// Share of the remaining features kept when sorted by trajectory length, in (0,1].
    pub length_keep_ratio: f64,

    /// Maximal difference in trajectory length to the shortest trajectory, in pixels.
    pub length_tolerance: f32,

    /// Maximal L1 distance between the net motion and the net motion of the shortest trajectory.
    pub direction_tolerance: f32,
}

impl Default for SelectionParameters {
    fn default() -> Self {
        Self {
            error_keep_ratio: 0.9,
            length_keep_ratio: 0.9,
            length_tolerance: 50.0,
            direction_tolerance: 100.0,
        }
    }
}

impl SelectionParameters {
    pub fn validate(&self) -> Result<(), StabilizerError> {
        for (name, ratio) in [
            ("error_keep_ratio", self.error_keep_ratio),
            ("length_keep_ratio", self.length_keep_ratio),
        ] {
            if !(ratio > 0.0 && ratio <= 1.0) {
                return Err(StabilizerError::InvalidParams(format!(
                    "{name} must be in (0,1], got {ratio}"
                )));
            }
        }
        if !(self.length_tolerance > 0.0 && self.direction_tolerance > 0.0) {
            return Err(StabilizerError::InvalidParams(format!(
                "tolerances must be positive, got length:{} direction:{}",
                self.length_tolerance, self.direction_tolerance
            )));
        }
        Ok(())
    }
}

/// How the feature weights of the motion field interpolation are evaluated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightEvaluation {
    /// Evaluate the falloff function for every pixel and feature
    ClosedForm,
    /// Linear interpolation in a table of `samples` intervals over the frame diagonal
    LookupTable { samples: usize },
}

impl Default for WeightEvaluation {
    fn default() -> Self {
        WeightEvaluation::LookupTable { samples: 500 }
    }
}

/// Parameters of the morphing stage
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct MorphParameters {
    pub interpolation: InterpolationMode,
    pub weight: WeightEvaluation,
}

impl MorphParameters {
    pub fn validate(&self) -> Result<(), StabilizerError> {
        if let WeightEvaluation::LookupTable { samples: 0 } = self.weight {
            return Err(StabilizerError::InvalidParams(
                "the weight lookup table needs at least one sample".to_string(),
            ));
        }
        Ok(())
    }
}

/// Parameters for `stabilize()`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StabilizeParameters {
    /// Number of frames following the reference frame that are aligned and averaged
    pub num_frames: usize,

    /// Index of the reference frame. `None` centers the span in the clip.
    pub start_frame: Option<usize>,

    /// Re-detect features inside the bounding box of the first selection and track them again
    pub refine_features: bool,

    /// Hand the intermediate images to the `ImageSink`
    pub debug_images: bool,

    pub detection: DetectionParameters,
    pub selection: SelectionParameters,
    pub morph: MorphParameters,
}

impl Default for StabilizeParameters {
    fn default() -> Self {
        Self {
            num_frames: 30,
            start_frame: None,
            refine_features: true,
            debug_images: false,
            detection: DetectionParameters::default(),
            selection: SelectionParameters::default(),
            morph: MorphParameters::default(),
        }
    }
}

impl StabilizeParameters {
    pub fn validate(&self) -> Result<(), StabilizerError> {
        if self.num_frames == 0 {
            return Err(StabilizerError::InvalidParams(
                "num_frames must be at least 1".to_string(),
            ));
        }
        self.detection.validate()?;
        self.selection.validate()?;
        self.morph.validate()
    }

    /// The reference frame index used for a clip of `frame_count` frames
    /// ```
    /// # use libstabilizer::prelude::*;
    /// let params = StabilizeParameters::default();
    /// assert_eq!(params.start_index(100), 35);
    /// assert_eq!(params.start_index(10), 0);
    /// ```
    pub fn start_index(&self, frame_count: usize) -> usize {
        self.start_frame
            .unwrap_or_else(|| (frame_count / 2).saturating_sub(self.num_frames / 2))
    }
}

/// Index of the last frame of a span starting at `start`, the span must fit into the clip
fn span_end(start: usize, num_frames: usize, frame_count: usize) -> Result<usize, StabilizerError> {
    start
        .checked_add(num_frames)
        .filter(|end| *end < frame_count)
        .ok_or(StabilizerError::SourceExhausted {
            requested: start.saturating_add(num_frames).saturating_add(1),
            available: frame_count,
        })
}

/// Result of `stabilize()`
#[derive(Debug, Clone)]
pub struct StabilizeOutput {
    /// The reference frame and all aligned frames, averaged. Samples keep the 0..255 range.
    pub average: Frame,
    /// Reference frame positions of the features the frames were aligned with
    pub selected_features: Vec<Point2D>,
    /// Number of frames aligned onto the reference frame
    pub frames_aligned: usize,
}

/// Averages `params.num_frames + 1` consecutive frames of a video into one image,
/// with every frame morphed onto the first one (the reference frame).
///
/// # Algorithm Overview
/// 1. Detects features on the reference frame, spread over `params.detection.sub_domains`
/// 2. Tracks them through the following frames and selects the consistently moving ones
/// 3. Optionally re-detects features inside the bounding box of the selection,
///    then tracks and selects again
/// 4. Interpolates the motion of the selected features into a displacement field per frame,
///    resamples the frame with it and adds it to the average
///
/// The video is read once per pass, `open` must return a fresh source positioned at the
/// first frame every time it is called.
///
/// # Errors
/// - `InvalidParams` for inconsistent parameters
/// - `SourceExhausted` if the clip is too short for the requested span
/// - `EmptySelection` if no feature survives a selection
/// - errors of the collaborators are propagated, except for `sink` failures which are only logged
///
/// ```rust,no_run
/// # #[cfg(feature = "opencv")]
/// # fn main() -> Result<(), libstabilizer::StabilizerError> {
/// # use libstabilizer::{prelude::*, utils::*};
/// let output = stabilize(
///     || OpenCvVideoSource::open("mini_waterfall.avi"),
///     &mut GoodFeaturesDetector::default(),
///     &mut PyrLkTracker::default(),
///     &mut libstabilizer::diagnostics::NullSink,
///     &StabilizeParameters::default(),
/// )?;
/// imwrite("average.jpg", &output.average)?;
/// # Ok(())}
/// # #[cfg(not(feature = "opencv"))]
/// # fn main() {}
/// ```
pub fn stabilize<S, O, D, T, K>(
    mut open: O,
    detector: &mut D,
    tracker: &mut T,
    sink: &mut K,
    params: &StabilizeParameters,
) -> Result<StabilizeOutput, StabilizerError>
where
    S: VideoSource,
    O: FnMut() -> Result<S, StabilizerError>,
    D: FeatureDetector + ?Sized,
    T: SparseTracker + ?Sized,
    K: ImageSink + ?Sized,
{
    params.validate()?;
    let num_frames = params.num_frames;
    let selector = FeatureSelector::new(params.selection);

    let mut source = open()?;
    let frame_count = source.frame_count()?;
    let start = params.start_index(frame_count);
    let end = span_end(start, num_frames, frame_count)?;
    log::info!("stabilizing frames {start}..={end} of {frame_count}");

    source.skip_frames(start)?;
    let Some(reference_raw) = source.read_frame()? else {
        return Err(StabilizerError::SourceExhausted {
            requested: start + 1,
            available: start,
        });
    };
    let reference_grey = reference_raw.to_grey();
    let reference = Frame::from_raw(&reference_raw);
    let size = reference.size();

    // initial pass, features spread over the whole frame
    let positions = detect_features(detector, &reference_grey, &params.detection)?;
    log::info!("detected {} features on the reference frame", positions.len());
    if positions.is_empty() {
        return Err(StabilizerError::EmptySelection);
    }
    let mut tracks = track_features(
        &mut source,
        tracker,
        &reference_grey,
        positions,
        num_frames,
    )?;
    drop(source);
    let mut selected = selector.select(&tracks.features).non_empty()?;
    log::info!(
        "selected {} of {} features in the initial pass",
        selected.len(),
        tracks.features.len()
    );
    if params.debug_images {
        save_or_warn(
            sink,
            "features_initial",
            &draw_features(&reference, &tracks.reference, &selected),
        );
    }

    if params.refine_features {
        (tracks, selected) = refine_pass(
            &mut open,
            detector,
            tracker,
            &selector,
            &tracks,
            &selected,
            &reference_grey,
            start,
            params,
        )?;
        if params.debug_images {
            save_or_warn(
                sink,
                "features_refined",
                &draw_features(&reference, &tracks.reference, &selected),
            );
        }
    }

    // stabilization pass
    let mut source = open()?;
    source.skip_frames(start + 1)?;
    let interpolator = MotionFieldInterpolator::new(Weight::new(params.morph.weight, size)?);
    let resampler = FrameResampler::new(params.morph.interpolation);
    let mut accumulator = FrameAccumulator::with_reference(&reference);
    for (n, current) in tracks.frames.iter().enumerate() {
        let Some(raw) = source.read_frame()? else {
            return Err(StabilizerError::SourceExhausted {
                requested: num_frames,
                available: n,
            });
        };
        let frame = Frame::from_raw(&raw);
        let field = interpolator.interpolate(&tracks.reference, current, &selected, size)?;
        let aligned = resampler.resample(&frame, &field)?;
        accumulator.accumulate(&aligned)?;
        log::debug!("frame {}/{} aligned", n + 1, num_frames);

        if params.debug_images {
            let frame_no = n + 1;
            save_or_warn(
                sink,
                &format!("frame{frame_no}_vectors"),
                &draw_motion_vectors(&frame, &tracks.reference, current, &selected),
            );
            save_or_warn(sink, &format!("frame{frame_no}_aligned"), &aligned);
            save_or_warn(sink, &format!("frame{frame_no}_original"), &frame);
        }
    }

    let frames_aligned = accumulator.count() - 1;
    let average = accumulator.finalize()?;
    log::info!("averaged {} frames", frames_aligned + 1);
    Ok(StabilizeOutput {
        average,
        selected_features: tracks.selected_reference(&selected),
        frames_aligned,
    })
}

/// Second detection pass, restricted to the bounding box of the features selected so far
#[allow(clippy::too_many_arguments)]
fn refine_pass<S, O, D, T>(
    open: &mut O,
    detector: &mut D,
    tracker: &mut T,
    selector: &FeatureSelector,
    tracks: &FeatureTracks,
    selected: &SelectedFeatureSet,
    reference_grey: &GreyImage,
    start: usize,
    params: &StabilizeParameters,
) -> Result<(FeatureTracks, SelectedFeatureSet), StabilizerError>
where
    S: VideoSource,
    O: FnMut() -> Result<S, StabilizerError>,
    D: FeatureDetector + ?Sized,
    T: SparseTracker + ?Sized,
{
    let roi =
        feature_bounds(&tracks.reference, selected).ok_or(StabilizerError::EmptySelection)?;
    log::info!("refining features inside {:?}", roi);
    let positions = refine_features(detector, reference_grey, roi, &params.detection)?;
    if positions.is_empty() {
        return Err(StabilizerError::EmptySelection);
    }

    let mut source = open()?;
    source.skip_frames(start + 1)?;
    let tracks = track_features(
        &mut source,
        tracker,
        reference_grey,
        positions,
        params.num_frames,
    )?;
    let selected = selector.select(&tracks.features).non_empty()?;
    log::info!(
        "selected {} of {} features in the refined pass",
        selected.len(),
        tracks.features.len()
    );
    Ok((tracks, selected))
}

pub mod prelude {
    pub use super::{
        DetectionParameters, InterpolationMode, MorphParameters, SelectionParameters,
        StabilizeOutput, StabilizeParameters, StabilizerError, WeightEvaluation,
        accumulate::FrameAccumulator,
        feature::{FeatureSelector, SelectedFeatureSet},
        morph::MotionFieldInterpolator,
        resample::FrameResampler,
        stabilize,
    };
}
