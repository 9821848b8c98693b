// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2021,2025 lacklustr@protonmail.com https://github.com/eadf

//! Feature detection and tracking over a span of frames.
//!
//! Decoding, corner detection and optical flow are provided by collaborators
//! implementing [`VideoSource`], [`FeatureDetector`] and [`SparseTracker`].
//! OpenCV backed implementations live in [`crate::utils`].

use super::{DetectionParameters, StabilizerError};
use crate::feature::{SelectedFeatureSet, TrackedFeature};
use crate::frame::{GreyImage, Point2D, RawFrame, Roi};

/// An ordered, finite sequence of decoded frames. Sources can not be rewound.
pub trait VideoSource {
    /// Total number of frames in the clip
    fn frame_count(&self) -> Result<usize, StabilizerError>;

    /// The next frame, `None` once the clip is exhausted
    fn read_frame(&mut self) -> Result<Option<RawFrame>, StabilizerError>;

    /// Advance by `n` frames without using them
    fn skip_frames(&mut self, n: usize) -> Result<(), StabilizerError> {
        for skipped in 0..n {
            if self.read_frame()?.is_none() {
                return Err(StabilizerError::SourceExhausted {
                    requested: n,
                    available: skipped,
                });
            }
        }
        Ok(())
    }
}

/// Corner detection restricted to a region of interest
pub trait FeatureDetector {
    /// Up to `max_features` feature positions found inside `roi`
    fn detect(
        &mut self,
        grey: &GreyImage,
        roi: Roi,
        max_features: usize,
    ) -> Result<Vec<Point2D>, StabilizerError>;
}

/// Result of tracking one point between two frames
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FlowResult {
    /// Position of the point in the next frame
    pub position: Point2D,
    /// `false` if the tracker could not find the point
    pub found: bool,
    /// Tracking error reported by the tracker
    pub error: f32,
}

/// Sparse optical flow between two consecutive frames
pub trait SparseTracker {
    /// One `FlowResult` per entry of `points`, in the same order
    fn track(
        &mut self,
        prev: &GreyImage,
        next: &GreyImage,
        points: &[Point2D],
    ) -> Result<Vec<FlowResult>, StabilizerError>;
}

/// Detect features on the whole frame, evenly distributed by splitting it into
/// `params.sub_domains` segments and detecting the same number of features in each.
pub fn detect_features<D: FeatureDetector + ?Sized>(
    detector: &mut D,
    grey: &GreyImage,
    params: &DetectionParameters,
) -> Result<Vec<Point2D>, StabilizerError> {
    let (cols, rows) = params.sub_domains;
    if cols == 0 || rows == 0 {
        return Err(StabilizerError::InvalidParams(format!(
            "sub_domains must be non zero, got {cols}x{rows}"
        )));
    }
    let size = grey.size();
    let per_domain = params.max_features / (cols * rows);
    let seg_width = size.width / cols;
    let seg_height = size.height / rows;

    let mut features = Vec::with_capacity(params.max_features);
    for dy in 0..rows {
        for dx in 0..cols {
            let roi = Roi::new(dx * seg_width, dy * seg_height, seg_width, seg_height);
            if roi.is_empty() || per_domain == 0 {
                continue;
            }
            let found = detector.detect(grey, roi, per_domain)?;
            log::debug!("{} features in sub domain {:?}", found.len(), roi);
            features.extend(found);
        }
    }
    Ok(features)
}

/// Detect up to `params.max_features` features inside `roi`
pub fn refine_features<D: FeatureDetector + ?Sized>(
    detector: &mut D,
    grey: &GreyImage,
    roi: Roi,
    params: &DetectionParameters,
) -> Result<Vec<Point2D>, StabilizerError> {
    let roi = roi.clamp_to(grey.size());
    if roi.is_empty() {
        return Err(StabilizerError::EmptySelection);
    }
    detector.detect(grey, roi, params.max_features)
}

/// Bounding box of the `selected` features, `None` if no selected feature has a position.
/// The box includes the right-most and bottom-most feature pixels.
/// ```
/// # use libstabilizer::{prelude::*, frame::{Point2D, Roi}, tracking::feature_bounds};
/// let positions = [Point2D::new(4.7, 9.0), Point2D::new(100.0, 0.0), Point2D::new(12.2, 3.5)];
/// let roi = feature_bounds(&positions, &SelectedFeatureSet::new(vec![0, 2]));
/// assert_eq!(roi, Some(Roi::new(4, 3, 9, 7)));
/// ```
pub fn feature_bounds(positions: &[Point2D], selected: &SelectedFeatureSet) -> Option<Roi> {
    let mut points = selected.iter().filter_map(|i| positions.get(i));
    let first = points.next()?;
    let (mut min_x, mut max_x, mut min_y, mut max_y) = (first.x, first.x, first.y, first.y);
    for p in points {
        min_x = min_x.min(p.x);
        max_x = max_x.max(p.x);
        min_y = min_y.min(p.y);
        max_y = max_y.max(p.y);
    }
    let (x0, y0) = (min_x.max(0.0) as usize, min_y.max(0.0) as usize);
    let (x1, y1) = (max_x.max(0.0) as usize, max_y.max(0.0) as usize);
    Some(Roi::new(x0, y0, x1 - x0 + 1, y1 - y0 + 1))
}

/// Feature positions over a tracked span, together with the accumulated per feature state.
#[derive(Debug, Clone, Default)]
pub struct FeatureTracks {
    /// Positions in the reference frame, indexed by feature index
    pub reference: Vec<Point2D>,
    /// Positions in every tracked frame following the reference
    pub frames: Vec<Vec<Point2D>>,
    /// Accumulated tracking state, indexed by feature index
    pub features: Vec<TrackedFeature>,
}

impl FeatureTracks {
    /// Start tracking `positions` detected in the reference frame
    pub fn new(positions: Vec<Point2D>) -> Self {
        let features = (0..positions.len()).map(TrackedFeature::new).collect();
        Self {
            reference: positions,
            frames: Vec::new(),
            features,
        }
    }

    /// Positions in the most recent frame
    pub fn latest(&self) -> &[Point2D] {
        self.frames.last().unwrap_or(&self.reference)
    }

    /// Fold the tracker output of one more frame pair into the tracks
    pub fn push_frame(&mut self, flows: &[FlowResult]) -> Result<(), StabilizerError> {
        if flows.len() != self.reference.len() {
            return Err(StabilizerError::ProcessingError(format!(
                "tracker returned {} results for {} features",
                flows.len(),
                self.reference.len()
            )));
        }
        let positions: Vec<Point2D> = flows.iter().map(|f| f.position).collect();
        let previous = self.frames.last().unwrap_or(&self.reference);
        for ((feature, flow), prev) in self
            .features
            .iter_mut()
            .zip(flows.iter())
            .zip(previous.iter())
        {
            feature.record_step(flow.position - *prev, flow.found, flow.error);
        }
        self.frames.push(positions);
        Ok(())
    }

    /// Number of features the tracker still follows
    pub fn matched_count(&self) -> usize {
        self.features.iter().filter(|f| f.matched).count()
    }

    /// Positions of the `selected` features in the reference frame
    pub fn selected_reference(&self, selected: &SelectedFeatureSet) -> Vec<Point2D> {
        selected
            .iter()
            .filter_map(|i| self.reference.get(i).copied())
            .collect()
    }
}

/// Track `positions`, detected on `reference`, through the next `num_frames` frames of `source`.
///
/// # Errors
/// `SourceExhausted` if `source` ends before `num_frames` frames could be read.
pub fn track_features<S, T>(
    source: &mut S,
    tracker: &mut T,
    reference: &GreyImage,
    positions: Vec<Point2D>,
    num_frames: usize,
) -> Result<FeatureTracks, StabilizerError>
where
    S: VideoSource + ?Sized,
    T: SparseTracker + ?Sized,
{
    let mut tracks = FeatureTracks::new(positions);
    let mut prev = reference.clone();
    for i in 0..num_frames {
        let Some(raw) = source.read_frame()? else {
            return Err(StabilizerError::SourceExhausted {
                requested: num_frames,
                available: i,
            });
        };
        let next = raw.to_grey();
        if next.size() != prev.size() {
            return Err(StabilizerError::DimensionMismatch(format!(
                "frame {} is {:?}, expected {:?}",
                i + 1,
                next.size(),
                prev.size()
            )));
        }
        let flows = tracker.track(&prev, &next, tracks.latest())?;
        tracks.push_frame(&flows)?;
        log::debug!(
            "optical flow to frame {}/{} calculated, {} features matched",
            i + 1,
            num_frames,
            tracks.matched_count()
        );
        prev = next;
    }
    Ok(tracks)
}
