// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2021,2025 lacklustr@protonmail.com https://github.com/eadf

//! Per feature tracking state and the selection of the features trusted to
//! describe the motion of the frame.

use super::{SelectionParameters, StabilizerError};
use crate::frame::Point2D;
use ordered_float::OrderedFloat;

/// Accumulated tracking state of one feature detected in the reference frame.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedFeature {
    /// Position of the feature in the detection order of the reference frame
    pub index: usize,
    /// `false` as soon as the tracker lost the feature once
    pub matched: bool,
    /// Sum of the tracker errors over all frame pairs
    pub cumulative_error: f32,
    /// Length of the trajectory, the sum of the per frame Euclidean displacements
    pub cumulative_length: f32,
    /// Sum of the per frame displacement vectors, i.e. the net motion
    pub cumulative_motion: Point2D,
}

impl TrackedFeature {
    /// A freshly detected feature with zeroed accumulators
    pub fn new(index: usize) -> Self {
        Self {
            index,
            matched: true,
            cumulative_error: 0.0,
            cumulative_length: 0.0,
            cumulative_motion: Point2D::ZERO,
        }
    }

    /// Fold the result of tracking the feature across one more frame pair
    /// ```
    /// # use libstabilizer::{feature::TrackedFeature, frame::Point2D};
    /// let mut f = TrackedFeature::new(0);
    /// f.record_step(Point2D::new(3.0, 4.0), true, 0.5);
    /// f.record_step(Point2D::new(-3.0, -4.0), true, 0.5);
    /// assert_eq!(f.cumulative_motion, Point2D::ZERO);
    /// assert_eq!(f.cumulative_length, 10.0);
    /// assert_eq!(f.cumulative_error, 1.0);
    /// ```
    pub fn record_step(&mut self, displacement: Point2D, found: bool, error: f32) {
        self.matched &= found;
        self.cumulative_motion += displacement;
        self.cumulative_length += displacement.norm();
        self.cumulative_error += error;
    }
}

/// The indices of the features used to morph the frames, in selection order and without duplicates.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SelectedFeatureSet(Vec<usize>);

impl SelectedFeatureSet {
    pub fn new(indices: Vec<usize>) -> Self {
        let mut seen = std::collections::HashSet::with_capacity(indices.len());
        Self(indices.into_iter().filter(|i| seen.insert(*i)).collect())
    }

    pub fn indices(&self) -> &[usize] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, index: usize) -> bool {
        self.0.contains(&index)
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.0.iter().copied()
    }

    /// Converts an empty selection into `StabilizerError::EmptySelection`
    pub fn non_empty(self) -> Result<Self, StabilizerError> {
        if self.0.is_empty() {
            Err(StabilizerError::EmptySelection)
        } else {
            Ok(self)
        }
    }
}

/// Filters tracked features down to the subset sharing a consistent motion.
///
/// The stages run in order, each one on the survivors of the previous:
/// 1. drop every feature the tracker lost
/// 2. keep the `error_keep_ratio` share with the smallest cumulative tracking error
/// 3. keep the `length_keep_ratio` share with the shortest trajectories
/// 4. keep the features whose trajectory length and net motion are close to
///    those of the shortest trajectory
#[derive(Debug, Clone, Copy, Default)]
pub struct FeatureSelector {
    pub params: SelectionParameters,
}

impl FeatureSelector {
    pub fn new(params: SelectionParameters) -> Self {
        Self { params }
    }

    /// Run all selection stages. An empty result is not an error here, the
    /// caller decides what an empty selection means.
    /// ```
    /// # use libstabilizer::{prelude::*, feature::TrackedFeature};
    /// let selector = FeatureSelector::default();
    /// assert!(selector.select(&[]).is_empty());
    ///
    /// let mut lost = TrackedFeature::new(0);
    /// lost.matched = false;
    /// assert!(selector.select(&[lost]).is_empty());
    /// ```
    pub fn select(&self, features: &[TrackedFeature]) -> SelectedFeatureSet {
        let ranked = self.rank(features);
        SelectedFeatureSet(self.retain_consistent(&ranked))
    }

    /// Stages 1 to 3: the surviving features, sorted by ascending trajectory length
    pub fn rank<'a>(&self, features: &'a [TrackedFeature]) -> Vec<&'a TrackedFeature> {
        // stable partition, matched features first
        let mut candidates: Vec<&TrackedFeature> = features.iter().collect();
        candidates.sort_by_key(|f| !f.matched);
        let n_matched = candidates.iter().take_while(|f| f.matched).count();
        candidates.truncate(n_matched);

        candidates.sort_by_key(|f| OrderedFloat(f.cumulative_error));
        let n_error_filtered = keep_count(n_matched, self.params.error_keep_ratio);
        candidates.truncate(n_error_filtered);

        candidates.sort_by_key(|f| OrderedFloat(f.cumulative_length));
        let n_length_filtered = keep_count(n_error_filtered, self.params.length_keep_ratio);
        candidates.truncate(n_length_filtered);

        log::debug!(
            "feature selection: {} tracked, {} matched, {} after error filter, \
             {} after length filter",
            features.len(),
            n_matched,
            n_error_filtered,
            n_length_filtered
        );
        candidates
    }

    /// Stage 4: keep the features moving like the first (shortest trajectory) candidate.
    /// Candidates are expected in ascending trajectory length order, as returned by `rank()`.
    pub fn retain_consistent(&self, ranked: &[&TrackedFeature]) -> Vec<usize> {
        let Some(reference) = ranked.iter().min_by_key(|f| OrderedFloat(f.cumulative_length))
        else {
            return Vec::new();
        };
        let ref_motion = reference.cumulative_motion;
        let ref_length = reference.cumulative_length;

        let rv: Vec<usize> = ranked
            .iter()
            .filter(|f| {
                (ref_length - f.cumulative_length).abs() < self.params.length_tolerance
                    && f.cumulative_motion.manhattan(ref_motion) < self.params.direction_tolerance
            })
            .map(|f| f.index)
            .collect();
        log::debug!("feature selection: keeping {} consistent features", rv.len());
        rv
    }
}

#[inline]
fn keep_count(n: usize, ratio: f64) -> usize {
    ((n as f64 * ratio).floor() as usize).min(n)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feature(index: usize, err: f32, len: f32, motion: (f32, f32)) -> TrackedFeature {
        TrackedFeature {
            index,
            matched: true,
            cumulative_error: err,
            cumulative_length: len,
            cumulative_motion: Point2D::new(motion.0, motion.1),
        }
    }

    #[test]
    fn record_step_is_sticky_on_loss() {
        let mut f = TrackedFeature::new(3);
        f.record_step(Point2D::new(1.0, 0.0), false, 2.0);
        f.record_step(Point2D::new(1.0, 0.0), true, 2.0);
        assert!(!f.matched);
        assert_eq!(f.cumulative_length, 2.0);
    }

    #[test]
    fn unmatched_features_are_never_selected() {
        let mut features: Vec<_> = (0..20).map(|i| feature(i, 1.0, 2.0, (2.0, 0.0))).collect();
        for f in features.iter_mut().filter(|f| f.index % 2 == 0) {
            f.matched = false;
        }
        let selected = FeatureSelector::default().select(&features);
        assert!(!selected.is_empty());
        assert!(selected.iter().all(|i| i % 2 == 1));
    }

    #[test]
    fn worst_errors_and_longest_trajectories_are_rejected() {
        // 20 matched features: index 19 has the worst error, index 0 the longest trajectory
        let features: Vec<_> = (0..20)
            .map(|i| {
                let err = if i == 19 { 100.0 } else { 1.0 };
                let len = if i == 0 { 40.0 } else { 2.0 };
                feature(i, err, len, (2.0, 0.0))
            })
            .collect();
        let ranked = FeatureSelector::default().rank(&features);
        // floor(20 * 0.9) = 18, floor(18 * 0.9) = 16
        assert_eq!(ranked.len(), 16);
        assert!(ranked.iter().all(|f| f.index != 19 && f.index != 0));
    }

    #[test]
    fn outlier_motion_is_rejected() {
        let params = SelectionParameters {
            error_keep_ratio: 1.0,
            length_keep_ratio: 1.0,
            ..Default::default()
        };
        let features = vec![
            feature(0, 1.0, 2.0, (2.0, 0.0)),
            feature(1, 1.0, 3.0, (2.5, 0.5)),
            // similar length but moving in the opposite direction, far in L1
            feature(2, 1.0, 4.0, (-60.0, -60.0)),
            // way longer trajectory
            feature(3, 1.0, 80.0, (2.0, 0.0)),
        ];
        let selected = FeatureSelector::new(params).select(&features);
        assert_eq!(selected.indices(), &[0, 1]);
    }

    #[test]
    fn small_sets_collapse_to_empty() {
        // floor(1 * 0.9) == 0
        let features = vec![feature(0, 1.0, 1.0, (1.0, 1.0))];
        let selected = FeatureSelector::default().select(&features);
        assert!(selected.is_empty());
        assert!(matches!(
            selected.non_empty(),
            Err(StabilizerError::EmptySelection)
        ));
    }

    #[test]
    fn consistency_filter_is_idempotent() {
        let selector = FeatureSelector::default();
        let features: Vec<_> = (0..30)
            .map(|i| {
                let jitter = (i % 7) as f32 * 9.0;
                feature(i, (i % 5) as f32, 2.0 + jitter, (2.0 + jitter, -jitter))
            })
            .collect();
        let ranked = selector.rank(&features);
        let first = selector.retain_consistent(&ranked);

        let survivors: Vec<&TrackedFeature> = ranked
            .iter()
            .copied()
            .filter(|f| first.contains(&f.index))
            .collect();
        let second = selector.retain_consistent(&survivors);
        assert_eq!(first, second);
    }

    #[test]
    fn selection_with_unit_ratios_is_idempotent() {
        let selector = FeatureSelector::new(SelectionParameters {
            error_keep_ratio: 1.0,
            length_keep_ratio: 1.0,
            ..Default::default()
        });
        let features: Vec<_> = (0..12)
            .map(|i| feature(i, 1.0, i as f32 * 10.0, (i as f32 * 10.0, 0.0)))
            .collect();
        let first = selector.select(&features);
        let kept: Vec<_> = features
            .iter()
            .filter(|f| first.contains(f.index))
            .cloned()
            .collect();
        let second = selector.select(&kept);
        assert_eq!(first, second);
    }

    #[test]
    fn selected_set_drops_duplicates() {
        let set = SelectedFeatureSet::new(vec![4, 1, 4, 2, 1]);
        assert_eq!(set.indices(), &[4, 1, 2]);
    }
}
