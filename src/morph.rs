// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2021,2025 lacklustr@protonmail.com https://github.com/eadf

//! Dense motion field from sparse feature motion (Shepard interpolation).

use super::StabilizerError;
use crate::feature::SelectedFeatureSet;
use crate::frame::{DisplacementField, FrameSize, Point2D};
use crate::weight::WeightFunction;
use rayon::prelude::*;

/// Interpolates the motion of the selected features into one displacement per pixel.
///
/// Every pixel gets the weighted average of all selected feature motion vectors,
/// each feature weighted by the distance between the pixel and the position of
/// the feature in the reference frame.
#[derive(Debug, Clone)]
pub struct MotionFieldInterpolator<W> {
    weight: W,
}

impl<W: WeightFunction + Sync> MotionFieldInterpolator<W> {
    pub fn new(weight: W) -> Self {
        Self { weight }
    }

    pub fn weight_function(&self) -> &W {
        &self.weight
    }

    /// Builds the displacement field of a `size` frame.
    ///
    /// `reference` and `current` hold the feature positions in the reference and
    /// in the current frame, indexed by feature index.
    ///
    /// # Errors
    /// - `EmptySelection` if `selected` is empty
    /// - `InvalidParams` if a selected index has no position
    /// - `DegenerateWeight` if the weights of a pixel sum up to something non positive
    /// ```
    /// # use libstabilizer::{prelude::*, frame::{FrameSize, Point2D}, weight::ClosedFormWeight};
    /// # fn main() -> Result<(), StabilizerError> {
    /// let size = FrameSize::new(8, 6);
    /// let interpolator = MotionFieldInterpolator::new(ClosedFormWeight::new(size));
    /// let field = interpolator.interpolate(
    ///     &[Point2D::new(2.0, 2.0)],
    ///     &[Point2D::new(3.0, 1.0)],
    ///     &SelectedFeatureSet::new(vec![0]),
    ///     size,
    /// )?;
    /// assert!(field.as_slice().iter().all(|v| *v == Point2D::new(1.0, -1.0)));
    /// # Ok(())}
    /// ```
    pub fn interpolate(
        &self,
        reference: &[Point2D],
        current: &[Point2D],
        selected: &SelectedFeatureSet,
        size: FrameSize,
    ) -> Result<DisplacementField, StabilizerError> {
        if selected.is_empty() {
            return Err(StabilizerError::EmptySelection);
        }
        // (reference position, motion vector) of every selected feature
        let anchors = selected
            .iter()
            .map(|f| match (reference.get(f), current.get(f)) {
                (Some(r), Some(c)) => Ok((*r, *c - *r)),
                _ => Err(StabilizerError::InvalidParams(format!(
                    "feature {} has no position (reference:{}, current:{})",
                    f,
                    reference.len(),
                    current.len()
                ))),
            })
            .collect::<Result<Vec<_>, StabilizerError>>()?;

        let mut vectors = vec![Point2D::ZERO; size.area()];
        if size.width == 0 {
            return DisplacementField::new(size, vectors);
        }
        vectors
            .par_chunks_mut(size.width)
            .enumerate()
            .try_for_each(|(i, row)| {
                let y = i as f32;
                for (j, out) in row.iter_mut().enumerate() {
                    let pixel = Point2D::new(j as f32, y);
                    let mut total_weight = 0.0_f32;
                    let mut lookup = Point2D::ZERO;
                    for (position, motion) in anchors.iter() {
                        let w = self.weight.weight(position.distance(pixel));
                        lookup += *motion * w;
                        total_weight += w;
                    }
                    if !(total_weight.is_finite() && total_weight > 0.0) {
                        return Err(StabilizerError::DegenerateWeight { x: j, y: i });
                    }
                    *out = Point2D::new(lookup.x / total_weight, lookup.y / total_weight);
                }
                Ok(())
            })?;
        DisplacementField::new(size, vectors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::weight::{ClosedFormWeight, LookupWeight};
    use approx::assert_abs_diff_eq;

    struct Constant(f32);
    impl WeightFunction for Constant {
        fn weight(&self, _: f32) -> f32 {
            self.0
        }
    }

    #[test]
    fn single_feature_gives_constant_field() {
        let size = FrameSize::new(40, 30);
        let interpolator = MotionFieldInterpolator::new(LookupWeight::new(size, 500).unwrap());
        let reference = [Point2D::new(0.0, 0.0), Point2D::new(12.5, 7.25)];
        let current = [Point2D::new(9.0, 9.0), Point2D::new(10.0, 9.25)];
        let field = interpolator
            .interpolate(
                &reference,
                &current,
                &SelectedFeatureSet::new(vec![1]),
                size,
            )
            .unwrap();
        for v in field.as_slice() {
            assert_abs_diff_eq!(v.x, -2.5, epsilon = 1e-5);
            assert_abs_diff_eq!(v.y, 2.0, epsilon = 1e-5);
        }
    }

    #[test]
    fn agreeing_features_give_uniform_field() {
        let size = FrameSize::new(100, 100);
        let interpolator = MotionFieldInterpolator::new(ClosedFormWeight::new(size));
        let reference = [
            Point2D::new(10.0, 10.0),
            Point2D::new(50.0, 50.0),
            Point2D::new(90.0, 90.0),
        ];
        let current: Vec<_> = reference
            .iter()
            .map(|p| *p + Point2D::new(2.0, 0.0))
            .collect();
        let field = interpolator
            .interpolate(
                &reference,
                &current,
                &SelectedFeatureSet::new(vec![0, 1, 2]),
                size,
            )
            .unwrap();
        for v in field.as_slice() {
            assert_abs_diff_eq!(v.x, 2.0, epsilon = 1e-4);
            assert_abs_diff_eq!(v.y, 0.0, epsilon = 1e-4);
        }
    }

    #[test]
    fn near_feature_dominates() {
        let size = FrameSize::new(200, 50);
        let interpolator = MotionFieldInterpolator::new(ClosedFormWeight::new(size));
        let reference = [Point2D::new(10.0, 25.0), Point2D::new(190.0, 25.0)];
        let current = [Point2D::new(14.0, 25.0), Point2D::new(190.0, 25.0)];
        let field = interpolator
            .interpolate(
                &reference,
                &current,
                &SelectedFeatureSet::new(vec![0, 1]),
                size,
            )
            .unwrap();
        let near = field.get(10, 25);
        let far = field.get(190, 25);
        assert!(near.x > 3.0, "{near:?}");
        assert!(far.x < 1.0, "{far:?}");
        // the motion is a convex combination of the feature motions
        assert!(field.as_slice().iter().all(|v| v.x >= 0.0 && v.x <= 4.0));
    }

    #[test]
    fn empty_selection_is_an_error() {
        let size = FrameSize::new(4, 4);
        let interpolator = MotionFieldInterpolator::new(ClosedFormWeight::new(size));
        assert!(matches!(
            interpolator.interpolate(&[], &[], &SelectedFeatureSet::default(), size),
            Err(StabilizerError::EmptySelection)
        ));
    }

    #[test]
    fn missing_position_is_an_error() {
        let size = FrameSize::new(4, 4);
        let interpolator = MotionFieldInterpolator::new(ClosedFormWeight::new(size));
        let reference = [Point2D::ZERO, Point2D::ZERO];
        let current = [Point2D::ZERO];
        assert!(matches!(
            interpolator.interpolate(
                &reference,
                &current,
                &SelectedFeatureSet::new(vec![1]),
                size,
            ),
            Err(StabilizerError::InvalidParams(_))
        ));
    }

    #[test]
    fn zero_weight_is_reported() {
        let size = FrameSize::new(3, 2);
        let interpolator = MotionFieldInterpolator::new(Constant(0.0));
        assert!(matches!(
            interpolator.interpolate(
                &[Point2D::ZERO],
                &[Point2D::ZERO],
                &SelectedFeatureSet::new(vec![0]),
                size,
            ),
            Err(StabilizerError::DegenerateWeight { .. })
        ));
    }
}
