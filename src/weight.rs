// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2021,2025 lacklustr@protonmail.com https://github.com/eadf

//! Radial falloff functions weighting the influence of a feature on a pixel.

use super::{StabilizerError, WeightEvaluation};
use crate::frame::FrameSize;

/// Maps the distance between a pixel and a feature to the influence of that
/// feature on the pixel. Implementations are monotonically non-increasing in
/// `distance` and strictly positive.
pub trait WeightFunction {
    fn weight(&self, distance: f32) -> f32;
}

/// Mirrored sigmoid like falloff, `r_max` is the larger of the frame width and height.
///
/// `0.9^(100 r / r_max) + 10 exp(-0.1 r² / r_max) + 1`
///
/// The trailing `+ 1` keeps a residual influence of every feature anywhere in the frame.
/// ```
/// # use libstabilizer::weight::mirrored_sigmoid;
/// assert_eq!(mirrored_sigmoid(0.0, 640.0), 12.0);
/// assert!(mirrored_sigmoid(1.0e6, 640.0) >= 1.0);
/// ```
#[inline]
pub fn mirrored_sigmoid(distance: f32, r_max: f32) -> f32 {
    0.9_f32.powf(100.0 * distance / r_max)
        + 10.0 * (-0.1 * distance * distance / r_max).exp()
        + 1.0
}

/// Evaluates `mirrored_sigmoid()` for every query
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClosedFormWeight {
    r_max: f32,
}

impl ClosedFormWeight {
    pub fn new(size: FrameSize) -> Self {
        Self {
            r_max: size.max_dimension().max(1.0),
        }
    }
}

impl WeightFunction for ClosedFormWeight {
    #[inline]
    fn weight(&self, distance: f32) -> f32 {
        mirrored_sigmoid(distance, self.r_max)
    }
}

/// `mirrored_sigmoid()` sampled at evenly spaced distances over `[0, frame diagonal]`,
/// queries are linearly interpolated between the two bracketing samples.
#[derive(Debug, Clone, PartialEq)]
pub struct LookupWeight {
    step: f32,
    max_distance: f32,
    // samples + 1 values, the last one sits exactly on `max_distance`
    table: Vec<f32>,
}

impl LookupWeight {
    pub fn new(size: FrameSize, samples: usize) -> Result<Self, StabilizerError> {
        if samples == 0 {
            return Err(StabilizerError::InvalidParams(
                "the weight lookup table needs at least one sample".to_string(),
            ));
        }
        let closed_form = ClosedFormWeight::new(size);
        let max_distance = size.diagonal().max(1.0);
        let step = max_distance / samples as f32;
        let table = (0..=samples)
            .map(|i| closed_form.weight(i as f32 * step))
            .collect();
        Ok(Self {
            step,
            max_distance,
            table,
        })
    }

    /// Distance between two consecutive samples
    pub fn step(&self) -> f32 {
        self.step
    }
}

impl WeightFunction for LookupWeight {
    #[inline]
    fn weight(&self, distance: f32) -> f32 {
        // distances beyond the diagonal (and NaN) get the value of the last sample
        let distance = if distance.is_finite() {
            distance.clamp(0.0, self.max_distance)
        } else {
            self.max_distance
        };
        let last = self.table.len() - 2;
        let idx = ((distance / self.step) as usize).min(last);
        let t = ((distance - idx as f32 * self.step) / self.step).clamp(0.0, 1.0);
        (1.0 - t) * self.table[idx] + t * self.table[idx + 1]
    }
}

/// The weight function configured by `WeightEvaluation`, built for one frame size
#[derive(Debug, Clone, PartialEq)]
pub enum Weight {
    ClosedForm(ClosedFormWeight),
    Lookup(LookupWeight),
}

impl Weight {
    pub fn new(evaluation: WeightEvaluation, size: FrameSize) -> Result<Self, StabilizerError> {
        Ok(match evaluation {
            WeightEvaluation::ClosedForm => Weight::ClosedForm(ClosedFormWeight::new(size)),
            WeightEvaluation::LookupTable { samples } => {
                Weight::Lookup(LookupWeight::new(size, samples)?)
            }
        })
    }
}

impl WeightFunction for Weight {
    #[inline]
    fn weight(&self, distance: f32) -> f32 {
        match self {
            Weight::ClosedForm(w) => w.weight(distance),
            Weight::Lookup(w) => w.weight(distance),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    const SIZE: FrameSize = FrameSize::new(640, 480);

    #[test]
    fn closed_form_is_positive_and_non_increasing() {
        let w = ClosedFormWeight::new(SIZE);
        let mut previous = f32::INFINITY;
        for i in 0..2000 {
            let r = i as f32 * 0.5;
            let v = w.weight(r);
            assert!(v > 0.0, "weight({r}) = {v}");
            assert!(v <= previous, "weight({r}) = {v} > {previous}");
            previous = v;
        }
    }

    #[test]
    fn closed_form_never_drops_below_one() {
        let w = ClosedFormWeight::new(SIZE);
        assert!(w.weight(1.0e9) >= 1.0);
        // both falloff terms underflow to zero far away
        assert_eq!(mirrored_sigmoid(1.0e6, 640.0), 1.0);
        assert_relative_eq!(w.weight(0.0), 12.0);
    }

    #[test]
    fn lookup_agrees_with_closed_form_within_step() {
        for size in [FrameSize::new(100, 100), SIZE, FrameSize::new(1920, 1080)] {
            let exact = ClosedFormWeight::new(size);
            let lookup = LookupWeight::new(size, 500).unwrap();
            let step = lookup.step();
            let n = 5000;
            for i in 0..=n {
                let r = size.diagonal() * i as f32 / n as f32;
                let err = (lookup.weight(r) - exact.weight(r)).abs();
                assert!(err <= step, "size:{size:?} r:{r} err:{err} step:{step}");
            }
        }
    }

    #[test]
    fn lookup_is_exact_on_samples() {
        let exact = ClosedFormWeight::new(SIZE);
        let lookup = LookupWeight::new(SIZE, 500).unwrap();
        for i in [0_usize, 1, 250, 499] {
            let r = i as f32 * lookup.step();
            assert_relative_eq!(lookup.weight(r), exact.weight(r), max_relative = 1e-4);
        }
    }

    #[test]
    fn lookup_handles_out_of_range_distances() {
        let lookup = LookupWeight::new(SIZE, 500).unwrap();
        let at_end = lookup.weight(SIZE.diagonal());
        assert_eq!(lookup.weight(SIZE.diagonal() * 3.0), at_end);
        assert_eq!(lookup.weight(f32::NAN), at_end);
        assert_eq!(lookup.weight(-5.0), lookup.weight(0.0));
        assert!(at_end > 0.0);
    }

    #[test]
    fn lookup_is_non_increasing() {
        let lookup = LookupWeight::new(FrameSize::new(100, 100), 500).unwrap();
        let mut previous = f32::INFINITY;
        for i in 0..1500 {
            let v = lookup.weight(i as f32 * 0.1);
            assert!(v <= previous + 1e-4);
            previous = v;
        }
    }

    #[test]
    fn zero_samples_is_rejected() {
        assert!(matches!(
            LookupWeight::new(SIZE, 0),
            Err(StabilizerError::InvalidParams(_))
        ));
    }
}
