// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2021,2025 lacklustr@protonmail.com https://github.com/eadf

use super::StabilizerError;
use crate::frame::{Frame, FrameSize};
use rayon::prelude::*;

/// Running sum of aligned frames, finalized into their average.
#[derive(Debug, Clone)]
pub struct FrameAccumulator {
    sum: Frame,
    count: usize,
}

impl FrameAccumulator {
    /// An empty accumulator, `finalize()` needs at least one `accumulate()` first
    pub fn zeros(size: FrameSize, channels: usize) -> Self {
        Self {
            sum: Frame::zeros(size, channels),
            count: 0,
        }
    }

    /// An accumulator already holding the (unaligned) reference frame
    pub fn with_reference(reference: &Frame) -> Self {
        Self {
            sum: reference.clone(),
            count: 1,
        }
    }

    /// Number of frames folded in so far
    pub fn count(&self) -> usize {
        self.count
    }

    /// Element wise add of `addend` to the running sum
    pub fn accumulate(&mut self, addend: &Frame) -> Result<(), StabilizerError> {
        self.sum.check_same_shape(addend)?;
        self.sum
            .as_slice_mut()
            .par_iter_mut()
            .zip(addend.as_slice().par_iter())
            .for_each(|(s, a)| *s += *a);
        self.count += 1;
        Ok(())
    }

    /// Divide the running sum by the number of accumulated frames
    /// ```
    /// # use libstabilizer::{prelude::*, frame::{Frame, FrameSize}};
    /// # fn main() -> Result<(), StabilizerError> {
    /// let size = FrameSize::new(2, 1);
    /// let mut acc = FrameAccumulator::with_reference(&Frame::new(size, 1, vec![1.0, 2.0])?);
    /// acc.accumulate(&Frame::new(size, 1, vec![3.0, 6.0])?)?;
    /// assert_eq!(acc.finalize()?.as_slice(), &[2.0, 4.0]);
    /// # Ok(())}
    /// ```
    pub fn finalize(self) -> Result<Frame, StabilizerError> {
        if self.count == 0 {
            return Err(StabilizerError::ProcessingError(
                "Empty result after accumulation".to_string(),
            ));
        }
        let mut average = self.sum;
        let scale = 1.0 / self.count as f32;
        average.as_slice_mut().par_iter_mut().for_each(|v| *v *= scale);
        Ok(average)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn frame(size: FrameSize, seed: usize) -> Frame {
        let data = (0..size.area() * 3)
            .map(|i| ((i * 31 + seed * 17) % 256) as f32)
            .collect();
        Frame::new(size, 3, data).unwrap()
    }

    #[test]
    fn finalize_is_the_elementwise_average() {
        let size = FrameSize::new(7, 5);
        for n in 1..6 {
            let frames: Vec<_> = (0..n).map(|s| frame(size, s)).collect();
            let mut acc = FrameAccumulator::zeros(size, 3);
            for f in frames.iter() {
                acc.accumulate(f).unwrap();
            }
            assert_eq!(acc.count(), n);
            let average = acc.finalize().unwrap();
            for (k, v) in average.as_slice().iter().enumerate() {
                let expected =
                    frames.iter().map(|f| f.as_slice()[k]).sum::<f32>() / n as f32;
                assert_relative_eq!(*v, expected, max_relative = 1e-5);
            }
        }
    }

    #[test]
    fn reference_counts_once() {
        let size = FrameSize::new(3, 3);
        let mut acc = FrameAccumulator::with_reference(&Frame::zeros(size, 3));
        acc.accumulate(&frame(size, 1)).unwrap();
        assert_eq!(acc.count(), 2);
    }

    #[test]
    fn empty_accumulator_cannot_be_finalized() {
        assert!(FrameAccumulator::zeros(FrameSize::new(2, 2), 1).finalize().is_err());
    }

    #[test]
    fn shape_mismatch_is_rejected() {
        let mut acc = FrameAccumulator::zeros(FrameSize::new(2, 2), 3);
        assert!(matches!(
            acc.accumulate(&Frame::zeros(FrameSize::new(2, 2), 1)),
            Err(StabilizerError::DimensionMismatch(_))
        ));
        assert_eq!(acc.count(), 0);
    }
}
