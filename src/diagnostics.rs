// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2021,2025 lacklustr@protonmail.com https://github.com/eadf

//! Debug images of the intermediate pipeline stages.

use super::StabilizerError;
use crate::feature::SelectedFeatureSet;
use crate::frame::{Frame, Point2D};

/// BGR color of selected features
pub const SELECTED_COLOR: [f32; 3] = [0.0, 255.0, 0.0];
/// BGR color of rejected features
pub const REJECTED_COLOR: [f32; 3] = [0.0, 0.0, 255.0];

const MARKER_RADIUS: i64 = 2;

/// Receives named intermediate images
pub trait ImageSink {
    fn save(&mut self, name: &str, image: &Frame) -> Result<(), StabilizerError>;
}

/// Discards every image
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl ImageSink for NullSink {
    fn save(&mut self, _name: &str, _image: &Frame) -> Result<(), StabilizerError> {
        Ok(())
    }
}

/// Hand `image` to `sink`, a failure is logged and otherwise ignored
pub fn save_or_warn<S: ImageSink + ?Sized>(sink: &mut S, name: &str, image: &Frame) {
    if let Err(err) = sink.save(name, image) {
        log::warn!("could not save debug image {name}: {err}");
    }
}

/// A copy of `frame` with a square marker on every feature position,
/// green for the `selected` features and red for the others.
pub fn draw_features(
    frame: &Frame,
    positions: &[Point2D],
    selected: &SelectedFeatureSet,
) -> Frame {
    let mut canvas = frame.clone();
    for (i, p) in positions.iter().enumerate() {
        let color = if selected.contains(i) {
            SELECTED_COLOR
        } else {
            REJECTED_COLOR
        };
        draw_marker(&mut canvas, *p, &color);
    }
    canvas
}

/// A copy of `frame` with a line from the reference position to the current
/// position of every selected feature.
/// ```
/// # use libstabilizer::{prelude::*, diagnostics::draw_motion_vectors};
/// # use libstabilizer::frame::{Frame, FrameSize, Point2D};
/// let frame = Frame::zeros(FrameSize::new(20, 20), 3);
/// let drawn = draw_motion_vectors(
///     &frame,
///     &[Point2D::new(2.0, 10.0)],
///     &[Point2D::new(12.0, 10.0)],
///     &SelectedFeatureSet::new(vec![0]),
/// );
/// assert_eq!(drawn.pixel(7, 10), Some(&[0.0, 255.0, 0.0][..]));
/// assert_eq!(drawn.pixel(7, 3), Some(&[0.0, 0.0, 0.0][..]));
/// ```
pub fn draw_motion_vectors(
    frame: &Frame,
    reference: &[Point2D],
    current: &[Point2D],
    selected: &SelectedFeatureSet,
) -> Frame {
    let mut canvas = frame.clone();
    for i in selected.iter() {
        if let (Some(from), Some(to)) = (reference.get(i), current.get(i)) {
            draw_line(&mut canvas, *from, *to, &SELECTED_COLOR);
            draw_marker(&mut canvas, *to, &SELECTED_COLOR);
        }
    }
    canvas
}

fn draw_marker(canvas: &mut Frame, p: Point2D, color: &[f32]) {
    if !(p.x.is_finite() && p.y.is_finite()) {
        return;
    }
    let (cx, cy) = (p.x.round() as i64, p.y.round() as i64);
    for d in -MARKER_RADIUS..=MARKER_RADIUS {
        canvas.put_pixel(cx + d, cy - MARKER_RADIUS, color);
        canvas.put_pixel(cx + d, cy + MARKER_RADIUS, color);
        canvas.put_pixel(cx - MARKER_RADIUS, cy + d, color);
        canvas.put_pixel(cx + MARKER_RADIUS, cy + d, color);
    }
}

fn draw_line(canvas: &mut Frame, from: Point2D, to: Point2D, color: &[f32]) {
    let delta = to - from;
    let steps = delta.x.abs().max(delta.y.abs()).ceil();
    if !steps.is_finite() {
        return;
    }
    // clip absurd tracker output to something drawable
    let steps = (steps as i64).min(4 * (canvas.width() + canvas.height()) as i64);
    let increment = if steps > 0 {
        delta * (1.0 / steps as f32)
    } else {
        Point2D::ZERO
    };
    let mut p = from;
    for _ in 0..=steps {
        canvas.put_pixel(p.x.round() as i64, p.y.round() as i64, color);
        p += increment;
    }
}
