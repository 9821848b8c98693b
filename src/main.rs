// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2021,2025 lacklustr@protonmail.com https://github.com/eadf

use argh::FromArgs;
use libstabilizer::diagnostics::{ImageSink, NullSink};
use libstabilizer::prelude::*;
use libstabilizer::utils::{
    GoodFeaturesDetector, ImwriteSink, OpenCvVideoSource, PyrLkTracker, imwrite,
};
use std::path::PathBuf;

/// Averages a span of video frames into one still image, morphing every frame onto the first
#[derive(Debug, FromArgs)]
struct Args {
    /// video file
    #[argh(positional, default = "PathBuf::from(\"mini_waterfall.avi\")")]
    input: PathBuf,

    /// number of frames aligned onto the reference frame
    #[argh(option, short = 'n', default = "30")]
    frames: usize,

    /// index of the reference frame, centered in the clip by default
    #[argh(option, short = 's')]
    start: Option<usize>,

    /// directory of the result and the debug images
    #[argh(option, short = 'o', default = "PathBuf::from(\".\")")]
    output_dir: PathBuf,

    /// write the intermediate images
    #[argh(switch, short = 'd')]
    debug_images: bool,

    /// nearest neighbour instead of bilinear resampling
    #[argh(switch)]
    nearest: bool,

    /// evaluate the weight function exactly instead of using a lookup table
    #[argh(switch)]
    closed_form: bool,

    /// skip the second, region restricted, feature detection
    #[argh(switch)]
    no_refine: bool,
}

fn main() -> Result<(), StabilizerError> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args: Args = argh::from_env();

    let mut params = StabilizeParameters {
        num_frames: args.frames,
        start_frame: args.start,
        refine_features: !args.no_refine,
        debug_images: args.debug_images,
        ..Default::default()
    };
    if args.nearest {
        params.morph.interpolation = InterpolationMode::Nearest;
    }
    if args.closed_form {
        params.morph.weight = WeightEvaluation::ClosedForm;
    }

    let stem = args
        .input
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("output")
        .to_string();
    let mut sink: Box<dyn ImageSink> = if args.debug_images {
        Box::new(ImwriteSink::new(args.output_dir.clone(), stem.as_str()))
    } else {
        Box::new(NullSink)
    };

    let now = std::time::Instant::now();
    let output = stabilize(
        || OpenCvVideoSource::open(&args.input),
        &mut GoodFeaturesDetector::new(params.detection),
        &mut PyrLkTracker::default(),
        sink.as_mut(),
        &params,
    )?;
    log::info!(
        "Calculated stabilize() in {:?}, {} frames aligned with {} features",
        now.elapsed(),
        output.frames_aligned,
        output.selected_features.len()
    );

    let result = args.output_dir.join(format!("{stem}_avg.jpg"));
    imwrite(&result, &output.average)?;
    log::info!("wrote {}", result.display());
    Ok(())
}
