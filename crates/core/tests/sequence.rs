mod common;

use common::{interpolator, panning_frame, solid_frame};
use drba_core::config::InterpolatorConfig;
use drba_core::interpolator::SequenceInterpolator;
use drba_core::scene::SceneDetector;
use drba_core::Frame;

fn run(sequence: &mut SequenceInterpolator, frames: &[Frame]) -> Vec<Frame> {
    let mut out = Vec::new();
    for frame in frames {
        out.extend(sequence.push(frame.clone()).unwrap());
    }
    out.extend(sequence.finish().unwrap());
    out
}

fn sequence(multiplier: usize) -> SequenceInterpolator {
    let (interp, _) = interpolator(1);
    SequenceInterpolator::new(interp, SceneDetector::default(), multiplier).unwrap()
}

#[test]
fn output_count_follows_multiplier() {
    let frames: Vec<Frame> = (0..4).map(|k| panning_frame(k, 8, 16, 1.0)).collect();
    for multiplier in [2, 3, 4] {
        let mut seq = sequence(multiplier);
        let out = run(&mut seq, &frames);
        assert_eq!(out.len(), (frames.len() - 1) * multiplier + 1, "x{multiplier}");
        for (k, frame) in frames.iter().enumerate() {
            assert_eq!(&out[k * multiplier], frame, "x{multiplier} source {k}");
        }
    }
}

#[test]
fn first_push_emits_nothing() {
    let mut seq = sequence(2);
    assert!(seq.push(panning_frame(0, 8, 16, 1.0)).unwrap().is_empty());
    assert_eq!(seq.push(panning_frame(1, 8, 16, 1.0)).unwrap().len(), 2);
    assert_eq!(seq.finish().unwrap().len(), 1);
}

#[test]
fn single_frame_passes_through() {
    let mut seq = sequence(3);
    let frame = panning_frame(0, 8, 16, 1.0);
    let out = run(&mut seq, std::slice::from_ref(&frame));
    assert_eq!(out, vec![frame]);
}

#[test]
fn empty_stream_emits_nothing() {
    let mut seq = sequence(2);
    assert!(seq.finish().unwrap().is_empty());
}

#[test]
fn finish_resets_for_next_stream() {
    let frames: Vec<Frame> = (0..3).map(|k| panning_frame(k, 8, 16, 1.0)).collect();
    let mut seq = sequence(2);
    let first = run(&mut seq, &frames);
    let second = run(&mut seq, &frames);
    assert_eq!(first, second);
}

#[test]
fn scene_cut_duplicates_nearest_frames() {
    let frames = vec![
        solid_frame(8, 16, 0.1),
        solid_frame(8, 16, 0.15),
        solid_frame(8, 16, 0.9),
        solid_frame(8, 16, 0.95),
    ];
    let mut seq = sequence(2);
    let out = run(&mut seq, &frames);

    assert_eq!(out.len(), 7);
    assert_eq!(out[2], frames[1]);
    // The midpoint across the cut repeats the frame before it.
    assert_eq!(out[3], frames[1]);
    assert_eq!(out[4], frames[2]);
    assert_eq!(out[6], frames[3]);
}

#[test]
fn configured_scene_threshold_controls_cuts() {
    let frames = vec![solid_frame(8, 16, 0.1), solid_frame(8, 16, 0.15)];
    let mut config = InterpolatorConfig::default();
    config.scene.threshold = 0.02;
    let (interp, _) = interpolator(1);
    let detector = SceneDetector::from_config(&config.scene).unwrap();
    let mut seq = SequenceInterpolator::new(interp, detector, 2).unwrap();

    let out = run(&mut seq, &frames);

    assert_eq!(out, vec![frames[0].clone(), frames[0].clone(), frames[1].clone()]);
}

#[test]
fn multiplier_below_two_is_rejected() {
    let (interp, _) = interpolator(1);
    assert!(SequenceInterpolator::new(interp, SceneDetector::default(), 1).is_err());
}
