//! Integration tests: run synthetic detector frames through the correction
//! chain, the classifiers and the running sums.

use rand::rngs::StdRng;
use rand::{RngExt, SeedableRng};
use rand_distr::{Distribution, Normal};

use frameproc::worker::process_frame;
use frameproc::{
    CommonModeAlgorithm, CommonModeConfig, CorrectionMaps, DetectorLayout, Frame, FrameError,
    FrameMetadata, HitAlgorithm, HitfinderPolicy, PipelineConfig, PipelineContext, PolicyRole,
};

fn layout() -> DetectorLayout {
    DetectorLayout::new(2, 2, 32, 32)
}

fn metadata(seq: u64) -> FrameMetadata {
    FrameMetadata {
        sequence_id: seq,
        run_number: 7,
        seconds: 1_300_000_000,
        fiducial: seq as u32,
        ..Default::default()
    }
}

/// Dark offsets around 1000 ADC.
fn dark_map(rng: &mut StdRng, n: usize) -> Vec<f32> {
    (0..n).map(|_| 900.0 + (rng.random::<f32>() * 200.0).round()).collect()
}

#[test]
fn test_dark_and_common_mode_flatten_offset_frames() {
    let _ = tracing_subscriber::fmt().with_env_filter("info").try_init();

    let layout = layout();
    let mut rng = StdRng::seed_from_u64(11);
    let dark = dark_map(&mut rng, layout.pixel_count());
    let module_offsets = [20.0f32, 35.0, 50.0, 65.0];

    let mut raw = vec![0u16; layout.pixel_count()];
    for (m, &offset) in module_offsets.iter().enumerate() {
        for i in layout.region_indices(layout.module_region(m)) {
            raw[i] = (dark[i] + offset) as u16;
        }
    }

    let algorithms = [
        CommonModeAlgorithm::Median { floor: 0.1 },
        CommonModeAlgorithm::Peak {
            window_min: -100,
            window_max: 200,
            delta: 10.0,
            peak_gap: 10.0,
        },
        CommonModeAlgorithm::SubModule {
            divisions: 2,
            floor: 0.5,
        },
    ];

    for algorithm in algorithms {
        let mut config = PipelineConfig::default();
        config.corrections.common_mode = Some(CommonModeConfig {
            algorithm: algorithm.clone(),
            ..Default::default()
        });
        let maps = CorrectionMaps::builder(layout).dark(dark.clone()).build();
        let ctx = PipelineContext::new(config, maps).unwrap();

        let outcome = process_frame(&ctx, 1, Frame::new(raw.clone(), metadata(1))).unwrap();
        assert_eq!(outcome.corrected.len(), raw.len());
        assert!(
            outcome.corrected.iter().all(|&v| v == 0.0),
            "{:?} left residual common mode",
            algorithm
        );
        assert_eq!(outcome.common_mode, module_offsets.to_vec());
    }
}

#[test]
fn test_common_mode_removes_fractional_and_high_offsets() {
    let layout = layout();
    let mut rng = StdRng::seed_from_u64(12);
    // Half-integer dark offsets leave fractional module levels.
    let dark: Vec<f32> = dark_map(&mut rng, layout.pixel_count())
        .into_iter()
        .map(|d| d + 0.5)
        .collect();
    let module_offsets = [20.0f32, 35.0, 50.0, 20000.0];

    let mut raw = vec![0u16; layout.pixel_count()];
    for (m, &offset) in module_offsets.iter().enumerate() {
        for i in layout.region_indices(layout.module_region(m)) {
            raw[i] = (dark[i] - 0.5 + offset) as u16;
        }
    }

    let algorithms = [
        CommonModeAlgorithm::Median { floor: 0.1 },
        CommonModeAlgorithm::Peak {
            window_min: -100,
            window_max: 30000,
            delta: 10.0,
            peak_gap: 10.0,
        },
        CommonModeAlgorithm::SubModule {
            divisions: 2,
            floor: 0.5,
        },
    ];

    for algorithm in algorithms {
        let mut config = PipelineConfig::default();
        config.corrections.common_mode = Some(CommonModeConfig {
            algorithm: algorithm.clone(),
            ..Default::default()
        });
        let maps = CorrectionMaps::builder(layout).dark(dark.clone()).build();
        let ctx = PipelineContext::new(config, maps).unwrap();

        let outcome = process_frame(&ctx, 1, Frame::new(raw.clone(), metadata(1))).unwrap();
        for &v in &outcome.corrected {
            assert!(v == 0.0, "{:?}: residual {}", algorithm, v);
        }
        let expected: Vec<f32> = module_offsets.iter().map(|o| o - 0.5).collect();
        assert_eq!(outcome.common_mode, expected);
    }
}

#[test]
fn test_threshold_policy_counts_bright_pixels() {
    let layout = layout();
    let mut config = PipelineConfig::default();
    config.hitfinders = vec![HitfinderPolicy {
        algorithm: HitAlgorithm::ThresholdCount,
        adc: 100.0,
        nat: 5,
        ..Default::default()
    }];
    let ctx = PipelineContext::new(config, CorrectionMaps::neutral(layout)).unwrap();

    for (bright, expect_hit) in [(5usize, true), (4, false)] {
        let mut raw = vec![0u16; layout.pixel_count()];
        for i in 0..bright {
            raw[i * 97] = 150;
        }
        let outcome = process_frame(&ctx, 1, Frame::new(raw, metadata(bright as u64))).unwrap();
        assert_eq!(outcome.is_hit, expect_hit);
        assert_eq!(outcome.classifications[0].peak_count, bright);
    }
}

#[test]
fn test_connected_component_hit_on_noisy_frame() {
    let _ = tracing_subscriber::fmt().with_env_filter("warn").try_init();

    let layout = layout();
    let mut rng = StdRng::seed_from_u64(42);
    let noise = Normal::new(0.0f32, 5.0).unwrap();
    let dark = dark_map(&mut rng, layout.pixel_count());

    let mut config = PipelineConfig::default();
    config.hitfinders = vec![HitfinderPolicy {
        adc: 100.0,
        min_pix_count: 3,
        max_pix_count: 20,
        npeaks: 4,
        npeaks_max: 100,
        ..Default::default()
    }];
    let maps = CorrectionMaps::builder(layout).dark(dark.clone()).build();
    let ctx = PipelineContext::new(config, maps).unwrap();

    let mut corrected_truth: Vec<f32> = (0..layout.pixel_count())
        .map(|_| noise.sample(&mut rng).abs().min(40.0))
        .collect();
    // Four 2×2 spots, one in each module's interior.
    for m in 0..layout.module_count() {
        let region = layout.module_region(m);
        let (r, c) = (region.row0 + 10, region.col0 + 12);
        for (dr, dc) in [(0, 0), (0, 1), (1, 0), (1, 1)] {
            corrected_truth[layout.index(r + dr, c + dc)] = 500.0;
        }
    }
    let raw: Vec<u16> = corrected_truth
        .iter()
        .zip(&dark)
        .map(|(&v, &d)| (v + d).round() as u16)
        .collect();

    let outcome = process_frame(&ctx, 1, Frame::new(raw, metadata(1))).unwrap();
    assert_eq!(outcome.classifications[0].peak_count, 4);
    assert!(outcome.is_hit);
}

#[test]
fn test_bad_pixels_and_gain_are_applied() {
    let layout = DetectorLayout::new(1, 1, 4, 4);
    let n = layout.pixel_count();
    let mut bad = vec![false; n];
    bad[3] = true;
    let maps = CorrectionMaps::builder(layout)
        .gain_factors(vec![2.0; n])
        .bad_pixels(bad)
        .build();

    let mut config = PipelineConfig::default();
    config.corrections.apply_gain = true;
    config.corrections.apply_bad_pixel_mask = true;
    let ctx = PipelineContext::new(config, maps).unwrap();

    let outcome = process_frame(&ctx, 1, Frame::new(vec![10; n], metadata(1))).unwrap();
    assert_eq!(outcome.corrected[3], 0.0);
    assert!(outcome
        .corrected
        .iter()
        .enumerate()
        .all(|(i, &v)| i == 3 || v == 20.0));
}

#[test]
fn test_mismatched_calibration_falls_back_to_neutral() {
    let layout = DetectorLayout::new(1, 1, 4, 4);
    let maps = CorrectionMaps::builder(layout).dark(vec![5.0; 3]).build();
    let ctx = PipelineContext::new(PipelineConfig::default(), maps).unwrap();
    let outcome = process_frame(&ctx, 1, Frame::new(vec![10; 16], metadata(1))).unwrap();
    assert!(outcome.corrected.iter().all(|&v| v == 10.0));
}

#[test]
fn test_background_learns_only_from_non_hits() {
    let layout = DetectorLayout::new(1, 1, 8, 8);
    let n = layout.pixel_count();
    let mut config = PipelineConfig::default();
    config.corrections.background = Some(frameproc::BackgroundConfig {
        memory: 4,
        ..Default::default()
    });
    config.hitfinders = vec![HitfinderPolicy {
        algorithm: HitAlgorithm::ThresholdCount,
        adc: 1000.0,
        nat: 1,
        ..Default::default()
    }];
    let ctx = PipelineContext::new(config, CorrectionMaps::neutral(layout)).unwrap();

    for seq in 0..20 {
        process_frame(&ctx, seq + 1, Frame::new(vec![40; n], metadata(seq))).unwrap();
    }
    let background = ctx.corrections().background().unwrap();
    let updates = background.updates();
    assert!(background.image().iter().all(|&v| (v - 40.0).abs() < 1.0));

    // A hit frame does not move the background.
    let hit = process_frame(&ctx, 21, Frame::new(vec![2000; n], metadata(20))).unwrap();
    assert!(hit.is_hit);
    assert_eq!(background.updates(), updates);

    // The learned background is removed from the next quiet frame.
    let quiet = process_frame(&ctx, 22, Frame::new(vec![40; n], metadata(21))).unwrap();
    assert!(quiet.corrected.iter().all(|&v| v.abs() < 1.0));
}

#[test]
fn test_hot_pixels_are_suppressed_after_repeating() {
    let layout = DetectorLayout::new(1, 1, 8, 8);
    let n = layout.pixel_count();
    let mut config = PipelineConfig::default();
    config.corrections.hot_pixels = Some(frameproc::HotPixelConfig {
        adc: 500.0,
        memory: 10,
        max_frequency: 0.5,
    });
    let ctx = PipelineContext::new(config, CorrectionMaps::neutral(layout)).unwrap();

    let mut raw = vec![10u16; n];
    raw[17] = 4000;
    let first = process_frame(&ctx, 1, Frame::new(raw.clone(), metadata(1))).unwrap();
    assert_eq!(first.corrected[17], 4000.0);

    let mut last = first;
    for seq in 2..=30 {
        last = process_frame(&ctx, seq, Frame::new(raw.clone(), metadata(seq))).unwrap();
    }
    assert_eq!(last.corrected[17], 0.0);
    assert!(last.hot_pixels >= 1);
    assert_eq!(last.corrected[16], 10.0);
}

#[test]
fn test_polarization_needs_detector_distance() {
    let layout = DetectorLayout::new(1, 1, 8, 8);
    let mut config = PipelineConfig::default();
    config.dump_all = true;
    config.corrections.polarization = Some(Default::default());
    config.angular.enabled = true;
    let ctx = PipelineContext::new(config, CorrectionMaps::neutral(layout)).unwrap();

    let outcome = process_frame(&ctx, 1, Frame::new(vec![100; 64], metadata(1))).unwrap();
    let steps: Vec<&str> = outcome
        .skipped
        .iter()
        .map(|e| match e {
            FrameError::Precondition { step, .. } => *step,
            FrameError::Input { .. } => "input",
        })
        .collect();
    assert_eq!(steps, vec!["polarization correction", "q calibration"]);
    assert!(outcome.corrected.iter().all(|&v| v == 100.0));
    assert!(outcome.angular.as_ref().is_some_and(|a| a.q.is_none()));

    let mut meta = metadata(2);
    meta.detector_position_mm = 100.0;
    meta.wavelength_a = 1.3;
    let outcome = process_frame(&ctx, 2, Frame::new(vec![100; 64], meta)).unwrap();
    assert!(outcome.skipped.is_empty());
    assert!(outcome.angular.unwrap().q.is_some());
    // The factor is at most 1, so corrected intensities can only grow.
    assert!(outcome.corrected.iter().all(|&v| v >= 100.0));
}

#[test]
fn test_darkcal_class_collects_every_frame() {
    let layout = DetectorLayout::new(1, 1, 4, 4);
    let mut config = PipelineConfig::default();
    config.aggregate.generate_darkcal = true;
    config.hitfinders = vec![HitfinderPolicy::named("standard", PolicyRole::Hit)];
    let ctx = PipelineContext::new(config, CorrectionMaps::neutral(layout)).unwrap();

    for seq in 1..=6u64 {
        process_frame(&ctx, seq, Frame::new(vec![seq as u16; 16], metadata(seq))).unwrap();
    }
    let darkcal = ctx.aggregator().class("darkcal").unwrap().snapshot();
    assert_eq!(darkcal.frames, 6);
    assert!(darkcal.mean.iter().all(|&v| (v - 3.5).abs() < 1e-6));
    assert_eq!(ctx.aggregator().class("standard").unwrap().frames(), 0);
}
