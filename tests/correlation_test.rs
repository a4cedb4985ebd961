//! Integration tests: angular correlation on synthetic scattering patterns.

use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

use frameproc::correlation::PolarGrid;
use frameproc::worker::process_frame;
use frameproc::{
    CorrectionMaps, CorrelationAlgorithm, CorrelationConfig, CorrelationEngine, CorrelationLut,
    CorrelationMode, DetectorLayout, Frame, FrameMetadata, Normalization, PipelineConfig,
    PipelineContext, PixelGeometry, RemapMode,
};

fn geometry() -> (DetectorLayout, PixelGeometry) {
    let layout = DetectorLayout::new(2, 2, 24, 24);
    let geometry = PixelGeometry::regular(&layout, 110.0);
    (layout, geometry)
}

fn base_config() -> CorrelationConfig {
    CorrelationConfig {
        enabled: true,
        n_q: 6,
        n_phi: 16,
        q_min: 4.0,
        q_max: Some(16.0),
        ..Default::default()
    }
}

/// Intensity constant over each radial bin of `grid`, zero outside it.
fn isotropic_frame(geometry: &PixelGeometry, grid: &PolarGrid) -> Vec<f32> {
    geometry
        .positions()
        .iter()
        .map(|p| match grid.bin(p.x as f64, p.y as f64) {
            Some((q, _)) => 10.0 + 3.0 * q as f32,
            None => 0.0,
        })
        .collect()
}

#[test]
fn test_isotropic_pattern_is_uniform_in_lag() {
    let _ = tracing_subscriber::fmt().with_env_filter("info").try_init();

    let (_, geom) = geometry();
    for algorithm in [CorrelationAlgorithm::Direct, CorrelationAlgorithm::Fft] {
        let config = CorrelationConfig {
            mode: CorrelationMode::Cross,
            algorithm,
            subtract_angular_mean: false,
            ..base_config()
        };
        let engine = CorrelationEngine::new(config, &geom).unwrap();
        let frame = isotropic_frame(&geom, engine.grid());
        let result = engine.correlate(&frame, &geom, None);

        assert_eq!(result.values.len(), 6 * 6 * 9);
        for q1 in 0..6 {
            for q2 in 0..6 {
                let lags = result.lags(q1, q2).unwrap();
                for &v in lags {
                    assert!(
                        (v - 1.0).abs() < 1e-9,
                        "{:?}: C({}, {}) = {} not uniform",
                        algorithm,
                        q1,
                        q2,
                        v
                    );
                }
            }
        }
    }
}

#[test]
fn test_isotropic_pattern_is_flat_with_default_settings() {
    let (_, geom) = geometry();
    assert!(CorrelationConfig::default().subtract_angular_mean);
    for mode in [CorrelationMode::Auto, CorrelationMode::Cross] {
        for algorithm in [CorrelationAlgorithm::Direct, CorrelationAlgorithm::Fft] {
            let config = CorrelationConfig {
                mode,
                algorithm,
                ..base_config()
            };
            let engine = CorrelationEngine::new(config, &geom).unwrap();
            let frame = isotropic_frame(&geom, engine.grid());
            let result = engine.correlate(&frame, &geom, None);

            let pairs: Vec<(usize, usize)> = match mode {
                CorrelationMode::Auto => (0..6).map(|q| (q, q)).collect(),
                CorrelationMode::Cross => (0..6).flat_map(|a| (0..6).map(move |b| (a, b))).collect(),
            };
            for (q1, q2) in pairs {
                let lags = result.lags(q1, q2).unwrap();
                assert_eq!(lags.len(), 9);
                for &v in lags {
                    assert!(
                        (v - lags[0]).abs() < 1e-9 && v.abs() < 1e-9,
                        "{:?}/{:?}: C({}, {}) = {} varies with lag",
                        mode,
                        algorithm,
                        q1,
                        q2,
                        v
                    );
                }
            }
        }
    }
}

#[test]
fn test_isotropic_pattern_without_intensity_normalization() {
    let (_, geom) = geometry();
    let config = CorrelationConfig {
        mode: CorrelationMode::Cross,
        subtract_angular_mean: false,
        normalization: Normalization::PairCount,
        ..base_config()
    };
    let engine = CorrelationEngine::new(config, &geom).unwrap();
    let frame = isotropic_frame(&geom, engine.grid());
    let result = engine.correlate(&frame, &geom, None);

    for q1 in 0..6 {
        for q2 in 0..6 {
            let expected = (10.0 + 3.0 * q1 as f64) * (10.0 + 3.0 * q2 as f64);
            assert!(result
                .lags(q1, q2)
                .unwrap()
                .iter()
                .all(|&v| (v - expected).abs() < 1e-9 * expected));
        }
    }
    assert!((result.angular_average[2] - 16.0).abs() < 1e-9);
}

#[test]
fn test_direct_and_fft_agree_on_speckle() {
    let (_, geom) = geometry();
    let mut rng = StdRng::seed_from_u64(7);
    let speckle = Normal::new(200.0f32, 40.0).unwrap();
    let frame: Vec<f32> = (0..geom.len()).map(|_| speckle.sample(&mut rng)).collect();

    for mode in [CorrelationMode::Auto, CorrelationMode::Cross] {
        let run = |algorithm| {
            let config = CorrelationConfig {
                mode,
                algorithm,
                n_phi: 32,
                ..base_config()
            };
            CorrelationEngine::new(config, &geom)
                .unwrap()
                .correlate(&frame, &geom, None)
        };
        let direct = run(CorrelationAlgorithm::Direct);
        let fft = run(CorrelationAlgorithm::Fft);
        assert_eq!(direct.values.len(), fft.values.len());
        for q in 0..6 {
            let d = direct.lags(q, q).unwrap();
            let f = fft.lags(q, q).unwrap();
            for (a, b) in d.iter().zip(f) {
                assert!(
                    (a - b).abs() <= 1e-6 * a.abs() + 1e-12,
                    "{:?} q={}: direct {} vs fft {}",
                    mode,
                    q,
                    a,
                    b
                );
            }
        }
    }
}

#[test]
fn test_lookup_table_remap_round_trips_through_rkyv() {
    let (layout, geom) = geometry();
    let config = CorrelationConfig {
        remap: RemapMode::Lookup {
            nx: layout.width(),
            ny: layout.height(),
        },
        ..base_config()
    };
    let engine = CorrelationEngine::new(config.clone(), &geom).unwrap();
    let lut = engine.lut().unwrap();
    let bytes = lut.to_rkyv_bytes().unwrap();
    let restored = CorrelationLut::from_rkyv_bytes(&bytes).unwrap();
    assert_eq!(&restored, lut);

    // One node per pixel: the table reproduces direct binning exactly.
    let direct = CorrelationEngine::new(base_config(), &geom).unwrap();
    let mut rng = StdRng::seed_from_u64(9);
    let noise = Normal::new(50.0f32, 5.0).unwrap();
    let frame: Vec<f32> = (0..geom.len()).map(|_| noise.sample(&mut rng)).collect();
    let a = engine.correlate(&frame, &geom, None);
    let b = direct.correlate(&frame, &geom, None);
    for (x, y) in a.values.iter().zip(&b.values) {
        assert!((x - y).abs() <= 1e-9 * x.abs().max(1.0));
    }

    // The restored table drives a whole pipeline.
    let mut pipeline = PipelineConfig::default();
    pipeline.dump_all = true;
    pipeline.correlation = Some(config);
    pipeline.aggregate.sum_correlation = true;
    let ctx =
        PipelineContext::with_correlation_lut(pipeline, CorrectionMaps::neutral(layout), restored)
            .unwrap();
    let raw: Vec<u16> = frame.iter().map(|&v| v.round().max(0.0) as u16).collect();
    let outcome = process_frame(
        &ctx,
        1,
        Frame::new(
            raw,
            FrameMetadata {
                sequence_id: 1,
                ..Default::default()
            },
        ),
    )
    .unwrap();
    assert!(outcome.correlation.is_some());
}

#[test]
fn test_correlation_sums_accumulate_per_class() {
    let (layout, geom) = geometry();
    let mut config = PipelineConfig::default();
    config.dump_all = true;
    config.correlation = Some(base_config());
    config.aggregate.sum_correlation = true;
    config.hitfinders = vec![frameproc::HitfinderPolicy::named(
        "water",
        frameproc::PolicyRole::Background,
    )];
    let ctx = PipelineContext::new(config, CorrectionMaps::neutral(layout)).unwrap();

    let mut rng = StdRng::seed_from_u64(5);
    let noise = Normal::new(30.0f32, 3.0).unwrap();
    let mut expected = vec![0.0f64; 6 * 9];
    for seq in 1..=4u64 {
        let raw: Vec<u16> = (0..geom.len())
            .map(|_| noise.sample(&mut rng).round().max(0.0) as u16)
            .collect();
        let outcome = process_frame(
            &ctx,
            seq,
            Frame::new(
                raw,
                FrameMetadata {
                    sequence_id: seq,
                    ..Default::default()
                },
            ),
        )
        .unwrap();
        for (e, v) in expected.iter_mut().zip(&outcome.correlation.unwrap().values) {
            *e += v / 4.0;
        }
    }

    let snapshot = ctx.aggregator().class("water").unwrap().snapshot();
    assert_eq!(snapshot.frames, 4);
    assert_eq!(snapshot.correlation_frames, 4);
    assert_eq!(snapshot.correlation_mean.len(), expected.len());
    for (m, e) in snapshot.correlation_mean.iter().zip(&expected) {
        assert!((m - e).abs() <= 1e-9 * e.abs().max(1e-6));
    }
}
