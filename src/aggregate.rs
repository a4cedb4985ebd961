//! Running per-class sums over the frame stream.
//!
//! Each class ("standard", "water", "ice", "darkcal", ...) owns three
//! independently locked accumulators: raw-layout sum and sum of squares,
//! assembled-image sum, and correlation sum. Unrelated classes never contend
//! and the three sums of one class are updated under separate locks. The raw
//! frame counter lives under the raw lock, so it always equals the number of
//! `accumulate` calls applied.

use parking_lot::Mutex;
use tracing::warn;

use crate::angular::{angular_average, AngularConfig, AngularProfile};
use crate::maps::PixelGeometry;

/// Name of the class fed by every processed frame when darkcal generation
/// is enabled.
pub const DARKCAL_CLASS: &str = "darkcal";

/// Configuration of the running sums.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateConfig {
    /// Accumulate selected frames into their classes.
    /// Default: true
    pub enabled: bool,

    /// Keep raw-layout sums (and sums of squares).
    /// Default: true
    pub save_raw: bool,

    /// Assembled pixels at or below this value are not added.
    /// Default: 0.0
    pub powder_threshold: f32,

    /// Add correlation results into the correlation sum.
    /// Default: false
    pub sum_correlation: bool,

    /// Maintain the [`DARKCAL_CLASS`] from every frame past warm-up,
    /// regardless of classification.
    /// Default: false
    pub generate_darkcal: bool,
}

impl Default for AggregateConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            save_raw: true,
            powder_threshold: 0.0,
            sum_correlation: false,
            generate_darkcal: false,
        }
    }
}

#[derive(Default)]
struct RawSums {
    frames: u64,
    sum: Vec<f64>,
    sum_sq: Vec<f64>,
}

#[derive(Default)]
struct ImageSum {
    frames: u64,
    sum: Vec<f64>,
}

impl ImageSum {
    fn add<T: Copy + Into<f64>>(&mut self, class: &str, what: &str, values: &[T], threshold: Option<f64>) {
        if self.sum.is_empty() {
            self.sum = vec![0.0; values.len()];
        } else if self.sum.len() != values.len() {
            warn!(
                "{}: {} sum has {} values, frame has {}; not added",
                class,
                what,
                self.sum.len(),
                values.len()
            );
            return;
        }
        for (s, &v) in self.sum.iter_mut().zip(values) {
            let v: f64 = v.into();
            if threshold.is_none_or(|t| v > t) {
                *s += v;
            }
        }
        self.frames += 1;
    }

    fn mean(&self) -> Vec<f64> {
        let n = self.frames.max(1) as f64;
        self.sum.iter().map(|&s| s / n).collect()
    }
}

/// The running sums of one class.
pub struct RunningAggregate {
    name: String,
    assembled_threshold: Option<f64>,
    raw: Mutex<RawSums>,
    assembled: Mutex<ImageSum>,
    correlation: Mutex<ImageSum>,
}

impl RunningAggregate {
    /// `assembled_threshold`: assembled pixels at or below it are skipped;
    /// `None` adds every pixel.
    pub fn new(name: impl Into<String>, pixel_count: usize, assembled_threshold: Option<f32>) -> Self {
        Self {
            name: name.into(),
            assembled_threshold: assembled_threshold.map(f64::from),
            raw: Mutex::new(RawSums {
                frames: 0,
                sum: vec![0.0; pixel_count],
                sum_sq: vec![0.0; pixel_count],
            }),
            assembled: Mutex::new(ImageSum::default()),
            correlation: Mutex::new(ImageSum::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add one frame's raw-layout corrected buffer.
    pub fn add_raw(&self, corrected: &[f32], save_raw: bool) {
        let mut raw = self.raw.lock();
        raw.frames += 1;
        if !save_raw {
            return;
        }
        let RawSums { sum, sum_sq, .. } = &mut *raw;
        for ((s, q), &v) in sum.iter_mut().zip(sum_sq.iter_mut()).zip(corrected) {
            let v = v as f64;
            *s += v;
            *q += v * v;
        }
    }

    pub fn add_assembled(&self, image: &[f32]) {
        self.assembled
            .lock()
            .add(&self.name, "assembled", image, self.assembled_threshold);
    }

    pub fn add_correlation(&self, values: &[f64]) {
        self.correlation
            .lock()
            .add(&self.name, "correlation", values, None);
    }

    /// Frames added so far.
    pub fn frames(&self) -> u64 {
        self.raw.lock().frames
    }

    /// Clear every sum, holding all three locks.
    pub fn reset(&self) {
        let mut raw = self.raw.lock();
        let mut assembled = self.assembled.lock();
        let mut correlation = self.correlation.lock();
        raw.frames = 0;
        raw.sum.iter_mut().for_each(|v| *v = 0.0);
        raw.sum_sq.iter_mut().for_each(|v| *v = 0.0);
        *assembled = ImageSum::default();
        *correlation = ImageSum::default();
    }

    pub fn snapshot(&self) -> AggregateSnapshot {
        let (frames, sum, mean, variance) = {
            let raw = self.raw.lock();
            let n = raw.frames.max(1) as f64;
            let mean: Vec<f32> = raw.sum.iter().map(|&s| (s / n) as f32).collect();
            let variance = raw
                .sum
                .iter()
                .zip(&raw.sum_sq)
                .map(|(&s, &q)| {
                    let m = s / n;
                    (q / n - m * m).max(0.0) as f32
                })
                .collect();
            (raw.frames, raw.sum.clone(), mean, variance)
        };
        let (assembled_frames, assembled_mean): (u64, Vec<f32>) = {
            let a = self.assembled.lock();
            (a.frames, a.mean().into_iter().map(|v| v as f32).collect())
        };
        let (correlation_frames, correlation_mean) = {
            let c = self.correlation.lock();
            (c.frames, c.mean())
        };

        AggregateSnapshot {
            name: self.name.clone(),
            frames,
            sum,
            mean,
            variance,
            assembled_frames,
            assembled_mean,
            correlation_frames,
            correlation_mean,
        }
    }
}

/// Point-in-time copy of one class's running sums.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateSnapshot {
    pub name: String,
    pub frames: u64,
    /// Raw-layout sum.
    pub sum: Vec<f64>,
    pub mean: Vec<f32>,
    pub variance: Vec<f32>,
    pub assembled_frames: u64,
    /// Empty until an assembled image has been added.
    pub assembled_mean: Vec<f32>,
    pub correlation_frames: u64,
    /// Empty until a correlation has been added.
    pub correlation_mean: Vec<f64>,
}

impl AggregateSnapshot {
    /// Angular average of the mean raw-layout image.
    pub fn angular_average(
        &self,
        geometry: &PixelGeometry,
        mask: Option<&[f32]>,
        config: &AngularConfig,
    ) -> AngularProfile {
        angular_average(&self.mean, geometry, mask, config)
    }
}

/// Registry of every running aggregate class.
pub struct Aggregator {
    config: AggregateConfig,
    classes: Vec<RunningAggregate>,
    darkcal: Option<RunningAggregate>,
}

impl Aggregator {
    /// One class per distinct name, plus the darkcal class when enabled.
    pub fn new<I, S>(config: AggregateConfig, names: I, pixel_count: usize) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut classes: Vec<RunningAggregate> = Vec::new();
        for name in names {
            let name = name.into();
            if classes.iter().any(|c| c.name == name) {
                continue;
            }
            classes.push(RunningAggregate::new(
                name,
                pixel_count,
                Some(config.powder_threshold),
            ));
        }
        let darkcal = config
            .generate_darkcal
            .then(|| RunningAggregate::new(DARKCAL_CLASS, pixel_count, None));
        Self {
            config,
            classes,
            darkcal,
        }
    }

    pub fn config(&self) -> &AggregateConfig {
        &self.config
    }

    pub fn class(&self, name: &str) -> Option<&RunningAggregate> {
        if name == DARKCAL_CLASS {
            return self.darkcal.as_ref();
        }
        self.classes.iter().find(|c| c.name == name)
    }

    /// Add a frame to class `name`. Returns `false` for an unknown class or
    /// when accumulation is disabled.
    pub fn accumulate(
        &self,
        name: &str,
        corrected: &[f32],
        assembled: Option<&[f32]>,
        correlation: Option<&[f64]>,
    ) -> bool {
        if !self.config.enabled {
            return false;
        }
        let Some(class) = self.classes.iter().find(|c| c.name == name) else {
            return false;
        };
        class.add_raw(corrected, self.config.save_raw);
        if let Some(image) = assembled {
            class.add_assembled(image);
        }
        if let (true, Some(values)) = (self.config.sum_correlation, correlation) {
            class.add_correlation(values);
        }
        true
    }

    /// Add a frame to the darkcal class, if enabled.
    pub fn accumulate_darkcal(&self, corrected: &[f32], assembled: Option<&[f32]>) {
        if let Some(darkcal) = &self.darkcal {
            darkcal.add_raw(corrected, true);
            if let Some(image) = assembled {
                darkcal.add_assembled(image);
            }
        }
    }

    pub fn snapshots(&self) -> Vec<AggregateSnapshot> {
        self.classes
            .iter()
            .chain(self.darkcal.as_ref())
            .map(RunningAggregate::snapshot)
            .collect()
    }

    pub fn reset(&self) {
        for class in self.classes.iter().chain(self.darkcal.as_ref()) {
            class.reset();
        }
    }
}
