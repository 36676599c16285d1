//! Image-analysis pipeline drift.
//!
//! Every imaging batch goes through the same segmentation/feature pipeline
//! with its own calibration. A batch gets an affine per-channel transform
//! whose scale partly tracks the reagent lot, and with small probability a
//! catastrophic failure. Both are pure functions of `(seed, batch_id)`.

use crate::channels::{ChannelVector, NUM_CHANNELS};
use crate::config::PipelineConfig;
use crate::streams::{Purpose, StreamProvider};
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Discrete catastrophic pipeline failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    /// Autofocus missed; every channel dim and smeared
    FocusOff,
    /// Wrong exposure/illumination profile; channels skewed in a fixed pattern
    IlluminationWrong,
    /// Segmentation merged objects; counts collapse, intensities inflate
    SegmentationFail,
}

/// Per-channel multipliers applied by `IlluminationWrong`.
const ILLUMINATION_WRONG_PATTERN: [f64; NUM_CHANNELS] = [1.8, 0.4, 2.2, 0.5, 1.5];

impl FailureMode {
    pub const ALL: [FailureMode; 3] = [
        FailureMode::FocusOff,
        FailureMode::IlluminationWrong,
        FailureMode::SegmentationFail,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            FailureMode::FocusOff => "focus_off",
            FailureMode::IlluminationWrong => "illumination_wrong",
            FailureMode::SegmentationFail => "segmentation_fail",
        }
    }

    /// Per-channel intensity distortion.
    pub fn intensity_factors(&self) -> ChannelVector {
        match self {
            FailureMode::FocusOff => ChannelVector::repeat(0.55),
            FailureMode::IlluminationWrong => ChannelVector::from(ILLUMINATION_WRONG_PATTERN),
            FailureMode::SegmentationFail => ChannelVector::repeat(1.3),
        }
    }

    /// Multiplier on the number of segmented cells.
    pub fn count_factor(&self) -> f64 {
        match self {
            FailureMode::FocusOff => 0.8,
            FailureMode::IlluminationWrong => 1.0,
            FailureMode::SegmentationFail => 0.3,
        }
    }
}

/// Calibration of one imaging batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineBatch {
    pub batch_id: String,

    /// Multiplicative per-channel scale
    pub channel_scale: ChannelVector,

    /// Additive per-channel offset, as a fraction of the channel baseline
    pub channel_offset: ChannelVector,

    /// Catastrophic failure, if this batch suffered one
    pub failure: Option<FailureMode>,
}

impl PipelineBatch {
    /// Samples a batch from its own stream.
    ///
    /// `reagent_lot_shift` comes from the run context; the channel scale
    /// loads on it with `config.reagent_correlation`.
    pub fn sample(
        streams: &StreamProvider,
        batch_id: &str,
        reagent_lot_shift: f64,
        config: &PipelineConfig,
    ) -> Self {
        let mut rng = streams.stream(batch_id, Purpose::Pipeline, 0);
        let rho = config.reagent_correlation.clamp(0.0, 1.0);
        let unique = (1.0 - rho * rho).sqrt();

        let mut channel_scale = ChannelVector::zeros();
        let mut channel_offset = ChannelVector::zeros();
        for c in 0..NUM_CHANNELS {
            let z_scale: f64 = StandardNormal.sample(&mut rng);
            let z_offset: f64 = StandardNormal.sample(&mut rng);
            channel_scale[c] = (config.scale_sd * (rho * reagent_lot_shift + unique * z_scale)).exp();
            channel_offset[c] = config.offset_sd * z_offset;
        }

        let failure = if rng.gen::<f64>() < config.failure_probability {
            Some(FailureMode::ALL[rng.gen_range(0..FailureMode::ALL.len())])
        } else {
            None
        };

        Self {
            batch_id: batch_id.to_string(),
            channel_scale,
            channel_offset,
            failure,
        }
    }

    /// An identity batch (no drift, no failure).
    pub fn identity(batch_id: &str) -> Self {
        Self {
            batch_id: batch_id.to_string(),
            channel_scale: ChannelVector::repeat(1.0),
            channel_offset: ChannelVector::zeros(),
            failure: None,
        }
    }

    /// Applies the batch transform to a measured profile.
    pub fn apply(&self, profile: &ChannelVector, baseline: &ChannelVector) -> ChannelVector {
        let mut out = profile.component_mul(&self.channel_scale) + self.channel_offset.component_mul(baseline);
        if let Some(failure) = self.failure {
            out.component_mul_assign(&failure.intensity_factors());
        }
        out.map(|x| x.max(0.0))
    }

    /// Multiplier on segmented cell counts.
    pub fn count_factor(&self) -> f64 {
        self.failure.map(|f| f.count_factor()).unwrap_or(1.0)
    }
}

/// Lazily sampled batches, keyed by batch id.
#[derive(Debug, Clone, Default)]
pub struct PipelineDrift {
    batches: BTreeMap<String, PipelineBatch>,
}

impl PipelineDrift {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the batch, sampling it on first use.
    pub fn batch(
        &mut self,
        streams: &StreamProvider,
        batch_id: &str,
        reagent_lot_shift: f64,
        config: &PipelineConfig,
    ) -> &PipelineBatch {
        self.batches
            .entry(batch_id.to_string())
            .or_insert_with(|| PipelineBatch::sample(streams, batch_id, reagent_lot_shift, config))
    }

    /// Number of batches sampled so far.
    pub fn len(&self) -> usize {
        self.batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_batch_is_function_of_seed_and_id() {
        let config = PipelineConfig::default();
        let a = PipelineBatch::sample(&StreamProvider::new(42), "plate1", 0.2, &config);
        let b = PipelineBatch::sample(&StreamProvider::new(42), "plate1", 0.2, &config);
        let c = PipelineBatch::sample(&StreamProvider::new(42), "plate2", 0.2, &config);

        assert_eq!(a, b);
        assert_ne!(a.channel_scale, c.channel_scale);
    }

    #[test]
    fn test_failure_rate_matches_probability() {
        let config = PipelineConfig { failure_probability: 0.2, ..PipelineConfig::default() };
        let streams = StreamProvider::new(7);
        let failures = (0..2000)
            .filter(|i| PipelineBatch::sample(&streams, &format!("b{}", i), 0.0, &config).failure.is_some())
            .count();
        let rate = failures as f64 / 2000.0;
        assert!(rate > 0.15 && rate < 0.25, "failure rate {}", rate);
    }

    #[test]
    fn test_scale_tracks_reagent_lot() {
        let config = PipelineConfig { scale_sd: 0.2, reagent_correlation: 0.9, ..PipelineConfig::default() };
        let streams = StreamProvider::new(1);
        let mean_log_scale = |lot: f64| -> f64 {
            (0..200)
                .map(|i| PipelineBatch::sample(&streams, &format!("b{}", i), lot, &config).channel_scale[0].ln())
                .sum::<f64>()
                / 200.0
        };
        assert!(mean_log_scale(1.0) > mean_log_scale(-1.0));
    }

    #[test]
    fn test_identity_batch_is_noop() {
        let batch = PipelineBatch::identity("x");
        let profile = ChannelVector::from([1.0, 2.0, 3.0, 4.0, 5.0]);
        let out = batch.apply(&profile, &ChannelVector::repeat(1.0));
        for c in 0..NUM_CHANNELS {
            assert_relative_eq!(out[c], profile[c]);
        }
        assert_eq!(batch.count_factor(), 1.0);
    }

    #[test]
    fn test_segmentation_failure_collapses_counts() {
        let mut batch = PipelineBatch::identity("x");
        batch.failure = Some(FailureMode::SegmentationFail);
        assert!(batch.count_factor() < 0.5);
    }

    #[test]
    fn test_drift_cache_samples_once() {
        let streams = StreamProvider::new(3);
        let config = PipelineConfig::default();
        let mut drift = PipelineDrift::new();

        let first = drift.batch(&streams, "plate1", 0.0, &config).clone();
        // A different lot shift on a later call must not resample the batch
        let second = drift.batch(&streams, "plate1", 0.9, &config).clone();
        drift.batch(&streams, "plate2", 0.0, &config);

        assert_eq!(first, second);
        assert_eq!(drift.len(), 2);
    }
}
