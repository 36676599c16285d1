//! Plating artifact: post-dissociation nuisance sampled once per culture.

use crate::config::PlatingConfig;
use crate::streams::{Purpose, StreamProvider};
use rand::Rng;
use rand_distr::{Distribution, LogNormal, Normal};
use serde::{Deserialize, Serialize};

/// Per-vessel plating nuisance.
///
/// Freshly dissociated cells are stressed, unevenly spread and partly
/// clumped. The stress component decays with a vessel-specific half-life;
/// it inflates measurement variance and slows growth while it lasts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlatingContext {
    /// Half-life of the post-dissociation stress (hours)
    pub stress_half_life_h: f64,

    /// Multiplier on the nominal seeding count
    pub seeding_density_bias: f64,

    /// Fraction of cells in clumps, in [0, max_clumpiness]
    pub clumpiness: f64,

    /// Residual stress right after plating, in (0, stress_amplitude_max]
    pub stress_amplitude: f64,
}

impl PlatingContext {
    /// Samples the plating context for one culture of a vessel.
    ///
    /// `passage_number` keys the stream, so every passage gets a fresh draw.
    pub fn sample(streams: &StreamProvider, vessel_id: &str, passage_number: u32, config: &PlatingConfig) -> Self {
        let mut rng = streams.stream(vessel_id, Purpose::Plating, passage_number as u64);

        let half_life = LogNormal::new(config.half_life_median_h.ln(), config.half_life_sigma.max(1e-9))
            .map(|d| d.sample(&mut rng))
            .unwrap_or(config.half_life_median_h);
        let log_bias = Normal::new(0.0, config.density_bias_sd.max(1e-9))
            .map(|d| d.sample(&mut rng))
            .unwrap_or(0.0);
        let clumpiness = rng.gen::<f64>() * config.max_clumpiness;
        let amplitude = config.stress_amplitude_max * (0.5 + 0.5 * rng.gen::<f64>());

        Self {
            stress_half_life_h: half_life,
            seeding_density_bias: log_bias.exp(),
            clumpiness,
            stress_amplitude: amplitude,
        }
    }

    /// An artifact-free plating (reference vessels, unit tests).
    pub fn clean() -> Self {
        Self {
            stress_half_life_h: 1.0,
            seeding_density_bias: 1.0,
            clumpiness: 0.0,
            stress_amplitude: 0.0,
        }
    }

    /// Residual post-dissociation stress at a given vessel age.
    pub fn residual_stress(&self, age_h: f64) -> f64 {
        self.stress_amplitude * (-std::f64::consts::LN_2 * age_h.max(0.0) / self.stress_half_life_h).exp()
    }

    /// Measurement variance multiplier (>= 1) at a given vessel age.
    pub fn variance_inflation(&self, age_h: f64, gain: f64) -> f64 {
        1.0 + gain * self.residual_stress(age_h)
    }

    /// Growth-rate factor in (0, 1]; recovers as the stress decays.
    pub fn growth_recovery(&self, age_h: f64) -> f64 {
        1.0 - self.residual_stress(age_h)
    }

    /// Fraction of cells a segmentation pipeline resolves (clumps merge).
    pub fn segmentation_efficiency(&self) -> f64 {
        1.0 - 0.5 * self.clumpiness
    }
}
