//! VM configuration: calibration constants for every engine.
//!
//! Every section is `#[serde(default)]`, so a JSON file only needs to name
//! the values it changes.

use cellvm_env::VmError;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Induction/decay constants and death threshold for one latent axis.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct AxisKinetics {
    /// Induction rate (1/h) at full drive
    pub k_on: f64,
    /// First-order recovery rate (1/h)
    pub k_off: f64,
    /// Latent level above which the axis proposes a death hazard
    pub theta: f64,
    /// Sigmoid width of the hazard ramp above `theta`
    pub width: f64,
    /// Saturating hazard (1/h)
    pub h_max: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LatentKinetics {
    pub er_stress: AxisKinetics,
    pub mito_dysfunction: AxisKinetics,
    /// Faster than ER/mito so the temporal signature is distinguishable.
    pub transport_dysfunction: AxisKinetics,
}

impl Default for LatentKinetics {
    fn default() -> Self {
        Self {
            er_stress: AxisKinetics { k_on: 0.25, k_off: 0.05, theta: 0.70, width: 0.05, h_max: 0.05 },
            mito_dysfunction: AxisKinetics { k_on: 0.25, k_off: 0.04, theta: 0.60, width: 0.05, h_max: 0.08 },
            transport_dysfunction: AxisKinetics { k_on: 0.60, k_off: 0.15, theta: 0.75, width: 0.05, h_max: 0.03 },
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeathConfig {
    /// Dose is lethal for a subpopulation at `multiple * IC50_shifted`
    pub lethal_dose_multiple: f64,
    /// Median commitment delay for a typical (ic50_shift = 1) subpopulation (h)
    pub commitment_median_h: f64,
    /// Log-normal sigma of the commitment delay
    pub commitment_sigma: f64,
    /// Attrition hazard (1/h) per unit toxicity at full drive
    pub attrition_rate_per_h: f64,
    pub glucose_threshold_mm: f64,
    pub glutamine_threshold_mm: f64,
    /// Starvation hazard (1/h) at fully depleted media
    pub starvation_h_max: f64,
    /// Confluence above which crowding kills
    pub confluence_threshold: f64,
    /// Crowding hazard (1/h) at full confluence
    pub confluence_h_max: f64,
    /// Fraction lost to dissociation on every passage
    pub passage_attrition: f64,
    /// Allowed |ledger sum - (1 - viability)|
    pub conservation_tolerance: f64,
}

impl Default for DeathConfig {
    fn default() -> Self {
        Self {
            lethal_dose_multiple: 10.0,
            commitment_median_h: 12.0,
            commitment_sigma: 0.2,
            attrition_rate_per_h: 0.15,
            glucose_threshold_mm: 5.0,
            glutamine_threshold_mm: 1.0,
            starvation_h_max: 0.08,
            confluence_threshold: 0.9,
            confluence_h_max: 0.02,
            passage_attrition: 0.02,
            conservation_tolerance: 1e-5,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    pub fresh_glucose_mm: f64,
    pub fresh_glutamine_mm: f64,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            fresh_glucose_mm: 25.0,
            fresh_glutamine_mm: 4.0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GrowthConfig {
    /// Growth lost at full (max-axis) latent stress
    pub stress_growth_penalty: f64,
    pub optimal_temperature_c: f64,
    /// Gaussian width of the temperature growth response
    pub temperature_tolerance_c: f64,
}

impl Default for GrowthConfig {
    fn default() -> Self {
        Self {
            stress_growth_penalty: 0.7,
            optimal_temperature_c: 37.0,
            temperature_tolerance_c: 3.0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatingConfig {
    pub half_life_median_h: f64,
    pub half_life_sigma: f64,
    pub density_bias_sd: f64,
    pub max_clumpiness: f64,
    /// Upper bound on the initial post-dissociation stress amplitude
    pub stress_amplitude_max: f64,
}

impl Default for PlatingConfig {
    fn default() -> Self {
        Self {
            half_life_median_h: 8.0,
            half_life_sigma: 0.3,
            density_bias_sd: 0.05,
            max_clumpiness: 0.3,
            stress_amplitude_max: 0.4,
        }
    }
}

/// Probabilities and costs of handling incidents.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandlingRisk {
    /// Per handling operation (treat, feed, washout, passage)
    pub contamination_p: f64,
    pub equipment_failure_p: f64,
    pub human_error_p: f64,
    pub contamination_kill_min: f64,
    pub contamination_kill_max: f64,
    pub equipment_kill_max: f64,
    pub human_error_kill_max: f64,
    /// Extra contamination risk of a washout (open vessel, repeated aspiration)
    pub washout_contamination_p: f64,
    pub washout_time_cost_h: f64,
    /// Fractional imaging intensity loss right after a washout
    pub washout_penalty_max: f64,
    pub washout_penalty_tau_h: f64,
    /// Penalty is exactly zero after this window
    pub washout_penalty_window_h: f64,
}

impl Default for HandlingRisk {
    fn default() -> Self {
        Self {
            contamination_p: 0.002,
            equipment_failure_p: 0.001,
            human_error_p: 0.001,
            contamination_kill_min: 0.3,
            contamination_kill_max: 0.6,
            equipment_kill_max: 0.15,
            human_error_kill_max: 0.1,
            washout_contamination_p: 0.005,
            washout_time_cost_h: 0.25,
            washout_penalty_max: 0.15,
            washout_penalty_tau_h: 4.0,
            washout_penalty_window_h: 12.0,
        }
    }
}

impl HandlingRisk {
    /// No incidents ever fire; costs and penalties keep their defaults.
    pub fn none() -> Self {
        Self {
            contamination_p: 0.0,
            equipment_failure_p: 0.0,
            human_error_p: 0.0,
            washout_contamination_p: 0.0,
            ..Self::default()
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Log-scale SD of the per-batch channel scale
    pub scale_sd: f64,
    /// SD of the per-batch additive offset (fraction of baseline)
    pub offset_sd: f64,
    /// Correlation of the channel scale with the reagent-lot shift
    pub reagent_correlation: f64,
    /// Probability a batch suffers a catastrophic failure
    pub failure_probability: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            scale_sd: 0.05,
            offset_sd: 0.01,
            reagent_correlation: 0.3,
            failure_probability: 0.02,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssayConfig {
    /// Measurement CV per channel [er, mito, nucleus, actin, rna]
    pub channel_cv: [f64; 5],
    pub atp_cv: f64,
    pub elisa_cv: f64,
    pub western_cv: f64,
    /// Ct noise SD (cycles)
    pub qpcr_ct_sd: f64,
    /// Events acquired per flow sample
    pub flow_events: u64,
    /// Fraction of cells counted by the automated counter
    pub counter_sampling_fraction: f64,
    /// Variance multiplier contributed by a fresh plating artifact
    pub plating_variance_gain: f64,
    pub pipeline: PipelineConfig,
}

impl Default for AssayConfig {
    fn default() -> Self {
        Self {
            channel_cv: [0.05, 0.06, 0.03, 0.07, 0.08],
            atp_cv: 0.04,
            elisa_cv: 0.08,
            western_cv: 0.15,
            qpcr_ct_sd: 0.25,
            flow_events: 10_000,
            counter_sampling_fraction: 1.0e-3,
            plating_variance_gain: 2.0,
            pipeline: PipelineConfig::default(),
        }
    }
}

/// Top-level VM configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmConfig {
    /// Master seed for every random stream
    pub seed: u64,
    /// Largest integration step (hours)
    pub max_step_h: f64,
    pub kinetics: LatentKinetics,
    pub death: DeathConfig,
    pub media: MediaConfig,
    pub growth: GrowthConfig,
    pub plating: PlatingConfig,
    pub handling: HandlingRisk,
    pub assay: AssayConfig,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            max_step_h: 0.5,
            kinetics: LatentKinetics::default(),
            death: DeathConfig::default(),
            media: MediaConfig::default(),
            growth: GrowthConfig::default(),
            plating: PlatingConfig::default(),
            handling: HandlingRisk::default(),
            assay: AssayConfig::default(),
        }
    }
}

impl VmConfig {
    /// Default configuration with a specific seed.
    pub fn with_seed(seed: u64) -> Self {
        Self { seed, ..Self::default() }
    }

    /// Parses a configuration from JSON and validates it.
    pub fn from_json_str(json: &str) -> Result<Self, VmError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| VmError::config(format!("vm config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a configuration from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, VmError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| VmError::config(format!("{}: {}", path.display(), e)))?;
        Self::from_json_str(&json)
    }

    /// Rejects values the engines cannot integrate.
    pub fn validate(&self) -> Result<(), VmError> {
        if !(self.max_step_h > 0.0) {
            return Err(VmError::config("max_step_h must be > 0"));
        }
        for (name, axis) in [
            ("er_stress", &self.kinetics.er_stress),
            ("mito_dysfunction", &self.kinetics.mito_dysfunction),
            ("transport_dysfunction", &self.kinetics.transport_dysfunction),
        ] {
            if axis.k_on < 0.0 || axis.k_off < 0.0 || !(axis.width > 0.0) || axis.h_max < 0.0 {
                return Err(VmError::config(format!("{}: malformed kinetics {:?}", name, axis)));
            }
        }
        let probabilities = [
            self.handling.contamination_p,
            self.handling.equipment_failure_p,
            self.handling.human_error_p,
            self.handling.washout_contamination_p,
            self.assay.pipeline.failure_probability,
        ];
        if probabilities.iter().any(|p| !(0.0..=1.0).contains(p)) {
            return Err(VmError::config("probabilities must lie in [0, 1]"));
        }
        if !(self.death.conservation_tolerance > 0.0) {
            return Err(VmError::config("conservation_tolerance must be > 0"));
        }
        if !(0.0..1.0).contains(&self.death.passage_attrition) {
            return Err(VmError::config("passage_attrition must lie in [0, 1)"));
        }
        Ok(())
    }
}
