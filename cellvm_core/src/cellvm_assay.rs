//! The "ASSAY" Engine - Observables from Hidden Biology
//!
//! Every readout is built in two layers:
//!
//! 1. **Structural**: the noise-free value implied by latent state
//! 2. **Measured**: structural x signal intensity, then nuisance in order
//!    (plating variance inflation, run-level bias, pipeline drift)
//!
//! `signal_intensity = 0.3 + 0.7 * viability` attenuates intensity-type
//! readouts (imaging, luminescence, ELISA, Western). Count-type readouts
//! (flow, counter) sample dead cells explicitly; qPCR is normalized to a
//! reference gene and sees neither.
//!
//! Simulators take the vessel by shared reference and draw only from the
//! assay stream they are handed.

use crate::cellvm_latent::AxisDrive;
use crate::channels::{Channel, ChannelVector, NUM_CHANNELS};
use crate::config::{AssayConfig, HandlingRisk};
use crate::params::CellLineParams;
use crate::pipeline::{FailureMode, PipelineBatch};
use crate::run_context::RunContext;
use crate::vessel::{DeathCause, LatentState, VesselState};
use cellvm_env::{AssayKind, Marker};
use rand::Rng;
use rand_distr::{Binomial, Distribution, Poisson, StandardNormal};
use serde::Serialize;
use std::collections::BTreeMap;
use uuid::Uuid;

/// ELISA concentration of an unperturbed culture (ng/mL).
const ELISA_BASELINE_NG_ML: f64 = 10.0;

/// ELISA limit of detection (ng/mL).
const ELISA_LOD_NG_ML: f64 = 0.5;

/// Densitometric saturation of a Western band (fold units).
const WESTERN_SATURATION: f64 = 4.0;

/// Causes that kill through programmed (apoptotic) death.
const APOPTOTIC_CAUSES: [DeathCause; 5] = [
    DeathCause::Compound,
    DeathCause::MitoticCatastrophe,
    DeathCause::ErStress,
    DeathCause::MitoDysfunction,
    DeathCause::TransportDysfunction,
];

/// Caller options for one assay call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AssayOptions {
    /// Imaging batch; defaults to [`default_batch_id`]
    pub batch_id: Option<String>,
}

impl AssayOptions {
    pub fn with_batch(batch_id: impl Into<String>) -> Self {
        Self { batch_id: Some(batch_id.into()) }
    }
}

/// Plate-level batch id: the vessel id up to its first `_`.
pub fn default_batch_id(vessel_id: &str) -> &str {
    vessel_id.split('_').next().unwrap_or(vessel_id)
}

/// Viability attenuation of intensity-type signals.
pub fn signal_intensity(viability: f64) -> f64 {
    0.3 + 0.7 * viability
}

/// Transient imaging intensity loss after a washout.
pub fn washout_penalty(last_washout_h: Option<f64>, now_h: f64, risk: &HandlingRisk) -> f64 {
    match last_washout_h {
        Some(t) => {
            let since = (now_h - t).max(0.0);
            if since < risk.washout_penalty_window_h {
                1.0 - risk.washout_penalty_max * (-since / risk.washout_penalty_tau_h).exp()
            } else {
                1.0
            }
        }
        None => 1.0,
    }
}

/// Noise-free per-cell morphology.
///
/// Each channel carries an acute term (current drive) and a chronic term
/// (latent level).
pub fn structural_morphology(baseline: &ChannelVector, latent: &LatentState, acute: &AxisDrive) -> ChannelVector {
    let response = ChannelVector::from([
        1.0 + 0.6 * acute.er_stress + 0.9 * latent.er_stress,
        (1.0 - 0.3 * acute.mito_dysfunction - 0.5 * latent.mito_dysfunction).max(0.05),
        1.0 + 0.2 * acute.transport_dysfunction + 0.3 * latent.transport_dysfunction,
        1.0 + 0.5 * acute.transport_dysfunction + 0.8 * latent.transport_dysfunction,
        (1.0 + 0.2 * latent.er_stress - 0.1 * latent.mito_dysfunction).max(0.05),
    ]);
    baseline.component_mul(&response)
}

/// Noise-free marker level, as fold over an unperturbed culture.
///
/// Markers follow the chronic (latent) term only.
pub fn structural_marker(marker: Marker, vessel: &VesselState) -> f64 {
    let latent = &vessel.latent;
    match marker {
        Marker::Upr => 1.0 + 4.0 * latent.er_stress,
        Marker::MitoPotential => (1.0 - 0.8 * latent.mito_dysfunction).max(0.05),
        Marker::Transport => 1.0 + 3.0 * latent.transport_dysfunction,
        Marker::LdhRelease => 1.0 + 10.0 * (1.0 - vessel.viability),
    }
}

/// Everything an assay reads.
pub struct AssayInputs<'a> {
    pub vessel: &'a VesselState,
    pub line: &'a CellLineParams,
    /// Fraction-weighted current axis drive
    pub acute: AxisDrive,
    pub run: &'a RunContext,
    pub batch: &'a PipelineBatch,
    pub config: &'a AssayConfig,
    /// Imaging intensity multiplier from [`washout_penalty`]
    pub washout_penalty: f64,
    pub now_h: f64,
}

impl AssayInputs<'_> {
    fn variance_inflation(&self) -> f64 {
        self.vessel
            .plating
            .variance_inflation(self.vessel.age_h(self.now_h), self.config.plating_variance_gain)
    }

    fn intensity(&self) -> f64 {
        signal_intensity(self.vessel.viability)
    }
}

/// Structural and measured values of one assay call.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AssayReadings {
    pub structural: BTreeMap<String, f64>,
    pub measured: BTreeMap<String, f64>,
    pub failure: Option<FailureMode>,
}

impl AssayReadings {
    fn record(&mut self, name: &str, structural: f64, measured: f64) {
        self.structural.insert(name.to_string(), structural);
        self.measured.insert(name.to_string(), measured);
    }
}

/// A completed measurement.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AssayResult {
    /// Deterministic id: `(seed, vessel_id, call index)`
    pub measurement_id: Uuid,
    pub vessel_id: String,
    pub assay: AssayKind,
    pub batch_id: String,
    pub clock_h: f64,
    pub structural: BTreeMap<String, f64>,
    pub measured: BTreeMap<String, f64>,
    pub failure: Option<FailureMode>,
}

impl AssayResult {
    pub fn measured(&self, name: &str) -> Option<f64> {
        self.measured.get(name).copied()
    }

    pub fn structural(&self, name: &str) -> Option<f64> {
        self.structural.get(name).copied()
    }
}

/// Runs one assay against the inputs.
pub fn simulate<R: Rng + ?Sized>(kind: AssayKind, inputs: &AssayInputs, rng: &mut R) -> AssayReadings {
    match kind {
        AssayKind::CellPainting => cell_painting(inputs, rng),
        AssayKind::AtpViability => atp_viability(inputs, rng),
        AssayKind::FlowCytometry => flow_cytometry(inputs, rng),
        AssayKind::CellCount => cell_count(inputs, rng),
        AssayKind::Qpcr(marker) => qpcr(marker, inputs, rng),
        AssayKind::Elisa(marker) => elisa(marker, inputs, rng),
        AssayKind::WesternBlot(marker) => western_blot(marker, inputs, rng),
    }
}

fn cell_painting<R: Rng + ?Sized>(inputs: &AssayInputs, rng: &mut R) -> AssayReadings {
    let vessel = inputs.vessel;
    let baseline = ChannelVector::from(inputs.line.baseline_morphology);
    let structural = structural_morphology(&baseline, &vessel.latent, &inputs.acute);
    let inflation = inputs.variance_inflation();

    let mut measured = structural * (inputs.intensity() * inputs.washout_penalty);
    for c in 0..NUM_CHANNELS {
        measured[c] = noisy(rng, measured[c], inputs.config.channel_cv[c] * inflation);
    }
    let bias = inputs.run.measurement();
    measured = measured.component_mul(&bias.channel_bias) * bias.illumination_bias;
    measured = inputs.batch.apply(&measured, &baseline);

    let mut readings = AssayReadings { failure: inputs.batch.failure, ..AssayReadings::default() };
    for channel in Channel::ALL {
        let c = channel.index();
        readings.record(channel.name(), structural[c], measured[c]);
    }

    let segmented = vessel.cell_count * vessel.plating.segmentation_efficiency() * inputs.batch.count_factor();
    readings.structural.insert("cell_count".to_string(), vessel.cell_count);
    readings
        .measured
        .insert("cell_count_estimate".to_string(), noisy(rng, segmented, 0.05 * inflation));
    readings
}

fn atp_viability<R: Rng + ?Sized>(inputs: &AssayInputs, rng: &mut R) -> AssayReadings {
    let vessel = inputs.vessel;
    let structural = vessel.total_cells() / 1.0e6
        * inputs.line.atp_per_million_cells
        * (1.0 - 0.8 * vessel.latent.mito_dysfunction);
    let measured = noisy(
        rng,
        structural * inputs.intensity(),
        inputs.config.atp_cv * inputs.variance_inflation(),
    );

    let mut readings = AssayReadings::default();
    readings.record("atp_luminescence", structural, measured);
    readings
}

fn flow_cytometry<R: Rng + ?Sized>(inputs: &AssayInputs, rng: &mut R) -> AssayReadings {
    let vessel = inputs.vessel;
    let events = inputs.config.flow_events.max(1);

    let dead = vessel.ledger.total();
    let apoptotic_share = if dead > 0.0 {
        APOPTOTIC_CAUSES.iter().map(|c| vessel.ledger.get(*c)).sum::<f64>() / dead
    } else {
        0.0
    };
    let g2m_true = (0.2 + 0.5 * vessel.latent.transport_dysfunction).min(0.95);

    let live = binomial(rng, events, vessel.viability);
    let apoptotic = binomial(rng, events - live, apoptotic_share);
    let necrotic = events - live - apoptotic;
    let g2m = binomial(rng, live, g2m_true);

    let n = events as f64;
    let mut readings = AssayReadings::default();
    readings.record("live_fraction", vessel.viability, live as f64 / n);
    readings.record(
        "apoptotic_fraction",
        (1.0 - vessel.viability) * apoptotic_share,
        apoptotic as f64 / n,
    );
    readings.record(
        "necrotic_fraction",
        (1.0 - vessel.viability) * (1.0 - apoptotic_share),
        necrotic as f64 / n,
    );
    readings.record(
        "g2m_fraction",
        g2m_true,
        if live > 0 { g2m as f64 / live as f64 } else { 0.0 },
    );
    readings
}

fn cell_count<R: Rng + ?Sized>(inputs: &AssayInputs, rng: &mut R) -> AssayReadings {
    let vessel = inputs.vessel;
    let fraction = inputs.config.counter_sampling_fraction;
    let lambda = vessel.total_cells() * fraction;
    let counted: f64 = if lambda > 0.0 {
        Poisson::new(lambda).map(|d| d.sample(rng)).unwrap_or(0.0)
    } else {
        0.0
    };
    let counted_n = counted.max(0.0).round() as u64;
    let viable_n = binomial(rng, counted_n, vessel.viability);

    let scale = if fraction > 0.0 { 1.0 / fraction } else { 0.0 };
    let mut readings = AssayReadings::default();
    readings.record("total_count", vessel.total_cells(), counted_n as f64 * scale);
    readings.record("viable_count", vessel.cell_count, viable_n as f64 * scale);
    readings.record(
        "viability",
        vessel.viability,
        if counted_n > 0 { viable_n as f64 / counted_n as f64 } else { 0.0 },
    );
    readings
}

fn qpcr<R: Rng + ?Sized>(marker: Marker, inputs: &AssayInputs, rng: &mut R) -> AssayReadings {
    let fold = structural_marker(marker, inputs.vessel);
    let ddct = -fold.log2();
    // Target and reference wells each carry Ct noise
    let z: f64 = StandardNormal.sample(rng);
    let measured_ddct = ddct + inputs.config.qpcr_ct_sd * std::f64::consts::SQRT_2 * z;

    let mut readings = AssayReadings::default();
    readings.record("fold_change", fold, 2f64.powf(-measured_ddct));
    readings.record("delta_delta_ct", ddct, measured_ddct);
    readings
}

fn elisa<R: Rng + ?Sized>(marker: Marker, inputs: &AssayInputs, rng: &mut R) -> AssayReadings {
    let structural = ELISA_BASELINE_NG_ML * structural_marker(marker, inputs.vessel);
    let measured = noisy(
        rng,
        structural * inputs.intensity(),
        inputs.config.elisa_cv * inputs.variance_inflation(),
    )
    .max(ELISA_LOD_NG_ML);

    let mut readings = AssayReadings::default();
    readings.record("concentration_ng_ml", structural, measured);
    readings
}

fn western_blot<R: Rng + ?Sized>(marker: Marker, inputs: &AssayInputs, rng: &mut R) -> AssayReadings {
    let fold = structural_marker(marker, inputs.vessel);
    let raw = noisy(
        rng,
        fold * inputs.intensity(),
        inputs.config.western_cv * inputs.variance_inflation(),
    );

    let mut readings = AssayReadings::default();
    readings.record("band_intensity", saturate(fold), saturate(raw));
    readings
}

fn saturate(x: f64) -> f64 {
    WESTERN_SATURATION * (1.0 - (-x / WESTERN_SATURATION).exp())
}

fn noisy<R: Rng + ?Sized>(rng: &mut R, value: f64, cv: f64) -> f64 {
    let z: f64 = StandardNormal.sample(rng);
    (value * (1.0 + cv * z)).max(0.0)
}

fn binomial<R: Rng + ?Sized>(rng: &mut R, n: u64, p: f64) -> u64 {
    Binomial::new(n, p.clamp(0.0, 1.0))
        .map(|d| d.sample(rng))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::ParameterTables;
    use crate::plating::PlatingContext;
    use crate::vessel::MediaState;
    use approx::assert_relative_eq;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn vessel() -> (VesselState, CellLineParams) {
        let tables = ParameterTables::default();
        let line = tables.cell_line("A549").unwrap().clone();
        let vessel = VesselState::seeded(
            "plate1_A1",
            "A549",
            &line,
            1.0e6,
            1.0e7,
            MediaState { glucose_mm: 25.0, glutamine_mm: 4.0 },
            PlatingContext::clean(),
            0.0,
        );
        (vessel, line)
    }

    fn run(kind: AssayKind, vessel: &VesselState, line: &CellLineParams, acute: AxisDrive, seed: u64) -> AssayReadings {
        let run = RunContext::neutral(0);
        let batch = PipelineBatch::identity("plate1");
        let config = AssayConfig::default();
        let inputs = AssayInputs {
            vessel,
            line,
            acute,
            run: &run,
            batch: &batch,
            config: &config,
            washout_penalty: 1.0,
            now_h: 24.0,
        };
        simulate(kind, &inputs, &mut ChaCha8Rng::seed_from_u64(seed))
    }

    #[test]
    fn test_default_batch_id() {
        assert_eq!(default_batch_id("plate1_A1"), "plate1");
        assert_eq!(default_batch_id("A1"), "A1");
        assert_eq!(default_batch_id("p_q_r"), "p");
    }

    #[test]
    fn test_washout_penalty_window() {
        let risk = HandlingRisk::default();
        assert_eq!(washout_penalty(None, 5.0, &risk), 1.0);
        assert_relative_eq!(washout_penalty(Some(10.0), 10.0, &risk), 0.85);
        assert!(washout_penalty(Some(10.0), 14.0, &risk) > 0.85);
        assert_eq!(washout_penalty(Some(10.0), 22.0, &risk), 1.0);
    }

    #[test]
    fn test_acute_term_only_in_morphology() {
        let (mut v, line) = vessel();
        v.latent.er_stress = 0.5;
        let quiet = run(AssayKind::CellPainting, &v, &line, AxisDrive::default(), 1);
        let dosed = run(
            AssayKind::CellPainting,
            &v,
            &line,
            AxisDrive { er_stress: 0.5, ..AxisDrive::default() },
            1,
        );
        assert_relative_eq!(quiet.structural["er"], 1.45, epsilon = 1e-12);
        assert_relative_eq!(dosed.structural["er"], 1.75, epsilon = 1e-12);

        let upr_quiet = run(AssayKind::Qpcr(Marker::Upr), &v, &line, AxisDrive::default(), 1);
        let upr_dosed = run(
            AssayKind::Qpcr(Marker::Upr),
            &v,
            &line,
            AxisDrive { er_stress: 0.5, ..AxisDrive::default() },
            1,
        );
        assert_eq!(upr_quiet.structural, upr_dosed.structural);
    }

    #[test]
    fn test_noise_changes_measured_not_structural() {
        let (v, line) = vessel();
        let a = run(AssayKind::CellPainting, &v, &line, AxisDrive::default(), 1);
        let b = run(AssayKind::CellPainting, &v, &line, AxisDrive::default(), 2);
        assert_eq!(a.structural, b.structural);
        assert_ne!(a.measured, b.measured);
    }

    #[test]
    fn test_measured_attenuated_by_viability() {
        let (mut v, line) = vessel();
        let healthy = run(AssayKind::AtpViability, &v, &line, AxisDrive::default(), 3);
        v.subpopulations.iter_mut().for_each(|sp| sp.kill(0.5, DeathCause::Compound));
        v.recompute_from_subpopulations();
        v.cell_count *= 0.5;
        let damaged = run(AssayKind::AtpViability, &v, &line, AxisDrive::default(), 3);

        assert!(damaged.measured["atp_luminescence"] < healthy.measured["atp_luminescence"]);
    }

    #[test]
    fn test_flow_fractions_sum_to_one() {
        let (v, line) = vessel();
        let r = run(AssayKind::FlowCytometry, &v, &line, AxisDrive::default(), 4);
        let total = r.measured["live_fraction"] + r.measured["apoptotic_fraction"] + r.measured["necrotic_fraction"];
        assert_relative_eq!(total, 1.0, epsilon = 1e-12);
        assert!((r.measured["live_fraction"] - 0.98).abs() < 0.02);
    }

    #[test]
    fn test_counter_estimates_count() {
        let (v, line) = vessel();
        let r = run(AssayKind::CellCount, &v, &line, AxisDrive::default(), 5);
        let relative_error = (r.measured["total_count"] - v.total_cells()).abs() / v.total_cells();
        assert!(relative_error < 0.15, "counter off by {}", relative_error);
    }

    #[test]
    fn test_elisa_floor_and_western_saturation() {
        let (mut v, line) = vessel();
        let r = run(AssayKind::Elisa(Marker::MitoPotential), &v, &line, AxisDrive::default(), 6);
        assert!(r.measured["concentration_ng_ml"] >= ELISA_LOD_NG_ML);

        v.latent.er_stress = 1.0;
        let r = run(AssayKind::WesternBlot(Marker::Upr), &v, &line, AxisDrive::default(), 6);
        assert!(r.measured["band_intensity"] < WESTERN_SATURATION);
        assert!(r.structural["band_intensity"] > saturate(1.0));
    }
}
