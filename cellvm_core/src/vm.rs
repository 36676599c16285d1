//! The biological virtual machine: owns every vessel and the run clock.
//!
//! Each internal step runs, per vessel in sorted id order:
//! media consumption, latent dynamics, competing-risk death, growth.
//! The ledger identity is checked at the end of every step and after every
//! out-of-framework kill.

use crate::cellvm_assay::{
    default_batch_id, simulate, washout_penalty, AssayInputs, AssayOptions, AssayResult,
};
use crate::cellvm_death::{DeathEngine, Hazards};
use crate::cellvm_latent::{axis_drives, dose_response, ic50_shifted, AxisDrive, LatentEngine};
use crate::config::VmConfig;
use crate::growth::{GrowthConditions, GrowthEngine};
use crate::handling::draw_incidents;
use crate::params::ParameterTables;
use crate::pipeline::PipelineDrift;
use crate::plating::PlatingContext;
use crate::run_context::RunContext;
use crate::streams::{Purpose, StreamProvider};
use crate::validation::BiologySnapshot;
use crate::vessel::{CultureClock, DeathCause, Exposure, MediaState, Subpopulation, VesselState};
use cellvm_env::{AssayKind, Hardware, Marker, OperationDurations, OperationResult, VmError};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, LogNormal};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Largest biology change an assay may leave behind.
const ASSAY_MUTATION_TOLERANCE: f64 = 1e-12;

/// Accepted incubation temperature range (C).
const TEMPERATURE_RANGE_C: (f64, f64) = (0.0, 50.0);

/// Stochastic cell-culture simulator.
///
/// Single-threaded and synchronous. All randomness comes from streams keyed
/// by `(seed, vessel or batch id, purpose, index)`, so the same seed and the
/// same call sequence reproduce bit-identical state and readouts.
pub struct BiologicalVirtualMachine {
    config: VmConfig,
    tables: ParameterTables,
    streams: StreamProvider,
    run_context: RunContext,

    latent: LatentEngine,
    death: DeathEngine,
    growth: GrowthEngine,

    /// Live vessels, stepped in key order
    vessels: BTreeMap<String, VesselState>,

    /// Biology stream per vessel (commitment delays, handling incidents)
    biology_rngs: BTreeMap<String, ChaCha8Rng>,

    /// Assay calls per vessel id (assay stream index)
    assay_calls: BTreeMap<String, u64>,

    pipeline: PipelineDrift,
    durations: OperationDurations,

    /// Run clock (hours)
    clock_h: f64,
}

impl BiologicalVirtualMachine {
    /// Creates a VM, validating configuration and tables.
    ///
    /// The run context is sampled from `config.seed`.
    pub fn new(config: VmConfig, tables: ParameterTables) -> Result<Self, VmError> {
        config.validate()?;
        tables.validate()?;
        let run_context = RunContext::sample(config.seed);
        info!(
            "🧫 CellVM ready (seed={}, incubator={:+.3}, lot={:+.3}, instrument={:+.3})",
            config.seed, run_context.incubator_shift, run_context.reagent_lot_shift, run_context.instrument_shift
        );
        Ok(Self {
            streams: StreamProvider::new(config.seed),
            latent: LatentEngine::new(config.kinetics.clone()),
            death: DeathEngine::new(config.death.clone()),
            growth: GrowthEngine::new(config.growth.clone(), &config.death),
            vessels: BTreeMap::new(),
            biology_rngs: BTreeMap::new(),
            assay_calls: BTreeMap::new(),
            pipeline: PipelineDrift::new(),
            durations: OperationDurations::default(),
            clock_h: 0.0,
            run_context,
            config,
            tables,
        })
    }

    /// Default configuration and tables with a given seed.
    pub fn with_seed(seed: u64) -> Result<Self, VmError> {
        Self::new(VmConfig::with_seed(seed), ParameterTables::default())
    }

    /// Replaces the run context (e.g. [`RunContext::neutral`] for calibration).
    ///
    /// Meant to be called before the first vessel is seeded.
    pub fn with_run_context(mut self, run_context: RunContext) -> Self {
        self.run_context = run_context;
        self
    }

    // =========================================================================
    // READ ACCESS
    // =========================================================================

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn tables(&self) -> &ParameterTables {
        &self.tables
    }

    pub fn run_context(&self) -> &RunContext {
        &self.run_context
    }

    pub fn vessel(&self, vessel_id: &str) -> Result<&VesselState, VmError> {
        self.vessels
            .get(vessel_id)
            .ok_or_else(|| VmError::unknown_vessel(vessel_id))
    }

    /// Owned copy of a vessel's state.
    pub fn snapshot(&self, vessel_id: &str) -> Result<VesselState, VmError> {
        self.vessel(vessel_id).cloned()
    }

    pub fn vessel_ids(&self) -> Vec<String> {
        self.vessels.keys().cloned().collect()
    }

    /// Number of imaging batches sampled so far.
    pub fn batch_count(&self) -> usize {
        self.pipeline.len()
    }

    // =========================================================================
    // ASSAYS
    // =========================================================================

    /// Runs an assay. Biology is compared before and after; any change is
    /// an [`VmError::AssayMutation`].
    pub fn assay(&mut self, vessel_id: &str, kind: AssayKind, options: &AssayOptions) -> Result<AssayResult, VmError> {
        let vessel = self
            .vessels
            .get(vessel_id)
            .ok_or_else(|| VmError::unknown_vessel(vessel_id))?;
        let line = self.tables.cell_line(&vessel.cell_line)?;
        let drives = axis_drives(vessel, &self.tables, self.run_context.ec50_multiplier())?;
        let acute = weighted_drive(vessel, &drives);

        let batch_id = options
            .batch_id
            .clone()
            .unwrap_or_else(|| default_batch_id(vessel_id).to_string());
        let batch = self
            .pipeline
            .batch(
                &self.streams,
                &batch_id,
                self.run_context.reagent_lot_shift,
                &self.config.assay.pipeline,
            )
            .clone();

        let counter = self.assay_calls.entry(vessel_id.to_string()).or_insert(0);
        let index = *counter;
        *counter += 1;

        let before = BiologySnapshot::capture(vessel);
        let inputs = AssayInputs {
            vessel,
            line,
            acute,
            run: &self.run_context,
            batch: &batch,
            config: &self.config.assay,
            washout_penalty: washout_penalty(vessel.clock.last_washout_h, self.clock_h, &self.config.handling),
            now_h: self.clock_h,
        };
        let mut rng = self.streams.stream(vessel_id, Purpose::Assay, index);
        let readings = simulate(kind, &inputs, &mut rng);

        let max_difference = before.max_difference(&BiologySnapshot::capture(vessel));
        if max_difference > ASSAY_MUTATION_TOLERANCE {
            return Err(VmError::AssayMutation {
                vessel_id: vessel_id.to_string(),
                assay: kind.name().to_string(),
                max_difference,
            });
        }

        if let Some(failure) = readings.failure {
            warn!("🔬 Pipeline failure in batch {}: {}", batch_id, failure.name());
        }
        debug!("assay {} on {} (batch {}, call {})", kind.name(), vessel_id, batch_id, index);

        Ok(AssayResult {
            measurement_id: self.streams.derive_uuid(vessel_id, Purpose::Assay, index),
            vessel_id: vessel_id.to_string(),
            assay: kind,
            batch_id,
            clock_h: self.clock_h,
            structural: readings.structural,
            measured: readings.measured,
            failure: readings.failure,
        })
    }

    pub fn cell_painting_assay(&mut self, vessel_id: &str) -> Result<AssayResult, VmError> {
        self.assay(vessel_id, AssayKind::CellPainting, &AssayOptions::default())
    }

    pub fn atp_viability_assay(&mut self, vessel_id: &str) -> Result<AssayResult, VmError> {
        self.assay(vessel_id, AssayKind::AtpViability, &AssayOptions::default())
    }

    pub fn flow_cytometry_assay(&mut self, vessel_id: &str) -> Result<AssayResult, VmError> {
        self.assay(vessel_id, AssayKind::FlowCytometry, &AssayOptions::default())
    }

    pub fn cell_count_assay(&mut self, vessel_id: &str) -> Result<AssayResult, VmError> {
        self.assay(vessel_id, AssayKind::CellCount, &AssayOptions::default())
    }

    pub fn qpcr_assay(&mut self, vessel_id: &str, marker: Marker) -> Result<AssayResult, VmError> {
        self.assay(vessel_id, AssayKind::Qpcr(marker), &AssayOptions::default())
    }

    pub fn elisa_assay(&mut self, vessel_id: &str, marker: Marker) -> Result<AssayResult, VmError> {
        self.assay(vessel_id, AssayKind::Elisa(marker), &AssayOptions::default())
    }

    pub fn western_blot_assay(&mut self, vessel_id: &str, marker: Marker) -> Result<AssayResult, VmError> {
        self.assay(vessel_id, AssayKind::WesternBlot(marker), &AssayOptions::default())
    }

    // =========================================================================
    // INTERNALS
    // =========================================================================

    fn require(&self, vessel_id: &str) -> Result<(), VmError> {
        if self.vessels.contains_key(vessel_id) {
            Ok(())
        } else {
            Err(VmError::unknown_vessel(vessel_id))
        }
    }

    fn fresh_media(&self) -> MediaState {
        MediaState {
            glucose_mm: self.config.media.fresh_glucose_mm,
            glutamine_mm: self.config.media.fresh_glutamine_mm,
        }
    }

    /// Rolls handling incidents for a vessel and applies their kills.
    fn handle(&mut self, vessel_id: &str, extra_contamination_p: f64, result: &mut OperationResult) -> Result<(), VmError> {
        let rng = self
            .biology_rngs
            .get_mut(vessel_id)
            .ok_or_else(|| VmError::unknown_vessel(vessel_id))?;
        let incidents = draw_incidents(rng, &self.config.handling, extra_contamination_p);
        if incidents.is_empty() {
            return Ok(());
        }

        let vessel = self
            .vessels
            .get_mut(vessel_id)
            .ok_or_else(|| VmError::unknown_vessel(vessel_id))?;
        for draw in incidents {
            warn!(
                "⚠️  Handling incident on {}: {} (kills {:.1}%)",
                vessel_id,
                draw.incident.name(),
                draw.kill_fraction * 100.0
            );
            self.death.instant_kill(vessel, [draw.kill_fraction; 3], DeathCause::Unknown);
            result.push_event(format!("{}: killed {:.1}%", draw.incident.name(), draw.kill_fraction * 100.0));
        }
        self.death.verify(vessel)
    }

    /// Advances every vessel by `hours` at `temperature_c`.
    fn advance(&mut self, hours: f64, temperature_c: f64) -> Result<(), VmError> {
        if !hours.is_finite() || hours < 0.0 {
            return Err(VmError::invalid(format!("cannot advance by {} h", hours)));
        }
        if hours == 0.0 {
            return Ok(());
        }

        let steps = (hours / self.config.max_step_h).ceil().max(1.0) as usize;
        let dt = hours / steps as f64;
        for _ in 0..steps {
            let env = StepEnv {
                tables: &self.tables,
                run: &self.run_context,
                latent: &self.latent,
                death: &self.death,
                growth: &self.growth,
                temperature_c,
                now_h: self.clock_h,
            };
            for vessel in self.vessels.values_mut() {
                step_vessel(vessel, &env, dt)?;
            }
            self.clock_h += dt;
        }
        Ok(())
    }
}

/// Read-only context for one integration step.
struct StepEnv<'a> {
    tables: &'a ParameterTables,
    run: &'a RunContext,
    latent: &'a LatentEngine,
    death: &'a DeathEngine,
    growth: &'a GrowthEngine,
    temperature_c: f64,
    now_h: f64,
}

fn step_vessel(vessel: &mut VesselState, env: &StepEnv, dt: f64) -> Result<(), VmError> {
    let line = env.tables.cell_line(&vessel.cell_line)?;
    let ec50_multiplier = env.run.ec50_multiplier();

    // Media
    env.growth.consume_media(vessel, line, dt);

    // Latent dynamics
    let drives = axis_drives(vessel, env.tables, ec50_multiplier)?;
    env.latent.step(vessel, &drives, env.run.stress_sensitivity(), dt);
    vessel.recompute_from_subpopulations();

    // Death
    let starvation = env.death.starvation_hazard(&vessel.media);
    let confluence = env.death.confluence_hazard(vessel.confluence());
    let mut hazards = [Hazards::default(); 3];
    for subpop in Subpopulation::ALL {
        let h = &mut hazards[subpop.index()];
        for (cause, rate) in env.latent.hazards(vessel.subpopulation(subpop)) {
            h.add(cause, rate);
        }
        let (attrition, mitotic) = env.death.compound_hazards(vessel, subpop, line, env.tables, ec50_multiplier)?;
        h.add(DeathCause::Compound, attrition);
        h.add(DeathCause::MitoticCatastrophe, mitotic);
        h.add(DeathCause::Starvation, starvation);
        h.add(DeathCause::Confluence, confluence);
    }
    env.death.apply(vessel, &hazards, dt);

    // Growth
    let conditions = GrowthConditions {
        run_multiplier: env.run.growth_rate_multiplier(),
        temperature_c: env.temperature_c,
        now_h: env.now_h,
    };
    let g = env.growth.growth_factor(vessel, line, &conditions, dt);
    env.growth.apply(vessel, g);

    for exposure in vessel.exposures.iter_mut() {
        exposure.time_since_dose_h += dt;
    }
    vessel.clock.last_update_h = env.now_h + dt;

    env.death.verify(vessel)
}

/// Fraction-weighted drive across subpopulations.
fn weighted_drive(vessel: &VesselState, drives: &[AxisDrive; 3]) -> AxisDrive {
    let mut acute = AxisDrive::default();
    for (sp, d) in vessel.subpopulations.iter().zip(drives.iter()) {
        let w = sp.spec.fraction;
        acute.er_stress += w * d.er_stress;
        acute.mito_dysfunction += w * d.mito_dysfunction;
        acute.transport_dysfunction += w * d.transport_dysfunction;
    }
    acute
}

/// Fraction of the current survivors to kill when the instant-kill fraction
/// of the cumulative dose rises from `before` to `after`.
fn incremental_kill(before: f64, after: f64) -> f64 {
    let before = before.clamp(0.0, 1.0);
    let after = after.clamp(0.0, 1.0);
    let surviving = 1.0 - before;
    if surviving <= 0.0 || after <= before {
        return 0.0;
    }
    (after - before) / surviving
}

impl Hardware for BiologicalVirtualMachine {
    fn name(&self) -> &str {
        "cellvm"
    }

    fn now_h(&self) -> f64 {
        self.clock_h
    }

    fn seed(&self) -> u64 {
        self.config.seed
    }

    fn seed_vessel(
        &mut self,
        vessel_id: &str,
        cell_line: &str,
        initial_count: f64,
        capacity: f64,
    ) -> Result<OperationResult, VmError> {
        if vessel_id.is_empty() {
            return Err(VmError::invalid("vessel id must not be empty"));
        }
        if !initial_count.is_finite() || initial_count <= 0.0 || !capacity.is_finite() || capacity <= 0.0 {
            return Err(VmError::invalid(format!(
                "initial_count {} / capacity {} out of range",
                initial_count, capacity
            )));
        }
        if self.vessels.contains_key(vessel_id) {
            return Err(VmError::duplicate_vessel(vessel_id));
        }
        let line = self.tables.cell_line(cell_line)?;

        let plating = PlatingContext::sample(&self.streams, vessel_id, 0, &self.config.plating);
        let vessel = VesselState::seeded(
            vessel_id,
            cell_line,
            line,
            initial_count,
            capacity,
            self.fresh_media(),
            plating,
            self.clock_h,
        );
        self.death.verify(&vessel)?;

        debug!(
            "seed {} ({}): {:.3e} viable cells, confluence {:.3}",
            vessel_id,
            cell_line,
            vessel.cell_count,
            vessel.confluence()
        );
        let result = OperationResult::new("seed_vessel", Some(vessel_id), self.durations.seed_h, self.clock_h)
            .with_readout("cell_count", vessel.cell_count)
            .with_readout("viability", vessel.viability);

        self.biology_rngs
            .insert(vessel_id.to_string(), self.streams.stream(vessel_id, Purpose::Biology, 0));
        self.vessels.insert(vessel_id.to_string(), vessel);
        Ok(result)
    }

    fn treat_with_compound(&mut self, vessel_id: &str, compound_id: &str, dose_um: f64) -> Result<OperationResult, VmError> {
        if !dose_um.is_finite() || dose_um < 0.0 {
            return Err(VmError::invalid(format!("dose {} uM out of range", dose_um)));
        }
        self.require(vessel_id)?;
        let compound = self.tables.compound(compound_id)?.clone();
        let ec50_multiplier = self.run_context.ec50_multiplier();
        let death_config = self.death.config().clone();

        let mut result = OperationResult::new("treat_with_compound", Some(vessel_id), self.durations.treat_h, self.clock_h);
        self.handle(vessel_id, 0.0, &mut result)?;

        let vessel = self
            .vessels
            .get_mut(vessel_id)
            .ok_or_else(|| VmError::unknown_vessel(vessel_id))?;
        let rng = self
            .biology_rngs
            .get_mut(vessel_id)
            .ok_or_else(|| VmError::unknown_vessel(vessel_id))?;

        let prior_dose = vessel.dose_of(compound_id);
        let total_dose = prior_dose + dose_um;
        let slot = vessel.exposures.iter().position(|e| e.compound_id == compound_id);
        let mut exposure = match slot {
            Some(slot) => vessel.exposures[slot].clone(),
            None => Exposure {
                compound_id: compound_id.to_string(),
                dose_um: 0.0,
                time_since_dose_h: 0.0,
                lethal: [false; 3],
                commitment_delay_h: [None; 3],
            },
        };

        let mut instant = [0.0; 3];
        for subpop in Subpopulation::ALL {
            let i = subpop.index();
            let spec = vessel.subpopulations[i].spec;
            let ic50 = ic50_shifted(&compound, &vessel.cell_line, &spec, ec50_multiplier);
            instant[i] = incremental_kill(
                compound.instant_kill_max * dose_response(prior_dose, ic50, compound.potency_scalar),
                compound.instant_kill_max * dose_response(total_dose, ic50, compound.potency_scalar),
            );

            if !exposure.lethal[i] && self.death.is_lethal(total_dose, ic50) {
                let median = death_config.commitment_median_h * spec.ic50_shift;
                let delay = LogNormal::new(median.ln(), death_config.commitment_sigma)
                    .map_err(|e| VmError::invalid(format!("commitment delay distribution: {}", e)))?
                    .sample(rng);
                // Stored relative to the first addition
                exposure.lethal[i] = true;
                exposure.commitment_delay_h[i] = Some(exposure.time_since_dose_h + delay);
                debug!(
                    "{} / {}: {} lethal at {} uM, commits after {:.2} h",
                    vessel_id,
                    subpop.name(),
                    compound_id,
                    total_dose,
                    delay
                );
            }
        }

        if instant.iter().any(|k| *k > 0.0) {
            self.death.instant_kill(vessel, instant, DeathCause::Compound);
        }
        exposure.dose_um = total_dose;
        let lethal = exposure.lethal;
        match slot {
            Some(slot) => vessel.exposures[slot] = exposure,
            None => vessel.exposures.push(exposure),
        }
        self.death.verify(vessel)?;

        debug!("treat {} with {} +{} uM (total {} uM)", vessel_id, compound_id, dose_um, total_dose);
        let lethal_count = lethal.iter().filter(|l| **l).count();
        Ok(result
            .with_readout("lethal_subpopulations", lethal_count as f64)
            .with_readout("total_dose_um", total_dose)
            .with_readout("viability", vessel.viability))
    }

    fn advance_time(&mut self, hours: f64) -> Result<OperationResult, VmError> {
        let temperature = self.config.growth.optimal_temperature_c;
        self.advance(hours, temperature)?;
        debug!("advance {:.2} h -> t={:.2} h", hours, self.clock_h);
        Ok(OperationResult::new("advance_time", None, 0.0, self.clock_h).with_readout("hours", hours))
    }

    fn incubate(&mut self, duration_seconds: f64, temperature_c: f64) -> Result<OperationResult, VmError> {
        let (low, high) = TEMPERATURE_RANGE_C;
        if !temperature_c.is_finite() || temperature_c < low || temperature_c > high {
            return Err(VmError::invalid(format!("temperature {} C outside [{}, {}]", temperature_c, low, high)));
        }
        let hours = duration_seconds / 3600.0;
        self.advance(hours, temperature_c)?;
        debug!("incubate {:.2} h at {:.1} C -> t={:.2} h", hours, temperature_c, self.clock_h);
        Ok(OperationResult::new("incubate", None, 0.0, self.clock_h)
            .with_readout("hours", hours)
            .with_readout("temperature_c", temperature_c))
    }

    fn passage_cells(&mut self, source_vessel_id: &str, target_vessel_id: &str, split_ratio: f64) -> Result<OperationResult, VmError> {
        if !split_ratio.is_finite() || split_ratio < 1.0 {
            return Err(VmError::invalid(format!("split ratio {} must be >= 1", split_ratio)));
        }
        if target_vessel_id.is_empty() {
            return Err(VmError::invalid("vessel id must not be empty"));
        }
        let source = self.snapshot(source_vessel_id)?;
        if source_vessel_id != target_vessel_id {
            self.vessels.remove(source_vessel_id);
            self.biology_rngs.remove(source_vessel_id);
        }

        let passage_number = source.clock.passage_number + 1;
        let plating = PlatingContext::sample(&self.streams, target_vessel_id, passage_number, &self.config.plating);
        let mut target = VesselState {
            vessel_id: target_vessel_id.to_string(),
            cell_count: source.cell_count / split_ratio * plating.seeding_density_bias,
            exposures: Vec::new(),
            media: self.fresh_media(),
            clock: CultureClock::starting_at(self.clock_h, passage_number),
            plating,
            ..source
        };
        target.recompute_from_subpopulations();
        self.death.passage_attrition(&mut target);
        self.death.verify(&target)?;

        self.vessels.insert(target_vessel_id.to_string(), target);
        self.biology_rngs.insert(
            target_vessel_id.to_string(),
            self.streams
                .stream(target_vessel_id, Purpose::Biology, passage_number as u64),
        );

        let mut result = OperationResult::new("passage_cells", Some(target_vessel_id), self.durations.passage_h, self.clock_h);
        self.handle(target_vessel_id, 0.0, &mut result)?;

        let target = self.vessel(target_vessel_id)?;
        debug!(
            "passage {} -> {} (1:{}), passage #{}, {:.3e} viable cells",
            source_vessel_id, target_vessel_id, split_ratio, passage_number, target.cell_count
        );
        Ok(result
            .with_readout("cell_count", target.cell_count)
            .with_readout("viability", target.viability)
            .with_readout("passage_number", passage_number as f64))
    }

    fn washout_compound(&mut self, vessel_id: &str) -> Result<OperationResult, VmError> {
        self.require(vessel_id)?;
        let risk = self.config.handling.clone();
        let now = self.clock_h;

        let removed = {
            let vessel = self
                .vessels
                .get_mut(vessel_id)
                .ok_or_else(|| VmError::unknown_vessel(vessel_id))?;
            let removed = vessel.exposures.len();
            vessel.exposures.clear();
            vessel.clock.last_washout_h = Some(now);
            removed
        };

        let mut result = OperationResult::new("washout_compound", Some(vessel_id), risk.washout_time_cost_h, now)
            .with_readout("exposures_removed", removed as f64);
        self.handle(vessel_id, risk.washout_contamination_p, &mut result)?;
        debug!("washout {} ({} exposures removed)", vessel_id, removed);
        Ok(result)
    }

    fn feed_vessel(&mut self, vessel_id: &str) -> Result<OperationResult, VmError> {
        self.require(vessel_id)?;
        let media = self.fresh_media();
        let now = self.clock_h;
        if let Some(vessel) = self.vessels.get_mut(vessel_id) {
            vessel.media = media;
            vessel.clock.last_feed_h = now;
        }

        let mut result = OperationResult::new("feed_vessel", Some(vessel_id), self.durations.feed_h, now)
            .with_readout("glucose_mm", media.glucose_mm)
            .with_readout("glutamine_mm", media.glutamine_mm);
        self.handle(vessel_id, 0.0, &mut result)?;
        debug!("feed {}", vessel_id);
        Ok(result)
    }

    fn run_assay(&mut self, vessel_id: &str, assay: AssayKind) -> Result<OperationResult, VmError> {
        let measurement = self.assay(vessel_id, assay, &AssayOptions::default())?;
        let mut result = OperationResult::new(
            format!("assay:{}", assay.name()),
            Some(vessel_id),
            self.durations.assay_h(assay),
            self.clock_h,
        );
        result.readouts = measurement.measured;
        if let Some(failure) = measurement.failure {
            result.push_event(format!("pipeline_failure: {}", failure.name()));
        }
        Ok(result)
    }
}

#[cfg(test)]
impl BiologicalVirtualMachine {
    fn vessel_mut(&mut self, vessel_id: &str) -> &mut VesselState {
        self.vessels.get_mut(vessel_id).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HandlingRisk, PipelineConfig};
    use approx::assert_relative_eq;
    use proptest::prelude::*;

    fn quiet_vm(seed: u64) -> BiologicalVirtualMachine {
        let config = VmConfig { handling: HandlingRisk::none(), ..VmConfig::with_seed(seed) };
        BiologicalVirtualMachine::new(config, ParameterTables::default())
            .unwrap()
            .with_run_context(RunContext::neutral(seed))
    }

    const HAZARD_CAUSES_BUT_ER: [DeathCause; 6] = [
        DeathCause::Compound,
        DeathCause::Starvation,
        DeathCause::MitoticCatastrophe,
        DeathCause::MitoDysfunction,
        DeathCause::TransportDysfunction,
        DeathCause::Confluence,
    ];

    #[test]
    fn test_er_stress_end_to_end() {
        let mut vm = quiet_vm(42);
        vm.seed_vessel("A1", "A549", 1.0e6, 1.0e7).unwrap();
        vm.treat_with_compound("A1", "tunicamycin", 0.5).unwrap();

        vm.advance_time(12.0).unwrap();
        let v = vm.vessel("A1").unwrap();
        let typical = v.subpopulation(Subpopulation::Typical);
        assert!(
            typical.latent.er_stress > 0.55 && typical.latent.er_stress < 0.8,
            "typical er_stress {}",
            typical.latent.er_stress
        );
        assert!(v.latent.mito_dysfunction < 1e-12);
        assert!(v.latent.transport_dysfunction < 1e-12);
        assert!(v.viability >= 0.95, "viability at 12 h {}", v.viability);

        vm.advance_time(36.0).unwrap();
        let v = vm.vessel("A1").unwrap();
        assert!(v.viability < 0.95, "viability at 48 h {}", v.viability);
        let dead = 1.0 - v.viability;
        assert!(v.ledger.get(DeathCause::ErStress) > 0.7 * dead);
        for cause in HAZARD_CAUSES_BUT_ER {
            assert!(v.ledger.get(cause) < 1e-9, "{} = {}", cause.name(), v.ledger.get(cause));
        }
        assert!(v.check_conservation(1e-9).is_ok());
    }

    #[test]
    fn test_starvation_only() {
        let mut vm = quiet_vm(7);
        vm.seed_vessel("A1", "A549", 1.0e6, 1.0e7).unwrap();

        let mut hours = 0.0;
        while vm.vessel("A1").unwrap().media.glucose_mm >= 5.0 && hours < 240.0 {
            vm.advance_time(6.0).unwrap();
            hours += 6.0;
        }
        assert!(hours < 240.0, "media never depleted");
        vm.advance_time(24.0).unwrap();

        let v = vm.vessel("A1").unwrap();
        assert!(v.ledger.get(DeathCause::Starvation) > 0.0);
        for cause in [
            DeathCause::Compound,
            DeathCause::MitoticCatastrophe,
            DeathCause::ErStress,
            DeathCause::MitoDysfunction,
            DeathCause::TransportDysfunction,
            DeathCause::Confluence,
            DeathCause::Unknown,
        ] {
            assert_eq!(v.ledger.get(cause), 0.0, "{}", cause.name());
        }
    }

    #[test]
    fn test_axis_orthogonality() {
        for (compound, moved) in [("tunicamycin", 0), ("cccp", 1), ("nocodazole", 2)] {
            let mut vm = quiet_vm(1);
            vm.seed_vessel("A1", "A549", 1.0e6, 1.0e7).unwrap();
            vm.treat_with_compound("A1", compound, 1.0).unwrap();
            vm.advance_time(12.0).unwrap();

            let axes = vm.vessel("A1").unwrap().latent.as_array();
            for (i, value) in axes.iter().enumerate() {
                if i == moved {
                    assert!(*value > 0.1, "{} did not move axis {}", compound, i);
                } else {
                    assert_eq!(*value, 0.0, "{} leaked into axis {}", compound, i);
                }
            }
        }
    }

    #[test]
    fn test_washout_splits_acute_and_chronic() {
        let mut vm = quiet_vm(3);
        vm.seed_vessel("A1", "A549", 1.0e6, 1.0e7).unwrap();
        vm.treat_with_compound("A1", "tunicamycin", 1.0).unwrap();
        vm.advance_time(24.0).unwrap();

        let er_before = vm.cell_painting_assay("A1").unwrap().structural("er").unwrap();
        let upr_before = vm.qpcr_assay("A1", Marker::Upr).unwrap().structural("fold_change").unwrap();

        let clock = vm.now_h();
        let washout = vm.washout_compound("A1").unwrap();
        assert_relative_eq!(washout.time_cost_h, 0.25);
        assert_eq!(vm.now_h(), clock);
        assert!(vm.vessel("A1").unwrap().exposures.is_empty());

        let er_after = vm.cell_painting_assay("A1").unwrap().structural("er").unwrap();
        let upr_after = vm.qpcr_assay("A1", Marker::Upr).unwrap().structural("fold_change").unwrap();
        assert!(er_after < er_before - 0.3, "acute term did not drop: {} -> {}", er_before, er_after);
        assert_eq!(upr_after, upr_before);

        vm.advance_time(24.0).unwrap();
        let upr_late = vm.qpcr_assay("A1", Marker::Upr).unwrap().structural("fold_change").unwrap();
        let k_off = vm.config().kinetics.er_stress.k_off;
        assert_relative_eq!((upr_late - 1.0) / (upr_after - 1.0), (-k_off * 24.0).exp(), epsilon = 1e-9);
        assert!(upr_late > 1.5, "marker should still be elevated at 24 h: {}", upr_late);
    }

    #[test]
    fn test_subpopulation_divergence() {
        let mut vm = quiet_vm(11);
        vm.seed_vessel("A1", "A549", 1.0e6, 1.0e7).unwrap();
        let treat = vm.treat_with_compound("A1", "staurosporine", 1.0).unwrap();
        assert_eq!(treat.readout("lethal_subpopulations"), Some(3.0));

        let mut diverged = false;
        for _ in 0..200 {
            vm.advance_time(0.5).unwrap();
            let v = vm.vessel("A1").unwrap();
            let sensitive = v.subpopulation(Subpopulation::Sensitive).viability;
            let resistant = v.subpopulation(Subpopulation::Resistant).viability;
            if (sensitive - resistant).abs() > 1e-12 {
                assert!(sensitive < resistant);
                assert!(v.viability > 0.9, "aggregate already at {}", v.viability);
                diverged = true;
                break;
            }
        }
        assert!(diverged);
    }

    #[test]
    fn test_determinism() {
        let run = || {
            let mut vm = BiologicalVirtualMachine::with_seed(99).unwrap();
            vm.seed_vessel("plate1_A1", "HepG2", 5.0e5, 5.0e6).unwrap();
            vm.seed_vessel("plate1_A2", "A549", 5.0e5, 5.0e6).unwrap();
            vm.treat_with_compound("plate1_A1", "cccp", 10.0).unwrap();
            vm.treat_with_compound("plate1_A2", "staurosporine", 0.5).unwrap();
            vm.advance_time(30.0).unwrap();
            vm.feed_vessel("plate1_A2").unwrap();
            vm.advance_time(10.0).unwrap();
            let painting = vm.cell_painting_assay("plate1_A1").unwrap();
            let flow = vm.flow_cytometry_assay("plate1_A2").unwrap();
            (vm.snapshot("plate1_A1").unwrap(), vm.snapshot("plate1_A2").unwrap(), painting, flow)
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn test_assays_do_not_perturb_biology() {
        let protocol = |with_assays: bool| {
            let mut vm = BiologicalVirtualMachine::with_seed(5).unwrap();
            vm.seed_vessel("A1", "A549", 1.0e6, 1.0e7).unwrap();
            vm.treat_with_compound("A1", "thapsigargin", 0.5).unwrap();
            for _ in 0..4 {
                vm.advance_time(6.0).unwrap();
                if with_assays {
                    vm.cell_painting_assay("A1").unwrap();
                    vm.atp_viability_assay("A1").unwrap();
                    vm.cell_count_assay("A1").unwrap();
                    vm.elisa_assay("A1", Marker::LdhRelease).unwrap();
                }
            }
            vm.snapshot("A1").unwrap()
        };
        assert_eq!(protocol(true), protocol(false));
    }

    #[test]
    fn test_repeated_assays_share_structure() {
        let mut vm = quiet_vm(8);
        vm.seed_vessel("A1", "A549", 1.0e6, 1.0e7).unwrap();
        vm.treat_with_compound("A1", "tunicamycin", 0.5).unwrap();
        vm.advance_time(12.0).unwrap();

        let a = vm.cell_painting_assay("A1").unwrap();
        let b = vm.cell_painting_assay("A1").unwrap();
        assert_eq!(a.structural, b.structural);
        assert_ne!(a.measured, b.measured);
        assert_ne!(a.measurement_id, b.measurement_id);
        assert_eq!(a.batch_id, "A1");
    }

    #[test]
    fn test_pipeline_failure_is_per_batch() {
        let config = VmConfig {
            handling: HandlingRisk::none(),
            assay: crate::config::AssayConfig {
                pipeline: PipelineConfig { failure_probability: 1.0, ..PipelineConfig::default() },
                ..Default::default()
            },
            ..VmConfig::with_seed(4)
        };
        let mut vm = BiologicalVirtualMachine::new(config, ParameterTables::default()).unwrap();
        vm.seed_vessel("plateA_1", "A549", 1.0e6, 1.0e7).unwrap();
        vm.seed_vessel("plateA_2", "A549", 1.0e6, 1.0e7).unwrap();

        let one = vm.cell_painting_assay("plateA_1").unwrap();
        let two = vm.cell_painting_assay("plateA_2").unwrap();
        assert!(one.failure.is_some());
        assert_eq!(one.failure, two.failure);
        assert_eq!(vm.batch_count(), 1);

        let op = vm.run_assay("plateA_1", AssayKind::CellPainting).unwrap();
        assert_eq!(op.status, cellvm_env::OperationStatus::CompletedWithEvents);
    }

    #[test]
    fn test_identity_errors() {
        let mut vm = quiet_vm(1);
        vm.seed_vessel("A1", "A549", 1.0e6, 1.0e7).unwrap();

        assert!(matches!(vm.seed_vessel("A1", "A549", 1.0e6, 1.0e7), Err(VmError::DuplicateVessel(_))));
        assert!(matches!(vm.treat_with_compound("B9", "dmso", 1.0), Err(VmError::UnknownVessel(_))));
        assert!(matches!(vm.washout_compound("B9"), Err(VmError::UnknownVessel(_))));
        assert!(matches!(vm.cell_painting_assay("B9"), Err(VmError::UnknownVessel(_))));
        assert!(matches!(vm.passage_cells("B9", "B10", 2.0), Err(VmError::UnknownVessel(_))));
    }

    #[test]
    fn test_invalid_parameters() {
        let mut vm = quiet_vm(1);
        vm.seed_vessel("A1", "A549", 1.0e6, 1.0e7).unwrap();

        assert!(matches!(vm.treat_with_compound("A1", "dmso", -1.0), Err(VmError::InvalidParameter(_))));
        assert!(matches!(vm.treat_with_compound("A1", "unobtainium", 1.0), Err(VmError::InvalidParameter(_))));
        assert!(matches!(vm.advance_time(f64::NAN), Err(VmError::InvalidParameter(_))));
        assert!(matches!(vm.incubate(3600.0, 90.0), Err(VmError::InvalidParameter(_))));
        assert!(matches!(vm.passage_cells("A1", "A2", 0.5), Err(VmError::InvalidParameter(_))));
        assert!(matches!(vm.seed_vessel("A2", "NotACellLine", 1.0e6, 1.0e7), Err(VmError::InvalidParameter(_))));
        assert!(matches!(vm.seed_vessel("A3", "A549", 1.0e6, 0.0), Err(VmError::InvalidParameter(_))));
    }

    #[test]
    fn test_split_dose_matches_single_dose() {
        let run = |doses: &[f64]| {
            let mut vm = quiet_vm(21);
            vm.seed_vessel("A1", "A549", 1.0e6, 1.0e7).unwrap();
            for dose in doses {
                vm.treat_with_compound("A1", "tunicamycin", *dose).unwrap();
            }
            assert_eq!(vm.vessel("A1").unwrap().exposures.len(), 1);
            assert_relative_eq!(vm.vessel("A1").unwrap().dose_of("tunicamycin"), 1.0);
            vm.advance_time(12.0).unwrap();
            vm.snapshot("A1").unwrap()
        };
        let single = run(&[1.0]);
        let split = run(&[0.5, 0.5]);
        for subpop in Subpopulation::ALL {
            assert_relative_eq!(
                split.subpopulation(subpop).latent.er_stress,
                single.subpopulation(subpop).latent.er_stress,
                epsilon = 1e-12
            );
        }
        assert_relative_eq!(split.viability, single.viability, epsilon = 1e-12);
    }

    #[test]
    fn test_split_instant_kill_matches_single() {
        let run = |doses: &[f64]| {
            let mut vm = quiet_vm(22);
            vm.seed_vessel("A1", "A549", 1.0e6, 1.0e7).unwrap();
            for dose in doses {
                vm.treat_with_compound("A1", "digitonin", *dose).unwrap();
            }
            vm.snapshot("A1").unwrap()
        };
        let single = run(&[200.0]);
        let split = run(&[100.0, 100.0]);
        assert_relative_eq!(split.viability, single.viability, epsilon = 1e-12);
        assert_relative_eq!(
            split.ledger.get(DeathCause::Compound),
            single.ledger.get(DeathCause::Compound),
            epsilon = 1e-12
        );
        assert!(split.check_conservation(1e-9).is_ok());
    }

    #[test]
    fn test_cumulative_dose_becomes_lethal() {
        let mut single = quiet_vm(23);
        single.seed_vessel("A1", "A549", 1.0e6, 1.0e7).unwrap();
        let once = single.treat_with_compound("A1", "staurosporine", 0.6).unwrap();
        assert_eq!(once.readout("lethal_subpopulations"), Some(2.0));

        let mut split = quiet_vm(23);
        split.seed_vessel("A1", "A549", 1.0e6, 1.0e7).unwrap();
        let first = split.treat_with_compound("A1", "staurosporine", 0.3).unwrap();
        assert_eq!(first.readout("lethal_subpopulations"), Some(1.0));
        let sensitive_delay = split.vessel("A1").unwrap().exposures[0].commitment_delay_h[0];
        assert!(sensitive_delay.is_some());

        split.advance_time(2.0).unwrap();
        let second = split.treat_with_compound("A1", "staurosporine", 0.3).unwrap();
        assert_eq!(second.readout("lethal_subpopulations"), Some(2.0));
        assert_eq!(second.readout("total_dose_um"), Some(0.6));

        let exposure = &split.vessel("A1").unwrap().exposures[0];
        assert_eq!(exposure.lethal, [true, true, false]);
        // Already-sampled delays are kept; new ones count from the lethal addition
        assert_eq!(exposure.commitment_delay_h[0], sensitive_delay);
        let typical_delay = exposure.commitment_delay_h[1].unwrap();
        assert!(typical_delay > 2.0, "typical delay {}", typical_delay);
        assert_eq!(exposure.commitment_delay_h[2], None);

        single.advance_time(48.0).unwrap();
        split.advance_time(46.0).unwrap();
        let a = single.vessel("A1").unwrap().ledger.get(DeathCause::Compound);
        let b = split.vessel("A1").unwrap().ledger.get(DeathCause::Compound);
        assert!(a > 0.5, "single-dose compound death {}", a);
        assert_relative_eq!(a, b, epsilon = 0.05);
    }

    #[test]
    fn test_same_axis_compounds_stay_bounded() {
        let mut vm = quiet_vm(24);
        vm.seed_vessel("A1", "A549", 1.0e6, 1.0e7).unwrap();
        vm.treat_with_compound("A1", "tunicamycin", 2.0).unwrap();
        vm.treat_with_compound("A1", "thapsigargin", 0.4).unwrap();
        assert_eq!(vm.vessel("A1").unwrap().exposures.len(), 2);

        let mut alone = quiet_vm(24);
        alone.seed_vessel("A1", "A549", 1.0e6, 1.0e7).unwrap();
        alone.treat_with_compound("A1", "tunicamycin", 2.0).unwrap();

        vm.advance_time(24.0).unwrap();
        alone.advance_time(24.0).unwrap();
        let v = vm.vessel("A1").unwrap();
        for sp in &v.subpopulations {
            assert!(sp.latent.er_stress <= 1.0);
            assert_eq!(sp.latent.mito_dysfunction, 0.0);
            assert_eq!(sp.latent.transport_dysfunction, 0.0);
        }
        assert!(v.latent.er_stress > alone.vessel("A1").unwrap().latent.er_stress);
        assert!(v.check_conservation(1e-9).is_ok());
    }

    #[test]
    fn test_missing_commitment_delay_surfaces() {
        let mut vm = quiet_vm(2);
        vm.seed_vessel("A1", "A549", 1.0e6, 1.0e7).unwrap();
        vm.treat_with_compound("A1", "staurosporine", 1.0).unwrap();
        vm.vessel_mut("A1").exposures[0].commitment_delay_h[1] = None;

        let err = vm.advance_time(1.0).unwrap_err();
        assert!(matches!(err, VmError::MissingCommitmentDelay { .. }));
    }

    #[test]
    fn test_passage_carries_latent_not_compound() {
        let mut vm = quiet_vm(6);
        vm.seed_vessel("A1", "A549", 1.0e6, 1.0e7).unwrap();
        vm.treat_with_compound("A1", "tunicamycin", 0.5).unwrap();
        vm.advance_time(24.0).unwrap();
        let source = vm.snapshot("A1").unwrap();

        vm.passage_cells("A1", "B1", 4.0).unwrap();
        assert!(vm.vessel("A1").is_err());

        let target = vm.vessel("B1").unwrap();
        assert!(target.exposures.is_empty());
        assert_eq!(target.clock.passage_number, 1);
        assert_eq!(target.clock.seed_time_h, vm.now_h());
        assert_eq!(target.media.glucose_mm, vm.config().media.fresh_glucose_mm);
        assert_relative_eq!(target.latent.er_stress, source.latent.er_stress, epsilon = 1e-12);
        assert!(target.ledger.get(DeathCause::Unknown) > source.ledger.get(DeathCause::Unknown));
        assert!(target.cell_count < source.cell_count / 3.0);
        assert!(target.check_conservation(1e-9).is_ok());

        // Same-id passage keeps the vessel
        vm.passage_cells("B1", "B1", 2.0).unwrap();
        assert_eq!(vm.vessel("B1").unwrap().clock.passage_number, 2);
    }

    #[test]
    fn test_instant_kill_compound() {
        let mut vm = quiet_vm(9);
        vm.seed_vessel("A1", "A549", 1.0e6, 1.0e7).unwrap();
        vm.treat_with_compound("A1", "digitonin", 200.0).unwrap();
        let v = vm.vessel("A1").unwrap();
        assert!(v.ledger.get(DeathCause::Compound) > 0.5);
        assert!(v.check_conservation(1e-9).is_ok());
    }

    #[test]
    fn test_feed_restores_media() {
        let mut vm = quiet_vm(10);
        vm.seed_vessel("A1", "A549", 1.0e6, 1.0e7).unwrap();
        vm.advance_time(48.0).unwrap();
        assert!(vm.vessel("A1").unwrap().media.glucose_mm < 25.0);

        vm.feed_vessel("A1").unwrap();
        let v = vm.vessel("A1").unwrap();
        assert_eq!(v.media.glucose_mm, 25.0);
        assert_eq!(v.clock.last_feed_h, vm.now_h());
    }

    #[test]
    fn test_incubate_converts_seconds() {
        let mut vm = quiet_vm(12);
        vm.seed_vessel("A1", "A549", 1.0e6, 1.0e7).unwrap();
        vm.incubate(7200.0, 37.0).unwrap();
        assert_relative_eq!(vm.now_h(), 2.0, epsilon = 1e-12);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn prop_random_protocols_conserve(
            seed in 0u64..1000,
            ops in prop::collection::vec((0u8..5, 0usize..4, 0.0f64..20.0), 1..25),
        ) {
            let compounds = ["tunicamycin", "cccp", "nocodazole", "staurosporine"];
            let mut config = VmConfig::with_seed(seed);
            // Make incidents common enough to exercise the instant-kill path
            config.handling.contamination_p = 0.1;
            let mut vm = BiologicalVirtualMachine::new(config, ParameterTables::default()).unwrap();
            vm.seed_vessel("A1", "A549", 1.0e6, 1.0e7).unwrap();

            for (op, which, x) in ops {
                match op {
                    0 => { vm.treat_with_compound("A1", compounds[which], x).unwrap(); }
                    1 => { vm.advance_time(x).unwrap(); }
                    2 => { vm.washout_compound("A1").unwrap(); }
                    3 => { vm.feed_vessel("A1").unwrap(); }
                    _ => { vm.passage_cells("A1", "A1", 1.0 + x).unwrap(); }
                }
                let v = vm.vessel("A1").unwrap();
                prop_assert!(v.check_conservation(1e-5).is_ok());
                prop_assert!(v.viability >= 0.0 && v.viability <= 1.0);

                // One exposure per compound, judged on its cumulative dose
                let ec50_multiplier = vm.run_context().ec50_multiplier();
                for exposure in &v.exposures {
                    prop_assert_eq!(v.exposures.iter().filter(|e| e.compound_id == exposure.compound_id).count(), 1);
                    let compound = vm.tables().compound(&exposure.compound_id).unwrap();
                    for subpop in Subpopulation::ALL {
                        let i = subpop.index();
                        let spec = &v.subpopulation(subpop).spec;
                        let ic50 = ic50_shifted(compound, &v.cell_line, spec, ec50_multiplier);
                        if exposure.dose_um >= vm.config().death.lethal_dose_multiple * ic50 {
                            prop_assert!(exposure.lethal[i]);
                        }
                        prop_assert_eq!(exposure.lethal[i], exposure.commitment_delay_h[i].is_some());
                    }
                }
            }
        }
    }
}
