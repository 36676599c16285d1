//! Scenario runner - executes CellVM property scenarios.

use crate::scenarios::ScenarioId;

use cellvm_core::config::HandlingRisk;
use cellvm_core::validation::ValidationSession;
use cellvm_core::{
    BiologicalVirtualMachine, DeathCause, ParameterTables, RunContext, Subpopulation, VmConfig,
};
use cellvm_env::{AssayKind, Hardware, Marker, OperationResult, VmError};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use tracing::{debug, info, warn};

/// Results from running a scenario.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioResult {
    /// Scenario that was run
    pub scenario: ScenarioId,

    /// Seed used
    pub seed: u64,

    /// Whether scenario passed all assertions
    pub passed: bool,

    /// VM clock at the end of the scenario (hours)
    pub final_clock_h: f64,

    /// Live vessels at the end of the scenario
    pub final_vessel_count: usize,

    /// Failure message if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,

    /// Metrics collected during run
    pub metrics: ScenarioMetrics,
}

/// Metrics collected during scenario execution.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioMetrics {
    /// Hardware operations issued
    pub operations: u64,

    /// Assays run (direct or through `run_assay`)
    pub assays: u64,

    /// Handling incidents and pipeline failures reported
    pub events: u64,

    /// Lowest aggregate viability observed
    pub min_viability: f64,

    /// Largest |sum(death_*) - (1 - viability)| observed
    pub max_conservation_error: f64,
}

impl Default for ScenarioMetrics {
    fn default() -> Self {
        Self {
            operations: 0,
            assays: 0,
            events: 0,
            min_viability: 1.0,
            max_conservation_error: 0.0,
        }
    }
}

/// Assertion and metric bookkeeping for one scenario run.
#[derive(Debug, Default)]
struct Trial {
    metrics: ScenarioMetrics,
    failures: Vec<String>,
    final_clock_h: f64,
    final_vessel_count: usize,
}

impl Trial {
    fn record(&mut self, result: OperationResult) -> OperationResult {
        self.metrics.operations += 1;
        self.metrics.events += result.events.len() as u64;
        if result.operation.starts_with("assay:") {
            self.metrics.assays += 1;
        }
        result
    }

    fn assay(&mut self) {
        self.metrics.assays += 1;
    }

    fn check(&mut self, condition: bool, message: impl Into<String>) {
        if !condition {
            let message = message.into();
            debug!("  check failed: {}", message);
            self.failures.push(message);
        }
    }

    /// Samples viability and conservation across every live vessel.
    fn observe(&mut self, vm: &BiologicalVirtualMachine) -> Result<(), VmError> {
        for id in vm.vessel_ids() {
            let vessel = vm.vessel(&id)?;
            self.metrics.min_viability = self.metrics.min_viability.min(vessel.viability);
            let mut error = (vessel.ledger.total() - (1.0 - vessel.viability)).abs();
            for sp in &vessel.subpopulations {
                error = error.max((sp.ledger.total() - (1.0 - sp.viability)).abs());
            }
            self.metrics.max_conservation_error = self.metrics.max_conservation_error.max(error);
        }
        self.final_clock_h = vm.now_h();
        self.final_vessel_count = vm.vessel_ids().len();
        Ok(())
    }
}

/// Hazard causes other than ER stress.
const NON_ER_HAZARDS: [DeathCause; 6] = [
    DeathCause::Compound,
    DeathCause::Starvation,
    DeathCause::MitoticCatastrophe,
    DeathCause::MitoDysfunction,
    DeathCause::TransportDysfunction,
    DeathCause::Confluence,
];

/// Runs CellVM scenarios.
pub struct ScenarioRunner {
    /// Configuration seed
    seed: u64,

    /// Base configuration (seed is overridden per run)
    config: VmConfig,

    /// Cell-line and compound tables
    tables: ParameterTables,

    /// Operations per vessel pool in the conservation fuzz
    fuzz_operations: usize,
}

impl ScenarioRunner {
    /// Creates a new scenario runner with default configuration.
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            config: VmConfig::default(),
            tables: ParameterTables::default(),
            fuzz_operations: 200,
        }
    }

    /// Sets the VM configuration.
    pub fn with_config(mut self, config: VmConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the parameter tables.
    pub fn with_tables(mut self, tables: ParameterTables) -> Self {
        self.tables = tables;
        self
    }

    /// Sets the number of random operations in the conservation fuzz.
    pub fn with_fuzz_operations(mut self, operations: usize) -> Self {
        self.fuzz_operations = operations;
        self
    }

    /// Runs a scenario and returns the result.
    pub fn run(&self, scenario: ScenarioId) -> ScenarioResult {
        info!("Starting scenario: {} (seed={})", scenario.name(), self.seed);
        if scenario.is_calibration() {
            debug!("  neutral run context, handling incidents off");
        }

        let outcome = match scenario {
            ScenarioId::ErStress => self.run_er_stress(),
            ScenarioId::Starvation => self.run_starvation(),
            ScenarioId::WashoutSplit => self.run_washout_split(),
            ScenarioId::SubpopulationDivergence => self.run_subpopulation_divergence(),
            ScenarioId::Determinism => self.run_determinism(),
            ScenarioId::AssayNonInterference => self.run_assay_non_interference(),
            ScenarioId::AxisOrthogonality => self.run_axis_orthogonality(),
            ScenarioId::ConservationFuzz => self.run_conservation_fuzz(),
            ScenarioId::CursedDay => self.run_cursed_day(),
            ScenarioId::BatchFailures => self.run_batch_failures(),
        };

        match outcome {
            Ok(trial) => ScenarioResult {
                scenario,
                seed: self.seed,
                passed: trial.failures.is_empty(),
                final_clock_h: trial.final_clock_h,
                final_vessel_count: trial.final_vessel_count,
                failure_reason: if trial.failures.is_empty() {
                    None
                } else {
                    Some(trial.failures.join("; "))
                },
                metrics: trial.metrics,
            },
            Err(err) => {
                warn!("Scenario {} aborted: {}", scenario.name(), err);
                ScenarioResult {
                    scenario,
                    seed: self.seed,
                    passed: false,
                    final_clock_h: 0.0,
                    final_vessel_count: 0,
                    failure_reason: Some(format!("{}: {}", err.kind(), err)),
                    metrics: ScenarioMetrics::default(),
                }
            }
        }
    }

    /// VM with the full nuisance model.
    fn vm(&self) -> Result<BiologicalVirtualMachine, VmError> {
        let config = VmConfig { seed: self.seed, ..self.config.clone() };
        BiologicalVirtualMachine::new(config, self.tables.clone())
    }

    /// VM with a neutral run context and no handling incidents.
    fn calibration_vm(&self) -> Result<BiologicalVirtualMachine, VmError> {
        let config = VmConfig {
            seed: self.seed,
            handling: HandlingRisk::none(),
            ..self.config.clone()
        };
        Ok(BiologicalVirtualMachine::new(config, self.tables.clone())?.with_run_context(RunContext::neutral(self.seed)))
    }

    /// CVM-001: tunicamycin 0.5 µM, read at 12 h and 48 h.
    fn run_er_stress(&self) -> Result<Trial, VmError> {
        let mut vm = self.calibration_vm()?;
        let mut trial = Trial::default();

        trial.record(vm.seed_vessel("A1", "A549", 1.0e6, 1.0e7)?);
        trial.record(vm.treat_with_compound("A1", "tunicamycin", 0.5)?);
        trial.record(vm.advance_time(12.0)?);
        trial.observe(&vm)?;

        let v = vm.vessel("A1")?;
        let er = v.subpopulation(Subpopulation::Typical).latent.er_stress;
        debug!("  t=12h | er_stress={:.3} | viability={:.4}", er, v.viability);
        trial.check(er > 0.55 && er < 0.8, format!("typical er_stress at 12 h = {:.3}", er));
        trial.check(
            v.latent.mito_dysfunction < 1e-12 && v.latent.transport_dysfunction < 1e-12,
            "off-axis stress at 12 h",
        );
        trial.check(v.viability >= 0.95, format!("viability at 12 h = {:.4}", v.viability));

        trial.record(vm.advance_time(36.0)?);
        trial.observe(&vm)?;

        let v = vm.vessel("A1")?;
        let dead = 1.0 - v.viability;
        let er_bucket = v.ledger.get(DeathCause::ErStress);
        debug!("  t=48h | viability={:.4} | death_er_stress={:.4}", v.viability, er_bucket);
        trial.check(v.viability < 0.95, format!("viability at 48 h = {:.4}", v.viability));
        trial.check(er_bucket > 0.7 * dead, format!("death_er_stress {:.4} of {:.4}", er_bucket, dead));
        for cause in NON_ER_HAZARDS {
            let value = v.ledger.get(cause);
            trial.check(value < 1e-9, format!("{} = {:.2e}", cause.name(), value));
        }
        Ok(trial)
    }

    /// CVM-002: run an untreated culture until glucose drops below 5 mM.
    fn run_starvation(&self) -> Result<Trial, VmError> {
        let mut vm = self.calibration_vm()?;
        let mut trial = Trial::default();

        trial.record(vm.seed_vessel("A1", "A549", 1.0e6, 1.0e7)?);
        let mut hours = 0.0;
        while vm.vessel("A1")?.media.glucose_mm >= 5.0 && hours < 240.0 {
            trial.record(vm.advance_time(6.0)?);
            trial.observe(&vm)?;
            hours += 6.0;
        }
        trial.check(hours < 240.0, "media never depleted");
        debug!("  glucose below 5 mM after {}h", hours);

        trial.record(vm.advance_time(24.0)?);
        trial.observe(&vm)?;

        let v = vm.vessel("A1")?;
        trial.check(v.ledger.get(DeathCause::Starvation) > 0.0, "no starvation death");
        for cause in DeathCause::ALL {
            if matches!(cause, DeathCause::Starvation | DeathCause::Unattributed) {
                continue;
            }
            trial.check(v.ledger.get(cause) == 0.0, format!("{} = {:.2e}", cause.name(), v.ledger.get(cause)));
        }
        Ok(trial)
    }

    /// CVM-003: washout after 24 h of tunicamycin.
    fn run_washout_split(&self) -> Result<Trial, VmError> {
        let mut vm = self.calibration_vm()?;
        let mut trial = Trial::default();

        trial.record(vm.seed_vessel("A1", "A549", 1.0e6, 1.0e7)?);
        trial.record(vm.treat_with_compound("A1", "tunicamycin", 1.0)?);
        trial.record(vm.advance_time(24.0)?);

        let upr = |vm: &mut BiologicalVirtualMachine, trial: &mut Trial| -> Result<f64, VmError> {
            trial.assay();
            let result = vm.qpcr_assay("A1", Marker::Upr)?;
            result
                .structural("fold_change")
                .ok_or_else(|| VmError::invalid("qpcr result without fold_change"))
        };
        let er_channel = |vm: &mut BiologicalVirtualMachine, trial: &mut Trial| -> Result<f64, VmError> {
            trial.assay();
            let result = vm.cell_painting_assay("A1")?;
            result
                .structural("er")
                .ok_or_else(|| VmError::invalid("painting result without er channel"))
        };

        let er_before = er_channel(&mut vm, &mut trial)?;
        let upr_before = upr(&mut vm, &mut trial)?;

        let clock = vm.now_h();
        trial.record(vm.washout_compound("A1")?);
        trial.check(vm.now_h() == clock, "washout advanced the clock");

        let er_after = er_channel(&mut vm, &mut trial)?;
        let upr_after = upr(&mut vm, &mut trial)?;
        trial.check(
            er_after < er_before - 0.3,
            format!("acute morphology did not drop: {:.3} -> {:.3}", er_before, er_after),
        );
        trial.check(upr_after == upr_before, "chronic marker moved at washout");

        trial.record(vm.advance_time(24.0)?);
        trial.observe(&vm)?;
        let upr_late = upr(&mut vm, &mut trial)?;
        let k_off = vm.config().kinetics.er_stress.k_off;
        let expected = (-k_off * 24.0).exp();
        let observed = (upr_late - 1.0) / (upr_after - 1.0);
        debug!("  UPR decay over 24h: observed {:.4}, k_off predicts {:.4}", observed, expected);
        trial.check((observed - expected).abs() < 1e-6, format!("UPR decay {:.4} != {:.4}", observed, expected));
        trial.check(upr_late > 1.5, format!("UPR no longer elevated at 24 h: {:.3}", upr_late));
        Ok(trial)
    }

    /// CVM-004: staurosporine above the lethal threshold for every subpopulation.
    fn run_subpopulation_divergence(&self) -> Result<Trial, VmError> {
        let mut vm = self.calibration_vm()?;
        let mut trial = Trial::default();

        trial.record(vm.seed_vessel("A1", "A549", 1.0e6, 1.0e7)?);
        trial.record(vm.treat_with_compound("A1", "staurosporine", 1.0)?);

        for _ in 0..200 {
            trial.record(vm.advance_time(0.5)?);
            trial.observe(&vm)?;
            let v = vm.vessel("A1")?;
            let sensitive = v.subpopulation(Subpopulation::Sensitive).viability;
            let resistant = v.subpopulation(Subpopulation::Resistant).viability;
            if (sensitive - resistant).abs() > 1e-12 {
                debug!(
                    "  diverged at t={:.1}h | sensitive={:.4} resistant={:.4} aggregate={:.4}",
                    vm.now_h(),
                    sensitive,
                    resistant,
                    v.viability
                );
                trial.check(sensitive < resistant, "resistant subpopulation died first");
                trial.check(v.viability > 0.9, format!("aggregate already at {:.4}", v.viability));
                return Ok(trial);
            }
        }
        trial.check(false, "subpopulations never diverged");
        Ok(trial)
    }

    /// The protocol used by the determinism check.
    fn determinism_protocol(&self) -> Result<(Vec<cellvm_core::VesselState>, Vec<cellvm_core::AssayResult>), VmError> {
        let mut vm = self.vm()?;
        vm.seed_vessel("plate1_A1", "HepG2", 5.0e5, 5.0e6)?;
        vm.seed_vessel("plate1_A2", "A549", 5.0e5, 5.0e6)?;
        vm.seed_vessel("plate2_A1", "U2OS", 5.0e5, 5.0e6)?;
        vm.treat_with_compound("plate1_A1", "cccp", 10.0)?;
        vm.treat_with_compound("plate1_A2", "staurosporine", 0.5)?;
        vm.treat_with_compound("plate2_A1", "nocodazole", 0.2)?;
        vm.advance_time(30.0)?;
        vm.feed_vessel("plate1_A2")?;
        vm.washout_compound("plate2_A1")?;
        vm.passage_cells("plate2_A1", "plate3_A1", 3.0)?;
        vm.incubate(36000.0, 36.5)?;

        let mut assays = Vec::new();
        for id in vm.vessel_ids() {
            assays.push(vm.cell_painting_assay(&id)?);
            assays.push(vm.flow_cytometry_assay(&id)?);
            assays.push(vm.western_blot_assay(&id, Marker::Transport)?);
        }
        let vessels = vm
            .vessel_ids()
            .iter()
            .map(|id| vm.snapshot(id))
            .collect::<Result<Vec<_>, _>>()?;
        Ok((vessels, assays))
    }

    /// CVM-005: run the same protocol twice.
    fn run_determinism(&self) -> Result<Trial, VmError> {
        let mut trial = Trial::default();
        let (vessels_a, assays_a) = self.determinism_protocol()?;
        let (vessels_b, assays_b) = self.determinism_protocol()?;

        trial.metrics.operations = 22;
        trial.metrics.assays = assays_a.len() as u64 * 2;
        for v in &vessels_a {
            trial.metrics.min_viability = trial.metrics.min_viability.min(v.viability);
        }
        trial.final_vessel_count = vessels_a.len();
        trial.final_clock_h = vessels_a.first().map(|v| v.clock.last_update_h).unwrap_or(0.0);

        trial.check(vessels_a == vessels_b, "vessel states differ between identical runs");
        trial.check(assays_a == assays_b, "assay results differ between identical runs");
        Ok(trial)
    }

    /// CVM-006: interleave assays and compare against an assay-free run.
    fn run_assay_non_interference(&self) -> Result<Trial, VmError> {
        let mut trial = Trial::default();
        let protocol = |with_assays: bool, trial: &mut Trial| -> Result<cellvm_core::VesselState, VmError> {
            let mut vm = self.vm()?;
            vm.seed_vessel("A1", "A549", 1.0e6, 1.0e7)?;
            vm.treat_with_compound("A1", "thapsigargin", 0.5)?;
            for _ in 0..4 {
                vm.advance_time(6.0)?;
                if with_assays {
                    for kind in [
                        AssayKind::CellPainting,
                        AssayKind::AtpViability,
                        AssayKind::CellCount,
                        AssayKind::FlowCytometry,
                        AssayKind::Elisa(Marker::LdhRelease),
                        AssayKind::Qpcr(Marker::Upr),
                    ] {
                        trial.record(vm.run_assay("A1", kind)?);
                    }
                }
            }
            if with_assays {
                trial.observe(&vm)?;
                let first = vm.cell_painting_assay("A1")?;
                let second = vm.cell_painting_assay("A1")?;
                trial.assay();
                trial.assay();
                trial.check(first.structural == second.structural, "structural layer differs between repeats");
                trial.check(first.measured != second.measured, "measured layer identical between repeats");
            }
            vm.snapshot("A1")
        };

        let with = protocol(true, &mut trial)?;
        let without = protocol(false, &mut trial)?;
        trial.check(with == without, "assays changed the biological trajectory");
        Ok(trial)
    }

    /// CVM-007: one compound per stress class, 12 h each.
    fn run_axis_orthogonality(&self) -> Result<Trial, VmError> {
        let mut trial = Trial::default();
        for (compound, moved) in [("tunicamycin", 0), ("cccp", 1), ("nocodazole", 2)] {
            let mut vm = self.calibration_vm()?;
            trial.record(vm.seed_vessel("A1", "A549", 1.0e6, 1.0e7)?);
            trial.record(vm.treat_with_compound("A1", compound, 1.0)?);
            trial.record(vm.advance_time(12.0)?);
            trial.observe(&vm)?;

            let axes = vm.vessel("A1")?.latent.as_array();
            debug!("  {} -> {:?}", compound, axes);
            for (i, value) in axes.iter().enumerate() {
                if i == moved {
                    trial.check(*value > 0.1, format!("{} did not move axis {}", compound, i));
                } else {
                    trial.check(*value == 0.0, format!("{} leaked {:.2e} into axis {}", compound, value, i));
                }
            }
        }
        Ok(trial)
    }

    /// CVM-008: random operations on a small vessel pool.
    fn run_conservation_fuzz(&self) -> Result<Trial, VmError> {
        const POOL: [&str; 4] = ["fuzz_A", "fuzz_B", "fuzz_C", "fuzz_D"];
        const COMPOUNDS: [&str; 6] = ["tunicamycin", "thapsigargin", "cccp", "nocodazole", "staurosporine", "digitonin"];
        const ASSAYS: [AssayKind; 4] = [
            AssayKind::CellPainting,
            AssayKind::AtpViability,
            AssayKind::CellCount,
            AssayKind::WesternBlot(Marker::MitoPotential),
        ];

        let mut config = VmConfig { seed: self.seed, ..self.config.clone() };
        // Incidents common enough to exercise the instant-kill path
        config.handling.contamination_p = config.handling.contamination_p.max(0.05);
        let mut vm = BiologicalVirtualMachine::new(config, self.tables.clone())?;
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed ^ 0xC311_F022);
        let mut trial = Trial::default();

        trial.record(vm.seed_vessel(POOL[0], "A549", 1.0e6, 1.0e7)?);
        trial.record(vm.seed_vessel(POOL[1], "HepG2", 8.0e5, 6.0e6)?);

        for _ in 0..self.fuzz_operations {
            let live = vm.vessel_ids();
            let vessel = live[rng.gen_range(0..live.len())].clone();
            let result = match rng.gen_range(0..7u8) {
                0 => {
                    let compound = COMPOUNDS[rng.gen_range(0..COMPOUNDS.len())];
                    let dose = 10f64.powf(rng.gen_range(-2.0..2.5));
                    vm.treat_with_compound(&vessel, compound, dose)?
                }
                1 => vm.advance_time(rng.gen_range(0.1..12.0))?,
                2 => vm.incubate(rng.gen_range(600.0..36000.0), rng.gen_range(33.0..40.0))?,
                3 => vm.washout_compound(&vessel)?,
                4 => vm.feed_vessel(&vessel)?,
                5 => {
                    let target = POOL
                        .iter()
                        .find(|id| !live.iter().any(|l| l == *id))
                        .filter(|_| rng.gen_bool(0.5))
                        .map(|id| id.to_string())
                        .unwrap_or_else(|| vessel.clone());
                    vm.passage_cells(&vessel, &target, rng.gen_range(1.0..8.0))?
                }
                _ => vm.run_assay(&vessel, ASSAYS[rng.gen_range(0..ASSAYS.len())])?,
            };
            trial.record(result);
            trial.observe(&vm)?;
            for id in vm.vessel_ids() {
                vm.vessel(&id)?.check_conservation(1e-5)?;
            }
        }

        trial.check(
            trial.metrics.max_conservation_error <= 1e-5,
            format!("conservation error {:.2e}", trial.metrics.max_conservation_error),
        );
        trial.check(
            (0.0..=1.0).contains(&trial.metrics.min_viability),
            format!("viability out of range: {}", trial.metrics.min_viability),
        );
        Ok(trial)
    }

    /// CVM-009: pairwise correlation of run-context shifts over many seeds.
    fn run_cursed_day(&self) -> Result<Trial, VmError> {
        let mut trial = Trial::default();
        let mut session = ValidationSession::new();
        for offset in 0..2000u64 {
            let ctx = RunContext::sample(self.seed.wrapping_add(offset));
            session.record("incubator~reagent_lot", ctx.incubator_shift, ctx.reagent_lot_shift);
            session.record("incubator~instrument", ctx.incubator_shift, ctx.instrument_shift);
            session.record("reagent_lot~instrument", ctx.reagent_lot_shift, ctx.instrument_shift);
        }

        let report = session.generate_report();
        for (pair, metrics) in &report.per_readout {
            let r = metrics.correlation();
            debug!("  {} r={:.3}", pair, r);
            trial.check(r > 0.35 && r < 0.65, format!("{} correlation {:.3} not ≈0.5", pair, r));
        }
        Ok(trial)
    }

    /// CVM-010: two VMs, same seed, two plates with two wells each.
    fn run_batch_failures(&self) -> Result<Trial, VmError> {
        const WELLS: [&str; 4] = ["plateA_1", "plateA_2", "plateB_1", "plateB_2"];
        let mut trial = Trial::default();

        let mut config = VmConfig { seed: self.seed, handling: HandlingRisk::none(), ..self.config.clone() };
        config.assay.pipeline.failure_probability = 0.5;

        let mut failures = Vec::new();
        for _ in 0..2 {
            let mut vm = BiologicalVirtualMachine::new(config.clone(), self.tables.clone())?;
            let mut modes = Vec::new();
            for well in WELLS {
                trial.record(vm.seed_vessel(well, "A549", 1.0e6, 1.0e7)?);
            }
            for well in WELLS {
                trial.assay();
                modes.push(vm.cell_painting_assay(well)?.failure);
            }
            trial.check(vm.batch_count() == 2, format!("expected 2 batches, saw {}", vm.batch_count()));
            trial.observe(&vm)?;
            failures.push(modes);
        }

        trial.check(failures[0] == failures[1], "failure modes differ between same-seed runs");
        let modes = &failures[0];
        trial.check(modes[0] == modes[1] && modes[2] == modes[3], "wells of one batch disagree");
        Ok(trial)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_er_stress_scenario() {
        let result = ScenarioRunner::new(42).run(ScenarioId::ErStress);
        assert!(result.passed, "{:?}", result.failure_reason);
        assert!(result.metrics.min_viability < 0.95);
        assert!(result.metrics.max_conservation_error < 1e-9);
    }

    #[test]
    fn test_starvation_scenario() {
        let result = ScenarioRunner::new(7).run(ScenarioId::Starvation);
        assert!(result.passed, "{:?}", result.failure_reason);
    }

    #[test]
    fn test_determinism_scenario() {
        let result = ScenarioRunner::new(99).run(ScenarioId::Determinism);
        assert!(result.passed, "{:?}", result.failure_reason);
        assert_eq!(result.final_vessel_count, 3);
    }

    #[test]
    fn test_non_interference_scenario() {
        let result = ScenarioRunner::new(5).run(ScenarioId::AssayNonInterference);
        assert!(result.passed, "{:?}", result.failure_reason);
        assert_eq!(result.metrics.assays, 26);
    }

    #[test]
    fn test_cursed_day_scenario() {
        let result = ScenarioRunner::new(0).run(ScenarioId::CursedDay);
        assert!(result.passed, "{:?}", result.failure_reason);
    }

    #[test]
    fn test_batch_failures_scenario() {
        let result = ScenarioRunner::new(4).run(ScenarioId::BatchFailures);
        assert!(result.passed, "{:?}", result.failure_reason);
        assert_eq!(result.final_vessel_count, 4);
    }

    #[test]
    fn test_bad_tables_abort_with_reason() {
        let tables = ParameterTables { compounds: Default::default(), ..ParameterTables::default() };
        let result = ScenarioRunner::new(1).with_tables(tables).run(ScenarioId::ErStress);
        assert!(!result.passed);
        assert!(result.failure_reason.unwrap().starts_with("invalid_parameter"));
    }

    #[test]
    fn test_result_serializes() {
        let result = ScenarioRunner::new(3).run(ScenarioId::AxisOrthogonality);
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["scenario"], "axis_orthogonality");
        assert_eq!(json["metrics"]["operations"], 9);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(8))]

        #[test]
        fn prop_fuzz_conserves_for_any_seed(seed in 0u64..10_000) {
            let result = ScenarioRunner::new(seed)
                .with_fuzz_operations(60)
                .run(ScenarioId::ConservationFuzz);
            prop_assert!(result.passed, "{:?}", result.failure_reason);
        }
    }
}
