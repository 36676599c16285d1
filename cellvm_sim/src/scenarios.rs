//! Scenario definitions for CellVM simulation checks.
//!
//! Each scenario is a runnable property of the biological engine: a fixed
//! protocol plus the assertions that must hold at the end of it.

use serde::Serialize;

/// Identifies a simulation scenario.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioId {
    /// CVM-001: ER compound end to end.
    ///
    /// 1e6 cells, 0.5 µM tunicamycin. ER stress builds within 12 h while
    /// the culture is still healthy; by 48 h the ER bucket carries the death.
    ErStress,

    /// CVM-002: Untreated culture runs out of glucose.
    ///
    /// Only the starvation bucket may fill.
    Starvation,

    /// CVM-003: Washout separates acute from chronic signal.
    ///
    /// Morphology drops immediately, the UPR marker decays on k_off.
    WashoutSplit,

    /// CVM-004: Subpopulations diverge under a lethal dose.
    ///
    /// Sensitive cells commit first, before the aggregate looks sick.
    SubpopulationDivergence,

    /// CVM-005: Same seed, same protocol, same trajectory.
    ///
    /// Runs a multi-vessel protocol with full nuisance twice and compares
    /// every vessel state and assay result bit for bit.
    Determinism,

    /// CVM-006: Assays never touch biology.
    ///
    /// A protocol with interleaved assays ends in the same state as the
    /// same protocol without them.
    AssayNonInterference,

    /// CVM-007: Each compound class moves only its own axis.
    AxisOrthogonality,

    /// CVM-008: Random operation sequences keep the ledger balanced.
    ConservationFuzz,

    /// CVM-009: Run-context shifts share a common "cursed day" factor.
    ///
    /// Samples many seeds and checks pairwise correlation ≈0.5.
    CursedDay,

    /// CVM-010: Pipeline failures are a function of (seed, batch).
    ///
    /// Two VMs with the same seed agree on every batch's failure mode, and
    /// all wells of a batch share it.
    BatchFailures,
}

impl ScenarioId {
    /// Returns all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::ErStress,
            ScenarioId::Starvation,
            ScenarioId::WashoutSplit,
            ScenarioId::SubpopulationDivergence,
            ScenarioId::Determinism,
            ScenarioId::AssayNonInterference,
            ScenarioId::AxisOrthogonality,
            ScenarioId::ConservationFuzz,
            ScenarioId::CursedDay,
            ScenarioId::BatchFailures,
        ]
    }

    /// Returns the scenario name.
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::ErStress => "er_stress",
            ScenarioId::Starvation => "starvation",
            ScenarioId::WashoutSplit => "washout_split",
            ScenarioId::SubpopulationDivergence => "subpopulation_divergence",
            ScenarioId::Determinism => "determinism",
            ScenarioId::AssayNonInterference => "assay_non_interference",
            ScenarioId::AxisOrthogonality => "axis_orthogonality",
            ScenarioId::ConservationFuzz => "conservation_fuzz",
            ScenarioId::CursedDay => "cursed_day",
            ScenarioId::BatchFailures => "batch_failures",
        }
    }

    /// Returns a description of the scenario.
    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::ErStress => "Tunicamycin 0.5 µM: ER stress at 12 h, ER-attributed death at 48 h",
            ScenarioId::Starvation => "Untreated culture depletes glucose; only starvation death",
            ScenarioId::WashoutSplit => "Washout drops acute morphology, chronic UPR decays slowly",
            ScenarioId::SubpopulationDivergence => "Sensitive subpopulation dies first under staurosporine",
            ScenarioId::Determinism => "Identical seed and protocol give bit-identical output",
            ScenarioId::AssayNonInterference => "Assays leave biological state unchanged",
            ScenarioId::AxisOrthogonality => "ER, mito and transport compounds stay on their own axis",
            ScenarioId::ConservationFuzz => "Random protocols keep sum(death_*) = 1 - viability",
            ScenarioId::CursedDay => "Incubator, reagent and instrument shifts correlate ≈0.5",
            ScenarioId::BatchFailures => "Pipeline failures are deterministic per (seed, batch)",
        }
    }

    /// Returns true if the scenario runs under a neutral run context with
    /// handling incidents disabled.
    pub fn is_calibration(&self) -> bool {
        matches!(
            self,
            ScenarioId::ErStress
                | ScenarioId::Starvation
                | ScenarioId::WashoutSplit
                | ScenarioId::SubpopulationDivergence
                | ScenarioId::AxisOrthogonality
        )
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ScenarioId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "er_stress" | "erstress" | "cvm-001" => Ok(ScenarioId::ErStress),
            "starvation" | "cvm-002" => Ok(ScenarioId::Starvation),
            "washout_split" | "washout" | "cvm-003" => Ok(ScenarioId::WashoutSplit),
            "subpopulation_divergence" | "divergence" | "cvm-004" => Ok(ScenarioId::SubpopulationDivergence),
            "determinism" | "cvm-005" => Ok(ScenarioId::Determinism),
            "assay_non_interference" | "non_interference" | "cvm-006" => Ok(ScenarioId::AssayNonInterference),
            "axis_orthogonality" | "orthogonality" | "cvm-007" => Ok(ScenarioId::AxisOrthogonality),
            "conservation_fuzz" | "fuzz" | "cvm-008" => Ok(ScenarioId::ConservationFuzz),
            "cursed_day" | "cursedday" | "cvm-009" => Ok(ScenarioId::CursedDay),
            "batch_failures" | "batches" | "cvm-010" => Ok(ScenarioId::BatchFailures),
            _ => Err(format!("Unknown scenario: {}", s)),
        }
    }
}
