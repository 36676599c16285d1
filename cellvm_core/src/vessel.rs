//! Culture vessel state.
//!
//! Each vessel carries three subpopulation buckets that evolve on their own.
//! Vessel-level viability, latent stress and ledger are a fraction-weighted
//! projection of the buckets, refreshed only by
//! [`VesselState::recompute_from_subpopulations`].

use crate::params::{CellLineParams, SubpopulationSpec};
use crate::plating::PlatingContext;
use cellvm_env::VmError;
use serde::{Deserialize, Serialize};

/// Sensitivity bucket of a culture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Subpopulation {
    Sensitive,
    Typical,
    Resistant,
}

impl Subpopulation {
    pub const ALL: [Subpopulation; 3] = [
        Subpopulation::Sensitive,
        Subpopulation::Typical,
        Subpopulation::Resistant,
    ];

    pub fn index(&self) -> usize {
        match self {
            Subpopulation::Sensitive => 0,
            Subpopulation::Typical => 1,
            Subpopulation::Resistant => 2,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Subpopulation::Sensitive => "sensitive",
            Subpopulation::Typical => "typical",
            Subpopulation::Resistant => "resistant",
        }
    }
}

/// Latent stress axes, each in [0, 1].
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LatentState {
    pub er_stress: f64,
    pub mito_dysfunction: f64,
    pub transport_dysfunction: f64,
}

impl LatentState {
    pub fn as_array(&self) -> [f64; 3] {
        [self.er_stress, self.mito_dysfunction, self.transport_dysfunction]
    }

    /// Largest axis value.
    pub fn max_axis(&self) -> f64 {
        self.er_stress.max(self.mito_dysfunction).max(self.transport_dysfunction)
    }
}

/// Named causes of death, one ledger bucket each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeathCause {
    Compound,
    Starvation,
    MitoticCatastrophe,
    ErStress,
    MitoDysfunction,
    TransportDysfunction,
    Confluence,
    /// Handling incidents and passage stress
    Unknown,
    /// Dead on arrival at seeding
    Unattributed,
}

impl DeathCause {
    pub const COUNT: usize = 9;

    pub const ALL: [DeathCause; DeathCause::COUNT] = [
        DeathCause::Compound,
        DeathCause::Starvation,
        DeathCause::MitoticCatastrophe,
        DeathCause::ErStress,
        DeathCause::MitoDysfunction,
        DeathCause::TransportDysfunction,
        DeathCause::Confluence,
        DeathCause::Unknown,
        DeathCause::Unattributed,
    ];

    pub fn index(&self) -> usize {
        *self as usize
    }

    /// Ledger field name, e.g. `death_er_stress`.
    pub fn name(&self) -> &'static str {
        match self {
            DeathCause::Compound => "death_compound",
            DeathCause::Starvation => "death_starvation",
            DeathCause::MitoticCatastrophe => "death_mitotic_catastrophe",
            DeathCause::ErStress => "death_er_stress",
            DeathCause::MitoDysfunction => "death_mito_dysfunction",
            DeathCause::TransportDysfunction => "death_transport_dysfunction",
            DeathCause::Confluence => "death_confluence",
            DeathCause::Unknown => "death_unknown",
            DeathCause::Unattributed => "death_unattributed",
        }
    }
}

/// Cumulative fraction of the culture lost to each cause.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DeathLedger {
    buckets: [f64; DeathCause::COUNT],
}

impl DeathLedger {
    pub fn get(&self, cause: DeathCause) -> f64 {
        self.buckets[cause.index()]
    }

    pub fn add(&mut self, cause: DeathCause, fraction: f64) {
        self.buckets[cause.index()] += fraction;
    }

    /// Sum over every bucket.
    pub fn total(&self) -> f64 {
        self.buckets.iter().sum()
    }

    /// Multiplies every bucket (growth dilution).
    pub fn scale(&mut self, factor: f64) {
        for b in self.buckets.iter_mut() {
            *b *= factor;
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (DeathCause, f64)> + '_ {
        DeathCause::ALL.iter().map(move |c| (*c, self.get(*c)))
    }

    fn add_weighted(&mut self, other: &DeathLedger, weight: f64) {
        for (mine, theirs) in self.buckets.iter_mut().zip(other.buckets.iter()) {
            *mine += weight * theirs;
        }
    }
}

/// One subpopulation bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubpopState {
    /// Fixed sensitivity parameters and share of the culture
    pub spec: SubpopulationSpec,
    pub viability: f64,
    pub latent: LatentState,
    pub ledger: DeathLedger,
}

impl SubpopState {
    /// Applies an instant kill of `fraction` of the survivors.
    pub fn kill(&mut self, fraction: f64, cause: DeathCause) {
        let killed = self.viability * fraction.clamp(0.0, 1.0);
        self.viability -= killed;
        self.ledger.add(cause, killed);
    }
}

/// Active exposure to one compound. Repeated additions accumulate here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exposure {
    pub compound_id: String,
    /// Cumulative dose in the well
    pub dose_um: f64,
    /// Hours since the first addition
    pub time_since_dose_h: f64,

    /// True where the cumulative dose is lethal for the subpopulation
    pub lethal: [bool; 3],

    /// Commitment time counted from the first addition, sampled once when the
    /// subpopulation turns lethal; `None` where not lethal
    pub commitment_delay_h: [Option<f64>; 3],
}

/// Culture media.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MediaState {
    pub glucose_mm: f64,
    pub glutamine_mm: f64,
}

/// Temporal bookkeeping on the VM clock (hours).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CultureClock {
    pub seed_time_h: f64,
    pub last_update_h: f64,
    pub last_feed_h: f64,
    pub last_washout_h: Option<f64>,
    pub passage_number: u32,
}

impl CultureClock {
    pub fn starting_at(now_h: f64, passage_number: u32) -> Self {
        Self {
            seed_time_h: now_h,
            last_update_h: now_h,
            last_feed_h: now_h,
            last_washout_h: None,
            passage_number,
        }
    }
}

/// One culture vessel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VesselState {
    pub vessel_id: String,
    pub cell_line: String,

    /// Viable cells
    pub cell_count: f64,

    /// Cells at 100% confluence
    pub capacity: f64,

    /// Aggregate surviving fraction (derived)
    pub viability: f64,

    /// Aggregate latent stress (derived)
    pub latent: LatentState,

    /// Aggregate death ledger (derived)
    pub ledger: DeathLedger,

    /// [sensitive, typical, resistant]
    pub subpopulations: [SubpopState; 3],

    pub exposures: Vec<Exposure>,
    pub media: MediaState,
    pub clock: CultureClock,
    pub plating: PlatingContext,
}

impl VesselState {
    /// Creates a freshly seeded vessel.
    ///
    /// `initial_count` is the nominal number of cells plated; the plating
    /// density bias and the dead fraction at seeding are applied here.
    #[allow(clippy::too_many_arguments)]
    pub fn seeded(
        vessel_id: &str,
        cell_line: &str,
        params: &CellLineParams,
        initial_count: f64,
        capacity: f64,
        media: MediaState,
        plating: PlatingContext,
        now_h: f64,
    ) -> Self {
        let v0 = params.seeding_viability;
        let subpopulations = params.subpopulations.map(|spec| {
            let mut ledger = DeathLedger::default();
            ledger.add(DeathCause::Unattributed, 1.0 - v0);
            SubpopState {
                spec,
                viability: v0,
                latent: LatentState::default(),
                ledger,
            }
        });

        let mut vessel = Self {
            vessel_id: vessel_id.to_string(),
            cell_line: cell_line.to_string(),
            cell_count: initial_count * plating.seeding_density_bias * v0,
            capacity,
            viability: v0,
            latent: LatentState::default(),
            ledger: DeathLedger::default(),
            subpopulations,
            exposures: Vec::new(),
            media,
            clock: CultureClock::starting_at(now_h, 0),
            plating,
        };
        vessel.recompute_from_subpopulations();
        vessel
    }

    pub fn subpopulation(&self, subpop: Subpopulation) -> &SubpopState {
        &self.subpopulations[subpop.index()]
    }

    pub fn confluence(&self) -> f64 {
        self.cell_count / self.capacity
    }

    /// Hours since seeding (or the last passage).
    pub fn age_h(&self, now_h: f64) -> f64 {
        (now_h - self.clock.seed_time_h).max(0.0)
    }

    /// Viable plus dead cells still in the vessel.
    pub fn total_cells(&self) -> f64 {
        if self.viability > 0.0 {
            self.cell_count / self.viability
        } else {
            0.0
        }
    }

    /// Refreshes the vessel-level projection from the subpopulation buckets.
    pub fn recompute_from_subpopulations(&mut self) {
        let mut viability = 0.0;
        let mut latent = LatentState::default();
        let mut ledger = DeathLedger::default();
        for sp in &self.subpopulations {
            let w = sp.spec.fraction;
            viability += w * sp.viability;
            latent.er_stress += w * sp.latent.er_stress;
            latent.mito_dysfunction += w * sp.latent.mito_dysfunction;
            latent.transport_dysfunction += w * sp.latent.transport_dysfunction;
            ledger.add_weighted(&sp.ledger, w);
        }
        self.viability = viability;
        self.latent = latent;
        self.ledger = ledger;
    }

    /// Checks `sum(ledger) == 1 - viability` per subpopulation and in aggregate.
    pub fn check_conservation(&self, tolerance: f64) -> Result<(), VmError> {
        let scopes = Subpopulation::ALL
            .iter()
            .map(|s| (s.name(), &self.subpopulations[s.index()].ledger, self.subpopulations[s.index()].viability))
            .chain(std::iter::once(("aggregate", &self.ledger, self.viability)));

        for (scope, ledger, viability) in scopes {
            let ledger_sum = ledger.total();
            let expected = 1.0 - viability;
            if !((ledger_sum - expected).abs() <= tolerance) {
                return Err(VmError::ConservationViolation {
                    vessel_id: self.vessel_id.clone(),
                    scope: scope.to_string(),
                    ledger_sum,
                    expected,
                });
            }
        }
        Ok(())
    }

    /// Cumulative dose of a compound in the well (0 if absent).
    pub fn dose_of(&self, compound_id: &str) -> f64 {
        self.exposures
            .iter()
            .filter(|e| e.compound_id == compound_id)
            .map(|e| e.dose_um)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::ParameterTables;
    use approx::assert_relative_eq;

    fn a549() -> VesselState {
        let tables = ParameterTables::default();
        VesselState::seeded(
            "A1",
            "A549",
            tables.cell_line("A549").unwrap(),
            1.0e6,
            1.0e7,
            MediaState { glucose_mm: 25.0, glutamine_mm: 4.0 },
            PlatingContext::clean(),
            0.0,
        )
    }

    #[test]
    fn test_seeded_vessel_conserves() {
        let vessel = a549();
        assert_relative_eq!(vessel.viability, 0.98, epsilon = 1e-12);
        assert_relative_eq!(vessel.ledger.get(DeathCause::Unattributed), 0.02, epsilon = 1e-12);
        assert_relative_eq!(vessel.cell_count, 0.98e6, epsilon = 1e-6);
        assert!(vessel.check_conservation(1e-9).is_ok());
    }

    #[test]
    fn test_recompute_is_weighted_mean() {
        let mut vessel = a549();
        vessel.subpopulations[0].kill(0.5, DeathCause::Compound);
        vessel.subpopulations[0].latent.er_stress = 0.8;
        vessel.recompute_from_subpopulations();

        // Sensitive bucket is 25% of the culture
        assert_relative_eq!(vessel.viability, 0.98 - 0.25 * 0.49, epsilon = 1e-12);
        assert_relative_eq!(vessel.latent.er_stress, 0.2, epsilon = 1e-12);
        assert_relative_eq!(vessel.ledger.get(DeathCause::Compound), 0.25 * 0.49, epsilon = 1e-12);
        assert!(vessel.check_conservation(1e-9).is_ok());
    }

    #[test]
    fn test_conservation_violation_detected() {
        let mut vessel = a549();
        vessel.subpopulations[2].viability -= 0.01;
        let err = vessel.check_conservation(1e-5).unwrap_err();
        match err {
            VmError::ConservationViolation { scope, .. } => assert_eq!(scope, "resistant"),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_ledger_scale_and_iter() {
        let mut ledger = DeathLedger::default();
        ledger.add(DeathCause::ErStress, 0.2);
        ledger.add(DeathCause::Unknown, 0.1);
        ledger.scale(0.5);

        assert_relative_eq!(ledger.total(), 0.15, epsilon = 1e-12);
        let names: Vec<_> = ledger.iter().map(|(c, _)| c.name()).collect();
        assert_eq!(names.len(), DeathCause::COUNT);
        assert_eq!(names[3], "death_er_stress");
    }

    #[test]
    fn test_cause_indices_match_all() {
        for (i, cause) in DeathCause::ALL.iter().enumerate() {
            assert_eq!(cause.index(), i);
        }
    }
}
