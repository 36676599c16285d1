//! The "DEATH" Engine - Competing-Risk Survival with Cause Attribution
//!
//! Every named hazard acts on the same survivors within a step:
//!
//! ```text
//! survival = exp(-sum(h_i) * dt)
//! death    = v * (1 - survival)
//! ledger_i += death * h_i / sum(h_i)
//! ```
//!
//! so realized death is split by hazard share and the ledger identity
//! `sum(ledger) == 1 - viability` holds by construction. It is still checked
//! after every step; a mismatch is an error, never rescaled away.

use crate::cellvm_latent::{dose_response, ic50_shifted};
use crate::config::DeathConfig;
use crate::params::{CellLineParams, ParameterTables, StressAxis};
use crate::vessel::{DeathCause, MediaState, Subpopulation, VesselState};
use cellvm_env::VmError;

/// Hazard rates (1/h) for one subpopulation, indexed by cause.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Hazards {
    rates: [f64; DeathCause::COUNT],
}

impl Hazards {
    pub fn add(&mut self, cause: DeathCause, rate: f64) {
        if rate > 0.0 {
            self.rates[cause.index()] += rate;
        }
    }

    pub fn get(&self, cause: DeathCause) -> f64 {
        self.rates[cause.index()]
    }

    pub fn total(&self) -> f64 {
        self.rates.iter().sum()
    }
}

/// Competing-risk death engine.
#[derive(Debug, Clone)]
pub struct DeathEngine {
    config: DeathConfig,
}

impl DeathEngine {
    pub fn new(config: DeathConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DeathConfig {
        &self.config
    }

    /// True if `dose_um` is lethal at this shifted IC50.
    pub fn is_lethal(&self, dose_um: f64, ic50_shifted: f64) -> bool {
        dose_um >= self.config.lethal_dose_multiple * ic50_shifted
    }

    /// Linear ramp below the glucose / glutamine thresholds.
    pub fn starvation_hazard(&self, media: &MediaState) -> f64 {
        let deficit = |level: f64, threshold: f64| {
            if threshold > 0.0 {
                ((threshold - level) / threshold).clamp(0.0, 1.0)
            } else {
                0.0
            }
        };
        let worst = deficit(media.glucose_mm, self.config.glucose_threshold_mm)
            .max(deficit(media.glutamine_mm, self.config.glutamine_threshold_mm));
        self.config.starvation_h_max * worst
    }

    /// Linear ramp above the confluence threshold.
    pub fn confluence_hazard(&self, confluence: f64) -> f64 {
        let threshold = self.config.confluence_threshold;
        if confluence <= threshold {
            return 0.0;
        }
        let excess = ((confluence - threshold) / (1.0 - threshold).max(1e-9)).min(1.0);
        self.config.confluence_h_max * excess
    }

    /// Compound attrition and mitotic catastrophe for one subpopulation.
    ///
    /// Attrition only counts for lethal exposures whose commitment delay has
    /// elapsed; a lethal exposure without a sampled delay is an error.
    pub fn compound_hazards(
        &self,
        vessel: &VesselState,
        subpop: Subpopulation,
        line: &CellLineParams,
        tables: &ParameterTables,
        ec50_multiplier: f64,
    ) -> Result<(f64, f64), VmError> {
        let i = subpop.index();
        let spec = &vessel.subpopulations[i].spec;
        let mut attrition = 0.0;
        let mut mitotic = 0.0;

        for exposure in &vessel.exposures {
            let compound = tables.compound(&exposure.compound_id)?;
            let ic50 = ic50_shifted(compound, &vessel.cell_line, spec, ec50_multiplier);
            let f = dose_response(exposure.dose_um, ic50, compound.potency_scalar);

            if exposure.lethal[i] {
                let delay = exposure.commitment_delay_h[i].ok_or_else(|| VmError::MissingCommitmentDelay {
                    vessel_id: vessel.vessel_id.clone(),
                    subpopulation: subpop.name().to_string(),
                    compound_id: exposure.compound_id.clone(),
                })?;
                if exposure.time_since_dose_h >= delay {
                    attrition += self.config.attrition_rate_per_h * compound.toxicity_scalar * f;
                }
            }

            if compound.stress_axis == StressAxis::Microtubule {
                mitotic += std::f64::consts::LN_2 / line.doubling_time_h * f;
            }
        }
        Ok((attrition, mitotic))
    }

    /// Applies one step of competing-risk death to every subpopulation.
    ///
    /// Viable cell count follows aggregate viability; the vessel projection
    /// is refreshed afterwards.
    pub fn apply(&self, vessel: &mut VesselState, hazards: &[Hazards; 3], dt: f64) {
        let v_before = vessel.viability;
        for (sp, h) in vessel.subpopulations.iter_mut().zip(hazards.iter()) {
            let total = h.total();
            if total <= 0.0 || sp.viability <= 0.0 {
                continue;
            }
            let death = sp.viability * (1.0 - (-total * dt).exp());
            for cause in DeathCause::ALL {
                let rate = h.get(cause);
                if rate > 0.0 {
                    sp.ledger.add(cause, death * rate / total);
                }
            }
            sp.viability -= death;
        }
        vessel.recompute_from_subpopulations();
        rescale_count(vessel, v_before);
    }

    /// Kills `fractions[i]` of each subpopulation's survivors at once.
    pub fn instant_kill(&self, vessel: &mut VesselState, fractions: [f64; 3], cause: DeathCause) {
        let v_before = vessel.viability;
        for (sp, fraction) in vessel.subpopulations.iter_mut().zip(fractions) {
            sp.kill(fraction, cause);
        }
        vessel.recompute_from_subpopulations();
        rescale_count(vessel, v_before);
    }

    /// Dissociation loss on passage, credited to `death_unknown`.
    pub fn passage_attrition(&self, vessel: &mut VesselState) {
        let a = self.config.passage_attrition;
        self.instant_kill(vessel, [a; 3], DeathCause::Unknown);
    }

    /// Ledger identity check at the configured tolerance.
    pub fn verify(&self, vessel: &VesselState) -> Result<(), VmError> {
        vessel.check_conservation(self.config.conservation_tolerance)
    }
}

fn rescale_count(vessel: &mut VesselState, v_before: f64) {
    vessel.cell_count = if v_before > 0.0 {
        vessel.cell_count * vessel.viability / v_before
    } else {
        0.0
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plating::PlatingContext;
    use crate::vessel::Exposure;
    use approx::assert_relative_eq;
    use proptest::prelude::*;

    fn vessel() -> VesselState {
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

    fn engine() -> DeathEngine {
        DeathEngine::new(DeathConfig::default())
    }

    #[test]
    fn test_competing_risks_split_by_share() {
        let mut v = vessel();
        let mut h = Hazards::default();
        h.add(DeathCause::ErStress, 0.03);
        h.add(DeathCause::Starvation, 0.01);
        engine().apply(&mut v, &[h; 3], 5.0);

        let er = v.ledger.get(DeathCause::ErStress);
        let starv = v.ledger.get(DeathCause::Starvation);
        assert_relative_eq!(er / starv, 3.0, epsilon = 1e-9);
        assert_relative_eq!(v.viability, 0.98 * (-0.2f64).exp(), epsilon = 1e-12);
        assert!(engine().verify(&v).is_ok());
    }

    #[test]
    fn test_count_tracks_viability() {
        let mut v = vessel();
        let before = v.cell_count;
        engine().instant_kill(&mut v, [0.5, 0.0, 0.0], DeathCause::Unknown);
        assert_relative_eq!(v.cell_count, before * (1.0 - 0.125), epsilon = 1e-6);
        assert_relative_eq!(v.ledger.get(DeathCause::Unknown), 0.25 * 0.49, epsilon = 1e-12);
    }

    #[test]
    fn test_starvation_ramp() {
        let e = engine();
        assert_eq!(e.starvation_hazard(&MediaState { glucose_mm: 25.0, glutamine_mm: 4.0 }), 0.0);
        let half = e.starvation_hazard(&MediaState { glucose_mm: 2.5, glutamine_mm: 4.0 });
        assert_relative_eq!(half, 0.04, epsilon = 1e-12);
        let empty = e.starvation_hazard(&MediaState { glucose_mm: 0.0, glutamine_mm: 0.0 });
        assert_relative_eq!(empty, 0.08, epsilon = 1e-12);
    }

    #[test]
    fn test_confluence_ramp() {
        let e = engine();
        assert_eq!(e.confluence_hazard(0.5), 0.0);
        assert_relative_eq!(e.confluence_hazard(0.95), 0.01, epsilon = 1e-12);
        assert_relative_eq!(e.confluence_hazard(1.5), 0.02, epsilon = 1e-12);
    }

    #[test]
    fn test_missing_commitment_delay_is_error() {
        let tables = ParameterTables::default();
        let mut v = vessel();
        v.exposures.push(Exposure {
            compound_id: "staurosporine".to_string(),
            dose_um: 1.0,
            time_since_dose_h: 20.0,
            lethal: [true, true, true],
            commitment_delay_h: [Some(5.0), None, Some(5.0)],
        });
        let line = tables.cell_line("A549").unwrap();

        assert!(engine().compound_hazards(&v, Subpopulation::Sensitive, line, &tables, 1.0).is_ok());
        let err = engine()
            .compound_hazards(&v, Subpopulation::Typical, line, &tables, 1.0)
            .unwrap_err();
        assert!(matches!(err, VmError::MissingCommitmentDelay { .. }));
    }

    #[test]
    fn test_attrition_waits_for_commitment() {
        let tables = ParameterTables::default();
        let line = tables.cell_line("A549").unwrap();
        let mut v = vessel();
        v.exposures.push(Exposure {
            compound_id: "staurosporine".to_string(),
            dose_um: 1.0,
            time_since_dose_h: 4.0,
            lethal: [true; 3],
            commitment_delay_h: [Some(6.0); 3],
        });
        let (before, _) = engine().compound_hazards(&v, Subpopulation::Typical, line, &tables, 1.0).unwrap();
        v.exposures[0].time_since_dose_h = 6.0;
        let (after, _) = engine().compound_hazards(&v, Subpopulation::Typical, line, &tables, 1.0).unwrap();

        assert_eq!(before, 0.0);
        // 0.15 * toxicity 1.0 * f(1.0 / (1.0 + 0.05))
        assert_relative_eq!(after, 0.15 / 1.05, epsilon = 1e-12);
    }

    #[test]
    fn test_mitotic_catastrophe_microtubule_only() {
        let tables = ParameterTables::default();
        let line = tables.cell_line("A549").unwrap();
        let mut v = vessel();
        v.exposures.push(Exposure {
            compound_id: "nocodazole".to_string(),
            dose_um: 0.1,
            time_since_dose_h: 0.0,
            lethal: [false; 3],
            commitment_delay_h: [None; 3],
        });
        let (attrition, mitotic) = engine().compound_hazards(&v, Subpopulation::Typical, line, &tables, 1.0).unwrap();
        assert_eq!(attrition, 0.0);
        assert_relative_eq!(mitotic, std::f64::consts::LN_2 / 22.0 * 0.5, epsilon = 1e-12);

        v.exposures[0].compound_id = "tunicamycin".to_string();
        let (_, mitotic) = engine().compound_hazards(&v, Subpopulation::Typical, line, &tables, 1.0).unwrap();
        assert_eq!(mitotic, 0.0);
    }

    proptest! {
        #[test]
        fn prop_ledger_conserved_under_random_hazards(
            rates in prop::collection::vec(0.0f64..0.5, DeathCause::COUNT),
            kills in prop::collection::vec(0.0f64..0.3, 3),
            dts in prop::collection::vec(0.01f64..2.0, 1..20),
        ) {
            let e = engine();
            let mut v = vessel();
            let mut h = Hazards::default();
            for (cause, rate) in DeathCause::ALL.iter().zip(rates.iter()) {
                h.add(*cause, *rate);
            }
            e.instant_kill(&mut v, [kills[0], kills[1], kills[2]], DeathCause::Compound);
            for dt in dts {
                e.apply(&mut v, &[h; 3], dt);
                prop_assert!(e.verify(&v).is_ok());
            }
            e.passage_attrition(&mut v);
            prop_assert!(e.verify(&v).is_ok());
            prop_assert!(v.viability >= 0.0 && v.viability <= 1.0);
        }
    }
}
