//! Media consumption and logistic growth.
//!
//! Growth adds viable cells while the dead stay in the well, so each
//! subpopulation's viability and ledger are diluted by the same factor:
//! `v -> v*g / (v*g + 1 - v)`, buckets scaled by `1 / (v*g + 1 - v)`.

use crate::config::{DeathConfig, GrowthConfig};
use crate::params::CellLineParams;
use crate::vessel::VesselState;

/// Cells per uptake unit (rates are per 10^6 cells).
const UPTAKE_SCALE: f64 = 1.0e6;

/// Conditions a growth step runs under.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GrowthConditions {
    /// Run-level growth multiplier
    pub run_multiplier: f64,
    pub temperature_c: f64,
    /// VM clock at the start of the step
    pub now_h: f64,
}

#[derive(Debug, Clone)]
pub struct GrowthEngine {
    growth: GrowthConfig,
    glucose_threshold_mm: f64,
    glutamine_threshold_mm: f64,
}

impl GrowthEngine {
    pub fn new(growth: GrowthConfig, death: &DeathConfig) -> Self {
        Self {
            growth,
            glucose_threshold_mm: death.glucose_threshold_mm,
            glutamine_threshold_mm: death.glutamine_threshold_mm,
        }
    }

    /// Depletes glucose and glutamine by viable-cell uptake over `dt`.
    pub fn consume_media(&self, vessel: &mut VesselState, line: &CellLineParams, dt: f64) {
        let millions = vessel.cell_count / UPTAKE_SCALE;
        let media = &mut vessel.media;
        media.glucose_mm = (media.glucose_mm - line.glucose_uptake_mm_per_h * millions * dt).max(0.0);
        media.glutamine_mm = (media.glutamine_mm - line.glutamine_uptake_mm_per_h * millions * dt).max(0.0);
    }

    /// Nutrient availability in [0, 1]; 1 while both are above threshold.
    pub fn nutrient_factor(&self, vessel: &VesselState) -> f64 {
        let ratio = |level: f64, threshold: f64| if threshold > 0.0 { level / threshold } else { 1.0 };
        ratio(vessel.media.glucose_mm, self.glucose_threshold_mm)
            .min(ratio(vessel.media.glutamine_mm, self.glutamine_threshold_mm))
            .clamp(0.0, 1.0)
    }

    /// Gaussian response around the optimal temperature.
    pub fn temperature_factor(&self, temperature_c: f64) -> f64 {
        let z = (temperature_c - self.growth.optimal_temperature_c) / self.growth.temperature_tolerance_c;
        (-z * z).exp()
    }

    /// Multiplicative viable-count growth factor for one step.
    pub fn growth_factor(&self, vessel: &VesselState, line: &CellLineParams, conditions: &GrowthConditions, dt: f64) -> f64 {
        let age = vessel.age_h(conditions.now_h);
        let rate = std::f64::consts::LN_2 / line.doubling_time_h
            * conditions.run_multiplier
            * self.nutrient_factor(vessel)
            * vessel.plating.growth_recovery(age)
            * (1.0 - self.growth.stress_growth_penalty * vessel.latent.max_axis()).max(0.0)
            * self.temperature_factor(conditions.temperature_c);
        let room = (1.0 - vessel.confluence()).max(0.0);
        (rate * room * dt).exp()
    }

    /// Grows the viable count by `g` and dilutes every subpopulation.
    pub fn apply(&self, vessel: &mut VesselState, g: f64) {
        if g <= 1.0 {
            return;
        }
        for sp in vessel.subpopulations.iter_mut() {
            let denominator = sp.viability * g + 1.0 - sp.viability;
            sp.viability = sp.viability * g / denominator;
            sp.ledger.scale(1.0 / denominator);
        }
        vessel.cell_count *= g;
        vessel.recompute_from_subpopulations();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::ParameterTables;
    use crate::plating::PlatingContext;
    use crate::vessel::{DeathCause, MediaState};
    use approx::assert_relative_eq;

    fn setup() -> (VesselState, CellLineParams, GrowthEngine) {
        let tables = ParameterTables::default();
        let line = tables.cell_line("A549").unwrap().clone();
        let vessel = VesselState::seeded(
            "A1",
            "A549",
            &line,
            1.0e6,
            1.0e7,
            MediaState { glucose_mm: 25.0, glutamine_mm: 4.0 },
            PlatingContext::clean(),
            0.0,
        );
        (vessel, line, GrowthEngine::new(GrowthConfig::default(), &DeathConfig::default()))
    }

    fn optimal() -> GrowthConditions {
        GrowthConditions { run_multiplier: 1.0, temperature_c: 37.0, now_h: 0.0 }
    }

    #[test]
    fn test_dilution_preserves_ledger_identity() {
        let (mut vessel, _, engine) = setup();
        vessel.subpopulations[0].kill(0.4, DeathCause::ErStress);
        vessel.recompute_from_subpopulations();

        engine.apply(&mut vessel, 1.5);
        assert!(vessel.check_conservation(1e-12).is_ok());
        assert!(vessel.viability > 0.9);
    }

    #[test]
    fn test_unstressed_growth_rate() {
        let (vessel, line, engine) = setup();
        let g = engine.growth_factor(&vessel, &line, &optimal(), 1.0);
        let expected = (std::f64::consts::LN_2 / 22.0 * (1.0 - vessel.confluence())).exp();
        assert_relative_eq!(g, expected, epsilon = 1e-12);
    }

    #[test]
    fn test_temperature_slows_growth() {
        let (vessel, line, engine) = setup();
        let cold = GrowthConditions { temperature_c: 30.0, ..optimal() };
        assert!(engine.growth_factor(&vessel, &line, &cold, 1.0) < engine.growth_factor(&vessel, &line, &optimal(), 1.0));
        assert_relative_eq!(engine.temperature_factor(37.0), 1.0);
    }

    #[test]
    fn test_media_consumption() {
        let (mut vessel, line, engine) = setup();
        engine.consume_media(&mut vessel, &line, 10.0);
        // 0.98e6 viable cells at 0.1 mM/h per 1e6
        assert_relative_eq!(vessel.media.glucose_mm, 25.0 - 0.98, epsilon = 1e-9);
        engine.consume_media(&mut vessel, &line, 1.0e4);
        assert_eq!(vessel.media.glucose_mm, 0.0);
        assert_eq!(engine.nutrient_factor(&vessel), 0.0);
    }
}
