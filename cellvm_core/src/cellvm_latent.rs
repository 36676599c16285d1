//! The "LATENT" Engine - Multi-Axis Stress Induction and Recovery
//!
//! Each subpopulation carries three orthogonal stress axes. A compound drives
//! exactly the axis it targets:
//!
//! ```text
//! dS/dt = k_on * f(dose) * (1 - S) - k_off * S
//! f(dose) = dose / (dose + IC50_shifted) * potency
//! ```
//!
//! The drive is constant within a step, so each step uses the exact
//! exponential solution instead of an Euler update. Axes above their
//! (subpopulation-shifted) threshold propose a death hazard; applying it is
//! the death engine's job.

use crate::config::{AxisKinetics, LatentKinetics};
use crate::params::{CompoundParams, ParameterTables, StressAxis, SubpopulationSpec};
use crate::vessel::{DeathCause, LatentState, SubpopState, VesselState};
use cellvm_env::VmError;

/// Drive `f(dose)` summed per axis, for one subpopulation.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AxisDrive {
    pub er_stress: f64,
    pub mito_dysfunction: f64,
    pub transport_dysfunction: f64,
}

impl AxisDrive {
    fn add(&mut self, axis: StressAxis, f: f64) {
        match axis {
            StressAxis::ErStress => self.er_stress += f,
            StressAxis::Mitochondrial => self.mito_dysfunction += f,
            StressAxis::Microtubule => self.transport_dysfunction += f,
            StressAxis::None => {}
        }
    }

    fn raise(&mut self, axis: StressAxis, ceiling: f64) {
        match axis {
            StressAxis::ErStress => self.er_stress = self.er_stress.max(ceiling),
            StressAxis::Mitochondrial => self.mito_dysfunction = self.mito_dysfunction.max(ceiling),
            StressAxis::Microtubule => self.transport_dysfunction = self.transport_dysfunction.max(ceiling),
            StressAxis::None => {}
        }
    }

    fn cap(&mut self, ceiling: &AxisDrive) {
        self.er_stress = self.er_stress.min(ceiling.er_stress);
        self.mito_dysfunction = self.mito_dysfunction.min(ceiling.mito_dysfunction);
        self.transport_dysfunction = self.transport_dysfunction.min(ceiling.transport_dysfunction);
    }
}

/// IC50 seen by one subpopulation in this run.
pub fn ic50_shifted(compound: &CompoundParams, cell_line: &str, spec: &SubpopulationSpec, ec50_multiplier: f64) -> f64 {
    compound.ic50_for(cell_line) * spec.ic50_shift * ec50_multiplier
}

/// Hill-type (n = 1) dose response scaled by potency.
pub fn dose_response(dose_um: f64, ic50_um: f64, potency: f64) -> f64 {
    if dose_um <= 0.0 {
        return 0.0;
    }
    dose_um / (dose_um + ic50_um) * potency
}

/// Per-subpopulation axis drives from every active exposure.
///
/// Each exposure holds the cumulative dose of one compound. Compounds sharing
/// an axis add, capped at the largest potency among them.
pub fn axis_drives(
    vessel: &VesselState,
    tables: &ParameterTables,
    ec50_multiplier: f64,
) -> Result<[AxisDrive; 3], VmError> {
    let mut drives = [AxisDrive::default(); 3];
    let mut ceiling = AxisDrive::default();
    for exposure in &vessel.exposures {
        let compound = tables.compound(&exposure.compound_id)?;
        ceiling.raise(compound.stress_axis, compound.potency_scalar);
        for (drive, sp) in drives.iter_mut().zip(vessel.subpopulations.iter()) {
            let ic50 = ic50_shifted(compound, &vessel.cell_line, &sp.spec, ec50_multiplier);
            drive.add(compound.stress_axis, dose_response(exposure.dose_um, ic50, compound.potency_scalar));
        }
    }
    for drive in drives.iter_mut() {
        drive.cap(&ceiling);
    }
    Ok(drives)
}

/// Exact solution of the induction/decay ODE over `dt` with constant drive.
pub fn advance_axis(s: f64, drive: f64, kinetics: &AxisKinetics, stress_sensitivity: f64, dt: f64) -> f64 {
    let a = kinetics.k_on * drive * stress_sensitivity;
    let b = kinetics.k_off;
    let rate = a + b;
    if rate <= 0.0 {
        return s.clamp(0.0, 1.0);
    }
    let steady = a / rate;
    (steady + (s - steady) * (-rate * dt).exp()).clamp(0.0, 1.0)
}

/// Death hazard proposed by one axis: `h_max * sigmoid((S - theta) / width)`
/// above the shifted threshold, zero at and below it.
pub fn axis_hazard(s: f64, kinetics: &AxisKinetics, threshold_shift: f64) -> f64 {
    let theta = kinetics.theta * threshold_shift;
    if s <= theta {
        return 0.0;
    }
    kinetics.h_max / (1.0 + (-(s - theta) / kinetics.width).exp())
}

/// Latent dynamics for every subpopulation of a vessel.
#[derive(Debug, Clone)]
pub struct LatentEngine {
    kinetics: LatentKinetics,
}

impl LatentEngine {
    pub fn new(kinetics: LatentKinetics) -> Self {
        Self { kinetics }
    }

    pub fn kinetics(&self) -> &LatentKinetics {
        &self.kinetics
    }

    /// Advances each subpopulation's axes by `dt` hours.
    pub fn step(&self, vessel: &mut VesselState, drives: &[AxisDrive; 3], stress_sensitivity: f64, dt: f64) {
        for (sp, drive) in vessel.subpopulations.iter_mut().zip(drives.iter()) {
            let k = &self.kinetics;
            sp.latent = LatentState {
                er_stress: advance_axis(sp.latent.er_stress, drive.er_stress, &k.er_stress, stress_sensitivity, dt),
                mito_dysfunction: advance_axis(
                    sp.latent.mito_dysfunction,
                    drive.mito_dysfunction,
                    &k.mito_dysfunction,
                    stress_sensitivity,
                    dt,
                ),
                transport_dysfunction: advance_axis(
                    sp.latent.transport_dysfunction,
                    drive.transport_dysfunction,
                    &k.transport_dysfunction,
                    stress_sensitivity,
                    dt,
                ),
            };
        }
    }

    /// Hazards proposed by one subpopulation's axes.
    pub fn hazards(&self, sp: &SubpopState) -> [(DeathCause, f64); 3] {
        let shift = sp.spec.stress_threshold_shift;
        [
            (DeathCause::ErStress, axis_hazard(sp.latent.er_stress, &self.kinetics.er_stress, shift)),
            (
                DeathCause::MitoDysfunction,
                axis_hazard(sp.latent.mito_dysfunction, &self.kinetics.mito_dysfunction, shift),
            ),
            (
                DeathCause::TransportDysfunction,
                axis_hazard(sp.latent.transport_dysfunction, &self.kinetics.transport_dysfunction, shift),
            ),
        ]
    }
}
