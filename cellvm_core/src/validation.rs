//! Validation Module - Ground Truth Comparison for Assay Readouts
//! ===============================================================
//!
//! The VM knows what the assays cannot: the latent biology. This module
//! provides tools for checking observations against that ground truth.
//!
//! - `BiologySnapshot`: flattened biological state, used to prove an assay
//!   left the vessel untouched
//! - `ValidationSession`: accumulates (truth, observed) pairs per readout
//!   and reports relative error and correlation
//!
//! Usage:
//! ```ignore
//! use cellvm_core::validation::ValidationSession;
//!
//! let mut session = ValidationSession::new();
//! session.record_assay(&result);                 // measured vs structural
//! session.record("upr_vs_er", er_stress, upr);   // any custom pairing
//! let report = session.generate_report();
//! ```

use crate::cellvm_assay::AssayResult;
use crate::vessel::VesselState;
use std::collections::BTreeMap;

// =============================================================================
// BIOLOGY SNAPSHOT
// =============================================================================

/// Every biological quantity of a vessel, flattened in a fixed order.
#[derive(Debug, Clone, PartialEq)]
pub struct BiologySnapshot {
    values: Vec<f64>,
}

impl BiologySnapshot {
    pub fn capture(vessel: &VesselState) -> Self {
        let flag = |b: bool| if b { 1.0 } else { 0.0 };
        let plating = &vessel.plating;
        let mut values = vec![
            vessel.cell_count,
            vessel.capacity,
            vessel.viability,
            vessel.media.glucose_mm,
            vessel.media.glutamine_mm,
            vessel.clock.seed_time_h,
            vessel.clock.last_update_h,
            vessel.clock.last_feed_h,
            vessel.clock.last_washout_h.unwrap_or(-1.0),
            vessel.clock.passage_number as f64,
            plating.stress_half_life_h,
            plating.seeding_density_bias,
            plating.clumpiness,
            plating.stress_amplitude,
        ];
        values.extend(vessel.latent.as_array());
        values.extend(vessel.ledger.iter().map(|(_, x)| x));
        for sp in &vessel.subpopulations {
            values.extend([sp.spec.fraction, sp.spec.ic50_shift, sp.spec.stress_threshold_shift]);
            values.push(sp.viability);
            values.extend(sp.latent.as_array());
            values.extend(sp.ledger.iter().map(|(_, x)| x));
        }
        for exposure in &vessel.exposures {
            values.push(exposure.dose_um);
            values.push(exposure.time_since_dose_h);
            values.extend(exposure.lethal.iter().map(|l| flag(*l)));
            values.extend(exposure.commitment_delay_h.iter().map(|d| d.unwrap_or(-1.0)));
        }
        Self { values }
    }

    /// Largest absolute difference; infinite if the layouts differ.
    pub fn max_difference(&self, other: &BiologySnapshot) -> f64 {
        if self.values.len() != other.values.len() {
            return f64::INFINITY;
        }
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).abs())
            .fold(0.0, f64::max)
    }
}

// =============================================================================
// READOUT METRICS
// =============================================================================

/// Per-readout comparison statistics
#[derive(Debug, Clone, Default)]
pub struct ReadoutMetrics {
    /// Ground-truth values, in recording order
    pub truths: Vec<f64>,
    /// Observed values, in recording order
    pub observed: Vec<f64>,
    /// Sum of squared relative errors
    pub error_sum_squared: f64,
    /// Largest relative error seen
    pub max_error: f64,
}

impl ReadoutMetrics {
    pub fn samples(&self) -> usize {
        self.truths.len()
    }

    /// Root mean square relative error
    pub fn rmse(&self) -> f64 {
        if self.samples() > 0 {
            (self.error_sum_squared / self.samples() as f64).sqrt()
        } else {
            0.0
        }
    }

    /// Pearson correlation of observed against truth (0 if degenerate).
    pub fn correlation(&self) -> f64 {
        let n = self.samples() as f64;
        if n < 2.0 {
            return 0.0;
        }
        let mt = self.truths.iter().sum::<f64>() / n;
        let mo = self.observed.iter().sum::<f64>() / n;
        let mut cov = 0.0;
        let mut vt = 0.0;
        let mut vo = 0.0;
        for (t, o) in self.truths.iter().zip(self.observed.iter()) {
            cov += (t - mt) * (o - mo);
            vt += (t - mt).powi(2);
            vo += (o - mo).powi(2);
        }
        if vt <= 0.0 || vo <= 0.0 {
            0.0
        } else {
            cov / (vt.sqrt() * vo.sqrt())
        }
    }
}

// =============================================================================
// VALIDATION SESSION
// =============================================================================

/// Collects (truth, observed) pairs keyed by readout name
#[derive(Debug, Clone, Default)]
pub struct ValidationSession {
    per_readout: BTreeMap<String, ReadoutMetrics>,
    total_samples: usize,
}

impl ValidationSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one pair under `readout`.
    pub fn record(&mut self, readout: &str, truth: f64, observed: f64) {
        let error = if truth.abs() > 1e-12 {
            (observed - truth) / truth
        } else {
            observed - truth
        };
        let metrics = self.per_readout.entry(readout.to_string()).or_default();
        metrics.truths.push(truth);
        metrics.observed.push(observed);
        metrics.error_sum_squared += error * error;
        metrics.max_error = metrics.max_error.max(error.abs());
        self.total_samples += 1;
    }

    /// Records every readout present in both layers of an assay result.
    pub fn record_assay(&mut self, result: &AssayResult) {
        for (name, observed) in &result.measured {
            if let Some(truth) = result.structural.get(name) {
                let key = format!("{}.{}", result.assay.name(), name);
                self.record(&key, *truth, *observed);
            }
        }
    }

    pub fn generate_report(&self) -> ValidationReport {
        ValidationReport {
            per_readout: self.per_readout.clone(),
            total_samples: self.total_samples,
        }
    }
}

// =============================================================================
// VALIDATION REPORT
// =============================================================================

#[derive(Debug, Clone)]
pub struct ValidationReport {
    pub per_readout: BTreeMap<String, ReadoutMetrics>,
    pub total_samples: usize,
}

impl ValidationReport {
    /// Print formatted report to console
    pub fn print(&self) {
        println!();
        println!("╔══════════════════════════════════════════════════════════════╗");
        println!("║                 CELLVM VALIDATION REPORT                     ║");
        println!("╠══════════════════════════════════════════════════════════════╣");
        println!("║ Samples: {:>10}   Readouts: {:>6}                         ║",
            self.total_samples, self.per_readout.len());
        println!("╚══════════════════════════════════════════════════════════════╝");
        println!("  Readout                              N     RMSE    Max     r");
        println!("─────────────────────────────────────────────────────────────────");
        for (name, m) in &self.per_readout {
            println!("  {:<34} {:>5} {:>8.4} {:>7.4} {:>6.3}",
                name, m.samples(), m.rmse(), m.max_error, m.correlation());
        }
    }

    pub fn readout(&self, name: &str) -> Option<&ReadoutMetrics> {
        self.per_readout.get(name)
    }

    /// True if every readout's relative RMSE is within bound.
    pub fn passes_criteria(&self, max_rmse: f64) -> bool {
        self.per_readout.values().all(|m| m.rmse() <= max_rmse)
    }
}

// =============================================================================
// TESTS
// =============================================================================
