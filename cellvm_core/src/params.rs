//! Static reference data: cell lines and compounds.
//!
//! The VM reads these tables at seed / treat time and never edits them.
//! Loading custom tables is the caller's job; `ParameterTables::default()`
//! carries a small built-in library that covers every stress axis.

use cellvm_env::VmError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Pathway a compound perturbs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StressAxis {
    ErStress,
    Mitochondrial,
    Microtubule,
    None,
}

/// Reference data for one compound.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompoundParams {
    /// Stress axis the compound drives
    pub stress_axis: StressAxis,

    /// Scales the latent induction drive `f(dose)`
    pub potency_scalar: f64,

    /// Scales direct attrition once a lethal exposure has committed
    pub toxicity_scalar: f64,

    /// Half-maximal concentration (uM) for the reference cell line
    pub ic50_um: f64,

    /// Per-cell-line IC50 overrides (uM)
    #[serde(default)]
    pub ic50_overrides_um: BTreeMap<String, f64>,

    /// Fraction killed at treatment by a saturating dose (membrane lysis)
    #[serde(default)]
    pub instant_kill_max: f64,
}

impl CompoundParams {
    /// Creates a compound with no overrides and no instant-kill component.
    pub fn new(stress_axis: StressAxis, ic50_um: f64, potency_scalar: f64, toxicity_scalar: f64) -> Self {
        Self {
            stress_axis,
            potency_scalar,
            toxicity_scalar,
            ic50_um,
            ic50_overrides_um: BTreeMap::new(),
            instant_kill_max: 0.0,
        }
    }

    /// Adds a per-cell-line IC50 override.
    pub fn with_override(mut self, cell_line: &str, ic50_um: f64) -> Self {
        self.ic50_overrides_um.insert(cell_line.to_string(), ic50_um);
        self
    }

    /// Sets the instant-kill component.
    pub fn with_instant_kill(mut self, fraction: f64) -> Self {
        self.instant_kill_max = fraction;
        self
    }

    /// Returns the IC50 (uM) for a cell line.
    pub fn ic50_for(&self, cell_line: &str) -> f64 {
        self.ic50_overrides_um
            .get(cell_line)
            .copied()
            .unwrap_or(self.ic50_um)
    }
}

/// Sensitivity parameters of one subpopulation bucket.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SubpopulationSpec {
    /// Share of the culture (all buckets sum to 1)
    pub fraction: f64,

    /// Multiplier on IC50 (<1 = more sensitive)
    pub ic50_shift: f64,

    /// Multiplier on every axis death threshold (<1 = dies earlier)
    pub stress_threshold_shift: f64,
}

/// Reference data for one cell line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellLineParams {
    /// Population doubling time in exponential phase (hours)
    pub doubling_time_h: f64,

    /// Glucose uptake (mM per hour per 10^6 viable cells)
    pub glucose_uptake_mm_per_h: f64,

    /// Glutamine uptake (mM per hour per 10^6 viable cells)
    pub glutamine_uptake_mm_per_h: f64,

    /// ATP luminescence per 10^6 healthy cells (RLU, arbitrary)
    pub atp_per_million_cells: f64,

    /// Unperturbed morphology intensity per channel [er, mito, nucleus, actin, rna]
    pub baseline_morphology: [f64; 5],

    /// Viability of freshly dissociated cells at seeding
    pub seeding_viability: f64,

    /// Subpopulation mixture [sensitive, typical, resistant]
    pub subpopulations: [SubpopulationSpec; 3],
}

impl CellLineParams {
    fn standard(doubling_time_h: f64, baseline_morphology: [f64; 5]) -> Self {
        Self {
            doubling_time_h,
            glucose_uptake_mm_per_h: 0.1,
            glutamine_uptake_mm_per_h: 0.01,
            atp_per_million_cells: 1.0e5,
            baseline_morphology,
            seeding_viability: 0.98,
            subpopulations: default_mixture(),
        }
    }

    /// True if the line effectively does not divide.
    pub fn is_quiescent(&self) -> bool {
        self.doubling_time_h > 1000.0
    }
}

/// Default 25/50/25 sensitive/typical/resistant mixture.
pub fn default_mixture() -> [SubpopulationSpec; 3] {
    [
        SubpopulationSpec { fraction: 0.25, ic50_shift: 0.5, stress_threshold_shift: 0.95 },
        SubpopulationSpec { fraction: 0.50, ic50_shift: 1.0, stress_threshold_shift: 1.0 },
        SubpopulationSpec { fraction: 0.25, ic50_shift: 2.0, stress_threshold_shift: 1.1 },
    ]
}

/// Cell-line and compound tables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterTables {
    pub cell_lines: BTreeMap<String, CellLineParams>,
    pub compounds: BTreeMap<String, CompoundParams>,
}

impl Default for ParameterTables {
    fn default() -> Self {
        let mut cell_lines = BTreeMap::new();
        cell_lines.insert("A549".to_string(), CellLineParams::standard(22.0, [1.0, 1.0, 1.0, 1.0, 1.0]));
        cell_lines.insert("HepG2".to_string(), CellLineParams {
            glucose_uptake_mm_per_h: 0.14,
            atp_per_million_cells: 1.4e5,
            ..CellLineParams::standard(48.0, [1.2, 1.3, 0.9, 0.8, 1.1])
        });
        cell_lines.insert("U2OS".to_string(), CellLineParams::standard(30.0, [0.9, 1.0, 1.1, 1.2, 0.9]));
        cell_lines.insert("iPSC_NGN2".to_string(), CellLineParams {
            glucose_uptake_mm_per_h: 0.05,
            glutamine_uptake_mm_per_h: 0.004,
            seeding_viability: 0.95,
            subpopulations: [
                SubpopulationSpec { fraction: 0.3, ic50_shift: 0.4, stress_threshold_shift: 0.85 },
                SubpopulationSpec { fraction: 0.5, ic50_shift: 1.0, stress_threshold_shift: 1.0 },
                SubpopulationSpec { fraction: 0.2, ic50_shift: 2.5, stress_threshold_shift: 1.1 },
            ],
            // Post-mitotic neurons
            ..CellLineParams::standard(1.0e4, [1.1, 1.4, 0.7, 1.3, 0.8])
        });

        let mut compounds = BTreeMap::new();
        compounds.insert(
            "tunicamycin".to_string(),
            CompoundParams::new(StressAxis::ErStress, 0.5, 1.0, 0.3).with_override("HepG2", 1.0),
        );
        compounds.insert("thapsigargin".to_string(), CompoundParams::new(StressAxis::ErStress, 0.05, 1.2, 0.4));
        compounds.insert(
            "cccp".to_string(),
            CompoundParams::new(StressAxis::Mitochondrial, 5.0, 1.0, 0.4).with_override("HepG2", 8.0),
        );
        compounds.insert("rotenone".to_string(), CompoundParams::new(StressAxis::Mitochondrial, 0.2, 0.9, 0.5));
        compounds.insert("oligomycin".to_string(), CompoundParams::new(StressAxis::Mitochondrial, 1.0, 0.8, 0.3));
        compounds.insert("nocodazole".to_string(), CompoundParams::new(StressAxis::Microtubule, 0.1, 1.0, 0.3));
        compounds.insert(
            "paclitaxel".to_string(),
            CompoundParams::new(StressAxis::Microtubule, 0.01, 1.0, 0.4).with_override("iPSC_NGN2", 0.05),
        );
        compounds.insert("staurosporine".to_string(), CompoundParams::new(StressAxis::None, 0.05, 1.0, 1.0));
        compounds.insert(
            "digitonin".to_string(),
            CompoundParams::new(StressAxis::None, 20.0, 1.0, 0.5).with_instant_kill(0.8),
        );
        compounds.insert("dmso".to_string(), CompoundParams::new(StressAxis::None, 1.0e6, 0.0, 0.0));

        Self { cell_lines, compounds }
    }
}

impl ParameterTables {
    /// Parses tables from JSON and validates them.
    pub fn from_json_str(json: &str) -> Result<Self, VmError> {
        let tables: Self = serde_json::from_str(json)
            .map_err(|e| VmError::config(format!("parameter tables: {}", e)))?;
        tables.validate()?;
        Ok(tables)
    }

    /// Loads tables from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, VmError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| VmError::config(format!("{}: {}", path.display(), e)))?;
        Self::from_json_str(&json)
    }

    /// Looks up a cell line.
    pub fn cell_line(&self, name: &str) -> Result<&CellLineParams, VmError> {
        self.cell_lines
            .get(name)
            .ok_or_else(|| VmError::invalid(format!("unknown cell line '{}'", name)))
    }

    /// Looks up a compound.
    pub fn compound(&self, id: &str) -> Result<&CompoundParams, VmError> {
        self.compounds
            .get(id)
            .ok_or_else(|| VmError::invalid(format!("unknown compound '{}'", id)))
    }

    /// Checks every entry for values the engines cannot work with.
    pub fn validate(&self) -> Result<(), VmError> {
        for (name, line) in &self.cell_lines {
            validate_mixture(name, &line.subpopulations)?;
            if !(line.doubling_time_h > 0.0) {
                return Err(VmError::invalid(format!("{}: doubling_time_h must be > 0", name)));
            }
            if !(0.0..=1.0).contains(&line.seeding_viability) {
                return Err(VmError::invalid(format!("{}: seeding_viability outside [0, 1]", name)));
            }
            if line.glucose_uptake_mm_per_h < 0.0 || line.glutamine_uptake_mm_per_h < 0.0 {
                return Err(VmError::invalid(format!("{}: negative uptake rate", name)));
            }
        }
        for (id, compound) in &self.compounds {
            let ic50s = std::iter::once(compound.ic50_um).chain(compound.ic50_overrides_um.values().copied());
            for ic50 in ic50s {
                if !(ic50 > 0.0) {
                    return Err(VmError::invalid(format!("{}: ic50 must be > 0", id)));
                }
            }
            if compound.potency_scalar < 0.0 || compound.toxicity_scalar < 0.0 {
                return Err(VmError::invalid(format!("{}: negative potency/toxicity", id)));
            }
            if !(0.0..=1.0).contains(&compound.instant_kill_max) {
                return Err(VmError::invalid(format!("{}: instant_kill_max outside [0, 1]", id)));
            }
        }
        Ok(())
    }
}

/// Rejects mixtures whose fractions do not form a partition.
pub fn validate_mixture(name: &str, mixture: &[SubpopulationSpec; 3]) -> Result<(), VmError> {
    let total: f64 = mixture.iter().map(|s| s.fraction).sum();
    if (total - 1.0).abs() > 1e-9 {
        return Err(VmError::invalid(format!(
            "{}: subpopulation fractions sum to {} (expected 1)",
            name, total
        )));
    }
    for spec in mixture {
        if spec.fraction < 0.0 || !(spec.ic50_shift > 0.0) || !(spec.stress_threshold_shift > 0.0) {
            return Err(VmError::invalid(format!("{}: malformed subpopulation {:?}", name, spec)));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_tables_validate() {
        let tables = ParameterTables::default();
        assert!(tables.validate().is_ok());
        assert!(tables.cell_line("A549").is_ok());
        assert!(tables.compound("tunicamycin").is_ok());
    }

    #[test]
    fn test_ic50_override() {
        let tables = ParameterTables::default();
        let tm = tables.compound("tunicamycin").unwrap();
        assert_eq!(tm.ic50_for("A549"), 0.5);
        assert_eq!(tm.ic50_for("HepG2"), 1.0);
    }

    #[test]
    fn test_bad_mixture_rejected() {
        let mut mixture = default_mixture();
        mixture[0].fraction = 0.5;
        let err = validate_mixture("X", &mixture).unwrap_err();
        assert!(matches!(err, VmError::InvalidParameter(_)));
    }

    #[test]
    fn test_unknown_lookup() {
        let tables = ParameterTables::default();
        assert!(matches!(tables.compound("unobtainium"), Err(VmError::InvalidParameter(_))));
        assert!(matches!(tables.cell_line("HeLa-X"), Err(VmError::InvalidParameter(_))));
    }

    #[test]
    fn test_json_roundtrip_validates() {
        let tables = ParameterTables::default();
        let json = serde_json::to_string(&tables).unwrap();
        let parsed = ParameterTables::from_json_str(&json).unwrap();
        assert_eq!(parsed, tables);

        let broken = json.replace("\"fraction\":0.25", "\"fraction\":0.35");
        assert!(ParameterTables::from_json_str(&broken).is_err());
    }

    #[test]
    fn test_malformed_json_is_config_error() {
        let err = ParameterTables::from_json_str("{ not json").unwrap_err();
        assert!(matches!(err, VmError::Config(_)));
    }
}
