//! Linear protocol replay.
//!
//! A protocol is a JSON list of operations. It is executed against any
//! [`Hardware`] backend, so the same file can be dry-run on
//! [`cellvm_env::TimingHardware`] and then simulated on the biological VM.
//!
//! ```json
//! {
//!   "name": "er_dose",
//!   "steps": [
//!     { "op": "seed", "vessel_id": "P1_A01", "cell_line": "A549", "initial_count": 1e6, "capacity": 1e7 },
//!     { "op": "treat", "vessel_id": "P1_A01", "compound_id": "tunicamycin", "dose_um": 0.5 },
//!     { "op": "advance", "hours": 24 },
//!     { "op": "assay", "vessel_id": "P1_A01", "assay": { "assay": "qpcr", "marker": "upr" } }
//!   ]
//! }
//! ```

use crate::error::HarnessError;
use cellvm_env::{AssayKind, Hardware, OperationResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

/// One protocol operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ProtocolStep {
    Seed {
        vessel_id: String,
        cell_line: String,
        initial_count: f64,
        capacity: f64,
    },
    Treat {
        vessel_id: String,
        compound_id: String,
        dose_um: f64,
    },
    Advance {
        hours: f64,
    },
    Incubate {
        duration_seconds: f64,
        temperature_c: f64,
    },
    Passage {
        source: String,
        target: String,
        split_ratio: f64,
    },
    Washout {
        vessel_id: String,
    },
    Feed {
        vessel_id: String,
    },
    Assay {
        vessel_id: String,
        assay: AssayKind,
    },
}

impl ProtocolStep {
    /// Dispatches the step to a backend.
    pub fn execute<H: Hardware>(&self, hw: &mut H) -> Result<OperationResult, cellvm_env::VmError> {
        match self {
            ProtocolStep::Seed { vessel_id, cell_line, initial_count, capacity } => {
                hw.seed_vessel(vessel_id, cell_line, *initial_count, *capacity)
            }
            ProtocolStep::Treat { vessel_id, compound_id, dose_um } => {
                hw.treat_with_compound(vessel_id, compound_id, *dose_um)
            }
            ProtocolStep::Advance { hours } => hw.advance_time(*hours),
            ProtocolStep::Incubate { duration_seconds, temperature_c } => {
                hw.incubate(*duration_seconds, *temperature_c)
            }
            ProtocolStep::Passage { source, target, split_ratio } => hw.passage_cells(source, target, *split_ratio),
            ProtocolStep::Washout { vessel_id } => hw.washout_compound(vessel_id),
            ProtocolStep::Feed { vessel_id } => hw.feed_vessel(vessel_id),
            ProtocolStep::Assay { vessel_id, assay } => hw.run_assay(vessel_id, *assay),
        }
    }
}

/// A named, ordered list of steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Protocol {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub steps: Vec<ProtocolStep>,
}

/// Records produced by a protocol run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProtocolRun {
    pub records: Vec<OperationResult>,
    /// Sum of per-operation time costs (hours)
    pub total_time_cost_h: f64,
    /// Backend clock after the last step
    pub final_clock_h: f64,
}

impl ProtocolRun {
    /// Number of records that carried events.
    pub fn event_count(&self) -> usize {
        self.records.iter().map(|r| r.events.len()).sum()
    }
}

impl Protocol {
    pub fn from_json_str(json: &str) -> Result<Self, HarnessError> {
        let protocol: Self = serde_json::from_str(json)?;
        if protocol.steps.is_empty() {
            return Err(HarnessError::Protocol(format!("protocol '{}' has no steps", protocol.name)));
        }
        Ok(protocol)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, HarnessError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| HarnessError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&json)
    }

    /// Runs every step in order. Stops at the first error.
    pub fn run<H: Hardware>(&self, hw: &mut H) -> Result<ProtocolRun, HarnessError> {
        self.run_observed(hw, |_, _, _| {})
    }

    /// Like [`Protocol::run`], calling `observe` after each completed step.
    pub fn run_observed<H, F>(&self, hw: &mut H, mut observe: F) -> Result<ProtocolRun, HarnessError>
    where
        H: Hardware,
        F: FnMut(usize, &OperationResult, &H),
    {
        let mut run = ProtocolRun::default();
        for (index, step) in self.steps.iter().enumerate() {
            let record = step.execute(hw).map_err(|source| HarnessError::Step { index, source })?;
            debug!("[{}] step {} {} t={:.2}h", hw.name(), index, record.operation, record.clock_h);
            observe(index, &record, hw);
            run.total_time_cost_h += record.time_cost_h;
            run.records.push(record);
        }
        run.final_clock_h = hw.now_h();
        Ok(run)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use cellvm_core::BiologicalVirtualMachine;
    use cellvm_env::{Marker, TimingHardware, VmError};

    const ER_DOSE: &str = r#"{
        "name": "er_dose",
        "steps": [
            { "op": "seed", "vessel_id": "P1_A01", "cell_line": "A549", "initial_count": 1e6, "capacity": 1e7 },
            { "op": "treat", "vessel_id": "P1_A01", "compound_id": "tunicamycin", "dose_um": 0.5 },
            { "op": "advance", "hours": 24 },
            { "op": "washout", "vessel_id": "P1_A01" },
            { "op": "incubate", "duration_seconds": 7200, "temperature_c": 37.0 },
            { "op": "assay", "vessel_id": "P1_A01", "assay": { "assay": "qpcr", "marker": "upr" } },
            { "op": "assay", "vessel_id": "P1_A01", "assay": { "assay": "cell_painting" } }
        ]
    }"#;

    #[test]
    fn test_parse_protocol() {
        let protocol = Protocol::from_json_str(ER_DOSE).unwrap();
        assert_eq!(protocol.steps.len(), 7);
        assert_eq!(
            protocol.steps[5],
            ProtocolStep::Assay { vessel_id: "P1_A01".into(), assay: AssayKind::Qpcr(Marker::Upr) }
        );
    }

    #[test]
    fn test_empty_protocol_rejected() {
        let err = Protocol::from_json_str(r#"{ "name": "nothing", "steps": [] }"#).unwrap_err();
        assert!(matches!(err, HarnessError::Protocol(_)));
        assert!(matches!(Protocol::from_json_str("{"), Err(HarnessError::Json(_))));
    }

    #[test]
    fn test_dry_run_on_timing_backend() {
        let protocol = Protocol::from_json_str(ER_DOSE).unwrap();
        let mut hw = TimingHardware::new();
        let run = protocol.run(&mut hw).unwrap();

        assert_eq!(run.records.len(), 7);
        assert_relative_eq!(run.final_clock_h, 26.0, epsilon = 1e-12);
    }

    #[test]
    fn test_same_protocol_on_vm() {
        let protocol = Protocol::from_json_str(ER_DOSE).unwrap();
        let mut vm = BiologicalVirtualMachine::with_seed(42).unwrap();

        let mut observed = Vec::new();
        let run = protocol
            .run_observed(&mut vm, |index, record, _| observed.push((index, record.operation.clone())))
            .unwrap();

        assert_eq!(observed.len(), 7);
        assert_eq!(observed[6].1, "assay:cell_painting");
        assert_relative_eq!(run.final_clock_h, 26.0, epsilon = 1e-12);
        assert!(run.records[5].readout("fold_change").unwrap() > 1.0);
    }

    #[test]
    fn test_step_error_carries_index() {
        let json = r#"{
            "name": "bad",
            "steps": [
                { "op": "seed", "vessel_id": "A1", "cell_line": "A549", "initial_count": 1e6, "capacity": 1e7 },
                { "op": "feed", "vessel_id": "B2" }
            ]
        }"#;
        let protocol = Protocol::from_json_str(json).unwrap();
        let err = protocol.run(&mut TimingHardware::new()).unwrap_err();
        match err {
            HarnessError::Step { index, source } => {
                assert_eq!(index, 1);
                assert_eq!(source, VmError::unknown_vessel("B2"));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }
}
