//! JSON trajectory exporter.
//!
//! Captures full vessel snapshots after each protocol step so a run can be
//! inspected or plotted offline.

use crate::error::HarnessError;
use cellvm_core::{BiologicalVirtualMachine, VesselState};
use cellvm_env::OperationResult;
use serde::Serialize;
use std::fs::File;
use std::io::Write;
use uuid::Uuid;

/// State of every vessel after one step.
#[derive(Debug, Clone, Serialize)]
pub struct TrajectoryFrame {
    pub step_index: usize,
    pub operation: String,
    /// VM clock after the step (hours)
    pub clock_h: f64,
    pub vessels: Vec<VesselState>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<String>,
    #[serde(skip_serializing_if = "std::collections::BTreeMap::is_empty")]
    pub readouts: std::collections::BTreeMap<String, f64>,
}

/// Complete trajectory export.
#[derive(Debug, Clone, Serialize)]
pub struct TrajectoryExport {
    /// Unique id of this export
    pub run_id: Uuid,

    /// Protocol name
    pub protocol: String,

    /// VM seed
    pub seed: u64,

    /// Run-context shifts [incubator, reagent_lot, instrument]
    pub run_shifts: [f64; 3],

    pub frames: Vec<TrajectoryFrame>,

    /// Clock at the last frame (hours)
    pub duration_h: f64,
}

impl TrajectoryExport {
    /// Creates an empty export bound to a VM's seed and run context.
    pub fn new(protocol: &str, vm: &BiologicalVirtualMachine) -> Self {
        let ctx = vm.run_context();
        Self {
            run_id: Uuid::new_v4(),
            protocol: protocol.to_string(),
            seed: ctx.seed,
            run_shifts: [ctx.incubator_shift, ctx.reagent_lot_shift, ctx.instrument_shift],
            frames: Vec::new(),
            duration_h: 0.0,
        }
    }

    /// Appends a frame built from the record and the VM's current vessels.
    pub fn capture(&mut self, step_index: usize, record: &OperationResult, vm: &BiologicalVirtualMachine) {
        let vessels = vm
            .vessel_ids()
            .iter()
            .filter_map(|id| vm.snapshot(id).ok())
            .collect();
        self.duration_h = record.clock_h;
        self.frames.push(TrajectoryFrame {
            step_index,
            operation: record.operation.clone(),
            clock_h: record.clock_h,
            vessels,
            events: record.events.clone(),
            readouts: record.readouts.clone(),
        });
    }

    /// Writes the export to a JSON file.
    pub fn write_to_file(&self, path: &str) -> Result<(), HarnessError> {
        let json = serde_json::to_string_pretty(self)?;
        let io_error = |source| HarnessError::Io { path: path.to_string(), source };
        let mut file = File::create(path).map_err(io_error)?;
        file.write_all(json.as_bytes()).map_err(io_error)?;
        Ok(())
    }
}
