//! Timing-only backend: vessel identities and a clock, no biology.

use crate::error::VmError;
use crate::hardware::Hardware;
use crate::types::{AssayKind, OperationResult};
use std::collections::BTreeSet;

/// Nominal hands-on durations (hours) for each operation.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationDurations {
    pub seed_h: f64,
    pub treat_h: f64,
    pub passage_h: f64,
    pub washout_h: f64,
    pub feed_h: f64,
    pub imaging_h: f64,
    pub plate_read_h: f64,
    pub molecular_h: f64,
}

impl Default for OperationDurations {
    fn default() -> Self {
        Self {
            seed_h: 0.5,
            treat_h: 0.1,
            passage_h: 0.75,
            washout_h: 0.25,
            feed_h: 0.2,
            imaging_h: 0.5,
            plate_read_h: 0.1,
            molecular_h: 3.0,
        }
    }
}

impl OperationDurations {
    /// Returns the nominal duration of an assay.
    pub fn assay_h(&self, assay: AssayKind) -> f64 {
        match assay {
            AssayKind::CellPainting | AssayKind::FlowCytometry => self.imaging_h,
            AssayKind::AtpViability | AssayKind::CellCount => self.plate_read_h,
            AssayKind::Qpcr(_) | AssayKind::Elisa(_) | AssayKind::WesternBlot(_) => self.molecular_h,
        }
    }
}

/// Pure-timing backend.
///
/// Enforces the same identity rules as the biological engine (duplicate and
/// unknown vessels are errors) and accumulates wall-clock cost, which makes
/// it useful for dry-running a protocol before paying for a full simulation.
pub struct TimingHardware {
    /// Known vessel ids
    vessels: BTreeSet<String>,

    /// Incubation clock (hours)
    clock_h: f64,

    /// Sum of hands-on operation costs (hours)
    hands_on_h: f64,

    /// Nominal durations
    durations: OperationDurations,
}

impl TimingHardware {
    /// Creates a new timing backend with default durations.
    pub fn new() -> Self {
        Self::with_durations(OperationDurations::default())
    }

    /// Creates a timing backend with custom durations.
    pub fn with_durations(durations: OperationDurations) -> Self {
        Self {
            vessels: BTreeSet::new(),
            clock_h: 0.0,
            hands_on_h: 0.0,
            durations,
        }
    }

    /// Total hands-on time booked so far (hours).
    pub fn hands_on_h(&self) -> f64 {
        self.hands_on_h
    }

    /// Number of live vessels.
    pub fn vessel_count(&self) -> usize {
        self.vessels.len()
    }

    fn require(&self, vessel_id: &str) -> Result<(), VmError> {
        if self.vessels.contains(vessel_id) {
            Ok(())
        } else {
            Err(VmError::unknown_vessel(vessel_id))
        }
    }

    fn book(&mut self, operation: &str, vessel_id: Option<&str>, cost_h: f64) -> OperationResult {
        self.hands_on_h += cost_h;
        OperationResult::new(operation, vessel_id, cost_h, self.clock_h)
    }
}

impl Default for TimingHardware {
    fn default() -> Self {
        Self::new()
    }
}

impl Hardware for TimingHardware {
    fn name(&self) -> &str {
        "timing"
    }

    fn now_h(&self) -> f64 {
        self.clock_h
    }

    fn seed(&self) -> u64 {
        // Timing backend draws no randomness
        0
    }

    fn seed_vessel(
        &mut self,
        vessel_id: &str,
        _cell_line: &str,
        initial_count: f64,
        capacity: f64,
    ) -> Result<OperationResult, VmError> {
        if !(initial_count >= 0.0) || !(capacity > 0.0) {
            return Err(VmError::invalid(format!(
                "initial_count {} / capacity {} out of range",
                initial_count, capacity
            )));
        }
        if !self.vessels.insert(vessel_id.to_string()) {
            return Err(VmError::duplicate_vessel(vessel_id));
        }
        let cost = self.durations.seed_h;
        Ok(self.book("seed_vessel", Some(vessel_id), cost))
    }

    fn treat_with_compound(
        &mut self,
        vessel_id: &str,
        _compound_id: &str,
        dose_um: f64,
    ) -> Result<OperationResult, VmError> {
        self.require(vessel_id)?;
        if !(dose_um >= 0.0) || !dose_um.is_finite() {
            return Err(VmError::invalid(format!("dose {} uM out of range", dose_um)));
        }
        let cost = self.durations.treat_h;
        Ok(self.book("treat_with_compound", Some(vessel_id), cost))
    }

    fn advance_time(&mut self, hours: f64) -> Result<OperationResult, VmError> {
        if !(hours >= 0.0) || !hours.is_finite() {
            return Err(VmError::invalid(format!("hours {} out of range", hours)));
        }
        self.clock_h += hours;
        Ok(OperationResult::new("advance_time", None, hours, self.clock_h))
    }

    fn incubate(&mut self, duration_seconds: f64, _temperature_c: f64) -> Result<OperationResult, VmError> {
        let mut result = self.advance_time(duration_seconds / 3600.0)?;
        result.operation = "incubate".to_string();
        Ok(result)
    }

    fn passage_cells(
        &mut self,
        source_vessel_id: &str,
        target_vessel_id: &str,
        split_ratio: f64,
    ) -> Result<OperationResult, VmError> {
        self.require(source_vessel_id)?;
        if !(split_ratio >= 1.0) || !split_ratio.is_finite() {
            return Err(VmError::invalid(format!("split_ratio {} must be >= 1", split_ratio)));
        }
        if source_vessel_id != target_vessel_id {
            self.vessels.remove(source_vessel_id);
            self.vessels.insert(target_vessel_id.to_string());
        }
        let cost = self.durations.passage_h;
        Ok(self.book("passage_cells", Some(target_vessel_id), cost))
    }

    fn washout_compound(&mut self, vessel_id: &str) -> Result<OperationResult, VmError> {
        self.require(vessel_id)?;
        let cost = self.durations.washout_h;
        Ok(self.book("washout_compound", Some(vessel_id), cost))
    }

    fn feed_vessel(&mut self, vessel_id: &str) -> Result<OperationResult, VmError> {
        self.require(vessel_id)?;
        let cost = self.durations.feed_h;
        Ok(self.book("feed_vessel", Some(vessel_id), cost))
    }

    fn run_assay(&mut self, vessel_id: &str, assay: AssayKind) -> Result<OperationResult, VmError> {
        self.require(vessel_id)?;
        let cost = self.durations.assay_h(assay);
        Ok(self.book(&format!("assay:{}", assay.name()), Some(vessel_id), cost))
    }
}
