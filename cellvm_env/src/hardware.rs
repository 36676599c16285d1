//! Core capability trait for CellVM backends.

use crate::error::VmError;
use crate::types::{AssayKind, OperationResult};

/// The single interface every lab backend implements.
///
/// Callers (protocol replays, scenario harnesses, external executors) drive
/// a backend only through this trait, so the same step sequence can run
/// against the biological engine or against a timing-only stand-in.
///
/// # Implementations
///
/// - **Biology**: `BiologicalVirtualMachine` (in `cellvm_core`) - full
///   latent-stress / competing-risk simulation with noisy assays
/// - **Timing**: `TimingHardware` - tracks vessel identities and the
///   clock only, for protocol duration estimates
///
/// # Determinism
///
/// Backends are synchronous and single-threaded. Given the same seed and the
/// same call sequence, a backend must return identical records.
pub trait Hardware {
    /// Returns a short backend name (for logging).
    fn name(&self) -> &str;

    /// Returns the backend clock in hours since the run started.
    fn now_h(&self) -> f64;

    /// Returns the run seed (0 when the backend is not seeded).
    fn seed(&self) -> u64;

    /// Creates a vessel. Fails if `vessel_id` already exists.
    fn seed_vessel(
        &mut self,
        vessel_id: &str,
        cell_line: &str,
        initial_count: f64,
        capacity: f64,
    ) -> Result<OperationResult, VmError>;

    /// Adds a compound exposure to a vessel.
    fn treat_with_compound(
        &mut self,
        vessel_id: &str,
        compound_id: &str,
        dose_um: f64,
    ) -> Result<OperationResult, VmError>;

    /// Advances every vessel by `hours`.
    fn advance_time(&mut self, hours: f64) -> Result<OperationResult, VmError>;

    /// Advances every vessel by `duration_seconds` at `temperature_c`.
    fn incubate(&mut self, duration_seconds: f64, temperature_c: f64) -> Result<OperationResult, VmError>;

    /// Splits `source_vessel_id` into `target_vessel_id`.
    fn passage_cells(
        &mut self,
        source_vessel_id: &str,
        target_vessel_id: &str,
        split_ratio: f64,
    ) -> Result<OperationResult, VmError>;

    /// Removes all compound exposures from a vessel.
    fn washout_compound(&mut self, vessel_id: &str) -> Result<OperationResult, VmError>;

    /// Replaces the vessel's media.
    fn feed_vessel(&mut self, vessel_id: &str) -> Result<OperationResult, VmError>;

    /// Runs an assay. Must not change biological state.
    fn run_assay(&mut self, vessel_id: &str, assay: AssayKind) -> Result<OperationResult, VmError>;
}
