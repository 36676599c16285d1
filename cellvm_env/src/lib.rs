//! CellVM Hardware Abstraction Layer
//!
//! This crate provides the capability interface that lets callers drive
//! either the **biological engine** (`cellvm_core::BiologicalVirtualMachine`)
//! or a **timing-only** stand-in through the same operations.
//!
//! # Core Concept: One Capability, Sibling Backends
//!
//! Every backend implements [`Hardware`]:
//! - Vessel lifecycle (`seed_vessel()`, `passage_cells()`)
//! - Perturbation (`treat_with_compound()`, `washout_compound()`, `feed_vessel()`)
//! - Time (`advance_time()`, `incubate()`)
//! - Readout (`run_assay()`)
//!
//! Each call returns an [`OperationResult`] record or a typed [`VmError`].
//! Nothing is retried inside a backend.
//!
//! # Example
//!
//! ```ignore
//! use cellvm_env::{Hardware, AssayKind};
//!
//! fn dose_and_read<H: Hardware>(hw: &mut H) -> Result<f64, cellvm_env::VmError> {
//!     hw.seed_vessel("P1_A01", "A549", 1e6, 1e7)?;
//!     hw.treat_with_compound("P1_A01", "tunicamycin", 0.5)?;
//!     hw.advance_time(24.0)?;
//!     let atp = hw.run_assay("P1_A01", AssayKind::AtpViability)?;
//!     Ok(atp.readout("atp_luminescence").unwrap_or(0.0))
//! }
//! ```

mod error;
mod hardware;
mod timing_impl;
mod types;

pub use error::VmError;
pub use hardware::Hardware;
pub use timing_impl::{OperationDurations, TimingHardware};
pub use types::{AssayKind, Marker, OperationResult, OperationStatus};
