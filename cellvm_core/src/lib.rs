//! CellVM Core - Stochastic Biological Virtual Machine
//!
//! Simulates cultured-cell vessels under compound perturbation. The biology
//! is hidden; callers see it only through noisy, confounded assays:
//! 1. **Latent stress**: ER stress, mitochondrial and transport dysfunction
//!    per subpopulation, with exact first-order induction/decay
//! 2. **Competing-risk death**: hazards split realized death into a named
//!    ledger that always sums to `1 - viability`
//! 3. **Confounded observation**: run-level drift, plating artifacts and
//!    per-batch pipeline failures layered on top of structural readouts
//!
//! The [`BiologicalVirtualMachine`] façade implements [`cellvm_env::Hardware`].

pub mod cellvm_assay;
pub mod cellvm_death;
pub mod cellvm_latent;
pub mod channels;
pub mod config;
pub mod growth;
pub mod handling;
pub mod params;
pub mod pipeline;
pub mod plating;
pub mod run_context;
pub mod streams;
pub mod validation;
pub mod vessel;
pub mod vm;

// Re-export key types for convenience
pub use cellvm_assay::{AssayOptions, AssayResult};
pub use cellvm_death::DeathEngine;
pub use cellvm_latent::LatentEngine;
pub use config::{HandlingRisk, VmConfig};
pub use params::{CellLineParams, CompoundParams, ParameterTables, StressAxis};
pub use pipeline::FailureMode;
pub use run_context::RunContext;
pub use streams::{Purpose, StreamProvider};
pub use vessel::{DeathCause, Subpopulation, VesselState};
pub use vm::BiologicalVirtualMachine;
