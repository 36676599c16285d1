//! CellVM Deterministic Simulation Harness
//!
//! This crate drives the biological virtual machine through fixed scenarios
//! and user-supplied protocols, and checks the properties the engine
//! promises: conservation of the death ledger, determinism per seed, axis
//! orthogonality and assay non-interference.
//!
//! # Core Principle: One Seed, One Trajectory
//!
//! Every source of variation in a run is derived from a single 64-bit seed:
//! - **Run context**: incubator, reagent-lot and instrument shifts
//! - **Biology**: plating, commitment delays, handling incidents
//! - **Measurement**: per-assay noise and per-batch pipeline drift
//!
//! The harness therefore never needs to mock anything. Rerunning a seed
//! reproduces every failure bit for bit.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      cellvm-sim (CLI)                       │
//! │   --scenario ...            --protocol file.json            │
//! │        │                          │                         │
//! │  ┌─────▼──────────┐      ┌────────▼────────┐                │
//! │  │ ScenarioRunner │      │    Protocol     │──► Trajectory  │
//! │  └─────┬──────────┘      └────────┬────────┘     Export     │
//! │        │                          │ H: Hardware             │
//! │        │             ┌────────────┴────────────┐            │
//! │  ┌─────▼─────────────▼──────┐     ┌────────────▼─────────┐  │
//! │  │ BiologicalVirtualMachine │     │    TimingHardware    │  │
//! │  │  latent · death · growth │     │   (--dry-run, clock  │  │
//! │  │  assays · pipeline drift │     │    and ids only)     │  │
//! │  └──────────────────────────┘     └──────────────────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use cellvm_sim::{ScenarioRunner, scenarios::ScenarioId};
//!
//! let result = ScenarioRunner::new(42).run(ScenarioId::ErStress);
//! assert!(result.passed);
//! ```

mod error;
mod exporter;
mod protocol;
mod runner;
pub mod scenarios;

pub use error::HarnessError;
pub use exporter::{TrajectoryExport, TrajectoryFrame};
pub use protocol::{Protocol, ProtocolRun, ProtocolStep};
pub use runner::{ScenarioMetrics, ScenarioResult, ScenarioRunner};
