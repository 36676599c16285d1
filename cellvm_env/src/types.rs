//! Common types shared by every hardware backend.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

/// Scalar biomarkers read by the molecular assays (qPCR / ELISA / Western).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Marker {
    /// Unfolded-protein-response reporter (CHOP/DDIT3); follows chronic ER stress.
    Upr,
    /// Mitochondrial membrane potential (TMRM-like); falls with mito dysfunction.
    MitoPotential,
    /// Microtubule transport index (acetylated tubulin); follows transport dysfunction.
    Transport,
    /// Lactate dehydrogenase release; follows cumulative death.
    LdhRelease,
}

impl Marker {
    /// Returns all markers.
    pub fn all() -> [Marker; 4] {
        [Marker::Upr, Marker::MitoPotential, Marker::Transport, Marker::LdhRelease]
    }

    /// Returns the marker name.
    pub fn name(&self) -> &'static str {
        match self {
            Marker::Upr => "upr",
            Marker::MitoPotential => "mito_potential",
            Marker::Transport => "transport",
            Marker::LdhRelease => "ldh_release",
        }
    }
}

impl FromStr for Marker {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "upr" | "chop" | "ddit3" => Ok(Marker::Upr),
            "mito_potential" | "tmrm" => Ok(Marker::MitoPotential),
            "transport" | "acetyl_tubulin" => Ok(Marker::Transport),
            "ldh_release" | "ldh" => Ok(Marker::LdhRelease),
            _ => Err(format!("Unknown marker: {}", s)),
        }
    }
}

/// The assays a backend can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "assay", content = "marker", rename_all = "snake_case")]
pub enum AssayKind {
    CellPainting,
    AtpViability,
    FlowCytometry,
    CellCount,
    Qpcr(Marker),
    Elisa(Marker),
    WesternBlot(Marker),
}

impl AssayKind {
    /// Returns the assay name (without marker).
    pub fn name(&self) -> &'static str {
        match self {
            AssayKind::CellPainting => "cell_painting",
            AssayKind::AtpViability => "atp_viability",
            AssayKind::FlowCytometry => "flow_cytometry",
            AssayKind::CellCount => "cell_count",
            AssayKind::Qpcr(_) => "qpcr",
            AssayKind::Elisa(_) => "elisa",
            AssayKind::WesternBlot(_) => "western_blot",
        }
    }
}

/// Outcome class of a completed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    /// Completed as requested
    Success,
    /// Completed, but a nuisance event fired (contamination, pipeline failure, ...)
    CompletedWithEvents,
}

/// Structured record returned by every `Hardware` operation.
///
/// This is the contract toward workflow executors: status, the wall-clock
/// cost of the step, numeric readouts, and any events worth logging.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationResult {
    /// Operation name (e.g. "seed_vessel", "assay:cell_painting")
    pub operation: String,

    /// Vessel the operation targeted, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vessel_id: Option<String>,

    /// Outcome class
    pub status: OperationStatus,

    /// Hands-on / instrument time the step costs (hours)
    pub time_cost_h: f64,

    /// Backend clock after the operation (hours since start)
    pub clock_h: f64,

    /// Numeric readouts keyed by name
    pub readouts: BTreeMap<String, f64>,

    /// Free-text events (handling incidents, pipeline failures)
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<String>,
}

impl OperationResult {
    /// Creates a successful record with no readouts.
    pub fn new(operation: impl Into<String>, vessel_id: Option<&str>, time_cost_h: f64, clock_h: f64) -> Self {
        Self {
            operation: operation.into(),
            vessel_id: vessel_id.map(str::to_string),
            status: OperationStatus::Success,
            time_cost_h,
            clock_h,
            readouts: BTreeMap::new(),
            events: Vec::new(),
        }
    }

    /// Adds a readout.
    pub fn with_readout(mut self, name: impl Into<String>, value: f64) -> Self {
        self.readouts.insert(name.into(), value);
        self
    }

    /// Records an event and downgrades the status accordingly.
    pub fn push_event(&mut self, event: impl Into<String>) {
        self.events.push(event.into());
        self.status = OperationStatus::CompletedWithEvents;
    }

    /// Returns a readout by name.
    pub fn readout(&self, name: &str) -> Option<f64> {
        self.readouts.get(name).copied()
    }
}
