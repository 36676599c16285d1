//! Handling incidents: contamination, equipment failure, human error.
//!
//! Every hands-on operation (treat, feed, washout, passage) rolls for each
//! incident. Incidents kill a random fraction of every subpopulation outside
//! the hazard framework; the VM credits it to `death_unknown`.

use crate::config::HandlingRisk;
use rand::Rng;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlingIncident {
    Contamination,
    EquipmentFailure,
    HumanError,
}

impl HandlingIncident {
    pub fn name(&self) -> &'static str {
        match self {
            HandlingIncident::Contamination => "contamination",
            HandlingIncident::EquipmentFailure => "equipment_failure",
            HandlingIncident::HumanError => "human_error",
        }
    }
}

/// An incident that fired and the fraction of survivors it kills.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct IncidentDraw {
    pub incident: HandlingIncident,
    pub kill_fraction: f64,
}

/// Rolls for every incident.
///
/// Always consumes the same number of draws, so whether an incident fires
/// never shifts later draws on the stream.
pub fn draw_incidents<R: Rng + ?Sized>(rng: &mut R, risk: &HandlingRisk, extra_contamination_p: f64) -> Vec<IncidentDraw> {
    let table = [
        (
            HandlingIncident::Contamination,
            (risk.contamination_p + extra_contamination_p).min(1.0),
            risk.contamination_kill_min,
            risk.contamination_kill_max,
        ),
        (HandlingIncident::EquipmentFailure, risk.equipment_failure_p, 0.0, risk.equipment_kill_max),
        (HandlingIncident::HumanError, risk.human_error_p, 0.0, risk.human_error_kill_max),
    ];

    let mut fired = Vec::new();
    for (incident, p, kill_min, kill_max) in table {
        let roll: f64 = rng.gen();
        let magnitude: f64 = rng.gen();
        if roll < p {
            fired.push(IncidentDraw {
                incident,
                kill_fraction: (kill_min + magnitude * (kill_max - kill_min)).clamp(0.0, 1.0),
            });
        }
    }
    fired
}
