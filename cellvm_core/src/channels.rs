//! Cell Painting channel layout.

use nalgebra::SVector;
use serde::{Deserialize, Serialize};

/// Number of morphology channels.
pub const NUM_CHANNELS: usize = 5;

/// One value per channel, in [`Channel::ALL`] order.
pub type ChannelVector = SVector<f64, NUM_CHANNELS>;

/// Morphology channels of the five-dye Cell Painting panel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    /// Endoplasmic reticulum (concanavalin A)
    Er,
    /// Mitochondria (MitoTracker)
    Mito,
    /// Nucleus (Hoechst)
    Nucleus,
    /// Actin / Golgi / membrane (phalloidin + WGA)
    Actin,
    /// Nucleoli / cytoplasmic RNA (SYTO 14)
    Rna,
}

impl Channel {
    pub const ALL: [Channel; NUM_CHANNELS] = [
        Channel::Er,
        Channel::Mito,
        Channel::Nucleus,
        Channel::Actin,
        Channel::Rna,
    ];

    /// Position in a [`ChannelVector`].
    pub fn index(&self) -> usize {
        match self {
            Channel::Er => 0,
            Channel::Mito => 1,
            Channel::Nucleus => 2,
            Channel::Actin => 3,
            Channel::Rna => 4,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Channel::Er => "er",
            Channel::Mito => "mito",
            Channel::Nucleus => "nucleus",
            Channel::Actin => "actin",
            Channel::Rna => "rna",
        }
    }
}
