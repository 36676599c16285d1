//! Run-level environment: the "cursed day" confound.
//!
//! Everything that differs between two otherwise identical experimental runs
//! (incubator drift, reagent lot, imaging instrument) is sampled here once per
//! seed. The three shifts load on one shared latent factor, so a bad day tends
//! to be bad on every axis at once, which is exactly what makes naive
//! inference over-confident.

use crate::channels::{ChannelVector, NUM_CHANNELS};
use crate::streams::{Purpose, StreamProvider};
use rand_distr::{Distribution, StandardNormal};
use serde::Serialize;
use std::cell::OnceCell;

/// Loading of each shift on the shared latent; pairwise correlation = LOADING^2.
const SHARED_LOADING: f64 = std::f64::consts::FRAC_1_SQRT_2;

/// Raw normals are clipped at this many SDs, then scaled into [-1, 1].
const SHIFT_CLIP_SD: f64 = 2.5;

/// Per-channel sensitivity to the instrument shift.
const INSTRUMENT_LOADINGS: [f64; NUM_CHANNELS] = [0.08, 0.06, 0.04, 0.07, 0.05];

/// Per-channel sensitivity to the reagent-lot shift.
const REAGENT_LOADINGS: [f64; NUM_CHANNELS] = [0.03, 0.05, 0.02, 0.04, 0.06];

/// Biology modifiers derived from the shifts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BiologyModifiers {
    /// Multiplies every IC50
    pub ec50_multiplier: f64,
    /// Multiplies every `k_on`
    pub stress_sensitivity: f64,
    /// Multiplies every growth rate
    pub growth_rate_multiplier: f64,
}

/// Measurement modifiers derived from the shifts.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MeasurementModifiers {
    /// Multiplicative intensity bias per morphology channel
    pub channel_bias: ChannelVector,
    /// Global illumination bias on all imaging channels
    pub illumination_bias: f64,
}

/// One experimental run's environment.
///
/// Immutable after construction; the derived modifiers are computed lazily
/// on first use and cached in place.
#[derive(Debug, Clone, PartialEq)]
pub struct RunContext {
    /// Seed the shifts were drawn from
    pub seed: u64,

    /// Shared latent ("cursed day") value, standard normal
    pub cursed_day: f64,

    /// Incubator drift in [-1, 1]
    pub incubator_shift: f64,

    /// Reagent-lot bias in [-1, 1]
    pub reagent_lot_shift: f64,

    /// Imaging instrument bias in [-1, 1]
    pub instrument_shift: f64,

    biology: OnceCell<BiologyModifiers>,
    measurement: OnceCell<MeasurementModifiers>,
}

impl RunContext {
    /// Samples the run environment for a seed.
    pub fn sample(seed: u64) -> Self {
        let mut rng = StreamProvider::new(seed).stream("run", Purpose::RunContext, 0);
        let cursed_day: f64 = StandardNormal.sample(&mut rng);

        let unique = (1.0 - SHARED_LOADING * SHARED_LOADING).sqrt();
        let mut shift = || {
            let z: f64 = StandardNormal.sample(&mut rng);
            let raw = SHARED_LOADING * cursed_day + unique * z;
            raw.clamp(-SHIFT_CLIP_SD, SHIFT_CLIP_SD) / SHIFT_CLIP_SD
        };
        let incubator_shift = shift();
        let reagent_lot_shift = shift();
        let instrument_shift = shift();

        Self::from_shifts(seed, cursed_day, incubator_shift, reagent_lot_shift, instrument_shift)
    }

    /// A reference run with every shift at zero (calibration runs).
    pub fn neutral(seed: u64) -> Self {
        Self::from_shifts(seed, 0.0, 0.0, 0.0, 0.0)
    }

    /// Builds a context from explicit shifts.
    pub fn from_shifts(
        seed: u64,
        cursed_day: f64,
        incubator_shift: f64,
        reagent_lot_shift: f64,
        instrument_shift: f64,
    ) -> Self {
        Self {
            seed,
            cursed_day,
            incubator_shift,
            reagent_lot_shift,
            instrument_shift,
            biology: OnceCell::new(),
            measurement: OnceCell::new(),
        }
    }

    /// Biology modifiers (cached).
    pub fn biology(&self) -> &BiologyModifiers {
        self.biology.get_or_init(|| BiologyModifiers {
            ec50_multiplier: (0.20 * self.reagent_lot_shift + 0.05 * self.incubator_shift).exp(),
            stress_sensitivity: (0.15 * self.incubator_shift + 0.05 * self.reagent_lot_shift).exp(),
            // Drift in either direction away from setpoint slows growth
            growth_rate_multiplier: (-0.15 * self.incubator_shift.abs()).exp(),
        })
    }

    /// Measurement modifiers (cached).
    pub fn measurement(&self) -> &MeasurementModifiers {
        self.measurement.get_or_init(|| {
            let channel_bias = ChannelVector::from_fn(|c, _| {
                (INSTRUMENT_LOADINGS[c] * self.instrument_shift + REAGENT_LOADINGS[c] * self.reagent_lot_shift).exp()
            });
            MeasurementModifiers {
                channel_bias,
                illumination_bias: (0.10 * self.instrument_shift).exp(),
            }
        })
    }

    pub fn ec50_multiplier(&self) -> f64 {
        self.biology().ec50_multiplier
    }

    pub fn stress_sensitivity(&self) -> f64 {
        self.biology().stress_sensitivity
    }

    pub fn growth_rate_multiplier(&self) -> f64 {
        self.biology().growth_rate_multiplier
    }
}
