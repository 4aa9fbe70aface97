// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Second-order IIR sections for the parametric equalizer.
//!
//! Coefficients follow the RBJ Audio EQ Cookbook. Processing uses the
//! transposed Direct Form II:
//!
//! ```text
//! y  = b0*x + z1
//! z1 = b1*x - a1*y + z2
//! z2 = b2*x - a2*y
//! ```

use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Lowest center frequency accepted by the designer, in Hz.
pub const MIN_FREQUENCY: f64 = 1.0;
/// Highest center frequency as a fraction of the sample rate.
pub const MAX_FREQUENCY_RATIO: f64 = 0.49;
/// Q (or shelf slope) range.
pub const MIN_Q: f64 = 0.05;
pub const MAX_Q: f64 = 24.0;

/// Shape of a single EQ band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum FilterType {
    #[default]
    Peaking,
    LowPass,
    HighPass,
    Notch,
    BandPass,
    LowShelf,
    HighShelf,
}

impl FilterType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Peaking => "peaking",
            Self::LowPass => "lowpass",
            Self::HighPass => "highpass",
            Self::Notch => "notch",
            Self::BandPass => "bandpass",
            Self::LowShelf => "lowshelf",
            Self::HighShelf => "highshelf",
        }
    }

    /// Whether the gain parameter changes the response of this shape.
    pub fn uses_gain(&self) -> bool {
        matches!(self, Self::Peaking | Self::LowShelf | Self::HighShelf)
    }
}

/// Normalized biquad coefficients (divided by a0).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BiquadCoefficients {
    pub b0: f64,
    pub b1: f64,
    pub b2: f64,
    pub a1: f64,
    pub a2: f64,
}

impl Default for BiquadCoefficients {
    fn default() -> Self {
        Self::identity()
    }
}

impl BiquadCoefficients {
    /// Pass-through section (`y = x`).
    pub const fn identity() -> Self {
        Self {
            b0: 1.0,
            b1: 0.0,
            b2: 0.0,
            a1: 0.0,
            a2: 0.0,
        }
    }

    /// Design a section for the given band parameters.
    ///
    /// Frequency is clamped to `[1, 0.49 * sample_rate]` and Q to `[0.05, 24]`.
    /// For shelves the Q dial is the shelf slope S. Non-finite inputs fall back
    /// to neutral values so the result is always finite.
    pub fn design(
        kind: FilterType,
        frequency: f64,
        q: f64,
        gain_db: f64,
        sample_rate: f64,
    ) -> Self {
        let sample_rate = if sample_rate.is_finite() && sample_rate > 0.0 {
            sample_rate
        } else {
            48_000.0
        };
        let max_freq = (sample_rate * MAX_FREQUENCY_RATIO).max(MIN_FREQUENCY);
        let frequency = if frequency.is_finite() {
            frequency.clamp(MIN_FREQUENCY, max_freq)
        } else {
            1000.0_f64.min(max_freq)
        };
        let q = if q.is_finite() {
            q.clamp(MIN_Q, MAX_Q)
        } else {
            std::f64::consts::FRAC_1_SQRT_2
        };
        let gain_db = if gain_db.is_finite() { gain_db } else { 0.0 };

        let w0 = 2.0 * PI * frequency / sample_rate;
        let (sin_w0, cos_w0) = w0.sin_cos();
        let a = 10.0_f64.powf(gain_db / 40.0);

        let (b0, b1, b2, a0, a1, a2) = match kind {
            FilterType::Peaking => {
                let alpha = sin_w0 / (2.0 * q);
                (
                    1.0 + alpha * a,
                    -2.0 * cos_w0,
                    1.0 - alpha * a,
                    1.0 + alpha / a,
                    -2.0 * cos_w0,
                    1.0 - alpha / a,
                )
            }
            FilterType::LowPass => {
                let alpha = sin_w0 / (2.0 * q);
                (
                    (1.0 - cos_w0) / 2.0,
                    1.0 - cos_w0,
                    (1.0 - cos_w0) / 2.0,
                    1.0 + alpha,
                    -2.0 * cos_w0,
                    1.0 - alpha,
                )
            }
            FilterType::HighPass => {
                let alpha = sin_w0 / (2.0 * q);
                (
                    (1.0 + cos_w0) / 2.0,
                    -(1.0 + cos_w0),
                    (1.0 + cos_w0) / 2.0,
                    1.0 + alpha,
                    -2.0 * cos_w0,
                    1.0 - alpha,
                )
            }
            FilterType::Notch => {
                let alpha = sin_w0 / (2.0 * q);
                (
                    1.0,
                    -2.0 * cos_w0,
                    1.0,
                    1.0 + alpha,
                    -2.0 * cos_w0,
                    1.0 - alpha,
                )
            }
            FilterType::BandPass => {
                // Constant 0 dB peak gain.
                let alpha = sin_w0 / (2.0 * q);
                (alpha, 0.0, -alpha, 1.0 + alpha, -2.0 * cos_w0, 1.0 - alpha)
            }
            FilterType::LowShelf => {
                let alpha = shelf_alpha(sin_w0, a, q);
                let sqrt_a_alpha = 2.0 * a.sqrt() * alpha;
                (
                    a * ((a + 1.0) - (a - 1.0) * cos_w0 + sqrt_a_alpha),
                    2.0 * a * ((a - 1.0) - (a + 1.0) * cos_w0),
                    a * ((a + 1.0) - (a - 1.0) * cos_w0 - sqrt_a_alpha),
                    (a + 1.0) + (a - 1.0) * cos_w0 + sqrt_a_alpha,
                    -2.0 * ((a - 1.0) + (a + 1.0) * cos_w0),
                    (a + 1.0) + (a - 1.0) * cos_w0 - sqrt_a_alpha,
                )
            }
            FilterType::HighShelf => {
                let alpha = shelf_alpha(sin_w0, a, q);
                let sqrt_a_alpha = 2.0 * a.sqrt() * alpha;
                (
                    a * ((a + 1.0) + (a - 1.0) * cos_w0 + sqrt_a_alpha),
                    -2.0 * a * ((a - 1.0) + (a + 1.0) * cos_w0),
                    a * ((a + 1.0) + (a - 1.0) * cos_w0 - sqrt_a_alpha),
                    (a + 1.0) - (a - 1.0) * cos_w0 + sqrt_a_alpha,
                    2.0 * ((a - 1.0) - (a + 1.0) * cos_w0),
                    (a + 1.0) - (a - 1.0) * cos_w0 - sqrt_a_alpha,
                )
            }
        };

        let coeffs = Self {
            b0: b0 / a0,
            b1: b1 / a0,
            b2: b2 / a0,
            a1: a1 / a0,
            a2: a2 / a0,
        };

        if coeffs.is_finite() {
            coeffs
        } else {
            Self::identity()
        }
    }

    pub fn is_finite(&self) -> bool {
        self.b0.is_finite()
            && self.b1.is_finite()
            && self.b2.is_finite()
            && self.a1.is_finite()
            && self.a2.is_finite()
    }

    /// Magnitude of the frequency response at `frequency` Hz.
    pub fn magnitude_at(&self, frequency: f64, sample_rate: f64) -> f64 {
        let w = 2.0 * PI * frequency / sample_rate;
        let (s1, c1) = w.sin_cos();
        let (s2, c2) = (2.0 * w).sin_cos();

        // H(e^jw) = (b0 + b1 e^-jw + b2 e^-2jw) / (1 + a1 e^-jw + a2 e^-2jw)
        let num_re = self.b0 + self.b1 * c1 + self.b2 * c2;
        let num_im = -(self.b1 * s1 + self.b2 * s2);
        let den_re = 1.0 + self.a1 * c1 + self.a2 * c2;
        let den_im = -(self.a1 * s1 + self.a2 * s2);

        ((num_re * num_re + num_im * num_im) / (den_re * den_re + den_im * den_im)).sqrt()
    }
}

/// Shelf alpha with slope `s`; the radicand is kept positive so steep
/// slopes at high gain degrade to the steepest valid shelf instead of NaN.
fn shelf_alpha(sin_w0: f64, a: f64, s: f64) -> f64 {
    let radicand = (a + 1.0 / a) * (1.0 / s - 1.0) + 2.0;
    sin_w0 / 2.0 * radicand.max(1e-12).sqrt()
}

/// Delay state of one section.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BiquadState {
    z1: f64,
    z2: f64,
}

impl BiquadState {
    pub const fn new() -> Self {
        Self { z1: 0.0, z2: 0.0 }
    }

    #[inline]
    pub fn process(&mut self, c: &BiquadCoefficients, x: f64) -> f64 {
        let y = c.b0 * x + self.z1;
        self.z1 = c.b1 * x - c.a1 * y + self.z2;
        self.z2 = c.b2 * x - c.a2 * y;
        y
    }

    pub fn reset(&mut self) {
        self.z1 = 0.0;
        self.z2 = 0.0;
    }

    pub fn is_zero(&self) -> bool {
        self.z1 == 0.0 && self.z2 == 0.0
    }
}

/// Convert decibels to a linear amplitude factor.
pub fn db_to_gain(db: f64) -> f64 {
    if db.is_finite() {
        10.0_f64.powf(db / 20.0)
    } else {
        1.0
    }
}
