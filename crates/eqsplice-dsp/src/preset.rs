// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! EQ preset definitions.

use crate::biquad::FilterType;
use serde::{Deserialize, Serialize};

/// Center frequencies of the flat six-band layout.
pub const FLAT_FREQUENCIES: [f32; 6] = [60.0, 230.0, 910.0, 3600.0, 8000.0, 14000.0];

/// A single EQ band.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EqBand {
    #[serde(rename = "type")]
    pub kind: FilterType,
    /// Center (or corner) frequency in Hz.
    pub freq: f32,
    /// Q factor, or shelf slope for shelving bands.
    pub q: f32,
    /// Gain in dB. Ignored by pass, notch and band-pass shapes.
    pub gain: f32,
    pub enabled: bool,
}

impl Default for EqBand {
    fn default() -> Self {
        Self::peaking(1000.0)
    }
}

impl EqBand {
    pub fn peaking(freq: f32) -> Self {
        Self {
            kind: FilterType::Peaking,
            freq,
            q: 1.0,
            gain: 0.0,
            enabled: true,
        }
    }

    pub fn new(kind: FilterType, freq: f32) -> Self {
        Self {
            kind,
            ..Self::peaking(freq)
        }
    }

    pub fn with_gain(mut self, gain: f32) -> Self {
        self.gain = gain;
        self
    }

    pub fn with_q(mut self, q: f32) -> Self {
        self.q = q;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// A parametric EQ preset applied to one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EqPreset {
    pub name: String,
    pub enabled: bool,
    /// Gain applied once before the first band, in dB.
    pub preamp: f32,
    pub bands: Vec<EqBand>,
}

impl Default for EqPreset {
    fn default() -> Self {
        Self::flat()
    }
}

impl EqPreset {
    /// Six peaking bands at 0 dB, disabled.
    pub fn flat() -> Self {
        Self {
            name: "Flat".to_string(),
            enabled: false,
            preamp: 0.0,
            bands: FLAT_FREQUENCIES.iter().map(|&f| EqBand::peaking(f)).collect(),
        }
    }

    /// Bass boost preset.
    pub fn bass_boost() -> Self {
        Self {
            name: "Bass Boost".to_string(),
            enabled: true,
            preamp: -4.0,
            bands: vec![
                EqBand::new(FilterType::LowShelf, 90.0)
                    .with_gain(6.0)
                    .with_q(0.8),
                EqBand::peaking(230.0).with_gain(2.0),
                EqBand::peaking(910.0),
                EqBand::peaking(3600.0),
                EqBand::peaking(8000.0),
                EqBand::new(FilterType::HighShelf, 14000.0).with_gain(-2.0),
            ],
        }
    }

    /// Vocal clarity preset.
    pub fn vocal_clarity() -> Self {
        Self {
            name: "Vocal Clarity".to_string(),
            enabled: true,
            preamp: -3.0,
            bands: vec![
                EqBand::new(FilterType::HighPass, 80.0).with_q(0.707),
                EqBand::peaking(230.0).with_gain(-1.5),
                EqBand::peaking(1000.0).with_gain(2.0).with_q(1.5),
                EqBand::peaking(3600.0).with_gain(3.0).with_q(1.2),
                EqBand::peaking(8000.0).with_gain(1.0),
                EqBand::peaking(14000.0),
            ],
        }
    }

    /// Treble boost preset.
    pub fn treble_boost() -> Self {
        Self {
            name: "Treble Boost".to_string(),
            enabled: true,
            preamp: -4.0,
            bands: vec![
                EqBand::peaking(60.0).with_gain(-2.0),
                EqBand::peaking(230.0),
                EqBand::peaking(910.0),
                EqBand::peaking(3600.0).with_gain(2.0),
                EqBand::peaking(8000.0).with_gain(3.0),
                EqBand::new(FilterType::HighShelf, 10000.0).with_gain(5.0),
            ],
        }
    }

    /// Loudness compensation for low listening levels.
    pub fn loudness() -> Self {
        Self {
            name: "Loudness".to_string(),
            enabled: true,
            preamp: -5.0,
            bands: vec![
                EqBand::new(FilterType::LowShelf, 100.0)
                    .with_gain(5.0)
                    .with_q(0.7),
                EqBand::peaking(230.0).with_gain(1.0),
                EqBand::peaking(910.0).with_gain(-1.0),
                EqBand::peaking(3600.0),
                EqBand::peaking(8000.0).with_gain(2.0),
                EqBand::new(FilterType::HighShelf, 12000.0).with_gain(4.0),
            ],
        }
    }

    /// Get all built-in presets.
    pub fn builtin_presets() -> Vec<Self> {
        vec![
            Self::flat(),
            Self::bass_boost(),
            Self::vocal_clarity(),
            Self::treble_boost(),
            Self::loudness(),
        ]
    }

    /// Look up a built-in preset by name, ignoring case.
    pub fn builtin(name: &str) -> Option<Self> {
        Self::builtin_presets()
            .into_iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Bands that take part in processing.
    pub fn active_bands(&self) -> impl Iterator<Item = &EqBand> {
        self.bands.iter().filter(|b| b.enabled)
    }

    /// Check if this preset is effectively flat (no audible change).
    pub fn is_flat(&self) -> bool {
        self.preamp.abs() < 0.1
            && self
                .active_bands()
                .all(|b| b.kind == FilterType::Peaking && b.gain.abs() < 0.1)
    }
}
