// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Multi-port, multi-channel biquad cascade.
//!
//! One coefficient set per enabled band is shared by every channel; delay
//! state is kept per (port, channel, band). All allocation happens in
//! [`EqCascade::set_preset`] and [`EqCascade::set_sample_rate`], so
//! [`EqCascade::process_port`] is safe to call from a real-time thread.

use crate::biquad::{db_to_gain, BiquadCoefficients, BiquadState};
use crate::preset::EqPreset;

#[derive(Debug, Clone)]
struct PortState {
    channels: usize,
    /// `channels * bands` sections, channel-major.
    sections: Vec<BiquadState>,
}

/// The DSP core of one filter node.
#[derive(Debug, Clone)]
pub struct EqCascade {
    sample_rate: f64,
    preset: EqPreset,
    preamp: f64,
    coeffs: Vec<BiquadCoefficients>,
    ports: Vec<PortState>,
}

impl EqCascade {
    /// Create a cascade with one entry per port; each entry is the number of
    /// interleaved channels that port carries.
    pub fn new(port_channels: &[usize], preset: &EqPreset, sample_rate: u32) -> Self {
        let mut cascade = Self {
            sample_rate: f64::from(sample_rate.max(1)),
            preset: preset.clone(),
            preamp: 1.0,
            coeffs: Vec::new(),
            ports: port_channels
                .iter()
                .map(|&channels| PortState {
                    channels: channels.max(1),
                    sections: Vec::new(),
                })
                .collect(),
        };
        cascade.rebuild();
        cascade
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate as u32
    }

    pub fn preset(&self) -> &EqPreset {
        &self.preset
    }

    pub fn port_count(&self) -> usize {
        self.ports.len()
    }

    pub fn coefficients(&self) -> &[BiquadCoefficients] {
        &self.coeffs
    }

    /// Replace the preset; rebuilds coefficients and clears all state.
    pub fn set_preset(&mut self, preset: &EqPreset) {
        self.preset = preset.clone();
        self.rebuild();
    }

    /// Change the sample rate; rebuilds coefficients and clears all state.
    pub fn set_sample_rate(&mut self, sample_rate: u32) {
        self.sample_rate = f64::from(sample_rate.max(1));
        self.rebuild();
    }

    /// Zero every delay element without touching coefficients.
    pub fn reset(&mut self) {
        for port in &mut self.ports {
            port.sections.iter_mut().for_each(BiquadState::reset);
        }
    }

    /// True when every delay element is zero.
    pub fn is_reset(&self) -> bool {
        self.ports
            .iter()
            .all(|p| p.sections.iter().all(BiquadState::is_zero))
    }

    fn rebuild(&mut self) {
        self.preamp = db_to_gain(f64::from(self.preset.preamp));
        self.coeffs.clear();
        self.coeffs.extend(self.preset.active_bands().map(|band| {
            BiquadCoefficients::design(
                band.kind,
                f64::from(band.freq),
                f64::from(band.q),
                f64::from(band.gain),
                self.sample_rate,
            )
        }));

        let bands = self.coeffs.len();
        for port in &mut self.ports {
            port.sections.clear();
            port.sections
                .resize(port.channels * bands, BiquadState::default());
        }
    }

    /// Process one port's buffer. Copies `min(input.len(), output.len())`
    /// samples and returns that count. Interleaved channels are demuxed by
    /// sample index modulo the port's channel count.
    pub fn process_port(&mut self, port: usize, input: &[f32], output: &mut [f32]) -> usize {
        let n = input.len().min(output.len());
        let (input, output) = (&input[..n], &mut output[..n]);

        let Some(state) = self.ports.get_mut(port) else {
            output.copy_from_slice(input);
            return n;
        };

        if !self.preset.enabled {
            output.copy_from_slice(input);
            return n;
        }

        let bands = self.coeffs.len();
        let channels = state.channels;
        for (i, (x, y)) in input.iter().zip(output.iter_mut()).enumerate() {
            let ch = i % channels;
            let row = &mut state.sections[ch * bands..(ch + 1) * bands];
            let mut s = f64::from(*x) * self.preamp;
            for (c, z) in self.coeffs.iter().zip(row.iter_mut()) {
                s = z.process(c, s);
            }
            *y = s as f32;
        }
        n
    }
}
