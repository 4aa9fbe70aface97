// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Signal processing for eqsplice filter nodes.
//!
//! This crate has no PipeWire dependency: it designs RBJ biquads, runs
//! them as per-port cascades, and defines the serializable EQ preset
//! types shared with the host.

pub mod biquad;
pub mod cascade;
pub mod preset;

pub use biquad::{BiquadCoefficients, BiquadState, FilterType};
pub use cascade::EqCascade;
pub use preset::{EqBand, EqPreset};
