// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! eqsplice - PipeWire graph mirror with transparent per-node EQ.
//!
//! [`audio`] mirrors the server graph into thread-safe tables and, with the
//! `native` feature, runs the PipeWire event loop that feeds them. [`eq`]
//! inserts biquad filter nodes in front of or behind any node whose stored
//! preset is enabled. [`config`] loads the service config and keeps presets.

pub mod audio;
pub mod config;
pub mod eq;

#[cfg(test)]
pub(crate) mod testing;

pub use eqsplice_dsp as dsp;
