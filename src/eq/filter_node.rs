// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Virtual biquad EQ node.
//!
//! A [`BiquadFilterNode`] owns a native filter (created through a
//! [`FilterHost`]) and the [`FilterShared`] block the native side calls
//! back into: lifecycle state, the server-assigned node id, and the DSP
//! cascade behind its own coefficient lock.

use crate::audio::backend::BackendError;
use crate::eq::layout::PortLayout;
use eqsplice_dsp::{EqCascade, EqPreset};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Sentinel for "no node id yet".
const INVALID_ID: u32 = u32::MAX;

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("Filter node needs at least one port")]
    NoPorts,
    #[error("Failed to create filter node: {0}")]
    CreateFailed(String),
    #[error("Filter host unavailable: {0}")]
    Host(#[from] BackendError),
}

/// Lifecycle of a filter node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterState {
    Unconnected,
    Connecting,
    Paused,
    Streaming,
    Error(String),
    Destroyed,
}

impl FilterState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Error(_) | Self::Destroyed)
    }
}

/// What the host needs to build the native node.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterRequest {
    pub name: String,
    pub description: String,
    pub layout: Vec<PortLayout>,
    pub sample_rate: u32,
}

/// Creates native filter nodes.
pub trait FilterHost: Send + Sync {
    /// Register the node and its ports and start connecting. The host
    /// reports progress through `shared`.
    fn create_filter(
        &self,
        request: FilterRequest,
        shared: Arc<FilterShared>,
    ) -> Result<Box<dyn FilterInstance>, FilterError>;
}

/// Handle to a native filter. Dropping it without `destroy` leaks the
/// native node until the connection closes.
pub trait FilterInstance: Send {
    fn destroy(&mut self);
}

/// State shared between the owner, the event loop and the audio thread.
pub struct FilterShared {
    name: String,
    state: Mutex<FilterState>,
    node_id: AtomicU32,
    dsp: Mutex<EqCascade>,
}

impl FilterShared {
    pub fn new(name: &str, layout: &[PortLayout], preset: &EqPreset, sample_rate: u32) -> Self {
        let channels: Vec<usize> = layout.iter().map(|l| l.channels).collect();
        Self {
            name: name.to_string(),
            state: Mutex::new(FilterState::Unconnected),
            node_id: AtomicU32::new(INVALID_ID),
            dsp: Mutex::new(EqCascade::new(&channels, preset, sample_rate)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> FilterState {
        self.state.lock().clone()
    }

    /// Record a state change. `Error` is sticky: only `Destroyed` may follow it.
    pub fn set_state(&self, new_state: FilterState) {
        let mut state = self.state.lock();
        if *state == new_state {
            return;
        }
        if matches!(*state, FilterState::Destroyed)
            || (matches!(*state, FilterState::Error(_)) && new_state != FilterState::Destroyed)
        {
            debug!(
                "Filter '{}': ignoring {:?} after {:?}",
                self.name, new_state, *state
            );
            return;
        }
        match &new_state {
            FilterState::Error(message) => {
                warn!("Filter '{}' failed: {}", self.name, message)
            }
            other => debug!("Filter '{}': {:?} -> {:?}", self.name, *state, other),
        }
        *state = new_state;
    }

    pub fn node_id(&self) -> Option<u32> {
        match self.node_id.load(Ordering::Acquire) {
            INVALID_ID => None,
            id => Some(id),
        }
    }

    pub fn set_node_id(&self, id: u32) {
        self.node_id.store(id, Ordering::Release);
    }

    pub fn sample_rate(&self) -> u32 {
        self.dsp.lock().sample_rate()
    }

    /// Rebuild for a negotiated rate. No-op when unchanged.
    pub fn set_sample_rate(&self, rate: u32) {
        if self.set_sample_rate_rt(rate) {
            info!("Filter '{}': sample rate {} Hz", self.name, rate);
        }
    }

    /// Audio-thread variant of [`set_sample_rate`](Self::set_sample_rate):
    /// never logs, and the rebuild reuses existing storage. Returns whether
    /// the rate changed.
    pub fn set_sample_rate_rt(&self, rate: u32) -> bool {
        if rate == 0 {
            return false;
        }
        let mut dsp = self.dsp.lock();
        if dsp.sample_rate() == rate {
            return false;
        }
        dsp.set_sample_rate(rate);
        true
    }

    pub fn set_preset(&self, preset: &EqPreset) {
        self.dsp.lock().set_preset(preset);
    }

    pub fn port_count(&self) -> usize {
        self.dsp.lock().port_count()
    }

    /// Audio-thread entry: filter one port pair's buffers.
    #[inline]
    pub fn process_port(&self, port: usize, input: &[f32], output: &mut [f32]) -> usize {
        self.dsp.lock().process_port(port, input, output)
    }

    #[cfg(test)]
    pub(crate) fn with_dsp<R>(&self, f: impl FnOnce(&EqCascade) -> R) -> R {
        f(&self.dsp.lock())
    }
}

/// A live EQ node in the graph.
pub struct BiquadFilterNode {
    layout: Vec<PortLayout>,
    shared: Arc<FilterShared>,
    instance: Option<Box<dyn FilterInstance>>,
}

impl BiquadFilterNode {
    /// Create the node; on return it is `Connecting` (or further along if
    /// the host progressed synchronously).
    pub fn create(
        host: &dyn FilterHost,
        name: &str,
        description: &str,
        layout: Vec<PortLayout>,
        preset: &EqPreset,
        sample_rate: u32,
    ) -> Result<Self, FilterError> {
        if layout.is_empty() {
            return Err(FilterError::NoPorts);
        }

        let shared = Arc::new(FilterShared::new(name, &layout, preset, sample_rate));
        shared.set_state(FilterState::Connecting);

        let request = FilterRequest {
            name: name.to_string(),
            description: description.to_string(),
            layout: layout.clone(),
            sample_rate,
        };
        let instance = match host.create_filter(request, shared.clone()) {
            Ok(instance) => instance,
            Err(e) => {
                shared.set_state(FilterState::Error(e.to_string()));
                return Err(e);
            }
        };

        info!(
            "Created filter '{}' with {} port pair(s)",
            name,
            layout.len()
        );

        Ok(Self {
            layout,
            shared,
            instance: Some(instance),
        })
    }

    pub fn name(&self) -> &str {
        self.shared.name()
    }

    pub fn layout(&self) -> &[PortLayout] {
        &self.layout
    }

    pub fn state(&self) -> FilterState {
        self.shared.state()
    }

    pub fn node_id(&self) -> Option<u32> {
        self.shared.node_id()
    }

    pub fn sample_rate(&self) -> u32 {
        self.shared.sample_rate()
    }

    /// Error string if the node failed.
    pub fn last_error(&self) -> Option<String> {
        match self.shared.state() {
            FilterState::Error(message) => Some(message),
            _ => None,
        }
    }

    /// Swap coefficients; safe from any thread.
    pub fn set_preset(&self, preset: &EqPreset) {
        self.shared.set_preset(preset);
    }

    pub fn shared(&self) -> &Arc<FilterShared> {
        &self.shared
    }

    /// Tear down the native node. Idempotent.
    pub fn destroy(&mut self) {
        if let Some(mut instance) = self.instance.take() {
            debug!("Destroying filter '{}'", self.shared.name());
            instance.destroy();
        }
        self.shared.set_state(FilterState::Destroyed);
    }
}

impl Drop for BiquadFilterNode {
    fn drop(&mut self) {
        self.destroy();
    }
}
