// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Audio subsystem - PipeWire graph mirror.

pub mod backend;
pub mod graph;
pub mod metadata;
pub mod notify;
pub mod types;

#[cfg(feature = "native")]
pub mod control;
#[cfg(feature = "native")]
mod native_filter;
#[cfg(feature = "native")]
pub mod pipewire_thread;
#[cfg(feature = "native")]
pub mod profiler;

pub use backend::{BackendError, GraphBackend, GraphEvent, LinkRequest, MetadataWrite};
pub use graph::{GraphMirror, GraphSnapshot, GraphStore};
pub use notify::{ChangeFlags, ChangeNotifier};
#[cfg(feature = "native")]
pub use pipewire_thread::{EventLoopThread, LoopStatus, PwError};
pub use types::*;
