// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The seam between the graph tables and whatever talks to the server.
//!
//! A backend feeds [`GraphEvent`]s into the [`GraphStore`](super::graph::GraphStore)
//! and accepts mutation requests through [`GraphBackend`]. Requests are
//! fire-and-confirm: `Ok` means the request was handed to the server, the
//! tables change only when the server reports the result back as an event.

use crate::audio::types::{ProfilerSnapshot, PropsUpdate};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Not connected to PipeWire")]
    Disconnected,
    #[error("PipeWire thread is not running")]
    ThreadGone,
    #[error("Object not bound: {0}")]
    NotBound(u32),
    #[error("Failed to build request: {0}")]
    Request(String),
}

/// Everything a backend can tell the tables.
#[derive(Debug, Clone, PartialEq)]
pub enum GraphEvent {
    /// Registry announced a node.
    NodeAdded {
        id: u32,
        props: HashMap<String, String>,
    },
    /// Bound node emitted an info update (partial property set).
    NodeInfo {
        id: u32,
        props: HashMap<String, String>,
    },
    /// Bound node emitted a `Props` parameter.
    NodeParams { id: u32, props: PropsUpdate },
    PortAdded {
        id: u32,
        props: HashMap<String, String>,
    },
    LinkAdded {
        id: u32,
        props: HashMap<String, String>,
    },
    /// Link info reported a state change.
    LinkState { id: u32, active: bool },
    ModuleAdded {
        id: u32,
        props: HashMap<String, String>,
    },
    /// Registry announced a metadata object.
    MetadataAdded { id: u32, name: String },
    /// A bound metadata object reported a property on subject 0.
    MetadataProperty {
        metadata: String,
        key: String,
        value: Option<String>,
    },
    Profiler(ProfilerSnapshot),
    GlobalRemoved { id: u32 },
    /// The connection is gone; every mirrored object is stale.
    Disconnected,
}

/// A link request between two known ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkRequest {
    pub output_node: u32,
    pub output_port: u32,
    pub input_node: u32,
    pub input_port: u32,
}

/// A metadata property write on subject 0 of a named metadata object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataWrite {
    pub metadata: String,
    pub key: String,
    pub type_: Option<String>,
    /// `None` removes the key.
    pub value: Option<String>,
}

/// Server-side mutations. Implementations must not block on the server.
pub trait GraphBackend: Send + Sync {
    fn create_link(&self, request: &LinkRequest) -> Result<(), BackendError>;

    fn destroy_link(&self, link_id: u32) -> Result<(), BackendError>;

    /// Write volume/mute fields of a node's `Props` parameter.
    fn set_node_props(&self, node_id: u32, props: &PropsUpdate) -> Result<(), BackendError>;

    fn set_metadata(&self, write: &MetadataWrite) -> Result<(), BackendError>;
}
