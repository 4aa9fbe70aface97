// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Per-node parametric EQ: filter nodes and the reconciler that splices
//! them into the graph.

pub mod filter_node;
pub mod layout;
pub mod reconciler;

pub use filter_node::{
    BiquadFilterNode, FilterError, FilterHost, FilterInstance, FilterRequest, FilterShared,
    FilterState,
};
pub use layout::{PortLayout, TargetRole};
pub use reconciler::{EqError, EqReconciler, ReconcilerSettings, SavedLink};
