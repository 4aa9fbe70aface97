// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Filter port layout derived from a target node's ports.

use crate::audio::graph::GraphSnapshot;
use crate::audio::types::{AudioChannel, MediaClass, NodeInfo, PortDirection, PortInfo};

/// Label of the single port of an interleaved multi-channel filter.
pub const INTERLEAVED_LABEL: &str = "MULTI";

/// One input/output port pair of a filter node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortLayout {
    /// Channel label (`FL`, `AUX0`, ...); also names the filter ports.
    pub label: String,
    /// Interleaved channels carried by the port.
    pub channels: usize,
}

impl PortLayout {
    pub fn mono(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            channels: 1,
        }
    }

    pub fn input_port_name(&self) -> String {
        format!("input_{}", self.label)
    }

    pub fn output_port_name(&self) -> String {
        format!("output_{}", self.label)
    }
}

/// Which side of the target the filter sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetRole {
    /// Audio flows into the target (sinks, capture streams): the filter
    /// feeds the target's input ports.
    SinkLike,
    /// Audio flows out of the target (sources, playback streams): the
    /// target's output ports feed the filter.
    SourceLike,
}

impl TargetRole {
    /// Role for an EQ-able media class, `None` for everything else.
    pub fn for_class(class: &MediaClass) -> Option<Self> {
        match class {
            MediaClass::AudioSink | MediaClass::StreamInputAudio => Some(Self::SinkLike),
            MediaClass::AudioSource | MediaClass::StreamOutputAudio => Some(Self::SourceLike),
            _ => None,
        }
    }

    /// Direction of the target ports the filter attaches to.
    pub fn target_direction(&self) -> PortDirection {
        match self {
            Self::SinkLike => PortDirection::Input,
            Self::SourceLike => PortDirection::Output,
        }
    }
}

fn port_label(port: &PortInfo, index: usize) -> String {
    match port.channel {
        AudioChannel::Unknown => format!("AUX{}", index),
        ref channel => channel.label(),
    }
}

/// Compute the filter layout for `node`, or `None` while its ports are
/// not visible yet.
///
/// One mono port pair per distinct channel label; a single unlabeled port
/// on a node with a known channel count greater than one becomes one
/// interleaved port pair.
pub fn compute_layout(
    snapshot: &GraphSnapshot,
    node: &NodeInfo,
    role: TargetRole,
) -> Option<Vec<PortLayout>> {
    let ports = snapshot.ports_of(node.id, role.target_direction());
    if ports.is_empty() {
        return None;
    }

    let channel_count = node.channel_count.unwrap_or(1) as usize;
    if let [only] = ports.as_slice() {
        if only.channel == AudioChannel::Unknown && channel_count > 1 {
            return Some(vec![PortLayout {
                label: INTERLEAVED_LABEL.to_string(),
                channels: channel_count,
            }]);
        }
    }

    let mut layout: Vec<PortLayout> = Vec::with_capacity(ports.len());
    for (index, port) in ports.iter().enumerate() {
        let label = port_label(port, index);
        if !layout.iter().any(|l| l.label == label) {
            layout.push(PortLayout::mono(label));
        }
    }
    Some(layout)
}

/// Pair each relevant target port with the index of its filter port.
pub fn match_target_ports<'a>(
    target_ports: &[&'a PortInfo],
    layout: &[PortLayout],
) -> Vec<(&'a PortInfo, usize)> {
    if let ([only], [single]) = (target_ports, layout) {
        if single.label == INTERLEAVED_LABEL {
            return vec![(*only, 0)];
        }
    }

    target_ports
        .iter()
        .enumerate()
        .filter_map(|(index, port)| {
            let label = port_label(port, index);
            layout
                .iter()
                .position(|l| l.label == label)
                .map(|i| (*port, i))
        })
        .collect()
}
