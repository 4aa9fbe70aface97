// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! PipeWire type definitions for nodes, ports, links and the rest of the
//! mirrored graph.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Represents a PipeWire node (app stream, device, or virtual node).
#[derive(Debug, Clone, PartialEq)]
pub struct NodeInfo {
    pub id: u32,
    pub name: String,
    pub description: String,
    pub media_class: MediaClass,
    pub app_name: Option<String>,
    pub binary_name: Option<String>,
    /// `audio.channels`, when the node advertises it.
    pub channel_count: Option<u32>,
    /// `audio.position`, e.g. `"FL,FR"`.
    pub channel_positions: Option<String>,
    pub properties: HashMap<String, String>,
}

impl NodeInfo {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            name: String::new(),
            description: String::new(),
            media_class: MediaClass::Unknown(String::new()),
            app_name: None,
            binary_name: None,
            channel_count: None,
            channel_positions: None,
            properties: HashMap::new(),
        }
    }

    /// Build a node from its registry/info property dictionary.
    pub fn from_props(id: u32, props: HashMap<String, String>) -> Self {
        let mut node = Self::new(id);
        node.update_from_props(props);
        node
    }

    /// Merge a (possibly partial) property update. Keys absent from the
    /// update keep their previous value.
    pub fn update_from_props(&mut self, props: HashMap<String, String>) {
        if let Some(name) = props.get("node.name") {
            self.name = name.clone();
        }
        if let Some(desc) = props
            .get("node.description")
            .or_else(|| props.get("node.nick"))
        {
            self.description = desc.clone();
        }
        if let Some(class) = props.get("media.class") {
            self.media_class = MediaClass::from_str(class);
        }
        if let Some(app) = props.get("application.name") {
            self.app_name = Some(app.clone());
        }
        if let Some(binary) = props.get("application.process.binary") {
            self.binary_name = Some(binary.clone());
        }
        if let Some(channels) = props.get("audio.channels").and_then(|c| c.parse().ok()) {
            self.channel_count = Some(channels);
        }
        if let Some(position) = props.get("audio.position") {
            self.channel_positions = Some(position.clone());
        }
        self.properties.extend(props);
    }

    pub fn is_playback_stream(&self) -> bool {
        matches!(self.media_class, MediaClass::StreamOutputAudio)
    }

    pub fn is_sink(&self) -> bool {
        matches!(self.media_class, MediaClass::AudioSink)
    }

    pub fn is_source(&self) -> bool {
        matches!(self.media_class, MediaClass::AudioSource)
    }

    pub fn display_name(&self) -> &str {
        if !self.description.is_empty() {
            &self.description
        } else if let Some(ref app) = self.app_name {
            app
        } else if !self.name.is_empty() {
            &self.name
        } else {
            "Unknown"
        }
    }
}

/// Media class classification for PipeWire nodes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MediaClass {
    AudioSink,
    AudioSource,
    AudioDuplex,
    StreamOutputAudio,
    StreamInputAudio,
    VideoSource,
    Unknown(String),
}

impl MediaClass {
    /// Classify a `media.class` value. Stream classes match by prefix so
    /// variants such as `Stream/Output/Audio/Internal` are recognised.
    pub fn from_str(s: &str) -> Self {
        match s {
            "Audio/Sink" => Self::AudioSink,
            "Audio/Source" | "Audio/Source/Virtual" => Self::AudioSource,
            "Audio/Duplex" => Self::AudioDuplex,
            "Video/Source" => Self::VideoSource,
            s if s.starts_with("Stream/Output/Audio") => Self::StreamOutputAudio,
            s if s.starts_with("Stream/Input/Audio") => Self::StreamInputAudio,
            other => Self::Unknown(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::AudioSink => "Audio/Sink",
            Self::AudioSource => "Audio/Source",
            Self::AudioDuplex => "Audio/Duplex",
            Self::StreamOutputAudio => "Stream/Output/Audio",
            Self::StreamInputAudio => "Stream/Input/Audio",
            Self::VideoSource => "Video/Source",
            Self::Unknown(s) => s,
        }
    }
}

impl fmt::Display for MediaClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Represents a port on a PipeWire node.
#[derive(Debug, Clone, PartialEq)]
pub struct PortInfo {
    pub id: u32,
    pub node_id: u32,
    pub name: String,
    pub alias: Option<String>,
    pub direction: PortDirection,
    pub channel: AudioChannel,
    /// `format.dsp`, e.g. `"32 bit float mono audio"`.
    pub media_type: Option<String>,
    pub is_monitor: bool,
}

impl PortInfo {
    pub fn new(id: u32, node_id: u32) -> Self {
        Self {
            id,
            node_id,
            name: String::new(),
            alias: None,
            direction: PortDirection::Unknown,
            channel: AudioChannel::Unknown,
            media_type: None,
            is_monitor: false,
        }
    }

    /// Build a port from registry properties. Returns `None` when the
    /// owning node id is missing or malformed.
    pub fn from_props(id: u32, props: &HashMap<String, String>) -> Option<Self> {
        let node_id = props.get("node.id")?.parse().ok()?;
        let mut port = Self::new(id, node_id);
        port.name = props.get("port.name").cloned().unwrap_or_default();
        port.alias = props.get("port.alias").cloned();
        port.direction = props
            .get("port.direction")
            .map(|d| PortDirection::from_str(d))
            .unwrap_or(PortDirection::Unknown);
        port.channel = props
            .get("audio.channel")
            .map(|c| AudioChannel::from_label(c))
            .filter(|c| *c != AudioChannel::Unknown)
            .unwrap_or_else(|| AudioChannel::from_port_name(&port.name));
        port.media_type = props.get("format.dsp").cloned();
        port.is_monitor = props
            .get("port.monitor")
            .map(|m| m == "true")
            .unwrap_or_else(|| port.name.starts_with("monitor_"));
        Some(port)
    }
}

/// Direction of a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortDirection {
    Input,
    Output,
    Unknown,
}

impl PortDirection {
    pub fn from_str(s: &str) -> Self {
        match s {
            "in" => Self::Input,
            "out" => Self::Output,
            _ => Self::Unknown,
        }
    }
}

/// Audio channel position.
/// Ordered by standard channel layout for consistent pairing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AudioChannel {
    Mono,
    FrontLeft,
    FrontRight,
    FrontCenter,
    LowFrequency,
    SideLeft,
    SideRight,
    RearLeft,
    RearRight,
    Aux(u32),
    Unknown,
}

impl AudioChannel {
    /// Parse an `audio.channel` label such as `FL` or `AUX3`.
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_uppercase().as_str() {
            "MONO" => Self::Mono,
            "FL" => Self::FrontLeft,
            "FR" => Self::FrontRight,
            "FC" => Self::FrontCenter,
            "LFE" => Self::LowFrequency,
            "SL" => Self::SideLeft,
            "SR" => Self::SideRight,
            "RL" => Self::RearLeft,
            "RR" => Self::RearRight,
            other => other
                .strip_prefix("AUX")
                .and_then(|n| n.parse().ok())
                .map(Self::Aux)
                .unwrap_or(Self::Unknown),
        }
    }

    /// Best-effort guess from a port name like `playback_FL` or `capture_1`.
    pub fn from_port_name(name: &str) -> Self {
        let suffix = name.rsplit('_').next().unwrap_or(name);
        match Self::from_label(suffix) {
            Self::Unknown => {
                let lower = name.to_lowercase();
                if lower.contains("front_left") {
                    Self::FrontLeft
                } else if lower.contains("front_right") {
                    Self::FrontRight
                } else if lower.contains("mono") {
                    Self::Mono
                } else {
                    Self::Unknown
                }
            }
            known => known,
        }
    }

    /// The canonical `audio.channel` label.
    pub fn label(&self) -> String {
        match self {
            Self::Mono => "MONO".to_string(),
            Self::FrontLeft => "FL".to_string(),
            Self::FrontRight => "FR".to_string(),
            Self::FrontCenter => "FC".to_string(),
            Self::LowFrequency => "LFE".to_string(),
            Self::SideLeft => "SL".to_string(),
            Self::SideRight => "SR".to_string(),
            Self::RearLeft => "RL".to_string(),
            Self::RearRight => "RR".to_string(),
            Self::Aux(n) => format!("AUX{}", n),
            Self::Unknown => "UNK".to_string(),
        }
    }
}

/// A link between two ports in the PipeWire graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkInfo {
    pub id: u32,
    pub output_node: u32,
    pub output_port: u32,
    pub input_node: u32,
    pub input_port: u32,
    pub active: bool,
}

impl LinkInfo {
    /// Build a link from registry properties; all four endpoint ids are required.
    pub fn from_props(id: u32, props: &HashMap<String, String>) -> Option<Self> {
        let get = |key: &str| props.get(key).and_then(|v| v.parse::<u32>().ok());
        Some(Self {
            id,
            output_node: get("link.output.node")?,
            output_port: get("link.output.port")?,
            input_node: get("link.input.node")?,
            input_port: get("link.input.port")?,
            active: true,
        })
    }

    pub fn touches_node(&self, node_id: u32) -> bool {
        self.output_node == node_id || self.input_node == node_id
    }
}

/// A loaded server module.
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleInfo {
    pub id: u32,
    pub name: String,
    pub description: Option<String>,
    pub args: Option<String>,
}

impl ModuleInfo {
    pub fn from_props(id: u32, props: &HashMap<String, String>) -> Self {
        Self {
            id,
            name: props.get("module.name").cloned().unwrap_or_default(),
            description: props
                .get("module.description")
                .or_else(|| props.get("module.usage"))
                .cloned(),
            args: props.get("module.args").cloned(),
        }
    }
}

/// Volume and mute state of a node.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NodeControls {
    pub has_volume: bool,
    pub has_mute: bool,
    /// Aggregate linear volume: the loudest channel (0.0 - 2.0, 1.0 = unity).
    pub volume: f32,
    pub muted: bool,
    pub channel_volumes: Vec<f32>,
}

impl NodeControls {
    /// Merge a parsed `Props` parameter into the controls.
    pub fn apply(&mut self, props: &PropsUpdate) {
        if let Some(ref volumes) = props.channel_volumes {
            self.has_volume = true;
            self.channel_volumes = volumes.clone();
            self.volume = volumes.iter().copied().fold(0.0, f32::max);
        } else if let Some(volume) = props.volume {
            self.has_volume = true;
            self.volume = volume;
        }
        if let Some(muted) = props.mute {
            self.has_mute = true;
            self.muted = muted;
        }
    }
}

/// Fields decoded from a node's `Props` parameter. `None` means the field
/// was absent from the update.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PropsUpdate {
    pub volume: Option<f32>,
    pub mute: Option<bool>,
    pub channel_volumes: Option<Vec<f32>>,
}

impl PropsUpdate {
    pub fn is_empty(&self) -> bool {
        self.volume.is_none() && self.mute.is_none() && self.channel_volumes.is_none()
    }
}

/// Default devices announced through the `default` metadata object.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DefaultDevices {
    pub audio_sink: Option<String>,
    pub audio_source: Option<String>,
    pub configured_audio_sink: Option<String>,
    pub configured_audio_source: Option<String>,
}

/// Graph clock settings from the `settings` metadata object.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ClockSettings {
    pub rate: Option<u32>,
    pub allowed_rates: Vec<u32>,
    pub quantum: Option<u32>,
    pub min_quantum: Option<u32>,
    pub max_quantum: Option<u32>,
    pub force_rate: Option<u32>,
    pub force_quantum: Option<u32>,
}

/// Timing of one node in a graph cycle, in nanoseconds.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NodeTiming {
    pub id: u32,
    pub name: String,
    pub status: i32,
    pub prev_signal: i64,
    pub signal: i64,
    pub awake: i64,
    pub finish: i64,
    pub xrun_count: i32,
}

impl NodeTiming {
    /// Wake-up latency (signal to awake).
    pub fn wait_ns(&self) -> i64 {
        (self.awake - self.signal).max(0)
    }

    /// Processing time (awake to finish).
    pub fn busy_ns(&self) -> i64 {
        (self.finish - self.awake).max(0)
    }
}

/// Most recent profiler sample.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProfilerSnapshot {
    pub counter: u64,
    pub cpu_load: [f32; 3],
    pub xrun_count: i32,
    pub clock_rate: u32,
    pub clock_duration: u64,
    pub driver: Option<NodeTiming>,
    pub followers: Vec<NodeTiming>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_media_class_prefix_matching() {
        assert_eq!(
            MediaClass::from_str("Stream/Output/Audio/Internal"),
            MediaClass::StreamOutputAudio
        );
        assert_eq!(MediaClass::from_str("Audio/Sink"), MediaClass::AudioSink);
        assert_eq!(
            MediaClass::from_str("Midi/Bridge"),
            MediaClass::Unknown("Midi/Bridge".into())
        );
    }

    #[test]
    fn test_node_partial_update_keeps_fields() {
        let mut node = NodeInfo::from_props(
            7,
            props(&[
                ("node.name", "alsa_output.pci"),
                ("media.class", "Audio/Sink"),
                ("audio.channels", "2"),
            ]),
        );
        node.update_from_props(props(&[("node.description", "Speakers")]));
        assert_eq!(node.name, "alsa_output.pci");
        assert_eq!(node.display_name(), "Speakers");
        assert_eq!(node.channel_count, Some(2));
        assert!(node.is_sink());
    }

    #[test]
    fn test_port_channel_prefers_label() {
        let port = PortInfo::from_props(
            3,
            &props(&[
                ("node.id", "7"),
                ("port.name", "playback_1"),
                ("port.direction", "in"),
                ("audio.channel", "FR"),
            ]),
        )
        .unwrap();
        assert_eq!(port.channel, AudioChannel::FrontRight);
        assert_eq!(port.direction, PortDirection::Input);

        let guessed = PortInfo::from_props(
            4,
            &props(&[("node.id", "7"), ("port.name", "monitor_FL"), ("port.direction", "out")]),
        )
        .unwrap();
        assert_eq!(guessed.channel, AudioChannel::FrontLeft);
        assert!(guessed.is_monitor);

        assert!(PortInfo::from_props(5, &props(&[("port.name", "x")])).is_none());
    }

    #[test]
    fn test_channel_labels() {
        assert_eq!(AudioChannel::from_label("aux12"), AudioChannel::Aux(12));
        assert_eq!(AudioChannel::Aux(12).label(), "AUX12");
        assert_eq!(AudioChannel::from_label("LFE").label(), "LFE");
        assert_eq!(AudioChannel::from_port_name("capture_MONO"), AudioChannel::Mono);
        assert_eq!(AudioChannel::from_port_name("output_0"), AudioChannel::Unknown);
    }

    #[test]
    fn test_link_requires_all_endpoints() {
        let full = props(&[
            ("link.output.node", "1"),
            ("link.output.port", "2"),
            ("link.input.node", "3"),
            ("link.input.port", "4"),
        ]);
        let link = LinkInfo::from_props(9, &full).unwrap();
        assert!(link.touches_node(3));

        let mut partial = full.clone();
        partial.remove("link.input.port");
        assert!(LinkInfo::from_props(9, &partial).is_none());
    }

    #[test]
    fn test_controls_aggregate_volume() {
        let mut controls = NodeControls::default();
        controls.apply(&PropsUpdate {
            volume: Some(1.0),
            mute: Some(true),
            channel_volumes: Some(vec![0.25, 0.5]),
        });
        assert!(controls.has_volume && controls.has_mute && controls.muted);
        assert_eq!(controls.volume, 0.5);

        controls.apply(&PropsUpdate {
            mute: Some(false),
            ..Default::default()
        });
        assert_eq!(controls.channel_volumes, vec![0.25, 0.5]);
        assert!(!controls.muted);
    }
}
