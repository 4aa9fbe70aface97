// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Thread-safe mirror of the PipeWire graph.
//!
//! [`GraphStore`] owns the tables and is written only by backend events.
//! [`GraphMirror`] pairs the store with a [`GraphBackend`] and offers
//! copy-out queries plus fire-and-confirm mutators. Mutators validate
//! against the tables and return `false` when the target is unknown; a
//! `true` result only means the request left for the server.

use crate::audio::backend::{GraphBackend, GraphEvent, LinkRequest, MetadataWrite};
use crate::audio::metadata::{self, DEFAULT_METADATA, SETTINGS_METADATA};
use crate::audio::notify::{ChangeFlags, ChangeNotifier};
use crate::audio::types::{
    ClockSettings, DefaultDevices, LinkInfo, MediaClass, ModuleInfo, NodeControls, NodeInfo,
    PortDirection, PortInfo, ProfilerSnapshot, PropsUpdate,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// How long an unconfirmed link request suppresses an identical one.
pub const PENDING_TTL: Duration = Duration::from_secs(2);

/// Upper bound accepted by [`GraphMirror::set_node_volume`].
pub const MAX_VOLUME: f32 = 2.0;

#[derive(Default)]
struct GraphTables {
    nodes: HashMap<u32, NodeInfo>,
    ports: HashMap<u32, PortInfo>,
    links: HashMap<u32, LinkInfo>,
    modules: HashMap<u32, ModuleInfo>,
    controls: HashMap<u32, NodeControls>,
    /// Metadata object id -> metadata name.
    metadata: HashMap<u32, String>,
    defaults: DefaultDevices,
    clock: ClockSettings,
    profiler: Option<ProfilerSnapshot>,
    /// (output port, input port) -> time the create request was issued.
    pending_links: HashMap<(u32, u32), Instant>,
    /// Link id -> time the destroy request was issued.
    pending_unlinks: HashMap<u32, Instant>,
}

impl GraphTables {
    fn node_id_by_name(&self, name: &str) -> Option<u32> {
        self.nodes.values().find(|n| n.name == name).map(|n| n.id)
    }

    fn has_metadata(&self, name: &str) -> bool {
        self.metadata.values().any(|n| n == name)
    }

    fn apply(&mut self, event: GraphEvent) -> ChangeFlags {
        match event {
            GraphEvent::NodeAdded { id, props } => {
                let node = NodeInfo::from_props(id, props);
                debug!(
                    "Node added: {} '{}' ({})",
                    id,
                    node.display_name(),
                    node.media_class
                );
                self.nodes.insert(id, node);
                self.controls.entry(id).or_default();
                ChangeFlags::TOPOLOGY
            }
            GraphEvent::NodeInfo { id, props } => match self.nodes.get_mut(&id) {
                Some(node) => {
                    let before = node.clone();
                    node.update_from_props(props);
                    if *node != before {
                        trace!("Node {} info updated", id);
                        ChangeFlags::TOPOLOGY
                    } else {
                        ChangeFlags::NONE
                    }
                }
                None => ChangeFlags::NONE,
            },
            GraphEvent::NodeParams { id, props } => {
                if !self.nodes.contains_key(&id) {
                    return ChangeFlags::NONE;
                }
                let controls = self.controls.entry(id).or_default();
                let before = controls.clone();
                controls.apply(&props);
                if *controls != before {
                    trace!("Node {} controls: {:?}", id, controls);
                    ChangeFlags::CONTROLS
                } else {
                    ChangeFlags::NONE
                }
            }
            GraphEvent::PortAdded { id, props } => match PortInfo::from_props(id, &props) {
                Some(port) => {
                    trace!(
                        "Port added: {} '{}' on node {} ({:?})",
                        id,
                        port.name,
                        port.node_id,
                        port.direction
                    );
                    self.ports.insert(id, port);
                    ChangeFlags::TOPOLOGY
                }
                None => {
                    debug!("Ignoring port {} without owning node", id);
                    ChangeFlags::NONE
                }
            },
            GraphEvent::LinkAdded { id, props } => match LinkInfo::from_props(id, &props) {
                Some(link) => {
                    debug!(
                        "Link added: {} ({}:{} -> {}:{})",
                        id, link.output_node, link.output_port, link.input_node, link.input_port
                    );
                    self.pending_links
                        .remove(&(link.output_port, link.input_port));
                    self.links.insert(id, link);
                    ChangeFlags::TOPOLOGY
                }
                None => {
                    debug!("Ignoring link {} with incomplete endpoints", id);
                    ChangeFlags::NONE
                }
            },
            GraphEvent::LinkState { id, active } => match self.links.get_mut(&id) {
                Some(link) if link.active != active => {
                    link.active = active;
                    ChangeFlags::TOPOLOGY
                }
                _ => ChangeFlags::NONE,
            },
            GraphEvent::ModuleAdded { id, props } => {
                let module = ModuleInfo::from_props(id, &props);
                debug!("Module added: {} '{}'", id, module.name);
                self.modules.insert(id, module);
                ChangeFlags::TOPOLOGY
            }
            GraphEvent::MetadataAdded { id, name } => {
                debug!("Metadata added: {} '{}'", id, name);
                self.metadata.insert(id, name);
                ChangeFlags::METADATA
            }
            GraphEvent::MetadataProperty {
                metadata,
                key,
                value,
            } => {
                let changed = match metadata.as_str() {
                    DEFAULT_METADATA => {
                        metadata::apply_default_property(&mut self.defaults, &key, value.as_deref())
                    }
                    SETTINGS_METADATA => {
                        metadata::apply_settings_property(&mut self.clock, &key, value.as_deref())
                    }
                    _ => false,
                };
                if changed {
                    debug!("Metadata {}: {} = {:?}", metadata, key, value);
                    ChangeFlags::METADATA
                } else {
                    ChangeFlags::NONE
                }
            }
            GraphEvent::Profiler(snapshot) => {
                self.profiler = Some(snapshot);
                ChangeFlags::PROFILER
            }
            GraphEvent::GlobalRemoved { id } => self.remove(id),
            GraphEvent::Disconnected => {
                *self = Self::default();
                ChangeFlags::TOPOLOGY | ChangeFlags::CONTROLS | ChangeFlags::METADATA
            }
        }
    }

    fn remove(&mut self, id: u32) -> ChangeFlags {
        if let Some(node) = self.nodes.remove(&id) {
            debug!("Node removed: {} '{}'", id, node.name);
            self.controls.remove(&id);
            ChangeFlags::TOPOLOGY
        } else if self.ports.remove(&id).is_some() {
            trace!("Port removed: {}", id);
            ChangeFlags::TOPOLOGY
        } else if let Some(link) = self.links.remove(&id) {
            debug!("Link removed: {}", id);
            self.pending_unlinks.remove(&id);
            self.pending_links
                .remove(&(link.output_port, link.input_port));
            ChangeFlags::TOPOLOGY
        } else if self.modules.remove(&id).is_some() {
            debug!("Module removed: {}", id);
            ChangeFlags::TOPOLOGY
        } else if let Some(name) = self.metadata.remove(&id) {
            debug!("Metadata removed: {} '{}'", id, name);
            ChangeFlags::METADATA
        } else {
            ChangeFlags::NONE
        }
    }
}

/// A consistent copy of nodes, ports and links taken under one lock.
#[derive(Debug, Clone, Default)]
pub struct GraphSnapshot {
    pub nodes: Vec<NodeInfo>,
    pub ports: Vec<PortInfo>,
    pub links: Vec<LinkInfo>,
}

impl GraphSnapshot {
    pub fn node(&self, id: u32) -> Option<&NodeInfo> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn node_by_name(&self, name: &str) -> Option<&NodeInfo> {
        self.nodes.iter().find(|n| n.name == name)
    }

    pub fn port(&self, id: u32) -> Option<&PortInfo> {
        self.ports.iter().find(|p| p.id == id)
    }

    /// Non-monitor ports of a node in one direction, in channel order.
    pub fn ports_of(&self, node_id: u32, direction: PortDirection) -> Vec<&PortInfo> {
        let mut ports: Vec<&PortInfo> = self
            .ports
            .iter()
            .filter(|p| p.node_id == node_id && p.direction == direction && !p.is_monitor)
            .collect();
        ports.sort_by(|a, b| a.channel.cmp(&b.channel).then(a.id.cmp(&b.id)));
        ports
    }

    pub fn links_touching(&self, node_id: u32) -> impl Iterator<Item = &LinkInfo> {
        self.links.iter().filter(move |l| l.touches_node(node_id))
    }

    pub fn has_link(&self, output_port: u32, input_port: u32) -> bool {
        self.links
            .iter()
            .any(|l| l.output_port == output_port && l.input_port == input_port)
    }
}

/// The mirrored tables plus change notification.
pub struct GraphStore {
    tables: Mutex<GraphTables>,
    notifier: ChangeNotifier,
}

impl GraphStore {
    pub fn new(debounce: Duration) -> Self {
        Self {
            tables: Mutex::new(GraphTables::default()),
            notifier: ChangeNotifier::new(debounce),
        }
    }

    /// Apply one backend event and schedule a notification if it changed anything.
    pub fn apply(&self, event: GraphEvent) {
        let flags = self.tables.lock().apply(event);
        self.notifier.mark(flags);
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ChangeFlags> {
        self.notifier.subscribe()
    }

    /// Deliver pending notifications immediately.
    pub fn flush(&self) {
        self.notifier.flush();
    }

    pub fn pending_changes(&self) -> ChangeFlags {
        self.notifier.pending()
    }

    pub fn nodes(&self) -> Vec<NodeInfo> {
        let mut nodes: Vec<NodeInfo> = self.tables.lock().nodes.values().cloned().collect();
        nodes.sort_by_key(|n| n.id);
        nodes
    }

    pub fn ports(&self) -> Vec<PortInfo> {
        let mut ports: Vec<PortInfo> = self.tables.lock().ports.values().cloned().collect();
        ports.sort_by_key(|p| p.id);
        ports
    }

    pub fn links(&self) -> Vec<LinkInfo> {
        let mut links: Vec<LinkInfo> = self.tables.lock().links.values().cloned().collect();
        links.sort_by_key(|l| l.id);
        links
    }

    pub fn modules(&self) -> Vec<ModuleInfo> {
        let mut modules: Vec<ModuleInfo> = self.tables.lock().modules.values().cloned().collect();
        modules.sort_by_key(|m| m.id);
        modules
    }

    pub fn node(&self, id: u32) -> Option<NodeInfo> {
        self.tables.lock().nodes.get(&id).cloned()
    }

    pub fn node_by_name(&self, name: &str) -> Option<NodeInfo> {
        let tables = self.tables.lock();
        tables
            .node_id_by_name(name)
            .and_then(|id| tables.nodes.get(&id).cloned())
    }

    pub fn node_controls(&self, id: u32) -> Option<NodeControls> {
        self.tables.lock().controls.get(&id).cloned()
    }

    pub fn default_devices(&self) -> DefaultDevices {
        self.tables.lock().defaults.clone()
    }

    /// Id of the current default sink, resolved by name.
    pub fn default_audio_sink(&self) -> Option<u32> {
        let tables = self.tables.lock();
        let defaults = &tables.defaults;
        defaults
            .audio_sink
            .as_deref()
            .or(defaults.configured_audio_sink.as_deref())
            .and_then(|name| tables.node_id_by_name(name))
    }

    /// Id of the current default source, resolved by name.
    pub fn default_audio_source(&self) -> Option<u32> {
        let tables = self.tables.lock();
        let defaults = &tables.defaults;
        defaults
            .audio_source
            .as_deref()
            .or(defaults.configured_audio_source.as_deref())
            .and_then(|name| tables.node_id_by_name(name))
    }

    pub fn clock_settings(&self) -> ClockSettings {
        self.tables.lock().clock.clone()
    }

    pub fn profiler(&self) -> Option<ProfilerSnapshot> {
        self.tables.lock().profiler.clone()
    }

    pub fn snapshot(&self) -> GraphSnapshot {
        let tables = self.tables.lock();
        let mut snapshot = GraphSnapshot {
            nodes: tables.nodes.values().cloned().collect(),
            ports: tables.ports.values().cloned().collect(),
            links: tables.links.values().cloned().collect(),
        };
        drop(tables);
        snapshot.nodes.sort_by_key(|n| n.id);
        snapshot.ports.sort_by_key(|p| p.id);
        snapshot.links.sort_by_key(|l| l.id);
        snapshot
    }
}

/// Queries and fire-and-confirm mutations over a live graph.
pub struct GraphMirror {
    store: Arc<GraphStore>,
    backend: Arc<dyn GraphBackend>,
}

impl GraphMirror {
    pub fn new(store: Arc<GraphStore>, backend: Arc<dyn GraphBackend>) -> Self {
        Self { store, backend }
    }

    pub fn store(&self) -> &Arc<GraphStore> {
        &self.store
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ChangeFlags> {
        self.store.subscribe()
    }

    pub fn nodes(&self) -> Vec<NodeInfo> {
        self.store.nodes()
    }

    pub fn ports(&self) -> Vec<PortInfo> {
        self.store.ports()
    }

    pub fn links(&self) -> Vec<LinkInfo> {
        self.store.links()
    }

    pub fn modules(&self) -> Vec<ModuleInfo> {
        self.store.modules()
    }

    pub fn node(&self, id: u32) -> Option<NodeInfo> {
        self.store.node(id)
    }

    pub fn node_by_name(&self, name: &str) -> Option<NodeInfo> {
        self.store.node_by_name(name)
    }

    pub fn node_controls(&self, id: u32) -> Option<NodeControls> {
        self.store.node_controls(id)
    }

    pub fn default_audio_sink(&self) -> Option<u32> {
        self.store.default_audio_sink()
    }

    pub fn default_audio_source(&self) -> Option<u32> {
        self.store.default_audio_source()
    }

    pub fn clock_settings(&self) -> ClockSettings {
        self.store.clock_settings()
    }

    pub fn profiler(&self) -> Option<ProfilerSnapshot> {
        self.store.profiler()
    }

    pub fn snapshot(&self) -> GraphSnapshot {
        self.store.snapshot()
    }

    /// Request a link from `output_port` to `input_port`.
    ///
    /// Idempotent: an existing link, or an unconfirmed request for the same
    /// pair younger than [`PENDING_TTL`], is not requested again.
    pub fn create_link(&self, output_port: u32, input_port: u32) -> bool {
        let request = {
            let mut tables = self.store.tables.lock();
            let (Some(out), Some(inp)) =
                (tables.ports.get(&output_port), tables.ports.get(&input_port))
            else {
                debug!(
                    "create_link: unknown port(s) {} -> {}",
                    output_port, input_port
                );
                return false;
            };
            if out.direction == PortDirection::Input || inp.direction == PortDirection::Output {
                debug!(
                    "create_link: direction mismatch {} -> {}",
                    output_port, input_port
                );
                return false;
            }
            let request = LinkRequest {
                output_node: out.node_id,
                output_port,
                input_node: inp.node_id,
                input_port,
            };

            if tables
                .links
                .values()
                .any(|l| l.output_port == output_port && l.input_port == input_port)
            {
                return true;
            }
            let key = (output_port, input_port);
            if let Some(at) = tables.pending_links.get(&key) {
                if at.elapsed() < PENDING_TTL {
                    trace!("create_link: {} -> {} already pending", output_port, input_port);
                    return true;
                }
            }
            tables.pending_links.insert(key, Instant::now());
            request
        };

        debug!(
            "Requesting link {}:{} -> {}:{}",
            request.output_node, request.output_port, request.input_node, request.input_port
        );
        match self.backend.create_link(&request) {
            Ok(()) => true,
            Err(e) => {
                warn!("Link request failed: {}", e);
                self.store
                    .tables
                    .lock()
                    .pending_links
                    .remove(&(output_port, input_port));
                false
            }
        }
    }

    /// Request destruction of a link.
    pub fn destroy_link(&self, link_id: u32) -> bool {
        {
            let mut tables = self.store.tables.lock();
            if !tables.links.contains_key(&link_id) {
                debug!("destroy_link: unknown link {}", link_id);
                return false;
            }
            if let Some(at) = tables.pending_unlinks.get(&link_id) {
                if at.elapsed() < PENDING_TTL {
                    return true;
                }
            }
            tables.pending_unlinks.insert(link_id, Instant::now());
        }

        debug!("Requesting destruction of link {}", link_id);
        match self.backend.destroy_link(link_id) {
            Ok(()) => true,
            Err(e) => {
                warn!("Unlink request failed: {}", e);
                self.store.tables.lock().pending_unlinks.remove(&link_id);
                false
            }
        }
    }

    /// Set the linear volume of every channel of a node (clamped to 0..=2).
    pub fn set_node_volume(&self, node_id: u32, volume: f32) -> bool {
        let volume = if volume.is_finite() {
            volume.clamp(0.0, MAX_VOLUME)
        } else {
            return false;
        };
        let update = {
            let tables = self.store.tables.lock();
            let Some(controls) = tables.controls.get(&node_id).filter(|c| c.has_volume) else {
                debug!("set_node_volume: node {} has no volume control", node_id);
                return false;
            };
            let channels = if controls.channel_volumes.is_empty() {
                tables
                    .nodes
                    .get(&node_id)
                    .and_then(|n| n.channel_count)
                    .unwrap_or(0) as usize
            } else {
                controls.channel_volumes.len()
            };
            if channels == 0 {
                PropsUpdate {
                    volume: Some(volume),
                    ..Default::default()
                }
            } else {
                PropsUpdate {
                    channel_volumes: Some(vec![volume; channels]),
                    ..Default::default()
                }
            }
        };

        self.send_props(node_id, &update)
    }

    pub fn set_node_mute(&self, node_id: u32, muted: bool) -> bool {
        let known = self
            .store
            .tables
            .lock()
            .controls
            .get(&node_id)
            .is_some_and(|c| c.has_mute);
        if !known {
            debug!("set_node_mute: node {} has no mute control", node_id);
            return false;
        }
        self.send_props(
            node_id,
            &PropsUpdate {
                mute: Some(muted),
                ..Default::default()
            },
        )
    }

    fn send_props(&self, node_id: u32, update: &PropsUpdate) -> bool {
        match self.backend.set_node_props(node_id, update) {
            Ok(()) => true,
            Err(e) => {
                warn!("Props request for node {} failed: {}", node_id, e);
                false
            }
        }
    }

    /// Make `node_id` the configured default sink.
    pub fn set_default_audio_sink(&self, node_id: u32) -> bool {
        self.set_default_device(node_id, metadata::KEY_CONFIGURED_SINK, |class| {
            matches!(class, MediaClass::AudioSink | MediaClass::AudioDuplex)
        })
    }

    /// Make `node_id` the configured default source.
    pub fn set_default_audio_source(&self, node_id: u32) -> bool {
        self.set_default_device(node_id, metadata::KEY_CONFIGURED_SOURCE, |class| {
            matches!(
                class,
                MediaClass::AudioSource | MediaClass::AudioSink | MediaClass::AudioDuplex
            )
        })
    }

    fn set_default_device(
        &self,
        node_id: u32,
        key: &str,
        accepts: impl Fn(&MediaClass) -> bool,
    ) -> bool {
        let name = {
            let tables = self.store.tables.lock();
            if !tables.has_metadata(DEFAULT_METADATA) {
                debug!("No '{}' metadata object yet", DEFAULT_METADATA);
                return false;
            }
            match tables.nodes.get(&node_id) {
                Some(node) if accepts(&node.media_class) && !node.name.is_empty() => {
                    node.name.clone()
                }
                _ => {
                    debug!("Node {} cannot be a default for {}", node_id, key);
                    return false;
                }
            }
        };

        self.write_metadata(MetadataWrite {
            metadata: DEFAULT_METADATA.to_string(),
            key: key.to_string(),
            type_: Some(metadata::JSON_TYPE.to_string()),
            value: Some(metadata::name_value(&name)),
        })
    }

    /// Force the graph rate; 0 releases it.
    pub fn set_clock_force_rate(&self, rate: u32) -> bool {
        self.write_setting(metadata::KEY_CLOCK_FORCE_RATE, rate)
    }

    /// Force the graph quantum; 0 releases it.
    pub fn set_clock_force_quantum(&self, quantum: u32) -> bool {
        self.write_setting(metadata::KEY_CLOCK_FORCE_QUANTUM, quantum)
    }

    pub fn set_clock_min_quantum(&self, quantum: u32) -> bool {
        quantum > 0 && self.write_setting(metadata::KEY_CLOCK_MIN_QUANTUM, quantum)
    }

    pub fn set_clock_max_quantum(&self, quantum: u32) -> bool {
        quantum > 0 && self.write_setting(metadata::KEY_CLOCK_MAX_QUANTUM, quantum)
    }

    fn write_setting(&self, key: &str, value: u32) -> bool {
        if !self.store.tables.lock().has_metadata(SETTINGS_METADATA) {
            debug!("No '{}' metadata object yet", SETTINGS_METADATA);
            return false;
        }
        self.write_metadata(MetadataWrite {
            metadata: SETTINGS_METADATA.to_string(),
            key: key.to_string(),
            type_: None,
            value: Some(value.to_string()),
        })
    }

    fn write_metadata(&self, write: MetadataWrite) -> bool {
        debug!("Writing metadata {}: {} = {:?}", write.metadata, write.key, write.value);
        match self.backend.set_metadata(&write) {
            Ok(()) => true,
            Err(e) => {
                warn!("Metadata write failed: {}", e);
                false
            }
        }
    }
}
