// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! In-process stand-in for the PipeWire server used by unit tests.
//!
//! Requests are recorded and, like the real server, confirmed by feeding
//! registry events back into the [`GraphStore`], except that confirmation
//! happens synchronously inside the request.

use crate::audio::backend::{BackendError, GraphBackend, GraphEvent, LinkRequest, MetadataWrite};
use crate::audio::graph::{GraphMirror, GraphStore};
use crate::audio::types::{AudioChannel, MediaClass, PortDirection, PropsUpdate};
use crate::eq::filter_node::{
    FilterError, FilterHost, FilterInstance, FilterRequest, FilterShared, FilterState,
};
use crate::eq::layout::INTERLEAVED_LABEL;
use eqsplice_dsp::EqPreset;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum FakeOp {
    CreateLink(LinkRequest),
    DestroyLink(u32),
    SetProps(u32, PropsUpdate),
    SetMetadata(MetadataWrite),
    CreateFilter(String),
    DestroyFilter(String),
}

pub(crate) struct FakeServer {
    this: Weak<FakeServer>,
    store: Arc<GraphStore>,
    next_id: AtomicU32,
    auto_confirm: AtomicBool,
    fail_filters: AtomicBool,
    silent_filters: AtomicBool,
    ops: Mutex<Vec<FakeOp>>,
    filters: Mutex<HashMap<u32, Arc<FilterShared>>>,
}

fn props(pairs: &[(&str, String)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

impl FakeServer {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            // Long window: tests flush explicitly.
            store: Arc::new(GraphStore::new(Duration::from_secs(60))),
            next_id: AtomicU32::new(30),
            auto_confirm: AtomicBool::new(true),
            fail_filters: AtomicBool::new(false),
            silent_filters: AtomicBool::new(false),
            ops: Mutex::new(Vec::new()),
            filters: Mutex::new(HashMap::new()),
        })
    }

    pub fn store(&self) -> Arc<GraphStore> {
        self.store.clone()
    }

    pub fn mirror(self: &Arc<Self>) -> Arc<GraphMirror> {
        Arc::new(GraphMirror::new(self.store.clone(), self.clone()))
    }

    fn alloc_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn record(&self, op: FakeOp) {
        self.ops.lock().push(op);
    }

    pub fn ops(&self) -> Vec<FakeOp> {
        self.ops.lock().clone()
    }

    pub fn count_ops(&self, pred: impl Fn(&FakeOp) -> bool) -> usize {
        self.ops.lock().iter().filter(|op| pred(op)).count()
    }

    pub fn set_auto_confirm(&self, confirm: bool) {
        self.auto_confirm.store(confirm, Ordering::Relaxed);
    }

    pub fn set_fail_filters(&self, fail: bool) {
        self.fail_filters.store(fail, Ordering::Relaxed);
    }

    /// Announce new filters in the registry without reporting their state
    /// or node id through the shared block.
    pub fn set_silent_filters(&self, silent: bool) {
        self.silent_filters.store(silent, Ordering::Relaxed);
    }

    /// Report a runtime error on every live filter.
    pub fn fail_running_filters(&self, message: &str) {
        for shared in self.filters.lock().values() {
            shared.set_state(FilterState::Error(message.to_string()));
        }
    }

    /// Preset currently loaded into the DSP of the named filter.
    pub fn filter_preset(&self, name: &str) -> Option<EqPreset> {
        self.filters
            .lock()
            .values()
            .find(|s| s.name() == name)
            .map(|s| s.with_dsp(|dsp| dsp.preset().clone()))
    }

    /// Announce a node plus one port per channel label, shaped like the
    /// real thing for its media class.
    pub fn add_node(&self, name: &str, media_class: &str, channels: &[&str]) -> u32 {
        let id = self.alloc_id();
        self.store.apply(GraphEvent::NodeAdded {
            id,
            props: props(&[
                ("node.name", name.to_string()),
                ("media.class", media_class.to_string()),
                ("audio.channels", channels.len().to_string()),
                ("audio.position", channels.join(",")),
            ]),
        });

        for &ch in channels {
            let ports: &[(PortDirection, &str, bool)] = match MediaClass::from_str(media_class) {
                MediaClass::AudioSink => &[
                    (PortDirection::Input, "playback", false),
                    (PortDirection::Output, "monitor", true),
                ],
                MediaClass::AudioSource => &[(PortDirection::Output, "capture", false)],
                MediaClass::StreamInputAudio => &[(PortDirection::Input, "input", false)],
                _ => &[(PortDirection::Output, "output", false)],
            };
            for &(direction, prefix, monitor) in ports {
                let name = format!("{}_{}", prefix, ch);
                self.add_port_named(id, direction, &name, Some(ch), monitor);
            }
        }
        id
    }

    pub fn add_port(&self, node_id: u32, direction: PortDirection, label: &str) -> u32 {
        let prefix = match direction {
            PortDirection::Input => "playback",
            _ => "capture",
        };
        let name = format!("{}_{}", prefix, label);
        self.add_port_named(node_id, direction, &name, Some(label), false)
    }

    fn add_port_named(
        &self,
        node_id: u32,
        direction: PortDirection,
        name: &str,
        channel: Option<&str>,
        monitor: bool,
    ) -> u32 {
        let id = self.alloc_id();
        let mut pairs = vec![
            ("node.id", node_id.to_string()),
            ("port.name", name.to_string()),
            (
                "port.direction",
                match direction {
                    PortDirection::Input => "in",
                    _ => "out",
                }
                .to_string(),
            ),
            ("port.monitor", monitor.to_string()),
            ("format.dsp", "32 bit float mono audio".to_string()),
        ];
        if let Some(ch) = channel {
            pairs.push(("audio.channel", ch.to_string()));
        }
        self.store.apply(GraphEvent::PortAdded {
            id,
            props: props(&pairs),
        });
        id
    }

    pub fn add_link(&self, output_port: u32, input_port: u32) -> u32 {
        let node_of = |port: u32| {
            self.store
                .ports()
                .into_iter()
                .find(|p| p.id == port)
                .map(|p| p.node_id)
        };
        let id = self.alloc_id();
        self.store.apply(GraphEvent::LinkAdded {
            id,
            props: props(&[
                ("link.output.node", node_of(output_port).unwrap_or(0).to_string()),
                ("link.output.port", output_port.to_string()),
                ("link.input.node", node_of(input_port).unwrap_or(0).to_string()),
                ("link.input.port", input_port.to_string()),
            ]),
        });
        id
    }

    pub fn add_metadata(&self, name: &str) -> u32 {
        let id = self.alloc_id();
        self.store.apply(GraphEvent::MetadataAdded {
            id,
            name: name.to_string(),
        });
        id
    }

    /// Remove a node the way the server does: links first, then ports.
    pub fn remove_node(&self, node_id: u32) {
        for link in self.store.links() {
            if link.touches_node(node_id) {
                self.store.apply(GraphEvent::GlobalRemoved { id: link.id });
            }
        }
        for port in self.store.ports() {
            if port.node_id == node_id {
                self.store.apply(GraphEvent::GlobalRemoved { id: port.id });
            }
        }
        self.store.apply(GraphEvent::GlobalRemoved { id: node_id });
    }

    /// Id of a node's non-monitor port carrying `label`.
    pub fn port(&self, node_id: u32, direction: PortDirection, label: &str) -> u32 {
        let channel = AudioChannel::from_label(label);
        self.store
            .ports()
            .into_iter()
            .find(|p| {
                p.node_id == node_id
                    && p.direction == direction
                    && !p.is_monitor
                    && p.channel == channel
            })
            .map(|p| p.id)
            .unwrap_or_else(|| panic!("node {} has no {:?} port {}", node_id, direction, label))
    }
}

impl GraphBackend for FakeServer {
    fn create_link(&self, request: &LinkRequest) -> Result<(), BackendError> {
        self.record(FakeOp::CreateLink(*request));
        if self.auto_confirm.load(Ordering::Relaxed) {
            let id = self.alloc_id();
            self.store.apply(GraphEvent::LinkAdded {
                id,
                props: props(&[
                    ("link.output.node", request.output_node.to_string()),
                    ("link.output.port", request.output_port.to_string()),
                    ("link.input.node", request.input_node.to_string()),
                    ("link.input.port", request.input_port.to_string()),
                ]),
            });
        }
        Ok(())
    }

    fn destroy_link(&self, link_id: u32) -> Result<(), BackendError> {
        self.record(FakeOp::DestroyLink(link_id));
        if self.auto_confirm.load(Ordering::Relaxed) {
            self.store.apply(GraphEvent::GlobalRemoved { id: link_id });
        }
        Ok(())
    }

    fn set_node_props(&self, node_id: u32, props: &PropsUpdate) -> Result<(), BackendError> {
        self.record(FakeOp::SetProps(node_id, props.clone()));
        self.store.apply(GraphEvent::NodeParams {
            id: node_id,
            props: props.clone(),
        });
        Ok(())
    }

    fn set_metadata(&self, write: &MetadataWrite) -> Result<(), BackendError> {
        self.record(FakeOp::SetMetadata(write.clone()));
        self.store.apply(GraphEvent::MetadataProperty {
            metadata: write.metadata.clone(),
            key: write.key.clone(),
            value: write.value.clone(),
        });
        Ok(())
    }
}

struct FakeFilter {
    server: Weak<FakeServer>,
    name: String,
    node_id: u32,
}

impl FilterInstance for FakeFilter {
    fn destroy(&mut self) {
        if let Some(server) = self.server.upgrade() {
            server.record(FakeOp::DestroyFilter(self.name.clone()));
            server.filters.lock().remove(&self.node_id);
            server.remove_node(self.node_id);
        }
    }
}

impl FilterHost for FakeServer {
    fn create_filter(
        &self,
        request: FilterRequest,
        shared: Arc<FilterShared>,
    ) -> Result<Box<dyn FilterInstance>, FilterError> {
        self.record(FakeOp::CreateFilter(request.name.clone()));
        if self.fail_filters.load(Ordering::Relaxed) {
            return Err(FilterError::CreateFailed("simulated failure".to_string()));
        }

        let id = self.alloc_id();
        self.store.apply(GraphEvent::NodeAdded {
            id,
            props: props(&[
                ("node.name", request.name.clone()),
                ("node.description", request.description.clone()),
                ("media.type", "Audio".to_string()),
                ("media.category", "Filter".to_string()),
            ]),
        });
        for port in &request.layout {
            let channel = (port.label != INTERLEAVED_LABEL).then_some(port.label.as_str());
            let (input, output) = (port.input_port_name(), port.output_port_name());
            self.add_port_named(id, PortDirection::Input, &input, channel, false);
            self.add_port_named(id, PortDirection::Output, &output, channel, false);
        }

        if !self.silent_filters.load(Ordering::Relaxed) {
            shared.set_node_id(id);
            shared.set_sample_rate(request.sample_rate);
            shared.set_state(FilterState::Paused);
            shared.set_state(FilterState::Streaming);
        }
        self.filters.lock().insert(id, shared);

        Ok(Box::new(FakeFilter {
            server: self.this.clone(),
            name: request.name,
            node_id: id,
        }))
    }
}
