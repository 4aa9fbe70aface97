// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Keeps EQ filter nodes spliced into the graph.
//!
//! [`EqReconciler::reconcile_all`] converges the graph towards "every node
//! whose stored preset is enabled has its audio flowing through a filter
//! node" in four passes:
//!
//! 1. drop EQs whose target vanished, restoring the links they displaced;
//! 2. create filters for enabled targets that have none;
//! 3. refresh every EQ (target id, preset, failure, disable);
//! 4. wire filter and target together and reroute foreign links through
//!    the filter, remembering each displaced link once.
//!
//! Every step is idempotent; a pass over an unchanged graph issues no
//! requests.

use crate::audio::graph::{GraphMirror, GraphSnapshot};
use crate::audio::types::{LinkInfo, MediaClass, PortDirection};
use crate::config::{ConfigError, EqConfig, PresetStore};
use crate::eq::filter_node::{BiquadFilterNode, FilterError, FilterHost, FilterState};
use crate::eq::layout::{self, TargetRole};
use eqsplice_dsp::EqPreset;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

#[derive(Debug, Error)]
pub enum EqError {
    #[error("Preset store error: {0}")]
    Store(#[from] ConfigError),
    #[error("Filter error: {0}")]
    Filter(#[from] FilterError),
}

/// Reconciler tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconcilerSettings {
    pub node_prefix: String,
    /// Used until the server negotiates a format.
    pub sample_rate: u32,
    pub filter_retry: Duration,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self::from(&EqConfig::default())
    }
}

impl From<&EqConfig> for ReconcilerSettings {
    fn from(config: &EqConfig) -> Self {
        Self {
            node_prefix: config.node_prefix.clone(),
            sample_rate: config.sample_rate,
            filter_retry: Duration::from_secs(config.filter_retry_secs),
        }
    }
}

/// A link displaced by an EQ, replayed when the EQ goes away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SavedLink {
    pub output_node: u32,
    pub output_port: u32,
    pub input_node: u32,
    pub input_port: u32,
}

impl SavedLink {
    pub fn key(&self) -> String {
        format!(
            "{}:{}->{}:{}",
            self.output_node, self.output_port, self.input_node, self.input_port
        )
    }
}

impl From<&LinkInfo> for SavedLink {
    fn from(link: &LinkInfo) -> Self {
        Self {
            output_node: link.output_node,
            output_port: link.output_port,
            input_node: link.input_node,
            input_port: link.input_port,
        }
    }
}

/// One EQ'd target.
struct ActiveEq {
    target_id: u32,
    media_class: MediaClass,
    role: TargetRole,
    preset: EqPreset,
    filter: Option<BiquadFilterNode>,
    saved_links: BTreeMap<String, SavedLink>,
}

#[derive(Default)]
struct ReconcilerState {
    active: HashMap<String, ActiveEq>,
    /// Target name -> time its filter last failed.
    failures: HashMap<String, Instant>,
}

pub struct EqReconciler {
    mirror: Arc<GraphMirror>,
    host: Arc<dyn FilterHost>,
    store: Arc<dyn PresetStore>,
    settings: ReconcilerSettings,
    state: Mutex<ReconcilerState>,
}

impl EqReconciler {
    pub fn new(
        mirror: Arc<GraphMirror>,
        host: Arc<dyn FilterHost>,
        store: Arc<dyn PresetStore>,
        settings: ReconcilerSettings,
    ) -> Self {
        Self {
            mirror,
            host,
            store,
            settings,
            state: Mutex::new(ReconcilerState::default()),
        }
    }

    /// Stored preset for a node, or a disabled flat preset.
    pub fn preset_for_node_name(&self, node_name: &str) -> EqPreset {
        match self.store.load(node_name) {
            Ok(Some(preset)) => preset,
            Ok(None) => EqPreset::flat(),
            Err(e) => {
                warn!("Failed to load EQ preset for '{}': {}", node_name, e);
                EqPreset::flat()
            }
        }
    }

    /// Persist a preset, push it to a live filter and reconcile.
    pub fn set_preset_for_node_name(
        &self,
        node_name: &str,
        preset: EqPreset,
    ) -> Result<(), EqError> {
        self.store.save(node_name, &preset)?;
        info!(
            "EQ preset for '{}' set to '{}' ({})",
            node_name,
            preset.name,
            if preset.enabled { "enabled" } else { "disabled" }
        );
        {
            let mut state = self.state.lock();
            if let Some(eq) = state.active.get_mut(node_name) {
                if preset.enabled && eq.preset != preset {
                    if let Some(ref filter) = eq.filter {
                        filter.set_preset(&preset);
                    }
                    eq.preset = preset;
                }
            }
        }
        self.reconcile_all();
        Ok(())
    }

    /// Names of targets that currently have an EQ, sorted.
    pub fn active_targets(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.lock().active.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn filter_node_id(&self, node_name: &str) -> Option<u32> {
        self.state
            .lock()
            .active
            .get(node_name)
            .and_then(|eq| eq.filter.as_ref())
            .and_then(|f| f.node_id())
    }

    pub fn filter_state(&self, node_name: &str) -> Option<FilterState> {
        self.state
            .lock()
            .active
            .get(node_name)
            .and_then(|eq| eq.filter.as_ref())
            .map(|f| f.state())
    }

    pub fn saved_links(&self, node_name: &str) -> Vec<SavedLink> {
        self.state
            .lock()
            .active
            .get(node_name)
            .map(|eq| eq.saved_links.values().copied().collect())
            .unwrap_or_default()
    }

    fn is_own_filter(&self, node_name: &str) -> bool {
        node_name.starts_with(&self.settings.node_prefix)
    }

    fn initial_sample_rate(&self) -> u32 {
        self.mirror
            .clock_settings()
            .rate
            .filter(|&r| r > 0)
            .unwrap_or(self.settings.sample_rate)
    }

    /// Run the four reconciliation steps once.
    pub fn reconcile_all(&self) {
        let mut state = self.state.lock();
        let snapshot = self.mirror.snapshot();

        // 1. Targets that vanished.
        let vanished: Vec<String> = state
            .active
            .keys()
            .filter(|name| snapshot.node_by_name(name).is_none())
            .cloned()
            .collect();
        for name in vanished {
            if let Some(mut eq) = state.active.remove(&name) {
                info!("EQ target '{}' disappeared", name);
                self.deactivate(&name, &mut eq);
            }
        }

        // 2. Enabled targets without a filter.
        for node in &snapshot.nodes {
            let Some(role) = TargetRole::for_class(&node.media_class) else {
                continue;
            };
            if node.name.is_empty()
                || self.is_own_filter(&node.name)
                || state.active.contains_key(&node.name)
            {
                continue;
            }
            let preset = self.preset_for_node_name(&node.name);
            if !preset.enabled {
                continue;
            }
            if let Some(failed_at) = state.failures.get(&node.name) {
                if failed_at.elapsed() < self.settings.filter_retry {
                    trace!("Filter for '{}' failed recently, waiting", node.name);
                    continue;
                }
            }
            let Some(port_layout) = layout::compute_layout(&snapshot, node, role) else {
                debug!("EQ target '{}' has no ports yet", node.name);
                continue;
            };

            let filter_name = format!("{}{}", self.settings.node_prefix, node.name);
            let description = format!("EQ: {}", node.display_name());
            match BiquadFilterNode::create(
                self.host.as_ref(),
                &filter_name,
                &description,
                port_layout,
                &preset,
                self.initial_sample_rate(),
            ) {
                Ok(filter) => {
                    info!("EQ activated for '{}' ({})", node.name, node.media_class);
                    state.failures.remove(&node.name);
                    state.active.insert(
                        node.name.clone(),
                        ActiveEq {
                            target_id: node.id,
                            media_class: node.media_class.clone(),
                            role,
                            preset,
                            filter: Some(filter),
                            saved_links: BTreeMap::new(),
                        },
                    );
                }
                Err(e) => {
                    warn!("Failed to create EQ filter for '{}': {}", node.name, e);
                    state.failures.insert(node.name.clone(), Instant::now());
                }
            }
        }

        // 3. Refresh what remains.
        let names: Vec<String> = state.active.keys().cloned().collect();
        for name in names {
            let Some(node) = snapshot.node_by_name(&name) else {
                continue;
            };
            let preset = self.preset_for_node_name(&name);
            let role = TargetRole::for_class(&node.media_class);

            let Some(eq) = state.active.get_mut(&name) else {
                continue;
            };
            if eq.target_id != node.id {
                debug!("EQ target '{}' is now node {}", name, node.id);
                eq.target_id = node.id;
            }
            eq.media_class = node.media_class.clone();

            let failure = eq.filter.as_ref().and_then(|f| f.last_error());
            // Ports not visible yet keep the current layout.
            let layout_changed = role
                .and_then(|role| layout::compute_layout(&snapshot, node, role))
                .zip(eq.filter.as_ref())
                .is_some_and(|(wanted, filter)| wanted.as_slice() != filter.layout());
            let drop_reason = match (role, failure) {
                (_, Some(error)) => Some(format!("filter failed: {}", error)),
                (None, _) => Some(format!("media class is now {}", node.media_class)),
                (Some(_), None) if !preset.enabled => Some("preset disabled".to_string()),
                (Some(_), None) if layout_changed => Some("channel layout changed".to_string()),
                (Some(role), None) => {
                    eq.role = role;
                    if eq.preset != preset {
                        debug!("Pushing updated preset to EQ for '{}'", name);
                        if let Some(ref filter) = eq.filter {
                            filter.set_preset(&preset);
                        }
                        eq.preset = preset;
                    }
                    None
                }
            };

            if let Some(reason) = drop_reason {
                info!("Deactivating EQ for '{}': {}", name, reason);
                let failed = eq.filter.as_ref().is_some_and(|f| f.last_error().is_some());
                if let Some(mut eq) = state.active.remove(&name) {
                    self.deactivate(&name, &mut eq);
                }
                if failed {
                    state.failures.insert(name, Instant::now());
                }
            }
        }

        // 4. Wiring, against the graph as it is after steps 1-3.
        let snapshot = self.mirror.snapshot();
        for (name, eq) in state.active.iter_mut() {
            self.wire(name, eq, &snapshot);
        }
    }

    /// Remove every EQ, restoring displaced links.
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        let active: Vec<(String, ActiveEq)> = state.active.drain().collect();
        for (name, mut eq) in active {
            self.deactivate(&name, &mut eq);
        }
        state.failures.clear();
    }

    /// Unwire the filter, replay displaced links and destroy the filter.
    fn deactivate(&self, name: &str, eq: &mut ActiveEq) {
        let snapshot = self.mirror.snapshot();
        if let Some(filter_id) = eq.filter.as_ref().and_then(|f| resolve_filter_id(f, &snapshot)) {
            for link in snapshot.links_touching(filter_id) {
                self.mirror.destroy_link(link.id);
            }
        }

        let mut restored = 0;
        for saved in eq.saved_links.values() {
            if self.mirror.create_link(saved.output_port, saved.input_port) {
                restored += 1;
            } else {
                debug!("Cannot restore link {} for '{}'", saved.key(), name);
            }
        }
        if !eq.saved_links.is_empty() {
            info!(
                "Restored {}/{} link(s) for '{}'",
                restored,
                eq.saved_links.len(),
                name
            );
        }
        eq.saved_links.clear();

        if let Some(mut filter) = eq.filter.take() {
            filter.destroy();
        }
    }

    fn wire(&self, name: &str, eq: &mut ActiveEq, snapshot: &GraphSnapshot) {
        // Links whose endpoints are gone can never be restored.
        let before = eq.saved_links.len();
        eq.saved_links.retain(|_, saved| {
            snapshot.port(saved.output_port).is_some() && snapshot.port(saved.input_port).is_some()
        });
        if eq.saved_links.len() != before {
            debug!(
                "Dropped {} stale saved link(s) for '{}'",
                before - eq.saved_links.len(),
                name
            );
        }

        let Some(filter) = eq.filter.as_ref() else {
            return;
        };
        let Some(filter_id) = resolve_filter_id(filter, snapshot) else {
            trace!("Filter for '{}' has no node id yet", name);
            return;
        };
        if snapshot.node(filter_id).is_none() {
            trace!("Filter node {} for '{}' not visible yet", filter_id, name);
            return;
        }

        let filter_port = |direction: PortDirection, port_name: &str| {
            snapshot
                .ports
                .iter()
                .find(|p| p.node_id == filter_id && p.direction == direction && p.name == port_name)
                .map(|p| p.id)
        };

        let target_ports = snapshot.ports_of(eq.target_id, eq.role.target_direction());
        for (target_port, index) in layout::match_target_ports(&target_ports, filter.layout()) {
            let port_layout = &filter.layout()[index];
            let (Some(filter_in), Some(filter_out)) = (
                filter_port(PortDirection::Input, &port_layout.input_port_name()),
                filter_port(PortDirection::Output, &port_layout.output_port_name()),
            ) else {
                trace!("Filter ports for {} not visible yet", port_layout.label);
                continue;
            };

            match eq.role {
                TargetRole::SinkLike => {
                    self.mirror.create_link(filter_out, target_port.id);
                    let foreign = snapshot
                        .links
                        .iter()
                        .filter(|l| l.input_port == target_port.id && l.output_node != filter_id);
                    for link in foreign {
                        remember(name, &mut eq.saved_links, link);
                        self.mirror.destroy_link(link.id);
                        self.mirror.create_link(link.output_port, filter_in);
                    }
                }
                TargetRole::SourceLike => {
                    self.mirror.create_link(target_port.id, filter_in);
                    let foreign = snapshot
                        .links
                        .iter()
                        .filter(|l| l.output_port == target_port.id && l.input_node != filter_id);
                    for link in foreign {
                        remember(name, &mut eq.saved_links, link);
                        self.mirror.destroy_link(link.id);
                        self.mirror.create_link(filter_out, link.input_port);
                    }
                }
            }
        }
    }
}

/// Node id of a filter: the one reported by the host, else the registry
/// node carrying its name.
fn resolve_filter_id(filter: &BiquadFilterNode, snapshot: &GraphSnapshot) -> Option<u32> {
    filter
        .node_id()
        .or_else(|| snapshot.node_by_name(filter.name()).map(|node| node.id))
}

fn remember(name: &str, saved_links: &mut BTreeMap<String, SavedLink>, link: &LinkInfo) {
    let saved = SavedLink::from(link);
    let key = saved.key();
    if !saved_links.contains_key(&key) {
        debug!("Saving link {} displaced by EQ for '{}'", key, name);
        saved_links.insert(key, saved);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryPresetStore;
    use crate::testing::{FakeOp, FakeServer};
    use std::collections::BTreeSet;

    struct Fixture {
        server: Arc<FakeServer>,
        store: Arc<MemoryPresetStore>,
        reconciler: EqReconciler,
    }

    fn fixture() -> Fixture {
        let server = FakeServer::new();
        let store = Arc::new(MemoryPresetStore::new());
        let reconciler = EqReconciler::new(
            server.mirror(),
            server.clone(),
            store.clone(),
            ReconcilerSettings::default(),
        );
        Fixture {
            server,
            store,
            reconciler,
        }
    }

    fn port_pairs(server: &FakeServer) -> BTreeSet<(u32, u32)> {
        server
            .store()
            .links()
            .iter()
            .map(|l| (l.output_port, l.input_port))
            .collect()
    }

    fn enable(store: &MemoryPresetStore, name: &str) {
        store
            .save(name, &EqPreset::flat().with_enabled(true))
            .unwrap();
    }

    #[test]
    fn test_sink_scenario_insert_and_restore() {
        let f = fixture();
        let sink = f.server.add_node("sink.A", "Audio/Sink", &["FL", "FR"]);
        let app = f.server.add_node("app.X", "Stream/Output/Audio", &["FL", "FR"]);
        for ch in ["FL", "FR"] {
            f.server.add_link(
                f.server.port(app, PortDirection::Output, ch),
                f.server.port(sink, PortDirection::Input, ch),
            );
        }
        let original = port_pairs(&f.server);

        f.reconciler
            .set_preset_for_node_name("sink.A", EqPreset::flat().with_enabled(true))
            .unwrap();

        let filter = f.reconciler.filter_node_id("sink.A").unwrap();
        let snapshot = f.server.store().snapshot();
        assert_eq!(snapshot.ports.iter().filter(|p| p.node_id == filter).count(), 4);

        // app.X -> filter -> sink.A, nothing direct.
        for ch in ["FL", "FR"] {
            let app_out = f.server.port(app, PortDirection::Output, ch);
            let sink_in = f.server.port(sink, PortDirection::Input, ch);
            let filter_in = f.server.port(filter, PortDirection::Input, ch);
            let filter_out = f.server.port(filter, PortDirection::Output, ch);
            assert!(snapshot.has_link(app_out, filter_in));
            assert!(snapshot.has_link(filter_out, sink_in));
            assert!(!snapshot.has_link(app_out, sink_in));
        }
        assert_eq!(f.reconciler.saved_links("sink.A").len(), 2);

        f.reconciler
            .set_preset_for_node_name("sink.A", EqPreset::flat())
            .unwrap();
        assert!(f.reconciler.active_targets().is_empty());
        assert!(f.server.store().node(filter).is_none());
        assert_eq!(port_pairs(&f.server), original);
    }

    #[test]
    fn test_reconcile_is_idempotent() {
        let f = fixture();
        let sink = f.server.add_node("sink.A", "Audio/Sink", &["FL", "FR"]);
        let app = f.server.add_node("app.X", "Stream/Output/Audio", &["FL", "FR"]);
        for ch in ["FL", "FR"] {
            f.server.add_link(
                f.server.port(app, PortDirection::Output, ch),
                f.server.port(sink, PortDirection::Input, ch),
            );
        }
        enable(&f.store, "sink.A");

        f.reconciler.reconcile_all();
        let ops_after_first = f.server.ops().len();
        assert!(ops_after_first > 0);

        f.reconciler.reconcile_all();
        f.reconciler.reconcile_all();
        assert_eq!(f.server.ops().len(), ops_after_first);
        assert_eq!(f.reconciler.saved_links("sink.A").len(), 2);
    }

    #[test]
    fn test_idempotent_while_links_unconfirmed() {
        let f = fixture();
        let sink = f.server.add_node("sink.A", "Audio/Sink", &["FL"]);
        let app = f.server.add_node("app.X", "Stream/Output/Audio", &["FL"]);
        f.server.add_link(
            f.server.port(app, PortDirection::Output, "FL"),
            f.server.port(sink, PortDirection::Input, "FL"),
        );
        enable(&f.store, "sink.A");

        f.server.set_auto_confirm(false);
        f.reconciler.reconcile_all();
        let ops = f.server.ops().len();
        f.reconciler.reconcile_all();
        assert_eq!(f.server.ops().len(), ops);
        assert_eq!(f.reconciler.saved_links("sink.A").len(), 1);
    }

    #[test]
    fn test_source_target_feeds_filter() {
        let f = fixture();
        let mic = f.server.add_node("mic.B", "Audio/Source", &["MONO"]);
        let rec = f.server.add_node("recorder", "Stream/Input/Audio", &["MONO"]);
        let mic_out = f.server.port(mic, PortDirection::Output, "MONO");
        let rec_in = f.server.port(rec, PortDirection::Input, "MONO");
        f.server.add_link(mic_out, rec_in);
        let original = port_pairs(&f.server);

        enable(&f.store, "mic.B");
        f.reconciler.reconcile_all();

        let filter = f.reconciler.filter_node_id("mic.B").unwrap();
        let snapshot = f.server.store().snapshot();
        assert!(snapshot.has_link(mic_out, f.server.port(filter, PortDirection::Input, "MONO")));
        assert!(snapshot.has_link(f.server.port(filter, PortDirection::Output, "MONO"), rec_in));
        assert!(!snapshot.has_link(mic_out, rec_in));

        f.reconciler.shutdown();
        assert_eq!(port_pairs(&f.server), original);
    }

    #[test]
    fn test_vanished_target_restores_surviving_links() {
        let f = fixture();
        let sink = f.server.add_node("sink.A", "Audio/Sink", &["FL"]);
        let app = f.server.add_node("app.X", "Stream/Output/Audio", &["FL"]);
        f.server.add_link(
            f.server.port(app, PortDirection::Output, "FL"),
            f.server.port(sink, PortDirection::Input, "FL"),
        );
        enable(&f.store, "sink.A");
        f.reconciler.reconcile_all();
        let filter = f.reconciler.filter_node_id("sink.A").unwrap();

        f.server.remove_node(sink);
        f.reconciler.reconcile_all();

        assert!(f.reconciler.active_targets().is_empty());
        assert!(f.server.store().node(filter).is_none());
        // The saved link pointed at the vanished sink and cannot be replayed.
        assert!(f.server.store().links().is_empty());
    }

    #[test]
    fn test_recreated_target_keeps_filter_and_rewires() {
        let f = fixture();
        let sink = f.server.add_node("sink.A", "Audio/Sink", &["FL", "FR"]);
        enable(&f.store, "sink.A");
        f.reconciler.reconcile_all();
        let filter = f.reconciler.filter_node_id("sink.A").unwrap();

        f.server.remove_node(sink);
        let recreated = f.server.add_node("sink.A", "Audio/Sink", &["FL", "FR"]);
        f.reconciler.reconcile_all();

        assert_eq!(f.reconciler.filter_node_id("sink.A"), Some(filter));
        let snapshot = f.server.store().snapshot();
        for ch in ["FL", "FR"] {
            assert!(snapshot.has_link(
                f.server.port(filter, PortDirection::Output, ch),
                f.server.port(recreated, PortDirection::Input, ch),
            ));
        }
    }

    #[test]
    fn test_recreated_target_with_new_channels_gets_new_filter() {
        let f = fixture();
        let sink = f.server.add_node("sink.A", "Audio/Sink", &["FL", "FR"]);
        enable(&f.store, "sink.A");
        f.reconciler.reconcile_all();
        let old_filter = f.reconciler.filter_node_id("sink.A").unwrap();

        f.server.remove_node(sink);
        let channels = ["FL", "FR", "FC"];
        let sink = f.server.add_node("sink.A", "Audio/Sink", &channels);
        let app = f.server.add_node("app.X", "Stream/Output/Audio", &channels);
        for ch in channels {
            f.server.add_link(
                f.server.port(app, PortDirection::Output, ch),
                f.server.port(sink, PortDirection::Input, ch),
            );
        }
        f.reconciler.reconcile_all();
        f.reconciler.reconcile_all();

        let filter = f.reconciler.filter_node_id("sink.A").unwrap();
        assert_ne!(filter, old_filter);
        assert!(f.server.store().node(old_filter).is_none());
        let snapshot = f.server.store().snapshot();
        for ch in channels {
            let app_out = f.server.port(app, PortDirection::Output, ch);
            let sink_in = f.server.port(sink, PortDirection::Input, ch);
            assert!(!snapshot.has_link(app_out, sink_in));
            assert!(snapshot.has_link(app_out, f.server.port(filter, PortDirection::Input, ch)));
            assert!(snapshot.has_link(f.server.port(filter, PortDirection::Output, ch), sink_in));
        }
    }

    #[test]
    fn test_saved_links_of_vanished_streams_are_dropped() {
        let f = fixture();
        let sink = f.server.add_node("sink.A", "Audio/Sink", &["FL"]);
        let sink_in = f.server.port(sink, PortDirection::Input, "FL");
        let keep = f.server.add_node("app.keep", "Stream/Output/Audio", &["FL"]);
        let keep_out = f.server.port(keep, PortDirection::Output, "FL");
        f.server.add_link(keep_out, sink_in);
        enable(&f.store, "sink.A");
        f.reconciler.reconcile_all();

        for i in 0..5 {
            let app = f.server.add_node(&format!("app.{}", i), "Stream/Output/Audio", &["FL"]);
            f.server
                .add_link(f.server.port(app, PortDirection::Output, "FL"), sink_in);
            f.reconciler.reconcile_all();
            assert_eq!(f.reconciler.saved_links("sink.A").len(), 2);
            f.server.remove_node(app);
            f.reconciler.reconcile_all();
        }

        let saved = f.reconciler.saved_links("sink.A");
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].output_port, keep_out);

        f.reconciler.shutdown();
        assert_eq!(port_pairs(&f.server), BTreeSet::from([(keep_out, sink_in)]));
    }

    #[test]
    fn test_wires_filter_found_by_name_before_host_reports_id() {
        let f = fixture();
        f.server.set_silent_filters(true);
        let sink = f.server.add_node("sink.A", "Audio/Sink", &["FL"]);
        let app = f.server.add_node("app.X", "Stream/Output/Audio", &["FL"]);
        let app_out = f.server.port(app, PortDirection::Output, "FL");
        let sink_in = f.server.port(sink, PortDirection::Input, "FL");
        f.server.add_link(app_out, sink_in);
        let original = port_pairs(&f.server);
        enable(&f.store, "sink.A");

        f.reconciler.reconcile_all();
        assert_eq!(f.reconciler.filter_node_id("sink.A"), None);

        let snapshot = f.server.store().snapshot();
        let filter = snapshot.node_by_name("eqsplice.eq.sink.A").unwrap().id;
        assert!(snapshot.has_link(app_out, f.server.port(filter, PortDirection::Input, "FL")));
        assert!(snapshot.has_link(f.server.port(filter, PortDirection::Output, "FL"), sink_in));
        assert!(!snapshot.has_link(app_out, sink_in));

        f.reconciler.shutdown();
        assert_eq!(port_pairs(&f.server), original);
    }

    #[test]
    fn test_disabled_and_own_nodes_are_ignored() {
        let f = fixture();
        f.server.add_node("sink.A", "Audio/Sink", &["FL"]);
        f.server.add_node("eqsplice.eq.sink.B", "Audio/Sink", &["FL"]);
        f.server.add_node("midi", "Midi/Bridge", &["FL"]);
        enable(&f.store, "eqsplice.eq.sink.B");
        enable(&f.store, "midi");
        f.store.save("sink.A", &EqPreset::bass_boost().with_enabled(false)).unwrap();

        f.reconciler.reconcile_all();
        assert!(f.reconciler.active_targets().is_empty());
        assert!(f
            .server
            .ops()
            .iter()
            .all(|op| !matches!(op, FakeOp::CreateFilter(_))));
    }

    #[test]
    fn test_target_without_ports_waits() {
        let f = fixture();
        let sink = f.server.add_node("sink.A", "Audio/Sink", &[]);
        enable(&f.store, "sink.A");
        f.reconciler.reconcile_all();
        assert!(f.reconciler.active_targets().is_empty());

        f.server.add_port(sink, PortDirection::Input, "FL");
        f.reconciler.reconcile_all();
        assert_eq!(f.reconciler.active_targets(), vec!["sink.A".to_string()]);
    }

    #[test]
    fn test_failed_filter_is_retried_after_backoff() {
        let server = FakeServer::new();
        let store = Arc::new(MemoryPresetStore::new());
        let reconciler = EqReconciler::new(
            server.mirror(),
            server.clone(),
            store.clone(),
            ReconcilerSettings {
                filter_retry: Duration::from_millis(50),
                ..Default::default()
            },
        );
        server.add_node("sink.A", "Audio/Sink", &["FL"]);
        enable(&store, "sink.A");

        server.set_fail_filters(true);
        reconciler.reconcile_all();
        reconciler.reconcile_all();
        assert!(reconciler.active_targets().is_empty());
        assert_eq!(
            server.count_ops(|op| matches!(op, FakeOp::CreateFilter(_))),
            1
        );

        server.set_fail_filters(false);
        std::thread::sleep(Duration::from_millis(80));
        reconciler.reconcile_all();
        assert_eq!(reconciler.active_targets(), vec!["sink.A".to_string()]);
    }

    #[test]
    fn test_filter_error_drops_active_eq() {
        let f = fixture();
        f.server.add_node("sink.A", "Audio/Sink", &["FL"]);
        enable(&f.store, "sink.A");
        f.reconciler.reconcile_all();

        f.server.fail_running_filters("format rejected");
        f.reconciler.reconcile_all();
        assert!(f.reconciler.active_targets().is_empty());
    }

    #[test]
    fn test_preset_change_is_pushed() {
        let f = fixture();
        f.server.add_node("sink.A", "Audio/Sink", &["FL"]);
        enable(&f.store, "sink.A");
        f.reconciler.reconcile_all();

        let boosted = EqPreset::bass_boost();
        f.reconciler
            .set_preset_for_node_name("sink.A", boosted.clone())
            .unwrap();
        assert_eq!(f.reconciler.preset_for_node_name("sink.A"), boosted);
        let pushed = f.server.filter_preset("eqsplice.eq.sink.A").unwrap();
        assert_eq!(pushed, boosted);
    }

    #[test]
    fn test_chained_app_and_sink_eq() {
        let f = fixture();
        let sink = f.server.add_node("sink.A", "Audio/Sink", &["FL"]);
        let app = f.server.add_node("app.X", "Stream/Output/Audio", &["FL"]);
        let app_out = f.server.port(app, PortDirection::Output, "FL");
        let sink_in = f.server.port(sink, PortDirection::Input, "FL");
        f.server.add_link(app_out, sink_in);
        let original = port_pairs(&f.server);

        enable(&f.store, "sink.A");
        enable(&f.store, "app.X");
        f.reconciler.reconcile_all();
        f.reconciler.reconcile_all();

        let app_filter = f.reconciler.filter_node_id("app.X").unwrap();
        let sink_filter = f.reconciler.filter_node_id("sink.A").unwrap();
        let snapshot = f.server.store().snapshot();
        assert!(snapshot.has_link(
            f.server.port(app_filter, PortDirection::Output, "FL"),
            f.server.port(sink_filter, PortDirection::Input, "FL"),
        ));
        assert!(!snapshot.has_link(app_out, sink_in));

        // Converged: further passes issue nothing.
        let ops = f.server.ops().len();
        f.reconciler.reconcile_all();
        assert_eq!(f.server.ops().len(), ops);

        f.reconciler.shutdown();
        assert_eq!(port_pairs(&f.server), original);
    }
}
