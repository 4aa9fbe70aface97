// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! PipeWire thread management and event handling.
//!
//! Every native object lives on the `pipewire` thread. Other threads reach
//! it only through [`PwCommand`]s sent over a `pipewire::channel`, and learn
//! about the server through [`GraphEvent`]s applied to the shared
//! [`GraphStore`].

use crate::audio::backend::{BackendError, GraphBackend, GraphEvent, LinkRequest, MetadataWrite};
use crate::audio::control::{build_props_pod, parse_props_pod};
use crate::audio::graph::GraphStore;
use crate::audio::metadata::{DEFAULT_METADATA, SETTINGS_METADATA};
use crate::audio::native_filter::NativeFilter;
use crate::audio::profiler::{ProfilerBinding, ProfilerProxy};
use crate::audio::types::PropsUpdate;
use crate::config::ConnectionConfig;
use crate::eq::filter_node::{
    FilterError, FilterHost, FilterInstance, FilterRequest, FilterShared, FilterState,
};
use parking_lot::Mutex;
use pipewire::link::{Link, LinkListener};
use pipewire::metadata::{Metadata, MetadataListener};
use pipewire::node::{Node, NodeListener};
use pipewire::properties::properties;
use pipewire::registry::GlobalObject;
use pipewire::spa::param::ParamType;
use pipewire::spa::pod::Pod;
use pipewire::spa::utils::dict::DictRef;
use pipewire::types::ObjectType;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use thiserror::Error;
use tokio::sync::mpsc as async_mpsc;
use tracing::{debug, error, info, trace, warn};

/// Core error result when the server closed the connection.
const EPIPE: i32 = 32;

#[derive(Debug, Error)]
pub enum PwError {
    #[error("Failed to create main loop: {0}")]
    LoopFailed(String),
    #[error("Failed to create context: {0}")]
    ContextFailed(String),
    #[error("Failed to connect to PipeWire: {0}")]
    ConnectionFailed(String),
    #[error("No reply from PipeWire within {0:?}")]
    HandshakeTimeout(std::time::Duration),
    #[error("PipeWire reported an error: {0}")]
    Server(String),
    #[error("PipeWire thread error: {0}")]
    ThreadError(String),
}

/// Commands sent to the PipeWire thread.
pub enum PwCommand {
    CreateLink(LinkRequest),
    DestroyLink(u32),
    SetNodeProps { node_id: u32, pod: Vec<u8> },
    SetMetadata(MetadataWrite),
    CreateFilter {
        key: u64,
        request: FilterRequest,
        shared: Arc<FilterShared>,
    },
    DestroyFilter { key: u64 },
    Shutdown,
}

/// Connection status, delivered asynchronously.
#[derive(Debug, Clone, PartialEq)]
pub enum LoopStatus {
    ConnectionChanged(bool),
    Error(String),
}

struct BoundNode {
    proxy: Node,
    _listener: NodeListener,
}

struct BoundLink {
    _proxy: Link,
    _listener: LinkListener,
}

struct BoundMetadata {
    proxy: Metadata,
    _listener: MetadataListener,
}

/// Loop-thread state. Only touched from the PipeWire thread.
struct LoopState {
    store: Arc<GraphStore>,
    nodes: HashMap<u32, BoundNode>,
    links: HashMap<u32, BoundLink>,
    metadata: HashMap<String, (u32, BoundMetadata)>,
    profiler: Option<(u32, ProfilerBinding)>,
    /// Link proxies created by us, until the registry announces them.
    created_links: HashMap<(u32, u32), Link>,
    filters: HashMap<u64, NativeFilter>,
}

impl LoopState {
    fn new(store: Arc<GraphStore>) -> Self {
        Self {
            store,
            nodes: HashMap::new(),
            links: HashMap::new(),
            metadata: HashMap::new(),
            profiler: None,
            created_links: HashMap::new(),
            filters: HashMap::new(),
        }
    }

    fn forget(&mut self, id: u32) {
        self.nodes.remove(&id);
        self.links.remove(&id);
        self.metadata.retain(|_, (meta_id, _)| *meta_id != id);
        if self.profiler.as_ref().is_some_and(|(pid, _)| *pid == id) {
            self.profiler = None;
        }
    }

    fn teardown(&mut self) {
        let filters = self.filters.len();
        self.filters.clear();
        self.created_links.clear();
        self.profiler = None;
        self.metadata.clear();
        self.links.clear();
        self.nodes.clear();
        debug!("Released {} filter(s) and all bindings", filters);
    }
}

/// Handle to the PipeWire thread. Implements both the graph backend and
/// the filter host.
pub struct EventLoopThread {
    cmd_tx: Mutex<pipewire::channel::Sender<PwCommand>>,
    connected: Arc<AtomicBool>,
    status_rx: Mutex<Option<async_mpsc::UnboundedReceiver<LoopStatus>>>,
    next_filter: AtomicU64,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl EventLoopThread {
    /// Spawn the PipeWire thread, connect and wait for the first server
    /// round-trip.
    pub fn connect(config: &ConnectionConfig, store: Arc<GraphStore>) -> Result<Self, PwError> {
        let (cmd_tx, cmd_rx) = pipewire::channel::channel::<PwCommand>();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<(), PwError>>();
        let (status_tx, status_rx) = async_mpsc::unbounded_channel();
        let connected = Arc::new(AtomicBool::new(false));

        let setup = LoopSetup {
            remote: config.remote.clone(),
            store,
            connected: connected.clone(),
            status_tx,
        };
        let handle = thread::Builder::new()
            .name("pipewire".to_string())
            .spawn(move || {
                let failure_tx = ready_tx.clone();
                if let Err(e) = run_pipewire_loop(setup, cmd_rx, ready_tx) {
                    error!("PipeWire thread error: {}", e);
                    let _ = failure_tx.send(Err(e));
                }
            })
            .map_err(|e| PwError::ThreadError(e.to_string()))?;

        let timeout = config.handshake_timeout();
        let outcome = match ready_rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(mpsc::RecvTimeoutError::Timeout) => Err(PwError::HandshakeTimeout(timeout)),
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                Err(PwError::ThreadError("Thread exited during startup".to_string()))
            }
        };

        if let Err(e) = outcome {
            let _ = cmd_tx.send(PwCommand::Shutdown);
            let _ = handle.join();
            return Err(e);
        }

        info!("Connected to PipeWire");
        Ok(Self {
            cmd_tx: Mutex::new(cmd_tx),
            connected,
            status_rx: Mutex::new(Some(status_rx)),
            next_filter: AtomicU64::new(1),
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Take the status receiver. Returns `None` after the first call.
    pub fn status_events(&self) -> Option<async_mpsc::UnboundedReceiver<LoopStatus>> {
        self.status_rx.lock().take()
    }

    fn send(&self, cmd: PwCommand) -> Result<(), BackendError> {
        if !self.is_connected() {
            return Err(BackendError::Disconnected);
        }
        self.cmd_tx
            .lock()
            .send(cmd)
            .map_err(|_| BackendError::ThreadGone)
    }

    /// Stop the loop and join the thread. Idempotent.
    pub fn shutdown(&self) {
        let _ = self.cmd_tx.lock().send(PwCommand::Shutdown);
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for EventLoopThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl GraphBackend for EventLoopThread {
    fn create_link(&self, request: &LinkRequest) -> Result<(), BackendError> {
        self.send(PwCommand::CreateLink(*request))
    }

    fn destroy_link(&self, link_id: u32) -> Result<(), BackendError> {
        self.send(PwCommand::DestroyLink(link_id))
    }

    fn set_node_props(&self, node_id: u32, props: &PropsUpdate) -> Result<(), BackendError> {
        let pod = build_props_pod(props).map_err(|e| BackendError::Request(e.to_string()))?;
        self.send(PwCommand::SetNodeProps { node_id, pod })
    }

    fn set_metadata(&self, write: &MetadataWrite) -> Result<(), BackendError> {
        self.send(PwCommand::SetMetadata(write.clone()))
    }
}

/// Caller-side handle; the filter itself lives on the loop thread.
struct NativeFilterHandle {
    key: u64,
    cmd_tx: pipewire::channel::Sender<PwCommand>,
}

impl FilterInstance for NativeFilterHandle {
    fn destroy(&mut self) {
        if self.cmd_tx.send(PwCommand::DestroyFilter { key: self.key }).is_err() {
            debug!("Filter {} outlived the PipeWire thread", self.key);
        }
    }
}

impl FilterHost for EventLoopThread {
    fn create_filter(
        &self,
        request: FilterRequest,
        shared: Arc<FilterShared>,
    ) -> Result<Box<dyn FilterInstance>, FilterError> {
        let key = self.next_filter.fetch_add(1, Ordering::Relaxed);
        self.send(PwCommand::CreateFilter {
            key,
            request,
            shared,
        })?;
        Ok(Box::new(NativeFilterHandle {
            key,
            cmd_tx: self.cmd_tx.lock().clone(),
        }))
    }
}

struct LoopSetup {
    remote: Option<String>,
    store: Arc<GraphStore>,
    connected: Arc<AtomicBool>,
    status_tx: async_mpsc::UnboundedSender<LoopStatus>,
}

fn run_pipewire_loop(
    setup: LoopSetup,
    cmd_rx: pipewire::channel::Receiver<PwCommand>,
    ready_tx: mpsc::Sender<Result<(), PwError>>,
) -> Result<(), PwError> {
    pipewire::init();

    let main_loop = pipewire::main_loop::MainLoopRc::new(None)
        .map_err(|e| PwError::LoopFailed(e.to_string()))?;

    let context = pipewire::context::ContextRc::new(&main_loop, None)
        .map_err(|e| PwError::ContextFailed(e.to_string()))?;

    let connect_props = setup
        .remote
        .as_ref()
        .map(|remote| properties! { "remote.name" => remote.as_str() });
    let core = context
        .connect_rc(connect_props)
        .map_err(|e| PwError::ConnectionFailed(e.to_string()))?;

    let registry = core
        .get_registry_rc()
        .map_err(|e| PwError::ConnectionFailed(e.to_string()))?;

    let state = Rc::new(RefCell::new(LoopState::new(setup.store.clone())));
    let ready = Rc::new(RefCell::new(Some(ready_tx)));

    let pending = core
        .sync(0)
        .map_err(|e| PwError::ConnectionFailed(e.to_string()))?;

    let _core_listener = {
        let ready_done = ready.clone();
        let ready_err = ready.clone();
        let connected_done = setup.connected.clone();
        let connected_err = setup.connected.clone();
        let status_done = setup.status_tx.clone();
        let status_err = setup.status_tx.clone();
        let store_err = setup.store.clone();
        let main_loop_weak = main_loop.downgrade();
        core.add_listener_local()
            .done(move |id, seq| {
                if id != pipewire::core::PW_ID_CORE || seq != pending {
                    return;
                }
                if let Some(tx) = ready_done.borrow_mut().take() {
                    connected_done.store(true, Ordering::Release);
                    let _ = status_done.send(LoopStatus::ConnectionChanged(true));
                    let _ = tx.send(Ok(()));
                }
            })
            .error(move |id, seq, res, message| {
                warn!("PipeWire error: id={} seq={} res={} {}", id, seq, res, message);
                if let Some(tx) = ready_err.borrow_mut().take() {
                    let _ = tx.send(Err(PwError::Server(message.to_string())));
                    if let Some(main_loop) = main_loop_weak.upgrade() {
                        main_loop.quit();
                    }
                    return;
                }
                if id == pipewire::core::PW_ID_CORE && res == -EPIPE {
                    error!("Lost connection to PipeWire");
                    connected_err.store(false, Ordering::Release);
                    store_err.apply(GraphEvent::Disconnected);
                    let _ = status_err.send(LoopStatus::ConnectionChanged(false));
                    if let Some(main_loop) = main_loop_weak.upgrade() {
                        main_loop.quit();
                    }
                } else {
                    let _ = status_err.send(LoopStatus::Error(message.to_string()));
                }
            })
            .register()
    };

    let main_loop_weak = main_loop.downgrade();
    let state_cmd = state.clone();
    let core_cmd = core.clone();
    let registry_cmd = registry.clone();
    let _cmd_receiver = cmd_rx.attach(main_loop.loop_(), move |cmd| {
        handle_command(cmd, &state_cmd, &main_loop_weak, &core_cmd, &registry_cmd);
    });

    let _registry_listener = setup_registry_listener(&registry, state.clone());

    main_loop.run();

    info!("PipeWire thread shutting down");
    state.borrow_mut().teardown();
    if setup.connected.swap(false, Ordering::AcqRel) {
        setup.store.apply(GraphEvent::Disconnected);
        let _ = setup.status_tx.send(LoopStatus::ConnectionChanged(false));
    }

    Ok(())
}

fn handle_command(
    cmd: PwCommand,
    state: &Rc<RefCell<LoopState>>,
    main_loop_weak: &pipewire::main_loop::MainLoopWeak,
    core: &pipewire::core::CoreRc,
    registry: &pipewire::registry::RegistryRc,
) {
    match cmd {
        PwCommand::Shutdown => {
            debug!("Received shutdown command");
            state.borrow_mut().teardown();
            if let Some(main_loop) = main_loop_weak.upgrade() {
                main_loop.quit();
            }
        }

        PwCommand::CreateLink(request) => {
            debug!(
                "Creating link {}:{} -> {}:{}",
                request.output_node, request.output_port, request.input_node, request.input_port
            );
            let result = core.create_object::<Link>(
                "link-factory",
                &properties! {
                    "link.output.node" => request.output_node.to_string(),
                    "link.output.port" => request.output_port.to_string(),
                    "link.input.node" => request.input_node.to_string(),
                    "link.input.port" => request.input_port.to_string(),
                    "object.linger" => "true"
                },
            );
            match result {
                Ok(link) => {
                    state
                        .borrow_mut()
                        .created_links
                        .insert((request.output_port, request.input_port), link);
                }
                Err(e) => warn!(
                    "Link creation {} -> {} failed: {}",
                    request.output_port, request.input_port, e
                ),
            }
        }

        PwCommand::DestroyLink(link_id) => {
            debug!("Destroying link {}", link_id);
            if let Err(e) = registry.destroy_global(link_id).into_result() {
                warn!("Failed to destroy link {}: {}", link_id, e);
            }
        }

        PwCommand::SetNodeProps { node_id, pod } => {
            let state = state.borrow();
            let Some(bound) = state.nodes.get(&node_id) else {
                warn!("Props write for unbound node {}", node_id);
                return;
            };
            match Pod::from_bytes(&pod) {
                Some(pod) => {
                    bound.proxy.set_param(ParamType::Props, 0, pod);
                    trace!("Props written to node {}", node_id);
                }
                None => warn!("Invalid props pod for node {}", node_id),
            }
        }

        PwCommand::SetMetadata(write) => {
            let state = state.borrow();
            match state.metadata.get(&write.metadata) {
                Some((_, bound)) => {
                    debug!(
                        "Metadata '{}': {} = {:?}",
                        write.metadata, write.key, write.value
                    );
                    bound.proxy.set_property(
                        0,
                        &write.key,
                        write.type_.as_deref(),
                        write.value.as_deref(),
                    );
                }
                None => warn!("Metadata object '{}' not bound", write.metadata),
            }
        }

        PwCommand::CreateFilter {
            key,
            request,
            shared,
        } => match NativeFilter::create(core, &request, shared.clone()) {
            Ok(filter) => {
                state.borrow_mut().filters.insert(key, filter);
            }
            Err(e) => {
                error!("Failed to create filter '{}': {}", request.name, e);
                shared.set_state(FilterState::Error(e.to_string()));
            }
        },

        PwCommand::DestroyFilter { key } => {
            // Dropped outside the borrow: destroy may re-enter callbacks.
            let filter = state.borrow_mut().filters.remove(&key);
            drop(filter);
        }
    }
}

fn dict_to_map(props: Option<&DictRef>) -> HashMap<String, String> {
    props
        .map(|p| {
            p.iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect()
        })
        .unwrap_or_default()
}

fn bind_node(
    global: &GlobalObject<&DictRef>,
    state: &Rc<RefCell<LoopState>>,
    registry: &pipewire::registry::RegistryRc,
) -> Result<(), String> {
    let node_id = global.id;
    let node: Node = registry
        .bind(global)
        .map_err(|e| format!("Failed to bind node {}: {:?}", node_id, e))?;

    let store_info = state.borrow().store.clone();
    let store_param = store_info.clone();
    let listener = node
        .add_listener_local()
        .info(move |info| {
            if let Some(props) = info.props() {
                store_info.apply(GraphEvent::NodeInfo {
                    id: node_id,
                    props: dict_to_map(Some(props)),
                });
            }
        })
        .param(move |_seq, id, _index, _next, param| {
            if id != ParamType::Props {
                return;
            }
            match param.and_then(parse_props_pod) {
                Some(props) => store_param.apply(GraphEvent::NodeParams { id: node_id, props }),
                None => trace!("Ignoring props blob from node {}", node_id),
            }
        })
        .register();
    node.subscribe_params(&[ParamType::Props]);

    state.borrow_mut().nodes.insert(
        node_id,
        BoundNode {
            proxy: node,
            _listener: listener,
        },
    );
    Ok(())
}

fn bind_link(
    global: &GlobalObject<&DictRef>,
    state: &Rc<RefCell<LoopState>>,
    registry: &pipewire::registry::RegistryRc,
) -> Result<(), String> {
    let link_id = global.id;
    let link: Link = registry
        .bind(global)
        .map_err(|e| format!("Failed to bind link {}: {:?}", link_id, e))?;

    let store = state.borrow().store.clone();
    let listener = link
        .add_listener_local()
        .info(move |info| {
            let active = matches!(info.state(), pipewire::link::LinkState::Active);
            store.apply(GraphEvent::LinkState { id: link_id, active });
        })
        .register();

    state.borrow_mut().links.insert(
        link_id,
        BoundLink {
            _proxy: link,
            _listener: listener,
        },
    );
    Ok(())
}

fn bind_metadata(
    global: &GlobalObject<&DictRef>,
    name: &str,
    state: &Rc<RefCell<LoopState>>,
    registry: &pipewire::registry::RegistryRc,
) -> Result<(), String> {
    let metadata: Metadata = registry
        .bind(global)
        .map_err(|e| format!("Failed to bind metadata '{}': {:?}", name, e))?;

    let store = state.borrow().store.clone();
    let metadata_name = name.to_string();
    let listener = metadata
        .add_listener_local()
        .property(move |subject, key, _type, value| {
            if subject == pipewire::core::PW_ID_CORE {
                if let Some(key) = key {
                    store.apply(GraphEvent::MetadataProperty {
                        metadata: metadata_name.clone(),
                        key: key.to_string(),
                        value: value.map(str::to_string),
                    });
                }
            }
            0
        })
        .register();

    state.borrow_mut().metadata.insert(
        name.to_string(),
        (
            global.id,
            BoundMetadata {
                proxy: metadata,
                _listener: listener,
            },
        ),
    );
    Ok(())
}

fn bind_profiler(
    global: &GlobalObject<&DictRef>,
    state: &Rc<RefCell<LoopState>>,
    registry: &pipewire::registry::RegistryRc,
) -> Result<(), String> {
    let proxy: ProfilerProxy = registry
        .bind(global)
        .map_err(|e| format!("Failed to bind profiler: {:?}", e))?;
    let store = state.borrow().store.clone();
    let binding = ProfilerBinding::new(proxy, move |snapshot| {
        store.apply(GraphEvent::Profiler(snapshot));
    });
    state.borrow_mut().profiler = Some((global.id, binding));
    Ok(())
}

fn setup_registry_listener(
    registry: &pipewire::registry::RegistryRc,
    state: Rc<RefCell<LoopState>>,
) -> pipewire::registry::Listener {
    let state_add = state.clone();
    let state_remove = state;
    let registry_clone = registry.clone();

    registry
        .add_listener_local()
        .global(move |global| {
            let id = global.id;
            let props = dict_to_map(global.props);
            let store = state_add.borrow().store.clone();

            let bound = match global.type_ {
                ObjectType::Node => {
                    trace!("Node added: {} {:?}", id, props.get("node.name"));
                    store.apply(GraphEvent::NodeAdded { id, props });
                    bind_node(global, &state_add, &registry_clone)
                }
                ObjectType::Port => {
                    store.apply(GraphEvent::PortAdded { id, props });
                    Ok(())
                }
                ObjectType::Link => {
                    let ports = (
                        props.get("link.output.port").and_then(|p| p.parse().ok()),
                        props.get("link.input.port").and_then(|p| p.parse().ok()),
                    );
                    if let (Some(out_port), Some(in_port)) = ports {
                        state_add
                            .borrow_mut()
                            .created_links
                            .remove(&(out_port, in_port));
                    }
                    store.apply(GraphEvent::LinkAdded { id, props });
                    bind_link(global, &state_add, &registry_clone)
                }
                ObjectType::Module => {
                    store.apply(GraphEvent::ModuleAdded { id, props });
                    Ok(())
                }
                ObjectType::Metadata => {
                    let name = props.get("metadata.name").cloned().unwrap_or_default();
                    store.apply(GraphEvent::MetadataAdded {
                        id,
                        name: name.clone(),
                    });
                    if name == DEFAULT_METADATA || name == SETTINGS_METADATA {
                        bind_metadata(global, &name, &state_add, &registry_clone)
                    } else {
                        Ok(())
                    }
                }
                ObjectType::Profiler => bind_profiler(global, &state_add, &registry_clone),
                _ => Ok(()),
            };

            if let Err(e) = bound {
                warn!("{}", e);
            }
        })
        .global_remove(move |id| {
            state_remove.borrow_mut().forget(id);
            let store = state_remove.borrow().store.clone();
            store.apply(GraphEvent::GlobalRemoved { id });
        })
        .register()
}
