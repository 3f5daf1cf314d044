//! PipeWire runtime thread.
//!
//! PipeWire objects are not thread-safe, so a single dedicated thread owns the
//! connection, the registry listener, the capture node and every link proxy.
//! The rest of the process talks to it through [`PipeWireRuntime::request`],
//! which sends an [`Envelope`] over a PipeWire channel and waits a bounded
//! time for the answer.

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::sync::mpsc::RecvTimeoutError;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use pipewire::context::ContextRc;
use pipewire::core::{CoreRc, PW_ID_CORE};
use pipewire::main_loop::MainLoopRc;
use pipewire::properties::properties;
use pipewire::proxy::{ProxyListener, ProxyT};
use pipewire::registry::{GlobalObject, RegistryRc};
use pipewire::spa::utils::dict::DictRef;
use pipewire::types::ObjectType;
use screenmic_core::{Node, PlannedLink};
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use crate::error::{PwError, PwResult};
use crate::factory::{Envelope, FactoryRequest, FactoryResponse, Reply};
use crate::graph::{GraphManager, GraphTable, Removed};
use crate::link::{LinkEntry, LinkRegistry};
use crate::metadata::{DEFAULT_METADATA_NAME, DEFAULT_SINK_KEY, parse_default_sink};
use crate::monitor::{EventSink, GraphEvent};
use crate::node::{CaptureNodeProps, INSTANCE_KEY, dict_to_map, link_from_props, port_from_props};

/// Error code the core reports when the server hung up.
const EPIPE: i32 = 32;

/// PipeWire runtime handle for the rest of the process.
pub struct PipeWireRuntime {
    /// Channel to send requests
    request_tx: Mutex<pipewire::channel::Sender<Envelope>>,
    /// Published graph (shared with the PipeWire thread)
    graph: Arc<GraphManager>,
    /// Bound for every request
    request_timeout: Duration,
    thread: Option<JoinHandle<()>>,
}

impl PipeWireRuntime {
    /// Spawn the PipeWire thread and wait until the initial graph is known.
    ///
    /// # Errors
    /// Returns an error if the connection fails or the initial registry
    /// roundtrip does not finish within `ready_timeout`.
    pub fn spawn(
        graph: Arc<GraphManager>,
        ready_timeout: Duration,
        request_timeout: Duration,
    ) -> PwResult<(Self, mpsc::Receiver<GraphEvent>)> {
        let (events, event_rx) = EventSink::channel(256);
        let (request_tx, request_rx) = pipewire::channel::channel();
        let (ready, ready_rx) = Reply::channel();

        let graph_clone = Arc::clone(&graph);

        let thread = std::thread::Builder::new()
            .name("pipewire-runtime".to_string())
            .spawn(move || {
                run_pipewire_thread(&graph_clone, events, request_rx, ready);
                graph_clone.set_connected(false);
            })
            .expect("Failed to spawn PipeWire runtime thread");

        let runtime = Self {
            request_tx: Mutex::new(request_tx),
            graph,
            request_timeout,
            thread: Some(thread),
        };

        match ready_rx.recv_timeout(ready_timeout) {
            Ok(FactoryResponse::Synced(version)) => {
                info!(version, "PipeWire runtime ready");
                Ok((runtime, event_rx))
            }
            Ok(FactoryResponse::Failed(e)) => Err(e),
            Ok(other) => Err(PwError::ConnectionFailed(format!("Unexpected handshake response: {other:?}"))),
            Err(RecvTimeoutError::Timeout) => {
                error!(?ready_timeout, "PipeWire runtime failed to respond, aborting");
                Err(PwError::Timeout("initial registry sync"))
            }
            Err(RecvTimeoutError::Disconnected) => {
                Err(PwError::ConnectionFailed("Runtime thread exited during startup".to_string()))
            }
        }
    }

    /// Send a request and wait for its response.
    ///
    /// # Errors
    /// Returns [`PwError::Timeout`] if the thread does not answer in time,
    /// [`PwError::Disconnected`] if it is gone, or the error it reported.
    pub fn request(&self, request: FactoryRequest) -> PwResult<FactoryResponse> {
        let what = request.label();
        let (reply, rx) = Reply::channel();

        self.request_tx
            .lock()
            .send(Envelope { request, reply: Some(reply) })
            .map_err(|_| PwError::Disconnected)?;

        match rx.recv_timeout(self.request_timeout) {
            Ok(FactoryResponse::Failed(e)) => Err(e),
            Ok(response) => Ok(response),
            Err(RecvTimeoutError::Timeout) => Err(PwError::Timeout(what)),
            Err(RecvTimeoutError::Disconnected) => Err(PwError::Disconnected),
        }
    }

    /// Get the graph manager.
    pub fn graph(&self) -> &Arc<GraphManager> {
        &self.graph
    }

    /// Request shutdown of the PipeWire thread.
    pub fn shutdown(&self) {
        let _ = self.request_tx.lock().send(Envelope { request: FactoryRequest::Shutdown, reply: None });
    }
}

impl Drop for PipeWireRuntime {
    fn drop(&mut self) {
        self.shutdown();

        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("PipeWire runtime thread panicked");
            }
        }
    }
}

/// Connected PipeWire objects.
struct Connection {
    main_loop: MainLoopRc,
    _context: ContextRc,
    core: CoreRc,
    registry: RegistryRc,
}

impl Connection {
    fn open() -> PwResult<Self> {
        let main_loop = MainLoopRc::new(None)
            .map_err(|e| PwError::MainLoopError(format!("Failed to create main loop: {e}")))?;

        let context = ContextRc::new(&main_loop, None)
            .map_err(|e| PwError::ConnectionFailed(format!("Failed to create context: {e}")))?;

        let core = context
            .connect_rc(None)
            .map_err(|e| PwError::ConnectionFailed(format!("Failed to connect: {e}")))?;

        let registry = core
            .get_registry_rc()
            .map_err(|e| PwError::RegistryError(format!("Failed to get registry: {e}")))?;

        Ok(Self { main_loop, _context: context, core, registry })
    }
}

struct BoundNode {
    _listener: pipewire::node::NodeListener,
    _proxy: pipewire::node::Node,
}

struct BoundMetadata {
    id: u32,
    _listener: pipewire::metadata::MetadataListener,
    _proxy: pipewire::metadata::Metadata,
}

/// Keeps a link alive; dropping it destroys the link.
struct LinkProxy {
    _listener: ProxyListener,
    _proxy: pipewire::link::Link,
}

struct PendingLink {
    link: PlannedLink,
    reply: Reply,
    proxy: LinkProxy,
}

struct CaptureNode {
    _listener: ProxyListener,
    _proxy: pipewire::node::Node,
    proxy_id: u32,
    global_id: Option<u32>,
    waiters: Vec<Reply>,
}

struct PendingSync {
    /// Bind counter when the sync was sent
    epoch: u64,
    waiters: Vec<Reply>,
}

/// State owned by the PipeWire thread.
struct ThreadState {
    graph: Arc<GraphManager>,
    events: EventSink,
    table: GraphTable,
    nodes: HashMap<u32, BoundNode>,
    metadata: Option<BoundMetadata>,
    capture: Option<CaptureNode>,
    links: LinkRegistry<LinkProxy>,
    pending_links: HashMap<u32, PendingLink>,
    syncs: HashMap<i32, PendingSync>,
    bind_epoch: u64,
    /// Proxies released from inside their own callbacks, freed on the next turn
    graveyard: Vec<Box<dyn Any>>,
}

impl ThreadState {
    fn new(graph: Arc<GraphManager>, events: EventSink) -> Self {
        Self {
            graph,
            events,
            table: GraphTable::new(),
            nodes: HashMap::new(),
            metadata: None,
            capture: None,
            links: LinkRegistry::new(),
            pending_links: HashMap::new(),
            syncs: HashMap::new(),
            bind_epoch: 0,
            graveyard: Vec::new(),
        }
    }

    fn bury<T: 'static>(&mut self, item: T) {
        self.graveyard.push(Box::new(item));
    }

    fn start_sync(&mut self, core: &CoreRc, waiters: Vec<Reply>) {
        match core.sync(0) {
            Ok(seq) => {
                self.syncs.insert(seq.seq(), PendingSync { epoch: self.bind_epoch, waiters });
            }
            Err(e) => {
                for waiter in waiters {
                    waiter.send(FactoryResponse::Failed(PwError::MainLoopError(format!("Sync failed: {e}"))));
                }
            }
        }
    }

    fn on_done(&mut self, core: &CoreRc, seq: i32) {
        self.graveyard.clear();

        let Some(pending) = self.syncs.remove(&seq) else {
            return;
        };

        // Info events for proxies bound after the sync was sent may still be in flight
        if pending.epoch != self.bind_epoch {
            trace!(seq, "Objects bound since sync, chaining another roundtrip");
            self.start_sync(core, pending.waiters);
            return;
        }

        let version = self.graph.publish(&self.table);
        trace!(seq, version, "Graph published");

        for waiter in pending.waiters {
            waiter.send(FactoryResponse::Synced(version));
        }
    }

    /// Handle a core error. Returns `true` when the connection is gone.
    fn on_error(&mut self, id: u32, seq: i32, res: i32, message: &str) -> bool {
        if id == PW_ID_CORE {
            if res == -EPIPE {
                error!(message, "PipeWire connection lost");
                self.disconnect();
                return true;
            }
            warn!(seq, res, message, "Core error");
            return false;
        }

        if let Some(pending) = self.pending_links.remove(&id) {
            warn!(
                output = pending.link.output_port,
                input = pending.link.input_port,
                res,
                message,
                "Link rejected"
            );
            pending.reply.send(FactoryResponse::Failed(PwError::LinkCreationFailed(message.to_string())));
            self.bury(pending.proxy);
            return false;
        }

        if self.capture.as_ref().is_some_and(|c| c.proxy_id == id && c.global_id.is_none()) {
            if let Some(mut capture) = self.capture.take() {
                error!(res, message, "Capture node rejected");
                for waiter in std::mem::take(&mut capture.waiters) {
                    waiter.send(FactoryResponse::Failed(PwError::CaptureNodeFailed(message.to_string())));
                }
                self.bury(capture);
            }
            return false;
        }

        debug!(id, seq, res, message, "Proxy error");
        false
    }

    fn disconnect(&mut self) {
        self.graph.set_connected(false);

        for (_, pending) in self.syncs.drain() {
            for waiter in pending.waiters {
                waiter.send(FactoryResponse::Failed(PwError::Disconnected));
            }
        }

        let pending: Vec<PendingLink> = self.pending_links.drain().map(|(_, p)| p).collect();
        for pending in pending {
            pending.reply.send(FactoryResponse::Failed(PwError::Disconnected));
            self.bury(pending.proxy);
        }

        if let Some(mut capture) = self.capture.take() {
            for waiter in std::mem::take(&mut capture.waiters) {
                waiter.send(FactoryResponse::Failed(PwError::Disconnected));
            }
            self.bury(capture);
        }

        let links = self.links.clear();
        if !links.is_empty() {
            warn!(count = links.len(), "Links lost with the connection");
        }
        self.bury(links);

        self.events.emit(GraphEvent::Disconnected);
    }

    fn on_global_remove(&mut self, id: u32) {
        if self.metadata.as_ref().is_some_and(|m| m.id == id) {
            info!(id, "Default metadata removed");
            self.metadata = None;
            self.set_default_sink(None);
            return;
        }

        match self.table.remove(id) {
            Removed::Node(node) => {
                self.nodes.remove(&id);

                if self.capture.as_ref().is_some_and(|c| c.global_id == Some(id)) {
                    warn!(id, "Capture node removed externally");
                    if let Some(capture) = self.capture.take() {
                        self.bury(capture);
                    }
                }

                self.events.emit(GraphEvent::NodeRemoved { id, name: node.name().to_string() });
            }
            Removed::Link(_) => {
                if let Some(handle) = self.links.find_global(id) {
                    warn!(id, handle = handle.0, "Session link removed externally");
                }
                self.events.emit(GraphEvent::LinkRemoved { id });
            }
            Removed::Port(_) | Removed::Unknown => {}
        }
    }

    fn set_default_sink(&mut self, name: Option<String>) {
        if self.table.default_sink() == name.as_deref() {
            return;
        }

        info!(sink = ?name, "Default sink changed");
        self.table.set_default_sink(name.clone());
        self.events.emit(GraphEvent::DefaultSinkChanged { name });
    }

    fn on_capture_bound(&mut self, proxy_id: u32, global_id: u32) {
        let Some(capture) = self.capture.as_mut().filter(|c| c.proxy_id == proxy_id) else {
            return;
        };

        info!(id = global_id, "Capture node created");
        capture.global_id = Some(global_id);

        for waiter in std::mem::take(&mut capture.waiters) {
            waiter.send(FactoryResponse::CaptureNode(global_id));
        }
    }

    fn on_link_bound(&mut self, proxy_id: u32, global_id: u32) {
        let Some(pending) = self.pending_links.remove(&proxy_id) else {
            return;
        };

        let handle = self.links.insert(LinkEntry { link: pending.link, global_id, payload: pending.proxy });
        debug!(id = global_id, handle = handle.0, "Link acknowledged");

        if !pending.reply.send(FactoryResponse::LinkCreated(handle)) {
            warn!(handle = handle.0, "Link request abandoned, destroying link");
            if let Some(entry) = self.links.remove(handle) {
                self.bury(entry);
            }
        }
    }

    fn ensure_capture_node(&mut self, weak: Weak<RefCell<Self>>, core: &CoreRc, props: &CaptureNodeProps, reply: Reply) {
        if let Some(capture) = &mut self.capture {
            match capture.global_id {
                Some(id) => {
                    reply.send(FactoryResponse::CaptureNode(id));
                }
                None => capture.waiters.push(reply),
            }
            return;
        }

        info!(name = %props.name, "Creating capture node");

        let channels = props.channels().to_string();
        let positions = props.position_list();
        let instance = CaptureNodeProps::instance();

        let node_props = properties! {
            "factory.name" => "support.null-audio-sink",
            "node.name" => props.name.as_str(),
            "node.description" => props.description.as_str(),
            "media.class" => "Audio/Source/Virtual",
            "audio.channels" => channels.as_str(),
            "audio.position" => positions.as_str(),
            INSTANCE_KEY => instance.as_str(),
            "object.linger" => "false",
        };

        let proxy = match core.create_object::<pipewire::node::Node>("adapter", &node_props) {
            Ok(proxy) => proxy,
            Err(e) => {
                reply.send(FactoryResponse::Failed(PwError::CaptureNodeFailed(format!("Failed to create node: {e}"))));
                return;
            }
        };

        let proxy_id = proxy.upcast_ref().id();
        let listener = proxy
            .upcast_ref()
            .add_listener_local()
            .bound(move |global_id| {
                if let Some(state) = weak.upgrade() {
                    state.borrow_mut().on_capture_bound(proxy_id, global_id);
                }
            })
            .register();

        debug!(proxy_id, "Capture node requested");

        self.capture = Some(CaptureNode {
            _listener: listener,
            _proxy: proxy,
            proxy_id,
            global_id: None,
            waiters: vec![reply],
        });
    }

    fn destroy_capture_node(&mut self, reply: Reply) {
        if let Some(mut capture) = self.capture.take() {
            info!(id = ?capture.global_id, "Destroying capture node");
            for waiter in std::mem::take(&mut capture.waiters) {
                waiter.send(FactoryResponse::Failed(PwError::CaptureNodeFailed("Destroyed before creation".into())));
            }
        }
        reply.send(FactoryResponse::CaptureNodeDestroyed);
    }

    fn create_link(&mut self, weak: Weak<RefCell<Self>>, core: &CoreRc, link: PlannedLink, reply: Reply) {
        debug!(
            output_node = link.output_node,
            output_port = link.output_port,
            input_node = link.input_node,
            input_port = link.input_port,
            "Creating link"
        );

        let output_node = link.output_node.to_string();
        let output_port = link.output_port.to_string();
        let input_node = link.input_node.to_string();
        let input_port = link.input_port.to_string();

        let link_props = properties! {
            "link.output.node" => output_node.as_str(),
            "link.output.port" => output_port.as_str(),
            "link.input.node" => input_node.as_str(),
            "link.input.port" => input_port.as_str(),
            "object.linger" => "false",
        };

        let proxy = match core.create_object::<pipewire::link::Link>("link-factory", &link_props) {
            Ok(proxy) => proxy,
            Err(e) => {
                reply.send(FactoryResponse::Failed(PwError::LinkCreationFailed(format!("Failed to create link: {e}"))));
                return;
            }
        };

        let proxy_id = proxy.upcast_ref().id();
        let listener = proxy
            .upcast_ref()
            .add_listener_local()
            .bound(move |global_id| {
                if let Some(state) = weak.upgrade() {
                    state.borrow_mut().on_link_bound(proxy_id, global_id);
                }
            })
            .register();

        self.pending_links.insert(
            proxy_id,
            PendingLink { link, reply, proxy: LinkProxy { _listener: listener, _proxy: proxy } },
        );
    }

    fn destroy_link(&mut self, handle: screenmic_core::LinkHandle, reply: Reply) {
        match self.links.remove(handle) {
            Some(entry) => {
                debug!(id = entry.global_id, handle = handle.0, "Destroying link");
                drop(entry);
                reply.send(FactoryResponse::LinkDestroyed);
            }
            None => {
                reply.send(FactoryResponse::Failed(PwError::LinkNotFound(handle.0)));
            }
        }
    }
}

fn on_global(state: &Rc<RefCell<ThreadState>>, registry: &RegistryRc, global: &GlobalObject<&DictRef>) {
    let props = global.props.map(dict_to_map).unwrap_or_default();

    match global.type_ {
        ObjectType::Node => {
            let node = Node::new(global.id, props);
            let name = node.name().to_string();
            let bound = bind_node(state, registry, global);

            let mut state = state.borrow_mut();
            debug!(id = global.id, name = %name, class = ?node.prop("media.class"), "Node added");
            state.table.add_node(node);

            if let Some(bound) = bound {
                state.nodes.insert(global.id, bound);
                state.bind_epoch += 1;
            }

            state.events.emit(GraphEvent::NodeAdded { id: global.id, name });
        }

        ObjectType::Port => match port_from_props(global.id, &props) {
            Some(port) => state.borrow_mut().table.add_port(port),
            None => warn!(id = global.id, "Port has no parent node"),
        },

        ObjectType::Link => {
            if let Some(link) = link_from_props(global.id, &props) {
                let mut state = state.borrow_mut();
                state.events.emit(GraphEvent::LinkAdded {
                    id: link.id,
                    output_node: link.output_node,
                    input_node: link.input_node,
                });
                state.table.add_link(link);
            } else {
                warn!(id = global.id, "Link without endpoints");
            }
        }

        ObjectType::Metadata => {
            if props.get("metadata.name").map(String::as_str) == Some(DEFAULT_METADATA_NAME) {
                if let Some(bound) = bind_metadata(state, registry, global) {
                    let mut state = state.borrow_mut();
                    state.metadata = Some(bound);
                    state.bind_epoch += 1;
                }
            }
        }

        _ => {}
    }
}

fn bind_node(
    state: &Rc<RefCell<ThreadState>>,
    registry: &RegistryRc,
    global: &GlobalObject<&DictRef>,
) -> Option<BoundNode> {
    let proxy = match registry.bind::<pipewire::node::Node, _>(global) {
        Ok(proxy) => proxy,
        Err(e) => {
            warn!(id = global.id, error = %e, "Failed to bind node");
            return None;
        }
    };

    let id = global.id;
    let weak = Rc::downgrade(state);
    let listener = proxy
        .add_listener_local()
        .info(move |info| {
            let Some(state) = weak.upgrade() else {
                return;
            };
            let props = info.props().map(dict_to_map);
            if !state.borrow_mut().table.update_node(id, props, info.max_output_ports()) {
                trace!(id, "Info for unknown node");
            }
        })
        .register();

    Some(BoundNode { _listener: listener, _proxy: proxy })
}

fn bind_metadata(
    state: &Rc<RefCell<ThreadState>>,
    registry: &RegistryRc,
    global: &GlobalObject<&DictRef>,
) -> Option<BoundMetadata> {
    let proxy = match registry.bind::<pipewire::metadata::Metadata, _>(global) {
        Ok(proxy) => proxy,
        Err(e) => {
            warn!(id = global.id, error = %e, "Failed to bind default metadata");
            return None;
        }
    };

    info!(id = global.id, "Found default metadata");

    let weak = Rc::downgrade(state);
    let listener = proxy
        .add_listener_local()
        .property(move |subject, key, _type, value| {
            if subject != PW_ID_CORE {
                return 0;
            }
            // A missing key clears every property
            if key.is_none() || key == Some(DEFAULT_SINK_KEY) {
                if let Some(state) = weak.upgrade() {
                    state.borrow_mut().set_default_sink(value.and_then(parse_default_sink));
                }
            }
            0
        })
        .register();

    Some(BoundMetadata { id: global.id, _listener: listener, _proxy: proxy })
}

/// Run the PipeWire thread until shutdown or connection loss.
fn run_pipewire_thread(
    graph: &Arc<GraphManager>,
    events: EventSink,
    request_rx: pipewire::channel::Receiver<Envelope>,
    ready: Reply,
) {
    pipewire::init();

    info!("PipeWire runtime starting...");

    let connection = match Connection::open() {
        Ok(connection) => connection,
        Err(e) => {
            error!(error = %e, "PipeWire runtime failed");
            ready.send(FactoryResponse::Failed(e));
            return;
        }
    };

    info!("Connected to PipeWire");

    let state = Rc::new(RefCell::new(ThreadState::new(Arc::clone(graph), events)));

    let _registry_listener = connection
        .registry
        .add_listener_local()
        .global({
            let state = Rc::clone(&state);
            let registry = connection.registry.clone();
            move |global| on_global(&state, &registry, global)
        })
        .global_remove({
            let state = Rc::clone(&state);
            move |id| state.borrow_mut().on_global_remove(id)
        })
        .register();

    let _core_listener = connection
        .core
        .add_listener_local()
        .done({
            let state = Rc::clone(&state);
            let core = connection.core.clone();
            move |id, seq| {
                if id == PW_ID_CORE {
                    state.borrow_mut().on_done(&core, seq.seq());
                }
            }
        })
        .error({
            let state = Rc::clone(&state);
            let main_loop = connection.main_loop.clone();
            move |id, seq, res, message| {
                if state.borrow_mut().on_error(id, seq, res, message) {
                    main_loop.quit();
                }
            }
        })
        .register();

    let _receiver = request_rx.attach(connection.main_loop.loop_(), {
        let state = Rc::clone(&state);
        let core = connection.core.clone();
        let main_loop = connection.main_loop.clone();
        move |envelope: Envelope| handle_request(&state, &core, &main_loop, envelope)
    });

    // The first roundtrip completes once the registry has announced every existing object
    {
        let mut state = state.borrow_mut();
        state.start_sync(&connection.core, vec![ready]);
        state.graph.set_connected(true);
        state.events.emit(GraphEvent::Connected);
    }

    info!("Starting PipeWire main loop");
    connection.main_loop.run();

    info!("PipeWire runtime exiting");
}

fn handle_request(state: &Rc<RefCell<ThreadState>>, core: &CoreRc, main_loop: &MainLoopRc, envelope: Envelope) {
    let Envelope { request, reply } = envelope;

    if matches!(request, FactoryRequest::Shutdown) {
        info!("Factory received shutdown request");
        main_loop.quit();
        return;
    }

    let Some(reply) = reply else {
        debug!(request = request.label(), "Request without reply channel ignored");
        return;
    };

    let weak = Rc::downgrade(state);
    let mut state = state.borrow_mut();
    state.graveyard.clear();

    match request {
        FactoryRequest::Sync => state.start_sync(core, vec![reply]),
        FactoryRequest::EnsureCaptureNode(props) => state.ensure_capture_node(weak, core, &props, reply),
        FactoryRequest::DestroyCaptureNode => state.destroy_capture_node(reply),
        FactoryRequest::CreateLink(link) => state.create_link(weak, core, link, reply),
        FactoryRequest::DestroyLink(handle) => state.destroy_link(handle, reply),
        FactoryRequest::Shutdown => {}
    }
}
