//! The multiplexer core.
//!
//! One `Mux` owns one language-server child and the set of connected
//! clients. Client requests are forwarded with freshly minted positive ids;
//! server-initiated requests go to the primary client with negative ids;
//! notifications broadcast. The first `initialize` is forwarded once and
//! its response cached for every later joiner.
//!
//! Concurrency model: one reader task per client, one reader on the
//! server's stdout, one writer task per destination. All shared state sits
//! behind a single mutex held only for non-blocking dispatch steps; sends
//! are awaited outside the lock, so a congested destination suspends the
//! reader that is feeding it and nothing else.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;

use lspmux_protocol::{Message, Notification, Request, RequestId, Response, RpcError};
use lspmux_protocol::message::JSONRPC_VERSION;
use lspmux_registry::{DiagnosticsMode, ServerSpec};
use lspmux_transport::{encode, read_message, FrameCodec};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::bridge::BridgeState;
use crate::client::{spawn_writer, ClientHandle};
use crate::server::{ExitInfo, ServerHandle};

/// Tuning knobs for a mux instance.
#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// How long the server child survives after the last client leaves.
    pub idle_shutdown: Duration,
    /// Capacity of each buffered writer, in frames. A full buffer is the
    /// congestion signal that pauses the feeding reader.
    pub write_buffer: usize,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            idle_shutdown: Duration::from_millis(500),
            write_buffer: 64,
        }
    }
}

/// Invoked exactly once when the mux shuts down.
pub type ExitCallback = Box<dyn FnOnce(ExitInfo) + Send + 'static>;

/// A message on its way out of the dispatch region. Computed under the
/// state lock, delivered after it is released.
pub(crate) enum Outgoing {
    Server(Vec<u8>),
    Client(mpsc::Sender<Vec<u8>>, Vec<u8>),
}

/// Why a bridge-internal request was issued; discriminates what to do
/// with the server's response.
pub(crate) enum InternalRequest {
    PullDiagnostics { uri: String },
}

pub(crate) enum InitState {
    NotStarted,
    InProgress {
        client: u64,
        original_id: RequestId,
        server_id: i64,
        deferred: Vec<(u64, RequestId)>,
    },
    Done {
        result: Option<Value>,
        error: Option<RpcError>,
    },
}

pub(crate) struct MuxState {
    pub(crate) clients: BTreeMap<u64, ClientHandle>,
    pub(crate) next_client_id: u64,
    pub(crate) primary: Option<u64>,
    /// Positive ids for server-bound traffic (client-origin and bridge).
    pub(crate) next_server_id: i64,
    /// Negative ids for requests forwarded to the primary client.
    pub(crate) next_forward_id: i64,
    /// server-facing id → (client id, the id the client used).
    pub(crate) pending_client: HashMap<i64, (u64, RequestId)>,
    /// server-facing id → bridge bookkeeping.
    pub(crate) pending_internal: HashMap<i64, InternalRequest>,
    /// client-facing negative id → the id the server used.
    pub(crate) pending_server: HashMap<i64, RequestId>,
    pub(crate) init: InitState,
    pub(crate) bridge: Option<BridgeState>,
    pub(crate) shutting_down: bool,
}

pub struct Mux {
    pub(crate) spec: &'static ServerSpec,
    project_root: PathBuf,
    pub(crate) config: MuxConfig,
    pub(crate) server_tx: mpsc::Sender<Vec<u8>>,
    pub(crate) state: Mutex<MuxState>,
    child: tokio::sync::Mutex<Option<tokio::process::Child>>,
    on_exit: Mutex<Option<ExitCallback>>,
    /// Self-handle for spawning timer and reader tasks from `&self`.
    weak: Weak<Mux>,
}

impl Mux {
    /// Take ownership of an already-spawned server and start routing.
    pub fn start(
        spec: &'static ServerSpec,
        project_root: PathBuf,
        server: ServerHandle,
        config: MuxConfig,
        on_exit: ExitCallback,
    ) -> Arc<Self> {
        let ServerHandle {
            stdin,
            stdout,
            child,
        } = server;
        let (server_tx, server_rx) = mpsc::channel(config.write_buffer);

        let bridge = match spec.diagnostics {
            DiagnosticsMode::PullBridge {
                debounce_ms,
                build_request,
            } => Some(BridgeState::new(
                Duration::from_millis(debounce_ms),
                build_request,
            )),
            DiagnosticsMode::Passthrough => None,
        };

        let mux = Arc::new_cyclic(|weak| Self {
            spec,
            project_root,
            config,
            server_tx,
            state: Mutex::new(MuxState {
                clients: BTreeMap::new(),
                next_client_id: 1,
                primary: None,
                next_server_id: 1,
                next_forward_id: -1,
                pending_client: HashMap::new(),
                pending_internal: HashMap::new(),
                pending_server: HashMap::new(),
                init: InitState::NotStarted,
                bridge,
                shutting_down: false,
            }),
            child: tokio::sync::Mutex::new(child),
            on_exit: Mutex::new(Some(on_exit)),
            weak: weak.clone(),
        });

        spawn_writer(stdin, server_rx);

        let reader = Arc::clone(&mux);
        tokio::spawn(async move {
            let mut stdout = stdout;
            let mut codec = FrameCodec::new();
            let kill_child = loop {
                match read_message(&mut stdout, &mut codec).await {
                    Ok(Some(message)) => reader.handle_server_message(message).await,
                    Ok(None) => {
                        info!("server closed its stdout");
                        break false;
                    }
                    Err(e) => {
                        warn!(error = %e, "server stream framing error");
                        break true;
                    }
                }
            };
            reader.shutdown(kill_child).await;
        });

        info!(server = spec.name, root = %mux.project_root.display(), "mux started");
        mux
    }

    /// Adopt an accepted client connection.
    pub fn attach_client<S>(&self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (tx, rx) = mpsc::channel(self.config.write_buffer);

        let id = {
            let mut state = self.state.lock();
            if state.shutting_down {
                debug!("rejecting client during shutdown");
                return;
            }
            let id = state.next_client_id;
            state.next_client_id += 1;
            state.clients.insert(
                id,
                ClientHandle {
                    id,
                    tx,
                    pull_diagnostics: false,
                    reader: None,
                },
            );
            id
        };

        spawn_writer(write_half, rx);

        let mux = self.shared();
        let reader = tokio::spawn(async move {
            let mut read_half = read_half;
            let mut codec = FrameCodec::new();
            loop {
                match read_message(&mut read_half, &mut codec).await {
                    Ok(Some(message)) => mux.handle_client_message(id, message).await,
                    Ok(None) => {
                        debug!(client = id, "client disconnected");
                        break;
                    }
                    Err(e) => {
                        warn!(client = id, error = %e, "client framing error");
                        break;
                    }
                }
            }
            mux.remove_client(id).await;
        });

        let mut state = self.state.lock();
        match state.clients.get_mut(&id) {
            Some(handle) => handle.reader = Some(reader),
            // Disconnected before we got back to the map.
            None => reader.abort(),
        }
        drop(state);
        info!(client = id, "client connected");
    }

    pub fn client_count(&self) -> usize {
        self.state.lock().clients.len()
    }

    /// Owned handle for spawned tasks. Always succeeds while any `&self`
    /// exists, since `&self` can only come from a live `Arc`.
    pub(crate) fn shared(&self) -> Arc<Self> {
        self.weak.upgrade().expect("mux still referenced")
    }

    // ── Client → server ──────────────────────────────────────────────────

    async fn handle_client_message(&self, client_id: u64, message: Message) {
        let actions = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if state.shutting_down {
                return;
            }
            match message {
                Message::Notification(n) => self.on_client_notification(state, client_id, n),
                Message::Request(r) => self.on_client_request(state, client_id, r),
                Message::Response(r) => on_client_response(state, client_id, r),
            }
        };
        self.deliver(actions).await;
    }

    fn on_client_notification(
        &self,
        state: &mut MuxState,
        client_id: u64,
        notification: Notification,
    ) -> Vec<Outgoing> {
        let mut actions = Vec::new();

        // Every client sends `initialized` after its (cached) initialize
        // response; the server must hear it exactly once.
        if notification.method == "initialized" && state.primary != Some(client_id) {
            debug!(client = client_id, "dropping initialized from non-primary client");
            return actions;
        }

        if state.bridge.is_some() {
            match notification.method.as_str() {
                "textDocument/didOpen" | "textDocument/didChange" | "textDocument/didSave" => {
                    if let Some(uri) = params_uri(&notification.params) {
                        self.on_file_event(state, uri);
                    }
                }
                "textDocument/didClose" => {
                    if let Some(uri) = params_uri(&notification.params) {
                        self.on_did_close(state, &uri);
                    }
                }
                _ => {}
            }
        }

        push_to_server(&mut actions, &Message::Notification(notification));
        actions
    }

    fn on_client_request(
        &self,
        state: &mut MuxState,
        client_id: u64,
        request: Request,
    ) -> Vec<Outgoing> {
        if request.method == "initialize" {
            let pull = has_pull_capability(&request.params);
            if let Some(client) = state.clients.get_mut(&client_id) {
                client.pull_diagnostics = pull;
            }
            return self.on_initialize(state, client_id, request);
        }

        let mut actions = Vec::new();
        let server_id = state.next_server_id;
        state.next_server_id += 1;
        state
            .pending_client
            .insert(server_id, (client_id, request.id.clone()));

        let mut forwarded = request;
        forwarded.id = RequestId::Number(server_id);
        push_to_server(&mut actions, &Message::Request(forwarded));
        actions
    }

    fn on_initialize(
        &self,
        state: &mut MuxState,
        client_id: u64,
        request: Request,
    ) -> Vec<Outgoing> {
        let mut actions = Vec::new();
        match &mut state.init {
            InitState::Done { result, error } => {
                let reply = Response {
                    jsonrpc: JSONRPC_VERSION.into(),
                    id: Some(request.id),
                    result: result.clone(),
                    error: error.clone(),
                };
                if let Some(client) = state.clients.get(&client_id) {
                    push_to_client(&mut actions, client, &Message::Response(reply));
                }
                debug!(client = client_id, "served cached initialize response");
            }
            InitState::InProgress { deferred, .. } => {
                deferred.push((client_id, request.id));
                debug!(client = client_id, "initialize deferred until primary completes");
            }
            InitState::NotStarted => {
                if state.primary.is_none() {
                    state.primary = Some(client_id);
                    info!(client = client_id, "designated primary client");
                }
                let params = match self.spec.prepare_initialize {
                    Some(hook) => Some(hook(request.params.unwrap_or(Value::Null))),
                    None => request.params,
                };
                let server_id = state.next_server_id;
                state.next_server_id += 1;
                state.init = InitState::InProgress {
                    client: client_id,
                    original_id: request.id,
                    server_id,
                    deferred: Vec::new(),
                };
                let forwarded = Request {
                    jsonrpc: request.jsonrpc,
                    id: RequestId::Number(server_id),
                    method: request.method,
                    params,
                };
                push_to_server(&mut actions, &Message::Request(forwarded));
                info!(client = client_id, "forwarding initialize to server");
            }
        }
        actions
    }

    // ── Server → client ──────────────────────────────────────────────────

    async fn handle_server_message(&self, message: Message) {
        let actions = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if state.shutting_down {
                return;
            }
            match message {
                Message::Notification(n) => broadcast(state, &Message::Notification(n)),
                Message::Response(r) => self.on_server_response(state, r),
                Message::Request(r) => self.on_server_request(state, r),
            }
        };
        self.deliver(actions).await;
    }

    fn on_server_response(
        &self,
        state: &mut MuxState,
        response: Response,
    ) -> Vec<Outgoing> {
        let id = match response.id.as_ref().and_then(RequestId::as_i64) {
            Some(id) => id,
            None => {
                debug!("server response with non-integer id; broadcasting");
                return broadcast(state, &Message::Response(response));
            }
        };

        let completes_init =
            matches!(&state.init, InitState::InProgress { server_id, .. } if *server_id == id);
        if completes_init {
            return self.complete_initialize(state, response);
        }

        if let Some(InternalRequest::PullDiagnostics { uri }) = state.pending_internal.remove(&id) {
            return self.on_pull_response(state, uri, response);
        }

        if let Some((client_id, original_id)) = state.pending_client.remove(&id) {
            let Some(client) = state.clients.get(&client_id) else {
                debug!(client = client_id, "response for departed client; dropping");
                return Vec::new();
            };
            let mut reply = response;
            reply.id = Some(original_id);
            let mut actions = Vec::new();
            push_to_client(&mut actions, client, &Message::Response(reply));
            return actions;
        }

        debug!(id, "response matches no pending request; broadcasting");
        broadcast(state, &Message::Response(response))
    }

    fn complete_initialize(
        &self,
        state: &mut MuxState,
        response: Response,
    ) -> Vec<Outgoing> {
        let result = response.result;
        let error = response.error;
        let make_reply = |id: RequestId| Response {
            jsonrpc: JSONRPC_VERSION.into(),
            id: Some(id),
            result: result.clone(),
            error: error.clone(),
        };

        let InitState::InProgress {
            client,
            original_id,
            deferred,
            ..
        } = std::mem::replace(
            &mut state.init,
            InitState::Done {
                result: result.clone(),
                error: error.clone(),
            },
        )
        else {
            return Vec::new();
        };

        info!(
            deferred = deferred.len(),
            "initialize completed; replying to waiting clients"
        );
        let mut actions = Vec::new();
        for (deferred_client, deferred_id) in deferred {
            if let Some(handle) = state.clients.get(&deferred_client) {
                push_to_client(&mut actions, handle, &Message::Response(make_reply(deferred_id)));
            }
        }
        if let Some(handle) = state.clients.get(&client) {
            push_to_client(&mut actions, handle, &Message::Response(make_reply(original_id)));
        }

        self.bridge_init_done(state);
        actions
    }

    fn on_server_request(
        &self,
        state: &mut MuxState,
        request: Request,
    ) -> Vec<Outgoing> {
        let mut actions = Vec::new();
        match request.method.as_str() {
            // Clients never see capability registration; the mux accepts it
            // on their behalf.
            "client/registerCapability" | "client/unregisterCapability" => {
                let reply = Response::success(request.id, Value::Null);
                push_to_server(&mut actions, &Message::Response(reply));
            }
            "workspace/configuration" => {
                let len = request
                    .params
                    .as_ref()
                    .and_then(|p| p.get("items"))
                    .and_then(Value::as_array)
                    .map(|items| items.len())
                    .unwrap_or(0);
                let reply = Response::success(request.id, Value::Array(vec![Value::Null; len]));
                push_to_server(&mut actions, &Message::Response(reply));
            }
            _ => {
                let Some(primary_id) = state.primary else {
                    debug!(method = %request.method, "server request with no clients connected");
                    let reply = Response::error(
                        Some(request.id),
                        RpcError::method_not_found("No clients connected"),
                    );
                    push_to_server(&mut actions, &Message::Response(reply));
                    return actions;
                };
                let forward_id = state.next_forward_id;
                state.next_forward_id -= 1;
                state.pending_server.insert(forward_id, request.id);
                let forwarded = Request {
                    jsonrpc: request.jsonrpc,
                    id: RequestId::Number(forward_id),
                    method: request.method,
                    params: request.params,
                };
                if let Some(primary) = state.clients.get(&primary_id) {
                    push_to_client(&mut actions, primary, &Message::Request(forwarded));
                }
            }
        }
        actions
    }

    // ── Lifecycle ────────────────────────────────────────────────────────

    async fn remove_client(&self, client_id: u64) {
        let arm_idle = {
            let mut state = self.state.lock();
            if state.clients.remove(&client_id).is_none() {
                return;
            }
            state.pending_client.retain(|_, owner| owner.0 != client_id);
            if state.primary == Some(client_id) {
                // Outstanding forwarded server-origin requests are neither
                // replayed to the new primary nor failed; a late reply from
                // any client still routes back by its negative id.
                state.primary = state.clients.keys().next().copied();
                match state.primary {
                    Some(next) => info!(client = next, "promoted new primary client"),
                    None => debug!("primary client left; no successor yet"),
                }
            }
            state.clients.is_empty() && !state.shutting_down
        };
        info!(client = client_id, "client removed");

        if arm_idle {
            info!(
                idle_ms = self.config.idle_shutdown.as_millis() as u64,
                "last client disconnected; idle shutdown armed"
            );
            let mux = self.shared();
            tokio::spawn(async move {
                tokio::time::sleep(mux.config.idle_shutdown).await;
                mux.idle_check().await;
            });
        }
    }

    async fn idle_check(&self) {
        {
            let state = self.state.lock();
            // A client that reconnected during the window cancels the
            // shutdown by having grown the set.
            if !state.clients.is_empty() || state.shutting_down {
                return;
            }
        }
        info!("idle window expired with no clients; stopping server");
        self.shutdown(true).await;
    }

    /// Tear everything down. Idempotent; fires the exit callback once.
    pub(crate) async fn shutdown(&self, kill_child: bool) {
        let clients = {
            let mut state = self.state.lock();
            if state.shutting_down {
                return;
            }
            state.shutting_down = true;
            state.primary = None;
            state.pending_client.clear();
            state.pending_internal.clear();
            state.pending_server.clear();
            std::mem::take(&mut state.clients)
        };
        for (_, client) in clients {
            client.close();
        }

        let exit = {
            let mut slot = self.child.lock().await;
            match slot.take() {
                Some(mut child) => {
                    if kill_child {
                        let _ = child.start_kill();
                    }
                    match child.wait().await {
                        Ok(status) => ExitInfo::from_status(status),
                        Err(e) => {
                            warn!(error = %e, "failed to reap server child");
                            ExitInfo::default()
                        }
                    }
                }
                None => ExitInfo::default(),
            }
        };

        info!(%exit, "mux shut down");
        let callback = self.on_exit.lock().take();
        if let Some(callback) = callback {
            callback(exit);
        }
    }

    /// Push computed messages to their writer channels. Awaiting here is
    /// the backpressure point: a full channel suspends this reader until
    /// the destination drains.
    pub(crate) async fn deliver(&self, actions: Vec<Outgoing>) {
        for action in actions {
            match action {
                Outgoing::Server(bytes) => {
                    if self.server_tx.send(bytes).await.is_err() {
                        debug!("server stdin closed; dropping message");
                    }
                }
                Outgoing::Client(tx, bytes) => {
                    // A closed receiver means the client left after dispatch.
                    let _ = tx.send(bytes).await;
                }
            }
        }
    }
}

// ── Dispatch helpers ─────────────────────────────────────────────────────

fn on_client_response(state: &mut MuxState, client_id: u64, response: Response) -> Vec<Outgoing> {
    let mut actions = Vec::new();
    let forward_id = response.id.as_ref().and_then(RequestId::as_i64);
    if let Some(forward_id) = forward_id.filter(|id| *id < 0) {
        if let Some(server_id) = state.pending_server.remove(&forward_id) {
            let mut reply = response;
            reply.id = Some(server_id);
            push_to_server(&mut actions, &Message::Response(reply));
            return actions;
        }
    }
    // A response we did not solicit cannot be routed anywhere safely.
    debug!(client = client_id, "ignoring stray response from client");
    actions
}

pub(crate) fn push_to_server(actions: &mut Vec<Outgoing>, message: &Message) {
    match encode(message) {
        Ok(bytes) => actions.push(Outgoing::Server(bytes)),
        Err(e) => warn!(error = %e, "dropping unencodable server-bound message"),
    }
}

pub(crate) fn push_to_client(actions: &mut Vec<Outgoing>, client: &ClientHandle, message: &Message) {
    match encode(message) {
        Ok(bytes) => actions.push(Outgoing::Client(client.tx.clone(), bytes)),
        Err(e) => warn!(error = %e, "dropping unencodable client-bound message"),
    }
}

pub(crate) fn broadcast(state: &MuxState, message: &Message) -> Vec<Outgoing> {
    match encode(message) {
        Ok(bytes) => state
            .clients
            .values()
            .map(|client| Outgoing::Client(client.tx.clone(), bytes.clone()))
            .collect(),
        Err(e) => {
            warn!(error = %e, "dropping unencodable broadcast");
            Vec::new()
        }
    }
}

fn params_uri(params: &Option<Value>) -> Option<String> {
    params
        .as_ref()?
        .get("textDocument")?
        .get("uri")?
        .as_str()
        .map(str::to_string)
}

fn has_pull_capability(params: &Option<Value>) -> bool {
    params
        .as_ref()
        .and_then(|p| p.get("capabilities"))
        .and_then(|c| c.get("textDocument"))
        .and_then(|t| t.get("diagnostic"))
        .is_some()
}
