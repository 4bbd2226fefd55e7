//! Pull-to-push diagnostics bridge.
//!
//! Some servers only answer `textDocument/diagnostic` pulls. For clients
//! that never ask, the bridge watches file events flowing through the mux,
//! queries the server itself under the internal id space, and republishes
//! the results as `textDocument/publishDiagnostics` to exactly the clients
//! that lack pull support.

use std::collections::HashMap;
use std::time::Duration;

use lspmux_protocol::{Message, Notification, Request, Response};
use lspmux_registry::BuildPullRequest;
use lspmux_transport::encode;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::mux::{InternalRequest, Mux, MuxState, Outgoing};

pub(crate) struct BridgeState {
    debounce: Duration,
    build_request: Option<BuildPullRequest>,
    /// Until the server finishes initializing, events only accumulate.
    init_done: bool,
    pending_init: Vec<String>,
    uris: HashMap<String, UriState>,
    /// Stamps entries so a timer armed for a closed document cannot fire
    /// into a reopened one.
    next_generation: u64,
}

struct UriState {
    generation: u64,
    /// Diagnostics last sent out, replayed on an `unchanged` reply.
    last_published: Option<Vec<Value>>,
    /// Set between sending a pull request and receiving its response.
    in_flight: bool,
    /// An event arrived mid-flight; reschedule once the response lands.
    refresh_queued: bool,
    timer_armed: bool,
}

impl UriState {
    fn new(generation: u64) -> Self {
        Self {
            generation,
            last_published: None,
            in_flight: false,
            refresh_queued: false,
            timer_armed: false,
        }
    }
}

impl BridgeState {
    pub(crate) fn new(debounce: Duration, build_request: Option<BuildPullRequest>) -> Self {
        Self {
            debounce,
            build_request,
            init_done: false,
            pending_init: Vec::new(),
            uris: HashMap::new(),
            next_generation: 0,
        }
    }
}

impl Mux {
    /// A `didOpen`/`didChange`/`didSave` passed through the mux.
    pub(crate) fn on_file_event(&self, state: &mut MuxState, uri: String) {
        let Some(bridge) = state.bridge.as_mut() else {
            return;
        };
        if !bridge.init_done {
            if !bridge.pending_init.contains(&uri) {
                bridge.pending_init.push(uri);
            }
            return;
        }
        self.schedule(bridge, uri);
    }

    /// `didClose` wipes everything the bridge knows about the document.
    pub(crate) fn on_did_close(&self, state: &mut MuxState, uri: &str) {
        let Some(bridge) = state.bridge.as_mut() else {
            return;
        };
        bridge.pending_init.retain(|pending| pending != uri);
        if bridge.uris.remove(uri).is_some() {
            debug!(uri, "cleared diagnostic state on close");
        }
    }

    /// The cached initialize response has been produced; start pulling.
    pub(crate) fn bridge_init_done(&self, state: &mut MuxState) {
        let Some(bridge) = state.bridge.as_mut() else {
            return;
        };
        if bridge.init_done {
            return;
        }
        bridge.init_done = true;
        let pending = std::mem::take(&mut bridge.pending_init);
        debug!(uris = pending.len(), "bridge active; scheduling queued documents");
        for uri in pending {
            self.schedule(bridge, uri);
        }
    }

    /// Arm the debounce timer for a URI unless one is already pending.
    fn schedule(&self, bridge: &mut BridgeState, uri: String) {
        let next_generation = &mut bridge.next_generation;
        let entry = bridge.uris.entry(uri.clone()).or_insert_with(|| {
            *next_generation += 1;
            UriState::new(*next_generation)
        });
        if entry.in_flight {
            entry.refresh_queued = true;
            return;
        }
        if entry.timer_armed {
            return;
        }
        entry.timer_armed = true;

        let generation = entry.generation;
        let debounce = bridge.debounce;
        let mux = self.shared();
        tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            mux.debounce_fired(uri, generation).await;
        });
    }

    async fn debounce_fired(&self, uri: String, generation: u64) {
        let request = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if state.shutting_down {
                return;
            }
            let any_non_pull = state.clients.values().any(|c| !c.pull_diagnostics);
            let Some(bridge) = state.bridge.as_mut() else {
                return;
            };
            let Some(entry) = bridge.uris.get_mut(&uri) else {
                return; // closed while the timer ran
            };
            if entry.generation != generation {
                return; // closed and reopened
            }
            entry.timer_armed = false;
            if !any_non_pull {
                debug!(uri = %uri, "no clients need bridged diagnostics; skipping pull");
                return;
            }
            if entry.in_flight {
                entry.refresh_queued = true;
                return;
            }

            let params = match bridge.build_request {
                Some(build) => build(&uri),
                None => default_pull_params(&uri),
            };
            let server_id = state.next_server_id;
            state.next_server_id += 1;
            let request = Request::new(server_id, "textDocument/diagnostic", Some(params));
            match encode(&Message::Request(request)) {
                Ok(bytes) => {
                    entry.in_flight = true;
                    state
                        .pending_internal
                        .insert(server_id, InternalRequest::PullDiagnostics { uri: uri.clone() });
                    bytes
                }
                Err(e) => {
                    warn!(error = %e, "dropping unencodable pull request");
                    return;
                }
            }
        };
        if self.server_tx.send(request).await.is_err() {
            debug!("server stdin closed; pull request dropped");
        }
    }

    /// A response to a bridge-issued `textDocument/diagnostic` request.
    pub(crate) fn on_pull_response(
        &self,
        state: &mut MuxState,
        uri: String,
        response: Response,
    ) -> Vec<Outgoing> {
        let published = {
            let Some(bridge) = state.bridge.as_mut() else {
                return Vec::new();
            };
            let Some(entry) = bridge.uris.get_mut(&uri) else {
                debug!(uri = %uri, "pull response for closed document; dropping");
                return Vec::new();
            };
            entry.in_flight = false;

            let result = response.result.unwrap_or(Value::Null);
            let items = match result.get("kind").and_then(Value::as_str) {
                // `unchanged` replays what we last told the clients.
                Some("unchanged") => entry.last_published.clone().unwrap_or_default(),
                _ => result
                    .get("items")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default(),
            };
            entry.last_published = Some(items.clone());
            let reschedule = std::mem::take(&mut entry.refresh_queued);
            (items, reschedule)
        };
        let (items, reschedule) = published;

        let mut actions = Vec::new();
        let notification = Notification::new(
            "textDocument/publishDiagnostics",
            Some(json!({ "uri": uri.clone(), "diagnostics": items })),
        );
        match encode(&Message::Notification(notification)) {
            Ok(bytes) => {
                for client in state.clients.values().filter(|c| !c.pull_diagnostics) {
                    actions.push(Outgoing::Client(client.tx.clone(), bytes.clone()));
                }
            }
            Err(e) => warn!(error = %e, "dropping unencodable publish notification"),
        }

        if reschedule {
            if let Some(bridge) = state.bridge.as_mut() {
                self.schedule(bridge, uri);
            }
        }
        actions
    }
}

fn default_pull_params(uri: &str) -> Value {
    json!({
        "textDocument": { "uri": uri },
        "identifier": null,
        "previousResultId": null,
    })
}
