use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

use netlens_core::record::{ErrorData, RequestRecord, ResponseData, TimingData};
use netlens_core::wire::{
    self, ClientCommand, RequestCompletePayload, RequestErrorPayload, RequestStartPayload,
    RequestTimingPayload,
};
use netlens_core::{Envelope, RequestId, WireEvent};
use netlens_store::RequestStore;

use crate::client::{ClientId, ClientRegistry};
use crate::hub::HubEvent;

/// Bridge lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BridgeState {
    Stopped,
    Active,
    Paused,
}

/// A lifecycle emit deferred while paused. Replayed in FIFO order on resume:
/// the store mutation and the broadcast both happen at flush time.
enum CachedEmit {
    Start(RequestRecord),
    Complete(RequestId, ResponseData),
    Error(RequestId, ErrorData),
    Timing(RequestId, TimingData),
    Trace(Value),
}

struct BridgeInner {
    state: BridgeState,
    cache: Vec<CachedEmit>,
}

/// Translates capture lifecycle calls into store mutations and viewer
/// broadcasts, and owns the global pause/resume switch. Any viewer's
/// control message affects every viewer's stream.
pub struct EventBridge {
    store: Arc<RequestStore>,
    registry: Arc<ClientRegistry>,
    inner: Mutex<BridgeInner>,
}

impl EventBridge {
    pub fn new(store: Arc<RequestStore>, registry: Arc<ClientRegistry>) -> Self {
        Self {
            store,
            registry,
            inner: Mutex::new(BridgeInner {
                state: BridgeState::Stopped,
                cache: Vec::new(),
            }),
        }
    }

    pub fn state(&self) -> BridgeState {
        self.inner.lock().state
    }

    /// Begin forwarding lifecycle events. Idempotent; does not resume a
    /// paused bridge.
    pub fn start(&self) {
        let mut inner = self.inner.lock();
        if inner.state == BridgeState::Stopped {
            inner.state = BridgeState::Active;
        }
    }

    /// Stop forwarding and discard any cached events. Idempotent.
    pub fn stop(&self) {
        let mut inner = self.inner.lock();
        inner.state = BridgeState::Stopped;
        inner.cache.clear();
    }

    /// Suspend the stream. The pause notice goes out immediately and is
    /// itself never cached. Idempotent.
    pub fn pause(&self) {
        let mut inner = self.inner.lock();
        if inner.state != BridgeState::Active {
            return;
        }
        inner.state = BridgeState::Paused;
        self.broadcast(WireEvent::ControlPause);
    }

    /// Reactivate the stream: flush cached events in their original
    /// emission order (applying each store mutation as it goes out), then
    /// announce the resume. Idempotent.
    pub fn resume(&self) {
        let mut inner = self.inner.lock();
        if inner.state != BridgeState::Paused {
            return;
        }
        inner.state = BridgeState::Active;
        let cached = std::mem::take(&mut inner.cache);
        for emit in cached {
            self.apply(emit);
        }
        self.broadcast(WireEvent::ControlResume);
    }

    /// Empty the store, discard cached events, and tell viewers.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.cache.clear();
        self.store.clear();
        self.broadcast(WireEvent::RequestsClear);
        drop(inner);
        tracing::debug!("captured requests cleared");
    }

    /// Record a newly issued request.
    pub fn emit_request_start(&self, record: RequestRecord) {
        self.emit(CachedEmit::Start(record));
    }

    /// Settle a request with its response.
    pub fn emit_request_complete(&self, id: RequestId, response: ResponseData) {
        self.emit(CachedEmit::Complete(id, response));
    }

    /// Settle a request with a failure.
    pub fn emit_request_error(&self, id: RequestId, error: ErrorData) {
        self.emit(CachedEmit::Error(id, error));
    }

    /// Attach phase timings to a request.
    pub fn emit_timing(&self, id: RequestId, timing: TimingData) {
        self.emit(CachedEmit::Timing(id, timing));
    }

    /// Pass an opaque trace payload through to viewers.
    pub fn emit_trace(&self, payload: Value) {
        self.emit(CachedEmit::Trace(payload));
    }

    fn emit(&self, emit: CachedEmit) {
        let mut inner = self.inner.lock();
        match inner.state {
            BridgeState::Stopped => {}
            BridgeState::Paused => inner.cache.push(emit),
            // apply never takes the inner lock
            BridgeState::Active => self.apply(emit),
        }
    }

    fn apply(&self, emit: CachedEmit) {
        let max_body = self.store.config().max_body_size;
        match emit {
            CachedEmit::Start(mut record) => {
                record.cap_body(max_body);
                self.store.add(record.clone());
                self.broadcast(WireEvent::RequestStart(RequestStartPayload::from(&record)));
            }
            CachedEmit::Complete(id, mut response) => {
                response.cap_body(max_body);
                self.store.update_response(&id, response.clone());
                self.broadcast(WireEvent::RequestComplete(RequestCompletePayload {
                    id,
                    response,
                }));
            }
            CachedEmit::Error(id, error) => {
                self.store.update_error(&id, error.clone());
                self.broadcast(WireEvent::RequestError(RequestErrorPayload { id, error }));
            }
            CachedEmit::Timing(id, timing) => {
                self.store.update_timing(&id, timing.clone());
                self.broadcast(WireEvent::RequestTiming(RequestTimingPayload { id, timing }));
            }
            CachedEmit::Trace(payload) => {
                self.broadcast(WireEvent::ServerTrace(payload));
            }
        }
    }

    fn broadcast(&self, event: WireEvent) {
        if let Some(json) = Envelope::now(event).encode() {
            self.registry.broadcast_all(&json);
        }
    }

    /// Send the full capture snapshot to one newly connected viewer. Other
    /// viewers are unaffected.
    pub fn handle_client_connect(&self, client_id: &ClientId) {
        let snapshot = self.store.get_all();
        tracing::debug!(client_id = %client_id, requests = snapshot.len(), "sending initial snapshot");
        if let Some(json) = Envelope::now(WireEvent::RequestsInitial(snapshot)).encode() {
            self.registry.send_to(client_id, json);
        }
    }

    /// Apply a control message sent by any viewer. Malformed or unknown
    /// input is ignored and the connection stays open.
    pub fn handle_client_message(&self, client_id: &ClientId, raw: &str) {
        match wire::decode_client_message(raw) {
            Some(ClientCommand::Pause) => self.pause(),
            Some(ClientCommand::Resume) => self.resume(),
            Some(ClientCommand::Clear) => self.clear(),
            None => {
                tracing::debug!(client_id = %client_id, "ignoring unrecognized viewer message");
            }
        }
    }

    /// Consume hub events until the channel closes. Spawn this on the
    /// runtime next to the hub.
    pub async fn run(self: Arc<Self>, mut events: mpsc::Receiver<HubEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                HubEvent::Connected(id) => self.handle_client_connect(&id),
                HubEvent::Message(id, raw) => self.handle_client_message(&id, &raw),
                HubEvent::Disconnected(id) => {
                    tracing::debug!(client_id = %id, "viewer disconnected");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netlens_store::StoreConfig;
    use serde_json::json;
    use tokio::sync::mpsc::Receiver;

    fn setup() -> (Arc<RequestStore>, Arc<ClientRegistry>, EventBridge) {
        let store = Arc::new(RequestStore::new(StoreConfig {
            capacity: 50,
            max_body_size: 100,
        }));
        let registry = Arc::new(ClientRegistry::new(64));
        let bridge = EventBridge::new(Arc::clone(&store), Arc::clone(&registry));
        (store, registry, bridge)
    }

    fn drain(rx: &mut Receiver<String>) -> Vec<serde_json::Value> {
        let mut out = Vec::new();
        while let Ok(raw) = rx.try_recv() {
            out.push(serde_json::from_str(&raw).unwrap());
        }
        out
    }

    fn record(url: &str) -> RequestRecord {
        RequestRecord::new(url, "GET")
    }

    #[test]
    fn stopped_bridge_ignores_emits() {
        let (store, registry, bridge) = setup();
        let (_id, mut rx) = registry.register();

        bridge.emit_request_start(record("https://a.dev"));
        bridge.emit_request_error(RequestId::from_raw("req_x"), ErrorData::new("E", "e"));

        assert!(store.is_empty());
        assert!(drain(&mut rx).is_empty());
        assert_eq!(bridge.state(), BridgeState::Stopped);
    }

    #[test]
    fn active_emit_stores_and_broadcasts() {
        let (store, registry, bridge) = setup();
        let (_id, mut rx) = registry.register();
        bridge.start();

        let r = record("https://api.example.com/users");
        let rid = r.id.clone();
        bridge.emit_request_start(r);
        bridge.emit_request_complete(rid.clone(), ResponseData::new(201, "Created"));

        let stored = store.get(&rid).unwrap();
        assert_eq!(stored.response.as_ref().unwrap().status_code, 201);

        let messages = drain(&mut rx);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["type"], "request:start");
        assert_eq!(messages[0]["payload"]["url"], "https://api.example.com/users");
        assert_eq!(messages[1]["type"], "request:complete");
        assert_eq!(messages[1]["payload"]["statusCode"], 201);
    }

    #[test]
    fn start_is_idempotent_and_does_not_resume() {
        let (_store, _registry, bridge) = setup();
        bridge.start();
        bridge.start();
        assert_eq!(bridge.state(), BridgeState::Active);

        bridge.pause();
        bridge.start();
        assert_eq!(bridge.state(), BridgeState::Paused);
    }

    #[test]
    fn pause_broadcasts_immediately_and_only_once() {
        let (_store, registry, bridge) = setup();
        let (_id, mut rx) = registry.register();
        bridge.start();

        bridge.pause();
        bridge.pause();

        let messages = drain(&mut rx);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["type"], "control:pause");
    }

    #[test]
    fn paused_emits_are_cached_then_flushed_in_order() {
        let (store, registry, bridge) = setup();
        let (_id, mut rx) = registry.register();
        bridge.start();
        bridge.pause();
        drain(&mut rx); // discard the pause notice

        let a = record("https://a.dev");
        let a_id = a.id.clone();
        let b = record("https://b.dev");
        bridge.emit_request_start(a);
        bridge.emit_request_start(b);
        bridge.emit_request_complete(a_id.clone(), ResponseData::new(200, "OK"));

        // nothing visible while paused
        assert!(store.is_empty());
        assert!(drain(&mut rx).is_empty());

        bridge.resume();

        let messages = drain(&mut rx);
        let types: Vec<&str> = messages.iter().map(|m| m["type"].as_str().unwrap()).collect();
        assert_eq!(
            types,
            vec!["request:start", "request:start", "request:complete", "control:resume"]
        );
        assert_eq!(messages[0]["payload"]["url"], "https://a.dev");
        assert_eq!(messages[1]["payload"]["url"], "https://b.dev");

        // mutations applied at flush time
        assert_eq!(store.len(), 2);
        assert!(store.get(&a_id).unwrap().response.is_some());
    }

    #[test]
    fn resume_without_pause_is_a_noop() {
        let (_store, registry, bridge) = setup();
        let (_id, mut rx) = registry.register();
        bridge.start();

        bridge.resume();
        assert!(drain(&mut rx).is_empty());
        assert_eq!(bridge.state(), BridgeState::Active);
    }

    #[test]
    fn clear_discards_cache_even_while_paused() {
        let (store, registry, bridge) = setup();
        let (_id, mut rx) = registry.register();
        bridge.start();
        bridge.emit_request_start(record("https://kept.dev"));
        bridge.pause();
        bridge.emit_request_start(record("https://cached.dev"));
        drain(&mut rx);

        bridge.clear();
        assert!(store.is_empty());

        let messages = drain(&mut rx);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["type"], "requests:clear");

        // the cached start must not reappear
        bridge.resume();
        let messages = drain(&mut rx);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["type"], "control:resume");
    }

    #[test]
    fn stop_discards_cache() {
        let (store, registry, bridge) = setup();
        let (_id, mut rx) = registry.register();
        bridge.start();
        bridge.pause();
        bridge.emit_request_start(record("https://lost.dev"));
        drain(&mut rx);

        bridge.stop();
        bridge.start();
        bridge.pause();
        bridge.resume();

        let types: Vec<String> = drain(&mut rx)
            .iter()
            .map(|m| m["type"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(types, vec!["control:pause", "control:resume"]);
        assert!(store.is_empty());
    }

    #[test]
    fn snapshot_goes_only_to_the_new_viewer() {
        let (_store, registry, bridge) = setup();
        let (_early_id, mut early_rx) = registry.register();
        bridge.start();

        for i in 0..3 {
            bridge.emit_request_start(record(&format!("https://api.example.com/{i}")));
        }
        drain(&mut early_rx);

        let (late_id, mut late_rx) = registry.register();
        bridge.handle_client_connect(&late_id);

        let late = drain(&mut late_rx);
        assert_eq!(late.len(), 1);
        assert_eq!(late[0]["type"], "requests:initial");
        assert_eq!(late[0]["payload"].as_array().unwrap().len(), 3);
        // newest first
        assert_eq!(late[0]["payload"][0]["url"], "https://api.example.com/2");

        assert!(drain(&mut early_rx).is_empty());
    }

    #[test]
    fn viewer_control_messages_mutate_shared_state() {
        let (_store, registry, bridge) = setup();
        let (id, mut rx) = registry.register();
        bridge.start();

        bridge.handle_client_message(&id, r#"{"type":"control:pause"}"#);
        assert_eq!(bridge.state(), BridgeState::Paused);

        bridge.handle_client_message(&id, r#"{"type":"control:resume"}"#);
        assert_eq!(bridge.state(), BridgeState::Active);

        bridge.handle_client_message(&id, r#"{"type":"requests:clear"}"#);
        let types: Vec<String> = drain(&mut rx)
            .iter()
            .map(|m| m["type"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(types, vec!["control:pause", "control:resume", "requests:clear"]);
    }

    #[test]
    fn malformed_viewer_messages_are_ignored() {
        let (_store, registry, bridge) = setup();
        let (id, mut rx) = registry.register();
        bridge.start();

        bridge.handle_client_message(&id, "not json");
        bridge.handle_client_message(&id, r#"{"type":"unknown:thing"}"#);
        bridge.handle_client_message(&id, "");

        assert_eq!(bridge.state(), BridgeState::Active);
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn broadcast_survives_a_dead_viewer() {
        let (_store, registry, bridge) = setup();
        let (_dead_id, dead_rx) = registry.register();
        let (_live_id, mut live_rx) = registry.register();
        drop(dead_rx);
        bridge.start();

        bridge.emit_request_start(record("https://still-delivered.dev"));

        let messages = drain(&mut live_rx);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["payload"]["url"], "https://still-delivered.dev");
    }

    #[test]
    fn oversize_bodies_are_capped_on_the_wire_too() {
        let (store, registry, bridge) = setup();
        let (_id, mut rx) = registry.register();
        bridge.start();

        let r = record("https://big.dev").with_body("z".repeat(300).as_str());
        let rid = r.id.clone();
        bridge.emit_request_start(r);

        let stored = store.get(&rid).unwrap();
        assert_eq!(stored.body.as_ref().unwrap().len(), 100);

        let messages = drain(&mut rx);
        assert_eq!(messages[0]["payload"]["bodyTruncated"], true);
        let wire_body = messages[0]["payload"]["body"].as_str().unwrap();
        // base64 of exactly 100 bytes
        assert_eq!(wire_body.len(), 136);
    }

    #[test]
    fn trace_payloads_pass_through() {
        let (_store, registry, bridge) = setup();
        let (_id, mut rx) = registry.register();
        bridge.start();

        bridge.emit_trace(json!({"spans": 3}));
        let messages = drain(&mut rx);
        assert_eq!(messages[0]["type"], "server:trace");
        assert_eq!(messages[0]["payload"]["spans"], 3);
    }

    #[test]
    fn timing_updates_store_and_broadcast() {
        let (store, registry, bridge) = setup();
        let (_id, mut rx) = registry.register();
        bridge.start();

        let r = record("https://timed.dev");
        let rid = r.id.clone();
        bridge.emit_request_start(r);
        bridge.emit_timing(
            rid.clone(),
            TimingData {
                start: 1_700_000_000_000,
                total: 88.0,
                ..Default::default()
            },
        );

        assert_eq!(store.get(&rid).unwrap().timing.unwrap().total, 88.0);
        let messages = drain(&mut rx);
        assert_eq!(messages[1]["type"], "request:timing");
        assert_eq!(messages[1]["payload"]["total"], 88.0);
    }

    #[tokio::test]
    async fn run_loop_wires_hub_events_to_handlers() {
        let (_store, registry, bridge) = setup();
        let bridge = Arc::new(bridge);
        bridge.start();

        let (tx, rx) = mpsc::channel(16);
        let handle = tokio::spawn(Arc::clone(&bridge).run(rx));

        let (viewer_id, mut viewer_rx) = registry.register();
        tx.send(HubEvent::Connected(viewer_id.clone())).await.unwrap();
        tx.send(HubEvent::Message(
            viewer_id.clone(),
            r#"{"type":"control:pause"}"#.into(),
        ))
        .await
        .unwrap();
        tx.send(HubEvent::Disconnected(viewer_id)).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        assert_eq!(bridge.state(), BridgeState::Paused);
        let messages = drain(&mut viewer_rx);
        assert_eq!(messages[0]["type"], "requests:initial");
        assert_eq!(messages[1]["type"], "control:pause");
    }
}
