//! Command handlers and the HTTP/WebSocket front door.

use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::{ws::WebSocketUpgrade, State},
    response::IntoResponse,
    routing::get,
    Router,
};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde_json::json;
use surge_core::{Distributor, LeaseStore, MemoryLeaseStore, Room};
use surge_protocol::commands::{
    EnterRequest, ExitRequest, LoginRequest, LoginResponse, PushData, SendToChannelRequest,
    SendToConnectionRequest, SendToUserRequest, CMD_ENTER, CMD_EXIT, CMD_LOGIN, CMD_PING,
    CMD_RECV_DATA, CMD_SEND_TO_CHANNEL, CMD_SEND_TO_CONNECTION, CMD_SEND_TO_USER,
};
use surge_protocol::{PushError, Request, Response};
use surge_transport::{ClientHandle, Deliver, PumpPool};
use tokio::net::TcpListener;
use tracing::{debug, error, info, trace, warn};

use crate::config::Config;
use crate::metrics;
use crate::session;

/// Shared server state.
pub struct AppState {
    /// The session directory.
    pub room: Arc<Room>,
    /// The write pump pool.
    pub pump: PumpPool,
    /// Server configuration.
    pub config: Config,
    // Keeps the lease coordination loop alive for the server's lifetime.
    _distributor: Option<Distributor>,
}

impl AppState {
    /// Build the server state from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error when the presence lease TTL is not larger than the
    /// refresh period.
    pub fn new(config: Config) -> Result<Self> {
        let pump = PumpPool::start(config.pump.worker_count(), config.pump.ready_capacity);

        let (room, distributor) = if config.presence.enabled {
            // The directory store is an external collaborator; a real
            // deployment substitutes a client for its consistent store
            // behind the LeaseStore capability.
            let store: Arc<dyn LeaseStore> = Arc::new(MemoryLeaseStore::new());
            let distributor = Distributor::spawn(store, config.presence.distributor_config())?;
            info!(node = %config.presence.node_name(), "distributed presence enabled");
            (Room::with_presence(distributor.handle()), Some(distributor))
        } else {
            (Room::new(), None)
        };

        Ok(Self {
            room: Arc::new(room),
            pump,
            config,
            _distributor: distributor,
        })
    }
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let state = Arc::new(AppState::new(config.clone())?);

    let ping_interval = config.session.ping_interval();
    if !ping_interval.is_zero() {
        let _ = session::start_keepalive(Arc::clone(&state.room), ping_interval);
    }

    let app = Router::new()
        .route(&config.transport.stream_path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state);

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr).await?;

    info!("Surge server listening on {}", addr);
    info!(
        "Stream endpoint: ws://{}{}",
        addr, config.transport.stream_path
    );

    axum::serve(listener, app).await?;

    Ok(())
}

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| session::run_session(socket, state))
}

/// What a handled request turns into.
pub(crate) enum Outcome {
    /// Answer and keep the connection open.
    Reply(Response),
    /// Answer best-effort, then close the connection.
    Fatal(Response),
}

/// Handle one decoded request.
pub(crate) async fn dispatch(state: &Arc<AppState>, cli: &ClientHandle, req: &Request) -> Outcome {
    trace!(cmd = %req.cmd, seq = req.seq, "dispatching request");

    match req.cmd.as_str() {
        CMD_PING => Outcome::Reply(Response::ok(&req.cmd, req.seq, None)),
        CMD_LOGIN => login(cli, req),
        CMD_ENTER => enter(state, cli, req),
        CMD_EXIT => exit(state, cli, req),
        CMD_SEND_TO_CONNECTION => send_to_connection(state, cli, req),
        CMD_SEND_TO_USER => send_to_user(state, cli, req),
        CMD_SEND_TO_CHANNEL => send_to_channel(state, cli, req),
        CMD_RECV_DATA => reply_err(
            req,
            &PushError::MalformedCommand("push-only command".to_string()),
        ),
        _ => {
            warn!(cmd = %req.cmd, "unsupported command");
            metrics::record_error("unsupported");
            fatal(req, &PushError::UnsupportedCommand(req.cmd.clone()))
        }
    }
}

fn login(cli: &ClientHandle, req: &Request) -> Outcome {
    let payload: LoginRequest = match decode_data(req) {
        Ok(p) => p,
        Err(e) => return fatal(req, &e),
    };

    // The one-shot login signal is consumed exactly once; a second login
    // on the same connection is a protocol error.
    let Some(login_tx) = cli.take_login() else {
        warn!(id = cli.id(), "duplicate login attempt");
        return fatal(req, &PushError::LoginFailed);
    };
    let _ = login_tx.send(payload.uid);

    let data = json!(LoginResponse { id: cli.id() });
    Outcome::Reply(Response::ok(&req.cmd, req.seq, Some(data)))
}

fn enter(state: &Arc<AppState>, cli: &ClientHandle, req: &Request) -> Outcome {
    let payload: EnterRequest = match decode_data(req) {
        Ok(p) => p,
        Err(e) => return fatal(req, &e),
    };

    state.room.join_channels(cli, &payload.chans);
    metrics::set_active_channels(state.room.stats().channel_count);

    Outcome::Reply(Response::ok(&req.cmd, req.seq, Some(json!({}))))
}

fn exit(state: &Arc<AppState>, cli: &ClientHandle, req: &Request) -> Outcome {
    let payload: ExitRequest = match decode_data(req) {
        Ok(p) => p,
        Err(e) => return fatal(req, &e),
    };

    state.room.leave_channels(cli, &payload.chans);
    metrics::set_active_channels(state.room.stats().channel_count);

    Outcome::Reply(Response::ok(&req.cmd, req.seq, Some(json!({}))))
}

fn send_to_connection(state: &Arc<AppState>, cli: &ClientHandle, req: &Request) -> Outcome {
    let payload: SendToConnectionRequest = match decode_data(req) {
        Ok(p) => p,
        Err(e) => return fatal(req, &e),
    };
    let (id, uid) = match sender_identity(state, cli) {
        Ok(identity) => identity,
        Err(e) => return fatal(req, &e),
    };

    let push = PushData {
        id,
        uid,
        chan: String::new(),
        data: payload.data,
    };
    let frame = match push_frame(&push) {
        Ok(f) => f,
        Err(e) => return fatal(req, &e),
    };

    if let [target_id] = payload.ids[..] {
        // a singular miss is a coded failure; the connection stays open
        let Some(target) = state.room.connection(target_id) else {
            return reply_err(req, &PushError::TargetConnectionNotFound);
        };
        spawn_deliver(target, frame);
    } else {
        spawn_deliver(state.room.connections(&payload.ids), frame);
    }

    Outcome::Reply(Response::ok(&req.cmd, req.seq, Some(json!({}))))
}

fn send_to_user(state: &Arc<AppState>, cli: &ClientHandle, req: &Request) -> Outcome {
    let payload: SendToUserRequest = match decode_data(req) {
        Ok(p) => p,
        Err(e) => return fatal(req, &e),
    };
    let (id, uid) = match sender_identity(state, cli) {
        Ok(identity) => identity,
        Err(e) => return fatal(req, &e),
    };

    let push = PushData {
        id,
        uid,
        chan: String::new(),
        data: payload.data,
    };
    let frame = match push_frame(&push) {
        Ok(f) => f,
        Err(e) => return fatal(req, &e),
    };

    if let [target_uid] = payload.uids[..] {
        let Some(group) = state.room.connections_of_user(target_uid) else {
            return reply_err(req, &PushError::TargetUserNotFound);
        };
        spawn_deliver(group, frame);
    } else {
        spawn_deliver(state.room.connections_of_users(&payload.uids), frame);
    }

    Outcome::Reply(Response::ok(&req.cmd, req.seq, Some(json!({}))))
}

fn send_to_channel(state: &Arc<AppState>, cli: &ClientHandle, req: &Request) -> Outcome {
    let payload: SendToChannelRequest = match decode_data(req) {
        Ok(p) => p,
        Err(e) => return fatal(req, &e),
    };
    let (id, uid) = match sender_identity(state, cli) {
        Ok(identity) => identity,
        Err(e) => return fatal(req, &e),
    };

    if let [chan] = &payload.chans[..] {
        let Some(group) = state.room.channel_connections(chan) else {
            return reply_err(req, &PushError::TargetChannelNotFound);
        };
        let push = PushData {
            id,
            uid,
            chan: chan.clone(),
            data: payload.data,
        };
        let frame = match push_frame(&push) {
            Ok(f) => f,
            Err(e) => return fatal(req, &e),
        };
        spawn_deliver(group.without(cli), frame);
    } else {
        // once per channel: a recipient in several targeted channels gets
        // one push per channel, each labeled with its origin
        let room = Arc::clone(&state.room);
        let sender = cli.clone();
        let chans = payload.chans;
        let data = payload.data;
        tokio::spawn(async move {
            for chan in chans {
                let Some(group) = room.channel_connections(&chan) else {
                    continue;
                };
                let push = PushData {
                    id,
                    uid,
                    chan: chan.clone(),
                    data: data.clone(),
                };
                match push_frame(&push) {
                    Ok(frame) => group.without(&sender).deliver(frame, false).await,
                    Err(e) => debug!(chan = %chan, error = %e, "push encode failed"),
                }
            }
        });
    }

    Outcome::Reply(Response::ok(&req.cmd, req.seq, Some(json!({}))))
}

/// The sender's id and uid; send commands require an authenticated,
/// registered connection.
fn sender_identity(
    state: &Arc<AppState>,
    cli: &ClientHandle,
) -> Result<(i64, i64), PushError> {
    let uid = state
        .room
        .user_of(cli)
        .ok_or(PushError::NotAuthenticated)?;
    let id = state
        .room
        .connection_id(cli)
        .ok_or_else(|| PushError::ProtocolFatal("connection not registered".to_string()))?;
    Ok((id, uid))
}

fn decode_data<T: DeserializeOwned>(req: &Request) -> Result<T, PushError> {
    let data = req
        .data
        .clone()
        .unwrap_or_else(|| serde_json::Value::Object(serde_json::Map::new()));
    serde_json::from_value(data).map_err(|e| PushError::MalformedCommand(e.to_string()))
}

fn push_frame(push: &PushData) -> Result<Bytes, PushError> {
    let data = serde_json::to_value(push).map_err(|e| PushError::ProtocolFatal(e.to_string()))?;
    Response::ok(CMD_RECV_DATA, 0, Some(data))
        .to_frame()
        .map_err(|e| PushError::ProtocolFatal(e.to_string()))
}

// Fan-out runs off the handler so a slow recipient queue never blocks the
// response path.
fn spawn_deliver<D: Deliver + 'static>(target: D, frame: Bytes) {
    tokio::spawn(async move {
        target.deliver(frame, false).await;
    });
}

fn fatal(req: &Request, err: &PushError) -> Outcome {
    Outcome::Fatal(Response::failure(&req.cmd, req.seq, err))
}

fn reply_err(req: &Request, err: &PushError) -> Outcome {
    Outcome::Reply(Response::failure(&req.cmd, req.seq, err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::process_frame;
    use serde_json::Value;
    use surge_transport::{pipe, PipeEvent};
    use tokio::sync::{mpsc, oneshot};
    use tokio::time::{timeout, Duration};

    fn test_state() -> Arc<AppState> {
        let config = Config {
            pump: crate::config::PumpConfig {
                workers: 1,
                ready_capacity: 1024,
            },
            ..Config::default()
        };
        Arc::new(AppState::new(config).unwrap())
    }

    struct TestClient {
        cli: ClientHandle,
        events: mpsc::UnboundedReceiver<PipeEvent>,
    }

    impl TestClient {
        fn connect(state: &Arc<AppState>) -> Self {
            let (wire, events) = pipe();
            let cli = ClientHandle::new(Box::new(wire), state.pump.ready_sender());
            state.room.add_connection(cli.clone());
            Self { cli, events }
        }

        /// Drive the login exchange the way the session loop does.
        async fn login(&self, state: &Arc<AppState>, uid: i64) {
            let (tx, rx) = oneshot::channel();
            self.cli.arm_login(tx);
            let batch = format!(r#"[{{"cmd":"login","seq":1,"data":{{"uid":{uid}}}}}]"#);
            assert!(process_frame(state, &self.cli, batch.as_bytes()).await);
            let got = rx.await.unwrap();
            state.room.login(&self.cli, got);
        }

        async fn request(&self, state: &Arc<AppState>, batch: &str) -> bool {
            process_frame(state, &self.cli, batch.as_bytes()).await
        }

        /// Next flushed physical frame, decoded as its logical envelopes.
        async fn next_batch(&mut self) -> Vec<Response> {
            loop {
                let event = timeout(Duration::from_secs(5), self.events.recv())
                    .await
                    .expect("no frame before timeout")
                    .expect("wire closed");
                if let PipeEvent::Frame(frame) = event {
                    return serde_json::from_slice(&frame).unwrap();
                }
            }
        }
    }

    #[tokio::test]
    async fn test_login_assigns_connection_id() {
        let state = test_state();
        let mut a = TestClient::connect(&state);

        a.login(&state, 100).await;

        let batch = a.next_batch().await;
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].cmd, "login");
        assert_eq!(batch[0].code, 0);
        assert_eq!(batch[0].data.as_ref().unwrap()["id"], a.cli.id());
        assert_eq!(state.room.user_of(&a.cli), Some(100));
    }

    #[tokio::test]
    async fn test_duplicate_login_is_fatal() {
        let state = test_state();
        let mut a = TestClient::connect(&state);
        a.login(&state, 100).await;
        let _ = a.next_batch().await;

        let alive = a
            .request(&state, r#"[{"cmd":"login","seq":2,"data":{"uid":100}}]"#)
            .await;
        assert!(!alive);

        // the fatal answer bypasses batching
        let batch = a.next_batch().await;
        assert_eq!(batch[0].code, -12);
    }

    #[tokio::test]
    async fn test_unauthenticated_send_is_fatal() {
        let state = test_state();
        let mut a = TestClient::connect(&state);

        let alive = a
            .request(
                &state,
                r#"[{"cmd":"snd2chan","seq":1,"data":{"chans":["news"],"data":"x"}}]"#,
            )
            .await;
        assert!(!alive);

        let batch = a.next_batch().await;
        assert_eq!(batch[0].code, -11);
    }

    #[tokio::test]
    async fn test_unsupported_command_is_fatal() {
        let state = test_state();
        let mut a = TestClient::connect(&state);

        let alive = a.request(&state, r#"[{"cmd":"bogus","seq":1}]"#).await;
        assert!(!alive);

        let batch = a.next_batch().await;
        assert_eq!(batch[0].code, -21);
    }

    #[tokio::test]
    async fn test_client_sent_rcvdata_is_coded_not_fatal() {
        let state = test_state();
        let mut a = TestClient::connect(&state);

        let alive = a.request(&state, r#"[{"cmd":"rcvdata","seq":1}]"#).await;
        assert!(alive);

        let batch = a.next_batch().await;
        assert_eq!(batch[0].code, -22);
    }

    #[tokio::test]
    async fn test_malformed_frame_is_fatal_without_response() {
        let state = test_state();
        let a = TestClient::connect(&state);

        assert!(!a.request(&state, r#"{"cmd":"ping"}"#).await);
        assert!(!a.request(&state, r#"[{"cmd":"ping"},null]"#).await);
    }

    #[tokio::test]
    async fn test_batched_requests_answered_together() {
        let state = test_state();
        let mut a = TestClient::connect(&state);
        a.login(&state, 100).await;
        let _ = a.next_batch().await;

        let alive = a
            .request(
                &state,
                r#"[{"cmd":"ping","seq":10},{"cmd":"enter","seq":11,"data":{"chans":["news"]}}]"#,
            )
            .await;
        assert!(alive);

        // both answers ride one flush cycle
        let batch = a.next_batch().await;
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].cmd, "ping");
        assert_eq!(batch[1].cmd, "enter");
        assert!(batch.iter().all(|r| r.code == 0));
    }

    #[tokio::test]
    async fn test_channel_broadcast_reaches_members_not_sender() {
        let state = test_state();
        let mut a = TestClient::connect(&state);
        let mut b = TestClient::connect(&state);
        a.login(&state, 100).await;
        b.login(&state, 200).await;
        let _ = a.next_batch().await;
        let _ = b.next_batch().await;

        a.request(&state, r#"[{"cmd":"enter","seq":2,"data":{"chans":["news"]}}]"#)
            .await;
        b.request(&state, r#"[{"cmd":"enter","seq":2,"data":{"chans":["news"]}}]"#)
            .await;
        let _ = a.next_batch().await;
        let _ = b.next_batch().await;

        let alive = a
            .request(
                &state,
                r#"[{"cmd":"snd2chan","seq":3,"data":{"chans":["news"],"data":{"k":"v"}}}]"#,
            )
            .await;
        assert!(alive);

        // exactly one push lands on B with the sender's identity attached
        let push = b.next_batch().await;
        assert_eq!(push.len(), 1);
        assert_eq!(push[0].cmd, "rcvdata");
        let data = push[0].data.as_ref().unwrap();
        assert_eq!(data["id"], a.cli.id());
        assert_eq!(data["uid"], 100);
        assert_eq!(data["chan"], "news");
        assert_eq!(data["data"], serde_json::json!({"k": "v"}));

        // the sender sees only its own success response
        let own = a.next_batch().await;
        assert_eq!(own.len(), 1);
        assert_eq!(own[0].cmd, "snd2chan");
        assert_eq!(own[0].code, 0);
    }

    #[tokio::test]
    async fn test_send_to_partially_connected_users() {
        let state = test_state();
        let mut a = TestClient::connect(&state);
        let mut b = TestClient::connect(&state);
        a.login(&state, 100).await;
        b.login(&state, 200).await;
        let _ = a.next_batch().await;
        let _ = b.next_batch().await;

        // user 300 is not connected anywhere; the call still succeeds
        let alive = a
            .request(
                &state,
                r#"[{"cmd":"snd2usr","seq":3,"data":{"uids":[200,300],"data":"hi"}}]"#,
            )
            .await;
        assert!(alive);

        let own = a.next_batch().await;
        assert_eq!(own[0].code, 0);

        let push = b.next_batch().await;
        assert_eq!(push[0].cmd, "rcvdata");
        assert_eq!(push[0].data.as_ref().unwrap()["chan"], "");
        assert_eq!(push[0].data.as_ref().unwrap()["data"], Value::from("hi"));
    }

    #[tokio::test]
    async fn test_singular_target_misses_are_coded() {
        let state = test_state();
        let mut a = TestClient::connect(&state);
        a.login(&state, 100).await;
        let _ = a.next_batch().await;

        for (batch, code) in [
            (r#"[{"cmd":"snd2cli","seq":4,"data":{"ids":[9999],"data":"x"}}]"#, -41),
            (r#"[{"cmd":"snd2usr","seq":5,"data":{"uids":[9999],"data":"x"}}]"#, -42),
            (r#"[{"cmd":"snd2chan","seq":6,"data":{"chans":["nope"],"data":"x"}}]"#, -43),
        ] {
            let alive = a.request(&state, batch).await;
            assert!(alive);
            let rsp = a.next_batch().await;
            assert_eq!(rsp[0].code, code);
        }
    }

    #[tokio::test]
    async fn test_send_to_connection_by_id() {
        let state = test_state();
        let mut a = TestClient::connect(&state);
        let mut b = TestClient::connect(&state);
        a.login(&state, 100).await;
        b.login(&state, 200).await;
        let _ = a.next_batch().await;
        let _ = b.next_batch().await;

        let batch = format!(
            r#"[{{"cmd":"snd2cli","seq":3,"data":{{"ids":[{}],"data":"direct"}}}}]"#,
            b.cli.id()
        );
        assert!(a.request(&state, &batch).await);

        let push = b.next_batch().await;
        assert_eq!(push[0].cmd, "rcvdata");
        assert_eq!(push[0].data.as_ref().unwrap()["id"], a.cli.id());
    }

    #[tokio::test]
    async fn test_multi_channel_send_labels_each_channel() {
        let state = test_state();
        let mut a = TestClient::connect(&state);
        let mut b = TestClient::connect(&state);
        a.login(&state, 100).await;
        b.login(&state, 200).await;
        let _ = a.next_batch().await;
        let _ = b.next_batch().await;

        b.request(
            &state,
            r#"[{"cmd":"enter","seq":2,"data":{"chans":["a","b"]}}]"#,
        )
        .await;
        let _ = b.next_batch().await;

        assert!(
            a.request(
                &state,
                r#"[{"cmd":"snd2chan","seq":3,"data":{"chans":["a","b"],"data":1}}]"#,
            )
            .await
        );

        // one push per targeted channel, each labeled with its origin;
        // the two pushes may share a physical frame or not
        let mut chans: Vec<String> = Vec::new();
        while chans.len() < 2 {
            let push = b.next_batch().await;
            for rsp in push {
                chans.push(rsp.data.unwrap()["chan"].as_str().unwrap().to_string());
            }
        }
        chans.sort();
        assert_eq!(chans, vec!["a".to_string(), "b".to_string()]);
    }
}
