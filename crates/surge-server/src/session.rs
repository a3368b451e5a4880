//! Per-connection session lifecycle.
//!
//! One task per connection performs the blocking reads; the pump pool owns
//! the writes. A session moves through connecting → awaiting-login →
//! authenticated → closed: the login watcher enforces the deadline on the
//! second step, and teardown unwinds the room synchronously at the end of
//! the read loop, whatever ended it.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::StreamExt;
use surge_core::Room;
use surge_protocol::{decode_batch, UserId};
use surge_transport::{ClientHandle, WsWire};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, warn};

use crate::handlers::{dispatch, AppState, Outcome};
use crate::metrics;

/// Drive one WebSocket session to completion.
pub(crate) async fn run_session(socket: WebSocket, state: Arc<AppState>) {
    let _guard = metrics::ConnectionGuard::new();

    let (sink, mut stream) = socket.split();
    let cli = ClientHandle::new(Box::new(WsWire::new(sink)), state.pump.ready_sender());
    let id = state.room.add_connection(cli.clone());
    debug!(id, "session opened");

    let (login_tx, login_rx) = oneshot::channel();
    cli.arm_login(login_tx);
    let watcher = tokio::spawn(login_watcher(
        Arc::clone(&state.room),
        state.config.session.login_timeout(),
        cli.clone(),
        login_rx,
    ));

    let recv_timeout = state.config.session.receive_timeout();
    loop {
        let msg = match tokio::time::timeout(recv_timeout, stream.next()).await {
            Err(_) => {
                debug!(id, "receive timeout, closing");
                break;
            }
            Ok(None) => {
                debug!(id, "stream ended");
                break;
            }
            Ok(Some(Err(e))) => {
                debug!(id, error = %e, "websocket error");
                metrics::record_error("websocket");
                break;
            }
            Ok(Some(Ok(msg))) => msg,
        };

        match msg {
            Message::Text(text) => {
                if !process_frame(&state, &cli, text.as_bytes()).await {
                    break;
                }
            }
            Message::Binary(data) => {
                if !process_frame(&state, &cli, &data).await {
                    break;
                }
            }
            // any traffic counts as liveness; axum answers pings itself
            Message::Ping(_) | Message::Pong(_) => {}
            Message::Close(_) => {
                debug!(id, "close frame received");
                break;
            }
        }

        if cli.is_closed() {
            break;
        }
    }

    cli.close().await;
    // settle the watcher before unwinding so a login racing the teardown
    // cannot re-link a removed connection
    watcher.abort();
    let _ = watcher.await;
    state.room.remove_connection(&cli);
    metrics::set_active_channels(state.room.stats().channel_count);
    metrics::set_active_users(state.room.stats().user_count);
    debug!(id, "session closed");
}

/// First of {login signal, deadline} wins.
async fn login_watcher(
    room: Arc<Room>,
    deadline: Duration,
    cli: ClientHandle,
    login_rx: oneshot::Receiver<UserId>,
) {
    tokio::select! {
        signal = login_rx => {
            if let Ok(uid) = signal {
                // skip when teardown won the race
                if room.connection_id(&cli).is_some() {
                    room.login(&cli, uid);
                    metrics::set_active_users(room.stats().user_count);
                }
            }
        }
        () = tokio::time::sleep(deadline) => {
            warn!(id = cli.id(), "login deadline passed, closing connection");
            cli.close().await;
        }
    }
}

/// Decode one physical frame and handle each request in it.
///
/// Returns `false` when the connection must close: broken framing, an
/// oversized frame, a fatal command outcome, or an undeliverable response.
pub(crate) async fn process_frame(state: &Arc<AppState>, cli: &ClientHandle, raw: &[u8]) -> bool {
    if raw.len() > state.config.session.max_frame_bytes {
        warn!(id = cli.id(), len = raw.len(), "oversized frame");
        metrics::record_error("oversize");
        return false;
    }

    let requests = match decode_batch(raw) {
        Ok(requests) => requests,
        Err(e) => {
            warn!(id = cli.id(), error = %e, "malformed frame");
            metrics::record_error("protocol");
            return false;
        }
    };
    metrics::record_message(raw.len(), "inbound");

    let start = Instant::now();
    for req in &requests {
        let (rsp, is_fatal) = match dispatch(state, cli, req).await {
            Outcome::Reply(rsp) => (rsp, false),
            Outcome::Fatal(rsp) => (rsp, true),
        };

        let frame = match rsp.to_frame() {
            Ok(frame) => frame,
            Err(e) => {
                error!(id = cli.id(), error = %e, "response encode failed");
                return false;
            }
        };
        metrics::record_message(frame.len(), "outbound");

        // fatal answers bypass batching so they get out before the close
        if let Err(e) = cli.enqueue(frame, req.immed || is_fatal).await {
            warn!(id = cli.id(), error = %e, "response enqueue failed, closing");
            metrics::record_error("backpressure");
            return false;
        }
        if is_fatal {
            return false;
        }
    }
    metrics::record_dispatch_latency(start.elapsed().as_secs_f64());

    true
}

/// Ping every open connection each period; failures close the connection
/// and the read side finishes the teardown.
pub(crate) fn start_keepalive(room: Arc<Room>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tick.tick().await; // the first tick completes immediately

        loop {
            tick.tick().await;
            for cli in room.all_connections() {
                if cli.is_closed() {
                    continue;
                }
                if let Err(e) = cli.ping().await {
                    debug!(id = cli.id(), error = %e, "ping failed, closing connection");
                    cli.close().await;
                }
            }
        }
    })
}
