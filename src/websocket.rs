use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures::{sink::SinkExt, stream::StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::models::IncomingMessage;
use crate::pipeline::ModerateOptions;
use crate::state::AppState;

/// Pings a session may miss before the server closes it.
const MAX_MISSED_PINGS: u32 = 2;

/// Inbound control verbs and chat payloads share one frame shape.
#[derive(Debug, Deserialize)]
struct InboundFrame {
    #[serde(default)]
    action: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    channel_id: Option<String>,
    #[serde(default)]
    metadata: Option<HashMap<String, String>>,
}

/// One bidirectional moderation session. Outbound: every processed
/// event, as `type: "chat_message"` JSON, plus control acks. Inbound:
/// simulation control verbs and user chat payloads. The server pings on
/// an interval and closes the session after two unanswered pings.
pub async fn handle_session(socket: WebSocket, state: AppState) {
    metrics::increment_gauge!("active_sessions", 1.0);
    let (mut sender, mut receiver) = socket.split();

    let missed_pings = Arc::new(AtomicU32::new(0));
    let mut subscription = state.hub.subscribe_all();
    let (out_tx, mut out_rx) = mpsc::channel::<Message>(16);

    // Writer: fans hub events, control acks and pings into the socket.
    let hub = state.hub.clone();
    let ping_interval = state.config.session_ping;
    let writer_missed = missed_pings.clone();
    let mut send_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(ping_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // first tick fires immediately

        loop {
            tokio::select! {
                event = subscription.receiver.recv() => match event {
                    Ok(event) => {
                        let json = match serde_json::to_string(&event) {
                            Ok(json) => json,
                            Err(e) => {
                                warn!(error = %e, "failed to serialize event for session");
                                continue;
                            }
                        };
                        if sender.send(Message::Text(json)).await.is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        // Slow consumer: oldest events were dropped.
                        hub.note_lag(skipped);
                    }
                    Err(RecvError::Closed) => break,
                },
                outbound = out_rx.recv() => match outbound {
                    Some(frame) => {
                        if sender.send(frame).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                _ = ticker.tick() => {
                    if writer_missed.fetch_add(1, Ordering::SeqCst) >= MAX_MISSED_PINGS {
                        debug!("session missed {MAX_MISSED_PINGS} pings, closing");
                        let _ = sender.send(Message::Close(None)).await;
                        break;
                    }
                    if sender.send(Message::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Reader: control verbs, chat payloads, pong liveness.
    let reader_state = state.clone();
    let reader_missed = missed_pings;
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(frame)) = receiver.next().await {
            match frame {
                Message::Pong(_) => {
                    reader_missed.store(0, Ordering::SeqCst);
                }
                Message::Text(text) => {
                    reader_missed.store(0, Ordering::SeqCst);
                    handle_frame(&reader_state, &out_tx, &text).await;
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    metrics::decrement_gauge!("active_sessions", 1.0);
}

async fn handle_frame(state: &AppState, out_tx: &mpsc::Sender<Message>, text: &str) {
    let frame: InboundFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(_) => {
            send_status(out_tx, "unrecognized frame").await;
            return;
        }
    };

    match frame.action.as_deref() {
        Some("start_simulation") => {
            let message = if state.simulator.start() {
                "simulation started"
            } else {
                "simulation already running"
            };
            send_status(out_tx, message).await;
        }
        Some("stop_simulation") => {
            state.simulator.stop();
            send_status(out_tx, "simulation stopped").await;
        }
        Some(other) => {
            send_status(out_tx, &format!("unknown action: {other}")).await;
        }
        None => {
            let Some(body) = frame.message else {
                send_status(out_tx, "frame carries neither action nor message").await;
                return;
            };
            let msg = IncomingMessage::new(
                frame.user_id.unwrap_or_else(|| "user_web".to_string()),
                frame.username.or_else(|| Some("WebUser".to_string())),
                frame.channel_id.unwrap_or_else(|| "web-chat".to_string()),
                body,
                None,
                frame.metadata.unwrap_or_default(),
            );
            match msg {
                Ok(msg) => {
                    // The session observes its own result through the
                    // hub subscription, like every other subscriber.
                    if let Err(e) = state
                        .orchestrator
                        .moderate(msg, ModerateOptions::default())
                        .await
                    {
                        warn!(error = %e, "session message failed to process");
                        send_status(out_tx, "message could not be processed").await;
                    }
                }
                Err(e) => send_status(out_tx, &format!("invalid message: {e}")).await,
            }
        }
    }
}

async fn send_status(out_tx: &mpsc::Sender<Message>, message: &str) {
    let frame = json!({"type": "status", "message": message}).to_string();
    let _ = out_tx.send(Message::Text(frame)).await;
}
