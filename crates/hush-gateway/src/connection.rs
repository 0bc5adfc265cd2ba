use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tracing::{info, trace, warn};

use hush_types::models::UserId;

use crate::live::LiveChannel;

/// Server sends a Ping every 15 seconds.
/// Two consecutive missed Pongs (~30s) drop the connection.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
const MAX_MISSED_PONGS: u8 = 2;

/// Drive one pre-authenticated push connection.
///
/// The token was verified at the HTTP upgrade, so the socket is registered
/// for `user_id` straight away. The channel is push-only: inbound frames other
/// than Pong and Close are ignored. The channel is unregistered when either
/// side ends.
pub async fn handle_connection(socket: WebSocket, live: LiveChannel, user_id: UserId) {
    run_connection(socket, live, user_id, HEARTBEAT_INTERVAL).await
}

async fn run_connection(socket: WebSocket, live: LiveChannel, user_id: UserId, heartbeat_every: Duration) {
    let (mut sender, mut receiver) = socket.split();
    let (channel_id, mut events) = live.open(user_id);

    info!("User {} opened live channel {}", user_id, channel_id);

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received;

    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(heartbeat_every);
        heartbeat.tick().await;
        let mut missed_pongs: u8 = 0;

        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else { break };

                    let text = match serde_json::to_string(&event) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!("Failed to encode {} event for user {}: {}", event.kind(), user_id, e);
                            continue;
                        }
                    };
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_pongs = 0;
                    } else {
                        missed_pongs += 1;
                        if missed_pongs >= MAX_MISSED_PONGS {
                            warn!("Heartbeat timeout for user {} (missed {} pongs), dropping connection", user_id, missed_pongs);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Pong(_) => pong_flag_recv.store(true, Ordering::Release),
                Message::Close(_) => break,
                Message::Text(text) => {
                    let preview: String = text.chars().take(200).collect();
                    trace!("Ignoring inbound frame from user {}: {}", user_id, preview);
                }
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    live.unregister(user_id, channel_id);
    info!("User {} closed live channel {}", user_id, channel_id);
}
