//! WebSocket connection handler.
//!
//! Manages individual WebSocket connections: parsing client messages,
//! routing them through the lifecycle manager and group registry, and
//! sending responses.

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::error::Error;
use crate::groups::{call_group, call_id_of, user_group, ClientSender};
use crate::lifecycle;
use crate::protocol::{CallSnapshot, ClientMessage, ServerMessage};
use crate::state::AppState;
use crate::supervisor;

/// Handle a single WebSocket connection.
///
/// This function runs for the lifetime of the connection:
/// 1. Waits for a `Register` message to associate the connection with a user
/// 2. Spawns a sender task to forward outbound messages
/// 3. Processes incoming messages until the connection closes
/// 4. On close, starts disconnect grace timers for any call the user was in
pub async fn handle_websocket(socket: WebSocket, state: AppState) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Create the outbound channel for this client
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    // ── Step 1: Wait for Registration ─────────────────────────────────────

    let user_id = loop {
        match ws_receiver.next().await {
            Some(Ok(Message::Text(text))) => {
                match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(ClientMessage::Register { user_id }) => {
                        if user_id.trim().is_empty() {
                            let err = ServerMessage::Error {
                                message: "Invalid user id".to_string(),
                            };
                            let _ = ws_sender
                                .send(Message::Text(serde_json::to_string(&err).unwrap()))
                                .await;
                            continue;
                        }

                        // Send registration confirmation
                        let ack = ServerMessage::Registered {
                            user_id: user_id.clone(),
                        };
                        if ws_sender
                            .send(Message::Text(serde_json::to_string(&ack).unwrap()))
                            .await
                            .is_err()
                        {
                            return; // Connection closed
                        }

                        break user_id;
                    }
                    Ok(ClientMessage::Ping) => {
                        let pong = ServerMessage::Pong;
                        let _ = ws_sender
                            .send(Message::Text(serde_json::to_string(&pong).unwrap()))
                            .await;
                    }
                    Ok(_) => {
                        let err = ServerMessage::Error {
                            message: "Must register before sending other messages".to_string(),
                        };
                        let _ = ws_sender
                            .send(Message::Text(serde_json::to_string(&err).unwrap()))
                            .await;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to parse client message: {}", e);
                        let err = ServerMessage::Error {
                            message: format!("Invalid message format: {}", e),
                        };
                        let _ = ws_sender
                            .send(Message::Text(serde_json::to_string(&err).unwrap()))
                            .await;
                    }
                }
            }
            Some(Ok(Message::Ping(data))) => {
                let _ = ws_sender.send(Message::Pong(data)).await;
            }
            Some(Ok(Message::Close(_))) | None => {
                return; // Connection closed before registration
            }
            _ => continue,
        }
    };

    // ── Step 2: Register Client ───────────────────────────────────────────

    state.groups.join(&user_group(&user_id), &user_id, tx.clone());
    tracing::info!(user_id = user_id.as_str(), "WebSocket registered");

    // ── Step 3: Spawn Sender Task ─────────────────────────────────────────

    let sender_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match serde_json::to_string(&msg) {
                Ok(json) => {
                    if ws_sender.send(Message::Text(json)).await.is_err() {
                        break; // Connection closed
                    }
                }
                Err(e) => {
                    tracing::error!("Failed to serialize server message: {}", e);
                }
            }
        }
    });

    // ── Step 4: Process Messages ──────────────────────────────────────────

    while let Some(msg_result) = ws_receiver.next().await {
        match msg_result {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(client_msg) => {
                    handle_client_message(&state, &user_id, &tx, client_msg).await;
                }
                Err(e) => {
                    tracing::warn!(
                        user_id = user_id.as_str(),
                        error = %e,
                        "Failed to parse client message"
                    );
                    send_to_user(
                        &state,
                        &user_id,
                        ServerMessage::Error {
                            message: format!("Invalid message format: {}", e),
                        },
                    );
                }
            },
            Ok(Message::Ping(_data)) => {
                // Axum answers pings at the protocol level; keep the
                // application-level reply for clients that expect it.
                send_to_user(&state, &user_id, ServerMessage::Pong);
            }
            Ok(Message::Close(_)) => {
                tracing::info!(user_id = user_id.as_str(), "Client sent close frame");
                break;
            }
            Err(e) => {
                tracing::warn!(
                    user_id = user_id.as_str(),
                    error = %e,
                    "WebSocket error"
                );
                break;
            }
            _ => {} // Binary, Pong — ignore
        }
    }

    // ── Step 5: Cleanup ───────────────────────────────────────────────────

    // An unannounced exit from a call room is a disconnect, not a hangup:
    // notify the remaining members and hand the call to the grace timer.
    for group in state.groups.groups_of(&user_id) {
        let Some(call_id) = call_id_of(&group).map(String::from) else {
            continue;
        };
        state.groups.leave(&group, &user_id);
        state.groups.publish(
            &group,
            &ServerMessage::ParticipantLeft {
                call_id: call_id.clone(),
                user_id: user_id.clone(),
            },
        );
        supervisor::handle_disconnect(&state, &call_id, &user_id);
    }

    state.groups.leave_all(&user_id);
    sender_task.abort();
    tracing::info!(user_id = user_id.as_str(), "WebSocket disconnected");
}

/// Handle a parsed client message.
async fn handle_client_message(
    state: &AppState,
    user_id: &str,
    tx: &ClientSender,
    msg: ClientMessage,
) {
    match msg {
        ClientMessage::Register { .. } => {
            // Already registered — ignore duplicate registrations
            send_to_user(
                state,
                user_id,
                ServerMessage::Error {
                    message: "Already registered".to_string(),
                },
            );
        }

        ClientMessage::JoinCall { call_id } => {
            handle_join_call(state, user_id, tx, &call_id);
        }

        ClientMessage::LeaveCall { call_id } => {
            handle_leave_call(state, user_id, &call_id).await;
        }

        ClientMessage::Offer { call_id, payload } => {
            handle_offer(state, user_id, &call_id, payload);
        }

        ClientMessage::Answer { call_id, payload } => {
            let message = ServerMessage::Answer {
                call_id: call_id.clone(),
                from_user: user_id.to_string(),
                payload,
            };
            relay_signal(state, user_id, &call_id, message);
        }

        ClientMessage::IceCandidate { call_id, payload } => {
            let message = ServerMessage::IceCandidate {
                call_id: call_id.clone(),
                from_user: user_id.to_string(),
                payload,
            };
            relay_signal(state, user_id, &call_id, message);
        }

        ClientMessage::CallStatus {
            call_id,
            status,
            reason,
        } => {
            handle_call_status(state, user_id, &call_id, &status, reason.as_deref()).await;
        }

        ClientMessage::CallQuality {
            call_id,
            connection_quality,
            network_info,
        } => {
            handle_call_quality(state, user_id, &call_id, &connection_quality, network_info);
        }

        ClientMessage::ToggleMedia {
            call_id,
            media_type,
            enabled,
        } => {
            let message = ServerMessage::ToggleMedia {
                call_id: call_id.clone(),
                user_id: user_id.to_string(),
                media_type,
                enabled,
            };
            relay_signal(state, user_id, &call_id, message);
        }

        ClientMessage::Ping => {
            send_to_user(state, user_id, ServerMessage::Pong);
        }
    }
}

// ── Message Handlers ──────────────────────────────────────────────────────────

/// Join a call's signaling room.
///
/// Fails closed: unknown calls and non-participants both get an error frame
/// and no room membership. A successful join cancels any pending disconnect
/// grace timer and replies with the current call snapshot so a reconnecting
/// client can resynchronize.
fn handle_join_call(state: &AppState, user_id: &str, tx: &ClientSender, call_id: &str) {
    let session = match state.store.get_session(call_id) {
        Ok(Some(session)) => session,
        Ok(None) => {
            send_to_user(
                state,
                user_id,
                ServerMessage::Error {
                    message: format!("Call not found: {}", call_id),
                },
            );
            return;
        }
        Err(e) => {
            tracing::error!(call_id = call_id, error = %e, "Failed to load call for join");
            send_to_user(
                state,
                user_id,
                ServerMessage::Error {
                    message: "Internal error".to_string(),
                },
            );
            return;
        }
    };

    if !session.is_participant(user_id) {
        send_to_user(
            state,
            user_id,
            ServerMessage::Error {
                message: "You are not a participant of this call".to_string(),
            },
        );
        return;
    }

    // Cancel the grace timer before joining so it cannot fire in between.
    let reconnected = supervisor::handle_reconnect(state, call_id, user_id);

    let room = call_group(call_id);
    state.groups.join(&room, user_id, tx.clone());
    state.groups.publish_except(
        &room,
        user_id,
        &ServerMessage::ParticipantJoined {
            call_id: call_id.to_string(),
            user_id: user_id.to_string(),
        },
    );

    send_to_user(
        state,
        user_id,
        ServerMessage::CallState {
            call: CallSnapshot::from(&session),
        },
    );

    tracing::info!(
        call_id = call_id,
        user_id = user_id,
        reconnected = reconnected,
        "Joined call room"
    );
}

/// Leave a call room intentionally and let the group policy decide whether
/// the call ends with it. No grace timer for announced exits.
async fn handle_leave_call(state: &AppState, user_id: &str, call_id: &str) {
    let room = call_group(call_id);
    if !state.groups.is_member(&room, user_id) {
        return;
    }

    state.groups.leave(&room, user_id);
    state.groups.publish(
        &room,
        &ServerMessage::ParticipantLeft {
            call_id: call_id.to_string(),
            user_id: user_id.to_string(),
        },
    );

    match lifecycle::check_termination(state, call_id, user_id).await {
        Ok(ended) => {
            if ended {
                tracing::info!(call_id = call_id, user_id = user_id, "Call ended on leave");
            }
        }
        Err(Error::CallNotFound(_)) => {}
        Err(e) => {
            tracing::warn!(call_id = call_id, error = %e, "Leave-termination check failed");
        }
    }
}

/// Relay a WebRTC offer to the other room members.
///
/// The first offer also confirms signaling is underway for a call that is
/// somehow still `initiated`.
fn handle_offer(state: &AppState, user_id: &str, call_id: &str, payload: serde_json::Value) {
    let room = call_group(call_id);
    if !state.groups.is_member(&room, user_id) {
        send_to_user(
            state,
            user_id,
            ServerMessage::Error {
                message: "You are not in this call".to_string(),
            },
        );
        return;
    }

    if let Err(e) = lifecycle::start_ringing(state, call_id, Some(user_id)) {
        tracing::warn!(call_id = call_id, error = %e, "Failed to update ringing state on offer");
    }

    state.groups.publish_except(
        &room,
        user_id,
        &ServerMessage::Offer {
            call_id: call_id.to_string(),
            from_user: user_id.to_string(),
            payload,
        },
    );
}

/// Forward a signaling payload to everyone else in the room. The payload is
/// opaque; membership is the only check.
fn relay_signal(state: &AppState, user_id: &str, call_id: &str, message: ServerMessage) {
    let room = call_group(call_id);
    if !state.groups.is_member(&room, user_id) {
        send_to_user(
            state,
            user_id,
            ServerMessage::Error {
                message: "You are not in this call".to_string(),
            },
        );
        return;
    }

    state.groups.publish_except(&room, user_id, &message);
}

/// Apply a requested status transition through the lifecycle manager and
/// report failures back to the sender. Successes are broadcast by the
/// manager itself.
async fn handle_call_status(
    state: &AppState,
    user_id: &str,
    call_id: &str,
    status: &str,
    reason: Option<&str>,
) {
    match lifecycle::apply_status(state, call_id, user_id, status, reason).await {
        Ok(session) => {
            tracing::debug!(
                call_id = call_id,
                user_id = user_id,
                status = session.status.as_str(),
                "Status applied over socket"
            );
        }
        Err(e) => {
            send_to_user(
                state,
                user_id,
                ServerMessage::Error {
                    message: e.to_string(),
                },
            );
        }
    }
}

/// Record a quality report; the lifecycle manager relays it to the room.
fn handle_call_quality(
    state: &AppState,
    user_id: &str,
    call_id: &str,
    quality: &str,
    network_info: Option<serde_json::Value>,
) {
    if let Err(e) = lifecycle::update_quality(state, call_id, user_id, quality, network_info) {
        send_to_user(
            state,
            user_id,
            ServerMessage::Error {
                message: e.to_string(),
            },
        );
    }
}

/// Deliver a message to a user's personal group. Returns false when the
/// user has no live connection.
fn send_to_user(state: &AppState, user_id: &str, message: ServerMessage) -> bool {
    state.groups.publish(&user_group(user_id), &message) > 0
}
