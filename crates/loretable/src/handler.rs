//! Per-connection handler: handshake, command routing, event forwarding.
//!
//! Each accepted connection gets its own task. The flow:
//!
//! 1. Receive `Hello` → check version → authenticate through the identity
//!    boundary → create a session → send `Welcome`.
//! 2. Spawn an event pump that forwards the room's broadcast stream onto
//!    the connection from its own task (the split transport makes the two
//!    directions independent).
//! 3. Loop over client envelopes: commands go to the user's room, replies
//!    come back correlated; heartbeats echo; `Goodbye` closes.
//!
//! A drop guard marks the session disconnected and detaches the room
//! subscription even if the handler dies mid-frame.

use std::sync::Arc;
use std::time::Duration;

use loretable_encounter::{Command, CommandContext, CommandError, CommandSource, Role, UserId};
use loretable_protocol::{
    ClientCommand, ClientEnvelope, Codec, CommandReply, CorrelationId, ReplyBody, ServerEnvelope,
    PROTOCOL_VERSION,
};
use loretable_room::{EntityDirectory, RoomError};
use loretable_session::Identity;
use loretable_transport::Connection;
use tokio::sync::mpsc;

use crate::server::ServerState;
use crate::LoretableError;

/// Idle cutoff: three missed heartbeat intervals.
const RECV_TIMEOUT: Duration = Duration::from_secs(30);

/// Cleans up session and room membership when the handler exits for any
/// reason. `Drop` is synchronous, so the async work rides a spawned task.
struct SessionGuard<I: Identity, D: EntityDirectory, C: Codec> {
    user_id: UserId,
    state: Arc<ServerState<I, D, C>>,
}

impl<I: Identity, D: EntityDirectory, C: Codec> Drop for SessionGuard<I, D, C> {
    fn drop(&mut self) {
        let user_id = self.user_id;
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            state.rooms.lock().await.detach(user_id).await;
            let _ = state.sessions.lock().await.disconnect(user_id);
        });
    }
}

/// Handles one connection from accept to close.
pub(crate) async fn handle_connection<T, I, D, C>(
    conn: T,
    state: Arc<ServerState<I, D, C>>,
) -> Result<(), LoretableError>
where
    T: Connection,
    I: Identity,
    D: EntityDirectory,
    C: Codec + Clone,
{
    let conn_id = conn.id();
    tracing::debug!(%conn_id, "handling new connection");

    let user_id = perform_handshake(&conn, &state).await?;
    tracing::info!(%conn_id, %user_id, "user authenticated");

    {
        let mut sessions = state.sessions.lock().await;
        sessions.create(user_id).map_err(LoretableError::Session)?;
    }
    let _guard = SessionGuard {
        user_id,
        state: Arc::clone(&state),
    };

    // Event pump: the room's broadcast stream flows to the client from its
    // own task, never blocking on the request loop.
    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let pump_conn = conn.clone();
    let pump_codec = state.codec.clone();
    let pump = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            let envelope = ServerEnvelope::Event { event };
            match pump_codec.encode(&envelope) {
                Ok(bytes) => {
                    if pump_conn.send(&bytes).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "failed to encode event");
                }
            }
        }
    });

    // The caller's role in their current room, fixed at join time.
    let mut room_role: Option<Role> = None;
    let started = std::time::Instant::now();

    loop {
        let frame = match tokio::time::timeout(RECV_TIMEOUT, conn.recv()).await {
            Ok(Ok(Some(frame))) => frame,
            Ok(Ok(None)) => {
                tracing::info!(%user_id, "connection closed cleanly");
                break;
            }
            Ok(Err(e)) => {
                tracing::debug!(%user_id, error = %e, "recv error");
                break;
            }
            Err(_) => {
                tracing::info!(%user_id, "connection idle timeout");
                break;
            }
        };

        let envelope: ClientEnvelope = match state.codec.decode(&frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::debug!(%user_id, error = %e, "undecodable frame, dropping");
                continue;
            }
        };

        match envelope {
            ClientEnvelope::Command {
                correlation_id,
                command,
            } => {
                handle_command(
                    &conn,
                    &state,
                    user_id,
                    &mut room_role,
                    correlation_id,
                    command,
                    &event_tx,
                )
                .await?;
            }
            ClientEnvelope::ReplayFrom { seq } => {
                let rooms = state.rooms.lock().await;
                if let Err(e) = rooms.replay_for(user_id, seq).await {
                    tracing::debug!(%user_id, error = %e, "replay request failed");
                }
            }
            ClientEnvelope::Heartbeat { client_time } => {
                let ack = ServerEnvelope::HeartbeatAck {
                    client_time,
                    server_time: started.elapsed().as_millis() as u64,
                };
                send(&conn, &state.codec, &ack).await?;
            }
            ClientEnvelope::Goodbye { reason } => {
                tracing::info!(%user_id, %reason, "client said goodbye");
                break;
            }
            ClientEnvelope::Hello { .. } => {
                tracing::debug!(%user_id, "duplicate Hello ignored");
            }
        }
    }

    pump.abort();
    // _guard drops here: session disconnect + room detach.
    Ok(())
}

/// Receive `Hello`, validate the version, resolve the identity, `Welcome`.
async fn perform_handshake<T, I, D, C>(
    conn: &T,
    state: &Arc<ServerState<I, D, C>>,
) -> Result<UserId, LoretableError>
where
    T: Connection,
    I: Identity,
    D: EntityDirectory,
    C: Codec + Clone,
{
    let frame = match tokio::time::timeout(Duration::from_secs(5), conn.recv()).await {
        Ok(Ok(Some(frame))) => frame,
        Ok(Ok(None)) => {
            return Err(loretable_protocol::ProtocolError::InvalidMessage(
                "connection closed before Hello".into(),
            )
            .into());
        }
        Ok(Err(e)) => return Err(LoretableError::Transport(e)),
        Err(_) => {
            return Err(loretable_protocol::ProtocolError::InvalidMessage(
                "handshake timed out".into(),
            )
            .into());
        }
    };

    let envelope: ClientEnvelope = state.codec.decode(&frame)?;
    let (version, token) = match envelope {
        ClientEnvelope::Hello { version, token } => (version, token),
        _ => {
            goodbye(conn, &state.codec, "first message must be Hello").await?;
            return Err(loretable_protocol::ProtocolError::InvalidMessage(
                "first message must be Hello".into(),
            )
            .into());
        }
    };

    if version != PROTOCOL_VERSION {
        goodbye(
            conn,
            &state.codec,
            &format!("version mismatch: expected {PROTOCOL_VERSION}, got {version}"),
        )
        .await?;
        return Err(loretable_protocol::ProtocolError::InvalidMessage(
            "protocol version mismatch".into(),
        )
        .into());
    }

    let user_id = match state.identity.authenticate(&token).await {
        Ok(user_id) => user_id,
        Err(e) => {
            goodbye(conn, &state.codec, "unauthorized").await?;
            return Err(LoretableError::Session(e));
        }
    };

    let welcome = ServerEnvelope::Welcome {
        user_id,
        server_time: chrono::Utc::now(),
    };
    send(conn, &state.codec, &welcome).await?;
    Ok(user_id)
}

/// Routes one command to the user's room and replies with its outcome.
#[allow(clippy::too_many_arguments)]
async fn handle_command<T, I, D, C>(
    conn: &T,
    state: &Arc<ServerState<I, D, C>>,
    user_id: UserId,
    room_role: &mut Option<Role>,
    correlation_id: CorrelationId,
    command: ClientCommand,
    event_tx: &loretable_room::EventSender,
) -> Result<(), LoretableError>
where
    T: Connection,
    I: Identity,
    D: EntityDirectory,
    C: Codec + Clone,
{
    let result: Result<CommandReply, CommandError> = match command {
        ClientCommand::JoinRoom {
            room_id,
            entity_id,
            entity_type,
        } => {
            let role = state.identity.role_in_room(user_id, room_id).await;
            let outcome = state
                .rooms
                .lock()
                .await
                .join_room(user_id, role, room_id, entity_id, entity_type, event_tx.clone())
                .await;
            match outcome {
                Ok(join) => {
                    *room_role = Some(role);
                    Ok(CommandReply::State {
                        game_state: Box::new(join.game_state),
                        as_of_seq: join.as_of_seq,
                    })
                }
                Err(e) => Err(flatten_room_error(e)),
            }
        }

        ClientCommand::LeaveRoom => {
            let outcome = state.rooms.lock().await.leave_room(user_id).await;
            match outcome {
                Ok(()) => {
                    *room_role = None;
                    Ok(CommandReply::Left)
                }
                Err(e) => Err(flatten_room_error(e)),
            }
        }

        ClientCommand::GetRoomState => {
            let outcome = state.rooms.lock().await.snapshot_for(user_id).await;
            match outcome {
                Ok((game_state, as_of_seq)) => Ok(CommandReply::State {
                    game_state: Box::new(game_state),
                    as_of_seq,
                }),
                Err(e) => Err(flatten_room_error(e)),
            }
        }

        // Everything else mutates the room through the command processor.
        other => route_room_command(state, user_id, *room_role, correlation_id, other).await,
    };

    let reply = ServerEnvelope::Reply {
        correlation_id,
        body: ReplyBody::from(result),
    };
    send(conn, &state.codec, &reply).await
}

/// Translates a wire command to a domain command and executes it on the
/// user's room, without holding the manager lock across the room
/// round-trip.
async fn route_room_command<I, D, C>(
    state: &Arc<ServerState<I, D, C>>,
    user_id: UserId,
    room_role: Option<Role>,
    correlation_id: CorrelationId,
    command: ClientCommand,
) -> Result<CommandReply, CommandError>
where
    I: Identity,
    D: EntityDirectory,
    C: Codec + Clone,
{
    let Some(role) = room_role else {
        return Err(CommandError::not_found("no active room for caller"));
    };
    let Some((handle, _entity)) = state.rooms.lock().await.seat_handle(user_id) else {
        return Err(CommandError::not_found("no active room for caller"));
    };

    let domain = match command {
        ClientCommand::TakeTurn { action } => Command::TakeTurn { action },
        ClientCommand::SkipTurn { reason } => Command::SkipTurn { reason },
        ClientCommand::SendChatMessage {
            content,
            channel,
            recipients,
            entity_id,
        } => Command::SendChat {
            content,
            channel,
            recipients,
            entity_id,
        },
        ClientCommand::PauseInteraction { reason } => Command::Pause { reason },
        ClientCommand::ResumeInteraction => Command::Resume,
        ClientCommand::RollbackTurn {
            turn_number,
            round_number,
        } => Command::Rollback {
            turn_number,
            round_number,
        },
        ClientCommand::UpdateInitiative { order } => Command::UpdateInitiative { order },
        ClientCommand::StartEncounter => Command::Start,
        ClientCommand::EndEncounter => Command::End,
        ClientCommand::JoinRoom { .. }
        | ClientCommand::LeaveRoom
        | ClientCommand::GetRoomState => unreachable!("handled by the caller"),
    };

    let ctx = CommandContext {
        user_id,
        role,
        source: CommandSource::Client,
    };
    handle
        .execute(ctx, Some(correlation_id), domain)
        .await
        .map_err(flatten_room_error)
}

/// Collapses room-layer errors into the wire's typed command errors.
fn flatten_room_error(error: RoomError) -> CommandError {
    match error {
        RoomError::Command(e) => e,
        RoomError::NotFound(room_id) => CommandError::not_found(format!("room {room_id}")),
        RoomError::AlreadyInRoom(_, room_id) => {
            CommandError::invalid_action(format!("already in room {room_id}"))
        }
        RoomError::NotInRoom(_) => CommandError::not_found("no active room for caller"),
        RoomError::Directory(message) => CommandError::not_found(message),
        RoomError::Unavailable(room_id) => {
            CommandError::not_found(format!("room {room_id} unavailable"))
        }
    }
}

async fn send<T: Connection, C: Codec>(
    conn: &T,
    codec: &C,
    envelope: &ServerEnvelope,
) -> Result<(), LoretableError> {
    let bytes = codec.encode(envelope)?;
    conn.send(&bytes).await.map_err(LoretableError::Transport)
}

async fn goodbye<T: Connection, C: Codec>(
    conn: &T,
    codec: &C,
    reason: &str,
) -> Result<(), LoretableError> {
    send(
        conn,
        codec,
        &ServerEnvelope::Goodbye {
            reason: reason.to_string(),
        },
    )
    .await
}
