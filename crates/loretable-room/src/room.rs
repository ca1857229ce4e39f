//! The room actor: an isolated Tokio task owning one room's store.
//!
//! All mutation is serialized through the actor's command channel — two
//! concurrent `TakeTurn` submissions for the same turn are processed one
//! after the other, and the second is rejected with `NotYourTurn` against
//! the already-advanced state. The turn clock lives in the same `select!`
//! loop, so a timeout expiry and a manual command race through one queue:
//! whichever lands first wins, and a stale expiry is dropped silently.

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};

use loretable_encounter::{
    Command, CommandContext, CommandSource, GameState, InitiativeEntry, InteractionStatus,
    ParticipantState, Role, RoomEvent, RoomId, UserId,
};
use loretable_protocol::{CommandReply, CorrelationId};
use loretable_scheduler::{TurnClaim, TurnClock};

use crate::broadcast::{Broadcaster, EventSender};
use crate::store::RoomStore;
use crate::RoomError;

/// What a successful join returns: the authoritative state and the
/// broadcast sequence it already reflects.
#[derive(Debug, Clone)]
pub struct JoinOutcome {
    pub game_state: GameState,
    pub as_of_seq: u64,
}

/// Directives sent to a room actor through its channel.
pub(crate) enum RoomDirective {
    Join {
        user_id: UserId,
        role: Role,
        entry: InitiativeEntry,
        participant: ParticipantState,
        subscriber: EventSender,
        reply: oneshot::Sender<Result<JoinOutcome, RoomError>>,
    },
    Leave {
        user_id: UserId,
        entity_id: loretable_encounter::EntityId,
        reply: oneshot::Sender<Result<(), RoomError>>,
    },
    Execute {
        ctx: CommandContext,
        origin: Option<CorrelationId>,
        command: Command,
        reply: oneshot::Sender<Result<CommandReply, RoomError>>,
    },
    Snapshot {
        reply: oneshot::Sender<(GameState, u64)>,
    },
    Replay {
        user_id: UserId,
        from_seq: u64,
    },
    /// Unsubscribe without a presence event (connection loss; the session
    /// layer may still reconnect them).
    Detach {
        user_id: UserId,
    },
    Shutdown,
}

/// Handle to a running room actor. Cheap to clone.
#[derive(Clone)]
pub struct RoomHandle {
    room_id: RoomId,
    sender: mpsc::Sender<RoomDirective>,
}

impl RoomHandle {
    pub fn room_id(&self) -> RoomId {
        self.room_id
    }

    fn unavailable(&self) -> RoomError {
        RoomError::Unavailable(self.room_id)
    }

    /// Admits a user's entity and subscribes them to the event stream.
    pub async fn join(
        &self,
        user_id: UserId,
        role: Role,
        entry: InitiativeEntry,
        participant: ParticipantState,
        subscriber: EventSender,
    ) -> Result<JoinOutcome, RoomError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.sender
            .send(RoomDirective::Join {
                user_id,
                role,
                entry,
                participant,
                subscriber,
                reply: reply_tx,
            })
            .await
            .map_err(|_| self.unavailable())?;
        reply_rx.await.map_err(|_| self.unavailable())?
    }

    /// Announces departure and unsubscribes.
    pub async fn leave(
        &self,
        user_id: UserId,
        entity_id: loretable_encounter::EntityId,
    ) -> Result<(), RoomError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.sender
            .send(RoomDirective::Leave {
                user_id,
                entity_id,
                reply: reply_tx,
            })
            .await
            .map_err(|_| self.unavailable())?;
        reply_rx.await.map_err(|_| self.unavailable())?
    }

    /// Submits one command and waits for its typed outcome.
    pub async fn execute(
        &self,
        ctx: CommandContext,
        origin: Option<CorrelationId>,
        command: Command,
    ) -> Result<CommandReply, RoomError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.sender
            .send(RoomDirective::Execute {
                ctx,
                origin,
                command,
                reply: reply_tx,
            })
            .await
            .map_err(|_| self.unavailable())?;
        reply_rx.await.map_err(|_| self.unavailable())?
    }

    /// Current state plus the broadcast sequence it reflects (full resync).
    pub async fn snapshot(&self) -> Result<(GameState, u64), RoomError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.sender
            .send(RoomDirective::Snapshot { reply: reply_tx })
            .await
            .map_err(|_| self.unavailable())?;
        reply_rx.await.map_err(|_| self.unavailable())
    }

    /// Requests re-delivery of buffered events from `from_seq`.
    pub async fn replay(&self, user_id: UserId, from_seq: u64) -> Result<(), RoomError> {
        self.sender
            .send(RoomDirective::Replay { user_id, from_seq })
            .await
            .map_err(|_| self.unavailable())
    }

    /// Detaches a subscriber without a presence event.
    pub async fn detach(&self, user_id: UserId) -> Result<(), RoomError> {
        self.sender
            .send(RoomDirective::Detach { user_id })
            .await
            .map_err(|_| self.unavailable())
    }

    /// Tells the room to shut down.
    pub async fn shutdown(&self) -> Result<(), RoomError> {
        self.sender
            .send(RoomDirective::Shutdown)
            .await
            .map_err(|_| self.unavailable())
    }
}

/// The actor state. Runs inside its own Tokio task.
struct RoomActor {
    room_id: RoomId,
    store: RoomStore,
    broadcaster: Broadcaster,
    clock: TurnClock,
    receiver: mpsc::Receiver<RoomDirective>,
}

impl RoomActor {
    async fn run(mut self) {
        tracing::info!(room_id = %self.room_id, "room actor started");

        loop {
            tokio::select! {
                directive = self.receiver.recv() => {
                    match directive {
                        Some(RoomDirective::Shutdown) | None => break,
                        Some(d) => self.handle_directive(d),
                    }
                }
                claim = self.clock.wait_for_expiry() => {
                    self.handle_expiry(claim);
                }
            }
        }

        tracing::info!(room_id = %self.room_id, "room actor stopped");
    }

    fn handle_directive(&mut self, directive: RoomDirective) {
        match directive {
            RoomDirective::Join {
                user_id,
                role,
                entry,
                participant,
                subscriber,
                reply,
            } => {
                let ctx = CommandContext {
                    user_id,
                    role,
                    source: CommandSource::Client,
                };
                let command = Command::Join { entry, participant };
                match self.store.apply(&ctx, &command, Utc::now()) {
                    Ok((state, events)) => {
                        // Subscribe before publishing: the joiner's own
                        // join event arrives with seq <= as_of_seq and is
                        // skipped client-side, but nothing after it can be
                        // missed.
                        self.broadcaster.subscribe(user_id, subscriber);
                        let as_of_seq = self.broadcaster.publish(events, None);
                        self.sync_clock(&state);
                        tracing::info!(
                            room_id = %self.room_id,
                            %user_id,
                            subscribers = self.broadcaster.subscriber_count(),
                            "user joined"
                        );
                        let _ = reply.send(Ok(JoinOutcome {
                            game_state: state,
                            as_of_seq,
                        }));
                    }
                    Err(e) => {
                        let _ = reply.send(Err(RoomError::Command(e)));
                    }
                }
            }

            RoomDirective::Leave {
                user_id,
                entity_id,
                reply,
            } => {
                let ctx = CommandContext {
                    user_id,
                    role: Role::Player,
                    source: CommandSource::Client,
                };
                let result = self
                    .store
                    .apply(&ctx, &Command::Leave { entity_id }, Utc::now());
                match result {
                    Ok((_, events)) => {
                        self.broadcaster.publish(events, None);
                        self.broadcaster.unsubscribe(user_id);
                        tracing::info!(room_id = %self.room_id, %user_id, "user left");
                        let _ = reply.send(Ok(()));
                    }
                    Err(e) => {
                        let _ = reply.send(Err(RoomError::Command(e)));
                    }
                }
            }

            RoomDirective::Execute {
                ctx,
                origin,
                command,
                reply,
            } => {
                let is_chat = matches!(command, Command::SendChat { .. });
                match self.store.apply(&ctx, &command, Utc::now()) {
                    Ok((state, events)) => {
                        let chat_message = if is_chat {
                            events.iter().find_map(|e| match e {
                                RoomEvent::ChatMessage { message } => Some(message.clone()),
                                _ => None,
                            })
                        } else {
                            None
                        };
                        let as_of_seq = self.broadcaster.publish(events, origin);
                        self.sync_clock(&state);

                        let body = match chat_message {
                            // Chat reconciles in place; everything else
                            // replaces the mirror with the full state.
                            Some(message) => CommandReply::Chat {
                                message,
                                as_of_seq,
                            },
                            None => CommandReply::State {
                                game_state: Box::new(state),
                                as_of_seq,
                            },
                        };
                        let _ = reply.send(Ok(body));
                    }
                    Err(e) => {
                        tracing::debug!(
                            room_id = %self.room_id,
                            user = %ctx.user_id,
                            command = command.name(),
                            error = %e,
                            "command rejected"
                        );
                        let _ = reply.send(Err(RoomError::Command(e)));
                    }
                }
            }

            RoomDirective::Snapshot { reply } => {
                let _ = reply.send((self.store.snapshot(), self.broadcaster.last_seq()));
            }

            RoomDirective::Replay { user_id, from_seq } => {
                self.broadcaster.replay_to(user_id, from_seq);
            }

            RoomDirective::Detach { user_id } => {
                self.broadcaster.unsubscribe(user_id);
                tracing::debug!(room_id = %self.room_id, %user_id, "subscriber detached");
            }

            RoomDirective::Shutdown => unreachable!("handled in run()"),
        }
    }

    /// A turn budget expired. Verify the claim still describes the live
    /// turn — a manual command may have won the race — then forfeit the
    /// turn through the ordinary command path.
    fn handle_expiry(&mut self, claim: TurnClaim) {
        let state = self.store.state();
        let still_current = state.status == InteractionStatus::Active
            && state.active_entry().map(|e| e.entity_id) == Some(claim.entity_id)
            && state.turn_history.len() as u32 + 1 == claim.turn_number
            && state.round_number == claim.round_number;

        if !still_current {
            // The race was legitimately lost; no error to surface.
            tracing::trace!(room_id = %self.room_id, ?claim, "stale expiry dropped");
            return;
        }

        tracing::info!(
            room_id = %self.room_id,
            entity = %claim.entity_id,
            turn = claim.turn_number,
            "turn budget expired, forfeiting"
        );
        let result = self.store.apply(
            &CommandContext::scheduler(),
            &Command::SkipTurn {
                reason: "timeout".into(),
            },
            Utc::now(),
        );
        match result {
            Ok((state, events)) => {
                self.broadcaster.publish(events, None);
                self.sync_clock(&state);
            }
            Err(e) => {
                tracing::debug!(room_id = %self.room_id, error = %e, "timeout skip rejected");
            }
        }
    }

    /// Aligns the turn clock with the state after every successful apply.
    /// The state's deadline is authoritative; the clock mirrors it.
    fn sync_clock(&mut self, state: &GameState) {
        match state.status {
            InteractionStatus::Active => {
                let Some(entry) = state.active_entry() else {
                    self.clock.disarm();
                    return;
                };
                let claim = TurnClaim {
                    entity_id: entry.entity_id,
                    turn_number: state.turn_history.len() as u32 + 1,
                    round_number: state.round_number,
                };
                if self.clock.claim() != Some(claim) || !self.clock.is_running() {
                    let remaining = state
                        .turn_deadline
                        .and_then(|d| (d - Utc::now()).to_std().ok())
                        .unwrap_or_else(|| self.clock.budget());
                    self.clock.arm(claim, remaining);
                }
            }
            InteractionStatus::Paused => self.clock.pause(),
            InteractionStatus::Waiting | InteractionStatus::Completed => self.clock.disarm(),
        }
    }
}

/// Spawns a room actor task and returns its handle.
pub(crate) fn spawn_room(
    room_id: RoomId,
    store: RoomStore,
    clock: TurnClock,
    replay_window: usize,
    channel_size: usize,
) -> RoomHandle {
    let (tx, rx) = mpsc::channel(channel_size);
    let actor = RoomActor {
        room_id,
        store,
        broadcaster: Broadcaster::new(replay_window),
        clock,
        receiver: rx,
    };
    tokio::spawn(actor.run());
    RoomHandle {
        room_id,
        sender: tx,
    }
}
