//! Room manager: opens rooms, seats users, routes commands.
//!
//! Owned by the server behind a mutex; the manager itself does registry
//! bookkeeping only — everything stateful about a room happens inside its
//! actor.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use loretable_encounter::{
    Command, CommandContext, EncounterConfig, EntityId, EntityType, GameState, Role, RoomId,
    UserId,
};
use loretable_protocol::{CommandReply, CorrelationId};
use loretable_scheduler::{TurnClock, TurnClockConfig};

use crate::broadcast::{EventSender, DEFAULT_REPLAY_WINDOW};
use crate::directory::EntityDirectory;
use crate::room::{spawn_room, JoinOutcome, RoomHandle};
use crate::store::RoomStore;
use crate::RoomError;

/// Counter for generating unique room ids.
static NEXT_ROOM_ID: AtomicU64 = AtomicU64::new(1);

/// Default directive channel size for room actors.
const DEFAULT_CHANNEL_SIZE: usize = 64;

/// Where a user currently sits.
#[derive(Debug, Clone, Copy)]
struct Seat {
    room_id: RoomId,
    entity_id: EntityId,
}

/// Tracks all open rooms and which user sits where.
pub struct RoomManager<D> {
    rooms: HashMap<RoomId, RoomHandle>,
    seats: HashMap<UserId, Seat>,
    directory: Arc<D>,
    turn_budget: Duration,
}

impl<D: EntityDirectory> RoomManager<D> {
    pub fn new(directory: D, turn_budget: Duration) -> Self {
        Self {
            rooms: HashMap::new(),
            seats: HashMap::new(),
            directory: Arc::new(directory),
            turn_budget,
        }
    }

    /// Opens a room with a backend-assigned id. Returns `false` (and does
    /// nothing) if the room is already open.
    pub fn open_room(&mut self, room_id: RoomId) -> bool {
        if self.rooms.contains_key(&room_id) {
            return false;
        }
        let store = RoomStore::new(
            room_id,
            chrono::Utc::now(),
            EncounterConfig {
                turn_budget: self.turn_budget,
            },
        );
        let clock = TurnClock::new(TurnClockConfig {
            turn_budget: self.turn_budget,
        });
        let handle = spawn_room(
            room_id,
            store,
            clock,
            DEFAULT_REPLAY_WINDOW,
            DEFAULT_CHANNEL_SIZE,
        );
        self.rooms.insert(room_id, handle);
        tracing::info!(%room_id, "room opened");
        true
    }

    /// Opens a new room under a generated id and returns it.
    pub fn create_room(&mut self) -> RoomId {
        let room_id = RoomId(NEXT_ROOM_ID.fetch_add(1, Ordering::Relaxed));
        self.open_room(room_id);
        room_id
    }

    /// The seated user's room handle and entity, for callers that must
    /// not hold the manager lock across a room round-trip.
    pub fn seat_handle(&self, user_id: UserId) -> Option<(RoomHandle, EntityId)> {
        let seat = self.seats.get(&user_id)?;
        let handle = self.rooms.get(&seat.room_id)?.clone();
        Some((handle, seat.entity_id))
    }

    /// Seats a user in a room with the given entity: resolves the entity
    /// through the directory, admits it, and subscribes the user's event
    /// channel. One room per user at a time.
    pub async fn join_room(
        &mut self,
        user_id: UserId,
        role: Role,
        room_id: RoomId,
        entity_id: EntityId,
        entity_type: EntityType,
        subscriber: EventSender,
    ) -> Result<JoinOutcome, RoomError> {
        if let Some(seat) = self.seats.get(&user_id) {
            return Err(RoomError::AlreadyInRoom(user_id, seat.room_id));
        }
        let handle = self
            .rooms
            .get(&room_id)
            .ok_or(RoomError::NotFound(room_id))?;

        let profile = self.directory.lookup(entity_id).await?;
        let entry = profile.initiative_entry(entity_id, entity_type, user_id);
        let participant = profile.into_participant(entity_id);

        let outcome = handle
            .join(user_id, role, entry, participant, subscriber)
            .await?;
        self.seats.insert(user_id, Seat { room_id, entity_id });
        Ok(outcome)
    }

    /// Removes a user from their room (clean leave with presence event).
    pub async fn leave_room(&mut self, user_id: UserId) -> Result<(), RoomError> {
        let seat = self
            .seats
            .get(&user_id)
            .copied()
            .ok_or(RoomError::NotInRoom(user_id))?;
        if let Some(handle) = self.rooms.get(&seat.room_id) {
            handle.leave(user_id, seat.entity_id).await?;
        }
        self.seats.remove(&user_id);
        Ok(())
    }

    /// Unsubscribes a user after a connection loss, without a presence
    /// event; their seat frees so a reconnect can rejoin.
    pub async fn detach(&mut self, user_id: UserId) {
        if let Some(seat) = self.seats.remove(&user_id) {
            if let Some(handle) = self.rooms.get(&seat.room_id) {
                let _ = handle.detach(user_id).await;
            }
        }
    }

    /// Routes a command to the user's current room.
    pub async fn execute(
        &self,
        user_id: UserId,
        ctx: CommandContext,
        origin: Option<CorrelationId>,
        command: Command,
    ) -> Result<CommandReply, RoomError> {
        let seat = self
            .seats
            .get(&user_id)
            .ok_or(RoomError::NotInRoom(user_id))?;
        let handle = self
            .rooms
            .get(&seat.room_id)
            .ok_or(RoomError::NotFound(seat.room_id))?;
        handle.execute(ctx, origin, command).await
    }

    /// The entity a user is seated as.
    pub fn seated_entity(&self, user_id: UserId) -> Option<EntityId> {
        self.seats.get(&user_id).map(|s| s.entity_id)
    }

    /// The room a user is seated in.
    pub fn seated_room(&self, user_id: UserId) -> Option<RoomId> {
        self.seats.get(&user_id).map(|s| s.room_id)
    }

    /// Full-state snapshot of the user's room (resync path).
    pub async fn snapshot_for(&self, user_id: UserId) -> Result<(GameState, u64), RoomError> {
        let seat = self
            .seats
            .get(&user_id)
            .ok_or(RoomError::NotInRoom(user_id))?;
        let handle = self
            .rooms
            .get(&seat.room_id)
            .ok_or(RoomError::NotFound(seat.room_id))?;
        handle.snapshot().await
    }

    /// Replays buffered events to the user from `from_seq`.
    pub async fn replay_for(&self, user_id: UserId, from_seq: u64) -> Result<(), RoomError> {
        let seat = self
            .seats
            .get(&user_id)
            .ok_or(RoomError::NotInRoom(user_id))?;
        let handle = self
            .rooms
            .get(&seat.room_id)
            .ok_or(RoomError::NotFound(seat.room_id))?;
        handle.replay(user_id, from_seq).await
    }

    /// Shuts a room down and clears every seat in it.
    pub async fn destroy_room(&mut self, room_id: RoomId) -> Result<(), RoomError> {
        let handle = self
            .rooms
            .remove(&room_id)
            .ok_or(RoomError::NotFound(room_id))?;
        let _ = handle.shutdown().await;
        self.seats.retain(|_, seat| seat.room_id != room_id);
        tracing::info!(%room_id, "room destroyed");
        Ok(())
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}
