//! Integration tests for the room layer: actor serialization, sequenced
//! broadcast, timeout forfeiture, and pause/resume — over real room actors
//! with Tokio's paused clock driving the turn budget.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use loretable_encounter::{
    ActionKind, Command, CommandContext, CommandError, EntityId, EntityType, InteractionStatus,
    Role, RoomEvent, TurnAction, TurnOutcome, UserId,
};
use loretable_protocol::{CommandReply, CorrelationId, SequencedEvent};
use loretable_room::{RoomError, RoomManager, StaticDirectory};

const DM: UserId = UserId(9);
const ALICE: UserId = UserId(10);
const BOB: UserId = UserId(20);

fn directory() -> StaticDirectory {
    StaticDirectory::new()
        .with_combatant(EntityId(1), "Brynn", 20, 18)
        .with_combatant(EntityId(2), "Shadow", 15, 12)
        .with_combatant(EntityId(3), "Goblin", 10, 5)
}

struct Subscriber {
    rx: mpsc::UnboundedReceiver<SequencedEvent>,
}

impl Subscriber {
    fn drain(&mut self) -> Vec<SequencedEvent> {
        let mut out = Vec::new();
        while let Ok(e) = self.rx.try_recv() {
            out.push(e);
        }
        out
    }
}

/// Seats the DM (as the goblin), Alice, and Bob, and starts the encounter.
/// Returns the manager and the three subscribers in that order.
async fn seated_room(
    manager: &mut RoomManager<StaticDirectory>,
) -> (Subscriber, Subscriber, Subscriber) {
    let room_id = manager.create_room();

    let (dm_tx, dm_rx) = mpsc::unbounded_channel();
    let (alice_tx, alice_rx) = mpsc::unbounded_channel();
    let (bob_tx, bob_rx) = mpsc::unbounded_channel();

    manager
        .join_room(
            DM,
            Role::DungeonMaster,
            room_id,
            EntityId(3),
            EntityType::Monster,
            dm_tx,
        )
        .await
        .expect("dm join");
    manager
        .join_room(
            ALICE,
            Role::Player,
            room_id,
            EntityId(1),
            EntityType::PlayerCharacter,
            alice_tx,
        )
        .await
        .expect("alice join");
    manager
        .join_room(
            BOB,
            Role::Player,
            room_id,
            EntityId(2),
            EntityType::PlayerCharacter,
            bob_tx,
        )
        .await
        .expect("bob join");

    manager
        .execute(DM, CommandContext::dm(DM), None, Command::Start)
        .await
        .expect("start");

    (
        Subscriber { rx: dm_rx },
        Subscriber { rx: alice_rx },
        Subscriber { rx: bob_rx },
    )
}

fn move_action(actor: u64) -> TurnAction {
    let mut a = TurnAction::of(ActionKind::Move, EntityId(actor));
    a.position = Some(loretable_encounter::Position { x: 1, y: 1 });
    a
}

fn state_of(reply: CommandReply) -> loretable_encounter::GameState {
    match reply {
        CommandReply::State { game_state, .. } => *game_state,
        other => panic!("expected State reply, got {other:?}"),
    }
}

#[tokio::test]
async fn test_events_carry_monotonic_sequence_numbers() {
    let mut manager = RoomManager::new(directory(), Duration::from_secs(90));
    let (_dm, mut alice, _bob) = seated_room(&mut manager).await;
    alice.drain();

    manager
        .execute(
            ALICE,
            CommandContext::player(ALICE),
            Some(CorrelationId::new()),
            Command::TakeTurn {
                action: move_action(1),
            },
        )
        .await
        .expect("take turn");

    let events = alice.drain();
    assert!(!events.is_empty());
    let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
    let mut sorted = seqs.clone();
    sorted.sort_unstable();
    assert_eq!(seqs, sorted, "sequence numbers must be increasing");
}

#[tokio::test]
async fn test_every_subscriber_receives_each_event() {
    let mut manager = RoomManager::new(directory(), Duration::from_secs(90));
    let (mut dm, mut alice, mut bob) = seated_room(&mut manager).await;
    dm.drain();
    alice.drain();
    bob.drain();

    let origin = CorrelationId::new();
    manager
        .execute(
            ALICE,
            CommandContext::player(ALICE),
            Some(origin),
            Command::TakeTurn {
                action: move_action(1),
            },
        )
        .await
        .expect("take turn");

    for (name, sub) in [("dm", &mut dm), ("alice", &mut alice), ("bob", &mut bob)] {
        let events = sub.drain();
        assert!(
            events
                .iter()
                .any(|e| matches!(e.event, RoomEvent::TurnCompleted { .. })),
            "{name} missed TurnCompleted"
        );
        // The origin correlation id rides along for reconciliation,
        // including to the submitter.
        assert!(events.iter().all(|e| e.origin == Some(origin)));
    }
}

#[tokio::test]
async fn test_concurrent_take_turn_exactly_one_wins() {
    let mut manager = RoomManager::new(directory(), Duration::from_secs(90));
    let (_dm, _alice, _bob) = seated_room(&mut manager).await;
    let manager = Arc::new(manager);

    // Alice and the DM both submit a turn for Brynn simultaneously; the
    // actor serializes them, so the second sees the advanced state.
    let m1 = Arc::clone(&manager);
    let t1 = tokio::spawn(async move {
        m1.execute(
            ALICE,
            CommandContext::player(ALICE),
            Some(CorrelationId::new()),
            Command::TakeTurn {
                action: move_action(1),
            },
        )
        .await
    });
    let m2 = Arc::clone(&manager);
    let t2 = tokio::spawn(async move {
        m2.execute(
            DM,
            CommandContext::dm(DM),
            Some(CorrelationId::new()),
            Command::TakeTurn {
                action: move_action(1),
            },
        )
        .await
    });

    let r1 = t1.await.unwrap();
    let r2 = t2.await.unwrap();

    let oks = [&r1, &r2].iter().filter(|r| r.is_ok()).count();
    assert_eq!(oks, 1, "exactly one concurrent TakeTurn may succeed");

    let loser = if r1.is_err() { r1 } else { r2 };
    assert!(matches!(
        loser,
        Err(RoomError::Command(CommandError::NotYourTurn { .. }))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_turn_budget_expiry_forfeits_through_command_path() {
    let mut manager = RoomManager::new(directory(), Duration::from_secs(90));
    let (_dm, mut alice, _bob) = seated_room(&mut manager).await;
    alice.drain();

    // Nobody acts; the paused clock sweeps past the 90 s budget.
    tokio::time::sleep(Duration::from_secs(95)).await;

    let events = alice.drain();
    let skipped = events.iter().find_map(|e| match &e.event {
        RoomEvent::TurnSkipped { record, reason } => Some((record.clone(), reason.clone())),
        _ => None,
    });
    let (record, reason) = skipped.expect("timeout must broadcast TurnSkipped");
    assert_eq!(record.outcome, TurnOutcome::TimedOut);
    assert_eq!(record.actor_entity_id, EntityId(1));
    assert_eq!(reason, "timeout");

    // The turn advanced to Shadow.
    let (state, _) = manager.snapshot_for(ALICE).await.expect("snapshot");
    assert_eq!(state.active_entry().unwrap().entity_id, EntityId(2));
}

#[tokio::test(start_paused = true)]
async fn test_pause_suspends_turn_countdown() {
    let mut manager = RoomManager::new(directory(), Duration::from_secs(90));
    let (_dm, mut alice, _bob) = seated_room(&mut manager).await;

    manager
        .execute(
            DM,
            CommandContext::dm(DM),
            None,
            Command::Pause {
                reason: "rules check".into(),
            },
        )
        .await
        .expect("pause");
    alice.drain();

    // Hours pass while paused; no forfeiture may fire.
    tokio::time::sleep(Duration::from_secs(7200)).await;
    let events = alice.drain();
    assert!(
        !events
            .iter()
            .any(|e| matches!(e.event, RoomEvent::TurnSkipped { .. })),
        "paused encounter must not time out"
    );

    // Resume, then the remaining (full) budget runs down normally.
    manager
        .execute(DM, CommandContext::dm(DM), None, Command::Resume)
        .await
        .expect("resume");
    tokio::time::sleep(Duration::from_secs(95)).await;
    let events = alice.drain();
    assert!(
        events
            .iter()
            .any(|e| matches!(e.event, RoomEvent::TurnSkipped { .. })),
        "countdown resumes after Resume"
    );
}

#[tokio::test]
async fn test_snapshot_is_idempotent_between_commands() {
    let mut manager = RoomManager::new(directory(), Duration::from_secs(90));
    let (_dm, _alice, _bob) = seated_room(&mut manager).await;

    let (s1, seq1) = manager.snapshot_for(ALICE).await.expect("first");
    let (s2, seq2) = manager.snapshot_for(ALICE).await.expect("second");
    assert_eq!(s1, s2);
    assert_eq!(seq1, seq2);
}

#[tokio::test]
async fn test_join_while_seated_elsewhere_is_rejected() {
    let mut manager = RoomManager::new(directory(), Duration::from_secs(90));
    let room_a = manager.create_room();
    let room_b = manager.create_room();

    let (tx1, _rx1) = mpsc::unbounded_channel();
    manager
        .join_room(
            ALICE,
            Role::Player,
            room_a,
            EntityId(1),
            EntityType::PlayerCharacter,
            tx1,
        )
        .await
        .expect("first join");

    let (tx2, _rx2) = mpsc::unbounded_channel();
    let err = manager
        .join_room(
            ALICE,
            Role::Player,
            room_b,
            EntityId(2),
            EntityType::PlayerCharacter,
            tx2,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, RoomError::AlreadyInRoom(u, r) if u == ALICE && r == room_a));
}

#[tokio::test]
async fn test_unknown_entity_join_surfaces_directory_error() {
    let mut manager = RoomManager::new(directory(), Duration::from_secs(90));
    let room_id = manager.create_room();
    let (tx, _rx) = mpsc::unbounded_channel();
    let err = manager
        .join_room(
            ALICE,
            Role::Player,
            room_id,
            EntityId(404),
            EntityType::PlayerCharacter,
            tx,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, RoomError::Directory(_)));
}

#[tokio::test]
async fn test_detach_frees_seat_for_rejoin() {
    let mut manager = RoomManager::new(directory(), Duration::from_secs(90));
    let room_id = manager.create_room();

    let (tx, _rx) = mpsc::unbounded_channel();
    manager
        .join_room(
            ALICE,
            Role::Player,
            room_id,
            EntityId(1),
            EntityType::PlayerCharacter,
            tx,
        )
        .await
        .expect("join");

    // Connection lost: detach, then reconnect and rejoin the same entity.
    manager.detach(ALICE).await;
    let (tx2, mut rx2) = mpsc::unbounded_channel();
    let outcome = manager
        .join_room(
            ALICE,
            Role::Player,
            room_id,
            EntityId(1),
            EntityType::PlayerCharacter,
            tx2,
        )
        .await
        .expect("rejoin after detach");

    // The participant was not duplicated by the rejoin.
    assert_eq!(outcome.game_state.participants.len(), 1);
    assert_eq!(outcome.game_state.initiative_order.len(), 1);
    // And the fresh subscription is live.
    assert!(rx2.try_recv().is_ok(), "rejoin publishes a presence event");
}

#[tokio::test]
async fn test_chat_reply_is_partial_not_full_state() {
    let mut manager = RoomManager::new(directory(), Duration::from_secs(90));
    let (_dm, _alice, _bob) = seated_room(&mut manager).await;

    let reply = manager
        .execute(
            BOB,
            CommandContext::player(BOB),
            Some(CorrelationId::new()),
            Command::SendChat {
                content: "quietly loots the shelf".into(),
                channel: loretable_encounter::ChatChannel::Party,
                recipients: vec![],
                entity_id: Some(EntityId(2)),
            },
        )
        .await
        .expect("chat");

    match reply {
        CommandReply::Chat { message, .. } => {
            assert_eq!(message.id.0, "msg-1");
            assert!(!message.id.is_provisional());
        }
        other => panic!("expected Chat reply, got {other:?}"),
    }
}

#[tokio::test]
async fn test_turn_reply_carries_full_state() {
    let mut manager = RoomManager::new(directory(), Duration::from_secs(90));
    let (_dm, _alice, _bob) = seated_room(&mut manager).await;

    let reply = manager
        .execute(
            ALICE,
            CommandContext::player(ALICE),
            Some(CorrelationId::new()),
            Command::TakeTurn {
                action: move_action(1),
            },
        )
        .await
        .expect("take turn");

    let state = state_of(reply);
    assert_eq!(state.turn_history.len(), 1);
    assert_eq!(state.status, InteractionStatus::Active);
}
