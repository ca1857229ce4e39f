//! A scripted skirmish over the in-memory transport: the full engine —
//! server, room actor, turn clock, three client agents — with no sockets.
//!
//! Run with `cargo run -p skirmish` (set `RUST_LOG=info` for the engine's
//! own narration).

use std::time::Duration;

use loretable::LoretableServerBuilder;
use loretable_client::{ClientConfig, ConnectionStatus, SyncAgent};
use loretable_encounter::{
    ActionKind, ChatChannel, EntityId, EntityType, GameState, InteractionStatus, Position, RoomId,
    TurnAction, UserId,
};
use loretable_protocol::JsonCodec;
use loretable_room::StaticDirectory;
use loretable_session::StaticIdentity;
use loretable_transport::{memory_endpoint, MemoryConnector};

const DM: UserId = UserId(1);
const ALICE: UserId = UserId(2);
const BOB: UserId = UserId(3);
const ROOM: RoomId = RoomId(7);

#[tokio::main]
async fn main() {
    loretable::init_tracing();

    let (listener, connector) = memory_endpoint();

    let identity = StaticIdentity::new()
        .with_user("dm", DM)
        .with_user("alice", ALICE)
        .with_user("bob", BOB)
        .with_dm(ROOM, DM);
    let directory = StaticDirectory::new()
        .with_combatant(EntityId(1), "Brynn Ironhand", 24, 17)
        .with_combatant(EntityId(2), "Shadow", 16, 14)
        .with_combatant(EntityId(3), "Cave Troll", 40, 8);

    let server = LoretableServerBuilder::new()
        .turn_budget(Duration::from_secs(90))
        .build(listener, identity, directory);
    server.open_room(ROOM).await;
    tokio::spawn(async move {
        let _ = server.run().await;
    });

    let dm = connect(&connector, "dm", 3, EntityType::Monster).await;
    let alice = connect(&connector, "alice", 1, EntityType::PlayerCharacter).await;
    let bob = connect(&connector, "bob", 2, EntityType::PlayerCharacter).await;

    println!("== the party assembles ==");
    dm.start_encounter().await.expect("start encounter");
    settle(&alice, |s| s.status == InteractionStatus::Active).await;
    narrate(&alice.view().state.expect("joined"));

    alice
        .send_chat("I take point.", ChatChannel::Party, vec![], Some(EntityId(1)))
        .await
        .expect("chat");

    println!("\n== round one ==");
    // Brynn closes in.
    let mut advance = TurnAction::of(ActionKind::Move, EntityId(1));
    advance.position = Some(Position { x: 2, y: 0 });
    alice.take_turn(advance).await.expect("brynn moves");

    // Shadow strikes from the flank.
    let mut stab = TurnAction::of(ActionKind::Attack, EntityId(2));
    stab.target = Some(EntityId(3));
    stab.parameters = Some(serde_json::json!({ "damage": 7 }));
    bob.take_turn(stab).await.expect("shadow attacks");

    // The troll swings back at Brynn.
    let mut swing = TurnAction::of(ActionKind::Attack, EntityId(3));
    swing.target = Some(EntityId(1));
    swing.parameters = Some(serde_json::json!({ "damage": 9 }));
    dm.take_turn(swing).await.expect("troll attacks");

    settle(&alice, |s| s.round_number == 2).await;
    narrate(&alice.view().state.expect("synced"));

    println!("\n== the DM calls a break ==");
    dm.pause("pizza at the door").await.expect("pause");
    settle(&bob, |s| s.status == InteractionStatus::Paused).await;
    println!("  encounter paused; the turn clock holds its remainder");
    dm.resume().await.expect("resume");
    settle(&bob, |s| s.status == InteractionStatus::Active).await;

    println!("\n== round two, and a ruling reversed ==");
    let mut overreach = TurnAction::of(ActionKind::Attack, EntityId(1));
    overreach.target = Some(EntityId(3));
    overreach.parameters = Some(serde_json::json!({ "damage": 11 }));
    alice.take_turn(overreach).await.expect("brynn attacks");
    settle(&dm, |s| s.turn_history.len() == 4).await;

    // The DM decides that swing never landed and rewinds one turn.
    dm.rollback(3, 1).await.expect("rollback");
    settle(&alice, |s| s.turn_history.len() == 3).await;
    println!("  rolled back to the end of round one; Brynn's last blow is undone");
    narrate(&alice.view().state.expect("synced"));

    println!("\n== the encounter ends ==");
    dm.end_encounter().await.expect("end");
    settle(&bob, |s| s.status == InteractionStatus::Completed).await;

    let final_state = bob.view().state.expect("synced");
    println!(
        "  archived after {} recorded turns, {} chat messages",
        final_state.turn_history.len(),
        final_state.chat_log.len()
    );

    alice.leave().await.ok();
    bob.leave().await.ok();
    dm.leave().await.ok();
}

async fn connect(
    connector: &MemoryConnector,
    token: &str,
    entity: u64,
    entity_type: EntityType,
) -> SyncAgent {
    let config = ClientConfig::new(token, ROOM, EntityId(entity), entity_type);
    let agent = SyncAgent::spawn(connector.clone(), JsonCodec, config);
    let mut watch = agent.watch();
    watch
        .wait_for(|v| v.connection == ConnectionStatus::Connected && v.state.is_some())
        .await
        .expect("agent connects");
    agent
}

/// Waits until the agent's settled mirror satisfies the predicate.
async fn settle(agent: &SyncAgent, predicate: impl Fn(&GameState) -> bool) {
    let mut watch = agent.watch();
    watch
        .wait_for(|v| v.in_flight == 0 && v.state.as_ref().is_some_and(&predicate))
        .await
        .expect("agent settles");
}

fn narrate(state: &GameState) {
    println!(
        "  round {}, {} turns recorded",
        state.round_number,
        state.turn_history.len()
    );
    for entry in &state.initiative_order {
        let p = &state.participants[&entry.entity_id];
        let marker = if state
            .active_entry()
            .is_some_and(|e| e.entity_id == entry.entity_id)
        {
            ">"
        } else {
            " "
        };
        println!(
            "  {marker} {:<16} initiative {:>2}  hp {:>2}/{:<2}",
            p.name, entry.initiative_score, p.current_hp, p.max_hp
        );
    }
}
