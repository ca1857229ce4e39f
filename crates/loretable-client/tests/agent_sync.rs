//! Agent behavior against a scripted server over the in-memory transport:
//! optimistic apply and revert, chat reconciliation, broadcast folding,
//! and gap recovery — each driven frame by frame so the interleavings are
//! exact.

use std::time::Duration;

use tokio::time::timeout;

use loretable_client::{ClientConfig, ClientError, ConnectionStatus, SyncAgent};
use loretable_encounter::testutil::{entry, participant, ts};
use loretable_encounter::{
    ActionKind, ChatChannel, ChatMessage, ChatMessageId, CommandError, EntityId, EntityType,
    GameState, InteractionStatus, Position, RoomEvent, RoomId, TurnAction, TurnOutcome,
    TurnRecord, UserId,
};
use loretable_protocol::{
    ClientCommand, ClientEnvelope, Codec, CommandReply, CorrelationId, JsonCodec, ReplyBody,
    SequencedEvent, ServerEnvelope,
};
use loretable_transport::{memory_endpoint, Connection, MemoryConnection};

const ME: UserId = UserId(10);
const OTHER: UserId = UserId(20);

/// A scripted server half: receives client envelopes, sends back exactly
/// what each test dictates.
struct Script {
    conn: MemoryConnection,
    codec: JsonCodec,
}

impl Script {
    async fn send(&self, envelope: &ServerEnvelope) {
        let bytes = self.codec.encode(envelope).unwrap();
        self.conn.send(&bytes).await.unwrap();
    }

    /// Next client envelope, skipping heartbeats.
    async fn next(&self) -> ClientEnvelope {
        loop {
            let bytes = timeout(Duration::from_secs(5), self.conn.recv())
                .await
                .expect("client frame within 5s")
                .unwrap()
                .expect("connection open");
            let envelope: ClientEnvelope = self.codec.decode(&bytes).unwrap();
            if !matches!(envelope, ClientEnvelope::Heartbeat { .. }) {
                return envelope;
            }
        }
    }

    /// Next command envelope.
    async fn next_command(&self) -> (CorrelationId, ClientCommand) {
        match self.next().await {
            ClientEnvelope::Command {
                correlation_id,
                command,
            } => (correlation_id, command),
            other => panic!("expected Command, got {other:?}"),
        }
    }
}

/// An active two-combatant encounter: my fighter (entity 1) is up, the
/// other player's rogue (entity 2) follows.
fn base_state() -> GameState {
    let mut state = GameState::new(RoomId(1), ts(0));
    state.admit_participant(entry(1, 18, Some(ME)), participant(1, 20), ts(1));
    state.admit_participant(entry(2, 12, Some(OTHER)), participant(2, 15), ts(2));
    state.status = InteractionStatus::Active;
    state.begin_turn(0, 1, Some(ts(1000)), ts(10));
    state
}

/// Spawns an agent against a scripted server and walks it through the
/// handshake and join. Returns the connected pair.
async fn connected_agent(join_state: GameState, as_of_seq: u64) -> (SyncAgent, Script) {
    let (mut listener, connector) = memory_endpoint();
    let config = ClientConfig::new("me-token", RoomId(1), EntityId(1), EntityType::PlayerCharacter);
    let agent = SyncAgent::spawn(connector, JsonCodec, config);

    use loretable_transport::Transport;
    let conn = listener.accept().await.unwrap();
    let script = Script {
        conn,
        codec: JsonCodec,
    };

    // Handshake.
    match script.next().await {
        ClientEnvelope::Hello { token, .. } => assert_eq!(token, "me-token"),
        other => panic!("expected Hello, got {other:?}"),
    }
    script
        .send(&ServerEnvelope::Welcome {
            user_id: ME,
            server_time: ts(5),
        })
        .await;

    // Join.
    let (join_corr, command) = script.next_command().await;
    assert!(matches!(command, ClientCommand::JoinRoom { .. }));
    script
        .send(&ServerEnvelope::Reply {
            correlation_id: join_corr,
            body: ReplyBody::Ok(CommandReply::State {
                game_state: Box::new(join_state),
                as_of_seq,
            }),
        })
        .await;

    // Wait until the agent reports Connected with a mirror.
    let mut watch = agent.watch();
    watch
        .wait_for(|v| v.connection == ConnectionStatus::Connected && v.state.is_some())
        .await
        .unwrap();

    (agent, script)
}

fn move_action() -> TurnAction {
    let mut action = TurnAction::of(ActionKind::Move, EntityId(1));
    action.position = Some(Position { x: 4, y: 2 });
    action
}

#[tokio::test]
async fn test_optimistic_apply_shows_before_reply_and_reverts_on_rejection() {
    let (agent, script) = connected_agent(base_state(), 3).await;
    let before = agent.view().state.unwrap();

    let turn_agent = agent.clone();
    let turn = tokio::spawn(async move { turn_agent.take_turn(move_action()).await });

    // The optimistic transform is visible before any server answer.
    let (corr, command) = script.next_command().await;
    assert!(matches!(command, ClientCommand::TakeTurn { .. }));
    let mut watch = agent.watch();
    let optimistic = watch
        .wait_for(|v| v.in_flight == 1)
        .await
        .unwrap()
        .state
        .clone()
        .unwrap();
    assert_eq!(optimistic.turn_history.len(), 1);
    assert_eq!(optimistic.current_turn_index, 1);

    // Server says no.
    script
        .send(&ServerEnvelope::Reply {
            correlation_id: corr,
            body: ReplyBody::Err(CommandError::NotYourTurn {
                actor: EntityId(1),
                expected: Some(EntityId(2)),
            }),
        })
        .await;

    let result = turn.await.unwrap();
    assert!(matches!(
        result,
        Err(ClientError::Rejected(CommandError::NotYourTurn { .. }))
    ));

    // Revert correctness: the mirror deep-equals the pre-apply state.
    let mut watch = agent.watch();
    let after = watch
        .wait_for(|v| v.in_flight == 0)
        .await
        .unwrap()
        .state
        .clone()
        .unwrap();
    assert_eq!(after, before);
}

#[tokio::test]
async fn test_successful_turn_replaces_mirror_with_authoritative_state() {
    let (agent, script) = connected_agent(base_state(), 3).await;

    let turn_agent = agent.clone();
    let turn = tokio::spawn(async move { turn_agent.take_turn(move_action()).await });

    let (corr, _command) = script.next_command().await;

    // The authoritative state disagrees with the optimistic prediction in
    // a visible way (server moved the fighter elsewhere); server wins.
    let mut authoritative = base_state();
    authoritative
        .participants
        .get_mut(&EntityId(1))
        .unwrap()
        .position = Position { x: 9, y: 9 };
    authoritative.record_turn(TurnRecord {
        actor_entity_id: EntityId(1),
        turn_number: 1,
        round_number: 1,
        actions: vec![move_action()],
        started_at: ts(10),
        ended_at: Some(ts(20)),
        outcome: TurnOutcome::Completed,
    });
    authoritative.begin_turn(1, 1, Some(ts(1100)), ts(20));

    script
        .send(&ServerEnvelope::Reply {
            correlation_id: corr,
            body: ReplyBody::Ok(CommandReply::State {
                game_state: Box::new(authoritative.clone()),
                as_of_seq: 5,
            }),
        })
        .await;

    turn.await.unwrap().unwrap();
    let mut watch = agent.watch();
    let mirror = watch
        .wait_for(|v| v.in_flight == 0)
        .await
        .unwrap()
        .state
        .clone()
        .unwrap();
    assert_eq!(mirror, authoritative, "server state replaces, no merge");
}

#[tokio::test]
async fn test_chat_provisional_id_reconciled_in_place() {
    let (agent, script) = connected_agent(base_state(), 3).await;

    let chat_agent = agent.clone();
    let chat = tokio::spawn(async move {
        chat_agent
            .send_chat("have at thee", ChatChannel::Party, vec![], Some(EntityId(1)))
            .await
    });

    let (corr, command) = script.next_command().await;
    let ClientCommand::SendChatMessage { content, .. } = &command else {
        panic!("expected SendChatMessage");
    };
    assert_eq!(content, "have at thee");

    // Provisional entry visible, namespaced unambiguously.
    let mut watch = agent.watch();
    let optimistic = watch
        .wait_for(|v| v.in_flight == 1)
        .await
        .unwrap()
        .state
        .clone()
        .unwrap();
    assert_eq!(optimistic.chat_log.len(), 1);
    assert!(optimistic.chat_log[0].id.is_provisional());

    // Server assigns the real id.
    let server_message = ChatMessage {
        id: ChatMessageId::server(42),
        sender_user_id: ME,
        entity_id: Some(EntityId(1)),
        content: "have at thee".into(),
        channel: ChatChannel::Party,
        recipients: vec![],
        timestamp: ts(30),
    };
    script
        .send(&ServerEnvelope::Reply {
            correlation_id: corr,
            body: ReplyBody::Ok(CommandReply::Chat {
                message: server_message.clone(),
                as_of_seq: 4,
            }),
        })
        .await;

    let delivered = chat.await.unwrap().unwrap();
    assert_eq!(delivered.id, ChatMessageId::server(42));

    // Exactly one message, with the final id — not two entries.
    let mut watch = agent.watch();
    let mirror = watch
        .wait_for(|v| v.in_flight == 0)
        .await
        .unwrap()
        .state
        .clone()
        .unwrap();
    assert_eq!(mirror.chat_log.len(), 1);
    assert_eq!(mirror.chat_log[0].id, ChatMessageId::server(42));
    assert_eq!(mirror.chat_log[0].content, "have at thee");
}

#[tokio::test]
async fn test_broadcast_events_from_others_fold_into_mirror() {
    let (agent, script) = connected_agent(base_state(), 3).await;

    // Another player chats; the event arrives purely via broadcast.
    let message = ChatMessage {
        id: ChatMessageId::server(1),
        sender_user_id: OTHER,
        entity_id: Some(EntityId(2)),
        content: "flanking left".into(),
        channel: ChatChannel::Party,
        recipients: vec![],
        timestamp: ts(40),
    };
    script
        .send(&ServerEnvelope::Event {
            event: SequencedEvent {
                seq: 4,
                origin: Some(CorrelationId::new()),
                event: RoomEvent::ChatMessage { message },
            },
        })
        .await;

    let mut watch = agent.watch();
    let mirror = watch
        .wait_for(|v| {
            v.state
                .as_ref()
                .is_some_and(|s| !s.chat_log.is_empty())
        })
        .await
        .unwrap()
        .state
        .clone()
        .unwrap();
    assert_eq!(mirror.chat_log[0].content, "flanking left");
    assert_eq!(mirror.next_message_seq, 2, "fold advances the id counter");
}

#[tokio::test]
async fn test_stale_events_below_as_of_seq_are_skipped() {
    let (agent, script) = connected_agent(base_state(), 3).await;

    // A redelivery of something the join snapshot already covers.
    let message = ChatMessage {
        id: ChatMessageId::server(9),
        sender_user_id: OTHER,
        entity_id: None,
        content: "old news".into(),
        channel: ChatChannel::Party,
        recipients: vec![],
        timestamp: ts(2),
    };
    script
        .send(&ServerEnvelope::Event {
            event: SequencedEvent {
                seq: 2,
                origin: None,
                event: RoomEvent::ChatMessage { message },
            },
        })
        .await;

    // Give the agent a beat, then confirm nothing was double-applied.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let mirror = agent.view().state.unwrap();
    assert!(mirror.chat_log.is_empty());
}

#[tokio::test]
async fn test_sequence_gap_requests_replay_and_blocks_commands() {
    let (agent, script) = connected_agent(base_state(), 3).await;

    // Sequence jumps from 3 to 6: events 4 and 5 are missing.
    script
        .send(&ServerEnvelope::Event {
            event: SequencedEvent {
                seq: 6,
                origin: None,
                event: RoomEvent::InteractionPaused {
                    reason: "whoops".into(),
                    remaining_ms: 1_000,
                    at: ts(50),
                },
            },
        })
        .await;

    // The agent asks for the missing range.
    match script.next().await {
        ClientEnvelope::ReplayFrom { seq } => assert_eq!(seq, 4),
        other => panic!("expected ReplayFrom, got {other:?}"),
    }

    // While stale, mutating commands fail fast.
    let mut watch = agent.watch();
    watch.wait_for(|v| v.stale).await.unwrap();
    let result = agent.take_turn(move_action()).await;
    assert!(matches!(result, Err(ClientError::Stale)));

    // Replay redelivers the missing range, the dropped event included.
    for (seq, at) in [(4u64, 51i64), (5, 52)] {
        let message = ChatMessage {
            id: ChatMessageId::server(seq),
            sender_user_id: OTHER,
            entity_id: None,
            content: format!("catchup {seq}"),
            channel: ChatChannel::Party,
            recipients: vec![],
            timestamp: ts(at),
        };
        script
            .send(&ServerEnvelope::Event {
                event: SequencedEvent {
                    seq,
                    origin: None,
                    event: RoomEvent::ChatMessage { message },
                },
            })
            .await;
    }
    script
        .send(&ServerEnvelope::Event {
            event: SequencedEvent {
                seq: 6,
                origin: None,
                event: RoomEvent::InteractionPaused {
                    reason: "whoops".into(),
                    remaining_ms: 1_000,
                    at: ts(53),
                },
            },
        })
        .await;

    let mut watch = agent.watch();
    let view = watch
        .wait_for(|v| {
            !v.stale
                && v.state.as_ref().is_some_and(|s| {
                    s.chat_log.len() == 2 && s.status == InteractionStatus::Paused
                })
        })
        .await
        .unwrap()
        .clone();
    let state = view.state.unwrap();
    assert_eq!(state.paused_remaining_ms, Some(1_000));
}

#[tokio::test]
async fn test_commands_while_disconnected_fail_fast() {
    // A connector whose listener is gone: dialing fails forever.
    let (listener, connector) = memory_endpoint();
    drop(listener);

    let config = ClientConfig::new("me-token", RoomId(1), EntityId(1), EntityType::PlayerCharacter);
    let agent = SyncAgent::spawn(connector, JsonCodec, config);

    let result = timeout(Duration::from_secs(2), agent.take_turn(move_action()))
        .await
        .expect("fail fast, not queue");
    assert!(matches!(result, Err(ClientError::NotConnected)));
}

#[tokio::test]
async fn test_two_in_flight_mutations_revert_independently() {
    let (agent, script) = connected_agent(base_state(), 3).await;

    // A: a turn; B: a chat. Both in flight at once.
    let a_agent = agent.clone();
    let a = tokio::spawn(async move { a_agent.take_turn(move_action()).await });
    let (corr_a, _) = script.next_command().await;

    let b_agent = agent.clone();
    let b = tokio::spawn(async move {
        b_agent
            .send_chat("still here", ChatChannel::Party, vec![], None)
            .await
    });
    let (corr_b, _) = script.next_command().await;

    let mut watch = agent.watch();
    watch.wait_for(|v| v.in_flight == 2).await.unwrap();

    // A fails; B must survive untouched.
    script
        .send(&ServerEnvelope::Reply {
            correlation_id: corr_a,
            body: ReplyBody::Err(CommandError::NotYourTurn {
                actor: EntityId(1),
                expected: Some(EntityId(2)),
            }),
        })
        .await;
    assert!(a.await.unwrap().is_err());

    let mut watch = agent.watch();
    let mid = watch
        .wait_for(|v| v.in_flight == 1)
        .await
        .unwrap()
        .state
        .clone()
        .unwrap();
    assert_eq!(mid.turn_history.len(), 0, "A's optimistic turn reverted");
    assert_eq!(mid.chat_log.len(), 1, "B's provisional chat survives");

    // B then succeeds normally.
    let server_message = ChatMessage {
        id: ChatMessageId::server(1),
        sender_user_id: ME,
        entity_id: None,
        content: "still here".into(),
        channel: ChatChannel::Party,
        recipients: vec![],
        timestamp: ts(60),
    };
    script
        .send(&ServerEnvelope::Reply {
            correlation_id: corr_b,
            body: ReplyBody::Ok(CommandReply::Chat {
                message: server_message,
                as_of_seq: 4,
            }),
        })
        .await;
    let delivered = b.await.unwrap().unwrap();
    assert_eq!(delivered.id, ChatMessageId::server(1));
}
