//! The client synchronization agent.
//!
//! One agent per connected client: a cheap [`SyncAgent`] handle plus a
//! background task that owns everything mutable. The task's single loop is
//! the only writer of the local mirror — optimistic applies, reply
//! reconciliation, and broadcast folding all pass through one ordered
//! queue, so none of them can interleave inside each other.
//!
//! Lifecycle: the caller constructs the agent to join a room and drops it
//! (or calls [`SyncAgent::leave`]) to tear the session down. Channel loss
//! flips the view to `Disconnected`, reverts what was in flight (outcome
//! unknown), and re-dials with exponential backoff; the rejoin pulls a
//! full resync, so a command that actually landed server-side is picked up
//! again there.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;

use loretable_encounter::{
    event as room_event, ChatChannel, ChatMessage, ChatMessageId, EncounterConfig, EntityId,
    EntityType, GameState, InitiativeEntry, RoomEvent, RoomId, TurnAction, UserId,
    PROVISIONAL_ID_PREFIX,
};
use loretable_protocol::{
    ClientCommand, ClientEnvelope, Codec, CommandReply, CorrelationId, ReplyBody, SequencedEvent,
    ServerEnvelope, PROTOCOL_VERSION,
};
use loretable_transport::{Connection, Connector};

use crate::pending::{reconcile_chat, InFlightTable, LocalContext, LocalTransform, PendingMutation};
use crate::view::{ClientView, ConnectionStatus};
use crate::ClientError;

/// How often the agent pings the server.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// How long the handshake and join may take before a retry.
const ESTABLISH_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Everything needed to open one client session.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Auth token, opaque to the engine.
    pub token: String,
    pub room_id: RoomId,
    pub entity_id: EntityId,
    pub entity_type: EntityType,
    /// Delivery timeout per command; expiry reverts the optimistic
    /// mutation and surfaces [`ClientError::Timeout`].
    pub command_timeout: Duration,
    /// First reconnect delay; doubles per attempt up to `max_backoff`.
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Mirror of the server's encounter tunables, used by optimistic
    /// transforms.
    pub encounter: EncounterConfig,
}

impl ClientConfig {
    pub fn new(
        token: impl Into<String>,
        room_id: RoomId,
        entity_id: EntityId,
        entity_type: EntityType,
    ) -> Self {
        Self {
            token: token.into(),
            room_id,
            entity_id,
            entity_type,
            command_timeout: Duration::from_secs(10),
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            encounter: EncounterConfig::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// What a resolved command hands back to the caller.
#[derive(Debug)]
pub enum CommandOutcome {
    /// The mirror was replaced with the authoritative state.
    State,
    /// The chat message with its final server id.
    Chat(ChatMessage),
    /// Acknowledged, no payload.
    Ack,
}

enum AgentOp {
    Issue {
        command: ClientCommand,
        responder: oneshot::Sender<Result<CommandOutcome, ClientError>>,
    },
    Timeout {
        correlation_id: CorrelationId,
    },
    Leave {
        responder: oneshot::Sender<Result<(), ClientError>>,
    },
}

/// Handle to a running client agent. Cheap to clone; dropping every handle
/// shuts the agent down.
#[derive(Clone)]
pub struct SyncAgent {
    ops: mpsc::UnboundedSender<AgentOp>,
    view_rx: watch::Receiver<ClientView>,
}

impl SyncAgent {
    /// Spawns the agent task: dial, handshake, join, then serve.
    pub fn spawn<K, C>(connector: K, codec: C, config: ClientConfig) -> SyncAgent
    where
        K: Connector,
        C: Codec + Clone,
    {
        let (ops_tx, ops_rx) = mpsc::unbounded_channel();
        let (view_tx, view_rx) = watch::channel(ClientView::initial());

        let task = AgentTask {
            connector,
            codec,
            config,
            ops: ops_rx,
            ops_tx: ops_tx.clone(),
            view_tx,
            user_id: None,
            authority: None,
            table: InFlightTable::new(),
            responders: HashMap::new(),
            provisional_ids: HashMap::new(),
            last_seq: 0,
            stale: false,
            connection: ConnectionStatus::Connecting,
        };
        tokio::spawn(task.run());

        SyncAgent {
            ops: ops_tx,
            view_rx,
        }
    }

    /// The current view snapshot.
    pub fn view(&self) -> ClientView {
        self.view_rx.borrow().clone()
    }

    /// A watch receiver for change-driven UIs.
    pub fn watch(&self) -> watch::Receiver<ClientView> {
        self.view_rx.clone()
    }

    async fn issue(&self, command: ClientCommand) -> Result<CommandOutcome, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.ops
            .send(AgentOp::Issue {
                command,
                responder: tx,
            })
            .map_err(|_| ClientError::Closed)?;
        rx.await.map_err(|_| ClientError::Closed)?
    }

    /// Takes the local participant's turn.
    pub async fn take_turn(&self, action: TurnAction) -> Result<(), ClientError> {
        self.issue(ClientCommand::TakeTurn { action }).await.map(|_| ())
    }

    /// Forfeits the active turn.
    pub async fn skip_turn(&self, reason: impl Into<String>) -> Result<(), ClientError> {
        self.issue(ClientCommand::SkipTurn {
            reason: reason.into(),
        })
        .await
        .map(|_| ())
    }

    /// Sends a chat message; resolves to the reconciled server message.
    pub async fn send_chat(
        &self,
        content: impl Into<String>,
        channel: ChatChannel,
        recipients: Vec<UserId>,
        entity_id: Option<EntityId>,
    ) -> Result<ChatMessage, ClientError> {
        match self
            .issue(ClientCommand::SendChatMessage {
                content: content.into(),
                channel,
                recipients,
                entity_id,
            })
            .await?
        {
            CommandOutcome::Chat(message) => Ok(message),
            _ => Err(ClientError::Protocol("expected chat reply".into())),
        }
    }

    pub async fn pause(&self, reason: impl Into<String>) -> Result<(), ClientError> {
        self.issue(ClientCommand::PauseInteraction {
            reason: reason.into(),
        })
        .await
        .map(|_| ())
    }

    pub async fn resume(&self) -> Result<(), ClientError> {
        self.issue(ClientCommand::ResumeInteraction).await.map(|_| ())
    }

    pub async fn start_encounter(&self) -> Result<(), ClientError> {
        self.issue(ClientCommand::StartEncounter).await.map(|_| ())
    }

    pub async fn end_encounter(&self) -> Result<(), ClientError> {
        self.issue(ClientCommand::EndEncounter).await.map(|_| ())
    }

    /// DM-only: rewind to the end of an earlier turn.
    pub async fn rollback(&self, turn_number: u32, round_number: u32) -> Result<(), ClientError> {
        self.issue(ClientCommand::RollbackTurn {
            turn_number,
            round_number,
        })
        .await
        .map(|_| ())
    }

    /// DM-only: replace the initiative order.
    pub async fn update_initiative(
        &self,
        order: Vec<InitiativeEntry>,
    ) -> Result<(), ClientError> {
        self.issue(ClientCommand::UpdateInitiative { order })
            .await
            .map(|_| ())
    }

    /// Forces a full resync of the mirror.
    pub async fn resync(&self) -> Result<(), ClientError> {
        self.issue(ClientCommand::GetRoomState).await.map(|_| ())
    }

    /// Clean leave: reverts anything in flight, announces departure, and
    /// shuts the agent down.
    pub async fn leave(&self) -> Result<(), ClientError> {
        let (tx, rx) = oneshot::channel();
        self.ops
            .send(AgentOp::Leave { responder: tx })
            .map_err(|_| ClientError::Closed)?;
        rx.await.map_err(|_| ClientError::Closed)?
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// Disposes of an op that arrived while no channel exists. Returns `true`
/// when the op was a leave, which ends the agent.
fn reject_op(op: AgentOp) -> bool {
    match op {
        AgentOp::Issue { responder, .. } => {
            let _ = responder.send(Err(ClientError::NotConnected));
            false
        }
        AgentOp::Timeout { .. } => false,
        AgentOp::Leave { responder } => {
            let _ = responder.send(Ok(()));
            true
        }
    }
}

struct AgentTask<K: Connector, C: Codec> {
    connector: K,
    codec: C,
    config: ClientConfig,
    ops: mpsc::UnboundedReceiver<AgentOp>,
    ops_tx: mpsc::UnboundedSender<AgentOp>,
    view_tx: watch::Sender<ClientView>,

    user_id: Option<UserId>,
    /// Last server-confirmed state. The mirror is this plus the in-flight
    /// table, never mutated directly by optimistic code.
    authority: Option<GameState>,
    table: InFlightTable,
    responders: HashMap<CorrelationId, oneshot::Sender<Result<CommandOutcome, ClientError>>>,
    /// Provisional chat ids by correlation, for in-place reconciliation.
    provisional_ids: HashMap<CorrelationId, ChatMessageId>,
    /// Highest broadcast sequence reflected in `authority`.
    last_seq: u64,
    stale: bool,
    connection: ConnectionStatus,
}

impl<K, C> AgentTask<K, C>
where
    K: Connector,
    C: Codec + Clone,
{
    async fn run(mut self) {
        let mut backoff = self.config.initial_backoff;
        use std::io::Write as _; let dbg=|m:&str|{let mut f=std::fs::OpenOptions::new().create(true).append(true).open("/tmp/dbg.log").unwrap(); writeln!(f,"{m}").unwrap(); f.flush().unwrap();}; dbg("run start");

        loop {
            self.connection = ConnectionStatus::Connecting;
            self.publish();

            let Some(conn) = self.dial(&mut backoff).await else {
                return; // every handle dropped or leave requested
            };

            dbg("dialed, establishing");
            match tokio::time::timeout(ESTABLISH_TIMEOUT, self.establish(&conn)).await {
                Ok(Ok(())) => {
                    dbg("establish OK");
                    backoff = self.config.initial_backoff;
                }
                Ok(Err(e)) => {
                    dbg(&format!("establish ERR: {e}"));
                    tracing::warn!(error = %e, "session establish failed");
                    let _ = conn.close().await;
                    if !self.sleep_rejecting_ops(backoff).await {
                        return;
                    }
                    backoff = (backoff * 2).min(self.config.max_backoff);
                    continue;
                }
                Err(_) => {
                    tracing::warn!("session establish timed out");
                    let _ = conn.close().await;
                    if !self.sleep_rejecting_ops(backoff).await {
                        return;
                    }
                    backoff = (backoff * 2).min(self.config.max_backoff);
                    continue;
                }
            }

            self.connection = ConnectionStatus::Connected;
            self.publish();

            let terminal = self.serve(&conn).await;
            self.on_channel_down();
            self.connection = ConnectionStatus::Disconnected;
            self.publish();

            if terminal {
                let _ = conn.close().await;
                return;
            }
            // Channel lost: automatic retry.
        }
    }

    /// Dials until a connection lands. Commands issued meanwhile fail
    /// fast with `NotConnected` instead of queueing — the channel is not
    /// there to carry them. Returns `None` when the agent should end.
    async fn dial(&mut self, backoff: &mut Duration) -> Option<K::Connection> {
        loop {
            let attempt = {
                // Field-level borrows: the dial future holds the
                // connector while ops drain independently.
                let connector = &self.connector;
                let ops = &mut self.ops;
                tokio::select! {
                    result = connector.connect() => Some(result),
                    op = ops.recv() => {
                        match op {
                            None => return None,
                            Some(op) => {
                                if reject_op(op) {
                                    return None;
                                }
                                None
                            }
                        }
                    }
                }
            };

            match attempt {
                None => continue, // rejected an op, keep dialing
                Some(Ok(conn)) => return Some(conn),
                Some(Err(e)) => {
                    tracing::debug!(error = %e, "connect failed, backing off");
                    if !self.sleep_rejecting_ops(*backoff).await {
                        return None;
                    }
                    *backoff = (*backoff * 2).min(self.config.max_backoff);
                }
            }
        }
    }

    /// Backoff sleep that still fails queued commands fast. Returns
    /// `false` when the agent should end instead of retrying.
    async fn sleep_rejecting_ops(&mut self, duration: Duration) -> bool {
        let sleep = tokio::time::sleep(duration);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                op = self.ops.recv() => match op {
                    None => return false,
                    Some(op) => {
                        if reject_op(op) {
                            return false;
                        }
                    }
                },
            }
        }
    }

    /// Handshake and join on a fresh connection: Hello → Welcome, then
    /// JoinRoom → full state.
    async fn establish(&mut self, conn: &K::Connection) -> Result<(), ClientError> {
        self.send(
            conn,
            &ClientEnvelope::Hello {
                version: PROTOCOL_VERSION,
                token: self.config.token.clone(),
            },
        )
        .await?;

        let user_id = match self.recv(conn).await? {
            ServerEnvelope::Welcome { user_id, .. } => user_id,
            ServerEnvelope::Goodbye { reason } => {
                return Err(ClientError::Protocol(format!("refused: {reason}")));
            }
            other => {
                return Err(ClientError::Protocol(format!(
                    "expected Welcome, got {other:?}"
                )));
            }
        };
        self.user_id = Some(user_id);

        let correlation_id = CorrelationId::new();
        self.send(
            conn,
            &ClientEnvelope::Command {
                correlation_id,
                command: ClientCommand::JoinRoom {
                    room_id: self.config.room_id,
                    entity_id: self.config.entity_id,
                    entity_type: self.config.entity_type,
                },
            },
        )
        .await?;

        loop {
            match self.recv(conn).await? {
                ServerEnvelope::Reply {
                    correlation_id: corr,
                    body,
                } if corr == correlation_id => match body.into_result() {
                    Ok(CommandReply::State {
                        game_state,
                        as_of_seq,
                    }) => {
                        self.authority = Some(*game_state);
                        self.last_seq = as_of_seq;
                        self.stale = false;
                        return Ok(());
                    }
                    Ok(other) => {
                        return Err(ClientError::Protocol(format!(
                            "join returned unexpected reply {other:?}"
                        )));
                    }
                    Err(e) => return Err(ClientError::Rejected(e)),
                },
                // Nothing else is expected before the join reply; skip
                // heartbeat acks defensively.
                _ => continue,
            }
        }
    }

    /// The connected phase. Returns `true` when the agent should end for
    /// good (leave or all handles dropped), `false` on channel loss.
    async fn serve(&mut self, conn: &K::Connection) -> bool {
        let (in_tx, mut in_rx) = mpsc::unbounded_channel::<ServerEnvelope>();
        let reader_conn = conn.clone();
        let reader_codec = self.codec.clone();
        let reader = tokio::spawn(async move {
            loop {
                match reader_conn.recv().await {
                    Ok(Some(bytes)) => match reader_codec.decode::<ServerEnvelope>(&bytes) {
                        Ok(envelope) => {
                            if in_tx.send(envelope).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            tracing::debug!(error = %e, "dropping undecodable frame");
                        }
                    },
                    Ok(None) => break,
                    Err(e) => {
                        tracing::debug!(error = %e, "recv failed");
                        break;
                    }
                }
            }
        });

        let started = Instant::now();
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let terminal = loop {
            tokio::select! {
                op = self.ops.recv() => match op {
                    None => break true,
                    Some(AgentOp::Leave { responder }) => {
                        self.leave_room(conn, responder).await;
                        break true;
                    }
                    Some(op) => self.handle_op(conn, op).await,
                },
                envelope = in_rx.recv() => match envelope {
                    None => break false,
                    Some(envelope) => self.handle_envelope(conn, envelope).await,
                },
                _ = heartbeat.tick() => {
                    let _ = self
                        .send(conn, &ClientEnvelope::Heartbeat {
                            client_time: started.elapsed().as_millis() as u64,
                        })
                        .await;
                }
            }
        };

        reader.abort();
        terminal
    }

    async fn handle_op(&mut self, conn: &K::Connection, op: AgentOp) {
        match op {
            AgentOp::Issue { command, responder } => {
                self.issue_command(conn, command, responder).await;
            }
            AgentOp::Timeout { correlation_id } => {
                // The reply may have raced the timer; only a still-pending
                // entry reverts.
                if self.table.remove(correlation_id).is_some() {
                    self.provisional_ids.remove(&correlation_id);
                    if let Some(responder) = self.responders.remove(&correlation_id) {
                        let _ = responder.send(Err(ClientError::Timeout));
                    }
                    tracing::debug!(%correlation_id, "command timed out, reverted");
                    self.publish();
                }
            }
            AgentOp::Leave { .. } => unreachable!("handled in serve()"),
        }
    }

    async fn issue_command(
        &mut self,
        conn: &K::Connection,
        command: ClientCommand,
        responder: oneshot::Sender<Result<CommandOutcome, ClientError>>,
    ) {
        if self.connection != ConnectionStatus::Connected || self.authority.is_none() {
            let _ = responder.send(Err(ClientError::NotConnected));
            return;
        }
        let is_resync = matches!(command, ClientCommand::GetRoomState);
        if self.stale && !is_resync {
            // The mirror is known-superseded; surface it before submission.
            let _ = responder.send(Err(ClientError::Stale));
            return;
        }

        let correlation_id = CorrelationId::new();
        let transform = self.transform_for(correlation_id, &command);
        self.table.push(PendingMutation {
            correlation_id,
            transform,
            issued_at: Instant::now(),
        });
        self.responders.insert(correlation_id, responder);
        self.publish();

        let envelope = ClientEnvelope::Command {
            correlation_id,
            command,
        };
        if self.send(conn, &envelope).await.is_err() {
            // Never made it onto the wire: revert immediately.
            self.table.remove(correlation_id);
            self.provisional_ids.remove(&correlation_id);
            if let Some(responder) = self.responders.remove(&correlation_id) {
                let _ = responder.send(Err(ClientError::ConnectionLost));
            }
            self.publish();
            return;
        }

        let ops_tx = self.ops_tx.clone();
        let timeout = self.config.command_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = ops_tx.send(AgentOp::Timeout { correlation_id });
        });
    }

    /// The optimistic transform predicting a command's server effect.
    fn transform_for(
        &mut self,
        correlation_id: CorrelationId,
        command: &ClientCommand,
    ) -> LocalTransform {
        use loretable_encounter::Command as Domain;
        match command {
            ClientCommand::TakeTurn { action } => LocalTransform::Command(Domain::TakeTurn {
                action: action.clone(),
            }),
            ClientCommand::SkipTurn { reason } => LocalTransform::Command(Domain::SkipTurn {
                reason: reason.clone(),
            }),
            ClientCommand::SendChatMessage {
                content,
                channel,
                recipients,
                entity_id,
            } => {
                let id = ChatMessageId(format!(
                    "{PROVISIONAL_ID_PREFIX}{}",
                    uuid::Uuid::new_v4()
                ));
                self.provisional_ids.insert(correlation_id, id.clone());
                LocalTransform::ProvisionalChat(ChatMessage {
                    id,
                    sender_user_id: self.user_id.unwrap_or(UserId(0)),
                    entity_id: *entity_id,
                    content: content.clone(),
                    channel: *channel,
                    recipients: recipients.clone(),
                    timestamp: Utc::now(),
                })
            }
            ClientCommand::PauseInteraction { reason } => {
                LocalTransform::Command(Domain::Pause {
                    reason: reason.clone(),
                })
            }
            ClientCommand::ResumeInteraction => LocalTransform::Command(Domain::Resume),
            ClientCommand::StartEncounter => LocalTransform::Command(Domain::Start),
            ClientCommand::EndEncounter => LocalTransform::Command(Domain::End),
            ClientCommand::UpdateInitiative { order } => {
                LocalTransform::Command(Domain::UpdateInitiative {
                    order: order.clone(),
                })
            }
            // Rollback needs the server's checkpoints; predicting it
            // locally would be a guess. Resyncs and membership commands
            // have no optimistic shape at all.
            ClientCommand::RollbackTurn { .. }
            | ClientCommand::JoinRoom { .. }
            | ClientCommand::LeaveRoom
            | ClientCommand::GetRoomState => LocalTransform::None,
        }
    }

    async fn handle_envelope(&mut self, conn: &K::Connection, envelope: ServerEnvelope) {
        match envelope {
            ServerEnvelope::Reply {
                correlation_id,
                body,
            } => self.handle_reply(correlation_id, body),
            ServerEnvelope::Event { event } => self.handle_event(conn, event).await,
            ServerEnvelope::HeartbeatAck { .. } => {}
            ServerEnvelope::Goodbye { reason } => {
                tracing::info!(%reason, "server said goodbye");
            }
            ServerEnvelope::Welcome { .. } => {
                tracing::debug!("unexpected Welcome mid-session, ignoring");
            }
        }
    }

    fn handle_reply(&mut self, correlation_id: CorrelationId, body: ReplyBody) {
        let was_pending = self.table.remove(correlation_id).is_some();
        let provisional = self.provisional_ids.remove(&correlation_id);
        let responder = self.responders.remove(&correlation_id);

        match body.into_result() {
            Ok(CommandReply::State {
                game_state,
                as_of_seq,
            }) => {
                // Server wins unconditionally — the full state replaces the
                // base, and any other in-flight transforms rebase on top.
                // A late reply after our timeout lands here too, exactly
                // like the "unexpected later reconciliation" the protocol
                // requires us to tolerate.
                self.authority = Some(*game_state);
                self.last_seq = self.last_seq.max(as_of_seq);
                self.stale = false;
                if let Some(responder) = responder {
                    let _ = responder.send(Ok(CommandOutcome::State));
                }
                self.publish();
            }
            Ok(CommandReply::Chat { message, as_of_seq }) => {
                if let Some(authority) = &mut self.authority {
                    let never_matches = ChatMessageId(format!("{PROVISIONAL_ID_PREFIX}?"));
                    reconcile_chat(
                        authority,
                        provisional.as_ref().unwrap_or(&never_matches),
                        message.clone(),
                    );
                }
                self.last_seq = self.last_seq.max(as_of_seq);
                if let Some(responder) = responder {
                    let _ = responder.send(Ok(CommandOutcome::Chat(message)));
                }
                self.publish();
            }
            Ok(CommandReply::Left) => {
                if let Some(responder) = responder {
                    let _ = responder.send(Ok(CommandOutcome::Ack));
                }
            }
            Err(error) => {
                // Revert: the entry is already out of the table, so the
                // rebased mirror no longer contains its transform. Other
                // in-flight mutations are untouched.
                if was_pending {
                    tracing::debug!(%correlation_id, %error, "command rejected, reverted");
                }
                if let Some(responder) = responder {
                    let _ = responder.send(Err(ClientError::Rejected(error)));
                }
                self.publish();
            }
        }
    }

    async fn handle_event(&mut self, conn: &K::Connection, event: SequencedEvent) {
        let SequencedEvent { seq, origin, event } = event;

        if let RoomEvent::Error { code, message } = &event {
            tracing::warn!(code, %message, "room error event");
            if *code == 410 {
                // Replay window exceeded: only a full resync can recover.
                let _ = self
                    .send(
                        conn,
                        &ClientEnvelope::Command {
                            correlation_id: CorrelationId::new(),
                            command: ClientCommand::GetRoomState,
                        },
                    )
                    .await;
            }
            return;
        }

        // Already reflected in the authoritative base (own command reply,
        // join snapshot, or an at-least-once redelivery).
        if seq <= self.last_seq {
            return;
        }

        if seq != self.last_seq + 1 {
            // Gap: mark stale and ask for the missing range once; the
            // replayed events arrive in order and close the gap.
            if !self.stale {
                self.stale = true;
                tracing::debug!(
                    expected = self.last_seq + 1,
                    got = seq,
                    "sequence gap, requesting replay"
                );
                let _ = self
                    .send(
                        conn,
                        &ClientEnvelope::ReplayFrom {
                            seq: self.last_seq + 1,
                        },
                    )
                    .await;
                self.publish();
            }
            return;
        }

        self.last_seq = seq;
        let was_stale = std::mem::take(&mut self.stale);

        // Our own command's effect: the pending reply carries the full
        // authoritative state, so folding here would double-apply.
        let own = origin.is_some_and(|o| self.table.contains(o));
        if !own {
            if let Some(authority) = &self.authority {
                self.authority = Some(room_event::fold(authority, &event));
            }
        }
        if !own || was_stale {
            self.publish();
        }
    }

    /// Clean leave: pending mutations are reverted (not silently dropped),
    /// departure is announced, and the agent ends.
    async fn leave_room(
        &mut self,
        conn: &K::Connection,
        responder: oneshot::Sender<Result<(), ClientError>>,
    ) {
        self.fail_all_pending();
        let _ = self
            .send(
                conn,
                &ClientEnvelope::Command {
                    correlation_id: CorrelationId::new(),
                    command: ClientCommand::LeaveRoom,
                },
            )
            .await;
        let _ = self
            .send(
                conn,
                &ClientEnvelope::Goodbye {
                    reason: "leaving room".into(),
                },
            )
            .await;
        let _ = conn.close().await;
        let _ = responder.send(Ok(()));
        self.publish();
    }

    /// The channel dropped: everything in flight has an unknown outcome.
    /// Revert locally; the rejoin resync reconciles whatever actually
    /// landed.
    fn on_channel_down(&mut self) {
        self.fail_all_pending();
    }

    fn fail_all_pending(&mut self) {
        for entry in self.table.drain() {
            self.provisional_ids.remove(&entry.correlation_id);
            if let Some(responder) = self.responders.remove(&entry.correlation_id) {
                let _ = responder.send(Err(ClientError::ConnectionLost));
            }
        }
        // Any responders without table entries (resyncs) fail too.
        for (_, responder) in self.responders.drain() {
            let _ = responder.send(Err(ClientError::ConnectionLost));
        }
        self.provisional_ids.clear();
    }

    async fn send(
        &self,
        conn: &K::Connection,
        envelope: &ClientEnvelope,
    ) -> Result<(), ClientError> {
        let bytes = self
            .codec
            .encode(envelope)
            .map_err(|e| ClientError::Protocol(e.to_string()))?;
        conn.send(&bytes)
            .await
            .map_err(|_| ClientError::ConnectionLost)
    }

    async fn recv(&self, conn: &K::Connection) -> Result<ServerEnvelope, ClientError> {
        match conn.recv().await {
            Ok(Some(bytes)) => self.codec.decode(&bytes).map_err(|e| {
                use std::io::Write as _;
                let mut f = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open("/tmp/dbg.log")
                    .unwrap();
                writeln!(f, "DECODEFAIL {}: {}", e, String::from_utf8_lossy(&bytes)).unwrap();
                ClientError::Protocol(e.to_string())
            }),
            Ok(None) => Err(ClientError::ConnectionLost),
            Err(_) => Err(ClientError::ConnectionLost),
        }
    }

    /// Recomputes the mirror and pushes a fresh view to watchers.
    fn publish(&mut self) {
        let mirror = self.authority.as_ref().map(|authority| {
            let ctx = LocalContext {
                user_id: self.user_id.unwrap_or(UserId(0)),
                config: self.config.encounter.clone(),
            };
            self.table.rebase(authority, &ctx, Utc::now())
        });
        self.view_tx.send_replace(ClientView {
            connection: self.connection,
            user_id: self.user_id,
            state: mirror,
            stale: self.stale,
            in_flight: self.table.len(),
        });
    }
}
