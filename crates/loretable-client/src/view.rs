//! Read-only derived views over the local mirror.
//!
//! Published through a `tokio::sync::watch` channel after every mirror
//! change, so UI code observes without ever touching agent internals. The
//! countdown derives from the server-supplied deadline — it never ticks on
//! its own, which keeps it immune to client/server clock drift.

use chrono::{DateTime, Utc};
use std::time::Duration;

use loretable_encounter::{GameState, InteractionStatus, ParticipantState, UserId};

/// Connection lifecycle of the agent.
///
/// ```text
/// Connecting → Connected ──(channel loss)──→ Disconnected
///     ↑                                            │
///     └───────────────(automatic retry)────────────┘
/// ```
///
/// Failed requests are per-command errors, not connection states; the
/// channel stays `Connected` through them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
}

/// A snapshot of everything a UI needs from the agent.
#[derive(Debug, Clone)]
pub struct ClientView {
    pub connection: ConnectionStatus,
    /// Who the identity provider says we are (known once connected).
    pub user_id: Option<UserId>,
    /// The local mirror: authoritative base plus optimistic mutations.
    /// `None` until the first join completes.
    pub state: Option<GameState>,
    /// A sequence gap was detected and recovery is in flight; mutating
    /// commands fail fast with `Stale` while this is set.
    pub stale: bool,
    /// Number of optimistic mutations awaiting their server verdict.
    pub in_flight: usize,
}

impl ClientView {
    pub(crate) fn initial() -> Self {
        Self {
            connection: ConnectionStatus::Connecting,
            user_id: None,
            state: None,
            stale: false,
            in_flight: 0,
        }
    }

    /// The participant whose turn it is.
    pub fn current_turn_participant(&self) -> Option<&ParticipantState> {
        self.state.as_ref()?.active_participant()
    }

    /// Whether the active turn belongs to the local user.
    pub fn is_my_turn(&self) -> bool {
        let Some(state) = &self.state else {
            return false;
        };
        let Some(me) = self.user_id else {
            return false;
        };
        state
            .active_entry()
            .and_then(|e| e.owner_user_id)
            .is_some_and(|owner| owner == me)
    }

    /// Chat messages the local user is meant to see. Every mirror carries
    /// the full log (replicas must converge); channel visibility is a
    /// rendering concern, applied here.
    pub fn visible_chat(&self) -> Vec<&loretable_encounter::ChatMessage> {
        let Some(state) = &self.state else {
            return Vec::new();
        };
        let me = self.user_id;
        let dm = state.dm_user_id;
        state
            .chat_log
            .iter()
            .filter(|m| match m.channel {
                loretable_encounter::ChatChannel::Party
                | loretable_encounter::ChatChannel::System => true,
                loretable_encounter::ChatChannel::Dm => {
                    me.is_some() && (me == Some(m.sender_user_id) || me == dm)
                }
                loretable_encounter::ChatChannel::Private => me.is_some_and(|me| {
                    m.sender_user_id == me || m.recipients.contains(&me)
                }),
            })
            .collect()
    }

    /// Time left on the active turn, derived from the server deadline.
    /// While paused, the frozen remainder. `None` outside an active turn.
    pub fn turn_time_remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        let state = self.state.as_ref()?;
        match state.status {
            InteractionStatus::Active => {
                let deadline = state.turn_deadline?;
                Some((deadline - now).to_std().unwrap_or(Duration::ZERO))
            }
            InteractionStatus::Paused => state
                .paused_remaining_ms
                .map(Duration::from_millis),
            InteractionStatus::Waiting | InteractionStatus::Completed => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loretable_encounter::testutil::{entry, participant, ts};
    use loretable_encounter::{EntityId, RoomId};

    fn view_with_state(state: GameState, me: u64) -> ClientView {
        ClientView {
            connection: ConnectionStatus::Connected,
            user_id: Some(UserId(me)),
            state: Some(state),
            stale: false,
            in_flight: 0,
        }
    }

    fn active_state() -> GameState {
        let mut state = GameState::new(RoomId(1), ts(0));
        state.admit_participant(entry(1, 18, Some(UserId(10))), participant(1, 20), ts(1));
        state.admit_participant(entry(2, 12, Some(UserId(20))), participant(2, 15), ts(2));
        state.status = InteractionStatus::Active;
        state.begin_turn(0, 1, Some(ts(100)), ts(10));
        state
    }

    #[test]
    fn test_is_my_turn_tracks_active_entry_owner() {
        let state = active_state();
        assert!(view_with_state(state.clone(), 10).is_my_turn());
        assert!(!view_with_state(state, 20).is_my_turn());
    }

    #[test]
    fn test_is_my_turn_false_before_join() {
        assert!(!ClientView::initial().is_my_turn());
    }

    #[test]
    fn test_current_turn_participant_follows_index() {
        let view = view_with_state(active_state(), 10);
        assert_eq!(
            view.current_turn_participant().unwrap().entity_id,
            EntityId(1)
        );
    }

    #[test]
    fn test_turn_time_remaining_derives_from_deadline() {
        let view = view_with_state(active_state(), 10);
        // Deadline ts(100), asking at ts(40): 60 seconds left.
        assert_eq!(
            view.turn_time_remaining(ts(40)),
            Some(Duration::from_secs(60))
        );
        // Past the deadline: clamped to zero, not negative.
        assert_eq!(view.turn_time_remaining(ts(200)), Some(Duration::ZERO));
    }

    #[test]
    fn test_visible_chat_filters_by_channel_and_recipient() {
        use loretable_encounter::{ChatChannel, ChatMessage, ChatMessageId};

        let mut state = active_state();
        state.dm_user_id = Some(UserId(9));
        let msg = |n: u64, sender: u64, channel: ChatChannel, recipients: Vec<UserId>| ChatMessage {
            id: ChatMessageId::server(n),
            sender_user_id: UserId(sender),
            entity_id: None,
            content: format!("m{n}"),
            channel,
            recipients,
            timestamp: ts(20 + n as i64),
        };
        state.chat_log.push(msg(1, 10, ChatChannel::Party, vec![]));
        state.chat_log.push(msg(2, 20, ChatChannel::Dm, vec![]));
        state.chat_log.push(msg(3, 20, ChatChannel::Private, vec![UserId(10)]));
        state.chat_log.push(msg(4, 20, ChatChannel::Private, vec![UserId(30)]));

        // As user 10: party, the private message addressed to them, but
        // not the other player's DM whisper or someone else's private.
        let as_player = view_with_state(state.clone(), 10);
        let mine: Vec<&str> = as_player
            .visible_chat()
            .iter()
            .map(|m| m.content.as_str())
            .collect();
        assert_eq!(mine, vec!["m1", "m3"]);

        // As the DM (user 9): party and the DM whisper.
        let as_dm = view_with_state(state, 9);
        let dms: Vec<&str> = as_dm
            .visible_chat()
            .iter()
            .map(|m| m.content.as_str())
            .collect();
        assert_eq!(dms, vec!["m1", "m2"]);
    }

    #[test]
    fn test_turn_time_remaining_frozen_while_paused() {
        let mut state = active_state();
        state.status = InteractionStatus::Paused;
        state.turn_deadline = None;
        state.paused_remaining_ms = Some(42_000);
        let view = view_with_state(state, 10);
        // Whatever the wall clock says, the paused remainder holds.
        assert_eq!(
            view.turn_time_remaining(ts(40)),
            Some(Duration::from_secs(42))
        );
        assert_eq!(
            view.turn_time_remaining(ts(9_999)),
            Some(Duration::from_secs(42))
        );
    }
}
