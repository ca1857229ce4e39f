//! The event broadcaster: sequenced fan-out with a bounded replay window.
//!
//! Every successful command's events are stamped with a per-room,
//! monotonically increasing sequence number and delivered to every
//! subscriber — including the command's own submitter, whose client
//! recognizes them by the attached origin correlation id. Delivery is
//! at-least-once: a subscriber that detects a gap asks for replay from the
//! ring buffer, and a gap older than the buffer gets an `Error` event
//! telling it to resync in full.

use std::collections::{HashMap, VecDeque};

use loretable_encounter::{RoomEvent, UserId};
use loretable_protocol::{CorrelationId, SequencedEvent};
use tokio::sync::mpsc;

/// Channel over which a subscriber receives its copy of the room stream.
pub type EventSender = mpsc::UnboundedSender<SequencedEvent>;

/// Default number of recent events retained for replay.
pub const DEFAULT_REPLAY_WINDOW: usize = 256;

/// Sequenced multicast for one room.
pub struct Broadcaster {
    subscribers: HashMap<UserId, EventSender>,
    /// Sequence number of the next event to publish (first event is 1).
    next_seq: u64,
    /// Recent events, oldest first, bounded by `window`.
    ring: VecDeque<SequencedEvent>,
    window: usize,
}

impl Broadcaster {
    pub fn new(window: usize) -> Self {
        Self {
            subscribers: HashMap::new(),
            next_seq: 1,
            ring: VecDeque::with_capacity(window),
            window,
        }
    }

    /// Registers (or replaces) a subscriber's channel.
    pub fn subscribe(&mut self, user_id: UserId, sender: EventSender) {
        self.subscribers.insert(user_id, sender);
    }

    pub fn unsubscribe(&mut self, user_id: UserId) {
        self.subscribers.remove(&user_id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// The sequence number of the most recently published event.
    pub fn last_seq(&self) -> u64 {
        self.next_seq - 1
    }

    /// Stamps, buffers, and fans out a command's events. Returns the last
    /// assigned sequence number (the reply's `as_of_seq`).
    pub fn publish(&mut self, events: Vec<RoomEvent>, origin: Option<CorrelationId>) -> u64 {
        for event in events {
            let sequenced = SequencedEvent {
                seq: self.next_seq,
                origin,
                event,
            };
            self.next_seq += 1;

            if self.ring.len() == self.window {
                self.ring.pop_front();
            }
            self.ring.push_back(sequenced.clone());

            // Dead receivers (dropped connections) are pruned on the way.
            self.subscribers
                .retain(|user_id, sender| match sender.send(sequenced.clone()) {
                    Ok(()) => true,
                    Err(_) => {
                        tracing::debug!(%user_id, "dropping dead subscriber");
                        false
                    }
                });
        }
        self.last_seq()
    }

    /// Re-delivers buffered events with `seq >= from_seq` to one
    /// subscriber. If the request reaches past the buffer, the subscriber
    /// instead receives an `Error` event directing it to a full resync.
    pub fn replay_to(&mut self, user_id: UserId, from_seq: u64) {
        let Some(sender) = self.subscribers.get(&user_id) else {
            return;
        };

        let oldest_buffered = self.ring.front().map(|e| e.seq);
        let covered = match oldest_buffered {
            // Empty buffer covers a replay only if nothing was ever missed.
            None => from_seq >= self.next_seq,
            Some(oldest) => from_seq >= oldest,
        };

        if !covered {
            tracing::debug!(%user_id, from_seq, "replay window exceeded");
            let _ = sender.send(SequencedEvent {
                seq: self.last_seq(),
                origin: None,
                event: RoomEvent::Error {
                    code: 410,
                    message: "replay window exceeded; request a full resync".into(),
                },
            });
            return;
        }

        let mut replayed = 0usize;
        for event in self.ring.iter().filter(|e| e.seq >= from_seq) {
            if sender.send(event.clone()).is_err() {
                break;
            }
            replayed += 1;
        }
        tracing::debug!(%user_id, from_seq, replayed, "replayed buffered events");
    }
}

// =========================================================================
// Tests
// =========================================================================
