//! The turn clock: one countdown per room, timeout-driven forfeiture.
//!
//! A [`TurnClock`] is owned by its room actor and sits inside the actor's
//! `tokio::select!` loop:
//!
//! ```ignore
//! loop {
//!     tokio::select! {
//!         Some(directive) = rx.recv() => { /* commands */ }
//!         claim = clock.wait_for_expiry() => {
//!             // Synthesize SkipTurn("timeout") through the ordinary
//!             // command path; drop the claim if the turn already moved.
//!         }
//!     }
//! }
//! ```
//!
//! Because expiry and commands arrive through the same single-threaded
//! loop, a manual action and a timeout race safely: whichever lands first
//! wins, and the loser is simply not applied.
//!
//! When disarmed or paused, [`TurnClock::wait_for_expiry`] pends forever —
//! `select!` keeps servicing the other branches. Pausing captures the
//! remaining time; resuming restores exactly that remainder, never a fresh
//! budget.

use std::time::Duration;

use loretable_encounter::EntityId;
use tokio::time::{self, Instant};
use tracing::{debug, trace};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Tunables for the turn clock.
#[derive(Debug, Clone)]
pub struct TurnClockConfig {
    /// Full budget for a fresh turn.
    pub turn_budget: Duration,
}

impl Default for TurnClockConfig {
    fn default() -> Self {
        Self {
            turn_budget: Duration::from_secs(90),
        }
    }
}

// ---------------------------------------------------------------------------
// Claims
// ---------------------------------------------------------------------------

/// Which turn a countdown was armed for.
///
/// Carried back on expiry so the room actor can verify the turn has not
/// already advanced before synthesizing a skip. A stale claim is dropped
/// silently — the race was legitimately lost, no error to surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TurnClaim {
    pub entity_id: EntityId,
    pub turn_number: u32,
    pub round_number: u32,
}

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

/// A single-deadline countdown. One per room; only one countdown is live
/// at a time.
pub struct TurnClock {
    config: TurnClockConfig,
    deadline: Option<Instant>,
    /// Captured by `pause`, consumed by `resume`.
    remaining_on_pause: Option<Duration>,
    claim: Option<TurnClaim>,
}

impl TurnClock {
    pub fn new(config: TurnClockConfig) -> Self {
        Self {
            config,
            deadline: None,
            remaining_on_pause: None,
            claim: None,
        }
    }

    /// The configured full turn budget.
    pub fn budget(&self) -> Duration {
        self.config.turn_budget
    }

    /// Starts a countdown of `remaining` for `claim`, replacing any
    /// previous countdown. The active turn changed — whatever was armed
    /// before no longer matters.
    pub fn arm(&mut self, claim: TurnClaim, remaining: Duration) {
        self.deadline = Some(Instant::now() + remaining);
        self.remaining_on_pause = None;
        self.claim = Some(claim);
        trace!(
            entity = %claim.entity_id,
            turn = claim.turn_number,
            remaining_ms = remaining.as_millis() as u64,
            "turn clock armed"
        );
    }

    /// Arms a fresh full-budget countdown.
    pub fn arm_fresh(&mut self, claim: TurnClaim) {
        self.arm(claim, self.config.turn_budget);
    }

    /// Stops the countdown entirely (turn ended, room paused out of turn
    /// context, encounter completed).
    pub fn disarm(&mut self) {
        if self.deadline.is_some() || self.remaining_on_pause.is_some() {
            debug!("turn clock disarmed");
        }
        self.deadline = None;
        self.remaining_on_pause = None;
        self.claim = None;
    }

    /// Suspends the countdown, capturing the unspent time. Idempotent.
    pub fn pause(&mut self) {
        if let Some(deadline) = self.deadline.take() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            self.remaining_on_pause = Some(remaining);
            debug!(
                remaining_ms = remaining.as_millis() as u64,
                "turn clock paused"
            );
        }
    }

    /// Resumes a paused countdown with exactly the captured remainder.
    /// Returns the remainder, or `None` if nothing was paused.
    pub fn resume(&mut self) -> Option<Duration> {
        let remaining = self.remaining_on_pause.take()?;
        self.deadline = Some(Instant::now() + remaining);
        debug!(
            remaining_ms = remaining.as_millis() as u64,
            "turn clock resumed"
        );
        Some(remaining)
    }

    /// Whether a countdown is live (armed and not paused).
    pub fn is_running(&self) -> bool {
        self.deadline.is_some()
    }

    /// Whether a countdown is suspended by a pause.
    pub fn is_paused(&self) -> bool {
        self.remaining_on_pause.is_some()
    }

    /// The claim the current countdown (running or paused) was armed for.
    pub fn claim(&self) -> Option<TurnClaim> {
        self.claim
    }

    /// Time left on a running countdown.
    pub fn remaining(&self) -> Option<Duration> {
        match (self.deadline, self.remaining_on_pause) {
            (Some(deadline), _) => Some(deadline.saturating_duration_since(Instant::now())),
            (None, Some(paused)) => Some(paused),
            (None, None) => None,
        }
    }

    /// Waits until the countdown expires, then disarms and yields the
    /// claim. Pends forever while disarmed or paused.
    pub async fn wait_for_expiry(&mut self) -> TurnClaim {
        let Some(deadline) = self.deadline else {
            std::future::pending::<()>().await;
            unreachable!()
        };

        time::sleep_until(deadline).await;

        self.deadline = None;
        let claim = self
            .claim
            .take()
            .expect("a running clock always has a claim");
        debug!(
            entity = %claim.entity_id,
            turn = claim.turn_number,
            round = claim.round_number,
            "turn budget expired"
        );
        claim
    }
}
