use std::collections::BTreeMap;

use crate::registry::EntityId;

/// Handle for one scheduled timer. Tokens are never reused by a scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerToken(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FiredTimer {
    pub token: TimerToken,
    pub entity: EntityId,
}

/// Delayed one-shot timers driven by the host's clock.
///
/// Fired timers are handed back to the caller rather than invoking callbacks,
/// so completion always runs on the thread that owns the registry.
pub trait UpgradeScheduler: Send + Sync + 'static {
    fn schedule(&mut self, seconds: f32, entity: EntityId) -> TimerToken;

    /// Returns `false` when the token was unknown or already fired.
    fn cancel(&mut self, token: TimerToken) -> bool;

    fn remaining(&self, token: TimerToken) -> Option<f32>;

    /// Moves time forward and returns every timer that expired, earliest due first.
    fn advance(&mut self, seconds: f32) -> Vec<FiredTimer>;

    fn pending_count(&self) -> usize;
}

#[derive(Debug, Clone, Copy)]
struct ScheduledTimer {
    entity: EntityId,
    remaining: f32,
}

/// Scheduler that counts down from explicit `advance` calls.
#[derive(Debug, Default)]
pub struct TickScheduler {
    next_token: u64,
    timers: BTreeMap<TimerToken, ScheduledTimer>,
}

impl TickScheduler {
    pub fn new() -> Self {
        Self::default()
    }
}

impl UpgradeScheduler for TickScheduler {
    fn schedule(&mut self, seconds: f32, entity: EntityId) -> TimerToken {
        self.next_token += 1;
        let token = TimerToken(self.next_token);
        self.timers.insert(
            token,
            ScheduledTimer {
                entity,
                remaining: seconds.max(0.0),
            },
        );
        token
    }

    fn cancel(&mut self, token: TimerToken) -> bool {
        self.timers.remove(&token).is_some()
    }

    fn remaining(&self, token: TimerToken) -> Option<f32> {
        self.timers.get(&token).map(|timer| timer.remaining)
    }

    fn advance(&mut self, seconds: f32) -> Vec<FiredTimer> {
        let seconds = seconds.max(0.0);
        let mut expired = Vec::new();
        for (token, timer) in self.timers.iter_mut() {
            timer.remaining -= seconds;
            if timer.remaining <= 0.0 {
                expired.push((timer.remaining, *token, timer.entity));
            }
        }
        expired.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        expired
            .into_iter()
            .map(|(_, token, entity)| {
                self.timers.remove(&token);
                FiredTimer { token, entity }
            })
            .collect()
    }

    fn pending_count(&self) -> usize {
        self.timers.len()
    }
}
