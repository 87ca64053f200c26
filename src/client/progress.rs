use rand::Rng;

use super::poller::Phase;

pub const COMPLETE: f64 = 100.0;

/// Client-side guess of how far along a job is.
///
/// The broker has no notion of fractional progress; this only exists so a
/// progress bar moves while the job runs. Values never decrease and stay
/// below 100 until the job is seen to complete.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressEstimator {
    /// Upper bound (exclusive) of the random increment per tick.
    pub step: f64,
    /// Cap while queued or before the first status answer.
    pub queued_cap: f64,
    /// Cap while a worker is running the job.
    pub active_cap: f64,
}

impl Default for ProgressEstimator {
    fn default() -> Self {
        Self {
            step: 10.0,
            queued_cap: 90.0,
            active_cap: 95.0,
        }
    }
}

impl ProgressEstimator {
    fn cap(&self, phase: &Phase) -> Option<f64> {
        match phase {
            Phase::Starting | Phase::Queued => Some(self.queued_cap),
            Phase::Active => Some(self.active_cap),
            Phase::Completed { .. } | Phase::Failed { .. } => None,
        }
    }

    /// Progress after one tick with the given increment.
    pub fn advance(&self, current: f64, phase: &Phase, increment: f64) -> f64 {
        match self.cap(phase) {
            Some(cap) if current < cap => (current + increment.max(0.0)).min(cap),
            _ => current,
        }
    }

    /// Progress after one tick, drawing the increment from `[0, step)`.
    pub fn tick<R: Rng + ?Sized>(&self, current: f64, phase: &Phase, rng: &mut R) -> f64 {
        let increment = if self.step > 0.0 {
            rng.random_range(0.0..self.step)
        } else {
            0.0
        };
        self.advance(current, phase, increment)
    }

    /// Progress once the job reaches `phase`.
    pub fn settle(&self, current: f64, phase: &Phase) -> f64 {
        match phase {
            Phase::Completed { .. } => COMPLETE,
            _ => current,
        }
    }
}
