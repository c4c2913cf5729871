//! Bounded convergence polling.
//!
//! Simulated time advances for free, so "retry until it works" can spin a
//! dead scenario forever at zero wall-clock cost. Every wait therefore
//! carries three independent caps — virtual-time budget, total stepper
//! trials, and consecutive inactive trials — and the failure reports which
//! one tripped: a stall (livelock/deadlock) reads very differently from an
//! exhausted time budget with progress still trickling in.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::endpoint::{StepError, Stepper};
use trellis_netsim::Micros;

// ─── Bounds ─────────────────────────────────────────────────────────────────

/// The three caps every wait runs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollBounds {
    /// Virtual-time budget, relative to the wait's start.
    pub max_wall_time: Micros,
    /// Total stepper invocations.
    pub max_trials: u32,
    /// Consecutive invocations with no observable activity.
    pub max_consecutive_inactive: u32,
}

impl PollBounds {
    /// Connection establishment / migration completion.
    pub const MIGRATION: PollBounds = PollBounds {
        max_wall_time: 4_000_000,
        max_trials: 1_024,
        max_consecutive_inactive: 64,
    };

    /// Second-path validation needs more rounds: challenges ride alongside
    /// application data.
    pub const MULTIPATH_READY: PollBounds = PollBounds {
        max_wall_time: 4_000_000,
        max_trials: 5_000,
        max_consecutive_inactive: 64,
    };

    /// Datagram send/receive loop.
    pub const DATAGRAM: PollBounds = PollBounds {
        max_wall_time: 30_000_000,
        max_trials: 16_000,
        max_consecutive_inactive: 512,
    };

    /// Bulk transfer to completion, with a caller-supplied time budget.
    pub fn transfer(max_wall_time: Micros) -> PollBounds {
        PollBounds {
            max_wall_time,
            max_trials: 200_000,
            max_consecutive_inactive: 1_024,
        }
    }
}

// ─── Outcome ────────────────────────────────────────────────────────────────

/// Progress counters from a successful wait.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct WaitStats {
    pub trials: u32,
    pub elapsed: Micros,
}

/// Why a wait gave up. Carries the counters at failure plus a state
/// snapshot supplied by the caller's condition description.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WaitError {
    #[error("virtual-time budget of {budget}µs exhausted after {trials} trials")]
    TimeBudget { budget: Micros, trials: u32 },

    #[error("trial cap of {trials} reached with condition still unmet")]
    Trials { trials: u32 },

    #[error("no activity for {inactive} consecutive trials ({trials} total): simulation is stuck")]
    Stalled { inactive: u32, trials: u32 },

    #[error(transparent)]
    Step(#[from] StepError),
}

// ─── Waits ──────────────────────────────────────────────────────────────────

/// Step the simulation until `done` holds or a bound trips.
///
/// `next_deadline` supplies a per-iteration step limit (absolute virtual
/// time) for callers that need the stepper to yield at scheduled moments —
/// the datagram loop uses it to wake at the next send slot. Return
/// [`trellis_netsim::NEVER`] to let each step run to the wait's own budget.
///
/// The condition is evaluated before each step and once more after the
/// final one, so a wait that converges on its last permitted trial still
/// succeeds.
pub fn wait_for<W: Stepper>(
    world: &mut W,
    bounds: PollBounds,
    mut next_deadline: impl FnMut(&W) -> Micros,
    mut done: impl FnMut(&W) -> bool,
) -> Result<WaitStats, WaitError> {
    let start = world.now();
    let time_limit = start.saturating_add(bounds.max_wall_time);
    let mut trials = 0u32;
    let mut inactive = 0u32;

    while !done(world) {
        if world.now() >= time_limit {
            return Err(WaitError::TimeBudget {
                budget: bounds.max_wall_time,
                trials,
            });
        }
        if trials >= bounds.max_trials {
            return Err(WaitError::Trials { trials });
        }
        if inactive >= bounds.max_consecutive_inactive {
            return Err(WaitError::Stalled { inactive, trials });
        }

        trials += 1;
        let step_limit = next_deadline(world).min(time_limit);
        let was_active = world.step(step_limit)?;
        if was_active {
            inactive = 0;
        } else {
            inactive += 1;
        }
    }

    let stats = WaitStats {
        trials,
        elapsed: world.now() - start,
    };
    debug!(trials = stats.trials, elapsed = stats.elapsed, "wait converged");
    Ok(stats)
}

/// Let the simulation soak until `target` (absolute virtual time).
///
/// Unlike [`wait_for`], inactivity is expected here — the whole point is to
/// let time pass before the next fault injection — so only the trial cap
/// guards against a stepper that refuses to advance the clock.
pub fn run_until<W: Stepper>(world: &mut W, target: Micros) -> Result<WaitStats, WaitError> {
    let start = world.now();
    let mut trials = 0u32;
    while world.now() < target {
        if trials >= 1_000_000 {
            return Err(WaitError::Trials { trials });
        }
        trials += 1;
        world.step(target)?;
    }
    Ok(WaitStats {
        trials,
        elapsed: world.now() - start,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Scripted stepper: each entry is (time delta, was_active).
    struct Script {
        now: Micros,
        steps: Vec<(Micros, bool)>,
        cursor: usize,
    }

    impl Script {
        fn new(steps: Vec<(Micros, bool)>) -> Self {
            Script {
                now: 0,
                steps,
                cursor: 0,
            }
        }
    }

    impl Stepper for Script {
        fn now(&self) -> Micros {
            self.now
        }

        fn step(&mut self, step_limit: Micros) -> Result<bool, StepError> {
            match self.steps.get(self.cursor) {
                Some(&(delta, active)) => {
                    self.cursor += 1;
                    self.now = (self.now + delta).min(step_limit.max(self.now));
                    Ok(active)
                }
                None => {
                    // Script exhausted: idle forever.
                    self.now = step_limit.max(self.now);
                    Ok(false)
                }
            }
        }
    }

    fn open_deadline(_: &Script) -> Micros {
        trellis_netsim::NEVER
    }

    #[test]
    fn converges_when_condition_becomes_true() {
        let mut world = Script::new(vec![(10, true); 20]);
        let stats = wait_for(&mut world, PollBounds::MIGRATION, open_deadline, |w| {
            w.now() >= 50
        })
        .unwrap();
        assert_eq!(stats.trials, 5);
        assert_eq!(stats.elapsed, 50);
    }

    #[test]
    fn already_true_condition_takes_zero_steps() {
        let mut world = Script::new(vec![]);
        let stats = wait_for(&mut world, PollBounds::MIGRATION, open_deadline, |_| true).unwrap();
        assert_eq!(stats.trials, 0);
    }

    #[test]
    fn permanently_false_condition_stalls_within_bounds() {
        // Active steps that never satisfy the condition: the inactivity cap
        // can't trip, but the trial cap must.
        let bounds = PollBounds {
            max_wall_time: trellis_netsim::NEVER,
            max_trials: 100,
            max_consecutive_inactive: 64,
        };
        let mut world = Script::new(vec![(1, true); 10_000]);
        let err = wait_for(&mut world, bounds, open_deadline, |_| false).unwrap_err();
        assert_eq!(err, WaitError::Trials { trials: 100 });
    }

    #[test]
    fn dead_simulation_reports_stall_not_timeout() {
        let bounds = PollBounds {
            max_wall_time: trellis_netsim::NEVER,
            max_trials: 10_000,
            max_consecutive_inactive: 64,
        };
        // No activity at all, but time creeps forward.
        let mut world = Script::new(vec![(1, false); 10_000]);
        let err = wait_for(&mut world, bounds, open_deadline, |_| false).unwrap_err();
        assert!(matches!(err, WaitError::Stalled { inactive: 64, .. }));
    }

    #[test]
    fn time_budget_trips_before_trials_when_time_flies() {
        let mut world = Script::new(vec![(1_000_000, true); 100]);
        let err = wait_for(&mut world, PollBounds::MIGRATION, open_deadline, |_| false).unwrap_err();
        assert!(matches!(err, WaitError::TimeBudget { budget: 4_000_000, .. }));
    }

    #[test]
    fn activity_resets_the_inactivity_counter() {
        let bounds = PollBounds {
            max_wall_time: trellis_netsim::NEVER,
            max_trials: 20,
            max_consecutive_inactive: 5,
        };
        // Alternating active/inactive never accumulates 5 in a row.
        let steps: Vec<(Micros, bool)> = (0..40).map(|i| (1, i % 2 == 0)).collect();
        let mut world = Script::new(steps);
        let err = wait_for(&mut world, bounds, open_deadline, |_| false).unwrap_err();
        assert_eq!(err, WaitError::Trials { trials: 20 });
    }

    #[test]
    fn run_until_reaches_target_even_when_idle() {
        let mut world = Script::new(vec![]);
        let stats = run_until(&mut world, 640_000).unwrap();
        assert_eq!(world.now(), 640_000);
        assert_eq!(stats.elapsed, 640_000);
    }
}
