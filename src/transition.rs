/*!
 # Brightness transitions

 This module holds the fade state machine. A [`Transition`] is created with
 the brightness the light has when the fade starts, the brightness it should
 end on and the total duration. Every [`TICK_INTERVAL`] the owner calls
 [`Transition::advance`] with the brightness the device currently reports and
 sends the returned level to the gateway.

 The level is accumulated as a real number so fractional steps make progress,
 but each call first compares the reported brightness with the last level it
 handed out. If something else changed the light in between, the run picks up
 from the reported value instead.
*/

use std::time::Duration;
use tracing::{trace, warn};

/// Fixed delay between two brightness steps of a fade
pub const TICK_INTERVAL: Duration = Duration::from_millis(100);

/// Slack for float accumulation when testing whether the target was reached
const TARGET_EPSILON: f64 = 1e-9;

/// Outcome of a single transition tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// Intermediate brightness, another tick follows
    Step(u8),
    /// The target was reached or crossed, the run is over
    Finish(u8),
}

impl Tick {
    /// Brightness to command for this tick
    pub fn brightness(&self) -> u8 {
        match *self {
            Tick::Step(b) | Tick::Finish(b) => b,
        }
    }

    /// Whether this tick ends the run
    pub fn is_finished(&self) -> bool {
        matches!(self, Tick::Finish(_))
    }
}

/// An in-progress fade towards a target brightness
#[derive(Debug, Clone)]
pub struct Transition {
    /// Signed brightness change per tick
    step: f64,
    /// Brightness the fade ends on
    target: u8,
    /// Accumulated brightness, kept fractional
    level: f64,
    /// Last brightness returned by `advance`
    last_sent: u8,
}

impl Transition {
    /// Creates a fade from `current` to `target` spread over `duration`
    ///
    /// The step is `(target - current) / (duration / TICK_INTERVAL)`. A zero
    /// duration produces a zero step, which finishes on the first tick.
    pub fn new(current: u8, target: u8, duration: Duration) -> Self {
        let ticks = duration.as_nanos() as f64 / TICK_INTERVAL.as_nanos() as f64;
        let step = if ticks > 0.0 {
            (f64::from(target) - f64::from(current)) / ticks
        } else {
            0.0
        };

        trace!(
            "New transition {} -> {} over {:?} ({} per tick)",
            current,
            target,
            duration,
            step
        );

        Self {
            step,
            target,
            level: f64::from(current),
            last_sent: current,
        }
    }

    /// Brightness change per tick
    pub fn step(&self) -> f64 {
        self.step
    }

    /// Brightness the fade ends on
    pub fn target(&self) -> u8 {
        self.target
    }

    /// Computes the next brightness given the brightness the device reports now
    pub fn advance(&mut self, current: u8) -> Tick {
        if current != self.last_sent {
            trace!(
                "Brightness changed externally ({} -> {}), resyncing",
                self.last_sent,
                current
            );
            self.level = f64::from(current);
            self.last_sent = current;
        }

        let target = f64::from(self.target);
        let next = self.level + self.step;

        let reached = if self.step > 0.0 {
            next >= target - TARGET_EPSILON
        } else if self.step < 0.0 {
            next <= target + TARGET_EPSILON
        } else {
            // A zero step would never make progress
            if current != self.target {
                warn!(
                    "Zero brightness step at {} with target {}, landing on target",
                    current, self.target
                );
            }
            true
        };

        if reached || !next.is_finite() {
            self.last_sent = self.target;
            return Tick::Finish(self.target);
        }

        self.level = next;
        self.last_sent = next.round().clamp(0.0, 255.0) as u8;
        Tick::Step(self.last_sent)
    }
}
