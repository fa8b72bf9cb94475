use super::HealthState;

/// Result of one check as seen by the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CheckOutcome {
    Pass,
    Fail,
    /// The process is gone
    Dead,
}

/// What a check changed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct TrackerUpdate {
    pub transition: Option<(HealthState, HealthState)>,
    pub stabilized: bool,
}

/// Per-registration HEALTHY/DEGRADED/UNHEALTHY state machine
#[derive(Debug, Clone)]
pub(crate) struct HealthTracker {
    state: HealthState,
    consecutive_failures: u32,
    consecutive_passes: u32,
    degraded_after: u32,
    unhealthy_after: u32,
    stable_after: u32,
}

impl HealthTracker {
    pub fn new(degraded_after: u32, unhealthy_after: u32, stable_after: u32) -> Self {
        Self {
            state: HealthState::Healthy,
            consecutive_failures: 0,
            consecutive_passes: 0,
            degraded_after,
            unhealthy_after,
            stable_after,
        }
    }

    pub fn state(&self) -> HealthState {
        self.state
    }

    pub fn record(&mut self, outcome: CheckOutcome) -> TrackerUpdate {
        let previous = self.state;
        let mut update = TrackerUpdate::default();

        match outcome {
            CheckOutcome::Pass => {
                self.consecutive_failures = 0;
                self.consecutive_passes = self.consecutive_passes.saturating_add(1);
                self.state = HealthState::Healthy;
                // Equality fires once per streak
                update.stabilized = self.consecutive_passes == self.stable_after;
            }
            CheckOutcome::Fail | CheckOutcome::Dead => {
                self.consecutive_passes = 0;
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                if outcome == CheckOutcome::Dead {
                    self.consecutive_failures = self.consecutive_failures.max(self.unhealthy_after);
                }
                self.state = if self.consecutive_failures >= self.unhealthy_after {
                    HealthState::Unhealthy
                } else if self.consecutive_failures >= self.degraded_after {
                    HealthState::Degraded
                } else {
                    HealthState::Healthy
                };
            }
        }

        if self.state != previous {
            update.transition = Some((previous, self.state));
        }
        update
    }
}
