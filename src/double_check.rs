use serde::Serialize;

pub const DEFAULT_DOUBLE_CHECK_TICKS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DoubleCheck {
    Disarmed,
    Armed { elapsed: u32 },
}

/// Schedules one repeat reconciliation `threshold` ticks after the last
/// detected primary change.
#[derive(Debug, Clone)]
pub struct DoubleCheckScheduler {
    state: DoubleCheck,
    threshold: u32,
}

impl DoubleCheckScheduler {
    pub fn new(threshold: u32) -> Self {
        Self { state: DoubleCheck::Disarmed, threshold: threshold.max(1) }
    }

    pub fn state(&self) -> DoubleCheck {
        self.state
    }

    /// A change was detected this tick. Restarts the countdown.
    pub fn arm(&mut self) {
        self.state = DoubleCheck::Armed { elapsed: 0 };
    }

    /// Called on ticks without a detected change. Returns true when the
    /// repeat pass must run now; the scheduler is then disarmed.
    ///
    /// With `can_fire == false` (no fresh primary read this tick) a due pass
    /// is held over to the next tick instead of being dropped.
    pub fn advance(&mut self, can_fire: bool) -> bool {
        let DoubleCheck::Armed { elapsed } = self.state else {
            return false;
        };
        let elapsed = elapsed.saturating_add(1).min(self.threshold);
        if elapsed >= self.threshold && can_fire {
            self.state = DoubleCheck::Disarmed;
            return true;
        }
        self.state = DoubleCheck::Armed { elapsed };
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disarmed_never_fires() {
        let mut dc = DoubleCheckScheduler::new(3);
        for _ in 0..10 {
            assert!(!dc.advance(true));
        }
        assert_eq!(dc.state(), DoubleCheck::Disarmed);
    }

    #[test]
    fn test_fires_exactly_at_threshold() {
        let mut dc = DoubleCheckScheduler::new(3);
        dc.arm();
        assert!(!dc.advance(true)); // T+1
        assert!(!dc.advance(true)); // T+2
        assert!(dc.advance(true)); // T+3
        assert_eq!(dc.state(), DoubleCheck::Disarmed);
        assert!(!dc.advance(true));
    }

    #[test]
    fn test_rearm_restarts_countdown() {
        let mut dc = DoubleCheckScheduler::new(3);
        dc.arm();
        assert!(!dc.advance(true));
        assert!(!dc.advance(true));
        dc.arm();
        assert_eq!(dc.state(), DoubleCheck::Armed { elapsed: 0 });
        assert!(!dc.advance(true));
        assert!(!dc.advance(true));
        assert!(dc.advance(true));
    }

    #[test]
    fn test_due_pass_held_without_fresh_primary() {
        let mut dc = DoubleCheckScheduler::new(2);
        dc.arm();
        assert!(!dc.advance(true));
        assert!(!dc.advance(false));
        assert!(!dc.advance(false));
        assert_eq!(dc.state(), DoubleCheck::Armed { elapsed: 2 });
        assert!(dc.advance(true));
    }

    #[test]
    fn test_zero_threshold_is_clamped() {
        let mut dc = DoubleCheckScheduler::new(0);
        dc.arm();
        assert!(dc.advance(true));
    }
}
