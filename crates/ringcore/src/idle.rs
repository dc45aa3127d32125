use std::hint;
use std::thread;

/// Idle wind-down for a consumer between an empty poll and a real park.
///
/// A consumer that just ran out of work is likely to see more within a few
/// hundred nanoseconds (a producer is usually mid-publish), so the first
/// rounds busy-wait with pause hints. Past that window the core is better
/// handed to the OS, and the wait degrades to scheduler yields. When the
/// yield budget is also gone, [`wait`](IdleWait::wait) returns `false` and
/// the caller should park for real.
///
/// The budgets are sized for taskmill's workers, which park with a 1 ms
/// timeout: the whole wind-down burns a small fraction of one timeout, so a
/// task arriving during it is picked up without a syscall while a genuinely
/// idle worker still reaches its park quickly.
pub struct IdleWait {
    round: u32,
}

impl IdleWait {
    /// Busy-wait rounds before yielding the core.
    const SPIN_ROUNDS: u32 = 16;
    /// Pause hints issued per busy-wait round.
    const SPINS_PER_ROUND: u32 = 32;
    /// Scheduler-yield rounds before giving up.
    const YIELD_ROUNDS: u32 = 8;

    pub fn new() -> Self {
        Self { round: 0 }
    }

    /// Waits one round. Returns `true` while another poll is worthwhile,
    /// `false` once the caller should park.
    pub fn wait(&mut self) -> bool {
        if self.round < Self::SPIN_ROUNDS {
            for _ in 0..Self::SPINS_PER_ROUND {
                hint::spin_loop();
            }
        } else if self.round < Self::SPIN_ROUNDS + Self::YIELD_ROUNDS {
            thread::yield_now();
        } else {
            return false;
        }
        self.round += 1;
        true
    }

    /// Work arrived; the next dry poll starts a fresh wind-down.
    #[inline]
    pub fn reset(&mut self) {
        self.round = 0;
    }
}

impl Default for IdleWait {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_runs_out_after_fixed_rounds() {
        let mut idle = IdleWait::new();

        let mut rounds = 0;
        while idle.wait() {
            rounds += 1;
        }
        assert_eq!(rounds, IdleWait::SPIN_ROUNDS + IdleWait::YIELD_ROUNDS);

        // Exhausted stays exhausted until reset.
        assert!(!idle.wait());
        assert!(!idle.wait());
    }

    #[test]
    fn reset_restores_the_full_budget() {
        let mut idle = IdleWait::new();
        while idle.wait() {}

        idle.reset();
        let mut rounds = 0;
        while idle.wait() {
            rounds += 1;
        }
        assert_eq!(rounds, IdleWait::SPIN_ROUNDS + IdleWait::YIELD_ROUNDS);
    }
}
