//! Lamport clock for ordering operations across replicas.

use serde::{Deserialize, Serialize};

/// Logical clock. `tick` before emitting, `observe` on every receipt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LamportClock {
    time: u64,
}

impl LamportClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance for a local event and return the new time.
    pub fn tick(&mut self) -> u64 {
        self.time += 1;
        self.time
    }

    /// Merge a remote timestamp so the next tick is strictly greater.
    pub fn observe(&mut self, remote: u64) {
        self.time = self.time.max(remote);
    }

    pub fn now(&self) -> u64 {
        self.time
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_is_monotonic() {
        let mut clock = LamportClock::new();
        assert_eq!(clock.tick(), 1);
        assert_eq!(clock.tick(), 2);
        assert_eq!(clock.now(), 2);
    }

    #[test]
    fn test_observe_jumps_forward_only() {
        let mut clock = LamportClock::new();
        clock.observe(10);
        assert_eq!(clock.tick(), 11);

        clock.observe(3);
        assert_eq!(clock.now(), 11);
    }
}
