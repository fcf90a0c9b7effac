//! Cost units held by admitted requests.
//!
//! Not internally synchronized: the scheduler keeps it inside the same
//! mutex as the wait queue, so reserve and release share one critical
//! section and concurrent reservations cannot race past the capacity check.

use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceBudget {
    capacity: u32,
    allocated: u32,
}

impl ResourceBudget {
    pub fn new(capacity: u32) -> Self {
        Self {
            capacity,
            allocated: 0,
        }
    }

    /// Reserve `units` iff the result stays within capacity.
    pub fn try_reserve(&mut self, units: u32) -> bool {
        match self.allocated.checked_add(units) {
            Some(total) if total <= self.capacity => {
                self.allocated = total;
                true
            }
            _ => false,
        }
    }

    /// Return `units` to the budget. Never drops below zero.
    pub fn release(&mut self, units: u32) {
        if units > self.allocated {
            warn!(
                units,
                allocated = self.allocated,
                "budget release exceeds allocation, clamping to zero"
            );
        }
        self.allocated = self.allocated.saturating_sub(units);
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn allocated(&self) -> u32 {
        self.allocated
    }

    pub fn available(&self) -> u32 {
        self.capacity - self.allocated
    }
}
