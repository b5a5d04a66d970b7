//! Child enrollment ceiling.
//!
//! Bounds local storage growth and the number of records a pickup lookup
//! has to consider.

use thiserror::Error;

pub const DEFAULT_CHILD_CEILING: usize = 1000;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("children limit reached ({ceiling}); delete existing entries first")]
pub struct CapacityExceeded {
    pub ceiling: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnrollmentPolicy {
    ceiling: usize,
}

impl Default for EnrollmentPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_CHILD_CEILING)
    }
}

impl EnrollmentPolicy {
    pub fn new(ceiling: usize) -> Self {
        Self { ceiling }
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    pub fn can_enroll(&self, current_count: usize) -> bool {
        current_count < self.ceiling
    }

    pub fn check(&self, current_count: usize) -> Result<(), CapacityExceeded> {
        if self.can_enroll(current_count) {
            Ok(())
        } else {
            Err(CapacityExceeded {
                ceiling: self.ceiling,
            })
        }
    }

    /// Check that `incoming` more children fit on top of `current_count`.
    pub fn check_batch(&self, current_count: usize, incoming: usize) -> Result<(), CapacityExceeded> {
        if current_count.saturating_add(incoming) <= self.ceiling {
            Ok(())
        } else {
            Err(CapacityExceeded {
                ceiling: self.ceiling,
            })
        }
    }
}
