use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::error::PipelineError;

/// Cooperative cancellation shared between the caller and a running job.
/// Observed only at stage and chunk boundaries.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Wall-clock budget of a job (or of a whole batch).
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    started: Instant,
    budget: Duration,
}

impl Deadline {
    pub fn new(budget: Duration) -> Self {
        Self {
            started: Instant::now(),
            budget,
        }
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn remaining(&self) -> Duration {
        self.budget.saturating_sub(self.elapsed())
    }

    pub fn is_expired(&self) -> bool {
        self.elapsed() >= self.budget
    }

    pub fn check(&self) -> Result<(), PipelineError> {
        if self.is_expired() {
            return Err(PipelineError::DeadlineExceeded {
                elapsed_ms: self.elapsed().as_millis() as u64,
                budget_ms: self.budget.as_millis() as u64,
            });
        }
        Ok(())
    }

    /// Fails when fewer than `needed` remain.
    pub fn ensure_remaining(&self, needed: Duration) -> Result<(), PipelineError> {
        self.check()?;
        let remaining = self.remaining();
        if remaining < needed {
            return Err(PipelineError::InsufficientBudget {
                remaining_ms: remaining.as_millis() as u64,
                needed_ms: needed.as_millis() as u64,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_flag_is_shared() {
        let flag = CancelFlag::new();
        let clone = flag.clone();
        assert!(!flag.is_cancelled());
        clone.cancel();
        assert!(flag.is_cancelled());
    }

    #[test]
    fn test_zero_budget_is_expired() {
        let deadline = Deadline::new(Duration::ZERO);
        assert!(deadline.is_expired());
        assert_eq!(deadline.remaining(), Duration::ZERO);
        assert!(matches!(
            deadline.check(),
            Err(PipelineError::DeadlineExceeded { budget_ms: 0, .. })
        ));
    }

    #[test]
    fn test_insufficient_budget() {
        let deadline = Deadline::new(Duration::from_secs(60));
        assert!(deadline.ensure_remaining(Duration::from_secs(1)).is_ok());
        assert!(matches!(
            deadline.ensure_remaining(Duration::from_secs(3600)),
            Err(PipelineError::InsufficientBudget { .. })
        ));
    }
}
