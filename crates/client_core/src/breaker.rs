use std::sync::atomic::{AtomicBool, Ordering};

/// One-way switch disabling an operation for the rest of the session.
#[derive(Debug, Default)]
pub struct CircuitBreaker {
    tripped: AtomicBool,
}

impl CircuitBreaker {
    pub fn is_tripped(&self) -> bool {
        self.tripped.load(Ordering::Acquire)
    }

    /// Returns `true` only for the call that actually tripped it.
    pub fn trip(&self) -> bool {
        !self.tripped.swap(true, Ordering::AcqRel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trips_once_and_stays_tripped() {
        let breaker = CircuitBreaker::default();
        assert!(!breaker.is_tripped());
        assert!(breaker.trip());
        assert!(!breaker.trip());
        assert!(breaker.is_tripped());
    }
}
