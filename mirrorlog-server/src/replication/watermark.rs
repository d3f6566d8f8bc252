use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

/// Highest log offset acknowledged by any slave.
///
/// Updated concurrently by every master-side connection; advances are
/// strictly monotonic and each successful advance wakes the group transfer
/// service. There is no decrement path.
#[derive(Default)]
pub struct AckWatermark {
    offset: AtomicU64,
    advanced: Notify,
}

impl AckWatermark {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> u64 {
        self.offset.load(Ordering::Acquire)
    }

    /// Raise the watermark to `candidate` if it is strictly greater than the
    /// current value. Returns whether the watermark moved.
    pub fn advance_to(&self, candidate: u64) -> bool {
        let mut current = self.offset.load(Ordering::Acquire);
        while candidate > current {
            match self.offset.compare_exchange(
                current,
                candidate,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    // notify_one keeps a permit when nobody is waiting, so
                    // the transfer service cannot miss the final advance.
                    self.advanced.notify_one();
                    return true;
                }
                Err(observed) => current = observed,
            }
        }
        false
    }

    /// Wait up to `timeout` for the next advance. May return spuriously
    /// early; callers re-check the watermark.
    pub async fn wait_for_advance(&self, timeout: Duration) {
        let _ = tokio::time::timeout(timeout, self.advanced.notified()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_advance_is_monotonic() {
        let watermark = AckWatermark::new();
        assert_eq!(watermark.current(), 0);

        assert!(watermark.advance_to(100));
        assert_eq!(watermark.current(), 100);

        // Equal and smaller candidates are rejected.
        assert!(!watermark.advance_to(100));
        assert!(!watermark.advance_to(50));
        assert_eq!(watermark.current(), 100);

        assert!(watermark.advance_to(101));
        assert_eq!(watermark.current(), 101);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_advances_settle_on_max() {
        let watermark = Arc::new(AckWatermark::new());

        let mut handles = Vec::new();
        for task in 0..8u64 {
            let watermark = Arc::clone(&watermark);
            handles.push(tokio::spawn(async move {
                for step in 0..1000u64 {
                    watermark.advance_to(task * 1000 + step);
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        // Max candidate ever submitted: 7 * 1000 + 999.
        assert_eq!(watermark.current(), 7999);
    }

    #[tokio::test]
    async fn test_wait_observes_advance() {
        let watermark = Arc::new(AckWatermark::new());
        let waiter = Arc::clone(&watermark);

        let handle = tokio::spawn(async move {
            while waiter.current() < 10 {
                waiter.wait_for_advance(Duration::from_millis(100)).await;
            }
            waiter.current()
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        watermark.advance_to(10);

        let seen = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("waiter never observed the advance")
            .unwrap();
        assert!(seen >= 10);
    }
}
