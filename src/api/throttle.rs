use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;

use crate::config::ThrottleConfig;

/// Paces outbound REST calls: at most `max_concurrency` in flight and at
/// least `min_interval` between task starts, process-wide.
///
/// Queued tasks start in FIFO order (the semaphore and the interval gate are
/// both fair), but completion order is unspecified — concurrent tasks may
/// finish out of order. A task's own error passes through to its caller
/// unchanged; retry policy belongs to the caller.
pub struct RateLimiter {
    permits: Arc<Semaphore>,
    min_interval: Duration,
    last_start: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(config: &ThrottleConfig) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(config.max_concurrency)),
            min_interval: config.min_interval,
            last_start: Mutex::new(None),
        }
    }

    /// Queue `task` and run it once a concurrency slot is free and the
    /// inter-request interval has elapsed.
    pub async fn add<F, Fut, T>(&self, task: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _permit = self
            .permits
            .acquire()
            .await
            .expect("rate limiter semaphore is never closed");

        {
            // Holding the gate while sleeping guarantees the gap between any
            // two consecutive starts.
            let mut last = self.last_start.lock().await;
            if let Some(prev) = *last {
                let elapsed = prev.elapsed();
                if elapsed < self.min_interval {
                    tokio::time::sleep(self.min_interval - elapsed).await;
                }
            }
            *last = Some(Instant::now());
        }

        task().await
        // _permit drops here, freeing the slot for the next queued task.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn limiter(max_concurrency: usize, min_interval_ms: u64) -> Arc<RateLimiter> {
        Arc::new(RateLimiter::new(&ThrottleConfig {
            max_concurrency,
            min_interval: Duration::from_millis(min_interval_ms),
        }))
    }

    #[tokio::test]
    async fn test_concurrency_never_exceeds_limit() {
        let limiter = limiter(3, 0);
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..12 {
            let limiter = limiter.clone();
            let active = active.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                limiter
                    .add(|| async {
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        active.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn test_start_gap_at_least_min_interval() {
        let limiter = limiter(10, 25);
        let starts = Arc::new(std::sync::Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for _ in 0..5 {
            let limiter = limiter.clone();
            let starts = starts.clone();
            handles.push(tokio::spawn(async move {
                limiter
                    .add(|| async {
                        starts.lock().unwrap().push(Instant::now());
                    })
                    .await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let mut starts = starts.lock().unwrap().clone();
        starts.sort();
        for pair in starts.windows(2) {
            let gap = pair[1] - pair[0];
            // Small tolerance for timer coarseness.
            assert!(
                gap >= Duration::from_millis(24),
                "start gap {:?} below minimum interval",
                gap
            );
        }
    }

    #[tokio::test]
    async fn test_fifo_start_order() {
        let limiter = limiter(1, 1);
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..6 {
            let limiter = limiter.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                limiter
                    .add(|| async move {
                        order.lock().unwrap().push(i);
                    })
                    .await;
            }));
            // Give each spawned task time to reach the queue before the next
            // one, so enqueue order is deterministic.
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_task_error_passes_through() {
        let limiter = limiter(2, 0);
        let result: Result<(), &str> = limiter.add(|| async { Err("boom") }).await;
        assert_eq!(result, Err("boom"));

        // The failed task must have freed its slot.
        let ok: Result<u32, &str> = limiter.add(|| async { Ok(7) }).await;
        assert_eq!(ok, Ok(7));
    }
}
