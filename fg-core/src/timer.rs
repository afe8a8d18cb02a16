//! Disarmable monotonic timers
//!
//! The engines model every delayed step as a timer whose callback re-enters
//! the event loop: alarm grace periods, EEPROM bind delays, power-on settle
//! windows, zone increase delays and decrease intervals. Disarming a timer
//! guarantees its callback will not subsequently run; on the single-threaded
//! runtime the abort lands before the callback future is first polled.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;

/// A one-shot timer. Re-arming replaces any pending expiry.
#[derive(Debug, Default)]
pub struct OneShotTimer {
    handle: Option<JoinHandle<()>>,
}

impl OneShotTimer {
    pub fn new() -> Self {
        Self { handle: None }
    }

    /// Arm (or re-arm) the timer. `f` runs once after `delay`.
    pub fn restart_once<F, Fut>(&mut self, delay: Duration, f: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.disarm();
        self.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            f().await;
        }));
    }

    /// Cancel a pending expiry. No-op when not armed.
    pub fn disarm(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    /// True while an expiry is pending.
    pub fn is_armed(&self) -> bool {
        self.handle
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }
}

impl Drop for OneShotTimer {
    fn drop(&mut self) {
        self.disarm();
    }
}

/// A repeating timer. The callback runs after every full interval.
#[derive(Debug, Default)]
pub struct PeriodicTimer {
    handle: Option<JoinHandle<()>>,
}

impl PeriodicTimer {
    pub fn new() -> Self {
        Self { handle: None }
    }

    /// Arm (or re-arm) the repeating timer.
    pub fn restart<F, Fut>(&mut self, interval: Duration, f: F)
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.disarm();
        self.handle = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // interval() fires immediately; consume that first tick so the
            // callback runs one full interval from now.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                f().await;
            }
        }));
    }

    pub fn disarm(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    pub fn is_armed(&self) -> bool {
        self.handle
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }
}

impl Drop for PeriodicTimer {
    fn drop(&mut self) {
        self.disarm();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_one_shot_fires_once() {
        let count = Arc::new(AtomicU32::new(0));
        let mut timer = OneShotTimer::new();
        let c = count.clone();
        timer.restart_once(Duration::from_millis(10), move || async move {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert!(timer.is_armed());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!timer.is_armed());
    }

    #[tokio::test]
    async fn test_disarm_prevents_fire() {
        let count = Arc::new(AtomicU32::new(0));
        let mut timer = OneShotTimer::new();
        let c = count.clone();
        timer.restart_once(Duration::from_millis(20), move || async move {
            c.fetch_add(1, Ordering::SeqCst);
        });
        timer.disarm();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_restart_replaces_pending() {
        let count = Arc::new(AtomicU32::new(0));
        let mut timer = OneShotTimer::new();
        for _ in 0..3 {
            let c = count.clone();
            timer.restart_once(Duration::from_millis(15), move || async move {
                c.fetch_add(1, Ordering::SeqCst);
            });
        }
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_periodic_ticks() {
        let count = Arc::new(AtomicU32::new(0));
        let mut timer = PeriodicTimer::new();
        let c = count.clone();
        timer.restart(Duration::from_millis(10), move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
            }
        });
        tokio::time::sleep(Duration::from_millis(55)).await;
        timer.disarm();
        let seen = count.load(Ordering::SeqCst);
        assert!(seen >= 2, "expected at least 2 ticks, saw {}", seen);
    }
}
