use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tracing::{debug, warn};

use crate::config::ReconnectSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectionState {
    Idle,
    Waiting,
    Connecting,
    Connected,
    Failed,
}

pub type AttemptFn = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;
pub type ExhaustedFn = Box<dyn Fn(u32) + Send + Sync>;

struct Inner {
    state: ReconnectionState,
    attempts: u32,
    timer: Option<tokio::task::JoinHandle<()>>,
    cancelled: bool,
    exhausted_fired: bool,
}

/// Exponential-backoff-with-jitter scheduler for one server. Failed attempts
/// self-reschedule until the budget is spent, then the manager parks in
/// `Failed` and fires the exhaustion callback exactly once.
pub struct ReconnectionManager {
    settings: ReconnectSettings,
    inner: Mutex<Inner>,
    on_exhausted: Mutex<Option<ExhaustedFn>>,
}

impl ReconnectionManager {
    pub fn new(settings: ReconnectSettings) -> Arc<Self> {
        Arc::new(Self {
            settings,
            inner: Mutex::new(Inner {
                state: ReconnectionState::Idle,
                attempts: 0,
                timer: None,
                cancelled: false,
                exhausted_fired: false,
            }),
            on_exhausted: Mutex::new(None),
        })
    }

    pub fn set_exhausted_callback(&self, callback: ExhaustedFn) {
        *self.on_exhausted.lock().unwrap() = Some(callback);
    }

    pub fn state(&self) -> ReconnectionState {
        self.inner.lock().unwrap().state
    }

    pub fn attempts(&self) -> u32 {
        self.inner.lock().unwrap().attempts
    }

    /// Nominal delay for the given attempt index:
    /// `min(initial * multiplier^n, max) * (1 ± U(0, jitter))`.
    pub fn compute_delay(&self, attempts: u32) -> Duration {
        let base = (self.settings.initial_delay_ms as f64)
            * self.settings.backoff_multiplier.powi(attempts as i32);
        let capped = base.min(self.settings.max_delay_ms as f64);
        let jitter = self.settings.jitter.clamp(0.0, 1.0);
        let factor = if jitter > 0.0 {
            use rand::Rng;
            1.0 + rand::rng().random_range(-jitter..=jitter)
        } else {
            1.0
        };
        Duration::from_millis((capped * factor).max(0.0) as u64)
    }

    /// Schedule the next attempt. Returns false when the manager was
    /// cancelled (a `reset` is required first) or the budget is exhausted.
    pub fn schedule_reconnection(self: &Arc<Self>, attempt: AttemptFn) -> bool {
        let delay = {
            let mut inner = self.inner.lock().unwrap();
            if inner.cancelled {
                return false;
            }
            if inner.attempts >= self.settings.max_attempts {
                inner.state = ReconnectionState::Failed;
                let fire = !inner.exhausted_fired;
                inner.exhausted_fired = true;
                let attempts = inner.attempts;
                drop(inner);
                if fire {
                    warn!(target = "reconnect", attempts, "reconnection budget exhausted");
                    if let Some(callback) = self.on_exhausted.lock().unwrap().as_ref() {
                        callback(attempts);
                    }
                }
                return false;
            }
            inner.state = ReconnectionState::Waiting;
            self.compute_delay(inner.attempts)
        };

        let manager = self.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let attempt_number = {
                let mut inner = manager.inner.lock().unwrap();
                if inner.cancelled {
                    return;
                }
                inner.attempts += 1;
                inner.state = ReconnectionState::Connecting;
                inner.attempts
            };
            debug!(target = "reconnect", attempt = attempt_number, "reconnection attempt");
            match attempt().await {
                Ok(()) => {
                    let mut inner = manager.inner.lock().unwrap();
                    inner.state = ReconnectionState::Connected;
                }
                Err(err) => {
                    debug!(target = "reconnect", attempt = attempt_number, error = %err,
                           "reconnection attempt failed");
                    manager.schedule_reconnection(attempt);
                }
            }
        });
        self.inner.lock().unwrap().timer = Some(handle);
        true
    }

    /// Stop any pending attempt. Scheduling stays refused until `reset`.
    pub fn cancel(&self) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(timer) = inner.timer.take() {
            timer.abort();
        }
        inner.state = ReconnectionState::Idle;
        inner.cancelled = true;
    }

    /// Return to `Idle` with a fresh budget. Callable from any state.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(timer) = inner.timer.take() {
            timer.abort();
        }
        inner.state = ReconnectionState::Idle;
        inner.attempts = 0;
        inner.cancelled = false;
        inner.exhausted_fired = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn settings(max_attempts: u32, initial_delay_ms: u64) -> ReconnectSettings {
        ReconnectSettings {
            enabled: true,
            max_attempts,
            initial_delay_ms,
            backoff_multiplier: 2.0,
            max_delay_ms: 60_000,
            jitter: 0.25,
        }
    }

    #[test]
    fn delay_stays_within_jitter_bounds() {
        let manager = ReconnectionManager::new(settings(10, 1000));
        for attempt in 0..6 {
            let nominal = (1000.0 * 2f64.powi(attempt)).min(60_000.0);
            for _ in 0..50 {
                let delay = manager.compute_delay(attempt as u32).as_millis() as f64;
                assert!(delay >= nominal * 0.75 - 1.0, "attempt {attempt}: {delay}");
                assert!(delay <= nominal * 1.25 + 1.0, "attempt {attempt}: {delay}");
            }
        }
    }

    #[test]
    fn delay_is_clamped_to_max() {
        let manager = ReconnectionManager::new(ReconnectSettings {
            jitter: 0.0,
            ..settings(10, 1000)
        });
        assert_eq!(manager.compute_delay(20), Duration::from_millis(60_000));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_budget_and_fires_callback_once() {
        let manager = ReconnectionManager::new(settings(2, 10));
        let attempts_made = Arc::new(AtomicUsize::new(0));
        let exhausted = Arc::new(AtomicUsize::new(0));
        {
            let exhausted = exhausted.clone();
            manager.set_exhausted_callback(Box::new(move |_| {
                exhausted.fetch_add(1, Ordering::SeqCst);
            }));
        }
        let counter = attempts_made.clone();
        let attempt: AttemptFn = Arc::new(move || {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                anyhow::bail!("still down")
            })
        });
        assert!(manager.schedule_reconnection(attempt));
        tokio::time::sleep(Duration::from_secs(5)).await;
        tokio::task::yield_now().await;

        assert_eq!(attempts_made.load(Ordering::SeqCst), 2);
        assert_eq!(exhausted.load(Ordering::SeqCst), 1);
        assert_eq!(manager.state(), ReconnectionState::Failed);

        // no further scheduling once failed, and no second callback
        let attempt: AttemptFn = Arc::new(|| Box::pin(async { anyhow::bail!("down") }));
        assert!(!manager.schedule_reconnection(attempt));
        assert_eq!(exhausted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn successful_attempt_connects() {
        let manager = ReconnectionManager::new(settings(3, 10));
        let attempt: AttemptFn = Arc::new(|| Box::pin(async { Ok(()) }));
        assert!(manager.schedule_reconnection(attempt));
        tokio::time::sleep(Duration::from_secs(1)).await;
        tokio::task::yield_now().await;
        assert_eq!(manager.state(), ReconnectionState::Connected);
        assert_eq!(manager.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_blocks_scheduling_until_reset() {
        let manager = ReconnectionManager::new(settings(3, 10_000));
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let attempt: AttemptFn = Arc::new(move || {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        });
        assert!(manager.schedule_reconnection(attempt.clone()));
        manager.cancel();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(manager.state(), ReconnectionState::Idle);

        assert!(!manager.schedule_reconnection(attempt.clone()));
        manager.reset();
        assert!(manager.schedule_reconnection(attempt));
        tokio::time::sleep(Duration::from_secs(60)).await;
        tokio::task::yield_now().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
