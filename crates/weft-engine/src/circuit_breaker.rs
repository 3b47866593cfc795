//! Circuit breaker for protected dependencies.
//!
//! Stops calling an agent or script that keeps failing, then lets a single
//! probe through after a cool-down to check whether it recovered.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use weft_core::config::CircuitBreakerConfig;
use weft_core::error::{Result, WeftError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls flow normally.
    Closed,
    /// Calls are rejected without reaching the dependency.
    Open,
    /// One probe call is allowed to test recovery.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub failure_threshold: u32,
    pub total_rejections: u64,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
    total_rejections: u64,
}

pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    cool_down: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: &CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            failure_threshold: config.failure_threshold.max(1),
            cool_down: config.cool_down(),
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probe_in_flight: false,
                total_rejections: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // State is plain data; a poisoned lock still holds a usable value.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Current state, applying the OPEN -> HALF_OPEN cool-down transition.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock();
        self.check_cool_down(&mut inner);
        inner.state
    }

    fn check_cool_down(&self, inner: &mut Inner) {
        if inner.state != CircuitState::Open {
            return;
        }
        if let Some(opened_at) = inner.opened_at {
            if opened_at.elapsed() >= self.cool_down {
                self.transition_to(inner, CircuitState::HalfOpen);
            }
        }
    }

    fn transition_to(&self, inner: &mut Inner, next: CircuitState) {
        if inner.state == next {
            return;
        }
        debug!(breaker = %self.name, from = %inner.state, to = %next, "Circuit state change");
        match next {
            CircuitState::Open => {
                inner.opened_at = Some(Instant::now());
            }
            CircuitState::Closed => {
                inner.opened_at = None;
                inner.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {}
        }
        inner.probe_in_flight = false;
        inner.state = next;
    }

    fn try_acquire(&self) -> bool {
        let mut inner = self.lock();
        self.check_cool_down(&mut inner);
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen if !inner.probe_in_flight => {
                inner.probe_in_flight = true;
                true
            }
            _ => {
                inner.total_rejections += 1;
                false
            }
        }
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => inner.consecutive_failures = 0,
            CircuitState::HalfOpen => {
                info!(breaker = %self.name, "Circuit closing after successful probe");
                self.transition_to(&mut inner, CircuitState::Closed);
            }
            CircuitState::Open => {}
        }
    }

    /// Record a failed call.
    pub fn record_failure(&self) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.failure_threshold {
                    warn!(
                        breaker = %self.name,
                        failures = inner.consecutive_failures,
                        "Circuit opening due to failures"
                    );
                    self.transition_to(&mut inner, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                warn!(breaker = %self.name, "Circuit re-opening after failed probe");
                self.transition_to(&mut inner, CircuitState::Open);
            }
            CircuitState::Open => {}
        }
    }

    /// Run `operation` through the breaker.
    ///
    /// Returns [`WeftError::CircuitOpen`] without invoking the operation
    /// when the circuit rejects the call. A call whose future is dropped
    /// before it finishes (a step deadline, a cancelled run) counts as a
    /// failure.
    pub async fn call<T, F, Fut>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if !self.try_acquire() {
            debug!(breaker = %self.name, "Call rejected, circuit open");
            return Err(WeftError::CircuitOpen(self.name.clone()));
        }

        let mut guard = InFlightGuard {
            breaker: self,
            armed: true,
        };
        let result = operation().await;
        guard.armed = false;

        match &result {
            Ok(_) => self.record_success(),
            Err(_) => self.record_failure(),
        }
        result
    }

    /// Force the circuit closed and clear counters.
    pub fn reset(&self) {
        let mut inner = self.lock();
        info!(breaker = %self.name, "Circuit manually reset");
        self.transition_to(&mut inner, CircuitState::Closed);
        inner.consecutive_failures = 0;
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let mut inner = self.lock();
        self.check_cool_down(&mut inner);
        CircuitBreakerStats {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            failure_threshold: self.failure_threshold,
            total_rejections: inner.total_rejections,
        }
    }
}

/// Counts a call that never finished (its future was dropped) as a failure.
/// A hung dependency then opens the circuit like any failing one, and a
/// dropped probe cannot leave it stuck in HALF_OPEN.
struct InFlightGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.record_failure();
        }
    }
}

/// One shared breaker per dependency key.
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    pub fn agent_key(agent_id: &str) -> String {
        format!("agent:{}", agent_id)
    }

    pub fn script_key(path: &str) -> String {
        format!("script:{}", path)
    }

    /// Breaker for `key`, created on first use.
    pub fn get(&self, key: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
        breakers
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(key, &self.config)))
            .clone()
    }

    /// Stats for every breaker created so far, sorted by key.
    pub fn stats(&self) -> Vec<CircuitBreakerStats> {
        let breakers: Vec<Arc<CircuitBreaker>> = {
            let map = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
            map.values().cloned().collect()
        };
        let mut stats: Vec<_> = breakers.iter().map(|b| b.stats()).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    /// Reset one breaker. Returns false if no breaker exists for `key`.
    pub fn reset(&self, key: &str) -> bool {
        let breaker = {
            let map = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
            map.get(key).cloned()
        };
        match breaker {
            Some(b) => {
                b.reset();
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn breaker(threshold: u32, cool_down_secs: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "agent:test",
            &CircuitBreakerConfig {
                failure_threshold: threshold,
                cool_down_secs,
            },
        )
    }

    async fn fail(b: &CircuitBreaker) -> Result<()> {
        b.call(|| async {
            Err(WeftError::Agent {
                agent: "test".into(),
                message: "boom".into(),
            })
        })
        .await
    }

    async fn succeed(b: &CircuitBreaker) -> Result<()> {
        b.call(|| async { Ok(()) }).await
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold() {
        let b = breaker(3, 60);
        for _ in 0..2 {
            assert!(fail(&b).await.is_err());
            assert_eq!(b.state(), CircuitState::Closed);
        }
        assert!(fail(&b).await.is_err());
        assert_eq!(b.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_counter() {
        let b = breaker(3, 60);
        fail(&b).await.ok();
        fail(&b).await.ok();
        succeed(&b).await.unwrap();
        fail(&b).await.ok();
        fail(&b).await.ok();
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(b.stats().consecutive_failures, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_rejects_without_calling() {
        let b = breaker(1, 60);
        fail(&b).await.ok();

        let calls = AtomicU32::new(0);
        let err = b
            .call(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap_err();

        assert!(matches!(err, WeftError::CircuitOpen(ref name) if name == "agent:test"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(b.stats().total_rejections, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_after_cool_down_then_close() {
        let b = breaker(1, 30);
        fail(&b).await.ok();
        assert_eq!(b.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(29)).await;
        assert_eq!(b.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(b.state(), CircuitState::HalfOpen);

        succeed(&b).await.unwrap();
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_probe_reopens() {
        let b = breaker(1, 30);
        fail(&b).await.ok();
        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(b.state(), CircuitState::HalfOpen);

        fail(&b).await.ok();
        assert_eq!(b.state(), CircuitState::Open);

        // The cool-down restarts from the failed probe
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(b.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_single_probe() {
        let b = Arc::new(breaker(1, 5));
        fail(&b).await.ok();
        tokio::time::advance(Duration::from_secs(5)).await;

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let probe = {
            let b = b.clone();
            tokio::spawn(async move {
                b.call(|| async move {
                    rx.await.ok();
                    Ok(())
                })
                .await
            })
        };
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        let err = succeed(&b).await.unwrap_err();
        assert!(matches!(err, WeftError::CircuitOpen(_)));

        tx.send(()).ok();
        probe.await.unwrap().unwrap();
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_probe_counts_as_failure() {
        let b = breaker(1, 5);
        fail(&b).await.ok();
        tokio::time::advance(Duration::from_secs(5)).await;

        let pending = b.call(|| std::future::pending::<Result<()>>());
        let timed_out = tokio::time::timeout(Duration::from_secs(1), pending).await;
        assert!(timed_out.is_err());
        assert_eq!(b.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_calls_open_the_circuit() {
        let b = breaker(3, 60);
        for _ in 0..2 {
            let hung = b.call(|| std::future::pending::<Result<()>>());
            assert!(tokio::time::timeout(Duration::from_secs(1), hung).await.is_err());
        }
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(b.stats().consecutive_failures, 2);

        let hung = b.call(|| std::future::pending::<Result<()>>());
        assert!(tokio::time::timeout(Duration::from_secs(1), hung).await.is_err());
        assert_eq!(b.state(), CircuitState::Open);

        let err = succeed(&b).await.unwrap_err();
        assert!(matches!(err, WeftError::CircuitOpen(_)));
    }

    #[test]
    fn test_registry_shares_breakers() {
        let reg = CircuitBreakerRegistry::new(CircuitBreakerConfig::default());
        let key = CircuitBreakerRegistry::agent_key("researcher");
        let a = reg.get(&key);
        let b = reg.get(&key);
        assert!(Arc::ptr_eq(&a, &b));

        reg.get(&CircuitBreakerRegistry::script_key("./build.sh"));
        let stats = reg.stats();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].name, "agent:researcher");

        assert!(reg.reset(&key));
        assert!(!reg.reset("agent:missing"));
    }
}
