//! Per-operation-class retry policy and circuit breaker.
//!
//! Every call is classified into an `OperationClass`; each class owns one
//! `CircuitBreaker` and one `RetryPolicy`. Transient `AdapterError`s are
//! retried with exponential backoff + optional jitter; permanent errors are
//! not retried. Classification is status-code based only — there is no
//! string-matching fallback in this implementation.

use crate::adapter::AdapterError;
use crate::audit::AuditMonitor;
use crate::error::ModerationError;
use parking_lot::Mutex;
use rand::Rng as _;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationClass {
    BanKick,
    Timeout,
    Messages,
    Database,
    ApiOther,
}

impl OperationClass {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationClass::BanKick => "ban_kick",
            OperationClass::Timeout => "timeout",
            OperationClass::Messages => "messages",
            OperationClass::Database => "database",
            OperationClass::ApiOther => "api-other",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
    pub jitter: Option<f64>,
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub open_duration: Duration,
}

impl RetryPolicy {
    pub fn for_class(class: OperationClass) -> Self {
        match class {
            OperationClass::BanKick => RetryPolicy {
                max_attempts: 3,
                initial_backoff: Duration::from_millis(200),
                max_backoff: Duration::from_secs(5),
                backoff_multiplier: 2.0,
                jitter: Some(0.1),
                failure_threshold: 5,
                success_threshold: 2,
                open_duration: Duration::from_secs(30),
            },
            OperationClass::Timeout => RetryPolicy {
                max_attempts: 3,
                initial_backoff: Duration::from_millis(200),
                max_backoff: Duration::from_secs(5),
                backoff_multiplier: 2.0,
                jitter: Some(0.1),
                failure_threshold: 5,
                success_threshold: 2,
                open_duration: Duration::from_secs(30),
            },
            OperationClass::Messages => RetryPolicy {
                max_attempts: 4,
                initial_backoff: Duration::from_millis(250),
                max_backoff: Duration::from_secs(10),
                backoff_multiplier: 2.0,
                jitter: Some(0.1),
                failure_threshold: 8,
                success_threshold: 2,
                open_duration: Duration::from_secs(20),
            },
            OperationClass::Database => RetryPolicy {
                max_attempts: 3,
                initial_backoff: Duration::from_millis(100),
                max_backoff: Duration::from_secs(3),
                backoff_multiplier: 2.0,
                jitter: Some(0.2),
                failure_threshold: 5,
                success_threshold: 2,
                open_duration: Duration::from_secs(15),
            },
            OperationClass::ApiOther => RetryPolicy {
                max_attempts: 3,
                initial_backoff: Duration::from_millis(250),
                max_backoff: Duration::from_secs(8),
                backoff_multiplier: 2.0,
                jitter: Some(0.1),
                failure_threshold: 5,
                success_threshold: 2,
                open_duration: Duration::from_secs(30),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

struct BreakerInner {
    state: AtomicU8, // 0=Closed, 1=Open, 2=HalfOpen
    consecutive_failures: AtomicU32,
    consecutive_successes: AtomicU32,
    opened_at: Mutex<Option<Instant>>,
}

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

/// One circuit breaker per operation class.
pub struct CircuitBreaker {
    policy: RetryPolicy,
    inner: BreakerInner,
}

impl CircuitBreaker {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            inner: BreakerInner {
                state: AtomicU8::new(STATE_CLOSED),
                consecutive_failures: AtomicU32::new(0),
                consecutive_successes: AtomicU32::new(0),
                opened_at: Mutex::new(None),
            },
        }
    }

    pub fn state(&self) -> BreakerState {
        match self.inner.state.load(Ordering::SeqCst) {
            STATE_OPEN => {
                let elapsed = self.inner.opened_at.lock().map(|t| t.elapsed());
                if elapsed.is_some_and(|e| e >= self.policy.open_duration) {
                    // Admit the next call in HalfOpen without mutating state
                    // here; `admit` performs the actual transition so the
                    // decision and the transition happen atomically enough
                    // for a single caller at a time to matter.
                    BreakerState::HalfOpen
                } else {
                    BreakerState::Open
                }
            }
            STATE_HALF_OPEN => BreakerState::HalfOpen,
            _ => BreakerState::Closed,
        }
    }

    /// Returns `true` if a call is currently admitted.
    pub fn admit(&self) -> bool {
        match self.inner.state.load(Ordering::SeqCst) {
            STATE_CLOSED => true,
            STATE_HALF_OPEN => true,
            STATE_OPEN => {
                let should_try = {
                    let opened_at = self.inner.opened_at.lock();
                    opened_at.is_some_and(|t| t.elapsed() >= self.policy.open_duration)
                };
                if should_try {
                    self.inner.state.store(STATE_HALF_OPEN, Ordering::SeqCst);
                    self.inner.consecutive_successes.store(0, Ordering::SeqCst);
                    true
                } else {
                    false
                }
            }
            _ => true,
        }
    }

    pub fn record_success(&self) {
        match self.inner.state.load(Ordering::SeqCst) {
            STATE_HALF_OPEN => {
                let successes = self.inner.consecutive_successes.fetch_add(1, Ordering::SeqCst) + 1;
                if successes >= self.policy.success_threshold {
                    self.inner.state.store(STATE_CLOSED, Ordering::SeqCst);
                    self.inner.consecutive_failures.store(0, Ordering::SeqCst);
                }
            }
            _ => {
                self.inner.consecutive_failures.store(0, Ordering::SeqCst);
            }
        }
    }

    pub fn record_failure(&self) {
        match self.inner.state.load(Ordering::SeqCst) {
            STATE_HALF_OPEN => {
                self.trip();
            }
            _ => {
                let failures = self.inner.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                if failures >= self.policy.failure_threshold {
                    self.trip();
                }
            }
        }
    }

    fn trip(&self) {
        self.inner.state.store(STATE_OPEN, Ordering::SeqCst);
        *self.inner.opened_at.lock() = Some(Instant::now());
        self.inner.consecutive_successes.store(0, Ordering::SeqCst);
    }
}

/// Owns one `CircuitBreaker` per `OperationClass`.
pub struct RetryRegistry {
    breakers: HashMap<OperationClass, Arc<CircuitBreaker>>,
}

impl Default for RetryRegistry {
    fn default() -> Self {
        let classes = [
            OperationClass::BanKick,
            OperationClass::Timeout,
            OperationClass::Messages,
            OperationClass::Database,
            OperationClass::ApiOther,
        ];
        let breakers = classes
            .into_iter()
            .map(|c| (c, Arc::new(CircuitBreaker::new(RetryPolicy::for_class(c)))))
            .collect();
        Self { breakers }
    }
}

impl RetryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn breaker(&self, class: OperationClass) -> Arc<CircuitBreaker> {
        self.breakers
            .get(&class)
            .cloned()
            .expect("all operation classes are pre-registered")
    }
}

fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let base = policy.initial_backoff.as_secs_f64() * policy.backoff_multiplier.powi(attempt as i32 - 1);
    let base = base.min(policy.max_backoff.as_secs_f64());
    let jittered = match policy.jitter {
        Some(frac) if frac > 0.0 => {
            let mut rng = rand::thread_rng();
            let delta = base * frac * rng.gen_range(-1.0..=1.0);
            (base + delta).max(0.0)
        }
        _ => base,
    };
    Duration::from_secs_f64(jittered)
}

/// Runs `make_future` under `class`'s circuit breaker and retry policy.
/// `make_future` is re-invoked for each attempt.
pub async fn execute_with_retry<T, Fut, F>(
    class: OperationClass,
    registry: &RetryRegistry,
    audit: &AuditMonitor,
    mut make_future: F,
) -> Result<T, ModerationError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AdapterError>>,
{
    let breaker = registry.breaker(class);
    let policy = RetryPolicy::for_class(class);

    if !breaker.admit() {
        audit.record_circuit_trip(class);
        return Err(ModerationError::CircuitOpen {
            class: class.as_str().to_string(),
        });
    }

    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match make_future().await {
            Ok(value) => {
                breaker.record_success();
                return Ok(value);
            }
            Err(err) => {
                let retry_after = match &err {
                    AdapterError::RateLimited { retry_after_ms } => {
                        Some(Duration::from_millis(*retry_after_ms))
                    }
                    _ => None,
                };

                if !err.is_transient() {
                    breaker.record_failure();
                    return Err(classify_permanent(err));
                }

                breaker.record_failure();

                if attempt >= policy.max_attempts {
                    return Err(ModerationError::RetryExhausted {
                        reason: err.to_string(),
                    });
                }

                if !breaker.admit() {
                    audit.record_circuit_trip(class);
                    return Err(ModerationError::CircuitOpen {
                        class: class.as_str().to_string(),
                    });
                }

                let delay = retry_after.unwrap_or_else(|| backoff_delay(&policy, attempt));
                tokio::time::sleep(delay).await;
            }
        }
    }
}

fn classify_permanent(err: AdapterError) -> ModerationError {
    match err {
        AdapterError::Forbidden => ModerationError::BotCapability {
            permission: "unknown".to_string(),
        },
        AdapterError::NotFound => ModerationError::TargetState {
            reason: "target not found".to_string(),
        },
        AdapterError::Cancelled => ModerationError::Cancelled {
            reason: "adapter call cancelled".to_string(),
        },
        other => ModerationError::Invariant {
            reason: other.to_string(),
        },
    }
}
