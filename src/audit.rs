//! Bounded in-memory event deque, per-class counters, a fixed-bucket
//! response-time histogram, circuit-breaker trip counts, and
//! lock-contention tracking for the moderation pipeline.

use crate::retry::OperationClass;
use crate::store::CaseType;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    pub operation_type: OperationClass,
    pub guild_id: i64,
    pub user_id: i64,
    pub moderator_id: i64,
    pub case_type: CaseType,
    pub success: bool,
    pub response_time: Duration,
    pub dm_sent: bool,
    pub case_created: bool,
    pub case_number: Option<i64>,
    pub error_message: Option<String>,
}

/// Fixed-width response-time buckets used to approximate p50/p95/p99
/// without storing every sample.
const BUCKET_BOUNDS_MS: [u64; 7] = [50, 100, 250, 500, 1000, 2000, 5000];

#[derive(Debug, Default)]
struct ClassCounters {
    total: AtomicU64,
    success: AtomicU64,
    failed: AtomicU64,
    buckets: [AtomicU64; 8], // last bucket is "5000ms+"
}

#[derive(Debug, Clone, Default)]
pub struct Percentiles {
    pub p50_ms: u64,
    pub p95_ms: u64,
    pub p99_ms: u64,
}

#[derive(Debug, Clone, Default)]
pub struct ClassHealth {
    pub total: u64,
    pub success: u64,
    pub failed: u64,
    pub percentiles: Percentiles,
    pub circuit_trips: u64,
}

#[derive(Debug, Clone, Default)]
pub struct SystemHealth {
    pub classes: Vec<(String, ClassHealth)>,
    pub lock_contention: u64,
    pub recent_event_count: usize,
    pub error_first_tokens: Vec<(String, u64)>,
}

pub struct AuditMonitor {
    capacity: usize,
    events: RwLock<VecDeque<AuditEvent>>,
    counters: DashMap<OperationClass, ClassCounters>,
    circuit_trips: DashMap<OperationClass, AtomicU64>,
    lock_contention: AtomicU64,
    error_first_token_counts: DashMap<String, AtomicU64>,
}

impl AuditMonitor {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            events: RwLock::new(VecDeque::with_capacity(capacity)),
            counters: DashMap::new(),
            circuit_trips: DashMap::new(),
            lock_contention: AtomicU64::new(0),
            error_first_token_counts: DashMap::new(),
        }
    }

    fn bucket_index(ms: u64) -> usize {
        BUCKET_BOUNDS_MS
            .iter()
            .position(|&bound| ms < bound)
            .unwrap_or(BUCKET_BOUNDS_MS.len())
    }

    /// Records one completed (or cancelled) moderation attempt. Every
    /// attempt that enters phase one of the coordinator pipeline results
    /// in exactly one call here.
    pub fn record_event(&self, event: AuditEvent) {
        let counters = self
            .counters
            .entry(event.operation_type)
            .or_insert_with(ClassCounters::default);
        counters.total.fetch_add(1, Ordering::Relaxed);
        if event.success {
            counters.success.fetch_add(1, Ordering::Relaxed);
        } else {
            counters.failed.fetch_add(1, Ordering::Relaxed);
        }
        let bucket = Self::bucket_index(event.response_time.as_millis() as u64);
        counters.buckets[bucket].fetch_add(1, Ordering::Relaxed);

        if let Some(msg) = &event.error_message {
            if let Some(first_token) = msg.split_whitespace().next() {
                self.error_first_token_counts
                    .entry(first_token.to_string())
                    .or_insert_with(|| AtomicU64::new(0))
                    .fetch_add(1, Ordering::Relaxed);
            }
        }

        let mut events = self.events.write();
        if events.len() >= self.capacity {
            events.pop_front();
        }
        events.push_back(event);
    }

    pub fn record_circuit_trip(&self, class: OperationClass) {
        self.circuit_trips
            .entry(class)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lock_contention(&self) {
        self.lock_contention.fetch_add(1, Ordering::Relaxed);
    }

    fn percentiles_for(counters: &ClassCounters) -> Percentiles {
        let total: u64 = counters.buckets.iter().map(|b| b.load(Ordering::Relaxed)).sum();
        if total == 0 {
            return Percentiles::default();
        }
        let bucket_upper = |idx: usize| -> u64 {
            if idx < BUCKET_BOUNDS_MS.len() {
                BUCKET_BOUNDS_MS[idx]
            } else {
                BUCKET_BOUNDS_MS[BUCKET_BOUNDS_MS.len() - 1] * 2
            }
        };
        let percentile = |target_fraction: f64| -> u64 {
            let target = (total as f64 * target_fraction).ceil() as u64;
            let mut cumulative = 0u64;
            for (idx, bucket) in counters.buckets.iter().enumerate() {
                cumulative += bucket.load(Ordering::Relaxed);
                if cumulative >= target.max(1) {
                    return bucket_upper(idx);
                }
            }
            bucket_upper(counters.buckets.len() - 1)
        };
        Percentiles {
            p50_ms: percentile(0.50),
            p95_ms: percentile(0.95),
            p99_ms: percentile(0.99),
        }
    }

    pub fn system_health(&self) -> SystemHealth {
        let classes = self
            .counters
            .iter()
            .map(|entry| {
                let class = *entry.key();
                let counters = entry.value();
                let trips = self
                    .circuit_trips
                    .get(&class)
                    .map(|c| c.load(Ordering::Relaxed))
                    .unwrap_or(0);
                (
                    class.as_str().to_string(),
                    ClassHealth {
                        total: counters.total.load(Ordering::Relaxed),
                        success: counters.success.load(Ordering::Relaxed),
                        failed: counters.failed.load(Ordering::Relaxed),
                        percentiles: Self::percentiles_for(counters),
                        circuit_trips: trips,
                    },
                )
            })
            .collect();

        let mut error_first_tokens: Vec<(String, u64)> = self
            .error_first_token_counts
            .iter()
            .map(|e| (e.key().clone(), e.value().load(Ordering::Relaxed)))
            .collect();
        error_first_tokens.sort_by(|a, b| b.1.cmp(&a.1));

        SystemHealth {
            classes,
            lock_contention: self.lock_contention.load(Ordering::Relaxed),
            recent_event_count: self.events.read().len(),
            error_first_tokens,
        }
    }

    /// Prunes events older than `max_age_hours` and resets lock-contention
    /// and circuit-breaker trip counters.
    pub fn clear_old_data(&self, max_age_hours: i64) {
        let cutoff = Utc::now() - chrono::Duration::hours(max_age_hours);
        let mut events = self.events.write();
        events.retain(|e| e.timestamp >= cutoff);
        drop(events);
        self.lock_contention.store(0, Ordering::Relaxed);
        for entry in self.circuit_trips.iter() {
            entry.value().store(0, Ordering::Relaxed);
        }
    }

    pub fn recent_events(&self, limit: usize) -> Vec<AuditEvent> {
        let events = self.events.read();
        events.iter().rev().take(limit).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event(success: bool, response_ms: u64) -> AuditEvent {
        AuditEvent {
            timestamp: Utc::now(),
            operation_type: OperationClass::BanKick,
            guild_id: 1,
            user_id: 2,
            moderator_id: 3,
            case_type: CaseType::Ban,
            success,
            response_time: Duration::from_millis(response_ms),
            dm_sent: true,
            case_created: success,
            case_number: if success { Some(1) } else { None },
            error_message: if success { None } else { Some("Forbidden missing permission".to_string()) },
        }
    }

    #[test]
    fn bounded_deque_evicts_oldest() {
        let monitor = AuditMonitor::new(2);
        monitor.record_event(sample_event(true, 10));
        monitor.record_event(sample_event(true, 20));
        monitor.record_event(sample_event(true, 30));
        let recent = monitor.recent_events(10);
        assert_eq!(recent.len(), 2);
    }

    #[test]
    fn counters_track_success_and_failure() {
        let monitor = AuditMonitor::new(100);
        monitor.record_event(sample_event(true, 10));
        monitor.record_event(sample_event(false, 10));
        let health = monitor.system_health();
        let (_, class_health) = &health.classes[0];
        assert_eq!(class_health.total, 2);
        assert_eq!(class_health.success, 1);
        assert_eq!(class_health.failed, 1);
    }

    #[test]
    fn error_first_token_is_recorded() {
        let monitor = AuditMonitor::new(100);
        monitor.record_event(sample_event(false, 10));
        let health = monitor.system_health();
        assert!(health.error_first_tokens.iter().any(|(t, _)| t == "Forbidden"));
    }

    #[test]
    fn clear_old_data_resets_contention_and_trips() {
        let monitor = AuditMonitor::new(100);
        monitor.record_lock_contention();
        monitor.record_circuit_trip(OperationClass::BanKick);
        monitor.clear_old_data(24);
        assert_eq!(monitor.system_health().lock_contention, 0);
    }
}
