/*!
 * Named operation timing
 *
 * Two timer shapes: scope-bound timers that record once on stop or drop,
 * and explicit start/end-by-id pairs for spans that do not follow lexical
 * scope. Completed measurements feed per-name statistics and a global
 * summary.
 */

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::warn;

use crate::config::MonitorConfig;

/// Aggregated statistics for one operation name.
#[derive(Debug, Clone, Default, Serialize)]
pub struct OperationStatistics {
    pub count: u64,
    pub total_duration_ms: f64,
    pub min_duration_ms: f64,
    pub max_duration_ms: f64,
    pub average_duration_ms: f64,
    pub last_duration_ms: f64,
    pub slow_count: u64,
}

/// Global summary across all operation names.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct PerformanceSummary {
    pub total_operations: u64,
    pub slow_operations: u64,
    pub total_duration_ms: f64,
}

#[derive(Debug, Clone)]
struct CompletedOperation {
    name: String,
    duration_ms: f64,
}

struct ActiveOperation {
    name: String,
    start: Instant,
}

struct Inner {
    next_id: u64,
    active: HashMap<u64, ActiveOperation>,
    completed: VecDeque<CompletedOperation>,
    statistics: HashMap<String, OperationStatistics>,
    thresholds: HashMap<String, Duration>,
    summary: PerformanceSummary,
}

/// Named-timer service. One internal lock around all state.
pub struct PerformanceMonitor {
    inner: Mutex<Inner>,
    config: MonitorConfig,
}

impl PerformanceMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_id: 1,
                active: HashMap::new(),
                completed: VecDeque::new(),
                statistics: HashMap::new(),
                thresholds: HashMap::new(),
                summary: PerformanceSummary::default(),
            }),
            config,
        }
    }

    /// Start a scope-bound timer. Records when stopped or dropped.
    pub fn start_timer(&self, name: impl Into<String>) -> ScopedTimer<'_> {
        ScopedTimer {
            monitor: self,
            name: name.into(),
            start: Instant::now(),
            stopped: false,
        }
    }

    /// Start an explicit operation span; pair with [`end_operation`].
    ///
    /// [`end_operation`]: Self::end_operation
    pub fn start_operation(&self, name: impl Into<String>) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.active.insert(
            id,
            ActiveOperation {
                name: name.into(),
                start: Instant::now(),
            },
        );
        id
    }

    /// Finish an explicit span. Returns false for unknown or already
    /// ended ids.
    pub fn end_operation(&self, id: u64) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let Some(op) = inner.active.remove(&id) else {
            return false;
        };
        let duration = op.start.elapsed();
        self.record_locked(&mut inner, &op.name, duration);
        true
    }

    pub fn has_operation(&self, id: u64) -> bool {
        self.inner.lock().unwrap().active.contains_key(&id)
    }

    /// Record a completed measurement directly.
    pub fn record_operation(&self, name: &str, duration: Duration) {
        let mut inner = self.inner.lock().unwrap();
        self.record_locked(&mut inner, name, duration);
    }

    /// Set the slow threshold for one name. Not retroactive: completed
    /// measurements keep the slow judgement made at record time.
    pub fn set_slow_threshold(&self, name: impl Into<String>, threshold: Duration) {
        self.inner.lock().unwrap().thresholds.insert(name.into(), threshold);
    }

    pub fn operation_statistics(&self) -> HashMap<String, OperationStatistics> {
        self.inner.lock().unwrap().statistics.clone()
    }

    pub fn summary(&self) -> PerformanceSummary {
        self.inner.lock().unwrap().summary
    }

    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.active.clear();
        inner.completed.clear();
        inner.statistics.clear();
        inner.summary = PerformanceSummary::default();
    }

    fn record_locked(&self, inner: &mut Inner, name: &str, duration: Duration) {
        let duration_ms = duration.as_secs_f64() * 1000.0;
        let threshold = inner
            .thresholds
            .get(name)
            .copied()
            .unwrap_or(self.config.default_slow_threshold);
        let slow = duration >= threshold;

        let stats = inner.statistics.entry(name.to_string()).or_default();
        if stats.count == 0 || duration_ms < stats.min_duration_ms {
            stats.min_duration_ms = duration_ms;
        }
        if duration_ms > stats.max_duration_ms {
            stats.max_duration_ms = duration_ms;
        }
        stats.count += 1;
        stats.total_duration_ms += duration_ms;
        stats.average_duration_ms = stats.total_duration_ms / stats.count as f64;
        stats.last_duration_ms = duration_ms;
        if slow {
            stats.slow_count += 1;
        }

        inner.summary.total_operations += 1;
        inner.summary.total_duration_ms += duration_ms;
        if slow {
            inner.summary.slow_operations += 1;
            warn!(operation = name, duration_ms, "slow operation");
        }

        if inner.completed.len() == self.config.max_completed_operations {
            inner.completed.pop_front();
        }
        inner.completed.push_back(CompletedOperation {
            name: name.to_string(),
            duration_ms,
        });
    }
}

/// Scope-bound timer. Records once, on [`stop`] or on drop, whichever
/// comes first; moving the timer out of its creating scope is fine.
///
/// [`stop`]: Self::stop
pub struct ScopedTimer<'a> {
    monitor: &'a PerformanceMonitor,
    name: String,
    start: Instant,
    stopped: bool,
}

impl ScopedTimer<'_> {
    /// Record the measurement now. Subsequent drops do nothing.
    pub fn stop(&mut self) -> Duration {
        let elapsed = self.start.elapsed();
        if !self.stopped {
            self.stopped = true;
            self.monitor.record_operation(&self.name, elapsed);
        }
        elapsed
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Drop for ScopedTimer<'_> {
    fn drop(&mut self) {
        if !self.stopped {
            self.stopped = true;
            self.monitor.record_operation(&self.name, self.start.elapsed());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> PerformanceMonitor {
        PerformanceMonitor::new(MonitorConfig::default())
    }

    #[test]
    fn recorded_operations_aggregate_exactly() {
        let m = monitor();
        m.record_operation("write", Duration::from_millis(10));
        m.record_operation("write", Duration::from_millis(20));
        m.record_operation("write", Duration::from_millis(30));

        let stats = m.operation_statistics();
        let write = &stats["write"];
        assert_eq!(write.count, 3);
        assert_eq!(write.min_duration_ms, 10.0);
        assert_eq!(write.max_duration_ms, 30.0);
        assert_eq!(write.average_duration_ms, write.total_duration_ms / 3.0);
        assert_eq!(write.last_duration_ms, 30.0);

        let summary = m.summary();
        assert_eq!(summary.total_operations, 3);
        assert_eq!(summary.total_duration_ms, 60.0);
    }

    #[test]
    fn slow_threshold_applies_at_record_time() {
        let m = monitor();
        m.set_slow_threshold("extract", Duration::from_millis(15));
        m.record_operation("extract", Duration::from_millis(10)); // not slow
        m.record_operation("extract", Duration::from_millis(20)); // slow

        // Tightening the threshold is not retroactive.
        m.set_slow_threshold("extract", Duration::from_millis(5));
        m.record_operation("extract", Duration::from_millis(10)); // slow now

        let stats = m.operation_statistics();
        assert_eq!(stats["extract"].slow_count, 2);
        assert_eq!(m.summary().slow_operations, 2);
    }

    #[test]
    fn explicit_spans_by_id() {
        let m = monitor();
        let id = m.start_operation("init");
        assert!(m.has_operation(id));
        assert!(m.end_operation(id));
        assert!(!m.end_operation(id));
        assert_eq!(m.operation_statistics()["init"].count, 1);
    }

    #[test]
    fn scoped_timer_records_once_across_move() {
        let m = monitor();
        let timer = m.start_timer("scan");
        let mut moved = timer;
        moved.stop();
        drop(moved);
        assert_eq!(m.operation_statistics()["scan"].count, 1);
    }

    #[test]
    fn scoped_timer_records_on_drop() {
        let m = monitor();
        {
            let _timer = m.start_timer("scan");
        }
        assert_eq!(m.operation_statistics()["scan"].count, 1);
    }
}
