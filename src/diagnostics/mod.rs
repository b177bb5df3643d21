/*!
 * Diagnostic services
 *
 * Leveled error log with scoped contexts, named operation timers, and
 * tag-based allocation tracking. All three are plain service objects
 * bundled into [`Diagnostics`] and injected into the hook, extractor,
 * and transport; there is no hidden global state.
 */

pub mod error_handler;
pub mod memory;
pub mod perf;
pub mod pool;

pub use error_handler::{ErrorCategory, ErrorEntry, ErrorHandler, ErrorSeverity, ScopedContext};
pub use memory::{AllocationRecord, MemoryCategory, MemoryStatistics, MemoryTracker};
pub use perf::{OperationStatistics, PerformanceMonitor, PerformanceSummary, ScopedTimer};
pub use pool::{MemoryPool, PoolStats};

use crate::config::{ErrorLogConfig, MonitorConfig};

/// Bundle of the always-on diagnostic services, shared as `Arc<Diagnostics>`
/// by every engine component.
pub struct Diagnostics {
    pub errors: ErrorHandler,
    pub perf: PerformanceMonitor,
    pub memory: MemoryTracker,
}

impl Diagnostics {
    pub fn new(error_log: ErrorLogConfig, monitor: MonitorConfig) -> Self {
        Self {
            errors: ErrorHandler::new(error_log),
            perf: PerformanceMonitor::new(monitor),
            memory: MemoryTracker::new(),
        }
    }
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self::new(ErrorLogConfig::default(), MonitorConfig::default())
    }
}
