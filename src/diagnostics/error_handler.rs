/*!
 * Leveled in-memory error log with scoped contexts
 *
 * Every retained entry carries severity, category, component, an optional
 * OS error code, and a snapshot of the active context stack. Entries are
 * also re-emitted as `tracing` events so a single subscriber sees both
 * the engine log and ambient logging.
 */

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::ErrorLogConfig;

/// Severity of a log entry. Ordering follows numeric level, so
/// `severity >= ErrorSeverity::Warning` selects warnings and worse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum ErrorSeverity {
    Debug = 0,
    Info = 1,
    Warning = 2,
    Error = 3,
    Critical = 4,
    Fatal = 5,
}

impl ErrorSeverity {
    pub const COUNT: usize = 6;

    fn index(self) -> usize {
        self as usize
    }
}

/// Category of the condition being reported. Security through Sync are
/// reserved and unused by the engine itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorCategory {
    System,
    Graphics,
    Memory,
    Hook,
    Security,
    Network,
    File,
    Threading,
    Sync,
}

/// One frame of the scoped-context stack, snapshotted into entries.
#[derive(Debug, Clone, Serialize)]
pub struct ContextFrame {
    pub name: String,
    pub metadata: BTreeMap<String, String>,
}

/// A retained log entry.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorEntry {
    pub severity: ErrorSeverity,
    pub category: ErrorCategory,
    pub component: String,
    pub message: String,
    pub details: BTreeMap<String, String>,
    pub location: String,
    pub os_error: Option<i32>,
    pub timestamp: DateTime<Utc>,
    pub context: Vec<ContextFrame>,
}

/// Per-severity counts of retained entries.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SeverityCounts {
    pub debug: u64,
    pub info: u64,
    pub warning: u64,
    pub error: u64,
    pub critical: u64,
    pub fatal: u64,
}

struct Inner {
    entries: VecDeque<ErrorEntry>,
    context_stack: Vec<ContextFrame>,
    counts: [u64; ErrorSeverity::COUNT],
    min_level: ErrorSeverity,
}

/// Process-wide error log service. One internal lock; critical sections
/// are append-and-return.
pub struct ErrorHandler {
    inner: Mutex<Inner>,
    max_entries: usize,
}

impl ErrorHandler {
    pub fn new(config: ErrorLogConfig) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: VecDeque::new(),
                context_stack: Vec::new(),
                counts: [0; ErrorSeverity::COUNT],
                min_level: ErrorSeverity::Debug,
            }),
            max_entries: config.max_entries,
        }
    }

    /// Messages below this level are dropped at report time, not retained.
    pub fn set_minimum_level(&self, level: ErrorSeverity) {
        self.inner.lock().unwrap().min_level = level;
    }

    pub fn minimum_level(&self) -> ErrorSeverity {
        self.inner.lock().unwrap().min_level
    }

    /// Report an entry at the given severity. Filtered messages are dropped.
    #[track_caller]
    pub fn report(
        &self,
        severity: ErrorSeverity,
        category: ErrorCategory,
        component: &str,
        message: impl Into<String>,
        os_error: Option<i32>,
        details: BTreeMap<String, String>,
    ) {
        let message = message.into();
        let location = std::panic::Location::caller().to_string();

        {
            let mut inner = self.inner.lock().unwrap();
            if severity < inner.min_level {
                return;
            }
            let entry = ErrorEntry {
                severity,
                category,
                component: component.to_string(),
                message: message.clone(),
                details,
                location,
                os_error,
                timestamp: Utc::now(),
                context: inner.context_stack.clone(),
            };
            inner.counts[severity.index()] += 1;
            if inner.entries.len() >= self.max_entries {
                inner.entries.pop_front();
            }
            inner.entries.push_back(entry);
        }

        match severity {
            ErrorSeverity::Debug => debug!(component, ?category, "{message}"),
            ErrorSeverity::Info => info!(component, ?category, "{message}"),
            ErrorSeverity::Warning => warn!(component, ?category, os_error, "{message}"),
            _ => error!(component, ?category, os_error, "{message}"),
        }
    }

    #[track_caller]
    pub fn debug(&self, category: ErrorCategory, component: &str, message: impl Into<String>) {
        self.report(ErrorSeverity::Debug, category, component, message, None, BTreeMap::new());
    }

    #[track_caller]
    pub fn info(&self, category: ErrorCategory, component: &str, message: impl Into<String>) {
        self.report(ErrorSeverity::Info, category, component, message, None, BTreeMap::new());
    }

    #[track_caller]
    pub fn warning(&self, category: ErrorCategory, component: &str, message: impl Into<String>) {
        self.report(ErrorSeverity::Warning, category, component, message, None, BTreeMap::new());
    }

    #[track_caller]
    pub fn warning_os(
        &self,
        category: ErrorCategory,
        component: &str,
        message: impl Into<String>,
        os_error: i32,
    ) {
        self.report(
            ErrorSeverity::Warning,
            category,
            component,
            message,
            Some(os_error),
            BTreeMap::new(),
        );
    }

    #[track_caller]
    pub fn error(&self, category: ErrorCategory, component: &str, message: impl Into<String>) {
        self.report(ErrorSeverity::Error, category, component, message, None, BTreeMap::new());
    }

    #[track_caller]
    pub fn error_os(
        &self,
        category: ErrorCategory,
        component: &str,
        message: impl Into<String>,
        os_error: i32,
    ) {
        self.report(
            ErrorSeverity::Error,
            category,
            component,
            message,
            Some(os_error),
            BTreeMap::new(),
        );
    }

    #[track_caller]
    pub fn critical(&self, category: ErrorCategory, component: &str, message: impl Into<String>) {
        self.report(ErrorSeverity::Critical, category, component, message, None, BTreeMap::new());
    }

    #[track_caller]
    pub fn fatal(&self, category: ErrorCategory, component: &str, message: impl Into<String>) {
        self.report(ErrorSeverity::Fatal, category, component, message, None, BTreeMap::new());
    }

    /// Push a named context frame; it is attached to every entry reported
    /// until the returned guard drops. Frames pop in LIFO order.
    pub fn push_context(
        &self,
        name: impl Into<String>,
        metadata: BTreeMap<String, String>,
    ) -> ScopedContext<'_> {
        let name = name.into();
        self.inner.lock().unwrap().context_stack.push(ContextFrame {
            name,
            metadata,
        });
        ScopedContext { handler: self }
    }

    fn pop_context(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.context_stack.pop().is_none() {
            warn!("context stack popped while empty");
        }
    }

    /// Depth of the active context stack.
    pub fn context_depth(&self) -> usize {
        self.inner.lock().unwrap().context_stack.len()
    }

    /// Snapshot of all retained entries.
    pub fn logs(&self) -> Vec<ErrorEntry> {
        self.inner.lock().unwrap().entries.iter().cloned().collect()
    }

    /// Snapshot of entries at warning severity or worse.
    pub fn errors(&self) -> Vec<ErrorEntry> {
        self.inner
            .lock()
            .unwrap()
            .entries
            .iter()
            .filter(|e| e.severity >= ErrorSeverity::Warning)
            .cloned()
            .collect()
    }

    pub fn severity_counts(&self) -> SeverityCounts {
        let counts = self.inner.lock().unwrap().counts;
        SeverityCounts {
            debug: counts[0],
            info: counts[1],
            warning: counts[2],
            error: counts[3],
            critical: counts[4],
            fatal: counts[5],
        }
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.entries.clear();
        inner.counts = [0; ErrorSeverity::COUNT];
    }
}

/// Guard for one context frame. Pops exactly once when dropped, including
/// when the guard was moved out of the scope that created it.
pub struct ScopedContext<'a> {
    handler: &'a ErrorHandler,
}

impl Drop for ScopedContext<'_> {
    fn drop(&mut self) {
        self.handler.pop_context();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handler() -> ErrorHandler {
        ErrorHandler::new(ErrorLogConfig::default())
    }

    #[test]
    fn entries_are_retained_with_counts() {
        let h = handler();
        h.info(ErrorCategory::System, "test", "starting");
        h.warning(ErrorCategory::Graphics, "test", "no surface yet");
        h.error_os(ErrorCategory::System, "test", "mapping failed", 12);

        assert_eq!(h.logs().len(), 3);
        assert_eq!(h.errors().len(), 2);

        let counts = h.severity_counts();
        assert_eq!(counts.info, 1);
        assert_eq!(counts.warning, 1);
        assert_eq!(counts.error, 1);

        let logs = h.logs();
        assert_eq!(logs[2].os_error, Some(12));
    }

    #[test]
    fn minimum_level_filters_at_report_time() {
        let h = handler();
        h.set_minimum_level(ErrorSeverity::Warning);
        h.debug(ErrorCategory::System, "test", "dropped");
        h.info(ErrorCategory::System, "test", "dropped");
        h.warning(ErrorCategory::System, "test", "kept");
        assert_eq!(h.logs().len(), 1);

        // Lowering the level later does not resurrect dropped messages.
        h.set_minimum_level(ErrorSeverity::Debug);
        assert_eq!(h.logs().len(), 1);
    }

    #[test]
    fn retention_is_bounded_dropping_oldest() {
        let h = ErrorHandler::new(ErrorLogConfig { max_entries: 3 });
        for i in 0..5 {
            h.info(ErrorCategory::System, "test", format!("msg {i}"));
        }
        let logs = h.logs();
        assert_eq!(logs.len(), 3);
        assert_eq!(logs[0].message, "msg 2");
        assert_eq!(logs[2].message, "msg 4");
    }

    #[test]
    fn zero_capacity_does_not_grow_unbounded() {
        let h = ErrorHandler::new(ErrorLogConfig { max_entries: 0 });
        for i in 0..100 {
            h.info(ErrorCategory::System, "test", format!("msg {i}"));
        }
        assert!(h.logs().len() <= 1);
        assert_eq!(h.severity_counts().info, 100);
    }

    #[test]
    fn context_snapshot_attached_to_entries() {
        let h = handler();
        let mut meta = BTreeMap::new();
        meta.insert("surface".to_string(), "0x1234".to_string());
        {
            let _outer = h.push_context("extract", meta);
            {
                let _inner = h.push_context("map", BTreeMap::new());
                h.error(ErrorCategory::Graphics, "extractor", "map failed");
            }
            h.warning(ErrorCategory::Graphics, "extractor", "skipped frame");
        }
        let logs = h.logs();
        assert_eq!(logs[0].context.len(), 2);
        assert_eq!(logs[0].context[0].name, "extract");
        assert_eq!(logs[0].context[1].name, "map");
        assert_eq!(logs[1].context.len(), 1);
        assert_eq!(h.context_depth(), 0);
    }

    #[test]
    fn context_released_via_move_pops_once() {
        let h = handler();
        let outer = h.push_context("outer", BTreeMap::new());
        let moved = {
            let inner = h.push_context("inner", BTreeMap::new());
            inner // moved out of this scope without popping
        };
        assert_eq!(h.context_depth(), 2);
        drop(moved);
        assert_eq!(h.context_depth(), 1);
        drop(outer);
        assert_eq!(h.context_depth(), 0);
    }
}
