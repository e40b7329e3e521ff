//! The alert monitor.
//!
//! Background tasks and I/O paths report failures here instead of panicking
//! or spamming the log: each category keeps its latest event and an
//! escalation level, and re-logs at most once per interval. `NORMAL` clears
//! a category; repeated errors escalate `WARN` to `ERROR`.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use log::{error, info, warn};
use parking_lot::Mutex;

/// Minimum delay between log lines for one category.
const RELOG_INTERVAL: Duration = Duration::from_secs(10);

/// Errors in one category before WARN escalates to ERROR.
const ESCALATION_THRESHOLD: u64 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum AlertLevel {
    #[default]
    Normal,
    Warn,
    Error,
}

#[derive(Debug, Clone)]
struct CategoryState {
    level: AlertLevel,
    count: u64,
    last_message: String,
    last_logged: Option<Instant>,
}

/// One alert category's externally visible state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlertSnapshot {
    pub category: String,
    pub level: AlertLevel,
    pub count: u64,
    pub last_message: String,
}

#[derive(Default)]
pub struct AlertMonitor {
    categories: Mutex<HashMap<String, CategoryState>>,
}

impl AlertMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report an event. `Normal` clears the category; `Warn`/`Error` count
    /// and escalate, re-logging at a bounded rate.
    pub fn report(&self, level: AlertLevel, category: &str, message: &str) {
        let mut categories = self.categories.lock();

        if level == AlertLevel::Normal {
            if categories.remove(category).is_some() {
                info!("[{}] recovered: {}", category, message);
            }
            return;
        }

        let state = categories.entry(category.to_string()).or_insert(CategoryState {
            level,
            count: 0,
            last_message: String::new(),
            last_logged: None,
        });
        state.count += 1;
        state.last_message = message.to_string();
        state.level = if state.count >= ESCALATION_THRESHOLD {
            AlertLevel::Error
        } else {
            state.level.max(level)
        };

        let due = state
            .last_logged
            .map_or(true, |t| t.elapsed() >= RELOG_INTERVAL);
        if due {
            state.last_logged = Some(Instant::now());
            match state.level {
                AlertLevel::Error => {
                    error!("[{}] ({} events) {}", category, state.count, message)
                }
                _ => warn!("[{}] ({} events) {}", category, state.count, message),
            }
        }
    }

    /// Current level of a category.
    pub fn level(&self, category: &str) -> AlertLevel {
        self.categories
            .lock()
            .get(category)
            .map(|s| s.level)
            .unwrap_or(AlertLevel::Normal)
    }

    /// Snapshot every non-normal category.
    pub fn snapshot(&self) -> Vec<AlertSnapshot> {
        self.categories
            .lock()
            .iter()
            .map(|(category, state)| AlertSnapshot {
                category: category.clone(),
                level: state.level,
                count: state.count,
                last_message: state.last_message.clone(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normal_clears() {
        let monitor = AlertMonitor::new();
        monitor.report(AlertLevel::Warn, "flusher", "disk hiccup");
        assert_eq!(monitor.level("flusher"), AlertLevel::Warn);

        monitor.report(AlertLevel::Normal, "flusher", "recovered");
        assert_eq!(monitor.level("flusher"), AlertLevel::Normal);
        assert!(monitor.snapshot().is_empty());
    }

    #[test]
    fn test_escalation() {
        let monitor = AlertMonitor::new();
        for _ in 0..ESCALATION_THRESHOLD {
            monitor.report(AlertLevel::Warn, "copier", "write failed");
        }
        assert_eq!(monitor.level("copier"), AlertLevel::Error);

        let snapshot = monitor.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].count, ESCALATION_THRESHOLD);
    }

    #[test]
    fn test_unknown_category_is_normal() {
        let monitor = AlertMonitor::new();
        assert_eq!(monitor.level("nothing"), AlertLevel::Normal);
    }
}
