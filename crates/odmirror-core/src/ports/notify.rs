//! Notification sink port.
//!
//! User-facing notifications (file actions, data-loss warnings, safety
//! refusals) flow through [`Notifier`] with a severity tag. The default
//! sink logs via `tracing`; tests collect into a vector.

use std::sync::Mutex;

/// Severity of a user-facing notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

pub trait Notifier: Send + Sync {
    fn notify(&self, severity: Severity, message: &str);
}

/// Sink that forwards notifications to the log.
#[derive(Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, severity: Severity, message: &str) {
        // tracing macros need a static level; fan out here.
        match severity {
            Severity::Info => tracing::info!(target: "notify", "{message}"),
            Severity::Warning => tracing::warn!(target: "notify", "{message}"),
            Severity::Error => tracing::error!(target: "notify", "{message}"),
        }
    }
}

/// Test sink that records every notification.
#[derive(Debug, Default)]
pub struct CollectingNotifier {
    messages: Mutex<Vec<(Severity, String)>>,
}

impl CollectingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<(Severity, String)> {
        self.messages.lock().expect("notifier poisoned").clone()
    }

    pub fn contains(&self, fragment: &str) -> bool {
        self.messages()
            .iter()
            .any(|(_, m)| m.contains(fragment))
    }
}

impl Notifier for CollectingNotifier {
    fn notify(&self, severity: Severity, message: &str) {
        self.messages
            .lock()
            .expect("notifier poisoned")
            .push((severity, message.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collecting_notifier_records_in_order() {
        let sink = CollectingNotifier::new();
        sink.notify(Severity::Info, "downloaded /A/b.txt");
        sink.notify(Severity::Warning, "hash mismatch on photo.heic");

        let messages = sink.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].0, Severity::Info);
        assert!(sink.contains("photo.heic"));
        assert!(!sink.contains("absent"));
    }
}
