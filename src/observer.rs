//! Observability sink handed to each component.

use std::sync::Arc;

/// Receives the outcome events of the worker.
///
/// Success is reported with `info`, a scheduled retry with `warn`, and a
/// permanently rejected or unreadable message with `error`.
pub trait Observer: Send + Sync {
    fn info(&self, message: &str);
    fn warn(&self, message: &str);
    fn error(&self, message: &str);
}

/// Forwards events to the `log` facade under a fixed target.
#[derive(Debug, Clone)]
pub struct LogObserver {
    target: String,
}

impl LogObserver {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
        }
    }

    pub fn shared(target: impl Into<String>) -> Arc<dyn Observer> {
        Arc::new(Self::new(target))
    }

    pub fn target(&self) -> &str {
        &self.target
    }
}

impl Observer for LogObserver {
    fn info(&self, message: &str) {
        log::info!(target: self.target.as_str(), "{}", message);
    }

    fn warn(&self, message: &str) {
        log::warn!(target: self.target.as_str(), "{}", message);
    }

    fn error(&self, message: &str) {
        log::error!(target: self.target.as_str(), "{}", message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_observer_keeps_target() {
        let observer = LogObserver::new("retry_worker::primary");
        assert_eq!(observer.target(), "retry_worker::primary");

        let shared = LogObserver::shared("retry_worker::retry");
        shared.info("message processed");
        shared.warn("message retried");
        shared.error("message rejected");
    }
}
