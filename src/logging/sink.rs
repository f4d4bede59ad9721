//! Log sinks consumed by the engine. The engine only requires the publish
//! capability; fan-out, persistence, and presentation belong to whoever
//! installed the sink.

use std::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::models::{LogEvent, LogLevel};

/// Structured event consumer. Delivery is fire-and-forget; implementations
/// must not block the caller.
pub trait LogSink: Send + Sync {
    fn publish(&self, event: LogEvent);
}

/// Discards every event. For embedders that want the engine silent.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl LogSink for NullSink {
    fn publish(&self, _event: LogEvent) {}
}

/// Forwards events to the active tracing subscriber.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn publish(&self, event: LogEvent) {
        match event.level {
            LogLevel::Debug => debug!(direction = %event.direction, "{}", event.summary),
            LogLevel::Info => info!(direction = %event.direction, "{}", event.summary),
            LogLevel::Warning => warn!(direction = %event.direction, "{}", event.summary),
            LogLevel::Error => error!(direction = %event.direction, "{}", event.summary),
        }
    }
}

/// Buffers events in memory so tests and embedders can inspect what the
/// engine published.
#[derive(Debug, Default)]
pub struct CollectingSink {
    events: Mutex<Vec<LogEvent>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<LogEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn summaries(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .map(|event| event.summary)
            .collect()
    }
}

impl LogSink for CollectingSink {
    fn publish(&self, event: LogEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Direction;

    #[test]
    fn collecting_sink_records_in_publish_order() {
        let sink = CollectingSink::new();
        sink.publish(LogEvent::request("GET /one"));
        sink.publish(LogEvent::error("boom"));

        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].direction, Direction::Request);
        assert_eq!(events[1].direction, Direction::Error);
        assert_eq!(sink.summaries(), vec!["GET /one", "boom"]);
    }
}
