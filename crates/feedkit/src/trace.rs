//! Tracing layer that captures engine log events into a [`TraceBuffer`].
//!
//! The engine logs through `tracing` macros only. Hosts that render their
//! own log view install [`FeedTraceLayer`] and drain the buffer at their own
//! pace; the buffer has its own mutex and a hard cap, so a burst of events
//! between drains never grows without bound.

use std::fmt;
use std::sync::{Arc, Mutex};

use chrono::Local;
use serde::Serialize;
use tracing::Subscriber;
use tracing_subscriber::layer::Layer;
use tracing_subscriber::registry::LookupSpan;

/// Buffer size that triggers trimming.
pub const MAX_TRACE_LINES: usize = 2_000;
/// Lines kept after trimming.
pub const TRACE_TRIM_TO: usize = 1_500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<tracing::Level> for TraceLevel {
    fn from(level: tracing::Level) -> Self {
        match level {
            tracing::Level::TRACE => Self::Trace,
            tracing::Level::DEBUG => Self::Debug,
            tracing::Level::INFO => Self::Info,
            tracing::Level::WARN => Self::Warn,
            tracing::Level::ERROR => Self::Error,
        }
    }
}

/// One captured event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TraceLine {
    pub time: String,
    pub level: TraceLevel,
    pub target: String,
    pub message: String,
}

impl fmt::Display for TraceLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {:?} {}: {}", self.time, self.level, self.target, self.message)
    }
}

/// Shared buffer of captured lines.
#[derive(Clone)]
pub struct TraceBuffer(Arc<Mutex<Vec<TraceLine>>>);

impl TraceBuffer {
    fn new() -> Self {
        Self(Arc::new(Mutex::new(Vec::with_capacity(128))))
    }

    /// Take every pending line.
    pub fn drain(&self) -> Vec<TraceLine> {
        let mut buf = self.0.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut *buf)
    }

    pub fn len(&self) -> usize {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn push(&self, line: TraceLine) {
        let mut buf = self.0.lock().unwrap_or_else(|e| e.into_inner());
        buf.push(line);
        if buf.len() > MAX_TRACE_LINES {
            let trim_to = buf.len() - TRACE_TRIM_TO;
            buf.drain(..trim_to);
        }
    }
}

/// A [`tracing_subscriber::Layer`] that records events at or above a
/// minimum level into a [`TraceBuffer`].
pub struct FeedTraceLayer {
    buffer: TraceBuffer,
    min_level: TraceLevel,
}

impl FeedTraceLayer {
    /// Create a layer that records everything, plus its buffer.
    pub fn new() -> (Self, TraceBuffer) {
        Self::with_min_level(TraceLevel::Trace)
    }

    pub fn with_min_level(min_level: TraceLevel) -> (Self, TraceBuffer) {
        let buffer = TraceBuffer::new();
        (
            Self {
                buffer: buffer.clone(),
                min_level,
            },
            buffer,
        )
    }
}

impl<S: Subscriber + for<'a> LookupSpan<'a>> Layer<S> for FeedTraceLayer {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
        let level = TraceLevel::from(*event.metadata().level());
        if level < self.min_level {
            return;
        }

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        let mut message = visitor.message;
        if !visitor.fields.is_empty() {
            let extras: Vec<String> = visitor.fields.iter().map(|(k, v)| format!("{k}={v}")).collect();
            if message.is_empty() {
                message = extras.join(" ");
            } else {
                message = format!("{message} {{{}}}", extras.join(", "));
            }
        }

        self.buffer.push(TraceLine {
            time: Local::now().format("%H:%M:%S%.3f").to_string(),
            level,
            target: event.metadata().target().to_string(),
            message,
        });
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: Vec<(String, String)>,
}

impl tracing::field::Visit for MessageVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn fmt::Debug) {
        let raw = format!("{value:?}");
        if field.name() == "message" {
            self.message = match raw.strip_prefix('"').and_then(|s| s.strip_suffix('"')) {
                Some(inner) => inner.to_string(),
                None => raw,
            };
        } else {
            self.fields.push((field.name().to_string(), raw));
        }
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields.push((field.name().to_string(), value.to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::layer::SubscriberExt;

    #[test]
    fn captures_message_and_fields() {
        let (layer, buffer) = FeedTraceLayer::new();
        let subscriber = tracing_subscriber::registry().with(layer);
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(generation = 3, "pager generation starting");
            tracing::debug!(direction = "after", "boundary signal");
        });

        let lines = buffer.drain();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].level, TraceLevel::Info);
        assert_eq!(lines[0].message, "pager generation starting {generation=3}");
        assert_eq!(lines[1].message, "boundary signal {direction=after}");
        assert!(buffer.is_empty());
    }

    #[test]
    fn skips_events_below_min_level() {
        let (layer, buffer) = FeedTraceLayer::with_min_level(TraceLevel::Warn);
        let subscriber = tracing_subscriber::registry().with(layer);
        tracing::subscriber::with_default(subscriber, || {
            tracing::debug!("noise");
            tracing::warn!("refresh failed");
        });
        let lines = buffer.drain();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].level, TraceLevel::Warn);
    }

    #[test]
    fn buffer_is_capped() {
        let (layer, buffer) = FeedTraceLayer::new();
        let subscriber = tracing_subscriber::registry().with(layer);
        tracing::subscriber::with_default(subscriber, || {
            for i in 0..=MAX_TRACE_LINES {
                tracing::trace!(i, "tick");
            }
        });
        assert_eq!(buffer.len(), TRACE_TRIM_TO);
    }
}
