use crate::events::{FetchErrorKind, SourceEvent, SourceView};
use log::{debug, info, warn};
use tokio::sync::mpsc::UnboundedSender;

/// Receives the outcome of every poll cycle
///
/// Callbacks are invoked after the engine has released its internal state,
/// so an observer may call back into the engine.
#[cfg_attr(test, mockall::automock)]
pub trait SourceObserver: Send + Sync {
    /// A source finished extracting a new value (or found no match)
    fn on_value_updated(&self, source: &SourceView);

    /// An alarm fired; it has already been disabled and persisted
    fn on_alarm_triggered(&self, source: &SourceView, message: &str);

    /// The fetch or parse failed for this cycle
    fn on_fetch_error(&self, source: &SourceView, kind: FetchErrorKind);
}

/// Observer that ignores everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullObserver;

impl SourceObserver for NullObserver {
    fn on_value_updated(&self, _source: &SourceView) {}

    fn on_alarm_triggered(&self, _source: &SourceView, _message: &str) {}

    fn on_fetch_error(&self, _source: &SourceView, _kind: FetchErrorKind) {}
}

/// Observer that forwards every callback as a `SourceEvent` on a channel
///
/// Events are dropped silently once the receiver has gone away.
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    sender: UnboundedSender<SourceEvent>,
}

impl ChannelObserver {
    pub fn new(sender: UnboundedSender<SourceEvent>) -> Self {
        Self { sender }
    }

    fn send(&self, event: SourceEvent) {
        if self.sender.send(event).is_err() {
            debug!("Event receiver closed, dropping event");
        }
    }
}

impl SourceObserver for ChannelObserver {
    fn on_value_updated(&self, source: &SourceView) {
        self.send(SourceEvent::ValueUpdated(source.clone()));
    }

    fn on_alarm_triggered(&self, source: &SourceView, message: &str) {
        self.send(SourceEvent::AlarmTriggered {
            source: source.clone(),
            message: message.to_string(),
        });
    }

    fn on_fetch_error(&self, source: &SourceView, kind: FetchErrorKind) {
        self.send(SourceEvent::FetchFailed {
            source: source.clone(),
            kind,
        });
    }
}

/// Observer that reports through the `log` facade, for headless runs
#[derive(Debug, Default, Clone, Copy)]
pub struct LogObserver;

impl SourceObserver for LogObserver {
    fn on_value_updated(&self, source: &SourceView) {
        let trend = match source.trend {
            Some(trend) => format!(" ({:?})", trend).to_lowercase(),
            None => String::new(),
        };
        info!(
            "[{}] {} = {}{}",
            source.time.as_deref().unwrap_or("--:--:--"),
            source.name,
            source.display.as_deref().unwrap_or("-"),
            trend
        );
    }

    fn on_alarm_triggered(&self, _source: &SourceView, message: &str) {
        warn!("Alarm triggered: {}", message);
    }

    fn on_fetch_error(&self, source: &SourceView, kind: FetchErrorKind) {
        warn!("{} ({}): {}", source.name, source.url, kind.sentinel());
    }
}
