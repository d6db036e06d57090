//! Logging setup
//!
//! Events go to stdout (plain or JSON) and, while somebody is attached to
//! `/logstream`, are also rendered as text lines into a broadcast channel.

use std::fmt::{self, Write as _};

use tokio::sync::broadcast;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{fmt as fmt_layer, prelude::*, EnvFilter, Layer};

/// Lines buffered per subscriber before it starts lagging
const STREAM_CAPACITY: usize = 1024;

/// Fan-out of rendered log lines
#[derive(Clone)]
pub struct LogBroadcast {
    sender: broadcast::Sender<String>,
}

impl LogBroadcast {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(STREAM_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.sender.subscribe()
    }

    pub fn layer(&self) -> LogStreamLayer {
        LogStreamLayer {
            logs: self.clone(),
        }
    }
}

impl Default for LogBroadcast {
    fn default() -> Self {
        Self::new()
    }
}

/// Renders each event as `LEVEL message key=value...` into a [`LogBroadcast`]
pub struct LogStreamLayer {
    logs: LogBroadcast,
}

impl<S> Layer<S> for LogStreamLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        if self.logs.sender.receiver_count() == 0 {
            return;
        }

        let mut visitor = LineVisitor::default();
        event.record(&mut visitor);

        let mut line = format!("{} {}", event.metadata().level(), visitor.message);
        for (name, value) in &visitor.fields {
            let _ = write!(line, " {}={}", name, value);
        }
        line.push('\n');

        // a receiver may have gone away since the check
        let _ = self.logs.sender.send(line);
    }
}

#[derive(Default)]
struct LineVisitor {
    message: String,
    fields: Vec<(String, String)>,
}

impl Visit for LineVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        } else {
            self.fields
                .push((field.name().to_string(), format!("{:?}", value)));
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields
                .push((field.name().to_string(), value.to_string()));
        }
    }
}

/// Install the global subscriber: env filter (default `info`), stdout
/// formatting and the log stream layer
pub fn init_tracing(json: bool, logs: &LogBroadcast) {
    let env_filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();

    let stdout_layer = if json {
        fmt_layer::layer().json().with_target(true).boxed()
    } else {
        fmt_layer::layer().with_target(true).boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .with(logs.layer())
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing::{info, warn};

    #[test]
    fn test_events_rendered_to_subscribers() {
        let logs = LogBroadcast::new();
        let mut rx = logs.subscribe();
        let subscriber = tracing_subscriber::registry().with(logs.layer());

        tracing::subscriber::with_default(subscriber, || {
            info!("Lock acquired by {}", "n1");
            warn!(node = "n2", "Node not ready");
        });

        assert_eq!(rx.try_recv().unwrap(), "INFO Lock acquired by n1\n");
        assert_eq!(rx.try_recv().unwrap(), "WARN Node not ready node=n2\n");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_no_subscriber_is_fine() {
        let logs = LogBroadcast::new();
        let subscriber = tracing_subscriber::registry().with(logs.layer());

        tracing::subscriber::with_default(subscriber, || {
            info!("nobody listening");
        });

        // subscribing later does not replay old lines
        let mut rx = logs.subscribe();
        assert!(rx.try_recv().is_err());
    }
}
