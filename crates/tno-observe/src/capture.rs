//! In-memory event and span capture for asserting on emitted logs.
//!
//! ```ignore
//! let (captured, _guard) = tno_observe::capture::install();
//! tracing::warn!(remaining = 1, "still busy");
//! assert_eq!(captured.count(tracing::Level::WARN), 1);
//! ```
//!
//! [`install`] sets a thread-scoped default subscriber, so it only observes events emitted on
//! the installing thread (including tasks of a current-thread tokio runtime).
use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use tracing::{
    Event, Level, Subscriber,
    field::{Field, Visit},
    span::{Attributes, Id, Record},
    subscriber::DefaultGuard,
};
use tracing_subscriber::{
    Layer,
    layer::{Context, SubscriberExt},
    registry::Registry,
};

/// One recorded event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedEvent {
    pub level: Level,
    pub target: String,
    pub message: String,
    pub fields: Vec<(String, String)>,
}

impl CapturedEvent {
    /// Value of field `name`, rendered the way `Debug` (or `Display` for `%` fields) renders it.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// One recorded span, with fields recorded at creation and later via `Span::record`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedSpan {
    pub id: u64,
    pub name: String,
    pub fields: Vec<(String, String)>,
}

impl CapturedSpan {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .rev()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Shared handle to the recorded events and spans.
#[derive(Debug, Clone, Default)]
pub struct Captured {
    events: Arc<Mutex<Vec<CapturedEvent>>>,
    spans: Arc<Mutex<Vec<CapturedSpan>>>,
}

impl Captured {
    fn lock(&self) -> MutexGuard<'_, Vec<CapturedEvent>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_spans(&self) -> MutexGuard<'_, Vec<CapturedSpan>> {
        self.spans.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn events(&self) -> Vec<CapturedEvent> {
        self.lock().clone()
    }

    pub fn count(&self, level: Level) -> usize {
        self.lock().iter().filter(|e| e.level == level).count()
    }

    /// Events whose message equals `message`.
    pub fn with_message(&self, message: &str) -> Vec<CapturedEvent> {
        self.lock()
            .iter()
            .filter(|e| e.message == message)
            .cloned()
            .collect()
    }

    pub fn spans(&self) -> Vec<CapturedSpan> {
        self.lock_spans().clone()
    }

    /// Most recently created span called `name`.
    pub fn span(&self, name: &str) -> Option<CapturedSpan> {
        self.lock_spans().iter().rev().find(|s| s.name == name).cloned()
    }

    pub fn clear(&self) {
        self.lock().clear();
        self.lock_spans().clear();
    }

    /// Layer feeding this handle, for composing with other layers.
    pub fn layer(&self) -> CaptureLayer {
        CaptureLayer { sink: self.clone() }
    }
}

/// `tracing_subscriber` layer that records every event and span it sees.
pub struct CaptureLayer {
    sink: Captured,
}

impl<S: Subscriber> Layer<S> for CaptureLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        let meta = event.metadata();
        self.sink.lock().push(CapturedEvent {
            level: *meta.level(),
            target: meta.target().to_string(),
            message: visitor.message,
            fields: visitor.fields,
        });
    }

    fn on_new_span(&self, attrs: &Attributes<'_>, id: &Id, _ctx: Context<'_, S>) {
        let mut visitor = FieldVisitor::default();
        attrs.record(&mut visitor);

        self.sink.lock_spans().push(CapturedSpan {
            id: id.into_u64(),
            name: attrs.metadata().name().to_string(),
            fields: visitor.fields,
        });
    }

    fn on_record(&self, id: &Id, values: &Record<'_>, _ctx: Context<'_, S>) {
        let mut visitor = FieldVisitor::default();
        values.record(&mut visitor);

        // Registry ids are reused after close; the latest span with this id is the live one.
        let mut spans = self.sink.lock_spans();
        if let Some(span) = spans.iter_mut().rev().find(|s| s.id == id.into_u64()) {
            span.fields.extend(visitor.fields);
        }
    }
}

#[derive(Default)]
struct FieldVisitor {
    message: String,
    fields: Vec<(String, String)>,
}

impl FieldVisitor {
    fn push(&mut self, field: &Field, value: String) {
        if field.name() == "message" {
            self.message = value;
        } else {
            self.fields.push((field.name().to_string(), value));
        }
    }
}

impl Visit for FieldVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.push(field, value.to_string());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.push(field, format!("{value:?}"));
    }
}

/// Capture every event emitted on this thread until the guard drops.
pub fn install() -> (Captured, DefaultGuard) {
    let captured = Captured::default();
    let subscriber = Registry::default().with(captured.layer());
    let guard = tracing::subscriber::set_default(subscriber);
    (captured, guard)
}
