use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use lru_disk_cache::STATE_FILE_NAME;
use tracing::{field::Visit, Event, Level};
use tracing_subscriber::{layer::Context, prelude::*, Layer};

use super::{open_quiet, put};

#[derive(Debug, Clone)]
struct CapturedEvent {
    level: Level,
    fields: HashMap<String, String>,
}

#[derive(Clone)]
struct CapturingLayer {
    events: Arc<Mutex<Vec<CapturedEvent>>>,
}

impl<S> Layer<S> for CapturingLayer
where
    S: tracing::Subscriber,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        self.events
            .lock()
            .expect("events mutex poisoned")
            .push(CapturedEvent {
                level: *event.metadata().level(),
                fields: visitor.fields,
            });
    }
}

#[derive(Default)]
struct FieldVisitor {
    fields: HashMap<String, String>,
}

impl Visit for FieldVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        self.fields
            .insert(field.name().to_string(), format!("{value:?}"));
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        self.fields
            .insert(field.name().to_string(), value.to_string());
    }

    fn record_bool(&mut self, field: &tracing::field::Field, value: bool) {
        self.fields
            .insert(field.name().to_string(), value.to_string());
    }
}

fn capture<T>(f: impl FnOnce() -> T) -> (T, Vec<CapturedEvent>) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let subscriber = tracing_subscriber::registry().with(CapturingLayer {
        events: events.clone(),
    });
    let result = tracing::subscriber::with_default(subscriber, f);
    let events = events.lock().expect("events mutex poisoned").clone();
    (result, events)
}

#[test]
fn unreadable_state_is_reported_as_a_warning() {
    let tmp = tempfile::tempdir().unwrap();
    {
        let cache = open_quiet(tmp.path(), 16);
        put(&cache, "a", b"alpha");
    }
    std::fs::write(tmp.path().join(STATE_FILE_NAME), b"not a cache state").unwrap();

    let (cache, events) = capture(|| open_quiet(tmp.path(), 16));
    assert_eq!(cache.num_entries(), 0);

    let warning = events
        .iter()
        .find(|event| event.level == Level::WARN)
        .expect("expected a warning for the unreadable state");
    assert_eq!(
        warning.fields.get("target").map(String::as_str),
        Some("lru_disk_cache")
    );
    assert_eq!(
        warning.fields.get("bad_format").map(String::as_str),
        Some("true")
    );
    assert!(warning.fields["message"].contains("discarding unreadable cache state"));
}

#[test]
fn clean_open_does_not_warn() {
    let tmp = tempfile::tempdir().unwrap();
    let (cache, events) = capture(|| {
        let cache = open_quiet(tmp.path(), 16);
        put(&cache, "a", b"alpha");
        cache
    });
    drop(cache);

    assert!(
        events.iter().all(|event| event.level > Level::WARN),
        "unexpected warnings: {events:?}"
    );
}
