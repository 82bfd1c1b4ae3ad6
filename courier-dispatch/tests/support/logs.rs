use core::fmt;
use std::sync::{Arc, Mutex};

use tracing::{Event, Level, Subscriber, field::Field, subscriber::DefaultGuard};
use tracing_subscriber::{
    Layer,
    layer::{Context, SubscriberExt},
};

/// One recorded event.
#[derive(Debug, Clone)]
pub struct Captured {
    pub level: Level,
    pub message: String,
    pub fields: Vec<(String, String)>,
}

impl Captured {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn is_critical(&self) -> bool {
        self.field("severity") == Some("critical")
    }
}

#[derive(Default)]
struct Visitor {
    message: String,
    fields: Vec<(String, String)>,
}

impl tracing::field::Visit for Visitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields.push((field.name().to_string(), value.to_string()));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            self.fields
                .push((field.name().to_string(), format!("{value:?}")));
        }
    }
}

#[derive(Clone, Default)]
struct Recorder {
    events: Arc<Mutex<Vec<Captured>>>,
}

impl<S: Subscriber> Layer<S> for Recorder {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = Visitor::default();
        event.record(&mut visitor);

        self.events.lock().unwrap().push(Captured {
            level: *event.metadata().level(),
            message: visitor.message,
            fields: visitor.fields,
        });
    }
}

/// Records every event emitted on the current thread while alive.
///
/// `#[tokio::test]` runs on a single thread, so this also sees events from
/// tasks spawned by the test.
pub struct LogCapture {
    recorder: Recorder,
    _guard: DefaultGuard,
}

impl LogCapture {
    pub fn install() -> Self {
        let recorder = Recorder::default();
        let subscriber = tracing_subscriber::registry().with(recorder.clone());
        let guard = tracing::subscriber::set_default(subscriber);

        Self {
            recorder,
            _guard: guard,
        }
    }

    pub fn events(&self) -> Vec<Captured> {
        self.recorder.events.lock().unwrap().clone()
    }

    pub fn at(&self, level: Level) -> Vec<Captured> {
        self.events()
            .into_iter()
            .filter(|event| event.level == level)
            .collect()
    }

    pub fn critical(&self) -> Vec<Captured> {
        self.events()
            .into_iter()
            .filter(Captured::is_critical)
            .collect()
    }

    pub fn position(&self, message: &str) -> Option<usize> {
        self.events()
            .iter()
            .position(|event| event.message.contains(message))
    }
}
