use axum::{extract::{Request, State}, http::HeaderValue, middleware::Next, response::Response};
use std::{error::Error, sync::{Arc, Mutex, PoisonError}, time::Instant};
use tracing::{instrument::WithSubscriber, Level};
use tracing_subscriber::{layer::SubscriberExt, Layer};
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Installs the process wide stdout subscriber and routes `log` records into it.
pub fn init(level: Level) -> Result<(), Box<dyn Error + Send + Sync>> {
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    tracing_log::LogTracer::init()?;
    Ok(())
}

/// Collects everything a handler logs and writes it out as one line per request.
pub async fn request_tracing(
    State(level): State<Level>,
    request: Request,
    next: Next,
) -> Response {
    // setup tracing subscriber
    let events = CustomLayer::new(level);
    let subscriber = tracing_subscriber::registry().with(events.clone());

    let request_id = Uuid::new_v4();
    let path = match request.uri().path_and_query() {
        Some(pq) => pq.to_string(),
        None => String::from("/")
    };
    let method = request.method().to_string();
    let started = Instant::now();

    // run handler
    let mut response = next.run(request).with_subscriber(subscriber).await;

    tracing::info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        traces = ?events.get(),
        "request finished"
    );

    if let Ok(value) = HeaderValue::from_str(&request_id.to_string()) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }

    response
}

#[derive(Clone)]
pub struct CustomLayer {
    events: Arc<Mutex<Vec<String>>>,
    level: Level,
}

impl CustomLayer {
    pub fn new(level: Level) -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
            level,
        }
    }

    pub fn get(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .to_vec()
    }
}

impl<S> Layer<S> for CustomLayer
where
    S: tracing::Subscriber,
{
    fn on_event(
        &self,
        event: &tracing::Event<'_>,
        _ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        if *event.metadata().level() > self.level {
            return;
        }

        let mut visitor = CustomVisitor::default();
        event.record(&mut visitor);

        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(format!("{} {}", event.metadata().level(), visitor.0.join(" ")));
    }
}

#[derive(Default)]
struct CustomVisitor(Vec<String>);

impl tracing::field::Visit for CustomVisitor {
    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        self.push(field, value);
    }

    fn record_error(
        &mut self,
        field: &tracing::field::Field,
        value: &(dyn std::error::Error + 'static),
    ) {
        self.push(field, value);
    }

    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        // the message field arrives as fmt::Arguments
        if field.name() == "message" {
            self.0.push(format!("{:?}", value));
        } else {
            self.0.push(format!("{}={:?}", field.name(), value));
        }
    }
}

impl CustomVisitor {
    fn push(&mut self, field: &tracing::field::Field, value: impl std::fmt::Display) {
        if field.name() == "message" {
            self.0.push(value.to_string());
        } else {
            self.0.push(format!("{}={}", field.name(), value));
        }
    }
}
