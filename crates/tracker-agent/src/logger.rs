// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Forwarding of application `tracing` events as log records.
//!
//! [`TrackerLayer`] turns every event it sees into a [`LogRecord`] and posts it to a
//! [`Dispatcher`]:
//!
//! ```text
//! tracing::warn!(user = "007", "login failed");
//! // {"level":"WARN","message":"login failed","parameters":[{"user":"007"}],
//! //  "sourceClassName":"app::auth","sourceMethodName":"src/auth.rs:42",...}
//! ```
//!
//! The event target becomes the record source, so the dispatcher recognizes and drops the
//! events it emits itself. Events from the HTTP stack used to transmit batches are ignored.
//!
//! # Usage
//!
//! ```rust,ignore
//! use tracing_subscriber::layer::SubscriberExt;
//!
//! let subscriber = tracing_subscriber::registry()
//!     .with(EnvFilter::try_new("h2=off,hyper=off,rustls=off,info")?)
//!     .with(TrackerLayer::new(dispatcher.clone()));
//! tracing::subscriber::set_global_default(subscriber)?;
//! ```

use std::fmt;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

use crate::dispatcher::Dispatcher;
use crate::log::{Level, LogRecord, Throwable};
use crate::value::{Fields, Value};

const MESSAGE_FIELD: &str = "message";

/// Crates that log while a batch is being transmitted.
const TRANSPORT_TARGETS: &[&str] = &["h2", "hyper", "hyper_util", "reqwest", "rustls"];

fn is_transport(target: &str) -> bool {
    TRANSPORT_TARGETS.iter().any(|krate| {
        target
            .strip_prefix(krate)
            .is_some_and(|rest| rest.is_empty() || rest.starts_with("::"))
    })
}

#[derive(Clone)]
pub struct TrackerLayer {
    dispatcher: Dispatcher,
}

impl TrackerLayer {
    #[must_use]
    pub fn new(dispatcher: Dispatcher) -> Self {
        TrackerLayer { dispatcher }
    }
}

impl<S> Layer<S> for TrackerLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        if is_transport(metadata.target()) {
            return;
        }

        let mut visitor = RecordVisitor::default();
        event.record(&mut visitor);

        let mut record = LogRecord::new(
            Level::from(metadata.level()),
            visitor.message,
            metadata.target(),
        )
        .with_parameters(visitor.parameters);

        if let (Some(file), Some(line)) = (metadata.file(), metadata.line()) {
            record = record.with_source_method(format!("{file}:{line}"));
        }
        if let Some(thrown) = visitor.thrown {
            record = record.with_thrown(thrown);
        }

        self.dispatcher.post_log(record);
    }
}

/// Collects the message, the structured fields and the first error of one event.
#[derive(Default)]
struct RecordVisitor {
    message: String,
    parameters: Vec<Value>,
    thrown: Option<Throwable>,
}

impl RecordVisitor {
    fn parameter(&mut self, field: &Field, value: Value) {
        let mut parameter = Fields::new();
        parameter.insert(field.name().to_string(), value);
        self.parameters.push(Value::Map(parameter));
    }
}

impl Visit for RecordVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == MESSAGE_FIELD {
            self.message = format!("{value:?}");
        } else {
            self.parameter(field, Value::String(format!("{value:?}")));
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == MESSAGE_FIELD {
            self.message = value.to_string();
        } else {
            self.parameter(field, Value::from(value));
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.parameter(field, Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.parameter(field, Value::from(value));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.parameter(field, Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.parameter(field, Value::from(value));
    }

    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        if self.thrown.is_none() {
            self.thrown = Some(Throwable::from_error(value));
        }
        self.parameter(field, Value::String(value.to_string()));
    }
}
