// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Log records shipped alongside events.

use crate::metric::now_millis;
use crate::value::{Fields, Value};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static SEQUENCE: AtomicU64 = AtomicU64::new(0);
static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_ID: u64 = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Level {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Level::Trace => "TRACE",
            Level::Debug => "DEBUG",
            Level::Info => "INFO",
            Level::Warn => "WARN",
            Level::Error => "ERROR",
        };
        f.write_str(name)
    }
}

impl From<&tracing::Level> for Level {
    fn from(level: &tracing::Level) -> Self {
        match *level {
            tracing::Level::TRACE => Level::Trace,
            tracing::Level::DEBUG => Level::Debug,
            tracing::Level::INFO => Level::Info,
            tracing::Level::WARN => Level::Warn,
            tracing::Level::ERROR => Level::Error,
        }
    }
}

/// A serializable summary of an error: its type, message and the chain of underlying causes.
///
/// Native error values can hold references and have unbounded size, so they are never queued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Throwable {
    #[serde(rename = "type")]
    pub type_name: String,
    pub message: String,
    pub stack_trace: Vec<String>,
}

impl Throwable {
    #[must_use]
    pub fn new(
        type_name: impl Into<String>,
        message: impl Into<String>,
        stack_trace: Vec<String>,
    ) -> Self {
        Throwable {
            type_name: type_name.into(),
            message: message.into(),
            stack_trace,
        }
    }

    /// Captures `error`, recording each of its `source()` causes as a frame.
    pub fn from_error<E: std::error::Error + ?Sized>(error: &E) -> Self {
        let mut stack_trace = Vec::new();
        let mut cause = error.source();
        while let Some(inner) = cause {
            stack_trace.push(inner.to_string());
            cause = inner.source();
        }

        Throwable {
            type_name: std::any::type_name::<E>().to_string(),
            message: error.to_string(),
            stack_trace,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRecord {
    pub level: Level,
    pub message: String,
    pub parameters: Vec<Value>,
    pub sequence_number: u64,
    /// Identity of the component that produced the record.
    pub source_class_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_method_name: Option<String>,
    #[serde(rename = "threadID")]
    pub thread_id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thrown: Option<Throwable>,
    /// Creation time, in epoch milliseconds.
    pub timestamp: i64,
}

impl LogRecord {
    /// Creates a record stamped with the next sequence number, the calling thread's id and the
    /// current time.
    #[must_use]
    pub fn new(
        level: Level,
        message: impl Into<String>,
        source_class_name: impl Into<String>,
    ) -> Self {
        LogRecord {
            level,
            message: message.into(),
            parameters: Vec::new(),
            sequence_number: SEQUENCE.fetch_add(1, Ordering::Relaxed),
            source_class_name: source_class_name.into(),
            source_method_name: None,
            thread_id: THREAD_ID.with(|id| *id),
            thrown: None,
            timestamp: now_millis(),
        }
    }

    #[must_use]
    pub fn with_parameters(mut self, parameters: Vec<Value>) -> Self {
        self.parameters = parameters;
        self
    }

    #[must_use]
    pub fn with_source_method(mut self, method: impl Into<String>) -> Self {
        self.source_method_name = Some(method.into());
        self
    }

    #[must_use]
    pub fn with_thrown(mut self, thrown: Throwable) -> Self {
        self.thrown = Some(thrown);
        self
    }
}

/// An entry of the log queue: either a locally produced record or a log object received through
/// the proxy.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum LogEntry {
    Record(LogRecord),
    Proxied(Fields),
}

impl LogEntry {
    /// The producing component, when known.
    #[must_use]
    pub fn source(&self) -> Option<&str> {
        match self {
            LogEntry::Record(record) => Some(&record.source_class_name),
            LogEntry::Proxied(_) => None,
        }
    }
}

impl From<LogRecord> for LogEntry {
    fn from(record: LogRecord) -> Self {
        LogEntry::Record(record)
    }
}

impl From<Fields> for LogEntry {
    fn from(fields: Fields) -> Self {
        LogEntry::Proxied(fields)
    }
}
