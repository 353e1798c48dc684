// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Metric declarations.
//!
//! A metric is any serializable type implementing [`Metric`]. The trait's associated constants
//! declare how the metric is stored: under which name, and whether repeated posts replace the
//! previous value or accumulate into a list.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

pub trait Metric: Serialize {
    /// Declared name of the metric. When `None`, the lower-cased type identifier is used.
    const NAME: Option<&'static str> = None;

    /// Whether a later post in the same scope replaces the earlier one.
    const UNIQUE: bool = true;
}

/// Resolves the name of a metric: explicit name, then declared name, then the lower-cased
/// type identifier.
#[must_use]
pub fn metric_name<T: ?Sized>(explicit: Option<&str>, declared: Option<&str>) -> String {
    if let Some(name) = explicit.filter(|name| !name.is_empty()) {
        return name.to_string();
    }
    if let Some(name) = declared.filter(|name| !name.is_empty()) {
        return name.to_string();
    }
    std::any::type_name::<T>().to_lowercase()
}

/// Milliseconds since the unix epoch.
#[must_use]
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| {
            i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX)
        })
}

/// A simple wall-clock timer. It starts when created and stops when [`Timer::stop`] is called.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timer {
    /// Creation time, in epoch milliseconds.
    pub timestamp: i64,
    pub duration: i64,
    /// The category of event being timed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl Metric for Timer {
    const NAME: Option<&'static str> = Some("timer");
    const UNIQUE: bool = false;
}

impl Default for Timer {
    fn default() -> Self {
        Self::start()
    }
}

impl Timer {
    #[must_use]
    pub fn start() -> Self {
        Timer {
            timestamp: now_millis(),
            duration: 0,
            category: None,
            url: None,
        }
    }

    #[must_use]
    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    #[must_use]
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn stop(&mut self) {
        self.duration = (now_millis() - self.timestamp).max(0);
    }
}
