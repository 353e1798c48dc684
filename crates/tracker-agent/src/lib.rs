// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Client-side telemetry agent.
//!
//! Application code collects measurements for one unit of work in a
//! [`measurement::Measurements`] scope and submits them to a [`dispatcher::Dispatcher`], which
//! batches them with log records and ships each batch to one of a pool of collectors through
//! the [`failover::FailoverClient`]. Payloads received from other processes re-enter the same
//! queues through [`proxy::proxy_event`].

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod config;
pub mod dispatcher;
pub mod errors;
pub mod failover;
pub mod hostname;
pub mod log;
pub mod logger;
pub mod measurement;
pub mod metric;
pub mod natural;
pub mod proxy;
pub mod value;

pub use dispatcher::{BatchPolicy, Dispatcher};
pub use failover::{FailoverClient, Transport};
pub use measurement::Measurements;
pub use metric::{Metric, Timer};
pub use proxy::proxy_event;
pub use value::{Fields, Value};
