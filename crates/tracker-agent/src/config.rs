// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::errors::Creation;

pub const SERVERS_ENV: &str = "TRACKER_SERVERS";
pub const CONNECT_TIMEOUT_ENV: &str = "TRACKER_CONNECT_TIMEOUT_MS";
pub const REQUEST_TIMEOUT_ENV: &str = "TRACKER_REQUEST_TIMEOUT_MS";
pub const LOG_BATCH_SIZE_ENV: &str = "TRACKER_LOG_BATCH_SIZE";
pub const MIN_SUBMIT_INTERVAL_ENV: &str = "TRACKER_MIN_SUBMIT_INTERVAL_MS";

const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 2_000;
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_LOG_BATCH_SIZE: usize = 100;
const DEFAULT_MIN_SUBMIT_INTERVAL_MS: u64 = 1_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Comma-delimited `host[:port]` list of collectors.
    pub servers: String,
    /// Bound on establishing the connection to one collector.
    pub connect_timeout: Duration,
    /// Bound on one whole request to one collector.
    pub request_timeout: Duration,
    /// Number of queued log records that triggers a flush without any pending event.
    pub log_batch_size: usize,
    /// Minimum time between two transmissions. Zero disables throttling.
    pub min_submit_interval: Duration,
}

impl Config {
    pub fn new() -> Result<Config, Creation> {
        let servers = env::var(SERVERS_ENV).map_err(|_| {
            Creation::Config(format!("{SERVERS_ENV} environment variable is not set"))
        })?;

        let mut config = Config::with_servers(servers);
        config.connect_timeout =
            Duration::from_millis(parse_env(CONNECT_TIMEOUT_ENV, DEFAULT_CONNECT_TIMEOUT_MS));
        config.request_timeout =
            Duration::from_millis(parse_env(REQUEST_TIMEOUT_ENV, DEFAULT_REQUEST_TIMEOUT_MS));
        config.log_batch_size = parse_env(LOG_BATCH_SIZE_ENV, DEFAULT_LOG_BATCH_SIZE);
        config.min_submit_interval = Duration::from_millis(parse_env(
            MIN_SUBMIT_INTERVAL_ENV,
            DEFAULT_MIN_SUBMIT_INTERVAL_MS,
        ));
        Ok(config)
    }

    /// Builds a configuration for `servers` with every other setting at its default.
    #[must_use]
    pub fn with_servers(servers: impl Into<String>) -> Config {
        Config {
            servers: servers.into(),
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            log_batch_size: DEFAULT_LOG_BATCH_SIZE,
            min_submit_interval: Duration::from_millis(DEFAULT_MIN_SUBMIT_INTERVAL_MS),
        }
    }
}

fn parse_env<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|val| val.trim().parse::<T>().ok())
        .unwrap_or(default)
}
