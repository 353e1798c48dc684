// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::env;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    runtime::Handle,
    time::{sleep, Duration},
};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, EnvFilter};

use tracker_agent::{
    config::Config, logger::TrackerLayer, proxy_event, Dispatcher, Fields, Value,
};

const LOG_LEVEL_ENV: &str = "TRACKER_LOG_LEVEL";
const DRAIN_ATTEMPTS: u32 = 10;

#[tokio::main]
pub async fn main() {
    let log_level = env::var(LOG_LEVEL_ENV)
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());

    let dispatcher = Config::new().and_then(|config| {
        let dispatcher = Dispatcher::from_config(&config, Handle::current())?;
        Ok((config, dispatcher))
    });

    let env_filter = format!(
        "h2=off,hyper=off,hyper_util=off,reqwest=off,rustls=off,{}",
        log_level
    );

    #[allow(clippy::expect_used)]
    let filter =
        EnvFilter::try_new(env_filter).expect("could not parse log level in configuration");
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .without_time();
    let tracker_layer = dispatcher
        .as_ref()
        .ok()
        .map(|(_, dispatcher)| TrackerLayer::new(dispatcher.clone()));

    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .with(tracker_layer);

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    let (config, dispatcher) = match dispatcher {
        Ok(value) => value,
        Err(e) => {
            error!("Unable to start the forwarder: {e}");
            return;
        }
    };

    info!(
        "Forwarding stdin to {} as {}",
        config.servers,
        dispatcher.hostname()
    );

    let mut context = Fields::new();
    context.insert(
        "forwardedBy".to_string(),
        Value::from(dispatcher.hostname()),
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                error!("Failed to read stdin: {e}");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        match proxy_event(&dispatcher, &context, line.as_bytes()) {
            Ok(events) => match serde_json::to_string(&events) {
                Ok(json) => println!("{json}"),
                Err(e) => error!("Failed to serialize forwarded events: {e}"),
            },
            Err(e) => warn!("Skipping payload: {e}"),
        }
    }

    drain(&dispatcher, config.min_submit_interval).await;
}

/// Flushes until no event is left, waiting out the submit interval between attempts.
async fn drain(dispatcher: &Dispatcher, min_submit_interval: Duration) {
    for _ in 0..DRAIN_ATTEMPTS {
        dispatcher.flush().await;
        if dispatcher.pending().0 == 0 {
            break;
        }
        sleep(min_submit_interval).await;
    }

    match dispatcher.pending() {
        (0, 0) => debug!("All telemetry delivered"),
        (0, logs) => debug!("{logs} log records stay below the batch size and are not sent"),
        (events, logs) => warn!("Exiting with {events} events and {logs} log records queued"),
    }
}
