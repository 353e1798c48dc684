// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Batching and dispatch of events and log records.
//!
//! Producers append to two independently locked queues and request a drain. At most one drain
//! loop runs at a time; it repeatedly assembles a batch, hands it to the [`Transport`] and stops
//! once a cycle finds nothing eligible.
//!
//! # Batch formation
//!
//! - any pending event makes the event queue eligible;
//! - the log queue is eligible on its own once it holds `log_batch_size` records, or with a
//!   single record when events are flushed in the same cycle;
//! - no batch is formed while less than `min_submit_interval` has passed since the previous
//!   one. The loop then stops and schedules one delayed drain request.
//!
//! The running flag is cleared under the same lock as the final "nothing eligible" check, so a
//! record queued after that check always triggers a fresh drain.

use bytes::Bytes;
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, error, warn};

use crate::config::Config;
use crate::errors::{Creation, Transmit};
use crate::failover::{FailoverClient, Transport};
use crate::hostname::get_hostname;
use crate::log::LogEntry;
use crate::measurement::Measurements;
use crate::metric::{now_millis, Metric};
use crate::value::{Fields, Value};

/// Source identity of records produced by the dispatch machinery itself.
pub const SOURCE: &str = module_path!();

/// Key under which submitted measurements are placed in an event.
pub const METRICS_KEY: &str = "metrics";

fn is_internal(source: &str) -> bool {
    source == SOURCE || source == crate::failover::SOURCE
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchPolicy {
    /// Log records needed to flush logs without any pending event.
    pub log_batch_size: usize,
    /// Minimum time between two transmissions. Zero disables throttling.
    pub min_submit_interval: Duration,
}

impl BatchPolicy {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        BatchPolicy {
            log_batch_size: config.log_batch_size,
            min_submit_interval: config.min_submit_interval,
        }
    }
}

impl Default for BatchPolicy {
    fn default() -> Self {
        BatchPolicy {
            log_batch_size: 100,
            min_submit_interval: Duration::from_millis(1_000),
        }
    }
}

/// The document sent per transmission. Carries events, logs or both.
#[derive(Debug, Serialize)]
struct Envelope<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    events: Option<Vec<Fields>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    logs: Option<Vec<LogEntry>>,
    source: &'a str,
    timestamp: i64,
}

struct Batch {
    events: Option<Vec<Fields>>,
    logs: Option<Vec<LogEntry>>,
}

enum Cycle {
    Send(Batch),
    Throttled(Duration),
    Idle,
}

#[derive(Default)]
struct DrainState {
    running: bool,
    deferred: bool,
    last_submit: Option<Instant>,
}

struct Inner {
    events: Mutex<Vec<Fields>>,
    logs: Mutex<Vec<LogEntry>>,
    state: Mutex<DrainState>,
    running_tx: watch::Sender<bool>,
    policy: BatchPolicy,
    hostname: String,
    transport: Arc<dyn Transport>,
    runtime: Handle,
}

/// Handle to the dispatch engine. Cheap to clone; all clones share the same queues.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    /// Creates a dispatcher whose drain loops run on `runtime`.
    pub fn new(
        policy: BatchPolicy,
        hostname: impl Into<String>,
        transport: Arc<dyn Transport>,
        runtime: Handle,
    ) -> Self {
        let (running_tx, _) = watch::channel(false);
        Dispatcher {
            inner: Arc::new(Inner {
                events: Mutex::new(Vec::new()),
                logs: Mutex::new(Vec::new()),
                state: Mutex::new(DrainState::default()),
                running_tx,
                policy,
                hostname: hostname.into(),
                transport,
                runtime,
            }),
        }
    }

    /// Builds the failover client and resolves the hostname from `config`.
    pub fn from_config(config: &Config, runtime: Handle) -> Result<Self, Creation> {
        let hostname = get_hostname()?;
        let client = FailoverClient::from_config(config)?;
        debug!(
            "Dispatching to {} collector(s) as {hostname}",
            client.urls().len()
        );
        Ok(Self::new(
            BatchPolicy::from_config(config),
            hostname,
            Arc::new(client),
            runtime,
        ))
    }

    #[must_use]
    pub fn hostname(&self) -> &str {
        &self.inner.hostname
    }

    /// Records `metric` in `measurements` under its declared name.
    pub fn post_metric<M: Metric>(&self, measurements: &mut Measurements, metric: &M) {
        if let Err(e) = measurements.post_metric(None, metric) {
            warn!("Dropping metric that failed to serialize: {e}");
        }
    }

    /// Moves every measurement collected in `measurements` into one event and queues it.
    ///
    /// The event is `context` plus a `"metrics"` entry holding the measurements; the metrics
    /// entry replaces a context field of the same name. Nothing is queued when no measurement
    /// was collected.
    pub fn submit(&self, measurements: &mut Measurements, context: Fields) {
        let metrics = measurements.take();
        if metrics.is_empty() {
            return;
        }

        let mut event = context;
        event.insert(METRICS_KEY.to_string(), Value::Map(metrics));
        self.post_event(event);
    }

    /// Queues an already-built event.
    pub fn post_event(&self, event: Fields) {
        lock(&self.inner.events).push(event);
        self.inner.request_drain();
    }

    /// Queues a log record. Records produced by the dispatch machinery are dropped.
    pub fn post_log(&self, entry: impl Into<LogEntry>) {
        let entry = entry.into();
        if entry.source().is_some_and(is_internal) {
            return;
        }

        lock(&self.inner.logs).push(entry);
        self.inner.request_drain();
    }

    /// Number of queued events and log records.
    #[must_use]
    pub fn pending(&self) -> (usize, usize) {
        let events = lock(&self.inner.events).len();
        let logs = lock(&self.inner.logs).len();
        (events, logs)
    }

    #[must_use]
    pub fn is_draining(&self) -> bool {
        lock(&self.inner.state).running
    }

    /// Requests a drain and waits until the drain loop is idle again.
    pub async fn flush(&self) {
        let mut running_rx = self.inner.running_tx.subscribe();
        self.inner.request_drain();
        if running_rx.wait_for(|running| !*running).await.is_err() {
            debug!("Dispatcher dropped while flushing");
        }
    }
}

impl Inner {
    fn request_drain(self: &Arc<Self>) {
        {
            let mut state = lock(&self.state);
            if state.running {
                return;
            }
            state.running = true;
            self.running_tx.send_replace(true);
        }

        let guard = DrainGuard {
            inner: Arc::clone(self),
            armed: true,
        };
        self.runtime.spawn(drain(guard));
    }

    /// Decides what the next cycle does. Must be called with the drain state locked.
    fn next_cycle(&self, state: &DrainState) -> Cycle {
        let interval = self.policy.min_submit_interval;
        if let Some(last_submit) = state.last_submit {
            let elapsed = last_submit.elapsed();
            if elapsed < interval {
                if self.has_eligible() {
                    return Cycle::Throttled(interval - elapsed);
                }
                return Cycle::Idle;
            }
        }

        let events = {
            let mut queue = lock(&self.events);
            if queue.is_empty() {
                None
            } else {
                Some(std::mem::take(&mut *queue))
            }
        };

        let log_threshold = if events.is_some() {
            1
        } else {
            self.policy.log_batch_size.max(1)
        };
        let logs = {
            let mut queue = lock(&self.logs);
            if queue.len() >= log_threshold {
                Some(std::mem::take(&mut *queue))
            } else {
                None
            }
        };

        if events.is_none() && logs.is_none() {
            Cycle::Idle
        } else {
            Cycle::Send(Batch { events, logs })
        }
    }

    fn has_eligible(&self) -> bool {
        !lock(&self.events).is_empty()
            || lock(&self.logs).len() >= self.policy.log_batch_size.max(1)
    }

    async fn send(&self, batch: Batch) -> Result<(), Transmit> {
        let n_events = batch.events.as_ref().map_or(0, Vec::len);
        let n_logs = batch.logs.as_ref().map_or(0, Vec::len);

        let envelope = Envelope {
            events: batch.events,
            logs: batch.logs,
            source: &self.hostname,
            timestamp: now_millis(),
        };
        let payload = serde_json::to_vec(&envelope)?;

        debug!("Flushing {n_events} events and {n_logs} logs");
        self.transport.transmit(Bytes::from(payload)).await?;
        debug!("Successfully flushed {n_events} events and {n_logs} logs");
        Ok(())
    }

    fn schedule_deferred_drain(self: &Arc<Self>, state: &mut DrainState, wait: Duration) {
        if state.deferred {
            return;
        }
        state.deferred = true;

        let inner = Arc::clone(self);
        self.runtime.spawn(async move {
            tokio::time::sleep(wait).await;
            lock(&inner.state).deferred = false;
            inner.request_drain();
        });
    }
}

/// Owns the running flag of one drain loop. Clears it if the loop ends without doing so itself,
/// including when the task is dropped unpolled or panics.
struct DrainGuard {
    inner: Arc<Inner>,
    armed: bool,
}

impl DrainGuard {
    /// Clears the running flag. `state` must be the locked drain state.
    fn release(&mut self, state: &mut DrainState) {
        state.running = false;
        self.inner.running_tx.send_replace(false);
        self.armed = false;
    }
}

impl Drop for DrainGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if std::thread::panicking() {
            error!("Drain loop panicked, releasing the dispatcher");
        }
        let mut state = lock(&self.inner.state);
        state.running = false;
        self.inner.running_tx.send_replace(false);
    }
}

async fn drain(mut guard: DrainGuard) {
    let inner = Arc::clone(&guard.inner);

    loop {
        let batch = {
            let mut state = lock(&inner.state);
            match inner.next_cycle(&state) {
                Cycle::Send(batch) => {
                    state.last_submit = Some(Instant::now());
                    batch
                }
                Cycle::Throttled(wait) => {
                    debug!("Throttled, next flush in {} ms", wait.as_millis());
                    inner.schedule_deferred_drain(&mut state, wait);
                    guard.release(&mut state);
                    return;
                }
                Cycle::Idle => {
                    guard.release(&mut state);
                    return;
                }
            }
        };

        if let Err(e) = inner.send(batch).await {
            error!("Failed to flush batch, dropping it: {e}");
            let mut state = lock(&inner.state);
            guard.release(&mut state);
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::{Level, LogRecord};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::time::{sleep, timeout};

    #[derive(Default)]
    struct RecordingTransport {
        batches: Mutex<Vec<(Instant, serde_json::Value)>>,
        failing: AtomicBool,
        delay: Duration,
        active: AtomicUsize,
        max_active: AtomicUsize,
    }

    impl RecordingTransport {
        fn with_delay(delay: Duration) -> Self {
            RecordingTransport {
                delay,
                ..Default::default()
            }
        }

        fn batches(&self) -> Vec<serde_json::Value> {
            lock(&self.batches).iter().map(|(_, b)| b.clone()).collect()
        }
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn transmit(&self, payload: Bytes) -> Result<(), Transmit> {
            let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(active, Ordering::SeqCst);
            if !self.delay.is_zero() {
                sleep(self.delay).await;
            }
            self.active.fetch_sub(1, Ordering::SeqCst);

            if self.failing.load(Ordering::SeqCst) {
                return Err(Transmit::ServerUnavailable);
            }
            let batch = serde_json::from_slice(&payload)?;
            lock(&self.batches).push((Instant::now(), batch));
            Ok(())
        }
    }

    fn policy(log_batch_size: usize, min_submit_interval: Duration) -> BatchPolicy {
        BatchPolicy {
            log_batch_size,
            min_submit_interval,
        }
    }

    fn dispatcher(policy: BatchPolicy, transport: &Arc<RecordingTransport>) -> Dispatcher {
        let transport: Arc<dyn Transport> = transport.clone();
        Dispatcher::new(policy, "test-host", transport, Handle::current())
    }

    fn context(entries: &[(&str, &str)]) -> Fields {
        entries
            .iter()
            .map(|(k, v)| ((*k).to_string(), Value::from(*v)))
            .collect()
    }

    fn record(message: &str) -> LogRecord {
        LogRecord::new(Level::Info, message, "app::handler")
    }

    async fn wait_for_batches(transport: &RecordingTransport, count: usize) {
        let waited = timeout(Duration::from_secs(2), async {
            while transport.batches().len() < count {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(waited.is_ok(), "timed out waiting for {count} batches");
    }

    fn delivered_ids(transport: &RecordingTransport) -> Vec<String> {
        transport
            .batches()
            .iter()
            .flat_map(|batch| batch["events"].as_array().cloned().unwrap_or_default())
            .filter_map(|event| event["id"].as_str().map(ToString::to_string))
            .collect()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_submit_without_measurements_is_noop() {
        let transport = Arc::new(RecordingTransport::default());
        let dispatcher = dispatcher(policy(100, Duration::ZERO), &transport);

        dispatcher.submit(&mut Measurements::new(), context(&[("session", "1")]));
        dispatcher.flush().await;

        assert_eq!(dispatcher.pending(), (0, 0));
        assert!(transport.batches().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_submit_builds_event() {
        let transport = Arc::new(RecordingTransport::default());
        let dispatcher = dispatcher(policy(100, Duration::ZERO), &transport);

        let mut measurements = Measurements::new();
        measurements.post("duration", 12, true);
        dispatcher.submit(
            &mut measurements,
            context(&[("session", "1"), ("visitor", "007"), ("metrics", "ignored")]),
        );

        wait_for_batches(&transport, 1).await;
        assert!(measurements.is_empty());

        let batch = &transport.batches()[0];
        assert_eq!(batch["source"], "test-host");
        assert!(batch["timestamp"].as_i64().unwrap() > 0);
        assert!(batch.get("logs").is_none());
        assert_eq!(
            batch["events"],
            serde_json::json!([{
                "metrics": {"duration": 12},
                "session": "1",
                "visitor": "007"
            }])
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_logs_wait_for_batch_size() {
        let transport = Arc::new(RecordingTransport::default());
        let dispatcher = dispatcher(policy(3, Duration::ZERO), &transport);

        dispatcher.post_log(record("one"));
        dispatcher.post_log(record("two"));
        dispatcher.flush().await;

        assert!(transport.batches().is_empty());
        assert_eq!(dispatcher.pending(), (0, 2));

        dispatcher.post_log(record("three"));
        wait_for_batches(&transport, 1).await;

        let batch = &transport.batches()[0];
        assert!(batch.get("events").is_none());
        let messages: Vec<&str> = batch["logs"]
            .as_array()
            .unwrap()
            .iter()
            .map(|log| log["message"].as_str().unwrap())
            .collect();
        assert_eq!(messages, vec!["one", "two", "three"]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_logs_piggyback_on_events() {
        let transport = Arc::new(RecordingTransport::default());
        let dispatcher = dispatcher(policy(100, Duration::ZERO), &transport);

        dispatcher.post_log(record("before the event"));
        dispatcher.flush().await;
        assert!(transport.batches().is_empty());

        dispatcher.post_event(context(&[("session", "1")]));
        wait_for_batches(&transport, 1).await;

        let batch = &transport.batches()[0];
        assert_eq!(batch["events"].as_array().unwrap().len(), 1);
        assert_eq!(batch["logs"].as_array().unwrap().len(), 1);
        assert_eq!(batch["logs"][0]["message"], "before the event");
        assert_eq!(dispatcher.pending(), (0, 0));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_internal_logs_are_dropped() {
        let transport = Arc::new(RecordingTransport::default());
        let dispatcher = dispatcher(policy(1, Duration::ZERO), &transport);

        dispatcher.post_log(LogRecord::new(Level::Error, "loop", SOURCE));
        dispatcher.post_log(LogRecord::new(
            Level::Warn,
            "loop",
            crate::failover::SOURCE,
        ));

        assert_eq!(dispatcher.pending(), (0, 0));
        assert!(!dispatcher.is_draining());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_single_flight_drain() {
        let transport = Arc::new(RecordingTransport::with_delay(Duration::from_millis(20)));
        let dispatcher = dispatcher(policy(100, Duration::ZERO), &transport);

        let mut producers = Vec::new();
        for producer in 0..4 {
            let dispatcher = dispatcher.clone();
            producers.push(tokio::spawn(async move {
                for n in 0..10 {
                    let id = format!("{producer}-{n}");
                    dispatcher.post_event(context(&[("id", id.as_str())]));
                    sleep(Duration::from_millis(2)).await;
                }
            }));
        }
        for producer in producers {
            producer.await.expect("producer panicked");
        }
        dispatcher.flush().await;
        dispatcher.flush().await;

        assert_eq!(transport.max_active.load(Ordering::SeqCst), 1);

        let mut ids: Vec<String> = transport
            .batches()
            .iter()
            .flat_map(|batch| batch["events"].as_array().cloned().unwrap_or_default())
            .map(|event| event["id"].as_str().unwrap().to_string())
            .collect();
        ids.sort();
        let before = ids.len();
        ids.dedup();
        assert_eq!(before, 40);
        assert_eq!(ids.len(), 40);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_events_posted_while_draining_are_delivered() {
        let transport = Arc::new(RecordingTransport::with_delay(Duration::from_millis(15)));
        let dispatcher = dispatcher(policy(100, Duration::ZERO), &transport);

        let mut producers = Vec::new();
        for producer in 0..8 {
            let dispatcher = dispatcher.clone();
            producers.push(std::thread::spawn(move || {
                for n in 0..25 {
                    let id = format!("{producer}-{n}");
                    dispatcher.post_event(context(&[("id", id.as_str())]));
                    std::thread::sleep(Duration::from_millis(1));
                }
            }));
        }
        for producer in producers {
            producer.join().expect("producer panicked");
        }

        // no flush: every post must have been picked up by a drain it triggered or joined
        let delivered = timeout(Duration::from_secs(5), async {
            while delivered_ids(&transport).len() < 200 {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(
            delivered.is_ok(),
            "only {} of 200 events delivered, {:?} pending",
            delivered_ids(&transport).len(),
            dispatcher.pending()
        );

        let mut ids = delivered_ids(&transport);
        assert_eq!(ids.len(), 200);
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 200);
        assert_eq!(dispatcher.pending(), (0, 0));
        assert_eq!(transport.max_active.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_failed_batch_is_dropped_and_drain_recovers() {
        let transport = Arc::new(RecordingTransport::default());
        let dispatcher = dispatcher(policy(100, Duration::ZERO), &transport);

        transport.failing.store(true, Ordering::SeqCst);
        dispatcher.post_event(context(&[("session", "lost")]));
        dispatcher.flush().await;

        assert!(!dispatcher.is_draining());
        assert_eq!(dispatcher.pending(), (0, 0));

        transport.failing.store(false, Ordering::SeqCst);
        dispatcher.post_event(context(&[("session", "delivered")]));
        wait_for_batches(&transport, 1).await;

        let batches = transport.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0]["events"][0]["session"], "delivered");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_min_submit_interval_defers_flush() {
        let interval = Duration::from_millis(200);
        let transport = Arc::new(RecordingTransport::default());
        let dispatcher = dispatcher(policy(100, interval), &transport);

        dispatcher.post_event(context(&[("n", "1")]));
        wait_for_batches(&transport, 1).await;

        dispatcher.post_event(context(&[("n", "2")]));
        dispatcher.flush().await;
        assert_eq!(transport.batches().len(), 1);
        assert_eq!(dispatcher.pending(), (1, 0));

        wait_for_batches(&transport, 2).await;
        let sent = lock(&transport.batches);
        let gap = sent[1].0.duration_since(sent[0].0);
        assert!(gap >= interval - Duration::from_millis(20), "gap was {gap:?}");
        assert_eq!(sent[1].1["events"][0]["n"], "2");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_proxied_logs_are_queued() {
        let transport = Arc::new(RecordingTransport::default());
        let dispatcher = dispatcher(policy(1, Duration::ZERO), &transport);

        dispatcher.post_log(context(&[("message", "from a device")]));
        wait_for_batches(&transport, 1).await;

        assert_eq!(
            transport.batches()[0]["logs"],
            serde_json::json!([{"message": "from a device"}])
        );
    }
}
