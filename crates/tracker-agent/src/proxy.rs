// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Re-emission of telemetry received from another process.
//!
//! Accepted payloads:
//!
//! - an object with optional `"events"` and `"logs"` arrays of objects; its other fields form
//!   a shared context for every element;
//! - any other object, taken as one event;
//! - a non-empty array of objects, each taken as one event.
//!
//! Merging only fills gaps: the caller's context fills the shared context and the shared context
//! fills each element, so an inbound value always wins. The whole payload is validated before
//! anything is queued.

use crate::dispatcher::Dispatcher;
use crate::errors::InvalidPayload;
use crate::natural;
use crate::value::{merge_missing, Fields, Value};

pub const EVENTS_KEY: &str = "events";
pub const LOGS_KEY: &str = "logs";

#[derive(Debug, Default, PartialEq)]
struct Proxied {
    events: Vec<Fields>,
    logs: Vec<Fields>,
}

/// Merges `context` into the payload in `body`, queues its logs and events on `dispatcher` and
/// returns the merged events in input order.
pub fn proxy_event(
    dispatcher: &Dispatcher,
    context: &Fields,
    body: &[u8],
) -> Result<Vec<Fields>, InvalidPayload> {
    let Proxied { events, logs } = parse(context, body)?;

    for log in logs {
        dispatcher.post_log(log);
    }
    for event in &events {
        dispatcher.post_event(event.clone());
    }

    Ok(events)
}

fn parse(context: &Fields, body: &[u8]) -> Result<Proxied, InvalidPayload> {
    match natural::decode(body)? {
        Value::Map(top) if top.contains_key(EVENTS_KEY) || top.contains_key(LOGS_KEY) => {
            parse_envelope(context, top)
        }
        Value::Map(mut event) => {
            merge_missing(&mut event, context);
            Ok(Proxied {
                events: vec![event],
                logs: Vec::new(),
            })
        }
        Value::List(items) if items.is_empty() => {
            Err(InvalidPayload::Shape("empty array".to_string()))
        }
        Value::List(items) => {
            let mut events = objects(items, "array")?;
            for event in &mut events {
                merge_missing(event, context);
            }
            Ok(Proxied {
                events,
                logs: Vec::new(),
            })
        }
        other => Err(InvalidPayload::Shape(format!(
            "expected an object or an array of objects, got {}",
            kind(&other)
        ))),
    }
}

fn parse_envelope(context: &Fields, mut shared: Fields) -> Result<Proxied, InvalidPayload> {
    let mut events = take_objects(&mut shared, EVENTS_KEY)?;
    let mut logs = take_objects(&mut shared, LOGS_KEY)?;

    merge_missing(&mut shared, context);
    for element in events.iter_mut().chain(logs.iter_mut()) {
        merge_missing(element, &shared);
    }

    Ok(Proxied { events, logs })
}

/// Removes `key` from `fields` and checks that it held an array of objects. Absent or null is
/// an empty array.
fn take_objects(fields: &mut Fields, key: &str) -> Result<Vec<Fields>, InvalidPayload> {
    match fields.remove(key) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::List(items)) => objects(items, key),
        Some(other) => Err(InvalidPayload::Shape(format!(
            "\"{key}\" must be an array, got {}",
            kind(&other)
        ))),
    }
}

fn objects(items: Vec<Value>, what: &str) -> Result<Vec<Fields>, InvalidPayload> {
    items
        .into_iter()
        .enumerate()
        .map(|(pos, item)| match item {
            Value::Map(fields) => Ok(fields),
            other => Err(InvalidPayload::Shape(format!(
                "element {pos} of {what} must be an object, got {}",
                kind(&other)
            ))),
        })
        .collect()
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Int(_) | Value::Long(_) | Value::Float(_) => "a number",
        Value::String(_) => "a string",
        Value::List(_) => "an array",
        Value::Map(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::BatchPolicy;
    use crate::errors::Transmit;
    use crate::failover::Transport;
    use async_trait::async_trait;
    use bytes::Bytes;
    use serde_json::json;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::runtime::Handle;

    #[derive(Default)]
    struct RecordingTransport {
        batches: Mutex<Vec<serde_json::Value>>,
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn transmit(&self, payload: Bytes) -> Result<(), Transmit> {
            let batch = serde_json::from_slice(&payload)?;
            self.batches.lock().expect("lock poisoned").push(batch);
            Ok(())
        }
    }

    fn dispatcher(transport: &Arc<RecordingTransport>) -> Dispatcher {
        let policy = BatchPolicy {
            log_batch_size: 100,
            min_submit_interval: Duration::ZERO,
        };
        let transport: Arc<dyn Transport> = transport.clone();
        Dispatcher::new(policy, "proxy-host", transport, Handle::current())
    }

    fn fields(value: serde_json::Value) -> Fields {
        Value::from_serialize(&value)
            .ok()
            .and_then(|value| value.as_map().cloned())
            .expect("test value must be an object")
    }

    fn events(result: Vec<Fields>) -> serde_json::Value {
        serde_json::to_value(result).expect("events serialize")
    }

    #[test]
    fn test_bare_object_is_one_event() {
        let context = fields(json!({"visitor": "007"}));
        let parsed = parse(&context, br#"{"session":"1"}"#).expect("valid payload");
        assert_eq!(parsed.events, vec![fields(json!({"session": "1", "visitor": "007"}))]);
        assert!(parsed.logs.is_empty());
    }

    #[test]
    fn test_inbound_values_win_over_context() {
        let context = fields(json!({"visitor": "007"}));
        let parsed = parse(
            &context,
            br#"{"events":[{"session":"1"},{"session":"2","visitor":"008"}]}"#,
        )
        .expect("valid payload");

        assert_eq!(
            parsed.events,
            vec![
                fields(json!({"session": "1", "visitor": "007"})),
                fields(json!({"session": "2", "visitor": "008"})),
            ]
        );
    }

    #[test]
    fn test_shared_context_fills_logs_and_events() {
        let context = fields(json!({"visitor": "007", "app": "caller"}));
        let parsed = parse(
            &context,
            br#"{
                "app": "inbound",
                "events": [{"session": "1"}],
                "logs": [{"message": "hello", "app": "own"}]
            }"#,
        )
        .expect("valid payload");

        assert_eq!(
            parsed.events,
            vec![fields(json!({"app": "inbound", "session": "1", "visitor": "007"}))]
        );
        assert_eq!(
            parsed.logs,
            vec![fields(json!({"app": "own", "message": "hello", "visitor": "007"}))]
        );
    }

    #[test]
    fn test_array_of_objects() {
        let context = fields(json!({"visitor": "007"}));
        let parsed = parse(&context, br#"[{"n":1},{"n":2147483648}]"#).expect("valid payload");

        assert_eq!(parsed.events.len(), 2);
        assert_eq!(parsed.events[0]["n"], Value::Int(1));
        assert_eq!(parsed.events[1]["n"], Value::Long(2_147_483_648));
        assert_eq!(parsed.events[1]["visitor"], Value::from("007"));
    }

    #[test]
    fn test_envelope_without_events() {
        let parsed = parse(&Fields::new(), br#"{"logs":[{"message":"m"}],"events":null}"#)
            .expect("valid payload");
        assert!(parsed.events.is_empty());
        assert_eq!(parsed.logs.len(), 1);
    }

    #[test]
    fn test_invalid_payloads() {
        let context = fields(json!({"visitor": "007"}));
        let bodies: [&[u8]; 9] = [
            b"[]",
            b"",
            b"not json",
            b"42",
            b"\"event\"",
            b"null",
            br#"[{"n":1}, 2]"#,
            br#"{"events":{"session":"1"}}"#,
            br#"{"events":[{"session":"1"}],"logs":["text"]}"#,
        ];
        for body in bodies {
            let result = parse(&context, body);
            assert!(
                result.is_err(),
                "{} should be rejected",
                String::from_utf8_lossy(body)
            );
        }
    }

    #[test]
    fn test_shape_error_message() {
        let result = parse(&Fields::new(), br#"{"events":[{"a":1},"b"]}"#);
        match result {
            Err(InvalidPayload::Shape(message)) => {
                assert_eq!(message, "element 1 of events must be an object, got a string");
            }
            other => panic!("expected a shape error, got {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_proxy_event_queues_and_returns_events() {
        let transport = Arc::new(RecordingTransport::default());
        let dispatcher = dispatcher(&transport);
        let context = fields(json!({"visitor": "007"}));

        let result = proxy_event(
            &dispatcher,
            &context,
            br#"{"events":[{"session":"1"}],"logs":[{"message":"proxied"}]}"#,
        )
        .expect("valid payload");
        assert_eq!(events(result), json!([{"session": "1", "visitor": "007"}]));

        dispatcher.flush().await;
        let batches = transport.batches.lock().expect("lock poisoned").clone();
        let sent_events: Vec<_> = batches
            .iter()
            .flat_map(|batch| batch["events"].as_array().cloned().unwrap_or_default())
            .collect();
        let sent_logs: Vec<_> = batches
            .iter()
            .flat_map(|batch| batch["logs"].as_array().cloned().unwrap_or_default())
            .collect();
        assert_eq!(sent_events, vec![json!({"session": "1", "visitor": "007"})]);
        assert_eq!(sent_logs, vec![json!({"message": "proxied", "visitor": "007"})]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_invalid_payload_queues_nothing() {
        let transport = Arc::new(RecordingTransport::default());
        let dispatcher = dispatcher(&transport);

        let result = proxy_event(
            &dispatcher,
            &Fields::new(),
            br#"{"events":[{"session":"1"}],"logs":[1]}"#,
        );

        assert!(matches!(result, Err(InvalidPayload::Shape(_))));
        assert_eq!(dispatcher.pending(), (0, 0));
        assert!(!dispatcher.is_draining());
    }
}
