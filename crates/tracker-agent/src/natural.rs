// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Structure-preserving JSON decoding.
//!
//! Decodes a JSON document into a [`Value`] without coercing numbers to floating point. The
//! decision is taken on the exact decimal text of each number, before any rounding:
//!
//! - a number that is mathematically an integer becomes [`Value::Int`] when it fits in 32 bits,
//!   otherwise [`Value::Long`] when it fits in 64 bits. `1.0`, `2e3` and `12.50e1` are integers;
//! - anything else (fractions, integers beyond the `i64` range) becomes [`Value::Float`].
//!
//! Objects become [`Value::Map`], arrays become [`Value::List`], recursively.

use crate::value::Value;
use serde::de::{Deserialize, Deserializer};

// An i64 has at most 19 digits.
const MAX_I64_DIGITS: usize = 19;

#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct DecodeError(#[from] serde_json::Error);

/// Decodes one JSON document.
pub fn decode(bytes: &[u8]) -> Result<Value, DecodeError> {
    let json: serde_json::Value = serde_json::from_slice(bytes)?;
    Ok(from_json(json))
}

pub(crate) fn from_i64(value: i64) -> Value {
    match i32::try_from(value) {
        Ok(narrow) => Value::Int(narrow),
        Err(_) => Value::Long(value),
    }
}

pub(crate) fn from_u64(value: u64) -> Value {
    match i64::try_from(value) {
        Ok(signed) => from_i64(signed),
        #[allow(clippy::cast_precision_loss)]
        Err(_) => Value::Float(value as f64),
    }
}

/// Converts a parsed JSON tree. Numbers keep the exact text they were written with.
pub(crate) fn from_json(json: serde_json::Value) -> Value {
    match json {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(b),
        serde_json::Value::Number(number) => from_decimal(&number.to_string()),
        serde_json::Value::String(s) => Value::String(s),
        serde_json::Value::Array(items) => Value::List(items.into_iter().map(from_json).collect()),
        serde_json::Value::Object(map) => Value::Map(
            map.into_iter()
                .map(|(key, value)| (key, from_json(value)))
                .collect(),
        ),
    }
}

/// Narrows a JSON number literal such as `-12.50e1`.
fn from_decimal(text: &str) -> Value {
    let float = || text.parse::<f64>().map_or(Value::Null, Value::Float);

    let (negative, unsigned) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text),
    };
    let (mantissa, exponent) = match unsigned.find(|c| c == 'e' || c == 'E') {
        Some(pos) => (&unsigned[..pos], &unsigned[pos + 1..]),
        None => (unsigned, ""),
    };
    let (whole, fraction) = mantissa.split_once('.').unwrap_or((mantissa, ""));

    let digits = format!("{whole}{fraction}");
    let significant = digits.trim_start_matches('0');
    let trimmed = significant.trim_end_matches('0');
    if trimmed.is_empty() {
        return Value::Int(0);
    }

    // the value is `trimmed * 10^scale`
    let scale = parse_exponent(exponent)
        .saturating_sub(len_i64(fraction))
        .saturating_add(len_i64(significant) - len_i64(trimmed));
    if scale < 0 {
        return float();
    }
    let zeros = match usize::try_from(scale) {
        Ok(zeros) if trimmed.len() + zeros <= MAX_I64_DIGITS => zeros,
        _ => return float(),
    };

    let sign = if negative { "-" } else { "" };
    format!("{sign}{trimmed}{}", "0".repeat(zeros))
        .parse::<i64>()
        .map_or_else(|_| float(), from_i64)
}

/// Parses the exponent of a number literal, saturating when it does not fit.
fn parse_exponent(exponent: &str) -> i64 {
    if exponent.is_empty() {
        return 0;
    }
    let exponent = exponent.strip_prefix('+').unwrap_or(exponent);
    exponent.parse::<i64>().unwrap_or(if exponent.starts_with('-') {
        i64::MIN
    } else {
        i64::MAX
    })
}

fn len_i64(s: &str) -> i64 {
    i64::try_from(s.len()).unwrap_or(i64::MAX)
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Value, D::Error> {
        serde_json::Value::deserialize(deserializer).map(from_json)
    }
}
