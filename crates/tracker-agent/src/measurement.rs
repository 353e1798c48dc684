// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-unit-of-work measurement storage.
//!
//! A [`Measurements`] value is created for one logical unit of work (typically one request) and
//! passed by reference through the call chain. It maps metric names to slots:
//!
//! - a unique post replaces whatever the slot held;
//! - a non-unique post stores the bare value first, and turns the slot into an ordered list on
//!   the second post. A list slot stays a list until the scope is reset.
//!
//! [`Measurements::take`] hands the collected values to the dispatcher and leaves the scope
//! empty.

use crate::metric::{metric_name, Metric};
use crate::value::{Fields, Value};
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
enum Slot {
    Single(Value),
    Many(Vec<Value>),
}

impl Slot {
    fn to_value(&self) -> Value {
        match self {
            Slot::Single(value) => value.clone(),
            Slot::Many(values) => Value::List(values.clone()),
        }
    }

    fn into_value(self) -> Value {
        match self {
            Slot::Single(value) => value,
            Slot::Many(values) => Value::List(values),
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct Measurements {
    slots: BTreeMap<String, Slot>,
}

impl Measurements {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves the name `M` is stored under when posted with `explicit` as its name.
    #[must_use]
    pub fn metric_name<M: Metric>(explicit: Option<&str>) -> String {
        metric_name::<M>(explicit, M::NAME)
    }

    /// Posts a raw value under `name`.
    pub fn post(&mut self, name: impl Into<String>, value: impl Into<Value>, unique: bool) {
        let name = name.into();
        let value = value.into();

        if unique {
            match self.slots.get_mut(&name) {
                Some(Slot::Many(values)) => {
                    values.clear();
                    values.push(value);
                }
                _ => {
                    self.slots.insert(name, Slot::Single(value));
                }
            }
            return;
        }

        match self.slots.remove(&name) {
            None => {
                self.slots.insert(name, Slot::Single(value));
            }
            Some(Slot::Single(first)) => {
                self.slots.insert(name, Slot::Many(vec![first, value]));
            }
            Some(Slot::Many(mut values)) => {
                values.push(value);
                self.slots.insert(name, Slot::Many(values));
            }
        }
    }

    /// Posts a typed metric, using its declared name and uniqueness unless `name` overrides the
    /// name.
    pub fn post_metric<M: Metric>(
        &mut self,
        name: Option<&str>,
        metric: &M,
    ) -> Result<(), serde_json::Error> {
        let value = Value::from_serialize(metric)?;
        self.post(Self::metric_name::<M>(name), value, M::UNIQUE);
        Ok(())
    }

    /// Returns the current content of the slot named `name`. A list slot is returned as a
    /// [`Value::List`].
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Value> {
        self.slots.get(name).map(Slot::to_value)
    }

    /// Returns the slot `M` resolves to, converted back into `M`. Returns `None` when the slot
    /// is absent or does not have the shape of `M`.
    #[must_use]
    pub fn get_metric<M: Metric + DeserializeOwned>(&self, name: Option<&str>) -> Option<M> {
        let name = Self::metric_name::<M>(name);
        let value = self.get(&name)?;
        match value.deserialize_into() {
            Ok(metric) => Some(metric),
            Err(e) => {
                debug!("Measurement {name} does not match the requested type: {e}");
                None
            }
        }
    }

    /// Returns a recorder writing individual fields into the map-valued slot `name`.
    pub fn recorder(&mut self, name: impl Into<String>) -> MetricRecorder<'_> {
        let slot = self
            .slots
            .entry(name.into())
            .or_insert_with(|| Slot::Single(Value::Map(Fields::new())));

        if !matches!(slot, Slot::Single(Value::Map(_))) {
            debug!("Replacing a non-map measurement with recorded fields");
            *slot = Slot::Single(Value::Map(Fields::new()));
        }

        MetricRecorder { slot }
    }

    /// Returns every collected measurement and resets the scope.
    pub fn take(&mut self) -> Fields {
        std::mem::take(&mut self.slots)
            .into_iter()
            .map(|(name, slot)| (name, slot.into_value()))
            .collect()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }
}

/// Records assigned field values of a metric, one field at a time.
pub struct MetricRecorder<'a> {
    slot: &'a mut Slot,
}

impl MetricRecorder<'_> {
    pub fn set(&mut self, field: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        // `recorder` guarantees the slot holds a map
        if let Slot::Single(Value::Map(fields)) = self.slot {
            fields.insert(field.into(), value.into());
        }
        self
    }
}
