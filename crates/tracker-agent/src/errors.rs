// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error types for the tracker agent.

use crate::natural::DecodeError;

/// Errors raised while building the agent. None of them are recoverable.
#[derive(Debug, thiserror::Error)]
pub enum Creation {
    #[error("invalid server {server}: {reason}")]
    InvalidServer { server: String, reason: String },

    #[error("unable to resolve local hostname: {0}")]
    Hostname(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to build HTTP client: {0}")]
    HttpClient(String),
}

/// Errors surfaced by a single transmission attempt.
#[derive(Debug, thiserror::Error)]
pub enum Transmit {
    /// Every configured server was tried once without success.
    #[error("no server available")]
    ServerUnavailable,

    #[error("failed to serialize batch: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// A proxied payload that does not decode to an object or an array of objects.
#[derive(Debug, thiserror::Error)]
pub enum InvalidPayload {
    #[error("payload is not valid JSON: {0}")]
    Decode(#[from] DecodeError),

    #[error("payload has an unsupported shape: {0}")]
    Shape(String),
}
