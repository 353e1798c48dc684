// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Hostname detection

use crate::errors::Creation;
use std::env;

pub const HOSTNAME_ENV: &str = "TRACKER_HOSTNAME";

/// Get the hostname reported as the source of every batch
///
/// 1. TRACKER_HOSTNAME environment variable (if set and non-empty)
/// 2. System hostname via nix::unistd::gethostname()
///
/// Failing to resolve a hostname is fatal: there is no retry and no placeholder.
pub fn get_hostname() -> Result<String, Creation> {
    if let Ok(hostname) = env::var(HOSTNAME_ENV) {
        if !hostname.is_empty() {
            return Ok(hostname);
        }
    }

    let hostname = nix::unistd::gethostname().map_err(|e| Creation::Hostname(e.to_string()))?;
    match hostname.to_str() {
        Some(hostname) if !hostname.is_empty() => Ok(hostname.to_string()),
        Some(_) => Err(Creation::Hostname("system hostname is empty".to_string())),
        None => Err(Creation::Hostname(
            "system hostname is not valid UTF-8".to_string(),
        )),
    }
}
