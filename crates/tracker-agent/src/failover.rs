// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Delivery of serialized batches to a pool of interchangeable collectors.
//!
//! Every call to [`FailoverClient::transmit`] works on a private copy of the configured pool. It
//! picks a collector at random, removes it from the copy and posts the payload. A transport
//! error or any status other than `200 OK` moves on to another randomly chosen collector. The
//! call fails with [`Transmit::ServerUnavailable`] once the copy is exhausted, so no collector is
//! tried twice in one call and a failure never removes a collector from later calls.

use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;
use reqwest::{header::CONTENT_TYPE, StatusCode, Url};
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::Config;
use crate::errors::{Creation, Transmit};

/// Path appended to every configured server.
pub const SUBMIT_PATH: &str = "/submit/events";

/// Source identity of records logged while transmitting.
pub const SOURCE: &str = module_path!();

/// Sends one serialized batch somewhere.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn transmit(&self, payload: Bytes) -> Result<(), Transmit>;
}

#[derive(Debug, Clone)]
pub struct FailoverClient {
    client: reqwest::Client,
    urls: Vec<Url>,
}

impl FailoverClient {
    /// Builds a client from a comma-delimited `host[:port]` list. Blank entries are skipped; an
    /// entry that cannot form a submission URL fails the whole construction.
    pub fn new(
        servers: &str,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Result<Self, Creation> {
        let urls = servers
            .split(',')
            .map(str::trim)
            .filter(|server| !server.is_empty())
            .map(make_url)
            .collect::<Result<Vec<_>, _>>()?;

        if urls.is_empty() {
            warn!("No collector configured, every transmission will fail");
        }

        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(request_timeout)
            .build()
            .map_err(|e| Creation::HttpClient(e.to_string()))?;

        Ok(FailoverClient { client, urls })
    }

    pub fn from_config(config: &Config) -> Result<Self, Creation> {
        Self::new(
            &config.servers,
            config.connect_timeout,
            config.request_timeout,
        )
    }

    /// The submission URLs, in configuration order.
    #[must_use]
    pub fn urls(&self) -> &[Url] {
        &self.urls
    }

    async fn post(&self, url: &Url, payload: Bytes) -> Result<StatusCode, reqwest::Error> {
        let response = self
            .client
            .post(url.clone())
            .header(CONTENT_TYPE, "application/json")
            .body(payload)
            .send()
            .await?;
        Ok(response.status())
    }
}

#[async_trait]
impl Transport for FailoverClient {
    async fn transmit(&self, payload: Bytes) -> Result<(), Transmit> {
        let mut pool = self.urls.clone();

        while !pool.is_empty() {
            let pos = rand::rng().random_range(0..pool.len());
            let url = pool.swap_remove(pos);

            debug!("transmitting to {url}");

            match self.post(&url, payload.clone()).await {
                Ok(StatusCode::OK) => return Ok(()),
                Ok(status) => warn!("{url} returned {status}"),
                Err(e) => warn!("Error while transmitting to {url}: {e}"),
            }
        }

        Err(Transmit::ServerUnavailable)
    }
}

fn make_url(server: &str) -> Result<Url, Creation> {
    let invalid = |reason: String| Creation::InvalidServer {
        server: server.to_string(),
        reason,
    };

    let url = Url::parse(&format!("http://{server}{SUBMIT_PATH}"))
        .map_err(|e| invalid(e.to_string()))?;

    if url.host_str().map_or(true, str::is_empty) {
        return Err(invalid("missing host".to_string()));
    }
    // a server carrying its own path, query or credentials would change the submission URL
    if url.path() != SUBMIT_PATH
        || url.query().is_some()
        || url.fragment().is_some()
        || !url.username().is_empty()
    {
        return Err(invalid("expected host[:port]".to_string()));
    }

    Ok(url)
}
