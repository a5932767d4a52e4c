// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{future::Future, time::Duration};

use backon::{ExponentialBuilder, Retryable};
use bytes::Bytes;
use reqwest::{
    Method,
    header::{HeaderName, HeaderValue},
};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use snafu::ResultExt;

use crate::{
    config::RetryConfig,
    error::{InvalidResponseSnafu, TransferError},
};

/// Exponential backoff applied to one logical operation.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub base_delay:  Duration,
    pub multiplier:  f32,
    pub max_delay:   Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self { Self::from(&RetryConfig::default()) }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay:  config.base_delay.try_into().unwrap_or_default(),
            multiplier:  config.multiplier,
            max_delay:   config.max_delay.try_into().unwrap_or(Duration::MAX),
        }
    }
}

impl RetryPolicy {
    fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.base_delay)
            .with_factor(self.multiplier)
            .with_max_delay(self.max_delay)
            .with_max_times(self.max_retries)
    }

    /// Runs `op` until it succeeds, fails with a non-retryable error, or the
    /// retry budget is spent.
    ///
    /// A retryable error that outlives the budget is wrapped in
    /// [`TransferError::RetriesExhausted`].
    pub async fn retry<T, F, Fut>(&self, op: F) -> Result<T, TransferError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TransferError>>,
    {
        op.retry(self.backoff())
            .sleep(tokio::time::sleep)
            .when(TransferError::is_retryable)
            .notify(|err, delay| {
                tracing::warn!(error = %err, delay = ?delay, "retrying after transient failure");
            })
            .await
            .map_err(|err| {
                if err.is_retryable() {
                    TransferError::RetriesExhausted {
                        retries: self.max_retries,
                        source:  Box::new(err),
                    }
                } else {
                    err
                }
            })
    }
}

/// Everything needed to issue one request, reusable across attempts.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    method:  Method,
    url:     String,
    headers: Vec<(HeaderName, String)>,
    body:    Option<Bytes>,
}

impl TransferRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self { Self::new(Method::GET, url) }

    pub fn post(url: impl Into<String>) -> Self { Self::new(Method::POST, url) }

    #[must_use]
    pub fn header(mut self, name: HeaderName, value: impl Into<String>) -> Self {
        self.headers.push((name, value.into()));
        self
    }

    #[must_use]
    pub fn body(mut self, body: Bytes) -> Self {
        self.body = Some(body);
        self
    }

    /// Serializes `value` as the JSON body.
    pub fn json<T: Serialize + ?Sized>(self, value: &T) -> Result<Self, TransferError> {
        let body = serde_json::to_vec(value).map_err(|e| TransferError::Validation {
            message: format!("cannot encode request body: {e}"),
        })?;
        Ok(self
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(Bytes::from(body)))
    }

    pub fn method(&self) -> &Method { &self.method }

    pub fn url(&self) -> &str { &self.url }

    pub fn header_value(&self, name: &HeaderName) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn body_len(&self) -> usize { self.body.as_ref().map_or(0, Bytes::len) }

    /// Turns the context into a fresh `reqwest` request.
    ///
    /// Header values are checked here so that a malformed value fails as a
    /// validation error instead of a retryable send error.
    fn build(&self, client: &reqwest::Client) -> Result<reqwest::RequestBuilder, TransferError> {
        let mut builder = client.request(self.method.clone(), &self.url);
        for (name, value) in &self.headers {
            let value = HeaderValue::from_str(value).map_err(|_| TransferError::Validation {
                message: format!("invalid value for header {name}: {value:?}"),
            })?;
            builder = builder.header(name, value);
        }
        if let Some(body) = &self.body {
            builder = builder.body(body.clone());
        }
        Ok(builder)
    }
}

/// Error body returned by the storage service.
#[derive(Debug, Default, Deserialize)]
struct ServiceError {
    #[serde(default)]
    code:    String,
    #[serde(default)]
    message: String,
}

/// Issues HTTP requests with retry on server-busy and connection failures
pub struct RetryingExecutor {
    client: reqwest::Client,
    policy: RetryPolicy,
}

impl RetryingExecutor {
    pub const fn new(client: reqwest::Client, policy: RetryPolicy) -> Self {
        Self { client, policy }
    }

    pub const fn policy(&self) -> &RetryPolicy { &self.policy }

    /// Executes `request`, retrying transient failures, and returns the
    /// successful response.
    pub async fn execute(
        &self,
        request: &TransferRequest,
    ) -> Result<reqwest::Response, TransferError> {
        let mut attempt = 0usize;
        self.policy
            .retry(|| {
                attempt += 1;
                self.attempt(request, attempt)
            })
            .await
    }

    /// Executes `request` and decodes the JSON response.
    pub async fn execute_json<T: DeserializeOwned>(
        &self,
        request: &TransferRequest,
    ) -> Result<T, TransferError> {
        let response = self.execute(request).await?;
        response.json().await.context(InvalidResponseSnafu {
            url: request.url(),
        })
    }

    /// Single attempt
    async fn attempt(
        &self,
        request: &TransferRequest,
        attempt: usize,
    ) -> Result<reqwest::Response, TransferError> {
        tracing::debug!(
            method = %request.method,
            url = %request.url,
            attempt,
            body_len = request.body_len(),
            "issuing request"
        );

        let response = match request.build(&self.client)?.send().await {
            Ok(response) => response,
            Err(source) => {
                tracing::debug!(url = %request.url, attempt, error = %source, "request failed without response");
                return Err(TransferError::from_reqwest(source));
            }
        };

        let status = response.status();
        tracing::debug!(url = %request.url, attempt, status = status.as_u16(), "received response");
        if status.is_success() {
            return Ok(response);
        }

        let text = response.text().await.unwrap_or_default();
        let service_error: ServiceError = serde_json::from_str(&text).unwrap_or_else(|_| {
            ServiceError {
                code:    status.canonical_reason().unwrap_or("unknown").to_string(),
                message: text,
            }
        });
        Err(TransferError::Http {
            status:  status.as_u16(),
            url:     request.url.clone(),
            code:    service_error.code,
            message: service_error.message,
        })
    }
}
