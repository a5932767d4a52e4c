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

use std::{fmt, path::PathBuf};

use snafu::Snafu;
use strum_macros::{Display, EnumString};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum TransferError {
    #[snafu(display("Invalid input: {message}"))]
    Validation { message: String },

    #[snafu(display("Bucket '{name}' not found"))]
    BucketNotFound { name: String },

    #[snafu(display("File not found: {target}"))]
    FileNotFound { target: String },

    #[snafu(display("Network error: {source}"))]
    Network { source: reqwest::Error },

    #[snafu(display("Request error: {source}"))]
    Request { source: reqwest::Error },

    #[snafu(display("HTTP error {status} for URL {url}: {code}: {message}"))]
    Http {
        status:  u16,
        url:     String,
        code:    String,
        message: String,
    },

    #[snafu(display("Gave up after {retries} retries: {source}"))]
    RetriesExhausted {
        retries: usize,
        source:  Box<TransferError>,
    },

    #[snafu(display("Invalid response from {url}: {source}"))]
    InvalidResponse { url: String, source: reqwest::Error },

    #[snafu(display("File read error: {source}"))]
    FileRead { source: std::io::Error },

    #[snafu(display("File write error at {}: {source}", path.display()))]
    FileWrite {
        path:   PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Short read: expected {expected} bytes at offset {offset}, got {actual}"))]
    ShortRead {
        offset:   u64,
        expected: u64,
        actual:   u64,
    },

    #[snafu(display("SHA1 mismatch: expected {expected}, got {actual}"))]
    Sha1Mismatch { expected: String, actual: String },

    #[snafu(display("Missing credential: {name}"))]
    MissingCredential { name: String },

    #[snafu(display("Failed to build HTTP client: {source}"))]
    ClientBuild { source: reqwest::Error },
}

/// Coarse classification of a [`TransferError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    /// Caller input rejected before any request was made.
    Validation,
    /// A name or id did not resolve.
    NotFound,
    /// Server busy or connection failure; absorbed by the retrying executor.
    RetryableTransport,
    /// Any other HTTP failure, or a spent retry budget.
    FatalTransport,
    /// Local read/seek/write failure or integrity mismatch.
    Io,
}

/// Statuses the storage service uses to ask clients to back off.
#[must_use]
pub const fn is_server_busy(status: u16) -> bool { matches!(status, 429 | 503) }

/// Connection-level failures that never produced a response.
///
/// Malformed URLs, redirect-policy violations and body errors are not
/// transient and must not be re-issued.
#[must_use]
pub fn is_transient(source: &reqwest::Error) -> bool {
    source.is_connect() || source.is_timeout() || (source.is_request() && !source.is_builder())
}

impl TransferError {
    /// Wraps a `reqwest` failure as [`Self::Network`] when it is transient and
    /// [`Self::Request`] otherwise.
    #[must_use]
    pub fn from_reqwest(source: reqwest::Error) -> Self {
        if is_transient(&source) {
            Self::Network { source }
        } else {
            Self::Request { source }
        }
    }

    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation { .. } | Self::MissingCredential { .. } | Self::ClientBuild { .. } => {
                ErrorKind::Validation
            }
            Self::BucketNotFound { .. } | Self::FileNotFound { .. } => ErrorKind::NotFound,
            Self::Network { .. } => ErrorKind::RetryableTransport,
            Self::Http { status, .. } if is_server_busy(*status) => ErrorKind::RetryableTransport,
            Self::Http { .. }
            | Self::Request { .. }
            | Self::RetriesExhausted { .. }
            | Self::InvalidResponse { .. } => ErrorKind::FatalTransport,
            Self::FileRead { .. }
            | Self::FileWrite { .. }
            | Self::ShortRead { .. }
            | Self::Sha1Mismatch { .. } => ErrorKind::Io,
        }
    }

    /// Whether the retrying executor should re-issue the request.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::RetryableTransport)
    }

    /// A rejected or expired authorization token.
    #[must_use]
    pub const fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Http { status: 401, .. })
    }

    /// HTTP status of the failure, looking through `RetriesExhausted`.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            Self::RetriesExhausted { source, .. } => source.status(),
            _ => None,
        }
    }
}

/// A coordinator run that did not transfer every item.
///
/// Carries the full partition so callers can inspect what worked, what was
/// tried and failed, and what was never picked up by a lane.
pub struct IncompleteBatch<I, O> {
    pub succeeded:   Vec<crate::types::Transferred<I, O>>,
    pub failed:      Vec<crate::types::FailedTransfer<I>>,
    pub unattempted: Vec<I>,
}

impl<I, O> fmt::Debug for IncompleteBatch<I, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IncompleteBatch")
            .field("succeeded", &self.succeeded.len())
            .field("failed", &self.failed.len())
            .field("unattempted", &self.unattempted.len())
            .finish()
    }
}

impl<I, O> fmt::Display for IncompleteBatch<I, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} transfers failed and {} were never attempted ({} succeeded)",
            self.failed.len(),
            self.unattempted.len(),
            self.succeeded.len()
        )?;
        if let Some(first) = self.failed.first() {
            write!(f, "; first error: {}", first.error)?;
        }
        Ok(())
    }
}

impl<I, O> std::error::Error for IncompleteBatch<I, O> {}
