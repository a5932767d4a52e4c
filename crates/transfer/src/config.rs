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

use std::fmt;

use bon::Builder;
use jiff::SignedDuration;
use objsync_base::readable_size::ReadableSize;
use serde::Deserialize;
use smart_default::SmartDefault;
use snafu::OptionExt;

use crate::error::{MissingCredentialSnafu, TransferError};

pub const DEFAULT_API_URL: &str = "https://api.backblazeb2.com";
pub const DEFAULT_MAX_LANES: usize = 7;
pub const DEFAULT_MAX_RETRIES: usize = 10;
pub const DEFAULT_BACKOFF_MULTIPLIER: f32 = 1.5;

pub const KEY_ID_ENV: &str = "B2_APPLICATION_KEY_ID";
pub const APPLICATION_KEY_ENV: &str = "B2_APPLICATION_KEY";

/// Backoff settings for the retrying executor
#[derive(Debug, Clone, PartialEq, SmartDefault, Builder, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt (default: 10)
    #[default(DEFAULT_MAX_RETRIES)]
    #[builder(default = DEFAULT_MAX_RETRIES)]
    pub max_retries: usize,

    /// Delay before the first retry (default: 500ms)
    #[default(SignedDuration::from_millis(500))]
    #[builder(default = SignedDuration::from_millis(500))]
    pub base_delay: SignedDuration,

    /// Factor applied to the delay after every retry (default: 1.5)
    #[default(DEFAULT_BACKOFF_MULTIPLIER)]
    #[builder(default = DEFAULT_BACKOFF_MULTIPLIER)]
    pub multiplier: f32,

    /// Upper bound for a single delay (default: 60s)
    #[default(SignedDuration::from_secs(60))]
    #[builder(default = SignedDuration::from_secs(60))]
    pub max_delay: SignedDuration,
}

/// Configuration for the transfer engine
#[derive(Debug, Clone, PartialEq, SmartDefault, Builder, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Base URL used for account authorization
    #[default(DEFAULT_API_URL.to_string())]
    #[builder(default = DEFAULT_API_URL.to_string(), into)]
    pub api_url: String,

    /// Files above min(this, recommended part size) go through the multipart
    /// protocol (default: 3GiB)
    #[default(ReadableSize::gb(3))]
    #[builder(default = ReadableSize::gb(3))]
    pub large_file_threshold: ReadableSize,

    /// Upper bound on concurrent lanes (default: 7)
    #[default(DEFAULT_MAX_LANES)]
    #[builder(default = DEFAULT_MAX_LANES)]
    pub max_lanes: usize,

    #[default(RetryConfig::default())]
    #[builder(default)]
    pub retry: RetryConfig,

    /// Timeout for a single HTTP request (default: 60s)
    #[default(SignedDuration::from_secs(60))]
    #[builder(default = SignedDuration::from_secs(60))]
    pub timeout: SignedDuration,

    /// How long an account authorization is reused (default: 23h)
    #[default(SignedDuration::from_hours(23))]
    #[builder(default = SignedDuration::from_hours(23))]
    pub auth_ttl: SignedDuration,

    /// Custom User-Agent header
    #[builder(into)]
    pub user_agent: Option<String>,
}

/// Application key used to authorize the account.
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct Credentials {
    pub key_id:          String,
    pub application_key: String,
}

impl Credentials {
    pub fn new(key_id: impl Into<String>, application_key: impl Into<String>) -> Self {
        Self {
            key_id:          key_id.into(),
            application_key: application_key.into(),
        }
    }

    /// Reads `B2_APPLICATION_KEY_ID` and `B2_APPLICATION_KEY`, loading a
    /// `.env` file first if one exists.
    pub fn from_env() -> Result<Self, TransferError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub(crate) fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, TransferError> {
        let key_id = lookup(KEY_ID_ENV)
            .filter(|v| !v.is_empty())
            .context(MissingCredentialSnafu { name: KEY_ID_ENV })?;
        let application_key = lookup(APPLICATION_KEY_ENV)
            .filter(|v| !v.is_empty())
            .context(MissingCredentialSnafu {
                name: APPLICATION_KEY_ENV,
            })?;
        Ok(Self {
            key_id,
            application_key,
        })
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("key_id", &self.key_id)
            .field("application_key", &"<redacted>")
            .finish()
    }
}
