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

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD};
use jiff::{SignedDuration, Timestamp};
use reqwest::header::AUTHORIZATION;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::json;
use snafu::ResultExt;
use tokio::sync::Mutex;

use crate::{
    chunked::{FileMeta, LAST_MODIFIED_INFO_KEY},
    config::{Credentials, TransferConfig},
    coordinator::{ParallelDownloader, ParallelUploader},
    error::{ClientBuildSnafu, TransferError},
    lane::LaneContext,
    retry::{RetryPolicy, RetryingExecutor, TransferRequest},
    types::RemoteFile,
};

/// Account authorization returned by `b2_authorize_account`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Authorization {
    pub account_id:                 String,
    pub authorization_token:        String,
    pub api_url:                    String,
    pub download_url:               String,
    pub recommended_part_size:      u64,
    #[serde(default)]
    pub absolute_minimum_part_size: u64,
}

/// URL and token for uploading a file or a part.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadEndpoint {
    pub upload_url:          String,
    pub authorization_token: String,
}

/// Catalog calls the transfer lanes depend on.
#[async_trait]
pub trait CatalogApi: Send + Sync {
    /// Current account authorization, authorizing if needed.
    async fn authorization(&self) -> Result<Arc<Authorization>, TransferError>;

    /// Drops any cached authorization so the next call re-authorizes.
    async fn invalidate_authorization(&self) {}

    async fn get_upload_url(&self, bucket_id: &str) -> Result<UploadEndpoint, TransferError>;

    async fn get_upload_part_url(&self, file_id: &str) -> Result<UploadEndpoint, TransferError>;

    /// Opens a large-file session. The returned file id names the session.
    async fn start_large_file(
        &self,
        bucket_id: &str,
        meta: &FileMeta,
    ) -> Result<RemoteFile, TransferError>;

    async fn finish_large_file(
        &self,
        file_id: &str,
        part_sha1s: &[String],
    ) -> Result<RemoteFile, TransferError>;

    async fn resolve_bucket_id(&self, bucket_name: &str) -> Result<String, TransferError>;
}

struct CachedAuthorization {
    authorization: Arc<Authorization>,
    obtained_at:   Timestamp,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Bucket {
    bucket_id:   String,
    bucket_name: String,
}

#[derive(Debug, Deserialize)]
struct BucketList {
    buckets: Vec<Bucket>,
}

/// [`CatalogApi`] over the JSON API of the storage service.
pub struct StorageClient {
    executor:    Arc<RetryingExecutor>,
    credentials: Credentials,
    api_url:     String,
    auth_ttl:    SignedDuration,
    cache:       Mutex<Option<CachedAuthorization>>,
}

impl StorageClient {
    pub fn new(
        executor: Arc<RetryingExecutor>,
        credentials: Credentials,
        config: &TransferConfig,
    ) -> Self {
        Self {
            executor,
            credentials,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            auth_ttl: config.auth_ttl,
            cache: Mutex::new(None),
        }
    }

    async fn authorize(&self) -> Result<Authorization, TransferError> {
        let basic = STANDARD.encode(format!(
            "{}:{}",
            self.credentials.key_id, self.credentials.application_key
        ));
        let request = TransferRequest::get(format!("{}/b2api/v2/b2_authorize_account", self.api_url))
            .header(AUTHORIZATION, format!("Basic {basic}"));
        self.executor.execute_json(&request).await
    }

    /// POSTs `body` to `operation`, re-authorizing once if the token is
    /// rejected.
    async fn call_api<B, T>(&self, operation: &str, body: &B) -> Result<T, TransferError>
    where
        B: Serialize + Sync + ?Sized,
        T: DeserializeOwned,
    {
        let mut reauthorized = false;
        loop {
            let auth = self.authorization().await?;
            let request = TransferRequest::post(format!("{}/b2api/v2/{operation}", auth.api_url))
                .header(AUTHORIZATION, &auth.authorization_token)
                .json(body)?;
            match self.executor.execute_json(&request).await {
                Err(err) if err.is_unauthorized() && !reauthorized => {
                    tracing::info!(operation, "authorization token rejected, re-authorizing");
                    self.invalidate_authorization().await;
                    reauthorized = true;
                }
                result => return result,
            }
        }
    }
}

#[async_trait]
impl CatalogApi for StorageClient {
    async fn authorization(&self) -> Result<Arc<Authorization>, TransferError> {
        let mut cache = self.cache.lock().await;
        let now = Timestamp::now();
        let fresh = cache.as_ref().filter(|cached| {
            cached
                .obtained_at
                .checked_add(self.auth_ttl)
                .is_ok_and(|expires| now < expires)
        });
        if let Some(cached) = fresh {
            return Ok(Arc::clone(&cached.authorization));
        }

        let authorization = Arc::new(self.authorize().await?);
        tracing::info!(
            account_id = %authorization.account_id,
            api_url = %authorization.api_url,
            recommended_part_size = authorization.recommended_part_size,
            "authorized account"
        );
        *cache = Some(CachedAuthorization {
            authorization: Arc::clone(&authorization),
            obtained_at:   now,
        });
        Ok(authorization)
    }

    async fn invalidate_authorization(&self) { self.cache.lock().await.take(); }

    async fn get_upload_url(&self, bucket_id: &str) -> Result<UploadEndpoint, TransferError> {
        self.call_api("b2_get_upload_url", &json!({ "bucketId": bucket_id }))
            .await
    }

    async fn get_upload_part_url(&self, file_id: &str) -> Result<UploadEndpoint, TransferError> {
        self.call_api("b2_get_upload_part_url", &json!({ "fileId": file_id }))
            .await
    }

    async fn start_large_file(
        &self,
        bucket_id: &str,
        meta: &FileMeta,
    ) -> Result<RemoteFile, TransferError> {
        let body = json!({
            "bucketId": bucket_id,
            "fileName": meta.name,
            "contentType": meta.content_type,
            "fileInfo": { LAST_MODIFIED_INFO_KEY: meta.last_modified_millis.to_string() },
        });
        self.call_api("b2_start_large_file", &body).await
    }

    async fn finish_large_file(
        &self,
        file_id: &str,
        part_sha1s: &[String],
    ) -> Result<RemoteFile, TransferError> {
        let body = json!({ "fileId": file_id, "partSha1Array": part_sha1s });
        self.call_api("b2_finish_large_file", &body).await
    }

    async fn resolve_bucket_id(&self, bucket_name: &str) -> Result<String, TransferError> {
        let account_id = self.authorization().await?.account_id.clone();
        let list: BucketList = self
            .call_api(
                "b2_list_buckets",
                &json!({ "accountId": account_id, "bucketName": bucket_name }),
            )
            .await?;
        list.buckets
            .into_iter()
            .find(|bucket| bucket.bucket_name == bucket_name)
            .map(|bucket| bucket.bucket_id)
            .ok_or_else(|| TransferError::BucketNotFound {
                name: bucket_name.to_string(),
            })
    }
}

/// Entry point: wires the HTTP client, retry policy and catalog together and
/// hands out coordinators.
pub struct TransferClient {
    config:   TransferConfig,
    catalog:  Arc<dyn CatalogApi>,
    executor: Arc<RetryingExecutor>,
}

impl TransferClient {
    pub fn new(config: TransferConfig, credentials: Credentials) -> Result<Self, TransferError> {
        let executor = Arc::new(RetryingExecutor::new(
            Self::create_http_client(&config)?,
            RetryPolicy::from(&config.retry),
        ));
        let catalog = Arc::new(StorageClient::new(
            Arc::clone(&executor),
            credentials,
            &config,
        ));
        Ok(Self {
            config,
            catalog,
            executor,
        })
    }

    /// Like [`TransferClient::new`] with credentials from the environment.
    pub fn from_env(config: TransferConfig) -> Result<Self, TransferError> {
        Self::new(config, Credentials::from_env()?)
    }

    /// Uses a caller-provided catalog instead of [`StorageClient`].
    pub fn with_catalog(
        config: TransferConfig,
        catalog: Arc<dyn CatalogApi>,
        executor: Arc<RetryingExecutor>,
    ) -> Self {
        Self {
            config,
            catalog,
            executor,
        }
    }

    pub const fn config(&self) -> &TransferConfig { &self.config }

    pub fn catalog(&self) -> Arc<dyn CatalogApi> { Arc::clone(&self.catalog) }

    fn lane_context(&self) -> LaneContext {
        LaneContext {
            catalog:              Arc::clone(&self.catalog),
            executor:             Arc::clone(&self.executor),
            large_file_threshold: self.config.large_file_threshold.as_bytes(),
        }
    }

    pub fn uploader(&self, bucket_id: impl Into<String>) -> ParallelUploader {
        ParallelUploader::new(self.lane_context(), bucket_id, self.config.max_lanes)
    }

    /// Resolves `bucket_name` and returns an uploader for it.
    pub async fn uploader_for_bucket(
        &self,
        bucket_name: &str,
    ) -> Result<ParallelUploader, TransferError> {
        let bucket_id = self.catalog.resolve_bucket_id(bucket_name).await?;
        Ok(self.uploader(bucket_id))
    }

    pub fn downloader(&self) -> ParallelDownloader {
        ParallelDownloader::new(self.lane_context(), self.config.max_lanes)
    }

    fn create_http_client(config: &TransferConfig) -> Result<reqwest::Client, TransferError> {
        let timeout =
            Duration::try_from(config.timeout).map_err(|_| TransferError::Validation {
                message: format!("timeout must not be negative: {}", config.timeout),
            })?;
        let mut builder = reqwest::Client::builder().timeout(timeout);

        if let Some(ref ua) = config.user_agent {
            builder = builder.user_agent(ua);
        }

        builder.build().context(ClientBuildSnafu)
    }
}
