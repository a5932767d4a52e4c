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

//! Transfer lanes.
//!
//! A lane is a sequential worker: it pulls one item at a time from the shared
//! queue, transfers it, records the outcome and moves on. A failed item never
//! stops the lane. A lane that cannot start (no upload endpoint, no
//! authorization) processes nothing and leaves the queue to its siblings.

use std::{
    ffi::OsString,
    path::{Path, PathBuf},
    sync::Arc,
};

use bytes::{Bytes, BytesMut};
use jiff::Timestamp;
use reqwest::header::{AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, HeaderMap};
use sha1::{Digest, Sha1};
use snafu::{ResultExt, ensure};
use tokio::io::AsyncWriteExt;
use tracing::Instrument;

use crate::{
    chunked::{
        self, CONTENT_SHA1_HEADER, FILE_NAME_HEADER, FileMeta, Payload, encode_file_name,
        requires_chunking,
    },
    client::{Authorization, CatalogApi, UploadEndpoint},
    digest::ContentDigest,
    error::{
        FileReadSnafu, FileWriteSnafu, Sha1MismatchSnafu, ShortReadSnafu,
        TransferError, ValidationSnafu,
    },
    queue::WorkQueue,
    retry::{RetryingExecutor, TransferRequest},
    types::{
        DownloadItem, DownloadSink, DownloadTarget, DownloadedFile, FailedTransfer, LaneOutcome,
        RemoteFile, Transferred, UploadItem, UploadSource,
    },
};

/// Content type that asks the service to pick one from the file name.
pub const DEFAULT_CONTENT_TYPE: &str = "b2/x-auto";
pub const MAX_FILE_NAME_BYTES: usize = 1024;

const FILE_ID_HEADER: &str = "x-bz-file-id";
const UPLOAD_TIMESTAMP_HEADER: &str = "x-bz-upload-timestamp";
const LARGE_FILE_SHA1_HEADER: &str = "x-bz-info-large_file_sha1";
const UNVERIFIED_PREFIX: &str = "unverified:";
const NO_CHECKSUM: &str = "none";

/// Collaborators shared by every lane of a run.
#[derive(Clone)]
pub struct LaneContext {
    pub catalog:              Arc<dyn CatalogApi>,
    pub executor:             Arc<RetryingExecutor>,
    pub large_file_threshold: u64,
}

/// Uploads items into one bucket.
pub struct UploadLane {
    id:        usize,
    context:   LaneContext,
    bucket_id: String,
}

impl UploadLane {
    pub fn new(id: usize, context: LaneContext, bucket_id: impl Into<String>) -> Self {
        Self {
            id,
            context,
            bucket_id: bucket_id.into(),
        }
    }

    pub async fn run(self, queue: WorkQueue<UploadItem>) -> LaneOutcome<UploadItem, RemoteFile> {
        let span = tracing::info_span!("upload_lane", lane = self.id);
        self.run_inner(queue).instrument(span).await
    }

    async fn run_inner(&self, queue: WorkQueue<UploadItem>) -> LaneOutcome<UploadItem, RemoteFile> {
        let mut outcome = LaneOutcome::default();

        // The endpoint is held for the whole run.
        let (endpoint, part_size) = match self.start().await {
            Ok(started) => started,
            Err(error) => {
                tracing::warn!(error = %error, "lane failed to start");
                outcome.start_error = Some(error);
                return outcome;
            }
        };
        tracing::debug!(part_size, "lane started");

        while let Some(mut item) = queue.take_next().await {
            match self.upload(&endpoint, part_size, &mut item).await {
                Ok(file) => {
                    tracing::debug!(file = %item.name, file_id = %file.file_id, "uploaded");
                    outcome.succeeded.push(Transferred { item, output: file });
                }
                Err(error) => {
                    tracing::warn!(file = %item.name, error = %error, "upload failed");
                    outcome.failed.push(FailedTransfer { item, error });
                }
            }
        }

        tracing::info!(
            succeeded = outcome.succeeded.len(),
            failed = outcome.failed.len(),
            "lane finished"
        );
        outcome
    }

    async fn start(&self) -> Result<(UploadEndpoint, u64), TransferError> {
        let authorization = self.context.catalog.authorization().await?;
        let endpoint = self.context.catalog.get_upload_url(&self.bucket_id).await?;
        Ok((endpoint, authorization.recommended_part_size))
    }

    async fn upload(
        &self,
        endpoint: &UploadEndpoint,
        part_size: u64,
        item: &mut UploadItem,
    ) -> Result<RemoteFile, TransferError> {
        let meta = normalize(item)?;
        let digest = &mut item.digest;
        match &mut item.source {
            UploadSource::Buffer(bytes) => {
                self.send(endpoint, part_size, &meta, digest, Payload::Buffer(bytes))
                    .await
            }
            UploadSource::File(path) => {
                // Closed when this arm ends, whatever the outcome.
                let mut file = std::fs::File::open(&*path).context(FileReadSnafu)?;
                self.send(endpoint, part_size, &meta, digest, Payload::Reader(&mut file))
                    .await
            }
            UploadSource::Stream(stream) => {
                self.send(
                    endpoint,
                    part_size,
                    &meta,
                    digest,
                    Payload::Reader(stream.as_mut()),
                )
                .await
            }
        }
    }

    async fn send(
        &self,
        endpoint: &UploadEndpoint,
        part_size: u64,
        meta: &FileMeta,
        digest: &mut Option<ContentDigest>,
        mut payload: Payload<'_>,
    ) -> Result<RemoteFile, TransferError> {
        let digest = match digest.as_ref() {
            Some(known) => known.clone(),
            None => {
                let measured = payload.digest(None)?;
                *digest = Some(measured.clone());
                measured
            }
        };

        if requires_chunking(digest.length, self.context.large_file_threshold, part_size) {
            chunked::upload_large_file(
                self.context.catalog.as_ref(),
                &self.context.executor,
                &self.bucket_id,
                meta,
                digest.length,
                part_size,
                &mut payload,
            )
            .await
        } else {
            chunked::upload_single(&self.context.executor, endpoint, meta, &digest, &mut payload)
                .await
        }
    }
}

/// Validates the item's name and fills in defaults, writing them back into
/// the item.
pub fn normalize(item: &mut UploadItem) -> Result<FileMeta, TransferError> {
    let name = item.name.trim_start_matches(['/', '\\']);
    ensure!(
        !name.is_empty(),
        ValidationSnafu {
            message: format!("file name {:?} is empty", item.name),
        }
    );
    ensure!(
        name.len() <= MAX_FILE_NAME_BYTES,
        ValidationSnafu {
            message: format!(
                "file name is {} bytes, the limit is {MAX_FILE_NAME_BYTES}",
                name.len()
            ),
        }
    );
    ensure!(
        !name.chars().any(char::is_control),
        ValidationSnafu {
            message: format!("file name {name:?} contains control characters"),
        }
    );
    item.name = name.to_string();

    let content_type = item
        .content_type
        .get_or_insert_with(|| DEFAULT_CONTENT_TYPE.to_string())
        .clone();

    let last_modified = *item.last_modified.get_or_insert_with(|| match &item.source {
        UploadSource::File(path) => file_modified(path).unwrap_or_else(Timestamp::now),
        UploadSource::Buffer(_) | UploadSource::Stream(_) => Timestamp::now(),
    });

    Ok(FileMeta {
        name: item.name.clone(),
        content_type,
        last_modified_millis: last_modified.as_millisecond(),
    })
}

fn file_modified(path: &Path) -> Option<Timestamp> {
    let modified = std::fs::metadata(path).and_then(|m| m.modified()).ok()?;
    Timestamp::try_from(modified).ok()
}

/// Downloads items by id or by name.
pub struct DownloadLane {
    id:      usize,
    context: LaneContext,
}

impl DownloadLane {
    pub const fn new(id: usize, context: LaneContext) -> Self { Self { id, context } }

    pub async fn run(
        self,
        queue: WorkQueue<DownloadItem>,
    ) -> LaneOutcome<DownloadItem, DownloadedFile> {
        let span = tracing::info_span!("download_lane", lane = self.id);
        self.run_inner(queue).instrument(span).await
    }

    async fn run_inner(
        &self,
        queue: WorkQueue<DownloadItem>,
    ) -> LaneOutcome<DownloadItem, DownloadedFile> {
        let mut outcome = LaneOutcome::default();

        if let Err(error) = self.context.catalog.authorization().await {
            tracing::warn!(error = %error, "lane failed to start");
            outcome.start_error = Some(error);
            return outcome;
        }

        while let Some(item) = queue.take_next().await {
            match self.download(&item).await {
                Ok(file) => {
                    tracing::debug!(target_file = %item.target, length = file.file.content_length, "downloaded");
                    outcome.succeeded.push(Transferred { item, output: file });
                }
                Err(error) => {
                    tracing::warn!(target_file = %item.target, error = %error, "download failed");
                    outcome.failed.push(FailedTransfer { item, error });
                }
            }
        }

        tracing::info!(
            succeeded = outcome.succeeded.len(),
            failed = outcome.failed.len(),
            "lane finished"
        );
        outcome
    }

    async fn download(&self, item: &DownloadItem) -> Result<DownloadedFile, TransferError> {
        let mut reauthorized = false;
        let response = loop {
            let authorization = self.context.catalog.authorization().await?;
            let request = download_request(&authorization, &item.target);
            match self.context.executor.execute(&request).await {
                Ok(response) => break response,
                Err(error) if error.is_unauthorized() && !reauthorized => {
                    self.context.catalog.invalidate_authorization().await;
                    reauthorized = true;
                }
                Err(error) if error.status() == Some(404) => {
                    return Err(TransferError::FileNotFound {
                        target: item.target.to_string(),
                    });
                }
                Err(error) => return Err(error),
            }
        };

        receive(response, item).await
    }
}

/// Builds the GET for a download target.
#[must_use]
pub fn download_request(authorization: &Authorization, target: &DownloadTarget) -> TransferRequest {
    let base = authorization.download_url.trim_end_matches('/');
    let url = match target {
        DownloadTarget::ById { file_id } => format!(
            "{base}/b2api/v2/b2_download_file_by_id?fileId={}",
            urlencoding::encode(file_id)
        ),
        DownloadTarget::ByName {
            bucket_name,
            file_name,
        } => format!(
            "{base}/file/{}/{}",
            urlencoding::encode(bucket_name),
            encode_file_name(file_name.trim_start_matches('/'))
        ),
    };
    TransferRequest::get(url).header(AUTHORIZATION, &authorization.authorization_token)
}

/// Where the body of one download is going.
enum SinkWriter {
    Memory(BytesMut),
    File {
        file:        tokio::fs::File,
        temp_path:   PathBuf,
        target_path: PathBuf,
    },
}

impl SinkWriter {
    async fn open(sink: &DownloadSink) -> Result<Self, TransferError> {
        match sink {
            DownloadSink::Memory => Ok(Self::Memory(BytesMut::new())),
            DownloadSink::File(path) => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .context(FileWriteSnafu { path: parent })?;
                }
                let temp_path = temp_path_for(path);
                let file = tokio::fs::File::create(&temp_path)
                    .await
                    .context(FileWriteSnafu { path: &temp_path })?;
                Ok(Self::File {
                    file,
                    temp_path,
                    target_path: path.clone(),
                })
            }
        }
    }

    async fn write(&mut self, chunk: &[u8]) -> Result<(), TransferError> {
        match self {
            Self::Memory(buffer) => {
                buffer.extend_from_slice(chunk);
                Ok(())
            }
            Self::File {
                file, temp_path, ..
            } => file
                .write_all(chunk)
                .await
                .context(FileWriteSnafu { path: &*temp_path }),
        }
    }

    /// Flushes and moves the file into place, or hands back the buffer.
    async fn commit(self) -> Result<Option<Bytes>, TransferError> {
        match self {
            Self::Memory(buffer) => Ok(Some(buffer.freeze())),
            Self::File {
                mut file,
                temp_path,
                target_path,
            } => {
                file.flush()
                    .await
                    .context(FileWriteSnafu { path: &temp_path })?;
                drop(file);
                if let Err(source) = tokio::fs::rename(&temp_path, &target_path).await {
                    let _ = tokio::fs::remove_file(&temp_path).await;
                    return Err(source).context(FileWriteSnafu { path: &target_path });
                }
                Ok(None)
            }
        }
    }

    async fn discard(self) {
        if let Self::File {
            file, temp_path, ..
        } = self
        {
            drop(file);
            let _ = tokio::fs::remove_file(&temp_path).await;
        }
    }
}

fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".download");
    PathBuf::from(name)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Checksum the downloaded bytes must match, if the service gave a usable one.
fn expected_sha1(headers: &HeaderMap) -> Option<String> {
    let declared = header_str(headers, CONTENT_SHA1_HEADER.as_str())
        .filter(|v| *v != NO_CHECKSUM)
        .or_else(|| header_str(headers, LARGE_FILE_SHA1_HEADER))?;
    let declared = declared.strip_prefix(UNVERIFIED_PREFIX).unwrap_or(declared);
    (declared != NO_CHECKSUM).then(|| declared.to_ascii_lowercase())
}

async fn receive(
    mut response: reqwest::Response,
    item: &DownloadItem,
) -> Result<DownloadedFile, TransferError> {
    let headers = response.headers().clone();
    let mut writer = SinkWriter::open(&item.sink).await?;

    let mut hasher = Sha1::new();
    let mut received = 0u64;
    let streamed: Result<(), TransferError> = async {
        while let Some(chunk) = response.chunk().await.map_err(TransferError::from_reqwest)? {
            hasher.update(&chunk);
            received += chunk.len() as u64;
            writer.write(&chunk).await?;
        }
        Ok(())
    }
    .await;

    let verified = streamed.and_then(|()| {
        let actual = format!("{:x}", hasher.finalize());
        verify(&headers, received, &actual)?;
        Ok(actual)
    });
    let actual_sha1 = match verified {
        Ok(actual) => actual,
        Err(error) => {
            writer.discard().await;
            return Err(error);
        }
    };
    let data = writer.commit().await?;

    Ok(DownloadedFile {
        file: remote_file_from_headers(&headers, &item.target, received, actual_sha1),
        data,
    })
}

fn verify(headers: &HeaderMap, received: u64, actual_sha1: &str) -> Result<(), TransferError> {
    if let Some(expected) = header_str(headers, CONTENT_LENGTH.as_str())
        .and_then(|v| v.parse::<u64>().ok())
    {
        ensure!(
            expected == received,
            ShortReadSnafu {
                offset:   0u64,
                expected,
                actual:   received,
            }
        );
    }
    if let Some(expected) = expected_sha1(headers) {
        ensure!(
            expected == actual_sha1,
            Sha1MismatchSnafu {
                expected,
                actual: actual_sha1,
            }
        );
    }
    Ok(())
}

fn remote_file_from_headers(
    headers: &HeaderMap,
    target: &DownloadTarget,
    received: u64,
    actual_sha1: String,
) -> RemoteFile {
    let file_id = header_str(headers, FILE_ID_HEADER).map_or_else(
        || match target {
            DownloadTarget::ById { file_id } => file_id.clone(),
            DownloadTarget::ByName { .. } => String::new(),
        },
        str::to_string,
    );
    let file_name = header_str(headers, FILE_NAME_HEADER.as_str())
        .map(|v| urlencoding::decode(v).map_or_else(|_| v.to_string(), |d| d.into_owned()))
        .unwrap_or_else(|| match target {
            DownloadTarget::ByName { file_name, .. } => file_name.clone(),
            DownloadTarget::ById { .. } => String::new(),
        });
    RemoteFile {
        file_id,
        file_name,
        content_length: received,
        content_sha1: Some(actual_sha1),
        content_type: header_str(headers, CONTENT_TYPE.as_str()).map(str::to_string),
        upload_timestamp: header_str(headers, UPLOAD_TIMESTAMP_HEADER)
            .and_then(|v| v.parse().ok())
            .unwrap_or_default(),
    }
}
