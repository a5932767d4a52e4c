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

//! Single-shot and multipart upload requests.
//!
//! A file is sent in one request when it is no larger than
//! `min(large_file_threshold, part_size)`. Anything bigger becomes a large
//! file: one session, parts uploaded strictly in order, and a finish call that
//! lists every part checksum in part order.

use bytes::Bytes;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderName};
use serde::Deserialize;

use crate::{
    client::{CatalogApi, UploadEndpoint},
    digest::{self, ByteRange, ContentDigest},
    error::TransferError,
    retry::{RetryingExecutor, TransferRequest},
    types::{RemoteFile, SeekRead},
};

pub const FILE_NAME_HEADER: HeaderName = HeaderName::from_static("x-bz-file-name");
pub const CONTENT_SHA1_HEADER: HeaderName = HeaderName::from_static("x-bz-content-sha1");
pub const PART_NUMBER_HEADER: HeaderName = HeaderName::from_static("x-bz-part-number");
pub const LAST_MODIFIED_HEADER: HeaderName =
    HeaderName::from_static("x-bz-info-src_last_modified_millis");

/// File-info key carrying the source modification time.
pub const LAST_MODIFIED_INFO_KEY: &str = "src_last_modified_millis";

/// Whether a file of `size` bytes must go through the multipart protocol.
#[must_use]
pub fn requires_chunking(size: u64, large_file_threshold: u64, part_size: u64) -> bool {
    size > large_file_threshold.min(part_size)
}

/// One part of a large file. Numbers start at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartRange {
    pub number: u32,
    pub offset: u64,
    pub length: u64,
}

impl PartRange {
    #[must_use]
    pub const fn range(&self) -> ByteRange { ByteRange::new(self.offset, self.length) }
}

/// Splits `total` bytes into `ceil(total / part_size)` parts; every part but
/// the last is exactly `part_size` long.
pub fn plan_parts(total: u64, part_size: u64) -> Result<Vec<PartRange>, TransferError> {
    if part_size == 0 {
        return Err(TransferError::Validation {
            message: "part size must be positive".to_string(),
        });
    }
    let count = total.div_ceil(part_size);
    (0..count)
        .map(|index| {
            let number = u32::try_from(index + 1).map_err(|_| TransferError::Validation {
                message: format!("{total} bytes would need more than {} parts", u32::MAX),
            })?;
            let offset = index * part_size;
            Ok(PartRange {
                number,
                offset,
                length: part_size.min(total - offset),
            })
        })
        .collect()
}

/// Percent-encodes a file name segment by segment, keeping `/` separators.
#[must_use]
pub fn encode_file_name(name: &str) -> String {
    name.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// Normalised metadata of a file about to be uploaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMeta {
    pub name:                 String,
    pub content_type:         String,
    pub last_modified_millis: i64,
}

/// Bytes of an upload, opened for the duration of one transfer.
pub enum Payload<'a> {
    Buffer(&'a Bytes),
    Reader(&'a mut dyn SeekRead),
}

impl Payload<'_> {
    pub fn digest(&mut self, range: Option<ByteRange>) -> Result<ContentDigest, TransferError> {
        match self {
            Self::Buffer(bytes) => ContentDigest::of_buffer(&bytes[..], range),
            Self::Reader(reader) => ContentDigest::of_stream(&mut **reader, range),
        }
    }

    /// The bytes of `range`, or everything from the start.
    pub fn read(&mut self, range: ByteRange) -> Result<Bytes, TransferError> {
        match self {
            Self::Buffer(bytes) => {
                let len = digest::slice_range(&bytes[..], Some(range))?.len();
                #[allow(clippy::cast_possible_truncation)]
                let start = range.offset as usize;
                Ok(bytes.slice(start..start + len))
            }
            Self::Reader(reader) => digest::read_range(&mut **reader, range),
        }
    }
}

/// Builds the single-shot upload request for a whole file.
#[must_use]
pub fn upload_file_request(
    endpoint: &UploadEndpoint,
    meta: &FileMeta,
    digest: &ContentDigest,
    body: Bytes,
) -> TransferRequest {
    TransferRequest::post(&endpoint.upload_url)
        .header(AUTHORIZATION, &endpoint.authorization_token)
        .header(FILE_NAME_HEADER, encode_file_name(&meta.name))
        .header(CONTENT_TYPE, &meta.content_type)
        .header(CONTENT_SHA1_HEADER, &digest.sha1)
        .header(LAST_MODIFIED_HEADER, meta.last_modified_millis.to_string())
        .body(body)
}

/// Builds the request uploading one part of a large file.
#[must_use]
pub fn upload_part_request(
    endpoint: &UploadEndpoint,
    part: &PartRange,
    digest: &ContentDigest,
    body: Bytes,
) -> TransferRequest {
    TransferRequest::post(&endpoint.upload_url)
        .header(AUTHORIZATION, &endpoint.authorization_token)
        .header(PART_NUMBER_HEADER, part.number.to_string())
        .header(CONTENT_SHA1_HEADER, &digest.sha1)
        .body(body)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadedPart {
    part_number: u32,
}

/// Uploads a whole file in one request.
pub async fn upload_single(
    executor: &RetryingExecutor,
    endpoint: &UploadEndpoint,
    meta: &FileMeta,
    digest: &ContentDigest,
    payload: &mut Payload<'_>,
) -> Result<RemoteFile, TransferError> {
    let body = payload.read(ByteRange::new(0, digest.length))?;
    let request = upload_file_request(endpoint, meta, digest, body);
    executor.execute_json(&request).await
}

/// Drives the multipart protocol for one file.
///
/// Parts are sent one at a time in part order. The first failure aborts the
/// file and leaves the started session unfinished.
pub async fn upload_large_file(
    catalog: &dyn CatalogApi,
    executor: &RetryingExecutor,
    bucket_id: &str,
    meta: &FileMeta,
    total: u64,
    part_size: u64,
    payload: &mut Payload<'_>,
) -> Result<RemoteFile, TransferError> {
    let parts = plan_parts(total, part_size)?;
    let session = catalog.start_large_file(bucket_id, meta).await?;
    tracing::debug!(
        file = %meta.name,
        file_id = %session.file_id,
        parts = parts.len(),
        "started large file"
    );

    let mut checksums = Vec::with_capacity(parts.len());
    for part in &parts {
        let endpoint = catalog.get_upload_part_url(&session.file_id).await?;
        let part_digest = payload.digest(Some(part.range()))?;
        let body = payload.read(part.range())?;
        let request = upload_part_request(&endpoint, part, &part_digest, body);
        let uploaded: UploadedPart = executor.execute_json(&request).await?;
        tracing::debug!(
            file_id = %session.file_id,
            part = uploaded.part_number,
            length = part.length,
            "uploaded part"
        );
        checksums.push(part_digest.sha1);
    }

    catalog.finish_large_file(&session.file_id, &checksums).await
}
