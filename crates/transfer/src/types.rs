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

use std::{
    fmt,
    io::{Read, Seek},
    path::PathBuf,
};

use bon::Builder;
use bytes::Bytes;
use jiff::Timestamp;
use serde::{Deserialize, Serialize};

use crate::{
    digest::ContentDigest,
    error::{IncompleteBatch, TransferError},
};

/// A readable, seekable byte source that can move between tasks.
pub trait SeekRead: Read + Seek + Send {}

impl<T: Read + Seek + Send> SeekRead for T {}

/// Where the bytes of an upload come from.
pub enum UploadSource {
    /// Bytes already in memory.
    Buffer(Bytes),
    /// A local file, opened when a lane picks the item up and closed when its
    /// transfer ends.
    File(PathBuf),
    /// A caller-owned stream. Offsets are relative to its position when the
    /// lane first touches it.
    Stream(Box<dyn SeekRead>),
}

impl fmt::Debug for UploadSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Buffer(bytes) => f.debug_tuple("Buffer").field(&bytes.len()).finish(),
            Self::File(path) => f.debug_tuple("File").field(path).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

impl From<Bytes> for UploadSource {
    fn from(bytes: Bytes) -> Self { Self::Buffer(bytes) }
}

impl From<Vec<u8>> for UploadSource {
    fn from(bytes: Vec<u8>) -> Self { Self::Buffer(Bytes::from(bytes)) }
}

impl From<PathBuf> for UploadSource {
    fn from(path: PathBuf) -> Self { Self::File(path) }
}

/// One file to upload.
///
/// Everything except `name` and `source` is optional; lanes fill in the
/// content type, last-modified time and digest before sending.
#[derive(Debug, Builder)]
pub struct UploadItem {
    /// Destination file name in the bucket.
    #[builder(into)]
    pub name:          String,
    #[builder(into)]
    pub source:        UploadSource,
    #[builder(into)]
    pub content_type:  Option<String>,
    pub last_modified: Option<Timestamp>,
    /// Precomputed SHA-1 and length. When present the lane trusts it.
    pub digest:        Option<ContentDigest>,
}

impl UploadItem {
    pub fn new(name: impl Into<String>, source: impl Into<UploadSource>) -> Self {
        Self {
            name:          name.into(),
            source:        source.into(),
            content_type:  None,
            last_modified: None,
            digest:        None,
        }
    }
}

/// Which remote file a download refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadTarget {
    ById { file_id: String },
    ByName { bucket_name: String, file_name: String },
}

impl fmt::Display for DownloadTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ById { file_id } => write!(f, "file id {file_id}"),
            Self::ByName {
                bucket_name,
                file_name,
            } => write!(f, "{bucket_name}/{file_name}"),
        }
    }
}

/// Where downloaded bytes go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadSink {
    /// Collect the body and return it in [`DownloadedFile::data`].
    Memory,
    /// Write to this path (via a temporary `.download` file).
    File(PathBuf),
}

/// One file to download.
#[derive(Debug, Clone)]
pub struct DownloadItem {
    pub target: DownloadTarget,
    pub sink:   DownloadSink,
}

impl DownloadItem {
    pub fn by_id(file_id: impl Into<String>, sink: DownloadSink) -> Self {
        Self {
            target: DownloadTarget::ById {
                file_id: file_id.into(),
            },
            sink,
        }
    }

    pub fn by_name(
        bucket_name: impl Into<String>,
        file_name: impl Into<String>,
        sink: DownloadSink,
    ) -> Self {
        Self {
            target: DownloadTarget::ByName {
                bucket_name: bucket_name.into(),
                file_name:   file_name.into(),
            },
            sink,
        }
    }
}

/// Remote file descriptor returned by the storage service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteFile {
    pub file_id:          String,
    pub file_name:        String,
    #[serde(default)]
    pub content_length:   u64,
    /// Lowercase hex SHA-1, or `"none"` for files assembled from parts.
    #[serde(default)]
    pub content_sha1:     Option<String>,
    #[serde(default)]
    pub content_type:     Option<String>,
    /// Milliseconds since the epoch.
    #[serde(default)]
    pub upload_timestamp: i64,
}

/// Result of one download.
#[derive(Debug, Clone)]
pub struct DownloadedFile {
    pub file: RemoteFile,
    /// The body, for [`DownloadSink::Memory`] only.
    pub data: Option<Bytes>,
}

/// A work item paired with what the transfer produced.
#[derive(Debug)]
pub struct Transferred<I, O> {
    pub item:   I,
    pub output: O,
}

/// A work item that a lane attempted and could not transfer.
#[derive(Debug)]
pub struct FailedTransfer<I> {
    pub item:  I,
    pub error: TransferError,
}

pub type Uploaded = Transferred<UploadItem, RemoteFile>;
pub type Downloaded = Transferred<DownloadItem, DownloadedFile>;

/// Append-only results of one lane.
#[derive(Debug)]
pub struct LaneOutcome<I, O> {
    pub succeeded:  Vec<Transferred<I, O>>,
    pub failed:     Vec<FailedTransfer<I>>,
    /// Set when the lane could not start and processed nothing.
    pub start_error: Option<TransferError>,
}

impl<I, O> Default for LaneOutcome<I, O> {
    fn default() -> Self {
        Self {
            succeeded:   Vec::new(),
            failed:      Vec::new(),
            start_error: None,
        }
    }
}

/// Everything a coordinator run produced.
///
/// Every submitted item is in exactly one of `succeeded`, `failed` or
/// `unattempted`.
#[derive(Debug)]
pub struct TransferReport<I, O> {
    /// Number of lanes the run started.
    pub lanes:       usize,
    pub succeeded:   Vec<Transferred<I, O>>,
    pub failed:      Vec<FailedTransfer<I>>,
    /// Items still queued after every lane settled.
    pub unattempted: Vec<I>,
    /// Why lanes that never processed an item failed to start.
    pub lane_errors: Vec<TransferError>,
}

impl<I, O> TransferReport<I, O> {
    pub(crate) const fn new(lanes: usize) -> Self {
        Self {
            lanes,
            succeeded: Vec::new(),
            failed: Vec::new(),
            unattempted: Vec::new(),
            lane_errors: Vec::new(),
        }
    }

    pub(crate) fn absorb(&mut self, lane: LaneOutcome<I, O>) {
        self.succeeded.extend(lane.succeeded);
        self.failed.extend(lane.failed);
        self.lane_errors.extend(lane.start_error);
    }

    #[must_use]
    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failed.len() + self.unattempted.len()
    }

    #[must_use]
    pub fn is_complete(&self) -> bool { self.failed.is_empty() && self.unattempted.is_empty() }

    /// The success list if nothing failed, otherwise all three partitions.
    pub fn into_result(self) -> Result<Vec<Transferred<I, O>>, IncompleteBatch<I, O>> {
        if self.is_complete() {
            Ok(self.succeeded)
        } else {
            Err(IncompleteBatch {
                succeeded:   self.succeeded,
                failed:      self.failed,
                unattempted: self.unattempted,
            })
        }
    }
}
