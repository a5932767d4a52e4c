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

pub mod chunked;
pub mod client;
mod config;
mod coordinator;
pub mod digest;
mod error;
pub mod lane;
mod queue;
pub mod retry;
mod types;

pub use client::{Authorization, CatalogApi, StorageClient, TransferClient, UploadEndpoint};
pub use config::{
    APPLICATION_KEY_ENV, Credentials, DEFAULT_API_URL, KEY_ID_ENV, RetryConfig, TransferConfig,
};
pub use coordinator::{ParallelDownloader, ParallelUploader, lane_count};
pub use digest::{ByteRange, ContentDigest};
pub use error::{ErrorKind, IncompleteBatch, TransferError, is_server_busy, is_transient};
pub use lane::LaneContext;
pub use queue::WorkQueue;
pub use retry::{RetryPolicy, RetryingExecutor, TransferRequest};
pub use types::{
    DownloadItem, DownloadSink, DownloadTarget, Downloaded, DownloadedFile, FailedTransfer,
    LaneOutcome, RemoteFile, SeekRead, TransferReport, Transferred, UploadItem, UploadSource,
    Uploaded,
};
