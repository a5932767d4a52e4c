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

use std::future::Future;

use futures::future::join_all;

use crate::{
    error::IncompleteBatch,
    lane::{DownloadLane, LaneContext, UploadLane},
    queue::WorkQueue,
    types::{
        DownloadItem, DownloadedFile, LaneOutcome, RemoteFile, TransferReport, Transferred,
        UploadItem,
    },
};

type ItemSource<T> = Box<dyn Iterator<Item = T> + Send>;

/// Number of lanes for a queue of `len_hint` items.
///
/// An unknown length gets the full `max_lanes`.
#[must_use]
pub fn lane_count(len_hint: Option<usize>, max_lanes: usize) -> usize {
    let max_lanes = max_lanes.max(1);
    len_hint.map_or(max_lanes, |len| len.min(max_lanes))
}

/// Runs lanes over `queue` until every lane settles, then collects the
/// leftovers as unattempted.
async fn run_lanes<I, O, F, Fut>(
    queue: WorkQueue<I>,
    max_lanes: usize,
    start_lane: F,
) -> TransferReport<I, O>
where
    I: Send + 'static,
    F: Fn(usize, WorkQueue<I>) -> Fut,
    Fut: Future<Output = LaneOutcome<I, O>>,
{
    let lanes = lane_count(queue.len_hint().await, max_lanes);
    let mut report = TransferReport::new(lanes);
    if lanes == 0 {
        return report;
    }

    tracing::info!(lanes, "starting transfer lanes");
    let outcomes = join_all((0..lanes).map(|id| start_lane(id, queue.clone()))).await;
    for outcome in outcomes {
        report.absorb(outcome);
    }
    report.unattempted = queue.drain().await;

    tracing::info!(
        succeeded = report.succeeded.len(),
        failed = report.failed.len(),
        unattempted = report.unattempted.len(),
        lane_errors = report.lane_errors.len(),
        "transfer finished"
    );
    report
}

/// Work submitted to a coordinator before it runs.
struct Pending<T> {
    items:  Vec<T>,
    source: Option<ItemSource<T>>,
}

impl<T: Send + 'static> Pending<T> {
    const fn new() -> Self {
        Self {
            items:  Vec::new(),
            source: None,
        }
    }

    fn into_queue(self) -> WorkQueue<T> {
        match self.source {
            Some(source) => WorkQueue::new(self.items.into_iter().chain(source)),
            None => WorkQueue::new(self.items),
        }
    }
}

/// Uploads a batch of items into one bucket over up to `max_lanes` lanes.
pub struct ParallelUploader {
    context:   LaneContext,
    bucket_id: String,
    max_lanes: usize,
    pending:   Pending<UploadItem>,
}

impl ParallelUploader {
    pub fn new(context: LaneContext, bucket_id: impl Into<String>, max_lanes: usize) -> Self {
        Self {
            context,
            bucket_id: bucket_id.into(),
            max_lanes,
            pending: Pending::new(),
        }
    }

    pub fn push(&mut self, item: UploadItem) { self.pending.items.push(item); }

    pub fn extend(&mut self, items: impl IntoIterator<Item = UploadItem>) {
        self.pending.items.extend(items);
    }

    /// Pulls further items lazily from `source` once the pushed ones are
    /// taken.
    #[must_use]
    pub fn with_source<S>(mut self, source: S) -> Self
    where
        S: IntoIterator<Item = UploadItem>,
        S::IntoIter: Send + 'static,
    {
        self.pending.source = Some(Box::new(source.into_iter()));
        self
    }

    #[must_use]
    pub const fn max_lanes(mut self, max_lanes: usize) -> Self {
        self.max_lanes = max_lanes;
        self
    }

    pub async fn run(self) -> TransferReport<UploadItem, RemoteFile> {
        let context = self.context;
        let bucket_id = self.bucket_id;
        run_lanes(self.pending.into_queue(), self.max_lanes, |id, queue| {
            UploadLane::new(id, context.clone(), bucket_id.clone()).run(queue)
        })
        .await
    }

    /// Runs the batch and fails unless every item was uploaded.
    pub async fn finish(
        self,
    ) -> Result<Vec<Transferred<UploadItem, RemoteFile>>, IncompleteBatch<UploadItem, RemoteFile>>
    {
        self.run().await.into_result()
    }
}

/// Downloads a batch of items over up to `max_lanes` lanes.
pub struct ParallelDownloader {
    context:   LaneContext,
    max_lanes: usize,
    pending:   Pending<DownloadItem>,
}

impl ParallelDownloader {
    pub const fn new(context: LaneContext, max_lanes: usize) -> Self {
        Self {
            context,
            max_lanes,
            pending: Pending::new(),
        }
    }

    pub fn push(&mut self, item: DownloadItem) { self.pending.items.push(item); }

    pub fn extend(&mut self, items: impl IntoIterator<Item = DownloadItem>) {
        self.pending.items.extend(items);
    }

    #[must_use]
    pub fn with_source<S>(mut self, source: S) -> Self
    where
        S: IntoIterator<Item = DownloadItem>,
        S::IntoIter: Send + 'static,
    {
        self.pending.source = Some(Box::new(source.into_iter()));
        self
    }

    #[must_use]
    pub const fn max_lanes(mut self, max_lanes: usize) -> Self {
        self.max_lanes = max_lanes;
        self
    }

    pub async fn run(self) -> TransferReport<DownloadItem, DownloadedFile> {
        let context = self.context;
        run_lanes(self.pending.into_queue(), self.max_lanes, |id, queue| {
            DownloadLane::new(id, context.clone()).run(queue)
        })
        .await
    }

    pub async fn finish(
        self,
    ) -> Result<
        Vec<Transferred<DownloadItem, DownloadedFile>>,
        IncompleteBatch<DownloadItem, DownloadedFile>,
    > {
        self.run().await.into_result()
    }
}
