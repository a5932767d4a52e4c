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

use std::sync::Arc;

use tokio::sync::Mutex;

type Source<T> = Box<dyn Iterator<Item = T> + Send>;

/// Shared FIFO that lanes pull work from.
///
/// The source is consumed lazily, so it may be an iterator of unknown length.
/// Every item is handed to exactly one caller.
pub struct WorkQueue<T> {
    source: Arc<Mutex<Source<T>>>,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        Self {
            source: Arc::clone(&self.source),
        }
    }
}

impl<T: Send + 'static> WorkQueue<T> {
    pub fn new<I>(source: I) -> Self
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
    {
        Self {
            source: Arc::new(Mutex::new(Box::new(source.into_iter()))),
        }
    }

    /// Removes and returns the next item, or `None` once the source is dry.
    pub async fn take_next(&self) -> Option<T> { self.source.lock().await.next() }

    /// Exact remaining length when the source knows it.
    pub async fn len_hint(&self) -> Option<usize> {
        match self.source.lock().await.size_hint() {
            (lower, Some(upper)) if lower == upper => Some(upper),
            _ => None,
        }
    }

    /// Takes everything that is left.
    pub async fn drain(&self) -> Vec<T> { self.source.lock().await.by_ref().collect() }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[tokio::test]
    async fn test_fifo_order_and_drain() {
        let queue = WorkQueue::new(vec![1, 2, 3, 4]);
        assert_eq!(queue.len_hint().await, Some(4));
        assert_eq!(queue.take_next().await, Some(1));
        assert_eq!(queue.take_next().await, Some(2));
        assert_eq!(queue.len_hint().await, Some(2));
        assert_eq!(queue.drain().await, vec![3, 4]);
        assert_eq!(queue.take_next().await, None);
        assert_eq!(queue.len_hint().await, Some(0));
    }

    #[tokio::test]
    async fn test_unknown_length_source() {
        let queue = WorkQueue::new((0..10).filter(|n| n % 2 == 0));
        assert_eq!(queue.len_hint().await, None);
        assert_eq!(queue.drain().await, vec![0, 2, 4, 6, 8]);
    }

    #[tokio::test]
    async fn test_concurrent_takers_never_share_items() {
        let queue = WorkQueue::new(0..1000);
        let takers = (0..8).map(|_| {
            let queue = queue.clone();
            async move {
                let mut taken = Vec::new();
                while let Some(n) = queue.take_next().await {
                    taken.push(n);
                    tokio::task::yield_now().await;
                }
                taken
            }
        });
        let results = futures::future::join_all(takers).await;

        let mut seen = HashSet::new();
        for n in results.into_iter().flatten() {
            assert!(seen.insert(n), "{n} handed out twice");
        }
        assert_eq!(seen.len(), 1000);
    }
}
