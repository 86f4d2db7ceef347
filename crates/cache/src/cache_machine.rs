//! Bounded, internally synchronized batch buffer between two kernels.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use gfq_common::{global_metrics, EngineConfig, GfqError, Result};
use tokio::sync::{Mutex, Notify};

use crate::cache_data::CacheData;

/// Sub-cache id used when callers do not name one.
pub const DEFAULT_CACHE_ID: &str = "";

struct CacheState {
    queues: HashMap<String, VecDeque<CacheData>>,
    finished: bool,
}

impl CacheState {
    fn queued(&self) -> usize {
        self.queues.values().map(VecDeque::len).sum()
    }
}

/// A bounded buffer of [`CacheData`] entries sitting on one edge of the
/// execution graph.
///
/// Supports multiple producers and a single logical consumer per sub-cache.
/// Once [`CacheMachine::finish`] is called no further batches are accepted
/// and pulls drain the remaining entries before returning `None`.
pub struct CacheMachine {
    name: String,
    flow_control_batches: usize,
    state: Mutex<CacheState>,
    notify: Notify,
    batches_added: AtomicU64,
    rows_added: AtomicU64,
}

impl CacheMachine {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_flow_control(name, EngineConfig::default().cache_flow_control_batches)
    }

    pub fn with_flow_control(name: impl Into<String>, flow_control_batches: usize) -> Self {
        Self {
            name: name.into(),
            flow_control_batches: flow_control_batches.max(1),
            state: Mutex::new(CacheState {
                queues: HashMap::new(),
                finished: false,
            }),
            notify: Notify::new(),
            batches_added: AtomicU64::new(0),
            rows_added: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Batches ever accepted by this machine, across all sub-caches.
    pub fn num_batches_added(&self) -> u64 {
        self.batches_added.load(Ordering::SeqCst)
    }

    /// Rows ever accepted by this machine, across all sub-caches.
    pub fn num_rows_added(&self) -> u64 {
        self.rows_added.load(Ordering::SeqCst)
    }

    /// Push a batch into the named sub-cache.
    ///
    /// Suspends while the machine is at its flow-control limit. Pushing into
    /// a finished machine fails loudly unless `quiet_fail` is set, in which
    /// case the batch is dropped and `Ok(false)` is returned.
    pub async fn add_to_cache(
        &self,
        data: CacheData,
        cache_id: &str,
        quiet_fail: bool,
    ) -> Result<bool> {
        let rows = data.num_rows() as u64;
        let mut slot = Some(data);
        let accepted = self
            .wait_until(|s| {
                if s.finished {
                    return Some(if quiet_fail {
                        Ok(false)
                    } else {
                        Err(GfqError::Execution(format!(
                            "cache '{}' is finished and cannot accept more batches",
                            self.name
                        )))
                    });
                }
                if s.queued() < self.flow_control_batches {
                    if let Some(d) = slot.take() {
                        s.queues
                            .entry(cache_id.to_string())
                            .or_default()
                            .push_back(d);
                    }
                    return Some(Ok(true));
                }
                None
            })
            .await?;

        if accepted {
            self.batches_added.fetch_add(1, Ordering::SeqCst);
            self.rows_added.fetch_add(rows, Ordering::SeqCst);
            global_metrics().record_cache_add(&self.name, rows);
            self.notify.notify_waiters();
        }
        Ok(accepted)
    }

    /// Blocking pop from the default sub-cache; `None` once finished and empty.
    pub async fn pull_cache_data(&self) -> Option<CacheData> {
        self.pull_from_cache(DEFAULT_CACHE_ID).await
    }

    /// Blocking pop from a named sub-cache; `None` once finished and empty.
    pub async fn pull_from_cache(&self, cache_id: &str) -> Option<CacheData> {
        let pulled = self
            .wait_until(|s| {
                if let Some(q) = s.queues.get_mut(cache_id) {
                    if let Some(d) = q.pop_front() {
                        return Some(Some(d));
                    }
                }
                if s.finished {
                    return Some(None);
                }
                None
            })
            .await;
        if pulled.is_some() {
            global_metrics().record_cache_pull(&self.name);
            // Space freed; wake any producer parked on flow control.
            self.notify.notify_waiters();
        }
        pulled
    }

    /// Signal that no more data will ever arrive.
    pub async fn finish(&self) {
        let mut s = self.state.lock().await;
        s.finished = true;
        self.notify.notify_waiters();
    }

    pub async fn is_finished(&self) -> bool {
        self.state.lock().await.finished
    }

    /// Suspend until producers have signaled completion.
    pub async fn wait_until_finished(&self) {
        self.wait_until(|s| if s.finished { Some(()) } else { None })
            .await;
    }

    /// Suspend until a batch is available in the default sub-cache (`true`)
    /// or the machine is finished and empty (`false`). Does not pop.
    pub async fn wait_for_next(&self) -> bool {
        self.wait_until(|s| {
            let has_data = s
                .queues
                .get(DEFAULT_CACHE_ID)
                .is_some_and(|q| !q.is_empty());
            if has_data {
                Some(true)
            } else if s.finished {
                Some(false)
            } else {
                None
            }
        })
        .await
    }

    /// Suspend until the machine has accepted at least `count` batches.
    pub async fn wait_for_count(&self, count: u64) {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        loop {
            notified.as_mut().enable();
            if self.batches_added.load(Ordering::SeqCst) >= count {
                return;
            }
            notified.as_mut().await;
            notified.set(self.notify.notified());
        }
    }

    async fn wait_until<T>(&self, mut check: impl FnMut(&mut CacheState) -> Option<T>) -> T {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        loop {
            // Arm before checking so a notify between check and await is kept.
            notified.as_mut().enable();
            {
                let mut s = self.state.lock().await;
                if let Some(v) = check(&mut s) {
                    return v;
                }
            }
            notified.as_mut().await;
            notified.set(self.notify.notified());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Int64Array;
    use arrow::record_batch::RecordBatch;
    use arrow_schema::{DataType, Field, Schema};
    use std::sync::Arc;
    use std::time::Duration;

    fn batch(values: &[i64]) -> CacheData {
        let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Int64, false)]));
        CacheData::Batch(
            RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(values.to_vec()))])
                .expect("batch"),
        )
    }

    #[tokio::test]
    async fn pull_after_finish_and_drain_returns_none_without_blocking() {
        let cache = CacheMachine::new("t");
        cache
            .add_to_cache(batch(&[1, 2]), DEFAULT_CACHE_ID, false)
            .await
            .expect("add");
        cache.finish().await;

        assert!(cache.pull_cache_data().await.is_some());
        let end = tokio::time::timeout(Duration::from_millis(200), cache.pull_cache_data())
            .await
            .expect("must not block");
        assert!(end.is_none());
    }

    #[tokio::test]
    async fn tracks_batches_and_rows_added() {
        let cache = CacheMachine::new("t");
        cache
            .add_to_cache(batch(&[1, 2, 3]), DEFAULT_CACHE_ID, false)
            .await
            .expect("add");
        cache
            .add_to_cache(batch(&[4]), DEFAULT_CACHE_ID, false)
            .await
            .expect("add");
        assert_eq!(cache.num_batches_added(), 2);
        assert_eq!(cache.num_rows_added(), 4);
    }

    #[tokio::test]
    async fn wait_for_next_reports_data_then_completion() {
        let cache = Arc::new(CacheMachine::new("t"));
        let waiter = Arc::clone(&cache);
        let handle = tokio::spawn(async move { waiter.wait_for_next().await });
        cache
            .add_to_cache(batch(&[1]), DEFAULT_CACHE_ID, false)
            .await
            .expect("add");
        assert!(handle.await.expect("join"));

        cache.pull_cache_data().await.expect("entry");
        cache.finish().await;
        assert!(!cache.wait_for_next().await);
    }

    #[tokio::test]
    async fn wait_for_count_unblocks_once_enough_batches_arrived() {
        let cache = Arc::new(CacheMachine::new("t"));
        let waiter = Arc::clone(&cache);
        let handle = tokio::spawn(async move {
            waiter.wait_for_count(3).await;
            waiter.num_batches_added()
        });
        for i in 0..3 {
            cache
                .add_to_cache(batch(&[i]), DEFAULT_CACHE_ID, false)
                .await
                .expect("add");
        }
        assert_eq!(handle.await.expect("join"), 3);
    }

    #[tokio::test]
    async fn producer_parks_at_flow_control_limit_until_consumer_pulls() {
        let cache = Arc::new(CacheMachine::with_flow_control("t", 1));
        cache
            .add_to_cache(batch(&[1]), DEFAULT_CACHE_ID, false)
            .await
            .expect("add");

        let producer = Arc::clone(&cache);
        let blocked = tokio::spawn(async move {
            producer
                .add_to_cache(batch(&[2]), DEFAULT_CACHE_ID, false)
                .await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!blocked.is_finished(), "push should park at the limit");

        cache.pull_cache_data().await.expect("entry");
        assert!(blocked.await.expect("join").expect("add"));
    }

    #[tokio::test]
    async fn quiet_fail_push_after_finish_is_dropped() {
        let cache = CacheMachine::new("t");
        cache.finish().await;
        let added = cache
            .add_to_cache(batch(&[1]), DEFAULT_CACHE_ID, true)
            .await
            .expect("quiet");
        assert!(!added);

        let err = cache
            .add_to_cache(batch(&[1]), DEFAULT_CACHE_ID, false)
            .await
            .expect_err("loud push must fail");
        assert!(matches!(err, GfqError::Execution(_)));
    }

    #[tokio::test]
    async fn named_sub_caches_are_independent() {
        let cache = CacheMachine::new("t");
        cache
            .add_to_cache(batch(&[1]), "master_only", false)
            .await
            .expect("add");
        cache.finish().await;

        assert!(cache.pull_cache_data().await.is_none());
        assert!(cache.pull_from_cache("master_only").await.is_some());
    }
}
