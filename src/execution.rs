// Copyright 2025 Gauntlet Contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Bounded-concurrency execution pool.
//!
//! Work is pulled from a FIFO queue into an active set bounded by N. A
//! finished slot is refilled immediately from the queue, so the active set
//! stays at min(N, remaining work) even when task durations vary. An adapter
//! failure is captured on the owning record and never aborts sibling tasks.

use crate::adapter::{Adapter, ExecutionContext};
use crate::cache::{CacheKey, CachedExecution, ResultCache};
use crate::store::{StateStore, TestUpdate};
use crate::types::{TestSpec, TestStatus};
use crate::EngineError;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Completion notice handed to the orchestrator's hook.
#[derive(Debug, Clone)]
pub struct CompletedExecution {
    pub record_id: String,
    pub spec: TestSpec,
    pub succeeded: bool,
}

/// Callback invoked after each execution finishes, success or failure.
pub type CompletionHook = Arc<dyn Fn(CompletedExecution) + Send + Sync>;

/// Runs executable test specs against an adapter, at most N at a time.
pub struct ExecutionScheduler {
    adapter: Arc<dyn Adapter>,
    store: Arc<StateStore>,
    cache: Option<Arc<dyn ResultCache>>,
    ctx: ExecutionContext,
    max_concurrency: usize,
    cache_hit_latency_ms: u64,
}

impl ExecutionScheduler {
    pub fn new(
        adapter: Arc<dyn Adapter>,
        store: Arc<StateStore>,
        ctx: ExecutionContext,
        max_concurrency: usize,
    ) -> Self {
        Self {
            adapter,
            store,
            cache: None,
            ctx,
            max_concurrency,
            cache_hit_latency_ms: 1,
        }
    }

    pub fn with_cache(mut self, cache: Arc<dyn ResultCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_cache_hit_latency(mut self, latency_ms: u64) -> Self {
        self.cache_hit_latency_ms = latency_ms;
        self
    }

    /// Run every `(record_id, spec)` pair to completion.
    ///
    /// `work` must contain executable specs only; parent placeholders are
    /// skipped defensively. Returns once the queue and the active set are
    /// both empty.
    pub async fn run(
        &self,
        work: Vec<(String, TestSpec)>,
        on_complete: Option<CompletionHook>,
    ) -> Result<(), EngineError> {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrency.max(1)));
        let mut join_set = JoinSet::new();

        for (record_id, spec) in work {
            if spec.is_parent_placeholder {
                debug!(record_id = %record_id, "skipping parent placeholder spec");
                continue;
            }

            // Blocks until a slot frees, which is what keeps the active set
            // at the concurrency bound while the queue drains in order.
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| EngineError::Scheduler("execution semaphore closed".to_string()))?;

            let adapter = Arc::clone(&self.adapter);
            let store = Arc::clone(&self.store);
            let cache = self.cache.clone();
            let ctx = self.ctx.clone();
            let hit_latency = self.cache_hit_latency_ms;
            let hook = on_complete.clone();

            join_set.spawn(async move {
                let _permit = permit;
                let succeeded =
                    Self::run_one(&adapter, &store, cache.as_deref(), &ctx, hit_latency, &record_id, &spec)
                        .await;
                if let Some(hook) = hook {
                    hook(CompletedExecution {
                        record_id,
                        spec,
                        succeeded,
                    });
                }
            });
        }

        while let Some(result) = join_set.join_next().await {
            if let Err(err) = result {
                warn!(%err, "execution task panicked");
            }
        }
        Ok(())
    }

    /// Execute one spec end to end; returns whether execution succeeded.
    ///
    /// A multi-run child goes terminal here since the judge only sees it
    /// through its parent. A single test keeps running: its terminal status
    /// belongs to the verdict, so success records output and latency only
    /// and leaves the status for the evaluation pool.
    async fn run_one(
        adapter: &Arc<dyn Adapter>,
        store: &StateStore,
        cache: Option<&dyn ResultCache>,
        ctx: &ExecutionContext,
        hit_latency_ms: u64,
        record_id: &str,
        spec: &TestSpec,
    ) -> bool {
        store.update(record_id, TestUpdate::status(TestStatus::Running));
        let terminal_on_success = spec.is_multi_run_child();

        let key = CacheKey::new(&spec.owner, &spec.dimension, &spec.input, spec.run_index);
        if let Some(cache) = cache {
            if let Some(cached) = cache.get(&key).await {
                debug!(record_id, "cache hit, skipping adapter call");
                store.update(
                    record_id,
                    TestUpdate {
                        status: terminal_on_success.then_some(TestStatus::Completed),
                        output: Some(cached.output),
                        latency_ms: Some(hit_latency_ms),
                        cache_hits: 1,
                        from_cache: Some(true),
                        ..Default::default()
                    },
                );
                return true;
            }
        }

        match adapter.execute(spec, ctx).await {
            Ok(response) => {
                if let Some(cache) = cache {
                    cache
                        .set(
                            key,
                            CachedExecution {
                                output: response.output.clone(),
                            },
                        )
                        .await;
                }
                store.update(
                    record_id,
                    TestUpdate {
                        status: terminal_on_success.then_some(TestStatus::Completed),
                        output: Some(response.output),
                        latency_ms: Some(response.latency_ms),
                        api_calls: 1,
                        ..Default::default()
                    },
                );
                true
            }
            Err(err) => {
                store.update(
                    record_id,
                    TestUpdate {
                        status: Some(TestStatus::Failed),
                        error: Some(err.to_string()),
                        api_calls: 1,
                        ..Default::default()
                    },
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{AdapterError, AdapterResponse};
    use crate::cache::MokaResultCache;
    use crate::types::Dimension;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio_test::assert_ok;

    /// Adapter that records how many executions overlap.
    struct TrackingAdapter {
        current: AtomicUsize,
        peak: AtomicUsize,
        calls: AtomicUsize,
        fail_for_input_index: Option<usize>,
        delay: Duration,
    }

    impl TrackingAdapter {
        fn new(delay: Duration) -> Self {
            Self {
                current: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                calls: AtomicUsize::new(0),
                fail_for_input_index: None,
                delay,
            }
        }

        fn failing_on(mut self, input_index: usize) -> Self {
            self.fail_for_input_index = Some(input_index);
            self
        }
    }

    #[async_trait]
    impl Adapter for TrackingAdapter {
        async fn execute(
            &self,
            spec: &TestSpec,
            _ctx: &ExecutionContext,
        ) -> Result<AdapterResponse, AdapterError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.current.fetch_sub(1, Ordering::SeqCst);

            if self.fail_for_input_index == Some(spec.input_index) {
                return Err(AdapterError::Transport("connection reset".to_string()));
            }
            Ok(AdapterResponse {
                output: json!(format!("output-{}", spec.input_index)),
                latency_ms: 5,
            })
        }
    }

    fn ctx() -> ExecutionContext {
        ExecutionContext {
            project_path: ".".to_string(),
            timeout_ms: 1_000,
        }
    }

    fn make_work(store: &StateStore, count: usize) -> Vec<(String, TestSpec)> {
        (0..count)
            .map(|i| {
                let spec = TestSpec::new("agent-a", "performance", i, json!(i));
                let id = store.create_for_spec(&spec);
                (id, spec)
            })
            .collect()
    }

    #[tokio::test]
    async fn test_active_set_never_exceeds_limit() {
        let store = Arc::new(StateStore::new());
        let adapter = Arc::new(TrackingAdapter::new(Duration::from_millis(20)));
        let scheduler = ExecutionScheduler::new(adapter.clone(), store.clone(), ctx(), 2);

        let work = make_work(&store, 5);
        assert_ok!(scheduler.run(work, None).await);

        assert!(adapter.peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 5);
        // Singles stay running with their output recorded; the verdict
        // decides their terminal status.
        for record in store.all() {
            assert_eq!(record.status, TestStatus::Running);
            assert!(record.output.is_some());
        }
        assert_eq!(store.metrics().api_calls, 5);
    }

    #[tokio::test]
    async fn test_multi_run_child_goes_terminal_on_success() {
        let store = Arc::new(StateStore::new());
        let adapter = Arc::new(TrackingAdapter::new(Duration::from_millis(1)));
        let scheduler = ExecutionScheduler::new(adapter, store.clone(), ctx(), 2);

        let spec = TestSpec::new("team-x", "consistency", 0, json!("in")).as_run(0, 3);
        let id = store.create_for_spec(&spec);
        scheduler.run(vec![(id.clone(), spec)], None).await.unwrap();

        let record = store.get(&id).unwrap();
        assert_eq!(record.status, TestStatus::Completed);
        assert!(record.latency_ms.is_some());
    }

    #[tokio::test]
    async fn test_failure_never_aborts_siblings() {
        let store = Arc::new(StateStore::new());
        let adapter = Arc::new(TrackingAdapter::new(Duration::from_millis(1)).failing_on(1));
        let scheduler = ExecutionScheduler::new(adapter, store.clone(), ctx(), 3);

        let work = make_work(&store, 4);
        let failed_id = work[1].0.clone();
        scheduler.run(work, None).await.unwrap();

        let metrics = store.metrics();
        assert_eq!(metrics.failed, 1);
        assert_eq!(metrics.running, 3);
        let failed = store.get(&failed_id).unwrap();
        assert!(failed.error.as_deref().unwrap().contains("connection reset"));
    }

    #[tokio::test]
    async fn test_cache_hit_skips_adapter_and_counts_once() {
        let store = Arc::new(StateStore::new());
        let adapter = Arc::new(TrackingAdapter::new(Duration::from_millis(1)));
        let cache = Arc::new(MokaResultCache::new(60));

        let spec = TestSpec::new("agent-a", "safety", 0, json!("prompt"));
        cache
            .set(
                CacheKey::new(&spec.owner, &spec.dimension, &spec.input, None),
                CachedExecution {
                    output: json!("cached output"),
                },
            )
            .await;

        let scheduler = ExecutionScheduler::new(adapter.clone(), store.clone(), ctx(), 1)
            .with_cache(cache)
            .with_cache_hit_latency(1);

        let id = store.create_for_spec(&spec);
        scheduler.run(vec![(id.clone(), spec)], None).await.unwrap();

        assert_eq!(adapter.calls.load(Ordering::SeqCst), 0);
        let record = store.get(&id).unwrap();
        assert!(record.from_cache);
        assert_eq!(record.latency_ms, Some(1));
        assert_eq!(record.output, Some(json!("cached output")));
        let metrics = store.metrics();
        assert_eq!(metrics.cache_hits, 1);
        assert_eq!(metrics.api_calls, 0);
    }

    #[tokio::test]
    async fn test_completion_hook_sees_both_outcomes() {
        let store = Arc::new(StateStore::new());
        let adapter = Arc::new(TrackingAdapter::new(Duration::from_millis(1)).failing_on(0));
        let scheduler = ExecutionScheduler::new(adapter, store.clone(), ctx(), 2);

        let work = make_work(&store, 2);
        let outcomes = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = outcomes.clone();
        let hook: CompletionHook = Arc::new(move |done: CompletedExecution| {
            sink.lock().push((done.spec.input_index, done.succeeded));
        });

        scheduler.run(work, Some(hook)).await.unwrap();

        let mut seen = outcomes.lock().clone();
        seen.sort();
        assert_eq!(seen, vec![(0, false), (1, true)]);
    }

    #[tokio::test]
    async fn test_parent_placeholder_is_skipped() {
        let store = Arc::new(StateStore::new());
        let adapter = Arc::new(TrackingAdapter::new(Duration::from_millis(1)));
        let scheduler = ExecutionScheduler::new(adapter.clone(), store.clone(), ctx(), 1);

        let mut spec = TestSpec::new("agent-a", "consistency", 0, json!(null));
        spec.is_parent_placeholder = true;
        let id = store.create_for_spec(&spec);
        scheduler.run(vec![(id.clone(), spec)], None).await.unwrap();

        assert_eq!(adapter.calls.load(Ordering::SeqCst), 0);
        assert_eq!(store.get(&id).unwrap().status, TestStatus::Queued);
    }

    #[test]
    fn test_cache_key_uses_dimension() {
        let a = CacheKey::new("agent", &Dimension::new("safety"), &json!(1), None);
        let b = CacheKey::new("agent", &Dimension::new("accuracy"), &json!(1), None);
        assert_ne!(a, b);
    }
}
