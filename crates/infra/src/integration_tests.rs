//! End-to-end tests: definitions → store → worker / orchestrator → events.
//!
//! Verifies:
//! - Retry after a failed attempt once the lease expires
//! - Dependency failure propagates through the orchestrator
//! - Claims are exclusive under concurrency
//! - Exhausted jobs are never claimed again

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use proptest::prelude::*;
    use serde_json::json;

    use jobforge_core::{FinalizeReason, JobPolicy};
    use jobforge_events::{Event, InMemoryEventSink};

    use crate::config::{OrchestratorConfig, WorkerConfig};
    use crate::definition::{DeferOptions, JobDefinition};
    use crate::orchestrator::Orchestrator;
    use crate::registry::JobRegistry;
    use crate::store::{InMemoryJobStore, JobStore, NewJob};
    use crate::worker::Worker;

    async fn wait_until<F: Fn() -> bool>(what: &str, condition: F) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
    }

    #[tokio::test]
    async fn failed_attempt_is_retried_after_lease_expires() {
        let store = InMemoryJobStore::arc();
        let sink = Arc::new(InMemoryEventSink::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut registry = JobRegistry::new();
        let def = {
            let calls = calls.clone();
            registry
                .register(JobDefinition::new(
                    JobPolicy::new("flaky")
                        .with_num_attempts(2)
                        .with_timeout_interval(Duration::from_millis(1000))
                        .with_lock_interval(Duration::from_millis(100)),
                    move |_| {
                        let calls = calls.clone();
                        async move {
                            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                                anyhow::bail!("first attempt fails");
                            }
                            Ok(())
                        }
                    },
                ))
                .unwrap()
        };
        let job_id = def.defer(store.as_ref(), &json!({}), DeferOptions::new()).await.unwrap();

        let handle = Worker::new(
            store.clone(),
            Arc::new(registry),
            WorkerConfig::default()
                .with_concurrency(1)
                .with_poll_interval(Duration::from_millis(10)),
        )
        .start_with_sink(sink.clone());

        wait_until("first failure", || sink.count_kind("worker-job-error") == 1).await;
        let job = store.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.num_attempts, 1);
        assert!(!job.is_finalized());

        wait_until("success", || sink.count_kind("worker-job-finalize-success") == 1).await;
        handle.shutdown().await;

        let job = store.get_job(job_id).await.unwrap().unwrap();
        assert!(job.finalized_at.is_some());
        assert_eq!(job.is_success, Some(true));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(sink.count_kind("worker-job-dequeue"), 2);
    }

    #[tokio::test]
    async fn failed_dependency_fails_dependent_via_orchestrator() {
        let store = InMemoryJobStore::arc();
        let sink = Arc::new(InMemoryEventSink::new());
        let mut registry = JobRegistry::new();
        let def = registry
            .register(JobDefinition::new(JobPolicy::new("step"), |_| async { Ok(()) }))
            .unwrap();

        let a = def.defer(store.as_ref(), &json!({"step": "a"}), DeferOptions::new()).await.unwrap();
        let b = def
            .defer(store.as_ref(), &json!({"step": "b"}), DeferOptions::new().depends_on(a))
            .await
            .unwrap();

        // Take A out of the pool; B stays gated while A is pending.
        let claimed = store.claim_available_job("_default").await.unwrap().unwrap();
        assert_eq!(claimed.id, a);
        assert!(store.claim_available_job("_default").await.unwrap().is_none());

        assert!(store.finalize_job(a, false).await.unwrap());
        assert!(store.claim_available_job("_default").await.unwrap().is_none());

        let handle = Orchestrator::new(
            store.clone(),
            Arc::new(registry),
            OrchestratorConfig::default().with_clean_interval(Duration::from_millis(10)),
        )
        .start_with_sink(sink.clone());
        wait_until("dependent failed", || {
            sink.count_kind("orchestrator-job-finalize-failure-unmet-dependencies") == 1
        })
        .await;
        handle.shutdown().await;

        let job = store.get_job(b).await.unwrap().unwrap();
        assert!(job.is_failed());
        let failed = sink.events().into_iter().find_map(|e| match e {
            Event::OrchestratorJobFinalizeFailureUnmetDependencies { job_id, .. } => Some(job_id),
            _ => None,
        });
        assert_eq!(failed, Some(b));
        assert_eq!(
            Event::finalize_failure(FinalizeReason::UnmetDependency, b, "step").kind(),
            "orchestrator-job-finalize-failure-unmet-dependencies"
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_claims_are_exclusive() {
        let store = InMemoryJobStore::arc();
        let definition_id = store
            .upsert_job_definition(&JobPolicy::new("bulk"))
            .await
            .unwrap();
        for n in 0..200 {
            store
                .insert_job(NewJob::new(definition_id, json!({ "n": n })))
                .await
                .unwrap();
        }

        let mut claimers = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            claimers.push(tokio::spawn(async move {
                let mut claimed = Vec::new();
                while let Some(job) = store.claim_available_job("_default").await.unwrap() {
                    claimed.push(job.id);
                }
                claimed
            }));
        }

        let mut all = Vec::new();
        for claimer in claimers {
            all.extend(claimer.await.unwrap());
        }
        let unique: HashSet<_> = all.iter().copied().collect();
        assert_eq!(all.len(), 200);
        assert_eq!(unique.len(), 200);
    }

    #[tokio::test]
    async fn repeat_waits_full_interval() {
        let store = InMemoryJobStore::new();
        store
            .upsert_job_definition(
                &JobPolicy::new("every-second").with_repeat_interval(Duration::from_millis(1000)),
            )
            .await
            .unwrap();

        assert!(store.repeat_next_job_definition().await.unwrap().is_some());
        store.advance(Duration::from_millis(500));
        assert!(store.repeat_next_job_definition().await.unwrap().is_none());
        store.advance(Duration::from_millis(500));
        assert!(store.repeat_next_job_definition().await.unwrap().is_some());
    }

    proptest! {
        #[test]
        fn exhausted_jobs_are_never_claimed(attempts in 1i32..5, failures in 0usize..8) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            rt.block_on(async {
                let store = InMemoryJobStore::new();
                let def = store
                    .upsert_job_definition(&JobPolicy::new("p").with_lock_interval(Duration::ZERO))
                    .await
                    .unwrap();
                let job_id = store
                    .insert_job(NewJob::new(def, json!({})).with_num_attempts(attempts))
                    .await
                    .unwrap();

                for _ in 0..failures {
                    store.decrement_attempts(job_id).await.unwrap();
                }

                let claimable = store.claim_available_job("_default").await.unwrap().is_some();
                prop_assert_eq!(claimable, attempts - failures as i32 > 0);
                Ok(())
            })?;
        }
    }
}
