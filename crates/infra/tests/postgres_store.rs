//! Postgres store tests. Skipped unless `DATABASE_URL` is set.
//!
//! Each test works in its own schema and drops it afterwards.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::json;
use sqlx::PgPool;

use jobforge_core::{FinalizeReason, JobId, JobPolicy};
use jobforge_infra::{
    DeferOptions, DefinitionError, JobDefinition, JobStore, NewJob, PostgresJobStore, StoreConfig,
    StoreError,
};

static SCHEMA_COUNTER: AtomicUsize = AtomicUsize::new(0);

async fn test_store() -> Option<(PostgresJobStore, String)> {
    let Ok(url) = std::env::var("DATABASE_URL") else {
        eprintln!("DATABASE_URL not set; skipping postgres test");
        return None;
    };
    let pool = PgPool::connect(&url).await.unwrap();
    let schema = format!(
        "jobforge_test_{}_{}",
        std::process::id(),
        SCHEMA_COUNTER.fetch_add(1, Ordering::SeqCst)
    );
    let store =
        PostgresJobStore::with_config(pool, &StoreConfig::default().with_schema(&schema)).unwrap();
    store.prepare_schema().await.unwrap();
    Some((store, schema))
}

async fn drop_schema(store: &PostgresJobStore, schema: &str) {
    sqlx::query(&format!("DROP SCHEMA \"{schema}\" CASCADE"))
        .execute(store.pool())
        .await
        .unwrap();
}

#[tokio::test]
async fn prepare_schema_is_idempotent() {
    let Some((store, schema)) = test_store().await else {
        return;
    };
    store.prepare_schema().await.unwrap();
    drop_schema(&store, &schema).await;
}

#[tokio::test]
async fn upsert_and_claim() {
    let Some((store, schema)) = test_store().await else {
        return;
    };

    let first = store
        .upsert_job_definition(&JobPolicy::new("pg-a"))
        .await
        .unwrap();
    let second = store
        .upsert_job_definition(&JobPolicy::new("pg-a").with_num_attempts(3))
        .await
        .unwrap();
    assert_eq!(first, second);

    let record = store.get_job_definition("pg-a").await.unwrap().unwrap();
    assert_eq!(record.num_attempts, 3);
    assert!(record.last_heartbeat_at.is_some());

    let job_id = store
        .insert_job(NewJob::new(first, json!({"hello": "world"})).with_num_attempts(3))
        .await
        .unwrap();
    let claimed = store.claim_available_job("_default").await.unwrap().unwrap();
    assert_eq!(claimed.id, job_id);
    assert_eq!(claimed.payload, json!({"hello": "world"}));
    assert!(store.claim_available_job("_default").await.unwrap().is_none());

    let job = store.get_job(job_id).await.unwrap().unwrap();
    assert!(job.unlocked_at > job.created_at);

    assert!(store.finalize_job(job_id, true).await.unwrap());
    assert!(!store.finalize_job(job_id, false).await.unwrap());
    let job = store.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.is_success, Some(true));

    drop_schema(&store, &schema).await;
}

#[tokio::test]
async fn defer_is_atomic_on_missing_dependency() {
    let Some((store, schema)) = test_store().await else {
        return;
    };

    let def = JobDefinition::new(JobPolicy::new("pg-defer"), |_| async { Ok(()) });
    let err = def
        .defer(
            &store,
            &json!({}),
            DeferOptions::new().depends_on(JobId::from_i64(i64::MAX)),
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        DefinitionError::Store(StoreError::MissingDependency(_))
    ));

    let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM \"{schema}\".\"job\""))
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!(count, 0);

    drop_schema(&store, &schema).await;
}

#[tokio::test]
async fn dependency_failure_is_finalized_with_reason() {
    let Some((store, schema)) = test_store().await else {
        return;
    };

    let def = store
        .upsert_job_definition(&JobPolicy::new("pg-deps"))
        .await
        .unwrap();
    let a = store.insert_job(NewJob::new(def, json!({}))).await.unwrap();
    let b = store
        .insert_job(NewJob::new(def, json!({})).with_dependencies(vec![a]))
        .await
        .unwrap();

    assert_eq!(
        store.claim_available_job("_default").await.unwrap().map(|j| j.id),
        Some(a)
    );
    assert!(store.claim_available_job("_default").await.unwrap().is_none());
    store.finalize_job(a, false).await.unwrap();

    let failed = store.finalize_next_failed_job().await.unwrap().unwrap();
    assert_eq!(failed.job_id, b);
    assert_eq!(failed.reasons.primary(), Some(FinalizeReason::UnmetDependency));
    assert!(store.finalize_next_failed_job().await.unwrap().is_none());

    // Both finalized just now: nothing old enough to sweep.
    assert!(
        store
            .sweep_next_finalized_job(Duration::from_secs(60))
            .await
            .unwrap()
            .is_none()
    );
    let mut swept = HashSet::new();
    while let Some(job) = store.sweep_next_finalized_job(Duration::ZERO).await.unwrap() {
        swept.insert(job.job_id);
    }
    assert_eq!(swept, HashSet::from([a, b]));

    let stale = store
        .sweep_next_stale_job_definition(Duration::ZERO)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stale.name, "pg-deps");

    drop_schema(&store, &schema).await;
}

#[tokio::test]
async fn repeat_once_per_interval() {
    let Some((store, schema)) = test_store().await else {
        return;
    };

    store
        .upsert_job_definition(
            &JobPolicy::new("pg-repeat").with_repeat_interval(Duration::from_secs(3600)),
        )
        .await
        .unwrap();
    let repeated = store.repeat_next_job_definition().await.unwrap().unwrap();
    assert_eq!(repeated.job_definition_name, "pg-repeat");
    assert!(store.repeat_next_job_definition().await.unwrap().is_none());

    let job = store.get_job(repeated.job_id).await.unwrap().unwrap();
    assert_eq!(job.payload, json!({}));

    drop_schema(&store, &schema).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_claims_are_exclusive() {
    let Some((store, schema)) = test_store().await else {
        return;
    };

    let def = store
        .upsert_job_definition(&JobPolicy::new("pg-bulk"))
        .await
        .unwrap();
    for n in 0..50 {
        store
            .insert_job(NewJob::new(def, json!({ "n": n })))
            .await
            .unwrap();
    }

    let store = Arc::new(store);
    let mut claimers = Vec::new();
    for _ in 0..8 {
        let store = store.clone();
        claimers.push(tokio::spawn(async move {
            let mut claimed = Vec::new();
            loop {
                match store.claim_available_job("_default").await {
                    Ok(Some(job)) => claimed.push(job.id),
                    Ok(None) => break,
                    Err(e) => panic!("claim failed: {e}"),
                }
            }
            claimed
        }));
    }

    let mut all = Vec::new();
    for claimer in claimers {
        all.extend(claimer.await.unwrap());
    }
    let unique: HashSet<_> = all.iter().copied().collect();
    assert_eq!(all.len(), unique.len());
    assert_eq!(unique.len(), 50);

    drop_schema(&store, &schema).await;
}

#[tokio::test]
async fn claim_is_not_blocked_by_in_flight_insert() {
    let Some((store, schema)) = test_store().await else {
        return;
    };

    let def = store
        .upsert_job_definition(&JobPolicy::new("pg-busy"))
        .await
        .unwrap();
    let ready = store.insert_job(NewJob::new(def, json!({}))).await.unwrap();

    // An open insert holds a key-share lock on the definition row.
    let mut tx = store.pool().begin().await.unwrap();
    sqlx::query(&format!(
        "INSERT INTO \"{schema}\".\"job\" (\"job_definition_id\", \"payload\", \"num_attempts\") \
         VALUES ($1, '{{}}'::jsonb, 1)"
    ))
    .bind(def.as_i64())
    .execute(&mut *tx)
    .await
    .unwrap();

    let claimed = store.claim_available_job("_default").await.unwrap();
    assert_eq!(claimed.map(|job| job.id), Some(ready));

    tx.rollback().await.unwrap();
    drop_schema(&store, &schema).await;
}

#[tokio::test]
async fn exhausted_job_is_not_claimed_and_fails_with_attempts_reason() {
    let Some((store, schema)) = test_store().await else {
        return;
    };

    let def = store
        .upsert_job_definition(&JobPolicy::new("pg-exhausted"))
        .await
        .unwrap();
    let job_id = store
        .insert_job(NewJob::new(def, json!({})).with_num_attempts(1))
        .await
        .unwrap();
    store.decrement_attempts(job_id).await.unwrap();

    assert!(store.claim_available_job("_default").await.unwrap().is_none());

    let failed = store.finalize_next_failed_job().await.unwrap().unwrap();
    assert_eq!(failed.job_id, job_id);
    assert_eq!(
        failed.reasons.primary(),
        Some(FinalizeReason::AttemptsExhausted)
    );
    assert!(store.get_job(job_id).await.unwrap().unwrap().is_failed());

    drop_schema(&store, &schema).await;
}

#[tokio::test]
async fn timed_out_job_fails_with_timeout_reason() {
    let Some((store, schema)) = test_store().await else {
        return;
    };

    let def = store
        .upsert_job_definition(
            &JobPolicy::new("pg-timeout").with_timeout_interval(Duration::from_millis(1)),
        )
        .await
        .unwrap();
    let job_id = store.insert_job(NewJob::new(def, json!({}))).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let failed = store.finalize_next_failed_job().await.unwrap().unwrap();
    assert_eq!(failed.job_id, job_id);
    assert_eq!(failed.job_definition_name, "pg-timeout");
    assert_eq!(failed.reasons.primary(), Some(FinalizeReason::Timeout));

    drop_schema(&store, &schema).await;
}

#[tokio::test]
async fn release_interval_spaces_claims() {
    let Some((store, schema)) = test_store().await else {
        return;
    };

    let def = store
        .upsert_job_definition(
            &JobPolicy::new("pg-spaced").with_release_interval(Duration::from_secs(3600)),
        )
        .await
        .unwrap();
    let first = store.insert_job(NewJob::new(def, json!({"n": 1}))).await.unwrap();
    store.insert_job(NewJob::new(def, json!({"n": 2}))).await.unwrap();

    let claimed = store.claim_available_job("_default").await.unwrap();
    assert_eq!(claimed.map(|job| job.id), Some(first));
    assert!(store.claim_available_job("_default").await.unwrap().is_none());

    let record = store.get_job_definition("pg-spaced").await.unwrap().unwrap();
    assert!(record.last_released_at.is_some());

    drop_schema(&store, &schema).await;
}

#[tokio::test]
async fn delayed_job_is_not_claimable_yet() {
    let Some((store, schema)) = test_store().await else {
        return;
    };

    let def = store
        .upsert_job_definition(&JobPolicy::new("pg-delayed"))
        .await
        .unwrap();
    let job_id = store
        .insert_job(NewJob::new(def, json!({})).with_delay(Duration::from_secs(3600)))
        .await
        .unwrap();

    assert!(store.claim_available_job("_default").await.unwrap().is_none());

    let job = store.get_job(job_id).await.unwrap().unwrap();
    assert!(job.unlocked_at - job.created_at >= chrono::TimeDelta::minutes(59));

    drop_schema(&store, &schema).await;
}

#[tokio::test]
async fn finalized_job_is_kept_while_a_dependent_is_pending() {
    let Some((store, schema)) = test_store().await else {
        return;
    };

    let def = store
        .upsert_job_definition(&JobPolicy::new("pg-chain"))
        .await
        .unwrap();
    let a = store.insert_job(NewJob::new(def, json!({}))).await.unwrap();
    let b = store
        .insert_job(NewJob::new(def, json!({})).with_dependencies(vec![a]))
        .await
        .unwrap();
    assert!(store.finalize_job(a, true).await.unwrap());
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert!(
        store
            .sweep_next_finalized_job(Duration::ZERO)
            .await
            .unwrap()
            .is_none()
    );
    assert!(store.get_job(a).await.unwrap().is_some());

    assert!(store.finalize_job(b, true).await.unwrap());
    tokio::time::sleep(Duration::from_millis(10)).await;

    let mut swept = HashSet::new();
    while let Some(job) = store.sweep_next_finalized_job(Duration::ZERO).await.unwrap() {
        swept.insert(job.job_id);
    }
    assert_eq!(swept, HashSet::from([a, b]));

    drop_schema(&store, &schema).await;
}

#[tokio::test]
async fn stale_definition_is_kept_while_jobs_reference_it() {
    let Some((store, schema)) = test_store().await else {
        return;
    };

    let def = store
        .upsert_job_definition(&JobPolicy::new("pg-referenced"))
        .await
        .unwrap();
    store.insert_job(NewJob::new(def, json!({}))).await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert!(
        store
            .sweep_next_stale_job_definition(Duration::ZERO)
            .await
            .unwrap()
            .is_none()
    );
    assert!(store.get_job_definition("pg-referenced").await.unwrap().is_some());

    drop_schema(&store, &schema).await;
}

#[tokio::test]
async fn defer_recovers_after_definition_is_swept() {
    let Some((store, schema)) = test_store().await else {
        return;
    };

    let def = JobDefinition::new(JobPolicy::new("pg-producer"), |_| async { Ok(()) });
    let first = def.defer(&store, &json!({}), DeferOptions::new()).await.unwrap();
    let old_id = def.id().unwrap();
    store.finalize_job(first, true).await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert!(store.sweep_next_finalized_job(Duration::ZERO).await.unwrap().is_some());
    let swept = store
        .sweep_next_stale_job_definition(Duration::ZERO)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(swept.id, old_id);

    let second = def.defer(&store, &json!({}), DeferOptions::new()).await.unwrap();
    let job = store.get_job(second).await.unwrap().unwrap();
    assert_ne!(job.job_definition_id, old_id);
    assert_eq!(def.id(), Some(job.job_definition_id));

    drop_schema(&store, &schema).await;
}
