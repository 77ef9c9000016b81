//! Postgres-backed job store.
//!
//! Three tables live in one schema (default `_jobforge`): `job_definition`,
//! `job` and `job_dependency`. Every public operation opens a transaction,
//! selects its target row with `SKIP LOCKED` where contention is possible,
//! acts on it and commits. Rows locked by a concurrent transaction are simply
//! not seen, which is what makes claims exclusive.
//!
//! Claims, repeats and failure finalization only touch non-key columns and
//! lock with `FOR NO KEY UPDATE`, which does not conflict with the
//! `FOR KEY SHARE` lock an in-flight insert holds on the rows its foreign
//! keys reference.
//!
//! Intervals are stored as `BIGINT` milliseconds and compared against
//! `NOW()`, the transaction start time, so every predicate in one
//! transaction sees the same instant.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError | Scenario |
//! |------------|----------------------|------------|----------|
//! | Database (foreign key violation) | `23503` | `MissingDependency` / `UnknownDefinition` | Deferring against a job or definition that does not exist |
//! | Database (other) | Any other | `Database` | Constraint or SQL errors |
//! | PoolClosed / PoolTimedOut / Io | N/A | `Unavailable` | Connection problems |
//! | Other | N/A | `Database` | Decoding errors etc. |

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tracing::instrument;

use jobforge_core::{
    FinalizeReasons, Job, JobDefinitionId, JobDefinitionRecord, JobId, JobPolicy, duration_millis,
};

use super::{
    ClaimedJob, FinalizedJob, JobStore, NewJob, RepeatedJob, StoreError, SweptJob,
    SweptJobDefinition,
};
use crate::config::StoreConfig;

const SCHEMA_PLACEHOLDER: &str = "{schema}";

/// Postgres-backed job store.
///
/// Cheap to clone; shares the underlying connection pool.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
    schema: Arc<str>,
}

impl PostgresJobStore {
    /// Create a store using the default schema.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
            schema: Arc::from(quote_ident(&StoreConfig::default().schema)),
        }
    }

    /// Create a store with an explicit configuration.
    pub fn with_config(pool: PgPool, config: &StoreConfig) -> Result<Self, StoreError> {
        config.validate()?;
        Ok(Self {
            pool: Arc::new(pool),
            schema: Arc::from(quote_ident(&config.schema)),
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Substitute the quoted schema name into a statement template.
    fn sql(&self, template: &str) -> String {
        template.replace(SCHEMA_PLACEHOLDER, &self.schema)
    }

    async fn begin(&self) -> Result<Transaction<'static, Postgres>, StoreError> {
        self.pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))
    }

    /// Create the schema, tables and indexes if they do not exist.
    #[instrument(skip(self), err)]
    pub async fn prepare_schema(&self) -> Result<(), StoreError> {
        let statements = [
            r#"CREATE SCHEMA IF NOT EXISTS {schema}"#,
            r#"
            CREATE TABLE IF NOT EXISTS {schema}."job_definition" (
                "id" BIGSERIAL PRIMARY KEY,
                "name" TEXT NOT NULL,
                "channel" TEXT NOT NULL,
                "num_attempts" INTEGER NOT NULL,
                "repeat_interval_ms" BIGINT NULL,
                "release_interval_ms" BIGINT NOT NULL,
                "lock_interval_ms" BIGINT NOT NULL,
                "timeout_interval_ms" BIGINT NOT NULL,
                "last_repeated_at" TIMESTAMPTZ NULL,
                "last_released_at" TIMESTAMPTZ NULL,
                "last_heartbeat_at" TIMESTAMPTZ NULL,
                "created_at" TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                "updated_at" TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS "job_definition_name_idx"
                ON {schema}."job_definition" ("name")
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS {schema}."job" (
                "id" BIGSERIAL PRIMARY KEY,
                "job_definition_id" BIGINT NOT NULL REFERENCES {schema}."job_definition" ("id"),
                "payload" JSONB NOT NULL,
                "num_attempts" INTEGER NOT NULL,
                "created_at" TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                "unlocked_at" TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                "finalized_at" TIMESTAMPTZ NULL,
                "is_success" BOOLEAN NULL
            )
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS "job_job_definition_id_idx"
                ON {schema}."job" ("job_definition_id")
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS {schema}."job_dependency" (
                "id" BIGSERIAL PRIMARY KEY,
                "job_id" BIGINT NOT NULL REFERENCES {schema}."job" ("id") ON DELETE CASCADE,
                "required_job_id" BIGINT NOT NULL REFERENCES {schema}."job" ("id") ON DELETE CASCADE,
                "created_at" TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS "job_dependency_job_id_idx"
                ON {schema}."job_dependency" ("job_id")
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS "job_dependency_required_job_id_idx"
                ON {schema}."job_dependency" ("required_job_id")
            "#,
        ];

        let mut tx = self.begin().await?;
        for statement in statements {
            sqlx::query(&self.sql(statement))
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("prepare_schema", e))?;
        }
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))
    }

    async fn insert_job_row(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        job: &NewJob,
    ) -> Result<JobId, StoreError> {
        let row = sqlx::query(&self.sql(
            r#"
            INSERT INTO {schema}."job" ("job_definition_id", "payload", "num_attempts", "unlocked_at")
            VALUES ($1, $2, $3, NOW() + ($4::double precision * INTERVAL '1 millisecond'))
            RETURNING "id"
            "#,
        ))
        .bind(job.job_definition_id.as_i64())
        .bind(&job.payload)
        .bind(job.num_attempts)
        .bind(duration_millis(job.delay))
        .fetch_one(&mut **tx)
        .await
        .map_err(|e| {
            if is_foreign_key_violation(&e) {
                StoreError::UnknownDefinition(job.job_definition_id)
            } else {
                map_sqlx_error("insert_job", e)
            }
        })?;

        let id: i64 = row
            .try_get("id")
            .map_err(|e| map_sqlx_error("insert_job", e))?;
        Ok(JobId::from_i64(id))
    }

    async fn insert_dependency(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        job_id: JobId,
        required_job_id: JobId,
    ) -> Result<(), StoreError> {
        sqlx::query(&self.sql(
            r#"
            INSERT INTO {schema}."job_dependency" ("job_id", "required_job_id")
            VALUES ($1, $2)
            "#,
        ))
        .bind(job_id.as_i64())
        .bind(required_job_id.as_i64())
        .execute(&mut **tx)
        .await
        .map_err(|e| {
            if is_foreign_key_violation(&e) {
                StoreError::MissingDependency(required_job_id)
            } else {
                map_sqlx_error("insert_dependency", e)
            }
        })?;
        Ok(())
    }

    async fn extend_lease(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        job_id: JobId,
        lock_interval_ms: i64,
    ) -> Result<(), StoreError> {
        sqlx::query(&self.sql(
            r#"
            UPDATE {schema}."job"
            SET "unlocked_at" = NOW() + ($2::double precision * INTERVAL '1 millisecond')
            WHERE "id" = $1
            "#,
        ))
        .bind(job_id.as_i64())
        .bind(lock_interval_ms)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("extend_lease", e))?;
        Ok(())
    }

    async fn stamp_released(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        id: JobDefinitionId,
    ) -> Result<(), StoreError> {
        sqlx::query(&self.sql(
            r#"UPDATE {schema}."job_definition" SET "last_released_at" = NOW() WHERE "id" = $1"#,
        ))
        .bind(id.as_i64())
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("stamp_released", e))?;
        Ok(())
    }

    async fn finalize(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        job_id: JobId,
        is_success: bool,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(&self.sql(
            r#"
            UPDATE {schema}."job"
            SET "finalized_at" = NOW(), "is_success" = $2
            WHERE "id" = $1 AND "finalized_at" IS NULL
            "#,
        ))
        .bind(job_id.as_i64())
        .bind(is_success)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("finalize_job", e))?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_job(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        job_id: JobId,
    ) -> Result<(), StoreError> {
        sqlx::query(&self.sql(r#"DELETE FROM {schema}."job" WHERE "id" = $1"#))
            .bind(job_id.as_i64())
            .execute(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("delete_job", e))?;
        Ok(())
    }

    async fn delete_job_definition(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        id: JobDefinitionId,
    ) -> Result<(), StoreError> {
        sqlx::query(&self.sql(r#"DELETE FROM {schema}."job_definition" WHERE "id" = $1"#))
            .bind(id.as_i64())
            .execute(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("delete_job_definition", e))?;
        Ok(())
    }

    async fn stamp_repeated(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        id: JobDefinitionId,
    ) -> Result<(), StoreError> {
        sqlx::query(&self.sql(
            r#"UPDATE {schema}."job_definition" SET "last_repeated_at" = NOW() WHERE "id" = $1"#,
        ))
        .bind(id.as_i64())
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("stamp_repeated", e))?;
        Ok(())
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, policy), fields(job_definition = %policy.name), err)]
    async fn upsert_job_definition(
        &self,
        policy: &JobPolicy,
    ) -> Result<JobDefinitionId, StoreError> {
        let policy = policy.normalized();
        let row = sqlx::query(&self.sql(
            r#"
            INSERT INTO {schema}."job_definition" (
                "name",
                "channel",
                "num_attempts",
                "repeat_interval_ms",
                "release_interval_ms",
                "lock_interval_ms",
                "timeout_interval_ms",
                "last_heartbeat_at"
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, NOW())
            ON CONFLICT ("name") DO UPDATE SET
                "channel" = EXCLUDED."channel",
                "num_attempts" = EXCLUDED."num_attempts",
                "repeat_interval_ms" = EXCLUDED."repeat_interval_ms",
                "release_interval_ms" = EXCLUDED."release_interval_ms",
                "lock_interval_ms" = EXCLUDED."lock_interval_ms",
                "timeout_interval_ms" = EXCLUDED."timeout_interval_ms",
                "last_heartbeat_at" = NOW(),
                "updated_at" = NOW()
            RETURNING "id"
            "#,
        ))
        .bind(&policy.name)
        .bind(&policy.channel)
        .bind(policy.num_attempts)
        .bind(policy.repeat_interval.map(duration_millis))
        .bind(duration_millis(policy.release_interval))
        .bind(duration_millis(policy.lock_interval))
        .bind(duration_millis(policy.timeout_interval))
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("upsert_job_definition", e))?;

        let id: i64 = row
            .try_get("id")
            .map_err(|e| map_sqlx_error("upsert_job_definition", e))?;
        Ok(JobDefinitionId::from_i64(id))
    }

    #[instrument(
        skip(self, job),
        fields(
            job_definition_id = job.job_definition_id.as_i64(),
            dependency_count = job.dependencies.len()
        ),
        err
    )]
    async fn insert_job(&self, job: NewJob) -> Result<JobId, StoreError> {
        let mut tx = self.begin().await?;

        let job_id = self.insert_job_row(&mut tx, &job).await?;
        for required_job_id in &job.dependencies {
            // Dropping `tx` on error rolls back the job row as well.
            self.insert_dependency(&mut tx, job_id, *required_job_id)
                .await?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))?;
        Ok(job_id)
    }

    #[instrument(skip(self), err)]
    async fn claim_available_job(&self, channel: &str) -> Result<Option<ClaimedJob>, StoreError> {
        let mut tx = self.begin().await?;

        let row = sqlx::query(&self.sql(
            r#"
            SELECT
                "job"."id",
                "job"."job_definition_id",
                "job_definition"."name" AS "job_definition_name",
                "job_definition"."lock_interval_ms",
                "job"."payload",
                "job"."num_attempts"
            FROM {schema}."job" AS "job"
            JOIN {schema}."job_definition" AS "job_definition"
                ON "job"."job_definition_id" = "job_definition"."id"
            WHERE "job"."finalized_at" IS NULL
                AND "job"."unlocked_at" <= NOW()
                AND "job_definition"."channel" = $1
                AND "job"."num_attempts" > 0
                AND (
                    "job_definition"."last_released_at" IS NULL
                    OR "job_definition"."last_released_at"
                        + ("job_definition"."release_interval_ms"::double precision * INTERVAL '1 millisecond')
                        <= NOW()
                )
                AND NOT EXISTS (
                    SELECT 1
                    FROM {schema}."job_dependency" AS "dependency"
                    JOIN {schema}."job" AS "required"
                        ON "dependency"."required_job_id" = "required"."id"
                    WHERE "dependency"."job_id" = "job"."id"
                        AND ("required"."finalized_at" IS NULL OR "required"."is_success" IS NOT TRUE)
                )
            LIMIT 1
            FOR NO KEY UPDATE SKIP LOCKED
            "#,
        ))
        .bind(channel)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("claim_available_job", e))?;

        let Some(row) = row else {
            tx.commit()
                .await
                .map_err(|e| map_sqlx_error("commit", e))?;
            return Ok(None);
        };

        let claimed = ClaimedJobRow::from_row(&row)
            .map_err(|e| map_sqlx_error("claim_available_job", e))?;
        let job_id = JobId::from_i64(claimed.id);
        let definition_id = JobDefinitionId::from_i64(claimed.job_definition_id);

        self.extend_lease(&mut tx, job_id, claimed.lock_interval_ms)
            .await?;
        self.stamp_released(&mut tx, definition_id).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))?;

        Ok(Some(ClaimedJob {
            id: job_id,
            job_definition_id: definition_id,
            job_definition_name: claimed.job_definition_name,
            payload: claimed.payload,
            num_attempts: claimed.num_attempts,
        }))
    }

    #[instrument(skip(self), fields(job_id = job_id.as_i64()), err)]
    async fn finalize_job(&self, job_id: JobId, is_success: bool) -> Result<bool, StoreError> {
        let mut tx = self.begin().await?;
        let finalized = self.finalize(&mut tx, job_id, is_success).await?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))?;
        Ok(finalized)
    }

    #[instrument(skip(self), fields(job_id = job_id.as_i64()), err)]
    async fn decrement_attempts(&self, job_id: JobId) -> Result<(), StoreError> {
        sqlx::query(&self.sql(
            r#"
            UPDATE {schema}."job"
            SET "num_attempts" = "num_attempts" - 1
            WHERE "id" = $1 AND "finalized_at" IS NULL
            "#,
        ))
        .bind(job_id.as_i64())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("decrement_attempts", e))?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn finalize_next_failed_job(&self) -> Result<Option<FinalizedJob>, StoreError> {
        let mut tx = self.begin().await?;

        let row = sqlx::query(&self.sql(
            r#"
            SELECT
                "job"."id",
                "job_definition"."name" AS "job_definition_name",
                "flags"."timed_out",
                "flags"."attempts_exhausted",
                "flags"."unmet_dependency"
            FROM {schema}."job" AS "job"
            JOIN {schema}."job_definition" AS "job_definition"
                ON "job"."job_definition_id" = "job_definition"."id"
            CROSS JOIN LATERAL (
                SELECT
                    "job"."created_at"
                        + ("job_definition"."timeout_interval_ms"::double precision * INTERVAL '1 millisecond')
                        < NOW() AS "timed_out",
                    "job"."num_attempts" <= 0 AS "attempts_exhausted",
                    EXISTS (
                        SELECT 1
                        FROM {schema}."job_dependency" AS "dependency"
                        JOIN {schema}."job" AS "required"
                            ON "dependency"."required_job_id" = "required"."id"
                        WHERE "dependency"."job_id" = "job"."id"
                            AND "required"."finalized_at" IS NOT NULL
                            AND "required"."is_success" IS NOT TRUE
                    ) AS "unmet_dependency"
            ) AS "flags"
            WHERE "job"."finalized_at" IS NULL
                AND ("flags"."timed_out" OR "flags"."attempts_exhausted" OR "flags"."unmet_dependency")
            LIMIT 1
            FOR NO KEY UPDATE OF "job" SKIP LOCKED
            "#,
        ))
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("finalize_next_failed_job", e))?;

        let Some(row) = row else {
            tx.commit()
                .await
                .map_err(|e| map_sqlx_error("commit", e))?;
            return Ok(None);
        };

        let candidate = FinalizeableJobRow::from_row(&row)
            .map_err(|e| map_sqlx_error("finalize_next_failed_job", e))?;
        let job_id = JobId::from_i64(candidate.id);
        self.finalize(&mut tx, job_id, false).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))?;

        Ok(Some(FinalizedJob {
            job_id,
            job_definition_name: candidate.job_definition_name,
            reasons: FinalizeReasons {
                timed_out: candidate.timed_out,
                attempts_exhausted: candidate.attempts_exhausted,
                unmet_dependency: candidate.unmet_dependency,
            },
        }))
    }

    #[instrument(skip(self), err)]
    async fn sweep_next_finalized_job(
        &self,
        threshold: Duration,
    ) -> Result<Option<SweptJob>, StoreError> {
        let mut tx = self.begin().await?;

        let row = sqlx::query(&self.sql(
            r#"
            SELECT "job"."id", "job_definition"."name" AS "job_definition_name"
            FROM {schema}."job" AS "job"
            JOIN {schema}."job_definition" AS "job_definition"
                ON "job"."job_definition_id" = "job_definition"."id"
            WHERE "job"."finalized_at" IS NOT NULL
                AND "job"."finalized_at" + ($1::double precision * INTERVAL '1 millisecond') < NOW()
                AND NOT EXISTS (
                    SELECT 1
                    FROM {schema}."job_dependency" AS "dependency"
                    JOIN {schema}."job" AS "dependent"
                        ON "dependency"."job_id" = "dependent"."id"
                    WHERE "dependency"."required_job_id" = "job"."id"
                        AND "dependent"."finalized_at" IS NULL
                )
            LIMIT 1
            FOR UPDATE OF "job" SKIP LOCKED
            "#,
        ))
        .bind(duration_millis(threshold))
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("sweep_next_finalized_job", e))?;

        let swept = match row {
            Some(row) => {
                let id: i64 = row
                    .try_get("id")
                    .map_err(|e| map_sqlx_error("sweep_next_finalized_job", e))?;
                let job_definition_name: String = row
                    .try_get("job_definition_name")
                    .map_err(|e| map_sqlx_error("sweep_next_finalized_job", e))?;
                let job_id = JobId::from_i64(id);
                self.delete_job(&mut tx, job_id).await?;
                Some(SweptJob {
                    job_id,
                    job_definition_name,
                })
            }
            None => None,
        };

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))?;
        Ok(swept)
    }

    #[instrument(skip(self), err)]
    async fn sweep_next_stale_job_definition(
        &self,
        threshold: Duration,
    ) -> Result<Option<SweptJobDefinition>, StoreError> {
        let mut tx = self.begin().await?;

        let row = sqlx::query(&self.sql(
            r#"
            SELECT "job_definition"."id", "job_definition"."name"
            FROM {schema}."job_definition" AS "job_definition"
            WHERE "job_definition"."last_heartbeat_at"
                    + ($1::double precision * INTERVAL '1 millisecond') < NOW()
                AND NOT EXISTS (
                    SELECT 1 FROM {schema}."job" AS "job"
                    WHERE "job"."job_definition_id" = "job_definition"."id"
                )
            LIMIT 1
            FOR UPDATE SKIP LOCKED
            "#,
        ))
        .bind(duration_millis(threshold))
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("sweep_next_stale_job_definition", e))?;

        let swept = match row {
            Some(row) => {
                let id: i64 = row
                    .try_get("id")
                    .map_err(|e| map_sqlx_error("sweep_next_stale_job_definition", e))?;
                let name: String = row
                    .try_get("name")
                    .map_err(|e| map_sqlx_error("sweep_next_stale_job_definition", e))?;
                let id = JobDefinitionId::from_i64(id);
                self.delete_job_definition(&mut tx, id).await?;
                Some(SweptJobDefinition { id, name })
            }
            None => None,
        };

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))?;
        Ok(swept)
    }

    #[instrument(skip(self), err)]
    async fn repeat_next_job_definition(&self) -> Result<Option<RepeatedJob>, StoreError> {
        let mut tx = self.begin().await?;

        let row = sqlx::query(&self.sql(
            r#"
            SELECT "id", "name", "num_attempts"
            FROM {schema}."job_definition"
            WHERE "repeat_interval_ms" IS NOT NULL
                AND (
                    "last_repeated_at" IS NULL
                    OR "last_repeated_at"
                        + ("repeat_interval_ms"::double precision * INTERVAL '1 millisecond')
                        <= NOW()
                )
            LIMIT 1
            FOR NO KEY UPDATE SKIP LOCKED
            "#,
        ))
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("repeat_next_job_definition", e))?;

        let Some(row) = row else {
            tx.commit()
                .await
                .map_err(|e| map_sqlx_error("commit", e))?;
            return Ok(None);
        };

        let id: i64 = row
            .try_get("id")
            .map_err(|e| map_sqlx_error("repeat_next_job_definition", e))?;
        let name: String = row
            .try_get("name")
            .map_err(|e| map_sqlx_error("repeat_next_job_definition", e))?;
        let num_attempts: i32 = row
            .try_get("num_attempts")
            .map_err(|e| map_sqlx_error("repeat_next_job_definition", e))?;
        let job_definition_id = JobDefinitionId::from_i64(id);

        self.stamp_repeated(&mut tx, job_definition_id).await?;
        let job = NewJob::new(job_definition_id, serde_json::json!({})).with_num_attempts(num_attempts);
        let job_id = self.insert_job_row(&mut tx, &job).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))?;

        Ok(Some(RepeatedJob {
            job_id,
            job_definition_id,
            job_definition_name: name,
        }))
    }

    #[instrument(skip(self), fields(job_definition_id = id.as_i64()), err)]
    async fn heartbeat(&self, id: JobDefinitionId) -> Result<bool, StoreError> {
        let result = sqlx::query(&self.sql(
            r#"UPDATE {schema}."job_definition" SET "last_heartbeat_at" = NOW() WHERE "id" = $1"#,
        ))
        .bind(id.as_i64())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("heartbeat", e))?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self), fields(job_id = job_id.as_i64()), err)]
    async fn get_job(&self, job_id: JobId) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query(&self.sql(
            r#"
            SELECT
                "id",
                "job_definition_id",
                "payload",
                "num_attempts",
                "created_at",
                "unlocked_at",
                "finalized_at",
                "is_success"
            FROM {schema}."job"
            WHERE "id" = $1
            "#,
        ))
        .bind(job_id.as_i64())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_job", e))?;

        row.map(|row| JobRow::from_row(&row).map(Job::from))
            .transpose()
            .map_err(|e| map_sqlx_error("get_job", e))
    }

    #[instrument(skip(self), err)]
    async fn get_job_definition(
        &self,
        name: &str,
    ) -> Result<Option<JobDefinitionRecord>, StoreError> {
        let row = sqlx::query(&self.sql(
            r#"
            SELECT
                "id",
                "name",
                "channel",
                "num_attempts",
                "repeat_interval_ms",
                "release_interval_ms",
                "lock_interval_ms",
                "timeout_interval_ms",
                "last_repeated_at",
                "last_released_at",
                "last_heartbeat_at",
                "created_at",
                "updated_at"
            FROM {schema}."job_definition"
            WHERE "name" = $1
            "#,
        ))
        .bind(name)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_job_definition", e))?;

        row.map(|row| JobDefinitionRow::from_row(&row).map(JobDefinitionRecord::from))
            .transpose()
            .map_err(|e| map_sqlx_error("get_job_definition", e))
    }
}

/// Quote a validated identifier for interpolation.
fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn map_sqlx_error(operation: &'static str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => StoreError::Database {
            operation,
            message: match db_err.code() {
                Some(code) => format!("{} (SQLSTATE {})", db_err.message(), code),
                None => db_err.message().to_string(),
            },
        },
        sqlx::Error::PoolClosed => StoreError::Unavailable("connection pool closed".to_string()),
        sqlx::Error::PoolTimedOut => {
            StoreError::Unavailable("timed out acquiring a connection".to_string())
        }
        sqlx::Error::Io(e) => StoreError::Unavailable(format!("io error in {operation}: {e}")),
        other => StoreError::Database {
            operation,
            message: other.to_string(),
        },
    }
}

fn is_foreign_key_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23503";
        }
    }
    false
}

// SQLx row types

#[derive(Debug)]
struct ClaimedJobRow {
    id: i64,
    job_definition_id: i64,
    job_definition_name: String,
    lock_interval_ms: i64,
    payload: serde_json::Value,
    num_attempts: i32,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for ClaimedJobRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(ClaimedJobRow {
            id: row.try_get("id")?,
            job_definition_id: row.try_get("job_definition_id")?,
            job_definition_name: row.try_get("job_definition_name")?,
            lock_interval_ms: row.try_get("lock_interval_ms")?,
            payload: row.try_get("payload")?,
            num_attempts: row.try_get("num_attempts")?,
        })
    }
}

#[derive(Debug)]
struct FinalizeableJobRow {
    id: i64,
    job_definition_name: String,
    timed_out: bool,
    attempts_exhausted: bool,
    unmet_dependency: bool,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for FinalizeableJobRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(FinalizeableJobRow {
            id: row.try_get("id")?,
            job_definition_name: row.try_get("job_definition_name")?,
            timed_out: row.try_get("timed_out")?,
            attempts_exhausted: row.try_get("attempts_exhausted")?,
            unmet_dependency: row.try_get("unmet_dependency")?,
        })
    }
}

#[derive(Debug)]
struct JobRow {
    id: i64,
    job_definition_id: i64,
    payload: serde_json::Value,
    num_attempts: i32,
    created_at: DateTime<Utc>,
    unlocked_at: DateTime<Utc>,
    finalized_at: Option<DateTime<Utc>>,
    is_success: Option<bool>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for JobRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            job_definition_id: row.try_get("job_definition_id")?,
            payload: row.try_get("payload")?,
            num_attempts: row.try_get("num_attempts")?,
            created_at: row.try_get("created_at")?,
            unlocked_at: row.try_get("unlocked_at")?,
            finalized_at: row.try_get("finalized_at")?,
            is_success: row.try_get("is_success")?,
        })
    }
}

impl From<JobRow> for Job {
    fn from(row: JobRow) -> Self {
        Job {
            id: JobId::from_i64(row.id),
            job_definition_id: JobDefinitionId::from_i64(row.job_definition_id),
            payload: row.payload,
            num_attempts: row.num_attempts,
            created_at: row.created_at,
            unlocked_at: row.unlocked_at,
            finalized_at: row.finalized_at,
            is_success: row.is_success,
        }
    }
}

#[derive(Debug)]
struct JobDefinitionRow {
    id: i64,
    name: String,
    channel: String,
    num_attempts: i32,
    repeat_interval_ms: Option<i64>,
    release_interval_ms: i64,
    lock_interval_ms: i64,
    timeout_interval_ms: i64,
    last_repeated_at: Option<DateTime<Utc>>,
    last_released_at: Option<DateTime<Utc>>,
    last_heartbeat_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for JobDefinitionRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobDefinitionRow {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            channel: row.try_get("channel")?,
            num_attempts: row.try_get("num_attempts")?,
            repeat_interval_ms: row.try_get("repeat_interval_ms")?,
            release_interval_ms: row.try_get("release_interval_ms")?,
            lock_interval_ms: row.try_get("lock_interval_ms")?,
            timeout_interval_ms: row.try_get("timeout_interval_ms")?,
            last_repeated_at: row.try_get("last_repeated_at")?,
            last_released_at: row.try_get("last_released_at")?,
            last_heartbeat_at: row.try_get("last_heartbeat_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl From<JobDefinitionRow> for JobDefinitionRecord {
    fn from(row: JobDefinitionRow) -> Self {
        JobDefinitionRecord {
            id: JobDefinitionId::from_i64(row.id),
            name: row.name,
            channel: row.channel,
            num_attempts: row.num_attempts,
            repeat_interval_ms: row.repeat_interval_ms,
            release_interval_ms: row.release_interval_ms,
            lock_interval_ms: row.lock_interval_ms,
            timeout_interval_ms: row.timeout_interval_ms,
            last_repeated_at: row.last_repeated_at,
            last_released_at: row.last_released_at,
            last_heartbeat_at: row.last_heartbeat_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigError;
    use sqlx::postgres::PgPoolOptions;

    #[tokio::test]
    async fn invalid_schema_is_a_config_error() {
        let pool = PgPoolOptions::new()
            .connect_lazy("postgres://localhost/jobforge")
            .unwrap();
        let config = StoreConfig::default().with_schema("bad\"; DROP SCHEMA public");

        let err = PostgresJobStore::with_config(pool, &config).unwrap_err();
        assert!(matches!(
            err,
            StoreError::Config(ConfigError::InvalidSchema(_))
        ));
    }

    #[test]
    fn statements_use_quoted_schema() {
        let quoted = quote_ident("_jobforge");
        assert_eq!(quoted, "\"_jobforge\"");
        let sql = r#"SELECT 1 FROM {schema}."job""#.replace(SCHEMA_PLACEHOLDER, &quoted);
        assert_eq!(sql, r#"SELECT 1 FROM "_jobforge"."job""#);
    }

    #[test]
    fn quote_escapes_embedded_quotes() {
        assert_eq!(quote_ident("a\"b"), "\"a\"\"b\"");
    }

    #[test]
    fn pool_errors_are_unavailable() {
        assert!(matches!(
            map_sqlx_error("claim_available_job", sqlx::Error::PoolClosed),
            StoreError::Unavailable(_)
        ));
        assert!(matches!(
            map_sqlx_error("get_job", sqlx::Error::RowNotFound),
            StoreError::Database { operation: "get_job", .. }
        ));
    }
}
