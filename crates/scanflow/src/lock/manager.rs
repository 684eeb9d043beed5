use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::config::InstanceConfig;

#[derive(Debug, Clone)]
pub struct LockTicket {
    pub instance_name: String,
    pub slot_index: i32,
    pub lease_token: Uuid,
    pub expires_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct LockManager {
    pool: PgPool,
    instances: Vec<InstanceConfig>,
}

impl LockManager {
    pub fn new(pool: PgPool, instances: Vec<InstanceConfig>) -> Self {
        Self { pool, instances }
    }

    /// Ensures `instance_locks` carries exactly `concurrency_cap` slot rows
    /// per configured instance. Idempotent: safe to call on every startup as
    /// the instance pool's capacity changes.
    pub async fn sync_slots(&self) -> anyhow::Result<()> {
        for inst in &self.instances {
            for slot in 0..inst.concurrency_cap {
                sqlx::query!(
                    r#"
                    INSERT INTO instance_locks (instance_name, slot_index)
                    VALUES ($1, $2)
                    ON CONFLICT (instance_name, slot_index) DO NOTHING
                    "#,
                    inst.name,
                    slot,
                )
                .execute(&self.pool)
                .await?;
            }

            sqlx::query!(
                r#"
                DELETE FROM instance_locks
                WHERE instance_name = $1 AND slot_index >= $2
                "#,
                inst.name,
                inst.concurrency_cap,
            )
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    /// Tries every configured instance once, starting after the one
    /// `lock_cursor` last handed out, and claims the first free (or
    /// lease-expired) slot it finds. Returns `None` if every instance is
    /// saturated, which the Dispatcher treats as `NoSlotAvailable` and
    /// requeues the job for a later attempt.
    pub async fn acquire(&self, holder_job_id: Uuid, lease_ttl_seconds: i64) -> anyhow::Result<Option<LockTicket>> {
        if self.instances.is_empty() {
            return Ok(None);
        }

        let start = self.next_cursor_index().await?;
        let n = self.instances.len();

        for offset in 0..n {
            let idx = (start + offset) % n;
            let instance = &self.instances[idx];

            if let Some(ticket) = self.try_claim_slot(instance, holder_job_id, lease_ttl_seconds).await? {
                self.advance_cursor(&instance.name).await?;
                return Ok(Some(ticket));
            }
        }

        Ok(None)
    }

    async fn try_claim_slot(
        &self,
        instance: &InstanceConfig,
        holder_job_id: Uuid,
        lease_ttl_seconds: i64,
    ) -> anyhow::Result<Option<LockTicket>> {
        let mut tx = self.pool.begin().await?;

        let candidate = sqlx::query!(
            r#"
            SELECT slot_index
            FROM instance_locks
            WHERE instance_name = $1
              AND (holder_job_id IS NULL OR expires_at < now())
            ORDER BY slot_index ASC
            FOR UPDATE SKIP LOCKED
            LIMIT 1
            "#,
            instance.name,
        )
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = candidate else {
            tx.commit().await?;
            return Ok(None);
        };

        let lease_token = Uuid::new_v4();
        let rec = sqlx::query!(
            r#"
            UPDATE instance_locks
            SET lease_token = $3,
                holder_job_id = $4,
                acquired_at = now(),
                expires_at = now() + ($5::bigint * interval '1 second')
            WHERE instance_name = $1 AND slot_index = $2
            RETURNING expires_at AS "expires_at!"
            "#,
            instance.name,
            row.slot_index,
            lease_token,
            holder_job_id,
            lease_ttl_seconds,
        )
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(Some(LockTicket {
            instance_name: instance.name.clone(),
            slot_index: row.slot_index,
            lease_token,
            expires_at: rec.expires_at,
        }))
    }

    pub async fn heartbeat(
        &self,
        instance_name: &str,
        slot_index: i32,
        lease_token: Uuid,
        lease_ttl_seconds: i64,
    ) -> anyhow::Result<bool> {
        let res = sqlx::query!(
            r#"
            UPDATE instance_locks
            SET expires_at = now() + ($4::bigint * interval '1 second')
            WHERE instance_name = $1 AND slot_index = $2 AND lease_token = $3
            "#,
            instance_name,
            slot_index,
            lease_token,
            lease_ttl_seconds,
        )
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected() == 1)
    }

    pub async fn release(
        &self,
        instance_name: &str,
        slot_index: i32,
        lease_token: Uuid,
    ) -> anyhow::Result<()> {
        sqlx::query!(
            r#"
            UPDATE instance_locks
            SET lease_token = NULL,
                holder_job_id = NULL,
                acquired_at = NULL,
                expires_at = NULL
            WHERE instance_name = $1 AND slot_index = $2 AND lease_token = $3
            "#,
            instance_name,
            slot_index,
            lease_token,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Reclaims slots whose lease has expired without an explicit release.
    pub async fn reap_expired(&self) -> anyhow::Result<u64> {
        let res = sqlx::query!(
            r#"
            UPDATE instance_locks
            SET lease_token = NULL,
                holder_job_id = NULL,
                acquired_at = NULL,
                expires_at = NULL
            WHERE expires_at IS NOT NULL AND expires_at < now()
            "#
        )
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected())
    }

    async fn next_cursor_index(&self) -> anyhow::Result<usize> {
        let rec = sqlx::query!("SELECT last_instance_name FROM lock_cursor WHERE id = 1")
            .fetch_one(&self.pool)
            .await?;

        let Some(last) = rec.last_instance_name else {
            return Ok(0);
        };

        let pos = self.instances.iter().position(|i| i.name == last);
        Ok(pos.map(|p| (p + 1) % self.instances.len()).unwrap_or(0))
    }

    async fn advance_cursor(&self, instance_name: &str) -> anyhow::Result<()> {
        sqlx::query!(
            "UPDATE lock_cursor SET last_instance_name = $1, updated_at = now() WHERE id = 1",
            instance_name,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
