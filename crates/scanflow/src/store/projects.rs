use crate::model::{Project, ProjectStatus};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

#[derive(Clone)]
pub struct ProjectsRepo {
    pool: PgPool,
}

impl ProjectsRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn create(
        &self,
        name: &str,
        csv_artifact_path: &str,
        config_override: Option<Value>,
    ) -> anyhow::Result<Uuid> {
        let rec = sqlx::query!(
            r#"
            INSERT INTO projects (name, csv_artifact_path, config_override, status)
            VALUES ($1, $2, $3, 'created')
            RETURNING id
            "#,
            name,
            csv_artifact_path,
            config_override,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(rec.id)
    }

    pub async fn get(&self, id: Uuid) -> anyhow::Result<Option<Project>> {
        let project = sqlx::query_as::<_, Project>("SELECT * FROM projects WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(project)
    }

    pub async fn mark_collecting(&self, id: Uuid) -> anyhow::Result<()> {
        sqlx::query("UPDATE projects SET status = 'collecting', updated_at = now() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_derived_stats(
        &self,
        id: Uuid,
        build_count: i64,
        commit_count: i64,
        unique_branch_count: i64,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            UPDATE projects
            SET build_count = $2, commit_count = $3, unique_branch_count = $4, updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(build_count)
        .bind(commit_count)
        .bind(unique_branch_count)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Recomputes the project's aggregate status from its jobs:
    /// DONE if every job is SUCCEEDED, PARTIAL if some are
    /// FAILED_PERMANENT with the rest SUCCEEDED, otherwise COLLECTING.
    pub async fn recompute_status(&self, id: Uuid) -> anyhow::Result<String> {
        let row = sqlx::query!(
            r#"
            SELECT
                COUNT(*) AS "total!",
                COUNT(*) FILTER (WHERE state = 'succeeded') AS "succeeded!",
                COUNT(*) FILTER (WHERE state = 'failed_permanent') AS "failed!"
            FROM scan_jobs
            WHERE project_id = $1
            "#,
            id
        )
        .fetch_one(&self.pool)
        .await?;

        let status = if row.total == 0 {
            ProjectStatus::Created.as_str()
        } else if row.succeeded + row.failed < row.total {
            ProjectStatus::Collecting.as_str()
        } else if row.failed == 0 {
            ProjectStatus::Done.as_str()
        } else {
            ProjectStatus::Partial.as_str()
        };

        sqlx::query("UPDATE projects SET status = $2, updated_at = now() WHERE id = $1")
            .bind(id)
            .bind(status)
            .execute(&self.pool)
            .await?;

        Ok(status.to_string())
    }
}
