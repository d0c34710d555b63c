use anyhow::{Context, Result};

use super::ChatRepository;

impl ChatRepository {
    /// Register `instance_id` as alive at `now`, keeping its original start time.
    pub async fn touch_instance(&self, instance_id: &str, now: i64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO instances (instance_id, started_at, last_seen)
            VALUES ($1, $2, $2)
            ON CONFLICT(instance_id) DO UPDATE SET last_seen = excluded.last_seen
            "#,
        )
        .bind(instance_id)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("Failed to record instance liveness")?;

        Ok(())
    }

    pub async fn instance_last_seen(&self, instance_id: &str) -> Result<Option<i64>> {
        let last_seen: Option<i64> =
            sqlx::query_scalar("SELECT last_seen FROM instances WHERE instance_id = $1")
                .bind(instance_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(last_seen)
    }

    /// Forget instances not seen since `cutoff` together with their connection
    /// records. Returns the names that were removed.
    pub async fn reap_dead_instances(&self, cutoff: i64) -> Result<Vec<String>> {
        let mut tx = self.pool.begin().await?;

        let dead: Vec<String> =
            sqlx::query_scalar("SELECT instance_id FROM instances WHERE last_seen < $1")
                .bind(cutoff)
                .fetch_all(&mut *tx)
                .await?;

        for instance_id in &dead {
            sqlx::query("DELETE FROM connections WHERE instance_id = $1")
                .bind(instance_id)
                .execute(&mut *tx)
                .await
                .context("Failed to drop connections of a dead instance")?;
            // An instance that heartbeated since the select keeps its row
            sqlx::query("DELETE FROM instances WHERE instance_id = $1 AND last_seen < $2")
                .bind(instance_id)
                .bind(cutoff)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        Ok(dead)
    }

    /// Drop the liveness row of an instance that is shutting down.
    pub async fn remove_instance(&self, instance_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM instances WHERE instance_id = $1")
            .bind(instance_id)
            .execute(&self.pool)
            .await
            .context("Failed to remove instance")?;

        Ok(result.rows_affected() > 0)
    }
}
