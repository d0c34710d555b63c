use anyhow::{Context, Result};
use sqlx::Row;

use crate::models::Connection;

use super::ChatRepository;

impl ChatRepository {
    /// Record a live session. The row doubles as membership in the owner's connection set.
    pub async fn insert_connection(&self, conn: &Connection) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO connections (session_id, user_id, instance_id, created_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT(session_id) DO UPDATE SET
                user_id = excluded.user_id,
                instance_id = excluded.instance_id,
                created_at = excluded.created_at
            "#,
        )
        .bind(&conn.session_id)
        .bind(conn.user_id as i64)
        .bind(&conn.instance_id)
        .bind(conn.created_at)
        .execute(&self.pool)
        .await
        .context("Failed to insert connection")?;

        Ok(())
    }

    pub async fn delete_connection(&self, session_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM connections WHERE session_id = $1")
            .bind(session_id)
            .execute(&self.pool)
            .await
            .context("Failed to delete connection")?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn get_connection(&self, session_id: &str) -> Result<Option<Connection>> {
        let row = sqlx::query(
            r#"
            SELECT session_id, user_id, instance_id, created_at
            FROM connections
            WHERE session_id = $1
            "#,
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| Connection {
            session_id: r.get("session_id"),
            user_id: r.get::<i64, _>("user_id") as u64,
            instance_id: r.get("instance_id"),
            created_at: r.get("created_at"),
        }))
    }

    /// Session ids of a user in the order they were attached.
    pub async fn list_connection_ids(&self, user_id: u64) -> Result<Vec<String>> {
        let ids: Vec<String> = sqlx::query_scalar(
            "SELECT session_id FROM connections WHERE user_id = $1 ORDER BY id ASC",
        )
        .bind(user_id as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids)
    }

    /// Drop connection records left behind by a previous run of `instance_id`.
    pub async fn purge_instance_connections(&self, instance_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM connections WHERE instance_id = $1")
            .bind(instance_id)
            .execute(&self.pool)
            .await
            .context("Failed to purge stale connections")?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use crate::models::Connection;
    use crate::repository::test_helpers::{seed_user, test_repository};

    fn conn(session_id: &str, user_id: u64, instance_id: &str) -> Connection {
        Connection {
            session_id: session_id.into(),
            user_id,
            instance_id: instance_id.into(),
            created_at: 1000,
        }
    }

    #[tokio::test]
    async fn test_connection_lifecycle() {
        let repo = test_repository().await;
        seed_user(&repo, 1, "Ada", "visitor").await;

        repo.insert_connection(&conn("s1", 1, "node-a")).await.unwrap();
        repo.insert_connection(&conn("s2", 1, "node-b")).await.unwrap();

        let fetched = repo.get_connection("s2").await.unwrap().unwrap();
        assert_eq!(fetched.user_id, 1);
        assert_eq!(fetched.instance_id, "node-b");
        assert_eq!(repo.list_connection_ids(1).await.unwrap(), vec!["s1", "s2"]);

        assert!(repo.delete_connection("s1").await.unwrap());
        assert!(!repo.delete_connection("s1").await.unwrap());
        assert_eq!(repo.list_connection_ids(1).await.unwrap(), vec!["s2"]);
        assert!(repo.get_connection("s1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_connection_requires_known_user() {
        let repo = test_repository().await;
        assert!(repo.insert_connection(&conn("s1", 404, "node-a")).await.is_err());
    }

    #[tokio::test]
    async fn test_purge_only_touches_own_instance() {
        let repo = test_repository().await;
        seed_user(&repo, 1, "Ada", "visitor").await;
        repo.insert_connection(&conn("s1", 1, "node-a")).await.unwrap();
        repo.insert_connection(&conn("s2", 1, "node-a")).await.unwrap();
        repo.insert_connection(&conn("s3", 1, "node-b")).await.unwrap();

        assert_eq!(repo.purge_instance_connections("node-a").await.unwrap(), 2);
        assert_eq!(repo.list_connection_ids(1).await.unwrap(), vec!["s3"]);
    }
}
