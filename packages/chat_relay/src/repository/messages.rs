use anyhow::{Context, Result};
use sqlx::Row;

use crate::models::ChatMessage;

use super::ChatRepository;

impl ChatRepository {
    pub async fn insert_chat_message(&self, msg: &ChatMessage) -> Result<i64> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO chat_messages (message_type, message, image_url, sender, chat_window_uid, created_at)
            VALUES ($1, $2, CAST($3 AS TEXT), $4, $5, $6)
            RETURNING id
            "#,
        )
        .bind(&msg.message_type)
        .bind(&msg.message)
        .bind(&msg.image_url)
        .bind(msg.sender as i64)
        .bind(&msg.chat_window_uid)
        .bind(msg.created_at)
        .fetch_one(&self.pool)
        .await
        .context("Failed to insert chat message")?;

        Ok(id)
    }

    /// Full history of a window, oldest first.
    pub async fn list_chat_messages(&self, chat_window_uid: &str) -> Result<Vec<ChatMessage>> {
        let rows = sqlx::query(
            r#"
            SELECT id, message_type, message, image_url, sender, chat_window_uid, created_at
            FROM chat_messages
            WHERE chat_window_uid = $1
            ORDER BY id ASC
            "#,
        )
        .bind(chat_window_uid)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| ChatMessage {
                id: r.get("id"),
                message_type: r.get("message_type"),
                message: r.get("message"),
                image_url: r.get("image_url"),
                sender: r.get::<i64, _>("sender") as u64,
                chat_window_uid: r.get("chat_window_uid"),
                created_at: r.get("created_at"),
            })
            .collect())
    }
}
