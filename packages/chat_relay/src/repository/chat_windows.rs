use anyhow::{Context, Result};
use sqlx::Row;
use sqlx::any::AnyRow;

use crate::models::{ChatWindow, User};

use super::ChatRepository;
use super::users::user_from_row;

const WINDOW_COLUMNS: &str = "id, uid, participants_key, last_message, last_message_at, \
     last_message_sender, last_message_sender_user_id, last_message_seen_by_recipient, created_at";

fn window_from_row(r: &AnyRow) -> ChatWindow {
    ChatWindow {
        id: r.get("id"),
        created_at: r.get("created_at"),
        uid: r.get("uid"),
        participants: Vec::new(),
        participants_key: r.get("participants_key"),
        last_message: r.get("last_message"),
        last_message_at: r.get("last_message_at"),
        last_message_sender: r.get("last_message_sender"),
        last_message_sender_user_id: r.get::<i64, _>("last_message_sender_user_id") as u64,
        last_message_seen_by_recipient: r.get::<i64, _>("last_message_seen_by_recipient") != 0,
    }
}

impl ChatRepository {
    /// Insert a window and its two participant links in one transaction.
    /// Fails if a window for the same pair already exists.
    pub async fn insert_chat_window(&self, window: &ChatWindow) -> Result<i64> {
        let mut tx = self.pool.begin().await?;

        let window_id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO chat_windows (uid, participants_key, last_message, last_message_at,
                last_message_sender, last_message_sender_user_id, last_message_seen_by_recipient, created_at)
            VALUES ($1, $2, $3, CAST($4 AS BIGINT), $5, $6, $7, $8)
            RETURNING id
            "#,
        )
        .bind(&window.uid)
        .bind(&window.participants_key)
        .bind(&window.last_message)
        .bind(window.last_message_at)
        .bind(&window.last_message_sender)
        .bind(window.last_message_sender_user_id as i64)
        .bind(i64::from(window.last_message_seen_by_recipient))
        .bind(window.created_at)
        .fetch_one(&mut *tx)
        .await
        .context("Failed to insert chat window")?;

        for (ordinal, participant) in window.participants.iter().enumerate() {
            sqlx::query(
                "INSERT INTO chat_window_participants (chat_window_id, user_id, ordinal) VALUES ($1, $2, $3)",
            )
            .bind(window_id)
            .bind(participant.user_id as i64)
            .bind(ordinal as i64)
            .execute(&mut *tx)
            .await
            .context("Failed to link chat window participant")?;
        }

        tx.commit().await?;

        Ok(window_id)
    }

    pub async fn get_chat_window_by_uid(&self, uid: &str) -> Result<Option<ChatWindow>> {
        let sql = format!("SELECT {WINDOW_COLUMNS} FROM chat_windows WHERE uid = $1");
        let row = sqlx::query(&sql)
            .bind(uid)
            .fetch_optional(&self.pool)
            .await?;

        self.with_participants(row.as_ref().map(window_from_row))
            .await
    }

    /// Look the pair up under both key orders.
    pub async fn get_chat_window_by_participants(
        &self,
        a: u64,
        b: u64,
    ) -> Result<Option<ChatWindow>> {
        let sql = format!(
            "SELECT {WINDOW_COLUMNS} FROM chat_windows WHERE participants_key IN ($1, $2) LIMIT 1"
        );
        let row = sqlx::query(&sql)
            .bind(format!("{a}&{b}"))
            .bind(format!("{b}&{a}"))
            .fetch_optional(&self.pool)
            .await?;

        self.with_participants(row.as_ref().map(window_from_row))
            .await
    }

    /// Every window `user_id` takes part in, most recent message first.
    pub async fn list_chat_windows_by_participant(&self, user_id: u64) -> Result<Vec<ChatWindow>> {
        let rows = sqlx::query(
            r#"
            SELECT w.id, w.uid, w.participants_key, w.last_message, w.last_message_at,
                   w.last_message_sender, w.last_message_sender_user_id,
                   w.last_message_seen_by_recipient, w.created_at
            FROM chat_windows w
            JOIN chat_window_participants p ON p.chat_window_id = w.id
            WHERE p.user_id = $1
            ORDER BY COALESCE(w.last_message_at, w.created_at) DESC, w.id DESC
            "#,
        )
        .bind(user_id as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut windows = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut window = window_from_row(row);
            window.participants = self.list_participants(window.id).await?;
            windows.push(window);
        }
        Ok(windows)
    }

    pub async fn update_chat_window_last_message_info(&self, window: &ChatWindow) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE chat_windows
            SET last_message = $1, last_message_at = CAST($2 AS BIGINT), last_message_sender = $3,
                last_message_sender_user_id = $4, last_message_seen_by_recipient = $5
            WHERE uid = $6
            "#,
        )
        .bind(&window.last_message)
        .bind(window.last_message_at)
        .bind(&window.last_message_sender)
        .bind(window.last_message_sender_user_id as i64)
        .bind(i64::from(window.last_message_seen_by_recipient))
        .bind(&window.uid)
        .execute(&self.pool)
        .await
        .context("Failed to update chat window")?;

        Ok(())
    }

    pub async fn mark_last_message_seen(&self, uid: &str) -> Result<()> {
        sqlx::query("UPDATE chat_windows SET last_message_seen_by_recipient = 1 WHERE uid = $1")
            .bind(uid)
            .execute(&self.pool)
            .await
            .context("Failed to mark chat window seen")?;

        Ok(())
    }

    async fn list_participants(&self, window_id: i64) -> Result<Vec<User>> {
        let rows = sqlx::query(
            r#"
            SELECT u.id, u.user_id, u.name, u.user_type, u.email, u.phone_no, u.profile_picture,
                   u.last_auth_token, u.created_at
            FROM users u
            JOIN chat_window_participants p ON p.user_id = u.user_id
            WHERE p.chat_window_id = $1
            ORDER BY p.ordinal ASC, u.user_id ASC
            "#,
        )
        .bind(window_id)
        .fetch_all(&self.pool)
        .await?;

        let mut users = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut user = user_from_row(row);
            user.connections = self.list_connection_ids(user.user_id).await?;
            users.push(user);
        }
        Ok(users)
    }

    async fn with_participants(&self, window: Option<ChatWindow>) -> Result<Option<ChatWindow>> {
        match window {
            Some(mut window) => {
                window.participants = self.list_participants(window.id).await?;
                Ok(Some(window))
            }
            None => Ok(None),
        }
    }
}
