use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::Row;
use sqlx::any::AnyRow;

use crate::models::User;

use super::ChatRepository;

pub(super) fn user_from_row(r: &AnyRow) -> User {
    User {
        id: r.get("id"),
        created_at: r.get("created_at"),
        user_id: r.get::<i64, _>("user_id") as u64,
        name: r.get("name"),
        user_type: r.get("user_type"),
        email: r.get("email"),
        phone_no: r.get("phone_no"),
        profile_picture: r.get("profile_picture"),
        connections: Vec::new(),
        last_auth_token: r.get("last_auth_token"),
    }
}

impl ChatRepository {
    /// Insert a user, or refresh its profile if the external id is already known.
    pub async fn insert_user(&self, user: &User) -> Result<i64> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO users (user_id, name, user_type, email, phone_no, profile_picture, last_auth_token, created_at, updated_at)
            VALUES ($1, $2, $3, CAST($4 AS TEXT), CAST($5 AS TEXT), CAST($6 AS TEXT), CAST($7 AS TEXT), $8, $9)
            ON CONFLICT(user_id) DO UPDATE SET
                name = excluded.name,
                user_type = excluded.user_type,
                email = excluded.email,
                phone_no = excluded.phone_no,
                profile_picture = excluded.profile_picture,
                last_auth_token = COALESCE(excluded.last_auth_token, users.last_auth_token),
                updated_at = excluded.updated_at
            RETURNING id
            "#,
        )
        .bind(user.user_id as i64)
        .bind(&user.name)
        .bind(&user.user_type)
        .bind(&user.email)
        .bind(&user.phone_no)
        .bind(&user.profile_picture)
        .bind(&user.last_auth_token)
        .bind(user.created_at)
        .bind(Utc::now().timestamp())
        .fetch_one(&self.pool)
        .await
        .context("Failed to insert user")?;

        Ok(id)
    }

    /// Update profile fields and the last auth token. Returns false for an unknown user.
    pub async fn update_user(&self, user: &User) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE users
            SET name = $1, user_type = $2, email = CAST($3 AS TEXT), phone_no = CAST($4 AS TEXT),
                profile_picture = CAST($5 AS TEXT),
                last_auth_token = COALESCE(CAST($6 AS TEXT), last_auth_token), updated_at = $7
            WHERE user_id = $8
            "#,
        )
        .bind(&user.name)
        .bind(&user.user_type)
        .bind(&user.email)
        .bind(&user.phone_no)
        .bind(&user.profile_picture)
        .bind(&user.last_auth_token)
        .bind(Utc::now().timestamp())
        .bind(user.user_id as i64)
        .execute(&self.pool)
        .await
        .context("Failed to update user")?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn get_user_by_user_id(&self, user_id: u64) -> Result<Option<User>> {
        let row = sqlx::query(
            r#"
            SELECT id, user_id, name, user_type, email, phone_no, profile_picture, last_auth_token, created_at
            FROM users
            WHERE user_id = $1
            "#,
        )
        .bind(user_id as i64)
        .fetch_optional(&self.pool)
        .await?;

        self.hydrate(row.as_ref().map(user_from_row)).await
    }

    /// The owner of a live session, found through its connection record.
    pub async fn get_user_by_session(&self, session_id: &str) -> Result<Option<User>> {
        let row = sqlx::query(
            r#"
            SELECT u.id, u.user_id, u.name, u.user_type, u.email, u.phone_no, u.profile_picture,
                   u.last_auth_token, u.created_at
            FROM users u
            JOIN connections c ON c.user_id = u.user_id
            WHERE c.session_id = $1
            "#,
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;

        self.hydrate(row.as_ref().map(user_from_row)).await
    }

    pub async fn get_user_by_auth_token(&self, token: &str) -> Result<Option<User>> {
        let row = sqlx::query(
            r#"
            SELECT id, user_id, name, user_type, email, phone_no, profile_picture, last_auth_token, created_at
            FROM users
            WHERE last_auth_token = $1
            ORDER BY updated_at DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;

        self.hydrate(row.as_ref().map(user_from_row)).await
    }

    /// Users a `user_type` user may chat with: every other user of a different type.
    pub async fn list_chat_partners(&self, user_id: u64, user_type: &str) -> Result<Vec<User>> {
        let rows = sqlx::query(
            r#"
            SELECT id, user_id, name, user_type, email, phone_no, profile_picture, last_auth_token, created_at
            FROM users
            WHERE user_id <> $1 AND user_type <> $2
            ORDER BY name ASC, user_id ASC
            "#,
        )
        .bind(user_id as i64)
        .bind(user_type)
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

    async fn hydrate(&self, user: Option<User>) -> Result<Option<User>> {
        match user {
            Some(mut user) => {
                user.connections = self.list_connection_ids(user.user_id).await?;
                Ok(Some(user))
            }
            None => Ok(None),
        }
    }
}
