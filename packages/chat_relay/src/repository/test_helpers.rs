use sqlx::any::AnyPoolOptions;

use crate::db::Dialect;
use crate::models::User;

/// Create a fresh ChatRepository backed by an in-memory SQLite database.
/// Each call returns an isolated database with all migrations applied.
pub async fn test_repository() -> super::ChatRepository {
    sqlx::any::install_default_drivers();
    let pool = AnyPoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory SQLite pool");

    crate::db::run_migrations(&pool, Dialect::Sqlite)
        .await
        .expect("Failed to run migrations");

    sqlx::query("PRAGMA foreign_keys = ON")
        .execute(&pool)
        .await
        .expect("Failed to enable foreign keys");

    super::ChatRepository::new(pool)
}

/// Insert a user and return it with its row id filled in.
pub async fn seed_user(
    repo: &super::ChatRepository,
    user_id: u64,
    name: &str,
    user_type: &str,
) -> User {
    let mut user = User::new(user_id, name, user_type);
    user.id = repo.insert_user(&user).await.expect("insert user");
    user
}
