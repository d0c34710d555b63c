// Repository layer: each domain lives in its own file with `impl ChatRepository`.
//
// Statements go through the `Any` driver and must run on SQLite and Postgres:
// `$N` placeholders, no rowid, no SQLite-only functions. The Any driver binds
// NULL as an integer on Postgres, so nullable text parameters are wrapped in
// `CAST($N AS TEXT)`.

use sqlx::AnyPool;

mod chat_windows;
mod connections;
mod instances;
mod messages;
mod users;

#[cfg(test)]
pub(crate) mod test_helpers;

#[derive(Clone)]
pub struct ChatRepository {
    pub(crate) pool: AnyPool,
}

impl ChatRepository {
    pub fn new(pool: AnyPool) -> Self {
        Self { pool }
    }
}
