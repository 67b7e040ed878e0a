// Repository layer — SQLite-backed implementations of the session stores.
//
// Each store lives in its own file with `impl ... for SqliteStore`.

use sqlx::sqlite::SqlitePool;

mod buckets;
mod profiles;

#[cfg(test)]
pub(crate) mod test_helpers;

#[derive(Clone)]
pub struct SqliteStore {
    pub(crate) pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}
