//! User profiles, including the argon2-hashed password used by `set_password`.

use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};
use async_trait::async_trait;

use super::SqliteStore;
use crate::models::{UserProfile, UserRow};
use crate::store::{ProfileStore, StoreError};

const USER_COLUMNS: &str = "id, display_name, email, program, share_key, instructor_programs_json, last_activity, created_at, updated_at";

/// Hash a password with Argon2id and a random salt.
fn hash_password(password: &str) -> Result<String, StoreError> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| StoreError::Password(format!("failed to hash password: {e}")))?;
    Ok(hash.to_string())
}

/// Verify a password against a stored Argon2id hash.
fn verify_password(password: &str, hash: &str) -> Result<bool, StoreError> {
    let parsed = PasswordHash::new(hash)
        .map_err(|e| StoreError::Password(format!("invalid password hash: {e}")))?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok())
}

impl SqliteStore {
    /// Check a password for a user. Users without a password never match.
    pub async fn check_password(&self, id: &str, password: &str) -> Result<bool, StoreError> {
        let hash: Option<Option<String>> =
            sqlx::query_scalar("SELECT password_hash FROM users WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        match hash.flatten() {
            Some(hash) => verify_password(password, &hash),
            None => Ok(false),
        }
    }
}

#[async_trait]
impl ProfileStore for SqliteStore {
    async fn find_by_id(&self, id: &str) -> Result<Option<UserProfile>, StoreError> {
        let row = sqlx::query_as::<_, UserRow>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(UserProfile::from))
    }

    async fn find_by_program(&self, program: &str) -> Result<Vec<UserProfile>, StoreError> {
        let rows = sqlx::query_as::<_, UserRow>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE program = ? ORDER BY display_name"
        ))
        .bind(program)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(UserProfile::from).collect())
    }

    async fn save(&self, profile: &UserProfile) -> Result<(), StoreError> {
        let programs = serde_json::to_string(&profile.instructor_programs)
            .unwrap_or_else(|_| "[]".to_string());
        sqlx::query(
            "INSERT INTO users (id, display_name, email, program, share_key, instructor_programs_json, last_activity, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                display_name = excluded.display_name,
                email = excluded.email,
                program = excluded.program,
                share_key = excluded.share_key,
                instructor_programs_json = excluded.instructor_programs_json,
                last_activity = excluded.last_activity,
                updated_at = excluded.updated_at",
        )
        .bind(&profile.id)
        .bind(&profile.display_name)
        .bind(&profile.email)
        .bind(&profile.program)
        .bind(&profile.share_key)
        .bind(programs)
        .bind(profile.last_activity)
        .bind(profile.created_at)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn touch_last_activity(&self, id: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE users SET last_activity = ? WHERE id = ?")
            .bind(chrono::Utc::now().timestamp())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_password(&self, id: &str, password: &str) -> Result<(), StoreError> {
        let hash = hash_password(password)?;
        let result = sqlx::query("UPDATE users SET password_hash = ?, updated_at = ? WHERE id = ?")
            .bind(hash)
            .bind(chrono::Utc::now().timestamp())
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("user {id}")));
        }
        Ok(())
    }
}
