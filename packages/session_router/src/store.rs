//! Contracts for the profile and bucket stores a session calls into.
//!
//! Sessions never touch persistence directly; they go through these traits so
//! the SQLite repository (or any other store) can be swapped in at startup.

use async_trait::async_trait;

use crate::models::{BucketRecord, UserProfile};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("password error: {0}")]
    Password(String),
    #[error("not found: {0}")]
    NotFound(String),
}

/// Reasons a session refuses to act on someone else's data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthorizationError {
    #[error("authentication required")]
    NotAuthenticated,
    #[error("bucket {bucket_id} is not owned by the acting user")]
    NotBucketOwner { bucket_id: String },
    #[error("acting user is not an instructor of program {program}")]
    NotInstructor { program: String },
}

#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn find_by_id(&self, id: &str) -> Result<Option<UserProfile>, StoreError>;

    /// All users enrolled in `program`.
    async fn find_by_program(&self, program: &str) -> Result<Vec<UserProfile>, StoreError>;

    async fn save(&self, profile: &UserProfile) -> Result<(), StoreError>;

    async fn touch_last_activity(&self, id: &str) -> Result<(), StoreError>;

    async fn set_password(&self, id: &str, password: &str) -> Result<(), StoreError>;
}

#[async_trait]
pub trait BucketStore: Send + Sync {
    async fn find_by_id(&self, id: &str) -> Result<Option<BucketRecord>, StoreError>;

    async fn find_by_user(&self, user_id: &str) -> Result<Vec<BucketRecord>, StoreError>;

    async fn save(&self, bucket: &BucketRecord) -> Result<(), StoreError>;

    async fn remove(&self, id: &str) -> Result<(), StoreError>;
}
