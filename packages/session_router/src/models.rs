use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Program every user belongs to until an instructor enrolls them elsewhere.
pub const DEFAULT_PROGRAM: &str = "default";

/// An end-user profile. Owned by the profile store; sessions only reference it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: String,
    pub display_name: String,
    pub email: Option<String>,
    /// Programs this user teaches.
    pub instructor_programs: Vec<String>,
    /// Present while workspace sharing is enabled.
    pub share_key: Option<String>,
    /// Program the user is enrolled in.
    pub program: String,
    pub last_activity: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl UserProfile {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        let now = Utc::now().timestamp();
        Self {
            id: id.into(),
            display_name: display_name.into(),
            email: None,
            instructor_programs: Vec::new(),
            share_key: None,
            program: DEFAULT_PROGRAM.to_string(),
            last_activity: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_instructor_of(&self, program: &str) -> bool {
        self.instructor_programs.iter().any(|p| p == program)
    }

    pub fn in_default_program(&self) -> bool {
        self.program == DEFAULT_PROGRAM
    }

    pub fn summary(&self) -> ProfileSummary {
        ProfileSummary {
            id: self.id.clone(),
            display_name: self.display_name.clone(),
            program: self.program.clone(),
            share_key: self.share_key.clone(),
        }
    }
}

/// The subset of a profile an instructor is allowed to see about a student.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileSummary {
    pub id: String,
    pub display_name: String,
    pub program: String,
    pub share_key: Option<String>,
}

/// Row shape of the `users` table. `instructor_programs` is stored as JSON text.
#[derive(Debug, Clone, FromRow)]
pub struct UserRow {
    pub id: String,
    pub display_name: String,
    pub email: Option<String>,
    pub program: String,
    pub share_key: Option<String>,
    pub instructor_programs_json: String,
    pub last_activity: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl From<UserRow> for UserProfile {
    fn from(row: UserRow) -> Self {
        let instructor_programs =
            serde_json::from_str(&row.instructor_programs_json).unwrap_or_default();
        Self {
            id: row.id,
            display_name: row.display_name,
            email: row.email,
            instructor_programs,
            share_key: row.share_key,
            program: row.program,
            last_activity: row.last_activity,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

/// A stored artifact bucket owned by one user.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct BucketRecord {
    pub id: String,
    pub user_id: String,
    /// Whether this is the bucket opened by default for the user.
    pub main: bool,
    pub created_at: i64,
}

impl BucketRecord {
    pub fn new(id: impl Into<String>, user_id: impl Into<String>, main: bool) -> Self {
        Self {
            id: id.into(),
            user_id: user_id.into(),
            main,
            created_at: Utc::now().timestamp(),
        }
    }

    pub fn is_owned_by(&self, user_id: &str) -> bool {
        self.user_id == user_id
    }
}
