//! Side-effect handlers for control messages and profile-derived notices.
//!
//! Every store call runs on its own task so the session loop never waits on
//! persistence. Local profile state is updated optimistically by the caller;
//! the store write follows. Results reach the client only while the session
//! is alive.

use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::ClientChannel;
use super::protocol::ServerMessage;
use crate::metrics::ServerMetrics;
use crate::models::{BucketRecord, DEFAULT_PROGRAM, UserProfile};
use crate::store::{AuthorizationError, BucketStore, ProfileStore, StoreError};

/// What spawned handlers need from their session.
#[derive(Clone)]
pub(crate) struct HandlerContext {
    pub session_id: String,
    pub client: Arc<dyn ClientChannel>,
    pub profiles: Arc<dyn ProfileStore>,
    pub buckets: Arc<dyn BucketStore>,
    pub metrics: Arc<ServerMetrics>,
    pub min_password_length: usize,
    /// Cancelled once the session is destroyed.
    pub closed: CancellationToken,
}

impl HandlerContext {
    /// Deliver a result to the client unless the session has gone away.
    pub(crate) fn send(&self, msg: ServerMessage) {
        if self.closed.is_cancelled() {
            debug!(
                session = %self.session_id,
                "dropping late '{}' for destroyed session",
                msg.name()
            );
            return;
        }
        self.client.send(msg);
    }

    fn store_failed(&self, what: &str, e: &StoreError) {
        self.metrics.store_error();
        error!(session = %self.session_id, "{} failed: {}", what, e);
    }
}

pub(crate) fn str_field(data: &Value, key: &str) -> Option<String> {
    data.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(String::from)
}

/// The acting user must teach `program`.
pub(crate) fn ensure_instructor(
    actor: &UserProfile,
    program: &str,
) -> Result<(), AuthorizationError> {
    if actor.is_instructor_of(program) {
        Ok(())
    } else {
        Err(AuthorizationError::NotInstructor {
            program: program.to_string(),
        })
    }
}

/// The acting user must own `bucket`.
pub(crate) fn ensure_bucket_owner(
    bucket: &BucketRecord,
    actor: Option<&UserProfile>,
) -> Result<(), AuthorizationError> {
    match actor {
        None => Err(AuthorizationError::NotAuthenticated),
        Some(user) if bucket.is_owned_by(&user.id) => Ok(()),
        Some(_) => Err(AuthorizationError::NotBucketOwner {
            bucket_id: bucket.id.clone(),
        }),
    }
}

// =============================================================================
// Post-join notices
// =============================================================================

/// Fire the notices that follow a successful join: one roster per instructor
/// program, the user's bucket listing, and a last-activity touch.
pub(crate) fn announce_profile(ctx: &HandlerContext, user: &UserProfile) {
    for program in &user.instructor_programs {
        let ctx = ctx.clone();
        let program = program.clone();
        tokio::spawn(async move { send_roster(&ctx, &program).await });
    }

    let bucket_ctx = ctx.clone();
    let user_id = user.id.clone();
    tokio::spawn(async move { send_bucket_listing(&bucket_ctx, &user_id).await });

    let touch_ctx = ctx.clone();
    let user_id = user.id.clone();
    tokio::spawn(async move {
        if let Err(e) = touch_ctx.profiles.touch_last_activity(&user_id).await {
            touch_ctx.store_failed("touch_last_activity", &e);
        }
    });
}

pub(crate) async fn send_roster(ctx: &HandlerContext, program: &str) {
    match ctx.profiles.find_by_program(program).await {
        Ok(students) => ctx.send(ServerMessage::Instructor {
            program: program.to_string(),
            users: students.iter().map(UserProfile::summary).collect(),
        }),
        Err(e) => ctx.store_failed("find_by_program", &e),
    }
}

pub(crate) async fn send_bucket_listing(ctx: &HandlerContext, user_id: &str) {
    match ctx.buckets.find_by_user(user_id).await {
        Ok(buckets) => ctx.send(ServerMessage::AllBuckets { buckets }),
        Err(e) => ctx.store_failed("find_by_user", &e),
    }
}

// =============================================================================
// Control messages
// =============================================================================

pub(crate) fn ping(ctx: &HandlerContext, data: &Value) {
    match data.get("startTime") {
        Some(start_time) => ctx.send(ServerMessage::Pong {
            start_time: start_time.clone(),
        }),
        None => debug!(session = %ctx.session_id, "ping without startTime"),
    }
}

/// Move the session's own user into a program.
pub(crate) fn enroll(ctx: &HandlerContext, user: Option<&mut UserProfile>, data: &Value) {
    let Some(user) = user else {
        debug!(session = %ctx.session_id, "enroll without a signed-in user");
        return;
    };
    let Some(program) = str_field(data, "program") else {
        debug!(session = %ctx.session_id, "enroll without a program");
        return;
    };

    info!(session = %ctx.session_id, "{} enrolling in {}", user.id, program);
    user.program = program;
    let snapshot = user.clone();
    let ctx = ctx.clone();
    tokio::spawn(async move {
        match ctx.profiles.save(&snapshot).await {
            Ok(()) => ctx.send(ServerMessage::alert(format!(
                "Enrolled in {}",
                snapshot.program
            ))),
            Err(e) => ctx.store_failed("save profile", &e),
        }
    });
}

pub(crate) fn unenroll_student(ctx: &HandlerContext, actor: Option<&UserProfile>, data: &Value) {
    let (Some(actor), Some(student_id)) = (actor.cloned(), str_field(data, "userId")) else {
        debug!(session = %ctx.session_id, "unenroll with missing actor or userId");
        return;
    };
    let ctx = ctx.clone();
    tokio::spawn(async move { run_unenroll(&ctx, &actor, &student_id).await });
}

pub(crate) async fn run_unenroll(ctx: &HandlerContext, actor: &UserProfile, student_id: &str) {
    let Some(mut student) = load_student(ctx, student_id).await else {
        return;
    };
    let program = student.program.clone();
    if let Err(e) = ensure_instructor(actor, &program) {
        reject(ctx, actor, &e);
        return;
    }

    student.program = DEFAULT_PROGRAM.to_string();
    match ctx.profiles.save(&student).await {
        Ok(()) => {
            info!(
                session = %ctx.session_id,
                "{} unenrolled {} from {}",
                actor.id, student.id, program
            );
            send_roster(ctx, &program).await;
        }
        Err(e) => ctx.store_failed("save profile", &e),
    }
}

pub(crate) fn reenroll_student(ctx: &HandlerContext, actor: Option<&UserProfile>, data: &Value) {
    let (Some(actor), Some(student_id), Some(program)) = (
        actor.cloned(),
        str_field(data, "userId"),
        str_field(data, "program"),
    ) else {
        debug!(session = %ctx.session_id, "reenroll with missing actor, userId or program");
        return;
    };
    let ctx = ctx.clone();
    tokio::spawn(async move { run_reenroll(&ctx, &actor, &student_id, &program).await });
}

pub(crate) async fn run_reenroll(
    ctx: &HandlerContext,
    actor: &UserProfile,
    student_id: &str,
    program: &str,
) {
    if let Err(e) = ensure_instructor(actor, program) {
        reject(ctx, actor, &e);
        return;
    }
    let Some(mut student) = load_student(ctx, student_id).await else {
        return;
    };

    student.program = program.to_string();
    match ctx.profiles.save(&student).await {
        Ok(()) => {
            info!(
                session = %ctx.session_id,
                "{} re-enrolled {} in {}",
                actor.id, student.id, program
            );
            send_roster(ctx, program).await;
        }
        Err(e) => ctx.store_failed("save profile", &e),
    }
}

async fn load_student(ctx: &HandlerContext, student_id: &str) -> Option<UserProfile> {
    match ctx.profiles.find_by_id(student_id).await {
        Ok(Some(student)) => Some(student),
        Ok(None) => {
            ctx.send(ServerMessage::alert(format!("Unknown user: {}", student_id)));
            None
        }
        Err(e) => {
            ctx.store_failed("find profile", &e);
            None
        }
    }
}

fn reject(ctx: &HandlerContext, actor: &UserProfile, e: &AuthorizationError) {
    warn!(session = %ctx.session_id, "rejected action by {}: {}", actor.id, e);
    ctx.send(ServerMessage::alert(format!("Not allowed: {}", e)));
}

pub(crate) fn set_password(ctx: &HandlerContext, user: Option<&UserProfile>, data: &Value) {
    let Some(user_id) = user.map(|u| u.id.clone()) else {
        debug!(session = %ctx.session_id, "set_password without a signed-in user");
        return;
    };
    let Some(password) = data.get("password").and_then(Value::as_str) else {
        debug!(session = %ctx.session_id, "set_password without a password");
        return;
    };
    if password.chars().count() < ctx.min_password_length {
        ctx.send(ServerMessage::alert(format!(
            "Password must be at least {} characters",
            ctx.min_password_length
        )));
        return;
    }

    let password = password.to_string();
    let ctx = ctx.clone();
    tokio::spawn(async move {
        match ctx.profiles.set_password(&user_id, &password).await {
            Ok(()) => ctx.send(ServerMessage::alert("Password updated")),
            Err(e) => {
                ctx.store_failed("set_password", &e);
                ctx.send(ServerMessage::alert("Could not update password"));
            }
        }
    });
}

/// Persist a sharing change, then have the client reload into the new mode.
pub(crate) fn persist_sharing(ctx: &HandlerContext, profile: UserProfile) {
    let ctx = ctx.clone();
    tokio::spawn(async move {
        match ctx.profiles.save(&profile).await {
            Ok(()) => ctx.send(ServerMessage::Reload),
            Err(e) => {
                ctx.store_failed("save profile", &e);
                ctx.send(ServerMessage::alert("Could not save sharing settings"));
            }
        }
    });
}

pub(crate) fn delete_bucket(ctx: &HandlerContext, actor: Option<&UserProfile>, data: &Value) {
    let Some(bucket_id) = str_field(data, "bucket_id") else {
        debug!(session = %ctx.session_id, "delete_bucket without bucket_id");
        return;
    };
    let actor = actor.cloned();
    let ctx = ctx.clone();
    tokio::spawn(async move { run_delete_bucket(&ctx, actor.as_ref(), &bucket_id).await });
}

/// Deletes only the bucket record; the repository it names is left alone.
pub(crate) async fn run_delete_bucket(
    ctx: &HandlerContext,
    actor: Option<&UserProfile>,
    bucket_id: &str,
) {
    let bucket = match ctx.buckets.find_by_id(bucket_id).await {
        Ok(Some(bucket)) => bucket,
        Ok(None) => {
            ctx.send(ServerMessage::alert(format!("Unknown bucket: {}", bucket_id)));
            return;
        }
        Err(e) => {
            ctx.store_failed("find bucket", &e);
            return;
        }
    };

    if let Err(e) = ensure_bucket_owner(&bucket, actor) {
        warn!(session = %ctx.session_id, "refused bucket deletion: {}", e);
        ctx.send(ServerMessage::alert(format!("Not allowed: {}", e)));
        return;
    }

    match ctx.buckets.remove(bucket_id).await {
        Ok(()) => {
            info!(session = %ctx.session_id, "deleted bucket {}", bucket_id);
            ctx.send(ServerMessage::BucketDeleted {
                bucket_id: bucket_id.to_string(),
            });
        }
        Err(e) => ctx.store_failed("remove bucket", &e),
    }
}

/// Record a bucket the backend just created for the session's user.
pub(crate) fn bucket_created(ctx: &HandlerContext, owner: Option<&UserProfile>, data: &Value) {
    let Some(owner) = owner else {
        warn!(session = %ctx.session_id, "bucket created without a signed-in user; not recorded");
        return;
    };
    let Some(bucket_id) = str_field(data, "bucket_id") else {
        debug!(session = %ctx.session_id, "bucket-repo-created without bucket_id");
        return;
    };
    let main = data.get("main").and_then(Value::as_bool).unwrap_or(false);
    let bucket = BucketRecord::new(bucket_id, owner.id.clone(), main);

    let ctx = ctx.clone();
    tokio::spawn(async move {
        match ctx.buckets.save(&bucket).await {
            Ok(()) => ctx.send(ServerMessage::BucketCreated { bucket }),
            Err(e) => ctx.store_failed("save bucket", &e),
        }
    });
}
