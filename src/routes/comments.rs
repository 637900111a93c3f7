use std::collections::HashMap;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{post, put},
};
use chrono::Utc;
use sqlx::MySqlPool;

use crate::error::ApiError;
use crate::models::{
    Comment, CommentResponse, CreateComment, EditComment, FLAG_THRESHOLD,
    ModerateComment, PARENT_COMMENT, PARENT_POST, ReportComment, ReportEntry,
    STATUS_ACTIVE, STATUS_DELETED, STATUS_FLAGGED, User, UserResponse, child_depth,
    child_path, descendant_pattern, extract_mention_handles, is_valid_status,
    parse_edit_history_json, parse_reports_json, push_edit_history, validate_content,
};
use crate::routes::auth::{extract_admin_user, extract_current_user};
use crate::routes::posts::ensure_container;

/// Transactions hitting deadlocks or lock timeouts are retried this many
/// times before the caller sees a transient failure.
const MAX_TX_ATTEMPTS: u32 = 3;

pub fn comments_routes() -> Router<MySqlPool> {
    Router::new()
        .route("/", post(create_comment))
        .route(
            "/{comment_id}",
            put(edit_comment).delete(soft_delete_comment),
        )
        .route("/{comment_id}/report", post(report_comment))
        .route("/{comment_id}/moderate", put(moderate_comment))
}

// ============================
// Create
// ============================

async fn create_comment(
    State(pool): State<MySqlPool>,
    headers: HeaderMap,
    Json(input): Json<CreateComment>,
) -> Result<impl IntoResponse, ApiError> {
    let current_user = extract_current_user(&pool, &headers).await?;

    let media = input.media.unwrap_or_default();
    let content = validate_content(input.content.as_deref(), &media)?;

    // Resolve the parent before touching storage.
    let (post_id, parent) = match input.parent_kind.as_str() {
        PARENT_POST => {
            let post = ensure_container(&pool, input.parent_id).await?;
            (post.id, None)
        }
        PARENT_COMMENT => {
            let parent = find_comment(&pool, input.parent_id)
                .await?
                .ok_or_else(|| ApiError::NotFound("Parent comment not found".to_string()))?;
            if parent.status != STATUS_ACTIVE {
                return Err(ApiError::ParentInactive);
            }
            child_depth(parent.depth)?;
            ensure_container(&pool, parent.post_id).await?;
            (parent.post_id, Some(parent))
        }
        other => {
            return Err(ApiError::Validation(format!(
                "Unknown parent kind: {}",
                other
            )));
        }
    };

    let mention_ids = resolve_mentions(&pool, &extract_mention_handles(&content)).await?;
    let media_json = if media.is_empty() {
        None
    } else {
        Some(serde_json::to_string(&media).map_err(|e| ApiError::Validation(e.to_string()))?)
    };
    let mentions_json = if mention_ids.is_empty() {
        None
    } else {
        Some(serde_json::to_string(&mention_ids).map_err(|e| ApiError::Validation(e.to_string()))?)
    };

    let mut attempt = 0;
    let comment_id = loop {
        attempt += 1;
        match insert_comment_tx(
            &pool,
            post_id,
            current_user.id,
            parent.as_ref(),
            &content,
            media_json.as_deref(),
            mentions_json.as_deref(),
        )
        .await
        {
            Ok(id) => break id,
            Err(error) if is_transient(&error) => {
                if attempt >= MAX_TX_ATTEMPTS {
                    return Err(ApiError::Transient);
                }
                tracing::warn!(attempt, "comment insert hit contention, retrying");
            }
            Err(error) => return Err(error),
        }
    };

    let comment = sqlx::query_as::<_, Comment>("SELECT * FROM comments WHERE id = ?")
        .bind(comment_id)
        .fetch_one(&pool)
        .await?;

    // Return the parent's fresh counter so the caller can update its UI
    // without a follow-up read.
    let parent_count: (i64,) = match &parent {
        Some(parent) => {
            sqlx::query_as("SELECT reply_count FROM comments WHERE id = ?")
                .bind(parent.id)
                .fetch_one(&pool)
                .await?
        }
        None => {
            sqlx::query_as("SELECT comment_count FROM posts WHERE id = ?")
                .bind(post_id)
                .fetch_one(&pool)
                .await?
        }
    };

    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({
            "comment": CommentResponse::from_parts(&comment, UserResponse::from(current_user)),
            "parent_count": parent_count.0,
        })),
    ))
}

/// One atomic unit: node insert, path fixup, parent counter increment.
/// Either all three commit or none do.
async fn insert_comment_tx(
    pool: &MySqlPool,
    post_id: i64,
    author_id: i64,
    parent: Option<&Comment>,
    content: &str,
    media_json: Option<&str>,
    mentions_json: Option<&str>,
) -> Result<i64, ApiError> {
    let mut tx = pool.begin().await?;
    let now = Utc::now();

    let (parent_kind, parent_id, depth) = match parent {
        Some(parent) => (PARENT_COMMENT, parent.id, parent.depth + 1),
        None => (PARENT_POST, post_id, 0),
    };

    let result = sqlx::query(
        r#"INSERT INTO comments
           (post_id, author_id, parent_kind, parent_id, content, media_json, mentions_json,
            depth, path, status, created_at)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?, '', 'active', ?)"#,
    )
    .bind(post_id)
    .bind(author_id)
    .bind(parent_kind)
    .bind(parent_id)
    .bind(content)
    .bind(media_json)
    .bind(mentions_json)
    .bind(depth)
    .bind(now)
    .execute(&mut *tx)
    .await?;

    // The own id is only known after insert; the path fixup stays inside the
    // same transaction so no reader ever sees the placeholder.
    let comment_id = result.last_insert_id() as i64;
    let path = child_path(parent.map(|p| p.path.as_str()), comment_id);
    sqlx::query("UPDATE comments SET path = ? WHERE id = ?")
        .bind(&path)
        .bind(comment_id)
        .execute(&mut *tx)
        .await?;

    match parent {
        Some(parent) => {
            sqlx::query("UPDATE comments SET reply_count = reply_count + 1 WHERE id = ?")
                .bind(parent.id)
                .execute(&mut *tx)
                .await?;
        }
        None => {
            sqlx::query("UPDATE posts SET comment_count = comment_count + 1 WHERE id = ?")
                .bind(post_id)
                .execute(&mut *tx)
                .await?;
        }
    }

    tx.commit().await?;
    Ok(comment_id)
}

// ============================
// Edit
// ============================

async fn edit_comment(
    State(pool): State<MySqlPool>,
    headers: HeaderMap,
    Path(comment_id): Path<i64>,
    Json(input): Json<EditComment>,
) -> Result<impl IntoResponse, ApiError> {
    let current_user = extract_current_user(&pool, &headers).await?;

    if input.content.is_none() && input.media.is_none() {
        return Err(ApiError::Validation("Nothing to update".to_string()));
    }

    // Row lock for the duration of the history rewrite; two concurrent
    // edits must not drop each other's history entry.
    let mut tx = pool.begin().await?;

    let comment = sqlx::query_as::<_, Comment>("SELECT * FROM comments WHERE id = ? FOR UPDATE")
        .bind(comment_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| ApiError::NotFound("Comment not found".to_string()))?;

    ensure_can_touch(&comment, &current_user)?;

    let media = input
        .media
        .unwrap_or_else(|| crate::models::parse_media_json(comment.media_json.as_deref()));
    let new_content = match input.content.as_deref() {
        Some(content) => validate_content(Some(content), &media)?,
        None => comment.content.clone(),
    };

    let now = Utc::now();
    let content_changed = new_content != comment.content;
    let (edit_history_json, edited_at) = if content_changed {
        let mut history = parse_edit_history_json(comment.edit_history_json.as_deref());
        push_edit_history(&mut history, comment.content.clone(), now);
        let serialized = serde_json::to_string(&history)
            .map_err(|e| ApiError::Validation(e.to_string()))?;
        (Some(serialized), Some(now))
    } else {
        (comment.edit_history_json.clone(), comment.edited_at)
    };

    let media_json = if media.is_empty() {
        None
    } else {
        Some(serde_json::to_string(&media).map_err(|e| ApiError::Validation(e.to_string()))?)
    };

    sqlx::query(
        r#"UPDATE comments
           SET content = ?, media_json = ?, edit_history_json = ?, edited_at = ?, updated_at = ?
           WHERE id = ?"#,
    )
    .bind(&new_content)
    .bind(&media_json)
    .bind(&edit_history_json)
    .bind(edited_at)
    .bind(now)
    .bind(comment_id)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    let updated = sqlx::query_as::<_, Comment>("SELECT * FROM comments WHERE id = ?")
        .bind(comment_id)
        .fetch_one(&pool)
        .await?;
    let author = fetch_author(&pool, updated.author_id).await?;

    Ok(Json(CommentResponse::from_parts(&updated, author)))
}

// ============================
// Soft delete (cascading)
// ============================

async fn soft_delete_comment(
    State(pool): State<MySqlPool>,
    headers: HeaderMap,
    Path(comment_id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let current_user = extract_current_user(&pool, &headers).await?;

    let comment = find_comment(&pool, comment_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Comment not found".to_string()))?;

    ensure_can_touch(&comment, &current_user)?;

    let deleted_count = run_cascade_delete(&pool, &comment).await?;

    // Post-commit counters so the caller never needs a follow-up read.
    let container_count: (i64,) = sqlx::query_as("SELECT comment_count FROM posts WHERE id = ?")
        .bind(comment.post_id)
        .fetch_one(&pool)
        .await?;

    Ok(Json(serde_json::json!({
        "message": "Comment deleted successfully",
        "deleted_count": deleted_count,
        "post_id": comment.post_id,
        "post_comment_count": container_count.0,
    })))
}

/// Bounded-retry wrapper around the cascade transaction.
async fn run_cascade_delete(pool: &MySqlPool, target: &Comment) -> Result<i64, ApiError> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match cascade_soft_delete_tx(pool, target).await {
            Ok(count) => return Ok(count),
            Err(error) if is_transient(&error) => {
                if attempt >= MAX_TX_ATTEMPTS {
                    return Err(ApiError::Transient);
                }
                tracing::warn!(attempt, "cascade delete hit contention, retrying");
            }
            Err(error) => return Err(error),
        }
    }
}

/// Soft-deletes `target` and every live descendant in one transaction,
/// keyed by path prefix. Each affected parent's reply counter drops by
/// exactly its number of direct children removed; the container counter
/// drops by one only when the target itself is a root comment.
pub async fn cascade_soft_delete_tx(
    pool: &MySqlPool,
    target: &Comment,
) -> Result<i64, ApiError> {
    let mut tx = pool.begin().await?;
    let now = Utc::now();

    let target_row: Option<(String,)> = sqlx::query_as(
        "SELECT status FROM comments WHERE id = ? FOR UPDATE",
    )
    .bind(target.id)
    .fetch_optional(&mut *tx)
    .await?;

    match target_row {
        Some((status,)) if status == STATUS_DELETED => return Err(ApiError::AlreadyDeleted),
        Some(_) => {}
        None => return Err(ApiError::NotFound("Comment not found".to_string())),
    }

    let descendants: Vec<(i64, i64)> = sqlx::query_as(
        r#"SELECT id, parent_id FROM comments
           WHERE path LIKE ? AND status <> 'deleted'
           FOR UPDATE"#,
    )
    .bind(descendant_pattern(&target.path))
    .fetch_all(&mut *tx)
    .await?;

    sqlx::query(
        r#"UPDATE comments SET status = 'deleted', updated_at = ?
           WHERE (id = ? OR path LIKE ?) AND status <> 'deleted'"#,
    )
    .bind(now)
    .bind(target.id)
    .bind(descendant_pattern(&target.path))
    .execute(&mut *tx)
    .await?;

    // Every descendant's immediate parent is a comment; the target's own
    // parent may be the container instead.
    let mut decrements = count_by_parent(descendants.iter().map(|(_, parent_id)| *parent_id));
    if target.parent_kind == PARENT_COMMENT {
        *decrements.entry(target.parent_id).or_insert(0) += 1;
    }

    for (parent_id, count) in decrements {
        let result = sqlx::query(
            "UPDATE comments SET reply_count = reply_count - ? WHERE id = ? AND reply_count >= ?",
        )
        .bind(count)
        .bind(parent_id)
        .bind(count)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            // Counter would have gone negative: a prior inconsistency.
            // Clamp to zero rather than corrupting it further.
            tracing::warn!(parent_id, count, "reply_count underflow clamped to zero");
            sqlx::query("UPDATE comments SET reply_count = 0 WHERE id = ?")
                .bind(parent_id)
                .execute(&mut *tx)
                .await?;
        }
    }

    if target.parent_kind == PARENT_POST {
        sqlx::query(
            "UPDATE posts SET comment_count = GREATEST(comment_count - 1, 0) WHERE id = ?",
        )
        .bind(target.parent_id)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(descendants.len() as i64 + 1)
}

// ============================
// Report
// ============================

async fn report_comment(
    State(pool): State<MySqlPool>,
    headers: HeaderMap,
    Path(comment_id): Path<i64>,
    Json(input): Json<ReportComment>,
) -> Result<impl IntoResponse, ApiError> {
    let current_user = extract_current_user(&pool, &headers).await?;

    if input.reason.trim().is_empty() {
        return Err(ApiError::Validation("Report reason is required".to_string()));
    }

    let mut tx = pool.begin().await?;

    let comment = sqlx::query_as::<_, Comment>("SELECT * FROM comments WHERE id = ? FOR UPDATE")
        .bind(comment_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| ApiError::NotFound("Comment not found".to_string()))?;

    if comment.status == STATUS_DELETED {
        return Err(ApiError::AlreadyDeleted);
    }
    if comment.author_id == current_user.id {
        return Err(ApiError::Validation(
            "You cannot report your own comment".to_string(),
        ));
    }

    let mut reports = parse_reports_json(comment.reported_by_json.as_deref());
    let already_reported = reports.iter().any(|entry| entry.user_id == current_user.id);

    if !already_reported {
        let now = Utc::now();
        reports.push(ReportEntry {
            user_id: current_user.id,
            reason: input.reason.trim().to_string(),
            reported_at: now,
        });
        let reported_count = comment.reported_count + 1;
        let new_status = if reported_count >= FLAG_THRESHOLD && comment.status == STATUS_ACTIVE {
            STATUS_FLAGGED
        } else {
            comment.status.as_str()
        };
        let reports_json = serde_json::to_string(&reports)
            .map_err(|e| ApiError::Validation(e.to_string()))?;

        sqlx::query(
            r#"UPDATE comments
               SET reported_count = ?, reported_by_json = ?, status = ?, updated_at = ?
               WHERE id = ?"#,
        )
        .bind(reported_count)
        .bind(&reports_json)
        .bind(new_status)
        .bind(now)
        .bind(comment_id)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;

    let updated = sqlx::query_as::<_, Comment>("SELECT * FROM comments WHERE id = ?")
        .bind(comment_id)
        .fetch_one(&pool)
        .await?;
    let author = fetch_author(&pool, updated.author_id).await?;

    Ok(Json(CommentResponse::from_parts(&updated, author)))
}

// ============================
// Moderate
// ============================

async fn moderate_comment(
    State(pool): State<MySqlPool>,
    headers: HeaderMap,
    Path(comment_id): Path<i64>,
    Json(input): Json<ModerateComment>,
) -> Result<impl IntoResponse, ApiError> {
    let admin = extract_admin_user(&pool, &headers).await?;

    if !is_valid_status(&input.status) {
        return Err(ApiError::Validation(format!(
            "Unknown moderation status: {}",
            input.status
        )));
    }

    let comment = find_comment(&pool, comment_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Comment not found".to_string()))?;

    ensure_moderatable(&comment)?;

    // Deletion keeps its counter semantics even when an admin triggers it.
    if input.status == STATUS_DELETED {
        run_cascade_delete(&pool, &comment).await?;
    } else {
        let now = Utc::now();
        if input.status == STATUS_ACTIVE {
            // Re-activating clears the report trail.
            sqlx::query(
                r#"UPDATE comments
                   SET status = ?, moderated_by = ?, moderation_notes = ?,
                       reported_count = 0, reported_by_json = NULL, updated_at = ?
                   WHERE id = ?"#,
            )
            .bind(&input.status)
            .bind(admin.id)
            .bind(&input.notes)
            .bind(now)
            .bind(comment_id)
            .execute(&pool)
            .await?;
        } else {
            sqlx::query(
                r#"UPDATE comments
                   SET status = ?, moderated_by = ?, moderation_notes = ?, updated_at = ?
                   WHERE id = ?"#,
            )
            .bind(&input.status)
            .bind(admin.id)
            .bind(&input.notes)
            .bind(now)
            .bind(comment_id)
            .execute(&pool)
            .await?;
        }
    }

    let updated = sqlx::query_as::<_, Comment>("SELECT * FROM comments WHERE id = ?")
        .bind(comment_id)
        .fetch_one(&pool)
        .await?;
    let author = fetch_author(&pool, updated.author_id).await?;

    Ok(Json(CommentResponse::from_parts(&updated, author)))
}

// ============================
// Shared helpers
// ============================

pub async fn find_comment(
    pool: &MySqlPool,
    comment_id: i64,
) -> Result<Option<Comment>, ApiError> {
    let comment = sqlx::query_as::<_, Comment>("SELECT * FROM comments WHERE id = ?")
        .bind(comment_id)
        .fetch_optional(pool)
        .await?;
    Ok(comment)
}

async fn fetch_author(pool: &MySqlPool, author_id: i64) -> Result<UserResponse, ApiError> {
    let author = sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = ?")
        .bind(author_id)
        .fetch_one(pool)
        .await?;
    Ok(UserResponse::from(author))
}

/// Resolves mention handles against active users; unknown handles are
/// silently dropped.
pub async fn resolve_mentions(
    pool: &MySqlPool,
    handles: &[String],
) -> Result<Vec<i64>, ApiError> {
    if handles.is_empty() {
        return Ok(Vec::new());
    }

    let placeholders = vec!["?"; handles.len()].join(", ");
    let sql = format!(
        "SELECT id FROM users WHERE is_active = TRUE AND username IN ({})",
        placeholders
    );

    let mut query = sqlx::query_as::<_, (i64,)>(&sql);
    for handle in handles {
        query = query.bind(handle);
    }

    let rows = query.fetch_all(pool).await?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// A deleted node is terminal for moderation. The cascade already settled
/// the parent counters, so flipping it back would leave them out of sync
/// while its descendants stay deleted.
fn ensure_moderatable(comment: &Comment) -> Result<(), ApiError> {
    if comment.status == STATUS_DELETED {
        return Err(ApiError::AlreadyDeleted);
    }
    Ok(())
}

fn ensure_can_touch(comment: &Comment, user: &User) -> Result<(), ApiError> {
    if comment.status == STATUS_DELETED {
        return Err(ApiError::AlreadyDeleted);
    }
    if comment.author_id != user.id && !user.can_moderate() {
        return Err(ApiError::Forbidden(
            "Not authorized to modify this comment".to_string(),
        ));
    }
    Ok(())
}

fn count_by_parent(parent_ids: impl IntoIterator<Item = i64>) -> HashMap<i64, i64> {
    let mut counts = HashMap::new();
    for parent_id in parent_ids {
        *counts.entry(parent_id).or_insert(0) += 1;
    }
    counts
}

fn is_transient(error: &ApiError) -> bool {
    match error {
        ApiError::Database(sqlx::Error::Database(db_error)) => {
            let mysql_error = db_error.downcast_ref::<sqlx::mysql::MySqlDatabaseError>();
            // 1213 = deadlock, 1205 = lock wait timeout
            matches!(mysql_error.number(), 1213 | 1205)
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn comment_with_status(status: &str) -> Comment {
        Comment {
            id: 1,
            post_id: 1,
            author_id: 1,
            parent_kind: PARENT_POST.to_string(),
            parent_id: 1,
            content: "hello".to_string(),
            media_json: None,
            mentions_json: None,
            depth: 0,
            path: "1".to_string(),
            status: status.to_string(),
            like_count: 0,
            reply_count: 0,
            share_count: 0,
            reported_count: 0,
            reported_by_json: None,
            moderated_by: None,
            moderation_notes: None,
            edit_history_json: None,
            edited_at: None,
            created_at: Utc::now(),
            updated_at: None,
        }
    }

    #[test]
    fn test_deleted_comment_cannot_be_moderated() {
        // Restoring a soft-deleted node would desync the counters the
        // cascade already decremented.
        let deleted = comment_with_status(STATUS_DELETED);
        assert!(matches!(
            ensure_moderatable(&deleted),
            Err(ApiError::AlreadyDeleted)
        ));
        assert!(ensure_moderatable(&comment_with_status(STATUS_ACTIVE)).is_ok());
        assert!(ensure_moderatable(&comment_with_status(STATUS_FLAGGED)).is_ok());
    }

    #[test]
    fn test_count_by_parent_groups_direct_children() {
        // Subtree: 1 -> {2, 3}, 2 -> {4, 5}, 3 -> {6}
        let counts = count_by_parent(vec![1, 1, 2, 2, 3]);
        assert_eq!(counts.get(&1), Some(&2));
        assert_eq!(counts.get(&2), Some(&2));
        assert_eq!(counts.get(&3), Some(&1));
        assert_eq!(counts.len(), 3);
    }

    #[test]
    fn test_count_by_parent_empty() {
        assert!(count_by_parent(Vec::new()).is_empty());
    }
}
