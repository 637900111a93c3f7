use std::collections::HashMap;

use axum::{
    Json, Router,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
};
use chrono::Utc;
use sqlx::MySqlPool;

use crate::error::ApiError;
use crate::models::{
    BulkStatusRequest, Comment, Post, Reaction, ReactionRequest, ReactionStats,
    ReactionTargetQuery, STATUS_ACTIVE, TARGET_COMMENT, TARGET_POST, build_stats,
    is_valid_reaction_kind, is_valid_target_kind,
};
use crate::routes::auth::extract_current_user;

const MAX_TX_ATTEMPTS: u32 = 3;
const MAX_BULK_TARGETS: usize = 100;

pub fn reactions_routes() -> Router<MySqlPool> {
    Router::new()
        .route(
            "/",
            post(add_reaction).delete(remove_reaction).put(update_reaction),
        )
        .route("/stats", get(get_reaction_stats))
        .route("/me", get(get_user_reaction))
        .route("/bulk-status", post(bulk_reaction_status))
}

// ============================
// Add
// ============================

async fn add_reaction(
    State(pool): State<MySqlPool>,
    headers: HeaderMap,
    Json(input): Json<ReactionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let current_user = extract_current_user(&pool, &headers).await?;
    let kind = validate_request(&input)?;
    ensure_target_available(&pool, &input.target_kind, input.target_id).await?;

    // Pre-check for the common case; the unique key is the real guard.
    let existing = find_reaction(&pool, current_user.id, &input.target_kind, input.target_id).await?;
    if existing.is_some() {
        return Err(ApiError::AlreadyReacted);
    }

    let mut attempt = 0;
    loop {
        attempt += 1;
        match insert_reaction_tx(&pool, current_user.id, &input.target_kind, input.target_id, &kind)
            .await
        {
            Ok(()) => break,
            Err(error) if is_unique_violation(&error) => {
                // Lost a concurrent double-submit race despite the pre-check.
                // The winning insert is already committed; keep it, drop any
                // surplus, and resync the cached counter to the ledger.
                reconcile_duplicates(&pool, current_user.id, &input.target_kind, input.target_id)
                    .await?;
                return Err(ApiError::DuplicateCleaned);
            }
            Err(error) if is_transient_sqlx(&error) => {
                if attempt >= MAX_TX_ATTEMPTS {
                    return Err(ApiError::Transient);
                }
                tracing::warn!(attempt, "reaction insert hit contention, retrying");
            }
            Err(error) => return Err(error),
        }
    }

    let stats = compute_stats(&pool, &input.target_kind, input.target_id).await?;
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({
            "message": "Reaction added",
            "kind": kind,
            "stats": stats,
        })),
    ))
}

/// Ledger insert and cached-counter increment in one atomic unit.
async fn insert_reaction_tx(
    pool: &MySqlPool,
    user_id: i64,
    target_kind: &str,
    target_id: i64,
    kind: &str,
) -> Result<(), ApiError> {
    let mut tx = pool.begin().await?;
    let now = Utc::now();

    sqlx::query(
        r#"INSERT INTO reactions (user_id, target_kind, target_id, kind, created_at)
           VALUES (?, ?, ?, ?, ?)"#,
    )
    .bind(user_id)
    .bind(target_kind)
    .bind(target_id)
    .bind(kind)
    .bind(now)
    .execute(&mut *tx)
    .await?;

    sqlx::query(counter_increment_sql(target_kind))
        .bind(target_id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(())
}

/// Post-race cleanup: the committed record for the (user, target) pair
/// survives, any surplus beyond it is dropped, and the cached counter is set
/// back to the ledger's truth.
async fn reconcile_duplicates(
    pool: &MySqlPool,
    user_id: i64,
    target_kind: &str,
    target_id: i64,
) -> Result<(), ApiError> {
    let mut tx = pool.begin().await?;

    let rows: Vec<(i64,)> = sqlx::query_as(
        r#"SELECT id FROM reactions
           WHERE user_id = ? AND target_kind = ? AND target_id = ?
           FOR UPDATE"#,
    )
    .bind(user_id)
    .bind(target_kind)
    .bind(target_id)
    .fetch_all(&mut *tx)
    .await?;

    let surplus = surplus_reaction_ids(rows.into_iter().map(|(id,)| id).collect());
    if !surplus.is_empty() {
        let placeholders = vec!["?"; surplus.len()].join(", ");
        let sql = format!("DELETE FROM reactions WHERE id IN ({})", placeholders);
        let mut query = sqlx::query(&sql);
        for id in &surplus {
            query = query.bind(id);
        }
        query.execute(&mut *tx).await?;
    }

    let actual: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM reactions WHERE target_kind = ? AND target_id = ?",
    )
    .bind(target_kind)
    .bind(target_id)
    .fetch_one(&mut *tx)
    .await?;

    sqlx::query(counter_set_sql(target_kind))
        .bind(actual.0)
        .bind(target_id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    tracing::warn!(
        user_id,
        target_kind,
        target_id,
        removed = surplus.len(),
        "duplicate reaction race reconciled"
    );
    Ok(())
}

/// Ids to drop so exactly the earliest record for a pair survives.
fn surplus_reaction_ids(mut ids: Vec<i64>) -> Vec<i64> {
    if ids.is_empty() {
        return ids;
    }
    ids.sort_unstable();
    ids.split_off(1)
}

// ============================
// Remove
// ============================

async fn remove_reaction(
    State(pool): State<MySqlPool>,
    headers: HeaderMap,
    Json(input): Json<ReactionTargetQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let current_user = extract_current_user(&pool, &headers).await?;
    if !is_valid_target_kind(&input.target_kind) {
        return Err(ApiError::Validation(format!(
            "Unknown target kind: {}",
            input.target_kind
        )));
    }

    let mut attempt = 0;
    let removed = loop {
        attempt += 1;
        match remove_reaction_tx(&pool, current_user.id, &input.target_kind, input.target_id).await
        {
            Ok(count) => break count,
            Err(error) if is_transient_sqlx(&error) => {
                if attempt >= MAX_TX_ATTEMPTS {
                    return Err(ApiError::Transient);
                }
                tracing::warn!(attempt, "reaction removal hit contention, retrying");
            }
            Err(error) => return Err(error),
        }
    };

    let stats = compute_stats(&pool, &input.target_kind, input.target_id).await?;
    Ok(Json(serde_json::json!({
        "message": "Reaction removed",
        "removed_count": removed,
        "stats": stats,
    })))
}

/// Deletes every record the actor holds on the target and decrements the
/// counter by exactly that many rows.
async fn remove_reaction_tx(
    pool: &MySqlPool,
    user_id: i64,
    target_kind: &str,
    target_id: i64,
) -> Result<u64, ApiError> {
    let mut tx = pool.begin().await?;

    let removed = sqlx::query(
        "DELETE FROM reactions WHERE user_id = ? AND target_kind = ? AND target_id = ?",
    )
    .bind(user_id)
    .bind(target_kind)
    .bind(target_id)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    if removed == 0 {
        return Err(ApiError::ReactionNotFound);
    }

    sqlx::query(counter_decrement_sql(target_kind))
        .bind(removed as i64)
        .bind(target_id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(removed)
}

// ============================
// Update kind
// ============================

async fn update_reaction(
    State(pool): State<MySqlPool>,
    headers: HeaderMap,
    Json(input): Json<ReactionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let current_user = extract_current_user(&pool, &headers).await?;
    let kind = validate_request(&input)?;

    let existing = find_reaction(&pool, current_user.id, &input.target_kind, input.target_id)
        .await?
        .ok_or(ApiError::ReactionNotFound)?;

    if existing.kind != kind {
        // Kind change only; the aggregate count is untouched.
        sqlx::query("UPDATE reactions SET kind = ? WHERE id = ?")
            .bind(&kind)
            .bind(existing.id)
            .execute(&pool)
            .await?;
    }

    let stats = compute_stats(&pool, &input.target_kind, input.target_id).await?;
    Ok(Json(serde_json::json!({
        "message": "Reaction updated",
        "kind": kind,
        "stats": stats,
    })))
}

// ============================
// Reads
// ============================

async fn get_reaction_stats(
    State(pool): State<MySqlPool>,
    Query(query): Query<ReactionTargetQuery>,
) -> Result<impl IntoResponse, ApiError> {
    if !is_valid_target_kind(&query.target_kind) {
        return Err(ApiError::Validation(format!(
            "Unknown target kind: {}",
            query.target_kind
        )));
    }

    let stats = compute_stats(&pool, &query.target_kind, query.target_id).await?;
    Ok(Json(stats))
}

async fn get_user_reaction(
    State(pool): State<MySqlPool>,
    headers: HeaderMap,
    Query(query): Query<ReactionTargetQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let current_user = extract_current_user(&pool, &headers).await?;

    let reaction = find_reaction(&pool, current_user.id, &query.target_kind, query.target_id).await?;

    Ok(Json(serde_json::json!({
        "has_reaction": reaction.is_some(),
        "reaction": reaction.map(|r| r.kind),
    })))
}

async fn bulk_reaction_status(
    State(pool): State<MySqlPool>,
    headers: HeaderMap,
    Json(input): Json<BulkStatusRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let current_user = extract_current_user(&pool, &headers).await?;

    if !is_valid_target_kind(&input.target_kind) {
        return Err(ApiError::Validation(format!(
            "Unknown target kind: {}",
            input.target_kind
        )));
    }
    if input.target_ids.is_empty() {
        return Ok(Json(serde_json::json!({ "reactions": HashMap::<i64, String>::new() })));
    }
    if input.target_ids.len() > MAX_BULK_TARGETS {
        return Err(ApiError::Validation(format!(
            "At most {} targets per bulk request",
            MAX_BULK_TARGETS
        )));
    }

    let placeholders = vec!["?"; input.target_ids.len()].join(", ");
    let sql = format!(
        "SELECT target_id, kind FROM reactions WHERE user_id = ? AND target_kind = ? AND target_id IN ({})",
        placeholders
    );

    let mut query = sqlx::query_as::<_, (i64, String)>(&sql);
    query = query.bind(current_user.id).bind(&input.target_kind);
    for id in &input.target_ids {
        query = query.bind(id);
    }

    let rows = query.fetch_all(&pool).await?;
    let reactions: HashMap<i64, String> = rows.into_iter().collect();

    Ok(Json(serde_json::json!({ "reactions": reactions })))
}

// ============================
// Shared helpers
// ============================

pub async fn compute_stats(
    pool: &MySqlPool,
    target_kind: &str,
    target_id: i64,
) -> Result<ReactionStats, ApiError> {
    let counts: Vec<(String, i64)> = sqlx::query_as(
        r#"SELECT kind, COUNT(*) FROM reactions
           WHERE target_kind = ? AND target_id = ?
           GROUP BY kind"#,
    )
    .bind(target_kind)
    .bind(target_id)
    .fetch_all(pool)
    .await?;

    Ok(build_stats(counts))
}

async fn find_reaction(
    pool: &MySqlPool,
    user_id: i64,
    target_kind: &str,
    target_id: i64,
) -> Result<Option<Reaction>, ApiError> {
    let reaction = sqlx::query_as::<_, Reaction>(
        r#"SELECT * FROM reactions
           WHERE user_id = ? AND target_kind = ? AND target_id = ?
           ORDER BY id LIMIT 1"#,
    )
    .bind(user_id)
    .bind(target_kind)
    .bind(target_id)
    .fetch_optional(pool)
    .await?;
    Ok(reaction)
}

async fn ensure_target_available(
    pool: &MySqlPool,
    target_kind: &str,
    target_id: i64,
) -> Result<(), ApiError> {
    match target_kind {
        TARGET_COMMENT => {
            let comment = sqlx::query_as::<_, Comment>("SELECT * FROM comments WHERE id = ?")
                .bind(target_id)
                .fetch_optional(pool)
                .await?
                .ok_or_else(|| ApiError::NotFound("Comment not found".to_string()))?;
            if comment.status != STATUS_ACTIVE {
                return Err(ApiError::TargetUnavailable);
            }
        }
        TARGET_POST => {
            let post = sqlx::query_as::<_, Post>("SELECT * FROM posts WHERE id = ?")
                .bind(target_id)
                .fetch_optional(pool)
                .await?
                .ok_or_else(|| ApiError::NotFound("Post not found".to_string()))?;
            if !post.is_published {
                return Err(ApiError::TargetUnavailable);
            }
        }
        other => {
            return Err(ApiError::Validation(format!("Unknown target kind: {}", other)));
        }
    }
    Ok(())
}

fn validate_request(input: &ReactionRequest) -> Result<String, ApiError> {
    if !is_valid_target_kind(&input.target_kind) {
        return Err(ApiError::Validation(format!(
            "Unknown target kind: {}",
            input.target_kind
        )));
    }
    let kind = input
        .kind
        .as_deref()
        .ok_or_else(|| ApiError::Validation("Reaction kind is required".to_string()))?;
    if !is_valid_reaction_kind(kind) {
        return Err(ApiError::Validation(format!(
            "Unknown reaction kind: {}",
            kind
        )));
    }
    Ok(kind.to_string())
}

// Counter updates are always column arithmetic inside the transaction,
// never an application-level read-modify-write. Target kinds are validated
// before these are reached.

fn counter_increment_sql(target_kind: &str) -> &'static str {
    match target_kind {
        TARGET_COMMENT => "UPDATE comments SET like_count = like_count + 1 WHERE id = ?",
        _ => "UPDATE posts SET like_count = like_count + 1 WHERE id = ?",
    }
}

fn counter_decrement_sql(target_kind: &str) -> &'static str {
    match target_kind {
        TARGET_COMMENT => "UPDATE comments SET like_count = GREATEST(like_count - ?, 0) WHERE id = ?",
        _ => "UPDATE posts SET like_count = GREATEST(like_count - ?, 0) WHERE id = ?",
    }
}

fn counter_set_sql(target_kind: &str) -> &'static str {
    match target_kind {
        TARGET_COMMENT => "UPDATE comments SET like_count = ? WHERE id = ?",
        _ => "UPDATE posts SET like_count = ? WHERE id = ?",
    }
}

fn is_unique_violation(error: &ApiError) -> bool {
    match error {
        ApiError::Database(sqlx::Error::Database(db_error)) => db_error.is_unique_violation(),
        _ => false,
    }
}

fn is_transient_sqlx(error: &ApiError) -> bool {
    match error {
        ApiError::Database(sqlx::Error::Database(db_error)) => {
            let mysql_error = db_error.downcast_ref::<sqlx::mysql::MySqlDatabaseError>();
            matches!(mysql_error.number(), 1213 | 1205)
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_surplus_keeps_earliest_reaction() {
        // The committed winner of a double-submit race must survive cleanup.
        assert_eq!(surplus_reaction_ids(vec![9, 3, 5]), vec![5, 9]);
        assert_eq!(surplus_reaction_ids(vec![7]), Vec::<i64>::new());
        assert!(surplus_reaction_ids(Vec::new()).is_empty());
    }
}
