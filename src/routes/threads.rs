use std::collections::HashMap;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::HeaderMap,
    response::IntoResponse,
    routing::get,
};
use serde::Deserialize;
use sqlx::MySqlPool;

use crate::error::ApiError;
use crate::models::{
    Comment, CommentListResponse, CommentResponse, TARGET_COMMENT, User, UserResponse,
};
use crate::routes::auth::extract_optional_user;
use crate::routes::comments::find_comment;
use crate::routes::posts::find_published_post;

/// Direct replies eagerly attached to each root in a thread page.
const REPLY_PREVIEW_LIMIT: i32 = 3;
const DEFAULT_PAGE_LIMIT: i32 = 20;

pub fn threads_routes() -> Router<MySqlPool> {
    Router::new()
        .route("/posts/{post_id}/comments", get(get_thread))
        .route("/comments/{comment_id}/replies", get(get_replies))
        .route("/comments/search", get(search_comments))
        .route("/users/{user_id}/comments", get(get_user_comments))
}

#[derive(Debug, Deserialize, Default)]
pub struct ThreadQuery {
    pub page: Option<i32>,
    pub limit: Option<i32>,
    pub max_depth: Option<i32>,
    pub sort_order: Option<String>,
    pub include_replies: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
pub struct RepliesQuery {
    pub page: Option<i32>,
    pub limit: Option<i32>,
    pub sort_order: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    pub q: String,
    pub post_id: Option<i64>,
    pub page: Option<i32>,
    pub limit: Option<i32>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PageQuery {
    pub page: Option<i32>,
    pub limit: Option<i32>,
}

async fn get_thread(
    State(pool): State<MySqlPool>,
    headers: HeaderMap,
    Path(post_id): Path<i64>,
    Query(query): Query<ThreadQuery>,
) -> Result<impl IntoResponse, ApiError> {
    find_published_post(&pool, post_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Post not found".to_string()))?;

    let viewer = extract_optional_user(&pool, &headers).await?;
    let (page, limit) = clamp_page_limit(query.page, query.limit);
    let offset = page_offset(page, limit);
    let order = sort_clause(query.sort_order.as_deref());
    let max_depth = query.max_depth.unwrap_or(i32::MAX);
    let expand = expand_replies(query.include_replies, max_depth);

    let roots = sqlx::query_as::<_, Comment>(&format!(
        r#"SELECT * FROM comments
           WHERE parent_kind = 'post' AND parent_id = ? AND status = 'active' AND depth <= ?
           ORDER BY {} LIMIT ? OFFSET ?"#,
        order
    ))
    .bind(post_id)
    .bind(max_depth)
    .bind(limit)
    .bind(offset)
    .fetch_all(&pool)
    .await?;

    let total: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM comments WHERE parent_kind = 'post' AND parent_id = ? AND status = 'active'",
    )
    .bind(post_id)
    .fetch_one(&pool)
    .await?;

    let mut reply_pages: Vec<Vec<Comment>> = Vec::with_capacity(roots.len());
    if expand {
        for root in &roots {
            if root.reply_count > 0 {
                let replies = sqlx::query_as::<_, Comment>(&format!(
                    r#"SELECT * FROM comments
                       WHERE parent_kind = 'comment' AND parent_id = ? AND status = 'active'
                       ORDER BY {} LIMIT ?"#,
                    order
                ))
                .bind(root.id)
                .bind(REPLY_PREVIEW_LIMIT)
                .fetch_all(&pool)
                .await?;
                reply_pages.push(replies);
            } else {
                reply_pages.push(Vec::new());
            }
        }
    } else {
        reply_pages.resize_with(roots.len(), Vec::new);
    }

    // One author lookup and one reaction lookup for the whole page.
    let mut all_ids: Vec<i64> = roots.iter().map(|c| c.id).collect();
    let mut author_ids: Vec<i64> = roots.iter().map(|c| c.author_id).collect();
    for replies in &reply_pages {
        all_ids.extend(replies.iter().map(|c| c.id));
        author_ids.extend(replies.iter().map(|c| c.author_id));
    }
    let authors = fetch_authors(&pool, &author_ids).await?;
    let reactions = viewer_reactions(&pool, viewer.as_ref(), &all_ids).await?;

    let mut comments = Vec::with_capacity(roots.len());
    for (root, replies) in roots.into_iter().zip(reply_pages) {
        let mut response = annotate(&root, &authors, &reactions)?;
        if expand {
            let expanded = replies
                .iter()
                .map(|reply| annotate(reply, &authors, &reactions))
                .collect::<Result<Vec<_>, _>>()?;
            response.replies = Some(expanded);
        }
        comments.push(response);
    }

    Ok(Json(CommentListResponse {
        comments,
        total: total.0,
        page,
        limit,
    }))
}

async fn get_replies(
    State(pool): State<MySqlPool>,
    headers: HeaderMap,
    Path(comment_id): Path<i64>,
    Query(query): Query<RepliesQuery>,
) -> Result<impl IntoResponse, ApiError> {
    find_comment(&pool, comment_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Comment not found".to_string()))?;

    let viewer = extract_optional_user(&pool, &headers).await?;
    let (page, limit) = clamp_page_limit(query.page, query.limit);
    let offset = page_offset(page, limit);
    let order = sort_clause(query.sort_order.as_deref());

    let replies = sqlx::query_as::<_, Comment>(&format!(
        r#"SELECT * FROM comments
           WHERE parent_kind = 'comment' AND parent_id = ? AND status = 'active'
           ORDER BY {} LIMIT ? OFFSET ?"#,
        order
    ))
    .bind(comment_id)
    .bind(limit)
    .bind(offset)
    .fetch_all(&pool)
    .await?;

    let total: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM comments WHERE parent_kind = 'comment' AND parent_id = ? AND status = 'active'",
    )
    .bind(comment_id)
    .fetch_one(&pool)
    .await?;

    let comments = assemble(&pool, viewer.as_ref(), &replies).await?;

    Ok(Json(CommentListResponse {
        comments,
        total: total.0,
        page,
        limit,
    }))
}

async fn search_comments(
    State(pool): State<MySqlPool>,
    headers: HeaderMap,
    Query(query): Query<SearchQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let term = query.q.trim();
    if term.is_empty() {
        return Err(ApiError::Validation("Search query is required".to_string()));
    }

    let viewer = extract_optional_user(&pool, &headers).await?;
    let (page, limit) = clamp_page_limit(query.page, query.limit);
    let offset = page_offset(page, limit);
    let pattern = format!("%{}%", term);

    let (rows, total): (Vec<Comment>, i64) = if let Some(post_id) = query.post_id {
        let rows = sqlx::query_as::<_, Comment>(
            r#"SELECT * FROM comments
               WHERE status = 'active' AND post_id = ? AND content LIKE ?
               ORDER BY created_at DESC LIMIT ? OFFSET ?"#,
        )
        .bind(post_id)
        .bind(&pattern)
        .bind(limit)
        .bind(offset)
        .fetch_all(&pool)
        .await?;

        let count: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM comments WHERE status = 'active' AND post_id = ? AND content LIKE ?",
        )
        .bind(post_id)
        .bind(&pattern)
        .fetch_one(&pool)
        .await?;

        (rows, count.0)
    } else {
        let rows = sqlx::query_as::<_, Comment>(
            r#"SELECT * FROM comments
               WHERE status = 'active' AND content LIKE ?
               ORDER BY created_at DESC LIMIT ? OFFSET ?"#,
        )
        .bind(&pattern)
        .bind(limit)
        .bind(offset)
        .fetch_all(&pool)
        .await?;

        let count: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM comments WHERE status = 'active' AND content LIKE ?",
        )
        .bind(&pattern)
        .fetch_one(&pool)
        .await?;

        (rows, count.0)
    };

    let comments = assemble(&pool, viewer.as_ref(), &rows).await?;

    Ok(Json(CommentListResponse {
        comments,
        total,
        page,
        limit,
    }))
}

async fn get_user_comments(
    State(pool): State<MySqlPool>,
    headers: HeaderMap,
    Path(user_id): Path<i64>,
    Query(query): Query<PageQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let author = sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = ?")
        .bind(user_id)
        .fetch_optional(&pool)
        .await?
        .ok_or_else(|| ApiError::NotFound("User not found".to_string()))?;

    let viewer = extract_optional_user(&pool, &headers).await?;
    let (page, limit) = clamp_page_limit(query.page, query.limit);
    let offset = page_offset(page, limit);

    let rows = sqlx::query_as::<_, Comment>(
        r#"SELECT * FROM comments
           WHERE author_id = ? AND status = 'active'
           ORDER BY created_at DESC LIMIT ? OFFSET ?"#,
    )
    .bind(author.id)
    .bind(limit)
    .bind(offset)
    .fetch_all(&pool)
    .await?;

    let total: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM comments WHERE author_id = ? AND status = 'active'",
    )
    .bind(author.id)
    .fetch_one(&pool)
    .await?;

    let comments = assemble(&pool, viewer.as_ref(), &rows).await?;

    // Container titles so the profile view can label each comment.
    let post_ids: Vec<i64> = rows.iter().map(|c| c.post_id).collect();
    let post_titles = fetch_post_titles(&pool, &post_ids).await?;

    Ok(Json(serde_json::json!({
        "comments": comments,
        "post_titles": post_titles,
        "total": total.0,
        "page": page,
        "limit": limit,
    })))
}

// ============================
// Assembly helpers
// ============================

/// Annotates a uniform batch of rows: batched author lookup, one reaction
/// query for the viewer, no per-node round trips.
async fn assemble(
    pool: &MySqlPool,
    viewer: Option<&User>,
    rows: &[Comment],
) -> Result<Vec<CommentResponse>, ApiError> {
    let ids: Vec<i64> = rows.iter().map(|c| c.id).collect();
    let author_ids: Vec<i64> = rows.iter().map(|c| c.author_id).collect();
    let authors = fetch_authors(pool, &author_ids).await?;
    let reactions = viewer_reactions(pool, viewer, &ids).await?;

    rows.iter()
        .map(|comment| annotate(comment, &authors, &reactions))
        .collect()
}

fn annotate(
    comment: &Comment,
    authors: &HashMap<i64, UserResponse>,
    reactions: &HashMap<i64, String>,
) -> Result<CommentResponse, ApiError> {
    let author = authors
        .get(&comment.author_id)
        .cloned()
        .ok_or_else(|| ApiError::NotFound("Comment author not found".to_string()))?;

    let mut response = CommentResponse::from_parts(comment, author);
    let kind = reactions.get(&comment.id).cloned();
    response.has_reacted = Some(kind.is_some());
    response.reaction_kind = kind;
    Ok(response)
}

async fn fetch_authors(
    pool: &MySqlPool,
    author_ids: &[i64],
) -> Result<HashMap<i64, UserResponse>, ApiError> {
    if author_ids.is_empty() {
        return Ok(HashMap::new());
    }

    let placeholders = vec!["?"; author_ids.len()].join(", ");
    let sql = format!("SELECT * FROM users WHERE id IN ({})", placeholders);

    let mut query = sqlx::query_as::<_, User>(&sql);
    for id in author_ids {
        query = query.bind(id);
    }

    let users = query.fetch_all(pool).await?;
    Ok(users
        .into_iter()
        .map(|user| (user.id, UserResponse::from(user)))
        .collect())
}

/// The viewer's own reactions over a set of comments, in one query.
pub async fn viewer_reactions(
    pool: &MySqlPool,
    viewer: Option<&User>,
    comment_ids: &[i64],
) -> Result<HashMap<i64, String>, ApiError> {
    let Some(viewer) = viewer else {
        return Ok(HashMap::new());
    };
    if comment_ids.is_empty() {
        return Ok(HashMap::new());
    }

    let placeholders = vec!["?"; comment_ids.len()].join(", ");
    let sql = format!(
        "SELECT target_id, kind FROM reactions WHERE user_id = ? AND target_kind = ? AND target_id IN ({})",
        placeholders
    );

    let mut query = sqlx::query_as::<_, (i64, String)>(&sql);
    query = query.bind(viewer.id).bind(TARGET_COMMENT);
    for id in comment_ids {
        query = query.bind(id);
    }

    let rows = query.fetch_all(pool).await?;
    Ok(rows.into_iter().collect())
}

async fn fetch_post_titles(
    pool: &MySqlPool,
    post_ids: &[i64],
) -> Result<HashMap<i64, String>, ApiError> {
    if post_ids.is_empty() {
        return Ok(HashMap::new());
    }

    let placeholders = vec!["?"; post_ids.len()].join(", ");
    let sql = format!("SELECT id, title FROM posts WHERE id IN ({})", placeholders);

    let mut query = sqlx::query_as::<_, (i64, String)>(&sql);
    for id in post_ids {
        query = query.bind(id);
    }

    let rows = query.fetch_all(pool).await?;
    Ok(rows.into_iter().collect())
}

fn clamp_page_limit(page: Option<i32>, limit: Option<i32>) -> (i32, i32) {
    (
        page.unwrap_or(1).max(1),
        limit.unwrap_or(DEFAULT_PAGE_LIMIT).clamp(1, 100),
    )
}

/// SQL OFFSET in i64 so an extreme page number cannot overflow.
fn page_offset(page: i32, limit: i32) -> i64 {
    (page as i64 - 1) * limit as i64
}

/// Reply previews sit at depth 1, so a `max_depth` of 0 suppresses them.
fn expand_replies(include_replies: Option<bool>, max_depth: i32) -> bool {
    include_replies.unwrap_or(false) && max_depth >= 1
}

fn sort_clause(sort_order: Option<&str>) -> &'static str {
    match sort_order {
        Some("oldest") => "created_at ASC",
        Some("popular") => "like_count DESC, created_at DESC",
        _ => "created_at DESC",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_page_limit_defaults() {
        assert_eq!(clamp_page_limit(None, None), (1, DEFAULT_PAGE_LIMIT));
    }

    #[test]
    fn test_clamp_page_limit_bounds() {
        assert_eq!(clamp_page_limit(Some(0), Some(0)), (1, 1));
        assert_eq!(clamp_page_limit(Some(-3), Some(100_000)), (1, 100));
        assert_eq!(clamp_page_limit(Some(4), Some(50)), (4, 50));
    }

    #[test]
    fn test_page_offset_handles_extreme_pages() {
        assert_eq!(page_offset(1, 20), 0);
        assert_eq!(page_offset(3, 20), 40);
        // i32 arithmetic would overflow here; the i64 offset must not.
        assert_eq!(page_offset(i32::MAX, 100), (i32::MAX as i64 - 1) * 100);
    }

    #[test]
    fn test_expand_replies_respects_max_depth() {
        assert!(expand_replies(Some(true), 1));
        assert!(expand_replies(Some(true), i32::MAX));
        assert!(!expand_replies(Some(true), 0));
        assert!(!expand_replies(Some(false), 5));
        assert!(!expand_replies(None, 5));
    }

    #[test]
    fn test_sort_clause() {
        assert_eq!(sort_clause(Some("oldest")), "created_at ASC");
        assert_eq!(sort_clause(Some("popular")), "like_count DESC, created_at DESC");
        assert_eq!(sort_clause(Some("newest")), "created_at DESC");
        assert_eq!(sort_clause(Some("garbage")), "created_at DESC");
        assert_eq!(sort_clause(None), "created_at DESC");
    }
}
