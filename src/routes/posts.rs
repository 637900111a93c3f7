use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::get,
};
use chrono::Utc;
use sqlx::MySqlPool;

use crate::error::ApiError;
use crate::models::{CreatePost, Post, PostListResponse, PostQuery, PostResponse, User, UserResponse};
use crate::routes::auth::extract_current_user;

pub fn posts_routes() -> Router<MySqlPool> {
    Router::new()
        .route("/", get(list_posts).post(create_post))
        .route("/{post_id}", get(get_post))
}

async fn list_posts(
    State(pool): State<MySqlPool>,
    Query(query): Query<PostQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let page = query.page.unwrap_or(1).max(1);
    let per_page = query.per_page.unwrap_or(10).clamp(1, 100);
    let offset = (page as i64 - 1) * per_page as i64;

    let (posts, total): (Vec<Post>, i64) = if let Some(ref search) = query.search {
        let search_pattern = format!("%{}%", search);
        let posts = sqlx::query_as::<_, Post>(
            r#"SELECT * FROM posts
               WHERE is_published = TRUE AND (title LIKE ? OR body LIKE ?)
               ORDER BY created_at DESC LIMIT ? OFFSET ?"#,
        )
        .bind(&search_pattern)
        .bind(&search_pattern)
        .bind(per_page)
        .bind(offset)
        .fetch_all(&pool)
        .await?;

        let count: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM posts WHERE is_published = TRUE AND (title LIKE ? OR body LIKE ?)",
        )
        .bind(&search_pattern)
        .bind(&search_pattern)
        .fetch_one(&pool)
        .await?;

        (posts, count.0)
    } else {
        let posts = sqlx::query_as::<_, Post>(
            "SELECT * FROM posts WHERE is_published = TRUE ORDER BY created_at DESC LIMIT ? OFFSET ?",
        )
        .bind(per_page)
        .bind(offset)
        .fetch_all(&pool)
        .await?;

        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM posts WHERE is_published = TRUE")
            .fetch_one(&pool)
            .await?;

        (posts, count.0)
    };

    let mut post_responses = Vec::new();
    for post in posts {
        let author = sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = ?")
            .bind(post.author_id)
            .fetch_one(&pool)
            .await?;
        post_responses.push(to_response(post, author));
    }

    Ok(Json(PostListResponse {
        posts: post_responses,
        total,
        page,
        per_page,
    }))
}

async fn get_post(
    State(pool): State<MySqlPool>,
    Path(post_id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let post = find_published_post(&pool, post_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Post not found".to_string()))?;

    let author = sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = ?")
        .bind(post.author_id)
        .fetch_one(&pool)
        .await?;

    Ok(Json(to_response(post, author)))
}

async fn create_post(
    State(pool): State<MySqlPool>,
    headers: HeaderMap,
    Json(input): Json<CreatePost>,
) -> Result<impl IntoResponse, ApiError> {
    let current_user = extract_current_user(&pool, &headers).await?;

    if input.title.trim().is_empty() || input.body.trim().is_empty() {
        return Err(ApiError::Validation(
            "Title and body are required".to_string(),
        ));
    }

    let now = Utc::now();
    let result = sqlx::query(
        r#"INSERT INTO posts (author_id, title, body, comments_enabled, created_at)
           VALUES (?, ?, ?, ?, ?)"#,
    )
    .bind(current_user.id)
    .bind(input.title.trim())
    .bind(input.body.trim())
    .bind(input.comments_enabled.unwrap_or(true))
    .bind(now)
    .execute(&pool)
    .await?;

    let post = sqlx::query_as::<_, Post>("SELECT * FROM posts WHERE id = ?")
        .bind(result.last_insert_id() as i64)
        .fetch_one(&pool)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(to_response(post, current_user)),
    ))
}

pub async fn find_published_post(
    pool: &MySqlPool,
    post_id: i64,
) -> Result<Option<Post>, ApiError> {
    let post = sqlx::query_as::<_, Post>("SELECT * FROM posts WHERE id = ? AND is_published = TRUE")
        .bind(post_id)
        .fetch_optional(pool)
        .await?;
    Ok(post)
}

/// The comment write path's view of a container: it must exist, be published
/// and accept comments.
pub async fn ensure_container(pool: &MySqlPool, post_id: i64) -> Result<Post, ApiError> {
    let post = find_published_post(pool, post_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Post not found".to_string()))?;

    ensure_comments_enabled(&post)?;
    Ok(post)
}

/// A container with comments switched off is a state problem, not a
/// permission problem.
fn ensure_comments_enabled(post: &Post) -> Result<(), ApiError> {
    if !post.comments_enabled {
        return Err(ApiError::ParentInactive);
    }
    Ok(())
}

fn to_response(post: Post, author: User) -> PostResponse {
    PostResponse {
        id: post.id,
        author_id: post.author_id,
        author: UserResponse::from(author),
        title: post.title,
        body: post.body,
        comments_enabled: post.comments_enabled,
        comment_count: post.comment_count,
        like_count: post.like_count,
        created_at: post.created_at,
        updated_at: post.updated_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn post_with_comments(enabled: bool) -> Post {
        Post {
            id: 1,
            author_id: 1,
            title: "title".to_string(),
            body: "body".to_string(),
            comments_enabled: enabled,
            comment_count: 0,
            like_count: 0,
            is_published: true,
            created_at: Utc::now(),
            updated_at: None,
        }
    }

    #[test]
    fn test_disabled_comments_is_a_state_error() {
        assert!(matches!(
            ensure_comments_enabled(&post_with_comments(false)),
            Err(ApiError::ParentInactive)
        ));
        assert!(ensure_comments_enabled(&post_with_comments(true)).is_ok());
    }
}
