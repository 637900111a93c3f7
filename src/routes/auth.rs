use axum::{
    Router,
    extract::{Json, State},
    http::{HeaderMap, StatusCode, header::AUTHORIZATION},
    response::IntoResponse,
    routing::{get, post},
};
use bcrypt::{DEFAULT_COST, hash, verify};
use chrono::Utc;
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use sqlx::MySqlPool;

use crate::error::ApiError;
use crate::models::{CreateUser, ROLE_MEMBER, TokenResponse, User, UserResponse};

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: usize,
}

pub fn auth_routes() -> Router<MySqlPool> {
    Router::new()
        .route("/register", post(register))
        .route("/login", post(login))
        .route("/me", get(get_me))
}

async fn register(
    State(pool): State<MySqlPool>,
    Json(input): Json<CreateUser>,
) -> Result<impl IntoResponse, ApiError> {
    let existing = sqlx::query_as::<_, User>("SELECT * FROM users WHERE username = ? OR email = ?")
        .bind(&input.username)
        .bind(&input.email)
        .fetch_optional(&pool)
        .await?;

    if existing.is_some() {
        return Err(ApiError::Validation(
            "Username or email already registered".to_string(),
        ));
    }

    let hashed = hash(&input.password, DEFAULT_COST)
        .map_err(|e| ApiError::Validation(format!("Could not hash password: {}", e)))?;

    let display_name = input.display_name.unwrap_or_else(|| input.username.clone());
    let now = Utc::now();

    let result = sqlx::query(
        r#"INSERT INTO users (username, email, hashed_password, display_name, role, created_at)
           VALUES (?, ?, ?, ?, ?, ?)"#,
    )
    .bind(&input.username)
    .bind(&input.email)
    .bind(&hashed)
    .bind(&display_name)
    .bind(ROLE_MEMBER)
    .bind(now)
    .execute(&pool)
    .await?;

    let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = ?")
        .bind(result.last_insert_id() as i64)
        .fetch_one(&pool)
        .await?;

    Ok((StatusCode::CREATED, Json(UserResponse::from(user))))
}

#[derive(Debug, Deserialize)]
pub struct LoginForm {
    pub username: String,
    pub password: String,
}

async fn login(
    State(pool): State<MySqlPool>,
    axum::Form(input): axum::Form<LoginForm>,
) -> Result<impl IntoResponse, ApiError> {
    let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE username = ?")
        .bind(&input.username)
        .fetch_optional(&pool)
        .await?
        .ok_or_else(|| ApiError::Unauthorized("Incorrect username or password".to_string()))?;

    let hashed = user
        .hashed_password
        .as_ref()
        .ok_or_else(|| ApiError::Unauthorized("Account has no password set".to_string()))?;

    let valid = verify(&input.password, hashed)
        .map_err(|_| ApiError::Unauthorized("Incorrect username or password".to_string()))?;

    if !valid {
        return Err(ApiError::Unauthorized(
            "Incorrect username or password".to_string(),
        ));
    }

    let token = generate_jwt(&user.username)?;
    Ok(Json(TokenResponse {
        access_token: token,
        token_type: "bearer".to_string(),
    }))
}

async fn get_me(
    State(pool): State<MySqlPool>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let user = extract_current_user(&pool, &headers).await?;
    Ok(Json(UserResponse::from(user)))
}

/// Resolves the bearer token into an active user. Every protected handler
/// funnels through here.
pub async fn extract_current_user(
    pool: &MySqlPool,
    headers: &HeaderMap,
) -> Result<User, ApiError> {
    let auth_header = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::Unauthorized("Missing authorization header".to_string()))?;

    let token = auth_header
        .strip_prefix("Bearer ")
        .ok_or_else(|| ApiError::Unauthorized("Invalid authorization header".to_string()))?;

    let secret = std::env::var("SECRET_KEY").expect("SECRET_KEY must be set in .env");

    let token_data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|_| ApiError::Unauthorized("Invalid token".to_string()))?;

    let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE username = ?")
        .bind(&token_data.claims.sub)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| ApiError::Unauthorized("User not found".to_string()))?;

    if !user.is_active {
        return Err(ApiError::Forbidden("Account is deactivated".to_string()));
    }

    Ok(user)
}

/// Like `extract_current_user`, but anonymous and stale tokens degrade to
/// `None` so read endpoints stay public.
pub async fn extract_optional_user(
    pool: &MySqlPool,
    headers: &HeaderMap,
) -> Result<Option<User>, ApiError> {
    let Some(auth_header) = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()) else {
        return Ok(None);
    };

    let Some(token) = auth_header.strip_prefix("Bearer ") else {
        return Ok(None);
    };

    let secret = std::env::var("SECRET_KEY").expect("SECRET_KEY must be set in .env");
    let token_data = match decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    ) {
        Ok(data) => data,
        Err(_) => return Ok(None),
    };

    let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE username = ?")
        .bind(&token_data.claims.sub)
        .fetch_optional(pool)
        .await?;

    Ok(user)
}

pub async fn extract_admin_user(
    pool: &MySqlPool,
    headers: &HeaderMap,
) -> Result<User, ApiError> {
    let user = extract_current_user(pool, headers).await?;
    if !user.is_admin() {
        return Err(ApiError::Forbidden("Admin access required".to_string()));
    }
    Ok(user)
}

fn generate_jwt(username: &str) -> Result<String, ApiError> {
    let secret = std::env::var("SECRET_KEY").expect("SECRET_KEY must be set in .env");
    let expiration = chrono::Utc::now()
        .checked_add_signed(chrono::Duration::hours(24))
        .expect("valid timestamp")
        .timestamp() as usize;

    let claims = Claims {
        sub: username.to_string(),
        exp: expiration,
    };

    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|_| ApiError::Unauthorized("Could not issue token".to_string()))
}
