use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

pub const ROLE_MEMBER: &str = "member";
pub const ROLE_MODERATOR: &str = "moderator";
pub const ROLE_ADMIN: &str = "admin";

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub hashed_password: Option<String>,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
    pub role: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn is_admin(&self) -> bool {
        self.role == ROLE_ADMIN
    }

    /// Moderators and admins share the moderation surface.
    pub fn can_moderate(&self) -> bool {
        self.role == ROLE_MODERATOR || self.role == ROLE_ADMIN
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct UserResponse {
    pub id: i64,
    pub username: String,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
    pub role: String,
    pub created_at: DateTime<Utc>,
}

impl From<User> for UserResponse {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            username: user.username,
            display_name: user.display_name,
            avatar_url: user.avatar_url,
            role: user.role,
            created_at: user.created_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateUser {
    pub username: String,
    pub email: String,
    pub password: String,
    pub display_name: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user_with_role(role: &str) -> User {
        User {
            id: 1,
            username: "alice".to_string(),
            email: "alice@example.com".to_string(),
            hashed_password: None,
            display_name: None,
            avatar_url: None,
            role: role.to_string(),
            is_active: true,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_role_checks() {
        assert!(!user_with_role(ROLE_MEMBER).can_moderate());
        assert!(user_with_role(ROLE_MODERATOR).can_moderate());
        assert!(user_with_role(ROLE_ADMIN).can_moderate());
        assert!(user_with_role(ROLE_ADMIN).is_admin());
        assert!(!user_with_role(ROLE_MODERATOR).is_admin());
    }

    #[test]
    fn test_password_never_serialized() {
        let mut user = user_with_role(ROLE_MEMBER);
        user.hashed_password = Some("bcrypt-hash".to_string());
        let json = serde_json::to_string(&user).unwrap();
        assert!(!json.contains("bcrypt-hash"));
    }
}
