use sqlx::{MySqlPool, mysql::MySqlPoolOptions};

pub async fn init_db(database_url: &str) -> Result<MySqlPool, sqlx::Error> {
    let pool = MySqlPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            id BIGINT AUTO_INCREMENT PRIMARY KEY,
            username VARCHAR(191) NOT NULL UNIQUE,
            email VARCHAR(191) NOT NULL UNIQUE,
            hashed_password VARCHAR(255) NULL,
            display_name VARCHAR(255) NULL,
            avatar_url TEXT NULL,
            role VARCHAR(16) NOT NULL DEFAULT 'member',
            is_active BOOLEAN NOT NULL DEFAULT TRUE,
            created_at DATETIME(6) NOT NULL DEFAULT CURRENT_TIMESTAMP(6)
        ) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4 COLLATE=utf8mb4_unicode_ci
        "#,
    )
    .execute(&pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS posts (
            id BIGINT AUTO_INCREMENT PRIMARY KEY,
            author_id BIGINT NOT NULL,
            title VARCHAR(255) NOT NULL,
            body LONGTEXT NOT NULL,
            comments_enabled BOOLEAN NOT NULL DEFAULT TRUE,
            comment_count BIGINT NOT NULL DEFAULT 0,
            like_count BIGINT NOT NULL DEFAULT 0,
            is_published BOOLEAN NOT NULL DEFAULT TRUE,
            created_at DATETIME(6) NOT NULL DEFAULT CURRENT_TIMESTAMP(6),
            updated_at DATETIME(6) NULL,
            INDEX idx_posts_author_id (author_id),
            INDEX idx_posts_published_created_at (is_published, created_at),
            CONSTRAINT fk_posts_author_id FOREIGN KEY (author_id) REFERENCES users(id) ON DELETE CASCADE
        ) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4 COLLATE=utf8mb4_unicode_ci
        "#,
    )
    .execute(&pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS comments (
            id BIGINT AUTO_INCREMENT PRIMARY KEY,
            post_id BIGINT NOT NULL,
            author_id BIGINT NOT NULL,
            parent_kind VARCHAR(8) NOT NULL,
            parent_id BIGINT NOT NULL,
            content TEXT NOT NULL,
            media_json JSON NULL,
            mentions_json JSON NULL,
            depth INT NOT NULL DEFAULT 0,
            path VARCHAR(255) NOT NULL DEFAULT '',
            status VARCHAR(8) NOT NULL DEFAULT 'active',
            like_count BIGINT NOT NULL DEFAULT 0,
            reply_count BIGINT NOT NULL DEFAULT 0,
            share_count BIGINT NOT NULL DEFAULT 0,
            reported_count INT NOT NULL DEFAULT 0,
            reported_by_json JSON NULL,
            moderated_by BIGINT NULL,
            moderation_notes TEXT NULL,
            edit_history_json JSON NULL,
            edited_at DATETIME(6) NULL,
            created_at DATETIME(6) NOT NULL DEFAULT CURRENT_TIMESTAMP(6),
            updated_at DATETIME(6) NULL,
            INDEX idx_comments_parent_created_at (parent_kind, parent_id, created_at),
            INDEX idx_comments_path (path),
            INDEX idx_comments_post_created_at (post_id, created_at),
            INDEX idx_comments_author_created_at (author_id, created_at),
            CONSTRAINT fk_comments_post_id FOREIGN KEY (post_id) REFERENCES posts(id) ON DELETE CASCADE,
            CONSTRAINT fk_comments_author_id FOREIGN KEY (author_id) REFERENCES users(id) ON DELETE CASCADE
        ) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4 COLLATE=utf8mb4_unicode_ci
        "#,
    )
    .execute(&pool)
    .await?;

    // The unique key is the real guard against concurrent double reactions;
    // application-level pre-checks only produce friendlier errors.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS reactions (
            id BIGINT AUTO_INCREMENT PRIMARY KEY,
            user_id BIGINT NOT NULL,
            target_kind VARCHAR(8) NOT NULL,
            target_id BIGINT NOT NULL,
            kind VARCHAR(16) NOT NULL,
            created_at DATETIME(6) NOT NULL DEFAULT CURRENT_TIMESTAMP(6),
            UNIQUE KEY uq_reactions_user_target (user_id, target_kind, target_id),
            INDEX idx_reactions_target (target_kind, target_id),
            CONSTRAINT fk_reactions_user_id FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
        ) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4 COLLATE=utf8mb4_unicode_ci
        "#,
    )
    .execute(&pool)
    .await?;

    if let Ok(admin_username) = std::env::var("ADMIN_USERNAME") {
        if !admin_username.is_empty() {
            let _ = sqlx::query("UPDATE users SET role = 'admin' WHERE username = ?")
                .bind(&admin_username)
                .execute(&pool)
                .await;
            tracing::info!("Admin promotion checked for username: {}", admin_username);
        }
    }

    Ok(pool)
}
