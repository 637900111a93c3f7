use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::error::ApiError;

use super::user::UserResponse;

/// Replies deeper than this are rejected outright.
pub const MAX_DEPTH: i32 = 10;
pub const MAX_CONTENT_LEN: usize = 2000;
/// Prior contents kept per comment; oldest entries are dropped.
pub const MAX_EDIT_HISTORY: usize = 5;
/// Distinct reports after which a comment is auto-flagged for review.
pub const FLAG_THRESHOLD: i32 = 3;

pub const STATUS_ACTIVE: &str = "active";
pub const STATUS_HIDDEN: &str = "hidden";
pub const STATUS_DELETED: &str = "deleted";
pub const STATUS_FLAGGED: &str = "flagged";

pub const PARENT_POST: &str = "post";
pub const PARENT_COMMENT: &str = "comment";

pub fn is_valid_status(status: &str) -> bool {
    matches!(
        status,
        STATUS_ACTIVE | STATUS_HIDDEN | STATUS_DELETED | STATUS_FLAGGED
    )
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Comment {
    pub id: i64,
    pub post_id: i64,
    pub author_id: i64,
    pub parent_kind: String,
    pub parent_id: i64,
    pub content: String,
    pub media_json: Option<String>,
    pub mentions_json: Option<String>,
    pub depth: i32,
    pub path: String,
    pub status: String,
    pub like_count: i64,
    pub reply_count: i64,
    pub share_count: i64,
    pub reported_count: i32,
    pub reported_by_json: Option<String>,
    pub moderated_by: Option<i64>,
    pub moderation_notes: Option<String>,
    pub edit_history_json: Option<String>,
    pub edited_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MediaItem {
    pub url: String,
    pub kind: String,
}

impl MediaItem {
    pub fn kind_is_valid(&self) -> bool {
        matches!(self.kind.as_str(), "image" | "video" | "gif")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportEntry {
    pub user_id: i64,
    pub reason: String,
    pub reported_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditHistoryEntry {
    pub previous_content: String,
    pub edited_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct CommentResponse {
    pub id: i64,
    pub post_id: i64,
    pub author_id: i64,
    pub author: UserResponse,
    pub parent_kind: String,
    pub parent_id: i64,
    pub content: String,
    pub media: Vec<MediaItem>,
    pub mentioned_user_ids: Vec<i64>,
    pub depth: i32,
    pub path: String,
    pub status: String,
    pub like_count: i64,
    pub reply_count: i64,
    pub share_count: i64,
    pub reported_count: i32,
    pub edited_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    /// The requesting user's own reaction, when a viewer is known.
    pub has_reacted: Option<bool>,
    pub reaction_kind: Option<String>,
    /// One eagerly expanded page of direct replies (thread view only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replies: Option<Vec<CommentResponse>>,
}

impl CommentResponse {
    /// Expands a stored row into the wire shape. Annotations start unset;
    /// the read assembler fills them in when a viewer is known.
    pub fn from_parts(comment: &Comment, author: UserResponse) -> Self {
        Self {
            id: comment.id,
            post_id: comment.post_id,
            author_id: comment.author_id,
            author,
            parent_kind: comment.parent_kind.clone(),
            parent_id: comment.parent_id,
            content: comment.content.clone(),
            media: parse_media_json(comment.media_json.as_deref()),
            mentioned_user_ids: parse_mentions_json(comment.mentions_json.as_deref()),
            depth: comment.depth,
            path: comment.path.clone(),
            status: comment.status.clone(),
            like_count: comment.like_count,
            reply_count: comment.reply_count,
            share_count: comment.share_count,
            reported_count: comment.reported_count,
            edited_at: comment.edited_at,
            created_at: comment.created_at,
            updated_at: comment.updated_at,
            has_reacted: None,
            reaction_kind: None,
            replies: None,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CommentListResponse {
    pub comments: Vec<CommentResponse>,
    pub total: i64,
    pub page: i32,
    pub limit: i32,
}

#[derive(Debug, Deserialize)]
pub struct CreateComment {
    pub parent_kind: String,
    pub parent_id: i64,
    pub content: Option<String>,
    pub media: Option<Vec<MediaItem>>,
}

#[derive(Debug, Deserialize)]
pub struct EditComment {
    pub content: Option<String>,
    pub media: Option<Vec<MediaItem>>,
}

#[derive(Debug, Deserialize)]
pub struct ReportComment {
    pub reason: String,
}

#[derive(Debug, Deserialize)]
pub struct ModerateComment {
    pub status: String,
    pub notes: Option<String>,
}

// ============================
// Validation & tree helpers
// ============================

/// Trims and validates comment content against the media it arrives with.
/// Returns the trimmed content (empty when the comment is media-only).
pub fn validate_content(
    content: Option<&str>,
    media: &[MediaItem],
) -> Result<String, ApiError> {
    let trimmed = content.unwrap_or_default().trim().to_string();

    if trimmed.is_empty() && media.is_empty() {
        return Err(ApiError::Validation(
            "Comment requires content or media".to_string(),
        ));
    }

    if trimmed.chars().count() > MAX_CONTENT_LEN {
        return Err(ApiError::Validation(format!(
            "Comment content exceeds {} characters",
            MAX_CONTENT_LEN
        )));
    }

    for item in media {
        if item.url.trim().is_empty() {
            return Err(ApiError::Validation("Media url is required".to_string()));
        }
        if !item.kind_is_valid() {
            return Err(ApiError::Validation(format!(
                "Unsupported media kind: {}",
                item.kind
            )));
        }
    }

    Ok(trimmed)
}

/// Ancestry path for a node: its own id at the root, otherwise the parent's
/// path with the new id appended.
pub fn child_path(parent_path: Option<&str>, id: i64) -> String {
    match parent_path {
        Some(parent) => format!("{}.{}", parent, id),
        None => id.to_string(),
    }
}

/// LIKE pattern matching every descendant of `path`, the node itself excluded.
pub fn descendant_pattern(path: &str) -> String {
    format!("{}.%", path)
}

/// Depth a reply under `parent_depth` would take, rejecting growth past the cap.
pub fn child_depth(parent_depth: i32) -> Result<i32, ApiError> {
    if parent_depth >= MAX_DEPTH {
        return Err(ApiError::DepthLimitExceeded);
    }
    Ok(parent_depth + 1)
}

static MENTION_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"@([A-Za-z0-9_]{2,32})").expect("mention pattern compiles"));

/// Extracts unique `@handle` tokens in order of first appearance.
pub fn extract_mention_handles(content: &str) -> Vec<String> {
    let mut handles = Vec::new();
    for capture in MENTION_PATTERN.captures_iter(content) {
        let handle = capture[1].to_string();
        if !handles.contains(&handle) {
            handles.push(handle);
        }
    }
    handles
}

/// Pushes the previous content onto the history, dropping the oldest entry
/// once the cap is reached.
pub fn push_edit_history(
    history: &mut Vec<EditHistoryEntry>,
    previous_content: String,
    edited_at: DateTime<Utc>,
) {
    history.push(EditHistoryEntry {
        previous_content,
        edited_at,
    });
    while history.len() > MAX_EDIT_HISTORY {
        history.remove(0);
    }
}

// ============================
// JSON column helpers
// ============================

pub fn parse_media_json(raw: Option<&str>) -> Vec<MediaItem> {
    raw.and_then(|json_text| serde_json::from_str::<Vec<MediaItem>>(json_text).ok())
        .unwrap_or_default()
}

pub fn parse_mentions_json(raw: Option<&str>) -> Vec<i64> {
    raw.and_then(|json_text| serde_json::from_str::<Vec<i64>>(json_text).ok())
        .unwrap_or_default()
}

pub fn parse_reports_json(raw: Option<&str>) -> Vec<ReportEntry> {
    raw.and_then(|json_text| serde_json::from_str::<Vec<ReportEntry>>(json_text).ok())
        .unwrap_or_default()
}

pub fn parse_edit_history_json(raw: Option<&str>) -> Vec<EditHistoryEntry> {
    raw.and_then(|json_text| serde_json::from_str::<Vec<EditHistoryEntry>>(json_text).ok())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(url: &str) -> MediaItem {
        MediaItem {
            url: url.to_string(),
            kind: "image".to_string(),
        }
    }

    #[test]
    fn test_validate_content_trims() {
        let content = validate_content(Some("  hello world  "), &[]).unwrap();
        assert_eq!(content, "hello world");
    }

    #[test]
    fn test_validate_content_rejects_empty_without_media() {
        assert!(validate_content(Some("   "), &[]).is_err());
        assert!(validate_content(None, &[]).is_err());
    }

    #[test]
    fn test_validate_content_allows_media_only() {
        let content = validate_content(None, &[image("https://cdn/a.png")]).unwrap();
        assert_eq!(content, "");
    }

    #[test]
    fn test_validate_content_length_boundary() {
        let exactly_max = "a".repeat(MAX_CONTENT_LEN);
        assert!(validate_content(Some(&exactly_max), &[]).is_ok());

        let over_max = "a".repeat(MAX_CONTENT_LEN + 1);
        assert!(validate_content(Some(&over_max), &[]).is_err());
    }

    #[test]
    fn test_validate_content_rejects_bad_media_kind() {
        let bad = MediaItem {
            url: "https://cdn/a.bin".to_string(),
            kind: "binary".to_string(),
        };
        assert!(validate_content(Some("hi"), &[bad]).is_err());
    }

    #[test]
    fn test_child_path() {
        assert_eq!(child_path(None, 7), "7");
        assert_eq!(child_path(Some("7"), 12), "7.12");
        assert_eq!(child_path(Some("7.12"), 99), "7.12.99");
    }

    #[test]
    fn test_descendant_pattern_excludes_self() {
        // "7" must not match its own pattern, "7.12" must.
        let pattern = descendant_pattern("7");
        assert_eq!(pattern, "7.%");
    }

    #[test]
    fn test_child_depth_limit() {
        assert_eq!(child_depth(0).unwrap(), 1);
        assert_eq!(child_depth(MAX_DEPTH - 1).unwrap(), MAX_DEPTH);
        assert!(matches!(
            child_depth(MAX_DEPTH),
            Err(ApiError::DepthLimitExceeded)
        ));
    }

    #[test]
    fn test_extract_mention_handles() {
        let handles = extract_mention_handles("hey @alice and @bob_99, cc @alice!");
        assert_eq!(handles, vec!["alice".to_string(), "bob_99".to_string()]);
    }

    #[test]
    fn test_extract_mention_handles_ignores_short_tokens() {
        assert!(extract_mention_handles("mail me @ home").is_empty());
    }

    #[test]
    fn test_push_edit_history_caps_at_five() {
        let mut history = Vec::new();
        let now = Utc::now();
        for i in 0..7 {
            push_edit_history(&mut history, format!("rev {}", i), now);
        }
        assert_eq!(history.len(), MAX_EDIT_HISTORY);
        assert_eq!(history[0].previous_content, "rev 2");
        assert_eq!(history[4].previous_content, "rev 6");
    }

    #[test]
    fn test_json_column_round_trip() {
        let media = vec![image("https://cdn/a.png")];
        let raw = serde_json::to_string(&media).unwrap();
        assert_eq!(parse_media_json(Some(&raw)), media);
        assert!(parse_media_json(None).is_empty());
        assert!(parse_media_json(Some("not json")).is_empty());
    }

    #[test]
    fn test_report_entry_wire_shape() {
        let entry = ReportEntry {
            user_id: 3,
            reason: "spam".to_string(),
            reported_at: Utc::now(),
        };
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"userId\":3"));
        assert!(json.contains("\"reportedAt\""));
    }
}
