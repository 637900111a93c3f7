use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

pub const TARGET_POST: &str = "post";
pub const TARGET_COMMENT: &str = "comment";

pub const REACTION_KINDS: [&str; 8] = [
    "like",
    "love",
    "laugh",
    "wow",
    "sad",
    "angry",
    "celebrate",
    "support",
];

pub fn is_valid_reaction_kind(kind: &str) -> bool {
    REACTION_KINDS.contains(&kind)
}

pub fn is_valid_target_kind(kind: &str) -> bool {
    matches!(kind, TARGET_POST | TARGET_COMMENT)
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Reaction {
    pub id: i64,
    pub user_id: i64,
    pub target_kind: String,
    pub target_id: i64,
    pub kind: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct ReactionRequest {
    pub target_kind: String,
    pub target_id: i64,
    pub kind: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ReactionTargetQuery {
    pub target_kind: String,
    pub target_id: i64,
}

#[derive(Debug, Deserialize)]
pub struct BulkStatusRequest {
    pub target_kind: String,
    pub target_ids: Vec<i64>,
}

#[derive(Debug, Serialize)]
pub struct ReactionBreakdownEntry {
    pub kind: String,
    pub count: i64,
    pub percentage: f64,
}

#[derive(Debug, Serialize)]
pub struct ReactionStats {
    pub total: i64,
    pub breakdown: Vec<ReactionBreakdownEntry>,
    pub has_reactions: bool,
}

/// Aggregates per-kind counts into the stats payload. Percentages are
/// rounded to one decimal place; entries come out ordered by count.
pub fn build_stats(counts: Vec<(String, i64)>) -> ReactionStats {
    let total: i64 = counts.iter().map(|(_, count)| count).sum();

    let mut breakdown: Vec<ReactionBreakdownEntry> = counts
        .into_iter()
        .filter(|(_, count)| *count > 0)
        .map(|(kind, count)| ReactionBreakdownEntry {
            kind,
            count,
            percentage: if total > 0 {
                (count as f64 * 1000.0 / total as f64).round() / 10.0
            } else {
                0.0
            },
        })
        .collect();
    breakdown.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.kind.cmp(&b.kind)));

    ReactionStats {
        total,
        has_reactions: total > 0,
        breakdown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reaction_kind_validation() {
        assert!(is_valid_reaction_kind("love"));
        assert!(is_valid_reaction_kind("celebrate"));
        assert!(!is_valid_reaction_kind("dislike"));
        assert!(!is_valid_reaction_kind(""));
    }

    #[test]
    fn test_build_stats_empty() {
        let stats = build_stats(vec![]);
        assert_eq!(stats.total, 0);
        assert!(!stats.has_reactions);
        assert!(stats.breakdown.is_empty());
    }

    #[test]
    fn test_build_stats_single_kind_is_full_share() {
        let stats = build_stats(vec![("love".to_string(), 1)]);
        assert_eq!(stats.total, 1);
        assert!(stats.has_reactions);
        assert_eq!(stats.breakdown.len(), 1);
        assert_eq!(stats.breakdown[0].kind, "love");
        assert_eq!(stats.breakdown[0].percentage, 100.0);
    }

    #[test]
    fn test_build_stats_ordering_and_rounding() {
        let stats = build_stats(vec![
            ("like".to_string(), 1),
            ("wow".to_string(), 2),
            ("sad".to_string(), 0),
        ]);
        assert_eq!(stats.total, 3);
        assert_eq!(stats.breakdown.len(), 2);
        assert_eq!(stats.breakdown[0].kind, "wow");
        assert_eq!(stats.breakdown[0].percentage, 66.7);
        assert_eq!(stats.breakdown[1].kind, "like");
        assert_eq!(stats.breakdown[1].percentage, 33.3);
    }
}
