use serde::{Deserialize, Serialize};
use chrono::{DateTime, Utc};
use crate::error::{ForumError, ForumResult};

/// Anything keyed by a 64-bit id and stored under its own cache namespace
pub trait Entity {
    /// Entity segment of cache keys and metric labels
    const KIND: &'static str;

    fn entity_id(&self) -> i64;
}

/// Persisted post row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Post {
    /// Snowflake-style unique id
    pub id: i64,
    pub title: String,
    pub content: String,
    pub author_id: i64,
    pub community_id: i64,
    pub status: i32,
    pub create_time: DateTime<Utc>,
}

/// Persisted user row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    /// Never serialized, so cached copies cannot carry it
    #[serde(skip_serializing, default)]
    pub password_hash: String,
}

/// Community summary used in listings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Community {
    pub id: i64,
    pub name: String,
}

/// Full community row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommunityDetail {
    pub id: i64,
    pub name: String,
    pub introduction: String,
    pub create_time: DateTime<Utc>,
}

/// Post composed with its author, community and current score
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostDetail {
    pub author_name: String,
    pub vote_score: f64,
    #[serde(flatten)]
    pub post: Post,
    pub community: CommunityDetail,
}

/// Input for creating a post; the id is assigned on insert
#[derive(Debug, Clone)]
pub struct NewPost {
    pub title: String,
    pub content: String,
    pub author_id: i64,
    pub community_id: i64,
}

impl Entity for Post {
    const KIND: &'static str = "post_row";

    fn entity_id(&self) -> i64 {
        self.id
    }
}

impl Entity for User {
    const KIND: &'static str = "user";

    fn entity_id(&self) -> i64 {
        self.id
    }
}

impl Entity for CommunityDetail {
    const KIND: &'static str = "community";

    fn entity_id(&self) -> i64 {
        self.id
    }
}

impl Entity for PostDetail {
    const KIND: &'static str = "post";

    fn entity_id(&self) -> i64 {
        self.post.id
    }
}

impl PostDetail {
    pub fn compose(post: Post, author: &User, community: CommunityDetail, vote_score: f64) -> Self {
        PostDetail {
            author_name: author.username.clone(),
            vote_score,
            post,
            community,
        }
    }
}

/// Requested vote direction; `Cancel` withdraws a previous vote
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteDirection {
    Up,
    Cancel,
    Down,
}

impl VoteDirection {
    /// Value stored in the per-post vote record
    pub fn value(self) -> f64 {
        match self {
            VoteDirection::Up => 1.0,
            VoteDirection::Cancel => 0.0,
            VoteDirection::Down => -1.0,
        }
    }
}

impl TryFrom<i8> for VoteDirection {
    type Error = ForumError;

    fn try_from(value: i8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(VoteDirection::Up),
            0 => Ok(VoteDirection::Cancel),
            -1 => Ok(VoteDirection::Down),
            other => Err(ForumError::InvalidRequest(format!("Invalid vote direction: {}", other))),
        }
    }
}

/// Per (post, user) vote state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteState {
    NoVote,
    Upvoted,
    Downvoted,
}

impl VoteState {
    /// Decode the stored record; absence means no vote
    pub fn from_record(record: Option<f64>) -> Self {
        match record {
            Some(v) if v > 0.0 => VoteState::Upvoted,
            Some(v) if v < 0.0 => VoteState::Downvoted,
            _ => VoteState::NoVote,
        }
    }

    pub fn value(self) -> f64 {
        match self {
            VoteState::NoVote => 0.0,
            VoteState::Upvoted => 1.0,
            VoteState::Downvoted => -1.0,
        }
    }
}

impl From<VoteDirection> for VoteState {
    fn from(direction: VoteDirection) -> Self {
        match direction {
            VoteDirection::Up => VoteState::Upvoted,
            VoteDirection::Cancel => VoteState::NoVote,
            VoteDirection::Down => VoteState::Downvoted,
        }
    }
}

/// Ordering for ledger-driven listings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostOrder {
    /// Newest first
    Time,
    /// Highest score first
    Score,
}

impl std::str::FromStr for PostOrder {
    type Err = ForumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "time" => Ok(PostOrder::Time),
            "score" => Ok(PostOrder::Score),
            other => Err(ForumError::InvalidRequest(format!("Unknown order: {}", other))),
        }
    }
}

/// Largest page any listing serves
pub const MAX_PAGE_SIZE: i64 = 100;

/// A 1-based page whose row bounds are known to fit in `i64`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub page: i64,
    pub size: i64,
    offset: i64,
    last: i64,
}

impl PageRequest {
    pub fn new(page: i64, size: i64) -> ForumResult<Self> {
        if page < 1 || !(1..=MAX_PAGE_SIZE).contains(&size) {
            return Err(ForumError::InvalidRequest(format!(
                "Invalid page {} or size {} (size must be 1..={})",
                page, size, MAX_PAGE_SIZE
            )));
        }

        let offset = (page - 1).checked_mul(size);
        match offset.and_then(|offset| offset.checked_add(size - 1).map(|last| (offset, last))) {
            Some((offset, last)) => Ok(Self { page, size, offset, last }),
            None => Err(ForumError::InvalidRequest(format!("Page {} is out of range", page))),
        }
    }

    /// Rows skipped before this page
    pub fn offset(&self) -> i64 {
        self.offset
    }

    /// Index of the page's last row, inclusive
    pub fn last(&self) -> i64 {
        self.last
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_serialization_drops_password_hash() {
        let user = User {
            id: 7,
            username: "alice".to_string(),
            password_hash: "5f4dcc3b5aa765d61d8327deb882cf99".to_string(),
        };

        let json = serde_json::to_string(&user).unwrap();
        assert!(!json.contains("password"));
        assert!(!json.contains("5f4dcc3b"));

        let restored: User = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.username, "alice");
        assert!(restored.password_hash.is_empty());
    }

    #[test]
    fn test_post_detail_flattens_post_fields() {
        let now = Utc::now();
        let detail = PostDetail {
            author_name: "alice".to_string(),
            vote_score: 432.0,
            post: Post {
                id: 1,
                title: "hello".to_string(),
                content: "world".to_string(),
                author_id: 7,
                community_id: 3,
                status: 1,
                create_time: now,
            },
            community: CommunityDetail {
                id: 3,
                name: "rust".to_string(),
                introduction: "systems".to_string(),
                create_time: now,
            },
        };

        let value = serde_json::to_value(&detail).unwrap();
        assert_eq!(value["title"], "hello");
        assert_eq!(value["community"]["name"], "rust");

        let restored: PostDetail = serde_json::from_value(value).unwrap();
        assert_eq!(restored, detail);
    }

    #[test]
    fn test_vote_direction_parsing() {
        assert_eq!(VoteDirection::try_from(1).unwrap(), VoteDirection::Up);
        assert_eq!(VoteDirection::try_from(0).unwrap(), VoteDirection::Cancel);
        assert_eq!(VoteDirection::try_from(-1).unwrap(), VoteDirection::Down);
        assert!(VoteDirection::try_from(2).is_err());
    }

    #[test]
    fn test_page_request_bounds() {
        let page = PageRequest::new(3, 10).unwrap();
        assert_eq!((page.offset(), page.last()), (20, 29));

        assert!(matches!(PageRequest::new(0, 10), Err(ForumError::InvalidRequest(_))));
        assert!(matches!(PageRequest::new(1, 0), Err(ForumError::InvalidRequest(_))));
        assert!(matches!(PageRequest::new(1, MAX_PAGE_SIZE + 1), Err(ForumError::InvalidRequest(_))));
    }

    #[test]
    fn test_page_request_rejects_overflowing_offset() {
        assert!(matches!(PageRequest::new(i64::MAX / 2, 10), Err(ForumError::InvalidRequest(_))));
        assert!(matches!(PageRequest::new(i64::MAX, MAX_PAGE_SIZE), Err(ForumError::InvalidRequest(_))));
    }

    #[test]
    fn test_vote_state_from_record() {
        assert_eq!(VoteState::from_record(None), VoteState::NoVote);
        assert_eq!(VoteState::from_record(Some(1.0)), VoteState::Upvoted);
        assert_eq!(VoteState::from_record(Some(-1.0)), VoteState::Downvoted);
    }
}
