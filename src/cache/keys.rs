/// Key scheme shared by every process using the same prefix
#[derive(Debug, Clone)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self { prefix: prefix.into() }
    }

    /// `{prefix}:cache:{kind}:{id}`
    pub fn entity(&self, kind: &str, id: i64) -> String {
        format!("{}:cache:{}:{}", self.prefix, kind, id)
    }

    /// `{prefix}:cache:lock:{kind}:{id}`
    pub fn lock(&self, kind: &str, id: i64) -> String {
        format!("{}:cache:lock:{}:{}", self.prefix, kind, id)
    }

    /// Sorted set of post id by creation time
    pub fn post_time(&self) -> String {
        format!("{}:post:time", self.prefix)
    }

    /// Sorted set of post id by score
    pub fn post_score(&self) -> String {
        format!("{}:post:score", self.prefix)
    }

    /// Sorted set of user id by vote value for one post
    pub fn post_voted(&self, post_id: i64) -> String {
        format!("{}:post:voted:{}", self.prefix, post_id)
    }

    /// Set of post ids in one community
    pub fn community_posts(&self, community_id: i64) -> String {
        format!("{}:community:{}", self.prefix, community_id)
    }

    /// Short-lived copy of an ordering key restricted to one community
    pub fn community_order(&self, order_key: &str, community_id: i64) -> String {
        format!("{}:community:{}", order_key, community_id)
    }
}
