use crate::cache::{KeySpace, LedgerOp, SortedSetBackend};
use crate::config::VoteConfig;
use crate::error::{ForumError, ForumResult};
use crate::observability::ForumMetrics;
use crate::types::{PageRequest, PostOrder, VoteDirection, VoteState};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Lifetime of a community's derived ordering; listings may lag by this much
const COMMUNITY_ORDER_TTL: Duration = Duration::from_secs(60);

/// Vote state, post scores and the time/score/community indexes.
///
/// Scores only move by the diff between a user's previous and new vote, and
/// every score change is applied atomically with the vote record.
pub struct VoteLedger {
    backend: Arc<dyn SortedSetBackend>,
    keys: KeySpace,
    window_secs: i64,
    weight: f64,
    metrics: Option<ForumMetrics>,
}

impl VoteLedger {
    pub fn new(
        backend: Arc<dyn SortedSetBackend>,
        keys: KeySpace,
        config: &VoteConfig,
        metrics: Option<ForumMetrics>,
    ) -> Self {
        Self {
            backend,
            keys,
            window_secs: config.window_secs,
            weight: config.weight,
            metrics,
        }
    }

    /// Register a post created now
    pub async fn post_created(&self, post_id: i64, community_id: i64) -> ForumResult<()> {
        self.register_post(post_id, community_id, Utc::now()).await
    }

    /// Record creation time, a zero score and community membership in one unit
    pub async fn register_post(
        &self,
        post_id: i64,
        community_id: i64,
        created_at: DateTime<Utc>,
    ) -> ForumResult<()> {
        let member = post_id.to_string();
        self.backend
            .exec_atomic(vec![
                LedgerOp::SetScore {
                    key: self.keys.post_time(),
                    member: member.clone(),
                    score: created_at.timestamp() as f64,
                },
                LedgerOp::SetScore {
                    key: self.keys.post_score(),
                    member: member.clone(),
                    score: 0.0,
                },
                LedgerOp::AddToSet {
                    key: self.keys.community_posts(community_id),
                    member,
                },
            ])
            .await?;

        debug!(post_id, community_id, "Post registered in vote ledger");
        Ok(())
    }

    pub async fn submit_vote(&self, user_id: i64, post_id: i64, direction: VoteDirection) -> ForumResult<()> {
        self.submit_vote_at(user_id, post_id, direction, Utc::now()).await
    }

    /// Apply a vote as of `now`
    pub async fn submit_vote_at(
        &self,
        user_id: i64,
        post_id: i64,
        direction: VoteDirection,
        now: DateTime<Utc>,
    ) -> ForumResult<()> {
        let result = self.apply_vote(user_id, post_id, direction, now).await;

        let outcome = match &result {
            Ok(()) => "accepted",
            Err(ForumError::VoteTimeExpired) => "expired",
            Err(ForumError::VoteRepeated) => "repeated",
            Err(ForumError::NotFound(_)) => "not_found",
            Err(_) => "error",
        };
        if let Some(metrics) = &self.metrics {
            metrics.votes_total.with_label_values(&[outcome]).inc();
        }
        if let Err(e) = &result {
            if e.is_business_rule_violation() {
                debug!(user_id, post_id, "Vote rejected: {}", e);
            } else {
                warn!(user_id, post_id, error_type = e.error_type(), "Vote failed: {}", e);
            }
        }

        result
    }

    async fn apply_vote(
        &self,
        user_id: i64,
        post_id: i64,
        direction: VoteDirection,
        now: DateTime<Utc>,
    ) -> ForumResult<()> {
        let post_member = post_id.to_string();
        let user_member = user_id.to_string();

        let created = self
            .backend
            .zscore(&self.keys.post_time(), &post_member)
            .await?
            .ok_or_else(|| ForumError::NotFound(format!("Post {} has no vote record", post_id)))?;
        if now.timestamp() as f64 - created > self.window_secs as f64 {
            return Err(ForumError::VoteTimeExpired);
        }

        let voted_key = self.keys.post_voted(post_id);
        let current = VoteState::from_record(self.backend.zscore(&voted_key, &user_member).await?);
        let target = VoteState::from(direction);
        if current == target {
            return Err(ForumError::VoteRepeated);
        }

        let diff = (target.value() - current.value()) * self.weight;
        let record = match target {
            VoteState::NoVote => LedgerOp::RemoveMember {
                key: voted_key,
                member: user_member,
            },
            _ => LedgerOp::SetScore {
                key: voted_key,
                member: user_member,
                score: target.value(),
            },
        };

        self.backend
            .exec_atomic(vec![
                LedgerOp::IncrementScore {
                    key: self.keys.post_score(),
                    member: post_member,
                    delta: diff,
                },
                record,
            ])
            .await?;

        info!(user_id, post_id, ?current, ?target, diff, "Vote applied");
        Ok(())
    }

    /// The user's current vote on a post
    pub async fn vote_state(&self, user_id: i64, post_id: i64) -> ForumResult<VoteState> {
        let record = self
            .backend
            .zscore(&self.keys.post_voted(post_id), &user_id.to_string())
            .await?;
        Ok(VoteState::from_record(record))
    }

    /// Aggregate score; unknown posts score 0
    pub async fn score(&self, post_id: i64) -> ForumResult<f64> {
        Ok(self
            .backend
            .zscore(&self.keys.post_score(), &post_id.to_string())
            .await?
            .unwrap_or(0.0))
    }

    /// Scores for many posts in one round trip
    pub async fn scores(&self, post_ids: &[i64]) -> ForumResult<HashMap<i64, f64>> {
        let members: Vec<String> = post_ids.iter().map(i64::to_string).collect();
        let scores = self.backend.zmscore(&self.keys.post_score(), &members).await?;
        Ok(post_ids
            .iter()
            .copied()
            .zip(scores.into_iter().chain(std::iter::repeat(None)))
            .map(|(id, score)| (id, score.unwrap_or(0.0)))
            .collect())
    }

    /// One page of post ids, newest or highest scored first; `page` starts at 1
    pub async fn post_ids_in_order(&self, order: PostOrder, page: i64, size: i64) -> ForumResult<Vec<i64>> {
        let page = PageRequest::new(page, size)?;
        self.ids_in_range(&self.order_key(order), page).await
    }

    /// One page of a community's post ids in the requested order
    pub async fn community_post_ids_in_order(
        &self,
        community_id: i64,
        order: PostOrder,
        page: i64,
        size: i64,
    ) -> ForumResult<Vec<i64>> {
        let page = PageRequest::new(page, size)?;
        let order_key = self.order_key(order);
        let key = self.keys.community_order(&order_key, community_id);

        if !self.backend.exists(&key).await? {
            self.backend
                .intersect_into(
                    &key,
                    &order_key,
                    &self.keys.community_posts(community_id),
                    COMMUNITY_ORDER_TTL,
                )
                .await?;
            debug!(community_id, ?order, "Community ordering rebuilt");
        }

        self.ids_in_range(&key, page).await
    }

    fn order_key(&self, order: PostOrder) -> String {
        match order {
            PostOrder::Time => self.keys.post_time(),
            PostOrder::Score => self.keys.post_score(),
        }
    }

    async fn ids_in_range(&self, key: &str, page: PageRequest) -> ForumResult<Vec<i64>> {
        let members = self.backend.zrevrange(key, page.offset(), page.last()).await?;

        Ok(members
            .into_iter()
            .filter_map(|member| match member.parse() {
                Ok(id) => Some(id),
                Err(_) => {
                    warn!(key = %key, member = %member, "Skipping non-numeric ledger member");
                    None
                }
            })
            .collect())
    }
}
