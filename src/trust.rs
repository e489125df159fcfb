//! Trust rating recalculation against the external scoring service.
//!
//! The scorer is behind a trait so handlers stay testable without the
//! service; recalculation after lifecycle events is best effort and never
//! fails the triggering request.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::models::{Id, PartyRole, Review, User};
use crate::repo::Repo;

/// Multiplier applied to the freshly computed score when the user initiated
/// the cancellation that triggered the recalculation.
pub const CANCEL_PENALTY: f64 = 0.9;

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TrustFeatures {
    pub portfolio_count: usize,
    pub average_rating: f64,
    pub completed_bookings: i64,
    pub client_cancellations: i64,
    pub resolver_cancellations: i64,
    pub positive_reviews: usize,
    pub neutral_reviews: usize,
    pub negative_reviews: usize,
    pub bio_length: usize,
    pub bio_word_count: usize,
}

impl TrustFeatures {
    pub fn gather(user: &User, reviews: &[Review], portfolio_count: usize) -> Self {
        let positive = reviews.iter().filter(|r| r.rating >= 4).count();
        let neutral = reviews.iter().filter(|r| r.rating == 3).count();
        let negative = reviews.iter().filter(|r| r.rating <= 2).count();
        let average = if reviews.is_empty() {
            0.0
        } else {
            reviews.iter().map(|r| r.rating as f64).sum::<f64>() / reviews.len() as f64
        };
        let bio = user.bio.as_str();
        TrustFeatures {
            portfolio_count,
            average_rating: average,
            completed_bookings: user.completed_bookings,
            client_cancellations: user.client_cancellations,
            resolver_cancellations: user.resolver_cancellations,
            positive_reviews: positive,
            neutral_reviews: neutral,
            negative_reviews: negative,
            bio_length: bio.len(),
            bio_word_count: bio.split_whitespace().count(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PredictResponse {
    success: bool,
    #[serde(default)]
    trust_rating: f64,
}

#[async_trait]
pub trait TrustScorer: Send + Sync {
    async fn score(&self, features: &TrustFeatures) -> Result<f64, String>;
}

/// Scorer backed by the ML service's `/predict` endpoint.
pub struct HttpTrustScorer {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTrustScorer {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl TrustScorer for HttpTrustScorer {
    async fn score(&self, features: &TrustFeatures) -> Result<f64, String> {
        let url = format!("{}/predict", self.base_url.trim_end_matches('/'));
        let resp = self
            .client
            .post(&url)
            .json(features)
            .send()
            .await
            .map_err(|e| format!("ML service unavailable: {e}"))?;
        if !resp.status().is_success() {
            return Err(format!("ML service unavailable: HTTP {}", resp.status()));
        }
        let body: PredictResponse = resp
            .json()
            .await
            .map_err(|e| format!("ML service unavailable: {e}"))?;
        if !body.success {
            return Err("ML service unavailable: prediction rejected".into());
        }
        Ok(body.trust_rating)
    }
}

/// Scorer used when TRUST_SERVICE_URL is unset: leaves ratings alone.
pub struct NoopScorer;

#[async_trait]
impl TrustScorer for NoopScorer {
    async fn score(&self, _features: &TrustFeatures) -> Result<f64, String> {
        Err("trust scoring disabled".into())
    }
}

/// Recompute and persist `user_id`'s trust rating. `canceled_as` applies the
/// cancellation penalty when the user initiated a cancellation. Failures are
/// logged and swallowed; the caller's request has already succeeded.
pub async fn recalculate(
    repo: &dyn Repo,
    scorer: &dyn TrustScorer,
    user_id: Id,
    canceled_as: Option<PartyRole>,
) {
    let result = async {
        let user = repo.get_user(user_id).await.map_err(|e| e.to_string())?;
        let reviews = repo
            .list_reviews_for_user(user_id)
            .await
            .map_err(|e| e.to_string())?;
        let portfolios = repo
            .list_portfolios_by_user(user_id)
            .await
            .map_err(|e| e.to_string())?;
        let features = TrustFeatures::gather(&user, &reviews, portfolios.len());
        let mut score = scorer.score(&features).await?;
        if canceled_as.is_some() {
            score *= CANCEL_PENALTY;
        }
        let score = score.clamp(0.0, 5.0);
        repo.set_trust_rating(user_id, score)
            .await
            .map_err(|e| e.to_string())?;
        Ok::<f64, String>(score)
    }
    .await;
    match result {
        Ok(score) => {
            tracing::debug!(user_id, score, "trust rating updated");
        }
        Err(err) => {
            warn!(user_id, %err, "trust rating recalculation skipped");
        }
    }
}
