//! Pluggable analytics over post batches.
//!
//! The scorers are pure functions behind traits: swapping, mocking, or
//! parallelizing them must never change how the scheduler behaves. The
//! defaults are deliberately small; they exist so every persisted post
//! carries usable derived signals out of the box.

use snooscope_core::Post;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Scores one post's sentiment in `[-1, 1]`.
pub trait SentimentScorer: Send + Sync {
    fn score(&self, post: &Post) -> f64;
}

/// Scores one post's viral potential in `[0, 1]`.
pub trait ViralScorer: Send + Sync {
    fn score(&self, post: &Post) -> f64;
}

/// Summarizes a post set into trend signals.
pub trait TrendAnalyzer: Send + Sync {
    fn summarize(&self, posts: &[Post]) -> TrendSummary;
}

/// Output of a [`TrendAnalyzer`] pass.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct TrendSummary {
    /// Most frequent title terms, descending.
    pub top_terms: Vec<(String, usize)>,
    pub posts_per_subreddit: BTreeMap<String, usize>,
}

/// The scorer set a session runs with.
#[derive(Clone)]
pub struct Analytics {
    pub sentiment: Arc<dyn SentimentScorer>,
    pub viral: Arc<dyn ViralScorer>,
    pub trends: Arc<dyn TrendAnalyzer>,
}

impl Default for Analytics {
    fn default() -> Self {
        Self {
            sentiment: Arc::new(LexiconSentiment::default()),
            viral: Arc::new(HeuristicViral),
            trends: Arc::new(TermFrequencyTrends::default()),
        }
    }
}

impl Analytics {
    /// Fills the derived analytics fields on a batch, in place.
    pub fn apply(&self, posts: &mut [Post]) {
        for post in posts.iter_mut() {
            post.sentiment_score = Some(self.sentiment.score(post));
            post.viral_potential = Some(self.viral.score(post));
        }
    }
}

/// Signed-lexicon sentiment over title and selftext.
pub struct LexiconSentiment {
    positive: Vec<&'static str>,
    negative: Vec<&'static str>,
}

impl Default for LexiconSentiment {
    fn default() -> Self {
        Self {
            positive: vec![
                "great", "good", "love", "awesome", "amazing", "excellent", "best", "happy",
                "win", "success", "beautiful", "fast", "improved", "fixed",
            ],
            negative: vec![
                "bad", "hate", "terrible", "awful", "worst", "broken", "fail", "bug", "slow",
                "angry", "sad", "problem", "crash", "scam",
            ],
        }
    }
}

impl SentimentScorer for LexiconSentiment {
    fn score(&self, post: &Post) -> f64 {
        let text = format!("{} {}", post.title, post.selftext).to_lowercase();
        let mut hits = 0i64;
        let mut total = 0i64;
        for word in text.split(|c: char| !c.is_alphanumeric()) {
            if word.is_empty() {
                continue;
            }
            if self.positive.contains(&word) {
                hits += 1;
                total += 1;
            } else if self.negative.contains(&word) {
                hits -= 1;
                total += 1;
            }
        }
        if total == 0 {
            0.0
        } else {
            (hits as f64 / total as f64).clamp(-1.0, 1.0)
        }
    }
}

/// Blend of score velocity, engagement, and vote quality.
pub struct HeuristicViral;

impl ViralScorer for HeuristicViral {
    fn score(&self, post: &Post) -> f64 {
        let age_hours = ((chrono::Utc::now().timestamp() - post.created_utc).max(60) as f64)
            / 3600.0;
        // points per hour, saturating at 500/h
        let velocity = ((post.score.max(0) as f64 / age_hours) / 500.0).min(1.0);
        let engagement = (post.engagement_ratio / 2.0).min(1.0);
        let quality = post.upvote_ratio.clamp(0.0, 1.0);
        (0.5 * velocity + 0.3 * engagement + 0.2 * quality).clamp(0.0, 1.0)
    }
}

/// Title-term frequency plus per-subreddit volume.
pub struct TermFrequencyTrends {
    pub top_n: usize,
    stopwords: Vec<&'static str>,
}

impl Default for TermFrequencyTrends {
    fn default() -> Self {
        Self {
            top_n: 10,
            stopwords: vec![
                "the", "a", "an", "and", "or", "of", "to", "in", "on", "for", "with", "is",
                "are", "was", "this", "that", "my", "your", "how", "what", "why", "it", "its",
            ],
        }
    }
}

impl TrendAnalyzer for TermFrequencyTrends {
    fn summarize(&self, posts: &[Post]) -> TrendSummary {
        let mut terms: BTreeMap<String, usize> = BTreeMap::new();
        let mut per_subreddit: BTreeMap<String, usize> = BTreeMap::new();
        for post in posts {
            *per_subreddit.entry(post.subreddit.clone()).or_default() += 1;
            for word in post
                .title
                .to_lowercase()
                .split(|c: char| !c.is_alphanumeric())
            {
                if word.len() < 3 || self.stopwords.contains(&word) {
                    continue;
                }
                *terms.entry(word.to_string()).or_default() += 1;
            }
        }
        let mut top_terms: Vec<(String, usize)> = terms.into_iter().collect();
        top_terms.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        top_terms.truncate(self.top_n);
        TrendSummary {
            top_terms,
            posts_per_subreddit: per_subreddit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use snooscope_core::ContentType;

    fn post(title: &str, selftext: &str, score: i64, comments: i64) -> Post {
        let mut p = Post {
            id: "x".into(),
            title: title.into(),
            author: Some("a".into()),
            subreddit: "rust".into(),
            score,
            upvote_ratio: 0.9,
            num_comments: comments,
            created_utc: Utc::now().timestamp() - 3600,
            url: String::new(),
            permalink: String::new(),
            selftext: selftext.into(),
            link_url: None,
            flair: None,
            is_nsfw: false,
            is_spoiler: false,
            is_self: true,
            domain: "self.rust".into(),
            content_type: ContentType::Text,
            scraped_at: Utc::now(),
            category: String::new(),
            engagement_ratio: 0.0,
            sentiment_score: None,
            viral_potential: None,
            link_preview: None,
        };
        p.refresh_derived();
        p
    }

    #[test]
    fn lexicon_scores_signed_and_bounded() {
        let scorer = LexiconSentiment::default();
        assert!(scorer.score(&post("this is great, love it", "", 1, 0)) > 0.0);
        assert!(scorer.score(&post("terrible broken bug", "", 1, 0)) < 0.0);
        assert_eq!(scorer.score(&post("neutral statement", "", 1, 0)), 0.0);
        let s = scorer.score(&post("great great great", "love love", 1, 0));
        assert!(s <= 1.0);
    }

    #[test]
    fn viral_score_is_bounded_and_monotone_in_score() {
        let scorer = HeuristicViral;
        let low = scorer.score(&post("t", "", 5, 1));
        let high = scorer.score(&post("t", "", 5000, 1));
        assert!((0.0..=1.0).contains(&low));
        assert!((0.0..=1.0).contains(&high));
        assert!(high >= low);
    }

    #[test]
    fn trends_count_terms_and_subreddits() {
        let trends = TermFrequencyTrends::default();
        let posts = vec![
            post("tokio runtime question", "", 1, 0),
            post("tokio scheduler internals", "", 1, 0),
        ];
        let summary = trends.summarize(&posts);
        assert_eq!(summary.top_terms[0].0, "tokio");
        assert_eq!(summary.top_terms[0].1, 2);
        assert_eq!(summary.posts_per_subreddit.get("rust"), Some(&2));
    }

    #[test]
    fn apply_fills_both_scores() {
        let analytics = Analytics::default();
        let mut posts = vec![post("great news", "", 10, 2)];
        analytics.apply(&mut posts);
        assert!(posts[0].sentiment_score.is_some());
        assert!(posts[0].viral_potential.is_some());
    }

    #[test]
    fn swapped_scorers_are_honored() {
        struct Fixed;
        impl SentimentScorer for Fixed {
            fn score(&self, _post: &Post) -> f64 {
                0.42
            }
        }
        let analytics = Analytics {
            sentiment: Arc::new(Fixed),
            ..Analytics::default()
        };
        let mut posts = vec![post("whatever", "", 1, 0)];
        analytics.apply(&mut posts);
        assert_eq!(posts[0].sentiment_score, Some(0.42));
    }
}
