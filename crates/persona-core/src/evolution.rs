//! # Evolution Tracker
//!
//! Updates a profile's usage statistics after each use and ranks its topics.
//!
//! ## Scoring
//!
//! ```text
//! score = 0.4 * (count / maxCountInProfile)
//!       + 0.6 * 1 / (1 + daysSinceLastUsed * 0.1)
//! ```
//!
//! Recency outweighs frequency. The same score drives both ranking
//! ([`EvolutionTracker::top_k_topics`]) and eviction once a profile holds more than
//! `topic_cap` topics.
//!
//! Evolution is a side effect of some other primary operation, so
//! [`EvolutionTracker::evolve`] never fails: unknown ids are ignored and persistence
//! failures are logged.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use crate::profile::{EvolvingProfile, Profile, ProfileStore, Topic};
use crate::types::{now, Timestamp};

/// Default maximum number of tracked topics per profile
pub const DEFAULT_TOPIC_CAP: usize = 10;

/// Default length of the stored last prompt, in characters
pub const DEFAULT_PROMPT_MAX_CHARS: usize = 200;

const FREQUENCY_WEIGHT: f64 = 0.4;
const RECENCY_WEIGHT: f64 = 0.6;
const RECENCY_DECAY_PER_DAY: f64 = 0.1;
const MILLIS_PER_DAY: f64 = 86_400_000.0;

const STOP_WORDS: &[&str] = &[
    "the", "and", "for", "with", "that", "this", "from", "have", "has", "are", "was", "were",
    "you", "your", "our", "but", "not", "can", "could", "should", "would", "will", "about",
    "into", "over", "than", "then", "them", "they", "their", "there", "what", "when", "where",
    "which", "who", "why", "how", "all", "any", "some", "more", "most", "very", "just", "also",
    "make", "please", "write", "rewrite", "text", "using", "use", "its", "it's", "been", "being",
    "each", "other", "like", "want", "need",
];

/// Tracker limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvolutionSettings {
    /// Maximum number of topics kept per profile
    pub topic_cap: usize,

    /// Characters of the last prompt kept on the profile
    pub prompt_max_chars: usize,
}

impl Default for EvolutionSettings {
    fn default() -> Self {
        Self {
            topic_cap: DEFAULT_TOPIC_CAP,
            prompt_max_chars: DEFAULT_PROMPT_MAX_CHARS,
        }
    }
}

/// A topic together with its current score
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredTopic {
    pub topic: Topic,
    pub score: f64,
}

/// Fractional days between `then` and `now`, never negative
fn days_since(then: Timestamp, now: Timestamp) -> f64 {
    ((now - then).num_milliseconds() as f64 / MILLIS_PER_DAY).max(0.0)
}

/// Blend of relative frequency and recency in `[0, 1]`
pub fn topic_score(topic: &Topic, max_count: u64, now: Timestamp) -> f64 {
    let frequency = if max_count == 0 {
        0.0
    } else {
        topic.count as f64 / max_count as f64
    };
    let recency = 1.0 / (1.0 + days_since(topic.last_used, now) * RECENCY_DECAY_PER_DAY);
    FREQUENCY_WEIGHT * frequency + RECENCY_WEIGHT * recency
}

/// All topics, highest score first (ties by name)
pub fn rank_topics(evolving: &EvolvingProfile, now: Timestamp) -> Vec<ScoredTopic> {
    let max_count = evolving.max_topic_count();
    let mut ranked: Vec<ScoredTopic> = evolving
        .topics
        .iter()
        .map(|topic| ScoredTopic {
            score: topic_score(topic, max_count, now),
            topic: topic.clone(),
        })
        .collect();
    ranked.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.topic.name.cmp(&b.topic.name))
    });
    ranked
}

/// Index of the entry to evict: lowest score, then oldest, then first by name
fn eviction_candidate(evolving: &EvolvingProfile, now: Timestamp) -> Option<usize> {
    let max_count = evolving.max_topic_count();
    evolving
        .topics
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| {
            topic_score(a, max_count, now)
                .total_cmp(&topic_score(b, max_count, now))
                .then_with(|| a.last_used.cmp(&b.last_used))
                .then_with(|| a.name.cmp(&b.name))
        })
        .map(|(index, _)| index)
}

/// Truncate to at most `max` characters on a char boundary
pub fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((byte_index, _)) => text[..byte_index].to_string(),
        None => text.to_string(),
    }
}

/// Evict lowest-scoring topics until at most `cap` remain
pub fn enforce_topic_cap(evolving: &mut EvolvingProfile, cap: usize, now: Timestamp) {
    while evolving.topics.len() > cap {
        match eviction_candidate(evolving, now) {
            Some(index) => {
                evolving.topics.remove(index);
            }
            None => break,
        }
    }
}

/// Record one use of a profile. Pure; the tracker wraps this in a store mutation.
///
/// Counters saturate at `u64::MAX`, so a peer document carrying huge values can never
/// make them wrap.
pub fn record_usage<S: AsRef<str>>(
    evolving: &mut EvolvingProfile,
    prompt: &str,
    topics: &[S],
    settings: &EvolutionSettings,
    now: Timestamp,
) {
    // Hand-edited store files may carry unfolded names
    evolving.fold_topics();

    for raw in topics {
        let name = Topic::normalize(raw.as_ref());
        if name.is_empty() {
            continue;
        }

        match evolving.topics.iter_mut().find(|t| t.name == name) {
            Some(existing) => {
                existing.count = existing.count.saturating_add(1);
                existing.last_used = now;
            }
            None => {
                evolving.topics.push(Topic {
                    name,
                    count: 1,
                    last_used: now,
                });
            }
        }

        enforce_topic_cap(evolving, settings.topic_cap, now);
    }
    enforce_topic_cap(evolving, settings.topic_cap, now);

    evolving.usage_count = evolving.usage_count.saturating_add(1);
    evolving.last_updated = now;
    evolving.last_prompt = truncate_chars(prompt, settings.prompt_max_chars);
}

/// Heuristic keyword extraction for callers that have no topic list.
///
/// Lower-cased word tokens of three or more characters, stop-words dropped, ordered by
/// frequency and then by first occurrence.
pub fn extract_topics(prompt: &str, limit: usize) -> Vec<String> {
    let mut counts: HashMap<String, (usize, usize)> = HashMap::new();

    let tokens = prompt
        .split(|c: char| !(c.is_alphanumeric() || c == '#' || c == '+'))
        .map(|t| t.trim_matches('+').to_lowercase())
        .filter(|t| t.chars().count() >= 3)
        .filter(|t| !t.chars().all(|c| c.is_ascii_digit()))
        .filter(|t| !STOP_WORDS.contains(&t.as_str()));

    for (position, token) in tokens.enumerate() {
        counts.entry(token).or_insert((0, position)).0 += 1;
    }

    let mut ranked: Vec<(String, (usize, usize))> = counts.into_iter().collect();
    ranked.sort_by(|(_, (count_a, first_a)), (_, (count_b, first_b))| {
        match count_b.cmp(count_a) {
            Ordering::Equal => first_a.cmp(first_b),
            other => other,
        }
    });
    ranked.into_iter().take(limit).map(|(token, _)| token).collect()
}

/// One-line hint built from the profile's best topics, for prompt construction
pub fn context_hint(profile: &Profile, k: usize, now: Timestamp) -> Option<String> {
    let names: Vec<String> = rank_topics(&profile.evolving_profile, now)
        .into_iter()
        .take(k)
        .map(|scored| scored.topic.name)
        .collect();
    if names.is_empty() {
        None
    } else {
        Some(format!("Frequent topics: {}", names.join(", ")))
    }
}

/// Store-backed tracker
#[derive(Debug, Clone)]
pub struct EvolutionTracker {
    store: Arc<ProfileStore>,
    settings: EvolutionSettings,
}

impl EvolutionTracker {
    pub fn new(store: Arc<ProfileStore>, settings: EvolutionSettings) -> Self {
        Self { store, settings }
    }

    pub fn settings(&self) -> &EvolutionSettings {
        &self.settings
    }

    /// Record a use of `profile_id`. Never fails; unknown ids are ignored.
    pub fn evolve<S: AsRef<str>>(&self, profile_id: &str, prompt: &str, topics: &[S]) {
        if self.store.get(profile_id).is_none() {
            tracing::debug!(profile_id, "Skipping evolution for unknown profile");
            return;
        }

        let settings = &self.settings;
        let timestamp = now();
        let result = self.store.mutate_profile(profile_id, |profile| {
            record_usage(&mut profile.evolving_profile, prompt, topics, settings, timestamp);
        });

        match result {
            Ok(profile) => tracing::debug!(
                profile_id,
                usage_count = profile.evolving_profile.usage_count,
                topics = profile.evolving_profile.topics.len(),
                "Profile evolved"
            ),
            Err(e) if e.is_not_found() => {
                tracing::debug!(profile_id, "Profile vanished before evolution");
            }
            Err(e) => tracing::warn!(profile_id, error = %e, "Failed to persist profile evolution"),
        }
    }

    /// The `k` best topics of a profile; empty for unknown ids
    pub fn top_k_topics(&self, profile_id: &str, k: usize) -> Vec<Topic> {
        self.store
            .get(profile_id)
            .map(|profile| {
                rank_topics(&profile.evolving_profile, now())
                    .into_iter()
                    .take(k)
                    .map(|scored| scored.topic)
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::ProfileSpec;
    use chrono::Duration;

    fn tracker() -> (EvolutionTracker, String) {
        let store = Arc::new(ProfileStore::in_memory());
        let profile = store
            .add(ProfileSpec::new("Dev", "a senior engineer", "direct"))
            .unwrap();
        (
            EvolutionTracker::new(store, EvolutionSettings::default()),
            profile.id,
        )
    }

    fn topic(name: &str, count: u64, last_used: Timestamp) -> Topic {
        Topic {
            name: name.into(),
            count,
            last_used,
        }
    }

    #[test]
    fn test_case_insensitive_topics() {
        let (tracker, id) = tracker();

        tracker.evolve(&id, "first", &["TypeScript"]);
        tracker.evolve(&id, "second", &["typescript"]);

        let profile = tracker.store.get(&id).unwrap();
        let topics = &profile.evolving_profile.topics;
        assert_eq!(topics.len(), 1);
        assert_eq!(topics[0].name, "typescript");
        assert_eq!(topics[0].count, 2);
        assert_eq!(profile.evolving_profile.usage_count, 2);
        assert_eq!(profile.evolving_profile.last_prompt, "second");
    }

    #[test]
    fn test_topic_cap_is_enforced() {
        let (tracker, id) = tracker();
        let topics: Vec<String> = (0..15).map(|i| format!("topic-{i}")).collect();

        tracker.evolve(&id, "many topics", &topics);

        let profile = tracker.store.get(&id).unwrap();
        assert_eq!(profile.evolving_profile.topics.len(), DEFAULT_TOPIC_CAP);
    }

    #[test]
    fn test_unknown_profile_is_noop() {
        let (tracker, _) = tracker();
        let revision = tracker.store.revision();

        tracker.evolve("ghost", "prompt", &["rust"]);

        assert_eq!(tracker.store.revision(), revision);
        assert!(tracker.top_k_topics("ghost", 3).is_empty());
    }

    #[test]
    fn test_usage_without_topics_still_counts() {
        let (tracker, id) = tracker();
        tracker.evolve::<&str>(&id, "no topics", &[]);
        let profile = tracker.store.get(&id).unwrap();
        assert_eq!(profile.evolving_profile.usage_count, 1);
        assert!(profile.evolving_profile.topics.is_empty());
    }

    #[test]
    fn test_last_prompt_truncated_to_chars() {
        let mut evolving = EvolvingProfile::default();
        let prompt = "é".repeat(250);

        record_usage::<&str>(&mut evolving, &prompt, &[], &EvolutionSettings::default(), now());

        assert_eq!(evolving.last_prompt.chars().count(), DEFAULT_PROMPT_MAX_CHARS);
    }

    #[test]
    fn test_score_formula() {
        let t = now();
        let fresh = topic("a", 4, t);
        assert!((topic_score(&fresh, 4, t) - 1.0).abs() < 1e-9);

        let stale = topic("b", 2, t - Duration::days(10));
        // 0.4 * 0.5 + 0.6 * 1 / (1 + 1.0)
        assert!((topic_score(&stale, 4, t) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_recency_outweighs_frequency() {
        let t = now();
        let mut evolving = EvolvingProfile::default();
        evolving.topics = vec![
            topic("old-favourite", 10, t - Duration::days(60)),
            topic("fresh", 1, t),
        ];

        let ranked = rank_topics(&evolving, t);
        assert_eq!(ranked[0].topic.name, "fresh");
    }

    #[test]
    fn test_eviction_drops_lowest_score() {
        let t = now();
        let settings = EvolutionSettings {
            topic_cap: 2,
            ..Default::default()
        };
        let mut evolving = EvolvingProfile::default();
        evolving.topics = vec![
            topic("ancient", 1, t - Duration::days(365)),
            topic("recent", 3, t - Duration::days(1)),
        ];

        record_usage(&mut evolving, "p", &["newcomer"], &settings, t);

        let names: Vec<&str> = evolving.topics.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["recent", "newcomer"]);
    }

    #[test]
    fn test_top_k_topics_ordering() {
        let (tracker, id) = tracker();
        tracker.evolve(&id, "p", &["rust", "tokio"]);
        tracker.evolve(&id, "p", &["rust"]);

        let top = tracker.top_k_topics(&id, 1);
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].name, "rust");
        assert_eq!(tracker.top_k_topics(&id, 10).len(), 2);
    }

    #[test]
    fn test_counters_saturate_instead_of_overflowing() {
        let mut evolving = EvolvingProfile::default();
        evolving.usage_count = u64::MAX;
        evolving.topics = vec![topic("rust", u64::MAX, now())];

        record_usage(&mut evolving, "p", &["rust"], &EvolutionSettings::default(), now());

        assert_eq!(evolving.usage_count, u64::MAX);
        assert_eq!(evolving.topics[0].count, u64::MAX);
    }

    #[test]
    fn test_evolve_saturated_profile_through_store() {
        let (tracker, id) = tracker();
        tracker
            .store
            .mutate_profile(&id, |p| p.evolving_profile.usage_count = u64::MAX)
            .unwrap();

        tracker.evolve::<&str>(&id, "x", &[]);

        let profile = tracker.store.get(&id).unwrap();
        assert_eq!(profile.usage_count(), u64::MAX);
        assert_eq!(profile.evolving_profile.last_prompt, "x");
    }

    #[test]
    fn test_unfolded_names_are_merged_before_recording() {
        let t = now();
        let mut evolving = EvolvingProfile::default();
        evolving.topics = vec![topic("TypeScript", 3, t)];

        record_usage(&mut evolving, "p", &["typescript"], &EvolutionSettings::default(), t);

        assert_eq!(evolving.topics.len(), 1);
        assert_eq!(evolving.topics[0].name, "typescript");
        assert_eq!(evolving.topics[0].count, 4);
    }

    #[test]
    fn test_oversized_topic_list_is_trimmed_on_next_use() {
        let t = now();
        let settings = EvolutionSettings {
            topic_cap: 3,
            ..Default::default()
        };
        let mut evolving = EvolvingProfile::default();
        evolving.topics = (0..8u64)
            .map(|i| topic(&format!("t{i}"), i + 1, t - Duration::days(8 - i as i64)))
            .collect();

        record_usage::<&str>(&mut evolving, "p", &[], &settings, t);

        let names: Vec<&str> = evolving.topics.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["t5", "t6", "t7"]);
    }

    #[test]
    fn test_extract_topics() {
        let topics = extract_topics(
            "Rewrite the Rust async guide: Rust futures, tokio runtime and async traits",
            3,
        );
        assert_eq!(topics, vec!["rust", "async", "guide"]);
    }

    #[test]
    fn test_extract_topics_skips_numbers_and_short_words() {
        assert!(extract_topics("an ox at 2024 is ok", 5).is_empty());
    }

    #[test]
    fn test_context_hint() {
        let t = now();
        let mut profile = Profile::new(ProfileSpec::new("A", "p", "t"));
        assert!(context_hint(&profile, 3, t).is_none());

        profile.evolving_profile.topics = vec![topic("rust", 3, t), topic("sql", 1, t)];
        assert_eq!(
            context_hint(&profile, 3, t).as_deref(),
            Some("Frequent topics: rust, sql")
        );
    }
}
