//! # Profiles
//!
//! Named persona/style presets and the usage statistics that evolve with them.
//!
//! ```text
//! ProfilesConfig
//! ├── list: [Profile]
//! │     ├── id, name, persona, tone, styleGuidelines
//! │     └── evolvingProfile
//! │           ├── topics: [Topic { name, count, lastUsed }]
//! │           ├── usageCount, lastUpdated, lastPrompt
//! └── activeProfileId
//! ```
//!
//! The serialized form of [`ProfilesConfig`] is also the canonical sync document, so the
//! field names here are the wire names (camelCase).

pub mod store;

pub use store::{ChangeOrigin, ProfileStore, StoreChange};

use crate::error::ProfileError;
use crate::types::{now, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

/// A named persona/style preset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    /// Unique, opaque identifier
    pub id: String,

    /// Display name
    pub name: String,

    /// Who the writer should sound like
    pub persona: String,

    /// Register of the output (formal, playful, ...)
    pub tone: String,

    /// Ordered writing rules
    pub style_guidelines: Vec<String>,

    /// Usage-derived statistics
    pub evolving_profile: EvolvingProfile,
}

impl Profile {
    /// Create a profile with a fresh id and empty statistics
    pub fn new(spec: ProfileSpec) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: spec.name,
            persona: spec.persona,
            tone: spec.tone,
            style_guidelines: spec.style_guidelines,
            evolving_profile: EvolvingProfile::default(),
        }
    }

    /// Usage count shortcut used by merge decisions
    pub fn usage_count(&self) -> u64 {
        self.evolving_profile.usage_count
    }

    /// Check required text fields are present
    pub fn validate(&self) -> Result<(), ProfileError> {
        for (field, value) in [
            ("id", &self.id),
            ("name", &self.name),
            ("persona", &self.persona),
            ("tone", &self.tone),
        ] {
            if value.trim().is_empty() {
                return Err(ProfileError::InvalidField {
                    field: field.to_string(),
                    reason: "must not be empty".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Apply a partial update
    pub fn apply(&mut self, patch: ProfilePatch) {
        if let Some(name) = patch.name {
            self.name = name;
        }
        if let Some(persona) = patch.persona {
            self.persona = persona;
        }
        if let Some(tone) = patch.tone {
            self.tone = tone;
        }
        if let Some(guidelines) = patch.style_guidelines {
            self.style_guidelines = guidelines;
        }
        if let Some(evolving) = patch.evolving_profile {
            self.evolving_profile = evolving;
        }
    }
}

/// Mutable, usage-derived part of a profile
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvolvingProfile {
    /// Tracked topics, names stored case-folded
    pub topics: Vec<Topic>,

    /// Number of times the profile has been used
    pub usage_count: u64,

    /// Last evolution time
    pub last_updated: Timestamp,

    /// Most recent prompt, truncated
    pub last_prompt: String,
}

impl Default for EvolvingProfile {
    fn default() -> Self {
        Self {
            topics: Vec::new(),
            usage_count: 0,
            last_updated: now(),
            last_prompt: String::new(),
        }
    }
}

impl EvolvingProfile {
    /// Find a topic by name, ignoring case
    pub fn topic(&self, name: &str) -> Option<&Topic> {
        let key = Topic::normalize(name);
        self.topics.iter().find(|t| t.name == key)
    }

    /// Highest topic count, 0 when there are no topics
    pub fn max_topic_count(&self) -> u64 {
        self.topics.iter().map(|t| t.count).max().unwrap_or(0)
    }

    /// Case-fold every topic name and collapse entries that now share a name: counts add
    /// up (saturating), the latest `last_used` wins. First-occurrence order is kept.
    pub fn fold_topics(&mut self) {
        let mut folded: Vec<Topic> = Vec::with_capacity(self.topics.len());
        for topic in self.topics.drain(..) {
            let name = Topic::normalize(&topic.name);
            match folded.iter_mut().find(|t| t.name == name) {
                Some(existing) => {
                    existing.count = existing.count.saturating_add(topic.count);
                    existing.last_used = existing.last_used.max(topic.last_used);
                }
                None => folded.push(Topic { name, ..topic }),
            }
        }
        self.topics = folded;
    }
}

/// A keyword inferred from usage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Topic {
    pub name: String,
    pub count: u64,
    pub last_used: Timestamp,
}

impl Topic {
    /// Case-folded key for a topic name
    pub fn normalize(name: &str) -> String {
        name.trim().to_lowercase()
    }
}

/// Fields accepted by [`ProfileStore::add`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileSpec {
    pub name: String,
    pub persona: String,
    pub tone: String,
    #[serde(default)]
    pub style_guidelines: Vec<String>,
}

impl ProfileSpec {
    pub fn new(
        name: impl Into<String>,
        persona: impl Into<String>,
        tone: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            persona: persona.into(),
            tone: tone.into(),
            style_guidelines: Vec::new(),
        }
    }

    pub fn with_guideline(mut self, guideline: impl Into<String>) -> Self {
        self.style_guidelines.push(guideline.into());
        self
    }
}

/// Partial update for [`ProfileStore::update`]; `None` leaves a field unchanged
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProfilePatch {
    pub name: Option<String>,
    pub persona: Option<String>,
    pub tone: Option<String>,
    pub style_guidelines: Option<Vec<String>>,
    pub evolving_profile: Option<EvolvingProfile>,
}

impl ProfilePatch {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

/// The full profile set plus the active pointer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfilesConfig {
    pub list: Vec<Profile>,
    pub active_profile_id: Option<String>,
}

impl ProfilesConfig {
    pub fn new(list: Vec<Profile>, active_profile_id: Option<String>) -> Self {
        Self {
            list,
            active_profile_id,
        }
    }

    /// Canonical seed set used on first run and on reset
    pub fn defaults() -> Self {
        Self::new(default_profiles(), None)
    }

    pub fn get(&self, id: &str) -> Option<&Profile> {
        self.list.iter().find(|p| p.id == id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Profile> {
        self.list.iter_mut().find(|p| p.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    /// The active profile, if the pointer resolves
    pub fn active(&self) -> Option<&Profile> {
        self.active_profile_id
            .as_deref()
            .and_then(|id| self.get(id))
    }

    pub fn ids(&self) -> Vec<&str> {
        self.list.iter().map(|p| p.id.as_str()).collect()
    }

    /// Verify id uniqueness and active-pointer resolution
    pub fn check_invariants(&self) -> Result<(), ProfileError> {
        let mut seen = HashSet::with_capacity(self.list.len());
        for profile in &self.list {
            if !seen.insert(profile.id.as_str()) {
                return Err(ProfileError::InvariantViolation(format!(
                    "duplicate profile id `{}`",
                    profile.id
                )));
            }
        }
        if let Some(active) = &self.active_profile_id {
            if !seen.contains(active.as_str()) {
                return Err(ProfileError::InvariantViolation(format!(
                    "active profile `{}` is not in the list",
                    active
                )));
            }
        }
        Ok(())
    }
}

fn seed(id: &str, name: &str, persona: &str, tone: &str, guidelines: &[&str]) -> Profile {
    Profile {
        id: id.to_string(),
        name: name.to_string(),
        persona: persona.to_string(),
        tone: tone.to_string(),
        style_guidelines: guidelines.iter().map(|g| g.to_string()).collect(),
        evolving_profile: EvolvingProfile::default(),
    }
}

/// Seed profiles. Ids are fixed so clients that seed independently agree on them.
pub fn default_profiles() -> Vec<Profile> {
    vec![
        seed(
            "default-professional",
            "Professional",
            "An experienced colleague writing for stakeholders",
            "formal",
            &["Lead with the conclusion", "Avoid slang", "Prefer short paragraphs"],
        ),
        seed(
            "default-casual",
            "Casual",
            "A friendly teammate chatting in a thread",
            "relaxed",
            &["Use contractions", "Keep it brief"],
        ),
        seed(
            "default-technical",
            "Technical Writer",
            "A documentation engineer explaining systems precisely",
            "precise",
            &[
                "Define terms on first use",
                "Use numbered steps for procedures",
                "Show concrete examples",
            ],
        ),
        seed(
            "default-concise",
            "Concise",
            "An editor who cuts every unnecessary word",
            "direct",
            &["One idea per sentence", "No filler words"],
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ProfilesConfig::defaults();
        assert_eq!(config.list.len(), 4);
        assert!(config.active_profile_id.is_none());
        config.check_invariants().unwrap();
        for profile in &config.list {
            profile.validate().unwrap();
            assert_eq!(profile.usage_count(), 0);
        }
    }

    #[test]
    fn test_new_profile_has_unique_id() {
        let a = Profile::new(ProfileSpec::new("A", "p", "t"));
        let b = Profile::new(ProfileSpec::new("A", "p", "t"));
        assert_ne!(a.id, b.id);
        assert!(a.evolving_profile.topics.is_empty());
    }

    #[test]
    fn test_validate_rejects_blank_tone() {
        let profile = Profile::new(ProfileSpec::new("A", "p", "   "));
        let err = profile.validate().unwrap_err();
        assert_eq!(
            err,
            ProfileError::InvalidField {
                field: "tone".into(),
                reason: "must not be empty".into()
            }
        );
    }

    #[test]
    fn test_patch_preserves_evolving_profile() {
        let mut profile = Profile::new(ProfileSpec::new("A", "p", "t"));
        profile.evolving_profile.usage_count = 7;

        profile.apply(ProfilePatch {
            name: Some("B".into()),
            ..Default::default()
        });

        assert_eq!(profile.name, "B");
        assert_eq!(profile.usage_count(), 7);
    }

    #[test]
    fn test_invariants_detect_duplicates_and_dangling_active() {
        let profile = Profile::new(ProfileSpec::new("A", "p", "t"));
        let dup = ProfilesConfig::new(vec![profile.clone(), profile.clone()], None);
        assert!(dup.check_invariants().is_err());

        let dangling = ProfilesConfig::new(vec![profile], Some("ghost".into()));
        assert!(dangling.check_invariants().is_err());
    }

    #[test]
    fn test_wire_names_are_camel_case() {
        let config = ProfilesConfig::new(vec![Profile::new(ProfileSpec::new("A", "p", "t"))], None);
        let value = serde_json::to_value(&config).unwrap();
        assert!(value.get("activeProfileId").is_some());
        let first = &value["list"][0];
        assert!(first.get("styleGuidelines").is_some());
        assert!(first["evolvingProfile"].get("usageCount").is_some());
        assert!(first["evolvingProfile"].get("lastPrompt").is_some());
    }

    #[test]
    fn test_topic_lookup_ignores_case() {
        let mut evolving = EvolvingProfile::default();
        evolving.topics.push(Topic {
            name: "rust".into(),
            count: 2,
            last_used: now(),
        });
        assert!(evolving.topic("RUST").is_some());
        assert_eq!(evolving.max_topic_count(), 2);
    }

    #[test]
    fn test_fold_topics_collapses_case_variants() {
        let older = now() - chrono::Duration::days(3);
        let newer = now();
        let mut evolving = EvolvingProfile::default();
        evolving.topics = vec![
            Topic { name: "Rust".into(), count: 2, last_used: older },
            Topic { name: "sql".into(), count: 1, last_used: older },
            Topic { name: " rust ".into(), count: u64::MAX, last_used: newer },
        ];

        evolving.fold_topics();

        let names: Vec<&str> = evolving.topics.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["rust", "sql"]);
        assert_eq!(evolving.topics[0].count, u64::MAX);
        assert_eq!(evolving.topics[0].last_used, newer);
    }
}
