//! Instance filter: which parsed instances are eligible peers.
//!
//! Pure predicate conjunction over the static filter configuration:
//! state, tags, availability zone and security groups. An empty result
//! is a valid outcome, never an error.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::model::{InstanceRecord, InstanceState};

/// Wildcard marker accepted in tag filter configuration.
pub const TAG_WILDCARD: &str = "*";

// ── Tag Match ───────────────────────────────────────────────────────

/// How the value of one configured tag key is matched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "TagMatchRepr", into = "TagMatchRepr")]
pub enum TagMatch {
    /// Tag must be present, any value.
    Any,
    Exact(String),
    OneOf(BTreeSet<String>),
}

impl TagMatch {
    pub fn matches(&self, value: Option<&str>) -> bool {
        let Some(value) = value else {
            return false;
        };
        match self {
            Self::Any => true,
            Self::Exact(expected) => expected == value,
            Self::OneOf(accepted) => accepted.contains(value),
        }
    }

    /// Concrete values the inventory API can pre-filter on. `Any` has none.
    pub fn values(&self) -> Vec<String> {
        match self {
            Self::Any => Vec::new(),
            Self::Exact(v) => vec![v.clone()],
            Self::OneOf(vs) => vs.iter().cloned().collect(),
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum TagMatchRepr {
    One(String),
    Many(Vec<String>),
}

impl From<TagMatchRepr> for TagMatch {
    fn from(repr: TagMatchRepr) -> Self {
        match repr {
            TagMatchRepr::One(v) if v == TAG_WILDCARD => Self::Any,
            TagMatchRepr::One(v) => Self::Exact(v),
            TagMatchRepr::Many(vs) if vs.iter().any(|v| v == TAG_WILDCARD) => Self::Any,
            TagMatchRepr::Many(vs) => Self::OneOf(vs.into_iter().collect()),
        }
    }
}

impl From<TagMatch> for TagMatchRepr {
    fn from(m: TagMatch) -> Self {
        match m {
            TagMatch::Any => Self::One(TAG_WILDCARD.to_string()),
            TagMatch::Exact(v) => Self::One(v),
            TagMatch::OneOf(vs) => Self::Many(vs.into_iter().collect()),
        }
    }
}

// ── Filter Config ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryFilterConfig {
    pub required_state: InstanceState,
    pub tag_filters: BTreeMap<String, TagMatch>,
    /// Empty means any zone.
    pub availability_zones: BTreeSet<String>,
    /// Group ids or names. Empty means any group.
    pub security_groups: BTreeSet<String>,
    /// `true`: at least one configured group must match.
    /// `false`: every configured group must be present.
    pub any_group: bool,
}

impl Default for DiscoveryFilterConfig {
    fn default() -> Self {
        Self {
            required_state: InstanceState::Running,
            tag_filters: BTreeMap::new(),
            availability_zones: BTreeSet::new(),
            security_groups: BTreeSet::new(),
            any_group: true,
        }
    }
}

impl DiscoveryFilterConfig {
    pub fn matches(&self, record: &InstanceRecord) -> bool {
        record.state == self.required_state
            && self.matches_tags(record)
            && self.matches_zone(record)
            && self.matches_groups(record)
    }

    fn matches_tags(&self, record: &InstanceRecord) -> bool {
        self.tag_filters
            .iter()
            .all(|(key, m)| m.matches(record.tags.get(key).map(String::as_str)))
    }

    fn matches_zone(&self, record: &InstanceRecord) -> bool {
        if self.availability_zones.is_empty() {
            return true;
        }
        record
            .availability_zone
            .as_ref()
            .is_some_and(|az| self.availability_zones.contains(az))
    }

    fn matches_groups(&self, record: &InstanceRecord) -> bool {
        if self.security_groups.is_empty() {
            return true;
        }
        if self.any_group {
            self.security_groups
                .iter()
                .any(|g| record.security_groups.contains(g))
        } else {
            self.security_groups.is_subset(&record.security_groups)
        }
    }
}

/// Keep the records that satisfy every configured predicate.
pub fn filter<I>(records: I, config: &DiscoveryFilterConfig) -> Vec<InstanceRecord>
where
    I: IntoIterator<Item = InstanceRecord>,
{
    records.into_iter().filter(|r| config.matches(r)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(id: &str, state: InstanceState) -> InstanceRecord {
        let mut r = InstanceRecord::new(id, state);
        r.private_address = Some(format!("10.0.0.{}", id.len()));
        r.availability_zone = Some("us-east-1a".into());
        r
    }

    fn tagged(id: &str, tags: &[(&str, &str)]) -> InstanceRecord {
        let mut r = instance(id, InstanceState::Running);
        for (k, v) in tags {
            r.tags.insert(k.to_string(), v.to_string());
        }
        r
    }

    fn grouped(id: &str, groups: &[&str]) -> InstanceRecord {
        let mut r = instance(id, InstanceState::Running);
        r.security_groups = groups.iter().map(|g| g.to_string()).collect();
        r
    }

    fn ids(records: &[InstanceRecord]) -> Vec<&str> {
        records.iter().map(|r| r.instance_id.as_str()).collect()
    }

    #[test]
    fn test_default_requires_running() {
        let config = DiscoveryFilterConfig::default();
        let out = filter(
            vec![
                instance("i-run", InstanceState::Running),
                instance("i-term", InstanceState::Terminated),
                instance("i-pend", InstanceState::Pending),
                instance("i-unk", InstanceState::Unknown),
            ],
            &config,
        );
        assert_eq!(ids(&out), vec!["i-run"]);
    }

    #[test]
    fn test_required_state_is_configurable() {
        let config = DiscoveryFilterConfig {
            required_state: InstanceState::Stopped,
            ..Default::default()
        };
        let out = filter(
            vec![
                instance("i-run", InstanceState::Running),
                instance("i-stop", InstanceState::Stopped),
            ],
            &config,
        );
        assert_eq!(ids(&out), vec!["i-stop"]);
    }

    #[test]
    fn test_exact_tag_match() {
        let mut config = DiscoveryFilterConfig::default();
        config
            .tag_filters
            .insert("stage".into(), TagMatch::Exact("prod".into()));

        let out = filter(
            vec![
                tagged("i-prod", &[("stage", "prod")]),
                tagged("i-dev", &[("stage", "dev")]),
                tagged("i-none", &[]),
            ],
            &config,
        );
        assert_eq!(ids(&out), vec!["i-prod"]);
    }

    #[test]
    fn test_wildcard_tag_requires_presence() {
        let mut config = DiscoveryFilterConfig::default();
        config.tag_filters.insert("cluster".into(), TagMatch::Any);

        let out = filter(
            vec![
                tagged("i-a", &[("cluster", "search")]),
                tagged("i-b", &[("cluster", "")]),
                tagged("i-c", &[("other", "x")]),
            ],
            &config,
        );
        assert_eq!(ids(&out), vec!["i-a", "i-b"]);
    }

    #[test]
    fn test_one_of_tag_values() {
        let mut config = DiscoveryFilterConfig::default();
        config.tag_filters.insert(
            "stage".into(),
            TagMatch::OneOf(["dev".to_string(), "qa".to_string()].into()),
        );

        let out = filter(
            vec![
                tagged("i-dev", &[("stage", "dev")]),
                tagged("i-qa", &[("stage", "qa")]),
                tagged("i-prod", &[("stage", "prod")]),
            ],
            &config,
        );
        assert_eq!(ids(&out), vec!["i-dev", "i-qa"]);
    }

    #[test]
    fn test_multiple_tag_filters_are_conjunctive() {
        let mut config = DiscoveryFilterConfig::default();
        config
            .tag_filters
            .insert("stage".into(), TagMatch::Exact("prod".into()));
        config.tag_filters.insert("cluster".into(), TagMatch::Any);

        let out = filter(
            vec![
                tagged("i-both", &[("stage", "prod"), ("cluster", "es")]),
                tagged("i-stage", &[("stage", "prod")]),
            ],
            &config,
        );
        assert_eq!(ids(&out), vec!["i-both"]);
    }

    #[test]
    fn test_availability_zone_member_of() {
        let config = DiscoveryFilterConfig {
            availability_zones: ["us-east-1b".to_string()].into(),
            ..Default::default()
        };
        let mut in_zone = instance("i-b", InstanceState::Running);
        in_zone.availability_zone = Some("us-east-1b".into());
        let mut no_zone = instance("i-none", InstanceState::Running);
        no_zone.availability_zone = None;

        let out = filter(
            vec![instance("i-a", InstanceState::Running), in_zone, no_zone],
            &config,
        );
        assert_eq!(ids(&out), vec!["i-b"]);
    }

    #[test]
    fn test_security_groups_any() {
        let config = DiscoveryFilterConfig {
            security_groups: ["sg-1".to_string(), "search".to_string()].into(),
            ..Default::default()
        };
        let out = filter(
            vec![
                grouped("i-id", &["sg-1"]),
                grouped("i-name", &["sg-9", "search"]),
                grouped("i-other", &["sg-2"]),
                grouped("i-none", &[]),
            ],
            &config,
        );
        assert_eq!(ids(&out), vec!["i-id", "i-name"]);
    }

    #[test]
    fn test_security_groups_all() {
        let config = DiscoveryFilterConfig {
            security_groups: ["sg-1".to_string(), "sg-2".to_string()].into(),
            any_group: false,
            ..Default::default()
        };
        let out = filter(
            vec![
                grouped("i-both", &["sg-1", "sg-2", "sg-3"]),
                grouped("i-one", &["sg-1"]),
            ],
            &config,
        );
        assert_eq!(ids(&out), vec!["i-both"]);
    }

    #[test]
    fn test_filter_is_idempotent() {
        let mut config = DiscoveryFilterConfig {
            security_groups: ["sg-1".to_string()].into(),
            ..Default::default()
        };
        config.tag_filters.insert("cluster".into(), TagMatch::Any);

        let mut a = tagged("i-a", &[("cluster", "es")]);
        a.security_groups.insert("sg-1".into());
        let mut b = tagged("i-b", &[("cluster", "es")]);
        b.state = InstanceState::Stopping;
        let c = grouped("i-c", &["sg-1"]);

        let once = filter(vec![a, b, c], &config);
        let twice = filter(once.clone(), &config);
        assert_eq!(once, twice);
        assert_eq!(ids(&once), vec!["i-a"]);
    }

    #[test]
    fn test_empty_input_is_valid() {
        let out = filter(Vec::new(), &DiscoveryFilterConfig::default());
        assert!(out.is_empty());
    }

    #[test]
    fn test_tag_match_from_yaml() {
        let yaml = r#"
required_state: running
tag_filters:
  stage: prod
  cluster: "*"
  tier: [hot, warm]
"#;
        let config: DiscoveryFilterConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.required_state, InstanceState::Running);
        assert_eq!(config.tag_filters["stage"], TagMatch::Exact("prod".into()));
        assert_eq!(config.tag_filters["cluster"], TagMatch::Any);
        assert_eq!(
            config.tag_filters["tier"],
            TagMatch::OneOf(["hot".to_string(), "warm".to_string()].into())
        );
        assert!(config.any_group);
    }
}
