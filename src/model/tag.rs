//! Tag Model
//!
//! Canonical recording types and the pure rules that give every session its identity:
//! duration bounds, auto-recording behaviour and subtag derivation.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Coarse recording category.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionTag {
    /// Short morning measurement right after waking up.
    WakeCheck,
    /// Short evening measurement right before going to bed.
    PreSleep,
    /// Continuous overnight measurement, recorded as chained intervals.
    Sleep,
    /// Free-form measurement, usually labelled with a protocol.
    Experiment,
}

/// Which half of a paired day a tag contributes to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PairingRole {
    DayPre,
    DayPost,
}

impl SessionTag {
    pub const ALL: [SessionTag; 4] = [
        SessionTag::WakeCheck,
        SessionTag::PreSleep,
        SessionTag::Sleep,
        SessionTag::Experiment,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WakeCheck => "wake_check",
            Self::PreSleep => "pre_sleep",
            Self::Sleep => "sleep",
            Self::Experiment => "experiment",
        }
    }

    /// Built-in duration bounds, used unless the configuration overrides them.
    pub fn default_rules(&self) -> TagRules {
        match self {
            Self::WakeCheck => TagRules::new(5, 1, 15),
            Self::PreSleep => TagRules::new(5, 1, 15),
            Self::Sleep => TagRules::new(10, 5, 60),
            Self::Experiment => TagRules::new(5, 1, 120),
        }
    }

    /// True for tags whose intervals chain automatically until stopped.
    pub fn is_auto_recording_mode(&self) -> bool {
        matches!(self, Self::Sleep)
    }

    pub fn pairing_role(&self) -> Option<PairingRole> {
        match self {
            Self::WakeCheck => Some(PairingRole::DayPre),
            Self::PreSleep => Some(PairingRole::DayPost),
            Self::Sleep | Self::Experiment => None,
        }
    }

    /// Derives the subtag for a session of this tag.
    ///
    /// Precedence: interval ordinal, paired-day marker (only for tags with a pairing role),
    /// normalized protocol name, standalone marker.
    pub fn generate_subtag(
        &self,
        is_paired: bool,
        interval_number: Option<u32>,
        protocol_name: &str,
    ) -> String {
        if let Some(n) = interval_number {
            return format!("{}_interval_{}", self.as_str(), n);
        }
        if is_paired {
            match self.pairing_role() {
                Some(PairingRole::DayPre) => return format!("{}_paired_day_pre", self.as_str()),
                Some(PairingRole::DayPost) => return format!("{}_paired_day_post", self.as_str()),
                None => {}
            }
        }
        let protocol = normalize_protocol(protocol_name);
        if !protocol.is_empty() {
            return protocol;
        }
        format!("{}_single", self.as_str())
    }
}

/// Lower-cases and joins whitespace-separated words with underscores.
pub fn normalize_protocol(name: &str) -> String {
    name.split_whitespace()
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join("_")
}

impl fmt::Display for SessionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionTag {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_lowercase().replace('-', "_");
        SessionTag::ALL
            .into_iter()
            .find(|t| t.as_str() == wanted)
            .ok_or_else(|| anyhow!("unknown tag '{}'", s))
    }
}

/// Duration bounds of a tag, in minutes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagRules {
    pub default_duration_minutes: u32,
    pub min_duration_minutes: u32,
    pub max_duration_minutes: u32,
}

impl TagRules {
    pub const fn new(default: u32, min: u32, max: u32) -> Self {
        Self {
            default_duration_minutes: default,
            min_duration_minutes: min,
            max_duration_minutes: max,
        }
    }

    pub fn contains(&self, minutes: u32) -> bool {
        (self.min_duration_minutes..=self.max_duration_minutes).contains(&minutes)
    }

    pub fn clamp(&self, minutes: u32) -> u32 {
        minutes.clamp(self.min_duration_minutes, self.max_duration_minutes)
    }

    fn validate(&self, tag: SessionTag) -> Result<()> {
        if self.min_duration_minutes == 0 {
            return Err(anyhow!("{}: minimum duration must be at least 1 minute", tag));
        }
        if self.min_duration_minutes > self.max_duration_minutes
            || !self.contains(self.default_duration_minutes)
        {
            return Err(anyhow!(
                "{}: expected min <= default <= max, got {} <= {} <= {}",
                tag,
                self.min_duration_minutes,
                self.default_duration_minutes,
                self.max_duration_minutes
            ));
        }
        Ok(())
    }
}

/// Partial duration bounds as written in the configuration file.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct TagRulesOverride {
    pub default_duration_minutes: Option<u32>,
    pub min_duration_minutes: Option<u32>,
    pub max_duration_minutes: Option<u32>,
}

/// Effective rule set for all tags.
#[derive(Clone, Debug, PartialEq)]
pub struct TagCatalog {
    rules: BTreeMap<SessionTag, TagRules>,
}

impl Default for TagCatalog {
    fn default() -> Self {
        Self {
            rules: SessionTag::ALL
                .into_iter()
                .map(|t| (t, t.default_rules()))
                .collect(),
        }
    }
}

impl TagCatalog {
    /// Builds a catalog from the built-in rules with configured overrides applied.
    pub fn with_overrides(overrides: &BTreeMap<SessionTag, TagRulesOverride>) -> Result<Self> {
        let mut catalog = Self::default();
        for (tag, o) in overrides {
            let mut rules = tag.default_rules();
            if let Some(v) = o.default_duration_minutes {
                rules.default_duration_minutes = v;
            }
            if let Some(v) = o.min_duration_minutes {
                rules.min_duration_minutes = v;
            }
            if let Some(v) = o.max_duration_minutes {
                rules.max_duration_minutes = v;
            }
            rules.validate(*tag)?;
            catalog.rules.insert(*tag, rules);
        }
        Ok(catalog)
    }

    pub fn rules(&self, tag: SessionTag) -> TagRules {
        self.rules
            .get(&tag)
            .copied()
            .unwrap_or_else(|| tag.default_rules())
    }

    pub fn default_duration_minutes(&self, tag: SessionTag) -> u32 {
        self.rules(tag).default_duration_minutes
    }

    pub fn min_duration_minutes(&self, tag: SessionTag) -> u32 {
        self.rules(tag).min_duration_minutes
    }

    pub fn max_duration_minutes(&self, tag: SessionTag) -> u32 {
        self.rules(tag).max_duration_minutes
    }

    pub fn clamp_duration(&self, tag: SessionTag, minutes: u32) -> u32 {
        self.rules(tag).clamp(minutes)
    }

    /// Rejects durations outside the tag's bounds.
    pub fn check_duration(&self, tag: SessionTag, minutes: u32) -> Result<()> {
        let rules = self.rules(tag);
        if rules.contains(minutes) {
            Ok(())
        } else {
            Err(anyhow!(
                "duration of {} min is outside [{}, {}] for {}",
                minutes,
                rules.min_duration_minutes,
                rules.max_duration_minutes,
                tag
            ))
        }
    }

    pub fn tags(&self) -> impl Iterator<Item = (SessionTag, TagRules)> + '_ {
        self.rules.iter().map(|(t, r)| (*t, *r))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_subtag_is_deterministic() {
        for tag in SessionTag::ALL {
            for paired in [false, true] {
                for interval in [None, Some(1), Some(7)] {
                    for protocol in ["", "Box Breathing"] {
                        assert_eq!(
                            tag.generate_subtag(paired, interval, protocol),
                            tag.generate_subtag(paired, interval, protocol)
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn test_subtag_precedence() {
        assert_eq!(
            SessionTag::Sleep.generate_subtag(true, Some(3), "x"),
            "sleep_interval_3"
        );
        assert_eq!(
            SessionTag::WakeCheck.generate_subtag(true, None, "x"),
            "wake_check_paired_day_pre"
        );
        assert_eq!(
            SessionTag::PreSleep.generate_subtag(true, None, ""),
            "pre_sleep_paired_day_post"
        );
        assert_eq!(
            SessionTag::Experiment.generate_subtag(true, None, "  Box   Breathing 4x4 "),
            "box_breathing_4x4"
        );
        assert_eq!(
            SessionTag::Experiment.generate_subtag(false, None, "   "),
            "experiment_single"
        );
        assert_eq!(
            SessionTag::WakeCheck.generate_subtag(false, None, ""),
            "wake_check_single"
        );
    }

    #[test]
    fn test_subtags_do_not_collide_across_reachable_inputs() {
        let mut seen = HashSet::new();
        for tag in SessionTag::ALL {
            let mut inputs = vec![(false, None, ""), (false, None, "cold exposure")];
            if tag.pairing_role().is_some() {
                inputs.push((true, None, ""));
            }
            if tag.is_auto_recording_mode() {
                inputs.extend([(false, Some(1), ""), (false, Some(2), "")]);
            }
            for (paired, interval, protocol) in inputs {
                let subtag = tag.generate_subtag(paired, interval, protocol);
                // protocol subtags carry no tag prefix
                if protocol.is_empty() {
                    assert!(seen.insert(subtag), "collision for {}", tag);
                }
            }
        }
        assert_eq!(seen.len(), 8);
    }

    #[test]
    fn test_auto_mode_only_for_sleep() {
        let auto: Vec<_> = SessionTag::ALL
            .into_iter()
            .filter(|t| t.is_auto_recording_mode())
            .collect();
        assert_eq!(auto, vec![SessionTag::Sleep]);
    }

    #[test]
    fn test_parse_tag() {
        assert_eq!("sleep".parse::<SessionTag>().unwrap(), SessionTag::Sleep);
        assert_eq!(
            "Wake-Check".parse::<SessionTag>().unwrap(),
            SessionTag::WakeCheck
        );
        assert!("nap".parse::<SessionTag>().is_err());
    }

    #[test]
    fn test_catalog_clamp_and_check() {
        let catalog = TagCatalog::default();
        assert_eq!(catalog.clamp_duration(SessionTag::Sleep, 1), 5);
        assert_eq!(catalog.clamp_duration(SessionTag::Sleep, 500), 60);
        assert!(catalog.check_duration(SessionTag::Sleep, 10).is_ok());
        assert!(catalog.check_duration(SessionTag::Sleep, 4).is_err());
        assert!(catalog.check_duration(SessionTag::WakeCheck, 0).is_err());
    }

    #[test]
    fn test_catalog_overrides() {
        let mut overrides = BTreeMap::new();
        overrides.insert(
            SessionTag::Sleep,
            TagRulesOverride {
                default_duration_minutes: Some(20),
                max_duration_minutes: Some(90),
                ..Default::default()
            },
        );
        let catalog = TagCatalog::with_overrides(&overrides).unwrap();
        assert_eq!(catalog.default_duration_minutes(SessionTag::Sleep), 20);
        assert_eq!(catalog.max_duration_minutes(SessionTag::Sleep), 90);
        assert_eq!(catalog.min_duration_minutes(SessionTag::Sleep), 5);
        assert_eq!(
            catalog.rules(SessionTag::WakeCheck),
            SessionTag::WakeCheck.default_rules()
        );
    }

    #[test]
    fn test_catalog_rejects_inconsistent_overrides() {
        let mut overrides = BTreeMap::new();
        overrides.insert(
            SessionTag::Experiment,
            TagRulesOverride {
                default_duration_minutes: Some(200),
                ..Default::default()
            },
        );
        assert!(TagCatalog::with_overrides(&overrides).is_err());

        overrides.insert(
            SessionTag::Experiment,
            TagRulesOverride {
                min_duration_minutes: Some(0),
                default_duration_minutes: Some(1),
                ..Default::default()
            },
        );
        assert!(TagCatalog::with_overrides(&overrides).is_err());
    }
}
