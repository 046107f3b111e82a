//! Decide whether a driving event is a release.

use regex::Regex;

use crate::domain::{ConfigError, ReleaseError};

/// What started the pipeline, parsed from a git ref.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrivingEvent {
    TagPush { tag: String },
    BranchPush { branch: String },
    Other { reference: String },
}

impl DrivingEvent {
    /// Parse `refs/tags/...` and `refs/heads/...`. A bare name is treated as a tag.
    pub fn from_ref(reference: &str) -> Self {
        let reference = reference.trim();
        if let Some(tag) = reference.strip_prefix("refs/tags/") {
            DrivingEvent::TagPush {
                tag: tag.to_string(),
            }
        } else if let Some(branch) = reference.strip_prefix("refs/heads/") {
            DrivingEvent::BranchPush {
                branch: branch.to_string(),
            }
        } else if reference.is_empty() || reference.starts_with("refs/") {
            DrivingEvent::Other {
                reference: reference.to_string(),
            }
        } else {
            DrivingEvent::TagPush {
                tag: reference.to_string(),
            }
        }
    }

    pub fn describe(&self) -> String {
        match self {
            DrivingEvent::TagPush { tag } => format!("tag {}", tag),
            DrivingEvent::BranchPush { branch } => format!("branch {}", branch),
            DrivingEvent::Other { reference } if reference.is_empty() => "no ref".to_string(),
            DrivingEvent::Other { reference } => reference.clone(),
        }
    }
}

/// Matches release tags against a configured pattern.
#[derive(Debug, Clone)]
pub struct ReleaseTrigger {
    pattern: Regex,
}

impl ReleaseTrigger {
    pub fn new(pattern: &str) -> Result<Self, ConfigError> {
        let pattern = Regex::new(pattern).map_err(|e| ConfigError::InvalidTagPattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self { pattern })
    }

    /// Release tag of the event, or `NotReleaseEvent`.
    pub fn release_tag(&self, event: &DrivingEvent) -> Result<String, ReleaseError> {
        match event {
            DrivingEvent::TagPush { tag } if self.pattern.is_match(tag) => Ok(tag.clone()),
            other => Err(ReleaseError::NotReleaseEvent(other.describe())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_ref() {
        assert_eq!(
            DrivingEvent::from_ref("refs/tags/v1.2.0"),
            DrivingEvent::TagPush {
                tag: "v1.2.0".to_string()
            }
        );
        assert_eq!(
            DrivingEvent::from_ref("refs/heads/main"),
            DrivingEvent::BranchPush {
                branch: "main".to_string()
            }
        );
        assert!(matches!(
            DrivingEvent::from_ref("refs/pull/7/merge"),
            DrivingEvent::Other { .. }
        ));
        assert_eq!(
            DrivingEvent::from_ref("v0.1"),
            DrivingEvent::TagPush {
                tag: "v0.1".to_string()
            }
        );
    }

    #[test]
    fn test_only_matching_tags_release() {
        let trigger = ReleaseTrigger::new("^v").unwrap();
        assert_eq!(
            trigger
                .release_tag(&DrivingEvent::from_ref("refs/tags/v2.0.0"))
                .unwrap(),
            "v2.0.0"
        );
        assert!(matches!(
            trigger.release_tag(&DrivingEvent::from_ref("refs/tags/nightly")),
            Err(ReleaseError::NotReleaseEvent(_))
        ));
        assert!(matches!(
            trigger.release_tag(&DrivingEvent::from_ref("refs/heads/v-branch")),
            Err(ReleaseError::NotReleaseEvent(_))
        ));
    }

    #[test]
    fn test_custom_pattern() {
        let trigger = ReleaseTrigger::new(r"^v\d+\.\d+\.\d+$").unwrap();
        assert!(trigger
            .release_tag(&DrivingEvent::from_ref("refs/tags/v1.0.0"))
            .is_ok());
        assert!(trigger
            .release_tag(&DrivingEvent::from_ref("refs/tags/v1.0.0-rc1"))
            .is_err());
        assert!(ReleaseTrigger::new("(").is_err());
    }
}
