use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Canonical model families the proxy routes between.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelFamily {
    Opus,
    Sonnet,
    Haiku,
}

impl ModelFamily {
    /// Map a raw model id (any alias a client might send) to a family.
    /// Unknown ids fall back to Sonnet.
    pub fn resolve(raw: &str) -> Self {
        let lower = raw.to_lowercase();
        if lower.contains("opus") {
            ModelFamily::Opus
        } else if lower.contains("haiku") {
            ModelFamily::Haiku
        } else {
            ModelFamily::Sonnet
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelFamily::Opus => "opus",
            ModelFamily::Sonnet => "sonnet",
            ModelFamily::Haiku => "haiku",
        }
    }

    /// Queue priority derived from the family.
    pub fn priority(&self) -> Priority {
        match self {
            ModelFamily::Opus => Priority::High,
            ModelFamily::Sonnet => Priority::Normal,
            ModelFamily::Haiku => Priority::Low,
        }
    }

    /// Default heartbeat window: maximum silence tolerated from a streaming
    /// worker before it is terminated.
    pub fn default_heartbeat(&self) -> Duration {
        match self {
            ModelFamily::Opus => Duration::from_secs(30 * 60),
            ModelFamily::Sonnet => Duration::from_secs(20 * 60),
            ModelFamily::Haiku => Duration::from_secs(10 * 60),
        }
    }

    pub fn all() -> [ModelFamily; 3] {
        [ModelFamily::Opus, ModelFamily::Sonnet, ModelFamily::Haiku]
    }
}

impl fmt::Display for ModelFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Dispatch priority within a source's queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Normal,
    Low,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_maps_aliases_to_families() {
        assert_eq!(ModelFamily::resolve("claude-code/opus"), ModelFamily::Opus);
        assert_eq!(
            ModelFamily::resolve("claude-3-5-haiku-20241022"),
            ModelFamily::Haiku
        );
        assert_eq!(ModelFamily::resolve("gpt-4o"), ModelFamily::Sonnet);
        assert_eq!(ModelFamily::resolve("OPUS-latest"), ModelFamily::Opus);
    }

    #[test]
    fn priority_ordering_is_high_first() {
        assert!(Priority::High < Priority::Normal);
        assert!(Priority::Normal < Priority::Low);
    }

    #[test]
    fn priority_follows_family() {
        assert_eq!(ModelFamily::Opus.priority(), Priority::High);
        assert_eq!(ModelFamily::Sonnet.priority(), Priority::Normal);
        assert_eq!(ModelFamily::Haiku.priority(), Priority::Low);
    }
}
