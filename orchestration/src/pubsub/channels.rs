//! Project-scoped channel namespacing.
//!
//! Every stream name is prefixed with `wave:` and carries the project tag
//! so that messages from one project never reach another project's
//! subscribers. The single cross-project name is `wave:system:global`.

use super::{StreamError, StreamResult};

/// Prefix for all WAVE stream names.
pub const WAVE_PREFIX: &str = "wave";

/// Builds stream channel names for one project.
#[derive(Debug, Clone)]
pub struct ChannelManager {
    project: String,
}

impl ChannelManager {
    /// Create a channel manager for a project.
    ///
    /// The project tag is trimmed and lowercased; an empty tag is rejected.
    pub fn new(project: &str) -> StreamResult<Self> {
        let project = project.trim().to_lowercase();
        if project.is_empty() {
            return Err(StreamError::InvalidChannel(
                "project name cannot be empty".to_string(),
            ));
        }
        Ok(Self { project })
    }

    /// The project tag this manager namespaces under.
    pub fn project(&self) -> &str {
        &self.project
    }

    /// Main signal channel for gate/story events.
    pub fn signals(&self) -> String {
        format!("{WAVE_PREFIX}:signals:{}", self.project)
    }

    /// Per-agent channel for direct communication.
    pub fn agent(&self, agent_id: &str) -> String {
        format!("{WAVE_PREFIX}:agent:{}:{agent_id}", self.project)
    }

    /// Per-gate channel for gate-specific events.
    pub fn gate(&self, gate_name: &str) -> String {
        format!("{WAVE_PREFIX}:gate:{}:{gate_name}", self.project)
    }

    /// System-wide channel (health, emergency stop).
    pub fn system(&self) -> String {
        format!("{WAVE_PREFIX}:system:{}", self.project)
    }

    /// Dead-letter queue for entries whose handler failed.
    pub fn dead_letter(&self) -> String {
        format!("{WAVE_PREFIX}:dlq:{}", self.project)
    }

    /// Global system channel — the only cross-project name.
    pub fn global_system() -> String {
        format!("{WAVE_PREFIX}:system:global")
    }

    /// All standard channels for this project.
    pub fn all_channels(&self) -> Vec<String> {
        vec![self.signals(), self.system(), self.dead_letter()]
    }

    /// Parse a channel name into its components.
    pub fn parse(channel: &str) -> ParsedChannel {
        let mut parts = channel.splitn(4, ':');
        ParsedChannel {
            raw: channel.to_string(),
            prefix: parts.next().map(String::from),
            kind: parts.next().map(String::from),
            project: parts.next().map(String::from),
            extra: parts.next().map(String::from),
        }
    }
}

/// Components of a parsed channel name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedChannel {
    pub raw: String,
    pub prefix: Option<String>,
    pub kind: Option<String>,
    pub project: Option<String>,
    pub extra: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_names() {
        let channels = ChannelManager::new("MyProject").unwrap();
        assert_eq!(channels.signals(), "wave:signals:myproject");
        assert_eq!(channels.agent("BE-1"), "wave:agent:myproject:BE-1");
        assert_eq!(channels.gate("gate-3"), "wave:gate:myproject:gate-3");
        assert_eq!(channels.system(), "wave:system:myproject");
        assert_eq!(channels.dead_letter(), "wave:dlq:myproject");
    }

    #[test]
    fn test_global_system_is_cross_project() {
        assert_eq!(ChannelManager::global_system(), "wave:system:global");
    }

    #[test]
    fn test_empty_project_rejected() {
        assert!(ChannelManager::new("").is_err());
        assert!(ChannelManager::new("   ").is_err());
    }

    #[test]
    fn test_all_channels() {
        let channels = ChannelManager::new("demo").unwrap();
        let all = channels.all_channels();
        assert_eq!(all.len(), 3);
        assert!(all.contains(&"wave:signals:demo".to_string()));
    }

    #[test]
    fn test_parse_roundtrip() {
        let parsed = ChannelManager::parse("wave:agent:demo:be-1");
        assert_eq!(parsed.prefix.as_deref(), Some("wave"));
        assert_eq!(parsed.kind.as_deref(), Some("agent"));
        assert_eq!(parsed.project.as_deref(), Some("demo"));
        assert_eq!(parsed.extra.as_deref(), Some("be-1"));
    }

    #[test]
    fn test_parse_short_name() {
        let parsed = ChannelManager::parse("wave:signals");
        assert_eq!(parsed.kind.as_deref(), Some("signals"));
        assert!(parsed.project.is_none());
        assert!(parsed.extra.is_none());
    }
}
