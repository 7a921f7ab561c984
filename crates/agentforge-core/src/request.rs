use crate::{ForgeError, ForgeResult};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// Maximum accepted length for a requirement text.
pub const MAX_REQUIREMENT_LEN: usize = 20_000;

#[allow(clippy::expect_used)]
fn project_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z][a-z0-9_]*$").expect("static regex"))
}

/// A build submission: one natural-language requirement plus metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRequest {
    /// The natural-language requirement to build an agent from.
    pub requirement: String,
    /// Optional explicit project name; `[a-z][a-z0-9_]*`. Derived from the
    /// requirement by the orchestrator stage when absent.
    pub project_name: Option<String>,
    pub user_id: Option<String>,
    pub user_name: Option<String>,
    /// 1–5, higher runs first. Defaults to 3.
    #[serde(default = "default_priority")]
    pub priority: u8,
    #[serde(default)]
    pub tags: Vec<String>,
}

fn default_priority() -> u8 {
    3
}

impl BuildRequest {
    /// Create a request with defaults for everything but the requirement.
    pub fn new(requirement: impl Into<String>) -> Self {
        Self {
            requirement: requirement.into(),
            project_name: None,
            user_id: None,
            user_name: None,
            priority: default_priority(),
            tags: Vec::new(),
        }
    }

    /// Set an explicit project name.
    pub fn with_project_name(mut self, name: impl Into<String>) -> Self {
        self.project_name = Some(name.into());
        self
    }

    /// Set the build priority.
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    /// Validate the submission contract. Never retried; surfaced to the
    /// caller as a validation error.
    pub fn validate(&self) -> ForgeResult<()> {
        if self.requirement.trim().is_empty() {
            return Err(ForgeError::Validation("requirement must not be empty".into()));
        }
        if self.requirement.len() > MAX_REQUIREMENT_LEN {
            return Err(ForgeError::Validation(format!(
                "requirement exceeds {MAX_REQUIREMENT_LEN} characters"
            )));
        }
        if let Some(name) = &self.project_name {
            if !project_name_re().is_match(name) {
                return Err(ForgeError::Validation(format!(
                    "project_name '{name}' must match [a-z][a-z0-9_]*"
                )));
            }
        }
        if !(1..=5).contains(&self.priority) {
            return Err(ForgeError::Validation(format!(
                "priority {} out of range 1-5",
                self.priority
            )));
        }
        Ok(())
    }
}

/// Derive a project name from free-form requirement text: lowercase words
/// joined by underscores, truncated to a few tokens.
pub fn derive_project_name(requirement: &str) -> String {
    let mut words: Vec<String> = requirement
        .split_whitespace()
        .map(|w| {
            w.chars()
                .filter(|c| c.is_ascii_alphanumeric())
                .collect::<String>()
                .to_ascii_lowercase()
        })
        .filter(|w| !w.is_empty())
        .take(4)
        .collect();
    if words.is_empty() {
        words.push("agent".to_string());
    }
    let mut name = words.join("_");
    if !name.starts_with(|c: char| c.is_ascii_lowercase()) {
        name.insert_str(0, "agent_");
    }
    name
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_request() {
        let request = BuildRequest::new("Weather assistant that fetches forecast by city")
            .with_project_name("weather_agent");
        assert!(request.validate().is_ok());
    }

    #[test]
    fn test_empty_requirement_rejected() {
        assert!(BuildRequest::new("   ").validate().is_err());
    }

    #[test]
    fn test_oversize_requirement_rejected() {
        let request = BuildRequest::new("x".repeat(MAX_REQUIREMENT_LEN + 1));
        assert!(request.validate().is_err());
    }

    #[test]
    fn test_bad_project_name_rejected() {
        for name in ["Weather", "1agent", "we-ather", "_agent", ""] {
            let request = BuildRequest::new("a requirement").with_project_name(name);
            assert!(request.validate().is_err(), "name {name:?} should fail");
        }
    }

    #[test]
    fn test_priority_range() {
        assert!(BuildRequest::new("r").with_priority(0).validate().is_err());
        assert!(BuildRequest::new("r").with_priority(6).validate().is_err());
        assert!(BuildRequest::new("r").with_priority(5).validate().is_ok());
    }

    #[test]
    fn test_derive_project_name() {
        assert_eq!(
            derive_project_name("Weather assistant that fetches forecast by city"),
            "weather_assistant_that_fetches"
        );
        assert_eq!(derive_project_name("42 GPT bots!"), "agent_42_gpt_bots");
        assert_eq!(derive_project_name("!!!"), "agent");
    }

    #[test]
    fn test_default_priority_on_deserialize() {
        let request: BuildRequest =
            serde_json::from_str("{\"requirement\":\"build me an agent\"}").unwrap();
        assert_eq!(request.priority, 3);
        assert!(request.validate().is_ok());
    }
}
