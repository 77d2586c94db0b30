//! Embedded templates: default config and agent system prompts.

/// Default `imaginate.toml` configuration.
pub(crate) const IMAGINATE_TOML: &str = include_str!("imaginate.toml");

/// System prompt of the coding agent.
pub(crate) const AGENT_PROMPT: &str = include_str!("agent_prompt.md");

/// System prompt of the fragment title generator.
pub(crate) const FRAGMENT_TITLE_PROMPT: &str = include_str!("title_prompt.md");

/// System prompt of the user-facing response generator.
pub(crate) const RESPONSE_PROMPT: &str = include_str!("response_prompt.md");
