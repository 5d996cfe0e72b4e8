//! Configuration for the discussion engine.
//!
//! Provides the [`EngineConfig`] struct consumed by
//! [`DiscussionOrchestrator`](crate::orchestrator::DiscussionOrchestrator).
//! Users construct it manually; no config-file parsing dependencies are
//! introduced.
//!
//! # Example
//!
//! ```rust
//! use concord::config::EngineConfig;
//!
//! // Defaults cover everything.
//! let config = EngineConfig::default();
//! assert_eq!(config.max_turns, 20);
//!
//! // Or override selectively.
//! let config = EngineConfig {
//!     consensus_threshold: 0.9,
//!     ..EngineConfig::default()
//! };
//! ```

use std::collections::HashMap;
use std::time::Duration;

use crate::clients::openrouter::default_alias_table;

/// Engine-wide settings, all with defaults.
///
/// `max_turns` is the process default; each discussion may carry its own
/// value (clamped to 3..=50 at creation time).
#[derive(Clone)]
pub struct EngineConfig {
    /// Default turn cap for new discussions.
    pub max_turns: u32,
    /// Confidence at or above which consensus counts as reached.
    pub consensus_threshold: f32,
    /// Deadline applied to each gateway call.
    pub per_call_timeout: Duration,
    /// Model used for topic analysis, role generation, speaker selection,
    /// consensus evaluation, and the final summary.
    pub meta_model_id: String,
    /// Panel cycled through when the caller supplies no model preferences.
    pub default_panel_model_ids: Vec<String>,
    /// User-friendly → canonical model id table, consulted by `normalize`.
    pub model_alias_table: HashMap<String, String>,
    /// Capacity of each subscriber's event queue; overflow drops the subscriber.
    pub subscriber_queue_bound: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_turns: 20,
            consensus_threshold: 0.85,
            per_call_timeout: Duration::from_secs(60),
            meta_model_id: "openai/gpt-5-chat".to_string(),
            default_panel_model_ids: vec![
                "anthropic/claude-sonnet-4.5".to_string(),
                "openai/gpt-5-chat".to_string(),
                "google/gemini-2.5-pro".to_string(),
                "deepseek/deepseek-v3.2-exp".to_string(),
            ],
            model_alias_table: default_alias_table(),
            subscriber_queue_bound: 64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = EngineConfig::default();
        assert_eq!(config.max_turns, 20);
        assert!((config.consensus_threshold - 0.85).abs() < f32::EPSILON);
        assert_eq!(config.per_call_timeout, Duration::from_secs(60));
        assert_eq!(config.subscriber_queue_bound, 64);
        assert_eq!(config.default_panel_model_ids.len(), 4);
        assert!(config.model_alias_table.contains_key("gpt-4"));
    }
}
